//! Shared cross-agent context (spec §4.H): a typed bundle of whatever one
//! agent produced that a handed-off-to agent might need — research
//! findings/sources, generated code, a writing draft, data viz, and the
//! handoff trail itself.

/// One source cited by the research agent.
#[derive(Debug, Clone)]
pub struct ResearchSource {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

/// Code the task agent produced, plus its last execution result if run.
#[derive(Debug, Clone, Default)]
pub struct CodeArtifact {
    pub language: String,
    pub code: String,
    pub execution_output: Option<String>,
}

/// In-progress writing state (used by the research agent's `write` stage).
#[derive(Debug, Clone, Default)]
pub struct WritingState {
    pub outline: String,
    pub draft: String,
}

/// A chart or table the data agent produced.
#[derive(Debug, Clone)]
pub struct DataVisualization {
    pub kind: String,
    pub description: String,
}

/// One entry in the handoff trail, rendered into the prompt so the
/// receiving agent understands why control was passed to it.
#[derive(Debug, Clone)]
pub struct HandoffTrailEntry {
    pub source_agent: String,
    pub target_agent: String,
    pub task_description: String,
}

/// Cross-agent shared context. Every subgraph reads and appends to the
/// same instance via `SupervisorState::shared_memory`.
#[derive(Debug, Clone, Default)]
pub struct SharedContext {
    pub research_findings: Vec<String>,
    pub research_sources: Vec<ResearchSource>,
    pub code: Option<CodeArtifact>,
    pub writing: Option<WritingState>,
    pub data_analysis: Vec<String>,
    pub visualizations: Vec<DataVisualization>,
    pub handoff_history: Vec<HandoffTrailEntry>,
    pub additional_context: String,
}

/// Identifies a rendered section for the purposes of the priority-based
/// drop pass in `format_for_prompt`. Variants are declared in render
/// order; `DROP_ORDER` below controls which get dropped first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SectionKind {
    ResearchFindings,
    Sources,
    Code,
    Writing,
    DataAnalysis,
    Visualizations,
    HandoffHistory,
    AdditionalContext,
}

/// Sections dropped first when the budget can't be met even after
/// per-section capping, least important first. `HandoffHistory` is last:
/// it's what tells a handed-off-to agent why control was passed to it,
/// so it survives longer than bulkier, more skimmable sections like
/// research findings.
const DROP_ORDER: &[SectionKind] = &[
    SectionKind::Visualizations,
    SectionKind::DataAnalysis,
    SectionKind::Sources,
    SectionKind::ResearchFindings,
    SectionKind::Writing,
    SectionKind::Code,
    SectionKind::AdditionalContext,
    SectionKind::HandoffHistory,
];

const TRUNCATION_MARKER: &str = "\n...(truncated)";

/// Truncates `body` to at most `cap` bytes at a char boundary, appending
/// a marker when truncation actually occurs.
fn cap_section(body: String, cap: usize) -> String {
    if body.len() <= cap {
        return body;
    }
    let target = cap.saturating_sub(TRUNCATION_MARKER.len());
    let mut boundary = target;
    while boundary > 0 && !body.is_char_boundary(boundary) {
        boundary -= 1;
    }
    let mut truncated = body[..boundary].to_string();
    truncated.push_str(TRUNCATION_MARKER);
    truncated
}

impl SharedContext {
    /// Renders the bundle into a prompt-injectable section, in a fixed
    /// section order. Each present section is first capped to its own
    /// equal share of `max_length` so one oversized section (e.g. a long
    /// `research_findings` dump) can't silently consume the whole budget
    /// and erase everything listed after it. If the result is still over
    /// budget, whole sections are dropped per `DROP_ORDER` (least
    /// important first) until it fits.
    pub fn format_for_prompt(&self, max_length: usize) -> String {
        let mut sections: Vec<(SectionKind, String)> = Vec::new();

        if !self.research_findings.is_empty() {
            sections.push((
                SectionKind::ResearchFindings,
                format!("## Research Findings\n{}", self.research_findings.join("\n")),
            ));
        }
        if !self.research_sources.is_empty() {
            let rendered = self
                .research_sources
                .iter()
                .map(|s| format!("- [{}]({}): {}", s.title, s.url, s.snippet))
                .collect::<Vec<_>>()
                .join("\n");
            sections.push((SectionKind::Sources, format!("## Sources\n{rendered}")));
        }
        if let Some(code) = &self.code {
            let mut section = format!("## Generated Code ({})\n{}", code.language, code.code);
            if let Some(output) = &code.execution_output {
                section.push_str(&format!("\n### Execution Output\n{output}"));
            }
            sections.push((SectionKind::Code, section));
        }
        if let Some(writing) = &self.writing {
            sections.push((
                SectionKind::Writing,
                format!(
                    "## Writing\n### Outline\n{}\n### Draft\n{}",
                    writing.outline, writing.draft
                ),
            ));
        }
        if !self.data_analysis.is_empty() {
            sections.push((
                SectionKind::DataAnalysis,
                format!("## Data Analysis\n{}", self.data_analysis.join("\n")),
            ));
        }
        if !self.visualizations.is_empty() {
            let rendered = self
                .visualizations
                .iter()
                .map(|v| format!("- {} ({})", v.description, v.kind))
                .collect::<Vec<_>>()
                .join("\n");
            sections.push((SectionKind::Visualizations, format!("## Visualizations\n{rendered}")));
        }
        if !self.handoff_history.is_empty() {
            let rendered = self
                .handoff_history
                .iter()
                .map(|h| format!("- {} -> {}: {}", h.source_agent, h.target_agent, h.task_description))
                .collect::<Vec<_>>()
                .join("\n");
            sections.push((SectionKind::HandoffHistory, format!("## Handoff History\n{rendered}")));
        }
        if !self.additional_context.is_empty() {
            sections.push((
                SectionKind::AdditionalContext,
                format!("## Additional Context\n{}", self.additional_context),
            ));
        }

        if sections.is_empty() {
            return String::new();
        }

        let per_section_cap = (max_length / sections.len()).max(1);
        for (_, body) in sections.iter_mut() {
            *body = cap_section(std::mem::take(body), per_section_cap);
        }

        let mut present = sections;
        let mut rendered = render_sections(&present);
        for kind in DROP_ORDER {
            if rendered.len() <= max_length || present.len() <= 1 {
                break;
            }
            present.retain(|(pk, _)| pk != kind);
            rendered = render_sections(&present);
        }

        if rendered.len() > max_length {
            cap_section(rendered, max_length)
        } else {
            rendered
        }
    }
}

fn render_sections(sections: &[(SectionKind, String)]) -> String {
    sections
        .iter()
        .map(|(_, s)| s.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_context_renders_to_empty_string() {
        assert_eq!(SharedContext::default().format_for_prompt(4000), "");
    }

    #[test]
    fn sections_appear_in_fixed_order() {
        let mut ctx = SharedContext::default();
        ctx.additional_context = "free-form note".into();
        ctx.research_findings = vec!["quantum computing is scalable by 2030".into()];
        let rendered = ctx.format_for_prompt(4000);
        let findings_pos = rendered.find("Research Findings").unwrap();
        let extra_pos = rendered.find("Additional Context").unwrap();
        assert!(findings_pos < extra_pos);
    }

    #[test]
    fn truncates_to_max_length() {
        let mut ctx = SharedContext::default();
        ctx.additional_context = "x".repeat(10_000);
        let rendered = ctx.format_for_prompt(100);
        assert!(rendered.len() <= 100 + "\n...(truncated)".len());
        assert!(rendered.ends_with("(truncated)"));
    }

    #[test]
    fn an_oversized_early_section_cannot_erase_later_sections() {
        let mut ctx = SharedContext::default();
        ctx.research_findings = vec!["a".repeat(10_000)];
        ctx.handoff_history.push(HandoffTrailEntry {
            source_agent: "research".into(),
            target_agent: "task".into(),
            task_description: "continue with the code changes".into(),
        });
        let rendered = ctx.format_for_prompt(500);
        assert!(
            rendered.contains("Handoff History"),
            "a bulky earlier section must not crowd out the handoff trail"
        );
        assert!(rendered.contains("continue with the code changes"));
    }

    #[test]
    fn visualizations_are_dropped_before_handoff_history_under_a_tight_budget() {
        let mut ctx = SharedContext::default();
        ctx.research_findings = vec!["a".repeat(5_000)];
        ctx.research_sources.push(ResearchSource {
            title: "b".repeat(5_000),
            url: "https://example.com".into(),
            snippet: "c".repeat(5_000),
        });
        ctx.data_analysis = vec!["d".repeat(5_000)];
        ctx.visualizations.push(DataVisualization {
            kind: "e".repeat(5_000),
            description: "f".repeat(5_000),
        });
        ctx.handoff_history.push(HandoffTrailEntry {
            source_agent: "research".into(),
            target_agent: "task".into(),
            task_description: "please finish the implementation".into(),
        });

        let rendered = ctx.format_for_prompt(200);
        assert!(
            rendered.contains("Handoff History"),
            "the handoff trail should still be present under a tight budget"
        );
        assert!(
            !rendered.contains("Visualizations"),
            "visualizations are the lowest-priority section and should drop first"
        );
    }
}
