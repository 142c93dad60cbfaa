//! The research subgraph (spec §4.I.2): init_config -> search -> analyze ->
//! [synthesize] -> write. Grounded on
//! `original_source/api/app/agents/subagents/research.py`'s staged pipeline and
//! this crate's `circuit::CircuitBreaker` for the external search call.

use async_trait::async_trait;

use sa_domain::capability::ModelRole;
use sa_domain::config::SupervisorConfig;
use sa_domain::error::Result;
use sa_domain::tool::Message;
use sa_providers::{ChatRequest, LlmRouter};

use crate::circuit::CircuitBreakerRegistry;
use crate::events::{Event, EventBus};
use crate::guardrails::GuardrailChain;
use crate::memory::ResearchSource;
use crate::supervisor::{SubgraphBudget, SupervisorState};

/// A single search result, provider-agnostic.
#[derive(Debug, Clone)]
pub struct SearchResult {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

/// The external search backend the research subgraph calls through the
/// `sandbox:search` circuit breaker. Implemented by the gateway crate
/// (or a test double) and wrapped with a provider outside this crate.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(&self, query: &str) -> Result<Vec<SearchResult>>;
}

/// A `SearchProvider` returning canned results, used when no real search
/// backend is configured. Mirrors the teacher's "mock mode" fallback so
/// the pipeline still produces a plausible report shape in dev/test.
pub struct MockSearchProvider;

#[async_trait]
impl SearchProvider for MockSearchProvider {
    async fn search(&self, query: &str) -> Result<Vec<SearchResult>> {
        Ok(vec![SearchResult {
            title: format!("Overview: {query}"),
            url: "https://example.com/overview".to_string(),
            snippet: format!("A general overview related to '{query}'."),
        }])
    }
}

/// Either depth the caller can request (spec's `Config` event fields).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResearchDepth {
    Quick,
    Standard,
    Deep,
}

impl ResearchDepth {
    fn as_str(self) -> &'static str {
        match self {
            ResearchDepth::Quick => "quick",
            ResearchDepth::Standard => "standard",
            ResearchDepth::Deep => "deep",
        }
    }

    fn source_count(self) -> usize {
        match self {
            ResearchDepth::Quick => 3,
            ResearchDepth::Standard => 5,
            ResearchDepth::Deep => 8,
        }
    }

    /// QUICK skips the `synthesize` stage and goes straight to `write`;
    /// STANDARD and DEEP both synthesize, DEEP over a larger source set.
    fn synthesizes(self) -> bool {
        !matches!(self, ResearchDepth::Quick)
    }
}

/// Which per-scenario prompt set `init_config` selects (spec §4.I). Each
/// scenario biases the `analyze`/`synthesize`/`write` prompts toward a
/// different kind of source material and report structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResearchScenario {
    Academic,
    Market,
    Technical,
    News,
}

impl ResearchScenario {
    fn as_str(self) -> &'static str {
        match self {
            ResearchScenario::Academic => "academic",
            ResearchScenario::Market => "market",
            ResearchScenario::Technical => "technical",
            ResearchScenario::News => "news",
        }
    }

    /// Best-effort inference from the user's query when the caller
    /// doesn't pin a scenario explicitly, used by `run_research_subgraph`
    /// when `scenario` is `None`.
    fn infer(query: &str) -> Self {
        let lower = query.to_lowercase();
        if lower.contains("paper") || lower.contains("study") || lower.contains("research on") {
            ResearchScenario::Academic
        } else if lower.contains("market")
            || lower.contains("competitor")
            || lower.contains("pricing")
            || lower.contains("industry")
        {
            ResearchScenario::Market
        } else if lower.contains("latest")
            || lower.contains("news")
            || lower.contains("recent")
            || lower.contains("today")
        {
            ResearchScenario::News
        } else {
            ResearchScenario::Technical
        }
    }

    fn analyze_system_prompt(self) -> &'static str {
        match self {
            ResearchScenario::Academic => "Analyze the following sources as academic or scientific material. Extract methodology, findings, and any stated limitations. Be precise and avoid overstating confidence.",
            ResearchScenario::Market => "Analyze the following sources for market intelligence: players, pricing, positioning, and trends relevant to the question. Be concise and factual.",
            ResearchScenario::Technical => "Analyze the following technical sources and extract the key facts, APIs, or mechanisms relevant to the user's question. Be concise and precise.",
            ResearchScenario::News => "Analyze the following sources as recent news coverage. Extract the key facts, note publication recency, and flag any conflicting reports.",
        }
    }

    fn write_system_prompt(self) -> &'static str {
        match self {
            ResearchScenario::Academic => "Write a clear, well-structured answer in the style of a literature review. Cite sources by title where relevant and note any limitations in the underlying evidence.",
            ResearchScenario::Market => "Write a clear, well-structured market brief answering the user's question. Cite sources by title where relevant.",
            ResearchScenario::Technical => "Write a clear, well-structured technical answer to the user's question using the findings provided. Cite sources by title where relevant.",
            ResearchScenario::News => "Write a clear, well-structured news summary answering the user's question, noting how recent the coverage is. Cite sources by title where relevant.",
        }
    }
}

/// Runs the research subgraph's staged pipeline in place on `state`,
/// checking `budget` between stages and returning early with whatever
/// findings were gathered so far once it expires.
#[allow(clippy::too_many_arguments)]
pub async fn run_research_subgraph(
    state: &mut SupervisorState,
    router: &LlmRouter,
    config: &SupervisorConfig,
    guardrails: &GuardrailChain,
    circuits: &CircuitBreakerRegistry,
    search: &dyn SearchProvider,
    depth: ResearchDepth,
    scenario: Option<ResearchScenario>,
    bus: &EventBus,
    budget: &SubgraphBudget,
) -> Result<()> {
    let query = state.delegated_task.clone().unwrap_or_else(|| state.query.clone());
    let scenario = scenario.unwrap_or_else(|| ResearchScenario::infer(&query));

    bus.emit(Event::Config {
        depth: Some(depth.as_str().to_string()),
        scenario: Some(scenario.as_str().to_string()),
    });

    bus.emit(Event::stage_running("search", "searching for sources"));
    let breaker = circuits.get("sandbox:search");
    let results = match breaker
        .call(|| async { search.search(&query).await })
        .await
    {
        Ok(results) => results,
        Err(e) => {
            tracing::warn!(error = %e, "search provider unavailable, using mock fallback");
            MockSearchProvider.search(&query).await.unwrap_or_default()
        }
    };
    let results: Vec<SearchResult> = results.into_iter().take(depth.source_count()).collect();

    for result in &results {
        bus.emit(Event::Source {
            title: result.title.clone(),
            url: result.url.clone(),
            snippet: result.snippet.clone(),
            relevance_score: None,
            timestamp: chrono::Utc::now().timestamp_millis(),
        });
        state.shared_memory.research_sources.push(ResearchSource {
            title: result.title.clone(),
            url: result.url.clone(),
            snippet: result.snippet.clone(),
        });
    }
    bus.emit(Event::stage_completed("search", "searching for sources"));

    if budget.is_expired() {
        return Ok(());
    }
    bus.emit(Event::stage_running("analyze", "analyzing sources"));
    let sources_text = results
        .iter()
        .map(|r| format!("- {} ({}): {}", r.title, r.url, r.snippet))
        .collect::<Vec<_>>()
        .join("\n");
    let analyze_req = ChatRequest {
        messages: vec![
            Message::system(scenario.analyze_system_prompt()),
            Message::user(format!("Question: {query}\n\nSources:\n{sources_text}")),
        ],
        tools: vec![],
        temperature: Some(0.2),
        max_tokens: Some(1024),
        json_mode: false,
        model: None,
    };
    let analysis = router.chat_for_role(ModelRole::Executor, analyze_req).await?;
    state.shared_memory.research_findings.push(analysis.content.clone());
    bus.emit(Event::stage_completed("analyze", "analyzing sources"));

    if budget.is_expired() {
        return Ok(());
    }

    if depth.synthesizes() && results.len() > 1 {
        bus.emit(Event::stage_running("synthesize", "synthesizing findings across sources"));
        let synth_req = ChatRequest {
            messages: vec![
                Message::system("Synthesize the findings below into a single coherent narrative, noting any disagreements between sources."),
                Message::user(analysis.content.clone()),
            ],
            tools: vec![],
            temperature: Some(0.2),
            max_tokens: Some(1024),
            json_mode: false,
            model: None,
        };
        let synthesis = router.chat_for_role(ModelRole::Executor, synth_req).await?;
        state.shared_memory.research_findings.push(synthesis.content);
        bus.emit(Event::stage_completed("synthesize", "synthesizing findings across sources"));
    }

    if budget.is_expired() {
        return Ok(());
    }

    bus.emit(Event::stage_running("write", "writing the final report"));
    let findings = state.shared_memory.research_findings.join("\n\n");
    let write_req = ChatRequest {
        messages: vec![
            Message::system("Write a clear, well-structured answer to the user's question using the findings provided. Cite sources by title where relevant."),
            Message::user(format!("Question: {query}\n\nFindings:\n{findings}")),
        ],
        tools: vec![],
        temperature: Some(0.3),
        max_tokens: Some(2048),
        json_mode: false,
        model: None,
    };
    let report = router.chat_for_role(ModelRole::Executor, write_req).await?;

    let verdict = guardrails.output.scan(&report.content);
    let output = if verdict.is_blocked() {
        "I can't share that response.".to_string()
    } else if verdict.is_flagged() {
        verdict.sanitized_content.unwrap_or(report.content)
    } else {
        report.content
    };

    for chunk in output.split_inclusive(' ') {
        bus.emit(Event::Token { content: chunk.to_string() });
    }
    state.final_response = Some(output);
    bus.emit(Event::stage_completed("write", "writing the final report"));

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_search_provider_returns_a_result() {
        let results = MockSearchProvider.search("rust async runtimes").await.unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].title.contains("rust async runtimes"));
    }

    #[test]
    fn research_depth_source_counts() {
        assert_eq!(ResearchDepth::Quick.source_count(), 3);
        assert_eq!(ResearchDepth::Deep.source_count(), 8);
    }

    #[test]
    fn only_quick_skips_synthesize() {
        assert!(!ResearchDepth::Quick.synthesizes());
        assert!(ResearchDepth::Standard.synthesizes());
        assert!(ResearchDepth::Deep.synthesizes());
    }
}
