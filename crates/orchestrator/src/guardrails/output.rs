//! Output scanner: blocks harmful content and flags+sanitizes
//! lower-severity leaks in a completed assistant response (spec §4.G:
//! block -> refusal, flag -> pass sanitized content through, allow ->
//! pass through unchanged). Per the documented policy decision (see
//! `DESIGN.md`, Open Question a), this runs once on the assembled final
//! text rather than on individual streamed tokens.

use regex::{Regex, RegexSet};

use super::ScanVerdict;

pub struct OutputScanner {
    block_patterns: RegexSet,
    block_sources: Vec<String>,
    flag_patterns: Vec<Regex>,
    flag_sources: Vec<String>,
}

impl OutputScanner {
    pub fn new(block_patterns: &[String], flag_patterns: &[String]) -> Self {
        let block_set = RegexSet::new(block_patterns).unwrap_or_else(|e| {
            tracing::error!(error = %e, "output guardrail block patterns failed to compile; scanner disabled");
            RegexSet::empty()
        });
        let flag_regexes = flag_patterns
            .iter()
            .filter_map(|p| match Regex::new(p) {
                Ok(re) => Some(re),
                Err(e) => {
                    tracing::error!(error = %e, pattern = %p, "output guardrail flag pattern failed to compile; skipped");
                    None
                }
            })
            .collect();
        Self {
            block_patterns: block_set,
            block_sources: block_patterns.to_vec(),
            flag_patterns: flag_regexes,
            flag_sources: flag_patterns.to_vec(),
        }
    }

    /// Scans assembled output text. Block patterns take priority over
    /// flag patterns: a response that is both harmful and leaking a
    /// secret is blocked outright, not sanitized.
    pub fn scan(&self, text: &str) -> ScanVerdict {
        let block_matches: Vec<_> = self.block_patterns.matches(text).into_iter().collect();
        if let Some(&idx) = block_matches.first() {
            return ScanVerdict::block(
                format!("output matched guardrail pattern: {}", self.block_sources[idx]),
                self.block_sources[idx].clone(),
            );
        }

        for (idx, pattern) in self.flag_patterns.iter().enumerate() {
            if pattern.is_match(text) {
                let sanitized = pattern.replace_all(text, "[redacted]").into_owned();
                return ScanVerdict::flag(
                    format!("output matched flag pattern: {}", self.flag_sources[idx]),
                    self.flag_sources[idx].clone(),
                    0.8,
                    sanitized,
                );
            }
        }

        ScanVerdict::allow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scanner() -> OutputScanner {
        OutputScanner::new(
            &[r"(?i)how to (build|make) a (bomb|weapon)".into()],
            &[r"sk-[A-Za-z0-9]{16,}".into()],
        )
    }

    #[test]
    fn blocks_harmful_instructions() {
        let verdict = scanner().scan("Here is how to build a bomb: ...");
        assert!(verdict.is_blocked());
        assert!(!verdict.is_flagged());
        assert!(verdict.sanitized_content.is_none());
    }

    #[test]
    fn allows_safe_response() {
        let verdict = scanner().scan("Here is how to build a birdhouse: ...");
        assert_eq!(verdict, ScanVerdict::allow());
    }

    #[test]
    fn flags_and_sanitizes_leaked_secret() {
        let verdict = scanner().scan("Sure, here's my key: sk-abcdefghijklmnopqrstuvwxyz, use it wisely.");
        assert!(!verdict.is_blocked());
        assert!(verdict.passed, "a flagged verdict still passes content through");
        assert!(verdict.is_flagged());
        let sanitized = verdict.sanitized_content.expect("flag verdict carries sanitized content");
        assert!(sanitized.contains("[redacted]"));
        assert!(!sanitized.contains("sk-abcdefghijklmnopqrstuvwxyz"));
    }

    #[test]
    fn block_takes_priority_over_flag() {
        let scanner = OutputScanner::new(
            &[r"(?i)bomb".into()],
            &[r"sk-[A-Za-z0-9]{16,}".into()],
        );
        let verdict = scanner.scan("bomb instructions plus a leaked key sk-abcdefghijklmnopqrstuvwxyz");
        assert!(verdict.is_blocked());
        assert!(!verdict.is_flagged());
    }
}
