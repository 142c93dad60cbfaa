//! Input scanner: flags jailbreak / prompt-injection attempts before a
//! user message reaches the router.

use regex::RegexSet;

use super::ScanVerdict;

pub struct InputScanner {
    patterns: RegexSet,
    sources: Vec<String>,
}

impl InputScanner {
    pub fn new(patterns: &[String]) -> Self {
        let set = RegexSet::new(patterns).unwrap_or_else(|e| {
            tracing::error!(error = %e, "input guardrail patterns failed to compile; scanner disabled");
            RegexSet::empty()
        });
        Self {
            patterns: set,
            sources: patterns.to_vec(),
        }
    }

    pub fn scan(&self, text: &str) -> ScanVerdict {
        let matches: Vec<_> = self.patterns.matches(text).into_iter().collect();
        if let Some(&idx) = matches.first() {
            ScanVerdict::block(
                format!("input matched guardrail pattern: {}", self.sources[idx]),
                self.sources[idx].clone(),
            )
        } else {
            ScanVerdict::allow()
        }
    }
}
