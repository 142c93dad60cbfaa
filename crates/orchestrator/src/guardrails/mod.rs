//! Guardrail chain: input scanning (jailbreak/prompt-injection), output
//! scanning (harmful content), and tool-call scanning (URL allow rules,
//! shell deny patterns). Each scanner is pattern-based and cheap enough
//! to run synchronously on the hot path.

mod input;
mod output;
mod tool;

pub use input::InputScanner;
pub use output::OutputScanner;
pub use tool::{ToolScanner, UrlVerdict};

use sa_domain::config::GuardrailsConfig;

/// Outcome of running a scanner over a piece of text or a tool call
/// (spec §4.G / §6): `passed`/`blocked`/`flagged` plus the matched
/// `violations`, a human-readable `reason`, a `confidence` score, and —
/// for a flagged verdict — `sanitized_content` to pass through instead
/// of the original text.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ScanVerdict {
    pub passed: bool,
    pub blocked: bool,
    pub flagged: bool,
    pub violations: Vec<String>,
    pub reason: String,
    pub confidence: f64,
    pub sanitized_content: Option<String>,
}

impl ScanVerdict {
    pub fn allow() -> Self {
        Self {
            passed: true,
            ..Self::default()
        }
    }

    pub fn block(reason: impl Into<String>, violation: impl Into<String>) -> Self {
        Self {
            passed: false,
            blocked: true,
            violations: vec![violation.into()],
            reason: reason.into(),
            confidence: 1.0,
            ..Self::default()
        }
    }

    /// A flagged verdict still passes the content through, sanitized.
    pub fn flag(reason: impl Into<String>, violation: impl Into<String>, confidence: f64, sanitized_content: impl Into<String>) -> Self {
        Self {
            passed: true,
            flagged: true,
            violations: vec![violation.into()],
            reason: reason.into(),
            confidence,
            sanitized_content: Some(sanitized_content.into()),
        }
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked
    }

    pub fn is_flagged(&self) -> bool {
        self.flagged
    }
}

/// The three scanners wired together (spec §4.G): input runs once before
/// routing, output once on the assembled final response, tool on every
/// tool invocation's arguments.
pub struct GuardrailChain {
    pub input: InputScanner,
    pub output: OutputScanner,
    pub tool: ToolScanner,
}

impl GuardrailChain {
    pub fn new(config: &GuardrailsConfig) -> Self {
        Self {
            input: InputScanner::new(&config.jailbreak_patterns),
            output: OutputScanner::new(&config.harmful_patterns, &config.flagged_patterns),
            tool: ToolScanner::new(&config.shell_deny_patterns),
        }
    }
}
