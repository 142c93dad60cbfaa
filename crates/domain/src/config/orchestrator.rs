use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Orchestrator (supervisor graph / subgraphs / sandbox / HITL)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Top-level configuration for the multi-agent orchestration runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub circuit_breakers: CircuitBreakersConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub hitl: HitlConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub memory: AgentMemoryConfig,
    #[serde(default)]
    pub guardrails: GuardrailsConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            circuit_breakers: CircuitBreakersConfig::default(),
            sandbox: SandboxConfig::default(),
            hitl: HitlConfig::default(),
            redis: RedisConfig::default(),
            supervisor: SupervisorConfig::default(),
            memory: AgentMemoryConfig::default(),
            guardrails: GuardrailsConfig::default(),
        }
    }
}

/// A single named circuit breaker's thresholds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CircuitBreakerSettings {
    #[serde(default = "d_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "d_recovery_timeout_ms")]
    pub recovery_timeout_ms: u64,
    #[serde(default = "d_success_threshold")]
    pub success_threshold: u32,
    #[serde(default = "d_half_open_max_concurrent")]
    pub half_open_max_concurrent: u32,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: d_failure_threshold(),
            recovery_timeout_ms: d_recovery_timeout_ms(),
            success_threshold: d_success_threshold(),
            half_open_max_concurrent: d_half_open_max_concurrent(),
        }
    }
}

/// Per-service circuit breaker defaults. `llm`/`web_search` share one shape;
/// `sandbox` trips faster and recovers slower per spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakersConfig {
    #[serde(default = "d_default_breaker")]
    pub default: CircuitBreakerSettings,
    #[serde(default = "d_sandbox_breaker")]
    pub sandbox: CircuitBreakerSettings,
}

impl Default for CircuitBreakersConfig {
    fn default() -> Self {
        Self {
            default: d_default_breaker(),
            sandbox: d_sandbox_breaker(),
        }
    }
}

fn d_default_breaker() -> CircuitBreakerSettings {
    CircuitBreakerSettings::default()
}

fn d_sandbox_breaker() -> CircuitBreakerSettings {
    CircuitBreakerSettings {
        failure_threshold: 3,
        recovery_timeout_ms: 60_000,
        success_threshold: 1,
        half_open_max_concurrent: 1,
    }
}

/// Sandbox session manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    #[serde(default = "d_session_timeout_ms")]
    pub session_timeout_ms: u64,
    #[serde(default = "d_cleanup_interval_ms")]
    pub cleanup_interval_ms: u64,
    #[serde(default = "d_health_check_timeout_ms")]
    pub health_check_timeout_ms: u64,
    #[serde(default = "d_stream_wait_ms")]
    pub stream_wait_ms: u64,
    /// Minimum gap (ms) to hold either side of a clipboard paste in
    /// `type_via_clipboard`.
    #[serde(default = "d_clipboard_gap_ms")]
    pub clipboard_gap_ms: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            session_timeout_ms: d_session_timeout_ms(),
            cleanup_interval_ms: d_cleanup_interval_ms(),
            health_check_timeout_ms: d_health_check_timeout_ms(),
            stream_wait_ms: d_stream_wait_ms(),
            clipboard_gap_ms: d_clipboard_gap_ms(),
        }
    }
}

/// HITL interrupt manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HitlConfig {
    #[serde(default = "d_approval_timeout_sec")]
    pub approval_timeout_sec: u64,
    #[serde(default = "d_decision_timeout_sec")]
    pub decision_timeout_sec: u64,
    #[serde(default = "d_ttl_buffer_sec")]
    pub ttl_buffer_sec: u64,
}

impl Default for HitlConfig {
    fn default() -> Self {
        Self {
            approval_timeout_sec: d_approval_timeout_sec(),
            decision_timeout_sec: d_decision_timeout_sec(),
            ttl_buffer_sec: d_ttl_buffer_sec(),
        }
    }
}

/// Redis connection settings for the HITL rendezvous and research bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "d_redis_url")]
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self { url: d_redis_url() }
    }
}

/// Supervisor graph (router + handoff + subgraph timeouts).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default = "d_max_handoffs")]
    pub max_handoffs: u32,
    #[serde(default = "d_subgraph_timeout_sec")]
    pub subgraph_timeout_sec: u64,
    #[serde(default = "d_app_builder_timeout_sec")]
    pub app_builder_timeout_sec: u64,
    #[serde(default = "d_routing_confidence_threshold")]
    pub routing_confidence_threshold: f64,
    #[serde(default = "d_max_iterations")]
    pub max_iterations: u32,
    #[serde(default = "d_tool_concurrency")]
    pub tool_concurrency: usize,
    #[serde(default = "d_max_content_length")]
    pub max_content_length: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_handoffs: d_max_handoffs(),
            subgraph_timeout_sec: d_subgraph_timeout_sec(),
            app_builder_timeout_sec: d_app_builder_timeout_sec(),
            routing_confidence_threshold: d_routing_confidence_threshold(),
            max_iterations: d_max_iterations(),
            tool_concurrency: d_tool_concurrency(),
            max_content_length: d_max_content_length(),
        }
    }
}

/// Windowed conversation memory + context compression thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMemoryConfig {
    #[serde(default = "d_max_messages")]
    pub max_messages: usize,
    #[serde(default = "d_preserve_recent")]
    pub preserve_recent: usize,
    #[serde(default = "d_true")]
    pub preserve_system: bool,
    #[serde(default = "d_compression_threshold_tokens")]
    pub compression_threshold_tokens: usize,
    #[serde(default = "d_shared_context_max_length")]
    pub shared_context_max_length: usize,
}

impl Default for AgentMemoryConfig {
    fn default() -> Self {
        Self {
            max_messages: d_max_messages(),
            preserve_recent: d_preserve_recent(),
            preserve_system: true,
            compression_threshold_tokens: d_compression_threshold_tokens(),
            shared_context_max_length: d_shared_context_max_length(),
        }
    }
}

/// Guardrail chain: deny patterns and private network ranges.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardrailsConfig {
    #[serde(default = "d_shell_deny_patterns")]
    pub shell_deny_patterns: Vec<String>,
    #[serde(default = "d_jailbreak_patterns")]
    pub jailbreak_patterns: Vec<String>,
    #[serde(default = "d_harmful_patterns")]
    pub harmful_patterns: Vec<String>,
    /// Lower-severity output patterns that get redacted in place rather
    /// than blocking the whole response (spec §4.G's "flag" verdict).
    #[serde(default = "d_flagged_patterns")]
    pub flagged_patterns: Vec<String>,
}

impl Default for GuardrailsConfig {
    fn default() -> Self {
        Self {
            shell_deny_patterns: d_shell_deny_patterns(),
            jailbreak_patterns: d_jailbreak_patterns(),
            harmful_patterns: d_harmful_patterns(),
            flagged_patterns: d_flagged_patterns(),
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_failure_threshold() -> u32 {
    5
}
fn d_recovery_timeout_ms() -> u64 {
    30_000
}
fn d_success_threshold() -> u32 {
    2
}
fn d_half_open_max_concurrent() -> u32 {
    1
}
fn d_session_timeout_ms() -> u64 {
    30 * 60 * 1000
}
fn d_cleanup_interval_ms() -> u64 {
    60_000
}
fn d_health_check_timeout_ms() -> u64 {
    5_000
}
fn d_stream_wait_ms() -> u64 {
    2_000
}
fn d_clipboard_gap_ms() -> u64 {
    100
}
fn d_approval_timeout_sec() -> u64 {
    120
}
fn d_decision_timeout_sec() -> u64 {
    120
}
fn d_ttl_buffer_sec() -> u64 {
    30
}
fn d_redis_url() -> String {
    "redis://127.0.0.1:6379".into()
}
fn d_max_handoffs() -> u32 {
    3
}
fn d_subgraph_timeout_sec() -> u64 {
    300
}
fn d_app_builder_timeout_sec() -> u64 {
    600
}
fn d_routing_confidence_threshold() -> f64 {
    0.5
}
fn d_max_iterations() -> u32 {
    20
}
fn d_tool_concurrency() -> usize {
    4
}
fn d_max_content_length() -> usize {
    500
}
fn d_max_messages() -> usize {
    100
}
fn d_preserve_recent() -> usize {
    10
}
fn d_compression_threshold_tokens() -> usize {
    60_000
}
fn d_shared_context_max_length() -> usize {
    4_000
}
fn d_true() -> bool {
    true
}

fn d_shell_deny_patterns() -> Vec<String> {
    vec![
        r"rm\s+-rf\s+/".into(),
        r"rm\s+-rf\s+~".into(),
        r":\(\)\s*\{\s*:\|\s*:\s*&\s*\}\s*;\s*:".into(),
        r"curl\s+.*\|\s*(bash|sh)".into(),
        r"wget\s+.*\|\s*(bash|sh)".into(),
        r"mkfs\.".into(),
        r"dd\s+if=/dev/".into(),
    ]
}

fn d_jailbreak_patterns() -> Vec<String> {
    vec![
        r"(?i)ignore\s+(all\s+)?previous\s+instructions".into(),
        r"(?i)reveal\s+(your\s+)?system\s+prompt".into(),
        r"(?i)developer\s+mode".into(),
        r"(?i)\bDAN\b".into(),
        r"(?i)bypass\s+(the\s+)?filters?".into(),
    ]
}

fn d_harmful_patterns() -> Vec<String> {
    vec![
        r"(?i)how to (build|make) a (bomb|weapon)".into(),
        r"(?i)write (a|some) (malware|ransomware|virus)".into(),
    ]
}

fn d_flagged_patterns() -> Vec<String> {
    vec![
        // API-key-shaped secrets leaking into a response get redacted
        // rather than blocking the whole turn.
        r"sk-[A-Za-z0-9]{16,}".into(),
        r"(?i)AKIA[A-Z0-9]{16}".into(),
    ]
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sandbox_breaker_trips_faster_than_default() {
        let cfg = CircuitBreakersConfig::default();
        assert!(cfg.sandbox.failure_threshold < cfg.default.failure_threshold);
        assert!(cfg.sandbox.recovery_timeout_ms > cfg.default.recovery_timeout_ms);
        assert_eq!(cfg.sandbox.success_threshold, 1);
    }

    #[test]
    fn supervisor_defaults_match_spec() {
        let cfg = SupervisorConfig::default();
        assert_eq!(cfg.max_handoffs, 3);
        assert_eq!(cfg.subgraph_timeout_sec, 300);
        assert_eq!(cfg.app_builder_timeout_sec, 600);
        assert_eq!(cfg.tool_concurrency, 4);
        assert_eq!(cfg.max_content_length, 500);
    }

    #[test]
    fn memory_defaults_match_spec() {
        let cfg = AgentMemoryConfig::default();
        assert_eq!(cfg.preserve_recent, 10);
        assert_eq!(cfg.compression_threshold_tokens, 60_000);
    }

    #[test]
    fn guardrail_deny_patterns_compile() {
        let cfg = GuardrailsConfig::default();
        for p in cfg
            .shell_deny_patterns
            .iter()
            .chain(cfg.jailbreak_patterns.iter())
            .chain(cfg.harmful_patterns.iter())
        {
            assert!(regex::Regex::new(p).is_ok(), "invalid regex: {p}");
        }
    }
}
