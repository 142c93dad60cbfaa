//! Circuit breaker for outbound calls (LLM providers, web search, sandbox
//! provisioning). Closed -> Open -> HalfOpen -> Closed, tracked per named
//! service in a process-wide registry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use sa_domain::config::CircuitBreakerSettings;
use sa_domain::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_at: Option<Instant>,
    half_open_calls: u32,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_at: None,
            half_open_calls: 0,
        }
    }
}

/// A single named circuit breaker.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerSettings,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerSettings) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(BreakerState::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether a call should be allowed right now. Transitions Open ->
    /// HalfOpen once the recovery timeout has elapsed.
    pub fn is_available(&self) -> bool {
        let mut st = self.state.lock();
        match st.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = st
                    .last_failure_at
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::MAX);
                if elapsed >= Duration::from_millis(self.config.recovery_timeout_ms) {
                    st.state = CircuitState::HalfOpen;
                    st.half_open_calls = 0;
                    st.success_count = 0;
                    tracing::info!(service = %self.name, "circuit_breaker_half_open");
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => st.half_open_calls < self.config.half_open_max_concurrent,
        }
    }

    /// Milliseconds remaining until the breaker may move to half-open.
    /// `None` if the breaker is not open.
    pub fn time_until_retry(&self) -> Option<u64> {
        let st = self.state.lock();
        if st.state != CircuitState::Open {
            return None;
        }
        let elapsed = st
            .last_failure_at
            .map(|t| t.elapsed())
            .unwrap_or(Duration::ZERO);
        let total = Duration::from_millis(self.config.recovery_timeout_ms);
        Some(total.saturating_sub(elapsed).as_millis() as u64)
    }

    fn record_success(&self) {
        let mut st = self.state.lock();
        match st.state {
            CircuitState::HalfOpen => {
                st.success_count += 1;
                // Free this call's half-open slot regardless of whether the
                // breaker closes now — otherwise `half_open_calls` only ever
                // resets on a full state transition, and with
                // `success_threshold > half_open_max_concurrent` the breaker
                // would wedge itself permanently after its first success.
                st.half_open_calls = st.half_open_calls.saturating_sub(1);
                if st.success_count >= self.config.success_threshold {
                    st.state = CircuitState::Closed;
                    st.failure_count = 0;
                    st.success_count = 0;
                    st.half_open_calls = 0;
                    tracing::info!(service = %self.name, "circuit_breaker_closed");
                }
            }
            CircuitState::Closed => {
                st.failure_count = 0;
            }
            CircuitState::Open => {}
        }
    }

    fn record_failure(&self) {
        let mut st = self.state.lock();
        st.last_failure_at = Some(Instant::now());
        match st.state {
            CircuitState::HalfOpen => {
                st.half_open_calls = st.half_open_calls.saturating_sub(1);
                st.state = CircuitState::Open;
                st.failure_count = self.config.failure_threshold;
                tracing::warn!(service = %self.name, "circuit_breaker_reopened");
            }
            CircuitState::Closed => {
                st.failure_count += 1;
                if st.failure_count >= self.config.failure_threshold {
                    st.state = CircuitState::Open;
                    tracing::warn!(service = %self.name, "circuit_breaker_opened");
                }
            }
            CircuitState::Open => {}
        }
    }

    fn enter_half_open(&self) {
        let mut st = self.state.lock();
        if st.state == CircuitState::HalfOpen {
            st.half_open_calls += 1;
        }
    }

    /// Runs `f` through the breaker: rejects immediately if unavailable,
    /// otherwise records success/failure based on the outcome. A
    /// `CircuitOpen` rejection is not itself recorded as a failure.
    pub async fn call<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        if !self.is_available() {
            let retry_after_ms = self.time_until_retry().unwrap_or(0);
            return Err(Error::CircuitOpen {
                service: self.name.clone(),
                retry_after_ms,
            });
        }
        self.enter_half_open();
        match f().await {
            Ok(v) => {
                self.record_success();
                Ok(v)
            }
            Err(e) => {
                self.record_failure();
                Err(e)
            }
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }
}

/// Process-wide registry of named circuit breakers, one per external
/// service (`llm`, `web_search`, `sandbox`, ...).
pub struct CircuitBreakerRegistry {
    default_config: CircuitBreakerSettings,
    sandbox_config: CircuitBreakerSettings,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(default_config: CircuitBreakerSettings, sandbox_config: CircuitBreakerSettings) -> Self {
        Self {
            default_config,
            sandbox_config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Gets or creates the named breaker. Services named `sandbox*` get
    /// the faster-tripping sandbox config; everything else gets the
    /// default config.
    pub fn get(&self, service: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock();
        breakers
            .entry(service.to_string())
            .or_insert_with(|| {
                let config = if service.starts_with("sandbox") {
                    self.sandbox_config.clone()
                } else {
                    self.default_config.clone()
                };
                Arc::new(CircuitBreaker::new(service, config))
            })
            .clone()
    }

    pub fn reset_all(&self) {
        self.breakers.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> CircuitBreakerSettings {
        CircuitBreakerSettings {
            failure_threshold: 2,
            recovery_timeout_ms: 20,
            success_threshold: 1,
            half_open_max_concurrent: 1,
        }
    }

    #[tokio::test]
    async fn opens_after_failure_threshold() {
        let cb = CircuitBreaker::new("test", fast_config());
        for _ in 0..2 {
            let _ = cb.call(|| async { Err::<(), _>(Error::Other("boom".into())) }).await;
        }
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.is_available());
    }

    #[tokio::test]
    async fn open_call_is_rejected_without_counting_as_failure() {
        let cb = CircuitBreaker::new("test", fast_config());
        for _ in 0..2 {
            let _ = cb.call(|| async { Err::<(), _>(Error::Other("boom".into())) }).await;
        }
        let result = cb.call(|| async { Ok::<_, Error>(()) }).await;
        assert!(matches!(result, Err(Error::CircuitOpen { .. })));
        // still open — rejection must not have reset failure bookkeeping
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn transitions_to_half_open_then_closed_after_recovery() {
        let cb = CircuitBreaker::new("test", fast_config());
        for _ in 0..2 {
            let _ = cb.call(|| async { Err::<(), _>(Error::Other("boom".into())) }).await;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert!(cb.is_available());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        let result = cb.call(|| async { Ok::<_, Error>(42) }).await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens_immediately() {
        let cb = CircuitBreaker::new("test", fast_config());
        for _ in 0..2 {
            let _ = cb.call(|| async { Err::<(), _>(Error::Other("boom".into())) }).await;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert!(cb.is_available());
        let _ = cb.call(|| async { Err::<(), _>(Error::Other("still broken".into())) }).await;
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn half_open_slot_frees_up_so_second_success_can_close() {
        // success_threshold > half_open_max_concurrent, as in the default
        // config — the breaker must not wedge itself open after collecting
        // only one of the two successes it needs to close.
        let cb = CircuitBreaker::new(
            "test",
            CircuitBreakerSettings {
                failure_threshold: 2,
                recovery_timeout_ms: 20,
                success_threshold: 2,
                half_open_max_concurrent: 1,
            },
        );
        for _ in 0..2 {
            let _ = cb.call(|| async { Err::<(), _>(Error::Other("boom".into())) }).await;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert!(cb.is_available());

        let first = cb.call(|| async { Ok::<_, Error>(()) }).await;
        assert!(first.is_ok());
        assert_eq!(cb.state(), CircuitState::HalfOpen, "one success is below success_threshold");
        assert!(cb.is_available(), "the half-open slot must be freed after the call completes");

        let second = cb.call(|| async { Ok::<_, Error>(()) }).await;
        assert!(second.is_ok());
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn registry_assigns_sandbox_config_to_sandbox_services() {
        let registry = CircuitBreakerRegistry::new(fast_config(), CircuitBreakerSettings {
            failure_threshold: 1,
            recovery_timeout_ms: 5,
            success_threshold: 1,
            half_open_max_concurrent: 1,
        });
        let sandbox_breaker = registry.get("sandbox.execution");
        let llm_breaker = registry.get("llm.anthropic");
        assert_eq!(sandbox_breaker.config.failure_threshold, 1);
        assert_eq!(llm_breaker.config.failure_threshold, 2);
    }

    #[test]
    fn registry_returns_same_instance_for_same_service() {
        let registry = CircuitBreakerRegistry::new(fast_config(), fast_config());
        let a = registry.get("llm.anthropic");
        let b = registry.get("llm.anthropic");
        assert!(Arc::ptr_eq(&a, &b));
    }
}
