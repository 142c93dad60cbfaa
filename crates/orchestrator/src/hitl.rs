//! Human-in-the-loop interrupts (spec §4.L). A running subgraph can pause
//! and ask a human for approval, a decision among options, or free-form
//! input. The rendezvous is Redis-backed so the waiting agent process and
//! the responding HTTP request can be two different processes entirely.

use std::time::Duration;

use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use sa_domain::config::HitlConfig;
use sa_domain::error::{Error, Result};

use crate::events::{InterruptKind, InterruptOption};

fn interrupt_key(thread_id: &str, interrupt_id: &str) -> String {
    format!("hitl:interrupt:{thread_id}:{interrupt_id}")
}

fn response_channel(thread_id: &str, interrupt_id: &str) -> String {
    format!("hitl:response:{thread_id}:{interrupt_id}")
}

/// Default action taken when an interrupt times out with no human response.
fn default_action_for(kind: InterruptKind) -> &'static str {
    match kind {
        InterruptKind::Approval => "deny",
        InterruptKind::Decision => "skip",
        InterruptKind::Input => "skip",
    }
}

fn default_timeout_for(kind: InterruptKind, config: &HitlConfig) -> u64 {
    match kind {
        InterruptKind::Approval => config.approval_timeout_sec,
        InterruptKind::Decision | InterruptKind::Input => config.decision_timeout_sec,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingInterrupt {
    pub interrupt_id: String,
    pub thread_id: String,
    pub kind: InterruptKind,
    pub title: String,
    pub message: String,
    pub options: Option<Vec<InterruptOption>>,
    pub tool_info: Option<Value>,
    pub default_action: String,
    pub timeout_seconds: u64,
    pub created_at_ms: i64,
}

/// The outcome of waiting for a response: either a real human answer
/// published on `hitl:response:<thread_id>:<interrupt_id>`, or the
/// configured default applied after the timeout elapsed. Wire shape per
/// spec §4.L/§6: `{action, value, interrupt_id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterruptResponse {
    pub action: String,
    pub value: Value,
    pub interrupt_id: String,
}

/// Redis-backed rendezvous for HITL interrupts. One instance is shared
/// across the process via `Arc`.
#[derive(Clone)]
pub struct InterruptManager {
    client: redis::Client,
    config: HitlConfig,
}

impl InterruptManager {
    pub fn new(redis_url: &str, config: HitlConfig) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| Error::Config(format!("invalid redis url: {e}")))?;
        Ok(Self { client, config })
    }

    async fn connection(&self) -> Result<ConnectionManager> {
        self.client
            .get_connection_manager()
            .await
            .map_err(|e| Error::Other(format!("redis connection failed: {e}")))
    }

    /// Publishes a new pending interrupt, with a TTL of
    /// `timeout_seconds + ttl_buffer_sec` so an abandoned interrupt
    /// doesn't linger in Redis forever.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_interrupt(
        &self,
        thread_id: &str,
        kind: InterruptKind,
        title: &str,
        message: &str,
        options: Option<Vec<InterruptOption>>,
        tool_info: Option<Value>,
    ) -> Result<PendingInterrupt> {
        let interrupt_id = uuid::Uuid::new_v4().to_string();
        let timeout_seconds = default_timeout_for(kind, &self.config);
        let pending = PendingInterrupt {
            interrupt_id: interrupt_id.clone(),
            thread_id: thread_id.to_string(),
            kind,
            title: title.to_string(),
            message: message.to_string(),
            options,
            tool_info,
            default_action: default_action_for(kind).to_string(),
            timeout_seconds,
            created_at_ms: chrono::Utc::now().timestamp_millis(),
        };

        let payload = serde_json::to_string(&pending)
            .map_err(|e| Error::Other(format!("serializing interrupt: {e}")))?;
        let ttl = timeout_seconds + self.config.ttl_buffer_sec;
        let mut conn = self.connection().await?;
        conn.set_ex::<_, _, ()>(interrupt_key(thread_id, &interrupt_id), payload, ttl)
            .await
            .map_err(|e| Error::Other(format!("redis set_ex failed: {e}")))?;

        Ok(pending)
    }

    pub async fn get_pending_interrupt(
        &self,
        thread_id: &str,
        interrupt_id: &str,
    ) -> Result<Option<PendingInterrupt>> {
        let mut conn = self.connection().await?;
        let raw: Option<String> = conn
            .get(interrupt_key(thread_id, interrupt_id))
            .await
            .map_err(|e| Error::Other(format!("redis get failed: {e}")))?;
        raw.map(|s| {
            serde_json::from_str(&s)
                .map_err(|e| Error::Other(format!("corrupt interrupt payload: {e}")))
        })
        .transpose()
    }

    /// Publishes a human response and clears the pending key so a late
    /// duplicate submission can't resurrect an already-resolved interrupt.
    pub async fn submit_response(
        &self,
        thread_id: &str,
        interrupt_id: &str,
        action: String,
        value: Value,
    ) -> Result<()> {
        let response = InterruptResponse {
            action,
            value,
            interrupt_id: interrupt_id.to_string(),
        };
        let payload = serde_json::to_string(&response)
            .map_err(|e| Error::Other(format!("serializing response: {e}")))?;
        let mut conn = self.connection().await?;
        conn.publish::<_, _, ()>(response_channel(thread_id, interrupt_id), payload)
            .await
            .map_err(|e| Error::Other(format!("redis publish failed: {e}")))?;
        conn.del::<_, ()>(interrupt_key(thread_id, interrupt_id))
            .await
            .map_err(|e| Error::Other(format!("redis del failed: {e}")))?;
        Ok(())
    }

    /// Cancels a pending interrupt without resolving it (e.g. the owning
    /// task was itself cancelled upstream).
    pub async fn cancel_interrupt(&self, thread_id: &str, interrupt_id: &str) -> Result<()> {
        let mut conn = self.connection().await?;
        conn.del::<_, ()>(interrupt_key(thread_id, interrupt_id))
            .await
            .map_err(|e| Error::Other(format!("redis del failed: {e}")))?;
        Ok(())
    }

    /// Blocks until a human responds via [`Self::submit_response`] or the
    /// interrupt's timeout elapses, in which case the configured default
    /// action is returned instead.
    pub async fn wait_for_response(
        &self,
        thread_id: &str,
        interrupt_id: &str,
    ) -> Result<InterruptResponse> {
        let pending = self
            .get_pending_interrupt(thread_id, interrupt_id)
            .await?
            .ok_or_else(|| {
                Error::Other(format!("no pending interrupt {thread_id}/{interrupt_id}"))
            })?;

        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| Error::Other(format!("redis pubsub connect failed: {e}")))?;
        pubsub
            .subscribe(response_channel(thread_id, interrupt_id))
            .await
            .map_err(|e| Error::Other(format!("redis subscribe failed: {e}")))?;
        let mut stream = pubsub.on_message();

        let wait = tokio::time::timeout(
            Duration::from_secs(pending.timeout_seconds),
            stream.next(),
        )
        .await;

        match wait {
            Ok(Some(msg)) => {
                let payload: String = msg
                    .get_payload()
                    .map_err(|e| Error::Other(format!("redis payload decode failed: {e}")))?;
                serde_json::from_str(&payload)
                    .map_err(|e| Error::Other(format!("corrupt response payload: {e}")))
            }
            Ok(None) | Err(_) => Ok(InterruptResponse {
                action: pending.default_action.clone(),
                value: Value::String(pending.default_action.clone()),
                interrupt_id: interrupt_id.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn approval_defaults_to_deny() {
        let cfg = HitlConfig::default();
        assert_eq!(default_action_for(InterruptKind::Approval), "deny");
        assert_eq!(default_timeout_for(InterruptKind::Approval, &cfg), 120);
    }

    #[test]
    fn decision_and_input_default_to_skip() {
        assert_eq!(default_action_for(InterruptKind::Decision), "skip");
        assert_eq!(default_action_for(InterruptKind::Input), "skip");
    }

    #[test]
    fn interrupt_response_matches_documented_wire_shape() {
        let raw = r#"{"action":"approve","value":"approve","interrupt_id":"int-1"}"#;
        let response: InterruptResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(response.action, "approve");
        assert_eq!(response.interrupt_id, "int-1");
    }

    #[test]
    fn keys_are_namespaced_by_thread_and_interrupt() {
        assert_eq!(
            interrupt_key("thread-1", "int-1"),
            "hitl:interrupt:thread-1:int-1"
        );
        assert_eq!(
            response_channel("thread-1", "int-1"),
            "hitl:response:thread-1:int-1"
        );
    }
}
