//! Streaming transport (spec §4.K): turns an [`EventBus`]'s events into
//! SSE wire lines, and bridges events from out-of-process research
//! workers over Redis pub/sub into the same in-process bus.
//!
//! The SSE framing itself (`data: <json>\n\n`) is transport-agnostic and
//! deliberately free of axum types — `crates/gateway` wraps this in its
//! own `Sse`/`KeepAlive` response the way `crates/gateway/src/api/chat.rs`
//! already does for the single-agent chat endpoint.

use async_stream::stream;
use futures_core::Stream;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde_json::Value;
use tokio::sync::mpsc;

use sa_domain::error::{Error, Result};

use crate::events::{Event, SequencedEvent};

/// Serializes one event to its `data: <json>\n\n` SSE line.
pub fn to_sse_line(event: &SequencedEvent) -> Result<String> {
    let json = serde_json::to_string(event).map_err(Error::Json)?;
    Ok(format!("data: {json}\n\n"))
}

/// Adapts an [`EventBus`] receiver into a stream of SSE wire lines,
/// terminating after the bus emits [`Event::Complete`] or [`Event::Error`].
pub fn sse_stream(mut rx: mpsc::Receiver<SequencedEvent>) -> impl Stream<Item = Result<String>> {
    stream! {
        while let Some(event) = rx.recv().await {
            let is_terminal = matches!(event.event, Event::Complete | Event::Error { .. });
            yield to_sse_line(&event);
            if is_terminal {
                break;
            }
        }
    }
}

fn channel_events(task_id: &str) -> String {
    format!("research:events:{task_id}")
}

fn channel_status(task_id: &str) -> String {
    format!("research:status:{task_id}")
}

fn channel_complete(task_id: &str) -> String {
    format!("research:complete:{task_id}")
}

/// Bridges a research worker's Redis-published events into a local
/// [`EventBus`]. Research subgraphs that delegate deep-research work to a
/// separate worker process publish [`Event`]s as JSON on
/// `research:events:<task_id>` and a sentinel on
/// `research:complete:<task_id>`; this forwards both onto the bus driving
/// the client's SSE stream.
pub struct RedisBridge {
    client: redis::Client,
}

impl RedisBridge {
    pub fn new(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| Error::Config(format!("invalid redis url: {e}")))?;
        Ok(Self { client })
    }

    async fn connection(&self) -> Result<ConnectionManager> {
        self.client
            .get_connection_manager()
            .await
            .map_err(|e| Error::Other(format!("redis connection failed: {e}")))
    }

    /// Publishes a single event for `task_id`, used by a worker process
    /// that is not itself holding the in-process [`EventBus`].
    pub async fn publish_event(&self, task_id: &str, event: &Event) -> Result<()> {
        let payload = serde_json::to_string(event).map_err(Error::Json)?;
        let mut conn = self.connection().await?;
        conn.publish::<_, _, ()>(channel_events(task_id), payload)
            .await
            .map_err(|e| Error::Other(format!("redis publish failed: {e}")))?;
        Ok(())
    }

    /// Publishes a `{status, error?}` payload on the task's status channel
    /// (spec §6: `research:status:<task_id>`, one of
    /// `queued|running|completed|failed`).
    pub async fn publish_status(&self, task_id: &str, status: &str, error: Option<&str>) -> Result<()> {
        let payload = serde_json::json!({ "status": status, "error": error }).to_string();
        let mut conn = self.connection().await?;
        conn.publish::<_, _, ()>(channel_status(task_id), payload)
            .await
            .map_err(|e| Error::Other(format!("redis publish failed: {e}")))?;
        Ok(())
    }

    pub async fn publish_complete(&self, task_id: &str) -> Result<()> {
        let mut conn = self.connection().await?;
        conn.publish::<_, _, ()>(channel_complete(task_id), "done")
            .await
            .map_err(|e| Error::Other(format!("redis publish failed: {e}")))?;
        Ok(())
    }

    /// Subscribes to a task's event, status, and completion channels
    /// (spec §4.K.2) and forwards every received event onto `bus` until
    /// the completion sentinel arrives or the subscription itself errors.
    /// A `failed` status message is surfaced as an [`Event::Error`]; other
    /// status transitions are logged but have no direct SSE event shape.
    pub async fn forward_into(&self, task_id: &str, bus: &crate::events::EventBus) -> Result<()> {
        use futures_util::StreamExt;

        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| Error::Other(format!("redis pubsub connect failed: {e}")))?;
        pubsub
            .subscribe(channel_events(task_id))
            .await
            .map_err(|e| Error::Other(format!("redis subscribe failed: {e}")))?;
        pubsub
            .subscribe(channel_status(task_id))
            .await
            .map_err(|e| Error::Other(format!("redis subscribe failed: {e}")))?;
        pubsub
            .subscribe(channel_complete(task_id))
            .await
            .map_err(|e| Error::Other(format!("redis subscribe failed: {e}")))?;

        let status_channel = channel_status(task_id);
        let complete_channel = channel_complete(task_id);
        let mut stream = pubsub.on_message();
        while let Some(msg) = stream.next().await {
            let channel = msg.get_channel_name().to_string();
            if channel == complete_channel {
                break;
            }
            let payload: String = msg
                .get_payload()
                .map_err(|e| Error::Other(format!("redis payload decode failed: {e}")))?;

            if channel == status_channel {
                match serde_json::from_str::<Value>(&payload) {
                    Ok(status) => {
                        let status_str = status.get("status").and_then(Value::as_str).unwrap_or("");
                        tracing::info!(task_id, status = status_str, "research_status_update");
                        if status_str == "failed" {
                            let error = status
                                .get("error")
                                .and_then(Value::as_str)
                                .unwrap_or("research worker reported failure")
                                .to_string();
                            bus.emit(Event::error(error, Some("research".to_string())));
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "dropping malformed status message"),
                }
                continue;
            }

            match serde_json::from_str::<Event>(&payload) {
                Ok(event) => bus.emit(event),
                Err(e) => tracing::warn!(error = %e, "dropping malformed worker event"),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;

    #[test]
    fn sse_line_has_data_prefix_and_double_newline() {
        let (bus, _rx) = EventBus::new(16);
        bus.emit(Event::Token { content: "hi".into() });
        let sequenced = bus.replay().into_iter().next().unwrap();
        let line = to_sse_line(&sequenced).unwrap();
        assert!(line.starts_with("data: "));
        assert!(line.ends_with("\n\n"));
        assert!(line.contains("\"type\":\"token\""));
    }

    #[tokio::test]
    async fn sse_stream_terminates_after_complete_event() {
        use futures_util::StreamExt;

        let (bus, rx) = EventBus::new(16);
        bus.emit(Event::Token { content: "hi".into() });
        bus.emit(Event::Complete);
        bus.emit(Event::Token { content: "never seen".into() });

        let stream = sse_stream(rx);
        tokio::pin!(stream);
        let mut lines = Vec::new();
        while let Some(line) = stream.next().await {
            lines.push(line.unwrap());
        }
        assert_eq!(lines.len(), 2);
        assert!(lines[1].contains("\"type\":\"complete\""));
    }

    #[test]
    fn channel_names_match_spec_format() {
        assert_eq!(channel_events("task-1"), "research:events:task-1");
        assert_eq!(channel_status("task-1"), "research:status:task-1");
        assert_eq!(channel_complete("task-1"), "research:complete:task-1");
    }
}
