//! Event bus for the supervisor graph and its subgraphs.
//!
//! Every node in the graph emits structured [`Event`]s onto a per-run
//! [`EventBus`]. Emission is dual: events go out an in-process mpsc
//! channel (live SSE consumption) and are appended to a replay buffer
//! (checkpoint resumption). Both receive the same events in the same
//! order, tagged with a per-run monotonic sequence number.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// `stage` event status, per spec §6's `{running, completed, failed}` tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Running,
    Completed,
    Failed,
}

/// `interrupt` event kind, per spec §4.L's APPROVAL/DECISION/INPUT kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterruptKind {
    Approval,
    Decision,
    Input,
}

/// One `{label, value, description}` choice offered by a DECISION interrupt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterruptOption {
    pub label: String,
    pub value: String,
    pub description: String,
}

/// A single structured event emitted by the orchestration graph. Field
/// names and shapes match the SSE wire format in spec §6 exactly so the
/// streaming bridge can serialize these directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    Stage {
        name: String,
        description: String,
        status: StageStatus,
        timestamp: i64,
    },
    Token {
        content: String,
    },
    ToolCall {
        tool: String,
        args: Value,
        id: String,
        timestamp: i64,
    },
    ToolResult {
        tool: String,
        /// Truncated to `max_content_length` (default 500 chars) by the
        /// emitting react loop before this event is constructed.
        content: String,
        id: String,
        timestamp: i64,
    },
    Routing {
        agent: String,
        reason: String,
        confidence: Option<f64>,
        low_confidence: bool,
        message: Option<String>,
        timestamp: i64,
    },
    Handoff {
        source: String,
        target: String,
        task: String,
        timestamp: i64,
    },
    Source {
        title: String,
        url: String,
        snippet: String,
        relevance_score: Option<f64>,
        timestamp: i64,
    },
    Image {
        data: String,
        mime_type: String,
        index: u32,
        url: Option<String>,
        storage_key: Option<String>,
        file_id: Option<String>,
    },
    Visualization {
        data: String,
        mime_type: String,
    },
    CodeResult {
        output: String,
        exit_code: i32,
        error: Option<String>,
    },
    BrowserStream {
        stream_url: String,
        sandbox_id: String,
        auth_key: Option<String>,
    },
    BrowserAction {
        action: String,
        detail: Value,
    },
    TerminalCommand {
        session_id: String,
        command: String,
    },
    TerminalOutput {
        session_id: String,
        chunk: String,
    },
    TerminalError {
        session_id: String,
        message: String,
    },
    TerminalComplete {
        session_id: String,
        exit_code: i32,
    },
    WorkspaceUpdate {
        path: String,
        kind: String,
    },
    SkillOutput {
        skill_name: String,
        output: String,
    },
    Interrupt {
        interrupt_id: String,
        interrupt_type: InterruptKind,
        title: String,
        message: String,
        options: Option<Vec<InterruptOption>>,
        tool_info: Option<Value>,
        default_action: String,
        timeout_seconds: u64,
        timestamp: i64,
    },
    Config {
        depth: Option<String>,
        scenario: Option<String>,
    },
    Complete,
    Error {
        error: String,
        node: Option<String>,
        name: Option<String>,
        description: Option<String>,
        status: &'static str,
        timestamp: i64,
    },
}

impl Event {
    pub fn stage_running(name: impl Into<String>, description: impl Into<String>) -> Self {
        Event::Stage {
            name: name.into(),
            description: description.into(),
            status: StageStatus::Running,
            timestamp: now_ms(),
        }
    }

    pub fn stage_completed(name: impl Into<String>, description: impl Into<String>) -> Self {
        Event::Stage {
            name: name.into(),
            description: description.into(),
            status: StageStatus::Completed,
            timestamp: now_ms(),
        }
    }

    pub fn stage_failed(name: impl Into<String>, description: impl Into<String>) -> Self {
        Event::Stage {
            name: name.into(),
            description: description.into(),
            status: StageStatus::Failed,
            timestamp: now_ms(),
        }
    }

    pub fn tool_call(id: impl Into<String>, tool: impl Into<String>, args: Value) -> Self {
        Event::ToolCall {
            tool: tool.into(),
            args,
            id: id.into(),
            timestamp: now_ms(),
        }
    }

    pub fn tool_result(id: impl Into<String>, tool: impl Into<String>, content: String) -> Self {
        Event::ToolResult {
            tool: tool.into(),
            content,
            id: id.into(),
            timestamp: now_ms(),
        }
    }

    pub fn error(message: impl Into<String>, node: Option<String>) -> Self {
        Event::Error {
            error: message.into(),
            node,
            name: None,
            description: None,
            status: "failed",
            timestamp: now_ms(),
        }
    }
}

/// An [`Event`] tagged with its position in the run's event stream.
#[derive(Debug, Clone, Serialize)]
pub struct SequencedEvent {
    pub seq: u64,
    #[serde(flatten)]
    pub event: Event,
}

/// Per-run event bus: an mpsc sender for live consumers plus an
/// append-only buffer for replay after a checkpoint restore.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

struct Inner {
    tx: mpsc::Sender<SequencedEvent>,
    seq: Mutex<u64>,
    replay: Mutex<Vec<SequencedEvent>>,
}

impl EventBus {
    /// Creates a bus with the given channel capacity, returning the bus
    /// and the receiving end for SSE consumption.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<SequencedEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                inner: Arc::new(Inner {
                    tx,
                    seq: Mutex::new(0),
                    replay: Mutex::new(Vec::new()),
                }),
            },
            rx,
        )
    }

    /// Emits an event: assigns the next sequence number, appends it to
    /// the replay buffer, and pushes it onto the live channel. Silently
    /// drops the live-channel send if the receiver has gone away — the
    /// replay buffer is the source of truth.
    pub fn emit(&self, event: Event) {
        let seq = {
            let mut seq = self.inner.seq.lock();
            *seq += 1;
            *seq
        };
        let sequenced = SequencedEvent { seq, event };
        self.inner.replay.lock().push(sequenced.clone());
        let _ = self.inner.tx.try_send(sequenced);
    }

    /// Returns a snapshot of every event emitted on this bus so far, in
    /// order. Used to replay state to a client that reconnects mid-run.
    pub fn replay(&self) -> Vec<SequencedEvent> {
        self.inner.replay.lock().clone()
    }

    pub fn last_seq(&self) -> u64 {
        *self.inner.seq.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emits_in_order_with_monotonic_seq() {
        let (bus, mut rx) = EventBus::new(16);
        bus.emit(Event::stage_running("router", "routing the request"));
        bus.emit(Event::Token { content: "hi".into() });
        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.seq, 1);
        assert_eq!(second.seq, 2);
    }

    #[test]
    fn replay_buffer_accumulates_all_events() {
        let (bus, _rx) = EventBus::new(16);
        for i in 0..5 {
            bus.emit(Event::Token {
                content: format!("tok-{i}"),
            });
        }
        assert_eq!(bus.replay().len(), 5);
        assert_eq!(bus.last_seq(), 5);
    }

    #[test]
    fn full_channel_does_not_panic_on_emit() {
        let (bus, _rx) = EventBus::new(1);
        for i in 0..10 {
            bus.emit(Event::Token {
                content: format!("tok-{i}"),
            });
        }
        assert_eq!(bus.replay().len(), 10);
    }

    #[test]
    fn stage_bracket_has_matching_status() {
        let (bus, _rx) = EventBus::new(16);
        bus.emit(Event::stage_running("react", "reasoning"));
        bus.emit(Event::stage_completed("react", "reasoning"));
        let events = bus.replay();
        assert!(matches!(
            &events[0].event,
            Event::Stage { status: StageStatus::Running, .. }
        ));
        assert!(matches!(
            &events[1].event,
            Event::Stage { status: StageStatus::Completed, .. }
        ));
    }
}
