//! Agent subgraphs (spec §4.I): the task react loop and the research
//! pipeline, plus the generic tool-dispatch seam between this crate's
//! subgraph logic and `sa_tools`'s concrete resource implementations.
//!
//! Grounded on `sa_tools::manager::ProcessManager`'s registry shape —
//! concrete tools are resource-specific (exec, file ops, browser), so
//! this module defines a small `ToolHandler` trait the gateway crate
//! implements per tool, keeping the react loop itself generic.

pub mod research;
pub mod task;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use sa_domain::error::Result;
use sa_domain::tool::ToolCall;

use crate::events::{Event, EventBus};
use crate::guardrails::GuardrailChain;
use crate::supervisor::{Agent, Handoff};

/// Per-invocation context handed to a [`ToolHandler`]: enough to run a
/// sandboxed command or touch the shared workspace without the handler
/// needing to know about the supervisor graph.
pub struct ToolContext {
    pub user_id: String,
    pub task_id: String,
    pub thread_id: String,
}

/// The result of running one tool call. `content` is the full,
/// untruncated text; the react loop truncates to
/// `SupervisorConfig::max_content_length` before emitting a
/// [`Event::ToolResult`].
pub struct ToolOutcome {
    pub content: String,
    pub is_error: bool,
}

impl ToolOutcome {
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

/// One concrete tool implementation. The gateway crate (or any other
/// embedder) registers these against a [`ToolDispatchTable`]; this crate
/// never constructs one itself beyond the built-in [`HandoffTool`].
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, ctx: &ToolContext, arguments: Value) -> Result<ToolOutcome>;
}

/// Maps tool names to handlers. Built with the [`HandoffTool`]
/// pre-registered; callers add the rest (file ops, shell, search,
/// browser, MCP-wrapped tools, ...).
#[derive(Clone, Default)]
pub struct ToolDispatchTable {
    handlers: HashMap<String, Arc<dyn ToolHandler>>,
}

impl ToolDispatchTable {
    pub fn new() -> Self {
        let mut table = Self::default();
        table.register("handoff", Arc::new(HandoffTool));
        table
    }

    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn ToolHandler>) {
        self.handlers.insert(name.into(), handler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }
}

/// The built-in `handoff` tool every agent subgraph exposes: lets the
/// model request a transfer to another agent rather than the subgraph
/// inferring one from free text. Arguments: `{"target": "...",
/// "task_description": "...", "context": "..."}`.
pub struct HandoffTool;

#[async_trait]
impl ToolHandler for HandoffTool {
    async fn call(&self, _ctx: &ToolContext, arguments: Value) -> Result<ToolOutcome> {
        let target = arguments
            .get("target")
            .and_then(Value::as_str)
            .unwrap_or("task");
        let task_description = arguments
            .get("task_description")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        Ok(ToolOutcome::ok(format!(
            "handoff requested to '{target}': {task_description}"
        )))
    }
}

/// Parses a `handoff` tool call's arguments into a [`Handoff`], given the
/// agent currently running. Returns `None` if the target alias doesn't
/// resolve, leaving the caller to treat the call as a normal tool result.
pub fn parse_handoff_call(source: Agent, call: &ToolCall) -> Option<Handoff> {
    if call.tool_name != "handoff" {
        return None;
    }
    let target = call
        .arguments
        .get("target")
        .and_then(Value::as_str)
        .and_then(Agent::from_alias)?;
    let task_description = call
        .arguments
        .get("task_description")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let context = call
        .arguments
        .get("context")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    Some(Handoff {
        source_agent: source,
        target_agent: target,
        task_description,
        context,
    })
}

/// Parses a `request_approval` tool call's arguments into the
/// `(title, message, tool_info)` triple `task::run_task_subgraph` hands to
/// [`crate::hitl::InterruptManager::create_interrupt`]. Arguments:
/// `{"title": "...", "message": "...", "tool_info": {...}}`.
pub fn parse_approval_call(call: &ToolCall) -> Option<(String, String, Option<Value>)> {
    if call.tool_name != "request_approval" {
        return None;
    }
    let title = call
        .arguments
        .get("title")
        .and_then(Value::as_str)
        .unwrap_or("Approval requested")
        .to_string();
    let message = call
        .arguments
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let tool_info = call.arguments.get("tool_info").cloned();
    Some((title, message, tool_info))
}

/// Truncates tool-result content to `max_len` characters (spec's
/// `max_content_length`), respecting UTF-8 char boundaries and appending
/// a marker so callers can tell truncation occurred.
pub fn truncate_content(content: &str, max_len: usize) -> String {
    if content.chars().count() <= max_len {
        return content.to_string();
    }
    let truncated: String = content.chars().take(max_len).collect();
    format!("{truncated}...(truncated)")
}

pub(crate) fn emit_guardrail_blocked_tool(bus: &EventBus, tool: &str, id: &str, reason: &str) {
    bus.emit(Event::tool_result(
        id.to_string(),
        tool.to_string(),
        format!("blocked by guardrail: {reason}"),
    ));
}

pub(crate) fn scan_tool_args(guardrails: &GuardrailChain, tool: &str, args: &Value) -> Option<String> {
    let text = args.to_string();
    if tool == "shell" || tool == "run_command" {
        let verdict = guardrails.tool.scan_shell_command(&text);
        if verdict.is_blocked() {
            return Some(format!("{verdict:?}"));
        }
    }
    None
}
