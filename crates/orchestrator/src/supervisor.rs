//! The supervisor graph (spec §4.J): `router -> {task | research} ->
//! [research_post] -> check_for_handoff -> (router | EXIT)`.
//!
//! Grounded on `original_source/backend/app/agents/supervisor.py` and
//! `routing.py`: the router LLM call, JSON-with-legacy-text-fallback
//! parsing, the static handoff allow-matrix, and the per-subgraph
//! timeout wrapping.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use sa_domain::capability::ModelRole;
use sa_domain::config::SupervisorConfig;
use sa_domain::error::Result;
use sa_domain::tool::Message;
use sa_providers::{ChatRequest, LlmRouter};

use crate::events::{Event, EventBus};
use crate::guardrails::GuardrailChain;
use crate::memory::SharedContext;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Agent identity
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The three agent types the router can select (spec §2/§6's routing
/// contract). `chat`/`app`/`image`/`writing` are accepted aliases for
/// `task`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Agent {
    Task,
    Research,
    Data,
}

impl Agent {
    pub fn as_str(self) -> &'static str {
        match self {
            Agent::Task => "task",
            Agent::Research => "research",
            Agent::Data => "data",
        }
    }

    /// Resolves an agent name or alias. Unknown names return `None` so
    /// the caller can fall back to `task`.
    pub fn from_alias(s: &str) -> Option<Agent> {
        match s.trim().to_lowercase().as_str() {
            "task" | "chat" | "app" | "image" | "writing" => Some(Agent::Task),
            "research" => Some(Agent::Research),
            "data" => Some(Agent::Data),
            _ => None,
        }
    }
}

/// Which targets each source agent is permitted to hand off to (spec §3
/// `Handoff`, validated against this matrix in `check_for_handoff`).
fn allowed_targets(source: Agent) -> &'static [Agent] {
    match source {
        Agent::Task => &[Agent::Research, Agent::Data],
        Agent::Research => &[Agent::Task],
        Agent::Data => &[Agent::Task],
    }
}

#[derive(Debug, Clone)]
pub struct Handoff {
    pub source_agent: Agent,
    pub target_agent: Agent,
    pub task_description: String,
    pub context: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Supervisor state (spec §3)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct HandoffTrailEntry {
    pub source_agent: Agent,
    pub target_agent: Agent,
    pub task_description: String,
}

/// The mutable record threaded through every graph node. Checkpointed
/// after each node transition by the caller (the checkpoint store is
/// pluggable per spec §4.J; an in-memory default is the caller's
/// concern, not this crate's).
#[derive(Debug, Clone)]
pub struct SupervisorState {
    pub query: String,
    /// Explicit mode selected by the caller, bypassing LLM routing.
    pub explicit_mode: Option<Agent>,
    pub task_id: String,
    pub thread_id: String,
    pub user_id: String,
    pub messages: Vec<Message>,
    pub system_prompt: Option<String>,
    pub locale: Option<String>,
    pub selected_agent: Option<Agent>,
    pub routing_reason: Option<String>,
    pub routing_confidence: Option<f64>,
    pub active_agent: Option<Agent>,
    pub delegated_task: Option<String>,
    pub handoff_context: Option<String>,
    pub pending_handoff: Option<Handoff>,
    pub handoff_count: u32,
    pub handoff_history: Vec<HandoffTrailEntry>,
    pub shared_memory: SharedContext,
    /// Final textual response, set by whichever subgraph terminates the run.
    pub final_response: Option<String>,
}

impl SupervisorState {
    pub fn new(query: impl Into<String>, task_id: impl Into<String>, thread_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        let query = query.into();
        Self {
            messages: vec![Message::user(query.clone())],
            query,
            explicit_mode: None,
            task_id: task_id.into(),
            thread_id: thread_id.into(),
            user_id: user_id.into(),
            system_prompt: None,
            locale: None,
            selected_agent: None,
            routing_reason: None,
            routing_confidence: None,
            active_agent: None,
            delegated_task: None,
            handoff_context: None,
            pending_handoff: None,
            handoff_count: 0,
            handoff_history: Vec::new(),
            shared_memory: SharedContext::default(),
            final_response: None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Router
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const ROUTER_PROMPT: &str = "You are the router for a multi-agent assistant. \
Given the user's message, decide which agent should handle it:\n\
- \"task\": general conversation, coding, file/shell/image work, app building.\n\
- \"research\": deep multi-source research reports.\n\
- \"data\": data analysis and visualization.\n\
Respond with exactly one JSON object: {\"agent\": \"<task|research|data>\", \
\"confidence\": <0..1>, \"reason\": \"<string>\"}. No other text.";

const FIXED_REFUSAL: &str = "I can't help with that request.";

#[derive(Debug, Clone)]
struct RoutingResult {
    agent: Agent,
    confidence: f64,
    reason: String,
}

fn strip_code_fences(s: &str) -> &str {
    let s = s.trim();
    let s = s.strip_prefix("```json").or_else(|| s.strip_prefix("```")).unwrap_or(s);
    s.strip_suffix("```").unwrap_or(s).trim()
}

/// Parses the router LLM's response: strict JSON first, then the legacy
/// `AGENT:`/`REASON:` line format, then falls back to `task` on any
/// parse failure (spec §6 routing JSON contract).
fn parse_router_response(raw: &str) -> RoutingResult {
    let stripped = strip_code_fences(raw);
    if let Ok(value) = serde_json::from_str::<Value>(stripped) {
        if let Some(agent) = value.get("agent").and_then(Value::as_str).and_then(Agent::from_alias) {
            let confidence = value.get("confidence").and_then(Value::as_f64).unwrap_or(0.5);
            let reason = value
                .get("reason")
                .and_then(Value::as_str)
                .unwrap_or("no reason given")
                .to_string();
            return RoutingResult { agent, confidence, reason };
        }
    }

    // Legacy line-oriented fallback: "AGENT: research" / "REASON: ...".
    let mut agent = None;
    let mut reason = None;
    for line in raw.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("AGENT:") {
            agent = Agent::from_alias(rest.trim());
        } else if let Some(rest) = line.strip_prefix("REASON:") {
            reason = Some(rest.trim().to_string());
        }
    }
    if let Some(agent) = agent {
        return RoutingResult {
            agent,
            confidence: 0.5,
            reason: reason.unwrap_or_else(|| "legacy format, no reason given".to_string()),
        };
    }

    tracing::warn!(raw = %raw, "router response unparseable, falling back to task");
    RoutingResult {
        agent: Agent::Task,
        confidence: 0.0,
        reason: "routing response could not be parsed".to_string(),
    }
}

/// The router node. Short-circuits on an empty query or an explicit mode
/// selection; otherwise bypasses to a pending handoff's target, or makes
/// a FLASH-tier LLM call and parses the routing decision.
async fn route_node(
    state: &mut SupervisorState,
    router: &LlmRouter,
    config: &SupervisorConfig,
    bus: &EventBus,
) -> Agent {
    if state.query.trim().is_empty() {
        bus.emit(Event::Routing {
            agent: Agent::Task.as_str().to_string(),
            reason: "empty query".to_string(),
            confidence: Some(1.0),
            low_confidence: false,
            message: Some("received an empty query; defaulting to the task agent".to_string()),
            timestamp: now_ms(),
        });
        return Agent::Task;
    }

    if let Some(handoff) = state.pending_handoff.take() {
        bus.emit(Event::Handoff {
            source: handoff.source_agent.as_str().to_string(),
            target: handoff.target_agent.as_str().to_string(),
            task: handoff.task_description.clone(),
            timestamp: now_ms(),
        });
        state.delegated_task = Some(handoff.task_description.clone());
        state.handoff_context = Some(handoff.context.clone());
        return handoff.target_agent;
    }

    if let Some(mode) = state.explicit_mode {
        bus.emit(Event::Routing {
            agent: mode.as_str().to_string(),
            reason: "caller specified an explicit mode".to_string(),
            confidence: Some(1.0),
            low_confidence: false,
            message: None,
            timestamp: now_ms(),
        });
        return mode;
    }

    let req = ChatRequest {
        messages: vec![Message::system(ROUTER_PROMPT), Message::user(state.query.clone())],
        tools: vec![],
        temperature: Some(0.0),
        max_tokens: Some(256),
        json_mode: true,
        model: None,
    };

    let decision = match router.chat_for_role(ModelRole::Planner, req).await {
        Ok(resp) => parse_router_response(&resp.content),
        Err(e) => {
            tracing::warn!(error = %e, "router LLM call failed, falling back to task");
            RoutingResult {
                agent: Agent::Task,
                confidence: 0.0,
                reason: format!("routing call failed: {e}"),
            }
        }
    };

    let low_confidence = decision.confidence < config.routing_confidence_threshold;
    bus.emit(Event::Routing {
        agent: decision.agent.as_str().to_string(),
        reason: decision.reason.clone(),
        confidence: Some(decision.confidence),
        low_confidence,
        message: None,
        timestamp: now_ms(),
    });
    state.selected_agent = Some(decision.agent);
    state.routing_reason = Some(decision.reason);
    state.routing_confidence = Some(decision.confidence);
    decision.agent
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Handoff check
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Validates a subgraph's `pending_handoff` against the allow-matrix and
/// `MAX_HANDOFFS`. Valid handoffs increment the counter, append to
/// history (capped at `max_handoffs`, since a longer chain already
/// terminates the run), and stay on `state.pending_handoff` for the
/// router to pick up. Invalid handoffs are dropped (logged) and the run
/// terminates with whatever `final_response` the attempting agent left.
fn check_for_handoff(state: &mut SupervisorState, config: &SupervisorConfig) -> bool {
    let Some(handoff) = state.pending_handoff.clone() else {
        return false;
    };

    if state.handoff_count >= config.max_handoffs {
        tracing::warn!(
            source = handoff.source_agent.as_str(),
            target = handoff.target_agent.as_str(),
            count = state.handoff_count,
            "handoff dropped: MAX_HANDOFFS exceeded"
        );
        state.pending_handoff = None;
        return false;
    }

    if !allowed_targets(handoff.source_agent).contains(&handoff.target_agent) {
        tracing::warn!(
            source = handoff.source_agent.as_str(),
            target = handoff.target_agent.as_str(),
            "handoff dropped: target not in allow-matrix"
        );
        state.pending_handoff = None;
        return false;
    }

    state.handoff_count += 1;
    state.handoff_history.push(HandoffTrailEntry {
        source_agent: handoff.source_agent,
        target_agent: handoff.target_agent,
        task_description: handoff.task_description.clone(),
    });
    if state.handoff_history.len() > config.max_handoffs as usize {
        state.handoff_history.remove(0);
    }
    state.shared_memory.handoff_history.push(crate::memory::HandoffTrailEntry {
        source_agent: handoff.source_agent.as_str().to_string(),
        target_agent: handoff.target_agent.as_str().to_string(),
        task_description: handoff.task_description,
    });
    true
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Graph driver
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A subgraph's remaining compute-time budget. Exists so a HITL wait
/// (spec §4.L) can be excluded from the subgraph's timeout clock rather
/// than counting against it: `pause_for_interrupt` re-arms the deadline
/// to the interrupt's own timeout before the wait, and
/// `resume_after_interrupt` restores whatever compute time was left once
/// the interrupt resolves. Mirrors the pause/resume shape of the
/// teacher's `runtime::approval::ApprovalStore` oneshot rendezvous, just
/// against a wall-clock deadline instead of a channel.
pub struct SubgraphBudget {
    deadline: parking_lot::Mutex<Instant>,
}

impl SubgraphBudget {
    pub fn new(duration: Duration) -> Self {
        Self {
            deadline: parking_lot::Mutex::new(Instant::now() + duration),
        }
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= *self.deadline.lock()
    }

    /// Re-arms the deadline to `hitl_timeout` and returns however much of
    /// the original compute budget remained, for [`Self::resume_after_interrupt`]
    /// to restore once the wait is over.
    pub fn pause_for_interrupt(&self, hitl_timeout: Duration) -> Duration {
        let mut deadline = self.deadline.lock();
        let saved_remaining = deadline.saturating_duration_since(Instant::now());
        *deadline = Instant::now() + hitl_timeout;
        saved_remaining
    }

    pub fn resume_after_interrupt(&self, saved_remaining: Duration) {
        *self.deadline.lock() = Instant::now() + saved_remaining;
    }
}

/// Invokes one agent subgraph for the currently routed agent. The
/// supervisor is deliberately generic over the subgraph implementation
/// so this crate's `subgraphs` module can be swapped or extended without
/// touching the graph driver.
#[async_trait::async_trait]
pub trait SubgraphRunner: Send + Sync {
    async fn run(
        &self,
        agent: Agent,
        state: &mut SupervisorState,
        bus: &EventBus,
        budget: &SubgraphBudget,
    ) -> Result<()>;
}

/// Runs the full supervisor graph: input guardrail -> router -> subgraph
/// -> handoff check -> (router | EXIT), looping until the run terminates.
pub async fn run_supervisor(
    mut state: SupervisorState,
    router: &LlmRouter,
    config: &SupervisorConfig,
    guardrails: &GuardrailChain,
    subgraphs: &dyn SubgraphRunner,
    bus: &EventBus,
) -> SupervisorState {
    if guardrails.input.scan(&state.query).is_blocked() {
        bus.emit(Event::Token {
            content: FIXED_REFUSAL.to_string(),
        });
        state.final_response = Some(FIXED_REFUSAL.to_string());
        bus.emit(Event::Complete);
        return state;
    }

    loop {
        let agent = route_node(&mut state, router, config, bus).await;
        state.active_agent = Some(agent);

        let timeout = if is_app_builder(&state) {
            Duration::from_secs(config.app_builder_timeout_sec)
        } else {
            Duration::from_secs(config.subgraph_timeout_sec)
        };

        // The subgraph's own HITL waits, if any, re-arm `budget`'s
        // deadline for their duration rather than racing this outer
        // timeout; this outer one stays as a hard backstop against a
        // subgraph that never checks its budget at all (e.g. a single
        // runaway provider call).
        let budget = SubgraphBudget::new(timeout);
        let hard_backstop = timeout + timeout;
        match tokio::time::timeout(hard_backstop, subgraphs.run(agent, &mut state, bus, &budget)).await {
            Err(_elapsed) => {
                let message = "Sorry, that took too long and I had to stop.";
                bus.emit(Event::error(message.to_string(), Some(agent.as_str().to_string())));
                state.final_response = Some(message.to_string());
                bus.emit(Event::Complete);
                return state;
            }
            Ok(Err(e)) => {
                bus.emit(Event::error(e.to_string(), Some(agent.as_str().to_string())));
                state.final_response = Some("I encountered an error while processing your request.".to_string());
                bus.emit(Event::Complete);
                return state;
            }
            Ok(Ok(())) if budget.is_expired() => {
                let message = "Sorry, that took too long and I had to stop.";
                bus.emit(Event::error(message.to_string(), Some(agent.as_str().to_string())));
                state.final_response = Some(message.to_string());
                bus.emit(Event::Complete);
                return state;
            }
            Ok(Ok(())) => {}
        }

        if !check_for_handoff(&mut state, config) {
            break;
        }
    }

    bus.emit(Event::Complete);
    state
}

fn is_app_builder(state: &SupervisorState) -> bool {
    state.explicit_mode == Some(Agent::Task)
        && state
            .system_prompt
            .as_deref()
            .map(|p| p.contains("app-builder"))
            .unwrap_or(false)
}
