//! The task subgraph (spec §4.I.1): a bounded-concurrency plan -> react ->
//! finalize loop. Grounded on `original_source/api/app/agents/subagents/code.py`'s
//! react loop and the teacher's async-stream chat handling in
//! `crates/gateway/src/api/chat.rs`.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::FuturesUnordered;
use futures_util::StreamExt;
use tokio::sync::Semaphore;

use sa_domain::capability::ModelRole;
use sa_domain::config::SupervisorConfig;
use sa_domain::error::Result;
use sa_domain::tool::{Message, ToolDefinition};
use sa_providers::{ChatRequest, LlmRouter};

use crate::events::{Event, EventBus, InterruptKind};
use crate::guardrails::GuardrailChain;
use crate::hitl::InterruptManager;
use crate::supervisor::{Agent, SubgraphBudget, SupervisorState};

use super::{parse_approval_call, parse_handoff_call, scan_tool_args, truncate_content, ToolContext, ToolDispatchTable};

const TASK_SYSTEM_PROMPT: &str = "You are a capable general-purpose assistant. \
Use tools when they help you answer accurately; when you are done, respond \
with your final answer in plain text. If another agent is better suited to \
finish this request, call the `handoff` tool instead of guessing.";

/// Runs the task subgraph's plan -> react -> finalize sequence in place on
/// `state`. Bounded by `config.max_iterations` react turns,
/// `config.tool_concurrency` concurrent tool calls per turn, and
/// `budget`'s compute deadline (which a `request_approval` tool call
/// pauses for the duration of the human wait rather than burning
/// against). `interrupts` is `None` when the embedder hasn't configured a
/// HITL backend, in which case approval requests auto-deny.
#[allow(clippy::too_many_arguments)]
pub async fn run_task_subgraph(
    state: &mut SupervisorState,
    router: &LlmRouter,
    config: &SupervisorConfig,
    guardrails: &GuardrailChain,
    tools: &ToolDispatchTable,
    tool_definitions: &[ToolDefinition],
    bus: &EventBus,
    budget: &SubgraphBudget,
    interrupts: Option<&InterruptManager>,
) -> Result<()> {
    bus.emit(Event::stage_running("plan", "preparing to work on the request"));

    let mut messages = vec![Message::system(TASK_SYSTEM_PROMPT)];
    if let Some(context) = state.handoff_context.take() {
        messages.push(Message::system(format!("Context from the previous agent: {context}")));
    }
    let task_text = state.delegated_task.clone().unwrap_or_else(|| state.query.clone());
    messages.extend(state.messages.iter().cloned());
    if state.delegated_task.is_some() {
        messages.push(Message::user(task_text));
    }

    bus.emit(Event::stage_completed("plan", "preparing to work on the request"));
    bus.emit(Event::stage_running("react", "reasoning and using tools"));

    let semaphore = Arc::new(Semaphore::new(config.tool_concurrency.max(1)));
    let ctx = ToolContext {
        user_id: state.user_id.clone(),
        task_id: state.task_id.clone(),
        thread_id: state.thread_id.clone(),
    };

    let mut final_text = String::new();
    for _ in 0..config.max_iterations {
        if budget.is_expired() {
            break;
        }

        let req = ChatRequest {
            messages: messages.clone(),
            tools: tool_definitions.to_vec(),
            temperature: None,
            max_tokens: None,
            json_mode: false,
            model: None,
        };

        let response = router.chat_for_role(ModelRole::Executor, req).await?;

        if response.tool_calls.is_empty() {
            final_text = response.content.clone();
            messages.push(Message::assistant(response.content));
            break;
        }

        messages.push(Message::assistant(response.content.clone()));

        let mut handoff_requested = false;
        let mut approval_results = Vec::new();
        let mut futures = FuturesUnordered::new();
        for call in response.tool_calls.clone() {
            if let Some(handoff) = parse_handoff_call(Agent::Task, &call) {
                state.pending_handoff = Some(handoff);
                handoff_requested = true;
                continue;
            }

            if let Some((title, message, tool_info)) = parse_approval_call(&call) {
                bus.emit(Event::tool_call(call.call_id.clone(), call.tool_name.clone(), call.arguments.clone()));
                let outcome = resolve_approval(interrupts, &state.thread_id, &title, &message, tool_info, budget, bus).await;
                approval_results.push((call.clone(), outcome));
                continue;
            }

            let permit = semaphore.clone().acquire_owned().await;
            let tools = tools.clone();
            let ctx_ref = ToolContext {
                user_id: ctx.user_id.clone(),
                task_id: ctx.task_id.clone(),
                thread_id: ctx.thread_id.clone(),
            };
            let call = call.clone();
            futures.push(async move {
                let _permit = permit;
                let outcome = match tools.get(&call.tool_name) {
                    Some(handler) => handler.call(&ctx_ref, call.arguments.clone()).await,
                    None => Ok(super::ToolOutcome::error(format!("unknown tool: {}", call.tool_name))),
                };
                (call, outcome)
            });
        }

        for (call, outcome) in approval_results {
            bus.emit(Event::tool_result(call.call_id.clone(), call.tool_name.clone(), outcome.clone()));
            messages.push(Message::user(format!("Tool '{}' result: {outcome}", call.tool_name)));
        }

        if handoff_requested && futures.is_empty() {
            bus.emit(Event::stage_completed("react", "reasoning and using tools"));
            return Ok(());
        }

        while let Some((call, outcome)) = futures.next().await {
            bus.emit(Event::tool_call(call.call_id.clone(), call.tool_name.clone(), call.arguments.clone()));

            if let Some(reason) = scan_tool_args(guardrails, &call.tool_name, &call.arguments) {
                let content = format!("blocked: {reason}");
                bus.emit(Event::tool_result(call.call_id.clone(), call.tool_name.clone(), content.clone()));
                messages.push(Message::user(format!("Tool '{}' result: {content}", call.tool_name)));
                continue;
            }

            let content = match outcome {
                Ok(outcome) => outcome.content,
                Err(e) => format!("error: {e}"),
            };
            let truncated = truncate_content(&content, config.max_content_length);
            bus.emit(Event::tool_result(call.call_id.clone(), call.tool_name.clone(), truncated.clone()));
            messages.push(Message::user(format!("Tool '{}' result: {truncated}", call.tool_name)));
        }

        if handoff_requested {
            bus.emit(Event::stage_completed("react", "reasoning and using tools"));
            return Ok(());
        }
    }

    bus.emit(Event::stage_completed("react", "reasoning and using tools"));
    bus.emit(Event::stage_running("finalize", "preparing final response"));

    if final_text.is_empty() {
        final_text = "I wasn't able to finish within the step limit.".to_string();
    }

    let verdict = guardrails.output.scan(&final_text);
    let output = if verdict.is_blocked() {
        "I can't share that response.".to_string()
    } else if verdict.is_flagged() {
        verdict.sanitized_content.unwrap_or(final_text)
    } else {
        final_text
    };

    for chunk in chunk_tokens(&output) {
        bus.emit(Event::Token { content: chunk });
    }

    state.final_response = Some(output);
    bus.emit(Event::stage_completed("finalize", "preparing final response"));
    Ok(())
}

/// Runs one `request_approval` tool call to completion: creates the
/// interrupt, emits it on the bus, pauses `budget`'s compute deadline for
/// the wait, and resumes it once a human (or the interrupt's own timeout)
/// resolves it. With no HITL backend configured the request auto-denies,
/// since nothing can answer it.
async fn resolve_approval(
    interrupts: Option<&InterruptManager>,
    thread_id: &str,
    title: &str,
    message: &str,
    tool_info: Option<serde_json::Value>,
    budget: &SubgraphBudget,
    bus: &EventBus,
) -> String {
    let Some(manager) = interrupts else {
        return "deny".to_string();
    };

    let pending = match manager
        .create_interrupt(thread_id, InterruptKind::Approval, title, message, None, tool_info)
        .await
    {
        Ok(pending) => pending,
        Err(e) => return format!("error: {e}"),
    };

    bus.emit(Event::Interrupt {
        interrupt_id: pending.interrupt_id.clone(),
        interrupt_type: InterruptKind::Approval,
        title: pending.title.clone(),
        message: pending.message.clone(),
        options: pending.options.clone(),
        tool_info: pending.tool_info.clone(),
        default_action: pending.default_action.clone(),
        timeout_seconds: pending.timeout_seconds,
        timestamp: chrono::Utc::now().timestamp_millis(),
    });

    let saved_remaining = budget.pause_for_interrupt(Duration::from_secs(pending.timeout_seconds));
    let response = manager.wait_for_response(thread_id, &pending.interrupt_id).await;
    budget.resume_after_interrupt(saved_remaining);

    match response {
        Ok(r) => r.value.as_str().unwrap_or(&pending.default_action).to_string(),
        Err(e) => format!("error: {e}"),
    }
}

/// Splits response text into word-ish chunks for token-style streaming.
/// The underlying provider call is not itself streamed (spec's router has
/// no per-role streaming API); this approximates incremental delivery for
/// SSE consumers.
fn chunk_tokens(text: &str) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }
    text.split_inclusive(' ').map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_tokens_splits_on_spaces_preserving_them() {
        let chunks = chunk_tokens("hello world foo");
        assert_eq!(chunks, vec!["hello ", "world ", "foo"]);
    }

    #[tokio::test]
    async fn resolve_approval_auto_denies_without_a_hitl_backend() {
        let budget = SubgraphBudget::new(Duration::from_secs(30));
        let (bus, _rx) = EventBus::new(16);
        let outcome = resolve_approval(None, "thread-1", "Deploy", "ship it?", None, &budget, &bus).await;
        assert_eq!(outcome, "deny");
        assert!(!budget.is_expired(), "auto-deny path must not touch the budget");
    }

    #[test]
    fn chunk_tokens_empty_text_yields_no_chunks() {
        assert!(chunk_tokens("").is_empty());
    }
}
