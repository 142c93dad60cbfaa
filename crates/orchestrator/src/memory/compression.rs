//! Context compression (spec §4.H). When the estimated prompt token
//! count exceeds a threshold, messages older than the last
//! `preserve_recent` are summarized by a cheap/fast LLM call, with the
//! split snapped backward so a tool-call message is never separated
//! from its tool responses. Extracted references survive even if the
//! LLM summary misses them.

use once_cell::sync::Lazy;
use regex::Regex;
use sa_domain::capability::ModelRole;
use sa_domain::error::Result;
use sa_domain::tool::{Message, Role};
use sa_providers::{ChatRequest, LlmRouter};

/// `⌈len(content) / 4⌉ + 1` fallback token estimate, used when no real
/// tokenizer is wired up.
pub fn estimate_tokens(content: &str) -> usize {
    content.len().div_ceil(4) + 1
}

pub fn estimate_messages_tokens(messages: &[Message]) -> usize {
    messages
        .iter()
        .map(|m| estimate_tokens(&m.content.extract_all_text()))
        .sum()
}

static FILE_PATH_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:/|\./|~/)[\w./\-]+\.\w+").unwrap());
static URL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"https?://[^\s)]+").unwrap());
static COMMAND_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"`([^`\n]{1,200})`").unwrap());

/// Regex-extracts file paths, URLs, and backtick-quoted commands/tool
/// names from a block of text, deduplicated, in first-seen order.
pub fn extract_references(text: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for re in [&*FILE_PATH_RE, &*URL_RE] {
        for m in re.find_iter(text) {
            let s = m.as_str().to_string();
            if seen.insert(s.clone()) {
                out.push(s);
            }
        }
    }
    for caps in COMMAND_RE.captures_iter(text) {
        let s = caps[1].to_string();
        if seen.insert(s.clone()) {
            out.push(s);
        }
    }
    out
}

/// Returns the index at which to split `messages` into "old" (to be
/// summarized) and "recent" (kept verbatim), snapped backward so it
/// never lands between an assistant tool-call message and the tool
/// result message(s) that follow it.
fn split_index(messages: &[Message], preserve_recent: usize) -> usize {
    let mut idx = messages.len().saturating_sub(preserve_recent);
    while idx > 0 && idx < messages.len() && messages[idx].role == Role::Tool {
        idx -= 1;
    }
    idx
}

/// Compresses `messages` if their estimated token count exceeds
/// `threshold_tokens`. On any LLM failure, returns the original messages
/// unchanged — compression is best-effort, never destructive.
pub async fn compress_if_needed(
    messages: Vec<Message>,
    threshold_tokens: usize,
    preserve_recent: usize,
    router: &LlmRouter,
) -> Vec<Message> {
    if estimate_messages_tokens(&messages) <= threshold_tokens {
        return messages;
    }

    let idx = split_index(&messages, preserve_recent);
    if idx == 0 {
        // Nothing old enough to summarize.
        return messages;
    }

    let (old, recent) = messages.split_at(idx);
    let (system_old, non_system_old): (Vec<Message>, Vec<Message>) =
        old.iter().cloned().partition(|m| m.role == Role::System);

    if non_system_old.is_empty() {
        return messages;
    }

    let joined_old = non_system_old
        .iter()
        .map(|m| format!("{:?}: {}", m.role, m.content.extract_all_text()))
        .collect::<Vec<_>>()
        .join("\n");
    let references = extract_references(&joined_old);

    match summarize(&joined_old, router).await {
        Ok(summary) => {
            let mut summary_text = format!("[Previous conversation summary]\n{summary}");
            if !references.is_empty() {
                summary_text.push_str("\n\n## Extracted References (automated)\n");
                for r in &references {
                    summary_text.push_str(&format!("- {r}\n"));
                }
            }
            let mut result = system_old;
            result.push(Message::system(summary_text));
            result.extend(recent.iter().cloned());
            result
        }
        Err(e) => {
            tracing::warn!(error = %e, "context compression failed, keeping full history");
            messages
        }
    }
}

async fn summarize(conversation: &str, router: &LlmRouter) -> Result<String> {
    let req = ChatRequest {
        messages: vec![
            Message::system(
                "Summarize the following conversation history concisely, preserving \
                 any decisions, facts, and action items a future turn would need.",
            ),
            Message::user(conversation.to_string()),
        ],
        tools: vec![],
        temperature: Some(0.0),
        max_tokens: Some(1024),
        json_mode: false,
        model: None,
    };
    let resp = router.chat_for_role(ModelRole::Summarizer, req).await?;
    Ok(resp.content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_tokens_matches_ceil_len_div_4_plus_1() {
        assert_eq!(estimate_tokens(""), 1);
        assert_eq!(estimate_tokens("abcd"), 2);
        assert_eq!(estimate_tokens("abcde"), 3);
    }

    #[test]
    fn extracts_file_paths_urls_and_commands() {
        let text = "See /root/crate/src/main.rs or https://example.com/docs, run `cargo test`";
        let refs = extract_references(text);
        assert!(refs.iter().any(|r| r.contains("main.rs")));
        assert!(refs.iter().any(|r| r.starts_with("https://")));
        assert!(refs.iter().any(|r| r == "cargo test"));
    }

    #[test]
    fn dedups_repeated_references() {
        let text = "https://a.com then https://a.com again";
        assert_eq!(extract_references(text).len(), 1);
    }

    #[test]
    fn split_index_snaps_backward_past_tool_results() {
        let messages = vec![
            Message::user("hi"),
            Message::assistant("calling a tool"),
            Message::tool_result("call-1", "tool output"),
            Message::assistant("final answer"),
        ];
        // preserve_recent=1 would naively land split at index 3 (the Tool
        // message's successor), which is fine here since index 3 is
        // Assistant — but landing exactly on the Tool message itself
        // (index 2) must snap back to 1.
        let idx = split_index(&messages, 2);
        assert_eq!(messages[idx].role, Role::Assistant);
    }

    #[tokio::test]
    async fn below_threshold_returns_messages_unchanged() {
        let messages = vec![Message::user("hello")];
        let registry = sa_providers::ProviderRegistry::from_config(&sa_domain::config::LlmConfig::default())
            .unwrap();
        let router = LlmRouter::new(registry, Default::default(), 1000);
        let result = compress_if_needed(messages.clone(), 60_000, 10, &router).await;
        assert_eq!(result.len(), messages.len());
    }
}
