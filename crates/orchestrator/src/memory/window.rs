//! Windowed conversation memory (spec §4.H). Keeps a bounded ring of
//! messages: system messages are always kept verbatim, the most recent
//! `preserve_recent` (or enough non-system messages to fill the window,
//! whichever is larger) are kept, and the middle is dropped.

use sa_domain::config::AgentMemoryConfig;
use sa_domain::tool::{Message, Role};

/// A bounded conversation history that drops middle messages on overflow
/// instead of growing without limit.
#[derive(Debug, Clone)]
pub struct WindowedMemory {
    messages: Vec<Message>,
    config: AgentMemoryConfig,
}

impl WindowedMemory {
    pub fn new(config: AgentMemoryConfig) -> Self {
        Self {
            messages: Vec::new(),
            config,
        }
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
        self.enforce_window();
    }

    pub fn extend(&mut self, messages: impl IntoIterator<Item = Message>) {
        self.messages.extend(messages);
        self.enforce_window();
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Replaces the full message list, e.g. after context compression has
    /// produced a new summarized history.
    pub fn replace(&mut self, messages: Vec<Message>) {
        self.messages = messages;
    }

    /// Drops middle messages once the window exceeds `max_messages`.
    /// System messages are kept verbatim (if `preserve_system`); the tail
    /// `max(preserve_recent, max_messages - system_count)` non-system
    /// messages are kept.
    fn enforce_window(&mut self) {
        if self.messages.len() <= self.config.max_messages {
            return;
        }

        let (system, rest): (Vec<Message>, Vec<Message>) = if self.config.preserve_system {
            self.messages
                .clone()
                .into_iter()
                .partition(|m| m.role == Role::System)
        } else {
            (Vec::new(), self.messages.clone())
        };

        let keep_count = self
            .config
            .preserve_recent
            .max(self.config.max_messages.saturating_sub(system.len()));
        let keep_count = keep_count.min(rest.len());
        let tail: Vec<Message> = rest[rest.len() - keep_count..].to_vec();

        let mut result = system;
        result.extend(tail);
        self.messages = result;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(max_messages: usize, preserve_recent: usize) -> AgentMemoryConfig {
        AgentMemoryConfig {
            max_messages,
            preserve_recent,
            preserve_system: true,
            compression_threshold_tokens: 60_000,
            shared_context_max_length: 4_000,
        }
    }

    #[test]
    fn keeps_all_messages_under_the_limit() {
        let mut mem = WindowedMemory::new(cfg(10, 3));
        for i in 0..5 {
            mem.push(Message::user(format!("msg {i}")));
        }
        assert_eq!(mem.len(), 5);
    }

    #[test]
    fn drops_middle_messages_on_overflow() {
        let mut mem = WindowedMemory::new(cfg(5, 2));
        for i in 0..10 {
            mem.push(Message::user(format!("msg {i}")));
        }
        assert_eq!(mem.len(), 5);
        let texts: Vec<_> = mem
            .messages()
            .iter()
            .map(|m| m.content.text().unwrap().to_string())
            .collect();
        assert_eq!(texts, vec!["msg 5", "msg 6", "msg 7", "msg 8", "msg 9"]);
    }

    #[test]
    fn system_messages_always_survive() {
        let mut mem = WindowedMemory::new(cfg(4, 2));
        mem.push(Message::system("you are a helpful assistant"));
        for i in 0..10 {
            mem.push(Message::user(format!("msg {i}")));
        }
        assert!(mem.messages().iter().any(|m| m.role == Role::System));
        let system_count = mem.messages().iter().filter(|m| m.role == Role::System).count();
        assert_eq!(system_count, 1);
    }

    #[test]
    fn preserve_recent_floor_wins_when_system_count_is_large() {
        let mut mem = WindowedMemory::new(cfg(5, 3));
        for i in 0..4 {
            mem.push(Message::system(format!("sys {i}")));
        }
        for i in 0..10 {
            mem.push(Message::user(format!("msg {i}")));
        }
        let non_system = mem.messages().iter().filter(|m| m.role != Role::System).count();
        assert_eq!(non_system, 3);
    }
}
