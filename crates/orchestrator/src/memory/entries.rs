//! Cross-session user memory (spec §3 `MemoryEntry`). Deduplicated
//! case-insensitively on `(user_id, content)`: re-adding the same fact
//! bumps `access_count` on the existing row instead of creating a new one.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryType {
    Preference,
    Fact,
    Episodic,
    Procedural,
}

#[derive(Debug, Clone)]
pub struct MemoryEntry {
    pub id: String,
    pub user_id: String,
    pub memory_type: MemoryType,
    pub content: String,
    pub metadata: serde_json::Value,
    pub source_conversation_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub access_count: u64,
}

/// In-process store of [`MemoryEntry`] rows, keyed for dedup lookup by
/// `(user_id, lowercased content)`.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<Vec<MemoryEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }

    /// Adds a memory, or — if a prior entry with the same `user_id` and
    /// case-insensitively equal `content` exists — bumps its
    /// `access_count` and returns its id instead of inserting a new row.
    pub fn add(
        &self,
        user_id: &str,
        memory_type: MemoryType,
        content: &str,
        metadata: serde_json::Value,
        source_conversation_id: Option<String>,
    ) -> String {
        let mut entries = self.entries.write();
        let needle = content.to_lowercase();
        if let Some(existing) = entries
            .iter_mut()
            .find(|e| e.user_id == user_id && e.content.to_lowercase() == needle)
        {
            existing.access_count += 1;
            existing.last_accessed = Utc::now();
            return existing.id.clone();
        }

        let now = Utc::now();
        let entry = MemoryEntry {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            memory_type,
            content: content.to_string(),
            metadata,
            source_conversation_id,
            created_at: now,
            last_accessed: now,
            access_count: 1,
        };
        let id = entry.id.clone();
        entries.push(entry);
        id
    }

    pub fn for_user(&self, user_id: &str) -> Vec<MemoryEntry> {
        self.entries
            .read()
            .iter()
            .filter(|e| e.user_id == user_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Renders a user's memories into a compact prompt-injectable block,
    /// grouped by type.
    pub fn format_for_prompt(&self, user_id: &str) -> String {
        let entries = self.for_user(user_id);
        if entries.is_empty() {
            return String::new();
        }
        let mut by_type: HashMap<&'static str, Vec<&str>> = HashMap::new();
        for entry in &entries {
            let label = match entry.memory_type {
                MemoryType::Preference => "Preferences",
                MemoryType::Fact => "Facts",
                MemoryType::Episodic => "Episodic",
                MemoryType::Procedural => "Procedural",
            };
            by_type.entry(label).or_default().push(&entry.content);
        }
        let mut sections = Vec::new();
        for label in ["Preferences", "Facts", "Episodic", "Procedural"] {
            if let Some(items) = by_type.get(label) {
                sections.push(format!("## {label}\n{}", items.join("\n")));
            }
        }
        sections.join("\n\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn duplicate_case_insensitive_content_bumps_access_count() {
        let store = MemoryStore::new();
        let id1 = store.add("u1", MemoryType::Fact, "Likes dark mode", json!({}), None);
        let id2 = store.add("u1", MemoryType::Fact, "likes DARK MODE", json!({}), None);
        assert_eq!(id1, id2);
        let entries = store.for_user("u1");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].access_count, 2);
    }

    #[test]
    fn different_users_do_not_dedup_against_each_other() {
        let store = MemoryStore::new();
        store.add("u1", MemoryType::Fact, "prefers dark mode", json!({}), None);
        store.add("u2", MemoryType::Fact, "prefers dark mode", json!({}), None);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn format_for_prompt_groups_by_type() {
        let store = MemoryStore::new();
        store.add("u1", MemoryType::Preference, "dark mode", json!({}), None);
        store.add("u1", MemoryType::Fact, "lives in SF", json!({}), None);
        let rendered = store.format_for_prompt("u1");
        assert!(rendered.contains("## Preferences"));
        assert!(rendered.contains("## Facts"));
        assert!(rendered.find("Preferences").unwrap() < rendered.find("Facts").unwrap());
    }
}
