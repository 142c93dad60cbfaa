//! Tool registry (spec §4.E): a declarative catalog of tools grouped by
//! category, per-agent-type subset resolution, MCP tool wrapping, and a
//! lazy `search_tools` meta-tool for budget-constrained contexts.
//!
//! Grounded on `sa_tools::manager::ProcessManager`'s `RwLock`-guarded
//! registry shape and `sa_mcp_client::McpManager`'s discovered-tool list.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde_json::Value;

use sa_domain::tool::ToolDefinition;
use sa_mcp_client::McpManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolCategory {
    Search,
    FileOps,
    Shell,
    Browser,
    CodeExec,
    Image,
    Deploy,
    ToolSearch,
    Mcp,
}

/// A cataloged tool: its LLM-facing definition, category, and — for
/// MCP-discovered tools — the server it came from (so it can be
/// unregistered in bulk when that server goes away).
#[derive(Debug, Clone)]
pub struct CatalogEntry {
    pub definition: ToolDefinition,
    pub category: ToolCategory,
    pub mcp_server: Option<String>,
}

/// A `search_tools(query)` hit: enough to show the agent without handing
/// over the full parameter schema.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolSearchHit {
    pub name: String,
    pub description: String,
    pub category: ToolCategory,
}

const MAX_SEARCH_RESULTS: usize = 8;

/// Declarative tool catalog plus per-agent category allowlists. Tools are
/// added at startup (built-ins) and dynamically as MCP servers connect.
pub struct ToolRegistry {
    entries: RwLock<HashMap<String, CatalogEntry>>,
    agent_categories: HashMap<&'static str, Vec<ToolCategory>>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        let mut agent_categories = HashMap::new();
        agent_categories.insert(
            "task",
            vec![
                ToolCategory::FileOps,
                ToolCategory::Shell,
                ToolCategory::CodeExec,
                ToolCategory::Deploy,
                ToolCategory::ToolSearch,
                ToolCategory::Mcp,
            ],
        );
        agent_categories.insert(
            "research",
            vec![
                ToolCategory::Search,
                ToolCategory::Browser,
                ToolCategory::ToolSearch,
                ToolCategory::Mcp,
            ],
        );
        agent_categories.insert(
            "data",
            vec![
                ToolCategory::CodeExec,
                ToolCategory::FileOps,
                ToolCategory::Image,
                ToolCategory::ToolSearch,
                ToolCategory::Mcp,
            ],
        );
        Self {
            entries: RwLock::new(HashMap::new()),
            agent_categories,
        }
    }

    pub fn register(&self, name: impl Into<String>, entry: CatalogEntry) {
        self.entries.write().insert(name.into(), entry);
    }

    pub fn unregister(&self, name: &str) {
        self.entries.write().remove(name);
    }

    /// Removes every tool that was registered as belonging to `server`,
    /// called when an MCP server is torn down.
    pub fn unregister_mcp_server(&self, server: &str) {
        self.entries
            .write()
            .retain(|_, e| e.mcp_server.as_deref() != Some(server));
    }

    /// Discovers every tool exposed by `manager` and wraps each as
    /// `mcp_<tool>` with description `[MCP: <server>] <desc>`, registered
    /// under [`ToolCategory::Mcp`].
    pub fn register_mcp_tools(&self, manager: &McpManager) {
        let mut entries = self.entries.write();
        for (server, tool) in manager.list_tools() {
            let name = format!("mcp_{}", tool.name);
            entries.insert(
                name.clone(),
                CatalogEntry {
                    definition: ToolDefinition {
                        name,
                        description: format!("[MCP: {server}] {}", tool.description),
                        parameters: tool.input_schema.clone(),
                    },
                    category: ToolCategory::Mcp,
                    mcp_server: Some(server.to_string()),
                },
            );
        }
    }

    /// Flat tool list allowed for a given agent type (spec §4.E
    /// `get_tool_names_for_agent`). Unknown agent types get an empty set.
    pub fn get_tool_names_for_agent(&self, agent_type: &str) -> Vec<String> {
        let Some(categories) = self.agent_categories.get(agent_type) else {
            return Vec::new();
        };
        self.entries
            .read()
            .iter()
            .filter(|(_, e)| categories.contains(&e.category))
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn get_tool_names_for_category(&self, category: ToolCategory) -> Vec<String> {
        self.entries
            .read()
            .iter()
            .filter(|(_, e)| e.category == category)
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn definition(&self, name: &str) -> Option<ToolDefinition> {
        self.entries.read().get(name).map(|e| e.definition.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Substring + sequence-similarity search over the full catalog,
    /// capped at [`MAX_SEARCH_RESULTS`]. Used as the lazy `search_tools`
    /// meta-tool when the agent's always-on tool subset is deliberately
    /// kept small to fit a context budget.
    pub fn search_tools(&self, query: &str) -> Vec<ToolSearchHit> {
        let query_lower = query.to_lowercase();
        let mut scored: Vec<(f64, ToolSearchHit)> = self
            .entries
            .read()
            .iter()
            .map(|(name, entry)| {
                let haystack = format!("{name} {}", entry.definition.description).to_lowercase();
                let score = if haystack.contains(&query_lower) {
                    1.0
                } else {
                    similarity_ratio(&query_lower, &haystack)
                };
                (
                    score,
                    ToolSearchHit {
                        name: name.clone(),
                        description: entry.definition.description.clone(),
                        category: entry.category,
                    },
                )
            })
            .filter(|(score, _)| *score > 0.0)
            .collect();

        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored
            .into_iter()
            .take(MAX_SEARCH_RESULTS)
            .map(|(_, hit)| hit)
            .collect()
    }
}

/// Dice-coefficient character-bigram overlap: a cheap, dependency-free
/// approximation of `difflib.SequenceMatcher.ratio()`.
fn similarity_ratio(a: &str, b: &str) -> f64 {
    let bigrams = |s: &str| -> Vec<(char, char)> {
        let chars: Vec<char> = s.chars().collect();
        chars.windows(2).map(|w| (w[0], w[1])).collect()
    };
    let a_bigrams = bigrams(a);
    let b_bigrams = bigrams(b);
    if a_bigrams.is_empty() || b_bigrams.is_empty() {
        return 0.0;
    }
    let mut b_remaining = b_bigrams.clone();
    let mut matches = 0;
    for bg in &a_bigrams {
        if let Some(pos) = b_remaining.iter().position(|x| x == bg) {
            b_remaining.remove(pos);
            matches += 1;
        }
    }
    (2.0 * matches as f64) / (a_bigrams.len() + b_bigrams.len()) as f64
}
