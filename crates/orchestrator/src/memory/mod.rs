//! Agent memory (spec §3/§4.H): a per-run windowed message buffer, a
//! cross-agent shared-context bundle, cross-session deduplicated user
//! memory, and LLM-driven context compression when the window still
//! grows too large.

mod compression;
mod entries;
mod shared;
mod window;

pub use compression::{
    compress_if_needed, estimate_messages_tokens, estimate_tokens, extract_references,
};
pub use entries::{MemoryEntry, MemoryStore, MemoryType};
pub use shared::{CodeArtifact, DataVisualization, HandoffTrailEntry, ResearchSource, SharedContext, WritingState};
pub use window::WindowedMemory;
