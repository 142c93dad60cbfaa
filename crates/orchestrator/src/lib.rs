//! The multi-agent orchestration runtime: supervisor graph, agent
//! subgraphs, sandbox session management, and the streaming event
//! pipeline that ties them together.
//!
//! This crate is transport- and storage-agnostic. `crates/gateway` owns
//! the HTTP/SSE surface, the relational store, and the concrete sandbox
//! provider; this crate owns the graph, the event bus, and the stateful
//! machinery (circuit breaker, guardrails, memory, HITL, usage) that the
//! graph runs on.

pub mod circuit;
pub mod events;
pub mod guardrails;
pub mod hitl;
pub mod memory;
pub mod sandbox;
pub mod skills_ext;
pub mod streaming;
pub mod subgraphs;
pub mod supervisor;
pub mod tools_ext;
pub mod usage;

pub use circuit::{CircuitBreaker, CircuitBreakerRegistry, CircuitState};
pub use events::{Event, EventBus, InterruptKind, InterruptOption, SequencedEvent, StageStatus};
pub use guardrails::GuardrailChain;
pub use hitl::InterruptManager;
pub use memory::{MemoryStore, SharedContext, WindowedMemory};
pub use sandbox::{SandboxKind, SandboxSessionManager};
pub use skills_ext::ProgressiveSkillRegistry;
pub use subgraphs::{ToolDispatchTable, ToolHandler};
pub use supervisor::{run_supervisor, Agent, Handoff, SubgraphBudget, SubgraphRunner, SupervisorState};
pub use tools_ext::ToolRegistry;
pub use usage::UsageTracker;
