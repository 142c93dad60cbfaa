mod manager;
mod runtime;

pub use manager::{make_session_key, SandboxKind, SandboxMetrics, SandboxProvider, SandboxSessionManager};
pub use runtime::{CommandOutput, DesktopSandbox, SandboxRuntime};
