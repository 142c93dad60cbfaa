//! Polymorphic sandbox runtime trait. An execution sandbox runs code and
//! shell commands; a desktop sandbox additionally drives a virtual
//! display (screenshot, click, type, browser control).

use async_trait::async_trait;
use sa_domain::error::Result;
use serde::{Deserialize, Serialize};

/// Result of running a command inside a sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Capabilities every sandbox backend provides, regardless of kind.
#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    fn sandbox_id(&self) -> &str;

    async fn run_command(&self, command: &str, timeout_ms: u64) -> Result<CommandOutput>;

    async fn read_file(&self, path: &str) -> Result<Vec<u8>>;

    async fn write_file(&self, path: &str, content: &[u8]) -> Result<()>;

    /// A host-reachable URL for a port the sandbox exposes (e.g. a
    /// dev server the agent started inside the sandbox).
    async fn get_host_url(&self, port: u16) -> Result<String>;

    /// Downcast hook so callers holding only `Arc<dyn SandboxRuntime>`
    /// (the session manager's storage type) can reach desktop-only
    /// capabilities like stream readiness. Execution sandboxes keep the
    /// default `None`; desktop implementations override it to `Some(self)`.
    fn as_desktop(&self) -> Option<&dyn DesktopSandbox> {
        None
    }
}

/// Desktop sandboxes add GUI automation and browser control on top of
/// the base command/file capabilities.
#[async_trait]
pub trait DesktopSandbox: SandboxRuntime {
    async fn screenshot(&self) -> Result<Vec<u8>>;

    async fn click(&self, x: i32, y: i32) -> Result<()>;

    async fn double_click(&self, x: i32, y: i32) -> Result<()>;

    /// Types `text` into the focused element. ASCII-only text is typed
    /// directly keystroke-by-keystroke; non-ASCII falls back to
    /// [`DesktopSandbox::type_via_clipboard`].
    async fn type_text(&self, text: &str) -> Result<()> {
        if text.is_ascii() {
            self.type_ascii(text).await
        } else {
            self.type_via_clipboard(text).await
        }
    }

    async fn type_ascii(&self, text: &str) -> Result<()>;

    /// Pastes `text` via the clipboard, holding a short gap (per
    /// `SandboxConfig::clipboard_gap_ms`) on either side of the paste so
    /// the target application's clipboard listener keeps up.
    async fn type_via_clipboard(&self, text: &str) -> Result<()>;

    async fn press_key(&self, key: &str) -> Result<()>;

    async fn scroll(&self, dx: i32, dy: i32) -> Result<()>;

    async fn move_mouse(&self, x: i32, y: i32) -> Result<()>;

    async fn drag(&self, from: (i32, i32), to: (i32, i32)) -> Result<()>;

    async fn wait(&self, ms: u64) -> Result<()>;

    async fn launch_browser(&self, url: &str) -> Result<()>;

    /// A URL the frontend can embed to watch the live desktop stream.
    async fn get_stream_url(&self) -> Result<String>;

    /// Stream endpoint plus an optional auth key, wrapping
    /// [`Self::get_stream_url`] by default. Providers with no native
    /// streaming support override this to return `Ok(None)`; the session
    /// manager then marks the session ready without emitting a
    /// `browser_stream` event, and the client falls back to periodic
    /// screenshots (spec §4.D).
    async fn stream_endpoint(&self) -> Result<Option<(String, Option<String>)>> {
        Ok(Some((self.get_stream_url().await?, None)))
    }

    async fn extract_page_content(&self) -> Result<String>;
}
