//! Sandbox session manager: one live sandbox per (kind, user, task),
//! reused across tool calls within a task until it expires or fails a
//! health check, reaped by a background loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use sa_domain::error::{Error, Result};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::events::{Event, EventBus};

use super::runtime::SandboxRuntime;

/// Which flavor of sandbox a session wraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SandboxKind {
    Execution,
    Desktop,
}

/// Creates a fresh sandbox runtime of the given kind for a session key.
/// Swappable per deployment (local docker, remote provider, etc).
#[async_trait::async_trait]
pub trait SandboxProvider: Send + Sync {
    async fn create(&self, kind: SandboxKind, session_key: &str) -> Result<Arc<dyn SandboxRuntime>>;
}

struct Session {
    runtime: Arc<dyn SandboxRuntime>,
    kind: SandboxKind,
    created_at: Instant,
    last_accessed: Mutex<Instant>,
    timeout: Duration,
    stream_ready: std::sync::atomic::AtomicBool,
    stream_url: Mutex<Option<String>>,
    auth_key: Mutex<Option<String>>,
}

impl Session {
    async fn touch(&self) {
        *self.last_accessed.lock().await = Instant::now();
    }

    async fn is_expired(&self) -> bool {
        self.last_accessed.lock().await.elapsed() > self.timeout
    }
}

#[derive(Debug, Clone, Default)]
pub struct SandboxMetrics {
    pub active_sessions: usize,
    pub total_created: u64,
    pub total_cleaned: u64,
    pub total_reused: u64,
    pub health_check_failures: u64,
}

/// Builds the session key `"{kind}:{user_id|anonymous}:{task_id|default}"`.
/// Distinguishing by `kind` keeps an execution and a desktop sandbox for
/// the same (user, task) pair from colliding in the session map.
pub fn make_session_key(kind: SandboxKind, user_id: &str, task_id: &str) -> String {
    let kind = match kind {
        SandboxKind::Execution => "execution",
        SandboxKind::Desktop => "desktop",
    };
    let user_id = if user_id.is_empty() { "anonymous" } else { user_id };
    let task_id = if task_id.is_empty() { "default" } else { task_id };
    format!("{kind}:{user_id}:{task_id}")
}

struct Counters {
    total_created: u64,
    total_cleaned: u64,
    total_reused: u64,
    health_check_failures: u64,
}

/// Singleton-per-process manager of sandbox sessions.
pub struct SandboxSessionManager {
    provider: Arc<dyn SandboxProvider>,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    counters: Mutex<Counters>,
    default_timeout: Duration,
    cleanup_interval: Duration,
    health_check_timeout: Duration,
    cleanup_task: Mutex<Option<JoinHandle<()>>>,
}

impl SandboxSessionManager {
    pub fn new(
        provider: Arc<dyn SandboxProvider>,
        default_timeout: Duration,
        cleanup_interval: Duration,
        health_check_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            provider,
            sessions: RwLock::new(HashMap::new()),
            counters: Mutex::new(Counters {
                total_created: 0,
                total_cleaned: 0,
                total_reused: 0,
                health_check_failures: 0,
            }),
            default_timeout,
            cleanup_interval,
            health_check_timeout,
            cleanup_task: Mutex::new(None),
        })
    }

    /// Returns the existing healthy session for `session_key`, or
    /// creates and stores a new one. Starts the background reaper on
    /// first call.
    pub async fn get_or_create_sandbox(
        self: &Arc<Self>,
        kind: SandboxKind,
        user_id: &str,
        task_id: &str,
    ) -> Result<Arc<dyn SandboxRuntime>> {
        self.ensure_cleanup_task();
        let key = make_session_key(kind, user_id, task_id);

        if let Some(session) = self.sessions.read().await.get(&key).cloned() {
            if !session.is_expired().await && self.is_sandbox_healthy(&session).await {
                session.touch().await;
                self.counters.lock().await.total_reused += 1;
                return Ok(session.runtime.clone());
            }
            self.cleanup_session(&key).await;
        }

        let runtime = self.provider.create(kind, &key).await?;
        let session = Arc::new(Session {
            runtime: runtime.clone(),
            kind,
            created_at: Instant::now(),
            last_accessed: Mutex::new(Instant::now()),
            timeout: self.default_timeout,
            stream_ready: std::sync::atomic::AtomicBool::new(false),
            stream_url: Mutex::new(None),
            auth_key: Mutex::new(None),
        });
        self.sessions.write().await.insert(key.clone(), session);
        self.counters.lock().await.total_created += 1;
        tracing::info!(session_key = %key, "execution_sandbox_session_created");
        Ok(runtime)
    }

    /// Returns the existing session without creating one.
    pub async fn get_session(&self, kind: SandboxKind, user_id: &str, task_id: &str) -> Option<Arc<dyn SandboxRuntime>> {
        let key = make_session_key(kind, user_id, task_id);
        self.sessions.read().await.get(&key).map(|s| s.runtime.clone())
    }

    async fn is_sandbox_healthy(&self, session: &Session) -> bool {
        let result = tokio::time::timeout(
            self.health_check_timeout,
            session.runtime.run_command("echo health_check", self.health_check_timeout.as_millis() as u64),
        )
        .await;
        match result {
            Ok(Ok(output)) if output.exit_code == 0 && output.stdout.contains("health_check") => true,
            _ => {
                self.counters.lock().await.health_check_failures += 1;
                false
            }
        }
    }

    pub async fn cleanup_session(&self, key: &str) {
        if self.sessions.write().await.remove(key).is_some() {
            self.counters.lock().await.total_cleaned += 1;
            tracing::info!(session_key = %key, "execution_sandbox_session_cleaned");
        }
    }

    /// Frees both the execution and desktop sessions tied to a run. Called
    /// on SSE disconnect so orphaned containers don't linger until TTL.
    pub async fn cleanup_sandboxes_for_task(&self, user_id: &str, task_id: &str) {
        self.cleanup_session(&make_session_key(SandboxKind::Execution, user_id, task_id))
            .await;
        self.cleanup_session(&make_session_key(SandboxKind::Desktop, user_id, task_id))
            .await;
    }

    pub async fn cleanup_expired(&self) {
        let expired: Vec<String> = {
            let sessions = self.sessions.read().await;
            let mut out = Vec::new();
            for (key, session) in sessions.iter() {
                if session.is_expired().await {
                    out.push(key.clone());
                }
            }
            out
        };
        for key in expired {
            self.cleanup_session(&key).await;
        }
    }

    pub async fn cleanup_all(&self) {
        let keys: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        for key in keys {
            self.cleanup_session(&key).await;
        }
        if let Some(handle) = self.cleanup_task.lock().await.take() {
            handle.abort();
        }
    }

    pub async fn get_metrics(&self) -> SandboxMetrics {
        let counters = self.counters.lock().await;
        SandboxMetrics {
            active_sessions: self.sessions.read().await.len(),
            total_created: counters.total_created,
            total_cleaned: counters.total_cleaned,
            total_reused: counters.total_reused,
            health_check_failures: counters.health_check_failures,
        }
    }

    /// Spec §4.D stream readiness. On the first call for a desktop
    /// session: starts the provider's live stream via
    /// [`super::runtime::DesktopSandbox::stream_endpoint`], stores the
    /// URL (+ optional auth key) on the session, waits `wait` to let the
    /// client connect, marks the session `stream_ready`, and emits
    /// exactly one `browser_stream` event onto `bus`. Subsequent calls,
    /// execution-kind sessions, and providers with no native streaming
    /// (`stream_endpoint` returning `Ok(None)`) are no-ops that still
    /// mark the session ready without emitting an event — the client
    /// falls back to periodic screenshots in that case.
    pub async fn ensure_stream_ready(
        &self,
        user_id: &str,
        task_id: &str,
        wait: Duration,
        bus: &EventBus,
    ) -> Result<bool> {
        let key = make_session_key(SandboxKind::Desktop, user_id, task_id);
        let session = {
            let sessions = self.sessions.read().await;
            sessions
                .get(&key)
                .cloned()
                .ok_or_else(|| Error::Sandbox(format!("no session for {key}")))?
        };
        if session.kind != SandboxKind::Desktop {
            return Ok(false);
        }
        let was_ready = session
            .stream_ready
            .swap(true, std::sync::atomic::Ordering::SeqCst);
        if was_ready {
            return Ok(false);
        }

        let Some(desktop) = session.runtime.as_desktop() else {
            // No native desktop capability at all; ready, but nothing to stream.
            return Ok(false);
        };
        let Some((stream_url, auth_key)) = desktop.stream_endpoint().await? else {
            // Provider has no native streaming; fall back to screenshots.
            return Ok(false);
        };
        *session.stream_url.lock().await = Some(stream_url.clone());
        *session.auth_key.lock().await = auth_key.clone();
        tokio::time::sleep(wait).await;
        tracing::info!(session_key = %key, "sandbox_stream_ready");
        bus.emit(Event::BrowserStream {
            stream_url,
            sandbox_id: session.runtime.sandbox_id().to_string(),
            auth_key,
        });
        Ok(true)
    }

    fn ensure_cleanup_task(self: &Arc<Self>) {
        let mut guard = match self.cleanup_task.try_lock() {
            Ok(g) => g,
            Err(_) => return,
        };
        if guard.is_some() {
            return;
        }
        let manager = self.clone();
        let interval = self.cleanup_interval;
        *guard = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                manager.cleanup_expired().await;
            }
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::runtime::{CommandOutput, DesktopSandbox};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FakeRuntime {
        id: String,
        healthy: Arc<std::sync::atomic::AtomicBool>,
    }

    #[async_trait::async_trait]
    impl SandboxRuntime for FakeRuntime {
        fn sandbox_id(&self) -> &str {
            &self.id
        }
        async fn run_command(&self, _command: &str, _timeout_ms: u64) -> Result<CommandOutput> {
            if self.healthy.load(Ordering::SeqCst) {
                Ok(CommandOutput {
                    stdout: "health_check".into(),
                    stderr: String::new(),
                    exit_code: 0,
                })
            } else {
                Ok(CommandOutput {
                    stdout: String::new(),
                    stderr: "down".into(),
                    exit_code: 1,
                })
            }
        }
        async fn read_file(&self, _path: &str) -> Result<Vec<u8>> {
            Ok(vec![])
        }
        async fn write_file(&self, _path: &str, _content: &[u8]) -> Result<()> {
            Ok(())
        }
        async fn get_host_url(&self, _port: u16) -> Result<String> {
            Ok("https://sandbox.local".into())
        }
    }

    struct FakeProvider {
        created: Arc<AtomicU32>,
        healthy: Arc<std::sync::atomic::AtomicBool>,
    }

    #[async_trait::async_trait]
    impl SandboxProvider for FakeProvider {
        async fn create(&self, _kind: SandboxKind, session_key: &str) -> Result<Arc<dyn SandboxRuntime>> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(FakeRuntime {
                id: session_key.to_string(),
                healthy: self.healthy.clone(),
            }))
        }
    }

    /// A desktop-capable runtime, for exercising the actual streaming flow.
    struct FakeDesktopRuntime {
        id: String,
        stream_url: Option<String>,
    }

    #[async_trait::async_trait]
    impl SandboxRuntime for FakeDesktopRuntime {
        fn sandbox_id(&self) -> &str {
            &self.id
        }
        async fn run_command(&self, _command: &str, _timeout_ms: u64) -> Result<CommandOutput> {
            Ok(CommandOutput {
                stdout: "health_check".into(),
                stderr: String::new(),
                exit_code: 0,
            })
        }
        async fn read_file(&self, _path: &str) -> Result<Vec<u8>> {
            Ok(vec![])
        }
        async fn write_file(&self, _path: &str, _content: &[u8]) -> Result<()> {
            Ok(())
        }
        async fn get_host_url(&self, _port: u16) -> Result<String> {
            Ok("https://sandbox.local".into())
        }
        fn as_desktop(&self) -> Option<&dyn DesktopSandbox> {
            Some(self)
        }
    }

    #[async_trait::async_trait]
    impl DesktopSandbox for FakeDesktopRuntime {
        async fn screenshot(&self) -> Result<Vec<u8>> {
            Ok(vec![])
        }
        async fn click(&self, _x: i32, _y: i32) -> Result<()> {
            Ok(())
        }
        async fn double_click(&self, _x: i32, _y: i32) -> Result<()> {
            Ok(())
        }
        async fn type_ascii(&self, _text: &str) -> Result<()> {
            Ok(())
        }
        async fn type_via_clipboard(&self, _text: &str) -> Result<()> {
            Ok(())
        }
        async fn press_key(&self, _key: &str) -> Result<()> {
            Ok(())
        }
        async fn scroll(&self, _dx: i32, _dy: i32) -> Result<()> {
            Ok(())
        }
        async fn move_mouse(&self, _x: i32, _y: i32) -> Result<()> {
            Ok(())
        }
        async fn drag(&self, _from: (i32, i32), _to: (i32, i32)) -> Result<()> {
            Ok(())
        }
        async fn wait(&self, _ms: u64) -> Result<()> {
            Ok(())
        }
        async fn launch_browser(&self, _url: &str) -> Result<()> {
            Ok(())
        }
        async fn get_stream_url(&self) -> Result<String> {
            Ok("https://stream.sandbox.local/default".into())
        }
        async fn stream_endpoint(&self) -> Result<Option<(String, Option<String>)>> {
            match &self.stream_url {
                Some(url) => Ok(Some((url.clone(), Some("auth-token".to_string())))),
                None => Ok(None),
            }
        }
        async fn extract_page_content(&self) -> Result<String> {
            Ok(String::new())
        }
    }

    struct FakeDesktopProvider {
        stream_url: Option<String>,
    }

    #[async_trait::async_trait]
    impl SandboxProvider for FakeDesktopProvider {
        async fn create(&self, _kind: SandboxKind, session_key: &str) -> Result<Arc<dyn SandboxRuntime>> {
            Ok(Arc::new(FakeDesktopRuntime {
                id: session_key.to_string(),
                stream_url: self.stream_url.clone(),
            }))
        }
    }

    fn manager(timeout: Duration, healthy: Arc<std::sync::atomic::AtomicBool>) -> (Arc<SandboxSessionManager>, Arc<AtomicU32>) {
        let created = Arc::new(AtomicU32::new(0));
        let provider = Arc::new(FakeProvider {
            created: created.clone(),
            healthy,
        });
        (
            SandboxSessionManager::new(provider, timeout, Duration::from_secs(3600), Duration::from_millis(500)),
            created,
        )
    }

    #[tokio::test]
    async fn reuses_healthy_session() {
        let healthy = Arc::new(std::sync::atomic::AtomicBool::new(true));
        let (mgr, created) = manager(Duration::from_secs(3600), healthy);
        mgr.get_or_create_sandbox(SandboxKind::Execution, "u1", "t1").await.unwrap();
        mgr.get_or_create_sandbox(SandboxKind::Execution, "u1", "t1").await.unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 1);
        let metrics = mgr.get_metrics().await;
        assert_eq!(metrics.total_reused, 1);
        assert_eq!(metrics.total_created, 1);
    }

    #[tokio::test]
    async fn recreates_when_unhealthy() {
        let healthy = Arc::new(std::sync::atomic::AtomicBool::new(true));
        let (mgr, created) = manager(Duration::from_secs(3600), healthy.clone());
        mgr.get_or_create_sandbox(SandboxKind::Execution, "u1", "t1").await.unwrap();
        healthy.store(false, Ordering::SeqCst);
        mgr.get_or_create_sandbox(SandboxKind::Execution, "u1", "t1").await.unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn recreates_when_expired() {
        let healthy = Arc::new(std::sync::atomic::AtomicBool::new(true));
        let (mgr, created) = manager(Duration::from_millis(1), healthy);
        mgr.get_or_create_sandbox(SandboxKind::Execution, "u1", "t1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        mgr.get_or_create_sandbox(SandboxKind::Execution, "u1", "t1").await.unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cleanup_all_removes_every_session() {
        let healthy = Arc::new(std::sync::atomic::AtomicBool::new(true));
        let (mgr, _created) = manager(Duration::from_secs(3600), healthy);
        mgr.get_or_create_sandbox(SandboxKind::Execution, "u1", "t1").await.unwrap();
        mgr.get_or_create_sandbox(SandboxKind::Execution, "u2", "t2").await.unwrap();
        mgr.cleanup_all().await;
        assert_eq!(mgr.get_metrics().await.active_sessions, 0);
    }

    #[tokio::test]
    async fn stream_ready_fires_once_and_emits_browser_stream() {
        let provider = Arc::new(FakeDesktopProvider {
            stream_url: Some("https://stream.sandbox.local/s1".into()),
        });
        let mgr = SandboxSessionManager::new(provider, Duration::from_secs(3600), Duration::from_secs(3600), Duration::from_millis(500));
        mgr.get_or_create_sandbox(SandboxKind::Desktop, "u1", "t1").await.unwrap();
        let (bus, _rx) = EventBus::new(16);

        let first = mgr.ensure_stream_ready("u1", "t1", Duration::from_millis(1), &bus).await.unwrap();
        let second = mgr.ensure_stream_ready("u1", "t1", Duration::from_millis(1), &bus).await.unwrap();
        assert!(first);
        assert!(!second, "subsequent calls must be no-ops");

        let events = bus.replay();
        let browser_stream_events: Vec<_> = events
            .iter()
            .filter(|e| matches!(e.event, Event::BrowserStream { .. }))
            .collect();
        assert_eq!(browser_stream_events.len(), 1, "exactly one browser_stream event per session");
        match &browser_stream_events[0].event {
            Event::BrowserStream { stream_url, auth_key, .. } => {
                assert_eq!(stream_url, "https://stream.sandbox.local/s1");
                assert_eq!(auth_key.as_deref(), Some("auth-token"));
            }
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn stream_url_and_auth_key_are_stored_on_the_session() {
        let provider = Arc::new(FakeDesktopProvider {
            stream_url: Some("https://stream.sandbox.local/s2".into()),
        });
        let mgr = SandboxSessionManager::new(provider, Duration::from_secs(3600), Duration::from_secs(3600), Duration::from_millis(500));
        mgr.get_or_create_sandbox(SandboxKind::Desktop, "u1", "t1").await.unwrap();
        let (bus, _rx) = EventBus::new(16);
        mgr.ensure_stream_ready("u1", "t1", Duration::from_millis(1), &bus).await.unwrap();

        let key = make_session_key(SandboxKind::Desktop, "u1", "t1");
        let sessions = mgr.sessions.read().await;
        let session = sessions.get(&key).unwrap();
        assert_eq!(session.stream_url.lock().await.as_deref(), Some("https://stream.sandbox.local/s2"));
        assert_eq!(session.auth_key.lock().await.as_deref(), Some("auth-token"));
    }

    #[tokio::test]
    async fn provider_without_native_streaming_marks_ready_without_emitting() {
        // `stream_endpoint` returns `Ok(None)` — the provider has no
        // native streaming (spec §4.D: "(nil, nil)").
        let provider = Arc::new(FakeDesktopProvider { stream_url: None });
        let mgr = SandboxSessionManager::new(provider, Duration::from_secs(3600), Duration::from_secs(3600), Duration::from_millis(500));
        mgr.get_or_create_sandbox(SandboxKind::Desktop, "u1", "t1").await.unwrap();
        let (bus, _rx) = EventBus::new(16);

        let emitted = mgr.ensure_stream_ready("u1", "t1", Duration::from_millis(1), &bus).await.unwrap();
        assert!(!emitted);
        assert!(bus.replay().iter().all(|e| !matches!(e.event, Event::BrowserStream { .. })));
    }

    #[tokio::test]
    async fn execution_sessions_never_report_stream_ready() {
        let healthy = Arc::new(std::sync::atomic::AtomicBool::new(true));
        let (mgr, _created) = manager(Duration::from_secs(3600), healthy);
        mgr.get_or_create_sandbox(SandboxKind::Execution, "u1", "t1").await.unwrap();
        let (bus, _rx) = EventBus::new(16);
        let result = mgr.ensure_stream_ready("u1", "t1", Duration::from_millis(1), &bus).await.unwrap();
        assert!(!result);
    }

    #[test]
    fn make_session_key_includes_kind_and_defaults() {
        assert_eq!(make_session_key(SandboxKind::Execution, "u1", "t1"), "execution:u1:t1");
        assert_eq!(make_session_key(SandboxKind::Desktop, "", ""), "desktop:anonymous:default");
    }
}
