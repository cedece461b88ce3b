//! Control plane for the embedded MCP listener.
//!
//! The supervisor keeps exactly one listener running for the applied
//! settings. Lifecycle managers report state transitions over a channel; a
//! single pump task consumes them in order, so a `Running` report always resets
//! the retry budget before a later failure can spend it.
//!
//! # Recovery
//!
//! ```text
//!                    ┌──────────── Running ◀───────────┐
//!                    │                                  │
//! apply_settings ──▶ Starting ──▶ Failed(cause) ──┬─▶ BindConflict ──▶ probe ──▶ shutdown ──▶ retry after takeover delay
//!                                                  ├─▶ Generic ──────▶ retry after restart delay
//!                                                  └─▶ Fatal ────────▶ give up
//! ```
//!
//! Both retry counters are bounded; running out of either is terminal until
//! the next `apply_settings`.

pub mod state;
pub mod takeover;

pub use state::{ServerState, StatusSnapshot};
pub use takeover::{HttpTakeoverClient, TakeoverClient, TakeoverOutcome};

use crate::config::{McpSettings, RuntimeMode};
use crate::error::{FailureKind, ServerError, SupervisorError};
use crate::registry::Handles;
use crate::server::{EmptyToolset, ToolContext, Toolset};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Default number of restarts after generic failures.
pub const DEFAULT_MAX_RESTART_ATTEMPTS: u32 = 4;
/// Default number of takeover handshakes per contention episode.
pub const DEFAULT_MAX_TAKEOVER_ATTEMPTS: u32 = 3;
const DEFAULT_RESTART_DELAY_MS: u64 = 2_000;
const DEFAULT_TAKEOVER_RETRY_DELAY_MS: u64 = 1_000;

/// Bounded retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    pub max_restart_attempts: u32,
    pub max_takeover_attempts: u32,
    pub restart_delay: Duration,
    pub takeover_retry_delay: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restart_attempts: DEFAULT_MAX_RESTART_ATTEMPTS,
            max_takeover_attempts: DEFAULT_MAX_TAKEOVER_ATTEMPTS,
            restart_delay: Duration::from_millis(DEFAULT_RESTART_DELAY_MS),
            takeover_retry_delay: Duration::from_millis(DEFAULT_TAKEOVER_RETRY_DELAY_MS),
        }
    }
}

impl RestartPolicy {
    pub fn validate(&self) -> Result<(), SupervisorError> {
        if self.restart_delay.is_zero() {
            return Err(SupervisorError::ZeroDelay("restart_delay"));
        }
        if self.takeover_retry_delay.is_zero() {
            return Err(SupervisorError::ZeroDelay("takeover_retry_delay"));
        }
        Ok(())
    }
}

/// A state report tagged with the configuration epoch it belongs to.
#[derive(Debug)]
struct Report {
    epoch: u64,
    state: ServerState,
}

/// Callback lifecycle managers use to report state transitions.
#[derive(Clone)]
pub struct StateReporter {
    report: Arc<dyn Fn(ServerState) + Send + Sync>,
}

impl StateReporter {
    pub fn new(report: impl Fn(ServerState) + Send + Sync + 'static) -> Self {
        Self {
            report: Arc::new(report),
        }
    }

    /// A reporter whose reports go nowhere.
    pub fn detached() -> Self {
        Self::new(|_| {})
    }

    pub fn report(&self, state: ServerState) {
        (self.report)(state);
    }
}

impl std::fmt::Debug for StateReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateReporter").finish_non_exhaustive()
    }
}

/// Owns the real network listener.
///
/// Implementations must not block: start and stop do their work in the
/// background and report every transition through the given reporter.
pub trait ServerManager: Send + Sync {
    /// Bind and serve; report `Starting`, then `Running` or `Failed`.
    fn start(&self, settings: Arc<McpSettings>, context: Arc<ToolContext>, reporter: StateReporter);
    /// Tear down gracefully; report `Stopping`, then `Stopped`.
    fn stop(&self, reporter: StateReporter);
    /// Permanent teardown.
    fn shutdown(&self);
}

/// Secondary transport (stdio). Never retried by the supervisor.
pub trait SideChannel: Send + Sync {
    fn start(&self, settings: Arc<McpSettings>, context: Arc<ToolContext>);
    fn stop(&self);
}

struct Inner {
    manager: Arc<dyn ServerManager>,
    side_channel: Option<Arc<dyn SideChannel>>,
    takeover: Arc<dyn TakeoverClient>,
    toolset: Arc<dyn Toolset>,
    handles: Handles,
    policy: RestartPolicy,
    runtime: Handle,
    state: Mutex<(ServerState, DateTime<Utc>)>,
    state_tx: watch::Sender<ServerState>,
    settings: RwLock<Option<Arc<McpSettings>>>,
    mode: Mutex<RuntimeMode>,
    restart_attempts: AtomicU32,
    takeover_attempts: AtomicU32,
    epoch: AtomicU64,
    reports: mpsc::UnboundedSender<Report>,
    pending_retry: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
    cancel: CancellationToken,
}

/// Keeps the MCP listener alive for the applied settings.
pub struct McpSupervisor {
    inner: Arc<Inner>,
}

/// Builder for [`McpSupervisor`].
pub struct SupervisorBuilder {
    manager: Arc<dyn ServerManager>,
    side_channel: Option<Arc<dyn SideChannel>>,
    takeover: Arc<dyn TakeoverClient>,
    toolset: Arc<dyn Toolset>,
    handles: Handles,
    policy: RestartPolicy,
}

impl SupervisorBuilder {
    pub fn side_channel(mut self, side_channel: Arc<dyn SideChannel>) -> Self {
        self.side_channel = Some(side_channel);
        self
    }

    pub fn takeover_client(mut self, takeover: Arc<dyn TakeoverClient>) -> Self {
        self.takeover = takeover;
        self
    }

    pub fn toolset(mut self, toolset: Arc<dyn Toolset>) -> Self {
        self.toolset = toolset;
        self
    }

    pub fn handles(mut self, handles: Handles) -> Self {
        self.handles = handles;
        self
    }

    pub fn policy(mut self, policy: RestartPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Build the supervisor and start its report pump and handle sweepers.
    ///
    /// Must be called inside a tokio runtime. Every later task runs on that
    /// runtime, so the built supervisor may be driven from any thread.
    pub fn build(self) -> Result<McpSupervisor, SupervisorError> {
        self.policy.validate()?;
        let runtime = Handle::current();

        let (reports, rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ServerState::Stopped);
        let cancel = CancellationToken::new();
        let inner = Arc::new(Inner {
            manager: self.manager,
            side_channel: self.side_channel,
            takeover: self.takeover,
            toolset: self.toolset,
            handles: self.handles,
            policy: self.policy,
            runtime,
            state: Mutex::new((ServerState::Stopped, Utc::now())),
            state_tx,
            settings: RwLock::new(None),
            mode: Mutex::new(RuntimeMode::default()),
            restart_attempts: AtomicU32::new(0),
            takeover_attempts: AtomicU32::new(0),
            epoch: AtomicU64::new(0),
            reports,
            pending_retry: Mutex::new(None),
            shut_down: AtomicBool::new(false),
            cancel,
        });

        inner.handles.spawn_sweepers(&inner.runtime, &inner.cancel);
        inner.runtime.spawn(pump(Arc::downgrade(&inner), rx));

        Ok(McpSupervisor { inner })
    }
}

async fn pump(inner: Weak<Inner>, mut rx: mpsc::UnboundedReceiver<Report>) {
    while let Some(report) = rx.recv().await {
        let Some(inner) = inner.upgrade() else { break };
        inner.on_report(report).await;
    }
    debug!("MCP supervisor report pump stopped");
}

impl McpSupervisor {
    pub fn builder(manager: Arc<dyn ServerManager>) -> SupervisorBuilder {
        SupervisorBuilder {
            manager,
            side_channel: None,
            takeover: Arc::new(HttpTakeoverClient::new()),
            toolset: Arc::new(EmptyToolset),
            handles: Handles::new(),
            policy: RestartPolicy::default(),
        }
    }

    /// Apply a new configuration. Never fails; problems surface through
    /// [`status`](Self::status) and the log.
    pub fn apply_settings(&self, settings: McpSettings, mode: RuntimeMode) {
        let inner = &self.inner;
        let settings = Arc::new(settings);
        *inner.settings.write().unwrap_or_else(|e| e.into_inner()) = Some(settings.clone());
        *lock(&inner.mode) = mode;
        inner.handles.configure(&settings);

        if inner.is_shut_down() {
            warn!("MCP supervisor is shut down; settings stored but not applied");
            return;
        }

        if !settings.enabled {
            self.stop();
            return;
        }

        let epoch = inner.next_epoch();
        inner.cancel_pending_retry();
        inner.reset_attempts();
        let context = inner.tool_context(&settings, mode);
        inner.start_listener(settings.clone(), context.clone(), epoch);

        if let Some(side_channel) = &inner.side_channel {
            if settings.stdio_enabled {
                side_channel.start(settings, context);
            } else {
                side_channel.stop();
            }
        }
    }

    /// Current listener state.
    pub fn status(&self) -> ServerState {
        lock(&self.inner.state).0.clone()
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let (state, since) = lock(&self.inner.state).clone();
        StatusSnapshot {
            state,
            since,
            restart_attempts: self.inner.restart_attempts.load(Ordering::SeqCst),
            takeover_attempts: self.inner.takeover_attempts.load(Ordering::SeqCst),
        }
    }

    /// Watch state transitions as they are recorded.
    pub fn subscribe(&self) -> watch::Receiver<ServerState> {
        self.inner.state_tx.subscribe()
    }

    pub fn handles(&self) -> &Handles {
        &self.inner.handles
    }

    /// Stop the listener and side channel, cancel any pending retry and
    /// reset the handle registries. Idempotent.
    pub fn stop(&self) {
        let inner = &self.inner;
        let epoch = inner.next_epoch();
        inner.cancel_pending_retry();
        inner.manager.stop(inner.reporter(epoch));
        inner.reset_attempts();
        if let Some(side_channel) = &inner.side_channel {
            side_channel.stop();
        }
        inner.handles.clear();
    }

    /// Permanent teardown: nothing starts again after this returns. The
    /// listener's final `Stopped` still reaches [`status`](Self::status).
    pub fn shutdown(&self) {
        let inner = &self.inner;
        if inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        inner.cancel_pending_retry();
        inner.manager.shutdown();
        if let Some(side_channel) = &inner.side_channel {
            side_channel.stop();
        }
        inner.cancel.cancel();
        info!("MCP supervisor shut down");
    }
}

impl Drop for McpSupervisor {
    fn drop(&mut self) {
        self.inner.cancel_pending_retry();
        self.inner.cancel.cancel();
    }
}

impl Inner {
    fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    fn next_epoch(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn current_epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    fn reporter(&self, epoch: u64) -> StateReporter {
        let tx = self.reports.clone();
        StateReporter::new(move |state| {
            // The pump may already be gone; nothing left to tell.
            let _ = tx.send(Report { epoch, state });
        })
    }

    fn current_settings(&self) -> Option<Arc<McpSettings>> {
        self.settings
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn reset_attempts(&self) {
        self.restart_attempts.store(0, Ordering::SeqCst);
        self.takeover_attempts.store(0, Ordering::SeqCst);
    }

    fn tool_context(&self, settings: &Arc<McpSettings>, mode: RuntimeMode) -> Arc<ToolContext> {
        Arc::new(ToolContext::new(
            settings.clone(),
            mode,
            self.handles.clone(),
            self.toolset.clone(),
        ))
    }

    fn start_listener(&self, settings: Arc<McpSettings>, context: Arc<ToolContext>, epoch: u64) {
        info!(
            host = %settings.host,
            port = settings.port,
            "Starting MCP server"
        );
        self.manager.start(settings, context, self.reporter(epoch));
    }

    fn cancel_pending_retry(&self) {
        if let Some(handle) = lock(&self.pending_retry).take() {
            handle.abort();
        }
    }

    fn record(&self, state: ServerState) {
        *lock(&self.state) = (state.clone(), Utc::now());
        self.state_tx.send_replace(state);
    }

    async fn on_report(self: &Arc<Self>, report: Report) {
        let Report { epoch, state } = report;
        if epoch != self.current_epoch() {
            debug!(state = %state, epoch, "Ignoring report from a superseded configuration");
            return;
        }
        debug!(state = %state, epoch, "MCP server state reported");
        self.record(state.clone());

        match state {
            ServerState::Running => self.reset_attempts(),
            ServerState::Failed(cause) => self.handle_failure(cause, epoch).await,
            _ => {}
        }
    }

    async fn handle_failure(self: &Arc<Self>, cause: Arc<ServerError>, epoch: u64) {
        if self.is_shut_down() {
            return;
        }
        let Some(settings) = self.current_settings() else {
            return;
        };
        if !settings.enabled {
            return;
        }

        match FailureKind::classify(&*cause) {
            FailureKind::BindConflict => self.handle_bind_failure(&settings, epoch).await,
            FailureKind::Generic => {
                let attempt = self.restart_attempts.fetch_add(1, Ordering::SeqCst) + 1;
                let max = self.policy.max_restart_attempts;
                if attempt > max {
                    error!(
                        attempts = attempt,
                        error = %cause,
                        "MCP server failed repeatedly. Giving up after {attempt} attempts: {cause}"
                    );
                    return;
                }
                warn!(
                    error = %cause,
                    "MCP server failed. Restarting in {}ms (attempt {attempt}/{max}).",
                    self.policy.restart_delay.as_millis()
                );
                self.schedule_start(self.policy.restart_delay, epoch);
            }
            FailureKind::Fatal => {
                error!(
                    host = %settings.host,
                    port = settings.port,
                    error = %cause,
                    "MCP server cannot start with the current settings; not retrying"
                );
            }
        }
    }

    async fn handle_bind_failure(self: &Arc<Self>, settings: &McpSettings, epoch: u64) {
        let authority = settings.authority();
        let max = self.policy.max_takeover_attempts;
        let spent = self.takeover_attempts.load(Ordering::SeqCst);
        if spent >= max {
            error!(
                attempts = spent,
                "MCP bind conflict persists after {spent} takeover attempts. \
                 Port {authority} is still unavailable."
            );
            return;
        }

        match takeover::attempt_takeover(self.takeover.as_ref(), settings).await {
            TakeoverOutcome::ShutdownRequested => {
                let attempt = self.takeover_attempts.fetch_add(1, Ordering::SeqCst) + 1;
                if attempt > max {
                    error!(
                        attempts = attempt,
                        "MCP bind conflict persists after {attempt} takeover attempts. \
                         Port {authority} is still unavailable."
                    );
                    return;
                }
                info!(
                    "MCP bind conflict detected on {authority}. Shutdown requested from existing \
                     MCP server; retrying in {}ms (attempt {attempt}/{max}).",
                    self.policy.takeover_retry_delay.as_millis()
                );
                self.schedule_start(self.policy.takeover_retry_delay, epoch);
            }
            TakeoverOutcome::NoCompatibleServer => {
                error!(
                    "MCP server failed to bind on {authority}. Port appears busy and no \
                     compatible MCP server was detected for takeover."
                );
            }
            TakeoverOutcome::ShutdownRejected => {
                error!(
                    "MCP bind conflict on {authority}. Existing MCP server did not accept \
                     shutdown request."
                );
            }
        }
    }

    /// Start again after `delay`, re-reading the settings at fire time.
    fn schedule_start(self: &Arc<Self>, delay: Duration, epoch: u64) {
        if self.is_shut_down() || epoch != self.current_epoch() {
            return;
        }
        let weak = Arc::downgrade(self);
        let handle = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.fire_retry(epoch);
            }
        });
        if let Some(previous) = lock(&self.pending_retry).replace(handle) {
            previous.abort();
        }
    }

    fn fire_retry(&self, epoch: u64) {
        if self.is_shut_down() || epoch != self.current_epoch() {
            return;
        }
        let Some(settings) = self.current_settings() else {
            return;
        };
        if !settings.enabled {
            return;
        }
        let mode = *lock(&self.mode);
        let context = self.tool_context(&settings, mode);
        self.start_listener(settings, context, epoch);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::HttpServerManager;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::io;
    use std::sync::atomic::AtomicUsize;

    fn bind_failure() -> ServerState {
        ServerState::failed(ServerError::Bind {
            addr: "127.0.0.1:8765".to_string(),
            source: io::Error::new(io::ErrorKind::AddrInUse, "Address already in use"),
        })
    }

    fn generic_failure() -> ServerState {
        ServerState::failed(ServerError::Internal("boom".to_string()))
    }

    /// Reports a scripted sequence of states for each start call.
    struct ScriptedManager {
        script: Mutex<VecDeque<Vec<ServerState>>>,
        fallback: Vec<ServerState>,
        starts: AtomicUsize,
        stops: AtomicUsize,
    }

    impl ScriptedManager {
        fn new(script: Vec<Vec<ServerState>>, fallback: Vec<ServerState>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                fallback,
                starts: AtomicUsize::new(0),
                stops: AtomicUsize::new(0),
            })
        }

        fn starts(&self) -> usize {
            self.starts.load(Ordering::SeqCst)
        }
    }

    impl ServerManager for ScriptedManager {
        fn start(&self, _settings: Arc<McpSettings>, _context: Arc<ToolContext>, reporter: StateReporter) {
            self.starts.fetch_add(1, Ordering::SeqCst);
            let states = lock(&self.script)
                .pop_front()
                .unwrap_or_else(|| self.fallback.clone());
            reporter.report(ServerState::Starting);
            for state in states {
                reporter.report(state);
            }
        }

        fn stop(&self, reporter: StateReporter) {
            self.stops.fetch_add(1, Ordering::SeqCst);
            reporter.report(ServerState::Stopping);
            reporter.report(ServerState::Stopped);
        }

        fn shutdown(&self) {}
    }

    struct FakeTakeover {
        probe: bool,
        shutdown: bool,
        probes: AtomicUsize,
        shutdowns: AtomicUsize,
    }

    impl FakeTakeover {
        fn new(probe: bool, shutdown: bool) -> Arc<Self> {
            Arc::new(Self {
                probe,
                shutdown,
                probes: AtomicUsize::new(0),
                shutdowns: AtomicUsize::new(0),
            })
        }

        fn probes(&self) -> usize {
            self.probes.load(Ordering::SeqCst)
        }

        fn shutdowns(&self) -> usize {
            self.shutdowns.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TakeoverClient for FakeTakeover {
        async fn probe(&self, _settings: &McpSettings) -> bool {
            self.probes.fetch_add(1, Ordering::SeqCst);
            self.probe
        }

        async fn request_shutdown(&self, _settings: &McpSettings) -> bool {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            self.shutdown
        }
    }

    #[derive(Default)]
    struct CountingSideChannel {
        starts: AtomicUsize,
        stops: AtomicUsize,
    }

    impl SideChannel for CountingSideChannel {
        fn start(&self, _settings: Arc<McpSettings>, _context: Arc<ToolContext>) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }

        fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn policy(max_restart_attempts: u32, max_takeover_attempts: u32) -> RestartPolicy {
        RestartPolicy {
            max_restart_attempts,
            max_takeover_attempts,
            restart_delay: Duration::from_millis(10),
            takeover_retry_delay: Duration::from_millis(10),
        }
    }

    fn settings(enabled: bool) -> McpSettings {
        McpSettings {
            enabled,
            host: "127.0.0.1".to_string(),
            port: 8765,
            token: "token".to_string(),
            ..Default::default()
        }
    }

    fn supervisor(
        manager: &Arc<ScriptedManager>,
        takeover: &Arc<FakeTakeover>,
        policy: RestartPolicy,
    ) -> McpSupervisor {
        McpSupervisor::builder(manager.clone())
            .takeover_client(takeover.clone())
            .policy(policy)
            .build()
            .expect("valid policy")
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        condition()
    }

    /// Let the pump and any scheduled retries drain.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(80)).await;
    }

    #[tokio::test]
    async fn bind_conflict_takes_over_then_runs() {
        let manager = ScriptedManager::new(
            vec![vec![bind_failure()], vec![ServerState::Running]],
            vec![ServerState::Running],
        );
        let takeover = FakeTakeover::new(true, true);
        let supervisor = supervisor(&manager, &takeover, policy(2, 2));

        supervisor.apply_settings(settings(true), RuntimeMode::default());

        assert!(wait_until(|| supervisor.status().is_running() && manager.starts() == 2).await);
        settle().await;
        assert_eq!(manager.starts(), 2);
        assert_eq!(takeover.probes(), 1);
        assert_eq!(takeover.shutdowns(), 1);
        assert!(supervisor.status().is_running());
        let snapshot = supervisor.snapshot();
        assert_eq!(snapshot.takeover_attempts, 0);
        assert_eq!(snapshot.restart_attempts, 0);

        supervisor.shutdown();
    }

    #[tokio::test]
    async fn generic_failures_stop_after_budget() {
        let manager = ScriptedManager::new(vec![], vec![generic_failure()]);
        let takeover = FakeTakeover::new(false, false);
        let supervisor = supervisor(&manager, &takeover, policy(2, 1));

        supervisor.apply_settings(settings(true), RuntimeMode::default());

        assert!(wait_until(|| manager.starts() >= 3).await);
        settle().await;
        assert_eq!(manager.starts(), 3);
        assert_eq!(takeover.probes(), 0);
        assert_eq!(takeover.shutdowns(), 0);
        assert!(supervisor.status().is_failed());

        supervisor.shutdown();
    }

    #[tokio::test]
    async fn persistent_bind_conflict_is_bounded() {
        let manager = ScriptedManager::new(vec![], vec![bind_failure()]);
        let takeover = FakeTakeover::new(true, true);
        let supervisor = supervisor(&manager, &takeover, policy(4, 2));

        supervisor.apply_settings(settings(true), RuntimeMode::default());

        assert!(wait_until(|| manager.starts() >= 3).await);
        settle().await;
        assert_eq!(manager.starts(), 3);
        assert_eq!(takeover.shutdowns(), 2);
        assert!(supervisor.status().is_failed());

        supervisor.shutdown();
    }

    #[tokio::test]
    async fn zero_takeover_budget_never_requests_shutdown() {
        let manager = ScriptedManager::new(vec![], vec![bind_failure()]);
        let takeover = FakeTakeover::new(true, true);
        let supervisor = supervisor(&manager, &takeover, policy(4, 0));

        supervisor.apply_settings(settings(true), RuntimeMode::default());
        settle().await;

        assert_eq!(manager.starts(), 1);
        assert_eq!(takeover.shutdowns(), 0);
        supervisor.shutdown();
    }

    #[tokio::test]
    async fn unidentified_listener_is_left_alone() {
        let manager = ScriptedManager::new(vec![], vec![bind_failure()]);
        let takeover = FakeTakeover::new(false, true);
        let supervisor = supervisor(&manager, &takeover, policy(2, 2));

        supervisor.apply_settings(settings(true), RuntimeMode::default());

        assert!(wait_until(|| takeover.probes() == 1).await);
        settle().await;
        assert_eq!(manager.starts(), 1);
        assert_eq!(takeover.probes(), 1);
        assert_eq!(takeover.shutdowns(), 0);
        assert!(supervisor.status().is_failed());

        supervisor.shutdown();
    }

    #[tokio::test]
    async fn rejected_shutdown_is_terminal() {
        let manager = ScriptedManager::new(vec![], vec![bind_failure()]);
        let takeover = FakeTakeover::new(true, false);
        let supervisor = supervisor(&manager, &takeover, policy(2, 2));

        supervisor.apply_settings(settings(true), RuntimeMode::default());
        settle().await;

        assert_eq!(manager.starts(), 1);
        assert_eq!(takeover.shutdowns(), 1);
        assert!(supervisor.status().is_failed());
        supervisor.shutdown();
    }

    #[tokio::test]
    async fn running_restores_the_retry_budget() {
        let manager = ScriptedManager::new(
            vec![
                vec![generic_failure()],
                vec![generic_failure()],
                vec![ServerState::Running, generic_failure()],
            ],
            vec![generic_failure()],
        );
        let takeover = FakeTakeover::new(false, false);
        let supervisor = supervisor(&manager, &takeover, policy(2, 2));

        supervisor.apply_settings(settings(true), RuntimeMode::default());

        // Without the reset the third start's failure would exhaust the budget.
        assert!(wait_until(|| manager.starts() >= 5).await);
        settle().await;
        assert_eq!(manager.starts(), 5);
        assert!(supervisor.status().is_failed());
        assert_eq!(supervisor.snapshot().restart_attempts, 3);

        supervisor.shutdown();
    }

    #[tokio::test]
    async fn fatal_failures_are_not_retried() {
        let manager = ScriptedManager::new(
            vec![],
            vec![ServerState::failed(ServerError::Tls("no certificate".to_string()))],
        );
        let takeover = FakeTakeover::new(true, true);
        let supervisor = supervisor(&manager, &takeover, policy(2, 2));

        supervisor.apply_settings(settings(true), RuntimeMode::default());
        settle().await;

        assert_eq!(manager.starts(), 1);
        assert_eq!(takeover.probes(), 0);
        supervisor.shutdown();
    }

    #[tokio::test]
    async fn disabled_settings_stop_without_starting() {
        let manager = ScriptedManager::new(vec![], vec![ServerState::Running]);
        let takeover = FakeTakeover::new(true, true);
        let side = Arc::new(CountingSideChannel::default());
        let supervisor = McpSupervisor::builder(manager.clone())
            .takeover_client(takeover.clone())
            .side_channel(side.clone())
            .policy(policy(2, 2))
            .build()
            .expect("valid policy");

        supervisor.apply_settings(settings(false), RuntimeMode::default());

        assert!(wait_until(|| matches!(supervisor.status(), ServerState::Stopped)).await);
        assert_eq!(manager.starts(), 0);
        assert_eq!(manager.stops.load(Ordering::SeqCst), 1);
        assert_eq!(side.stops.load(Ordering::SeqCst), 1);
        supervisor.shutdown();
    }

    #[tokio::test]
    async fn disabling_cancels_a_pending_retry() {
        let manager = ScriptedManager::new(vec![], vec![generic_failure()]);
        let takeover = FakeTakeover::new(false, false);
        let mut slow = policy(5, 5);
        slow.restart_delay = Duration::from_millis(100);
        let supervisor = supervisor(&manager, &takeover, slow);

        supervisor.apply_settings(settings(true), RuntimeMode::default());
        assert!(wait_until(|| supervisor.status().is_failed()).await);
        supervisor.apply_settings(settings(false), RuntimeMode::default());

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(manager.starts(), 1);
        supervisor.shutdown();
    }

    #[tokio::test]
    async fn shutdown_cancels_retries_and_is_idempotent() {
        let manager = ScriptedManager::new(vec![], vec![generic_failure()]);
        let takeover = FakeTakeover::new(false, false);
        let mut slow = policy(5, 5);
        slow.restart_delay = Duration::from_millis(100);
        let supervisor = supervisor(&manager, &takeover, slow);

        supervisor.apply_settings(settings(true), RuntimeMode::default());
        assert!(wait_until(|| supervisor.status().is_failed()).await);
        supervisor.shutdown();
        supervisor.shutdown();
        supervisor.apply_settings(settings(true), RuntimeMode::default());

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(manager.starts(), 1);
    }

    #[tokio::test]
    async fn stale_failures_do_not_restart_a_stopped_server() {
        let manager = ScriptedManager::new(vec![vec![ServerState::Running]], vec![]);
        let takeover = FakeTakeover::new(false, false);
        let supervisor = supervisor(&manager, &takeover, policy(2, 2));

        supervisor.apply_settings(settings(true), RuntimeMode::default());
        assert!(wait_until(|| supervisor.status().is_running()).await);
        let old_reporter = supervisor.inner.reporter(supervisor.inner.current_epoch());
        supervisor.stop();
        old_reporter.report(generic_failure());

        settle().await;
        assert_eq!(manager.starts(), 1);
        assert!(matches!(supervisor.status(), ServerState::Stopped));
        supervisor.shutdown();
    }

    #[tokio::test]
    async fn stale_reports_leave_status_and_budget_alone() {
        let manager = ScriptedManager::new(
            vec![vec![ServerState::Running], vec![generic_failure()]],
            vec![generic_failure()],
        );
        let takeover = FakeTakeover::new(false, false);
        let mut slow = policy(5, 5);
        slow.restart_delay = Duration::from_secs(30);
        let supervisor = supervisor(&manager, &takeover, slow);

        supervisor.apply_settings(settings(true), RuntimeMode::default());
        assert!(wait_until(|| supervisor.status().is_running()).await);
        let old_reporter = supervisor.inner.reporter(supervisor.inner.current_epoch());

        supervisor.apply_settings(settings(true), RuntimeMode::default());
        assert!(wait_until(|| supervisor.status().is_failed()).await);
        assert_eq!(supervisor.snapshot().restart_attempts, 1);

        // The first listener winding down late must not mask the new failure.
        old_reporter.report(ServerState::Running);
        old_reporter.report(ServerState::Stopped);
        settle().await;
        assert!(supervisor.status().is_failed());
        assert_eq!(supervisor.snapshot().restart_attempts, 1);
        supervisor.shutdown();
    }

    #[tokio::test]
    async fn stdio_side_channel_follows_settings() {
        let manager = ScriptedManager::new(vec![], vec![ServerState::Running]);
        let takeover = FakeTakeover::new(false, false);
        let side = Arc::new(CountingSideChannel::default());
        let supervisor = McpSupervisor::builder(manager.clone())
            .takeover_client(takeover)
            .side_channel(side.clone())
            .build()
            .expect("valid policy");

        let mut with_stdio = settings(true);
        with_stdio.stdio_enabled = true;
        supervisor.apply_settings(with_stdio, RuntimeMode::default());
        assert_eq!(side.starts.load(Ordering::SeqCst), 1);

        supervisor.apply_settings(settings(true), RuntimeMode::default());
        assert_eq!(side.stops.load(Ordering::SeqCst), 1);
        supervisor.shutdown();
    }

    #[tokio::test]
    async fn settings_configure_handle_ttls_and_stop_clears_them() {
        let manager = ScriptedManager::new(vec![], vec![ServerState::Running]);
        let takeover = FakeTakeover::new(false, false);
        let supervisor = supervisor(&manager, &takeover, policy(2, 2));

        let mut custom = settings(true);
        custom.scan_task_ttl_minutes = 30;
        custom.collaborator_client_ttl_minutes = 10_000;
        supervisor.apply_settings(custom, RuntimeMode::default());

        let handles = supervisor.handles();
        assert_eq!(handles.scan_tasks.ttl(), Duration::from_secs(30 * 60));
        assert_eq!(
            handles.collaborator_clients.ttl(),
            Duration::from_secs(24 * 60 * 60)
        );

        handles.scan_tasks.put(Arc::new(1_u8));
        supervisor.stop();
        assert!(handles.scan_tasks.is_empty());
        supervisor.shutdown();
    }

    fn free_port() -> u16 {
        let socket = std::net::TcpListener::bind("127.0.0.1:0").expect("bind ephemeral");
        socket.local_addr().expect("local addr").port()
    }

    fn http_supervisor(policy: RestartPolicy) -> McpSupervisor {
        McpSupervisor::builder(Arc::new(HttpServerManager::new()))
            .policy(policy)
            .build()
            .expect("valid policy")
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn host_threads_can_drive_the_supervisor() {
        let supervisor = Arc::new(http_supervisor(policy(2, 2)));
        let mut config = settings(true);
        config.port = free_port();

        let host = supervisor.clone();
        std::thread::spawn(move || host.apply_settings(config, RuntimeMode::default()))
            .join()
            .expect("apply_settings from a host thread");
        assert!(wait_until(|| supervisor.status().is_running()).await);

        let host = supervisor.clone();
        std::thread::spawn(move || host.stop())
            .join()
            .expect("stop from a host thread");
        assert!(wait_until(|| matches!(supervisor.status(), ServerState::Stopped)).await);

        let host = supervisor.clone();
        std::thread::spawn(move || host.shutdown())
            .join()
            .expect("shutdown from a host thread");
    }

    async fn second_instance_takes_over(tls: bool) {
        let mut config = settings(true);
        config.port = free_port();
        config.tls_enabled = tls;
        let mut patient = policy(2, 2);
        patient.takeover_retry_delay = Duration::from_millis(300);

        let first = http_supervisor(patient);
        first.apply_settings(config.clone(), RuntimeMode::default());
        assert!(wait_until(|| first.status().is_running()).await);

        let second = http_supervisor(patient);
        second.apply_settings(config, RuntimeMode::default());

        assert!(wait_until(|| second.status().is_running()).await);
        assert!(wait_until(|| matches!(first.status(), ServerState::Stopped)).await);
        assert_eq!(second.snapshot().takeover_attempts, 0);

        second.shutdown();
        first.shutdown();
    }

    #[tokio::test]
    async fn second_instance_takes_over_the_port() {
        second_instance_takes_over(false).await;
    }

    #[tokio::test]
    async fn second_instance_takes_over_a_tls_port() {
        second_instance_takes_over(true).await;
    }

    #[test]
    fn zero_delays_are_rejected() {
        let mut policy = RestartPolicy::default();
        policy.restart_delay = Duration::ZERO;
        assert_eq!(
            policy.validate(),
            Err(SupervisorError::ZeroDelay("restart_delay"))
        );
    }
}
