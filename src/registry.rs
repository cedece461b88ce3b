//! Expiring handle registries.
//!
//! Tool handlers hand opaque ids to MCP clients instead of host objects. An id
//! stays resolvable for the configured TTL after it was issued; after that it
//! is evicted lazily by [`HandleRegistry::get`] or eagerly by the background
//! sweeper, whichever comes first.

use crate::config::{
    clamp_ttl_minutes, McpSettings, DEFAULT_COLLABORATOR_CLIENT_TTL_MINUTES,
    DEFAULT_SCAN_TASK_TTL_MINUTES,
};
use std::any::Any;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

/// How often the background sweeper scans for expired entries.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// A host-side object stored behind a handle. Tool handlers downcast it.
pub type HostObject = Arc<dyn Any + Send + Sync>;

/// Sink for expiry and removal events.
pub type RegistryLogger = Arc<dyn Fn(&str) + Send + Sync>;

struct Entry<T> {
    resource: T,
    created_at: Instant,
}

struct Inner<T> {
    name: &'static str,
    entries: Mutex<HashMap<String, Entry<T>>>,
    ttl_ms: AtomicU64,
    logger: RwLock<RegistryLogger>,
}

/// Thread-safe id -> resource map with time-based expiry.
pub struct HandleRegistry<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for HandleRegistry<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> HandleRegistry<T> {
    pub fn new(name: &'static str, ttl_minutes: u32) -> Self {
        let logger: RegistryLogger = Arc::new(move |message: &str| {
            debug!(registry = name, "{message}");
        });
        let ttl = minutes(clamp_ttl_minutes(i64::from(ttl_minutes)));
        Self {
            inner: Arc::new(Inner {
                name,
                entries: Mutex::new(HashMap::new()),
                ttl_ms: AtomicU64::new(ttl.as_millis() as u64),
                logger: RwLock::new(logger),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry<T>>> {
        self.inner
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Store a resource and return its freshly generated id.
    pub fn put(&self, resource: T) -> String {
        let id = Uuid::new_v4().to_string();
        let entry = Entry {
            resource,
            created_at: Instant::now(),
        };
        self.lock().insert(id.clone(), entry);
        id
    }

    /// Resolve an id. Expired entries are removed and reported as absent.
    pub fn get(&self, id: &str) -> Option<T> {
        let now = Instant::now();
        let ttl = self.ttl();
        let expired = {
            let mut entries = self.lock();
            let entry = entries.get(id)?;
            if !is_expired(entry, now, ttl) {
                return Some(entry.resource.clone());
            }
            entries.remove(id).is_some()
        };
        if expired {
            self.log(&format!("Expired {} handle id={id}", self.inner.name));
        }
        None
    }

    /// Remove an id regardless of its age.
    pub fn remove(&self, id: &str) -> Option<T> {
        self.lock().remove(id).map(|entry| entry.resource)
    }

    /// Drop every entry.
    pub fn clear(&self) {
        let removed = {
            let mut entries = self.lock();
            let n = entries.len();
            entries.clear();
            n
        };
        if removed > 0 {
            self.log(&format!(
                "Cleared {removed} {} handle(s)",
                self.inner.name
            ));
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.inner.ttl_ms.load(Ordering::Acquire))
    }

    /// Set the TTL in minutes, clamped to 5 minutes..24 hours. Applies to every
    /// later expiry check, including for entries inserted earlier.
    pub fn configure_ttl_minutes(&self, ttl_minutes: i64) {
        let ttl = minutes(clamp_ttl_minutes(ttl_minutes));
        self.inner
            .ttl_ms
            .store(ttl.as_millis() as u64, Ordering::Release);
    }

    #[cfg(test)]
    pub(crate) fn set_ttl_unclamped(&self, ttl: Duration) {
        self.inner
            .ttl_ms
            .store((ttl.as_millis() as u64).max(1), Ordering::Release);
    }

    pub fn set_logger(&self, logger: RegistryLogger) {
        let mut slot = self.inner.logger.write().unwrap_or_else(|e| e.into_inner());
        *slot = logger;
    }

    /// Evict every expired entry. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let ttl = self.ttl();
        let expired: Vec<String> = {
            let mut entries = self.lock();
            let ids: Vec<String> = entries
                .iter()
                .filter(|(_, entry)| is_expired(entry, now, ttl))
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter(|id| entries.remove(id).is_some())
                .collect()
        };
        for id in &expired {
            self.log(&format!("Expired {} handle id={id}", self.inner.name));
        }
        if !expired.is_empty() {
            self.log(&format!(
                "Removed {} expired {} handle(s)",
                expired.len(),
                self.inner.name
            ));
        }
        expired.len()
    }

    /// Run [`sweep_expired`](Self::sweep_expired) every `period` until `cancel`
    /// fires or the registry is dropped.
    pub fn spawn_sweeper(
        &self,
        runtime: &Handle,
        period: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let weak: Weak<Inner<T>> = Arc::downgrade(&self.inner);
        let name = self.inner.name;
        runtime.spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        HandleRegistry { inner }.sweep_expired();
                    }
                }
            }
            debug!(registry = name, "Handle sweeper stopped");
        })
    }

    fn log(&self, message: &str) {
        let logger = self
            .inner
            .logger
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        // A misbehaving sink must not disturb registry state.
        let _ = catch_unwind(AssertUnwindSafe(|| logger(message)));
    }
}

fn is_expired<T>(entry: &Entry<T>, now: Instant, ttl: Duration) -> bool {
    now.saturating_duration_since(entry.created_at) >= ttl
}

fn minutes(n: u32) -> Duration {
    Duration::from_secs(u64::from(n) * 60)
}

/// The two handle registries the tool layer uses.
#[derive(Clone)]
pub struct Handles {
    pub scan_tasks: HandleRegistry<HostObject>,
    pub collaborator_clients: HandleRegistry<HostObject>,
}

impl Default for Handles {
    fn default() -> Self {
        Self {
            scan_tasks: HandleRegistry::new("scan task", DEFAULT_SCAN_TASK_TTL_MINUTES),
            collaborator_clients: HandleRegistry::new(
                "collaborator client",
                DEFAULT_COLLABORATOR_CLIENT_TTL_MINUTES,
            ),
        }
    }
}

impl Handles {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply the TTLs from `settings`.
    pub fn configure(&self, settings: &McpSettings) {
        self.scan_tasks
            .configure_ttl_minutes(i64::from(settings.scan_task_ttl_minutes));
        self.collaborator_clients
            .configure_ttl_minutes(i64::from(settings.collaborator_client_ttl_minutes));
    }

    pub fn clear(&self) {
        self.scan_tasks.clear();
        self.collaborator_clients.clear();
    }

    pub fn spawn_sweepers(
        &self,
        runtime: &Handle,
        cancel: &CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        vec![
            self.scan_tasks
                .spawn_sweeper(runtime, SWEEP_INTERVAL, cancel.child_token()),
            self.collaborator_clients
                .spawn_sweeper(runtime, SWEEP_INTERVAL, cancel.child_token()),
        ]
    }
}
