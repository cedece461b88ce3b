//! The same tool server over stdin/stdout.

use crate::config::McpSettings;
use crate::server::{ToolContext, ToolServer};
use crate::supervisor::SideChannel;
use rmcp::transport::stdio;
use rmcp::ServiceExt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const TRANSPORT_POLL_MS: u64 = 200;

struct RunningBridge {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Serves [`ToolServer`] over stdio. At most one bridge runs at a time.
pub struct StdioBridge {
    runtime: Handle,
    current: Mutex<Option<RunningBridge>>,
}

impl StdioBridge {
    /// Must be called inside a tokio runtime.
    pub fn new() -> Self {
        Self::with_runtime(Handle::current())
    }

    pub fn with_runtime(runtime: Handle) -> Self {
        Self {
            runtime,
            current: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|running| !running.task.is_finished())
    }

    fn take_current(&self) -> Option<RunningBridge> {
        self.current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }
}

impl SideChannel for StdioBridge {
    fn start(&self, _settings: Arc<McpSettings>, context: Arc<ToolContext>) {
        let cancel = CancellationToken::new();
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        let previous = current.take();
        let task = self.runtime.spawn(run_bridge(previous, context, cancel.clone()));
        *current = Some(RunningBridge { cancel, task });
    }

    fn stop(&self) {
        if let Some(running) = self.take_current() {
            running.cancel.cancel();
        }
    }
}

async fn run_bridge(
    previous: Option<RunningBridge>,
    context: Arc<ToolContext>,
    cancel: CancellationToken,
) {
    if let Some(previous) = previous {
        previous.cancel.cancel();
        let _ = previous.task.await;
    }
    if cancel.is_cancelled() {
        return;
    }

    info!("MCP server listening on stdio");
    let mut service = match ToolServer::new(context).serve(stdio()).await {
        Ok(running) => Some(running),
        Err(e) => {
            warn!(error = %e, "MCP stdio bridge failed to start");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                if let Some(mut running) = service.take() {
                    if let Err(e) = running.close().await {
                        debug!(error = %e, "MCP stdio bridge close failed");
                    }
                }
                break;
            }
            _ = tokio::time::sleep(Duration::from_millis(TRANSPORT_POLL_MS)) => {
                if service.as_ref().is_some_and(|running| running.is_transport_closed()) {
                    if let Some(running) = service.take() {
                        if let Err(e) = running.waiting().await {
                            debug!(error = %e, "MCP stdio bridge ended with error");
                        }
                    }
                    break;
                }
            }
        }
    }
    info!("MCP stdio bridge stopped");
}
