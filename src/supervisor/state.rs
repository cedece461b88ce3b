//! Listener state as reported by a lifecycle manager.

use crate::error::{FailureKind, ServerError};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Current state of the MCP listener.
#[derive(Debug, Clone)]
pub enum ServerState {
    Starting,
    Running,
    Stopping,
    Stopped,
    /// The listener failed; carries the triggering error.
    Failed(Arc<ServerError>),
}

impl ServerState {
    pub fn failed(error: ServerError) -> Self {
        ServerState::Failed(Arc::new(error))
    }

    pub fn is_running(&self) -> bool {
        matches!(self, ServerState::Running)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, ServerState::Failed(_))
    }

    /// Classification of the failure, if this is a failed state.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            ServerState::Failed(error) => Some(FailureKind::classify(&**error)),
            _ => None,
        }
    }
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerState::Starting => write!(f, "starting"),
            ServerState::Running => write!(f, "running"),
            ServerState::Stopping => write!(f, "stopping"),
            ServerState::Stopped => write!(f, "stopped"),
            ServerState::Failed(error) => write!(f, "failed: {error}"),
        }
    }
}

/// Point-in-time view of the supervisor.
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub state: ServerState,
    /// When `state` was last reported.
    pub since: DateTime<Utc>,
    pub restart_attempts: u32,
    pub takeover_attempts: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn display_includes_cause() {
        let state = ServerState::failed(ServerError::Internal("boom".to_string()));
        assert_eq!(state.to_string(), "failed: boom");
        assert_eq!(ServerState::Running.to_string(), "running");
    }

    #[test]
    fn failure_kind_only_for_failed() {
        assert_eq!(ServerState::Running.failure_kind(), None);
        let state = ServerState::failed(ServerError::Bind {
            addr: "127.0.0.1:1".to_string(),
            source: io::Error::from(io::ErrorKind::AddrInUse),
        });
        assert_eq!(state.failure_kind(), Some(FailureKind::BindConflict));
        assert!(state.is_failed());
    }
}
