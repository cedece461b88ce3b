//! Error types for the MCP control plane.
//!
//! Listener failures travel to the supervisor inside `ServerState::Failed` and
//! are classified exactly once into a [`FailureKind`]. Tool execution errors are
//! returned with `is_error: true` in `CallToolResult`, while protocol errors
//! (malformed requests) are handled by rmcp.

use rmcp::model::{CallToolResult, Content};
use std::error::Error as StdError;
use std::io;
use thiserror::Error;

/// Failures reported by a server lifecycle manager.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("invalid listen address {0}")]
    InvalidAddress(String),

    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),

    #[error("{0}")]
    Internal(String),
}

/// How the supervisor should treat a reported failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The port is held by someone else; try the takeover handshake.
    BindConflict,
    /// Anything else a restart might fix.
    Generic,
    /// Configuration problems a restart cannot fix.
    Fatal,
}

impl FailureKind {
    /// Classify an error by walking its cause chain.
    pub fn classify(error: &(dyn StdError + 'static)) -> Self {
        if let Some(server_error) = error.downcast_ref::<ServerError>() {
            if matches!(
                server_error,
                ServerError::InvalidAddress(_) | ServerError::Tls(_)
            ) {
                return FailureKind::Fatal;
            }
        }

        let mut current: Option<&(dyn StdError + 'static)> = Some(error);
        while let Some(err) = current {
            if let Some(io_err) = err.downcast_ref::<io::Error>() {
                if io_err.kind() == io::ErrorKind::AddrInUse {
                    return FailureKind::BindConflict;
                }
            }
            current = err.source();
        }
        FailureKind::Generic
    }
}

/// Settings file problems.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("invalid settings in {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Invalid supervisor construction parameters.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum SupervisorError {
    #[error("{0} must be greater than zero")]
    ZeroDelay(&'static str),
}

/// Tool execution errors - returned with is_error: true in CallToolResult
#[derive(Error, Debug)]
pub enum ToolError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Tool disabled: {0}")]
    Disabled(String),

    #[error("Unsafe mode is disabled for tool: {0}. Enable global unsafe mode or explicitly allow this tool.")]
    UnsafeNotAllowed(String),

    #[error("Too many concurrent MCP requests.")]
    Busy,

    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    #[error("Unknown or expired handle: {0}")]
    UnknownHandle(String),

    #[error("{0}")]
    Failed(String),
}

impl ToolError {
    /// Convert to MCP CallToolResult with is_error: true
    pub fn to_tool_result(&self) -> CallToolResult {
        CallToolResult::error(vec![Content::text(self.to_string())])
    }
}
