//! Embedded MCP server control plane
//!
//! This library keeps a single local MCP (Model Context Protocol) listener
//! alive on a well-known port. It restarts the listener after crashes with a
//! bounded budget, and resolves port contention against a second instance of
//! the same host application through a cooperative takeover handshake over
//! loopback HTTP.
//!
//! # Architecture
//!
//! - **McpSupervisor**: The control-plane state machine. Receives settings,
//!   asks the lifecycle manager to start, and reacts to reported failures
//!   with restarts or takeovers.
//!
//! - **ServerManager**: The lifecycle manager owning the listener.
//!   `HttpServerManager` serves rmcp's streamable HTTP transport plus two
//!   control routes on a hyper listener, over TLS when enabled.
//!
//! - **TakeoverClient**: Probes `/__mcp/health` on the contended port and,
//!   if a sibling instance answers, asks it to release the port through the
//!   authenticated `/__mcp/shutdown` route.
//!
//! - **AdmissionGate**: Bounds concurrently running tool calls.
//!
//! - **HandleRegistry**: Hands out opaque, expiring ids for host objects
//!   that tools pass between calls.
//!
//! # Control routes
//! - `GET /__mcp/health`: `200 ok` with `X-Burp-AI-Agent: mcp`
//! - `POST /__mcp/shutdown`: requires `Authorization: Bearer <token>`
//!
//! All other paths are served by the MCP endpoint.

use std::path::PathBuf;

pub mod admission;
pub mod config;
pub mod error;
pub mod registry;
pub mod server;
pub mod supervisor;

pub use admission::{AdmissionGate, Permit};
pub use config::{McpSettings, PrivacyMode, RuntimeMode};
pub use error::{ConfigError, FailureKind, ServerError, SupervisorError, ToolError};
pub use registry::{HandleRegistry, Handles, HostObject};
pub use server::{EmptyToolset, HttpServerManager, StdioBridge, ToolContext, ToolServer, Toolset};
pub use supervisor::{
    HttpTakeoverClient, McpSupervisor, RestartPolicy, ServerManager, ServerState, SideChannel,
    StateReporter, StatusSnapshot, TakeoverClient, TakeoverOutcome,
};

/// Expand `~/` prefix to the user's home directory.
pub fn expand_path(path: &str) -> PathBuf {
    path.strip_prefix("~/")
        .and_then(|stripped| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(stripped)))
        .unwrap_or_else(|| PathBuf::from(path))
}
