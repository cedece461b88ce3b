//! MCP tool server hosted by the listener and the stdio bridge.

pub mod http;
pub mod stdio;
pub mod tls;

pub use http::HttpServerManager;
pub use stdio::StdioBridge;

use crate::admission::AdmissionGate;
use crate::config::{McpSettings, RuntimeMode};
use crate::error::ToolError;
use crate::registry::Handles;
use async_trait::async_trait;
use regex::Regex;
use rmcp::{
    model::{
        CallToolRequestParams, CallToolResult, Content, JsonObject, ListToolsResult,
        PaginatedRequestParams, ServerCapabilities, ServerInfo, Tool,
    },
    service::RequestContext,
    ErrorData as McpError, RoleServer, ServerHandler,
};
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How long a tool call waits for an admission permit.
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_millis(1_000);

const MAX_ERROR_MESSAGE_LENGTH: usize = 500;
const FALLBACK_ERROR_MESSAGE: &str = "Unexpected MCP tool error";

static PATH_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"/(?:Users|home|var|tmp|opt|etc|private|Library|Applications|root|srv)(?:/[^\s:]+)+",
        r"[A-Za-z]:\\(?:[^\\\s:]+\\)*[^\\\s:]*",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

static MODULE_PATH_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\b(?:[a-z_][a-z0-9_]*::){2,}[A-Za-z_][A-Za-z0-9_]*\b").ok());

/// The actual tool handlers. Business logic lives behind this trait.
#[async_trait]
pub trait Toolset: Send + Sync {
    /// Tools advertised to clients.
    fn tools(&self) -> Vec<Tool>;

    /// Whether `name` mutates host state and needs explicit opt-in.
    fn is_unsafe(&self, _name: &str) -> bool {
        false
    }

    /// Run a tool and return its text output.
    async fn call(
        &self,
        name: &str,
        arguments: JsonObject,
        context: &ToolContext,
    ) -> Result<String, ToolError>;
}

/// A toolset with no tools.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyToolset;

#[async_trait]
impl Toolset for EmptyToolset {
    fn tools(&self) -> Vec<Tool> {
        Vec::new()
    }

    async fn call(
        &self,
        name: &str,
        _arguments: JsonObject,
        _context: &ToolContext,
    ) -> Result<String, ToolError> {
        Err(ToolError::UnknownTool(name.to_string()))
    }
}

/// Everything a tool call needs for one listener run.
pub struct ToolContext {
    settings: Arc<McpSettings>,
    mode: RuntimeMode,
    handles: Handles,
    toolset: Arc<dyn Toolset>,
    gate: AdmissionGate,
    acquire_timeout: Duration,
}

impl ToolContext {
    pub fn new(
        settings: Arc<McpSettings>,
        mode: RuntimeMode,
        handles: Handles,
        toolset: Arc<dyn Toolset>,
    ) -> Self {
        let gate = AdmissionGate::new(settings.effective_max_concurrent_requests());
        Self {
            settings,
            mode,
            handles,
            toolset,
            gate,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
        }
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn settings(&self) -> &McpSettings {
        &self.settings
    }

    pub fn mode(&self) -> RuntimeMode {
        self.mode
    }

    pub fn handles(&self) -> &Handles {
        &self.handles
    }

    pub fn gate(&self) -> &AdmissionGate {
        &self.gate
    }
}

/// MCP server handler backed by a [`Toolset`].
#[derive(Clone)]
pub struct ToolServer {
    context: Arc<ToolContext>,
}

impl ToolServer {
    pub fn new(context: Arc<ToolContext>) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &ToolContext {
        &self.context
    }

    fn listed_tools(&self) -> Vec<Tool> {
        let settings = self.context.settings();
        self.context
            .toolset
            .tools()
            .into_iter()
            .filter(|tool| settings.is_tool_enabled(&tool.name))
            .collect()
    }

    /// Gate and run one tool call. Failures come back as error results.
    pub async fn invoke(&self, name: &str, arguments: Option<JsonObject>) -> CallToolResult {
        let context = &self.context;
        let toolset = &context.toolset;
        let settings = context.settings();
        let arguments = arguments.unwrap_or_default();
        let has_args = !arguments.is_empty();
        let unsafe_tool = toolset.is_unsafe(name);
        let tool_type = if unsafe_tool { "unsafe" } else { "safe" };

        if !toolset.tools().iter().any(|tool| tool.name == name) {
            warn!(tool = name, reason = "unknown", "MCP tool blocked");
            return ToolError::UnknownTool(name.to_string()).to_tool_result();
        }
        if !settings.is_tool_enabled(name) {
            warn!(tool = name, tool_type, reason = "disabled", "MCP tool blocked");
            return ToolError::Disabled(name.to_string()).to_tool_result();
        }
        if unsafe_tool && !settings.is_unsafe_tool_allowed(name) {
            warn!(tool = name, tool_type, reason = "unsafe_not_allowed", "MCP tool blocked");
            return ToolError::UnsafeNotAllowed(name.to_string()).to_tool_result();
        }
        let Some(_permit) = context.gate.try_acquire(context.acquire_timeout).await else {
            warn!(tool = name, tool_type, reason = "concurrency_limited", "MCP tool blocked");
            return ToolError::Busy.to_tool_result();
        };

        info!(tool = name, tool_type, has_args, "MCP tool started");
        let started = Instant::now();
        let outcome = toolset.call(name, arguments, context).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(output) => {
                info!(
                    tool = name,
                    outcome = "success",
                    duration_ms,
                    output_chars = output.chars().count(),
                    "MCP tool finished"
                );
                CallToolResult::success(vec![Content::text(output)])
            }
            Err(e) => {
                debug!(tool = name, error = %e, "MCP tool error before sanitising");
                info!(tool = name, outcome = "error", duration_ms, "MCP tool finished");
                CallToolResult::error(vec![Content::text(sanitize_error_message(&e.to_string()))])
            }
        }
    }
}

impl ServerHandler for ToolServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            instructions: Some(
                "Local tool server embedded in the host application. \
                 Use tools/list to discover the enabled tools."
                    .to_string(),
            ),
            ..Default::default()
        }
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, McpError> {
        Ok(ListToolsResult::with_all_items(self.listed_tools()))
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        Ok(self.invoke(&request.name, request.arguments).await)
    }
}

/// Strip host paths and internal module paths from an error message,
/// collapse whitespace and cap the length.
pub fn sanitize_error_message(message: &str) -> String {
    let mut message = message.to_string();
    for pattern in PATH_PATTERNS.iter() {
        message = pattern.replace_all(&message, "[path]").into_owned();
    }
    if let Some(pattern) = MODULE_PATH_PATTERN.as_ref() {
        message = pattern.replace_all(&message, "[internal]").into_owned();
    }

    let mut message = message.split_whitespace().collect::<Vec<_>>().join(" ");
    if message.is_empty() {
        message = FALLBACK_ERROR_MESSAGE.to_string();
    }
    if message.chars().count() > MAX_ERROR_MESSAGE_LENGTH {
        let truncated: String = message.chars().take(MAX_ERROR_MESSAGE_LENGTH).collect();
        message = format!("{}...", truncated.trim_end());
    }
    message
}
