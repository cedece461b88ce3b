//! MCP settings as consumed from the host application.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use uuid::Uuid;

/// Default listen host (loopback only).
pub const DEFAULT_HOST: &str = "127.0.0.1";
/// Default listen port.
pub const DEFAULT_PORT: u16 = 9876;
/// Lower bound for handle TTLs, in minutes.
pub const MIN_TTL_MINUTES: u32 = 5;
/// Upper bound for handle TTLs, in minutes (24 hours).
pub const MAX_TTL_MINUTES: u32 = 24 * 60;
pub const DEFAULT_SCAN_TASK_TTL_MINUTES: u32 = 120;
pub const DEFAULT_COLLABORATOR_CLIENT_TTL_MINUTES: u32 = 60;
const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 4;
const DEFAULT_MAX_BODY_BYTES: usize = 256 * 1024;

/// How much request content tool handlers may expose.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrivacyMode {
    #[default]
    Strict,
    Balanced,
    Off,
}

/// Per-run flags handed to the listener and the tool layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuntimeMode {
    pub privacy: PrivacyMode,
    pub deterministic: bool,
}

/// Settings for the embedded MCP server.
///
/// One applied value is owned by the supervisor until the next
/// `apply_settings` call replaces it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct McpSettings {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    /// Allow the listener to bind a non-loopback host.
    pub external_enabled: bool,
    pub stdio_enabled: bool,
    /// Shared secret for `/__mcp/shutdown`.
    pub token: String,
    pub allowed_origins: Vec<String>,
    pub tls_enabled: bool,
    /// Serve a freshly generated self-signed certificate when no PEM pair
    /// is configured.
    pub tls_auto_generate: bool,
    /// PEM certificate chain for the listener.
    pub tls_cert_path: String,
    /// PEM private key (PKCS#8, PKCS#1 or SEC1).
    pub tls_key_path: String,
    pub scan_task_ttl_minutes: u32,
    pub collaborator_client_ttl_minutes: u32,
    pub max_concurrent_requests: usize,
    pub max_body_bytes: usize,
    pub tool_toggles: HashMap<String, bool>,
    pub enabled_unsafe_tools: Vec<String>,
    pub unsafe_enabled: bool,
}

impl Default for McpSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            external_enabled: false,
            stdio_enabled: false,
            token: generate_token(),
            allowed_origins: Vec::new(),
            tls_enabled: false,
            tls_auto_generate: true,
            tls_cert_path: String::new(),
            tls_key_path: String::new(),
            scan_task_ttl_minutes: DEFAULT_SCAN_TASK_TTL_MINUTES,
            collaborator_client_ttl_minutes: DEFAULT_COLLABORATOR_CLIENT_TTL_MINUTES,
            max_concurrent_requests: DEFAULT_MAX_CONCURRENT_REQUESTS,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            tool_toggles: HashMap::new(),
            enabled_unsafe_tools: Vec::new(),
            unsafe_enabled: false,
        }
    }
}

impl McpSettings {
    /// Load settings from a JSON file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let mut settings: McpSettings =
            serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        settings.allowed_origins = parse_allowed_origins(&settings.allowed_origins.join("\n"));
        Ok(settings)
    }

    /// `host:port`, with IPv6 literals bracketed.
    pub fn authority(&self) -> String {
        let host = self.host.trim();
        if host.contains(':') && !host.starts_with('[') {
            format!("[{host}]:{}", self.port)
        } else {
            format!("{host}:{}", self.port)
        }
    }

    /// Base URL of the listener, scheme chosen by `tls_enabled`.
    pub fn base_url(&self) -> String {
        let scheme = if self.tls_enabled { "https" } else { "http" };
        format!("{scheme}://{}", self.authority())
    }

    /// Both PEM paths are set.
    pub fn has_tls_key_pair(&self) -> bool {
        !self.tls_cert_path.trim().is_empty() && !self.tls_key_path.trim().is_empty()
    }

    pub fn effective_max_concurrent_requests(&self) -> usize {
        self.max_concurrent_requests.max(1)
    }

    /// A tool is enabled unless explicitly toggled off.
    pub fn is_tool_enabled(&self, name: &str) -> bool {
        self.tool_toggles.get(name).copied().unwrap_or(true)
    }

    pub fn is_unsafe_tool_allowed(&self, name: &str) -> bool {
        self.unsafe_enabled || self.enabled_unsafe_tools.iter().any(|t| t == name)
    }
}

/// Clamp a TTL in minutes to `MIN_TTL_MINUTES..=MAX_TTL_MINUTES`.
pub fn clamp_ttl_minutes(minutes: i64) -> u32 {
    minutes.clamp(MIN_TTL_MINUTES as i64, MAX_TTL_MINUTES as i64) as u32
}

/// Generate a fresh random shutdown token (64 hex chars).
pub fn generate_token() -> String {
    format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
}

/// Split a free-form origin list on newlines, commas and semicolons.
pub fn parse_allowed_origins(raw: &str) -> Vec<String> {
    let mut origins: Vec<String> = Vec::new();
    for origin in raw.split(['\n', ',', ';']) {
        let origin = origin.trim();
        if origin.is_empty() || origins.iter().any(|o| o == origin) {
            continue;
        }
        origins.push(origin.to_string());
    }
    origins
}

/// Parse a JSON object of tool toggles. Accepts booleans and "true"/"false"
/// strings; anything unparseable yields an empty map.
pub fn parse_tool_toggles(raw: &str) -> HashMap<String, bool> {
    let Ok(serde_json::Value::Object(map)) = serde_json::from_str(raw) else {
        return HashMap::new();
    };
    map.into_iter()
        .filter_map(|(key, value)| {
            let key = key.trim().to_string();
            let enabled = match value {
                serde_json::Value::Bool(b) => b,
                serde_json::Value::String(s) => s.eq_ignore_ascii_case("true"),
                _ => return None,
            };
            (!key.is_empty()).then_some((key, enabled))
        })
        .collect()
}
