//! Cooperative port takeover between two instances of the control plane.
//!
//! When our listener cannot bind, whoever holds the port is probed on the
//! health path. Only a listener that answers 2xx *and* carries the identity
//! header is asked to shut down, using the locally configured token.

use crate::config::McpSettings;
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, info};

/// Health path served by every compatible listener.
pub const HEALTH_PATH: &str = "/__mcp/health";
/// Authenticated shutdown path.
pub const SHUTDOWN_PATH: &str = "/__mcp/shutdown";
/// Header proving the listener is one of ours.
pub const IDENTITY_HEADER: &str = "X-Burp-AI-Agent";
pub const IDENTITY_VALUE: &str = "mcp";

/// Timeout for the health probe (connect and read).
const PROBE_TIMEOUT_MS: u64 = 800;
/// Timeout for the shutdown request (connect and read).
const SHUTDOWN_TIMEOUT_MS: u64 = 500;

/// Result of one takeover attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TakeoverOutcome {
    ShutdownRequested,
    NoCompatibleServer,
    ShutdownRejected,
}

/// Talks to whatever currently holds the configured port.
#[async_trait]
pub trait TakeoverClient: Send + Sync {
    /// True only if a compatible instance answers on the health path.
    async fn probe(&self, settings: &McpSettings) -> bool;
    /// True if the instance accepted the authenticated shutdown request.
    async fn request_shutdown(&self, settings: &McpSettings) -> bool;
}

/// Probe, then ask for shutdown only if the probe identified a sibling.
pub async fn attempt_takeover(
    client: &dyn TakeoverClient,
    settings: &McpSettings,
) -> TakeoverOutcome {
    if !client.probe(settings).await {
        return TakeoverOutcome::NoCompatibleServer;
    }
    if client.request_shutdown(settings).await {
        TakeoverOutcome::ShutdownRequested
    } else {
        TakeoverOutcome::ShutdownRejected
    }
}

/// Hosts for which certificate checks may be skipped.
pub fn is_loopback_host(host: &str) -> bool {
    let host = host.trim();
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    host.eq_ignore_ascii_case("localhost") || host == "127.0.0.1" || host == "::1"
}

/// Whether the takeover client trusts any certificate for these settings.
/// Only TLS targets on loopback qualify.
pub fn accepts_invalid_certs(settings: &McpSettings) -> bool {
    settings.tls_enabled && is_loopback_host(&settings.host)
}

/// [`TakeoverClient`] over HTTP(S) with short, fixed timeouts.
#[derive(Debug, Default, Clone, Copy)]
pub struct HttpTakeoverClient;

impl HttpTakeoverClient {
    pub fn new() -> Self {
        Self
    }

    fn client(settings: &McpSettings, timeout: Duration) -> reqwest::Result<Client> {
        let mut builder = Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .no_proxy();
        if accepts_invalid_certs(settings) {
            builder = builder.danger_accept_invalid_certs(true);
        }
        builder.build()
    }
}

#[async_trait]
impl TakeoverClient for HttpTakeoverClient {
    async fn probe(&self, settings: &McpSettings) -> bool {
        let url = format!("{}{HEALTH_PATH}", settings.base_url());
        let result = match Self::client(settings, Duration::from_millis(PROBE_TIMEOUT_MS)) {
            Ok(client) => client.get(&url).send().await,
            Err(e) => Err(e),
        };

        match result {
            Ok(resp) => {
                let identified = resp
                    .headers()
                    .get(IDENTITY_HEADER)
                    .and_then(|v| v.to_str().ok())
                    == Some(IDENTITY_VALUE);
                let compatible = resp.status().is_success() && identified;
                debug!(
                    url = %url,
                    status = %resp.status(),
                    identified,
                    "MCP takeover probe answered"
                );
                compatible
            }
            Err(e) => {
                info!(
                    host = %settings.host,
                    port = settings.port,
                    error = %e,
                    "MCP probe failed"
                );
                false
            }
        }
    }

    async fn request_shutdown(&self, settings: &McpSettings) -> bool {
        let url = format!("{}{SHUTDOWN_PATH}", settings.base_url());
        let result = match Self::client(settings, Duration::from_millis(SHUTDOWN_TIMEOUT_MS)) {
            Ok(client) => client.post(&url).bearer_auth(&settings.token).send().await,
            Err(e) => Err(e),
        };

        match result {
            Ok(resp) if resp.status().is_success() => true,
            Ok(resp) => {
                info!(
                    status = %resp.status(),
                    "MCP remote shutdown request was not accepted"
                );
                false
            }
            Err(e) => {
                info!(error = %e, "MCP remote shutdown request was not accepted");
                false
            }
        }
    }
}
