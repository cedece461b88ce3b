//! Streamable HTTP listener with the takeover control routes.
//!
//! Every request first passes the Origin allow-list and the body cap. The
//! two control paths are answered here; everything else goes to rmcp's
//! streamable HTTP service hosting [`ToolServer`]. With `tls_enabled` each
//! connection is wrapped by the acceptor from [`super::tls`].

use crate::config::McpSettings;
use crate::error::ServerError;
use crate::server::{tls, ToolContext, ToolServer};
use crate::supervisor::takeover::{is_loopback_host, HEALTH_PATH, IDENTITY_VALUE, SHUTDOWN_PATH};
use crate::supervisor::{ServerManager, ServerState, StateReporter};
use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Full, Limited};
use hyper::http::header::{AUTHORIZATION, CONTENT_LENGTH, ORIGIN};
use hyper::http::{HeaderName, HeaderValue, Method, Request, Response, StatusCode};
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use rmcp::transport::streamable_http_server::{
    session::local::LocalSessionManager, StreamableHttpServerConfig, StreamableHttpService,
};
use std::collections::HashSet;
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use subtle::ConstantTimeEq;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tower_service::Service;
use tracing::{debug, info, warn};

const SSE_KEEP_ALIVE_SECS: u64 = 15;
const TLS_HANDSHAKE_TIMEOUT_SECS: u64 = 10;

type BoxResponse = Response<BoxBody<Bytes, Infallible>>;
type McpHttpService = ListenerService<StreamableHttpService<ToolServer, LocalSessionManager>>;

fn identity_header() -> HeaderName {
    HeaderName::from_static("x-burp-ai-agent")
}

fn text_response(status: StatusCode, body: &'static str) -> BoxResponse {
    let mut resp = Response::new(Full::new(Bytes::from_static(body.as_bytes())).boxed());
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(identity_header(), HeaderValue::from_static(IDENTITY_VALUE));
    resp
}

/// Exact, case-sensitive `Bearer <token>` check in constant time.
pub fn is_authorized(authorization: Option<&str>, token: &str) -> bool {
    let Some(presented) = authorization.and_then(|v| v.strip_prefix("Bearer ")) else {
        return false;
    };
    !token.is_empty() && bool::from(presented.as_bytes().ct_eq(token.as_bytes()))
}

/// Host part of an `Origin` value such as `http://[::1]:3000`.
fn origin_host(origin: &str) -> Option<&str> {
    let (_, rest) = origin.split_once("://")?;
    let authority = rest.split('/').next().unwrap_or(rest);
    if let Some(v6) = authority.strip_prefix('[') {
        return v6.split(']').next();
    }
    authority.split(':').next()
}

fn normalize_origin(origin: &str) -> &str {
    origin.trim().trim_end_matches('/')
}

/// Per-run state shared by every connection.
struct Control {
    token: String,
    allowed_origins: HashSet<String>,
    max_body_bytes: usize,
    reporter: StateReporter,
    cancel: CancellationToken,
}

impl Control {
    fn new(settings: &McpSettings, reporter: StateReporter, cancel: CancellationToken) -> Self {
        Self {
            token: settings.token.clone(),
            allowed_origins: settings
                .allowed_origins
                .iter()
                .map(|o| normalize_origin(o).to_string())
                .filter(|o| !o.is_empty())
                .collect(),
            max_body_bytes: settings.max_body_bytes,
            reporter,
            cancel,
        }
    }

    fn origin_allowed(&self, origin: &str) -> bool {
        let origin = normalize_origin(origin);
        self.allowed_origins.contains(origin) || origin_host(origin).is_some_and(is_loopback_host)
    }

    fn health(&self, method: &Method) -> BoxResponse {
        if *method != Method::GET {
            return text_response(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed");
        }
        text_response(StatusCode::OK, "ok")
    }

    fn shutdown(&self, method: &Method, authorization: Option<&str>) -> BoxResponse {
        if *method != Method::POST {
            return text_response(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed");
        }
        if !is_authorized(authorization, &self.token) {
            warn!("Rejected MCP shutdown request with missing or invalid token");
            return text_response(StatusCode::UNAUTHORIZED, "Unauthorized");
        }
        if !self.cancel.is_cancelled() {
            info!("MCP shutdown requested by another instance");
            self.reporter.report(ServerState::Stopping);
            self.cancel.cancel();
        }
        text_response(StatusCode::OK, "shutting down")
    }
}

/// Origin check, body cap and control routes in front of the MCP service.
#[derive(Clone)]
struct ListenerService<S> {
    inner: S,
    control: Arc<Control>,
}

impl<B, S> Service<Request<B>> for ListenerService<S>
where
    B: http_body::Body + Send + 'static,
    B::Data: Send,
    B::Error: std::error::Error + Send + Sync + 'static,
    S: Service<Request<Limited<B>>, Response = BoxResponse, Error = Infallible>
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
{
    type Response = BoxResponse;
    type Error = Infallible;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let control = self.control.clone();
        let mut inner = self.inner.clone();
        Box::pin(async move {
            if let Some(origin) = req.headers().get(ORIGIN).and_then(|v| v.to_str().ok()) {
                if !control.origin_allowed(origin) {
                    debug!(origin, "Rejected request from disallowed origin");
                    return Ok(text_response(StatusCode::FORBIDDEN, "Forbidden"));
                }
            }

            let declared = req
                .headers()
                .get(CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            if declared.is_some_and(|len| len > control.max_body_bytes as u64) {
                return Ok(text_response(
                    StatusCode::PAYLOAD_TOO_LARGE,
                    "Payload Too Large",
                ));
            }

            match req.uri().path() {
                HEALTH_PATH => return Ok(control.health(req.method())),
                SHUTDOWN_PATH => {
                    let authorization = req
                        .headers()
                        .get(AUTHORIZATION)
                        .and_then(|v| v.to_str().ok());
                    return Ok(control.shutdown(req.method(), authorization));
                }
                _ => {}
            }

            let max_body_bytes = control.max_body_bytes;
            inner
                .call(req.map(|body| Limited::new(body, max_body_bytes)))
                .await
        })
    }
}

struct RunningListener {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// The concrete lifecycle manager: one hyper listener at a time.
///
/// Listener tasks run on the runtime captured at construction, so `start`
/// and `stop` may be called from threads outside it.
pub struct HttpServerManager {
    runtime: Handle,
    current: Mutex<Option<RunningListener>>,
    shut_down: AtomicBool,
}

impl HttpServerManager {
    /// Must be called inside a tokio runtime.
    pub fn new() -> Self {
        Self::with_runtime(Handle::current())
    }

    pub fn with_runtime(runtime: Handle) -> Self {
        Self {
            runtime,
            current: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        }
    }

    fn take_current(&self) -> Option<RunningListener> {
        self.current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }
}

impl ServerManager for HttpServerManager {
    fn start(&self, settings: Arc<McpSettings>, context: Arc<ToolContext>, reporter: StateReporter) {
        if self.shut_down.load(Ordering::SeqCst) {
            warn!("MCP listener manager is shut down; ignoring start");
            return;
        }

        let cancel = CancellationToken::new();
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        let previous = current.take();
        let task = self.runtime.spawn(run_listener(
            previous,
            settings,
            context,
            reporter,
            cancel.clone(),
        ));
        *current = Some(RunningListener { cancel, task });
    }

    fn stop(&self, reporter: StateReporter) {
        reporter.report(ServerState::Stopping);
        match self.take_current() {
            Some(running) => {
                running.cancel.cancel();
                self.runtime.spawn(async move {
                    let _ = running.task.await;
                    reporter.report(ServerState::Stopped);
                });
            }
            None => reporter.report(ServerState::Stopped),
        }
    }

    fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        if let Some(running) = self.take_current() {
            running.cancel.cancel();
        }
    }
}

async fn run_listener(
    previous: Option<RunningListener>,
    settings: Arc<McpSettings>,
    context: Arc<ToolContext>,
    reporter: StateReporter,
    cancel: CancellationToken,
) {
    if let Some(previous) = previous {
        previous.cancel.cancel();
        let _ = previous.task.await;
    }
    if cancel.is_cancelled() {
        return;
    }

    reporter.report(ServerState::Starting);
    let (listener, tls) = match bind(&settings).await {
        Ok(bound) => bound,
        Err(e) => {
            reporter.report(ServerState::failed(e));
            return;
        }
    };

    let session_manager = Arc::new(LocalSessionManager::default());
    let config = StreamableHttpServerConfig {
        sse_keep_alive: Some(Duration::from_secs(SSE_KEEP_ALIVE_SECS)),
        stateful_mode: true,
        cancellation_token: cancel.child_token(),
        ..Default::default()
    };
    let mcp = StreamableHttpService::new(
        move || Ok(ToolServer::new(context.clone())),
        session_manager,
        config,
    );
    let control = Arc::new(Control::new(&settings, reporter.clone(), cancel.clone()));
    let service = ListenerService {
        inner: mcp,
        control,
    };

    info!("MCP HTTP server listening on {}", settings.base_url());
    reporter.report(ServerState::Running);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("MCP HTTP server shutting down");
                break;
            }
            res = listener.accept() => {
                let stream = match res {
                    Ok((stream, _)) => stream,
                    Err(e) => {
                        reporter.report(ServerState::failed(ServerError::Accept(e)));
                        return;
                    }
                };
                let svc = service.clone();
                let cancel = cancel.clone();
                let tls = tls.clone();
                tokio::spawn(async move {
                    let Some(acceptor) = tls else {
                        serve_connection(stream, svc, cancel).await;
                        return;
                    };
                    let handshake = tokio::time::timeout(
                        Duration::from_secs(TLS_HANDSHAKE_TIMEOUT_SECS),
                        acceptor.accept(stream),
                    );
                    match handshake.await {
                        Ok(Ok(stream)) => serve_connection(stream, svc, cancel).await,
                        Ok(Err(e)) => debug!("TLS handshake failed: {e}"),
                        Err(_) => debug!("TLS handshake timed out"),
                    }
                });
            }
        }
    }

    drop(listener);
    reporter.report(ServerState::Stopped);
}

async fn serve_connection<T>(stream: T, svc: McpHttpService, cancel: CancellationToken)
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let conn = http1::Builder::new()
        .serve_connection(TokioIo::new(stream), TowerToHyperService::new(svc));
    tokio::pin!(conn);
    let result = tokio::select! {
        res = conn.as_mut() => res,
        _ = cancel.cancelled() => {
            conn.as_mut().graceful_shutdown();
            conn.as_mut().await
        }
    };
    if let Err(err) = result {
        debug!("http connection error: {err}");
    }
}

/// Validate the address, prepare TLS if enabled, then bind.
async fn bind(settings: &McpSettings) -> Result<(TcpListener, Option<TlsAcceptor>), ServerError> {
    let host = settings.host.trim();
    if host.is_empty() {
        return Err(ServerError::InvalidAddress("empty host".to_string()));
    }
    if !settings.external_enabled && !is_loopback_host(host) {
        return Err(ServerError::InvalidAddress(format!(
            "{host} is not a loopback address and external access is disabled"
        )));
    }
    let tls = if settings.tls_enabled {
        Some(tls::acceptor(settings)?)
    } else {
        None
    };

    let addr = settings.authority();
    let listener = TcpListener::bind(addr.as_str())
        .await
        .map_err(|source| ServerError::Bind { addr, source })?;
    Ok((listener, tls))
}
