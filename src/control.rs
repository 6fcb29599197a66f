use std::{net::SocketAddr, sync::Arc};

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use futures_util::stream::unfold;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::link_core::{CoreHandle, CoreStatus};
use crate::dispatch::Command;
use crate::error::LinkError;
use crate::lifecycle::AppEvent;
use crate::listener::StartOutcome;
use crate::peer::{parse_ipv4, PeerAddress};

#[derive(Clone, Debug)]
pub struct ControlPlane {
    bound_addr: SocketAddr,
}

/// Result of starting the control plane, including the actual bound address.
#[derive(Debug, Clone)]
pub struct ControlPlaneStartResult {
    pub control_plane: ControlPlane,
    pub bound_addr: SocketAddr,
}

struct ControlState {
    token: String,
    core: CoreHandle,
}

impl std::fmt::Debug for ControlState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlState")
            .field("token", &"[redacted]")
            .finish()
    }
}

/// `LinkError` as an HTTP response.
struct ApiError(LinkError);

impl From<LinkError> for ApiError {
    fn from(err: LinkError) -> Self {
        Self(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            LinkError::NoPeer => StatusCode::CONFLICT,
            LinkError::InvalidAddress(_)
            | LinkError::InvalidCommand(_)
            | LinkError::InvalidTarget(_) => StatusCode::BAD_REQUEST,
            LinkError::Bind { .. }
            | LinkError::Listen { .. }
            | LinkError::Send { .. }
            | LinkError::Write { .. } => StatusCode::BAD_GATEWAY,
            LinkError::CoreUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

fn bad_request(msg: String) -> Response {
    (StatusCode::BAD_REQUEST, Json(serde_json::json!({ "error": msg }))).into_response()
}

/// Empty bodies decode as the default request.
fn parse_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, Response> {
    if body.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| bad_request(format!("invalid json body: {e}")))
}

fn parse_optional_ip(raw: Option<&str>) -> Result<Option<std::net::Ipv4Addr>, LinkError> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        Some(ip) => parse_ipv4(ip).map(Some),
        None => Ok(None),
    }
}

impl ControlPlane {
    /// Start the control plane HTTP server.
    ///
    /// Binds `addr`, or an OS-assigned port on the same IP when that fails, and returns the
    /// address actually bound so callers can publish it.
    pub async fn start(
        addr: &str,
        token: Option<String>,
        core: CoreHandle,
        shutdown: Option<Arc<Notify>>,
    ) -> anyhow::Result<ControlPlaneStartResult> {
        let token = token.unwrap_or_else(|| Uuid::new_v4().as_simple().to_string());

        crate::logging::info_kv("control plane starting", &[("requested_addr", addr)]);

        let requested_addr: SocketAddr = match addr.parse() {
            Ok(a) => a,
            Err(e) => {
                crate::logging::error(format!(
                    "control plane failed to parse address '{}': {} - address must be numeric IP (e.g., 127.0.0.1:7938)",
                    addr, e
                ));
                return Err(anyhow::anyhow!(
                    "Invalid address '{}': {} (use numeric IP, not hostname)",
                    addr,
                    e
                ));
            }
        };

        let (listener, bound_addr) = match tokio::net::TcpListener::bind(requested_addr).await {
            Ok(listener) => {
                let bound = listener.local_addr()?;
                (listener, bound)
            }
            Err(e) => {
                crate::logging::info_kv(
                    "control plane requested port unavailable, trying fallback",
                    &[
                        ("requested_addr", &requested_addr.to_string()),
                        ("error", &e.to_string()),
                    ],
                );
                let fallback_addr = SocketAddr::new(requested_addr.ip(), 0);
                match tokio::net::TcpListener::bind(fallback_addr).await {
                    Ok(listener) => {
                        let bound = listener.local_addr()?;
                        (listener, bound)
                    }
                    Err(fallback_err) => {
                        crate::logging::error(format!(
                            "control plane failed to bind: requested={} original={} fallback={}",
                            requested_addr, e, fallback_err
                        ));
                        return Err(anyhow::anyhow!(
                            "Failed to bind control plane: requested {} failed ({}), fallback to port 0 also failed ({})",
                            requested_addr, e, fallback_err
                        ));
                    }
                }
            }
        };

        let app = router(Arc::new(ControlState { token, core }));

        tokio::spawn(async move {
            let result = match shutdown {
                Some(shutdown) => {
                    axum::serve(listener, app)
                        .with_graceful_shutdown(async move {
                            shutdown.notified().await;
                        })
                        .await
                }
                None => axum::serve(listener, app).await,
            };
            if let Err(e) = result {
                crate::logging::error(format!("control plane server error: {}", e));
            }
            crate::logging::info("control plane server stopped");
        });

        crate::logging::info_kv(
            "control plane started",
            &[("bound_addr", &bound_addr.to_string())],
        );

        Ok(ControlPlaneStartResult {
            control_plane: ControlPlane { bound_addr },
            bound_addr,
        })
    }

    pub fn bound_addr(&self) -> SocketAddr {
        self.bound_addr
    }
}

fn router(state: Arc<ControlState>) -> Router {
    let authenticated_routes = Router::new()
        .route("/v1/discovery/start", post(discovery_start))
        .route("/v1/discovery/cancel", post(discovery_cancel))
        .route("/v1/discovery/peers", get(discovery_peers))
        .route("/v1/server/start", post(server_start))
        .route("/v1/server/stop", post(server_stop))
        .route("/v1/sessions", get(sessions))
        .route("/v1/command", post(command))
        .route("/v1/lifecycle", post(lifecycle))
        .route("/v1/events", get(navigation_events))
        .with_state(state.clone())
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    // Status stays public so probes work without the token.
    Router::new()
        .route("/v1/status", get(status))
        .with_state(state)
        .merge(authenticated_routes)
}

async fn auth_middleware(
    State(state): State<Arc<ControlState>>,
    headers: HeaderMap,
    req: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> impl IntoResponse {
    let expected = format!("Bearer {}", state.token);
    if let Some(value) = headers.get(axum::http::header::AUTHORIZATION) {
        if value.to_str().map(|v| v == expected).unwrap_or(false) {
            return next.run(req).await;
        }
    }
    (StatusCode::UNAUTHORIZED, "unauthorized").into_response()
}

#[derive(Serialize)]
struct StatusResponse {
    status: String,
    #[serde(rename = "ts")]
    timestamp: String,
    version: String,
    link: CoreStatus,
}

async fn status(State(state): State<Arc<ControlState>>) -> ApiResult<StatusResponse> {
    let link = state.core.status().await?;
    Ok(Json(StatusResponse {
        status: "ok".to_string(),
        timestamp: Utc::now().to_rfc3339(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        link,
    }))
}

#[derive(Deserialize, Default)]
struct DiscoveryStartRequest {
    #[serde(default)]
    broadcast: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct DiscoveryStartResponse {
    target: SocketAddr,
}

async fn discovery_start(State(state): State<Arc<ControlState>>, body: Bytes) -> Response {
    let req: DiscoveryStartRequest = match parse_body(&body) {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    let result = async {
        let broadcast = parse_optional_ip(req.broadcast.as_deref())?;
        let target = state.core.begin_search(broadcast).await?;
        Ok::<_, LinkError>(DiscoveryStartResponse { target })
    }
    .await;
    match result {
        Ok(r) => Json(r).into_response(),
        Err(err) => ApiError(err).into_response(),
    }
}

async fn discovery_cancel(State(state): State<Arc<ControlState>>) -> ApiResult<serde_json::Value> {
    state.core.cancel_search().await?;
    Ok(Json(serde_json::json!({ "status": "cancelled" })))
}

async fn discovery_peers(
    State(state): State<Arc<ControlState>>,
) -> ApiResult<crate::discovery::DiscoveryStatus> {
    Ok(Json(state.core.discovery_status().await?))
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ServerStartRequest {
    #[serde(default)]
    bind_ip: Option<String>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerStartResponse {
    address: PeerAddress,
    already_running: bool,
}

async fn server_start(State(state): State<Arc<ControlState>>, body: Bytes) -> Response {
    let req: ServerStartRequest = match parse_body(&body) {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    let result = async {
        let bind_ip = parse_optional_ip(req.bind_ip.as_deref())?;
        state.core.start_server(bind_ip).await
    }
    .await;
    match result {
        Ok(outcome) => Json(ServerStartResponse {
            address: outcome.address(),
            already_running: matches!(outcome, StartOutcome::AlreadyRunning(_)),
        })
        .into_response(),
        Err(err) => ApiError(err).into_response(),
    }
}

async fn server_stop(State(state): State<Arc<ControlState>>) -> ApiResult<serde_json::Value> {
    let was_running = state.core.stop_server().await?;
    Ok(Json(serde_json::json!({ "stopped": was_running })))
}

async fn sessions(State(state): State<Arc<ControlState>>) -> ApiResult<serde_json::Value> {
    let sessions = state.core.sessions().await?;
    Ok(Json(serde_json::json!({ "sessions": sessions })))
}

#[derive(Deserialize, Default)]
struct CommandRequest {
    #[serde(default)]
    command: String,
    #[serde(default)]
    target: Option<String>,
    #[serde(default)]
    host: Option<String>,
}

async fn command(State(state): State<Arc<ControlState>>, body: Bytes) -> Response {
    let req: CommandRequest = match parse_body(&body) {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    let result = dispatch_command(&state.core, req).await;
    match result {
        Ok(v) => Json(v).into_response(),
        Err(err) => ApiError(err).into_response(),
    }
}

async fn dispatch_command(
    core: &CoreHandle,
    req: CommandRequest,
) -> Result<serde_json::Value, LinkError> {
    let cmd = Command::parse(&req.command)?;
    match req.target.as_deref() {
        Some("udp") => {
            let host = req.host.as_deref().unwrap_or_default();
            core.send_udp_command(host, &cmd).await?;
            Ok(serde_json::json!({ "sent": cmd, "to": host, "target": "udp" }))
        }
        None | Some("tcp") => {
            let to = core.send_command(&cmd).await?;
            Ok(serde_json::json!({ "sent": cmd, "to": to, "target": "tcp" }))
        }
        Some(other) => Err(LinkError::InvalidTarget(other.to_string())),
    }
}

#[derive(Deserialize)]
struct LifecycleRequest {
    event: AppEvent,
}

async fn lifecycle(State(state): State<Arc<ControlState>>, body: Bytes) -> Response {
    let req: LifecycleRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => return bad_request(format!("invalid lifecycle event: {e}")),
    };
    match state.core.app_event(req.event).await {
        Ok(action) => Json(serde_json::json!({ "action": action })).into_response(),
        Err(err) => ApiError(err).into_response(),
    }
}

async fn navigation_events(State(state): State<Arc<ControlState>>) -> impl IntoResponse {
    let rx = state.core.subscribe();
    let stream = unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(nav) => {
                    let data = serde_json::to_string(&nav).unwrap_or_else(|_| "{}".to_string());
                    let ev = Event::default().event("navigate").data(data);
                    return Some((Ok::<_, std::convert::Infallible>(ev), rx));
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return None,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
            }
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::new().interval(std::time::Duration::from_secs(15)))
}
