use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::{Path as AxumPath, Query, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use keyledger_keys::{KeyError, KeyOrchestrator, Reply, ReplyStatus, Representation};
use keyledger_ledger::Identity;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Header carrying the caller identity unless configured otherwise.
pub const DEFAULT_IDENTITY_HEADER: &str = "x-ledger-identity";

pub struct AppState {
    pub keys: KeyOrchestrator,
    pub identity_header: HeaderName,
    pub node_id: String,
    pub start_time: Instant,
    pub req_count: Arc<AtomicUsize>,
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(keys: KeyOrchestrator, identity_header: HeaderName, node_id: impl Into<String>) -> Self {
        Self {
            keys,
            identity_header,
            node_id: node_id.into(),
            start_time: Instant::now(),
            req_count: Arc::new(AtomicUsize::new(0)),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, handle: Option<PrometheusHandle>) -> Self {
        self.metrics = handle;
        self
    }

    fn record_request(&self) -> u64 {
        self.req_count.fetch_add(1, Ordering::Relaxed) as u64 + 1
    }

    fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Identity the request acts as; a missing or blank header is rejected
    /// before any ledger connection is attempted.
    fn caller_identity(&self, headers: &HeaderMap) -> Result<Identity, ApiError> {
        let identity = headers
            .get(&self.identity_header)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| {
                ApiError::unauthorized(format!("missing {} header", self.identity_header))
            })?;
        Ok(Identity::new(identity))
    }
}

type SharedState = Arc<AppState>;

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    node_id: String,
    uptime_secs: u64,
    req_total: u64,
}

#[derive(Debug, Deserialize)]
struct ResolveQuery {
    #[serde(default)]
    resolve: Option<String>,
}

impl ResolveQuery {
    /// Only the literal `true` asks for resolved output.
    fn representation(&self) -> Representation {
        Representation::from_resolve_flag(self.resolve.as_deref() == Some("true"))
    }
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new<S: Into<String>>(status: StatusCode, message: S) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let payload = Json(ErrorResponse {
            error: self.message,
        });
        (self.status, payload).into_response()
    }
}

impl From<KeyError> for ApiError {
    fn from(err: KeyError) -> Self {
        match err {
            KeyError::Conflict(message) => ApiError::bad_request(message),
            KeyError::InvalidRequest(_) => ApiError::bad_request(err.to_string()),
            KeyError::NotFound { .. } => ApiError::not_found(err.to_string()),
            KeyError::Connection(_) | KeyError::Internal(_) => ApiError::internal(err.to_string()),
        }
    }
}

fn reply_response(reply: Reply) -> Response {
    let status = match reply.status {
        ReplyStatus::Ok => StatusCode::OK,
        ReplyStatus::Created => StatusCode::CREATED,
    };
    (status, Json(reply.body)).into_response()
}

pub async fn start_server(state: AppState, addr: &str) -> Result<()> {
    let shared = Arc::new(state);
    let app = build_router(shared);
    let listener = bind_listener(addr).await?;
    info!("Key registry RPC listening on {}", addr);
    axum::serve(listener, app)
        .await
        .context("RPC server terminated unexpectedly")
}

async fn bind_listener(addr: &str) -> Result<tokio::net::TcpListener> {
    if let Ok(socket_addr) = addr.parse::<SocketAddr>() {
        tokio::net::TcpListener::bind(socket_addr)
            .await
            .with_context(|| format!("failed to bind RPC listener on {socket_addr}"))
    } else {
        tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind RPC listener on {addr}"))
    }
}

pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/metrics", get(handle_metrics))
        .route("/keys", get(handle_list_keys).post(handle_create_key))
        .route("/transactions/keys", post(handle_create_key_by_transaction))
        .route(
            "/keys/:id",
            get(handle_get_key)
                .put(handle_update_key)
                .delete(handle_delete_key),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn handle_health(State(state): State<SharedState>) -> Json<HealthResponse> {
    let req_total = state.record_request();
    Json(HealthResponse {
        status: "ok",
        node_id: state.node_id.clone(),
        uptime_secs: state.uptime_seconds(),
        req_total,
    })
}

async fn handle_metrics(State(state): State<SharedState>) -> Response {
    let req_total = state.record_request();
    let uptime = state.uptime_seconds();

    let mut metrics =
        "# HELP keyledger_http_requests_total Total number of RPC requests handled\n".to_string();
    metrics.push_str("# TYPE keyledger_http_requests_total counter\n");
    metrics.push_str(&format!("keyledger_http_requests_total {req_total}\n"));
    metrics.push_str("# HELP keyledger_uptime_seconds Uptime of the node in seconds\n");
    metrics.push_str("# TYPE keyledger_uptime_seconds gauge\n");
    metrics.push_str(&format!("keyledger_uptime_seconds {uptime}\n"));

    if let Some(handle) = &state.metrics {
        metrics.push_str(&handle.render());
    }

    let mut response = Response::new(Body::from(metrics));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; version=0.0.4"),
    );
    response
}

async fn handle_list_keys(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(query): Query<ResolveQuery>,
) -> Result<Response, ApiError> {
    state.record_request();
    let identity = state.caller_identity(&headers)?;
    let reply = state.keys.list(&identity, query.representation()).await?;
    Ok(reply_response(reply))
}

async fn handle_create_key(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Result<Response, ApiError> {
    state.record_request();
    let identity = state.caller_identity(&headers)?;
    let reply = state.keys.create(&identity, payload).await?;
    Ok(reply_response(reply))
}

async fn handle_create_key_by_transaction(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Result<Response, ApiError> {
    state.record_request();
    let identity = state.caller_identity(&headers)?;
    let reply = state.keys.create_by_transaction(&identity, payload).await?;
    Ok(reply_response(reply))
}

async fn handle_get_key(
    State(state): State<SharedState>,
    AxumPath(id): AxumPath<String>,
    headers: HeaderMap,
    Query(query): Query<ResolveQuery>,
) -> Result<Response, ApiError> {
    state.record_request();
    let identity = state.caller_identity(&headers)?;
    let reply = state
        .keys
        .get(&identity, &id, query.representation())
        .await?;
    Ok(reply_response(reply))
}

async fn handle_update_key(
    State(state): State<SharedState>,
    AxumPath(id): AxumPath<String>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Result<Response, ApiError> {
    state.record_request();
    let identity = state.caller_identity(&headers)?;
    let reply = state.keys.update(&identity, &id, payload).await?;
    Ok(reply_response(reply))
}

async fn handle_delete_key(
    State(state): State<SharedState>,
    AxumPath(id): AxumPath<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    state.record_request();
    let identity = state.caller_identity(&headers)?;
    let reply = state.keys.delete(&identity, &id).await?;
    Ok(reply_response(reply))
}

impl ApiError {
    fn bad_request<S: Into<String>>(message: S) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn unauthorized<S: Into<String>>(message: S) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    fn not_found<S: Into<String>>(message: S) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    fn internal<S: Into<String>>(message: S) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}
