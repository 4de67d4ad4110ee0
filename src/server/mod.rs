//! HTTP/SSE server core.
//!
//! Routes `POST /run`, `POST /stream`, `POST /vector/run`,
//! `POST /vector/stream`, and `POST /vector/embeddings/run` behind a shared
//! admission pipeline: CORS, security headers, auth, client rate limiting,
//! content-type and bounded body reads, spec validation, per-route
//! concurrency limiting, and a total-request deadline. Each admitted
//! request gets a fresh coordinator, closed on completion or cancellation.

pub mod auth;
pub mod limiter;
pub mod rate_limit;

use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::Response;
use axum::routing::post;
use axum::Router;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use crate::coordinator::{LlmCoordinator, VectorCoordinator, VectorOperation};
use crate::defaults::Defaults;
use crate::error::{CoordResult, CoordinatorError};
use crate::logging::{log_debug, log_info};
use crate::registry::PluginRegistry;
use crate::spec::{CallSpec, EmbeddingPriorityEntry, StreamEvent};
use crate::stream::EventStream;
use crate::tools::ModuleToolRegistry;

use auth::AuthConfig;
use limiter::{Permit, RouteLimiter};
use rate_limit::ClientRateLimiter;

/// Server knobs: limits, timeouts, CORS, rate limiting, and queueing.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_request_bytes: usize,
    pub body_read_timeout_ms: u64,
    /// 0 disables the total deadline
    pub request_timeout_ms: u64,
    pub stream_idle_timeout_ms: u64,
    pub cors_origins: Vec<String>,
    pub security_headers_enabled: bool,
    pub rate_limit_enabled: bool,
    pub requests_per_minute: u32,
    pub burst: u32,
    pub trust_proxy_headers: bool,
    /// `None` = unlimited
    pub max_concurrent: Option<usize>,
    pub max_queue_size: usize,
    pub queue_timeout_ms: u64,
}

impl ServerConfig {
    pub fn from_defaults(defaults: &Defaults) -> Self {
        let server = &defaults.server;
        Self {
            host: server.host.clone(),
            port: server.port,
            max_request_bytes: server.max_request_bytes,
            body_read_timeout_ms: server.body_read_timeout_ms,
            request_timeout_ms: server.request_timeout_ms,
            stream_idle_timeout_ms: server.stream_idle_timeout_ms,
            cors_origins: server.cors_origins.clone(),
            security_headers_enabled: server.security_headers_enabled,
            rate_limit_enabled: false,
            requests_per_minute: server.requests_per_minute,
            burst: server.burst,
            trust_proxy_headers: server.trust_proxy_headers,
            max_concurrent: server.max_concurrent,
            max_queue_size: server.max_queue_size,
            queue_timeout_ms: server.queue_timeout_ms,
        }
    }
}

struct Limiters {
    run: Arc<RouteLimiter>,
    stream: Arc<RouteLimiter>,
    vector: Arc<RouteLimiter>,
    embeddings: Arc<RouteLimiter>,
}

/// Shared server state.
pub struct AppState {
    registry: Arc<PluginRegistry>,
    defaults: Defaults,
    config: ServerConfig,
    auth: AuthConfig,
    modules: Arc<ModuleToolRegistry>,
    limiters: Limiters,
    rate_limiter: Option<ClientRateLimiter>,
}

impl AppState {
    pub fn new(
        registry: Arc<PluginRegistry>,
        defaults: Defaults,
        config: ServerConfig,
        auth: AuthConfig,
        modules: Arc<ModuleToolRegistry>,
    ) -> Arc<Self> {
        let make_limiter = || {
            RouteLimiter::new(
                config.max_concurrent,
                config.max_queue_size,
                Duration::from_millis(config.queue_timeout_ms),
            )
        };
        let rate_limiter = config.rate_limit_enabled.then(|| {
            ClientRateLimiter::new(
                config.requests_per_minute,
                config.burst,
                config.trust_proxy_headers,
            )
        });
        Arc::new(Self {
            registry,
            defaults,
            auth,
            modules,
            limiters: Limiters {
                run: make_limiter(),
                stream: make_limiter(),
                vector: make_limiter(),
                embeddings: make_limiter(),
            },
            rate_limiter,
            config,
        })
    }

    fn llm_coordinator(&self) -> LlmCoordinator {
        LlmCoordinator::with_modules(
            self.registry.clone(),
            self.defaults.clone(),
            self.modules.clone(),
        )
    }

    fn vector_coordinator(&self) -> VectorCoordinator {
        VectorCoordinator::new(self.registry.clone(), self.defaults.clone())
    }
}

/// Build the router with CORS and security-header layers applied.
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = cors_layer(&state.config.cors_origins);
    let security_enabled = state.config.security_headers_enabled;

    Router::new()
        .route("/run", post(handle_run))
        .route("/stream", post(handle_stream))
        .route("/vector/run", post(handle_vector_run))
        .route("/vector/stream", post(handle_vector_stream))
        .route("/vector/embeddings/run", post(handle_embeddings_run))
        .fallback(handle_not_found)
        .layer(axum::middleware::from_fn(
            move |req: Request, next: axum::middleware::Next| async move {
                let mut response = next.run(req).await;
                if security_enabled {
                    let headers = response.headers_mut();
                    headers.insert(
                        "x-content-type-options",
                        HeaderValue::from_static("nosniff"),
                    );
                    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
                }
                response
            },
        ))
        .layer(cors)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until shutdown.
pub async fn serve(state: Arc<AppState>) -> anyhow::Result<()> {
    let addr = format!("{}:{}", state.config.host, state.config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    log_info!(addr = %addr, "Listening");
    let router = build_router(state);
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::POST, Method::OPTIONS])
        .allow_headers(Any);
    if origins.iter().any(|o| o == "*") {
        layer.allow_origin(Any)
    } else {
        let parsed: Vec<HeaderValue> = origins
            .iter()
            .filter_map(|o| HeaderValue::from_str(o).ok())
            .collect();
        layer.allow_origin(AllowOrigin::list(parsed))
    }
}

// ============================================================================
// Admission pipeline
// ============================================================================

/// Admission steps shared by every route: auth, rate limit, content type,
/// bounded body read.
async fn admit(state: &AppState, req: Request) -> CoordResult<(HeaderMap, Bytes)> {
    let remote = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0)
        .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 0)));
    let (parts, body) = req.into_parts();

    state.auth.authorize(&parts.headers)?;

    if let Some(rate_limiter) = &state.rate_limiter {
        rate_limiter.check(remote, &parts.headers)?;
    }

    let content_type = parts
        .headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !content_type.starts_with("application/json") {
        return Err(CoordinatorError::unsupported_media_type(content_type));
    }

    let limit = state.config.max_request_bytes;
    let read_timeout = Duration::from_millis(state.config.body_read_timeout_ms);
    let bytes = tokio::time::timeout(read_timeout, axum::body::to_bytes(body, limit))
        .await
        .map_err(|_| CoordinatorError::request_timeout(state.config.body_read_timeout_ms))?
        .map_err(|err| {
            if err.to_string().contains("length limit") {
                CoordinatorError::payload_too_large(limit)
            } else {
                CoordinatorError::ClientAborted
            }
        })?;

    Ok((parts.headers, bytes))
}

fn parse_json(bytes: &Bytes) -> CoordResult<Value> {
    serde_json::from_slice(bytes)
        .map_err(|err| CoordinatorError::validation(format!("Invalid JSON: {err}")))
}

fn parse_spec<T: serde::de::DeserializeOwned>(bytes: &Bytes) -> CoordResult<T> {
    let value = parse_json(bytes)?;
    serde_json::from_value(value).map_err(|err| CoordinatorError::validation(err.to_string()))
}

// ============================================================================
// Responses
// ============================================================================

fn json_response(status: StatusCode, body: Value) -> Response {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("static response parts")
}

fn error_response(err: &CoordinatorError) -> Response {
    let status =
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    json_response(
        status,
        json!({
            "type": "error",
            "error": { "code": err.code(), "message": err.public_message() },
        }),
    )
}

async fn handle_not_found() -> Response {
    json_response(
        StatusCode::NOT_FOUND,
        json!({
            "type": "error",
            "error": { "code": "not_found", "message": "Unknown path" },
        }),
    )
}

// ============================================================================
// Unary handlers
// ============================================================================

async fn handle_run(State(state): State<Arc<AppState>>, req: Request) -> Response {
    match run_unary(&state, req).await {
        Ok(response) => response,
        Err(err) => error_response(&err),
    }
}

async fn run_unary(state: &AppState, req: Request) -> CoordResult<Response> {
    let (_headers, bytes) = admit(state, req).await?;
    let spec: CallSpec = parse_spec(&bytes)?;
    spec.validate()?;

    let permit = state.limiters.run.acquire().await?;
    let coordinator = state.llm_coordinator();
    let result = with_deadline(state.config.request_timeout_ms, coordinator.run(&spec)).await;
    coordinator.close().await;
    permit.release();

    let response = result?;
    Ok(json_response(
        StatusCode::OK,
        json!({ "type": "response", "data": response }),
    ))
}

async fn handle_vector_run(State(state): State<Arc<AppState>>, req: Request) -> Response {
    match run_vector(&state, req).await {
        Ok(response) => response,
        Err(err) => error_response(&err),
    }
}

async fn run_vector(state: &AppState, req: Request) -> CoordResult<Response> {
    let (_headers, bytes) = admit(state, req).await?;
    let operation: VectorOperation = parse_spec(&bytes)?;

    let permit = state.limiters.vector.acquire().await?;
    let coordinator = state.vector_coordinator();
    let result = with_deadline(state.config.request_timeout_ms, coordinator.run(operation)).await;
    coordinator.close().await;
    permit.release();

    let data = result?;
    Ok(json_response(
        StatusCode::OK,
        json!({ "type": "response", "data": data }),
    ))
}

/// Body of `POST /vector/embeddings/run`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct EmbedRequest {
    inputs: Vec<String>,
    #[serde(default)]
    embedding_priority: Option<Vec<EmbeddingPriorityEntry>>,
    #[serde(default)]
    stores: Vec<String>,
}

async fn handle_embeddings_run(State(state): State<Arc<AppState>>, req: Request) -> Response {
    match run_embeddings(&state, req).await {
        Ok(response) => response,
        Err(err) => error_response(&err),
    }
}

async fn run_embeddings(state: &AppState, req: Request) -> CoordResult<Response> {
    let (_headers, bytes) = admit(state, req).await?;
    let request: EmbedRequest = parse_spec(&bytes)?;

    let permit = state.limiters.embeddings.acquire().await?;
    let coordinator = state.vector_coordinator();
    let operation = VectorOperation::Embed {
        inputs: request.inputs,
        embedding_priority: request.embedding_priority,
        stores: request.stores,
    };
    let result = with_deadline(state.config.request_timeout_ms, coordinator.run(operation)).await;
    coordinator.close().await;
    permit.release();

    let data = result?;
    Ok(json_response(
        StatusCode::OK,
        json!({ "type": "response", "data": data }),
    ))
}

async fn with_deadline<T>(
    timeout_ms: u64,
    future: impl std::future::Future<Output = CoordResult<T>>,
) -> CoordResult<T> {
    if timeout_ms == 0 {
        return future.await;
    }
    tokio::time::timeout(Duration::from_millis(timeout_ms), future)
        .await
        .map_err(|_| CoordinatorError::timeout(timeout_ms))?
}

// ============================================================================
// Streaming handlers
// ============================================================================

async fn handle_stream(State(state): State<Arc<AppState>>, req: Request) -> Response {
    match run_stream(&state, req).await {
        Ok(response) => response,
        Err(err) => error_response(&err),
    }
}

async fn run_stream(state: &AppState, req: Request) -> CoordResult<Response> {
    let (_headers, bytes) = admit(state, req).await?;
    let spec: CallSpec = parse_spec(&bytes)?;
    spec.validate()?;

    let permit = state.limiters.stream.acquire().await?;
    let coordinator = Arc::new(state.llm_coordinator());
    // Failures before the first event (broken manifests, bad vector
    // config) still map to a plain error status.
    let events = match coordinator.stream(&spec).await {
        Ok(events) => events,
        Err(err) => {
            coordinator.close().await;
            permit.release();
            return Err(err);
        }
    };

    Ok(sse_response(
        events,
        StreamGuard {
            coordinator: Some(coordinator),
            _permit: permit,
        },
        Duration::from_millis(state.config.stream_idle_timeout_ms),
        deadline(state.config.request_timeout_ms),
        state.config.request_timeout_ms,
    ))
}

async fn handle_vector_stream(State(state): State<Arc<AppState>>, req: Request) -> Response {
    match run_vector_stream(&state, req).await {
        Ok(response) => response,
        Err(err) => error_response(&err),
    }
}

async fn run_vector_stream(state: &AppState, req: Request) -> CoordResult<Response> {
    let (_headers, bytes) = admit(state, req).await?;
    let operation: VectorOperation = parse_spec(&bytes)?;

    let permit = state.limiters.vector.acquire().await?;
    let coordinator = state.vector_coordinator();
    let events = coordinator.stream(operation).await;
    coordinator.close().await;
    let events = events?;

    Ok(sse_response(
        events,
        StreamGuard {
            coordinator: None,
            _permit: permit,
        },
        Duration::from_millis(state.config.stream_idle_timeout_ms),
        deadline(state.config.request_timeout_ms),
        state.config.request_timeout_ms,
    ))
}

fn deadline(timeout_ms: u64) -> Option<Instant> {
    (timeout_ms > 0).then(|| Instant::now() + Duration::from_millis(timeout_ms))
}

/// Holds the per-request resources for the lifetime of the SSE body. The
/// permit releases on drop; the coordinator closes on drop via a spawned
/// task (client disconnects included).
struct StreamGuard {
    coordinator: Option<Arc<LlmCoordinator>>,
    _permit: Permit,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        if let Some(coordinator) = self.coordinator.take() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move { coordinator.close().await });
            }
        }
    }
}

struct SseState {
    events: EventStream,
    _guard: StreamGuard,
    idle: Duration,
    deadline: Option<Instant>,
    total_timeout_ms: u64,
    finished: bool,
}

/// Serialize events as `data: <json>\n\n` frames with an idle watchdog and
/// the total-request deadline; both close the stream with a terminal SSE
/// error once headers are out.
fn sse_response(
    events: EventStream,
    guard: StreamGuard,
    idle: Duration,
    deadline: Option<Instant>,
    total_timeout_ms: u64,
) -> Response {
    let state = SseState {
        events,
        _guard: guard,
        idle,
        deadline,
        total_timeout_ms,
        finished: false,
    };

    let frames = futures_util::stream::unfold(state, |mut state| async move {
        if state.finished {
            return None;
        }

        let now = Instant::now();
        let (wait, deadline_is_nearer) = match state.deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(now);
                if remaining < state.idle {
                    (remaining, true)
                } else {
                    (state.idle, false)
                }
            }
            None => (state.idle, false),
        };

        match tokio::time::timeout(wait, state.events.next()).await {
            Ok(Some(event)) => {
                if matches!(event, StreamEvent::Done { .. } | StreamEvent::Error { .. }) {
                    state.finished = true;
                }
                Some((Ok::<Bytes, Infallible>(frame(&event)), state))
            }
            Ok(None) => {
                log_debug!("Event stream ended without a terminal event");
                None
            }
            Err(_) => {
                state.finished = true;
                let err = if deadline_is_nearer {
                    CoordinatorError::timeout(state.total_timeout_ms)
                } else {
                    CoordinatorError::stream_idle_timeout(state.idle.as_millis() as u64)
                };
                let event = StreamEvent::Error {
                    message: err.public_message(),
                    code: err.code().to_string(),
                };
                Some((Ok(frame(&event)), state))
            }
        }
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(frames))
        .expect("static response parts")
}

fn frame(event: &StreamEvent) -> Bytes {
    let encoded = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    Bytes::from(format!("data: {encoded}\n\n"))
}
