//! HTTP API server.
//!
//! Exposes the pipeline, run status and chat over a JSON HTTP API, plus a
//! WebSocket channel for pushed progress (see [`crate::ws`]).
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Liveness, version, uptime and collaborator info |
//! | `GET`  | `/metrics` | Aggregate pipeline metrics |
//! | `POST` | `/process` | Run the pipeline (multipart upload or JSON source) |
//! | `POST` | `/process-url` | Run the pipeline on a URL |
//! | `GET`  | `/process/{id}/status` | Ledger status of a run |
//! | `POST` | `/chat` | Send a chat message about a processed document |
//! | `GET`  | `/ws` | WebSocket: progress events and chat |
//!
//! # Response envelope
//!
//! Every response, success or failure, uses the same envelope:
//!
//! ```json
//! {
//!   "success": false,
//!   "error": { "code": "UNSUPPORTED_MODEL", "message": "...", "stage": "optimizeContext" },
//!   "metadata": { "timestamp": "...", "requestId": "..." }
//! }
//! ```
//!
//! Status mapping: rate limits 429 (with `Retry-After`), bad input 400,
//! unsupported media 415, payload too large 413, unsupported model, format
//! or budget 422, unknown run 404, stage timeout 504, anything else 500.
//!
//! # Admission
//!
//! Two fixed-window limiters keyed by client address (`X-Forwarded-For`
//! first hop when present): a general one over every request and a tighter
//! one over the pipeline-initiating routes. Rejections happen before any
//! body is read.
//!
//! # Production mode
//!
//! With `server.environment = "production"`, failure messages for
//! service-side errors are replaced by generic text. The full detail is
//! logged.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{ConnectInfo, DefaultBodyLimit, FromRequest, Multipart, Path, Request, State},
    http::{header, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::Engine;
use chrono::{DateTime, Utc};
use documind_core::models::ProcessingResult;
use documind_core::stage::RunState;
use serde::{Deserialize, Serialize};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::admission::AdmissionRejected;
use crate::chat::{ChatError, ChatReply};
use crate::config::Config;
use crate::error::{FailureKind, PipelineFailure};
use crate::extract;
use crate::mcp::AgentServer;
use crate::metrics::MetricsSnapshot;
use crate::parser::Source;
use crate::pipeline::ProcessOptions;
use crate::service::DocuMind;

/// Multipart and JSON framing overhead allowed on top of the upload cap.
const BODY_SLACK_BYTES: usize = 64 * 1024;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<DocuMind>,
    /// Port of the agent server, when it is running.
    pub agent_port: Option<u16>,
}

/// Starts the HTTP server (and the agent server when enabled) with the
/// production collaborators.
///
/// Fails before binding if the inference API key is missing or invalid.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let service = Arc::new(DocuMind::from_config(config)?);
    run_server_with_service(service).await
}

/// Like [`run_server`], but around an already assembled service. Tests use
/// this to serve mock collaborators on a real socket.
pub async fn run_server_with_service(service: Arc<DocuMind>) -> anyhow::Result<()> {
    let config = service.config.clone();

    let agent_port = match AgentServer::from_config(&config) {
        Some(agent) => {
            let addr = agent.spawn(service.clone()).await?;
            tracing::info!("agent server listening on http://{}/mcp", addr);
            Some(addr.port())
        }
        None => None,
    };

    service.spawn_sweeper();

    let app = router(AppState {
        service,
        agent_port,
    });
    let bind_addr = config.server.bind_addr();
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!("DocuMind API listening on http://{}", bind_addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

/// Build the application router.
pub fn router(state: AppState) -> Router {
    let config = state.service.config.clone();

    let pipeline_routes = Router::new()
        .route("/process", post(handle_process))
        .route("/process-url", post(handle_process_url))
        .route_layer(middleware::from_fn_with_state(state.clone(), admit_pipeline));

    Router::new()
        .route("/health", get(handle_health))
        .route("/metrics", get(handle_metrics))
        .route("/process/{id}/status", get(handle_status))
        .route("/chat", post(handle_chat))
        .route("/ws", get(crate::ws::handle_upgrade))
        .merge(pipeline_routes)
        .fallback(handle_not_found)
        .layer(middleware::from_fn_with_state(state.clone(), admit_general))
        .layer(DefaultBodyLimit::max(
            config.server.max_upload_bytes() + BODY_SLACK_BYTES,
        ))
        .layer(cors_layer(&config.server.cors_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let allow_origin = if origins.iter().any(|o| o == "*") {
        AllowOrigin::any()
    } else {
        let list: Vec<HeaderValue> = origins
            .iter()
            .filter_map(|o| match HeaderValue::from_str(o) {
                Ok(v) => Some(v),
                Err(_) => {
                    tracing::warn!(origin = %o, "ignoring invalid CORS origin");
                    None
                }
            })
            .collect();
        AllowOrigin::list(list)
    };
    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any)
}

// ============ Envelope ============

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Metadata {
    timestamp: DateTime<Utc>,
    request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    processing_time_ms: Option<u64>,
}

impl Metadata {
    fn new(started: Option<Instant>) -> Self {
        Self {
            timestamp: Utc::now(),
            request_id: uuid::Uuid::new_v4().to_string(),
            processing_time_ms: started.map(|s| s.elapsed().as_millis() as u64),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Envelope<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorDetail>,
    metadata: Metadata,
}

fn success<T: Serialize>(data: T, started: Option<Instant>) -> Json<Envelope<T>> {
    Json(Envelope {
        success: true,
        data: Some(data),
        error: None,
        metadata: Metadata::new(started),
    })
}

// ============ Error response ============

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorDetail {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    stage: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    document_id: Option<String>,
}

/// Internal error type that converts into an enveloped HTTP response.
#[derive(Debug)]
pub(crate) struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
    stage: Option<&'static str>,
    document_id: Option<String>,
    retry_after: Option<u64>,
}

impl AppError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            stage: None,
            document_id: None,
            retry_after: None,
        }
    }

    pub(crate) fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", message)
    }

    fn unsupported_media(mime: &str) -> Self {
        Self::new(
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "UNSUPPORTED_MEDIA_TYPE",
            format!(
                "unsupported file type '{}'; accepted: {}",
                mime,
                extract::ALLOWED_MIME_TYPES.join(", ")
            ),
        )
    }

    fn rate_limited(rejected: &AdmissionRejected) -> Self {
        let mut err = Self::new(
            StatusCode::TOO_MANY_REQUESTS,
            FailureKind::RateLimitExceeded.code(),
            rejected.to_string(),
        );
        err.retry_after = Some(rejected.retry_after_secs());
        err
    }

    /// Map a pipeline failure, hiding service-side detail in production.
    pub(crate) fn from_failure(failure: &PipelineFailure, production: bool) -> Self {
        let status = match failure.kind {
            FailureKind::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
            FailureKind::ParseFailure => StatusCode::BAD_REQUEST,
            FailureKind::UnsupportedModel
            | FailureKind::UnsupportedFormat
            | FailureKind::ContextOverflow => StatusCode::UNPROCESSABLE_ENTITY,
            FailureKind::StageTimeout => StatusCode::GATEWAY_TIMEOUT,
            FailureKind::AnalysisFailure
            | FailureKind::InvariantViolation
            | FailureKind::ValidationFailure => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            code: failure.kind.code(),
            message: failure.public_message(production),
            stage: Some(failure.stage.name()),
            document_id: Some(failure.document_id.clone()),
            retry_after: None,
        }
    }

    pub(crate) fn from_chat(err: &ChatError, production: bool) -> Self {
        match err {
            ChatError::EmptyMessage | ChatError::MessageTooLong => Self::bad_request(err.to_string()),
            ChatError::Model(e) => {
                tracing::error!(error = %e, "chat model call failed");
                let message = if production {
                    "Chat service unavailable".to_string()
                } else {
                    e.to_string()
                };
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "CHAT_FAILURE", message)
            }
        }
    }

    pub(crate) fn code(&self) -> &'static str {
        self.code
    }

    pub(crate) fn message(&self) -> &str {
        &self.message
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Envelope::<()> {
            success: false,
            data: None,
            error: Some(ErrorDetail {
                code: self.code,
                message: self.message,
                stage: self.stage,
                document_id: self.document_id,
            }),
            metadata: Metadata::new(None),
        };
        let mut response = (self.status, Json(body)).into_response();
        if let Some(secs) = self.retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

// ============ Admission middleware ============

/// Caller identity: first `X-Forwarded-For` hop, else the peer address.
fn client_key(req: &Request) -> String {
    if let Some(forwarded) = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return forwarded.to_string();
    }
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

async fn admit_general(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let key = client_key(&req);
    match state.service.general_limiter.check(&key) {
        Ok(_) => next.run(req).await,
        Err(rejected) => {
            tracing::warn!(client = %key, path = %req.uri().path(), "request rejected by general limiter");
            AppError::rate_limited(&rejected).into_response()
        }
    }
}

async fn admit_pipeline(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let key = client_key(&req);
    match state.service.admission.check(&key) {
        Ok(admitted) => {
            tracing::debug!(client = %key, remaining = admitted.remaining, "pipeline request admitted");
            next.run(req).await
        }
        Err(rejected) => {
            tracing::warn!(client = %key, retry_after = rejected.retry_after_secs(), "pipeline request rejected");
            AppError::rate_limited(&rejected).into_response()
        }
    }
}

// ============ GET /health ============

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    uptime_secs: u64,
    services: HealthServices,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthServices {
    inference: String,
    agent_server: Option<u16>,
}

async fn handle_health(State(state): State<AppState>) -> Json<Envelope<HealthResponse>> {
    success(
        HealthResponse {
            status: "ok",
            version: env!("CARGO_PKG_VERSION"),
            uptime_secs: state.service.uptime().as_secs(),
            services: HealthServices {
                inference: state.service.inference_model().to_string(),
                agent_server: state.agent_port,
            },
        },
        None,
    )
}

// ============ GET /metrics ============

async fn handle_metrics(State(state): State<AppState>) -> Json<Envelope<MetricsSnapshot>> {
    success(state.service.pipeline.metrics().snapshot(), None)
}

// ============ POST /process ============

/// JSON body for `POST /process`.
#[derive(Deserialize)]
struct ProcessBody {
    source: SourceBody,
    #[serde(default)]
    options: ProcessOptions,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum SourceBody {
    Text {
        text: String,
        #[serde(default)]
        title: Option<String>,
    },
    Url {
        url: String,
    },
    #[serde(rename_all = "camelCase")]
    File {
        filename: String,
        content_base64: String,
        #[serde(default)]
        content_type: Option<String>,
    },
}

impl SourceBody {
    fn into_source(self) -> Result<Source, AppError> {
        match self {
            SourceBody::Text { text, title } => Ok(Source::Text { text, title }),
            SourceBody::Url { url } => Ok(Source::Url(url)),
            SourceBody::File {
                filename,
                content_base64,
                content_type,
            } => {
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(content_base64.trim())
                    .map_err(|e| AppError::bad_request(format!("contentBase64: {}", e)))?;
                file_source(filename, bytes, content_type.as_deref())
            }
        }
    }
}

/// Boundary check for uploaded files: the resolved MIME type must be on
/// the allow-list before the parser ever sees the bytes.
pub(crate) fn file_source(
    filename: String,
    bytes: Vec<u8>,
    declared: Option<&str>,
) -> Result<Source, AppError> {
    let mime = extract::resolve_mime(&filename, declared);
    if !extract::is_allowed_mime(&mime) {
        return Err(AppError::unsupported_media(&mime));
    }
    Ok(Source::File {
        filename,
        bytes,
        content_type: Some(mime),
    })
}

async fn handle_process(
    State(state): State<AppState>,
    req: Request,
) -> Result<Json<Envelope<ProcessingResult>>, AppError> {
    let started = Instant::now();
    let is_multipart = req
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("multipart/form-data"));

    let (source, options) = if is_multipart {
        let multipart = Multipart::from_request(req, &state)
            .await
            .map_err(|e| AppError::bad_request(e.body_text()))?;
        read_multipart(multipart).await?
    } else {
        let Json(body) = Json::<ProcessBody>::from_request(req, &state)
            .await
            .map_err(|e| AppError::bad_request(e.body_text()))?;
        (body.source.into_source()?, body.options)
    };

    run_pipeline(&state, source, options, started).await
}

/// Read the `file` and optional `options` fields of a multipart upload.
async fn read_multipart(mut multipart: Multipart) -> Result<(Source, ProcessOptions), AppError> {
    let mut options = ProcessOptions::default();
    let mut source = None;

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        match field.name().unwrap_or("") {
            "options" => {
                let data = field.bytes().await.map_err(multipart_error)?;
                options = serde_json::from_slice(&data)
                    .map_err(|e| AppError::bad_request(format!("invalid options: {}", e)))?;
            }
            "file" => {
                let filename = field
                    .file_name()
                    .map(str::to_string)
                    .unwrap_or_else(|| "upload.txt".to_string());
                let declared = field.content_type().map(str::to_string);
                // reject by type before buffering the body
                let mime = extract::resolve_mime(&filename, declared.as_deref());
                if !extract::is_allowed_mime(&mime) {
                    return Err(AppError::unsupported_media(&mime));
                }
                let data = field.bytes().await.map_err(multipart_error)?;
                tracing::info!("received upload {} ({} bytes)", filename, data.len());
                source = Some(file_source(filename, data.to_vec(), Some(&mime))?);
            }
            _ => {}
        }
    }

    let source = source.ok_or_else(|| AppError::bad_request("missing 'file' field"))?;
    Ok((source, options))
}

fn multipart_error(err: axum::extract::multipart::MultipartError) -> AppError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        AppError::new(
            StatusCode::PAYLOAD_TOO_LARGE,
            "PAYLOAD_TOO_LARGE",
            "upload exceeds the configured size limit",
        )
    } else {
        AppError::bad_request(err.body_text())
    }
}

async fn run_pipeline(
    state: &AppState,
    source: Source,
    options: ProcessOptions,
    started: Instant,
) -> Result<Json<Envelope<ProcessingResult>>, AppError> {
    let production = state.service.is_production();
    let result = state
        .service
        .process(source, &options)
        .await
        .map_err(|f| AppError::from_failure(&f, production))?;
    Ok(success(result, Some(started)))
}

// ============ POST /process-url ============

#[derive(Deserialize)]
struct ProcessUrlBody {
    url: String,
    #[serde(default)]
    options: ProcessOptions,
}

async fn handle_process_url(
    State(state): State<AppState>,
    Json(body): Json<ProcessUrlBody>,
) -> Result<Json<Envelope<ProcessingResult>>, AppError> {
    let started = Instant::now();
    if body.url.trim().is_empty() {
        return Err(AppError::bad_request("url must not be empty"));
    }
    run_pipeline(&state, Source::Url(body.url), body.options, started).await
}

// ============ GET /process/{id}/status ============

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    document_id: String,
    status: &'static str,
    phase: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    stage: Option<&'static str>,
    progress: u8,
    created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorDetail>,
}

async fn handle_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Envelope<StatusResponse>>, AppError> {
    let status = state
        .service
        .pipeline
        .ledger()
        .status(&id)
        .ok_or_else(|| AppError::not_found(format!("no run with id {}", id)))?;

    let production = state.service.is_production();
    let stage = match status.state {
        RunState::Running(s) | RunState::Failed(s) => Some(s.name()),
        RunState::Queued | RunState::Done => None,
    };
    Ok(success(
        StatusResponse {
            document_id: status.document_id,
            status: status.state.status(),
            phase: status.state.phase(),
            stage,
            progress: status.state.progress(),
            created_at: status.created_at,
            error: status.failure.map(|f| ErrorDetail {
                code: f.kind.code(),
                message: f.public_message(production),
                stage: Some(f.stage.name()),
                document_id: None,
            }),
        },
        None,
    ))
}

// ============ POST /chat ============

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatBody {
    message: String,
    #[serde(default)]
    document_id: Option<String>,
}

async fn handle_chat(
    State(state): State<AppState>,
    Json(body): Json<ChatBody>,
) -> Result<Json<Envelope<ChatReply>>, AppError> {
    let started = Instant::now();
    let reply = state
        .service
        .chat
        .send_message(body.document_id.as_deref(), &body.message)
        .await
        .map_err(|e| AppError::from_chat(&e, state.service.is_production()))?;
    Ok(success(reply, Some(started)))
}

// ============ Fallback ============

async fn handle_not_found(req: Request) -> AppError {
    AppError::not_found(format!("no route for {} {}", req.method(), req.uri().path()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use documind_core::stage::Stage;

    #[test]
    fn failures_map_to_statuses() {
        let f = PipelineFailure::new(Stage::Optimize, FailureKind::UnsupportedModel, "d", "unsupported target model 'x'");
        let err = AppError::from_failure(&f, true);
        assert_eq!(err.status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(err.stage, Some("optimizeContext"));
        assert!(err.message.contains("'x'"));

        let f = PipelineFailure::new(Stage::Analyze, FailureKind::StageTimeout, "d", "analyze did not finish within 180s");
        assert_eq!(AppError::from_failure(&f, false).status, StatusCode::GATEWAY_TIMEOUT);

        let f = PipelineFailure::new(Stage::BuildGraph, FailureKind::InvariantViolation, "d", "edge a -> b");
        let err = AppError::from_failure(&f, true);
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.message, "Internal processing error");
    }

    #[test]
    fn boundary_rejects_unlisted_types() {
        let err = file_source("a.png".into(), vec![1], Some("image/png")).unwrap_err();
        assert_eq!(err.status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
        assert!(file_source("notes.md".into(), b"# x".to_vec(), None).is_ok());
    }

    #[test]
    fn client_key_prefers_forwarded_header() {
        let req = Request::builder()
            .header("x-forwarded-for", "203.0.113.7, 10.0.0.1")
            .body(axum::body::Body::empty())
            .unwrap();
        assert_eq!(client_key(&req), "203.0.113.7");

        let mut req = Request::builder().body(axum::body::Body::empty()).unwrap();
        req.extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 4000))));
        assert_eq!(client_key(&req), "127.0.0.1");
    }

    #[test]
    fn source_body_decodes_base64_files() {
        let body: ProcessBody = serde_json::from_str(
            r#"{"source": {"type": "file", "filename": "a.txt", "contentBase64": "aGVsbG8="},
                "options": {"targetModel": "gpt-4", "compressionLevel": "light"}}"#,
        )
        .unwrap();
        assert_eq!(body.options.target_model.as_deref(), Some("gpt-4"));
        match body.source.into_source().unwrap() {
            Source::File { bytes, content_type, .. } => {
                assert_eq!(bytes, b"hello");
                assert_eq!(content_type.as_deref(), Some("text/plain"));
            }
            other => panic!("unexpected source {:?}", other),
        }
    }
}
