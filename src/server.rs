//! HTTP transport for the two document tools.
//!
//! Exposes discovery and resolution to MCP-style callers, plus the inbound
//! webhook receiver and a read-only status endpoint for operators. The
//! engine itself is transport-agnostic; this layer only maps typed results
//! and errors onto JSON and status codes.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/tools/list_doc` | List configured repositories |
//! | `POST` | `/tools/read_doc` | Read one document by `remotedoc://` URL |
//! | `POST` | `/webhooks/github` | Inbound push notifications (webhook mode) |
//! | `GET`  | `/repos/status` | Per-repository sync status |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_synced", "message": "..." } }
//! ```

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::discovery::{DiscoveryService, DocListing};
use crate::error::{ReadError, Rejected};
use crate::resolver::Resolver;
use crate::sync::{SyncOrchestrator, SyncStatus, SyncTask};
use crate::webhook::{WebhookEvent, WebhookVerifier};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub resolver: Arc<Resolver>,
    pub discovery: Arc<DiscoveryService>,
    pub orchestrator: Arc<SyncOrchestrator>,
    /// Present only in webhook mode.
    pub webhook: Option<WebhookIntake>,
}

/// Verifier plus the task channel it feeds.
#[derive(Clone)]
pub struct WebhookIntake {
    pub verifier: Arc<WebhookVerifier>,
    pub tasks: mpsc::Sender<SyncTask>,
}

/// Build the router over the given state.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/tools/list_doc", post(handle_list_doc))
        .route("/tools/read_doc", post(handle_read_doc))
        .route("/webhooks/github", post(handle_webhook))
        .route("/repos/status", get(handle_status))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state)
}

/// Bind and serve until the process terminates.
pub async fn run_server(bind: &str, state: AppState) -> anyhow::Result<()> {
    let app = router(state);
    info!(bind, "server listening");
    let listener = tokio::net::TcpListener::bind(bind).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    /// Machine-readable error code (e.g., `"not_synced"`).
    code: String,
    /// Human-readable error message.
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<ReadError> for AppError {
    fn from(err: ReadError) -> Self {
        let message = err.to_string();
        let (status, code) = match &err {
            ReadError::InvalidAddress { .. } => (StatusCode::BAD_REQUEST, "invalid_address"),
            ReadError::PathEscape { .. } => (StatusCode::BAD_REQUEST, "path_escape"),
            ReadError::FileNotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
            ReadError::RepositoryNotConfigured { .. } => {
                (StatusCode::NOT_FOUND, "repository_not_configured")
            }
            ReadError::NotSynced { .. } => (StatusCode::SERVICE_UNAVAILABLE, "not_synced"),
            ReadError::Io { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        AppError {
            status,
            code,
            message,
        }
    }
}

impl From<Rejected> for AppError {
    fn from(err: Rejected) -> Self {
        let message = err.to_string();
        let (status, code) = match &err {
            Rejected::BadSignature => (StatusCode::UNAUTHORIZED, "bad_signature"),
            Rejected::UnknownRepository { .. } => (StatusCode::NOT_FOUND, "unknown_repository"),
            Rejected::MalformedPayload { .. } => (StatusCode::BAD_REQUEST, "malformed_payload"),
            // IgnoredEvent is handled before conversion; this arm is for
            // completeness.
            Rejected::IgnoredEvent { .. } => (StatusCode::OK, "ignored"),
        };
        AppError {
            status,
            code,
            message,
        }
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /tools/list_doc ============

#[derive(Serialize)]
struct ListDocResponse {
    repositories: Vec<DocListing>,
}

async fn handle_list_doc(State(state): State<AppState>) -> Json<ListDocResponse> {
    Json(ListDocResponse {
        repositories: state.discovery.list().await,
    })
}

// ============ POST /tools/read_doc ============

#[derive(Deserialize)]
struct ReadDocRequest {
    url: String,
}

#[derive(Serialize)]
struct ReadDocResponse {
    content: String,
}

async fn handle_read_doc(
    State(state): State<AppState>,
    Json(request): Json<ReadDocRequest>,
) -> Result<Json<ReadDocResponse>, AppError> {
    let content = state.resolver.read(&request.url)?;
    Ok(Json(ReadDocResponse { content }))
}

// ============ GET /repos/status ============

#[derive(Serialize)]
struct RepoStatus {
    owner: String,
    repo: String,
    branch: String,
    state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    revision: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    synced_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cause: Option<String>,
}

#[derive(Serialize)]
struct StatusResponse {
    repositories: Vec<RepoStatus>,
}

async fn handle_status(State(state): State<AppState>) -> Json<StatusResponse> {
    let repositories = state
        .orchestrator
        .statuses()
        .into_iter()
        .map(|(key, status)| {
            let (state, revision, synced_at, cause) = match status {
                SyncStatus::Fresh {
                    revision,
                    synced_at,
                } => ("fresh", Some(revision), Some(synced_at), None),
                SyncStatus::Stale {
                    revision,
                    synced_at,
                    cause,
                } => ("stale", Some(revision), Some(synced_at), Some(cause)),
                SyncStatus::Failed { cause } => ("failed", None, None, Some(cause)),
            };
            RepoStatus {
                owner: key.owner,
                repo: key.repo,
                branch: key.branch,
                state: state.to_string(),
                revision,
                synced_at: synced_at.map(|t| t.to_rfc3339()),
                cause,
            }
        })
        .collect();
    Json(StatusResponse { repositories })
}

// ============ POST /webhooks/github ============

#[derive(Serialize)]
struct WebhookResponse {
    status: String,
}

/// Receives raw event bytes plus signature header and forwards them to the
/// verifier. Validation only enqueues work; the fetch happens on the
/// orchestrator's side of the channel.
async fn handle_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<WebhookResponse>), AppError> {
    let Some(intake) = &state.webhook else {
        return Err(AppError {
            status: StatusCode::NOT_FOUND,
            code: "not_found",
            message: "webhook receiver is disabled in polling mode".to_string(),
        });
    };

    let event = WebhookEvent {
        event_type: header_value(&headers, "x-github-event").unwrap_or_default(),
        signature: header_value(&headers, "x-hub-signature-256"),
        payload: body.to_vec(),
    };

    match intake.verifier.handle(&event) {
        Ok(task) => {
            intake.tasks.send(task).await.map_err(|_| AppError {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                code: "internal",
                message: "sync queue is closed".to_string(),
            })?;
            Ok((
                StatusCode::ACCEPTED,
                Json(WebhookResponse {
                    status: "queued".to_string(),
                }),
            ))
        }
        // Ignored events are a normal outcome; GitHub expects a 2xx.
        Err(Rejected::IgnoredEvent { .. }) => Ok((
            StatusCode::OK,
            Json(WebhookResponse {
                status: "ignored".to_string(),
            }),
        )),
        Err(rejection) => Err(rejection.into()),
    }
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}
