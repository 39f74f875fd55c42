//! HTTP server
//!
//! One long-lived SSE stream per session plus a small JSON API around it:
//! create/resume sessions, send chat prompts (run in the background), and
//! answer approval questions out of band.

pub mod runtime;

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use anyhow::Result;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::cli::ServeArgs;
use crate::config::Config;
use crate::provider::Usage;
use crate::session::SessionInfo;

use runtime::{CreateSessionRequest, SessionRuntime, SessionStore};

/// Events pushed to a session's subscriber stream.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    TextDelta {
        text: String,
    },
    ToolCall {
        call_id: String,
        tool: String,
        args: String,
    },
    ApprovalRequired {
        call_id: String,
        tool: String,
        args: String,
        reason: String,
    },
    ToolResult {
        call_id: String,
        tool: String,
        ok: bool,
    },
    Completed {
        status: String,
        usage: Option<Usage>,
    },
    Trace {
        kind: String,
        raw: String,
    },
    Error {
        message: String,
    },
}

impl ServerEvent {
    /// The SSE `event:` field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TextDelta { .. } => "text_delta",
            Self::ToolCall { .. } => "tool_call",
            Self::ApprovalRequired { .. } => "approval_required",
            Self::ToolResult { .. } => "tool_result",
            Self::Completed { .. } => "completed",
            Self::Trace { .. } => "trace",
            Self::Error { .. } => "error",
        }
    }

    /// The SSE `data:` payload.
    pub fn payload(&self) -> Value {
        match self {
            Self::TextDelta { text } => json!({"text": text}),
            Self::ToolCall {
                call_id,
                tool,
                args,
            } => json!({"callId": call_id, "tool": tool, "args": args}),
            Self::ApprovalRequired {
                call_id,
                tool,
                args,
                reason,
            } => json!({"callId": call_id, "tool": tool, "args": args, "reason": reason}),
            Self::ToolResult { call_id, tool, ok } => {
                json!({"callId": call_id, "tool": tool, "ok": ok})
            }
            Self::Completed { status, usage } => match usage {
                Some(usage) => json!({
                    "status": status,
                    "usage": {
                        "inputTokens": usage.input_tokens,
                        "outputTokens": usage.output_tokens,
                    },
                }),
                None => json!({"status": status}),
            },
            Self::Trace { kind, raw } => json!({"kind": kind, "raw": raw}),
            Self::Error { message } => json!({"message": message}),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<SessionStore>,
    pub config: Arc<Config>,
}

struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn conflict(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({"error": self.message}))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/sessions", post(create_session))
        .route("/api/sessions/{id}", get(get_session))
        .route("/api/sessions/{id}/resume", post(resume_session))
        .route("/api/sessions/{id}/chat", post(chat))
        .route("/api/sessions/{id}/approvals/{call_id}", post(resolve_approval))
        .route("/api/sessions/{id}/stream", get(stream_session))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Start the HTTP server.
pub async fn serve(args: ServeArgs) -> Result<()> {
    let state = AppState {
        store: Arc::new(SessionStore::new()),
        config: Arc::new(Config::load(&std::env::current_dir()?)?),
    };
    let app = router(state);

    let addr = format!("{}:{}", args.hostname, args.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "codewright server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionResponse {
    session_id: String,
}

async fn create_session(
    State(state): State<AppState>,
    Json(request): Json<CreateSessionRequest>,
) -> ApiResult<Json<CreateSessionResponse>> {
    let runtime = SessionRuntime::create(&request, &state.config)
        .map_err(|err| ApiError::bad_request(err.to_string()))?;
    let session_id = runtime.info.id.clone();
    state.store.insert(runtime);
    tracing::info!(session_id = %session_id, "session created");
    Ok(Json(CreateSessionResponse { session_id }))
}

async fn get_session(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<Json<SessionInfo>> {
    let runtime = state
        .store
        .try_get(&id)
        .ok_or_else(|| ApiError::not_found(format!("unknown session {id}")))?;
    Ok(Json(runtime.info.clone()))
}

async fn resume_session(
    Path(id): Path<String>,
    State(state): State<AppState>,
    Json(request): Json<CreateSessionRequest>,
) -> ApiResult<Json<CreateSessionResponse>> {
    let log_path = crate::session::session_log_path(
        &std::fs::canonicalize(&request.workspace_path)
            .map_err(|err| ApiError::bad_request(err.to_string()))?,
        &id,
    );
    if !log_path.exists() {
        return Err(ApiError::not_found(format!("no session log for {id}")));
    }

    let runtime = SessionRuntime::resume(&id, &request, &state.config)
        .map_err(|err| ApiError::bad_request(err.to_string()))?;
    let session_id = runtime.info.id.clone();
    state.store.insert(runtime);
    tracing::info!(session_id = %session_id, "session resumed");
    Ok(Json(CreateSessionResponse { session_id }))
}

#[derive(Deserialize)]
struct ChatRequest {
    message: String,
}

async fn chat(
    Path(id): Path<String>,
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> ApiResult<StatusCode> {
    let runtime = state
        .store
        .try_get(&id)
        .ok_or_else(|| ApiError::not_found(format!("unknown session {id}")))?;
    if request.message.trim().is_empty() {
        return Err(ApiError::bad_request("message must not be empty"));
    }

    tokio::spawn(runtime.run_chat(request.message));
    Ok(StatusCode::ACCEPTED)
}

#[derive(Deserialize)]
struct ApprovalRequest {
    approved: bool,
}

async fn resolve_approval(
    Path((id, call_id)): Path<(String, String)>,
    State(state): State<AppState>,
    Json(request): Json<ApprovalRequest>,
) -> ApiResult<StatusCode> {
    let runtime = state
        .store
        .try_get(&id)
        .ok_or_else(|| ApiError::not_found(format!("unknown session {id}")))?;
    if !runtime.approvals.try_resolve(&call_id, request.approved) {
        return Err(ApiError::not_found(format!(
            "no pending approval for {call_id}"
        )));
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn stream_session(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<Sse<axum::response::sse::KeepAliveStream<SessionEventStream>>> {
    let runtime = state
        .store
        .try_get(&id)
        .ok_or_else(|| ApiError::not_found(format!("unknown session {id}")))?;
    let receiver = runtime
        .take_stream()
        .ok_or_else(|| ApiError::conflict("session stream already connected"))?;

    let stream = SessionEventStream {
        runtime,
        receiver: Some(receiver),
    };
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// The single reader of a session's event channel. Returning the receiver
/// on drop is what releases the latch and preserves buffered events for
/// the next subscriber.
pub struct SessionEventStream {
    runtime: Arc<SessionRuntime>,
    receiver: Option<mpsc::UnboundedReceiver<ServerEvent>>,
}

impl Stream for SessionEventStream {
    type Item = std::result::Result<Event, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let Some(receiver) = self.receiver.as_mut() else {
            return Poll::Ready(None);
        };
        match receiver.poll_recv(cx) {
            Poll::Ready(Some(event)) => Poll::Ready(Some(Ok(Event::default()
                .event(event.kind())
                .data(event.payload().to_string())))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for SessionEventStream {
    fn drop(&mut self) {
        if let Some(receiver) = self.receiver.take() {
            self.runtime.return_stream(receiver);
        }
    }
}
