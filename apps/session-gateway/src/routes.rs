use axum::{
    Json, Router,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use gateway_sdk::{InitResponse, SentMessage, SessionStatus, SessionSummary};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::SessionError;
use crate::media::MediaRequest;
use crate::metrics;
use crate::state::AppState;

pub type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Session(SessionError),
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        ApiError::Session(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

#[derive(Serialize)]
struct ApiErrorBody<'a> {
    error: &'a str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, message) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, "bad_request", message),
            ApiError::Session(err) => {
                let status = match &err {
                    SessionError::Validation(_) | SessionError::MissingMediaSource => {
                        StatusCode::BAD_REQUEST
                    }
                    SessionError::SessionNotFound(_) => StatusCode::NOT_FOUND,
                    SessionError::SessionNotReady { .. } => StatusCode::CONFLICT,
                    SessionError::SendFailure(_) => StatusCode::BAD_GATEWAY,
                    SessionError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
                };
                if status.is_server_error() {
                    warn!(error = %err, "request failed");
                }
                (status, err.code(), err.to_string())
            }
        };
        (status, Json(ApiErrorBody { error, message })).into_response()
    }
}

#[derive(Serialize)]
struct ReadyResponse {
    status: &'static str,
    uptime_secs: u64,
    live_sessions: usize,
}

#[derive(Deserialize)]
struct SessionIdRequest {
    #[serde(alias = "sessionId")]
    session_id: String,
}

#[derive(Deserialize)]
struct SendMessageRequest {
    #[serde(alias = "sessionId")]
    session_id: String,
    phone: String,
    message: String,
}

#[derive(Deserialize)]
struct SendMediaRequest {
    #[serde(alias = "sessionId")]
    session_id: String,
    #[serde(flatten)]
    media: MediaRequest,
}

#[derive(Serialize)]
struct CloseResponse {
    session_id: String,
    closed: bool,
}

async fn health() -> &'static str {
    "ok"
}

async fn ready(State(state): State<AppState>) -> Json<ReadyResponse> {
    Json(ReadyResponse {
        status: "ok",
        uptime_secs: state.uptime_secs(),
        live_sessions: state.manager().live_sessions(),
    })
}

async fn init_session(
    State(state): State<AppState>,
    body: Result<Json<SessionIdRequest>, JsonRejection>,
) -> ApiResult<InitResponse> {
    let Json(body) = body?;
    Ok(Json(state.manager().init(&body.session_id).await?))
}

async fn restart_session(
    State(state): State<AppState>,
    body: Result<Json<SessionIdRequest>, JsonRejection>,
) -> ApiResult<InitResponse> {
    let Json(body) = body?;
    Ok(Json(state.manager().restart(&body.session_id).await?))
}

async fn list_sessions(State(state): State<AppState>) -> ApiResult<Vec<SessionSummary>> {
    Ok(Json(state.manager().list().await?))
}

async fn session_status(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<SessionStatus> {
    Ok(Json(state.manager().status(&session_id).await?))
}

async fn close_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<CloseResponse> {
    let closed = state.manager().close(&session_id).await?;
    Ok(Json(CloseResponse {
        session_id,
        closed,
    }))
}

async fn send_message(
    State(state): State<AppState>,
    body: Result<Json<SendMessageRequest>, JsonRejection>,
) -> ApiResult<SentMessage> {
    let Json(body) = body?;
    Ok(Json(
        state
            .manager()
            .send_message(&body.session_id, &body.phone, &body.message)
            .await?,
    ))
}

async fn send_media(
    State(state): State<AppState>,
    body: Result<Json<SendMediaRequest>, JsonRejection>,
) -> ApiResult<SentMessage> {
    let Json(body) = body?;
    Ok(Json(
        state
            .manager()
            .send_media(&body.session_id, body.media)
            .await?,
    ))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .route("/readyz", get(ready))
        .route("/api/sessions", get(list_sessions))
        .route("/api/sessions/init", post(init_session))
        .route("/api/sessions/restart", post(restart_session))
        .route(
            "/api/sessions/:session_id",
            get(session_status).delete(close_session),
        )
        .route("/api/messages", post(send_message))
        .route("/api/messages/media", post(send_media))
        .with_state(state)
}

async fn metrics_handler() -> impl IntoResponse {
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain")],
        metrics::gather(),
    )
}
