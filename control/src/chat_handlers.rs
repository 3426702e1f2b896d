//! Session and chat handlers. Chat operations verify the project is active
//! before dialing the agent; session summaries are mirrored into the
//! project record as the agent confirms them.

use axum::extract::{Path, State};
use axum::response::sse::Sse;
use axum::response::IntoResponse;
use axum::Json;

use crate::auth::Caller;
use crate::db;
use crate::error::ApiError;
use crate::handlers::owned_project;
use crate::models::{
    CreateSessionRequest, MessageResponse, SendMessageRequest, SendMessageResponse,
    SessionResponse, SessionsResponse,
};
use crate::proxy::require_endpoint;
use crate::server::AppState;

pub async fn create_session(
    State(state): State<AppState>,
    caller: Caller,
    Path((user_id, project_id)): Path<(String, String)>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<Json<SessionResponse>, ApiError> {
    let project = owned_project(&state, &caller, &user_id, &project_id).await?;
    let endpoint = require_endpoint(&project)?;
    if req.name.trim().is_empty() {
        return Err(ApiError::InvalidArgument(
            "session name must not be empty".to_string(),
        ));
    }
    let session = state.proxy.create_session(&endpoint, req.name.trim()).await?;
    db::add_session(&state.pool, &project_id, &session).await?;
    Ok(Json(SessionResponse { session }))
}

/// Listing prefers the agent's live view and writes it through to the
/// record; the stored summaries answer when the agent is scaled away.
pub async fn list_sessions(
    State(state): State<AppState>,
    caller: Caller,
    Path((user_id, project_id)): Path<(String, String)>,
) -> Result<Json<SessionsResponse>, ApiError> {
    let project = owned_project(&state, &caller, &user_id, &project_id).await?;
    let sessions = match require_endpoint(&project) {
        Ok(endpoint) => {
            let live = state.proxy.list_sessions(&endpoint).await?;
            db::replace_sessions(&state.pool, &project_id, &live).await?;
            live
        }
        Err(_) => project.sessions,
    };
    Ok(Json(SessionsResponse { sessions }))
}

/// The summary is removed only after the agent confirms the deletion.
pub async fn delete_session(
    State(state): State<AppState>,
    caller: Caller,
    Path((user_id, project_id, session_id)): Path<(String, String, String)>,
) -> Result<Json<MessageResponse>, ApiError> {
    let project = owned_project(&state, &caller, &user_id, &project_id).await?;
    let endpoint = require_endpoint(&project)?;
    state.proxy.delete_session(&endpoint, &session_id).await?;
    db::remove_session(&state.pool, &project_id, &session_id).await?;
    Ok(Json(MessageResponse {
        message: format!("session {} deleted", session_id),
    }))
}

pub async fn session_messages(
    State(state): State<AppState>,
    caller: Caller,
    Path((user_id, project_id, session_id)): Path<(String, String, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let project = owned_project(&state, &caller, &user_id, &project_id).await?;
    let endpoint = require_endpoint(&project)?;
    let history = state.proxy.session_messages(&endpoint, &session_id).await?;
    Ok(Json(history))
}

/// Streaming chat: relays the agent's SSE stream with framing preserved.
pub async fn stream_message(
    State(state): State<AppState>,
    caller: Caller,
    Path((user_id, project_id)): Path<(String, String)>,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let project = owned_project(&state, &caller, &user_id, &project_id).await?;
    let endpoint = require_endpoint(&project)?;
    let stream = state
        .proxy
        .stream_message(&endpoint, &req.session_id, &req.content)
        .await?;
    Ok(Sse::new(stream))
}

/// Synchronous chat: waits for the agent's full result.
pub async fn send_message(
    State(state): State<AppState>,
    caller: Caller,
    Path((user_id, project_id)): Path<(String, String)>,
    Json(req): Json<SendMessageRequest>,
) -> Result<Json<SendMessageResponse>, ApiError> {
    let project = owned_project(&state, &caller, &user_id, &project_id).await?;
    let endpoint = require_endpoint(&project)?;
    let result = state
        .proxy
        .send_message(&endpoint, &req.session_id, &req.content)
        .await?;
    Ok(Json(SendMessageResponse {
        message: "ok".to_string(),
        result,
        session_id: req.session_id,
    }))
}
