//! User, credential, and project lifecycle handlers. Thin by design: parse
//! and validate, call the engine, translate errors through `ApiError`.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;

use crate::auth::Caller;
use crate::db;
use crate::error::ApiError;
use crate::models::{
    ActivateResponse, AgentStatusResponse, CreateProjectRequest, CreateProjectResponse,
    CreateUserRequest, CreateUserResponse, GithubKeyRequest, GithubKeyStatus, MessageResponse,
    Project, RenameProjectRequest, UserListItem, WorkspaceKeyRequest, WorkspaceKeyStatus,
    valid_user_id,
};
use crate::proxy;
use crate::server::AppState;

/// Health check endpoint
pub async fn health() -> impl IntoResponse {
    "OK"
}

/// Project lookups always check ownership; a project under another user is
/// indistinguishable from a missing one.
pub async fn owned_project(
    state: &AppState,
    caller: &Caller,
    user_id: &str,
    project_id: &str,
) -> Result<Project, ApiError> {
    caller.authorize(user_id)?;
    let project = db::get_project(&state.pool, project_id)
        .await?
        .ok_or_else(|| ApiError::project_not_found(project_id))?;
    if project.user_id != user_id {
        return Err(ApiError::project_not_found(project_id));
    }
    Ok(project)
}

// ---------------------------------------------------------------------------
// Users and credentials
// ---------------------------------------------------------------------------

pub async fn list_users(
    State(state): State<AppState>,
    caller: Caller,
) -> Result<Json<Vec<UserListItem>>, ApiError> {
    caller.require_admin()?;
    let users = db::list_users(&state.pool).await?;
    Ok(Json(
        users
            .into_iter()
            .map(|u| UserListItem {
                id: u.id,
                name: u.name,
            })
            .collect(),
    ))
}

pub async fn create_user(
    State(state): State<AppState>,
    caller: Caller,
    Json(req): Json<CreateUserRequest>,
) -> Result<impl IntoResponse, ApiError> {
    caller.require_admin()?;
    if !valid_user_id(&req.id) {
        return Err(ApiError::InvalidArgument(format!(
            "user id '{}' must be a lowercase DNS-safe slug",
            req.id
        )));
    }
    let name = req.name.unwrap_or_else(|| req.id.clone());
    let user = db::create_user(&state.pool, &req.id, &name).await?;
    let api_key = user.api_key.clone().unwrap_or_default();
    Ok((
        StatusCode::CREATED,
        Json(CreateUserResponse {
            id: user.id,
            name: user.name,
            api_key,
        }),
    ))
}

pub async fn delete_user(
    State(state): State<AppState>,
    caller: Caller,
    Path(user_id): Path<String>,
) -> Result<Json<MessageResponse>, ApiError> {
    caller.require_admin()?;
    let projects = db::list_projects_by_user(&state.pool, &user_id).await?;
    if !projects.is_empty() {
        return Err(ApiError::Conflict(format!(
            "user {} still owns {} project(s)",
            user_id,
            projects.len()
        )));
    }
    if !db::delete_user(&state.pool, &user_id).await? {
        return Err(ApiError::user_not_found(&user_id));
    }
    Ok(Json(MessageResponse {
        message: format!("user {} deleted", user_id),
    }))
}

pub async fn put_user_github_key(
    State(state): State<AppState>,
    caller: Caller,
    Path(user_id): Path<String>,
    Json(req): Json<GithubKeyRequest>,
) -> Result<Json<MessageResponse>, ApiError> {
    caller.authorize(&user_id)?;
    if !valid_user_id(&user_id) {
        return Err(ApiError::InvalidArgument(format!(
            "user id '{}' must be a lowercase DNS-safe slug",
            user_id
        )));
    }
    let user = db::ensure_user(&state.pool, &user_id).await?;
    state
        .engine
        .update_user_github_token(&user, req.github_key.as_deref())
        .await?;
    let message = match req.github_key {
        Some(_) => format!("GitHub key stored for user {}", user_id),
        None => format!("GitHub key removed for user {}", user_id),
    };
    Ok(Json(MessageResponse { message }))
}

pub async fn get_user_github_key(
    State(state): State<AppState>,
    caller: Caller,
    Path(user_id): Path<String>,
) -> Result<Json<GithubKeyStatus>, ApiError> {
    caller.authorize(&user_id)?;
    let user = db::get_user(&state.pool, &user_id)
        .await?
        .ok_or_else(|| ApiError::user_not_found(&user_id))?;
    Ok(Json(GithubKeyStatus {
        github_key_set: user.github_token_masked.is_some(),
    }))
}

pub async fn delete_user_github_key(
    State(state): State<AppState>,
    caller: Caller,
    Path(user_id): Path<String>,
) -> Result<Json<MessageResponse>, ApiError> {
    caller.authorize(&user_id)?;
    let user = db::get_user(&state.pool, &user_id)
        .await?
        .ok_or_else(|| ApiError::user_not_found(&user_id))?;
    state.engine.update_user_github_token(&user, None).await?;
    Ok(Json(MessageResponse {
        message: format!("GitHub key removed for user {}", user_id),
    }))
}

pub async fn put_user_workspace_key(
    State(state): State<AppState>,
    caller: Caller,
    Path(user_id): Path<String>,
    Json(req): Json<WorkspaceKeyRequest>,
) -> Result<Json<MessageResponse>, ApiError> {
    caller.authorize(&user_id)?;
    if !valid_user_id(&user_id) {
        return Err(ApiError::InvalidArgument(format!(
            "user id '{}' must be a lowercase DNS-safe slug",
            user_id
        )));
    }
    let user = db::ensure_user(&state.pool, &user_id).await?;
    state
        .engine
        .update_user_workspace_key(&user, req.workspace_key.as_deref())
        .await?;
    let message = match req.workspace_key {
        Some(_) => format!("workspace key stored for user {}", user_id),
        None => format!("workspace key removed for user {}", user_id),
    };
    Ok(Json(MessageResponse { message }))
}

pub async fn get_user_workspace_key(
    State(state): State<AppState>,
    caller: Caller,
    Path(user_id): Path<String>,
) -> Result<Json<WorkspaceKeyStatus>, ApiError> {
    caller.authorize(&user_id)?;
    let user = db::get_user(&state.pool, &user_id)
        .await?
        .ok_or_else(|| ApiError::user_not_found(&user_id))?;
    Ok(Json(WorkspaceKeyStatus {
        workspace_key_set: user.workspace_key_masked.is_some(),
    }))
}

pub async fn delete_user_workspace_key(
    State(state): State<AppState>,
    caller: Caller,
    Path(user_id): Path<String>,
) -> Result<Json<MessageResponse>, ApiError> {
    caller.authorize(&user_id)?;
    let user = db::get_user(&state.pool, &user_id)
        .await?
        .ok_or_else(|| ApiError::user_not_found(&user_id))?;
    state.engine.update_user_workspace_key(&user, None).await?;
    Ok(Json(MessageResponse {
        message: format!("workspace key removed for user {}", user_id),
    }))
}

// ---------------------------------------------------------------------------
// Projects
// ---------------------------------------------------------------------------

pub async fn list_projects(
    State(state): State<AppState>,
    caller: Caller,
    Path(user_id): Path<String>,
) -> Result<Json<Vec<Project>>, ApiError> {
    caller.authorize(&user_id)?;
    let projects = db::list_projects_by_user(&state.pool, &user_id).await?;
    Ok(Json(projects))
}

fn validate_repo_url(repo_url: &str) -> Result<(), ApiError> {
    let ok = (repo_url.starts_with("https://") || repo_url.starts_with("http://"))
        && !repo_url.contains(char::is_whitespace)
        && !repo_url.contains('\'');
    if ok {
        Ok(())
    } else {
        Err(ApiError::InvalidArgument(format!(
            "repo_url '{}' must be an http(s) URL",
            repo_url
        )))
    }
}

/// Creates the project and drives it to `active`; the response completes
/// after readiness and the clone attempt.
pub async fn create_project(
    State(state): State<AppState>,
    caller: Caller,
    Path(user_id): Path<String>,
    Json(req): Json<CreateProjectRequest>,
) -> Result<impl IntoResponse, ApiError> {
    caller.authorize(&user_id)?;
    if !valid_user_id(&user_id) {
        return Err(ApiError::InvalidArgument(format!(
            "user id '{}' must be a lowercase DNS-safe slug",
            user_id
        )));
    }
    if req.name.trim().is_empty() {
        return Err(ApiError::InvalidArgument(
            "project name must not be empty".to_string(),
        ));
    }
    if let Some(repo_url) = &req.repo_url {
        validate_repo_url(repo_url)?;
    }
    let user = db::ensure_user(&state.pool, &user_id).await?;
    let project = state
        .engine
        .create_project(
            &user,
            req.name.trim(),
            req.repo_url.as_deref(),
            req.github_key.as_deref(),
        )
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(CreateProjectResponse {
            project_id: project.id.clone(),
            message: format!("project {} created and active", project.id),
        }),
    ))
}

pub async fn rename_project(
    State(state): State<AppState>,
    caller: Caller,
    Path((user_id, project_id)): Path<(String, String)>,
    Json(req): Json<RenameProjectRequest>,
) -> Result<Json<MessageResponse>, ApiError> {
    owned_project(&state, &caller, &user_id, &project_id).await?;
    if req.name.trim().is_empty() {
        return Err(ApiError::InvalidArgument(
            "project name must not be empty".to_string(),
        ));
    }
    let mut changes = serde_json::Map::new();
    changes.insert(
        "name".to_string(),
        serde_json::Value::String(req.name.trim().to_string()),
    );
    db::update_project_fields(&state.pool, &project_id, &changes).await?;
    Ok(Json(MessageResponse {
        message: format!("project {} renamed", project_id),
    }))
}

pub async fn delete_project(
    State(state): State<AppState>,
    caller: Caller,
    Path((user_id, project_id)): Path<(String, String)>,
) -> Result<Json<MessageResponse>, ApiError> {
    owned_project(&state, &caller, &user_id, &project_id).await?;
    state.engine.delete_project(&project_id).await?;
    Ok(Json(MessageResponse {
        message: format!("project {} deleted", project_id),
    }))
}

pub async fn activate_project(
    State(state): State<AppState>,
    caller: Caller,
    Path((user_id, project_id)): Path<(String, String)>,
) -> Result<Json<ActivateResponse>, ApiError> {
    owned_project(&state, &caller, &user_id, &project_id).await?;
    let project = state.engine.activate_project(&project_id).await?;
    Ok(Json(ActivateResponse {
        message: format!("project {} active", project_id),
        endpoint: project.endpoint.unwrap_or_default(),
    }))
}

pub async fn deactivate_project(
    State(state): State<AppState>,
    caller: Caller,
    Path((user_id, project_id)): Path<(String, String)>,
) -> Result<Json<MessageResponse>, ApiError> {
    owned_project(&state, &caller, &user_id, &project_id).await?;
    state.engine.deactivate_project(&project_id).await?;
    Ok(Json(MessageResponse {
        message: format!("project {} deactivated", project_id),
    }))
}

/// Re-clone on demand. A failed clone is still a 200: the project stays
/// usable and the failure is recorded on the record.
pub async fn clone_repository(
    State(state): State<AppState>,
    caller: Caller,
    Path((user_id, project_id)): Path<(String, String)>,
) -> Result<Json<MessageResponse>, ApiError> {
    owned_project(&state, &caller, &user_id, &project_id).await?;
    let project = state.engine.clone_repository(&project_id).await?;
    let message = match project.last_error {
        None => format!("repository cloned for project {}", project_id),
        Some(err) => format!("clone failed for project {}: {}", project_id, err),
    };
    Ok(Json(MessageResponse { message }))
}

pub async fn put_project_github_key(
    State(state): State<AppState>,
    caller: Caller,
    Path((user_id, project_id)): Path<(String, String)>,
    Json(req): Json<GithubKeyRequest>,
) -> Result<Json<MessageResponse>, ApiError> {
    owned_project(&state, &caller, &user_id, &project_id).await?;
    state
        .engine
        .update_github_token(&project_id, req.github_key.as_deref())
        .await?;
    let message = match req.github_key {
        Some(_) => format!("GitHub key stored for project {}", project_id),
        None => format!("GitHub key cleared for project {}", project_id),
    };
    Ok(Json(MessageResponse { message }))
}

pub async fn agent_status(
    State(state): State<AppState>,
    caller: Caller,
    Path((user_id, project_id)): Path<(String, String)>,
) -> Result<Json<AgentStatusResponse>, ApiError> {
    let project = owned_project(&state, &caller, &user_id, &project_id).await?;
    let agent = match proxy::require_endpoint(&project) {
        Ok(endpoint) => {
            let health_path = &state.engine.workload_config().agent_health_path;
            match state.proxy.health(&endpoint, health_path).await {
                Ok(snapshot) => Some(snapshot),
                Err(e) => Some(serde_json::json!({ "unreachable": e.to_string() })),
            }
        }
        Err(_) => None,
    };
    Ok(Json(AgentStatusResponse {
        project_status: project.status,
        agent,
        last_error: project.last_error,
    }))
}
