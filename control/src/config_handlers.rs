//! Settings and extension handlers. Settings are validated against the
//! compile-time registry; extension lists keep insertion order, and every
//! extension change requires a restart to take effect.

use std::collections::BTreeMap;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::Value;

use crate::auth::Caller;
use crate::error::ApiError;
use crate::extensions::{self, Extension};
use crate::handlers::owned_project;
use crate::models::{
    ExtensionsResponse, MessageResponse, SettingEntry, SettingUpdateRequest, SettingsResponse,
    SettingsUpdateResponse,
};
use crate::server::AppState;
use crate::settings;

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Effective view: explicit value, else declared default, else null.
pub async fn list_settings(
    State(state): State<AppState>,
    caller: Caller,
    Path((user_id, project_id)): Path<(String, String)>,
) -> Result<Json<SettingsResponse>, ApiError> {
    let project = owned_project(&state, &caller, &user_id, &project_id).await?;
    let entries = settings::REGISTRY
        .iter()
        .map(|def| SettingEntry {
            key: def.key.to_string(),
            value: project
                .settings
                .get(def.key)
                .cloned()
                .or_else(|| def.default_value())
                .unwrap_or(Value::Null),
            requires_restart: def.requires_restart,
        })
        .collect();
    Ok(Json(SettingsResponse { settings: entries }))
}

pub async fn get_setting(
    State(state): State<AppState>,
    caller: Caller,
    Path((user_id, project_id, key)): Path<(String, String, String)>,
) -> Result<Json<SettingEntry>, ApiError> {
    let project = owned_project(&state, &caller, &user_id, &project_id).await?;
    let def = settings::lookup(&key)
        .ok_or_else(|| ApiError::InvalidArgument(format!("unknown setting: {}", key)))?;
    Ok(Json(SettingEntry {
        key: def.key.to_string(),
        value: project
            .settings
            .get(def.key)
            .cloned()
            .or_else(|| def.default_value())
            .unwrap_or(Value::Null),
        requires_restart: def.requires_restart,
    }))
}

fn coerce_changes(changes: &serde_json::Map<String, Value>) -> Result<(BTreeMap<String, Value>, bool), ApiError> {
    let mut coerced = BTreeMap::new();
    let mut restart_required = false;
    for (key, value) in changes {
        let def = settings::lookup(key)
            .ok_or_else(|| ApiError::InvalidArgument(format!("unknown setting: {}", key)))?;
        let value = settings::coerce(def, value).map_err(ApiError::InvalidArgument)?;
        restart_required |= def.requires_restart;
        coerced.insert(key.clone(), value);
    }
    Ok((coerced, restart_required))
}

pub async fn put_setting(
    State(state): State<AppState>,
    caller: Caller,
    Path((user_id, project_id, key)): Path<(String, String, String)>,
    Json(req): Json<SettingUpdateRequest>,
) -> Result<Json<SettingsUpdateResponse>, ApiError> {
    owned_project(&state, &caller, &user_id, &project_id).await?;
    let mut changes = serde_json::Map::new();
    changes.insert(key, req.value);
    let (coerced, restart_required) = coerce_changes(&changes)?;
    let restarted = state
        .engine
        .update_settings(&project_id, &coerced, restart_required)
        .await?;
    Ok(Json(SettingsUpdateResponse {
        message: "setting updated".to_string(),
        restart_required: restarted || restart_required,
    }))
}

/// Bulk variant: the whole map is validated before anything is written.
pub async fn put_settings(
    State(state): State<AppState>,
    caller: Caller,
    Path((user_id, project_id)): Path<(String, String)>,
    Json(changes): Json<serde_json::Map<String, Value>>,
) -> Result<Json<SettingsUpdateResponse>, ApiError> {
    owned_project(&state, &caller, &user_id, &project_id).await?;
    if changes.is_empty() {
        return Err(ApiError::InvalidArgument(
            "no settings provided".to_string(),
        ));
    }
    let (coerced, restart_required) = coerce_changes(&changes)?;
    let restarted = state
        .engine
        .update_settings(&project_id, &coerced, restart_required)
        .await?;
    Ok(Json(SettingsUpdateResponse {
        message: format!("{} setting(s) updated", coerced.len()),
        restart_required: restarted || restart_required,
    }))
}

/// Bulk reset: clears every explicit setting.
pub async fn reset_settings(
    State(state): State<AppState>,
    caller: Caller,
    Path((user_id, project_id)): Path<(String, String)>,
) -> Result<Json<SettingsUpdateResponse>, ApiError> {
    owned_project(&state, &caller, &user_id, &project_id).await?;
    let restarted = state.engine.reset_settings(&project_id).await?;
    Ok(Json(SettingsUpdateResponse {
        message: "settings reset".to_string(),
        restart_required: restarted,
    }))
}

/// Removing a setting restores its default on the next resolution.
pub async fn delete_setting(
    State(state): State<AppState>,
    caller: Caller,
    Path((user_id, project_id, key)): Path<(String, String, String)>,
) -> Result<Json<SettingsUpdateResponse>, ApiError> {
    owned_project(&state, &caller, &user_id, &project_id).await?;
    let def = settings::lookup(&key)
        .ok_or_else(|| ApiError::InvalidArgument(format!("unknown setting: {}", key)))?;
    let restarted = state
        .engine
        .remove_setting(&project_id, &key, def.requires_restart)
        .await?;
    Ok(Json(SettingsUpdateResponse {
        message: format!("setting {} reset", key),
        restart_required: restarted || def.requires_restart,
    }))
}

// ---------------------------------------------------------------------------
// Extensions
// ---------------------------------------------------------------------------

pub async fn list_extensions(
    State(state): State<AppState>,
    caller: Caller,
    Path((user_id, project_id)): Path<(String, String)>,
) -> Result<Json<ExtensionsResponse>, ApiError> {
    let project = owned_project(&state, &caller, &user_id, &project_id).await?;
    Ok(Json(ExtensionsResponse {
        extensions: project.extensions,
    }))
}

pub async fn create_extension(
    State(state): State<AppState>,
    caller: Caller,
    Path((user_id, project_id)): Path<(String, String)>,
    Json(ext): Json<Extension>,
) -> Result<impl IntoResponse, ApiError> {
    let project = owned_project(&state, &caller, &user_id, &project_id).await?;
    extensions::validate(&ext).map_err(ApiError::InvalidArgument)?;
    if project.extensions.iter().any(|e| e.name == ext.name) {
        return Err(ApiError::Conflict(format!(
            "extension {} already exists",
            ext.name
        )));
    }
    let mut list = project.extensions;
    list.push(ext);
    let restart_required = state.engine.update_extensions(&project_id, &list).await?;
    Ok((
        StatusCode::CREATED,
        Json(SettingsUpdateResponse {
            message: "extension added".to_string(),
            restart_required,
        }),
    ))
}

/// Replaces the named extension in place, preserving its list position.
pub async fn update_extension(
    State(state): State<AppState>,
    caller: Caller,
    Path((user_id, project_id, name)): Path<(String, String, String)>,
    Json(mut ext): Json<Extension>,
) -> Result<Json<SettingsUpdateResponse>, ApiError> {
    let project = owned_project(&state, &caller, &user_id, &project_id).await?;
    ext.name = name.clone();
    extensions::validate(&ext).map_err(ApiError::InvalidArgument)?;
    let mut list = project.extensions;
    let slot = list
        .iter_mut()
        .find(|e| e.name == name)
        .ok_or_else(|| ApiError::NotFound(format!("extension {} not found", name)))?;
    *slot = ext;
    let restart_required = state.engine.update_extensions(&project_id, &list).await?;
    Ok(Json(SettingsUpdateResponse {
        message: format!("extension {} updated", name),
        restart_required,
    }))
}

/// Idempotent on identity: deleting an absent extension is a no-op.
pub async fn delete_extension(
    State(state): State<AppState>,
    caller: Caller,
    Path((user_id, project_id, name)): Path<(String, String, String)>,
) -> Result<Json<SettingsUpdateResponse>, ApiError> {
    let project = owned_project(&state, &caller, &user_id, &project_id).await?;
    let mut list = project.extensions;
    let before = list.len();
    list.retain(|e| e.name != name);
    if list.len() == before {
        return Ok(Json(SettingsUpdateResponse {
            message: format!("extension {} was not present", name),
            restart_required: false,
        }));
    }
    let restart_required = state.engine.update_extensions(&project_id, &list).await?;
    Ok(Json(SettingsUpdateResponse {
        message: format!("extension {} removed", name),
        restart_required,
    }))
}

/// Flips `enabled` while preserving the kind-specific payload.
pub async fn toggle_extension(
    State(state): State<AppState>,
    caller: Caller,
    Path((user_id, project_id, name)): Path<(String, String, String)>,
) -> Result<Json<SettingsUpdateResponse>, ApiError> {
    let project = owned_project(&state, &caller, &user_id, &project_id).await?;
    let mut list = project.extensions;
    let slot = list
        .iter_mut()
        .find(|e| e.name == name)
        .ok_or_else(|| ApiError::NotFound(format!("extension {} not found", name)))?;
    slot.enabled = !slot.enabled;
    let enabled = slot.enabled;
    let restart_required = state.engine.update_extensions(&project_id, &list).await?;
    Ok(Json(SettingsUpdateResponse {
        message: format!(
            "extension {} {}",
            name,
            if enabled { "enabled" } else { "disabled" }
        ),
        restart_required,
    }))
}
