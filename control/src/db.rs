//! Metadata store: the single source of truth for desired state. All
//! mutations write through; there is no cache. Pool or query failures
//! surface as `StorageUnavailable` and abort the in-flight request.

use anyhow::{Context, Result};
use deadpool_postgres::Pool;
use serde_json::Value;
use tokio_postgres::types::ToSql;
use uuid::Uuid;

use crate::error::ApiError;
use crate::extensions::Extension;
use crate::models::{GithubKeySource, Project, ProjectStatus, SessionSummary, User};

pub fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};

    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Generates an opaque, DNS-label-safe project id.
pub fn new_project_id() -> String {
    let raw = Uuid::new_v4().simple().to_string();
    raw[..12].to_string()
}

async fn conn(pool: &Pool) -> Result<deadpool_postgres::Object, ApiError> {
    pool.get().await.map_err(ApiError::storage)
}

/// Initialize the database schema, creating tables if they don't exist.
pub async fn init_schema(pool: &Pool) -> Result<()> {
    let client = pool.get().await.context("failed to get db connection")?;

    client
        .execute(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                api_key TEXT UNIQUE,
                github_token_masked TEXT,
                github_secret_name TEXT,
                workspace_key_masked TEXT,
                workspace_secret_name TEXT,
                created_at BIGINT NOT NULL,
                updated_at BIGINT NOT NULL
            )
            "#,
            &[],
        )
        .await
        .context("failed to create users table")?;

    client
        .execute(
            r#"
            CREATE TABLE IF NOT EXISTS projects (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL REFERENCES users(id),
                name TEXT NOT NULL,
                status TEXT NOT NULL,
                endpoint TEXT,
                repo_url TEXT,
                has_repository BOOLEAN NOT NULL DEFAULT FALSE,
                last_error TEXT,
                github_key_set BOOLEAN NOT NULL DEFAULT FALSE,
                github_key_source TEXT NOT NULL DEFAULT 'user',
                github_token_masked TEXT,
                sessions JSONB NOT NULL DEFAULT '[]',
                settings JSONB NOT NULL DEFAULT '{}',
                extensions JSONB NOT NULL DEFAULT '[]',
                created_at BIGINT NOT NULL,
                updated_at BIGINT NOT NULL
            )
            "#,
            &[],
        )
        .await
        .context("failed to create projects table")?;

    client
        .execute(
            r#"
            CREATE INDEX IF NOT EXISTS idx_projects_user ON projects (user_id)
            "#,
            &[],
        )
        .await
        .context("failed to create user index")?;

    tracing::info!("database schema initialized");
    Ok(())
}

fn row_to_user(row: &tokio_postgres::Row) -> User {
    User {
        id: row.get("id"),
        name: row.get("name"),
        api_key: row.get("api_key"),
        github_token_masked: row.get("github_token_masked"),
        github_secret_name: row.get("github_secret_name"),
        workspace_key_masked: row.get("workspace_key_masked"),
        workspace_secret_name: row.get("workspace_secret_name"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn row_to_project(row: &tokio_postgres::Row) -> Result<Project, ApiError> {
    let status: String = row.get("status");
    let source: String = row.get("github_key_source");
    let sessions: Value = row.get("sessions");
    let settings: Value = row.get("settings");
    let extensions: Value = row.get("extensions");
    Ok(Project {
        id: row.get("id"),
        user_id: row.get("user_id"),
        name: row.get("name"),
        status: status.parse::<ProjectStatus>().map_err(ApiError::Internal)?,
        endpoint: row.get("endpoint"),
        repo_url: row.get("repo_url"),
        has_repository: row.get("has_repository"),
        last_error: row.get("last_error"),
        github_key_set: row.get("github_key_set"),
        github_key_source: source
            .parse::<GithubKeySource>()
            .map_err(ApiError::Internal)?,
        github_token_masked: row.get("github_token_masked"),
        sessions: serde_json::from_value(sessions)
            .context("malformed sessions column")
            .map_err(ApiError::Internal)?,
        settings: serde_json::from_value(settings)
            .context("malformed settings column")
            .map_err(ApiError::Internal)?,
        extensions: serde_json::from_value(extensions)
            .context("malformed extensions column")
            .map_err(ApiError::Internal)?,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

// ---------------------------------------------------------------------------
// Users
// ---------------------------------------------------------------------------

/// Create a user record if none exists (first-seen semantics). The existing
/// record is returned untouched otherwise.
pub async fn ensure_user(pool: &Pool, id: &str) -> Result<User, ApiError> {
    let client = conn(pool).await?;
    let now = now_ms();
    let row = client
        .query_one(
            r#"
            INSERT INTO users (id, name, created_at, updated_at)
            VALUES ($1, $1, $2, $2)
            ON CONFLICT (id) DO UPDATE SET id = users.id
            RETURNING *
            "#,
            &[&id, &now],
        )
        .await
        .map_err(ApiError::storage)?;
    Ok(row_to_user(&row))
}

/// Explicit user creation; issues the caller API key. Duplicate ids conflict.
pub async fn create_user(pool: &Pool, id: &str, name: &str) -> Result<User, ApiError> {
    let client = conn(pool).await?;
    let now = now_ms();
    let api_key = Uuid::new_v4().to_string();
    let row = client
        .query_opt(
            r#"
            INSERT INTO users (id, name, api_key, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $4)
            ON CONFLICT (id) DO NOTHING
            RETURNING *
            "#,
            &[&id, &name, &api_key, &now],
        )
        .await
        .map_err(ApiError::storage)?;
    match row {
        Some(row) => Ok(row_to_user(&row)),
        None => Err(ApiError::Conflict(format!("user {} already exists", id))),
    }
}

pub async fn get_user(pool: &Pool, id: &str) -> Result<Option<User>, ApiError> {
    let client = conn(pool).await?;
    let row = client
        .query_opt("SELECT * FROM users WHERE id = $1", &[&id])
        .await
        .map_err(ApiError::storage)?;
    Ok(row.as_ref().map(row_to_user))
}

pub async fn get_user_by_api_key(pool: &Pool, api_key: &str) -> Result<Option<User>, ApiError> {
    let client = conn(pool).await?;
    let row = client
        .query_opt("SELECT * FROM users WHERE api_key = $1", &[&api_key])
        .await
        .map_err(ApiError::storage)?;
    Ok(row.as_ref().map(row_to_user))
}

pub async fn list_users(pool: &Pool) -> Result<Vec<User>, ApiError> {
    let client = conn(pool).await?;
    let rows = client
        .query("SELECT * FROM users ORDER BY id ASC", &[])
        .await
        .map_err(ApiError::storage)?;
    Ok(rows.iter().map(row_to_user).collect())
}

pub async fn delete_user(pool: &Pool, id: &str) -> Result<bool, ApiError> {
    let client = conn(pool).await?;
    let affected = client
        .execute("DELETE FROM users WHERE id = $1", &[&id])
        .await
        .map_err(ApiError::storage)?;
    Ok(affected > 0)
}

pub async fn update_user_github_meta(
    pool: &Pool,
    id: &str,
    masked: Option<&str>,
    secret_name: Option<&str>,
) -> Result<(), ApiError> {
    let client = conn(pool).await?;
    let now = now_ms();
    client
        .execute(
            r#"
            UPDATE users
            SET github_token_masked = $2, github_secret_name = $3, updated_at = $4
            WHERE id = $1
            "#,
            &[&id, &masked, &secret_name, &now],
        )
        .await
        .map_err(ApiError::storage)?;
    Ok(())
}

pub async fn update_user_workspace_meta(
    pool: &Pool,
    id: &str,
    masked: Option<&str>,
    secret_name: Option<&str>,
) -> Result<(), ApiError> {
    let client = conn(pool).await?;
    let now = now_ms();
    client
        .execute(
            r#"
            UPDATE users
            SET workspace_key_masked = $2, workspace_secret_name = $3, updated_at = $4
            WHERE id = $1
            "#,
            &[&id, &masked, &secret_name, &now],
        )
        .await
        .map_err(ApiError::storage)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Projects
// ---------------------------------------------------------------------------

/// Atomic insert of a complete project record.
pub async fn create_project(pool: &Pool, project: &Project) -> Result<(), ApiError> {
    let client = conn(pool).await?;
    let sessions = serde_json::to_value(&project.sessions)
        .context("serialize sessions")
        .map_err(ApiError::Internal)?;
    let settings = serde_json::to_value(&project.settings)
        .context("serialize settings")
        .map_err(ApiError::Internal)?;
    let extensions = serde_json::to_value(&project.extensions)
        .context("serialize extensions")
        .map_err(ApiError::Internal)?;
    client
        .execute(
            r#"
            INSERT INTO projects (
                id, user_id, name, status, endpoint, repo_url,
                has_repository, last_error,
                github_key_set, github_key_source, github_token_masked,
                sessions, settings, extensions, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
            &[
                &project.id,
                &project.user_id,
                &project.name,
                &project.status.as_str(),
                &project.endpoint,
                &project.repo_url,
                &project.has_repository,
                &project.last_error,
                &project.github_key_set,
                &project.github_key_source.as_str(),
                &project.github_token_masked,
                &sessions,
                &settings,
                &extensions,
                &project.created_at,
                &project.updated_at,
            ],
        )
        .await
        .map_err(ApiError::storage)?;
    Ok(())
}

pub async fn get_project(pool: &Pool, id: &str) -> Result<Option<Project>, ApiError> {
    let client = conn(pool).await?;
    let row = client
        .query_opt("SELECT * FROM projects WHERE id = $1", &[&id])
        .await
        .map_err(ApiError::storage)?;
    row.as_ref().map(row_to_project).transpose()
}

pub async fn list_projects_by_user(pool: &Pool, user_id: &str) -> Result<Vec<Project>, ApiError> {
    let client = conn(pool).await?;
    let rows = client
        .query(
            "SELECT * FROM projects WHERE user_id = $1 ORDER BY created_at ASC, id ASC",
            &[&user_id],
        )
        .await
        .map_err(ApiError::storage)?;
    rows.iter().map(row_to_project).collect()
}

const UPDATABLE_FIELDS: &[&str] = &[
    "name",
    "status",
    "endpoint",
    "repo_url",
    "has_repository",
    "last_error",
    "github_key_set",
    "github_key_source",
    "github_token_masked",
];

/// Apply a field→value map to a project row. Unknown fields are rejected;
/// recognized fields are type-checked before the statement is built.
pub async fn update_project_fields(
    pool: &Pool,
    id: &str,
    changes: &serde_json::Map<String, Value>,
) -> Result<Project, ApiError> {
    let mut set_clauses = Vec::new();
    let mut owned: Vec<Box<dyn ToSql + Sync + Send>> = Vec::new();
    let mut param_idx = 1;

    for (field, value) in changes {
        if !UPDATABLE_FIELDS.contains(&field.as_str()) {
            return Err(ApiError::InvalidArgument(format!(
                "unknown project field: {}",
                field
            )));
        }
        let boxed: Box<dyn ToSql + Sync + Send> = match (field.as_str(), value) {
            ("status", Value::String(s)) => Box::new(
                s.parse::<ProjectStatus>()
                    .map_err(|e| ApiError::InvalidArgument(e.to_string()))?
                    .as_str()
                    .to_string(),
            ),
            ("github_key_source", Value::String(s)) => Box::new(
                s.parse::<GithubKeySource>()
                    .map_err(|e| ApiError::InvalidArgument(e.to_string()))?
                    .as_str()
                    .to_string(),
            ),
            (_, Value::String(s)) => Box::new(s.clone()),
            (_, Value::Bool(b)) => Box::new(*b),
            (_, Value::Null) => Box::new(None::<String>),
            (field, other) => {
                return Err(ApiError::InvalidArgument(format!(
                    "unsupported value for field {}: {}",
                    field, other
                )));
            }
        };
        set_clauses.push(format!("{} = ${}", field, param_idx));
        owned.push(boxed);
        param_idx += 1;
    }

    let now = now_ms();
    set_clauses.push(format!("updated_at = ${}", param_idx));
    owned.push(Box::new(now));
    param_idx += 1;

    let query = format!(
        "UPDATE projects SET {} WHERE id = ${} RETURNING *",
        set_clauses.join(", "),
        param_idx
    );
    let mut params: Vec<&(dyn ToSql + Sync)> = owned
        .iter()
        .map(|b| -> &(dyn ToSql + Sync) { b.as_ref() })
        .collect();
    params.push(&id);

    let client = conn(pool).await?;
    let row = client
        .query_opt(&query, &params)
        .await
        .map_err(ApiError::storage)?;
    match row {
        Some(row) => row_to_project(&row),
        None => Err(ApiError::project_not_found(id)),
    }
}

/// Status writes happen on every lifecycle transition; the endpoint is
/// written explicitly so the status/endpoint invariant holds in one
/// statement.
pub async fn set_status(
    pool: &Pool,
    id: &str,
    status: ProjectStatus,
    endpoint: Option<&str>,
) -> Result<(), ApiError> {
    let client = conn(pool).await?;
    let now = now_ms();
    client
        .execute(
            "UPDATE projects SET status = $2, endpoint = $3, updated_at = $4 WHERE id = $1",
            &[&id, &status.as_str(), &endpoint, &now],
        )
        .await
        .map_err(ApiError::storage)?;
    Ok(())
}

pub async fn delete_project(pool: &Pool, id: &str) -> Result<bool, ApiError> {
    let client = conn(pool).await?;
    let affected = client
        .execute("DELETE FROM projects WHERE id = $1", &[&id])
        .await
        .map_err(ApiError::storage)?;
    Ok(affected > 0)
}

// ---------------------------------------------------------------------------
// Embedded documents
// ---------------------------------------------------------------------------

pub async fn replace_sessions(
    pool: &Pool,
    id: &str,
    sessions: &[SessionSummary],
) -> Result<(), ApiError> {
    let client = conn(pool).await?;
    let now = now_ms();
    let value = serde_json::to_value(sessions)
        .context("serialize sessions")
        .map_err(ApiError::Internal)?;
    client
        .execute(
            "UPDATE projects SET sessions = $2, updated_at = $3 WHERE id = $1",
            &[&id, &value, &now],
        )
        .await
        .map_err(ApiError::storage)?;
    Ok(())
}

/// Idempotent on `session_id`: re-adding replaces the stored summary.
pub async fn add_session(
    pool: &Pool,
    project_id: &str,
    session: &SessionSummary,
) -> Result<(), ApiError> {
    let project = get_project(pool, project_id)
        .await?
        .ok_or_else(|| ApiError::project_not_found(project_id))?;
    let mut sessions: Vec<SessionSummary> = project
        .sessions
        .into_iter()
        .filter(|s| s.session_id != session.session_id)
        .collect();
    sessions.push(session.clone());
    replace_sessions(pool, project_id, &sessions).await
}

/// Idempotent: removing an absent session is a no-op.
pub async fn remove_session(
    pool: &Pool,
    project_id: &str,
    session_id: &str,
) -> Result<(), ApiError> {
    let project = get_project(pool, project_id)
        .await?
        .ok_or_else(|| ApiError::project_not_found(project_id))?;
    let sessions: Vec<SessionSummary> = project
        .sessions
        .into_iter()
        .filter(|s| s.session_id != session_id)
        .collect();
    replace_sessions(pool, project_id, &sessions).await
}

pub async fn replace_settings(
    pool: &Pool,
    project_id: &str,
    settings: &std::collections::BTreeMap<String, Value>,
) -> Result<(), ApiError> {
    let client = conn(pool).await?;
    let now = now_ms();
    let value = serde_json::to_value(settings)
        .context("serialize settings")
        .map_err(ApiError::Internal)?;
    let affected = client
        .execute(
            "UPDATE projects SET settings = $2, updated_at = $3 WHERE id = $1",
            &[&project_id, &value, &now],
        )
        .await
        .map_err(ApiError::storage)?;
    if affected == 0 {
        return Err(ApiError::project_not_found(project_id));
    }
    Ok(())
}

pub async fn replace_extensions(
    pool: &Pool,
    project_id: &str,
    extensions: &[Extension],
) -> Result<(), ApiError> {
    let client = conn(pool).await?;
    let now = now_ms();
    let value = serde_json::to_value(extensions)
        .context("serialize extensions")
        .map_err(ApiError::Internal)?;
    let affected = client
        .execute(
            "UPDATE projects SET extensions = $2, updated_at = $3 WHERE id = $1",
            &[&project_id, &value, &now],
        )
        .await
        .map_err(ApiError::storage)?;
    if affected == 0 {
        return Err(ApiError::project_not_found(project_id));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_ids_are_short_and_label_safe() {
        let id = new_project_id();
        assert_eq!(id.len(), 12);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(new_project_id(), new_project_id());
    }

    #[test]
    fn updatable_whitelist_excludes_embedded_documents() {
        for field in ["sessions", "settings", "extensions", "id", "user_id"] {
            assert!(!UPDATABLE_FIELDS.contains(&field));
        }
    }
}
