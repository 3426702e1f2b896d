use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::extensions::Extension;

/// Lifecycle state of a project's agent workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectStatus {
    Inactive,
    Activating,
    Active,
    Deactivating,
    Error,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectStatus::Inactive => "inactive",
            ProjectStatus::Activating => "activating",
            ProjectStatus::Active => "active",
            ProjectStatus::Deactivating => "deactivating",
            ProjectStatus::Error => "error",
        }
    }

    /// Activation is only legal from a settled non-running state.
    pub fn can_activate(&self) -> bool {
        matches!(self, ProjectStatus::Inactive | ProjectStatus::Error)
    }

    pub fn can_deactivate(&self) -> bool {
        matches!(self, ProjectStatus::Active)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, ProjectStatus::Active)
    }

    /// A transition is already in flight.
    pub fn is_transitional(&self) -> bool {
        matches!(self, ProjectStatus::Activating | ProjectStatus::Deactivating)
    }
}

impl fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProjectStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inactive" => Ok(ProjectStatus::Inactive),
            "activating" => Ok(ProjectStatus::Activating),
            "active" => Ok(ProjectStatus::Active),
            "deactivating" => Ok(ProjectStatus::Deactivating),
            "error" => Ok(ProjectStatus::Error),
            other => Err(anyhow::anyhow!("unknown project status: {}", other)),
        }
    }
}

/// Which credential the project's `GIT_TOKEN` resolves from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GithubKeySource {
    Project,
    User,
}

impl GithubKeySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            GithubKeySource::Project => "project",
            GithubKeySource::User => "user",
        }
    }
}

impl FromStr for GithubKeySource {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "project" => Ok(GithubKeySource::Project),
            "user" => Ok(GithubKeySource::User),
            other => Err(anyhow::anyhow!("unknown github key source: {}", other)),
        }
    }
}

/// A user of the control plane. Credential clear values live in cluster
/// secrets; the record keeps masked copies plus the owning secret name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub name: String,
    /// Caller API key bound to this user's paths. Never serialized outward
    /// except in the create-user response.
    #[serde(skip_serializing, default)]
    pub api_key: Option<String>,
    pub github_token_masked: Option<String>,
    pub github_secret_name: Option<String>,
    pub workspace_key_masked: Option<String>,
    pub workspace_secret_name: Option<String>,
    /// Unix epoch timestamp in milliseconds.
    pub created_at: i64,
    /// Unix epoch timestamp in milliseconds.
    pub updated_at: i64,
}

/// Summary of an agent-side session, mirrored into the project record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub message_count: i64,
}

/// A project: one isolated agent runtime owned by exactly one user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub status: ProjectStatus,
    /// In-cluster URL of the agent, set only while `status` is `active`
    /// (or mid-transition out of it).
    pub endpoint: Option<String>,
    pub repo_url: Option<String>,
    pub has_repository: bool,
    pub last_error: Option<String>,
    pub github_key_set: bool,
    pub github_key_source: GithubKeySource,
    pub github_token_masked: Option<String>,
    pub sessions: Vec<SessionSummary>,
    /// Recognized setting key → coerced value.
    pub settings: BTreeMap<String, serde_json::Value>,
    pub extensions: Vec<Extension>,
    /// Unix epoch timestamp in milliseconds.
    pub created_at: i64,
    /// Unix epoch timestamp in milliseconds.
    pub updated_at: i64,
}

/// Masks a credential for storage and display: first and last four
/// characters with an ellipsis, or all stars for short values.
pub fn mask_token(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    if chars.len() <= 8 {
        return "****".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}…{}", head, tail)
}

/// `user_id` doubles as a DNS label fragment in namespace and host names,
/// so it is restricted at the API boundary.
pub fn valid_user_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 32
        && id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !id.starts_with('-')
        && !id.ends_with('-')
}

// ---------------------------------------------------------------------------
// Request / response DTOs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserListItem {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateUserRequest {
    pub id: String,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateUserResponse {
    pub id: String,
    pub name: String,
    /// Returned exactly once, at creation time.
    pub api_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateProjectRequest {
    pub name: String,
    pub github_key: Option<String>,
    pub repo_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateProjectResponse {
    pub project_id: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenameProjectRequest {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivateResponse {
    pub message: String,
    pub endpoint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GithubKeyRequest {
    pub github_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GithubKeyStatus {
    pub github_key_set: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceKeyRequest {
    pub workspace_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceKeyStatus {
    pub workspace_key_set: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionResponse {
    pub session: SessionSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsResponse {
    pub sessions: Vec<SessionSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub session_id: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageResponse {
    pub message: String,
    pub result: serde_json::Value,
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStatusResponse {
    pub project_status: ProjectStatus,
    /// Health snapshot as reported by the agent, if reachable.
    pub agent: Option<serde_json::Value>,
    /// Last readiness or clone failure recorded on the project.
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingUpdateRequest {
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingsUpdateResponse {
    pub message: String,
    pub restart_required: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingEntry {
    pub key: String,
    pub value: serde_json::Value,
    pub requires_restart: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingsResponse {
    pub settings: Vec<SettingEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtensionsResponse {
    pub extensions: Vec<Extension>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_text() {
        for s in [
            ProjectStatus::Inactive,
            ProjectStatus::Activating,
            ProjectStatus::Active,
            ProjectStatus::Deactivating,
            ProjectStatus::Error,
        ] {
            assert_eq!(s.as_str().parse::<ProjectStatus>().unwrap(), s);
        }
        assert!("running".parse::<ProjectStatus>().is_err());
    }

    #[test]
    fn activation_guards() {
        assert!(ProjectStatus::Inactive.can_activate());
        assert!(ProjectStatus::Error.can_activate());
        assert!(!ProjectStatus::Active.can_activate());
        assert!(!ProjectStatus::Activating.can_activate());
        assert!(ProjectStatus::Active.can_deactivate());
        assert!(!ProjectStatus::Deactivating.can_deactivate());
    }

    #[test]
    fn masking_keeps_only_edges() {
        assert_eq!(mask_token("ghp_abcdefghijklmnop"), "ghp_…mnop");
        assert_eq!(mask_token("short"), "****");
    }

    #[test]
    fn user_id_validation() {
        assert!(valid_user_id("u1"));
        assert!(valid_user_id("alice-dev"));
        assert!(!valid_user_id(""));
        assert!(!valid_user_id("Upper"));
        assert!(!valid_user_id("-lead"));
        assert!(!valid_user_id("trail-"));
        assert!(!valid_user_id("dot.ted"));
    }
}
