//! Deterministic environment resolution for a project's workload. The
//! resolved map is split into the non-secret half (config map) and the
//! credential half (secret); both are mounted as environment variables.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::extensions::{self, Extension};
use crate::models::GithubKeySource;
use crate::settings;

pub const ENV_USER_ID: &str = "USER_ID";
pub const ENV_PROJECT_ID: &str = "PROJECT_ID";
pub const ENV_AGENT_PORT: &str = "AGENT_PORT";
pub const ENV_EXTENSIONS: &str = "AGENT_EXTENSIONS";
pub const ENV_GIT_TOKEN: &str = "GIT_TOKEN";
pub const ENV_WORKSPACE_API_KEY: &str = "WORKSPACE_API_KEY";
pub const ENV_AGENT_SYSTEM_TOKEN: &str = "AGENT_SYSTEM_TOKEN";

/// Clear credential values gathered from the cluster secrets that own them.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub project_github_token: Option<String>,
    pub user_github_token: Option<String>,
    pub workspace_api_key: Option<String>,
    pub agent_system_token: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedEnv {
    pub config: BTreeMap<String, String>,
    pub secret: BTreeMap<String, String>,
    /// Where the Git token came from, if one resolved at all.
    pub github_source: Option<GithubKeySource>,
}

impl ResolvedEnv {
    pub fn github_key_set(&self) -> bool {
        self.github_source.is_some()
    }
}

/// Token precedence is project > user > none; settings fall back to their
/// declared default or are omitted entirely.
pub fn resolve(
    user_id: &str,
    project_id: &str,
    agent_port: i32,
    project_settings: &BTreeMap<String, Value>,
    project_extensions: &[Extension],
    creds: &Credentials,
) -> ResolvedEnv {
    let mut config = BTreeMap::new();
    config.insert(ENV_USER_ID.to_string(), user_id.to_string());
    config.insert(ENV_PROJECT_ID.to_string(), project_id.to_string());
    config.insert(ENV_AGENT_PORT.to_string(), agent_port.to_string());
    config.insert(
        ENV_EXTENSIONS.to_string(),
        extensions::render_env(project_extensions),
    );

    for def in settings::REGISTRY {
        let value = project_settings
            .get(def.key)
            .cloned()
            .or_else(|| def.default_value());
        if let Some(value) = value {
            config.insert(def.env.to_string(), def.env_string(&value));
        }
    }

    let mut secret = BTreeMap::new();
    let github_source = match (&creds.project_github_token, &creds.user_github_token) {
        (Some(token), _) => {
            secret.insert(ENV_GIT_TOKEN.to_string(), token.clone());
            Some(GithubKeySource::Project)
        }
        (None, Some(token)) => {
            secret.insert(ENV_GIT_TOKEN.to_string(), token.clone());
            Some(GithubKeySource::User)
        }
        (None, None) => None,
    };
    if let Some(key) = &creds.workspace_api_key {
        secret.insert(ENV_WORKSPACE_API_KEY.to_string(), key.clone());
    }
    secret.insert(
        ENV_AGENT_SYSTEM_TOKEN.to_string(),
        creds.agent_system_token.clone(),
    );

    ResolvedEnv {
        config,
        secret,
        github_source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn creds(project: Option<&str>, user: Option<&str>) -> Credentials {
        Credentials {
            project_github_token: project.map(str::to_string),
            user_github_token: user.map(str::to_string),
            workspace_api_key: Some("wk-1".to_string()),
            agent_system_token: "ast-1".to_string(),
        }
    }

    #[test]
    fn project_token_wins_over_user_token() {
        let env = resolve(
            "u1",
            "p1",
            8000,
            &BTreeMap::new(),
            &[],
            &creds(Some("T_proj"), Some("T_user")),
        );
        assert_eq!(env.secret[ENV_GIT_TOKEN], "T_proj");
        assert_eq!(env.github_source, Some(GithubKeySource::Project));
    }

    #[test]
    fn user_token_used_when_project_has_none() {
        let env = resolve(
            "u1",
            "p1",
            8000,
            &BTreeMap::new(),
            &[],
            &creds(None, Some("T_user")),
        );
        assert_eq!(env.secret[ENV_GIT_TOKEN], "T_user");
        assert_eq!(env.github_source, Some(GithubKeySource::User));
    }

    #[test]
    fn no_token_means_no_variable() {
        let env = resolve("u1", "p1", 8000, &BTreeMap::new(), &[], &creds(None, None));
        assert!(!env.secret.contains_key(ENV_GIT_TOKEN));
        assert_eq!(env.github_source, None);
        assert!(!env.github_key_set());
    }

    #[test]
    fn explicit_setting_overrides_default() {
        let settings = BTreeMap::from([("temperature".to_string(), json!(0.1))]);
        let env = resolve("u1", "p1", 8000, &settings, &[], &creds(None, None));
        assert_eq!(env.config["AGENT_TEMPERATURE"], "0.1");
        // defaulted setting still present
        assert_eq!(env.config["AGENT_PROVIDER"], "openai");
        // no default and no explicit value: omitted
        assert!(!env.config.contains_key("AGENT_MODEL"));
    }

    #[test]
    fn resolution_is_deterministic() {
        let settings = BTreeMap::from([("model".to_string(), json!("m-large"))]);
        let a = resolve("u1", "p1", 8000, &settings, &[], &creds(Some("t"), None));
        let b = resolve("u1", "p1", 8000, &settings, &[], &creds(Some("t"), None));
        assert_eq!(a, b);
    }

    #[test]
    fn identity_variables_present() {
        let env = resolve("u7", "p9", 9000, &BTreeMap::new(), &[], &creds(None, None));
        assert_eq!(env.config[ENV_USER_ID], "u7");
        assert_eq!(env.config[ENV_PROJECT_ID], "p9");
        assert_eq!(env.config[ENV_AGENT_PORT], "9000");
        assert_eq!(env.secret[ENV_AGENT_SYSTEM_TOKEN], "ast-1");
    }
}
