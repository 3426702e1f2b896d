//! The project lifecycle engine: drives state transitions by composing the
//! metadata store, the renderer, and the orchestrator. Every transition
//! writes its status to the store before returning; cluster-touching
//! transitions write the intermediate status first, then operate, then
//! write the terminal status.

pub mod env;
pub mod readiness;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use deadpool_postgres::Pool;
use serde_json::Value;
use tokio::sync::Mutex as TokioMutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cloner;
use crate::db;
use crate::error::ApiError;
use crate::extensions::Extension;
use crate::models::{GithubKeySource, Project, ProjectStatus, User, mask_token};
use crate::orchestrator::{Applied, ObjectKind, Orchestrator};
use crate::render::{self, RESTARTED_AT_ANNOTATION, ResourceBundle, WorkloadConfig};

/// Overall budget for an activation, readiness wait included.
const ACTIVATION_BUDGET: Duration = Duration::from_secs(150);

/// Secret keys inside the credential secrets.
const KEY_GITHUB_TOKEN: &str = "github_token";
const KEY_WORKSPACE_API_KEY: &str = "workspace_api_key";

pub struct LifecycleEngine {
    pool: Pool,
    orch: Orchestrator,
    cfg: WorkloadConfig,
    http: reqwest::Client,
    /// Per-project transition locks. Small critical sections only; the lock
    /// is held across a whole transition but never across unrelated
    /// projects.
    locks: StdMutex<HashMap<String, Arc<TokioMutex<()>>>>,
    /// Cancellation handles for in-flight activations, so deletion can tear
    /// a pending activation down.
    inflight: StdMutex<HashMap<String, CancellationToken>>,
}

impl LifecycleEngine {
    pub fn new(pool: Pool, orch: Orchestrator, cfg: WorkloadConfig) -> Self {
        Self {
            pool,
            orch,
            cfg,
            http: reqwest::Client::new(),
            locks: StdMutex::new(HashMap::new()),
            inflight: StdMutex::new(HashMap::new()),
        }
    }

    pub fn workload_config(&self) -> &WorkloadConfig {
        &self.cfg
    }

    fn lock_for(&self, project_id: &str) -> Arc<TokioMutex<()>> {
        let mut locks = self.locks.lock().expect("project lock registry poisoned");
        locks
            .entry(project_id.to_string())
            .or_insert_with(|| Arc::new(TokioMutex::new(())))
            .clone()
    }

    fn register_inflight(&self, project_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.inflight
            .lock()
            .expect("inflight registry poisoned")
            .insert(project_id.to_string(), token.clone());
        let timer = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(ACTIVATION_BUDGET).await;
            timer.cancel();
        });
        token
    }

    fn clear_inflight(&self, project_id: &str) {
        self.inflight
            .lock()
            .expect("inflight registry poisoned")
            .remove(project_id);
    }

    fn cancel_inflight(&self, project_id: &str) {
        if let Some(token) = self
            .inflight
            .lock()
            .expect("inflight registry poisoned")
            .get(project_id)
        {
            token.cancel();
        }
    }

    // -----------------------------------------------------------------------
    // Credential gathering and rendering
    // -----------------------------------------------------------------------

    /// Clear values live only in cluster secrets; gather them for rendering.
    async fn gather_credentials(
        &self,
        user: &User,
        project_id: &str,
    ) -> Result<env::Credentials, ApiError> {
        let namespace = render::names::namespace(&user.id);
        let project_secret = self
            .orch
            .read_secret(&namespace, &render::names::project_github_secret(project_id))
            .await?;
        let user_secret = self
            .orch
            .read_secret(&namespace, &render::names::user_credentials(&user.id))
            .await?;
        let existing = self
            .orch
            .read_secret(&namespace, &render::names::secret(project_id))
            .await?;

        // The agent-system token is minted once per project and survives
        // re-activation.
        let agent_system_token = existing
            .as_ref()
            .and_then(|s| s.get(env::ENV_AGENT_SYSTEM_TOKEN).cloned())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        Ok(env::Credentials {
            project_github_token: project_secret
                .as_ref()
                .and_then(|s| s.get(KEY_GITHUB_TOKEN).cloned()),
            user_github_token: user_secret
                .as_ref()
                .and_then(|s| s.get(KEY_GITHUB_TOKEN).cloned()),
            workspace_api_key: user_secret
                .as_ref()
                .and_then(|s| s.get(KEY_WORKSPACE_API_KEY).cloned()),
            agent_system_token,
        })
    }

    async fn render_bundle(
        &self,
        user: &User,
        project: &Project,
        replicas: i32,
    ) -> Result<(ResourceBundle, env::ResolvedEnv), ApiError> {
        let creds = self.gather_credentials(user, &project.id).await?;
        if creds.workspace_api_key.is_none() {
            tracing::warn!(
                project_id = %project.id,
                "no workspace API key resolved; agent may refuse requests"
            );
        }
        let resolved = env::resolve(
            &user.id,
            &project.id,
            self.cfg.agent_port,
            &project.settings,
            &project.extensions,
            &creds,
        );
        let bundle = render::render(
            &user.id,
            &project.id,
            replicas,
            &resolved.config,
            &resolved.secret,
            &self.cfg,
        );
        Ok((bundle, resolved))
    }

    /// Spec apply order: namespace → secret → config map → service →
    /// ingress → deployment. The deployment goes last so its pods find the
    /// secret and config map already present on first mount.
    async fn apply_bundle(
        &self,
        bundle: &ResourceBundle,
        created: &mut Vec<(ObjectKind, String)>,
    ) -> Result<(), ApiError> {
        let ns = &bundle.namespace;
        self.orch
            .ensure_namespace(ns, &bundle.namespace_labels, Some(&bundle.quota))
            .await?;

        let name = bundle.secret.metadata.name.clone().unwrap_or_default();
        if self.orch.apply(ns, &bundle.secret).await? == Applied::Created {
            created.push((ObjectKind::Secret, name));
        }
        let name = bundle.config_map.metadata.name.clone().unwrap_or_default();
        if self.orch.apply(ns, &bundle.config_map).await? == Applied::Created {
            created.push((ObjectKind::ConfigMap, name));
        }
        let name = bundle.service.metadata.name.clone().unwrap_or_default();
        if self.orch.apply(ns, &bundle.service).await? == Applied::Created {
            created.push((ObjectKind::Service, name));
        }
        if let Some(ingress) = &bundle.ingress {
            let name = ingress.metadata.name.clone().unwrap_or_default();
            if self.orch.apply(ns, ingress).await? == Applied::Created {
                created.push((ObjectKind::Ingress, name));
            }
        }
        let name = bundle.deployment.metadata.name.clone().unwrap_or_default();
        if self.orch.apply(ns, &bundle.deployment).await? == Applied::Created {
            created.push((ObjectKind::Deployment, name));
        }
        Ok(())
    }

    /// Rollback is scoped: only objects created by the failing call are
    /// reverted, in reverse creation order.
    async fn rollback(&self, namespace: &str, created: &[(ObjectKind, String)]) {
        for (kind, name) in created.iter().rev() {
            if let Err(e) = self.orch.delete_namespaced(*kind, namespace, name).await {
                tracing::warn!(%namespace, %name, ?kind, error = %e, "rollback delete failed");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Public operations
    // -----------------------------------------------------------------------

    /// Create a project and drive it to `active` before returning. On any
    /// cluster failure the objects created by this call are rolled back and
    /// the record is left in `error`.
    pub async fn create_project(
        &self,
        user: &User,
        name: &str,
        repo_url: Option<&str>,
        initial_github_token: Option<&str>,
    ) -> Result<Project, ApiError> {
        let project_id = db::new_project_id();
        let now = db::now_ms();
        let namespace = render::names::namespace(&user.id);

        let project = Project {
            id: project_id.clone(),
            user_id: user.id.clone(),
            name: name.to_string(),
            status: ProjectStatus::Inactive,
            endpoint: None,
            repo_url: repo_url.map(str::to_string),
            has_repository: false,
            last_error: None,
            github_key_set: initial_github_token.is_some()
                || user.github_secret_name.is_some(),
            github_key_source: if initial_github_token.is_some() {
                GithubKeySource::Project
            } else {
                GithubKeySource::User
            },
            github_token_masked: initial_github_token.map(mask_token),
            sessions: Vec::new(),
            settings: BTreeMap::new(),
            extensions: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        db::create_project(&self.pool, &project).await?;

        // The project-owned token secret must exist before resolution reads
        // it, and its namespace before that.
        if let Some(token) = initial_github_token {
            self.orch
                .ensure_namespace(&namespace, &namespace_labels(), None)
                .await?;
            let secret = render::credential_secret(
                &namespace,
                &render::names::project_github_secret(&project_id),
                &BTreeMap::from([(KEY_GITHUB_TOKEN.to_string(), token.to_string())]),
            );
            self.orch.apply(&namespace, &secret).await?;
        }

        self.run_activation(user, &project_id, true).await
    }

    /// Re-render (picking up setting and credential changes), re-apply, and
    /// wait for readiness. Valid from `inactive` and `error`; a project that
    /// is already `active` is a no-op.
    pub async fn activate_project(&self, project_id: &str) -> Result<Project, ApiError> {
        let project = self.load_project(project_id).await?;
        if project.status.is_active() {
            return Ok(project);
        }
        if !project.status.can_activate() {
            return Err(ApiError::Conflict(format!(
                "project {} is {}; activation requires inactive or error",
                project_id, project.status
            )));
        }
        let user = self.load_user(&project.user_id).await?;
        // Retries reuse objects left behind by prior attempts.
        self.run_activation(&user, project_id, false).await
    }

    async fn run_activation(
        &self,
        user: &User,
        project_id: &str,
        rollback_on_failure: bool,
    ) -> Result<Project, ApiError> {
        let lock = self.lock_for(project_id);
        let Ok(_guard) = lock.try_lock() else {
            return Err(ApiError::Conflict(format!(
                "project {} has a transition in flight",
                project_id
            )));
        };
        let cancel = self.register_inflight(project_id);
        let result = self
            .activate_inner(user, project_id, rollback_on_failure, &cancel)
            .await;
        self.clear_inflight(project_id);
        result
    }

    async fn activate_inner(
        &self,
        user: &User,
        project_id: &str,
        rollback_on_failure: bool,
        cancel: &CancellationToken,
    ) -> Result<Project, ApiError> {
        db::set_status(&self.pool, project_id, ProjectStatus::Activating, None).await?;

        let project = self.load_project(project_id).await?;
        let mut created: Vec<(ObjectKind, String)> = Vec::new();
        let outcome = self
            .activate_cluster_steps(user, &project, &mut created, cancel)
            .await;

        match outcome {
            Ok((endpoint, resolved)) => {
                let mut changes = serde_json::Map::new();
                changes.insert("status".to_string(), Value::String("active".to_string()));
                changes.insert("endpoint".to_string(), Value::String(endpoint.clone()));
                changes.insert("last_error".to_string(), Value::Null);
                changes.insert(
                    "github_key_set".to_string(),
                    Value::Bool(resolved.github_key_set()),
                );
                if let Some(source) = resolved.github_source {
                    changes.insert(
                        "github_key_source".to_string(),
                        Value::String(source.as_str().to_string()),
                    );
                }
                let project = db::update_project_fields(&self.pool, project_id, &changes).await?;

                // The clone attempt completes before the response does, but
                // its failure never fails the activation.
                if let Some(repo_url) = project.repo_url.clone() {
                    self.attempt_clone(&project, &repo_url).await?;
                    return self.load_project(project_id).await;
                }
                Ok(project)
            }
            Err(e) => {
                if rollback_on_failure {
                    let namespace = render::names::namespace(&user.id);
                    self.rollback(&namespace, &created).await;
                }
                // Terminal status write is best-effort; the record may have
                // been deleted by a concurrent delete_project.
                let mut changes = serde_json::Map::new();
                changes.insert("status".to_string(), Value::String("error".to_string()));
                changes.insert("endpoint".to_string(), Value::Null);
                changes.insert("last_error".to_string(), Value::String(e.to_string()));
                let _ = db::update_project_fields(&self.pool, project_id, &changes).await;
                Err(e)
            }
        }
    }

    async fn activate_cluster_steps(
        &self,
        user: &User,
        project: &Project,
        created: &mut Vec<(ObjectKind, String)>,
        cancel: &CancellationToken,
    ) -> Result<(String, env::ResolvedEnv), ApiError> {
        let (bundle, resolved) = self.render_bundle(user, project, 1).await?;
        self.apply_bundle(&bundle, created).await?;

        let namespace = &bundle.namespace;
        let workload = render::names::workload(&project.id);
        let endpoint = self
            .orch
            .read_service_endpoint(namespace, &workload)
            .await?;
        let health_url = format!(
            "{}{}",
            endpoint.trim_end_matches('/'),
            self.cfg.agent_health_path
        );
        readiness::wait_ready(
            &self.orch,
            &self.http,
            namespace,
            &render::names::selector(&project.id),
            &health_url,
            cancel,
        )
        .await?;
        Ok((endpoint, resolved))
    }

    async fn attempt_clone(&self, project: &Project, repo_url: &str) -> Result<(), ApiError> {
        let namespace = render::names::namespace(&project.user_id);
        let selector = render::names::selector(&project.id);
        let outcome = cloner::clone_repository(
            &self.orch,
            &namespace,
            &selector,
            &self.cfg.workspace_dir,
            repo_url,
        )
        .await;

        let mut changes = serde_json::Map::new();
        match outcome {
            Ok(Ok(())) => {
                changes.insert("has_repository".to_string(), Value::Bool(true));
                changes.insert("last_error".to_string(), Value::Null);
            }
            Ok(Err(failure)) => {
                changes.insert("has_repository".to_string(), Value::Bool(false));
                changes.insert(
                    "last_error".to_string(),
                    Value::String(format!(
                        "clone exited {}: {}",
                        failure.exit_code, failure.detail
                    )),
                );
            }
            Err(e) => {
                changes.insert("has_repository".to_string(), Value::Bool(false));
                changes.insert(
                    "last_error".to_string(),
                    Value::String(e.to_string()),
                );
            }
        }
        db::update_project_fields(&self.pool, &project.id, &changes).await?;
        Ok(())
    }

    /// Explicit re-clone of an active project's repository.
    pub async fn clone_repository(&self, project_id: &str) -> Result<Project, ApiError> {
        let project = self.load_project(project_id).await?;
        if !project.status.is_active() {
            return Err(ApiError::ProjectNotActive(project_id.to_string()));
        }
        let repo_url = project
            .repo_url
            .clone()
            .ok_or_else(|| {
                ApiError::InvalidArgument(format!("project {} has no repo_url", project_id))
            })?;
        self.attempt_clone(&project, &repo_url).await?;
        self.load_project(project_id).await
    }

    /// Scale to zero and wait (best-effort) for pod termination. Secret,
    /// config map, service, and ingress are preserved for cheap
    /// reactivation.
    pub async fn deactivate_project(&self, project_id: &str) -> Result<Project, ApiError> {
        let project = self.load_project(project_id).await?;
        if !project.status.can_deactivate() {
            return Err(ApiError::Conflict(format!(
                "project {} is {}; deactivation requires active",
                project_id, project.status
            )));
        }
        let lock = self.lock_for(project_id);
        let Ok(_guard) = lock.try_lock() else {
            return Err(ApiError::Conflict(format!(
                "project {} has a transition in flight",
                project_id
            )));
        };

        db::set_status(
            &self.pool,
            project_id,
            ProjectStatus::Deactivating,
            project.endpoint.as_deref(),
        )
        .await?;

        let namespace = render::names::namespace(&project.user_id);
        let workload = render::names::workload(project_id);
        match self.orch.scale_deployment(&namespace, &workload, 0).await {
            Ok(()) => {}
            // A deployment that is already gone is as scaled-down as it gets.
            Err(ApiError::NotFound(_)) => {}
            Err(e) => {
                let _ = db::set_status(&self.pool, project_id, ProjectStatus::Error, None).await;
                return Err(e);
            }
        }

        let cancel = CancellationToken::new();
        let drained = readiness::wait_drained(
            &self.orch,
            &namespace,
            &render::names::selector(project_id),
            &cancel,
        )
        .await?;
        if !drained {
            tracing::warn!(project_id, "pods still terminating at drain deadline");
        }

        db::set_status(&self.pool, project_id, ProjectStatus::Inactive, None).await?;
        self.load_project(project_id).await
    }

    /// Delete the cluster objects and then the record. Allowed from any
    /// state; an in-flight activation is cancelled first. Object deletion
    /// failures are logged, never fatal. The shared namespace is kept.
    pub async fn delete_project(&self, project_id: &str) -> Result<(), ApiError> {
        let project = self.load_project(project_id).await?;
        self.cancel_inflight(project_id);

        // Wait for any in-flight transition to unwind before tearing down.
        let lock = self.lock_for(project_id);
        let _guard = lock.lock().await;

        let namespace = render::names::namespace(&project.user_id);
        let workload = render::names::workload(project_id);
        let deletions = [
            (ObjectKind::Ingress, workload.clone()),
            (ObjectKind::Service, workload.clone()),
            (ObjectKind::Deployment, workload.clone()),
            (ObjectKind::Secret, render::names::secret(project_id)),
            (ObjectKind::ConfigMap, render::names::config_map(project_id)),
            (
                ObjectKind::Secret,
                render::names::project_github_secret(project_id),
            ),
        ];
        for (kind, name) in deletions {
            if let Err(e) = self.orch.delete_namespaced(kind, &namespace, &name).await {
                tracing::warn!(project_id, %name, ?kind, error = %e, "object deletion failed");
            }
        }

        if !db::delete_project(&self.pool, project_id).await? {
            return Err(ApiError::project_not_found(project_id));
        }
        self.locks
            .lock()
            .expect("project lock registry poisoned")
            .remove(project_id);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Settings, extensions, credentials
    // -----------------------------------------------------------------------

    /// Store validated setting changes; a restart-requiring change on an
    /// active project re-renders the runtime config and rolls the pods.
    /// Returns whether a restart was triggered.
    pub async fn update_settings(
        &self,
        project_id: &str,
        coerced: &BTreeMap<String, Value>,
        restart_required: bool,
    ) -> Result<bool, ApiError> {
        let project = self.load_project(project_id).await?;
        let mut merged = project.settings.clone();
        for (key, value) in coerced {
            merged.insert(key.clone(), value.clone());
        }
        db::replace_settings(&self.pool, project_id, &merged).await?;

        if restart_required && project.status.is_active() {
            self.refresh_runtime_config(project_id).await?;
            return Ok(true);
        }
        Ok(false)
    }

    pub async fn remove_setting(
        &self,
        project_id: &str,
        key: &str,
        restart_required: bool,
    ) -> Result<bool, ApiError> {
        let project = self.load_project(project_id).await?;
        let mut merged = project.settings.clone();
        if merged.remove(key).is_none() {
            return Err(ApiError::NotFound(format!(
                "setting {} is not set on project {}",
                key, project_id
            )));
        }
        db::replace_settings(&self.pool, project_id, &merged).await?;

        if restart_required && project.status.is_active() {
            self.refresh_runtime_config(project_id).await?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Clears every explicit setting, restoring declared defaults.
    pub async fn reset_settings(&self, project_id: &str) -> Result<bool, ApiError> {
        let project = self.load_project(project_id).await?;
        if project.settings.is_empty() {
            return Ok(false);
        }
        let restart_required = project
            .settings
            .keys()
            .filter_map(|key| crate::settings::lookup(key))
            .any(|def| def.requires_restart);
        db::replace_settings(&self.pool, project_id, &BTreeMap::new()).await?;

        if restart_required && project.status.is_active() {
            self.refresh_runtime_config(project_id).await?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Extension changes always require a restart to take effect.
    pub async fn update_extensions(
        &self,
        project_id: &str,
        extensions: &[Extension],
    ) -> Result<bool, ApiError> {
        let project = self.load_project(project_id).await?;
        db::replace_extensions(&self.pool, project_id, extensions).await?;
        if project.status.is_active() {
            self.refresh_runtime_config(project_id).await?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Set or clear the project-scoped Git token. Clearing falls back to the
    /// user's global token when one exists.
    pub async fn update_github_token(
        &self,
        project_id: &str,
        token: Option<&str>,
    ) -> Result<Project, ApiError> {
        let project = self.load_project(project_id).await?;
        let user = self.load_user(&project.user_id).await?;
        let namespace = render::names::namespace(&user.id);
        let secret_name = render::names::project_github_secret(project_id);

        let mut changes = serde_json::Map::new();
        match token {
            Some(token) => {
                self.orch
                    .ensure_namespace(&namespace, &namespace_labels(), None)
                    .await?;
                let secret = render::credential_secret(
                    &namespace,
                    &secret_name,
                    &BTreeMap::from([(KEY_GITHUB_TOKEN.to_string(), token.to_string())]),
                );
                self.orch.apply(&namespace, &secret).await?;
                changes.insert("github_key_set".to_string(), Value::Bool(true));
                changes.insert(
                    "github_key_source".to_string(),
                    Value::String(GithubKeySource::Project.as_str().to_string()),
                );
                changes.insert(
                    "github_token_masked".to_string(),
                    Value::String(mask_token(token)),
                );
            }
            None => {
                self.orch
                    .delete_namespaced(ObjectKind::Secret, &namespace, &secret_name)
                    .await?;
                let creds = self.gather_credentials(&user, project_id).await?;
                changes.insert(
                    "github_key_set".to_string(),
                    Value::Bool(creds.user_github_token.is_some()),
                );
                changes.insert(
                    "github_key_source".to_string(),
                    Value::String(GithubKeySource::User.as_str().to_string()),
                );
                changes.insert("github_token_masked".to_string(), Value::Null);
            }
        }
        let updated = db::update_project_fields(&self.pool, project_id, &changes).await?;

        if project.status.is_active() {
            self.refresh_runtime_config(project_id).await?;
        }
        Ok(updated)
    }

    /// Set or clear the user's global Git token, then fan the change out to
    /// every project of the user that resolves through it. Duplicate restart
    /// annotations on already-restarting pods are harmless.
    pub async fn update_user_github_token(
        &self,
        user: &User,
        token: Option<&str>,
    ) -> Result<(), ApiError> {
        let namespace = render::names::namespace(&user.id);
        let secret_name = render::names::user_credentials(&user.id);
        self.orch
            .ensure_namespace(&namespace, &namespace_labels(), None)
            .await?;

        let mut data = self
            .orch
            .read_secret(&namespace, &secret_name)
            .await?
            .unwrap_or_default();
        match token {
            Some(token) => {
                data.insert(KEY_GITHUB_TOKEN.to_string(), token.to_string());
            }
            None => {
                data.remove(KEY_GITHUB_TOKEN);
            }
        }
        let secret = render::credential_secret(&namespace, &secret_name, &data);
        self.orch.apply(&namespace, &secret).await?;
        db::update_user_github_meta(
            &self.pool,
            &user.id,
            token.map(mask_token).as_deref(),
            token.map(|_| secret_name.as_str()),
        )
        .await?;

        // Projects owning their token are untouched; removal does not
        // cascade into them.
        for project in db::list_projects_by_user(&self.pool, &user.id).await? {
            if project.github_key_source == GithubKeySource::Project && project.github_key_set {
                continue;
            }
            let mut changes = serde_json::Map::new();
            changes.insert("github_key_set".to_string(), Value::Bool(token.is_some()));
            changes.insert(
                "github_key_source".to_string(),
                Value::String(GithubKeySource::User.as_str().to_string()),
            );
            db::update_project_fields(&self.pool, &project.id, &changes).await?;
            if project.status.is_active() {
                self.refresh_runtime_config(&project.id).await?;
            }
        }
        Ok(())
    }

    /// Set or clear the user's workspace API key; every active project of
    /// the user consumes it, so all of them restart.
    pub async fn update_user_workspace_key(
        &self,
        user: &User,
        key: Option<&str>,
    ) -> Result<(), ApiError> {
        let namespace = render::names::namespace(&user.id);
        let secret_name = render::names::user_credentials(&user.id);
        self.orch
            .ensure_namespace(&namespace, &namespace_labels(), None)
            .await?;

        let mut data = self
            .orch
            .read_secret(&namespace, &secret_name)
            .await?
            .unwrap_or_default();
        match key {
            Some(key) => {
                data.insert(KEY_WORKSPACE_API_KEY.to_string(), key.to_string());
            }
            None => {
                data.remove(KEY_WORKSPACE_API_KEY);
            }
        }
        let secret = render::credential_secret(&namespace, &secret_name, &data);
        self.orch.apply(&namespace, &secret).await?;
        db::update_user_workspace_meta(
            &self.pool,
            &user.id,
            key.map(mask_token).as_deref(),
            key.map(|_| secret_name.as_str()),
        )
        .await?;

        for project in db::list_projects_by_user(&self.pool, &user.id).await? {
            if project.status.is_active() {
                self.refresh_runtime_config(&project.id).await?;
            }
        }
        Ok(())
    }

    /// Re-render and re-apply the config map and secret, then roll the pods
    /// by bumping the restart annotation. Does not wait for the new pods.
    async fn refresh_runtime_config(&self, project_id: &str) -> Result<(), ApiError> {
        let project = self.load_project(project_id).await?;
        let user = self.load_user(&project.user_id).await?;
        let (bundle, _resolved) = self.render_bundle(&user, &project, 1).await?;
        let namespace = &bundle.namespace;
        self.orch.apply(namespace, &bundle.secret).await?;
        self.orch.apply(namespace, &bundle.config_map).await?;
        self.rolling_restart(namespace, &render::names::workload(project_id))
            .await
    }

    /// Patch a timestamp annotation onto the pod template; the deployment
    /// controller recreates pods under the normal rolling strategy.
    async fn rolling_restart(&self, namespace: &str, workload: &str) -> Result<(), ApiError> {
        let patch = serde_json::json!({
            "spec": {
                "template": {
                    "metadata": {
                        "annotations": {
                            (RESTARTED_AT_ANNOTATION): chrono::Utc::now().to_rfc3339(),
                        }
                    }
                }
            }
        });
        self.orch
            .patch_deployment(namespace, workload, &patch)
            .await
    }

    // -----------------------------------------------------------------------
    // Lookups
    // -----------------------------------------------------------------------

    async fn load_project(&self, project_id: &str) -> Result<Project, ApiError> {
        db::get_project(&self.pool, project_id)
            .await?
            .ok_or_else(|| ApiError::project_not_found(project_id))
    }

    async fn load_user(&self, user_id: &str) -> Result<User, ApiError> {
        db::get_user(&self.pool, user_id)
            .await?
            .ok_or_else(|| ApiError::user_not_found(user_id))
    }
}

fn namespace_labels() -> BTreeMap<String, String> {
    BTreeMap::from([(
        render::NAMESPACE_ROLE_LABEL.to_string(),
        render::NAMESPACE_ROLE.to_string(),
    )])
}
