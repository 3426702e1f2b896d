//! Typed façade over the cluster's imperative API. Hides transport and the
//! usual create/delete races: "already exists" is success for creates,
//! "not found" is success for deletes.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, anyhow};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Pod, ResourceQuota, Secret, Service};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use kube::api::{AttachParams, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::core::NamespaceResourceScope;
use kube::{Api, Client, Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::error::ApiError;

/// Field manager name for server-side apply.
const MANAGER_NAME: &str = "aviary-control";

/// How long to wait for a load balancer to publish an address.
const LB_WAIT_ATTEMPTS: usize = 10;

/// Whether an apply created the object or replaced an existing one. The
/// lifecycle engine uses this to scope rollback to objects it created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Created,
    Replaced,
}

/// Object kinds the control plane manages, for name-based deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Deployment,
    Service,
    Ingress,
    Secret,
    ConfigMap,
}

#[derive(Debug, Clone)]
pub struct PodReadiness {
    pub name: String,
    pub phase: String,
    pub ready: bool,
}

#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Clone)]
pub struct Orchestrator {
    client: Client,
}

impl Orchestrator {
    /// Connects using the ambient kube config (in-cluster service account or
    /// local kubeconfig). Fatal at boot if neither is available.
    pub async fn connect() -> Result<Self, ApiError> {
        let client = Client::try_default().await?;
        Ok(Self { client })
    }

    /// Create the namespace if missing; if present, verify labels and patch
    /// them back when they drift. The quota is applied in either case.
    pub async fn ensure_namespace(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
        quota: Option<&ResourceQuota>,
    ) -> Result<(), ApiError> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        match api.get_opt(name).await? {
            None => {
                let ns = Namespace {
                    metadata: kube::api::ObjectMeta {
                        name: Some(name.to_string()),
                        labels: Some(labels.clone()),
                        ..Default::default()
                    },
                    ..Default::default()
                };
                match api.create(&PostParams::default(), &ns).await {
                    Ok(_) => {}
                    // Concurrent creator won the race.
                    Err(kube::Error::Api(ae)) if ae.code == 409 => {}
                    Err(e) => return Err(e.into()),
                }
            }
            Some(existing) => {
                let current = existing.labels();
                let drifted = labels
                    .iter()
                    .any(|(k, v)| current.get(k).map(|c| c != v).unwrap_or(true));
                if drifted {
                    let patch = serde_json::json!({ "metadata": { "labels": labels } });
                    api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
                        .await?;
                }
            }
        }
        if let Some(quota) = quota {
            self.apply(name, quota).await?;
        }
        Ok(())
    }

    /// Create-or-replace via server-side apply. Reports whether the object
    /// existed beforehand so callers can scope rollback.
    pub async fn apply<K>(&self, namespace: &str, obj: &K) -> Result<Applied, ApiError>
    where
        K: Resource<Scope = NamespaceResourceScope>
            + Clone
            + std::fmt::Debug
            + Serialize
            + DeserializeOwned,
        <K as Resource>::DynamicType: Default,
    {
        let name = obj
            .meta()
            .name
            .clone()
            .ok_or_else(|| ApiError::Internal(anyhow!("object is missing metadata.name")))?;
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let existed = api.get_opt(&name).await?.is_some();
        api.patch(
            &name,
            &PatchParams::apply(MANAGER_NAME).force(),
            &Patch::Apply(obj),
        )
        .await?;
        Ok(if existed {
            Applied::Replaced
        } else {
            Applied::Created
        })
    }

    /// Idempotent replica-count write.
    pub async fn scale_deployment(
        &self,
        namespace: &str,
        name: &str,
        replicas: i32,
    ) -> Result<(), ApiError> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "spec": { "replicas": replicas } });
        match api
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Err(ApiError::NotFound(format!(
                "deployment {}/{} not found",
                namespace, name
            ))),
            Err(e) => Err(e.into()),
        }
    }

    /// Arbitrary merge patch against a deployment; used for the rolling
    /// restart annotation.
    pub async fn patch_deployment(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<(), ApiError> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        api.patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await?;
        Ok(())
    }

    /// Best-effort delete: absence is not an error.
    pub async fn delete_namespaced(
        &self,
        kind: ObjectKind,
        namespace: &str,
        name: &str,
    ) -> Result<(), ApiError> {
        match kind {
            ObjectKind::Deployment => self.delete::<Deployment>(namespace, name).await,
            ObjectKind::Service => self.delete::<Service>(namespace, name).await,
            ObjectKind::Ingress => self.delete::<Ingress>(namespace, name).await,
            ObjectKind::Secret => self.delete::<Secret>(namespace, name).await,
            ObjectKind::ConfigMap => self.delete::<ConfigMap>(namespace, name).await,
        }
    }

    async fn delete<K>(&self, namespace: &str, name: &str) -> Result<(), ApiError>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + std::fmt::Debug + DeserializeOwned,
        <K as Resource>::DynamicType: Default,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Decoded key→value view of a secret, or `None` when it doesn't exist.
    pub async fn read_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>, ApiError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let Some(secret) = api.get_opt(name).await? else {
            return Ok(None);
        };
        let mut out = BTreeMap::new();
        if let Some(data) = secret.data {
            for (k, v) in data {
                out.insert(k, String::from_utf8_lossy(&v.0).to_string());
            }
        }
        if let Some(string_data) = secret.string_data {
            out.extend(string_data);
        }
        Ok(Some(out))
    }

    /// Resolve the URL at which the service accepts traffic. Cluster-internal
    /// services resolve to their DNS name; load balancers are polled until an
    /// external address is published.
    pub async fn read_service_endpoint(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<String, ApiError> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let service = api.get_opt(name).await?.ok_or_else(|| {
            ApiError::NotFound(format!("service {}/{} not found", namespace, name))
        })?;
        let spec = service.spec.clone().unwrap_or_default();
        let port = spec
            .ports
            .as_ref()
            .and_then(|ports| ports.first())
            .map(|p| p.port)
            .unwrap_or(80);

        if spec.type_.as_deref() == Some("LoadBalancer") {
            let cancel = CancellationToken::new();
            let base = Duration::from_millis(500);
            let cap = Duration::from_secs(10);
            for attempt in 0..LB_WAIT_ATTEMPTS {
                let current = api.get_opt(name).await?;
                if let Some(addr) = current.as_ref().and_then(lb_address) {
                    return Ok(format!("http://{}:{}", addr, port));
                }
                let delay = aviary_common::wait::backoff_full_jitter(base, cap, attempt);
                aviary_common::wait::sleep_cancellable(&cancel, delay)
                    .await
                    .map_err(|e| ApiError::Cancelled(e.to_string()))?;
            }
            return Err(ApiError::Upstream(format!(
                "load balancer {}/{} has no address yet",
                namespace, name
            )));
        }

        Ok(format!(
            "http://{}.{}.svc.cluster.local:{}",
            name, namespace, port
        ))
    }

    /// Phase and readiness of every pod matching the label selector.
    pub async fn get_pod_status(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<PodReadiness>, ApiError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pods = api.list(&ListParams::default().labels(selector)).await?;
        Ok(pods
            .items
            .iter()
            .map(|pod| {
                let status = pod.status.as_ref();
                let phase = status
                    .and_then(|s| s.phase.clone())
                    .unwrap_or_else(|| "Unknown".to_string());
                let ready = status
                    .and_then(|s| s.conditions.as_ref())
                    .map(|conds| {
                        conds
                            .iter()
                            .any(|c| c.type_ == "Ready" && c.status == "True")
                    })
                    .unwrap_or(false);
                PodReadiness {
                    name: pod.name_any(),
                    phase,
                    ready,
                }
            })
            .collect())
    }

    /// Open a streamed exec channel against the first running pod matching
    /// the selector; returns the exit code plus captured output.
    pub async fn exec_in_pod(
        &self,
        namespace: &str,
        selector: &str,
        command: &[&str],
        stdin: Option<&str>,
    ) -> Result<ExecOutput, ApiError> {
        let pods = self.get_pod_status(namespace, selector).await?;
        let pod_name = pods
            .iter()
            .find(|p| p.phase == "Running")
            .map(|p| p.name.clone())
            .ok_or_else(|| {
                ApiError::NotFound(format!(
                    "no running pod matches {} in {}",
                    selector, namespace
                ))
            })?;

        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = AttachParams::default()
            .stdin(stdin.is_some())
            .stdout(true)
            .stderr(true);
        let mut attached = api.exec(&pod_name, command.to_vec(), &params).await?;

        if let Some(input) = stdin {
            let mut writer = attached
                .stdin()
                .ok_or_else(|| ApiError::Internal(anyhow!("exec channel has no stdin")))?;
            writer
                .write_all(input.as_bytes())
                .await
                .context("write exec stdin")
                .map_err(ApiError::Internal)?;
            writer
                .shutdown()
                .await
                .context("close exec stdin")
                .map_err(ApiError::Internal)?;
        }

        let mut stdout_reader = attached
            .stdout()
            .ok_or_else(|| ApiError::Internal(anyhow!("exec channel has no stdout")))?;
        let mut stderr_reader = attached
            .stderr()
            .ok_or_else(|| ApiError::Internal(anyhow!("exec channel has no stderr")))?;
        let status_fut = attached
            .take_status()
            .ok_or_else(|| ApiError::Internal(anyhow!("exec status already taken")))?;

        let mut stdout_buf = Vec::new();
        let mut stderr_buf = Vec::new();
        let (out_res, err_res, status) = tokio::join!(
            stdout_reader.read_to_end(&mut stdout_buf),
            stderr_reader.read_to_end(&mut stderr_buf),
            status_fut,
        );
        out_res
            .context("read exec stdout")
            .map_err(ApiError::Internal)?;
        err_res
            .context("read exec stderr")
            .map_err(ApiError::Internal)?;

        Ok(ExecOutput {
            exit_code: exit_code_from_status(status),
            stdout: String::from_utf8_lossy(&stdout_buf).to_string(),
            stderr: String::from_utf8_lossy(&stderr_buf).to_string(),
        })
    }
}

fn lb_address(service: &Service) -> Option<String> {
    let ingress = service
        .status
        .as_ref()?
        .load_balancer
        .as_ref()?
        .ingress
        .as_ref()?;
    let first = ingress.first()?;
    first.ip.clone().or_else(|| first.hostname.clone())
}

/// The apiserver reports exec completion as a `Status` object; a non-zero
/// exit surfaces as reason `NonZeroExitCode` with the code in the causes.
fn exit_code_from_status(status: Option<Status>) -> i32 {
    let Some(status) = status else {
        return -1;
    };
    if status.status.as_deref() == Some("Success") {
        return 0;
    }
    if status.reason.as_deref() == Some("NonZeroExitCode")
        && let Some(details) = &status.details
        && let Some(causes) = &details.causes
        && let Some(cause) = causes.iter().find(|c| c.reason.as_deref() == Some("ExitCode"))
        && let Some(message) = &cause.message
        && let Ok(code) = message.parse::<i32>()
    {
        return code;
    }
    1
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{StatusCause, StatusDetails};

    fn failure_status(code: &str) -> Status {
        Status {
            status: Some("Failure".to_string()),
            reason: Some("NonZeroExitCode".to_string()),
            details: Some(StatusDetails {
                causes: Some(vec![StatusCause {
                    reason: Some("ExitCode".to_string()),
                    message: Some(code.to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn exec_success_maps_to_zero() {
        let status = Status {
            status: Some("Success".to_string()),
            ..Default::default()
        };
        assert_eq!(exit_code_from_status(Some(status)), 0);
    }

    #[test]
    fn exec_failure_extracts_exit_code() {
        assert_eq!(exit_code_from_status(Some(failure_status("128"))), 128);
    }

    #[test]
    fn exec_missing_status_is_unknown_failure() {
        assert_eq!(exit_code_from_status(None), -1);
        let vague = Status {
            status: Some("Failure".to_string()),
            ..Default::default()
        };
        assert_eq!(exit_code_from_status(Some(vague)), 1);
    }
}
