//! Pure rendering of the cluster objects backing a project. Deterministic:
//! the same inputs always produce byte-identical specifications. This module
//! owns the naming scheme; every other component asks `names` instead of
//! formatting its own.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapEnvSource, Container, ContainerPort, EnvFromSource, HTTPGetAction,
    Namespace, PodSecurityContext, PodSpec, PodTemplateSpec, Probe, ResourceQuota,
    ResourceQuotaSpec, ResourceRequirements, Secret, SecretEnvSource, Service, ServicePort,
    ServiceSpec,
};
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, IngressTLS, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::ObjectMeta;

pub const NAMESPACE_ROLE_LABEL: &str = "role";
pub const NAMESPACE_ROLE: &str = "project-workload";
pub const RESTARTED_AT_ANNOTATION: &str = "aviary.io/restarted-at";

/// Canonical object names. The layout is part of the external contract:
/// given user `u` and project `p`, these names are bit-exact.
pub mod names {
    pub fn namespace(user_id: &str) -> String {
        format!("user-{}", user_id)
    }

    pub fn config_map(project_id: &str) -> String {
        format!("proj-{}-env", project_id)
    }

    pub fn secret(project_id: &str) -> String {
        format!("proj-{}-secrets", project_id)
    }

    /// Shared by the deployment, service, and ingress.
    pub fn workload(project_id: &str) -> String {
        format!("proj-{}-api", project_id)
    }

    pub fn app_label(project_id: &str) -> String {
        format!("proj-{}-api", project_id)
    }

    pub fn selector(project_id: &str) -> String {
        format!("app=proj-{}-api", project_id)
    }

    pub fn host(project_id: &str, user_id: &str, base_domain: &str) -> String {
        format!("{}-{}.{}", project_id, user_id, base_domain)
    }

    pub fn quota(user_id: &str) -> String {
        format!("user-{}-quota", user_id)
    }

    /// User-owned secret holding the global credentials, shared by all of
    /// the user's projects.
    pub fn user_credentials(user_id: &str) -> String {
        format!("user-{}-credentials", user_id)
    }

    /// Project-owned secret holding a project-scoped Git token.
    pub fn project_github_secret(project_id: &str) -> String {
        format!("proj-{}-github", project_id)
    }
}

/// Static workload shape, loaded once from server flags.
#[derive(Debug, Clone)]
pub struct WorkloadConfig {
    pub agent_image: String,
    pub agent_port: i32,
    pub agent_health_path: String,
    /// Ingress is emitted only when a base domain is configured.
    pub base_domain: Option<String>,
    pub ingress_class: String,
    /// Optional TLS secret name template with `{project}` / `{user}`
    /// placeholders.
    pub tls_secret_pattern: Option<String>,
    pub workspace_dir: String,
    pub cpu_request: String,
    pub cpu_limit: String,
    pub memory_request: String,
    pub memory_limit: String,
    pub quota_pods: String,
    pub quota_cpu: String,
    pub quota_memory: String,
}

/// Everything the lifecycle engine applies for one project.
#[derive(Debug, Clone)]
pub struct ResourceBundle {
    pub namespace: String,
    pub namespace_labels: BTreeMap<String, String>,
    pub quota: ResourceQuota,
    pub config_map: ConfigMap,
    pub secret: Secret,
    pub service: Service,
    pub ingress: Option<Ingress>,
    pub deployment: Deployment,
}

/// Render the full bundle for `(user, project)` with the given resolved
/// environment split into non-secret and secret halves.
pub fn render(
    user_id: &str,
    project_id: &str,
    replicas: i32,
    config_env: &BTreeMap<String, String>,
    secret_env: &BTreeMap<String, String>,
    cfg: &WorkloadConfig,
) -> ResourceBundle {
    let namespace = names::namespace(user_id);
    let app = names::app_label(project_id);
    let workload = names::workload(project_id);

    let labels = BTreeMap::from([
        ("app".to_string(), app.clone()),
        ("aviary.io/project-id".to_string(), project_id.to_string()),
        ("aviary.io/user-id".to_string(), user_id.to_string()),
    ]);

    let namespace_labels = BTreeMap::from([(
        NAMESPACE_ROLE_LABEL.to_string(),
        NAMESPACE_ROLE.to_string(),
    )]);

    let quota = ResourceQuota {
        metadata: ObjectMeta {
            name: Some(names::quota(user_id)),
            namespace: Some(namespace.clone()),
            ..Default::default()
        },
        spec: Some(ResourceQuotaSpec {
            hard: Some(BTreeMap::from([
                ("pods".to_string(), Quantity(cfg.quota_pods.clone())),
                ("requests.cpu".to_string(), Quantity(cfg.quota_cpu.clone())),
                (
                    "requests.memory".to_string(),
                    Quantity(cfg.quota_memory.clone()),
                ),
            ])),
            ..Default::default()
        }),
        ..Default::default()
    };

    let config_map = ConfigMap {
        metadata: ObjectMeta {
            name: Some(names::config_map(project_id)),
            namespace: Some(namespace.clone()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        data: Some(config_env.clone()),
        ..Default::default()
    };

    let secret = Secret {
        metadata: ObjectMeta {
            name: Some(names::secret(project_id)),
            namespace: Some(namespace.clone()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        string_data: Some(secret_env.clone()),
        ..Default::default()
    };

    let service = Service {
        metadata: ObjectMeta {
            name: Some(workload.clone()),
            namespace: Some(namespace.clone()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(BTreeMap::from([("app".to_string(), app.clone())])),
            ports: Some(vec![ServicePort {
                name: Some("http".to_string()),
                port: 80,
                target_port: Some(IntOrString::Int(cfg.agent_port)),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    };

    let ingress = cfg.base_domain.as_ref().map(|base| {
        let host = names::host(project_id, user_id, base);
        let tls = cfg.tls_secret_pattern.as_ref().map(|pattern| {
            let secret_name = pattern
                .replace("{project}", project_id)
                .replace("{user}", user_id);
            vec![IngressTLS {
                hosts: Some(vec![host.clone()]),
                secret_name: Some(secret_name),
            }]
        });
        Ingress {
            metadata: ObjectMeta {
                name: Some(workload.clone()),
                namespace: Some(namespace.clone()),
                labels: Some(labels.clone()),
                ..Default::default()
            },
            spec: Some(IngressSpec {
                ingress_class_name: Some(cfg.ingress_class.clone()),
                rules: Some(vec![IngressRule {
                    host: Some(host),
                    http: Some(HTTPIngressRuleValue {
                        paths: vec![HTTPIngressPath {
                            path: Some("/".to_string()),
                            path_type: "Prefix".to_string(),
                            backend: IngressBackend {
                                service: Some(IngressServiceBackend {
                                    name: workload.clone(),
                                    port: Some(ServiceBackendPort {
                                        number: Some(80),
                                        ..Default::default()
                                    }),
                                }),
                                ..Default::default()
                            },
                        }],
                    }),
                }]),
                tls,
                ..Default::default()
            }),
            ..Default::default()
        }
    });

    let deployment = Deployment {
        metadata: ObjectMeta {
            name: Some(workload.clone()),
            namespace: Some(namespace.clone()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(replicas),
            selector: LabelSelector {
                match_labels: Some(BTreeMap::from([("app".to_string(), app.clone())])),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels.clone()),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    security_context: Some(PodSecurityContext {
                        run_as_non_root: Some(true),
                        run_as_user: Some(1000),
                        fs_group: Some(1000),
                        ..Default::default()
                    }),
                    containers: vec![Container {
                        name: "agent".to_string(),
                        image: Some(cfg.agent_image.clone()),
                        image_pull_policy: Some("IfNotPresent".to_string()),
                        ports: Some(vec![ContainerPort {
                            name: Some("http".to_string()),
                            container_port: cfg.agent_port,
                            ..Default::default()
                        }]),
                        env_from: Some(vec![
                            EnvFromSource {
                                config_map_ref: Some(ConfigMapEnvSource {
                                    name: names::config_map(project_id),
                                    ..Default::default()
                                }),
                                ..Default::default()
                            },
                            EnvFromSource {
                                secret_ref: Some(SecretEnvSource {
                                    name: names::secret(project_id),
                                    ..Default::default()
                                }),
                                ..Default::default()
                            },
                        ]),
                        readiness_probe: Some(http_probe(cfg, 10, 5)),
                        liveness_probe: Some(http_probe(cfg, 60, 15)),
                        resources: Some(ResourceRequirements {
                            requests: Some(BTreeMap::from([
                                ("cpu".to_string(), Quantity(cfg.cpu_request.clone())),
                                ("memory".to_string(), Quantity(cfg.memory_request.clone())),
                            ])),
                            limits: Some(BTreeMap::from([
                                ("cpu".to_string(), Quantity(cfg.cpu_limit.clone())),
                                ("memory".to_string(), Quantity(cfg.memory_limit.clone())),
                            ])),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    };

    ResourceBundle {
        namespace,
        namespace_labels,
        quota,
        config_map,
        secret,
        service,
        ingress,
        deployment,
    }
}

fn http_probe(cfg: &WorkloadConfig, initial_delay: i32, period: i32) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some(cfg.agent_health_path.clone()),
            port: IntOrString::Int(cfg.agent_port),
            ..Default::default()
        }),
        initial_delay_seconds: Some(initial_delay),
        period_seconds: Some(period),
        timeout_seconds: Some(5),
        ..Default::default()
    }
}

/// A bare credential secret (user global credentials or a project-scoped
/// token). Not part of the per-project bundle: these are owned by whoever
/// created them and survive bundle re-renders.
pub fn credential_secret(
    namespace: &str,
    name: &str,
    data: &BTreeMap<String, String>,
) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        string_data: Some(data.clone()),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cfg(base_domain: Option<&str>) -> WorkloadConfig {
        WorkloadConfig {
            agent_image: "aviary/agent:1.4".to_string(),
            agent_port: 8000,
            agent_health_path: "/health".to_string(),
            base_domain: base_domain.map(str::to_string),
            ingress_class: "nginx".to_string(),
            tls_secret_pattern: Some("tls-{project}-{user}".to_string()),
            workspace_dir: "/workspace".to_string(),
            cpu_request: "250m".to_string(),
            cpu_limit: "1".to_string(),
            memory_request: "512Mi".to_string(),
            memory_limit: "2Gi".to_string(),
            quota_pods: "10".to_string(),
            quota_cpu: "4".to_string(),
            quota_memory: "8Gi".to_string(),
        }
    }

    fn envs() -> (BTreeMap<String, String>, BTreeMap<String, String>) {
        (
            BTreeMap::from([("PROJECT_ID".to_string(), "p1".to_string())]),
            BTreeMap::from([("GIT_TOKEN".to_string(), "tok".to_string())]),
        )
    }

    #[test]
    fn canonical_names_are_bit_exact() {
        assert_eq!(names::namespace("u"), "user-u");
        assert_eq!(names::config_map("p"), "proj-p-env");
        assert_eq!(names::secret("p"), "proj-p-secrets");
        assert_eq!(names::workload("p"), "proj-p-api");
        assert_eq!(names::selector("p"), "app=proj-p-api");
        assert_eq!(names::host("p", "u", "agents.example.com"), "p-u.agents.example.com");
    }

    #[test]
    fn render_is_deterministic() {
        let cfg = test_cfg(Some("agents.example.com"));
        let (config_env, secret_env) = envs();
        let a = render("u1", "p1", 1, &config_env, &secret_env, &cfg);
        let b = render("u1", "p1", 1, &config_env, &secret_env, &cfg);
        assert_eq!(
            serde_json::to_value(&a.deployment).unwrap(),
            serde_json::to_value(&b.deployment).unwrap()
        );
        assert_eq!(
            serde_json::to_value(&a.ingress).unwrap(),
            serde_json::to_value(&b.ingress).unwrap()
        );
    }

    #[test]
    fn deployment_wires_env_and_probes() {
        let cfg = test_cfg(None);
        let (config_env, secret_env) = envs();
        let bundle = render("u1", "p1", 1, &config_env, &secret_env, &cfg);
        let spec = bundle.deployment.spec.unwrap();
        assert_eq!(spec.replicas, Some(1));
        let pod = spec.template.spec.unwrap();
        let container = &pod.containers[0];
        let env_from = container.env_from.as_ref().unwrap();
        assert_eq!(
            env_from[0].config_map_ref.as_ref().unwrap().name,
            "proj-p1-env"
        );
        assert_eq!(env_from[1].secret_ref.as_ref().unwrap().name, "proj-p1-secrets");
        let readiness = container.readiness_probe.as_ref().unwrap();
        assert_eq!(readiness.initial_delay_seconds, Some(10));
        assert_eq!(readiness.period_seconds, Some(5));
        let liveness = container.liveness_probe.as_ref().unwrap();
        assert!(liveness.initial_delay_seconds > readiness.initial_delay_seconds);
    }

    #[test]
    fn zero_replicas_for_inactive_desired_state() {
        let cfg = test_cfg(None);
        let (config_env, secret_env) = envs();
        let bundle = render("u1", "p1", 0, &config_env, &secret_env, &cfg);
        assert_eq!(bundle.deployment.spec.unwrap().replicas, Some(0));
    }

    #[test]
    fn ingress_only_with_base_domain() {
        let cfg = test_cfg(None);
        let (config_env, secret_env) = envs();
        let bundle = render("u1", "p1", 1, &config_env, &secret_env, &cfg);
        assert!(bundle.ingress.is_none());

        let cfg = test_cfg(Some("agents.example.com"));
        let bundle = render("u1", "p1", 1, &config_env, &secret_env, &cfg);
        let ingress = bundle.ingress.unwrap();
        let spec = ingress.spec.unwrap();
        assert_eq!(spec.ingress_class_name.as_deref(), Some("nginx"));
        let rule = &spec.rules.unwrap()[0];
        assert_eq!(rule.host.as_deref(), Some("p1-u1.agents.example.com"));
        let tls = &spec.tls.unwrap()[0];
        assert_eq!(tls.secret_name.as_deref(), Some("tls-p1-u1"));
    }

    #[test]
    fn service_is_cluster_internal_on_port_80() {
        let cfg = test_cfg(None);
        let (config_env, secret_env) = envs();
        let bundle = render("u1", "p1", 1, &config_env, &secret_env, &cfg);
        let spec = bundle.service.spec.unwrap();
        assert_eq!(spec.type_.as_deref(), Some("ClusterIP"));
        let port = &spec.ports.unwrap()[0];
        assert_eq!(port.port, 80);
        assert_eq!(port.target_port, Some(IntOrString::Int(8000)));
    }

    #[test]
    fn pod_runs_non_root() {
        let cfg = test_cfg(None);
        let (config_env, secret_env) = envs();
        let bundle = render("u1", "p1", 1, &config_env, &secret_env, &cfg);
        let pod = bundle.deployment.spec.unwrap().template.spec.unwrap();
        let sc = pod.security_context.unwrap();
        assert_eq!(sc.run_as_non_root, Some(true));
    }
}
