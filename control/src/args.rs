use aviary_common::args::PostgresArgs;
use clap::{Parser, Subcommand};

use crate::render::WorkloadConfig;

#[derive(Parser, Debug)]
#[command(name = "aviary-control")]
#[command(about = "Control plane for per-project AI agent runtimes")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the control API server
    Server(ServerArgs),

    /// Project operations
    Project(ProjectCommandArgs),

    /// User and credential operations
    User(UserCommandArgs),

    /// Check service health
    Health(HealthArgs),
}

#[derive(Parser, Debug, Clone)]
pub struct ServerArgs {
    /// Port to listen on
    #[arg(long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    /// Administrator API key; opens every path and user creation
    #[arg(long, env = "ADMIN_API_KEY", required = true)]
    pub admin_api_key: String,

    #[clap(flatten)]
    pub postgres: PostgresArgs,

    #[clap(flatten)]
    pub workload: WorkloadArgs,
}

/// Shape of the per-project agent workload.
#[derive(Parser, Debug, Clone)]
pub struct WorkloadArgs {
    /// Container image running the agent API
    #[arg(long, env = "AGENT_IMAGE", default_value = "aviary/agent:latest")]
    pub agent_image: String,

    /// Container port the agent listens on
    #[arg(long, env = "AGENT_PORT", default_value_t = 8000)]
    pub agent_port: i32,

    /// Health path probed for readiness and liveness
    #[arg(long, env = "AGENT_HEALTH_PATH", default_value = "/health")]
    pub agent_health_path: String,

    /// Base domain for per-project ingresses; no ingress is created when
    /// unset
    #[arg(long, env = "BASE_DOMAIN")]
    pub base_domain: Option<String>,

    /// Ingress class for per-project ingresses
    #[arg(long, env = "INGRESS_CLASS", default_value = "nginx")]
    pub ingress_class: String,

    /// TLS secret name template with {project} and {user} placeholders
    #[arg(long, env = "TLS_SECRET_PATTERN")]
    pub tls_secret_pattern: Option<String>,

    /// Workspace directory inside the agent container
    #[arg(long, env = "WORKSPACE_DIR", default_value = "/workspace")]
    pub workspace_dir: String,

    #[arg(long, env = "AGENT_CPU_REQUEST", default_value = "250m")]
    pub cpu_request: String,

    #[arg(long, env = "AGENT_CPU_LIMIT", default_value = "1")]
    pub cpu_limit: String,

    #[arg(long, env = "AGENT_MEMORY_REQUEST", default_value = "512Mi")]
    pub memory_request: String,

    #[arg(long, env = "AGENT_MEMORY_LIMIT", default_value = "2Gi")]
    pub memory_limit: String,

    /// Per-user namespace quota: max pods
    #[arg(long, env = "QUOTA_PODS", default_value = "10")]
    pub quota_pods: String,

    /// Per-user namespace quota: total CPU requests
    #[arg(long, env = "QUOTA_CPU", default_value = "4")]
    pub quota_cpu: String,

    /// Per-user namespace quota: total memory requests
    #[arg(long, env = "QUOTA_MEMORY", default_value = "8Gi")]
    pub quota_memory: String,
}

impl WorkloadArgs {
    pub fn into_config(self) -> WorkloadConfig {
        WorkloadConfig {
            agent_image: self.agent_image,
            agent_port: self.agent_port,
            agent_health_path: self.agent_health_path,
            base_domain: self.base_domain,
            ingress_class: self.ingress_class,
            tls_secret_pattern: self.tls_secret_pattern,
            workspace_dir: self.workspace_dir,
            cpu_request: self.cpu_request,
            cpu_limit: self.cpu_limit,
            memory_request: self.memory_request,
            memory_limit: self.memory_limit,
            quota_pods: self.quota_pods,
            quota_cpu: self.quota_cpu,
            quota_memory: self.quota_memory,
        }
    }
}

#[derive(Parser, Debug, Clone)]
pub struct ApiArgs {
    /// Control API endpoint
    #[arg(long, env = "AVIARY_ENDPOINT")]
    pub endpoint: Option<String>,

    /// Caller API key
    #[arg(long, env = "AVIARY_API_KEY")]
    pub api_key: Option<String>,
}

#[derive(Parser, Debug, Clone)]
pub struct ProjectCommandArgs {
    #[command(subcommand)]
    pub command: ProjectCommands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum ProjectCommands {
    /// Create a project (activates it before returning)
    Create(CreateProjectArgs),
    /// List a user's projects
    List(ListProjectsArgs),
    /// Activate a project
    Activate(ProjectRefArgs),
    /// Deactivate a project
    Deactivate(ProjectRefArgs),
    /// Delete a project and its cluster objects
    Delete(ProjectRefArgs),
    /// Clone or update the project's repository in the running pod
    CloneRepo(ProjectRefArgs),
}

#[derive(Parser, Debug, Clone)]
pub struct CreateProjectArgs {
    #[clap(flatten)]
    pub api: ApiArgs,

    /// Owning user id
    #[arg(long)]
    pub user: String,

    /// Display name
    #[arg(long)]
    pub name: String,

    /// Git repository to clone into the workspace
    #[arg(long)]
    pub repo_url: Option<String>,

    /// Project-scoped GitHub token
    #[arg(long)]
    pub github_key: Option<String>,
}

#[derive(Parser, Debug, Clone)]
pub struct ListProjectsArgs {
    #[clap(flatten)]
    pub api: ApiArgs,

    /// Owning user id
    #[arg(long)]
    pub user: String,
}

#[derive(Parser, Debug, Clone)]
pub struct ProjectRefArgs {
    #[clap(flatten)]
    pub api: ApiArgs,

    /// Owning user id
    #[arg(long)]
    pub user: String,

    /// Project id
    #[arg(long)]
    pub project: String,
}

#[derive(Parser, Debug, Clone)]
pub struct UserCommandArgs {
    #[command(subcommand)]
    pub command: UserCommands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum UserCommands {
    /// List users
    List(ApiArgs),
    /// Create a user and issue their API key
    Create(CreateUserArgs),
    /// Store a user's global GitHub key
    SetGithubKey(SetGithubKeyArgs),
    /// Remove a user's global GitHub key
    ClearGithubKey(UserRefArgs),
}

#[derive(Parser, Debug, Clone)]
pub struct CreateUserArgs {
    #[clap(flatten)]
    pub api: ApiArgs,

    /// User id (lowercase DNS-safe slug)
    #[arg(long)]
    pub id: String,

    /// Display name; defaults to the id
    #[arg(long)]
    pub name: Option<String>,
}

#[derive(Parser, Debug, Clone)]
pub struct SetGithubKeyArgs {
    #[clap(flatten)]
    pub api: ApiArgs,

    /// User id
    #[arg(long)]
    pub user: String,

    /// The token to store
    #[arg(long)]
    pub github_key: String,
}

#[derive(Parser, Debug, Clone)]
pub struct UserRefArgs {
    #[clap(flatten)]
    pub api: ApiArgs,

    /// User id
    #[arg(long)]
    pub user: String,
}

#[derive(Parser, Debug, Clone)]
pub struct HealthArgs {
    #[clap(flatten)]
    pub api: ApiArgs,
}
