use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::routing::{delete, get, post, put};
use axum::Router;
use aviary_common::shutdown::shutdown_signal;
use deadpool_postgres::Pool;
use tower_http::cors::{Any, CorsLayer};

use crate::args::ServerArgs;
use crate::chat_handlers;
use crate::config_handlers;
use crate::db;
use crate::handlers;
use crate::lifecycle::LifecycleEngine;
use crate::orchestrator::Orchestrator;
use crate::proxy::AgentProxy;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: Pool,
    pub engine: Arc<LifecycleEngine>,
    pub proxy: AgentProxy,
    pub admin_api_key: String,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    Router::new()
        .route("/readyz", get(handlers::health))
        .route("/healthz", get(handlers::health))
        .route(
            "/users",
            get(handlers::list_users).post(handlers::create_user),
        )
        .route("/users/{user}", delete(handlers::delete_user))
        .route(
            "/users/{user}/github-key",
            put(handlers::put_user_github_key)
                .get(handlers::get_user_github_key)
                .delete(handlers::delete_user_github_key),
        )
        .route(
            "/users/{user}/workspace-key",
            put(handlers::put_user_workspace_key)
                .get(handlers::get_user_workspace_key)
                .delete(handlers::delete_user_workspace_key),
        )
        .route(
            "/users/{user}/projects",
            get(handlers::list_projects).post(handlers::create_project),
        )
        .route(
            "/users/{user}/projects/{pid}",
            put(handlers::rename_project).delete(handlers::delete_project),
        )
        .route(
            "/users/{user}/projects/{pid}/activate",
            post(handlers::activate_project),
        )
        .route(
            "/users/{user}/projects/{pid}/deactivate",
            post(handlers::deactivate_project),
        )
        .route(
            "/users/{user}/projects/{pid}/clone-repository",
            post(handlers::clone_repository),
        )
        .route(
            "/users/{user}/projects/{pid}/github-key",
            put(handlers::put_project_github_key),
        )
        .route(
            "/users/{user}/projects/{pid}/agent/status",
            get(handlers::agent_status),
        )
        .route(
            "/users/{user}/projects/{pid}/sessions",
            post(chat_handlers::create_session).get(chat_handlers::list_sessions),
        )
        .route(
            "/users/{user}/projects/{pid}/sessions/{sid}",
            delete(chat_handlers::delete_session),
        )
        .route(
            "/users/{user}/projects/{pid}/sessions/{sid}/messages",
            get(chat_handlers::session_messages),
        )
        .route(
            "/users/{user}/projects/{pid}/messages",
            post(chat_handlers::stream_message),
        )
        .route(
            "/users/{user}/projects/{pid}/messages/send",
            post(chat_handlers::send_message),
        )
        .route(
            "/users/{user}/projects/{pid}/settings",
            get(config_handlers::list_settings)
                .put(config_handlers::put_settings)
                .delete(config_handlers::reset_settings),
        )
        .route(
            "/users/{user}/projects/{pid}/settings/{key}",
            get(config_handlers::get_setting)
                .put(config_handlers::put_setting)
                .delete(config_handlers::delete_setting),
        )
        .route(
            "/users/{user}/projects/{pid}/extensions",
            get(config_handlers::list_extensions).post(config_handlers::create_extension),
        )
        .route(
            "/users/{user}/projects/{pid}/extensions/{name}",
            put(config_handlers::update_extension).delete(config_handlers::delete_extension),
        )
        .route(
            "/users/{user}/projects/{pid}/extensions/{name}/toggle",
            post(config_handlers::toggle_extension),
        )
        .layer(axum::middleware::from_fn(
            aviary_common::access_log::public,
        ))
        .layer(cors)
        .with_state(state)
}

/// Run the control-plane HTTP server. Fails fast on an unreachable database
/// or cluster; the process exit code is non-zero on either.
pub async fn run_server(args: ServerArgs) -> Result<()> {
    let pool = aviary_common::postgres::create_pool(args.postgres).await?;
    db::init_schema(&pool)
        .await
        .context("failed to initialize database schema")?;
    let orch = Orchestrator::connect()
        .await
        .context("failed to connect to the cluster API")?;
    let engine = Arc::new(LifecycleEngine::new(
        pool.clone(),
        orch,
        args.workload.into_config(),
    ));
    let state = AppState {
        pool,
        engine,
        proxy: AgentProxy::new(),
        admin_api_key: args.admin_api_key,
    };

    let app = build_router(state);
    let addr: SocketAddr = format!("0.0.0.0:{}", args.port).parse()?;
    tracing::info!(%addr, "starting control API server");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    aviary_common::signal_ready();
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("server stopped gracefully");
    Ok(())
}
