use anyhow::Result;
use clap::Parser;

mod args;
mod auth;
mod chat_handlers;
mod cli;
mod client;
mod cloner;
mod config_handlers;
mod db;
mod error;
mod extensions;
mod handlers;
mod lifecycle;
mod models;
mod orchestrator;
mod proxy;
mod render;
mod server;
mod settings;

use args::{Cli, Commands, ProjectCommands, UserCommands};
use server::run_server;

#[tokio::main]
async fn main() -> Result<()> {
    aviary_common::init();

    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Server(args) => run_server(args).await,
        Commands::Project(args) => match args.command {
            ProjectCommands::Create(args) => cli::run_create_project(args).await,
            ProjectCommands::List(args) => cli::run_list_projects(args).await,
            ProjectCommands::Activate(args) => cli::run_activate_project(args).await,
            ProjectCommands::Deactivate(args) => cli::run_deactivate_project(args).await,
            ProjectCommands::Delete(args) => cli::run_delete_project(args).await,
            ProjectCommands::CloneRepo(args) => cli::run_clone_repository(args).await,
        },
        Commands::User(args) => match args.command {
            UserCommands::List(args) => cli::run_list_users(args).await,
            UserCommands::Create(args) => cli::run_create_user(args).await,
            UserCommands::SetGithubKey(args) => cli::run_set_github_key(args).await,
            UserCommands::ClearGithubKey(args) => cli::run_clear_github_key(args).await,
        },
        Commands::Health(args) => cli::run_health(args.api).await,
    }
}
