use anyhow::Result;

use crate::args::{
    ApiArgs, CreateProjectArgs, CreateUserArgs, ListProjectsArgs, ProjectRefArgs,
    SetGithubKeyArgs, UserRefArgs,
};
use crate::client::ControlClient;

fn default_endpoint() -> String {
    "http://localhost:8080".to_string()
}

fn client(api: &ApiArgs) -> ControlClient {
    let endpoint = api.endpoint.clone().unwrap_or_else(default_endpoint);
    ControlClient::new(&endpoint, api.api_key.clone())
}

/// Run the create project CLI command.
pub async fn run_create_project(args: CreateProjectArgs) -> Result<()> {
    let client = client(&args.api);
    let created = client
        .create_project(
            &args.user,
            &args.name,
            args.repo_url.as_deref(),
            args.github_key.as_deref(),
        )
        .await?;
    println!("Created project:");
    println!("  ID:      {}", created.project_id);
    println!("  Message: {}", created.message);
    Ok(())
}

/// Run the list projects CLI command.
pub async fn run_list_projects(args: ListProjectsArgs) -> Result<()> {
    let client = client(&args.api);
    let projects = client.list_projects(&args.user).await?;
    println!("Projects for {}:", args.user);
    if projects.is_empty() {
        println!("  (no projects)");
    } else {
        for project in &projects {
            println!(
                "{},{},{},{}",
                project.id,
                project.name,
                project.status,
                project.endpoint.clone().unwrap_or_default(),
            );
        }
    }
    Ok(())
}

/// Run the activate project CLI command.
pub async fn run_activate_project(args: ProjectRefArgs) -> Result<()> {
    let client = client(&args.api);
    let activated = client.activate_project(&args.user, &args.project).await?;
    println!("{}", activated.message);
    println!("  Endpoint: {}", activated.endpoint);
    Ok(())
}

/// Run the deactivate project CLI command.
pub async fn run_deactivate_project(args: ProjectRefArgs) -> Result<()> {
    let client = client(&args.api);
    let response = client.deactivate_project(&args.user, &args.project).await?;
    println!("{}", response.message);
    Ok(())
}

/// Run the delete project CLI command.
pub async fn run_delete_project(args: ProjectRefArgs) -> Result<()> {
    let client = client(&args.api);
    let response = client.delete_project(&args.user, &args.project).await?;
    println!("{}", response.message);
    Ok(())
}

/// Run the clone repository CLI command.
pub async fn run_clone_repository(args: ProjectRefArgs) -> Result<()> {
    let client = client(&args.api);
    let response = client.clone_repository(&args.user, &args.project).await?;
    println!("{}", response.message);
    Ok(())
}

/// Run the list users CLI command.
pub async fn run_list_users(args: ApiArgs) -> Result<()> {
    let client = client(&args);
    let users = client.list_users().await?;
    if users.is_empty() {
        println!("(no users)");
    } else {
        for user in &users {
            println!("{},{}", user.id, user.name);
        }
    }
    Ok(())
}

/// Run the create user CLI command. Prints the issued API key once.
pub async fn run_create_user(args: CreateUserArgs) -> Result<()> {
    let client = client(&args.api);
    let created = client.create_user(&args.id, args.name.as_deref()).await?;
    println!("Created user:");
    println!("  ID:      {}", created.id);
    println!("  Name:    {}", created.name);
    println!("  API key: {}", created.api_key);
    Ok(())
}

/// Run the set github key CLI command.
pub async fn run_set_github_key(args: SetGithubKeyArgs) -> Result<()> {
    let client = client(&args.api);
    let response = client
        .set_user_github_key(&args.user, &args.github_key)
        .await?;
    println!("{}", response.message);
    Ok(())
}

/// Run the clear github key CLI command.
pub async fn run_clear_github_key(args: UserRefArgs) -> Result<()> {
    let client = client(&args.api);
    let response = client.clear_user_github_key(&args.user).await?;
    println!("{}", response.message);
    Ok(())
}

/// Run the health check CLI command.
pub async fn run_health(args: ApiArgs) -> Result<()> {
    let client = client(&args);
    client.health().await?;
    println!("OK");
    Ok(())
}
