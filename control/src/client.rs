use anyhow::{Context, Result, bail};
use reqwest::Client;

use crate::auth::API_KEY_HEADER;
use crate::models::{
    ActivateResponse, CreateProjectRequest, CreateProjectResponse, CreateUserRequest,
    CreateUserResponse, GithubKeyRequest, MessageResponse, Project, UserListItem,
};

/// Client for the control-plane HTTP API, used by the operator CLI.
#[derive(Clone)]
pub struct ControlClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl ControlClient {
    pub fn new(base_url: &str, api_key: Option<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(method, format!("{}{}", self.base_url, path));
        if let Some(key) = &self.api_key {
            builder = builder.header(API_KEY_HEADER, key);
        }
        builder
    }

    async fn expect_success(resp: reqwest::Response, what: &str) -> Result<reqwest::Response> {
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        bail!("{} failed with status {}: {}", what, status, body)
    }

    /// Check if the service is healthy.
    pub async fn health(&self) -> Result<()> {
        let resp = self
            .request(reqwest::Method::GET, "/healthz")
            .send()
            .await
            .context("failed to send health request")?;
        Self::expect_success(resp, "health check").await?;
        Ok(())
    }

    pub async fn list_users(&self) -> Result<Vec<UserListItem>> {
        let resp = self
            .request(reqwest::Method::GET, "/users")
            .send()
            .await
            .context("failed to send list users request")?;
        Self::expect_success(resp, "list users")
            .await?
            .json()
            .await
            .context("failed to parse list users response")
    }

    pub async fn create_user(&self, id: &str, name: Option<&str>) -> Result<CreateUserResponse> {
        let req = CreateUserRequest {
            id: id.to_string(),
            name: name.map(str::to_string),
        };
        let resp = self
            .request(reqwest::Method::POST, "/users")
            .json(&req)
            .send()
            .await
            .context("failed to send create user request")?;
        Self::expect_success(resp, "create user")
            .await?
            .json()
            .await
            .context("failed to parse create user response")
    }

    pub async fn set_user_github_key(&self, user: &str, key: &str) -> Result<MessageResponse> {
        let req = GithubKeyRequest {
            github_key: Some(key.to_string()),
        };
        let resp = self
            .request(
                reqwest::Method::PUT,
                &format!("/users/{}/github-key", user),
            )
            .json(&req)
            .send()
            .await
            .context("failed to send github key request")?;
        Self::expect_success(resp, "set github key")
            .await?
            .json()
            .await
            .context("failed to parse github key response")
    }

    pub async fn clear_user_github_key(&self, user: &str) -> Result<MessageResponse> {
        let resp = self
            .request(
                reqwest::Method::DELETE,
                &format!("/users/{}/github-key", user),
            )
            .send()
            .await
            .context("failed to send github key delete request")?;
        Self::expect_success(resp, "clear github key")
            .await?
            .json()
            .await
            .context("failed to parse github key response")
    }

    pub async fn list_projects(&self, user: &str) -> Result<Vec<Project>> {
        let resp = self
            .request(reqwest::Method::GET, &format!("/users/{}/projects", user))
            .send()
            .await
            .context("failed to send list projects request")?;
        Self::expect_success(resp, "list projects")
            .await?
            .json()
            .await
            .context("failed to parse list projects response")
    }

    pub async fn create_project(
        &self,
        user: &str,
        name: &str,
        repo_url: Option<&str>,
        github_key: Option<&str>,
    ) -> Result<CreateProjectResponse> {
        let req = CreateProjectRequest {
            name: name.to_string(),
            repo_url: repo_url.map(str::to_string),
            github_key: github_key.map(str::to_string),
        };
        let resp = self
            .request(reqwest::Method::POST, &format!("/users/{}/projects", user))
            .json(&req)
            .send()
            .await
            .context("failed to send create project request")?;
        Self::expect_success(resp, "create project")
            .await?
            .json()
            .await
            .context("failed to parse create project response")
    }

    pub async fn activate_project(&self, user: &str, project: &str) -> Result<ActivateResponse> {
        let resp = self
            .request(
                reqwest::Method::POST,
                &format!("/users/{}/projects/{}/activate", user, project),
            )
            .send()
            .await
            .context("failed to send activate request")?;
        Self::expect_success(resp, "activate project")
            .await?
            .json()
            .await
            .context("failed to parse activate response")
    }

    pub async fn deactivate_project(&self, user: &str, project: &str) -> Result<MessageResponse> {
        let resp = self
            .request(
                reqwest::Method::POST,
                &format!("/users/{}/projects/{}/deactivate", user, project),
            )
            .send()
            .await
            .context("failed to send deactivate request")?;
        Self::expect_success(resp, "deactivate project")
            .await?
            .json()
            .await
            .context("failed to parse deactivate response")
    }

    pub async fn delete_project(&self, user: &str, project: &str) -> Result<MessageResponse> {
        let resp = self
            .request(
                reqwest::Method::DELETE,
                &format!("/users/{}/projects/{}", user, project),
            )
            .send()
            .await
            .context("failed to send delete project request")?;
        Self::expect_success(resp, "delete project")
            .await?
            .json()
            .await
            .context("failed to parse delete project response")
    }

    pub async fn clone_repository(&self, user: &str, project: &str) -> Result<MessageResponse> {
        let resp = self
            .request(
                reqwest::Method::POST,
                &format!("/users/{}/projects/{}/clone-repository", user, project),
            )
            .send()
            .await
            .context("failed to send clone request")?;
        Self::expect_success(resp, "clone repository")
            .await?
            .json()
            .await
            .context("failed to parse clone response")
    }
}
