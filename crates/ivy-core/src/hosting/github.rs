//! REST implementation of [`HostingApi`] for GitHub-shaped services.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::debug;

use super::{HostingApi, NewPullRequest, PullRequest};

/// Total budget for fork-materialization polling.
const FORK_POLL_CAP: Duration = Duration::from_secs(120);

/// Exponential poll delays while waiting for an asynchronous fork.
const FORK_POLL_DELAYS: [u64; 5] = [1, 2, 4, 8, 16];

#[derive(Debug, Deserialize)]
struct RepoResponse {
    full_name: String,
    #[serde(default)]
    fork: bool,
    #[serde(default)]
    size: i64,
    #[serde(default)]
    default_branch: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PullResponse {
    html_url: String,
    number: i32,
}

/// GitHub REST API client.
pub struct GitHubApi {
    client: reqwest::Client,
    base_url: String,
}

impl GitHubApi {
    pub fn new() -> Self {
        Self::with_base_url("https://api.github.com")
    }

    /// Point the client at a different API root (tests, GHE).
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .user_agent("ivy")
            .timeout(Duration::from_secs(30))
            .build()
            .expect("reqwest client construction is infallible with static options");
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    fn repo_url(&self, owner: &str, repo: &str) -> String {
        format!("{}/repos/{owner}/{repo}", self.base_url)
    }

    async fn get_repo(&self, token: &str, full_name: &str) -> Result<Option<RepoResponse>> {
        let response = self
            .client
            .get(format!("{}/repos/{full_name}", self.base_url))
            .bearer_auth(token)
            .send()
            .await
            .context("hosting API request failed")?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            bail!("hosting API returned {} for {full_name}", response.status());
        }
        Ok(Some(response.json().await.context("malformed repo payload")?))
    }
}

impl Default for GitHubApi {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HostingApi for GitHubApi {
    async fn create_fork(&self, token: &str, owner: &str, repo: &str) -> Result<String> {
        let response = self
            .client
            .post(format!("{}/forks", self.repo_url(owner, repo)))
            .bearer_auth(token)
            .send()
            .await
            .context("fork request failed")?;

        let status = response.status();
        // Forking is asynchronous: 202 with a payload describing the new
        // repository is the success shape.
        if !(status.is_success() || status == StatusCode::ACCEPTED) {
            bail!("fork of {owner}/{repo} rejected with {status}");
        }

        let fork: RepoResponse = response
            .json()
            .await
            .context("fork response had no payload")?;

        // Poll until the fork is materialized (the repo exists and reports
        // either the fork flag or nonzero size).
        let deadline = tokio::time::Instant::now() + FORK_POLL_CAP;
        let mut delays = FORK_POLL_DELAYS.iter().copied();
        loop {
            if let Some(ready) = self.get_repo(token, &fork.full_name).await? {
                if ready.fork || ready.size > 0 {
                    debug!(fork = %fork.full_name, "fork materialized");
                    return Ok(ready.full_name);
                }
            }

            let delay = Duration::from_secs(delays.next().unwrap_or(16));
            if tokio::time::Instant::now() + delay > deadline {
                bail!(
                    "fork {} did not materialize within {:?}",
                    fork.full_name,
                    FORK_POLL_CAP
                );
            }
            tokio::time::sleep(delay).await;
        }
    }

    async fn create_pull_request(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        request: &NewPullRequest,
    ) -> Result<PullRequest> {
        let response = self
            .client
            .post(format!("{}/pulls", self.repo_url(owner, repo)))
            .bearer_auth(token)
            .json(&serde_json::json!({
                "title": request.title,
                "body": request.body,
                "head": request.head,
                "base": request.base,
            }))
            .send()
            .await
            .context("pull request creation failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("pull request on {owner}/{repo} rejected with {status}: {body}");
        }

        let pull: PullResponse = response
            .json()
            .await
            .context("malformed pull request payload")?;
        Ok(PullRequest {
            url: pull.html_url,
            number: pull.number,
        })
    }

    async fn default_branch(&self, token: &str, owner: &str, repo: &str) -> Result<String> {
        let repo = self
            .get_repo(token, &format!("{owner}/{repo}"))
            .await?
            .context("repository not found")?;
        repo.default_branch.context("repository has no default branch")
    }
}
