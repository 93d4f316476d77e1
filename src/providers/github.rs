use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, USER_AGENT};
use reqwest::StatusCode;
use serde::Deserialize;

use crate::auth::Token;
use crate::error::{Error, Result};
use crate::models::Commit;
use crate::providers::{SourceProvider, Throttle};
use crate::utils;

const DEFAULT_BASE_URL: &str = "https://api.github.com";

/// Source provider backed by the GitHub REST API.
///
/// Resolves commits and reports the CI status URLs attached to them, both
/// from the commit status API and from check runs.
pub struct GitHubClient {
    id: String,
    client: reqwest::Client,
    base_url: String,
    throttle: Throttle,
}

impl GitHubClient {
    pub fn new(
        id: String,
        base_url: Option<&str>,
        token: Option<Token>,
        requests_per_second: Option<f64>,
    ) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("cimon/0.1.0"));
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/vnd.github+json"),
        );
        if let Some(token) = &token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token.as_str()))
                .map_err(|_| Error::Config("GitHub token contains invalid characters".into()))?;
            headers.insert(AUTHORIZATION, value);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(GitHubClient {
            id,
            client,
            base_url: base_url.unwrap_or(DEFAULT_BASE_URL).trim_end_matches('/').to_owned(),
            throttle: Throttle::new(requests_per_second),
        })
    }

    /// Split a repository URL into owner and name, rejecting hosts this
    /// client does not serve.
    fn owner_and_name(&self, repo: &str) -> Result<(String, String)> {
        let (host, owner, name) = utils::repo_host_owner_name(repo)?;
        if host != "github.com" && !host.ends_with(".github.com") {
            return Err(Error::UnknownRepositoryUrl(repo.to_owned()));
        }
        Ok((owner, name))
    }

    async fn get(&self, url: &str) -> Result<reqwest::Response> {
        self.throttle.wait().await;
        let response = self.client.get(url).send().await?;
        Ok(response)
    }

    async fn repository_exists(&self, owner: &str, name: &str, repo: &str) -> Result<()> {
        let url = format!("{}/repos/{owner}/{name}", self.base_url);
        let response = self.get(&url).await?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(Error::UnknownRepositoryUrl(repo.to_owned())),
            status if status.is_success() => Ok(()),
            status => Err(Error::Api {
                provider: "GitHub".to_owned(),
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            }),
        }
    }
}

#[async_trait]
impl SourceProvider for GitHubClient {
    fn id(&self) -> &str {
        &self.id
    }

    async fn commit(&self, repo: &str, ref_: &str) -> Result<Commit> {
        let (owner, name) = self.owner_and_name(repo)?;
        self.repository_exists(&owner, &name, repo).await?;

        let url = format!("{}/repos/{owner}/{name}/commits/{ref_}", self.base_url);
        let response = self.get(&url).await?;
        match response.status() {
            StatusCode::NOT_FOUND | StatusCode::UNPROCESSABLE_ENTITY => {
                return Err(Error::UnknownGitReference(ref_.to_owned()));
            }
            status if !status.is_success() => {
                return Err(Error::Api {
                    provider: "GitHub".to_owned(),
                    status: status.as_u16(),
                    message: response.text().await.unwrap_or_default(),
                });
            }
            _ => {}
        }
        let commit: GitHubCommit = response.json().await?;

        Ok(Commit {
            sha: commit.sha,
            author: commit
                .commit
                .author
                .map(|a| format!("{} <{}>", a.name, a.email))
                .unwrap_or_default(),
            date: commit.commit.committer.and_then(|c| c.date),
            message: commit.commit.message,
            ..Commit::default()
        })
    }

    async fn ref_statuses(&self, repo: &str, _ref: &str, sha: &str) -> Result<Vec<String>> {
        let (owner, name) = self.owner_and_name(repo)?;

        let url = format!(
            "{}/repos/{owner}/{name}/commits/{sha}/status",
            self.base_url
        );
        let response = self.get(&url).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(Error::UnknownRepositoryUrl(repo.to_owned()));
        }
        let combined: CombinedStatus = response.error_for_status()?.json().await?;

        let mut urls: Vec<String> = combined
            .statuses
            .into_iter()
            .filter_map(|status| status.target_url)
            .collect();

        let url = format!(
            "{}/repos/{owner}/{name}/commits/{sha}/check-runs",
            self.base_url
        );
        let response = self.get(&url).await?;
        if response.status().is_success() {
            let check_runs: CheckRuns = response.json().await?;
            urls.extend(
                check_runs
                    .check_runs
                    .into_iter()
                    .filter_map(|run| run.details_url),
            );
        }

        urls.retain(|u| !u.is_empty());
        urls.sort();
        urls.dedup();
        Ok(urls)
    }
}

#[derive(Deserialize)]
struct GitHubCommit {
    sha: String,
    commit: GitHubCommitDetail,
}

#[derive(Deserialize)]
struct GitHubCommitDetail {
    author: Option<GitHubSignature>,
    committer: Option<GitHubSignature>,
    message: String,
}

#[derive(Deserialize)]
struct GitHubSignature {
    #[serde(default)]
    name: String,
    #[serde(default)]
    email: String,
    date: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct CombinedStatus {
    #[serde(default)]
    statuses: Vec<CommitStatus>,
}

#[derive(Deserialize)]
struct CommitStatus {
    target_url: Option<String>,
}

#[derive(Deserialize)]
struct CheckRuns {
    #[serde(default)]
    check_runs: Vec<CheckRun>,
}

#[derive(Deserialize)]
struct CheckRun {
    details_url: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_non_github_hosts() {
        let client = GitHubClient::new("github-0".to_owned(), None, None, None).unwrap();
        let result = client.owner_and_name("https://gitlab.com/owner/repo");
        assert!(matches!(result, Err(Error::UnknownRepositoryUrl(_))));
    }

    #[test]
    fn test_accepts_github_urls() {
        let client = GitHubClient::new("github-0".to_owned(), None, None, None).unwrap();
        let (owner, name) = client
            .owner_and_name("git@github.com:owner/repo.git")
            .unwrap();
        assert_eq!(owner, "owner");
        assert_eq!(name, "repo");
    }
}
