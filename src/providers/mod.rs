mod github;
mod gitlab;

pub use github::GitHubClient;
pub use gitlab::GitLabClient;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::auth::Token;
use crate::config::Configuration;
use crate::error::Result;
use crate::models::{Commit, Pipeline, Step};

/// A continuous-integration backend able to describe pipelines.
///
/// `build_from_url` doubles as the selection mechanism: a provider that
/// does not recognize a URL returns `Error::UnknownPipelineUrl`, any other
/// error means the URL was its own and the request failed.
#[async_trait]
pub trait CiProvider: Send + Sync {
    /// Unique identifier of the provider instance among all other instances.
    fn id(&self) -> &str;

    /// Host part of the URL of the provider. Part of pipeline identity.
    fn host(&self) -> &str;

    /// Display name of the provider.
    fn name(&self) -> &str;

    async fn build_from_url(&self, url: &str) -> Result<Pipeline>;

    async fn log(&self, step: &Step) -> Result<String>;
}

/// A source-code hosting backend able to resolve commits and list the CI
/// status URLs attached to them.
#[async_trait]
pub trait SourceProvider: Send + Sync {
    /// Unique identifier of the provider instance among all other instances.
    fn id(&self) -> &str;

    async fn ref_statuses(&self, url: &str, ref_: &str, sha: &str) -> Result<Vec<String>>;

    async fn commit(&self, repo: &str, ref_: &str) -> Result<Commit>;
}

/// Minimum-interval request throttle. Each provider instance owns one and
/// awaits it before talking to its API.
pub(crate) struct Throttle {
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl Throttle {
    pub(crate) fn new(requests_per_second: Option<f64>) -> Self {
        let rps = match requests_per_second {
            Some(rps) if rps > 0.0 => rps,
            _ => 10.0,
        };
        Throttle {
            interval: Duration::from_secs_f64(1.0 / rps),
            last: Mutex::new(None),
        }
    }

    pub(crate) async fn wait(&self) {
        let mut last = self.last.lock().await;
        let now = Instant::now();
        if let Some(previous) = *last {
            let next = previous + self.interval;
            if next > now {
                tokio::time::sleep(next - now).await;
                *last = Some(next);
                return;
            }
        }
        *last = Some(now);
    }
}

/// Instantiate the configured provider set.
///
/// Returns the source providers (commit and status discovery) and the CI
/// providers (pipeline polling). A single configured backend may appear in
/// both lists.
pub fn from_config(
    config: &Configuration,
) -> Result<(Vec<Arc<dyn SourceProvider>>, Vec<Arc<dyn CiProvider>>)> {
    let mut source: Vec<Arc<dyn SourceProvider>> = Vec::new();
    let mut ci: Vec<Arc<dyn CiProvider>> = Vec::new();

    for (i, conf) in config.providers.github.iter().enumerate() {
        let token = Token::from_config(conf.token.as_deref(), conf.token_from_process.as_deref())?;
        let client = Arc::new(GitHubClient::new(
            format!("github-{i}"),
            conf.url.as_deref(),
            token,
            conf.max_requests_per_second,
        )?);
        source.push(client);
    }

    for (i, conf) in config.providers.gitlab.iter().enumerate() {
        let token = Token::from_config(conf.token.as_deref(), conf.token_from_process.as_deref())?;
        let client = Arc::new(GitLabClient::new(
            format!("gitlab-{i}"),
            conf.name.as_deref().unwrap_or("gitlab"),
            conf.url.as_deref(),
            token,
            conf.max_requests_per_second,
        )?);
        source.push(client.clone());
        ci.push(client);
    }

    Ok((source, ci))
}
