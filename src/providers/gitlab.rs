use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use reqwest::StatusCode;
use serde::Deserialize;
use url::Url;

use crate::auth::Token;
use crate::error::{Error, Result};
use crate::models::{self, Commit, GitReference, Log, Pipeline, State, Step, StepType};
use crate::providers::{CiProvider, SourceProvider, Throttle};
use crate::utils;

const DEFAULT_BASE_URL: &str = "https://gitlab.com";

/// GitLab client acting both as a source provider (commits, status URLs)
/// and as a CI provider (pipelines, jobs, traces).
pub struct GitLabClient {
    id: String,
    display_name: String,
    client: reqwest::Client,
    base_url: Url,
    host: String,
    token: Option<Token>,
    throttle: Throttle,
}

impl GitLabClient {
    pub fn new(
        id: String,
        display_name: &str,
        base_url: Option<&str>,
        token: Option<Token>,
        requests_per_second: Option<f64>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent("cimon/0.1.0")
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;

        let base_url = Url::parse(base_url.unwrap_or(DEFAULT_BASE_URL))
            .map_err(|e| Error::Config(format!("invalid GitLab base URL: {e}")))?;
        let host = base_url
            .host_str()
            .ok_or_else(|| Error::Config("GitLab base URL has no host".into()))?
            .to_owned();

        Ok(GitLabClient {
            id,
            display_name: display_name.to_owned(),
            client,
            base_url,
            host,
            token,
            throttle: Throttle::new(requests_per_second),
        })
    }

    fn auth_request(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(token) = &self.token {
            request.bearer_auth(token.as_str())
        } else {
            request
        }
    }

    async fn get(&self, path_and_query: &str) -> Result<reqwest::Response> {
        self.throttle.wait().await;
        let url = self
            .base_url
            .join(path_and_query)
            .map_err(|e| Error::Config(format!("invalid GitLab API URL: {e}")))?;
        let response = self.auth_request(self.client.get(url)).send().await?;
        Ok(response)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path_and_query: &str) -> Result<T> {
        let response = self.get(path_and_query).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Api {
                provider: self.display_name.clone(),
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }
        Ok(response.json().await?)
    }

    /// Project path and pipeline id of a GitLab pipeline web URL, e.g.
    /// `https://gitlab.com/group/project/-/pipelines/42`.
    fn parse_pipeline_url(&self, url: &str) -> Result<(String, u64)> {
        let parsed =
            Url::parse(url).map_err(|_| Error::UnknownPipelineUrl(url.to_owned()))?;
        if parsed.host_str() != Some(self.host.as_str()) {
            return Err(Error::UnknownPipelineUrl(url.to_owned()));
        }

        let segments: Vec<&str> = parsed
            .path()
            .split('/')
            .filter(|s| !s.is_empty())
            .collect();
        // ".../{project path...}/-/pipelines/{id}" with the "-" separator
        // optional on older GitLab versions.
        let pipelines_at = segments
            .iter()
            .position(|s| *s == "pipelines")
            .ok_or_else(|| Error::UnknownPipelineUrl(url.to_owned()))?;
        let id = segments
            .get(pipelines_at + 1)
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or_else(|| Error::UnknownPipelineUrl(url.to_owned()))?;

        let mut project_segments = &segments[..pipelines_at];
        if let Some((&"-", rest)) = project_segments.split_last() {
            project_segments = rest;
        }
        if project_segments.is_empty() {
            return Err(Error::UnknownPipelineUrl(url.to_owned()));
        }

        Ok((project_segments.join("/"), id))
    }

    fn project_path(&self, repo: &str) -> Result<String> {
        let (host, owner, name) = utils::repo_host_owner_name(repo)?;
        if host != self.host {
            return Err(Error::UnknownRepositoryUrl(repo.to_owned()));
        }
        Ok(format!("{owner}/{name}"))
    }

    async fn jobs(&self, project: &str, pipeline_id: u64) -> Result<Vec<GitLabJob>> {
        let encoded = encode_project(project);
        let mut jobs = Vec::new();
        let mut page = 1;
        loop {
            let batch: Vec<GitLabJob> = self
                .get_json(&format!(
                    "/api/v4/projects/{encoded}/pipelines/{pipeline_id}/jobs?per_page=100&page={page}&include_retried=false"
                ))
                .await?;
            let len = batch.len();
            jobs.extend(batch);
            if len < 100 {
                break;
            }
            page += 1;
        }
        // The API returns jobs most recent first; put them back in
        // execution order.
        jobs.sort_by_key(|job| job.id);
        Ok(jobs)
    }

    fn step_tree(&self, project: &str, pipeline: &GitLabPipeline, jobs: Vec<GitLabJob>) -> Step {
        // Group jobs by stage, preserving the order stages first appear in.
        let mut stages: IndexMap<String, Vec<Step>> = IndexMap::new();
        for job in jobs {
            let stage = job.stage.clone().unwrap_or_else(|| "test".to_owned());
            stages
                .entry(stage)
                .or_default()
                .push(self.job_step(project, job));
        }

        let children: Vec<Step> = stages
            .into_iter()
            .map(|(name, jobs)| {
                let mut stage = Step {
                    id: name.clone(),
                    name,
                    type_: StepType::Stage,
                    ..models::aggregate(&jobs)
                };
                // aggregate() passes a lone child through unchanged; the
                // stage itself never carries a log or URL of its own.
                stage.children = jobs;
                stage.log = Log::default();
                stage.web_url = None;
                stage
            })
            .collect();

        Step {
            id: pipeline.id.to_string(),
            name: String::new(),
            type_: StepType::Pipeline,
            state: parse_state(&pipeline.status),
            created_at: pipeline.created_at,
            started_at: pipeline.started_at,
            finished_at: pipeline.finished_at,
            updated_at: pipeline.updated_at.unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
            duration: pipeline
                .duration
                .map(|seconds| chrono::Duration::seconds(seconds)),
            web_url: pipeline.web_url.clone(),
            children,
            ..Step::default()
        }
    }

    fn job_step(&self, project: &str, job: GitLabJob) -> Step {
        let started_at = job.started_at;
        let finished_at = job.finished_at;
        Step {
            id: job.id.to_string(),
            name: job.name,
            type_: StepType::Job,
            state: parse_state(&job.status),
            allow_failure: job.allow_failure,
            created_at: job.created_at,
            started_at,
            finished_at,
            // Jobs carry no update timestamp of their own; the latest
            // known event stands in for it.
            updated_at: utils::max_time(&[job.created_at, started_at, finished_at])
                .unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
            duration: job
                .duration
                .map(|seconds| chrono::Duration::milliseconds((seconds * 1000.0) as i64)),
            web_url: job.web_url,
            log: Log {
                key: format!("{project}:{}", job.id),
                content: None,
            },
            children: Vec::new(),
        }
    }
}

#[async_trait]
impl CiProvider for GitLabClient {
    fn id(&self) -> &str {
        &self.id
    }

    fn host(&self) -> &str {
        &self.host
    }

    fn name(&self) -> &str {
        &self.display_name
    }

    async fn build_from_url(&self, url: &str) -> Result<Pipeline> {
        let (project, id) = self.parse_pipeline_url(url)?;
        let encoded = encode_project(&project);

        let pipeline: GitLabPipeline = self
            .get_json(&format!("/api/v4/projects/{encoded}/pipelines/{id}"))
            .await?;
        let jobs = self.jobs(&project, id).await?;

        let step = self.step_tree(&project, &pipeline, jobs);
        Ok(Pipeline {
            number: pipeline.iid.unwrap_or(pipeline.id).to_string(),
            provider_id: self.id.clone(),
            provider_host: self.host.clone(),
            git_reference: GitReference {
                sha: pipeline.sha.clone().unwrap_or_default(),
                ref_: pipeline.ref_.clone().unwrap_or_default(),
                is_tag: pipeline.tag,
            },
            step,
        })
    }

    async fn log(&self, step: &Step) -> Result<String> {
        let (project, job_id) = step
            .log
            .key
            .rsplit_once(':')
            .ok_or_else(|| Error::NoSuchStep(format!("step {} has no log key", step.id)))?;
        let encoded = encode_project(project);

        let response = self
            .get(&format!("/api/v4/projects/{encoded}/jobs/{job_id}/trace"))
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Api {
                provider: self.display_name.clone(),
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }
        Ok(response.text().await?)
    }
}

#[async_trait]
impl SourceProvider for GitLabClient {
    fn id(&self) -> &str {
        &self.id
    }

    async fn commit(&self, repo: &str, ref_: &str) -> Result<Commit> {
        let project = self.project_path(repo)?;
        let encoded = encode_project(&project);

        // Distinguish an unknown project from an unknown reference.
        let response = self.get(&format!("/api/v4/projects/{encoded}")).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(Error::UnknownRepositoryUrl(repo.to_owned()));
        }

        let response = self
            .get(&format!(
                "/api/v4/projects/{encoded}/repository/commits/{ref_}"
            ))
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(Error::UnknownGitReference(ref_.to_owned()));
        }
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Api {
                provider: self.display_name.clone(),
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }
        let commit: GitLabCommit = response.json().await?;

        Ok(Commit {
            sha: commit.id,
            author: match commit.author_email {
                Some(email) => format!("{} <{email}>", commit.author_name.unwrap_or_default()),
                None => commit.author_name.unwrap_or_default(),
            },
            date: commit.committed_date,
            message: commit.message.unwrap_or_default(),
            ..Commit::default()
        })
    }

    async fn ref_statuses(&self, repo: &str, _ref: &str, sha: &str) -> Result<Vec<String>> {
        let project = self.project_path(repo)?;
        let encoded = encode_project(&project);

        let response = self
            .get(&format!(
                "/api/v4/projects/{encoded}/pipelines?sha={sha}&per_page=100"
            ))
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(Error::UnknownRepositoryUrl(repo.to_owned()));
        }
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Api {
                provider: self.display_name.clone(),
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }
        let pipelines: Vec<GitLabPipelineSummary> = response.json().await?;

        Ok(pipelines
            .into_iter()
            .filter_map(|p| p.web_url)
            .collect())
    }
}

// Project paths appear URL-encoded in API routes ("group/project" becomes
// "group%2Fproject").
fn encode_project(project: &str) -> String {
    project.replace('/', "%2F")
}

fn parse_state(status: &str) -> State {
    match status {
        "created" | "waiting_for_resource" | "preparing" | "pending" | "scheduled" => {
            State::Pending
        }
        "running" => State::Running,
        "success" => State::Passed,
        "failed" => State::Failed,
        "canceled" | "canceling" => State::Canceled,
        "skipped" => State::Skipped,
        "manual" => State::Manual,
        _ => State::Unknown,
    }
}

#[derive(Deserialize)]
struct GitLabPipeline {
    id: u64,
    iid: Option<u64>,
    status: String,
    #[serde(rename = "ref")]
    ref_: Option<String>,
    #[serde(default)]
    tag: bool,
    sha: Option<String>,
    created_at: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
    duration: Option<i64>,
    web_url: Option<String>,
}

#[derive(Deserialize)]
struct GitLabPipelineSummary {
    web_url: Option<String>,
}

#[derive(Deserialize)]
struct GitLabJob {
    id: u64,
    name: String,
    stage: Option<String>,
    status: String,
    #[serde(default)]
    allow_failure: bool,
    created_at: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    duration: Option<f64>,
    web_url: Option<String>,
}

#[derive(Deserialize)]
struct GitLabCommit {
    id: String,
    author_name: Option<String>,
    author_email: Option<String>,
    committed_date: Option<DateTime<Utc>>,
    message: Option<String>,
}
