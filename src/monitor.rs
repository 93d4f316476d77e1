use std::collections::HashSet;
use std::time::Duration;

use log::{debug, warn};
use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::cache::Cache;
use crate::error::{Error, Result};
use crate::git;
use crate::models::Commit;
use crate::providers::{CiProvider, SourceProvider};

/// Randomized exponential backoff between polls.
///
/// Grows by `multiplier` up to `max_interval` and never gives up on its own
/// unless a total elapsed limit is configured. `reset` returns the schedule
/// to its initial interval; the pollers call it whenever a poll produced a
/// meaningful change.
pub struct Backoff {
    initial_interval: Duration,
    multiplier: f64,
    randomization_factor: f64,
    max_interval: Duration,
    max_elapsed: Option<Duration>,
    current: Duration,
    started_at: Instant,
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff {
            initial_interval: Duration::from_secs(10),
            multiplier: 1.5,
            randomization_factor: 0.5,
            max_interval: Duration::from_secs(120),
            max_elapsed: None,
            current: Duration::from_secs(10),
            started_at: Instant::now(),
        }
    }
}

impl Backoff {
    pub fn new() -> Backoff {
        Backoff::default()
    }

    pub fn reset(&mut self) {
        self.current = self.initial_interval;
        self.started_at = Instant::now();
    }

    /// Next wait interval, or `None` once the schedule is exhausted.
    pub fn next_interval(&mut self) -> Option<Duration> {
        if let Some(max_elapsed) = self.max_elapsed {
            if self.started_at.elapsed() > max_elapsed {
                return None;
            }
        }

        let interval = self.randomized(self.current);
        let next = self.current.mul_f64(self.multiplier);
        self.current = next.min(self.max_interval);
        Some(interval)
    }

    fn randomized(&self, interval: Duration) -> Duration {
        if self.randomization_factor <= 0.0 {
            return interval;
        }
        let delta = interval.as_secs_f64() * self.randomization_factor;
        let low = interval.as_secs_f64() - delta;
        let high = interval.as_secs_f64() + delta;
        Duration::from_secs_f64(rand::thread_rng().gen_range(low..=high))
    }
}

async fn sleep(duration: Duration, cancel: &CancellationToken) -> Result<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(Error::Canceled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

async fn send_tick(updates: &mpsc::Sender<Instant>, cancel: &CancellationToken) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = updates.send(Instant::now()) => {}
    }
}

/// Poll `provider` at increasing intervals for the pipeline identified by
/// `url`. A tick is sent on `updates` each time the cache accepted new
/// information for this pipeline. Returns once the pipeline settles in a
/// non-active state.
async fn monitor_pipeline(
    cache: &Cache,
    provider: &dyn CiProvider,
    url: &str,
    ref_: &str,
    cancel: &CancellationToken,
    updates: &mpsc::Sender<Instant>,
) -> Result<()> {
    let mut backoff = Backoff::new();
    let mut wait = Duration::ZERO;

    loop {
        sleep(wait, cancel).await?;

        let mut pipeline = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Canceled),
            result = provider.build_from_url(url) => result?,
        };
        pipeline.provider_id = provider.id().to_owned();
        pipeline.provider_host = provider.host().to_owned();
        let state = pipeline.step.state;

        match cache.save_pipeline(ref_, pipeline) {
            Ok(()) => {
                // The save was accepted, so the pipeline differs from the
                // previous poll. It is most likely running: start over with
                // short intervals.
                send_tick(updates, cancel).await;
                backoff.reset();
            }
            Err(Error::ObsoleteBuild) => {
                // The provider returned a copy no newer than the cached
                // entry. Builds fetched from the URL never carry logs, so
                // rejecting them also protects a cached entry that gained
                // log content since.
            }
            Err(err) => return Err(err),
        }

        if !state.is_active() {
            break;
        }

        wait = match backoff.next_interval() {
            Some(wait) => wait,
            None => break,
        };
    }

    Ok(())
}

/// Ask every CI provider to monitor the pipeline at `url`. Succeeds when at
/// least one provider adopted the URL and none failed; fails with
/// `Error::UnknownPipelineUrl` only when every provider disowned it.
async fn broadcast_monitor_pipeline(
    cache: &Cache,
    url: &str,
    ref_: &str,
    cancel: &CancellationToken,
    updates: &mpsc::Sender<Instant>,
) -> Result<()> {
    let child = cancel.child_token();
    let mut tasks: JoinSet<Result<()>> = JoinSet::new();
    let provider_count = cache.ci_providers().len();

    for provider in cache.ci_providers().values() {
        // Most providers return Error::UnknownPipelineUrl right away. The
        // ones that recognize the URL keep polling until the pipeline
        // settles, an error occurs or they are canceled.
        let provider = provider.clone();
        let cache = cache.clone();
        let url = url.to_owned();
        let ref_ = ref_.to_owned();
        let cancel = child.clone();
        let updates = updates.clone();
        tasks.spawn(async move {
            monitor_pipeline(&cache, provider.as_ref(), &url, &ref_, &cancel, &updates)
                .await
                .map_err(|err| err.with_provider(provider.id()))
        });
    }

    let mut unknown_url_count = 0;
    let mut first_error = None;
    while let Some(joined) = tasks.join_next().await {
        let result = joined.unwrap_or(Err(Error::Canceled));
        match result {
            Ok(()) => {}
            Err(Error::UnknownPipelineUrl(_)) => unknown_url_count += 1,
            Err(err) => {
                if first_error.is_none() {
                    child.cancel();
                    first_error = Some(err);
                }
            }
        }
    }

    if let Some(err) = first_error {
        return Err(err);
    }
    if provider_count > 0 && unknown_url_count == provider_count {
        return Err(Error::UnknownPipelineUrl(url.to_owned()));
    }
    Ok(())
}

/// Poll `provider` at increasing intervals for the set of status URLs
/// attached to `ref_`. The commit is emitted once up front and again every
/// time the set of URLs changes.
async fn monitor_ref_statuses(
    provider: &dyn SourceProvider,
    url: &str,
    ref_: &str,
    cancel: &CancellationToken,
    commits: &mpsc::Sender<Commit>,
) -> Result<()> {
    let mut backoff = Backoff::new();

    let mut commit = tokio::select! {
        _ = cancel.cancelled() => return Err(Error::Canceled),
        result = provider.commit(url, ref_) => result?,
    };
    tokio::select! {
        _ = cancel.cancelled() => return Err(Error::Canceled),
        _ = commits.send(commit.clone()) => {}
    }

    let mut wait = Duration::ZERO;
    loop {
        sleep(wait, cancel).await?;

        let statuses = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Canceled),
            result = provider.ref_statuses(url, ref_, &commit.sha) => result,
        };
        let mut statuses = match statuses {
            Ok(statuses) => statuses,
            Err(err @ (Error::UnknownRepositoryUrl(_) | Error::Canceled)) => return Err(err),
            Err(err) => return Err(err.with_provider(provider.id())),
        };

        statuses.sort();
        if statuses != commit.statuses {
            commit.statuses = statuses;
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Canceled),
                _ = commits.send(commit.clone()) => {}
            }
            backoff.reset();
        }

        wait = match backoff.next_interval() {
            Some(wait) => wait,
            None => break,
        };
    }

    Ok(())
}

/// Ask every source provider to monitor the statuses of `ref_`, resolving
/// `repo` against the local filesystem first.
///
/// `Error::UnknownRepositoryUrl` or `Error::UnknownGitReference` are
/// returned only when every source provider failed with one of them;
/// `UnknownGitReference` takes precedence since it implies the repository
/// itself was found. Any other error cancels the remaining providers.
async fn broadcast_monitor_ref_statuses(
    cache: &Cache,
    repo: &str,
    ref_: &str,
    cancel: &CancellationToken,
    commits: &mpsc::Sender<Commit>,
) -> Result<()> {
    let mut unknown_reference = false;
    let (repository_url, effective_ref) = match git::inspect(repo, ref_)? {
        git::Inspection::Resolved { origin, commit } => {
            let sha = commit.sha.clone();
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Canceled),
                _ = commits.send(commit) => {}
            }
            (origin, sha)
        }
        git::Inspection::UnknownReference { origin } => {
            // The repository was found locally but the revision was not:
            // keep asking the source providers about the original ref and
            // remember the failure as a candidate final error.
            unknown_reference = true;
            (origin, ref_.to_owned())
        }
        git::Inspection::NotLocal => (repo.to_owned(), ref_.to_owned()),
    };

    let providers = cache.source_providers();
    if providers.is_empty() {
        return if unknown_reference {
            Err(Error::UnknownGitReference(ref_.to_owned()))
        } else {
            Ok(())
        };
    }

    let child = cancel.child_token();
    let mut tasks: JoinSet<Result<()>> = JoinSet::new();
    for provider in providers {
        let provider = provider.clone();
        let url = repository_url.clone();
        let ref_ = effective_ref.clone();
        let cancel = child.clone();
        let commits = commits.clone();
        tasks.spawn(async move {
            monitor_ref_statuses(provider.as_ref(), &url, &ref_, &cancel, &commits).await
        });
    }

    let mut unknown_count = 0;
    let mut unknown_repository = false;
    let mut fatal = None;
    while let Some(joined) = tasks.join_next().await {
        let result = joined.unwrap_or(Err(Error::Canceled));
        match result {
            Ok(()) => {}
            Err(Error::UnknownRepositoryUrl(_)) => {
                unknown_count += 1;
                unknown_repository = true;
            }
            Err(Error::UnknownGitReference(_)) => {
                unknown_count += 1;
                unknown_reference = true;
            }
            Err(err) => {
                if fatal.is_none() {
                    child.cancel();
                    fatal = Some(err);
                }
            }
        }
    }

    if let Some(err) = fatal {
        return Err(err);
    }
    if unknown_count == providers.len() {
        // UnknownGitReference wins over UnknownRepositoryUrl: it means the
        // repository resolved somewhere and only the reference is missing.
        if unknown_reference {
            return Err(Error::UnknownGitReference(ref_.to_owned()));
        }
        if unknown_repository {
            return Err(Error::UnknownRepositoryUrl(repository_url));
        }
    }
    Ok(())
}

/// Monitor the CI pipelines associated to the git reference `ref_` of
/// `repo`. Every time the cache is updated with new data a tick is sent on
/// `updates`.
///
/// One task follows the commit stream from the source providers; one task
/// per distinct status URL polls the CI providers that adopt it. The first
/// non-recoverable error cancels every sibling and is returned.
pub async fn monitor_pipelines(
    cache: Cache,
    repo: String,
    ref_: String,
    cancel: CancellationToken,
    updates: mpsc::Sender<Instant>,
) -> Result<()> {
    let child = cancel.child_token();
    let (commit_tx, mut commit_rx) = mpsc::channel::<Commit>(1);

    let mut tasks: JoinSet<Result<()>> = JoinSet::new();
    {
        let cache = cache.clone();
        let repo = repo.clone();
        let ref_ = ref_.clone();
        let cancel = child.clone();
        tasks.spawn(async move {
            // commit_tx moves into this task so the channel closes when the
            // broadcast returns, ending the receive loop below.
            broadcast_monitor_ref_statuses(&cache, &repo, &ref_, &cancel, &commit_tx).await
        });
    }

    let mut urls: HashSet<String> = HashSet::new();
    let mut commits_open = true;
    let mut first_error = None;

    while commits_open || !tasks.is_empty() {
        tokio::select! {
            maybe_commit = commit_rx.recv(), if commits_open => match maybe_commit {
                Some(commit) => {
                    let statuses = commit.statuses.clone();
                    cache.save_commit(&ref_, commit);
                    send_tick(&updates, &child).await;

                    for url in statuses {
                        if !urls.insert(url.clone()) {
                            continue;
                        }
                        debug!("monitoring pipeline URL {url}");
                        let cache = cache.clone();
                        let ref_ = ref_.clone();
                        let cancel = child.clone();
                        let updates = updates.clone();
                        tasks.spawn(async move {
                            match broadcast_monitor_pipeline(&cache, &url, &ref_, &cancel, &updates).await {
                                // No provider integrates with whatever
                                // application created this URL. Not worth
                                // reporting up the chain.
                                Err(Error::UnknownPipelineUrl(url)) => {
                                    warn!("no provider adopted pipeline URL {url}");
                                    Ok(())
                                }
                                result => result,
                            }
                        });
                    }
                }
                None => commits_open = false,
            },
            joined = tasks.join_next(), if !tasks.is_empty() => {
                if let Some(joined) = joined {
                    let result = joined.unwrap_or(Err(Error::Canceled));
                    if let Err(err) = result {
                        if first_error.is_none() {
                            child.cancel();
                            first_error = Some(err);
                        }
                    }
                }
            },
        }
    }

    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{GitReference, Pipeline, State, Step, StepType};
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::sync::Mutex;

    fn pipeline(id: &str, state: State, updated_seconds: i64) -> Pipeline {
        Pipeline {
            number: id.to_owned(),
            git_reference: GitReference {
                sha: "deadbeef".to_owned(),
                ref_: "main".to_owned(),
                is_tag: false,
            },
            step: Step {
                id: id.to_owned(),
                type_: StepType::Pipeline,
                state,
                updated_at: Utc.timestamp_opt(updated_seconds, 0).unwrap(),
                ..Step::default()
            },
            ..Pipeline::default()
        }
    }

    /// CI provider returning a scripted sequence of results.
    struct ScriptedCi {
        id: String,
        results: Mutex<Vec<Result<Pipeline>>>,
    }

    impl ScriptedCi {
        fn new(id: &str, mut results: Vec<Result<Pipeline>>) -> Self {
            results.reverse();
            ScriptedCi {
                id: id.to_owned(),
                results: Mutex::new(results),
            }
        }
    }

    #[async_trait]
    impl CiProvider for ScriptedCi {
        fn id(&self) -> &str {
            &self.id
        }

        fn host(&self) -> &str {
            "ci.example.com"
        }

        fn name(&self) -> &str {
            &self.id
        }

        async fn build_from_url(&self, url: &str) -> Result<Pipeline> {
            match self.results.lock().unwrap().pop() {
                Some(result) => result,
                None => Err(Error::UnknownPipelineUrl(url.to_owned())),
            }
        }

        async fn log(&self, _step: &Step) -> Result<String> {
            Ok(String::new())
        }
    }

    fn cache_with(providers: Vec<ScriptedCi>) -> Cache {
        let providers = providers
            .into_iter()
            .map(|p| std::sync::Arc::new(p) as std::sync::Arc<dyn CiProvider>)
            .collect();
        Cache::new(providers, Vec::new())
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_grows_up_to_the_cap() {
        let mut backoff = Backoff {
            randomization_factor: 0.0,
            ..Backoff::default()
        };

        assert_eq!(backoff.next_interval(), Some(Duration::from_secs(10)));
        assert_eq!(backoff.next_interval(), Some(Duration::from_secs(15)));
        let mut last = Duration::ZERO;
        for _ in 0..20 {
            last = backoff.next_interval().unwrap();
        }
        assert_eq!(last, Duration::from_secs(120));

        backoff.reset();
        assert_eq!(backoff.next_interval(), Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_backoff_randomization_stays_in_range() {
        let mut backoff = Backoff::new();
        let interval = backoff.next_interval().unwrap();
        assert!(interval >= Duration::from_secs(5));
        assert!(interval <= Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poller_polls_until_pipeline_settles() {
        // running(t1) -> running(t1, content change) -> passed(t2): three
        // accepted saves, three ticks, then the poller exits on its own.
        let mut second = pipeline("42", State::Running, 1);
        second.step.name = "with more detail".to_owned();
        let ci = ScriptedCi::new(
            "ci-0",
            vec![
                Ok(pipeline("42", State::Running, 1)),
                Ok(second),
                Ok(pipeline("42", State::Passed, 2)),
            ],
        );
        let cache = cache_with(vec![ci]);
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(16);

        let provider = cache.ci_providers().values().next().unwrap().clone();
        monitor_pipeline(
            &cache,
            provider.as_ref(),
            "https://ci.example.com/p/42",
            "main",
            &cancel,
            &tx,
        )
        .await
        .unwrap();

        drop(tx);
        let mut ticks = 0;
        while rx.recv().await.is_some() {
            ticks += 1;
        }
        assert_eq!(ticks, 3);

        let cached = cache.pipelines();
        assert_eq!(cached.len(), 1);
        assert_eq!(cached[0].step.state, State::Passed);
        assert_eq!(cached[0].step.updated_at, Utc.timestamp_opt(2, 0).unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_poller_does_not_tick_on_obsolete_build() {
        let ci = ScriptedCi::new(
            "ci-0",
            vec![
                Ok(pipeline("42", State::Passed, 2)),
            ],
        );
        let cache = cache_with(vec![ci]);
        // Pre-populate the cache with the same non-active pipeline.
        cache.save_pipeline("main", {
            let mut p = pipeline("42", State::Passed, 2);
            p.provider_id = "ci-0".to_owned();
            p.provider_host = "ci.example.com".to_owned();
            p
        }).unwrap();

        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(16);
        let provider = cache.ci_providers().values().next().unwrap().clone();
        monitor_pipeline(
            &cache,
            provider.as_ref(),
            "https://ci.example.com/p/42",
            "main",
            &cancel,
            &tx,
        )
        .await
        .unwrap();

        drop(tx);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcast_succeeds_when_one_provider_adopts() {
        // Only provider B adopts the URL; A and C disown it. The broadcast
        // succeeds and no error surfaces.
        let a = ScriptedCi::new("ci-a", vec![]);
        let b = ScriptedCi::new("ci-b", vec![Ok(pipeline("42", State::Passed, 1))]);
        let c = ScriptedCi::new("ci-c", vec![]);
        let cache = cache_with(vec![a, b, c]);
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(16);

        broadcast_monitor_pipeline(
            &cache,
            "https://ci.example.com/p/42",
            "main",
            &cancel,
            &tx,
        )
        .await
        .unwrap();

        drop(tx);
        assert!(rx.recv().await.is_some());
        assert_eq!(cache.pipelines().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcast_reports_unknown_url_only_when_universal() {
        let a = ScriptedCi::new("ci-a", vec![]);
        let b = ScriptedCi::new("ci-b", vec![]);
        let cache = cache_with(vec![a, b]);
        let cancel = CancellationToken::new();
        let (tx, _rx) = mpsc::channel(16);

        let result = broadcast_monitor_pipeline(
            &cache,
            "https://ci.example.com/p/42",
            "main",
            &cancel,
            &tx,
        )
        .await;

        assert!(matches!(result, Err(Error::UnknownPipelineUrl(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcast_propagates_provider_failure() {
        let a = ScriptedCi::new("ci-a", vec![]);
        let b = ScriptedCi::new(
            "ci-b",
            vec![Err(Error::Api {
                provider: "ci-b".to_owned(),
                status: 500,
                message: "boom".to_owned(),
            })],
        );
        let cache = cache_with(vec![a, b]);
        let cancel = CancellationToken::new();
        let (tx, _rx) = mpsc::channel(16);

        let result = broadcast_monitor_pipeline(
            &cache,
            "https://ci.example.com/p/42",
            "main",
            &cancel,
            &tx,
        )
        .await;

        match result {
            Err(Error::Provider { id, .. }) => assert_eq!(id, "ci-b"),
            other => panic!("expected provider error, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_poller_honors_cancellation() {
        // An endless stream of active pipelines; cancellation must stop it.
        let ci = ScriptedCi::new(
            "ci-0",
            (0..100)
                .map(|i| Ok(pipeline("42", State::Running, i)))
                .collect(),
        );
        let cache = cache_with(vec![ci]);
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(16);

        let provider = cache.ci_providers().values().next().unwrap().clone();
        let task = {
            let cache = cache.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                monitor_pipeline(
                    &cache,
                    provider.as_ref(),
                    "https://ci.example.com/p/42",
                    "main",
                    &cancel,
                    &tx,
                )
                .await
            })
        };

        // Let a couple of polls happen, then cancel.
        for _ in 0..2 {
            rx.recv().await;
        }
        cancel.cancel();
        let result = task.await.unwrap();
        assert!(matches!(result, Err(Error::Canceled)));
    }
}
