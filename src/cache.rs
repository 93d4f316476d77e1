use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use indexmap::{IndexMap, IndexSet};
use log::debug;

use crate::error::{Error, Result};
use crate::models::{Commit, Pipeline, PipelineKey, State, Step};
use crate::providers::{CiProvider, SourceProvider};

#[derive(Default)]
struct CacheState {
    // All three maps are guarded by the same mutex. Critical sections stay
    // short: copy in, copy out, no provider call while holding the lock.
    commits_by_ref: IndexMap<String, Commit>,
    pipelines_by_key: IndexMap<PipelineKey, Pipeline>,
    keys_by_ref: IndexMap<String, IndexSet<PipelineKey>>,
}

/// Process-wide store of the pipelines and commits reported by providers.
///
/// A `Cache` is a cheap handle: clones share the same underlying store, so
/// the orchestrator can hand one to every task it spawns. All reads return
/// value copies.
#[derive(Clone)]
pub struct Cache {
    ci_providers: Arc<IndexMap<String, Arc<dyn CiProvider>>>,
    source_providers: Arc<Vec<Arc<dyn SourceProvider>>>,
    state: Arc<Mutex<CacheState>>,
}

impl Cache {
    pub fn new(
        ci_providers: Vec<Arc<dyn CiProvider>>,
        source_providers: Vec<Arc<dyn SourceProvider>>,
    ) -> Cache {
        let ci_providers = ci_providers
            .into_iter()
            .map(|p| (p.id().to_owned(), p))
            .collect();

        Cache {
            ci_providers: Arc::new(ci_providers),
            source_providers: Arc::new(source_providers),
            state: Arc::new(Mutex::new(CacheState::default())),
        }
    }

    pub(crate) fn ci_providers(&self) -> &IndexMap<String, Arc<dyn CiProvider>> {
        &self.ci_providers
    }

    pub(crate) fn source_providers(&self) -> &[Arc<dyn SourceProvider>] {
        &self.source_providers
    }

    /// Display name of a CI provider instance.
    pub fn provider_name(&self, provider_id: &str) -> Option<&str> {
        self.ci_providers.get(provider_id).map(|p| p.name())
    }

    fn locked(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store a pipeline and index it under `ref_`.
    ///
    /// An existing entry with the same key is only overwritten when the new
    /// pipeline is active or carries a strictly newer `updated_at`: the
    /// provider-side update timestamp is the source of truth for "has
    /// anything changed", and the rule keeps richer cached copies (for
    /// instance ones holding downloaded logs) from being replaced by leaner
    /// fresh ones. A save that changes nothing at all fails with
    /// `Error::ObsoleteBuild`.
    pub fn save_pipeline(&self, ref_: &str, pipeline: Pipeline) -> Result<()> {
        let mut guard = self.locked();
        let state = &mut *guard;
        let key = pipeline.key();

        if let Some(existing) = state.pipelines_by_key.get(&key) {
            // updated_at refers to the last update of the pipeline itself
            // and does not necessarily reflect an update of a job, so an
            // active pipeline is always replaced.
            if !pipeline.step.state.is_active()
                && pipeline.step.updated_at <= existing.step.updated_at
            {
                // Point the ref at the existing entry.
                let inserted = state
                    .keys_by_ref
                    .entry(ref_.to_owned())
                    .or_default()
                    .insert(key);
                if !inserted {
                    return Err(Error::ObsoleteBuild);
                }
                return Ok(());
            }
        }

        debug!("cache: saving pipeline {key:?} for ref {ref_:?}");
        state.pipelines_by_key.insert(key.clone(), pipeline);
        state
            .keys_by_ref
            .entry(ref_.to_owned())
            .or_default()
            .insert(key);
        Ok(())
    }

    /// Store a commit under `ref_`.
    ///
    /// When `ref_` moves to a different sha the pipelines indexed under it
    /// belonged to a now superseded commit and are dropped from the ref
    /// index (they stay addressable by key). Branch and tag lists merge
    /// monotonically: entries are only ever added, in order of first
    /// appearance.
    pub fn save_commit(&self, ref_: &str, commit: Commit) {
        let mut guard = self.locked();
        let state = &mut *guard;

        match state.commits_by_ref.get_mut(ref_) {
            Some(previous) => {
                let superseded = previous.sha != commit.sha;

                for branch in commit.branches {
                    if !previous.branches.contains(&branch) {
                        previous.branches.push(branch);
                    }
                }
                for tag in commit.tags {
                    if !previous.tags.contains(&tag) {
                        previous.tags.push(tag);
                    }
                }
                previous.statuses = commit.statuses;

                if superseded {
                    previous.sha = commit.sha;
                    previous.author = commit.author;
                    previous.date = commit.date;
                    previous.message = commit.message;
                    previous.head = commit.head;
                    state.keys_by_ref.shift_remove(ref_);
                }
            }
            None => {
                state.commits_by_ref.insert(ref_.to_owned(), commit);
            }
        }
    }

    pub fn commit(&self, ref_: &str) -> Option<Commit> {
        self.locked().commits_by_ref.get(ref_).cloned()
    }

    pub fn pipelines(&self) -> Vec<Pipeline> {
        self.locked().pipelines_by_key.values().cloned().collect()
    }

    pub fn pipelines_by_ref(&self, ref_: &str) -> Vec<Pipeline> {
        let state = self.locked();
        let keys = match state.keys_by_ref.get(ref_) {
            Some(keys) => keys,
            None => return Vec::new(),
        };
        keys.iter()
            .filter_map(|key| state.pipelines_by_key.get(key).cloned())
            .collect()
    }

    pub fn pipeline(&self, key: &PipelineKey) -> Option<Pipeline> {
        self.locked().pipelines_by_key.get(key).cloned()
    }

    /// Look up a step inside a cached pipeline by the path of child ids
    /// below the pipeline root.
    pub fn step(&self, key: &PipelineKey, step_ids: &[String]) -> Option<Step> {
        let state = self.locked();
        let mut step = &state.pipelines_by_key.get(key)?.step;
        for id in step_ids {
            step = step.children.iter().find(|child| &child.id == id)?;
        }
        Some(step.clone())
    }

    /// Log of the step identified by `key` and `step_ids`, downloading it
    /// from the owning CI provider when it is not cached. The returned
    /// content always ends with a single newline.
    pub async fn log(&self, key: &PipelineKey, step_ids: &[String]) -> Result<String> {
        let step = self
            .step(key, step_ids)
            .ok_or_else(|| Error::NoSuchStep(format!("{}/{}", key.id, step_ids.join("/"))))?;

        let log = match step.log.content.clone() {
            Some(content) => content,
            None => {
                let pipeline = self
                    .pipeline(key)
                    .ok_or_else(|| Error::NoSuchStep(format!("pipeline {}", key.id)))?;
                let provider = self
                    .ci_providers
                    .get(&pipeline.provider_id)
                    .ok_or_else(|| {
                        Error::Config(format!(
                            "no provider with id {:?} in cache",
                            pipeline.provider_id
                        ))
                    })?;

                // The mutex is not held across the provider call.
                let content = provider.log(&step).await?;
                if !step.state.is_active() {
                    self.save_step_log(key, step_ids, &content);
                }
                content
            }
        };

        if log.ends_with('\n') {
            Ok(log)
        } else {
            Ok(log + "\n")
        }
    }

    // Attach downloaded log content to a completed cached step, so later
    // reads skip the provider round trip.
    fn save_step_log(&self, key: &PipelineKey, step_ids: &[String], content: &str) {
        let mut state = self.locked();
        let Some(pipeline) = state.pipelines_by_key.get_mut(key) else {
            return;
        };
        let mut step = &mut pipeline.step;
        for id in step_ids {
            match step.children.iter_mut().find(|child| &child.id == id) {
                Some(child) => step = child,
                None => return,
            }
        }
        step.log.content = Some(content.to_owned());
    }
}
