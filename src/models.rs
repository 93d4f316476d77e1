use std::fmt;

use chrono::{DateTime, Duration, Utc};

use crate::utils;

/// Execution state of a pipeline, stage, job or task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum State {
    #[default]
    Unknown,
    Pending,
    Running,
    Passed,
    Failed,
    Canceled,
    Manual,
    Skipped,
}

impl State {
    /// A state is active while the provider may still change it on its own.
    pub fn is_active(self) -> bool {
        matches!(self, State::Pending | State::Running)
    }

    fn precedence(self) -> u8 {
        match self {
            State::Unknown => 80,
            State::Running => 70,
            State::Pending => 60,
            State::Canceled => 50,
            State::Failed => 40,
            State::Passed => 30,
            State::Skipped => 20,
            State::Manual => 10,
        }
    }

    /// Combine two child states into the state of their parent. The state
    /// with the higher precedence wins.
    pub fn merge(self, other: State) -> State {
        if self.precedence() > other.precedence() {
            self
        } else {
            other
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            State::Unknown => "unknown",
            State::Pending => "pending",
            State::Running => "running",
            State::Passed => "passed",
            State::Failed => "failed",
            State::Canceled => "canceled",
            State::Manual => "manual",
            State::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StepType {
    #[default]
    Pipeline,
    Stage,
    Job,
    Task,
}

/// A captured log payload. `content` is `None` until the log has actually
/// been downloaded; `key` is whatever the owning provider needs to fetch it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Log {
    pub key: String,
    pub content: Option<String>,
}

/// A node in a pipeline tree. `id` is unique among the children of a single
/// parent only; a step is globally identified by the path of ids from the
/// pipeline root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub id: String,
    pub name: String,
    pub type_: StepType,
    pub state: State,
    pub allow_failure: bool,
    pub created_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub duration: Option<Duration>,
    pub web_url: Option<String>,
    pub log: Log,
    pub children: Vec<Step>,
}

impl Default for Step {
    fn default() -> Self {
        Step {
            id: String::new(),
            name: String::new(),
            type_: StepType::default(),
            state: State::default(),
            allow_failure: false,
            created_at: None,
            started_at: None,
            finished_at: None,
            updated_at: DateTime::<Utc>::UNIX_EPOCH,
            duration: None,
            web_url: None,
            log: Log::default(),
            children: Vec::new(),
        }
    }
}

/// Aggregate an ordered list of sibling steps into a single synthetic step.
///
/// A child marked `allow_failure` that failed or was canceled counts as
/// passed before states are merged. Timestamps combine as the minimum of
/// creation/start times and the maximum of finish/update times.
pub fn aggregate(steps: &[Step]) -> Step {
    match steps.len() {
        0 => Step::default(),
        1 => steps[0].clone(),
        _ => {
            let mut first = steps[0].clone();
            let mut last = aggregate(&steps[1..]);
            for step in [&mut first, &mut last] {
                if step.allow_failure && matches!(step.state, State::Canceled | State::Failed) {
                    step.state = State::Passed;
                }
            }

            let mut step = Step {
                state: first.state.merge(last.state),
                created_at: utils::min_time(&[first.created_at, last.created_at]),
                started_at: utils::min_time(&[first.started_at, last.started_at]),
                finished_at: utils::max_time(&[first.finished_at, last.finished_at]),
                updated_at: first.updated_at.max(last.updated_at),
                children: steps.to_vec(),
                ..Step::default()
            };
            step.duration = utils::opt_sub(step.finished_at, step.started_at);
            step
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GitReference {
    pub sha: String,
    pub ref_: String,
    pub is_tag: bool,
}

/// Identity of a pipeline in the cache. The provider host keeps two
/// instances of the same backend from colliding.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PipelineKey {
    pub provider_host: String,
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Pipeline {
    /// Human readable pipeline number. Displayed with a leading `#` when
    /// purely numeric.
    pub number: String,
    pub provider_id: String,
    pub provider_host: String,
    pub git_reference: GitReference,
    pub step: Step,
}

impl Pipeline {
    pub fn key(&self) -> PipelineKey {
        PipelineKey {
            provider_host: self.provider_host.clone(),
            id: self.step.id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Commit {
    pub sha: String,
    pub author: String,
    pub date: Option<DateTime<Utc>>,
    pub message: String,
    pub branches: Vec<String>,
    pub tags: Vec<String>,
    /// Symbolic name HEAD points to, when known.
    pub head: Option<String>,
    /// URLs of the CI statuses attached to this commit, sorted.
    pub statuses: Vec<String>,
}
