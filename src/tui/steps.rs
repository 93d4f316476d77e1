use std::cmp::Ordering;
use std::collections::HashMap;

use chrono::{DateTime, Duration, FixedOffset, Utc};

use crate::error::{Error, Result};
use crate::models::{GitReference, Pipeline, State, Step, StepType};
use crate::tui::table::{self, TableConfiguration, TableNode};
use crate::tui::text::{Alignment, StyleClass, StyledString};
use crate::utils;

/// Hard cap on step nesting. Paths deeper than this are a programmer error
/// on the provider side and are rejected loudly, never truncated.
pub const MAX_STEP_DEPTH: usize = 10;

/// Identity of a row: the provider host plus the path of step ids from the
/// pipeline root down to the step.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskKey {
    pub provider_host: String,
    pub step_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Column {
    Ref,
    Pipeline,
    Type,
    State,
    Name,
    Created,
    Started,
    Finished,
    Updated,
    Duration,
    Url,
}

/// One row of the pipeline table: a step flattened for display, together
/// with its pre-rendered column values.
#[derive(Debug, Clone)]
pub struct TaskRow {
    key: TaskKey,
    git_ref: GitReference,
    number: String,
    type_: &'static str,
    state: State,
    name: String,
    provider: String,
    created_at: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
    duration: Option<Duration>,
    url: Option<String>,
    values: HashMap<Column, StyledString>,
    children: Vec<TaskRow>,
}

impl TaskRow {
    /// Timestamp used to order pipelines in the table: the earliest event
    /// known for the row.
    pub fn sort_time(&self) -> Option<DateTime<Utc>> {
        utils::min_time(&[
            self.created_at,
            self.started_at,
            self.updated_at,
            self.finished_at,
        ])
    }
}

/// Flatten a pipeline into a [`TaskRow`] forest. Timestamps are rendered in
/// the caller-provided timezone.
pub fn task_from_pipeline(
    pipeline: &Pipeline,
    provider_name: &str,
    tz: &FixedOffset,
) -> Result<TaskRow> {
    let mut number = pipeline.number.clone();
    if number.is_empty() {
        number = pipeline.step.id.clone();
    }
    if !number.is_empty() && number.chars().all(|c| c.is_ascii_digit()) {
        number = format!("#{number}");
    }

    let key = TaskKey {
        provider_host: pipeline.provider_host.clone(),
        step_ids: Vec::new(),
    };

    task_from_step(
        &pipeline.step,
        &pipeline.git_reference,
        key,
        provider_name,
        &number,
        tz,
    )
}

fn task_from_step(
    step: &Step,
    git_ref: &GitReference,
    parent_key: TaskKey,
    provider: &str,
    number: &str,
    tz: &FixedOffset,
) -> Result<TaskRow> {
    if parent_key.step_ids.len() >= MAX_STEP_DEPTH {
        return Err(Error::NestingTooDeep(MAX_STEP_DEPTH));
    }
    let mut key = parent_key;
    key.step_ids.push(step.id.clone());

    let mut task = TaskRow {
        key: key.clone(),
        git_ref: git_ref.clone(),
        number: number.to_owned(),
        type_: match step.type_ {
            StepType::Pipeline => "P",
            StepType::Stage => "S",
            StepType::Job => "J",
            StepType::Task => "T",
        },
        state: step.state,
        name: step.name.clone(),
        provider: provider.to_owned(),
        created_at: step.created_at,
        started_at: step.started_at,
        finished_at: step.finished_at,
        updated_at: Some(step.updated_at),
        duration: step.duration,
        url: step.web_url.clone(),
        values: HashMap::new(),
        children: Vec::new(),
    };
    task.values = render_values(&task, tz);

    for child in &step.children {
        task.children
            .push(task_from_step(child, git_ref, key.clone(), provider, number, tz)?);
    }

    Ok(task)
}

fn render_values(task: &TaskRow, tz: &FixedOffset) -> HashMap<Column, StyledString> {
    let time = |t: Option<DateTime<Utc>>| match t {
        Some(t) => StyledString::new(t.with_timezone(tz).format("%b %-d %H:%M").to_string()),
        None => StyledString::new("-"),
    };

    let ref_class = if task.git_ref.is_tag {
        StyleClass::GitTag
    } else {
        StyleClass::GitBranch
    };

    let state_class = match task.state {
        State::Failed | State::Canceled => StyleClass::StatusFailed,
        State::Passed => StyleClass::StatusPassed,
        State::Running => StyleClass::StatusRunning,
        _ => StyleClass::StatusSkipped,
    };

    let name = if task.type_ == "P" {
        let mut name = StyledString::styled(task.provider.clone(), StyleClass::Provider);
        if !task.name.is_empty() {
            name.append(format!(": {}", task.name));
        }
        name
    } else {
        StyledString::new(task.name.clone())
    };

    HashMap::from([
        (
            Column::Ref,
            StyledString::styled(task.git_ref.ref_.clone(), ref_class),
        ),
        (Column::Pipeline, StyledString::new(task.number.clone())),
        (Column::Type, StyledString::new(task.type_)),
        (
            Column::State,
            StyledString::styled(task.state.to_string(), state_class),
        ),
        (Column::Name, name),
        (Column::Created, time(task.created_at)),
        (Column::Started, time(task.started_at)),
        (Column::Finished, time(task.finished_at)),
        (Column::Updated, time(task.updated_at)),
        (
            Column::Duration,
            StyledString::new(utils::format_duration(task.duration)),
        ),
        (
            Column::Url,
            StyledString::new(task.url.clone().unwrap_or_else(|| "-".to_owned())),
        ),
    ])
}

impl TableNode for TaskRow {
    type Id = TaskKey;
    type ColumnId = Column;

    fn id(&self) -> TaskKey {
        self.key.clone()
    }

    fn children(&self) -> &[TaskRow] {
        &self.children
    }

    fn values(&self) -> HashMap<Column, StyledString> {
        self.values.clone()
    }

    fn compare(&self, other: &TaskRow, column: Column) -> Ordering {
        match column {
            Column::Ref => self.git_ref.ref_.cmp(&other.git_ref.ref_),
            Column::Pipeline => compare_numbers(&self.number, &other.number),
            Column::Type => self.type_.cmp(other.type_),
            Column::State => self.state.to_string().cmp(&other.state.to_string()),
            Column::Name => self.name.cmp(&other.name),
            Column::Created => self.created_at.cmp(&other.created_at),
            Column::Started => self.started_at.cmp(&other.started_at),
            Column::Finished => self.finished_at.cmp(&other.finished_at),
            Column::Updated => self.updated_at.cmp(&other.updated_at),
            Column::Duration => self.duration.cmp(&other.duration),
            Column::Url => self.url.cmp(&other.url),
        }
    }
}

// Pipeline numbers like "#42" sort numerically, anything else
// lexicographically.
fn compare_numbers(a: &str, b: &str) -> Ordering {
    let parse = |s: &str| s.trim_start_matches('#').parse::<u64>().ok();
    match (parse(a), parse(b)) {
        (Some(a), Some(b)) => a.cmp(&b),
        _ => a.cmp(b),
    }
}

pub fn table_configuration() -> TableConfiguration<Column> {
    let column = |id, header, max_width, alignment, tree_prefix| table::Column {
        id,
        header,
        max_width,
        alignment,
        tree_prefix,
    };

    TableConfiguration {
        columns: vec![
            column(Column::Ref, "REF", 30, Alignment::Left, false),
            column(Column::Pipeline, "PIPELINE", 12, Alignment::Right, false),
            column(Column::Type, "TYPE", 4, Alignment::Right, false),
            column(Column::State, "STATE", 10, Alignment::Left, false),
            column(Column::Name, "NAME", 60, Alignment::Left, true),
            column(Column::Created, "CREATED", 16, Alignment::Left, false),
            column(Column::Started, "STARTED", 16, Alignment::Left, false),
            column(Column::Finished, "FINISHED", 16, Alignment::Left, false),
            column(Column::Updated, "UPDATED", 16, Alignment::Left, false),
            column(Column::Duration, "DURATION", 10, Alignment::Right, false),
            column(Column::Url, "URL", 80, Alignment::Left, false),
        ],
        sep: "  ".to_owned(),
        header_suffix_ascending: " ▲".to_owned(),
        header_suffix_descending: " ▼".to_owned(),
        default_depth: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn tz() -> FixedOffset {
        FixedOffset::east_opt(0).unwrap()
    }

    fn pipeline(number: &str) -> Pipeline {
        Pipeline {
            number: number.to_owned(),
            provider_id: "gitlab-0".to_owned(),
            provider_host: "gitlab.com".to_owned(),
            git_reference: GitReference {
                sha: "deadbeef".to_owned(),
                ref_: "main".to_owned(),
                is_tag: false,
            },
            step: Step {
                id: "42".to_owned(),
                name: "nightly build".to_owned(),
                type_: StepType::Pipeline,
                state: State::Running,
                ..Step::default()
            },
        }
    }

    #[test]
    fn test_numeric_pipeline_number_gets_a_hash_prefix() {
        let task = task_from_pipeline(&pipeline("42"), "gitlab", &tz()).unwrap();
        assert_eq!(task.values()[&Column::Pipeline].text(), "#42");
    }

    #[test]
    fn test_non_numeric_pipeline_number_is_unchanged() {
        let task = task_from_pipeline(&pipeline("release-1"), "gitlab", &tz()).unwrap();
        assert_eq!(task.values()[&Column::Pipeline].text(), "release-1");
    }

    #[test]
    fn test_pipeline_row_name_carries_the_provider_prefix() {
        let task = task_from_pipeline(&pipeline("42"), "gitlab", &tz()).unwrap();
        assert_eq!(task.values()[&Column::Name].text(), "gitlab: nightly build");

        let mut anonymous = pipeline("42");
        anonymous.step.name = String::new();
        let task = task_from_pipeline(&anonymous, "gitlab", &tz()).unwrap();
        assert_eq!(task.values()[&Column::Name].text(), "gitlab");
    }

    #[test]
    fn test_child_rows_use_their_own_name() {
        let mut p = pipeline("42");
        p.step.children = vec![Step {
            id: "build".to_owned(),
            name: "build".to_owned(),
            type_: StepType::Stage,
            ..Step::default()
        }];
        let task = task_from_pipeline(&p, "gitlab", &tz()).unwrap();
        assert_eq!(task.children[0].values()[&Column::Name].text(), "build");
        assert_eq!(task.children[0].values()[&Column::Type].text(), "S");
    }

    #[test]
    fn test_row_identity_is_the_path_of_step_ids() {
        let mut p = pipeline("42");
        p.step.children = vec![Step {
            id: "build".to_owned(),
            type_: StepType::Stage,
            children: vec![Step {
                id: "7".to_owned(),
                type_: StepType::Job,
                ..Step::default()
            }],
            ..Step::default()
        }];
        let task = task_from_pipeline(&p, "gitlab", &tz()).unwrap();

        assert_eq!(task.id().step_ids, vec!["42"]);
        assert_eq!(task.children[0].id().step_ids, vec!["42", "build"]);
        assert_eq!(
            task.children[0].children[0].id().step_ids,
            vec!["42", "build", "7"]
        );
        assert_eq!(task.id().provider_host, "gitlab.com");
    }

    #[test]
    fn test_nesting_deeper_than_the_cap_is_rejected() {
        let mut step = Step {
            id: "leaf".to_owned(),
            ..Step::default()
        };
        for depth in 0..MAX_STEP_DEPTH {
            step = Step {
                id: format!("level-{depth}"),
                children: vec![step],
                ..Step::default()
            };
        }
        let mut p = pipeline("42");
        p.step.children = step.children;

        let result = task_from_pipeline(&p, "gitlab", &tz());
        assert!(matches!(result, Err(Error::NestingTooDeep(MAX_STEP_DEPTH))));
    }

    #[test]
    fn test_null_timestamps_render_as_a_placeholder() {
        let task = task_from_pipeline(&pipeline("42"), "gitlab", &tz()).unwrap();
        let values = task.values();
        assert_eq!(values[&Column::Created].text(), "-");
        assert_eq!(values[&Column::Started].text(), "-");
        assert_eq!(values[&Column::Finished].text(), "-");
        assert_eq!(values[&Column::Duration].text(), "-");
        assert_eq!(values[&Column::Url].text(), "-");
    }

    #[test]
    fn test_timestamps_render_in_the_given_timezone() {
        let mut p = pipeline("42");
        p.step.started_at = Some(Utc.with_ymd_and_hms(2019, 12, 1, 12, 30, 0).unwrap());
        let task = task_from_pipeline(&p, "gitlab", &tz()).unwrap();
        assert_eq!(task.values()[&Column::Started].text(), "Dec 1 12:30");

        let paris = FixedOffset::east_opt(3600).unwrap();
        let task = task_from_pipeline(&p, "gitlab", &paris).unwrap();
        assert_eq!(task.values()[&Column::Started].text(), "Dec 1 13:30");
    }

    #[test]
    fn test_ref_is_styled_as_branch_or_tag() {
        let task = task_from_pipeline(&pipeline("42"), "gitlab", &tz()).unwrap();
        assert_eq!(
            task.values()[&Column::Ref],
            StyledString::styled("main", StyleClass::GitBranch)
        );

        let mut tagged = pipeline("42");
        tagged.git_reference.ref_ = "v1.0".to_owned();
        tagged.git_reference.is_tag = true;
        let task = task_from_pipeline(&tagged, "gitlab", &tz()).unwrap();
        assert_eq!(
            task.values()[&Column::Ref],
            StyledString::styled("v1.0", StyleClass::GitTag)
        );
    }

    #[test]
    fn test_state_style_mapping() {
        for (state, class) in [
            (State::Failed, StyleClass::StatusFailed),
            (State::Canceled, StyleClass::StatusFailed),
            (State::Passed, StyleClass::StatusPassed),
            (State::Running, StyleClass::StatusRunning),
            (State::Pending, StyleClass::StatusSkipped),
            (State::Skipped, StyleClass::StatusSkipped),
            (State::Manual, StyleClass::StatusSkipped),
        ] {
            let mut p = pipeline("42");
            p.step.state = state;
            let task = task_from_pipeline(&p, "gitlab", &tz()).unwrap();
            assert_eq!(
                task.values()[&Column::State],
                StyledString::styled(state.to_string(), class),
                "state {state}"
            );
        }
    }
}
