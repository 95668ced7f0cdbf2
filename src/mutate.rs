//! Phase/task/artifact/feedback mutation helpers.
//!
//! Everything here mutates in-memory only; persistence is the caller's
//! responsibility (see [`crate::project::Project::mutate`] and the thin
//! wrapper methods on [`crate::project::Project`] that call these and then
//! save).

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::{Result, SowError};
use crate::model::{ArtifactState, FeedbackItem, FeedbackStatus, PhaseState, TaskState, TaskStatus};

/// Which artifact list a helper addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactDirection {
    Input,
    Output,
}

impl ArtifactDirection {
    fn as_str(self) -> &'static str {
        match self {
            Self::Input => "inputs",
            Self::Output => "outputs",
        }
    }
}

/// Set a dot-separated path within a phase's free-form `metadata`,
/// creating intermediate objects as needed.
pub fn set_phase_metadata(phase: &mut PhaseState, key_path: &str, value: Value) -> Result<()> {
    let root = phase.metadata.get_or_insert_with(|| Value::Object(Default::default()));
    set_dotted(root, key_path, value)
}

fn set_dotted(root: &mut Value, key_path: &str, value: Value) -> Result<()> {
    let segments: Vec<&str> = key_path.split('.').collect();
    if segments.is_empty() || segments.iter().any(|s| s.is_empty()) {
        return Err(SowError::InvalidProjectState(format!(
            "invalid metadata key path: '{key_path}'"
        )));
    }
    let mut current = root;
    for segment in &segments[..segments.len() - 1] {
        if !current.is_object() {
            *current = Value::Object(Default::default());
        }
        current = current
            .as_object_mut()
            .expect("just ensured object")
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Default::default()));
    }
    if !current.is_object() {
        *current = Value::Object(Default::default());
    }
    current
        .as_object_mut()
        .expect("just ensured object")
        .insert(segments[segments.len() - 1].to_string(), value);
    Ok(())
}

/// Bump a phase's iteration counter, stored at `metadata.iteration`
/// (created at 2 if absent, since a phase starts at implicit iteration 1).
pub fn increment_phase_iteration(phase: &mut PhaseState) -> Result<u64> {
    let root = phase.metadata.get_or_insert_with(|| Value::Object(Default::default()));
    let obj = match root {
        Value::Object(map) => map,
        _ => {
            *root = Value::Object(Default::default());
            root.as_object_mut().expect("just set")
        }
    };
    let current = obj.get("iteration").and_then(Value::as_u64).unwrap_or(1);
    let next = current + 1;
    obj.insert("iteration".to_string(), Value::from(next));
    Ok(next)
}

/// Strictly greater than every existing numeric id; a multiple of 10 when
/// all existing ids are.
pub fn generate_next_task_id(existing: &[String]) -> String {
    let max = existing
        .iter()
        .filter_map(|id| id.parse::<u32>().ok())
        .max()
        .unwrap_or(0);
    format!("{:03}", max + 10)
}

fn validate_candidate_task_id(candidate: &str, existing: &[String]) -> Result<()> {
    if candidate.len() != 3 || !candidate.chars().all(|c| c.is_ascii_digit()) {
        return Err(SowError::InvalidTaskID(candidate.to_string()));
    }
    if existing.iter().any(|id| id == candidate) {
        return Err(SowError::InvalidTaskID(format!(
            "{candidate} already in use"
        )));
    }
    Ok(())
}

/// Add a task to `phase`, generating a gap-numbered id unless
/// `candidate_id` is supplied (in which case it's validated for shape and
/// uniqueness within the phase).
pub fn add_task(
    phase: &mut PhaseState,
    phase_name: &str,
    name: impl Into<String>,
    assigned_agent: impl Into<String>,
    candidate_id: Option<String>,
    now: DateTime<Utc>,
) -> Result<TaskState> {
    let existing: Vec<String> = phase.tasks.iter().map(|t| t.id.clone()).collect();
    let id = match candidate_id {
        Some(id) => {
            validate_candidate_task_id(&id, &existing)?;
            id
        }
        None => generate_next_task_id(&existing),
    };
    let task = TaskState::new(id, name, phase_name, assigned_agent, now);
    phase.tasks.push(task.clone());
    Ok(task)
}

/// Set a task's status, updating `started_at`/`completed_at` per the
/// documented rules. Returns whether the new status is terminal, so the
/// caller can decide whether to check the project type's
/// `allTasksComplete` predicate.
pub fn set_task_status(task: &mut TaskState, status: TaskStatus, now: DateTime<Utc>) -> bool {
    task.status = status;
    task.updated_at = now;
    match status {
        TaskStatus::InProgress => {
            if task.started_at.is_none() {
                task.started_at = Some(now);
            }
        }
        TaskStatus::Completed | TaskStatus::Abandoned => {
            if task.started_at.is_none() {
                task.started_at = Some(now);
            }
            if task.completed_at.is_none() {
                task.completed_at = Some(now);
            }
        }
        TaskStatus::Pending => {}
    }
    status.is_terminal()
}

/// Append an artifact to a phase's `inputs` or `outputs`, rejecting a type
/// the phase didn't declare as allowed (skipped when the phase declared no
/// types for that direction, i.e. the allow-list is empty/unconfigured).
pub fn add_artifact(
    phase: &mut PhaseState,
    phase_name: &str,
    direction: ArtifactDirection,
    allowed_types: &[String],
    artifact: ArtifactState,
) -> Result<()> {
    if !allowed_types.is_empty() && !allowed_types.iter().any(|t| t == &artifact.artifact_type) {
        return Err(SowError::ArtifactTypeNotAllowed {
            phase: phase_name.to_string(),
            direction: direction.as_str(),
            artifact_type: artifact.artifact_type,
        });
    }
    match direction {
        ArtifactDirection::Input => phase.inputs.push(artifact),
        ArtifactDirection::Output => phase.outputs.push(artifact),
    }
    Ok(())
}

fn artifact_list_mut(phase: &mut PhaseState, direction: ArtifactDirection) -> &mut Vec<ArtifactState> {
    match direction {
        ArtifactDirection::Input => &mut phase.inputs,
        ArtifactDirection::Output => &mut phase.outputs,
    }
}

pub fn remove_artifact(
    phase: &mut PhaseState,
    phase_name: &str,
    direction: ArtifactDirection,
    index: usize,
) -> Result<ArtifactState> {
    let list = artifact_list_mut(phase, direction);
    if index >= list.len() {
        return Err(SowError::ArtifactIndexOutOfRange {
            phase: phase_name.to_string(),
            direction: direction.as_str(),
            index,
        });
    }
    Ok(list.remove(index))
}

/// Set a single field on an artifact by dot-notation path: `approved`,
/// `path`, `type`, or `metadata.*`.
pub fn set_artifact_field(
    phase: &mut PhaseState,
    phase_name: &str,
    direction: ArtifactDirection,
    index: usize,
    field_path: &str,
    value: Value,
) -> Result<()> {
    let list = artifact_list_mut(phase, direction);
    let artifact = list
        .get_mut(index)
        .ok_or_else(|| SowError::ArtifactIndexOutOfRange {
            phase: phase_name.to_string(),
            direction: direction.as_str(),
            index,
        })?;

    if let Some(rest) = field_path.strip_prefix("metadata.") {
        let root = artifact
            .metadata
            .get_or_insert_with(|| Value::Object(Default::default()));
        return set_dotted(root, rest, value);
    }

    match field_path {
        "approved" => match value.as_bool() {
            Some(b) => artifact.approved = Some(b),
            None => {
                return Err(SowError::InvalidProjectState(format!(
                    "field 'approved' must be a bool, got {value}"
                )))
            }
        },
        "path" => match value.as_str() {
            Some(s) => artifact.path = s.to_string(),
            None => {
                return Err(SowError::InvalidProjectState(format!(
                    "field 'path' must be a string, got {value}"
                )))
            }
        },
        "type" => match value.as_str() {
            Some(s) => artifact.artifact_type = s.to_string(),
            None => {
                return Err(SowError::InvalidProjectState(format!(
                    "field 'type' must be a string, got {value}"
                )))
            }
        },
        "metadata" => {
            artifact.metadata = Some(value);
        }
        other => {
            return Err(SowError::InvalidProjectState(format!(
                "unknown artifact field '{other}'"
            )));
        }
    }
    Ok(())
}

/// Find the last artifact in `src.outputs` matching `artifact_type` and
/// satisfying `predicate`, appending it to `dst.inputs`.
pub fn add_phase_input_from_output(
    src: &PhaseState,
    dst: &mut PhaseState,
    artifact_type: &str,
    predicate: impl Fn(&ArtifactState) -> bool,
) -> Option<()> {
    let found = src
        .outputs
        .iter()
        .rev()
        .find(|a| a.artifact_type == artifact_type && predicate(a))
        .cloned()?;
    dst.inputs.push(found);
    Some(())
}

pub fn generate_next_feedback_id(task: &TaskState) -> String {
    let max = task
        .feedback
        .iter()
        .filter_map(|f| f.id.parse::<u32>().ok())
        .max()
        .unwrap_or(0);
    format!("{:03}", max + 1)
}

pub fn add_feedback(task: &mut TaskState, body: impl Into<String>, now: DateTime<Utc>) -> FeedbackItem {
    let id = generate_next_feedback_id(task);
    let item = FeedbackItem::new(id, body, now);
    task.feedback.push(item.clone());
    item
}

pub fn mark_feedback_addressed(task: &mut TaskState, id: &str, now: DateTime<Utc>) -> Result<()> {
    let item = task
        .feedback
        .iter_mut()
        .find(|f| f.id == id)
        .ok_or_else(|| SowError::FeedbackNotFound(id.to_string()))?;
    if item.status == FeedbackStatus::Pending {
        item.status = FeedbackStatus::Addressed;
        item.addressed_at = Some(now);
    }
    Ok(())
}

/// Append to `task.references`, ignoring an exact duplicate.
pub fn add_reference(task: &mut TaskState, path: impl Into<String>) {
    let path = path.into();
    if !task.references.iter().any(|r| r == &path) {
        task.references.push(path);
    }
}

/// Append to `task.files`, ignoring an exact duplicate.
pub fn add_file(task: &mut TaskState, path: impl Into<String>) {
    let path = path.into();
    if !task.files.iter().any(|f| f == &path) {
        task.files.push(path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn gap_numbered_ids() {
        let existing = vec!["010".to_string(), "020".to_string(), "030".to_string()];
        assert_eq!(generate_next_task_id(&existing), "040");
    }

    #[test]
    fn candidate_id_between_existing_accepted_then_next_auto_id_still_gapped() {
        let mut phase = PhaseState::new("in_progress", now());
        add_task(&mut phase, "t1", "agent", Some("010".into()), now()).unwrap();
        add_task(&mut phase, "t2", "agent", Some("020".into()), now()).unwrap();
        add_task(&mut phase, "t3", "agent", Some("030".into()), now()).unwrap();

        let auto = add_task(&mut phase, "t4", "agent", None, now()).unwrap();
        assert_eq!(auto.id, "040");

        add_task(&mut phase, "t5", "agent", Some("025".into()), now()).unwrap();
        let auto2 = add_task(&mut phase, "t6", "agent", None, now()).unwrap();
        assert_eq!(auto2.id, "050");
    }

    #[test]
    fn set_phase_metadata_routes_into_map() {
        let mut phase = PhaseState::new("in_progress", now());
        set_phase_metadata(&mut phase, "assessment", Value::String("fail".into())).unwrap();
        assert_eq!(
            phase.metadata.unwrap()["assessment"],
            Value::String("fail".into())
        );
    }

    #[test]
    fn increment_phase_iteration_starts_at_two() {
        let mut phase = PhaseState::new("in_progress", now());
        assert_eq!(increment_phase_iteration(&mut phase).unwrap(), 2);
        assert_eq!(increment_phase_iteration(&mut phase).unwrap(), 3);
    }

    #[test]
    fn set_task_status_completed_sets_started_and_completed() {
        let mut task = TaskState::new("010", "do thing", "work", "agent", now());
        let terminal = set_task_status(&mut task, TaskStatus::Completed, now());
        assert!(terminal);
        assert!(task.started_at.is_some());
        assert!(task.completed_at.is_some());
    }

    #[test]
    fn add_artifact_rejects_undeclared_type() {
        let mut phase = PhaseState::new("in_progress", now());
        let allowed = vec!["result".to_string()];
        let artifact = ArtifactState::new("rogue", "out.md", now());
        let err = add_artifact(
            &mut phase,
            "work",
            ArtifactDirection::Output,
            &allowed,
            artifact,
        )
        .unwrap_err();
        assert!(matches!(err, SowError::ArtifactTypeNotAllowed { .. }));
    }

    #[test]
    fn set_artifact_field_rejects_wrong_value_type() {
        let mut phase = PhaseState::new("in_progress", now());
        phase.outputs.push(ArtifactState::new("result", "out.md", now()));

        let err = set_artifact_field(
            &mut phase,
            "work",
            ArtifactDirection::Output,
            0,
            "approved",
            Value::String("yes".into()),
        )
        .unwrap_err();
        assert!(matches!(err, SowError::InvalidProjectState(_)));

        let err = set_artifact_field(
            &mut phase,
            "work",
            ArtifactDirection::Output,
            0,
            "path",
            Value::Bool(true),
        )
        .unwrap_err();
        assert!(matches!(err, SowError::InvalidProjectState(_)));

        let err = set_artifact_field(
            &mut phase,
            "work",
            ArtifactDirection::Output,
            0,
            "type",
            Value::from(42),
        )
        .unwrap_err();
        assert!(matches!(err, SowError::InvalidProjectState(_)));

        // the artifact must be untouched by the rejected attempts
        assert_eq!(phase.outputs[0].path, "out.md");
        assert_eq!(phase.outputs[0].artifact_type, "result");
        assert!(phase.outputs[0].approved.is_none());
    }

    #[test]
    fn add_phase_input_from_output_copies_latest_match() {
        let mut src = PhaseState::new("completed", now());
        src.outputs.push(ArtifactState::new("review", "r1.md", now()));
        src.outputs.push(ArtifactState::new("review", "r2.md", now()));
        let mut dst = PhaseState::new("pending", now());

        add_phase_input_from_output(&src, &mut dst, "review", |_| true).unwrap();
        assert_eq!(dst.inputs.len(), 1);
        assert_eq!(dst.inputs[0].path, "r2.md");
    }

    #[test]
    fn feedback_lifecycle() {
        let mut task = TaskState::new("010", "do thing", "work", "agent", now());
        let item = add_feedback(&mut task, "fix the thing", now());
        assert_eq!(item.id, "001");
        mark_feedback_addressed(&mut task, "001", now()).unwrap();
        assert_eq!(task.feedback[0].status, FeedbackStatus::Addressed);
    }

    #[test]
    fn add_reference_dedups() {
        let mut task = TaskState::new("010", "do thing", "work", "agent", now());
        add_reference(&mut task, "docs/a.md");
        add_reference(&mut task, "docs/a.md");
        assert_eq!(task.references.len(), 1);
    }
}
