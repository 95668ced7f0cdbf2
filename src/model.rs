//! Persistent project data model.
//!
//! Plain data with schema-enforced invariants. Nothing in this module knows
//! about the state machine; [`ProjectState`] and its children are what gets
//! serialized to `.sow/project/state.yaml` and handed to guards/actions.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::OnceLock;

use crate::error::{Result, SowError};

macro_rules! static_regex {
    ($fn_name:ident, $pat:expr) => {
        fn $fn_name() -> &'static Regex {
            static RE: OnceLock<Regex> = OnceLock::new();
            RE.get_or_init(|| Regex::new($pat).expect("static regex is valid"))
        }
    };
}

static_regex!(name_re, r"^[a-z0-9][a-z0-9-]*[a-z0-9]$");
static_regex!(type_re, r"^[a-z0-9_]+$");
static_regex!(task_id_re, r"^[0-9]{3}$");

/// The root document persisted at `.sow/project/state.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectState {
    pub name: String,

    #[serde(rename = "type")]
    pub project_type: String,

    pub branch: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    #[serde(default)]
    pub phases: BTreeMap<String, PhaseState>,

    pub statechart: StatechartState,

    /// Unknown keys are preserved verbatim so a newer project type's
    /// metadata additions survive a round trip through an older binary.
    #[serde(flatten)]
    pub extra: serde_yaml::Mapping,
}

impl ProjectState {
    /// Validate the document-level invariants from the design doc.
    ///
    /// This is called from [`crate::project::Project::save`], never on every
    /// mutation, so helpers can compose several edits before persisting.
    pub fn validate(&self) -> Result<()> {
        if !name_re().is_match(&self.name) {
            return Err(SowError::InvalidProjectState(format!(
                "name '{}' does not match ^[a-z0-9][a-z0-9-]*[a-z0-9]$",
                self.name
            )));
        }
        if !type_re().is_match(&self.project_type) {
            return Err(SowError::InvalidProjectState(format!(
                "type '{}' does not match ^[a-z0-9_]+$",
                self.project_type
            )));
        }
        if self.branch.is_empty() {
            return Err(SowError::InvalidProjectState(
                "branch must be non-empty".into(),
            ));
        }
        if self.statechart.current_state.is_empty() {
            return Err(SowError::InvalidProjectState(
                "statechart.current_state must be non-empty".into(),
            ));
        }
        for (name, phase) in &self.phases {
            phase
                .validate()
                .map_err(|e| SowError::InvalidProjectState(format!("phase '{name}': {e}")))?;
        }
        Ok(())
    }
}

/// One named division of a project: status, timestamps, artifacts, tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseState {
    /// Values are project-type defined; typically one of `pending`,
    /// `in_progress`, `completed`, `failed`, `abandoned`.
    pub status: String,

    #[serde(default = "default_true")]
    pub enabled: bool,

    pub created_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,

    /// Free-form, project-type-specific shape; validated at save time via
    /// the phase's registered metadata schema, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,

    #[serde(default)]
    pub inputs: Vec<ArtifactState>,

    #[serde(default)]
    pub outputs: Vec<ArtifactState>,

    #[serde(default)]
    pub tasks: Vec<TaskState>,

    #[serde(flatten)]
    pub extra: serde_yaml::Mapping,
}

fn default_true() -> bool {
    true
}

impl PhaseState {
    pub fn new(status: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            status: status.into(),
            enabled: true,
            created_at: now,
            started_at: None,
            completed_at: None,
            failed_at: None,
            metadata: None,
            inputs: Vec::new(),
            outputs: Vec::new(),
            tasks: Vec::new(),
            extra: serde_yaml::Mapping::new(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.status.is_empty() {
            return Err(SowError::InvalidProjectState(
                "status must be non-empty".into(),
            ));
        }
        if let (Some(started), Some(completed)) = (self.started_at, self.completed_at) {
            if started > completed {
                return Err(SowError::InvalidProjectState(
                    "started_at must be <= completed_at".into(),
                ));
            }
        }
        for task in &self.tasks {
            task.validate()?;
        }
        for artifact in self.inputs.iter().chain(self.outputs.iter()) {
            artifact.validate()?;
        }
        Ok(())
    }

    /// The last output artifact of the given type, if any — the "latest"
    /// artifact semantics referenced throughout the design doc.
    pub fn latest_output(&self, artifact_type: &str) -> Option<&ArtifactState> {
        self.outputs
            .iter()
            .rev()
            .find(|a| a.artifact_type == artifact_type)
    }

    /// The last input artifact of the given type, if any.
    pub fn latest_input(&self, artifact_type: &str) -> Option<&ArtifactState> {
        self.inputs
            .iter()
            .rev()
            .find(|a| a.artifact_type == artifact_type)
    }
}

/// A typed file reference in a phase's (or task's) `inputs`/`outputs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactState {
    #[serde(rename = "type")]
    pub artifact_type: String,

    /// Relative to the project directory.
    pub path: String,

    /// Absent is equivalent to `false` — the engine never reads an unset
    /// boolean as `true`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved: Option<bool>,

    pub created_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,

    #[serde(flatten)]
    pub extra: serde_yaml::Mapping,
}

impl ArtifactState {
    pub fn new(artifact_type: impl Into<String>, path: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            artifact_type: artifact_type.into(),
            path: path.into(),
            approved: None,
            created_at: now,
            metadata: None,
            extra: serde_yaml::Mapping::new(),
        }
    }

    /// `approved` read with the documented "absent == false" semantics.
    pub fn is_approved(&self) -> bool {
        self.approved.unwrap_or(false)
    }

    pub fn validate(&self) -> Result<()> {
        if self.artifact_type.is_empty() {
            return Err(SowError::InvalidProjectState(
                "artifact type must be non-empty".into(),
            ));
        }
        if self.path.is_empty() {
            return Err(SowError::InvalidProjectState(
                "artifact path must be non-empty".into(),
            ));
        }
        Ok(())
    }
}

/// Lifecycle status of a [`TaskState`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Abandoned,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Completed => write!(f, "completed"),
            Self::Abandoned => write!(f, "abandoned"),
        }
    }
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Abandoned)
    }
}

/// A discrete unit of work within a phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskState {
    /// Three-digit zero-padded id, e.g. `"010"`.
    pub id: String,

    pub name: String,

    pub phase: String,

    pub status: TaskStatus,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    #[serde(default = "default_iteration")]
    pub iteration: u32,

    pub assigned_agent: String,

    #[serde(default)]
    pub inputs: Vec<ArtifactState>,

    #[serde(default)]
    pub outputs: Vec<ArtifactState>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,

    #[serde(default)]
    pub feedback: Vec<FeedbackItem>,

    #[serde(default)]
    pub references: Vec<String>,

    #[serde(default)]
    pub files: Vec<String>,

    #[serde(flatten)]
    pub extra: serde_yaml::Mapping,
}

fn default_iteration() -> u32 {
    1
}

impl TaskState {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        phase: impl Into<String>,
        assigned_agent: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            phase: phase.into(),
            status: TaskStatus::Pending,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            iteration: 1,
            assigned_agent: assigned_agent.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            metadata: None,
            feedback: Vec::new(),
            references: Vec::new(),
            files: Vec::new(),
            extra: serde_yaml::Mapping::new(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !task_id_re().is_match(&self.id) {
            return Err(SowError::InvalidTaskID(self.id.clone()));
        }
        if self.name.is_empty() {
            return Err(SowError::InvalidProjectState(
                "task name must be non-empty".into(),
            ));
        }
        if self.phase.is_empty() {
            return Err(SowError::InvalidProjectState(
                "task phase must be non-empty".into(),
            ));
        }
        if self.iteration < 1 {
            return Err(SowError::InvalidProjectState(
                "task iteration must be >= 1".into(),
            ));
        }
        if self.assigned_agent.is_empty() {
            return Err(SowError::InvalidProjectState(
                "assigned_agent must be non-empty".into(),
            ));
        }
        Ok(())
    }
}

/// Status of a [`FeedbackItem`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackStatus {
    Pending,
    Addressed,
    Superseded,
}

/// A single piece of feedback attached to a task (e.g. from a review pass).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackItem {
    /// Three-digit zero-padded id, scoped to the owning task.
    pub id: String,
    pub body: String,
    pub status: FeedbackStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addressed_at: Option<DateTime<Utc>>,
}

impl FeedbackItem {
    pub fn new(id: impl Into<String>, body: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            body: body.into(),
            status: FeedbackStatus::Pending,
            created_at: now,
            addressed_at: None,
        }
    }
}

/// Statechart metadata: which state the project is currently in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatechartState {
    pub current_state: String,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn sample_project() -> ProjectState {
        ProjectState {
            name: "my-project".to_string(),
            project_type: "demo".to_string(),
            branch: "main".to_string(),
            description: None,
            created_at: now(),
            updated_at: now(),
            phases: BTreeMap::new(),
            statechart: StatechartState {
                current_state: "Idle".to_string(),
                updated_at: now(),
            },
            extra: serde_yaml::Mapping::new(),
        }
    }

    #[test]
    fn validate_rejects_bad_name() {
        let mut p = sample_project();
        p.name = "Bad_Name".to_string();
        assert!(p.validate().is_err());
    }

    #[test]
    fn validate_rejects_single_character_name() {
        let mut p = sample_project();
        p.name = "a".to_string();
        assert!(p.validate().is_err());
    }

    #[test]
    fn validate_rejects_bad_type() {
        let mut p = sample_project();
        p.project_type = "Demo Type".to_string();
        assert!(p.validate().is_err());
    }

    #[test]
    fn validate_accepts_minimal_valid_project() {
        let p = sample_project();
        assert!(p.validate().is_ok());
    }

    #[test]
    fn task_id_must_be_three_digits() {
        let mut task = TaskState::new("010", "do thing", "work", "agent-a", now());
        assert!(task.validate().is_ok());
        task.id = "10".to_string();
        assert!(task.validate().is_err());
    }

    #[test]
    fn phase_validate_rejects_artifact_with_empty_path() {
        let mut phase = PhaseState::new("in_progress", now());
        phase.outputs.push(ArtifactState::new("result", "", now()));
        assert!(phase.validate().is_err());
    }

    #[test]
    fn phase_validate_rejects_input_artifact_with_empty_type() {
        let mut phase = PhaseState::new("in_progress", now());
        phase.inputs.push(ArtifactState::new("", "review.md", now()));
        assert!(phase.validate().is_err());
    }

    #[test]
    fn artifact_approved_absent_means_false() {
        let artifact = ArtifactState::new("result", "out/result.md", now());
        assert!(!artifact.is_approved());
    }

    #[test]
    fn phase_latest_output_returns_last_match() {
        let mut phase = PhaseState::new("in_progress", now());
        phase
            .outputs
            .push(ArtifactState::new("review", "r1.md", now()));
        phase
            .outputs
            .push(ArtifactState::new("other", "o1.md", now()));
        phase
            .outputs
            .push(ArtifactState::new("review", "r2.md", now()));

        let latest = phase.latest_output("review").unwrap();
        assert_eq!(latest.path, "r2.md");
    }

    #[test]
    fn state_round_trips_through_yaml() {
        let mut p = sample_project();
        p.phases.insert(
            "work".to_string(),
            PhaseState::new("pending", now()),
        );
        let yaml = serde_yaml::to_string(&p).unwrap();
        let back: ProjectState = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(p.name, back.name);
        assert_eq!(p.phases.len(), back.phases.len());
    }

    #[test]
    fn unknown_keys_round_trip() {
        let yaml = r#"
name: my-project
type: demo
branch: main
created_at: 2026-01-01T00:00:00Z
updated_at: 2026-01-01T00:00:00Z
phases: {}
statechart:
  current_state: Idle
  updated_at: 2026-01-01T00:00:00Z
future_field: kept
"#;
        let parsed: ProjectState = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(
            parsed.extra.get("future_field").and_then(|v| v.as_str()),
            Some("kept")
        );
        let back = serde_yaml::to_string(&parsed).unwrap();
        assert!(back.contains("future_field"));
    }
}
