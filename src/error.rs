//! Error taxonomy for the project lifecycle engine.
//!
//! Every fallible core operation returns [`SowError`]. Errors are never
//! swallowed internally; the only recovery the engine performs itself is
//! the transition rollback documented on [`crate::machine::Machine::fire`].

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, SowError>;

/// Errors raised by the engine, grouped the way the design doc groups them:
/// not-found, configuration, guard, transition, validation, persistence,
/// and action failures.
#[derive(Error, Debug)]
pub enum SowError {
    // ---- NotFound -------------------------------------------------------
    #[error("no project found in this working directory")]
    NoProject,

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("phase not found: {0}")]
    PhaseNotFound(String),

    #[error("artifact index out of range: {index} (phase {phase}, {direction})")]
    ArtifactIndexOutOfRange {
        phase: String,
        direction: &'static str,
        index: usize,
    },

    #[error("feedback item not found: {0}")]
    FeedbackNotFound(String),

    // ---- Configuration ----------------------------------------------------
    #[error("unknown project type: {0}")]
    UnknownProjectType(String),

    #[error("project type not registered: {0}")]
    TypeNotRegistered(String),

    #[error("project type already registered: {0}")]
    DuplicateRegistration(String),

    // ---- Guard ------------------------------------------------------------
    #[error("event '{event}' blocked in state '{from}': {description}")]
    GuardBlocked {
        from: String,
        event: String,
        description: String,
    },

    // ---- Transition ---------------------------------------------------
    #[error("event '{event}' is not configured from state '{state}'")]
    EventNotConfigured { state: String, event: String },

    #[error("no advance determiner configured for state '{0}'")]
    NoAdvanceConfigured(String),

    // ---- Validation -----------------------------------------------------
    #[error("metadata validation failed for phase '{phase}': {reason}")]
    MetadataValidationFailed { phase: String, reason: String },

    #[error("artifact type '{artifact_type}' is not allowed in phase '{phase}' {direction}")]
    ArtifactTypeNotAllowed {
        phase: String,
        direction: &'static str,
        artifact_type: String,
    },

    #[error("invalid task id: {0}")]
    InvalidTaskID(String),

    #[error("invalid project state: {0}")]
    InvalidProjectState(String),

    // ---- Persistence ------------------------------------------------------
    #[error("failed to save project state: {0}")]
    SaveFailed(#[source] anyhow::Error),

    #[error("failed to load project state: {0}")]
    LoadFailed(#[source] anyhow::Error),

    #[error("project state file is corrupted: {0}")]
    Corrupted(#[source] anyhow::Error),

    // ---- Action -------------------------------------------------------
    #[error("{phase} action failed entering/exiting state '{state}': {source}")]
    ActionFailed {
        state: String,
        phase: ActionPhase,
        #[source]
        source: anyhow::Error,
    },
}

/// Which half of a transition an [`SowError::ActionFailed`] happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionPhase {
    OnExit,
    OnEntry,
}

impl std::fmt::Display for ActionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OnExit => write!(f, "onExit"),
            Self::OnEntry => write!(f, "onEntry"),
        }
    }
}
