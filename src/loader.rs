//! Reads the on-disk state file and constructs a bound [`Project`].

use std::fs;
use std::path::Path;

use crate::error::{Result, SowError};
use crate::model::ProjectState;
use crate::project::{Project, STATE_RELATIVE_PATH};
use crate::registry;

/// Load the project rooted at `working_dir`.
///
/// 1. Read `.sow/project/state.yaml`; absent is [`SowError::NoProject`].
/// 2. Deserialize into [`ProjectState`]; malformed YAML is
///    [`SowError::Corrupted`].
/// 3. Look up `state.type` in the registry; unregistered is
///    [`SowError::UnknownProjectType`].
/// 4. Build the machine at `state.statechart.current_state` and return the
///    `Project`.
pub fn load(working_dir: &Path) -> Result<Project> {
    let state_path = working_dir.join(STATE_RELATIVE_PATH);

    let raw = match fs::read_to_string(&state_path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(SowError::NoProject),
        Err(e) => return Err(SowError::LoadFailed(e.into())),
    };

    let state: ProjectState =
        serde_yaml::from_str(&raw).map_err(|e| SowError::Corrupted(e.into()))?;

    let config = registry::get(&state.project_type)
        .map_err(|_| SowError::UnknownProjectType(state.project_type.clone()))?;

    tracing::info!(project_type = %state.project_type, state = %state.statechart.current_state, "loaded project");

    Ok(Project::from_state(state, config, state_path))
}
