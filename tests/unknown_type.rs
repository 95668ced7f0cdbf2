//! Scenario: a state file naming an unregistered type fails to load, and no
//! partial `Project` is returned.

use std::fs;

use sow::error::SowError;
use tempfile::tempdir;

#[test]
fn load_rejects_unregistered_type() {
    let dir = tempdir().unwrap();
    let state_dir = dir.path().join(".sow/project");
    fs::create_dir_all(&state_dir).unwrap();
    fs::write(
        state_dir.join("state.yaml"),
        r#"
name: some-project
type: archaeology
branch: main
created_at: 2026-01-01T00:00:00Z
updated_at: 2026-01-01T00:00:00Z
phases: {}
statechart:
  current_state: Idle
  updated_at: 2026-01-01T00:00:00Z
"#,
    )
    .unwrap();

    let err = sow::loader::load(dir.path()).unwrap_err();
    match err {
        SowError::UnknownProjectType(name) => assert_eq!(name, "archaeology"),
        other => panic!("expected UnknownProjectType, got {other:?}"),
    }
}

#[test]
fn load_missing_state_file_is_no_project() {
    let dir = tempdir().unwrap();
    let err = sow::loader::load(dir.path()).unwrap_err();
    assert!(matches!(err, SowError::NoProject));
}
