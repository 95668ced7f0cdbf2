//! A fixture project type exercising the full SDK surface: a phase with
//! tasks, a guarded transition, and a rework-loop branch.
//!
//! This is not a real project type's business content — it exists so
//! integration tests and the CLI's `demo-init` subcommand have something
//! concrete to drive without inventing one. A host embedding this engine
//! registers its own types the same way.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::Result;
use crate::model::ProjectState;
use crate::project_type::{
    AllTasksCompleteCheck, Discriminator, Guard, PhaseOpts, ProjectTypeBuilder, ProjectTypeConfig,
    TransOpts, When,
};

pub const TYPE_NAME: &str = "demo";

pub const STATE_IDLE: &str = "Idle";
pub const STATE_WORKING: &str = "Working";
pub const STATE_REVIEW_ACTIVE: &str = "ReviewActive";
pub const STATE_DONE: &str = "Done";

pub const PHASE_IMPLEMENTATION: &str = "implementation";
pub const PHASE_REVIEW: &str = "review";

/// Build and return the fixture's config. Callers still call
/// `registry::register(demo_type::TYPE_NAME, config)` themselves.
pub fn config() -> Result<ProjectTypeConfig> {
    let plan_approved: Guard = Arc::new(|state: &ProjectState| {
        state
            .phases
            .get(PHASE_IMPLEMENTATION)
            .and_then(|p| p.latest_output("plan"))
            .map(|a| a.is_approved())
            .unwrap_or(false)
    });

    let assessment: Discriminator = Arc::new(|state: &ProjectState| {
        state
            .phases
            .get(PHASE_REVIEW)
            .and_then(|p| p.metadata.as_ref())
            .and_then(|m| m.get("assessment"))
            .and_then(|v| v.as_str())
            .unwrap_or("fail")
            .to_string()
    });

    let rework_on_entry = Arc::new(|state: &mut ProjectState| -> anyhow::Result<()> {
        let review = state
            .phases
            .get(PHASE_REVIEW)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("missing '{PHASE_REVIEW}' phase"))?;
        let implementation = state
            .phases
            .get_mut(PHASE_IMPLEMENTATION)
            .ok_or_else(|| anyhow::anyhow!("missing '{PHASE_IMPLEMENTATION}' phase"))?;
        crate::mutate::add_phase_input_from_output(&review, implementation, "review", |a| {
            a.is_approved()
        });
        crate::mutate::increment_phase_iteration(implementation)?;
        Ok(())
    });

    let all_tasks_complete: AllTasksCompleteCheck = Arc::new(|state: &ProjectState| {
        state
            .phases
            .get(PHASE_IMPLEMENTATION)
            .map(|p| !p.tasks.is_empty() && p.tasks.iter().all(|t| t.status.is_terminal()))
            .unwrap_or(false)
    });

    let initializer = Arc::new(
        |state: &mut ProjectState, _seed: &HashMap<String, String>| -> anyhow::Result<()> {
            let now = chrono::Utc::now();
            state.phases.insert(
                PHASE_IMPLEMENTATION.to_string(),
                crate::model::PhaseState::new("pending", now),
            );
            state.phases.insert(
                PHASE_REVIEW.to_string(),
                crate::model::PhaseState::new("pending", now),
            );
            Ok(())
        },
    );

    ProjectTypeBuilder::new(TYPE_NAME)
        .set_initial_state(STATE_IDLE)
        .with_phase(
            PHASE_IMPLEMENTATION,
            PhaseOpts::new()
                .with_start_state(STATE_WORKING)
                .with_outputs(["plan"])
                .with_inputs(["review"])
                .with_tasks(),
        )
        .with_phase(
            PHASE_REVIEW,
            PhaseOpts::new()
                .with_start_state(STATE_REVIEW_ACTIVE)
                .with_end_state(STATE_DONE)
                .with_outputs(["review"]),
        )
        .add_transition(
            STATE_IDLE,
            STATE_WORKING,
            "Start",
            TransOpts::new().with_description("begin implementation"),
        )?
        .add_transition(
            STATE_WORKING,
            STATE_REVIEW_ACTIVE,
            "Submit",
            TransOpts::new()
                .with_guard("the 'plan' output must be approved", plan_approved)
                .with_description("submit the implementation plan for review"),
        )?
        .add_transition(
            STATE_WORKING,
            STATE_REVIEW_ACTIVE,
            crate::project_type::EVENT_ALL_TASKS_COMPLETE,
            TransOpts::new().with_description("auto-advance once every task is terminal"),
        )?
        .add_branch(
            STATE_REVIEW_ACTIVE,
            assessment,
            vec![
                When::new("pass", "Pass", STATE_DONE)
                    .with_opts(TransOpts::new().with_description("review passed")),
                When::new("fail", "Fail", STATE_WORKING).with_opts(
                    TransOpts::new()
                        .with_on_entry(rework_on_entry)
                        .with_failed_phase(PHASE_REVIEW)
                        .with_description("review failed; back to implementation"),
                ),
            ],
        )?
        .with_prompt(
            STATE_WORKING,
            Arc::new(|_state| {
                "Implement the plan, then produce and approve a 'plan' output before submitting."
                    .to_string()
            }),
        )
        .with_prompt(
            STATE_REVIEW_ACTIVE,
            Arc::new(|_state| "Review the submission and record assessment=pass|fail.".to_string()),
        )
        .with_prompt(STATE_DONE, Arc::new(|_state| "Project complete.".to_string()))
        .with_orchestrator_prompt(Arc::new(|_state| {
            "Fixture project type: Idle -> Working -> ReviewActive -> Done, with a rework loop \
             back to Working on a failed review."
                .to_string()
        }))
        .with_initializer(initializer)
        .with_all_tasks_complete_check(all_tasks_complete)
        .build()
}
