//! Generic, library-neutral state machine primitive.
//!
//! `Machine` knows nothing about projects, phases or tasks: it holds a
//! current state name and a table of `(from, event) -> bound transition`
//! closures. [`crate::project_type::ProjectTypeConfig::build_machine`] is
//! the layer above that binds project-carrying templates into the
//! zero-argument closures this module expects.

use std::collections::HashMap;

use crate::error::{ActionPhase, Result, SowError};

/// A guard closure, already bound to a specific project. Must be pure:
/// calling it twice in a row without an intervening `fire` must return the
/// same answer and must not mutate anything.
pub type BoundGuard = Box<dyn Fn() -> bool>;

/// An entry/exit action closure, already bound to a specific project.
pub type BoundAction = Box<dyn Fn() -> anyhow::Result<()>>;

pub(crate) struct BoundTransition {
    pub to: String,
    pub guard: Option<BoundGuard>,
    pub guard_description: Option<String>,
    pub on_exit: Option<BoundAction>,
    pub on_entry: Option<BoundAction>,
}

/// The runtime state machine for a single project instance.
pub struct Machine {
    current: String,
    transitions: HashMap<(String, String), BoundTransition>,
}

impl Machine {
    pub(crate) fn new(
        initial_state: impl Into<String>,
        transitions: HashMap<(String, String), BoundTransition>,
    ) -> Self {
        Self {
            current: initial_state.into(),
            transitions,
        }
    }

    /// The name of the current state.
    pub fn state(&self) -> &str {
        &self.current
    }

    /// Evaluate configuration presence and guard without executing any
    /// action. Side-effect free: callers (dry-run, `PermittedTriggers`)
    /// depend on this never mutating the project.
    pub fn can_fire(&self, event: &str) -> Result<bool> {
        let entry = self.transition_for(event)?;
        Ok(entry.guard.as_ref().map(|g| g()).unwrap_or(true))
    }

    /// Enumerate events configured from the current state whose guards
    /// currently evaluate true.
    pub fn permitted_triggers(&self) -> Vec<String> {
        self.transitions
            .keys()
            .filter(|(from, _)| from == &self.current)
            .filter(|key| {
                self.transitions
                    .get(*key)
                    .map(|t| t.guard.as_ref().map(|g| g()).unwrap_or(true))
                    .unwrap_or(false)
            })
            .map(|(_, event)| event.clone())
            .collect()
    }

    /// The target state an event would transition to from the current
    /// state, regardless of whether the guard currently passes.
    pub fn target_of(&self, event: &str) -> Option<&str> {
        self.transitions
            .get(&(self.current.clone(), event.to_string()))
            .map(|t| t.to.as_str())
    }

    /// Atomic transition: lookup, guard, exit, move, entry. On any action
    /// error the machine's state is rolled back to the pre-fire value and
    /// the error is propagated; the state is never left half-transitioned.
    pub fn fire(&mut self, event: &str) -> Result<()> {
        let from = self.current.clone();

        // Guard check first: a blocked guard must not execute onExit.
        {
            let entry = self.transition_for(event)?;
            if let Some(guard) = &entry.guard {
                if !guard() {
                    let description = entry
                        .guard_description
                        .clone()
                        .unwrap_or_else(|| "guard evaluated false".to_string());
                    return Err(SowError::GuardBlocked {
                        from: from.clone(),
                        event: event.to_string(),
                        description,
                    });
                }
            }
        }

        let key = (from.clone(), event.to_string());
        let to = self.transitions[&key].to.clone();

        if let Some(on_exit) = self.transitions[&key].on_exit.as_ref() {
            on_exit().map_err(|source| SowError::ActionFailed {
                state: from.clone(),
                phase: ActionPhase::OnExit,
                source,
            })?;
        }

        self.current = to.clone();

        if let Some(on_entry) = self.transitions[&key].on_entry.as_ref() {
            if let Err(source) = on_entry() {
                // Roll back: the onEntry action never took effect.
                self.current = from;
                return Err(SowError::ActionFailed {
                    state: to,
                    phase: ActionPhase::OnEntry,
                    source,
                });
            }
        }

        Ok(())
    }

    fn transition_for(&self, event: &str) -> Result<&BoundTransition> {
        self.transitions
            .get(&(self.current.clone(), event.to_string()))
            .ok_or_else(|| SowError::EventNotConfigured {
                state: self.current.clone(),
                event: event.to_string(),
            })
    }
}
