//! Declarative project-type configuration and its builder.
//!
//! A [`ProjectTypeConfig`] is the immutable description of one project
//! type: phases, states, transitions, guards, entry/exit actions, advance
//! determiners and prompt generators. It is assembled once via
//! [`ProjectTypeBuilder`] and shared (read-only) across every project of
//! that type through the [`crate::registry`].

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use crate::error::{Result, SowError};
use crate::machine::{BoundTransition, Machine};
use crate::model::ProjectState;

/// A pure predicate over project state. Must not mutate and must return the
/// same answer for the same state.
pub type Guard = Arc<dyn Fn(&ProjectState) -> bool + Send + Sync>;

/// A function that mutates project state, registered as an onEntry/onExit
/// action or a project initializer.
pub type ActionFn = Arc<dyn Fn(&mut ProjectState) -> anyhow::Result<()> + Send + Sync>;

/// Chooses which event to fire when `Advance` is invoked from a given
/// state. Pure: inspects state, returns an event name, never mutates.
pub type Determiner = Arc<dyn Fn(&ProjectState) -> anyhow::Result<String> + Send + Sync>;

/// Evaluated at advance time by a branch to select among its `When` arms.
pub type Discriminator = Arc<dyn Fn(&ProjectState) -> String + Send + Sync>;

/// Renders the current state's guidance to the operator. Must not mutate;
/// errors are embedded in the returned string rather than raised.
pub type PromptGenerator = Arc<dyn Fn(&ProjectState) -> String + Send + Sync>;

/// Sets up phase structures on project creation. `initial_inputs` is the
/// caller-supplied map of seed values (e.g. from CLI flags).
pub type Initializer =
    Arc<dyn Fn(&mut ProjectState, &HashMap<String, String>) -> anyhow::Result<()> + Send + Sync>;

/// Validates a phase's free-form metadata at save time.
pub type MetadataValidator = Arc<dyn Fn(&str, &serde_json::Value) -> anyhow::Result<()> + Send + Sync>;

/// Project-type-defined check invoked by `SetStatus(completed|abandoned)`
/// to decide whether to auto-fire the all-tasks-complete event.
pub type AllTasksCompleteCheck = Arc<dyn Fn(&ProjectState) -> bool + Send + Sync>;

/// The event name auto-fired when [`AllTasksCompleteCheck`] returns true.
pub const EVENT_ALL_TASKS_COMPLETE: &str = "AllTasksComplete";

/// A declared phase: which states start/end it, which artifact types are
/// admitted, whether it holds tasks, and its metadata validator.
#[derive(Clone)]
pub struct PhaseDef {
    pub start_state: Option<String>,
    pub end_state: Option<String>,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub admits_tasks: bool,
    pub metadata_schema: Option<MetadataValidator>,
}

impl Default for PhaseDef {
    fn default() -> Self {
        Self {
            start_state: None,
            end_state: None,
            inputs: Vec::new(),
            outputs: Vec::new(),
            admits_tasks: false,
            metadata_schema: None,
        }
    }
}

/// Options passed to [`ProjectTypeBuilder::with_phase`].
pub struct PhaseOpts {
    def: PhaseDef,
}

impl PhaseOpts {
    pub fn new() -> Self {
        Self {
            def: PhaseDef::default(),
        }
    }

    pub fn with_start_state(mut self, state: impl Into<String>) -> Self {
        self.def.start_state = Some(state.into());
        self
    }

    pub fn with_end_state(mut self, state: impl Into<String>) -> Self {
        self.def.end_state = Some(state.into());
        self
    }

    pub fn with_inputs(mut self, types: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.def.inputs = types.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_outputs(mut self, types: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.def.outputs = types.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_tasks(mut self) -> Self {
        self.def.admits_tasks = true;
        self
    }

    pub fn with_metadata_schema(mut self, validator: MetadataValidator) -> Self {
        self.def.metadata_schema = Some(validator);
        self
    }
}

impl Default for PhaseOpts {
    fn default() -> Self {
        Self::new()
    }
}

/// A declared transition, before it is bound to a live project.
#[derive(Clone)]
pub(crate) struct TransitionDef {
    pub to: String,
    pub guard: Option<Guard>,
    pub guard_description: Option<String>,
    pub on_exit: Option<ActionFn>,
    pub on_entry: Option<ActionFn>,
    pub description: Option<String>,
    pub failed_phase: Option<String>,
}

/// Options passed to [`ProjectTypeBuilder::add_transition`].
#[derive(Default)]
pub struct TransOpts {
    guard: Option<(String, Guard)>,
    on_entry: Option<ActionFn>,
    on_exit: Option<ActionFn>,
    description: Option<String>,
    failed_phase: Option<String>,
}

impl TransOpts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_guard(mut self, description: impl Into<String>, guard: Guard) -> Self {
        self.guard = Some((description.into(), guard));
        self
    }

    pub fn with_on_entry(mut self, action: ActionFn) -> Self {
        self.on_entry = Some(action);
        self
    }

    pub fn with_on_exit(mut self, action: ActionFn) -> Self {
        self.on_exit = Some(action);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_failed_phase(mut self, phase: impl Into<String>) -> Self {
        self.failed_phase = Some(phase.into());
        self
    }
}

/// One arm of a branch: a discriminator value maps to an event and target.
pub struct When {
    value: String,
    event: String,
    to: String,
    opts: TransOpts,
}

impl When {
    pub fn new(value: impl Into<String>, event: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            event: event.into(),
            to: to.into(),
            opts: TransOpts::new(),
        }
    }

    pub fn with_opts(mut self, opts: TransOpts) -> Self {
        self.opts = opts;
        self
    }
}

/// The immutable, shared description of one project type.
pub struct ProjectTypeConfig {
    pub(crate) type_name: String,
    pub(crate) phases: HashMap<String, PhaseDef>,
    pub(crate) initial_state: String,
    pub(crate) transitions: HashMap<(String, String), TransitionDef>,
    pub(crate) determiners: HashMap<String, Determiner>,
    pub(crate) prompts: HashMap<String, PromptGenerator>,
    pub(crate) orchestrator_prompt: Option<PromptGenerator>,
    pub(crate) initializer: Option<Initializer>,
    pub(crate) all_tasks_complete: Option<AllTasksCompleteCheck>,
}

impl ProjectTypeConfig {
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn initial_state(&self) -> &str {
        &self.initial_state
    }

    pub fn phase(&self, name: &str) -> Option<&PhaseDef> {
        self.phases.get(name)
    }

    pub fn phases(&self) -> impl Iterator<Item = (&String, &PhaseDef)> {
        self.phases.iter()
    }

    pub fn determiner(&self, state: &str) -> Option<&Determiner> {
        self.determiners.get(state)
    }

    pub fn prompt(&self, state: &str) -> Option<&PromptGenerator> {
        self.prompts.get(state)
    }

    pub fn orchestrator_prompt(&self) -> Option<&PromptGenerator> {
        self.orchestrator_prompt.as_ref()
    }

    pub fn initializer(&self) -> Option<&Initializer> {
        self.initializer.as_ref()
    }

    pub fn all_tasks_complete_check(&self) -> Option<&AllTasksCompleteCheck> {
        self.all_tasks_complete.as_ref()
    }

    /// Static target-state lookup, independent of any live project — used
    /// by `--dry-run` and `--list` to report what an event *would* do.
    pub fn target_state(&self, from: &str, event: &str) -> Option<&str> {
        self.transitions
            .get(&(from.to_string(), event.to_string()))
            .map(|t| t.to.as_str())
    }

    pub fn guard_description(&self, from: &str, event: &str) -> Option<&str> {
        self.transitions
            .get(&(from.to_string(), event.to_string()))
            .and_then(|t| t.guard_description.as_deref())
    }

    pub fn transition_description(&self, from: &str, event: &str) -> Option<&str> {
        self.transitions
            .get(&(from.to_string(), event.to_string()))
            .and_then(|t| t.description.as_deref())
    }

    pub(crate) fn transition(&self, from: &str, event: &str) -> Option<&TransitionDef> {
        self.transitions.get(&(from.to_string(), event.to_string()))
    }

    /// All events configured to fire from `state`.
    pub fn events_from(&self, state: &str) -> impl Iterator<Item = &str> {
        self.transitions
            .keys()
            .filter(move |(from, _)| from == state)
            .map(|(_, event)| event.as_str())
    }

    /// Bind this config's templates to a live project's shared state,
    /// producing a [`Machine`] whose closures capture `state` and need no
    /// further arguments. This is the one place guard/action templates are
    /// turned into the zero-context callables `Machine` operates on.
    pub fn build_machine(&self, state: Rc<RefCell<ProjectState>>, initial_state: &str) -> Machine {
        let mut bound = HashMap::new();
        for ((from, event), def) in &self.transitions {
            let guard: Option<crate::machine::BoundGuard> = def.guard.as_ref().map(|g| {
                let g = g.clone();
                let state = state.clone();
                Box::new(move || g(&state.borrow())) as crate::machine::BoundGuard
            });
            let on_exit: Option<crate::machine::BoundAction> = def.on_exit.as_ref().map(|a| {
                let a = a.clone();
                let state = state.clone();
                Box::new(move || a(&mut state.borrow_mut())) as crate::machine::BoundAction
            });
            let on_entry: Option<crate::machine::BoundAction> = def.on_entry.as_ref().map(|a| {
                let a = a.clone();
                let state = state.clone();
                Box::new(move || a(&mut state.borrow_mut())) as crate::machine::BoundAction
            });
            bound.insert(
                (from.clone(), event.clone()),
                BoundTransition {
                    to: def.to.clone(),
                    guard,
                    guard_description: def.guard_description.clone(),
                    on_exit,
                    on_entry,
                },
            );
        }
        Machine::new(initial_state, bound)
    }
}

/// Accumulates phases, transitions, determiners and prompts, then produces
/// an immutable [`ProjectTypeConfig`] via [`ProjectTypeBuilder::build`].
pub struct ProjectTypeBuilder {
    type_name: String,
    phases: HashMap<String, PhaseDef>,
    initial_state: Option<String>,
    transition_order: Vec<(String, String)>,
    transitions: HashMap<(String, String), TransitionDef>,
    determiners: HashMap<String, Determiner>,
    prompts: HashMap<String, PromptGenerator>,
    orchestrator_prompt: Option<PromptGenerator>,
    initializer: Option<Initializer>,
    all_tasks_complete: Option<AllTasksCompleteCheck>,
}

impl ProjectTypeBuilder {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            phases: HashMap::new(),
            initial_state: None,
            transition_order: Vec::new(),
            transitions: HashMap::new(),
            determiners: HashMap::new(),
            prompts: HashMap::new(),
            orchestrator_prompt: None,
            initializer: None,
            all_tasks_complete: None,
        }
    }

    pub fn with_phase(mut self, name: impl Into<String>, opts: PhaseOpts) -> Self {
        self.phases.insert(name.into(), opts.def);
        self
    }

    pub fn set_initial_state(mut self, state: impl Into<String>) -> Self {
        self.initial_state = Some(state.into());
        self
    }

    pub fn add_transition(
        mut self,
        from: impl Into<String>,
        to: impl Into<String>,
        event: impl Into<String>,
        opts: TransOpts,
    ) -> Result<Self> {
        let from = from.into();
        let event = event.into();
        let key = (from.clone(), event.clone());
        if self.transitions.contains_key(&key) {
            return Err(SowError::DuplicateRegistration(format!(
                "transition ({from}, {event}) already declared"
            )));
        }
        self.transition_order.push(key.clone());
        self.transitions.insert(
            key,
            TransitionDef {
                to: to.into(),
                guard: opts.guard.as_ref().map(|(_, g)| g.clone()),
                guard_description: opts.guard.map(|(d, _)| d),
                on_exit: opts.on_exit,
                on_entry: opts.on_entry,
                description: opts.description,
                failed_phase: opts.failed_phase,
            },
        );
        Ok(self)
    }

    /// Sugar for multiple transitions sharing `from`: each `When` becomes a
    /// transition, and an `OnAdvance(from, ...)` determiner is generated
    /// that evaluates `discriminator` and fires the matching arm's event.
    pub fn add_branch(
        mut self,
        from: impl Into<String>,
        discriminator: Discriminator,
        whens: Vec<When>,
    ) -> Result<Self> {
        let from = from.into();
        let mut value_to_event = HashMap::new();
        for when in whens {
            value_to_event.insert(when.value.clone(), when.event.clone());
            self = self.add_transition(from.clone(), when.to, when.event, when.opts)?;
        }
        let from_for_determiner = from.clone();
        let determiner: Determiner = Arc::new(move |state| {
            let value = discriminator(state);
            value_to_event.get(&value).cloned().ok_or_else(|| {
                anyhow::anyhow!(
                    "branch from '{}' has no arm for discriminator value '{}'",
                    from_for_determiner,
                    value
                )
            })
        });
        self.determiners.insert(from, determiner);
        Ok(self)
    }

    pub fn on_advance(mut self, state: impl Into<String>, determiner: Determiner) -> Self {
        self.determiners.insert(state.into(), determiner);
        self
    }

    pub fn with_prompt(mut self, state: impl Into<String>, generator: PromptGenerator) -> Self {
        self.prompts.insert(state.into(), generator);
        self
    }

    pub fn with_orchestrator_prompt(mut self, generator: PromptGenerator) -> Self {
        self.orchestrator_prompt = Some(generator);
        self
    }

    pub fn with_initializer(mut self, initializer: Initializer) -> Self {
        self.initializer = Some(initializer);
        self
    }

    pub fn with_all_tasks_complete_check(mut self, check: AllTasksCompleteCheck) -> Self {
        self.all_tasks_complete = Some(check);
        self
    }

    /// Finalize the configuration.
    ///
    /// Hard errors: no initial state declared, or a transition targets a
    /// phase's start/end state that's claimed by more than one phase.
    /// Soft (warning-level, logged via `tracing::warn!`) checks: a
    /// transition target with no registered prompt.
    pub fn build(self) -> Result<ProjectTypeConfig> {
        let initial_state = self.initial_state.ok_or_else(|| {
            SowError::InvalidProjectState(format!(
                "project type '{}' has no initial state",
                self.type_name
            ))
        })?;

        let mut start_owner: HashMap<&str, &str> = HashMap::new();
        let mut end_owner: HashMap<&str, &str> = HashMap::new();
        for (phase_name, def) in &self.phases {
            if let Some(state) = &def.start_state {
                if let Some(existing) = start_owner.insert(state.as_str(), phase_name.as_str()) {
                    return Err(SowError::InvalidProjectState(format!(
                        "start state '{state}' claimed by both phase '{existing}' and '{phase_name}'"
                    )));
                }
            }
            if let Some(state) = &def.end_state {
                if let Some(existing) = end_owner.insert(state.as_str(), phase_name.as_str()) {
                    return Err(SowError::InvalidProjectState(format!(
                        "end state '{state}' claimed by both phase '{existing}' and '{phase_name}'"
                    )));
                }
            }
        }

        for (from, event) in &self.transition_order {
            let to = &self.transitions[&(from.clone(), event.clone())].to;
            if !self.prompts.contains_key(to) && to != &initial_state {
                tracing::warn!(
                    target_state = %to,
                    via_event = %event,
                    from_state = %from,
                    "transition target has no registered prompt generator"
                );
            }
        }

        Ok(ProjectTypeConfig {
            type_name: self.type_name,
            phases: self.phases,
            initial_state,
            transitions: self.transitions,
            determiners: self.determiners,
            prompts: self.prompts,
            orchestrator_prompt: self.orchestrator_prompt,
            initializer: self.initializer,
            all_tasks_complete: self.all_tasks_complete,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PhaseState, StatechartState};
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn sample_state(current: &str) -> ProjectState {
        let now = Utc::now();
        let mut phases = BTreeMap::new();
        phases.insert("work".to_string(), PhaseState::new("pending", now));
        ProjectState {
            name: "demo-project".to_string(),
            project_type: "demo".to_string(),
            branch: "main".to_string(),
            description: None,
            created_at: now,
            updated_at: now,
            phases,
            statechart: StatechartState {
                current_state: current.to_string(),
                updated_at: now,
            },
            extra: serde_yaml::Mapping::new(),
        }
    }

    #[test]
    fn build_fails_without_initial_state() {
        let err = ProjectTypeBuilder::new("demo").build().unwrap_err();
        assert!(matches!(err, SowError::InvalidProjectState(_)));
    }

    #[test]
    fn build_fails_on_conflicting_phase_start_state() {
        let builder = ProjectTypeBuilder::new("demo")
            .set_initial_state("Idle")
            .with_phase("work", PhaseOpts::new().with_start_state("Working"))
            .with_phase("other", PhaseOpts::new().with_start_state("Working"));
        assert!(builder.build().is_err());
    }

    #[test]
    fn duplicate_transition_rejected() {
        let builder = ProjectTypeBuilder::new("demo")
            .set_initial_state("Idle")
            .add_transition("Idle", "Working", "Start", TransOpts::new())
            .unwrap()
            .add_transition("Idle", "Done", "Start", TransOpts::new());
        assert!(builder.is_err());
    }

    #[test]
    fn add_branch_compiles_to_transitions_and_determiner() {
        let discriminator: Discriminator = Arc::new(|_state| "pass".to_string());
        let config = ProjectTypeBuilder::new("demo")
            .set_initial_state("Idle")
            .add_branch(
                "Review",
                discriminator,
                vec![
                    When::new("pass", "Pass", "Done"),
                    When::new("fail", "Fail", "Rework"),
                ],
            )
            .unwrap()
            .build()
            .unwrap();

        assert_eq!(config.target_state("Review", "Pass"), Some("Done"));
        assert_eq!(config.target_state("Review", "Fail"), Some("Rework"));

        let determiner = config.determiner("Review").unwrap();
        let state = sample_state("Review");
        assert_eq!(determiner(&state).unwrap(), "Pass");
    }

    #[test]
    fn build_machine_binds_guard_to_live_state() {
        let guard: Guard = Arc::new(|state| state.branch == "main");
        let config = ProjectTypeBuilder::new("demo")
            .set_initial_state("Idle")
            .add_transition(
                "Idle",
                "Working",
                "Start",
                TransOpts::new().with_guard("branch must be main", guard),
            )
            .unwrap()
            .build()
            .unwrap();

        let state = Rc::new(RefCell::new(sample_state("Idle")));
        let mut machine = config.build_machine(state.clone(), "Idle");
        assert!(machine.can_fire("Start").unwrap());
        machine.fire("Start").unwrap();
        assert_eq!(machine.state(), "Working");
    }
}
