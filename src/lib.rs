//! sow — a project lifecycle engine
//!
//! A declarative state machine that coordinates long-running, multi-phase
//! software-engineering projects executed by a mix of human operators and
//! autonomous agent processes. Each project is a finite-state machine whose
//! transitions are gated by guards over persistent project state; entering
//! a state surfaces a context-specific prompt; exits and entries may mutate
//! state through declared actions.
//!
//! The crate has no async runtime dependency and is single-threaded by
//! design: one process loads a project, performs one logical mutation, and
//! exits. See [`project`] for the concurrency contract.

pub mod demo_type;
pub mod error;
pub mod loader;
pub mod machine;
pub mod model;
pub mod mutate;
pub mod project;
pub mod project_type;
pub mod registry;

pub use error::{Result, SowError};
pub use project::Project;
pub use project_type::{ProjectTypeBuilder, ProjectTypeConfig};
