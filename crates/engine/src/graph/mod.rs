//! Workflow graph model.
//!
//! - **Definition**: serializable authoring format
//! - **Machine**: compiled graph with transition selection
//! - **Repository**: shared lookup of compiled graphs

mod definition;
mod machine;
mod repository;

pub use definition::{StateDefinition, TransitionDefinition, WorkflowDefinition};
pub use machine::{StateMachine, StateNode, Transition, TransitionType};
pub use repository::StateMachineRepository;
