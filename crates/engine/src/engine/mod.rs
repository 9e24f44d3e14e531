//! Execution engine.
//!
//! - **Executor**: drives instances through execute, suspend, resume and transitions
//! - **Interrupt**: validates and applies operator interrupts
//! - **Callback**: notifier callback carrying the resume target
//! - **Dispatcher**: bounded task pool the executor runs on

mod callback;
mod dispatcher;
mod executor;
mod interrupt;

pub use callback::ResumeCallback;
pub use dispatcher::Dispatcher;
pub use executor::{Collaborators, StateMachineExecutor};
pub use interrupt::{ExecutionInterruptManager, InterruptOutcome, InterruptRejection, RejectionReason};
