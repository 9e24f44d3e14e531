//! Execution records.
//!
//! - **Status**: the per-node lifecycle and worst-status-wins ranking
//! - **Record**: [`StateExecutionInstance`] and its clone transforms
//! - **Interrupt**: operator requests and their recorded effects

mod interrupt;
mod record;
mod status;

pub use interrupt::{ExecutionInterrupt, ExecutionInterruptEffect, ExecutionInterruptType};
pub use record::StateExecutionInstance;
pub use status::{ExecutionStatus, FailureType};
