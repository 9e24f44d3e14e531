//! Pipewright States Library
//!
//! Built-in states for the Pipewright engine:
//!
//! - **approval**: manual gate, resumed by an APPROVE or REJECT decision
//! - **shell_script**: rendered shell script, stdout optionally published
//!   as a sweeping output
//! - **fan_out**: one child branch per item of a rendered list
//! - **noop**: immediate success
//!
//! ## Example
//!
//! ```ignore
//! use pipewright_states::create_default_registry;
//!
//! let registry = create_default_registry();
//! let machine = executor.register_workflow("app", &definition, &registry).await?;
//! ```

pub mod builtin;
pub mod error;
pub mod registry;

pub use error::StateError;
pub use registry::{create_default_registry, register_builtin};
