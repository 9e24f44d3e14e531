//! Execution context: what a state sees while it runs.
//!
//! - **Element**: typed context elements and the per-run stack
//! - **Template**: `${...}` rendering and value conversion
//! - **Variables**: lazily bound service variables and secrets
//! - **Sweeping**: scoped side-channel outputs between states
//! - **Execution**: the [`ExecutionContext`] facade

mod element;
mod execution;
mod sweeping;
mod template;
mod variables;

pub use element::{
    ContextElement, ContextElementStack, ContextElementType, EnvironmentElement,
    InfraMappingElement, InstanceElement, ParamElement, PhaseElement, ServiceElement,
    VariableOverride, WorkflowStandardParams, PHASE_PARAM,
};
pub use execution::{normalize_state_name, ContextServices, ExecutionContext, StateExecutionContext};
pub use sweeping::{
    InMemorySweepingOutputService, SweepingOutput, SweepingOutputBuilder, SweepingOutputInquiry,
    SweepingOutputScope, SweepingOutputService,
};
pub use template::{contains_expression, json_to_value, value_to_json, ExpressionRenderer};
pub use variables::{FieldMode, VariableGroup, VariableResolver, VariableScope};
