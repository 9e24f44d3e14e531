//! State contract and registry.
//!
//! A state is one executable step. The engine only knows its contract:
//!
//! - **execute**: run to completion or declare itself async with correlation ids
//! - **resume**: consume the responses delivered for those correlation ids
//! - **handle_abort_event**: best-effort cleanup when an ABORT targets it
//! - **handle_advice_event**: optional advice before execution starts

mod registry;
mod response;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::context::ExecutionContext;
use crate::error::EngineResult;
use crate::instance::StateExecutionInstance;

pub use registry::{StateFactory, StateRegistry};
pub use response::{
    default_resume_response, ExecutionResponse, ExecutionStatusData, ResponseData,
    SpawnedInstance,
};

/// Moment in the instance lifecycle an advisor is consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionEventType {
    /// The instance is STARTING; execute has not run yet.
    BeforeExecute,
}

/// Event passed to [`State::handle_advice_event`].
#[derive(Debug, Clone)]
pub struct ExecutionEvent<'a> {
    pub event_type: ExecutionEventType,
    pub instance: &'a StateExecutionInstance,
}

/// Advice returned by a state before execution.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionEventAdvice {
    /// Do not execute; finish the instance as SKIPPED.
    Skip { reason: String },
    /// Do not execute; use this response instead.
    Respond(ExecutionResponse),
}

/// Contract implemented by every workflow step.
#[async_trait]
pub trait State: Send + Sync {
    /// Type identifier the state was registered under.
    fn state_type(&self) -> &str;

    /// Run the state.
    ///
    /// Returning `is_async` suspends the instance until every correlation id
    /// has a result. An async execute must not repeat external side effects
    /// when invoked again without a real trigger.
    async fn execute(&self, context: &mut ExecutionContext) -> EngineResult<ExecutionResponse>;

    /// Consume the responses delivered for the correlation ids.
    async fn resume(
        &self,
        _context: &mut ExecutionContext,
        responses: HashMap<String, ResponseData>,
        is_error: bool,
    ) -> EngineResult<ExecutionResponse> {
        Ok(default_resume_response(&responses, is_error))
    }

    /// Best-effort cleanup on ABORT. Must not fail.
    async fn handle_abort_event(&self, _context: &mut ExecutionContext) {}

    /// Advice consulted before execute.
    fn handle_advice_event(&self, _event: &ExecutionEvent<'_>) -> Option<ExecutionEventAdvice> {
        None
    }

    /// Deadline for async waits started by this state.
    fn timeout(&self) -> Option<Duration> {
        None
    }
}
