//! State that does nothing.

use async_trait::async_trait;

use pipewright_engine::context::ExecutionContext;
use pipewright_engine::state::{ExecutionResponse, State};
use pipewright_engine::EngineResult;

/// Succeeds immediately. Useful as a join point or placeholder.
#[derive(Debug, Default)]
pub struct NoopState;

#[async_trait]
impl State for NoopState {
    fn state_type(&self) -> &str {
        "noop"
    }

    async fn execute(&self, context: &mut ExecutionContext) -> EngineResult<ExecutionResponse> {
        tracing::debug!(state = %context.state_name(), "Noop");
        Ok(ExecutionResponse::success())
    }
}
