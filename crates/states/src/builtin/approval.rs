//! Manual approval gate.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use uuid::Uuid;

use pipewright_engine::context::ExecutionContext;
use pipewright_engine::graph::StateDefinition;
use pipewright_engine::instance::{ExecutionStatus, FailureType};
use pipewright_engine::state::{ExecutionResponse, ResponseData, State};
use pipewright_engine::EngineResult;

/// Approvals stay open for a week unless the definition says otherwise.
pub const DEFAULT_APPROVAL_TIMEOUT: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Decision carried in an approval payload's `action` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalAction {
    Approve,
    Reject,
}

impl ApprovalAction {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "APPROVE" => Some(Self::Approve),
            "REJECT" => Some(Self::Reject),
            _ => None,
        }
    }
}

/// Suspends until someone approves or rejects.
///
/// The approval id doubles as the correlation id, so delivering
/// `{"action": "APPROVE"}` for it resumes the state.
pub struct ApprovalState {
    message: Option<String>,
    timeout: Duration,
}

impl ApprovalState {
    pub fn from_definition(definition: &StateDefinition) -> Self {
        Self {
            message: definition.property_str("message").map(str::to_string),
            timeout: definition
                .timeout_millis
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_APPROVAL_TIMEOUT),
        }
    }
}

/// Map the delivered response for `approval_id` to the state's result.
pub fn approval_response(approval_id: &str, response: Option<&ResponseData>) -> ExecutionResponse {
    let value = match response {
        Some(ResponseData::Payload { value }) => value,
        Some(ResponseData::Error { message, failure_types }) => {
            let status = if failure_types.contains(&FailureType::Expired) {
                ExecutionStatus::Expired
            } else {
                ExecutionStatus::Failed
            };
            return ExecutionResponse::with_status(status)
                .error_message(format!("Approval {} did not complete: {}", approval_id, message))
                .state_execution_data(json!({ "approvalId": approval_id }));
        }
        Some(ResponseData::Status(_)) | None => {
            return ExecutionResponse::failed(format!("No approval decision for {}", approval_id));
        }
    };

    let action = value.get("action").and_then(|a| a.as_str()).and_then(ApprovalAction::parse);
    let data = json!({
        "approvalId": approval_id,
        "action": value.get("action"),
        "approvedBy": value.get("approvedBy"),
        "comments": value.get("comments"),
    });
    match action {
        Some(ApprovalAction::Approve) => ExecutionResponse::success().state_execution_data(data),
        Some(ApprovalAction::Reject) => ExecutionResponse::with_status(ExecutionStatus::Rejected)
            .error_message("Rejected")
            .state_execution_data(data),
        None => ExecutionResponse::failed(format!("Unknown approval action for {}", approval_id))
            .state_execution_data(data),
    }
}

#[async_trait]
impl State for ApprovalState {
    fn state_type(&self) -> &str {
        "approval"
    }

    async fn execute(&self, context: &mut ExecutionContext) -> EngineResult<ExecutionResponse> {
        let approval_id = Uuid::new_v4().to_string();
        let message = match &self.message {
            Some(m) => Some(context.render_expression(m)?),
            None => None,
        };

        tracing::info!(
            execution_uuid = %context.execution_uuid(),
            state = %context.state_name(),
            approval_id = %approval_id,
            message = ?message,
            "Waiting for approval"
        );

        Ok(ExecutionResponse::async_on([approval_id.clone()])
            .timeout(self.timeout)
            .state_execution_data(json!({
                "approvalId": approval_id,
                "message": message,
            })))
    }

    async fn resume(
        &self,
        context: &mut ExecutionContext,
        responses: HashMap<String, ResponseData>,
        _is_error: bool,
    ) -> EngineResult<ExecutionResponse> {
        let approval_id = context
            .instance()
            .correlation_ids
            .first()
            .cloned()
            .unwrap_or_default();
        let response = approval_response(&approval_id, responses.get(&approval_id));
        tracing::info!(
            state = %context.state_name(),
            approval_id = %approval_id,
            status = %response.execution_status,
            "Approval decided"
        );
        Ok(response)
    }

    async fn handle_abort_event(&self, context: &mut ExecutionContext) {
        tracing::info!(
            state = %context.state_name(),
            correlation_ids = ?context.instance().correlation_ids,
            "Approval withdrawn"
        );
    }

    fn timeout(&self) -> Option<Duration> {
        Some(self.timeout)
    }
}
