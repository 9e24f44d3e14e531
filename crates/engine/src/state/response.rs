//! Values exchanged with state implementations.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::context::ContextElement;
use crate::error::{EngineError, EngineResult};
use crate::instance::{ExecutionStatus, FailureType};

/// A dynamically generated child instance requested by a state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnedInstance {
    /// Graph node the child starts at.
    pub state_name: String,
    /// Correlation id completed when the child's branch ends.
    pub notify_id: String,
    /// Elements pushed on top of the parent's stack for this child.
    #[serde(default)]
    pub context_elements: Vec<ContextElement>,
}

/// Result of a state's execute or resume contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResponse {
    #[serde(rename = "async", default)]
    pub is_async: bool,
    pub execution_status: ExecutionStatus,
    #[serde(default)]
    pub failure_types: BTreeSet<FailureType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_execution_data: Option<serde_json::Value>,
    #[serde(default)]
    pub correlation_ids: Vec<String>,
    #[serde(default)]
    pub context_elements: Vec<ContextElement>,
    #[serde(default)]
    pub notify_elements: Vec<ContextElement>,
    #[serde(default)]
    pub state_execution_instances: Vec<SpawnedInstance>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delegate_task_id: Option<String>,
    /// Deadline for the async wait; falls back to the state's timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_millis: Option<u64>,
}

impl Default for ExecutionResponse {
    fn default() -> Self {
        Self {
            is_async: false,
            execution_status: ExecutionStatus::Success,
            failure_types: BTreeSet::new(),
            error_message: None,
            state_execution_data: None,
            correlation_ids: Vec::new(),
            context_elements: Vec::new(),
            notify_elements: Vec::new(),
            state_execution_instances: Vec::new(),
            delegate_task_id: None,
            timeout_millis: None,
        }
    }
}

impl ExecutionResponse {
    /// Synchronous SUCCESS.
    pub fn success() -> Self {
        Self::default()
    }

    /// Synchronous completion with the given status.
    pub fn with_status(status: ExecutionStatus) -> Self {
        Self {
            execution_status: status,
            ..Self::default()
        }
    }

    /// Synchronous FAILED with an application error.
    pub fn failed(message: impl Into<String>) -> Self {
        let mut response = Self::with_status(ExecutionStatus::Failed);
        response.error_message = Some(message.into());
        response.failure_types.insert(FailureType::ApplicationError);
        response
    }

    /// Suspend until every correlation id has a result.
    pub fn async_on<I, S>(correlation_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            is_async: true,
            correlation_ids: correlation_ids.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn error_message(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn failure_type(mut self, failure_type: FailureType) -> Self {
        self.failure_types.insert(failure_type);
        self
    }

    pub fn state_execution_data(mut self, data: serde_json::Value) -> Self {
        self.state_execution_data = Some(data);
        self
    }

    pub fn context_element(mut self, element: ContextElement) -> Self {
        self.context_elements.push(element);
        self
    }

    pub fn notify_element(mut self, element: ContextElement) -> Self {
        self.notify_elements.push(element);
        self
    }

    pub fn spawn(mut self, child: SpawnedInstance) -> Self {
        self.state_execution_instances.push(child);
        self
    }

    pub fn delegate_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.delegate_task_id = Some(task_id.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout_millis = Some(timeout.as_millis() as u64);
        self
    }

    /// Check the async marker against the correlation ids.
    ///
    /// # Errors
    ///
    /// Returns `Validation` when an async response carries no correlation
    /// ids, when a sync response carries some, or when a sync response
    /// reports a non-terminal status.
    pub fn validate(&self) -> EngineResult<()> {
        if self.is_async && self.correlation_ids.is_empty() {
            return Err(EngineError::Validation(
                "async response without correlation ids".to_string(),
            ));
        }
        if !self.is_async && !self.correlation_ids.is_empty() {
            return Err(EngineError::Validation(
                "correlation ids on a synchronous response".to_string(),
            ));
        }
        if !self.is_async && !self.execution_status.is_final() {
            return Err(EngineError::Validation(format!(
                "synchronous response with non-terminal status {}",
                self.execution_status
            )));
        }
        Ok(())
    }
}

/// Result of a finished child branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionStatusData {
    pub instance_id: String,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub notify_elements: Vec<ContextElement>,
}

/// A response delivered for one correlation id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResponseData {
    /// Result of external work.
    Payload { value: serde_json::Value },
    /// External work failed or timed out.
    Error {
        message: String,
        #[serde(default)]
        failure_types: BTreeSet<FailureType>,
    },
    /// A child branch reached a terminal status.
    Status(ExecutionStatusData),
}

impl ResponseData {
    pub fn payload(value: serde_json::Value) -> Self {
        Self::Payload { value }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            failure_types: BTreeSet::new(),
        }
    }

    /// Error delivered when a correlation id outlives its deadline.
    pub fn expired(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            failure_types: BTreeSet::from([FailureType::Expired]),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }
}

/// Default resume behavior shared by states that do not override it.
///
/// Errors map to FAILED (EXPIRED when the notifier reported expiry); with
/// several errors the most severe wins, ties going to the lowest
/// correlation id. Child branch results aggregate worst-status-wins and
/// their notify elements are merged in correlation id order.
pub fn default_resume_response(
    responses: &HashMap<String, ResponseData>,
    is_error: bool,
) -> ExecutionResponse {
    let mut ordered: Vec<(&String, &ResponseData)> = responses.iter().collect();
    ordered.sort_by(|a, b| a.0.cmp(b.0));

    let worst_error = ordered
        .iter()
        .filter_map(|(_, r)| match r {
            ResponseData::Error {
                message,
                failure_types,
            } => {
                let status = if failure_types.contains(&FailureType::Expired) {
                    ExecutionStatus::Expired
                } else {
                    ExecutionStatus::Failed
                };
                Some((status, message, failure_types))
            }
            _ => None,
        })
        .fold(None, |acc: Option<(ExecutionStatus, &String, &BTreeSet<FailureType>)>, next| match acc {
            Some(current) if current.0.severity() >= next.0.severity() => Some(current),
            _ => Some(next),
        });
    if let Some((status, message, failure_types)) = worst_error {
        let mut response = ExecutionResponse::with_status(status).error_message(message.clone());
        response.failure_types = failure_types.clone();
        return response;
    }
    if is_error {
        return ExecutionResponse::failed("external work reported an error");
    }

    let children: Vec<&ExecutionStatusData> = ordered
        .iter()
        .filter_map(|(_, r)| match r {
            ResponseData::Status(data) => Some(data),
            _ => None,
        })
        .collect();
    let mut response = ExecutionResponse::with_status(ExecutionStatus::aggregate(children.iter().map(|d| d.status)));
    for data in children {
        response.notify_elements.extend(data.notify_elements.iter().cloned());
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_sync_success() {
        let response = ExecutionResponse::default();
        assert!(!response.is_async);
        assert_eq!(response.execution_status, ExecutionStatus::Success);
        assert!(response.validate().is_ok());
    }

    #[test]
    fn test_async_requires_correlation_ids() {
        assert!(ExecutionResponse::async_on(["x"]).validate().is_ok());
        let empty = ExecutionResponse::async_on(Vec::<String>::new());
        assert!(matches!(empty.validate(), Err(EngineError::Validation(_))));
    }

    #[test]
    fn test_sync_must_be_terminal() {
        let response = ExecutionResponse::with_status(ExecutionStatus::Running);
        assert!(response.validate().is_err());
    }

    #[test]
    fn test_async_flag_serializes_as_async() {
        let json = serde_json::to_value(ExecutionResponse::async_on(["x"])).unwrap();
        assert_eq!(json["async"], true);
        assert_eq!(json["correlationIds"][0], "x");
    }

    #[test]
    fn test_default_resume_maps_expiry() {
        let responses = HashMap::from([("x".to_string(), ResponseData::expired("deadline passed"))]);
        let response = default_resume_response(&responses, true);
        assert_eq!(response.execution_status, ExecutionStatus::Expired);
        assert_eq!(response.error_message.as_deref(), Some("deadline passed"));
    }

    #[test]
    fn test_default_resume_aggregates_children() {
        let child = |id: &str, status| {
            ResponseData::Status(ExecutionStatusData {
                instance_id: id.to_string(),
                status,
                notify_elements: vec![],
            })
        };
        let responses = HashMap::from([
            ("a".to_string(), child("a", ExecutionStatus::Success)),
            ("b".to_string(), child("b", ExecutionStatus::Aborted)),
        ]);
        let response = default_resume_response(&responses, false);
        assert_eq!(response.execution_status, ExecutionStatus::Aborted);
    }

    #[test]
    fn test_default_resume_prefers_failure_over_expiry() {
        for _ in 0..8 {
            let responses = HashMap::from([
                ("a".to_string(), ResponseData::expired("deadline passed")),
                ("b".to_string(), ResponseData::error("agent crashed")),
                ("c".to_string(), ResponseData::expired("deadline passed too")),
            ]);
            let response = default_resume_response(&responses, true);
            assert_eq!(response.execution_status, ExecutionStatus::Failed);
            assert_eq!(response.error_message.as_deref(), Some("agent crashed"));
        }

        let responses = HashMap::from([
            ("b".to_string(), ResponseData::expired("second")),
            ("a".to_string(), ResponseData::expired("first")),
        ]);
        let response = default_resume_response(&responses, true);
        assert_eq!(response.execution_status, ExecutionStatus::Expired);
        assert_eq!(response.error_message.as_deref(), Some("first"));
    }

    #[test]
    fn test_default_resume_merges_notify_elements_in_id_order() {
        use crate::context::{ContextElement, ParamElement};

        let child = |id: &str, name: &str| {
            ResponseData::Status(ExecutionStatusData {
                instance_id: id.to_string(),
                status: ExecutionStatus::Success,
                notify_elements: vec![ContextElement::Param(ParamElement {
                    name: name.to_string(),
                    params: serde_json::Map::new(),
                })],
            })
        };
        let responses = HashMap::from([
            ("n3".to_string(), child("c", "third")),
            ("n1".to_string(), child("a", "first")),
            ("n2".to_string(), child("b", "second")),
        ]);
        let response = default_resume_response(&responses, false);
        let names: Vec<&str> = response
            .notify_elements
            .iter()
            .filter_map(|e| match e {
                ContextElement::Param(p) => Some(p.name.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(names, vec!["first", "second", "third"]);
    }

    #[test]
    fn test_default_resume_plain_payload_succeeds() {
        let responses = HashMap::from([(
            "x".to_string(),
            ResponseData::payload(serde_json::json!({"ok": true})),
        )]);
        let response = default_resume_response(&responses, false);
        assert_eq!(response.execution_status, ExecutionStatus::Success);
    }
}
