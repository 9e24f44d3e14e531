//! The persisted record of one state invocation.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{ExecutionInterruptEffect, ExecutionStatus, FailureType};
use crate::context::ContextElement;
use crate::state::ExecutionResponse;

/// Persisted snapshot of one node's run.
///
/// Records are treated as values: every change goes through a `with_*`
/// method or one of the clone transforms and the result is written back
/// through the store with an optimistic version check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateExecutionInstance {
    pub uuid: String,
    pub app_id: String,
    pub execution_uuid: String,
    pub state_machine_id: String,
    pub state_name: String,
    pub state_type: String,
    pub status: ExecutionStatus,

    /// Predecessor in a transition, REPEAT or retry chain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_instance_id: Option<String>,
    /// Instance waiting on this branch (fork or fan-out parent).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_instance_id: Option<String>,
    /// Correlation id completed when this branch ends.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify_id: Option<String>,
    #[serde(default)]
    pub context_transition: bool,
    #[serde(default)]
    pub context_elements: Vec<ContextElement>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delegate_task_id: Option<String>,
    #[serde(default)]
    pub correlation_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_execution_data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub failure_types: BTreeSet<FailureType>,

    #[serde(default)]
    pub retry_count: u32,
    /// Set while the instance waits on the children of its FORK transitions.
    #[serde(default)]
    pub fork_barrier: bool,
    /// Set once the fork barrier released; the node does not fork again.
    #[serde(default)]
    pub fork_joined: bool,
    /// PAUSE arrived while the async work was in flight.
    #[serde(default)]
    pub pause_requested: bool,
    /// Held by PAUSE_ALL before it started.
    #[serde(default)]
    pub paused_before_start: bool,
    /// Result parked by a cooperative pause, replayed on RESUME.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_response: Option<ExecutionResponse>,
    #[serde(default)]
    pub interrupt_history: Vec<ExecutionInterruptEffect>,
    /// The state recorded execution data that can be inspected.
    #[serde(default)]
    pub has_inspection: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_ts: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_ts: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry_ts: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,

    /// Optimistic-concurrency version, owned by the store.
    #[serde(default)]
    pub version: u64,
}

impl StateExecutionInstance {
    /// Create a NEW instance for a state of a workflow run.
    pub fn new(
        app_id: impl Into<String>,
        execution_uuid: impl Into<String>,
        state_machine_id: impl Into<String>,
        state_name: impl Into<String>,
        state_type: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            uuid: Uuid::new_v4().to_string(),
            app_id: app_id.into(),
            execution_uuid: execution_uuid.into(),
            state_machine_id: state_machine_id.into(),
            state_name: state_name.into(),
            state_type: state_type.into(),
            status: ExecutionStatus::New,
            prev_instance_id: None,
            parent_instance_id: None,
            notify_id: None,
            context_transition: false,
            context_elements: Vec::new(),
            delegate_task_id: None,
            correlation_ids: Vec::new(),
            state_execution_data: None,
            error_message: None,
            failure_types: BTreeSet::new(),
            retry_count: 0,
            fork_barrier: false,
            fork_joined: false,
            pause_requested: false,
            paused_before_start: false,
            pending_response: None,
            interrupt_history: Vec::new(),
            has_inspection: false,
            start_ts: None,
            end_ts: None,
            expiry_ts: None,
            created_at: now,
            last_updated_at: now,
            version: 0,
        }
    }

    /// Attach the instance to a waiting parent.
    pub fn with_parent(mut self, parent_instance_id: impl Into<String>, notify_id: impl Into<String>) -> Self {
        self.parent_instance_id = Some(parent_instance_id.into());
        self.notify_id = Some(notify_id.into());
        self
    }

    pub fn with_context_elements(mut self, elements: Vec<ContextElement>) -> Self {
        self.context_elements = elements;
        self
    }

    /// Copy with a new status; maintains start/end timestamps.
    pub fn with_status(mut self, status: ExecutionStatus) -> Self {
        let now = Utc::now();
        if matches!(status, ExecutionStatus::Starting | ExecutionStatus::Running)
            && self.start_ts.is_none()
        {
            self.start_ts = Some(now);
        }
        if status.is_final() {
            self.end_ts = Some(now);
        }
        self.status = status;
        self.last_updated_at = now;
        self
    }

    /// Successor instance for the next state of the branch.
    ///
    /// Branch linkage (parent, notify id) and the context stack carry over;
    /// everything execution-scoped starts fresh.
    pub fn next_for(&self, state_name: &str, state_type: &str) -> Self {
        let mut next = Self::new(
            self.app_id.clone(),
            self.execution_uuid.clone(),
            self.state_machine_id.clone(),
            state_name,
            state_type,
        );
        next.prev_instance_id = Some(self.uuid.clone());
        next.parent_instance_id = self.parent_instance_id.clone();
        next.notify_id = self.notify_id.clone();
        next.context_elements = self.context_elements.clone();
        next
    }

    /// Reset-clone used by RETRY.
    ///
    /// Identity and graph linkage are kept, execution-scoped fields are
    /// reset, `context_transition` is set and the retry counter advances.
    pub fn retry_clone(&self) -> Self {
        let now = Utc::now();
        Self {
            uuid: Uuid::new_v4().to_string(),
            status: ExecutionStatus::New,
            prev_instance_id: Some(self.uuid.clone()),
            context_transition: true,
            delegate_task_id: None,
            correlation_ids: Vec::new(),
            state_execution_data: None,
            error_message: None,
            failure_types: BTreeSet::new(),
            retry_count: self.retry_count + 1,
            fork_barrier: false,
            fork_joined: false,
            pause_requested: false,
            paused_before_start: false,
            pending_response: None,
            interrupt_history: Vec::new(),
            has_inspection: false,
            start_ts: None,
            end_ts: None,
            expiry_ts: None,
            created_at: now,
            last_updated_at: now,
            version: 0,
            ..self.clone()
        }
    }

    pub fn is_retry(&self) -> bool {
        self.retry_count > 0
    }

    pub fn is_root(&self) -> bool {
        self.notify_id.is_none()
    }
}
