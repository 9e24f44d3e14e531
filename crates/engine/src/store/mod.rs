//! Persistence contracts for execution records.
//!
//! Instances are keyed by `(app_id, uuid)` and updated with optimistic
//! concurrency: an update carries the version it was read at and fails with
//! `VersionConflict` if the stored version moved on.

mod memory;
mod update;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EngineResult;
use crate::instance::{ExecutionInterrupt, ExecutionStatus, StateExecutionInstance};

pub use memory::{InMemoryInterruptStore, InMemoryStateExecutionStore};
pub use update::{update_status, StatusUpdate};

/// Final status of a workflow execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionOutcome {
    pub app_id: String,
    pub execution_uuid: String,
    pub status: ExecutionStatus,
    pub finished_at: DateTime<Utc>,
}

#[async_trait]
pub trait StateExecutionStore: Send + Sync {
    /// Insert a new instance; returns it with its stored version.
    async fn save(&self, instance: StateExecutionInstance) -> EngineResult<StateExecutionInstance>;

    async fn load(&self, app_id: &str, instance_id: &str) -> EngineResult<Option<StateExecutionInstance>>;

    /// Replace an instance if its version still matches; bumps the version.
    async fn update(&self, instance: StateExecutionInstance) -> EngineResult<StateExecutionInstance>;

    /// Every instance of an execution, oldest first.
    async fn list_by_execution(&self, app_id: &str, execution_uuid: &str) -> EngineResult<Vec<StateExecutionInstance>>;

    async fn record_outcome(&self, outcome: ExecutionOutcome) -> EngineResult<()>;

    async fn outcome(&self, app_id: &str, execution_uuid: &str) -> EngineResult<Option<ExecutionOutcome>>;
}

#[async_trait]
pub trait InterruptStore: Send + Sync {
    async fn save(&self, interrupt: ExecutionInterrupt) -> EngineResult<()>;

    /// Claim an interrupt for application; true only for the first caller.
    async fn seize(&self, interrupt_id: &str) -> EngineResult<bool>;

    /// Claim the single retry of a source instance for `interrupt_id`.
    ///
    /// True only for the first claim; later claims for the same source get
    /// false whatever interrupt they carry.
    async fn claim_retry(&self, app_id: &str, source_instance_id: &str, interrupt_id: &str) -> EngineResult<bool>;

    async fn mark_applied(&self, interrupt_id: &str, took_effect_at: DateTime<Utc>) -> EngineResult<ExecutionInterrupt>;

    /// Interrupts of an execution, oldest first.
    async fn list_by_execution(&self, app_id: &str, execution_uuid: &str) -> EngineResult<Vec<ExecutionInterrupt>>;
}
