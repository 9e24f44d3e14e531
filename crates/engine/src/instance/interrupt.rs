//! Operator and system interrupts.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ExecutionStatus;

/// Kind of interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionInterruptType {
    Pause,
    Resume,
    Abort,
    AbortAll,
    Retry,
    MarkFailed,
    MarkSuccess,
    MarkExpired,
    Rollback,
    EndExecution,
    PauseAll,
    ResumeAll,
}

impl ExecutionInterruptType {
    /// Interrupts that address the whole execution rather than one instance.
    pub const fn is_execution_scoped(self) -> bool {
        matches!(
            self,
            Self::AbortAll | Self::Rollback | Self::EndExecution | Self::PauseAll | Self::ResumeAll
        )
    }

    /// Whether an instance-scoped interrupt applies to an instance in `status`.
    pub fn applies_to(self, status: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        match self {
            Self::Pause => status == Running,
            Self::Resume => status == Paused,
            Self::Abort | Self::MarkExpired => !status.is_final(),
            Self::MarkFailed | Self::MarkSuccess => matches!(status, Waiting | Paused),
            Self::Retry => matches!(status, Failed | Error | Expired),
            Self::AbortAll
            | Self::Rollback
            | Self::EndExecution
            | Self::PauseAll
            | Self::ResumeAll => !status.is_final(),
        }
    }
}

impl fmt::Display for ExecutionInterruptType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pause => "PAUSE",
            Self::Resume => "RESUME",
            Self::Abort => "ABORT",
            Self::AbortAll => "ABORT_ALL",
            Self::Retry => "RETRY",
            Self::MarkFailed => "MARK_FAILED",
            Self::MarkSuccess => "MARK_SUCCESS",
            Self::MarkExpired => "MARK_EXPIRED",
            Self::Rollback => "ROLLBACK",
            Self::EndExecution => "END_EXECUTION",
            Self::PauseAll => "PAUSE_ALL",
            Self::ResumeAll => "RESUME_ALL",
        };
        f.write_str(s)
    }
}

/// A request to alter a running execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionInterrupt {
    pub interrupt_id: String,
    pub app_id: String,
    pub execution_uuid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_execution_instance_id: Option<String>,
    pub execution_interrupt_type: ExecutionInterruptType,
    /// Consumed by the interrupt manager; never applied twice.
    #[serde(default)]
    pub seized: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub took_effect_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ExecutionInterrupt {
    /// Interrupt targeting a single instance.
    pub fn for_instance(
        interrupt_type: ExecutionInterruptType,
        app_id: impl Into<String>,
        execution_uuid: impl Into<String>,
        instance_id: impl Into<String>,
    ) -> Self {
        Self {
            interrupt_id: Uuid::new_v4().to_string(),
            app_id: app_id.into(),
            execution_uuid: execution_uuid.into(),
            state_execution_instance_id: Some(instance_id.into()),
            execution_interrupt_type: interrupt_type,
            seized: false,
            took_effect_at: None,
            created_at: Utc::now(),
        }
    }

    /// Interrupt targeting a whole execution.
    pub fn for_execution(
        interrupt_type: ExecutionInterruptType,
        app_id: impl Into<String>,
        execution_uuid: impl Into<String>,
    ) -> Self {
        Self {
            interrupt_id: Uuid::new_v4().to_string(),
            app_id: app_id.into(),
            execution_uuid: execution_uuid.into(),
            state_execution_instance_id: None,
            execution_interrupt_type: interrupt_type,
            seized: false,
            took_effect_at: None,
            created_at: Utc::now(),
        }
    }
}

/// Record of an interrupt taking effect on an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionInterruptEffect {
    pub interrupt_id: String,
    pub took_effect_at: DateTime<Utc>,
}
