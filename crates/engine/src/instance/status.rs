//! Execution status lifecycle.
//!
//! The per-node lifecycle is a fixed graph:
//!
//! ```text
//! NEW -> STARTING -> RUNNING -> {SUCCESS, FAILED, ABORTED, ERROR, ...}
//! RUNNING -> WAITING -> RUNNING            (async suspend / resume)
//! RUNNING -> PAUSING -> PAUSED -> RUNNING  (cooperative pause)
//! any non-terminal -> DISCONTINUING -> ABORTED | EXPIRED
//! ```
//!
//! Terminal statuses have no outgoing edges.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Status of one state execution instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    New,
    Queued,
    Starting,
    Running,
    Waiting,
    Pausing,
    Paused,
    Resumed,
    Discontinuing,
    Success,
    Failed,
    Error,
    Aborted,
    Skipped,
    Rejected,
    Expired,
}

impl ExecutionStatus {
    /// Every status, in declaration order.
    pub const ALL: [ExecutionStatus; 16] = [
        Self::New,
        Self::Queued,
        Self::Starting,
        Self::Running,
        Self::Waiting,
        Self::Pausing,
        Self::Paused,
        Self::Resumed,
        Self::Discontinuing,
        Self::Success,
        Self::Failed,
        Self::Error,
        Self::Aborted,
        Self::Skipped,
        Self::Rejected,
        Self::Expired,
    ];

    /// Terminal statuses never change again.
    pub const fn is_final(self) -> bool {
        matches!(
            self,
            Self::Success
                | Self::Failed
                | Self::Error
                | Self::Aborted
                | Self::Skipped
                | Self::Rejected
                | Self::Expired
        )
    }

    /// Terminal statuses that route through FAILURE transitions.
    pub const fn is_broken(self) -> bool {
        matches!(
            self,
            Self::Failed | Self::Error | Self::Rejected | Self::Expired
        )
    }

    /// Terminal statuses that continue along SUCCESS transitions.
    pub const fn is_positive(self) -> bool {
        matches!(self, Self::Success | Self::Skipped)
    }

    /// Whether the lifecycle graph has an edge `self -> next`.
    pub fn can_transition_to(self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;

        if self.is_final() {
            return false;
        }
        // Interrupts may discontinue or abort anything still active.
        if matches!(next, Aborted | Discontinuing) && self != Discontinuing {
            return true;
        }

        match self {
            New => matches!(next, Queued | Starting | Paused | Skipped),
            Queued => matches!(next, Starting | Paused),
            Starting => matches!(next, Running | Skipped | Failed | Error),
            Running => matches!(
                next,
                Waiting | Pausing | Success | Failed | Error | Skipped | Rejected | Expired
            ),
            Waiting => matches!(next, Running | Success | Failed | Expired),
            Pausing => matches!(next, Paused | Waiting | Failed | Error),
            Paused => matches!(next, Resumed | Running | Success | Failed | Expired),
            Resumed => matches!(next, Running | Starting),
            Discontinuing => matches!(next, Aborted | Expired),
            Success | Failed | Error | Aborted | Skipped | Rejected | Expired => false,
        }
    }

    /// Rank used for worst-status-wins aggregation; higher is worse.
    pub const fn severity(self) -> u8 {
        match self {
            Self::Skipped => 0,
            Self::Success => 1,
            Self::Rejected => 2,
            Self::Expired => 3,
            Self::Error => 4,
            Self::Failed => 5,
            Self::Aborted => 6,
            // Non-terminal statuses never reach aggregation; treat them as failures.
            _ => 5,
        }
    }

    /// The worse of two statuses.
    pub fn worst(self, other: ExecutionStatus) -> ExecutionStatus {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }

    /// Combine branch results: worst status wins, empty input is SUCCESS.
    pub fn aggregate<I: IntoIterator<Item = ExecutionStatus>>(statuses: I) -> ExecutionStatus {
        statuses
            .into_iter()
            .fold(None, |acc: Option<ExecutionStatus>, s| {
                Some(acc.map_or(s, |a| a.worst(s)))
            })
            .map(|s| if s == Self::Skipped { Self::Success } else { s })
            .unwrap_or(Self::Success)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Queued => "QUEUED",
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Waiting => "WAITING",
            Self::Pausing => "PAUSING",
            Self::Paused => "PAUSED",
            Self::Resumed => "RESUMED",
            Self::Discontinuing => "DISCONTINUING",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
            Self::Error => "ERROR",
            Self::Aborted => "ABORTED",
            Self::Skipped => "SKIPPED",
            Self::Rejected => "REJECTED",
            Self::Expired => "EXPIRED",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_uppercase();
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == upper)
            .ok_or_else(|| EngineError::Parse(format!("Unknown execution status: {}", s)))
    }
}

/// Classification attached to failed executions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureType {
    ApplicationError,
    Timeout,
    Expired,
    Connectivity,
    Authentication,
    Authorization,
    Verification,
    DelegateProvisioning,
}

impl fmt::Display for FailureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ApplicationError => write!(f, "APPLICATION_ERROR"),
            Self::Timeout => write!(f, "TIMEOUT"),
            Self::Expired => write!(f, "EXPIRED"),
            Self::Connectivity => write!(f, "CONNECTIVITY"),
            Self::Authentication => write!(f, "AUTHENTICATION"),
            Self::Authorization => write!(f, "AUTHORIZATION"),
            Self::Verification => write!(f, "VERIFICATION"),
            Self::DelegateProvisioning => write!(f, "DELEGATE_PROVISIONING"),
        }
    }
}
