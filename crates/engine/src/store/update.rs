//! Bounded optimistic status updates.

use super::StateExecutionStore;
use crate::error::{EngineError, EngineResult};
use crate::instance::{ExecutionStatus, StateExecutionInstance};

/// Result of a guarded status change.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusUpdate {
    /// The change was stored; carries the stored record.
    Applied(StateExecutionInstance),
    /// The instance is no longer in an expected status; carries what was found.
    Rejected(StateExecutionInstance),
}

impl StatusUpdate {
    pub fn applied(self) -> Option<StateExecutionInstance> {
        match self {
            Self::Applied(instance) => Some(instance),
            Self::Rejected(_) => None,
        }
    }
}

/// Move an instance from one of `expected` to `target`.
///
/// `mutate` sees the record before the status changes, so it can inspect
/// the previous status. A lost race reloads and reapplies up to
/// `retry_limit` times, then fails with `Conflict`.
///
/// # Errors
///
/// `NotFound` for unknown instances, `InvalidTransition` when the lifecycle
/// has no such edge, `Conflict` when retries run out.
pub async fn update_status<F>(
    store: &dyn StateExecutionStore,
    app_id: &str,
    instance_id: &str,
    expected: &[ExecutionStatus],
    target: ExecutionStatus,
    retry_limit: u32,
    mutate: F,
) -> EngineResult<StatusUpdate>
where
    F: Fn(&mut StateExecutionInstance) + Send + Sync,
{
    let mut attempt = 0;
    loop {
        let current = store
            .load(app_id, instance_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("state execution instance {}", instance_id)))?;

        if !expected.contains(&current.status) {
            return Ok(StatusUpdate::Rejected(current));
        }
        if !current.status.can_transition_to(target) {
            return Err(EngineError::InvalidTransition {
                instance_id: instance_id.to_string(),
                from: current.status,
                to: target,
            });
        }

        let mut next = current.clone();
        mutate(&mut next);
        let next = next.with_status(target);

        match store.update(next).await {
            Ok(stored) => {
                tracing::debug!(
                    instance_id = %instance_id,
                    from = %current.status,
                    to = %target,
                    "Status updated"
                );
                return Ok(StatusUpdate::Applied(stored));
            }
            Err(err) if err.is_version_conflict() && attempt < retry_limit => {
                attempt += 1;
                tracing::debug!(instance_id = %instance_id, attempt, "Version conflict, retrying");
            }
            Err(err) if err.is_version_conflict() => {
                return Err(EngineError::Conflict(format!(
                    "{} -> {} on {} lost {} races",
                    current.status,
                    target,
                    instance_id,
                    attempt + 1
                )));
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ExecutionOutcome, InMemoryStateExecutionStore};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    async fn saved(store: &InMemoryStateExecutionStore) -> StateExecutionInstance {
        store
            .save(StateExecutionInstance::new("app", "exec-1", "sm-1", "build", "noop"))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_applied() {
        let store = InMemoryStateExecutionStore::new();
        let instance = saved(&store).await;

        let update = update_status(&store, "app", &instance.uuid, &[ExecutionStatus::New], ExecutionStatus::Starting, 3, |i| {
            i.delegate_task_id = Some("task-1".into())
        })
        .await
        .unwrap();

        let stored = update.applied().unwrap();
        assert_eq!(stored.status, ExecutionStatus::Starting);
        assert_eq!(stored.delegate_task_id.as_deref(), Some("task-1"));
        assert!(stored.start_ts.is_some());
    }

    #[tokio::test]
    async fn test_rejected_when_status_moved() {
        let store = InMemoryStateExecutionStore::new();
        let instance = saved(&store).await;

        let update = update_status(&store, "app", &instance.uuid, &[ExecutionStatus::Waiting], ExecutionStatus::Running, 3, |_| {})
            .await
            .unwrap();
        assert!(matches!(update, StatusUpdate::Rejected(i) if i.status == ExecutionStatus::New));
    }

    #[tokio::test]
    async fn test_invalid_transition() {
        let store = InMemoryStateExecutionStore::new();
        let instance = saved(&store).await;

        let result = update_status(&store, "app", &instance.uuid, &[ExecutionStatus::New], ExecutionStatus::Success, 3, |_| {}).await;
        assert!(matches!(result, Err(EngineError::InvalidTransition { .. })));
    }

    /// Store whose updates always lose the race.
    struct Contended {
        inner: InMemoryStateExecutionStore,
        attempts: AtomicU32,
    }

    #[async_trait]
    impl StateExecutionStore for Contended {
        async fn save(&self, instance: StateExecutionInstance) -> EngineResult<StateExecutionInstance> {
            self.inner.save(instance).await
        }
        async fn load(&self, app_id: &str, id: &str) -> EngineResult<Option<StateExecutionInstance>> {
            self.inner.load(app_id, id).await
        }
        async fn update(&self, instance: StateExecutionInstance) -> EngineResult<StateExecutionInstance> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(EngineError::VersionConflict {
                instance_id: instance.uuid,
                expected: instance.version,
                found: instance.version + 1,
            })
        }
        async fn list_by_execution(&self, app_id: &str, exec: &str) -> EngineResult<Vec<StateExecutionInstance>> {
            self.inner.list_by_execution(app_id, exec).await
        }
        async fn record_outcome(&self, outcome: ExecutionOutcome) -> EngineResult<()> {
            self.inner.record_outcome(outcome).await
        }
        async fn outcome(&self, app_id: &str, exec: &str) -> EngineResult<Option<ExecutionOutcome>> {
            self.inner.outcome(app_id, exec).await
        }
    }

    #[tokio::test]
    async fn test_conflict_after_bounded_retries() {
        let store = Contended {
            inner: InMemoryStateExecutionStore::new(),
            attempts: AtomicU32::new(0),
        };
        let instance = saved(&store.inner).await;

        let result = update_status(&store, "app", &instance.uuid, &[ExecutionStatus::New], ExecutionStatus::Starting, 2, |_| {}).await;
        assert!(matches!(result, Err(EngineError::Conflict(_))));
        assert_eq!(store.attempts.load(Ordering::SeqCst), 3);
    }
}
