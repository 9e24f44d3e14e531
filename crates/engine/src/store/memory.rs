//! Process-local stores.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{ExecutionOutcome, InterruptStore, StateExecutionStore};
use crate::error::{EngineError, EngineResult};
use crate::instance::{ExecutionInterrupt, StateExecutionInstance};

type InstanceKey = (String, String);

/// Instance store backed by a map.
#[derive(Debug, Default)]
pub struct InMemoryStateExecutionStore {
    instances: RwLock<HashMap<InstanceKey, StateExecutionInstance>>,
    outcomes: RwLock<HashMap<InstanceKey, ExecutionOutcome>>,
}

impl InMemoryStateExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn key(app_id: &str, id: &str) -> InstanceKey {
    (app_id.to_string(), id.to_string())
}

#[async_trait]
impl StateExecutionStore for InMemoryStateExecutionStore {
    async fn save(&self, mut instance: StateExecutionInstance) -> EngineResult<StateExecutionInstance> {
        let mut instances = self.instances.write().await;
        let k = key(&instance.app_id, &instance.uuid);
        if instances.contains_key(&k) {
            return Err(EngineError::Conflict(format!("instance {} already exists", instance.uuid)));
        }
        instance.version = 1;
        instances.insert(k, instance.clone());
        Ok(instance)
    }

    async fn load(&self, app_id: &str, instance_id: &str) -> EngineResult<Option<StateExecutionInstance>> {
        Ok(self.instances.read().await.get(&key(app_id, instance_id)).cloned())
    }

    async fn update(&self, mut instance: StateExecutionInstance) -> EngineResult<StateExecutionInstance> {
        let mut instances = self.instances.write().await;
        let stored = instances
            .get_mut(&key(&instance.app_id, &instance.uuid))
            .ok_or_else(|| EngineError::NotFound(format!("instance {}", instance.uuid)))?;
        if stored.version != instance.version {
            return Err(EngineError::VersionConflict {
                instance_id: instance.uuid,
                expected: instance.version,
                found: stored.version,
            });
        }
        instance.version += 1;
        *stored = instance.clone();
        Ok(instance)
    }

    async fn list_by_execution(&self, app_id: &str, execution_uuid: &str) -> EngineResult<Vec<StateExecutionInstance>> {
        let instances = self.instances.read().await;
        let mut matching: Vec<_> = instances
            .values()
            .filter(|i| i.app_id == app_id && i.execution_uuid == execution_uuid)
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.uuid.cmp(&b.uuid)));
        Ok(matching)
    }

    async fn record_outcome(&self, outcome: ExecutionOutcome) -> EngineResult<()> {
        let k = key(&outcome.app_id, &outcome.execution_uuid);
        if let Some(previous) = self.outcomes.write().await.insert(k, outcome.clone()) {
            tracing::info!(
                execution_uuid = %outcome.execution_uuid,
                previous = %previous.status,
                status = %outcome.status,
                "Execution outcome replaced"
            );
        }
        Ok(())
    }

    async fn outcome(&self, app_id: &str, execution_uuid: &str) -> EngineResult<Option<ExecutionOutcome>> {
        Ok(self.outcomes.read().await.get(&key(app_id, execution_uuid)).cloned())
    }
}

/// Interrupt store backed by a list.
#[derive(Debug, Default)]
pub struct InMemoryInterruptStore {
    interrupts: RwLock<Vec<ExecutionInterrupt>>,
    /// Source instance -> interrupt that retried it.
    retry_claims: RwLock<HashMap<InstanceKey, String>>,
}

impl InMemoryInterruptStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InterruptStore for InMemoryInterruptStore {
    async fn save(&self, interrupt: ExecutionInterrupt) -> EngineResult<()> {
        let mut interrupts = self.interrupts.write().await;
        if interrupts.iter().any(|i| i.interrupt_id == interrupt.interrupt_id) {
            return Err(EngineError::Conflict(format!(
                "interrupt {} already registered",
                interrupt.interrupt_id
            )));
        }
        interrupts.push(interrupt);
        Ok(())
    }

    async fn seize(&self, interrupt_id: &str) -> EngineResult<bool> {
        let mut interrupts = self.interrupts.write().await;
        let interrupt = interrupts
            .iter_mut()
            .find(|i| i.interrupt_id == interrupt_id)
            .ok_or_else(|| EngineError::NotFound(format!("interrupt {}", interrupt_id)))?;
        if interrupt.seized {
            return Ok(false);
        }
        interrupt.seized = true;
        Ok(true)
    }

    async fn claim_retry(&self, app_id: &str, source_instance_id: &str, interrupt_id: &str) -> EngineResult<bool> {
        let mut claims = self.retry_claims.write().await;
        let k = key(app_id, source_instance_id);
        if let Some(holder) = claims.get(&k) {
            tracing::debug!(source = %source_instance_id, holder = %holder, "Retry already claimed");
            return Ok(false);
        }
        claims.insert(k, interrupt_id.to_string());
        Ok(true)
    }

    async fn mark_applied(&self, interrupt_id: &str, took_effect_at: DateTime<Utc>) -> EngineResult<ExecutionInterrupt> {
        let mut interrupts = self.interrupts.write().await;
        let interrupt = interrupts
            .iter_mut()
            .find(|i| i.interrupt_id == interrupt_id)
            .ok_or_else(|| EngineError::NotFound(format!("interrupt {}", interrupt_id)))?;
        interrupt.took_effect_at = Some(took_effect_at);
        Ok(interrupt.clone())
    }

    async fn list_by_execution(&self, app_id: &str, execution_uuid: &str) -> EngineResult<Vec<ExecutionInterrupt>> {
        Ok(self
            .interrupts
            .read()
            .await
            .iter()
            .filter(|i| i.app_id == app_id && i.execution_uuid == execution_uuid)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::{ExecutionInterruptType, ExecutionStatus};

    fn instance() -> StateExecutionInstance {
        StateExecutionInstance::new("app", "exec-1", "sm-1", "build", "noop")
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let store = InMemoryStateExecutionStore::new();
        let saved = store.save(instance()).await.unwrap();
        assert_eq!(saved.version, 1);

        let loaded = store.load("app", &saved.uuid).await.unwrap().unwrap();
        assert_eq!(loaded, saved);
        assert!(store.load("other-app", &saved.uuid).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_checks_version() {
        let store = InMemoryStateExecutionStore::new();
        let saved = store.save(instance()).await.unwrap();

        let first = store
            .update(saved.clone().with_status(ExecutionStatus::Starting))
            .await
            .unwrap();
        assert_eq!(first.version, 2);

        let stale = store.update(saved.with_status(ExecutionStatus::Paused)).await;
        assert!(matches!(
            stale,
            Err(EngineError::VersionConflict { expected: 1, found: 2, .. })
        ));
    }

    #[tokio::test]
    async fn test_outcome_replaced() {
        let store = InMemoryStateExecutionStore::new();
        for status in [ExecutionStatus::Failed, ExecutionStatus::Success] {
            store
                .record_outcome(ExecutionOutcome {
                    app_id: "app".into(),
                    execution_uuid: "exec-1".into(),
                    status,
                    finished_at: Utc::now(),
                })
                .await
                .unwrap();
        }
        let outcome = store.outcome("app", "exec-1").await.unwrap().unwrap();
        assert_eq!(outcome.status, ExecutionStatus::Success);
    }

    #[tokio::test]
    async fn test_interrupt_seized_once() {
        let store = InMemoryInterruptStore::new();
        let interrupt = ExecutionInterrupt::for_execution(ExecutionInterruptType::PauseAll, "app", "exec-1");
        let id = interrupt.interrupt_id.clone();
        store.save(interrupt).await.unwrap();

        assert!(store.seize(&id).await.unwrap());
        assert!(!store.seize(&id).await.unwrap());

        let applied = store.mark_applied(&id, Utc::now()).await.unwrap();
        assert!(applied.took_effect_at.is_some());
        assert_eq!(store.list_by_execution("app", "exec-1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_retry_claimed_once_per_source() {
        let store = InMemoryInterruptStore::new();
        assert!(store.claim_retry("app", "sei-1", "int-1").await.unwrap());
        assert!(!store.claim_retry("app", "sei-1", "int-2").await.unwrap());
        assert!(!store.claim_retry("app", "sei-1", "int-1").await.unwrap());
        assert!(store.claim_retry("app", "sei-2", "int-2").await.unwrap());
        assert!(store.claim_retry("other-app", "sei-1", "int-3").await.unwrap());
    }
}
