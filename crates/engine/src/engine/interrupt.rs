//! Execution interrupt manager.
//!
//! Interrupts are validated against the target's current status, recorded,
//! seized exactly once and then applied. An interrupt that does not fit the
//! target is answered with an [`InterruptRejection`] rather than an error.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::executor::{record_effect, ExecutorInner, StateMachineExecutor};
use crate::error::EngineResult;
use crate::instance::{ExecutionInterrupt, ExecutionInterruptType, ExecutionStatus, StateExecutionInstance};
use crate::state::ExecutionResponse;
use crate::store::{update_status, StatusUpdate};

/// Why an interrupt was not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectionReason {
    /// No instance with that id in the execution.
    UnknownInstance,
    /// The execution has no instances.
    UnknownExecution,
    /// The target already reached a terminal status.
    AlreadyTerminal,
    /// The interrupt does not apply to the target's status.
    NotApplicable(ExecutionStatus),
    /// The failed instance already has a retry.
    AlreadyRetried,
    /// Instance-scoped interrupt without an instance id.
    MissingInstanceId,
    /// The interrupt was consumed by someone else.
    AlreadySeized,
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownInstance => write!(f, "unknown instance"),
            Self::UnknownExecution => write!(f, "unknown execution"),
            Self::AlreadyTerminal => write!(f, "already terminal"),
            Self::NotApplicable(status) => write!(f, "not applicable in status {}", status),
            Self::AlreadyRetried => write!(f, "already retried"),
            Self::MissingInstanceId => write!(f, "missing instance id"),
            Self::AlreadySeized => write!(f, "already seized"),
        }
    }
}

/// A typed "no-op" answer to an interrupt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterruptRejection {
    pub reason: RejectionReason,
    pub message: String,
}

/// Result of registering an interrupt.
#[derive(Debug, Clone, PartialEq)]
pub enum InterruptOutcome {
    /// Recorded and applied; carries the stored interrupt.
    Applied(ExecutionInterrupt),
    Rejected(InterruptRejection),
}

impl InterruptOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }

    pub fn interrupt(&self) -> Option<&ExecutionInterrupt> {
        match self {
            Self::Applied(interrupt) => Some(interrupt),
            Self::Rejected(_) => None,
        }
    }

    pub fn rejection(&self) -> Option<&InterruptRejection> {
        match self {
            Self::Applied(_) => None,
            Self::Rejected(rejection) => Some(rejection),
        }
    }
}

fn rejected(reason: RejectionReason, interrupt: &ExecutionInterrupt) -> InterruptOutcome {
    let target = interrupt
        .state_execution_instance_id
        .as_deref()
        .unwrap_or(&interrupt.execution_uuid);
    let message = format!("{} on {}: {}", interrupt.execution_interrupt_type, target, reason);
    info!(interrupt_id = %interrupt.interrupt_id, reason = %reason, "Interrupt rejected");
    InterruptOutcome::Rejected(InterruptRejection { reason, message })
}

enum Target {
    Instance(StateExecutionInstance),
    Execution(Vec<StateExecutionInstance>),
}

/// Validates and applies [`ExecutionInterrupt`]s.
#[derive(Debug, Clone)]
pub struct ExecutionInterruptManager {
    executor: StateMachineExecutor,
}

impl StateMachineExecutor {
    pub fn interrupt_manager(&self) -> ExecutionInterruptManager {
        ExecutionInterruptManager::new(self.clone())
    }
}

impl ExecutionInterruptManager {
    pub fn new(executor: StateMachineExecutor) -> Self {
        Self { executor }
    }

    fn inner(&self) -> &Arc<ExecutorInner> {
        &self.executor.inner
    }

    /// Validate, record and apply an interrupt.
    ///
    /// Status flips happen before this returns. Abort handlers and resumed
    /// work run on the dispatcher; the interrupt counts as applied without
    /// waiting for them.
    ///
    /// # Errors
    ///
    /// Store failures and exhausted optimistic retries. Interrupts that do
    /// not fit the target are returned as [`InterruptOutcome::Rejected`].
    pub async fn register_execution_interrupt(&self, interrupt: ExecutionInterrupt) -> EngineResult<InterruptOutcome> {
        let target = match self.validate(&interrupt).await? {
            Ok(target) => target,
            Err(reason) => return Ok(rejected(reason, &interrupt)),
        };

        let interrupts = &self.inner().collab.interrupts;
        let interrupt_id = interrupt.interrupt_id.clone();
        interrupts.save(interrupt.clone()).await?;
        if !interrupts.seize(&interrupt_id).await? {
            return Ok(rejected(RejectionReason::AlreadySeized, &interrupt));
        }

        info!(
            interrupt_id = %interrupt_id,
            interrupt_type = %interrupt.execution_interrupt_type,
            execution_uuid = %interrupt.execution_uuid,
            instance_id = ?interrupt.state_execution_instance_id,
            "Applying interrupt"
        );
        if let Some(reason) = self.apply(&interrupt, target).await? {
            return Ok(rejected(reason, &interrupt));
        }

        let applied = interrupts.mark_applied(&interrupt_id, Utc::now()).await?;
        Ok(InterruptOutcome::Applied(applied))
    }

    async fn validate(&self, interrupt: &ExecutionInterrupt) -> EngineResult<Result<Target, RejectionReason>> {
        let store = &self.inner().collab.instances;
        let kind = interrupt.execution_interrupt_type;

        if kind.is_execution_scoped() {
            let instances = store
                .list_by_execution(&interrupt.app_id, &interrupt.execution_uuid)
                .await?;
            if instances.is_empty() {
                return Ok(Err(RejectionReason::UnknownExecution));
            }
            if kind != ExecutionInterruptType::ResumeAll && instances.iter().all(|i| i.status.is_final()) {
                return Ok(Err(RejectionReason::AlreadyTerminal));
            }
            return Ok(Ok(Target::Execution(instances)));
        }

        let Some(instance_id) = interrupt.state_execution_instance_id.as_deref() else {
            return Ok(Err(RejectionReason::MissingInstanceId));
        };
        let Some(instance) = store
            .load(&interrupt.app_id, instance_id)
            .await?
            .filter(|i| i.execution_uuid == interrupt.execution_uuid)
        else {
            return Ok(Err(RejectionReason::UnknownInstance));
        };

        if !kind.applies_to(instance.status) {
            let reason = if instance.status.is_final() && kind != ExecutionInterruptType::Retry {
                RejectionReason::AlreadyTerminal
            } else {
                RejectionReason::NotApplicable(instance.status)
            };
            return Ok(Err(reason));
        }

        if kind == ExecutionInterruptType::Retry {
            let siblings = store
                .list_by_execution(&instance.app_id, &instance.execution_uuid)
                .await?;
            let retried = siblings.iter().any(|other| {
                other.prev_instance_id.as_deref() == Some(instance.uuid.as_str())
                    && other.state_name == instance.state_name
                    && other.retry_count == instance.retry_count + 1
            });
            if retried {
                return Ok(Err(RejectionReason::AlreadyRetried));
            }
        }
        Ok(Ok(Target::Instance(instance)))
    }

    /// Apply a seized interrupt. A rejection here means another interrupt
    /// won a claim the target allows only once.
    async fn apply(&self, interrupt: &ExecutionInterrupt, target: Target) -> EngineResult<Option<RejectionReason>> {
        let inner = self.inner();
        let id = interrupt.interrupt_id.as_str();

        match (interrupt.execution_interrupt_type, target) {
            (ExecutionInterruptType::Pause, Target::Instance(instance)) => {
                self.request_pause(&instance, id).await?;
            }
            (ExecutionInterruptType::Resume, Target::Instance(instance)) => {
                inner.dispatch_paused_resume(instance, id.to_string());
            }
            (ExecutionInterruptType::Abort, Target::Instance(instance)) => {
                let all = self.execution_instances(&instance).await?;
                let targets = with_active_descendants(&instance, &all);
                self.discontinue(targets, ExecutionStatus::Aborted, id).await?;
            }
            (ExecutionInterruptType::MarkExpired, Target::Instance(instance)) => {
                let all = self.execution_instances(&instance).await?;
                let targets = with_active_descendants(&instance, &all);
                self.discontinue(targets, ExecutionStatus::Expired, id).await?;
            }
            (ExecutionInterruptType::MarkSuccess, Target::Instance(instance)) => {
                inner
                    .force_complete(instance, ExecutionResponse::with_status(ExecutionStatus::Success), id)
                    .await?;
            }
            (ExecutionInterruptType::MarkFailed, Target::Instance(instance)) => {
                inner
                    .force_complete(instance, ExecutionResponse::failed("Marked failed by interrupt"), id)
                    .await?;
            }
            (ExecutionInterruptType::Retry, Target::Instance(instance)) => {
                if !inner
                    .collab
                    .interrupts
                    .claim_retry(&instance.app_id, &instance.uuid, id)
                    .await?
                {
                    return Ok(Some(RejectionReason::AlreadyRetried));
                }
                let mut clone = instance.retry_clone();
                record_effect(&mut clone, id);
                let saved = inner.collab.instances.save(clone).await?;
                info!(
                    failed = %instance.uuid,
                    retry = %saved.uuid,
                    retry_count = saved.retry_count,
                    "Retrying state"
                );
                inner.dispatch_start(saved.app_id.clone(), saved.uuid.clone());
            }
            (ExecutionInterruptType::AbortAll, Target::Execution(instances)) => {
                let active = leaf_first(instances.into_iter().filter(|i| !i.status.is_final()).collect());
                self.discontinue(active, ExecutionStatus::Aborted, id).await?;
            }
            (ExecutionInterruptType::EndExecution | ExecutionInterruptType::Rollback, Target::Execution(instances)) => {
                self.end_execution(instances, id).await?;
            }
            (ExecutionInterruptType::PauseAll, Target::Execution(instances)) => {
                for instance in instances.iter().filter(|i| i.status == ExecutionStatus::Running) {
                    self.request_pause(instance, id).await?;
                }
            }
            (ExecutionInterruptType::ResumeAll, Target::Execution(instances)) => {
                for instance in instances.into_iter().filter(|i| i.status == ExecutionStatus::Paused) {
                    inner.dispatch_paused_resume(instance, id.to_string());
                }
            }
            (kind, _) => {
                warn!(interrupt_type = %kind, "Interrupt target does not match its scope");
            }
        }
        Ok(None)
    }

    async fn request_pause(&self, instance: &StateExecutionInstance, interrupt_id: &str) -> EngineResult<()> {
        let inner = self.inner();
        let update = update_status(
            inner.collab.instances.as_ref(),
            &instance.app_id,
            &instance.uuid,
            &[ExecutionStatus::Running],
            ExecutionStatus::Pausing,
            inner.config.update_retry_limit,
            |i| record_effect(i, interrupt_id),
        )
        .await?;
        if let StatusUpdate::Rejected(found) = update {
            debug!(instance_id = %instance.uuid, status = %found.status, "Pause came too late");
        }
        Ok(())
    }

    async fn execution_instances(&self, instance: &StateExecutionInstance) -> EngineResult<Vec<StateExecutionInstance>> {
        self.inner()
            .collab
            .instances
            .list_by_execution(&instance.app_id, &instance.execution_uuid)
            .await
    }

    /// Move instances to DISCONTINUING, run abort handlers, then finish them.
    async fn discontinue(
        &self,
        instances: Vec<StateExecutionInstance>,
        final_status: ExecutionStatus,
        interrupt_id: &str,
    ) -> EngineResult<()> {
        let marked = self.mark_discontinuing(instances, interrupt_id).await?;
        self.finish_discontinued(marked, final_status).await
    }

    async fn mark_discontinuing(
        &self,
        instances: Vec<StateExecutionInstance>,
        interrupt_id: &str,
    ) -> EngineResult<Vec<(ExecutionStatus, StateExecutionInstance)>> {
        let inner = self.inner();
        let active: Vec<ExecutionStatus> = ExecutionStatus::ALL
            .into_iter()
            .filter(|s| !s.is_final() && *s != ExecutionStatus::Discontinuing)
            .collect();
        let expiry = chrono::Duration::from_std(inner.config.abort_expiry_buffer())
            .ok()
            .and_then(|buffer| Utc::now().checked_add_signed(buffer));

        let mut marked = Vec::with_capacity(instances.len());
        for instance in instances {
            let update = update_status(
                inner.collab.instances.as_ref(),
                &instance.app_id,
                &instance.uuid,
                &active,
                ExecutionStatus::Discontinuing,
                inner.config.update_retry_limit,
                |i| {
                    i.expiry_ts = expiry;
                    record_effect(i, interrupt_id);
                },
            )
            .await?;
            match update {
                StatusUpdate::Applied(discontinuing) => marked.push((instance.status, discontinuing)),
                StatusUpdate::Rejected(found) => {
                    debug!(instance_id = %found.uuid, status = %found.status, "Already finished, not discontinued");
                }
            }
        }
        Ok(marked)
    }

    async fn finish_discontinued(
        &self,
        marked: Vec<(ExecutionStatus, StateExecutionInstance)>,
        final_status: ExecutionStatus,
    ) -> EngineResult<()> {
        let inner = self.inner();
        for (previous, instance) in marked {
            if matches!(
                previous,
                ExecutionStatus::Running | ExecutionStatus::Waiting | ExecutionStatus::Pausing | ExecutionStatus::Paused
            ) {
                inner.dispatch_abort_event(instance.clone());
            }
            if previous == ExecutionStatus::Waiting {
                inner.release_wait(&instance).await;
            }
            let update = update_status(
                inner.collab.instances.as_ref(),
                &instance.app_id,
                &instance.uuid,
                &[ExecutionStatus::Discontinuing],
                final_status,
                inner.config.update_retry_limit,
                |_| {},
            )
            .await?;
            if let StatusUpdate::Applied(done) = update {
                info!(
                    execution_uuid = %done.execution_uuid,
                    state = %done.state_name,
                    status = %final_status,
                    "State discontinued"
                );
                inner.end_branch(&done, final_status, Vec::new()).await?;
            }
        }
        Ok(())
    }

    /// WAITING leaves fail, everything else still active is aborted.
    async fn end_execution(&self, instances: Vec<StateExecutionInstance>, interrupt_id: &str) -> EngineResult<()> {
        let inner = self.inner();
        let active: Vec<StateExecutionInstance> = instances.into_iter().filter(|i| !i.status.is_final()).collect();
        let parents: HashSet<&str> = active.iter().filter_map(|i| i.parent_instance_id.as_deref()).collect();

        let (leaves, rest): (Vec<_>, Vec<_>) = active
            .iter()
            .cloned()
            .partition(|i| i.status == ExecutionStatus::Waiting && !parents.contains(i.uuid.as_str()));

        let marked = self.mark_discontinuing(leaf_first(rest), interrupt_id).await?;

        for leaf in leaves {
            let update = update_status(
                inner.collab.instances.as_ref(),
                &leaf.app_id,
                &leaf.uuid,
                &[ExecutionStatus::Waiting],
                ExecutionStatus::Failed,
                inner.config.update_retry_limit,
                |i| {
                    i.error_message = Some("Execution ended by interrupt".to_string());
                    record_effect(i, interrupt_id);
                },
            )
            .await?;
            if let StatusUpdate::Applied(failed) = update {
                info!(state = %failed.state_name, "Waiting state failed by end of execution");
                inner.release_wait(&failed).await;
                inner.end_branch(&failed, ExecutionStatus::Failed, Vec::new()).await?;
            }
        }

        self.finish_discontinued(marked, ExecutionStatus::Aborted).await
    }
}

/// The instance plus every active instance below it, leaves first.
fn with_active_descendants(
    root: &StateExecutionInstance,
    all: &[StateExecutionInstance],
) -> Vec<StateExecutionInstance> {
    let mut selected = vec![root.clone()];
    let mut frontier = vec![root.uuid.clone()];
    while let Some(parent) = frontier.pop() {
        for child in all.iter().filter(|i| i.parent_instance_id.as_deref() == Some(parent.as_str())) {
            if !child.status.is_final() {
                selected.push(child.clone());
            }
            frontier.push(child.uuid.clone());
        }
    }
    leaf_first(selected)
}

/// Order instances deepest first along the parent chain.
fn leaf_first(mut instances: Vec<StateExecutionInstance>) -> Vec<StateExecutionInstance> {
    let parents: HashMap<String, Option<String>> = instances
        .iter()
        .map(|i| (i.uuid.clone(), i.parent_instance_id.clone()))
        .collect();
    let depth = |instance: &StateExecutionInstance| {
        let mut depth = 0usize;
        let mut current = instance.parent_instance_id.clone();
        while let Some(id) = current {
            depth += 1;
            current = parents.get(&id).cloned().flatten();
        }
        depth
    };
    instances.sort_by_key(|i| std::cmp::Reverse(depth(i)));
    instances
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(name: &str, status: ExecutionStatus, parent: Option<&str>) -> StateExecutionInstance {
        let mut i = StateExecutionInstance::new("app", "exec-1", "sm-1", name, "noop");
        i.status = status;
        i.parent_instance_id = parent.map(str::to_string);
        i
    }

    #[test]
    fn test_leaf_first_orders_by_depth() {
        let root = instance("root", ExecutionStatus::Waiting, None);
        let child = instance("child", ExecutionStatus::Waiting, Some(&root.uuid));
        let grandchild = instance("grandchild", ExecutionStatus::Running, Some(&child.uuid));

        let ordered = leaf_first(vec![root.clone(), child.clone(), grandchild.clone()]);
        let names: Vec<&str> = ordered.iter().map(|i| i.state_name.as_str()).collect();
        assert_eq!(names, vec!["grandchild", "child", "root"]);
    }

    #[test]
    fn test_descendants_skip_finished_but_walk_through_them() {
        let root = instance("root", ExecutionStatus::Waiting, None);
        let done = instance("done", ExecutionStatus::Success, Some(&root.uuid));
        let running = instance("running", ExecutionStatus::Running, Some(&root.uuid));
        let unrelated = instance("other", ExecutionStatus::Running, None);

        let selected = with_active_descendants(&root, &[root.clone(), done, running, unrelated]);
        let names: Vec<&str> = selected.iter().map(|i| i.state_name.as_str()).collect();
        assert_eq!(names, vec!["running", "root"]);
    }

    #[test]
    fn test_rejection_message() {
        let interrupt = ExecutionInterrupt::for_instance(ExecutionInterruptType::Pause, "app", "exec-1", "sei-9");
        let outcome = rejected(RejectionReason::NotApplicable(ExecutionStatus::Waiting), &interrupt);
        let rejection = outcome.rejection().unwrap();
        assert_eq!(rejection.message, "PAUSE on sei-9: not applicable in status WAITING");
        assert!(!outcome.is_applied());
    }
}
