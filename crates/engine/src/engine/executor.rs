//! State machine executor.
//!
//! Drives instances through the lifecycle:
//!
//! - **start**: NEW -> STARTING -> RUNNING, consulting advisors and skip conditions
//! - **suspend**: an async response parks the instance in WAITING behind one
//!   wait-for-all registration with the notifier
//! - **resume**: the notifier's callback reloads the instance and continues it
//!   only if it is still WAITING
//! - **complete**: persist the terminal status, select the next node and
//!   either start it or end the branch
//!
//! Every status change goes through [`update_status`] so concurrent writers
//! (resume callbacks, interrupts) never overwrite each other.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Map;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::callback::ResumeCallback;
use super::dispatcher::Dispatcher;
use crate::config::EngineConfig;
use crate::context::{normalize_state_name, ContextElement, ContextServices, ExecutionContext, ExpressionRenderer};
use crate::error::{EngineError, EngineResult};
use crate::graph::{StateMachine, StateMachineRepository, StateNode, TransitionType, WorkflowDefinition};
use crate::instance::{ExecutionInterruptType, ExecutionStatus, StateExecutionInstance};
use crate::notify::{WaitNotify, WaitNotifyEngine};
use crate::result_ext::ResultExt;
use crate::secrets::LocalSecretStore;
use crate::state::{
    default_resume_response, ExecutionEvent, ExecutionEventAdvice, ExecutionEventType, ExecutionResponse,
    ExecutionStatusData, ResponseData, StateRegistry,
};
use crate::store::{
    update_status, ExecutionOutcome, InMemoryInterruptStore, InMemoryStateExecutionStore, InterruptStore,
    StateExecutionStore, StatusUpdate,
};

/// Services the executor reads from and writes to.
#[derive(Clone)]
pub struct Collaborators {
    pub machines: StateMachineRepository,
    pub instances: Arc<dyn StateExecutionStore>,
    pub interrupts: Arc<dyn InterruptStore>,
    pub notifier: Arc<dyn WaitNotify>,
    pub services: ContextServices,
}

impl Collaborators {
    /// Everything in process memory.
    pub fn in_memory(notifier: WaitNotifyEngine, secrets: Arc<LocalSecretStore>) -> Self {
        Self {
            machines: StateMachineRepository::default(),
            instances: Arc::new(InMemoryStateExecutionStore::new()),
            interrupts: Arc::new(InMemoryInterruptStore::new()),
            notifier: Arc::new(notifier),
            services: ContextServices::local(secrets),
        }
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

pub(crate) struct ExecutorInner {
    pub(crate) config: EngineConfig,
    pub(crate) collab: Collaborators,
    renderer: Arc<ExpressionRenderer>,
    dispatcher: Dispatcher,
}

/// Executes and resumes state machine instances.
///
/// Cheap to clone; clones share the dispatcher and collaborators.
#[derive(Clone)]
pub struct StateMachineExecutor {
    pub(crate) inner: Arc<ExecutorInner>,
}

impl std::fmt::Debug for StateMachineExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateMachineExecutor")
            .field("in_flight", &self.inner.dispatcher.in_flight())
            .finish_non_exhaustive()
    }
}

impl StateMachineExecutor {
    pub fn new(config: EngineConfig, collaborators: Collaborators) -> EngineResult<Self> {
        let dispatcher = Dispatcher::new(config.max_concurrent_executions);
        Ok(Self {
            inner: Arc::new(ExecutorInner {
                config,
                collab: collaborators,
                renderer: Arc::new(ExpressionRenderer::new()?),
                dispatcher,
            }),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.inner.collab
    }

    /// Compile a definition and make it available to executions.
    pub async fn register_workflow(
        &self,
        app_id: &str,
        definition: &WorkflowDefinition,
        registry: &StateRegistry,
    ) -> EngineResult<Arc<StateMachine>> {
        let machine = StateMachine::from_definition(app_id, definition, registry)?;
        info!(workflow = %machine.name, state_machine_id = %machine.uuid, "Workflow registered");
        Ok(self.inner.collab.machines.register(machine).await)
    }

    /// Create the initial instance of a new execution and start it.
    ///
    /// `context_elements` seed the stack every state of the run sees.
    pub async fn start_execution(
        &self,
        app_id: &str,
        state_machine_id: &str,
        context_elements: Vec<ContextElement>,
    ) -> EngineResult<StateExecutionInstance> {
        let machine = self.inner.collab.machines.get(state_machine_id).await?;
        let initial = machine.initial_state()?;
        let execution_uuid = Uuid::new_v4().to_string();

        let instance = StateExecutionInstance::new(
            app_id,
            &execution_uuid,
            &machine.uuid,
            initial.name(),
            initial.state_type(),
        )
        .with_context_elements(context_elements);
        let saved = self.inner.collab.instances.save(instance).await?;

        info!(
            execution_uuid = %execution_uuid,
            workflow = %machine.name,
            initial_state = %initial.name(),
            "Execution started"
        );
        self.inner.dispatch_start(saved.app_id.clone(), saved.uuid.clone());
        Ok(saved)
    }

    /// Continue a WAITING instance with the responses for its correlation ids.
    ///
    /// Returns false, without side effects, when the instance is no longer
    /// WAITING; a duplicate or late delivery is therefore harmless.
    pub async fn resume(
        &self,
        app_id: &str,
        instance_id: &str,
        responses: HashMap<String, ResponseData>,
        is_error: bool,
    ) -> EngineResult<bool> {
        self.inner.resume(app_id, instance_id, responses, is_error).await
    }

    /// Re-attach a restarted process to persisted work.
    ///
    /// - NEW and QUEUED instances are started.
    /// - WAITING instances get their wait registered again with the time
    ///   left until expiry.
    /// - STARTING instances go through advisors and skip conditions again,
    ///   RUNNING instances execute again and RESUMED ones finish resuming.
    /// - PAUSING instances settle in PAUSED with nothing parked, so RESUME
    ///   executes them again.
    /// - DISCONTINUING instances finish with the status of the interrupt
    ///   that discontinued them.
    ///
    /// PAUSED instances wait for an operator and are left alone. Returns the
    /// number of instances picked up.
    pub async fn recover_execution(&self, app_id: &str, execution_uuid: &str) -> EngineResult<usize> {
        let inner = &self.inner;
        let mut recovered = 0;
        for instance in inner.collab.instances.list_by_execution(app_id, execution_uuid).await? {
            match instance.status {
                ExecutionStatus::New | ExecutionStatus::Queued => {
                    inner.dispatch_start(instance.app_id.clone(), instance.uuid.clone());
                    recovered += 1;
                }
                ExecutionStatus::Waiting if !instance.correlation_ids.is_empty() => {
                    let timeout = instance
                        .expiry_ts
                        .map(|expiry| (expiry - Utc::now()).to_std().unwrap_or(Duration::ZERO));
                    let registered = inner
                        .collab
                        .notifier
                        .wait_for_all(instance.correlation_ids.clone(), inner.callback(&instance), timeout)
                        .await
                        .log("re-registering wait");
                    if registered.is_ok() {
                        recovered += 1;
                    }
                }
                ExecutionStatus::Starting
                | ExecutionStatus::Resumed
                | ExecutionStatus::Running
                | ExecutionStatus::Pausing
                | ExecutionStatus::Discontinuing => {
                    inner.dispatch_recover(instance);
                    recovered += 1;
                }
                _ => {}
            }
        }
        info!(execution_uuid = %execution_uuid, recovered, "Execution recovered");
        Ok(recovered)
    }

    /// Wait until no execute or resume work is in flight.
    pub async fn wait_idle(&self) {
        self.inner.dispatcher.wait_idle().await;
    }

    pub async fn instance(&self, app_id: &str, instance_id: &str) -> EngineResult<Option<StateExecutionInstance>> {
        self.inner.collab.instances.load(app_id, instance_id).await
    }

    pub async fn instances(&self, app_id: &str, execution_uuid: &str) -> EngineResult<Vec<StateExecutionInstance>> {
        self.inner.collab.instances.list_by_execution(app_id, execution_uuid).await
    }

    pub async fn outcome(&self, app_id: &str, execution_uuid: &str) -> EngineResult<Option<ExecutionOutcome>> {
        self.inner.collab.instances.outcome(app_id, execution_uuid).await
    }
}

impl ExecutorInner {
    pub(crate) fn callback(self: &Arc<Self>, instance: &StateExecutionInstance) -> Arc<ResumeCallback> {
        Arc::new(ResumeCallback::new(
            Arc::downgrade(self),
            &instance.app_id,
            &instance.execution_uuid,
            &instance.uuid,
        ))
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    pub(crate) fn dispatch_start(self: &Arc<Self>, app_id: String, instance_id: String) {
        let inner = self.clone();
        self.dispatcher.spawn("start", async move {
            if let Err(err) = inner.start(&app_id, &instance_id).await {
                inner.fail_instance(&app_id, &instance_id, err).await;
            }
        });
    }

    pub(crate) fn dispatch_resume(
        self: &Arc<Self>,
        app_id: String,
        instance_id: String,
        responses: HashMap<String, ResponseData>,
        is_error: bool,
    ) {
        let inner = self.clone();
        self.dispatcher.spawn("resume", async move {
            if let Err(err) = inner.resume(&app_id, &instance_id, responses, is_error).await {
                inner.fail_instance(&app_id, &instance_id, err).await;
            }
        });
    }

    pub(crate) fn dispatch_abort_event(self: &Arc<Self>, instance: StateExecutionInstance) {
        let inner = self.clone();
        self.dispatcher.spawn("abort", async move {
            let _ = inner.abort_event(instance).await.log("abort handler");
        });
    }

    pub(crate) fn dispatch_paused_resume(self: &Arc<Self>, instance: StateExecutionInstance, interrupt_id: String) {
        let inner = self.clone();
        self.dispatcher.spawn("unpause", async move {
            let (app_id, instance_id) = (instance.app_id.clone(), instance.uuid.clone());
            if let Err(err) = inner.continue_paused(instance, &interrupt_id).await {
                inner.fail_instance(&app_id, &instance_id, err).await;
            }
        });
    }

    fn dispatch_recover(self: &Arc<Self>, instance: StateExecutionInstance) {
        let inner = self.clone();
        self.dispatcher.spawn("recover", async move {
            let (app_id, instance_id) = (instance.app_id.clone(), instance.uuid.clone());
            if let Err(err) = inner.recover_in_flight(instance).await {
                inner.fail_instance(&app_id, &instance_id, err).await;
            }
        });
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Continue an instance whose processing died with the previous process.
    async fn recover_in_flight(self: &Arc<Self>, instance: StateExecutionInstance) -> EngineResult<()> {
        let limit = self.config.update_retry_limit;
        let store = self.collab.instances.as_ref();
        info!(
            execution_uuid = %instance.execution_uuid,
            state = %instance.state_name,
            status = %instance.status,
            "Recovering state"
        );
        match instance.status {
            ExecutionStatus::Starting => self.proceed_from_starting(instance).await,
            ExecutionStatus::Resumed => self.proceed_from_resumed(instance).await,
            ExecutionStatus::Running => {
                let machine = self.collab.machines.get(&instance.state_machine_id).await?;
                let node = machine.state(&instance.state_name)?.clone();
                let context = self.context(instance, machine).await?;
                self.execute(context, &node).await
            }
            ExecutionStatus::Pausing => {
                update_status(store, &instance.app_id, &instance.uuid, &[ExecutionStatus::Pausing], ExecutionStatus::Paused, limit, |i| {
                    i.pause_requested = false;
                    i.pending_response = None;
                })
                .await?;
                Ok(())
            }
            ExecutionStatus::Discontinuing => {
                let final_status = self.discontinued_status(&instance).await?;
                let update = update_status(
                    store,
                    &instance.app_id,
                    &instance.uuid,
                    &[ExecutionStatus::Discontinuing],
                    final_status,
                    limit,
                    |_| {},
                )
                .await?;
                if let StatusUpdate::Applied(done) = update {
                    if done.expiry_ts.is_some_and(|expiry| expiry < Utc::now()) {
                        warn!(state = %done.state_name, "Abort window had already passed");
                    }
                    self.end_branch(&done, final_status, Vec::new()).await?;
                }
                Ok(())
            }
            status => {
                debug!(instance_id = %instance.uuid, status = %status, "Nothing to recover");
                Ok(())
            }
        }
    }

    /// EXPIRED when the latest interrupt on the instance was MARK_EXPIRED,
    /// otherwise ABORTED.
    async fn discontinued_status(&self, instance: &StateExecutionInstance) -> EngineResult<ExecutionStatus> {
        let Some(effect) = instance.interrupt_history.last() else {
            return Ok(ExecutionStatus::Aborted);
        };
        let interrupts = self
            .collab
            .interrupts
            .list_by_execution(&instance.app_id, &instance.execution_uuid)
            .await?;
        let expired = interrupts.iter().any(|i| {
            i.interrupt_id == effect.interrupt_id && i.execution_interrupt_type == ExecutionInterruptType::MarkExpired
        });
        Ok(if expired {
            ExecutionStatus::Expired
        } else {
            ExecutionStatus::Aborted
        })
    }

    async fn start(self: &Arc<Self>, app_id: &str, instance_id: &str) -> EngineResult<()> {
        let instance = self.load(app_id, instance_id).await?;
        if !matches!(instance.status, ExecutionStatus::New | ExecutionStatus::Queued) {
            debug!(instance_id = %instance_id, status = %instance.status, "Start skipped");
            return Ok(());
        }

        let limit = self.config.update_retry_limit;
        let store = self.collab.instances.as_ref();
        let pending = [ExecutionStatus::New, ExecutionStatus::Queued];

        if self.pause_all_active(app_id, &instance.execution_uuid).await? {
            update_status(store, app_id, instance_id, &pending, ExecutionStatus::Paused, limit, |i| {
                i.paused_before_start = true;
            })
            .await?;
            info!(instance_id = %instance_id, state = %instance.state_name, "Held by PAUSE_ALL");
            return Ok(());
        }

        match update_status(store, app_id, instance_id, &pending, ExecutionStatus::Starting, limit, |_| {}).await? {
            StatusUpdate::Applied(starting) => self.proceed_from_starting(starting).await,
            StatusUpdate::Rejected(found) => {
                debug!(instance_id = %instance_id, status = %found.status, "Start lost the race");
                Ok(())
            }
        }
    }

    /// Advisors, skip condition, then execute.
    pub(crate) async fn proceed_from_starting(self: &Arc<Self>, instance: StateExecutionInstance) -> EngineResult<()> {
        let machine = self.collab.machines.get(&instance.state_machine_id).await?;
        let node = machine.state(&instance.state_name)?.clone();
        let mut context = self.context(instance, machine).await?;
        let starting = [ExecutionStatus::Starting];

        let event = ExecutionEvent {
            event_type: ExecutionEventType::BeforeExecute,
            instance: context.instance(),
        };
        match node.state.handle_advice_event(&event) {
            Some(ExecutionEventAdvice::Skip { reason }) => {
                info!(state = %node.name(), reason = %reason, "Skipped by advisor");
                let response = ExecutionResponse::with_status(ExecutionStatus::Skipped).error_message(reason);
                return self.complete(context, &node, response, &starting).await;
            }
            Some(ExecutionEventAdvice::Respond(response)) => {
                debug!(state = %node.name(), "Advisor supplied the response");
                if self.mark_running(context.instance(), &starting).await? {
                    self.handle_response(context, &node, response).await?;
                }
                return Ok(());
            }
            None => {}
        }

        if let Some(condition) = node.definition.skip_condition.clone() {
            match context.evaluate_condition(&condition) {
                Ok(true) => {
                    info!(state = %node.name(), condition = %condition, "Skip condition met");
                    let response = ExecutionResponse::with_status(ExecutionStatus::Skipped)
                        .error_message(format!("Skip condition: {}", condition));
                    return self.complete(context, &node, response, &starting).await;
                }
                Ok(false) => {}
                Err(err) => {
                    warn!(state = %node.name(), error = %err, "Skip condition failed to evaluate");
                    let response = ExecutionResponse::with_status(ExecutionStatus::Error).error_message(err.to_string());
                    return self.complete(context, &node, response, &starting).await;
                }
            }
        }

        if !self.mark_running(context.instance(), &starting).await? {
            return Ok(());
        }
        self.execute(context, &node).await
    }

    async fn execute(self: &Arc<Self>, mut context: ExecutionContext, node: &StateNode) -> EngineResult<()> {
        info!(
            execution_uuid = %context.execution_uuid(),
            state = %node.name(),
            state_type = %node.state_type(),
            retry_count = context.retry_count(),
            "Executing state"
        );
        let result = node.state.execute(&mut context).await;
        let response = checked_response(node, result);
        self.handle_response(context, node, response).await
    }

    async fn resume(
        self: &Arc<Self>,
        app_id: &str,
        instance_id: &str,
        responses: HashMap<String, ResponseData>,
        is_error: bool,
    ) -> EngineResult<bool> {
        let instance = self.load(app_id, instance_id).await?;
        if instance.status != ExecutionStatus::Waiting {
            debug!(instance_id = %instance_id, status = %instance.status, "Resume ignored, instance not waiting");
            return Ok(false);
        }

        let update = update_status(
            self.collab.instances.as_ref(),
            app_id,
            instance_id,
            &[ExecutionStatus::Waiting],
            ExecutionStatus::Running,
            self.config.update_retry_limit,
            |i| i.fork_joined = i.fork_barrier,
        )
        .await?;
        let StatusUpdate::Applied(running) = update else {
            debug!(instance_id = %instance_id, "Resume lost the race");
            return Ok(false);
        };

        let machine = self.collab.machines.get(&running.state_machine_id).await?;
        let node = machine.state(&running.state_name)?.clone();
        let fork_barrier = running.fork_barrier;
        let mut context = self.context(running, machine).await?;

        info!(
            execution_uuid = %context.execution_uuid(),
            state = %node.name(),
            is_error,
            responses = responses.len(),
            "Resuming state"
        );
        let response = if fork_barrier {
            default_resume_response(&responses, is_error)
        } else {
            let result = node.state.resume(&mut context, responses, is_error).await;
            checked_response(&node, result)
        };
        self.handle_response(context, &node, response).await?;
        Ok(true)
    }

    /// Leave PAUSED through RESUMED.
    pub(crate) async fn continue_paused(
        self: &Arc<Self>,
        instance: StateExecutionInstance,
        interrupt_id: &str,
    ) -> EngineResult<()> {
        let update = update_status(
            self.collab.instances.as_ref(),
            &instance.app_id,
            &instance.uuid,
            &[ExecutionStatus::Paused],
            ExecutionStatus::Resumed,
            self.config.update_retry_limit,
            |i| record_effect(i, interrupt_id),
        )
        .await?;
        match update {
            StatusUpdate::Applied(resumed) => self.proceed_from_resumed(resumed).await,
            StatusUpdate::Rejected(found) => {
                debug!(instance_id = %found.uuid, status = %found.status, "Resume came too late");
                Ok(())
            }
        }
    }

    /// Start a RESUMED instance over or replay its parked response.
    async fn proceed_from_resumed(self: &Arc<Self>, resumed: StateExecutionInstance) -> EngineResult<()> {
        let limit = self.config.update_retry_limit;
        let store = self.collab.instances.as_ref();
        let expected = [ExecutionStatus::Resumed];

        if resumed.paused_before_start {
            let update = update_status(store, &resumed.app_id, &resumed.uuid, &expected, ExecutionStatus::Starting, limit, |i| {
                i.paused_before_start = false;
            })
            .await?;
            if let StatusUpdate::Applied(starting) = update {
                return self.proceed_from_starting(starting).await;
            }
            return Ok(());
        }

        let update = update_status(store, &resumed.app_id, &resumed.uuid, &expected, ExecutionStatus::Running, limit, |i| {
            i.pending_response = None;
        })
        .await?;
        let StatusUpdate::Applied(running) = update else {
            return Ok(());
        };

        let machine = self.collab.machines.get(&running.state_machine_id).await?;
        let node = machine.state(&running.state_name)?.clone();
        let context = self.context(running, machine).await?;
        match resumed.pending_response {
            Some(response) => {
                info!(state = %node.name(), "Replaying parked result");
                self.handle_response(context, &node, response).await
            }
            None => self.execute(context, &node).await,
        }
    }

    /// Finish a WAITING or PAUSED instance with an operator-chosen result.
    pub(crate) async fn force_complete(
        self: &Arc<Self>,
        instance: StateExecutionInstance,
        response: ExecutionResponse,
        interrupt_id: &str,
    ) -> EngineResult<()> {
        let update = update_status(
            self.collab.instances.as_ref(),
            &instance.app_id,
            &instance.uuid,
            &[ExecutionStatus::Waiting, ExecutionStatus::Paused],
            ExecutionStatus::Running,
            self.config.update_retry_limit,
            |i| {
                i.pending_response = None;
                i.pause_requested = false;
                record_effect(i, interrupt_id);
            },
        )
        .await?;
        let StatusUpdate::Applied(running) = update else {
            return Ok(());
        };
        if instance.status == ExecutionStatus::Waiting {
            self.release_wait(&running).await;
        }
        let machine = self.collab.machines.get(&running.state_machine_id).await?;
        let node = machine.state(&running.state_name)?.clone();
        let context = self.context(running, machine).await?;
        self.complete(context, &node, response, &[ExecutionStatus::Running]).await
    }

    async fn handle_response(
        self: &Arc<Self>,
        context: ExecutionContext,
        node: &StateNode,
        response: ExecutionResponse,
    ) -> EngineResult<()> {
        let current = self.load(context.app_id(), context.state_execution_instance_id()).await?;

        if response.is_async {
            return self.suspend(context, node, response).await;
        }
        if current.status == ExecutionStatus::Pausing || current.pause_requested {
            return self.park(current, response).await;
        }
        if response.execution_status.is_positive()
            && !current.fork_joined
            && !context.state_machine().fork_targets(node.name()).is_empty()
        {
            return self.fork(context, node, response).await;
        }
        self.complete(context, node, response, &[ExecutionStatus::Running]).await
    }

    async fn suspend(
        self: &Arc<Self>,
        context: ExecutionContext,
        node: &StateNode,
        response: ExecutionResponse,
    ) -> EngineResult<()> {
        let timeout = response
            .timeout_millis
            .map(Duration::from_millis)
            .or_else(|| node.state.timeout())
            .or_else(|| node.definition.timeout_millis.map(Duration::from_millis))
            .unwrap_or_else(|| self.config.default_state_timeout());
        let expiry = chrono::Duration::from_std(timeout)
            .ok()
            .and_then(|d| Utc::now().checked_add_signed(d));

        let update = update_status(
            self.collab.instances.as_ref(),
            context.app_id(),
            context.state_execution_instance_id(),
            &[ExecutionStatus::Running, ExecutionStatus::Pausing],
            ExecutionStatus::Waiting,
            self.config.update_retry_limit,
            |i| {
                if i.status == ExecutionStatus::Pausing {
                    i.pause_requested = true;
                }
                i.correlation_ids = response.correlation_ids.clone();
                i.expiry_ts = expiry;
                if response.delegate_task_id.is_some() {
                    i.delegate_task_id = response.delegate_task_id.clone();
                }
                if response.state_execution_data.is_some() {
                    i.state_execution_data = response.state_execution_data.clone();
                    i.has_inspection = true;
                }
                i.context_elements.extend(response.context_elements.iter().cloned());
            },
        )
        .await?;
        let StatusUpdate::Applied(waiting) = update else {
            debug!(state = %node.name(), "Suspend dropped, instance moved on");
            return Ok(());
        };

        self.collab
            .notifier
            .wait_for_all(response.correlation_ids.clone(), self.callback(&waiting), Some(timeout))
            .await?;
        info!(
            execution_uuid = %waiting.execution_uuid,
            state = %waiting.state_name,
            correlation_ids = ?waiting.correlation_ids,
            timeout_ms = timeout.as_millis() as u64,
            "State waiting"
        );

        for child in &response.state_execution_instances {
            let target = context.state_machine().state(&child.state_name)?;
            let mut elements = waiting.context_elements.clone();
            elements.extend(child.context_elements.iter().cloned());
            let instance = StateExecutionInstance::new(
                &waiting.app_id,
                &waiting.execution_uuid,
                &waiting.state_machine_id,
                target.name(),
                target.state_type(),
            )
            .with_parent(&waiting.uuid, &child.notify_id)
            .with_context_elements(elements);
            let saved = self.collab.instances.save(instance).await?;
            debug!(parent = %waiting.uuid, child = %saved.uuid, state = %saved.state_name, "Spawned child");
            self.dispatch_start(saved.app_id.clone(), saved.uuid.clone());
        }
        Ok(())
    }

    /// Hold the result of a paused instance until RESUME.
    async fn park(&self, current: StateExecutionInstance, response: ExecutionResponse) -> EngineResult<()> {
        let limit = self.config.update_retry_limit;
        let store = self.collab.instances.as_ref();
        if current.status == ExecutionStatus::Running {
            update_status(store, &current.app_id, &current.uuid, &[ExecutionStatus::Running], ExecutionStatus::Pausing, limit, |_| {})
                .await?;
        }
        let update = update_status(
            store,
            &current.app_id,
            &current.uuid,
            &[ExecutionStatus::Pausing],
            ExecutionStatus::Paused,
            limit,
            |i| {
                i.pause_requested = false;
                i.pending_response = Some(response.clone());
            },
        )
        .await?;
        if update.applied().is_some() {
            info!(instance_id = %current.uuid, state = %current.state_name, "State paused with parked result");
        }
        Ok(())
    }

    /// Start every FORK target and wait for all of them.
    async fn fork(
        self: &Arc<Self>,
        context: ExecutionContext,
        node: &StateNode,
        response: ExecutionResponse,
    ) -> EngineResult<()> {
        let machine = context.state_machine().clone();
        let targets = machine.fork_targets(node.name());
        let notify_ids: Vec<String> = targets.iter().map(|_| Uuid::new_v4().to_string()).collect();

        let update = update_status(
            self.collab.instances.as_ref(),
            context.app_id(),
            context.state_execution_instance_id(),
            &[ExecutionStatus::Running],
            ExecutionStatus::Waiting,
            self.config.update_retry_limit,
            |i| {
                i.fork_barrier = true;
                i.correlation_ids = notify_ids.clone();
                if response.state_execution_data.is_some() {
                    i.state_execution_data = response.state_execution_data.clone();
                    i.has_inspection = true;
                }
                i.context_elements.extend(response.context_elements.iter().cloned());
                i.context_elements.extend(response.notify_elements.iter().cloned());
            },
        )
        .await?;
        let StatusUpdate::Applied(waiting) = update else {
            return Ok(());
        };

        self.collab
            .notifier
            .wait_for_all(notify_ids.clone(), self.callback(&waiting), None)
            .await?;
        info!(
            execution_uuid = %waiting.execution_uuid,
            state = %waiting.state_name,
            branches = targets.len(),
            "Forked"
        );

        for (target, notify_id) in targets.into_iter().zip(notify_ids) {
            let child = StateExecutionInstance::new(
                &waiting.app_id,
                &waiting.execution_uuid,
                &waiting.state_machine_id,
                target.name(),
                target.state_type(),
            )
            .with_parent(&waiting.uuid, notify_id)
            .with_context_elements(waiting.context_elements.clone());
            let saved = self.collab.instances.save(child).await?;
            self.dispatch_start(saved.app_id.clone(), saved.uuid.clone());
        }
        Ok(())
    }

    /// Persist a terminal status and move the branch forward.
    async fn complete(
        self: &Arc<Self>,
        mut context: ExecutionContext,
        node: &StateNode,
        response: ExecutionResponse,
        expected: &[ExecutionStatus],
    ) -> EngineResult<()> {
        let status = response.execution_status;
        let update = update_status(
            self.collab.instances.as_ref(),
            context.app_id(),
            context.state_execution_instance_id(),
            expected,
            status,
            self.config.update_retry_limit,
            |i| {
                if response.error_message.is_some() {
                    i.error_message = response.error_message.clone();
                }
                i.failure_types.extend(response.failure_types.iter().copied());
                if response.state_execution_data.is_some() {
                    i.state_execution_data = response.state_execution_data.clone();
                    i.has_inspection = true;
                }
                if response.delegate_task_id.is_some() {
                    i.delegate_task_id = response.delegate_task_id.clone();
                }
                i.context_elements.extend(response.context_elements.iter().cloned());
            },
        )
        .await?;
        let finished = match update {
            StatusUpdate::Applied(finished) => finished,
            StatusUpdate::Rejected(found) => {
                debug!(state = %node.name(), status = %found.status, "Completion dropped, instance moved on");
                return Ok(());
            }
        };
        info!(
            execution_uuid = %finished.execution_uuid,
            state = %finished.state_name,
            status = %status,
            error = ?finished.error_message,
            "State finished"
        );

        for element in response.context_elements.iter().chain(&response.notify_elements) {
            context.push_context_element(element.clone());
        }
        if let Some(data) = &finished.state_execution_data {
            context.record_state_output(&finished.state_name, data.clone());
        }
        context.reset_prepared_cache();

        let next = match select_next(&mut context, node, status) {
            Ok(next) => next,
            Err(err) => {
                error!(state = %node.name(), error = %err, "Transition guard failed");
                return self.end_branch(&finished, ExecutionStatus::Error, response.notify_elements).await;
            }
        };

        match next {
            Some(next) => {
                let mut successor = finished.next_for(next.name(), next.state_type());
                successor.context_elements.extend(response.notify_elements.iter().cloned());
                let saved = self.collab.instances.save(successor).await?;
                debug!(from = %finished.state_name, to = %saved.state_name, "Transition selected");
                self.dispatch_start(saved.app_id.clone(), saved.uuid.clone());
                Ok(())
            }
            None => self.end_branch(&finished, status, response.notify_elements).await,
        }
    }

    /// Report a branch result to the waiting parent or record the outcome.
    pub(crate) async fn end_branch(
        &self,
        instance: &StateExecutionInstance,
        status: ExecutionStatus,
        notify_elements: Vec<ContextElement>,
    ) -> EngineResult<()> {
        match &instance.notify_id {
            Some(notify_id) => {
                let data = ResponseData::Status(ExecutionStatusData {
                    instance_id: instance.uuid.clone(),
                    status,
                    notify_elements,
                });
                if !self.collab.notifier.done_with(notify_id, data).await? {
                    info!(notify_id = %notify_id, instance_id = %instance.uuid, "Branch result already delivered");
                }
                Ok(())
            }
            None => {
                info!(execution_uuid = %instance.execution_uuid, status = %status, "Execution finished");
                self.collab
                    .instances
                    .record_outcome(ExecutionOutcome {
                        app_id: instance.app_id.clone(),
                        execution_uuid: instance.execution_uuid.clone(),
                        status,
                        finished_at: Utc::now(),
                    })
                    .await
            }
        }
    }

    /// Drop the notifier wait of an instance that left WAITING by other means.
    pub(crate) async fn release_wait(&self, instance: &StateExecutionInstance) {
        if instance.correlation_ids.is_empty() {
            return;
        }
        let _ = self
            .collab
            .notifier
            .cancel(&instance.correlation_ids)
            .await
            .log("cancelling wait");
    }

    async fn abort_event(&self, instance: StateExecutionInstance) -> EngineResult<()> {
        let machine = self.collab.machines.get(&instance.state_machine_id).await?;
        let node = machine.state(&instance.state_name)?.clone();
        let mut context = self.context(instance, machine).await?;
        debug!(state = %node.name(), "Running abort handler");
        node.state.handle_abort_event(&mut context).await;
        Ok(())
    }

    /// Best effort: move an instance whose processing failed to ERROR.
    async fn fail_instance(&self, app_id: &str, instance_id: &str, err: EngineError) {
        error!(instance_id = %instance_id, error = %err, "Instance processing failed");
        let Ok(instance) = self.load(app_id, instance_id).await else {
            return;
        };
        let target = match instance.status {
            ExecutionStatus::Starting | ExecutionStatus::Running | ExecutionStatus::Pausing => ExecutionStatus::Error,
            ExecutionStatus::Waiting => ExecutionStatus::Failed,
            _ => return,
        };
        let message = err.to_string();
        let update = update_status(
            self.collab.instances.as_ref(),
            app_id,
            instance_id,
            &[instance.status],
            target,
            self.config.update_retry_limit,
            |i| i.error_message = Some(message.clone()),
        )
        .await
        .log("marking instance failed");
        if let Ok(StatusUpdate::Applied(failed)) = update {
            if instance.status == ExecutionStatus::Waiting {
                self.release_wait(&failed).await;
            }
            let _ = self.end_branch(&failed, target, Vec::new()).await.log("ending failed branch");
        }
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    async fn mark_running(&self, instance: &StateExecutionInstance, expected: &[ExecutionStatus]) -> EngineResult<bool> {
        let update = update_status(
            self.collab.instances.as_ref(),
            &instance.app_id,
            &instance.uuid,
            expected,
            ExecutionStatus::Running,
            self.config.update_retry_limit,
            |_| {},
        )
        .await?;
        Ok(update.applied().is_some())
    }

    pub(crate) async fn load(&self, app_id: &str, instance_id: &str) -> EngineResult<StateExecutionInstance> {
        self.collab
            .instances
            .load(app_id, instance_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("state execution instance {}", instance_id)))
    }

    async fn context(&self, instance: StateExecutionInstance, machine: Arc<StateMachine>) -> EngineResult<ExecutionContext> {
        let upstream = self.upstream_outputs(&instance).await?;
        Ok(
            ExecutionContext::new(instance, machine, self.renderer.clone(), &self.collab.services, &self.config)
                .with_upstream_outputs(upstream),
        )
    }

    /// Outputs of the execution's successful instances, later runs winning.
    async fn upstream_outputs(&self, instance: &StateExecutionInstance) -> EngineResult<Map<String, serde_json::Value>> {
        let mut outputs = Map::new();
        for other in self
            .collab
            .instances
            .list_by_execution(&instance.app_id, &instance.execution_uuid)
            .await?
        {
            if other.uuid == instance.uuid || other.status != ExecutionStatus::Success {
                continue;
            }
            if let Some(data) = other.state_execution_data {
                outputs.insert(normalize_state_name(&other.state_name), data);
            }
        }
        Ok(outputs)
    }

    /// Whether the latest seized PAUSE_ALL/RESUME_ALL is a PAUSE_ALL.
    async fn pause_all_active(&self, app_id: &str, execution_uuid: &str) -> EngineResult<bool> {
        let interrupts = self.collab.interrupts.list_by_execution(app_id, execution_uuid).await?;
        Ok(interrupts
            .iter()
            .filter(|i| i.seized)
            .filter(|i| {
                matches!(
                    i.execution_interrupt_type,
                    ExecutionInterruptType::PauseAll | ExecutionInterruptType::ResumeAll
                )
            })
            .max_by_key(|i| i.created_at)
            .is_some_and(|i| i.execution_interrupt_type == ExecutionInterruptType::PauseAll))
    }
}

/// Record that an interrupt took effect on an instance.
pub(crate) fn record_effect(instance: &mut StateExecutionInstance, interrupt_id: &str) {
    instance.interrupt_history.push(crate::instance::ExecutionInterruptEffect {
        interrupt_id: interrupt_id.to_string(),
        took_effect_at: Utc::now(),
    });
}

/// Turn a contract failure or malformed response into FAILED.
fn checked_response(node: &StateNode, result: EngineResult<ExecutionResponse>) -> ExecutionResponse {
    match result.and_then(|response| response.validate().map(|_| response)) {
        Ok(response) => response,
        Err(err) => {
            warn!(state = %node.name(), error = %err, "State contract failed");
            ExecutionResponse::failed(err.to_string())
        }
    }
}

/// Next node for a finished instance.
///
/// Positive results try REPEAT, then CONDITIONAL, then SUCCESS; ABORTED
/// follows ABORT; broken results follow FAILURE.
fn select_next(
    context: &mut ExecutionContext,
    node: &StateNode,
    status: ExecutionStatus,
) -> EngineResult<Option<StateNode>> {
    let candidates: &[TransitionType] = if status.is_positive() {
        &[TransitionType::Repeat, TransitionType::Conditional, TransitionType::Success]
    } else if status == ExecutionStatus::Aborted {
        &[TransitionType::Abort]
    } else if status.is_broken() {
        &[TransitionType::Failure]
    } else {
        &[]
    };

    let machine = context.state_machine().clone();
    for transition_type in candidates {
        if let Some(next) = machine.next_transition(node.name(), *transition_type, context)? {
            return Ok(Some(next.clone()));
        }
    }
    Ok(None)
}
