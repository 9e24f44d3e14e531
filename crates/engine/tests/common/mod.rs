//! Shared harness for engine scenario tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Notify;

use pipewright_engine::config::EngineConfig;
use pipewright_engine::context::ExecutionContext;
use pipewright_engine::engine::{Collaborators, InterruptOutcome, StateMachineExecutor};
use pipewright_engine::graph::{StateMachine, WorkflowDefinition};
use pipewright_engine::instance::{ExecutionInterrupt, ExecutionInterruptType, ExecutionStatus, StateExecutionInstance};
use pipewright_engine::notify::{WaitNotify, WaitNotifyEngine};
use pipewright_engine::secrets::LocalSecretStore;
use pipewright_engine::state::{
    default_resume_response, ExecutionEvent, ExecutionEventAdvice, ExecutionResponse, ResponseData, State,
    StateRegistry,
};
use pipewright_engine::store::{ExecutionOutcome, InMemoryStateExecutionStore, StateExecutionStore};
use pipewright_engine::EngineResult;

pub const APP: &str = "app-1";

/// Records what the test states were asked to do.
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<String>>,
    pub release: Notify,
}

impl Recorder {
    fn record(&self, event: &str, state: &str) {
        self.events.lock().unwrap().push(format!("{}:{}", event, state));
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, event: &str, state: &str) -> usize {
        let needle = format!("{}:{}", event, state);
        self.events().iter().filter(|e| **e == needle).count()
    }
}

/// Finishes with the `status` property (SUCCESS by default) and publishes `output`.
struct SyncState {
    recorder: Arc<Recorder>,
    status: ExecutionStatus,
    output: Option<serde_json::Value>,
}

#[async_trait]
impl State for SyncState {
    fn state_type(&self) -> &str {
        "sync"
    }

    async fn execute(&self, context: &mut ExecutionContext) -> EngineResult<ExecutionResponse> {
        self.recorder.record("execute", context.state_name());
        let mut response = ExecutionResponse::with_status(self.status);
        if let Some(output) = &self.output {
            response = response.state_execution_data(output.clone());
        }
        Ok(response)
    }
}

/// Suspends on the `correlation` property.
struct AsyncState {
    recorder: Arc<Recorder>,
    correlation: String,
}

#[async_trait]
impl State for AsyncState {
    fn state_type(&self) -> &str {
        "async"
    }

    async fn execute(&self, context: &mut ExecutionContext) -> EngineResult<ExecutionResponse> {
        self.recorder.record("execute", context.state_name());
        Ok(ExecutionResponse::async_on([self.correlation.clone()]))
    }

    async fn resume(
        &self,
        context: &mut ExecutionContext,
        responses: HashMap<String, ResponseData>,
        is_error: bool,
    ) -> EngineResult<ExecutionResponse> {
        self.recorder.record("resume", context.state_name());
        Ok(default_resume_response(&responses, is_error))
    }

    async fn handle_abort_event(&self, context: &mut ExecutionContext) {
        self.recorder.record("abort", context.state_name());
    }
}

/// Blocks in execute until the recorder releases it.
struct HoldState {
    recorder: Arc<Recorder>,
}

#[async_trait]
impl State for HoldState {
    fn state_type(&self) -> &str {
        "hold"
    }

    async fn execute(&self, context: &mut ExecutionContext) -> EngineResult<ExecutionResponse> {
        self.recorder.record("execute", context.state_name());
        self.recorder.release.notified().await;
        Ok(ExecutionResponse::success())
    }
}

/// Renders the `expression` property plain and secured.
struct RenderState {
    recorder: Arc<Recorder>,
    expression: String,
}

#[async_trait]
impl State for RenderState {
    fn state_type(&self) -> &str {
        "render"
    }

    async fn execute(&self, context: &mut ExecutionContext) -> EngineResult<ExecutionResponse> {
        self.recorder.record("execute", context.state_name());
        let plain = context.render_expression(&self.expression)?;
        let secured = context.render_expression_secured(&self.expression)?;
        Ok(ExecutionResponse::success().state_execution_data(json!({
            "plain": plain,
            "secured": secured,
        })))
    }
}

/// Answers the advice event with the `advice` property: `skip` or `respond`.
struct AdvisedState {
    recorder: Arc<Recorder>,
    advice: String,
}

#[async_trait]
impl State for AdvisedState {
    fn state_type(&self) -> &str {
        "advised"
    }

    async fn execute(&self, context: &mut ExecutionContext) -> EngineResult<ExecutionResponse> {
        self.recorder.record("execute", context.state_name());
        Ok(ExecutionResponse::success())
    }

    fn handle_advice_event(&self, event: &ExecutionEvent<'_>) -> Option<ExecutionEventAdvice> {
        self.recorder.record("advice", &event.instance.state_name);
        match self.advice.as_str() {
            "skip" => Some(ExecutionEventAdvice::Skip {
                reason: "maintenance window".to_string(),
            }),
            "respond" => Some(ExecutionEventAdvice::Respond(
                ExecutionResponse::success().state_execution_data(json!({ "cached": true })),
            )),
            _ => None,
        }
    }
}

pub fn registry(recorder: &Arc<Recorder>) -> StateRegistry {
    let mut registry = StateRegistry::new();

    let p = recorder.clone();
    registry.register("sync", move |def| {
        let status = match def.property_str("status") {
            Some(s) => s.parse()?,
            None => ExecutionStatus::Success,
        };
        Ok(Arc::new(SyncState {
            recorder: p.clone(),
            status,
            output: def.properties.get("output").cloned(),
        }) as Arc<dyn State>)
    });

    let p = recorder.clone();
    registry.register("async", move |def| {
        Ok(Arc::new(AsyncState {
            recorder: p.clone(),
            correlation: def.property_str("correlation").unwrap_or(&def.name).to_string(),
        }) as Arc<dyn State>)
    });

    let p = recorder.clone();
    registry.register("hold", move |_| Ok(Arc::new(HoldState { recorder: p.clone() }) as Arc<dyn State>));

    let p = recorder.clone();
    registry.register("render", move |def| {
        Ok(Arc::new(RenderState {
            recorder: p.clone(),
            expression: def.require_str("expression")?.to_string(),
        }) as Arc<dyn State>)
    });

    let p = recorder.clone();
    registry.register("advised", move |def| {
        Ok(Arc::new(AdvisedState {
            recorder: p.clone(),
            advice: def.property_str("advice").unwrap_or("none").to_string(),
        }) as Arc<dyn State>)
    });

    registry
}

/// Instance store whose listings take a while, widening check-then-act windows.
pub struct SlowListing {
    inner: InMemoryStateExecutionStore,
    delay: Duration,
}

impl SlowListing {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: InMemoryStateExecutionStore::new(),
            delay,
        }
    }
}

#[async_trait]
impl StateExecutionStore for SlowListing {
    async fn save(&self, instance: StateExecutionInstance) -> EngineResult<StateExecutionInstance> {
        self.inner.save(instance).await
    }
    async fn load(&self, app_id: &str, id: &str) -> EngineResult<Option<StateExecutionInstance>> {
        self.inner.load(app_id, id).await
    }
    async fn update(&self, instance: StateExecutionInstance) -> EngineResult<StateExecutionInstance> {
        self.inner.update(instance).await
    }
    async fn list_by_execution(&self, app_id: &str, exec: &str) -> EngineResult<Vec<StateExecutionInstance>> {
        tokio::time::sleep(self.delay).await;
        self.inner.list_by_execution(app_id, exec).await
    }
    async fn record_outcome(&self, outcome: ExecutionOutcome) -> EngineResult<()> {
        self.inner.record_outcome(outcome).await
    }
    async fn outcome(&self, app_id: &str, exec: &str) -> EngineResult<Option<ExecutionOutcome>> {
        self.inner.outcome(app_id, exec).await
    }
}

pub struct Harness {
    pub executor: StateMachineExecutor,
    pub notifier: WaitNotifyEngine,
    pub secrets: Arc<LocalSecretStore>,
    pub recorder: Arc<Recorder>,
    pub registry: StateRegistry,
}

impl Harness {
    pub fn new() -> Self {
        let config = EngineConfig::default();
        let secrets = Arc::new(LocalSecretStore::from_config(&config).unwrap());
        let notifier = WaitNotifyEngine::new();
        Self::with_collaborators(Collaborators::in_memory(notifier.clone(), secrets.clone()), notifier, secrets)
    }

    /// In-memory harness over a custom instance store.
    pub fn with_instances(instances: Arc<dyn StateExecutionStore>) -> Self {
        let config = EngineConfig::default();
        let secrets = Arc::new(LocalSecretStore::from_config(&config).unwrap());
        let notifier = WaitNotifyEngine::new();
        let mut collaborators = Collaborators::in_memory(notifier.clone(), secrets.clone());
        collaborators.instances = instances;
        Self::with_collaborators(collaborators, notifier, secrets)
    }

    fn with_collaborators(collaborators: Collaborators, notifier: WaitNotifyEngine, secrets: Arc<LocalSecretStore>) -> Self {
        let recorder = Arc::new(Recorder::default());
        Self {
            executor: StateMachineExecutor::new(EngineConfig::default(), collaborators).unwrap(),
            notifier,
            secrets,
            registry: registry(&recorder),
            recorder,
        }
    }

    /// A fresh executor and notifier over the same stores, as after a
    /// process restart. The recorder is shared.
    pub fn restart(&self) -> Self {
        let notifier = WaitNotifyEngine::new();
        let mut collaborators = self.executor.collaborators().clone();
        collaborators.notifier = Arc::new(notifier.clone());
        Self {
            executor: StateMachineExecutor::new(EngineConfig::default(), collaborators).unwrap(),
            notifier,
            secrets: self.secrets.clone(),
            registry: registry(&self.recorder),
            recorder: self.recorder.clone(),
        }
    }

    pub async fn register(&self, yaml: &str) -> Arc<StateMachine> {
        let definition = WorkflowDefinition::from_yaml(yaml).unwrap();
        self.executor
            .register_workflow(APP, &definition, &self.registry)
            .await
            .unwrap()
    }

    /// Register, start and run until idle; returns the execution uuid.
    pub async fn run(&self, yaml: &str) -> String {
        let machine = self.register(yaml).await;
        let first = self
            .executor
            .start_execution(APP, &machine.uuid, vec![])
            .await
            .unwrap();
        self.executor.wait_idle().await;
        first.execution_uuid
    }

    pub async fn instances(&self, execution_uuid: &str) -> Vec<StateExecutionInstance> {
        self.executor.instances(APP, execution_uuid).await.unwrap()
    }

    /// Instances of one state, oldest first.
    pub async fn of(&self, execution_uuid: &str, state: &str) -> Vec<StateExecutionInstance> {
        self.instances(execution_uuid)
            .await
            .into_iter()
            .filter(|i| i.state_name == state)
            .collect()
    }

    pub async fn only(&self, execution_uuid: &str, state: &str) -> StateExecutionInstance {
        let mut found = self.of(execution_uuid, state).await;
        assert_eq!(found.len(), 1, "expected one instance of {}", state);
        found.remove(0)
    }

    pub async fn outcome(&self, execution_uuid: &str) -> Option<ExecutionStatus> {
        self.executor
            .outcome(APP, execution_uuid)
            .await
            .unwrap()
            .map(|o| o.status)
    }

    pub async fn deliver(&self, correlation_id: &str, response: ResponseData) -> bool {
        let delivered = self.notifier.done_with(correlation_id, response).await.unwrap();
        self.executor.wait_idle().await;
        delivered
    }

    pub async fn interrupt_instance(
        &self,
        kind: ExecutionInterruptType,
        instance: &StateExecutionInstance,
    ) -> InterruptOutcome {
        let interrupt = ExecutionInterrupt::for_instance(kind, APP, &instance.execution_uuid, &instance.uuid);
        let outcome = self
            .executor
            .interrupt_manager()
            .register_execution_interrupt(interrupt)
            .await
            .unwrap();
        self.executor.wait_idle().await;
        outcome
    }

    pub async fn interrupt_execution(&self, kind: ExecutionInterruptType, execution_uuid: &str) -> InterruptOutcome {
        let interrupt = ExecutionInterrupt::for_execution(kind, APP, execution_uuid);
        let outcome = self
            .executor
            .interrupt_manager()
            .register_execution_interrupt(interrupt)
            .await
            .unwrap();
        self.executor.wait_idle().await;
        outcome
    }

    /// Poll until the state has an instance in `status`.
    pub async fn wait_for_status(&self, execution_uuid: &str, state: &str, status: ExecutionStatus) -> StateExecutionInstance {
        for _ in 0..500 {
            if let Some(found) = self
                .of(execution_uuid, state)
                .await
                .into_iter()
                .find(|i| i.status == status)
            {
                return found;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("{} never reached {}", state, status);
    }
}

pub fn payload() -> ResponseData {
    ResponseData::payload(json!({"ok": true}))
}
