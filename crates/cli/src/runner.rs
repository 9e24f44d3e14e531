//! Local workflow runner.
//!
//! Runs a definition against in-memory collaborators and reports the
//! per-state results once the execution has nothing left to do.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::{json, Map, Value};

use pipewright_engine::config::EngineConfig;
use pipewright_engine::context::{ContextElement, WorkflowStandardParams};
use pipewright_engine::engine::{Collaborators, StateMachineExecutor};
use pipewright_engine::graph::{StateMachine, WorkflowDefinition};
use pipewright_engine::instance::{ExecutionStatus, StateExecutionInstance};
use pipewright_engine::notify::WaitNotifyEngine;
use pipewright_engine::secrets::LocalSecretStore;
use pipewright_engine::state::ResponseData;
use pipewright_states::create_default_registry;

/// App id used for local runs.
pub const LOCAL_APP: &str = "local";

/// Decision delivered to approval gates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Approve,
    Reject,
}

impl Decision {
    fn action(self) -> &'static str {
        match self {
            Decision::Approve => "APPROVE",
            Decision::Reject => "REJECT",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Exposed as `${workflow.variables.<key>}`.
    pub variables: HashMap<String, String>,
    /// Stored in the local secret store, read as `${secrets.<key>}`.
    pub secrets: HashMap<String, String>,
    pub decision: Option<Decision>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateReport {
    pub state: String,
    pub status: ExecutionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl From<&StateExecutionInstance> for StateReport {
    fn from(instance: &StateExecutionInstance) -> Self {
        Self {
            state: instance.state_name.clone(),
            status: instance.status,
            error: instance.error_message.clone(),
            data: instance.state_execution_data.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub workflow: String,
    pub execution_uuid: String,
    /// `None` while some branch is still waiting.
    pub outcome: Option<ExecutionStatus>,
    pub states: Vec<StateReport>,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.outcome.is_some_and(|s| s.is_positive())
    }

    pub fn waiting(&self) -> Vec<&StateReport> {
        self.states.iter().filter(|s| s.status == ExecutionStatus::Waiting).collect()
    }
}

/// Parse key=value pairs.
pub fn parse_pairs(pairs: &[String]) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("Invalid variable format: {}. Expected key=value", pair))?;
        if key.is_empty() {
            anyhow::bail!("Invalid variable format: {}. Key is empty", pair);
        }
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}

/// Load and compile a definition against the built-in states.
pub fn compile(source: &str) -> Result<(WorkflowDefinition, StateMachine)> {
    let definition = WorkflowDefinition::from_yaml(source).context("Failed to parse workflow definition")?;
    let machine = StateMachine::from_definition(LOCAL_APP, &definition, &create_default_registry())
        .with_context(|| format!("Invalid workflow '{}'", definition.name))?;
    Ok((definition, machine))
}

pub async fn run_workflow(source: &str, config: EngineConfig, options: &RunOptions) -> Result<RunReport> {
    let (definition, _) = compile(source)?;

    let store = Arc::new(LocalSecretStore::from_config(&config).context("Failed to open secret store")?);
    for (name, value) in &options.secrets {
        store.put_secret(name, value)?;
    }

    let executor = StateMachineExecutor::new(config, Collaborators::in_memory(WaitNotifyEngine::new(), store))?;
    let machine = executor
        .register_workflow(LOCAL_APP, &definition, &create_default_registry())
        .await?;

    let variables: Map<String, Value> = options
        .variables
        .iter()
        .map(|(k, v)| (k.clone(), json!(v)))
        .collect();
    let standard = ContextElement::Standard(WorkflowStandardParams {
        app_id: LOCAL_APP.to_string(),
        workflow_variables: variables,
        triggered_by: Some("cli".to_string()),
        ..Default::default()
    });

    let first = executor
        .start_execution(LOCAL_APP, &machine.uuid, vec![standard])
        .await?;
    let execution_uuid = first.execution_uuid;
    tracing::info!(workflow = %definition.name, execution_uuid = %execution_uuid, "Execution started");
    executor.wait_idle().await;

    if let Some(decision) = options.decision {
        while deliver_decisions(&executor, &execution_uuid, decision).await? > 0 {
            executor.wait_idle().await;
        }
    }

    let instances = executor.instances(LOCAL_APP, &execution_uuid).await?;
    let outcome = executor.outcome(LOCAL_APP, &execution_uuid).await?.map(|o| o.status);
    Ok(RunReport {
        workflow: definition.name,
        execution_uuid,
        outcome,
        states: instances.iter().map(StateReport::from).collect(),
    })
}

/// Answer every open approval gate; returns how many were answered.
async fn deliver_decisions(executor: &StateMachineExecutor, execution_uuid: &str, decision: Decision) -> Result<usize> {
    let notifier = executor.collaborators().notifier.clone();
    let mut delivered = 0;
    for gate in executor
        .instances(LOCAL_APP, execution_uuid)
        .await?
        .into_iter()
        .filter(|i| i.status == ExecutionStatus::Waiting && i.state_type == "approval")
    {
        for approval_id in &gate.correlation_ids {
            let payload = ResponseData::payload(json!({ "action": decision.action(), "approvedBy": "cli" }));
            if notifier.done_with(approval_id, payload).await? {
                tracing::info!(state = %gate.state_name, action = decision.action(), "Approval delivered");
                delivered += 1;
            }
        }
    }
    Ok(delivered)
}
