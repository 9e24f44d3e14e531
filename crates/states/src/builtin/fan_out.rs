//! Dynamic fan-out over a rendered item list.

use async_trait::async_trait;
use serde_json::{json, Map};
use uuid::Uuid;

use pipewright_engine::context::{ContextElement, ExecutionContext, ParamElement};
use pipewright_engine::graph::StateDefinition;
use pipewright_engine::state::{ExecutionResponse, SpawnedInstance, State};
use pipewright_engine::{EngineError, EngineResult};

use crate::error::StateError;

/// Name children read their item under unless `param` says otherwise.
pub const DEFAULT_PARAM: &str = "repeat";

/// Renders `items` to a list and starts `child_state` once per item.
///
/// Each child sees `${repeat.item}` and `${repeat.index}`. The state waits
/// for every child branch and finishes with the worst child status.
pub struct FanOutState {
    items: String,
    child_state: String,
    param: String,
}

impl FanOutState {
    pub fn from_definition(definition: &StateDefinition) -> Result<Self, StateError> {
        let required = |key: &str| {
            definition
                .property_str(key)
                .map(str::to_string)
                .ok_or_else(|| StateError::Configuration(format!("fan_out '{}' needs '{}'", definition.name, key)))
        };
        Ok(Self {
            items: required("items")?,
            child_state: required("child_state")?,
            param: definition.property_str("param").unwrap_or(DEFAULT_PARAM).to_string(),
        })
    }
}

/// One spawned child per item, each with a fresh notify id.
pub fn spawn_children(items: &[String], child_state: &str, param: &str) -> Vec<SpawnedInstance> {
    items
        .iter()
        .enumerate()
        .map(|(index, item)| {
            let mut params = Map::new();
            params.insert("item".to_string(), json!(item));
            params.insert("index".to_string(), json!(index));
            SpawnedInstance {
                state_name: child_state.to_string(),
                notify_id: Uuid::new_v4().to_string(),
                context_elements: vec![ContextElement::Param(ParamElement {
                    name: param.to_string(),
                    params,
                })],
            }
        })
        .collect()
}

#[async_trait]
impl State for FanOutState {
    fn state_type(&self) -> &str {
        "fan_out"
    }

    async fn execute(&self, context: &mut ExecutionContext) -> EngineResult<ExecutionResponse> {
        if context.state_machine().get_state(&self.child_state).is_none() {
            return Err(EngineError::Validation(format!(
                "fan_out child state '{}' is not in the workflow",
                self.child_state
            )));
        }

        let items = context.render_expression_list(&self.items)?;
        let data = json!({ "items": items });
        if items.is_empty() {
            tracing::info!(state = %context.state_name(), "Nothing to fan out");
            return Ok(ExecutionResponse::success().state_execution_data(data));
        }

        let children = spawn_children(&items, &self.child_state, &self.param);
        tracing::info!(
            execution_uuid = %context.execution_uuid(),
            state = %context.state_name(),
            child_state = %self.child_state,
            count = children.len(),
            "Fanning out"
        );

        let mut response = ExecutionResponse::async_on(children.iter().map(|c| c.notify_id.clone()))
            .state_execution_data(data);
        response.state_execution_instances = children;
        Ok(response)
    }
}
