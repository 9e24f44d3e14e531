//! Serializable workflow definitions.
//!
//! A definition is what authors write (YAML or JSON); it is compiled into
//! an immutable [`StateMachine`](super::StateMachine) against a registry.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::TransitionType;
use crate::error::{EngineError, EngineResult};

/// One node of a workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub state_type: String,
    #[serde(default)]
    pub properties: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_millis: Option<u64>,
    /// Expression; when true the node finishes as SKIPPED without executing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_condition: Option<String>,
}

impl StateDefinition {
    pub fn new(name: impl Into<String>, state_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state_type: state_type.into(),
            properties: Map::new(),
            timeout_millis: None,
            skip_condition: None,
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    pub fn with_skip_condition(mut self, condition: impl Into<String>) -> Self {
        self.skip_condition = Some(condition.into());
        self
    }

    pub fn property_str(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(Value::as_str)
    }

    /// Required string property.
    ///
    /// # Errors
    ///
    /// Returns `Validation` naming the node when the property is missing.
    pub fn require_str(&self, key: &str) -> EngineResult<&str> {
        self.property_str(key).ok_or_else(|| {
            EngineError::Validation(format!(
                "state '{}' requires string property '{}'",
                self.name, key
            ))
        })
    }

    /// Deserialize a property into a typed value.
    pub fn property<T: DeserializeOwned>(&self, key: &str) -> EngineResult<Option<T>> {
        self.properties
            .get(key)
            .map(|v| serde_json::from_value(v.clone()))
            .transpose()
            .map_err(EngineError::from)
    }
}

/// One edge of a workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionDefinition {
    pub from: String,
    pub to: String,
    #[serde(rename = "type", default = "default_transition_type")]
    pub transition_type: TransitionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

fn default_transition_type() -> TransitionType {
    TransitionType::Success
}

/// A complete workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    pub initial_state: String,
    pub states: Vec<StateDefinition>,
    #[serde(default)]
    pub transitions: Vec<TransitionDefinition>,
}

impl WorkflowDefinition {
    /// Parse a YAML definition.
    pub fn from_yaml(source: &str) -> EngineResult<Self> {
        Ok(serde_yaml::from_str(source)?)
    }

    /// Parse a JSON definition.
    pub fn from_json(source: &str) -> EngineResult<Self> {
        serde_json::from_str(source).map_err(|e| EngineError::Parse(e.to_string()))
    }
}
