//! Context elements and the per-run element stack.
//!
//! Elements are pushed by ancestor states and are visible to every state
//! that runs after them in the same branch. Lookup is by type tag and
//! optional name, newest first.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Name under which the phase element is registered as a PARAM element.
pub const PHASE_PARAM: &str = "PHASE_PARAM";

/// Type tag of a context element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContextElementType {
    Standard,
    Service,
    InfrastructureMapping,
    Instance,
    Environment,
    Param,
}

/// Workflow-wide parameters pushed when an execution starts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStandardParams {
    pub app_id: String,
    #[serde(default)]
    pub workflow_variables: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_execution_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggered_by: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceElement {
    pub uuid: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InfraMappingElement {
    pub uuid: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceElement {
    pub uuid: String,
    pub host_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentElement {
    pub uuid: String,
    pub name: String,
    #[serde(default = "default_environment_type")]
    pub environment_type: String,
}

fn default_environment_type() -> String {
    "NON_PROD".to_string()
}

/// A service variable value overridden for one phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableOverride {
    pub name: String,
    pub value: String,
}

/// Deployment phase; registered as PARAM element named [`PHASE_PARAM`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseElement {
    pub uuid: String,
    pub phase_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_id: Option<String>,
    #[serde(default)]
    pub variable_overrides: Vec<VariableOverride>,
}

/// Free-form named parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamElement {
    pub name: String,
    #[serde(default)]
    pub params: Map<String, Value>,
}

/// A typed value on the context-element stack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "element", rename_all = "snake_case")]
pub enum ContextElement {
    Standard(WorkflowStandardParams),
    Service(ServiceElement),
    InfrastructureMapping(InfraMappingElement),
    Instance(InstanceElement),
    Environment(EnvironmentElement),
    Phase(PhaseElement),
    Param(ParamElement),
}

impl ContextElement {
    /// Type tag used for lookups.
    pub fn element_type(&self) -> ContextElementType {
        match self {
            Self::Standard(_) => ContextElementType::Standard,
            Self::Service(_) => ContextElementType::Service,
            Self::InfrastructureMapping(_) => ContextElementType::InfrastructureMapping,
            Self::Instance(_) => ContextElementType::Instance,
            Self::Environment(_) => ContextElementType::Environment,
            Self::Phase(_) | Self::Param(_) => ContextElementType::Param,
        }
    }

    /// Optional name used to disambiguate elements of the same type.
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Standard(_) => None,
            Self::Service(s) => Some(&s.name),
            Self::InfrastructureMapping(i) => Some(&i.name),
            Self::Instance(i) => Some(&i.host_name),
            Self::Environment(e) => Some(&e.name),
            Self::Phase(_) => Some(PHASE_PARAM),
            Self::Param(p) => Some(&p.name),
        }
    }

    /// Expression variables contributed by this element.
    pub fn param_map(&self) -> Map<String, Value> {
        let mut map = Map::new();
        match self {
            Self::Standard(s) => {
                map.insert(
                    "workflow".to_string(),
                    json!({
                        "variables": s.workflow_variables,
                        "pipelineExecutionId": s.pipeline_execution_id,
                        "triggeredBy": s.triggered_by,
                    }),
                );
                map.insert("app".to_string(), json!({ "uuid": s.app_id }));
            }
            Self::Service(s) => {
                map.insert("service".to_string(), json!({ "uuid": s.uuid, "name": s.name }));
            }
            Self::InfrastructureMapping(i) => {
                map.insert(
                    "infra".to_string(),
                    json!({
                        "uuid": i.uuid,
                        "name": i.name,
                        "kubernetes": { "namespace": i.namespace },
                        "deploymentType": i.deployment_type,
                    }),
                );
            }
            Self::Instance(i) => {
                map.insert(
                    "instance".to_string(),
                    json!({
                        "uuid": i.uuid,
                        "hostName": i.host_name,
                        "displayName": i.display_name.as_deref().unwrap_or(&i.host_name),
                    }),
                );
                map.insert("host".to_string(), json!({ "name": i.host_name }));
            }
            Self::Environment(e) => {
                map.insert(
                    "env".to_string(),
                    json!({ "uuid": e.uuid, "name": e.name, "environmentType": e.environment_type }),
                );
            }
            Self::Phase(p) => {
                map.insert(
                    "phase".to_string(),
                    json!({ "uuid": p.uuid, "name": p.phase_name, "serviceId": p.service_id }),
                );
            }
            Self::Param(p) => {
                map.insert(p.name.clone(), Value::Object(p.params.clone()));
            }
        }
        map
    }
}

/// Ordered stack of context elements, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextElementStack {
    elements: Vec<ContextElement>,
}

impl ContextElementStack {
    pub fn new(elements: Vec<ContextElement>) -> Self {
        Self { elements }
    }

    pub fn push(&mut self, element: ContextElement) {
        self.elements.push(element);
    }

    pub fn extend<I: IntoIterator<Item = ContextElement>>(&mut self, elements: I) {
        self.elements.extend(elements);
    }

    /// Most recently pushed element matching the type and, if given, the name.
    pub fn find(&self, element_type: ContextElementType, name: Option<&str>) -> Option<&ContextElement> {
        self.elements.iter().rev().find(|e| {
            e.element_type() == element_type && name.map_or(true, |n| e.name() == Some(n))
        })
    }

    /// All elements of the type, oldest first.
    pub fn find_all(&self, element_type: ContextElementType) -> Vec<&ContextElement> {
        self.elements
            .iter()
            .filter(|e| e.element_type() == element_type)
            .collect()
    }

    /// Expression variables of the whole stack; newer elements override older ones.
    pub fn param_map(&self) -> Map<String, Value> {
        let mut map = Map::new();
        for element in &self.elements {
            map.extend(element.param_map());
        }
        map
    }

    pub fn as_slice(&self) -> &[ContextElement] {
        &self.elements
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn into_vec(self) -> Vec<ContextElement> {
        self.elements
    }
}
