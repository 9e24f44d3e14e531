//! Compiled, immutable workflow graph.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{StateDefinition, WorkflowDefinition};
use crate::context::ExecutionContext;
use crate::error::{EngineError, EngineResult};
use crate::state::{State, StateRegistry};

/// Edge type of a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransitionType {
    Success,
    Failure,
    Abort,
    Repeat,
    Fork,
    Conditional,
}

impl TransitionType {
    /// Types whose candidates are selected by evaluating a guard.
    pub const fn is_guarded(self) -> bool {
        matches!(self, Self::Conditional | Self::Repeat)
    }
}

impl fmt::Display for TransitionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "SUCCESS"),
            Self::Failure => write!(f, "FAILURE"),
            Self::Abort => write!(f, "ABORT"),
            Self::Repeat => write!(f, "REPEAT"),
            Self::Fork => write!(f, "FORK"),
            Self::Conditional => write!(f, "CONDITIONAL"),
        }
    }
}

/// A typed edge between two states.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub from_state: String,
    pub to_state: String,
    pub transition_type: TransitionType,
    /// Guard expression for CONDITIONAL and REPEAT edges.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

/// A graph node: its definition and the state implementation built for it.
#[derive(Clone)]
pub struct StateNode {
    pub definition: StateDefinition,
    pub state: Arc<dyn State>,
}

impl StateNode {
    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn state_type(&self) -> &str {
        &self.definition.state_type
    }
}

impl fmt::Debug for StateNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateNode")
            .field("name", &self.definition.name)
            .field("state_type", &self.definition.state_type)
            .finish()
    }
}

/// Immutable directed graph of states.
///
/// Built once per workflow version and shared by every execution of it.
#[derive(Debug)]
pub struct StateMachine {
    pub uuid: String,
    pub app_id: String,
    pub name: String,
    initial_state: String,
    nodes: HashMap<String, StateNode>,
    order: Vec<String>,
    transitions: Vec<Transition>,
}

impl StateMachine {
    /// Compile a definition against a registry.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for duplicate or unknown state names, a missing
    /// initial state or an unguarded CONDITIONAL/REPEAT edge, and the
    /// registry's error for unknown state types.
    pub fn from_definition(
        app_id: impl Into<String>,
        definition: &WorkflowDefinition,
        registry: &StateRegistry,
    ) -> EngineResult<Self> {
        let mut nodes = HashMap::new();
        let mut order = Vec::with_capacity(definition.states.len());
        for state_def in &definition.states {
            if nodes.contains_key(&state_def.name) {
                return Err(EngineError::Validation(format!(
                    "duplicate state name '{}'",
                    state_def.name
                )));
            }
            let state = registry.create(state_def)?;
            order.push(state_def.name.clone());
            nodes.insert(
                state_def.name.clone(),
                StateNode {
                    definition: state_def.clone(),
                    state,
                },
            );
        }

        if !nodes.contains_key(&definition.initial_state) {
            return Err(EngineError::Validation(format!(
                "initial state '{}' is not defined",
                definition.initial_state
            )));
        }

        let mut transitions = Vec::with_capacity(definition.transitions.len());
        let mut seen = HashSet::new();
        for t in &definition.transitions {
            for endpoint in [&t.from, &t.to] {
                if !nodes.contains_key(endpoint) {
                    return Err(EngineError::Validation(format!(
                        "transition {} -> {} references unknown state '{}'",
                        t.from, t.to, endpoint
                    )));
                }
            }
            if t.transition_type.is_guarded() && t.condition.is_none() {
                return Err(EngineError::Validation(format!(
                    "{} transition {} -> {} needs a condition",
                    t.transition_type, t.from, t.to
                )));
            }
            if !seen.insert((t.from.as_str(), t.to.as_str(), t.transition_type)) {
                tracing::warn!(from = %t.from, to = %t.to, "Duplicate transition ignored");
                continue;
            }
            transitions.push(Transition {
                from_state: t.from.clone(),
                to_state: t.to.clone(),
                transition_type: t.transition_type,
                condition: t.condition.clone(),
            });
        }

        Ok(Self {
            uuid: Uuid::new_v4().to_string(),
            app_id: app_id.into(),
            name: definition.name.clone(),
            initial_state: definition.initial_state.clone(),
            nodes,
            order,
            transitions,
        })
    }

    /// Look up a node by name.
    pub fn get_state(&self, name: &str) -> Option<&StateNode> {
        self.nodes.get(name)
    }

    /// Look up a node by name, failing with `NotFound`.
    pub fn state(&self, name: &str) -> EngineResult<&StateNode> {
        self.get_state(name).ok_or_else(|| {
            EngineError::NotFound(format!("state '{}' in workflow '{}'", name, self.name))
        })
    }

    pub fn initial_state(&self) -> EngineResult<&StateNode> {
        self.state(&self.initial_state)
    }

    /// Nodes in declaration order.
    pub fn states(&self) -> impl Iterator<Item = &StateNode> {
        self.order.iter().filter_map(|name| self.nodes.get(name))
    }

    pub fn transitions(&self) -> &[Transition] {
        &self.transitions
    }

    /// Transitions leaving `from` with the given type, in declaration order.
    pub fn transitions_from<'a>(
        &'a self,
        from: &'a str,
        transition_type: TransitionType,
    ) -> impl Iterator<Item = &'a Transition> + 'a {
        self.transitions
            .iter()
            .filter(move |t| t.from_state == from && t.transition_type == transition_type)
    }

    /// Targets of the FORK transitions leaving `from`.
    pub fn fork_targets(&self, from: &str) -> Vec<&StateNode> {
        self.transitions_from(from, TransitionType::Fork)
            .filter_map(|t| self.nodes.get(&t.to_state))
            .collect()
    }

    /// Select the next state for `from` and `transition_type`.
    ///
    /// Guarded types evaluate each candidate's condition in declaration
    /// order and take the first true one; other types take the first match.
    ///
    /// # Errors
    ///
    /// Guard evaluation errors are returned, never treated as false.
    pub fn next_transition(
        &self,
        from: &str,
        transition_type: TransitionType,
        context: &mut ExecutionContext,
    ) -> EngineResult<Option<&StateNode>> {
        for transition in self.transitions_from(from, transition_type) {
            if transition_type.is_guarded() {
                let condition = transition.condition.as_deref().unwrap_or("false");
                if !context.evaluate_condition(condition)? {
                    continue;
                }
            }
            return Ok(self.nodes.get(&transition.to_state));
        }
        Ok(None)
    }
}
