//! State registry with an override table.

use std::collections::HashMap;
use std::sync::Arc;

use super::State;
use crate::error::{EngineError, EngineResult};
use crate::graph::StateDefinition;

/// Builds a state implementation for one graph node.
pub type StateFactory =
    Arc<dyn Fn(&StateDefinition) -> EngineResult<Arc<dyn State>> + Send + Sync>;

/// Registry of available state types.
///
/// Overrides shadow base registrations of the same type; the base entry is
/// kept and becomes visible again if the override is removed.
#[derive(Clone)]
pub struct StateRegistry {
    base: HashMap<String, StateFactory>,
    overrides: HashMap<String, StateFactory>,
}

impl StateRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            base: HashMap::new(),
            overrides: HashMap::new(),
        }
    }

    /// Register a base factory for a state type.
    pub fn register<F>(&mut self, state_type: impl Into<String>, factory: F)
    where
        F: Fn(&StateDefinition) -> EngineResult<Arc<dyn State>> + Send + Sync + 'static,
    {
        self.base.insert(state_type.into(), Arc::new(factory));
    }

    /// Register an overriding factory consulted before the base table.
    pub fn register_override<F>(&mut self, state_type: impl Into<String>, factory: F)
    where
        F: Fn(&StateDefinition) -> EngineResult<Arc<dyn State>> + Send + Sync + 'static,
    {
        self.overrides.insert(state_type.into(), Arc::new(factory));
    }

    /// Drop an override, exposing the base registration again.
    pub fn remove_override(&mut self, state_type: &str) -> bool {
        self.overrides.remove(state_type).is_some()
    }

    /// Factory for a type, override first.
    pub fn get(&self, state_type: &str) -> Option<StateFactory> {
        self.overrides
            .get(state_type)
            .or_else(|| self.base.get(state_type))
            .cloned()
    }

    /// Build the state for a graph node.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown types, or the factory's own error.
    pub fn create(&self, definition: &StateDefinition) -> EngineResult<Arc<dyn State>> {
        let factory = self.get(&definition.state_type).ok_or_else(|| {
            EngineError::NotFound(format!("state type '{}'", definition.state_type))
        })?;
        factory(definition)
    }

    pub fn has(&self, state_type: &str) -> bool {
        self.overrides.contains_key(state_type) || self.base.contains_key(state_type)
    }

    pub fn is_overridden(&self, state_type: &str) -> bool {
        self.overrides.contains_key(state_type)
    }

    /// All registered type names, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .base
            .keys()
            .chain(self.overrides.keys())
            .map(|s| s.as_str())
            .collect();
        names.sort_unstable();
        names.dedup();
        names
    }
}

impl Default for StateRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StateRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateRegistry")
            .field("base", &self.base.keys().collect::<Vec<_>>())
            .field("overrides", &self.overrides.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ExecutionContext;
    use crate::state::ExecutionResponse;
    use async_trait::async_trait;

    struct Tagged(&'static str);

    #[async_trait]
    impl State for Tagged {
        fn state_type(&self) -> &str {
            self.0
        }

        async fn execute(&self, _context: &mut ExecutionContext) -> EngineResult<ExecutionResponse> {
            Ok(ExecutionResponse::success())
        }
    }

    fn definition(state_type: &str) -> StateDefinition {
        StateDefinition::new("node", state_type)
    }

    #[test]
    fn test_registry_new() {
        let registry = StateRegistry::new();
        assert!(registry.list().is_empty());
    }

    #[test]
    fn test_create_from_base() {
        let mut registry = StateRegistry::new();
        registry.register("noop", |_| Ok(Arc::new(Tagged("base")) as Arc<dyn State>));

        let state = registry.create(&definition("noop")).unwrap();
        assert_eq!(state.state_type(), "base");
        assert!(registry.has("noop"));
        assert!(!registry.is_overridden("noop"));
    }

    #[test]
    fn test_override_shadows_base() {
        let mut registry = StateRegistry::new();
        registry.register("noop", |_| Ok(Arc::new(Tagged("base")) as Arc<dyn State>));
        registry.register_override("noop", |_| Ok(Arc::new(Tagged("override")) as Arc<dyn State>));

        assert_eq!(registry.create(&definition("noop")).unwrap().state_type(), "override");
        assert_eq!(registry.list(), vec!["noop"]);

        assert!(registry.remove_override("noop"));
        assert_eq!(registry.create(&definition("noop")).unwrap().state_type(), "base");
    }

    #[test]
    fn test_unknown_type() {
        let registry = StateRegistry::new();
        let result = registry.create(&definition("helm_deploy"));
        assert!(matches!(result, Err(EngineError::NotFound(_))));
    }
}
