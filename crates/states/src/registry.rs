//! Default registry wiring.

use std::sync::Arc;

use pipewright_engine::state::{State, StateRegistry};

use crate::builtin::{ApprovalState, FanOutState, NoopState, ShellScriptState};

/// Register every built-in state type on `registry`.
pub fn register_builtin(registry: &mut StateRegistry) {
    registry.register("approval", |def| Ok(Arc::new(ApprovalState::from_definition(def)) as Arc<dyn State>));
    registry.register("shell_script", |def| {
        Ok(Arc::new(ShellScriptState::from_definition(def)?) as Arc<dyn State>)
    });
    registry.register("fan_out", |def| Ok(Arc::new(FanOutState::from_definition(def)?) as Arc<dyn State>));
    registry.register("noop", |_| Ok(Arc::new(NoopState) as Arc<dyn State>));
}

/// Create a state registry with all built-in states registered.
pub fn create_default_registry() -> StateRegistry {
    let mut registry = StateRegistry::new();
    register_builtin(&mut registry);
    registry
}
