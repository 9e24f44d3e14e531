//! Registry of compiled workflow graphs.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use super::StateMachine;
use crate::error::{EngineError, EngineResult};

/// In-process lookup of state machines by id.
#[derive(Debug, Default, Clone)]
pub struct StateMachineRepository {
    machines: Arc<RwLock<HashMap<String, Arc<StateMachine>>>>,
}

impl StateMachineRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a machine and return the shared handle.
    pub async fn register(&self, machine: StateMachine) -> Arc<StateMachine> {
        let machine = Arc::new(machine);
        self.machines
            .write()
            .await
            .insert(machine.uuid.clone(), machine.clone());
        tracing::debug!(state_machine_id = %machine.uuid, name = %machine.name, "State machine registered");
        machine
    }

    pub async fn get(&self, state_machine_id: &str) -> EngineResult<Arc<StateMachine>> {
        self.machines
            .read()
            .await
            .get(state_machine_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("state machine {}", state_machine_id)))
    }
}
