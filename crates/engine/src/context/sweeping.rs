//! Sweeping outputs: values published by one state for later, unrelated states.
//!
//! An output is stored against exactly one scope id. Builders pick that id
//! from the requested scope; inquiries carry every id the reader can see and
//! match an output stored against any of them.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};

/// Visibility of a sweeping output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SweepingOutputScope {
    Pipeline,
    Workflow,
    Phase,
    State,
}

impl fmt::Display for SweepingOutputScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pipeline => write!(f, "PIPELINE"),
            Self::Workflow => write!(f, "WORKFLOW"),
            Self::Phase => write!(f, "PHASE"),
            Self::State => write!(f, "STATE"),
        }
    }
}

/// A stored output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepingOutput {
    pub uuid: String,
    pub app_id: String,
    pub name: String,
    /// Execution that produced the output.
    pub execution_uuid: String,
    pub scope: SweepingOutputScope,
    /// Id of the scope the output is stored against.
    pub scope_id: String,
    pub value: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Builder prepared by the execution context.
#[derive(Debug, Clone)]
pub struct SweepingOutputBuilder {
    app_id: String,
    execution_uuid: String,
    scope: SweepingOutputScope,
    scope_id: String,
    name: Option<String>,
    value: Option<serde_json::Value>,
}

impl SweepingOutputBuilder {
    pub(crate) fn new(
        app_id: impl Into<String>,
        execution_uuid: impl Into<String>,
        scope: SweepingOutputScope,
        scope_id: impl Into<String>,
    ) -> Self {
        Self {
            app_id: app_id.into(),
            execution_uuid: execution_uuid.into(),
            scope,
            scope_id: scope_id.into(),
            name: None,
            value: None,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn value(mut self, value: serde_json::Value) -> Self {
        self.value = Some(value);
        self
    }

    pub fn scope(&self) -> SweepingOutputScope {
        self.scope
    }

    pub fn scope_id(&self) -> &str {
        &self.scope_id
    }

    /// # Errors
    ///
    /// Returns `Validation` when the name or value is missing.
    pub fn build(self) -> EngineResult<SweepingOutput> {
        let name = self
            .name
            .filter(|n| !n.is_empty())
            .ok_or_else(|| EngineError::Validation("sweeping output needs a name".to_string()))?;
        let value = self.value.ok_or_else(|| {
            EngineError::Validation(format!("sweeping output '{}' needs a value", name))
        })?;
        Ok(SweepingOutput {
            uuid: Uuid::new_v4().to_string(),
            app_id: self.app_id,
            name,
            execution_uuid: self.execution_uuid,
            scope: self.scope,
            scope_id: self.scope_id,
            value,
            created_at: Utc::now(),
        })
    }
}

/// Lookup key carrying every scope id visible to the reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepingOutputInquiry {
    pub app_id: String,
    pub name: String,
    pub pipeline_execution_id: Option<String>,
    pub workflow_execution_id: String,
    pub phase_execution_id: Option<String>,
    pub state_execution_id: String,
}

impl SweepingOutputInquiry {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    fn scope_ids(&self) -> impl Iterator<Item = &str> {
        [
            self.pipeline_execution_id.as_deref(),
            Some(self.workflow_execution_id.as_str()),
            self.phase_execution_id.as_deref(),
            Some(self.state_execution_id.as_str()),
        ]
        .into_iter()
        .flatten()
    }

    pub fn matches(&self, output: &SweepingOutput) -> bool {
        output.app_id == self.app_id
            && output.name == self.name
            && self.scope_ids().any(|id| id == output.scope_id)
    }
}

/// Storage for sweeping outputs.
#[async_trait]
pub trait SweepingOutputService: Send + Sync {
    /// Store an output; a second output with the same name and scope id is a `Conflict`.
    async fn save(&self, output: SweepingOutput) -> EngineResult<SweepingOutput>;

    async fn find(&self, inquiry: &SweepingOutputInquiry) -> EngineResult<Option<SweepingOutput>>;

    /// Remove everything an execution produced; returns the number removed.
    async fn clean(&self, app_id: &str, execution_uuid: &str) -> EngineResult<usize>;
}

/// Process-local sweeping output storage.
#[derive(Debug, Default)]
pub struct InMemorySweepingOutputService {
    outputs: RwLock<Vec<SweepingOutput>>,
}

impl InMemorySweepingOutputService {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SweepingOutputService for InMemorySweepingOutputService {
    async fn save(&self, output: SweepingOutput) -> EngineResult<SweepingOutput> {
        let mut outputs = self.outputs.write().await;
        let duplicate = outputs.iter().any(|o| {
            o.app_id == output.app_id && o.name == output.name && o.scope_id == output.scope_id
        });
        if duplicate {
            return Err(EngineError::Conflict(format!(
                "sweeping output '{}' already exists in {} scope {}",
                output.name, output.scope, output.scope_id
            )));
        }
        tracing::debug!(name = %output.name, scope = %output.scope, "Sweeping output saved");
        outputs.push(output.clone());
        Ok(output)
    }

    async fn find(&self, inquiry: &SweepingOutputInquiry) -> EngineResult<Option<SweepingOutput>> {
        let outputs = self.outputs.read().await;
        Ok(outputs.iter().rev().find(|o| inquiry.matches(o)).cloned())
    }

    async fn clean(&self, app_id: &str, execution_uuid: &str) -> EngineResult<usize> {
        let mut outputs = self.outputs.write().await;
        let before = outputs.len();
        outputs.retain(|o| !(o.app_id == app_id && o.execution_uuid == execution_uuid));
        Ok(before - outputs.len())
    }
}
