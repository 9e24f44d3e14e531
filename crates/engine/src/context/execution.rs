//! Per-call execution context.
//!
//! Built fresh for every execute/resume call from the persisted instance and
//! the compiled graph, and dropped when the call returns. Never shared
//! between concurrent calls.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use minijinja::Value;
use serde_json::{json, Map};

use super::sweeping::{
    InMemorySweepingOutputService, SweepingOutput, SweepingOutputBuilder, SweepingOutputInquiry,
    SweepingOutputScope, SweepingOutputService,
};
use super::template::{contains_expression, json_to_value, value_to_json, ExpressionRenderer};
use super::variables::{FieldMode, LateBoundGroup, Lookup, VariableGroup, VariableResolver, VariableScope};
use super::{ContextElement, ContextElementStack, ContextElementType};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::graph::{StateDefinition, StateMachine};
use crate::instance::StateExecutionInstance;
use crate::secrets::{DecryptionService, LocalSecretStore, SecretManager, VariableSource};

/// External services an execution context reads from.
#[derive(Clone)]
pub struct ContextServices {
    pub variables: Arc<dyn VariableSource>,
    pub secret_manager: Arc<dyn SecretManager>,
    pub decryption: Arc<dyn DecryptionService>,
    pub sweeping_outputs: Arc<dyn SweepingOutputService>,
}

impl ContextServices {
    /// Back every service with one local secret store and in-memory outputs.
    pub fn local(store: Arc<LocalSecretStore>) -> Self {
        Self {
            variables: store.clone(),
            secret_manager: store.clone(),
            decryption: store,
            sweeping_outputs: Arc::new(InMemorySweepingOutputService::new()),
        }
    }
}

impl std::fmt::Debug for ContextServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextServices").finish_non_exhaustive()
    }
}

/// Extra inputs for a single render.
#[derive(Debug, Clone, Default)]
pub struct StateExecutionContext {
    /// Elements visible to this render only, on top of the stack.
    pub context_elements: Vec<ContextElement>,
    /// Additional top-level variables.
    pub variables: Map<String, serde_json::Value>,
    /// Bind secrets as deferred expressions for a delegate.
    pub adopt_delegate_decryption: bool,
}

/// Replace characters that cannot appear in an expression identifier.
pub fn normalize_state_name(name: &str) -> String {
    let mut normalized = String::with_capacity(name.len());
    for c in name.chars() {
        match c {
            '-' | '+' | '*' | '/' | '\\' | ' ' | '&' | '$' | '"' | '\'' | '.' | '|' | '(' | ')' => {
                normalized.push_str("__")
            }
            _ => normalized.push(c),
        }
    }
    normalized
}

/// Facade over one instance, its graph and its context stack.
pub struct ExecutionContext {
    instance: StateExecutionInstance,
    machine: Arc<StateMachine>,
    stack: ContextElementStack,
    upstream: Map<String, serde_json::Value>,
    renderer: Arc<ExpressionRenderer>,
    resolver: Arc<VariableResolver>,
    sweeping_outputs: Arc<dyn SweepingOutputService>,
    prepared: Option<HashMap<String, Value>>,
    render_cache: HashMap<(bool, String), String>,
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("instance", &self.instance.uuid)
            .field("state", &self.instance.state_name)
            .field("elements", &self.stack.len())
            .finish_non_exhaustive()
    }
}

impl ExecutionContext {
    pub fn new(
        instance: StateExecutionInstance,
        machine: Arc<StateMachine>,
        renderer: Arc<ExpressionRenderer>,
        services: &ContextServices,
        config: &EngineConfig,
    ) -> Self {
        let stack = ContextElementStack::new(instance.context_elements.clone());
        let scope = variable_scope(&instance, &stack);
        let resolver = VariableResolver::new(
            scope,
            services.variables.clone(),
            services.secret_manager.clone(),
            services.decryption.clone(),
            config.secret_mask.clone(),
            config.adopt_delegate_decryption,
        );
        Self {
            instance,
            machine,
            stack,
            upstream: Map::new(),
            renderer,
            resolver: Arc::new(resolver),
            sweeping_outputs: services.sweeping_outputs.clone(),
            prepared: None,
            render_cache: HashMap::new(),
        }
    }

    /// Outputs of earlier states, keyed by normalized state name.
    pub fn with_upstream_outputs(mut self, outputs: Map<String, serde_json::Value>) -> Self {
        self.upstream = outputs;
        self
    }

    pub fn instance(&self) -> &StateExecutionInstance {
        &self.instance
    }

    pub fn app_id(&self) -> &str {
        &self.instance.app_id
    }

    pub fn execution_uuid(&self) -> &str {
        &self.instance.execution_uuid
    }

    pub fn state_execution_instance_id(&self) -> &str {
        &self.instance.uuid
    }

    pub fn state_name(&self) -> &str {
        &self.instance.state_name
    }

    pub fn state_machine(&self) -> &Arc<StateMachine> {
        &self.machine
    }

    /// Definition of the node this context runs.
    pub fn state_definition(&self) -> EngineResult<&StateDefinition> {
        Ok(&self.machine.state(&self.instance.state_name)?.definition)
    }

    pub fn is_retry(&self) -> bool {
        self.instance.is_retry()
    }

    pub fn retry_count(&self) -> u32 {
        self.instance.retry_count
    }

    pub fn expression_functor_token(&self) -> u32 {
        self.resolver.functor_token()
    }

    /// Start a new evaluation pass for late-bound values.
    pub fn renew_expression_functor_token(&mut self) -> u32 {
        self.render_cache.clear();
        self.resolver.renew_functor_token()
    }

    // ------------------------------------------------------------------
    // Context elements
    // ------------------------------------------------------------------

    /// Most recently pushed element of a type, optionally by name.
    pub fn context_element(&self, element_type: ContextElementType, name: Option<&str>) -> Option<&ContextElement> {
        self.stack.find(element_type, name)
    }

    /// All elements of a type, oldest first.
    pub fn context_element_list(&self, element_type: ContextElementType) -> Vec<&ContextElement> {
        self.stack.find_all(element_type)
    }

    pub fn context_elements(&self) -> &ContextElementStack {
        &self.stack
    }

    /// Push an element. Call [`reset_prepared_cache`](Self::reset_prepared_cache)
    /// before rendering against it.
    pub fn push_context_element(&mut self, element: ContextElement) {
        self.stack.push(element);
    }

    /// Record a finished state's output so later expressions can see it.
    pub fn record_state_output(&mut self, state_name: &str, data: serde_json::Value) {
        self.upstream.insert(normalize_state_name(state_name), data);
    }

    /// Drop the prepared expression context, the render cache and variable bindings.
    pub fn reset_prepared_cache(&mut self) {
        self.prepared = None;
        self.render_cache.clear();
        self.resolver.clear_bindings();
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    pub fn render_expression(&mut self, expression: &str) -> EngineResult<String> {
        self.render(expression, false, None)
    }

    pub fn render_expression_with(
        &mut self,
        expression: &str,
        state_context: &StateExecutionContext,
    ) -> EngineResult<String> {
        self.render(expression, false, Some(state_context))
    }

    /// Render with every secret replaced by the mask.
    pub fn render_expression_secured(&mut self, expression: &str) -> EngineResult<String> {
        self.render(expression, true, None)
    }

    /// Render and split on commas, dropping empty entries.
    pub fn render_expression_list(&mut self, expression: &str) -> EngineResult<Vec<String>> {
        Ok(self
            .render_expression(expression)?
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Evaluate an expression to a raw value.
    pub fn evaluate_expression(&mut self, expression: &str) -> EngineResult<serde_json::Value> {
        let context = self.template_context(false, None);
        let result = self.renderer.evaluate(expression, &context);
        self.finish(expression, result).map(|v| value_to_json(&v))
    }

    /// Evaluate an expression as a guard.
    pub fn evaluate_condition(&mut self, condition: &str) -> EngineResult<bool> {
        let context = self.template_context(false, None);
        let result = self.renderer.evaluate(condition, &context);
        self.finish(condition, result).map(|v| v.is_true())
    }

    /// Variables of a group, resolved in `mode`.
    pub fn service_variables(&self, mode: FieldMode) -> EngineResult<BTreeMap<String, serde_json::Value>> {
        self.resolver.resolve_all(VariableGroup::ServiceVariable, mode)
    }

    /// Switch the mode expressions read a group in.
    pub fn set_variable_mode(&mut self, group: VariableGroup, mode: FieldMode) {
        self.render_cache.clear();
        self.resolver.set_group_mode(group, mode);
    }

    fn render(
        &mut self,
        expression: &str,
        secured: bool,
        state_context: Option<&StateExecutionContext>,
    ) -> EngineResult<String> {
        if !contains_expression(expression) {
            return Ok(expression.to_string());
        }
        let cache_key = (secured, expression.to_string());
        if state_context.is_none() {
            if let Some(cached) = self.render_cache.get(&cache_key) {
                return Ok(cached.clone());
            }
        }

        let context = self.template_context(secured, state_context);
        let result = self.renderer.render(expression, &context);
        let rendered = self.finish(expression, result)?;
        if state_context.is_none() {
            self.render_cache.insert(cache_key, rendered.clone());
        }
        Ok(rendered)
    }

    fn finish<T>(&self, expression: &str, result: Result<T, minijinja::Error>) -> EngineResult<T> {
        // a secret failure surfaces as an undefined value inside minijinja
        if let Some(failure) = self.resolver.take_failure() {
            return Err(failure);
        }
        result.map_err(|e| EngineError::Evaluation(format!("'{}': {}", expression, e)))
    }

    fn prepared(&mut self) -> &HashMap<String, Value> {
        if self.prepared.is_none() {
            let mut map: HashMap<String, Value> = self
                .upstream
                .iter()
                .map(|(k, v)| (k.clone(), json_to_value(v)))
                .collect();
            for (key, value) in self.stack.param_map() {
                map.insert(key, json_to_value(&value));
            }
            map.insert(
                "currentStep".to_string(),
                json_to_value(&json!({
                    "name": self.instance.state_name,
                    "type": self.instance.state_type,
                    "uuid": self.instance.uuid,
                    "retryCount": self.instance.retry_count,
                })),
            );
            self.prepared = Some(map);
        }
        self.prepared.get_or_insert_with(HashMap::new)
    }

    fn template_context(
        &mut self,
        secured: bool,
        state_context: Option<&StateExecutionContext>,
    ) -> HashMap<String, Value> {
        let resolver = self.resolver.clone();
        let mut context = self.prepared().clone();
        let delegate = state_context.is_some_and(|s| s.adopt_delegate_decryption);

        if let Some(state_context) = state_context {
            for element in &state_context.context_elements {
                for (key, value) in element.param_map() {
                    context.insert(key, json_to_value(&value));
                }
            }
            for (key, value) in &state_context.variables {
                context.insert(key.clone(), json_to_value(value));
            }
        }

        for group in VariableGroup::ALL {
            let lookup = Lookup {
                mode: resolver.group_mode(group),
                secured,
                delegate,
            };
            context.insert(
                group.key().to_string(),
                Value::from_object(LateBoundGroup {
                    resolver: resolver.clone(),
                    group,
                    lookup,
                }),
            );
        }
        context
    }

    // ------------------------------------------------------------------
    // Sweeping outputs
    // ------------------------------------------------------------------

    fn pipeline_execution_id(&self) -> Option<String> {
        match self.stack.find(ContextElementType::Standard, None) {
            Some(ContextElement::Standard(std)) => std.pipeline_execution_id.clone(),
            _ => None,
        }
    }

    fn phase_execution_id(&self) -> Option<String> {
        match self.stack.find(ContextElementType::Param, Some(super::PHASE_PARAM)) {
            Some(ContextElement::Phase(phase)) => Some(format!(
                "{}{}{}",
                self.instance.execution_uuid, phase.uuid, phase.phase_name
            )),
            _ => None,
        }
    }

    /// Builder scoped to `scope` (PIPELINE when `None`).
    ///
    /// PIPELINE falls back to the workflow execution when the run has no
    /// pipeline; PHASE requires a phase element on the stack.
    pub fn prepare_sweeping_output_builder(
        &self,
        scope: Option<SweepingOutputScope>,
    ) -> EngineResult<SweepingOutputBuilder> {
        let scope = scope.unwrap_or(SweepingOutputScope::Pipeline);
        let workflow_id = self.instance.execution_uuid.clone();
        let (scope, scope_id) = match scope {
            SweepingOutputScope::Pipeline => match self.pipeline_execution_id() {
                Some(id) => (scope, id),
                None => (SweepingOutputScope::Workflow, workflow_id),
            },
            SweepingOutputScope::Workflow => (scope, workflow_id),
            SweepingOutputScope::Phase => {
                let id = self.phase_execution_id().ok_or_else(|| {
                    EngineError::Validation("PHASE sweeping output outside a phase".to_string())
                })?;
                (scope, id)
            }
            SweepingOutputScope::State => (scope, self.instance.uuid.clone()),
        };
        Ok(SweepingOutputBuilder::new(
            self.instance.app_id.clone(),
            self.instance.execution_uuid.clone(),
            scope,
            scope_id,
        ))
    }

    /// Inquiry matching every scope visible from this instance.
    pub fn prepare_sweeping_output_inquiry(&self) -> SweepingOutputInquiry {
        SweepingOutputInquiry {
            app_id: self.instance.app_id.clone(),
            name: String::new(),
            pipeline_execution_id: self.pipeline_execution_id(),
            workflow_execution_id: self.instance.execution_uuid.clone(),
            phase_execution_id: self.phase_execution_id(),
            state_execution_id: self.instance.uuid.clone(),
        }
    }

    pub async fn publish_sweeping_output(&self, builder: SweepingOutputBuilder) -> EngineResult<SweepingOutput> {
        self.sweeping_outputs.save(builder.build()?).await
    }

    pub async fn find_sweeping_output(&self, name: &str) -> EngineResult<Option<SweepingOutput>> {
        let inquiry = self.prepare_sweeping_output_inquiry().with_name(name);
        self.sweeping_outputs.find(&inquiry).await
    }
}

fn variable_scope(instance: &StateExecutionInstance, stack: &ContextElementStack) -> VariableScope {
    let mut scope = VariableScope {
        app_id: instance.app_id.clone(),
        execution_uuid: instance.execution_uuid.clone(),
        ..Default::default()
    };
    if let Some(ContextElement::Service(service)) = stack.find(ContextElementType::Service, None) {
        scope.service_id = Some(service.uuid.clone());
    }
    if let Some(ContextElement::Environment(env)) = stack.find(ContextElementType::Environment, None) {
        scope.env_id = Some(env.uuid.clone());
    }
    if let Some(ContextElement::Phase(phase)) = stack.find(ContextElementType::Param, Some(super::PHASE_PARAM)) {
        scope.overrides = phase.variable_overrides.clone();
        if scope.service_id.is_none() {
            scope.service_id = phase.service_id.clone();
        }
    }
    scope
}
