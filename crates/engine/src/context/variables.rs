//! Late-bound service variables and secrets.
//!
//! Variable groups are exposed to expressions as lazy objects. A group's
//! variable list is fetched the first time the group is read and cached
//! together with the field mode it was bound in; asking for a different
//! mode drops the cached binding and rebuilds it.
//!
//! Decrypted values are cached per functor token and secret reference, so
//! one evaluation pass decrypts each secret at most once.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use minijinja::value::{Object, Value};
use serde_json::json;

use super::VariableOverride;
use crate::error::{EngineError, EngineResult};
use crate::secrets::{DecryptionService, SecretManager, ServiceVariable, VariableSource, VariableValue};

/// How the value of a secret variable is computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldMode {
    /// Fetch encryption details and decrypt.
    ObtainValue,
    /// Fixed mask, no decryption.
    Masked,
    /// Metadata only; `value` decrypts on direct access.
    ObtainMeta,
}

/// Well-known late-bound keys in the expression context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VariableGroup {
    ServiceVariable,
    SafeDisplayServiceVariable,
    EnvironmentVariable,
    Secrets,
}

impl VariableGroup {
    pub const ALL: [VariableGroup; 4] = [
        Self::ServiceVariable,
        Self::SafeDisplayServiceVariable,
        Self::EnvironmentVariable,
        Self::Secrets,
    ];

    /// Name the group is bound under in expressions.
    pub const fn key(self) -> &'static str {
        match self {
            Self::ServiceVariable => "serviceVariable",
            Self::SafeDisplayServiceVariable => "safeDisplayServiceVariable",
            Self::EnvironmentVariable => "environmentVariable",
            Self::Secrets => "secrets",
        }
    }

    pub const fn default_mode(self) -> FieldMode {
        match self {
            Self::SafeDisplayServiceVariable => FieldMode::Masked,
            _ => FieldMode::ObtainValue,
        }
    }
}

/// Identity the resolver fetches variables and secrets for.
#[derive(Debug, Clone, Default)]
pub struct VariableScope {
    pub app_id: String,
    pub execution_uuid: String,
    pub service_id: Option<String>,
    pub env_id: Option<String>,
    pub overrides: Vec<VariableOverride>,
}

/// Options of one lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Lookup {
    pub mode: FieldMode,
    pub secured: bool,
    pub delegate: bool,
}

impl Lookup {
    /// Mode the binding is made in; secured lookups never obtain plaintext.
    fn effective_mode(self) -> FieldMode {
        match (self.secured, self.mode) {
            (true, FieldMode::ObtainValue) => FieldMode::Masked,
            (_, mode) => mode,
        }
    }
}

#[derive(Debug)]
struct GroupBinding {
    mode: FieldMode,
    variables: HashMap<String, ServiceVariable>,
}

/// Shared resolver behind the lazy expression objects.
pub struct VariableResolver {
    scope: VariableScope,
    source: Arc<dyn VariableSource>,
    manager: Arc<dyn SecretManager>,
    decryption: Arc<dyn DecryptionService>,
    mask: String,
    adopt_delegate_decryption: bool,
    token: AtomicU32,
    modes: Mutex<HashMap<VariableGroup, FieldMode>>,
    bindings: Mutex<HashMap<VariableGroup, GroupBinding>>,
    secrets: Mutex<HashMap<(u32, String), String>>,
    failure: Mutex<Option<EngineError>>,
}

impl fmt::Debug for VariableResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VariableResolver")
            .field("scope", &self.scope)
            .field("token", &self.functor_token())
            .field("adopt_delegate_decryption", &self.adopt_delegate_decryption)
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl VariableResolver {
    pub fn new(
        scope: VariableScope,
        source: Arc<dyn VariableSource>,
        manager: Arc<dyn SecretManager>,
        decryption: Arc<dyn DecryptionService>,
        mask: impl Into<String>,
        adopt_delegate_decryption: bool,
    ) -> Self {
        Self {
            scope,
            source,
            manager,
            decryption,
            mask: mask.into(),
            adopt_delegate_decryption,
            token: AtomicU32::new(rand::random()),
            modes: Mutex::new(HashMap::new()),
            bindings: Mutex::new(HashMap::new()),
            secrets: Mutex::new(HashMap::new()),
            failure: Mutex::new(None),
        }
    }

    pub fn functor_token(&self) -> u32 {
        self.token.load(Ordering::SeqCst)
    }

    /// Start a new evaluation pass; secrets decrypted under the old token are dropped.
    pub fn renew_functor_token(&self) -> u32 {
        let token = rand::random();
        self.token.store(token, Ordering::SeqCst);
        lock(&self.secrets).clear();
        token
    }

    pub fn mask(&self) -> &str {
        &self.mask
    }

    pub fn adopt_delegate_decryption(&self) -> bool {
        self.adopt_delegate_decryption
    }

    /// Mode a group is read in by expressions.
    pub fn group_mode(&self, group: VariableGroup) -> FieldMode {
        lock(&self.modes)
            .get(&group)
            .copied()
            .unwrap_or_else(|| group.default_mode())
    }

    /// Force the mode of a group, dropping a binding made in another mode.
    pub fn set_group_mode(&self, group: VariableGroup, mode: FieldMode) {
        lock(&self.modes).insert(group, mode);
        let mut bindings = lock(&self.bindings);
        if bindings.get(&group).is_some_and(|b| b.mode != mode) {
            bindings.remove(&group);
        }
    }

    /// Drop every group binding.
    pub fn clear_bindings(&self) {
        lock(&self.bindings).clear();
    }

    /// Whether the group currently holds a binding.
    pub fn is_bound(&self, group: VariableGroup) -> bool {
        lock(&self.bindings).contains_key(&group)
    }

    fn fetch(&self, group: VariableGroup) -> EngineResult<HashMap<String, ServiceVariable>> {
        let scope = &self.scope;
        let listed = match group {
            VariableGroup::ServiceVariable | VariableGroup::SafeDisplayServiceVariable => {
                let mut vars = self.source.service_variables(
                    &scope.app_id,
                    scope.service_id.as_deref(),
                    scope.env_id.as_deref(),
                )?;
                vars.extend(
                    scope
                        .overrides
                        .iter()
                        .map(|o| ServiceVariable::text(o.name.clone(), o.value.clone())),
                );
                vars
            }
            VariableGroup::EnvironmentVariable => self
                .source
                .environment_variables(&scope.app_id, scope.env_id.as_deref())?,
            VariableGroup::Secrets => Vec::new(),
        };
        Ok(listed.into_iter().map(|v| (v.name.clone(), v)).collect())
    }

    fn variable(&self, group: VariableGroup, mode: FieldMode, name: &str) -> EngineResult<Option<ServiceVariable>> {
        if group == VariableGroup::Secrets {
            return Ok(Some(ServiceVariable::encrypted(name, name)));
        }

        let mut bindings = lock(&self.bindings);
        if bindings.get(&group).is_some_and(|b| b.mode != mode) {
            tracing::debug!(group = group.key(), ?mode, "Rebinding variable group for mode switch");
            bindings.remove(&group);
        }
        if !bindings.contains_key(&group) {
            let variables = self.fetch(group)?;
            tracing::debug!(group = group.key(), ?mode, count = variables.len(), "Variable group bound");
            bindings.insert(group, GroupBinding { mode, variables });
        }
        Ok(bindings
            .get(&group)
            .and_then(|b| b.variables.get(name))
            .cloned())
    }

    /// Decrypt a secret, reusing the value cached for the current token.
    pub fn obtain(&self, secret_ref: &str) -> EngineResult<String> {
        let key = (self.functor_token(), secret_ref.to_string());
        if let Some(value) = lock(&self.secrets).get(&key) {
            return Ok(value.clone());
        }

        let detail = self
            .manager
            .encryption_details(secret_ref, &self.scope.app_id, &self.scope.execution_uuid)?;
        let plaintext = self.decryption.decrypt(&detail)?;
        lock(&self.secrets).insert(key, plaintext.clone());
        Ok(plaintext)
    }

    /// Expression a delegate resolves at use time instead of the plaintext.
    fn deferred(&self, secret_ref: &str) -> String {
        format!(
            "${{secretDelegate.obtain(\"{}\", {})}}",
            secret_ref,
            self.functor_token()
        )
    }

    fn plaintext_or_deferred(&self, secret_ref: &str, delegate: bool) -> EngineResult<String> {
        if delegate || self.adopt_delegate_decryption {
            Ok(self.deferred(secret_ref))
        } else {
            self.obtain(secret_ref)
        }
    }

    pub(crate) fn lookup(
        self: &Arc<Self>,
        group: VariableGroup,
        lookup: Lookup,
        name: &str,
    ) -> EngineResult<Option<Value>> {
        let mode = lookup.effective_mode();
        let Some(variable) = self.variable(group, mode, name)? else {
            return Ok(None);
        };
        let secret_ref = match variable.value {
            VariableValue::Text { value } => return Ok(Some(Value::from(value))),
            VariableValue::EncryptedText { secret_ref } => secret_ref,
        };
        let value = match mode {
            FieldMode::ObtainValue => Value::from(self.plaintext_or_deferred(&secret_ref, lookup.delegate)?),
            FieldMode::Masked => Value::from(self.mask.clone()),
            FieldMode::ObtainMeta => Value::from_object(SecretMeta {
                name: variable.name,
                secret_ref,
                resolver: self.clone(),
                lookup,
            }),
        };
        Ok(Some(value))
    }

    /// Every variable of a group computed in `mode`, as JSON.
    pub fn resolve_all(&self, group: VariableGroup, mode: FieldMode) -> EngineResult<BTreeMap<String, serde_json::Value>> {
        let variables = match group {
            VariableGroup::Secrets => return Ok(BTreeMap::new()),
            _ => {
                // binds the group in this mode
                self.variable(group, mode, "")?;
                lock(&self.bindings)
                    .get(&group)
                    .map(|b| b.variables.values().cloned().collect::<Vec<_>>())
                    .unwrap_or_default()
            }
        };

        let mut resolved = BTreeMap::new();
        for variable in variables {
            let value = match (&variable.value, mode) {
                (VariableValue::Text { value }, _) => json!(value),
                (VariableValue::EncryptedText { secret_ref }, FieldMode::ObtainValue) => {
                    json!(self.plaintext_or_deferred(secret_ref, false)?)
                }
                (VariableValue::EncryptedText { .. }, FieldMode::Masked) => json!(self.mask),
                (VariableValue::EncryptedText { secret_ref }, FieldMode::ObtainMeta) => json!({
                    "name": variable.name,
                    "type": "ENCRYPTED_TEXT",
                    "secretRef": secret_ref,
                }),
            };
            resolved.insert(variable.name.clone(), value);
        }
        Ok(resolved)
    }

    /// Keep the first failure raised inside a render.
    pub(crate) fn record_failure(&self, error: EngineError) {
        let mut slot = lock(&self.failure);
        if slot.is_none() {
            *slot = Some(error);
        }
    }

    pub(crate) fn take_failure(&self) -> Option<EngineError> {
        lock(&self.failure).take()
    }
}

/// Lazy expression object for one variable group.
#[derive(Debug)]
pub(crate) struct LateBoundGroup {
    pub resolver: Arc<VariableResolver>,
    pub group: VariableGroup,
    pub lookup: Lookup,
}

impl Object for LateBoundGroup {
    fn get_value(self: &Arc<Self>, key: &Value) -> Option<Value> {
        let name = key.as_str()?;
        match self.resolver.lookup(self.group, self.lookup, name) {
            Ok(value) => value,
            Err(err) => {
                self.resolver.record_failure(err);
                None
            }
        }
    }
}

/// Metadata view of a secret; `value` decrypts on access.
#[derive(Debug)]
struct SecretMeta {
    name: String,
    secret_ref: String,
    resolver: Arc<VariableResolver>,
    lookup: Lookup,
}

impl Object for SecretMeta {
    fn get_value(self: &Arc<Self>, key: &Value) -> Option<Value> {
        match key.as_str()? {
            "name" => Some(Value::from(self.name.clone())),
            "secretRef" => Some(Value::from(self.secret_ref.clone())),
            "type" => Some(Value::from("ENCRYPTED_TEXT")),
            "value" if self.lookup.secured => Some(Value::from(self.resolver.mask.clone())),
            "value" => match self
                .resolver
                .plaintext_or_deferred(&self.secret_ref, self.lookup.delegate)
            {
                Ok(value) => Some(Value::from(value)),
                Err(err) => {
                    self.resolver.record_failure(err);
                    None
                }
            },
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::secrets::LocalSecretStore;

    fn resolver(adopt: bool) -> (Arc<LocalSecretStore>, Arc<VariableResolver>) {
        let store = Arc::new(LocalSecretStore::from_config(&EngineConfig::default()).unwrap());
        store.put_secret("db_password", "hunter2").unwrap();
        store
            .add_service_variable(None, ServiceVariable::encrypted("db_password", "db_password"))
            .unwrap();
        store
            .add_service_variable(None, ServiceVariable::text("port", "5432"))
            .unwrap();
        let resolver = VariableResolver::new(
            VariableScope {
                app_id: "app".into(),
                execution_uuid: "exec".into(),
                ..Default::default()
            },
            store.clone(),
            store.clone(),
            store.clone(),
            "****",
            adopt,
        );
        (store, Arc::new(resolver))
    }

    fn plain() -> Lookup {
        Lookup {
            mode: FieldMode::ObtainValue,
            secured: false,
            delegate: false,
        }
    }

    #[test]
    fn test_obtain_value_cached_per_token() {
        let (store, resolver) = resolver(false);
        let a = resolver.lookup(VariableGroup::ServiceVariable, plain(), "db_password").unwrap();
        let b = resolver.lookup(VariableGroup::ServiceVariable, plain(), "db_password").unwrap();
        assert_eq!(a, Some(Value::from("hunter2")));
        assert_eq!(a, b);
        assert_eq!(store.decrypt_count(), 1);

        resolver.renew_functor_token();
        resolver.lookup(VariableGroup::ServiceVariable, plain(), "db_password").unwrap();
        assert_eq!(store.decrypt_count(), 2);
    }

    #[test]
    fn test_secured_lookup_masks() {
        let (store, resolver) = resolver(false);
        let lookup = Lookup { secured: true, ..plain() };
        let value = resolver.lookup(VariableGroup::ServiceVariable, lookup, "db_password").unwrap();
        assert_eq!(value, Some(Value::from("****")));
        assert_eq!(store.decrypt_count(), 0);

        let text = resolver.lookup(VariableGroup::ServiceVariable, lookup, "port").unwrap();
        assert_eq!(text, Some(Value::from("5432")));
    }

    #[test]
    fn test_mode_switch_rebinds() {
        let (_store, resolver) = resolver(false);
        resolver.set_group_mode(VariableGroup::ServiceVariable, FieldMode::Masked);
        let masked = Lookup { mode: FieldMode::Masked, ..plain() };
        resolver.lookup(VariableGroup::ServiceVariable, masked, "port").unwrap();
        assert!(resolver.is_bound(VariableGroup::ServiceVariable));

        resolver.set_group_mode(VariableGroup::ServiceVariable, FieldMode::ObtainValue);
        assert!(!resolver.is_bound(VariableGroup::ServiceVariable));
    }

    #[test]
    fn test_delegate_decryption_defers() {
        let (store, resolver) = resolver(true);
        let value = resolver
            .lookup(VariableGroup::ServiceVariable, plain(), "db_password")
            .unwrap()
            .unwrap();
        let text = value.as_str().unwrap();
        assert!(text.starts_with("${secretDelegate.obtain(\"db_password\""));
        assert_eq!(store.decrypt_count(), 0);
    }

    #[test]
    fn test_resolve_all_meta() {
        let (store, resolver) = resolver(false);
        let all = resolver
            .resolve_all(VariableGroup::ServiceVariable, FieldMode::ObtainMeta)
            .unwrap();
        assert_eq!(all["port"], json!("5432"));
        assert_eq!(all["db_password"]["secretRef"], json!("db_password"));
        assert_eq!(store.decrypt_count(), 0);
    }

    #[test]
    fn test_unknown_secret_recorded() {
        let (_store, resolver) = resolver(false);
        let result = resolver.lookup(VariableGroup::Secrets, plain(), "nope");
        assert!(matches!(result, Err(EngineError::SecretResolution(_))));
    }
}
