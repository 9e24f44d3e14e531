//! Secret and variable collaborators.
//!
//! The engine only sees these services through narrow traits:
//!
//! - **VariableSource**: lists service and environment variables
//! - **SecretManager**: fetches encryption metadata for a secret reference
//! - **DecryptionService**: turns that metadata into plaintext
//!
//! They are synchronous because lookups happen lazily inside expression
//! rendering. [`LocalSecretStore`] implements all three in memory.

mod encryption;
mod local;

use serde::{Deserialize, Serialize};

use crate::error::EngineResult;

pub use encryption::Encryptor;
pub use local::LocalSecretStore;

/// Value of a declared variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VariableValue {
    Text { value: String },
    EncryptedText { secret_ref: String },
}

/// A variable declared on a service or environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceVariable {
    pub name: String,
    pub value: VariableValue,
}

impl ServiceVariable {
    pub fn text(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: VariableValue::Text { value: value.into() },
        }
    }

    pub fn encrypted(name: impl Into<String>, secret_ref: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: VariableValue::EncryptedText {
                secret_ref: secret_ref.into(),
            },
        }
    }

    pub fn is_secret(&self) -> bool {
        matches!(self.value, VariableValue::EncryptedText { .. })
    }
}

/// Metadata needed to decrypt one secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedDataDetail {
    pub secret_ref: String,
    pub encryption_type: String,
    pub encrypted_value: String,
}

pub trait VariableSource: Send + Sync {
    /// Variables visible to a service, in precedence order (later wins).
    fn service_variables(
        &self,
        app_id: &str,
        service_id: Option<&str>,
        env_id: Option<&str>,
    ) -> EngineResult<Vec<ServiceVariable>>;

    /// Variables declared on an environment.
    fn environment_variables(&self, app_id: &str, env_id: Option<&str>) -> EngineResult<Vec<ServiceVariable>>;
}

pub trait SecretManager: Send + Sync {
    fn encryption_details(
        &self,
        secret_ref: &str,
        app_id: &str,
        execution_uuid: &str,
    ) -> EngineResult<EncryptedDataDetail>;
}

pub trait DecryptionService: Send + Sync {
    fn decrypt(&self, detail: &EncryptedDataDetail) -> EngineResult<String>;
}
