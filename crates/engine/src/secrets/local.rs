//! In-memory secret store sealed with AES-256-GCM.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use super::{
    DecryptionService, EncryptedDataDetail, Encryptor, SecretManager, ServiceVariable,
    VariableSource,
};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};

const ENCRYPTION_TYPE: &str = "LOCAL_AES_256_GCM";

/// Secrets and declared variables held in process.
///
/// Secrets are kept sealed and only opened by [`DecryptionService::decrypt`].
#[derive(Debug)]
pub struct LocalSecretStore {
    encryptor: Encryptor,
    secrets: RwLock<HashMap<String, String>>,
    service_variables: RwLock<Vec<(Option<String>, ServiceVariable)>>,
    environment_variables: RwLock<Vec<(Option<String>, ServiceVariable)>>,
    decryptions: AtomicUsize,
}

impl LocalSecretStore {
    pub fn new(encryptor: Encryptor) -> Self {
        Self {
            encryptor,
            secrets: RwLock::new(HashMap::new()),
            service_variables: RwLock::new(Vec::new()),
            environment_variables: RwLock::new(Vec::new()),
            decryptions: AtomicUsize::new(0),
        }
    }

    /// Use the configured key, or a random one when none is set.
    pub fn from_config(config: &EngineConfig) -> EngineResult<Self> {
        let key = match &config.secret_key {
            Some(key) => key.clone(),
            None => {
                tracing::debug!("No secret key configured, generating an ephemeral one");
                Encryptor::generate_key_base64()
            }
        };
        Ok(Self::new(Encryptor::from_base64(&key)?))
    }

    /// Seal and store a secret under `name`.
    pub fn put_secret(&self, name: &str, plaintext: &str) -> EngineResult<()> {
        let sealed = self.encryptor.seal(plaintext)?;
        self.secrets
            .write()
            .map_err(|_| poisoned())?
            .insert(name.to_string(), sealed);
        Ok(())
    }

    /// Declare a variable for one service, or every service when `service_id` is `None`.
    pub fn add_service_variable(&self, service_id: Option<&str>, variable: ServiceVariable) -> EngineResult<()> {
        self.service_variables
            .write()
            .map_err(|_| poisoned())?
            .push((service_id.map(str::to_string), variable));
        Ok(())
    }

    /// Declare a variable for one environment, or every environment when `env_id` is `None`.
    pub fn add_environment_variable(&self, env_id: Option<&str>, variable: ServiceVariable) -> EngineResult<()> {
        self.environment_variables
            .write()
            .map_err(|_| poisoned())?
            .push((env_id.map(str::to_string), variable));
        Ok(())
    }

    /// Number of successful decryptions so far.
    pub fn decrypt_count(&self) -> usize {
        self.decryptions.load(Ordering::SeqCst)
    }
}

fn poisoned() -> EngineError {
    EngineError::Internal("secret store lock poisoned".to_string())
}

fn scoped(entries: &[(Option<String>, ServiceVariable)], scope: Option<&str>) -> Vec<ServiceVariable> {
    // unscoped declarations first so scoped ones take precedence
    let global = entries.iter().filter(|(s, _)| s.is_none());
    let specific = entries
        .iter()
        .filter(|(s, _)| s.is_some() && s.as_deref() == scope);
    global.chain(specific).map(|(_, v)| v.clone()).collect()
}

impl VariableSource for LocalSecretStore {
    fn service_variables(
        &self,
        _app_id: &str,
        service_id: Option<&str>,
        env_id: Option<&str>,
    ) -> EngineResult<Vec<ServiceVariable>> {
        let mut variables = scoped(&self.environment_variables.read().map_err(|_| poisoned())?, env_id);
        variables.extend(scoped(&self.service_variables.read().map_err(|_| poisoned())?, service_id));
        Ok(variables)
    }

    fn environment_variables(&self, _app_id: &str, env_id: Option<&str>) -> EngineResult<Vec<ServiceVariable>> {
        Ok(scoped(&self.environment_variables.read().map_err(|_| poisoned())?, env_id))
    }
}

impl SecretManager for LocalSecretStore {
    fn encryption_details(
        &self,
        secret_ref: &str,
        _app_id: &str,
        _execution_uuid: &str,
    ) -> EngineResult<EncryptedDataDetail> {
        let secrets = self.secrets.read().map_err(|_| poisoned())?;
        let sealed = secrets
            .get(secret_ref)
            .ok_or_else(|| EngineError::SecretResolution(format!("unknown secret '{}'", secret_ref)))?;
        Ok(EncryptedDataDetail {
            secret_ref: secret_ref.to_string(),
            encryption_type: ENCRYPTION_TYPE.to_string(),
            encrypted_value: sealed.clone(),
        })
    }
}

impl DecryptionService for LocalSecretStore {
    fn decrypt(&self, detail: &EncryptedDataDetail) -> EngineResult<String> {
        if detail.encryption_type != ENCRYPTION_TYPE {
            return Err(EngineError::SecretResolution(format!(
                "unsupported encryption type {}",
                detail.encryption_type
            )));
        }
        let plaintext = self.encryptor.open(&detail.encrypted_value)?;
        self.decryptions.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(secret_ref = %detail.secret_ref, "Secret decrypted");
        Ok(plaintext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> LocalSecretStore {
        LocalSecretStore::from_config(&EngineConfig::default()).unwrap()
    }

    #[test]
    fn test_put_and_decrypt() {
        let store = store();
        store.put_secret("db_password", "s3cr3t").unwrap();

        let detail = store.encryption_details("db_password", "app", "exec").unwrap();
        assert_ne!(detail.encrypted_value, "s3cr3t");
        assert_eq!(store.decrypt(&detail).unwrap(), "s3cr3t");
        assert_eq!(store.decrypt_count(), 1);
    }

    #[test]
    fn test_unknown_secret() {
        let result = store().encryption_details("missing", "app", "exec");
        assert!(matches!(result, Err(EngineError::SecretResolution(_))));
    }

    #[test]
    fn test_scoped_variables() {
        let store = store();
        store
            .add_environment_variable(None, ServiceVariable::text("region", "us-east-1"))
            .unwrap();
        store
            .add_service_variable(Some("svc-1"), ServiceVariable::text("port", "8080"))
            .unwrap();
        store
            .add_service_variable(Some("svc-2"), ServiceVariable::text("port", "9090"))
            .unwrap();

        let vars = store.service_variables("app", Some("svc-1"), None).unwrap();
        let names: Vec<_> = vars.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec!["region", "port"]);
        assert_eq!(vars[1], ServiceVariable::text("port", "8080"));
    }
}
