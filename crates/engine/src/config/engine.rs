//! Engine configuration.

use std::time::Duration;

use serde::Deserialize;

/// Engine configuration loaded from environment variables.
///
/// Environment variables are prefixed with `PIPEWRIGHT_`:
/// - `PIPEWRIGHT_MAX_CONCURRENT_EXECUTIONS`: Dispatcher pool size (default: 64)
/// - `PIPEWRIGHT_UPDATE_RETRY_LIMIT`: Optimistic update retries (default: 5)
/// - `PIPEWRIGHT_DEFAULT_STATE_TIMEOUT_MS`: Async wait deadline (default: 4 hours)
/// - `PIPEWRIGHT_ABORT_EXPIRY_BUFFER_MS`: Grace added when discontinuing (default: 10 minutes)
/// - `PIPEWRIGHT_SECRET_MASK`: Replacement text for secrets in secured output
/// - `PIPEWRIGHT_ADOPT_DELEGATE_DECRYPTION`: Bind deferred expressions instead of decrypting
/// - `PIPEWRIGHT_SECRET_KEY`: Base64 AES-256 key for the local secret store (optional)
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Maximum number of execute/resume tasks running at once
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_executions: usize,

    /// Optimistic update attempts before surfacing a conflict
    #[serde(default = "default_update_retry_limit")]
    pub update_retry_limit: u32,

    /// Default async wait deadline in milliseconds
    #[serde(default = "default_state_timeout_ms")]
    pub default_state_timeout_ms: u64,

    /// Grace period added to expiry when an instance is discontinued
    #[serde(default = "default_abort_expiry_buffer_ms")]
    pub abort_expiry_buffer_ms: u64,

    /// Mask substituted for secret values in secured rendering
    #[serde(default = "default_secret_mask")]
    pub secret_mask: String,

    /// Leave secret decryption to the remote executor
    #[serde(default)]
    pub adopt_delegate_decryption: bool,

    /// Base64-encoded key for the local secret store
    #[serde(default)]
    pub secret_key: Option<String>,
}

fn default_max_concurrent() -> usize {
    64
}

fn default_update_retry_limit() -> u32 {
    5
}

fn default_state_timeout_ms() -> u64 {
    4 * 60 * 60 * 1000
}

fn default_abort_expiry_buffer_ms() -> u64 {
    10 * 60 * 1000
}

fn default_secret_mask() -> String {
    "**************".to_string()
}

impl EngineConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables are prefixed with `PIPEWRIGHT_`.
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::prefixed("PIPEWRIGHT_").from_env::<EngineConfig>()
    }

    /// Default async wait deadline.
    pub fn default_state_timeout(&self) -> Duration {
        Duration::from_millis(self.default_state_timeout_ms)
    }

    /// Grace period applied to expiry of discontinued instances.
    pub fn abort_expiry_buffer(&self) -> Duration {
        Duration::from_millis(self.abort_expiry_buffer_ms)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_executions: default_max_concurrent(),
            update_retry_limit: default_update_retry_limit(),
            default_state_timeout_ms: default_state_timeout_ms(),
            abort_expiry_buffer_ms: default_abort_expiry_buffer_ms(),
            secret_mask: default_secret_mask(),
            adopt_delegate_decryption: false,
            secret_key: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.max_concurrent_executions, 64);
        assert_eq!(config.update_retry_limit, 5);
        assert!(!config.adopt_delegate_decryption);
        assert!(config.secret_key.is_none());
    }

    #[test]
    fn test_default_timeouts() {
        let config = EngineConfig::default();
        assert_eq!(config.default_state_timeout(), Duration::from_secs(4 * 3600));
        assert_eq!(config.abort_expiry_buffer(), Duration::from_secs(600));
    }

    #[test]
    fn test_deserialize_partial() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"max_concurrent_executions": 4, "secret_mask": "***"}"#)
                .unwrap();
        assert_eq!(config.max_concurrent_executions, 4);
        assert_eq!(config.secret_mask, "***");
        assert_eq!(config.update_retry_limit, 5);
    }
}
