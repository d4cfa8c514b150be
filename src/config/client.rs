use std::time::Duration;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::path;
use crate::Error;
use crate::Result;

/// Store client parameters applied by the framework
///
/// ```toml
/// [client]
/// namespace = "zk/dev"
/// operation_timeout_in_ms = 5000
/// connection_timeout_in_ms = 3000
/// guaranteed_delete_retry_in_ms = 1000
/// ```
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ClientConfig {
    /// Path prefix applied to every operation, e.g. `zk/dev`
    ///
    /// Default: none (paths are used as given)
    #[serde(default)]
    pub namespace: Option<String>,

    /// Upper bound of a single store operation
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_in_ms: u64,

    /// How long `wait_until_connected` waits
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_in_ms: u64,

    /// Pause between attempts of a guaranteed delete
    #[serde(default = "default_guaranteed_delete_retry")]
    pub guaranteed_delete_retry_in_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            operation_timeout_in_ms: default_operation_timeout(),
            connection_timeout_in_ms: default_connection_timeout(),
            guaranteed_delete_retry_in_ms: default_guaranteed_delete_retry(),
        }
    }
}

fn default_operation_timeout() -> u64 {
    5000
}
fn default_connection_timeout() -> u64 {
    3000
}
fn default_guaranteed_delete_retry() -> u64 {
    1000
}

impl ClientConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_in_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_in_ms)
    }

    pub fn guaranteed_delete_retry(&self) -> Duration {
        Duration::from_millis(self.guaranteed_delete_retry_in_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.operation_timeout_in_ms == 0 {
            return Err(Error::Config(ConfigError::Message(
                "operation_timeout_in_ms must be greater than 0".into(),
            )));
        }
        if self.connection_timeout_in_ms == 0 {
            return Err(Error::Config(ConfigError::Message(
                "connection_timeout_in_ms must be greater than 0".into(),
            )));
        }
        if self.guaranteed_delete_retry_in_ms == 0 {
            return Err(Error::Config(ConfigError::Message(
                "guaranteed_delete_retry_in_ms must be greater than 0".into(),
            )));
        }
        if let Some(namespace) = &self.namespace {
            if namespace.trim_matches('/').is_empty() {
                return Err(Error::Config(ConfigError::Message(
                    "namespace cannot be empty when set".into(),
                )));
            }
            path::validate(&path::namespace_root(namespace)).map_err(|e| {
                Error::Config(ConfigError::Message(format!("invalid namespace {namespace:?}: {e}")))
            })?;
        }
        Ok(())
    }
}
