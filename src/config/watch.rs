use std::time::Duration;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

/// Re-arm policy of the watch dispatcher
///
/// A registration that fails for a reason other than connection loss or a
/// missing node is retried after `rearm_retry_delay_in_ms` plus a random
/// jitter of up to `rearm_retry_jitter_in_ms`.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct WatchConfig {
    #[serde(default = "default_rearm_retry_delay")]
    pub rearm_retry_delay_in_ms: u64,

    #[serde(default = "default_rearm_retry_jitter")]
    pub rearm_retry_jitter_in_ms: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            rearm_retry_delay_in_ms: default_rearm_retry_delay(),
            rearm_retry_jitter_in_ms: default_rearm_retry_jitter(),
        }
    }
}

fn default_rearm_retry_delay() -> u64 {
    200
}
fn default_rearm_retry_jitter() -> u64 {
    50
}

impl WatchConfig {
    pub fn rearm_retry_delay(&self) -> Duration {
        Duration::from_millis(self.rearm_retry_delay_in_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.rearm_retry_delay_in_ms == 0 {
            return Err(Error::Config(ConfigError::Message(
                "rearm_retry_delay_in_ms must be greater than 0".into(),
            )));
        }
        if self.rearm_retry_jitter_in_ms > self.rearm_retry_delay_in_ms {
            return Err(Error::Config(ConfigError::Message(format!(
                "rearm_retry_jitter_in_ms ({}) must not exceed rearm_retry_delay_in_ms ({})",
                self.rearm_retry_jitter_in_ms, self.rearm_retry_delay_in_ms
            ))));
        }
        Ok(())
    }
}
