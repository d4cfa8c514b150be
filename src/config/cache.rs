use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::cache::StartMode;
use crate::constants::DEFAULT_MAX_DEPTH;
use crate::Error;
use crate::Result;

/// Defaults for caches created through the framework
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CacheConfig {
    /// Keep node payloads; `false` keeps stats only
    #[serde(default = "default_cache_data")]
    pub cache_data: bool,

    /// Depth bound of subtree caches (0 = root only)
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,

    #[serde(default)]
    pub children_start_mode: StartMode,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_data: default_cache_data(),
            max_depth: default_max_depth(),
            children_start_mode: StartMode::default(),
        }
    }
}

fn default_cache_data() -> bool {
    true
}
fn default_max_depth() -> u32 {
    DEFAULT_MAX_DEPTH
}

impl CacheConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_depth > DEFAULT_MAX_DEPTH {
            return Err(Error::Config(ConfigError::Message(format!(
                "max_depth must not exceed {DEFAULT_MAX_DEPTH}"
            ))));
        }
        Ok(())
    }
}
