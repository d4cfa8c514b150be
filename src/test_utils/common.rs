use std::time::Duration;

use bytes::Bytes;

use crate::CreateMode;
use crate::MemStore;
use crate::StoreClient;
use crate::WatchConfig;

const WAIT_TIMEOUT: Duration = Duration::from_secs(3);
const WAIT_STEP: Duration = Duration::from_millis(5);

/// Polls `condition` until it holds; panics after a few seconds
pub async fn wait_until(condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not reached within {WAIT_TIMEOUT:?}");
        }
        tokio::time::sleep(WAIT_STEP).await;
    }
}

/// Retry settings that keep tests fast
pub fn fast_watch_config() -> WatchConfig {
    WatchConfig {
        rearm_retry_delay_in_ms: 10,
        rearm_retry_jitter_in_ms: 0,
    }
}

pub fn bytes(s: &str) -> Bytes {
    Bytes::from(s.to_string())
}

/// Creates persistent nodes in order; parents must come first
pub async fn seed(
    store: &MemStore,
    nodes: &[(&str, &str)],
) {
    for (path, data) in nodes {
        store
            .create(path, bytes(data), CreateMode::Persistent)
            .await
            .unwrap_or_else(|e| panic!("seed {path}: {e}"));
    }
}
