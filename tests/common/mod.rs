use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use coord_cache::CacheEvent;
use coord_cache::ClientConfig;
use coord_cache::CoordConfig;
use coord_cache::CoordFramework;
use coord_cache::CreateMode;
use coord_cache::ListenerContainer;
use coord_cache::MemStore;
use coord_cache::StoreClient;
use coord_cache::WatchConfig;
use parking_lot::Mutex;

pub const WAIT_TIMEOUT: Duration = Duration::from_secs(3);

pub async fn wait_until(condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached within {WAIT_TIMEOUT:?}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Framework on a fresh in-memory store with fast re-arm retries
pub fn setup(namespace: Option<&str>) -> (MemStore, CoordFramework) {
    let store = MemStore::new();
    let config = CoordConfig {
        client: ClientConfig {
            namespace: namespace.map(str::to_string),
            ..Default::default()
        },
        watch: WatchConfig {
            rearm_retry_delay_in_ms: 10,
            rearm_retry_jitter_in_ms: 0,
        },
        ..Default::default()
    };
    let framework = CoordFramework::with_config(Arc::new(store.clone()), config).unwrap();
    (store, framework)
}

pub async fn seed(
    store: &MemStore,
    nodes: &[(&str, &str)],
) {
    for (path, data) in nodes {
        store
            .create(path, Bytes::from(data.to_string()), CreateMode::Persistent)
            .await
            .unwrap();
    }
}

#[derive(Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<CacheEvent>>>,
}

impl Recorder {
    pub fn attach(listeners: &ListenerContainer) -> Self {
        let recorder = Self::default();
        let sink = recorder.events.clone();
        listeners.add_listener(move |event| sink.lock().push(event.clone()));
        recorder
    }

    pub fn events(&self) -> Vec<CacheEvent> {
        self.events.lock().clone()
    }

    pub async fn wait_for(
        &self,
        n: usize,
    ) -> Vec<CacheEvent> {
        let events = self.events.clone();
        wait_until(move || events.lock().len() >= n).await;
        self.events()
    }
}

/// `(event name, path)` pairs of the node events, in order
pub fn describe(events: &[CacheEvent]) -> Vec<(&'static str, String)> {
    events
        .iter()
        .filter_map(|e| {
            let name = match e {
                CacheEvent::NodeAdded(_) => "added",
                CacheEvent::NodeUpdated(_) => "updated",
                CacheEvent::NodeRemoved(_) => "removed",
                _ => return None,
            };
            e.path().map(|p| (name, p.to_string()))
        })
        .collect()
}
