use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use super::classify;
use super::connection_event;
use super::fetch;
use super::CacheEvent;
use super::CacheRuntime;
use super::CacheShared;
use super::CacheState;
use super::CacheWorker;
use super::ListenerContainer;
use crate::path;
use crate::watch::DispatchEvent;
use crate::watch::WatchDispatcher;
use crate::ConnectionState;
use crate::NodeSnapshot;
use crate::Result;
use crate::StoreClient;
use crate::WatchConfig;
use crate::WatchKind;

/// Mirrors a single path
///
/// The path does not need to exist: the cache waits for it to be created.
pub struct NodeCache {
    client: Arc<dyn StoreClient>,
    path: String,
    config: WatchConfig,
    shared: Arc<CacheShared<Option<NodeSnapshot>>>,
    runtime: Mutex<Option<CacheRuntime>>,
}

impl NodeCache {
    pub fn new(
        client: Arc<dyn StoreClient>,
        path: &str,
    ) -> Result<Self> {
        Self::with_config(client, path, WatchConfig::default())
    }

    pub fn with_config(
        client: Arc<dyn StoreClient>,
        path: &str,
        config: WatchConfig,
    ) -> Result<Self> {
        path::validate(path)?;
        Ok(Self {
            client,
            path: path.to_string(),
            config,
            shared: Arc::new(CacheShared::new("node")),
            runtime: Mutex::new(None),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Reads the node, arms its watch and goes live
    ///
    /// Emits `NodeAdded` for an existing node unless
    /// `build_initial_cache_only` is set.
    ///
    /// # Errors
    /// - [`crate::CacheError::AlreadyStarted`] / [`crate::CacheError::Closed`]
    /// - store failures of the initial read
    pub async fn start(
        &self,
        build_initial_cache_only: bool,
    ) -> Result<()> {
        let mut runtime = self.runtime.lock().await;
        self.shared.ensure_startable()?;

        let (dispatcher, events) = WatchDispatcher::new(self.client.clone(), self.config.clone());
        let dispatcher = Arc::new(dispatcher);

        // Arm before reading so no change between the two is lost
        let initial = async {
            dispatcher.watch(&self.path, WatchKind::Data).await?;
            Ok::<_, crate::Error>(fetch(self.client.as_ref(), &self.path, true).await?)
        }
        .await;
        let initial = match initial {
            Ok(initial) => initial,
            Err(e) => {
                dispatcher.close().await;
                return Err(e);
            }
        };

        self.shared.publish(initial.clone());
        if !self.shared.go_live() {
            dispatcher.close().await;
            return Err(crate::CacheError::Closed.into());
        }
        debug!(path = %self.path, exists = initial.is_some(), "node cache started");
        if !build_initial_cache_only {
            if let Some(snapshot) = &initial {
                self.shared.emit(CacheEvent::NodeAdded(snapshot.clone()));
            }
        }

        let worker = NodeWorker {
            client: self.client.clone(),
            path: self.path.clone(),
            shared: self.shared.clone(),
            current: initial,
            paused: false,
        };
        *runtime = Some(CacheRuntime::spawn(dispatcher, worker, events));
        Ok(())
    }

    /// Latest known state; `None` while the node is missing or the cache is
    /// not started
    pub fn get_current_data(&self) -> Option<NodeSnapshot> {
        self.shared.view().as_ref().clone()
    }

    pub fn listenable(&self) -> &ListenerContainer {
        self.shared.listeners()
    }

    pub fn state(&self) -> CacheState {
        self.shared.state()
    }

    /// Releases the watch and clears the cached node. Idempotent.
    pub async fn close(&self) {
        if !self.shared.close() {
            return;
        }
        if let Some(runtime) = self.runtime.lock().await.take() {
            runtime.shutdown().await;
        }
        debug!(path = %self.path, "node cache closed");
    }
}

impl Drop for NodeCache {
    fn drop(&mut self) {
        // The runtime is dropped next and stops the worker
        self.shared.close();
    }
}

struct NodeWorker {
    client: Arc<dyn StoreClient>,
    path: String,
    shared: Arc<CacheShared<Option<NodeSnapshot>>>,
    current: Option<NodeSnapshot>,
    paused: bool,
}

impl NodeWorker {
    async fn refresh(&mut self) {
        let next = match fetch(self.client.as_ref(), &self.path, true).await {
            Ok(next) => next,
            Err(e) => {
                self.shared.record_failure(&self.path, &e);
                return;
            }
        };
        let event = classify(self.current.as_ref(), next.as_ref());
        self.current = next;
        if let Some(event) = event {
            self.shared.publish(self.current.clone());
            self.shared.emit(event);
        }
    }
}

#[async_trait::async_trait]
impl CacheWorker for NodeWorker {
    async fn handle(
        &mut self,
        event: DispatchEvent,
    ) {
        match event {
            DispatchEvent::Fired(_) | DispatchEvent::Rearmed { .. } => {
                if !self.paused {
                    self.refresh().await;
                }
            }
            DispatchEvent::Missing { .. } => {}
            DispatchEvent::Connection(state) => {
                self.shared.emit(connection_event(state));
                match state {
                    ConnectionState::Suspended | ConnectionState::Lost => self.paused = true,
                    ConnectionState::Connected | ConnectionState::Reconnected => {
                        self.paused = false;
                        self.refresh().await;
                    }
                }
            }
        }
    }
}
