use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::debug;
use tracing::trace;

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
use crate::StoreResult;
use crate::WatchConfig;
use crate::WatchEventType;
use crate::WatchKind;

/// How a [`ChildrenCache`] reports its initial population
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartMode {
    /// One `NodeAdded` per existing child
    #[default]
    Normal,
    /// One `NodeAdded` per existing child, then `Initialized`
    PostInitializedEvent,
    /// Populate silently
    BuildInitialCache,
}

type ChildMap = BTreeMap<String, NodeSnapshot>;

/// Mirrors the direct children of a path, keyed by child name
///
/// Grandchildren are never watched.
pub struct ChildrenCache {
    client: Arc<dyn StoreClient>,
    path: String,
    cache_data: bool,
    config: WatchConfig,
    shared: Arc<CacheShared<ChildMap>>,
    runtime: Mutex<Option<CacheRuntime>>,
}

impl ChildrenCache {
    pub fn new(
        client: Arc<dyn StoreClient>,
        path: &str,
        cache_data: bool,
    ) -> Result<Self> {
        Self::with_config(client, path, cache_data, WatchConfig::default())
    }

    pub fn with_config(
        client: Arc<dyn StoreClient>,
        path: &str,
        cache_data: bool,
        config: WatchConfig,
    ) -> Result<Self> {
        path::validate(path)?;
        Ok(Self {
            client,
            path: path.to_string(),
            cache_data,
            config,
            shared: Arc::new(CacheShared::new("children")),
            runtime: Mutex::new(None),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Lists and reads the current children, arms the watches and goes live
    ///
    /// A missing parent yields an empty mapping; the cache attaches once the
    /// parent is created.
    pub async fn start(
        &self,
        mode: StartMode,
    ) -> Result<()> {
        let mut runtime = self.runtime.lock().await;
        self.shared.ensure_startable()?;

        let (dispatcher, events) = WatchDispatcher::new(self.client.clone(), self.config.clone());
        let mut worker = ChildrenWorker {
            client: self.client.clone(),
            dispatcher: Arc::new(dispatcher),
            path: self.path.clone(),
            cache_data: self.cache_data,
            shared: self.shared.clone(),
            children: ChildMap::new(),
            paused: false,
        };

        let added = match worker.populate().await {
            Ok(added) => added,
            Err(e) => {
                worker.dispatcher.close().await;
                return Err(e);
            }
        };

        self.shared.publish(worker.children.clone());
        if !self.shared.go_live() {
            worker.dispatcher.close().await;
            return Err(crate::CacheError::Closed.into());
        }
        debug!(path = %self.path, children = added.len(), ?mode, "children cache started");

        match mode {
            StartMode::Normal => added.into_iter().for_each(|s| self.shared.emit(CacheEvent::NodeAdded(s))),
            StartMode::PostInitializedEvent => {
                added.into_iter().for_each(|s| self.shared.emit(CacheEvent::NodeAdded(s)));
                self.shared.emit(CacheEvent::Initialized);
            }
            StartMode::BuildInitialCache => {}
        }

        let dispatcher = worker.dispatcher.clone();
        *runtime = Some(CacheRuntime::spawn(dispatcher, worker, events));
        Ok(())
    }

    /// Snapshot of every cached child, keyed by name
    pub fn get_current_children(&self) -> BTreeMap<String, NodeSnapshot> {
        self.shared.view().as_ref().clone()
    }

    /// Cached state of the child `name`
    pub fn get_current_data(
        &self,
        name: &str,
    ) -> Option<NodeSnapshot> {
        self.shared.view().get(name).cloned()
    }

    pub fn listenable(&self) -> &ListenerContainer {
        self.shared.listeners()
    }

    pub fn state(&self) -> CacheState {
        self.shared.state()
    }

    /// Releases every watch and clears the mapping. Idempotent.
    pub async fn close(&self) {
        if !self.shared.close() {
            return;
        }
        if let Some(runtime) = self.runtime.lock().await.take() {
            runtime.shutdown().await;
        }
        debug!(path = %self.path, "children cache closed");
    }
}

impl Drop for ChildrenCache {
    fn drop(&mut self) {
        // The runtime is dropped next and stops the worker
        self.shared.close();
    }
}

struct ChildrenWorker {
    client: Arc<dyn StoreClient>,
    dispatcher: Arc<WatchDispatcher>,
    path: String,
    cache_data: bool,
    shared: Arc<CacheShared<ChildMap>>,
    children: ChildMap,
    paused: bool,
}

impl ChildrenWorker {
    /// Initial population; returns the snapshots found, in name order
    async fn populate(&mut self) -> Result<Vec<NodeSnapshot>> {
        self.dispatcher.watch(&self.path, WatchKind::Data).await?;
        self.dispatcher.watch(&self.path, WatchKind::Children).await?;

        let names = match self.list().await? {
            Some(names) => names,
            None => return Ok(Vec::new()),
        };
        for name in names {
            let child = path::join(&self.path, &name);
            self.dispatcher.watch(&child, WatchKind::Data).await?;
            match fetch(self.client.as_ref(), &child, self.cache_data).await? {
                Some(snapshot) => {
                    self.children.insert(name, snapshot);
                }
                // Deleted between the listing and the read
                None => self.dispatcher.unwatch(&child, WatchKind::Data).await,
            }
        }
        Ok(self.children.values().cloned().collect())
    }

    /// Child names; `None` when the parent is missing
    async fn list(&self) -> StoreResult<Option<Vec<String>>> {
        match self.client.list_children(&self.path).await {
            Ok(names) => Ok(Some(names)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn apply(
        &mut self,
        name: &str,
        next: Option<NodeSnapshot>,
    ) {
        let event = classify(self.children.get(name), next.as_ref());
        let Some(event) = event else {
            return;
        };
        match next {
            Some(snapshot) => self.children.insert(name.to_string(), snapshot),
            None => self.children.remove(name),
        };
        self.shared.publish(self.children.clone());
        self.shared.emit(event);
    }

    async fn drop_child(
        &mut self,
        name: &str,
    ) {
        self.dispatcher.unwatch(&path::join(&self.path, name), WatchKind::Data).await;
        self.apply(name, None);
    }

    async fn refresh_child(
        &mut self,
        name: &str,
    ) {
        let child = path::join(&self.path, name);
        match fetch(self.client.as_ref(), &child, self.cache_data).await {
            Ok(Some(snapshot)) => self.apply(name, Some(snapshot)),
            Ok(None) => self.drop_child(name).await,
            Err(e) => self.shared.record_failure(&child, &e),
        }
    }

    /// Re-lists the parent and diffs names against the mapping
    async fn resync_children(&mut self) {
        let names = match self.list().await {
            Ok(Some(names)) => names,
            Ok(None) => return self.clear().await,
            Err(e) => return self.shared.record_failure(&self.path, &e),
        };
        let listed: BTreeSet<String> = names.into_iter().collect();

        let removed: Vec<String> = self.children.keys().filter(|n| !listed.contains(*n)).cloned().collect();
        for name in removed {
            self.drop_child(&name).await;
        }

        for name in listed {
            if !self.children.contains_key(&name) {
                let child = path::join(&self.path, &name);
                if let Err(e) = self.dispatcher.watch(&child, WatchKind::Data).await {
                    trace!(%child, ?e, "child watch not armed");
                    return;
                }
            }
            self.refresh_child(&name).await;
        }
    }

    /// Parent is gone: every child is removed
    async fn clear(&mut self) {
        let names: Vec<String> = self.children.keys().cloned().collect();
        for name in names {
            self.drop_child(&name).await;
        }
    }

    /// Direct child name of `event_path`, if it is one
    fn child_name<'a>(
        &self,
        event_path: &'a str,
    ) -> Option<&'a str> {
        (path::parent(event_path) == Some(self.path.as_str())).then(|| path::node_name(event_path))
    }

    async fn on_parent_event(
        &mut self,
        event_type: WatchEventType,
    ) {
        match event_type {
            WatchEventType::NodeCreated => {
                // The children loop ended when the parent vanished
                if let Err(e) = self.dispatcher.watch(&self.path, WatchKind::Children).await {
                    trace!(path = %self.path, ?e, "children watch not armed");
                    return;
                }
                self.resync_children().await;
            }
            WatchEventType::NodeChildrenChanged => self.resync_children().await,
            WatchEventType::NodeDeleted => self.clear().await,
            WatchEventType::NodeDataChanged => {}
        }
    }
}

#[async_trait::async_trait]
impl CacheWorker for ChildrenWorker {
    async fn handle(
        &mut self,
        event: DispatchEvent,
    ) {
        match event {
            DispatchEvent::Connection(state) => {
                self.shared.emit(connection_event(state));
                match state {
                    ConnectionState::Suspended | ConnectionState::Lost => self.paused = true,
                    ConnectionState::Connected | ConnectionState::Reconnected => {
                        self.paused = false;
                        if !self.dispatcher.is_watching(&self.path, WatchKind::Children) {
                            let _ = self.dispatcher.watch(&self.path, WatchKind::Children).await;
                        }
                        self.resync_children().await;
                    }
                }
            }
            _ if self.paused => {}
            DispatchEvent::Fired(event) if event.path == self.path => {
                self.on_parent_event(event.event_type).await;
            }
            DispatchEvent::Fired(event) => {
                if let Some(name) = self.child_name(&event.path).map(str::to_string) {
                    self.refresh_child(&name).await;
                }
            }
            DispatchEvent::Missing { path, .. } if path == self.path => self.clear().await,
            DispatchEvent::Missing { .. } => {}
            DispatchEvent::Rearmed { path, kind } => {
                if path == self.path {
                    if kind != WatchKind::Data {
                        self.resync_children().await;
                    }
                } else if let Some(name) = self.child_name(&path).map(str::to_string) {
                    self.refresh_child(&name).await;
                }
            }
        }
    }
}
