use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Arc;

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
use crate::constants::DEFAULT_MAX_DEPTH;
use crate::path;
use crate::watch::DispatchEvent;
use crate::watch::WatchDispatcher;
use crate::ConnectionState;
use crate::NodeSnapshot;
use crate::Result;
use crate::StoreClient;
use crate::WatchConfig;
use crate::WatchEventType;
use crate::WatchKind;

/// Tracked nodes plus the parent → child-name index
#[derive(Debug, Clone, Default)]
struct SubtreeView {
    nodes: HashMap<String, NodeSnapshot>,
    children: HashMap<String, BTreeSet<String>>,
}

/// Mirrors a subtree down to `max_depth` levels below its root
///
/// Accessors answer `None` until the initial population has been reported
/// with [`CacheEvent::Initialized`].
pub struct SubtreeCache {
    client: Arc<dyn StoreClient>,
    root: String,
    max_depth: u32,
    cache_data: bool,
    config: WatchConfig,
    shared: Arc<CacheShared<SubtreeView>>,
    runtime: Mutex<Option<CacheRuntime>>,
}

pub struct SubtreeCacheBuilder {
    client: Arc<dyn StoreClient>,
    root: String,
    max_depth: u32,
    cache_data: bool,
    config: WatchConfig,
}

impl SubtreeCacheBuilder {
    /// Levels tracked below the root; 0 tracks the root only
    pub fn max_depth(
        mut self,
        max_depth: u32,
    ) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// `false` keeps stats only
    pub fn cache_data(
        mut self,
        cache_data: bool,
    ) -> Self {
        self.cache_data = cache_data;
        self
    }

    pub fn watch_config(
        mut self,
        config: WatchConfig,
    ) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<SubtreeCache> {
        path::validate(&self.root)?;
        Ok(SubtreeCache {
            client: self.client,
            root: self.root,
            max_depth: self.max_depth,
            cache_data: self.cache_data,
            config: self.config,
            shared: Arc::new(CacheShared::new("subtree")),
            runtime: Mutex::new(None),
        })
    }
}

impl SubtreeCache {
    pub fn builder(
        client: Arc<dyn StoreClient>,
        root: &str,
    ) -> SubtreeCacheBuilder {
        SubtreeCacheBuilder {
            client,
            root: root.to_string(),
            max_depth: DEFAULT_MAX_DEPTH,
            cache_data: true,
            config: WatchConfig::default(),
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// Walks the subtree depth-first, reports every node, then `Initialized`
    pub async fn start(&self) -> Result<()> {
        let mut runtime = self.runtime.lock().await;
        self.shared.ensure_startable()?;

        let (dispatcher, events) = WatchDispatcher::new(self.client.clone(), self.config.clone());
        let mut worker = SubtreeWorker {
            client: self.client.clone(),
            dispatcher: Arc::new(dispatcher),
            root: self.root.clone(),
            max_depth: self.max_depth as usize,
            cache_data: self.cache_data,
            shared: self.shared.clone(),
            view: SubtreeView::default(),
            paused: false,
        };

        let mut added = Vec::new();
        if let Err(e) = worker.attach(&self.root, &mut added).await {
            worker.dispatcher.close().await;
            return Err(e);
        }

        self.shared.publish(worker.view.clone());
        debug!(root = %self.root, nodes = added.len(), max_depth = self.max_depth, "subtree cache populated");
        for event in added {
            self.shared.emit(event);
        }
        self.shared.emit(CacheEvent::Initialized);
        if !self.shared.go_live() {
            worker.dispatcher.close().await;
            return Err(crate::CacheError::Closed.into());
        }

        let dispatcher = worker.dispatcher.clone();
        *runtime = Some(CacheRuntime::spawn(dispatcher, worker, events));
        Ok(())
    }

    fn live_view(&self) -> Option<Arc<SubtreeView>> {
        (self.shared.state() == CacheState::Live).then(|| self.shared.view())
    }

    /// Cached state of `path`
    pub fn get_current_data(
        &self,
        path: &str,
    ) -> Option<NodeSnapshot> {
        self.live_view()?.nodes.get(path).cloned()
    }

    /// Cached direct children of `path`, keyed by name
    pub fn get_current_children(
        &self,
        path: &str,
    ) -> Option<BTreeMap<String, NodeSnapshot>> {
        let view = self.live_view()?;
        let names = view.children.get(path)?;
        Some(
            names
                .iter()
                .filter_map(|name| {
                    view.nodes
                        .get(&path::join(path, name))
                        .map(|s| (name.clone(), s.clone()))
                })
                .collect(),
        )
    }

    pub fn listenable(&self) -> &ListenerContainer {
        self.shared.listeners()
    }

    pub fn state(&self) -> CacheState {
        self.shared.state()
    }

    /// Releases the watches at every depth and clears the mapping. Idempotent.
    pub async fn close(&self) {
        if !self.shared.close() {
            return;
        }
        if let Some(runtime) = self.runtime.lock().await.take() {
            runtime.shutdown().await;
        }
        debug!(root = %self.root, "subtree cache closed");
    }
}

impl Drop for SubtreeCache {
    fn drop(&mut self) {
        // The runtime is dropped next and stops the worker
        self.shared.close();
    }
}

struct SubtreeWorker {
    client: Arc<dyn StoreClient>,
    dispatcher: Arc<WatchDispatcher>,
    root: String,
    max_depth: usize,
    cache_data: bool,
    shared: Arc<CacheShared<SubtreeView>>,
    view: SubtreeView,
    paused: bool,
}

impl SubtreeWorker {
    fn depth(
        &self,
        path: &str,
    ) -> Option<usize> {
        path::depth_below(&self.root, path)
    }

    /// Tracks `start` and its subtree in pre-order, collecting `NodeAdded`
    ///
    /// Paths already tracked are skipped.
    async fn attach(
        &mut self,
        start: &str,
        added: &mut Vec<CacheEvent>,
    ) -> Result<()> {
        let mut stack = vec![start.to_string()];
        while let Some(current) = stack.pop() {
            let Some(depth) = self.depth(&current) else {
                continue;
            };
            if depth > self.max_depth || self.view.nodes.contains_key(&current) {
                continue;
            }

            self.dispatcher.watch(&current, WatchKind::Data).await?;
            let Some(snapshot) = fetch(self.client.as_ref(), &current, self.cache_data).await? else {
                // The root keeps its existence watch so a later create re-attaches
                if current != self.root {
                    self.dispatcher.unwatch(&current, WatchKind::Data).await;
                }
                continue;
            };

            if current != self.root {
                if let Some(parent) = path::parent(&current) {
                    self.view
                        .children
                        .entry(parent.to_string())
                        .or_default()
                        .insert(path::node_name(&current).to_string());
                }
            }
            self.view.children.entry(current.clone()).or_default();
            self.view.nodes.insert(current.clone(), snapshot.clone());
            added.push(CacheEvent::NodeAdded(snapshot));
            trace!(path = %current, depth, "node attached");

            if depth < self.max_depth {
                self.dispatcher.watch(&current, WatchKind::Children).await?;
                let names = match self.client.list_children(&current).await {
                    Ok(names) => names,
                    Err(e) if e.is_not_found() => continue,
                    Err(e) => return Err(e.into()),
                };
                for name in names.iter().rev() {
                    stack.push(path::join(&current, name));
                }
            }
        }
        Ok(())
    }

    /// Untracks `start` and its descendants, children before parents
    async fn detach(
        &mut self,
        start: &str,
    ) -> Vec<CacheEvent> {
        // Pre-order walk of the index, reversed into post-order
        let mut order = Vec::new();
        let mut stack = vec![start.to_string()];
        while let Some(current) = stack.pop() {
            if let Some(names) = self.view.children.get(&current) {
                stack.extend(names.iter().map(|n| path::join(&current, n)));
            }
            order.push(current);
        }

        let mut removed = Vec::new();
        for current in order.into_iter().rev() {
            self.view.children.remove(&current);
            let snapshot = self.view.nodes.remove(&current);
            if current != self.root {
                self.dispatcher.unwatch(&current, WatchKind::Data).await;
                if let Some(parent) = path::parent(&current) {
                    if let Some(siblings) = self.view.children.get_mut(parent) {
                        siblings.remove(path::node_name(&current));
                    }
                }
            }
            self.dispatcher.unwatch(&current, WatchKind::Children).await;
            if let Some(snapshot) = snapshot {
                trace!(path = %current, "node detached");
                removed.push(CacheEvent::NodeRemoved(snapshot));
            }
        }
        removed
    }

    fn publish_and_emit(
        &self,
        events: Vec<CacheEvent>,
    ) {
        if events.is_empty() {
            return;
        }
        self.shared.publish(self.view.clone());
        for event in events {
            self.shared.emit(event);
        }
    }

    async fn attach_and_report(
        &mut self,
        path: &str,
    ) {
        let mut added = Vec::new();
        if let Err(e) = self.attach(path, &mut added).await {
            trace!(%path, ?e, "attach incomplete");
            if let crate::Error::Store(e) = &e {
                self.shared.record_failure(path, e);
            }
        }
        self.publish_and_emit(added);
    }

    /// Re-reads one node and reconciles it with the mapping
    async fn refresh_node(
        &mut self,
        path: &str,
    ) {
        let next = match fetch(self.client.as_ref(), path, self.cache_data).await {
            Ok(next) => next,
            Err(e) => return self.shared.record_failure(path, &e),
        };
        let tracked = self.view.nodes.get(path).cloned();

        match (tracked, next) {
            (Some(_), None) => {
                let removed = self.detach(path).await;
                self.publish_and_emit(removed);
            }
            (Some(prev), Some(next)) if prev.stat.czxid != next.stat.czxid => {
                // Recreated: drop the old subtree, walk the new one
                let removed = self.detach(path).await;
                self.publish_and_emit(removed);
                self.attach_and_report(path).await;
            }
            (Some(prev), Some(next)) => {
                if let Some(event) = classify(Some(&prev), Some(&next)) {
                    self.view.nodes.insert(path.to_string(), next);
                    self.publish_and_emit(vec![event]);
                }
            }
            (None, Some(_)) => {
                let parent_tracked = path::parent(path).is_some_and(|p| self.view.nodes.contains_key(p));
                if path == self.root || parent_tracked {
                    self.attach_and_report(path).await;
                }
            }
            (None, None) => {}
        }
    }

    /// Re-lists `path` and diffs against the index
    async fn resync_children(
        &mut self,
        path: &str,
    ) {
        if !self.view.nodes.contains_key(path) || self.depth(path).map_or(true, |d| d >= self.max_depth) {
            return;
        }
        let names = match self.client.list_children(path).await {
            Ok(names) => names,
            Err(e) if e.is_not_found() => return self.refresh_node(path).await,
            Err(e) => return self.shared.record_failure(path, &e),
        };
        let listed: BTreeSet<String> = names.into_iter().collect();
        let current = self.view.children.get(path).cloned().unwrap_or_default();

        let mut removed = Vec::new();
        for name in current.difference(&listed) {
            removed.extend(self.detach(&path::join(path, name)).await);
        }
        self.publish_and_emit(removed);

        for name in listed.difference(&current) {
            self.attach_and_report(&path::join(path, name)).await;
        }
    }

    /// Re-reads and re-diffs every tracked path
    async fn resync_all(&mut self) {
        if !self.view.nodes.contains_key(&self.root) {
            let root = self.root.clone();
            return self.refresh_node(&root).await;
        }

        let mut order: Vec<String> = self.view.nodes.keys().cloned().collect();
        order.sort_by_key(|p| self.depth(p));
        for current in order {
            if !self.view.nodes.contains_key(&current) {
                continue;
            }
            self.refresh_node(&current).await;
            self.resync_children(&current).await;
        }
    }

    async fn on_fired(
        &mut self,
        path: &str,
        event_type: WatchEventType,
    ) {
        match event_type {
            WatchEventType::NodeChildrenChanged => self.resync_children(path).await,
            WatchEventType::NodeCreated | WatchEventType::NodeDataChanged | WatchEventType::NodeDeleted => {
                self.refresh_node(path).await
            }
        }
    }
}

#[async_trait::async_trait]
impl CacheWorker for SubtreeWorker {
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
                        self.resync_all().await;
                    }
                }
            }
            _ if self.paused => {}
            DispatchEvent::Fired(event) => self.on_fired(&event.path, event.event_type).await,
            DispatchEvent::Missing { path, .. } => self.refresh_node(&path).await,
            DispatchEvent::Rearmed { path, kind } => match kind {
                WatchKind::Children => self.resync_children(&path).await,
                WatchKind::Data | WatchKind::Either => self.refresh_node(&path).await,
            },
        }
    }
}
