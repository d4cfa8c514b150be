//! Fluent facade over a [`StoreClient`]
//!
//! The framework carries the namespace and operation timeout of a
//! [`ClientConfig`], offers the higher-level create and delete options and
//! builds caches and transaction coordinators that share its client.

use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use nanoid::nanoid;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::warn;

use crate::cache::ChildrenCache;
use crate::cache::ListenerContainer;
use crate::cache::NodeCache;
use crate::cache::SubtreeCache;
use crate::cache::SubtreeCacheBuilder;
use crate::constants::PROTECTED_ID_LEN;
use crate::constants::PROTECTED_PREFIX;
use crate::constants::ROOT_PATH;
use crate::metrics::GUARANTEED_DELETES;
use crate::path;
use crate::ClientConfig;
use crate::CoordConfig;
use crate::CreateMode;
use crate::NamespacedClient;
use crate::NodeSnapshot;
use crate::NodeStat;
use crate::Result;
use crate::StoreClient;
use crate::StoreError;
use crate::StoreResult;
use crate::TransactionCoordinator;

/// Options of [`CoordFramework::create`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CreateOptions {
    pub mode: CreateMode,
    /// Create missing ancestors as empty persistent nodes
    pub creating_parents_if_needed: bool,
    /// Replace the data of an existing node instead of failing
    pub or_set_data: bool,
    /// Prefix the final segment with `_c_<id>-`
    pub with_protection: bool,
}

impl CreateOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mode(
        mut self,
        mode: CreateMode,
    ) -> Self {
        self.mode = mode;
        self
    }

    pub fn creating_parents_if_needed(mut self) -> Self {
        self.creating_parents_if_needed = true;
        self
    }

    pub fn or_set_data(mut self) -> Self {
        self.or_set_data = true;
        self
    }

    pub fn with_protection(mut self) -> Self {
        self.with_protection = true;
        self
    }
}

/// Options of [`CoordFramework::delete`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeleteOptions {
    /// Expected version of the node; `None` matches any
    pub version: Option<i32>,
    /// Remove descendants first, deepest nodes first
    pub deleting_children_if_needed: bool,
    /// Keep retrying in background after a connection-class failure
    pub guaranteed: bool,
}

impl DeleteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn version(
        mut self,
        version: i32,
    ) -> Self {
        self.version = Some(version);
        self
    }

    pub fn deleting_children_if_needed(mut self) -> Self {
        self.deleting_children_if_needed = true;
        self
    }

    pub fn guaranteed(mut self) -> Self {
        self.guaranteed = true;
        self
    }
}

/// Operation run by [`CoordFramework::in_background`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackgroundOp {
    Create {
        path: String,
        data: Bytes,
        options: CreateOptions,
    },
    Delete {
        path: String,
        options: DeleteOptions,
    },
    SetData {
        path: String,
        data: Bytes,
        version: Option<i32>,
    },
    GetData {
        path: String,
    },
    GetChildren {
        path: String,
    },
    CheckExists {
        path: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackgroundKind {
    Create,
    Delete,
    SetData,
    GetData,
    GetChildren,
    CheckExists,
}

impl BackgroundOp {
    pub fn kind(&self) -> BackgroundKind {
        match self {
            BackgroundOp::Create { .. } => BackgroundKind::Create,
            BackgroundOp::Delete { .. } => BackgroundKind::Delete,
            BackgroundOp::SetData { .. } => BackgroundKind::SetData,
            BackgroundOp::GetData { .. } => BackgroundKind::GetData,
            BackgroundOp::GetChildren { .. } => BackgroundKind::GetChildren,
            BackgroundOp::CheckExists { .. } => BackgroundKind::CheckExists,
        }
    }

    pub fn path(&self) -> &str {
        match self {
            BackgroundOp::Create { path, .. }
            | BackgroundOp::Delete { path, .. }
            | BackgroundOp::SetData { path, .. }
            | BackgroundOp::GetData { path }
            | BackgroundOp::GetChildren { path }
            | BackgroundOp::CheckExists { path } => path,
        }
    }
}

/// Successful result of a background operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackgroundOutcome {
    /// Actual path of the created node
    Created(String),
    Deleted,
    DataSet(NodeStat),
    Data(NodeSnapshot),
    Children(Vec<String>),
    Exists(Option<NodeStat>),
}

/// Completion report of a background operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackgroundEvent {
    pub kind: BackgroundKind,
    pub path: String,
    pub outcome: StoreResult<BackgroundOutcome>,
}

pub type BackgroundCallback = Arc<dyn Fn(&BackgroundEvent) + Send + Sync>;

/// Entry point for store operations, caches and transactions
///
/// Cloning is cheap; clones share the client and the background listeners.
#[derive(Clone)]
pub struct CoordFramework {
    client: Arc<dyn StoreClient>,
    config: Arc<CoordConfig>,
    background: Arc<ListenerContainer<BackgroundEvent>>,
}

impl CoordFramework {
    /// Framework with default watch and cache settings
    pub fn new(
        client: Arc<dyn StoreClient>,
        config: ClientConfig,
    ) -> Result<Self> {
        Self::with_config(
            client,
            CoordConfig {
                client: config,
                ..Default::default()
            },
        )
    }

    /// Validates `config` and roots the client under its namespace, if any
    pub fn with_config(
        client: Arc<dyn StoreClient>,
        config: CoordConfig,
    ) -> Result<Self> {
        let config = config.validate()?;
        let client: Arc<dyn StoreClient> = match &config.client.namespace {
            Some(namespace) => Arc::new(NamespacedClient::new(client, namespace)?),
            None => client,
        };
        debug!(namespace = ?config.client.namespace, "framework ready");
        Ok(Self {
            client,
            config: Arc::new(config),
            background: Arc::new(ListenerContainer::default()),
        })
    }

    /// Namespaced client shared by every cache and coordinator
    pub fn client(&self) -> &Arc<dyn StoreClient> {
        &self.client
    }

    pub fn config(&self) -> &CoordConfig {
        &self.config
    }

    /// Runs `op` under the configured operation timeout
    async fn bounded<T>(
        &self,
        op: impl Future<Output = StoreResult<T>>,
    ) -> StoreResult<T> {
        let limit = self.config.client.operation_timeout();
        match tokio::time::timeout(limit, op).await {
            Ok(result) => result,
            Err(_) => {
                warn!(?limit, "store operation timed out");
                Err(StoreError::OperationTimeout(limit))
            }
        }
    }

    /// Creates `path`, returning the actual path of the new node
    ///
    /// # Errors
    /// - [`StoreError::NodeExists`] unless `or_set_data` is set
    /// - [`StoreError::NoParent`] unless `creating_parents_if_needed` is set
    /// - [`StoreError::OperationTimeout`]
    pub async fn create(
        &self,
        path: &str,
        data: impl Into<Bytes>,
        options: CreateOptions,
    ) -> StoreResult<String> {
        path::validate(path)?;
        let data = data.into();
        let target = if options.with_protection {
            protected_path(path)
        } else {
            path.to_string()
        };

        self.bounded(async {
            if options.creating_parents_if_needed {
                self.ensure_parents(&target).await?;
            }
            match self.client.create(&target, data.clone(), options.mode).await {
                Err(StoreError::NodeExists { .. }) if options.or_set_data => {
                    self.client.write(&target, data, None).await?;
                    Ok(target)
                }
                result => result,
            }
        })
        .await
    }

    async fn ensure_parents(
        &self,
        path: &str,
    ) -> StoreResult<()> {
        for ancestor in path::ancestors(path) {
            match self.client.create(&ancestor, Bytes::new(), CreateMode::Persistent).await {
                Ok(_) | Err(StoreError::NodeExists { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    pub async fn check_exists(
        &self,
        path: &str,
    ) -> StoreResult<Option<NodeStat>> {
        self.bounded(self.client.exists(path)).await
    }

    /// Data and stat of `path`; a missing node reads as `exists == false`
    pub async fn get_data(
        &self,
        path: &str,
    ) -> StoreResult<NodeSnapshot> {
        self.bounded(self.client.read(path)).await
    }

    pub async fn get_children(
        &self,
        path: &str,
    ) -> StoreResult<Vec<String>> {
        self.bounded(self.client.list_children(path)).await
    }

    pub async fn set_data(
        &self,
        path: &str,
        data: impl Into<Bytes>,
        version: Option<i32>,
    ) -> StoreResult<NodeStat> {
        let data = data.into();
        self.bounded(self.client.write(path, data, version)).await
    }

    /// Deletes `path`
    ///
    /// With `deleting_children_if_needed` the descendants are removed first;
    /// the version applies to `path` only.
    ///
    /// With `guaranteed`, a connection-class failure is still returned but the
    /// delete is retried in background until it succeeds or the node is gone.
    pub async fn delete(
        &self,
        path: &str,
        options: DeleteOptions,
    ) -> StoreResult<()> {
        let result = self.delete_once(path, options).await;
        match &result {
            Err(e) if options.guaranteed && e.is_connection_error() => {
                debug!(%path, ?e, "delete outcome unknown, retrying in background");
                GUARANTEED_DELETES.with_label_values(&["scheduled"]).inc();
                let framework = self.clone();
                let path = path.to_string();
                tokio::spawn(async move { framework.retry_delete(path, options).await });
            }
            _ => {}
        }
        result
    }

    async fn delete_once(
        &self,
        path: &str,
        options: DeleteOptions,
    ) -> StoreResult<()> {
        self.bounded(async {
            if options.deleting_children_if_needed {
                self.delete_descendants(path).await?;
            }
            self.client.delete(path, options.version).await
        })
        .await
    }

    /// Background half of a guaranteed delete
    async fn retry_delete(
        &self,
        path: String,
        options: DeleteOptions,
    ) {
        let delay = self.config.client.guaranteed_delete_retry();
        let mut attempts = 0u32;
        loop {
            self.connected().await;
            tokio::time::sleep(delay).await;
            attempts += 1;

            match self.delete_once(&path, options).await {
                Ok(()) | Err(StoreError::NotFound { .. }) => {
                    debug!(%path, attempts, "guaranteed delete completed");
                    GUARANTEED_DELETES.with_label_values(&["deleted"]).inc();
                    return;
                }
                Err(e) if e.is_connection_error() => {
                    debug!(%path, attempts, ?e, "guaranteed delete still pending");
                }
                Err(e) => {
                    warn!(%path, attempts, ?e, "guaranteed delete abandoned");
                    GUARANTEED_DELETES.with_label_values(&["abandoned"]).inc();
                    return;
                }
            }
        }
    }

    /// Resolves once the session is connected, without a time limit
    async fn connected(&self) {
        let mut states = self.client.subscribe_connection_state();
        while !self.client.connection_state().is_connected() {
            match states.recv().await {
                Ok(state) if state.is_connected() => return,
                Ok(_) | Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                // No more transitions; fall back to the retry pace
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            }
        }
    }

    async fn delete_descendants(
        &self,
        path: &str,
    ) -> StoreResult<()> {
        // Pre-order listing, deleted in reverse so children go first
        let mut order = Vec::new();
        let mut stack = vec![path.to_string()];
        while let Some(current) = stack.pop() {
            let names = match self.client.list_children(&current).await {
                Ok(names) => names,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            };
            for name in names {
                let child = path::join(&current, &name);
                order.push(child.clone());
                stack.push(child);
            }
        }

        for descendant in order.iter().rev() {
            match self.client.delete(descendant, None).await {
                Ok(()) | Err(StoreError::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn run(
        &self,
        op: BackgroundOp,
    ) -> StoreResult<BackgroundOutcome> {
        match op {
            BackgroundOp::Create { path, data, options } => {
                self.create(&path, data, options).await.map(BackgroundOutcome::Created)
            }
            BackgroundOp::Delete { path, options } => {
                self.delete(&path, options).await.map(|()| BackgroundOutcome::Deleted)
            }
            BackgroundOp::SetData { path, data, version } => {
                self.set_data(&path, data, version).await.map(BackgroundOutcome::DataSet)
            }
            BackgroundOp::GetData { path } => self.get_data(&path).await.map(BackgroundOutcome::Data),
            BackgroundOp::GetChildren { path } => {
                self.get_children(&path).await.map(BackgroundOutcome::Children)
            }
            BackgroundOp::CheckExists { path } => {
                self.check_exists(&path).await.map(BackgroundOutcome::Exists)
            }
        }
    }

    /// Runs `op` on a background task
    ///
    /// The completion is reported to `callback` when given, otherwise to
    /// every background listener of the framework.
    pub fn in_background(
        &self,
        op: BackgroundOp,
        callback: Option<BackgroundCallback>,
    ) -> JoinHandle<()> {
        let framework = self.clone();
        tokio::spawn(async move {
            let kind = op.kind();
            let path = op.path().to_string();
            let outcome = framework.run(op).await;
            if let Err(e) = &outcome {
                debug!(?kind, %path, ?e, "background operation failed");
            }

            let event = BackgroundEvent { kind, path, outcome };
            match callback {
                Some(callback) => callback(&event),
                None => framework.background.notify(&event),
            }
        })
    }

    /// Receives background completions that carry no callback
    pub fn background_listenable(&self) -> &ListenerContainer<BackgroundEvent> {
        &self.background
    }

    /// Waits up to `connection_timeout_in_ms` for a connected session
    pub async fn wait_until_connected(&self) -> bool {
        let mut states = self.client.subscribe_connection_state();
        if self.client.connection_state().is_connected() {
            return true;
        }

        let limit = self.config.client.connection_timeout();
        let connected = tokio::time::timeout(limit, async {
            loop {
                match states.recv().await {
                    Ok(state) if state.is_connected() => return true,
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                        if self.client.connection_state().is_connected() {
                            return true;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return false,
                }
            }
        })
        .await;
        connected.unwrap_or(false)
    }

    // -
    // Factories

    pub fn node_cache(
        &self,
        path: &str,
    ) -> Result<NodeCache> {
        NodeCache::with_config(self.client.clone(), path, self.config.watch.clone())
    }

    /// Children cache with the configured `cache_data`
    pub fn children_cache(
        &self,
        path: &str,
    ) -> Result<ChildrenCache> {
        ChildrenCache::with_config(
            self.client.clone(),
            path,
            self.config.cache.cache_data,
            self.config.watch.clone(),
        )
    }

    /// Starts `cache` with the configured `children_start_mode`
    pub async fn start_children_cache(
        &self,
        cache: &ChildrenCache,
    ) -> Result<()> {
        cache.start(self.config.cache.children_start_mode).await
    }

    /// Subtree cache builder preset with the configured depth and data policy
    pub fn subtree_cache(
        &self,
        root: &str,
    ) -> SubtreeCacheBuilder {
        SubtreeCache::builder(self.client.clone(), root)
            .max_depth(self.config.cache.max_depth)
            .cache_data(self.config.cache.cache_data)
            .watch_config(self.config.watch.clone())
    }

    pub fn transaction_coordinator(&self) -> TransactionCoordinator {
        TransactionCoordinator::new(self.client.clone())
    }
}

/// `path` with its final segment renamed to `_c_<id>-<name>`
fn protected_path(path: &str) -> String {
    let name = path::node_name(path);
    let protected = format!("{PROTECTED_PREFIX}{}-{name}", nanoid!(PROTECTED_ID_LEN));
    path::join(path::parent(path).unwrap_or(ROOT_PATH), &protected)
}

/// Removes the protection prefix from a node name, if present
pub fn unprotected_name(name: &str) -> &str {
    name.strip_prefix(PROTECTED_PREFIX)
        .and_then(|rest| rest.get(PROTECTED_ID_LEN..))
        .and_then(|rest| rest.strip_prefix('-'))
        .unwrap_or(name)
}
