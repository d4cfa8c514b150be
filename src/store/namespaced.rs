use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::broadcast;
use tracing::debug;

use super::ConnectionState;
use super::CreateMode;
use super::NodeSnapshot;
use super::NodeStat;
use super::OneShotWatch;
use super::OpResult;
use super::StoreClient;
use super::TransactionOp;
use super::WatchId;
use super::WatchKind;
use crate::path;
use crate::StoreError;
use crate::StoreResult;

/// Roots every path of an inner client under `/<namespace>`
///
/// Callers use paths relative to the namespace; returned paths, watch events
/// and error paths are mapped back. The namespace node chain is created on
/// the first create.
pub struct NamespacedClient {
    inner: Arc<dyn StoreClient>,
    root: String,
    root_ensured: AtomicBool,
}

impl NamespacedClient {
    /// # Errors
    /// [`StoreError::InvalidPath`] if `namespace` does not form a valid path
    pub fn new(
        inner: Arc<dyn StoreClient>,
        namespace: &str,
    ) -> StoreResult<Self> {
        let root = path::namespace_root(namespace);
        path::validate(&root)?;
        Ok(Self {
            inner,
            root,
            root_ensured: AtomicBool::new(false),
        })
    }

    /// Absolute store path of the namespace
    pub fn namespace_root(&self) -> &str {
        &self.root
    }

    fn fix(
        &self,
        client_path: &str,
    ) -> String {
        path::apply_namespace(&self.root, client_path)
    }

    fn unfix(
        &self,
        store_path: &str,
    ) -> String {
        path::strip_namespace(&self.root, store_path)
    }

    fn unfix_error(
        &self,
        e: StoreError,
    ) -> StoreError {
        e.map_path(&|p| self.unfix(p))
    }

    async fn ensure_root(&self) -> StoreResult<()> {
        if self.root_ensured.load(Ordering::Acquire) {
            return Ok(());
        }
        let mut chain = path::ancestors(&self.root);
        chain.push(self.root.clone());
        for node in chain {
            match self.inner.create(&node, Bytes::new(), CreateMode::Persistent).await {
                Ok(_) | Err(StoreError::NodeExists { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        debug!(namespace = %self.root, "namespace ensured");
        self.root_ensured.store(true, Ordering::Release);
        Ok(())
    }
}

#[async_trait::async_trait]
impl StoreClient for NamespacedClient {
    async fn read(
        &self,
        path: &str,
    ) -> StoreResult<NodeSnapshot> {
        path::validate(path)?;
        let mut snapshot = self.inner.read(&self.fix(path)).await.map_err(|e| self.unfix_error(e))?;
        snapshot.path = path.to_string();
        Ok(snapshot)
    }

    async fn exists(
        &self,
        path: &str,
    ) -> StoreResult<Option<NodeStat>> {
        path::validate(path)?;
        self.inner.exists(&self.fix(path)).await.map_err(|e| self.unfix_error(e))
    }

    async fn write(
        &self,
        path: &str,
        data: Bytes,
        expected_version: Option<i32>,
    ) -> StoreResult<NodeStat> {
        path::validate(path)?;
        self.inner
            .write(&self.fix(path), data, expected_version)
            .await
            .map_err(|e| self.unfix_error(e))
    }

    async fn create(
        &self,
        path: &str,
        data: Bytes,
        mode: CreateMode,
    ) -> StoreResult<String> {
        path::validate(path)?;
        self.ensure_root().await?;
        let actual = self
            .inner
            .create(&self.fix(path), data, mode)
            .await
            .map_err(|e| self.unfix_error(e))?;
        Ok(self.unfix(&actual))
    }

    async fn delete(
        &self,
        path: &str,
        expected_version: Option<i32>,
    ) -> StoreResult<()> {
        path::validate(path)?;
        self.inner
            .delete(&self.fix(path), expected_version)
            .await
            .map_err(|e| self.unfix_error(e))
    }

    async fn list_children(
        &self,
        path: &str,
    ) -> StoreResult<Vec<String>> {
        path::validate(path)?;
        self.inner.list_children(&self.fix(path)).await.map_err(|e| self.unfix_error(e))
    }

    async fn watch_once(
        &self,
        path: &str,
        kind: WatchKind,
    ) -> StoreResult<OneShotWatch> {
        path::validate(path)?;
        let watch = self
            .inner
            .watch_once(&self.fix(path), kind)
            .await
            .map_err(|e| self.unfix_error(e))?;
        Ok(watch.relative_to(self.root.clone()))
    }

    async fn remove_watch(
        &self,
        id: WatchId,
    ) -> StoreResult<()> {
        self.inner.remove_watch(id).await
    }

    async fn submit_transaction(
        &self,
        ops: Vec<TransactionOp>,
    ) -> StoreResult<Vec<OpResult>> {
        if ops.iter().any(|op| matches!(op, TransactionOp::Create { .. })) {
            self.ensure_root().await?;
        }
        let ops = ops.into_iter().map(|op| op.map_path(|p| self.fix(p))).collect();
        let results = self.inner.submit_transaction(ops).await.map_err(|e| self.unfix_error(e))?;
        Ok(results.into_iter().map(|r| r.map_path(|p| self.unfix(p))).collect())
    }

    fn connection_state(&self) -> ConnectionState {
        self.inner.connection_state()
    }

    fn subscribe_connection_state(&self) -> broadcast::Receiver<ConnectionState> {
        self.inner.subscribe_connection_state()
    }
}
