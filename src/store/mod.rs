//! Store client contract
//!
//! The coordination store is an external collaborator. Everything in this
//! crate reaches it through [`StoreClient`]:
//! - [`MemStore`] - in-memory reference store with ZooKeeper semantics
//! - [`NamespacedClient`] - roots another client under a namespace prefix

mod mem_store;
mod namespaced;
mod types;

pub use mem_store::*;
pub use namespaced::*;
pub use types::*;


use bytes::Bytes;
#[cfg(test)]
use mockall::automock;
use tokio::sync::broadcast;

use crate::StoreResult;

/// Operation interface of the coordination store
///
/// Implementations are shared across caches and coordinators, so every
/// method takes `&self` and must be safe to call concurrently.
#[cfg_attr(test, automock)]
#[async_trait::async_trait]
pub trait StoreClient: Send + Sync + 'static {
    /// Reads data and stat of `path`
    ///
    /// A missing node is reported as a snapshot with `exists == false`.
    async fn read(
        &self,
        path: &str,
    ) -> StoreResult<NodeSnapshot>;

    async fn exists(
        &self,
        path: &str,
    ) -> StoreResult<Option<NodeStat>>;

    /// Replaces the data of `path`, returning the new stat
    async fn write(
        &self,
        path: &str,
        data: Bytes,
        expected_version: Option<i32>,
    ) -> StoreResult<NodeStat>;

    /// Creates `path`, returning the actual path (sequential nodes get a suffix)
    async fn create(
        &self,
        path: &str,
        data: Bytes,
        mode: CreateMode,
    ) -> StoreResult<String>;

    async fn delete(
        &self,
        path: &str,
        expected_version: Option<i32>,
    ) -> StoreResult<()>;

    /// Names of the direct children of `path`, sorted
    async fn list_children(
        &self,
        path: &str,
    ) -> StoreResult<Vec<String>>;

    /// Registers a watch that fires at most once
    async fn watch_once(
        &self,
        path: &str,
        kind: WatchKind,
    ) -> StoreResult<OneShotWatch>;

    /// Releases a watch that has not fired yet; unknown ids are ignored
    async fn remove_watch(
        &self,
        id: WatchId,
    ) -> StoreResult<()>;

    /// Applies every op or none of them
    async fn submit_transaction(
        &self,
        ops: Vec<TransactionOp>,
    ) -> StoreResult<Vec<OpResult>>;

    fn connection_state(&self) -> ConnectionState;

    /// Connection transitions, delivered to every subscriber
    fn subscribe_connection_state(&self) -> broadcast::Receiver<ConnectionState>;
}
