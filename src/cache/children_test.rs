use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing_test::traced_test;

use super::*;
use crate::test_utils::bytes;
use crate::test_utils::fast_watch_config;
use crate::test_utils::seed;
use crate::test_utils::wait_until;
use crate::test_utils::EventRecorder;
use crate::path;
use crate::ConnectionState;
use crate::CreateMode;
use crate::MemStore;
use crate::NodeSnapshot;
use crate::NodeStat;
use crate::OneShotWatch;
use crate::OpResult;
use crate::StoreClient;
use crate::StoreResult;
use crate::TransactionOp;
use crate::WatchId;
use crate::WatchKind;

fn children_cache(
    store: &MemStore,
    path: &str,
    cache_data: bool,
) -> ChildrenCache {
    ChildrenCache::with_config(Arc::new(store.clone()), path, cache_data, fast_watch_config()).unwrap()
}

fn is_added(e: &CacheEvent) -> bool {
    matches!(e, CacheEvent::NodeAdded(_))
}

fn is_removed(e: &CacheEvent) -> bool {
    matches!(e, CacheEvent::NodeRemoved(_))
}

fn is_updated(e: &CacheEvent) -> bool {
    matches!(e, CacheEvent::NodeUpdated(_))
}

#[tokio::test]
#[traced_test]
async fn test_root_children_added_removed_updated() {
    let store = MemStore::new();
    seed(&store, &[("/a", "a"), ("/b", "b")]).await;

    let cache = children_cache(&store, "/", true);
    let recorder = EventRecorder::attach(cache.listenable());
    cache.start(StartMode::Normal).await.unwrap();

    assert_eq!(recorder.paths(is_added), vec!["/a", "/b"]);
    assert_eq!(
        cache.get_current_children().keys().cloned().collect::<Vec<_>>(),
        vec!["a", "b"]
    );

    store.create("/c", bytes("c"), CreateMode::Persistent).await.unwrap();
    recorder.wait_for(3).await;
    assert_eq!(recorder.paths(is_added), vec!["/a", "/b", "/c"]);

    store.delete("/a", None).await.unwrap();
    recorder.wait_for(4).await;
    assert_eq!(recorder.paths(is_removed), vec!["/a"]);

    store.write("/b", bytes("b2"), None).await.unwrap();
    recorder.wait_for(5).await;
    assert_eq!(recorder.paths(is_updated), vec!["/b"]);
    assert_eq!(cache.get_current_data("b").unwrap().data, Some(bytes("b2")));

    assert_eq!(
        cache.get_current_children().keys().cloned().collect::<Vec<_>>(),
        vec!["b", "c"]
    );
    cache.close().await;
}

#[tokio::test]
async fn test_grandchildren_are_not_reported() {
    let store = MemStore::new();
    seed(&store, &[("/p", ""), ("/p/a", "")]).await;

    let cache = children_cache(&store, "/p", true);
    let recorder = EventRecorder::attach(cache.listenable());
    cache.start(StartMode::BuildInitialCache).await.unwrap();

    store.create("/p/a/deep", bytes("x"), CreateMode::Persistent).await.unwrap();
    store.create("/p/marker", bytes("x"), CreateMode::Persistent).await.unwrap();
    recorder.wait_for(1).await;

    assert_eq!(recorder.paths(|_| true), vec!["/p/marker"]);
    assert!(cache.get_current_data("deep").is_none());
}

#[tokio::test]
async fn test_start_modes() {
    let store = MemStore::new();
    seed(&store, &[("/p", ""), ("/p/a", ""), ("/p/b", "")]).await;

    let normal = children_cache(&store, "/p", true);
    let normal_events = EventRecorder::attach(normal.listenable());
    normal.start(StartMode::Normal).await.unwrap();
    assert_eq!(normal_events.len(), 2);
    assert!(normal_events.events().iter().all(is_added));

    let post = children_cache(&store, "/p", true);
    let post_events = EventRecorder::attach(post.listenable());
    post.start(StartMode::PostInitializedEvent).await.unwrap();
    let events = post_events.events();
    assert_eq!(events.len(), 3);
    assert_eq!(events[2], CacheEvent::Initialized);

    let silent = children_cache(&store, "/p", true);
    let silent_events = EventRecorder::attach(silent.listenable());
    silent.start(StartMode::BuildInitialCache).await.unwrap();
    assert_eq!(silent_events.len(), 0);
    assert_eq!(silent.get_current_children().len(), 2);
}

#[tokio::test]
#[traced_test]
async fn test_missing_parent_attaches_once_created() {
    let store = MemStore::new();
    let cache = children_cache(&store, "/later", true);
    let recorder = EventRecorder::attach(cache.listenable());
    cache.start(StartMode::Normal).await.unwrap();
    assert!(cache.get_current_children().is_empty());

    store.create("/later", bytes(""), CreateMode::Persistent).await.unwrap();
    // Parent data watch plus the re-armed children watch
    wait_until(|| store.watch_count() == 2).await;

    store.create("/later/one", bytes("1"), CreateMode::Persistent).await.unwrap();
    recorder.wait_for(1).await;
    assert_eq!(recorder.paths(is_added), vec!["/later/one"]);
}

#[tokio::test]
#[traced_test]
async fn test_parent_recreated_is_followed() {
    let store = MemStore::new();
    seed(&store, &[("/p", ""), ("/p/a", "")]).await;

    let cache = children_cache(&store, "/p", true);
    let recorder = EventRecorder::attach(cache.listenable());
    cache.start(StartMode::BuildInitialCache).await.unwrap();

    store.delete("/p/a", None).await.unwrap();
    recorder.wait_for(1).await;
    store.delete("/p", None).await.unwrap();
    // Only the existence watch on the parent survives
    wait_until(|| store.watch_count() == 1).await;

    store.create("/p", bytes(""), CreateMode::Persistent).await.unwrap();
    wait_until(|| store.watch_count() == 2).await;
    store.create("/p/b", bytes(""), CreateMode::Persistent).await.unwrap();

    recorder.wait_for(2).await;
    assert_eq!(recorder.paths(is_removed), vec!["/p/a"]);
    assert_eq!(recorder.paths(is_added), vec!["/p/b"]);
}

#[tokio::test]
async fn test_stats_only_without_data() {
    let store = MemStore::new();
    seed(&store, &[("/p", ""), ("/p/a", "payload")]).await;

    let cache = children_cache(&store, "/p", false);
    cache.start(StartMode::BuildInitialCache).await.unwrap();

    let child = cache.get_current_data("a").unwrap();
    assert!(child.exists);
    assert_eq!(child.data, None);
    assert_eq!(child.stat.data_length, "payload".len());
}

#[tokio::test]
async fn test_close_releases_every_watch() {
    let store = MemStore::new();
    seed(&store, &[("/p", ""), ("/p/a", ""), ("/p/b", "")]).await;

    let cache = children_cache(&store, "/p", true);
    cache.start(StartMode::Normal).await.unwrap();
    // Parent data + parent children + one per child
    assert_eq!(store.watch_count(), 4);

    cache.close().await;
    cache.close().await;
    assert_eq!(store.watch_count(), 0);
    assert!(cache.get_current_children().is_empty());
    assert_eq!(cache.state(), CacheState::Closed);
}

#[tokio::test]
#[traced_test]
async fn test_dropped_cache_releases_watches_and_goes_silent() {
    let store = MemStore::new();
    seed(&store, &[("/p", ""), ("/p/a", "")]).await;

    let cache = children_cache(&store, "/p", true);
    let recorder = EventRecorder::attach(cache.listenable());
    cache.start(StartMode::BuildInitialCache).await.unwrap();
    assert_eq!(store.watch_count(), 3);

    drop(cache);
    let watched = store.clone();
    wait_until(move || watched.watch_count() == 0).await;

    store.create("/p/b", bytes(""), CreateMode::Persistent).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(recorder.len(), 0);
}

/// Deletes every child of `/p` right after listing it
struct VanishingChildren(MemStore);

#[async_trait::async_trait]
impl StoreClient for VanishingChildren {
    async fn read(
        &self,
        path: &str,
    ) -> StoreResult<NodeSnapshot> {
        self.0.read(path).await
    }

    async fn exists(
        &self,
        path: &str,
    ) -> StoreResult<Option<NodeStat>> {
        self.0.exists(path).await
    }

    async fn write(
        &self,
        path: &str,
        data: ::bytes::Bytes,
        expected_version: Option<i32>,
    ) -> StoreResult<NodeStat> {
        self.0.write(path, data, expected_version).await
    }

    async fn create(
        &self,
        path: &str,
        data: ::bytes::Bytes,
        mode: CreateMode,
    ) -> StoreResult<String> {
        self.0.create(path, data, mode).await
    }

    async fn delete(
        &self,
        path: &str,
        expected_version: Option<i32>,
    ) -> StoreResult<()> {
        self.0.delete(path, expected_version).await
    }

    async fn list_children(
        &self,
        path: &str,
    ) -> StoreResult<Vec<String>> {
        let names = self.0.list_children(path).await?;
        if path == "/p" {
            for name in &names {
                self.0.delete(&path::join(path, name), None).await?;
            }
        }
        Ok(names)
    }

    async fn watch_once(
        &self,
        path: &str,
        kind: WatchKind,
    ) -> StoreResult<OneShotWatch> {
        self.0.watch_once(path, kind).await
    }

    async fn remove_watch(
        &self,
        id: WatchId,
    ) -> StoreResult<()> {
        self.0.remove_watch(id).await
    }

    async fn submit_transaction(
        &self,
        ops: Vec<TransactionOp>,
    ) -> StoreResult<Vec<OpResult>> {
        self.0.submit_transaction(ops).await
    }

    fn connection_state(&self) -> ConnectionState {
        self.0.connection_state()
    }

    fn subscribe_connection_state(&self) -> broadcast::Receiver<ConnectionState> {
        self.0.subscribe_connection_state()
    }
}

#[tokio::test]
#[traced_test]
async fn test_child_deleted_between_list_and_read_keeps_no_watch() {
    let store = MemStore::new();
    seed(&store, &[("/p", ""), ("/p/a", "")]).await;

    let client = Arc::new(VanishingChildren(store.clone()));
    let cache = ChildrenCache::with_config(client, "/p", true, fast_watch_config()).unwrap();
    cache.start(StartMode::Normal).await.unwrap();

    assert!(cache.get_current_children().is_empty());
    // Parent data + parent children only
    let watched = store.clone();
    wait_until(move || watched.watch_count() == 2).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(store.watch_count(), 2);
    cache.close().await;
}

#[tokio::test]
#[traced_test]
async fn test_children_changed_while_lost_are_resynced() {
    let store = MemStore::new();
    let other = store.connect();
    seed(&store, &[("/p", ""), ("/p/a", "")]).await;

    let cache = children_cache(&store, "/p", true);
    let recorder = EventRecorder::attach(cache.listenable());
    cache.start(StartMode::BuildInitialCache).await.unwrap();

    store.lose_session();
    recorder.wait_for(1).await;
    other.delete("/p/a", None).await.unwrap();
    other.create("/p/b", bytes(""), CreateMode::Persistent).await.unwrap();
    store.reconnect();

    wait_until(|| cache.get_current_children().keys().cloned().collect::<Vec<_>>() == vec!["b"]).await;
    let events = recorder.events();
    assert_eq!(events[0], CacheEvent::ConnectionLost);
    assert_eq!(events[1], CacheEvent::ConnectionReconnected);
    assert_eq!(recorder.paths(is_removed), vec!["/p/a"]);
    assert_eq!(recorder.paths(is_added), vec!["/p/b"]);
}
