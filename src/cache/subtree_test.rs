use std::sync::Arc;

use tracing_test::traced_test;

use super::*;
use crate::test_utils::bytes;
use crate::test_utils::fast_watch_config;
use crate::test_utils::seed;
use crate::test_utils::wait_until;
use crate::test_utils::EventRecorder;
use crate::CreateMode;
use crate::MemStore;

fn subtree(
    store: &MemStore,
    root: &str,
    max_depth: u32,
) -> SubtreeCache {
    SubtreeCache::builder(Arc::new(store.clone()), root)
        .max_depth(max_depth)
        .watch_config(fast_watch_config())
        .build()
        .unwrap()
}

fn is_added(e: &CacheEvent) -> bool {
    matches!(e, CacheEvent::NodeAdded(_))
}

fn is_removed(e: &CacheEvent) -> bool {
    matches!(e, CacheEvent::NodeRemoved(_))
}

#[tokio::test]
#[traced_test]
async fn test_initialized_follows_initial_population() {
    let store = MemStore::new();
    seed(&store, &[("/root", ""), ("/root/a", ""), ("/root/a/x", ""), ("/root/b", "")]).await;

    let cache = subtree(&store, "/root", 8);
    let recorder = EventRecorder::attach(cache.listenable());
    cache.start().await.unwrap();

    let events = recorder.events();
    assert_eq!(events.len(), 5);
    assert_eq!(events[4], CacheEvent::Initialized);
    // Depth-first, parents before children
    assert_eq!(
        recorder.paths(is_added),
        vec!["/root", "/root/a", "/root/a/x", "/root/b"]
    );

    store.create("/root/b/y", bytes("y"), CreateMode::Persistent).await.unwrap();
    let events = recorder.wait_for(6).await;
    assert!(matches!(&events[5], CacheEvent::NodeAdded(s) if s.path == "/root/b/y"));
    assert_eq!(
        events.iter().filter(|e| **e == CacheEvent::Initialized).count(),
        1
    );
}

#[tokio::test]
#[traced_test]
async fn test_max_depth_bounds_tracking() {
    let store = MemStore::new();
    seed(&store, &[("/root", ""), ("/root/a", "")]).await;

    let cache = subtree(&store, "/root", 1);
    let recorder = EventRecorder::attach(cache.listenable());
    cache.start().await.unwrap();
    recorder.clear();

    // Depth 2 is beyond the limit
    store.create("/root/a/deep", bytes(""), CreateMode::Persistent).await.unwrap();
    // Depth 1 is tracked
    store.create("/root/b", bytes(""), CreateMode::Persistent).await.unwrap();

    recorder.wait_for(1).await;
    assert_eq!(recorder.paths(|_| true), vec!["/root/b"]);
    assert_eq!(cache.get_current_data("/root/a/deep"), None);
    assert!(cache.get_current_data("/root/b").is_some());
    assert_eq!(
        cache.get_current_children("/root").unwrap().keys().cloned().collect::<Vec<_>>(),
        vec!["a", "b"]
    );
}

#[tokio::test]
async fn test_max_depth_zero_tracks_root_only() {
    let store = MemStore::new();
    seed(&store, &[("/root", ""), ("/root/a", "")]).await;

    let cache = subtree(&store, "/root", 0);
    cache.start().await.unwrap();

    assert!(cache.get_current_data("/root").is_some());
    assert_eq!(cache.get_current_data("/root/a"), None);
    assert_eq!(cache.get_current_children("/root").map(|c| c.len()), Some(0));
    assert_eq!(store.watch_count(), 1);
}

#[tokio::test]
#[traced_test]
async fn test_removal_reports_children_before_parents() {
    let store = MemStore::new();
    seed(&store, &[("/root", ""), ("/root/a", ""), ("/root/a/x", ""), ("/root/a/x/y", "")]).await;

    let cache = subtree(&store, "/root", 8);
    let recorder = EventRecorder::attach(cache.listenable());
    cache.start().await.unwrap();
    recorder.clear();

    for path in ["/root/a/x/y", "/root/a/x", "/root/a"] {
        store.delete(path, None).await.unwrap();
    }

    recorder.wait_for(3).await;
    assert_eq!(
        recorder.paths(is_removed),
        vec!["/root/a/x/y", "/root/a/x", "/root/a"]
    );
    wait_until(|| cache.get_current_children("/root").is_some_and(|c| c.is_empty())).await;
}

#[tokio::test]
async fn test_accessors_are_empty_until_live() {
    let store = MemStore::new();
    seed(&store, &[("/root", "")]).await;

    let cache = subtree(&store, "/root", 4);
    assert_eq!(cache.state(), CacheState::Pending);
    assert_eq!(cache.get_current_data("/root"), None);
    assert_eq!(cache.get_current_children("/root"), None);

    cache.start().await.unwrap();
    assert!(cache.get_current_data("/root").is_some());
    assert_eq!(cache.get_current_data("/elsewhere"), None);
}

#[tokio::test]
#[traced_test]
async fn test_root_deleted_and_recreated() {
    let store = MemStore::new();
    seed(&store, &[("/root", "v1")]).await;

    let cache = subtree(&store, "/root", 4);
    let recorder = EventRecorder::attach(cache.listenable());
    cache.start().await.unwrap();
    recorder.clear();

    store.delete("/root", None).await.unwrap();
    recorder.wait_for(1).await;
    assert_eq!(recorder.paths(is_removed), vec!["/root"]);
    assert_eq!(cache.get_current_data("/root"), None);

    store.create("/root", bytes("v2"), CreateMode::Persistent).await.unwrap();
    recorder.wait_for(2).await;
    assert_eq!(recorder.paths(is_added), vec!["/root"]);

    wait_until(|| store.watch_count() == 2).await;
    store.create("/root/kid", bytes(""), CreateMode::Persistent).await.unwrap();
    recorder.wait_for(3).await;
    assert_eq!(recorder.paths(is_added), vec!["/root", "/root/kid"]);
}

#[tokio::test]
#[traced_test]
async fn test_data_change_reports_update() {
    let store = MemStore::new();
    seed(&store, &[("/root", ""), ("/root/a", "old")]).await;

    let cache = subtree(&store, "/root", 4);
    let recorder = EventRecorder::attach(cache.listenable());
    cache.start().await.unwrap();
    recorder.clear();

    store.write("/root/a", bytes("new"), None).await.unwrap();
    let events = recorder.wait_for(1).await;
    assert!(matches!(&events[0], CacheEvent::NodeUpdated(s) if s.path == "/root/a"));
    assert_eq!(cache.get_current_data("/root/a").unwrap().data, Some(bytes("new")));
}

#[tokio::test]
async fn test_close_releases_watches_at_every_depth() {
    let store = MemStore::new();
    seed(&store, &[("/root", ""), ("/root/a", ""), ("/root/a/x", "")]).await;

    let cache = subtree(&store, "/root", 8);
    cache.start().await.unwrap();
    // Data and children watch per node
    assert_eq!(store.watch_count(), 6);

    cache.close().await;
    cache.close().await;
    assert_eq!(store.watch_count(), 0);
    assert_eq!(cache.get_current_data("/root"), None);
    assert_eq!(cache.state(), CacheState::Closed);
}

#[tokio::test]
#[traced_test]
async fn test_dropped_cache_releases_watches_and_goes_silent() {
    let store = MemStore::new();
    seed(&store, &[("/root", ""), ("/root/a", "")]).await;

    let cache = subtree(&store, "/root", 8);
    let recorder = EventRecorder::attach(cache.listenable());
    cache.start().await.unwrap();
    assert_eq!(store.watch_count(), 4);
    recorder.clear();

    drop(cache);
    let watched = store.clone();
    wait_until(move || watched.watch_count() == 0).await;

    store.create("/root/b", bytes(""), CreateMode::Persistent).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(recorder.len(), 0);
}

#[tokio::test]
#[traced_test]
async fn test_resync_after_session_loss() {
    let store = MemStore::new();
    let other = store.connect();
    seed(&store, &[("/root", ""), ("/root/a", "")]).await;

    let cache = subtree(&store, "/root", 4);
    let recorder = EventRecorder::attach(cache.listenable());
    cache.start().await.unwrap();
    recorder.clear();

    store.lose_session();
    recorder.wait_for(1).await;
    other.delete("/root/a", None).await.unwrap();
    other.create("/root/b", bytes(""), CreateMode::Persistent).await.unwrap();
    store.reconnect();

    wait_until(|| {
        cache
            .get_current_children("/root")
            .is_some_and(|c| c.keys().cloned().collect::<Vec<_>>() == vec!["b"])
    })
    .await;
    assert_eq!(recorder.paths(is_removed), vec!["/root/a"]);
    assert_eq!(recorder.paths(is_added), vec!["/root/b"]);
}
