use bytes::Bytes;
use coord_cache::CacheEvent;
use coord_cache::CacheState;
use coord_cache::CreateOptions;
use coord_cache::DeleteOptions;
use coord_cache::StartMode;
use coord_cache::StoreClient;
use tracing_test::traced_test;

use crate::common::describe;
use crate::common::seed;
use crate::common::setup;
use crate::common::wait_until;
use crate::common::Recorder;

/// Node cache on a path that does not exist yet
#[tokio::test]
#[traced_test]
async fn test_node_cache_on_missing_path() {
    let (_store, framework) = setup(None);
    let cache = framework.node_cache("/x").unwrap();
    let recorder = Recorder::attach(cache.listenable());
    cache.start(false).await.unwrap();
    assert!(recorder.events().is_empty());

    framework.create("/x", "v1", CreateOptions::new()).await.unwrap();
    let events = recorder.wait_for(1).await;
    assert!(matches!(&events[0], CacheEvent::NodeAdded(s) if s.exists && s.path == "/x"));

    cache.close().await;
}

/// The node cache ends on the last state of a change burst
#[tokio::test]
#[traced_test]
async fn test_node_cache_converges() {
    let (_store, framework) = setup(Some("converge"));
    framework.create("/n", "0", CreateOptions::new()).await.unwrap();

    let cache = framework.node_cache("/n").unwrap();
    cache.start(true).await.unwrap();

    for i in 1..=50 {
        framework.set_data("/n", i.to_string(), None).await.unwrap();
    }

    let expected = framework.get_data("/n").await.unwrap();
    wait_until(|| cache.get_current_data().as_ref() == Some(&expected)).await;
    assert_eq!(expected.version(), 50);
}

/// Children cache on `/` listing `{a, b}`
#[tokio::test]
#[traced_test]
async fn test_children_cache_on_root() {
    let (store, framework) = setup(None);
    seed(&store, &[("/a", ""), ("/b", "")]).await;

    let cache = framework.children_cache("/").unwrap();
    let recorder = Recorder::attach(cache.listenable());
    cache.start(StartMode::BuildInitialCache).await.unwrap();

    framework.create("/c", Bytes::new(), CreateOptions::new()).await.unwrap();
    recorder.wait_for(1).await;
    framework.delete("/a", DeleteOptions::new()).await.unwrap();
    recorder.wait_for(2).await;
    framework.set_data("/b", "changed", None).await.unwrap();
    let events = recorder.wait_for(3).await;

    assert_eq!(
        describe(&events),
        vec![
            ("added", "/c".to_string()),
            ("removed", "/a".to_string()),
            ("updated", "/b".to_string()),
        ]
    );
}

/// Subtree cache: Initialized once, between the initial population and live
/// events; depth bound; cascading removal
#[tokio::test]
#[traced_test]
async fn test_subtree_cache_lifecycle() {
    let (store, framework) = setup(None);
    seed(&store, &[("/svc", ""), ("/svc/a", ""), ("/svc/a/b", "")]).await;

    let cache = framework.subtree_cache("/svc").max_depth(2).build().unwrap();
    let recorder = Recorder::attach(cache.listenable());
    cache.start().await.unwrap();
    assert_eq!(cache.state(), CacheState::Live);

    // Depth 3 is outside the bound, depth 2 is inside
    framework
        .create("/svc/a/b/c", Bytes::new(), CreateOptions::new())
        .await
        .unwrap();
    framework.create("/svc/a/d", Bytes::new(), CreateOptions::new()).await.unwrap();
    recorder.wait_for(5).await;

    framework
        .delete("/svc/a", DeleteOptions::new().deleting_children_if_needed())
        .await
        .unwrap();
    wait_until(|| cache.get_current_data("/svc/a").is_none()).await;
    wait_until(|| describe(&recorder.events()).len() == 7).await;

    let events = recorder.events();
    let initialized: Vec<usize> = events
        .iter()
        .enumerate()
        .filter(|(_, e)| **e == CacheEvent::Initialized)
        .map(|(i, _)| i)
        .collect();
    assert_eq!(initialized, vec![3]);

    let node_events = describe(&events);
    assert_eq!(
        node_events[..4],
        [
            ("added", "/svc".to_string()),
            ("added", "/svc/a".to_string()),
            ("added", "/svc/a/b".to_string()),
            ("added", "/svc/a/d".to_string()),
        ]
    );
    let removed: Vec<&str> = node_events[4..].iter().map(|(_, p)| p.as_str()).collect();
    assert_eq!(removed.last(), Some(&"/svc/a"));
    assert_eq!(removed.len(), 3);
    assert!(!removed.contains(&"/svc/a/b/c"));

    cache.close().await;
}

/// Closing any cache releases every store watch it armed
#[tokio::test]
async fn test_close_leaves_no_watches() {
    let (store, framework) = setup(None);
    seed(&store, &[("/p", ""), ("/p/a", ""), ("/p/a/b", "")]).await;

    let node = framework.node_cache("/p").unwrap();
    let children = framework.children_cache("/p").unwrap();
    let subtree = framework.subtree_cache("/p").build().unwrap();
    node.start(false).await.unwrap();
    children.start(StartMode::Normal).await.unwrap();
    subtree.start().await.unwrap();
    assert!(store.watch_count() > 0);

    node.close().await;
    children.close().await;
    subtree.close().await;
    subtree.close().await;
    assert_eq!(store.watch_count(), 0);

    // Closed caches stay silent
    store.write("/p", Bytes::from_static(b"late"), None).await.unwrap();
    assert_eq!(node.get_current_data(), None);
    assert!(children.get_current_children().is_empty());
}

/// Dropping started caches without `close` releases their watches too
#[tokio::test]
#[traced_test]
async fn test_dropped_caches_leave_no_watches() {
    let (store, framework) = setup(None);
    seed(&store, &[("/root", ""), ("/root/a", ""), ("/p", ""), ("/p/a", "")]).await;

    let subtree = framework.subtree_cache("/root").max_depth(8).build().unwrap();
    let children = framework.children_cache("/p").unwrap();
    let subtree_events = Recorder::attach(subtree.listenable());
    let children_events = Recorder::attach(children.listenable());
    subtree.start().await.unwrap();
    children.start(StartMode::BuildInitialCache).await.unwrap();
    assert_eq!(store.watch_count(), 7);
    let before = subtree_events.events().len();

    drop(subtree);
    drop(children);
    wait_until(|| store.watch_count() == 0).await;

    framework.create("/root/b", Bytes::new(), CreateOptions::new()).await.unwrap();
    framework.create("/p/b", Bytes::new(), CreateOptions::new()).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(subtree_events.events().len(), before);
    assert!(children_events.events().is_empty());
}
