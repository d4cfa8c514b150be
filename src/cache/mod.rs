//! Change-watching caches
//!
//! Each cache owns a [`WatchDispatcher`] and one worker task consuming its
//! event queue. The worker is the only mutator of the cache mapping; readers
//! see an immutable view published through `ArcSwap`. Listener callbacks run
//! on the task that produced the change.

mod children;
mod node;
mod subtree;

pub use children::*;
pub use node::*;
pub use subtree::*;

#[cfg(test)]
mod children_test;
#[cfg(test)]
mod subtree_test;

use std::collections::BTreeMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

use crate::metrics::CACHE_EVENTS;
use crate::metrics::RESYNC_FAILURES;
use crate::watch::DispatchEvent;
use crate::watch::WatchDispatcher;
use crate::CacheError;
use crate::ConnectionState;
use crate::NodeSnapshot;
use crate::Result;
use crate::StoreClient;
use crate::StoreError;
use crate::StoreResult;

/// Change notification delivered to cache listeners
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    NodeAdded(NodeSnapshot),
    NodeUpdated(NodeSnapshot),
    /// Carries the last cached snapshot of the removed node
    NodeRemoved(NodeSnapshot),
    ConnectionSuspended,
    ConnectionLost,
    ConnectionReconnected,
    /// Initial population finished
    Initialized,
}

impl CacheEvent {
    pub fn snapshot(&self) -> Option<&NodeSnapshot> {
        match self {
            CacheEvent::NodeAdded(s) | CacheEvent::NodeUpdated(s) | CacheEvent::NodeRemoved(s) => Some(s),
            _ => None,
        }
    }

    /// Path of the node event, if any
    pub fn path(&self) -> Option<&str> {
        self.snapshot().map(|s| s.path.as_str())
    }

    pub(crate) fn name(&self) -> &'static str {
        match self {
            CacheEvent::NodeAdded(_) => "node_added",
            CacheEvent::NodeUpdated(_) => "node_updated",
            CacheEvent::NodeRemoved(_) => "node_removed",
            CacheEvent::ConnectionSuspended => "connection_suspended",
            CacheEvent::ConnectionLost => "connection_lost",
            CacheEvent::ConnectionReconnected => "connection_reconnected",
            CacheEvent::Initialized => "initialized",
        }
    }
}

/// Lifecycle of a cache; `Closed` is terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CacheState {
    Pending = 0,
    Live = 1,
    Closed = 2,
}

#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    fn new() -> Self {
        Self(AtomicU8::new(CacheState::Pending as u8))
    }

    pub(crate) fn get(&self) -> CacheState {
        match self.0.load(Ordering::Acquire) {
            0 => CacheState::Pending,
            1 => CacheState::Live,
            _ => CacheState::Closed,
        }
    }

    fn transition(
        &self,
        from: CacheState,
        to: CacheState,
    ) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Identifier returned by [`ListenerContainer::add_listener`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerId(u64);

/// Callback registered on a [`ListenerContainer`]
pub type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

pub type CacheListener = Listener<CacheEvent>;

/// Registered receiver of a [`ListenerContainer`]
#[derive(Clone)]
enum Subscriber<E> {
    Callback(Listener<E>),
    /// Pruned once its receiver is dropped
    Channel(mpsc::UnboundedSender<E>),
}

/// Ordered registry of listeners
///
/// Listeners are invoked in registration order.
pub struct ListenerContainer<E = CacheEvent> {
    next_id: AtomicU64,
    listeners: Mutex<BTreeMap<ListenerId, Subscriber<E>>>,
}

impl<E> Default for ListenerContainer<E> {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            listeners: Mutex::new(BTreeMap::new()),
        }
    }
}

impl<E: Clone + Send + 'static> ListenerContainer<E> {
    pub fn add_listener<F>(
        &self,
        listener: F,
    ) -> ListenerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.register(Subscriber::Callback(Arc::new(listener)))
    }

    /// Returns false if `id` was not registered
    pub fn remove_listener(
        &self,
        id: ListenerId,
    ) -> bool {
        self.listeners.lock().remove(&id).is_some()
    }

    /// Events as a channel; dropping the receiver unregisters it
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.register(Subscriber::Channel(tx));
        rx
    }

    /// Events as a `Stream`
    pub fn stream(&self) -> UnboundedReceiverStream<E> {
        UnboundedReceiverStream::new(self.subscribe())
    }

    pub fn len(&self) -> usize {
        self.listeners.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn register(
        &self,
        subscriber: Subscriber<E>,
    ) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().insert(id, subscriber);
        id
    }

    pub(crate) fn notify(
        &self,
        event: &E,
    ) {
        // Snapshot so a listener may add or remove listeners
        let subscribers: Vec<(ListenerId, Subscriber<E>)> =
            self.listeners.lock().iter().map(|(id, s)| (*id, s.clone())).collect();

        let mut closed = Vec::new();
        for (id, subscriber) in subscribers {
            match subscriber {
                Subscriber::Callback(listener) => listener(event),
                Subscriber::Channel(tx) => {
                    if tx.send(event.clone()).is_err() {
                        closed.push(id);
                    }
                }
            }
        }
        if !closed.is_empty() {
            let mut listeners = self.listeners.lock();
            for id in closed {
                listeners.remove(&id);
            }
        }
    }
}

/// State shared by a cache handle and its worker
pub(crate) struct CacheShared<V> {
    kind: &'static str,
    state: StateCell,
    view: ArcSwap<V>,
    listeners: ListenerContainer,
    /// Serializes the Closed transition with publication and emission
    publish_lock: Mutex<()>,
}

impl<V: Default> CacheShared<V> {
    pub(crate) fn new(kind: &'static str) -> Self {
        Self {
            kind,
            state: StateCell::new(),
            view: ArcSwap::from_pointee(V::default()),
            listeners: ListenerContainer::default(),
            publish_lock: Mutex::new(()),
        }
    }

    pub(crate) fn state(&self) -> CacheState {
        self.state.get()
    }

    pub(crate) fn listeners(&self) -> &ListenerContainer {
        &self.listeners
    }

    pub(crate) fn view(&self) -> Arc<V> {
        self.view.load_full()
    }

    /// Replaces the view unless the cache is closed
    pub(crate) fn publish(
        &self,
        view: V,
    ) -> bool {
        let _guard = self.publish_lock.lock();
        if self.state.get() == CacheState::Closed {
            return false;
        }
        self.view.store(Arc::new(view));
        true
    }

    /// Delivers `event` to every listener unless the cache is closed
    pub(crate) fn emit(
        &self,
        event: CacheEvent,
    ) {
        let _guard = self.publish_lock.lock();
        if self.state.get() == CacheState::Closed {
            return;
        }
        CACHE_EVENTS.with_label_values(&[self.kind, event.name()]).inc();
        self.listeners.notify(&event);
    }

    pub(crate) fn go_live(&self) -> bool {
        let _guard = self.publish_lock.lock();
        self.state.transition(CacheState::Pending, CacheState::Live)
    }

    /// Moves to Closed and clears the view; false if already closed
    pub(crate) fn close(&self) -> bool {
        let _guard = self.publish_lock.lock();
        if self.state.get() == CacheState::Closed {
            return false;
        }
        self.state.0.store(CacheState::Closed as u8, Ordering::Release);
        self.view.store(Arc::new(V::default()));
        true
    }

    pub(crate) fn ensure_startable(&self) -> Result<()> {
        match self.state.get() {
            CacheState::Pending => Ok(()),
            CacheState::Live => Err(CacheError::AlreadyStarted.into()),
            CacheState::Closed => Err(CacheError::Closed.into()),
        }
    }

    pub(crate) fn record_failure(
        &self,
        path: &str,
        e: &StoreError,
    ) {
        RESYNC_FAILURES.with_label_values(&[self.kind]).inc();
        if e.is_connection_error() {
            debug!(cache = self.kind, %path, ?e, "refresh deferred until reconnection");
        } else {
            warn!(cache = self.kind, %path, ?e, "refresh failed");
        }
    }
}

/// How a node moved between two observations
pub(crate) fn classify(
    prev: Option<&NodeSnapshot>,
    next: Option<&NodeSnapshot>,
) -> Option<CacheEvent> {
    match (prev, next) {
        (None, Some(next)) => Some(CacheEvent::NodeAdded(next.clone())),
        (Some(prev), None) => Some(CacheEvent::NodeRemoved(prev.clone())),
        (Some(prev), Some(next))
            if prev.stat.version != next.stat.version || prev.stat.czxid != next.stat.czxid =>
        {
            Some(CacheEvent::NodeUpdated(next.clone()))
        }
        _ => None,
    }
}

/// Reads `path`; `None` when the node is missing
pub(crate) async fn fetch(
    client: &dyn StoreClient,
    path: &str,
    cache_data: bool,
) -> StoreResult<Option<NodeSnapshot>> {
    let snapshot = client.read(path).await?;
    if !snapshot.exists {
        return Ok(None);
    }
    Ok(Some(if cache_data { snapshot } else { snapshot.without_data() }))
}

pub(crate) fn connection_event(state: ConnectionState) -> CacheEvent {
    match state {
        ConnectionState::Suspended => CacheEvent::ConnectionSuspended,
        ConnectionState::Lost => CacheEvent::ConnectionLost,
        ConnectionState::Connected | ConnectionState::Reconnected => CacheEvent::ConnectionReconnected,
    }
}

/// Single mutator of a cache mapping
#[async_trait::async_trait]
pub(crate) trait CacheWorker: Send + 'static {
    async fn handle(
        &mut self,
        event: DispatchEvent,
    );
}

/// Dispatcher, worker task and the token stopping it
///
/// Dropping it stops the worker and cancels every arm loop, so a cache
/// dropped without `close` still releases its store watches.
pub(crate) struct CacheRuntime {
    dispatcher: Arc<WatchDispatcher>,
    token: CancellationToken,
    worker: Option<JoinHandle<()>>,
}

impl CacheRuntime {
    pub(crate) fn spawn<W: CacheWorker>(
        dispatcher: Arc<WatchDispatcher>,
        mut worker: W,
        mut events: mpsc::UnboundedReceiver<DispatchEvent>,
    ) -> Self {
        let token = CancellationToken::new();
        let stop = token.clone();
        let handle = tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = stop.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                worker.handle(event).await;
            }
        });
        Self {
            dispatcher,
            token,
            worker: Some(handle),
        }
    }

    /// Stops the worker and releases every watch
    pub(crate) async fn shutdown(mut self) {
        self.token.cancel();
        self.dispatcher.close().await;
        if let Some(worker) = self.worker.take() {
            if let Err(e) = worker.await {
                warn!(?e, "cache worker ended abnormally");
            }
        }
        // Registrations the worker made while stopping
        self.dispatcher.close().await;
    }
}

impl Drop for CacheRuntime {
    fn drop(&mut self) {
        if self.worker.is_some() {
            debug!("cache dropped without close, stopping worker");
        }
        self.token.cancel();
        self.dispatcher.cancel();
    }
}
