//! In-memory coordination store
//!
//! Reference implementation of [`StoreClient`] following ZooKeeper rules:
//! one-shot watches, sequential suffixes taken from the parent's children
//! version, ephemeral nodes bound to a session, and all-or-nothing multi-op
//! transactions. Several [`MemStore`] sessions can share one tree through
//! [`MemStore::connect`].

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::sync::oneshot;
use tracing::debug;
use tracing::trace;

use super::ConnectionState;
use super::CreateMode;
use super::NodeSnapshot;
use super::NodeStat;
use super::OneShotWatch;
use super::OpResult;
use super::StoreClient;
use super::TransactionOp;
use super::WatchEventType;
use super::WatchId;
use super::WatchKind;
use super::WatchedEvent;
use crate::constants::ROOT_PATH;
use crate::path;
use crate::utils::time::now_millis;
use crate::StoreError;
use crate::StoreResult;

const CONNECTION_EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone)]
struct Znode {
    data: Bytes,
    stat: NodeStat,
    children: BTreeSet<String>,
}

/// Node table plus the transaction counter
#[derive(Debug, Clone)]
struct Tree {
    nodes: HashMap<String, Znode>,
    zxid: i64,
}

impl Tree {
    fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            ROOT_PATH.to_string(),
            Znode {
                data: Bytes::new(),
                stat: NodeStat::default(),
                children: BTreeSet::new(),
            },
        );
        Self { nodes, zxid: 0 }
    }

    fn snapshot(
        &self,
        path: &str,
    ) -> NodeSnapshot {
        match self.nodes.get(path) {
            Some(node) => NodeSnapshot::present(path, Some(node.data.clone()), node.stat),
            None => NodeSnapshot::missing(path),
        }
    }

    fn node(
        &self,
        path: &str,
    ) -> StoreResult<&Znode> {
        self.nodes.get(path).ok_or_else(|| StoreError::NotFound {
            path: path.to_string(),
        })
    }

    fn check_version(
        path: &str,
        node: &Znode,
        expected: Option<i32>,
    ) -> StoreResult<()> {
        match expected {
            Some(expected) if expected != node.stat.version => Err(StoreError::VersionMismatch {
                path: path.to_string(),
                expected,
                actual: node.stat.version,
            }),
            _ => Ok(()),
        }
    }

    fn create(
        &mut self,
        path: &str,
        data: Bytes,
        mode: CreateMode,
        session: u64,
    ) -> StoreResult<(String, Vec<WatchedEvent>)> {
        path::validate(path)?;
        let parent_path = match path::parent(path) {
            Some(parent) => parent,
            None => {
                return Err(StoreError::NodeExists {
                    path: path.to_string(),
                })
            }
        };
        let parent = self.nodes.get(parent_path).ok_or_else(|| StoreError::NoParent {
            path: path.to_string(),
        })?;
        if parent.stat.ephemeral_owner != 0 {
            return Err(StoreError::NoChildrenForEphemerals {
                path: parent_path.to_string(),
            });
        }

        let actual = if mode.is_sequential() {
            path::sequential(path, parent.stat.cversion)
        } else {
            path.to_string()
        };
        if self.nodes.contains_key(&actual) {
            return Err(StoreError::NodeExists { path: actual });
        }

        self.zxid += 1;
        let zxid = self.zxid;
        let now = now_millis();
        let stat = NodeStat {
            czxid: zxid,
            mzxid: zxid,
            pzxid: zxid,
            ctime: now,
            mtime: now,
            version: 0,
            cversion: 0,
            ephemeral_owner: if mode.is_ephemeral() { session } else { 0 },
            data_length: data.len(),
            num_children: 0,
        };
        self.nodes.insert(
            actual.clone(),
            Znode {
                data,
                stat,
                children: BTreeSet::new(),
            },
        );
        if let Some(parent) = self.nodes.get_mut(parent_path) {
            parent.children.insert(path::node_name(&actual).to_string());
            parent.stat.cversion += 1;
            parent.stat.pzxid = zxid;
            parent.stat.num_children = parent.children.len();
        }

        let events = vec![
            WatchedEvent::new(WatchEventType::NodeCreated, actual.clone()),
            WatchedEvent::new(WatchEventType::NodeChildrenChanged, parent_path),
        ];
        Ok((actual, events))
    }

    fn set_data(
        &mut self,
        path: &str,
        data: Bytes,
        expected: Option<i32>,
    ) -> StoreResult<(NodeStat, Vec<WatchedEvent>)> {
        path::validate(path)?;
        Self::check_version(path, self.node(path)?, expected)?;

        self.zxid += 1;
        let zxid = self.zxid;
        let node = self.nodes.get_mut(path).ok_or_else(|| StoreError::NotFound {
            path: path.to_string(),
        })?;
        node.stat.data_length = data.len();
        node.data = data;
        node.stat.version += 1;
        node.stat.mzxid = zxid;
        node.stat.mtime = now_millis();

        Ok((
            node.stat,
            vec![WatchedEvent::new(WatchEventType::NodeDataChanged, path)],
        ))
    }

    fn delete(
        &mut self,
        path: &str,
        expected: Option<i32>,
    ) -> StoreResult<Vec<WatchedEvent>> {
        path::validate(path)?;
        let parent_path = path::parent(path)
            .ok_or_else(|| StoreError::InvalidPath("The root node cannot be deleted".to_string()))?;
        let node = self.node(path)?;
        Self::check_version(path, node, expected)?;
        if !node.children.is_empty() {
            return Err(StoreError::NotEmpty {
                path: path.to_string(),
            });
        }

        self.zxid += 1;
        let zxid = self.zxid;
        self.nodes.remove(path);
        if let Some(parent) = self.nodes.get_mut(parent_path) {
            parent.children.remove(path::node_name(path));
            parent.stat.cversion += 1;
            parent.stat.pzxid = zxid;
            parent.stat.num_children = parent.children.len();
        }

        Ok(vec![
            WatchedEvent::new(WatchEventType::NodeDeleted, path),
            WatchedEvent::new(WatchEventType::NodeChildrenChanged, parent_path),
        ])
    }

    fn check(
        &self,
        path: &str,
        expected: Option<i32>,
    ) -> StoreResult<()> {
        path::validate(path)?;
        Self::check_version(path, self.node(path)?, expected)
    }

    fn apply(
        &mut self,
        op: TransactionOp,
        session: u64,
    ) -> StoreResult<(OpResult, Vec<WatchedEvent>)> {
        match op {
            TransactionOp::Create { path, data, mode } => {
                let (actual_path, events) = self.create(&path, data, mode, session)?;
                Ok((OpResult::Created { path, actual_path }, events))
            }
            TransactionOp::SetData { path, data, version } => {
                let (stat, events) = self.set_data(&path, data, version)?;
                Ok((OpResult::DataSet { path, stat }, events))
            }
            TransactionOp::Delete { path, version } => {
                let events = self.delete(&path, version)?;
                Ok((OpResult::Deleted { path }, events))
            }
            TransactionOp::Check { path, version } => {
                self.check(&path, version)?;
                Ok((OpResult::Checked { path }, Vec::new()))
            }
        }
    }

    /// Deletes every ephemeral node owned by `session`
    fn expire_session(
        &mut self,
        session: u64,
    ) -> Vec<WatchedEvent> {
        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.stat.ephemeral_owner == session)
            .map(|(path, _)| path.clone())
            .collect();

        let mut events = Vec::new();
        for path in owned {
            match self.delete(&path, None) {
                Ok(mut fired) => events.append(&mut fired),
                Err(e) => debug!(%path, ?e, "ephemeral node already gone"),
            }
        }
        events
    }
}

#[derive(Debug)]
struct RegisteredWatch {
    id: WatchId,
    session: u64,
    sender: oneshot::Sender<WatchedEvent>,
}

/// Watch tables keyed by path
#[derive(Debug, Default)]
struct WatchTable {
    data: DashMap<String, Vec<RegisteredWatch>>,
    children: DashMap<String, Vec<RegisteredWatch>>,
    any: DashMap<String, Vec<RegisteredWatch>>,
}

impl WatchTable {
    fn tables(&self) -> [&DashMap<String, Vec<RegisteredWatch>>; 3] {
        [&self.data, &self.children, &self.any]
    }

    fn retain(
        &self,
        keep: impl Fn(&RegisteredWatch) -> bool,
    ) {
        for table in self.tables() {
            table.retain(|_, watches| {
                watches.retain(|w| keep(w));
                !watches.is_empty()
            });
        }
    }

    fn count(
        &self,
        session: u64,
    ) -> usize {
        self.tables()
            .iter()
            .map(|table| {
                table
                    .iter()
                    .map(|entry| entry.value().iter().filter(|w| w.session == session).count())
                    .sum::<usize>()
            })
            .sum()
    }

    fn take(
        table: &DashMap<String, Vec<RegisteredWatch>>,
        path: &str,
    ) -> Vec<RegisteredWatch> {
        table.remove(path).map(|(_, watches)| watches).unwrap_or_default()
    }

    /// Removes and returns every watch triggered by `event`
    fn triggered_by(
        &self,
        event: &WatchedEvent,
    ) -> Vec<RegisteredWatch> {
        let path = event.path.as_str();
        let mut fired = Self::take(&self.any, path);
        match event.event_type {
            WatchEventType::NodeChildrenChanged => fired.append(&mut Self::take(&self.children, path)),
            WatchEventType::NodeDeleted => {
                fired.append(&mut Self::take(&self.data, path));
                fired.append(&mut Self::take(&self.children, path));
            }
            WatchEventType::NodeCreated | WatchEventType::NodeDataChanged => {
                fired.append(&mut Self::take(&self.data, path))
            }
        }
        fired
    }
}

#[derive(Debug)]
struct MemServer {
    tree: Mutex<Tree>,
    watches: WatchTable,
    next_watch_id: AtomicU64,
    next_session_id: AtomicU64,
}

#[derive(Debug)]
struct Session {
    id: AtomicU64,
    state: Mutex<ConnectionState>,
    state_tx: broadcast::Sender<ConnectionState>,
}

/// Session handle on an in-memory tree
///
/// Clones share the session; [`MemStore::connect`] opens a new one.
#[derive(Debug, Clone)]
pub struct MemStore {
    server: Arc<MemServer>,
    session: Arc<Session>,
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemStore {
    /// Empty tree (root only) with one connected session
    pub fn new() -> Self {
        let server = Arc::new(MemServer {
            tree: Mutex::new(Tree::new()),
            watches: WatchTable::default(),
            next_watch_id: AtomicU64::new(1),
            next_session_id: AtomicU64::new(1),
        });
        Self::open_session(server)
    }

    /// Opens another session on the same tree
    pub fn connect(&self) -> MemStore {
        Self::open_session(self.server.clone())
    }

    fn open_session(server: Arc<MemServer>) -> Self {
        let id = server.next_session_id.fetch_add(1, Ordering::Relaxed);
        let (state_tx, _) = broadcast::channel(CONNECTION_EVENT_BUFFER);
        Self {
            server,
            session: Arc::new(Session {
                id: AtomicU64::new(id),
                state: Mutex::new(ConnectionState::Connected),
                state_tx,
            }),
        }
    }

    pub fn session_id(&self) -> u64 {
        self.session.id.load(Ordering::Acquire)
    }

    /// Number of unfired watches registered by this session
    pub fn watch_count(&self) -> usize {
        self.server.watches.count(self.session_id())
    }

    /// Drops the connection while keeping the session and its watches
    pub fn suspend(&self) {
        self.transition(ConnectionState::Suspended);
    }

    /// Expires the session: watches are discarded unfired and ephemeral
    /// nodes are deleted
    pub fn lose_session(&self) {
        self.transition(ConnectionState::Lost);

        let old = self.session_id();
        self.server.watches.retain(|w| w.session != old);
        let events = self.server.tree.lock().expire_session(old);

        let new_id = self.server.next_session_id.fetch_add(1, Ordering::Relaxed);
        self.session.id.store(new_id, Ordering::Release);
        debug!(old_session = old, new_session = new_id, "session expired");

        self.fire(events);
    }

    pub fn reconnect(&self) {
        self.transition(ConnectionState::Reconnected);
    }

    fn transition(
        &self,
        next: ConnectionState,
    ) {
        {
            let mut state = self.session.state.lock();
            if *state == next || (state.is_connected() && next.is_connected()) {
                return;
            }
            *state = next;
        }
        debug!(session = self.session_id(), state = ?next, "connection state changed");
        // No subscriber is not an error
        let _ = self.session.state_tx.send(next);
    }

    fn ensure_connected(&self) -> StoreResult<()> {
        if self.session.state.lock().is_connected() {
            Ok(())
        } else {
            Err(StoreError::ConnectionUnavailable)
        }
    }

    fn fire(
        &self,
        events: Vec<WatchedEvent>,
    ) {
        for event in events {
            let watches = self.server.watches.triggered_by(&event);
            if watches.is_empty() {
                continue;
            }
            trace!(path = %event.path, event_type = ?event.event_type, watches = watches.len(), "watch fired");
            for watch in watches {
                let _ = watch.sender.send(event.clone());
            }
        }
    }
}

#[async_trait::async_trait]
impl StoreClient for MemStore {
    async fn read(
        &self,
        path: &str,
    ) -> StoreResult<NodeSnapshot> {
        self.ensure_connected()?;
        path::validate(path)?;
        Ok(self.server.tree.lock().snapshot(path))
    }

    async fn exists(
        &self,
        path: &str,
    ) -> StoreResult<Option<NodeStat>> {
        self.ensure_connected()?;
        path::validate(path)?;
        Ok(self.server.tree.lock().nodes.get(path).map(|node| node.stat))
    }

    async fn write(
        &self,
        path: &str,
        data: Bytes,
        expected_version: Option<i32>,
    ) -> StoreResult<NodeStat> {
        self.ensure_connected()?;
        let (stat, events) = self.server.tree.lock().set_data(path, data, expected_version)?;
        self.fire(events);
        Ok(stat)
    }

    async fn create(
        &self,
        path: &str,
        data: Bytes,
        mode: CreateMode,
    ) -> StoreResult<String> {
        self.ensure_connected()?;
        let session = self.session_id();
        let (actual, events) = self.server.tree.lock().create(path, data, mode, session)?;
        self.fire(events);
        Ok(actual)
    }

    async fn delete(
        &self,
        path: &str,
        expected_version: Option<i32>,
    ) -> StoreResult<()> {
        self.ensure_connected()?;
        let events = self.server.tree.lock().delete(path, expected_version)?;
        self.fire(events);
        Ok(())
    }

    async fn list_children(
        &self,
        path: &str,
    ) -> StoreResult<Vec<String>> {
        self.ensure_connected()?;
        path::validate(path)?;
        let tree = self.server.tree.lock();
        Ok(tree.node(path)?.children.iter().cloned().collect())
    }

    async fn watch_once(
        &self,
        path: &str,
        kind: WatchKind,
    ) -> StoreResult<OneShotWatch> {
        self.ensure_connected()?;
        path::validate(path)?;

        // Registration happens under the tree lock so no committed change can
        // slip between the existence check and the insert.
        let tree = self.server.tree.lock();
        let exists = tree.nodes.contains_key(path);
        let table = match kind {
            WatchKind::Data => &self.server.watches.data,
            WatchKind::Children if !exists => {
                return Err(StoreError::NotFound {
                    path: path.to_string(),
                })
            }
            WatchKind::Children => &self.server.watches.children,
            WatchKind::Either if !exists => &self.server.watches.data,
            WatchKind::Either => &self.server.watches.any,
        };

        let id = WatchId(self.server.next_watch_id.fetch_add(1, Ordering::Relaxed));
        let (sender, receiver) = oneshot::channel();
        table.entry(path.to_string()).or_default().push(RegisteredWatch {
            id,
            session: self.session_id(),
            sender,
        });
        drop(tree);

        trace!(watch_id = id.0, %path, ?kind, "watch registered");
        Ok(OneShotWatch::new(id, receiver))
    }

    async fn remove_watch(
        &self,
        id: WatchId,
    ) -> StoreResult<()> {
        self.server.watches.retain(|w| w.id != id);
        Ok(())
    }

    async fn submit_transaction(
        &self,
        ops: Vec<TransactionOp>,
    ) -> StoreResult<Vec<OpResult>> {
        self.ensure_connected()?;
        let session = self.session_id();

        let mut tree = self.server.tree.lock();
        let mut staged = tree.clone();
        let mut results = Vec::with_capacity(ops.len());
        let mut events = Vec::new();
        for (index, op) in ops.into_iter().enumerate() {
            let (result, mut fired) =
                staged
                    .apply(op, session)
                    .map_err(|cause| StoreError::TransactionFailed {
                        index,
                        cause: Box::new(cause),
                    })?;
            results.push(result);
            events.append(&mut fired);
        }
        *tree = staged;
        drop(tree);

        self.fire(events);
        Ok(results)
    }

    fn connection_state(&self) -> ConnectionState {
        *self.session.state.lock()
    }

    fn subscribe_connection_state(&self) -> broadcast::Receiver<ConnectionState> {
        self.session.state_tx.subscribe()
    }
}
