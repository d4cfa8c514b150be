use bytes::Bytes;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::oneshot;

/// Node metadata as maintained by the store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStat {
    /// Transaction id that created the node
    pub czxid: i64,
    /// Transaction id of the last data change
    pub mzxid: i64,
    /// Transaction id of the last children change
    pub pzxid: i64,
    /// Creation time (ms since epoch)
    pub ctime: u64,
    /// Last modification time (ms since epoch)
    pub mtime: u64,
    /// Data version
    pub version: i32,
    /// Children version
    pub cversion: i32,
    /// Owning session for ephemeral nodes, 0 otherwise
    pub ephemeral_owner: u64,
    pub data_length: usize,
    pub num_children: usize,
}

/// Point-in-time materialization of one path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSnapshot {
    pub path: String,
    /// Node payload; `None` when the node is missing or data is not cached
    pub data: Option<Bytes>,
    pub stat: NodeStat,
    pub exists: bool,
}

impl NodeSnapshot {
    pub fn present(
        path: impl Into<String>,
        data: Option<Bytes>,
        stat: NodeStat,
    ) -> Self {
        Self {
            path: path.into(),
            data,
            stat,
            exists: true,
        }
    }

    pub fn missing(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            data: None,
            stat: NodeStat::default(),
            exists: false,
        }
    }

    pub fn version(&self) -> i32 {
        self.stat.version
    }

    pub fn children_version(&self) -> i32 {
        self.stat.cversion
    }

    /// Same snapshot without its payload
    pub(crate) fn without_data(mut self) -> Self {
        self.data = None;
        self
    }
}

/// Node lifetime and naming
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CreateMode {
    #[default]
    Persistent,
    PersistentSequential,
    Ephemeral,
    EphemeralSequential,
}

impl CreateMode {
    pub fn is_sequential(self) -> bool {
        matches!(self, CreateMode::PersistentSequential | CreateMode::EphemeralSequential)
    }

    pub fn is_ephemeral(self) -> bool {
        matches!(self, CreateMode::Ephemeral | CreateMode::EphemeralSequential)
    }
}

/// What a one-shot watch observes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchKind {
    /// Creation, deletion and data changes of the node itself
    Data,
    /// Changes to the set of direct children; the node must exist
    Children,
    /// Whichever of the two fires first
    Either,
}

/// Change that fired a watch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventType {
    NodeCreated,
    NodeDeleted,
    NodeDataChanged,
    NodeChildrenChanged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedEvent {
    pub event_type: WatchEventType,
    pub path: String,
}

impl WatchedEvent {
    pub fn new(
        event_type: WatchEventType,
        path: impl Into<String>,
    ) -> Self {
        Self {
            event_type,
            path: path.into(),
        }
    }
}

/// Identifier of a registered store watch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchId(pub u64);

/// A registered watch that fires at most once
///
/// Resolves to `None` when the store discarded the watch without firing it
/// (session loss); the registration must then be considered stale.
#[derive(Debug)]
pub struct OneShotWatch {
    id: WatchId,
    receiver: oneshot::Receiver<WatchedEvent>,
    strip_prefix: Option<String>,
}

impl OneShotWatch {
    pub fn new(
        id: WatchId,
        receiver: oneshot::Receiver<WatchedEvent>,
    ) -> Self {
        Self {
            id,
            receiver,
            strip_prefix: None,
        }
    }

    pub fn id(&self) -> WatchId {
        self.id
    }

    /// Reports event paths relative to `root`
    pub(crate) fn relative_to(
        mut self,
        root: String,
    ) -> Self {
        self.strip_prefix = Some(root);
        self
    }

    /// Waits for the watch to fire
    pub async fn fired(&mut self) -> Option<WatchedEvent> {
        let mut event = (&mut self.receiver).await.ok()?;
        if let Some(root) = &self.strip_prefix {
            event.path = crate::path::strip_namespace(root, &event.path);
        }
        Some(event)
    }
}

/// Session state as seen by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    /// Connection dropped; the session may still be alive
    Suspended,
    /// Session expired; watches and ephemeral nodes are gone
    Lost,
    Reconnected,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Reconnected)
    }
}

/// One operation of a multi-op transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionOp {
    Create {
        path: String,
        data: Bytes,
        mode: CreateMode,
    },
    SetData {
        path: String,
        data: Bytes,
        /// `None` matches any version
        version: Option<i32>,
    },
    Delete {
        path: String,
        version: Option<i32>,
    },
    Check {
        path: String,
        version: Option<i32>,
    },
}

impl TransactionOp {
    pub fn path(&self) -> &str {
        match self {
            TransactionOp::Create { path, .. }
            | TransactionOp::SetData { path, .. }
            | TransactionOp::Delete { path, .. }
            | TransactionOp::Check { path, .. } => path,
        }
    }

    pub(crate) fn map_path(
        self,
        f: impl Fn(&str) -> String,
    ) -> Self {
        match self {
            TransactionOp::Create { path, data, mode } => TransactionOp::Create {
                path: f(&path),
                data,
                mode,
            },
            TransactionOp::SetData { path, data, version } => TransactionOp::SetData {
                path: f(&path),
                data,
                version,
            },
            TransactionOp::Delete { path, version } => TransactionOp::Delete {
                path: f(&path),
                version,
            },
            TransactionOp::Check { path, version } => TransactionOp::Check {
                path: f(&path),
                version,
            },
        }
    }
}

/// Outcome of one committed transaction op
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpResult {
    Created { path: String, actual_path: String },
    DataSet { path: String, stat: NodeStat },
    Deleted { path: String },
    Checked { path: String },
}

impl OpResult {
    /// Path the op was submitted for
    pub fn for_path(&self) -> &str {
        match self {
            OpResult::Created { path, .. }
            | OpResult::DataSet { path, .. }
            | OpResult::Deleted { path }
            | OpResult::Checked { path } => path,
        }
    }

    pub fn stat(&self) -> Option<&NodeStat> {
        match self {
            OpResult::DataSet { stat, .. } => Some(stat),
            _ => None,
        }
    }

    pub(crate) fn map_path(
        self,
        f: impl Fn(&str) -> String,
    ) -> Self {
        match self {
            OpResult::Created { path, actual_path } => OpResult::Created {
                path: f(&path),
                actual_path: f(&actual_path),
            },
            OpResult::DataSet { path, stat } => OpResult::DataSet { path: f(&path), stat },
            OpResult::Deleted { path } => OpResult::Deleted { path: f(&path) },
            OpResult::Checked { path } => OpResult::Checked { path: f(&path) },
        }
    }
}
