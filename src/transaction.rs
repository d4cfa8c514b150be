//! All-or-nothing multi-op transactions
//!
//! The store applies the ops of one submit atomically and in order, so an op
//! observes the effects of the ops before it. A failed submit leaves no op
//! applied and reports the first failing index with its cause.

use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;
use tracing::warn;

use crate::metrics::TRANSACTIONS;
use crate::path;
use crate::CreateMode;
use crate::OpResult;
use crate::StoreClient;
use crate::StoreError;
use crate::StoreResult;
use crate::TransactionOp;

/// Per-op results of a committed transaction, in submission order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionResult {
    pub results: Vec<OpResult>,
}

impl TransactionResult {
    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Actual path of the create submitted for `path`
    ///
    /// Sequential creates answer with the suffixed name.
    pub fn created_path(
        &self,
        path: &str,
    ) -> Option<&str> {
        self.results.iter().find_map(|r| match r {
            OpResult::Created {
                path: requested,
                actual_path,
            } if requested == path => Some(actual_path.as_str()),
            _ => None,
        })
    }
}

/// Submits multi-op transactions to a store
///
/// Submits are never retried: the outcome of a timed out submit is unknown
/// to the coordinator.
#[derive(Clone)]
pub struct TransactionCoordinator {
    client: Arc<dyn StoreClient>,
}

impl TransactionCoordinator {
    pub fn new(client: Arc<dyn StoreClient>) -> Self {
        Self { client }
    }

    /// Starts a fluent transaction
    pub fn transaction(&self) -> TransactionBuilder<'_> {
        TransactionBuilder {
            coordinator: self,
            ops: Vec::new(),
        }
    }

    /// Validates every op, then submits them as one request
    ///
    /// # Errors
    /// - [`StoreError::TransactionFailed`] with the index of the first failing
    ///   op; a malformed path fails without contacting the store
    /// - connection failures of the submit itself
    pub async fn submit(
        &self,
        ops: Vec<TransactionOp>,
    ) -> StoreResult<TransactionResult> {
        if ops.is_empty() {
            return Ok(TransactionResult::default());
        }

        for (index, op) in ops.iter().enumerate() {
            if let Err(cause) = path::validate(op.path()) {
                debug!(index, path = op.path(), "transaction rejected before submit");
                TRANSACTIONS.with_label_values(&["rejected"]).inc();
                return Err(StoreError::TransactionFailed {
                    index,
                    cause: Box::new(cause),
                });
            }
        }

        let count = ops.len();
        match self.client.submit_transaction(ops).await {
            Ok(results) => {
                debug!(ops = count, "transaction committed");
                TRANSACTIONS.with_label_values(&["committed"]).inc();
                Ok(TransactionResult { results })
            }
            Err(e) => {
                warn!(ops = count, ?e, "transaction failed");
                TRANSACTIONS.with_label_values(&["failed"]).inc();
                Err(e)
            }
        }
    }
}

/// Collects ops for one [`TransactionCoordinator::submit`]
pub struct TransactionBuilder<'a> {
    coordinator: &'a TransactionCoordinator,
    ops: Vec<TransactionOp>,
}

impl TransactionBuilder<'_> {
    /// Persistent create
    pub fn create(
        self,
        path: &str,
        data: impl Into<Bytes>,
    ) -> Self {
        self.create_with_mode(path, data, CreateMode::Persistent)
    }

    pub fn create_with_mode(
        mut self,
        path: &str,
        data: impl Into<Bytes>,
        mode: CreateMode,
    ) -> Self {
        self.ops.push(TransactionOp::Create {
            path: path.to_string(),
            data: data.into(),
            mode,
        });
        self
    }

    /// `version` of `None` matches any version
    pub fn set_data(
        mut self,
        path: &str,
        data: impl Into<Bytes>,
        version: Option<i32>,
    ) -> Self {
        self.ops.push(TransactionOp::SetData {
            path: path.to_string(),
            data: data.into(),
            version,
        });
        self
    }

    pub fn delete(
        mut self,
        path: &str,
        version: Option<i32>,
    ) -> Self {
        self.ops.push(TransactionOp::Delete {
            path: path.to_string(),
            version,
        });
        self
    }

    /// Asserts the node exists (with `version`, when given) at commit time
    pub fn check(
        mut self,
        path: &str,
        version: Option<i32>,
    ) -> Self {
        self.ops.push(TransactionOp::Check {
            path: path.to_string(),
            version,
        });
        self
    }

    pub fn ops(&self) -> &[TransactionOp] {
        &self.ops
    }

    pub async fn commit(self) -> StoreResult<TransactionResult> {
        self.coordinator.submit(self.ops).await
    }
}
