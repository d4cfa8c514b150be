//! Change-watching caches and transactions for a hierarchical coordination
//! store.
//!
//! The store is reached through [`StoreClient`]; [`MemStore`] is an in-memory
//! implementation with ZooKeeper semantics. On top of it:
//! - [`WatchDispatcher`] turns one-shot watches into a continuous stream
//! - [`NodeCache`], [`ChildrenCache`] and [`SubtreeCache`] mirror store state
//! - [`TransactionCoordinator`] submits all-or-nothing multi-op transactions
//! - [`CoordFramework`] ties them to a namespace and an operation timeout

mod cache;
mod config;
mod errors;
mod framework;
mod metrics;
mod store;
mod transaction;
mod watch;

pub mod constants;
pub mod path;
pub(crate) mod utils;

pub use cache::*;
pub use self::config::*;
pub use errors::*;
pub use framework::*;
pub use metrics::*;
pub use store::*;
pub use transaction::*;
pub use watch::*;

//-----------------------------------------------------------
// Test utils

#[cfg(test)]
pub mod test_utils;
