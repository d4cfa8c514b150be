//! Continuous watches on top of one-shot store watches
//!
//! ```text
//! owner (cache worker)
//!   └─> WatchDispatcher::watch(path, kind)
//!         └─> arm loop [1 task per (path, kind)]
//!               watch_once ─> fired ─> watch_once ─> forward Fired
//!   <── DispatchEvent queue (single consumer) <── connection relay [1 task]
//! ```

mod dispatcher;
pub use dispatcher::*;
