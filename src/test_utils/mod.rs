//! the test_utils folder here will share utils or test components between
//! unit tests of the store, the dispatcher and the caches
mod common;
mod event_recorder;

pub use common::*;
pub use event_recorder::*;
