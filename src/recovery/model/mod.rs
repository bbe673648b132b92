//! The data model for checkpointing and recovery.
//!
//! [`progress`] names the parts of a job run and its lifecycle,
//! [`state`] is how operator state travels as bytes, and
//! [`checkpoint`] is built on top of both.

pub(crate) mod checkpoint;
pub(crate) mod progress;
pub(crate) mod state;

// Re-export so you can get the whole model at once.

pub use checkpoint::*;
pub use progress::*;
pub use state::*;
