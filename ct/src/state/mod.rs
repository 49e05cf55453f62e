//! Progress state with single-writer actor
//!
//! The transition machine lives in [`machine`]; [`handle`] wraps it in an
//! actor so every mutation is serialized and observers only ever see
//! consistent snapshots.

mod handle;
mod machine;

pub use handle::{ProgressChanged, ProgressHandle, StateError, StateResponse};
pub use machine::{Applied, JobEvent, ProgressState};
