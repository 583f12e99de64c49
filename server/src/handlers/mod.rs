//! Request handlers for sync operations.

mod download;
mod snapshot;
mod upload;

pub use download::*;
pub use snapshot::*;
pub use upload::*;
