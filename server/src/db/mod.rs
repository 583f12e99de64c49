//! Database module for PostgreSQL persistence.

mod operations;
mod pool;

pub use operations::*;
pub use pool::*;
