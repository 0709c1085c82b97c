//! Worker pool and the executor seam it drives.

pub mod executor;
pub mod pool;

pub use executor::{ExecutionEvent, TaskExecutor};
pub use pool::WorkerPool;
