//! Job lifecycle: records, claiming, and cancellation.

pub mod cancel;
pub mod claim;
pub mod model;

pub use claim::{ClaimCoordinator, ClaimedTask};
pub use model::{FileStatus, MediaFileRecord, NewMediaFile, TaskRecord, TaskStatus, TaskType};
