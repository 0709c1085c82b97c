//! Stuck-task detection and recovery.

pub mod detector;
pub mod engine;
pub mod sweeper;

pub use detector::{DetectionReport, StaleTask, StuckTaskDetector};
pub use engine::{RecoveryEngine, RecoveryOutcome, RecoverySummary};
