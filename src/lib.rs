//! Scribed — task lifecycle orchestration and recovery for a media
//! transcription pipeline.

pub mod config;
pub mod error;
pub mod jobs;
pub mod notify;
pub mod orchestrator;
pub mod recovery;
pub mod store;
pub mod worker;

pub use config::OrchestratorConfig;
pub use error::{Error, Result};
pub use orchestrator::Orchestrator;
