//! Progress notifications: payload model and the deduplicating publisher.

pub mod model;
pub mod publisher;

pub use model::PipelineNotification;
pub use publisher::ProgressPublisher;
