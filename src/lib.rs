//! imageci library
//!
//! A continuous-integration controller for embedded OS images: repository
//! events become build groups (one container per hardware board), commit
//! statuses track progress and successful groups are published as releases.

pub mod build;
pub mod config;
pub mod docker;
pub mod events;
pub mod loopdev;
pub mod orchestrator;
pub mod persist;
pub mod router;
pub mod s3;
pub mod service;
pub mod util;

// Re-export commonly used types
pub use build::BuildScheduler;
pub use config::Configuration;
pub use events::EventBus;
