//! Fanout - a durable posting queue for the social web
//!
//! This library holds the queue itself: the post model and its status
//! machine, storage, the retry policy, platform publishers and the
//! dispatcher that ties them together. The `fan-send` and `fan-queue`
//! binaries are thin shells around it.

pub mod accounting;
pub mod config;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod logging;
pub mod platforms;
pub mod retry;
pub mod scheduling;
pub mod service;
pub mod store;
pub mod types;

// Re-export commonly used types
pub use config::Config;
pub use db::Database;
pub use dispatcher::{CycleReport, Dispatcher, DispatcherConfig};
pub use error::{FanoutError, PublishError, Result};
pub use service::QueueService;
pub use store::{MemoryStore, PostFilter, PostStore};
pub use types::{Post, PostStatus, Priority};
