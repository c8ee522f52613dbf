//! Error types for Fanout

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::PostStatus;

pub type Result<T> = std::result::Result<T, FanoutError>;

#[derive(Error, Debug)]
pub enum FanoutError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Publish error: {0}")]
    Publish(#[from] PublishError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition { from: PostStatus, to: PostStatus },

    #[error("Post not found: {0}")]
    NotFound(String),

    #[error("Claim on post {0} was lost to another dispatcher")]
    ClaimLost(String),
}

impl FanoutError {
    /// Returns the appropriate exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            FanoutError::InvalidInput(_)
            | FanoutError::InvalidTransition { .. }
            | FanoutError::NotFound(_) => 3,
            FanoutError::Config(_) => 2,
            FanoutError::Publish(_) | FanoutError::Database(_) | FanoutError::ClaimLost(_) => 1,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value: {0}")]
    InvalidValue(String),
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database operation failed: {0}")]
    SqlxError(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

/// Coarse classification of a publish failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PublishErrorKind {
    Auth,
    RateLimit,
    ContentRejected,
    Network,
    Unknown,
}

impl std::fmt::Display for PublishErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PublishErrorKind::Auth => "auth",
            PublishErrorKind::RateLimit => "rate-limit",
            PublishErrorKind::ContentRejected => "content-rejected",
            PublishErrorKind::Network => "network",
            PublishErrorKind::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

/// Failure reported by a platform publisher.
///
/// Every kind shares the same retry budget; the kind is kept for display and
/// for the audit log.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),

    #[error("Content rejected: {0}")]
    ContentRejected(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Publish failed: {0}")]
    Unknown(String),
}

impl PublishError {
    pub fn kind(&self) -> PublishErrorKind {
        match self {
            PublishError::Authentication(_) => PublishErrorKind::Auth,
            PublishError::RateLimit(_) => PublishErrorKind::RateLimit,
            PublishError::ContentRejected(_) => PublishErrorKind::ContentRejected,
            PublishError::Network(_) => PublishErrorKind::Network,
            PublishError::Unknown(_) => PublishErrorKind::Unknown,
        }
    }

    /// The human-readable message without the kind prefix
    pub fn message(&self) -> &str {
        match self {
            PublishError::Authentication(m)
            | PublishError::RateLimit(m)
            | PublishError::ContentRejected(m)
            | PublishError::Network(m)
            | PublishError::Unknown(m) => m,
        }
    }

    /// Error recorded when a publish call does not finish within its bound
    pub fn timeout(after: Duration) -> Self {
        PublishError::Network(format!(
            "timed out after {}",
            humantime::format_duration(after)
        ))
    }
}
