//! Usage accounting for published posts
//!
//! The dispatcher reports each post once, when it is persisted as `posted`.
//! Accounting failures are logged by the caller and never change the post.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::error::{DbError, Result};
use crate::Database;

/// Scope used for whole-post counters
pub const ALL_PLATFORMS: &str = "*";

/// What a single published post contributes to its owner's usage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishUsage {
    pub owner: String,
    pub post_id: String,
    pub platforms: Vec<String>,
    pub published_at: DateTime<Utc>,
}

#[async_trait]
pub trait UsageAccountant: Send + Sync {
    async fn record_publish(&self, usage: &PublishUsage) -> Result<()>;
}

/// Discards every report
pub struct NoopAccountant;

#[async_trait]
impl UsageAccountant for NoopAccountant {
    async fn record_publish(&self, _usage: &PublishUsage) -> Result<()> {
        Ok(())
    }
}

/// Counters kept in the `usage_counters` table
pub struct SqliteAccountant {
    db: Database,
}

impl SqliteAccountant {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Published count for `owner` in `scope` (a platform name or [`ALL_PLATFORMS`])
    pub async fn published_count(&self, owner: &str, scope: &str) -> Result<u64> {
        let row = sqlx::query_as::<_, (i64,)>(
            r#"
            SELECT published FROM usage_counters
            WHERE owner = ? AND scope = ?
            "#,
        )
        .bind(owner)
        .bind(scope)
        .fetch_optional(self.db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        Ok(row.map(|r| r.0.max(0) as u64).unwrap_or(0))
    }
}

#[async_trait]
impl UsageAccountant for SqliteAccountant {
    async fn record_publish(&self, usage: &PublishUsage) -> Result<()> {
        let mut tx = self.db.pool().begin().await.map_err(DbError::SqlxError)?;
        let published_at = usage.published_at.timestamp_micros();

        let scopes = std::iter::once(ALL_PLATFORMS).chain(usage.platforms.iter().map(String::as_str));
        for scope in scopes {
            sqlx::query(
                r#"
                INSERT INTO usage_counters (owner, scope, published, last_published_at)
                VALUES (?, ?, 1, ?)
                ON CONFLICT(owner, scope)
                DO UPDATE SET published = published + 1, last_published_at = excluded.last_published_at
                "#,
            )
            .bind(&usage.owner)
            .bind(scope)
            .bind(published_at)
            .execute(&mut *tx)
            .await
            .map_err(DbError::SqlxError)?;
        }

        tx.commit().await.map_err(DbError::SqlxError)?;
        Ok(())
    }
}

/// Keeps every report in memory
#[derive(Default)]
pub struct MemoryAccountant {
    reports: Mutex<Vec<PublishUsage>>,
}

impl MemoryAccountant {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn reports(&self) -> Vec<PublishUsage> {
        self.reports.lock().await.clone()
    }

    /// Number of posts reported per owner
    pub async fn totals(&self) -> HashMap<String, u64> {
        let mut totals = HashMap::new();
        for usage in self.reports.lock().await.iter() {
            *totals.entry(usage.owner.clone()).or_insert(0) += 1;
        }
        totals
    }
}

#[async_trait]
impl UsageAccountant for MemoryAccountant {
    async fn record_publish(&self, usage: &PublishUsage) -> Result<()> {
        self.reports.lock().await.push(usage.clone());
        Ok(())
    }
}
