//! SQLite-backed post store

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;

use crate::error::{DbError, FanoutError, Result};
use crate::store::{complete_counts, PostFilter, PostStore, StatusCounts};
use crate::types::{
    ErrorEntry, PlatformState, Post, PostContent, PostStatus, Priority, Recurrence, RetryState,
    Schedule, ScheduleKind,
};

const POST_COLUMNS: &str = "id, owner, content, platform_targets, schedule_kind, target_time, \
     recurrence, status, priority, retry_count, max_retries, last_retry_at, next_retry_at, \
     backoff_multiplier, errors, cancel_requested, claimed_at, created_at, updated_at";

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if needed) the database at `db_path` and run migrations
    pub async fn new(db_path: &str) -> Result<Self> {
        let expanded_path = shellexpand::tilde(db_path).to_string();
        let path = Path::new(&expanded_path);

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(DbError::IoError)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(DbError::SqlxError)?;

        Self::migrate(pool).await
    }

    /// Private in-memory database; contents vanish when the value is dropped
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(DbError::SqlxError)?;

        Self::migrate(pool).await
    }

    async fn migrate(pool: SqlitePool) -> Result<Self> {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(DbError::MigrationError)?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

// ============================================================================
// Encoding
// ============================================================================

fn to_micros(at: DateTime<Utc>) -> i64 {
    at.timestamp_micros()
}

fn from_micros(micros: i64, column: &str) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros).ok_or_else(|| {
        FanoutError::Database(DbError::Corrupt(format!(
            "{} out of range: {}",
            column, micros
        )))
    })
}

fn opt_from_micros(micros: Option<i64>, column: &str) -> Result<Option<DateTime<Utc>>> {
    micros.map(|m| from_micros(m, column)).transpose()
}

fn corrupt(column: &str, err: impl std::fmt::Display) -> FanoutError {
    FanoutError::Database(DbError::Corrupt(format!("{}: {}", column, err)))
}

/// Column values for one post
struct EncodedPost {
    content: String,
    platform_targets: String,
    recurrence: Option<String>,
    errors: String,
}

impl EncodedPost {
    fn new(post: &Post) -> Result<Self> {
        Ok(Self {
            content: serde_json::to_string(&post.content).map_err(|e| corrupt("content", e))?,
            platform_targets: serde_json::to_string(&post.platform_targets)
                .map_err(|e| corrupt("platform_targets", e))?,
            recurrence: post
                .schedule
                .recurrence
                .as_ref()
                .map(serde_json::to_string)
                .transpose()
                .map_err(|e| corrupt("recurrence", e))?,
            errors: serde_json::to_string(&post.errors).map_err(|e| corrupt("errors", e))?,
        })
    }
}

fn post_from_row(row: &SqliteRow) -> Result<Post> {
    let get_err = |e: sqlx::Error| FanoutError::Database(DbError::SqlxError(e));

    let content: String = row.try_get("content").map_err(get_err)?;
    let content: PostContent = serde_json::from_str(&content).map_err(|e| corrupt("content", e))?;

    let targets: String = row.try_get("platform_targets").map_err(get_err)?;
    let platform_targets: std::collections::BTreeMap<String, PlatformState> =
        serde_json::from_str(&targets).map_err(|e| corrupt("platform_targets", e))?;

    let recurrence: Option<String> = row.try_get("recurrence").map_err(get_err)?;
    let recurrence: Option<Recurrence> = recurrence
        .map(|r| serde_json::from_str(&r))
        .transpose()
        .map_err(|e| corrupt("recurrence", e))?;

    let errors: String = row.try_get("errors").map_err(get_err)?;
    let errors: Vec<ErrorEntry> = serde_json::from_str(&errors).map_err(|e| corrupt("errors", e))?;

    let kind: String = row.try_get("schedule_kind").map_err(get_err)?;
    let status: String = row.try_get("status").map_err(get_err)?;
    let priority: i64 = row.try_get("priority").map_err(get_err)?;
    let retry_count: i64 = row.try_get("retry_count").map_err(get_err)?;
    let max_retries: i64 = row.try_get("max_retries").map_err(get_err)?;

    Ok(Post {
        id: row.try_get("id").map_err(get_err)?,
        owner: row.try_get("owner").map_err(get_err)?,
        content,
        platform_targets,
        schedule: Schedule {
            kind: ScheduleKind::from_str(&kind).map_err(|e| corrupt("schedule_kind", e))?,
            target_time: from_micros(row.try_get("target_time").map_err(get_err)?, "target_time")?,
            recurrence,
        },
        status: PostStatus::from_str(&status).map_err(|e| corrupt("status", e))?,
        priority: Priority::from_rank(priority)
            .ok_or_else(|| corrupt("priority", format!("unknown rank {}", priority)))?,
        retry: RetryState {
            count: u32::try_from(retry_count).map_err(|e| corrupt("retry_count", e))?,
            max_retries: u32::try_from(max_retries).map_err(|e| corrupt("max_retries", e))?,
            last_retry_at: opt_from_micros(
                row.try_get("last_retry_at").map_err(get_err)?,
                "last_retry_at",
            )?,
            next_retry_at: opt_from_micros(
                row.try_get("next_retry_at").map_err(get_err)?,
                "next_retry_at",
            )?,
            backoff_multiplier: row.try_get("backoff_multiplier").map_err(get_err)?,
        },
        errors,
        cancel_requested: row.try_get("cancel_requested").map_err(get_err)?,
        claimed_at: opt_from_micros(row.try_get("claimed_at").map_err(get_err)?, "claimed_at")?,
        created_at: from_micros(row.try_get("created_at").map_err(get_err)?, "created_at")?,
        updated_at: from_micros(row.try_get("updated_at").map_err(get_err)?, "updated_at")?,
    })
}

fn rows_to_posts(rows: Vec<SqliteRow>) -> Result<Vec<Post>> {
    rows.iter().map(post_from_row).collect()
}

// ============================================================================
// PostStore
// ============================================================================

#[async_trait]
impl PostStore for Database {
    async fn insert(&self, post: &Post) -> Result<()> {
        let encoded = EncodedPost::new(post)?;

        sqlx::query(
            r#"
            INSERT INTO posts (
                id, owner, content, platform_targets, schedule_kind, target_time,
                recurrence, recurrence_exhausted, status, priority, retry_count, max_retries,
                last_retry_at, next_retry_at, backoff_multiplier, errors, cancel_requested,
                claimed_at, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&post.id)
        .bind(&post.owner)
        .bind(&encoded.content)
        .bind(&encoded.platform_targets)
        .bind(post.schedule.kind.as_str())
        .bind(to_micros(post.schedule.target_time))
        .bind(&encoded.recurrence)
        .bind(post.schedule.is_exhausted())
        .bind(post.status.as_str())
        .bind(post.priority.rank())
        .bind(i64::from(post.retry.count))
        .bind(i64::from(post.retry.max_retries))
        .bind(post.retry.last_retry_at.map(to_micros))
        .bind(post.retry.next_retry_at.map(to_micros))
        .bind(post.retry.backoff_multiplier)
        .bind(&encoded.errors)
        .bind(post.cancel_requested)
        .bind(post.claimed_at.map(to_micros))
        .bind(to_micros(post.created_at))
        .bind(to_micros(post.updated_at))
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Post>> {
        let row = sqlx::query(&format!("SELECT {} FROM posts WHERE id = ?", POST_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        row.as_ref().map(post_from_row).transpose()
    }

    async fn find_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Post>> {
        let now = to_micros(now);
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM posts
            WHERE status IN ('pending', 'scheduled')
              AND target_time <= ?
              AND (next_retry_at IS NULL OR next_retry_at <= ?)
              AND recurrence_exhausted = 0
            ORDER BY priority ASC, target_time ASC
            LIMIT ?
            "#,
            POST_COLUMNS
        ))
        .bind(now)
        .bind(now)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows_to_posts(rows)
    }

    async fn claim(&self, id: &str, expected: PostStatus, now: DateTime<Utc>) -> Result<bool> {
        let now = to_micros(now);
        let result = sqlx::query(
            r#"
            UPDATE posts
            SET status = 'processing', claimed_at = ?, updated_at = ?, cancel_requested = 0
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(id)
        .bind(expected.as_str())
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    async fn save(&self, post: &Post) -> Result<PostStatus> {
        let encoded = EncodedPost::new(post)?;
        let claimed_at = post.claimed_at.map(to_micros);

        let persisted: Option<String> = sqlx::query_scalar(
            r#"
            UPDATE posts
            SET platform_targets = ?,
                schedule_kind = ?,
                target_time = ?,
                recurrence = ?,
                recurrence_exhausted = ?,
                status = CASE
                    WHEN cancel_requested = 1 AND ? IN ('pending', 'failed') THEN 'cancelled'
                    ELSE ?
                END,
                priority = ?,
                retry_count = ?,
                max_retries = ?,
                last_retry_at = ?,
                next_retry_at = ?,
                backoff_multiplier = ?,
                errors = ?,
                claimed_at = ?,
                updated_at = ?
            WHERE id = ? AND status = 'processing' AND claimed_at IS ?
            RETURNING status
            "#,
        )
        .bind(&encoded.platform_targets)
        .bind(post.schedule.kind.as_str())
        .bind(to_micros(post.schedule.target_time))
        .bind(&encoded.recurrence)
        .bind(post.schedule.is_exhausted())
        .bind(post.status.as_str())
        .bind(post.status.as_str())
        .bind(post.priority.rank())
        .bind(i64::from(post.retry.count))
        .bind(i64::from(post.retry.max_retries))
        .bind(post.retry.last_retry_at.map(to_micros))
        .bind(post.retry.next_retry_at.map(to_micros))
        .bind(post.retry.backoff_multiplier)
        .bind(&encoded.errors)
        .bind(claimed_at)
        .bind(to_micros(post.updated_at))
        .bind(&post.id)
        .bind(claimed_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        match persisted {
            Some(status) => PostStatus::from_str(&status).map_err(|e| corrupt("status", e)),
            None => {
                let exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM posts WHERE id = ?")
                    .bind(&post.id)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(DbError::SqlxError)?;
                match exists {
                    Some(_) => Err(FanoutError::ClaimLost(post.id.clone())),
                    None => Err(FanoutError::NotFound(post.id.clone())),
                }
            }
        }
    }

    async fn save_if_status(&self, post: &Post, expected: PostStatus) -> Result<bool> {
        let encoded = EncodedPost::new(post)?;

        let result = sqlx::query(
            r#"
            UPDATE posts
            SET platform_targets = ?,
                schedule_kind = ?,
                target_time = ?,
                recurrence = ?,
                recurrence_exhausted = ?,
                status = ?,
                priority = ?,
                retry_count = ?,
                max_retries = ?,
                last_retry_at = ?,
                next_retry_at = ?,
                backoff_multiplier = ?,
                errors = ?,
                cancel_requested = ?,
                claimed_at = ?,
                updated_at = ?
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(&encoded.platform_targets)
        .bind(post.schedule.kind.as_str())
        .bind(to_micros(post.schedule.target_time))
        .bind(&encoded.recurrence)
        .bind(post.schedule.is_exhausted())
        .bind(post.status.as_str())
        .bind(post.priority.rank())
        .bind(i64::from(post.retry.count))
        .bind(i64::from(post.retry.max_retries))
        .bind(post.retry.last_retry_at.map(to_micros))
        .bind(post.retry.next_retry_at.map(to_micros))
        .bind(post.retry.backoff_multiplier)
        .bind(&encoded.errors)
        .bind(post.cancel_requested)
        .bind(post.claimed_at.map(to_micros))
        .bind(to_micros(post.updated_at))
        .bind(&post.id)
        .bind(expected.as_str())
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    async fn find_stale_processing(&self, cutoff: DateTime<Utc>) -> Result<Vec<Post>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM posts
            WHERE status = 'processing'
              AND (claimed_at IS NULL OR claimed_at <= ?)
            ORDER BY claimed_at ASC
            "#,
            POST_COLUMNS
        ))
        .bind(to_micros(cutoff))
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows_to_posts(rows)
    }

    async fn request_cancel(&self, id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE posts SET cancel_requested = 1
            WHERE id = ? AND status = 'processing'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    async fn list(&self, filter: &PostFilter) -> Result<Vec<Post>> {
        let mut where_clauses = vec!["1=1"];
        if filter.status.is_some() {
            where_clauses.push("status = ?");
        }
        if filter.owner.is_some() {
            where_clauses.push("owner = ?");
        }

        let query_str = format!(
            "SELECT {} FROM posts WHERE {} ORDER BY created_at DESC LIMIT ?",
            POST_COLUMNS,
            where_clauses.join(" AND ")
        );

        let mut query = sqlx::query(&query_str);
        if let Some(status) = filter.status {
            query = query.bind(status.as_str());
        }
        if let Some(owner) = &filter.owner {
            query = query.bind(owner);
        }
        // SQLite treats a negative LIMIT as unbounded
        let limit = filter
            .limit
            .map(|l| i64::try_from(l).unwrap_or(i64::MAX))
            .unwrap_or(-1);

        let rows = query
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        rows_to_posts(rows)
    }

    async fn status_counts(&self) -> Result<StatusCounts> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            "SELECT status, COUNT(*) FROM posts GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        let counts = rows
            .into_iter()
            .map(|(status, count)| (status, count.max(0) as u64))
            .collect();
        Ok(complete_counts(StatusCounts(counts)))
    }
}
