//! Durable post storage
//!
//! [`PostStore`] is the seam between the dispatcher and persistence. The
//! SQLite [`Database`](crate::db::Database) is the production store;
//! [`MemoryStore`] backs tests and embedders that do not need durability.
//!
//! Every write that can race with the dispatcher is conditional on the
//! status the caller last observed, so a claimed post is never processed by
//! two workers and an operator's change is never silently overwritten.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::error::{FanoutError, Result};
use crate::types::{Post, PostStatus};

/// Criteria for listing posts
#[derive(Debug, Clone, Default)]
pub struct PostFilter {
    pub status: Option<PostStatus>,
    pub owner: Option<String>,
    pub limit: Option<usize>,
}

/// Number of posts in each status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts(pub BTreeMap<String, u64>);

impl StatusCounts {
    pub fn get(&self, status: PostStatus) -> u64 {
        self.0.get(status.as_str()).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.0.values().sum()
    }

    fn with_all_statuses(mut self) -> Self {
        for status in PostStatus::ALL {
            self.0.entry(status.as_str().to_string()).or_insert(0);
        }
        self
    }
}

#[async_trait]
pub trait PostStore: Send + Sync {
    async fn insert(&self, post: &Post) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<Post>>;

    /// Posts eligible for dispatch at `now`: `pending` or `scheduled`, target
    /// time reached, retry delay elapsed, recurrence not exhausted. Ordered
    /// by priority, then target time.
    async fn find_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Post>>;

    /// Atomically move a post from `expected` to `processing`.
    ///
    /// Returns `false` if the post is no longer in `expected`; the caller
    /// must then leave it alone.
    async fn claim(&self, id: &str, expected: PostStatus, now: DateTime<Utc>) -> Result<bool>;

    /// Persist the outcome of a processing pass and return the status that
    /// was actually stored.
    ///
    /// The row must still be `processing` under the same claim (matched on
    /// `claimed_at`); otherwise [`FanoutError::ClaimLost`], even if the post
    /// was recovered and has since moved on. If a
    /// cancel was requested meanwhile, a `pending` or `failed` outcome is
    /// stored as `cancelled`.
    async fn save(&self, post: &Post) -> Result<PostStatus>;

    /// Write `post` only if the stored status is still `expected`
    async fn save_if_status(&self, post: &Post, expected: PostStatus) -> Result<bool>;

    /// `processing` posts claimed at or before `cutoff`
    async fn find_stale_processing(&self, cutoff: DateTime<Utc>) -> Result<Vec<Post>>;

    /// Flag a `processing` post for cancellation once its pass is saved.
    /// Returns `false` if the post is not `processing`.
    async fn request_cancel(&self, id: &str) -> Result<bool>;

    async fn list(&self, filter: &PostFilter) -> Result<Vec<Post>>;

    async fn status_counts(&self) -> Result<StatusCounts>;
}

/// Status that `save` stores for `post` given the stored cancel flag
fn effective_status(post: &Post, cancel_requested: bool) -> PostStatus {
    if cancel_requested {
        post.status.after_cancel_request()
    } else {
        post.status
    }
}

/// In-process store guarded by a single mutex
#[derive(Default)]
pub struct MemoryStore {
    posts: Mutex<HashMap<String, Post>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PostStore for MemoryStore {
    async fn insert(&self, post: &Post) -> Result<()> {
        let mut posts = self.posts.lock().await;
        if posts.contains_key(&post.id) {
            return Err(FanoutError::InvalidInput(format!(
                "Post {} already exists",
                post.id
            )));
        }
        posts.insert(post.id.clone(), post.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Post>> {
        Ok(self.posts.lock().await.get(id).cloned())
    }

    async fn find_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Post>> {
        let posts = self.posts.lock().await;
        let mut due: Vec<Post> = posts.values().filter(|p| p.is_due(now)).cloned().collect();
        due.sort_by(|a, b| {
            a.priority
                .rank()
                .cmp(&b.priority.rank())
                .then(a.schedule.target_time.cmp(&b.schedule.target_time))
        });
        due.truncate(limit);
        Ok(due)
    }

    async fn claim(&self, id: &str, expected: PostStatus, now: DateTime<Utc>) -> Result<bool> {
        let mut posts = self.posts.lock().await;
        match posts.get_mut(id) {
            Some(post) if post.status == expected => {
                post.mark_claimed(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn save(&self, post: &Post) -> Result<PostStatus> {
        let mut posts = self.posts.lock().await;
        let stored = posts
            .get_mut(&post.id)
            .ok_or_else(|| FanoutError::NotFound(post.id.clone()))?;

        if stored.status != PostStatus::Processing || stored.claimed_at != post.claimed_at {
            return Err(FanoutError::ClaimLost(post.id.clone()));
        }

        let cancel_requested = stored.cancel_requested;
        let mut next = post.clone();
        next.cancel_requested = cancel_requested;
        next.status = effective_status(post, cancel_requested);
        let status = next.status;
        *stored = next;
        Ok(status)
    }

    async fn save_if_status(&self, post: &Post, expected: PostStatus) -> Result<bool> {
        let mut posts = self.posts.lock().await;
        match posts.get_mut(&post.id) {
            Some(stored) if stored.status == expected => {
                *stored = post.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn find_stale_processing(&self, cutoff: DateTime<Utc>) -> Result<Vec<Post>> {
        let posts = self.posts.lock().await;
        Ok(posts
            .values()
            .filter(|p| {
                p.status == PostStatus::Processing
                    && p.claimed_at.map_or(true, |at| at <= cutoff)
            })
            .cloned()
            .collect())
    }

    async fn request_cancel(&self, id: &str) -> Result<bool> {
        let mut posts = self.posts.lock().await;
        match posts.get_mut(id) {
            Some(post) if post.status == PostStatus::Processing => {
                post.cancel_requested = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list(&self, filter: &PostFilter) -> Result<Vec<Post>> {
        let posts = self.posts.lock().await;
        let mut matching: Vec<Post> = posts
            .values()
            .filter(|p| filter.status.map_or(true, |s| p.status == s))
            .filter(|p| filter.owner.as_deref().map_or(true, |o| p.owner == o))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            matching.truncate(limit);
        }
        Ok(matching)
    }

    async fn status_counts(&self) -> Result<StatusCounts> {
        let posts = self.posts.lock().await;
        let mut counts = StatusCounts::default();
        for post in posts.values() {
            *counts.0.entry(post.status.as_str().to_string()).or_insert(0) += 1;
        }
        Ok(counts.with_all_statuses())
    }
}

/// Shared by the SQLite store so both report every status
pub(crate) fn complete_counts(counts: StatusCounts) -> StatusCounts {
    counts.with_all_statuses()
}
