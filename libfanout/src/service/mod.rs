//! Queue service for Fanout
//!
//! `QueueService` is the inbound side of the queue: it creates posts and
//! applies the operator actions (cancel, reset retries, queue a draft,
//! recover stale claims). The dispatcher is the only other writer.
//!
//! Every change here is a compare-on-status write against the store, so an
//! operator action racing a dispatcher pass either lands on the status it
//! was decided against or is re-evaluated against the fresh record.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use chrono::Utc;
//! use libfanout::service::creation::NewPost;
//! use libfanout::service::QueueService;
//! use libfanout::{MemoryStore, retry::RetryPolicy};
//!
//! # async fn example() -> libfanout::Result<()> {
//! let service = QueueService::new(Arc::new(MemoryStore::new()), RetryPolicy::default());
//!
//! let request = NewPost::new("tenant-1", "Hello decentralized world!")
//!     .platform("nostr")
//!     .platform("mastodon");
//!
//! let post = service.create(request, Utc::now()).await?;
//! println!("Queued {} as {}", post.id, post.status);
//! # Ok(())
//! # }
//! ```

pub mod creation;
pub mod events;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use self::creation::{queued_status, reject_past, NewPost};
use self::events::EventBus;
use crate::error::{FanoutError, Result};
use crate::retry::RetryPolicy;
use crate::store::{PostFilter, PostStore, StatusCounts};
use crate::types::{Post, PostStatus, ScheduleKind};

/// Attempts at a compare-on-status write before giving up
const MAX_WRITE_ATTEMPTS: usize = 5;

pub(crate) const RESET_NOTE: &str = "retries reset by operator";

/// Result of a cancel request
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The post is now `cancelled`
    Cancelled { post: Post },
    /// The post is being processed; it will be cancelled when the pass is
    /// saved unless the pass publishes everywhere
    Deferred { post_id: String },
}

#[derive(Clone)]
pub struct QueueService {
    store: Arc<dyn PostStore>,
    policy: RetryPolicy,
    events: EventBus,
}

impl QueueService {
    pub fn new(store: Arc<dyn PostStore>, policy: RetryPolicy) -> Self {
        Self {
            store,
            policy,
            events: EventBus::default(),
        }
    }

    /// Share an event bus with a dispatcher so recoveries show up there too
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn store(&self) -> &Arc<dyn PostStore> {
        &self.store
    }

    /// Validate and store a new post.
    ///
    /// # Errors
    ///
    /// `InvalidInput` for empty or oversized content, no platforms, a
    /// schedule in the past, or `max_retries` above the ceiling.
    pub async fn create(&self, request: NewPost, now: DateTime<Utc>) -> Result<Post> {
        let post = request.build(&self.policy, now)?;
        self.store.insert(&post).await?;

        tracing::info!(
            post_id = %post.id,
            owner = %post.owner,
            status = %post.status,
            platforms = ?post.enabled_platforms(),
            "Post created"
        );
        Ok(post)
    }

    pub async fn get(&self, id: &str) -> Result<Post> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| FanoutError::NotFound(id.to_string()))
    }

    pub async fn list(&self, filter: &PostFilter) -> Result<Vec<Post>> {
        self.store.list(filter).await
    }

    pub async fn stats(&self) -> Result<StatusCounts> {
        self.store.status_counts().await
    }

    /// Cancel a post.
    ///
    /// A post that is `processing` is flagged instead; the flag is honoured
    /// when the in-flight pass is saved.
    ///
    /// # Errors
    ///
    /// `InvalidTransition` if the post is already `posted` or `cancelled`.
    pub async fn cancel(&self, id: &str, now: DateTime<Utc>) -> Result<CancelOutcome> {
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let mut post = self.get(id).await?;
            let observed = post.status;

            if observed == PostStatus::Processing {
                if self.store.request_cancel(id).await? {
                    tracing::info!(post_id = %id, "Cancel deferred until the current pass finishes");
                    return Ok(CancelOutcome::Deferred {
                        post_id: id.to_string(),
                    });
                }
                continue;
            }

            post.transition(PostStatus::Cancelled, now)?;
            if self.store.save_if_status(&post, observed).await? {
                tracing::info!(post_id = %id, from = %observed, "Post cancelled");
                return Ok(CancelOutcome::Cancelled { post });
            }
            tracing::debug!(post_id = %id, "Post changed during cancel, re-reading");
        }

        Err(busy(id))
    }

    /// Move a `failed` post back to `pending` with a fresh retry budget.
    ///
    /// Only enabled platforms that have not been published to lose their
    /// standing error and attempt count; posted platforms keep their record.
    pub async fn reset_retries(&self, id: &str, now: DateTime<Utc>) -> Result<Post> {
        let post = self
            .modify(id, |post| {
                if post.status != PostStatus::Failed {
                    return Err(FanoutError::InvalidTransition {
                        from: post.status,
                        to: PostStatus::Pending,
                    });
                }

                post.retry.reset();
                for state in post.platform_targets.values_mut() {
                    if state.is_outstanding() {
                        state.last_error = None;
                        state.attempt_count = 0;
                    }
                }
                post.log_error(None, RESET_NOTE, now);
                post.transition(PostStatus::Pending, now)
            })
            .await?;

        tracing::info!(post_id = %id, "Retries reset");
        Ok(post)
    }

    /// Queue a draft: `scheduled` if its target time is still ahead,
    /// otherwise `pending`. An immediate draft is due from now.
    pub async fn queue(&self, id: &str, now: DateTime<Utc>) -> Result<Post> {
        let post = self
            .modify(id, |post| {
                if post.status != PostStatus::Draft {
                    return Err(FanoutError::InvalidTransition {
                        from: post.status,
                        to: PostStatus::Pending,
                    });
                }

                if post.schedule.kind == ScheduleKind::Immediate {
                    post.schedule.target_time = now;
                } else {
                    reject_past(post.schedule.target_time, now)?;
                }
                let next = queued_status(&post.schedule, now);
                post.transition(next, now)
            })
            .await?;

        tracing::info!(post_id = %id, status = %post.status, "Draft queued");
        Ok(post)
    }

    /// Return `processing` posts claimed at or before `cutoff` to the queue.
    /// Returns the ids that were recovered.
    pub async fn recover_stale(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        crate::dispatcher::recover_stale_posts(self.store.as_ref(), cutoff, now, &self.events).await
    }

    /// Read, mutate and write back `id` guarded on the status that was read
    async fn modify<F>(&self, id: &str, mut change: F) -> Result<Post>
    where
        F: FnMut(&mut Post) -> Result<()>,
    {
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let mut post = self.get(id).await?;
            let observed = post.status;

            change(&mut post)?;
            if self.store.save_if_status(&post, observed).await? {
                return Ok(post);
            }
            tracing::debug!(post_id = %id, "Post changed concurrently, re-reading");
        }

        Err(busy(id))
    }
}

fn busy(id: &str) -> FanoutError {
    FanoutError::InvalidInput(format!(
        "Post {} kept changing while it was being updated; try again",
        id
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::PlatformState;
    use chrono::Duration;

    fn service() -> QueueService {
        QueueService::new(Arc::new(MemoryStore::new()), RetryPolicy::default())
    }

    async fn failed_post(service: &QueueService) -> Post {
        let mut post = Post::new("t", "hello", &["a", "b"]);
        post.status = PostStatus::Failed;
        post.retry.count = 3;
        post.platform_targets.insert(
            "a".to_string(),
            PlatformState {
                posted: true,
                post_id: Some("a-1".to_string()),
                attempt_count: 1,
                ..PlatformState::enabled()
            },
        );
        post.platform_targets.insert(
            "b".to_string(),
            PlatformState {
                last_error: Some("Network error: down".to_string()),
                attempt_count: 3,
                ..PlatformState::enabled()
            },
        );
        service.store().insert(&post).await.unwrap();
        post
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let service = service();
        let post = service
            .create(NewPost::new("t", "hello").platform("nostr"), Utc::now())
            .await
            .unwrap();

        let loaded = service.get(&post.id).await.unwrap();
        assert_eq!(loaded.status, PostStatus::Pending);
        assert!(matches!(
            service.get("missing").await.unwrap_err(),
            FanoutError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_cancel_pending() {
        let service = service();
        let post = service
            .create(NewPost::new("t", "hello").platform("nostr"), Utc::now())
            .await
            .unwrap();

        let outcome = service.cancel(&post.id, Utc::now()).await.unwrap();
        assert!(matches!(outcome, CancelOutcome::Cancelled { .. }));
        assert_eq!(
            service.get(&post.id).await.unwrap().status,
            PostStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn test_cancel_terminal_is_rejected() {
        let service = service();
        let post = service
            .create(NewPost::new("t", "hello").platform("nostr"), Utc::now())
            .await
            .unwrap();
        service.cancel(&post.id, Utc::now()).await.unwrap();

        let err = service.cancel(&post.id, Utc::now()).await.unwrap_err();
        assert!(matches!(err, FanoutError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_cancel_processing_is_deferred() {
        let service = service();
        let post = service
            .create(NewPost::new("t", "hello").platform("nostr"), Utc::now())
            .await
            .unwrap();
        service
            .store()
            .claim(&post.id, PostStatus::Pending, Utc::now())
            .await
            .unwrap();

        let outcome = service.cancel(&post.id, Utc::now()).await.unwrap();
        assert!(matches!(outcome, CancelOutcome::Deferred { .. }));

        let stored = service.get(&post.id).await.unwrap();
        assert_eq!(stored.status, PostStatus::Processing);
        assert!(stored.cancel_requested);
    }

    #[tokio::test]
    async fn test_reset_retries_clears_only_unposted_platforms() {
        let service = service();
        let post = failed_post(&service).await;

        let reset = service.reset_retries(&post.id, Utc::now()).await.unwrap();

        assert_eq!(reset.status, PostStatus::Pending);
        assert_eq!(reset.retry.count, 0);
        assert_eq!(reset.retry.next_retry_at, None);

        let a = &reset.platform_targets["a"];
        assert!(a.posted);
        assert_eq!(a.attempt_count, 1);

        let b = &reset.platform_targets["b"];
        assert_eq!(b.last_error, None);
        assert_eq!(b.attempt_count, 0);

        assert_eq!(reset.errors.last().unwrap().message, RESET_NOTE);
        assert_eq!(service.get(&post.id).await.unwrap(), reset);
    }

    #[tokio::test]
    async fn test_reset_requires_failed() {
        let service = service();
        let post = service
            .create(NewPost::new("t", "hello").platform("nostr"), Utc::now())
            .await
            .unwrap();

        let err = service.reset_retries(&post.id, Utc::now()).await.unwrap_err();
        assert!(matches!(
            err,
            FanoutError::InvalidTransition {
                from: PostStatus::Pending,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_queue_draft() {
        let service = service();
        let now = Utc::now();

        let mut immediate = NewPost::new("t", "hello").platform("nostr");
        immediate.draft = true;
        let draft = service.create(immediate, now).await.unwrap();
        assert_eq!(draft.status, PostStatus::Draft);

        let later = now + Duration::minutes(5);
        let queued = service.queue(&draft.id, later).await.unwrap();
        assert_eq!(queued.status, PostStatus::Pending);
        assert_eq!(queued.schedule.target_time, later);

        let mut future = NewPost::new("t", "later")
            .platform("nostr")
            .schedule(creation::ScheduleRequest::At(now + Duration::days(1)));
        future.draft = true;
        let draft = service.create(future, now).await.unwrap();
        let queued = service.queue(&draft.id, now).await.unwrap();
        assert_eq!(queued.status, PostStatus::Scheduled);

        assert!(service.queue(&draft.id, now).await.is_err());
    }

    #[tokio::test]
    async fn test_queue_draft_whose_time_has_passed() {
        let service = service();
        let now = Utc::now();

        let mut request = NewPost::new("t", "hello")
            .platform("nostr")
            .schedule(creation::ScheduleRequest::At(now + Duration::minutes(10)));
        request.draft = true;
        let draft = service.create(request, now).await.unwrap();

        let err = service
            .queue(&draft.id, now + Duration::hours(1))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("in the past"));
    }
}
