//! The dispatcher: polls for due posts and drives each through one
//! publishing pass.
//!
//! A cycle sweeps stale claims, asks the store for due posts, claims each
//! one with a compare-and-set and processes the winners concurrently. Any
//! number of dispatchers may share a store; the claim is the only
//! coordination between them.
//!
//! A failure inside one post's pass is logged and counted in the
//! [`CycleReport`]; it never stops the other posts in the cycle or the loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, warn};

use crate::accounting::{PublishUsage, UsageAccountant};
use crate::error::{FanoutError, PublishError, Result};
use crate::platforms::{PublishResult, Publishers};
use crate::retry::RetryPolicy;
use crate::service::events::{DispatchEvent, EventBus};
use crate::store::PostStore;
use crate::types::{Post, PostContent, PostStatus};

/// Audit entry written when a stale claim is returned to the queue
pub const STALE_RECOVERY_NOTE: &str = "recovered from stale processing claim";

/// Audit entry written when a post has no enabled platform at all
pub const NO_PLATFORMS_NOTE: &str = "no platforms enabled";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Pause between cycles
    #[serde(with = "crate::config::duration_str")]
    pub poll_interval: Duration,
    /// Most posts taken from the store per cycle
    pub batch_size: usize,
    /// Bound on a single platform call
    #[serde(with = "crate::config::duration_str")]
    pub publish_timeout: Duration,
    /// A `processing` claim older than this is considered abandoned
    #[serde(with = "crate::config::duration_str")]
    pub stale_after: Duration,
    /// Posts processed at the same time within a cycle
    pub concurrency: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            batch_size: 50,
            publish_timeout: Duration::from_secs(30),
            stale_after: Duration::from_secs(10 * 60),
            concurrency: 4,
        }
    }
}

/// What one cycle did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    /// Posts claimed by this dispatcher
    pub claimed: usize,
    /// Due posts another dispatcher claimed first
    pub skipped: usize,
    pub posted: usize,
    /// Returned to `pending` for a later attempt
    pub retrying: usize,
    pub failed: usize,
    /// Cancelled by an operator while in flight
    pub cancelled: usize,
    /// Stale claims returned to the queue
    pub recovered: usize,
    /// Store errors and lost claims
    pub errors: usize,
}

impl CycleReport {
    pub fn is_idle(&self) -> bool {
        *self == CycleReport::default()
    }

    fn record(&mut self, outcome: &DispatchOutcome) {
        match outcome {
            DispatchOutcome::Skipped => self.skipped += 1,
            DispatchOutcome::Errored => {
                self.claimed += 1;
                self.errors += 1;
            }
            DispatchOutcome::Finished(status) => {
                self.claimed += 1;
                match status {
                    PostStatus::Posted => self.posted += 1,
                    PostStatus::Pending => self.retrying += 1,
                    PostStatus::Failed => self.failed += 1,
                    PostStatus::Cancelled => self.cancelled += 1,
                    _ => {}
                }
            }
        }
    }
}

impl std::fmt::Display for CycleReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "claimed={} skipped={} posted={} retrying={} failed={} cancelled={} recovered={} errors={}",
            self.claimed,
            self.skipped,
            self.posted,
            self.retrying,
            self.failed,
            self.cancelled,
            self.recovered,
            self.errors
        )
    }
}

enum DispatchOutcome {
    Skipped,
    Finished(PostStatus),
    Errored,
}

pub struct Dispatcher {
    store: Arc<dyn PostStore>,
    publishers: Publishers,
    accountant: Arc<dyn UsageAccountant>,
    policy: RetryPolicy,
    config: DispatcherConfig,
    events: EventBus,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn PostStore>,
        publishers: Publishers,
        accountant: Arc<dyn UsageAccountant>,
        policy: RetryPolicy,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            store,
            publishers,
            accountant,
            policy,
            config,
            events: EventBus::default(),
        }
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Run one poll cycle at `now`.
    ///
    /// # Errors
    ///
    /// Only if the due-work query itself fails; everything after that is
    /// counted in the report instead.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> Result<CycleReport> {
        let mut report = CycleReport::default();

        let stale_after =
            chrono::Duration::from_std(self.config.stale_after).unwrap_or(chrono::Duration::MAX);
        match now.checked_sub_signed(stale_after) {
            Some(cutoff) => {
                match recover_stale_posts(self.store.as_ref(), cutoff, now, &self.events).await {
                    Ok(recovered) => report.recovered = recovered.len(),
                    Err(e) => {
                        error!(error = %e, "Stale claim sweep failed");
                        report.errors += 1;
                    }
                }
            }
            None => debug!("Stale cutoff out of range, skipping sweep"),
        }

        let due = self.store.find_due(now, self.config.batch_size).await?;
        if !due.is_empty() {
            debug!(count = due.len(), "Found due posts");
        }

        let outcomes: Vec<DispatchOutcome> = stream::iter(due)
            .map(|post| self.dispatch(post, now))
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        for outcome in &outcomes {
            report.record(outcome);
        }
        Ok(report)
    }

    /// Claim `post` and process it, containing every error
    async fn dispatch(&self, mut post: Post, now: DateTime<Utc>) -> DispatchOutcome {
        let post_id = post.id.clone();

        match self.store.claim(&post_id, post.status, now).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(post_id = %post_id, "Post claimed elsewhere, skipping");
                return DispatchOutcome::Skipped;
            }
            Err(e) => {
                error!(post_id = %post_id, error = %e, "Claim failed");
                return DispatchOutcome::Errored;
            }
        }

        post.mark_claimed(now);
        post.cancel_requested = false;

        match self.process_post(post, now).await {
            Ok(status) => DispatchOutcome::Finished(status),
            Err(FanoutError::ClaimLost(_)) => {
                warn!(post_id = %post_id, "Claim lost before the pass was saved; outcome discarded");
                DispatchOutcome::Errored
            }
            Err(e) => {
                error!(post_id = %post_id, error = %e, "Processing failed");
                DispatchOutcome::Errored
            }
        }
    }

    /// Run one publishing pass over a post this dispatcher has claimed and
    /// persist the result. Returns the status the store kept.
    ///
    /// Platforms already posted are never called again. All platform calls
    /// finish (or time out) before the post is saved in a single write.
    pub async fn process_post(&self, mut post: Post, now: DateTime<Utc>) -> Result<PostStatus> {
        let targets = post.pending_targets();

        if targets.is_empty() {
            if post.all_enabled_posted() {
                post.transition(PostStatus::Posted, now)?;
            } else {
                warn!(post_id = %post.id, "Post has no enabled platforms");
                post.log_error(None, NO_PLATFORMS_NOTE, now);
                post.retry.next_retry_at = None;
                post.transition(PostStatus::Failed, now)?;
            }
        } else {
            info!(
                post_id = %post.id,
                platforms = ?targets,
                attempt = post.retry.count + 1,
                "Publishing post"
            );
            self.events.emit(DispatchEvent::PostClaimed {
                post_id: post.id.clone(),
                platforms: targets.clone(),
            });

            let calls = targets.iter().map(|name| self.publish_to(name, &post.content));
            let outcomes = join_all(calls).await;

            for (name, outcome) in targets.iter().zip(outcomes) {
                post.apply_outcome(name, &outcome, now);
                self.announce(&post.id, name, &outcome, post.retry.count + 1);
            }

            if post.all_enabled_posted() {
                post.transition(PostStatus::Posted, now)?;
            } else {
                let decision = self.policy.apply_failure(&mut post, now)?;
                if decision.retry {
                    info!(
                        post_id = %post.id,
                        retry_count = post.retry.count,
                        next_retry_at = ?decision.next_retry_at,
                        "Post will be retried"
                    );
                }
            }
        }

        let persisted = self.store.save(&post).await?;

        if persisted == PostStatus::Posted {
            self.account(&post, now).await;
        }

        match persisted {
            PostStatus::Posted => info!(post_id = %post.id, status = %persisted, "Post published"),
            PostStatus::Failed => warn!(
                post_id = %post.id,
                status = %persisted,
                retry_count = post.retry.count,
                "Post failed, retries exhausted"
            ),
            PostStatus::Cancelled => info!(post_id = %post.id, status = %persisted, "Post cancelled after pass"),
            _ => debug!(post_id = %post.id, status = %persisted, "Pass saved"),
        }

        self.events.emit(DispatchEvent::PostFinished {
            post_id: post.id.clone(),
            status: persisted,
            retry_count: post.retry.count,
        });
        Ok(persisted)
    }

    /// Loop cycles until `shutdown` is raised, checking it at least once a
    /// second while idle.
    pub async fn run(&self, shutdown: Arc<AtomicBool>) {
        loop {
            if shutdown.load(Ordering::Relaxed) {
                info!("Shutdown requested, stopping dispatcher loop");
                break;
            }

            match self.run_cycle(Utc::now()).await {
                Ok(report) if report.is_idle() => debug!("Nothing due"),
                Ok(report) => info!(%report, "Cycle complete"),
                Err(e) => error!(error = %e, "Cycle failed"),
            }

            let deadline = Instant::now() + self.config.poll_interval;
            while !shutdown.load(Ordering::Relaxed) {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                sleep(remaining.min(Duration::from_secs(1))).await;
            }
        }
    }

    async fn publish_to(&self, platform: &str, content: &PostContent) -> PublishResult {
        let Some(publisher) = self.publishers.get(platform) else {
            return Err(PublishError::Unknown(format!(
                "no publisher registered for {}",
                platform
            )));
        };

        match timeout(self.config.publish_timeout, publisher.publish(content)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(PublishError::timeout(self.config.publish_timeout)),
        }
    }

    fn announce(&self, post_id: &str, platform: &str, outcome: &PublishResult, attempt: u32) {
        match outcome {
            Ok(receipt) => {
                info!(post_id = %post_id, platform = %platform, platform_post_id = %receipt.post_id, "Published");
                self.events.emit(DispatchEvent::PlatformPublished {
                    post_id: post_id.to_string(),
                    platform: platform.to_string(),
                    platform_post_id: receipt.post_id.clone(),
                    url: receipt.post_url.clone(),
                });
            }
            Err(e) => {
                warn!(post_id = %post_id, platform = %platform, attempt, kind = %e.kind(), "Publish failed: {}", e);
                self.events.emit(DispatchEvent::PlatformFailed {
                    post_id: post_id.to_string(),
                    platform: platform.to_string(),
                    kind: e.kind(),
                    message: e.message().to_string(),
                });
            }
        }
    }

    async fn account(&self, post: &Post, now: DateTime<Utc>) {
        let usage = PublishUsage {
            owner: post.owner.clone(),
            post_id: post.id.clone(),
            platforms: post.enabled_platforms(),
            published_at: now,
        };
        if let Err(e) = self.accountant.record_publish(&usage).await {
            warn!(post_id = %post.id, owner = %post.owner, error = %e, "Usage accounting failed");
        }
    }
}

/// Return every `processing` post claimed at or before `cutoff` to
/// `pending`, with an audit entry. Posts whose cancel was requested end up
/// `cancelled` instead. The retry count is left alone.
///
/// The write is guarded on the stale claim, so a post that finished or was
/// re-claimed in the meantime is left as it is.
pub async fn recover_stale_posts(
    store: &dyn PostStore,
    cutoff: DateTime<Utc>,
    now: DateTime<Utc>,
    events: &EventBus,
) -> Result<Vec<String>> {
    let mut recovered = Vec::new();

    for mut post in store.find_stale_processing(cutoff).await? {
        post.log_error(None, STALE_RECOVERY_NOTE, now);
        post.transition(PostStatus::Pending, now)?;

        match store.save(&post).await {
            Ok(status) => {
                warn!(
                    post_id = %post.id,
                    claimed_at = ?post.claimed_at,
                    status = %status,
                    "Recovered stale processing claim"
                );
                events.emit(DispatchEvent::PostRecovered {
                    post_id: post.id.clone(),
                });
                recovered.push(post.id);
            }
            Err(FanoutError::ClaimLost(_)) | Err(FanoutError::NotFound(_)) => {
                debug!(post_id = %post.id, "Stale post changed before recovery, leaving it");
            }
            Err(e) => return Err(e),
        }
    }

    Ok(recovered)
}
