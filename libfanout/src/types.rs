//! Core types for Fanout
//!
//! A [`Post`] is one unit of schedulable content targeting one or more
//! platforms. Each platform keeps its own [`PlatformState`]; the aggregate
//! [`PostStatus`] is derived from them by the dispatcher and guarded by
//! [`PostStatus::can_transition_to`].

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{FanoutError, PublishError, Result};

/// Maximum text length in characters
pub const MAX_TEXT_CHARS: usize = 5_000;

/// Maximum number of media attachments per post
pub const MAX_MEDIA: usize = 10;

/// Default number of automatic retries for a post
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Hard ceiling for the per-post retry limit
pub const MAX_RETRIES_CEILING: u32 = 10;

/// Default growth factor between successive retry delays
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PostStatus {
    Draft,
    Pending,
    Scheduled,
    Processing,
    Posted,
    Failed,
    Cancelled,
}

impl PostStatus {
    pub const ALL: [PostStatus; 7] = [
        PostStatus::Draft,
        PostStatus::Pending,
        PostStatus::Scheduled,
        PostStatus::Processing,
        PostStatus::Posted,
        PostStatus::Failed,
        PostStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PostStatus::Draft => "draft",
            PostStatus::Pending => "pending",
            PostStatus::Scheduled => "scheduled",
            PostStatus::Processing => "processing",
            PostStatus::Posted => "posted",
            PostStatus::Failed => "failed",
            PostStatus::Cancelled => "cancelled",
        }
    }

    /// Statuses the dispatcher may claim
    pub fn is_dispatchable(&self) -> bool {
        matches!(self, PostStatus::Pending | PostStatus::Scheduled)
    }

    /// `posted` and `cancelled` never move again; `failed` only through an
    /// explicit retry reset.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PostStatus::Posted | PostStatus::Failed | PostStatus::Cancelled
        )
    }

    /// Lifecycle guard.
    ///
    /// ```text
    /// draft -> {pending, scheduled, cancelled}
    /// pending | scheduled -> {processing, cancelled}
    /// processing -> {posted, pending, failed, cancelled}
    /// failed -> {pending, cancelled}
    /// ```
    pub fn can_transition_to(&self, next: PostStatus) -> bool {
        use PostStatus::*;
        matches!(
            (self, next),
            (Draft, Pending | Scheduled | Cancelled)
                | (Pending | Scheduled, Processing | Cancelled)
                | (Processing, Posted | Pending | Failed | Cancelled)
                | (Failed, Pending | Cancelled)
        )
    }

    /// Status actually persisted when a cancel request arrived while the
    /// post was being processed. Delivered posts stay delivered.
    pub fn after_cancel_request(self) -> PostStatus {
        match self {
            PostStatus::Pending | PostStatus::Failed => PostStatus::Cancelled,
            other => other,
        }
    }
}

impl std::fmt::Display for PostStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PostStatus {
    type Err = FanoutError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "draft" => Ok(PostStatus::Draft),
            "pending" => Ok(PostStatus::Pending),
            "scheduled" => Ok(PostStatus::Scheduled),
            "processing" => Ok(PostStatus::Processing),
            "posted" => Ok(PostStatus::Posted),
            "failed" => Ok(PostStatus::Failed),
            "cancelled" | "canceled" => Ok(PostStatus::Cancelled),
            other => Err(FanoutError::InvalidInput(format!(
                "Unknown status '{}'. Valid options: draft, pending, scheduled, processing, posted, failed, cancelled",
                other
            ))),
        }
    }
}

/// Dispatch priority tier; lower rank is dispatched first
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Urgent,
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    pub fn rank(&self) -> i64 {
        match self {
            Priority::Urgent => 0,
            Priority::High => 1,
            Priority::Normal => 2,
            Priority::Low => 3,
        }
    }

    pub fn from_rank(rank: i64) -> Option<Self> {
        match rank {
            0 => Some(Priority::Urgent),
            1 => Some(Priority::High),
            2 => Some(Priority::Normal),
            3 => Some(Priority::Low),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Urgent => "urgent",
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

impl FromStr for Priority {
    type Err = FanoutError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "urgent" => Ok(Priority::Urgent),
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            other => Err(FanoutError::InvalidInput(format!(
                "Unknown priority '{}'. Valid options: urgent, high, normal, low",
                other
            ))),
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Content
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Video,
}

impl FromStr for MediaKind {
    type Err = FanoutError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "image" => Ok(MediaKind::Image),
            "video" => Ok(MediaKind::Video),
            other => Err(FanoutError::InvalidInput(format!(
                "Unknown media type '{}'. Valid options: image, video",
                other
            ))),
        }
    }
}

/// A media attachment referenced by URL
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MediaAttachment {
    pub kind: MediaKind,
    pub url: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl MediaAttachment {
    pub fn new(kind: MediaKind, url: impl Into<String>) -> Self {
        Self {
            kind,
            url: url.into(),
            metadata: BTreeMap::new(),
        }
    }
}

/// What gets published; immutable once the post is created
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct PostContent {
    pub text: String,
    #[serde(default)]
    pub media: Vec<MediaAttachment>,
    #[serde(default)]
    pub hashtags: Vec<String>,
}

impl PostContent {
    /// Text followed by the hashtags, as most platforms expect them inline
    pub fn render_text(&self) -> String {
        if self.hashtags.is_empty() {
            return self.text.clone();
        }
        let tags: Vec<String> = self.hashtags.iter().map(|t| format!("#{}", t)).collect();
        if self.text.is_empty() {
            tags.join(" ")
        } else {
            format!("{}\n\n{}", self.text, tags.join(" "))
        }
    }
}

// ============================================================================
// Per-platform state
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct PlatformState {
    pub enabled: bool,
    pub posted: bool,
    pub post_id: Option<String>,
    pub post_url: Option<String>,
    pub last_error: Option<String>,
    /// Failed publish attempts, cleared by a retry reset
    #[serde(default)]
    pub attempt_count: u32,
    #[serde(default)]
    pub last_attempt_at: Option<DateTime<Utc>>,
}

impl PlatformState {
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Default::default()
        }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    /// Whether the dispatcher still has work to do here
    pub fn is_outstanding(&self) -> bool {
        self.enabled && !self.posted
    }
}

/// Identifier and link returned by a platform after publishing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PublishReceipt {
    pub post_id: String,
    pub post_url: String,
}

// ============================================================================
// Schedule
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    Immediate,
    FixedTime,
    Recurring,
}

impl ScheduleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleKind::Immediate => "immediate",
            ScheduleKind::FixedTime => "fixed_time",
            ScheduleKind::Recurring => "recurring",
        }
    }
}

impl FromStr for ScheduleKind {
    type Err = FanoutError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "immediate" => Ok(ScheduleKind::Immediate),
            "fixed_time" => Ok(ScheduleKind::FixedTime),
            "recurring" => Ok(ScheduleKind::Recurring),
            other => Err(FanoutError::InvalidInput(format!(
                "Unknown schedule kind '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    Hourly,
    Daily,
    Weekly,
    Monthly,
}

impl FromStr for Frequency {
    type Err = FanoutError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "hourly" => Ok(Frequency::Hourly),
            "daily" => Ok(Frequency::Daily),
            "weekly" => Ok(Frequency::Weekly),
            "monthly" => Ok(Frequency::Monthly),
            other => Err(FanoutError::InvalidInput(format!(
                "Unknown frequency '{}'. Valid options: hourly, daily, weekly, monthly",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Recurrence {
    pub frequency: Frequency,
    #[serde(default)]
    pub occurrences: u32,
    pub max_occurrences: Option<u32>,
}

impl Recurrence {
    pub fn is_exhausted(&self) -> bool {
        self.max_occurrences
            .is_some_and(|max| self.occurrences >= max)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Schedule {
    pub kind: ScheduleKind,
    pub target_time: DateTime<Utc>,
    pub recurrence: Option<Recurrence>,
}

impl Schedule {
    pub fn immediate(now: DateTime<Utc>) -> Self {
        Self {
            kind: ScheduleKind::Immediate,
            target_time: now,
            recurrence: None,
        }
    }

    pub fn at(target_time: DateTime<Utc>) -> Self {
        Self {
            kind: ScheduleKind::FixedTime,
            target_time,
            recurrence: None,
        }
    }

    pub fn recurring(target_time: DateTime<Utc>, recurrence: Recurrence) -> Self {
        Self {
            kind: ScheduleKind::Recurring,
            target_time,
            recurrence: Some(recurrence),
        }
    }

    /// A recurring schedule with no occurrences left never comes due
    pub fn is_exhausted(&self) -> bool {
        self.kind == ScheduleKind::Recurring
            && self.recurrence.as_ref().is_some_and(Recurrence::is_exhausted)
    }
}

// ============================================================================
// Retry bookkeeping and audit log
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryState {
    /// Failed processing passes so far; never exceeds `max_retries`
    pub count: u32,
    pub max_retries: u32,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub backoff_multiplier: f64,
}

impl RetryState {
    pub fn new(max_retries: u32, backoff_multiplier: f64) -> Self {
        Self {
            count: 0,
            max_retries,
            last_retry_at: None,
            next_retry_at: None,
            backoff_multiplier,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.count >= self.max_retries
    }

    /// Count one more failed pass, saturating at `max_retries`
    pub fn record_failed_pass(&mut self) {
        self.count = self.count.saturating_add(1).min(self.max_retries);
    }

    pub fn reset(&mut self) {
        self.count = 0;
        self.last_retry_at = None;
        self.next_retry_at = None;
    }
}

impl Default for RetryState {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES, DEFAULT_BACKOFF_MULTIPLIER)
    }
}

/// One entry of the append-only audit log
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorEntry {
    pub timestamp: DateTime<Utc>,
    pub platform: Option<String>,
    pub message: String,
}

// ============================================================================
// Post
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Post {
    pub id: String,
    pub owner: String,
    pub content: PostContent,
    pub platform_targets: BTreeMap<String, PlatformState>,
    pub schedule: Schedule,
    pub status: PostStatus,
    #[serde(default)]
    pub priority: Priority,
    pub retry: RetryState,
    #[serde(default)]
    pub errors: Vec<ErrorEntry>,
    /// Set when a cancel arrives during processing; honoured when the pass is saved
    #[serde(default)]
    pub cancel_requested: bool,
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Post {
    /// Create a pending post publishing immediately to `platforms`.
    ///
    /// This skips the validation done by
    /// [`NewPost`](crate::service::creation::NewPost); use that for
    /// user-supplied input.
    pub fn new(owner: impl Into<String>, text: impl Into<String>, platforms: &[&str]) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            owner: owner.into(),
            content: PostContent {
                text: text.into(),
                ..Default::default()
            },
            platform_targets: platforms
                .iter()
                .map(|p| (p.to_string(), PlatformState::enabled()))
                .collect(),
            schedule: Schedule::immediate(now),
            status: PostStatus::Pending,
            priority: Priority::Normal,
            retry: RetryState::default(),
            errors: Vec::new(),
            cancel_requested: false,
            claimed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `next`, refusing transitions the lifecycle does not allow
    pub fn transition(&mut self, next: PostStatus, now: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(FanoutError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    pub fn enabled_platforms(&self) -> Vec<String> {
        self.platform_targets
            .iter()
            .filter(|(_, state)| state.enabled)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Enabled platforms that have not been published to yet
    pub fn pending_targets(&self) -> Vec<String> {
        self.platform_targets
            .iter()
            .filter(|(_, state)| state.is_outstanding())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// True when at least one platform is enabled and every enabled one is posted
    pub fn all_enabled_posted(&self) -> bool {
        let mut enabled = self.platform_targets.values().filter(|s| s.enabled).peekable();
        enabled.peek().is_some() && enabled.all(|s| s.posted)
    }

    /// `status == posted` iff every enabled platform is posted.
    /// Only meaningful for posts at rest (not `processing`).
    pub fn status_is_consistent(&self) -> bool {
        (self.status == PostStatus::Posted) == self.all_enabled_posted()
    }

    /// Eligible for dispatch at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status.is_dispatchable()
            && self.schedule.target_time <= now
            && self.retry.next_retry_at.map_or(true, |at| at <= now)
            && !self.schedule.is_exhausted()
    }

    /// Append to the audit log
    pub fn log_error(&mut self, platform: Option<&str>, message: impl Into<String>, now: DateTime<Utc>) {
        self.errors.push(ErrorEntry {
            timestamp: now,
            platform: platform.map(str::to_string),
            message: message.into(),
        });
        self.updated_at = now;
    }

    /// Fold one platform's publish outcome into its state.
    ///
    /// Success marks the platform posted and clears its standing error.
    /// Failure records the error on the platform and in the audit log.
    /// The audit log is never rewritten.
    pub fn apply_outcome(
        &mut self,
        platform: &str,
        outcome: &std::result::Result<PublishReceipt, PublishError>,
        now: DateTime<Utc>,
    ) {
        let state = self.platform_targets.entry(platform.to_string()).or_default();
        state.last_attempt_at = Some(now);

        match outcome {
            Ok(receipt) => {
                state.posted = true;
                state.post_id = Some(receipt.post_id.clone());
                state.post_url = Some(receipt.post_url.clone());
                state.last_error = None;
                self.updated_at = now;
            }
            Err(error) => {
                state.attempt_count = state.attempt_count.saturating_add(1);
                state.last_error = Some(error.to_string());
                self.log_error(Some(platform), error.to_string(), now);
            }
        }
    }

    pub fn mark_claimed(&mut self, now: DateTime<Utc>) {
        self.status = PostStatus::Processing;
        self.claimed_at = Some(now);
        self.updated_at = now;
    }
}
