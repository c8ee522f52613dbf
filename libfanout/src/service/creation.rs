//! Post creation and content validation
//!
//! Everything that can be wrong with a post is rejected here, before it is
//! stored, so the dispatcher never sees a post it cannot attempt.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{FanoutError, Result};
use crate::retry::RetryPolicy;
use crate::types::{
    Frequency, MediaAttachment, PlatformState, Post, PostContent, PostStatus, Priority,
    Recurrence, RetryState, Schedule, MAX_MEDIA, MAX_RETRIES_CEILING, MAX_TEXT_CHARS,
};

/// When a new post should go out
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ScheduleRequest {
    #[default]
    Immediate,
    At(DateTime<Utc>),
    Recurring {
        first: DateTime<Utc>,
        frequency: Frequency,
        max_occurrences: Option<u32>,
    },
}

/// Input to [`QueueService::create`](crate::service::QueueService::create)
#[derive(Debug, Clone, Default)]
pub struct NewPost {
    pub owner: String,
    pub text: String,
    pub media: Vec<MediaAttachment>,
    pub hashtags: Vec<String>,
    /// Platforms to publish to; every one listed is enabled
    pub platforms: Vec<String>,
    pub schedule: ScheduleRequest,
    pub priority: Priority,
    /// Overrides the configured default
    pub max_retries: Option<u32>,
    /// Keep as a draft instead of queueing
    pub draft: bool,
}

impl NewPost {
    pub fn new(owner: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn platform(mut self, name: impl Into<String>) -> Self {
        self.platforms.push(name.into());
        self
    }

    pub fn schedule(mut self, schedule: ScheduleRequest) -> Self {
        self.schedule = schedule;
        self
    }

    /// Validate and turn into a storable post
    pub fn build(self, defaults: &RetryPolicy, now: DateTime<Utc>) -> Result<Post> {
        let owner = self.owner.trim().to_string();
        if owner.is_empty() {
            return Err(FanoutError::InvalidInput("Owner cannot be empty".to_string()));
        }

        let content = validate_content(self.text, self.media, &self.hashtags)?;
        let platform_targets = platform_targets(&self.platforms)?;

        let max_retries = self.max_retries.unwrap_or(defaults.max_retries);
        if max_retries > MAX_RETRIES_CEILING {
            return Err(FanoutError::InvalidInput(format!(
                "max_retries must be at most {} (got {})",
                MAX_RETRIES_CEILING, max_retries
            )));
        }

        let schedule = build_schedule(self.schedule, now)?;
        let status = if self.draft {
            PostStatus::Draft
        } else {
            queued_status(&schedule, now)
        };

        Ok(Post {
            id: Uuid::new_v4().to_string(),
            owner,
            content,
            platform_targets,
            schedule,
            status,
            priority: self.priority,
            retry: RetryState::new(max_retries, defaults.backoff_multiplier),
            errors: Vec::new(),
            cancel_requested: false,
            claimed_at: None,
            created_at: now,
            updated_at: now,
        })
    }
}

/// `scheduled` for a future target time, otherwise `pending`
pub(crate) fn queued_status(schedule: &Schedule, now: DateTime<Utc>) -> PostStatus {
    if schedule.target_time > now {
        PostStatus::Scheduled
    } else {
        PostStatus::Pending
    }
}

fn build_schedule(request: ScheduleRequest, now: DateTime<Utc>) -> Result<Schedule> {
    match request {
        ScheduleRequest::Immediate => Ok(Schedule::immediate(now)),
        ScheduleRequest::At(at) => {
            reject_past(at, now)?;
            Ok(Schedule::at(at))
        }
        ScheduleRequest::Recurring {
            first,
            frequency,
            max_occurrences,
        } => {
            reject_past(first, now)?;
            if max_occurrences == Some(0) {
                return Err(FanoutError::InvalidInput(
                    "max_occurrences must be at least 1".to_string(),
                ));
            }
            Ok(Schedule::recurring(
                first,
                Recurrence {
                    frequency,
                    occurrences: 0,
                    max_occurrences,
                },
            ))
        }
    }
}

pub(crate) fn reject_past(at: DateTime<Utc>, now: DateTime<Utc>) -> Result<()> {
    if at < now {
        return Err(FanoutError::InvalidInput(format!(
            "Scheduled time {} is in the past",
            at.to_rfc3339()
        )));
    }
    Ok(())
}

/// Check bounds and normalize hashtags
pub fn validate_content(
    text: String,
    media: Vec<MediaAttachment>,
    hashtags: &[String],
) -> Result<PostContent> {
    let length = text.chars().count();
    if length > MAX_TEXT_CHARS {
        return Err(FanoutError::InvalidInput(format!(
            "Content too large: {} characters (maximum: {} characters)",
            length, MAX_TEXT_CHARS
        )));
    }

    if text.trim().is_empty() && media.is_empty() {
        return Err(FanoutError::InvalidInput(
            "Content cannot be empty".to_string(),
        ));
    }

    if media.len() > MAX_MEDIA {
        return Err(FanoutError::InvalidInput(format!(
            "Too many media attachments: {} (maximum: {})",
            media.len(),
            MAX_MEDIA
        )));
    }

    for attachment in &media {
        let url = attachment.url.trim();
        if !(url.starts_with("https://") || url.starts_with("http://")) {
            return Err(FanoutError::InvalidInput(format!(
                "Media URL must be http(s): '{}'",
                attachment.url
            )));
        }
    }

    Ok(PostContent {
        text,
        media,
        hashtags: normalize_hashtags(hashtags)?,
    })
}

/// Strip a leading `#`, lowercase, drop duplicates, sort
pub fn normalize_hashtags(hashtags: &[String]) -> Result<Vec<String>> {
    let mut normalized = BTreeSet::new();
    for raw in hashtags {
        let tag = raw.trim().trim_start_matches('#').to_lowercase();
        if tag.is_empty() {
            continue;
        }
        if tag.chars().any(char::is_whitespace) {
            return Err(FanoutError::InvalidInput(format!(
                "Hashtag cannot contain whitespace: '{}'",
                raw
            )));
        }
        normalized.insert(tag);
    }
    Ok(normalized.into_iter().collect())
}

fn platform_targets(platforms: &[String]) -> Result<BTreeMap<String, PlatformState>> {
    let targets: BTreeMap<String, PlatformState> = platforms
        .iter()
        .map(|p| p.trim().to_lowercase())
        .filter(|p| !p.is_empty())
        .map(|p| (p, PlatformState::enabled()))
        .collect();

    if targets.is_empty() {
        return Err(FanoutError::InvalidInput(
            "At least one platform must be enabled".to_string(),
        ));
    }
    Ok(targets)
}
