//! Scriptable publisher for tests
//!
//! A [`MockPublisher`] returns queued outcomes in order, then falls back to
//! its default outcome. It counts calls and remembers what it published, so
//! tests can assert that already-posted platforms are never called again.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;

use crate::error::PublishError;
use crate::platforms::{PublishResult, Publisher};
use crate::types::{PostContent, PublishReceipt};

pub struct MockPublisher {
    name: String,
    /// Returned once the script is exhausted; `None` means succeed
    fallback: Option<PublishError>,
    script: Mutex<VecDeque<Option<PublishError>>>,
    delay: Duration,
    character_limit: Option<usize>,
    calls: AtomicUsize,
    published: Mutex<Vec<PostContent>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MockPublisher {
    /// A publisher that always succeeds
    pub fn success(name: &str) -> Self {
        Self {
            name: name.to_string(),
            fallback: None,
            script: Mutex::new(VecDeque::new()),
            delay: Duration::ZERO,
            character_limit: None,
            calls: AtomicUsize::new(0),
            published: Mutex::new(Vec::new()),
        }
    }

    /// A publisher that always fails with `error`
    pub fn failure(name: &str, error: PublishError) -> Self {
        Self {
            fallback: Some(error),
            ..Self::success(name)
        }
    }

    /// Fail with each error in `errors` on successive calls, then succeed
    pub fn failing_times(name: &str, errors: Vec<PublishError>) -> Self {
        let publisher = Self::success(name);
        lock(&publisher.script).extend(errors.into_iter().map(Some));
        publisher
    }

    /// Wait `delay` before answering
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.character_limit = Some(limit);
        self
    }

    /// Queue one more outcome ahead of the fallback
    pub fn push_outcome(&self, outcome: Option<PublishError>) {
        lock(&self.script).push_back(outcome);
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn published(&self) -> Vec<PostContent> {
        lock(&self.published).clone()
    }
}

#[async_trait]
impl Publisher for MockPublisher {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, content: &PostContent) -> PublishResult {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;

        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }

        if let Some(limit) = self.character_limit {
            let length = content.render_text().chars().count();
            if length > limit {
                return Err(PublishError::ContentRejected(format!(
                    "Content exceeds {} character limit (got {} characters)",
                    limit, length
                )));
            }
        }

        let scripted = lock(&self.script).pop_front();
        let outcome = match scripted {
            Some(outcome) => outcome,
            None => self.fallback.clone(),
        };

        match outcome {
            Some(error) => Err(error),
            None => {
                lock(&self.published).push(content.clone());
                let post_id = format!("{}-mock-{}", self.name, call);
                Ok(PublishReceipt {
                    post_url: format!("https://{}.mock/posts/{}", self.name, post_id),
                    post_id,
                })
            }
        }
    }

    fn character_limit(&self) -> Option<usize> {
        self.character_limit
    }
}
