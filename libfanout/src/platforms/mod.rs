//! Platform publishers
//!
//! A [`Publisher`] takes a post's content and puts it on one external
//! platform, returning the platform's identifier and URL for the new post or
//! a typed [`PublishError`]. The dispatcher looks publishers up by platform
//! name in a [`Publishers`] registry.
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::Arc;
//! use libfanout::platforms::{mock::MockPublisher, Publishers};
//! use libfanout::types::PostContent;
//!
//! # async fn example() {
//! let mut publishers = Publishers::new();
//! publishers.register(Arc::new(MockPublisher::success("mastodon")));
//!
//! if let Some(publisher) = publishers.get("mastodon") {
//!     let content = PostContent {
//!         text: "Hello, fediverse!".to_string(),
//!         ..Default::default()
//!     };
//!     match publisher.publish(&content).await {
//!         Ok(receipt) => println!("Posted: {}", receipt.post_url),
//!         Err(e) => eprintln!("{} failed: {}", publisher.name(), e),
//!     }
//! }
//! # }
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::Config;
use crate::error::PublishError;
use crate::types::{PostContent, PublishReceipt};

pub mod mastodon;
pub mod nostr;

// Available in all builds so binaries and integration tests can use it
pub mod mock;

pub type PublishResult = std::result::Result<PublishReceipt, PublishError>;

/// Unified interface to an external platform
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Lowercase platform identifier matching the keys of a post's
    /// platform targets (e.g. "mastodon", "nostr")
    fn name(&self) -> &str;

    /// Publish `content` and return the platform's identifier and URL.
    ///
    /// Implementations do not retry; a failure is reported once and the
    /// dispatcher's retry policy decides what happens next.
    async fn publish(&self, content: &PostContent) -> PublishResult;

    /// Maximum post length in characters, if the platform enforces one
    fn character_limit(&self) -> Option<usize> {
        None
    }
}

/// Publishers keyed by platform name
#[derive(Clone, Default)]
pub struct Publishers {
    by_name: HashMap<String, Arc<dyn Publisher>>,
}

impl Publishers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a publisher under its own name, replacing any previous one
    pub fn register(&mut self, publisher: Arc<dyn Publisher>) {
        self.by_name.insert(publisher.name().to_string(), publisher);
    }

    pub fn with(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.register(publisher);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Publisher>> {
        self.by_name.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.by_name.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

/// Build publishers for every enabled platform section in `config`.
///
/// A platform that cannot be set up (missing token, bad key, unreachable
/// relay list) is logged and left out; posts targeting it then fail through
/// the normal retry path.
pub async fn build_publishers(config: &Config) -> Publishers {
    let mut publishers = Publishers::new();

    if let Some(mastodon_config) = config.mastodon.as_ref().filter(|c| c.enabled) {
        match mastodon::MastodonPublisher::from_config(mastodon_config) {
            Ok(publisher) => {
                tracing::info!(platform = "mastodon", instance = %mastodon_config.instance, "Publisher ready");
                publishers.register(Arc::new(publisher));
            }
            Err(e) => tracing::warn!(platform = "mastodon", "Publisher unavailable: {}", e),
        }
    }

    if let Some(nostr_config) = config.nostr.as_ref().filter(|c| c.enabled) {
        match nostr::NostrPublisher::from_config(nostr_config).await {
            Ok(publisher) => {
                tracing::info!(platform = "nostr", relays = nostr_config.relays.len(), "Publisher ready");
                publishers.register(Arc::new(publisher));
            }
            Err(e) => tracing::warn!(platform = "nostr", "Publisher unavailable: {}", e),
        }
    }

    publishers
}
