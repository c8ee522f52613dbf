//! Dispatch event bus
//!
//! The dispatcher announces what it does on a `tokio::sync::broadcast`
//! channel. Emitting never blocks: with no subscribers an event is dropped,
//! and a lagging subscriber misses the oldest events.
//!
//! ```no_run
//! use libfanout::service::events::{DispatchEvent, EventBus};
//!
//! # async fn example() {
//! let events = EventBus::new(100);
//! let mut receiver = events.subscribe();
//!
//! events.emit(DispatchEvent::PostClaimed {
//!     post_id: "abc123".to_string(),
//!     platforms: vec!["nostr".to_string()],
//! });
//!
//! if let Ok(event) = receiver.recv().await {
//!     println!("{:?}", event);
//! }
//! # }
//! ```

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::PublishErrorKind;
use crate::types::PostStatus;

pub type EventReceiver = broadcast::Receiver<DispatchEvent>;

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<DispatchEvent>,
}

impl EventBus {
    /// `capacity` is the per-subscriber buffer before old events are dropped
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: DispatchEvent) {
        // Err only means nobody is listening
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(100)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DispatchEvent {
    /// A dispatcher won the claim and is about to publish
    PostClaimed {
        post_id: String,
        /// Platforms that will be attempted in this pass
        platforms: Vec<String>,
    },

    PlatformPublished {
        post_id: String,
        platform: String,
        platform_post_id: String,
        url: String,
    },

    PlatformFailed {
        post_id: String,
        platform: String,
        kind: PublishErrorKind,
        message: String,
    },

    /// The pass was saved; `status` is what the store kept
    PostFinished {
        post_id: String,
        status: PostStatus,
        retry_count: u32,
    },

    /// A stale `processing` claim was returned to the queue
    PostRecovered { post_id: String },
}

impl DispatchEvent {
    pub fn post_id(&self) -> &str {
        match self {
            DispatchEvent::PostClaimed { post_id, .. }
            | DispatchEvent::PlatformPublished { post_id, .. }
            | DispatchEvent::PlatformFailed { post_id, .. }
            | DispatchEvent::PostFinished { post_id, .. }
            | DispatchEvent::PostRecovered { post_id } => post_id,
        }
    }
}
