//! Nostr publisher

use async_trait::async_trait;
use nostr_sdk::{Client, Keys, Tag, ToBech32};
use secrecy::{ExposeSecret, SecretString};

use crate::config::NostrConfig;
use crate::error::{PublishError, Result};
use crate::platforms::{PublishResult, Publisher};
use crate::types::{PostContent, PublishReceipt};

/// Public web viewer used for note URLs
const NOTE_VIEWER: &str = "https://njump.me";

pub struct NostrPublisher {
    client: Client,
}

impl NostrPublisher {
    /// Connect to `relays` signing with `keys`
    pub async fn connect(keys: Keys, relays: &[String]) -> Result<Self> {
        if relays.is_empty() {
            return Err(PublishError::Network("No Nostr relays configured".to_string()).into());
        }

        let client = Client::new(keys);
        for relay in relays {
            client.add_relay(relay).await.map_err(|e| {
                PublishError::Network(format!("Failed to add relay {}: {}", relay, e))
            })?;
        }
        client.connect().await;

        Ok(Self { client })
    }

    /// Build a publisher from `[nostr]`, reading the key file
    pub async fn from_config(config: &NostrConfig) -> Result<Self> {
        let keys = load_keys(&config.keys_file)?;
        Self::connect(keys, &config.relays).await
    }
}

/// Read a hex or bech32 (`nsec`) secret key from `keys_file`
pub fn load_keys(keys_file: &str) -> Result<Keys> {
    let expanded_path = shellexpand::tilde(keys_file).to_string();
    let content = std::fs::read_to_string(&expanded_path).map_err(|e| {
        PublishError::Authentication(format!("Failed to read keys file: {}", e))
    })?;
    let secret = SecretString::from(content.trim().to_string());
    let key_str = secret.expose_secret();

    if key_str.len() != 64 && !key_str.starts_with("nsec") {
        return Err(PublishError::Authentication(
            "Key must be 64-character hex or bech32 nsec format".to_string(),
        )
        .into());
    }

    let keys = Keys::parse(key_str)
        .map_err(|e| PublishError::Authentication(format!("Invalid Nostr key: {}", e)))?;
    Ok(keys)
}

/// Note body: text, hashtags, then media URLs (clients render them inline)
fn note_text(content: &PostContent) -> String {
    let mut text = content.render_text();
    for media in &content.media {
        if !text.is_empty() {
            text.push('\n');
        }
        text.push_str(&media.url);
    }
    text
}

#[async_trait]
impl Publisher for NostrPublisher {
    fn name(&self) -> &str {
        "nostr"
    }

    async fn publish(&self, content: &PostContent) -> PublishResult {
        let tags: Vec<Tag> = content.hashtags.iter().map(|t| Tag::hashtag(t.as_str())).collect();

        let output = self
            .client
            .publish_text_note(note_text(content), tags)
            .await
            .map_err(|e| PublishError::Network(format!("Failed to publish note: {}", e)))?;

        let event_id = output.id();
        let note_id = event_id.to_bech32().unwrap_or_else(|_| event_id.to_hex());

        tracing::debug!(platform = "nostr", post_id = %note_id, "Note published");
        Ok(PublishReceipt {
            post_url: format!("{}/{}", NOTE_VIEWER, note_id),
            post_id: note_id,
        })
    }
}
