//! Mastodon publisher
//!
//! Publishes statuses through megalodon, so any instance speaking the
//! Mastodon API works (Mastodon, Pleroma, Akkoma, GoToSocial).
//! Media attachments are linked by URL in the status text.

use async_trait::async_trait;
use megalodon::megalodon::PostStatusOutput;
use megalodon::{Megalodon, SNS};
use secrecy::{ExposeSecret, SecretString};

use crate::config::MastodonConfig;
use crate::error::{PublishError, Result};
use crate::platforms::{PublishResult, Publisher};
use crate::types::{PostContent, PublishReceipt};

/// Default Mastodon status length
pub const DEFAULT_CHARACTER_LIMIT: usize = 500;

pub struct MastodonPublisher {
    client: Box<dyn Megalodon + Send + Sync>,
    instance_url: String,
    character_limit: usize,
}

impl MastodonPublisher {
    pub fn new(instance_url: String, access_token: SecretString) -> Result<Self> {
        let client = megalodon::generator(
            SNS::Mastodon,
            instance_url.clone(),
            Some(access_token.expose_secret().to_string()),
            None,
        )
        .map_err(|e| {
            PublishError::Authentication(format!("Failed to create Mastodon client: {:?}", e))
        })?;

        Ok(Self {
            client,
            instance_url,
            character_limit: DEFAULT_CHARACTER_LIMIT,
        })
    }

    /// Build a publisher from `[mastodon]`, reading the token file
    pub fn from_config(config: &MastodonConfig) -> Result<Self> {
        let token_path = shellexpand::full(&config.token_file).map_err(|e| {
            PublishError::Authentication(format!("Failed to expand token file path: {}", e))
        })?;

        let token = std::fs::read_to_string(token_path.as_ref()).map_err(|e| {
            PublishError::Authentication(format!("Failed to read Mastodon token file: {}", e))
        })?;
        let token = token.trim();

        if token.is_empty() {
            return Err(
                PublishError::Authentication("Mastodon token file is empty".to_string()).into(),
            );
        }

        Self::new(
            normalize_instance_url(&config.instance),
            SecretString::from(token.to_string()),
        )
    }

    pub fn instance_url(&self) -> &str {
        &self.instance_url
    }

    pub fn with_character_limit(mut self, limit: usize) -> Self {
        self.character_limit = limit;
        self
    }
}

/// Ensure the instance URL carries a scheme
pub fn normalize_instance_url(instance: &str) -> String {
    let trimmed = instance.trim().trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    }
}

/// Status text: body, hashtags, then one line per media URL
fn status_text(content: &PostContent) -> String {
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
impl Publisher for MastodonPublisher {
    fn name(&self) -> &str {
        "mastodon"
    }

    async fn publish(&self, content: &PostContent) -> PublishResult {
        let text = status_text(content);

        let length = text.chars().count();
        if length > self.character_limit {
            return Err(PublishError::ContentRejected(format!(
                "Content exceeds Mastodon's {} character limit (got {} characters)",
                self.character_limit, length
            )));
        }

        let response = self
            .client
            .post_status(text, None)
            .await
            .map_err(|e| map_megalodon_error(&e.to_string(), "post status"))?;

        let receipt = match response.json {
            PostStatusOutput::Status(status) => PublishReceipt {
                post_url: status.url.unwrap_or(status.uri),
                post_id: status.id,
            },
            PostStatusOutput::ScheduledStatus(scheduled) => PublishReceipt {
                post_url: format!("{}/scheduled_statuses/{}", self.instance_url, scheduled.id),
                post_id: scheduled.id,
            },
        };

        tracing::debug!(platform = "mastodon", post_id = %receipt.post_id, "Status published");
        Ok(receipt)
    }

    fn character_limit(&self) -> Option<usize> {
        Some(self.character_limit)
    }
}

/// Classify a megalodon error by its HTTP status, falling back to keywords
fn map_megalodon_error(error_str: &str, context: &str) -> PublishError {
    let error_lower = error_str.to_lowercase();

    match extract_http_status(error_str) {
        Some(401) | Some(403) => PublishError::Authentication(format!(
            "Mastodon rejected credentials ({}): {}",
            context, error_str
        )),
        Some(422) => PublishError::ContentRejected(format!(
            "Mastodon refused the status ({}): {}",
            context, error_str
        )),
        Some(429) => PublishError::RateLimit(format!(
            "Mastodon rate limit exceeded ({}): {}",
            context, error_str
        )),
        Some(500..=599) => {
            PublishError::Network(format!("Mastodon server error ({}): {}", context, error_str))
        }
        Some(_) => PublishError::Unknown(format!("Mastodon HTTP error ({}): {}", context, error_str)),
        None => {
            if error_lower.contains("unauthorized")
                || error_lower.contains("forbidden")
                || error_lower.contains("token")
            {
                PublishError::Authentication(format!(
                    "Mastodon rejected credentials ({}): {}",
                    context, error_str
                ))
            } else if error_lower.contains("rate limit") || error_lower.contains("too many requests") {
                PublishError::RateLimit(format!(
                    "Mastodon rate limit exceeded ({}): {}",
                    context, error_str
                ))
            } else if error_lower.contains("unprocessable") || error_lower.contains("validation") {
                PublishError::ContentRejected(format!(
                    "Mastodon refused the status ({}): {}",
                    context, error_str
                ))
            } else if error_lower.contains("parse")
                || error_lower.contains("json")
                || error_lower.contains("deserialize")
            {
                PublishError::Unknown(format!(
                    "Unexpected Mastodon response ({}): {}",
                    context, error_str
                ))
            } else {
                PublishError::Network(format!("Mastodon error ({}): {}", context, error_str))
            }
        }
    }
}

/// Find an HTTP status code in an error message
///
/// Recognizes "HTTP 401", "status 403", "code: 422" and bare codes followed
/// by a colon or space.
fn extract_http_status(error_str: &str) -> Option<u16> {
    let prefixes = ["HTTP ", "status ", "code: ", "status_code: "];

    for prefix in &prefixes {
        if let Some(pos) = error_str.find(prefix) {
            let after_prefix = &error_str[pos + prefix.len()..];
            if let Some(code) = after_prefix.get(0..3).and_then(|s| s.parse::<u16>().ok()) {
                if (100..=599).contains(&code) {
                    return Some(code);
                }
            }
        }
    }

    let bytes = error_str.as_bytes();
    for (i, window) in bytes.windows(4).enumerate() {
        let is_code = window[..3].iter().all(u8::is_ascii_digit)
            && (window[3] == b':' || window[3] == b' ')
            && (i == 0 || !bytes[i - 1].is_ascii_digit());
        if !is_code {
            continue;
        }
        if let Some(code) = std::str::from_utf8(&window[..3])
            .ok()
            .and_then(|s| s.parse::<u16>().ok())
        {
            if (100..=599).contains(&code) {
                return Some(code);
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{FanoutError, PublishErrorKind};
    use crate::types::{MediaAttachment, MediaKind};
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_instance_url_normalization() {
        assert_eq!(normalize_instance_url("mastodon.social"), "https://mastodon.social");
        assert_eq!(
            normalize_instance_url("https://mastodon.social/"),
            "https://mastodon.social"
        );
        assert_eq!(normalize_instance_url("http://localhost:3000"), "http://localhost:3000");
    }

    #[test]
    fn test_status_text_includes_tags_and_media() {
        let content = PostContent {
            text: "New release".to_string(),
            media: vec![MediaAttachment::new(MediaKind::Image, "https://cdn.example/a.png")],
            hashtags: vec!["rust".to_string()],
        };
        assert_eq!(
            status_text(&content),
            "New release\n\n#rust\nhttps://cdn.example/a.png"
        );
    }

    #[test]
    fn test_extract_http_status_with_prefixes() {
        assert_eq!(extract_http_status("HTTP 401 Unauthorized"), Some(401));
        assert_eq!(extract_http_status("request failed with status 429"), Some(429));
        assert_eq!(extract_http_status("error code: 422"), Some(422));
    }

    #[test]
    fn test_extract_http_status_bare_code() {
        assert_eq!(extract_http_status("503: Service Unavailable"), Some(503));
        assert_eq!(extract_http_status("got 502 from upstream"), Some(502));
    }

    #[test]
    fn test_extract_http_status_none() {
        assert_eq!(extract_http_status("connection refused"), None);
        assert_eq!(extract_http_status("HTTP 999 weird"), None);
        assert_eq!(extract_http_status("id 12345 not found"), None);
    }

    #[test]
    fn test_error_mapping_by_status() {
        let kind = |s: &str| map_megalodon_error(s, "post status").kind();
        assert_eq!(kind("HTTP 401 Unauthorized"), PublishErrorKind::Auth);
        assert_eq!(kind("HTTP 403 Forbidden"), PublishErrorKind::Auth);
        assert_eq!(kind("HTTP 422 Unprocessable Entity"), PublishErrorKind::ContentRejected);
        assert_eq!(kind("HTTP 429 Too Many Requests"), PublishErrorKind::RateLimit);
        assert_eq!(kind("HTTP 500 Internal Server Error"), PublishErrorKind::Network);
        assert_eq!(kind("HTTP 404 Not Found"), PublishErrorKind::Unknown);
    }

    #[test]
    fn test_error_mapping_by_keyword() {
        let kind = |s: &str| map_megalodon_error(s, "post status").kind();
        assert_eq!(kind("The access token is invalid"), PublishErrorKind::Auth);
        assert_eq!(kind("too many requests"), PublishErrorKind::RateLimit);
        assert_eq!(kind("failed to parse json"), PublishErrorKind::Unknown);
        assert_eq!(kind("connection reset by peer"), PublishErrorKind::Network);
    }

    #[test]
    fn test_from_config_missing_token_file() {
        let config = MastodonConfig {
            enabled: true,
            instance: "mastodon.social".to_string(),
            token_file: "/nonexistent/path/mastodon.token".to_string(),
        };
        let err = MastodonPublisher::from_config(&config).err().unwrap();
        assert!(matches!(
            err,
            FanoutError::Publish(PublishError::Authentication(_))
        ));
    }

    #[test]
    fn test_from_config_empty_token_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "   ").unwrap();

        let config = MastodonConfig {
            enabled: true,
            instance: "mastodon.social".to_string(),
            token_file: file.path().to_string_lossy().to_string(),
        };
        let err = MastodonPublisher::from_config(&config).err().unwrap();
        assert!(err.to_string().contains("empty"));
    }

    #[test]
    fn test_from_config_valid_token() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "  test-token-123  ").unwrap();

        let config = MastodonConfig {
            enabled: true,
            instance: "mastodon.social".to_string(),
            token_file: file.path().to_string_lossy().to_string(),
        };
        let publisher = MastodonPublisher::from_config(&config).unwrap();
        assert_eq!(publisher.name(), "mastodon");
        assert_eq!(publisher.instance_url(), "https://mastodon.social");
        assert_eq!(publisher.character_limit(), Some(DEFAULT_CHARACTER_LIMIT));
    }

    #[tokio::test]
    async fn test_publish_rejects_overlong_content_without_network() {
        let publisher = MastodonPublisher::new(
            "https://mastodon.invalid".to_string(),
            SecretString::from("token".to_string()),
        )
        .unwrap()
        .with_character_limit(10);

        let content = PostContent {
            text: "This is far too long for the limit".to_string(),
            ..Default::default()
        };
        let err = publisher.publish(&content).await.unwrap_err();
        assert_eq!(err.kind(), PublishErrorKind::ContentRejected);
    }
}
