//! Configuration management for fanout
//!
//! The configuration file is TOML. Only `[database]` is required; every other
//! section falls back to its defaults. Durations are written the humantime
//! way ("30s", "5m", "24h").

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::dispatcher::DispatcherConfig;
use crate::error::{ConfigError, Result};
use crate::retry::RetryPolicy;
use crate::types::MAX_RETRIES_CEILING;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    pub mastodon: Option<MastodonConfig>,
    pub nostr: Option<NostrConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MastodonConfig {
    pub enabled: bool,
    pub instance: String,
    pub token_file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NostrConfig {
    pub enabled: bool,
    pub keys_file: String,
    pub relays: Vec<String>,
}

impl Config {
    /// Load from `FANOUT_CONFIG` or the XDG config location, then apply
    /// `FANOUT_DB_PATH`
    pub fn load() -> Result<Self> {
        let config_path = resolve_config_path()?;
        Self::load_from_path(&config_path)
    }

    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        let mut config = Self::parse(&content)?;

        if let Ok(db_path) = std::env::var("FANOUT_DB_PATH") {
            if !db_path.trim().is_empty() {
                config.database.path = db_path;
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Parse TOML without environment overrides or validation
    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).map_err(ConfigError::ParseError)?;
        Ok(config)
    }

    pub fn default_config() -> Self {
        Self {
            database: DatabaseConfig {
                path: "~/.local/share/fanout/queue.db".to_string(),
            },
            dispatcher: DispatcherConfig::default(),
            retry: RetryPolicy::default(),
            mastodon: Some(MastodonConfig {
                enabled: false,
                instance: "mastodon.social".to_string(),
                token_file: "~/.config/fanout/mastodon.token".to_string(),
            }),
            nostr: Some(NostrConfig {
                enabled: false,
                keys_file: "~/.config/fanout/nostr.keys".to_string(),
                relays: vec![
                    "wss://relay.damus.io".to_string(),
                    "wss://nos.lol".to_string(),
                ],
            }),
        }
    }

    /// Reject settings the dispatcher cannot run with
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| -> Result<()> { Err(ConfigError::InvalidValue(msg).into()) };

        if self.database.path.trim().is_empty() {
            return Err(ConfigError::MissingField("database.path".to_string()).into());
        }

        let dispatcher = &self.dispatcher;
        if dispatcher.poll_interval.is_zero() {
            return invalid("dispatcher.poll_interval must be greater than zero".to_string());
        }
        if dispatcher.batch_size == 0 {
            return invalid("dispatcher.batch_size must be greater than zero".to_string());
        }
        if dispatcher.publish_timeout.is_zero() {
            return invalid("dispatcher.publish_timeout must be greater than zero".to_string());
        }
        if dispatcher.concurrency == 0 {
            return invalid("dispatcher.concurrency must be greater than zero".to_string());
        }

        let retry = &self.retry;
        if retry.max_retries > MAX_RETRIES_CEILING {
            return invalid(format!(
                "retry.max_retries must be at most {} (got {})",
                MAX_RETRIES_CEILING, retry.max_retries
            ));
        }
        if retry.backoff_multiplier.is_nan() || retry.backoff_multiplier < 1.0 {
            return invalid(format!(
                "retry.backoff_multiplier must be at least 1.0 (got {})",
                retry.backoff_multiplier
            ));
        }
        if retry.max_delay < retry.base_delay {
            return invalid("retry.max_delay must not be shorter than retry.base_delay".to_string());
        }

        Ok(())
    }
}

/// Resolve the configuration file path following the XDG Base Directory spec
pub fn resolve_config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("FANOUT_CONFIG") {
        return Ok(PathBuf::from(shellexpand::tilde(&path).to_string()));
    }

    let config_dir = dirs::config_dir()
        .ok_or_else(|| ConfigError::MissingField("config directory".to_string()))?;

    Ok(config_dir.join("fanout").join("config.toml"))
}

/// Serde adapter for `std::time::Duration` as a humantime string
pub mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FanoutError;
    use serial_test::serial;
    use std::io::Write;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    const MINIMAL: &str = r#"
[database]
path = "/tmp/fanout-test.db"
"#;

    const FULL: &str = r#"
[database]
path = "~/queue.db"

[dispatcher]
poll_interval = "15s"
batch_size = 10
publish_timeout = "5s"
stale_after = "2m"
concurrency = 2

[retry]
max_retries = 5
base_delay = "1m"
backoff_multiplier = 3.0
max_delay = "6h"

[mastodon]
enabled = true
instance = "fosstodon.org"
token_file = "~/.config/fanout/mastodon.token"

[nostr]
enabled = false
keys_file = "~/.config/fanout/nostr.keys"
relays = ["wss://relay.damus.io"]
"#;

    fn write_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = Config::parse(MINIMAL).unwrap();
        assert_eq!(config.dispatcher.poll_interval, Duration::from_secs(60));
        assert_eq!(config.dispatcher.batch_size, 50);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.retry.base_delay, Duration::from_secs(300));
        assert!(config.mastodon.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_full_config() {
        let config = Config::parse(FULL).unwrap();
        assert_eq!(config.dispatcher.poll_interval, Duration::from_secs(15));
        assert_eq!(config.dispatcher.stale_after, Duration::from_secs(120));
        assert_eq!(config.dispatcher.concurrency, 2);
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.max_delay, Duration::from_secs(6 * 3600));
        assert_eq!(config.mastodon.as_ref().unwrap().instance, "fosstodon.org");
        assert!(!config.nostr.as_ref().unwrap().enabled);
    }

    #[test]
    fn test_bad_duration_is_parse_error() {
        let err = Config::parse(
            r#"
[database]
path = "x.db"

[dispatcher]
poll_interval = "soon"
"#,
        )
        .unwrap_err();
        assert!(matches!(err, FanoutError::Config(ConfigError::ParseError(_))));
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default_config();
        config.retry.max_retries = 11;
        assert!(config.validate().is_err());

        let mut config = Config::default_config();
        config.retry.backoff_multiplier = 0.5;
        assert!(config.validate().is_err());

        let mut config = Config::default_config();
        config.retry.max_delay = Duration::from_secs(1);
        assert!(config.validate().is_err());

        let mut config = Config::default_config();
        config.dispatcher.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default_config();
        config.dispatcher.poll_interval = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = Config::default_config();
        config.database.path = " ".to_string();
        assert!(matches!(
            config.validate().unwrap_err(),
            FanoutError::Config(ConfigError::MissingField(_))
        ));
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default_config().validate().is_ok());
    }

    #[test]
    fn test_default_config_round_trips_through_toml() {
        let rendered = toml::to_string(&Config::default_config()).unwrap();
        let parsed = Config::parse(&rendered).unwrap();
        assert_eq!(parsed.retry, RetryPolicy::default());
        assert_eq!(parsed.dispatcher.publish_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load_from_path(Path::new("/nonexistent/fanout.toml")).unwrap_err();
        assert!(matches!(err, FanoutError::Config(ConfigError::ReadError(_))));
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        let file = write_config(MINIMAL);
        std::env::set_var("FANOUT_CONFIG", file.path());
        std::env::set_var("FANOUT_DB_PATH", "/tmp/override.db");

        let config = Config::load().unwrap();
        assert_eq!(config.database.path, "/tmp/override.db");

        std::env::remove_var("FANOUT_CONFIG");
        std::env::remove_var("FANOUT_DB_PATH");
    }

    #[test]
    #[serial]
    fn test_resolve_config_path_default() {
        std::env::remove_var("FANOUT_CONFIG");
        if let Ok(path) = resolve_config_path() {
            assert!(path.ends_with("fanout/config.toml"));
        }
    }
}
