//! Startup configuration for both jobs.
//!
//! Values are read once through a lookup function (the process env in the
//! binaries, a map in tests) and every missing required key is reported in a
//! single [`ConfigError::Missing`].
use std::time::Duration;

use thiserror::Error;
use tracing::info;

use crate::util::env::{env_opt, redact_value};

pub const DEFAULT_LOOKBACK_DAYS: i64 = 10;
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;
/// Upper bound for `BANDIT_LOOKBACK_DAYS` (about ten years).
pub const MAX_LOOKBACK_DAYS: i64 = 3650;
pub const DEFAULT_IMPRESSION_PROPERTY: &str = "game_id";
pub const DEFAULT_CLICK_PROPERTY: &str = "game";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing environment variables: {}", .0.join(", "))]
    Missing(Vec<&'static str>),
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

/// Configuration of the review seeder.
#[derive(Debug, Clone)]
pub struct SeedConfig {
    pub database_url: String,
}

impl SeedConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_opt)
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut reader = Reader::new(lookup);
        let database_url = reader.required("DATABASE_URL");
        reader.finish()?;
        Ok(Self {
            database_url: database_url.unwrap_or_default(),
        })
    }
}

/// Umami connection settings.
#[derive(Debug, Clone)]
pub struct UmamiConfig {
    pub base_url: String,
    pub username: String,
    pub password: String,
    pub website_id: String,
    pub timeout: Duration,
}

/// Configuration of the bandit-stats syncer.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub umami: UmamiConfig,
    /// Event-data property carrying the game slug on `hero_impression`.
    pub impression_property: String,
    /// Event-data property carrying the game slug on `hero_click`.
    pub click_property: String,
    pub lookback_days: i64,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_opt)
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut reader = Reader::new(lookup);
        let base_url = reader.required("UMAMI_URL");
        let username = reader.required("UMAMI_USERNAME");
        let password = reader.required("UMAMI_PASSWORD");
        let website_id = reader.required("UMAMI_WEBSITE_ID");
        let database_url = reader.required("DATABASE_URL");
        reader.finish()?;

        let lookback_days = reader.parsed("BANDIT_LOOKBACK_DAYS", DEFAULT_LOOKBACK_DAYS)?;
        if !(1..=MAX_LOOKBACK_DAYS).contains(&lookback_days) {
            return Err(ConfigError::Invalid {
                key: "BANDIT_LOOKBACK_DAYS",
                value: lookback_days.to_string(),
            });
        }
        let timeout_secs = reader.parsed("HTTP_TIMEOUT_SECS", DEFAULT_HTTP_TIMEOUT_SECS)?;
        if timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "HTTP_TIMEOUT_SECS",
                value: timeout_secs.to_string(),
            });
        }

        Ok(Self {
            database_url: database_url.unwrap_or_default(),
            umami: UmamiConfig {
                base_url: base_url
                    .unwrap_or_default()
                    .trim_end_matches('/')
                    .to_string(),
                username: username.unwrap_or_default(),
                password: password.unwrap_or_default(),
                website_id: website_id.unwrap_or_default(),
                timeout: Duration::from_secs(timeout_secs),
            },
            impression_property: reader
                .optional("UMAMI_IMPRESSION_PROPERTY")
                .unwrap_or_else(|| DEFAULT_IMPRESSION_PROPERTY.to_string()),
            click_property: reader
                .optional("UMAMI_CLICK_PROPERTY")
                .unwrap_or_else(|| DEFAULT_CLICK_PROPERTY.to_string()),
            lookback_days,
        })
    }

    /// Log a redacted snapshot of the resolved settings.
    pub fn log_snapshot(&self) {
        info!(
            target: "preflight",
            umami_url = %self.umami.base_url,
            website_id = %self.umami.website_id,
            username = %self.umami.username,
            password = %redact_value("UMAMI_PASSWORD", &self.umami.password),
            database_url = %redact_value("DATABASE_URL", &self.database_url),
            lookback_days = self.lookback_days,
            "configuration snapshot"
        );
    }
}

struct Reader<F> {
    lookup: F,
    missing: Vec<&'static str>,
}

impl<F> Reader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn new(lookup: F) -> Self {
        Self {
            lookup,
            missing: Vec::new(),
        }
    }

    fn optional(&self, key: &str) -> Option<String> {
        (self.lookup)(key).filter(|v| !v.trim().is_empty())
    }

    fn required(&mut self, key: &'static str) -> Option<String> {
        let value = self.optional(key);
        if value.is_none() {
            self.missing.push(key);
        }
        value
    }

    fn parsed<T>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: std::str::FromStr,
    {
        match self.optional(key) {
            None => Ok(default),
            Some(raw) => raw
                .trim()
                .parse::<T>()
                .map_err(|_| ConfigError::Invalid { key, value: raw }),
        }
    }

    fn finish(&mut self) -> Result<(), ConfigError> {
        if self.missing.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Missing(std::mem::take(&mut self.missing)))
        }
    }
}
