//! Control plane configuration and builder.

use std::path::PathBuf;
use std::time::Duration;
use tablegate_core::{ControlError, Result};

const DAY: Duration = Duration::from_secs(86_400);

/// Configuration for a [`ControlPlane`](crate::ControlPlane).
#[derive(Debug, Clone, PartialEq)]
pub struct ControlConfig {
    /// SQLite file backing the store (default: `tablegate.db`)
    pub db_path: PathBuf,
    /// Current workspace, resolved once at startup
    pub workspace_id: Option<i64>,
    /// How long before expiry a member may renew (default: 7 days)
    pub renewal_window: Duration,
    /// Capacity of the search-index queue (default: 1024)
    pub index_queue_capacity: usize,
    /// Attempts per index write before giving up (default: 3)
    pub index_max_retries: u32,
    /// Initial retry delay for exponential backoff (default: 100ms)
    pub index_retry_initial_delay: Duration,
    /// Maximum retry delay (default: 10 seconds)
    pub index_retry_max_delay: Duration,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("tablegate.db"),
            workspace_id: None,
            renewal_window: 7 * DAY,
            index_queue_capacity: 1024,
            index_max_retries: 3,
            index_retry_initial_delay: Duration::from_millis(100),
            index_retry_max_delay: Duration::from_secs(10),
        }
    }
}

impl ControlConfig {
    pub const ENV_DB_PATH: &'static str = "TABLEGATE_DB_PATH";
    pub const ENV_WORKSPACE_ID: &'static str = "TABLEGATE_WORKSPACE_ID";
    pub const ENV_RENEWAL_WINDOW_DAYS: &'static str = "TABLEGATE_RENEWAL_WINDOW_DAYS";

    /// Longest renewal window accepted.
    pub const MAX_RENEWAL_WINDOW: Duration = Duration::from_secs(90 * 86_400);

    pub fn builder() -> ControlConfigBuilder {
        ControlConfigBuilder::new()
    }

    /// Load from `TABLEGATE_*` environment variables over the defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using `lookup` in place of the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(path) = lookup(Self::ENV_DB_PATH) {
            config.db_path = PathBuf::from(path);
        }
        if let Some(raw) = lookup(Self::ENV_WORKSPACE_ID) {
            let id = raw.trim().parse::<i64>().map_err(|e| {
                ControlError::Config(format!("Invalid {}: {}", Self::ENV_WORKSPACE_ID, e))
            })?;
            config.workspace_id = Some(id);
        }
        if let Some(raw) = lookup(Self::ENV_RENEWAL_WINDOW_DAYS) {
            let days = raw.trim().parse::<u32>().map_err(|e| {
                ControlError::Config(format!("Invalid {}: {}", Self::ENV_RENEWAL_WINDOW_DAYS, e))
            })?;
            config.renewal_window = DAY * days;
        }

        config.validate()?;
        Ok(config)
    }

    /// Renewal window in seconds, as the state machines take it.
    pub fn renewal_window_secs(&self) -> i64 {
        i64::try_from(self.renewal_window.as_secs()).unwrap_or(i64::MAX)
    }

    pub fn validate(&self) -> Result<()> {
        if self.db_path.as_os_str().is_empty() {
            return Err(ControlError::Config("db_path cannot be empty".to_string()));
        }

        if self.workspace_id.is_some_and(|id| id <= 0) {
            return Err(ControlError::Config(
                "workspace_id must be positive".to_string(),
            ));
        }

        if self.renewal_window.is_zero() || self.renewal_window > Self::MAX_RENEWAL_WINDOW {
            return Err(ControlError::Config(format!(
                "renewal_window ({:?}) must be between 1s and {:?}",
                self.renewal_window,
                Self::MAX_RENEWAL_WINDOW
            )));
        }

        if self.index_queue_capacity == 0 {
            return Err(ControlError::Config(
                "index_queue_capacity must be > 0".to_string(),
            ));
        }

        if self.index_max_retries == 0 {
            return Err(ControlError::Config(
                "index_max_retries must be >= 1".to_string(),
            ));
        }

        if self.index_retry_initial_delay > self.index_retry_max_delay {
            return Err(ControlError::Config(format!(
                "index_retry_initial_delay ({:?}) must be <= index_retry_max_delay ({:?})",
                self.index_retry_initial_delay, self.index_retry_max_delay
            )));
        }

        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct ControlConfigBuilder {
    config: ControlConfig,
}

impl ControlConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.db_path = path.into();
        self
    }

    pub fn workspace_id(mut self, id: i64) -> Self {
        self.config.workspace_id = Some(id);
        self
    }

    pub fn renewal_window(mut self, window: Duration) -> Self {
        self.config.renewal_window = window;
        self
    }

    pub fn index_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.index_queue_capacity = capacity;
        self
    }

    pub fn index_max_retries(mut self, retries: u32) -> Self {
        self.config.index_max_retries = retries;
        self
    }

    pub fn index_retry_initial_delay(mut self, delay: Duration) -> Self {
        self.config.index_retry_initial_delay = delay;
        self
    }

    pub fn index_retry_max_delay(mut self, delay: Duration) -> Self {
        self.config.index_retry_max_delay = delay;
        self
    }

    /// Build the configuration, validating all settings.
    pub fn build(self) -> Result<ControlConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        let config = ControlConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.renewal_window_secs(), 7 * 86_400);
        assert_eq!(config.index_max_retries, 3);
    }

    #[test]
    fn test_builder_validates() {
        assert!(ControlConfig::builder()
            .index_retry_initial_delay(Duration::from_secs(20))
            .build()
            .is_err());
        assert!(ControlConfig::builder().index_queue_capacity(0).build().is_err());
        assert!(ControlConfig::builder()
            .renewal_window(Duration::ZERO)
            .build()
            .is_err());

        let config = ControlConfig::builder()
            .db_path("/tmp/gate.db")
            .workspace_id(3)
            .build()
            .unwrap();
        assert_eq!(config.workspace_id, Some(3));
    }

    #[test]
    fn test_from_lookup() {
        let env: HashMap<&str, &str> = [
            ("TABLEGATE_DB_PATH", "/var/lib/tablegate/gate.db"),
            ("TABLEGATE_WORKSPACE_ID", "12"),
            ("TABLEGATE_RENEWAL_WINDOW_DAYS", "14"),
        ]
        .into_iter()
        .collect();

        let config = ControlConfig::from_lookup(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.db_path, PathBuf::from("/var/lib/tablegate/gate.db"));
        assert_eq!(config.workspace_id, Some(12));
        assert_eq!(config.renewal_window_secs(), 14 * 86_400);
    }

    #[test]
    fn test_from_lookup_rejects_garbage() {
        let err = ControlConfig::from_lookup(|k| {
            (k == "TABLEGATE_WORKSPACE_ID").then(|| "abc".to_string())
        })
        .unwrap_err();
        assert!(matches!(err, ControlError::Config(_)));
    }
}
