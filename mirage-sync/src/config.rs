//! Engine configuration

use mirage_index::{default_patterns, PlaceholderConfig, RemoteId};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::errors::{Result, SyncError};

/// Tunables shared by the reconcilers, monitors and scheduler
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Delay between the end of one sync cycle and the start of the next
    #[serde(with = "duration_ms")]
    pub sync_interval: Duration,
    /// Bounded wait for the per-item lock token
    #[serde(with = "duration_ms")]
    pub lock_acquire_timeout: Duration,
    /// Bounded wait for an item's exclusive handle
    #[serde(with = "duration_ms")]
    pub handle_timeout: Duration,
    /// Take a transparent lock around content pushes
    pub auto_lock: bool,
    /// Name recorded as lock owner
    pub lock_owner: String,
    /// Avoid-sync name patterns
    pub filter_patterns: Vec<String>,
    /// How long a pending echo is remembered
    #[serde(with = "duration_ms")]
    pub echo_ttl: Duration,
    /// Capacity of each change monitor channel
    pub channel_capacity: usize,
    /// Remote id the sync root maps to
    pub remote_root_id: String,
    /// Remote change feed polling interval
    #[serde(with = "duration_ms")]
    pub remote_poll_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(30),
            lock_acquire_timeout: Duration::from_secs(2),
            handle_timeout: Duration::from_secs(5),
            auto_lock: true,
            lock_owner: "mirage".to_string(),
            filter_patterns: default_patterns(),
            echo_ttl: Duration::from_secs(60),
            channel_capacity: 256,
            remote_root_id: "root".to_string(),
            remote_poll_interval: Duration::from_secs(5),
        }
    }
}

impl SyncConfig {
    pub fn remote_root(&self) -> RemoteId {
        RemoteId::new(self.remote_root_id.clone())
    }

    pub fn placeholder_config(&self) -> PlaceholderConfig {
        PlaceholderConfig {
            handle_timeout: self.handle_timeout,
            ..PlaceholderConfig::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.sync_interval.is_zero() {
            return Err(SyncError::Config("sync_interval must be positive".into()));
        }
        if self.channel_capacity == 0 {
            return Err(SyncError::Config("channel_capacity must be positive".into()));
        }
        if self.remote_root_id.is_empty() {
            return Err(SyncError::Config("remote_root_id is empty".into()));
        }
        Ok(())
    }
}

/// Serialize a `Duration` as whole milliseconds
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = SyncConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.remote_root(), RemoteId::from("root"));
        assert!(config.filter_patterns.iter().any(|p| p == "~$*"));
    }

    #[test]
    fn test_durations_as_millis() {
        let config = SyncConfig {
            sync_interval: Duration::from_millis(1500),
            ..Default::default()
        };
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["sync_interval"], 1500);

        let parsed: SyncConfig =
            serde_json::from_str(r#"{"sync_interval": 250, "auto_lock": false}"#).unwrap();
        assert_eq!(parsed.sync_interval, Duration::from_millis(250));
        assert!(!parsed.auto_lock);
        assert_eq!(parsed.channel_capacity, 256);
    }

    #[test]
    fn test_invalid_config() {
        let config = SyncConfig {
            channel_capacity: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(SyncError::Config(_))));
    }
}
