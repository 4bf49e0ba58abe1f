//! Liveness heartbeat file.
//!
//! On each completed sync cycle the scheduler writes the current epoch
//! seconds to a well-known file. External monitoring treats a stale file
//! as a stuck process; the relay itself never reads it back.

use crate::error::{RelayError, Result};
use crate::metrics;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Writes liveness timestamps to a well-known file.
pub struct Heartbeat {
    enabled: bool,
    path: PathBuf,
}

impl Heartbeat {
    pub fn new(config: &crate::config::HeartbeatConfig) -> Self {
        Self {
            enabled: config.enabled,
            path: PathBuf::from(&config.path),
        }
    }

    /// A heartbeat that writes nothing (tests, embedded use).
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            path: PathBuf::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Write the current epoch seconds. No-op when disabled.
    ///
    /// A write failure is reported but should not fail the cycle that
    /// triggered it; the caller logs and moves on.
    pub async fn beat(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        match tokio::fs::write(&self.path, now.to_string()).await {
            Ok(()) => {
                debug!(path = %self.path.display(), epoch = now, "Heartbeat written");
                metrics::record_heartbeat(true);
                Ok(())
            }
            Err(e) => {
                metrics::record_heartbeat(false);
                Err(RelayError::Internal(format!(
                    "heartbeat write to {} failed: {}",
                    self.path.display(),
                    e
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HeartbeatConfig;

    #[tokio::test]
    async fn test_beat_writes_epoch_seconds() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("heartbeat.txt");
        let heartbeat = Heartbeat::new(&HeartbeatConfig {
            enabled: true,
            path: path.to_string_lossy().to_string(),
        });

        heartbeat.beat().await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let epoch: u64 = contents.parse().unwrap();
        assert!(epoch > 1_577_836_800); // Jan 1, 2020
    }

    #[tokio::test]
    async fn test_beat_overwrites_previous() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("heartbeat.txt");
        std::fs::write(&path, "stale").unwrap();

        let heartbeat = Heartbeat::new(&HeartbeatConfig {
            enabled: true,
            path: path.to_string_lossy().to_string(),
        });
        heartbeat.beat().await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.parse::<u64>().is_ok());
    }

    #[tokio::test]
    async fn test_disabled_heartbeat_writes_nothing() {
        let heartbeat = Heartbeat::disabled();
        assert!(!heartbeat.is_enabled());
        heartbeat.beat().await.unwrap();
    }

    #[tokio::test]
    async fn test_beat_unwritable_path_errors() {
        let heartbeat = Heartbeat::new(&HeartbeatConfig {
            enabled: true,
            path: "/nonexistent-dir/heartbeat.txt".to_string(),
        });
        let err = heartbeat.beat().await.unwrap_err();
        assert!(matches!(err, RelayError::Internal(_)));
    }
}
