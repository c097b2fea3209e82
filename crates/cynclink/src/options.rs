//! The single options record recognized by the core, with the timeouts
//! derived from the measured p99 ACK latency.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OptionsError {
    #[error("failed to read options file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse options TOML: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("options validation failed: {0}")]
    Validation(String),
}

/// Transport tuning knobs. Every timeout the core uses derives from
/// `measured_p99_ms`; the remaining fields bound retries, deduplication and
/// liveness.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransportOptions {
    /// Measured p99 ACK latency in milliseconds.
    pub measured_p99_ms: f64,
    /// Retries after the initial attempt of an acknowledged send.
    pub max_retries: u16,
    /// Backoff base in milliseconds; `None` means the derived ack timeout.
    pub backoff_base_ms: Option<u64>,
    pub backoff_cap_ms: u64,
    pub backoff_jitter_fraction: f64,
    pub dedup_max_entries: usize,
    pub dedup_ttl_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Floor of the derived heartbeat timeout.
    pub heartbeat_timeout_floor_ms: u64,
    /// Poll timeout of the router's bounded reads.
    pub read_poll_ms: u64,
    /// Read buffer handed to the link per poll.
    pub recv_buffer_len: usize,
    /// Fixed msg_id seed; `None` draws a random one per connection.
    pub initial_msg_id: Option<u16>,
    /// Unused by the core; wired through for embedding in a proxy.
    pub cloud_forward: bool,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            measured_p99_ms: 51.0,
            max_retries: 3,
            backoff_base_ms: None,
            backoff_cap_ms: 2_000,
            backoff_jitter_fraction: 0.1,
            dedup_max_entries: 1_000,
            dedup_ttl_ms: 300_000,
            heartbeat_interval_ms: 60_000,
            heartbeat_timeout_floor_ms: 10_000,
            read_poll_ms: 250,
            recv_buffer_len: 4_096,
            initial_msg_id: None,
            cloud_forward: false,
        }
    }
}

impl TransportOptions {
    /// `2.5 × p99`, rounded up to a whole millisecond (51 ms → 128 ms).
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis((self.measured_p99_ms * 2.5).ceil() as u64)
    }

    /// `2.5 × ack_timeout`.
    pub fn handshake_timeout(&self) -> Duration {
        self.ack_timeout() * 5 / 2
    }

    /// `max(3 × ack_timeout, floor)`.
    pub fn heartbeat_timeout(&self) -> Duration {
        let derived = self.ack_timeout() * 3;
        derived.max(Duration::from_millis(self.heartbeat_timeout_floor_ms))
    }

    /// `clamp(ack_timeout / 3, 10 s, 60 s)`.
    pub fn cleanup_interval(&self) -> Duration {
        let derived = self.ack_timeout() / 3;
        derived.clamp(Duration::from_secs(10), Duration::from_secs(60))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn dedup_ttl(&self) -> Duration {
        Duration::from_millis(self.dedup_ttl_ms)
    }

    pub fn backoff_base(&self) -> Duration {
        match self.backoff_base_ms {
            Some(ms) => Duration::from_millis(ms),
            None => self.ack_timeout(),
        }
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.backoff_cap_ms)
    }

    pub fn read_poll(&self) -> Duration {
        Duration::from_millis(self.read_poll_ms)
    }

    pub fn validate(&self) -> Result<(), OptionsError> {
        if self.measured_p99_ms <= 0.0 {
            return Err(OptionsError::Validation(format!(
                "measured_p99_ms must be positive, got {}",
                self.measured_p99_ms
            )));
        }
        if !(0.0..1.0).contains(&self.backoff_jitter_fraction) {
            return Err(OptionsError::Validation(format!(
                "backoff_jitter_fraction must be in [0, 1), got {}",
                self.backoff_jitter_fraction
            )));
        }
        if self.dedup_max_entries == 0 {
            return Err(OptionsError::Validation(
                "dedup_max_entries must be greater than 0".to_string(),
            ));
        }
        if self.recv_buffer_len == 0 {
            return Err(OptionsError::Validation(
                "recv_buffer_len must be greater than 0".to_string(),
            ));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(OptionsError::Validation(
                "heartbeat_interval_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn from_toml_str(content: &str) -> Result<Self, OptionsError> {
        let opts: Self = toml::from_str(content)?;
        opts.validate()?;
        Ok(opts)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, OptionsError> {
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }
}
