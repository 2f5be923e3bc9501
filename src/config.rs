//! Configuration for a resource instance worker.
//!
//! All fields have sensible defaults. Use struct update syntax to
//! override specific settings:
//!
//! ```rust
//! use estuary::Config;
//!
//! let config = Config {
//!     batch_soft_limit: 500,
//!     ..Default::default()
//! };
//! ```

use std::time::Duration;

use crate::error::{Error, Result};

/// Tunables for one resource instance.
///
/// Instance identity and paths live in
/// [`ResourceContext`](crate::context::ResourceContext); this struct only
/// carries behavior knobs.
#[derive(Clone, Debug)]
pub struct Config {
    /// Soft cap on commands folded into one pipeline transaction.
    ///
    /// When reached, the batch commits even if more commands are queued.
    pub batch_soft_limit: usize,

    /// Maximum time a pipeline transaction stays open waiting for more
    /// back-to-back commands before committing.
    pub batch_max_latency: Duration,

    /// Number of processing attempts before a queued command is moved to
    /// the dead-letter area.
    pub queue_retry_cap: u32,

    /// Initial backoff after a transient source failure during replay.
    pub replay_backoff_base: Duration,

    /// Upper bound for the exponential replay backoff.
    pub replay_backoff_max: Duration,

    /// How long the worker lingers after the last client disconnects
    /// before shutting down. `None` disables idle shutdown.
    pub idle_timeout: Option<Duration>,

    /// Largest accepted wire frame (header + payload).
    pub max_frame_size: usize,

    /// Capacity of each notification subscriber channel. When a slow
    /// subscriber falls behind, the oldest notification is dropped with
    /// a warning.
    pub notification_buffer: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            batch_soft_limit: 100,
            batch_max_latency: Duration::from_millis(100),
            queue_retry_cap: 5,
            replay_backoff_base: Duration::from_secs(1),
            replay_backoff_max: Duration::from_secs(60),
            idle_timeout: Some(Duration::from_secs(60)),
            max_frame_size: 16 * 1024 * 1024,
            notification_buffer: 256,
        }
    }
}

impl Config {
    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if any bound is degenerate.
    pub fn validate(&self) -> Result<()> {
        if self.batch_soft_limit == 0 {
            return Err(Error::config("batch_soft_limit must be at least 1"));
        }
        if self.queue_retry_cap == 0 {
            return Err(Error::config("queue_retry_cap must be at least 1"));
        }
        if self.replay_backoff_base > self.replay_backoff_max {
            return Err(Error::config(
                "replay_backoff_base must not exceed replay_backoff_max",
            ));
        }
        if self.max_frame_size < 12 {
            return Err(Error::config(
                "max_frame_size must cover at least the frame header",
            ));
        }
        if self.notification_buffer == 0 {
            return Err(Error::config("notification_buffer must be at least 1"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_zero_batch_limit_rejected() {
        let config = Config {
            batch_soft_limit: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_inverted_backoff_rejected() {
        let config = Config {
            replay_backoff_base: Duration::from_secs(120),
            replay_backoff_max: Duration::from_secs(60),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_tiny_frame_size_rejected() {
        let config = Config {
            max_frame_size: 4,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
