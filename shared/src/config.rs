use std::time::Duration;

use thiserror::Error;

/// Cap on reconnection attempts after a channel loss. `Limit(0)` disables
/// reconnection entirely.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconnectLimit {
    Unlimited,
    Limit(u32),
}

impl ReconnectLimit {
    /// Whether another attempt is allowed after `attempts_made` failures.
    pub fn allows(&self, attempts_made: u32) -> bool {
        match self {
            ReconnectLimit::Unlimited => true,
            ReconnectLimit::Limit(max) => attempts_made < *max,
        }
    }

    pub fn is_disabled(&self) -> bool {
        matches!(self, ReconnectLimit::Limit(0))
    }
}

/// Errors that can occur validating a watchlist configuration
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Reconnect delays must form an ordered window
    #[error("Reconnect delay window is inverted: minimum {min_ms}ms exceeds maximum {max_ms}ms")]
    InvertedBackoffWindow { min_ms: u64, max_ms: u64 },

    /// Backoff needs a nonzero starting delay when reconnection is enabled
    #[error("Reconnect minimum delay must be greater than zero when reconnection is enabled")]
    ZeroBackoffDelay,

    /// Stream recovery and reconnection settings contradict each other
    #[error("Stream recovery is disabled (single_open = false) but a nonzero reconnect limit is configured. Set reconnect_attempt_limit to Limit(0) or enable single_open")]
    RecoveryConflict,
}

/// Contains Config properties which will be used by the Watchlist
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchlistConfig {
    /// How many reconnection attempts may follow a channel loss.
    pub reconnect_attempt_limit: ReconnectLimit,
    /// Delay before the first reconnection attempt; doubles per failure.
    pub reconnect_min_delay: Duration,
    /// Ceiling the doubling backoff delay is clamped to.
    pub reconnect_max_delay: Duration,
    /// How long a sent request may go unanswered before a timeout status is
    /// synthesized. Zero disables the timeout.
    pub request_timeout: Duration,
    /// How long a post may go unacknowledged before a negative
    /// acknowledgment is synthesized. Zero disables the timeout.
    pub post_ack_timeout: Duration,
    /// How many out-of-order messages a stream buffers while waiting for a
    /// sequence gap to close before it is re-requested.
    pub gap_recovery_buffer_size: usize,
    /// Whether the watchlist itself recovers streams across disconnects and
    /// service churn.
    pub single_open: bool,
    /// Whether suspect data keeps a stream open; when false, suspect
    /// refreshes and statuses close the stream.
    pub allow_suspect_data: bool,
}

impl Default for WatchlistConfig {
    fn default() -> Self {
        Self {
            reconnect_attempt_limit: ReconnectLimit::Unlimited,
            reconnect_min_delay: Duration::from_millis(500),
            reconnect_max_delay: Duration::from_millis(3000),
            request_timeout: Duration::from_secs(15),
            post_ack_timeout: Duration::from_secs(15),
            gap_recovery_buffer_size: 10,
            single_open: true,
            allow_suspect_data: true,
        }
    }
}

impl WatchlistConfig {
    /// Checks the configuration for contradictions. Called once before any
    /// channel activity; no option is re-validated later.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.single_open && !self.reconnect_attempt_limit.is_disabled() {
            return Err(ConfigError::RecoveryConflict);
        }
        if !self.reconnect_attempt_limit.is_disabled() {
            if self.reconnect_min_delay.is_zero() {
                return Err(ConfigError::ZeroBackoffDelay);
            }
            if self.reconnect_min_delay > self.reconnect_max_delay {
                return Err(ConfigError::InvertedBackoffWindow {
                    min_ms: self.reconnect_min_delay.as_millis() as u64,
                    max_ms: self.reconnect_max_delay.as_millis() as u64,
                });
            }
        }
        Ok(())
    }
}
