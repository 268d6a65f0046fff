//! Per-inbox configuration.
//!
//! Options are validated once when the manager is built and are immutable
//! afterwards. Validation failures are configuration errors — they never
//! surface at steady state.

use std::time::Duration;

use crate::error::{InboxError, Result};

pub const MAX_INBOX_NAME_LEN: usize = 128;

/// How captured batches are handed to handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// One message at a time, grouped by message type.
    Default,
    /// Whole per-type slices in one handler call.
    Batched,
    /// Strict per-group ordering, one message at a time.
    Fifo,
    /// Strict per-group ordering, per-group slices in one handler call.
    FifoBatched,
}

impl DeliveryMode {
    pub fn is_fifo(&self) -> bool {
        matches!(self, DeliveryMode::Fifo | DeliveryMode::FifoBatched)
    }
}

#[derive(Debug, Clone)]
pub struct InboxOptions {
    pub delivery_mode: DeliveryMode,
    /// Upper bound on messages captured per poll.
    pub read_batch_size: usize,
    /// Chunk size for provider writes.
    pub write_batch_size: usize,
    /// Capture lock lifetime; a capture older than this is stale.
    pub max_processing_time: Duration,
    /// Sleep after an empty poll.
    pub polling_interval: Duration,
    /// Lower bound on cycle cadence, measured from the previous cycle start.
    pub read_delay: Duration,
    /// Bound on drain and in-flight release at shutdown.
    pub shutdown_timeout: Duration,
    /// Failed attempts before a message is dead-lettered.
    pub max_attempts: i32,
    pub max_processing_threads: usize,
    pub max_write_threads: usize,
    pub enable_deduplication: bool,
    /// How long a deduplication id blocks duplicate writes.
    pub deduplication_interval: Duration,
    pub enable_dead_letter: bool,
    /// Retention for dead-letter rows; zero keeps them forever.
    pub dead_letter_max_message_lifetime: Duration,
    pub enable_lock_extension: bool,
    /// Fraction of `max_processing_time` between lock-extension ticks.
    pub lock_extension_threshold: f64,
}

impl Default for InboxOptions {
    fn default() -> Self {
        Self {
            delivery_mode: DeliveryMode::Default,
            read_batch_size: 100,
            write_batch_size: 100,
            max_processing_time: Duration::from_secs(30),
            polling_interval: Duration::from_secs(5),
            read_delay: Duration::ZERO,
            shutdown_timeout: Duration::from_secs(30),
            max_attempts: 3,
            max_processing_threads: 1,
            max_write_threads: 1,
            enable_deduplication: false,
            deduplication_interval: Duration::from_secs(600),
            enable_dead_letter: true,
            dead_letter_max_message_lifetime: Duration::from_secs(7 * 24 * 3600),
            enable_lock_extension: false,
            lock_extension_threshold: 0.5,
        }
    }
}

impl InboxOptions {
    pub fn validate(&self) -> Result<()> {
        if self.read_batch_size == 0 {
            return Err(InboxError::Config("read_batch_size must be > 0".into()));
        }
        if self.write_batch_size == 0 {
            return Err(InboxError::Config("write_batch_size must be > 0".into()));
        }
        if self.max_processing_time.is_zero() {
            return Err(InboxError::Config("max_processing_time must be > 0".into()));
        }
        if self.polling_interval.is_zero() {
            return Err(InboxError::Config("polling_interval must be > 0".into()));
        }
        if self.shutdown_timeout.is_zero() {
            return Err(InboxError::Config("shutdown_timeout must be > 0".into()));
        }
        if self.max_attempts <= 0 {
            return Err(InboxError::Config("max_attempts must be > 0".into()));
        }
        if self.max_processing_threads == 0 {
            return Err(InboxError::Config("max_processing_threads must be > 0".into()));
        }
        if self.max_write_threads == 0 {
            return Err(InboxError::Config("max_write_threads must be > 0".into()));
        }
        if self.enable_lock_extension
            && !(0.1..=0.9).contains(&self.lock_extension_threshold)
        {
            return Err(InboxError::Config(
                "lock_extension_threshold must be within [0.1, 0.9]".into(),
            ));
        }
        Ok(())
    }

    /// Interval between lock-extension ticks.
    pub fn lock_extension_interval(&self) -> Duration {
        self.max_processing_time.mul_f64(self.lock_extension_threshold)
    }

    /// Bound on one handler invocation. With lock extension enabled there
    /// is no per-invocation bound: the extension timer keeps the capture
    /// lease fresh for as long as the handler runs, and a dead worker's
    /// messages still recover via staleness.
    pub fn handler_timeout(&self) -> Option<Duration> {
        if self.enable_lock_extension {
            None
        } else {
            Some(self.max_processing_time)
        }
    }

    pub fn max_processing_time_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.max_processing_time)
            .unwrap_or_else(|_| chrono::Duration::max_value())
    }

    pub fn deduplication_interval_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.deduplication_interval)
            .unwrap_or_else(|_| chrono::Duration::max_value())
    }
}

/// Inbox names travel into table names and key prefixes, so the alphabet is
/// restricted up front: alphanumeric plus `_-`, at most 128 chars.
pub fn validate_inbox_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(InboxError::Config("inbox name must not be empty".into()));
    }
    if name.len() > MAX_INBOX_NAME_LEN {
        return Err(InboxError::Config(format!(
            "inbox name '{name}' exceeds {MAX_INBOX_NAME_LEN} characters"
        )));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-'))
    {
        return Err(InboxError::Config(format!(
            "inbox name '{name}' contains invalid character '{bad}'"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        InboxOptions::default().validate().unwrap();
    }

    #[test]
    fn zero_batch_rejected() {
        let opts = InboxOptions {
            read_batch_size: 0,
            ..Default::default()
        };
        assert!(opts.validate().is_err());
    }

    #[test]
    fn lock_extension_threshold_checked_only_when_enabled() {
        let mut opts = InboxOptions {
            lock_extension_threshold: 0.95,
            ..Default::default()
        };
        opts.validate().unwrap();

        opts.enable_lock_extension = true;
        assert!(opts.validate().is_err());

        opts.lock_extension_threshold = 0.9;
        opts.validate().unwrap();
    }

    #[test]
    fn extension_interval_scales_with_threshold() {
        let opts = InboxOptions {
            max_processing_time: Duration::from_secs(30),
            lock_extension_threshold: 0.5,
            ..Default::default()
        };
        assert_eq!(opts.lock_extension_interval(), Duration::from_secs(15));
    }

    #[test]
    fn inbox_name_rules() {
        validate_inbox_name("orders").unwrap();
        validate_inbox_name("orders_v2-eu").unwrap();
        assert!(validate_inbox_name("").is_err());
        assert!(validate_inbox_name("orders.eu").is_err());
        assert!(validate_inbox_name(&"x".repeat(129)).is_err());
    }
}
