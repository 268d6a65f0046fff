//! Health evaluation over storage counters.

use chrono::{DateTime, Duration, Utc};

use crate::provider::StorageHealthMetrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
}

/// Warning / critical levels for the three monitored dimensions. A `None`
/// level disables that check.
#[derive(Debug, Clone)]
pub struct HealthThresholds {
    pub queue_depth_warning: Option<u64>,
    pub queue_depth_critical: Option<u64>,
    pub lag_warning: Option<Duration>,
    pub lag_critical: Option<Duration>,
    pub dead_letter_warning: Option<u64>,
    pub dead_letter_critical: Option<u64>,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            queue_depth_warning: Some(1_000),
            queue_depth_critical: Some(10_000),
            lag_warning: Some(Duration::minutes(5)),
            lag_critical: Some(Duration::minutes(30)),
            dead_letter_warning: Some(1),
            dead_letter_critical: Some(100),
        }
    }
}

/// Snapshot with derived figures, as exposed to health endpoints.
#[derive(Debug, Clone)]
pub struct HealthReport {
    pub pending_count: u64,
    pub captured_count: u64,
    pub dead_letter_count: u64,
    pub oldest_pending_at: Option<DateTime<Utc>>,
    pub queue_depth: u64,
    pub lag: Option<Duration>,
    pub status: HealthStatus,
    /// Dimension that tripped the status, when not healthy.
    pub reason: Option<String>,
}

/// Evaluate metrics against thresholds. Critical levels are checked before
/// warning levels so a reading past both reports critical.
pub fn evaluate(
    metrics: &StorageHealthMetrics,
    thresholds: &HealthThresholds,
    now: DateTime<Utc>,
) -> HealthReport {
    let queue_depth = metrics.pending + metrics.captured;
    let lag = metrics.oldest_pending_at.map(|oldest| now - oldest);

    let mut status = HealthStatus::Healthy;
    let mut reason = None;

    let trip = |level: HealthStatus, text: String, status: &mut HealthStatus, reason: &mut Option<String>| {
        if *status == HealthStatus::Healthy || (level == HealthStatus::Critical && *status == HealthStatus::Warning) {
            *status = level;
            *reason = Some(text);
        }
    };

    if let Some(limit) = thresholds.queue_depth_critical {
        if queue_depth >= limit {
            trip(HealthStatus::Critical, format!("queue depth {queue_depth} >= {limit}"), &mut status, &mut reason);
        }
    }
    if let Some(limit) = thresholds.lag_critical {
        if lag.is_some_and(|l| l >= limit) {
            trip(HealthStatus::Critical, format!("lag {:?} >= {:?}", lag.unwrap_or_default(), limit), &mut status, &mut reason);
        }
    }
    if let Some(limit) = thresholds.dead_letter_critical {
        if metrics.dead_letter >= limit {
            trip(HealthStatus::Critical, format!("dead letters {} >= {limit}", metrics.dead_letter), &mut status, &mut reason);
        }
    }
    if let Some(limit) = thresholds.queue_depth_warning {
        if queue_depth >= limit {
            trip(HealthStatus::Warning, format!("queue depth {queue_depth} >= {limit}"), &mut status, &mut reason);
        }
    }
    if let Some(limit) = thresholds.lag_warning {
        if lag.is_some_and(|l| l >= limit) {
            trip(HealthStatus::Warning, format!("lag {:?} >= {:?}", lag.unwrap_or_default(), limit), &mut status, &mut reason);
        }
    }
    if let Some(limit) = thresholds.dead_letter_warning {
        if metrics.dead_letter >= limit {
            trip(HealthStatus::Warning, format!("dead letters {} >= {limit}", metrics.dead_letter), &mut status, &mut reason);
        }
    }

    HealthReport {
        pending_count: metrics.pending,
        captured_count: metrics.captured,
        dead_letter_count: metrics.dead_letter,
        oldest_pending_at: metrics.oldest_pending_at,
        queue_depth,
        lag,
        status,
        reason,
    }
}
