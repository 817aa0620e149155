//! Running write statistics for one writer.
//!
//! The counter is owned by the writer task and only mutated there. Anything
//! else reads immutable [`StatsSnapshot`]/[`StatsReport`] values, either from
//! the writer directly or through the report channel it publishes on.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Mutable totals, owned by a single writer.
#[derive(Debug, Default, Clone)]
pub struct StatsCounter {
    total_attempts: u64,
    successes: u64,
    failures: u64,
    connection_errors: u64,
    reconnections: u64,
    read_only_rejections: u64,
    last_success: Option<SystemTime>,
    last_error: Option<SystemTime>,
}

impl StatsCounter {
    pub fn record_attempt(&mut self) {
        self.total_attempts += 1;
    }

    /// Counts a stored write and remembers when it landed.
    pub fn record_success(&mut self, at: SystemTime) {
        self.successes += 1;
        self.last_success = Some(at);
    }

    /// Counts a failed attempt and remembers when it failed.
    pub fn record_failure(&mut self, at: SystemTime) {
        self.failures += 1;
        self.last_error = Some(at);
    }

    pub fn record_connection_error(&mut self) {
        self.connection_errors += 1;
    }

    pub fn record_reconnection(&mut self) {
        self.reconnections += 1;
    }

    pub fn record_read_only(&mut self) {
        self.read_only_rejections += 1;
    }

    /// Immutable copy of the counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_attempts: self.total_attempts,
            successes: self.successes,
            failures: self.failures,
            connection_errors: self.connection_errors,
            reconnections: self.reconnections,
            read_only_rejections: self.read_only_rejections,
            last_success_unix_ms: self.last_success.map(unix_ms),
            last_error_unix_ms: self.last_error.map(unix_ms),
        }
    }
}

/// Immutable view of [`StatsCounter`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub total_attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub connection_errors: u64,
    pub reconnections: u64,
    pub read_only_rejections: u64,
    pub last_success_unix_ms: Option<u64>,
    pub last_error_unix_ms: Option<u64>,
}

impl StatsSnapshot {
    /// Percentage of attempts that succeeded; 100 before the first attempt.
    pub fn success_rate(&self) -> f64 {
        success_rate(self.successes, self.total_attempts)
    }
}

/// Periodic report: a snapshot plus the writer's identity and cursor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsReport {
    pub writer_id: String,
    /// Next sequence the writer will attempt.
    pub sequence: u64,
    #[serde(flatten)]
    pub stats: StatsSnapshot,
    pub success_rate: f64,
}

impl StatsReport {
    pub fn new(writer_id: impl Into<String>, sequence: u64, stats: StatsSnapshot) -> Self {
        Self {
            writer_id: writer_id.into(),
            sequence,
            success_rate: stats.success_rate(),
            stats,
        }
    }

    /// Client behaviour between `earlier` and this report.
    ///
    /// Interruption is estimated as one write interval per failed attempt.
    pub fn delta_since(&self, earlier: &StatsReport, write_interval: Duration) -> StatsDelta {
        let attempts = self
            .stats
            .total_attempts
            .saturating_sub(earlier.stats.total_attempts);
        let successes = self.stats.successes.saturating_sub(earlier.stats.successes);
        let failures = self.stats.failures.saturating_sub(earlier.stats.failures);
        let interruption = write_interval.saturating_mul(failures.min(u32::MAX as u64) as u32);
        StatsDelta {
            writer_id: self.writer_id.clone(),
            attempts,
            successes,
            failures,
            connection_errors: self
                .stats
                .connection_errors
                .saturating_sub(earlier.stats.connection_errors),
            reconnections: self
                .stats
                .reconnections
                .saturating_sub(earlier.stats.reconnections),
            read_only_rejections: self
                .stats
                .read_only_rejections
                .saturating_sub(earlier.stats.read_only_rejections),
            sequences_advanced: self.sequence.saturating_sub(earlier.sequence),
            success_rate: success_rate(successes, attempts),
            interruption_ms: interruption.as_millis() as u64,
        }
    }

    /// Report as a JSON value.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

impl fmt::Display for StatsReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Client Statistics (ID: {})", self.writer_id)?;
        writeln!(f, "Current Sequence:     {}", self.sequence)?;
        writeln!(f, "Total Write Attempts: {}", self.stats.total_attempts)?;
        writeln!(f, "Successful Writes:    {}", self.stats.successes)?;
        writeln!(f, "Failed Writes:        {}", self.stats.failures)?;
        writeln!(f, "Connection Errors:    {}", self.stats.connection_errors)?;
        writeln!(f, "Reconnections:        {}", self.stats.reconnections)?;
        writeln!(f, "Read-only Rejections: {}", self.stats.read_only_rejections)?;
        write!(f, "Success Rate:         {:.2}%", self.success_rate)
    }
}

/// Counter differences across an observation window, e.g. a failover.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsDelta {
    pub writer_id: String,
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub connection_errors: u64,
    pub reconnections: u64,
    pub read_only_rejections: u64,
    pub sequences_advanced: u64,
    pub success_rate: f64,
    pub interruption_ms: u64,
}

fn success_rate(successes: u64, attempts: u64) -> f64 {
    if attempts == 0 {
        return 100.0;
    }
    successes as f64 / attempts as f64 * 100.0
}

fn unix_ms(at: SystemTime) -> u64 {
    at.duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}
