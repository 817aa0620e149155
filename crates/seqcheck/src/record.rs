//! Persisted record model and the storage schema contract.
//!
//! One row per `(writer_id, sequence)`. A retried sequence is applied to the
//! same row again, so `apply_count` counts physical applies while
//! `attempt_count` mirrors the writer's own attempt counter.

use std::time::SystemTime;

use crate::error::StoreError;

/// Table holding every sequenced write.
pub const TABLE_NAME: &str = "failover_sequence";

/// Table and index DDL, executed once at writer startup.
pub const SCHEMA_SQL: &str = "CREATE TABLE IF NOT EXISTS failover_sequence (
    writer_id TEXT NOT NULL,
    sequence BIGINT NOT NULL,
    write_time TIMESTAMPTZ NOT NULL,
    origin_host TEXT,
    attempt_count INTEGER NOT NULL DEFAULT 1,
    apply_count INTEGER NOT NULL DEFAULT 1,
    first_attempt_time TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (writer_id, sequence)
);
CREATE INDEX IF NOT EXISTS failover_sequence_write_time_idx
    ON failover_sequence (write_time);";

/// Idempotent upsert: insert with `apply_count = 1`, or on key collision take
/// the incoming attempt count, bump `apply_count` and refresh time/host.
pub const UPSERT_SQL: &str = "INSERT INTO failover_sequence
    (writer_id, sequence, write_time, origin_host, attempt_count, apply_count, first_attempt_time)
VALUES ($1, $2, $3, $4, $5, 1, $6)
ON CONFLICT (writer_id, sequence) DO UPDATE SET
    attempt_count = EXCLUDED.attempt_count,
    apply_count = failover_sequence.apply_count + 1,
    write_time = EXCLUDED.write_time,
    origin_host = EXCLUDED.origin_host";

/// Resume point lookup for one writer.
pub const MAX_SEQUENCE_SQL: &str =
    "SELECT MAX(sequence) FROM failover_sequence WHERE writer_id = $1";

pub const WRITER_IDS_SQL: &str =
    "SELECT DISTINCT writer_id FROM failover_sequence ORDER BY writer_id";

pub const SEQUENCE_SUMMARY_SQL: &str = "SELECT
    MIN(sequence), MAX(sequence), COUNT(*), COUNT(DISTINCT sequence)
FROM failover_sequence
WHERE writer_id = $1
GROUP BY writer_id";

pub const RETRY_SUMMARY_SQL: &str = "SELECT
    MAX(attempt_count), MAX(apply_count), COUNT(*) FILTER (WHERE apply_count > 1)
FROM failover_sequence
WHERE writer_id = $1
GROUP BY writer_id";

pub const ACK_LOSS_SQL: &str = "SELECT sequence FROM failover_sequence
WHERE writer_id = $1 AND apply_count > 1
ORDER BY sequence";

pub const REPLICA_SAMPLE_SQL: &str = "SELECT COUNT(*), MAX(sequence) FROM failover_sequence";

/// Payload of one upsert attempt for the writer's current cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceWrite {
    pub writer_id: String,
    pub sequence: u64,
    /// Attempts made for this sequence so far, including this one.
    pub attempt_count: u32,
    pub write_time: SystemTime,
    /// Time of the first attempt (failed or not) for this sequence.
    pub first_attempt_time: SystemTime,
    pub origin_host: Option<String>,
}

/// One persisted row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub writer_id: String,
    pub sequence: u64,
    pub write_time: SystemTime,
    pub origin_host: Option<String>,
    pub attempt_count: u32,
    pub apply_count: u32,
    pub first_attempt_time: SystemTime,
}

impl Record {
    /// Row produced by the first successful apply of a key.
    pub fn first_apply(write: &SequenceWrite) -> Self {
        Self {
            writer_id: write.writer_id.clone(),
            sequence: write.sequence,
            write_time: write.write_time,
            origin_host: write.origin_host.clone(),
            attempt_count: write.attempt_count,
            apply_count: 1,
            first_attempt_time: write.first_attempt_time,
        }
    }

    /// Duplicate-key apply of the same `(writer_id, sequence)`.
    pub fn reapply(&mut self, write: &SequenceWrite) {
        debug_assert_eq!(self.writer_id, write.writer_id);
        debug_assert_eq!(self.sequence, write.sequence);
        self.attempt_count = write.attempt_count;
        self.apply_count = self.apply_count.saturating_add(1);
        self.write_time = write.write_time;
        self.origin_host = write.origin_host.clone();
    }

    /// A row applied more than once: the server took a write whose
    /// acknowledgement the writer never saw.
    pub fn is_ack_loss(&self) -> bool {
        self.apply_count > 1
    }
}

/// Converts a sequence into its `BIGINT` column value.
pub fn sequence_to_sql(sequence: u64) -> Result<i64, StoreError> {
    i64::try_from(sequence).map_err(|_| StoreError::OutOfRange {
        column: "sequence",
        value: i64::MAX,
    })
}

/// Converts an attempt count into its `INT` column value.
pub fn attempt_count_to_sql(attempt_count: u32) -> Result<i32, StoreError> {
    i32::try_from(attempt_count).map_err(|_| StoreError::OutOfRange {
        column: "attempt_count",
        value: i64::from(attempt_count),
    })
}

/// Reads a `BIGINT` sequence column, rejecting negative values.
pub fn sequence_from_sql(value: i64) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| StoreError::OutOfRange {
        column: "sequence",
        value,
    })
}

/// Reads a non-negative count column.
pub fn count_from_sql(column: &'static str, value: i64) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| StoreError::OutOfRange { column, value })
}
