//! Sequenced idempotent writer.
//!
//! The writer owns a cursor (next sequence to attempt) and an attempt counter
//! for that cursor. Each [`SequencedWriter::tick`] makes exactly one attempt.
//! A failed attempt never moves the cursor, so the next tick retries the same
//! `(writer_id, sequence)` key; the idempotent upsert collapses any physical
//! re-apply into one row whose `apply_count` records how often it landed.
//!
//! Reconnect policy: a tick that has no usable session acquires one. If the
//! acquire fails the tick is a failed attempt with a `ConnectionLost` cause.
//! If it succeeds the write proceeds within the same tick.

use std::future::Future;
use std::time::{Duration, Instant, SystemTime};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::{ApplyError, ConnectionError, FatalStartupError, WriteError};
use crate::record::SequenceWrite;
use crate::session::{Connector, Session};
use crate::stats::{StatsCounter, StatsReport, StatsSnapshot};

/// Connection state of a [`SequencedWriter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriterState {
    /// No session; the next tick acquires one.
    Disconnected,
    /// Holding a session whose last write succeeded.
    Connected,
    /// An upsert is in flight.
    WritePending,
    /// The last apply failed; the next tick retries the same sequence.
    Backoff,
}

/// Explicit per-attempt timeouts. Both must be shorter than the write interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriterTimeouts {
    pub connect: Duration,
    pub write: Duration,
}

impl Default for WriterTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_millis(750),
            write: Duration::from_millis(750),
        }
    }
}

/// Outcome of one tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteResult {
    /// `sequence` is stored; the cursor moved past it.
    Success {
        sequence: u64,
        attempts: u32,
        latency: Duration,
    },
    /// The attempt failed; the cursor still points at `sequence`.
    Retryable {
        sequence: u64,
        attempt: u32,
        cause: WriteError,
        latency: Duration,
    },
}

impl WriteResult {
    /// Sequence the attempt was made for.
    pub fn sequence(&self) -> u64 {
        match self {
            Self::Success { sequence, .. } | Self::Retryable { sequence, .. } => *sequence,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn latency(&self) -> Duration {
        match self {
            Self::Success { latency, .. } | Self::Retryable { latency, .. } => *latency,
        }
    }

    /// Why the attempt failed; `None` on success.
    pub fn cause(&self) -> Option<&WriteError> {
        match self {
            Self::Success { .. } => None,
            Self::Retryable { cause, .. } => Some(cause),
        }
    }
}

/// Cursor to resume from given the highest stored sequence.
pub fn resume_cursor(max_sequence: Option<u64>) -> u64 {
    max_sequence.map_or(0, |max| max.saturating_add(1))
}

/// Single-identity sequenced writer. Not shareable: one instance per `writer_id`.
pub struct SequencedWriter<C: Connector> {
    connector: C,
    writer_id: String,
    timeouts: WriterTimeouts,
    session: Option<C::Session>,
    state: WriterState,
    cursor: u64,
    current_attempt_count: u32,
    first_attempt_at: Option<SystemTime>,
    stats: StatsCounter,
    reports: watch::Sender<StatsReport>,
}

impl<C: Connector> SequencedWriter<C> {
    /// Connects, initializes the table and resumes the cursor from storage.
    ///
    /// Any failure here is fatal: without the resume query the writer has no
    /// valid cursor.
    pub async fn start(
        connector: C,
        writer_id: impl Into<String>,
        timeouts: WriterTimeouts,
    ) -> Result<Self, FatalStartupError> {
        let writer_id = writer_id.into();
        if writer_id.trim().is_empty() {
            return Err(FatalStartupError::EmptyWriterId);
        }
        let endpoint = connector.endpoint();
        info!(writer_id = %writer_id, endpoint = %endpoint, "starting sequenced writer");

        let mut session = match acquire_within(&connector, timeouts.connect).await {
            Ok(session) => session,
            Err(err) => {
                error!(writer_id = %writer_id, error = %err, "initial connection failed");
                return Err(FatalStartupError::Connect(err));
            }
        };
        if let Err(err) = apply_within(timeouts.write, session.ensure_schema()).await {
            error!(writer_id = %writer_id, error = %err, "table initialization failed");
            return Err(FatalStartupError::Schema(err));
        }
        let max_sequence =
            match apply_within(timeouts.write, session.max_sequence(&writer_id)).await {
                Ok(max) => max,
                Err(err) => {
                    error!(writer_id = %writer_id, error = %err, "resume-state query failed");
                    return Err(FatalStartupError::Resume(err));
                }
            };
        let cursor = resume_cursor(max_sequence);
        info!(writer_id = %writer_id, sequence = cursor, "resuming from sequence");

        let (reports, _) = watch::channel(StatsReport::new(
            writer_id.clone(),
            cursor,
            StatsSnapshot::default(),
        ));
        Ok(Self {
            connector,
            writer_id,
            timeouts,
            session: Some(session),
            state: WriterState::Connected,
            cursor,
            current_attempt_count: 0,
            first_attempt_at: None,
            stats: StatsCounter::default(),
            reports,
        })
    }

    /// Identity stamped on every row this writer stores.
    pub fn writer_id(&self) -> &str {
        &self.writer_id
    }

    /// Next sequence to attempt.
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Attempts made so far for the current cursor.
    pub fn current_attempt_count(&self) -> u32 {
        self.current_attempt_count
    }

    /// Connection state after the last tick.
    pub fn state(&self) -> WriterState {
        self.state
    }

    /// Counters accumulated since startup.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Current cursor and counters as a report.
    pub fn report(&self) -> StatsReport {
        StatsReport::new(self.writer_id.clone(), self.cursor, self.stats.snapshot())
    }

    /// Receives a fresh [`StatsReport`] after every tick.
    pub fn subscribe(&self) -> watch::Receiver<StatsReport> {
        self.reports.subscribe()
    }

    /// Makes exactly one write attempt for the current cursor.
    pub async fn tick(&mut self) -> WriteResult {
        let started = Instant::now();
        let sequence = self.cursor;
        self.stats.record_attempt();
        self.current_attempt_count = self.current_attempt_count.saturating_add(1);
        let attempt = self.current_attempt_count;
        let first_attempt_time = *self.first_attempt_at.get_or_insert_with(SystemTime::now);

        let mut session = match self.take_usable_session().await {
            Ok(session) => session,
            Err(err) => {
                // Counted against the current sequence even though nothing
                // reached the server.
                self.stats.record_connection_error();
                self.stats.record_failure(SystemTime::now());
                self.state = WriterState::Disconnected;
                warn!(
                    writer_id = %self.writer_id,
                    sequence,
                    attempt,
                    error = %err,
                    "connection unavailable, will retry"
                );
                return self.finish(WriteResult::Retryable {
                    sequence,
                    attempt,
                    cause: WriteError::ConnectionLost(err),
                    latency: started.elapsed(),
                });
            }
        };

        self.state = WriterState::WritePending;
        let origin_host = tokio::time::timeout(self.timeouts.write, session.origin_host())
            .await
            .ok()
            .flatten();
        let write = SequenceWrite {
            writer_id: self.writer_id.clone(),
            sequence,
            attempt_count: attempt,
            write_time: SystemTime::now(),
            first_attempt_time,
            origin_host,
        };
        let outcome = apply_within(self.timeouts.write, session.upsert(&write)).await;
        let latency = started.elapsed();

        let result = match outcome {
            Ok(()) => {
                self.session = Some(session);
                self.state = WriterState::Connected;
                self.stats.record_success(SystemTime::now());
                self.cursor += 1;
                self.current_attempt_count = 0;
                self.first_attempt_at = None;
                info!(
                    writer_id = %self.writer_id,
                    sequence,
                    attempts = attempt,
                    latency_ms = latency.as_secs_f64() * 1000.0,
                    success_rate = self.stats.snapshot().success_rate(),
                    "wrote sequence"
                );
                WriteResult::Success {
                    sequence,
                    attempts: attempt,
                    latency,
                }
            }
            Err(err) => {
                self.stats.record_failure(SystemTime::now());
                warn!(
                    writer_id = %self.writer_id,
                    sequence,
                    attempt,
                    error = %err,
                    latency_ms = latency.as_secs_f64() * 1000.0,
                    "write failed, will retry"
                );
                if err.is_read_only() {
                    self.stats.record_read_only();
                    warn!(
                        writer_id = %self.writer_id,
                        endpoint = %self.connector.endpoint(),
                        "endpoint is read-only, failover may be in progress"
                    );
                }
                if err.invalidates_session() {
                    session.release();
                } else {
                    self.session = Some(session);
                }
                self.state = WriterState::Backoff;
                WriteResult::Retryable {
                    sequence,
                    attempt,
                    cause: WriteError::Apply(err),
                    latency,
                }
            }
        };
        self.finish(result)
    }

    /// Releases the session and returns the final report.
    pub fn shutdown(mut self) -> StatsReport {
        if let Some(session) = self.session.take() {
            session.release();
        }
        self.state = WriterState::Disconnected;
        let report = self.report();
        self.reports.send_replace(report.clone());
        report
    }

    /// Returns a session that can take the next write, acquiring a fresh one
    /// when none is held or the held one fails its liveness probe.
    async fn take_usable_session(&mut self) -> Result<C::Session, ConnectionError> {
        if let Some(mut session) = self.session.take() {
            if self.state != WriterState::Backoff {
                return Ok(session);
            }
            let alive = tokio::time::timeout(self.timeouts.write, session.is_alive())
                .await
                .unwrap_or(false);
            if alive {
                return Ok(session);
            }
            debug!(writer_id = %self.writer_id, "session failed liveness probe, releasing");
            session.release();
            self.state = WriterState::Disconnected;
        }

        warn!(writer_id = %self.writer_id, "connection lost, attempting to reconnect");
        let session = acquire_within(&self.connector, self.timeouts.connect).await?;
        self.stats.record_reconnection();
        self.state = WriterState::Connected;
        info!(
            writer_id = %self.writer_id,
            endpoint = %self.connector.endpoint(),
            "reconnected"
        );
        Ok(session)
    }

    fn finish(&mut self, result: WriteResult) -> WriteResult {
        self.reports.send_replace(self.report());
        result
    }
}

async fn acquire_within<C: Connector>(
    connector: &C,
    limit: Duration,
) -> Result<C::Session, ConnectionError> {
    match tokio::time::timeout(limit, connector.acquire()).await {
        Ok(result) => result,
        Err(_) => Err(ConnectionError::timeout(connector.endpoint(), limit)),
    }
}

async fn apply_within<T, F>(limit: Duration, attempt: F) -> Result<T, ApplyError>
where
    F: Future<Output = Result<T, ApplyError>>,
{
    match tokio::time::timeout(limit, attempt).await {
        Ok(result) => result,
        Err(_) => Err(ApplyError::timeout(limit)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ApplyErrorKind, WriteError};
    use crate::memory::MemoryCluster;

    async fn start(cluster: &MemoryCluster, writer_id: &str) -> SequencedWriter<MemoryCluster> {
        SequencedWriter::start(cluster.clone(), writer_id, WriterTimeouts::default())
            .await
            .expect("writer starts")
    }

    #[test]
    fn resume_cursor_is_one_past_max() {
        assert_eq!(resume_cursor(None), 0);
        assert_eq!(resume_cursor(Some(0)), 1);
        assert_eq!(resume_cursor(Some(41)), 42);
    }

    #[tokio::test]
    async fn five_clean_ticks_write_five_rows() {
        let cluster = MemoryCluster::new(1);
        let mut writer = start(&cluster, "c1").await;
        for expected in 0..5 {
            let result = writer.tick().await;
            assert!(result.is_success());
            assert_eq!(result.sequence(), expected);
        }

        let records = cluster.records("c1");
        assert_eq!(
            records.iter().map(|r| r.sequence).collect::<Vec<_>>(),
            vec![0, 1, 2, 3, 4]
        );
        assert!(records.iter().all(|r| r.apply_count == 1));
        assert!(records.iter().all(|r| r.attempt_count == 1));
        assert_eq!(writer.cursor(), 5);
        assert_eq!(writer.state(), WriterState::Connected);
    }

    #[tokio::test]
    async fn failed_applies_retry_the_same_sequence() {
        let cluster = MemoryCluster::new(1);
        let mut writer = start(&cluster, "c1").await;
        for _ in 0..7 {
            assert!(writer.tick().await.is_success());
        }

        cluster.fail_applies(2);
        for attempt in 1..=2 {
            let result = writer.tick().await;
            assert!(!result.is_success());
            assert_eq!(result.sequence(), 7);
            assert_eq!(writer.cursor(), 7);
            assert_eq!(writer.current_attempt_count(), attempt);
        }
        let result = writer.tick().await;
        assert_eq!(
            result,
            WriteResult::Success {
                sequence: 7,
                attempts: 3,
                latency: result.latency(),
            }
        );
        assert_eq!(writer.current_attempt_count(), 0);

        let row = cluster
            .records("c1")
            .into_iter()
            .find(|r| r.sequence == 7)
            .expect("row 7");
        assert_eq!(row.attempt_count, 3);
        assert_eq!(row.apply_count, 1);
    }

    #[tokio::test]
    async fn lost_ack_is_reapplied_not_duplicated() {
        let cluster = MemoryCluster::new(1);
        let mut writer = start(&cluster, "c1").await;
        assert!(writer.tick().await.is_success());

        cluster.lose_acks(2);
        assert!(!writer.tick().await.is_success());
        assert!(!writer.tick().await.is_success());
        let result = writer.tick().await;
        assert!(result.is_success());
        assert_eq!(result.sequence(), 1);

        let records = cluster.records("c1");
        assert_eq!(records.len(), 2);
        let row = &records[1];
        assert_eq!(row.sequence, 1);
        assert_eq!(row.apply_count, 3);
        assert_eq!(row.attempt_count, 3);
    }

    #[tokio::test]
    async fn connection_failure_counts_an_attempt_for_the_cursor() {
        let cluster = MemoryCluster::new(1);
        let mut writer = start(&cluster, "c1").await;
        assert!(writer.tick().await.is_success());

        // Break the held session, then refuse the reconnect.
        cluster.fail_applies(1);
        assert!(!writer.tick().await.is_success());
        cluster.refuse_connects(1);
        let result = writer.tick().await;
        assert!(matches!(
            result.cause(),
            Some(WriteError::ConnectionLost(_))
        ));
        assert_eq!(result.sequence(), 1);
        assert_eq!(writer.current_attempt_count(), 2);
        assert_eq!(writer.state(), WriterState::Disconnected);

        let result = writer.tick().await;
        assert!(result.is_success());
        assert_eq!(result.sequence(), 1);

        let stats = writer.stats();
        assert_eq!(stats.total_attempts, 4);
        assert_eq!(stats.successes, 2);
        assert_eq!(stats.failures, 2);
        assert_eq!(stats.connection_errors, 1);
        assert_eq!(stats.reconnections, 1);
        assert_eq!(stats.successes + stats.failures, stats.total_attempts);

        let row = cluster
            .records("c1")
            .into_iter()
            .find(|r| r.sequence == 1)
            .expect("row 1");
        assert_eq!(row.attempt_count, 3);
    }

    #[tokio::test]
    async fn read_only_rejection_is_flagged_without_advancing() {
        let cluster = MemoryCluster::new(1);
        let mut writer = start(&cluster, "c1").await;
        cluster.set_read_only(true);

        let result = writer.tick().await;
        match result.cause() {
            Some(WriteError::Apply(err)) => assert_eq!(err.kind, ApplyErrorKind::ReadOnly),
            other => panic!("expected read-only apply error, got {other:?}"),
        }
        assert_eq!(writer.cursor(), 0);
        assert_eq!(writer.state(), WriterState::Backoff);
        assert_eq!(writer.stats().read_only_rejections, 1);

        cluster.set_read_only(false);
        let result = writer.tick().await;
        assert!(result.is_success());
        assert_eq!(result.sequence(), 0);
        assert_eq!(cluster.records("c1")[0].attempt_count, 2);
    }

    #[tokio::test]
    async fn restart_resumes_one_past_stored_max() {
        let cluster = MemoryCluster::new(1);
        let mut writer = start(&cluster, "c1").await;
        for _ in 0..4 {
            writer.tick().await;
        }
        let report = writer.shutdown();
        assert_eq!(report.sequence, 4);

        let mut restarted = start(&cluster, "c1").await;
        assert_eq!(restarted.cursor(), 4);
        assert_eq!(restarted.tick().await.sequence(), 4);

        let other = start(&cluster, "c2").await;
        assert_eq!(other.cursor(), 0);
    }

    #[tokio::test]
    async fn startup_failures_are_fatal() {
        let cluster = MemoryCluster::new(1);
        cluster.refuse_connects(1);
        let err = SequencedWriter::start(cluster.clone(), "c1", WriterTimeouts::default())
            .await
            .err()
            .expect("refused startup");
        assert!(matches!(err, FatalStartupError::Connect(_)));

        let err = SequencedWriter::start(cluster, "  ", WriterTimeouts::default())
            .await
            .err()
            .expect("empty id");
        assert!(matches!(err, FatalStartupError::EmptyWriterId));
    }

    #[tokio::test]
    async fn subscribers_see_a_report_after_every_tick() {
        let cluster = MemoryCluster::new(1);
        let mut writer = start(&cluster, "c1").await;
        let reports = writer.subscribe();
        writer.tick().await;
        writer.tick().await;

        let report = reports.borrow().clone();
        assert_eq!(report.sequence, 2);
        assert_eq!(report.stats.total_attempts, 2);
        assert_eq!(report.stats.successes, 2);
    }
}
