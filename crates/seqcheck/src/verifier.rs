//! Post-disruption consistency verification from stored data alone.
//!
//! Per writer identity the verifier checks that stored sequences are
//! contiguous (no gaps), that no key is stored twice (no duplicates) and
//! reports rows the server applied more than once (ack loss). Across
//! replicas it compares row counts and max sequences within a tolerance.
//!
//! All queries are read-only and never coordinate with running writers.
//! Replica sampling under live writes is only as exact as the tolerance;
//! callers needing exactness quiesce writers first.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::error::StoreError;
use crate::record::Record;

/// Default allowed row/max-sequence drift between replicas.
pub const DEFAULT_REPLICA_TOLERANCE: u64 = 3;

/// Read-only access to one copy of the record table.
#[async_trait]
pub trait RecordSource: Send + Sync {
    fn name(&self) -> String;

    /// Every writer id with at least one row, sorted.
    async fn writer_ids(&self) -> Result<Vec<String>, StoreError>;

    /// `None` when `writer_id` has no rows.
    async fn sequence_summary(&self, writer_id: &str)
        -> Result<Option<SequenceSummary>, StoreError>;

    /// `None` when `writer_id` has no rows.
    async fn retry_summary(&self, writer_id: &str) -> Result<Option<RetrySummary>, StoreError>;

    /// Sequences of `writer_id` with `apply_count > 1`, ascending.
    async fn ack_loss_sequences(&self, writer_id: &str) -> Result<Vec<u64>, StoreError>;

    /// Whole-table row count and max sequence.
    async fn replica_sample(&self) -> Result<ReplicaSample, StoreError>;
}

/// Shape of one writer's stored sequence space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceSummary {
    pub min_seq: u64,
    pub max_seq: u64,
    pub total_rows: u64,
    pub unique_seqs: u64,
}

impl SequenceSummary {
    /// Summarises stored sequence numbers; `None` when there are none.
    pub fn from_sequences(sequences: impl IntoIterator<Item = u64>) -> Option<Self> {
        let mut sorted = sequences.into_iter().collect::<Vec<_>>();
        if sorted.is_empty() {
            return None;
        }
        sorted.sort_unstable();
        let total_rows = sorted.len() as u64;
        let min_seq = sorted[0];
        let max_seq = sorted[sorted.len() - 1];
        sorted.dedup();
        Some(Self {
            min_seq,
            max_seq,
            total_rows,
            unique_seqs: sorted.len() as u64,
        })
    }

    /// Row count a contiguous range `min..=max` would have.
    pub fn expected_rows(&self) -> u64 {
        self.max_seq.saturating_sub(self.min_seq).saturating_add(1)
    }

    pub fn has_gaps(&self) -> bool {
        self.total_rows != self.expected_rows()
    }

    /// Never expected under the composite primary key; a true result means a
    /// schema or key-derivation bug rather than a protocol retry.
    pub fn has_duplicates(&self) -> bool {
        self.unique_seqs != self.total_rows
    }

    pub fn missing_sequences(&self) -> u64 {
        self.expected_rows().saturating_sub(self.unique_seqs)
    }

    pub fn duplicate_rows(&self) -> u64 {
        self.total_rows.saturating_sub(self.unique_seqs)
    }
}

/// Retry amplification for one writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrySummary {
    pub max_attempts: u32,
    pub max_apply_count: u32,
    pub rows_with_apply_count_gt1: u64,
}

impl RetrySummary {
    /// Aggregates retry counters over a writer's rows; `None` when empty.
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a Record>) -> Option<Self> {
        records.into_iter().fold(None, |summary, record| {
            let mut summary = summary.unwrap_or(Self {
                max_attempts: 0,
                max_apply_count: 0,
                rows_with_apply_count_gt1: 0,
            });
            summary.max_attempts = summary.max_attempts.max(record.attempt_count);
            summary.max_apply_count = summary.max_apply_count.max(record.apply_count);
            if record.is_ack_loss() {
                summary.rows_with_apply_count_gt1 += 1;
            }
            Some(summary)
        })
    }

    /// Some sequence needed more than one client attempt.
    pub fn retried(&self) -> bool {
        self.max_attempts > 1
    }

    /// Some write landed although the writer saw it fail.
    pub fn ack_loss_detected(&self) -> bool {
        self.max_apply_count > 1 || self.rows_with_apply_count_gt1 > 0
    }
}

/// Size of one replica's table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaSample {
    pub rows: u64,
    pub max_sequence: Option<u64>,
}

/// Sample taken from one replica, or why it could not be taken.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaObservation {
    pub name: String,
    pub sample: Option<ReplicaSample>,
    pub error: Option<String>,
}

impl ReplicaObservation {
    pub fn sampled(name: impl Into<String>, sample: ReplicaSample) -> Self {
        Self {
            name: name.into(),
            sample: Some(sample),
            error: None,
        }
    }

    /// Replica that could not be sampled; fails consistency.
    pub fn unreachable(name: impl Into<String>, error: impl ToString) -> Self {
        Self {
            name: name.into(),
            sample: None,
            error: Some(error.to_string()),
        }
    }
}

/// Cross-replica comparison against the first reachable replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaConsistency {
    pub observations: Vec<ReplicaObservation>,
    pub tolerance: u64,
    pub max_row_diff: u64,
    pub max_sequence_diff: u64,
    pub consistent: bool,
}

/// Samples every replica; unreachable replicas are recorded, not skipped.
pub async fn sample_replicas<R: RecordSource>(replicas: &[R]) -> Vec<ReplicaObservation> {
    let mut observations = Vec::with_capacity(replicas.len());
    for replica in replicas {
        let name = replica.name();
        match replica.replica_sample().await {
            Ok(sample) => {
                info!(
                    replica = %name,
                    rows = sample.rows,
                    max_sequence = ?sample.max_sequence,
                    "sampled replica"
                );
                observations.push(ReplicaObservation::sampled(name, sample));
            }
            Err(err) => {
                warn!(replica = %name, error = %err, "replica sample failed");
                observations.push(ReplicaObservation::unreachable(name, err));
            }
        }
    }
    observations
}

/// Replicas agree when all of them answered and each one's row count and max
/// sequence are within `tolerance` of the reference replica.
pub fn check_replica_consistency(
    observations: Vec<ReplicaObservation>,
    tolerance: u64,
) -> ReplicaConsistency {
    let mut reference: Option<ReplicaSample> = None;
    let mut max_row_diff = 0;
    let mut max_sequence_diff = 0;
    let mut all_reachable = true;
    for observation in &observations {
        let Some(sample) = observation.sample else {
            all_reachable = false;
            continue;
        };
        match reference {
            None => reference = Some(sample),
            Some(reference) => {
                max_row_diff = max_row_diff.max(reference.rows.abs_diff(sample.rows));
                max_sequence_diff = max_sequence_diff.max(sequence_diff(
                    reference.max_sequence,
                    sample.max_sequence,
                ));
            }
        }
    }
    let consistent = all_reachable
        && reference.is_some()
        && max_row_diff <= tolerance
        && max_sequence_diff <= tolerance;
    if consistent {
        info!(max_row_diff, max_sequence_diff, "replicas consistent");
    } else {
        warn!(
            max_row_diff,
            max_sequence_diff,
            tolerance,
            all_reachable,
            "replica inconsistency detected"
        );
    }
    ReplicaConsistency {
        observations,
        tolerance,
        max_row_diff,
        max_sequence_diff,
        consistent,
    }
}

fn sequence_diff(a: Option<u64>, b: Option<u64>) -> u64 {
    match (a, b) {
        (Some(a), Some(b)) => a.abs_diff(b),
        (None, None) => 0,
        (Some(max), None) | (None, Some(max)) => max.saturating_add(1),
    }
}

/// Verification outcome for one writer identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriterVerdict {
    pub writer_id: String,
    pub sequences: SequenceSummary,
    pub retries: RetrySummary,
    pub expected_rows: u64,
    pub has_gaps: bool,
    pub has_duplicates: bool,
    pub missing_sequences: u64,
    pub duplicate_rows: u64,
    /// Informational: these rows were applied more than once.
    pub ack_loss_sequences: Vec<u64>,
}

impl WriterVerdict {
    fn new(
        writer_id: String,
        sequences: SequenceSummary,
        retries: RetrySummary,
        ack_loss_sequences: Vec<u64>,
    ) -> Self {
        Self {
            writer_id,
            expected_rows: sequences.expected_rows(),
            has_gaps: sequences.has_gaps(),
            has_duplicates: sequences.has_duplicates(),
            missing_sequences: sequences.missing_sequences(),
            duplicate_rows: sequences.duplicate_rows(),
            sequences,
            retries,
            ack_loss_sequences,
        }
    }

    /// Ack loss never fails a writer; gaps and duplicates do.
    pub fn passed(&self) -> bool {
        !self.has_gaps && !self.has_duplicates
    }
}

/// Full verification result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub writers: Vec<WriterVerdict>,
    /// Requested writer ids that have no rows at all.
    pub missing_writers: Vec<String>,
    pub replicas: Option<ReplicaConsistency>,
    pub passed: bool,
}

impl VerificationReport {
    /// Verdict for one writer, if it had rows.
    pub fn writer(&self, writer_id: &str) -> Option<&WriterVerdict> {
        self.writers
            .iter()
            .find(|verdict| verdict.writer_id == writer_id)
    }

    pub fn has_gaps(&self) -> bool {
        self.writers.iter().any(|verdict| verdict.has_gaps)
    }

    pub fn has_duplicates(&self) -> bool {
        self.writers.iter().any(|verdict| verdict.has_duplicates)
    }

    /// Rows applied more than once across every writer.
    pub fn ack_loss_rows(&self) -> u64 {
        self.writers
            .iter()
            .map(|verdict| verdict.retries.rows_with_apply_count_gt1)
            .sum()
    }
}

/// Runs the per-writer checks against one record source, normally the
/// current primary.
pub struct ConsistencyVerifier<S> {
    source: S,
}

impl<S: RecordSource> ConsistencyVerifier<S> {
    /// Verifier reading from `source`.
    pub fn new(source: S) -> Self {
        Self { source }
    }

    /// The record source queried by every check.
    pub fn source(&self) -> &S {
        &self.source
    }

    /// Min, max, row and distinct-sequence counts for `writer_id`.
    pub async fn check_gaps_and_duplicates(
        &self,
        writer_id: &str,
    ) -> Result<Option<SequenceSummary>, StoreError> {
        self.source.sequence_summary(writer_id).await
    }

    /// Largest attempt and apply counts, plus rows applied more than once.
    pub async fn check_retry_amplification(
        &self,
        writer_id: &str,
    ) -> Result<Option<RetrySummary>, StoreError> {
        self.source.retry_summary(writer_id).await
    }

    /// `None` when the writer has no stored rows.
    pub async fn verify_writer(
        &self,
        writer_id: &str,
    ) -> Result<Option<WriterVerdict>, StoreError> {
        let Some(sequences) = self.check_gaps_and_duplicates(writer_id).await? else {
            return Ok(None);
        };
        let Some(retries) = self.check_retry_amplification(writer_id).await? else {
            return Ok(None);
        };
        let ack_loss = if retries.ack_loss_detected() {
            self.source.ack_loss_sequences(writer_id).await?
        } else {
            Vec::new()
        };
        let verdict = WriterVerdict::new(writer_id.to_string(), sequences, retries, ack_loss);
        log_verdict(&verdict);
        Ok(Some(verdict))
    }

    /// Verifies `writer_ids`, or every writer found in the source when `None`.
    ///
    /// An empty result set fails: nothing was proven.
    pub async fn verify(
        &self,
        writer_ids: Option<&[String]>,
        replicas: Option<ReplicaConsistency>,
    ) -> Result<VerificationReport, StoreError> {
        let writer_ids = match writer_ids {
            Some(ids) => ids.to_vec(),
            None => self.source.writer_ids().await?,
        };
        let mut writers = Vec::with_capacity(writer_ids.len());
        let mut missing_writers = Vec::new();
        for writer_id in writer_ids {
            match self.verify_writer(&writer_id).await? {
                Some(verdict) => writers.push(verdict),
                None => {
                    warn!(writer_id = %writer_id, "no records stored for writer");
                    missing_writers.push(writer_id);
                }
            }
        }
        let passed = !writers.is_empty()
            && missing_writers.is_empty()
            && writers.iter().all(WriterVerdict::passed)
            && replicas.as_ref().map_or(true, |replicas| replicas.consistent);
        Ok(VerificationReport {
            writers,
            missing_writers,
            replicas,
            passed,
        })
    }

    /// Verifies every writer id present in the source.
    pub async fn verify_all(
        &self,
        replicas: Option<ReplicaConsistency>,
    ) -> Result<VerificationReport, StoreError> {
        self.verify(None, replicas).await
    }
}

fn log_verdict(verdict: &WriterVerdict) {
    let summary = &verdict.sequences;
    if verdict.has_duplicates {
        error!(
            writer_id = %verdict.writer_id,
            total_rows = summary.total_rows,
            unique_seqs = summary.unique_seqs,
            duplicate_rows = verdict.duplicate_rows,
            "duplicate sequences stored: key invariant violated"
        );
    }
    if verdict.has_gaps {
        warn!(
            writer_id = %verdict.writer_id,
            min_seq = summary.min_seq,
            max_seq = summary.max_seq,
            total_rows = summary.total_rows,
            expected_rows = verdict.expected_rows,
            missing = verdict.missing_sequences,
            "sequence gaps detected"
        );
    }
    if verdict.passed() {
        info!(
            writer_id = %verdict.writer_id,
            sequences = summary.total_rows,
            max_attempts = verdict.retries.max_attempts,
            "no gaps, no duplicates"
        );
    }
    if verdict.retries.ack_loss_detected() {
        info!(
            writer_id = %verdict.writer_id,
            max_apply_count = verdict.retries.max_apply_count,
            rows = verdict.retries.rows_with_apply_count_gt1,
            sequences = ?verdict.ack_loss_sequences,
            "writes applied more than once: acknowledgement lost, absorbed by upsert"
        );
    }
}
