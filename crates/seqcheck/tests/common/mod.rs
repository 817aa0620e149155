//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::time::Duration;

use seqcheck::{MemoryCluster, SequencedWriter, WriteResult, WriterTimeouts};

/// Per-attempt bounds for in-memory writers; nothing here ever blocks.
pub const FAST_TIMEOUTS: WriterTimeouts = WriterTimeouts {
    connect: Duration::from_millis(50),
    write: Duration::from_millis(50),
};

/// Start a writer against `cluster`, panicking on startup failure.
pub async fn start_writer(
    cluster: &MemoryCluster,
    writer_id: &str,
) -> SequencedWriter<MemoryCluster> {
    SequencedWriter::start(cluster.clone(), writer_id, FAST_TIMEOUTS)
        .await
        .unwrap_or_else(|err| panic!("start writer {writer_id}: {err}"))
}

/// Tick `writer` `count` times and return every result.
pub async fn tick_n(
    writer: &mut SequencedWriter<MemoryCluster>,
    count: usize,
) -> Vec<WriteResult> {
    let mut results = Vec::with_capacity(count);
    for _ in 0..count {
        results.push(writer.tick().await);
    }
    results
}

/// Tick until `successes` writes have been acknowledged, bounded by `max_ticks`.
pub async fn tick_until_successes(
    writer: &mut SequencedWriter<MemoryCluster>,
    successes: usize,
    max_ticks: usize,
) -> Vec<WriteResult> {
    let mut results = Vec::new();
    while results.iter().filter(|r: &&WriteResult| r.is_success()).count() < successes {
        assert!(
            results.len() < max_ticks,
            "only {} of {successes} writes succeeded in {max_ticks} ticks",
            results.iter().filter(|r: &&WriteResult| r.is_success()).count()
        );
        results.push(writer.tick().await);
    }
    results
}

/// Stored sequences for `writer_id` on the current primary.
pub fn stored_sequences(cluster: &MemoryCluster, writer_id: &str) -> Vec<u64> {
    cluster
        .records(writer_id)
        .into_iter()
        .map(|record| record.sequence)
        .collect()
}
