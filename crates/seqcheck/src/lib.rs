//! Sequenced idempotent writes and consistency verification for
//! primary-replica failover testing.
//!
//! A [`SequencedWriter`] writes one row per tick keyed by
//! `(writer_id, sequence)`, retrying the same key until it is acknowledged.
//! After a disruption the [`ConsistencyVerifier`] proves from stored data
//! alone that no sequence was lost or duplicated, and reports rows that were
//! applied more than once because an acknowledgement was lost.
//!
//! Backends plug in through [`Connector`]/[`Session`] (write path) and
//! [`RecordSource`] (read path). [`postgres`] talks to any PostgreSQL-wire
//! cluster; [`memory`] is an in-process replicated cluster with fault
//! injection used for drills and tests.

pub mod cluster;
pub mod config;
pub mod drill;
pub mod error;
pub mod memory;
pub mod postgres;
pub mod record;
pub mod runner;
pub mod session;
pub mod stats;
pub mod verifier;
pub mod writer;

pub use cluster::{ClusterController, Endpoint};
pub use config::WriterConfig;
pub use drill::{run_drill, DrillMode, DrillOptions, DrillReport};
pub use error::{
    ApplyError, ApplyErrorKind, ConnectionError, FatalStartupError, StoreError, WriteError,
};
pub use memory::{MemoryCluster, MemoryReplica};
pub use postgres::{PgConnector, PgRecordSource};
pub use record::{Record, SequenceWrite};
pub use runner::{run_writer, RunOptions};
pub use session::{Connector, Session};
pub use stats::{StatsDelta, StatsReport, StatsSnapshot};
pub use verifier::{
    check_replica_consistency, sample_replicas, ConsistencyVerifier, RecordSource,
    ReplicaConsistency, VerificationReport, WriterVerdict,
};
pub use writer::{SequencedWriter, WriteResult, WriterState, WriterTimeouts};
