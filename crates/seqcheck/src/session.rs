//! Connection seam between the writer and a cluster's write endpoint.
//!
//! There is no pool: every [`Connector::acquire`] returns a fresh,
//! owned [`Session`], and a session that failed is released instead of being
//! handed out again. Dropping a session releases it, so every exit path of the
//! writer gives the connection back.

use async_trait::async_trait;

use crate::error::{ApplyError, ConnectionError};
use crate::record::SequenceWrite;

/// Opens sessions against the cluster's current write endpoint.
#[async_trait]
pub trait Connector: Send + Sync {
    type Session: Session;

    /// Endpoint description used in logs and errors.
    fn endpoint(&self) -> String;

    /// Opens a new session. Never retries and never reuses an earlier handle.
    async fn acquire(&self) -> Result<Self::Session, ConnectionError>;
}

/// One live connection. Owned by exactly one writer at a time.
#[async_trait]
pub trait Session: Send {
    /// Round-trips a trivial query; cached socket state is not trusted.
    async fn is_alive(&mut self) -> bool;

    /// Best-effort name of the cluster member serving this session.
    async fn origin_host(&mut self) -> Option<String>;

    /// Creates the record table and its index when missing.
    async fn ensure_schema(&mut self) -> Result<(), ApplyError>;

    /// Highest stored sequence for `writer_id`, if any.
    async fn max_sequence(&mut self, writer_id: &str) -> Result<Option<u64>, ApplyError>;

    /// Idempotent upsert keyed by `(writer_id, sequence)`.
    async fn upsert(&mut self, write: &SequenceWrite) -> Result<(), ApplyError>;

    /// Gives the connection back. Equivalent to dropping it.
    fn release(self)
    where
        Self: Sized,
    {
        drop(self);
    }
}
