//! Control-plane capability consumed by drills.
//!
//! Nothing in the writer or verifier discovers topology: they are handed an
//! endpoint and a wait bound. Implementations that actually disrupt a cluster
//! (deleting a primary, restarting members) live outside this crate; the
//! in-memory cluster implements the trait for rehearsals and tests.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Name of a cluster member that can serve writes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Endpoint(pub String);

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[async_trait]
/// Disruption and topology operations a drill performs on a cluster.
pub trait ClusterController: Send + Sync {
    /// Member currently acting as primary.
    async fn current_primary(&self) -> anyhow::Result<Endpoint>;

    /// Forcibly removes the primary to trigger a failover.
    async fn delete_primary(&self, endpoint: &Endpoint) -> anyhow::Result<()>;

    /// Waits until a member other than `old` is a writable primary.
    /// Returns `None` when `max_wait` elapses first.
    async fn wait_for_new_primary(
        &self,
        old: &Endpoint,
        max_wait: Duration,
    ) -> anyhow::Result<Option<Endpoint>>;

    /// Restarts every member in turn, handing the primary role over when its
    /// member's turn comes. May return before the last member is back; pair
    /// it with [`ClusterController::wait_for_rollout_complete`].
    async fn rolling_restart(&self) -> anyhow::Result<()>;

    /// Waits until every member is running again. Returns `false` on timeout.
    async fn wait_for_rollout_complete(&self, max_wait: Duration) -> anyhow::Result<bool>;
}
