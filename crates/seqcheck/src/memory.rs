//! In-process replicated cluster.
//!
//! A primary plus replicas, each holding a full copy of the record table.
//! Writes land on the primary and are copied to every replica that is up
//! before the apply returns. The cluster doubles as a [`Connector`] (sessions
//! always route to the current primary, like a gateway service), as a
//! [`RecordSource`] per node, and as a [`ClusterController`], which makes it
//! the backend for drills and tests.
//!
//! Faults are injected as counters consumed by the next matching operation.
//! Every node carries a generation that is bumped whenever it goes down or
//! restarts; a session remembers the generation it was opened against, so a
//! handle to a restarted node can never silently serve writes again.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::cluster::{ClusterController, Endpoint};
use crate::error::{ApplyError, ConnectionError, StoreError};
use crate::record::{Record, SequenceWrite};
use crate::session::{Connector, Session};
use crate::verifier::{RecordSource, ReplicaSample, RetrySummary, SequenceSummary};

type RowKey = (String, u64);

#[derive(Debug, Clone)]
struct MemoryNode {
    name: String,
    up: bool,
    read_only: bool,
    generation: u64,
    rows: BTreeMap<RowKey, Record>,
}

#[derive(Debug, Default)]
struct FaultPlan {
    refuse_connects: u32,
    fail_applies: u32,
    lose_acks: u32,
}

#[derive(Debug)]
struct ClusterState {
    nodes: Vec<MemoryNode>,
    primary: Option<usize>,
    faults: FaultPlan,
}

impl ClusterState {
    fn node_index(&self, name: &str) -> Option<usize> {
        self.nodes.iter().position(|node| node.name == name)
    }

    /// Node backing a session, provided it is still the same incarnation.
    fn bound_node(&mut self, node: usize, generation: u64) -> Result<&mut MemoryNode, ApplyError> {
        match self.nodes.get_mut(node) {
            Some(bound) if bound.up && bound.generation == generation => Ok(bound),
            _ => Err(ApplyError::transport(
                "server closed the connection unexpectedly",
            )),
        }
    }

    fn apply(&mut self, node: usize, write: &SequenceWrite) {
        let key = (write.writer_id.clone(), write.sequence);
        let record = {
            let rows = &mut self.nodes[node].rows;
            match rows.get_mut(&key) {
                Some(existing) => {
                    existing.reapply(write);
                    existing.clone()
                }
                None => {
                    let record = Record::first_apply(write);
                    rows.insert(key.clone(), record.clone());
                    record
                }
            }
        };
        for (index, replica) in self.nodes.iter_mut().enumerate() {
            if index != node && replica.up {
                replica.rows.insert(key.clone(), record.clone());
            }
        }
    }

    /// Promotes the up node holding the most rows (lowest index on ties),
    /// never `excluded`, and demotes every other node.
    fn promote(&mut self, excluded: Option<usize>) -> Option<usize> {
        let candidate = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(index, node)| node.up && Some(*index) != excluded)
            .max_by(|(ia, a), (ib, b)| a.rows.len().cmp(&b.rows.len()).then(ib.cmp(ia)))
            .map(|(index, _)| index)?;
        for (index, node) in self.nodes.iter_mut().enumerate() {
            node.read_only = index != candidate;
        }
        self.primary = Some(candidate);
        Some(candidate)
    }
}

/// Shared handle to an in-process cluster. Clones observe the same state.
#[derive(Debug, Clone)]
pub struct MemoryCluster {
    inner: Arc<Mutex<ClusterState>>,
    election_delay: Duration,
    restart_delay: Duration,
}

impl MemoryCluster {
    /// Cluster of `nodes` members named `node-0..`, with `node-0` as primary.
    pub fn new(nodes: usize) -> Self {
        let nodes = (0..nodes.max(1))
            .map(|index| MemoryNode {
                name: format!("node-{index}"),
                up: true,
                read_only: index != 0,
                generation: 0,
                rows: BTreeMap::new(),
            })
            .collect();
        Self {
            inner: Arc::new(Mutex::new(ClusterState {
                nodes,
                primary: Some(0),
                faults: FaultPlan::default(),
            })),
            election_delay: Duration::ZERO,
            restart_delay: Duration::ZERO,
        }
    }

    /// Time a new primary election takes once requested.
    pub fn with_election_delay(mut self, delay: Duration) -> Self {
        self.election_delay = delay;
        self
    }

    /// Time each member stays down during a rolling restart.
    pub fn with_restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay = delay;
        self
    }

    fn state(&self) -> MutexGuard<'_, ClusterState> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Refuses the next `count` connection attempts.
    pub fn refuse_connects(&self, count: u32) {
        self.state().faults.refuse_connects = count;
    }

    /// Fails the next `count` applies before they reach storage.
    pub fn fail_applies(&self, count: u32) {
        self.state().faults.fail_applies = count;
    }

    /// Applies the next `count` writes but reports them as failed.
    pub fn lose_acks(&self, count: u32) {
        self.state().faults.lose_acks = count;
    }

    /// Marks the current primary read-only (or writable again).
    pub fn set_read_only(&self, read_only: bool) {
        let mut state = self.state();
        if let Some(primary) = state.primary {
            state.nodes[primary].read_only = read_only;
        }
    }

    /// Current primary name, if one is elected.
    pub fn primary_name(&self) -> Option<String> {
        let state = self.state();
        state.primary.map(|index| state.nodes[index].name.clone())
    }

    /// Rows for `writer_id` on the primary, ordered by sequence.
    pub fn records(&self, writer_id: &str) -> Vec<Record> {
        let state = self.state();
        let Some(primary) = state.primary else {
            return Vec::new();
        };
        state.nodes[primary]
            .rows
            .values()
            .filter(|record| record.writer_id == writer_id)
            .cloned()
            .collect()
    }

    /// Deletes a row from every node, standing in for an external deletion.
    pub fn remove_record(&self, writer_id: &str, sequence: u64) {
        let key = (writer_id.to_string(), sequence);
        for node in self.state().nodes.iter_mut() {
            node.rows.remove(&key);
        }
    }

    /// Read access to one node's copy of the table.
    pub fn replica(&self, index: usize) -> MemoryReplica {
        MemoryReplica {
            cluster: self.clone(),
            target: ReplicaTarget::Node(index),
        }
    }

    /// Read access to every node.
    pub fn replicas(&self) -> Vec<MemoryReplica> {
        (0..self.state().nodes.len())
            .map(|index| self.replica(index))
            .collect()
    }

    /// Read access that follows whichever node is primary at query time.
    pub fn primary_view(&self) -> MemoryReplica {
        MemoryReplica {
            cluster: self.clone(),
            target: ReplicaTarget::Primary,
        }
    }

    fn elect(&self, old: &Endpoint) -> Option<Endpoint> {
        let mut state = self.state();
        if let Some(current) = state.primary {
            let name = state.nodes[current].name.clone();
            if name != old.0 {
                return Some(Endpoint(name));
            }
        }
        let excluded = state.node_index(&old.0);
        let candidate = state.promote(excluded)?;
        let name = state.nodes[candidate].name.clone();
        info!(primary = %name, "new primary elected");
        Some(Endpoint(name))
    }

    /// Takes one member down, first handing the primary role to another up
    /// member when it holds it.
    fn stop_member(&self, index: usize) {
        let mut state = self.state();
        let name = state.nodes[index].name.clone();
        if state.primary == Some(index) {
            state.primary = None;
            match state.promote(Some(index)) {
                Some(successor) => {
                    info!(from = %name, to = %state.nodes[successor].name, "primary handed over");
                }
                None => info!(node = %name, "no member left to take over the primary"),
            }
        }
        let node = &mut state.nodes[index];
        node.up = false;
        node.generation += 1;
        info!(node = %name, "member stopped for restart");
    }

    /// Brings a member back, caught up with the primary. With no primary
    /// left it takes the role itself.
    fn start_member(&self, index: usize) {
        let mut state = self.state();
        let primary_rows = state.primary.map(|primary| state.nodes[primary].rows.clone());
        let takes_over = primary_rows.is_none();
        let node = &mut state.nodes[index];
        node.up = true;
        node.generation += 1;
        node.read_only = !takes_over;
        if let Some(rows) = primary_rows {
            node.rows = rows;
        }
        info!(node = %node.name, primary = takes_over, "member restarted");
        if takes_over {
            state.primary = Some(index);
        }
    }
}

#[async_trait]
impl Connector for MemoryCluster {
    type Session = MemorySession;

    fn endpoint(&self) -> String {
        "memory://primary".to_string()
    }

    async fn acquire(&self) -> Result<MemorySession, ConnectionError> {
        let mut state = self.state();
        if state.faults.refuse_connects > 0 {
            state.faults.refuse_connects -= 1;
            return Err(ConnectionError::failed(self.endpoint(), "connection refused"));
        }
        let Some(primary) = state.primary else {
            return Err(ConnectionError::failed(self.endpoint(), "no primary available"));
        };
        Ok(MemorySession {
            inner: Arc::clone(&self.inner),
            node: primary,
            generation: state.nodes[primary].generation,
        })
    }
}

/// Session bound to one node incarnation.
#[derive(Debug)]
pub struct MemorySession {
    inner: Arc<Mutex<ClusterState>>,
    node: usize,
    generation: u64,
}

impl MemorySession {
    fn state(&self) -> MutexGuard<'_, ClusterState> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Session for MemorySession {
    async fn is_alive(&mut self) -> bool {
        let (node, generation) = (self.node, self.generation);
        self.state().bound_node(node, generation).is_ok()
    }

    async fn origin_host(&mut self) -> Option<String> {
        let (node, generation) = (self.node, self.generation);
        self.state()
            .bound_node(node, generation)
            .ok()
            .map(|bound| bound.name.clone())
    }

    async fn ensure_schema(&mut self) -> Result<(), ApplyError> {
        let (node, generation) = (self.node, self.generation);
        self.state().bound_node(node, generation).map(|_| ())
    }

    async fn max_sequence(&mut self, writer_id: &str) -> Result<Option<u64>, ApplyError> {
        let (node, generation) = (self.node, self.generation);
        let mut state = self.state();
        let bound = state.bound_node(node, generation)?;
        Ok(bound
            .rows
            .keys()
            .filter(|(id, _)| id == writer_id)
            .map(|(_, sequence)| *sequence)
            .max())
    }

    async fn upsert(&mut self, write: &SequenceWrite) -> Result<(), ApplyError> {
        let (node, generation) = (self.node, self.generation);
        let mut state = self.state();
        let read_only = state.bound_node(node, generation)?.read_only;
        if state.faults.fail_applies > 0 {
            state.faults.fail_applies -= 1;
            return Err(ApplyError::transport("connection reset by peer"));
        }
        if read_only {
            return Err(ApplyError::rejected(
                "cannot execute INSERT in a read-only transaction",
            ));
        }
        state.apply(node, write);
        if state.faults.lose_acks > 0 {
            state.faults.lose_acks -= 1;
            return Err(ApplyError::transport(
                "connection lost before acknowledgement",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum ReplicaTarget {
    Node(usize),
    Primary,
}

/// Read-only view of one node's table.
#[derive(Debug, Clone)]
pub struct MemoryReplica {
    cluster: MemoryCluster,
    target: ReplicaTarget,
}

impl MemoryReplica {
    fn with_rows<T>(
        &self,
        read: impl FnOnce(&BTreeMap<RowKey, Record>) -> T,
    ) -> Result<T, StoreError> {
        let state = self.cluster.state();
        let index = match self.target {
            ReplicaTarget::Node(index) => Some(index),
            ReplicaTarget::Primary => state.primary,
        };
        match index.and_then(|index| state.nodes.get(index)) {
            Some(node) if node.up => Ok(read(&node.rows)),
            Some(node) => Err(StoreError::Unavailable {
                source_name: node.name.clone(),
                cause: "node is down".to_string(),
            }),
            None => Err(StoreError::Unavailable {
                source_name: self.name(),
                cause: "no such node".to_string(),
            }),
        }
    }
}

#[async_trait]
impl RecordSource for MemoryReplica {
    fn name(&self) -> String {
        match self.target {
            ReplicaTarget::Node(index) => format!("node-{index}"),
            ReplicaTarget::Primary => "primary".to_string(),
        }
    }

    async fn writer_ids(&self) -> Result<Vec<String>, StoreError> {
        self.with_rows(|rows| {
            let mut ids = rows.keys().map(|(id, _)| id.clone()).collect::<Vec<_>>();
            ids.dedup();
            ids
        })
    }

    async fn sequence_summary(
        &self,
        writer_id: &str,
    ) -> Result<Option<SequenceSummary>, StoreError> {
        self.with_rows(|rows| {
            SequenceSummary::from_sequences(
                rows.values()
                    .filter(|record| record.writer_id == writer_id)
                    .map(|record| record.sequence),
            )
        })
    }

    async fn retry_summary(&self, writer_id: &str) -> Result<Option<RetrySummary>, StoreError> {
        self.with_rows(|rows| {
            RetrySummary::from_records(
                rows.values()
                    .filter(|record| record.writer_id == writer_id),
            )
        })
    }

    async fn ack_loss_sequences(&self, writer_id: &str) -> Result<Vec<u64>, StoreError> {
        self.with_rows(|rows| {
            rows.values()
                .filter(|record| record.writer_id == writer_id && record.is_ack_loss())
                .map(|record| record.sequence)
                .collect()
        })
    }

    async fn replica_sample(&self) -> Result<ReplicaSample, StoreError> {
        self.with_rows(|rows| ReplicaSample {
            rows: rows.len() as u64,
            max_sequence: rows.keys().map(|(_, sequence)| *sequence).max(),
        })
    }
}

#[async_trait]
impl ClusterController for MemoryCluster {
    async fn current_primary(&self) -> anyhow::Result<Endpoint> {
        self.primary_name()
            .map(Endpoint)
            .ok_or_else(|| anyhow::anyhow!("no primary elected"))
    }

    async fn delete_primary(&self, endpoint: &Endpoint) -> anyhow::Result<()> {
        let mut state = self.state();
        let index = state
            .node_index(&endpoint.0)
            .ok_or_else(|| anyhow::anyhow!("unknown node {endpoint}"))?;
        anyhow::ensure!(
            state.primary == Some(index),
            "{endpoint} is not the current primary"
        );
        let node = &mut state.nodes[index];
        node.up = false;
        node.generation += 1;
        state.primary = None;
        info!(node = %endpoint, "primary deleted");
        Ok(())
    }

    async fn wait_for_new_primary(
        &self,
        old: &Endpoint,
        max_wait: Duration,
    ) -> anyhow::Result<Option<Endpoint>> {
        if self.election_delay > max_wait {
            tokio::time::sleep(max_wait).await;
            return Ok(None);
        }
        tokio::time::sleep(self.election_delay).await;
        Ok(self.elect(old))
    }

    /// Restarts members from the highest index down, each staying down for
    /// the restart delay. Returns once every member is back.
    async fn rolling_restart(&self) -> anyhow::Result<()> {
        let members = self.state().nodes.len();
        for index in (0..members).rev() {
            self.stop_member(index);
            tokio::time::sleep(self.restart_delay).await;
            self.start_member(index);
        }
        Ok(())
    }

    async fn wait_for_rollout_complete(&self, _max_wait: Duration) -> anyhow::Result<bool> {
        let mut state = self.state();
        let Some(primary) = state.primary else {
            return Ok(false);
        };
        let rows = state.nodes[primary].rows.clone();
        for node in state.nodes.iter_mut().filter(|node| !node.up) {
            node.up = true;
            node.read_only = true;
            node.generation += 1;
            node.rows = rows.clone();
            info!(node = %node.name, "node restarted as replica");
        }
        Ok(true)
    }
}
