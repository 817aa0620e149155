//! End-to-end disruption drills.
//!
//! Runs sequenced writers in background tasks and disrupts the cluster
//! through a [`ClusterController`]. A failover drill deletes the primary,
//! waits for a replacement, lets writes stabilise and waits for the rollout.
//! A rolling-restart drill restarts every member in turn and waits for the
//! rollout before letting writes stabilise. Both then stop the writers and
//! verify what was stored. The drill only sees the controller trait and the
//! record sources, so the same flow runs against the in-memory cluster or a
//! real deployment.

use std::fmt;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::cluster::{ClusterController, Endpoint};
use crate::runner::{run_writer, RunOptions};
use crate::session::Connector;
use crate::stats::{StatsDelta, StatsReport};
use crate::verifier::{
    check_replica_consistency, sample_replicas, ConsistencyVerifier, RecordSource,
    VerificationReport, DEFAULT_REPLICA_TOLERANCE,
};
use crate::writer::{SequencedWriter, WriterTimeouts};

/// Disruption applied once the writers are warm.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrillMode {
    /// Delete the primary and wait for a new one.
    #[default]
    Failover,
    /// Restart every member in turn.
    RollingRestart,
}

impl fmt::Display for DrillMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Failover => "failover",
            Self::RollingRestart => "rolling_restart",
        })
    }
}

/// Phase lengths and bounds for [`run_drill`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrillOptions {
    pub mode: DrillMode,
    pub writer_ids: Vec<String>,
    pub write_interval: Duration,
    pub timeouts: WriterTimeouts,
    /// Clean writing before the primary is deleted.
    pub warmup: Duration,
    /// Upper bound on the election of a new primary.
    pub failover_timeout: Duration,
    /// Writing after the election (or the rollout, when restarting), before
    /// stats are compared.
    pub stabilize: Duration,
    pub rollout_timeout: Duration,
    pub replica_tolerance: u64,
}

impl Default for DrillOptions {
    fn default() -> Self {
        Self {
            mode: DrillMode::Failover,
            writer_ids: vec!["drill-a".to_string(), "drill-b".to_string()],
            write_interval: Duration::from_secs(1),
            timeouts: WriterTimeouts::default(),
            warmup: Duration::from_secs(5),
            failover_timeout: Duration::from_secs(60),
            stabilize: Duration::from_secs(10),
            rollout_timeout: Duration::from_secs(120),
            replica_tolerance: DEFAULT_REPLICA_TOLERANCE,
        }
    }
}

impl DrillOptions {
    fn run_options(&self) -> RunOptions {
        RunOptions {
            write_interval: self.write_interval,
            report_every: 0,
        }
    }
}

/// What happened during one drill.
#[derive(Debug, Clone, Serialize)]
pub struct DrillReport {
    pub mode: DrillMode,
    pub old_primary: Endpoint,
    pub new_primary: Endpoint,
    /// Failover: time from deletion until a new primary was reported.
    /// Rolling restart: time from the restart request until the rollout ended.
    pub disruption_ms: u64,
    pub rollout_complete: bool,
    /// Per-writer behaviour from just before the disruption to the end of
    /// stabilisation.
    pub disruption_window: Vec<StatsDelta>,
    pub final_reports: Vec<StatsReport>,
    pub verification: VerificationReport,
}

impl DrillReport {
    /// The rollout finished and the stored records verified.
    pub fn passed(&self) -> bool {
        self.rollout_complete && self.verification.passed
    }
}

struct RunningWriter {
    reports: watch::Receiver<StatsReport>,
    handle: JoinHandle<StatsReport>,
}

/// Runs the drill selected by `options.mode`. Writers are always stopped
/// before this returns, including on the error paths after they started.
pub async fn run_drill<K, C, P, R>(
    controller: &K,
    connector: C,
    primary: P,
    replicas: &[R],
    options: &DrillOptions,
) -> Result<DrillReport>
where
    K: ClusterController,
    C: Connector + Clone + 'static,
    C::Session: 'static,
    P: RecordSource,
    R: RecordSource,
{
    let (stop_tx, stop_rx) = watch::channel(false);
    let mut writers = Vec::with_capacity(options.writer_ids.len());
    for writer_id in &options.writer_ids {
        let writer = SequencedWriter::start(connector.clone(), writer_id.clone(), options.timeouts)
            .await
            .with_context(|| format!("start writer {writer_id}"))?;
        writers.push(spawn_writer(writer, options.run_options(), stop_rx.clone()));
    }
    info!(writers = writers.len(), "drill writers started");

    let outcome = disrupt(controller, &writers, options).await;
    let _ = stop_tx.send(true);
    let mut final_reports = Vec::with_capacity(writers.len());
    for writer in writers {
        final_reports.push(writer.handle.await.context("join writer task")?);
    }
    let phase = outcome?;

    let observations = sample_replicas(replicas).await;
    let consistency = check_replica_consistency(observations, options.replica_tolerance);
    let verifier = ConsistencyVerifier::new(primary);
    let verification = verifier
        .verify(Some(options.writer_ids.as_slice()), Some(consistency))
        .await
        .context("verify stored sequences")?;

    let report = DrillReport {
        mode: options.mode,
        old_primary: phase.old_primary,
        new_primary: phase.new_primary,
        disruption_ms: phase.disruption_ms,
        rollout_complete: phase.rollout_complete,
        disruption_window: phase.disruption_window,
        final_reports,
        verification,
    };
    if report.passed() {
        info!(mode = %report.mode, disruption_ms = report.disruption_ms, "drill passed");
    } else {
        warn!(
            mode = %report.mode,
            disruption_ms = report.disruption_ms,
            rollout_complete = report.rollout_complete,
            verification_passed = report.verification.passed,
            "drill failed"
        );
    }
    Ok(report)
}

struct DisruptionPhase {
    old_primary: Endpoint,
    new_primary: Endpoint,
    disruption_ms: u64,
    rollout_complete: bool,
    disruption_window: Vec<StatsDelta>,
}

async fn disrupt<K: ClusterController>(
    controller: &K,
    writers: &[RunningWriter],
    options: &DrillOptions,
) -> Result<DisruptionPhase> {
    tokio::time::sleep(options.warmup).await;
    let before = latest_reports(writers);
    let old_primary = controller.current_primary().await.context("find primary")?;
    match options.mode {
        DrillMode::Failover => fail_over(controller, writers, options, before, old_primary).await,
        DrillMode::RollingRestart => {
            restart_members(controller, writers, options, before, old_primary).await
        }
    }
}

async fn fail_over<K: ClusterController>(
    controller: &K,
    writers: &[RunningWriter],
    options: &DrillOptions,
    before: Vec<StatsReport>,
    old_primary: Endpoint,
) -> Result<DisruptionPhase> {
    info!(primary = %old_primary, "deleting primary");
    controller
        .delete_primary(&old_primary)
        .await
        .with_context(|| format!("delete primary {old_primary}"))?;
    let deleted_at = Instant::now();

    let Some(new_primary) = controller
        .wait_for_new_primary(&old_primary, options.failover_timeout)
        .await
        .context("wait for new primary")?
    else {
        bail!(
            "no new primary elected within {}ms",
            options.failover_timeout.as_millis()
        );
    };
    let failover_ms = deleted_at.elapsed().as_millis() as u64;
    info!(old = %old_primary, new = %new_primary, failover_ms, "failover complete");

    tokio::time::sleep(options.stabilize).await;
    let disruption_window = window_deltas(writers, &before, options);
    let rollout_complete = wait_for_rollout(controller, options).await?;
    Ok(DisruptionPhase {
        old_primary,
        new_primary,
        disruption_ms: failover_ms,
        rollout_complete,
        disruption_window,
    })
}

async fn restart_members<K: ClusterController>(
    controller: &K,
    writers: &[RunningWriter],
    options: &DrillOptions,
    before: Vec<StatsReport>,
    old_primary: Endpoint,
) -> Result<DisruptionPhase> {
    info!(primary = %old_primary, "starting rolling restart");
    let started_at = Instant::now();
    controller.rolling_restart().await.context("rolling restart")?;
    let rollout_complete = wait_for_rollout(controller, options).await?;
    let disruption_ms = started_at.elapsed().as_millis() as u64;
    info!(disruption_ms, rollout_complete, "rolling restart finished");

    tokio::time::sleep(options.stabilize).await;
    let disruption_window = window_deltas(writers, &before, options);
    let new_primary = controller
        .current_primary()
        .await
        .context("find primary after restart")?;
    Ok(DisruptionPhase {
        old_primary,
        new_primary,
        disruption_ms,
        rollout_complete,
        disruption_window,
    })
}

async fn wait_for_rollout<K: ClusterController>(
    controller: &K,
    options: &DrillOptions,
) -> Result<bool> {
    let rollout_complete = controller
        .wait_for_rollout_complete(options.rollout_timeout)
        .await
        .context("wait for rollout")?;
    if !rollout_complete {
        warn!(
            timeout_ms = options.rollout_timeout.as_millis() as u64,
            "rollout did not complete in time"
        );
    }
    Ok(rollout_complete)
}

fn window_deltas(
    writers: &[RunningWriter],
    before: &[StatsReport],
    options: &DrillOptions,
) -> Vec<StatsDelta> {
    let deltas = latest_reports(writers)
        .iter()
        .zip(before)
        .map(|(after, before)| after.delta_since(before, options.write_interval))
        .collect::<Vec<_>>();
    for delta in &deltas {
        info!(
            mode = %options.mode,
            writer_id = %delta.writer_id,
            attempts = delta.attempts,
            failures = delta.failures,
            connection_errors = delta.connection_errors,
            reconnections = delta.reconnections,
            interruption_ms = delta.interruption_ms,
            success_rate = delta.success_rate,
            "client behaviour during disruption"
        );
    }
    deltas
}

fn spawn_writer<C>(
    mut writer: SequencedWriter<C>,
    run: RunOptions,
    mut stop: watch::Receiver<bool>,
) -> RunningWriter
where
    C: Connector + 'static,
    C::Session: 'static,
{
    let reports = writer.subscribe();
    let handle = tokio::spawn(async move {
        let shutdown = async move {
            // A dropped sender also stops the loop.
            let _ = stop.changed().await;
            Ok::<(), std::io::Error>(())
        };
        run_writer(&mut writer, &run, shutdown).await;
        writer.shutdown()
    });
    RunningWriter { reports, handle }
}

fn latest_reports(writers: &[RunningWriter]) -> Vec<StatsReport> {
    writers
        .iter()
        .map(|writer| writer.reports.borrow().clone())
        .collect()
}
