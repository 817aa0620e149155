//! Fixed-cadence write loop with cooperative shutdown.

use std::future::Future;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::session::Connector;
use crate::stats::StatsReport;
use crate::writer::SequencedWriter;

/// Cadence and reporting for [`run_writer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    pub write_interval: Duration,
    /// Log a statistics report every N ticks; `0` disables periodic reports.
    pub report_every: u64,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            write_interval: Duration::from_secs(1),
            report_every: 10,
        }
    }
}

/// Ticks `writer` once per interval until `shutdown` resolves.
///
/// Shutdown is only observed between ticks, so an in-flight attempt always
/// completes (bounded by the writer's own timeouts). A late tick does not
/// cause a burst of catch-up writes.
pub async fn run_writer<C, F>(
    writer: &mut SequencedWriter<C>,
    options: &RunOptions,
    shutdown: F,
) -> StatsReport
where
    C: Connector,
    F: Future<Output = std::io::Result<()>>,
{
    tokio::pin!(shutdown);
    let mut interval = tokio::time::interval(options.write_interval.max(Duration::from_millis(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut ticks: u64 = 0;

    info!(
        writer_id = %writer.writer_id(),
        interval_ms = options.write_interval.as_millis() as u64,
        sequence = writer.cursor(),
        "write loop started"
    );
    loop {
        tokio::select! {
            biased;
            signal = &mut shutdown => {
                if let Err(err) = signal {
                    warn!(error = ?err, "shutdown signal failed, stopping anyway");
                }
                break;
            }
            _ = interval.tick() => {}
        }
        writer.tick().await;
        ticks += 1;
        if options.report_every > 0 && ticks % options.report_every == 0 {
            log_report(&writer.report());
        }
    }

    let report = writer.report();
    info!(writer_id = %report.writer_id, ticks, "write loop stopped");
    log_report(&report);
    report
}

/// Emits a report as structured fields plus its table rendering.
pub fn log_report(report: &StatsReport) {
    info!(
        writer_id = %report.writer_id,
        sequence = report.sequence,
        total_attempts = report.stats.total_attempts,
        successes = report.stats.successes,
        failures = report.stats.failures,
        connection_errors = report.stats.connection_errors,
        reconnections = report.stats.reconnections,
        read_only_rejections = report.stats.read_only_rejections,
        success_rate = report.success_rate,
        "statistics\n{report}"
    );
}
