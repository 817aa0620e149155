//! Failover workload for PostgreSQL-wire clusters.
//!
//! `write` runs one sequenced writer until Ctrl-C, `verify` checks stored
//! sequences (and optionally replica agreement) after a disruption, and
//! `simulate` rehearses the whole failover flow against an in-process cluster.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use seqcheck::config::ENV_PG_URL;
use seqcheck::verifier::{ReplicaObservation, DEFAULT_REPLICA_TOLERANCE};
use seqcheck::{
    check_replica_consistency, run_drill, run_writer, sample_replicas,
    ConsistencyVerifier, DrillMode, DrillOptions, MemoryCluster, PgConnector, PgRecordSource,
    SequencedWriter, WriterConfig, WriterTimeouts,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// CLI entry point wrapper.
#[derive(Parser, Debug)]
#[command(name = "seqcheck-workload")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write one sequenced row per interval until interrupted.
    Write(WriteArgs),
    /// Check stored sequences for gaps, duplicates and replica drift.
    Verify(VerifyArgs),
    /// Run a failover or rolling-restart drill against an in-process cluster.
    Simulate(SimulateArgs),
}

/// Flags override the matching `SEQCHECK_*` environment variables.
#[derive(Parser, Debug, Clone)]
struct WriteArgs {
    /// Connection string of the write endpoint, e.g. `postgres://app@gateway/app`
    #[arg(long)]
    pg_url: Option<String>,

    /// Writer identity; defaults to `client-<hostname>`
    #[arg(long)]
    writer_id: Option<String>,

    /// Time between write attempts
    #[arg(long)]
    interval: Option<humantime::Duration>,

    #[arg(long)]
    connect_timeout: Option<humantime::Duration>,

    #[arg(long)]
    write_timeout: Option<humantime::Duration>,

    /// Log statistics every N ticks (0 disables)
    #[arg(long)]
    report_every: Option<u64>,

    /// Write the final statistics report as JSON
    #[arg(long)]
    report_out: Option<PathBuf>,
}

#[derive(Parser, Debug, Clone)]
struct VerifyArgs {
    /// Connection string of the primary (or gateway); falls back to `SEQCHECK_PG_URL`
    #[arg(long)]
    pg_url: Option<String>,

    /// Replica connection string; repeat per replica
    #[arg(long = "replica-url")]
    replica_urls: Vec<String>,

    /// Writer to verify; repeat per writer. Defaults to every writer found
    #[arg(long = "writer-id")]
    writer_ids: Vec<String>,

    /// Allowed row and max-sequence drift between replicas
    #[arg(long, default_value_t = DEFAULT_REPLICA_TOLERANCE)]
    tolerance: u64,

    #[arg(long, default_value = "5s")]
    connect_timeout: humantime::Duration,

    /// Write the verification report as JSON
    #[arg(long)]
    out: Option<PathBuf>,
}

/// Disruption rehearsed by `simulate`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
enum SimulateMode {
    Failover,
    RollingRestart,
}

impl SimulateMode {
    fn to_drill_mode(self) -> DrillMode {
        match self {
            SimulateMode::Failover => DrillMode::Failover,
            SimulateMode::RollingRestart => DrillMode::RollingRestart,
        }
    }
}

#[derive(Parser, Debug, Clone)]
struct SimulateArgs {
    #[arg(long, value_enum, default_value_t = SimulateMode::Failover)]
    mode: SimulateMode,

    #[arg(long, default_value_t = 3)]
    nodes: usize,

    #[arg(long, default_value_t = 2)]
    writers: usize,

    #[arg(long, default_value = "50ms")]
    interval: humantime::Duration,

    #[arg(long, default_value = "1s")]
    warmup: humantime::Duration,

    /// Time the simulated election takes
    #[arg(long, default_value = "300ms")]
    election_delay: humantime::Duration,

    /// Time each member stays down during a rolling restart
    #[arg(long, default_value = "200ms")]
    restart_delay: humantime::Duration,

    #[arg(long, default_value = "10s")]
    failover_timeout: humantime::Duration,

    #[arg(long, default_value = "1s")]
    stabilize: humantime::Duration,

    #[arg(long, default_value_t = DEFAULT_REPLICA_TOLERANCE)]
    tolerance: u64,

    /// Write the drill report as JSON
    #[arg(long)]
    out: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("seqcheck=info,seqcheck_workload=info,warn")),
        )
        .init();

    let args = Args::parse();
    match args.cmd {
        Command::Write(args) => write(args).await,
        Command::Verify(args) => verify(args).await,
        Command::Simulate(args) => simulate(args).await,
    }
}

async fn write(args: WriteArgs) -> anyhow::Result<()> {
    let config = writer_config(&args, WriterConfig::from_env()?);
    config.validate()?;

    let connector = PgConnector::new(&config.pg_url)?
        .with_host_probe_sql(config.host_probe_sql.clone())
        .with_connect_timeout(config.connect_timeout);
    let mut writer = SequencedWriter::start(connector, config.writer_id.clone(), config.timeouts())
        .await
        .context("writer startup")?;

    run_writer(&mut writer, &config.run_options(), tokio::signal::ctrl_c()).await;
    let report = writer.shutdown();
    if let Some(path) = &args.report_out {
        write_json(path, &report).context("write statistics report")?;
        eprintln!("wrote report: {}", path.display());
    }
    Ok(())
}

/// Applies CLI overrides on top of environment configuration.
fn writer_config(args: &WriteArgs, mut config: WriterConfig) -> WriterConfig {
    if let Some(url) = &args.pg_url {
        config.pg_url = url.clone();
    }
    if let Some(writer_id) = &args.writer_id {
        config.writer_id = writer_id.clone();
    }
    if let Some(timeout) = args.connect_timeout {
        config = config.with_connect_timeout(timeout.into());
    }
    if let Some(timeout) = args.write_timeout {
        config = config.with_write_timeout(timeout.into());
    }
    if let Some(interval) = args.interval {
        config = config.with_write_interval(interval.into());
    }
    if let Some(report_every) = args.report_every {
        config.report_every = report_every;
    }
    config
}

async fn verify(args: VerifyArgs) -> anyhow::Result<()> {
    let pg_url = args
        .pg_url
        .clone()
        .or_else(|| std::env::var(ENV_PG_URL).ok())
        .with_context(|| format!("--pg-url or {ENV_PG_URL} is required"))?;
    let connect_timeout: Duration = args.connect_timeout.into();
    let primary = PgRecordSource::connect(&pg_url, connect_timeout)
        .await
        .context("connect to primary")?;

    let replicas = if args.replica_urls.is_empty() {
        None
    } else {
        let mut reachable = Vec::with_capacity(args.replica_urls.len());
        let mut observations = Vec::new();
        for url in &args.replica_urls {
            match PgRecordSource::connect(url, connect_timeout).await {
                Ok(source) => reachable.push(source),
                Err(err) => {
                    error!(replica = %url, error = %err, "replica unreachable");
                    observations.push(ReplicaObservation::unreachable(url.as_str(), err));
                }
            }
        }
        observations.extend(sample_replicas(&reachable).await);
        Some(check_replica_consistency(observations, args.tolerance))
    };

    let verifier = ConsistencyVerifier::new(primary);
    let writer_ids = (!args.writer_ids.is_empty()).then_some(args.writer_ids.as_slice());
    let report = verifier.verify(writer_ids, replicas).await?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    if let Some(path) = &args.out {
        write_json(path, &report).context("write verification report")?;
        eprintln!("wrote report: {}", path.display());
    }
    anyhow::ensure!(report.passed, "verification failed");
    info!(writers = report.writers.len(), "verification passed");
    Ok(())
}

async fn simulate(args: SimulateArgs) -> anyhow::Result<()> {
    anyhow::ensure!(
        args.nodes > 1 || args.mode == SimulateMode::RollingRestart,
        "--nodes must be > 1 to fail over"
    );
    anyhow::ensure!(args.writers > 0, "--writers must be > 0");

    let interval: Duration = args.interval.into();
    let attempt_timeout = (interval / 2).max(Duration::from_millis(1));
    let options = DrillOptions {
        mode: args.mode.to_drill_mode(),
        writer_ids: (0..args.writers).map(|i| format!("sim-{i}")).collect(),
        write_interval: interval,
        timeouts: WriterTimeouts {
            connect: attempt_timeout,
            write: attempt_timeout,
        },
        warmup: args.warmup.into(),
        failover_timeout: args.failover_timeout.into(),
        stabilize: args.stabilize.into(),
        rollout_timeout: args.failover_timeout.into(),
        replica_tolerance: args.tolerance,
    };
    let cluster = MemoryCluster::new(args.nodes)
        .with_election_delay(args.election_delay.into())
        .with_restart_delay(args.restart_delay.into());
    let report = run_drill(
        &cluster,
        cluster.clone(),
        cluster.primary_view(),
        &cluster.replicas(),
        &options,
    )
    .await?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    if let Some(path) = &args.out {
        write_json(path, &report).context("write drill report")?;
        eprintln!("wrote report: {}", path.display());
    }
    anyhow::ensure!(report.passed(), "{} drill failed", report.mode);
    Ok(())
}

/// Serialize `value` as pretty JSON, creating parent directories.
fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create dir {}", parent.display()))?;
    }
    let data = serde_json::to_vec_pretty(value).context("serialize report")?;
    std::fs::write(path, data).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}
