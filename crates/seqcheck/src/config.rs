//! Writer configuration loaded from `SEQCHECK_*` environment variables.

use std::time::Duration;

use anyhow::{ensure, Context, Result};

use crate::postgres::DEFAULT_HOST_PROBE_SQL;
use crate::runner::RunOptions;
use crate::writer::WriterTimeouts;

/// Connection string of the write endpoint.
pub const ENV_PG_URL: &str = "SEQCHECK_PG_URL";
pub const ENV_WRITER_ID: &str = "SEQCHECK_WRITER_ID";
/// Milliseconds between write attempts.
pub const ENV_WRITE_INTERVAL_MS: &str = "SEQCHECK_WRITE_INTERVAL_MS";
pub const ENV_CONNECT_TIMEOUT_MS: &str = "SEQCHECK_CONNECT_TIMEOUT_MS";
pub const ENV_WRITE_TIMEOUT_MS: &str = "SEQCHECK_WRITE_TIMEOUT_MS";
pub const ENV_REPORT_EVERY: &str = "SEQCHECK_REPORT_EVERY";
/// Query whose first column names the serving member.
pub const ENV_HOST_PROBE_SQL: &str = "SEQCHECK_HOST_PROBE_SQL";

const DEFAULT_PG_URL: &str = "postgres://postgres@localhost:5432/postgres";
const DEFAULT_WRITE_INTERVAL_MS: u64 = 1_000;
const DEFAULT_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_REPORT_EVERY: u64 = 10;

/// Everything a long-running writer process needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriterConfig {
    /// Connection string for the write endpoint (a gateway, not a fixed node).
    pub pg_url: String,
    pub writer_id: String,
    pub write_interval: Duration,
    pub connect_timeout: Duration,
    pub write_timeout: Duration,
    /// Ticks between periodic statistics reports.
    pub report_every: u64,
    /// Query naming the member that served a write.
    pub host_probe_sql: String,
    connect_timeout_set: bool,
    write_timeout_set: bool,
}

impl WriterConfig {
    /// Loads configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Loads configuration through `lookup`, which maps a variable name to its
    /// value. Unset timeouts default to 5s, capped at three quarters of the
    /// write interval.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let pg_url = lookup(ENV_PG_URL).unwrap_or_else(|| DEFAULT_PG_URL.to_string());
        let writer_id = lookup(ENV_WRITER_ID)
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(default_writer_id);
        let write_interval_ms = parse_u64(
            ENV_WRITE_INTERVAL_MS,
            lookup(ENV_WRITE_INTERVAL_MS),
            DEFAULT_WRITE_INTERVAL_MS,
        )?;
        let write_interval = Duration::from_millis(write_interval_ms);
        let connect_timeout = lookup(ENV_CONNECT_TIMEOUT_MS)
            .map(|raw| parse_u64(ENV_CONNECT_TIMEOUT_MS, Some(raw), 0))
            .transpose()?
            .map(Duration::from_millis);
        let write_timeout = lookup(ENV_WRITE_TIMEOUT_MS)
            .map(|raw| parse_u64(ENV_WRITE_TIMEOUT_MS, Some(raw), 0))
            .transpose()?
            .map(Duration::from_millis);
        let report_every = parse_u64(
            ENV_REPORT_EVERY,
            lookup(ENV_REPORT_EVERY),
            DEFAULT_REPORT_EVERY,
        )?;
        let host_probe_sql =
            lookup(ENV_HOST_PROBE_SQL).unwrap_or_else(|| DEFAULT_HOST_PROBE_SQL.to_string());

        Ok(Self {
            pg_url,
            writer_id,
            write_interval,
            connect_timeout: connect_timeout.unwrap_or_else(|| default_timeout(write_interval)),
            write_timeout: write_timeout.unwrap_or_else(|| default_timeout(write_interval)),
            report_every,
            host_probe_sql,
            connect_timeout_set: connect_timeout.is_some(),
            write_timeout_set: write_timeout.is_some(),
        })
    }

    /// Changes the write interval. Timeouts that were never set explicitly
    /// are recomputed against the new interval.
    pub fn with_write_interval(mut self, interval: Duration) -> Self {
        self.write_interval = interval;
        if !self.connect_timeout_set {
            self.connect_timeout = default_timeout(interval);
        }
        if !self.write_timeout_set {
            self.write_timeout = default_timeout(interval);
        }
        self
    }

    /// Sets the connect bound; later interval changes keep it.
    pub fn with_connect_timeout(mut self, limit: Duration) -> Self {
        self.connect_timeout = limit;
        self.connect_timeout_set = true;
        self
    }

    /// Sets the apply bound; later interval changes keep it.
    pub fn with_write_timeout(mut self, limit: Duration) -> Self {
        self.write_timeout = limit;
        self.write_timeout_set = true;
        self
    }

    /// Rejects settings under which a tick could overrun its interval.
    pub fn validate(&self) -> Result<()> {
        ensure!(!self.writer_id.trim().is_empty(), "writer id must not be empty");
        ensure!(!self.write_interval.is_zero(), "write interval must be positive");
        ensure!(
            self.connect_timeout < self.write_interval,
            "connect timeout {:?} must be shorter than the write interval {:?}",
            self.connect_timeout,
            self.write_interval
        );
        ensure!(
            self.write_timeout < self.write_interval,
            "write timeout {:?} must be shorter than the write interval {:?}",
            self.write_timeout,
            self.write_interval
        );
        Ok(())
    }

    /// Per-attempt bounds handed to the writer.
    pub fn timeouts(&self) -> WriterTimeouts {
        WriterTimeouts {
            connect: self.connect_timeout,
            write: self.write_timeout,
        }
    }

    /// Loop cadence and report frequency.
    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            write_interval: self.write_interval,
            report_every: self.report_every,
        }
    }
}

/// `client-<hostname>`, falling back to `client-<pid>` when no hostname is
/// known.
pub fn default_writer_id() -> String {
    let hostname = std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty());
    match hostname {
        Some(name) => format!("client-{name}"),
        None => format!("client-{}", std::process::id()),
    }
}

/// 5s, capped at three quarters of `interval` and never zero.
fn default_timeout(interval: Duration) -> Duration {
    let quarter_ms = (interval.as_millis() / 4).min(u128::from(u64::MAX)) as u64;
    let cap = quarter_ms.saturating_mul(3);
    Duration::from_millis(DEFAULT_TIMEOUT_MS.min(cap).max(1))
}

fn parse_u64(name: &str, value: Option<String>, default_value: u64) -> Result<u64> {
    match value {
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .with_context(|| format!("invalid u64 value for {name}: {raw}")),
        None => Ok(default_value),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>();
        move |name: &str| vars.get(name).cloned()
    }

    #[test]
    fn defaults_fit_inside_the_interval() {
        let config = WriterConfig::from_lookup(lookup(&[(ENV_WRITER_ID, "c1")])).unwrap();
        assert_eq!(config.writer_id, "c1");
        assert_eq!(config.write_interval, Duration::from_secs(1));
        assert_eq!(config.connect_timeout, Duration::from_millis(750));
        assert_eq!(config.write_timeout, Duration::from_millis(750));
        assert_eq!(config.report_every, 10);
        assert_eq!(config.host_probe_sql, DEFAULT_HOST_PROBE_SQL);
        config.validate().unwrap();
    }

    #[test]
    fn explicit_values_are_parsed() {
        let config = WriterConfig::from_lookup(lookup(&[
            (ENV_PG_URL, "host=gateway user=app"),
            (ENV_WRITER_ID, "writer-a"),
            (ENV_WRITE_INTERVAL_MS, "10000"),
            (ENV_CONNECT_TIMEOUT_MS, "2000"),
            (ENV_WRITE_TIMEOUT_MS, "3000"),
            (ENV_REPORT_EVERY, "5"),
        ]))
        .unwrap();
        assert_eq!(config.pg_url, "host=gateway user=app");
        assert_eq!(config.connect_timeout, Duration::from_secs(2));
        assert_eq!(config.timeouts().write, Duration::from_secs(3));
        assert_eq!(config.run_options().report_every, 5);
        config.validate().unwrap();
    }

    #[test]
    fn timeouts_must_be_shorter_than_the_interval() {
        let config = WriterConfig::from_lookup(lookup(&[
            (ENV_WRITER_ID, "c1"),
            (ENV_WRITE_INTERVAL_MS, "500"),
            (ENV_WRITE_TIMEOUT_MS, "500"),
        ]))
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn interval_change_rescales_unset_timeouts() {
        let config = WriterConfig::from_lookup(lookup(&[(ENV_WRITER_ID, "c1")]))
            .unwrap()
            .with_write_interval(Duration::from_millis(500));
        assert_eq!(config.connect_timeout, Duration::from_millis(375));
        assert_eq!(config.write_timeout, Duration::from_millis(375));
        config.validate().unwrap();

        let config = WriterConfig::from_lookup(lookup(&[(ENV_WRITE_INTERVAL_MS, "60000")]))
            .unwrap()
            .with_write_interval(Duration::from_secs(30));
        assert_eq!(config.write_timeout, Duration::from_secs(5));
    }

    #[test]
    fn explicit_timeouts_survive_interval_change() {
        let config = WriterConfig::from_lookup(lookup(&[
            (ENV_WRITER_ID, "c1"),
            (ENV_CONNECT_TIMEOUT_MS, "200"),
        ]))
        .unwrap()
        .with_write_timeout(Duration::from_millis(100))
        .with_write_interval(Duration::from_millis(400));
        assert_eq!(config.connect_timeout, Duration::from_millis(200));
        assert_eq!(config.write_timeout, Duration::from_millis(100));
        assert_eq!(config.write_interval, Duration::from_millis(400));
    }

    #[test]
    fn malformed_numbers_are_errors() {
        let err = WriterConfig::from_lookup(lookup(&[(ENV_WRITE_INTERVAL_MS, "soon")]))
            .unwrap_err();
        assert!(err.to_string().contains(ENV_WRITE_INTERVAL_MS));
    }

    #[test]
    fn blank_writer_id_falls_back_to_default() {
        let config = WriterConfig::from_lookup(lookup(&[(ENV_WRITER_ID, "  ")])).unwrap();
        assert!(config.writer_id.starts_with("client-"));
    }
}
