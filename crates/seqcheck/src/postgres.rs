//! PostgreSQL-wire backend built on `tokio-postgres`.
//!
//! Each session owns one client plus the task driving its connection; the
//! task is aborted when the session is dropped. Nothing is pooled or cached.

use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_postgres::config::Host;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, Config, NoTls};
use tracing::debug;

use crate::error::{ApplyError, ApplyErrorKind, ConnectionError, StoreError};
use crate::record::{
    attempt_count_to_sql, count_from_sql, sequence_from_sql, sequence_to_sql, SequenceWrite,
    ACK_LOSS_SQL, MAX_SEQUENCE_SQL, REPLICA_SAMPLE_SQL, RETRY_SUMMARY_SQL, SCHEMA_SQL,
    SEQUENCE_SUMMARY_SQL, UPSERT_SQL, WRITER_IDS_SQL,
};
use crate::session::{Connector, Session};
use crate::verifier::{RecordSource, ReplicaSample, RetrySummary, SequenceSummary};

/// Query used to name the member that served a write.
pub const DEFAULT_HOST_PROBE_SQL: &str = "SELECT inet_server_addr()::text";

/// Opens a fresh PostgreSQL connection per acquire.
#[derive(Clone, Debug)]
pub struct PgConnector {
    config: Config,
    endpoint: String,
    host_probe_sql: String,
}

impl PgConnector {
    /// Parses a libpq-style connection string or `postgres://` URL.
    pub fn new(url: &str) -> anyhow::Result<Self> {
        let config = url
            .parse::<Config>()
            .map_err(|err| anyhow::anyhow!("invalid connection string: {err}"))?;
        let endpoint = describe_endpoint(&config);
        Ok(Self {
            config,
            endpoint,
            host_probe_sql: DEFAULT_HOST_PROBE_SQL.to_string(),
        })
    }

    /// Replaces the query used to fill `origin_host`.
    pub fn with_host_probe_sql(mut self, sql: impl Into<String>) -> Self {
        self.host_probe_sql = sql.into();
        self
    }

    /// Also bounds the driver's own connect phase.
    pub fn with_connect_timeout(mut self, limit: Duration) -> Self {
        self.config.connect_timeout(limit);
        self
    }

    async fn connect(&self) -> Result<(Client, JoinHandle<()>), tokio_postgres::Error> {
        let (client, connection) = self.config.connect(NoTls).await?;
        let endpoint = self.endpoint.clone();
        let driver = tokio::spawn(async move {
            if let Err(err) = connection.await {
                debug!(endpoint = %endpoint, error = %err, "postgres connection closed");
            }
        });
        Ok((client, driver))
    }
}

#[async_trait]
impl Connector for PgConnector {
    type Session = PgSession;

    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }

    async fn acquire(&self) -> Result<PgSession, ConnectionError> {
        let (client, driver) = self
            .connect()
            .await
            .map_err(|err| ConnectionError::failed(self.endpoint.clone(), error_text(&err)))?;
        Ok(PgSession {
            client,
            driver,
            host_probe_sql: self.host_probe_sql.clone(),
        })
    }
}

/// One PostgreSQL connection owned by a writer.
pub struct PgSession {
    client: Client,
    driver: JoinHandle<()>,
    host_probe_sql: String,
}

impl Drop for PgSession {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

#[async_trait]
impl Session for PgSession {
    async fn is_alive(&mut self) -> bool {
        !self.client.is_closed() && self.client.simple_query("SELECT 1").await.is_ok()
    }

    async fn origin_host(&mut self) -> Option<String> {
        match self.client.query_opt(self.host_probe_sql.as_str(), &[]).await {
            Ok(Some(row)) => row.try_get::<_, Option<String>>(0).ok().flatten(),
            _ => None,
        }
    }

    async fn ensure_schema(&mut self) -> Result<(), ApplyError> {
        self.client
            .batch_execute(SCHEMA_SQL)
            .await
            .map_err(|err| apply_error(&err))
    }

    async fn max_sequence(&mut self, writer_id: &str) -> Result<Option<u64>, ApplyError> {
        let row = self
            .client
            .query_one(MAX_SEQUENCE_SQL, &[&writer_id])
            .await
            .map_err(|err| apply_error(&err))?;
        let max: Option<i64> = row.try_get(0).map_err(|err| apply_error(&err))?;
        max.map(sequence_from_sql)
            .transpose()
            .map_err(|err| ApplyError::rejected(err.to_string()))
    }

    async fn upsert(&mut self, write: &SequenceWrite) -> Result<(), ApplyError> {
        let sequence =
            sequence_to_sql(write.sequence).map_err(|err| ApplyError::rejected(err.to_string()))?;
        let attempt_count = attempt_count_to_sql(write.attempt_count)
            .map_err(|err| ApplyError::rejected(err.to_string()))?;
        self.client
            .execute(
                UPSERT_SQL,
                &[
                    &write.writer_id,
                    &sequence,
                    &write.write_time,
                    &write.origin_host,
                    &attempt_count,
                    &write.first_attempt_time,
                ],
            )
            .await
            .map(|_| ())
            .map_err(|err| apply_error(&err))
    }
}

/// Read-only verifier access over its own connection.
pub struct PgRecordSource {
    name: String,
    client: Client,
    driver: JoinHandle<()>,
}

impl PgRecordSource {
    /// Connects within `timeout`; failures surface as [`StoreError::Unavailable`].
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self, StoreError> {
        let connector = PgConnector::new(url)
            .map_err(|err| StoreError::Query(err.to_string()))?
            .with_connect_timeout(timeout);
        let name = connector.endpoint.clone();
        let (client, driver) = match tokio::time::timeout(timeout, connector.connect()).await {
            Ok(Ok(connected)) => connected,
            Ok(Err(err)) => {
                return Err(StoreError::Unavailable {
                    source_name: name,
                    cause: error_text(&err),
                })
            }
            Err(_) => {
                return Err(StoreError::Unavailable {
                    source_name: name,
                    cause: format!("connect timed out after {}ms", timeout.as_millis()),
                })
            }
        };
        Ok(Self {
            name,
            client,
            driver,
        })
    }
}

impl Drop for PgRecordSource {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

#[async_trait]
impl RecordSource for PgRecordSource {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn writer_ids(&self) -> Result<Vec<String>, StoreError> {
        let rows = self
            .client
            .query(WRITER_IDS_SQL, &[])
            .await
            .map_err(|err| query_error(&err))?;
        rows.iter()
            .map(|row| row.try_get::<_, String>(0).map_err(|err| query_error(&err)))
            .collect()
    }

    async fn sequence_summary(
        &self,
        writer_id: &str,
    ) -> Result<Option<SequenceSummary>, StoreError> {
        let Some(row) = self
            .client
            .query_opt(SEQUENCE_SUMMARY_SQL, &[&writer_id])
            .await
            .map_err(|err| query_error(&err))?
        else {
            return Ok(None);
        };
        let min: i64 = row.try_get(0).map_err(|err| query_error(&err))?;
        let max: i64 = row.try_get(1).map_err(|err| query_error(&err))?;
        let total: i64 = row.try_get(2).map_err(|err| query_error(&err))?;
        let unique: i64 = row.try_get(3).map_err(|err| query_error(&err))?;
        Ok(Some(SequenceSummary {
            min_seq: sequence_from_sql(min)?,
            max_seq: sequence_from_sql(max)?,
            total_rows: count_from_sql("total_rows", total)?,
            unique_seqs: count_from_sql("unique_seqs", unique)?,
        }))
    }

    async fn retry_summary(&self, writer_id: &str) -> Result<Option<RetrySummary>, StoreError> {
        let Some(row) = self
            .client
            .query_opt(RETRY_SUMMARY_SQL, &[&writer_id])
            .await
            .map_err(|err| query_error(&err))?
        else {
            return Ok(None);
        };
        let max_attempts: i32 = row.try_get(0).map_err(|err| query_error(&err))?;
        let max_apply_count: i32 = row.try_get(1).map_err(|err| query_error(&err))?;
        let ack_loss_rows: i64 = row.try_get(2).map_err(|err| query_error(&err))?;
        Ok(Some(RetrySummary {
            max_attempts: count_from_sql("attempt_count", max_attempts.into())? as u32,
            max_apply_count: count_from_sql("apply_count", max_apply_count.into())? as u32,
            rows_with_apply_count_gt1: count_from_sql("apply_count", ack_loss_rows)?,
        }))
    }

    async fn ack_loss_sequences(&self, writer_id: &str) -> Result<Vec<u64>, StoreError> {
        let rows = self
            .client
            .query(ACK_LOSS_SQL, &[&writer_id])
            .await
            .map_err(|err| query_error(&err))?;
        rows.iter()
            .map(|row| {
                let sequence: i64 = row.try_get(0).map_err(|err| query_error(&err))?;
                sequence_from_sql(sequence)
            })
            .collect()
    }

    async fn replica_sample(&self) -> Result<ReplicaSample, StoreError> {
        let row = self
            .client
            .query_one(REPLICA_SAMPLE_SQL, &[])
            .await
            .map_err(|err| query_error(&err))?;
        let rows: i64 = row.try_get(0).map_err(|err| query_error(&err))?;
        let max: Option<i64> = row.try_get(1).map_err(|err| query_error(&err))?;
        Ok(ReplicaSample {
            rows: count_from_sql("rows", rows)?,
            max_sequence: max.map(sequence_from_sql).transpose()?,
        })
    }
}

fn apply_error(err: &tokio_postgres::Error) -> ApplyError {
    classify(err.code(), err.as_db_error().is_some(), &error_text(err))
}

/// Maps a driver failure onto the apply taxonomy. SQLSTATE 25006 and any
/// "read-only" server message both classify as [`ApplyErrorKind::ReadOnly`];
/// other server answers are rejections and everything else is transport.
pub fn classify(code: Option<&SqlState>, is_db_error: bool, text: &str) -> ApplyError {
    if code == Some(&SqlState::READ_ONLY_SQL_TRANSACTION) {
        return ApplyError::new(ApplyErrorKind::ReadOnly, text);
    }
    if is_db_error {
        return ApplyError::rejected(text);
    }
    ApplyError::transport(text)
}

fn query_error(err: &tokio_postgres::Error) -> StoreError {
    StoreError::Query(error_text(err))
}

/// Server message when present; the driver's `Display` alone is just "db error".
fn error_text(err: &tokio_postgres::Error) -> String {
    match err.as_db_error() {
        Some(db) => format!("{}: {}", db.code().code(), db.message()),
        None => err.to_string(),
    }
}

fn describe_endpoint(config: &Config) -> String {
    let ports = config.get_ports();
    let hosts = config
        .get_hosts()
        .iter()
        .enumerate()
        .map(|(index, host)| {
            let host = match host {
                Host::Tcp(name) => name.clone(),
                #[cfg(unix)]
                Host::Unix(path) => path.display().to_string(),
            };
            let port = ports
                .get(index)
                .or_else(|| ports.first())
                .copied()
                .unwrap_or(5432);
            format!("{host}:{port}")
        })
        .collect::<Vec<_>>();
    if hosts.is_empty() {
        "localhost:5432".to_string()
    } else {
        hosts.join(",")
    }
}
