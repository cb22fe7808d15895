//! Postgres audit sink
//!
//! Append-only `query_log` table, one row per pipeline request. Reads come
//! back newest first for the operator feed.

use crate::audit::{AuditRecord, AuditSink, AuditWriteError, RequestSource};
use crate::pipeline::types::PipelineStatus;
use async_trait::async_trait;
use deadpool_postgres::Pool;
use tokio_postgres::Row;
use tracing::info;

pub struct PgAuditSink {
    pool: Pool,
}

impl PgAuditSink {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Create the audit table if it does not exist yet.
    pub async fn ensure_table(&self) -> Result<(), AuditWriteError> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| AuditWriteError::Unavailable(e.to_string()))?;

        client
            .execute(
                "CREATE TABLE IF NOT EXISTS query_log (
                    id UUID PRIMARY KEY,
                    session_id UUID NOT NULL,
                    role TEXT NOT NULL,
                    intent_text TEXT NOT NULL,
                    final_artifact_text TEXT NOT NULL,
                    artifact_checksum TEXT NOT NULL,
                    validated BOOLEAN NOT NULL,
                    table_accessed TEXT,
                    rows_returned BIGINT NOT NULL,
                    was_repaired BOOLEAN NOT NULL,
                    repair_diff TEXT NOT NULL,
                    ts TIMESTAMPTZ NOT NULL,
                    status TEXT NOT NULL,
                    source TEXT NOT NULL
                )",
                &[],
            )
            .await
            .map_err(|e| AuditWriteError::Write(e.to_string()))?;

        client
            .execute(
                "CREATE INDEX IF NOT EXISTS idx_query_log_ts ON query_log(ts DESC)",
                &[],
            )
            .await
            .map_err(|e| AuditWriteError::Write(e.to_string()))?;

        info!("audit table ready");
        Ok(())
    }
}

fn row_to_record(row: &Row) -> Result<AuditRecord, AuditWriteError> {
    let status: String = row.get("status");
    let source: String = row.get("source");
    let rows_returned: i64 = row.get("rows_returned");

    Ok(AuditRecord {
        id: row.get("id"),
        session_id: row.get("session_id"),
        role: row.get("role"),
        intent_text: row.get("intent_text"),
        final_artifact_text: row.get("final_artifact_text"),
        artifact_checksum: row.get("artifact_checksum"),
        validated: row.get("validated"),
        table_accessed: row.get("table_accessed"),
        rows_returned: rows_returned.max(0) as u64,
        was_repaired: row.get("was_repaired"),
        repair_diff: row.get("repair_diff"),
        timestamp: row.get("ts"),
        status: status
            .parse::<PipelineStatus>()
            .map_err(AuditWriteError::Write)?,
        source: source
            .parse::<RequestSource>()
            .map_err(AuditWriteError::Write)?,
    })
}

#[async_trait]
impl AuditSink for PgAuditSink {
    async fn record(&self, record: &AuditRecord) -> Result<(), AuditWriteError> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| AuditWriteError::Unavailable(e.to_string()))?;

        client
            .execute(
                "INSERT INTO query_log (
                    id, session_id, role, intent_text, final_artifact_text,
                    artifact_checksum, validated, table_accessed, rows_returned,
                    was_repaired, repair_diff, ts, status, source
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
                &[
                    &record.id,
                    &record.session_id,
                    &record.role,
                    &record.intent_text,
                    &record.final_artifact_text,
                    &record.artifact_checksum,
                    &record.validated,
                    &record.table_accessed,
                    &(record.rows_returned as i64),
                    &record.was_repaired,
                    &record.repair_diff,
                    &record.timestamp,
                    &record.status.as_str(),
                    &record.source.as_str(),
                ],
            )
            .await
            .map_err(|e| AuditWriteError::Write(e.to_string()))?;

        Ok(())
    }

    async fn fetch_recent(&self, limit: usize) -> Result<Vec<AuditRecord>, AuditWriteError> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| AuditWriteError::Unavailable(e.to_string()))?;

        let rows = client
            .query(
                "SELECT id, session_id, role, intent_text, final_artifact_text,
                        artifact_checksum, validated, table_accessed, rows_returned,
                        was_repaired, repair_diff, ts, status, source
                 FROM query_log
                 ORDER BY ts DESC
                 LIMIT $1",
                &[&(limit as i64)],
            )
            .await
            .map_err(|e| AuditWriteError::Write(e.to_string()))?;

        rows.iter().map(row_to_record).collect()
    }
}
