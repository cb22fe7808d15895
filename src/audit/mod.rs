//! Audit Recorder
//!
//! One record per top-level request, written synchronously before the result
//! is handed back to the caller. A failed write never fails the request
//! (availability over audit-completeness) but is surfaced to operators via
//! the error log and a dropped-write counter.

pub mod memory;
pub mod postgres;

use crate::pipeline::types::PipelineStatus;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::error;
use uuid::Uuid;

pub use memory::MemoryAuditSink;
pub use postgres::PgAuditSink;

/// Where a request entered the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestSource {
    Chat,
    Factory,
}

impl RequestSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestSource::Chat => "chat",
            RequestSource::Factory => "factory",
        }
    }
}

impl std::str::FromStr for RequestSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "chat" => Ok(RequestSource::Chat),
            "factory" => Ok(RequestSource::Factory),
            other => Err(format!("unknown request source '{other}'")),
        }
    }
}

/// The one entity that outlives a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub id: Uuid,
    pub session_id: Uuid,
    pub role: String,
    pub intent_text: String,
    pub final_artifact_text: String,
    /// SHA-256 of the final artifact, for tamper-evident feeds.
    pub artifact_checksum: String,
    pub validated: bool,
    pub table_accessed: Option<String>,
    pub rows_returned: u64,
    pub was_repaired: bool,
    pub repair_diff: String,
    pub timestamp: DateTime<Utc>,
    pub status: PipelineStatus,
    pub source: RequestSource,
}

#[derive(Error, Debug)]
pub enum AuditWriteError {
    #[error("audit sink unavailable: {0}")]
    Unavailable(String),

    #[error("audit write failed: {0}")]
    Write(String),
}

/// Append-only audit store. `fetch_recent` returns newest first.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, record: &AuditRecord) -> Result<(), AuditWriteError>;
    async fn fetch_recent(&self, limit: usize) -> Result<Vec<AuditRecord>, AuditWriteError>;
}

/// Wraps the configured sink with the operational-error channel: write
/// failures are logged and counted, never propagated to the request path.
pub struct AuditRecorder {
    sink: Arc<dyn AuditSink>,
    dropped_writes: AtomicU64,
}

impl AuditRecorder {
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self {
            sink,
            dropped_writes: AtomicU64::new(0),
        }
    }

    /// Persist one record. Must complete before the caller sees a result.
    pub async fn record(&self, record: &AuditRecord) {
        if let Err(e) = self.sink.record(record).await {
            self.dropped_writes.fetch_add(1, Ordering::Relaxed);
            error!(
                audit_id = %record.id,
                session_id = %record.session_id,
                status = record.status.as_str(),
                "audit write failed: {e}"
            );
        }
    }

    pub async fn fetch_recent(&self, limit: usize) -> Result<Vec<AuditRecord>, AuditWriteError> {
        self.sink.fetch_recent(limit).await
    }

    /// Number of audit records lost to sink failures since startup.
    pub fn dropped_writes(&self) -> u64 {
        self.dropped_writes.load(Ordering::Relaxed)
    }
}

/// Hex SHA-256 of an artifact's text.
pub fn artifact_checksum(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}
