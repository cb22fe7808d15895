//! In-memory audit sink
//!
//! Default sink when no database is configured, and the sink the test suite
//! asserts against.

use crate::audit::{AuditRecord, AuditSink, AuditWriteError};
use async_trait::async_trait;
use tokio::sync::RwLock;

pub struct MemoryAuditSink {
    log: RwLock<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self {
            log: RwLock::new(Vec::new()),
        }
    }

    /// Total records ever appended.
    pub async fn len(&self) -> usize {
        self.log.read().await.len()
    }
}

impl Default for MemoryAuditSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, record: &AuditRecord) -> Result<(), AuditWriteError> {
        let mut log = self.log.write().await;
        log.push(record.clone());
        Ok(())
    }

    async fn fetch_recent(&self, limit: usize) -> Result<Vec<AuditRecord>, AuditWriteError> {
        let log = self.log.read().await;
        Ok(log.iter().rev().take(limit).cloned().collect())
    }
}
