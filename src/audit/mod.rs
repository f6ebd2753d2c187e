//! Audit log for finalized decisions
//!
//! Every completed instance leaves one entry holding its frozen record and a
//! SHA-256 digest of that record, so tampering can be detected later.

use crate::models::FinalRecord;
use crate::Result;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub audit_id: Uuid,
    pub instance_id: Uuid,
    pub record: Arc<FinalRecord>,
    pub record_hash: String,
    pub recorded_at: DateTime<Utc>,
}

/// Audit trail storage, one entry per instance
pub struct AuditLog {
    entries: Arc<RwLock<HashMap<Uuid, AuditEntry>>>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Store the final record for an instance. Recording the same instance
    /// again returns the existing entry unchanged.
    pub async fn record(&self, instance_id: Uuid, record: &FinalRecord) -> Result<AuditEntry> {
        let mut entries = self.entries.write().await;

        if let Some(existing) = entries.get(&instance_id) {
            debug!(%instance_id, "Audit entry already present");
            return Ok(existing.clone());
        }

        let entry = AuditEntry {
            audit_id: Uuid::new_v4(),
            instance_id,
            record: Arc::new(record.clone()),
            record_hash: compute_record_hash(record),
            recorded_at: Utc::now(),
        };
        entries.insert(instance_id, entry.clone());
        Ok(entry)
    }

    /// Recompute the digest of a stored record and compare.
    pub async fn verify_integrity(&self, instance_id: Uuid) -> Result<bool> {
        let entries = self.entries.read().await;

        Ok(entries
            .get(&instance_id)
            .map(|entry| compute_record_hash(&entry.record) == entry.record_hash)
            .unwrap_or(false))
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new()
    }
}

/// SHA-256 over the record's JSON, streamed straight into the hasher.
pub fn compute_record_hash(record: &FinalRecord) -> String {
    let mut hasher = Sha256::new();

    if serde_json::to_writer(&mut HashWriter(&mut hasher), record).is_err() {
        return String::new();
    }

    hex::encode(hasher.finalize())
}

/// Adapter to allow writing into Sha256 via std::io::Write
struct HashWriter<'a, H: Digest>(&'a mut H);

impl<'a, H: Digest> Write for HashWriter<'a, H> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
