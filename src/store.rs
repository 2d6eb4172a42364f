//! Collaborator seams: the relational store and the audit log live
//! outside the core; the pipeline only sees these two narrow traits.

use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::entities::Status;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DocumentRecord {
    pub doc_id: Uuid,
    pub filename: String,
    pub path: PathBuf,
    pub bytes: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InvoiceRecord {
    pub doc_id: Uuid,
    pub supplier: Option<String>,
    pub date: Option<chrono::NaiveDate>,
    pub value: Option<f64>,
    pub status: Status,
    pub confidence: f32,
}

pub trait Store: Send + Sync {
    fn put_document(&self, record: &DocumentRecord) -> anyhow::Result<()>;
    fn upsert_invoice(&self, record: &InvoiceRecord) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub ts: DateTime<Utc>,
    pub actor: String,
    pub op: String,
    pub payload: Value,
}

impl AuditEvent {
    pub fn now(actor: &str, op: &str, payload: Value) -> Self {
        Self {
            ts: Utc::now(),
            actor: actor.to_owned(),
            op: op.to_owned(),
            payload,
        }
    }
}

pub trait Audit: Send + Sync {
    fn append(&self, event: AuditEvent);
}

/// Defaults for hosts that do not persist.
#[derive(Debug, Default)]
pub struct NoopStore;

impl Store for NoopStore {
    fn put_document(&self, _record: &DocumentRecord) -> anyhow::Result<()> {
        Ok(())
    }

    fn upsert_invoice(&self, _record: &InvoiceRecord) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct NoopAudit;

impl Audit for NoopAudit {
    fn append(&self, _event: AuditEvent) {}
}

/// In-memory collaborators for tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    pub documents: Mutex<Vec<DocumentRecord>>,
    pub invoices: Mutex<Vec<InvoiceRecord>>,
}

impl Store for MemoryStore {
    fn put_document(&self, record: &DocumentRecord) -> anyhow::Result<()> {
        self.documents.lock().unwrap().push(record.clone());
        Ok(())
    }

    fn upsert_invoice(&self, record: &InvoiceRecord) -> anyhow::Result<()> {
        let mut invoices = self.invoices.lock().unwrap();
        if let Some(existing) = invoices.iter_mut().find(|i| i.doc_id == record.doc_id) {
            *existing = record.clone();
        } else {
            invoices.push(record.clone());
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryAudit {
    pub events: Mutex<Vec<AuditEvent>>,
}

impl Audit for MemoryAudit {
    fn append(&self, event: AuditEvent) {
        self.events.lock().unwrap().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_replaces_by_doc_id() {
        let store = MemoryStore::default();
        let doc_id = Uuid::new_v4();
        let mut record = InvoiceRecord {
            doc_id,
            supplier: None,
            date: None,
            value: Some(10.0),
            status: Status::Partial,
            confidence: 0.5,
        };
        store.upsert_invoice(&record).unwrap();
        record.status = Status::Ok;
        record.value = Some(12.0);
        store.upsert_invoice(&record).unwrap();

        let invoices = store.invoices.lock().unwrap();
        assert_eq!(invoices.len(), 1);
        assert_eq!(invoices[0].status, Status::Ok);
        assert_eq!(invoices[0].value, Some(12.0));
    }
}
