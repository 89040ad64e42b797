//! DLQ maintenance operations (spec 4.7 "DLQ hygiene", spec 6 CLI surface):
//! inspect without consuming, reprocess with reprocess headers, purge after
//! confirmation, list, and analyze. Grounded on the pack's GL DLQ behavior
//! test (`failed_events` rows carrying event_id/subject/tenant_id/error/
//! retry_count), generalized from its Postgres-specific schema to a store
//! trait so the CLI can be tested without a database.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

pub type DlqResult<T> = Result<T, DlqError>;

#[derive(Debug, Error)]
pub enum DlqError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// One parked delivery. `reprocess_count` and `reprocessed` track the
/// `x-reprocess-count` / `x-reprocessed` headers spec 4.7 requires on
/// republish.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEntry {
    pub id: Uuid,
    pub queue: String,
    pub tenant_id: Option<Uuid>,
    pub correlation_id: Option<String>,
    pub error: String,
    pub retry_count: u32,
    pub envelope: serde_json::Value,
    pub parked_at: DateTime<Utc>,
    pub reprocessed: bool,
    pub reprocess_count: u32,
}

#[derive(Debug, Clone, Default)]
pub struct DlqFilter {
    pub queue: Option<String>,
    pub tenant_id: Option<Uuid>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DlqAnalysis {
    pub total: usize,
    pub by_queue: HashMap<String, usize>,
    pub by_error_prefix: HashMap<String, usize>,
    pub reprocessed: usize,
}

/// Persistence seam over the parked-message table. `browse` never mutates
/// (spec 4.7: "get with noAck=false then nack requeue=true" — the broker
/// copy of the message is never actually consumed by inspection).
#[async_trait]
pub trait DlqStore: Send + Sync {
    async fn park(&self, entry: DlqEntry) -> DlqResult<()>;
    async fn browse(&self, filter: DlqFilter) -> DlqResult<Vec<DlqEntry>>;
    async fn get(&self, id: Uuid) -> DlqResult<DlqEntry>;
    async fn mark_reprocessed(&self, id: Uuid) -> DlqResult<DlqEntry>;
    async fn purge(&self, id: Uuid) -> DlqResult<()>;
}

#[derive(Debug, Default)]
pub struct InMemoryDlqStore {
    entries: RwLock<Vec<DlqEntry>>,
}

impl InMemoryDlqStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl DlqStore for InMemoryDlqStore {
    async fn park(&self, entry: DlqEntry) -> DlqResult<()> {
        self.entries.write().await.push(entry);
        Ok(())
    }

    async fn browse(&self, filter: DlqFilter) -> DlqResult<Vec<DlqEntry>> {
        let guard = self.entries.read().await;
        Ok(guard
            .iter()
            .filter(|e| filter.queue.as_deref().is_none_or(|q| q == e.queue))
            .filter(|e| filter.tenant_id.is_none_or(|t| Some(t) == e.tenant_id))
            .cloned()
            .collect())
    }

    async fn get(&self, id: Uuid) -> DlqResult<DlqEntry> {
        self.entries
            .read()
            .await
            .iter()
            .find(|e| e.id == id)
            .cloned()
            .ok_or_else(|| DlqError::NotFound(id.to_string()))
    }

    async fn mark_reprocessed(&self, id: Uuid) -> DlqResult<DlqEntry> {
        let mut guard = self.entries.write().await;
        let entry = guard
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| DlqError::NotFound(id.to_string()))?;
        entry.reprocessed = true;
        entry.reprocess_count += 1;
        Ok(entry.clone())
    }

    async fn purge(&self, id: Uuid) -> DlqResult<()> {
        let mut guard = self.entries.write().await;
        let before = guard.len();
        guard.retain(|e| e.id != id);
        if guard.len() == before {
            return Err(DlqError::NotFound(id.to_string()));
        }
        Ok(())
    }
}

/// Republishes the envelope onto its original queue's exchange with the
/// reprocess headers set; implemented by the real AMQP layer in production.
#[async_trait]
pub trait DlqRepublisher: Send + Sync {
    async fn republish(&self, entry: &DlqEntry) -> DlqResult<()>;
}

/// Inspect without consuming: a pure read of the current parked set.
pub async fn inspect(store: &dyn DlqStore, filter: DlqFilter) -> DlqResult<Vec<DlqEntry>> {
    store.browse(filter).await
}

pub async fn list(store: &dyn DlqStore, filter: DlqFilter) -> DlqResult<Vec<DlqEntry>> {
    store.browse(filter).await
}

/// Republishes with `x-reprocessed=true` / incremented `x-reprocess-count`,
/// then acks the original parked row (spec 4.7).
pub async fn reprocess(
    store: &dyn DlqStore,
    republisher: &dyn DlqRepublisher,
    id: Uuid,
) -> DlqResult<DlqEntry> {
    let entry = store.get(id).await?;
    republisher.republish(&entry).await?;
    store.mark_reprocessed(id).await
}

/// Purges a parked entry. The CLI is expected to have already confirmed
/// with the operator before calling this (spec 6: "purges after
/// confirmation").
pub async fn purge(store: &dyn DlqStore, id: Uuid) -> DlqResult<()> {
    store.purge(id).await
}

pub async fn analyze(store: &dyn DlqStore, filter: DlqFilter) -> DlqResult<DlqAnalysis> {
    let entries = store.browse(filter).await?;
    let mut analysis = DlqAnalysis {
        total: entries.len(),
        ..DlqAnalysis::default()
    };
    for entry in &entries {
        *analysis.by_queue.entry(entry.queue.clone()).or_insert(0) += 1;
        let prefix = entry
            .error
            .split(':')
            .next()
            .unwrap_or("unknown")
            .trim()
            .to_string();
        *analysis.by_error_prefix.entry(prefix).or_insert(0) += 1;
        if entry.reprocessed {
            analysis.reprocessed += 1;
        }
    }
    Ok(analysis)
}

/// Republishes onto the DLX with `x-reprocessed`/`x-reprocess-count`
/// headers set (spec 4.7), matching `LapinTopologyManager`'s service-trait-
/// plus-real-backend split.
#[cfg(feature = "lapin-store")]
pub struct LapinDlqRepublisher {
    channel: lapin::Channel,
    exchange: String,
}

#[cfg(feature = "lapin-store")]
impl LapinDlqRepublisher {
    #[must_use]
    pub fn new(channel: lapin::Channel, exchange: impl Into<String>) -> Self {
        Self {
            channel,
            exchange: exchange.into(),
        }
    }
}

#[cfg(feature = "lapin-store")]
#[async_trait]
impl DlqRepublisher for LapinDlqRepublisher {
    async fn republish(&self, entry: &DlqEntry) -> DlqResult<()> {
        use lapin::BasicProperties;
        use lapin::options::BasicPublishOptions;
        use lapin::types::AMQPValue;
        use lapin::types::FieldTable;

        let mut headers = FieldTable::default();
        headers.insert("x-reprocessed".into(), AMQPValue::Boolean(true));
        headers.insert(
            "x-reprocess-count".into(),
            AMQPValue::LongLongInt(i64::from(entry.reprocess_count) + 1),
        );
        let payload = serde_json::to_vec(&entry.envelope).map_err(|e| DlqError::Storage(e.to_string()))?;

        self.channel
            .basic_publish(
                &self.exchange,
                &entry.queue,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default().with_headers(headers),
            )
            .await
            .map_err(|e| DlqError::Storage(e.to_string()))?
            .await
            .map_err(|e| DlqError::Storage(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn entry(queue: &str, error: &str) -> DlqEntry {
        DlqEntry {
            id: Uuid::new_v4(),
            queue: queue.into(),
            tenant_id: Some(Uuid::new_v4()),
            correlation_id: Some("corr-1".into()),
            error: error.into(),
            retry_count: 6,
            envelope: serde_json::json!({"event_id": "evt-1"}),
            parked_at: Utc::now(),
            reprocessed: false,
            reprocess_count: 0,
        }
    }

    struct RecordingRepublisher {
        calls: std::sync::atomic::AtomicU32,
    }

    #[async_trait]
    impl DlqRepublisher for RecordingRepublisher {
        async fn republish(&self, _entry: &DlqEntry) -> DlqResult<()> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn inspect_does_not_remove_entries() {
        let store = InMemoryDlqStore::shared();
        store.park(entry("dlq.payments", "Validation: missing field")).await.unwrap();
        let first = inspect(store.as_ref(), DlqFilter::default()).await.unwrap();
        let second = inspect(store.as_ref(), DlqFilter::default()).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
    }

    #[tokio::test]
    async fn reprocess_republishes_and_marks_entry() {
        let store = InMemoryDlqStore::shared();
        let parked = entry("dlq.payments", "Transient: broker unreachable");
        let id = parked.id;
        store.park(parked).await.unwrap();
        let republisher = RecordingRepublisher { calls: std::sync::atomic::AtomicU32::new(0) };

        let result = reprocess(store.as_ref(), &republisher, id).await.unwrap();
        assert!(result.reprocessed);
        assert_eq!(result.reprocess_count, 1);
        assert_eq!(republisher.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn purge_removes_entry() {
        let store = InMemoryDlqStore::shared();
        let parked = entry("dlq.notifications", "Poison: bad json");
        let id = parked.id;
        store.park(parked).await.unwrap();

        purge(store.as_ref(), id).await.unwrap();
        let err = store.get(id).await.unwrap_err();
        assert!(matches!(err, DlqError::NotFound(_)));
    }

    #[tokio::test]
    async fn analyze_buckets_by_queue_and_error_prefix() {
        let store = InMemoryDlqStore::shared();
        store.park(entry("dlq.payments", "Validation: missing field")).await.unwrap();
        store.park(entry("dlq.payments", "Validation: unbalanced entry")).await.unwrap();
        store.park(entry("dlq.notifications", "Transient: timeout")).await.unwrap();

        let analysis = analyze(store.as_ref(), DlqFilter::default()).await.unwrap();
        assert_eq!(analysis.total, 3);
        assert_eq!(analysis.by_queue.get("dlq.payments"), Some(&2));
        assert_eq!(analysis.by_error_prefix.get("Validation"), Some(&2));
        assert_eq!(analysis.reprocessed, 0);
    }
}
