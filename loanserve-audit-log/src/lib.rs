#![deny(clippy::print_stdout, clippy::print_stderr)]

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

pub type TenantId = Uuid;

/// Fixed, all-zero 32-byte sentinel used as `prev_event_hash` for the first
/// event of a tenant (spec glossary, "Genesis hash"), rendered as lowercase
/// hex so it compares directly against a computed SHA-256 digest.
#[must_use]
pub fn genesis_hash() -> String {
    "00".repeat(32)
}

pub type AuditLogResult<T> = Result<T, AuditLogError>;

#[derive(Debug, Error)]
pub enum AuditLogError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("storage failure: {0}")]
    Storage(String),
    #[error("corrupted chain: {0}")]
    Corrupted(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Actor {
    System,
    Human,
    Ai,
}

/// Tagged event taxonomy (design notes 9: "tagged variant types... plus a
/// single opaque details map for forward compatibility"). `Other` carries
/// any event type not yet promoted to its own variant so producers never
/// block on a taxonomy change landing first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "label")]
pub enum EventType {
    PaymentReceived,
    PaymentValidated,
    PaymentAllocated,
    PaymentPosted,
    PaymentSettled,
    PaymentReturned,
    PaymentReversed,
    PaymentFailed,
    OutboxPublished,
    ServicingRunStarted,
    ServicingRunCompleted,
    ServicingEventRecorded,
    ServicingExceptionOpened,
    ReconciliationVarianceRecorded,
    TopologyMigrated,
    Other(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendRequest {
    pub tenant_id: TenantId,
    pub payment_id: Option<Uuid>,
    pub ingestion_id: Option<Uuid>,
    pub event_type: EventType,
    pub actor: Actor,
    pub actor_id: String,
    pub correlation_id: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentEvent {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub payment_id: Option<Uuid>,
    pub ingestion_id: Option<Uuid>,
    pub event_type: EventType,
    pub event_time: DateTime<Utc>,
    pub actor: Actor,
    pub actor_id: String,
    pub correlation_id: String,
    pub data: serde_json::Value,
    pub prev_event_hash: Option<String>,
    pub event_hash: String,
}

#[derive(Debug, Clone, Default)]
pub struct PaymentEventFilter {
    pub payment_id: Option<Uuid>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokenLink {
    pub event_id: Uuid,
    pub expected: String,
    pub actual: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationReport {
    pub is_valid: bool,
    pub broken_links: Vec<BrokenLink>,
    pub total_events: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainExport {
    pub events: Vec<PaymentEvent>,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub total_events: usize,
    pub chain_valid: bool,
    pub exported_at: DateTime<Utc>,
    pub export_hash: String,
}

/// Sorts object keys recursively and renders deterministic JSON with no
/// insignificant whitespace. `canonicalize(canonicalize(x)) == canonicalize(x)`
/// because the output contains no object at all, only a string.
#[must_use]
pub fn canonicalize(value: &serde_json::Value) -> String {
    canonical_value(value).to_string()
}

fn canonical_value(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let sorted: BTreeMap<String, serde_json::Value> = map
                .iter()
                .map(|(k, v)| (k.clone(), canonical_value(v)))
                .collect();
            serde_json::Value::Object(sorted.into_iter().collect())
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(canonical_value).collect())
        }
        other => other.clone(),
    }
}

#[async_trait]
pub trait PaymentEventLog: Send + Sync {
    async fn append(&self, request: AppendRequest) -> AuditLogResult<PaymentEvent>;

    async fn events(
        &self,
        tenant_id: &TenantId,
        filter: PaymentEventFilter,
    ) -> AuditLogResult<Vec<PaymentEvent>>;

    async fn verify(&self, tenant_id: &TenantId) -> AuditLogResult<VerificationReport>;

    async fn export(
        &self,
        tenant_id: &TenantId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> AuditLogResult<ChainExport>;
}

#[derive(Default)]
pub struct InMemoryPaymentEventLog {
    /// Events are stored globally and filtered by tenant on read; the chain
    /// itself is maintained per tenant (spec 3.2: "global per tenant").
    events: RwLock<Vec<PaymentEvent>>,
}

impl InMemoryPaymentEventLog {
    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn compute_hash(
        prev_event_hash: &str,
        data: &serde_json::Value,
        correlation_id: &str,
        occurred_at: DateTime<Utc>,
    ) -> String {
        let payload = serde_json::json!({
            "prev_event_hash": prev_event_hash,
            "data": data,
            "correlation_id": correlation_id,
            "occurred_at": occurred_at.to_rfc3339(),
        });
        let mut hasher = Sha256::new();
        hasher.update(canonicalize(&payload).as_bytes());
        format!("{:x}", hasher.finalize())
    }

    fn validate_request(request: &AppendRequest) -> AuditLogResult<()> {
        if request.actor_id.trim().is_empty() {
            return Err(AuditLogError::Validation("actor_id must be provided".into()));
        }
        if request.correlation_id.trim().is_empty() {
            return Err(AuditLogError::Validation(
                "correlation_id must be provided".into(),
            ));
        }
        Ok(())
    }

    fn verify_ordered(events: &[PaymentEvent]) -> VerificationReport {
        let mut expected_prev = genesis_hash();
        let mut broken_links = Vec::new();

        for event in events {
            let prev = event.prev_event_hash.clone().unwrap_or_else(genesis_hash);
            if prev != expected_prev {
                broken_links.push(BrokenLink {
                    event_id: event.id,
                    expected: expected_prev.clone(),
                    actual: prev,
                });
            }
            let recomputed = Self::compute_hash(
                &event.prev_event_hash.clone().unwrap_or_else(genesis_hash),
                &event.data,
                &event.correlation_id,
                event.event_time,
            );
            if recomputed != event.event_hash {
                broken_links.push(BrokenLink {
                    event_id: event.id,
                    expected: recomputed,
                    actual: event.event_hash.clone(),
                });
            }
            expected_prev = event.event_hash.clone();
        }

        VerificationReport {
            is_valid: broken_links.is_empty(),
            broken_links,
            total_events: events.len(),
        }
    }
}

#[async_trait]
impl PaymentEventLog for InMemoryPaymentEventLog {
    async fn append(&self, request: AppendRequest) -> AuditLogResult<PaymentEvent> {
        Self::validate_request(&request)?;

        let mut guard = self.events.write().await;
        let prev_event_hash = guard
            .iter()
            .rev()
            .find(|event| event.tenant_id == request.tenant_id)
            .map(|event| event.event_hash.clone());

        let event_time = Utc::now();
        let prev_hash_for_compute = prev_event_hash.clone().unwrap_or_else(genesis_hash);
        let event_hash = Self::compute_hash(
            &prev_hash_for_compute,
            &request.data,
            &request.correlation_id,
            event_time,
        );

        let event = PaymentEvent {
            id: Uuid::new_v4(),
            tenant_id: request.tenant_id,
            payment_id: request.payment_id,
            ingestion_id: request.ingestion_id,
            event_type: request.event_type,
            event_time,
            actor: request.actor,
            actor_id: request.actor_id,
            correlation_id: request.correlation_id,
            data: request.data,
            prev_event_hash,
            event_hash,
        };

        guard.push(event.clone());
        Ok(event)
    }

    async fn events(
        &self,
        tenant_id: &TenantId,
        filter: PaymentEventFilter,
    ) -> AuditLogResult<Vec<PaymentEvent>> {
        let guard = self.events.read().await;
        let mut filtered = guard
            .iter()
            .filter(|event| &event.tenant_id == tenant_id)
            .cloned()
            .collect::<Vec<_>>();

        if let Some(payment_id) = filter.payment_id {
            filtered.retain(|event| event.payment_id == Some(payment_id));
        }
        if let Some(limit) = filter.limit
            && filtered.len() > limit
        {
            filtered.truncate(limit);
        }
        Ok(filtered)
    }

    async fn verify(&self, tenant_id: &TenantId) -> AuditLogResult<VerificationReport> {
        let guard = self.events.read().await;
        let tenant_events = guard
            .iter()
            .filter(|event| &event.tenant_id == tenant_id)
            .cloned()
            .collect::<Vec<_>>();
        Ok(Self::verify_ordered(&tenant_events))
    }

    async fn export(
        &self,
        tenant_id: &TenantId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> AuditLogResult<ChainExport> {
        let guard = self.events.read().await;
        let tenant_events = guard
            .iter()
            .filter(|event| &event.tenant_id == tenant_id)
            .cloned()
            .collect::<Vec<_>>();
        let report = Self::verify_ordered(&tenant_events);

        let ranged = tenant_events
            .into_iter()
            .filter(|event| event.event_time >= start && event.event_time <= end)
            .collect::<Vec<_>>();

        let exported_at = Utc::now();
        let dump = serde_json::json!({
            "events": ranged,
            "start_date": start.to_rfc3339(),
            "end_date": end.to_rfc3339(),
            "total_events": ranged.len(),
            "chain_valid": report.is_valid,
            "exported_at": exported_at.to_rfc3339(),
        });
        let mut hasher = Sha256::new();
        hasher.update(canonicalize(&dump).as_bytes());
        let export_hash = format!("{:x}", hasher.finalize());

        Ok(ChainExport {
            total_events: ranged.len(),
            events: ranged,
            start_date: start,
            end_date: end,
            chain_valid: report.is_valid,
            exported_at,
            export_hash,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn request(tenant_id: TenantId, correlation_id: &str) -> AppendRequest {
        AppendRequest {
            tenant_id,
            payment_id: None,
            ingestion_id: None,
            event_type: EventType::PaymentPosted,
            actor: Actor::System,
            actor_id: "poster".into(),
            correlation_id: correlation_id.into(),
            data: serde_json::json!({"amount_cents": 1500}),
        }
    }

    #[tokio::test]
    async fn first_event_chains_from_genesis() {
        let log = InMemoryPaymentEventLog::shared();
        let tenant_id = Uuid::new_v4();

        let first = log
            .append(request(tenant_id, "corr-1"))
            .await
            .expect("append should succeed");

        assert!(first.prev_event_hash.is_none());
        assert_eq!(first.event_hash.len(), 64);
    }

    #[tokio::test]
    async fn chain_links_successive_events() {
        let log = InMemoryPaymentEventLog::shared();
        let tenant_id = Uuid::new_v4();

        let first = log
            .append(request(tenant_id, "corr-1"))
            .await
            .expect("append 1");
        let second = log
            .append(request(tenant_id, "corr-2"))
            .await
            .expect("append 2");

        assert_eq!(second.prev_event_hash.as_deref(), Some(first.event_hash.as_str()));

        let report = log.verify(&tenant_id).await.expect("verify");
        assert!(report.is_valid);
        assert_eq!(report.total_events, 2);
    }

    #[tokio::test]
    async fn tenants_chain_independently() {
        let log = InMemoryPaymentEventLog::shared();
        let tenant_a = Uuid::new_v4();
        let tenant_b = Uuid::new_v4();

        log.append(request(tenant_a, "a-1")).await.expect("append a");
        let b_first = log
            .append(request(tenant_b, "b-1"))
            .await
            .expect("append b");

        assert!(b_first.prev_event_hash.is_none());
    }

    #[tokio::test]
    async fn detects_tampering_via_verify() {
        let log = InMemoryPaymentEventLog::shared();
        let tenant_id = Uuid::new_v4();
        log.append(request(tenant_id, "corr-1")).await.expect("append 1");
        log.append(request(tenant_id, "corr-2")).await.expect("append 2");

        {
            let mut guard = log.events.write().await;
            guard[1].prev_event_hash = Some("tampered".into());
        }

        let report = log.verify(&tenant_id).await.expect("verify should run");
        assert!(!report.is_valid);
        assert_eq!(report.broken_links.len(), 1);
    }

    #[tokio::test]
    async fn export_reports_hash_and_validity() {
        let log = InMemoryPaymentEventLog::shared();
        let tenant_id = Uuid::new_v4();
        log.append(request(tenant_id, "corr-1")).await.expect("append 1");

        let export = log
            .export(
                &tenant_id,
                Utc::now() - chrono::Duration::hours(1),
                Utc::now() + chrono::Duration::hours(1),
            )
            .await
            .expect("export should succeed");
        assert_eq!(export.total_events, 1);
        assert!(export.chain_valid);
        assert_eq!(export.export_hash.len(), 64);
    }

    #[test]
    fn canonicalize_sorts_keys_recursively() {
        let value = serde_json::json!({"b": 1, "a": {"d": 2, "c": 3}});
        let left = canonicalize(&value);
        let reordered = serde_json::json!({"a": {"c": 3, "d": 2}, "b": 1});
        let right = canonicalize(&reordered);
        assert_eq!(left, right);
    }

    #[test]
    fn canonicalize_is_idempotent() {
        let value = serde_json::json!({"z": [3, 2, 1], "a": "hi"});
        let once = canonicalize(&value);
        let parsed: serde_json::Value = serde_json::from_str(&once).expect("valid json");
        let twice = canonicalize(&parsed);
        assert_eq!(once, twice);
    }
}
