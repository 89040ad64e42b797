#![deny(clippy::print_stdout, clippy::print_stderr)]

//! Bank-vs-system-of-record reconciliation (spec 4.9, 3.1): upsert a
//! (channel, period_start, period_end) variance row, derive its status,
//! and auto-open a severity-scored exception case when the totals don't
//! match. Keeps the store/service/audit-hook shape the payment-matching
//! reconciler used, with the match-candidate scoring machinery dropped —
//! this domain has no candidates to score, only a two-number comparison.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::NaiveDate;
use chrono::Utc;
use loanserve_audit_log::Actor;
use loanserve_audit_log::AppendRequest;
use loanserve_audit_log::EventType;
use loanserve_audit_log::PaymentEventLog;
use loanserve_audit_log::TenantId;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

pub type ReconciliationId = Uuid;
pub type ExceptionId = Uuid;
pub type ReconcileResult<T> = Result<T, ReconcileError>;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("reconciliation {0} not found")]
    NotFound(ReconciliationId),
    #[error("exception {0} not found")]
    ExceptionNotFound(ExceptionId),
    #[error("invalid transition: {0}")]
    InvalidTransition(String),
    #[error("storage error: {0}")]
    Storage(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReconciliationStatus {
    Open,
    Balanced,
    Variance,
}

/// `variance = bank_total − sor_total`, in minor units (spec 4.9).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reconciliation {
    pub id: ReconciliationId,
    pub tenant_id: TenantId,
    pub channel: String,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub bank_total_cents: i64,
    pub sor_total_cents: i64,
    pub variance_cents: i64,
    pub status: ReconciliationStatus,
    pub recorded_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    pub exception_id: Option<ExceptionId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Bands fixed by spec 4.9: <100 low, <1000 medium, <10000 high, else
    /// critical, applied to the absolute variance in whole dollars. The
    /// stored variance is in minor units, so the thresholds scale by 100.
    #[must_use]
    pub fn from_variance_cents(variance_cents: i64) -> Severity {
        let magnitude = variance_cents.abs();
        if magnitude < 100 * 100 {
            Severity::Low
        } else if magnitude < 1_000 * 100 {
            Severity::Medium
        } else if magnitude < 10_000 * 100 {
            Severity::High
        } else {
            Severity::Critical
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExceptionStatus {
    Open,
    Resolved,
    Waived,
}

fn suggested_actions() -> Vec<&'static str> {
    vec![
        "review bank statement",
        "check duplicates",
        "look for delays",
        "investigate reversals",
    ]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExceptionCase {
    pub id: ExceptionId,
    pub tenant_id: TenantId,
    pub reconciliation_id: ReconciliationId,
    pub exception_type: String,
    pub severity: Severity,
    pub variance_cents: i64,
    pub suggested_actions: Vec<String>,
    pub status: ExceptionStatus,
    pub opened_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution_note: Option<String>,
}

impl ExceptionCase {
    fn resolve(&mut self, note: Option<String>) -> ReconcileResult<()> {
        if self.status != ExceptionStatus::Open {
            return Err(ReconcileError::InvalidTransition(format!(
                "exception {} is not open",
                self.id
            )));
        }
        self.status = ExceptionStatus::Resolved;
        self.resolution_note = note;
        Ok(())
    }

    fn waive(&mut self, note: String) -> ReconcileResult<()> {
        if self.status != ExceptionStatus::Open {
            return Err(ReconcileError::InvalidTransition(format!(
                "exception {} is not open",
                self.id
            )));
        }
        self.status = ExceptionStatus::Waived;
        self.resolution_note = Some(note);
        Ok(())
    }
}

/// Key the unique composite is upserted on (spec invariant: at most one
/// reconciliation row per (tenant, channel, period_start, period_end)).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ReconciliationKey {
    tenant_id: TenantId,
    channel: String,
    period_start: NaiveDate,
    period_end: NaiveDate,
}

pub trait ReconciliationStore: Send + Sync {
    fn upsert(&self, key_tenant: TenantId, reconciliation: Reconciliation) -> ReconcileResult<Reconciliation>;
    fn get(&self, id: ReconciliationId) -> ReconcileResult<Reconciliation>;
    fn find_by_period(
        &self,
        tenant_id: TenantId,
        channel: &str,
        period_start: NaiveDate,
        period_end: NaiveDate,
    ) -> ReconcileResult<Option<Reconciliation>>;
    fn list(&self, tenant_id: TenantId) -> ReconcileResult<Vec<Reconciliation>>;

    fn save_exception(&self, exception: ExceptionCase) -> ReconcileResult<ExceptionCase>;
    fn get_exception(&self, id: ExceptionId) -> ReconcileResult<ExceptionCase>;
    fn list_exceptions(&self, tenant_id: TenantId) -> ReconcileResult<Vec<ExceptionCase>>;
}

#[derive(Default)]
pub struct InMemoryReconciliationStore {
    reconciliations: RwLock<HashMap<ReconciliationId, Reconciliation>>,
    by_period: RwLock<HashMap<ReconciliationKey, ReconciliationId>>,
    exceptions: RwLock<HashMap<ExceptionId, ExceptionCase>>,
}

impl InMemoryReconciliationStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl ReconciliationStore for InMemoryReconciliationStore {
    fn upsert(&self, tenant_id: TenantId, reconciliation: Reconciliation) -> ReconcileResult<Reconciliation> {
        let key = ReconciliationKey {
            tenant_id,
            channel: reconciliation.channel.clone(),
            period_start: reconciliation.period_start,
            period_end: reconciliation.period_end,
        };
        let mut by_period = self
            .by_period
            .write()
            .map_err(|_| ReconcileError::Storage("reconciliation index poisoned".into()))?;
        let mut reconciliations = self
            .reconciliations
            .write()
            .map_err(|_| ReconcileError::Storage("reconciliation store poisoned".into()))?;

        let id = *by_period.entry(key).or_insert(reconciliation.id);
        let mut stored = reconciliation;
        stored.id = id;
        reconciliations.insert(id, stored.clone());
        Ok(stored)
    }

    fn get(&self, id: ReconciliationId) -> ReconcileResult<Reconciliation> {
        let guard = self
            .reconciliations
            .read()
            .map_err(|_| ReconcileError::Storage("reconciliation store poisoned".into()))?;
        guard.get(&id).cloned().ok_or(ReconcileError::NotFound(id))
    }

    fn find_by_period(
        &self,
        tenant_id: TenantId,
        channel: &str,
        period_start: NaiveDate,
        period_end: NaiveDate,
    ) -> ReconcileResult<Option<Reconciliation>> {
        let key = ReconciliationKey {
            tenant_id,
            channel: channel.to_string(),
            period_start,
            period_end,
        };
        let by_period = self
            .by_period
            .read()
            .map_err(|_| ReconcileError::Storage("reconciliation index poisoned".into()))?;
        let Some(id) = by_period.get(&key).copied() else {
            return Ok(None);
        };
        self.get(id).map(Some)
    }

    fn list(&self, tenant_id: TenantId) -> ReconcileResult<Vec<Reconciliation>> {
        let guard = self
            .reconciliations
            .read()
            .map_err(|_| ReconcileError::Storage("reconciliation store poisoned".into()))?;
        Ok(guard
            .values()
            .filter(|r| r.tenant_id == tenant_id)
            .cloned()
            .collect())
    }

    fn save_exception(&self, exception: ExceptionCase) -> ReconcileResult<ExceptionCase> {
        let mut guard = self
            .exceptions
            .write()
            .map_err(|_| ReconcileError::Storage("exception store poisoned".into()))?;
        guard.insert(exception.id, exception.clone());
        Ok(exception)
    }

    fn get_exception(&self, id: ExceptionId) -> ReconcileResult<ExceptionCase> {
        let guard = self
            .exceptions
            .read()
            .map_err(|_| ReconcileError::Storage("exception store poisoned".into()))?;
        guard
            .get(&id)
            .cloned()
            .ok_or(ReconcileError::ExceptionNotFound(id))
    }

    fn list_exceptions(&self, tenant_id: TenantId) -> ReconcileResult<Vec<ExceptionCase>> {
        let guard = self
            .exceptions
            .read()
            .map_err(|_| ReconcileError::Storage("exception store poisoned".into()))?;
        Ok(guard
            .values()
            .filter(|e| e.tenant_id == tenant_id)
            .cloned()
            .collect())
    }
}

#[cfg(feature = "postgres-store")]
#[derive(Clone)]
pub struct PostgresReconciliationStore {
    connection_string: String,
}

#[cfg(feature = "postgres-store")]
impl PostgresReconciliationStore {
    #[must_use]
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
        }
    }
}

#[cfg(feature = "postgres-store")]
impl ReconciliationStore for PostgresReconciliationStore {
    fn upsert(&self, _tenant_id: TenantId, reconciliation: Reconciliation) -> ReconcileResult<Reconciliation> {
        let _ = (&self.connection_string, &reconciliation);
        Err(ReconcileError::Storage(
            "postgres reconciliation store not yet implemented".into(),
        ))
    }

    fn get(&self, id: ReconciliationId) -> ReconcileResult<Reconciliation> {
        let _ = (&self.connection_string, id);
        Err(ReconcileError::Storage(
            "postgres reconciliation store not yet implemented".into(),
        ))
    }

    fn find_by_period(
        &self,
        _tenant_id: TenantId,
        channel: &str,
        period_start: NaiveDate,
        period_end: NaiveDate,
    ) -> ReconcileResult<Option<Reconciliation>> {
        let _ = (&self.connection_string, channel, period_start, period_end);
        Err(ReconcileError::Storage(
            "postgres reconciliation store not yet implemented".into(),
        ))
    }

    fn list(&self, tenant_id: TenantId) -> ReconcileResult<Vec<Reconciliation>> {
        let _ = (&self.connection_string, tenant_id);
        Err(ReconcileError::Storage(
            "postgres reconciliation store not yet implemented".into(),
        ))
    }

    fn save_exception(&self, exception: ExceptionCase) -> ReconcileResult<ExceptionCase> {
        let _ = (&self.connection_string, &exception);
        Err(ReconcileError::Storage(
            "postgres reconciliation store not yet implemented".into(),
        ))
    }

    fn get_exception(&self, id: ExceptionId) -> ReconcileResult<ExceptionCase> {
        let _ = (&self.connection_string, id);
        Err(ReconcileError::Storage(
            "postgres reconciliation store not yet implemented".into(),
        ))
    }

    fn list_exceptions(&self, tenant_id: TenantId) -> ReconcileResult<Vec<ExceptionCase>> {
        let _ = (&self.connection_string, tenant_id);
        Err(ReconcileError::Storage(
            "postgres reconciliation store not yet implemented".into(),
        ))
    }
}

#[derive(Debug, Clone)]
pub struct RecordVarianceRequest {
    pub channel: String,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub bank_total_cents: i64,
    pub sor_total_cents: i64,
    pub details: Option<String>,
}

#[async_trait]
pub trait ReconciliationService: Send + Sync {
    async fn record_variance(
        &self,
        tenant_id: TenantId,
        request: RecordVarianceRequest,
    ) -> ReconcileResult<Reconciliation>;
    fn get(&self, id: ReconciliationId) -> ReconcileResult<Reconciliation>;
    fn list(&self, tenant_id: TenantId) -> ReconcileResult<Vec<Reconciliation>>;
    fn list_exceptions(&self, tenant_id: TenantId) -> ReconcileResult<Vec<ExceptionCase>>;
    fn resolve_exception(&self, id: ExceptionId, note: Option<String>) -> ReconcileResult<ExceptionCase>;
    fn waive_exception(&self, id: ExceptionId, note: String) -> ReconcileResult<ExceptionCase>;
}

pub struct InMemoryReconciliationService {
    store: Arc<dyn ReconciliationStore>,
    event_log: Option<Arc<dyn PaymentEventLog>>,
}

impl InMemoryReconciliationService {
    #[must_use]
    pub fn new(store: Arc<dyn ReconciliationStore>) -> Self {
        Self {
            store,
            event_log: None,
        }
    }

    #[must_use]
    pub fn with_audit_log(store: Arc<dyn ReconciliationStore>, event_log: Arc<dyn PaymentEventLog>) -> Self {
        Self {
            store,
            event_log: Some(event_log),
        }
    }

    async fn append_audit(&self, tenant_id: TenantId, reconciliation: &Reconciliation) {
        let Some(event_log) = &self.event_log else {
            return;
        };
        let _ = event_log
            .append(AppendRequest {
                tenant_id,
                payment_id: None,
                ingestion_id: None,
                event_type: EventType::ReconciliationVarianceRecorded,
                actor: Actor::System,
                actor_id: "reconciliation-service".into(),
                correlation_id: reconciliation.id.to_string(),
                data: serde_json::json!({
                    "channel": reconciliation.channel,
                    "period_start": reconciliation.period_start.to_string(),
                    "period_end": reconciliation.period_end.to_string(),
                    "variance_cents": reconciliation.variance_cents,
                    "status": format!("{:?}", reconciliation.status),
                }),
            })
            .await;
    }
}

#[async_trait]
impl ReconciliationService for InMemoryReconciliationService {
    async fn record_variance(
        &self,
        tenant_id: TenantId,
        request: RecordVarianceRequest,
    ) -> ReconcileResult<Reconciliation> {
        let existing = self.store.find_by_period(
            tenant_id,
            &request.channel,
            request.period_start,
            request.period_end,
        )?;
        let id = existing.as_ref().map_or_else(Uuid::new_v4, |r| r.id);
        let variance_cents = request.bank_total_cents - request.sor_total_cents;
        let status = if variance_cents == 0 {
            ReconciliationStatus::Balanced
        } else {
            ReconciliationStatus::Variance
        };

        let mut reconciliation = Reconciliation {
            id,
            tenant_id,
            channel: request.channel,
            period_start: request.period_start,
            period_end: request.period_end,
            bank_total_cents: request.bank_total_cents,
            sor_total_cents: request.sor_total_cents,
            variance_cents,
            status,
            recorded_at: Utc::now(),
            details: request.details,
            exception_id: None,
        };

        if status == ReconciliationStatus::Variance {
            let exception = ExceptionCase {
                id: Uuid::new_v4(),
                tenant_id,
                reconciliation_id: id,
                exception_type: "reconciliation_variance".into(),
                severity: Severity::from_variance_cents(variance_cents),
                variance_cents,
                suggested_actions: suggested_actions().into_iter().map(str::to_string).collect(),
                status: ExceptionStatus::Open,
                opened_at: Utc::now(),
                resolution_note: None,
            };
            let saved = self.store.save_exception(exception)?;
            reconciliation.exception_id = Some(saved.id);
        }

        let stored = self.store.upsert(tenant_id, reconciliation)?;
        self.append_audit(tenant_id, &stored).await;
        Ok(stored)
    }

    fn get(&self, id: ReconciliationId) -> ReconcileResult<Reconciliation> {
        self.store.get(id)
    }

    fn list(&self, tenant_id: TenantId) -> ReconcileResult<Vec<Reconciliation>> {
        self.store.list(tenant_id)
    }

    fn list_exceptions(&self, tenant_id: TenantId) -> ReconcileResult<Vec<ExceptionCase>> {
        self.store.list_exceptions(tenant_id)
    }

    fn resolve_exception(&self, id: ExceptionId, note: Option<String>) -> ReconcileResult<ExceptionCase> {
        let mut exception = self.store.get_exception(id)?;
        exception.resolve(note)?;
        self.store.save_exception(exception)
    }

    fn waive_exception(&self, id: ExceptionId, note: String) -> ReconcileResult<ExceptionCase> {
        let mut exception = self.store.get_exception(id)?;
        exception.waive(note)?;
        self.store.save_exception(exception)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn service() -> InMemoryReconciliationService {
        InMemoryReconciliationService::new(InMemoryReconciliationStore::shared())
    }

    fn period() -> (NaiveDate, NaiveDate) {
        let d = NaiveDate::from_ymd_opt(2025, 8, 15).unwrap();
        (d, d)
    }

    #[tokio::test]
    async fn zero_variance_is_balanced_and_opens_no_exception() {
        let service = service();
        let tenant = Uuid::new_v4();
        let (start, end) = period();
        let reconciliation = service
            .record_variance(
                tenant,
                RecordVarianceRequest {
                    channel: "ach".into(),
                    period_start: start,
                    period_end: end,
                    bank_total_cents: 10_000_000,
                    sor_total_cents: 10_000_000,
                    details: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(reconciliation.status, ReconciliationStatus::Balanced);
        assert!(reconciliation.exception_id.is_none());
        assert!(service.list_exceptions(tenant).unwrap().is_empty());
    }

    #[tokio::test]
    async fn variance_opens_exception_with_severity_by_magnitude() {
        let service = service();
        let tenant = Uuid::new_v4();
        let (start, end) = period();
        let reconciliation = service
            .record_variance(
                tenant,
                RecordVarianceRequest {
                    channel: "wire".into(),
                    period_start: start,
                    period_end: end,
                    bank_total_cents: 10_000_000,
                    sor_total_cents: 9_725_000,
                    details: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(reconciliation.status, ReconciliationStatus::Variance);
        assert_eq!(reconciliation.variance_cents, 275_000);
        let exception_id = reconciliation.exception_id.expect("exception opened");
        let exception = service.store.get_exception(exception_id).unwrap();
        assert_eq!(exception.severity, Severity::High);
        assert_eq!(exception.exception_type, "reconciliation_variance");
        assert_eq!(exception.suggested_actions.len(), 4);
    }

    #[tokio::test]
    async fn recording_twice_for_same_period_upserts_in_place() {
        let service = service();
        let tenant = Uuid::new_v4();
        let (start, end) = period();
        let first = service
            .record_variance(
                tenant,
                RecordVarianceRequest {
                    channel: "ach".into(),
                    period_start: start,
                    period_end: end,
                    bank_total_cents: 500_00,
                    sor_total_cents: 500_00,
                    details: None,
                },
            )
            .await
            .unwrap();
        let second = service
            .record_variance(
                tenant,
                RecordVarianceRequest {
                    channel: "ach".into(),
                    period_start: start,
                    period_end: end,
                    bank_total_cents: 600_00,
                    sor_total_cents: 500_00,
                    details: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(service.list(tenant).unwrap().len(), 1);
    }

    #[test]
    fn severity_bands_match_magnitude_thresholds() {
        assert_eq!(Severity::from_variance_cents(5_000), Severity::Low);
        assert_eq!(Severity::from_variance_cents(50_000), Severity::Medium);
        assert_eq!(Severity::from_variance_cents(500_000), Severity::High);
        assert_eq!(Severity::from_variance_cents(5_000_000), Severity::Critical);
    }

    #[tokio::test]
    async fn resolving_an_exception_records_the_note() {
        let service = service();
        let tenant = Uuid::new_v4();
        let (start, end) = period();
        let reconciliation = service
            .record_variance(
                tenant,
                RecordVarianceRequest {
                    channel: "check".into(),
                    period_start: start,
                    period_end: end,
                    bank_total_cents: 1_000,
                    sor_total_cents: 0,
                    details: None,
                },
            )
            .await
            .unwrap();
        let exception_id = reconciliation.exception_id.unwrap();
        let resolved = service
            .resolve_exception(exception_id, Some("confirmed duplicate bank entry".into()))
            .unwrap();
        assert_eq!(resolved.status, ExceptionStatus::Resolved);
        assert_eq!(
            resolved.resolution_note.as_deref(),
            Some("confirmed duplicate bank entry")
        );
    }
}
