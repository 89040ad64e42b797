use std::sync::Arc;

use loanserve_audit_log::TenantId;
use loanserve_reconcile::ExceptionCase;
use loanserve_reconcile::ExceptionId;
use loanserve_reconcile::RecordVarianceRequest;
use loanserve_reconcile::Reconciliation;
use loanserve_reconcile::ReconcileResult;
use loanserve_reconcile::ReconciliationId;
use loanserve_reconcile::ReconciliationService;

use crate::ServiceTelemetry;

/// Thin wrapper over `ReconciliationService`: records variances, bumps
/// telemetry when a variance opens an exception, and re-exposes exception
/// resolution for the CLI/maintenance surface.
#[derive(Clone)]
pub struct ReconciliationFacade {
    service: Arc<dyn ReconciliationService>,
    telemetry: Option<Arc<ServiceTelemetry>>,
}

impl ReconciliationFacade {
    pub fn new(service: Arc<dyn ReconciliationService>) -> Self {
        Self::with_telemetry(service, None)
    }

    pub fn with_telemetry(
        service: Arc<dyn ReconciliationService>,
        telemetry: Option<Arc<ServiceTelemetry>>,
    ) -> Self {
        Self { service, telemetry }
    }

    pub async fn record_variance(
        &self,
        tenant_id: TenantId,
        request: RecordVarianceRequest,
    ) -> ReconcileResult<Reconciliation> {
        let reconciliation = self.service.record_variance(tenant_id, request).await?;
        if let Some(telemetry) = &self.telemetry {
            telemetry.record_reconciliation_variance(reconciliation.exception_id.is_some());
        }
        Ok(reconciliation)
    }

    pub fn get(&self, id: ReconciliationId) -> ReconcileResult<Reconciliation> {
        self.service.get(id)
    }

    pub fn list(&self, tenant_id: TenantId) -> ReconcileResult<Vec<Reconciliation>> {
        self.service.list(tenant_id)
    }

    pub fn list_exceptions(&self, tenant_id: TenantId) -> ReconcileResult<Vec<ExceptionCase>> {
        self.service.list_exceptions(tenant_id)
    }

    pub fn resolve_exception(
        &self,
        id: ExceptionId,
        note: Option<String>,
    ) -> ReconcileResult<ExceptionCase> {
        self.service.resolve_exception(id, note)
    }

    pub fn waive_exception(&self, id: ExceptionId, note: String) -> ReconcileResult<ExceptionCase> {
        self.service.waive_exception(id, note)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use loanserve_reconcile::InMemoryReconciliationStore;
    use loanserve_reconcile::InMemoryReconciliationService;
    use loanserve_reconcile::ReconciliationStatus;
    use loanserve_reconcile::Severity;
    use pretty_assertions::assert_eq;
    use uuid::Uuid;

    fn facade() -> ReconciliationFacade {
        let store = InMemoryReconciliationStore::shared();
        let service: Arc<dyn ReconciliationService> =
            Arc::new(InMemoryReconciliationService::new(store));
        ReconciliationFacade::new(service)
    }

    #[tokio::test]
    async fn balanced_period_opens_no_exception() {
        let facade = facade();
        let tenant_id: TenantId = Uuid::new_v4();

        let reconciliation = facade
            .record_variance(
                tenant_id,
                RecordVarianceRequest {
                    channel: "ach".into(),
                    period_start: NaiveDate::from_ymd_opt(2026, 1, 1).expect("date"),
                    period_end: NaiveDate::from_ymd_opt(2026, 1, 31).expect("date"),
                    bank_total_cents: 10_000_00,
                    sor_total_cents: 10_000_00,
                    details: None,
                },
            )
            .await
            .expect("record variance");

        assert_eq!(reconciliation.status, ReconciliationStatus::Balanced);
        assert!(reconciliation.exception_id.is_none());
        assert!(facade.list_exceptions(tenant_id).expect("list").is_empty());
    }

    #[tokio::test]
    async fn variance_opens_a_severity_banded_exception() {
        let facade = facade();
        let tenant_id: TenantId = Uuid::new_v4();

        let reconciliation = facade
            .record_variance(
                tenant_id,
                RecordVarianceRequest {
                    channel: "wire".into(),
                    period_start: NaiveDate::from_ymd_opt(2026, 2, 1).expect("date"),
                    period_end: NaiveDate::from_ymd_opt(2026, 2, 28).expect("date"),
                    bank_total_cents: 10_000_000,
                    sor_total_cents: 9_725_000,
                    details: None,
                },
            )
            .await
            .expect("record variance");

        assert_eq!(reconciliation.variance_cents, 275_000);
        assert_eq!(reconciliation.status, ReconciliationStatus::Variance);

        let exceptions = facade.list_exceptions(tenant_id).expect("list exceptions");
        assert_eq!(exceptions.len(), 1);
        assert_eq!(exceptions[0].severity, Severity::High);

        let resolved = facade
            .resolve_exception(exceptions[0].id, Some("matched late settlement".into()))
            .expect("resolve exception");
        assert_eq!(resolved.resolution_note.as_deref(), Some("matched late settlement"));
    }
}
