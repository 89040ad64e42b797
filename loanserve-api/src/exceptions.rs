use std::sync::Arc;

use chrono::DateTime;
use chrono::Utc;
use loanserve_audit_log::TenantId;
use loanserve_policy::PolicyResult;
use loanserve_policy::PolicyStore;
use loanserve_policy::PostingReadinessRules;
use loanserve_reconcile::ExceptionCase;
use loanserve_reconcile::ExceptionStatus;
use loanserve_reconcile::ReconcileResult;
use loanserve_reconcile::ReconciliationService;
use serde::Deserialize;
use serde::Serialize;

/// Surfaces per-tenant posting-readiness rules alongside the open
/// reconciliation exceptions that need someone to look at them, in the
/// same "queue with an overdue/open subset already split out" shape an
/// operator dashboard needs.
#[derive(Clone)]
pub struct ExceptionsFacade {
    policy_store: Arc<dyn PolicyStore>,
    reconcile: Arc<dyn ReconciliationService>,
}

impl ExceptionsFacade {
    pub fn new(policy_store: Arc<dyn PolicyStore>, reconcile: Arc<dyn ReconciliationService>) -> Self {
        Self {
            policy_store,
            reconcile,
        }
    }

    pub async fn list_policy_rule_sets(&self) -> PolicyResult<Vec<PolicyRuleSetView>> {
        let rule_sets = self.policy_store.list_rule_sets().await?;
        let mut views = rule_sets
            .into_iter()
            .map(|(tenant_id, rules)| PolicyRuleSetView { tenant_id, rules })
            .collect::<Vec<_>>();
        views.sort_by_key(|view| view.tenant_id);
        Ok(views)
    }

    pub fn exceptions_queue(&self, tenant_id: TenantId) -> ReconcileResult<ExceptionsQueueView> {
        let mut exceptions = self.reconcile.list_exceptions(tenant_id)?;
        exceptions.sort_by_key(|exception| exception.opened_at);
        let open = exceptions
            .iter()
            .filter(|exception| exception.status == ExceptionStatus::Open)
            .cloned()
            .collect::<Vec<_>>();
        Ok(ExceptionsQueueView {
            generated_at: Utc::now(),
            exceptions,
            open,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyRuleSetView {
    pub tenant_id: TenantId,
    pub rules: PostingReadinessRules,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExceptionsQueueView {
    pub generated_at: DateTime<Utc>,
    pub exceptions: Vec<ExceptionCase>,
    pub open: Vec<ExceptionCase>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use loanserve_policy::InMemoryPolicyStore;
    use loanserve_reconcile::InMemoryReconciliationService;
    use loanserve_reconcile::InMemoryReconciliationStore;
    use loanserve_reconcile::RecordVarianceRequest;
    use pretty_assertions::assert_eq;
    use uuid::Uuid;

    #[tokio::test]
    async fn facade_lists_policies_and_open_exceptions() {
        let policy_store = Arc::new(InMemoryPolicyStore::new());
        let tenant_id: TenantId = Uuid::new_v4();
        policy_store
            .put_rule_set(tenant_id, PostingReadinessRules::default())
            .await
            .expect("policy insert");

        let reconcile: Arc<dyn ReconciliationService> =
            Arc::new(InMemoryReconciliationService::new(InMemoryReconciliationStore::shared()));
        reconcile
            .record_variance(
                tenant_id,
                RecordVarianceRequest {
                    channel: "ach".into(),
                    period_start: NaiveDate::from_ymd_opt(2026, 3, 1).expect("date"),
                    period_end: NaiveDate::from_ymd_opt(2026, 3, 31).expect("date"),
                    bank_total_cents: 500_000,
                    sor_total_cents: 470_000,
                    details: None,
                },
            )
            .await
            .expect("record variance");

        let facade = ExceptionsFacade::new(policy_store, reconcile);

        let policies = facade
            .list_policy_rule_sets()
            .await
            .expect("policies should list");
        assert_eq!(policies.len(), 1);
        assert_eq!(policies[0].tenant_id, tenant_id);

        let queue = facade
            .exceptions_queue(tenant_id)
            .expect("queue should load");
        assert_eq!(queue.exceptions.len(), 1);
        assert_eq!(queue.open.len(), 1);
    }
}
