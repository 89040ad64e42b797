//! Poster & transactional outbox (spec 4.4): atomically persists a new
//! payment, its ledger lines, one outbox message, and one hash-chained
//! payment event. The in-memory implementation models "one transaction"
//! as one `tokio::sync::Mutex` guarding all three tables so the six-step
//! sequence is provably atomic with respect to concurrent callers.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::NaiveDate;
use chrono::Utc;
use loanserve_audit_log::Actor;
use loanserve_audit_log::AppendRequest;
use loanserve_audit_log::EventType;
use loanserve_audit_log::PaymentEventLog;
use loanserve_outbox::NewOutboxMessage;
use loanserve_outbox::OutboxStore;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::LedgerError;
use crate::LedgerResult;
use crate::money::Money;
use crate::waterfall::Allocation;
use crate::waterfall::Outstanding;
use crate::waterfall::WaterfallOrder;
use crate::waterfall::allocate;
use crate::waterfall::default_waterfall_order;

pub type TenantId = Uuid;
pub type PaymentId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentState {
    Received,
    Validated,
    Allocated,
    Posted,
    Settled,
    Returned,
    Reversed,
    Failed,
}

impl PaymentState {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PaymentState::Settled | PaymentState::Returned | PaymentState::Reversed | PaymentState::Failed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountType {
    Asset,
    Liability,
    Revenue,
    Expense,
    Equity,
}

/// One debit or credit line. Exactly one of `debit_cents`/`credit_cents`
/// is non-zero (spec 3.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub payment_id: PaymentId,
    pub entry_date: NaiveDate,
    pub account_type: AccountType,
    pub account_code: String,
    pub debit_cents: i64,
    pub credit_cents: i64,
    pub description: String,
    pub correlation_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payment {
    pub id: PaymentId,
    pub tenant_id: TenantId,
    pub loan_id: Option<String>,
    pub channel: String,
    pub idempotency_key: String,
    pub amount_cents: i64,
    pub value_date: NaiveDate,
    pub state: PaymentState,
    pub bank_transfer_id: Option<String>,
    pub check_number: Option<String>,
    pub allocation: Allocation,
    pub posting_ready: bool,
    pub requires_review: bool,
    pub created_at: DateTime<Utc>,
}

/// Input to `PosterService::post_payment`. The envelope has already been
/// normalized and risk-scored by `loanserve-bank-ingest`; the waterfall
/// buckets have already been looked up by the caller.
#[derive(Debug, Clone)]
pub struct PostPaymentRequest {
    pub tenant_id: TenantId,
    pub loan_id: Option<String>,
    pub channel: String,
    pub idempotency_key: String,
    pub amount_cents: i64,
    pub value_date: NaiveDate,
    pub bank_transfer_id: Option<String>,
    pub check_number: Option<String>,
    pub outstanding: Outstanding,
    pub posting_ready: bool,
    pub requires_review: bool,
    pub correlation_id: String,
    pub actor_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostPaymentOutcome {
    pub payment: Payment,
    pub is_new: bool,
}

#[async_trait]
pub trait PosterService: Send + Sync {
    /// Steps 1-6 of spec 4.4, inside one transaction. Idempotent: a
    /// second call with the same idempotency key returns the original
    /// payment with `is_new: false` and writes nothing further.
    async fn post_payment(&self, request: PostPaymentRequest) -> LedgerResult<PostPaymentOutcome>;

    async fn get_payment(&self, tenant_id: &TenantId, payment_id: &PaymentId) -> LedgerResult<Payment>;

    async fn ledger_entries_for_payment(
        &self,
        tenant_id: &TenantId,
        payment_id: &PaymentId,
    ) -> LedgerResult<Vec<LedgerEntry>>;
}

#[derive(Debug, Default)]
struct LedgerState {
    payments_by_id: HashMap<PaymentId, Payment>,
    payments_by_idempotency_key: HashMap<String, PaymentId>,
    entries_by_payment: HashMap<PaymentId, Vec<LedgerEntry>>,
}

pub struct InMemoryPosterService {
    state: Mutex<LedgerState>,
    event_log: Arc<dyn PaymentEventLog>,
    outbox: Arc<dyn OutboxStore>,
    waterfall_order: WaterfallOrder,
}

impl InMemoryPosterService {
    #[must_use]
    pub fn new(event_log: Arc<dyn PaymentEventLog>, outbox: Arc<dyn OutboxStore>) -> Self {
        Self {
            state: Mutex::new(LedgerState::default()),
            event_log,
            outbox,
            waterfall_order: default_waterfall_order(),
        }
    }

    #[must_use]
    pub fn with_waterfall_order(mut self, order: WaterfallOrder) -> Self {
        self.waterfall_order = order;
        self
    }

    fn cash_account_code(channel: &str) -> String {
        format!("cash:{channel}")
    }

    fn build_entries(
        payment_id: PaymentId,
        value_date: NaiveDate,
        amount_cents: i64,
        allocation: &Allocation,
        channel: &str,
        correlation_id: &str,
    ) -> LedgerResult<Vec<LedgerEntry>> {
        let mut entries = vec![LedgerEntry {
            id: Uuid::new_v4(),
            payment_id,
            entry_date: value_date,
            account_type: AccountType::Asset,
            account_code: Self::cash_account_code(channel),
            debit_cents: amount_cents,
            credit_cents: 0,
            description: format!("cash received via {channel}"),
            correlation_id: correlation_id.to_string(),
        }];

        let mut push_credit = |account_type: AccountType, account_code: &str, amount: i64, description: &str| {
            if amount > 0 {
                entries.push(LedgerEntry {
                    id: Uuid::new_v4(),
                    payment_id,
                    entry_date: value_date,
                    account_type,
                    account_code: account_code.to_string(),
                    debit_cents: 0,
                    credit_cents: amount,
                    description: description.to_string(),
                    correlation_id: correlation_id.to_string(),
                });
            }
        };

        push_credit(AccountType::Revenue, "fee_income", allocation.fees, "fee income");
        push_credit(AccountType::Revenue, "interest_income", allocation.interest, "interest income");
        push_credit(AccountType::Asset, "loan_receivable", allocation.principal, "principal applied");
        push_credit(AccountType::Liability, "escrow_liability", allocation.escrow, "escrow funded");
        push_credit(AccountType::Liability, "suspense_liability", allocation.suspense, "suspense hold");

        let total_debits: i64 = entries.iter().map(|e| e.debit_cents).sum();
        let total_credits: i64 = entries.iter().map(|e| e.credit_cents).sum();
        if total_debits != total_credits {
            return Err(LedgerError::Invariant(format!(
                "ledger entries do not balance for payment {payment_id}: debits={total_debits} credits={total_credits}"
            )));
        }

        Ok(entries)
    }
}

#[async_trait]
impl PosterService for InMemoryPosterService {
    async fn post_payment(&self, request: PostPaymentRequest) -> LedgerResult<PostPaymentOutcome> {
        if request.amount_cents <= 0 {
            return Err(LedgerError::Validation("amount_cents must be positive".into()));
        }
        let amount = Money::cents(request.amount_cents)?;

        let mut state = self.state.lock().await;

        // Step 1: duplicate detection. The committing transaction that
        // first created the payment already wrote ledger/outbox/event;
        // this path must not write anything further.
        if let Some(existing_id) = state.payments_by_idempotency_key.get(&request.idempotency_key).copied() {
            let payment = state
                .payments_by_id
                .get(&existing_id)
                .cloned()
                .ok_or_else(|| LedgerError::Internal("idempotency index points at missing payment".into()))?;
            return Ok(PostPaymentOutcome {
                payment,
                is_new: false,
            });
        }

        let allocation = if request.posting_ready {
            allocate(amount, request.outstanding, &self.waterfall_order)
        } else {
            Allocation::suspense_only(amount)
        };

        if allocation.total() != amount.as_cents() {
            return Err(LedgerError::Invariant(format!(
                "waterfall allocation sum {} does not equal amount {}",
                allocation.total(),
                amount.as_cents()
            )));
        }

        // Step 2: insert payment row.
        let payment_id = Uuid::new_v4();
        let payment = Payment {
            id: payment_id,
            tenant_id: request.tenant_id,
            loan_id: request.loan_id.clone(),
            channel: request.channel.clone(),
            idempotency_key: request.idempotency_key.clone(),
            amount_cents: request.amount_cents,
            value_date: request.value_date,
            state: if request.posting_ready {
                PaymentState::Posted
            } else {
                PaymentState::Allocated
            },
            bank_transfer_id: request.bank_transfer_id.clone(),
            check_number: request.check_number.clone(),
            allocation,
            posting_ready: request.posting_ready,
            requires_review: request.requires_review,
            created_at: Utc::now(),
        };

        // Step 3: insert ledger entries, validating debits = credits.
        let entries = Self::build_entries(
            payment_id,
            request.value_date,
            request.amount_cents,
            &allocation,
            &request.channel,
            &request.idempotency_key,
        )?;

        // Step 4: insert outbox message.
        let payload = serde_json::json!({
            "payment_id": payment_id,
            "idempotency_key": request.idempotency_key,
            "loan_id": request.loan_id,
            "allocations": {
                "xF": allocation.fees,
                "xI": allocation.interest,
                "xP": allocation.principal,
                "xE": allocation.escrow,
                "suspense": allocation.suspense,
            },
            "status": if request.posting_ready { "posted" } else { "pending" },
        });
        self.outbox
            .insert(NewOutboxMessage {
                tenant_id: request.tenant_id,
                aggregate_type: "payments".into(),
                aggregate_id: payment_id.to_string(),
                event_type: "payment.posted".into(),
                payload: payload.clone(),
            })
            .await
            .map_err(|e| LedgerError::Internal(format!("outbox insert failed: {e}")))?;

        // Step 5: append hash-chained payment event (hash computed inside
        // the event log against the tenant's chain tail).
        self.event_log
            .append(AppendRequest {
                tenant_id: request.tenant_id,
                payment_id: Some(payment_id),
                ingestion_id: None,
                event_type: EventType::PaymentPosted,
                actor: Actor::System,
                actor_id: request.actor_id.clone(),
                correlation_id: request.correlation_id.clone(),
                data: payload,
            })
            .await
            .map_err(|e| LedgerError::Internal(format!("event log append failed: {e}")))?;

        // Step 6: commit.
        state.payments_by_id.insert(payment_id, payment.clone());
        state
            .payments_by_idempotency_key
            .insert(request.idempotency_key.clone(), payment_id);
        state.entries_by_payment.insert(payment_id, entries);

        Ok(PostPaymentOutcome {
            payment,
            is_new: true,
        })
    }

    async fn get_payment(&self, tenant_id: &TenantId, payment_id: &PaymentId) -> LedgerResult<Payment> {
        let state = self.state.lock().await;
        state
            .payments_by_id
            .get(payment_id)
            .filter(|p| &p.tenant_id == tenant_id)
            .cloned()
            .ok_or_else(|| LedgerError::NotFound(format!("payment {payment_id} not found")))
    }

    async fn ledger_entries_for_payment(
        &self,
        tenant_id: &TenantId,
        payment_id: &PaymentId,
    ) -> LedgerResult<Vec<LedgerEntry>> {
        let state = self.state.lock().await;
        let payment = state
            .payments_by_id
            .get(payment_id)
            .filter(|p| &p.tenant_id == tenant_id)
            .ok_or_else(|| LedgerError::NotFound(format!("payment {payment_id} not found")))?;
        let _ = payment;
        Ok(state.entries_by_payment.get(payment_id).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loanserve_audit_log::InMemoryPaymentEventLog;
    use loanserve_outbox::InMemoryOutboxStore;
    use pretty_assertions::assert_eq;

    fn request(tenant_id: TenantId, idempotency_key: &str) -> PostPaymentRequest {
        PostPaymentRequest {
            tenant_id,
            loan_id: Some("17".into()),
            channel: "ach".into(),
            idempotency_key: idempotency_key.into(),
            amount_cents: 150_000,
            value_date: NaiveDate::from_ymd_opt(2025, 1, 15).unwrap(),
            bank_transfer_id: Some("trc-1".into()),
            check_number: None,
            outstanding: Outstanding {
                fees: Money::ZERO,
                interest: Money::cents(50_000).unwrap(),
                principal: Money::cents(80_000).unwrap(),
                escrow: Money::cents(20_000).unwrap(),
            },
            posting_ready: true,
            requires_review: false,
            correlation_id: idempotency_key.into(),
            actor_id: "servicing-worker".into(),
        }
    }

    fn poster() -> InMemoryPosterService {
        InMemoryPosterService::new(InMemoryPaymentEventLog::shared(), InMemoryOutboxStore::shared())
    }

    #[tokio::test]
    async fn clean_ach_posting_allocates_and_balances() {
        let poster = poster();
        let tenant = Uuid::new_v4();
        let outcome = poster.post_payment(request(tenant, "key-1")).await.unwrap();

        assert!(outcome.is_new);
        assert_eq!(outcome.payment.state, PaymentState::Posted);
        assert_eq!(outcome.payment.allocation.interest, 50_000);
        assert_eq!(outcome.payment.allocation.principal, 80_000);
        assert_eq!(outcome.payment.allocation.escrow, 20_000);
        assert_eq!(outcome.payment.allocation.suspense, 0);

        let entries = poster
            .ledger_entries_for_payment(&tenant, &outcome.payment.id)
            .await
            .unwrap();
        let debit_total: i64 = entries.iter().map(|e| e.debit_cents).sum();
        let credit_total: i64 = entries.iter().map(|e| e.credit_cents).sum();
        assert_eq!(debit_total, credit_total);
        assert_eq!(debit_total, 150_000);
    }

    #[tokio::test]
    async fn retry_with_same_idempotency_key_is_a_no_op() {
        let poster = poster();
        let tenant = Uuid::new_v4();
        let first = poster.post_payment(request(tenant, "key-2")).await.unwrap();
        let second = poster.post_payment(request(tenant, "key-2")).await.unwrap();

        assert!(!second.is_new);
        assert_eq!(first.payment.id, second.payment.id);

        let entries = poster
            .ledger_entries_for_payment(&tenant, &first.payment.id)
            .await
            .unwrap();
        assert_eq!(entries.len(), 4, "no duplicate ledger lines written on retry");
    }

    #[tokio::test]
    async fn unmatched_loan_posts_everything_to_suspense() {
        let poster = poster();
        let tenant = Uuid::new_v4();
        let mut req = request(tenant, "key-3");
        req.loan_id = None;
        req.posting_ready = false;
        req.requires_review = true;
        req.amount_cents = 500_000;

        let outcome = poster.post_payment(req).await.unwrap();
        assert_eq!(outcome.payment.state, PaymentState::Allocated);
        assert_eq!(outcome.payment.allocation.suspense, 500_000);
        assert!(outcome.payment.requires_review);
    }

    #[tokio::test]
    async fn rejects_non_positive_amount() {
        let poster = poster();
        let mut req = request(Uuid::new_v4(), "key-4");
        req.amount_cents = 0;
        let err = poster.post_payment(req).await.unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));
    }
}
