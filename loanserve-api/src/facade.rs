//! Payment ingestion and posting pipeline: normalize a channel payload
//! into an envelope, run it through posting-readiness, then hand it to
//! the poster. Blocked payments never reach the poster at all — the
//! ledger is only ever touched by `Ready` (real waterfall) or `Pending`
//! (suspense-only) decisions.

use std::sync::Arc;

use loanserve_bank_ingest::EnvelopeBorrower;
use loanserve_bank_ingest::EnvelopePayment;
use loanserve_bank_ingest::EnvelopeSource;
use loanserve_bank_ingest::PaymentEnvelope;
use loanserve_bank_ingest::build_envelope;
use loanserve_ledger::LedgerError;
use loanserve_ledger::LedgerResult;
use loanserve_ledger::Payment;
use loanserve_ledger::PostPaymentRequest;
use loanserve_ledger::PosterService;
use loanserve_ledger::waterfall::Outstanding;
use loanserve_policy::PolicyContext;
use loanserve_policy::PolicyEngine;
use loanserve_policy::PostingReadinessRequest;
use loanserve_policy::ReadinessDecision;
use loanserve_policy::TenantId;

use crate::ServiceTelemetry;

/// Everything the facade needs to build and submit an envelope. The
/// channel adapter (file parser or JSON handler) is responsible for
/// producing `source`/`borrower`/`payment`; this facade owns validation,
/// readiness, and posting.
#[derive(Debug, Clone)]
pub struct SubmitPaymentRequest {
    pub tenant_id: TenantId,
    pub source: EnvelopeSource,
    pub borrower: EnvelopeBorrower,
    pub payment: EnvelopePayment,
    pub correlation_id: String,
    pub occurred_at: chrono::DateTime<chrono::Utc>,
    pub extra_risk_flags: Vec<String>,
    pub outstanding: Outstanding,
    pub actor_id: String,
}

#[derive(Debug, Clone)]
pub struct SubmitPaymentOutcome {
    pub envelope: PaymentEnvelope,
    pub payment: Payment,
    pub is_new: bool,
    pub readiness: ReadinessDecision,
}

#[derive(Debug, thiserror::Error)]
pub enum IntakeError {
    #[error("invalid envelope: {0:?}")]
    InvalidEnvelope(Vec<String>),
    #[error("payment blocked: loan/amount is on a blocked list for this tenant")]
    Blocked,
    #[error(transparent)]
    Policy(#[from] loanserve_policy::PolicyError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

#[derive(Clone)]
pub struct PaymentIntakeFacade {
    poster: Arc<dyn PosterService>,
    policy: Arc<PolicyEngine>,
    telemetry: Option<Arc<ServiceTelemetry>>,
}

impl PaymentIntakeFacade {
    pub fn new(poster: Arc<dyn PosterService>, policy: Arc<PolicyEngine>) -> Self {
        Self::with_telemetry(poster, policy, None)
    }

    pub fn with_telemetry(
        poster: Arc<dyn PosterService>,
        policy: Arc<PolicyEngine>,
        telemetry: Option<Arc<ServiceTelemetry>>,
    ) -> Self {
        Self {
            poster,
            policy,
            telemetry,
        }
    }

    pub async fn submit_payment(
        &self,
        request: SubmitPaymentRequest,
    ) -> Result<SubmitPaymentOutcome, IntakeError> {
        if let Some(telemetry) = &self.telemetry {
            telemetry.record_payment_submitted();
        }

        let envelope = build_envelope(
            request.source,
            request.borrower,
            request.payment,
            request.correlation_id.clone(),
            request.occurred_at,
            &request.extra_risk_flags,
        )
        .map_err(|err| match err {
            loanserve_bank_ingest::BankIngestError::InvalidEnvelope(reasons) => {
                IntakeError::InvalidEnvelope(reasons)
            }
            other => IntakeError::InvalidEnvelope(vec![other.to_string()]),
        })?;

        let loan_matched = envelope.borrower.loan_id.is_some();
        let risk_score = envelope.risk.as_ref().map_or(0, |risk| risk.score);

        let mut readiness_request =
            PostingReadinessRequest::new(request.tenant_id, envelope.payment.amount_cents, envelope.source.channel.as_str());
        readiness_request.loan_id = envelope.borrower.loan_id.clone();
        readiness_request.risk_score = risk_score;
        readiness_request.loan_matched = loan_matched;
        readiness_request.submitted_at = envelope.occurred_at;

        let context = PolicyContext {
            tenant_id: request.tenant_id,
            actor: request.actor_id.clone(),
        };
        let outcome = self.policy.evaluate(context, readiness_request).await?;

        if matches!(outcome.decision, ReadinessDecision::Blocked) {
            if let Some(telemetry) = &self.telemetry {
                telemetry.record_payment_blocked();
            }
            return Err(IntakeError::Blocked);
        }

        let posting_ready = matches!(outcome.decision, ReadinessDecision::Ready);
        let requires_review = envelope.requires_review || !posting_ready;

        let poster_outcome = self
            .poster
            .post_payment(PostPaymentRequest {
                tenant_id: request.tenant_id,
                loan_id: envelope.borrower.loan_id.clone(),
                channel: envelope.source.channel.as_str().to_string(),
                idempotency_key: envelope.idempotency_key.clone(),
                amount_cents: envelope.payment.amount_cents,
                value_date: envelope.payment.value_date,
                bank_transfer_id: envelope.external.as_ref().and_then(|e| e.bank_transfer_id.clone()),
                check_number: envelope.payment.details.check_number.clone(),
                outstanding: request.outstanding,
                posting_ready,
                requires_review,
                correlation_id: request.correlation_id,
                actor_id: request.actor_id,
            })
            .await?;

        if let Some(telemetry) = &self.telemetry {
            telemetry.record_payment_posted(poster_outcome.is_new);
        }

        Ok(SubmitPaymentOutcome {
            envelope,
            payment: poster_outcome.payment,
            is_new: poster_outcome.is_new,
            readiness: outcome.decision,
        })
    }

    pub async fn get_payment(
        &self,
        tenant_id: &TenantId,
        payment_id: &loanserve_ledger::PaymentId,
    ) -> LedgerResult<Payment> {
        self.poster.get_payment(tenant_id, payment_id).await
    }
}
