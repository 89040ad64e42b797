#![deny(clippy::print_stdout, clippy::print_stderr)]

//! Daily servicing cycle engine (spec 4.8): run lifecycle, per-loan
//! pipeline with idempotent event keys, reconciliation of beneficiary vs.
//! investor disbursements, and exception emission. The run lifecycle
//! reuses the "create pending, transition, collect sub-records as you go"
//! shape from the teacher's approval-task state machine and
//! reconciliation-session pattern: a run owns its events and exceptions
//! the same way a reconciliation session owns its match candidates.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::NaiveDate;
use chrono::Utc;
use loanserve_audit_log::Actor;
use loanserve_audit_log::AppendRequest;
use loanserve_audit_log::EventType as AuditEventType;
use loanserve_audit_log::PaymentEventLog;
use loanserve_ledger::Money;
use loanserve_ledger::Outstanding;
use loanserve_ledger::PostPaymentRequest;
use loanserve_ledger::PosterService;
use serde::Deserialize;
use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

pub type TenantId = Uuid;
pub type RunId = Uuid;
pub type ServicingResult<T> = Result<T, ServicingError>;

#[derive(Debug, Error)]
pub enum ServicingError {
    #[error("resource not found: {0}")]
    NotFound(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invariant violation: {0}")]
    Invariant(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("internal error: {0}")]
    Internal(String),
}

// ---------------------------------------------------------------------
// Run lifecycle
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReconciliationStatus {
    Pending,
    Balanced,
    Imbalanced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServicingEventType {
    InterestAccrual,
    PostPayment,
    AssessFee,
    LateFee,
    EscrowDisbursement,
    InvestorDistribution,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventStatus {
    Success,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServicingEvent {
    pub run_id: RunId,
    pub event_key: String,
    pub event_type: ServicingEventType,
    pub loan_id: String,
    pub valuation_date: NaiveDate,
    pub amount_cents: i64,
    pub principal_cents: i64,
    pub interest_cents: i64,
    pub escrow_cents: i64,
    pub fees_cents: i64,
    pub details: serde_json::Value,
    pub status: EventStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Bands reused verbatim from spec 4.9's reconciliation severity
    /// thresholds (interpreted in minor units, consistent with the rest of
    /// the system's cents convention) since spec 4.8 only says "severity
    /// heuristics per check" without naming one.
    #[must_use]
    pub fn from_magnitude_cents(magnitude: i64) -> Severity {
        let magnitude = magnitude.abs();
        if magnitude >= 10_000 {
            Severity::Critical
        } else if magnitude >= 1_000 {
            Severity::High
        } else if magnitude >= 100 {
            Severity::Medium
        } else {
            Severity::Low
        }
    }

    #[must_use]
    pub fn due_in_days(&self) -> i64 {
        match self {
            Severity::Critical => 1,
            Severity::High => 3,
            Severity::Medium | Severity::Low => 7,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExceptionStatus {
    Open,
    Resolved,
    Waived,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServicingException {
    pub run_id: RunId,
    pub loan_id: String,
    pub severity: Severity,
    pub exception_type: String,
    pub message: String,
    pub suggested_action: String,
    pub due_date: NaiveDate,
    pub status: ExceptionStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServicingRun {
    pub run_id: RunId,
    pub tenant_id: TenantId,
    pub valuation_date: NaiveDate,
    pub status: RunStatus,
    pub total_loans: usize,
    pub loans_processed: usize,
    pub events_created: usize,
    pub exceptions_created: usize,
    pub total_disbursed_beneficiary_cents: i64,
    pub total_disbursed_investors_cents: i64,
    pub reconciliation_status: ReconciliationStatus,
    pub dry_run: bool,
    pub loan_ids: Option<Vec<String>>,
    pub input_hash: String,
    pub errors: Vec<String>,
    pub events: Vec<ServicingEvent>,
    pub exceptions: Vec<ServicingException>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------
// Per-loan input. Loan/investor/escrow tables are external (spec 6); the
// caller supplies the snapshot this run needs rather than the engine
// reaching into a domain database it doesn't own.
// ---------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PendingPayment {
    pub payment_id: Uuid,
    pub idempotency_key: String,
    pub channel: String,
    pub amount_cents: i64,
    pub value_date: NaiveDate,
    pub posting_ready: bool,
}

#[derive(Debug, Clone)]
pub struct FeeDue {
    pub fee_id: String,
    pub amount_cents: i64,
}

#[derive(Debug, Clone)]
pub struct EscrowDisbursementDue {
    pub disbursement_id: String,
    pub amount_cents: i64,
    pub due_date: NaiveDate,
}

/// Ownership share in parts-per-million, resolving spec 9's open question
/// on percentage precision as decimal(8,6): six decimal digits become an
/// integer 0..=1_000_000 rather than a float, so a loan's shares can be
/// asserted to sum to exactly 1_000_000 without rounding surprises.
#[derive(Debug, Clone)]
pub struct InvestorShare {
    pub investor_id: String,
    pub ownership_ppm: u32,
}

#[derive(Debug, Clone)]
pub struct LoanInput {
    pub loan_id: String,
    pub origination_date: NaiveDate,
    pub last_accrual_date: Option<NaiveDate>,
    pub annual_rate_bps: Option<u32>,
    pub outstanding: Outstanding,
    pub pending_payments: Vec<PendingPayment>,
    pub fees_due: Vec<FeeDue>,
    pub days_late: u32,
    pub grace_period_days: u32,
    pub current_balance_cents: i64,
    pub escrow_disbursements_due: Vec<EscrowDisbursementDue>,
    pub investor_shares: Vec<InvestorShare>,
    pub escrow_balance_cents: i64,
    pub escrow_required_cents: i64,
    pub maturity_date: NaiveDate,
    pub has_payment_schedule: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StartRunRequest {
    pub valuation_date: NaiveDate,
    pub loan_ids: Option<Vec<String>>,
    pub dry_run: bool,
    #[serde(skip)]
    pub loans: Vec<LoanInputSnapshot>,
}

/// Input hashing only covers `{valuation_date, loan_ids, dry_run}` per spec
/// 4.8; the actual loan snapshots are excluded (`LoanInput` isn't
/// `Serialize` on purpose — it never participates in the hash).
pub type LoanInputSnapshot = LoanInput;

fn event_key(step: &str, loan_id: &str, date: NaiveDate, sub_id: Option<&str>) -> String {
    match sub_id {
        Some(sub) => format!("{step}_{loan_id}_{date}_{sub}"),
        None => format!("{step}_{loan_id}_{date}"),
    }
}

fn compute_input_hash(valuation_date: NaiveDate, loan_ids: &Option<Vec<String>>, dry_run: bool) -> String {
    let payload = serde_json::json!({
        "valuation_date": valuation_date.to_string(),
        "loan_ids": loan_ids,
        "dry_run": dry_run,
    });
    let mut hasher = Sha256::new();
    hasher.update(loanserve_audit_log::canonicalize(&payload).as_bytes());
    format!("{:x}", hasher.finalize())
}

// ---------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------

#[async_trait]
pub trait ServicingEngine: Send + Sync {
    async fn start_run(&self, tenant_id: TenantId, request: StartRunRequest) -> ServicingResult<ServicingRun>;

    async fn get_run(&self, tenant_id: TenantId, run_id: RunId) -> ServicingResult<ServicingRun>;

    /// Deletes this run's events for `(loan_id, valuation_date)` and
    /// re-runs the per-loan pipeline for that loan only, with
    /// `dry_run=false` (spec 4.8).
    async fn reprocess_loan(
        &self,
        tenant_id: TenantId,
        run_id: RunId,
        loan: LoanInput,
    ) -> ServicingResult<ServicingRun>;
}

struct EngineState {
    runs: HashMap<RunId, ServicingRun>,
    running_by_tenant: HashMap<TenantId, RunId>,
}

pub struct InMemoryServicingEngine {
    state: Mutex<EngineState>,
    event_log: Arc<dyn PaymentEventLog>,
    poster: Arc<dyn PosterService>,
}

impl InMemoryServicingEngine {
    #[must_use]
    pub fn new(event_log: Arc<dyn PaymentEventLog>, poster: Arc<dyn PosterService>) -> Self {
        Self {
            state: Mutex::new(EngineState {
                runs: HashMap::new(),
                running_by_tenant: HashMap::new(),
            }),
            event_log,
            poster,
        }
    }

    #[must_use]
    pub fn shared(event_log: Arc<dyn PaymentEventLog>, poster: Arc<dyn PosterService>) -> Arc<Self> {
        Arc::new(Self::new(event_log, poster))
    }

    fn record(
        run: &mut ServicingRun,
        seen_keys: &mut HashSet<String>,
        event: ServicingEvent,
    ) {
        if !seen_keys.insert(event.event_key.clone()) {
            return;
        }
        run.events.push(event);
    }

    async fn accrue_interest(
        &self,
        run: &mut ServicingRun,
        seen_keys: &mut HashSet<String>,
        loan: &LoanInput,
        valuation_date: NaiveDate,
    ) {
        let Some(rate_bps) = loan.annual_rate_bps else {
            return;
        };
        let from_date = loan.last_accrual_date.unwrap_or(loan.origination_date);
        if from_date > valuation_date {
            return;
        }
        let day_count = (valuation_date - from_date).num_days().max(0);
        let denom: i128 = 365 * 10_000;
        let numerator =
            i128::from(loan.current_balance_cents) * i128::from(rate_bps) * i128::from(day_count);
        let accrued = ((numerator + denom / 2) / denom) as i64;

        Self::record(
            run,
            seen_keys,
            ServicingEvent {
                run_id: run.run_id,
                event_key: event_key("interest_accrual", &loan.loan_id, valuation_date, None),
                event_type: ServicingEventType::InterestAccrual,
                loan_id: loan.loan_id.clone(),
                valuation_date,
                amount_cents: accrued,
                principal_cents: 0,
                interest_cents: accrued,
                escrow_cents: 0,
                fees_cents: 0,
                details: serde_json::json!({
                    "from_date": from_date.to_string(),
                    "to_date": valuation_date.to_string(),
                    "day_count": day_count,
                    "day_count_convention": "ACT/365",
                }),
                status: EventStatus::Success,
            },
        );
    }

    async fn post_matched_payments(
        &self,
        run: &mut ServicingRun,
        seen_keys: &mut HashSet<String>,
        loan: &LoanInput,
        tenant_id: TenantId,
        valuation_date: NaiveDate,
    ) {
        for payment in &loan.pending_payments {
            if payment.value_date > valuation_date {
                continue;
            }
            let key = event_key(
                "post_payment",
                &loan.loan_id,
                valuation_date,
                Some(&payment.payment_id.to_string()),
            );
            if seen_keys.contains(&key) {
                continue;
            }

            let outcome = self
                .poster
                .post_payment(PostPaymentRequest {
                    tenant_id,
                    loan_id: Some(loan.loan_id.clone()),
                    channel: payment.channel.clone(),
                    idempotency_key: payment.idempotency_key.clone(),
                    amount_cents: payment.amount_cents,
                    value_date: payment.value_date,
                    bank_transfer_id: None,
                    check_number: None,
                    outstanding: loan.outstanding,
                    posting_ready: payment.posting_ready,
                    requires_review: !payment.posting_ready,
                    correlation_id: key.clone(),
                    actor_id: "servicing-engine".into(),
                })
                .await;

            let status = if outcome.is_ok() { EventStatus::Success } else { EventStatus::Failed };
            if let Err(err) = &outcome {
                run.errors.push(format!("post_payment {key}: {err}"));
            }

            Self::record(
                run,
                seen_keys,
                ServicingEvent {
                    run_id: run.run_id,
                    event_key: key,
                    event_type: ServicingEventType::PostPayment,
                    loan_id: loan.loan_id.clone(),
                    valuation_date,
                    amount_cents: payment.amount_cents,
                    principal_cents: 0,
                    interest_cents: 0,
                    escrow_cents: 0,
                    fees_cents: 0,
                    details: serde_json::json!({"payment_id": payment.payment_id}),
                    status,
                },
            );
        }
    }

    fn assess_fees(
        run: &mut ServicingRun,
        seen_keys: &mut HashSet<String>,
        loan: &LoanInput,
        valuation_date: NaiveDate,
    ) {
        for fee in &loan.fees_due {
            Self::record(
                run,
                seen_keys,
                ServicingEvent {
                    run_id: run.run_id,
                    event_key: event_key("assess_fee", &loan.loan_id, valuation_date, Some(&fee.fee_id)),
                    event_type: ServicingEventType::AssessFee,
                    loan_id: loan.loan_id.clone(),
                    valuation_date,
                    amount_cents: fee.amount_cents,
                    principal_cents: 0,
                    interest_cents: 0,
                    escrow_cents: 0,
                    fees_cents: fee.amount_cents,
                    details: serde_json::json!({"fee_id": fee.fee_id}),
                    status: EventStatus::Success,
                },
            );
        }

        // Late fee triggers when days_late > grace_period_days AND current
        // balance > 0 (spec 4.8).
        if loan.days_late > loan.grace_period_days && loan.current_balance_cents > 0 {
            let late_fee_cents = (loan.current_balance_cents / 200).max(2_500);
            Self::record(
                run,
                seen_keys,
                ServicingEvent {
                    run_id: run.run_id,
                    event_key: event_key("late_fee", &loan.loan_id, valuation_date, None),
                    event_type: ServicingEventType::LateFee,
                    loan_id: loan.loan_id.clone(),
                    valuation_date,
                    amount_cents: late_fee_cents,
                    principal_cents: 0,
                    interest_cents: 0,
                    escrow_cents: 0,
                    fees_cents: late_fee_cents,
                    details: serde_json::json!({"days_late": loan.days_late}),
                    status: EventStatus::Success,
                },
            );
        }
    }

    fn disburse_escrow(
        run: &mut ServicingRun,
        seen_keys: &mut HashSet<String>,
        loan: &LoanInput,
        valuation_date: NaiveDate,
    ) -> i64 {
        let mut total = 0i64;
        for disbursement in &loan.escrow_disbursements_due {
            if disbursement.due_date > valuation_date {
                continue;
            }
            total += disbursement.amount_cents;
            Self::record(
                run,
                seen_keys,
                ServicingEvent {
                    run_id: run.run_id,
                    event_key: event_key(
                        "escrow_disbursement",
                        &loan.loan_id,
                        valuation_date,
                        Some(&disbursement.disbursement_id),
                    ),
                    event_type: ServicingEventType::EscrowDisbursement,
                    loan_id: loan.loan_id.clone(),
                    valuation_date,
                    amount_cents: disbursement.amount_cents,
                    principal_cents: 0,
                    interest_cents: 0,
                    escrow_cents: disbursement.amount_cents,
                    fees_cents: 0,
                    details: serde_json::json!({"disbursement_id": disbursement.disbursement_id}),
                    status: EventStatus::Success,
                },
            );
        }
        total
    }

    fn distribute_to_investors(
        run: &mut ServicingRun,
        seen_keys: &mut HashSet<String>,
        loan: &LoanInput,
        valuation_date: NaiveDate,
    ) -> i64 {
        let mut total = 0i64;
        for payment in &loan.pending_payments {
            if payment.value_date > valuation_date {
                continue;
            }
            for share in &loan.investor_shares {
                let amount =
                    (i128::from(payment.amount_cents) * i128::from(share.ownership_ppm) / 1_000_000) as i64;
                if amount == 0 {
                    continue;
                }
                total += amount;
                Self::record(
                    run,
                    seen_keys,
                    ServicingEvent {
                        run_id: run.run_id,
                        event_key: event_key(
                            "investor_distribution",
                            &loan.loan_id,
                            valuation_date,
                            Some(&format!("{}_{}", share.investor_id, payment.payment_id)),
                        ),
                        event_type: ServicingEventType::InvestorDistribution,
                        loan_id: loan.loan_id.clone(),
                        valuation_date,
                        amount_cents: amount,
                        principal_cents: 0,
                        interest_cents: 0,
                        escrow_cents: 0,
                        fees_cents: 0,
                        details: serde_json::json!({
                            "investor_id": share.investor_id,
                            "payment_id": payment.payment_id,
                            "ownership_ppm": share.ownership_ppm,
                        }),
                        status: EventStatus::Success,
                    },
                );
            }
        }
        total
    }

    fn check_exceptions(run: &mut ServicingRun, loan: &LoanInput, valuation_date: NaiveDate) {
        let mut open = |severity: Severity, exception_type: &str, message: String, suggested_action: &str| {
            run.exceptions.push(ServicingException {
                run_id: run.run_id,
                loan_id: loan.loan_id.clone(),
                severity,
                exception_type: exception_type.to_string(),
                message,
                suggested_action: suggested_action.to_string(),
                due_date: valuation_date + chrono::Duration::days(severity.due_in_days()),
                status: ExceptionStatus::Open,
            });
        };

        let escrow_shortfall = loan.escrow_required_cents - loan.escrow_balance_cents;
        if escrow_shortfall > 0 {
            open(
                Severity::from_magnitude_cents(escrow_shortfall),
                "escrow_shortfall",
                format!("escrow balance is short {escrow_shortfall} cents of the required reserve"),
                "review escrow analysis and adjust monthly collection",
            );
        }

        if loan.days_late > 90 {
            open(
                Severity::Critical,
                "payment_delinquency",
                format!("loan is {} days delinquent", loan.days_late),
                "initiate collections / loss mitigation review",
            );
        } else if loan.days_late > 60 {
            open(
                Severity::High,
                "payment_delinquency",
                format!("loan is {} days delinquent", loan.days_late),
                "escalate to collections",
            );
        } else if loan.days_late > 30 {
            open(
                Severity::Medium,
                "payment_delinquency",
                format!("loan is {} days delinquent", loan.days_late),
                "send delinquency notice",
            );
        }

        if loan.annual_rate_bps.is_none() || !loan.has_payment_schedule {
            open(
                Severity::High,
                "data_integrity",
                "loan is missing rate or payment schedule data".to_string(),
                "correct loan master data before next run",
            );
        }

        let days_to_maturity = (loan.maturity_date - valuation_date).num_days();
        if days_to_maturity < 30 {
            open(
                Severity::High,
                "maturity_imminent",
                format!("loan matures in {days_to_maturity} days"),
                "prepare payoff / maturity handling",
            );
        } else if days_to_maturity < 90 {
            open(
                Severity::Medium,
                "maturity_imminent",
                format!("loan matures in {days_to_maturity} days"),
                "notify borrower of upcoming maturity",
            );
        }
    }

    async fn run_loan_pipeline(
        &self,
        run: &mut ServicingRun,
        seen_keys: &mut HashSet<String>,
        loan: &LoanInput,
        tenant_id: TenantId,
        valuation_date: NaiveDate,
    ) {
        self.accrue_interest(run, seen_keys, loan, valuation_date).await;
        self.post_matched_payments(run, seen_keys, loan, tenant_id, valuation_date).await;
        Self::assess_fees(run, seen_keys, loan, valuation_date);
        let beneficiary = Self::disburse_escrow(run, seen_keys, loan, valuation_date);
        let investors = Self::distribute_to_investors(run, seen_keys, loan, valuation_date);
        run.total_disbursed_beneficiary_cents += beneficiary;
        run.total_disbursed_investors_cents += investors;
        Self::check_exceptions(run, loan, valuation_date);
    }

    fn reconcile(run: &mut ServicingRun) {
        let diff = (run.total_disbursed_beneficiary_cents - run.total_disbursed_investors_cents).abs();
        run.reconciliation_status = if diff == 0 {
            ReconciliationStatus::Balanced
        } else if diff < 1_000 {
            ReconciliationStatus::Pending
        } else {
            ReconciliationStatus::Imbalanced
        };
        if run.reconciliation_status == ReconciliationStatus::Imbalanced {
            run.exceptions.push(ServicingException {
                run_id: run.run_id,
                loan_id: String::new(),
                severity: Severity::Critical,
                exception_type: "servicing_run_imbalanced".into(),
                message: format!(
                    "beneficiary disbursements ({}) and investor disbursements ({}) differ by {} cents",
                    run.total_disbursed_beneficiary_cents, run.total_disbursed_investors_cents, diff
                ),
                suggested_action: "investigate disbursement totals before closing the run".into(),
                due_date: run.valuation_date + chrono::Duration::days(1),
                status: ExceptionStatus::Open,
            });
        }
    }

    async fn append_audit(&self, tenant_id: TenantId, event_type: AuditEventType, data: serde_json::Value, correlation_id: &str) {
        let _ = self
            .event_log
            .append(AppendRequest {
                tenant_id,
                payment_id: None,
                ingestion_id: None,
                event_type,
                actor: Actor::System,
                actor_id: "servicing-engine".into(),
                correlation_id: correlation_id.to_string(),
                data,
            })
            .await;
    }
}

#[async_trait]
impl ServicingEngine for InMemoryServicingEngine {
    async fn start_run(&self, tenant_id: TenantId, request: StartRunRequest) -> ServicingResult<ServicingRun> {
        let mut state = self.state.lock().await;
        if state.running_by_tenant.contains_key(&tenant_id) {
            return Err(ServicingError::Conflict(
                "a servicing run is already running for this tenant".into(),
            ));
        }

        let input_hash = compute_input_hash(request.valuation_date, &request.loan_ids, request.dry_run);
        let run_id = Uuid::new_v4();
        let mut run = ServicingRun {
            run_id,
            tenant_id,
            valuation_date: request.valuation_date,
            status: RunStatus::Running,
            total_loans: request.loans.len(),
            loans_processed: 0,
            events_created: 0,
            exceptions_created: 0,
            total_disbursed_beneficiary_cents: 0,
            total_disbursed_investors_cents: 0,
            reconciliation_status: ReconciliationStatus::Pending,
            dry_run: request.dry_run,
            loan_ids: request.loan_ids.clone(),
            input_hash,
            errors: Vec::new(),
            events: Vec::new(),
            exceptions: Vec::new(),
            created_at: Utc::now(),
        };
        state.running_by_tenant.insert(tenant_id, run_id);
        drop(state);

        self.append_audit(
            tenant_id,
            AuditEventType::ServicingRunStarted,
            serde_json::json!({"run_id": run_id, "valuation_date": request.valuation_date.to_string()}),
            &run_id.to_string(),
        )
        .await;

        let mut seen_keys: HashSet<String> = HashSet::new();
        let selected: Vec<&LoanInput> = match &request.loan_ids {
            Some(ids) => request.loans.iter().filter(|l| ids.contains(&l.loan_id)).collect(),
            None => request.loans.iter().collect(),
        };

        for loan in selected {
            self.run_loan_pipeline(&mut run, &mut seen_keys, loan, tenant_id, request.valuation_date)
                .await;
            run.loans_processed += 1;
        }

        Self::reconcile(&mut run);
        run.events_created = run.events.len();
        run.exceptions_created = run.exceptions.len();
        run.status = RunStatus::Completed;

        for exception in &run.exceptions {
            self.append_audit(
                tenant_id,
                AuditEventType::ServicingExceptionOpened,
                serde_json::json!({
                    "run_id": run_id,
                    "loan_id": exception.loan_id,
                    "severity": format!("{:?}", exception.severity),
                    "exception_type": exception.exception_type,
                }),
                &run_id.to_string(),
            )
            .await;
        }
        self.append_audit(
            tenant_id,
            AuditEventType::ServicingRunCompleted,
            serde_json::json!({
                "run_id": run_id,
                "loans_processed": run.loans_processed,
                "events_created": run.events_created,
                "exceptions_created": run.exceptions_created,
                "reconciliation_status": format!("{:?}", run.reconciliation_status),
            }),
            &run_id.to_string(),
        )
        .await;

        let mut state = self.state.lock().await;
        state.running_by_tenant.remove(&tenant_id);
        state.runs.insert(run_id, run.clone());
        Ok(run)
    }

    async fn get_run(&self, tenant_id: TenantId, run_id: RunId) -> ServicingResult<ServicingRun> {
        let state = self.state.lock().await;
        state
            .runs
            .get(&run_id)
            .filter(|r| r.tenant_id == tenant_id)
            .cloned()
            .ok_or_else(|| ServicingError::NotFound(format!("servicing run {run_id} not found")))
    }

    async fn reprocess_loan(
        &self,
        tenant_id: TenantId,
        run_id: RunId,
        loan: LoanInput,
    ) -> ServicingResult<ServicingRun> {
        let mut state = self.state.lock().await;
        let mut run = state
            .runs
            .get(&run_id)
            .filter(|r| r.tenant_id == tenant_id)
            .cloned()
            .ok_or_else(|| ServicingError::NotFound(format!("servicing run {run_id} not found")))?;

        run.events
            .retain(|e| !(e.loan_id == loan.loan_id && e.valuation_date == run.valuation_date));
        run.exceptions
            .retain(|e| !(e.loan_id == loan.loan_id));
        run.dry_run = false;

        let mut seen_keys: HashSet<String> = run.events.iter().map(|e| e.event_key.clone()).collect();
        run.total_disbursed_beneficiary_cents = 0;
        run.total_disbursed_investors_cents = 0;

        drop(state);
        self.run_loan_pipeline(&mut run, &mut seen_keys, &loan, tenant_id, run.valuation_date)
            .await;
        Self::reconcile(&mut run);
        run.events_created = run.events.len();
        run.exceptions_created = run.exceptions.len();

        let mut state = self.state.lock().await;
        state.runs.insert(run_id, run.clone());
        Ok(run)
    }
}

#[cfg(feature = "postgres-store")]
pub struct PostgresServicingEngine;

#[cfg(feature = "postgres-store")]
#[async_trait]
impl ServicingEngine for PostgresServicingEngine {
    async fn start_run(&self, _tenant_id: TenantId, _request: StartRunRequest) -> ServicingResult<ServicingRun> {
        Err(ServicingError::Storage(
            "postgres-backed servicing engine not yet implemented".into(),
        ))
    }

    async fn get_run(&self, _tenant_id: TenantId, _run_id: RunId) -> ServicingResult<ServicingRun> {
        Err(ServicingError::Storage(
            "postgres-backed servicing engine not yet implemented".into(),
        ))
    }

    async fn reprocess_loan(
        &self,
        _tenant_id: TenantId,
        _run_id: RunId,
        _loan: LoanInput,
    ) -> ServicingResult<ServicingRun> {
        Err(ServicingError::Storage(
            "postgres-backed servicing engine not yet implemented".into(),
        ))
    }
}
