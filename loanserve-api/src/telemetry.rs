//! In-process counters for the surfaces the facades front: payment
//! intake, posting readiness, the outbox dispatcher, servicing runs, and
//! reconciliation. A plain `Arc<Mutex<..>>` registry, not persisted to
//! disk — nothing in the metrics surface calls for survival across
//! restarts, and a process boundary is the natural reset point for these.

use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use loanserve_policy::PolicyEventSink;
use loanserve_policy::ReadinessDecision;
use loanserve_policy::ReadinessEvaluationEvent;
use serde::Deserialize;
use serde::Serialize;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelemetryCounters {
    pub payments_submitted: usize,
    pub payments_posted_new: usize,
    pub payments_idempotent_replay: usize,
    pub payments_rejected_blocked: usize,
    pub outbox_dispatched: usize,
    pub outbox_parked: usize,
    pub reconciliation_variances_recorded: usize,
    pub reconciliation_exceptions_opened: usize,
    pub servicing_runs_completed: usize,
    pub servicing_exceptions_opened: usize,
    pub policy_ready: usize,
    pub policy_pending: usize,
    pub policy_blocked: usize,
}

#[derive(Debug, Default)]
struct TelemetryInner {
    counters: TelemetryCounters,
}

#[derive(Clone, Default)]
pub struct ServiceTelemetry {
    inner: Arc<Mutex<TelemetryInner>>,
}

impl ServiceTelemetry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn update<F>(&self, updater: F)
    where
        F: FnOnce(&mut TelemetryCounters),
    {
        if let Ok(mut inner) = self.inner.lock() {
            updater(&mut inner.counters);
        }
    }

    pub fn record_payment_submitted(&self) {
        self.update(|counters| counters.payments_submitted += 1);
    }

    pub fn record_payment_posted(&self, is_new: bool) {
        self.update(|counters| {
            if is_new {
                counters.payments_posted_new += 1;
            } else {
                counters.payments_idempotent_replay += 1;
            }
        });
    }

    pub fn record_payment_blocked(&self) {
        self.update(|counters| counters.payments_rejected_blocked += 1);
    }

    pub fn record_outbox_dispatch(&self, dispatched: usize, parked: usize) {
        self.update(|counters| {
            counters.outbox_dispatched += dispatched;
            counters.outbox_parked += parked;
        });
    }

    pub fn record_reconciliation_variance(&self, exception_opened: bool) {
        self.update(|counters| {
            counters.reconciliation_variances_recorded += 1;
            if exception_opened {
                counters.reconciliation_exceptions_opened += 1;
            }
        });
    }

    pub fn record_servicing_run(&self, exceptions_created: usize) {
        self.update(|counters| {
            counters.servicing_runs_completed += 1;
            counters.servicing_exceptions_opened += exceptions_created;
        });
    }

    fn record_readiness_decision(&self, decision: ReadinessDecision) {
        self.update(|counters| match decision {
            ReadinessDecision::Ready => counters.policy_ready += 1,
            ReadinessDecision::Pending => counters.policy_pending += 1,
            ReadinessDecision::Blocked => counters.policy_blocked += 1,
        });
    }

    #[must_use]
    pub fn snapshot(&self) -> TelemetryCounters {
        self.inner
            .lock()
            .map(|inner| inner.counters.clone())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn policy_sink(&self) -> TelemetryPolicyEventSink {
        TelemetryPolicyEventSink {
            telemetry: self.clone(),
        }
    }
}

#[derive(Clone)]
pub struct TelemetryPolicyEventSink {
    telemetry: ServiceTelemetry,
}

#[async_trait]
impl PolicyEventSink for TelemetryPolicyEventSink {
    async fn record(&self, event: ReadinessEvaluationEvent) {
        self.telemetry.record_readiness_decision(event.decision);
    }
}
