use std::sync::Arc;

use loanserve_servicing::LoanInput;
use loanserve_servicing::RunId;
use loanserve_servicing::ServicingEngine;
use loanserve_servicing::ServicingResult;
use loanserve_servicing::ServicingRun;
use loanserve_servicing::StartRunRequest;
use loanserve_servicing::TenantId;

use crate::ServiceTelemetry;

/// Thin wrapper over `ServicingEngine`: starts/inspects daily runs and
/// bumps telemetry once a run lands in a terminal state.
#[derive(Clone)]
pub struct ServicingFacade {
    engine: Arc<dyn ServicingEngine>,
    telemetry: Option<Arc<ServiceTelemetry>>,
}

impl ServicingFacade {
    pub fn new(engine: Arc<dyn ServicingEngine>) -> Self {
        Self::with_telemetry(engine, None)
    }

    pub fn with_telemetry(
        engine: Arc<dyn ServicingEngine>,
        telemetry: Option<Arc<ServiceTelemetry>>,
    ) -> Self {
        Self { engine, telemetry }
    }

    pub async fn start_run(
        &self,
        tenant_id: TenantId,
        request: StartRunRequest,
    ) -> ServicingResult<ServicingRun> {
        let run = self.engine.start_run(tenant_id, request).await?;
        if run.status.is_terminal()
            && let Some(telemetry) = &self.telemetry
        {
            telemetry.record_servicing_run(run.exceptions_created);
        }
        Ok(run)
    }

    pub async fn get_run(&self, tenant_id: TenantId, run_id: RunId) -> ServicingResult<ServicingRun> {
        self.engine.get_run(tenant_id, run_id).await
    }

    pub async fn reprocess_loan(
        &self,
        tenant_id: TenantId,
        run_id: RunId,
        loan: LoanInput,
    ) -> ServicingResult<ServicingRun> {
        self.engine.reprocess_loan(tenant_id, run_id, loan).await
    }
}
