#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod duplicates;
mod exceptions;
mod facade;
pub mod preview_copy;
mod reconciliation;
mod servicing;
mod telemetry;
mod tenancy;

pub use duplicates::duplicate_set_labels;
pub use exceptions::ExceptionsFacade;
pub use exceptions::ExceptionsQueueView;
pub use exceptions::PolicyRuleSetView;
pub use facade::IntakeError;
pub use facade::PaymentIntakeFacade;
pub use facade::SubmitPaymentOutcome;
pub use facade::SubmitPaymentRequest;
pub use preview_copy::DUPLICATE_GUIDANCE_PREFIX;
pub use preview_copy::duplicate_guidance_message;
pub use reconciliation::ReconciliationFacade;
pub use servicing::ServicingFacade;
pub use telemetry::ServiceTelemetry;
pub use telemetry::TelemetryCounters;
pub use telemetry::TelemetryPolicyEventSink;
pub use tenancy::TenancyFacade;
