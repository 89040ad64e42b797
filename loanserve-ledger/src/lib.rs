#![deny(clippy::print_stdout, clippy::print_stderr)]

//! Payment ledger: the waterfall allocator, the payment-keyed double-entry
//! model, and the transactional poster (spec 4.3/4.4).

mod money;
mod poster;
pub mod waterfall;

pub use money::Currency;
pub use money::Money;
pub use poster::AccountType;
pub use poster::InMemoryPosterService;
pub use poster::LedgerEntry;
pub use poster::Payment;
pub use poster::PaymentId;
pub use poster::PaymentState;
pub use poster::PostPaymentOutcome;
pub use poster::PostPaymentRequest;
pub use poster::PosterService;
pub use poster::TenantId;
pub use waterfall::Allocation;
pub use waterfall::Outstanding;
pub use waterfall::WaterfallBucket;
pub use waterfall::WaterfallOrder;
pub use waterfall::allocate;
pub use waterfall::default_waterfall_order;

pub type LedgerResult<T> = Result<T, LedgerError>;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("resource not found: {0}")]
    NotFound(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("invariant violation: {0}")]
    Invariant(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("internal error: {0}")]
    Internal(String),
}

#[cfg(feature = "postgres-store")]
pub struct PostgresPosterService;

#[cfg(feature = "postgres-store")]
#[async_trait::async_trait]
impl PosterService for PostgresPosterService {
    async fn post_payment(
        &self,
        _request: PostPaymentRequest,
    ) -> LedgerResult<PostPaymentOutcome> {
        Err(LedgerError::Storage(
            "postgres-backed poster not yet implemented".into(),
        ))
    }

    async fn get_payment(&self, _tenant_id: &TenantId, _payment_id: &PaymentId) -> LedgerResult<Payment> {
        Err(LedgerError::Storage(
            "postgres-backed poster not yet implemented".into(),
        ))
    }

    async fn ledger_entries_for_payment(
        &self,
        _tenant_id: &TenantId,
        _payment_id: &PaymentId,
    ) -> LedgerResult<Vec<LedgerEntry>> {
        Err(LedgerError::Storage(
            "postgres-backed poster not yet implemented".into(),
        ))
    }
}
