#![deny(clippy::print_stdout, clippy::print_stderr)]

//! Inbound payment ingestion: normalizing every channel (file-based
//! bank statements and JSON webhooks alike) into the canonical
//! [`envelope::PaymentEnvelope`] before anything downstream touches it
//! (spec 3.1/4.2).

pub mod envelope;
pub mod parsers;

pub use envelope::Artifact;
pub use envelope::Channel;
pub use envelope::EnvelopeBorrower;
pub use envelope::EnvelopePayment;
pub use envelope::EnvelopeSource;
pub use envelope::ExternalReferences;
pub use envelope::InboundPayload;
pub use envelope::JsonPaymentPayload;
pub use envelope::PaymentDetails;
pub use envelope::PaymentEnvelope;
pub use envelope::RiskAssessment;
pub use envelope::build_envelope;
pub use envelope::compute_idempotency_key;
pub use envelope::envelope_from_bank_transaction;
pub use envelope::score_risk;
pub use envelope::validate_envelope;
pub use parsers::BankStatementParser;
pub use parsers::CsvBankParser;
pub use parsers::CsvParserProfile;
pub use parsers::DedupeMetrics;
pub use parsers::DedupeOutcome;
pub use parsers::NormalizedBankTransaction;
pub use parsers::OfxBankParser;
pub use parsers::OfxParserProfile;
pub use parsers::dedupe_transactions;

#[derive(Debug, thiserror::Error)]
pub enum BankIngestError {
    #[error("parser not implemented: {0}")]
    NotImplemented(&'static str),
    #[error("invalid payload: {0}")]
    Invalid(String),
    #[error("missing column {0}")]
    MissingColumn(String),
    #[error("csv error: {0}")]
    Csv(String),
    #[error("parse error: {0}")]
    Parse(String),
    /// Structural validation failed (spec 4.2's `invalid_envelope`); the
    /// list is every reason the envelope was rejected, not just the first.
    #[error("invalid envelope: {0:?}")]
    InvalidEnvelope(Vec<String>),
}
