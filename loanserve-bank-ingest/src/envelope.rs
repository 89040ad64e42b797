//! The canonical inbound payment shape (spec 3.1/4.2): whatever channel a
//! payment arrives on, it is normalized into a [`PaymentEnvelope`] before
//! anything downstream (readiness evaluation, posting) ever sees it.

use chrono::DateTime;
use chrono::NaiveDate;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;
use uuid::Uuid;

use crate::BankIngestError;
use crate::parsers::NormalizedBankTransaction;

/// The channel a payment arrived on. `Ach`/`Check` are produced by the
/// file-based parsers in [`crate::parsers`]; the rest arrive as JSON via
/// [`InboundPayload`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Ach,
    Wire,
    Realtime,
    Check,
    Card,
    Paypal,
    Venmo,
    Book,
}

impl Channel {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Channel::Ach => "ach",
            Channel::Wire => "wire",
            Channel::Realtime => "realtime",
            Channel::Check => "check",
            Channel::Card => "card",
            Channel::Paypal => "paypal",
            Channel::Venmo => "venmo",
            Channel::Book => "book",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Channel> {
        match value.to_ascii_lowercase().as_str() {
            "ach" => Some(Channel::Ach),
            "wire" => Some(Channel::Wire),
            "realtime" => Some(Channel::Realtime),
            "check" => Some(Channel::Check),
            "card" => Some(Channel::Card),
            "paypal" => Some(Channel::Paypal),
            "venmo" => Some(Channel::Venmo),
            "book" => Some(Channel::Book),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeSource {
    pub channel: Channel,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub batch_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnvelopeBorrower {
    #[serde(default)]
    pub loan_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub external_ids: Vec<String>,
}

/// Channel-specific details that only some channels populate. Validation
/// (spec 4.2) checks which of these are required per channel.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PaymentDetails {
    #[serde(default)]
    pub routing_number: Option<String>,
    #[serde(default)]
    pub account_mask: Option<String>,
    #[serde(default)]
    pub check_number: Option<String>,
    #[serde(default)]
    pub return_code: Option<String>,
    #[serde(default)]
    pub sec_code: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopePayment {
    pub amount_cents: i64,
    pub currency: String,
    pub method: Channel,
    pub value_date: NaiveDate,
    pub reference: String,
    #[serde(default)]
    pub details: PaymentDetails,
    /// Whether this payment line represents a bank-initiated return
    /// (NSF/unauthorized). Only returns may legitimately carry a
    /// `return_code`.
    #[serde(default)]
    pub is_return: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub artifact_type: String,
    pub uri: String,
    pub hash: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub flags: Vec<String>,
    pub score: u8,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExternalReferences {
    #[serde(default)]
    pub bank_transfer_id: Option<String>,
    #[serde(default)]
    pub bank_event_id: Option<String>,
    #[serde(default)]
    pub psp_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentEnvelope {
    pub schema_version: String,
    pub message_id: Uuid,
    pub correlation_id: String,
    pub idempotency_key: String,
    pub occurred_at: DateTime<Utc>,
    pub source: EnvelopeSource,
    pub borrower: EnvelopeBorrower,
    pub payment: EnvelopePayment,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    #[serde(default)]
    pub risk: Option<RiskAssessment>,
    #[serde(default)]
    pub external: Option<ExternalReferences>,
    /// True when the envelope failed to auto-post (unmatched loan, missing
    /// detail, risk above ceiling) and a human must clear it before the
    /// ledger buckets are touched.
    pub requires_review: bool,
}

pub const SCHEMA_VERSION: &str = "loanserve.payments.v1";

/// `SHA-256(lower(method)|trim(lower(reference))|value_date|amount_cents|loan_id_or_"none")`
/// (spec 4.2). Same material always yields the same key, so a retried
/// submission of the same payment is recognized as a no-op by the poster.
#[must_use]
pub fn compute_idempotency_key(
    method: Channel,
    reference: &str,
    value_date: NaiveDate,
    amount_cents: i64,
    loan_id: Option<&str>,
) -> String {
    let material = format!(
        "{}|{}|{}|{}|{}",
        method.as_str(),
        reference.trim().to_lowercase(),
        value_date,
        amount_cents,
        loan_id.unwrap_or("none")
    );
    let mut hasher = Sha256::new();
    hasher.update(material.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Per-channel structural validation (spec 4.2). An empty return means the
/// envelope is well-formed; any entries describe why it is not and map to
/// `invalid_envelope`.
#[must_use]
pub fn validate_envelope(
    source: &EnvelopeSource,
    borrower: &EnvelopeBorrower,
    payment: &EnvelopePayment,
) -> Vec<String> {
    let mut reasons = Vec::new();

    if payment.amount_cents <= 0 {
        reasons.push("amount_cents must be positive".to_string());
    }
    if payment.currency != "USD" {
        reasons.push(format!("unsupported currency {}", payment.currency));
    }
    if payment.method != source.channel {
        reasons.push("payment.method must match source.channel".to_string());
    }
    if payment.reference.trim().is_empty() {
        reasons.push("reference must not be blank".to_string());
    }

    match source.channel {
        Channel::Ach => {
            if payment.details.routing_number.is_none() {
                reasons.push("ach payments require routing_number".to_string());
            }
            if payment.details.account_mask.is_none() {
                reasons.push("ach payments require account_mask".to_string());
            }
            if payment.details.return_code.is_some() && !payment.is_return {
                reasons.push("return_code is only valid on return events".to_string());
            }
        }
        Channel::Wire => {
            if payment.reference.trim().is_empty() {
                reasons.push("wire payments require reference".to_string());
            }
        }
        Channel::Check => {
            if payment.details.check_number.is_none() {
                reasons.push("check payments require check_number".to_string());
            }
        }
        Channel::Card | Channel::Paypal | Channel::Venmo => {
            if source.provider.is_none() {
                reasons.push("card/wallet payments require source.provider".to_string());
            }
        }
        Channel::Realtime | Channel::Book => {}
    }

    reasons
}

/// Additive risk score (spec 4.2), capped at 100. Higher means more
/// scrutiny before auto-posting is allowed.
#[must_use]
pub fn score_risk(
    source: &EnvelopeSource,
    borrower: &EnvelopeBorrower,
    payment: &EnvelopePayment,
    extra_flags: &[String],
) -> RiskAssessment {
    let mut score: u32 = 0;
    let mut flags = Vec::new();

    if payment.amount_cents > 10_000_00 {
        score += 20;
        flags.push("amount_over_10k".to_string());
    }
    if payment.amount_cents > 100_000_00 {
        score += 30;
        flags.push("amount_over_100k".to_string());
    }
    match source.channel {
        Channel::Book => {
            score += 15;
            flags.push("manual_channel".to_string());
        }
        Channel::Check => {
            score += 10;
            flags.push("check_channel".to_string());
        }
        _ => {}
    }
    if borrower.loan_id.is_none() {
        score += 20;
        flags.push("loan_unmatched".to_string());
    }
    if payment.details.routing_number.is_none() {
        score += 10;
        flags.push("missing_routing_number".to_string());
    }
    if payment.details.account_mask.is_none() {
        score += 10;
        flags.push("missing_account_mask".to_string());
    }
    if payment.details.return_code.is_some() {
        score += 40;
        flags.push("bank_return".to_string());
    }
    for extra in extra_flags {
        match extra.as_str() {
            "duplicate_suspected" => score += 30,
            "amount_mismatch" => score += 25,
            _ => {}
        }
        flags.push(extra.clone());
    }

    RiskAssessment {
        flags,
        score: score.min(100) as u8,
    }
}

/// Build and validate an envelope for a file-based channel (`ach`/`check`)
/// from an already-parsed bank statement line. `occurred_at` is the time
/// the line was ingested, not when the bank posted it.
pub fn envelope_from_bank_transaction(
    tx: &NormalizedBankTransaction,
    channel: Channel,
    loan_id: Option<String>,
    correlation_id: String,
    occurred_at: DateTime<Utc>,
    extra_flags: &[String],
) -> Result<PaymentEnvelope, BankIngestError> {
    if !matches!(channel, Channel::Ach | Channel::Check) {
        return Err(BankIngestError::Invalid(format!(
            "channel {:?} cannot be derived from a bank statement line",
            channel
        )));
    }

    let reference = tx
        .source_reference
        .clone()
        .unwrap_or_else(|| tx.transaction_id.clone());

    let details = match channel {
        Channel::Ach => PaymentDetails {
            routing_number: Some(tx.account_id.clone()),
            account_mask: Some(tx.account_id.clone()),
            ..PaymentDetails::default()
        },
        Channel::Check => PaymentDetails {
            check_number: tx.source_reference.clone(),
            ..PaymentDetails::default()
        },
        _ => PaymentDetails::default(),
    };

    let source = EnvelopeSource {
        channel,
        provider: None,
        batch_id: tx.duplicate_metadata.group_key.clone(),
    };
    let borrower = EnvelopeBorrower {
        loan_id,
        name: None,
        external_ids: vec![tx.account_id.clone()],
    };
    let payment = EnvelopePayment {
        amount_cents: tx.amount_minor,
        currency: tx.currency.clone(),
        method: channel,
        value_date: tx.posted_date,
        reference,
        details,
        is_return: tx.is_void,
    };

    build_envelope(source, borrower, payment, correlation_id, occurred_at, extra_flags)
}

/// Assemble, validate, score, and key a [`PaymentEnvelope`] from its parts.
/// Shared by both the file-based and JSON-based ingestion paths so a
/// payment is subject to the same rules no matter how it arrived.
pub fn build_envelope(
    source: EnvelopeSource,
    borrower: EnvelopeBorrower,
    payment: EnvelopePayment,
    correlation_id: String,
    occurred_at: DateTime<Utc>,
    extra_flags: &[String],
) -> Result<PaymentEnvelope, BankIngestError> {
    let reasons = validate_envelope(&source, &borrower, &payment);
    if !reasons.is_empty() {
        return Err(BankIngestError::InvalidEnvelope(reasons));
    }

    let idempotency_key = compute_idempotency_key(
        payment.method,
        &payment.reference,
        payment.value_date,
        payment.amount_cents,
        borrower.loan_id.as_deref(),
    );
    let risk = score_risk(&source, &borrower, &payment, extra_flags);
    let requires_review = borrower.loan_id.is_none() || risk.score >= 70;

    Ok(PaymentEnvelope {
        schema_version: SCHEMA_VERSION.to_string(),
        message_id: Uuid::new_v4(),
        correlation_id,
        idempotency_key,
        occurred_at,
        source,
        borrower,
        payment,
        artifacts: Vec::new(),
        risk: Some(risk),
        external: None,
        requires_review,
    })
}

/// Raw JSON shape accepted on the realtime/card/paypal/venmo/book inbound
/// channels, before it is lifted into a [`PaymentEnvelope`].
#[derive(Debug, Clone, Deserialize)]
pub struct JsonPaymentPayload {
    #[serde(default)]
    pub correlation_id: Option<String>,
    pub amount_cents: i64,
    pub currency: String,
    pub value_date: NaiveDate,
    pub reference: String,
    #[serde(default)]
    pub loan_id: Option<String>,
    #[serde(default)]
    pub borrower_name: Option<String>,
    #[serde(default)]
    pub external_ids: Vec<String>,
    #[serde(default)]
    pub details: PaymentDetails,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub batch_id: Option<String>,
    #[serde(default)]
    pub bank_transfer_id: Option<String>,
    #[serde(default)]
    pub bank_event_id: Option<String>,
    #[serde(default)]
    pub psp_id: Option<String>,
    #[serde(default)]
    pub flags: Vec<String>,
}

/// The channels this crate accepts as inbound JSON rather than a parsed
/// bank statement. Each variant carries the same payload shape; the tag
/// alone determines `source.channel`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "channel", rename_all = "snake_case")]
pub enum InboundPayload {
    Realtime(JsonPaymentPayload),
    Card(JsonPaymentPayload),
    Paypal(JsonPaymentPayload),
    Venmo(JsonPaymentPayload),
    Book(JsonPaymentPayload),
}

impl InboundPayload {
    #[must_use]
    pub fn channel(&self) -> Channel {
        match self {
            InboundPayload::Realtime(_) => Channel::Realtime,
            InboundPayload::Card(_) => Channel::Card,
            InboundPayload::Paypal(_) => Channel::Paypal,
            InboundPayload::Venmo(_) => Channel::Venmo,
            InboundPayload::Book(_) => Channel::Book,
        }
    }

    fn payload(&self) -> &JsonPaymentPayload {
        match self {
            InboundPayload::Realtime(p)
            | InboundPayload::Card(p)
            | InboundPayload::Paypal(p)
            | InboundPayload::Venmo(p)
            | InboundPayload::Book(p) => p,
        }
    }

    /// Lift this JSON payload into a validated, scored, keyed envelope.
    pub fn into_envelope(self, occurred_at: DateTime<Utc>) -> Result<PaymentEnvelope, BankIngestError> {
        let channel = self.channel();
        let payload = self.payload().clone();

        let source = EnvelopeSource {
            channel,
            provider: payload.provider,
            batch_id: payload.batch_id,
        };
        let borrower = EnvelopeBorrower {
            loan_id: payload.loan_id,
            name: payload.borrower_name,
            external_ids: payload.external_ids,
        };
        let payment = EnvelopePayment {
            amount_cents: payload.amount_cents,
            currency: payload.currency,
            method: channel,
            value_date: payload.value_date,
            reference: payload.reference,
            details: payload.details,
            is_return: false,
        };
        let correlation_id = payload
            .correlation_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut envelope = build_envelope(
            source,
            borrower,
            payment,
            correlation_id,
            occurred_at,
            &payload.flags,
        )?;
        envelope.external = Some(ExternalReferences {
            bank_transfer_id: payload.bank_transfer_id,
            bank_event_id: payload.bank_event_id,
            psp_id: payload.psp_id,
        });
        Ok(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample_date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 1, 15).unwrap()
    }

    fn sample_payment(method: Channel, amount_cents: i64) -> EnvelopePayment {
        EnvelopePayment {
            amount_cents,
            currency: "USD".to_string(),
            method,
            value_date: sample_date(),
            reference: "REF-1".to_string(),
            details: PaymentDetails {
                routing_number: Some("021000021".to_string()),
                account_mask: Some("****1234".to_string()),
                ..PaymentDetails::default()
            },
            is_return: false,
        }
    }

    #[test]
    fn idempotency_key_is_stable_for_same_material() {
        let a = compute_idempotency_key(Channel::Ach, "  Ref-1 ", sample_date(), 15000, Some("loan-1"));
        let b = compute_idempotency_key(Channel::Ach, "ref-1", sample_date(), 15000, Some("loan-1"));
        assert_eq!(a, b);
    }

    #[test]
    fn idempotency_key_changes_with_amount() {
        let a = compute_idempotency_key(Channel::Ach, "ref-1", sample_date(), 15000, Some("loan-1"));
        let b = compute_idempotency_key(Channel::Ach, "ref-1", sample_date(), 15001, Some("loan-1"));
        assert_ne!(a, b);
    }

    #[test]
    fn idempotency_key_uses_none_sentinel_for_unmatched_loan() {
        let with_none = compute_idempotency_key(Channel::Ach, "ref-1", sample_date(), 15000, None);
        let with_literal = compute_idempotency_key(Channel::Ach, "ref-1", sample_date(), 15000, Some("none"));
        assert_eq!(with_none, with_literal);
    }

    #[test]
    fn ach_requires_routing_and_account() {
        let source = EnvelopeSource { channel: Channel::Ach, provider: None, batch_id: None };
        let borrower = EnvelopeBorrower { loan_id: Some("loan-1".to_string()), ..EnvelopeBorrower::default() };
        let mut payment = sample_payment(Channel::Ach, 15000);
        payment.details.routing_number = None;
        let reasons = validate_envelope(&source, &borrower, &payment);
        assert!(reasons.iter().any(|r| r.contains("routing_number")));
    }

    #[test]
    fn return_code_without_is_return_is_rejected() {
        let source = EnvelopeSource { channel: Channel::Ach, provider: None, batch_id: None };
        let borrower = EnvelopeBorrower { loan_id: Some("loan-1".to_string()), ..EnvelopeBorrower::default() };
        let mut payment = sample_payment(Channel::Ach, 15000);
        payment.details.return_code = Some("R01".to_string());
        let reasons = validate_envelope(&source, &borrower, &payment);
        assert!(reasons.iter().any(|r| r.contains("return_code")));
    }

    #[test]
    fn check_requires_check_number() {
        let source = EnvelopeSource { channel: Channel::Check, provider: None, batch_id: None };
        let borrower = EnvelopeBorrower { loan_id: Some("loan-1".to_string()), ..EnvelopeBorrower::default() };
        let payment = sample_payment(Channel::Check, 15000);
        let reasons = validate_envelope(&source, &borrower, &payment);
        assert!(reasons.iter().any(|r| r.contains("check_number")));
    }

    #[test]
    fn clean_ach_scores_zero() {
        let source = EnvelopeSource { channel: Channel::Ach, provider: None, batch_id: None };
        let borrower = EnvelopeBorrower { loan_id: Some("loan-1".to_string()), ..EnvelopeBorrower::default() };
        let payment = sample_payment(Channel::Ach, 15000);
        let risk = score_risk(&source, &borrower, &payment, &[]);
        assert_eq!(risk.score, 0);
    }

    #[test]
    fn unmatched_loan_and_large_amount_compound() {
        let source = EnvelopeSource { channel: Channel::Ach, provider: None, batch_id: None };
        let borrower = EnvelopeBorrower::default();
        let payment = sample_payment(Channel::Ach, 150_000_00);
        let risk = score_risk(&source, &borrower, &payment, &[]);
        // 20 (over 10k) + 30 (over 100k) + 20 (unmatched) = 70
        assert_eq!(risk.score, 70);
        assert!(risk.flags.contains(&"loan_unmatched".to_string()));
    }

    #[test]
    fn risk_score_is_capped_at_100() {
        let source = EnvelopeSource { channel: Channel::Book, provider: None, batch_id: None };
        let borrower = EnvelopeBorrower::default();
        let mut payment = sample_payment(Channel::Book, 150_000_00);
        payment.details.routing_number = None;
        payment.details.account_mask = None;
        payment.details.return_code = Some("R01".to_string());
        let risk = score_risk(
            &source,
            &borrower,
            &payment,
            &["duplicate_suspected".to_string(), "amount_mismatch".to_string()],
        );
        assert_eq!(risk.score, 100);
    }

    #[test]
    fn wire_with_unmatched_loan_and_no_external_ids_requires_review() {
        let source = EnvelopeSource { channel: Channel::Wire, provider: None, batch_id: None };
        let borrower = EnvelopeBorrower::default();
        let mut payment = sample_payment(Channel::Wire, 500_000);
        payment.method = Channel::Wire;
        payment.details = PaymentDetails::default();
        let reasons = validate_envelope(&source, &borrower, &payment);
        assert!(reasons.is_empty(), "unexpected validation reasons: {reasons:?}");

        let envelope = build_envelope(source, borrower, payment, "corr-3".to_string(), Utc::now(), &[])
            .expect("wire envelope with null loan id should still build");
        assert!(envelope.requires_review);
    }

    #[test]
    fn wire_without_reference_is_rejected() {
        let source = EnvelopeSource { channel: Channel::Wire, provider: None, batch_id: None };
        let borrower = EnvelopeBorrower { loan_id: Some("loan-1".to_string()), ..EnvelopeBorrower::default() };
        let mut payment = sample_payment(Channel::Wire, 500_000);
        payment.method = Channel::Wire;
        payment.reference = "   ".to_string();
        let reasons = validate_envelope(&source, &borrower, &payment);
        assert!(reasons.iter().any(|r| r.contains("reference")));
    }

    #[test]
    fn build_envelope_rejects_unsupported_currency() {
        let source = EnvelopeSource { channel: Channel::Ach, provider: None, batch_id: None };
        let borrower = EnvelopeBorrower { loan_id: Some("loan-1".to_string()), ..EnvelopeBorrower::default() };
        let mut payment = sample_payment(Channel::Ach, 15000);
        payment.currency = "EUR".to_string();
        let err = build_envelope(source, borrower, payment, "corr-1".to_string(), Utc::now(), &[])
            .expect_err("EUR should be rejected");
        match err {
            BankIngestError::InvalidEnvelope(reasons) => {
                assert!(reasons.iter().any(|r| r.contains("currency")));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn inbound_json_payload_lifts_into_envelope() {
        let json = serde_json::json!({
            "channel": "realtime",
            "amount_cents": 25000,
            "currency": "USD",
            "value_date": "2026-01-15",
            "reference": "RTP-1",
            "loan_id": "loan-9",
            "external_ids": ["acct-9"],
        });
        let payload: InboundPayload = serde_json::from_value(json).expect("payload should parse");
        let envelope = payload.into_envelope(Utc::now()).expect("envelope should build");
        assert_eq!(envelope.payment.amount_cents, 25000);
        assert_eq!(envelope.source.channel, Channel::Realtime);
        assert!(!envelope.requires_review);
    }
}
