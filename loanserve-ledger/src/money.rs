use std::fmt::Display;

use serde::Deserialize;
use serde::Serialize;

use crate::LedgerError;

/// Integer minor-unit money, USD-only (spec 3 — "monetary amounts are
/// stored as integer minor units (cents) on hot paths"). Validated
/// non-negative at construction so the waterfall allocator and poster
/// never have to re-check it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Money {
    cents: i64,
}

impl Default for Money {
    fn default() -> Self {
        Money::ZERO
    }
}

impl Money {
    pub const ZERO: Money = Money { cents: 0 };

    pub fn cents(amount_cents: i64) -> Result<Self, LedgerError> {
        if amount_cents < 0 {
            return Err(LedgerError::Validation(format!(
                "amount_cents must be non-negative, got {amount_cents}"
            )));
        }
        Ok(Self {
            cents: amount_cents,
        })
    }

    #[must_use]
    pub fn as_cents(&self) -> i64 {
        self.cents
    }

    #[must_use]
    pub fn checked_add(&self, other: Money) -> Option<Money> {
        self.cents.checked_add(other.cents).map(|cents| Money { cents })
    }

    #[must_use]
    pub fn checked_sub(&self, other: Money) -> Option<Money> {
        self.cents
            .checked_sub(other.cents)
            .filter(|c| *c >= 0)
            .map(|cents| Money { cents })
    }

    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.cents == 0
    }
}

impl Display for Money {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{:02} USD", self.cents / 100, self.cents.abs() % 100)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Currency {
    Usd,
}

impl Currency {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Currency::Usd => "USD",
        }
    }

    pub fn parse(code: &str) -> Result<Self, LedgerError> {
        match code {
            "USD" => Ok(Currency::Usd),
            other => Err(LedgerError::Validation(format!(
                "unsupported currency: {other}"
            ))),
        }
    }
}
