//! Money Representation
//!
//! Balances and transfer amounts are fixed-point integers of minor units
//! (e.g. cents). All conversions between client-facing decimal strings and
//! the internal representation go through this module.
//!
//! ## Internal Representation
//! - `Amount` wraps an `i64` count of minor units
//! - The scale factor is `10^decimals` (2 for most currencies)
//! - Arithmetic is checked: overflow is reported, never wrapped
//!
//! ## Usage
//! ```rust
//! use account_ledger::money::{parse_amount, format_amount};
//!
//! let internal = parse_amount("12.5", 2).unwrap();
//! assert_eq!(internal.minor_units(), 1250);
//! assert_eq!(format_amount(internal, 2), "12.50");
//! ```

use rust_decimal::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Largest supported number of currency decimals
pub const MAX_DECIMALS: u32 = 18;

// ============================================================================
// Error Types
// ============================================================================

/// Money conversion errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MoneyError {
    #[error("Precision overflow: provided {provided} decimals, max allowed {max}")]
    PrecisionOverflow { provided: u32, max: u32 },

    #[error("Amount must not be negative")]
    Negative,

    #[error("Amount too large, would overflow")]
    Overflow,

    #[error("Invalid format: {0}")]
    InvalidFormat(String),
}

// ============================================================================
// Amount
// ============================================================================

/// Signed amount of money in minor units
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Amount(i64);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    /// Wrap a raw count of minor units
    pub const fn from_minor(units: i64) -> Self {
        Self(units)
    }

    /// Raw count of minor units
    pub const fn minor_units(self) -> i64 {
        self.0
    }

    pub const fn is_positive(self) -> bool {
        self.0 > 0
    }

    pub fn checked_add(self, rhs: Amount) -> Option<Amount> {
        self.0.checked_add(rhs.0).map(Amount)
    }

    pub fn checked_sub(self, rhs: Amount) -> Option<Amount> {
        self.0.checked_sub(rhs.0).map(Amount)
    }

    pub fn checked_neg(self) -> Option<Amount> {
        self.0.checked_neg().map(Amount)
    }
}

impl From<i64> for Amount {
    fn from(units: i64) -> Self {
        Self(units)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Parse: Client → Internal (String → Amount)
// ============================================================================

/// Convert a client decimal string to minor units
///
/// Rejects negative values and values with more fractional digits than
/// `decimals` (no silent truncation). Zero is accepted; callers that need a
/// strictly positive amount check it themselves.
///
/// # Example
/// ```rust
/// use account_ledger::money::parse_amount;
///
/// assert_eq!(parse_amount("30", 2).unwrap().minor_units(), 3000);
/// assert!(parse_amount("0.001", 2).is_err());
/// ```
pub fn parse_amount(amount_str: &str, decimals: u32) -> Result<Amount, MoneyError> {
    let amount_str = amount_str.trim();
    if amount_str.is_empty() {
        return Err(MoneyError::InvalidFormat("empty string".into()));
    }
    if amount_str.starts_with('-') {
        return Err(MoneyError::Negative);
    }
    if amount_str.starts_with('+') || amount_str.starts_with('.') || amount_str.ends_with('.') {
        return Err(MoneyError::InvalidFormat(amount_str.to_string()));
    }

    let decimal = Decimal::from_str(amount_str)
        .map_err(|e| MoneyError::InvalidFormat(format!("{amount_str}: {e}")))?;

    parse_decimal(decimal, decimals)
}

/// Convert a `Decimal` to minor units with the same rules as [`parse_amount`]
pub fn parse_decimal(decimal: Decimal, decimals: u32) -> Result<Amount, MoneyError> {
    if decimals > MAX_DECIMALS {
        return Err(MoneyError::PrecisionOverflow {
            provided: decimals,
            max: MAX_DECIMALS,
        });
    }
    if decimal.is_sign_negative() && !decimal.is_zero() {
        return Err(MoneyError::Negative);
    }

    let normalized = decimal.normalize();
    if normalized.scale() > decimals {
        return Err(MoneyError::PrecisionOverflow {
            provided: normalized.scale(),
            max: decimals,
        });
    }

    let factor = Decimal::from_i128_with_scale(10i128.pow(decimals), 0);
    normalized
        .checked_mul(factor)
        .and_then(|scaled| scaled.to_i64())
        .map(Amount)
        .ok_or(MoneyError::Overflow)
}

// ============================================================================
// Format: Internal → Client (Amount → String)
// ============================================================================

/// Format minor units as a decimal string with exactly `decimals` places
pub fn format_amount(amount: Amount, decimals: u32) -> String {
    Decimal::new(amount.0, decimals.min(MAX_DECIMALS)).to_string()
}
