//! Monetary amounts in integer minor units
//!
//! Balances, loan amounts and funding deltas are all carried as `Amount`, a
//! count of the currency's smallest unit (cents for USD). Floating point never
//! touches a balance. Decimal values only appear at the CSV boundary, where
//! `from_major` / `to_major` convert using the configured currency exponent.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A non-negative amount of money in minor currency units
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Amount(u64);

impl Amount {
    /// Zero minor units
    pub const ZERO: Amount = Amount(0);

    /// Create an amount from a count of minor units
    pub const fn new(minor_units: u64) -> Self {
        Amount(minor_units)
    }

    /// The raw count of minor units
    pub const fn minor_units(self) -> u64 {
        self.0
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Checked addition, `None` on overflow
    pub fn checked_add(self, other: Amount) -> Option<Amount> {
        self.0.checked_add(other.0).map(Amount)
    }

    /// Checked subtraction, `None` if the result would be negative
    pub fn checked_sub(self, other: Amount) -> Option<Amount> {
        self.0.checked_sub(other.0).map(Amount)
    }

    /// Subtraction clamped at zero
    pub fn saturating_sub(self, other: Amount) -> Amount {
        Amount(self.0.saturating_sub(other.0))
    }

    /// Convert a major-unit decimal (e.g. `1000.50`) into minor units
    ///
    /// Returns `None` for negative values, for values with more fractional
    /// digits than `exponent` allows, and for values that do not fit in `u64`.
    pub fn from_major(value: Decimal, exponent: u32) -> Option<Amount> {
        if value.is_sign_negative() && !value.is_zero() {
            return None;
        }

        let factor = Decimal::from(10u64.checked_pow(exponent)?);
        let scaled = value.checked_mul(factor)?;

        if !scaled.fract().is_zero() {
            return None;
        }

        scaled.trunc().to_u64().map(Amount)
    }

    /// Render this amount as a major-unit decimal with `exponent` fractional digits
    pub fn to_major(self, exponent: u32) -> Decimal {
        Decimal::from_i128_with_scale(i128::from(self.0), exponent)
    }
}

impl From<u64> for Amount {
    fn from(minor_units: u64) -> Self {
        Amount(minor_units)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
