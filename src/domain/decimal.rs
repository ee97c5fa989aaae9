//! Lossless decimal numeric type backed by rust_decimal.
//!
//! Ledger amounts arrive as fixed-point integers (a uint scaled by a fixed
//! number of decimal places). `from_fixed_point` rescales them exactly;
//! binary floats are never involved.

use rust_decimal::Decimal as RustDecimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Lossless decimal amount.
///
/// Backed by rust_decimal to avoid floating-point drift.
/// Serializes to JSON number (not string) by default.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Decimal(#[serde(with = "rust_decimal::serde::float")] RustDecimal);

/// Error converting a raw fixed-point integer into a Decimal.
#[derive(Debug, Error)]
pub enum FixedPointError {
    #[error("not an integer amount: {0}")]
    NotAnInteger(String),
    #[error("amount exceeds representable precision: {0}")]
    OutOfRange(String),
}

impl Decimal {
    /// Create a Decimal from a RustDecimal.
    pub fn new(value: RustDecimal) -> Self {
        Decimal(value)
    }

    /// Convert a raw fixed-point integer string (e.g. "1500000000000000000"
    /// at scale 18) into its exact decimal value (1.5).
    ///
    /// The conversion attaches the scale to the integer mantissa, so no
    /// division and no rounding occurs.
    pub fn from_fixed_point(raw: &str, scale: u32) -> Result<Self, FixedPointError> {
        let value: i128 = raw
            .trim()
            .parse()
            .map_err(|_| FixedPointError::NotAnInteger(raw.to_string()))?;
        RustDecimal::try_from_i128_with_scale(value, scale)
            .map(|d| Decimal(d.normalize()))
            .map_err(|_| FixedPointError::OutOfRange(raw.to_string()))
    }

    /// Parse a Decimal from a string losslessly.
    ///
    /// # Errors
    /// Returns an error if the string is not a valid decimal number.
    pub fn from_str_canonical(s: &str) -> Result<Self, rust_decimal::Error> {
        RustDecimal::from_str(s).map(Decimal)
    }

    /// Format the Decimal as a canonical string (no exponent notation).
    pub fn to_canonical_string(&self) -> String {
        let normalized = self.0.normalize();
        format!("{}", normalized)
    }

    /// Get the underlying RustDecimal.
    pub fn inner(&self) -> RustDecimal {
        self.0
    }

    /// The additive identity (0).
    pub fn zero() -> Self {
        Decimal(RustDecimal::ZERO)
    }

    /// Returns true if the value is exactly zero.
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }
}

impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_canonical_string())
    }
}

impl FromStr for Decimal {
    type Err = rust_decimal::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_str_canonical(s)
    }
}

impl From<RustDecimal> for Decimal {
    fn from(value: RustDecimal) -> Self {
        Decimal(value)
    }
}

impl From<Decimal> for RustDecimal {
    fn from(value: Decimal) -> Self {
        value.0
    }
}

impl std::ops::Add for Decimal {
    type Output = Decimal;

    fn add(self, rhs: Decimal) -> Decimal {
        Decimal(self.0 + rhs.0)
    }
}

impl std::ops::Sub for Decimal {
    type Output = Decimal;

    fn sub(self, rhs: Decimal) -> Decimal {
        Decimal(self.0 - rhs.0)
    }
}

impl std::ops::Neg for Decimal {
    type Output = Decimal;

    fn neg(self) -> Decimal {
        Decimal(-self.0)
    }
}
