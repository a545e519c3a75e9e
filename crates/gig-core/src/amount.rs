//! # Fixed-Point Amounts
//!
//! Monetary values are stored as `i64` minor units (two decimal places) and
//! travel over the wire as decimal strings (`"1000"`, `"1000.5"`,
//! `"1000.50"`). Floats are never accepted: a JSON number is a
//! deserialization error, not a silently rounded value.
//!
//! ## Invariants
//!
//! - An [`Amount`] is never negative. Debits are expressed by direction
//!   (payer/payee), not by sign.
//! - Arithmetic is checked. Overflow is an [`AmountError::Overflow`], never a
//!   wrap.
//! - Percentage math ([`Amount::mul_bps_floor`]) rounds toward zero in minor
//!   units. Callers that split an amount must assign the remainder
//!   explicitly so legs always sum back to the original.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Number of minor units per major unit.
pub const MINOR_PER_MAJOR: i64 = 100;

/// Number of fractional digits accepted when parsing.
pub const FRACTION_DIGITS: usize = 2;

/// Basis points in one whole (100%).
pub const BPS_DENOMINATOR: i64 = 10_000;

/// Errors produced while parsing or combining amounts.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmountError {
    /// The input string was empty.
    #[error("amount is empty")]
    Empty,

    /// The input was not a plain decimal number.
    #[error("amount {0:?} is not a plain decimal number")]
    Malformed(String),

    /// More fractional digits than the currency precision allows.
    #[error("amount {0:?} has more than {FRACTION_DIGITS} fractional digits")]
    TooPrecise(String),

    /// Negative values are not representable.
    #[error("amount {0:?} is negative")]
    Negative(String),

    /// The value does not fit in 64-bit minor units.
    #[error("amount overflow")]
    Overflow,

    /// A subtraction would have gone below zero.
    #[error("amount underflow: {minuend} - {subtrahend}")]
    Underflow {
        /// Left-hand side.
        minuend: Amount,
        /// Right-hand side.
        subtrahend: Amount,
    },
}

/// A non-negative monetary amount in minor units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Amount(i64);

impl Amount {
    /// Zero.
    pub const ZERO: Amount = Amount(0);

    /// Construct from minor units, rejecting negatives.
    pub fn from_minor(minor: i64) -> Result<Self, AmountError> {
        if minor < 0 {
            return Err(AmountError::Negative(minor.to_string()));
        }
        Ok(Self(minor))
    }

    /// Construct from whole major units.
    pub fn from_major(major: i64) -> Result<Self, AmountError> {
        let minor = major
            .checked_mul(MINOR_PER_MAJOR)
            .ok_or(AmountError::Overflow)?;
        Self::from_minor(minor)
    }

    /// Value in minor units.
    pub fn minor(&self) -> i64 {
        self.0
    }

    /// Whether the amount is zero.
    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Parse a decimal string such as `"1000"` or `"12.5"`.
    pub fn parse(input: &str) -> Result<Self, AmountError> {
        if input.is_empty() {
            return Err(AmountError::Empty);
        }
        if let Some(rest) = input.strip_prefix('-') {
            if !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit() || c == '.') {
                return Err(AmountError::Negative(input.to_string()));
            }
            return Err(AmountError::Malformed(input.to_string()));
        }

        let (whole, fraction) = match input.split_once('.') {
            Some((w, f)) => (w, Some(f)),
            None => (input, None),
        };

        if whole.is_empty() || !whole.chars().all(|c| c.is_ascii_digit()) {
            return Err(AmountError::Malformed(input.to_string()));
        }

        let fraction_minor = match fraction {
            None => 0,
            Some(f) => {
                if f.is_empty() || !f.chars().all(|c| c.is_ascii_digit()) {
                    return Err(AmountError::Malformed(input.to_string()));
                }
                if f.len() > FRACTION_DIGITS {
                    return Err(AmountError::TooPrecise(input.to_string()));
                }
                let padded = format!("{f:0<width$}", width = FRACTION_DIGITS);
                padded
                    .parse::<i64>()
                    .map_err(|_| AmountError::Malformed(input.to_string()))?
            }
        };

        let whole_major = whole.parse::<i64>().map_err(|_| AmountError::Overflow)?;
        let minor = whole_major
            .checked_mul(MINOR_PER_MAJOR)
            .and_then(|m| m.checked_add(fraction_minor))
            .ok_or(AmountError::Overflow)?;
        Ok(Self(minor))
    }

    /// Checked addition.
    pub fn checked_add(self, other: Amount) -> Result<Amount, AmountError> {
        self.0
            .checked_add(other.0)
            .map(Amount)
            .ok_or(AmountError::Overflow)
    }

    /// Checked subtraction; fails rather than going negative.
    pub fn checked_sub(self, other: Amount) -> Result<Amount, AmountError> {
        if other.0 > self.0 {
            return Err(AmountError::Underflow {
                minuend: self,
                subtrahend: other,
            });
        }
        Ok(Amount(self.0 - other.0))
    }

    /// Sum an iterator of amounts with overflow checking.
    pub fn sum<I: IntoIterator<Item = Amount>>(iter: I) -> Result<Amount, AmountError> {
        iter.into_iter()
            .try_fold(Amount::ZERO, |acc, a| acc.checked_add(a))
    }

    /// `self × bps / 10000`, rounded toward zero in minor units.
    pub fn mul_bps_floor(self, bps: u32) -> Result<Amount, AmountError> {
        let product = i128::from(self.0) * i128::from(bps);
        let scaled = product / i128::from(BPS_DENOMINATOR);
        i64::try_from(scaled)
            .map(Amount)
            .map_err(|_| AmountError::Overflow)
    }
}

impl std::fmt::Display for Amount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}.{:02}",
            self.0 / MINOR_PER_MAJOR,
            self.0 % MINOR_PER_MAJOR
        )
    }
}

impl std::str::FromStr for Amount {
    type Err = AmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Amount::parse(s)
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Amount::parse(&raw).map_err(serde::de::Error::custom)
    }
}
