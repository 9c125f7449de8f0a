//! Fixed-point amounts.
//!
//! Human-facing quantities are [`Decimal`]; ledger-facing quantities are
//! [`MinorUnits`] (integer, scale 10^12). Every conversion between the two
//! goes through [`MinorUnits::from_decimal`] / [`MinorUnits::to_decimal`],
//! which use integer mantissa arithmetic only.
//!
//! | Direction             | Function                    |
//! |-----------------------|-----------------------------|
//! | decimal -> ledger     | [`MinorUnits::from_decimal`] |
//! | ledger -> decimal     | [`MinorUnits::to_decimal`]   |

use std::fmt;
use std::str::FromStr;

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

/// Number of fractional digits carried by one minor unit.
pub const MINOR_SCALE: u32 = 12;

/// 1 whole unit = 10^12 minor units.
pub const MINOR_UNITS_PER_UNIT: u128 = 1_000_000_000_000;

/// Fractional digits kept on fiat amounts.
pub const FIAT_SCALE: u32 = 2;

// ---------------------------------------------------------------------------
// AmountError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AmountError {
    #[error("amount must not be negative: {0}")]
    Negative(Decimal),
    #[error("amount has more than 12 fractional digits: {0}")]
    TooPrecise(Decimal),
    #[error("amount out of range")]
    OutOfRange,
    #[error("invalid minor-unit string: {0:?}")]
    Parse(String),
}

// ---------------------------------------------------------------------------
// MinorUnits
// ---------------------------------------------------------------------------

/// Ledger-facing integer amount. Serialized as a decimal integer string so
/// values above 2^53 survive JSON round-trips through other languages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MinorUnits(pub u128);

impl MinorUnits {
    pub const ZERO: MinorUnits = MinorUnits(0);

    pub fn new(v: u128) -> Self {
        Self(v)
    }

    pub fn get(self) -> u128 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Whole units expressed in minor units (`units * 10^12`).
    pub fn from_units(units: u64) -> Self {
        Self(units as u128 * MINOR_UNITS_PER_UNIT)
    }

    /// `quantity * 10^12`, exact. Rejects negatives and anything finer than
    /// one minor unit instead of rounding.
    pub fn from_decimal(d: Decimal) -> Result<Self, AmountError> {
        if d.is_zero() {
            return Ok(Self::ZERO);
        }
        if d.is_sign_negative() {
            return Err(AmountError::Negative(d));
        }
        let d = d.normalize();
        let scale = d.scale();
        if scale > MINOR_SCALE {
            return Err(AmountError::TooPrecise(d));
        }
        let mantissa = u128::try_from(d.mantissa()).map_err(|_| AmountError::OutOfRange)?;
        let factor = 10u128.pow(MINOR_SCALE - scale);
        mantissa
            .checked_mul(factor)
            .map(Self)
            .ok_or(AmountError::OutOfRange)
    }

    /// Inverse of [`from_decimal`](Self::from_decimal). Fails only when the
    /// value exceeds the 96-bit decimal mantissa.
    pub fn to_decimal(self) -> Result<Decimal, AmountError> {
        let v = i128::try_from(self.0).map_err(|_| AmountError::OutOfRange)?;
        Decimal::try_from_i128_with_scale(v, MINOR_SCALE)
            .map(|d| d.normalize())
            .map_err(|_| AmountError::OutOfRange)
    }

    pub fn checked_add(self, rhs: MinorUnits) -> Option<MinorUnits> {
        self.0.checked_add(rhs.0).map(MinorUnits)
    }

    pub fn saturating_add(self, rhs: MinorUnits) -> MinorUnits {
        MinorUnits(self.0.saturating_add(rhs.0))
    }

    pub fn saturating_sub(self, rhs: MinorUnits) -> MinorUnits {
        MinorUnits(self.0.saturating_sub(rhs.0))
    }
}

impl fmt::Display for MinorUnits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MinorUnits {
    type Err = AmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let t = s.trim();
        if t.is_empty() || !t.bytes().all(|b| b.is_ascii_digit()) {
            return Err(AmountError::Parse(s.to_string()));
        }
        t.parse::<u128>()
            .map(MinorUnits)
            .map_err(|_| AmountError::Parse(s.to_string()))
    }
}

impl Serialize for MinorUnits {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for MinorUnits {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // Strings are canonical; bare integers are accepted for hand-written
        // fixtures and YAML.
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Wire {
            Str(String),
            Int(u64),
        }
        match Wire::deserialize(deserializer)? {
            Wire::Str(s) => s.parse().map_err(de::Error::custom),
            Wire::Int(n) => Ok(MinorUnits(n as u128)),
        }
    }
}

// ---------------------------------------------------------------------------
// Rounding helpers
// ---------------------------------------------------------------------------

/// Round a fiat amount to cents, half away from zero.
pub fn round_fiat(d: Decimal) -> Decimal {
    d.round_dp_with_strategy(FIAT_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

/// Round an asset quantity to minor-unit precision, half away from zero.
pub fn round_asset(d: Decimal) -> Decimal {
    d.round_dp_with_strategy(MINOR_SCALE, RoundingStrategy::MidpointAwayFromZero)
}
