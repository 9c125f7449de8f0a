//! One-way delta convergence.
//!
//! `delta = max(0, truth - current)` per field. Only positive corrections are
//! ever pushed, so a ledger that ran ahead of local truth is left alone and
//! a second pass over unchanged inputs produces an all-zero delta.

use ptx_ledger::{storage_uint, LedgerError};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReputationSnapshot {
    pub sales: u128,
    pub positive: u128,
    pub negative: u128,
    /// Native-asset volume in minor units.
    pub volume: u128,
}

impl ReputationSnapshot {
    pub const FIELDS: [&'static str; 4] = ["sales", "positive", "negative", "volume"];

    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }

    fn get(&self, field: &str) -> u128 {
        match field {
            "sales" => self.sales,
            "positive" => self.positive,
            "negative" => self.negative,
            "volume" => self.volume,
            _ => 0,
        }
    }

    /// Per-field `max(0, self - current)`.
    pub fn delta_from(&self, current: &ReputationSnapshot) -> ReputationSnapshot {
        ReputationSnapshot {
            sales: self.sales.saturating_sub(current.sales),
            positive: self.positive.saturating_sub(current.positive),
            negative: self.negative.saturating_sub(current.negative),
            volume: self.volume.saturating_sub(current.volume),
        }
    }

    /// Read a ledger storage record. Fields may be JSON numbers, decimal
    /// strings or `0x` hex strings; absent or null fields count as zero. Any
    /// other value fails the whole record.
    pub fn from_storage(v: &Value) -> Result<ReputationSnapshot, LedgerError> {
        let field = |name: &str| -> Result<u128, LedgerError> {
            match v.get(name) {
                None | Some(Value::Null) => Ok(0),
                Some(raw) => storage_uint(raw)
                    .map_err(|e| LedgerError::Decode(format!("reputation.{name}: {e}"))),
            }
        };
        Ok(ReputationSnapshot {
            sales: field("sales")?,
            positive: field("positive")?,
            negative: field("negative")?,
            volume: field("volume")?,
        })
    }

    /// Non-zero fields only, as decimal strings.
    pub fn to_bump_args(&self) -> Value {
        let mut m = Map::new();
        for f in Self::FIELDS {
            let n = self.get(f);
            if n > 0 {
                m.insert(f.to_string(), Value::String(n.to_string()));
            }
        }
        Value::Object(m)
    }
}

/// Split `count` ratings into positive/negative from their average (0..=5):
/// `positive = round(avg / 5 * count)`, clamped to `0..=count`.
pub fn estimate_feedback_buckets(rating_avg: Decimal, rating_count: u64) -> (u128, u128) {
    if rating_count == 0 {
        return (0, 0);
    }
    let avg = rating_avg.clamp(Decimal::ZERO, Decimal::from(5));
    let approx = (avg / Decimal::from(5) * Decimal::from(rating_count))
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_u64()
        .unwrap_or(0)
        .min(rating_count);
    (u128::from(approx), u128::from(rating_count - approx))
}
