//! Request/response types shared by every [`Ledger`](crate::Ledger)
//! implementation.

use ptx_schemas::{AssetKind, MinorUnits};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::LedgerError;

// ---------------------------------------------------------------------------
// AssetRef
// ---------------------------------------------------------------------------

/// Ledger-side asset selector: the native balance or a fungible asset id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AssetRef {
    Native,
    Asset { id: u32 },
}

impl AssetRef {
    /// `asset_id` is required for [`AssetKind::Secondary`] and ignored for
    /// native.
    pub fn from_kind(kind: AssetKind, asset_id: Option<u32>) -> Option<AssetRef> {
        match kind {
            AssetKind::Native => Some(AssetRef::Native),
            AssetKind::Secondary => asset_id.map(|id| AssetRef::Asset { id }),
        }
    }

    /// Pallet that owns balances of this asset; used as the error section.
    pub fn section(&self) -> &'static str {
        match self {
            AssetRef::Native => "balances",
            AssetRef::Asset { .. } => "assets",
        }
    }
}

// ---------------------------------------------------------------------------
// Submissions
// ---------------------------------------------------------------------------

/// Signed transfer from `signer` to `to`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub signer: String,
    pub asset: AssetRef,
    pub to: String,
    pub amount: MinorUnits,
    /// Refuse transfers that would reap the sender's account.
    pub keep_alive: bool,
    /// Caller-chosen tag recorded with the transfer; at most one included
    /// transfer per memo.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memo: Option<String>,
}

/// Transfer pulled by `spender` out of `owner` under a prior approval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferFromRequest {
    pub spender: String,
    pub owner: String,
    pub asset: AssetRef,
    pub to: String,
    pub amount: MinorUnits,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memo: Option<String>,
}

/// Arbitrary signed extrinsic, e.g. `stores.bump_reputation`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerCall {
    pub section: String,
    pub method: String,
    pub signer: String,
    pub args: Value,
}

impl LedgerCall {
    pub fn name(&self) -> String {
        format!("{}.{}", self.section, self.method)
    }
}

/// Dispatch error of a transfer whose memo an included transfer already
/// carries.
pub const DUPLICATE_MEMO: &str = "ledger.DuplicateMemo";

/// Result of submit-and-wait-for-inclusion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SubmitOutcome {
    Included { tx_ref: String, height: u64 },
    /// Included but the dispatch failed; `reason` is `section.name`.
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inclusion {
    pub tx_ref: String,
    pub height: u64,
}

impl SubmitOutcome {
    /// Collapse a failed dispatch into [`LedgerError::Rejected`].
    pub fn into_included(self) -> Result<Inclusion, LedgerError> {
        match self {
            SubmitOutcome::Included { tx_ref, height } => Ok(Inclusion { tx_ref, height }),
            SubmitOutcome::Failed { reason } => Err(LedgerError::Rejected { reason }),
        }
    }
}

/// An included transfer as the ledger recorded it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub tx_ref: String,
    pub height: u64,
    pub asset: AssetRef,
    pub from: String,
    pub to: String,
    pub amount: MinorUnits,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memo: Option<String>,
}

/// A storage field that is not an unsigned integer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("not an unsigned integer: {0}")]
pub struct NotUint(pub String);

/// Unsigned integer from a storage field: a JSON number, a decimal string or
/// a `0x` hex string. Numbers past `u64` arrive as floats and are accepted
/// when integral and below 2^128.
pub fn storage_uint(v: &Value) -> Result<u128, NotUint> {
    let parsed = match v {
        Value::Number(n) => match n.as_u64() {
            Some(u) => Some(u128::from(u)),
            None => n
                .as_f64()
                .filter(|f| f.is_finite() && *f >= 0.0 && f.fract() == 0.0 && *f < 2f64.powi(128))
                .map(|f| f as u128),
        },
        Value::String(s) => {
            let s = s.trim();
            match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                Some(hex) => u128::from_str_radix(hex, 16).ok(),
                None => s.parse().ok(),
            }
        }
        _ => None,
    };
    parsed.ok_or_else(|| NotUint(v.to_string()))
}

/// Render a structured dispatch error as `section.name`.
///
/// Accepts `{"module": {"section", "name"}}`, a bare `{"section", "name"}`
/// or a plain string; anything else is rendered as compact JSON.
pub fn decode_dispatch_error(err: &Value) -> String {
    let module = err.get("module").unwrap_or(err);
    if let (Some(section), Some(name)) = (
        module.get("section").and_then(Value::as_str),
        module.get("name").and_then(Value::as_str),
    ) {
        return format!("{section}.{name}");
    }
    match err {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
