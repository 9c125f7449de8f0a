//! Request and response bodies for the ptx-daemon HTTP endpoints.
//!
//! Domain types (`Order`, `PhaseConfig`, `ReputationReport`, ...) are
//! returned as-is; only the envelopes that exist for HTTP live here.

use ptx_phase::ActivePhase;
use ptx_schemas::{AssetKind, MinorUnits};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// /v1/health
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub service: &'static str,
    pub version: &'static str,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Body of every non-2xx response. `code` is stable for clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

// ---------------------------------------------------------------------------
// Orders
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarkPaidRequest {
    #[serde(default)]
    pub proof_refs: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisputeRequest {
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewRequest {
    pub stars: u8,
    #[serde(default)]
    pub comment: Option<String>,
}

// ---------------------------------------------------------------------------
// Phases / custody / reconcile
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivePhaseResponse {
    /// `None` when no phase is active.
    pub active: Option<ActivePhase>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustodyBalanceQuery {
    pub asset: AssetKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustodyBalanceResponse {
    pub asset: AssetKind,
    pub account: String,
    pub balance: MinorUnits,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReconcileQuery {
    #[serde(default)]
    pub dry_run: bool,
}

// ---------------------------------------------------------------------------
// Treasury
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTreasuryRequest {
    pub title: String,
    pub beneficiary: String,
    pub amount: MinorUnits,
    /// Hash of the council motion that will carry this request.
    pub content_hash: String,
}
