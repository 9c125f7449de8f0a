use async_trait::async_trait;
use ptx_schemas::MinorUnits;
use serde_json::Value;

use crate::{
    AssetRef, LedgerCall, LedgerError, LedgerEvent, SubmitOutcome, TransferFromRequest,
    TransferRecord, TransferRequest,
};

/// Opaque ledger surface consumed by escrow, phases and reconciliation.
///
/// Implementations are injected as `Arc<dyn Ledger>`. Submissions resolve
/// once the call is included (or the timeout fires); there is no internal
/// retry and no cooperative cancellation of a submitted call.
#[async_trait]
pub trait Ledger: Send + Sync {
    async fn submit_transfer(&self, req: &TransferRequest) -> Result<SubmitOutcome, LedgerError>;

    async fn submit_transfer_from(
        &self,
        req: &TransferFromRequest,
    ) -> Result<SubmitOutcome, LedgerError>;

    async fn submit_call(&self, call: &LedgerCall) -> Result<SubmitOutcome, LedgerError>;

    /// Look up an included transfer by its reference.
    async fn find_transfer(&self, tx_ref: &str) -> Result<Option<TransferRecord>, LedgerError>;

    /// Look up the included transfer tagged with `memo`.
    async fn find_transfer_by_memo(&self, memo: &str)
        -> Result<Option<TransferRecord>, LedgerError>;

    async fn query_balance(&self, asset: AssetRef, account: &str)
        -> Result<MinorUnits, LedgerError>;

    /// `None` when nothing is stored under `(path, key)`.
    async fn query_storage_value(&self, path: &str, key: &str)
        -> Result<Option<Value>, LedgerError>;

    async fn total_issuance(&self, asset: AssetRef) -> Result<MinorUnits, LedgerError>;

    async fn current_height(&self) -> Result<u64, LedgerError>;

    /// Decoded events emitted at `height`. Events that fail schema
    /// validation are dropped (and logged) by the implementation.
    async fn events_at(&self, height: u64) -> Result<Vec<LedgerEvent>, LedgerError>;
}
