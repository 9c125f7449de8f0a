//! In-memory ledger.
//!
//! Deterministic stand-in for the RPC ledger: every accepted submission is
//! included at a fresh height with a sequential `tx_ref`. Rejections use the
//! same `section.name` reasons a real node reports. Used by tests and by the
//! daemon in paper mode.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use ptx_schemas::MinorUnits;
use serde_json::Value;

use crate::{
    storage_uint, AssetRef, EventBody, Ledger, LedgerCall, LedgerError, LedgerEvent,
    SubmitOutcome, TransferFromRequest, TransferRecord, TransferRequest, DUPLICATE_MEMO,
};

#[derive(Default)]
struct PaperState {
    height: u64,
    tx_seq: u64,
    balances: HashMap<(AssetRef, String), u128>,
    /// (asset, owner, spender) -> remaining allowance.
    allowances: HashMap<(AssetRef, String, String), u128>,
    issuance: HashMap<AssetRef, u128>,
    storage: HashMap<(String, String), Value>,
    transfers: HashMap<String, TransferRecord>,
    /// memo -> tx_ref of the transfer that carried it.
    memos: HashMap<String, String>,
    events: BTreeMap<u64, Vec<LedgerEvent>>,
    calls: Vec<LedgerCall>,
    submissions: usize,
    fail_next: Option<LedgerError>,
    existential_deposit: u128,
}

pub struct PaperLedger {
    inner: Mutex<PaperState>,
}

impl Default for PaperLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl PaperLedger {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(PaperState::default()),
        }
    }

    /// Native accounts must keep at least `ed` when a transfer asks to stay
    /// alive.
    pub fn with_existential_deposit(self, ed: MinorUnits) -> Self {
        self.state().existential_deposit = ed.get();
        self
    }

    fn state(&self) -> MutexGuard<'_, PaperState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ---- setup / inspection ------------------------------------------------

    /// Credit `account` and grow issuance by the same amount.
    pub fn mint(&self, asset: AssetRef, account: &str, amount: MinorUnits) {
        let mut st = self.state();
        *st.balances.entry((asset, account.to_string())).or_default() += amount.get();
        *st.issuance.entry(asset).or_default() += amount.get();
    }

    pub fn approve(&self, asset: AssetRef, owner: &str, spender: &str, amount: MinorUnits) {
        self.state()
            .allowances
            .insert((asset, owner.to_string(), spender.to_string()), amount.get());
    }

    pub fn set_issuance(&self, asset: AssetRef, amount: MinorUnits) {
        self.state().issuance.insert(asset, amount.get());
    }

    pub fn set_storage(&self, path: &str, key: &str, value: Value) {
        self.state()
            .storage
            .insert((path.to_string(), key.to_string()), value);
    }

    /// Append an event at `height`, raising the chain head if needed.
    pub fn push_event(&self, height: u64, tx_ref: &str, body: EventBody) {
        let mut st = self.state();
        st.height = st.height.max(height);
        st.events.entry(height).or_default().push(LedgerEvent {
            height,
            tx_ref: tx_ref.to_string(),
            body,
        });
    }

    /// The next ledger round-trip (submission or query) fails with `err`.
    pub fn fail_next(&self, err: LedgerError) {
        self.state().fail_next = Some(err);
    }

    pub fn balance_of(&self, asset: AssetRef, account: &str) -> MinorUnits {
        MinorUnits(
            self.state()
                .balances
                .get(&(asset, account.to_string()))
                .copied()
                .unwrap_or(0),
        )
    }

    /// Every `submit_call` accepted so far, in order.
    pub fn calls(&self) -> Vec<LedgerCall> {
        self.state().calls.clone()
    }

    /// Submissions of any kind, including rejected ones.
    pub fn submission_count(&self) -> usize {
        self.state().submissions
    }

    pub fn height(&self) -> u64 {
        self.state().height
    }

    // ---- internals ---------------------------------------------------------

    fn take_failure(st: &mut PaperState) -> Result<(), LedgerError> {
        match st.fail_next.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn include(st: &mut PaperState) -> (String, u64) {
        st.tx_seq += 1;
        st.height += 1;
        (format!("0x{:064x}", st.tx_seq), st.height)
    }

    fn move_funds(
        st: &mut PaperState,
        asset: AssetRef,
        from: &str,
        to: &str,
        amount: u128,
        keep_alive: bool,
    ) -> Result<(), String> {
        let from_key = (asset, from.to_string());
        let have = st.balances.get(&from_key).copied().unwrap_or(0);
        if have < amount {
            return Err(match asset {
                AssetRef::Native => "balances.InsufficientBalance".to_string(),
                AssetRef::Asset { .. } => "assets.BalanceLow".to_string(),
            });
        }
        let left = have - amount;
        if keep_alive
            && asset == AssetRef::Native
            && left > 0
            && left < st.existential_deposit
        {
            return Err("balances.KeepAlive".to_string());
        }
        st.balances.insert(from_key, left);
        *st.balances.entry((asset, to.to_string())).or_default() += amount;
        Ok(())
    }

    fn record_transfer(
        st: &mut PaperState,
        asset: AssetRef,
        from: &str,
        to: &str,
        amount: MinorUnits,
        memo: Option<&str>,
    ) -> SubmitOutcome {
        let (tx_ref, height) = Self::include(st);
        if let Some(memo) = memo {
            st.memos.insert(memo.to_string(), tx_ref.clone());
        }
        st.transfers.insert(
            tx_ref.clone(),
            TransferRecord {
                tx_ref: tx_ref.clone(),
                height,
                asset,
                from: from.to_string(),
                to: to.to_string(),
                amount,
                memo: memo.map(str::to_string),
            },
        );
        if asset == AssetRef::Native {
            st.events.entry(height).or_default().push(LedgerEvent {
                height,
                tx_ref: tx_ref.clone(),
                body: EventBody::BalanceTransfer {
                    from: from.to_string(),
                    to: to.to_string(),
                    amount,
                },
            });
        }
        SubmitOutcome::Included { tx_ref, height }
    }

    /// A memo already carried by an included transfer rejects the
    /// submission.
    fn check_memo(st: &mut PaperState, memo: Option<&str>) -> Result<(), SubmitOutcome> {
        match memo {
            Some(m) if st.memos.contains_key(m) => {
                Self::include(st);
                Err(SubmitOutcome::Failed {
                    reason: DUPLICATE_MEMO.to_string(),
                })
            }
            _ => Ok(()),
        }
    }

    fn apply_bump(st: &mut PaperState, call: &LedgerCall) -> Result<(), String> {
        let rest = call
            .method
            .strip_prefix("bump_")
            .ok_or_else(|| format!("{}.CallUnavailable", call.section))?;
        let key = call
            .args
            .get("key")
            .and_then(Value::as_str)
            .ok_or_else(|| format!("{}.BadArgs", call.section))?;
        let delta = call
            .args
            .get("delta")
            .and_then(Value::as_object)
            .ok_or_else(|| format!("{}.BadArgs", call.section))?;

        let slot = st
            .storage
            .entry((format!("{}.{}", call.section, rest), key.to_string()))
            .or_insert_with(|| Value::Object(Default::default()));
        let Value::Object(current) = slot else {
            return Err(format!("{}.Corrupt", call.section));
        };
        for (field, d) in delta {
            let d = storage_uint(d).map_err(|_| format!("{}.BadArgs", call.section))?;
            let cur = match current.get(field) {
                Some(v) => storage_uint(v).map_err(|_| format!("{}.Corrupt", call.section))?,
                None => 0,
            };
            current.insert(field.clone(), Value::String(cur.saturating_add(d).to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Ledger for PaperLedger {
    async fn submit_transfer(&self, req: &TransferRequest) -> Result<SubmitOutcome, LedgerError> {
        let mut st = self.state();
        st.submissions += 1;
        Self::take_failure(&mut st)?;
        if let Err(failed) = Self::check_memo(&mut st, req.memo.as_deref()) {
            return Ok(failed);
        }

        if let Err(reason) = Self::move_funds(
            &mut st,
            req.asset,
            &req.signer,
            &req.to,
            req.amount.get(),
            req.keep_alive,
        ) {
            Self::include(&mut st);
            return Ok(SubmitOutcome::Failed { reason });
        }
        Ok(Self::record_transfer(
            &mut st,
            req.asset,
            &req.signer,
            &req.to,
            req.amount,
            req.memo.as_deref(),
        ))
    }

    async fn submit_transfer_from(
        &self,
        req: &TransferFromRequest,
    ) -> Result<SubmitOutcome, LedgerError> {
        let mut st = self.state();
        st.submissions += 1;
        Self::take_failure(&mut st)?;
        if let Err(failed) = Self::check_memo(&mut st, req.memo.as_deref()) {
            return Ok(failed);
        }

        let allowance_key = (req.asset, req.owner.clone(), req.spender.clone());
        let allowed = st.allowances.get(&allowance_key).copied().unwrap_or(0);
        if allowed < req.amount.get() {
            Self::include(&mut st);
            return Ok(SubmitOutcome::Failed {
                reason: format!("{}.Unapproved", req.asset.section()),
            });
        }
        if let Err(reason) = Self::move_funds(
            &mut st,
            req.asset,
            &req.owner,
            &req.to,
            req.amount.get(),
            false,
        ) {
            Self::include(&mut st);
            return Ok(SubmitOutcome::Failed { reason });
        }
        st.allowances.insert(allowance_key, allowed - req.amount.get());
        Ok(Self::record_transfer(
            &mut st,
            req.asset,
            &req.owner,
            &req.to,
            req.amount,
            req.memo.as_deref(),
        ))
    }

    async fn submit_call(&self, call: &LedgerCall) -> Result<SubmitOutcome, LedgerError> {
        let mut st = self.state();
        st.submissions += 1;
        Self::take_failure(&mut st)?;

        if let Err(reason) = Self::apply_bump(&mut st, call) {
            Self::include(&mut st);
            return Ok(SubmitOutcome::Failed { reason });
        }
        st.calls.push(call.clone());
        let (tx_ref, height) = Self::include(&mut st);
        Ok(SubmitOutcome::Included { tx_ref, height })
    }

    async fn find_transfer(&self, tx_ref: &str) -> Result<Option<TransferRecord>, LedgerError> {
        let mut st = self.state();
        Self::take_failure(&mut st)?;
        Ok(st.transfers.get(tx_ref).cloned())
    }

    async fn find_transfer_by_memo(
        &self,
        memo: &str,
    ) -> Result<Option<TransferRecord>, LedgerError> {
        let mut st = self.state();
        Self::take_failure(&mut st)?;
        Ok(st
            .memos
            .get(memo)
            .and_then(|tx_ref| st.transfers.get(tx_ref))
            .cloned())
    }

    async fn query_balance(
        &self,
        asset: AssetRef,
        account: &str,
    ) -> Result<MinorUnits, LedgerError> {
        let mut st = self.state();
        Self::take_failure(&mut st)?;
        Ok(MinorUnits(
            st.balances
                .get(&(asset, account.to_string()))
                .copied()
                .unwrap_or(0),
        ))
    }

    async fn query_storage_value(
        &self,
        path: &str,
        key: &str,
    ) -> Result<Option<Value>, LedgerError> {
        let mut st = self.state();
        Self::take_failure(&mut st)?;
        Ok(st.storage.get(&(path.to_string(), key.to_string())).cloned())
    }

    async fn total_issuance(&self, asset: AssetRef) -> Result<MinorUnits, LedgerError> {
        let mut st = self.state();
        Self::take_failure(&mut st)?;
        Ok(MinorUnits(st.issuance.get(&asset).copied().unwrap_or(0)))
    }

    async fn current_height(&self) -> Result<u64, LedgerError> {
        let mut st = self.state();
        Self::take_failure(&mut st)?;
        Ok(st.height)
    }

    async fn events_at(&self, height: u64) -> Result<Vec<LedgerEvent>, LedgerError> {
        let mut st = self.state();
        Self::take_failure(&mut st)?;
        Ok(st.events.get(&height).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const ALICE: &str = "5Alice";
    const CUSTODY: &str = "5Custody";

    fn transfer(asset: AssetRef, amount: u128) -> TransferRequest {
        TransferRequest {
            signer: ALICE.into(),
            asset,
            to: CUSTODY.into(),
            amount: MinorUnits(amount),
            keep_alive: true,
            memo: None,
        }
    }

    #[tokio::test]
    async fn transfer_moves_funds_and_is_findable() {
        let l = PaperLedger::new();
        l.mint(AssetRef::Native, ALICE, MinorUnits(500));

        let inc = l
            .submit_transfer(&transfer(AssetRef::Native, 200))
            .await
            .unwrap()
            .into_included()
            .unwrap();

        assert_eq!(l.balance_of(AssetRef::Native, ALICE), MinorUnits(300));
        assert_eq!(l.balance_of(AssetRef::Native, CUSTODY), MinorUnits(200));
        let rec = l.find_transfer(&inc.tx_ref).await.unwrap().unwrap();
        assert_eq!(rec.amount, MinorUnits(200));
        assert_eq!(rec.from, ALICE);
        assert_eq!(l.events_at(inc.height).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn insufficient_funds_are_reported_per_pallet() {
        let l = PaperLedger::new();
        let native = l.submit_transfer(&transfer(AssetRef::Native, 1)).await.unwrap();
        assert_eq!(
            native,
            SubmitOutcome::Failed {
                reason: "balances.InsufficientBalance".into()
            }
        );
        let asset = l
            .submit_transfer(&transfer(AssetRef::Asset { id: 1 }, 1))
            .await
            .unwrap();
        assert_eq!(
            asset,
            SubmitOutcome::Failed {
                reason: "assets.BalanceLow".into()
            }
        );
    }

    #[tokio::test]
    async fn keep_alive_refuses_to_dust_the_sender() {
        let l = PaperLedger::new().with_existential_deposit(MinorUnits(10));
        l.mint(AssetRef::Native, ALICE, MinorUnits(100));
        let out = l.submit_transfer(&transfer(AssetRef::Native, 95)).await.unwrap();
        assert_eq!(
            out,
            SubmitOutcome::Failed {
                reason: "balances.KeepAlive".into()
            }
        );
        assert_eq!(l.balance_of(AssetRef::Native, ALICE), MinorUnits(100));
    }

    #[tokio::test]
    async fn transfer_from_consumes_allowance() {
        let l = PaperLedger::new();
        let asset = AssetRef::Asset { id: 1 };
        l.mint(asset, ALICE, MinorUnits(100));
        l.approve(asset, ALICE, CUSTODY, MinorUnits(60));

        let req = TransferFromRequest {
            spender: CUSTODY.into(),
            owner: ALICE.into(),
            asset,
            to: CUSTODY.into(),
            amount: MinorUnits(60),
            memo: None,
        };
        assert!(matches!(
            l.submit_transfer_from(&req).await.unwrap(),
            SubmitOutcome::Included { .. }
        ));
        assert_eq!(
            l.submit_transfer_from(&req).await.unwrap(),
            SubmitOutcome::Failed {
                reason: "assets.Unapproved".into()
            }
        );
    }

    #[tokio::test]
    async fn memo_is_findable_and_cannot_be_reused() {
        let l = PaperLedger::new();
        l.mint(AssetRef::Native, ALICE, MinorUnits(500));
        let tagged = TransferRequest {
            memo: Some("settle:1:lock".into()),
            ..transfer(AssetRef::Native, 100)
        };

        let inc = l.submit_transfer(&tagged).await.unwrap().into_included().unwrap();
        let rec = l.find_transfer_by_memo("settle:1:lock").await.unwrap().unwrap();
        assert_eq!(rec.tx_ref, inc.tx_ref);
        assert_eq!(rec.memo.as_deref(), Some("settle:1:lock"));
        assert_eq!(l.find_transfer_by_memo("settle:1:release").await.unwrap(), None);

        assert_eq!(
            l.submit_transfer(&tagged).await.unwrap(),
            SubmitOutcome::Failed {
                reason: DUPLICATE_MEMO.into()
            }
        );
        assert_eq!(l.balance_of(AssetRef::Native, CUSTODY), MinorUnits(100));
    }

    #[tokio::test]
    async fn bump_on_unreadable_field_is_rejected() {
        let l = PaperLedger::new();
        l.set_storage("stores.reputation", ALICE, json!({"sales": "lots"}));
        let call = LedgerCall {
            section: "stores".into(),
            method: "bump_reputation".into(),
            signer: CUSTODY.into(),
            args: json!({"key": ALICE, "delta": {"sales": "1"}}),
        };
        assert_eq!(
            l.submit_call(&call).await.unwrap(),
            SubmitOutcome::Failed {
                reason: "stores.Corrupt".into()
            }
        );
    }

    #[tokio::test]
    async fn bump_call_accumulates_into_storage() {
        let l = PaperLedger::new();
        let call = LedgerCall {
            section: "stores".into(),
            method: "bump_reputation".into(),
            signer: CUSTODY.into(),
            args: json!({"key": ALICE, "delta": {"sales": "2", "volume": 7}}),
        };
        l.submit_call(&call).await.unwrap().into_included().unwrap();
        l.submit_call(&call).await.unwrap().into_included().unwrap();

        let v = l
            .query_storage_value("stores.reputation", ALICE)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(v, json!({"sales": "4", "volume": "14"}));
        assert_eq!(l.calls().len(), 2);
    }

    #[tokio::test]
    async fn injected_failure_hits_exactly_one_round_trip() {
        let l = PaperLedger::new();
        l.fail_next(LedgerError::Transport("connection reset".into()));
        assert!(l.current_height().await.is_err());
        assert_eq!(l.current_height().await.unwrap(), 0);
    }
}
