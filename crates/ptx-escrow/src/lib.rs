//! Escrow settlement: move an order's asset leg into custody and back out.
//!
//! A lock only counts once a transfer into custody is verifiable on the
//! ledger, whichever way it was funded:
//!
//! - [`EscrowFunding::Deposit`]: the escrower already sent the funds; the
//!   referenced transfer must match asset, sender, recipient and amount.
//! - [`EscrowFunding::Allowance`]: custody pulls under a prior approval.
//! - [`EscrowFunding::Direct`]: the node signs for the escrower (keep-alive
//!   native transfer or asset transfer).
//!
//! Releases are always signed by custody. Every transfer this service signs
//! carries the memo of its order and leg, so a retried lock or release
//! finds the earlier transfer instead of paying twice. This service never
//! touches order state; the caller persists the returned receipt with its
//! transition.

use std::sync::Arc;

use ptx_ledger::{
    AssetRef, Ledger, LedgerError, TransferFromRequest, TransferRecord, TransferRequest,
    DUPLICATE_MEMO,
};
use ptx_schemas::{AmountError, AssetKind, MinorUnits, Order, SettlementLeg};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum EscrowError {
    #[error(transparent)]
    Amount(#[from] AmountError),
    #[error("order {order_id} has no escrow lock recorded")]
    NoEscrowRecorded { order_id: Uuid },
    #[error("deposit {tx_ref} not found on ledger")]
    DepositNotFound { tx_ref: String },
    #[error("deposit {tx_ref} does not match order: {detail}")]
    DepositMismatch { tx_ref: String, detail: String },
    #[error("settlement memo {memo} is bound to a different transfer: {detail}")]
    MemoConflict { memo: String, detail: String },
    #[error("secondary-asset order {order_id} carries no asset id")]
    MissingAssetId { order_id: Uuid },
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// How the escrower's funds reach custody.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum EscrowFunding {
    Deposit { tx_ref: String },
    Allowance,
    Direct,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowReceipt {
    pub tx_ref: String,
    pub height: u64,
    pub amount: MinorUnits,
}

pub struct EscrowService {
    ledger: Arc<dyn Ledger>,
    custody_account: String,
    secondary_asset_id: u32,
}

impl EscrowService {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        custody_account: impl Into<String>,
        secondary_asset_id: u32,
    ) -> Self {
        Self {
            ledger,
            custody_account: custody_account.into(),
            secondary_asset_id,
        }
    }

    pub fn custody_account(&self) -> &str {
        &self.custody_account
    }

    fn asset_of(order: &Order) -> Result<AssetRef, EscrowError> {
        AssetRef::from_kind(order.asset, order.asset_id)
            .ok_or(EscrowError::MissingAssetId { order_id: order.id })
    }

    /// Move `order.amount_asset` from `from_account` into custody.
    ///
    /// Allowance and direct locks carry the order's lock memo; a transfer
    /// already on the ledger under that memo is returned instead of
    /// submitting again.
    pub async fn lock(
        &self,
        order: &Order,
        from_account: &str,
        funding: &EscrowFunding,
    ) -> Result<EscrowReceipt, EscrowError> {
        let asset = Self::asset_of(order)?;
        let amount = order.amount_minor()?;

        let receipt = match funding {
            EscrowFunding::Deposit { tx_ref } => {
                self.verify_deposit(tx_ref, asset, from_account, amount).await?
            }
            EscrowFunding::Allowance | EscrowFunding::Direct => {
                let leg = Leg {
                    memo: SettlementLeg::Lock.memo(order.id),
                    asset,
                    from: from_account,
                    to: &self.custody_account,
                    amount,
                    pull: *funding == EscrowFunding::Allowance,
                };
                self.transfer_once(&leg).await?
            }
        };

        info!(
            order_id = %order.id,
            asset = ?asset,
            amount = %amount,
            tx_ref = %receipt.tx_ref,
            "escrow locked"
        );
        Ok(receipt)
    }

    async fn verify_deposit(
        &self,
        tx_ref: &str,
        asset: AssetRef,
        from_account: &str,
        amount: MinorUnits,
    ) -> Result<EscrowReceipt, EscrowError> {
        let rec = self
            .ledger
            .find_transfer(tx_ref)
            .await?
            .ok_or_else(|| EscrowError::DepositNotFound {
                tx_ref: tx_ref.to_string(),
            })?;

        if let Some(detail) = mismatch(&rec, asset, from_account, &self.custody_account, amount)
        {
            warn!(tx_ref, %detail, "escrow deposit rejected");
            return Err(EscrowError::DepositMismatch {
                tx_ref: tx_ref.to_string(),
                detail,
            });
        }

        Ok(EscrowReceipt {
            tx_ref: rec.tx_ref,
            height: rec.height,
            amount,
        })
    }

    /// Pay the escrowed amount out of custody to `to_account`, at most once
    /// per order.
    pub async fn release(
        &self,
        order: &Order,
        to_account: &str,
    ) -> Result<EscrowReceipt, EscrowError> {
        if order.escrow_tx_ref.is_none() {
            return Err(EscrowError::NoEscrowRecorded { order_id: order.id });
        }
        let asset = Self::asset_of(order)?;
        let amount = order.amount_minor()?;

        let leg = Leg {
            memo: SettlementLeg::Release.memo(order.id),
            asset,
            from: &self.custody_account,
            to: to_account,
            amount,
            pull: false,
        };
        let receipt = self.transfer_once(&leg).await?;

        info!(
            order_id = %order.id,
            to = to_account,
            amount = %amount,
            tx_ref = %receipt.tx_ref,
            "escrow released"
        );
        Ok(receipt)
    }

    /// Submit `leg` unless a transfer with its memo is already included.
    async fn transfer_once(&self, leg: &Leg<'_>) -> Result<EscrowReceipt, EscrowError> {
        if let Some(receipt) = self.recover(leg).await? {
            return Ok(receipt);
        }

        let memo = Some(leg.memo.clone());
        let outcome = if leg.pull {
            self.ledger
                .submit_transfer_from(&TransferFromRequest {
                    spender: self.custody_account.clone(),
                    owner: leg.from.to_string(),
                    asset: leg.asset,
                    to: leg.to.to_string(),
                    amount: leg.amount,
                    memo,
                })
                .await?
        } else {
            self.ledger
                .submit_transfer(&TransferRequest {
                    signer: leg.from.to_string(),
                    asset: leg.asset,
                    to: leg.to.to_string(),
                    amount: leg.amount,
                    keep_alive: true,
                    memo,
                })
                .await?
        };

        match outcome.into_included() {
            Ok(inc) => Ok(EscrowReceipt {
                tx_ref: inc.tx_ref,
                height: inc.height,
                amount: leg.amount,
            }),
            // Lost a race with another submitter of the same leg.
            Err(LedgerError::Rejected { reason }) if reason == DUPLICATE_MEMO => {
                self.recover(leg).await?.ok_or_else(|| EscrowError::MemoConflict {
                    memo: leg.memo.clone(),
                    detail: "memo reported in use but no transfer carries it".to_string(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// The included transfer already carrying `leg.memo`, checked against
    /// the leg.
    async fn recover(&self, leg: &Leg<'_>) -> Result<Option<EscrowReceipt>, EscrowError> {
        let Some(rec) = self.ledger.find_transfer_by_memo(&leg.memo).await? else {
            return Ok(None);
        };
        if let Some(detail) = mismatch(&rec, leg.asset, leg.from, leg.to, leg.amount) {
            warn!(memo = %leg.memo, tx_ref = %rec.tx_ref, %detail, "settlement memo bound to another transfer");
            return Err(EscrowError::MemoConflict {
                memo: leg.memo.clone(),
                detail,
            });
        }
        info!(memo = %leg.memo, tx_ref = %rec.tx_ref, "settlement transfer already on ledger");
        Ok(Some(EscrowReceipt {
            tx_ref: rec.tx_ref,
            height: rec.height,
            amount: leg.amount,
        }))
    }

    pub async fn custody_balance(&self, asset: AssetKind) -> Result<MinorUnits, EscrowError> {
        let asset = match asset {
            AssetKind::Native => AssetRef::Native,
            AssetKind::Secondary => AssetRef::Asset {
                id: self.secondary_asset_id,
            },
        };
        Ok(self.ledger.query_balance(asset, &self.custody_account).await?)
    }
}

/// One settlement transfer and the memo that makes it unique.
struct Leg<'a> {
    memo: String,
    asset: AssetRef,
    from: &'a str,
    to: &'a str,
    amount: MinorUnits,
    /// Custody pulls under an approval instead of `from` signing.
    pull: bool,
}

fn mismatch(
    rec: &TransferRecord,
    asset: AssetRef,
    from: &str,
    to: &str,
    amount: MinorUnits,
) -> Option<String> {
    if rec.asset != asset {
        Some(format!("asset {:?}, expected {:?}", rec.asset, asset))
    } else if rec.from != from {
        Some(format!("sender {}, expected {}", rec.from, from))
    } else if rec.to != to {
        Some(format!("recipient {}, expected {}", rec.to, to))
    } else if rec.amount != amount {
        Some(format!("amount {}, expected {}", rec.amount, amount))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use ptx_ledger::PaperLedger;
    use ptx_schemas::{OrderStatus, TradeSide};
    use rust_decimal::Decimal;

    const CUSTODY: &str = "5Custody";
    const MAKER: &str = "5Maker";

    fn order(asset: AssetKind, asset_id: Option<u32>) -> Order {
        let now = Utc::now();
        Order {
            id: Uuid::new_v4(),
            offer_id: Uuid::new_v4(),
            maker_id: "maker".into(),
            taker_id: "taker".into(),
            maker_account: MAKER.into(),
            taker_account: "5Taker".into(),
            asset,
            asset_id,
            amount_asset: Decimal::new(15, 1),
            amount_fiat: Decimal::new(300, 2),
            price_per_unit: Decimal::from(2),
            phase: None,
            side: TradeSide::SellAsset,
            status: OrderStatus::AwaitingEscrow,
            escrow_tx_ref: None,
            escrow_at: None,
            payer_declared_at: None,
            proof_refs: vec![],
            released_tx_ref: None,
            released_at: None,
            expires_at: now,
            created_at: now,
            updated_at: now,
        }
    }

    fn service(ledger: Arc<PaperLedger>) -> EscrowService {
        EscrowService::new(ledger, CUSTODY, 1)
    }

    #[tokio::test]
    async fn direct_lock_moves_minor_units_into_custody() {
        let paper = Arc::new(PaperLedger::new());
        paper.mint(AssetRef::Native, MAKER, MinorUnits::from_units(10));
        let svc = service(paper.clone());

        let r = svc
            .lock(&order(AssetKind::Native, None), MAKER, &EscrowFunding::Direct)
            .await
            .unwrap();
        assert_eq!(r.amount, MinorUnits(1_500_000_000_000));
        assert_eq!(svc.custody_balance(AssetKind::Native).await.unwrap(), r.amount);
    }

    #[tokio::test]
    async fn repeated_release_returns_the_first_transfer() {
        let paper = Arc::new(PaperLedger::new());
        paper.mint(AssetRef::Native, MAKER, MinorUnits::from_units(10));
        let svc = service(paper.clone());
        let mut o = order(AssetKind::Native, None);
        let locked = svc.lock(&o, MAKER, &EscrowFunding::Direct).await.unwrap();
        o.escrow_tx_ref = Some(locked.tx_ref.clone());

        let first = svc.release(&o, "5Taker").await.unwrap();
        let submitted = paper.submission_count();
        let again = svc.release(&o, "5Taker").await.unwrap();

        assert_eq!(again, first);
        assert_eq!(paper.submission_count(), submitted);
        assert_eq!(paper.balance_of(AssetRef::Native, "5Taker"), first.amount);
        let again = svc.lock(&o, MAKER, &EscrowFunding::Direct).await.unwrap();
        assert_eq!(again, locked);
    }

    #[tokio::test]
    async fn memo_on_a_different_transfer_is_a_conflict() {
        let paper = Arc::new(PaperLedger::new());
        paper.mint(AssetRef::Native, MAKER, MinorUnits::from_units(10));
        let svc = service(paper.clone());
        let o = order(AssetKind::Native, None);
        paper
            .submit_transfer(&TransferRequest {
                signer: MAKER.into(),
                asset: AssetRef::Native,
                to: CUSTODY.into(),
                amount: MinorUnits(1),
                keep_alive: true,
                memo: Some(SettlementLeg::Lock.memo(o.id)),
            })
            .await
            .unwrap()
            .into_included()
            .unwrap();

        let err = svc.lock(&o, MAKER, &EscrowFunding::Direct).await.unwrap_err();
        assert!(matches!(err, EscrowError::MemoConflict { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn secondary_order_without_asset_id_is_refused() {
        let svc = service(Arc::new(PaperLedger::new()));
        let err = svc
            .lock(&order(AssetKind::Secondary, None), MAKER, &EscrowFunding::Allowance)
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::MissingAssetId { .. }));
    }

    #[tokio::test]
    async fn release_requires_a_recorded_lock() {
        let svc = service(Arc::new(PaperLedger::new()));
        let err = svc
            .release(&order(AssetKind::Native, None), "5Taker")
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::NoEscrowRecorded { .. }));
    }

    #[tokio::test]
    async fn rejected_dispatch_surfaces_as_ledger_error() {
        let svc = service(Arc::new(PaperLedger::new()));
        let err = svc
            .lock(&order(AssetKind::Native, None), MAKER, &EscrowFunding::Direct)
            .await
            .unwrap_err();
        match err {
            EscrowError::Ledger(LedgerError::Rejected { reason }) => {
                assert_eq!(reason, "balances.InsufficientBalance")
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
