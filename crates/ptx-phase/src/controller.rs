use std::sync::Arc;

use ptx_ledger::{AssetRef, Ledger};
use ptx_schemas::{MinorUnits, PhaseConfig, PhaseReservation, ReservationState};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{AdvanceOutcome, PhaseStore};

#[derive(Debug, thiserror::Error)]
pub enum PhaseError {
    #[error("no sale phase is active or the active phase is sold out")]
    PhaseInactive,
    #[error("insufficient phase supply: requested {requested}, remaining {remaining}")]
    InsufficientSupply {
        requested: MinorUnits,
        remaining: MinorUnits,
    },
    #[error("no phase follows the current one")]
    NoNextPhase,
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Point-in-time view of the active phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivePhase {
    pub label: String,
    pub price_per_unit: Decimal,
    pub supply_cap: MinorUnits,
    /// Ledger issuance above the reserve constant.
    pub sold: MinorUnits,
    /// Held reservations of open orders.
    pub reserved: MinorUnits,
    /// `cap - sold - reserved`, never negative.
    pub remaining: MinorUnits,
    /// `true` when the ledger could not be read and `sold` fell back to zero.
    pub stale: bool,
}

impl ActivePhase {
    fn from_parts(cfg: PhaseConfig, sold: MinorUnits, reserved: MinorUnits, stale: bool) -> Self {
        let remaining = cfg.supply_cap.saturating_sub(sold).saturating_sub(reserved);
        Self {
            label: cfg.label,
            price_per_unit: cfg.price_per_unit,
            supply_cap: cfg.supply_cap,
            sold,
            reserved,
            remaining,
            stale,
        }
    }

    /// Supply reservations may still claim: cap minus what the ledger says
    /// was sold.
    fn reservable(&self) -> MinorUnits {
        self.supply_cap.saturating_sub(self.sold)
    }
}

/// Supply-gated sale phases of the secondary asset.
///
/// Check-and-reserve runs under a single async gate in-process and
/// [`PhaseStore::try_reserve`] across processes, so two concurrent orders
/// cannot both claim the last units of a phase.
pub struct PhaseController {
    store: Arc<dyn PhaseStore>,
    ledger: Arc<dyn Ledger>,
    asset: AssetRef,
    reserve: MinorUnits,
    gate: Mutex<()>,
}

impl PhaseController {
    /// `reserve` is the part of total issuance that was never for sale
    /// (genesis/treasury allocation).
    pub fn new(
        store: Arc<dyn PhaseStore>,
        ledger: Arc<dyn Ledger>,
        secondary_asset_id: u32,
        reserve: MinorUnits,
    ) -> Self {
        Self {
            store,
            ledger,
            asset: AssetRef::Asset {
                id: secondary_asset_id,
            },
            reserve,
            gate: Mutex::new(()),
        }
    }

    pub async fn phases(&self) -> Result<Vec<PhaseConfig>, PhaseError> {
        Ok(self.store.phases().await?)
    }

    /// `None` when no phase is active.
    pub async fn get_active_phase(&self) -> Result<Option<ActivePhase>, PhaseError> {
        let Some(cfg) = self.store.active_phase().await? else {
            return Ok(None);
        };

        let (sold, stale) = match self.ledger.total_issuance(self.asset).await {
            Ok(issued) => (issued.saturating_sub(self.reserve), false),
            Err(e) => {
                warn!(phase = %cfg.label, error = %e, "total issuance unavailable; using stale phase supply");
                (MinorUnits::ZERO, true)
            }
        };
        let reserved = self.store.held_total(&cfg.label).await?;

        Ok(Some(ActivePhase::from_parts(cfg, sold, reserved, stale)))
    }

    /// Whether `amount` can be committed against the active phase right now.
    pub async fn can_commit(&self, amount: MinorUnits) -> Result<ActivePhase, PhaseError> {
        let active = self.get_active_phase().await?.ok_or(PhaseError::PhaseInactive)?;
        check(&active, amount)?;
        Ok(active)
    }

    /// Check and hold `amount` of the active phase for `order_id`.
    pub async fn reserve(
        &self,
        order_id: Uuid,
        amount: MinorUnits,
    ) -> Result<(ActivePhase, PhaseReservation), PhaseError> {
        let _gate = self.gate.lock().await;

        let active = self.can_commit(amount).await?;
        let r = PhaseReservation {
            order_id,
            phase: active.label.clone(),
            amount,
            state: ReservationState::Held,
        };

        if !self.store.try_reserve(&r, active.reservable()).await? {
            let reserved = self.store.held_total(&active.label).await?;
            let remaining = active.reservable().saturating_sub(reserved);
            warn!(%order_id, phase = %active.label, requested = %amount, %remaining, "phase reservation lost race");
            return Err(PhaseError::InsufficientSupply {
                requested: amount,
                remaining,
            });
        }

        info!(%order_id, phase = %r.phase, amount = %amount, "phase supply reserved");
        Ok((active, r))
    }

    /// Return a held reservation to the phase (order cancelled or expired).
    pub async fn release_reservation(&self, order_id: Uuid) -> Result<bool, PhaseError> {
        let done = self
            .store
            .finish_reservation(order_id, ReservationState::Released)
            .await?;
        if done {
            info!(%order_id, "phase reservation released");
        }
        Ok(done)
    }

    /// Order released: ledger supply is authoritative from now on.
    pub async fn settle_reservation(&self, order_id: Uuid) -> Result<bool, PhaseError> {
        Ok(self
            .store
            .finish_reservation(order_id, ReservationState::Settled)
            .await?)
    }

    pub async fn advance_phase(&self) -> Result<PhaseConfig, PhaseError> {
        let _gate = self.gate.lock().await;

        let height = match self.ledger.current_height().await {
            Ok(h) => Some(h),
            Err(e) => {
                warn!(error = %e, "ledger height unavailable; phase boundary left unstamped");
                None
            }
        };

        match self.store.advance(height).await? {
            AdvanceOutcome::Advanced { from, to } => {
                info!(from = ?from, to = %to.label, height = ?height, "sale phase advanced");
                Ok(to)
            }
            AdvanceOutcome::NoNext => Err(PhaseError::NoNextPhase),
        }
    }
}

fn check(active: &ActivePhase, amount: MinorUnits) -> Result<(), PhaseError> {
    if active.remaining.is_zero() {
        return Err(PhaseError::PhaseInactive);
    }
    if amount > active.remaining {
        return Err(PhaseError::InsufficientSupply {
            requested: amount,
            remaining: active.remaining,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn active(cap: u128, sold: u128, reserved: u128) -> ActivePhase {
        let cfg = PhaseConfig {
            label: "P1".into(),
            seq: 1,
            price_per_unit: Decimal::new(5, 1),
            supply_cap: MinorUnits(cap),
            active: true,
            start_height: None,
            end_height: None,
        };
        ActivePhase::from_parts(cfg, MinorUnits(sold), MinorUnits(reserved), false)
    }

    #[test]
    fn remaining_saturates_at_zero() {
        let a = active(100, 90, 30);
        assert_eq!(a.remaining, MinorUnits::ZERO);
        assert!(matches!(check(&a, MinorUnits(1)), Err(PhaseError::PhaseInactive)));
    }

    #[test]
    fn commit_up_to_remaining_is_allowed() {
        let a = active(100, 40, 10);
        assert!(check(&a, MinorUnits(50)).is_ok());
        assert!(matches!(
            check(&a, MinorUnits(51)),
            Err(PhaseError::InsufficientSupply { remaining: MinorUnits(50), .. })
        ));
        assert_eq!(a.reservable(), MinorUnits(60));
    }
}
