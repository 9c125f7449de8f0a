//! Fully wired settlement core over [`MemoryStore`] and [`PaperLedger`].

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use ptx_escrow::EscrowService;
use ptx_ledger::{AssetRef, PaperLedger};
use ptx_orders::{OrderService, OrderServiceConfig};
use ptx_phase::PhaseController;
use ptx_reconcile::governance::GovernanceWorker;
use ptx_reconcile::{ReputationTrigger, ReputationWorker, RetryPolicy};
use ptx_schemas::{AssetKind, MinorUnits, Offer, PhaseConfig, TradeSide};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::MemoryStore;

pub const CUSTODY: &str = "5Custody";
pub const TREASURY: &str = "5Treasury";
pub const REGISTRAR: &str = "5Registrar";
pub const SECONDARY_ASSET_ID: u32 = 7;

pub const MAKER: &str = "maker";
pub const MAKER_ACCOUNT: &str = "5Maker";
pub const TAKER: &str = "taker";
pub const TAKER_ACCOUNT: &str = "5Taker";

#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub order_ttl: chrono::Duration,
    pub settlement_lease: chrono::Duration,
    /// Issuance of the secondary asset that was never for sale.
    pub reserve: MinorUnits,
    /// Wire [`ReputationTrigger`] as the order service's release hook.
    pub reputation_on_release: bool,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            order_ttl: chrono::Duration::minutes(30),
            settlement_lease: chrono::Duration::minutes(2),
            reserve: MinorUnits::ZERO,
            reputation_on_release: false,
        }
    }
}

pub struct Harness {
    pub ledger: Arc<PaperLedger>,
    pub store: Arc<MemoryStore>,
    pub escrow: Arc<EscrowService>,
    pub phases: Arc<PhaseController>,
    pub orders: Arc<OrderService>,
    pub reputation: Arc<ReputationWorker>,
    pub governance: Arc<GovernanceWorker>,
}

impl Default for Harness {
    fn default() -> Self {
        Self::new(HarnessConfig::default())
    }
}

impl Harness {
    pub fn new(cfg: HarnessConfig) -> Self {
        let ledger = Arc::new(PaperLedger::new());
        let store = Arc::new(MemoryStore::new());
        let retry = RetryPolicy::new(3, Duration::from_millis(1));

        let escrow = Arc::new(EscrowService::new(
            ledger.clone(),
            CUSTODY,
            SECONDARY_ASSET_ID,
        ));
        let phases = Arc::new(PhaseController::new(
            store.clone(),
            ledger.clone(),
            SECONDARY_ASSET_ID,
            cfg.reserve,
        ));
        let reputation = Arc::new(ReputationWorker::new(
            store.clone(),
            ledger.clone(),
            REGISTRAR,
            retry,
        ));
        let governance = Arc::new(GovernanceWorker::new(
            store.clone(),
            ledger.clone(),
            TREASURY,
            retry,
        ));

        let mut orders = OrderService::new(
            store.clone(),
            store.clone(),
            escrow.clone(),
            phases.clone(),
            OrderServiceConfig {
                order_ttl: cfg.order_ttl,
                secondary_asset_id: SECONDARY_ASSET_ID,
                settlement_lease: cfg.settlement_lease,
            },
        );
        if cfg.reputation_on_release {
            orders = orders.with_release_hook(Arc::new(ReputationTrigger::new(reputation.clone())));
        }

        Self {
            ledger,
            store,
            escrow,
            phases,
            orders: Arc::new(orders),
            reputation,
            governance,
        }
    }

    /// Seed a native-asset offer and return its id.
    pub fn native_offer(&self, side: TradeSide, price: Decimal) -> Uuid {
        let offer = offer(AssetKind::Native, side, price);
        let id = offer.id;
        self.store.insert_offer(offer);
        id
    }

    /// Seed a secondary-asset offer; price comes from the active phase.
    pub fn secondary_offer(&self, side: TradeSide) -> Uuid {
        let offer = offer(AssetKind::Secondary, side, Decimal::ZERO);
        let id = offer.id;
        self.store.insert_offer(offer);
        id
    }

    /// Credit `units` whole native units to `account`.
    pub fn fund_native(&self, account: &str, units: u64) {
        self.ledger
            .mint(AssetRef::Native, account, MinorUnits::from_units(units));
    }

    pub fn fund_secondary(&self, account: &str, units: u64) {
        self.ledger.mint(
            AssetRef::Asset {
                id: SECONDARY_ASSET_ID,
            },
            account,
            MinorUnits::from_units(units),
        );
    }

    pub fn native_balance(&self, account: &str) -> MinorUnits {
        self.ledger.balance_of(AssetRef::Native, account)
    }
}

/// Open offer from [`MAKER`] with wide fiat bounds.
pub fn offer(asset: AssetKind, side: TradeSide, price: Decimal) -> Offer {
    Offer {
        id: Uuid::new_v4(),
        maker_id: MAKER.to_string(),
        maker_account: MAKER_ACCOUNT.to_string(),
        asset,
        side,
        price_per_unit: price,
        min_fiat: Decimal::ONE,
        max_fiat: Decimal::from(1_000_000),
        active: true,
    }
}

/// Inactive phase with a cap in whole units.
pub fn phase(label: &str, seq: i32, price: Decimal, cap_units: u64) -> PhaseConfig {
    PhaseConfig {
        label: label.to_string(),
        seq,
        price_per_unit: price,
        supply_cap: MinorUnits::from_units(cap_units),
        active: false,
        start_height: None,
        end_height: None,
    }
}

/// `now` shifted by `minutes`; handy for expiry sweeps.
pub fn minutes_from_now(minutes: i64) -> chrono::DateTime<Utc> {
    Utc::now() + chrono::Duration::minutes(minutes)
}
