//! Shared domain types for the trade settlement core.
//!
//! No IO and no business rules beyond what a type can answer about itself
//! (who escrows, who pays, which states are terminal).

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod amount;

pub use amount::{
    round_asset, round_fiat, AmountError, MinorUnits, FIAT_SCALE, MINOR_SCALE,
    MINOR_UNITS_PER_UNIT,
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: {value:?}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

// ---------------------------------------------------------------------------
// AssetKind
// ---------------------------------------------------------------------------

/// The two tradeable asset kinds: the ledger's native currency and one
/// fungible secondary asset identified by an asset id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssetKind {
    Native,
    Secondary,
}

impl AssetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetKind::Native => "NATIVE",
            AssetKind::Secondary => "SECONDARY",
        }
    }

    pub fn parse(s: &str) -> Result<Self, UnknownVariant> {
        match s {
            "NATIVE" => Ok(AssetKind::Native),
            "SECONDARY" => Ok(AssetKind::Secondary),
            other => Err(UnknownVariant {
                kind: "asset kind",
                value: other.to_string(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// OrderStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Draft,
    AwaitingEscrow,
    AwaitingFiatPayment,
    AwaitingConfirmation,
    /// **Terminal.**
    Released,
    /// **Terminal.**
    Cancelled,
    /// **Terminal.**
    Expired,
    DisputeOpen,
    /// **Terminal.**
    DisputeResolvedBuyer,
    /// **Terminal.**
    DisputeResolvedSeller,
}

impl OrderStatus {
    pub const ALL: [OrderStatus; 10] = [
        OrderStatus::Draft,
        OrderStatus::AwaitingEscrow,
        OrderStatus::AwaitingFiatPayment,
        OrderStatus::AwaitingConfirmation,
        OrderStatus::Released,
        OrderStatus::Cancelled,
        OrderStatus::Expired,
        OrderStatus::DisputeOpen,
        OrderStatus::DisputeResolvedBuyer,
        OrderStatus::DisputeResolvedSeller,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Draft => "DRAFT",
            OrderStatus::AwaitingEscrow => "AWAITING_ESCROW",
            OrderStatus::AwaitingFiatPayment => "AWAITING_FIAT_PAYMENT",
            OrderStatus::AwaitingConfirmation => "AWAITING_CONFIRMATION",
            OrderStatus::Released => "RELEASED",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::Expired => "EXPIRED",
            OrderStatus::DisputeOpen => "DISPUTE_OPEN",
            OrderStatus::DisputeResolvedBuyer => "DISPUTE_RESOLVED_BUYER",
            OrderStatus::DisputeResolvedSeller => "DISPUTE_RESOLVED_SELLER",
        }
    }

    pub fn parse(s: &str) -> Result<Self, UnknownVariant> {
        OrderStatus::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| UnknownVariant {
                kind: "order status",
                value: s.to_string(),
            })
    }

    /// Returns `true` if no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Released
                | OrderStatus::Cancelled
                | OrderStatus::Expired
                | OrderStatus::DisputeResolvedBuyer
                | OrderStatus::DisputeResolvedSeller
        )
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// TradeSide / Party
// ---------------------------------------------------------------------------

/// Side of the standing offer, from the maker's point of view.
///
/// `SellAsset`: maker delivers the asset into escrow, taker pays fiat.
/// `BuyAsset`: taker delivers the asset into escrow, maker pays fiat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeSide {
    SellAsset,
    BuyAsset,
}

impl TradeSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSide::SellAsset => "SELL_ASSET",
            TradeSide::BuyAsset => "BUY_ASSET",
        }
    }

    pub fn parse(s: &str) -> Result<Self, UnknownVariant> {
        match s {
            "SELL_ASSET" => Ok(TradeSide::SellAsset),
            "BUY_ASSET" => Ok(TradeSide::BuyAsset),
            other => Err(UnknownVariant {
                kind: "trade side",
                value: other.to_string(),
            }),
        }
    }

    pub fn escrower(&self) -> Party {
        match self {
            TradeSide::SellAsset => Party::Maker,
            TradeSide::BuyAsset => Party::Taker,
        }
    }

    /// The fiat payer is always the escrower's counterparty.
    pub fn payer(&self) -> Party {
        self.escrower().counterparty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Party {
    Maker,
    Taker,
}

impl Party {
    pub fn counterparty(&self) -> Party {
        match self {
            Party::Maker => Party::Taker,
            Party::Taker => Party::Maker,
        }
    }
}

// ---------------------------------------------------------------------------
// Offer
// ---------------------------------------------------------------------------

/// A maker's standing quote. Read-only to the settlement core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub id: Uuid,
    pub maker_id: String,
    pub maker_account: String,
    pub asset: AssetKind,
    pub side: TradeSide,
    /// Unit price in fiat. Ignored for secondary-asset offers, which trade at
    /// the active phase price.
    pub price_per_unit: Decimal,
    pub min_fiat: Decimal,
    pub max_fiat: Decimal,
    pub active: bool,
}

// ---------------------------------------------------------------------------
// Order
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub offer_id: Uuid,
    pub maker_id: String,
    pub taker_id: String,
    pub maker_account: String,
    pub taker_account: String,

    pub asset: AssetKind,
    /// Present only for [`AssetKind::Secondary`].
    pub asset_id: Option<u32>,
    pub amount_asset: Decimal,
    pub amount_fiat: Decimal,
    pub price_per_unit: Decimal,
    /// Sale phase label the order was priced against (secondary asset only).
    pub phase: Option<String>,
    pub side: TradeSide,

    pub status: OrderStatus,
    pub escrow_tx_ref: Option<String>,
    pub escrow_at: Option<DateTime<Utc>>,
    pub payer_declared_at: Option<DateTime<Utc>>,
    pub proof_refs: Vec<String>,
    pub released_tx_ref: Option<String>,
    pub released_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn party_id(&self, p: Party) -> &str {
        match p {
            Party::Maker => &self.maker_id,
            Party::Taker => &self.taker_id,
        }
    }

    pub fn party_account(&self, p: Party) -> &str {
        match p {
            Party::Maker => &self.maker_account,
            Party::Taker => &self.taker_account,
        }
    }

    /// Which party `caller` is, if any. Maker wins on self-trade (rejected
    /// at creation anyway).
    pub fn party_of(&self, caller: &str) -> Option<Party> {
        if caller == self.maker_id {
            Some(Party::Maker)
        } else if caller == self.taker_id {
            Some(Party::Taker)
        } else {
            None
        }
    }

    pub fn escrower_id(&self) -> &str {
        self.party_id(self.side.escrower())
    }

    pub fn escrower_account(&self) -> &str {
        self.party_account(self.side.escrower())
    }

    pub fn payer_id(&self) -> &str {
        self.party_id(self.side.payer())
    }

    pub fn payer_account(&self) -> &str {
        self.party_account(self.side.payer())
    }

    /// `amount_asset` in ledger minor units.
    pub fn amount_minor(&self) -> Result<MinorUnits, AmountError> {
        MinorUnits::from_decimal(self.amount_asset)
    }
}

// ---------------------------------------------------------------------------
// Phases
// ---------------------------------------------------------------------------

/// One sale window of the secondary asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseConfig {
    pub label: String,
    /// Position in the fixed phase sequence (ascending).
    pub seq: i32,
    pub price_per_unit: Decimal,
    pub supply_cap: MinorUnits,
    pub active: bool,
    pub start_height: Option<u64>,
    pub end_height: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationState {
    /// Counted against phase supply.
    Held,
    /// Order released; ledger supply is authoritative from here on.
    Settled,
    /// Order cancelled or expired; supply returned.
    Released,
}

impl ReservationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationState::Held => "HELD",
            ReservationState::Settled => "SETTLED",
            ReservationState::Released => "RELEASED",
        }
    }

    pub fn parse(s: &str) -> Result<Self, UnknownVariant> {
        match s {
            "HELD" => Ok(ReservationState::Held),
            "SETTLED" => Ok(ReservationState::Settled),
            "RELEASED" => Ok(ReservationState::Released),
            other => Err(UnknownVariant {
                kind: "reservation state",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseReservation {
    pub order_id: Uuid,
    pub phase: String,
    pub amount: MinorUnits,
    pub state: ReservationState,
}

// ---------------------------------------------------------------------------
// Settlement claims
// ---------------------------------------------------------------------------

/// Which ledger transfer of an order a claim covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SettlementLeg {
    /// Escrower to custody.
    Lock,
    /// Custody to payer.
    Release,
}

impl SettlementLeg {
    pub fn as_str(&self) -> &'static str {
        match self {
            SettlementLeg::Lock => "LOCK",
            SettlementLeg::Release => "RELEASE",
        }
    }

    pub fn parse(s: &str) -> Result<Self, UnknownVariant> {
        match s {
            "LOCK" => Ok(SettlementLeg::Lock),
            "RELEASE" => Ok(SettlementLeg::Release),
            other => Err(UnknownVariant {
                kind: "settlement leg",
                value: other.to_string(),
            }),
        }
    }

    /// Ledger memo carried by this leg's transfer. Stable across retries
    /// and processes.
    pub fn memo(&self, order_id: Uuid) -> String {
        format!("ptx:{order_id}:{}", self.as_str().to_ascii_lowercase())
    }
}

/// Persisted intent to submit one settlement transfer. Only the holder may
/// submit while `claimed_until` is in the future.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementClaim {
    pub order_id: Uuid,
    pub leg: SettlementLeg,
    pub memo: String,
    pub holder: String,
    /// 1 on first claim, bumped on every takeover of an expired lease.
    pub attempt: u32,
    pub claimed_until: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Reviews
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Review {
    pub order_id: Uuid,
    pub author_id: String,
    pub target_id: String,
    /// 1..=5
    pub stars: u8,
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings_round_trip() {
        for st in OrderStatus::ALL {
            assert_eq!(OrderStatus::parse(st.as_str()).unwrap(), st);
        }
        assert!(OrderStatus::parse("PAID").is_err());
    }

    #[test]
    fn settlement_memo_is_stable_per_order_and_leg() {
        let id = Uuid::new_v4();
        assert_eq!(SettlementLeg::Lock.memo(id), SettlementLeg::Lock.memo(id));
        assert_ne!(SettlementLeg::Lock.memo(id), SettlementLeg::Release.memo(id));
        assert_eq!(SettlementLeg::Release.memo(id), format!("ptx:{id}:release"));
        assert_eq!(SettlementLeg::parse("RELEASE").unwrap(), SettlementLeg::Release);
        assert!(SettlementLeg::parse("REFUND").is_err());
    }

    #[test]
    fn escrower_and_payer_are_always_counterparts() {
        for side in [TradeSide::SellAsset, TradeSide::BuyAsset] {
            assert_ne!(side.escrower(), side.payer());
        }
        assert_eq!(TradeSide::SellAsset.escrower(), Party::Maker);
        assert_eq!(TradeSide::BuyAsset.escrower(), Party::Taker);
    }

    #[test]
    fn serde_names_match_storage_names() {
        let s = serde_json::to_string(&OrderStatus::AwaitingFiatPayment).unwrap();
        assert_eq!(s, "\"AWAITING_FIAT_PAYMENT\"");
        let s = serde_json::to_string(&TradeSide::BuyAsset).unwrap();
        assert_eq!(s, "\"BUY_ASSET\"");
    }
}
