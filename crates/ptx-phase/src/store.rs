use async_trait::async_trait;
use ptx_schemas::{MinorUnits, PhaseConfig, PhaseReservation, ReservationState};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AdvanceOutcome {
    /// `from` is `None` when nothing was active before.
    Advanced {
        from: Option<String>,
        to: PhaseConfig,
    },
    /// Current phase is the last in the sequence; nothing changed.
    NoNext,
}

/// Persistence for phase configs and supply reservations.
///
/// Implementations must make `try_reserve` and `advance` atomic with respect
/// to each other (Postgres: row lock on the active phase).
#[async_trait]
pub trait PhaseStore: Send + Sync {
    /// All phases, ascending `seq`.
    async fn phases(&self) -> anyhow::Result<Vec<PhaseConfig>>;

    async fn active_phase(&self) -> anyhow::Result<Option<PhaseConfig>>;

    /// Sum of `Held` reservations against `phase`.
    async fn held_total(&self, phase: &str) -> anyhow::Result<MinorUnits>;

    /// Insert `r` as `Held` only if the phase's held total plus `r.amount`
    /// stays within `limit`. Returns whether it was inserted.
    async fn try_reserve(&self, r: &PhaseReservation, limit: MinorUnits) -> anyhow::Result<bool>;

    async fn reservation(&self, order_id: Uuid) -> anyhow::Result<Option<PhaseReservation>>;

    /// Move a `Held` reservation to `to`. Returns `false` if there was no
    /// held reservation for the order.
    async fn finish_reservation(&self, order_id: Uuid, to: ReservationState)
        -> anyhow::Result<bool>;

    /// Deactivate the current phase (stamping `end_height`) and activate the
    /// next by `seq` (stamping `start_height`) in one transaction. With no
    /// active phase, activates the first phase that has never ended.
    async fn advance(&self, height: Option<u64>) -> anyhow::Result<AdvanceOutcome>;
}
