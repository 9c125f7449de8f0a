//! Shared runtime state for ptx-daemon.
//!
//! Handlers receive `State<Arc<AppState>>` from Axum. The settlement services
//! are wired once in [`Services::wire`] over any store that implements every
//! persistence trait (Postgres in production, memory in paper runs).

use std::sync::Arc;
use std::time::Duration;

use ptx_config::{RetrySettings, Settings};
use ptx_escrow::EscrowService;
use ptx_ledger::Ledger;
use ptx_orders::{OfferStore, OrderService, OrderServiceConfig, OrderStore};
use ptx_phase::{PhaseController, PhaseStore};
use ptx_reconcile::governance::{GovernanceStore, GovernanceWorker};
use ptx_reconcile::{ReputationSource, ReputationTrigger, ReputationWorker, RetryPolicy};
use ptx_schemas::OrderStatus;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// BusMsg
// ---------------------------------------------------------------------------

/// Messages broadcast over the internal event bus and surfaced as SSE events.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusMsg {
    Heartbeat { ts_millis: i64 },
    Status(StatusSnapshot),
    LogLine { level: String, msg: String },
    /// An order moved to `status`; `kind` is the audit event name.
    Order {
        order_id: Uuid,
        status: OrderStatus,
        kind: String,
    },
}

impl BusMsg {
    pub fn event_name(&self) -> &'static str {
        match self {
            BusMsg::Heartbeat { .. } => "heartbeat",
            BusMsg::Status(_) => "status",
            BusMsg::LogLine { .. } => "log",
            BusMsg::Order { .. } => "order",
        }
    }
}

// ---------------------------------------------------------------------------
// BuildInfo / StatusSnapshot
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

/// Which background loops this process runs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerFlags {
    pub reputation: bool,
    pub governance: bool,
    pub expiry_sweep: bool,
}

/// Returned by GET /v1/status and carried inside SSE `status` events.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub daemon_uptime_secs: u64,
    /// "PAPER" | "LIVE"
    pub mode: String,
    pub custody_account: String,
    pub active_phase: Option<String>,
    pub workers: WorkerFlags,
    pub notes: Option<String>,
}

// ---------------------------------------------------------------------------
// Services
// ---------------------------------------------------------------------------

/// The settlement core as the HTTP layer sees it.
#[derive(Clone)]
pub struct Services {
    pub orders: Arc<OrderService>,
    pub phases: Arc<PhaseController>,
    pub escrow: Arc<EscrowService>,
    pub reputation: Arc<ReputationWorker>,
    pub governance: Arc<GovernanceWorker>,
    pub governance_store: Arc<dyn GovernanceStore>,
}

impl Services {
    /// Build every service over one ledger and one store. When reputation
    /// sync is enabled, releasing an order also reconciles both parties.
    pub fn wire<S>(settings: &Settings, ledger: Arc<dyn Ledger>, store: Arc<S>) -> Self
    where
        S: OrderStore + OfferStore + PhaseStore + ReputationSource + GovernanceStore + 'static,
    {
        let custody = settings.custody.account.clone();
        let asset_id = settings.custody.secondary_asset_id;

        let escrow = Arc::new(EscrowService::new(ledger.clone(), custody.clone(), asset_id));
        let phases = Arc::new(PhaseController::new(
            store.clone(),
            ledger.clone(),
            asset_id,
            settings.phases.reserve_minor,
        ));
        let reputation = Arc::new(ReputationWorker::new(
            store.clone(),
            ledger.clone(),
            custody,
            retry_policy(&settings.reputation.retry),
        ));
        let governance = Arc::new(GovernanceWorker::new(
            store.clone(),
            ledger,
            settings.governance.treasury_account.clone(),
            retry_policy(&settings.governance.retry),
        ));

        let mut orders = OrderService::new(
            store.clone(),
            store.clone(),
            escrow.clone(),
            phases.clone(),
            OrderServiceConfig {
                order_ttl: chrono::Duration::seconds(settings.orders.ttl_secs),
                secondary_asset_id: asset_id,
                settlement_lease: chrono::Duration::seconds(settings.orders.settlement_lease_secs),
            },
        );
        if settings.reputation.enabled {
            orders = orders.with_release_hook(Arc::new(ReputationTrigger::new(reputation.clone())));
        }

        Self {
            orders: Arc::new(orders),
            phases,
            escrow,
            reputation,
            governance,
            governance_store: store,
        }
    }
}

pub fn retry_policy(r: &RetrySettings) -> RetryPolicy {
    RetryPolicy::new(r.max_attempts, Duration::from_millis(r.base_delay_ms))
}

// ---------------------------------------------------------------------------
// AppState
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    /// Broadcast bus for SSE.
    pub bus: broadcast::Sender<BusMsg>,
    pub build: BuildInfo,
    pub status: Arc<RwLock<StatusSnapshot>>,
    pub services: Services,
}

impl AppState {
    pub fn new(settings: &Settings, services: Services) -> Self {
        let (bus, _rx) = broadcast::channel::<BusMsg>(1024);

        let initial_status = StatusSnapshot {
            daemon_uptime_secs: uptime_secs(),
            mode: settings.mode.as_str().to_string(),
            custody_account: settings.custody.account.clone(),
            active_phase: None,
            workers: WorkerFlags::default(),
            notes: None,
        };

        Self {
            bus,
            build: BuildInfo {
                service: "ptx-daemon",
                version: env!("CARGO_PKG_VERSION"),
            },
            status: Arc::new(RwLock::new(initial_status)),
            services,
        }
    }

    /// Publish an order transition. No subscribers is fine.
    pub fn publish_order(&self, order_id: Uuid, status: OrderStatus, kind: &str) {
        let _ = self.bus.send(BusMsg::Order {
            order_id,
            status,
            kind: kind.to_string(),
        });
    }

    pub fn publish_log(&self, level: &str, msg: impl Into<String>) {
        let _ = self.bus.send(BusMsg::LogLine {
            level: level.to_string(),
            msg: msg.into(),
        });
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Seconds since first call (process lifetime).
pub fn uptime_secs() -> u64 {
    static START: std::sync::OnceLock<std::time::Instant> = std::sync::OnceLock::new();
    START
        .get_or_init(std::time::Instant::now)
        .elapsed()
        .as_secs()
}

/// Emit a heartbeat SSE every `interval`.
pub fn spawn_heartbeat(bus: broadcast::Sender<BusMsg>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let ts = chrono::Utc::now().timestamp_millis();
            let _ = bus.send(BusMsg::Heartbeat { ts_millis: ts });
        }
    });
}

/// Expire overdue orders every `interval` and announce each one on the bus.
/// A failed sweep is logged and retried on the next tick.
pub fn spawn_expiry_sweep(state: Arc<AppState>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            match state
                .services
                .orders
                .expire_overdue(chrono::Utc::now())
                .await
            {
                Ok(sweep) => {
                    for id in &sweep.expired {
                        state.publish_order(*id, OrderStatus::Expired, "EXPIRED");
                    }
                    if !sweep.expired.is_empty() {
                        info!(
                            expired = sweep.expired.len(),
                            skipped = sweep.skipped.len(),
                            "expiry sweep"
                        );
                    }
                    if !sweep.stranded.is_empty() {
                        state.publish_log(
                            "WARN",
                            format!(
                                "{} overdue orders hold escrowed funds",
                                sweep.stranded.len()
                            ),
                        );
                    }
                }
                Err(e) => {
                    warn!(error = %e, "expiry sweep failed");
                    state.publish_log("WARN", format!("expiry sweep failed: {e}"));
                }
            }
        }
    });
}
