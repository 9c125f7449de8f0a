//! Command handler modules for the `ptx` operator CLI.
//!
//! Shared wiring lives here: config loading, ledger selection and the
//! Postgres-backed settlement services that operator commands act on.

pub mod reconcile;
pub mod settlement;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use ptx_config::{resolve_secrets_for_mode, ConfigMode, LoadedConfig, RetrySettings, Settings};
use ptx_db::PgStore;
use ptx_escrow::EscrowService;
use ptx_ledger::{Ledger, PaperLedger, RpcConfig, RpcLedger};
use ptx_orders::{OrderService, OrderServiceConfig};
use ptx_phase::PhaseController;
use ptx_reconcile::{ReputationWorker, RetryPolicy};
use ptx_schemas::AssetKind;

pub fn load_config(paths: &[String]) -> Result<(LoadedConfig, Settings)> {
    let path_refs: Vec<&str> = paths.iter().map(|s| s.as_str()).collect();
    let loaded = ptx_config::load_layered_yaml(&path_refs)?;
    let settings = loaded.settings()?;
    Ok((loaded, settings))
}

/// Parse `--asset` (case-insensitive NATIVE | SECONDARY).
pub fn parse_asset(s: &str) -> Result<AssetKind> {
    AssetKind::parse(&s.trim().to_ascii_uppercase())
        .with_context(|| format!("invalid --asset '{s}'. expected one of: NATIVE | SECONDARY"))
}

fn build_ledger(loaded: &LoadedConfig, settings: &Settings) -> Result<Arc<dyn Ledger>> {
    let secrets = resolve_secrets_for_mode(&loaded.config_json, settings.mode)?;
    Ok(match settings.mode {
        ConfigMode::Paper => {
            eprintln!("note: PAPER mode; ledger reads come from an empty in-process ledger");
            Arc::new(PaperLedger::new())
        }
        ConfigMode::Live => Arc::new(RpcLedger::new(RpcConfig {
            endpoint: settings.ledger.endpoint.clone(),
            request_timeout: Duration::from_millis(settings.ledger.request_timeout_ms),
            submit_timeout: Duration::from_millis(settings.ledger.submit_timeout_ms),
            auth_token: secrets.rpc_token,
        })),
    })
}

fn retry_policy(r: &RetrySettings) -> RetryPolicy {
    RetryPolicy::new(r.max_attempts, Duration::from_millis(r.base_delay_ms))
}

/// Settlement services over the configured database and ledger.
pub struct Core {
    pub settings: Settings,
    pub escrow: Arc<EscrowService>,
    pub phases: Arc<PhaseController>,
    pub orders: Arc<OrderService>,
    pub reputation: Arc<ReputationWorker>,
}

impl Core {
    pub async fn connect(config_paths: &[String]) -> Result<Self> {
        let (loaded, settings) = load_config(config_paths)?;
        let ledger = build_ledger(&loaded, &settings)?;
        let pool = ptx_db::connect_from_env().await?;
        let store = Arc::new(PgStore::new(pool));

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
            ledger,
            custody,
            retry_policy(&settings.reputation.retry),
        ));
        let orders = Arc::new(OrderService::new(
            store.clone(),
            store,
            escrow.clone(),
            phases.clone(),
            OrderServiceConfig {
                order_ttl: chrono::Duration::seconds(settings.orders.ttl_secs),
                secondary_asset_id: asset_id,
                settlement_lease: chrono::Duration::seconds(settings.orders.settlement_lease_secs),
            },
        ));

        Ok(Self {
            settings,
            escrow,
            phases,
            orders,
            reputation,
        })
    }
}
