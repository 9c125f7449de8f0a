//! ptx-daemon entry point.
//!
//! Loads layered config, picks the ledger and store for the configured mode,
//! starts the background workers and serves the HTTP surface. Handlers live
//! in `routes.rs`; wiring and shared state in `state.rs`.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{bail, Context};
use axum::http::{HeaderValue, Method};
use ptx_config::{resolve_secrets_for_mode, ConfigMode, LoadedConfig, Settings, UnusedKeyPolicy};
use ptx_daemon::{routes, state};
use ptx_ledger::{Ledger, PaperLedger, RpcConfig, RpcLedger};
use ptx_reconcile::{governance::spawn_governance_loop, spawn_reputation_loop};
use ptx_testkit::MemoryStore;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{info, warn, Level};

const ENV_CONFIG_PATHS: &str = "PTX_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "config/defaults/base.yaml";
const ENV_DAEMON_ADDR: &str = "PTX_DAEMON_ADDR";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Silent if the file does not exist; production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let loaded = load_config()?;
    let settings = loaded.settings()?;
    let policy = match settings.mode {
        ConfigMode::Live => UnusedKeyPolicy::Fail,
        ConfigMode::Paper => UnusedKeyPolicy::Warn,
    };
    let report = ptx_config::report_unused_keys(settings.mode, &loaded.config_json, policy)?;
    if !report.is_clean() {
        warn!(unused = ?report.unused_leaf_pointers, "config has keys nothing reads");
    }
    info!(
        mode = settings.mode.as_str(),
        config_hash = %loaded.config_hash,
        custody = %settings.custody.account,
        "config loaded"
    );

    let ledger = build_ledger(&loaded, &settings)?;
    let services = build_services(&settings, ledger).await?;
    let shared = Arc::new(state::AppState::new(&settings, services));

    spawn_workers(&shared, &settings).await;

    let app = routes::build_router(Arc::clone(&shared))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(cors_localhost_only());

    let addr = bind_addr(&settings)?;
    info!("ptx-daemon listening on http://{}", addr);

    axum::serve(tokio::net::TcpListener::bind(addr).await?, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server crashed")?;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

fn load_config() -> anyhow::Result<LoadedConfig> {
    let raw = std::env::var(ENV_CONFIG_PATHS).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let paths: Vec<&str> = raw
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();
    ptx_config::load_layered_yaml(&paths)
        .with_context(|| format!("loading config from {ENV_CONFIG_PATHS}={raw}"))
}

fn build_ledger(loaded: &LoadedConfig, settings: &Settings) -> anyhow::Result<Arc<dyn Ledger>> {
    let secrets = resolve_secrets_for_mode(&loaded.config_json, settings.mode)?;
    info!(?secrets, "secrets resolved");
    match settings.mode {
        ConfigMode::Paper => Ok(Arc::new(PaperLedger::new())),
        ConfigMode::Live => Ok(Arc::new(RpcLedger::new(RpcConfig {
            endpoint: settings.ledger.endpoint.clone(),
            request_timeout: Duration::from_millis(settings.ledger.request_timeout_ms),
            submit_timeout: Duration::from_millis(settings.ledger.submit_timeout_ms),
            auth_token: secrets.rpc_token,
        }))),
    }
}

/// Postgres when a database URL is set; PAPER mode may fall back to memory.
async fn build_services(
    settings: &Settings,
    ledger: Arc<dyn Ledger>,
) -> anyhow::Result<state::Services> {
    if std::env::var(ptx_db::ENV_DB_URL).is_ok() {
        let pool = ptx_db::connect_from_env().await?;
        ptx_db::migrate(&pool).await?;
        let store = Arc::new(ptx_db::PgStore::new(pool));
        return Ok(state::Services::wire(settings, ledger, store));
    }
    if settings.mode == ConfigMode::Live {
        bail!("{} is required in LIVE mode", ptx_db::ENV_DB_URL);
    }
    warn!("no database configured; PAPER state lives in memory only");
    Ok(state::Services::wire(
        settings,
        ledger,
        Arc::new(MemoryStore::new()),
    ))
}

async fn spawn_workers(shared: &Arc<state::AppState>, settings: &Settings) {
    state::spawn_heartbeat(shared.bus.clone(), Duration::from_secs(1));

    let mut flags = state::WorkerFlags {
        expiry_sweep: true,
        ..Default::default()
    };
    state::spawn_expiry_sweep(
        Arc::clone(shared),
        Duration::from_secs(settings.orders.expiry_sweep_secs.max(1)),
    );

    if settings.reputation.enabled {
        spawn_reputation_loop(
            Arc::clone(&shared.services.reputation),
            Duration::from_secs(settings.reputation.interval_secs.max(1)),
        );
        flags.reputation = true;
    }
    if settings.governance.enabled {
        if settings.governance.treasury_account.trim().is_empty() {
            warn!("governance enabled without a treasury account; payouts will not match");
        }
        spawn_governance_loop(
            Arc::clone(&shared.services.governance),
            settings.governance.start_height,
            Duration::from_millis(settings.ledger.event_poll_ms.max(1)),
        );
        flags.governance = true;
    }

    shared.status.write().await.workers = flags;
    info!(?flags, "workers started");
}

fn bind_addr(settings: &Settings) -> anyhow::Result<SocketAddr> {
    let raw = std::env::var(ENV_DAEMON_ADDR).unwrap_or_else(|_| settings.daemon.bind_addr.clone());
    raw.parse()
        .with_context(|| format!("invalid bind address {raw:?}"))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "ctrl-c handler unavailable");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

/// CORS: allow only localhost origins.
fn cors_localhost_only() -> CorsLayer {
    let allowed_origins = [
        "http://localhost",
        "http://127.0.0.1",
        "http://localhost:3000",
        "http://127.0.0.1:3000",
        "http://localhost:5173",
        "http://127.0.0.1:5173",
    ];

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(tower_http::cors::Any)
}
