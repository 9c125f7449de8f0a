//! Typed view over the merged config tree.
//!
//! Every section has defaults so a minimal YAML (mode + custody account)
//! boots a paper daemon. Pointers read here must stay listed in
//! [`ConfigMode::consumed_sections`].

use anyhow::{bail, Context, Result};
use ptx_schemas::MinorUnits;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ConfigMode;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub mode: ConfigMode,
    pub ledger: LedgerSettings,
    pub custody: CustodySettings,
    pub orders: OrderSettings,
    pub phases: PhaseSettings,
    pub reputation: ReputationSettings,
    pub governance: GovernanceSettings,
    pub daemon: DaemonSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            mode: ConfigMode::Paper,
            ledger: LedgerSettings::default(),
            custody: CustodySettings::default(),
            orders: OrderSettings::default(),
            phases: PhaseSettings::default(),
            reputation: ReputationSettings::default(),
            governance: GovernanceSettings::default(),
            daemon: DaemonSettings::default(),
        }
    }
}

impl Settings {
    pub fn from_config_json(config_json: &Value) -> Result<Self> {
        let s: Settings =
            serde_json::from_value(config_json.clone()).context("CONFIG_INVALID: settings")?;
        s.validate()?;
        Ok(s)
    }

    fn validate(&self) -> Result<()> {
        if self.custody.account.trim().is_empty() {
            bail!("CONFIG_INVALID: /custody/account must be set");
        }
        if self.orders.ttl_secs <= 0 {
            bail!("CONFIG_INVALID: /orders/ttl_secs must be positive");
        }
        if self.orders.settlement_lease_secs <= 0 {
            bail!("CONFIG_INVALID: /orders/settlement_lease_secs must be positive");
        }
        for (ptr, r) in [
            ("/reputation/retry", &self.reputation.retry),
            ("/governance/retry", &self.governance.retry),
        ] {
            if r.max_attempts == 0 {
                bail!("CONFIG_INVALID: {ptr}/max_attempts must be >= 1");
            }
        }
        if self.mode == ConfigMode::Live && self.ledger.endpoint.trim().is_empty() {
            bail!("CONFIG_INVALID: /ledger/endpoint required in LIVE mode");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerSettings {
    pub endpoint: String,
    pub request_timeout_ms: u64,
    /// Upper bound on submit-and-wait-for-inclusion.
    pub submit_timeout_ms: u64,
    pub event_poll_ms: u64,
    pub keys_env: LedgerKeysEnv,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:9933".to_string(),
            request_timeout_ms: 10_000,
            submit_timeout_ms: 60_000,
            event_poll_ms: 6_000,
            keys_env: LedgerKeysEnv::default(),
        }
    }
}

/// Env var NAMES, never values.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerKeysEnv {
    pub custody_seed: String,
    pub rpc_token: String,
}

impl Default for LedgerKeysEnv {
    fn default() -> Self {
        Self {
            custody_seed: "PTX_CUSTODY_SEED".to_string(),
            rpc_token: "PTX_LEDGER_RPC_TOKEN".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CustodySettings {
    pub account: String,
    pub secondary_asset_id: u32,
}

impl Default for CustodySettings {
    fn default() -> Self {
        Self {
            account: String::new(),
            secondary_asset_id: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrderSettings {
    pub ttl_secs: i64,
    pub expiry_sweep_secs: u64,
    /// How long a lock or release holds its settlement claim before another
    /// instance may retry it.
    pub settlement_lease_secs: i64,
}

impl Default for OrderSettings {
    fn default() -> Self {
        Self {
            ttl_secs: 30 * 60,
            expiry_sweep_secs: 60,
            settlement_lease_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PhaseSettings {
    /// Issuance held outside the sale (team, treasury). `sold` is total
    /// issuance minus this.
    pub reserve_minor: MinorUnits,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReputationSettings {
    pub enabled: bool,
    pub interval_secs: u64,
    pub retry: RetrySettings,
}

impl Default for ReputationSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 60,
            retry: RetrySettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernanceSettings {
    pub enabled: bool,
    pub treasury_account: String,
    /// First height to scan; `None` = current height at boot.
    pub start_height: Option<u64>,
    pub retry: RetrySettings,
}

impl Default for GovernanceSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            treasury_account: String::new(),
            start_height: None,
            retry: RetrySettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonSettings {
    pub bind_addr: String,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8899".to_string(),
        }
    }
}
