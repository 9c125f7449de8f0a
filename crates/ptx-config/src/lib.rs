//! Layered YAML configuration.
//!
//! Documents are deep-merged in order (base first, overrides last) into one
//! JSON tree, checked for literal secrets, canonicalized and hashed. Typed
//! access goes through [`Settings`]; secrets are resolved separately from
//! env var NAMES via [`secrets::resolve_secrets_for_mode`].

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;

pub mod secrets;
pub mod settings;
mod tree;

pub use secrets::{resolve_secrets_for_mode, ResolvedSecrets};
pub use settings::{
    CustodySettings, DaemonSettings, GovernanceSettings, LedgerKeysEnv, LedgerSettings,
    OrderSettings, PhaseSettings, ReputationSettings, RetrySettings, Settings,
};

/// Leaf strings starting with one of these abort loading with
/// CONFIG_SECRET_DETECTED.
const SECRET_PREFIXES: &[&str] = &[
    "sk-",
    "sk_live",
    "sk_test",
    "AKIA",
    "-----BEGIN",
    "ghp_",
    "glpat-",
    "xoxb-",
    "xprv",
];

/// `PAPER` runs against the in-memory ledger; `LIVE` against the RPC node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConfigMode {
    Paper,
    Live,
}

impl ConfigMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigMode::Paper => "PAPER",
            ConfigMode::Live => "LIVE",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PAPER" => Ok(ConfigMode::Paper),
            "LIVE" => Ok(ConfigMode::Live),
            other => bail!("CONFIG_UNKNOWN_MODE: '{other}' (expected PAPER | LIVE)"),
        }
    }

    /// Top-level sections [`Settings`] and the secret resolver read in this
    /// mode. Paper never dials the node, so `ledger` is not read there.
    pub fn consumed_sections(&self) -> &'static [&'static str] {
        const SHARED: &[&str] = &[
            "mode",
            "custody",
            "orders",
            "phases",
            "reputation",
            "governance",
            "daemon",
        ];
        const WITH_LEDGER: &[&str] = &[
            "mode",
            "ledger",
            "custody",
            "orders",
            "phases",
            "reputation",
            "governance",
            "daemon",
        ];
        match self {
            ConfigMode::Paper => SHARED,
            ConfigMode::Live => WITH_LEDGER,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnusedKeyPolicy {
    Warn,
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnusedKeyReport {
    pub mode: String,
    pub consumed_prefixes: Vec<String>,
    pub unused_leaf_pointers: Vec<String>,
}

impl UnusedKeyReport {
    pub fn is_clean(&self) -> bool {
        self.unused_leaf_pointers.is_empty()
    }
}

/// Leaves of `config_json` outside every consumed section. With
/// [`UnusedKeyPolicy::Fail`] a non-empty report is an error.
pub fn report_unused_keys(
    mode: ConfigMode,
    config_json: &Value,
    policy: UnusedKeyPolicy,
) -> Result<UnusedKeyReport> {
    let consumed_prefixes: Vec<String> = mode
        .consumed_sections()
        .iter()
        .map(|s| format!("/{s}"))
        .collect();

    let unused_leaf_pointers: Vec<String> = tree::leaves(config_json)
        .into_iter()
        .map(|(ptr, _)| ptr)
        .filter(|ptr| !consumed_prefixes.iter().any(|sec| tree::owns(sec, ptr)))
        .collect();

    let report = UnusedKeyReport {
        mode: mode.as_str().to_string(),
        consumed_prefixes,
        unused_leaf_pointers,
    };

    if policy == UnusedKeyPolicy::Fail && !report.is_clean() {
        let shown: Vec<&String> = report.unused_leaf_pointers.iter().take(12).collect();
        bail!(
            "CONFIG_UNUSED_KEYS (mode={}): {} key(s) nothing reads: {:?}",
            report.mode,
            report.unused_leaf_pointers.len(),
            shown
        );
    }
    Ok(report)
}

/// A merged, secret-free config tree plus its canonical form and hash.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config_hash: String,
    pub canonical_json: String,
    pub config_json: Value,
}

impl LoadedConfig {
    pub fn settings(&self) -> Result<Settings> {
        Settings::from_config_json(&self.config_json)
    }
}

pub fn load_layered_yaml(paths: &[&str]) -> Result<LoadedConfig> {
    let docs = paths
        .iter()
        .map(|p| fs::read_to_string(p).with_context(|| format!("failed to read yaml path: {p}")))
        .collect::<Result<Vec<String>>>()?;
    let refs: Vec<&str> = docs.iter().map(String::as_str).collect();
    load_layered_yaml_from_strings(&refs)
}

pub fn load_layered_yaml_from_strings(yaml_docs: &[&str]) -> Result<LoadedConfig> {
    let mut merged = Value::Object(Default::default());
    for (i, raw) in yaml_docs.iter().enumerate() {
        let layer: serde_yaml::Value =
            serde_yaml::from_str(raw).with_context(|| format!("invalid yaml in layer {i}"))?;
        let layer = serde_json::to_value(layer).context("yaml->json conversion failed")?;
        tree::overlay(&mut merged, layer);
    }

    if let Some(ptr) = first_secret_literal(&merged) {
        bail!("CONFIG_SECRET_DETECTED leaf={ptr} value=REDACTED");
    }

    // serde_json's default Map is a BTreeMap, so this is key-sorted.
    let canonical_json =
        serde_json::to_string(&merged).context("canonical json serialize failed")?;
    let config_hash = hex::encode(Sha256::digest(canonical_json.as_bytes()));
    Ok(LoadedConfig {
        config_hash,
        canonical_json,
        config_json: merged,
    })
}

fn first_secret_literal(root: &Value) -> Option<String> {
    tree::leaves(root)
        .into_iter()
        .find(|(_, v)| v.as_str().is_some_and(looks_like_secret))
        .map(|(ptr, _)| ptr)
}

fn looks_like_secret(s: &str) -> bool {
    let t = s.trim();
    t.len() >= 8 && (SECRET_PREFIXES.iter().any(|p| t.starts_with(p)) || is_raw_seed(t))
}

/// `0x` + 64 hex chars: a 32-byte seed pasted where an env var name belongs.
fn is_raw_seed(t: &str) -> bool {
    t.strip_prefix("0x")
        .is_some_and(|h| h.len() == 64 && h.bytes().all(|b| b.is_ascii_hexdigit()))
}
