//! Runtime secret resolution.
//!
//! Config YAML stores only env var NAMES (`/ledger/keys_env/*`). Binaries
//! call [`resolve_secrets_for_mode`] once at startup and pass the result into
//! constructors. Values never appear in `Debug` output or error messages.
//!
//! | Mode  | Required         |
//! |-------|------------------|
//! | LIVE  | custody seed     |
//! | PAPER | nothing          |
//!
//! The RPC token is optional in every mode.

use anyhow::{bail, Result};
use serde_json::Value;

use crate::ConfigMode;

const DEFAULT_CUSTODY_SEED_VAR: &str = "PTX_CUSTODY_SEED";
const DEFAULT_RPC_TOKEN_VAR: &str = "PTX_LEDGER_RPC_TOKEN";

#[derive(Clone)]
pub struct ResolvedSecrets {
    /// Signing seed for the custody identity.
    pub custody_seed: Option<String>,
    /// Bearer token for the ledger RPC endpoint.
    pub rpc_token: Option<String>,
}

impl std::fmt::Debug for ResolvedSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedSecrets")
            .field(
                "custody_seed",
                &self.custody_seed.as_ref().map(|_| "<REDACTED>"),
            )
            .field("rpc_token", &self.rpc_token.as_ref().map(|_| "<REDACTED>"))
            .finish()
    }
}

fn read_str_at(config: &Value, pointer: &str) -> Option<String> {
    let s = config.pointer(pointer)?.as_str()?;
    let trimmed = s.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn resolve_env(var_name: &str) -> Option<String> {
    match std::env::var(var_name) {
        Ok(v) if !v.trim().is_empty() => Some(v),
        _ => None,
    }
}

/// Resolve secrets for `mode`. Errors name the missing env var, never a value.
pub fn resolve_secrets_for_mode(config_json: &Value, mode: ConfigMode) -> Result<ResolvedSecrets> {
    let seed_var = read_str_at(config_json, "/ledger/keys_env/custody_seed")
        .unwrap_or_else(|| DEFAULT_CUSTODY_SEED_VAR.to_string());
    let token_var = read_str_at(config_json, "/ledger/keys_env/rpc_token")
        .unwrap_or_else(|| DEFAULT_RPC_TOKEN_VAR.to_string());

    let custody_seed = resolve_env(&seed_var);
    let rpc_token = resolve_env(&token_var);

    if mode == ConfigMode::Live && custody_seed.is_none() {
        bail!(
            "SECRETS_MISSING mode=LIVE: required env var '{}' (custody seed) is not set or empty",
            seed_var
        );
    }

    Ok(ResolvedSecrets {
        custody_seed,
        rpc_token,
    })
}
