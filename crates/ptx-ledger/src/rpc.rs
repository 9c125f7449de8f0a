//! JSON-RPC ledger client.
//!
//! One logical connection per process. The session is established lazily by
//! the first call (`system_handshake`) under a lock, so concurrent first
//! callers share one handshake. A transport failure drops the session for
//! the generation that observed it; the next call reconnects. Nothing here
//! retries: every call is attempted exactly once and bounded by a timeout.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ptx_schemas::MinorUnits;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::events::decode_batch;
use crate::{
    decode_dispatch_error, AssetRef, Ledger, LedgerCall, LedgerError, LedgerEvent, SubmitOutcome,
    TransferFromRequest, TransferRecord, TransferRequest,
};

#[derive(Clone)]
pub struct RpcConfig {
    pub endpoint: String,
    /// Bound on queries.
    pub request_timeout: Duration,
    /// Bound on submit-and-wait-for-inclusion.
    pub submit_timeout: Duration,
    pub auth_token: Option<String>,
}

impl std::fmt::Debug for RpcConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcConfig")
            .field("endpoint", &self.endpoint)
            .field("request_timeout", &self.request_timeout)
            .field("submit_timeout", &self.submit_timeout)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug, Clone)]
struct Session {
    generation: u64,
    node: String,
}

#[derive(Default)]
struct Connection {
    slot: Mutex<Option<Arc<Session>>>,
    generation: AtomicU64,
}

pub struct RpcLedger {
    cfg: RpcConfig,
    http: reqwest::Client,
    conn: Connection,
    next_id: AtomicU64,
}

#[derive(Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Deserialize)]
struct SubmitWire {
    status: String,
    #[serde(default)]
    tx_ref: Option<String>,
    #[serde(default)]
    height: Option<u64>,
    #[serde(default)]
    error: Option<Value>,
}

impl RpcLedger {
    pub fn new(cfg: RpcConfig) -> Self {
        Self {
            cfg,
            http: reqwest::Client::new(),
            conn: Connection::default(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.cfg.endpoint
    }

    /// Number of sessions established so far.
    pub fn generation(&self) -> u64 {
        self.conn.generation.load(Ordering::SeqCst)
    }

    async fn session(&self) -> Result<Arc<Session>, LedgerError> {
        let mut slot = self.conn.slot.lock().await;
        if let Some(s) = slot.as_ref() {
            return Ok(s.clone());
        }

        let hello = self
            .raw_call("system_handshake", json!([]), self.cfg.request_timeout)
            .await?;
        let generation = self.conn.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let node = hello
            .get("node")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        info!(endpoint = %self.cfg.endpoint, generation, node = %node, "ledger session established");

        let session = Arc::new(Session { generation, node });
        *slot = Some(session.clone());
        Ok(session)
    }

    /// Drop the session if it is still the one that failed. A later
    /// generation established by another caller is left alone.
    async fn notify_disconnected(&self, generation: u64) {
        let mut slot = self.conn.slot.lock().await;
        if slot.as_ref().map(|s| s.generation) == Some(generation) {
            warn!(endpoint = %self.cfg.endpoint, generation, "ledger session dropped");
            *slot = None;
        }
    }

    async fn call(
        &self,
        method: &'static str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, LedgerError> {
        let session = self.session().await?;
        debug!(method, generation = session.generation, node = %session.node, "ledger rpc");
        let res = self.raw_call(method, params, timeout).await;
        if let Err(LedgerError::Transport(_)) = &res {
            self.notify_disconnected(session.generation).await;
        }
        res
    }

    async fn call_as<T: DeserializeOwned>(
        &self,
        method: &'static str,
        params: Value,
    ) -> Result<T, LedgerError> {
        let v = self.call(method, params, self.cfg.request_timeout).await?;
        serde_json::from_value(v).map_err(|e| LedgerError::Decode(format!("{method}: {e}")))
    }

    async fn raw_call(
        &self,
        method: &'static str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, LedgerError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params});

        let mut req = self.http.post(&self.cfg.endpoint).json(&body);
        if let Some(token) = &self.cfg.auth_token {
            req = req.bearer_auth(token);
        }

        let after_ms = timeout.as_millis() as u64;
        let fut = async {
            let resp = req.send().await.map_err(|e| map_reqwest(method, after_ms, e))?;
            if !resp.status().is_success() {
                return Err(LedgerError::Transport(format!(
                    "{method}: http status {}",
                    resp.status()
                )));
            }
            resp.json::<RpcResponse>()
                .await
                .map_err(|e| LedgerError::Decode(format!("{method}: {e}")))
        };

        let parsed = match tokio::time::timeout(timeout, fut).await {
            Ok(r) => r?,
            Err(_) => return Err(LedgerError::Timeout { op: method, after_ms }),
        };

        if let Some(err) = parsed.error {
            return Err(LedgerError::Rpc {
                code: err.code,
                message: err.message,
            });
        }
        Ok(parsed.result.unwrap_or(Value::Null))
    }

    async fn submit(
        &self,
        method: &'static str,
        params: Value,
    ) -> Result<SubmitOutcome, LedgerError> {
        let v = self.call(method, params, self.cfg.submit_timeout).await?;
        let wire: SubmitWire =
            serde_json::from_value(v).map_err(|e| LedgerError::Decode(format!("{method}: {e}")))?;

        match wire.status.as_str() {
            "included" => match (wire.tx_ref, wire.height) {
                (Some(tx_ref), Some(height)) => Ok(SubmitOutcome::Included { tx_ref, height }),
                _ => Err(LedgerError::Decode(format!(
                    "{method}: included without tx_ref/height"
                ))),
            },
            "failed" => Ok(SubmitOutcome::Failed {
                reason: wire
                    .error
                    .as_ref()
                    .map(decode_dispatch_error)
                    .unwrap_or_else(|| "unknown".to_string()),
            }),
            other => Err(LedgerError::Decode(format!("{method}: unknown status {other:?}"))),
        }
    }
}

fn map_reqwest(method: &'static str, after_ms: u64, e: reqwest::Error) -> LedgerError {
    if e.is_timeout() {
        LedgerError::Timeout { op: method, after_ms }
    } else {
        LedgerError::Transport(format!("{method}: {e}"))
    }
}

#[async_trait]
impl Ledger for RpcLedger {
    async fn submit_transfer(&self, req: &TransferRequest) -> Result<SubmitOutcome, LedgerError> {
        self.submit("author_submitTransfer", json!([req])).await
    }

    async fn submit_transfer_from(
        &self,
        req: &TransferFromRequest,
    ) -> Result<SubmitOutcome, LedgerError> {
        self.submit("author_submitTransferFrom", json!([req])).await
    }

    async fn submit_call(&self, call: &LedgerCall) -> Result<SubmitOutcome, LedgerError> {
        self.submit("author_submitCall", json!([call])).await
    }

    async fn find_transfer(&self, tx_ref: &str) -> Result<Option<TransferRecord>, LedgerError> {
        self.call_as("ledger_findTransfer", json!([tx_ref])).await
    }

    async fn find_transfer_by_memo(
        &self,
        memo: &str,
    ) -> Result<Option<TransferRecord>, LedgerError> {
        self.call_as("ledger_findTransferByMemo", json!([memo])).await
    }

    async fn query_balance(
        &self,
        asset: AssetRef,
        account: &str,
    ) -> Result<MinorUnits, LedgerError> {
        self.call_as("state_getBalance", json!([asset, account])).await
    }

    async fn query_storage_value(
        &self,
        path: &str,
        key: &str,
    ) -> Result<Option<Value>, LedgerError> {
        let v = self
            .call("state_getStorage", json!([path, key]), self.cfg.request_timeout)
            .await?;
        Ok(if v.is_null() { None } else { Some(v) })
    }

    async fn total_issuance(&self, asset: AssetRef) -> Result<MinorUnits, LedgerError> {
        self.call_as("state_getTotalIssuance", json!([asset])).await
    }

    async fn current_height(&self) -> Result<u64, LedgerError> {
        self.call_as("chain_getHeight", json!([])).await
    }

    async fn events_at(&self, height: u64) -> Result<Vec<LedgerEvent>, LedgerError> {
        let raw: Vec<Value> = self.call_as("chain_getEvents", json!([height])).await?;
        Ok(decode_batch(&raw))
    }
}
