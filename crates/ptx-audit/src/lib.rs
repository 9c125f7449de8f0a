//! Append-only, hash-chained system events for an order's thread.
//!
//! Each order carries its own chain: `hash_prev` of event N equals
//! `hash_self` of event N-1, and `hash_self` is SHA-256 over the canonical
//! JSON of the event with `hash_self` cleared. Event ids are UUID v5 over
//! (order id, previous hash, seq), so replaying the same history yields the
//! same ids.
//!
//! These events are an audit trail only; order state is never rebuilt from
//! them.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Author recorded on every event; the user who triggered the transition
/// goes in `triggered_by`.
pub const SYSTEM_AUTHOR: &str = "SYSTEM";

const EVENT_ID_NAMESPACE: Uuid = Uuid::from_u128(0x5f1c_2d7e_a0b4_4c8e_9d31_6e0a_7b52_c4f9);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderEventRecord {
    pub event_id: Uuid,
    pub order_id: Uuid,
    pub seq: u64,
    pub ts_utc: DateTime<Utc>,
    pub author: String,
    pub triggered_by: String,
    /// Transition name, e.g. `ESCROW_CONFIRMED`.
    pub kind: String,
    pub tx_ref: Option<String>,
    pub payload: Value,
    pub hash_prev: Option<String>,
    pub hash_self: Option<String>,
}

/// Cursor over one order's chain.
#[derive(Debug, Clone)]
pub struct EventChain {
    order_id: Uuid,
    last_hash: Option<String>,
    seq: u64,
}

impl EventChain {
    /// Fresh chain for a new order.
    pub fn new(order_id: Uuid) -> Self {
        Self {
            order_id,
            last_hash: None,
            seq: 0,
        }
    }

    /// Continue after the last persisted event (or start fresh if none).
    pub fn resume(order_id: Uuid, last: Option<&OrderEventRecord>) -> Self {
        match last {
            Some(ev) => Self {
                order_id,
                last_hash: ev.hash_self.clone(),
                seq: ev.seq + 1,
            },
            None => Self::new(order_id),
        }
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn last_hash(&self) -> Option<&str> {
        self.last_hash.as_deref()
    }

    /// Build the next event and advance the cursor. Nothing is written; the
    /// caller persists the record together with the state change.
    pub fn append(
        &mut self,
        kind: &str,
        triggered_by: &str,
        tx_ref: Option<&str>,
        payload: Value,
        ts_utc: DateTime<Utc>,
    ) -> Result<OrderEventRecord> {
        let event_id = derive_event_id(self.order_id, self.last_hash.as_deref(), self.seq);

        let mut ev = OrderEventRecord {
            event_id,
            order_id: self.order_id,
            seq: self.seq,
            ts_utc,
            author: SYSTEM_AUTHOR.to_string(),
            triggered_by: triggered_by.to_string(),
            kind: kind.to_string(),
            tx_ref: tx_ref.map(str::to_string),
            payload,
            hash_prev: self.last_hash.clone(),
            hash_self: None,
        };
        let h = compute_event_hash(&ev)?;
        ev.hash_self = Some(h.clone());

        self.last_hash = Some(h);
        self.seq += 1;
        Ok(ev)
    }
}

fn derive_event_id(order_id: Uuid, prev_hash: Option<&str>, seq: u64) -> Uuid {
    let name = format!("{}|{}|{}", order_id, prev_hash.unwrap_or("-"), seq);
    Uuid::new_v5(&EVENT_ID_NAMESPACE, name.as_bytes())
}

/// Hash over the canonical JSON of the event WITHOUT `hash_self`.
///
/// Going through `Value` sorts object keys (serde_json's default map is a
/// `BTreeMap`), so the digest does not depend on struct field order.
pub fn compute_event_hash(ev: &OrderEventRecord) -> Result<String> {
    let mut tree = serde_json::to_value(ev).context("serialize order event failed")?;
    if let Value::Object(map) = &mut tree {
        map.remove("hash_self");
    }
    let canonical = serde_json::to_vec(&tree).context("json stringify failed")?;
    Ok(hex::encode(Sha256::digest(&canonical)))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyResult {
    Valid { events: usize },
    Broken { seq: u64, reason: String },
}

/// Verify one order's events, in `seq` order.
pub fn verify_chain(events: &[OrderEventRecord]) -> Result<VerifyResult> {
    let mut prev_hash: Option<String> = None;

    for (i, ev) in events.iter().enumerate() {
        if ev.seq != i as u64 {
            return Ok(VerifyResult::Broken {
                seq: ev.seq,
                reason: format!("seq gap: expected {}, got {}", i, ev.seq),
            });
        }
        if ev.hash_prev != prev_hash {
            return Ok(VerifyResult::Broken {
                seq: ev.seq,
                reason: format!(
                    "hash_prev mismatch: expected {:?}, got {:?}",
                    prev_hash, ev.hash_prev
                ),
            });
        }
        let recomputed = compute_event_hash(ev)?;
        if ev.hash_self.as_deref() != Some(recomputed.as_str()) {
            return Ok(VerifyResult::Broken {
                seq: ev.seq,
                reason: format!(
                    "hash_self mismatch: claimed {:?}, recomputed {}",
                    ev.hash_self, recomputed
                ),
            });
        }
        prev_hash = ev.hash_self.clone();
    }

    Ok(VerifyResult::Valid {
        events: events.len(),
    })
}
