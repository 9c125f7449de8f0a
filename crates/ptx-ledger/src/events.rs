//! Ledger events this system interprets, and the polling subscription.
//!
//! Wire envelope (schema v1):
//!
//! ```text
//! { "v": 1, "height": 812, "tx_ref": "0x…", "kind": "council.voted", "data": { … } }
//! ```
//!
//! Only the kinds in [`EventKind`] are understood. Unknown kinds and other
//! schema versions fail [`decode_event`] with [`LedgerError::Decode`]
//! instead of being guessed at.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{self, BoxStream, StreamExt};
use ptx_schemas::MinorUnits;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::{Ledger, LedgerError};

pub const EVENT_SCHEMA_VERSION: u32 = 1;

/// `tx_ref` used for events emitted by the runtime itself, not an extrinsic.
pub const SYSTEM_TX_REF: &str =
    "0x0000000000000000000000000000000000000000000000000000000000000000";

// ---------------------------------------------------------------------------
// EventKind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    CouncilProposed,
    CouncilVoted,
    CouncilClosed,
    CouncilExecuted,
    DemocracyProposed,
    DemocracyStarted,
    DemocracyVoted,
    DemocracyPassed,
    DemocracyNotPassed,
    DemocracyExecuted,
    BalanceTransfer,
    TreasurySpending,
}

impl EventKind {
    pub const ALL: [EventKind; 12] = [
        EventKind::CouncilProposed,
        EventKind::CouncilVoted,
        EventKind::CouncilClosed,
        EventKind::CouncilExecuted,
        EventKind::DemocracyProposed,
        EventKind::DemocracyStarted,
        EventKind::DemocracyVoted,
        EventKind::DemocracyPassed,
        EventKind::DemocracyNotPassed,
        EventKind::DemocracyExecuted,
        EventKind::BalanceTransfer,
        EventKind::TreasurySpending,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::CouncilProposed => "council.proposed",
            EventKind::CouncilVoted => "council.voted",
            EventKind::CouncilClosed => "council.closed",
            EventKind::CouncilExecuted => "council.executed",
            EventKind::DemocracyProposed => "democracy.proposed",
            EventKind::DemocracyStarted => "democracy.started",
            EventKind::DemocracyVoted => "democracy.voted",
            EventKind::DemocracyPassed => "democracy.passed",
            EventKind::DemocracyNotPassed => "democracy.not_passed",
            EventKind::DemocracyExecuted => "democracy.executed",
            EventKind::BalanceTransfer => "balances.transfer",
            EventKind::TreasurySpending => "treasury.spending",
        }
    }

    pub fn parse(s: &str) -> Option<EventKind> {
        EventKind::ALL.into_iter().find(|k| k.as_str() == s)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// EventBody / LedgerEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data")]
pub enum EventBody {
    #[serde(rename = "council.proposed")]
    CouncilProposed {
        proposer: String,
        proposal_index: u32,
        motion_hash: String,
        threshold: u32,
    },
    #[serde(rename = "council.voted")]
    CouncilVoted {
        voter: String,
        motion_hash: String,
        approve: bool,
        yes: u32,
        no: u32,
    },
    #[serde(rename = "council.closed")]
    CouncilClosed { motion_hash: String, yes: u32, no: u32 },
    #[serde(rename = "council.executed")]
    CouncilExecuted {
        motion_hash: String,
        ok: bool,
        #[serde(default)]
        error: Option<String>,
    },
    #[serde(rename = "democracy.proposed")]
    DemocracyProposed {
        proposal_index: u32,
        proposer: String,
        deposit: MinorUnits,
    },
    #[serde(rename = "democracy.started")]
    DemocracyStarted {
        ref_index: u32,
        threshold: String,
        #[serde(default)]
        preimage_hash: Option<String>,
    },
    #[serde(rename = "democracy.voted")]
    DemocracyVoted {
        voter: String,
        ref_index: u32,
        aye: bool,
        balance: MinorUnits,
    },
    #[serde(rename = "democracy.passed")]
    DemocracyPassed { ref_index: u32 },
    #[serde(rename = "democracy.not_passed")]
    DemocracyNotPassed { ref_index: u32 },
    #[serde(rename = "democracy.executed")]
    DemocracyExecuted { ref_index: u32, ok: bool },
    #[serde(rename = "balances.transfer")]
    BalanceTransfer {
        from: String,
        to: String,
        amount: MinorUnits,
    },
    #[serde(rename = "treasury.spending")]
    TreasurySpending { budget_remaining: MinorUnits },
}

impl EventBody {
    pub fn kind(&self) -> EventKind {
        match self {
            EventBody::CouncilProposed { .. } => EventKind::CouncilProposed,
            EventBody::CouncilVoted { .. } => EventKind::CouncilVoted,
            EventBody::CouncilClosed { .. } => EventKind::CouncilClosed,
            EventBody::CouncilExecuted { .. } => EventKind::CouncilExecuted,
            EventBody::DemocracyProposed { .. } => EventKind::DemocracyProposed,
            EventBody::DemocracyStarted { .. } => EventKind::DemocracyStarted,
            EventBody::DemocracyVoted { .. } => EventKind::DemocracyVoted,
            EventBody::DemocracyPassed { .. } => EventKind::DemocracyPassed,
            EventBody::DemocracyNotPassed { .. } => EventKind::DemocracyNotPassed,
            EventBody::DemocracyExecuted { .. } => EventKind::DemocracyExecuted,
            EventBody::BalanceTransfer { .. } => EventKind::BalanceTransfer,
            EventBody::TreasurySpending { .. } => EventKind::TreasurySpending,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LedgerEvent {
    pub height: u64,
    pub tx_ref: String,
    pub body: EventBody,
}

impl LedgerEvent {
    pub fn kind(&self) -> EventKind {
        self.body.kind()
    }
}

#[derive(Deserialize)]
struct Envelope {
    v: u32,
    height: u64,
    #[serde(default)]
    tx_ref: Option<String>,
    kind: String,
    #[serde(default)]
    data: Value,
}

/// Validate and decode one wire event.
pub fn decode_event(raw: &Value) -> Result<LedgerEvent, LedgerError> {
    let env: Envelope = serde_json::from_value(raw.clone())
        .map_err(|e| LedgerError::Decode(format!("event envelope: {e}")))?;

    if env.v != EVENT_SCHEMA_VERSION {
        return Err(LedgerError::Decode(format!(
            "unsupported event schema v{} (kind {})",
            env.v, env.kind
        )));
    }
    if EventKind::parse(&env.kind).is_none() {
        return Err(LedgerError::Decode(format!("unknown event kind {:?}", env.kind)));
    }

    let body: EventBody = serde_json::from_value(json!({ "kind": env.kind, "data": env.data }))
        .map_err(|e| LedgerError::Decode(format!("{} payload: {e}", env.kind)))?;

    Ok(LedgerEvent {
        height: env.height,
        tx_ref: env.tx_ref.unwrap_or_else(|| SYSTEM_TX_REF.to_string()),
        body,
    })
}

/// Inverse of [`decode_event`].
pub fn encode_event(ev: &LedgerEvent) -> Value {
    let mut v = serde_json::to_value(&ev.body).unwrap_or(Value::Null);
    if let Value::Object(map) = &mut v {
        map.insert("v".into(), json!(EVENT_SCHEMA_VERSION));
        map.insert("height".into(), json!(ev.height));
        map.insert("tx_ref".into(), json!(ev.tx_ref));
    }
    v
}

/// Decode a batch, dropping (and logging) anything that fails validation.
pub fn decode_batch(raw: &[Value]) -> Vec<LedgerEvent> {
    raw.iter()
        .filter_map(|r| match decode_event(r) {
            Ok(ev) => Some(ev),
            Err(e) => {
                warn!(error = %e, "dropping undecodable ledger event");
                None
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

struct PollState {
    ledger: Arc<dyn Ledger>,
    kinds: Vec<EventKind>,
    next_height: u64,
    poll_every: Duration,
    buffer: VecDeque<LedgerEvent>,
}

/// Endless stream of events of the given kinds, starting at `from_height`,
/// in height order. Polls `current_height` every `poll_every` once caught
/// up. Transport errors are logged and the same height is retried on the
/// next poll; the stream itself never ends.
pub fn subscribe_events(
    ledger: Arc<dyn Ledger>,
    kinds: &[EventKind],
    from_height: u64,
    poll_every: Duration,
) -> BoxStream<'static, LedgerEvent> {
    let state = PollState {
        ledger,
        kinds: kinds.to_vec(),
        next_height: from_height,
        poll_every,
        buffer: VecDeque::new(),
    };

    stream::unfold(state, |mut st| async move {
        loop {
            if let Some(ev) = st.buffer.pop_front() {
                return Some((ev, st));
            }

            let head = match st.ledger.current_height().await {
                Ok(h) => h,
                Err(e) => {
                    warn!(error = %e, "event poll: current_height failed");
                    tokio::time::sleep(st.poll_every).await;
                    continue;
                }
            };
            if st.next_height > head {
                tokio::time::sleep(st.poll_every).await;
                continue;
            }

            match st.ledger.events_at(st.next_height).await {
                Ok(events) => {
                    debug!(height = st.next_height, n = events.len(), "event poll");
                    st.buffer
                        .extend(events.into_iter().filter(|e| st.kinds.contains(&e.kind())));
                    st.next_height += 1;
                }
                Err(e) => {
                    warn!(height = st.next_height, error = %e, "event poll: events_at failed");
                    tokio::time::sleep(st.poll_every).await;
                }
            }
        }
    })
    .boxed()
}
