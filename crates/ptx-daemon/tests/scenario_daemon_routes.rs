//! In-process scenario tests for ptx-daemon HTTP endpoints.
//!
//! The router is wired over a paper ledger and the in-memory store, then
//! driven with `tower::ServiceExt::oneshot`; no socket is bound.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use ptx_config::Settings;
use ptx_daemon::routes::{self, CALLER_HEADER};
use ptx_daemon::state::{AppState, BusMsg, Services};
use ptx_ledger::{AssetRef, PaperLedger};
use ptx_schemas::{AssetKind, MinorUnits, TradeSide};
use ptx_testkit::{
    offer, phase, MemoryStore, CUSTODY, MAKER, MAKER_ACCOUNT, SECONDARY_ASSET_ID, TAKER,
    TAKER_ACCOUNT, TREASURY,
};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use tower::ServiceExt; // oneshot
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct Fixture {
    router: axum::Router,
    state: Arc<AppState>,
    ledger: Arc<PaperLedger>,
    store: Arc<MemoryStore>,
}

fn fixture() -> Fixture {
    let mut settings = Settings::default();
    settings.custody.account = CUSTODY.to_string();
    settings.custody.secondary_asset_id = SECONDARY_ASSET_ID;
    settings.governance.treasury_account = TREASURY.to_string();
    // Keep ledger calls deterministic; the release hook is covered in testkit.
    settings.reputation.enabled = false;

    let ledger = Arc::new(PaperLedger::new());
    let store = Arc::new(MemoryStore::new());
    let services = Services::wire(&settings, ledger.clone(), store.clone());
    let state = Arc::new(AppState::new(&settings, services));
    Fixture {
        router: routes::build_router(Arc::clone(&state)),
        state,
        ledger,
        store,
    }
}

impl Fixture {
    fn native_offer(&self, side: TradeSide) -> Uuid {
        let o = offer(AssetKind::Native, side, Decimal::from(2));
        let id = o.id;
        self.store.insert_offer(o);
        id
    }

    async fn call(&self, req: Request<Body>) -> (StatusCode, Value) {
        let resp = self.router.clone().oneshot(req).await.expect("oneshot failed");
        let status = resp.status();
        let body = resp
            .into_body()
            .collect()
            .await
            .expect("body collect failed")
            .to_bytes();
        let json = if body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body).expect("body is not valid JSON")
        };
        (status, json)
    }

    async fn get(&self, uri: &str, caller: Option<&str>) -> (StatusCode, Value) {
        let mut b = Request::builder().method("GET").uri(uri);
        if let Some(c) = caller {
            b = b.header(CALLER_HEADER, c);
        }
        self.call(b.body(Body::empty()).unwrap()).await
    }

    async fn post(&self, uri: &str, caller: Option<&str>, body: Value) -> (StatusCode, Value) {
        let mut b = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(c) = caller {
            b = b.header(CALLER_HEADER, c);
        }
        self.call(b.body(Body::from(body.to_string())).unwrap()).await
    }

    async fn create_order(&self, offer_id: Uuid, units: &str) -> (StatusCode, Value) {
        self.post(
            "/v1/orders",
            Some(TAKER),
            json!({
                "offer_id": offer_id,
                "taker_account": TAKER_ACCOUNT,
                "amount": {"leg": "asset", "value": units},
            }),
        )
        .await
    }
}

fn minor(units: u64) -> String {
    MinorUnits::from_units(units).to_string()
}

// ---------------------------------------------------------------------------
// Health / status
// ---------------------------------------------------------------------------

#[tokio::test]
async fn health_returns_200_ok_true() {
    let f = fixture();
    let (status, json) = f.get("/v1/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["ok"], true);
    assert_eq!(json["service"], "ptx-daemon");
}

#[tokio::test]
async fn status_reports_mode_custody_and_active_phase() {
    let f = fixture();
    let (status, json) = f.get("/v1/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["mode"], "PAPER");
    assert_eq!(json["custody_account"], CUSTODY);
    assert_eq!(json["active_phase"], Value::Null);

    f.store.upsert_phase(phase("P1", 1, Decimal::ONE, 1_000));
    let (status, _) = f.post("/v1/phases/advance", Some("operator"), json!({})).await;
    assert_eq!(status, StatusCode::OK);

    let (_, json) = f.get("/v1/status", None).await;
    assert_eq!(json["active_phase"], "P1");
}

// ---------------------------------------------------------------------------
// Orders
// ---------------------------------------------------------------------------

#[tokio::test]
async fn order_routes_require_a_caller_identity() {
    let f = fixture();
    let offer_id = f.native_offer(TradeSide::SellAsset);
    let (status, json) = f
        .post(
            "/v1/orders",
            None,
            json!({"offer_id": offer_id, "taker_account": TAKER_ACCOUNT, "amount": {"leg": "fiat", "value": "10"}}),
        )
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(json["code"], "UNAUTHENTICATED");
}

#[tokio::test]
async fn native_order_walks_to_released_over_http() {
    let f = fixture();
    let mut rx = f.state.bus.subscribe();
    f.ledger
        .mint(AssetRef::Native, MAKER_ACCOUNT, MinorUnits::from_units(1_000));
    let offer_id = f.native_offer(TradeSide::SellAsset);

    let (status, order) = f.create_order(offer_id, "100").await;
    assert_eq!(status, StatusCode::CREATED, "{order}");
    assert_eq!(order["status"], "AWAITING_ESCROW");
    let id = order["id"].as_str().unwrap().to_string();

    let (status, order) = f
        .post(
            &format!("/v1/orders/{id}/escrow"),
            Some(MAKER),
            json!({"mode": "direct"}),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{order}");
    assert_eq!(order["status"], "AWAITING_FIAT_PAYMENT");

    let (_, balance) = f.get("/v1/custody/balance?asset=NATIVE", None).await;
    assert_eq!(balance["account"], CUSTODY);
    assert_eq!(balance["balance"], minor(100));

    let (status, order) = f
        .post(
            &format!("/v1/orders/{id}/paid"),
            Some(TAKER),
            json!({"proof_refs": ["bank-ref-1"]}),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{order}");
    assert_eq!(order["status"], "AWAITING_CONFIRMATION");

    let (status, order) = f
        .post(&format!("/v1/orders/{id}/received"), Some(MAKER), json!({}))
        .await;
    assert_eq!(status, StatusCode::OK, "{order}");
    assert_eq!(order["status"], "RELEASED");
    assert!(order["released_tx_ref"].is_string());
    assert_eq!(
        f.ledger.balance_of(AssetRef::Native, TAKER_ACCOUNT),
        MinorUnits::from_units(100)
    );

    let (status, events) = f
        .get(&format!("/v1/orders/{id}/events"), Some(TAKER))
        .await;
    assert_eq!(status, StatusCode::OK);
    let kinds: Vec<&str> = events
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["kind"].as_str().unwrap())
        .collect();
    assert_eq!(
        kinds,
        vec!["CREATED", "ESCROW_CONFIRMED", "PAID_MARKED", "RELEASED"]
    );

    let mut announced = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        if let BusMsg::Order { kind, .. } = msg {
            announced.push(kind);
        }
    }
    assert_eq!(announced, kinds);

    let (status, review) = f
        .post(
            &format!("/v1/orders/{id}/review"),
            Some(TAKER),
            json!({"stars": 5, "comment": "quick"}),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "{review}");
    assert_eq!(review["target_id"], MAKER);
}

#[tokio::test]
async fn domain_errors_map_to_status_and_code() {
    let f = fixture();
    let offer_id = f.native_offer(TradeSide::SellAsset);
    let (_, order) = f.create_order(offer_id, "10").await;
    let id = order["id"].as_str().unwrap().to_string();

    let (status, json) = f
        .post(&format!("/v1/orders/{id}/paid"), Some(TAKER), json!({}))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json["code"], "ESCROW_PENDING");

    let (status, json) = f.get(&format!("/v1/orders/{id}"), Some("mallory")).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(json["code"], "FORBIDDEN");

    let (status, json) = f
        .get(&format!("/v1/orders/{}", Uuid::new_v4()), Some(TAKER))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["code"], "NOT_FOUND");

    let (status, json) = f
        .post(
            &format!("/v1/orders/{id}/dispute"),
            Some(TAKER),
            json!({"reason": "  "}),
        )
        .await;
    // Disputes need escrow first; the state check comes before the reason.
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json["code"], "INVALID_STATE");

    let (status, json) = f.create_order(offer_id, "10000000").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["code"], "VALIDATION");

    let (status, order) = f
        .post(&format!("/v1/orders/{id}/cancel"), Some(MAKER), json!({}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(order["status"], "CANCELLED");
}

// ---------------------------------------------------------------------------
// Phases / reconcile
// ---------------------------------------------------------------------------

#[tokio::test]
async fn phase_routes_show_and_advance() {
    let f = fixture();
    let (status, json) = f.get("/v1/phases/active", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["active"], Value::Null);

    let (status, json) = f.post("/v1/phases/advance", Some("operator"), json!({})).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json["code"], "NO_NEXT_PHASE");

    f.store.upsert_phase(phase("P1", 1, Decimal::new(5, 1), 1_000));
    f.store.upsert_phase(phase("P2", 2, Decimal::ONE, 1_000));

    let (status, json) = f.post("/v1/phases/advance", Some("operator"), json!({})).await;
    assert_eq!(status, StatusCode::OK, "{json}");
    assert_eq!(json["label"], "P1");

    let (_, json) = f.get("/v1/phases/active", None).await;
    assert_eq!(json["active"]["label"], "P1");
    assert_eq!(json["active"]["remaining"], minor(1_000));

    let (_, json) = f.get("/v1/phases", None).await;
    assert_eq!(json.as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn reputation_reconcile_runs_a_dry_pass() {
    let f = fixture();
    let (status, json) = f
        .post("/v1/reconcile/reputation?dry_run=true", None, json!({}))
        .await;
    assert_eq!(status, StatusCode::OK, "{json}");
    assert_eq!(json["processed"], 0);
    assert_eq!(f.ledger.submission_count(), 0);
}

// ---------------------------------------------------------------------------
// Treasury requests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn treasury_requests_are_created_and_read_back() {
    let f = fixture();
    let (status, json) = f
        .post(
            "/v1/treasury/requests",
            Some("5Grantee"),
            json!({"title": "Audit", "beneficiary": "5Grantee", "amount": minor(50), "content_hash": "0xabc"}),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "{json}");
    assert_eq!(json["status"], "SUBMITTED");
    let id = json["id"].as_str().unwrap().to_string();

    let (status, json) = f.get(&format!("/v1/treasury/requests/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["amount"], minor(50));

    let (status, json) = f
        .get(&format!("/v1/treasury/requests/{}", Uuid::new_v4()), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["code"], "NOT_FOUND");

    let (status, json) = f
        .post(
            "/v1/treasury/requests",
            Some("5Grantee"),
            json!({"title": " ", "beneficiary": "5Grantee", "amount": "1", "content_hash": "0xabc"}),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["code"], "VALIDATION");
}
