//! Axum router and HTTP handlers for ptx-daemon.
//!
//! `build_router` is the single entry point; `main.rs` attaches middleware
//! after it so tests can drive the bare router. The upstream gateway
//! authenticates users and forwards the identity in `x-caller-id`.

use std::{convert::Infallible, sync::Arc};

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use futures_util::{Stream, StreamExt};
use ptx_audit::OrderEventRecord;
use ptx_escrow::EscrowFunding;
use ptx_orders::{CreateOrder, OrderError};
use ptx_phase::PhaseError;
use ptx_reconcile::governance::{RequestStatus, TreasuryRequest};
use ptx_reconcile::ReconcileError;
use ptx_schemas::{Order, PhaseConfig, Review};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    api_types::{
        ActivePhaseResponse, CreateTreasuryRequest, CustodyBalanceQuery, CustodyBalanceResponse,
        DisputeRequest, ErrorResponse, HealthResponse, MarkPaidRequest, ReconcileQuery,
        ReviewRequest,
    },
    state::{uptime_secs, AppState, BusMsg},
};

pub const CALLER_HEADER: &str = "x-caller-id";

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/status", get(status_handler))
        .route("/v1/stream", get(stream))
        .route("/v1/orders", post(create_order))
        .route("/v1/orders/:id", get(get_order))
        .route("/v1/orders/:id/events", get(get_order_events))
        .route("/v1/orders/:id/escrow", post(confirm_escrow))
        .route("/v1/orders/:id/paid", post(mark_paid))
        .route("/v1/orders/:id/received", post(confirm_received))
        .route("/v1/orders/:id/cancel", post(cancel_order))
        .route("/v1/orders/:id/dispute", post(open_dispute))
        .route("/v1/orders/:id/review", post(submit_review))
        .route("/v1/phases", get(list_phases))
        .route("/v1/phases/active", get(active_phase))
        .route("/v1/phases/advance", post(advance_phase))
        .route("/v1/custody/balance", get(custody_balance))
        .route("/v1/reconcile/reputation", post(reconcile_reputation))
        .route("/v1/treasury/requests", post(create_treasury_request))
        .route("/v1/treasury/requests/:id", get(get_treasury_request))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Domain error rendered as `{error, code}` with a status picked from `code`.
#[derive(Debug)]
pub(crate) struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "VALIDATION", message)
    }
}

/// HTTP status for a stable error code.
pub fn status_for_code(code: &str) -> StatusCode {
    match code {
        "VALIDATION" => StatusCode::BAD_REQUEST,
        "UNAUTHENTICATED" => StatusCode::UNAUTHORIZED,
        "FORBIDDEN" => StatusCode::FORBIDDEN,
        "NOT_FOUND" => StatusCode::NOT_FOUND,
        "INVALID_STATE" | "ESCROW_PENDING" | "BUSY" | "NO_ESCROW_RECORDED" | "PHASE_INACTIVE"
        | "INSUFFICIENT_SUPPLY" | "NO_NEXT_PHASE" => StatusCode::CONFLICT,
        "ESCROW" => StatusCode::UNPROCESSABLE_ENTITY,
        "LEDGER" => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<OrderError> for ApiError {
    fn from(e: OrderError) -> Self {
        let code = e.code();
        Self::new(status_for_code(code), code, e.to_string())
    }
}

impl From<PhaseError> for ApiError {
    fn from(e: PhaseError) -> Self {
        OrderError::Phase(e).into()
    }
}

impl From<ptx_escrow::EscrowError> for ApiError {
    fn from(e: ptx_escrow::EscrowError) -> Self {
        OrderError::Escrow(e).into()
    }
}

impl From<ReconcileError> for ApiError {
    fn from(e: ReconcileError) -> Self {
        let code = match &e {
            ReconcileError::Ledger(_) => "LEDGER",
            ReconcileError::Store(_) => "STORE",
        };
        Self::new(status_for_code(code), code, e.to_string())
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "STORE", format!("{e:#}"))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            warn!(code = self.code, error = %self.message, "request failed");
        }
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
                code: self.code.to_string(),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn caller_of(headers: &HeaderMap) -> ApiResult<String> {
    headers
        .get(CALLER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            ApiError::new(
                StatusCode::UNAUTHORIZED,
                "UNAUTHENTICATED",
                format!("missing {CALLER_HEADER} header"),
            )
        })
}

/// Announce a transition and hand the order back.
fn announce(st: &AppState, order: Order, kind: &str) -> Json<Order> {
    st.publish_order(order.id, order.status, kind);
    Json(order)
}

// ---------------------------------------------------------------------------
// GET /v1/health, /v1/status, /v1/stream
// ---------------------------------------------------------------------------

pub(crate) async fn health(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            ok: true,
            service: st.build.service,
            version: st.build.version,
        }),
    )
}

pub(crate) async fn status_handler(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    let active = match st.services.phases.get_active_phase().await {
        Ok(p) => p.map(|p| p.label),
        Err(e) => {
            warn!(error = %e, "status: active phase unavailable");
            None
        }
    };

    let snap = {
        let mut s = st.status.write().await;
        s.daemon_uptime_secs = uptime_secs();
        s.active_phase = active;
        s.clone()
    };

    let _ = st.bus.send(BusMsg::Status(snap.clone()));
    (StatusCode::OK, Json(snap))
}

pub(crate) async fn stream(State(st): State<Arc<AppState>>) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert("Cache-Control", HeaderValue::from_static("no-cache"));
    headers.insert("Connection", HeaderValue::from_static("keep-alive"));

    let rx = st.bus.subscribe();
    let events = broadcast_to_sse(rx);

    (headers, Sse::new(events).keep_alive(KeepAlive::new())).into_response()
}

fn broadcast_to_sse(
    rx: broadcast::Receiver<BusMsg>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    BroadcastStream::new(rx).filter_map(|msg| async move {
        match msg {
            Ok(m) => {
                let data = serde_json::to_string(&m).ok()?;
                Some(Ok(Event::default().event(m.event_name()).data(data)))
            }
            Err(_) => None, // lagged / closed
        }
    })
}

// ---------------------------------------------------------------------------
// Orders
// ---------------------------------------------------------------------------

pub(crate) async fn create_order(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CreateOrder>,
) -> ApiResult<(StatusCode, Json<Order>)> {
    let caller = caller_of(&headers)?;
    let order = st.services.orders.create_order(&caller, req).await?;
    Ok((StatusCode::CREATED, announce(&st, order, "CREATED")))
}

pub(crate) async fn get_order(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Order>> {
    let caller = caller_of(&headers)?;
    Ok(Json(st.services.orders.get_order(id, &caller).await?))
}

pub(crate) async fn get_order_events(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Vec<OrderEventRecord>>> {
    let caller = caller_of(&headers)?;
    Ok(Json(st.services.orders.get_order_events(id, &caller).await?))
}

pub(crate) async fn confirm_escrow(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(funding): Json<EscrowFunding>,
) -> ApiResult<Json<Order>> {
    let caller = caller_of(&headers)?;
    let order = st
        .services
        .orders
        .confirm_escrow(id, &caller, funding)
        .await?;
    Ok(announce(&st, order, "ESCROW_CONFIRMED"))
}

pub(crate) async fn mark_paid(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    body: Option<Json<MarkPaidRequest>>,
) -> ApiResult<Json<Order>> {
    let caller = caller_of(&headers)?;
    let proof_refs = body.map(|Json(b)| b.proof_refs).unwrap_or_default();
    let order = st
        .services
        .orders
        .mark_paid(id, &caller, proof_refs)
        .await?;
    Ok(announce(&st, order, "PAID_MARKED"))
}

pub(crate) async fn confirm_received(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Order>> {
    let caller = caller_of(&headers)?;
    let order = st.services.orders.confirm_received(id, &caller).await?;
    Ok(announce(&st, order, "RELEASED"))
}

pub(crate) async fn cancel_order(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Order>> {
    let caller = caller_of(&headers)?;
    let order = st.services.orders.cancel_order(id, &caller).await?;
    Ok(announce(&st, order, "CANCELLED"))
}

pub(crate) async fn open_dispute(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(req): Json<DisputeRequest>,
) -> ApiResult<Json<Order>> {
    let caller = caller_of(&headers)?;
    let order = st
        .services
        .orders
        .open_dispute(id, &caller, &req.reason)
        .await?;
    st.publish_log("WARN", format!("dispute opened on order {id}"));
    Ok(announce(&st, order, "DISPUTE_OPENED"))
}

pub(crate) async fn submit_review(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(req): Json<ReviewRequest>,
) -> ApiResult<(StatusCode, Json<Review>)> {
    let caller = caller_of(&headers)?;
    let review = st
        .services
        .orders
        .submit_review(id, &caller, req.stars, req.comment)
        .await?;
    Ok((StatusCode::CREATED, Json(review)))
}

// ---------------------------------------------------------------------------
// Phases
// ---------------------------------------------------------------------------

pub(crate) async fn list_phases(
    State(st): State<Arc<AppState>>,
) -> ApiResult<Json<Vec<PhaseConfig>>> {
    Ok(Json(st.services.phases.phases().await?))
}

pub(crate) async fn active_phase(
    State(st): State<Arc<AppState>>,
) -> ApiResult<Json<ActivePhaseResponse>> {
    let active = st.services.phases.get_active_phase().await?;
    Ok(Json(ActivePhaseResponse { active }))
}

/// Operator action: close the active phase and open the next one.
pub(crate) async fn advance_phase(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Json<PhaseConfig>> {
    let caller = caller_of(&headers)?;
    let next = st.services.phases.advance_phase().await?;
    info!(by = %caller, phase = %next.label, "phase advanced");
    st.publish_log("INFO", format!("phase advanced to {}", next.label));
    Ok(Json(next))
}

// ---------------------------------------------------------------------------
// Custody / reconcile
// ---------------------------------------------------------------------------

pub(crate) async fn custody_balance(
    State(st): State<Arc<AppState>>,
    Query(q): Query<CustodyBalanceQuery>,
) -> ApiResult<Json<CustodyBalanceResponse>> {
    let balance = st.services.escrow.custody_balance(q.asset).await?;
    Ok(Json(CustodyBalanceResponse {
        asset: q.asset,
        account: st.services.escrow.custody_account().to_string(),
        balance,
    }))
}

pub(crate) async fn reconcile_reputation(
    State(st): State<Arc<AppState>>,
    Query(q): Query<ReconcileQuery>,
) -> ApiResult<Json<ptx_reconcile::ReputationReport>> {
    let report = st.services.reputation.run_pass(q.dry_run).await?;
    info!(
        dry_run = q.dry_run,
        processed = report.processed,
        updated = report.updated,
        errors = report.errors,
        "reputation reconcile requested"
    );
    Ok(Json(report))
}

// ---------------------------------------------------------------------------
// Treasury requests
// ---------------------------------------------------------------------------

pub(crate) async fn create_treasury_request(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CreateTreasuryRequest>,
) -> ApiResult<(StatusCode, Json<TreasuryRequest>)> {
    let caller = caller_of(&headers)?;
    let title = req.title.trim();
    let beneficiary = req.beneficiary.trim();
    let content_hash = req.content_hash.trim();
    if title.is_empty() || beneficiary.is_empty() || content_hash.is_empty() {
        return Err(ApiError::bad_request(
            "title, beneficiary and content_hash are required",
        ));
    }
    if req.amount.is_zero() {
        return Err(ApiError::bad_request("amount must be positive"));
    }

    let now = Utc::now();
    let request = TreasuryRequest {
        id: Uuid::new_v4(),
        title: title.to_string(),
        beneficiary: beneficiary.to_string(),
        amount: req.amount,
        content_hash: content_hash.to_string(),
        status: RequestStatus::Submitted,
        motion_hash: None,
        proposal_index: None,
        paid_tx_ref: None,
        created_at: now,
        updated_at: now,
    };
    st.services.governance_store.insert_request(&request).await?;
    info!(request_id = %request.id, by = %caller, amount = %request.amount, "treasury request submitted");
    Ok((StatusCode::CREATED, Json(request)))
}

pub(crate) async fn get_treasury_request(
    State(st): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<TreasuryRequest>> {
    st.services
        .governance_store
        .fetch_request(id)
        .await?
        .map(Json)
        .ok_or_else(|| {
            ApiError::new(
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                format!("treasury request {id} not found"),
            )
        })
}
