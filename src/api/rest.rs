// =============================================================================
// REST API Endpoints: Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. Health is public; everything else
// requires a valid Bearer token via the `AuthBearer` extractor.
//
// Rules registered here carry `origin = external`: if the ownership registry
// is unreachable the engine will not act on them. A deleted rule releases its
// position: the monitor leaves it alone until it closes or is registered
// again. Rule changes are saved to disk before the response is sent.
//
// CORS is permissive; tighten it when exposing the API beyond localhost.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use crate::api::auth::AuthBearer;
use crate::app_state::EngineState;
use crate::exit::journal::{DecisionKind, DecisionRecord, DecisionSink};
use crate::exit::rule::{ExitRule, RuleOrigin};
use crate::types::{Direction, MonitorMode, PositionId};

/// Default number of decisions returned by `/decisions`.
const DEFAULT_DECISION_LIMIT: usize = 50;

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(state: Arc<EngineState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        // ── Authenticated ───────────────────────────────────────────
        .route("/api/v1/rules", get(list_rules).post(register_rule))
        .route("/api/v1/rules/:id", get(get_rule).delete(delete_rule))
        .route("/api/v1/decisions", get(decisions))
        .route("/api/v1/breakers", get(breakers))
        .route("/api/v1/control/pause", post(control_pause))
        .route("/api/v1/control/resume", post(control_resume))
        // ── Demo mode (paper broker) ────────────────────────────────
        .route("/api/v1/paper/positions", post(paper_open_position))
        .route("/api/v1/paper/price", post(paper_price))
        // ── Middleware & State ──────────────────────────────────────
        .layer(cors)
        .with_state(state)
}

fn error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

/// Save the rule set after an API mutation. A failure is logged; the change
/// stays in memory and is written by the monitor's next save.
fn persist_rules(state: &EngineState) {
    if let Err(e) = state.store.save(&state.config.rules_path) {
        error!(
            path = %state.config.rules_path,
            error = %format!("{e:#}"),
            "failed to save exit rules after API change"
        );
    }
}

// =============================================================================
// Health (public)
// =============================================================================

async fn health(State(state): State<Arc<EngineState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "server_time": chrono::Utc::now().timestamp_millis(),
        "engine": state.build_snapshot(),
    }))
}

// =============================================================================
// Rules (authenticated)
// =============================================================================

async fn list_rules(_auth: AuthBearer, State(state): State<Arc<EngineState>>) -> impl IntoResponse {
    Json(state.store.snapshot())
}

async fn get_rule(
    _auth: AuthBearer,
    State(state): State<Arc<EngineState>>,
    Path(id): Path<PositionId>,
) -> Response {
    match state.store.get(id) {
        Some(rule) => Json(rule).into_response(),
        None => error(StatusCode::NOT_FOUND, format!("no rule for position {id}")),
    }
}

/// Body of `POST /api/v1/rules`. Thresholds default to the engine config.
#[derive(Debug, Deserialize)]
struct RegisterRuleRequest {
    position_id: PositionId,
    symbol: String,
    direction: Direction,
    entry_price: f64,
    initial_stop: f64,
    initial_target: f64,
    #[serde(default)]
    breakeven_threshold_pct: Option<f64>,
    #[serde(default)]
    partial_threshold_pct: Option<f64>,
    #[serde(default)]
    partial_close_fraction: Option<f64>,
}

async fn register_rule(
    _auth: AuthBearer,
    State(state): State<Arc<EngineState>>,
    Json(req): Json<RegisterRuleRequest>,
) -> Response {
    let mut thresholds = state.config.thresholds;
    if let Some(v) = req.breakeven_threshold_pct {
        thresholds.breakeven_threshold_pct = v;
    }
    if let Some(v) = req.partial_threshold_pct {
        thresholds.partial_threshold_pct = v;
    }
    if let Some(v) = req.partial_close_fraction {
        thresholds.partial_close_fraction = v;
    }

    let rule = match ExitRule::new(
        req.position_id,
        req.symbol,
        req.direction,
        req.entry_price,
        req.initial_stop,
        req.initial_target,
        thresholds,
        RuleOrigin::External,
    )
    .validated()
    {
        Ok(rule) => rule,
        Err(reason) => return error(StatusCode::BAD_REQUEST, reason),
    };

    let id = rule.position_id;
    let symbol = rule.symbol.clone();
    if !state.store.insert_if_absent(rule.clone()) {
        return error(StatusCode::CONFLICT, format!("rule for position {id} already exists"));
    }

    state.journal.record(
        DecisionRecord::new(id, &symbol, DecisionKind::RuleCreated, "CREATED")
            .with_reason("registered via API"),
    );
    state.increment_version();
    persist_rules(&state);
    info!(position_id = id, symbol = %symbol, "exit rule registered via API");

    (StatusCode::CREATED, Json(rule)).into_response()
}

async fn delete_rule(
    _auth: AuthBearer,
    State(state): State<Arc<EngineState>>,
    Path(id): Path<PositionId>,
) -> Response {
    match state.store.release(id) {
        Some(rule) => {
            state.journal.record(
                DecisionRecord::new(id, &rule.symbol, DecisionKind::RuleRemoved, "RELEASED")
                    .with_reason("deleted via API"),
            );
            state.increment_version();
            persist_rules(&state);
            info!(position_id = id, "exit rule deleted via API");
            StatusCode::NO_CONTENT.into_response()
        }
        None => error(StatusCode::NOT_FOUND, format!("no rule for position {id}")),
    }
}

// =============================================================================
// Decisions & breakers (authenticated)
// =============================================================================

#[derive(Debug, Deserialize)]
struct DecisionQuery {
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    position_id: Option<PositionId>,
}

async fn decisions(
    _auth: AuthBearer,
    State(state): State<Arc<EngineState>>,
    Query(q): Query<DecisionQuery>,
) -> impl IntoResponse {
    let limit = q.limit.unwrap_or(DEFAULT_DECISION_LIMIT);
    let records = match q.position_id {
        Some(id) => state.journal.for_position(id).into_iter().take(limit).collect(),
        None => state.journal.recent(limit),
    };
    Json(records)
}

async fn breakers(_auth: AuthBearer, State(state): State<Arc<EngineState>>) -> impl IntoResponse {
    Json(state.breaker.snapshot())
}

// =============================================================================
// Control (authenticated)
// =============================================================================

#[derive(Serialize)]
struct ControlResponse {
    mode: MonitorMode,
    message: &'static str,
}

async fn control_pause(
    _auth: AuthBearer,
    State(state): State<Arc<EngineState>>,
) -> impl IntoResponse {
    state.control.set_mode(MonitorMode::Paused);
    state.increment_version();
    info!("exit monitor PAUSED via API");
    Json(ControlResponse {
        mode: MonitorMode::Paused,
        message: "exit monitor paused",
    })
}

async fn control_resume(
    _auth: AuthBearer,
    State(state): State<Arc<EngineState>>,
) -> impl IntoResponse {
    state.control.set_mode(MonitorMode::Active);
    state.increment_version();
    info!("exit monitor RESUMED via API");
    Json(ControlResponse {
        mode: MonitorMode::Active,
        message: "exit monitor resumed",
    })
}

// =============================================================================
// Paper broker (authenticated, demo mode only)
// =============================================================================

#[derive(Debug, Deserialize)]
struct PaperPositionRequest {
    symbol: String,
    direction: Direction,
    entry_price: f64,
    volume: f64,
    #[serde(default)]
    stop_loss: f64,
    #[serde(default)]
    take_profit: f64,
}

async fn paper_open_position(
    _auth: AuthBearer,
    State(state): State<Arc<EngineState>>,
    Json(req): Json<PaperPositionRequest>,
) -> Response {
    let Some(paper) = &state.paper else {
        return error(StatusCode::NOT_FOUND, "paper broker not enabled");
    };
    if !(req.entry_price > 0.0 && req.volume > 0.0) {
        return error(StatusCode::BAD_REQUEST, "entry_price and volume must be positive");
    }
    let id = paper.open_position(
        &req.symbol,
        req.direction,
        req.entry_price,
        req.volume,
        req.stop_loss,
        req.take_profit,
    );
    state.increment_version();
    (
        StatusCode::CREATED,
        Json(serde_json::json!({ "position_id": id })),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
struct PaperPriceRequest {
    symbol: String,
    price: f64,
}

async fn paper_price(
    _auth: AuthBearer,
    State(state): State<Arc<EngineState>>,
    Json(req): Json<PaperPriceRequest>,
) -> Response {
    let Some(paper) = &state.paper else {
        return error(StatusCode::NOT_FOUND, "paper broker not enabled");
    };
    if !(req.price.is_finite() && req.price > 0.0) {
        return error(StatusCode::BAD_REQUEST, "price must be positive");
    }
    paper.update_price(&req.symbol, req.price);
    Json(serde_json::json!({ "symbol": req.symbol, "price": req.price })).into_response()
}

// =============================================================================
// Tests
// =============================================================================
