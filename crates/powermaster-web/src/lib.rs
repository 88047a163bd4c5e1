// Copyright (c) 2025 SOLARE S.R.O.
//
// This file is part of Power Master.
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// (CC BY-NC-ND 4.0). You may use and share this file for non-commercial purposes only and you may not
// create derivatives. See <https://creativecommons.org/licenses/by-nc-nd/4.0/>.
//
// This software is provided "AS IS", without warranty of any kind.
//
// For commercial licensing, please contact: info@solare.cz

//! Dashboard JSON API. Read-only apart from the mode endpoint, whose
//! writes travel over the command-intent channel and take effect at the
//! next control tick.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{
        sse::{Event, Sse},
        IntoResponse,
    },
    routing::get,
    Json, Router,
};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::{wrappers::IntervalStream, StreamExt};
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use powermaster_core::{
    CommandIntent, CommandIntentSender, QueryType, WebQueryResponse, WebQuerySender,
};
use powermaster_db::Database;
use powermaster_types::inverter::OperatingMode;

/// Shared state for the handlers.
#[derive(Clone)]
pub struct AppState {
    pub query_sender: WebQuerySender,
    pub intent_sender: CommandIntentSender,
    pub db: Arc<Database>,
    pub sse_interval_ms: u64,
}

/// Start the dashboard server. Blocks until the listener fails.
pub async fn start_web_server(
    state: AppState,
    host: String,
    port: u16,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let app = router(state);
    let addr = format!("{host}:{port}");
    info!(addr = %addr, "starting dashboard server");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/telemetry/history", get(telemetry_history_handler))
        .route("/api/prices/history", get(prices_history_handler))
        .route("/api/plan/active", get(active_plan_handler))
        .route("/api/mode", get(mode_handler).post(set_mode_handler))
        .route("/api/accounting/summary", get(accounting_handler))
        .route("/api/providers/status", get(providers_handler))
        .route("/api/events", get(events_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
struct HistoryParams {
    #[serde(default = "default_history_hours")]
    hours: i64,
}

fn default_history_hours() -> i64 {
    24
}

async fn telemetry_history_handler(
    State(state): State<AppState>,
    Query(params): Query<HistoryParams>,
) -> impl IntoResponse {
    let hours = params.hours.clamp(1, 24 * 14);
    let now = Utc::now();
    let from = now - Duration::hours(hours);
    // Raw 5-second samples beyond two days are pointless on a chart
    let result = if hours > 48 {
        state.db.query_telemetry_bucketed(from, now, 300)
    } else {
        state.db.query_telemetry(from, now)
    };
    match result {
        Ok(rows) => Json(rows).into_response(),
        Err(e) => {
            error!(error = %e, "telemetry history query failed");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

async fn prices_history_handler(
    State(state): State<AppState>,
    Query(params): Query<HistoryParams>,
) -> impl IntoResponse {
    let hours = params.hours.clamp(1, 24 * 14);
    let now = Utc::now();
    // History plus the forward forecast already ingested
    match state
        .db
        .query_prices(now - Duration::hours(hours), now + Duration::hours(48))
    {
        Ok(rows) => Json(rows).into_response(),
        Err(e) => {
            error!(error = %e, "price history query failed");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

async fn active_plan_handler(State(state): State<AppState>) -> impl IntoResponse {
    match state.query_sender.query(QueryType::ActivePlan).await {
        Ok(WebQueryResponse::ActivePlan(Some(plan))) => Json(plan).into_response(),
        Ok(WebQueryResponse::ActivePlan(None)) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "status": "no_active_plan" })),
        )
            .into_response(),
        Ok(_) => (StatusCode::INTERNAL_SERVER_ERROR, "unexpected response").into_response(),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    }
}

async fn mode_handler(State(state): State<AppState>) -> impl IntoResponse {
    match state.query_sender.query(QueryType::Mode).await {
        Ok(WebQueryResponse::Mode(mode)) => Json(mode).into_response(),
        Ok(_) => (StatusCode::INTERNAL_SERVER_ERROR, "unexpected response").into_response(),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct SetModeBody {
    /// Operating mode name, or "auto" to return control to the optimiser
    mode: String,
    power_w: Option<u32>,
    #[serde(default = "default_override_timeout")]
    timeout_s: u64,
}

fn default_override_timeout() -> u64 {
    4 * 3600
}

#[derive(Debug, Serialize)]
struct SetModeResponse {
    status: &'static str,
}

async fn set_mode_handler(
    State(state): State<AppState>,
    Json(body): Json<SetModeBody>,
) -> impl IntoResponse {
    let intent = if body.mode.eq_ignore_ascii_case("auto") {
        CommandIntent::ClearOverride
    } else {
        match body.mode.parse::<OperatingMode>() {
            Ok(mode) => CommandIntent::SetOverride {
                mode,
                power_w: body.power_w,
                timeout_s: body.timeout_s.clamp(60, 24 * 3600),
            },
            Err(e) => {
                return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
            }
        }
    };

    match state.intent_sender.send(intent) {
        Ok(()) => Json(SetModeResponse { status: "accepted" }).into_response(),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    }
}

async fn accounting_handler(State(state): State<AppState>) -> impl IntoResponse {
    let summary = match state.query_sender.query(QueryType::AccountingSummary).await {
        Ok(WebQueryResponse::AccountingSummary(summary)) => summary,
        Ok(_) => {
            return (StatusCode::INTERNAL_SERVER_ERROR, "unexpected response").into_response()
        }
        Err(e) => return (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    };

    let now = Utc::now();
    let daily = state
        .db
        .daily_summaries(now - Duration::days(14), now)
        .unwrap_or_default();

    Json(serde_json::json!({
        "current": summary,
        "daily": daily,
    }))
    .into_response()
}

async fn providers_handler(State(state): State<AppState>) -> impl IntoResponse {
    match state.query_sender.query(QueryType::ProvidersStatus).await {
        Ok(WebQueryResponse::ProvidersStatus(providers)) => Json(providers).into_response(),
        Ok(_) => (StatusCode::INTERNAL_SERVER_ERROR, "unexpected response").into_response(),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    }
}

/// Server-sent events: one combined snapshot per interval.
async fn events_handler(
    State(state): State<AppState>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let interval = tokio::time::interval(std::time::Duration::from_millis(
        state.sse_interval_ms.clamp(200, 5_000),
    ));
    let stream = IntervalStream::new(interval).then(move |_| {
        let state = state.clone();
        async move {
            let event = match state.query_sender.query(QueryType::EventSnapshot).await {
                Ok(WebQueryResponse::EventSnapshot(snapshot)) => {
                    let data = serde_json::to_string(&snapshot)
                        .unwrap_or_else(|e| format!("{{\"error\":\"{e}\"}}"));
                    Event::default().event("snapshot").data(data)
                }
                Ok(_) => Event::default().event("error").data("unexpected response"),
                Err(e) => Event::default().event("error").data(e.to_string()),
            };
            Ok::<_, Infallible>(event)
        }
    });
    Sse::new(stream)
}
