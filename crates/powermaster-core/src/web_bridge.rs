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

use bevy_ecs::prelude::Resource;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use powermaster_types::inverter::{OperatingMode, Telemetry};
use powermaster_types::plan::Plan;
use powermaster_types::tariff::TariffPoint;

use crate::accounting::AccountingSummary;
use crate::arbitrator::DecisionSource;

// ============= Query Types =============

/// Queries the dashboard can ask the ECS world.
#[derive(Debug, Clone, Copy)]
pub enum QueryType {
    Mode,
    ActivePlan,
    AccountingSummary,
    ProvidersStatus,
    EventSnapshot,
}

/// Current mode picture for `GET /api/mode`.
#[derive(Debug, Clone, Serialize)]
pub struct ModeStatus {
    pub user_mode: Option<OperatingMode>,
    pub override_active: bool,
    pub override_remaining_s: i64,
    /// Mode the active plan wants right now
    pub optimiser_mode: Option<OperatingMode>,
    /// Mode actually applied at the inverter
    pub applied_mode: Option<OperatingMode>,
    pub source: Option<DecisionSource>,
    pub mode_name: String,
    pub rationale: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanView {
    pub built_at: DateTime<Utc>,
    pub status: String,
    pub trigger: String,
    pub objective_cents: f64,
    pub solver_time_ms: u64,
    pub slots: Vec<powermaster_types::plan::PlanSlot>,
}

impl From<&Plan> for PlanView {
    fn from(plan: &Plan) -> Self {
        Self {
            built_at: plan.built_at,
            status: format!("{:?}", plan.status).to_lowercase(),
            trigger: plan.trigger.clone(),
            objective_cents: plan.objective_cents,
            solver_time_ms: plan.solver_time_ms,
            slots: plan.slots.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderStatusView {
    pub name: String,
    pub healthy: bool,
    pub configured: bool,
    pub data_age_seconds: Option<i64>,
    pub consecutive_failures: u32,
    pub last_error: String,
}

/// Combined live snapshot for the SSE stream.
#[derive(Debug, Clone, Serialize)]
pub struct EventSnapshot {
    pub at: DateTime<Utc>,
    pub telemetry: Option<Telemetry>,
    pub price: Option<TariffPoint>,
    pub spike_active: bool,
    pub mode: ModeStatus,
    pub wacb_c: f64,
    pub today_net_cost_cents: f64,
    pub resilience_level: String,
}

#[derive(Debug)]
pub enum WebQueryResponse {
    Mode(ModeStatus),
    ActivePlan(Option<PlanView>),
    AccountingSummary(AccountingSummary),
    ProvidersStatus(Vec<ProviderStatusView>),
    EventSnapshot(Box<EventSnapshot>),
}

/// One query from an axum handler to the ECS world.
pub struct WebQueryRequest {
    pub query: QueryType,
    pub respond: oneshot::Sender<WebQueryResponse>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryError {
    ChannelClosed,
    ResponseDropped,
}

impl std::fmt::Display for QueryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryError::ChannelClosed => write!(f, "web query channel closed"),
            QueryError::ResponseDropped => write!(f, "web query response dropped"),
        }
    }
}

impl std::error::Error for QueryError {}

/// Channel the ECS side drains each frame.
#[derive(Resource)]
pub struct WebQueryChannel {
    pub receiver: mpsc::UnboundedReceiver<WebQueryRequest>,
}

/// Clonable sender handed to the web server.
#[derive(Clone)]
pub struct WebQuerySender {
    sender: mpsc::UnboundedSender<WebQueryRequest>,
}

impl std::fmt::Debug for WebQuerySender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebQuerySender").finish_non_exhaustive()
    }
}

impl WebQuerySender {
    pub fn new() -> (Self, WebQueryChannel) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, WebQueryChannel { receiver })
    }

    pub async fn query(&self, query: QueryType) -> Result<WebQueryResponse, QueryError> {
        let (respond, response) = oneshot::channel();
        self.sender
            .send(WebQueryRequest { query, respond })
            .map_err(|_| QueryError::ChannelClosed)?;
        response.await.map_err(|_| QueryError::ResponseDropped)
    }
}

// ============= Command Intents =============

/// Dashboard writes funnel through this channel and are consumed by the
/// tick task at the next tick boundary.
#[derive(Debug, Clone)]
pub enum CommandIntent {
    SetOverride {
        mode: OperatingMode,
        power_w: Option<u32>,
        timeout_s: u64,
    },
    ClearOverride,
}

#[derive(Resource)]
pub struct CommandIntentChannel {
    pub receiver: mpsc::UnboundedReceiver<CommandIntent>,
}

#[derive(Clone)]
pub struct CommandIntentSender {
    sender: mpsc::UnboundedSender<CommandIntent>,
}

impl std::fmt::Debug for CommandIntentSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandIntentSender").finish_non_exhaustive()
    }
}

impl CommandIntentSender {
    pub fn new() -> (Self, CommandIntentChannel) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, CommandIntentChannel { receiver })
    }

    pub fn send(&self, intent: CommandIntent) -> Result<(), QueryError> {
        self.sender.send(intent).map_err(|_| QueryError::ChannelClosed)
    }
}
