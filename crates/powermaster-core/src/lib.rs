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

pub mod accounting;
pub mod anti_oscillation;
pub mod arbitrator;
pub mod async_runtime;
pub mod async_systems;
pub mod control;
pub mod forecast;
pub mod history;
pub mod loads;
pub mod planner;
pub mod providers;
pub mod rebuild;
pub mod resilience;
pub mod resources;
pub mod storm;
pub mod tariff;
pub mod traits;
pub mod web_bridge;

use bevy_app::prelude::*;
use bevy_ecs::schedule::IntoScheduleConfigs;

// Re-export the working set for the binary and the web crate
pub use accounting::{AccountingEngine, AccountingSummary, TickEnergy};
pub use anti_oscillation::{AntiOscillationGuard, AppliedCommand, GuardVerdict};
pub use arbitrator::{decide, ArbitratorInputs, Decision, DecisionSource};
pub use async_runtime::AsyncRuntime;
pub use forecast::ForecastAggregator;
pub use history::LoadHistory;
pub use loads::{LoadConditions, LoadDecision, LoadScheduler};
pub use planner::{GoodLpSolver, PlannerRequest, SolveStatus, Solver};
pub use rebuild::{RebuildEvaluator, RebuildInputs};
pub use resilience::{HealthChecker, ResilienceLevel};
pub use resources::*;
pub use storm::StormMonitor;
pub use tariff::{SpikeDetector, TariffSeries};
pub use web_bridge::{
    CommandIntent, CommandIntentChannel, CommandIntentSender, EventSnapshot, ModeStatus, PlanView,
    ProviderStatusView, QueryError, QueryType, WebQueryChannel, WebQueryResponse, WebQuerySender,
};

/// Core plugin: spawns the worker tasks on startup and runs the
/// channel-draining and control systems every frame. The control tick
/// gates itself on its own interval; the app loop just has to keep
/// calling Update.
pub struct PowerMasterCorePlugin;

impl Plugin for PowerMasterCorePlugin {
    fn build(&self, app: &mut App) {
        app.add_systems(Startup, async_systems::setup_async_workers)
            .add_systems(
                Update,
                (
                    async_systems::poll_shutdown_system,
                    async_systems::poll_telemetry_system,
                    async_systems::poll_provider_channels_system,
                    async_systems::poll_planner_results_system,
                    async_systems::poll_command_outcomes_system,
                    async_systems::poll_load_faults_system,
                    async_systems::poll_intents_system,
                    control::tick_system,
                    control::web_query_system,
                    control::maintenance_system,
                    control::shutdown_system,
                )
                    .chain(),
            );
    }
}
