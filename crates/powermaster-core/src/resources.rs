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
use chrono_tz::Tz;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use powermaster_db::Database;
use powermaster_types::config::AppConfig;
use powermaster_types::inverter::{Telemetry, UserOverride};
use powermaster_types::plan::Plan;

use crate::accounting::AccountingEngine;
use crate::anti_oscillation::{AntiOscillationGuard, AppliedCommand};
use crate::arbitrator::Decision;
use crate::forecast::ForecastAggregator;
use crate::history::LoadHistory;
use crate::loads::LoadScheduler;
use crate::rebuild::RebuildEvaluator;
use crate::resilience::{HealthChecker, ResilienceLevel};
use crate::storm::StormMonitor;
use crate::tariff::{SpikeDetector, TariffSeries};
use crate::traits::{InverterAdapter, LoadDriver, SolarProvider, StormProvider, TariffProvider, WeatherProvider};

// ============= Configuration =============

/// Immutable configuration snapshot plus the resolved local timezone.
/// Each tick reads this once, so a hot reload cannot split a decision.
#[derive(Resource, Clone)]
pub struct ConfigResource {
    pub config: Arc<AppConfig>,
    pub tz: Tz,
}

impl ConfigResource {
    pub fn new(config: AppConfig) -> Self {
        let tz = config
            .accounting
            .timezone
            .parse::<Tz>()
            .unwrap_or(chrono_tz::UTC);
        Self {
            config: Arc::new(config),
            tz,
        }
    }
}

// ============= Plan Cache =============

/// Read-copy-update plan cache: rebuilds install a new immutable plan,
/// readers clone the `Arc` under a short lock.
#[derive(Resource, Clone, Default)]
pub struct PlanCache {
    active: Arc<RwLock<Option<Arc<Plan>>>>,
}

impl PlanCache {
    pub fn get(&self) -> Option<Arc<Plan>> {
        self.active.read().clone()
    }

    pub fn install(&self, plan: Plan) {
        *self.active.write() = Some(Arc::new(plan));
    }
}

// ============= Live State =============

/// Latest telemetry plus the sample the previous accounting tick used.
#[derive(Resource, Default)]
pub struct TelemetryState {
    pub latest: Option<Telemetry>,
}

#[derive(Resource)]
pub struct ForecastState {
    pub aggregator: ForecastAggregator,
    pub history: LoadHistory,
    pub snapshot: Option<powermaster_types::forecast::Forecast48h>,
}

impl ForecastState {
    pub fn new(tz: Tz) -> Self {
        Self {
            aggregator: ForecastAggregator::new(),
            history: LoadHistory::new(tz),
            snapshot: None,
        }
    }
}

#[derive(Resource)]
pub struct TariffState {
    pub series: TariffSeries,
    pub spike: SpikeDetector,
}

impl TariffState {
    pub fn new(spike_threshold_c: f64) -> Self {
        Self {
            series: TariffSeries::new(),
            spike: SpikeDetector::new(spike_threshold_c),
        }
    }
}

#[derive(Resource)]
pub struct StormResource(pub StormMonitor);

#[derive(Resource)]
pub struct HealthResource {
    pub checker: HealthChecker,
    pub level: ResilienceLevel,
}

impl HealthResource {
    pub fn new(max_consecutive_failures: u32) -> Self {
        let mut checker = HealthChecker::new(max_consecutive_failures);
        for source in ["inverter", "solar", "weather", "storm", "tariff"] {
            checker.register(source);
        }
        Self {
            checker,
            level: ResilienceLevel::Normal,
        }
    }

    pub fn refresh_level(&mut self) {
        self.level = crate::resilience::determine_level(&self.checker.unhealthy());
    }
}

/// User override state; `just_expired` is true only on the tick that
/// observed the expiry, which feeds the rebuild evaluator.
#[derive(Resource, Default)]
pub struct OverrideState {
    pub current: Option<UserOverride>,
    pub just_expired: bool,
}

impl OverrideState {
    /// Refresh for this tick; drops an expired override and reports it.
    pub fn tick(&mut self, now: DateTime<Utc>) {
        self.just_expired = false;
        if let Some(current) = &self.current {
            if !current.is_active(now) {
                self.current = None;
                self.just_expired = true;
            }
        }
    }
}

#[derive(Resource)]
pub struct AccountingResource(pub AccountingEngine);

#[derive(Resource)]
pub struct LoadSchedulerResource {
    pub scheduler: LoadScheduler,
    /// Loads whose driver faulted, cleared at local midnight
    pub faulted: std::collections::BTreeSet<String>,
    /// Local day (days since CE) the fault set belongs to
    pub faulted_day: i32,
}

impl LoadSchedulerResource {
    pub fn new(tz: Tz) -> Self {
        Self {
            scheduler: LoadScheduler::new(tz),
            faulted: Default::default(),
            faulted_day: 0,
        }
    }
}

/// Rebuild evaluation plus the single-planner-in-flight latch;
/// concurrent rebuild triggers coalesce on `in_flight`.
#[derive(Resource)]
pub struct PlannerResource {
    pub evaluator: RebuildEvaluator,
    pub in_flight: bool,
    pub last_request_at: Option<DateTime<Utc>>,
}

impl PlannerResource {
    pub fn new(evaluator: RebuildEvaluator) -> Self {
        Self {
            evaluator,
            in_flight: false,
            last_request_at: None,
        }
    }
}

#[derive(Resource)]
pub struct GuardResource(pub AntiOscillationGuard);

/// Applied-command cell shared with the refresh worker. The tick task
/// is the only writer.
#[derive(Resource, Clone, Default)]
pub struct AppliedCommandCell(pub Arc<RwLock<Option<AppliedCommand>>>);

impl AppliedCommandCell {
    pub fn get(&self) -> Option<AppliedCommand> {
        self.0.read().clone()
    }

    pub fn set(&self, applied: AppliedCommand) {
        *self.0.write() = Some(applied);
    }
}

/// Book-keeping for the 5-minute tick.
#[derive(Resource, Default)]
pub struct TickState {
    pub tick_count: u64,
    pub last_tick_at: Option<DateTime<Utc>>,
    /// Telemetry sample the previous tick's accounting integrated to
    pub last_energy_sample: Option<Telemetry>,
    pub last_decision: Option<Decision>,
    pub last_suppression: Option<String>,
    pub last_checkpoint_at: Option<DateTime<Utc>>,
}

#[derive(Resource)]
pub struct DbResource(pub Arc<Database>);

/// Shutdown flag set by the signal watcher; the tick loop finishes the
/// current tick, parks the inverter and exits.
#[derive(Resource, Default)]
pub struct ShutdownState {
    pub requested: bool,
    /// When the final park command was dispatched
    pub final_command_at: Option<DateTime<Utc>>,
    pub completed: bool,
}

// ============= External Interfaces =============

#[derive(Resource, Clone)]
pub struct InverterAdapterResource(pub Arc<dyn InverterAdapter>);

#[derive(Resource, Clone)]
pub struct SolarProviderResource(pub Arc<dyn SolarProvider>);

#[derive(Resource, Clone)]
pub struct WeatherProviderResource(pub Arc<dyn WeatherProvider>);

#[derive(Resource, Clone)]
pub struct StormProviderResource(pub Arc<dyn StormProvider>);

#[derive(Resource, Clone)]
pub struct TariffProviderResource(pub Arc<dyn TariffProvider>);

#[derive(Resource, Clone, Default)]
pub struct LoadDriversResource(pub HashMap<String, Arc<dyn LoadDriver>>);
