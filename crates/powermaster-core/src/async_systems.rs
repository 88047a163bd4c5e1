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

use bevy_ecs::prelude::*;
use chrono::{DateTime, Utc};
use crossbeam_channel::Receiver;
use futures_timer::Delay;
use rand::Rng;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use powermaster_types::accounting::{AccountingEvent, AccountingEventKind};
use powermaster_types::config::AppConfig;
use powermaster_types::forecast::{SolarSample, StormWarning, WeatherSample};
use powermaster_types::inverter::{CommandResult, InverterCommand, Telemetry};
use powermaster_types::loads::LoadAction;
use powermaster_types::plan::{Plan, PlanStatus};
use powermaster_types::tariff::TariffPoint;

use crate::arbitrator::DecisionSource;
use crate::async_runtime::AsyncRuntime;
use crate::planner::{build_plan, GoodLpSolver, PlannerRequest};
use crate::resources::*;
use crate::traits::{ProviderBatch, ProviderResult};
use crate::web_bridge::{CommandIntent, CommandIntentChannel};

/// Channel capacity for provider updates.
const PROVIDER_CHANNEL_CAPACITY: usize = 16;
/// Channel capacity for telemetry samples.
const TELEMETRY_CHANNEL_CAPACITY: usize = 64;
/// Timeout for provider HTTP-class fetches.
const PROVIDER_FETCH_TIMEOUT: Duration = Duration::from_secs(10);
/// Timeout for load driver actions.
const LOAD_ACTION_TIMEOUT: Duration = Duration::from_secs(5);
/// Telemetry poll period.
const TELEMETRY_POLL_SECS: u64 = 5;

// ============= Worker Channel Components =============

/// Component marking the telemetry poller entity
#[derive(Component)]
pub struct TelemetryPoller {
    pub poll_interval_secs: u64,
}

#[derive(Component)]
pub struct TelemetryChannel {
    pub receiver: Receiver<Result<Telemetry, String>>,
}

#[derive(Component)]
pub struct SolarChannel {
    pub receiver: Receiver<ProviderResult<ProviderBatch<SolarSample>>>,
}

#[derive(Component)]
pub struct WeatherChannel {
    pub receiver: Receiver<ProviderResult<ProviderBatch<WeatherSample>>>,
}

#[derive(Component)]
pub struct StormChannel {
    pub receiver: Receiver<ProviderResult<ProviderBatch<StormWarning>>>,
}

#[derive(Component)]
pub struct TariffChannel {
    pub receiver: Receiver<ProviderResult<ProviderBatch<TariffPoint>>>,
}

/// A command on its way to the inverter writer worker.
#[derive(Debug, Clone)]
pub struct CommandRequest {
    pub command: InverterCommand,
    pub source: DecisionSource,
    pub rationale: String,
    /// True for the 20-second keep-alive re-sends
    pub refresh: bool,
}

#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub request: CommandRequest,
    pub result: Result<CommandResult, String>,
    pub at: DateTime<Utc>,
}

/// Component that holds the channels to the exclusive command writer.
#[derive(Component)]
pub struct CommandChannel {
    pub sender: tokio::sync::mpsc::UnboundedSender<CommandRequest>,
    pub outcome_receiver: Receiver<CommandOutcome>,
}

#[derive(Component)]
pub struct PlannerChannel {
    pub request_sender: tokio::sync::mpsc::UnboundedSender<(PlannerRequest, Arc<AppConfig>)>,
    pub plan_receiver: Receiver<Plan>,
}

#[derive(Component)]
pub struct LoadActionChannel {
    pub sender: tokio::sync::mpsc::UnboundedSender<(String, LoadAction)>,
    /// (load name, error) for faulted drivers
    pub fault_receiver: Receiver<(String, String)>,
}

/// Ctrl-C / SIGTERM notification from the signal watcher task.
#[derive(Resource)]
pub struct ShutdownSignal {
    pub receiver: Receiver<()>,
}

// ============= Worker Setup =============

type BoxedFetch<T> =
    Box<dyn Fn() -> Pin<Box<dyn Future<Output = ProviderResult<ProviderBatch<T>>> + Send>> + Send>;

/// Poll one provider forever: fetch immediately, then on its interval,
/// with jittered exponential backoff after failures.
fn spawn_provider_poller<T: Send + 'static>(
    runtime: &AsyncRuntime,
    name: &'static str,
    interval: Duration,
    backoff_initial: Duration,
    backoff_max: Duration,
    tx: crossbeam_channel::Sender<ProviderResult<ProviderBatch<T>>>,
    fetch: BoxedFetch<T>,
) {
    runtime.spawn(async move {
        info!(provider = name, "provider poller started");
        let mut backoff = backoff_initial;
        loop {
            let result = match tokio::time::timeout(PROVIDER_FETCH_TIMEOUT, fetch()).await {
                Ok(result) => result,
                Err(_) => ProviderResult::Err(format!("{name} fetch timed out")),
            };

            let failed = result.is_err();
            if tx.try_send(result).is_err() {
                warn!(provider = name, "provider channel full, dropping update");
            }

            if failed {
                let jitter = rand::thread_rng().gen_range(0.8..1.2);
                let wait = backoff.mul_f64(jitter).min(backoff_max);
                debug!(provider = name, wait_ms = wait.as_millis() as u64, "backing off");
                Delay::new(wait).await;
                backoff = (backoff * 2).min(backoff_max);
            } else {
                backoff = backoff_initial;
                Delay::new(interval).await;
            }
        }
    });
}

/// Startup system that spawns all long-running worker tasks. The
/// workers talk to the ECS through bounded crossbeam channels drained
/// by the polling systems below.
#[allow(clippy::too_many_arguments)]
pub fn setup_async_workers(
    mut commands: Commands,
    runtime: Res<AsyncRuntime>,
    config: Res<ConfigResource>,
    adapter: Res<InverterAdapterResource>,
    solar: Res<SolarProviderResource>,
    weather: Res<WeatherProviderResource>,
    storm: Res<StormProviderResource>,
    tariff: Res<TariffProviderResource>,
    load_drivers: Res<LoadDriversResource>,
    applied: Res<AppliedCommandCell>,
) {
    let cfg = config.config.clone();
    info!("setting up async workers");

    // ============= Telemetry Poller =============
    let (telemetry_tx, telemetry_rx) = crossbeam_channel::bounded(TELEMETRY_CHANNEL_CAPACITY);
    {
        let adapter = adapter.0.clone();
        let read_timeout = Duration::from_millis(cfg.hardware.read_timeout_ms);
        runtime.spawn(async move {
            info!("telemetry poller started");
            loop {
                let message = match tokio::time::timeout(read_timeout, adapter.read_telemetry()).await
                {
                    Ok(Ok(telemetry)) => Ok(telemetry),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(_) => Err("telemetry read timed out".to_string()),
                };
                if telemetry_tx.try_send(message).is_err() {
                    warn!("telemetry channel full, dropping sample");
                }
                Delay::new(Duration::from_secs(TELEMETRY_POLL_SECS)).await;
            }
        });
    }
    commands.spawn((
        TelemetryPoller {
            poll_interval_secs: TELEMETRY_POLL_SECS,
        },
        TelemetryChannel {
            receiver: telemetry_rx,
        },
    ));

    // ============= Provider Pollers =============
    let backoff_initial = Duration::from_millis(cfg.resilience.backoff_initial_ms);
    let backoff_max = Duration::from_millis(cfg.resilience.backoff_max_ms);

    let (solar_tx, solar_rx) = crossbeam_channel::bounded(PROVIDER_CHANNEL_CAPACITY);
    {
        let provider = solar.0.clone();
        spawn_provider_poller(
            &runtime,
            "solar",
            Duration::from_secs(cfg.providers.solar.poll_interval_s),
            backoff_initial,
            backoff_max,
            solar_tx,
            Box::new(move || {
                let provider = provider.clone();
                Box::pin(async move { provider.fetch().await })
            }),
        );
    }
    commands.spawn(SolarChannel { receiver: solar_rx });

    let (weather_tx, weather_rx) = crossbeam_channel::bounded(PROVIDER_CHANNEL_CAPACITY);
    {
        let provider = weather.0.clone();
        spawn_provider_poller(
            &runtime,
            "weather",
            Duration::from_secs(cfg.providers.weather.poll_interval_s),
            backoff_initial,
            backoff_max,
            weather_tx,
            Box::new(move || {
                let provider = provider.clone();
                Box::pin(async move { provider.fetch().await })
            }),
        );
    }
    commands.spawn(WeatherChannel {
        receiver: weather_rx,
    });

    let (storm_tx, storm_rx) = crossbeam_channel::bounded(PROVIDER_CHANNEL_CAPACITY);
    {
        let provider = storm.0.clone();
        spawn_provider_poller(
            &runtime,
            "storm",
            Duration::from_secs(cfg.providers.storm.poll_interval_s),
            backoff_initial,
            backoff_max,
            storm_tx,
            Box::new(move || {
                let provider = provider.clone();
                Box::pin(async move { provider.fetch().await })
            }),
        );
    }
    commands.spawn(StormChannel { receiver: storm_rx });

    let (tariff_tx, tariff_rx) = crossbeam_channel::bounded(PROVIDER_CHANNEL_CAPACITY);
    {
        let provider = tariff.0.clone();
        spawn_provider_poller(
            &runtime,
            "tariff",
            Duration::from_secs(cfg.providers.tariff.poll_interval_s),
            backoff_initial,
            backoff_max,
            tariff_tx,
            Box::new(move || {
                let provider = provider.clone();
                Box::pin(async move { provider.fetch().await })
            }),
        );
    }
    commands.spawn(TariffChannel {
        receiver: tariff_rx,
    });

    // ============= Inverter Command Writer =============
    // Exclusive access: every mode write goes through this one task.
    let (command_tx, mut command_rx) =
        tokio::sync::mpsc::unbounded_channel::<CommandRequest>();
    let (outcome_tx, outcome_rx) = crossbeam_channel::bounded(TELEMETRY_CHANNEL_CAPACITY);
    {
        let adapter = adapter.0.clone();
        let write_timeout = Duration::from_millis(cfg.hardware.read_timeout_ms);
        runtime.spawn(async move {
            info!("inverter command writer started");
            while let Some(request) = command_rx.recv().await {
                let result =
                    match tokio::time::timeout(write_timeout, adapter.set_mode(&request.command))
                        .await
                    {
                        Ok(Ok(result)) => Ok(result),
                        Ok(Err(e)) => Err(e.to_string()),
                        Err(_) => Err("inverter command timed out".to_string()),
                    };
                let outcome = CommandOutcome {
                    request,
                    result,
                    at: Utc::now(),
                };
                if outcome_tx.try_send(outcome).is_err() {
                    error!("command outcome channel full");
                }
            }
            warn!("inverter command writer stopped");
        });
    }

    // ============= Command Refresh Loop =============
    // FORCE_* modes time out at the device after ~30 s, so the applied
    // command is re-sent continuously between control ticks.
    {
        let cell = applied.0.clone();
        let sender = command_tx.clone();
        let refresh_interval = Duration::from_secs(cfg.hardware.refresh_interval_s);
        runtime.spawn(async move {
            info!(
                interval_s = refresh_interval.as_secs(),
                "command refresh loop started"
            );
            loop {
                Delay::new(refresh_interval).await;
                let applied = { cell.read().clone() };
                let Some(applied) = applied else { continue };
                if !applied.command.mode.needs_refresh() {
                    continue;
                }
                let _ = sender.send(CommandRequest {
                    command: applied.command,
                    source: applied.source,
                    rationale: "refresh".to_string(),
                    refresh: true,
                });
            }
        });
    }
    // ============= Planner Worker =============
    // CPU-bound solve runs on a blocking thread; at most one in flight,
    // the tick side coalesces concurrent triggers.
    let (plan_request_tx, mut plan_request_rx) =
        tokio::sync::mpsc::unbounded_channel::<(PlannerRequest, Arc<AppConfig>)>();
    let (plan_tx, plan_rx) = crossbeam_channel::bounded(4);
    runtime.spawn(async move {
        info!("planner worker started");
        while let Some((request, config)) = plan_request_rx.recv().await {
            let solve = tokio::task::spawn_blocking(move || {
                let solver =
                    GoodLpSolver::new(Duration::from_secs(config.planning.solver_timeout_s));
                build_plan(&config, &request, &solver, Utc::now())
            })
            .await;
            match solve {
                Ok(plan) => {
                    if plan_tx.try_send(plan).is_err() {
                        error!("plan channel full, dropping plan");
                    }
                }
                Err(e) => error!(error = %e, "planner task panicked"),
            }
        }
        warn!("planner worker stopped");
    });
    // ============= Load Action Worker =============
    let (load_tx, mut load_rx) = tokio::sync::mpsc::unbounded_channel::<(String, LoadAction)>();
    let (fault_tx, fault_rx) = crossbeam_channel::bounded(32);
    {
        let drivers = load_drivers.0.clone();
        runtime.spawn(async move {
            info!("load action worker started");
            while let Some((name, action)) = load_rx.recv().await {
                let Some(driver) = drivers.get(&name) else {
                    warn!(load = %name, "no driver registered for load");
                    continue;
                };
                let applied =
                    match tokio::time::timeout(LOAD_ACTION_TIMEOUT, driver.apply(action)).await {
                        Ok(Ok(())) => Ok(()),
                        Ok(Err(e)) => Err(e.to_string()),
                        Err(_) => Err("load action timed out".to_string()),
                    };
                if let Err(error) = applied {
                    warn!(load = %name, error = %error, "load action failed");
                    let _ = fault_tx.try_send((name, error));
                }
            }
        });
    }
    // Control-plane channels live on one entity so the tick system
    // can query them together
    commands.spawn((
        CommandChannel {
            sender: command_tx,
            outcome_receiver: outcome_rx,
        },
        PlannerChannel {
            request_sender: plan_request_tx,
            plan_receiver: plan_rx,
        },
        LoadActionChannel {
            sender: load_tx,
            fault_receiver: fault_rx,
        },
    ));

    // ============= Signal Watcher =============
    let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded(1);
    runtime.spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            let _ = shutdown_tx.try_send(());
        }
    });
    commands.insert_resource(ShutdownSignal {
        receiver: shutdown_rx,
    });

    info!("async workers initialized");
}

// ============= Polling Systems =============

/// Drain telemetry samples into the live state, feed the load history
/// and the telemetry repo.
pub fn poll_telemetry_system(
    channels: Query<&TelemetryChannel>,
    mut telemetry: ResMut<TelemetryState>,
    mut forecast: ResMut<ForecastState>,
    mut health: ResMut<HealthResource>,
    db: Res<DbResource>,
) {
    let Ok(channel) = channels.single() else {
        return;
    };
    while let Ok(message) = channel.receiver.try_recv() {
        match message {
            Ok(sample) => {
                health.checker.record_success("inverter", sample.read_at);
                forecast.history.record(sample.read_at, sample.load_w);
                if let Err(e) = db.0.record_telemetry(&sample) {
                    warn!(error = %e, "failed to persist telemetry");
                }
                telemetry.latest = Some(sample);
            }
            Err(error) => {
                health.checker.record_failure("inverter", &error, Utc::now());
            }
        }
    }
    health.refresh_level();
}

/// Drain provider updates into the aggregator and tariff series.
#[allow(clippy::type_complexity)]
pub fn poll_provider_channels_system(
    solar: Query<&SolarChannel>,
    weather: Query<&WeatherChannel>,
    storm: Query<&StormChannel>,
    tariff: Query<&TariffChannel>,
    config: Res<ConfigResource>,
    mut forecast: ResMut<ForecastState>,
    mut tariff_state: ResMut<TariffState>,
    mut health: ResMut<HealthResource>,
    db: Res<DbResource>,
) {
    let now = Utc::now();

    if let Ok(channel) = solar.single() {
        while let Ok(result) = channel.receiver.try_recv() {
            match result {
                ProviderResult::Ok(batch) => {
                    health.checker.record_success("solar", now);
                    forecast.aggregator.update_solar(batch.samples, batch.produced_at);
                }
                ProviderResult::Degraded { data, reason } => {
                    warn!(reason = %reason, "solar provider degraded");
                    health.checker.record_success("solar", now);
                    forecast.aggregator.update_solar(data.samples, data.produced_at);
                }
                ProviderResult::Err(error) => {
                    health.checker.record_failure("solar", &error, now);
                }
            }
        }
    }

    if let Ok(channel) = weather.single() {
        while let Ok(result) = channel.receiver.try_recv() {
            match result {
                ProviderResult::Ok(batch) | ProviderResult::Degraded { data: batch, .. } => {
                    health.checker.record_success("weather", now);
                    forecast.aggregator.update_weather(batch.samples, batch.produced_at);
                }
                ProviderResult::Err(error) => {
                    health.checker.record_failure("weather", &error, now);
                }
            }
        }
    }

    if let Ok(channel) = storm.single() {
        while let Ok(result) = channel.receiver.try_recv() {
            match result {
                ProviderResult::Ok(batch) | ProviderResult::Degraded { data: batch, .. } => {
                    health.checker.record_success("storm", now);
                    forecast.aggregator.update_storms(batch.samples, batch.produced_at);
                }
                ProviderResult::Err(error) => {
                    health.checker.record_failure("storm", &error, now);
                }
            }
        }
    }

    if let Ok(channel) = tariff.single() {
        let spike_threshold = config.config.arbitrage.spike_threshold_c;
        while let Ok(result) = channel.receiver.try_recv() {
            match result {
                ProviderResult::Ok(batch) | ProviderResult::Degraded { data: batch, .. } => {
                    health.checker.record_success("tariff", now);
                    for point in &batch.samples {
                        let stamped = point.with_spike_threshold(spike_threshold);
                        if let Err(e) = db.0.record_price(&stamped) {
                            warn!(error = %e, "failed to persist price");
                        }
                    }
                    tariff_state.series.ingest(batch.samples, spike_threshold, now);
                }
                ProviderResult::Err(error) => {
                    health.checker.record_failure("tariff", &error, now);
                }
            }
        }
    }

    health.refresh_level();
}

/// Record dispatch outcomes: successful tick commands update the
/// anti-oscillation guard and the applied-command cell.
pub fn poll_command_outcomes_system(
    channels: Query<&CommandChannel>,
    mut guard: ResMut<GuardResource>,
    applied: Res<AppliedCommandCell>,
    mut health: ResMut<HealthResource>,
) {
    let Ok(channel) = channels.single() else {
        return;
    };
    while let Ok(outcome) = channel.outcome_receiver.try_recv() {
        match &outcome.result {
            Ok(result) if result.success => {
                health.checker.record_success("inverter", outcome.at);
                if !outcome.request.refresh {
                    guard.0.record_applied(
                        outcome.request.command,
                        outcome.request.source,
                        outcome.request.rationale.clone(),
                        outcome.at,
                    );
                    if let Some(last) = guard.0.last_applied() {
                        applied.set(last.clone());
                    }
                    info!(
                        mode = %outcome.request.command.mode,
                        power_w = outcome.request.command.power_w,
                        source = ?outcome.request.source,
                        latency_ms = result.latency_ms,
                        "command applied"
                    );
                } else {
                    debug!(mode = %outcome.request.command.mode, "command refreshed");
                }
            }
            Ok(result) => {
                health
                    .checker
                    .record_failure("inverter", &result.message, outcome.at);
                warn!(message = %result.message, "inverter rejected command");
            }
            Err(error) => {
                health.checker.record_failure("inverter", error, outcome.at);
                warn!(error = %error, "command dispatch failed");
            }
        }
    }
}

/// Install finished plans into the cache and the plan repo.
pub fn poll_planner_results_system(
    channels: Query<&PlannerChannel>,
    plan_cache: Res<PlanCache>,
    mut planner: ResMut<PlannerResource>,
    mut accounting: ResMut<AccountingResource>,
    db: Res<DbResource>,
) {
    let Ok(channel) = channels.single() else {
        return;
    };
    while let Ok(plan) = channel.plan_receiver.try_recv() {
        planner.in_flight = false;
        if let Err(e) = db.0.save_plan(&plan) {
            warn!(error = %e, "failed to persist plan");
        }
        if plan.status == PlanStatus::Fallback {
            let event = AccountingEvent {
                kind: AccountingEventKind::PlannerFallback,
                energy_wh: 0.0,
                rate_c: 0.0,
                cost_cents: 0.0,
                cost_basis_cents: 0.0,
                profit_loss_cents: 0.0,
                at: plan.built_at,
            };
            if let Err(e) = db.0.record_event(&event) {
                warn!(error = %e, "failed to persist fallback event");
            }
            accounting.0.record_event(event);
            warn!(trigger = %plan.trigger, "planner produced fallback plan");
        }
        plan_cache.install(plan);
    }
}

/// Drain load-driver faults into the scheduler conditions.
pub fn poll_load_faults_system(
    channels: Query<&LoadActionChannel>,
    mut loads: ResMut<LoadSchedulerResource>,
) {
    let Ok(channel) = channels.single() else {
        return;
    };
    while let Ok((name, error)) = channel.fault_receiver.try_recv() {
        warn!(load = %name, error = %error, "load driver reported fault");
        loads.faulted.insert(name);
    }
}

/// Apply dashboard command intents at the tick boundary.
pub fn poll_intents_system(
    mut intents: ResMut<CommandIntentChannel>,
    mut override_state: ResMut<OverrideState>,
    db: Res<DbResource>,
) {
    while let Ok(intent) = intents.receiver.try_recv() {
        match intent {
            CommandIntent::SetOverride {
                mode,
                power_w,
                timeout_s,
            } => {
                let user_override = powermaster_types::inverter::UserOverride {
                    mode,
                    power_w,
                    expires_at: Utc::now() + chrono::Duration::seconds(timeout_s as i64),
                };
                info!(mode = %mode, timeout_s = timeout_s, "user override set");
                if let Err(e) = db.0.save_override(&user_override) {
                    warn!(error = %e, "failed to persist override");
                }
                override_state.current = Some(user_override);
                override_state.just_expired = false;
            }
            CommandIntent::ClearOverride => {
                info!("user override cleared");
                if let Err(e) = db.0.clear_override() {
                    warn!(error = %e, "failed to clear override");
                }
                if override_state.current.take().is_some() {
                    override_state.just_expired = true;
                }
            }
        }
    }
}

/// Watch for ctrl-c.
pub fn poll_shutdown_system(signal: Option<Res<ShutdownSignal>>, mut state: ResMut<ShutdownState>) {
    let Some(signal) = signal else { return };
    if signal.receiver.try_recv().is_ok() {
        state.requested = true;
    }
}
