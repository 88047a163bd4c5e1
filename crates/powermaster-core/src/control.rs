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

use bevy_app::AppExit;
use bevy_ecs::prelude::*;
use chrono::{Datelike, Duration, Utc};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

use powermaster_types::accounting::{AccountingEvent, AccountingEventKind};
use powermaster_types::inverter::{InverterCommand, OperatingMode};

use crate::accounting::TickEnergy;
use crate::anti_oscillation::GuardVerdict;
use crate::arbitrator::{decide, ArbitratorInputs, DecisionSource};
use crate::async_systems::{CommandChannel, CommandRequest, LoadActionChannel, PlannerChannel};
use crate::forecast::forecast_hash;
use crate::loads::{select_overload_sheds, LoadConditions};
use crate::planner::{assemble_request, params_hash};
use crate::rebuild::RebuildInputs;
use crate::resources::*;
use crate::web_bridge::{
    EventSnapshot, ModeStatus, PlanView, ProviderStatusView, QueryType, WebQueryChannel,
    WebQueryResponse,
};

/// Telemetry retention in the repo.
const TELEMETRY_RETENTION_DAYS: i64 = 60;

/// Telemetry older than this is not a safe basis for commands; the
/// tick holds off and the health checker escalates in parallel.
const TELEMETRY_MAX_AGE_S: i64 = 120;

/// The 5-minute control tick: read → account → (re)plan → arbitrate →
/// guard → dispatch → schedule loads → publish.
#[allow(clippy::too_many_arguments)]
pub fn tick_system(
    config: Res<ConfigResource>,
    mut tick: ResMut<TickState>,
    telemetry: Res<TelemetryState>,
    mut forecast: ResMut<ForecastState>,
    mut tariff: ResMut<TariffState>,
    mut storm: ResMut<StormResource>,
    mut override_state: ResMut<OverrideState>,
    mut accounting: ResMut<AccountingResource>,
    mut planner: ResMut<PlannerResource>,
    mut guard: ResMut<GuardResource>,
    mut loads: ResMut<LoadSchedulerResource>,
    health: Res<HealthResource>,
    plan_cache: Res<PlanCache>,
    db: Res<DbResource>,
    channels: Query<(&CommandChannel, &PlannerChannel, &LoadActionChannel)>,
    shutdown: Res<ShutdownState>,
) {
    if shutdown.requested {
        return;
    }
    let now = Utc::now();
    let cfg = config.config.clone();
    let due = tick
        .last_tick_at
        .map_or(true, |last| now - last >= Duration::seconds(cfg.planning.tick_interval_s as i64));
    if !due {
        return;
    }
    let Ok((command_channel, planner_channel, load_channel)) = channels.single() else {
        return;
    };

    tick.tick_count += 1;
    tick.last_tick_at = Some(now);
    debug!(tick = tick.tick_count, "control tick");

    // (a) Telemetry. Without a fresh reading there is nothing safe to
    // decide; the refresh loop keeps the last command alive meanwhile.
    let Some(telem) = telemetry.latest.clone() else {
        warn!(tick = tick.tick_count, "no telemetry yet, skipping tick");
        return;
    };
    let telemetry_age_s = (now - telem.read_at).num_seconds();
    if telemetry_age_s > TELEMETRY_MAX_AGE_S {
        warn!(
            tick = tick.tick_count,
            age_s = telemetry_age_s,
            "telemetry stale, skipping tick"
        );
        return;
    }

    // Rebuild the forecast snapshot for this tick
    let snapshot = forecast.aggregator.snapshot(
        now,
        &forecast.history,
        cfg.planning.baseline_load_w,
        &cfg.providers,
    );
    forecast.snapshot = Some(snapshot.clone());

    // Storm + spike state
    let storm_prob = snapshot.max_storm_prob_within(cfg.storm.horizon_hours);
    storm.0.update(storm_prob, now);
    {
        let tariff_state = &mut *tariff;
        tariff_state.spike.evaluate(&tariff_state.series, now);
    }
    override_state.tick(now);

    // (b) Accounting over the previous interval
    if let Some(prev) = tick.last_energy_sample.clone() {
        let dt_s = (telem.read_at - prev.read_at).num_seconds() as f64;
        if dt_s > 0.0 {
            let energy = TickEnergy {
                dt_s,
                grid_w: prev.grid_w,
                solar_w: prev.solar_w,
                load_w: prev.load_w,
                battery_w: prev.battery_w,
            };
            let force_discharge = guard
                .0
                .last_applied()
                .map(|a| a.command.mode == powermaster_types::inverter::OperatingMode::ForceDischarge)
                .unwrap_or(false);
            let tariff_now = tariff.series.at(now).copied();
            let outcome =
                accounting
                    .0
                    .on_tick(now, &energy, tariff_now.as_ref(), force_discharge, telem.soc);
            for event in &outcome.events {
                if let Err(e) = db.0.record_event(event) {
                    warn!(error = %e, "failed to persist accounting event");
                }
            }
            if let Some(archived) = outcome.archived_cycle {
                info!(net_cents = archived.net_cost_cents, "archiving billing cycle");
                if let Err(e) = db.0.archive_cycle(&archived) {
                    warn!(error = %e, "failed to archive billing cycle");
                }
                let rollover = AccountingEvent {
                    kind: AccountingEventKind::CycleRollover,
                    energy_wh: 0.0,
                    rate_c: 0.0,
                    cost_cents: archived.net_cost_cents,
                    cost_basis_cents: 0.0,
                    profit_loss_cents: 0.0,
                    at: now,
                };
                let _ = db.0.record_event(&rollover);
                accounting.0.record_event(rollover);
            }
        }
    }
    tick.last_energy_sample = Some(telem.clone());

    // (c) Rebuild evaluation; at most one planner task in flight
    let latest_forecast_hash = forecast_hash(&snapshot);
    let latest_tariff_hash = tariff.series.forward_hash(now);
    let active_plan = plan_cache.get();
    let rebuild = planner.evaluator.evaluate(&RebuildInputs {
        now,
        current_soc: telem.soc,
        latest_forecast_hash,
        latest_tariff_hash,
        latest_params_hash: params_hash(&cfg),
        override_just_expired: override_state.just_expired,
        plan: active_plan.as_deref(),
    });
    if let Some(trigger) = rebuild {
        if planner.in_flight {
            debug!(trigger = %trigger, "rebuild wanted but planner busy, coalescing");
        } else {
            info!(trigger = %trigger, "triggering plan rebuild");
            let request = assemble_request(
                &cfg,
                &snapshot,
                &tariff.series,
                config.tz,
                telem.soc,
                accounting.0.wacb_c(),
                &loads.scheduler.runtime_minutes_map(),
                health.level.arbitrage_allowed(),
                now,
                &trigger,
            );
            if planner_channel
                .request_sender
                .send((request, cfg.clone()))
                .is_ok()
            {
                planner.in_flight = true;
                planner.last_request_at = Some(now);
                planner.evaluator.mark_attempt(now);
            } else {
                warn!("planner worker unavailable");
            }
        }
    }

    // (d) Arbitrate
    let plan_slot = active_plan.as_deref().and_then(|p| p.slot_at(now));
    let tariff_now = tariff.series.at(now).copied();
    let decision = decide(&ArbitratorInputs {
        now,
        telemetry: &telem,
        storm_probability: storm_prob,
        plan_slot,
        user_override: override_state.current.as_ref(),
        tariff_now: tariff_now.as_ref(),
        spike_active: tariff.spike.is_active(),
        arbitrage_allowed: health.level.arbitrage_allowed(),
        battery: &cfg.battery,
        storm: &cfg.storm,
        arbitrage: &cfg.arbitrage,
    });

    // (e)+(f) Anti-oscillation guard, then dispatch
    let command = InverterCommand {
        mode: decision.target_mode,
        power_w: decision.power_w,
        export_cap_w: decision.export_cap_w,
    };
    match guard.0.check(&command, decision.source, now) {
        GuardVerdict::Allow => {
            tick.last_suppression = None;
            let _ = command_channel.sender.send(CommandRequest {
                command,
                source: decision.source,
                rationale: decision.rationale.clone(),
                refresh: false,
            });
        }
        GuardVerdict::Suppress { reason } => {
            info!(
                reason = %reason,
                wanted_mode = %decision.target_mode,
                "command suppressed, previous command stays in effect"
            );
            tick.last_suppression = Some(reason);
        }
    }

    // (g) Load scheduling. Driver faults lock a load out for the day,
    // so the fault set resets with the local day.
    let local_day = now.with_timezone(&config.tz).num_days_from_ce();
    if loads.faulted_day != local_day {
        loads.faulted.clear();
        loads.faulted_day = local_day;
    }

    let mut shed: BTreeSet<String> = BTreeSet::new();
    if tariff.spike.is_active() {
        for def in &cfg.loads.devices {
            if def.priority_class > cfg.loads.spike_shed_priority {
                shed.insert(def.name.clone());
            }
        }
    }
    let running: BTreeSet<String> = loads
        .scheduler
        .states()
        .into_iter()
        .filter(|(_, r)| r.state == powermaster_types::loads::LoadState::Running)
        .map(|(name, _)| name)
        .collect();
    shed.extend(select_overload_sheds(
        &cfg.loads.devices,
        &running,
        telem.grid_w,
        f64::from(cfg.battery.max_grid_import_w),
    ));

    let conditions = LoadConditions {
        faulted: loads.faulted.clone(),
        shed,
        safety_shed_all: decision.source == DecisionSource::Safety,
    };
    let actions = loads
        .scheduler
        .on_tick(now, &cfg.loads.devices, plan_slot, &conditions);
    for action in &actions {
        debug!(load = %action.name, action = ?action.action, reason = %action.reason, "load action");
        let _ = load_channel
            .sender
            .send((action.name.clone(), action.action));
    }
    for def in &cfg.loads.devices {
        if let Some(runtime) = loads.scheduler.runtime(&def.name) {
            if let Err(e) = db.0.save_load_state(&def.name, runtime) {
                warn!(error = %e, "failed to persist load state");
            }
        }
    }

    // (h) Tick summary for the log stream; the web bridge serves the
    // richer snapshot on demand
    info!(
        tick = tick.tick_count,
        soc_pct = telem.soc_pct(),
        mode = %decision.target_mode,
        source = ?decision.source,
        plan_status = active_plan.as_deref().map(|p| format!("{:?}", p.status)).unwrap_or_else(|| "none".into()),
        suppressed = tick.last_suppression.is_some(),
        "tick complete"
    );
    tick.last_decision = Some(decision);
}

/// Answer dashboard queries from the current resources.
#[allow(clippy::too_many_arguments)]
pub fn web_query_system(
    mut queries: ResMut<WebQueryChannel>,
    telemetry: Res<TelemetryState>,
    tariff: Res<TariffState>,
    plan_cache: Res<PlanCache>,
    override_state: Res<OverrideState>,
    accounting: Res<AccountingResource>,
    health: Res<HealthResource>,
    guard: Res<GuardResource>,
    tick: Res<TickState>,
) {
    while let Ok(request) = queries.receiver.try_recv() {
        let now = Utc::now();
        let response = match request.query {
            QueryType::Mode => WebQueryResponse::Mode(mode_status(
                now,
                &override_state,
                &plan_cache,
                &guard,
                &tick,
            )),
            QueryType::ActivePlan => {
                WebQueryResponse::ActivePlan(plan_cache.get().map(|p| PlanView::from(p.as_ref())))
            }
            QueryType::AccountingSummary => {
                WebQueryResponse::AccountingSummary(accounting.0.summary(now))
            }
            QueryType::ProvidersStatus => {
                let views = health
                    .checker
                    .all()
                    .into_iter()
                    .map(|s| ProviderStatusView {
                        data_age_seconds: s.data_age_seconds(now),
                        name: s.name,
                        healthy: s.healthy,
                        configured: s.configured,
                        consecutive_failures: s.consecutive_failures,
                        last_error: s.last_error,
                    })
                    .collect();
                WebQueryResponse::ProvidersStatus(views)
            }
            QueryType::EventSnapshot => {
                let summary = accounting.0.summary(now);
                WebQueryResponse::EventSnapshot(Box::new(EventSnapshot {
                    at: now,
                    telemetry: telemetry.latest.clone(),
                    price: tariff.series.at(now).copied(),
                    spike_active: tariff.spike.is_active(),
                    mode: mode_status(now, &override_state, &plan_cache, &guard, &tick),
                    wacb_c: summary.wacb_c,
                    today_net_cost_cents: summary.today_net_cost_cents,
                    resilience_level: format!("{:?}", health.level),
                }))
            }
        };
        let _ = request.respond.send(response);
    }
}

fn mode_status(
    now: chrono::DateTime<Utc>,
    override_state: &OverrideState,
    plan_cache: &PlanCache,
    guard: &GuardResource,
    tick: &TickState,
) -> ModeStatus {
    let plan = plan_cache.get();
    let plan_mode = plan.as_deref().and_then(|p| p.slot_at(now)).map(|s| s.mode);
    let applied = guard.0.last_applied();
    ModeStatus {
        user_mode: override_state.current.map(|o| o.mode),
        override_active: override_state.current.is_some(),
        override_remaining_s: override_state
            .current
            .map(|o| o.remaining_seconds(now))
            .unwrap_or(0),
        optimiser_mode: plan_mode,
        applied_mode: applied.map(|a| a.command.mode),
        source: tick.last_decision.as_ref().map(|d| d.source),
        mode_name: applied
            .map(|a| a.command.mode.display_name().to_string())
            .unwrap_or_else(|| "unknown".into()),
        rationale: tick
            .last_suppression
            .clone()
            .map(|s| format!("suppressed: {s}"))
            .or_else(|| tick.last_decision.as_ref().map(|d| d.rationale.clone()))
            .unwrap_or_default(),
    }
}

/// WAL checkpointing and telemetry retention on the slow cadence.
pub fn maintenance_system(
    config: Res<ConfigResource>,
    mut tick: ResMut<TickState>,
    db: Res<DbResource>,
) {
    let now = Utc::now();
    let interval = Duration::seconds(config.config.db.checkpoint_interval_s as i64);
    let due = tick
        .last_checkpoint_at
        .map_or(true, |last| now - last >= interval);
    if !due {
        return;
    }
    tick.last_checkpoint_at = Some(now);
    if let Err(e) = db.0.checkpoint() {
        warn!(error = %e, "wal checkpoint failed");
    }
    match db.0.prune_telemetry(now - Duration::days(TELEMETRY_RETENTION_DAYS)) {
        Ok(0) => {}
        Ok(n) => debug!(rows = n, "pruned old telemetry"),
        Err(e) => warn!(error = %e, "telemetry prune failed"),
    }
}

/// Graceful shutdown: park the inverter in SELF_USE, flush the
/// database, then exit the app loop once the park command has been
/// acknowledged (or a short grace period has passed).
pub fn shutdown_system(
    mut shutdown: ResMut<ShutdownState>,
    channels: Query<&CommandChannel>,
    db: Res<DbResource>,
    applied: Res<AppliedCommandCell>,
    mut exit: EventWriter<AppExit>,
) {
    if !shutdown.requested || shutdown.completed {
        return;
    }
    let now = Utc::now();

    let Some(sent_at) = shutdown.final_command_at else {
        info!("shutting down: parking inverter in self-use and flushing state");
        if let Ok(channel) = channels.single() {
            let _ = channel.sender.send(CommandRequest {
                command: InverterCommand::self_use(),
                source: DecisionSource::Default,
                rationale: "shutdown".into(),
                refresh: false,
            });
        }
        if let Err(e) = db.0.checkpoint() {
            warn!(error = %e, "final checkpoint failed");
        }
        shutdown.final_command_at = Some(now);
        return;
    };

    let parked = applied
        .get()
        .map(|a| a.command.mode == OperatingMode::SelfUse && a.rationale == "shutdown")
        .unwrap_or(false);
    if parked || now - sent_at >= Duration::seconds(5) {
        shutdown.completed = true;
        exit.write(AppExit::Success);
    }
}
