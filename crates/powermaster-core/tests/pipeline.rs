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

//! Cross-module scenarios: planner → cache → arbitrator → guard →
//! scheduler, driven the way the tick loop drives them.

use chrono::{DateTime, Duration, TimeZone, Timelike, Utc};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration as StdDuration;

use powermaster_core::accounting::{AccountingEngine, TickEnergy};
use powermaster_core::anti_oscillation::AntiOscillationGuard;
use powermaster_core::arbitrator::{decide, ArbitratorInputs, DecisionSource};
use powermaster_core::forecast::{forecast_hash, ForecastAggregator};
use powermaster_core::history::LoadHistory;
use powermaster_core::loads::{LoadConditions, LoadScheduler};
use powermaster_core::planner::{assemble_request, build_plan, GoodLpSolver};
use powermaster_core::rebuild::{RebuildEvaluator, RebuildInputs};
use powermaster_core::tariff::TariffSeries;
use powermaster_types::config::AppConfig;
use powermaster_types::forecast::SolarSample;
use powermaster_types::inverter::{FaultFlags, InverterCommand, OperatingMode, Telemetry};
use powermaster_types::loads::{LoadAction, LoadDefinition};
use powermaster_types::plan::PlanStatus;
use powermaster_types::tariff::TariffPoint;

fn telemetry(soc: f64, at: DateTime<Utc>) -> Telemetry {
    Telemetry {
        soc,
        solar_w: 0.0,
        load_w: 600.0,
        grid_w: 600.0,
        battery_w: 0.0,
        inverter_mode: OperatingMode::SelfUse,
        fault_flags: FaultFlags::NONE,
        grid_available: true,
        read_at: at,
    }
}

fn flat_tariff(now: DateTime<Utc>, import_c: f64, export_c: f64) -> TariffSeries {
    let mut series = TariffSeries::new();
    let start = powermaster_types::slot::floor_half_hour(now);
    let points = (0..96)
        .map(|i| TariffPoint::new(start + Duration::minutes(30 * i), import_c, export_c))
        .collect();
    series.ingest(points, 100.0, now);
    series
}

fn pool_pump() -> LoadDefinition {
    LoadDefinition {
        name: "pool_pump".into(),
        power_w: 1100,
        priority_class: 5,
        min_runtime_min: 60,
        ideal_runtime_min: 120,
        max_runtime_min: 180,
        earliest_h: 10,
        latest_h: 18,
        days_of_week: HashSet::new(),
        prefer_solar: true,
        allow_split_shifts: false,
        enabled: true,
    }
}

/// Assemble a request from real aggregator + tariff snapshots and run
/// the real solver over a small config. The full path the planner
/// worker takes, minus the channels.
#[test]
fn test_snapshot_to_plan_pipeline() {
    let now = Utc.with_ymd_and_hms(2025, 6, 2, 1, 0, 0).unwrap();
    let mut config = AppConfig::default();
    config.planning.load_schedule_reward_c = 8.0;
    config.loads.devices = vec![pool_pump()];

    let mut aggregator = ForecastAggregator::new();
    // Midday solar bell (UTC ≈ Brisbane morning; window mapped via tz)
    let samples: Vec<SolarSample> = (0..96)
        .map(|i| {
            let at = now + Duration::minutes(30 * i);
            let hour = at.hour() as f64 + f64::from(at.minute()) / 60.0;
            let x: f64 = (hour - 3.0) / 5.0; // peak ~03:00 UTC = 13:00 AEST
            let p50 = if x.abs() >= 1.0 { 0.0 } else { 3500.0 * (1.0 - x * x) };
            SolarSample {
                at,
                p10_w: p50 * 0.5,
                p50_w: p50,
                p90_w: p50 * 1.2,
            }
        })
        .collect();
    aggregator.update_solar(samples, now);

    let history = LoadHistory::new(chrono_tz::Australia::Brisbane);
    let mut snapshot = aggregator.snapshot(now, &history, 500.0, &config.providers);
    assert_eq!(snapshot.slots.len(), 96);
    // Keep the solve small enough for the pure-Rust backend
    snapshot.slots.truncate(16);

    let tariff = flat_tariff(now, 20.0, 8.0);
    let request = assemble_request(
        &config,
        &snapshot,
        &tariff,
        chrono_tz::Australia::Brisbane,
        0.5,
        10.0,
        &HashMap::new(),
        true,
        now,
        "initial",
    );
    assert_eq!(request.loads.len(), 1);

    let solver = GoodLpSolver::new(StdDuration::from_secs(60));
    let plan = build_plan(&config, &request, &solver, now);
    assert!(plan.status.is_usable());
    assert_eq!(plan.slots.len(), 16);

    // Scheduled minutes stay within the configured envelope
    let scheduled_minutes = 30
        * plan
            .slots
            .iter()
            .filter(|s| s.scheduled_loads.contains("pool_pump"))
            .count() as u32;
    assert!(scheduled_minutes <= 180);

    // SOC stays inside bounds everywhere
    for slot in &plan.slots {
        assert!(slot.expected_soc >= config.battery.soc_min_soft - 1e-6);
        assert!(slot.expected_soc <= config.battery.soc_max + 1e-6);
    }
}

/// Rebuild evaluator sees the new forecast hash and triggers; the new
/// plan then matches and the trigger clears.
#[test]
fn test_rebuild_cycle_settles() {
    let now = Utc.with_ymd_and_hms(2025, 6, 2, 1, 0, 0).unwrap();
    let config = AppConfig::default();
    let mut aggregator = ForecastAggregator::new();
    let history = LoadHistory::new(chrono_tz::UTC);
    let tariff = flat_tariff(now, 20.0, 8.0);
    let solver = GoodLpSolver::new(StdDuration::from_secs(60));
    let mut evaluator = RebuildEvaluator::new(&config.planning);

    let mut snapshot = aggregator.snapshot(now, &history, 500.0, &config.providers);
    snapshot.slots.truncate(12);
    let request = assemble_request(
        &config, &snapshot, &tariff, chrono_tz::UTC, 0.5, 10.0, &HashMap::new(), true, now,
        "initial",
    );
    let plan = build_plan(&config, &request, &solver, now);
    evaluator.mark_attempt(now);

    // Plan fresh and hashes match: no rebuild
    let later = now + Duration::minutes(5);
    let none = evaluator.evaluate(&RebuildInputs {
        now: later,
        current_soc: plan.expected_soc_at(later).unwrap_or(0.5),
        latest_forecast_hash: plan.forecast_hash,
        latest_tariff_hash: plan.tariff_hash,
        latest_params_hash: plan.params_hash,
        override_just_expired: false,
        plan: Some(&plan),
    });
    assert!(none.is_none());

    // Fresh solar data changes the forecast hash → rebuild trigger
    aggregator.update_solar(
        vec![SolarSample {
            at: now + Duration::hours(1),
            p10_w: 500.0,
            p50_w: 1000.0,
            p90_w: 1500.0,
        }],
        later,
    );
    let new_snapshot = aggregator.snapshot(later, &history, 500.0, &config.providers);
    let trigger = evaluator.evaluate(&RebuildInputs {
        now: later,
        current_soc: 0.5,
        latest_forecast_hash: forecast_hash(&new_snapshot),
        latest_tariff_hash: plan.tariff_hash,
        latest_params_hash: plan.params_hash,
        override_just_expired: false,
        plan: Some(&plan),
    });
    assert_eq!(trigger.as_deref(), Some("forecast_change"));
}

/// Arbitrator + guard: re-arbitrating the applied command is a no-op
/// (idempotence), and the dwell behaviour plays out tick-by-tick.
#[test]
fn test_arbitrate_guard_idempotence_and_dwell() {
    let config = AppConfig::default();
    let t0 = Utc.with_ymd_and_hms(2025, 6, 2, 0, 0, 0).unwrap();
    let mut guard = AntiOscillationGuard::new(config.anti_oscillation.clone());

    let decide_at = |at: DateTime<Utc>, soc: f64| {
        let telem = telemetry(soc, at);
        decide(&ArbitratorInputs {
            now: at,
            telemetry: &telem,
            storm_probability: 0.0,
            plan_slot: None,
            user_override: None,
            tariff_now: None,
            spike_active: false,
            arbitrage_allowed: true,
            battery: &config.battery,
            storm: &config.storm,
            arbitrage: &config.arbitrage,
        })
    };

    // Tick 1: DEFAULT self-use applied
    let d1 = decide_at(t0, 0.5);
    assert_eq!(d1.source, DecisionSource::Default);
    let cmd1 = InverterCommand {
        mode: d1.target_mode,
        power_w: d1.power_w,
        export_cap_w: d1.export_cap_w,
    };
    assert!(guard.check(&cmd1, d1.source, t0).allowed());
    guard.record_applied(cmd1, d1.source, d1.rationale, t0);

    // Tick 2: identical decision is suppressed at the guard, so no
    // re-dispatch happens (idempotence at the arbitration level)
    let d2 = decide_at(t0 + Duration::minutes(5), 0.5);
    let cmd2 = InverterCommand {
        mode: d2.target_mode,
        power_w: d2.power_w,
        export_cap_w: d2.export_cap_w,
    };
    assert!(!guard
        .check(&cmd2, d2.source, t0 + Duration::minutes(5))
        .allowed());

    // Tick 3 at +9 min wants FORCE_CHARGE (soc floor). SocFloor is not
    // SAFETY, so the dwell applies; at +11 min it goes through.
    let d3 = decide_at(t0 + Duration::minutes(9), 0.08);
    assert_eq!(d3.source, DecisionSource::SocFloor);
    let cmd3 = InverterCommand {
        mode: d3.target_mode,
        power_w: d3.power_w,
        export_cap_w: d3.export_cap_w,
    };
    assert!(!guard.check(&cmd3, d3.source, t0 + Duration::minutes(9)).allowed());
    assert!(guard.check(&cmd3, d3.source, t0 + Duration::minutes(11)).allowed());
}

/// A full simulated day of accounting ticks: the cycle roll-up agrees
/// with an independent integral of the same telemetry within 0.1%.
#[test]
fn test_accounting_conservation_over_a_day() {
    let tz = chrono_tz::UTC;
    let mut engine = AccountingEngine::new(
        &AppConfig::default().battery,
        &powermaster_types::config::AccountingConfig {
            billing_cycle_day: 1,
            timezone: "UTC".into(),
            initial_wacb_c: 12.0,
        },
        AppConfig::default().fixed_costs.clone(),
        tz,
        0.5,
    );

    let t0 = Utc.with_ymd_and_hms(2025, 6, 10, 0, 0, 0).unwrap();
    let tariff = TariffPoint::new(t0, 28.0, 7.0);
    let mut expected_import_cents = 0.0;
    let mut expected_self_cents = 0.0;

    // 288 five-minute ticks with a solar day in the middle
    for i in 0..288 {
        let at = t0 + Duration::seconds(300 * i);
        let hour = (i * 5 / 60) as f64;
        let x: f64 = (hour - 12.0) / 6.0;
        let solar_w = if x.abs() >= 1.0 { 0.0 } else { 3000.0 * (1.0 - x * x) };
        let load_w = 800.0;
        let grid_w = (load_w - solar_w).max(0.0);

        let energy = TickEnergy {
            dt_s: 300.0,
            grid_w,
            solar_w,
            load_w,
            battery_w: 0.0,
        };
        expected_import_cents += grid_w.max(0.0) * 300.0 / 3600.0 / 1000.0 * tariff.import_c;
        expected_self_cents += solar_w.min(load_w) * 300.0 / 3600.0 / 1000.0 * tariff.import_c;

        engine.on_tick(at, &energy, Some(&tariff), false, 0.5);
    }

    let summary = engine.summary(t0 + Duration::days(1));
    let cycle = summary.cycle.expect("cycle exists");
    let import_err = (cycle.import_cost_cents - expected_import_cents).abs();
    let self_err = (cycle.self_consumption_cents - expected_self_cents).abs();
    assert!(import_err / expected_import_cents < 1e-3);
    assert!(self_err / expected_self_cents < 1e-3);
}

/// Plan says run the pump over the solar peak; the scheduler walks the
/// device through RUNNING and the fallback plan never schedules loads.
#[test]
fn test_plan_drives_scheduler() {
    let now = Utc.with_ymd_and_hms(2025, 6, 2, 12, 0, 0).unwrap();
    let mut config = AppConfig::default();
    config.accounting.timezone = "UTC".into();
    config.loads.devices = vec![pool_pump()];

    // Hand-built plan slot that schedules the pump now
    let mut scheduled = BTreeSet::new();
    scheduled.insert("pool_pump".to_string());
    let slot = powermaster_types::plan::PlanSlot {
        slot_start: powermaster_types::slot::floor_half_hour(now),
        mode: OperatingMode::SelfUse,
        charge_w: 0.0,
        discharge_w: 0.0,
        expected_soc: 0.6,
        scheduled_loads: scheduled,
        import_c: 8.0,
        export_c: 3.0,
        solar_forecast_w: 3000.0,
        load_forecast_w: 500.0,
    };

    let mut scheduler = LoadScheduler::new(chrono_tz::UTC);
    let actions = scheduler.on_tick(
        now,
        &config.loads.devices,
        Some(&slot),
        &LoadConditions::default(),
    );
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].action, LoadAction::TurnOn);

    // A fallback plan never carries scheduled loads, so the pump winds
    // down once its minimum runtime is met
    struct Never;
    impl powermaster_core::planner::Solver for Never {
        fn name(&self) -> &str {
            "never"
        }
        fn solve(
            &self,
            _: &powermaster_core::planner::MilpProblem,
        ) -> powermaster_core::planner::SolveOutcome {
            powermaster_core::planner::SolveOutcome::failed(
                powermaster_core::SolveStatus::Infeasible,
                1,
            )
        }
    }
    let aggregator = ForecastAggregator::new();
    let history = LoadHistory::new(chrono_tz::UTC);
    let snapshot = aggregator.snapshot(now, &history, 500.0, &config.providers);
    let tariff = flat_tariff(now, 20.0, 8.0);
    let request = assemble_request(
        &config, &snapshot, &tariff, chrono_tz::UTC, 0.5, 10.0, &HashMap::new(), true, now,
        "initial",
    );
    let fallback = build_plan(&config, &request, &Never, now);
    assert_eq!(fallback.status, PlanStatus::Fallback);

    let later = now + Duration::minutes(65);
    let actions = scheduler.on_tick(
        later,
        &config.loads.devices,
        fallback.slot_at(later),
        &LoadConditions::default(),
    );
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].action, LoadAction::TurnOff);
}
