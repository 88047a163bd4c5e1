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

mod config;

use bevy_app::{prelude::*, ScheduleRunnerPlugin, TaskPoolPlugin};
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::FmtSubscriber;

use powermaster_core::providers::{
    BenchLoadDriver, ClearSkySolar, FixedScheduleTariff, MildWeather, QuietStorms,
    SimulatedInverter,
};
use powermaster_core::traits::{InverterAdapter, LoadDriver};
use powermaster_core::{
    AccountingEngine, AntiOscillationGuard, AppliedCommandCell, AsyncRuntime, CommandIntentSender,
    ConfigResource, DbResource, ForecastState, GuardResource, HealthResource,
    InverterAdapterResource, LoadDriversResource, LoadSchedulerResource, OverrideState, PlanCache,
    PlannerResource, PowerMasterCorePlugin, RebuildEvaluator, ShutdownState, SolarProviderResource,
    StormMonitor, StormProviderResource, StormResource, TariffProviderResource, TariffState,
    TelemetryState, TickState, WebQuerySender,
};
use powermaster_db::{Database, DbError};
use powermaster_types::config::AppConfig;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Exit codes per the operations contract.
const EXIT_CONFIG: i32 = 2;
const EXIT_DATABASE: i32 = 3;
const EXIT_INVERTER: i32 = 4;

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path: Option<String> = std::env::var("POWER_MASTER_CONFIG").ok();
    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--help" | "-h" => {
                println!("Power Master - residential energy optimiser");
                println!("Version: {VERSION}");
                println!();
                println!("Usage: powermaster [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -c, --config <PATH>  Configuration file (default: config.toml)");
                println!("  -h, --help           Print this help message");
                println!("  -v, --version        Print version");
                return;
            }
            "--version" | "-v" => {
                println!("{VERSION}");
                return;
            }
            "--config" | "-c" => {
                config_path = iter.next().cloned();
            }
            other => {
                eprintln!("Unknown argument: {other}");
                std::process::exit(EXIT_CONFIG);
            }
        }
    }

    // Tracing first so config problems are visible
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    // Fatal config errors exit before any I/O
    let explicit = config_path.is_some();
    let path = config_path.unwrap_or_else(|| config::DEFAULT_CONFIG_PATH.to_string());
    let app_config = match config::load_config(&path, explicit) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "fatal configuration error");
            std::process::exit(EXIT_CONFIG);
        }
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to create tokio runtime");

    // Run the ECS app on a blocking thread so tokio keeps driving the
    // worker tasks
    let exit = runtime.block_on(async {
        tokio::task::spawn_blocking(move || initialize_and_run(app_config))
            .await
            .expect("app task panicked")
    });
    std::process::exit(exit);
}

fn initialize_and_run(app_config: AppConfig) -> i32 {
    info!("starting Power Master v{VERSION}");
    info!(
        "battery: {:.1} kWh, charge {} W, discharge {} W, soc {:.0}%-{:.0}%",
        app_config.battery.capacity_kwh(),
        app_config.battery.max_charge_w,
        app_config.battery.max_discharge_w,
        app_config.battery.soc_min_soft * 100.0,
        app_config.battery.soc_max * 100.0,
    );
    info!(
        "planning: {}h horizon, {}s tick, spike threshold {}c",
        app_config.planning.horizon_hours,
        app_config.planning.tick_interval_s,
        app_config.arbitrage.spike_threshold_c,
    );
    info!("loads: {} configured", app_config.loads.devices.len());

    let config_resource = ConfigResource::new(app_config.clone());
    let tz = config_resource.tz;
    let runtime_handle = tokio::runtime::Handle::current();

    // ── Database ──
    let db = match Database::open(&app_config.db.path) {
        Ok(db) => Arc::new(db),
        Err(e) => {
            if e.downcast_ref::<DbError>().is_some() {
                error!(error = %e, "database unrecoverable");
            } else {
                error!(error = %e, "database failed to open");
            }
            return EXIT_DATABASE;
        }
    };
    info!(path = %app_config.db.path, "database ready");

    // ── Inverter adapter ──
    let adapter: Arc<dyn InverterAdapter> = match app_config.hardware.adapter.as_str() {
        "simulated" => Arc::new(SimulatedInverter::new(
            f64::from(app_config.battery.capacity_wh),
            f64::from(app_config.battery.max_charge_w),
            f64::from(app_config.battery.max_discharge_w),
            0.5,
        )),
        other => {
            error!(adapter = other, "unknown hardware adapter");
            return EXIT_CONFIG;
        }
    };

    let mut connected = false;
    for attempt in 1..=app_config.hardware.init_retry_budget {
        match runtime_handle.block_on(adapter.connect()) {
            Ok(()) => {
                info!(adapter = adapter.name(), "inverter adapter connected");
                connected = true;
                break;
            }
            Err(e) => {
                warn!(attempt = attempt, error = %e, "inverter connect failed");
                std::thread::sleep(Duration::from_secs(2 * u64::from(attempt)));
            }
        }
    }
    if !connected {
        error!("inverter driver could not initialise, giving up");
        return EXIT_INVERTER;
    }

    // ── Providers (offline implementations; vendor HTTP clients plug
    // in through the same traits) ──
    let solar = Arc::new(ClearSkySolar::new(app_config.providers.solar.kwp));
    let weather = Arc::new(MildWeather);
    let storm = Arc::new(QuietStorms);
    let tariff = Arc::new(FixedScheduleTariff::residential());

    let mut load_drivers: HashMap<String, Arc<dyn LoadDriver>> = HashMap::new();
    for device in &app_config.loads.devices {
        load_drivers.insert(
            device.name.clone(),
            Arc::new(BenchLoadDriver::new(device.name.clone())),
        );
    }

    // ── Restore persisted state ──
    let now = Utc::now();
    let restored_override = db.active_override(now).unwrap_or_default();
    if restored_override.is_some() {
        info!("restored active user override");
    }

    let mut forecast_state = ForecastState::new(tz);
    match db.query_telemetry(now - ChronoDuration::days(28), now) {
        Ok(rows) => {
            let count = rows.len();
            for row in rows {
                forecast_state.history.record(row.read_at, row.load_w);
            }
            info!(samples = count, "load history restored from telemetry");
        }
        Err(e) => warn!(error = %e, "could not restore load history"),
    }

    let mut load_scheduler = LoadSchedulerResource::new(tz);
    match db.load_load_states() {
        Ok(states) => {
            for (name, runtime) in states {
                load_scheduler.scheduler.restore(&name, runtime);
            }
        }
        Err(e) => warn!(error = %e, "could not restore load states"),
    }

    let accounting = AccountingEngine::new(
        &app_config.battery,
        &app_config.accounting,
        app_config.fixed_costs.clone(),
        tz,
        0.5,
    );

    // ── Web bridge + dashboard ──
    let (query_sender, query_channel) = WebQuerySender::new();
    let (intent_sender, intent_channel) = CommandIntentSender::new();
    let web_state = powermaster_web::AppState {
        query_sender,
        intent_sender,
        db: db.clone(),
        sse_interval_ms: app_config.dashboard.sse_interval_ms,
    };
    let host = app_config.dashboard.host.clone();
    let port = app_config.dashboard.port;
    runtime_handle.spawn(async move {
        if let Err(e) = powermaster_web::start_web_server(web_state, host, port).await {
            error!(error = %e, "dashboard server failed");
        }
    });

    // ── ECS application ──
    info!("starting control application");
    let mut app = App::new();
    app.add_plugins(TaskPoolPlugin::default())
        .add_plugins(ScheduleRunnerPlugin::run_loop(Duration::from_millis(250)))
        .add_plugins(PowerMasterCorePlugin)
        .insert_resource(AsyncRuntime::current())
        .insert_resource(config_resource)
        .insert_resource(PlanCache::default())
        .insert_resource(TelemetryState::default())
        .insert_resource(forecast_state)
        .insert_resource(TariffState::new(app_config.arbitrage.spike_threshold_c))
        .insert_resource(StormResource(StormMonitor::new(app_config.storm.clone())))
        .insert_resource(HealthResource::new(
            app_config.resilience.max_consecutive_failures,
        ))
        .insert_resource(OverrideState {
            current: restored_override,
            just_expired: false,
        })
        .insert_resource(powermaster_core::AccountingResource(accounting))
        .insert_resource(load_scheduler)
        .insert_resource(PlannerResource::new(RebuildEvaluator::new(
            &app_config.planning,
        )))
        .insert_resource(GuardResource(AntiOscillationGuard::new(
            app_config.anti_oscillation.clone(),
        )))
        .insert_resource(AppliedCommandCell::default())
        .insert_resource(TickState::default())
        .insert_resource(ShutdownState::default())
        .insert_resource(DbResource(db))
        .insert_resource(InverterAdapterResource(adapter))
        .insert_resource(SolarProviderResource(solar))
        .insert_resource(powermaster_core::WeatherProviderResource(weather))
        .insert_resource(StormProviderResource(storm))
        .insert_resource(TariffProviderResource(tariff))
        .insert_resource(LoadDriversResource(load_drivers))
        .insert_resource(query_channel)
        .insert_resource(intent_channel);

    let exit = app.run();
    info!("power master stopped");
    match exit {
        AppExit::Success => 0,
        AppExit::Error(code) => i32::from(code.get()),
    }
}
