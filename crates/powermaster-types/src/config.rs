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

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::loads::LoadDefinition;

/// Fatal configuration problem. Startup must fail (exit code 2) before
/// any I/O when one of these is raised.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    NotFound(String),
    #[error("config parse error: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Central application configuration.
///
/// Hot-reloadable except `battery.capacity_wh` and the `hardware`
/// section, which require a restart. Each tick reads one immutable
/// snapshot taken at tick start.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub hardware: HardwareConfig,
    #[serde(default)]
    pub battery: BatteryConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub arbitrage: ArbitrageConfig,
    #[serde(default)]
    pub storm: StormConfig,
    #[serde(default)]
    pub planning: PlanningConfig,
    #[serde(default)]
    pub battery_targets: BatteryTargetsConfig,
    #[serde(default)]
    pub loads: LoadsConfig,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub dashboard: DashboardConfig,
    #[serde(default)]
    pub accounting: AccountingConfig,
    #[serde(default)]
    pub fixed_costs: FixedCostsConfig,
    #[serde(default)]
    pub resilience: ResilienceConfig,
    #[serde(default)]
    pub anti_oscillation: AntiOscillationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub db: DbConfig,
}

impl AppConfig {
    /// Validate cross-field invariants. Called once on startup and on
    /// every hot reload; a reload that fails validation is rejected.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let b = &self.battery;
        if b.capacity_wh == 0 {
            return Err(ConfigError::Invalid("battery.capacity_wh must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&b.round_trip_efficiency) || b.round_trip_efficiency == 0.0 {
            return Err(ConfigError::Invalid(
                "battery.round_trip_efficiency must be in (0, 1]".into(),
            ));
        }
        for (name, v) in [
            ("soc_min_hard", b.soc_min_hard),
            ("soc_min_soft", b.soc_min_soft),
            ("soc_max", b.soc_max),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return Err(ConfigError::Invalid(format!(
                    "battery.{name} must be in [0, 1], got {v}"
                )));
            }
        }
        if b.soc_min_hard > b.soc_min_soft {
            return Err(ConfigError::Invalid(
                "battery.soc_min_hard must not exceed soc_min_soft".into(),
            ));
        }
        if b.soc_min_soft >= b.soc_max {
            return Err(ConfigError::Invalid(
                "battery.soc_min_soft must be below soc_max".into(),
            ));
        }
        if self.planning.slot_duration_minutes != 30 {
            return Err(ConfigError::Invalid(
                "planning.slot_duration_minutes: only 30-minute slots are supported".into(),
            ));
        }
        if self.accounting.billing_cycle_day < 1 || self.accounting.billing_cycle_day > 28 {
            return Err(ConfigError::Invalid(
                "accounting.billing_cycle_day must be in 1..=28".into(),
            ));
        }
        if self.accounting.timezone.parse::<chrono_tz::Tz>().is_err() {
            return Err(ConfigError::Invalid(format!(
                "accounting.timezone: unknown IANA timezone '{}'",
                self.accounting.timezone
            )));
        }
        for load in &self.loads.devices {
            load.validate().map_err(ConfigError::Invalid)?;
        }
        Ok(())
    }
}

// ============= Hardware =============

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareConfig {
    /// Adapter type: "simulated" (bench) or a vendor driver id
    pub adapter: String,
    pub host: String,
    pub port: u16,
    /// Modbus-class read timeout
    pub read_timeout_ms: u64,
    /// Startup connect attempts before exit code 4
    pub init_retry_budget: u32,
    /// Re-send interval for FORCE_* modes, which time out at the device
    pub refresh_interval_s: u64,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            adapter: "simulated".into(),
            host: "192.168.1.100".into(),
            port: 502,
            read_timeout_ms: 2_000,
            init_retry_budget: 5,
            refresh_interval_s: 20,
        }
    }
}

// ============= Battery =============

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatteryConfig {
    pub capacity_wh: u32,
    pub max_charge_w: u32,
    pub max_discharge_w: u32,
    /// 0 = no limit; max grid import before load shedding kicks in
    pub max_grid_import_w: u32,
    pub soc_min_hard: f64,
    pub soc_min_soft: f64,
    pub soc_max: f64,
    pub round_trip_efficiency: f64,
    /// Battery wear cost per kWh cycled (c/kWh)
    pub degradation_c_per_kwh: f64,
}

impl Default for BatteryConfig {
    fn default() -> Self {
        Self {
            capacity_wh: 10_000,
            max_charge_w: 5_000,
            max_discharge_w: 5_000,
            max_grid_import_w: 0,
            soc_min_hard: 0.05,
            soc_min_soft: 0.10,
            soc_max: 0.95,
            round_trip_efficiency: 0.90,
            degradation_c_per_kwh: 3.0,
        }
    }
}

impl BatteryConfig {
    pub fn capacity_kwh(&self) -> f64 {
        f64::from(self.capacity_wh) / 1000.0
    }

    /// Minimum export-minus-import spread (cents) for a profitable
    /// grid-to-grid cycle after degradation.
    pub fn break_even_delta_c(&self) -> f64 {
        2.0 * self.degradation_c_per_kwh / self.round_trip_efficiency
    }
}

// ============= Providers =============

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub solar: SolarProviderConfig,
    #[serde(default)]
    pub weather: WeatherProviderConfig,
    #[serde(default)]
    pub storm: StormProviderConfig,
    #[serde(default)]
    pub tariff: TariffProviderConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SolarProviderConfig {
    pub kwp: f64,
    pub latitude: f64,
    pub longitude: f64,
    pub poll_interval_s: u64,
    /// Beyond this age the snapshot is marked degraded
    pub hard_ttl_s: i64,
}

impl Default for SolarProviderConfig {
    fn default() -> Self {
        Self {
            kwp: 5.0,
            latitude: -27.47,
            longitude: 153.03,
            poll_interval_s: 1_800,
            hard_ttl_s: 21_600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WeatherProviderConfig {
    pub poll_interval_s: u64,
    pub hard_ttl_s: i64,
}

impl Default for WeatherProviderConfig {
    fn default() -> Self {
        Self {
            poll_interval_s: 1_800,
            hard_ttl_s: 10_800,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StormProviderConfig {
    pub poll_interval_s: u64,
    pub hard_ttl_s: i64,
}

impl Default for StormProviderConfig {
    fn default() -> Self {
        Self {
            poll_interval_s: 1_800,
            hard_ttl_s: 21_600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TariffProviderConfig {
    pub poll_interval_s: u64,
    pub hard_ttl_s: i64,
}

impl Default for TariffProviderConfig {
    fn default() -> Self {
        Self {
            poll_interval_s: 300,
            hard_ttl_s: 3_600,
        }
    }
}

// ============= Arbitrage =============

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArbitrageConfig {
    /// Import price (c/kWh) at or above which a spike is flagged
    pub spike_threshold_c: f64,
    /// Minimum SOC before opportunistic discharge is considered
    pub opportunistic_min_soc: f64,
    /// Discharge power for opportunistic spike export (W)
    pub opportunistic_w: u32,
    /// Dampen import prices above this before the objective
    pub price_dampen_threshold_c: f64,
    /// Fraction of the excess above the threshold that is kept
    pub price_dampen_factor: f64,
    /// Tie-break reward for profitable cycles (cents)
    pub cycle_reward_c: f64,
}

impl Default for ArbitrageConfig {
    fn default() -> Self {
        Self {
            spike_threshold_c: 100.0,
            opportunistic_min_soc: 0.40,
            opportunistic_w: 4_000,
            price_dampen_threshold_c: 100.0,
            price_dampen_factor: 0.5,
            cycle_reward_c: 0.1,
        }
    }
}

// ============= Storm =============

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StormConfig {
    pub enabled: bool,
    /// Probability at or above which the reserve activates
    pub probability_threshold: f64,
    pub reserve_soc: f64,
    /// Charge power while building the reserve (W)
    pub charge_w: u32,
    /// Look-ahead window for storm probability (hours)
    pub horizon_hours: u32,
}

impl Default for StormConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            probability_threshold: 0.70,
            reserve_soc: 0.80,
            charge_w: 4_000,
            horizon_hours: 24,
        }
    }
}

// ============= Planning =============

/// Solar forecast percentile the planner optimises against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SolarPercentile {
    /// Conservative
    P10,
    /// Nominal
    #[default]
    P50,
    /// Aggressive
    P90,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanningConfig {
    pub horizon_hours: u32,
    pub slot_duration_minutes: u32,
    /// Control tick interval (seconds)
    pub tick_interval_s: u64,
    /// Plan age beyond which a rebuild is forced
    pub max_plan_age_s: i64,
    /// |actual − expected| SOC beyond which a rebuild is forced
    pub soc_drift_threshold: f64,
    /// Back-off before retrying after a non-optimal solve
    pub retry_backoff_s: i64,
    pub solver_timeout_s: u64,
    pub solar_percentile: SolarPercentile,
    /// Fallback load forecast while history is short (W)
    pub baseline_load_w: f64,
    /// Forecast freshness TTL used for `is_fresh`
    pub fresh_ttl_s: i64,
    /// Weight of the prefer-solar reward (cents per W per slot)
    pub prefer_solar_reward_c_per_w: f64,
    /// Reward per scheduled load slot (cents); keeps loads scheduled
    /// when prices alone would leave them off
    pub load_schedule_reward_c: f64,
}

impl Default for PlanningConfig {
    fn default() -> Self {
        Self {
            horizon_hours: 48,
            slot_duration_minutes: 30,
            tick_interval_s: 300,
            max_plan_age_s: 1_800,
            soc_drift_threshold: 0.10,
            retry_backoff_s: 300,
            solver_timeout_s: 20,
            solar_percentile: SolarPercentile::P50,
            baseline_load_w: 500.0,
            fresh_ttl_s: 7_200,
            prefer_solar_reward_c_per_w: 0.01,
            load_schedule_reward_c: 5.0,
        }
    }
}

/// Soft SOC shaping targets carried over from the original planner.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatteryTargetsConfig {
    pub evening_soc_target: f64,
    pub evening_target_hour: u32,
    pub morning_soc_minimum: f64,
    pub morning_minimum_hour: u32,
}

impl Default for BatteryTargetsConfig {
    fn default() -> Self {
        Self {
            evening_soc_target: 0.90,
            evening_target_hour: 16,
            morning_soc_minimum: 0.20,
            morning_minimum_hour: 6,
        }
    }
}

// ============= Loads =============

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LoadsConfig {
    #[serde(default)]
    pub devices: Vec<LoadDefinition>,
    /// Loads with priority above this are shed during spikes
    #[serde(default = "default_spike_shed_priority")]
    pub spike_shed_priority: u8,
}

fn default_spike_shed_priority() -> u8 {
    2
}

// ============= MQTT =============

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub enabled: bool,
    pub broker_host: String,
    pub broker_port: u16,
    pub topic_prefix: String,
    pub publish_timeout_s: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            broker_host: "localhost".into(),
            broker_port: 1883,
            topic_prefix: "power_master".into(),
            publish_timeout_s: 5,
        }
    }
}

// ============= Dashboard =============

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DashboardConfig {
    pub host: String,
    pub port: u16,
    /// SSE emission interval (seconds); 1-5 Hz supported
    pub sse_interval_ms: u64,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            sse_interval_ms: 1_000,
        }
    }
}

// ============= Accounting =============

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountingConfig {
    /// Day of month the billing cycle rolls over (local midnight)
    pub billing_cycle_day: u32,
    /// IANA timezone for billing and load-window arithmetic
    pub timezone: String,
    /// Assumed WACB for energy already stored at first startup (c/kWh)
    pub initial_wacb_c: f64,
}

impl Default for AccountingConfig {
    fn default() -> Self {
        Self {
            billing_cycle_day: 1,
            timezone: "Australia/Brisbane".into(),
            initial_wacb_c: 10.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FixedCostsConfig {
    pub monthly_supply_charge_cents: f64,
    pub daily_access_fee_cents: f64,
    pub hedging_per_kwh_cents: f64,
}

impl Default for FixedCostsConfig {
    fn default() -> Self {
        Self {
            monthly_supply_charge_cents: 9_000.0,
            daily_access_fee_cents: 100.0,
            hedging_per_kwh_cents: 2.0,
        }
    }
}

// ============= Resilience =============

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Consecutive failures before a source is marked unhealthy
    pub max_consecutive_failures: u32,
    /// Initial retry backoff for transient I/O failures
    pub backoff_initial_ms: u64,
    /// Backoff ceiling
    pub backoff_max_ms: u64,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 3,
            backoff_initial_ms: 200,
            backoff_max_ms: 30_000,
        }
    }
}

// ============= Anti-Oscillation =============

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AntiOscillationConfig {
    /// Minimum dwell before a non-safety mode change (seconds)
    pub min_mode_dwell_s: i64,
    /// Same-mode power changes below this are suppressed (W)
    pub power_hysteresis_w: u32,
    /// Transition cap within a rolling hour (safety/override uncounted)
    pub max_mode_changes_per_hour: usize,
}

impl Default for AntiOscillationConfig {
    fn default() -> Self {
        Self {
            min_mode_dwell_s: 600,
            power_hysteresis_w: 200,
            max_mode_changes_per_hour: 6,
        }
    }
}

// ============= Logging & DB =============

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// EnvFilter directive used when RUST_LOG is not set
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DbConfig {
    pub path: String,
    /// WAL checkpoint cadence (seconds)
    pub checkpoint_interval_s: u64,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: "data/power_master.db".into(),
            checkpoint_interval_s: 1_800,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        assert!(AppConfig::default().validate().is_ok());
    }

    #[test]
    fn test_soc_ordering_rejected() {
        let mut cfg = AppConfig::default();
        cfg.battery.soc_min_soft = 0.96;
        assert!(cfg.validate().is_err());

        let mut cfg = AppConfig::default();
        cfg.battery.soc_min_hard = 0.5;
        cfg.battery.soc_min_soft = 0.2;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_bad_timezone_rejected() {
        let mut cfg = AppConfig::default();
        cfg.accounting.timezone = "Mars/Olympus_Mons".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_break_even_delta() {
        let b = BatteryConfig {
            degradation_c_per_kwh: 3.0,
            round_trip_efficiency: 0.85,
            ..Default::default()
        };
        assert!((b.break_even_delta_c() - 2.0 * 3.0 / 0.85).abs() < 1e-9);
    }

    #[test]
    fn test_empty_toml_gives_defaults() {
        let cfg: AppConfig = toml::from_str("").expect("empty config should parse");
        assert_eq!(cfg.battery.capacity_wh, 10_000);
        assert_eq!(cfg.planning.tick_interval_s, 300);
    }
}
