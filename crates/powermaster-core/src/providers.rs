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

//! Offline provider and hardware implementations used on the bench and
//! in integration tests. Real vendor drivers plug in through the same
//! traits.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Timelike, Utc};
use parking_lot::Mutex;
use rand::Rng;

use powermaster_types::forecast::{SolarSample, StormWarning, WeatherSample};
use powermaster_types::inverter::{
    CommandResult, FaultFlags, InverterCommand, OperatingMode, Telemetry,
};
use powermaster_types::loads::LoadAction;
use powermaster_types::slot::floor_half_hour;
use powermaster_types::tariff::TariffPoint;

use crate::traits::{
    InverterAdapter, LoadDriver, ProviderBatch, ProviderResult, SolarProvider, StormProvider,
    TariffProvider, WeatherProvider,
};

// ============= Simulated Inverter =============

#[derive(Debug)]
struct SimState {
    soc: f64,
    mode: OperatingMode,
    power_w: u32,
    last_step: DateTime<Utc>,
}

/// Bench inverter with a coarse battery model: solar follows a daylight
/// bell, load idles around a baseline, and the commanded mode drives
/// the battery.
pub struct SimulatedInverter {
    capacity_wh: f64,
    max_charge_w: f64,
    max_discharge_w: f64,
    state: Mutex<SimState>,
}

impl SimulatedInverter {
    pub fn new(capacity_wh: f64, max_charge_w: f64, max_discharge_w: f64, initial_soc: f64) -> Self {
        Self {
            capacity_wh,
            max_charge_w,
            max_discharge_w,
            state: Mutex::new(SimState {
                soc: initial_soc,
                mode: OperatingMode::SelfUse,
                power_w: 0,
                last_step: Utc::now(),
            }),
        }
    }

    fn solar_now(at: DateTime<Utc>) -> f64 {
        // Daylight bell between 06:00 and 18:00 UTC, peak 4 kW
        let hour = at.hour() as f64 + f64::from(at.minute()) / 60.0;
        let x = (hour - 12.0) / 6.0;
        if x.abs() >= 1.0 {
            0.0
        } else {
            4000.0 * (1.0 - x * x)
        }
    }
}

#[async_trait]
impl InverterAdapter for SimulatedInverter {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn read_telemetry(&self) -> Result<Telemetry> {
        let now = Utc::now();
        let mut state = self.state.lock();
        let dt_h = ((now - state.last_step).num_seconds() as f64 / 3600.0).max(0.0);
        state.last_step = now;

        let solar_w = Self::solar_now(now);
        let load_w = 600.0 + rand::thread_rng().gen_range(-50.0..50.0);

        let battery_w = match state.mode {
            OperatingMode::ForceCharge => f64::from(state.power_w).min(self.max_charge_w),
            OperatingMode::ForceDischarge => -f64::from(state.power_w).min(self.max_discharge_w),
            OperatingMode::ChargeNoImport => (solar_w - load_w).clamp(0.0, self.max_charge_w),
            OperatingMode::SelfUse | OperatingMode::SelfUseZeroExport => {
                // PV to load first; surplus charges, deficit discharges
                (solar_w - load_w).clamp(-self.max_discharge_w, self.max_charge_w)
            }
        };
        let battery_w = if state.soc >= 1.0 && battery_w > 0.0 {
            0.0
        } else if state.soc <= 0.0 && battery_w < 0.0 {
            0.0
        } else {
            battery_w
        };

        state.soc = (state.soc + battery_w * dt_h / self.capacity_wh).clamp(0.0, 1.0);
        let grid_w = load_w + battery_w - solar_w;

        Ok(Telemetry {
            soc: state.soc,
            solar_w,
            load_w,
            grid_w,
            battery_w,
            inverter_mode: state.mode,
            fault_flags: FaultFlags::NONE,
            grid_available: true,
            read_at: now,
        })
    }

    async fn set_mode(&self, command: &InverterCommand) -> Result<CommandResult> {
        let mut state = self.state.lock();
        state.mode = command.mode;
        state.power_w = command.power_w;
        Ok(CommandResult::ok(2))
    }
}

// ============= Fixed-Schedule Tariff =============

/// Tariff provider that replays a fixed daily price pattern 48 hours
/// forward; useful for bench runs and deterministic tests.
pub struct FixedScheduleTariff {
    /// 24 hourly import prices (c/kWh)
    import_pattern: [f64; 24],
    /// Export price as a fraction of import
    export_fraction: f64,
}

impl FixedScheduleTariff {
    pub fn new(import_pattern: [f64; 24], export_fraction: f64) -> Self {
        Self {
            import_pattern,
            export_fraction,
        }
    }

    /// Typical residential shape: cheap overnight, shoulder daytime,
    /// evening peak.
    pub fn residential() -> Self {
        let mut pattern = [22.0; 24];
        for hour in 0..6 {
            pattern[hour] = 12.0;
        }
        for hour in 10..15 {
            pattern[hour] = 8.0;
        }
        for hour in 17..21 {
            pattern[hour] = 45.0;
        }
        Self::new(pattern, 0.35)
    }
}

#[async_trait]
impl TariffProvider for FixedScheduleTariff {
    fn name(&self) -> &str {
        "fixed-schedule"
    }

    async fn fetch(&self) -> ProviderResult<ProviderBatch<TariffPoint>> {
        let now = Utc::now();
        let start = floor_half_hour(now) - Duration::hours(2);
        let points = (0..100)
            .map(|i| {
                let slot_start = start + Duration::minutes(30 * i);
                let import_c = self.import_pattern[slot_start.hour() as usize];
                TariffPoint::new(slot_start, import_c, import_c * self.export_fraction)
            })
            .collect();
        ProviderResult::Ok(ProviderBatch {
            samples: points,
            produced_at: now,
        })
    }
}

// ============= Clear-Sky Solar =============

/// Solar forecast from a clear-sky bell scaled by installed kWp; the
/// percentile band widens with distance from now.
pub struct ClearSkySolar {
    kwp: f64,
}

impl ClearSkySolar {
    pub fn new(kwp: f64) -> Self {
        Self { kwp }
    }
}

#[async_trait]
impl SolarProvider for ClearSkySolar {
    fn name(&self) -> &str {
        "clear-sky"
    }

    async fn fetch(&self) -> ProviderResult<ProviderBatch<SolarSample>> {
        let now = Utc::now();
        let start = floor_half_hour(now);
        let samples = (0..96)
            .map(|i| {
                let at = start + Duration::minutes(30 * i);
                let hour = at.hour() as f64 + f64::from(at.minute()) / 60.0;
                let x = (hour - 12.0) / 6.0;
                let p50 = if x.abs() >= 1.0 {
                    0.0
                } else {
                    self.kwp * 1000.0 * 0.8 * (1.0 - x * x)
                };
                SolarSample {
                    at,
                    p10_w: p50 * 0.55,
                    p50_w: p50,
                    p90_w: p50 * 1.2,
                }
            })
            .collect();
        ProviderResult::Ok(ProviderBatch {
            samples,
            produced_at: now,
        })
    }
}

// ============= Mild Weather / Quiet Storms =============

pub struct MildWeather;

#[async_trait]
impl WeatherProvider for MildWeather {
    fn name(&self) -> &str {
        "mild-weather"
    }

    async fn fetch(&self) -> ProviderResult<ProviderBatch<WeatherSample>> {
        let now = Utc::now();
        let samples = (0..48)
            .map(|i| WeatherSample {
                at: now + Duration::hours(i),
                temp_c: 22.0,
                cloud_frac: 0.2,
                wind_mps: 3.0,
                rain_mm: 0.0,
            })
            .collect();
        ProviderResult::Ok(ProviderBatch {
            samples,
            produced_at: now,
        })
    }
}

/// Storm provider with no warnings; the storm path is exercised in
/// tests by injecting warnings directly.
pub struct QuietStorms;

#[async_trait]
impl StormProvider for QuietStorms {
    fn name(&self) -> &str {
        "quiet-storms"
    }

    async fn fetch(&self) -> ProviderResult<ProviderBatch<StormWarning>> {
        ProviderResult::Ok(ProviderBatch {
            samples: Vec::new(),
            produced_at: Utc::now(),
        })
    }
}

// ============= Logging Load Driver =============

/// Load driver for loads with no physical relay attached yet; applies
/// actions to an in-memory switch.
pub struct BenchLoadDriver {
    name: String,
    on: Mutex<bool>,
}

impl BenchLoadDriver {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            on: Mutex::new(false),
        }
    }
}

#[async_trait]
impl LoadDriver for BenchLoadDriver {
    fn load_name(&self) -> &str {
        &self.name
    }

    async fn apply(&self, action: LoadAction) -> Result<()> {
        *self.on.lock() = action == LoadAction::TurnOn;
        Ok(())
    }

    async fn is_on(&self) -> Result<bool> {
        Ok(*self.on.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_simulated_inverter_tracks_mode() {
        let inverter = SimulatedInverter::new(10_000.0, 5000.0, 5000.0, 0.5);
        inverter
            .set_mode(&InverterCommand {
                mode: OperatingMode::ForceCharge,
                power_w: 3000,
                export_cap_w: None,
            })
            .await
            .unwrap();
        let t = inverter.read_telemetry().await.unwrap();
        assert_eq!(t.inverter_mode, OperatingMode::ForceCharge);
        assert!(t.battery_w > 0.0);
    }

    #[tokio::test]
    async fn test_fixed_tariff_covers_48h() {
        let provider = FixedScheduleTariff::residential();
        let batch = provider.fetch().await.data().unwrap();
        assert_eq!(batch.samples.len(), 100);
        // Evening peak priced above overnight
        let peak = batch
            .samples
            .iter()
            .find(|p| p.slot_start.hour() == 18)
            .unwrap();
        let overnight = batch
            .samples
            .iter()
            .find(|p| p.slot_start.hour() == 3)
            .unwrap();
        assert!(peak.import_c > overnight.import_c);
    }

    #[tokio::test]
    async fn test_clear_sky_solar_shape() {
        let provider = ClearSkySolar::new(5.0);
        let batch = provider.fetch().await.data().unwrap();
        assert_eq!(batch.samples.len(), 96);
        for s in &batch.samples {
            assert!(s.p10_w <= s.p50_w && s.p50_w <= s.p90_w);
        }
        // Something is produced somewhere in the horizon
        assert!(batch.samples.iter().any(|s| s.p50_w > 1000.0));
    }

    #[tokio::test]
    async fn test_bench_load_driver_round_trip() {
        let driver = BenchLoadDriver::new("pump");
        driver.apply(LoadAction::TurnOn).await.unwrap();
        assert!(driver.is_on().await.unwrap());
        driver.apply(LoadAction::TurnOff).await.unwrap();
        assert!(!driver.is_on().await.unwrap());
    }
}
