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

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

// ============= Provider Samples =============

/// Single sample of solar forecast data from a provider.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SolarSample {
    pub at: DateTime<Utc>,
    /// Pessimistic estimate (W)
    pub p10_w: f64,
    /// Median estimate (W)
    pub p50_w: f64,
    /// Optimistic estimate (W)
    pub p90_w: f64,
}

/// Single sample of weather forecast data.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WeatherSample {
    pub at: DateTime<Utc>,
    pub temp_c: f64,
    /// Cloud cover fraction (0.0 to 1.0)
    pub cloud_frac: f64,
    pub wind_mps: f64,
    pub rain_mm: f64,
}

/// Storm warning from a weather product.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StormWarning {
    pub probability: f64,
    pub description: String,
    pub valid_from: DateTime<Utc>,
    pub valid_to: DateTime<Utc>,
}

impl StormWarning {
    /// Whether the warning overlaps the half-open interval `[start, end)`.
    pub fn intersects(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        self.valid_from < end && self.valid_to > start
    }
}

// ============= Aggregated Forecast =============

/// Reasons a forecast snapshot carries degraded data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradedReason {
    SolarStale,
    SolarMissing,
    WeatherStale,
    WeatherMissing,
    StormStale,
    TariffStale,
    TariffMissing,
    LoadHistoryShort,
}

impl fmt::Display for DegradedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::SolarStale => "solar_stale",
            Self::SolarMissing => "solar_missing",
            Self::WeatherStale => "weather_stale",
            Self::WeatherMissing => "weather_missing",
            Self::StormStale => "storm_stale",
            Self::TariffStale => "tariff_stale",
            Self::TariffMissing => "tariff_missing",
            Self::LoadHistoryShort => "load_history_short",
        };
        write!(f, "{s}")
    }
}

/// One 30-minute slot of the aggregated forecast.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ForecastPoint {
    pub slot_start: DateTime<Utc>,
    pub solar_p10_w: f64,
    pub solar_p50_w: f64,
    pub solar_p90_w: f64,
    /// Baseline household load, excluding scheduled deferrable loads
    pub load_forecast_w: f64,
    pub temp_c: f64,
    pub cloud_frac: f64,
    pub wind_mps: f64,
    pub rain_mm: f64,
    /// Max probability over storm warnings intersecting the slot
    pub storm_prob: f64,
    pub produced_at: DateTime<Utc>,
}

impl ForecastPoint {
    /// Construct with the percentile ordering `0 ≤ p10 ≤ p50 ≤ p90`
    /// enforced by clamping and sorting.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        slot_start: DateTime<Utc>,
        p10_w: f64,
        p50_w: f64,
        p90_w: f64,
        load_forecast_w: f64,
        produced_at: DateTime<Utc>,
    ) -> Self {
        let mut p = [p10_w.max(0.0), p50_w.max(0.0), p90_w.max(0.0)];
        p.sort_by(|a, b| a.partial_cmp(b).expect("solar percentiles are finite"));
        Self {
            slot_start,
            solar_p10_w: p[0],
            solar_p50_w: p[1],
            solar_p90_w: p[2],
            load_forecast_w: load_forecast_w.max(0.0),
            temp_c: 0.0,
            cloud_frac: 0.0,
            wind_mps: 0.0,
            rain_mm: 0.0,
            storm_prob: 0.0,
            produced_at,
        }
    }

    pub fn is_fresh(&self, now: DateTime<Utc>, fresh_ttl_s: i64) -> bool {
        (now - self.produced_at).num_seconds() <= fresh_ttl_s
    }
}

/// 48-hour aggregated forecast snapshot, 96 half-hour slots aligned
/// forward from `floor_half_hour(now)` at build time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Forecast48h {
    pub slots: Vec<ForecastPoint>,
    pub built_at: DateTime<Utc>,
    /// Empty when every input was fresh at build time
    pub degraded_reasons: BTreeSet<DegradedReason>,
}

impl Forecast48h {
    pub fn is_degraded(&self) -> bool {
        !self.degraded_reasons.is_empty()
    }

    /// Max storm probability across the next `hours` of slots.
    pub fn max_storm_prob_within(&self, hours: u32) -> f64 {
        let n = (hours as usize * 2).min(self.slots.len());
        self.slots[..n]
            .iter()
            .map(|s| s.storm_prob)
            .fold(0.0, f64::max)
    }
}
