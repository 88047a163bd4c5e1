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
use std::collections::BTreeSet;
use std::hash::{Hash, Hasher};

use powermaster_types::config::ProvidersConfig;
use powermaster_types::forecast::{
    DegradedReason, Forecast48h, ForecastPoint, SolarSample, StormWarning, WeatherSample,
};
use powermaster_types::slot::{floor_half_hour, slot_duration, HORIZON_SLOTS};

use crate::history::LoadHistory;

/// Latest successful pull from one provider.
#[derive(Debug, Clone)]
struct ProviderState<T> {
    samples: Vec<T>,
    produced_at: DateTime<Utc>,
}

/// Merges solar, weather and storm feeds into 48-hour snapshots with
/// staleness metadata. Provider pollers update one field at a time;
/// `snapshot` never fails, it degrades.
#[derive(Debug, Default)]
pub struct ForecastAggregator {
    solar: Option<ProviderState<SolarSample>>,
    weather: Option<ProviderState<WeatherSample>>,
    storms: Option<ProviderState<StormWarning>>,
}

impl ForecastAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_solar(&mut self, samples: Vec<SolarSample>, produced_at: DateTime<Utc>) {
        let mut samples = samples;
        samples.sort_by_key(|s| s.at);
        self.solar = Some(ProviderState { samples, produced_at });
    }

    pub fn update_weather(&mut self, samples: Vec<WeatherSample>, produced_at: DateTime<Utc>) {
        let mut samples = samples;
        samples.sort_by_key(|s| s.at);
        self.weather = Some(ProviderState { samples, produced_at });
    }

    pub fn update_storms(&mut self, warnings: Vec<StormWarning>, produced_at: DateTime<Utc>) {
        self.storms = Some(ProviderState {
            samples: warnings,
            produced_at,
        });
    }

    pub fn solar_age_seconds(&self, now: DateTime<Utc>) -> Option<i64> {
        self.solar.as_ref().map(|s| (now - s.produced_at).num_seconds())
    }

    /// Build a 96-slot snapshot aligned forward from
    /// `floor_half_hour(now)`. Stale or missing providers degrade the
    /// snapshot instead of failing it.
    pub fn snapshot(
        &self,
        now: DateTime<Utc>,
        history: &LoadHistory,
        baseline_load_w: f64,
        providers: &ProvidersConfig,
    ) -> Forecast48h {
        let mut degraded = BTreeSet::new();

        match &self.solar {
            None => {
                degraded.insert(DegradedReason::SolarMissing);
            }
            Some(s) if (now - s.produced_at).num_seconds() > providers.solar.hard_ttl_s => {
                degraded.insert(DegradedReason::SolarStale);
            }
            Some(_) => {}
        }
        match &self.weather {
            None => {
                degraded.insert(DegradedReason::WeatherMissing);
            }
            Some(w) if (now - w.produced_at).num_seconds() > providers.weather.hard_ttl_s => {
                degraded.insert(DegradedReason::WeatherStale);
            }
            Some(_) => {}
        }
        if let Some(s) = &self.storms {
            if (now - s.produced_at).num_seconds() > providers.storm.hard_ttl_s {
                degraded.insert(DegradedReason::StormStale);
            }
        }
        if !history.has_enough_history() {
            degraded.insert(DegradedReason::LoadHistoryShort);
        }

        let horizon_start = floor_half_hour(now);
        let mut slots = Vec::with_capacity(HORIZON_SLOTS);
        for i in 0..HORIZON_SLOTS {
            let slot_start = horizon_start + slot_duration() * i as i32;
            let slot_end = slot_start + slot_duration();
            let midpoint = slot_start + slot_duration() / 2;

            let (p10, p50, p90) = self
                .solar
                .as_ref()
                .map(|s| interpolate_solar(&s.samples, midpoint))
                .unwrap_or((0.0, 0.0, 0.0));

            let load_w = history.predict(slot_start).unwrap_or(baseline_load_w);

            let mut point = ForecastPoint::new(
                slot_start,
                p10,
                p50,
                p90,
                load_w,
                self.solar.as_ref().map_or(now, |s| s.produced_at),
            );

            if let Some(weather) = &self.weather {
                if let Some(sample) = nearest_weather(&weather.samples, midpoint) {
                    point.temp_c = sample.temp_c;
                    point.cloud_frac = sample.cloud_frac;
                    point.wind_mps = sample.wind_mps;
                    point.rain_mm = sample.rain_mm;
                }
            }

            // Max probability across warnings touching this slot; two
            // disagreeing products simply both contribute
            if let Some(storms) = &self.storms {
                point.storm_prob = storms
                    .samples
                    .iter()
                    .filter(|w| w.intersects(slot_start, slot_end))
                    .map(|w| w.probability)
                    .fold(0.0, f64::max);
            }

            slots.push(point);
        }

        Forecast48h {
            slots,
            built_at: now,
            degraded_reasons: degraded,
        }
    }
}

/// Linear time-interpolation of the solar percentiles. Slots before the
/// first sample clamp to it; slots past the last sample read zero
/// (beyond the provider horizon).
fn interpolate_solar(samples: &[SolarSample], at: DateTime<Utc>) -> (f64, f64, f64) {
    if samples.is_empty() {
        return (0.0, 0.0, 0.0);
    }
    let first = &samples[0];
    if at <= first.at {
        return (first.p10_w, first.p50_w, first.p90_w);
    }
    let last = &samples[samples.len() - 1];
    if at > last.at {
        return (0.0, 0.0, 0.0);
    }
    let idx = samples.partition_point(|s| s.at < at);
    let hi = &samples[idx.min(samples.len() - 1)];
    if hi.at == at || idx == 0 {
        return (hi.p10_w, hi.p50_w, hi.p90_w);
    }
    let lo = &samples[idx - 1];
    let span = (hi.at - lo.at).num_seconds() as f64;
    if span <= 0.0 {
        return (hi.p10_w, hi.p50_w, hi.p90_w);
    }
    let frac = (at - lo.at).num_seconds() as f64 / span;
    let lerp = |a: f64, b: f64| a + (b - a) * frac;
    (
        lerp(lo.p10_w, hi.p10_w),
        lerp(lo.p50_w, hi.p50_w),
        lerp(lo.p90_w, hi.p90_w),
    )
}

fn nearest_weather(samples: &[WeatherSample], at: DateTime<Utc>) -> Option<&WeatherSample> {
    samples
        .iter()
        .min_by_key(|s| (s.at - at).num_seconds().abs())
}

/// Stable hash of a snapshot's planner-relevant content; part of plan
/// identity for the rebuild evaluator.
pub fn forecast_hash(forecast: &Forecast48h) -> u64 {
    let mut h = std::collections::hash_map::DefaultHasher::new();
    for slot in &forecast.slots {
        slot.slot_start.timestamp().hash(&mut h);
        slot.solar_p10_w.to_bits().hash(&mut h);
        slot.solar_p50_w.to_bits().hash(&mut h);
        slot.solar_p90_w.to_bits().hash(&mut h);
        slot.load_forecast_w.to_bits().hash(&mut h);
        slot.storm_prob.to_bits().hash(&mut h);
    }
    h.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use chrono_tz::UTC;

    fn solar_ramp(t0: DateTime<Utc>) -> Vec<SolarSample> {
        // Hourly samples ramping 0 → 4000 W
        (0..5)
            .map(|i| SolarSample {
                at: t0 + Duration::hours(i),
                p10_w: 500.0 * i as f64,
                p50_w: 800.0 * i as f64,
                p90_w: 1000.0 * i as f64,
            })
            .collect()
    }

    #[test]
    fn test_snapshot_is_96_aligned_slots() {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 9, 17, 0).unwrap();
        let agg = ForecastAggregator::new();
        let history = LoadHistory::new(UTC);
        let snap = agg.snapshot(now, &history, 500.0, &ProvidersConfig::default());
        assert_eq!(snap.slots.len(), 96);
        assert_eq!(
            snap.slots[0].slot_start,
            Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap()
        );
        assert_eq!(
            snap.slots[95].slot_start - snap.slots[0].slot_start,
            Duration::minutes(30 * 95)
        );
    }

    #[test]
    fn test_missing_providers_degrade_not_fail() {
        let now = Utc::now();
        let agg = ForecastAggregator::new();
        let history = LoadHistory::new(UTC);
        let snap = agg.snapshot(now, &history, 650.0, &ProvidersConfig::default());
        assert!(snap.degraded_reasons.contains(&DegradedReason::SolarMissing));
        assert!(snap.degraded_reasons.contains(&DegradedReason::WeatherMissing));
        assert!(snap.degraded_reasons.contains(&DegradedReason::LoadHistoryShort));
        // Baseline load fallback applies everywhere
        assert!(snap.slots.iter().all(|s| s.load_forecast_w == 650.0));
    }

    #[test]
    fn test_stale_solar_marked() {
        let now = Utc::now();
        let mut agg = ForecastAggregator::new();
        agg.update_solar(solar_ramp(now), now - Duration::hours(10));
        let history = LoadHistory::new(UTC);
        let snap = agg.snapshot(now, &history, 500.0, &ProvidersConfig::default());
        // Default solar hard TTL is 6 h
        assert!(snap.degraded_reasons.contains(&DegradedReason::SolarStale));
        // Data is still present though
        assert!(snap.slots.iter().any(|s| s.solar_p50_w > 0.0));
    }

    #[test]
    fn test_solar_interpolation_between_samples() {
        let t0 = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        let samples = solar_ramp(t0);
        // Halfway between hour 1 (800 W p50) and hour 2 (1600 W p50)
        let (p10, p50, p90) = interpolate_solar(&samples, t0 + Duration::minutes(90));
        assert!((p50 - 1200.0).abs() < 1e-6);
        assert!((p10 - 750.0).abs() < 1e-6);
        assert!((p90 - 1500.0).abs() < 1e-6);
        // Percentile ordering holds at interpolated points
        assert!(p10 <= p50 && p50 <= p90);
    }

    #[test]
    fn test_solar_zero_past_provider_horizon() {
        let t0 = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        let samples = solar_ramp(t0);
        let (p10, p50, p90) = interpolate_solar(&samples, t0 + Duration::hours(20));
        assert_eq!((p10, p50, p90), (0.0, 0.0, 0.0));
    }

    #[test]
    fn test_storm_probability_is_max_of_overlapping_warnings() {
        let now = floor_half_hour(Utc::now());
        let mut agg = ForecastAggregator::new();
        agg.update_storms(
            vec![
                StormWarning {
                    probability: 0.4,
                    description: "warning A".into(),
                    valid_from: now,
                    valid_to: now + Duration::hours(3),
                },
                StormWarning {
                    probability: 0.7,
                    description: "warning B".into(),
                    valid_from: now + Duration::hours(1),
                    valid_to: now + Duration::hours(2),
                },
            ],
            now,
        );
        let history = LoadHistory::new(UTC);
        let snap = agg.snapshot(now, &history, 500.0, &ProvidersConfig::default());
        // Slot inside both warnings takes the max
        assert!((snap.slots[2].storm_prob - 0.7).abs() < 1e-9);
        // Slot covered only by warning A
        assert!((snap.slots[5].storm_prob - 0.4).abs() < 1e-9);
        // Beyond both
        assert_eq!(snap.slots[10].storm_prob, 0.0);
    }

    #[test]
    fn test_forecast_hash_stability() {
        let now = floor_half_hour(Utc::now());
        let mut agg = ForecastAggregator::new();
        agg.update_solar(solar_ramp(now), now);
        let history = LoadHistory::new(UTC);
        let cfg = ProvidersConfig::default();
        let a = agg.snapshot(now, &history, 500.0, &cfg);
        let b = agg.snapshot(now, &history, 500.0, &cfg);
        assert_eq!(forecast_hash(&a), forecast_hash(&b));

        agg.update_solar(
            solar_ramp(now)
                .into_iter()
                .map(|mut s| {
                    s.p50_w += 1.0;
                    s
                })
                .collect(),
            now,
        );
        let c = agg.snapshot(now, &history, 500.0, &cfg);
        assert_ne!(forecast_hash(&a), forecast_hash(&c));
    }
}
