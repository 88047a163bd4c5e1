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

use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use tracing::{info, warn};

use powermaster_types::slot::floor_half_hour;
use powermaster_types::tariff::TariffPoint;

/// How much history the series retains.
const HISTORY_HOURS: i64 = 48;

/// Fraction of the spike threshold the price must drop below before an
/// active spike ends.
const SPIKE_EXIT_FRACTION: f64 = 0.9;

// ============= Series =============

/// Tariff points keyed by slot start: the last 48 h of history plus the
/// provider's forward forecast (≥ 24 h when the provider is healthy).
#[derive(Debug, Default)]
pub struct TariffSeries {
    points: BTreeMap<DateTime<Utc>, TariffPoint>,
    pub last_update: Option<DateTime<Utc>>,
}

impl TariffSeries {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a provider batch. Newer data for a slot replaces older.
    pub fn ingest(&mut self, points: Vec<TariffPoint>, spike_threshold_c: f64, now: DateTime<Utc>) {
        for p in points {
            let aligned = floor_half_hour(p.slot_start);
            let mut point = p;
            point.slot_start = aligned;
            point.spike_flag = point.import_c >= spike_threshold_c;
            self.points.insert(aligned, point);
        }
        let cutoff = now - Duration::hours(HISTORY_HOURS);
        self.points = self.points.split_off(&cutoff);
        self.last_update = Some(now);
    }

    pub fn get(&self, slot_start: DateTime<Utc>) -> Option<&TariffPoint> {
        self.points.get(&floor_half_hour(slot_start))
    }

    /// Point covering `t` (t need not be slot-aligned).
    pub fn at(&self, t: DateTime<Utc>) -> Option<&TariffPoint> {
        self.get(floor_half_hour(t))
    }

    pub fn range(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<TariffPoint> {
        self.points
            .range(floor_half_hour(from)..to)
            .map(|(_, p)| *p)
            .collect()
    }

    /// Hours of forward coverage from `now`.
    pub fn forward_coverage_hours(&self, now: DateTime<Utc>) -> i64 {
        match self.points.keys().next_back() {
            Some(last) => ((*last + Duration::minutes(30)) - now).num_hours().max(0),
            None => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Stable hash over the forward-looking points; part of plan identity.
    pub fn forward_hash(&self, now: DateTime<Utc>) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        for (start, p) in self.points.range(floor_half_hour(now)..) {
            start.timestamp().hash(&mut hasher);
            p.import_c.to_bits().hash(&mut hasher);
            p.export_c.to_bits().hash(&mut hasher);
        }
        hasher.finish()
    }
}

// ============= Spike Detection =============

/// A detected import-price spike event.
#[derive(Debug, Clone)]
pub struct SpikeEvent {
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub peak_price_c: f64,
    pub slots_affected: u32,
}

/// Spike detection with entry/exit hysteresis.
///
/// Enters when the current slot's import price reaches the threshold;
/// once active, stays active until a slot prices below 0.9 × threshold.
#[derive(Debug)]
pub struct SpikeDetector {
    threshold_c: f64,
    current: Option<SpikeEvent>,
    history: Vec<SpikeEvent>,
    last_counted_slot: Option<DateTime<Utc>>,
}

impl SpikeDetector {
    pub fn new(threshold_c: f64) -> Self {
        Self {
            threshold_c,
            current: None,
            history: Vec::new(),
            last_counted_slot: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.current.is_some()
    }

    pub fn current_event(&self) -> Option<&SpikeEvent> {
        self.current.as_ref()
    }

    pub fn history(&self) -> &[SpikeEvent] {
        &self.history
    }

    /// Evaluate against the current slot price. Returns true when the
    /// active/inactive state transitioned.
    pub fn evaluate(&mut self, series: &TariffSeries, now: DateTime<Utc>) -> bool {
        let Some(point) = series.at(now).copied() else {
            // No price data: end any active spike rather than ride it blind
            return self.end_spike(now);
        };

        if self.current.is_none() {
            if point.import_c >= self.threshold_c {
                warn!(
                    price_c = point.import_c,
                    threshold_c = self.threshold_c,
                    "price spike detected"
                );
                self.current = Some(SpikeEvent {
                    started_at: now,
                    ended_at: None,
                    peak_price_c: point.import_c,
                    slots_affected: 1,
                });
                self.last_counted_slot = Some(point.slot_start);
                return true;
            }
            return false;
        }

        if point.import_c < self.threshold_c * SPIKE_EXIT_FRACTION {
            return self.end_spike(now);
        }

        // Ongoing: prices in [0.9·threshold, ∞) keep the spike active
        let event = self.current.as_mut().expect("active spike checked above");
        event.peak_price_c = event.peak_price_c.max(point.import_c);
        if self.last_counted_slot != Some(point.slot_start) {
            event.slots_affected += 1;
            self.last_counted_slot = Some(point.slot_start);
        }
        false
    }

    fn end_spike(&mut self, now: DateTime<Utc>) -> bool {
        if let Some(mut event) = self.current.take() {
            event.ended_at = Some(now);
            info!(
                peak_c = event.peak_price_c,
                slots = event.slots_affected,
                "price spike ended"
            );
            self.history.push(event);
            self.last_counted_slot = None;
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn series_with(prices: &[(i64, f64)]) -> (TariffSeries, DateTime<Utc>) {
        let t0 = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        let mut s = TariffSeries::new();
        let points = prices
            .iter()
            .map(|(i, import_c)| TariffPoint::new(t0 + Duration::minutes(30 * i), *import_c, 8.0))
            .collect();
        s.ingest(points, 100.0, t0);
        (s, t0)
    }

    #[test]
    fn test_get_aligns_to_slot() {
        let (s, t0) = series_with(&[(0, 20.0), (1, 30.0)]);
        assert_eq!(s.at(t0 + Duration::minutes(17)).unwrap().import_c, 20.0);
        assert_eq!(s.at(t0 + Duration::minutes(31)).unwrap().import_c, 30.0);
        assert!(s.at(t0 + Duration::hours(2)).is_none());
    }

    #[test]
    fn test_spike_entry_and_hysteresis_exit() {
        let (s, t0) = series_with(&[(0, 120.0), (1, 95.0), (2, 85.0)]);
        let mut d = SpikeDetector::new(100.0);

        // Slot 0: 120 >= 100: spike starts
        assert!(d.evaluate(&s, t0));
        assert!(d.is_active());

        // Slot 1: 95 is inside the hysteresis band [90, 100): still active
        assert!(!d.evaluate(&s, t0 + Duration::minutes(30)));
        assert!(d.is_active());

        // Slot 2: 85 < 90: spike ends
        assert!(d.evaluate(&s, t0 + Duration::minutes(60)));
        assert!(!d.is_active());
        assert_eq!(d.history().len(), 1);
        assert_eq!(d.history()[0].slots_affected, 2);
        assert!((d.history()[0].peak_price_c - 120.0).abs() < 1e-9);
    }

    #[test]
    fn test_no_spike_below_threshold() {
        let (s, t0) = series_with(&[(0, 99.0)]);
        let mut d = SpikeDetector::new(100.0);
        assert!(!d.evaluate(&s, t0));
        assert!(!d.is_active());
    }

    #[test]
    fn test_forward_hash_changes_with_prices() {
        let (a, t0) = series_with(&[(0, 20.0), (1, 30.0)]);
        let (b, _) = series_with(&[(0, 20.0), (1, 31.0)]);
        assert_ne!(a.forward_hash(t0), b.forward_hash(t0));
        let (c, _) = series_with(&[(0, 20.0), (1, 30.0)]);
        assert_eq!(a.forward_hash(t0), c.forward_hash(t0));
    }

    #[test]
    fn test_history_pruned_to_48h() {
        let t0 = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        let mut s = TariffSeries::new();
        s.ingest(vec![TariffPoint::new(t0, 20.0, 8.0)], 100.0, t0);
        // Ingest three days later: the old point falls out of the window
        let later = t0 + Duration::days(3);
        s.ingest(vec![TariffPoint::new(later, 25.0, 8.0)], 100.0, later);
        assert!(s.get(t0).is_none());
        assert!(s.get(later).is_some());
    }
}
