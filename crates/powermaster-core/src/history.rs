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

use chrono::{DateTime, Datelike, Duration, Timelike, Utc};
use chrono_tz::Tz;
use std::collections::HashMap;

/// Days of telemetry required before predictions are trusted.
const MIN_HISTORY_DAYS: i64 = 7;

/// Rolling window the profile is built from.
const LOOKBACK_DAYS: i64 = 28;

/// Household load history, bucketed by local (weekday, half-hour).
///
/// Predictions are the rolling median of recorded load for the bucket,
/// which is robust against the occasional oven-and-kettle outlier that
/// skews a mean profile.
#[derive(Debug)]
pub struct LoadHistory {
    tz: Tz,
    /// (weekday 0-6, half-hour 0-47) -> recent samples
    buckets: HashMap<(u8, u8), Vec<(DateTime<Utc>, f64)>>,
    first_sample_at: Option<DateTime<Utc>>,
    last_sample_at: Option<DateTime<Utc>>,
}

fn bucket_key(tz: Tz, at: DateTime<Utc>) -> (u8, u8) {
    let local = at.with_timezone(&tz);
    let weekday = local.weekday().num_days_from_monday() as u8;
    let half_hour = (local.hour() * 2 + local.minute() / 30) as u8;
    (weekday, half_hour)
}

impl LoadHistory {
    pub fn new(tz: Tz) -> Self {
        Self {
            tz,
            buckets: HashMap::new(),
            first_sample_at: None,
            last_sample_at: None,
        }
    }

    /// Record an observed average load for an interval ending at `at`.
    pub fn record(&mut self, at: DateTime<Utc>, load_w: f64) {
        if load_w < 0.0 || !load_w.is_finite() {
            return;
        }
        let key = bucket_key(self.tz, at);
        self.buckets.entry(key).or_default().push((at, load_w));

        self.first_sample_at = Some(self.first_sample_at.map_or(at, |f| f.min(at)));
        self.last_sample_at = Some(self.last_sample_at.map_or(at, |l| l.max(at)));
        self.prune(at);
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = now - Duration::days(LOOKBACK_DAYS);
        for samples in self.buckets.values_mut() {
            samples.retain(|(at, _)| *at >= cutoff);
        }
    }

    /// Days spanned by recorded history.
    pub fn days_of_history(&self) -> i64 {
        match (self.first_sample_at, self.last_sample_at) {
            (Some(first), Some(last)) => (last - first).num_days(),
            _ => 0,
        }
    }

    pub fn has_enough_history(&self) -> bool {
        self.days_of_history() >= MIN_HISTORY_DAYS
    }

    /// Median recorded load for the bucket containing `at`, or `None`
    /// when history is too short to trust.
    pub fn predict(&self, at: DateTime<Utc>) -> Option<f64> {
        if !self.has_enough_history() {
            return None;
        }
        let samples = self.buckets.get(&bucket_key(self.tz, at))?;
        if samples.is_empty() {
            return None;
        }
        let mut values: Vec<f64> = samples.iter().map(|(_, v)| *v).collect();
        values.sort_by(|a, b| a.partial_cmp(b).expect("load samples are finite"));
        let mid = values.len() / 2;
        Some(if values.len() % 2 == 0 {
            (values[mid - 1] + values[mid]) / 2.0
        } else {
            values[mid]
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chrono_tz::UTC;

    fn monday_noon() -> DateTime<Utc> {
        // 2025-06-02 is a Monday
        Utc.with_ymd_and_hms(2025, 6, 2, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_no_prediction_until_week_of_history() {
        let mut h = LoadHistory::new(UTC);
        let t = monday_noon();
        for d in 0..5 {
            h.record(t + Duration::days(d), 800.0);
        }
        assert!(h.predict(t).is_none());
    }

    #[test]
    fn test_median_per_weekday_bucket() {
        let mut h = LoadHistory::new(UTC);
        let t = monday_noon();
        // Four Mondays at noon with one outlier week
        for (week, load) in [(0, 700.0), (1, 750.0), (2, 5000.0), (3, 720.0)] {
            h.record(t + Duration::weeks(week), load);
        }
        let predicted = h.predict(t + Duration::weeks(4)).unwrap();
        // Median of [700, 720, 750, 5000] = 735; the outlier is ignored
        assert!((predicted - 735.0).abs() < 1e-9);
    }

    #[test]
    fn test_buckets_are_weekday_specific() {
        let mut h = LoadHistory::new(UTC);
        let monday = monday_noon();
        let tuesday = monday + Duration::days(1);
        for week in 0..4 {
            h.record(monday + Duration::weeks(week), 600.0);
            h.record(tuesday + Duration::weeks(week), 1200.0);
        }
        assert!((h.predict(monday).unwrap() - 600.0).abs() < 1e-9);
        assert!((h.predict(tuesday).unwrap() - 1200.0).abs() < 1e-9);
    }

    #[test]
    fn test_old_samples_pruned() {
        let mut h = LoadHistory::new(UTC);
        let t = monday_noon();
        h.record(t, 9000.0);
        // Recording 6 weeks later prunes the original sample
        for week in 5..9 {
            h.record(t + Duration::weeks(week), 500.0);
        }
        let predicted = h.predict(t + Duration::weeks(9)).unwrap();
        assert!((predicted - 500.0).abs() < 1e-9);
    }
}
