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

use chrono::{DateTime, Duration, DurationRound, Utc};

/// Planning slot length in minutes. All time-indexed data is keyed by
/// the start of a half-open `[start, start + 30min)` interval aligned
/// to wall-clock half hours.
pub const SLOT_MINUTES: i64 = 30;

/// Number of slots in the 48-hour planning horizon.
pub const HORIZON_SLOTS: usize = 96;

/// Slot length as a chrono duration.
pub fn slot_duration() -> Duration {
    Duration::minutes(SLOT_MINUTES)
}

/// Align a timestamp down to the enclosing half-hour boundary.
pub fn floor_half_hour(t: DateTime<Utc>) -> DateTime<Utc> {
    t.duration_trunc(slot_duration())
        .expect("half-hour truncation is always in range")
}

/// True if `t` falls inside the slot starting at `slot_start`.
pub fn slot_contains(slot_start: DateTime<Utc>, t: DateTime<Utc>) -> bool {
    t >= slot_start && t < slot_start + slot_duration()
}

/// Index of the slot containing `t`, counted from `horizon_start`.
/// Returns `None` when `t` is before the horizon or past `n_slots`.
pub fn slot_index(horizon_start: DateTime<Utc>, n_slots: usize, t: DateTime<Utc>) -> Option<usize> {
    if t < horizon_start {
        return None;
    }
    let idx = ((t - horizon_start).num_minutes() / SLOT_MINUTES) as usize;
    (idx < n_slots).then_some(idx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_floor_half_hour() {
        let t = Utc.with_ymd_and_hms(2025, 6, 1, 14, 43, 17).unwrap();
        let floored = floor_half_hour(t);
        assert_eq!(floored, Utc.with_ymd_and_hms(2025, 6, 1, 14, 30, 0).unwrap());

        let exact = Utc.with_ymd_and_hms(2025, 6, 1, 14, 30, 0).unwrap();
        assert_eq!(floor_half_hour(exact), exact);
    }

    #[test]
    fn test_slot_contains_is_half_open() {
        let start = Utc.with_ymd_and_hms(2025, 6, 1, 14, 30, 0).unwrap();
        assert!(slot_contains(start, start));
        assert!(slot_contains(start, start + Duration::minutes(29)));
        assert!(!slot_contains(start, start + Duration::minutes(30)));
        assert!(!slot_contains(start, start - Duration::seconds(1)));
    }

    #[test]
    fn test_slot_index() {
        let start = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        assert_eq!(slot_index(start, 96, start), Some(0));
        assert_eq!(slot_index(start, 96, start + Duration::minutes(31)), Some(1));
        assert_eq!(slot_index(start, 96, start + Duration::hours(47)), Some(94));
        assert_eq!(slot_index(start, 96, start + Duration::hours(48)), None);
        assert_eq!(slot_index(start, 96, start - Duration::minutes(1)), None);
    }
}
