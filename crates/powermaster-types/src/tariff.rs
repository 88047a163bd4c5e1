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

/// Single 30-minute slot of tariff data.
///
/// `import_c` may be negative (negative wholesale price intervals).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TariffPoint {
    pub slot_start: DateTime<Utc>,
    /// Import price (c/kWh), all fees included
    pub import_c: f64,
    /// Export / feed-in price (c/kWh)
    pub export_c: f64,
    /// True iff `import_c >= spike_threshold_c` at ingestion time
    pub spike_flag: bool,
}

impl TariffPoint {
    pub fn new(slot_start: DateTime<Utc>, import_c: f64, export_c: f64) -> Self {
        Self {
            slot_start,
            import_c,
            export_c,
            spike_flag: false,
        }
    }

    pub fn with_spike_threshold(mut self, spike_threshold_c: f64) -> Self {
        self.spike_flag = self.import_c >= spike_threshold_c;
        self
    }
}

/// Classify a tariff point for logging and UI display.
pub fn classify(point: &TariffPoint, spike_threshold_c: f64) -> &'static str {
    if point.import_c >= spike_threshold_c {
        "spike"
    } else if point.import_c < 0.0 {
        "negative"
    } else if point.import_c < 10.0 {
        "off-peak"
    } else if point.import_c < 30.0 {
        "shoulder"
    } else {
        "peak"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn point(import_c: f64) -> TariffPoint {
        let t = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        TariffPoint::new(t, import_c, import_c * 0.8)
    }

    #[test]
    fn test_spike_flag_threshold() {
        assert!(point(100.0).with_spike_threshold(100.0).spike_flag);
        assert!(point(150.0).with_spike_threshold(100.0).spike_flag);
        assert!(!point(99.9).with_spike_threshold(100.0).spike_flag);
    }

    #[test]
    fn test_classification() {
        assert_eq!(classify(&point(-5.0), 100.0), "negative");
        assert_eq!(classify(&point(5.0), 100.0), "off-peak");
        assert_eq!(classify(&point(20.0), 100.0), "shoulder");
        assert_eq!(classify(&point(50.0), 100.0), "peak");
        assert_eq!(classify(&point(120.0), 100.0), "spike");
    }
}
