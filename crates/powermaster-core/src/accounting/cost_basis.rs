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

use serde::Serialize;
use tracing::debug;

/// Current weighted-average-cost-basis tracking state.
#[derive(Debug, Clone, Serialize)]
pub struct WacbState {
    /// Weighted average cost basis (c/kWh)
    pub wacb_c: f64,
    /// Energy currently stored (Wh), kept in sync with soc × capacity
    pub stored_wh: f64,
    pub total_charged_wh: f64,
    pub total_cost_cents: f64,
}

/// Tracks the average cost per kWh of the energy in the battery.
///
/// Grid charging enters at the import rate; PV charging enters at the
/// feed-in rate (the export revenue forgone). Discharge removes energy
/// without changing the average.
#[derive(Debug)]
pub struct CostBasisTracker {
    capacity_wh: f64,
    state: WacbState,
}

impl CostBasisTracker {
    pub fn new(capacity_wh: f64, initial_soc: f64, initial_wacb_c: f64) -> Self {
        Self {
            capacity_wh,
            state: WacbState {
                wacb_c: initial_wacb_c,
                stored_wh: (initial_soc * capacity_wh).clamp(0.0, capacity_wh),
                total_charged_wh: 0.0,
                total_cost_cents: 0.0,
            },
        }
    }

    pub fn state(&self) -> &WacbState {
        &self.state
    }

    pub fn wacb_c(&self) -> f64 {
        self.state.wacb_c
    }

    pub fn stored_wh(&self) -> f64 {
        self.state.stored_wh
    }

    /// Value of the energy currently stored (cents).
    pub fn stored_value_cents(&self) -> f64 {
        self.state.stored_wh / 1000.0 * self.state.wacb_c
    }

    /// Record charged energy at the given rate and fold it into the
    /// average.
    pub fn record_charge(&mut self, energy_wh: f64, rate_c: f64) {
        if energy_wh <= 0.0 {
            return;
        }
        let prev_kwh = self.state.stored_wh / 1000.0;
        let prev_cost = prev_kwh * self.state.wacb_c;
        let add_kwh = energy_wh / 1000.0;
        let add_cost = add_kwh * rate_c;

        let new_kwh = prev_kwh + add_kwh;
        if new_kwh > 0.0 {
            self.state.wacb_c = (prev_cost + add_cost) / new_kwh;
        }
        self.state.stored_wh = (new_kwh * 1000.0).clamp(0.0, self.capacity_wh);
        self.state.total_charged_wh += energy_wh;
        self.state.total_cost_cents += add_cost;

        debug!(
            charged_wh = energy_wh,
            rate_c = rate_c,
            wacb_c = self.state.wacb_c,
            stored_wh = self.state.stored_wh,
            "wacb updated"
        );
    }

    /// Record discharged energy; returns its cost basis in cents.
    /// The average cost of the remaining energy is unchanged.
    pub fn record_discharge(&mut self, energy_wh: f64) -> f64 {
        if energy_wh <= 0.0 {
            return 0.0;
        }
        let cost_basis = energy_wh / 1000.0 * self.state.wacb_c;
        self.state.stored_wh = (self.state.stored_wh - energy_wh).clamp(0.0, self.capacity_wh);
        cost_basis
    }

    /// Correct tracked energy from an actual SOC reading. Called every
    /// tick so `stored_wh == soc × capacity` at observed points.
    pub fn sync_soc(&mut self, soc: f64) {
        self.state.stored_wh = (soc * self.capacity_wh).clamp(0.0, self.capacity_wh);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wacb_weighted_average() {
        let mut t = CostBasisTracker::new(10_000.0, 0.0, 0.0);
        t.record_charge(2_000.0, 10.0); // 2 kWh @ 10c
        assert!((t.wacb_c() - 10.0).abs() < 1e-9);
        t.record_charge(2_000.0, 30.0); // 2 kWh @ 30c
        assert!((t.wacb_c() - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_discharge_keeps_wacb() {
        let mut t = CostBasisTracker::new(10_000.0, 0.0, 0.0);
        t.record_charge(4_000.0, 25.0);
        let basis = t.record_discharge(1_000.0);
        assert!((basis - 25.0).abs() < 1e-9);
        assert!((t.wacb_c() - 25.0).abs() < 1e-9);
        assert!((t.stored_wh() - 3_000.0).abs() < 1e-9);
    }

    #[test]
    fn test_stored_clamped_to_capacity() {
        let mut t = CostBasisTracker::new(5_000.0, 0.9, 15.0);
        t.record_charge(2_000.0, 20.0);
        assert!(t.stored_wh() <= 5_000.0);
        t.record_discharge(50_000.0);
        assert!(t.stored_wh() >= 0.0);
    }

    #[test]
    fn test_sync_soc() {
        let mut t = CostBasisTracker::new(10_000.0, 0.5, 12.0);
        t.sync_soc(0.8);
        assert!((t.stored_wh() - 8_000.0).abs() < 1e-9);
        // WACB survives the sync
        assert!((t.wacb_c() - 12.0).abs() < 1e-9);
    }
}
