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
use tracing::{info, warn};

use powermaster_types::config::StormConfig;

/// Target reserve SOC for a given storm probability. Step function:
/// the configured reserve above the threshold, zero below.
pub fn reserve_soc_for(probability: f64, config: &StormConfig) -> f64 {
    if !config.enabled {
        return 0.0;
    }
    if probability >= config.probability_threshold {
        config.reserve_soc
    } else {
        0.0
    }
}

/// Hours the battery can carry the average load from the current SOC.
pub fn estimate_hours_of_autonomy(current_soc: f64, avg_load_w: f64, capacity_wh: f64) -> f64 {
    if avg_load_w <= 0.0 || current_soc <= 0.0 {
        return 0.0;
    }
    current_soc * capacity_wh / avg_load_w
}

/// Current storm reserve state.
#[derive(Debug, Clone, Default)]
pub struct StormState {
    pub probability: f64,
    pub is_active: bool,
    pub reserve_soc: f64,
    pub activated_at: Option<DateTime<Utc>>,
    pub deactivated_at: Option<DateTime<Utc>>,
    pub transition_count: u32,
}

/// Tracks storm probability and reserve activation transitions.
#[derive(Debug)]
pub struct StormMonitor {
    config: StormConfig,
    state: StormState,
}

impl StormMonitor {
    pub fn new(config: StormConfig) -> Self {
        Self {
            config,
            state: StormState::default(),
        }
    }

    pub fn state(&self) -> &StormState {
        &self.state
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active
    }

    pub fn reserve_soc(&self) -> f64 {
        self.state.reserve_soc
    }

    pub fn update_config(&mut self, config: StormConfig) {
        self.config = config;
    }

    /// Update with the latest probability; returns true when the
    /// active/inactive state transitioned.
    pub fn update(&mut self, probability: f64, now: DateTime<Utc>) -> bool {
        self.state.probability = probability;
        let reserve = reserve_soc_for(probability, &self.config);
        self.state.reserve_soc = reserve;

        let now_active = reserve > 0.0;
        if now_active && !self.state.is_active {
            self.state.is_active = true;
            self.state.activated_at = Some(now);
            self.state.transition_count += 1;
            warn!(
                probability = probability,
                reserve_soc = reserve,
                "storm reserve activated"
            );
            return true;
        }
        if !now_active && self.state.is_active {
            self.state.is_active = false;
            self.state.deactivated_at = Some(now);
            self.state.transition_count += 1;
            info!(probability = probability, "storm reserve deactivated");
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> StormConfig {
        StormConfig {
            enabled: true,
            probability_threshold: 0.5,
            reserve_soc: 0.60,
            charge_w: 4000,
            horizon_hours: 24,
        }
    }

    #[test]
    fn test_reserve_step_function() {
        let c = config();
        assert_eq!(reserve_soc_for(0.49, &c), 0.0);
        assert_eq!(reserve_soc_for(0.5, &c), 0.60);
        assert_eq!(reserve_soc_for(0.9, &c), 0.60);
    }

    #[test]
    fn test_disabled_never_reserves() {
        let mut c = config();
        c.enabled = false;
        assert_eq!(reserve_soc_for(0.9, &c), 0.0);
    }

    #[test]
    fn test_transition_tracking() {
        let mut m = StormMonitor::new(config());
        let now = Utc::now();
        assert!(m.update(0.7, now));
        assert!(m.is_active());
        assert!(!m.update(0.8, now)); // still active, no transition
        assert!(m.update(0.2, now));
        assert!(!m.is_active());
        assert_eq!(m.state().transition_count, 2);
    }
}
