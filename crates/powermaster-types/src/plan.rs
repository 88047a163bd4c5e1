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

use crate::inverter::OperatingMode;
use crate::slot::{slot_duration, slot_index};

/// Outcome of the planner run that produced a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Optimal,
    /// Incumbent solution from a solver that hit its budget
    Feasible,
    Infeasible,
    Timeout,
    /// Safe all-self-use plan emitted when the solver could not help
    Fallback,
}

impl PlanStatus {
    pub fn is_usable(&self) -> bool {
        matches!(self, Self::Optimal | Self::Feasible | Self::Fallback)
    }
}

/// A single 30-minute slot of the optimisation plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanSlot {
    pub slot_start: DateTime<Utc>,
    pub mode: OperatingMode,
    /// Planned battery charge power (W)
    pub charge_w: f64,
    /// Planned battery discharge power (W)
    pub discharge_w: f64,
    /// Expected SOC at the *end* of the slot
    pub expected_soc: f64,
    /// Deferrable loads scheduled into this slot
    pub scheduled_loads: BTreeSet<String>,
    pub import_c: f64,
    pub export_c: f64,
    pub solar_forecast_w: f64,
    pub load_forecast_w: f64,
}

/// Complete optimisation plan over the planning horizon.
///
/// Plans are immutable after build; the cache shares them as `Arc<Plan>`
/// and slots are never mutated in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub slots: Vec<PlanSlot>,
    pub built_at: DateTime<Utc>,
    pub horizon_end: DateTime<Utc>,
    pub forecast_hash: u64,
    pub tariff_hash: u64,
    /// Hash of the planner-relevant config parameters at build time
    pub params_hash: u64,
    pub battery_soc_at_build: f64,
    /// Objective value (cents) reported by the solver
    pub objective_cents: f64,
    pub status: PlanStatus,
    /// What caused this rebuild (periodic, soc_drift, tariff_change, ...)
    pub trigger: String,
    pub solver_time_ms: u64,
}

impl Plan {
    /// The slot covering `t`, if within the horizon.
    pub fn slot_at(&self, t: DateTime<Utc>) -> Option<&PlanSlot> {
        let start = self.slots.first()?.slot_start;
        slot_index(start, self.slots.len(), t).map(|i| &self.slots[i])
    }

    /// Expected SOC at `t`, linearly interpolated inside the covering
    /// slot. The slot's `expected_soc` is the end-of-slot value; the
    /// start-of-slot value is the previous slot's (or the SOC at build
    /// for the first slot).
    pub fn expected_soc_at(&self, t: DateTime<Utc>) -> Option<f64> {
        let start = self.slots.first()?.slot_start;
        let idx = slot_index(start, self.slots.len(), t)?;
        let slot = &self.slots[idx];

        let soc_start = if idx == 0 {
            self.battery_soc_at_build
        } else {
            self.slots[idx - 1].expected_soc
        };
        let soc_end = slot.expected_soc;

        let elapsed = (t - slot.slot_start).num_seconds() as f64;
        let total = slot_duration().num_seconds() as f64;
        let progress = (elapsed / total).clamp(0.0, 1.0);
        Some(soc_start + (soc_end - soc_start) * progress)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.horizon_end
    }
}
