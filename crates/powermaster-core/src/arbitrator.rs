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
use serde::Serialize;

use powermaster_types::config::{ArbitrageConfig, BatteryConfig, StormConfig};
use powermaster_types::inverter::{OperatingMode, Telemetry, UserOverride};
use powermaster_types::plan::PlanSlot;
use powermaster_types::tariff::TariffPoint;

/// Charge rate fraction used by the SOC-floor recovery charge.
const SOC_FLOOR_CHARGE_FRACTION: f64 = 0.25;

/// Which level of the control hierarchy produced a decision.
/// Declaration order is priority order; ties break toward the earlier
/// variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionSource {
    Safety,
    Storm,
    SocFloor,
    Override,
    Plan,
    Opportunistic,
    Default,
}

/// The arbitrated command for this tick.
#[derive(Debug, Clone, Serialize)]
pub struct Decision {
    pub target_mode: OperatingMode,
    pub power_w: u32,
    pub export_cap_w: Option<u32>,
    pub source: DecisionSource,
    pub rationale: String,
}

/// Everything the arbitrator looks at. Pure data in, decision out.
#[derive(Debug, Clone)]
pub struct ArbitratorInputs<'a> {
    pub now: DateTime<Utc>,
    pub telemetry: &'a Telemetry,
    /// Max storm probability within the configured look-ahead window
    pub storm_probability: f64,
    pub plan_slot: Option<&'a PlanSlot>,
    pub user_override: Option<&'a UserOverride>,
    pub tariff_now: Option<&'a TariffPoint>,
    /// Spike detector state (with hysteresis applied)
    pub spike_active: bool,
    /// False when the resilience manager has disabled arbitrage
    pub arbitrage_allowed: bool,
    pub battery: &'a BatteryConfig,
    pub storm: &'a StormConfig,
    pub arbitrage: &'a ArbitrageConfig,
}

/// Evaluate the control hierarchy, highest priority first. The first
/// level whose condition holds wins; the winning level is reported as
/// `source`.
pub fn decide(inputs: &ArbitratorInputs) -> Decision {
    let soc = inputs.telemetry.soc;
    let battery = inputs.battery;

    // 1. SAFETY
    if inputs.telemetry.fault_flags.any() {
        return Decision {
            target_mode: OperatingMode::SelfUse,
            power_w: 0,
            export_cap_w: Some(0),
            source: DecisionSource::Safety,
            rationale: format!("inverter fault flags 0x{:08x}", inputs.telemetry.fault_flags.0),
        };
    }
    if soc < battery.soc_min_hard {
        return Decision {
            target_mode: OperatingMode::SelfUse,
            power_w: 0,
            export_cap_w: Some(0),
            source: DecisionSource::Safety,
            rationale: format!(
                "soc {:.1}% below hard minimum {:.1}%",
                soc * 100.0,
                battery.soc_min_hard * 100.0
            ),
        };
    }
    if soc > battery.soc_max {
        return Decision {
            target_mode: OperatingMode::SelfUse,
            power_w: 0,
            export_cap_w: None,
            source: DecisionSource::Safety,
            rationale: format!(
                "soc {:.1}% above maximum {:.1}%, export unrestricted",
                soc * 100.0,
                battery.soc_max * 100.0
            ),
        };
    }

    // 2. STORM
    if inputs.storm.enabled
        && inputs.storm_probability >= inputs.storm.probability_threshold
        && soc < inputs.storm.reserve_soc
    {
        return Decision {
            target_mode: OperatingMode::ForceCharge,
            power_w: inputs.storm.charge_w,
            export_cap_w: None,
            source: DecisionSource::Storm,
            rationale: format!(
                "storm probability {:.0}% >= {:.0}%, building reserve to {:.0}%",
                inputs.storm_probability * 100.0,
                inputs.storm.probability_threshold * 100.0,
                inputs.storm.reserve_soc * 100.0
            ),
        };
    }

    // 3. SOC_FLOOR: recover the soft floor at a gentle rate, but not
    // while an import spike is running
    if soc < battery.soc_min_soft && !inputs.spike_active {
        let power_w = (f64::from(battery.max_charge_w) * SOC_FLOOR_CHARGE_FRACTION) as u32;
        return Decision {
            target_mode: OperatingMode::ForceCharge,
            power_w,
            export_cap_w: None,
            source: DecisionSource::SocFloor,
            rationale: format!(
                "soc {:.1}% below soft floor {:.1}%",
                soc * 100.0,
                battery.soc_min_soft * 100.0
            ),
        };
    }

    // 4. OVERRIDE
    if let Some(ov) = inputs.user_override {
        if ov.is_active(inputs.now) {
            return Decision {
                target_mode: ov.mode,
                power_w: ov.power_w.unwrap_or(0),
                export_cap_w: (ov.mode == OperatingMode::SelfUseZeroExport).then_some(0),
                source: DecisionSource::Override,
                rationale: format!(
                    "user override, {}s remaining",
                    ov.remaining_seconds(inputs.now)
                ),
            };
        }
    }

    // 5/6. PLAN with the opportunistic upgrade
    if let Some(slot) = inputs.plan_slot {
        if slot.mode == OperatingMode::SelfUse {
            if let Some(opportunistic) = check_opportunistic(inputs, soc) {
                return opportunistic;
            }
        }
        return decision_from_slot(slot);
    }

    // 6. OPPORTUNISTIC without a plan
    if let Some(opportunistic) = check_opportunistic(inputs, soc) {
        return opportunistic;
    }

    // 7. DEFAULT
    Decision {
        target_mode: OperatingMode::SelfUse,
        power_w: 0,
        export_cap_w: None,
        source: DecisionSource::Default,
        rationale: "no plan available".into(),
    }
}

fn check_opportunistic(inputs: &ArbitratorInputs, soc: f64) -> Option<Decision> {
    if !inputs.arbitrage_allowed {
        return None;
    }
    let tariff = inputs.tariff_now?;
    if tariff.export_c >= inputs.arbitrage.spike_threshold_c
        && soc >= inputs.arbitrage.opportunistic_min_soc
    {
        return Some(Decision {
            target_mode: OperatingMode::ForceDischarge,
            power_w: inputs.arbitrage.opportunistic_w,
            export_cap_w: None,
            source: DecisionSource::Opportunistic,
            rationale: format!(
                "export price {:.0}c >= spike threshold {:.0}c, soc {:.1}%",
                tariff.export_c,
                inputs.arbitrage.spike_threshold_c,
                soc * 100.0
            ),
        });
    }
    None
}

fn decision_from_slot(slot: &PlanSlot) -> Decision {
    let power_w = match slot.mode {
        OperatingMode::ForceCharge | OperatingMode::ChargeNoImport => slot.charge_w.max(0.0) as u32,
        OperatingMode::ForceDischarge => slot.discharge_w.max(0.0) as u32,
        OperatingMode::SelfUse | OperatingMode::SelfUseZeroExport => 0,
    };
    Decision {
        target_mode: slot.mode,
        power_w,
        export_cap_w: (slot.mode == OperatingMode::SelfUseZeroExport).then_some(0),
        source: DecisionSource::Plan,
        rationale: format!("plan slot {}", slot.slot_start.format("%H:%M")),
    }
}
