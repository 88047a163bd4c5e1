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

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============= Operation Modes =============

/// Hybrid inverter operating modes (vendor-agnostic).
///
/// Wire values match the register encoding used by the hardware
/// adapters, so they are stable and must not be reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum OperatingMode {
    /// PV first to load, then battery, then export
    #[default]
    SelfUse = 1,
    /// Self-use with the export cap forced to zero
    SelfUseZeroExport = 2,
    /// Import-to-battery at the commanded power
    ForceCharge = 3,
    /// Battery-to-grid at the commanded power
    ForceDischarge = 4,
    /// Charge from PV surplus only, never import
    ChargeNoImport = 5,
}

impl OperatingMode {
    /// Register value understood by the inverter drivers.
    pub fn wire_value(self) -> u16 {
        self as u16
    }

    pub fn from_wire_value(v: u16) -> Option<Self> {
        match v {
            1 => Some(Self::SelfUse),
            2 => Some(Self::SelfUseZeroExport),
            3 => Some(Self::ForceCharge),
            4 => Some(Self::ForceDischarge),
            5 => Some(Self::ChargeNoImport),
            _ => None,
        }
    }

    /// Get human-readable name for the mode
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::SelfUse => "Self-Use",
            Self::SelfUseZeroExport => "Self-Use (Zero Export)",
            Self::ForceCharge => "Force-Charge",
            Self::ForceDischarge => "Force-Discharge",
            Self::ChargeNoImport => "Charge (No Import)",
        }
    }

    /// Modes that hold the inverter under remote power control and time
    /// out at the device when commands stop arriving.
    pub fn needs_refresh(&self) -> bool {
        matches!(self, Self::ForceCharge | Self::ForceDischarge)
    }

    /// True when the mode commands battery charging.
    pub fn is_charging(&self) -> bool {
        matches!(self, Self::ForceCharge | Self::ChargeNoImport)
    }

    pub fn all() -> &'static [OperatingMode] {
        &[
            Self::SelfUse,
            Self::SelfUseZeroExport,
            Self::ForceCharge,
            Self::ForceDischarge,
            Self::ChargeNoImport,
        ]
    }
}

impl fmt::Display for OperatingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

impl FromStr for OperatingMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "self-use" => Ok(Self::SelfUse),
            "self-use-zero-export" => Ok(Self::SelfUseZeroExport),
            "force-charge" => Ok(Self::ForceCharge),
            "force-discharge" => Ok(Self::ForceDischarge),
            "charge-no-import" => Ok(Self::ChargeNoImport),
            _ => Err(anyhow::anyhow!("Unknown operating mode: '{s}'")),
        }
    }
}

// ============= Telemetry =============

/// Inverter fault flags as reported by the hardware adapter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultFlags(pub u32);

impl FaultFlags {
    pub const NONE: FaultFlags = FaultFlags(0);

    pub fn any(&self) -> bool {
        self.0 != 0
    }
}

/// Snapshot of inverter telemetry.
///
/// Sign conventions: `grid_w` positive = importing, negative = exporting;
/// `battery_w` positive = charging, negative = discharging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Telemetry {
    /// Battery state of charge (0.0 to 1.0)
    pub soc: f64,
    /// PV generation (W)
    pub solar_w: f64,
    /// Household load (W)
    pub load_w: f64,
    /// Grid power (W), positive = import
    pub grid_w: f64,
    /// Battery power (W), positive = charge
    pub battery_w: f64,
    /// Mode the inverter reports itself to be in
    pub inverter_mode: OperatingMode,
    /// Raw fault bits, zero when healthy
    pub fault_flags: FaultFlags,
    /// Whether the grid connection is live
    pub grid_available: bool,
    pub read_at: DateTime<Utc>,
}

impl Telemetry {
    pub fn soc_pct(&self) -> f64 {
        self.soc * 100.0
    }

    pub fn is_importing(&self) -> bool {
        self.grid_w > 0.0
    }

    pub fn is_exporting(&self) -> bool {
        self.grid_w < 0.0
    }

    pub fn is_charging(&self) -> bool {
        self.battery_w > 0.0
    }

    pub fn is_discharging(&self) -> bool {
        self.battery_w < 0.0
    }
}

// ============= Commands =============

/// Command to send to the inverter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InverterCommand {
    pub mode: OperatingMode,
    /// Absolute power (W); direction is determined by the mode.
    pub power_w: u32,
    /// Export cap (W); `None` leaves the device limit unchanged.
    pub export_cap_w: Option<u32>,
}

impl InverterCommand {
    pub fn self_use() -> Self {
        Self {
            mode: OperatingMode::SelfUse,
            power_w: 0,
            export_cap_w: None,
        }
    }
}

/// User-requested mode override. Enforced above the optimiser, below
/// safety; expires automatically.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UserOverride {
    pub mode: OperatingMode,
    pub power_w: Option<u32>,
    pub expires_at: DateTime<Utc>,
}

impl UserOverride {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    pub fn remaining_seconds(&self, now: DateTime<Utc>) -> i64 {
        (self.expires_at - now).num_seconds().max(0)
    }
}

/// Result of dispatching a command to the inverter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    pub success: bool,
    pub latency_ms: u32,
    pub message: String,
}

impl CommandResult {
    pub fn ok(latency_ms: u32) -> Self {
        Self {
            success: true,
            latency_ms,
            message: String::new(),
        }
    }

    pub fn fault(message: impl Into<String>) -> Self {
        Self {
            success: false,
            latency_ms: 0,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_wire_round_trip() {
        for mode in OperatingMode::all() {
            assert_eq!(OperatingMode::from_wire_value(mode.wire_value()), Some(*mode));
        }
        assert_eq!(OperatingMode::from_wire_value(0), None);
        assert_eq!(OperatingMode::from_wire_value(6), None);
    }

    #[test]
    fn test_mode_from_str() {
        assert_eq!(
            "force-charge".parse::<OperatingMode>().unwrap(),
            OperatingMode::ForceCharge
        );
        assert_eq!(
            "SELF_USE".parse::<OperatingMode>().unwrap(),
            OperatingMode::SelfUse
        );
        assert!("turbo".parse::<OperatingMode>().is_err());
    }

    #[test]
    fn test_refresh_modes() {
        assert!(OperatingMode::ForceCharge.needs_refresh());
        assert!(OperatingMode::ForceDischarge.needs_refresh());
        assert!(!OperatingMode::SelfUse.needs_refresh());
        assert!(!OperatingMode::ChargeNoImport.needs_refresh());
    }
}
