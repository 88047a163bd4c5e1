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

use chrono::{DateTime, Datelike, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Configuration of a controllable deferrable load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadDefinition {
    pub name: String,
    /// Rated power draw while running (W)
    pub power_w: u32,
    /// 1 = critical, 10 = fully deferrable
    pub priority_class: u8,
    pub min_runtime_min: u32,
    pub ideal_runtime_min: u32,
    pub max_runtime_min: u32,
    /// Earliest local start hour (0-23)
    pub earliest_h: u32,
    /// Latest local end hour (0-23); may wrap past midnight
    pub latest_h: u32,
    /// Days the load may run (empty = every day)
    #[serde(default)]
    pub days_of_week: HashSet<Weekday>,
    #[serde(default = "default_true")]
    pub prefer_solar: bool,
    #[serde(default)]
    pub allow_split_shifts: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl LoadDefinition {
    /// Validate runtime ordering and window sanity.
    pub fn validate(&self) -> Result<(), String> {
        if self.priority_class < 1 || self.priority_class > 10 {
            return Err(format!(
                "load '{}': priority_class {} outside 1..10",
                self.name, self.priority_class
            ));
        }
        if !(self.min_runtime_min <= self.ideal_runtime_min
            && self.ideal_runtime_min <= self.max_runtime_min)
        {
            return Err(format!(
                "load '{}': runtime bounds must satisfy min <= ideal <= max ({} <= {} <= {})",
                self.name, self.min_runtime_min, self.ideal_runtime_min, self.max_runtime_min
            ));
        }
        if self.earliest_h > 23 || self.latest_h > 23 {
            return Err(format!("load '{}': window hours outside 0..23", self.name));
        }
        if self.earliest_h == self.latest_h {
            return Err(format!(
                "load '{}': earliest and latest hours must differ (window is modulo 24)",
                self.name
            ));
        }
        Ok(())
    }

    /// Whether the load may run on the given local day.
    pub fn day_allowed(&self, weekday: Weekday) -> bool {
        self.days_of_week.is_empty() || self.days_of_week.contains(&weekday)
    }

    /// Whether a local hour falls inside `[earliest_h, latest_h)`,
    /// wrapping past midnight when earliest > latest.
    pub fn hour_in_window(&self, hour: u32) -> bool {
        if self.earliest_h < self.latest_h {
            hour >= self.earliest_h && hour < self.latest_h
        } else {
            hour >= self.earliest_h || hour < self.latest_h
        }
    }
}

/// Per-device scheduler state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoadState {
    #[default]
    Idle,
    Running,
    Completed,
    LockedOut,
}

/// Runtime tracking for one device, reset daily at local midnight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadRuntime {
    pub state: LoadState,
    pub runtime_minutes_today: f64,
    pub last_transition_at: DateTime<Utc>,
    /// Start of the current contiguous shift, while Running
    pub current_shift_start: Option<DateTime<Utc>>,
    /// Local day the counters belong to (days since CE), for midnight reset
    pub day_ordinal: i32,
}

impl LoadRuntime {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            state: LoadState::Idle,
            runtime_minutes_today: 0.0,
            last_transition_at: now,
            current_shift_start: None,
            day_ordinal: now.num_days_from_ce(),
        }
    }
}

/// Action the scheduler emits to a load driver. The scheduler never
/// exposes bare state to drivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadAction {
    TurnOn,
    TurnOff,
}
