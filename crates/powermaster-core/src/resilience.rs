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
use std::collections::HashMap;
use tracing::{info, warn};

use powermaster_types::inverter::{InverterCommand, OperatingMode};

// ============= Provider Health =============

/// Health state of a single external source.
#[derive(Debug, Clone, Serialize)]
pub struct SourceHealth {
    pub name: String,
    pub healthy: bool,
    pub configured: bool,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub last_error: String,
}

impl SourceHealth {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            healthy: true,
            configured: true,
            last_success: None,
            last_failure: None,
            consecutive_failures: 0,
            total_failures: 0,
            last_error: String::new(),
        }
    }

    pub fn data_age_seconds(&self, now: DateTime<Utc>) -> Option<i64> {
        self.last_success.map(|t| (now - t).num_seconds())
    }
}

/// Tracks health of all external sources (providers + inverter).
#[derive(Debug)]
pub struct HealthChecker {
    max_consecutive_failures: u32,
    sources: HashMap<String, SourceHealth>,
}

impl HealthChecker {
    pub fn new(max_consecutive_failures: u32) -> Self {
        Self {
            max_consecutive_failures,
            sources: HashMap::new(),
        }
    }

    pub fn register(&mut self, name: &str) {
        self.sources
            .insert(name.to_string(), SourceHealth::new(name));
    }

    pub fn record_success(&mut self, name: &str, now: DateTime<Utc>) {
        let s = self
            .sources
            .entry(name.to_string())
            .or_insert_with(|| SourceHealth::new(name));
        let was_unhealthy = !s.healthy;
        s.healthy = true;
        s.last_success = Some(now);
        s.consecutive_failures = 0;
        if was_unhealthy {
            info!(source = name, "source recovered");
        }
    }

    pub fn record_failure(&mut self, name: &str, error: &str, now: DateTime<Utc>) {
        let max = self.max_consecutive_failures;
        let s = self
            .sources
            .entry(name.to_string())
            .or_insert_with(|| SourceHealth::new(name));
        s.last_failure = Some(now);
        s.consecutive_failures += 1;
        s.total_failures += 1;
        s.last_error = error.to_string();
        if s.consecutive_failures >= max && s.healthy {
            s.healthy = false;
            warn!(
                source = name,
                failures = s.consecutive_failures,
                error = error,
                "source marked unhealthy"
            );
        }
    }

    pub fn is_healthy(&self, name: &str) -> bool {
        self.sources.get(name).map_or(true, |s| s.healthy)
    }

    pub fn unhealthy(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .sources
            .values()
            .filter(|s| !s.healthy)
            .map(|s| s.name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn all(&self) -> Vec<SourceHealth> {
        let mut all: Vec<SourceHealth> = self.sources.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }
}

// ============= Degradation Levels =============

/// System degradation levels, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResilienceLevel {
    Normal,
    DegradedForecast,
    DegradedTariff,
    SafeMode,
    DegradedHardware,
}

/// Map unhealthy sources to a degradation level.
pub fn determine_level(unhealthy: &[String]) -> ResilienceLevel {
    if unhealthy.is_empty() {
        return ResilienceLevel::Normal;
    }
    let has = |n: &str| unhealthy.iter().any(|u| u == n);
    let has_forecast = has("solar") || has("weather");

    if has("inverter") {
        ResilienceLevel::DegradedHardware
    } else if has("tariff") && has_forecast {
        ResilienceLevel::SafeMode
    } else if has("tariff") {
        ResilienceLevel::DegradedTariff
    } else {
        ResilienceLevel::DegradedForecast
    }
}

impl ResilienceLevel {
    /// Arbitrage (opportunistic discharge and the planner's cycle
    /// reward) needs trustworthy prices.
    pub fn arbitrage_allowed(&self) -> bool {
        matches!(self, Self::Normal | Self::DegradedForecast)
    }
}

/// Safe preset command for a degradation level.
pub fn fallback_command(level: ResilienceLevel) -> InverterCommand {
    match level {
        ResilienceLevel::Normal | ResilienceLevel::DegradedForecast | ResilienceLevel::DegradedTariff => {
            InverterCommand::self_use()
        }
        // Multiple failures: preserve the battery, stop exporting
        ResilienceLevel::SafeMode => InverterCommand {
            mode: OperatingMode::SelfUseZeroExport,
            power_w: 0,
            export_cap_w: Some(0),
        },
        // Can't talk to the inverter; self-use is what it reverts to
        ResilienceLevel::DegradedHardware => InverterCommand::self_use(),
    }
}
