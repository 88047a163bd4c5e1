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
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use powermaster_types::forecast::{SolarSample, StormWarning, WeatherSample};
use powermaster_types::inverter::{CommandResult, InverterCommand, Telemetry};
use powermaster_types::loads::LoadAction;
use powermaster_types::tariff::TariffPoint;

/// Result of a provider fetch. Degraded results carry the last known
/// data plus the reason, so the aggregator can keep serving snapshots
/// instead of dropping the field.
#[derive(Debug, Clone)]
pub enum ProviderResult<T> {
    Ok(T),
    Degraded { data: T, reason: String },
    Err(String),
}

impl<T> ProviderResult<T> {
    pub fn data(self) -> Option<T> {
        match self {
            Self::Ok(data) | Self::Degraded { data, .. } => Some(data),
            Self::Err(_) => None,
        }
    }

    pub fn is_err(&self) -> bool {
        matches!(self, Self::Err(_))
    }
}

/// A batch of provider samples with the instant the provider produced
/// them (not the instant we fetched them).
#[derive(Debug, Clone)]
pub struct ProviderBatch<T> {
    pub samples: Vec<T>,
    pub produced_at: DateTime<Utc>,
}

// ============= Hardware =============

/// Hardware adapter for the hybrid inverter.
///
/// The connection is exclusive; the command-writer worker serialises all
/// access through a single channel so implementations may assume no
/// concurrent calls.
#[async_trait]
pub trait InverterAdapter: Send + Sync {
    fn name(&self) -> &str;

    async fn connect(&self) -> Result<()>;

    async fn read_telemetry(&self) -> Result<Telemetry>;

    async fn set_mode(&self, command: &InverterCommand) -> Result<CommandResult>;
}

/// Driver for a controllable household load (relay, MQTT switch, ...).
#[async_trait]
pub trait LoadDriver: Send + Sync {
    fn load_name(&self) -> &str;

    async fn apply(&self, action: LoadAction) -> Result<()>;

    /// Poll the device; `Err` marks the load faulted (scheduler locks
    /// it out for the day).
    async fn is_on(&self) -> Result<bool>;
}

// ============= Providers =============

#[async_trait]
pub trait SolarProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch(&self) -> ProviderResult<ProviderBatch<SolarSample>>;
}

#[async_trait]
pub trait WeatherProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch(&self) -> ProviderResult<ProviderBatch<WeatherSample>>;
}

#[async_trait]
pub trait StormProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch(&self) -> ProviderResult<ProviderBatch<StormWarning>>;
}

#[async_trait]
pub trait TariffProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Current and forecast prices, ≥ 24 h forward where available.
    async fn fetch(&self) -> ProviderResult<ProviderBatch<TariffPoint>>;
}
