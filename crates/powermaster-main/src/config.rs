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

use std::path::Path;
use tracing::{info, warn};

use powermaster_types::config::{AppConfig, ConfigError};

/// Default config path, overridable with POWER_MASTER_CONFIG or the
/// first CLI argument.
pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

/// Load and validate the configuration.
///
/// An explicitly requested file that is missing is fatal; the default
/// path silently falls back to built-in defaults so a bare checkout
/// runs against the simulated hardware.
pub fn load_config(path: &str, explicit: bool) -> Result<AppConfig, ConfigError> {
    let config = if Path::new(path).exists() {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Parse(format!("{path}: {e}")))?;
        let config: AppConfig =
            toml::from_str(&raw).map_err(|e| ConfigError::Parse(format!("{path}: {e}")))?;
        info!(path = path, "configuration loaded");
        config
    } else if explicit {
        return Err(ConfigError::NotFound(path.to_string()));
    } else {
        warn!(path = path, "no config file found, using built-in defaults");
        AppConfig::default()
    };

    config.validate()?;
    Ok(config)
}
