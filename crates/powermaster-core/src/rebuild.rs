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

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use powermaster_types::config::PlanningConfig;
use powermaster_types::plan::{Plan, PlanStatus};

/// Inputs the evaluator compares against the cached plan.
#[derive(Debug, Clone, Copy)]
pub struct RebuildInputs<'a> {
    pub now: DateTime<Utc>,
    pub current_soc: f64,
    pub latest_forecast_hash: u64,
    pub latest_tariff_hash: u64,
    pub latest_params_hash: u64,
    /// True on the tick where a user override lapsed
    pub override_just_expired: bool,
    pub plan: Option<&'a Plan>,
}

/// Decides when the cached plan is stale. Rebuilds themselves are
/// serialised by the planner worker; this only answers "should we".
#[derive(Debug)]
pub struct RebuildEvaluator {
    max_age: Duration,
    soc_drift_threshold: f64,
    retry_backoff: Duration,
    last_attempt_at: Option<DateTime<Utc>>,
}

impl RebuildEvaluator {
    pub fn new(planning: &PlanningConfig) -> Self {
        Self {
            max_age: Duration::seconds(planning.max_plan_age_s),
            soc_drift_threshold: planning.soc_drift_threshold,
            retry_backoff: Duration::seconds(planning.retry_backoff_s),
            last_attempt_at: None,
        }
    }

    /// Record that a rebuild was kicked off, for retry back-off.
    pub fn mark_attempt(&mut self, at: DateTime<Utc>) {
        self.last_attempt_at = Some(at);
    }

    /// Returns the trigger reason when a rebuild is due.
    pub fn evaluate(&self, inputs: &RebuildInputs) -> Option<String> {
        let Some(plan) = inputs.plan else {
            return Some("initial".into());
        };

        if inputs.override_just_expired {
            return Some("override_expired".into());
        }

        if inputs.now >= plan.built_at + self.max_age {
            return Some(format!(
                "max_age ({}s old)",
                (inputs.now - plan.built_at).num_seconds()
            ));
        }

        if let Some(expected) = plan.expected_soc_at(inputs.now) {
            let drift = (inputs.current_soc - expected).abs();
            if drift > self.soc_drift_threshold {
                return Some(format!(
                    "soc_drift (expected {:.1}%, actual {:.1}%)",
                    expected * 100.0,
                    inputs.current_soc * 100.0
                ));
            }
        } else if plan.is_expired(inputs.now) {
            return Some("plan_expired".into());
        }

        if inputs.latest_forecast_hash != plan.forecast_hash {
            return Some("forecast_change".into());
        }
        if inputs.latest_tariff_hash != plan.tariff_hash {
            return Some("tariff_change".into());
        }
        if inputs.latest_params_hash != plan.params_hash {
            return Some("config_change".into());
        }

        // A non-optimal plan is retried once the back-off has elapsed
        if plan.status != PlanStatus::Optimal {
            let backoff_over = self
                .last_attempt_at
                .map_or(true, |at| inputs.now >= at + self.retry_backoff);
            if backoff_over {
                return Some(format!("retry_after_{:?}", plan.status));
            }
            debug!("non-optimal plan waiting out retry backoff");
        }

        None
    }
}
