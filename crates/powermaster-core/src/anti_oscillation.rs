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
use serde::Serialize;
use std::collections::VecDeque;
use tracing::debug;

use powermaster_types::config::AntiOscillationConfig;
use powermaster_types::inverter::InverterCommand;

use crate::arbitrator::DecisionSource;

/// Rolling window for the transition rate limit.
const RATE_WINDOW_MINUTES: i64 = 60;

/// The command currently applied at the inverter.
#[derive(Debug, Clone, Serialize)]
pub struct AppliedCommand {
    pub command: InverterCommand,
    pub source: DecisionSource,
    pub rationale: String,
    pub applied_at: DateTime<Utc>,
}

/// Verdict of the guard for a candidate command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardVerdict {
    Allow,
    Suppress { reason: String },
}

impl GuardVerdict {
    pub fn allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// Prevents rapid mode switching that wears the inverter's EEPROM and
/// relays. Three mechanisms: mode dwell time, same-mode power
/// hysteresis, and a rolling-hour transition rate limit.
///
/// Safety and override commands bypass the dwell and are not counted
/// against the rate limit.
#[derive(Debug)]
pub struct AntiOscillationGuard {
    config: AntiOscillationConfig,
    last: Option<AppliedCommand>,
    transition_times: VecDeque<DateTime<Utc>>,
    pub suppressed_count: u64,
}

impl AntiOscillationGuard {
    pub fn new(config: AntiOscillationConfig) -> Self {
        Self {
            config,
            last: None,
            transition_times: VecDeque::new(),
            suppressed_count: 0,
        }
    }

    pub fn last_applied(&self) -> Option<&AppliedCommand> {
        self.last.as_ref()
    }

    pub fn update_config(&mut self, config: AntiOscillationConfig) {
        self.config = config;
    }

    /// Check whether `command` may be applied now.
    pub fn check(
        &mut self,
        command: &InverterCommand,
        source: DecisionSource,
        now: DateTime<Utc>,
    ) -> GuardVerdict {
        let Some(last) = &self.last else {
            return GuardVerdict::Allow;
        };

        let bypass = matches!(source, DecisionSource::Safety | DecisionSource::Override);

        if command.mode == last.command.mode {
            // Same mode: only a meaningful power change is worth a
            // re-dispatch; the refresh loop keeps the device fed.
            let delta = command.power_w.abs_diff(last.command.power_w);
            if delta < self.config.power_hysteresis_w && command.export_cap_w == last.command.export_cap_w
            {
                self.suppressed_count += 1;
                return GuardVerdict::Suppress {
                    reason: format!(
                        "power delta {delta}W below hysteresis {}W",
                        self.config.power_hysteresis_w
                    ),
                };
            }
            return GuardVerdict::Allow;
        }

        if bypass {
            return GuardVerdict::Allow;
        }

        // Dwell: the current mode must be held before a non-safety switch
        let held = now - last.applied_at;
        if held < Duration::seconds(self.config.min_mode_dwell_s) {
            self.suppressed_count += 1;
            debug!(
                from = %last.command.mode,
                to = %command.mode,
                held_s = held.num_seconds(),
                "anti-oscillation dwell suppressing mode change"
            );
            return GuardVerdict::Suppress {
                reason: format!(
                    "dwell: mode held {}s of {}s",
                    held.num_seconds(),
                    self.config.min_mode_dwell_s
                ),
            };
        }

        // Rate limit over the rolling window
        self.prune(now);
        if self.transition_times.len() >= self.config.max_mode_changes_per_hour {
            self.suppressed_count += 1;
            return GuardVerdict::Suppress {
                reason: format!(
                    "rate limit: {} mode changes in the last hour",
                    self.transition_times.len()
                ),
            };
        }

        GuardVerdict::Allow
    }

    /// Record a successfully dispatched command.
    pub fn record_applied(
        &mut self,
        command: InverterCommand,
        source: DecisionSource,
        rationale: String,
        now: DateTime<Utc>,
    ) {
        let is_transition = self
            .last
            .as_ref()
            .is_some_and(|last| last.command.mode != command.mode);
        let counted =
            !matches!(source, DecisionSource::Safety | DecisionSource::Override);
        if is_transition && counted {
            self.transition_times.push_back(now);
            self.prune(now);
        }
        self.last = Some(AppliedCommand {
            command,
            source,
            rationale,
            applied_at: now,
        });
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = now - Duration::minutes(RATE_WINDOW_MINUTES);
        while self
            .transition_times
            .front()
            .is_some_and(|t| *t < cutoff)
        {
            self.transition_times.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use powermaster_types::inverter::OperatingMode;

    fn guard() -> AntiOscillationGuard {
        AntiOscillationGuard::new(AntiOscillationConfig::default())
    }

    fn cmd(mode: OperatingMode, power_w: u32) -> InverterCommand {
        InverterCommand {
            mode,
            power_w,
            export_cap_w: None,
        }
    }

    #[test]
    fn test_first_command_always_allowed() {
        let mut g = guard();
        let verdict = g.check(&cmd(OperatingMode::SelfUse, 0), DecisionSource::Plan, Utc::now());
        assert!(verdict.allowed());
    }

    #[test]
    fn test_dwell_suppresses_then_allows() {
        // SELF_USE applied at t=0; FORCE_CHARGE at t=4min is inside
        // the dwell and suppressed, at t=11min it applies.
        let t0 = Utc::now();
        let mut g = guard();
        g.record_applied(cmd(OperatingMode::SelfUse, 0), DecisionSource::Plan, String::new(), t0);

        let at_4min = t0 + Duration::minutes(4);
        let verdict = g.check(&cmd(OperatingMode::ForceCharge, 3000), DecisionSource::Plan, at_4min);
        match verdict {
            GuardVerdict::Suppress { reason } => assert!(reason.contains("dwell")),
            GuardVerdict::Allow => panic!("expected dwell suppression"),
        }

        let at_11min = t0 + Duration::minutes(11);
        assert!(g
            .check(&cmd(OperatingMode::ForceCharge, 3000), DecisionSource::Plan, at_11min)
            .allowed());
    }

    #[test]
    fn test_safety_bypasses_dwell() {
        let t0 = Utc::now();
        let mut g = guard();
        g.record_applied(cmd(OperatingMode::ForceDischarge, 4000), DecisionSource::Plan, String::new(), t0);
        let verdict = g.check(
            &cmd(OperatingMode::SelfUse, 0),
            DecisionSource::Safety,
            t0 + Duration::seconds(30),
        );
        assert!(verdict.allowed());
    }

    #[test]
    fn test_override_bypasses_dwell() {
        let t0 = Utc::now();
        let mut g = guard();
        g.record_applied(cmd(OperatingMode::SelfUse, 0), DecisionSource::Plan, String::new(), t0);
        assert!(g
            .check(
                &cmd(OperatingMode::ForceCharge, 2000),
                DecisionSource::Override,
                t0 + Duration::seconds(10),
            )
            .allowed());
    }

    #[test]
    fn test_same_mode_power_hysteresis() {
        let t0 = Utc::now();
        let mut g = guard();
        g.record_applied(cmd(OperatingMode::ForceCharge, 3000), DecisionSource::Plan, String::new(), t0);

        // 150 W delta < 200 W hysteresis: suppressed
        assert!(!g
            .check(&cmd(OperatingMode::ForceCharge, 3150), DecisionSource::Plan, t0)
            .allowed());
        // Identical command: idempotent, suppressed
        assert!(!g
            .check(&cmd(OperatingMode::ForceCharge, 3000), DecisionSource::Plan, t0)
            .allowed());
        // 500 W delta: allowed even within the dwell (same mode)
        assert!(g
            .check(&cmd(OperatingMode::ForceCharge, 3500), DecisionSource::Plan, t0)
            .allowed());
    }

    /// Burst six mode changes (via record_applied, as the tick does on
    /// successful dispatch), ending at t0 + 360 s.
    fn burst_six_transitions(g: &mut AntiOscillationGuard, t0: DateTime<Utc>) -> DateTime<Utc> {
        let modes = [OperatingMode::SelfUse, OperatingMode::ForceCharge];
        let mut now = t0;
        g.record_applied(cmd(modes[0], 0), DecisionSource::Plan, String::new(), now);
        for i in 0..6 {
            now += Duration::seconds(60);
            let m = modes[(i + 1) % 2];
            g.record_applied(cmd(m, 3000), DecisionSource::Plan, String::new(), now);
        }
        now
    }

    #[test]
    fn test_rate_limit_counts_only_plan_transitions() {
        let t0 = Utc::now();
        let mut g = guard();
        let last = burst_six_transitions(&mut g, t0);

        // Past the dwell but six transitions still inside the hour:
        // rate limited
        let check_at = last + Duration::seconds(700);
        let verdict = g.check(&cmd(OperatingMode::ForceDischarge, 3000), DecisionSource::Plan, check_at);
        match verdict {
            GuardVerdict::Suppress { reason } => assert!(reason.contains("rate limit")),
            GuardVerdict::Allow => panic!("expected rate limiting"),
        }

        // Safety still goes through
        assert!(g
            .check(&cmd(OperatingMode::SelfUse, 0), DecisionSource::Safety, check_at)
            .allowed());
    }

    #[test]
    fn test_rate_limit_window_rolls() {
        let t0 = Utc::now();
        let mut g = guard();
        let last = burst_six_transitions(&mut g, t0);

        // 61 minutes later the window has drained
        let later = last + Duration::minutes(61);
        assert!(g
            .check(&cmd(OperatingMode::ForceDischarge, 3000), DecisionSource::Plan, later)
            .allowed());
    }

    #[test]
    fn test_safety_transitions_not_counted() {
        let t0 = Utc::now();
        let mut g = guard();
        g.record_applied(cmd(OperatingMode::SelfUse, 0), DecisionSource::Plan, String::new(), t0);
        // Safety flapping does not consume the rate budget
        for i in 0..10 {
            let m = if i % 2 == 0 {
                OperatingMode::ForceCharge
            } else {
                OperatingMode::SelfUse
            };
            g.record_applied(cmd(m, 1000), DecisionSource::Safety, String::new(), t0 + Duration::seconds(i));
        }
        let check_at = t0 + Duration::seconds(700);
        assert!(g
            .check(&cmd(OperatingMode::ForceDischarge, 3000), DecisionSource::Plan, check_at)
            .allowed());
    }
}
