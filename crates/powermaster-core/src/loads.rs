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

use chrono::{DateTime, Datelike, Timelike, Utc};
use chrono_tz::Tz;
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::{info, warn};

use powermaster_types::loads::{LoadAction, LoadDefinition, LoadRuntime, LoadState};
use powermaster_types::plan::PlanSlot;

/// Action emitted to a load driver this tick.
#[derive(Debug, Clone)]
pub struct LoadDecision {
    pub name: String,
    pub action: LoadAction,
    pub reason: String,
}

/// External conditions the scheduler folds into its transitions.
#[derive(Debug, Clone, Default)]
pub struct LoadConditions {
    /// Loads whose driver reported a fault this tick
    pub faulted: BTreeSet<String>,
    /// Loads that must shed now (spike, grid overload)
    pub shed: BTreeSet<String>,
    /// Safety-level shedding: drop everything, min-runtime included
    pub safety_shed_all: bool,
}

/// Per-device scheduler: IDLE / RUNNING / COMPLETED / LOCKED_OUT with
/// daily runtime budgets. Consumes the plan's `scheduled_loads` and
/// emits turn-on/turn-off actions, never bare state.
#[derive(Debug)]
pub struct LoadScheduler {
    tz: Tz,
    runtimes: HashMap<String, LoadRuntime>,
    last_accrual: HashMap<String, DateTime<Utc>>,
}

impl LoadScheduler {
    pub fn new(tz: Tz) -> Self {
        Self {
            tz,
            runtimes: HashMap::new(),
            last_accrual: HashMap::new(),
        }
    }

    pub fn runtime(&self, name: &str) -> Option<&LoadRuntime> {
        self.runtimes.get(name)
    }

    pub fn restore(&mut self, name: &str, runtime: LoadRuntime) {
        self.runtimes.insert(name.to_string(), runtime);
    }

    /// Today's accumulated runtime per load, for the planner's credit.
    pub fn runtime_minutes_map(&self) -> HashMap<String, f64> {
        self.runtimes
            .iter()
            .map(|(name, r)| (name.clone(), r.runtime_minutes_today))
            .collect()
    }

    pub fn states(&self) -> HashMap<String, LoadRuntime> {
        self.runtimes.clone()
    }

    /// Run one scheduling pass. Returns driver actions for devices that
    /// change state.
    pub fn on_tick(
        &mut self,
        now: DateTime<Utc>,
        defs: &[LoadDefinition],
        plan_slot: Option<&PlanSlot>,
        conditions: &LoadConditions,
    ) -> Vec<LoadDecision> {
        let mut decisions = Vec::new();
        let local = now.with_timezone(&self.tz);
        let local_day = local.num_days_from_ce();

        for def in defs {
            if !def.enabled {
                continue;
            }
            let runtime = self
                .runtimes
                .entry(def.name.clone())
                .or_insert_with(|| LoadRuntime::new(now));

            // Midnight reset (local time)
            if runtime.day_ordinal != local_day {
                if runtime.state == LoadState::Running {
                    decisions.push(LoadDecision {
                        name: def.name.clone(),
                        action: LoadAction::TurnOff,
                        reason: "midnight reset".into(),
                    });
                }
                *runtime = LoadRuntime::new(now);
                runtime.day_ordinal = local_day;
                self.last_accrual.remove(&def.name);
            }

            // Accrue runtime while running
            if runtime.state == LoadState::Running {
                let since = self.last_accrual.get(&def.name).copied().unwrap_or(now);
                runtime.runtime_minutes_today += (now - since).num_seconds() as f64 / 60.0;
            }
            self.last_accrual.insert(def.name.clone(), now);

            // Driver fault locks the device out for the day
            if conditions.faulted.contains(&def.name) {
                if runtime.state != LoadState::LockedOut {
                    warn!(load = %def.name, "driver fault, locking out for the day");
                    if runtime.state == LoadState::Running {
                        decisions.push(LoadDecision {
                            name: def.name.clone(),
                            action: LoadAction::TurnOff,
                            reason: "driver fault".into(),
                        });
                    }
                    transition(runtime, LoadState::LockedOut, now);
                }
                continue;
            }

            let plan_says_on = plan_slot
                .map(|slot| slot.scheduled_loads.contains(&def.name))
                .unwrap_or(false);
            let in_window = def.hour_in_window(local.hour());
            let day_ok = def.day_allowed(local.weekday());
            let must_shed = conditions.safety_shed_all || conditions.shed.contains(&def.name);

            match runtime.state {
                LoadState::Idle => {
                    if runtime.runtime_minutes_today >= f64::from(def.max_runtime_min) {
                        transition(runtime, LoadState::Completed, now);
                    } else if plan_says_on && in_window && day_ok && !must_shed {
                        info!(load = %def.name, "starting scheduled load");
                        transition(runtime, LoadState::Running, now);
                        runtime.current_shift_start = Some(now);
                        decisions.push(LoadDecision {
                            name: def.name.clone(),
                            action: LoadAction::TurnOn,
                            reason: "plan schedule".into(),
                        });
                    }
                }
                LoadState::Running => {
                    let reached_min =
                        runtime.runtime_minutes_today >= f64::from(def.min_runtime_min);
                    let reached_max =
                        runtime.runtime_minutes_today >= f64::from(def.max_runtime_min);

                    if must_shed {
                        // Safety shedding overrides the min-runtime hold
                        decisions.push(LoadDecision {
                            name: def.name.clone(),
                            action: LoadAction::TurnOff,
                            reason: if conditions.safety_shed_all {
                                "safety shed".into()
                            } else {
                                "load shed".into()
                            },
                        });
                        transition(runtime, LoadState::Idle, now);
                        runtime.current_shift_start = None;
                    } else if reached_max {
                        decisions.push(LoadDecision {
                            name: def.name.clone(),
                            action: LoadAction::TurnOff,
                            reason: "max runtime reached".into(),
                        });
                        transition(runtime, LoadState::Completed, now);
                        runtime.current_shift_start = None;
                    } else if !plan_says_on && reached_min {
                        decisions.push(LoadDecision {
                            name: def.name.clone(),
                            action: LoadAction::TurnOff,
                            reason: "plan window ended".into(),
                        });
                        let next = if def.allow_split_shifts {
                            LoadState::Idle
                        } else {
                            // One shift per day: off means done until
                            // the midnight reset
                            LoadState::LockedOut
                        };
                        transition(runtime, next, now);
                        runtime.current_shift_start = None;
                    }
                    // Below min runtime the load keeps running even if
                    // the plan moved on
                }
                LoadState::Completed | LoadState::LockedOut => {}
            }
        }

        decisions
    }
}

fn transition(runtime: &mut LoadRuntime, to: LoadState, now: DateTime<Utc>) {
    runtime.state = to;
    runtime.last_transition_at = now;
}

/// Pick loads to shed when grid import exceeds the configured cap:
/// least-essential (highest priority number) first, until the excess is
/// covered. Returns names in shed order.
pub fn select_overload_sheds(
    defs: &[LoadDefinition],
    running: &BTreeSet<String>,
    grid_import_w: f64,
    max_grid_import_w: f64,
) -> Vec<String> {
    if max_grid_import_w <= 0.0 {
        return Vec::new();
    }
    let excess = grid_import_w - max_grid_import_w;
    if excess <= 0.0 {
        return Vec::new();
    }

    let mut candidates: Vec<&LoadDefinition> = defs
        .iter()
        .filter(|d| running.contains(&d.name))
        .collect();
    candidates.sort_by(|a, b| b.priority_class.cmp(&a.priority_class));

    let mut shed = Vec::new();
    let mut shed_w = 0.0;
    for def in candidates {
        if shed_w >= excess {
            break;
        }
        shed.push(def.name.clone());
        shed_w += f64::from(def.power_w);
    }
    if !shed.is_empty() {
        warn!(
            grid_import_w = grid_import_w,
            max_grid_import_w = max_grid_import_w,
            count = shed.len(),
            "shedding loads for grid overload"
        );
    }
    shed
}
