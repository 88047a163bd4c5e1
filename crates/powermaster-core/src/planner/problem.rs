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

use powermaster_types::inverter::OperatingMode;

use super::solver::{ConstraintOp, MilpProblem, VarId};

/// Mode index order inside the y-binaries; fixed for determinism.
pub const MODE_ORDER: [OperatingMode; 5] = [
    OperatingMode::SelfUse,
    OperatingMode::SelfUseZeroExport,
    OperatingMode::ForceCharge,
    OperatingMode::ForceDischarge,
    OperatingMode::ChargeNoImport,
];

/// Penalty weights for soft constraints; cents compete directly with
/// the energy cost terms.
pub const SAFETY_SLACK_PENALTY: f64 = 1e6;
pub const STORM_SLACK_PENALTY: f64 = 1e4;
pub const EVENING_SLACK_PENALTY: f64 = 500.0;
pub const MORNING_SLACK_PENALTY: f64 = 300.0;
/// Nudges ties toward SELF_USE so idle slots don't land in FORCE_*.
const MODE_TIEBREAK_PENALTY: f64 = 1e-3;

/// Per-slot planner inputs, all vectors of length `n_slots`.
#[derive(Debug, Clone)]
pub struct SlotInputs {
    /// Solar forecast at the configured percentile (W)
    pub solar_w: Vec<f64>,
    /// Baseline load forecast, deferrable loads excluded (W)
    pub load_w: Vec<f64>,
    /// Import rate used by the objective (dampened; c/kWh)
    pub import_c_objective: Vec<f64>,
    pub export_c: Vec<f64>,
    pub is_spike: Vec<bool>,
    /// Storm reserve SOC target per slot; 0 disables the constraint
    pub storm_reserve: Vec<f64>,
    /// Slots at the local evening-target hour
    pub evening_target_slots: Vec<usize>,
    /// Slots at the local morning-minimum hour
    pub morning_minimum_slots: Vec<usize>,
}

impl SlotInputs {
    pub fn n_slots(&self) -> usize {
        self.solar_w.len()
    }
}

/// One deferrable load as the planner sees it.
#[derive(Debug, Clone)]
pub struct LoadPlanInput {
    pub name: String,
    pub power_w: f64,
    pub priority_class: u8,
    pub prefer_solar: bool,
    pub allow_split_shifts: bool,
    /// Slot-by-slot eligibility (window, weekday, enabled, shedding)
    pub eligible: Vec<bool>,
    /// Local-day group of each slot (0 = today)
    pub day_index: Vec<usize>,
    /// Runtime already accumulated today (minutes)
    pub runtime_done_today_min: f64,
    pub min_runtime_min: f64,
    pub max_runtime_min: f64,
}

/// Scalar parameters after any retry-ladder relaxation.
#[derive(Debug, Clone)]
pub struct ProblemParams {
    pub slot_hours: f64,
    pub capacity_wh: f64,
    /// Charge-side efficiency; discharge side equals it, the product is
    /// the round-trip efficiency
    pub eta: f64,
    pub max_charge_w: f64,
    pub max_discharge_w: f64,
    /// Soft floor normally, hard floor on the relaxed retry
    pub soc_floor: f64,
    pub soc_max: f64,
    pub soc_0: f64,
    pub degradation_c_per_kwh: f64,
    pub hedging_c_per_kwh: f64,
    pub break_even_delta_c: f64,
    pub wacb_c: f64,
    /// Target SOC at the evening-target slots
    pub evening_soc_target: f64,
    pub morning_soc_minimum: f64,
    /// Prefer-solar reward ρ (cents per forecast W per slot)
    pub prefer_solar_rho: f64,
    /// Base reward per scheduled load slot (cents)
    pub load_reward_c: f64,
    /// λ_arb tie-break reward on profitable-cycle discharge
    pub cycle_reward_c: f64,
    pub arbitrage_allowed: bool,
    /// Loads above this priority are shed during spike slots
    pub spike_shed_priority: u8,
}

/// Per-slot variable ids.
#[derive(Debug, Clone, Copy)]
pub struct SlotVars {
    pub c_grid: VarId,
    pub c_pv: VarId,
    pub d_load: VarId,
    pub d_grid: VarId,
    pub imp: VarId,
    pub exp: VarId,
    pub curtail: VarId,
    pub soc: VarId,
    pub safety_slack: VarId,
    pub storm_slack: Option<VarId>,
    /// y-mode binaries in [`MODE_ORDER`]
    pub y: [VarId; 5],
}

/// Mapping from the model back to the problem domain.
#[derive(Debug, Clone)]
pub struct VarMap {
    pub slots: Vec<SlotVars>,
    /// x_load binaries per load per slot; `None` = ineligible (x ≡ 0)
    pub load_x: Vec<Vec<Option<VarId>>>,
}

/// Build the MILP of the planning problem. Variables are created in a
/// fixed slot-major order so the formulation is deterministic.
pub fn build_problem(
    slots: &SlotInputs,
    loads: &[LoadPlanInput],
    params: &ProblemParams,
) -> (MilpProblem, VarMap) {
    let n = slots.n_slots();
    let mut p = MilpProblem::new();

    let max_grid_w = params.max_charge_w + params.max_discharge_w;
    let kwh = params.slot_hours / 1000.0;

    // ── Variables, slot-major ──
    let mut slot_vars = Vec::with_capacity(n);
    for t in 0..n {
        let c_grid = p.add_var(0.0, Some(params.max_charge_w));
        let c_pv = p.add_var(0.0, Some(params.max_charge_w));
        let d_load = p.add_var(0.0, Some(params.max_discharge_w));
        let d_grid = p.add_var(0.0, Some(params.max_discharge_w));
        let imp = p.add_var(0.0, Some(max_grid_w));
        let exp = p.add_var(0.0, Some(max_grid_w));
        let curtail = p.add_var(0.0, Some(slots.solar_w[t].max(0.0)));
        let soc = p.add_var(0.0, Some(1.0));
        let safety_slack = p.add_var(0.0, None);
        let storm_slack = (slots.storm_reserve[t] > 0.0).then(|| p.add_var(0.0, None));
        let y = [
            p.add_binary(),
            p.add_binary(),
            p.add_binary(),
            p.add_binary(),
            p.add_binary(),
        ];
        slot_vars.push(SlotVars {
            c_grid,
            c_pv,
            d_load,
            d_grid,
            imp,
            exp,
            curtail,
            soc,
            safety_slack,
            storm_slack,
            y,
        });
    }

    // Load binaries after the slot block, load-major
    let mut load_x: Vec<Vec<Option<VarId>>> = Vec::with_capacity(loads.len());
    for load in loads {
        let mut xs = Vec::with_capacity(n);
        for t in 0..n {
            let shed = slots.is_spike[t] && load.priority_class > params.spike_shed_priority;
            if load.eligible[t] && !shed {
                xs.push(Some(p.add_binary()));
            } else {
                xs.push(None);
            }
        }
        load_x.push(xs);
    }

    // ── Per-slot constraints ──
    for t in 0..n {
        let v = &slot_vars[t];

        // Energy balance:
        //   S + imp + d_load + d_grid
        //     = L + Σ P_ℓ·x + c_pv + c_grid + exp + curtail
        let mut terms = vec![
            (v.imp, 1.0),
            (v.d_load, 1.0),
            (v.d_grid, 1.0),
            (v.c_pv, -1.0),
            (v.c_grid, -1.0),
            (v.exp, -1.0),
            (v.curtail, -1.0),
        ];
        for (load, xs) in loads.iter().zip(&load_x) {
            if let Some(x) = xs[t] {
                terms.push((x, -load.power_w));
            }
        }
        p.constrain(terms, ConstraintOp::Eq, slots.load_w[t] - slots.solar_w[t]);

        // Grid coupling: battery-from-grid rides on imports,
        // battery-to-grid rides on exports
        p.constrain(vec![(v.c_grid, 1.0), (v.imp, -1.0)], ConstraintOp::Le, 0.0);
        p.constrain(vec![(v.d_grid, 1.0), (v.exp, -1.0)], ConstraintOp::Le, 0.0);

        // SOC dynamics:
        //   soc_t = soc_{t-1} + Δ·(η·(c_pv + c_grid) − (d_load + d_grid)/η)/cap
        let charge_coeff = params.slot_hours * params.eta / params.capacity_wh;
        let discharge_coeff = params.slot_hours / (params.eta * params.capacity_wh);
        let mut soc_terms = vec![
            (v.soc, 1.0),
            (v.c_pv, -charge_coeff),
            (v.c_grid, -charge_coeff),
            (v.d_load, discharge_coeff),
            (v.d_grid, discharge_coeff),
        ];
        let rhs = if t == 0 {
            params.soc_0
        } else {
            soc_terms.push((slot_vars[t - 1].soc, -1.0));
            0.0
        };
        p.constrain(soc_terms, ConstraintOp::Eq, rhs);

        // SOC bounds with safety slack
        p.constrain(
            vec![(v.soc, 1.0), (v.safety_slack, 1.0)],
            ConstraintOp::Ge,
            params.soc_floor,
        );
        p.constrain(
            vec![(v.soc, 1.0), (v.safety_slack, -1.0)],
            ConstraintOp::Le,
            params.soc_max,
        );

        // Storm reserve
        if let Some(storm_slack) = v.storm_slack {
            p.constrain(
                vec![(v.soc, 1.0), (storm_slack, 1.0)],
                ConstraintOp::Ge,
                slots.storm_reserve[t],
            );
        }

        // Inverter power caps
        p.constrain(
            vec![(v.c_pv, 1.0), (v.c_grid, 1.0)],
            ConstraintOp::Le,
            params.max_charge_w,
        );
        p.constrain(
            vec![(v.d_load, 1.0), (v.d_grid, 1.0)],
            ConstraintOp::Le,
            params.max_discharge_w,
        );

        // Exactly one mode per slot
        p.constrain(v.y.iter().map(|y| (*y, 1.0)).collect(), ConstraintOp::Eq, 1.0);

        // Mode gating, big-M on the natural bound of each flow.
        // SELF_USE: no grid charging
        p.constrain(
            vec![(v.c_grid, 1.0), (v.y[0], params.max_charge_w)],
            ConstraintOp::Le,
            params.max_charge_w,
        );
        // SELF_USE_ZERO_EXPORT: no grid charging, export capped to zero
        p.constrain(
            vec![(v.c_grid, 1.0), (v.y[1], params.max_charge_w)],
            ConstraintOp::Le,
            params.max_charge_w,
        );
        p.constrain(
            vec![(v.exp, 1.0), (v.y[1], max_grid_w)],
            ConstraintOp::Le,
            max_grid_w,
        );
        // FORCE_CHARGE: no discharging
        p.constrain(
            vec![(v.d_load, 1.0), (v.d_grid, 1.0), (v.y[2], params.max_discharge_w)],
            ConstraintOp::Le,
            params.max_discharge_w,
        );
        // FORCE_DISCHARGE: no charging; and battery-to-grid flow only
        // exists in this mode
        p.constrain(
            vec![(v.c_pv, 1.0), (v.c_grid, 1.0), (v.y[3], params.max_charge_w)],
            ConstraintOp::Le,
            params.max_charge_w,
        );
        p.constrain(
            vec![(v.d_grid, 1.0), (v.y[3], -params.max_discharge_w)],
            ConstraintOp::Le,
            0.0,
        );
        // CHARGE_NO_IMPORT: PV-surplus charging only
        p.constrain(
            vec![(v.c_grid, 1.0), (v.y[4], params.max_charge_w)],
            ConstraintOp::Le,
            params.max_charge_w,
        );

        // No grid charging during a price spike
        if slots.is_spike[t] {
            p.fix_zero(v.c_grid);
        }

        // Arbitrage export gate: exporting stored energy must clear the
        // cost basis plus the break-even delta
        let unprofitable = slots.export_c[t] < params.wacb_c + params.break_even_delta_c;
        if !params.arbitrage_allowed || unprofitable {
            p.fix_zero(v.d_grid);
        }
    }

    // ── Load runtime constraints, grouped by local day ──
    for (load, xs) in loads.iter().zip(&load_x) {
        let n_days = load.day_index.iter().copied().max().map_or(0, |d| d + 1);
        for day in 0..n_days {
            let day_slots: Vec<VarId> = (0..n)
                .filter(|t| load.day_index[*t] == day)
                .filter_map(|t| xs[t])
                .collect();
            if day_slots.is_empty() {
                continue;
            }

            let slot_minutes = params.slot_hours * 60.0;
            let available_min = day_slots.len() as f64 * slot_minutes;
            let (mut min_min, mut max_min) = (load.min_runtime_min, load.max_runtime_min);
            if day == 0 {
                // Credit runtime already achieved today
                min_min = (min_min - load.runtime_done_today_min).max(0.0);
                max_min = (max_min - load.runtime_done_today_min).max(0.0);
            }
            // Never let the window make the problem infeasible
            min_min = min_min.min(available_min);

            let terms: Vec<(VarId, f64)> =
                day_slots.iter().map(|x| (*x, slot_minutes)).collect();
            if min_min > 0.0 {
                p.constrain(terms.clone(), ConstraintOp::Ge, min_min);
            }
            p.constrain(terms, ConstraintOp::Le, max_min);

            // Contiguity: a single start per day unless splitting is
            // allowed. start_t >= x_t − x_{t−1}.
            if !load.allow_split_shifts {
                let mut start_terms = Vec::new();
                for t in 0..n {
                    if load.day_index[t] != day {
                        continue;
                    }
                    let Some(x_t) = xs[t] else { continue };
                    let start = p.add_binary();
                    let prev = if t > 0 { xs[t - 1] } else { None };
                    match prev {
                        Some(x_prev) => p.constrain(
                            vec![(start, 1.0), (x_t, -1.0), (x_prev, 1.0)],
                            ConstraintOp::Ge,
                            0.0,
                        ),
                        None => p.constrain(
                            vec![(start, 1.0), (x_t, -1.0)],
                            ConstraintOp::Ge,
                            0.0,
                        ),
                    }
                    start_terms.push((start, 1.0));
                }
                if !start_terms.is_empty() {
                    p.constrain(start_terms, ConstraintOp::Le, 1.0);
                }
            }
        }
    }

    // ── Objective (cents, minimised) ──
    for t in 0..n {
        let v = &slot_vars[t];
        // Import energy cost plus hedging
        p.objective_term(v.imp, (slots.import_c_objective[t] + params.hedging_c_per_kwh) * kwh);
        // Export revenue
        p.objective_term(v.exp, -slots.export_c[t] * kwh);
        // Battery wear on all cycled energy
        for flow in [v.c_grid, v.c_pv, v.d_load, v.d_grid] {
            p.objective_term(flow, params.degradation_c_per_kwh * kwh);
        }
        // λ_arb: favour cycles where the spread clears break-even
        let spread_ok =
            slots.export_c[t] - slots.import_c_objective[t] > params.break_even_delta_c;
        if params.arbitrage_allowed && spread_ok {
            p.objective_term(v.d_grid, -params.cycle_reward_c * kwh);
        }
        // Slack penalties
        p.objective_term(v.safety_slack, SAFETY_SLACK_PENALTY);
        if let Some(storm_slack) = v.storm_slack {
            p.objective_term(storm_slack, STORM_SLACK_PENALTY);
        }
        // Mode tie-break
        for (m, y) in v.y.iter().enumerate() {
            if MODE_ORDER[m] != OperatingMode::SelfUse {
                p.objective_term(*y, MODE_TIEBREAK_PENALTY);
            }
        }
    }

    // Load rewards: scheduling is worth something, solar-aligned
    // scheduling more
    for (load, xs) in loads.iter().zip(&load_x) {
        let weight = params.load_reward_c * f64::from(11 - load.priority_class.min(10)) / 10.0;
        for t in 0..n {
            if let Some(x) = xs[t] {
                p.objective_term(x, -weight);
                if load.prefer_solar {
                    p.objective_term(x, -params.prefer_solar_rho * slots.solar_w[t]);
                }
            }
        }
    }

    // Soft SOC shaping targets
    for &t in &slots.evening_target_slots {
        let slack = p.add_var(0.0, None);
        p.constrain(
            vec![(slot_vars[t].soc, 1.0), (slack, 1.0)],
            ConstraintOp::Ge,
            params.evening_soc_target,
        );
        p.objective_term(slack, EVENING_SLACK_PENALTY);
    }
    for &t in &slots.morning_minimum_slots {
        let slack = p.add_var(0.0, None);
        p.constrain(
            vec![(slot_vars[t].soc, 1.0), (slack, 1.0)],
            ConstraintOp::Ge,
            params.morning_soc_minimum,
        );
        p.objective_term(slack, MORNING_SLACK_PENALTY);
    }

    (p, VarMap { slots: slot_vars, load_x })
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn simple_slots(n: usize) -> SlotInputs {
        SlotInputs {
            solar_w: vec![0.0; n],
            load_w: vec![500.0; n],
            import_c_objective: vec![20.0; n],
            export_c: vec![8.0; n],
            is_spike: vec![false; n],
            storm_reserve: vec![0.0; n],
            evening_target_slots: vec![],
            morning_minimum_slots: vec![],
        }
    }

    pub(crate) fn params() -> ProblemParams {
        ProblemParams {
            slot_hours: 0.5,
            capacity_wh: 10_000.0,
            eta: 0.95,
            max_charge_w: 5_000.0,
            max_discharge_w: 5_000.0,
            soc_floor: 0.10,
            soc_max: 0.95,
            soc_0: 0.5,
            degradation_c_per_kwh: 3.0,
            hedging_c_per_kwh: 0.0,
            break_even_delta_c: 6.0,
            wacb_c: 10.0,
            evening_soc_target: 0.0,
            morning_soc_minimum: 0.0,
            prefer_solar_rho: 0.01,
            load_reward_c: 5.0,
            cycle_reward_c: 0.1,
            arbitrage_allowed: true,
            spike_shed_priority: 2,
        }
    }

    #[test]
    fn test_variable_count_is_deterministic() {
        let slots = simple_slots(4);
        let (p1, map1) = build_problem(&slots, &[], &params());
        let (p2, map2) = build_problem(&slots, &[], &params());
        assert_eq!(p1.vars.len(), p2.vars.len());
        assert_eq!(p1.constraints.len(), p2.constraints.len());
        assert_eq!(map1.slots[0].soc, map2.slots[0].soc);
        // 7 flows + soc + safety slack + 5 binaries per slot
        assert_eq!(p1.vars.len(), 4 * 14);
    }

    #[test]
    fn test_spike_slots_fix_grid_charge() {
        let mut slots = simple_slots(2);
        slots.is_spike[1] = true;
        let (p, map) = build_problem(&slots, &[], &params());
        let c_grid_1 = map.slots[1].c_grid;
        let fixed = p.constraints.iter().any(|c| {
            c.op == ConstraintOp::Eq
                && c.rhs == 0.0
                && c.terms == vec![(c_grid_1, 1.0)]
        });
        assert!(fixed);
    }

    #[test]
    fn test_unprofitable_export_gated() {
        // export 8 < wacb 10 + break-even 6: every d_grid pinned to 0
        let slots = simple_slots(3);
        let (p, map) = build_problem(&slots, &[], &params());
        for v in &map.slots {
            let gated = p
                .constraints
                .iter()
                .any(|c| c.op == ConstraintOp::Eq && c.rhs == 0.0 && c.terms == vec![(v.d_grid, 1.0)]);
            assert!(gated);
        }
    }

    #[test]
    fn test_ineligible_slots_have_no_load_var() {
        let slots = simple_slots(4);
        let load = LoadPlanInput {
            name: "pump".into(),
            power_w: 1000.0,
            priority_class: 5,
            prefer_solar: true,
            allow_split_shifts: true,
            eligible: vec![false, true, true, false],
            day_index: vec![0, 0, 0, 0],
            runtime_done_today_min: 0.0,
            min_runtime_min: 30.0,
            max_runtime_min: 60.0,
        };
        let (_, map) = build_problem(&slots, &[load], &params());
        assert!(map.load_x[0][0].is_none());
        assert!(map.load_x[0][1].is_some());
        assert!(map.load_x[0][3].is_none());
    }

    #[test]
    fn test_spike_sheds_deferrable_load() {
        let mut slots = simple_slots(2);
        slots.is_spike[0] = true;
        let load = LoadPlanInput {
            name: "pump".into(),
            power_w: 1000.0,
            priority_class: 5,
            prefer_solar: false,
            allow_split_shifts: true,
            eligible: vec![true, true],
            day_index: vec![0, 0],
            runtime_done_today_min: 0.0,
            min_runtime_min: 0.0,
            max_runtime_min: 60.0,
        };
        let (_, map) = build_problem(&slots, &[load], &params());
        assert!(map.load_x[0][0].is_none(), "priority 5 load shed in spike slot");
        assert!(map.load_x[0][1].is_some());
    }
}
