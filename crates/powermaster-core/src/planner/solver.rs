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

use std::time::{Duration, Instant};
use tracing::warn;

/// Index of a decision variable inside a [`MilpProblem`].
pub type VarId = usize;

#[derive(Debug, Clone, Copy)]
pub struct VarSpec {
    pub lower: f64,
    pub upper: Option<f64>,
    pub binary: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintOp {
    Le,
    Ge,
    Eq,
}

#[derive(Debug, Clone)]
pub struct LinearConstraint {
    pub terms: Vec<(VarId, f64)>,
    pub op: ConstraintOp,
    pub rhs: f64,
}

/// A mixed-integer linear program in a solver-agnostic form.
///
/// Variable ids are assigned in insertion order and never reordered, so
/// identical inputs produce byte-identical problems (and, with a
/// deterministic backend, byte-identical plans).
#[derive(Debug, Default)]
pub struct MilpProblem {
    pub vars: Vec<VarSpec>,
    pub constraints: Vec<LinearConstraint>,
    /// Minimisation objective as (variable, coefficient) pairs
    pub objective: Vec<(VarId, f64)>,
}

impl MilpProblem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_var(&mut self, lower: f64, upper: Option<f64>) -> VarId {
        self.vars.push(VarSpec {
            lower,
            upper,
            binary: false,
        });
        self.vars.len() - 1
    }

    pub fn add_binary(&mut self) -> VarId {
        self.vars.push(VarSpec {
            lower: 0.0,
            upper: Some(1.0),
            binary: true,
        });
        self.vars.len() - 1
    }

    pub fn constrain(&mut self, terms: Vec<(VarId, f64)>, op: ConstraintOp, rhs: f64) {
        self.constraints.push(LinearConstraint { terms, op, rhs });
    }

    /// Fix a single variable to zero.
    pub fn fix_zero(&mut self, var: VarId) {
        self.constrain(vec![(var, 1.0)], ConstraintOp::Eq, 0.0);
    }

    pub fn objective_term(&mut self, var: VarId, coefficient: f64) {
        if coefficient != 0.0 {
            self.objective.push((var, coefficient));
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SolveStatus {
    Optimal,
    /// Incumbent from a budget-limited backend
    Feasible,
    Infeasible,
    Timeout,
    Error(String),
}

#[derive(Debug, Clone)]
pub struct SolveOutcome {
    pub status: SolveStatus,
    /// Value per variable, indexed by [`VarId`]; empty unless usable
    pub values: Vec<f64>,
    pub objective: f64,
    pub solve_time_ms: u64,
}

impl SolveOutcome {
    pub fn failed(status: SolveStatus, solve_time_ms: u64) -> Self {
        Self {
            status,
            values: Vec::new(),
            objective: 0.0,
            solve_time_ms,
        }
    }
}

/// Abstract MILP solver. Concrete backends are plugged in at startup;
/// the planner only sees this interface.
pub trait Solver: Send + Sync {
    fn name(&self) -> &str;

    fn solve(&self, problem: &MilpProblem) -> SolveOutcome;
}

// ============= good_lp Backend =============

/// Backend on top of `good_lp` with the pure-Rust `microlp` solver.
///
/// microlp is single-threaded and deterministic, which plan determinism
/// relies on. It cannot be interrupted mid-solve, so the wall-clock
/// budget is checked after the fact and busted budgets are reported as
/// `Timeout`.
pub struct GoodLpSolver {
    pub time_limit: Duration,
}

impl GoodLpSolver {
    pub fn new(time_limit: Duration) -> Self {
        Self { time_limit }
    }
}

impl Solver for GoodLpSolver {
    fn name(&self) -> &str {
        "good_lp/microlp"
    }

    fn solve(&self, problem: &MilpProblem) -> SolveOutcome {
        use good_lp::{microlp, variable, Expression, ProblemVariables, Solution, SolverModel};

        let started = Instant::now();

        let mut vars = ProblemVariables::new();
        let handles: Vec<good_lp::Variable> = problem
            .vars
            .iter()
            .map(|spec| {
                let mut def = variable().min(spec.lower);
                if let Some(upper) = spec.upper {
                    def = def.max(upper);
                }
                if spec.binary {
                    def = def.binary();
                }
                vars.add(def)
            })
            .collect();

        let mut objective = Expression::from(0.0);
        for (var, coefficient) in &problem.objective {
            objective += *coefficient * handles[*var];
        }
        let objective_for_eval = objective.clone();

        let mut model = vars.minimise(objective).using(microlp);
        for constraint in &problem.constraints {
            let mut expr = Expression::from(0.0);
            for (var, coefficient) in &constraint.terms {
                expr += *coefficient * handles[*var];
            }
            let built = match constraint.op {
                ConstraintOp::Le => expr.leq(constraint.rhs),
                ConstraintOp::Ge => expr.geq(constraint.rhs),
                ConstraintOp::Eq => expr.eq(constraint.rhs),
            };
            model = model.with(built);
        }

        let result = model.solve();
        let elapsed = started.elapsed();
        let solve_time_ms = elapsed.as_millis() as u64;

        match result {
            Ok(solution) => {
                let values = handles.iter().map(|h| solution.value(*h)).collect();
                let objective = objective_for_eval.eval_with(&solution);
                let status = if elapsed > self.time_limit {
                    warn!(
                        elapsed_ms = solve_time_ms,
                        limit_ms = self.time_limit.as_millis() as u64,
                        "solver exceeded wall-clock budget"
                    );
                    SolveStatus::Timeout
                } else {
                    SolveStatus::Optimal
                };
                SolveOutcome {
                    status,
                    values,
                    objective,
                    solve_time_ms,
                }
            }
            Err(good_lp::ResolutionError::Infeasible) => {
                SolveOutcome::failed(SolveStatus::Infeasible, solve_time_ms)
            }
            Err(other) => SolveOutcome::failed(SolveStatus::Error(other.to_string()), solve_time_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tiny_lp_solves() {
        // min -x - 2y  s.t.  x + y <= 4, x <= 3, y <= 2
        let mut p = MilpProblem::new();
        let x = p.add_var(0.0, Some(3.0));
        let y = p.add_var(0.0, Some(2.0));
        p.constrain(vec![(x, 1.0), (y, 1.0)], ConstraintOp::Le, 4.0);
        p.objective_term(x, -1.0);
        p.objective_term(y, -2.0);

        let outcome = GoodLpSolver::new(Duration::from_secs(5)).solve(&p);
        assert_eq!(outcome.status, SolveStatus::Optimal);
        assert!((outcome.values[x] - 2.0).abs() < 1e-6);
        assert!((outcome.values[y] - 2.0).abs() < 1e-6);
        assert!((outcome.objective - -6.0).abs() < 1e-6);
    }

    #[test]
    fn test_binary_variable() {
        // min x  s.t.  x >= 0.3, x binary  ->  x = 1
        let mut p = MilpProblem::new();
        let x = p.add_binary();
        p.constrain(vec![(x, 1.0)], ConstraintOp::Ge, 0.3);
        p.objective_term(x, 1.0);

        let outcome = GoodLpSolver::new(Duration::from_secs(5)).solve(&p);
        assert_eq!(outcome.status, SolveStatus::Optimal);
        assert!((outcome.values[x] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_infeasible_detected() {
        let mut p = MilpProblem::new();
        let x = p.add_var(0.0, Some(1.0));
        p.constrain(vec![(x, 1.0)], ConstraintOp::Ge, 2.0);
        p.objective_term(x, 1.0);

        let outcome = GoodLpSolver::new(Duration::from_secs(5)).solve(&p);
        assert_eq!(outcome.status, SolveStatus::Infeasible);
        assert!(outcome.values.is_empty());
    }

    #[test]
    fn test_deterministic_across_runs() {
        let build = || {
            let mut p = MilpProblem::new();
            let x = p.add_var(0.0, Some(10.0));
            let b = p.add_binary();
            p.constrain(vec![(x, 1.0), (b, -4.0)], ConstraintOp::Le, 3.0);
            p.objective_term(x, -1.0);
            p.objective_term(b, 0.5);
            p
        };
        let a = GoodLpSolver::new(Duration::from_secs(5)).solve(&build());
        let b = GoodLpSolver::new(Duration::from_secs(5)).solve(&build());
        assert_eq!(a.values, b.values);
        assert_eq!(a.objective.to_bits(), b.objective.to_bits());
    }
}
