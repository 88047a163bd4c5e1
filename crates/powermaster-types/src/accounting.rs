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
use serde::{Deserialize, Serialize};

// ============= Events =============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountingEventKind {
    GridImport,
    GridExport,
    SelfConsumption,
    Arbitrage,
    PlannerFallback,
    CycleRollover,
}

/// A single accounting event. `cost_cents` is positive for costs and
/// negative for revenue/savings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountingEvent {
    pub kind: AccountingEventKind,
    pub energy_wh: f64,
    /// Rate applied (c/kWh)
    pub rate_c: f64,
    pub cost_cents: f64,
    /// WACB-based cost of discharged energy, for export events
    pub cost_basis_cents: f64,
    /// revenue − cost basis, for arbitrage events
    pub profit_loss_cents: f64,
    pub at: DateTime<Utc>,
}

impl AccountingEvent {
    pub fn import(energy_wh: f64, rate_c: f64, at: DateTime<Utc>) -> Self {
        Self {
            kind: AccountingEventKind::GridImport,
            energy_wh,
            rate_c,
            cost_cents: energy_wh / 1000.0 * rate_c,
            cost_basis_cents: 0.0,
            profit_loss_cents: 0.0,
            at,
        }
    }

    pub fn export(energy_wh: f64, rate_c: f64, cost_basis_cents: f64, at: DateTime<Utc>) -> Self {
        let revenue = energy_wh / 1000.0 * rate_c;
        Self {
            kind: AccountingEventKind::GridExport,
            energy_wh,
            rate_c,
            cost_cents: -revenue,
            cost_basis_cents,
            profit_loss_cents: revenue - cost_basis_cents,
            at,
        }
    }

    pub fn self_consumption(energy_wh: f64, avoided_rate_c: f64, at: DateTime<Utc>) -> Self {
        let value = energy_wh / 1000.0 * avoided_rate_c;
        Self {
            kind: AccountingEventKind::SelfConsumption,
            energy_wh,
            rate_c: avoided_rate_c,
            cost_cents: -value,
            cost_basis_cents: 0.0,
            profit_loss_cents: 0.0,
            at,
        }
    }

    pub fn arbitrage(energy_wh: f64, export_rate_c: f64, wacb_c: f64, at: DateTime<Utc>) -> Self {
        let kwh = energy_wh / 1000.0;
        Self {
            kind: AccountingEventKind::Arbitrage,
            energy_wh,
            rate_c: export_rate_c,
            cost_cents: 0.0,
            cost_basis_cents: kwh * wacb_c,
            profit_loss_cents: (export_rate_c - wacb_c) * kwh,
            at,
        }
    }
}

// ============= Billing Cycle =============

/// Accumulated totals for one billing cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleSummary {
    pub cycle_start: DateTime<Utc>,
    pub cycle_end: DateTime<Utc>,
    pub days_elapsed: i64,
    pub days_remaining: i64,
    pub import_cost_cents: f64,
    pub export_revenue_cents: f64,
    pub self_consumption_cents: f64,
    pub arbitrage_profit_cents: f64,
    pub fixed_costs_cents: f64,
    pub net_cost_cents: f64,
}

impl CycleSummary {
    pub fn recompute_net(&mut self) {
        self.net_cost_cents = self.import_cost_cents + self.fixed_costs_cents
            - self.export_revenue_cents
            - self.self_consumption_cents
            - self.arbitrage_profit_cents;
    }
}

/// Breakdown of fixed costs for a billing period.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FixedCostBreakdown {
    pub supply_charge_cents: f64,
    pub access_fee_cents: f64,
    pub hedging_cents: f64,
    pub total_cents: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_event_profit() {
        let at = Utc::now();
        // 2 kWh exported at 95 c/kWh with an 18 c cost basis per kWh
        let e = AccountingEvent::export(2000.0, 95.0, 36.0, at);
        assert!((e.cost_cents - -190.0).abs() < 1e-9);
        assert!((e.profit_loss_cents - 154.0).abs() < 1e-9);
    }

    #[test]
    fn test_self_consumption_is_negative_cost() {
        let e = AccountingEvent::self_consumption(1500.0, 30.0, Utc::now());
        assert!((e.cost_cents - -45.0).abs() < 1e-9);
    }

    #[test]
    fn test_cycle_net() {
        let now = Utc::now();
        let mut c = CycleSummary {
            cycle_start: now,
            cycle_end: now,
            days_elapsed: 0,
            days_remaining: 30,
            import_cost_cents: 1000.0,
            export_revenue_cents: 300.0,
            self_consumption_cents: 200.0,
            arbitrage_profit_cents: 50.0,
            fixed_costs_cents: 400.0,
            net_cost_cents: 0.0,
        };
        c.recompute_net();
        assert!((c.net_cost_cents - 850.0).abs() < 1e-9);
    }
}
