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

mod billing;
mod cost_basis;

pub use billing::{daily_arbitrage_target, fixed_costs, BillingCycleManager};
pub use cost_basis::{CostBasisTracker, WacbState};

use chrono::{DateTime, Datelike, Duration, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use std::collections::VecDeque;

use powermaster_types::accounting::{AccountingEvent, CycleSummary};
use powermaster_types::config::{AccountingConfig, BatteryConfig, FixedCostsConfig};
use powermaster_types::tariff::TariffPoint;

/// Events kept in memory for the dashboard; the repo holds the rest.
const EVENT_RING_CAPACITY: usize = 512;

/// Measured average powers over one tick interval.
#[derive(Debug, Clone, Copy)]
pub struct TickEnergy {
    pub dt_s: f64,
    /// + import, − export
    pub grid_w: f64,
    pub solar_w: f64,
    pub load_w: f64,
    /// + charge, − discharge
    pub battery_w: f64,
}

/// What one accounting tick produced.
#[derive(Debug, Default)]
pub struct TickOutcome {
    pub events: Vec<AccountingEvent>,
    /// Completed cycle to archive, on rollover ticks
    pub archived_cycle: Option<CycleSummary>,
}

/// Snapshot for the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct AccountingSummary {
    pub wacb_c: f64,
    pub stored_wh: f64,
    pub stored_value_cents: f64,
    pub daily_arbitrage_target_cents: f64,
    pub cycle: Option<CycleSummary>,
    pub events_today: usize,
    pub today_net_cost_cents: f64,
    pub week_net_cost_cents: f64,
}

/// Orchestrates all financial tracking: WACB, billing cycle roll-up,
/// per-event P&L, fixed costs. Mutated only on tick events.
pub struct AccountingEngine {
    cost_basis: CostBasisTracker,
    billing: BillingCycleManager,
    fixed: FixedCostsConfig,
    events: VecDeque<AccountingEvent>,
    cycle_consumption_kwh: f64,
}

impl AccountingEngine {
    pub fn new(
        battery: &BatteryConfig,
        accounting: &AccountingConfig,
        fixed: FixedCostsConfig,
        tz: Tz,
        initial_soc: f64,
    ) -> Self {
        Self {
            cost_basis: CostBasisTracker::new(
                f64::from(battery.capacity_wh),
                initial_soc,
                accounting.initial_wacb_c,
            ),
            billing: BillingCycleManager::new(accounting.billing_cycle_day, tz),
            fixed,
            events: VecDeque::new(),
            cycle_consumption_kwh: 0.0,
        }
    }

    pub fn wacb_c(&self) -> f64 {
        self.cost_basis.wacb_c()
    }

    pub fn stored_wh(&self) -> f64 {
        self.cost_basis.stored_wh()
    }

    /// Process the energy deltas for one elapsed tick.
    ///
    /// `force_discharge_active` marks exports as arbitrage-induced so
    /// their P&L is booked against the cost basis.
    pub fn on_tick(
        &mut self,
        now: DateTime<Utc>,
        energy: &TickEnergy,
        tariff: Option<&TariffPoint>,
        force_discharge_active: bool,
        soc: f64,
    ) -> TickOutcome {
        let mut outcome = TickOutcome::default();

        if let Some(archived) = self.billing.roll(now) {
            outcome.archived_cycle = Some(archived);
            self.cycle_consumption_kwh = 0.0;
        }

        let wh = |power_w: f64| power_w.max(0.0) * energy.dt_s / 3600.0;
        let imported_wh = wh(energy.grid_w);
        let exported_wh = wh(-energy.grid_w);
        let charged_wh = wh(energy.battery_w);
        let discharged_wh = wh(-energy.battery_w);

        self.cycle_consumption_kwh += wh(energy.load_w) / 1000.0;

        if let Some(t) = tariff {
            // Charge attribution: PV surplus first, the rest came from
            // the grid. PV-sourced energy is valued at the feed-in rate
            // it displaced, grid-sourced at the import rate.
            let pv_surplus_wh = wh(energy.solar_w - energy.load_w);
            let pv_charge_wh = charged_wh.min(pv_surplus_wh);
            let grid_charge_wh = charged_wh - pv_charge_wh;
            self.cost_basis.record_charge(grid_charge_wh, t.import_c);
            self.cost_basis.record_charge(pv_charge_wh, t.export_c);

            let wacb = self.cost_basis.wacb_c();
            let battery_export_wh = exported_wh.min(discharged_wh);
            self.cost_basis.record_discharge(discharged_wh);

            if imported_wh > 0.0 {
                let event = AccountingEvent::import(imported_wh, t.import_c, now);
                self.billing.record_import(event.cost_cents);
                outcome.events.push(event);
            }
            if exported_wh > 0.0 {
                let basis_cents = battery_export_wh / 1000.0 * wacb;
                let event = AccountingEvent::export(exported_wh, t.export_c, basis_cents, now);
                self.billing.record_export(-event.cost_cents);
                outcome.events.push(event);
            }

            // Opportunity savings from covering load with PV directly
            let self_consumed_wh = wh(energy.solar_w.min(energy.load_w));
            if self_consumed_wh > 0.0 {
                let event = AccountingEvent::self_consumption(self_consumed_wh, t.import_c, now);
                self.billing.record_self_consumption(-event.cost_cents);
                outcome.events.push(event);
            }

            // Arbitrage P&L for force-discharge-induced exports
            if force_discharge_active && battery_export_wh > 0.0 {
                let event = AccountingEvent::arbitrage(battery_export_wh, t.export_c, wacb, now);
                self.billing.record_arbitrage(event.profit_loss_cents);
                outcome.events.push(event);
            }
        }

        // Keep fixed costs current with elapsed consumption
        if let Some(cycle) = self.billing.current() {
            let days_total = (cycle.cycle_end - cycle.cycle_start).num_days();
            let breakdown = fixed_costs(&self.fixed, days_total, self.cycle_consumption_kwh);
            self.billing.set_fixed_costs(breakdown.total_cents);
        }

        // Invariant: stored energy tracks soc × capacity at every tick
        self.cost_basis.sync_soc(soc);

        for event in &outcome.events {
            if self.events.len() >= EVENT_RING_CAPACITY {
                self.events.pop_front();
            }
            self.events.push_back(event.clone());
        }
        outcome
    }

    pub fn record_event(&mut self, event: AccountingEvent) {
        if self.events.len() >= EVENT_RING_CAPACITY {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    pub fn recent_events(&self, count: usize) -> Vec<AccountingEvent> {
        self.events.iter().rev().take(count).cloned().collect()
    }

    fn net_cost_since(&self, since: DateTime<Utc>) -> f64 {
        self.events
            .iter()
            .filter(|e| e.at >= since)
            .map(|e| e.cost_cents)
            .sum()
    }

    pub fn summary(&self, now: DateTime<Utc>) -> AccountingSummary {
        let cycle = self.billing.current().cloned();
        let days_in_cycle = cycle
            .as_ref()
            .map(|c| (c.cycle_end - c.cycle_start).num_days())
            .unwrap_or(30);

        let today_start = now
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .expect("midnight is valid")
            .and_utc();
        let week_start = today_start
            - Duration::days(i64::from(now.date_naive().weekday().num_days_from_monday()));

        AccountingSummary {
            wacb_c: self.cost_basis.wacb_c(),
            stored_wh: self.cost_basis.stored_wh(),
            stored_value_cents: self.cost_basis.stored_value_cents(),
            daily_arbitrage_target_cents: daily_arbitrage_target(&self.fixed, days_in_cycle, 20.0),
            cycle,
            events_today: self.events.iter().filter(|e| e.at >= today_start).count(),
            today_net_cost_cents: self.net_cost_since(today_start),
            week_net_cost_cents: self.net_cost_since(week_start),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::UTC;
    use powermaster_types::accounting::AccountingEventKind;

    fn engine(initial_soc: f64) -> AccountingEngine {
        AccountingEngine::new(
            &BatteryConfig::default(),
            &AccountingConfig {
                billing_cycle_day: 1,
                timezone: "UTC".into(),
                initial_wacb_c: 10.0,
            },
            FixedCostsConfig::default(),
            UTC,
            initial_soc,
        )
    }

    fn tariff(import_c: f64, export_c: f64) -> TariffPoint {
        TariffPoint::new(Utc::now(), import_c, export_c)
    }

    #[test]
    fn test_import_tick_books_cost() {
        let mut e = engine(0.5);
        let now = Utc::now();
        // 2 kW import for half an hour = 1 kWh at 30c
        let energy = TickEnergy {
            dt_s: 1800.0,
            grid_w: 2000.0,
            solar_w: 0.0,
            load_w: 2000.0,
            battery_w: 0.0,
        };
        let out = e.on_tick(now, &energy, Some(&tariff(30.0, 8.0)), false, 0.5);
        let import = out
            .events
            .iter()
            .find(|ev| ev.kind == AccountingEventKind::GridImport)
            .unwrap();
        assert!((import.cost_cents - 30.0).abs() < 1e-6);
        let cycle = e.billing.current().unwrap();
        assert!((cycle.import_cost_cents - 30.0).abs() < 1e-6);
    }

    #[test]
    fn test_grid_charge_updates_wacb_at_import_rate() {
        let mut e = engine(0.0);
        let now = Utc::now();
        // Force charge from grid: 5 kWh at 20c
        let energy = TickEnergy {
            dt_s: 3600.0,
            grid_w: 5000.0,
            solar_w: 0.0,
            load_w: 0.0,
            battery_w: 5000.0,
        };
        e.on_tick(now, &energy, Some(&tariff(20.0, 8.0)), false, 0.5);
        assert!((e.wacb_c() - 20.0).abs() < 1e-6);
    }

    #[test]
    fn test_pv_charge_uses_opportunity_cost() {
        let mut e = engine(0.0);
        let now = Utc::now();
        // All charge covered by PV surplus: valued at the feed-in rate
        let energy = TickEnergy {
            dt_s: 3600.0,
            grid_w: 0.0,
            solar_w: 4000.0,
            load_w: 1000.0,
            battery_w: 3000.0,
        };
        e.on_tick(now, &energy, Some(&tariff(30.0, 8.0)), false, 0.3);
        assert!((e.wacb_c() - 8.0).abs() < 1e-6);
    }

    #[test]
    fn test_arbitrage_pnl_on_forced_export() {
        let mut e = engine(0.8); // stored at wacb 10c
        let now = Utc::now();
        // Force discharge 4 kW to grid for 30 min at 95c export
        let energy = TickEnergy {
            dt_s: 1800.0,
            grid_w: -4000.0,
            solar_w: 0.0,
            load_w: 0.0,
            battery_w: -4000.0,
        };
        let out = e.on_tick(now, &energy, Some(&tariff(5.0, 95.0)), true, 0.6);
        let arb = out
            .events
            .iter()
            .find(|ev| ev.kind == AccountingEventKind::Arbitrage)
            .unwrap();
        // (95 − 10) c/kWh × 2 kWh = 170 c
        assert!((arb.profit_loss_cents - 170.0).abs() < 1e-6);
        let cycle = e.billing.current().unwrap();
        assert!((cycle.arbitrage_profit_cents - 170.0).abs() < 1e-6);
    }

    #[test]
    fn test_self_consumption_savings() {
        let mut e = engine(0.5);
        let now = Utc::now();
        let energy = TickEnergy {
            dt_s: 3600.0,
            grid_w: 0.0,
            solar_w: 2000.0,
            load_w: 1500.0,
            battery_w: 500.0,
        };
        let out = e.on_tick(now, &energy, Some(&tariff(40.0, 8.0)), false, 0.55);
        let sc = out
            .events
            .iter()
            .find(|ev| ev.kind == AccountingEventKind::SelfConsumption)
            .unwrap();
        // min(2000, 1500) W × 1 h = 1.5 kWh at 40c avoided
        assert!((sc.cost_cents - -60.0).abs() < 1e-6);
    }

    #[test]
    fn test_stored_energy_tracks_soc() {
        let mut e = engine(0.5);
        let energy = TickEnergy {
            dt_s: 300.0,
            grid_w: 0.0,
            solar_w: 0.0,
            load_w: 500.0,
            battery_w: -500.0,
        };
        e.on_tick(Utc::now(), &energy, Some(&tariff(20.0, 8.0)), false, 0.42);
        // Invariant: stored_wh == soc × capacity after every tick
        assert!((e.stored_wh() - 4200.0).abs() < 1e-6);
    }

    #[test]
    fn test_no_tariff_still_syncs_soc() {
        let mut e = engine(0.5);
        let energy = TickEnergy {
            dt_s: 300.0,
            grid_w: 1000.0,
            solar_w: 0.0,
            load_w: 1000.0,
            battery_w: 0.0,
        };
        let out = e.on_tick(Utc::now(), &energy, None, false, 0.48);
        assert!(out.events.is_empty());
        assert!((e.stored_wh() - 4800.0).abs() < 1e-6);
    }

    /// Accounting conservation: cycle totals equal the sum of the raw
    /// per-tick integrals.
    #[test]
    fn test_cycle_totals_match_event_sums() {
        let mut e = engine(0.5);
        let now = Utc::now();
        let t = tariff(25.0, 9.0);
        let mut expected_import = 0.0;
        let mut expected_self = 0.0;
        for i in 0..10 {
            let energy = TickEnergy {
                dt_s: 300.0,
                grid_w: 800.0 + 100.0 * i as f64,
                solar_w: 600.0,
                load_w: 1400.0 + 100.0 * i as f64,
                battery_w: 0.0,
            };
            expected_import += energy.grid_w * 300.0 / 3600.0 / 1000.0 * 25.0;
            expected_self += 600.0 * 300.0 / 3600.0 / 1000.0 * 25.0;
            e.on_tick(now + Duration::seconds(300 * i), &energy, Some(&t), false, 0.5);
        }
        let cycle = e.billing.current().unwrap();
        assert!((cycle.import_cost_cents - expected_import).abs() / expected_import < 1e-3);
        assert!((cycle.self_consumption_cents - expected_self).abs() / expected_self < 1e-3);
    }

    #[test]
    fn test_summary_counts_today() {
        let mut e = engine(0.5);
        let now = Utc::now();
        let energy = TickEnergy {
            dt_s: 300.0,
            grid_w: 1000.0,
            solar_w: 0.0,
            load_w: 1000.0,
            battery_w: 0.0,
        };
        e.on_tick(now, &energy, Some(&tariff(20.0, 8.0)), false, 0.5);
        let summary = e.summary(now);
        assert!(summary.events_today >= 1);
        assert!(summary.today_net_cost_cents > 0.0);
    }
}
