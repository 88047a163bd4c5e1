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

use chrono::{DateTime, Datelike, TimeZone, Utc};
use chrono_tz::Tz;
use tracing::info;

use powermaster_types::accounting::{CycleSummary, FixedCostBreakdown};
use powermaster_types::config::FixedCostsConfig;

/// Midnight (local) on the given day, resolved to UTC. Falls forward to
/// the earliest valid instant on DST-gap days.
fn local_midnight(tz: Tz, year: i32, month: u32, day: u32) -> DateTime<Utc> {
    tz.with_ymd_and_hms(year, month, day, 0, 0, 0)
        .earliest()
        .or_else(|| tz.with_ymd_and_hms(year, month, day, 1, 0, 0).earliest())
        .expect("billing day resolves to a valid local time")
        .with_timezone(&Utc)
}

fn prev_month(year: i32, month: u32) -> (i32, u32) {
    if month == 1 {
        (year - 1, 12)
    } else {
        (year, month - 1)
    }
}

fn next_month(year: i32, month: u32) -> (i32, u32) {
    if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    }
}

/// Manages billing cycle boundaries and cost accumulation. Cycles run
/// from local midnight on `billing_day` to local midnight on
/// `billing_day` of the following month (`billing_day` is restricted to
/// 1..=28 so every month has it).
#[derive(Debug)]
pub struct BillingCycleManager {
    billing_day: u32,
    tz: Tz,
    current: Option<CycleSummary>,
}

impl BillingCycleManager {
    pub fn new(billing_day: u32, tz: Tz) -> Self {
        Self {
            billing_day,
            tz,
            current: None,
        }
    }

    pub fn current(&self) -> Option<&CycleSummary> {
        self.current.as_ref()
    }

    fn cycle_boundaries(&self, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        let local = now.with_timezone(&self.tz);
        let (mut y, mut m) = (local.year(), local.month());
        let mut start = local_midnight(self.tz, y, m, self.billing_day);
        if start > now {
            (y, m) = prev_month(y, m);
            start = local_midnight(self.tz, y, m, self.billing_day);
        }
        let (ey, em) = next_month(y, m);
        let end = local_midnight(self.tz, ey, em, self.billing_day);
        (start, end)
    }

    /// Current cycle, creating or rolling over as needed. A rollover
    /// returns the completed cycle so the caller can archive it.
    pub fn roll(&mut self, now: DateTime<Utc>) -> Option<CycleSummary> {
        if let Some(current) = &mut self.current {
            if current.cycle_start <= now && now < current.cycle_end {
                current.days_elapsed = (now - current.cycle_start).num_days();
                current.days_remaining = (current.cycle_end - now).num_days().max(0);
                return None;
            }
        }

        let (start, end) = self.cycle_boundaries(now);
        let archived = self.current.take();
        if let Some(prev) = &archived {
            info!(
                cycle_start = %prev.cycle_start,
                net_cents = prev.net_cost_cents,
                "billing cycle rolled over"
            );
        }
        self.current = Some(CycleSummary {
            cycle_start: start,
            cycle_end: end,
            days_elapsed: (now - start).num_days(),
            days_remaining: (end - now).num_days().max(0),
            import_cost_cents: 0.0,
            export_revenue_cents: 0.0,
            self_consumption_cents: 0.0,
            arbitrage_profit_cents: 0.0,
            fixed_costs_cents: 0.0,
            net_cost_cents: 0.0,
        });
        archived
    }

    fn with_current(&mut self, f: impl FnOnce(&mut CycleSummary)) {
        if let Some(current) = &mut self.current {
            f(current);
            current.recompute_net();
        }
    }

    pub fn record_import(&mut self, cost_cents: f64) {
        self.with_current(|c| c.import_cost_cents += cost_cents);
    }

    pub fn record_export(&mut self, revenue_cents: f64) {
        self.with_current(|c| c.export_revenue_cents += revenue_cents);
    }

    pub fn record_self_consumption(&mut self, value_cents: f64) {
        self.with_current(|c| c.self_consumption_cents += value_cents);
    }

    pub fn record_arbitrage(&mut self, profit_cents: f64) {
        self.with_current(|c| c.arbitrage_profit_cents += profit_cents);
    }

    pub fn set_fixed_costs(&mut self, fixed_cents: f64) {
        self.with_current(|c| c.fixed_costs_cents = fixed_cents);
    }
}

/// Fixed costs for a billing period.
pub fn fixed_costs(
    config: &FixedCostsConfig,
    days_in_cycle: i64,
    consumption_kwh: f64,
) -> FixedCostBreakdown {
    let supply = config.monthly_supply_charge_cents;
    let access = config.daily_access_fee_cents * days_in_cycle as f64;
    let hedging = consumption_kwh * config.hedging_per_kwh_cents;
    FixedCostBreakdown {
        supply_charge_cents: supply,
        access_fee_cents: access,
        hedging_cents: hedging,
        total_cents: supply + access + hedging,
    }
}

/// Daily arbitrage profit needed to offset the fixed costs.
pub fn daily_arbitrage_target(
    config: &FixedCostsConfig,
    days_in_cycle: i64,
    daily_consumption_kwh: f64,
) -> f64 {
    config.monthly_supply_charge_cents / days_in_cycle.max(1) as f64
        + config.daily_access_fee_cents
        + daily_consumption_kwh * config.hedging_per_kwh_cents
}
