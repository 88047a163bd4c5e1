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

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::params;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;
use tracing::{info, warn};

use powermaster_types::accounting::{AccountingEvent, AccountingEventKind, CycleSummary};
use powermaster_types::inverter::{FaultFlags, OperatingMode, Telemetry, UserOverride};
use powermaster_types::loads::LoadRuntime;
use powermaster_types::plan::Plan;
use powermaster_types::tariff::TariffPoint;

/// Unrecoverable database problems; startup maps this to exit code 3.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("database corrupt and recovery failed: {0}")]
    Unrecoverable(String),
}

/// Daily accounting roll-up row.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DailySummary {
    pub day: String,
    pub import_cost_cents: f64,
    pub export_revenue_cents: f64,
    pub self_consumption_cents: f64,
    pub arbitrage_profit_cents: f64,
}

/// SQLite persistence. Single writer, many readers, WAL journal; the
/// control loop drives a periodic checkpoint.
#[derive(Debug)]
pub struct Database {
    conn: Mutex<rusqlite::Connection>,
}

impl Database {
    /// Open (creating directories and schema as needed) and verify
    /// integrity. A corrupt file is recovered row-by-row into a fresh
    /// database; when that also fails, `DbError::Unrecoverable` comes
    /// back and the process must exit with code 3.
    pub fn open(path: &str) -> Result<Self> {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create database directory: {}", parent.display())
                })?;
            }
        }

        let conn = rusqlite::Connection::open(path)
            .with_context(|| format!("Failed to open database: {path}"))?;

        if !integrity_ok(&conn) {
            warn!(path = path, "database failed integrity check, attempting recovery");
            drop(conn);
            return Self::recover(path);
        }

        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(rusqlite::Connection::open_in_memory()?)
    }

    fn from_connection(conn: rusqlite::Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("Failed to enable WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS telemetry (
                id             INTEGER PRIMARY KEY AUTOINCREMENT,
                read_at        TEXT NOT NULL,
                soc            REAL NOT NULL,
                solar_w        REAL NOT NULL,
                load_w         REAL NOT NULL,
                grid_w         REAL NOT NULL,
                battery_w      REAL NOT NULL,
                inverter_mode  INTEGER NOT NULL,
                fault_flags    INTEGER NOT NULL,
                grid_available INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_telemetry_read_at ON telemetry(read_at);

            CREATE TABLE IF NOT EXISTS prices (
                slot_start     TEXT PRIMARY KEY,
                import_c       REAL NOT NULL,
                export_c       REAL NOT NULL,
                spike          INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS plans (
                id             INTEGER PRIMARY KEY AUTOINCREMENT,
                built_at       TEXT NOT NULL,
                horizon_end    TEXT NOT NULL,
                plan_json      TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_plans_built_at ON plans(built_at DESC);

            CREATE TABLE IF NOT EXISTS accounting_events (
                id                INTEGER PRIMARY KEY AUTOINCREMENT,
                at                TEXT NOT NULL,
                kind              TEXT NOT NULL,
                energy_wh         REAL NOT NULL,
                rate_c            REAL NOT NULL,
                cost_cents        REAL NOT NULL,
                cost_basis_cents  REAL NOT NULL,
                profit_loss_cents REAL NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_accounting_at ON accounting_events(at);

            CREATE TABLE IF NOT EXISTS billing_cycles (
                id           INTEGER PRIMARY KEY AUTOINCREMENT,
                cycle_start  TEXT NOT NULL,
                cycle_end    TEXT NOT NULL,
                summary_json TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS load_state (
                name        TEXT PRIMARY KEY,
                state_json  TEXT NOT NULL,
                updated_at  TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS overrides (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                mode        INTEGER NOT NULL,
                power_w     INTEGER,
                expires_at  TEXT NOT NULL,
                set_at      TEXT NOT NULL,
                cleared     INTEGER NOT NULL DEFAULT 0
            );",
        )
        .context("Failed to initialize database schema")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Row-level recovery: read whatever survives from the corrupt file
    /// into a fresh database next to it.
    fn recover(path: &str) -> Result<Self> {
        let corrupt_path = format!("{path}.corrupt");
        std::fs::rename(path, &corrupt_path)
            .map_err(|e| DbError::Unrecoverable(format!("cannot move corrupt db aside: {e}")))?;

        let fresh = Self::open(path)?;
        let salvage = rusqlite::Connection::open(&corrupt_path)
            .map_err(|e| DbError::Unrecoverable(e.to_string()))?;

        let mut recovered = 0u64;
        {
            let conn = fresh.conn.lock().expect("database mutex poisoned");
            // Telemetry is the bulk of the data and the only history
            // the optimiser actually needs back
            if let Ok(mut stmt) = salvage.prepare(
                "SELECT read_at, soc, solar_w, load_w, grid_w, battery_w, inverter_mode, fault_flags, grid_available FROM telemetry",
            ) {
                let rows = stmt.query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, f64>(1)?,
                        row.get::<_, f64>(2)?,
                        row.get::<_, f64>(3)?,
                        row.get::<_, f64>(4)?,
                        row.get::<_, f64>(5)?,
                        row.get::<_, i64>(6)?,
                        row.get::<_, i64>(7)?,
                        row.get::<_, i64>(8)?,
                    ))
                });
                if let Ok(rows) = rows {
                    for row in rows.flatten() {
                        let inserted = conn.execute(
                            "INSERT INTO telemetry (read_at, soc, solar_w, load_w, grid_w, battery_w, inverter_mode, fault_flags, grid_available)
                             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                            params![row.0, row.1, row.2, row.3, row.4, row.5, row.6, row.7, row.8],
                        );
                        if inserted.is_ok() {
                            recovered += 1;
                        }
                    }
                }
            }

            if !integrity_ok(&conn) {
                return Err(DbError::Unrecoverable("recovered database still corrupt".into()).into());
            }
        }

        info!(recovered_rows = recovered, "database recovered into fresh file");
        Ok(fresh)
    }

    /// Checkpoint the WAL; called on the 30-minute cadence and at
    /// shutdown.
    pub fn checkpoint(&self) -> Result<()> {
        let conn = self.conn.lock().expect("database mutex poisoned");
        conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
        Ok(())
    }

    // ============= Telemetry Repo =============

    pub fn record_telemetry(&self, t: &Telemetry) -> Result<()> {
        let conn = self.conn.lock().expect("database mutex poisoned");
        conn.execute(
            "INSERT INTO telemetry (read_at, soc, solar_w, load_w, grid_w, battery_w, inverter_mode, fault_flags, grid_available)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                t.read_at.to_rfc3339(),
                t.soc,
                t.solar_w,
                t.load_w,
                t.grid_w,
                t.battery_w,
                t.inverter_mode.wire_value(),
                t.fault_flags.0,
                t.grid_available as i64,
            ],
        )?;
        Ok(())
    }

    pub fn query_telemetry(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Telemetry>> {
        let conn = self.conn.lock().expect("database mutex poisoned");
        let mut stmt = conn.prepare(
            "SELECT read_at, soc, solar_w, load_w, grid_w, battery_w, inverter_mode, fault_flags, grid_available
             FROM telemetry WHERE read_at >= ?1 AND read_at < ?2 ORDER BY read_at",
        )?;
        let rows = stmt
            .query_map(params![from.to_rfc3339(), to.to_rfc3339()], |row| {
                let read_at: String = row.get(0)?;
                let mode: u16 = row.get(6)?;
                let flags: u32 = row.get(7)?;
                let grid_available: i64 = row.get(8)?;
                Ok(Telemetry {
                    soc: row.get(1)?,
                    solar_w: row.get(2)?,
                    load_w: row.get(3)?,
                    grid_w: row.get(4)?,
                    battery_w: row.get(5)?,
                    inverter_mode: OperatingMode::from_wire_value(mode)
                        .unwrap_or(OperatingMode::SelfUse),
                    fault_flags: FaultFlags(flags),
                    grid_available: grid_available != 0,
                    read_at: read_at
                        .parse::<DateTime<Utc>>()
                        .unwrap_or_else(|_| Utc::now()),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Bucketed telemetry: averages over `bucket_s`-second windows,
    /// keyed by window start. Used for long dashboard ranges where raw
    /// 5-second samples would be absurd.
    pub fn query_telemetry_bucketed(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        bucket_s: u32,
    ) -> Result<Vec<Telemetry>> {
        let conn = self.conn.lock().expect("database mutex poisoned");
        let mut stmt = conn.prepare(
            "SELECT MIN(read_at), AVG(soc), AVG(solar_w), AVG(load_w), AVG(grid_w), AVG(battery_w),
                    MAX(inverter_mode), MAX(fault_flags), MIN(grid_available)
             FROM telemetry WHERE read_at >= ?1 AND read_at < ?2
             GROUP BY CAST(unixepoch(read_at) / ?3 AS INTEGER)
             ORDER BY MIN(read_at)",
        )?;
        let rows = stmt
            .query_map(
                params![from.to_rfc3339(), to.to_rfc3339(), bucket_s],
                |row| {
                    let read_at: String = row.get(0)?;
                    let mode: u16 = row.get(6)?;
                    let flags: u32 = row.get(7)?;
                    let grid_available: i64 = row.get(8)?;
                    Ok(Telemetry {
                        soc: row.get(1)?,
                        solar_w: row.get(2)?,
                        load_w: row.get(3)?,
                        grid_w: row.get(4)?,
                        battery_w: row.get(5)?,
                        inverter_mode: OperatingMode::from_wire_value(mode)
                            .unwrap_or(OperatingMode::SelfUse),
                        fault_flags: FaultFlags(flags),
                        grid_available: grid_available != 0,
                        read_at: read_at
                            .parse::<DateTime<Utc>>()
                            .unwrap_or_else(|_| Utc::now()),
                    })
                },
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn prune_telemetry(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let conn = self.conn.lock().expect("database mutex poisoned");
        let deleted = conn.execute(
            "DELETE FROM telemetry WHERE read_at < ?1",
            params![older_than.to_rfc3339()],
        )?;
        Ok(deleted as u64)
    }

    // ============= Price Repo =============

    pub fn record_price(&self, p: &TariffPoint) -> Result<()> {
        let conn = self.conn.lock().expect("database mutex poisoned");
        conn.execute(
            "INSERT INTO prices (slot_start, import_c, export_c, spike) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(slot_start) DO UPDATE SET import_c = ?2, export_c = ?3, spike = ?4",
            params![
                p.slot_start.to_rfc3339(),
                p.import_c,
                p.export_c,
                p.spike_flag as i64
            ],
        )?;
        Ok(())
    }

    pub fn query_prices(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<TariffPoint>> {
        let conn = self.conn.lock().expect("database mutex poisoned");
        let mut stmt = conn.prepare(
            "SELECT slot_start, import_c, export_c, spike FROM prices
             WHERE slot_start >= ?1 AND slot_start < ?2 ORDER BY slot_start",
        )?;
        let rows = stmt
            .query_map(params![from.to_rfc3339(), to.to_rfc3339()], |row| {
                let slot_start: String = row.get(0)?;
                let spike: i64 = row.get(3)?;
                Ok(TariffPoint {
                    slot_start: slot_start
                        .parse::<DateTime<Utc>>()
                        .unwrap_or_else(|_| Utc::now()),
                    import_c: row.get(1)?,
                    export_c: row.get(2)?,
                    spike_flag: spike != 0,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ============= Plan Repo =============

    pub fn save_plan(&self, plan: &Plan) -> Result<()> {
        let conn = self.conn.lock().expect("database mutex poisoned");
        conn.execute(
            "INSERT INTO plans (built_at, horizon_end, plan_json) VALUES (?1, ?2, ?3)",
            params![
                plan.built_at.to_rfc3339(),
                plan.horizon_end.to_rfc3339(),
                serde_json::to_string(plan)?
            ],
        )?;
        Ok(())
    }

    pub fn latest_plan(&self) -> Result<Option<Plan>> {
        let conn = self.conn.lock().expect("database mutex poisoned");
        let row: Option<String> = conn
            .query_row(
                "SELECT plan_json FROM plans ORDER BY built_at DESC, id DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(match row {
            Some(json) => Some(serde_json::from_str(&json)?),
            None => None,
        })
    }

    /// Most recent plan whose horizon still covers `now`.
    pub fn get_active_plan_for(&self, now: DateTime<Utc>) -> Result<Option<Plan>> {
        let conn = self.conn.lock().expect("database mutex poisoned");
        let row: Option<String> = conn
            .query_row(
                "SELECT plan_json FROM plans WHERE built_at <= ?1 AND horizon_end > ?1
                 ORDER BY built_at DESC, id DESC LIMIT 1",
                params![now.to_rfc3339()],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(match row {
            Some(json) => Some(serde_json::from_str(&json)?),
            None => None,
        })
    }

    // ============= Accounting Repo =============

    pub fn record_event(&self, e: &AccountingEvent) -> Result<()> {
        let kind = match e.kind {
            AccountingEventKind::GridImport => "grid_import",
            AccountingEventKind::GridExport => "grid_export",
            AccountingEventKind::SelfConsumption => "self_consumption",
            AccountingEventKind::Arbitrage => "arbitrage",
            AccountingEventKind::PlannerFallback => "planner_fallback",
            AccountingEventKind::CycleRollover => "cycle_rollover",
        };
        let conn = self.conn.lock().expect("database mutex poisoned");
        conn.execute(
            "INSERT INTO accounting_events (at, kind, energy_wh, rate_c, cost_cents, cost_basis_cents, profit_loss_cents)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                e.at.to_rfc3339(),
                kind,
                e.energy_wh,
                e.rate_c,
                e.cost_cents,
                e.cost_basis_cents,
                e.profit_loss_cents
            ],
        )?;
        Ok(())
    }

    pub fn archive_cycle(&self, cycle: &CycleSummary) -> Result<()> {
        let conn = self.conn.lock().expect("database mutex poisoned");
        conn.execute(
            "INSERT INTO billing_cycles (cycle_start, cycle_end, summary_json) VALUES (?1, ?2, ?3)",
            params![
                cycle.cycle_start.to_rfc3339(),
                cycle.cycle_end.to_rfc3339(),
                serde_json::to_string(cycle)?
            ],
        )?;
        Ok(())
    }

    /// Per-day roll-up of the accounting events in `[from, to)`.
    pub fn daily_summaries(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<DailySummary>> {
        let conn = self.conn.lock().expect("database mutex poisoned");
        let mut stmt = conn.prepare(
            "SELECT date(at),
                    SUM(CASE WHEN kind = 'grid_import' THEN cost_cents ELSE 0 END),
                    SUM(CASE WHEN kind = 'grid_export' THEN -cost_cents ELSE 0 END),
                    SUM(CASE WHEN kind = 'self_consumption' THEN -cost_cents ELSE 0 END),
                    SUM(CASE WHEN kind = 'arbitrage' THEN profit_loss_cents ELSE 0 END)
             FROM accounting_events WHERE at >= ?1 AND at < ?2
             GROUP BY date(at) ORDER BY date(at)",
        )?;
        let rows = stmt
            .query_map(params![from.to_rfc3339(), to.to_rfc3339()], |row| {
                Ok(DailySummary {
                    day: row.get(0)?,
                    import_cost_cents: row.get(1)?,
                    export_revenue_cents: row.get(2)?,
                    self_consumption_cents: row.get(3)?,
                    arbitrage_profit_cents: row.get(4)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ============= Load State Repo =============

    pub fn save_load_state(&self, name: &str, runtime: &LoadRuntime) -> Result<()> {
        let conn = self.conn.lock().expect("database mutex poisoned");
        conn.execute(
            "INSERT INTO load_state (name, state_json, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(name) DO UPDATE SET state_json = ?2, updated_at = ?3",
            params![
                name,
                serde_json::to_string(runtime)?,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    pub fn load_load_states(&self) -> Result<Vec<(String, LoadRuntime)>> {
        let conn = self.conn.lock().expect("database mutex poisoned");
        let mut stmt = conn.prepare("SELECT name, state_json FROM load_state")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows
            .into_iter()
            .filter_map(|(name, json)| {
                serde_json::from_str(&json).ok().map(|state| (name, state))
            })
            .collect())
    }

    // ============= Override Repo =============

    pub fn save_override(&self, o: &UserOverride) -> Result<()> {
        let conn = self.conn.lock().expect("database mutex poisoned");
        conn.execute(
            "INSERT INTO overrides (mode, power_w, expires_at, set_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                o.mode.wire_value(),
                o.power_w,
                o.expires_at.to_rfc3339(),
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    pub fn clear_override(&self) -> Result<()> {
        let conn = self.conn.lock().expect("database mutex poisoned");
        conn.execute("UPDATE overrides SET cleared = 1 WHERE cleared = 0", [])?;
        Ok(())
    }

    /// The last uncancelled override, if it has not yet expired.
    pub fn active_override(&self, now: DateTime<Utc>) -> Result<Option<UserOverride>> {
        let conn = self.conn.lock().expect("database mutex poisoned");
        let row = conn
            .query_row(
                "SELECT mode, power_w, expires_at FROM overrides
                 WHERE cleared = 0 ORDER BY id DESC LIMIT 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, u16>(0)?,
                        row.get::<_, Option<u32>>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;

        Ok(row.and_then(|(mode, power_w, expires_at)| {
            let expires_at = expires_at.parse::<DateTime<Utc>>().ok()?;
            if expires_at <= now {
                return None;
            }
            Some(UserOverride {
                mode: OperatingMode::from_wire_value(mode)?,
                power_w,
                expires_at,
            })
        }))
    }
}

fn integrity_ok(conn: &rusqlite::Connection) -> bool {
    conn.query_row("PRAGMA integrity_check", [], |row| row.get::<_, String>(0))
        .map(|s| s == "ok")
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use powermaster_types::plan::{PlanSlot, PlanStatus};
    use std::collections::BTreeSet;

    fn telemetry(at: DateTime<Utc>) -> Telemetry {
        Telemetry {
            soc: 0.55,
            solar_w: 1200.0,
            load_w: 700.0,
            grid_w: -500.0,
            battery_w: 0.0,
            inverter_mode: OperatingMode::SelfUse,
            fault_flags: FaultFlags::NONE,
            grid_available: true,
            read_at: at,
        }
    }

    #[test]
    fn test_telemetry_round_trip() {
        let db = Database::open_in_memory().unwrap();
        let now = Utc::now();
        db.record_telemetry(&telemetry(now)).unwrap();
        db.record_telemetry(&telemetry(now + Duration::seconds(5))).unwrap();

        let rows = db
            .query_telemetry(now - Duration::minutes(1), now + Duration::minutes(1))
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert!((rows[0].soc - 0.55).abs() < 1e-9);
        assert_eq!(rows[0].inverter_mode, OperatingMode::SelfUse);
    }

    #[test]
    fn test_bucketed_telemetry_averages() {
        let db = Database::open_in_memory().unwrap();
        let base = Utc::now();
        for i in 0..6 {
            let mut t = telemetry(base + Duration::seconds(5 * i));
            t.load_w = 600.0 + 100.0 * i as f64;
            db.record_telemetry(&t).unwrap();
        }
        let rows = db
            .query_telemetry_bucketed(base - Duration::minutes(1), base + Duration::minutes(1), 3600)
            .unwrap();
        assert_eq!(rows.len(), 1);
        // Average of 600..=1100 stepped by 100
        assert!((rows[0].load_w - 850.0).abs() < 1e-6);
    }

    #[test]
    fn test_price_upsert() {
        let db = Database::open_in_memory().unwrap();
        let slot = Utc::now();
        db.record_price(&TariffPoint::new(slot, 20.0, 8.0)).unwrap();
        db.record_price(&TariffPoint::new(slot, 25.0, 9.0)).unwrap();
        let rows = db
            .query_prices(slot - Duration::minutes(1), slot + Duration::minutes(1))
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert!((rows[0].import_c - 25.0).abs() < 1e-9);
    }

    #[test]
    fn test_plan_save_and_active_lookup() {
        let db = Database::open_in_memory().unwrap();
        let now = Utc::now();
        let plan = Plan {
            slots: vec![PlanSlot {
                slot_start: now,
                mode: OperatingMode::SelfUse,
                charge_w: 0.0,
                discharge_w: 0.0,
                expected_soc: 0.5,
                scheduled_loads: BTreeSet::new(),
                import_c: 20.0,
                export_c: 8.0,
                solar_forecast_w: 0.0,
                load_forecast_w: 500.0,
            }],
            built_at: now,
            horizon_end: now + Duration::hours(48),
            forecast_hash: 1,
            tariff_hash: 2,
            params_hash: 3,
            battery_soc_at_build: 0.5,
            objective_cents: -12.5,
            status: PlanStatus::Optimal,
            trigger: "initial".into(),
            solver_time_ms: 42,
        };
        db.save_plan(&plan).unwrap();

        let latest = db.latest_plan().unwrap().unwrap();
        assert_eq!(latest.forecast_hash, 1);

        let active = db.get_active_plan_for(now + Duration::hours(1)).unwrap();
        assert!(active.is_some());
        let none = db.get_active_plan_for(now + Duration::hours(49)).unwrap();
        assert!(none.is_none());
    }

    #[test]
    fn test_override_lifecycle() {
        let db = Database::open_in_memory().unwrap();
        let now = Utc::now();
        db.save_override(&UserOverride {
            mode: OperatingMode::ForceCharge,
            power_w: Some(3000),
            expires_at: now + Duration::seconds(3600),
        })
        .unwrap();

        let active = db.active_override(now).unwrap().unwrap();
        assert_eq!(active.mode, OperatingMode::ForceCharge);

        // Expired lookups return nothing
        assert!(db.active_override(now + Duration::seconds(3601)).unwrap().is_none());

        db.clear_override().unwrap();
        assert!(db.active_override(now).unwrap().is_none());
    }

    #[test]
    fn test_daily_summaries() {
        let db = Database::open_in_memory().unwrap();
        let now = Utc::now();
        db.record_event(&AccountingEvent::import(2000.0, 30.0, now)).unwrap();
        db.record_event(&AccountingEvent::export(1000.0, 8.0, 5.0, now)).unwrap();

        let days = db
            .daily_summaries(now - Duration::days(1), now + Duration::days(1))
            .unwrap();
        assert_eq!(days.len(), 1);
        assert!((days[0].import_cost_cents - 60.0).abs() < 1e-6);
        assert!((days[0].export_revenue_cents - 8.0).abs() < 1e-6);
    }

    #[test]
    fn test_load_state_round_trip() {
        let db = Database::open_in_memory().unwrap();
        let runtime = LoadRuntime::new(Utc::now());
        db.save_load_state("pool_pump", &runtime).unwrap();
        let states = db.load_load_states().unwrap();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].0, "pool_pump");
    }

    #[test]
    fn test_open_on_disk_with_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pm.db");
        let db = Database::open(path.to_str().unwrap()).unwrap();
        db.record_telemetry(&telemetry(Utc::now())).unwrap();
        db.checkpoint().unwrap();
        drop(db);

        // Re-open and confirm the data survived
        let db = Database::open(path.to_str().unwrap()).unwrap();
        let rows = db
            .query_telemetry(Utc::now() - Duration::minutes(5), Utc::now() + Duration::minutes(5))
            .unwrap();
        assert_eq!(rows.len(), 1);
    }
}
