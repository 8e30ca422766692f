use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags};
use rust_decimal::Decimal;

use crate::error::BotError;
use crate::models::{HedgeState, Position, PositionStatus, PyramidState, Side, TpLevel};

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS stage4_positions (
    ssot_id                 INTEGER PRIMARY KEY,
    symbol                  TEXT NOT NULL,
    side                    TEXT NOT NULL,
    status                  TEXT NOT NULL,
    planned_qty             TEXT NOT NULL DEFAULT '0',
    remaining_qty           TEXT NOT NULL DEFAULT '0',
    avg_entry               TEXT NOT NULL DEFAULT '0',
    realized_pnl            TEXT NOT NULL DEFAULT '0',
    unrealized_pnl          TEXT NOT NULL DEFAULT '0',
    sl_price                TEXT NOT NULL DEFAULT '0',
    sl_order_id             TEXT,
    tp_levels_json          TEXT NOT NULL DEFAULT '[]',
    tp_active_order_ids_json TEXT NOT NULL DEFAULT '[]',
    signal_entry_price      TEXT NOT NULL DEFAULT '0',
    signal_sl_price         TEXT NOT NULL DEFAULT '0',
    signal_leverage         TEXT,
    is_hedge_armed          INTEGER NOT NULL DEFAULT 1,
    hedge_state             TEXT NOT NULL DEFAULT 'idle',
    hedge_entry_order_id    TEXT,
    hedge_tp_order_id       TEXT,
    hedge_sl_order_id       TEXT,
    reentry_attempts        INTEGER NOT NULL DEFAULT 0,
    pyramid_state_json      TEXT NOT NULL DEFAULT '{}',
    closed_reason           TEXT,
    created_at_utc          TEXT NOT NULL,
    updated_at_utc          TEXT NOT NULL,
    last_reconcile_at_utc   TEXT
);

CREATE INDEX IF NOT EXISTS idx_stage4_positions_symbol ON stage4_positions(symbol);

CREATE TABLE IF NOT EXISTS stage4_order_tracker (
    order_id                TEXT PRIMARY KEY,
    ssot_id                 INTEGER NOT NULL,
    kind                    TEXT NOT NULL,
    level_index             INTEGER,
    last_executed_qty       TEXT NOT NULL DEFAULT '0',
    last_status             TEXT,
    updated_at_utc          TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_stage4_order_tracker_ssot ON stage4_order_tracker(ssot_id);

CREATE TABLE IF NOT EXISTS execution_records (
    order_id                TEXT NOT NULL,
    exec_id                 TEXT NOT NULL,
    ssot_id                 INTEGER,
    qty                     TEXT NOT NULL,
    applied_at_utc          TEXT NOT NULL,
    PRIMARY KEY(order_id, exec_id)
);

CREATE TABLE IF NOT EXISTS stage5_locks (
    symbol                  TEXT NOT NULL,
    side                    TEXT NOT NULL,
    locked_at_utc           TEXT NOT NULL,
    locked_by_ssot_id       INTEGER,
    reason                  TEXT,
    PRIMARY KEY(symbol, side)
);
"#;

#[derive(Debug, Clone)]
pub struct Stage2CompletedRow {
    pub ssot_id: i64,
    pub symbol: String,
    pub side: Side,
    pub entry_price: Decimal,
    pub sl_price: Decimal,
    pub tp_prices: Vec<Decimal>,
    pub stage2_json: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    pub order_id: String,
    pub exec_id: String,
    pub qty: Decimal,
}

/// Sparse update for `stage4_positions`: only `Some` fields are written.
/// `updated_at_utc` is always bumped.
#[derive(Debug, Clone, Default)]
pub struct PositionUpdate {
    pub status: Option<PositionStatus>,
    pub planned_qty: Option<Decimal>,
    pub remaining_qty: Option<Decimal>,
    pub avg_entry: Option<Decimal>,
    pub realized_pnl: Option<Decimal>,
    pub unrealized_pnl: Option<Decimal>,
    pub sl_price: Option<Decimal>,
    pub sl_order_id: Option<String>,
    pub tp_levels: Option<Vec<TpLevel>>,
    pub tp_active_order_ids: Option<Vec<String>>,
    pub is_hedge_armed: Option<bool>,
    pub hedge_state: Option<HedgeState>,
    pub hedge_entry_order_id: Option<String>,
    pub hedge_tp_order_id: Option<String>,
    pub hedge_sl_order_id: Option<String>,
    pub reentry_attempts: Option<u32>,
    pub pyramid_state: Option<PyramidState>,
    pub closed_reason: Option<String>,
    pub last_reconcile_at_utc: Option<DateTime<Utc>>,
}

const CLEARABLE_FIELDS: &[&str] = &[
    "sl_order_id",
    "hedge_entry_order_id",
    "hedge_tp_order_id",
    "hedge_sl_order_id",
    "closed_reason",
];

pub struct LifecycleStore {
    conn: Arc<Mutex<Connection>>,
}

impl LifecycleStore {
    pub fn open(path: &str) -> Result<Self, BotError> {
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).ok();
            }
        }
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    pub fn in_memory() -> Result<Self, BotError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    /// `ssot_queue` rows that completed Stage 2 and have no Stage 4 row yet.
    /// Assumes the SSoT store was opened against the same database file
    /// first, so `ssot_queue` already exists.
    pub fn list_new_stage2_completed(&self, limit: i64) -> Result<Vec<Stage2CompletedRow>, BotError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT q.id, q.symbol, q.side, q.entry_price, q.sl_price, q.tp_prices_json, q.stage2_json
             FROM ssot_queue q
             LEFT JOIN stage4_positions p ON p.ssot_id = q.id
             WHERE q.status = 'COMPLETED' AND p.ssot_id IS NULL
             ORDER BY q.id ASC LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit], |row| {
            let side: String = row.get(2)?;
            let entry: String = row.get(3)?;
            let sl: String = row.get(4)?;
            let tp_json: String = row.get(5)?;
            let stage2_json: Option<String> = row.get(6)?;
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, side, entry, sl, tp_json, stage2_json))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (ssot_id, symbol, side, entry, sl, tp_json, stage2_json) = row?;
            let tps: Vec<String> = serde_json::from_str(&tp_json).unwrap_or_default();
            out.push(Stage2CompletedRow {
                ssot_id,
                symbol,
                side: Side::parse(&side).ok_or_else(|| BotError::Internal("bad side".into()))?,
                entry_price: entry.parse().unwrap_or_default(),
                sl_price: sl.parse().unwrap_or_default(),
                tp_prices: tps.iter().map(|s| s.parse().unwrap_or_default()).collect(),
                stage2_json: stage2_json.and_then(|s| serde_json::from_str(&s).ok()),
            });
        }
        Ok(out)
    }

    /// Insert a `stage4_positions` row once; safe to call repeatedly after a
    /// restart. Returns `true` if this call inserted the row.
    #[allow(clippy::too_many_arguments)]
    pub fn create_position_if_absent(
        &self,
        ssot_id: i64,
        symbol: &str,
        side: Side,
        status: PositionStatus,
        planned_qty: Decimal,
        remaining_qty: Decimal,
        avg_entry: Decimal,
        sl_price: Decimal,
        signal_entry_price: Decimal,
        signal_sl_price: Decimal,
        signal_leverage: Option<Decimal>,
        tp_levels: &[TpLevel],
    ) -> Result<bool, BotError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock();
        let changed = conn.execute(
            "INSERT OR IGNORE INTO stage4_positions (
                ssot_id, symbol, side, status, planned_qty, remaining_qty, avg_entry,
                sl_price, signal_entry_price, signal_sl_price, signal_leverage,
                tp_levels_json, created_at_utc, updated_at_utc
            ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?13)",
            rusqlite::params![
                ssot_id,
                symbol,
                side.as_str(),
                status.as_str(),
                planned_qty.to_string(),
                remaining_qty.to_string(),
                avg_entry.to_string(),
                sl_price.to_string(),
                signal_entry_price.to_string(),
                signal_sl_price.to_string(),
                signal_leverage.map(|d| d.to_string()),
                serde_json::to_string(tp_levels)?,
                now,
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn get_position(&self, ssot_id: i64) -> Result<Option<Position>, BotError> {
        let conn = self.conn.lock();
        conn.query_row("SELECT * FROM stage4_positions WHERE ssot_id = ?1", [ssot_id], row_to_position)
            .map(Some)
            .or_else(|e| if matches!(e, rusqlite::Error::QueryReturnedNoRows) { Ok(None) } else { Err(e.into()) })
    }

    pub fn list_positions_by_status(&self, statuses: &[PositionStatus], limit: i64) -> Result<Vec<Position>, BotError> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders: Vec<String> = statuses.iter().map(|s| format!("'{}'", s.as_str())).collect();
        let sql = format!(
            "SELECT * FROM stage4_positions WHERE status IN ({}) ORDER BY ssot_id ASC LIMIT ?1",
            placeholders.join(",")
        );
        self.query_positions(&sql, [limit])
    }

    pub fn list_open_positions(&self, limit: i64) -> Result<Vec<Position>, BotError> {
        self.query_positions("SELECT * FROM stage4_positions WHERE status = 'OPEN' ORDER BY ssot_id ASC LIMIT ?1", [limit])
    }

    pub fn list_positions_not_closed(&self, limit: i64) -> Result<Vec<Position>, BotError> {
        self.query_positions("SELECT * FROM stage4_positions WHERE status != 'CLOSED' ORDER BY ssot_id ASC LIMIT ?1", [limit])
    }

    pub fn count_positions_not_closed(&self) -> Result<i64, BotError> {
        let conn = self.conn.lock();
        Ok(conn.query_row("SELECT COUNT(1) FROM stage4_positions WHERE status != 'CLOSED'", [], |row| row.get(0))?)
    }

    fn query_positions(&self, sql: &str, params: [i64; 1]) -> Result<Vec<Position>, BotError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, |row| row_to_position(row))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn update_position(&self, ssot_id: i64, update: &PositionUpdate) -> Result<(), BotError> {
        let mut set_clauses: Vec<String> = Vec::new();
        let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        macro_rules! push {
            ($col:expr, $val:expr) => {
                set_clauses.push(format!("{} = ?{}", $col, values.len() + 1));
                values.push(Box::new($val));
            };
        }

        if let Some(v) = update.status {
            push!("status", v.as_str().to_string());
        }
        if let Some(v) = update.planned_qty {
            push!("planned_qty", v.to_string());
        }
        if let Some(v) = update.remaining_qty {
            push!("remaining_qty", v.to_string());
        }
        if let Some(v) = update.avg_entry {
            push!("avg_entry", v.to_string());
        }
        if let Some(v) = update.realized_pnl {
            push!("realized_pnl", v.to_string());
        }
        if let Some(v) = update.unrealized_pnl {
            push!("unrealized_pnl", v.to_string());
        }
        if let Some(v) = update.sl_price {
            push!("sl_price", v.to_string());
        }
        if let Some(v) = &update.sl_order_id {
            push!("sl_order_id", v.clone());
        }
        if let Some(v) = &update.tp_levels {
            push!("tp_levels_json", serde_json::to_string(v)?);
        }
        if let Some(v) = &update.tp_active_order_ids {
            push!("tp_active_order_ids_json", serde_json::to_string(v)?);
        }
        if let Some(v) = update.is_hedge_armed {
            push!("is_hedge_armed", v as i64);
        }
        if let Some(v) = update.hedge_state {
            push!("hedge_state", serde_json::to_value(v)?.as_str().unwrap_or("idle").to_string());
        }
        if let Some(v) = &update.hedge_entry_order_id {
            push!("hedge_entry_order_id", v.clone());
        }
        if let Some(v) = &update.hedge_tp_order_id {
            push!("hedge_tp_order_id", v.clone());
        }
        if let Some(v) = &update.hedge_sl_order_id {
            push!("hedge_sl_order_id", v.clone());
        }
        if let Some(v) = update.reentry_attempts {
            push!("reentry_attempts", v as i64);
        }
        if let Some(v) = &update.pyramid_state {
            push!("pyramid_state_json", serde_json::to_string(v)?);
        }
        if let Some(v) = &update.closed_reason {
            push!("closed_reason", v.clone());
        }
        if let Some(v) = update.last_reconcile_at_utc {
            push!("last_reconcile_at_utc", v.to_rfc3339());
        }

        push!("updated_at_utc", Utc::now().to_rfc3339());
        values.push(Box::new(ssot_id));
        let sql = format!("UPDATE stage4_positions SET {} WHERE ssot_id = ?{}", set_clauses.join(", "), values.len());

        let conn = self.conn.lock();
        let params: Vec<&dyn rusqlite::ToSql> = values.iter().map(|v| v.as_ref()).collect();
        conn.execute(&sql, params.as_slice())?;
        Ok(())
    }

    /// Null out selected nullable fields (e.g. after a hedge closes and a
    /// fresh re-entry restarts the position from scratch).
    pub fn clear_position_fields(&self, ssot_id: i64, fields: &[&str]) -> Result<(), BotError> {
        let cols: Vec<&str> = fields.iter().filter(|f| CLEARABLE_FIELDS.contains(f)).copied().collect();
        if cols.is_empty() {
            return Ok(());
        }
        let set_clause = cols.iter().map(|c| format!("{c} = NULL")).collect::<Vec<_>>().join(", ");
        let conn = self.conn.lock();
        conn.execute(
            &format!("UPDATE stage4_positions SET {set_clause}, updated_at_utc = ?1 WHERE ssot_id = ?2"),
            rusqlite::params![Utc::now().to_rfc3339(), ssot_id],
        )?;
        Ok(())
    }

    pub fn set_stage5_lock(&self, symbol: &str, side: Side, locked_by_ssot_id: Option<i64>, reason: &str) -> Result<(), BotError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO stage5_locks (symbol, side, locked_at_utc, locked_by_ssot_id, reason)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(symbol, side) DO UPDATE SET locked_at_utc = excluded.locked_at_utc,
                locked_by_ssot_id = excluded.locked_by_ssot_id, reason = excluded.reason",
            rusqlite::params![symbol, side.as_str(), Utc::now().to_rfc3339(), locked_by_ssot_id, reason],
        )?;
        Ok(())
    }

    pub fn clear_stage5_lock(&self, symbol: &str, side: Side) -> Result<(), BotError> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM stage5_locks WHERE symbol = ?1 AND side = ?2", rusqlite::params![symbol, side.as_str()])?;
        Ok(())
    }

    pub fn is_stage5_locked(&self, symbol: &str, side: Side) -> Result<bool, BotError> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(1) FROM stage5_locks WHERE symbol = ?1 AND side = ?2",
            rusqlite::params![symbol, side.as_str()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn upsert_order_tracker(
        &self,
        ssot_id: i64,
        order_id: &str,
        kind: crate::models::OrderKind,
        level_index: Option<usize>,
    ) -> Result<(), BotError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO stage4_order_tracker (order_id, ssot_id, kind, level_index, last_executed_qty, last_status, updated_at_utc)
             VALUES (?1, ?2, ?3, ?4, '0', NULL, ?5)
             ON CONFLICT(order_id) DO UPDATE SET ssot_id = excluded.ssot_id, kind = excluded.kind,
                level_index = excluded.level_index, updated_at_utc = excluded.updated_at_utc",
            rusqlite::params![order_id, ssot_id, kind.as_str(), level_index.map(|i| i as i64), Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn update_order_tracker(&self, order_id: &str, last_executed_qty: Decimal, last_status: &str) -> Result<(), BotError> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE stage4_order_tracker SET last_executed_qty = ?1, last_status = ?2, updated_at_utc = ?3 WHERE order_id = ?4",
            rusqlite::params![last_executed_qty.to_string(), last_status, Utc::now().to_rfc3339(), order_id],
        )?;
        Ok(())
    }

    pub fn list_tracked_orders_for_ssot_id(&self, ssot_id: i64) -> Result<Vec<crate::models::TrackedOrder>, BotError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT order_id, ssot_id, kind, level_index, last_executed_qty, last_status, updated_at_utc
             FROM stage4_order_tracker WHERE ssot_id = ?1 ORDER BY updated_at_utc ASC",
        )?;
        let rows = stmt.query_map([ssot_id], row_to_tracked_order)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// All tracked orders across every position, oldest-updated first; used
    /// by the REST poll sweep so it visits every live order once per tick.
    pub fn list_tracked_orders(&self, limit: i64) -> Result<Vec<crate::models::TrackedOrder>, BotError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT order_id, ssot_id, kind, level_index, last_executed_qty, last_status, updated_at_utc
             FROM stage4_order_tracker ORDER BY updated_at_utc ASC LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit], row_to_tracked_order)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn get_order_tracker(&self, order_id: &str) -> Result<Option<crate::models::TrackedOrder>, BotError> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT order_id, ssot_id, kind, level_index, last_executed_qty, last_status, updated_at_utc
             FROM stage4_order_tracker WHERE order_id = ?1",
            [order_id],
            row_to_tracked_order,
        )
        .map(Some)
        .or_else(|e| if matches!(e, rusqlite::Error::QueryReturnedNoRows) { Ok(None) } else { Err(e.into()) })
    }

    pub fn get_position_by_symbol_side(&self, symbol: &str, side: Side) -> Result<Option<Position>, BotError> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT * FROM stage4_positions WHERE symbol = ?1 AND side = ?2 AND status != 'CLOSED' ORDER BY ssot_id DESC LIMIT 1",
            rusqlite::params![symbol, side.as_str()],
            row_to_position,
        )
        .map(Some)
        .or_else(|e| if matches!(e, rusqlite::Error::QueryReturnedNoRows) { Ok(None) } else { Err(e.into()) })
    }

    pub fn delete_tracked_orders_for_ssot_id(&self, ssot_id: i64) -> Result<(), BotError> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM stage4_order_tracker WHERE ssot_id = ?1", [ssot_id])?;
        Ok(())
    }

    /// Record an execution if `(order_id, exec_id)` hasn't been seen before.
    /// Returns `true` when this call newly recorded it — callers should only
    /// apply the fill's effect on that `true`.
    pub fn record_execution_if_new(&self, order_id: &str, exec_id: &str, ssot_id: Option<i64>, qty: Decimal) -> Result<bool, BotError> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "INSERT OR IGNORE INTO execution_records (order_id, exec_id, ssot_id, qty, applied_at_utc) VALUES (?1,?2,?3,?4,?5)",
            rusqlite::params![order_id, exec_id, ssot_id, qty.to_string(), Utc::now().to_rfc3339()],
        )?;
        Ok(changed > 0)
    }
}

fn row_to_position(row: &rusqlite::Row) -> rusqlite::Result<Position> {
    let tp_levels: Vec<TpLevel> = serde_json::from_str(&row.get::<_, String>("tp_levels_json")?).unwrap_or_default();
    let tp_active_order_ids: Vec<String> = serde_json::from_str(&row.get::<_, String>("tp_active_order_ids_json")?).unwrap_or_default();
    let pyramid_state: PyramidState = serde_json::from_str(&row.get::<_, String>("pyramid_state_json")?).unwrap_or_default();
    let hedge_state_str: String = row.get("hedge_state")?;
    let hedge_state: HedgeState = serde_json::from_value(serde_json::Value::String(hedge_state_str)).unwrap_or(HedgeState::Idle);
    let leverage: Option<String> = row.get("signal_leverage")?;
    let created_at: String = row.get("created_at_utc")?;
    let updated_at: String = row.get("updated_at_utc")?;

    Ok(Position {
        ssot_id: row.get("ssot_id")?,
        symbol: row.get("symbol")?,
        side: Side::parse(&row.get::<_, String>("side")?).unwrap_or(Side::Long),
        status: PositionStatus::parse(&row.get::<_, String>("status")?).unwrap_or(PositionStatus::Open),
        planned_qty: row.get::<_, String>("planned_qty")?.parse().unwrap_or_default(),
        remaining_qty: row.get::<_, String>("remaining_qty")?.parse().unwrap_or_default(),
        avg_entry: row.get::<_, String>("avg_entry")?.parse().unwrap_or_default(),
        realized_pnl: row.get::<_, String>("realized_pnl")?.parse().unwrap_or_default(),
        unrealized_pnl: row.get::<_, String>("unrealized_pnl")?.parse().unwrap_or_default(),
        sl_price: row.get::<_, String>("sl_price")?.parse().unwrap_or_default(),
        sl_order_id: row.get("sl_order_id")?,
        tp_levels,
        tp_active_order_ids,
        signal_entry: row.get::<_, String>("signal_entry_price")?.parse().unwrap_or_default(),
        signal_sl: row.get::<_, String>("signal_sl_price")?.parse().unwrap_or_default(),
        signal_leverage: leverage.and_then(|l| l.parse().ok()),
        is_hedge_armed: row.get::<_, i64>("is_hedge_armed")? != 0,
        hedge_state,
        hedge_entry_order_id: row.get("hedge_entry_order_id")?,
        hedge_tp_order_id: row.get("hedge_tp_order_id")?,
        hedge_sl_order_id: row.get("hedge_sl_order_id")?,
        reentry_attempts: row.get::<_, i64>("reentry_attempts")? as u32,
        pyramid_state,
        close_reason: row.get("closed_reason")?,
        created_at: DateTime::parse_from_rfc3339(&created_at).map(|d| d.with_timezone(&Utc)).unwrap_or_else(|_| Utc::now()),
        updated_at: DateTime::parse_from_rfc3339(&updated_at).map(|d| d.with_timezone(&Utc)).unwrap_or_else(|_| Utc::now()),
    })
}

fn row_to_tracked_order(row: &rusqlite::Row) -> rusqlite::Result<crate::models::TrackedOrder> {
    let updated_at: String = row.get("updated_at_utc")?;
    Ok(crate::models::TrackedOrder {
        order_id: row.get("order_id")?,
        ssot_id: row.get("ssot_id")?,
        kind: crate::models::OrderKind::parse(&row.get::<_, String>("kind")?).unwrap_or(crate::models::OrderKind::Entry),
        level_index: row.get::<_, Option<i64>>("level_index")?.map(|i| i as usize),
        last_executed_qty: row.get::<_, String>("last_executed_qty")?.parse().unwrap_or_default(),
        last_status: row.get::<_, Option<String>>("last_status")?.unwrap_or_default(),
        updated_at: DateTime::parse_from_rfc3339(&updated_at).map(|d| d.with_timezone(&Utc)).unwrap_or_else(|_| Utc::now()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TpStatus;
    use rust_decimal_macros::dec;

    fn sample_tp_levels() -> Vec<TpLevel> {
        vec![
            TpLevel { index: 0, price: dec!(105.00), status: TpStatus::Open, filled_qty: Decimal::ZERO, order_id: None },
            TpLevel { index: 1, price: dec!(110.00), status: TpStatus::Open, filled_qty: Decimal::ZERO, order_id: None },
        ]
    }

    #[test]
    fn create_position_is_idempotent() {
        let store = LifecycleStore::in_memory().unwrap();
        let tps = sample_tp_levels();
        let inserted1 = store
            .create_position_if_absent(1, "BTCUSDT", Side::Long, PositionStatus::Open, dec!(1.0), dec!(1.0), dec!(100.0), dec!(95.0), dec!(100.0), dec!(95.0), Some(dec!(5.0)), &tps)
            .unwrap();
        let inserted2 = store
            .create_position_if_absent(1, "BTCUSDT", Side::Long, PositionStatus::Open, dec!(1.0), dec!(1.0), dec!(100.0), dec!(95.0), dec!(100.0), dec!(95.0), Some(dec!(5.0)), &tps)
            .unwrap();
        assert!(inserted1);
        assert!(!inserted2);
    }

    #[test]
    fn update_position_writes_only_given_fields() {
        let store = LifecycleStore::in_memory().unwrap();
        let tps = sample_tp_levels();
        store
            .create_position_if_absent(1, "BTCUSDT", Side::Long, PositionStatus::Open, dec!(1.0), dec!(1.0), dec!(100.0), dec!(95.0), dec!(100.0), dec!(95.0), None, &tps)
            .unwrap();

        store
            .update_position(1, &PositionUpdate { remaining_qty: Some(dec!(0.5)), ..Default::default() })
            .unwrap();

        let position = store.get_position(1).unwrap().unwrap();
        assert_eq!(position.remaining_qty, dec!(0.5));
        assert_eq!(position.planned_qty, dec!(1.0));
    }

    #[test]
    fn execution_record_dedup_guards_double_apply() {
        let store = LifecycleStore::in_memory().unwrap();
        let first = store.record_execution_if_new("order-1", "exec-1", Some(1), dec!(0.5)).unwrap();
        let second = store.record_execution_if_new("order-1", "exec-1", Some(1), dec!(0.5)).unwrap();
        assert!(first);
        assert!(!second);
    }

    #[test]
    fn stage5_lock_round_trip() {
        let store = LifecycleStore::in_memory().unwrap();
        store.set_stage5_lock("BTCUSDT", Side::Long, Some(1), "max attempts").unwrap();
        assert!(store.is_stage5_locked("BTCUSDT", Side::Long).unwrap());
        store.clear_stage5_lock("BTCUSDT", Side::Long).unwrap();
        assert!(!store.is_stage5_locked("BTCUSDT", Side::Long).unwrap());
    }
}
