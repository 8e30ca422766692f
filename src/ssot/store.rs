use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags};
use rust_decimal::Decimal;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::BotError;
use crate::models::{ParsedSignal, Side, SignalStatus};

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS ssot_queue (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    source_channel_name TEXT NOT NULL,
    chat_id             TEXT NOT NULL,
    message_id          TEXT NOT NULL,
    received_at_utc     TEXT NOT NULL,
    symbol              TEXT NOT NULL,
    side                TEXT NOT NULL,
    entry_price         TEXT NOT NULL,
    sl_price            TEXT NOT NULL,
    tp_prices_json      TEXT NOT NULL,
    signal_type         TEXT NOT NULL,
    tick_size           TEXT NOT NULL,
    qty_step            TEXT NOT NULL,
    min_qty             TEXT NOT NULL,
    leverage            TEXT,
    dedup_hash          TEXT NOT NULL,
    raw_text            TEXT NOT NULL,
    status              TEXT NOT NULL DEFAULT 'QUEUED',
    locked_by           TEXT,
    locked_at_utc       TEXT,
    stage2_json         TEXT,
    last_error          TEXT,
    UNIQUE(chat_id, message_id)
);

CREATE INDEX IF NOT EXISTS idx_ssot_queue_received_at ON ssot_queue(received_at_utc);
CREATE INDEX IF NOT EXISTS idx_ssot_queue_status ON ssot_queue(status);

CREATE TABLE IF NOT EXISTS recent_signals (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    created_at_utc      TEXT NOT NULL,
    source_channel_name TEXT NOT NULL,
    symbol              TEXT NOT NULL,
    side                TEXT NOT NULL,
    entry_price         TEXT NOT NULL,
    sl_price            TEXT NOT NULL,
    tp_prices_json      TEXT NOT NULL,
    dedup_hash          TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_recent_signals_lookup
ON recent_signals(source_channel_name, symbol, side, created_at_utc);

CREATE TABLE IF NOT EXISTS stage5_locks (
    symbol              TEXT NOT NULL,
    side                TEXT NOT NULL,
    locked_at_utc       TEXT NOT NULL,
    locked_by_ssot_id   INTEGER,
    reason              TEXT,
    PRIMARY KEY(symbol, side)
);
"#;

const STAGE2_INFLIGHT_STATUSES: &[&str] = &["CLAIMED", "STAGE2_RUNNING", "STAGE2_PLANNED", "WAITING_FOR_FILLS"];

/// A claimed or otherwise-fetched row from `ssot_queue`, with its JSON
/// columns already decoded.
#[derive(Debug, Clone)]
pub struct QueuedSignal {
    pub id: i64,
    pub source_channel_name: String,
    pub chat_id: String,
    pub message_id: String,
    pub received_at_utc: DateTime<Utc>,
    pub raw_text: String,
    pub symbol: String,
    pub side: Side,
    pub entry_price: Decimal,
    pub sl_price: Decimal,
    pub tp_prices: Vec<Decimal>,
    pub signal_type: String,
    pub tick_size: Decimal,
    pub qty_step: Decimal,
    pub min_qty: Decimal,
    pub leverage: Option<Decimal>,
    pub status: SignalStatus,
    pub locked_by: Option<String>,
    pub stage2_json: Option<Value>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StaleQueueRow {
    pub id: i64,
    pub symbol: String,
    pub side: Side,
    pub status: SignalStatus,
    pub stage2_json: Option<Value>,
}

#[derive(Debug, Clone)]
pub enum DedupDecision {
    Accept { reason: String, min_diff: Option<Decimal> },
    Block { reason: String, min_diff: Option<Decimal> },
}

impl DedupDecision {
    pub fn is_accept(&self) -> bool {
        matches!(self, DedupDecision::Accept { .. })
    }
}

pub struct SsotStore {
    conn: Arc<Mutex<Connection>>,
}

impl SsotStore {
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
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    pub fn in_memory() -> Result<Self, BotError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    /// Idempotent insert keyed on `(chat_id, message_id)`: replays of the
    /// same source message never create a second queue row. Also records a
    /// `recent_signals` entry for future dedup comparisons.
    pub fn insert_accepted_signal(&self, signal: &ParsedSignal) -> Result<i64, BotError> {
        let tp_json = serde_json::to_string(&signal.tps)?;
        let conn = self.conn.lock();
        conn.execute("BEGIN IMMEDIATE", [])
            .map_err(BotError::from)?;
        let result = (|| -> Result<i64, BotError> {
            conn.execute(
                "INSERT OR IGNORE INTO ssot_queue (
                    source_channel_name, chat_id, message_id, received_at_utc,
                    symbol, side, entry_price, sl_price, tp_prices_json, signal_type,
                    tick_size, qty_step, min_qty, leverage, dedup_hash, raw_text
                ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16)",
                rusqlite::params![
                    signal.source,
                    signal.chat_id,
                    signal.message_id,
                    signal.received_at.to_rfc3339(),
                    signal.symbol,
                    signal.side.as_str(),
                    signal.entry.to_string(),
                    signal.sl.to_string(),
                    tp_json,
                    signal.kind.as_str(),
                    signal.tick_size.to_string(),
                    signal.qty_step.to_string(),
                    signal.min_qty.to_string(),
                    signal.leverage.map(|l| l.to_string()),
                    signal.dedup_hash,
                    signal.raw_text,
                ],
            )?;
            let ssot_id: i64 = conn.query_row(
                "SELECT id FROM ssot_queue WHERE chat_id = ?1 AND message_id = ?2",
                rusqlite::params![signal.chat_id, signal.message_id],
                |row| row.get(0),
            )?;
            conn.execute(
                "INSERT INTO recent_signals (
                    created_at_utc, source_channel_name, symbol, side,
                    entry_price, sl_price, tp_prices_json, dedup_hash
                ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
                rusqlite::params![
                    signal.received_at.to_rfc3339(),
                    signal.source,
                    signal.symbol,
                    signal.side.as_str(),
                    signal.entry.to_string(),
                    signal.sl.to_string(),
                    tp_json,
                    signal.dedup_hash,
                ],
            )?;
            Ok(ssot_id)
        })();

        match result {
            Ok(id) => {
                conn.execute("COMMIT", [])?;
                Ok(id)
            }
            Err(e) => {
                conn.execute("ROLLBACK", []).ok();
                Err(e)
            }
        }
    }

    /// Deterministic dedup against the TTL window of recent accepted
    /// signals for this `(source, symbol, side)`: max component %-diff
    /// across entry/SL/TPs, banded at 5%/10% with a 7.5% tiebreak in
    /// between. Does not record anything; call `insert_accepted_signal`
    /// afterwards if this returns `Accept`.
    pub fn check_and_record_dedup(&self, signal: &ParsedSignal, ttl_hours: i64) -> Result<DedupDecision, BotError> {
        use rust_decimal_macros::dec;

        let cutoff = Utc::now() - chrono::Duration::hours(ttl_hours);
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT created_at_utc, entry_price, sl_price, tp_prices_json
             FROM recent_signals
             WHERE source_channel_name = ?1 AND symbol = ?2 AND side = ?3
             ORDER BY id DESC LIMIT 50",
        )?;
        let rows = stmt.query_map(
            rusqlite::params![signal.source, signal.symbol, signal.side.as_str()],
            |row| {
                let created_at: String = row.get(0)?;
                let entry: String = row.get(1)?;
                let sl: String = row.get(2)?;
                let tp_json: String = row.get(3)?;
                Ok((created_at, entry, sl, tp_json))
            },
        )?;

        let mut diffs: Vec<Decimal> = Vec::new();
        for row in rows {
            let (created_at, entry, sl, tp_json) = row?;
            let Ok(created_at) = DateTime::parse_from_rfc3339(&created_at) else { continue };
            if created_at.with_timezone(&Utc) < cutoff {
                continue;
            }
            let old_entry: Decimal = entry.parse().map_err(|_| BotError::Internal("bad decimal in recent_signals".into()))?;
            let old_sl: Decimal = sl.parse().map_err(|_| BotError::Internal("bad decimal in recent_signals".into()))?;
            let old_tps: Vec<Decimal> = serde_json::from_str::<Vec<String>>(&tp_json)?
                .iter()
                .map(|s| s.parse().unwrap_or_default())
                .collect();
            diffs.push(max_component_diff(signal.entry, signal.sl, &signal.tps, old_entry, old_sl, &old_tps));
        }

        if diffs.is_empty() {
            return Ok(DedupDecision::Accept { reason: "no recent signals in TTL window".to_string(), min_diff: None });
        }

        let min_diff = diffs.iter().copied().fold(Decimal::MAX, Decimal::min);

        if diffs.iter().any(|d| *d <= dec!(0.05)) {
            return Ok(DedupDecision::Block {
                reason: format!("duplicate detected (<=5% diff), ttl={ttl_hours}h"),
                min_diff: Some(min_diff),
            });
        }
        if diffs.iter().all(|d| *d >= dec!(0.10)) {
            return Ok(DedupDecision::Accept {
                reason: "all recent signals differ by >=10%".to_string(),
                min_diff: Some(min_diff),
            });
        }
        if min_diff < dec!(0.075) {
            return Ok(DedupDecision::Block {
                reason: format!("deterministic block in 5-10% band (min_diff<7.5%), ttl={ttl_hours}h"),
                min_diff: Some(min_diff),
            });
        }
        Ok(DedupDecision::Accept {
            reason: "deterministic accept in 5-10% band (min_diff>=7.5%)".to_string(),
            min_diff: Some(min_diff),
        })
    }

    /// Atomically claim the oldest eligible row: `QUEUED`/`RETRY`, or a
    /// `CLAIMED` row whose lock has expired past `lock_ttl_seconds`.
    pub fn claim_next_signal(&self, worker_id: &str, lock_ttl_seconds: i64) -> Result<Option<QueuedSignal>, BotError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock();
        conn.execute("BEGIN IMMEDIATE", [])?;
        let result = (|| -> Result<Option<i64>, BotError> {
            let id: Option<i64> = conn
                .query_row(
                    "SELECT id FROM ssot_queue
                     WHERE status IN ('QUEUED','RETRY')
                        OR (status = 'CLAIMED' AND locked_at_utc IS NOT NULL
                            AND (strftime('%s','now') - strftime('%s', locked_at_utc)) >= ?1)
                     ORDER BY id ASC LIMIT 1",
                    rusqlite::params![lock_ttl_seconds],
                    |row| row.get(0),
                )
                .ok();
            if let Some(id) = id {
                conn.execute(
                    "UPDATE ssot_queue SET status = 'CLAIMED', locked_by = ?1, locked_at_utc = ?2 WHERE id = ?3",
                    rusqlite::params![worker_id, now, id],
                )?;
            }
            Ok(id)
        })();

        let id = match result {
            Ok(id) => {
                conn.execute("COMMIT", [])?;
                id
            }
            Err(e) => {
                conn.execute("ROLLBACK", []).ok();
                return Err(e);
            }
        };
        drop(conn);
        match id {
            Some(id) => self.get_queue_row(id),
            None => Ok(None),
        }
    }

    pub fn update_queue_row(
        &self,
        ssot_id: i64,
        status: SignalStatus,
        stage2: Option<&Value>,
        last_error: Option<&str>,
    ) -> Result<(), BotError> {
        let conn = self.conn.lock();
        let stage2_json = stage2.map(serde_json::to_string).transpose()?;
        conn.execute(
            "UPDATE ssot_queue SET status = ?1, stage2_json = COALESCE(?2, stage2_json), last_error = ?3 WHERE id = ?4",
            rusqlite::params![status.as_str(), stage2_json, last_error, ssot_id],
        )?;
        Ok(())
    }

    pub fn mark_queue_row(&self, ssot_id: i64, status: SignalStatus, last_error: Option<&str>) -> Result<(), BotError> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE ssot_queue SET status = ?1, last_error = COALESCE(?2, last_error) WHERE id = ?3",
            rusqlite::params![status.as_str(), last_error, ssot_id],
        )?;
        Ok(())
    }

    pub fn get_queue_row(&self, ssot_id: i64) -> Result<Option<QueuedSignal>, BotError> {
        let conn = self.conn.lock();
        conn.query_row("SELECT * FROM ssot_queue WHERE id = ?1", [ssot_id], row_to_queued_signal)
            .map(Some)
            .or_else(|e| if matches!(e, rusqlite::Error::QueryReturnedNoRows) { Ok(None) } else { Err(e.into()) })
    }

    pub fn count_stage2_inflight(&self) -> Result<i64, BotError> {
        let sql = format!(
            "SELECT COUNT(1) FROM ssot_queue WHERE status IN ({})",
            STAGE2_INFLIGHT_STATUSES.iter().map(|s| format!("'{s}'")).collect::<Vec<_>>().join(",")
        );
        let conn = self.conn.lock();
        Ok(conn.query_row(&sql, [], |row| row.get(0))?)
    }

    pub fn list_stage2_rows_older_than(
        &self,
        min_age_seconds: i64,
        statuses: &[SignalStatus],
        limit: i64,
    ) -> Result<Vec<StaleQueueRow>, BotError> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders: Vec<String> = statuses.iter().map(|s| format!("'{}'", s.as_str())).collect();
        let sql = format!(
            "SELECT id, symbol, side, status, stage2_json FROM ssot_queue
             WHERE status IN ({})
               AND (strftime('%s','now') - strftime('%s', received_at_utc)) >= ?1
             ORDER BY id ASC LIMIT ?2",
            placeholders.join(",")
        );
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params![min_age_seconds, limit], |row| {
            let symbol: String = row.get(1)?;
            let side: String = row.get(2)?;
            let status: String = row.get(3)?;
            let stage2_json: Option<String> = row.get(4)?;
            Ok((row.get::<_, i64>(0)?, symbol, side, status, stage2_json))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (id, symbol, side, status, stage2_json) = row?;
            out.push(StaleQueueRow {
                id,
                symbol,
                side: Side::parse(&side).ok_or_else(|| BotError::Internal("bad side in ssot_queue".into()))?,
                status: SignalStatus::parse(&status).ok_or_else(|| BotError::Internal("bad status in ssot_queue".into()))?,
                stage2_json: stage2_json.map(|s| serde_json::from_str(&s)).transpose()?,
            });
        }
        Ok(out)
    }

    pub fn find_latest_ssot_id_for_symbol_side(&self, symbol: &str, side: Side) -> Result<Option<i64>, BotError> {
        let conn = self.conn.lock();
        let normalized = symbol.to_ascii_uppercase().replace('-', "");
        conn.query_row(
            "SELECT id FROM ssot_queue
             WHERE UPPER(REPLACE(symbol,'-','')) = ?1 AND side = ?2
             ORDER BY id DESC LIMIT 1",
            rusqlite::params![normalized, side.as_str()],
            |row| row.get(0),
        )
        .map(Some)
        .or_else(|e| if matches!(e, rusqlite::Error::QueryReturnedNoRows) { Ok(None) } else { Err(e.into()) })
    }

    pub fn count_signals_received_between(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<i64, BotError> {
        let conn = self.conn.lock();
        Ok(conn.query_row(
            "SELECT COUNT(1) FROM ssot_queue WHERE received_at_utc >= ?1 AND received_at_utc < ?2",
            rusqlite::params![start.to_rfc3339(), end.to_rfc3339()],
            |row| row.get(0),
        )?)
    }

    pub fn count_signals_with_status_between(
        &self,
        statuses: &[SignalStatus],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<i64, BotError> {
        if statuses.is_empty() {
            return Ok(0);
        }
        let placeholders: Vec<String> = statuses.iter().map(|s| format!("'{}'", s.as_str())).collect();
        let sql = format!(
            "SELECT COUNT(1) FROM ssot_queue WHERE status IN ({}) AND received_at_utc >= ?1 AND received_at_utc < ?2",
            placeholders.join(",")
        );
        let conn = self.conn.lock();
        Ok(conn.query_row(&sql, rusqlite::params![start.to_rfc3339(), end.to_rfc3339()], |row| row.get(0))?)
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
}

fn max_component_diff(entry_a: Decimal, sl_a: Decimal, tps_a: &[Decimal], entry_b: Decimal, sl_b: Decimal, tps_b: &[Decimal]) -> Decimal {
    use rust_decimal_macros::dec;
    if tps_a.len() != tps_b.len() {
        return dec!(1.00);
    }
    fn pd(a: Decimal, b: Decimal) -> Decimal {
        if a.is_zero() {
            return rust_decimal_macros::dec!(1.00);
        }
        ((a - b).abs() / a.abs()).abs()
    }
    let mut diffs = vec![pd(entry_a, entry_b), pd(sl_a, sl_b)];
    for (a, b) in tps_a.iter().zip(tps_b.iter()) {
        diffs.push(pd(*a, *b));
    }
    diffs.into_iter().fold(Decimal::MIN, Decimal::max)
}

/// Canonical dedup hash: sha256 over a sorted-key JSON payload, matching
/// the stable-hash approach used for telemetry event keys.
pub fn dedup_payload_hash(source: &str, symbol: &str, side: Side, entry: Decimal, tps: &[Decimal], sl: Decimal) -> String {
    let payload = serde_json::json!({
        "entry": entry.to_string(),
        "side": side.as_str(),
        "sl": sl.to_string(),
        "source": source,
        "symbol": symbol,
        "tp": tps.iter().map(|d| d.to_string()).collect::<Vec<_>>(),
    });
    let mut hasher = Sha256::new();
    hasher.update(payload.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

fn row_to_queued_signal(row: &rusqlite::Row) -> rusqlite::Result<QueuedSignal> {
    let tp_json: String = row.get("tp_prices_json")?;
    let tps: Vec<String> = serde_json::from_str(&tp_json).unwrap_or_default();
    let leverage: Option<String> = row.get("leverage")?;
    let stage2_json: Option<String> = row.get("stage2_json")?;
    let received_at_utc: String = row.get("received_at_utc")?;
    Ok(QueuedSignal {
        id: row.get("id")?,
        source_channel_name: row.get("source_channel_name")?,
        chat_id: row.get("chat_id")?,
        message_id: row.get("message_id")?,
        received_at_utc: DateTime::parse_from_rfc3339(&received_at_utc).map(|d| d.with_timezone(&Utc)).unwrap_or_else(|_| Utc::now()),
        raw_text: row.get("raw_text")?,
        symbol: row.get("symbol")?,
        side: Side::parse(&row.get::<_, String>("side")?).unwrap_or(Side::Long),
        entry_price: row.get::<_, String>("entry_price")?.parse().unwrap_or_default(),
        sl_price: row.get::<_, String>("sl_price")?.parse().unwrap_or_default(),
        tp_prices: tps.iter().map(|s| s.parse().unwrap_or_default()).collect(),
        signal_type: row.get("signal_type")?,
        tick_size: row.get::<_, String>("tick_size")?.parse().unwrap_or_default(),
        qty_step: row.get::<_, String>("qty_step")?.parse().unwrap_or_default(),
        min_qty: row.get::<_, String>("min_qty")?.parse().unwrap_or_default(),
        leverage: leverage.and_then(|l| l.parse().ok()),
        status: SignalStatus::parse(&row.get::<_, String>("status")?).unwrap_or(SignalStatus::Queued),
        locked_by: row.get("locked_by")?,
        stage2_json: stage2_json.and_then(|s| serde_json::from_str(&s).ok()),
        last_error: row.get("last_error")?,
    })
}
