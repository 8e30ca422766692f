//! Stage 1: turn a raw channel message into either a durably queued
//! `ParsedSignal` or a structured rejection. This is the only place that
//! writes the `ssot_queue`/`recent_signals` tables via insertion — everyone
//! downstream only reads or transitions rows the claim loop hands them.

pub mod parser;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::config::Config;
use crate::decimal_ext::quantize_tick;
use crate::error::BotError;
use crate::exchange::ExchangeClient;
use crate::models::{Correlation, IngestDecision, ParsedSignal, Side, SignalKind};
use crate::ssot::{dedup_payload_hash, DedupDecision, SsotStore};
use crate::telemetry::TelemetryLogger;
use crate::watchdog::CapacityGuard;

use parser::SignalParser;

static HARD_EXCLUSIONS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"(?i)TP\d+\s+reached").unwrap(),
        Regex::new(r"(?i)partial\s+close").unwrap(),
        Regex::new(r"(?i)profit:.*period:").unwrap(),
        Regex::new(r"(?i)^\s*(breaking|news)\b").unwrap(),
    ]
});

pub struct RawMessage {
    pub source: String,
    pub chat_id: String,
    pub message_id: String,
    pub message_ts: Option<DateTime<Utc>>,
    pub raw_text: String,
}

pub struct SignalIngestion {
    ssot: Arc<SsotStore>,
    exchange: Arc<dyn ExchangeClient>,
    telemetry: Arc<TelemetryLogger>,
    config: Config,
    capacity_guard: Option<Arc<CapacityGuard>>,
}

impl SignalIngestion {
    pub fn new(ssot: Arc<SsotStore>, exchange: Arc<dyn ExchangeClient>, telemetry: Arc<TelemetryLogger>, config: Config) -> Self {
        Self { ssot, exchange, telemetry, config, capacity_guard: None }
    }

    /// Wires in the Stage 6 capacity gate. Without this, ingestion never
    /// refuses a signal for being over the active-trade cap.
    pub fn with_capacity_guard(mut self, guard: Arc<CapacityGuard>) -> Self {
        self.capacity_guard = Some(guard);
        self
    }

    pub async fn ingest(&self, msg: RawMessage) -> Result<IngestDecision, BotError> {
        let raw_text = msg.raw_text.trim().to_string();
        if raw_text.is_empty() {
            return Ok(self.invalid("empty message text", &msg));
        }
        if is_hard_excluded(&raw_text) {
            return Ok(self.invalid("matched hard exclusion list (non-signal)", &msg));
        }
        if let Some(guard) = &self.capacity_guard {
            if guard.is_blocked() {
                let reason = format!("capacity blocked: {}", guard.reason());
                self.telemetry.warning(
                    "SIGNAL_BLOCKED",
                    "ingestion",
                    &reason,
                    &Correlation { source_chat_id: Some(msg.chat_id.clone()), source_message_id: Some(msg.message_id.clone()), ..Default::default() },
                    serde_json::json!({}),
                );
                return Ok(IngestDecision::Blocked { reason });
            }
        }

        let fields = SignalParser::parse(&raw_text);
        let Some(symbol) = fields.symbol.clone() else {
            return Ok(self.invalid("missing/invalid symbol", &msg));
        };
        let Some(side) = fields.side else {
            return Ok(self.invalid("missing/invalid side", &msg));
        };
        let Some(entry) = fields.entry else {
            return Ok(self.invalid("missing entry", &msg));
        };
        if fields.tps.is_empty() {
            return Ok(self.invalid("missing take-profit targets", &msg));
        }

        let mut forced_fast = false;
        let sl = match self.detect_sl(&fields, entry, side) {
            Some(sl) => sl,
            None => {
                forced_fast = true;
                auto_sl(entry, side)
            }
        };

        let mut kind = detect_kind_from_text(&raw_text);
        if kind.is_none() {
            if let Some(lev) = fields.leverage {
                kind = Some(SignalKind::classify_from_leverage(lev));
            }
        }
        if kind.is_none() {
            kind = self.config.per_channel_default_type.get(&msg.source).copied();
        }
        if kind.is_none() {
            kind = Some(self.config.default_signal_type_when_missing);
        }
        if forced_fast {
            kind = Some(SignalKind::Fast);
        }
        let kind = kind.unwrap();

        let Some(symbol_info) = self.exchange.get_symbol_info(&symbol).await.map_err(|e| BotError::ExchangeTransient(e.to_string()))? else {
            return Ok(self.invalid("unsupported symbol (not found on exchange)", &msg));
        };

        let entry_q = quantize_tick(entry, symbol_info.tick_size);
        let sl_q = quantize_tick(sl, symbol_info.tick_size);
        let tps_q: Vec<Decimal> = fields.tps.iter().map(|tp| quantize_tick(*tp, symbol_info.tick_size)).collect();

        let dedup_hash = dedup_payload_hash(&msg.source, &symbol, side, entry_q, &tps_q, sl_q);
        let signal = ParsedSignal {
            source: msg.source.clone(),
            chat_id: msg.chat_id.clone(),
            message_id: msg.message_id.clone(),
            received_at: Utc::now(),
            raw_text,
            symbol: symbol.clone(),
            side,
            entry: entry_q,
            sl: sl_q,
            tps: tps_q,
            kind,
            tick_size: symbol_info.tick_size,
            qty_step: symbol_info.qty_step,
            min_qty: symbol_info.min_qty,
            leverage: fields.leverage,
            dedup_hash,
        };

        let dedup = self.ssot.check_and_record_dedup(&signal, self.config.duplicate_ttl_hours)?;
        if let DedupDecision::Block { reason, .. } = &dedup {
            self.telemetry.info(
                "SIGNAL_BLOCKED",
                "ingestion",
                reason,
                &Correlation { source_chat_id: Some(msg.chat_id.clone()), source_message_id: Some(msg.message_id.clone()), ..Default::default() },
                serde_json::json!({"symbol": symbol, "side": side.as_str()}),
            );
            return Ok(IngestDecision::Blocked { reason: reason.clone() });
        }

        let ssot_id = self.ssot.insert_accepted_signal(&signal)?;
        self.ssot.clear_stage5_lock(&symbol, side)?;

        self.telemetry.info(
            "SIGNAL_ACCEPTED",
            "ingestion",
            "signal accepted into ssot queue",
            &Correlation { ssot_id: Some(ssot_id), source_chat_id: Some(msg.chat_id), source_message_id: Some(msg.message_id), ..Default::default() },
            serde_json::json!({"symbol": symbol, "side": side.as_str(), "kind": kind.as_str()}),
        );

        Ok(IngestDecision::Accepted { ssot_id })
    }

    fn detect_sl(&self, fields: &parser::ParsedFields, _entry: Decimal, _side: Side) -> Option<Decimal> {
        fields.sl
    }

    fn invalid(&self, reason: &str, msg: &RawMessage) -> IngestDecision {
        self.telemetry.warning(
            "SIGNAL_INVALID",
            "ingestion",
            reason,
            &Correlation { source_chat_id: Some(msg.chat_id.clone()), source_message_id: Some(msg.message_id.clone()), ..Default::default() },
            serde_json::json!({"raw_text_len": msg.raw_text.len()}),
        );
        IngestDecision::Invalid { reason: reason.to_string() }
    }
}

fn is_hard_excluded(text: &str) -> bool {
    HARD_EXCLUSIONS.iter().any(|re| re.is_match(text))
}

fn detect_kind_from_text(text: &str) -> Option<SignalKind> {
    let lower = text.to_ascii_lowercase();
    if lower.contains("swing") {
        Some(SignalKind::Swing)
    } else if lower.contains("dynamic") {
        Some(SignalKind::Dynamic)
    } else if lower.contains("fast") || lower.contains("fixed") {
        Some(SignalKind::Fast)
    } else {
        None
    }
}

/// `SL = entry * (1 - 0.02)` for LONG, `entry * (1 + 0.02)` for SHORT.
fn auto_sl(entry: Decimal, side: Side) -> Decimal {
    match side {
        Side::Long => entry * (Decimal::ONE - dec!(0.02)),
        Side::Short => entry * (Decimal::ONE + dec!(0.02)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::paper::PaperExchange;
    use crate::exchange::SymbolInfo;
    use tempfile::tempdir;

    fn make_ingestion() -> (SignalIngestion, Arc<SsotStore>) {
        let dir = tempdir().unwrap();
        let ssot = Arc::new(SsotStore::open(dir.path().join("ssot.db").to_str().unwrap()).unwrap());
        let exchange = PaperExchange::new(SymbolInfo { tick_size: dec!(0.01), qty_step: dec!(0.001), min_qty: dec!(0.001), max_qty: None });
        exchange.set_symbol_info("BTCUSDT", SymbolInfo { tick_size: dec!(0.01), qty_step: dec!(0.001), min_qty: dec!(0.001), max_qty: None });
        let telemetry = Arc::new(TelemetryLogger::new(dir.path().join("t.jsonl").to_str().unwrap(), "test", "test").unwrap());
        let mut config_path = dir.path().join("dummy");
        config_path.set_extension("env");
        let config = test_config();
        let ingestion = SignalIngestion::new(ssot.clone(), exchange, telemetry, config);
        (ingestion, ssot)
    }

    fn test_config() -> Config {
        Config {
            ssot_db_path: String::new(),
            lifecycle_db_path: String::new(),
            telemetry_path: String::new(),
            risk_per_trade: dec!(0.02),
            initial_margin_plan: dec!(20),
            max_leverage: dec!(50),
            min_leverage: dec!(1),
            timeout_short_secs: 86400,
            timeout_long_secs: 6 * 86400,
            duplicate_ttl_hours: 2,
            lock_ttl_seconds: 300,
            default_signal_type_when_missing: SignalKind::Swing,
            per_channel_default_type: Default::default(),
            stage2_default_spread_pct: dec!(0.001),
            stage2_max_price_shifts: 50,
            stage2_poll_interval_seconds: 5,
            stage4_poll_interval_seconds: 5,
            stage4_move_sl_to_be_after_tp1: true,
            stage4_trailing_enable: false,
            stage4_trailing_after_tp_index: 1,
            stage4_trailing_offset_pct: dec!(0.01),
            stage5_adverse_move_pct: dec!(0.02),
            stage5_max_reentry_attempts: 3,
            pyramid_poll_interval_seconds: 15,
            pyramid_profit_threshold_1: dec!(3),
            pyramid_profit_threshold_2: dec!(6),
            pyramid_add_size_1: dec!(0.5),
            pyramid_add_size_2: dec!(0.25),
            pyramid_max_size_multiplier: dec!(2.0),
            stage6_max_active_trades: 20,
            stage6_watchdog_interval_seconds: 10,
            stage6_reports_daily_at_local_time: "08:00".into(),
            stage6_reports_weekly_weekday: chrono::Weekday::Mon,
            stage6_reports_weekly_at_local_time: "08:00".into(),
            timezone_offset_hours: 0,
            maintenance_cleanup_short_interval_seconds: 900,
            maintenance_cleanup_long_interval_seconds: 6 * 3600,
            maintenance_reconcile_interval_seconds: 120,
            bot_name: "test".into(),
            env_name: "test".into(),
            health_port: 0,
        }
    }

    fn msg(text: &str) -> RawMessage {
        RawMessage { source: "chan".into(), chat_id: "1".into(), message_id: "1".into(), message_ts: None, raw_text: text.into() }
    }

    #[tokio::test]
    async fn accepts_well_formed_signal() {
        let (ingestion, _ssot) = make_ingestion();
        let decision = ingestion.ingest(msg("#BTC LONG Entry: 100.00 TP1: 105 TP2: 110 SL: 95 Leverage: 5x")).await.unwrap();
        assert!(matches!(decision, IngestDecision::Accepted { .. }));
    }

    #[tokio::test]
    async fn rejects_hard_excluded_message() {
        let (ingestion, _ssot) = make_ingestion();
        let decision = ingestion.ingest(msg("TP1 reached! great profit on BTCUSDT")).await.unwrap();
        assert!(matches!(decision, IngestDecision::Invalid { .. }));
    }

    #[tokio::test]
    async fn missing_sl_falls_back_to_fast_and_auto_sl() {
        let (ingestion, ssot) = make_ingestion();
        let decision = ingestion.ingest(msg("#BTC LONG Entry: 100.00 TP1: 105 TP2: 110")).await.unwrap();
        let IngestDecision::Accepted { ssot_id } = decision else { panic!("expected accept") };
        let row = ssot.get_queue_row(ssot_id).unwrap().unwrap();
        assert_eq!(row.signal_type, "FAST");
        assert_eq!(row.sl_price, dec!(98.00));
    }

    #[tokio::test]
    async fn rejects_unknown_symbol() {
        let (ingestion, _ssot) = make_ingestion();
        let decision = ingestion.ingest(msg("#ZZZZ LONG Entry: 1.00 TP1: 1.10 SL: 0.90")).await.unwrap();
        assert!(matches!(decision, IngestDecision::Invalid { .. }));
    }
}
