//! Immutable runtime configuration.
//!
//! Built once in `main()` via [`Config::from_env`] and threaded explicitly
//! through every component constructor. No global/lazy config cell exists
//! for this value — see the Design Notes on replacing ad-hoc global state
//! with an explicit configuration object.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;

use crate::models::SignalKind;

#[derive(Debug, Clone)]
pub struct Config {
    pub ssot_db_path: String,
    pub lifecycle_db_path: String,
    pub telemetry_path: String,

    pub risk_per_trade: Decimal,
    pub initial_margin_plan: Decimal,
    pub max_leverage: Decimal,
    pub min_leverage: Decimal,

    pub timeout_short_secs: i64,
    pub timeout_long_secs: i64,
    pub duplicate_ttl_hours: i64,
    pub lock_ttl_seconds: i64,

    pub default_signal_type_when_missing: SignalKind,
    pub per_channel_default_type: HashMap<String, SignalKind>,

    pub stage2_default_spread_pct: Decimal,
    pub stage2_max_price_shifts: u32,
    pub stage2_poll_interval_seconds: u64,

    pub stage4_poll_interval_seconds: u64,
    pub stage4_move_sl_to_be_after_tp1: bool,
    pub stage4_trailing_enable: bool,
    pub stage4_trailing_after_tp_index: usize,
    pub stage4_trailing_offset_pct: Decimal,

    pub stage5_adverse_move_pct: Decimal,
    pub stage5_max_reentry_attempts: u32,

    pub pyramid_poll_interval_seconds: u64,
    pub pyramid_profit_threshold_1: Decimal,
    pub pyramid_profit_threshold_2: Decimal,
    pub pyramid_add_size_1: Decimal,
    pub pyramid_add_size_2: Decimal,
    pub pyramid_max_size_multiplier: Decimal,

    pub stage6_max_active_trades: u32,
    pub stage6_watchdog_interval_seconds: u64,
    pub stage6_reports_daily_at_local_time: String,
    pub stage6_reports_weekly_weekday: chrono::Weekday,
    pub stage6_reports_weekly_at_local_time: String,
    pub timezone_offset_hours: i32,

    pub maintenance_cleanup_short_interval_seconds: u64,
    pub maintenance_cleanup_long_interval_seconds: u64,
    pub maintenance_reconcile_interval_seconds: u64,

    pub bot_name: String,
    pub env_name: String,
    pub health_port: u16,
}

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_decimal(key: &str, default: Decimal) -> Decimal {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<Decimal>().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let per_channel_default_type = env_str("PER_CHANNEL_DEFAULT_TYPE", "")
            .split(',')
            .filter_map(|pair| {
                let mut it = pair.splitn(2, '=');
                let chan = it.next()?.trim();
                let kind = it.next()?.trim();
                if chan.is_empty() {
                    return None;
                }
                Some((chan.to_string(), SignalKind::parse(kind).unwrap_or(SignalKind::Swing)))
            })
            .collect();

        Ok(Self {
            ssot_db_path: env_str("SSOT_DB_PATH", "./data/ssot.db"),
            lifecycle_db_path: env_str("LIFECYCLE_DB_PATH", "./data/lifecycle.db"),
            telemetry_path: env_str("TELEMETRY_PATH", "./data/telemetry.jsonl"),

            risk_per_trade: env_decimal("RISK_PER_TRADE", dec!(0.02)),
            initial_margin_plan: env_decimal("INITIAL_MARGIN_PLAN", dec!(20.00)),
            max_leverage: env_decimal("MAX_LEVERAGE", dec!(50)),
            min_leverage: env_decimal("MIN_LEVERAGE", dec!(1)),

            timeout_short_secs: env_parse("TIMEOUT_SHORT_SECONDS", 24 * 3600),
            timeout_long_secs: env_parse("TIMEOUT_LONG_SECONDS", 6 * 24 * 3600),
            duplicate_ttl_hours: env_parse("DUPLICATE_TTL_HOURS", 2),
            lock_ttl_seconds: env_parse("LOCK_TTL_SECONDS", 300),

            default_signal_type_when_missing: SignalKind::parse(&env_str(
                "DEFAULT_SIGNAL_TYPE_WHEN_MISSING",
                "SWING",
            ))
            .unwrap_or(SignalKind::Swing),
            per_channel_default_type,

            stage2_default_spread_pct: env_decimal("STAGE2_DEFAULT_SPREAD_PCT", dec!(0.001)),
            stage2_max_price_shifts: env_parse("STAGE2_MAX_PRICE_SHIFTS", 50),
            stage2_poll_interval_seconds: env_parse("STAGE2_POLL_INTERVAL_SECONDS", 5),

            stage4_poll_interval_seconds: env_parse("STAGE4_POLL_INTERVAL_SECONDS", 5),
            stage4_move_sl_to_be_after_tp1: env_bool("STAGE4_MOVE_SL_TO_BE_AFTER_TP1", true),
            stage4_trailing_enable: env_bool("STAGE4_TRAILING_ENABLE", false),
            stage4_trailing_after_tp_index: env_parse("STAGE4_TRAILING_AFTER_TP_INDEX", 1),
            stage4_trailing_offset_pct: env_decimal("STAGE4_TRAILING_OFFSET_PCT", dec!(0.01)),

            stage5_adverse_move_pct: env_decimal("STAGE5_ADVERSE_MOVE_PCT", dec!(0.02)),
            stage5_max_reentry_attempts: env_parse("STAGE5_MAX_REENTRY_ATTEMPTS", 3),

            pyramid_poll_interval_seconds: env_parse("PYRAMID_POLL_INTERVAL_SECONDS", 15),
            pyramid_profit_threshold_1: env_decimal("PYRAMID_PROFIT_THRESHOLD_1", dec!(3)),
            pyramid_profit_threshold_2: env_decimal("PYRAMID_PROFIT_THRESHOLD_2", dec!(6)),
            pyramid_add_size_1: env_decimal("PYRAMID_ADD_SIZE_1", dec!(0.5)),
            pyramid_add_size_2: env_decimal("PYRAMID_ADD_SIZE_2", dec!(0.25)),
            pyramid_max_size_multiplier: env_decimal("PYRAMID_MAX_SIZE_MULTIPLIER", dec!(2.0)),

            stage6_max_active_trades: env_parse("STAGE6_MAX_ACTIVE_TRADES", 20),
            stage6_watchdog_interval_seconds: env_parse("STAGE6_WATCHDOG_INTERVAL_SECONDS", 10),
            stage6_reports_daily_at_local_time: env_str("STAGE6_REPORTS_DAILY_AT", "08:00"),
            stage6_reports_weekly_weekday: parse_weekday(&env_str(
                "STAGE6_REPORTS_WEEKLY_WEEKDAY",
                "MON",
            )),
            stage6_reports_weekly_at_local_time: env_str("STAGE6_REPORTS_WEEKLY_AT", "08:00"),
            timezone_offset_hours: env_parse("TIMEZONE_OFFSET_HOURS", 0),

            maintenance_cleanup_short_interval_seconds: env_parse(
                "MAINTENANCE_CLEANUP_SHORT_INTERVAL_SECONDS",
                900,
            ),
            maintenance_cleanup_long_interval_seconds: env_parse(
                "MAINTENANCE_CLEANUP_LONG_INTERVAL_SECONDS",
                6 * 3600,
            ),
            maintenance_reconcile_interval_seconds: env_parse(
                "MAINTENANCE_RECONCILE_INTERVAL_SECONDS",
                120,
            ),

            bot_name: env_str("BOT_NAME", "signalbot"),
            env_name: env_str("ENV_NAME", "dev"),
            health_port: env_parse("HEALTH_PORT", 8090),
        })
    }
}

fn parse_weekday(s: &str) -> chrono::Weekday {
    use chrono::Weekday::*;
    match s.to_ascii_uppercase().as_str() {
        "MON" => Mon,
        "TUE" => Tue,
        "WED" => Wed,
        "THU" => Thu,
        "FRI" => Fri,
        "SAT" => Sat,
        "SUN" => Sun,
        _ => Mon,
    }
}
