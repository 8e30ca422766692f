//! Stage 6: capacity watchdog. Ticks on a fixed interval, counts every
//! position that isn't closed plus every signal still in flight through
//! Stage 2, and flips a shared gate that Stage 1 consults before accepting a
//! fresh signal. Mirrors the shape of the teacher's `DataSourceKillSwitch`:
//! a counter crossing a threshold trips a flag, and the flag clears itself
//! once the counter falls back under it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::Config;
use crate::error::BotError;
use crate::lifecycle::LifecycleStore;
use crate::models::Correlation;
use crate::ssot::SsotStore;
use crate::telemetry::TelemetryLogger;

/// Shared capacity gate. Cloned into ingestion; only the watchdog tick ever
/// calls [`CapacityGuard::set`].
#[derive(Default)]
pub struct CapacityGuard {
    blocked: AtomicBool,
    reason: Mutex<String>,
}

impl CapacityGuard {
    pub fn is_blocked(&self) -> bool {
        self.blocked.load(Ordering::Relaxed)
    }

    pub fn reason(&self) -> String {
        self.reason.lock().clone()
    }

    fn set(&self, blocked: bool, reason: String) {
        self.blocked.store(blocked, Ordering::Relaxed);
        *self.reason.lock() = reason;
    }
}

pub struct Watchdog {
    ssot: Arc<SsotStore>,
    lifecycle: Arc<LifecycleStore>,
    telemetry: Arc<TelemetryLogger>,
    config: Config,
    guard: Arc<CapacityGuard>,
}

impl Watchdog {
    pub fn new(ssot: Arc<SsotStore>, lifecycle: Arc<LifecycleStore>, telemetry: Arc<TelemetryLogger>, config: Config) -> Self {
        Self { ssot, lifecycle, telemetry, config, guard: Arc::new(CapacityGuard::default()) }
    }

    /// Handed to ingestion so it can refuse new signals while blocked.
    pub fn guard(&self) -> Arc<CapacityGuard> {
        self.guard.clone()
    }

    pub async fn run_forever(self: Arc<Self>) {
        let poll = Duration::from_secs(self.config.stage6_watchdog_interval_seconds);
        loop {
            if let Err(e) = self.tick() {
                tracing::error!(error = %e, "watchdog: tick failed");
            }
            tokio::time::sleep(poll).await;
        }
    }

    pub fn tick(&self) -> Result<(), BotError> {
        let active = self.active_trades()?;
        let max = self.config.stage6_max_active_trades as i64;
        let was_blocked = self.guard.is_blocked();

        if active >= max {
            let reason = format!("active_trades {active} >= max_active_trades {max}");
            if !was_blocked {
                self.telemetry.warning(
                    "CAPACITY_BLOCKED",
                    "watchdog",
                    &reason,
                    &Correlation::default(),
                    serde_json::json!({"active_trades": active, "max_active_trades": max}),
                );
            }
            self.guard.set(true, reason);
        } else {
            if was_blocked {
                self.telemetry.info(
                    "CAPACITY_CLEARED",
                    "watchdog",
                    "active trades back under capacity",
                    &Correlation::default(),
                    serde_json::json!({"active_trades": active, "max_active_trades": max}),
                );
            }
            self.guard.set(false, String::new());
        }
        Ok(())
    }

    /// Not-closed positions plus signals still moving through Stage 2;
    /// the same two counters the maintenance loops walk for cleanup.
    pub fn active_trades(&self) -> Result<i64, BotError> {
        Ok(self.lifecycle.count_positions_not_closed()? + self.ssot.count_stage2_inflight()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PositionStatus, Side, TpLevel, TpStatus};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn test_config() -> Config {
        Config {
            ssot_db_path: ":memory:".into(),
            lifecycle_db_path: ":memory:".into(),
            telemetry_path: std::env::temp_dir().join("watchdog-test-telemetry.jsonl").to_string_lossy().to_string(),
            risk_per_trade: dec!(0.02),
            initial_margin_plan: dec!(20.00),
            max_leverage: dec!(50),
            min_leverage: dec!(1),
            timeout_short_secs: 86400,
            timeout_long_secs: 518400,
            duplicate_ttl_hours: 2,
            lock_ttl_seconds: 300,
            default_signal_type_when_missing: crate::models::SignalKind::Swing,
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
            stage6_max_active_trades: 2,
            stage6_watchdog_interval_seconds: 10,
            stage6_reports_daily_at_local_time: "08:00".into(),
            stage6_reports_weekly_weekday: chrono::Weekday::Mon,
            stage6_reports_weekly_at_local_time: "08:00".into(),
            timezone_offset_hours: 0,
            maintenance_cleanup_short_interval_seconds: 900,
            maintenance_cleanup_long_interval_seconds: 21600,
            maintenance_reconcile_interval_seconds: 120,
            bot_name: "test".into(),
            env_name: "test".into(),
            health_port: 0,
        }
    }

    fn harness() -> (Watchdog, Arc<LifecycleStore>) {
        let ssot = Arc::new(SsotStore::in_memory().unwrap());
        let lifecycle = Arc::new(LifecycleStore::in_memory().unwrap());
        let telemetry = Arc::new(TelemetryLogger::new(&test_config().telemetry_path, "test", "test").unwrap());
        let watchdog = Watchdog::new(ssot, lifecycle.clone(), telemetry, test_config());
        (watchdog, lifecycle)
    }

    fn open_position(lifecycle: &LifecycleStore, ssot_id: i64) {
        let levels = vec![TpLevel { index: 0, price: dec!(110), status: TpStatus::Open, filled_qty: Decimal::ZERO, order_id: None }];
        lifecycle
            .create_position_if_absent(ssot_id, "BTCUSDT", Side::Long, PositionStatus::Open, dec!(1), dec!(1), dec!(100), dec!(90), dec!(100), dec!(90), Some(dec!(10)), &levels)
            .unwrap();
    }

    #[test]
    fn blocks_once_at_capacity_and_clears_after() {
        let (watchdog, lifecycle) = harness();
        open_position(&lifecycle, 1);
        open_position(&lifecycle, 2);

        watchdog.tick().unwrap();
        assert!(watchdog.guard().is_blocked());

        lifecycle.update_position(1, &crate::lifecycle::PositionUpdate { status: Some(PositionStatus::Closed), ..Default::default() }).unwrap();
        watchdog.tick().unwrap();
        assert!(!watchdog.guard().is_blocked());
    }

    #[test]
    fn stays_clear_under_capacity() {
        let (watchdog, lifecycle) = harness();
        open_position(&lifecycle, 1);
        watchdog.tick().unwrap();
        assert!(!watchdog.guard().is_blocked());
    }
}
