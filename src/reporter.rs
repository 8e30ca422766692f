//! Stage 6: scheduled PnL/activity reporting. Ticks on a short interval,
//! fires a report once the local clock crosses the configured daily or
//! weekly time, and aggregates a rolling window from three sources: the
//! telemetry log, the SSoT queue's signal counts, and the lifecycle store's
//! position state. Each report carries a stable `event_key` so a crash mid-
//! report never produces a duplicate send on restart.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, NaiveTime, Timelike, Utc};
use rust_decimal::Decimal;

use crate::channels::ReportingChannel;
use crate::config::Config;
use crate::error::BotError;
use crate::lifecycle::LifecycleStore;
use crate::models::{Correlation, HedgeState, PositionStatus, SignalStatus};
use crate::ssot::SsotStore;
use crate::telemetry::TelemetryLogger;

const POLL_INTERVAL: StdDuration = StdDuration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReportKind {
    Daily,
    Weekly,
}

impl ReportKind {
    fn as_str(self) -> &'static str {
        match self {
            ReportKind::Daily => "daily",
            ReportKind::Weekly => "weekly",
        }
    }
}

pub struct Reporter {
    ssot: Arc<SsotStore>,
    lifecycle: Arc<LifecycleStore>,
    telemetry: Arc<TelemetryLogger>,
    channel: Arc<dyn ReportingChannel>,
    report_chat_id: String,
    config: Config,
}

impl Reporter {
    pub fn new(
        ssot: Arc<SsotStore>,
        lifecycle: Arc<LifecycleStore>,
        telemetry: Arc<TelemetryLogger>,
        channel: Arc<dyn ReportingChannel>,
        report_chat_id: String,
        config: Config,
    ) -> Self {
        Self { ssot, lifecycle, telemetry, channel, report_chat_id, config }
    }

    pub async fn run_forever(self: Arc<Self>) {
        loop {
            if let Err(e) = self.tick().await {
                tracing::error!(error = %e, "reporter: tick failed");
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    pub async fn tick(&self) -> Result<(), BotError> {
        let now_local = Utc::now() + Duration::hours(self.config.timezone_offset_hours as i64);

        if matches_hhmm(now_local, &self.config.stage6_reports_daily_at_local_time) {
            let date_key = now_local.format("%Y-%m-%d").to_string();
            self.maybe_send(ReportKind::Daily, &date_key, Duration::hours(24)).await?;
        }
        if now_local.weekday() == self.config.stage6_reports_weekly_weekday
            && matches_hhmm(now_local, &self.config.stage6_reports_weekly_at_local_time)
        {
            let week_key = now_local.format("%G-W%V").to_string();
            self.maybe_send(ReportKind::Weekly, &week_key, Duration::days(7)).await?;
        }
        Ok(())
    }

    async fn maybe_send(&self, kind: ReportKind, period_key: &str, window: Duration) -> Result<(), BotError> {
        let event_key = format!("report-{}-{period_key}", kind.as_str());
        if self.already_sent(&event_key) {
            return Ok(());
        }

        let end = Utc::now();
        let start = end - window;
        let data = self.aggregate(start, end)?;
        let text = format_report(kind, &data);

        self.channel
            .send_text(&self.report_chat_id, &text)
            .await
            .map_err(|e| BotError::Internal(e.to_string()))?;

        self.telemetry.emit_with_key(
            "REPORT_SENT",
            crate::telemetry::Level::Info,
            "reporter",
            &text,
            &Correlation::default(),
            serde_json::json!({"kind": kind.as_str(), "period": period_key}),
            event_key,
        );
        Ok(())
    }

    fn already_sent(&self, event_key: &str) -> bool {
        self.telemetry.read_all().iter().any(|v| v.get("event_key").and_then(|k| k.as_str()) == Some(event_key))
    }

    fn aggregate(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<ReportData, BotError> {
        let signals_received = self.ssot.count_signals_received_between(start, end)?;
        let signals_completed = self.ssot.count_signals_with_status_between(&[SignalStatus::Completed], start, end)?;
        let signals_failed = self.ssot.count_signals_with_status_between(&[SignalStatus::Failed, SignalStatus::Expired], start, end)?;

        let closed = self.lifecycle.list_positions_by_status(&[PositionStatus::Closed], 10_000)?;
        let mut positions_closed = 0i64;
        let mut realized_pnl = Decimal::ZERO;
        for position in &closed {
            if position.updated_at >= start && position.updated_at <= end {
                positions_closed += 1;
                realized_pnl += position.realized_pnl;
            }
        }

        let not_closed = self.lifecycle.list_positions_not_closed(10_000)?;
        let mut hedge_opened = 0i64;
        let mut reentry_attempts = 0i64;
        for position in not_closed.iter().chain(closed.iter()) {
            if position.hedge_state != HedgeState::Idle {
                hedge_opened += 1;
            }
            reentry_attempts += position.reentry_attempts as i64;
        }

        let mut error_counts: BTreeMap<String, i64> = BTreeMap::new();
        let mut seen_keys = HashSet::new();
        for event in self.telemetry.read_since(start) {
            let Some(key) = event.get("event_key").and_then(|k| k.as_str()) else { continue };
            if !seen_keys.insert(key.to_string()) {
                continue;
            }
            if event.get("level").and_then(|l| l.as_str()) != Some("ERROR") {
                continue;
            }
            let event_type = event.get("event_type").and_then(|t| t.as_str()).unwrap_or("UNKNOWN").to_string();
            *error_counts.entry(event_type).or_insert(0) += 1;
        }

        Ok(ReportData {
            start,
            end,
            signals_received,
            signals_completed,
            signals_failed,
            positions_closed,
            realized_pnl,
            hedge_opened,
            reentry_attempts,
            error_counts,
        })
    }
}

struct ReportData {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    signals_received: i64,
    signals_completed: i64,
    signals_failed: i64,
    positions_closed: i64,
    realized_pnl: Decimal,
    hedge_opened: i64,
    reentry_attempts: i64,
    error_counts: BTreeMap<String, i64>,
}

fn format_report(kind: ReportKind, data: &ReportData) -> String {
    let mut out = format!(
        "[{}] window {} .. {}\nsignals received={} completed={} failed={}\npositions closed={} realized_pnl={}\nhedge_active={} reentry_attempts={}",
        kind.as_str(),
        data.start.to_rfc3339(),
        data.end.to_rfc3339(),
        data.signals_received,
        data.signals_completed,
        data.signals_failed,
        data.positions_closed,
        data.realized_pnl,
        data.hedge_opened,
        data.reentry_attempts,
    );
    if data.error_counts.is_empty() {
        out.push_str("\nerrors: none");
    } else {
        out.push_str("\nerrors:");
        for (event_type, count) in &data.error_counts {
            out.push_str(&format!(" {event_type}={count}"));
        }
    }
    out
}

fn matches_hhmm(now_local: DateTime<Utc>, target: &str) -> bool {
    let Ok(target_time) = NaiveTime::parse_from_str(target, "%H:%M") else { return false };
    now_local.time().hour() == target_time.hour() && now_local.time().minute() == target_time.minute()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Side, TpLevel, TpStatus};
    use rust_decimal_macros::dec;
    use std::sync::Mutex;

    fn test_config() -> Config {
        Config {
            ssot_db_path: ":memory:".into(),
            lifecycle_db_path: ":memory:".into(),
            telemetry_path: std::env::temp_dir().join("reporter-test-telemetry.jsonl").to_string_lossy().to_string(),
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
            stage6_max_active_trades: 20,
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

    struct CapturingChannel {
        sent: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl ReportingChannel for CapturingChannel {
        async fn send_text(&self, _chat_id: &str, text: &str) -> anyhow::Result<Option<String>> {
            self.sent.lock().unwrap().push(text.to_string());
            Ok(None)
        }
    }

    fn harness() -> (Arc<Reporter>, Arc<LifecycleStore>, Arc<SsotStore>, Arc<CapturingChannel>) {
        let ssot = Arc::new(SsotStore::in_memory().unwrap());
        let lifecycle = Arc::new(LifecycleStore::in_memory().unwrap());
        let telemetry = Arc::new(TelemetryLogger::new(&test_config().telemetry_path, "test", "test").unwrap());
        let channel = Arc::new(CapturingChannel { sent: Mutex::new(Vec::new()) });
        let reporter = Arc::new(Reporter::new(
            ssot.clone(),
            lifecycle.clone(),
            telemetry,
            channel.clone() as Arc<dyn ReportingChannel>,
            "ops".to_string(),
            test_config(),
        ));
        (reporter, lifecycle, ssot, channel)
    }

    #[tokio::test]
    async fn sends_report_once_per_period_key() {
        let (reporter, _lifecycle, _ssot, channel) = harness();
        reporter.maybe_send(ReportKind::Daily, "2026-07-28", Duration::hours(24)).await.unwrap();
        reporter.maybe_send(ReportKind::Daily, "2026-07-28", Duration::hours(24)).await.unwrap();
        assert_eq!(channel.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn aggregate_counts_closed_positions_and_pnl() {
        let (reporter, lifecycle, _ssot, _channel) = harness();
        let levels = vec![TpLevel { index: 0, price: dec!(110), status: TpStatus::Completed, filled_qty: dec!(1), order_id: None }];
        lifecycle
            .create_position_if_absent(1, "BTCUSDT", Side::Long, PositionStatus::Open, dec!(1), dec!(1), dec!(100), dec!(90), dec!(100), dec!(90), Some(dec!(10)), &levels)
            .unwrap();
        lifecycle
            .update_position(1, &crate::lifecycle::PositionUpdate { status: Some(PositionStatus::Closed), realized_pnl: Some(dec!(15)), ..Default::default() })
            .unwrap();

        let end = Utc::now();
        let start = end - Duration::hours(24);
        let data = reporter.aggregate(start, end).unwrap();
        assert_eq!(data.positions_closed, 1);
        assert_eq!(data.realized_pnl, dec!(15));
    }
}
