//! Stage 7: maintenance sweeps. Three independent loops — short-timeout
//! cleanup, long-timeout cleanup (plus a hard position reset), and exchange
//! reconcile — each idempotent and safe to run again from a cold start.
//! `run_forever` runs one reconcile pass immediately before spawning the
//! periodic loops, the same convergence-on-restart behavior Stage 4 already
//! does for its own fills.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;

use crate::config::Config;
use crate::error::BotError;
use crate::exchange::{ExchangeClient, ExchangePosition, PositionSide};
use crate::executor::Stage2State;
use crate::lifecycle::{LifecycleManager, LifecycleStore, PositionUpdate};
use crate::models::{Correlation, HedgeState, PositionStatus, Side, SignalStatus, TpLevel, TpStatus};
use crate::ssot::SsotStore;
use crate::telemetry::TelemetryLogger;

const STALE_STAGE2_STATUSES: &[SignalStatus] = &[
    SignalStatus::Claimed,
    SignalStatus::Stage2Running,
    SignalStatus::Stage2Planned,
    SignalStatus::WaitingForFills,
    SignalStatus::Expired,
    SignalStatus::Failed,
];

pub struct Maintenance {
    ssot: Arc<SsotStore>,
    lifecycle: Arc<LifecycleStore>,
    lifecycle_manager: Arc<LifecycleManager>,
    exchange: Arc<dyn ExchangeClient>,
    telemetry: Arc<TelemetryLogger>,
    config: Config,
}

impl Maintenance {
    pub fn new(
        ssot: Arc<SsotStore>,
        lifecycle: Arc<LifecycleStore>,
        lifecycle_manager: Arc<LifecycleManager>,
        exchange: Arc<dyn ExchangeClient>,
        telemetry: Arc<TelemetryLogger>,
        config: Config,
    ) -> Self {
        Self { ssot, lifecycle, lifecycle_manager, exchange, telemetry, config }
    }

    pub async fn run_forever(self: Arc<Self>) {
        if let Err(e) = self.reconcile().await {
            tracing::error!(error = %e, "maintenance: startup reconcile failed");
        }

        let short = self.clone();
        tokio::spawn(async move {
            let poll = Duration::from_secs(short.config.maintenance_cleanup_short_interval_seconds);
            loop {
                tokio::time::sleep(poll).await;
                if let Err(e) = short.cleanup_24h().await {
                    tracing::error!(error = %e, "maintenance: 24h cleanup failed");
                }
            }
        });

        let long = self.clone();
        tokio::spawn(async move {
            let poll = Duration::from_secs(long.config.maintenance_cleanup_long_interval_seconds);
            loop {
                tokio::time::sleep(poll).await;
                if let Err(e) = long.cleanup_6d().await {
                    tracing::error!(error = %e, "maintenance: 6d cleanup failed");
                }
            }
        });

        let poll = Duration::from_secs(self.config.maintenance_reconcile_interval_seconds);
        loop {
            tokio::time::sleep(poll).await;
            if let Err(e) = self.reconcile().await {
                tracing::error!(error = %e, "maintenance: reconcile failed");
            }
        }
    }

    pub async fn cleanup_24h(&self) -> Result<(), BotError> {
        self.cleanup_stale_stage2(self.config.timeout_short_secs, SignalStatus::Cleaned24h).await
    }

    pub async fn cleanup_6d(&self) -> Result<(), BotError> {
        self.cleanup_stale_stage2(self.config.timeout_long_secs, SignalStatus::Cleaned6d).await?;
        self.force_close_stale_positions().await
    }

    async fn cleanup_stale_stage2(&self, min_age_seconds: i64, mark_as: SignalStatus) -> Result<(), BotError> {
        let rows = self.ssot.list_stage2_rows_older_than(min_age_seconds, STALE_STAGE2_STATUSES, 500)?;
        for row in rows {
            if self.has_live_exchange_position(&row.symbol, row.side).await? {
                continue;
            }

            if let Some(stage2) = &row.stage2_json {
                if let Ok(state) = serde_json::from_value::<Stage2State>(stage2.clone()) {
                    for order_id in &state.original_order_ids {
                        let _ = self.exchange.cancel_order(&row.symbol, order_id).await;
                    }
                    if let Some(order_id) = &state.replacement_order_id {
                        let _ = self.exchange.cancel_order(&row.symbol, order_id).await;
                    }
                }
            }

            self.ssot.mark_queue_row(row.id, mark_as, Some("maintenance: stale, no live exchange position"))?;
            self.telemetry.info(
                "MAINTENANCE_CLEANED",
                "maintenance",
                "cleaned up stale stage2 row",
                &Correlation { ssot_id: Some(row.id), ..Default::default() },
                serde_json::json!({"status": mark_as.as_str(), "symbol": row.symbol, "side": row.side.as_str()}),
            );
        }
        Ok(())
    }

    async fn force_close_stale_positions(&self) -> Result<(), BotError> {
        let cutoff = Utc::now() - chrono::Duration::seconds(self.config.timeout_long_secs);
        let positions = self.lifecycle.list_positions_not_closed(1000)?;
        for position in positions {
            if position.created_at > cutoff {
                continue;
            }
            if self.has_live_exchange_position(&position.symbol, position.side).await? {
                continue;
            }

            for order in self.lifecycle.list_tracked_orders_for_ssot_id(position.ssot_id)? {
                let _ = self.exchange.cancel_order(&position.symbol, &order.order_id).await;
            }
            self.lifecycle.delete_tracked_orders_for_ssot_id(position.ssot_id)?;
            self.lifecycle.update_position(
                position.ssot_id,
                &PositionUpdate {
                    status: Some(PositionStatus::Closed),
                    closed_reason: Some("hard reset (6d) - no exchange position".to_string()),
                    ..Default::default()
                },
            )?;
            self.telemetry.error(
                "MAINTENANCE_FORCE_CLOSED",
                "maintenance",
                "hard reset (6d) - no exchange position",
                &Correlation { ssot_id: Some(position.ssot_id), position_id: Some(position.ssot_id), ..Default::default() },
                serde_json::json!({"symbol": position.symbol, "side": position.side.as_str()}),
            );
        }
        Ok(())
    }

    async fn has_live_exchange_position(&self, symbol: &str, side: Side) -> Result<bool, BotError> {
        let positions = self.exchange.get_positions(Some(symbol)).await.map_err(|e| BotError::ExchangeTransient(e.to_string()))?;
        let position_side: PositionSide = side.into();
        Ok(positions.iter().any(|p| p.position_side == position_side && !p.position_amt.is_zero()))
    }

    pub async fn reconcile(&self) -> Result<(), BotError> {
        let positions = self.exchange.get_positions(None).await.map_err(|e| BotError::ExchangeTransient(e.to_string()))?;
        for exch_pos in positions {
            if exch_pos.position_amt.is_zero() {
                continue;
            }
            let side = match exch_pos.position_side {
                PositionSide::Long => Side::Long,
                PositionSide::Short => Side::Short,
            };
            if let Err(e) = self.reconcile_one(&exch_pos.symbol, side, &exch_pos).await {
                tracing::warn!(symbol = %exch_pos.symbol, side = side.as_str(), error = %e, "maintenance: reconcile_one failed");
            }
        }
        Ok(())
    }

    async fn reconcile_one(&self, symbol: &str, side: Side, exch_pos: &ExchangePosition) -> Result<(), BotError> {
        if self.lifecycle.get_position_by_symbol_side(symbol, side)?.is_some() {
            return Ok(());
        }

        let opposite = side.opposite();
        if let Some(opp) = self.lifecycle.get_position_by_symbol_side(symbol, opposite)? {
            if matches!(opp.hedge_state, HedgeState::Open | HedgeState::HedgeMode) {
                return Ok(());
            }
        }

        let Some(ssot_id) = self.ssot.find_latest_ssot_id_for_symbol_side(symbol, side)? else {
            self.telemetry.error(
                "UNMAPPED_OPEN_POSITION",
                "maintenance",
                "live exchange position with no matching signal",
                &Correlation::default(),
                serde_json::json!({"symbol": symbol, "side": side.as_str(), "qty": exch_pos.position_amt.to_string()}),
            );
            return Ok(());
        };

        let Some(row) = self.ssot.get_queue_row(ssot_id)? else {
            return Ok(());
        };

        let open_orders = self.exchange.get_open_orders(Some(symbol)).await.map_err(|e| BotError::ExchangeTransient(e.to_string()))?;
        let tracked = self.lifecycle.list_tracked_orders_for_ssot_id(ssot_id)?;
        let tracked_ids: HashSet<&str> = tracked.iter().map(|t| t.order_id.as_str()).collect();
        let has_untracked_orders = open_orders.iter().any(|o| !tracked_ids.contains(o.order_id.as_str()));

        let levels: Vec<TpLevel> = row
            .tp_prices
            .iter()
            .enumerate()
            .map(|(index, price)| TpLevel { index, price: *price, status: TpStatus::Open, filled_qty: Decimal::ZERO, order_id: None })
            .collect();

        self.lifecycle.create_position_if_absent(
            ssot_id,
            symbol,
            side,
            PositionStatus::Open,
            exch_pos.position_amt,
            exch_pos.position_amt,
            exch_pos.avg_price,
            row.sl_price,
            row.entry_price,
            row.sl_price,
            row.leverage,
            &levels,
        )?;

        let Some(position) = self.lifecycle.get_position(ssot_id)? else { return Ok(()) };

        if has_untracked_orders {
            self.lifecycle.update_position(ssot_id, &PositionUpdate { status: Some(PositionStatus::NeedsManualProtection), ..Default::default() })?;
            self.telemetry.error(
                "NEEDS_MANUAL_PROTECTION",
                "maintenance",
                "reconciled position has untracked open orders, ambiguous protection state",
                &Correlation { ssot_id: Some(ssot_id), position_id: Some(ssot_id), ..Default::default() },
                serde_json::json!({"symbol": symbol, "side": side.as_str()}),
            );
            return Ok(());
        }

        self.lifecycle_manager.place_initial_protection(&position).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::paper::PaperExchange;
    use crate::exchange::SymbolInfo;
    use crate::models::ParsedSignal;
    use rust_decimal_macros::dec;

    fn test_config() -> Config {
        Config {
            ssot_db_path: ":memory:".into(),
            lifecycle_db_path: ":memory:".into(),
            telemetry_path: std::env::temp_dir().join("maintenance-test-telemetry.jsonl").to_string_lossy().to_string(),
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

    fn harness() -> (Arc<Maintenance>, Arc<SsotStore>, Arc<LifecycleStore>, Arc<PaperExchange>) {
        let ssot = Arc::new(SsotStore::in_memory().unwrap());
        let lifecycle = Arc::new(LifecycleStore::in_memory().unwrap());
        let telemetry = Arc::new(TelemetryLogger::new(&test_config().telemetry_path, "test", "test").unwrap());
        let exchange = PaperExchange::new(SymbolInfo { tick_size: dec!(0.01), qty_step: dec!(0.001), min_qty: dec!(0.001), max_qty: None });
        exchange.set_symbol_info("BTCUSDT", SymbolInfo { tick_size: dec!(0.01), qty_step: dec!(0.001), min_qty: dec!(0.001), max_qty: None });
        exchange.set_balance(dec!(10000));

        let lifecycle_manager = Arc::new(LifecycleManager::new(
            lifecycle.clone(),
            ssot.clone(),
            exchange.clone() as Arc<dyn ExchangeClient>,
            telemetry.clone(),
            test_config(),
        ));
        let maintenance = Arc::new(Maintenance::new(
            ssot.clone(),
            lifecycle.clone(),
            lifecycle_manager,
            exchange.clone() as Arc<dyn ExchangeClient>,
            telemetry,
            test_config(),
        ));
        (maintenance, ssot, lifecycle, exchange)
    }

    fn queued_signal(ssot: &SsotStore) -> i64 {
        let signal = ParsedSignal {
            source: "chan".into(),
            chat_id: "1".into(),
            message_id: "1".into(),
            received_at: Utc::now() - chrono::Duration::days(2),
            raw_text: "test".into(),
            symbol: "BTCUSDT".into(),
            side: Side::Long,
            entry: dec!(100),
            sl: dec!(90),
            tps: vec![dec!(110)],
            kind: crate::models::SignalKind::Swing,
            tick_size: dec!(0.01),
            qty_step: dec!(0.001),
            min_qty: dec!(0.001),
            leverage: Some(dec!(10)),
            dedup_hash: "hash-1".into(),
        };
        ssot.insert_accepted_signal(&signal).unwrap()
    }

    #[tokio::test]
    async fn cleanup_24h_marks_stale_row_with_no_live_position() {
        let (maintenance, ssot, _lifecycle, _exchange) = harness();
        let id = queued_signal(&ssot);
        ssot.mark_queue_row(id, SignalStatus::Claimed, None).unwrap();

        maintenance.cleanup_24h().await.unwrap();

        let row = ssot.get_queue_row(id).unwrap().unwrap();
        assert_eq!(row.status, SignalStatus::Cleaned24h);
    }

    #[tokio::test]
    async fn cleanup_24h_skips_row_with_live_position() {
        let (maintenance, ssot, _lifecycle, exchange) = harness();
        let id = queued_signal(&ssot);
        ssot.mark_queue_row(id, SignalStatus::Claimed, None).unwrap();
        exchange.set_price("BTCUSDT", dec!(100));
        exchange
            .place_market_order(crate::exchange::PlaceMarketOrderRequest {
                symbol: "BTCUSDT".into(),
                side: crate::models::OrderSide::Buy,
                qty: dec!(1),
                reduce_only: false,
                position_side: PositionSide::Long,
            })
            .await
            .unwrap();

        maintenance.cleanup_24h().await.unwrap();

        let row = ssot.get_queue_row(id).unwrap().unwrap();
        assert_eq!(row.status, SignalStatus::Claimed);
    }

    #[tokio::test]
    async fn reconcile_flags_unmapped_position_with_no_matching_signal() {
        let (maintenance, _ssot, _lifecycle, exchange) = harness();
        exchange.set_price("BTCUSDT", dec!(100));
        exchange
            .place_market_order(crate::exchange::PlaceMarketOrderRequest {
                symbol: "BTCUSDT".into(),
                side: crate::models::OrderSide::Buy,
                qty: dec!(1),
                reduce_only: false,
                position_side: PositionSide::Long,
            })
            .await
            .unwrap();

        maintenance.reconcile().await.unwrap();

        let events = maintenance.telemetry.read_all();
        assert!(events.iter().any(|e| e["event_type"] == "UNMAPPED_OPEN_POSITION"));
    }

    #[tokio::test]
    async fn reconcile_reconstructs_missing_position_from_signal() {
        let (maintenance, ssot, lifecycle, exchange) = harness();
        let id = queued_signal(&ssot);
        exchange.set_price("BTCUSDT", dec!(100));
        exchange
            .place_market_order(crate::exchange::PlaceMarketOrderRequest {
                symbol: "BTCUSDT".into(),
                side: crate::models::OrderSide::Buy,
                qty: dec!(1),
                reduce_only: false,
                position_side: PositionSide::Long,
            })
            .await
            .unwrap();
        let _ = id;

        maintenance.reconcile().await.unwrap();

        let position = lifecycle.get_position_by_symbol_side("BTCUSDT", Side::Long).unwrap();
        assert!(position.is_some());
    }
}
