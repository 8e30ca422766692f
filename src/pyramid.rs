//! Stage 4.5: PnL-threshold position scaling. Adds to an already-open,
//! already-protected position in two fixed steps as it moves favorably,
//! capped at a hard multiple of the originally planned size.
//!
//! Scaling never touches the TP ladder or SL placed by Stage 4 — added size
//! rides under the existing protection until the next Stage 4 reconcile,
//! matching the source system's behavior (see the Open Question decision in
//! `DESIGN.md`).

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;

use crate::config::Config;
use crate::decimal_ext::quantize_qty;
use crate::error::BotError;
use crate::exchange::{ExchangeClient, ExchangePosition, PlaceMarketOrderRequest, PositionSide};
use crate::lifecycle::{LifecycleStore, PositionUpdate};
use crate::models::{Correlation, OrderKind, Position, PositionStatus};
use crate::telemetry::TelemetryLogger;

pub struct PyramidManager {
    lifecycle: Arc<LifecycleStore>,
    exchange: Arc<dyn ExchangeClient>,
    telemetry: Arc<TelemetryLogger>,
    config: Config,
}

impl PyramidManager {
    pub fn new(lifecycle: Arc<LifecycleStore>, exchange: Arc<dyn ExchangeClient>, telemetry: Arc<TelemetryLogger>, config: Config) -> Self {
        Self { lifecycle, exchange, telemetry, config }
    }

    pub async fn run_forever(self: Arc<Self>) {
        let poll = Duration::from_secs(self.config.pyramid_poll_interval_seconds);
        loop {
            if let Err(e) = self.tick().await {
                tracing::error!(error = %e, "pyramid: tick failed");
            }
            tokio::time::sleep(poll).await;
        }
    }

    pub async fn tick(&self) -> Result<(), BotError> {
        let positions = self.lifecycle.list_open_positions(1000)?;
        for position in positions {
            if let Err(e) = self.check_position(&position).await {
                tracing::warn!(ssot_id = position.ssot_id, error = %e, "pyramid: check_position failed");
            }
        }
        Ok(())
    }

    async fn check_position(&self, position: &Position) -> Result<(), BotError> {
        if position.status != PositionStatus::Open || position.planned_qty.is_zero() {
            return Ok(());
        }
        let live = self
            .exchange
            .get_positions(Some(position.symbol.as_str()))
            .await
            .map_err(|e| BotError::ExchangeTransient(e.to_string()))?;
        let position_side: PositionSide = position.side.into();
        let Some(live) = live.into_iter().find(|p| p.position_side == position_side) else {
            return Ok(());
        };
        if live.position_amt.is_zero() {
            return Ok(());
        }

        let pnl_pct = roi_pct(&live);
        let mut state = position.pyramid_state.clone();

        if !state.scale_1_done && pnl_pct >= self.config.pyramid_profit_threshold_1 {
            if self.add_scale(position, &live, self.config.pyramid_add_size_1, 1).await? {
                state.scale_1_done = true;
                state.scale_1_at = Some(chrono::Utc::now());
                self.lifecycle.update_position(position.ssot_id, &PositionUpdate { pyramid_state: Some(state.clone()), ..Default::default() })?;
            }
        }

        if state.scale_1_done && !state.scale_2_done && pnl_pct >= self.config.pyramid_profit_threshold_2 {
            if self.add_scale(position, &live, self.config.pyramid_add_size_2, 2).await? {
                state.scale_2_done = true;
                state.scale_2_at = Some(chrono::Utc::now());
                self.lifecycle.update_position(position.ssot_id, &PositionUpdate { pyramid_state: Some(state), ..Default::default() })?;
            }
        }

        Ok(())
    }

    /// Place a market add order sized `add_pct * planned_qty`, refusing the
    /// add if it would push the live position size past
    /// `pyramid_max_size_multiplier * planned_qty`. Returns `true` if an
    /// order was placed.
    async fn add_scale(&self, position: &Position, live: &ExchangePosition, add_pct: Decimal, step: u32) -> Result<bool, BotError> {
        let Some(info) = self.exchange.get_symbol_info(&position.symbol).await.map_err(|e| BotError::ExchangeTransient(e.to_string()))? else {
            return Err(BotError::ExchangePermanent(format!("unknown symbol {}", position.symbol)));
        };

        let raw_qty = position.planned_qty * add_pct;
        let add_qty = quantize_qty(raw_qty, info.qty_step, info.min_qty);
        if add_qty.is_zero() {
            return Ok(false);
        }

        let cap = position.planned_qty * self.config.pyramid_max_size_multiplier;
        if live.position_amt + add_qty > cap {
            self.telemetry.warning(
                "PYRAMID_CAP_REACHED",
                "pyramid",
                "scaling add would exceed the hard size cap, skipping",
                &Correlation { ssot_id: Some(position.ssot_id), position_id: Some(position.ssot_id), ..Default::default() },
                serde_json::json!({"step": step, "live_qty": live.position_amt.to_string(), "add_qty": add_qty.to_string(), "cap": cap.to_string()}),
            );
            return Ok(false);
        }

        let result = self
            .exchange
            .place_market_order(PlaceMarketOrderRequest {
                symbol: position.symbol.clone(),
                side: position.side.entry_order_side(),
                qty: add_qty,
                reduce_only: false,
                position_side: position.side.into(),
            })
            .await
            .map_err(|e| BotError::ExchangeTransient(e.to_string()))?;

        let Some(order_id) = result.order_id else {
            self.telemetry.error(
                "PYRAMID_ADD_FAILED",
                "pyramid",
                "scale-add market order returned no order id",
                &Correlation { ssot_id: Some(position.ssot_id), position_id: Some(position.ssot_id), ..Default::default() },
                serde_json::json!({"step": step}),
            );
            return Ok(false);
        };

        self.lifecycle.upsert_order_tracker(position.ssot_id, &order_id, OrderKind::Pyramid, None)?;
        self.telemetry.info(
            "PYRAMID_SCALED",
            "pyramid",
            "added to position on favorable PnL threshold",
            &Correlation { ssot_id: Some(position.ssot_id), position_id: Some(position.ssot_id), bot_order_id: Some(order_id), ..Default::default() },
            serde_json::json!({"step": step, "add_qty": add_qty.to_string()}),
        );
        Ok(true)
    }
}

/// ROI on margin, in percent: `unrealized_pnl / position_initial_margin * 100`.
fn roi_pct(position: &ExchangePosition) -> Decimal {
    if position.position_initial_margin.is_zero() {
        return Decimal::ZERO;
    }
    (position.unrealized_pnl / position.position_initial_margin) * Decimal::from(100)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::paper::PaperExchange;
    use crate::exchange::SymbolInfo;
    use crate::models::{Side, TpLevel, TpStatus};
    use rust_decimal_macros::dec;

    fn test_config() -> Config {
        Config {
            ssot_db_path: ":memory:".into(),
            lifecycle_db_path: ":memory:".into(),
            telemetry_path: std::env::temp_dir().join("pyramid-test-telemetry.jsonl").to_string_lossy().to_string(),
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

    fn harness() -> (PyramidManager, Arc<LifecycleStore>, Arc<PaperExchange>) {
        let lifecycle = Arc::new(LifecycleStore::in_memory().unwrap());
        let telemetry = Arc::new(TelemetryLogger::new(&test_config().telemetry_path, "test", "test").unwrap());
        let exchange = PaperExchange::new(SymbolInfo { tick_size: dec!(0.01), qty_step: dec!(0.001), min_qty: dec!(0.001), max_qty: None });
        let mgr = PyramidManager::new(lifecycle.clone(), exchange.clone() as Arc<dyn ExchangeClient>, telemetry, test_config());
        (mgr, lifecycle, exchange)
    }

    fn sample_position(lifecycle: &LifecycleStore) -> Position {
        let levels = vec![TpLevel { index: 0, price: dec!(110), status: TpStatus::Open, filled_qty: Decimal::ZERO, order_id: None }];
        lifecycle
            .create_position_if_absent(1, "BTCUSDT", Side::Long, PositionStatus::Open, dec!(1), dec!(1), dec!(100), dec!(90), dec!(100), dec!(90), Some(dec!(10)), &levels)
            .unwrap();
        lifecycle.get_position(1).unwrap().unwrap()
    }

    #[tokio::test]
    async fn scale_1_triggers_at_threshold_and_tracks_order() {
        let (mgr, lifecycle, exchange) = harness();
        let position = sample_position(&lifecycle);
        exchange.set_price("BTCUSDT", dec!(100));
        exchange
            .place_market_order(PlaceMarketOrderRequest { symbol: "BTCUSDT".into(), side: crate::models::OrderSide::Buy, qty: dec!(1), reduce_only: false, position_side: PositionSide::Long })
            .await
            .unwrap();

        let mut live = exchange.get_positions(Some("BTCUSDT")).await.unwrap();
        assert_eq!(live.len(), 1);
        // Synthesize a 5% ROI on margin so threshold 1 (3%) fires.
        live[0].position_initial_margin = dec!(20);
        live[0].unrealized_pnl = dec!(1);
        assert!(roi_pct(&live[0]) >= dec!(3));

        mgr.add_scale(&position, &live[0], mgr.config.pyramid_add_size_1, 1).await.unwrap();
        let tracked = lifecycle.list_tracked_orders_for_ssot_id(1).unwrap();
        assert_eq!(tracked.len(), 1);
        assert_eq!(tracked[0].kind, OrderKind::Pyramid);
    }

    #[tokio::test]
    async fn add_scale_refuses_past_hard_cap() {
        let (mgr, lifecycle, _exchange) = harness();
        let position = sample_position(&lifecycle);
        let live = ExchangePosition {
            symbol: "BTCUSDT".into(),
            position_side: PositionSide::Long,
            position_amt: dec!(2.0), // already at 2x planned_qty cap
            avg_price: dec!(100),
            realized_pnl: Decimal::ZERO,
            unrealized_pnl: dec!(5),
            position_initial_margin: dec!(20),
            leverage: dec!(10),
        };
        let placed = mgr.add_scale(&position, &live, mgr.config.pyramid_add_size_1, 1).await.unwrap();
        assert!(!placed);
        let tracked = lifecycle.list_tracked_orders_for_ssot_id(1).unwrap();
        assert!(tracked.is_empty());
    }
}
