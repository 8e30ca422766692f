//! Stage 5: adverse-move hedge and re-entry. A position that moves far
//! enough against its original signal entry gets a same-size opposite
//! hedge instead of riding its own stop loss; the hedge's own TP/SL decide
//! whether the original side is forced flat for a profit or a loss, and
//! either way a fresh attempt at the same trade is queued behind a
//! symbol/side lock once re-entries run out.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rust_decimal::Decimal;

use crate::config::Config;
use crate::error::BotError;
use crate::exchange::{
    ExchangeClient, PlaceLimitOrderRequest, PlaceMarketOrderRequest, PlaceStopMarketOrderRequest, PositionSide, TimeInForce,
};
use crate::executor::DualLimitExecutor;
use crate::lifecycle::{LifecycleManager, LifecycleStore, PositionUpdate};
use crate::models::{Correlation, HedgeState, Position, PositionStatus, Side, SignalStatus, TpLevel, TpStatus};
use crate::ssot::{QueuedSignal, SsotStore};
use crate::telemetry::TelemetryLogger;

/// What [`HedgeReentryManager::run_reentry_attempts`] should do after one
/// attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReentryOutcome {
    /// Attempt did not complete and the cap isn't reached yet; sleep and
    /// try again.
    Retry,
    /// Succeeded, or the cap/lock/position state says this loop is done.
    Stop,
}

pub struct HedgeReentryManager {
    lifecycle: Arc<LifecycleStore>,
    lifecycle_manager: Arc<LifecycleManager>,
    ssot: Arc<SsotStore>,
    executor: Arc<DualLimitExecutor>,
    exchange: Arc<dyn ExchangeClient>,
    telemetry: Arc<TelemetryLogger>,
    config: Config,
    /// One background retry loop per `ssot_id`, so a tick that observes the
    /// same closed position twice before the loop finishes never spawns a
    /// second one racing it.
    reentry_tasks: Mutex<HashMap<i64, tokio::task::JoinHandle<()>>>,
}

impl HedgeReentryManager {
    pub fn new(
        lifecycle: Arc<LifecycleStore>,
        lifecycle_manager: Arc<LifecycleManager>,
        ssot: Arc<SsotStore>,
        executor: Arc<DualLimitExecutor>,
        exchange: Arc<dyn ExchangeClient>,
        telemetry: Arc<TelemetryLogger>,
        config: Config,
    ) -> Self {
        Self { lifecycle, lifecycle_manager, ssot, executor, exchange, telemetry, config, reentry_tasks: Mutex::new(HashMap::new()) }
    }

    pub async fn run_forever(self: Arc<Self>) {
        let poll = Duration::from_secs(self.config.stage4_poll_interval_seconds);
        loop {
            if let Err(e) = self.clone().tick().await {
                tracing::error!(error = %e, "hedge: tick failed");
            }
            tokio::time::sleep(poll).await;
        }
    }

    pub async fn tick(self: Arc<Self>) -> Result<(), BotError> {
        let positions = self.lifecycle.list_positions_not_closed(1000)?;
        for position in positions {
            let outcome = match position.status {
                PositionStatus::Open if position.is_hedge_armed => self.watch_for_adverse_move(&position).await,
                PositionStatus::HedgeMode => self.clone().watch_hedge_orders(&position).await,
                _ => Ok(()),
            };
            if let Err(e) = outcome {
                tracing::warn!(ssot_id = position.ssot_id, error = %e, "hedge: tick step failed");
            }
        }
        Ok(())
    }

    /// Compares live price against the immutable `signal_entry`, never the
    /// running `avg_entry`, so pyramiding or partial fills never change when
    /// the hedge arms.
    async fn watch_for_adverse_move(&self, position: &Position) -> Result<(), BotError> {
        let ltp = self.exchange.get_current_price(&position.symbol).await.map_err(|e| BotError::ExchangeTransient(e.to_string()))?;
        let alpha = self.config.stage5_adverse_move_pct;
        let triggered = match position.side {
            Side::Long => ltp <= position.signal_entry * (Decimal::ONE - alpha),
            Side::Short => ltp >= position.signal_entry * (Decimal::ONE + alpha),
        };
        if !triggered {
            return Ok(());
        }
        self.open_hedge(position, ltp).await
    }

    async fn open_hedge(&self, position: &Position, ltp: Decimal) -> Result<(), BotError> {
        for order_id in &position.tp_active_order_ids {
            let _ = self.exchange.cancel_order(&position.symbol, order_id).await;
        }
        if let Some(sl_order_id) = &position.sl_order_id {
            let _ = self.exchange.cancel_order(&position.symbol, sl_order_id).await;
        }

        let hedge_side = position.side.opposite();
        let hedge_position_side: PositionSide = hedge_side.into();

        let entry_result = self
            .exchange
            .place_market_order(PlaceMarketOrderRequest {
                symbol: position.symbol.clone(),
                side: hedge_side.entry_order_side(),
                qty: position.remaining_qty,
                reduce_only: false,
                position_side: hedge_position_side,
            })
            .await
            .map_err(|e| BotError::ExchangeTransient(e.to_string()))?;

        let Some(hedge_entry_order_id) = entry_result.order_id else {
            self.telemetry.error(
                "HEDGE_ENTRY_FAILED",
                "hedge",
                "hedge entry market order returned no order id",
                &Correlation { ssot_id: Some(position.ssot_id), position_id: Some(position.ssot_id), ..Default::default() },
                serde_json::json!({"ltp": ltp.to_string()}),
            );
            return Ok(());
        };

        let tp_result = self
            .exchange
            .place_limit_order(PlaceLimitOrderRequest {
                symbol: position.symbol.clone(),
                side: hedge_side.exit_order_side(),
                price: position.signal_sl,
                qty: position.remaining_qty,
                post_only: false,
                time_in_force: TimeInForce::Gtc,
                reduce_only: true,
                position_side: hedge_position_side,
            })
            .await
            .map_err(|e| BotError::ExchangeTransient(e.to_string()))?;

        let sl_result = self
            .exchange
            .place_stop_market_order(PlaceStopMarketOrderRequest {
                symbol: position.symbol.clone(),
                side: hedge_side.exit_order_side(),
                stop_price: position.signal_entry,
                qty: position.remaining_qty,
                reduce_only: true,
                position_side: hedge_position_side,
            })
            .await
            .map_err(|e| BotError::ExchangeTransient(e.to_string()))?;

        if tp_result.order_id.is_none() || sl_result.order_id.is_none() {
            self.telemetry.error(
                "HEDGE_PROTECTION_FAILED",
                "hedge",
                "hedge TP or SL placement returned no order id",
                &Correlation { ssot_id: Some(position.ssot_id), position_id: Some(position.ssot_id), bot_order_id: Some(hedge_entry_order_id.clone()), ..Default::default() },
                serde_json::json!({}),
            );
        }

        self.lifecycle.update_position(
            position.ssot_id,
            &PositionUpdate {
                status: Some(PositionStatus::HedgeMode),
                hedge_state: Some(HedgeState::HedgeMode),
                hedge_entry_order_id: Some(hedge_entry_order_id.clone()),
                hedge_tp_order_id: tp_result.order_id.clone(),
                hedge_sl_order_id: sl_result.order_id.clone(),
                ..Default::default()
            },
        )?;

        self.telemetry.warning(
            "HEDGE_OPENED",
            "hedge",
            "adverse move threshold hit, opened opposite-side hedge",
            &Correlation { ssot_id: Some(position.ssot_id), position_id: Some(position.ssot_id), bot_order_id: Some(hedge_entry_order_id), ..Default::default() },
            serde_json::json!({"ltp": ltp.to_string(), "signal_entry": position.signal_entry.to_string(), "qty": position.remaining_qty.to_string()}),
        );
        Ok(())
    }

    /// In `HEDGE_MODE`, watches the hedge's own TP/SL. Whichever fills first
    /// forces the original side flat and hands the position to the re-entry
    /// loop.
    async fn watch_hedge_orders(self: Arc<Self>, position: &Position) -> Result<(), BotError> {
        let tp_filled = match &position.hedge_tp_order_id {
            Some(order_id) => self.is_filled(&position.symbol, order_id).await?,
            None => false,
        };
        let sl_filled = match &position.hedge_sl_order_id {
            Some(order_id) => self.is_filled(&position.symbol, order_id).await?,
            None => false,
        };

        if !tp_filled && !sl_filled {
            return Ok(());
        }

        if let Some(order_id) = &position.hedge_tp_order_id {
            if sl_filled && !tp_filled {
                let _ = self.exchange.cancel_order(&position.symbol, order_id).await;
            }
        }
        if let Some(order_id) = &position.hedge_sl_order_id {
            if tp_filled && !sl_filled {
                let _ = self.exchange.cancel_order(&position.symbol, order_id).await;
            }
        }

        let result = self
            .exchange
            .place_market_order(PlaceMarketOrderRequest {
                symbol: position.symbol.clone(),
                side: position.side.exit_order_side(),
                qty: position.remaining_qty,
                reduce_only: true,
                position_side: position.side.into(),
            })
            .await
            .map_err(|e| BotError::ExchangeTransient(e.to_string()))?;

        if result.order_id.is_none() {
            self.telemetry.error(
                "HEDGE_FORCED_EXIT_FAILED",
                "hedge",
                "forced exit of original side returned no order id",
                &Correlation { ssot_id: Some(position.ssot_id), position_id: Some(position.ssot_id), ..Default::default() },
                serde_json::json!({"tp_filled": tp_filled, "sl_filled": sl_filled}),
            );
            return Ok(());
        }

        let reason = if tp_filled { "Stage5: Hedge TP -> forced exit" } else { "Stage5: Hedge SL -> forced exit" };
        self.lifecycle_manager.close_position(position.ssot_id, reason).await?;
        self.lifecycle.update_position(
            position.ssot_id,
            &PositionUpdate { reentry_attempts: Some(position.reentry_attempts + 1), ..Default::default() },
        )?;

        Self::spawn_reentry(&self, position.ssot_id, position.symbol.clone(), position.side);
        Ok(())
    }

    /// Spawns the background re-entry retry loop for `ssot_id` unless one
    /// is already running for it. Guards against a later tick observing the
    /// same just-closed position again before the first loop has finished.
    fn spawn_reentry(self_arc: &Arc<Self>, ssot_id: i64, symbol: String, side: Side) {
        let mut tasks = self_arc.reentry_tasks.lock();
        if let Some(existing) = tasks.get(&ssot_id) {
            if !existing.is_finished() {
                return;
            }
        }
        let mgr = self_arc.clone();
        let handle = tokio::spawn(async move { mgr.run_reentry_attempts(ssot_id, symbol, side).await });
        tasks.insert(ssot_id, handle);
    }

    /// Background task per `ssot_id`: retries Stage 2 for the same trade
    /// until it completes, the `(symbol, side)` lock is set at the attempt
    /// cap, or the position/lock state says to stop. Mirrors the original's
    /// `_run_reentry_attempts` `while True` loop, including its fixed
    /// backoff between attempts.
    async fn run_reentry_attempts(self: Arc<Self>, ssot_id: i64, symbol: String, side: Side) {
        loop {
            match self.try_reentry_once(ssot_id, &symbol, side).await {
                Ok(ReentryOutcome::Retry) => {
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    continue;
                }
                Ok(ReentryOutcome::Stop) => return,
                Err(e) => {
                    tracing::error!(ssot_id, error = %e, "hedge: reentry attempt failed");
                    return;
                }
            }
        }
    }

    async fn is_filled(&self, symbol: &str, order_id: &str) -> Result<bool, BotError> {
        let status = self.exchange.get_order_status(symbol, order_id).await.map_err(|e| BotError::ExchangeTransient(e.to_string()))?;
        Ok(status.map(|s| s.status == "FILLED").unwrap_or(false))
    }

    /// One attempt at a fresh entry for a closed position's original trade.
    /// Returns whether the background loop should retry, stop (success,
    /// lock just set, or position/lock already settled), or propagate a
    /// hard error that aborts the loop outright. Locks the `(symbol, side)`
    /// pair once `stage5_max_reentry_attempts` is hit so a later signal for
    /// the same pair is not accepted until someone clears the lock (a
    /// brand-new signal does this on ingestion).
    async fn try_reentry_once(&self, ssot_id: i64, symbol: &str, side: Side) -> Result<ReentryOutcome, BotError> {
        if self.lifecycle.is_stage5_locked(symbol, side)? {
            return Ok(ReentryOutcome::Stop);
        }
        let Some(position) = self.lifecycle.get_position(ssot_id)? else { return Ok(ReentryOutcome::Stop) };
        if position.reentry_attempts >= self.config.stage5_max_reentry_attempts {
            self.lock_out(symbol, side, ssot_id)?;
            return Ok(ReentryOutcome::Stop);
        }

        let Some(symbol_info) = self.exchange.get_symbol_info(symbol).await.map_err(|e| BotError::ExchangeTransient(e.to_string()))? else {
            return Err(BotError::ExchangePermanent(format!("unknown symbol {symbol}")));
        };

        let synthetic = QueuedSignal {
            id: ssot_id,
            source_channel_name: "stage5_reentry".to_string(),
            chat_id: String::new(),
            message_id: format!("reentry-{ssot_id}-{}", position.reentry_attempts),
            received_at_utc: chrono::Utc::now(),
            raw_text: String::new(),
            symbol: symbol.to_string(),
            side,
            entry_price: position.signal_entry,
            sl_price: position.signal_sl,
            tp_prices: Vec::new(),
            signal_type: "FAST".to_string(),
            tick_size: symbol_info.tick_size,
            qty_step: symbol_info.qty_step,
            min_qty: symbol_info.min_qty,
            leverage: position.signal_leverage,
            status: SignalStatus::Claimed,
            locked_by: None,
            stage2_json: None,
            last_error: None,
        };

        self.telemetry.info(
            "STAGE5_REENTRY_ATTEMPT",
            "hedge",
            "attempting re-entry after forced hedge exit",
            &Correlation { ssot_id: Some(ssot_id), position_id: Some(ssot_id), ..Default::default() },
            serde_json::json!({"attempt": position.reentry_attempts + 1}),
        );

        match self.executor.execute(&synthetic).await {
            Ok(SignalStatus::Completed) => {
                self.restore_position(&position).await?;
                Ok(ReentryOutcome::Stop)
            }
            Ok(other) => {
                self.telemetry.warning(
                    "STAGE5_REENTRY_FAILED",
                    "hedge",
                    "re-entry attempt did not complete",
                    &Correlation { ssot_id: Some(ssot_id), position_id: Some(ssot_id), ..Default::default() },
                    serde_json::json!({"status": other.as_str()}),
                );
                let attempts = position.reentry_attempts + 1;
                self.lifecycle.update_position(ssot_id, &PositionUpdate { reentry_attempts: Some(attempts), ..Default::default() })?;
                if attempts >= self.config.stage5_max_reentry_attempts {
                    self.lock_out(symbol, side, ssot_id)?;
                    return Ok(ReentryOutcome::Stop);
                }
                Ok(ReentryOutcome::Retry)
            }
            Err(e) => {
                self.lifecycle.update_position(ssot_id, &PositionUpdate { reentry_attempts: Some(position.reentry_attempts + 1), ..Default::default() })?;
                Err(e)
            }
        }
    }

    /// Sets the `(symbol, side)` Stage-5 lock and emits the one
    /// corresponding telemetry event. Shared by the pre-attempt cap check
    /// and the post-attempt cap check in [`Self::try_reentry_once`].
    fn lock_out(&self, symbol: &str, side: Side, ssot_id: i64) -> Result<(), BotError> {
        self.lifecycle.set_stage5_lock(symbol, side, Some(ssot_id), "max re-entry attempts reached (3)")?;
        self.telemetry.error(
            "STAGE5_LOCKED",
            "hedge",
            "max re-entry attempts reached (3)",
            &Correlation { ssot_id: Some(ssot_id), position_id: Some(ssot_id), ..Default::default() },
            serde_json::json!({"symbol": symbol, "side": side.as_str()}),
        );
        Ok(())
    }

    /// Restores a closed position to `OPEN` from a completed Stage 2
    /// re-entry and re-places its TP/SL. Bypasses the normal
    /// `initialize_from_completed` path, which only ever materializes rows
    /// that have no `stage4_positions` row yet — this one already has one.
    async fn restore_position(&self, position: &Position) -> Result<(), BotError> {
        let Some(row) = self.ssot.get_queue_row(position.ssot_id)? else {
            return Err(BotError::Internal(format!("reentry row {} vanished after completion", position.ssot_id)));
        };
        let state: crate::executor::Stage2State = row
            .stage2_json
            .and_then(|v| serde_json::from_value(v).ok())
            .ok_or_else(|| BotError::Internal("reentry row completed with no stage2 state".into()))?;

        if state.filled_qty.is_zero() {
            return Err(BotError::Internal("reentry completed with zero filled qty".into()));
        }
        let avg_entry = state.filled_notional / state.filled_qty;

        let reset_levels: Vec<TpLevel> = position
            .tp_levels
            .iter()
            .map(|level| TpLevel { index: level.index, price: level.price, status: TpStatus::Open, filled_qty: Decimal::ZERO, order_id: None })
            .collect();

        self.lifecycle.update_position(
            position.ssot_id,
            &PositionUpdate {
                status: Some(PositionStatus::Open),
                planned_qty: Some(state.total_qty),
                remaining_qty: Some(state.filled_qty),
                avg_entry: Some(avg_entry),
                sl_price: Some(position.signal_sl),
                tp_levels: Some(reset_levels),
                is_hedge_armed: Some(true),
                hedge_state: Some(HedgeState::Idle),
                ..Default::default()
            },
        )?;
        self.lifecycle.clear_position_fields(
            position.ssot_id,
            &["hedge_entry_order_id", "hedge_tp_order_id", "hedge_sl_order_id"],
        )?;

        for order_id in &state.original_order_ids {
            self.lifecycle.upsert_order_tracker(position.ssot_id, order_id, crate::models::OrderKind::Entry, None)?;
        }
        if let Some(order_id) = &state.replacement_order_id {
            self.lifecycle.upsert_order_tracker(position.ssot_id, order_id, crate::models::OrderKind::Entry, None)?;
        }

        self.telemetry.info(
            "STAGE5_REENTRY_COMPLETED",
            "hedge",
            "re-entry filled, position restored to open",
            &Correlation { ssot_id: Some(position.ssot_id), position_id: Some(position.ssot_id), ..Default::default() },
            serde_json::json!({"qty": state.filled_qty.to_string(), "avg_entry": avg_entry.to_string()}),
        );

        if let Some(restored) = self.lifecycle.get_position(position.ssot_id)? {
            self.lifecycle_manager.place_initial_protection(&restored).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::paper::PaperExchange;
    use crate::exchange::SymbolInfo;
    use crate::models::OrderSide;
    use rust_decimal_macros::dec;

    /// `timeout_short_secs`/`stage2_poll_interval_seconds` are cut way down
    /// from production values so a re-entry attempt against a never-filled
    /// paper order reaches `Expired` in under a second instead of waiting
    /// out a real 24-hour first-fill timeout.
    fn test_config() -> Config {
        Config {
            ssot_db_path: ":memory:".into(),
            lifecycle_db_path: ":memory:".into(),
            telemetry_path: std::env::temp_dir().join("hedge-test-telemetry.jsonl").to_string_lossy().to_string(),
            risk_per_trade: dec!(0.02),
            initial_margin_plan: dec!(20.00),
            max_leverage: dec!(50),
            min_leverage: dec!(1),
            timeout_short_secs: 2,
            timeout_long_secs: 518400,
            duplicate_ttl_hours: 2,
            lock_ttl_seconds: 300,
            default_signal_type_when_missing: crate::models::SignalKind::Swing,
            per_channel_default_type: Default::default(),
            stage2_default_spread_pct: dec!(0.001),
            stage2_max_price_shifts: 50,
            stage2_poll_interval_seconds: 1,
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

    fn harness() -> (Arc<HedgeReentryManager>, Arc<LifecycleStore>, Arc<SsotStore>, Arc<PaperExchange>) {
        let lifecycle = Arc::new(LifecycleStore::in_memory().unwrap());
        let ssot = Arc::new(SsotStore::in_memory().unwrap());
        let telemetry = Arc::new(TelemetryLogger::new(&test_config().telemetry_path, "test", "test").unwrap());
        let exchange = PaperExchange::new(SymbolInfo { tick_size: dec!(0.01), qty_step: dec!(0.001), min_qty: dec!(0.001), max_qty: None });
        exchange.set_symbol_info("BTCUSDT", SymbolInfo { tick_size: dec!(0.01), qty_step: dec!(0.001), min_qty: dec!(0.001), max_qty: None });
        exchange.set_balance(dec!(10000));
        exchange.set_price("BTCUSDT", dec!(100));

        let lifecycle_manager = Arc::new(LifecycleManager::new(
            lifecycle.clone(),
            ssot.clone(),
            exchange.clone() as Arc<dyn ExchangeClient>,
            telemetry.clone(),
            test_config(),
        ));
        let executor = Arc::new(DualLimitExecutor::new(
            ssot.clone(),
            exchange.clone() as Arc<dyn ExchangeClient>,
            telemetry.clone(),
            test_config(),
            "test-worker".to_string(),
        ));
        let mgr = Arc::new(HedgeReentryManager::new(
            lifecycle.clone(),
            lifecycle_manager,
            ssot.clone(),
            executor,
            exchange.clone() as Arc<dyn ExchangeClient>,
            telemetry,
            test_config(),
        ));
        (mgr, lifecycle, ssot, exchange)
    }

    fn sample_position(lifecycle: &LifecycleStore) -> Position {
        let levels = vec![TpLevel { index: 0, price: dec!(110), status: TpStatus::Open, filled_qty: Decimal::ZERO, order_id: None }];
        lifecycle
            .create_position_if_absent(1, "BTCUSDT", Side::Long, PositionStatus::Open, dec!(4.021), dec!(4.021), dec!(100), dec!(98), dec!(100), dec!(98), Some(dec!(10)), &levels)
            .unwrap();
        lifecycle.get_position(1).unwrap().unwrap()
    }

    #[tokio::test]
    async fn adverse_move_opens_opposite_side_hedge() {
        let (mgr, lifecycle, _ssot, exchange) = harness();
        let position = sample_position(&lifecycle);
        exchange.set_price("BTCUSDT", dec!(98.00));

        mgr.watch_for_adverse_move(&position).await.unwrap();

        let updated = lifecycle.get_position(1).unwrap().unwrap();
        assert_eq!(updated.status, PositionStatus::HedgeMode);
        assert_eq!(updated.hedge_state, HedgeState::HedgeMode);
        assert!(updated.hedge_entry_order_id.is_some());
        assert!(updated.hedge_tp_order_id.is_some());
        assert!(updated.hedge_sl_order_id.is_some());

        let live = exchange.get_positions(Some("BTCUSDT")).await.unwrap();
        let short_leg = live.iter().find(|p| p.position_side == PositionSide::Short).unwrap();
        assert_eq!(short_leg.position_amt, dec!(4.021));
    }

    #[tokio::test]
    async fn no_trigger_when_move_is_within_threshold() {
        let (mgr, lifecycle, _ssot, exchange) = harness();
        let position = sample_position(&lifecycle);
        exchange.set_price("BTCUSDT", dec!(99));

        mgr.watch_for_adverse_move(&position).await.unwrap();

        let updated = lifecycle.get_position(1).unwrap().unwrap();
        assert_eq!(updated.status, PositionStatus::Open);
    }

    #[tokio::test]
    async fn max_attempts_sets_stage5_lock() {
        let (mgr, lifecycle, _ssot, _exchange) = harness();
        let mut position = sample_position(&lifecycle);
        position.reentry_attempts = 3;
        lifecycle
            .update_position(1, &PositionUpdate { reentry_attempts: Some(3), status: Some(PositionStatus::Closed), ..Default::default() })
            .unwrap();

        let outcome = mgr.try_reentry_once(1, "BTCUSDT", Side::Long).await.unwrap();

        assert_eq!(outcome, ReentryOutcome::Stop);
        assert!(lifecycle.is_stage5_locked("BTCUSDT", Side::Long).unwrap());
    }

    #[tokio::test]
    async fn reentry_below_cap_does_not_lock() {
        let (mgr, lifecycle, ssot, exchange) = harness();
        let mut levels_position = sample_position(&lifecycle);
        levels_position.reentry_attempts = 1;
        lifecycle
            .update_position(1, &PositionUpdate { reentry_attempts: Some(1), status: Some(PositionStatus::Closed), ..Default::default() })
            .unwrap();
        // Executor re-entry needs a live ssot_queue row with id=1 to update.
        let _ = ssot;
        exchange.set_price("BTCUSDT", dec!(100));

        mgr.try_reentry_once(1, "BTCUSDT", Side::Long).await.unwrap();

        assert!(!lifecycle.is_stage5_locked("BTCUSDT", Side::Long).unwrap());
    }

    #[tokio::test]
    async fn repeated_failed_attempts_reach_the_cap_and_lock() {
        // Regression test: a single failed re-entry attempt used to bump
        // `reentry_attempts` and then be abandoned, since the position was
        // already CLOSED and `tick()` never revisits it. Driving
        // `try_reentry_once` repeatedly (what the background retry loop
        // does) must actually reach attempt 2 and 3 and set the lock,
        // rather than stalling after attempt 1.
        let (mgr, lifecycle, ssot, exchange) = harness();
        sample_position(&lifecycle);
        lifecycle
            .update_position(1, &PositionUpdate { reentry_attempts: Some(0), status: Some(PositionStatus::Closed), ..Default::default() })
            .unwrap();
        let _ = ssot;
        exchange.set_price("BTCUSDT", dec!(100));

        let mut last_outcome = ReentryOutcome::Retry;
        for _ in 0..3 {
            last_outcome = mgr.try_reentry_once(1, "BTCUSDT", Side::Long).await.unwrap();
            if last_outcome == ReentryOutcome::Stop {
                break;
            }
        }

        assert_eq!(last_outcome, ReentryOutcome::Stop);
        assert_eq!(lifecycle.get_position(1).unwrap().unwrap().reentry_attempts, 3);
        assert!(lifecycle.is_stage5_locked("BTCUSDT", Side::Long).unwrap());
    }

    #[test]
    fn order_side_helpers_mirror_exit_direction() {
        assert_eq!(Side::Long.opposite().exit_order_side(), OrderSide::Buy);
        assert_eq!(Side::Short.opposite().exit_order_side(), OrderSide::Sell);
    }
}
