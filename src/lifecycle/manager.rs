//! Stage 4: position lifecycle management. Places the TP ladder and SL once
//! a Stage 2 row completes, applies fills from either transport through one
//! idempotent entry point, and runs a REST reconcile sweep as the safety net
//! under the WS stream.
//!
//! The one invariant every method here respects: Stage 4 never mutates
//! protective orders on a position in `HEDGE_MODE` — that position belongs
//! to Stage 5 until it closes or restores.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rust_decimal::Decimal;

use crate::config::Config;
use crate::error::BotError;
use crate::exchange::{
    ExchangeClient, PlaceLimitOrderRequest, PlaceStopMarketOrderRequest, PositionSide, TimeInForce, WsEvent,
};
use crate::executor::Stage2State;
use crate::models::{Correlation, OrderKind, Position, PositionStatus, Side, TpLevel, TpStatus};
use crate::ssot::SsotStore;
use crate::telemetry::TelemetryLogger;

use super::store::{LifecycleStore, PositionUpdate, Stage2CompletedRow};

pub struct LifecycleManager {
    lifecycle: Arc<LifecycleStore>,
    ssot: Arc<SsotStore>,
    exchange: Arc<dyn ExchangeClient>,
    telemetry: Arc<TelemetryLogger>,
    config: Config,
    last_seq: Mutex<HashMap<String, u64>>,
}

impl LifecycleManager {
    pub fn new(
        lifecycle: Arc<LifecycleStore>,
        ssot: Arc<SsotStore>,
        exchange: Arc<dyn ExchangeClient>,
        telemetry: Arc<TelemetryLogger>,
        config: Config,
    ) -> Self {
        Self { lifecycle, ssot, exchange, telemetry, config, last_seq: Mutex::new(HashMap::new()) }
    }

    pub async fn run_forever(self: Arc<Self>) {
        let ws_mgr = self.clone();
        tokio::spawn(async move { ws_mgr.ws_consume_forever().await });

        let poll = Duration::from_secs(self.config.stage4_poll_interval_seconds);
        loop {
            if let Err(e) = self.initialize_from_completed(50).await {
                tracing::error!(error = %e, "stage4: initialize_from_completed failed");
            }
            if let Err(e) = self.reconcile().await {
                tracing::error!(error = %e, "stage4: reconcile failed");
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Turn every newly `COMPLETED` Stage 2 row with no Stage 4 row yet into
    /// a tracked position with its initial TP ladder and SL placed.
    pub async fn initialize_from_completed(&self, limit: i64) -> Result<usize, BotError> {
        let rows = self.lifecycle.list_new_stage2_completed(limit)?;
        let mut created = 0;
        for row in rows {
            if self.initialize_one(&row).await? {
                created += 1;
            }
        }
        Ok(created)
    }

    async fn initialize_one(&self, row: &Stage2CompletedRow) -> Result<bool, BotError> {
        let state: Stage2State = row
            .stage2_json
            .clone()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();

        let filled_qty = state.filled_qty;
        let avg_entry = if filled_qty.is_zero() { row.entry_price } else { state.filled_notional / filled_qty };

        let tp_levels: Vec<TpLevel> = row
            .tp_prices
            .iter()
            .enumerate()
            .map(|(index, price)| TpLevel { index, price: *price, status: TpStatus::Open, filled_qty: Decimal::ZERO, order_id: None })
            .collect();

        let inserted = self.lifecycle.create_position_if_absent(
            row.ssot_id,
            &row.symbol,
            row.side,
            PositionStatus::Open,
            state.total_qty,
            filled_qty,
            avg_entry,
            row.sl_price,
            row.entry_price,
            row.sl_price,
            Some(state.leverage),
            &tp_levels,
        )?;

        if !inserted {
            return Ok(false);
        }

        for order_id in &state.original_order_ids {
            self.lifecycle.upsert_order_tracker(row.ssot_id, order_id, OrderKind::Entry, None)?;
        }
        if let Some(order_id) = &state.replacement_order_id {
            self.lifecycle.upsert_order_tracker(row.ssot_id, order_id, OrderKind::Entry, None)?;
        }

        self.telemetry.info(
            "POSITION_CREATED",
            "lifecycle",
            "position tracked after Stage 2 completion",
            &Correlation { ssot_id: Some(row.ssot_id), position_id: Some(row.ssot_id), ..Default::default() },
            serde_json::json!({"symbol": row.symbol, "side": row.side.as_str(), "filled_qty": filled_qty.to_string(), "avg_entry": avg_entry.to_string()}),
        );

        if let Some(position) = self.lifecycle.get_position(row.ssot_id)? {
            self.place_initial_protection(&position).await?;
        }
        Ok(true)
    }

    /// Place the TP ladder and SL for a freshly tracked (or freshly
    /// restored) position. Safe to call again on an already-protected
    /// position — it will simply place a second, redundant set of orders,
    /// so callers only invoke it right after `initialize_one` or a Stage 5
    /// restore.
    pub async fn place_initial_protection(&self, position: &Position) -> Result<(), BotError> {
        self.place_tp_ladder(position).await?;
        self.place_sl(position).await?;
        Ok(())
    }

    async fn place_tp_ladder(&self, position: &Position) -> Result<(), BotError> {
        if position.tp_levels.is_empty() || position.remaining_qty.is_zero() {
            return Ok(());
        }
        let Some(info) = self.exchange.get_symbol_info(&position.symbol).await.map_err(to_transient)? else {
            return Err(BotError::ExchangePermanent(format!("unknown symbol {}", position.symbol)));
        };

        let n = position.tp_levels.len();
        let per_level = crate::decimal_ext::quantize_qty(position.remaining_qty / Decimal::from(n), info.qty_step, info.min_qty);
        let mut allocated = Decimal::ZERO;
        let mut order_ids = Vec::new();

        for (i, level) in position.tp_levels.iter().enumerate() {
            let qty = if i + 1 == n { position.remaining_qty - allocated } else { per_level };
            if qty <= Decimal::ZERO {
                continue;
            }
            allocated += qty;

            let result = self
                .exchange
                .place_limit_order(PlaceLimitOrderRequest {
                    symbol: position.symbol.clone(),
                    side: position.side.exit_order_side(),
                    price: level.price,
                    qty,
                    post_only: false,
                    time_in_force: TimeInForce::Gtc,
                    reduce_only: true,
                    position_side: position.side.into(),
                })
                .await
                .map_err(to_transient)?;

            if let Some(order_id) = &result.order_id {
                self.lifecycle.upsert_order_tracker(position.ssot_id, order_id, OrderKind::Tp, Some(i))?;
                order_ids.push(order_id.clone());
            } else {
                tracing::warn!(ssot_id = position.ssot_id, level = i, "stage4: TP order placement returned no order id");
            }
        }

        self.lifecycle.update_position(
            position.ssot_id,
            &PositionUpdate { tp_active_order_ids: Some(order_ids), ..Default::default() },
        )
    }

    async fn place_sl(&self, position: &Position) -> Result<(), BotError> {
        if position.remaining_qty.is_zero() {
            return Ok(());
        }
        let ltp = self.exchange.get_current_price(&position.symbol).await.map_err(to_transient)?;
        let guard_ok = match position.side {
            Side::Long => position.sl_price < ltp,
            Side::Short => position.sl_price > ltp,
        };
        if !guard_ok {
            self.flag_needs_manual_protection(position, "SL placement guard violated: SL is on the wrong side of last traded price").await?;
            return Ok(());
        }

        let result = self
            .exchange
            .place_stop_market_order(PlaceStopMarketOrderRequest {
                symbol: position.symbol.clone(),
                side: position.side.exit_order_side(),
                stop_price: position.sl_price,
                qty: position.remaining_qty,
                reduce_only: true,
                position_side: position.side.into(),
            })
            .await
            .map_err(to_transient)?;

        match &result.order_id {
            Some(order_id) => {
                self.lifecycle.upsert_order_tracker(position.ssot_id, order_id, OrderKind::Sl, None)?;
                self.lifecycle.update_position(
                    position.ssot_id,
                    &PositionUpdate { sl_order_id: Some(order_id.clone()), ..Default::default() },
                )?;
            }
            None => {
                self.flag_needs_manual_protection(position, "SL order placement returned no order id").await?;
            }
        }
        Ok(())
    }

    async fn flag_needs_manual_protection(&self, position: &Position, reason: &str) -> Result<(), BotError> {
        let already_flagged = position.status == PositionStatus::NeedsManualProtection;
        self.lifecycle.update_position(
            position.ssot_id,
            &PositionUpdate { status: Some(PositionStatus::NeedsManualProtection), ..Default::default() },
        )?;
        if !already_flagged {
            self.telemetry.error(
                "NEEDS_MANUAL_PROTECTION",
                "lifecycle",
                reason,
                &Correlation { ssot_id: Some(position.ssot_id), position_id: Some(position.ssot_id), ..Default::default() },
                serde_json::json!({"symbol": position.symbol, "side": position.side.as_str()}),
            );
        }
        Ok(())
    }

    /// The single entry point both the WS consumer and the REST reconcile
    /// sweep call to apply a fill. Idempotent on `(order_id, exec_id)`: a
    /// second delivery of the same execution (WS replay after reconnect, or
    /// reconcile re-observing a fill the WS already delivered) is a no-op.
    #[allow(clippy::too_many_arguments)]
    pub async fn apply_fill(
        &self,
        ssot_id: i64,
        order_id: &str,
        exec_id: &str,
        kind: OrderKind,
        level_index: Option<usize>,
        executed_qty: Decimal,
        last_fill_qty: Decimal,
        avg_price: Option<Decimal>,
        status: &str,
    ) -> Result<(), BotError> {
        if let Some(tracker) = self.lifecycle.get_order_tracker(order_id)? {
            if executed_qty < tracker.last_executed_qty {
                // A reconnect replay delivering a stale snapshot; ignore.
                return Ok(());
            }
        }
        self.lifecycle.update_order_tracker(order_id, executed_qty, status)?;

        if last_fill_qty <= Decimal::ZERO {
            return Ok(());
        }
        if !self.lifecycle.record_execution_if_new(order_id, exec_id, Some(ssot_id), last_fill_qty)? {
            return Ok(());
        }

        let Some(position) = self.lifecycle.get_position(ssot_id)? else { return Ok(()) };
        if position.status == PositionStatus::HedgeMode {
            return Ok(());
        }

        match kind {
            OrderKind::Entry => Ok(()),
            OrderKind::Tp => self.apply_tp_fill(&position, level_index, last_fill_qty, avg_price, status).await,
            OrderKind::Sl => self.apply_sl_fill(&position, last_fill_qty, avg_price, status).await,
            OrderKind::Pyramid => Ok(()),
        }
    }

    async fn apply_tp_fill(
        &self,
        position: &Position,
        level_index: Option<usize>,
        fill_qty: Decimal,
        avg_price: Option<Decimal>,
        status: &str,
    ) -> Result<(), BotError> {
        let Some(idx) = level_index else {
            return Err(BotError::Internal("TP fill event missing level_index".into()));
        };
        let mut levels = position.tp_levels.clone();
        let Some(level) = levels.get_mut(idx) else {
            return Err(BotError::Internal(format!("TP fill referenced unknown level {idx}")));
        };

        let exit_price = avg_price.unwrap_or(level.price);
        level.filled_qty += fill_qty;
        level.status = if status == "FILLED" { TpStatus::Completed } else { TpStatus::Partial };

        let pnl_per_unit = match position.side {
            Side::Long => exit_price - position.avg_entry,
            Side::Short => position.avg_entry - exit_price,
        };
        let new_remaining = (position.remaining_qty - fill_qty).max(Decimal::ZERO);
        let new_realized = position.realized_pnl + pnl_per_unit * fill_qty;

        self.lifecycle.update_position(
            position.ssot_id,
            &PositionUpdate {
                tp_levels: Some(levels),
                remaining_qty: Some(new_remaining),
                realized_pnl: Some(new_realized),
                ..Default::default()
            },
        )?;

        self.telemetry.info(
            "TP_FILLED",
            "lifecycle",
            "take-profit level filled",
            &Correlation { ssot_id: Some(position.ssot_id), position_id: Some(position.ssot_id), ..Default::default() },
            serde_json::json!({"level_index": idx, "fill_qty": fill_qty.to_string(), "status": status}),
        );

        if idx == 0 && self.config.stage4_move_sl_to_be_after_tp1 {
            self.move_sl_to_be(position.ssot_id).await?;
        }
        if self.config.stage4_trailing_enable && idx >= self.config.stage4_trailing_after_tp_index {
            self.trailing_sl(position.ssot_id).await?;
        }

        if new_remaining.is_zero() {
            self.close_position(position.ssot_id, "Position qty exhausted").await?;
        }
        Ok(())
    }

    async fn apply_sl_fill(
        &self,
        position: &Position,
        fill_qty: Decimal,
        avg_price: Option<Decimal>,
        status: &str,
    ) -> Result<(), BotError> {
        let exit_price = avg_price.unwrap_or(position.sl_price);
        let pnl_per_unit = match position.side {
            Side::Long => exit_price - position.avg_entry,
            Side::Short => position.avg_entry - exit_price,
        };
        let new_remaining = (position.remaining_qty - fill_qty).max(Decimal::ZERO);
        let new_realized = position.realized_pnl + pnl_per_unit * fill_qty;

        self.lifecycle.update_position(
            position.ssot_id,
            &PositionUpdate { remaining_qty: Some(new_remaining), realized_pnl: Some(new_realized), ..Default::default() },
        )?;

        self.telemetry.info(
            "SL_FILLED",
            "lifecycle",
            "stop loss filled",
            &Correlation { ssot_id: Some(position.ssot_id), position_id: Some(position.ssot_id), ..Default::default() },
            serde_json::json!({"fill_qty": fill_qty.to_string(), "status": status}),
        );

        if status == "FILLED" || new_remaining.is_zero() {
            self.close_position(position.ssot_id, "SL filled").await?;
        }
        Ok(())
    }

    /// Move the SL to break-even (the position's `avg_entry`). Cancels the
    /// previous SL order best-effort before placing the replacement.
    pub async fn move_sl_to_be(&self, ssot_id: i64) -> Result<(), BotError> {
        let Some(position) = self.lifecycle.get_position(ssot_id)? else { return Ok(()) };
        if position.status == PositionStatus::Closed || position.status == PositionStatus::HedgeMode || position.remaining_qty.is_zero() {
            return Ok(());
        }
        if let Some(old_sl) = &position.sl_order_id {
            let _ = self.exchange.cancel_order(&position.symbol, old_sl).await;
        }

        let result = self
            .exchange
            .place_stop_market_order(PlaceStopMarketOrderRequest {
                symbol: position.symbol.clone(),
                side: position.side.exit_order_side(),
                stop_price: position.avg_entry,
                qty: position.remaining_qty,
                reduce_only: true,
                position_side: position.side.into(),
            })
            .await
            .map_err(to_transient)?;

        if let Some(order_id) = &result.order_id {
            self.lifecycle.upsert_order_tracker(ssot_id, order_id, OrderKind::Sl, None)?;
            self.lifecycle.update_position(
                ssot_id,
                &PositionUpdate { sl_price: Some(position.avg_entry), sl_order_id: Some(order_id.clone()), ..Default::default() },
            )?;
            self.telemetry.info(
                "SL_MOVED_BE",
                "lifecycle",
                "stop loss moved to break-even after first take-profit",
                &Correlation { ssot_id: Some(ssot_id), position_id: Some(ssot_id), ..Default::default() },
                serde_json::json!({"be_price": position.avg_entry.to_string()}),
            );
        } else {
            self.flag_needs_manual_protection(&position, "SL move-to-BE placement returned no order id").await?;
        }
        Ok(())
    }

    /// Trail the SL behind last traded price by the configured offset, only
    /// ever moving it in the position's favorable direction.
    pub async fn trailing_sl(&self, ssot_id: i64) -> Result<(), BotError> {
        let Some(position) = self.lifecycle.get_position(ssot_id)? else { return Ok(()) };
        if position.status == PositionStatus::Closed || position.status == PositionStatus::HedgeMode || position.remaining_qty.is_zero() {
            return Ok(());
        }
        let ltp = self.exchange.get_current_price(&position.symbol).await.map_err(to_transient)?;
        let offset = self.config.stage4_trailing_offset_pct;
        let candidate = match position.side {
            Side::Long => ltp * (Decimal::ONE - offset),
            Side::Short => ltp * (Decimal::ONE + offset),
        };
        let improves = match position.side {
            Side::Long => candidate > position.sl_price,
            Side::Short => candidate < position.sl_price,
        };
        if !improves {
            return Ok(());
        }

        if let Some(old_sl) = &position.sl_order_id {
            let _ = self.exchange.cancel_order(&position.symbol, old_sl).await;
        }

        for attempt in 0..3 {
            let result = self
                .exchange
                .place_stop_market_order(PlaceStopMarketOrderRequest {
                    symbol: position.symbol.clone(),
                    side: position.side.exit_order_side(),
                    stop_price: candidate,
                    qty: position.remaining_qty,
                    reduce_only: true,
                    position_side: position.side.into(),
                })
                .await
                .map_err(to_transient);

            match result {
                Ok(r) if r.order_id.is_some() => {
                    let order_id = r.order_id.unwrap();
                    self.lifecycle.upsert_order_tracker(ssot_id, &order_id, OrderKind::Sl, None)?;
                    self.lifecycle.update_position(
                        ssot_id,
                        &PositionUpdate { sl_price: Some(candidate), sl_order_id: Some(order_id), ..Default::default() },
                    )?;
                    self.telemetry.info(
                        "SL_TRAILED",
                        "lifecycle",
                        "trailing stop advanced",
                        &Correlation { ssot_id: Some(ssot_id), position_id: Some(ssot_id), ..Default::default() },
                        serde_json::json!({"new_sl": candidate.to_string(), "attempt": attempt}),
                    );
                    return Ok(());
                }
                _ => tokio::time::sleep(Duration::from_millis(50)).await,
            }
        }

        self.flag_needs_manual_protection(&position, "trailing SL replacement failed after 3 attempts").await
    }

    /// Cancel remaining protective orders best-effort and mark the position
    /// `CLOSED`. Called whenever `remaining_qty` reaches zero or an SL
    /// terminally fills.
    pub async fn close_position(&self, ssot_id: i64, reason: &str) -> Result<(), BotError> {
        let Some(position) = self.lifecycle.get_position(ssot_id)? else { return Ok(()) };
        if position.status == PositionStatus::Closed {
            return Ok(());
        }

        for order_id in &position.tp_active_order_ids {
            let _ = self.exchange.cancel_order(&position.symbol, order_id).await;
        }
        if let Some(sl_order_id) = &position.sl_order_id {
            let _ = self.exchange.cancel_order(&position.symbol, sl_order_id).await;
        }

        self.lifecycle.update_position(
            ssot_id,
            &PositionUpdate { status: Some(PositionStatus::Closed), closed_reason: Some(reason.to_string()), ..Default::default() },
        )?;
        self.lifecycle.delete_tracked_orders_for_ssot_id(ssot_id)?;

        self.telemetry.info(
            "POSITION_CLOSED",
            "lifecycle",
            reason,
            &Correlation { ssot_id: Some(ssot_id), position_id: Some(ssot_id), ..Default::default() },
            serde_json::json!({"reason": reason}),
        );

        if reason == "Position qty exhausted" {
            self.lifecycle.update_position(ssot_id, &PositionUpdate { reentry_attempts: Some(0), ..Default::default() })?;
            self.lifecycle.clear_stage5_lock(&position.symbol, position.side)?;
        }
        Ok(())
    }

    /// REST sweep safety net: visits every tracked order not closed on the
    /// exchange anymore and applies its terminal fill through the same
    /// `apply_fill` the WS path uses. Also flags positions whose SL has
    /// silently vanished.
    pub async fn reconcile(&self) -> Result<(), BotError> {
        let positions = self.lifecycle.list_positions_not_closed(1000)?;
        for position in positions {
            if position.status == PositionStatus::HedgeMode {
                continue;
            }
            if let Err(e) = self.reconcile_position(&position).await {
                tracing::warn!(ssot_id = position.ssot_id, error = %e, "stage4: reconcile_position failed");
            }
        }
        Ok(())
    }

    async fn reconcile_position(&self, position: &Position) -> Result<(), BotError> {
        let trackers = self.lifecycle.list_tracked_orders_for_ssot_id(position.ssot_id)?;
        let open_orders = self.exchange.get_open_orders(Some(&position.symbol)).await.map_err(to_transient)?;
        let open_ids: std::collections::HashSet<&str> = open_orders.iter().map(|o| o.order_id.as_str()).collect();

        for tracker in &trackers {
            if tracker.kind == OrderKind::Entry || open_ids.contains(tracker.order_id.as_str()) {
                continue;
            }
            let Some(status) = self.exchange.get_order_status(&position.symbol, &tracker.order_id).await.map_err(to_transient)? else {
                continue;
            };
            if status.executed_qty > tracker.last_executed_qty {
                let delta = status.executed_qty - tracker.last_executed_qty;
                let exec_id = format!("reconcile-{}-{}", tracker.order_id, status.executed_qty);
                self.apply_fill(
                    position.ssot_id,
                    &tracker.order_id,
                    &exec_id,
                    tracker.kind,
                    tracker.level_index,
                    status.executed_qty,
                    delta,
                    Some(status.avg_price),
                    &status.status,
                )
                .await?;
            }
        }

        let Some(refreshed) = self.lifecycle.get_position(position.ssot_id)? else { return Ok(()) };
        if refreshed.status == PositionStatus::Closed || refreshed.status == PositionStatus::NeedsManualProtection {
            return Ok(());
        }
        if refreshed.sl_order_id.is_none() && !refreshed.remaining_qty.is_zero() {
            self.flag_needs_manual_protection(&refreshed, "SL order missing on exchange reconcile").await?;
        } else {
            self.lifecycle.update_position(
                position.ssot_id,
                &PositionUpdate { last_reconcile_at_utc: Some(chrono::Utc::now()), ..Default::default() },
            )?;
        }
        Ok(())
    }

    async fn ws_consume_forever(self: Arc<Self>) {
        let mut backoff_secs = 1u64;
        loop {
            let (tx, mut rx) = tokio::sync::mpsc::channel(1024);
            let exchange = self.exchange.clone();
            let listen_task = tokio::spawn(async move { exchange.ws_listen(vec!["execution".to_string(), "position".to_string()], tx).await });

            while let Some(event) = rx.recv().await {
                if let Err(e) = self.handle_ws_event(event).await {
                    tracing::warn!(error = %e, "stage4: ws event handling failed, REST reconcile will cover it");
                }
            }

            match listen_task.await {
                Ok(Ok(())) => tracing::info!("stage4: ws_listen returned cleanly, reconnecting"),
                Ok(Err(e)) => tracing::warn!(error = %e, "stage4: ws_listen error, reconnecting"),
                Err(e) => tracing::error!(error = %e, "stage4: ws task panicked"),
            }

            tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
            backoff_secs = (backoff_secs * 2).min(30);
            if let Err(e) = self.reconcile().await {
                tracing::error!(error = %e, "stage4: reconcile after reconnect failed");
            }
        }
    }

    async fn handle_ws_event(&self, event: WsEvent) -> Result<(), BotError> {
        match event {
            WsEvent::Execution(exec) => {
                if let Some(seq) = exec.seq {
                    if self.seq_gap(&exec.order_id, seq) {
                        self.telemetry.warning(
                            "WS_SEQ_GAP",
                            "lifecycle",
                            "execution stream sequence gap detected, forcing reconcile",
                            &Correlation::default(),
                            serde_json::json!({"order_id": exec.order_id, "seq": seq}),
                        );
                        if let Err(e) = self.reconcile().await {
                            tracing::error!(error = %e, "stage4: reconcile after seq gap failed");
                        }
                    }
                }
                let Some(tracker) = self.lifecycle.get_order_tracker(&exec.order_id)? else {
                    // Untracked order (e.g. a pyramid market fill, or an entry
                    // order from a position not yet materialized) — the
                    // periodic reconcile sweep will catch anything that
                    // matters here.
                    return Ok(());
                };
                self.apply_fill(
                    tracker.ssot_id,
                    &exec.order_id,
                    &exec.exec_id,
                    tracker.kind,
                    tracker.level_index,
                    exec.executed_qty,
                    exec.last_fill_qty,
                    Some(exec.avg_price),
                    &exec.status,
                )
                .await
            }
            WsEvent::Position(_) => Ok(()),
        }
    }

    fn seq_gap(&self, key: &str, seq: u64) -> bool {
        let mut last = self.last_seq.lock();
        let gap = match last.get(key) {
            Some(prev) if seq > *prev + 1 => true,
            _ => false,
        };
        last.insert(key.to_string(), seq);
        gap
    }
}

fn to_transient(e: anyhow::Error) -> BotError {
    BotError::ExchangeTransient(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::paper::PaperExchange;
    use crate::exchange::SymbolInfo;
    use crate::models::SignalKind;
    use crate::ssot::SsotStore;
    use rust_decimal_macros::dec;

    fn test_config() -> Config {
        Config {
            ssot_db_path: ":memory:".into(),
            lifecycle_db_path: ":memory:".into(),
            telemetry_path: std::env::temp_dir().join("lifecycle-test-telemetry.jsonl").to_string_lossy().to_string(),
            risk_per_trade: dec!(0.02),
            initial_margin_plan: dec!(20.00),
            max_leverage: dec!(50),
            min_leverage: dec!(1),
            timeout_short_secs: 86400,
            timeout_long_secs: 518400,
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
            maintenance_cleanup_long_interval_seconds: 21600,
            maintenance_reconcile_interval_seconds: 120,
            bot_name: "test".into(),
            env_name: "test".into(),
            health_port: 0,
        }
    }

    fn harness() -> (Arc<LifecycleManager>, Arc<LifecycleStore>, Arc<PaperExchange>) {
        let lifecycle = Arc::new(LifecycleStore::in_memory().unwrap());
        let ssot = Arc::new(SsotStore::in_memory().unwrap());
        let telemetry = Arc::new(TelemetryLogger::new(&test_config().telemetry_path, "test", "test").unwrap());
        let exchange = PaperExchange::new(SymbolInfo { tick_size: dec!(0.01), qty_step: dec!(0.001), min_qty: dec!(0.001), max_qty: None });
        let mgr = Arc::new(LifecycleManager::new(lifecycle.clone(), ssot, exchange.clone() as Arc<dyn ExchangeClient>, telemetry, test_config()));
        (mgr, lifecycle, exchange)
    }

    fn sample_position(lifecycle: &LifecycleStore) -> Position {
        let levels = vec![
            TpLevel { index: 0, price: dec!(110), status: TpStatus::Open, filled_qty: Decimal::ZERO, order_id: None },
            TpLevel { index: 1, price: dec!(120), status: TpStatus::Open, filled_qty: Decimal::ZERO, order_id: None },
        ];
        lifecycle
            .create_position_if_absent(1, "BTCUSDT", Side::Long, PositionStatus::Open, dec!(1), dec!(1), dec!(100), dec!(90), dec!(100), dec!(90), Some(dec!(10)), &levels)
            .unwrap();
        lifecycle.get_position(1).unwrap().unwrap()
    }

    #[tokio::test]
    async fn tp1_fill_moves_sl_to_be_and_keeps_position_open() {
        let (mgr, lifecycle, exchange) = harness();
        let position = sample_position(&lifecycle);
        exchange.set_price("BTCUSDT", dec!(105));
        mgr.place_initial_protection(&position).await.unwrap();

        let tracked = lifecycle.list_tracked_orders_for_ssot_id(1).unwrap();
        let tp0 = tracked.iter().find(|t| t.kind == OrderKind::Tp && t.level_index == Some(0)).unwrap();

        mgr.apply_fill(1, &tp0.order_id, "exec-1", OrderKind::Tp, Some(0), dec!(0.5), dec!(0.5), Some(dec!(110)), "FILLED").await.unwrap();

        let refreshed = lifecycle.get_position(1).unwrap().unwrap();
        assert_eq!(refreshed.status, PositionStatus::Open);
        assert_eq!(refreshed.remaining_qty, dec!(0.5));
        assert_eq!(refreshed.sl_price, dec!(100));
        assert!(refreshed.realized_pnl > Decimal::ZERO);
    }

    #[tokio::test]
    async fn duplicate_exec_id_is_ignored() {
        let (mgr, lifecycle, exchange) = harness();
        let position = sample_position(&lifecycle);
        exchange.set_price("BTCUSDT", dec!(105));
        mgr.place_initial_protection(&position).await.unwrap();
        let tracked = lifecycle.list_tracked_orders_for_ssot_id(1).unwrap();
        let tp0 = tracked.iter().find(|t| t.kind == OrderKind::Tp && t.level_index == Some(0)).unwrap();

        mgr.apply_fill(1, &tp0.order_id, "exec-1", OrderKind::Tp, Some(0), dec!(0.5), dec!(0.5), Some(dec!(110)), "FILLED").await.unwrap();
        let after_first = lifecycle.get_position(1).unwrap().unwrap();
        mgr.apply_fill(1, &tp0.order_id, "exec-1", OrderKind::Tp, Some(0), dec!(0.5), dec!(0.5), Some(dec!(110)), "FILLED").await.unwrap();
        let after_second = lifecycle.get_position(1).unwrap().unwrap();

        assert_eq!(after_first.remaining_qty, after_second.remaining_qty);
        assert_eq!(after_first.realized_pnl, after_second.realized_pnl);
    }

    #[tokio::test]
    async fn sl_guard_violation_flags_needs_manual_protection() {
        let (mgr, lifecycle, exchange) = harness();
        let position = sample_position(&lifecycle);
        exchange.set_price("BTCUSDT", dec!(80)); // LTP below SL for a long: guard violated
        mgr.place_initial_protection(&position).await.unwrap();

        let refreshed = lifecycle.get_position(1).unwrap().unwrap();
        assert_eq!(refreshed.status, PositionStatus::NeedsManualProtection);
    }
}
