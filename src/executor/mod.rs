//! Stage 2: the Dual-Limit Entry Executor. Claims rows off the SSoT queue
//! and drives each one to a terminal state (`COMPLETED`/`EXPIRED`/`FAILED`)
//! via two maker-only limit orders, observing the first fill and merging
//! the residual into a single replacement order.
//!
//! Ported from `original_source/signal_dual_limit_entry.py`; the async loop
//! shape (claim → run → persist, errors caught at the loop boundary) follows
//! `vault::trade_executor::TradeExecutor::process_signal` in the teacher.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::decimal_ext::{clamp, quantize_qty, quantize_tick};
use crate::error::BotError;
use crate::exchange::{ExchangeClient, PlaceLimitOrderRequest, PositionSide, TimeInForce};
use crate::models::{Correlation, OrderSide, SignalStatus};
use crate::ssot::{QueuedSignal, SsotStore};
use crate::telemetry::TelemetryLogger;

/// Durable, restart-safe Stage 2 working state, persisted as the queue
/// row's `stage2_json` column after every state-changing step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Stage2State {
    pub entry: Decimal,
    pub sl: Decimal,
    pub delta: Decimal,
    pub total_qty: Decimal,
    pub q1: Decimal,
    pub q2: Decimal,
    pub p1: Decimal,
    pub p2: Decimal,
    pub leverage: Decimal,
    #[serde(default)]
    pub original_order_ids: Vec<String>,
    #[serde(default)]
    pub replacement_order_id: Option<String>,
    #[serde(default)]
    pub merged: bool,
    #[serde(default)]
    pub filled_qty: Decimal,
    #[serde(default)]
    pub filled_notional: Decimal,
    pub placed_at: Option<DateTime<Utc>>,
}

pub struct DualLimitExecutor {
    ssot: Arc<SsotStore>,
    exchange: Arc<dyn ExchangeClient>,
    telemetry: Arc<TelemetryLogger>,
    config: Config,
    worker_id: String,
}

impl DualLimitExecutor {
    pub fn new(ssot: Arc<SsotStore>, exchange: Arc<dyn ExchangeClient>, telemetry: Arc<TelemetryLogger>, config: Config, worker_id: String) -> Self {
        Self { ssot, exchange, telemetry, config, worker_id }
    }

    /// Claim-and-run loop. Runs until the process is cancelled; every
    /// iteration is independent so a panic/error in one row never stalls
    /// the claim of the next.
    pub async fn run_forever(self: Arc<Self>) {
        let poll = Duration::from_secs(self.config.stage2_poll_interval_seconds);
        loop {
            let claimed = self.ssot.claim_next_signal(&self.worker_id, self.config.lock_ttl_seconds);
            match claimed {
                Ok(Some(sig)) => {
                    let ssot_id = sig.id;
                    if let Err(e) = self.run_one(sig).await {
                        tracing::error!(ssot_id, error = %e, "stage2: fatal error executing signal");
                        let _ = self.ssot.mark_queue_row(ssot_id, SignalStatus::Failed, Some(&e.to_string()));
                    }
                }
                Ok(None) => tokio::time::sleep(poll).await,
                Err(e) => {
                    tracing::error!(error = %e, "stage2: claim_next_signal failed");
                    tokio::time::sleep(poll).await;
                }
            }
        }
    }

    async fn run_one(&self, sig: QueuedSignal) -> Result<(), BotError> {
        self.ssot.update_queue_row(sig.id, SignalStatus::Stage2Running, None, None)?;
        let status = self.execute(&sig).await?;
        self.ssot.mark_queue_row(sig.id, status, None)
    }

    /// Run the full Stage 2 algorithm for one claimed signal, returning its
    /// terminal status. Resumable: reads any `stage2_json` already on the
    /// row so a crash mid-fill-loop picks up where it left off instead of
    /// re-placing orders.
    pub async fn execute(&self, sig: &QueuedSignal) -> Result<SignalStatus, BotError> {
        let order_side = sig.side.entry_order_side();
        let mut state: Stage2State = sig
            .stage2_json
            .as_ref()
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();

        if state.original_order_ids.is_empty() {
            state = self.plan_and_place(sig, order_side).await?;
        }

        self.persist(sig.id, SignalStatus::WaitingForFills, &state)?;

        let poll = Duration::from_secs(self.config.stage2_poll_interval_seconds);
        let placed_at = state.placed_at.unwrap_or_else(Utc::now);
        let first_fill_deadline = placed_at + chrono::Duration::seconds(self.config.timeout_short_secs);
        let total_fill_deadline = placed_at + chrono::Duration::seconds(self.config.timeout_long_secs);

        loop {
            let now = Utc::now();
            let (f, n) = self.reconcile_fills(sig, &state).await?;
            state.filled_qty = f;
            state.filled_notional = n;

            if f >= state.total_qty {
                self.telemetry.info(
                    "STAGE2_COMPLETED",
                    "executor",
                    "dual-limit entry fully filled",
                    &Correlation { ssot_id: Some(sig.id), ..Default::default() },
                    serde_json::json!({"filled_qty": f.to_string(), "avg_price": avg_price(f, n).to_string()}),
                );
                self.persist(sig.id, SignalStatus::Completed, &state)?;
                return Ok(SignalStatus::Completed);
            }

            if now > total_fill_deadline {
                self.telemetry.warning(
                    "STAGE2_EXPIRED",
                    "executor",
                    "total fill timeout reached",
                    &Correlation { ssot_id: Some(sig.id), ..Default::default() },
                    serde_json::json!({"filled_qty": f.to_string(), "total_qty": state.total_qty.to_string()}),
                );
                self.persist(sig.id, SignalStatus::Expired, &state)?;
                return Ok(SignalStatus::Expired);
            }

            if !state.merged && f.is_zero() && now > first_fill_deadline {
                self.telemetry.warning(
                    "STAGE2_EXPIRED",
                    "executor",
                    "first fill timeout reached with no fills",
                    &Correlation { ssot_id: Some(sig.id), ..Default::default() },
                    serde_json::json!({}),
                );
                self.persist(sig.id, SignalStatus::Expired, &state)?;
                return Ok(SignalStatus::Expired);
            }

            if !state.merged && f > Decimal::ZERO {
                state = self.merge_residual(sig, &state, order_side, f, n).await?;
                self.persist(sig.id, SignalStatus::WaitingForFills, &state)?;
                continue;
            }

            self.persist(sig.id, SignalStatus::WaitingForFills, &state)?;
            tokio::time::sleep(poll).await;
        }
    }

    async fn plan_and_place(&self, sig: &QueuedSignal, order_side: OrderSide) -> Result<Stage2State, BotError> {
        let entry = sig.entry_price;
        let sl = sig.sl_price;
        let delta_price = (entry - sl).abs() / entry;
        if delta_price.is_zero() {
            return Err(BotError::Validation("entry and sl identical; cannot size position".into()));
        }

        let balance = self.exchange.get_account_balance().await.map_err(|e| BotError::ExchangeTransient(e.to_string()))?;
        let notional = self.config.risk_per_trade * balance / delta_price;
        let raw_leverage = if self.config.initial_margin_plan.is_zero() { self.config.min_leverage } else { notional / self.config.initial_margin_plan };
        let leverage = clamp(raw_leverage, self.config.min_leverage, self.config.max_leverage).round_dp(2);
        let total_qty = quantize_qty(notional / entry, sig.qty_step, sig.min_qty);
        if total_qty.is_zero() {
            return Err(BotError::Validation("computed order quantity is zero".into()));
        }

        if let Err(e) = self.exchange.set_leverage(&sig.symbol, leverage).await {
            tracing::warn!(ssot_id = sig.id, error = %e, "stage2: set_leverage failed, continuing with existing leverage");
        }

        let spread = quantize_tick(entry * self.config.stage2_default_spread_pct, sig.tick_size);
        let mut p1 = quantize_tick(entry - spread, sig.tick_size);
        let mut p2 = quantize_tick(entry + spread, sig.tick_size);

        let ltp = self.exchange.get_current_price(&sig.symbol).await.map_err(|e| BotError::ExchangeTransient(e.to_string()))?;
        (p1, p2) = ensure_maker_safe_prices(order_side, p1, p2, ltp, sig.tick_size, self.config.stage2_max_price_shifts);

        let q1 = quantize_qty(total_qty / Decimal::from(2), sig.qty_step, sig.min_qty);
        let q2 = quantize_qty(total_qty - q1, sig.qty_step, sig.min_qty);

        let mut state = Stage2State {
            entry,
            sl,
            delta: spread,
            total_qty,
            q1,
            q2,
            p1,
            p2,
            leverage,
            placed_at: Some(Utc::now()),
            ..Default::default()
        };
        self.persist(sig.id, SignalStatus::Stage2Planned, &state)?;

        let position_side: PositionSide = sig.side.into();
        let mut placed = Vec::new();
        for (price, qty) in [(p1, q1), (p2, q2)] {
            if qty.is_zero() {
                continue;
            }
            let result = self
                .exchange
                .place_limit_order(PlaceLimitOrderRequest {
                    symbol: sig.symbol.clone(),
                    side: order_side,
                    price,
                    qty,
                    post_only: true,
                    time_in_force: TimeInForce::Gtc,
                    reduce_only: false,
                    position_side,
                })
                .await
                .map_err(|e| BotError::ExchangeTransient(e.to_string()))?;
            if let Some(order_id) = result.order_id {
                placed.push(order_id);
            }
        }

        if placed.len() < 2 {
            self.telemetry.error(
                "STAGE2_PLACEMENT_FAILED",
                "executor",
                "fewer than two maker-only entry orders accepted",
                &Correlation { ssot_id: Some(sig.id), ..Default::default() },
                serde_json::json!({"accepted": placed.len()}),
            );
            return Err(BotError::ExchangePermanent(format!("only {} of 2 entry orders placed", placed.len())));
        }

        state.original_order_ids = placed;
        Ok(state)
    }

    /// Recompute `(f, N)` from scratch by summing executed qty/notional
    /// across every order id this row has ever placed (original +
    /// replacement). Never incremental, so a crash-and-resume mid-poll
    /// reconverges deterministically.
    async fn reconcile_fills(&self, sig: &QueuedSignal, state: &Stage2State) -> Result<(Decimal, Decimal), BotError> {
        let mut f = Decimal::ZERO;
        let mut n = Decimal::ZERO;
        let mut order_ids = state.original_order_ids.clone();
        if let Some(r) = &state.replacement_order_id {
            order_ids.push(r.clone());
        }
        for order_id in &order_ids {
            match self.exchange.get_order_status(&sig.symbol, order_id).await {
                Ok(Some(status)) => {
                    f += status.executed_qty;
                    n += status.executed_qty * status.avg_price;
                }
                Ok(None) => {}
                Err(e) => return Err(BotError::ExchangeTransient(e.to_string())),
            }
        }
        Ok((f, n))
    }

    async fn merge_residual(
        &self,
        sig: &QueuedSignal,
        state: &Stage2State,
        order_side: OrderSide,
        f: Decimal,
        n: Decimal,
    ) -> Result<Stage2State, BotError> {
        let mut state = state.clone();
        for order_id in &state.original_order_ids {
            if let Ok(Some(status)) = self.exchange.get_order_status(&sig.symbol, order_id).await {
                if status.status == "NEW" || status.status == "PARTIALLY_FILLED" {
                    let _ = self.exchange.cancel_order(&sig.symbol, order_id).await;
                }
            }
        }
        // Re-reconcile after cancellation: a fill could have landed concurrently.
        let (f, n) = self.reconcile_fills(sig, &state).await.map(|(rf, rn)| if rf > f { (rf, rn) } else { (f, n) })?;

        let residual = state.total_qty - f;
        if residual <= Decimal::ZERO {
            state.merged = true;
            return Ok(state);
        }

        let mut p_r = quantize_tick((state.entry * state.total_qty - n) / residual, sig.tick_size);
        let ltp = self.exchange.get_current_price(&sig.symbol).await.map_err(|e| BotError::ExchangeTransient(e.to_string()))?;
        let (shifted, _) = ensure_maker_safe_prices(order_side, p_r, p_r, ltp, sig.tick_size, self.config.stage2_max_price_shifts);
        p_r = shifted;

        let position_side: PositionSide = sig.side.into();
        let result = self
            .exchange
            .place_limit_order(PlaceLimitOrderRequest {
                symbol: sig.symbol.clone(),
                side: order_side,
                price: p_r,
                qty: residual,
                post_only: true,
                time_in_force: TimeInForce::Gtc,
                reduce_only: false,
                position_side,
            })
            .await
            .map_err(|e| BotError::ExchangeTransient(e.to_string()))?;

        self.telemetry.info(
            "STAGE2_MERGED",
            "executor",
            "placed replacement order for residual quantity",
            &Correlation { ssot_id: Some(sig.id), bot_order_id: result.order_id.clone(), ..Default::default() },
            serde_json::json!({"residual_qty": residual.to_string(), "price": p_r.to_string()}),
        );

        state.replacement_order_id = result.order_id;
        state.merged = true;
        Ok(state)
    }

    fn persist(&self, ssot_id: i64, status: SignalStatus, state: &Stage2State) -> Result<(), BotError> {
        let value = serde_json::to_value(state)?;
        self.ssot.update_queue_row(ssot_id, status, Some(&value), None)
    }
}

/// Shift `p1`/`p2` toward the safe side of `ltp` in `tick_size` increments,
/// up to `max_shifts` times: BUY prices must stay below LTP, SELL prices
/// above, so a maker-only (post-only) order is never immediately rejected
/// for crossing the book.
fn ensure_maker_safe_prices(order_side: OrderSide, mut p1: Decimal, mut p2: Decimal, ltp: Decimal, tick_size: Decimal, max_shifts: u32) -> (Decimal, Decimal) {
    if ltp.is_zero() || tick_size.is_zero() {
        return (p1, p2);
    }
    let mut shifts = 0;
    match order_side {
        OrderSide::Buy => {
            while (p1 >= ltp || p2 >= ltp) && shifts < max_shifts {
                p1 -= tick_size;
                p2 -= tick_size;
                shifts += 1;
            }
        }
        OrderSide::Sell => {
            while (p1 <= ltp || p2 <= ltp) && shifts < max_shifts {
                p1 += tick_size;
                p2 += tick_size;
                shifts += 1;
            }
        }
    }
    (p1, p2)
}

fn avg_price(qty: Decimal, notional: Decimal) -> Decimal {
    if qty.is_zero() {
        Decimal::ZERO
    } else {
        notional / qty
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::paper::PaperExchange;
    use crate::exchange::SymbolInfo;
    use crate::models::{ParsedSignal, Side, SignalKind};
    use crate::ssot::SsotStore;
    use rust_decimal_macros::dec;
    use tempfile::tempdir;

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
            stage2_poll_interval_seconds: 0,
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

    fn info() -> SymbolInfo {
        SymbolInfo { tick_size: dec!(0.01), qty_step: dec!(0.001), min_qty: dec!(0.001), max_qty: None }
    }

    async fn setup() -> (DualLimitExecutor, Arc<SsotStore>, Arc<PaperExchange>, i64) {
        let dir = tempdir().unwrap();
        let ssot = Arc::new(SsotStore::open(dir.path().join("ssot.db").to_str().unwrap()).unwrap());
        let exchange = PaperExchange::new(info());
        exchange.set_symbol_info("BTCUSDT", info());
        exchange.set_balance(dec!(402.10));
        exchange.set_price("BTCUSDT", dec!(100.00));
        let telemetry = Arc::new(TelemetryLogger::new(dir.path().join("t.jsonl").to_str().unwrap(), "test", "test").unwrap());

        let signal = ParsedSignal {
            source: "chan".into(),
            chat_id: "1".into(),
            message_id: "1".into(),
            received_at: Utc::now(),
            raw_text: "raw".into(),
            symbol: "BTCUSDT".into(),
            side: Side::Long,
            entry: dec!(100.00),
            sl: dec!(98.00),
            tps: vec![dec!(101.00), dec!(102.00), dec!(104.00)],
            kind: SignalKind::Dynamic,
            tick_size: dec!(0.01),
            qty_step: dec!(0.001),
            min_qty: dec!(0.001),
            leverage: Some(dec!(20.11)),
            dedup_hash: "h1".into(),
        };
        let ssot_id = ssot.insert_accepted_signal(&signal).unwrap();

        let executor = DualLimitExecutor::new(ssot.clone(), exchange.clone(), telemetry, test_config(), "worker-1".into());
        (executor, ssot, exchange, ssot_id)
    }

    #[tokio::test]
    async fn happy_path_both_legs_fill_completes() {
        let (executor, ssot, exchange, ssot_id) = setup().await;
        let sig = ssot.claim_next_signal("worker-1", 300).unwrap().unwrap();
        assert_eq!(sig.id, ssot_id);

        let executor = Arc::new(executor);
        let exec2 = executor.clone();
        let handle = tokio::spawn(async move { exec2.execute(&sig).await });

        // Let the placement step run (it only awaits already-ready paper-exchange
        // futures), then cross both resting buy orders in one move.
        tokio::time::sleep(Duration::from_millis(20)).await;
        exchange.set_price("BTCUSDT", dec!(99.00));

        let status = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("stage2 execution did not complete")
            .unwrap()
            .unwrap();
        assert_eq!(status, SignalStatus::Completed);
    }

    #[test]
    fn maker_safe_shifts_buy_prices_below_ltp() {
        let (p1, p2) = ensure_maker_safe_prices(OrderSide::Buy, dec!(100.10), dec!(99.90), dec!(100.00), dec!(0.01), 50);
        assert!(p1 < dec!(100.00));
        assert!(p2 < dec!(100.00));
    }

    #[test]
    fn maker_safe_shifts_sell_prices_above_ltp() {
        let (p1, p2) = ensure_maker_safe_prices(OrderSide::Sell, dec!(99.90), dec!(100.10), dec!(100.00), dec!(0.01), 50);
        assert!(p1 > dec!(100.00));
        assert!(p2 > dec!(100.00));
    }
}
