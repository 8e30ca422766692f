//! An in-process paper-fill exchange: orders are matched against a fed
//! last-traded-price stream rather than a real venue. This is the crate's
//! analogue of `DRY_RUN`/`TradeExecutorConfig::dry_run` in the teacher and
//! original system — it lets every stage run end to end without live
//! exchange credentials.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::sync::{broadcast, mpsc};

use crate::decimal_ext::quantize_tick;
use crate::models::OrderSide;

use super::{
    ExchangeClient, ExchangePosition, ExecutionEvent, OpenOrder, OrderStatus,
    PlaceLimitOrderRequest, PlaceMarketOrderRequest, PlaceOrderResult,
    PlaceStopMarketOrderRequest, PositionSide, SymbolInfo, Trade, WsEvent,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PaperOrderKind {
    Limit,
    StopMarket,
}

#[derive(Debug, Clone)]
struct PaperOrder {
    order_id: String,
    symbol: String,
    side: OrderSide,
    kind: PaperOrderKind,
    trigger_price: Decimal,
    qty: Decimal,
    executed_qty: Decimal,
    avg_price: Decimal,
    status: String,
    position_side: PositionSide,
    exec_seq: u64,
}

struct PositionAgg {
    qty: Decimal,
    avg_entry: Decimal,
    realized_pnl: Decimal,
}

pub struct PaperExchange {
    default_symbol_info: SymbolInfo,
    symbol_infos: Mutex<HashMap<String, SymbolInfo>>,
    ltp: Mutex<HashMap<String, Decimal>>,
    orders: Mutex<HashMap<String, PaperOrder>>,
    positions: Mutex<HashMap<(String, PositionSide), PositionAgg>>,
    trades: Mutex<Vec<Trade>>,
    balance: Mutex<Decimal>,
    next_id: AtomicU64,
    events: broadcast::Sender<WsEvent>,
}

impl PaperExchange {
    pub fn new(default_symbol_info: SymbolInfo) -> Arc<Self> {
        let (tx, _rx) = broadcast::channel(1024);
        Arc::new(Self {
            default_symbol_info,
            symbol_infos: Mutex::new(HashMap::new()),
            ltp: Mutex::new(HashMap::new()),
            orders: Mutex::new(HashMap::new()),
            positions: Mutex::new(HashMap::new()),
            trades: Mutex::new(Vec::new()),
            balance: Mutex::new(Decimal::ZERO),
            next_id: AtomicU64::new(1),
            events: tx,
        })
    }

    pub fn set_balance(&self, balance: Decimal) {
        *self.balance.lock() = balance;
    }

    pub fn set_symbol_info(&self, symbol: &str, info: SymbolInfo) {
        self.symbol_infos.lock().insert(symbol.to_string(), info);
    }

    /// Feed a new last-traded-price and match any resting orders against it.
    pub fn set_price(&self, symbol: &str, price: Decimal) {
        self.ltp.lock().insert(symbol.to_string(), price);
        self.match_resting_orders(symbol, price);
    }

    pub fn price(&self, symbol: &str) -> Decimal {
        self.ltp.lock().get(symbol).copied().unwrap_or(Decimal::ZERO)
    }

    fn next_order_id(&self) -> String {
        format!("paper-{}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn match_resting_orders(&self, symbol: &str, ltp: Decimal) {
        let mut to_fill: Vec<(String, Decimal)> = Vec::new();
        {
            let orders = self.orders.lock();
            for order in orders.values() {
                if order.symbol != symbol || order.status == "FILLED" || order.status == "CANCELED" {
                    continue;
                }
                let crosses = match (order.kind, order.side) {
                    (PaperOrderKind::Limit, OrderSide::Buy) => ltp <= order.trigger_price,
                    (PaperOrderKind::Limit, OrderSide::Sell) => ltp >= order.trigger_price,
                    (PaperOrderKind::StopMarket, OrderSide::Sell) => ltp <= order.trigger_price,
                    (PaperOrderKind::StopMarket, OrderSide::Buy) => ltp >= order.trigger_price,
                };
                if crosses {
                    to_fill.push((order.order_id.clone(), ltp));
                }
            }
        }
        for (order_id, fill_price) in to_fill {
            self.fill_order(&order_id, fill_price, None);
        }
    }

    /// Fill `qty` (or the full remaining size if `qty` is `None`) of a
    /// tracked order at `fill_price`, updating the aggregate position and
    /// broadcasting an `ExecutionEvent`.
    fn fill_order(&self, order_id: &str, fill_price: Decimal, qty: Option<Decimal>) {
        let (symbol, side, position_side, fill_qty, new_status, exec_seq) = {
            let mut orders = self.orders.lock();
            let Some(order) = orders.get_mut(order_id) else { return };
            let remaining = order.qty - order.executed_qty;
            if remaining <= Decimal::ZERO {
                return;
            }
            let fill_qty = qty.unwrap_or(remaining).min(remaining);
            let prior_notional = order.avg_price * order.executed_qty;
            order.executed_qty += fill_qty;
            order.avg_price = (prior_notional + fill_price * fill_qty) / order.executed_qty;
            order.exec_seq += 1;
            order.status = if order.executed_qty >= order.qty { "FILLED".to_string() } else { "PARTIALLY_FILLED".to_string() };
            (
                order.symbol.clone(),
                order.side,
                order.position_side,
                fill_qty,
                order.status.clone(),
                order.exec_seq,
            )
        };

        self.apply_position_delta(&symbol, position_side, side, fill_qty, fill_price);

        self.trades.lock().push(Trade {
            trade_id: format!("{order_id}-{exec_seq}"),
            order_id: order_id.to_string(),
            qty: fill_qty,
            price: fill_price,
            time: Utc::now(),
            status: new_status.clone(),
        });

        let executed_qty = self.orders.lock().get(order_id).map(|o| o.executed_qty).unwrap_or(fill_qty);
        let avg_price = self.orders.lock().get(order_id).map(|o| o.avg_price).unwrap_or(fill_price);
        let _ = self.events.send(WsEvent::Execution(ExecutionEvent {
            symbol,
            order_id: order_id.to_string(),
            exec_id: format!("{order_id}-{exec_seq}"),
            executed_qty,
            last_fill_qty: fill_qty,
            avg_price,
            status: new_status,
            seq: Some(exec_seq),
        }));
    }

    fn apply_position_delta(
        &self,
        symbol: &str,
        position_side: PositionSide,
        order_side: OrderSide,
        fill_qty: Decimal,
        fill_price: Decimal,
    ) {
        let opens = match (position_side, order_side) {
            (PositionSide::Long, OrderSide::Buy) | (PositionSide::Short, OrderSide::Sell) => true,
            _ => false,
        };
        let mut positions = self.positions.lock();
        let key = (symbol.to_string(), position_side);
        let entry = positions.entry(key).or_insert_with(|| PositionAgg {
            qty: Decimal::ZERO,
            avg_entry: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
        });
        if opens {
            let prior_notional = entry.avg_entry * entry.qty;
            entry.qty += fill_qty;
            if entry.qty > Decimal::ZERO {
                entry.avg_entry = (prior_notional + fill_price * fill_qty) / entry.qty;
            }
        } else {
            let closing_qty = fill_qty.min(entry.qty);
            let pnl_per_unit = match position_side {
                PositionSide::Long => fill_price - entry.avg_entry,
                PositionSide::Short => entry.avg_entry - fill_price,
            };
            entry.realized_pnl += pnl_per_unit * closing_qty;
            entry.qty -= closing_qty;
            if entry.qty <= Decimal::ZERO {
                entry.qty = Decimal::ZERO;
            }
        }
    }
}

#[async_trait]
impl ExchangeClient for PaperExchange {
    async fn get_symbol_info(&self, symbol: &str) -> anyhow::Result<Option<SymbolInfo>> {
        Ok(Some(
            self.symbol_infos.lock().get(symbol).cloned().unwrap_or_else(|| self.default_symbol_info.clone()),
        ))
    }

    async fn get_current_price(&self, symbol: &str) -> anyhow::Result<Decimal> {
        Ok(self.price(symbol))
    }

    async fn get_account_balance(&self) -> anyhow::Result<Decimal> {
        Ok(*self.balance.lock())
    }

    async fn get_positions(&self, symbol: Option<&str>) -> anyhow::Result<Vec<ExchangePosition>> {
        let positions = self.positions.lock();
        Ok(positions
            .iter()
            .filter(|((sym, _), agg)| symbol.map(|s| s == sym).unwrap_or(true) && agg.qty > Decimal::ZERO)
            .map(|((sym, side), agg)| ExchangePosition {
                symbol: sym.clone(),
                position_side: *side,
                position_amt: agg.qty,
                avg_price: agg.avg_entry,
                realized_pnl: agg.realized_pnl,
                unrealized_pnl: Decimal::ZERO,
                position_initial_margin: Decimal::ZERO,
                leverage: Decimal::ONE,
            })
            .collect())
    }

    async fn get_open_orders(&self, symbol: Option<&str>) -> anyhow::Result<Vec<OpenOrder>> {
        let orders = self.orders.lock();
        Ok(orders
            .values()
            .filter(|o| (o.status == "NEW" || o.status == "PARTIALLY_FILLED") && symbol.map(|s| s == o.symbol).unwrap_or(true))
            .map(|o| OpenOrder {
                order_id: o.order_id.clone(),
                symbol: o.symbol.clone(),
                status: o.status.clone(),
                extra: Default::default(),
            })
            .collect())
    }

    async fn get_order_status(&self, _symbol: &str, order_id: &str) -> anyhow::Result<Option<OrderStatus>> {
        Ok(self.orders.lock().get(order_id).map(|o| OrderStatus {
            status: o.status.clone(),
            executed_qty: o.executed_qty,
            avg_price: o.avg_price,
        }))
    }

    async fn get_my_trades(&self, symbol: &str, limit: u32, since_id: Option<&str>) -> anyhow::Result<Vec<Trade>> {
        let trades = self.trades.lock();
        let mut out: Vec<Trade> = trades
            .iter()
            .filter(|t| {
                self.orders.lock().get(&t.order_id).map(|o| o.symbol == symbol).unwrap_or(false)
                    && since_id.map(|id| t.trade_id.as_str() > id).unwrap_or(true)
            })
            .cloned()
            .collect();
        out.truncate(limit as usize);
        Ok(out)
    }

    async fn place_limit_order(&self, req: PlaceLimitOrderRequest) -> anyhow::Result<PlaceOrderResult> {
        let ltp = self.price(&req.symbol);
        if req.post_only && ltp > Decimal::ZERO {
            let would_cross = match req.side {
                OrderSide::Buy => req.price >= ltp,
                OrderSide::Sell => req.price <= ltp,
            };
            if would_cross {
                return Ok(PlaceOrderResult { order_id: None, error: Some("post-only would cross".to_string()) });
            }
        }
        let order_id = self.next_order_id();
        let info = self.get_symbol_info(&req.symbol).await?.unwrap_or_else(|| self.default_symbol_info.clone());
        let price = quantize_tick(req.price, info.tick_size);
        self.orders.lock().insert(
            order_id.clone(),
            PaperOrder {
                order_id: order_id.clone(),
                symbol: req.symbol,
                side: req.side,
                kind: PaperOrderKind::Limit,
                trigger_price: price,
                qty: req.qty,
                executed_qty: Decimal::ZERO,
                avg_price: Decimal::ZERO,
                status: "NEW".to_string(),
                position_side: req.position_side,
                exec_seq: 0,
            },
        );
        Ok(PlaceOrderResult { order_id: Some(order_id), error: None })
    }

    async fn place_market_order(&self, req: PlaceMarketOrderRequest) -> anyhow::Result<PlaceOrderResult> {
        let order_id = self.next_order_id();
        let ltp = self.price(&req.symbol);
        self.orders.lock().insert(
            order_id.clone(),
            PaperOrder {
                order_id: order_id.clone(),
                symbol: req.symbol,
                side: req.side,
                kind: PaperOrderKind::Limit,
                trigger_price: ltp,
                qty: req.qty,
                executed_qty: Decimal::ZERO,
                avg_price: Decimal::ZERO,
                status: "NEW".to_string(),
                position_side: req.position_side,
                exec_seq: 0,
            },
        );
        if ltp > Decimal::ZERO {
            self.fill_order(&order_id, ltp, None);
        }
        Ok(PlaceOrderResult { order_id: Some(order_id), error: None })
    }

    async fn place_stop_market_order(&self, req: PlaceStopMarketOrderRequest) -> anyhow::Result<PlaceOrderResult> {
        let order_id = self.next_order_id();
        self.orders.lock().insert(
            order_id.clone(),
            PaperOrder {
                order_id: order_id.clone(),
                symbol: req.symbol,
                side: req.side,
                kind: PaperOrderKind::StopMarket,
                trigger_price: req.stop_price,
                qty: req.qty,
                executed_qty: Decimal::ZERO,
                avg_price: Decimal::ZERO,
                status: "NEW".to_string(),
                position_side: req.position_side,
                exec_seq: 0,
            },
        );
        Ok(PlaceOrderResult { order_id: Some(order_id), error: None })
    }

    async fn cancel_order(&self, _symbol: &str, order_id: &str) -> anyhow::Result<bool> {
        let mut orders = self.orders.lock();
        if let Some(order) = orders.get_mut(order_id) {
            if order.status == "NEW" || order.status == "PARTIALLY_FILLED" {
                order.status = "CANCELED".to_string();
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn set_leverage(&self, _symbol: &str, _leverage: Decimal) -> anyhow::Result<()> {
        Ok(())
    }

    async fn ws_listen(&self, _topics: Vec<String>, tx: mpsc::Sender<WsEvent>) -> anyhow::Result<()> {
        let mut rx = self.events.subscribe();
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if tx.send(event).await.is_err() {
                        return Ok(());
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OrderSide;
    use rust_decimal_macros::dec;

    fn info() -> SymbolInfo {
        SymbolInfo { tick_size: dec!(0.01), qty_step: dec!(0.001), min_qty: dec!(0.001), max_qty: None }
    }

    #[tokio::test]
    async fn limit_order_fills_when_price_crosses() {
        let ex = PaperExchange::new(info());
        ex.set_price("BTCUSDT", dec!(100.00));
        let res = ex
            .place_limit_order(PlaceLimitOrderRequest {
                symbol: "BTCUSDT".into(),
                side: OrderSide::Buy,
                price: dec!(99.00),
                qty: dec!(1.000),
                post_only: true,
                time_in_force: super::super::TimeInForce::Gtc,
                reduce_only: false,
                position_side: PositionSide::Long,
            })
            .await
            .unwrap();
        let order_id = res.order_id.unwrap();
        ex.set_price("BTCUSDT", dec!(99.00));
        let status = ex.get_order_status("BTCUSDT", &order_id).await.unwrap().unwrap();
        assert_eq!(status.status, "FILLED");
        assert_eq!(status.executed_qty, dec!(1.000));
    }

    #[tokio::test]
    async fn post_only_rejected_if_crossing() {
        let ex = PaperExchange::new(info());
        ex.set_price("BTCUSDT", dec!(100.00));
        let res = ex
            .place_limit_order(PlaceLimitOrderRequest {
                symbol: "BTCUSDT".into(),
                side: OrderSide::Buy,
                price: dec!(101.00),
                qty: dec!(1.000),
                post_only: true,
                time_in_force: super::super::TimeInForce::Gtc,
                reduce_only: false,
                position_side: PositionSide::Long,
            })
            .await
            .unwrap();
        assert!(res.order_id.is_none());
    }
}
