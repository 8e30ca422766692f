//! The `ExchangeClient` capability boundary: signed REST calls, price/qty
//! metadata, and a WebSocket event stream with per-topic monotonic `seq`.
//!
//! No live adapter with real credentials ships here — the concrete wire
//! format of any one exchange is out of scope (see Design Notes on WS field
//! names varying by exchange). [`paper::PaperExchange`] is the one adapter
//! that ships, for local dry-run and tests, the same role `dry_run` plays in
//! the teacher's `vault::trade_executor`.

pub mod paper;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::models::{ExtraFields, Side};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionSide {
    Long,
    Short,
}

impl From<Side> for PositionSide {
    fn from(s: Side) -> Self {
        match s {
            Side::Long => PositionSide::Long,
            Side::Short => PositionSide::Short,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TimeInForce {
    Gtc,
}

#[derive(Debug, Clone)]
pub struct SymbolInfo {
    pub tick_size: Decimal,
    pub qty_step: Decimal,
    pub min_qty: Decimal,
    pub max_qty: Option<Decimal>,
}

#[derive(Debug, Clone)]
pub struct ExchangePosition {
    pub symbol: String,
    pub position_side: PositionSide,
    pub position_amt: Decimal,
    pub avg_price: Decimal,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub position_initial_margin: Decimal,
    pub leverage: Decimal,
}

#[derive(Debug, Clone)]
pub struct OpenOrder {
    pub order_id: String,
    pub symbol: String,
    pub status: String,
    pub extra: ExtraFields,
}

#[derive(Debug, Clone)]
pub struct OrderStatus {
    pub status: String,
    pub executed_qty: Decimal,
    pub avg_price: Decimal,
}

#[derive(Debug, Clone)]
pub struct Trade {
    pub trade_id: String,
    pub order_id: String,
    pub qty: Decimal,
    pub price: Decimal,
    pub time: DateTime<Utc>,
    pub status: String,
}

#[derive(Debug, Clone, Default)]
pub struct PlaceOrderResult {
    pub order_id: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PlaceLimitOrderRequest {
    pub symbol: String,
    pub side: crate::models::OrderSide,
    pub price: Decimal,
    pub qty: Decimal,
    pub post_only: bool,
    pub time_in_force: TimeInForce,
    pub reduce_only: bool,
    pub position_side: PositionSide,
}

#[derive(Debug, Clone)]
pub struct PlaceMarketOrderRequest {
    pub symbol: String,
    pub side: crate::models::OrderSide,
    pub qty: Decimal,
    pub reduce_only: bool,
    pub position_side: PositionSide,
}

#[derive(Debug, Clone)]
pub struct PlaceStopMarketOrderRequest {
    pub symbol: String,
    pub side: crate::models::OrderSide,
    pub stop_price: Decimal,
    pub qty: Decimal,
    pub reduce_only: bool,
    pub position_side: PositionSide,
}

/// A normalized execution/fill delta, already parsed out of whatever the
/// concrete exchange's WS wire format calls its fields (see Open Question in
/// spec.md §9 — field names vary by exchange; a live adapter is responsible
/// for this mapping, not the core).
#[derive(Debug, Clone)]
pub struct ExecutionEvent {
    pub symbol: String,
    pub order_id: String,
    pub exec_id: String,
    pub executed_qty: Decimal,
    pub last_fill_qty: Decimal,
    pub avg_price: Decimal,
    pub status: String,
    pub seq: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct PositionUpdateEvent {
    pub symbol: String,
    pub position_side: PositionSide,
    pub position_qty: Decimal,
    pub avg_entry: Decimal,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub seq: Option<u64>,
}

#[derive(Debug, Clone)]
pub enum WsEvent {
    Execution(ExecutionEvent),
    Position(PositionUpdateEvent),
}

/// Signed REST + WebSocket abstraction over one exchange account.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    async fn get_symbol_info(&self, symbol: &str) -> anyhow::Result<Option<SymbolInfo>>;
    async fn get_current_price(&self, symbol: &str) -> anyhow::Result<Decimal>;
    /// Available quote-currency (USDT) balance used for Stage 2 sizing.
    /// Not itemized in spec.md's method list (which names position/order
    /// calls only) but required by its sizing formula (`notional = risk *
    /// balance / Δprice`); every concrete exchange exposes an account/
    /// wallet-balance endpoint for this.
    async fn get_account_balance(&self) -> anyhow::Result<Decimal>;
    async fn get_positions(&self, symbol: Option<&str>) -> anyhow::Result<Vec<ExchangePosition>>;
    async fn get_open_orders(&self, symbol: Option<&str>) -> anyhow::Result<Vec<OpenOrder>>;
    async fn get_order_status(&self, symbol: &str, order_id: &str) -> anyhow::Result<Option<OrderStatus>>;
    async fn get_my_trades(&self, symbol: &str, limit: u32, since_id: Option<&str>) -> anyhow::Result<Vec<Trade>>;
    async fn place_limit_order(&self, req: PlaceLimitOrderRequest) -> anyhow::Result<PlaceOrderResult>;
    async fn place_market_order(&self, req: PlaceMarketOrderRequest) -> anyhow::Result<PlaceOrderResult>;
    async fn place_stop_market_order(&self, req: PlaceStopMarketOrderRequest) -> anyhow::Result<PlaceOrderResult>;
    async fn cancel_order(&self, symbol: &str, order_id: &str) -> anyhow::Result<bool>;
    async fn set_leverage(&self, symbol: &str, leverage: Decimal) -> anyhow::Result<()>;

    /// Stream order/execution/position updates into `tx` until disconnected.
    /// Callers restart this in a reconnect loop with backoff
    /// (`scrapers::binance_session`'s shape in the teacher repo); a return
    /// from this call always means "disconnected", never "done forever".
    async fn ws_listen(&self, topics: Vec<String>, tx: mpsc::Sender<WsEvent>) -> anyhow::Result<()>;
}
