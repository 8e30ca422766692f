//! Shared domain types used across the ingestion, execution, and lifecycle
//! components. Dynamic dictionaries and ad-hoc payloads from the original
//! system become explicit tagged variants here; anything an exchange
//! adapter doesn't recognize is preserved in a typed "extra" map only for
//! telemetry, never consulted for control flow.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }

    /// The order side that OPENS exposure in this direction.
    pub fn entry_order_side(self) -> OrderSide {
        match self {
            Side::Long => OrderSide::Buy,
            Side::Short => OrderSide::Sell,
        }
    }

    /// The order side that REDUCES/exits exposure in this direction.
    pub fn exit_order_side(self) -> OrderSide {
        self.opposite().entry_order_side()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Long => "LONG",
            Side::Short => "SHORT",
        }
    }

    pub fn parse(s: &str) -> Option<Side> {
        match s.to_ascii_uppercase().as_str() {
            "LONG" | "BUY" => Some(Side::Long),
            "SHORT" | "SELL" => Some(Side::Short),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalKind {
    Swing,
    Dynamic,
    Fast,
}

impl SignalKind {
    pub fn parse(s: &str) -> Option<SignalKind> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SWING" => Some(SignalKind::Swing),
            "DYNAMIC" => Some(SignalKind::Dynamic),
            "FAST" => Some(SignalKind::Fast),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SignalKind::Swing => "SWING",
            SignalKind::Dynamic => "DYNAMIC",
            SignalKind::Fast => "FAST",
        }
    }

    /// Classify by leverage: `<=6.00` -> SWING, `>=7.50` -> DYNAMIC,
    /// otherwise nearest boundary with a tie (6.75) resolving to SWING.
    pub fn classify_from_leverage(leverage: Decimal) -> SignalKind {
        use rust_decimal_macros::dec;
        let low = dec!(6.00);
        let high = dec!(7.50);
        if leverage <= low {
            return SignalKind::Swing;
        }
        if leverage >= high {
            return SignalKind::Dynamic;
        }
        let dist_low = leverage - low;
        let dist_high = high - leverage;
        if dist_low < dist_high {
            SignalKind::Swing
        } else if dist_high < dist_low {
            SignalKind::Dynamic
        } else {
            SignalKind::Swing
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalStatus {
    Queued,
    Claimed,
    Stage2Running,
    Stage2Planned,
    WaitingForFills,
    Merged,
    Completed,
    Expired,
    Failed,
    Cleaned24h,
    Cleaned6d,
}

impl SignalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SignalStatus::Queued => "QUEUED",
            SignalStatus::Claimed => "CLAIMED",
            SignalStatus::Stage2Running => "STAGE2_RUNNING",
            SignalStatus::Stage2Planned => "STAGE2_PLANNED",
            SignalStatus::WaitingForFills => "WAITING_FOR_FILLS",
            SignalStatus::Merged => "MERGED",
            SignalStatus::Completed => "COMPLETED",
            SignalStatus::Expired => "EXPIRED",
            SignalStatus::Failed => "FAILED",
            SignalStatus::Cleaned24h => "CLEANED_24H",
            SignalStatus::Cleaned6d => "CLEANED_6D",
        }
    }

    pub fn parse(s: &str) -> Option<SignalStatus> {
        Some(match s {
            "QUEUED" => SignalStatus::Queued,
            "CLAIMED" => SignalStatus::Claimed,
            "STAGE2_RUNNING" => SignalStatus::Stage2Running,
            "STAGE2_PLANNED" => SignalStatus::Stage2Planned,
            "WAITING_FOR_FILLS" => SignalStatus::WaitingForFills,
            "MERGED" => SignalStatus::Merged,
            "COMPLETED" => SignalStatus::Completed,
            "EXPIRED" => SignalStatus::Expired,
            "FAILED" => SignalStatus::Failed,
            "CLEANED_24H" => SignalStatus::Cleaned24h,
            "CLEANED_6D" => SignalStatus::Cleaned6d,
            _ => return None,
        })
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SignalStatus::Completed
                | SignalStatus::Expired
                | SignalStatus::Failed
                | SignalStatus::Cleaned24h
                | SignalStatus::Cleaned6d
        )
    }
}

/// A parsed, normalized, quantized trading signal ready for queue insertion.
/// Mirrors the `ssot_queue` row shape but without store-assigned fields
/// (`id`, `status`, lock fields).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedSignal {
    pub source: String,
    pub chat_id: String,
    pub message_id: String,
    pub received_at: DateTime<Utc>,
    pub raw_text: String,
    pub symbol: String,
    pub side: Side,
    pub entry: Decimal,
    pub sl: Decimal,
    pub tps: Vec<Decimal>,
    pub kind: SignalKind,
    pub tick_size: Decimal,
    pub qty_step: Decimal,
    pub min_qty: Decimal,
    pub leverage: Option<Decimal>,
    pub dedup_hash: String,
}

/// Outcome of `SignalIngestion::ingest`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum IngestDecision {
    Accepted { ssot_id: i64 },
    Blocked { reason: String },
    Invalid { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionStatus {
    Open,
    HedgeMode,
    NeedsManualProtection,
    Closed,
}

impl PositionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PositionStatus::Open => "OPEN",
            PositionStatus::HedgeMode => "HEDGE_MODE",
            PositionStatus::NeedsManualProtection => "NEEDS_MANUAL_PROTECTION",
            PositionStatus::Closed => "CLOSED",
        }
    }

    pub fn parse(s: &str) -> Option<PositionStatus> {
        Some(match s {
            "OPEN" => PositionStatus::Open,
            "HEDGE_MODE" => PositionStatus::HedgeMode,
            "NEEDS_MANUAL_PROTECTION" => PositionStatus::NeedsManualProtection,
            "CLOSED" => PositionStatus::Closed,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TpStatus {
    Open,
    Partial,
    Completed,
    Missing,
}

impl TpStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TpStatus::Open => "OPEN",
            TpStatus::Partial => "PARTIAL",
            TpStatus::Completed => "COMPLETED",
            TpStatus::Missing => "MISSING",
        }
    }

    pub fn parse(s: &str) -> Option<TpStatus> {
        Some(match s {
            "OPEN" => TpStatus::Open,
            "PARTIAL" => TpStatus::Partial,
            "COMPLETED" => TpStatus::Completed,
            "MISSING" => TpStatus::Missing,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TpLevel {
    pub index: usize,
    pub price: Decimal,
    pub status: TpStatus,
    pub filled_qty: Decimal,
    pub order_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderKind {
    Entry,
    Tp,
    Sl,
    Pyramid,
}

impl OrderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderKind::Entry => "ENTRY",
            OrderKind::Tp => "TP",
            OrderKind::Sl => "SL",
            OrderKind::Pyramid => "PYRAMID",
        }
    }

    pub fn parse(s: &str) -> Option<OrderKind> {
        Some(match s {
            "ENTRY" => OrderKind::Entry,
            "TP" => OrderKind::Tp,
            "SL" => OrderKind::Sl,
            "PYRAMID" => OrderKind::Pyramid,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HedgeState {
    Idle,
    Open,
    HedgeMode,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PyramidState {
    pub scale_1_done: bool,
    pub scale_2_done: bool,
    pub scale_1_at: Option<DateTime<Utc>>,
    pub scale_2_at: Option<DateTime<Utc>>,
}

/// A position's full lifecycle row. 1:1 with a Signal that reached
/// `COMPLETED`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub ssot_id: i64,
    pub symbol: String,
    pub side: Side,
    pub status: PositionStatus,
    pub planned_qty: Decimal,
    pub remaining_qty: Decimal,
    pub avg_entry: Decimal,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub sl_price: Decimal,
    pub sl_order_id: Option<String>,
    pub tp_levels: Vec<TpLevel>,
    pub tp_active_order_ids: Vec<String>,

    /// Immutable copies of the originating signal, never overwritten.
    pub signal_entry: Decimal,
    pub signal_sl: Decimal,
    pub signal_leverage: Option<Decimal>,

    pub is_hedge_armed: bool,
    pub hedge_state: HedgeState,
    pub hedge_entry_order_id: Option<String>,
    pub hedge_tp_order_id: Option<String>,
    pub hedge_sl_order_id: Option<String>,
    pub reentry_attempts: u32,

    pub pyramid_state: PyramidState,

    pub close_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedOrder {
    pub order_id: String,
    pub ssot_id: i64,
    pub kind: OrderKind,
    pub level_index: Option<usize>,
    pub last_executed_qty: Decimal,
    pub last_status: String,
    pub updated_at: DateTime<Utc>,
}

/// Correlation identifiers threaded through telemetry events.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Correlation {
    pub ssot_id: Option<i64>,
    pub bot_order_id: Option<String>,
    pub exchange_order_id: Option<String>,
    pub position_id: Option<i64>,
    pub source_chat_id: Option<String>,
    pub source_message_id: Option<String>,
}

pub type ExtraFields = HashMap<String, serde_json::Value>;
