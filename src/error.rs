//! Crate-wide error taxonomy.
//!
//! Every fallible operation in the trading core returns a `BotError` variant
//! so callers at a loop boundary can decide retry vs. fail without
//! re-deriving intent from a string. `anyhow::Result` is still used for
//! leaf helpers and wiring code that only needs to propagate.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BotError {
    /// Bad input: unparsable signal, missing mandatory field, unknown symbol.
    /// Never retried; surfaced as an `INVALID` decision.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Signal matched an existing accepted signal within the dedup TTL.
    /// Never retried; surfaced as a `BLOCKED` decision.
    #[error("duplicate signal: {0}")]
    Dedup(String),

    /// Timeout, 5xx, or rate limit from the exchange. Caller retries with backoff.
    #[error("exchange transient error: {0}")]
    ExchangeTransient(String),

    /// Insufficient funds, reduce-only violation, unknown symbol, auth failure.
    /// Not retried; row is marked FAILED or position NEEDS_MANUAL_PROTECTION.
    #[error("exchange permanent error: {0}")]
    ExchangePermanent(String),

    /// WS sequence gap, stale WS connection, or a tracked order gone missing.
    /// Resolved by a REST reconcile pass; this variant itself never escapes
    /// a worker loop uncaught.
    #[error("protocol gap: {0}")]
    ProtocolGap(String),

    /// Exchange state doesn't match any tracked order and auto-repair would
    /// be a guess. Never auto-repaired; position flips to
    /// NEEDS_MANUAL_PROTECTION and an edge-triggered alert fires once.
    #[error("ambiguous state: {0}")]
    Ambiguous(String),

    /// Store corruption, serialization failure. Fatal to the calling task;
    /// other tasks continue.
    #[error("internal error: {0}")]
    Internal(String),
}

impl BotError {
    /// Whether a caller should retry after a bounded sleep.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BotError::ExchangeTransient(_) | BotError::ProtocolGap(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            BotError::Validation(_) => "validation",
            BotError::Dedup(_) => "dedup",
            BotError::ExchangeTransient(_) => "exchange_transient",
            BotError::ExchangePermanent(_) => "exchange_permanent",
            BotError::ProtocolGap(_) => "protocol_gap",
            BotError::Ambiguous(_) => "ambiguous",
            BotError::Internal(_) => "internal",
        }
    }

    /// The tracing level this error should be logged at, per the error
    /// handling design: transient/protocol issues are warnings, everything
    /// else that reaches telemetry is an error.
    pub fn is_warning(&self) -> bool {
        matches!(self, BotError::ExchangeTransient(_) | BotError::ProtocolGap(_))
    }
}

impl From<rusqlite::Error> for BotError {
    fn from(e: rusqlite::Error) -> Self {
        BotError::Internal(format!("sqlite: {e}"))
    }
}

impl From<serde_json::Error> for BotError {
    fn from(e: serde_json::Error) -> Self {
        BotError::Internal(format!("serde_json: {e}"))
    }
}
