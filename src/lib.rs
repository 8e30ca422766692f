//! Core library for the signal bot: turns text signals from an external
//! channel into a durable, idempotent sequence of exchange orders and
//! lifecycle actions. See `SPEC_FULL.md` for the full component map.

pub mod app;
pub mod channels;
pub mod config;
pub mod decimal_ext;
pub mod error;
pub mod exchange;
pub mod executor;
pub mod hedge;
pub mod ingestion;
pub mod lifecycle;
pub mod maintenance;
pub mod models;
pub mod pyramid;
pub mod reporter;
pub mod ssot;
pub mod telemetry;
pub mod watchdog;
