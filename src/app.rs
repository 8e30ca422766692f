//! Wiring: builds the immutable `Config`, opens both stores, constructs the
//! exchange/channel adapters, and spawns every stage as its own cooperative
//! task the way the teacher's `main.rs` does ("construct everything, spawn
//! each loop"). Nothing here contains stage logic — that all lives in the
//! per-stage modules; this module only assembles them.

use std::sync::Arc;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::net::TcpListener;

use crate::channels::{FileSourceChannel, LoggingReportingChannel, ReportingChannel, SourceChannel};
use crate::config::Config;
use crate::exchange::{ExchangeClient, SymbolInfo};
use crate::executor::DualLimitExecutor;
use crate::hedge::HedgeReentryManager;
use crate::ingestion::SignalIngestion;
use crate::lifecycle::{LifecycleManager, LifecycleStore};
use crate::maintenance::Maintenance;
use crate::pyramid::PyramidManager;
use crate::reporter::Reporter;
use crate::ssot::SsotStore;
use crate::telemetry::TelemetryLogger;
use crate::watchdog::Watchdog;

/// Everything the binary needs handed back so it can run an ingestion poll
/// loop and serve the health endpoint alongside the spawned stage tasks.
pub struct App {
    pub config: Config,
    pub ssot: Arc<SsotStore>,
    pub lifecycle: Arc<LifecycleStore>,
    pub telemetry: Arc<TelemetryLogger>,
    pub exchange: Arc<dyn ExchangeClient>,
    pub ingestion: Arc<SignalIngestion>,
    pub watchdog: Arc<Watchdog>,
    pub source_channels: Vec<Arc<dyn SourceChannel>>,
    pub report_chat_id: String,
}

impl App {
    /// Opens the two stores, builds the default paper exchange, and wires
    /// every stage's dependencies. Does not start any background task —
    /// that's `spawn_stages`/`run_ingestion_loop`, called separately so a
    /// caller (or a test) can construct an `App` without starting loops.
    pub fn build(config: Config) -> anyhow::Result<Self> {
        let ssot = Arc::new(SsotStore::open(&config.ssot_db_path)?);
        let lifecycle = Arc::new(LifecycleStore::open(&config.lifecycle_db_path)?);
        let telemetry = Arc::new(TelemetryLogger::new(&config.telemetry_path, &config.bot_name, &config.env_name)?);

        let exchange = default_paper_exchange();

        let watchdog = Arc::new(Watchdog::new(ssot.clone(), lifecycle.clone(), telemetry.clone(), config.clone()));

        let ingestion = Arc::new(
            SignalIngestion::new(ssot.clone(), exchange.clone(), telemetry.clone(), config.clone())
                .with_capacity_guard(watchdog.guard()),
        );

        let report_chat_id = std::env::var("REPORT_CHAT_ID").unwrap_or_else(|_| "ops".to_string());
        let source_channels: Vec<Arc<dyn SourceChannel>> = vec![Arc::new(FileSourceChannel::new(
            "file",
            std::env::var("SOURCE_FILE_PATH").unwrap_or_else(|_| "./data/signals.jsonl".to_string()),
        ))];

        Ok(Self { config, ssot, lifecycle, telemetry, exchange, ingestion, watchdog, source_channels, report_chat_id })
    }

    /// Spawns every background stage (2, 4, 4.5, 5, 6, 7) as a cooperative
    /// task and returns immediately. Stage 1 (ingestion) is driven
    /// separately by [`App::run_ingestion_loop`] because it needs to poll
    /// `source_channels`, not just `run_forever` itself.
    pub fn spawn_stages(&self) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();

        handles.push(tokio::spawn(self.watchdog.clone().run_forever()));

        let executor = Arc::new(DualLimitExecutor::new(
            self.ssot.clone(),
            self.exchange.clone(),
            self.telemetry.clone(),
            self.config.clone(),
            format!("{}-stage2", self.config.bot_name),
        ));
        handles.push(tokio::spawn(executor.clone().run_forever()));

        let lifecycle_manager = Arc::new(LifecycleManager::new(
            self.lifecycle.clone(),
            self.ssot.clone(),
            self.exchange.clone(),
            self.telemetry.clone(),
            self.config.clone(),
        ));
        handles.push(tokio::spawn(lifecycle_manager.clone().run_forever()));

        let pyramid = Arc::new(PyramidManager::new(self.lifecycle.clone(), self.exchange.clone(), self.telemetry.clone(), self.config.clone()));
        handles.push(tokio::spawn(pyramid.run_forever()));

        let hedge = Arc::new(HedgeReentryManager::new(
            self.lifecycle.clone(),
            lifecycle_manager.clone(),
            self.ssot.clone(),
            executor.clone(),
            self.exchange.clone(),
            self.telemetry.clone(),
            self.config.clone(),
        ));
        handles.push(tokio::spawn(hedge.run_forever()));

        let maintenance = Arc::new(Maintenance::new(
            self.ssot.clone(),
            self.lifecycle.clone(),
            lifecycle_manager.clone(),
            self.exchange.clone(),
            self.telemetry.clone(),
            self.config.clone(),
        ));
        handles.push(tokio::spawn(maintenance.run_forever()));

        let reporting_channel: Arc<dyn ReportingChannel> = Arc::new(LoggingReportingChannel::new(self.telemetry.clone()));
        let reporter = Arc::new(Reporter::new(
            self.ssot.clone(),
            self.lifecycle.clone(),
            self.telemetry.clone(),
            reporting_channel,
            self.report_chat_id.clone(),
            self.config.clone(),
        ));
        handles.push(tokio::spawn(reporter.run_forever()));

        handles
    }

    /// Polls every configured source channel on a fixed interval and feeds
    /// whatever comes back through Stage 1. Runs forever; callers spawn
    /// this the same way they spawn the other stages.
    pub async fn run_ingestion_loop(self: Arc<Self>) {
        let poll = std::time::Duration::from_secs(5);
        loop {
            for channel in &self.source_channels {
                let messages = match channel.poll() {
                    Ok(m) => m,
                    Err(e) => {
                        tracing::warn!(channel = channel.name(), error = %e, "stage1: source channel poll failed");
                        continue;
                    }
                };
                for msg in messages {
                    let chat_id = msg.chat_id.clone();
                    let message_id = msg.message_id.clone();
                    match self.ingestion.ingest(msg).await {
                        Ok(decision) => tracing::info!(?decision, chat_id, message_id, "stage1: signal processed"),
                        Err(e) => tracing::error!(error = %e, chat_id, message_id, "stage1: ingest failed"),
                    }
                }
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Minimal health surface mirroring the teacher's `health_check`
    /// route in shape, not content: a single `/health` liveness check.
    pub async fn serve_health(&self, addr: std::net::SocketAddr) -> anyhow::Result<()> {
        let app = axum::Router::new()
            .route("/health", axum::routing::get(|| async { "OK" }))
            .layer(tower_http::trace::TraceLayer::new_for_http());
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(%addr, "health endpoint listening");
        axum::serve(listener, app).await?;
        Ok(())
    }
}

/// The paper exchange ships pre-seeded with BTCUSDT metadata so the crate
/// runs end to end (ingest -> dual-limit -> lifecycle -> hedge) without a
/// live exchange adapter; see DESIGN.md for why no credentialed adapter
/// ships here.
fn default_paper_exchange() -> Arc<dyn ExchangeClient> {
    let default_info = SymbolInfo {
        tick_size: dec!(0.01),
        qty_step: dec!(0.001),
        min_qty: dec!(0.001),
        max_qty: None,
    };
    let paper = crate::exchange::paper::PaperExchange::new(default_info.clone());
    paper.set_symbol_info("BTCUSDT", default_info);
    paper.set_balance(starting_balance());
    paper
}

fn starting_balance() -> Decimal {
    std::env::var("PAPER_STARTING_BALANCE")
        .ok()
        .and_then(|v| v.parse::<Decimal>().ok())
        .unwrap_or(dec!(10000))
}
