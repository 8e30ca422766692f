//! signalbot — turns text signals into a durable, idempotent sequence of
//! exchange orders and lifecycle actions.
//!
//! CLI/environment loading beyond this thin entry point (startup checks,
//! full config-file support) is out of scope per spec.md §1 — this binary
//! wires `Config::from_env` straight into `App`, the same shape the
//! teacher's `main()` uses for its own env-driven startup.

use std::net::SocketAddr;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use signalbot_backend::app::App;
use signalbot_backend::config::Config;

/// Signal-to-execution trading agent core.
#[derive(Parser, Debug)]
#[command(name = "signalbot", version, about)]
struct Cli {
    /// Run one ingestion/maintenance pass and exit instead of serving forever.
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing();

    tracing::info!("signalbot starting up");

    let config = Config::from_env().context("loading configuration")?;
    let app = App::build(config).context("wiring application components")?;

    tracing::info!(
        ssot_db = %app.config.ssot_db_path,
        lifecycle_db = %app.config.lifecycle_db_path,
        telemetry = %app.config.telemetry_path,
        "stores opened"
    );

    if cli.once {
        tracing::info!("--once: running a single ingestion pass then exiting");
        for channel in &app.source_channels {
            for msg in channel.poll().unwrap_or_default() {
                let _ = app.ingestion.ingest(msg).await;
            }
        }
        return Ok(());
    }

    let mut handles = app.spawn_stages();
    let app = std::sync::Arc::new(app);
    handles.push(tokio::spawn(app.clone().run_ingestion_loop()));

    let health_addr: SocketAddr = format!("0.0.0.0:{}", app.config.health_port)
        .parse()
        .context("parsing health bind address")?;
    let health_app = app.clone();
    handles.push(tokio::spawn(async move {
        if let Err(e) = health_app.serve_health(health_addr).await {
            tracing::error!(error = %e, "health endpoint exited");
        }
    }));

    tracing::info!(port = app.config.health_port, "signalbot running");

    tokio::signal::ctrl_c().await.ok();
    tracing::info!("shutdown signal received, exiting");

    for handle in handles {
        handle.abort();
    }
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "signalbot_backend=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
