//! Complete-set maker entry point.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use complete_set_maker::api::{create_router, AppState};
use complete_set_maker::config::Config;
use complete_set_maker::engine::{Collaborators, Engine};
use complete_set_maker::exchange::paper::SyntheticMarkets;
use complete_set_maker::exchange::{PaperConfig, PaperExchange};
use complete_set_maker::metrics;
use complete_set_maker::utils::shutdown_signal;

/// Complete-set maker for short-window binary markets.
#[derive(Parser, Debug)]
#[command(name = "complete-set-maker")]
#[command(about = "Buys both legs of binary markets below $1 and redeems at resolution")]
#[command(version)]
struct Args {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON.
    #[arg(long, global = true)]
    json_logs: bool,

    /// HTTP server port for health/status/metrics (overrides PORT).
    #[arg(short, long, global = true)]
    port: Option<u16>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the engine against the paper exchange with the status server (default).
    Run,

    /// Check configuration validity.
    CheckConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    // Initialize logging
    let filter = if args.verbose {
        EnvFilter::new("complete_set_maker=debug,info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let registry = tracing_subscriber::registry().with(filter);
    if args.json_logs {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }

    match args.command {
        Some(Command::CheckConfig) => cmd_check_config(),
        Some(Command::Run) | None => cmd_run(args.port).await,
    }
}

/// Check configuration validity.
fn cmd_check_config() -> anyhow::Result<()> {
    println!("======================================================================");
    println!("COMPLETE-SET MAKER - CONFIGURATION CHECK");
    println!("======================================================================");

    print!("Loading configuration... ");
    let config = match Config::load() {
        Ok(c) => {
            println!("OK");
            c
        }
        Err(e) => {
            println!("FAILED");
            println!("  Error: {}", e);
            return Err(anyhow::anyhow!("Configuration load failed"));
        }
    };

    print!("Validating configuration... ");
    match config.validate() {
        Ok(()) => println!("OK"),
        Err(e) => {
            println!("FAILED");
            println!("  Error: {}", e);
            return Err(anyhow::anyhow!("Configuration validation failed"));
        }
    }

    println!("----------------------------------------------------------------------");
    println!("Configuration Summary:");
    println!("  Bid Price: ${} per leg", config.bid_price);
    println!("  Pair Cost: ${} at {} shares", config.pair_cost(config.position_size), config.position_size);
    println!("  Max Open Sets: {}", config.max_open_sets);
    println!("  Max Exposure: ${}", config.max_exposure);
    println!("  Max Daily Loss: ${}", config.max_daily_loss);
    println!(
        "  Loss Streak: {} losses -> x{}",
        config.loss_streak_threshold, config.size_reduction_factor
    );
    println!("  Resolution Poll: {}ms", config.resolution_poll_interval_ms);
    println!("  Redemption Grace: {}s", config.redemption_grace_seconds);
    println!("  Dry Run: {}", config.dry_run);
    println!("======================================================================");
    println!("CONFIGURATION CHECK PASSED");
    println!("======================================================================");

    Ok(())
}

/// Run the engine with the HTTP status server until interrupted.
async fn cmd_run(port_override: Option<u16>) -> anyhow::Result<()> {
    info!("Loading configuration...");
    let mut config = Config::load().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;
    if let Some(port) = port_override {
        config.port = port;
    }

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        return Err(anyhow::anyhow!("Configuration validation failed: {}", e));
    }
    if !config.dry_run {
        error!("Live trading transport is not available; set DRY_RUN=true");
        return Err(anyhow::anyhow!("live mode refused"));
    }

    // Initialize metrics
    let prometheus = PrometheusBuilder::new().install_recorder()?;
    metrics::init_metrics();

    info!("Mode: PAPER");
    info!("Bid price: ${} per leg, size {}", config.bid_price, config.position_size);

    let exchange = Arc::new(PaperExchange::new(PaperConfig {
        auto_fill: config.paper_auto_fill,
        auto_resolve_after_seconds: Some(config.paper_resolve_after_seconds),
        synthetic: Some(SyntheticMarkets {
            window_seconds: config.paper_window_seconds,
            ..SyntheticMarkets::default()
        }),
        latency_ms: 0,
    }));
    let port = config.port;
    let engine = Arc::new(Engine::new(config, Collaborators::paper(&exchange))?);

    let app_state = AppState::new(engine.clone()).with_metrics(prometheus);

    // Start HTTP server
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!("HTTP server listening on {}", addr);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let router = create_router(app_state.clone());
    let mut server_shutdown = shutdown_rx.clone();
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = server_shutdown.wait_for(|stop| *stop).await;
            })
            .await
    });

    let restored = engine.restore().await?;
    info!(positions = restored.positions, orders = restored.orders, "Startup restore complete");
    app_state.set_ready(true);

    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    engine.clone().run(shutdown_rx).await?;

    match server_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("HTTP server error: {}", e),
        Err(e) => warn!("HTTP server task failed: {}", e),
    }

    let pnl = engine.pnl_summary();
    info!(
        redeemed = pnl.redeemed,
        open = pnl.open,
        realized_pnl = %pnl.realized_pnl,
        "Shutdown complete"
    );
    Ok(())
}
