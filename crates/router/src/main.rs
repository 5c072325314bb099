//! Handoff Decode Router - Main Entry Point
//!
//! Routes finished prefills to the least-loaded decode worker and forwards
//! the decode requests that follow.

use anyhow::Context;
use clap::Parser;
use handoff_common::config::{parse_worker_list, ObservabilityConfig};
use handoff_common::{RouterConfig, TieBreak};
use handoff_router::DecodeRouter;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Decode router for prefill/decode disaggregated serving
#[derive(Parser, Debug)]
#[command(name = "handoff-router", version)]
struct Cli {
    /// YAML configuration file
    #[arg(long, env = "HANDOFF_CONFIG")]
    config: Option<PathBuf>,

    /// Host address to bind to
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on
    #[arg(long)]
    port: Option<u16>,

    /// Comma-separated decode worker URLs (e.g. http://worker1:8001,http://worker2:8002)
    #[arg(long)]
    worker_urls: Option<String>,

    /// Ordering among equally loaded workers: first_registered or lowest_id
    #[arg(long, value_parser = parse_tie_break)]
    tie_break: Option<TieBreak>,

    /// Seconds before an unclaimed reservation is released
    #[arg(long)]
    reservation_ttl_secs: Option<u64>,

    /// Timeout for decode worker calls in seconds
    #[arg(long)]
    request_timeout_secs: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Emit JSON log lines
    #[arg(long)]
    json_logs: bool,
}

fn parse_tie_break(raw: &str) -> Result<TieBreak, String> {
    raw.parse().map_err(|e: handoff_common::RouterError| e.to_string())
}

impl Cli {
    /// Apply command-line overrides on top of file and environment configuration
    fn apply(self, config: &mut RouterConfig) {
        if let Some(host) = self.host {
            config.bind_address = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(workers) = self.worker_urls {
            config.worker_urls = parse_worker_list(&workers);
        }
        if let Some(tie_break) = self.tie_break {
            config.selection.tie_break = tie_break;
        }
        if let Some(ttl) = self.reservation_ttl_secs {
            config.reservation.ttl_secs = ttl;
        }
        if let Some(timeout) = self.request_timeout_secs {
            config.upstream.request_timeout_secs = timeout;
        }
        if let Some(level) = self.log_level {
            config.observability.log_level = level;
        }
        if self.json_logs {
            config.observability.structured_logging = true;
        }
    }
}

fn init_logging(observability: &ObservabilityConfig) {
    let level = &observability.log_level;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("handoff_router={level},handoff_common={level},tower_http=info,axum=info").into()
    });

    let registry = tracing_subscriber::registry().with(filter);
    if observability.structured_logging {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config =
        RouterConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    cli.apply(&mut config);
    config.validate().context("Invalid configuration")?;

    init_logging(&config.observability);
    info!("Starting Handoff decode router");
    info!(
        "Configuration loaded: bind={}:{}, workers={:?}, reservation ttl={}s",
        config.bind_address,
        config.port,
        config.worker_addresses(),
        config.reservation.ttl_secs
    );

    let router = Arc::new(DecodeRouter::from_config(&config)?);

    // Start lease sweeper task
    let sweeper_handle = router.clone().start_lease_sweeper(config.sweep_interval());

    let addr = format!("{}:{}", config.bind_address, config.port);
    let server = handoff_router::serve(router, &addr, config.observability.enable_metrics);

    info!("Handoff decode router running");

    // Wait for shutdown signal
    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server => {
            result?;
        }
        result = sweeper_handle => {
            result?;
        }
    }

    info!("Handoff decode router shutdown complete");
    Ok(())
}
