//! FlowLens collector daemon
//!
//! Boots the full pipeline: UDP collectors for NetFlow and sFlow, the
//! batch writer, the resolution worker, the classification sweep, and
//! the HTTP shim. Shutdown is coordinated through a cancellation
//! token: stop accepting flows, drain the queue, flush the stores,
//! exit.
//!
//! # Usage
//!
//! ```bash
//! # Run with defaults (NetFlow on 2055, sFlow on 6343, API on 8080)
//! cargo run --release
//!
//! # Custom ports and data directory
//! cargo run --release -- --netflow-port 9995 --data-dir /var/lib/flowlens
//! ```
//!
//! # Environment Variables
//!
//! - `FLOWLENS_CONFIG`: path to a TOML configuration file
//! - `RUST_LOG`: logging filter (default: info)
//! - `RESET_DB`: set to "true" to wipe persistent data on startup

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use flowlens::alerting::AlertEngine;
use flowlens::api::{create_app, ApiState};
use flowlens::cache::TtlCache;
use flowlens::classification::{
    ClassificationEngine, FeatureExtractor, MlClassifier,
};
use flowlens::config::{self, FlowLensConfig};
use flowlens::enrichment::{DnsEnricher, DnsResolver};
use flowlens::graph::GraphAnalytics;
use flowlens::ingestion::parsers::TemplateCache;
use flowlens::ingestion::{
    BackpressureQueue, BatchWriter, BatchWriterConfig, FlowCollector, ProtocolDispatch,
};
use flowlens::resolution::{
    AssetMapper, ChangeDetector, DependencyBuilder, FlowAggregator, GatewayInference,
    ResolutionWorker,
};
use flowlens::storage::Stores;
use flowlens::types::FlowRecord;

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "flowlens")]
#[command(about = "FlowLens flow telemetry collector and dependency graph engine")]
#[command(version)]
struct CliArgs {
    /// Path to a TOML configuration file (overrides FLOWLENS_CONFIG)
    #[arg(long)]
    config: Option<String>,

    /// Override the API bind address (default: "0.0.0.0:8080")
    #[arg(short, long)]
    addr: Option<String>,

    /// Data directory for the embedded database
    #[arg(long, default_value = "./data")]
    data_dir: String,

    /// Override the NetFlow/IPFIX UDP port
    #[arg(long)]
    netflow_port: Option<u16>,

    /// Override the sFlow UDP port
    #[arg(long)]
    sflow_port: Option<u16>,

    /// Path to an ML model weight file to activate at startup
    #[arg(long)]
    ml_model: Option<String>,

    /// Reset all persistent data on startup.
    /// WARNING: destructive and cannot be undone!
    /// Can also be set via RESET_DB=true environment variable.
    #[arg(long)]
    reset_db: bool,
}

// ============================================================================
// Database Reset
// ============================================================================

/// Check if database reset is requested via CLI flag or environment
/// variable. Accepts "true", "1", "yes" (case-insensitive).
fn should_reset_db(cli_flag: bool) -> bool {
    if cli_flag {
        return true;
    }
    if let Ok(val) = std::env::var("RESET_DB") {
        let val_lower = val.to_lowercase();
        return val_lower == "true" || val_lower == "1" || val_lower == "yes";
    }
    false
}

/// Remove the data directory and all its contents. Called BEFORE any
/// storage initialization.
fn reset_data_directory(data_dir: &str) -> Result<()> {
    let path = std::path::Path::new(data_dir);
    if path.exists() {
        warn!(path = data_dir, "RESET_DB requested — wiping persistent data");
        std::fs::remove_dir_all(path).context("Failed to remove data directory")?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = CliArgs::parse();

    if should_reset_db(args.reset_db) {
        reset_data_directory(&args.data_dir)?;
    }

    // Configuration: CLI --config beats FLOWLENS_CONFIG beats defaults
    let mut settings = match args.config {
        Some(ref path) => FlowLensConfig::from_file(std::path::Path::new(path))
            .with_context(|| format!("Failed to load config from {path}"))?,
        None => FlowLensConfig::load(),
    };
    if let Some(port) = args.netflow_port {
        settings.ingestion.netflow_port = port;
    }
    if let Some(port) = args.sflow_port {
        settings.ingestion.sflow_port = port;
    }
    if let Some(ref addr) = args.addr {
        settings.api.bind_addr = addr.clone();
    }
    settings
        .ingestion
        .validate()
        .map_err(|e| anyhow::anyhow!(e))?;
    config::init(settings);
    let settings = config::get();

    info!(
        netflow_port = settings.ingestion.netflow_port,
        sflow_port = settings.ingestion.sflow_port,
        api = %settings.api.bind_addr,
        data_dir = %args.data_dir,
        "FlowLens starting"
    );

    // ------------------------------------------------------------------
    // Shared infrastructure
    // ------------------------------------------------------------------
    let stores = Stores::open(&args.data_dir).context("Failed to open data store")?;
    let queue: Arc<BackpressureQueue<FlowRecord>> =
        Arc::new(BackpressureQueue::new(&settings.ingestion));
    let cache = Arc::new(TtlCache::new(&settings.cache));
    let templates = Arc::new(TemplateCache::new());
    let cancel = CancellationToken::new();

    // ------------------------------------------------------------------
    // Pipeline components
    // ------------------------------------------------------------------
    let mapper = Arc::new(AssetMapper::new(
        stores.assets.clone(),
        stores.classification.clone(),
    ));
    let graph = Arc::new(GraphAnalytics::new(
        stores.dependencies.clone(),
        stores.assets.clone(),
        cache.clone(),
    ));
    let aggregator = FlowAggregator::new(
        stores.flows.clone(),
        stores.aggregates.clone(),
        stores.gateways.clone(),
        &settings.resolution,
    );
    let builder = DependencyBuilder::new(
        mapper.clone(),
        stores.aggregates.clone(),
        stores.assets.clone(),
        stores.dependencies.clone(),
        stores.changes.clone(),
    );
    let gateway_inference = GatewayInference::new(mapper.clone(), stores.gateways.clone());
    let detector = ChangeDetector::new(
        stores.dependencies.clone(),
        stores.assets.clone(),
        stores.changes.clone(),
        &settings.resolution,
    );
    let alert_engine = AlertEngine::new(stores.changes.clone(), stores.assets.clone());
    let worker = ResolutionWorker::new(
        stores.clone(),
        aggregator,
        builder,
        gateway_inference,
        detector,
        alert_engine,
        graph,
        settings.resolution.clone(),
    );
    let worker_stats = worker.stats.clone();

    let ml = Arc::new(MlClassifier::new());
    if let Some(ref model_path) = args.ml_model {
        match MlClassifier::load_weights(std::path::Path::new(model_path)) {
            Ok(weights) => {
                ml.activate(weights)
                    .map_err(|e| anyhow::anyhow!("Model activation failed: {e}"))?;
            }
            Err(e) => warn!(path = %model_path, error = %e, "ML model not loaded — heuristics only"),
        }
    }
    let classifier = ClassificationEngine::new(
        stores.assets.clone(),
        stores.classification.clone(),
        FeatureExtractor::new(stores.aggregates.clone()),
        ml,
        settings.classification.clone(),
    );

    // ------------------------------------------------------------------
    // Task spawn
    // ------------------------------------------------------------------
    let mut tasks: JoinSet<()> = JoinSet::new();

    let netflow = FlowCollector::new(
        settings.ingestion.netflow_port,
        ProtocolDispatch::netflow(templates),
        queue.clone(),
        settings.ingestion.discard_external_flows,
    );
    let netflow_cancel = cancel.clone();
    tasks.spawn(async move {
        if let Err(e) = netflow.run(netflow_cancel).await {
            error!(error = %e, "NetFlow collector exited with error");
        }
    });

    let sflow = FlowCollector::new(
        settings.ingestion.sflow_port,
        ProtocolDispatch::sflow(),
        queue.clone(),
        settings.ingestion.discard_external_flows,
    );
    let sflow_cancel = cancel.clone();
    tasks.spawn(async move {
        if let Err(e) = sflow.run(sflow_cancel).await {
            error!(error = %e, "sFlow collector exited with error");
        }
    });

    let writer = BatchWriter::new(
        queue.clone(),
        stores.flows.clone(),
        BatchWriterConfig {
            batch_size: settings.ingestion.batch_size,
            batch_timeout: Duration::from_millis(settings.ingestion.batch_timeout_ms),
        },
    );
    let writer_cancel = cancel.clone();
    tasks.spawn(writer.run(writer_cancel));

    let worker_cancel = cancel.clone();
    tasks.spawn(worker.run(worker_cancel));

    // Reverse-DNS enrichment
    let enricher = DnsEnricher::new(
        stores.assets.clone(),
        Arc::new(DnsResolver::new(&settings.enrichment)),
    );
    tasks.spawn(enricher.run(cancel.clone()));

    // Periodic cache cleanup
    let cleanup_cache = cache.clone();
    let cleanup_cancel = cancel.clone();
    let cleanup_interval = Duration::from_secs(settings.cache.cleanup_interval_secs.max(1));
    tasks.spawn(async move {
        let mut ticker = tokio::time::interval(cleanup_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                () = cleanup_cancel.cancelled() => break,
                _ = ticker.tick() => {
                    cleanup_cache.cleanup_expired(std::time::Instant::now());
                }
            }
        }
    });

    // Classification sweep on its own ticker
    let classify_cancel = cancel.clone();
    let classify_interval =
        Duration::from_secs(settings.classification.interval_minutes.max(1) * 60);
    tasks.spawn(async move {
        let mut ticker = tokio::time::interval(classify_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                () = classify_cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match classifier.run_sweep(chrono::Utc::now()) {
                        Ok((applied, examined)) if examined > 0 => {
                            info!(applied = applied, examined = examined, "Classification sweep complete");
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "Classification sweep failed"),
                    }
                }
            }
        }
    });

    // HTTP shim
    let api_state = ApiState::new(stores.clone(), queue.clone(), cache, worker_stats);
    let app = create_app(api_state);
    let listener = tokio::net::TcpListener::bind(&settings.api.bind_addr)
        .await
        .with_context(|| format!("Failed to bind API on {}", settings.api.bind_addr))?;
    info!(addr = %settings.api.bind_addr, "API listening");
    let api_cancel = cancel.clone();
    tasks.spawn(async move {
        let shutdown = async move { api_cancel.cancelled().await };
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
        {
            error!(error = %e, "API server exited with error");
        }
    });

    // ------------------------------------------------------------------
    // Shutdown: stop accepting → drain queue → flush stores → exit
    // ------------------------------------------------------------------
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received — draining pipeline");
    cancel.cancel();

    while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
            error!(error = %e, "Task join failed during shutdown");
        }
    }

    stores.flush().context("Final store flush failed")?;
    info!("FlowLens stopped");
    Ok(())
}
