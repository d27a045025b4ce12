// =============================================================================
// Meridian Cross-Exchange Engine — Main Entry Point
// =============================================================================
//
// The engine starts with execution paused unless the saved config says
// trading_mode = Live. Flip the mode in runtime_config.json and restart to
// go live.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod advisor;
mod arbitrage;
mod circuit_breaker;
mod config_rollback;
mod pipeline;
mod runtime_config;
mod store;
mod types;
mod venue;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::advisor::guardrails::AdvisorGuardrails;
use crate::advisor::HttpAdvisorClient;
use crate::arbitrage::engine::ArbitrageEngine;
use crate::arbitrage::execution::ExecutionCoordinator;
use crate::arbitrage::opportunity_detector::OpportunityDetector;
use crate::arbitrage::position_ledger::PositionLedger;
use crate::arbitrage::risk_gate::ArbitrageRiskGate;
use crate::arbitrage::spread_monitor::SpreadMonitor;
use crate::circuit_breaker::CircuitBreaker;
use crate::config_rollback::ConfigRollbackManager;
use crate::pipeline::runner::{PipelineService, SignalPipeline};
use crate::pipeline::shadow::ShadowRecorder;
use crate::runtime_config::RuntimeConfig;
use crate::store::Store;
use crate::types::TradingMode;
use crate::venue::registry::{VenueCredentials, VenueRegistry};

/// Path of the hot-reloadable runtime config.
const CONFIG_PATH: &str = "runtime_config.json";
/// Directory holding timestamped config backups for auto-rollback.
const CONFIG_BACKUP_DIR: &str = "config_backups";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Meridian Cross-Exchange Engine — Starting         ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut config = RuntimeConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        RuntimeConfig::default()
    });

    // Override symbol and venue set from env if provided.
    if let Ok(symbol) = std::env::var("MERIDIAN_SYMBOL") {
        config.arbitrage.arbitrage_symbol = symbol.trim().to_uppercase();
    }
    if let Ok(venues) = std::env::var("MERIDIAN_VENUES") {
        config.arbitrage.arbitrage_exchanges = venues
            .split(',')
            .map(|v| v.trim().to_lowercase())
            .filter(|v| !v.is_empty())
            .collect();
    }

    let live = config.trading_mode == TradingMode::Live;
    info!(
        symbol = %config.arbitrage.arbitrage_symbol,
        venues = ?config.arbitrage.arbitrage_exchanges,
        trading_mode = %config.trading_mode,
        "Configured"
    );
    if !live {
        warn!("Execution is PAUSED (trading_mode != Live): evaluating only");
    }

    // ── 2. Store ─────────────────────────────────────────────────────────
    let db_path =
        std::env::var("MERIDIAN_DB_PATH").unwrap_or_else(|_| "meridian.db".to_string());
    let store = Arc::new(Store::open(&db_path)?);

    // ── 3. Venue registry ────────────────────────────────────────────────
    let credentials: HashMap<String, VenueCredentials> = config
        .arbitrage
        .arbitrage_exchanges
        .iter()
        .map(|venue| (venue.clone(), VenueCredentials::from_env(venue)))
        .collect();
    let active = config
        .arbitrage
        .arbitrage_exchanges
        .first()
        .cloned()
        .unwrap_or_else(|| "bitget".to_string());
    let registry = Arc::new(VenueRegistry::initialize(credentials, &active).await?);

    // ── 4. Arbitrage components ──────────────────────────────────────────
    let monitor = Arc::new(SpreadMonitor::new(
        registry.clone(),
        store.clone(),
        config.arbitrage.arbitrage_symbol.clone(),
        config.arbitrage.arbitrage_exchanges.clone(),
        Duration::from_secs_f64(config.arbitrage.monitor_interval),
        config.arbitrage.spread_history_size,
    ));
    let detector = Arc::new(OpportunityDetector::new(registry.clone(), &config));
    let gate = Arc::new(ArbitrageRiskGate::new(registry.clone(), &config));
    let coordinator = Arc::new(ExecutionCoordinator::new(
        registry.clone(),
        config.execution.clone(),
    ));
    let ledger = Arc::new(PositionLedger::new(registry.clone()));
    let breaker = Arc::new(CircuitBreaker::new(store.clone(), config.breaker.clone()));

    let engine = Arc::new(ArbitrageEngine::new(
        &config,
        monitor.clone(),
        detector,
        gate,
        coordinator,
        ledger.clone(),
        breaker.clone(),
        store.clone(),
    ));

    // ── 5. Signal pipeline (advisor + shadow recorder) ───────────────────
    let advisor_endpoint = std::env::var("MERIDIAN_ADVISOR_URL")
        .unwrap_or_else(|_| "https://api.anthropic.com/v1/messages".to_string());
    let advisor_key = std::env::var("MERIDIAN_ADVISOR_API_KEY").unwrap_or_default();
    let advisor_model = std::env::var("MERIDIAN_ADVISOR_MODEL")
        .unwrap_or_else(|_| "claude-sonnet-4-20250514".to_string());
    let advisor_client = Arc::new(HttpAdvisorClient::new(
        advisor_endpoint,
        advisor_key,
        advisor_model,
    ));
    let guardrails = Arc::new(AdvisorGuardrails::new(
        advisor_client,
        config.guardrails.clone(),
    ));
    let shadow = Arc::new(ShadowRecorder::new(store.clone()));
    let signal_pipeline = Arc::new(SignalPipeline::new(
        guardrails.clone(),
        shadow,
        config.pipeline.clone(),
    ));
    let pipeline_service = Arc::new(PipelineService::new(
        signal_pipeline,
        registry.clone(),
        config.arbitrage.arbitrage_symbol.clone(),
        config.pipeline.base_position_pct,
        live,
    ));

    // External strategies push (signal, snapshot) pairs into this channel;
    // the service records a decision per pair and routes accepted ones.
    let (signal_tx, signal_rx) =
        tokio::sync::mpsc::channel::<(pipeline::TradeSignal, pipeline::MarketSnapshot)>(64);
    let (pipeline_shutdown_tx, pipeline_shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(pipeline_service.clone().run(signal_rx, pipeline_shutdown_rx));
    // Keep the sender alive for strategy processes attaching at runtime.
    let _signal_tx = signal_tx;

    // ── 6. Config rollback manager ───────────────────────────────────────
    let rollback = Arc::new(ConfigRollbackManager::new(
        store.clone(),
        CONFIG_BACKUP_DIR,
        CONFIG_PATH,
        config.breaker.initial_balance,
    ));

    // ── 7. Start the arbitrage engine ────────────────────────────────────
    engine.start();
    if !live {
        engine.pause();
    }

    // ── 8. Reconciliation + daily reset loop ─────────────────────────────
    let recon_ledger = ledger.clone();
    let recon_breaker = breaker.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        let mut current_date = chrono::Utc::now().date_naive();
        loop {
            interval.tick().await;

            let drifts = recon_ledger.reconcile().await;
            let drifting = drifts.iter().filter(|d| d.drift.abs() > 1e-9).count();
            if drifting > 0 {
                warn!(entries = drifting, "ledger drift reported, operator review needed");
            }

            let today = chrono::Utc::now().date_naive();
            if today > current_date {
                current_date = today;
                recon_breaker.reset_daily();
            }
        }
    });

    // ── 9. Performance audit loop (config auto-rollback) ─────────────────
    let audit_store = store.clone();
    let audit_rollback = rollback.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(3600));
        loop {
            interval.tick().await;
            match audit_store.recent_completed_pnls(50) {
                Ok(pnls) => {
                    if audit_rollback.check_performance_and_rollback(&pnls) {
                        error!("config rolled back, restart required to apply");
                    }
                }
                Err(e) => error!(error = %e, "performance audit query failed"),
            }
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 10. Graceful shutdown ────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    engine.stop().await;
    let _ = pipeline_shutdown_tx.send(true);
    registry.disconnect_all().await;

    if let Err(e) = config.save(CONFIG_PATH) {
        error!(error = %e, "Failed to save runtime config on shutdown");
    }

    info!("Meridian Cross-Exchange Engine shut down complete.");
    Ok(())
}
