// =============================================================================
// Arbitrage Engine — top-level supervisor for the monitor → detect → gate →
// execute path
// =============================================================================
//
// One scan round:
//   1. Take the latest spread round from the monitor; nothing -> sleep.
//   2. Rank opportunities through the detector; record all survivors.
//   3. Consult the circuit breaker (soft pause) and the risk gate for the
//      top opportunity.
//   4. Reserve -> execute -> update ledger -> persist trade -> release.
//
// At most one arbitrage runs per round; the min-interval cap plus the
// single-consumer loop guarantee at most one in flight overall. No error
// escapes the loop: the outermost scope logs and continues next interval.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::circuit_breaker::CircuitBreaker;
use crate::runtime_config::RuntimeConfig;
use crate::store::Store;
use crate::types::OrderSide;

use super::execution::ExecutionCoordinator;
use super::opportunity_detector::OpportunityDetector;
use super::position_ledger::PositionLedger;
use super::risk_gate::ArbitrageRiskGate;
use super::spread_monitor::SpreadMonitor;
use super::{ArbitrageOpportunity, ArbitrageTrade};

/// Deadline for background loops to unwind on stop.
const JOIN_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineStats {
    pub total_opportunities: u64,
    pub total_executions: u64,
    pub successful_executions: u64,
    pub failed_executions: u64,
    pub total_pnl: f64,
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub running: bool,
    pub paused: bool,
    pub stats: EngineStats,
    pub success_rate: f64,
    pub runtime_seconds: f64,
}

pub struct ArbitrageEngine {
    symbol: String,
    scan_interval: Duration,
    position_size: f64,
    initial_balance: f64,

    monitor: Arc<SpreadMonitor>,
    detector: Arc<OpportunityDetector>,
    gate: Arc<ArbitrageRiskGate>,
    coordinator: Arc<ExecutionCoordinator>,
    ledger: Arc<PositionLedger>,
    breaker: Arc<CircuitBreaker>,
    store: Arc<Store>,

    running: AtomicBool,
    paused: AtomicBool,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    stats: RwLock<EngineStats>,
}

impl ArbitrageEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &RuntimeConfig,
        monitor: Arc<SpreadMonitor>,
        detector: Arc<OpportunityDetector>,
        gate: Arc<ArbitrageRiskGate>,
        coordinator: Arc<ExecutionCoordinator>,
        ledger: Arc<PositionLedger>,
        breaker: Arc<CircuitBreaker>,
        store: Arc<Store>,
    ) -> Self {
        info!(
            symbol = %config.arbitrage.arbitrage_symbol,
            scan_interval_s = config.arbitrage.opportunity_scan_interval,
            position_size = config.arbitrage.arbitrage_position_size,
            "arbitrage engine initialised"
        );
        Self {
            symbol: config.arbitrage.arbitrage_symbol.clone(),
            scan_interval: Duration::from_secs_f64(config.arbitrage.opportunity_scan_interval),
            position_size: config.arbitrage.arbitrage_position_size,
            initial_balance: config.breaker.initial_balance,
            monitor,
            detector,
            gate,
            coordinator,
            ledger,
            breaker,
            store,
            running: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            shutdown: Mutex::new(None),
            handles: Mutex::new(Vec::new()),
            stats: RwLock::new(EngineStats::default()),
        }
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Spawn the monitor loop and the engine loop. A second call is a no-op.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("arbitrage engine already running");
            return;
        }

        self.paused.store(false, Ordering::SeqCst);
        self.stats.write().started_at = Some(Utc::now());

        let (tx, rx) = watch::channel(false);
        *self.shutdown.lock() = Some(tx);

        let monitor_handle = tokio::spawn(self.monitor.clone().run(rx.clone()));
        let engine = self.clone();
        let engine_handle = tokio::spawn(engine.engine_loop(rx));

        let mut handles = self.handles.lock();
        handles.push(monitor_handle);
        handles.push(engine_handle);

        info!("arbitrage engine started");
    }

    /// Signal both loops and join them with a deadline. A second call is a
    /// no-op.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            warn!("arbitrage engine not running");
            return;
        }

        if let Some(tx) = self.shutdown.lock().take() {
            let _ = tx.send(true);
        }

        let handles: Vec<JoinHandle<()>> = self.handles.lock().drain(..).collect();
        for handle in handles {
            if tokio::time::timeout(JOIN_DEADLINE, handle).await.is_err() {
                error!("background loop did not stop within the join deadline");
            }
        }

        info!("arbitrage engine stopped");
    }

    /// Skip scan rounds without stopping the loops.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        info!("arbitrage engine paused");
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        info!("arbitrage engine resumed");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst) && !self.paused.load(Ordering::SeqCst)
    }

    async fn engine_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(interval_s = self.scan_interval.as_secs_f64(), "engine loop started");
        let mut interval = tokio::time::interval(self.scan_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    // Nothing may escape the loop: log and continue.
                    if let Err(e) = self.scan_once().await {
                        error!(error = %e, "engine scan failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("engine loop stopped");
    }

    // -------------------------------------------------------------------------
    // One scan
    // -------------------------------------------------------------------------

    /// One full evaluation round. Public so tests can drive the engine
    /// without the background loop.
    pub async fn scan_once(&self) -> anyhow::Result<()> {
        if self.paused.load(Ordering::SeqCst) {
            return Ok(());
        }

        let spreads = self.monitor.latest_spreads();
        if spreads.is_empty() {
            debug!("no spreads this round");
            return Ok(());
        }

        let opportunities = self
            .detector
            .detect_opportunities(&spreads, self.position_size)
            .await;
        if opportunities.is_empty() {
            return Ok(());
        }

        self.stats.write().total_opportunities += opportunities.len() as u64;
        info!(count = opportunities.len(), "opportunities detected");

        // Record every survivor for later analysis, best-effort.
        if let Err(e) = self.store.insert_opportunities(&opportunities) {
            error!(error = %e, "failed to persist opportunities");
        }

        let best = &opportunities[0];
        info!(opportunity = %best, "best opportunity this round");

        // Circuit breaker is a soft pause: keep scanning, skip execution.
        let (allowed, reason) = self.breaker.check_trading_allowed();
        if !allowed {
            info!(reason = %reason, "execution skipped by circuit breaker");
            return Ok(());
        }

        let (permitted, reason) = self
            .gate
            .can_execute_arbitrage(best, self.position_size)
            .await;
        if !permitted {
            info!(reason = %reason, "opportunity rejected by risk gate");
            return Ok(());
        }

        self.execute_opportunity(best).await;
        Ok(())
    }

    async fn execute_opportunity(&self, opportunity: &ArbitrageOpportunity) {
        self.gate.record_arbitrage_start(opportunity, self.position_size);

        let trade = self
            .coordinator
            .execute_arbitrage(opportunity, self.position_size)
            .await;

        // Reservation is released on every terminal state, FAILED included.
        self.gate
            .record_arbitrage_complete(opportunity, self.position_size);

        self.apply_trade_outcome(&trade, opportunity);
    }

    /// Fold a terminal trade into stats, ledger, breaker, and the store.
    fn apply_trade_outcome(&self, trade: &ArbitrageTrade, opportunity: &ArbitrageOpportunity) {
        {
            let mut stats = self.stats.write();
            stats.total_executions += 1;
            if trade.is_completed() {
                stats.successful_executions += 1;
                stats.total_pnl += trade.actual_pnl.unwrap_or(0.0);
            } else {
                stats.failed_executions += 1;
            }
        }

        // Every successfully filled leg moves the ledger, even on a trade
        // that ultimately failed.
        if let Some(buy) = trade.buy_order.as_ref().filter(|o| o.has_fill()) {
            self.ledger.update(
                &opportunity.buy_venue,
                &self.symbol,
                buy.filled_qty.unwrap_or(0.0),
                OrderSide::Buy,
            );
        }
        if let Some(sell) = trade.sell_order.as_ref().filter(|o| o.has_fill()) {
            self.ledger.update(
                &opportunity.sell_venue,
                &self.symbol,
                sell.filled_qty.unwrap_or(0.0),
                OrderSide::Sell,
            );
        }

        if trade.is_completed() {
            let pnl = trade.actual_pnl.unwrap_or(0.0);
            let balance_estimate = self.initial_balance + self.stats.read().total_pnl;
            self.breaker.record_trade(pnl, balance_estimate);
            info!(pnl, "arbitrage completed");
        } else {
            error!(reason = ?trade.failure_reason, "arbitrage failed");
        }

        // The in-memory outcome stands even if persistence fails.
        if let Err(e) = self.store.insert_trade(trade) {
            error!(error = %e, trade_id = %trade.id, "failed to persist trade");
        }
    }

    // -------------------------------------------------------------------------
    // Introspection
    // -------------------------------------------------------------------------

    pub fn status(&self) -> EngineStatus {
        let stats = self.stats.read().clone();
        let success_rate = if stats.total_executions > 0 {
            stats.successful_executions as f64 / stats.total_executions as f64
        } else {
            0.0
        };
        let runtime_seconds = stats
            .started_at
            .map(|at| (Utc::now() - at).num_milliseconds() as f64 / 1000.0)
            .unwrap_or(0.0);

        EngineStatus {
            running: self.running.load(Ordering::SeqCst),
            paused: self.paused.load(Ordering::SeqCst),
            stats,
            success_rate,
            runtime_seconds,
        }
    }
}

impl std::fmt::Debug for ArbitrageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArbitrageEngine")
            .field("symbol", &self.symbol)
            .field("running", &self.running.load(Ordering::SeqCst))
            .field("paused", &self.paused.load(Ordering::SeqCst))
            .finish()
    }
}
