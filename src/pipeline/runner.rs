// =============================================================================
// Signal Pipeline — staged accept/reject chain with shadow recording
// =============================================================================
//
// Stage order: strategy -> trend filter -> advisor -> execution filter.
//
// In shadow mode every stage runs regardless of earlier rejections so the
// counterfactual pipelines can be compared; in live mode the chain
// short-circuits on the first rejection for latency. Both modes emit
// exactly one decision row with each stage's would-execute outcome and a
// single rejection_stage naming the first failure.
// =============================================================================

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::advisor::guardrails::AdvisorGuardrails;
use crate::advisor::{AdvisorDecision, AdvisorRequest};
use crate::runtime_config::PipelineParams;

use super::filters::{execution_filter, trend_filter};
use super::shadow::ShadowRecorder;
use super::{
    MarketSnapshot, PipelineOutcome, ShadowDecisionRow, SignalKind, StageVerdict, TradeSignal,
};

pub struct SignalPipeline {
    guardrails: Arc<AdvisorGuardrails>,
    shadow: Arc<ShadowRecorder>,
    params: PipelineParams,
    last_accepted_at: Mutex<Option<DateTime<Utc>>>,
}

impl SignalPipeline {
    pub fn new(
        guardrails: Arc<AdvisorGuardrails>,
        shadow: Arc<ShadowRecorder>,
        params: PipelineParams,
    ) -> Self {
        info!(
            shadow_mode = params.enable_shadow_mode,
            "signal pipeline initialised"
        );
        Self {
            guardrails,
            shadow,
            params,
            last_accepted_at: Mutex::new(None),
        }
    }

    /// Run one signal through the full chain and record the decision.
    pub async fn evaluate(
        &self,
        signal: &TradeSignal,
        snapshot: &MarketSnapshot,
    ) -> PipelineOutcome {
        let trade_id = Uuid::new_v4().to_string();
        let shadow_mode = self.params.enable_shadow_mode;

        // ── Stage 1: strategy ────────────────────────────────────────────
        let strategy_pass = signal.kind != SignalKind::Neutral;
        let strategy_verdict = if strategy_pass {
            StageVerdict::pass(format!("{} signal present", signal.kind.as_str()))
        } else {
            StageVerdict::fail("neutral signal")
        };

        // ── Stage 2: trend filter ────────────────────────────────────────
        let trend_verdict = if shadow_mode || strategy_pass {
            trend_filter(signal, snapshot)
        } else {
            StageVerdict::skipped()
        };
        let after_trend = strategy_pass && trend_verdict.pass;

        // ── Stage 3: advisor ─────────────────────────────────────────────
        let advisor: Option<AdvisorDecision> = if shadow_mode || after_trend {
            let request = AdvisorRequest {
                strategy: signal.strategy.clone(),
                signal: signal.kind.as_str().to_string(),
                strength: signal.strength,
                confidence: signal.confidence,
                price: snapshot.price,
                indicators: snapshot.indicators,
            };
            Some(self.guardrails.assess(&request).await)
        } else {
            None
        };
        let advisor_pass = advisor.as_ref().map(|d| d.execute).unwrap_or(false);
        let after_advisor = after_trend && advisor_pass;

        // ── Stage 4: execution filter ────────────────────────────────────
        let seconds_since_last = self
            .last_accepted_at
            .lock()
            .map(|at| (Utc::now() - at).num_seconds().max(0) as u64);
        let exec_verdict = if shadow_mode || after_advisor {
            execution_filter(snapshot, &self.params, seconds_since_last)
        } else {
            StageVerdict::skipped()
        };
        let after_exec = after_advisor && exec_verdict.pass;

        let final_would_execute = after_exec;

        // First failing stage wins the rejection label.
        let (rejection_stage, rejection_reason) = if !strategy_pass {
            ("strategy", strategy_verdict.reason.clone())
        } else if !trend_verdict.pass {
            ("trend", trend_verdict.reason.clone())
        } else if !advisor_pass {
            (
                "advisor",
                advisor
                    .as_ref()
                    .map(|d| d.reason.clone())
                    .unwrap_or_else(|| "advisor rejected".to_string()),
            )
        } else if !exec_verdict.pass {
            ("exec", exec_verdict.reason.clone())
        } else {
            ("", String::new())
        };

        if final_would_execute {
            *self.last_accepted_at.lock() = Some(Utc::now());
        }

        let row = self.build_row(
            &trade_id,
            signal,
            snapshot,
            strategy_pass,
            &trend_verdict,
            advisor.as_ref(),
            after_trend,
            after_advisor,
            &exec_verdict,
            after_exec,
            rejection_stage,
            &rejection_reason,
        );
        self.shadow.record_decision(&row);

        debug!(
            trade_id = %trade_id,
            accepted = final_would_execute,
            rejection_stage,
            "pipeline decision"
        );

        PipelineOutcome {
            trade_id,
            accepted: final_would_execute,
            rejection_stage: rejection_stage.to_string(),
            rejection_reason,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn build_row(
        &self,
        trade_id: &str,
        signal: &TradeSignal,
        snapshot: &MarketSnapshot,
        strategy_pass: bool,
        trend_verdict: &StageVerdict,
        advisor: Option<&AdvisorDecision>,
        after_trend: bool,
        after_advisor: bool,
        exec_verdict: &StageVerdict,
        after_exec: bool,
        rejection_stage: &str,
        rejection_reason: &str,
    ) -> ShadowDecisionRow {
        let risk_flags = advisor
            .map(|d| serde_json::to_string(&d.risk_flags).unwrap_or_default())
            .unwrap_or_default();

        ShadowDecisionRow {
            timestamp: Utc::now().to_rfc3339(),
            trade_id: trade_id.to_string(),

            price: snapshot.price,
            market_regime: snapshot.regime.clone(),
            volatility: snapshot.volatility,

            strategy: signal.strategy.clone(),
            signal: signal.kind.as_str().to_string(),
            signal_strength: signal.strength,
            signal_confidence: signal.confidence,

            would_execute_strategy: strategy_pass,
            would_execute_after_trend: after_trend,
            would_execute_after_advisor: after_advisor,
            would_execute_after_exec: after_exec,
            final_would_execute: after_exec,

            rejection_stage: rejection_stage.to_string(),
            rejection_reason: rejection_reason.to_string(),

            trend_filter_pass: trend_verdict.pass,
            trend_filter_reason: trend_verdict.reason.clone(),

            advisor_enabled: advisor.is_some(),
            advisor_pass: advisor.map(|d| d.execute).unwrap_or(false),
            advisor_confidence: advisor.map(|d| d.confidence).unwrap_or(0.0),
            advisor_regime: advisor.map(|d| d.regime.clone()).unwrap_or_default(),
            advisor_signal_quality: advisor.map(|d| d.signal_quality).unwrap_or(0.0),
            advisor_risk_flags: risk_flags,

            exec_filter_pass: exec_verdict.pass,
            exec_filter_reason: exec_verdict.reason.clone(),
            spread_pct: snapshot.spread_pct,
            volume_ratio: snapshot.volume_ratio,
            atr_spike_ratio: snapshot.atr_spike_ratio,

            base_position_pct: self.params.base_position_pct,
            adjusted_position_pct: self.params.base_position_pct,
            position_adjustment_factor: 1.0,

            actually_executed: false,
            actual_entry_price: 0.0,
            actual_exit_price: 0.0,
            actual_pnl: 0.0,
            actual_pnl_pct: 0.0,
        }
    }

    /// The shadow recorder backing this pipeline.
    pub fn shadow(&self) -> &ShadowRecorder {
        &self.shadow
    }
}

impl std::fmt::Debug for SignalPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalPipeline")
            .field("shadow_mode", &self.params.enable_shadow_mode)
            .finish()
    }
}

// =============================================================================
// Pipeline service — drains a signal channel and routes accepted signals
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, watch};

use crate::types::OrderSide;
use crate::venue::registry::VenueRegistry;
use crate::venue::OrderType;

/// Owns the pipeline plus the order routing for accepted signals. External
/// strategies feed `(signal, snapshot)` pairs through an mpsc channel; every
/// pair yields exactly one recorded decision, and accepted ones (when
/// execution is enabled) become a market order on the active venue.
pub struct PipelineService {
    pipeline: Arc<SignalPipeline>,
    registry: Arc<VenueRegistry>,
    symbol: String,
    base_position_pct: f64,
    execution_enabled: AtomicBool,
}

impl PipelineService {
    pub fn new(
        pipeline: Arc<SignalPipeline>,
        registry: Arc<VenueRegistry>,
        symbol: impl Into<String>,
        base_position_pct: f64,
        execution_enabled: bool,
    ) -> Self {
        Self {
            pipeline,
            registry,
            symbol: symbol.into(),
            base_position_pct,
            execution_enabled: AtomicBool::new(execution_enabled),
        }
    }

    /// Evaluate one signal and, if accepted with execution enabled, route a
    /// market order through the active venue.
    pub async fn handle(&self, signal: &TradeSignal, snapshot: &MarketSnapshot) -> PipelineOutcome {
        let outcome = self.pipeline.evaluate(signal, snapshot).await;

        if outcome.accepted && self.execution_enabled.load(Ordering::SeqCst) {
            self.route_order(&outcome.trade_id, signal, snapshot).await;
        }

        outcome
    }

    async fn route_order(&self, trade_id: &str, signal: &TradeSignal, snapshot: &MarketSnapshot) {
        let adapter = match self.registry.active().await {
            Ok(a) => a,
            Err(e) => {
                tracing::error!(error = %e, "order routing failed: no active venue");
                return;
            }
        };

        let balance = match adapter.get_balance().await {
            Ok(b) => b,
            Err(e) => {
                tracing::error!(error = %e, "order routing failed: balance unavailable");
                return;
            }
        };

        let qty = balance * self.base_position_pct / 100.0 / snapshot.price;
        if qty <= 0.0 {
            tracing::warn!(balance, "order routing skipped: nothing to size");
            return;
        }

        let side = match signal.kind {
            SignalKind::Buy => OrderSide::Buy,
            SignalKind::Sell => OrderSide::Sell,
            SignalKind::Neutral => return,
        };

        match adapter
            .place_order(&self.symbol, side, qty, OrderType::Market, None)
            .await
        {
            Ok(result) if result.success => {
                let entry = result.avg_price.unwrap_or(snapshot.price);
                self.pipeline.shadow().mark_executed(trade_id, entry);
                info!(
                    trade_id,
                    venue = %adapter.name(),
                    side = %side,
                    qty,
                    entry,
                    "accepted signal routed to active venue"
                );
            }
            Ok(result) => {
                tracing::error!(trade_id, error = ?result.error, "routed order rejected");
            }
            Err(e) => {
                tracing::error!(trade_id, error = %e, "routed order failed");
            }
        }
    }

    /// Drain the signal channel until it closes or shutdown is signalled.
    pub async fn run(
        self: Arc<Self>,
        mut signals: mpsc::Receiver<(TradeSignal, MarketSnapshot)>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(symbol = %self.symbol, "pipeline service started");
        loop {
            tokio::select! {
                next = signals.recv() => {
                    match next {
                        Some((signal, snapshot)) => {
                            self.handle(&signal, &snapshot).await;
                        }
                        None => break,
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("pipeline service stopped");
    }
}

impl std::fmt::Debug for PipelineService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineService")
            .field("symbol", &self.symbol)
            .field(
                "execution_enabled",
                &self.execution_enabled.load(Ordering::SeqCst),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advisor::{AdvisorClient, IndicatorSnapshot};
    use crate::runtime_config::{AdvisorFailureMode, GuardrailParams};
    use crate::store::Store;
    use crate::pipeline::TrendDirection;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct StubAdvisor {
        response: String,
        delay: Option<Duration>,
        calls: AtomicU32,
    }

    #[async_trait]
    impl AdvisorClient for StubAdvisor {
        async fn assess(&self, _request: &AdvisorRequest) -> anyhow::Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            Ok(self.response.clone())
        }
    }

    const ACCEPT: &str =
        r#"{"execute": true, "confidence": 0.8, "regime": "trend", "signal_quality": 0.7}"#;
    const REJECT: &str = r#"{"execute": false, "confidence": 0.3, "regime": "chop", "signal_quality": 0.2, "reason": "weak structure"}"#;

    fn pipeline_with(
        response: &str,
        delay: Option<Duration>,
        shadow_mode: bool,
        failure_mode: AdvisorFailureMode,
    ) -> (SignalPipeline, Arc<Store>, Arc<StubAdvisor>) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let stub = Arc::new(StubAdvisor {
            response: response.to_string(),
            delay,
            calls: AtomicU32::new(0),
        });
        let guardrail_params = GuardrailParams {
            timeout: 1,
            failure_mode,
            ..GuardrailParams::default()
        };
        let guardrails = Arc::new(AdvisorGuardrails::new(stub.clone(), guardrail_params));
        let shadow = Arc::new(ShadowRecorder::new(store.clone()));
        let params = PipelineParams {
            enable_shadow_mode: shadow_mode,
            ..PipelineParams::default()
        };
        (
            SignalPipeline::new(guardrails, shadow, params),
            store,
            stub,
        )
    }

    fn signal(kind: SignalKind) -> TradeSignal {
        TradeSignal {
            strategy: "momentum".into(),
            kind,
            strength: 0.8,
            confidence: 0.7,
        }
    }

    fn snapshot(trend: TrendDirection) -> MarketSnapshot {
        MarketSnapshot {
            price: 100.0,
            regime: "trend".into(),
            volatility: 0.02,
            higher_tf_trend: trend,
            spread_pct: 0.05,
            volume_ratio: 1.2,
            atr_spike_ratio: 1.1,
            indicators: IndicatorSnapshot {
                rsi: 55.0,
                macd: 1.0,
                adx: 30.0,
                ema_short: 101.0,
                ema_long: 100.0,
            },
        }
    }

    #[tokio::test]
    async fn clean_signal_passes_all_stages() {
        let (pipeline, store, _stub) =
            pipeline_with(ACCEPT, None, true, AdvisorFailureMode::Pass);

        let outcome = pipeline
            .evaluate(&signal(SignalKind::Buy), &snapshot(TrendDirection::Up))
            .await;

        assert!(outcome.accepted);
        assert!(outcome.rejection_stage.is_empty());

        let rows = store.shadow_rows(None, None).unwrap();
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert!(row.would_execute_strategy);
        assert!(row.would_execute_after_trend);
        assert!(row.would_execute_after_advisor);
        assert!(row.would_execute_after_exec);
        assert!(row.final_would_execute);
        assert!(row.advisor_enabled);
    }

    #[tokio::test]
    async fn final_flag_is_conjunction_of_all_stages() {
        let (pipeline, store, _stub) =
            pipeline_with(ACCEPT, None, true, AdvisorFailureMode::Pass);

        // Trend disagreement: strategy passes, trend fails, rest recorded.
        pipeline
            .evaluate(&signal(SignalKind::Buy), &snapshot(TrendDirection::Down))
            .await;

        let rows = store.shadow_rows(None, None).unwrap();
        let row = &rows[0];
        assert!(row.would_execute_strategy);
        assert!(!row.would_execute_after_trend);
        assert!(!row.would_execute_after_advisor);
        assert!(!row.would_execute_after_exec);
        let conjunction = row.would_execute_strategy
            && row.would_execute_after_trend
            && row.would_execute_after_advisor
            && row.would_execute_after_exec;
        assert_eq!(row.final_would_execute, conjunction);
        assert_eq!(row.rejection_stage, "trend");
        // Shadow mode still ran the later stages for the counterfactual.
        assert!(row.trend_filter_pass == false && row.advisor_enabled);
    }

    #[tokio::test]
    async fn neutral_signal_rejects_at_strategy_stage() {
        let (pipeline, store, stub) =
            pipeline_with(ACCEPT, None, false, AdvisorFailureMode::Pass);

        let outcome = pipeline
            .evaluate(&signal(SignalKind::Neutral), &snapshot(TrendDirection::Up))
            .await;

        assert!(!outcome.accepted);
        assert_eq!(outcome.rejection_stage, "strategy");
        // Live mode short-circuits: the advisor never ran.
        assert_eq!(stub.calls.load(Ordering::SeqCst), 0);

        let rows = store.shadow_rows(None, None).unwrap();
        assert_eq!(rows.len(), 1);
        assert!(!rows[0].advisor_enabled);
    }

    #[tokio::test]
    async fn advisor_rejection_sets_stage_and_reason() {
        let (pipeline, store, _stub) =
            pipeline_with(REJECT, None, true, AdvisorFailureMode::Pass);

        let outcome = pipeline
            .evaluate(&signal(SignalKind::Buy), &snapshot(TrendDirection::Up))
            .await;

        assert!(!outcome.accepted);
        assert_eq!(outcome.rejection_stage, "advisor");
        assert!(outcome.rejection_reason.contains("weak structure"));

        let rows = store.shadow_rows(None, None).unwrap();
        assert!(rows[0].would_execute_after_trend);
        assert!(!rows[0].would_execute_after_advisor);
    }

    #[tokio::test(start_paused = true)]
    async fn advisor_timeout_with_reject_mode_rejects_at_advisor() {
        let (pipeline, store, _stub) = pipeline_with(
            ACCEPT,
            Some(Duration::from_secs(60)),
            true,
            AdvisorFailureMode::Reject,
        );

        let outcome = pipeline
            .evaluate(&signal(SignalKind::Buy), &snapshot(TrendDirection::Up))
            .await;

        assert!(!outcome.accepted);
        assert_eq!(outcome.rejection_stage, "advisor");

        let rows = store.shadow_rows(None, None).unwrap();
        let row = &rows[0];
        assert!(!row.advisor_pass);
        assert!(!row.final_would_execute);
        assert!(!row.actually_executed);
        assert!(row.advisor_risk_flags.contains("advisor_failure"));
    }

    #[tokio::test]
    async fn service_routes_accepted_signal_to_active_venue() {
        use crate::venue::registry::VenueRegistry;
        use crate::venue::testkit::MockVenue;
        use crate::venue::VenueAdapter;

        let (pipeline, store, _stub) =
            pipeline_with(ACCEPT, None, true, AdvisorFailureMode::Pass);
        let venue = MockVenue::new("bitget", 99.95, 100.0);
        let registry = Arc::new(VenueRegistry::with_adapters(
            vec![("bitget".to_string(), venue.clone() as Arc<dyn VenueAdapter>)],
            "bitget",
        ));
        let service = PipelineService::new(
            Arc::new(pipeline),
            registry,
            "BTCUSDT",
            2.0,
            true,
        );

        let outcome = service
            .handle(&signal(SignalKind::Buy), &snapshot(TrendDirection::Up))
            .await;
        assert!(outcome.accepted);

        // 2 % of the 10 000 mock balance at price 100 = 2.0 units.
        let orders = venue.orders();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].side, crate::types::OrderSide::Buy);
        assert!((orders[0].qty - 2.0).abs() < 1e-9);

        // The decision row was patched with the actual entry.
        let rows = store.shadow_rows(None, None).unwrap();
        assert!(rows[0].actually_executed);
        assert!(rows[0].actual_entry_price > 0.0);
    }

    #[tokio::test]
    async fn service_does_not_route_when_execution_disabled() {
        use crate::venue::registry::VenueRegistry;
        use crate::venue::testkit::MockVenue;
        use crate::venue::VenueAdapter;

        let (pipeline, store, _stub) =
            pipeline_with(ACCEPT, None, true, AdvisorFailureMode::Pass);
        let venue = MockVenue::new("bitget", 99.95, 100.0);
        let registry = Arc::new(VenueRegistry::with_adapters(
            vec![("bitget".to_string(), venue.clone() as Arc<dyn VenueAdapter>)],
            "bitget",
        ));
        let service =
            PipelineService::new(Arc::new(pipeline), registry, "BTCUSDT", 2.0, false);

        let outcome = service
            .handle(&signal(SignalKind::Buy), &snapshot(TrendDirection::Up))
            .await;

        // Accepted and recorded, but shadow-only: no order reached the venue.
        assert!(outcome.accepted);
        assert!(venue.orders().is_empty());
        let rows = store.shadow_rows(None, None).unwrap();
        assert!(rows[0].final_would_execute);
        assert!(!rows[0].actually_executed);
    }

    #[tokio::test]
    async fn accepted_signal_starts_cooldown() {
        let (pipeline, _store, _stub) =
            pipeline_with(ACCEPT, None, true, AdvisorFailureMode::Pass);

        let first = pipeline
            .evaluate(&signal(SignalKind::Buy), &snapshot(TrendDirection::Up))
            .await;
        assert!(first.accepted);

        // Immediately after an accepted signal, the exec filter's cooldown
        // rejects the next one.
        let second = pipeline
            .evaluate(&signal(SignalKind::Buy), &snapshot(TrendDirection::Up))
            .await;
        assert!(!second.accepted);
        assert_eq!(second.rejection_stage, "exec");
        assert!(second.rejection_reason.contains("cooldown"));
    }
}
