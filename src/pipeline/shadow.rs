// =============================================================================
// Shadow Recorder — decision persistence and A/B counterfactual queries
// =============================================================================
//
// One row per signal, accepted or not. The four would-execute flags let the
// counterfactual pipelines (strategy-only, +trend, +advisor, +exec) be
// compared after the fact without re-running anything.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error};

use crate::store::Store;

use super::ShadowDecisionRow;

/// Acceptance stats for one counterfactual prefix.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StageStats {
    pub would_execute: usize,
    pub rejection_rate: f64,
    /// Signals rejected specifically at this stage (passed all before it).
    pub rejected_here: usize,
}

/// Full A/B comparison across the four counterfactual pipelines.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AbComparison {
    pub total_signals: usize,
    pub strategy_only: StageStats,
    pub after_trend_filter: StageStats,
    pub after_advisor: StageStats,
    pub after_exec_filter: StageStats,
}

/// Per-stage rejection aggregates.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RejectionStats {
    pub count: usize,
    pub avg_signal_strength: f64,
    pub avg_advisor_confidence: f64,
}

pub struct ShadowRecorder {
    store: Arc<Store>,
}

impl ShadowRecorder {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    // -------------------------------------------------------------------------
    // Writes
    // -------------------------------------------------------------------------

    /// Append one decision row. Persistence failures are logged; the
    /// pipeline's verdict stands regardless.
    pub fn record_decision(&self, row: &ShadowDecisionRow) {
        if let Err(e) = self.store.insert_shadow_decision(row) {
            error!(trade_id = %row.trade_id, error = %e, "failed to record shadow decision");
        } else {
            debug!(
                trade_id = %row.trade_id,
                final_would_execute = row.final_would_execute,
                "shadow decision recorded"
            );
        }
    }

    /// Mark a decision as actually executed at `entry_price`.
    pub fn mark_executed(&self, trade_id: &str, entry_price: f64) {
        if let Err(e) = self.store.mark_shadow_executed(trade_id, entry_price) {
            error!(trade_id, error = %e, "failed to mark shadow decision executed");
        }
    }

    /// Patch the realized outcome once the trade closes.
    pub fn update_actual_result(&self, trade_id: &str, exit_price: f64, pnl: f64, pnl_pct: f64) {
        match self.store.update_shadow_result(trade_id, exit_price, pnl, pnl_pct) {
            Ok(0) => error!(trade_id, "no shadow decision found for result update"),
            Ok(_) => debug!(trade_id, pnl, "shadow decision outcome updated"),
            Err(e) => error!(trade_id, error = %e, "failed to update shadow result"),
        }
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Acceptance counts per counterfactual prefix plus per-stage rejection
    /// totals, optionally bounded by ISO-8601 timestamps.
    pub fn ab_comparison(&self, start: Option<&str>, end: Option<&str>) -> AbComparison {
        let rows = match self.store.shadow_rows(start, end) {
            Ok(rows) => rows,
            Err(e) => {
                error!(error = %e, "failed to load shadow rows");
                return AbComparison::default();
            }
        };

        if rows.is_empty() {
            return AbComparison::default();
        }

        let total = rows.len();
        let count = |f: &dyn Fn(&ShadowDecisionRow) -> bool| rows.iter().filter(|r| f(r)).count();

        let strategy = count(&|r| r.would_execute_strategy);
        let after_trend = count(&|r| r.would_execute_after_trend);
        let after_advisor = count(&|r| r.would_execute_after_advisor);
        let after_exec = count(&|r| r.final_would_execute);

        let rate = |accepted: usize| (total - accepted) as f64 / total as f64;

        AbComparison {
            total_signals: total,
            strategy_only: StageStats {
                would_execute: strategy,
                // The strategy stage is the baseline pipeline: its rejection
                // rate is reported as zero, not derived from the counts.
                rejection_rate: 0.0,
                rejected_here: total - strategy,
            },
            after_trend_filter: StageStats {
                would_execute: after_trend,
                rejection_rate: rate(after_trend),
                rejected_here: count(&|r| {
                    r.would_execute_strategy && !r.would_execute_after_trend
                }),
            },
            after_advisor: StageStats {
                would_execute: after_advisor,
                rejection_rate: rate(after_advisor),
                rejected_here: count(&|r| {
                    r.would_execute_after_trend && !r.would_execute_after_advisor
                }),
            },
            after_exec_filter: StageStats {
                would_execute: after_exec,
                rejection_rate: rate(after_exec),
                rejected_here: count(&|r| {
                    r.would_execute_after_advisor && !r.would_execute_after_exec
                }),
            },
        }
    }

    /// Rejection counts and averages grouped by rejection stage.
    pub fn rejection_breakdown(&self) -> HashMap<String, RejectionStats> {
        let rows = match self.store.shadow_rows(None, None) {
            Ok(rows) => rows,
            Err(e) => {
                error!(error = %e, "failed to load shadow rows");
                return HashMap::new();
            }
        };

        let mut breakdown: HashMap<String, (usize, f64, f64)> = HashMap::new();
        for row in rows.iter().filter(|r| !r.rejection_stage.is_empty()) {
            let entry = breakdown
                .entry(row.rejection_stage.clone())
                .or_insert((0, 0.0, 0.0));
            entry.0 += 1;
            entry.1 += row.signal_strength;
            entry.2 += row.advisor_confidence;
        }

        breakdown
            .into_iter()
            .map(|(stage, (count, strength_sum, confidence_sum))| {
                (
                    stage,
                    RejectionStats {
                        count,
                        avg_signal_strength: strength_sum / count as f64,
                        avg_advisor_confidence: confidence_sum / count as f64,
                    },
                )
            })
            .collect()
    }
}

impl std::fmt::Debug for ShadowRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShadowRecorder").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(
        trade_id: &str,
        strategy_pass: bool,
        trend_pass: bool,
        advisor_pass: bool,
        exec_pass: bool,
    ) -> ShadowDecisionRow {
        let after_trend = strategy_pass && trend_pass;
        let after_advisor = after_trend && advisor_pass;
        let after_exec = after_advisor && exec_pass;
        let rejection_stage = if !strategy_pass {
            "strategy"
        } else if !trend_pass {
            "trend"
        } else if !advisor_pass {
            "advisor"
        } else if !exec_pass {
            "exec"
        } else {
            ""
        };

        ShadowDecisionRow {
            timestamp: "2026-01-01T00:00:00Z".into(),
            trade_id: trade_id.into(),
            strategy: "momentum".into(),
            signal: "buy".into(),
            signal_strength: 0.8,
            advisor_confidence: 0.6,
            would_execute_strategy: strategy_pass,
            would_execute_after_trend: after_trend,
            would_execute_after_advisor: after_advisor,
            would_execute_after_exec: after_exec,
            final_would_execute: after_exec,
            rejection_stage: rejection_stage.into(),
            ..ShadowDecisionRow::default()
        }
    }

    fn recorder() -> ShadowRecorder {
        ShadowRecorder::new(Arc::new(Store::open_in_memory().unwrap()))
    }

    #[test]
    fn ab_comparison_counts_counterfactual_prefixes() {
        let recorder = recorder();

        // 100 signals: 40 rejected by trend, 25 by advisor, 5 by exec,
        // 30 fully accepted.
        let mut n = 0;
        let mut push = |trend: bool, advisor: bool, exec: bool, count: usize| {
            for _ in 0..count {
                recorder.record_decision(&row(&format!("t{n}"), true, trend, advisor, exec));
                n += 1;
            }
        };
        push(false, true, true, 40);
        push(true, false, true, 25);
        push(true, true, false, 5);
        push(true, true, true, 30);

        let ab = recorder.ab_comparison(None, None);
        assert_eq!(ab.total_signals, 100);
        assert_eq!(ab.strategy_only.would_execute, 100);
        assert_eq!(ab.after_trend_filter.would_execute, 60);
        assert_eq!(ab.after_advisor.would_execute, 35);
        assert_eq!(ab.after_exec_filter.would_execute, 30);

        assert_eq!(ab.after_trend_filter.rejected_here, 40);
        assert_eq!(ab.after_advisor.rejected_here, 25);
        assert_eq!(ab.after_exec_filter.rejected_here, 5);

        assert!((ab.after_exec_filter.rejection_rate - 0.70).abs() < 1e-9);
    }

    #[test]
    fn strategy_baseline_rejection_rate_stays_zero() {
        let recorder = recorder();

        // Mix of neutral (strategy-fail) and real signals: the baseline
        // stage still reports a zero rejection rate while the later
        // prefixes derive theirs from the counts.
        recorder.record_decision(&row("n1", false, false, false, false));
        recorder.record_decision(&row("n2", false, false, false, false));
        recorder.record_decision(&row("s1", true, true, true, true));
        recorder.record_decision(&row("s2", true, false, true, true));

        let ab = recorder.ab_comparison(None, None);
        assert_eq!(ab.total_signals, 4);
        assert_eq!(ab.strategy_only.would_execute, 2);
        assert_eq!(ab.strategy_only.rejected_here, 2);
        assert_eq!(ab.strategy_only.rejection_rate, 0.0);

        assert_eq!(ab.after_trend_filter.would_execute, 1);
        assert!((ab.after_trend_filter.rejection_rate - 0.75).abs() < 1e-9);
        assert!((ab.after_exec_filter.rejection_rate - 0.75).abs() < 1e-9);
    }

    #[test]
    fn rejection_breakdown_groups_by_stage() {
        let recorder = recorder();
        recorder.record_decision(&row("a", true, false, true, true));
        recorder.record_decision(&row("b", true, false, true, true));
        recorder.record_decision(&row("c", true, true, false, true));
        recorder.record_decision(&row("d", true, true, true, true));

        let breakdown = recorder.rejection_breakdown();
        assert_eq!(breakdown["trend"].count, 2);
        assert_eq!(breakdown["advisor"].count, 1);
        assert!(!breakdown.contains_key("exec"));
        assert!((breakdown["trend"].avg_signal_strength - 0.8).abs() < 1e-9);
    }

    #[test]
    fn outcome_update_patches_row_in_place() {
        let recorder = recorder();
        recorder.record_decision(&row("trade-1", true, true, true, true));

        recorder.mark_executed("trade-1", 100.0);
        recorder.update_actual_result("trade-1", 101.5, 1.5, 1.5);

        let rows = recorder.store.shadow_rows(None, None).unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].actually_executed);
        assert_eq!(rows[0].actual_entry_price, 100.0);
        assert_eq!(rows[0].actual_exit_price, 101.5);
        assert_eq!(rows[0].actual_pnl, 1.5);
    }

    #[test]
    fn empty_table_yields_default_comparison() {
        let recorder = recorder();
        let ab = recorder.ab_comparison(None, None);
        assert_eq!(ab.total_signals, 0);
        assert_eq!(ab.after_exec_filter.would_execute, 0);
    }
}
