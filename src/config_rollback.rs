// =============================================================================
// Config Rollback Manager — auto-revert to the last known-good configuration
// =============================================================================
//
// Invoked periodically with the recent closed-trade PnL series. With at
// least ten trades it computes win rate, cumulative PnL, and peak-to-trough
// drawdown, and reverts the live config file to the newest
// `config_backup_*` snapshot when any of these trips:
//
//   - estimated daily loss  >= 5 % of capital
//   - win rate              <  30 %
//   - max drawdown          >= 15 %
//
// Before reverting, the current config is copied aside as an emergency
// backup. Rollback history is persisted so operators can rate-limit
// repeated rollbacks within a window.
// =============================================================================

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::store::Store;

/// Daily-loss fraction that triggers a rollback.
const MAX_DAILY_LOSS_FOR_ROLLBACK: f64 = 0.05;
/// Win rate below which a rollback triggers.
const MIN_WIN_RATE_FOR_ROLLBACK: f64 = 0.30;
/// Peak-to-trough drawdown that triggers a rollback.
const MAX_DRAWDOWN_FOR_ROLLBACK: f64 = 0.15;
/// Minimum closed trades before the audit runs at all.
const MIN_TRADES_FOR_EVALUATION: usize = 10;

/// Key of the persisted history document.
const STATE_DOC_KEY: &str = "rollback_manager";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub total_pnl: f64,
    pub win_rate: f64,
    pub max_drawdown: f64,
    pub daily_loss_pct: f64,
    pub trade_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackRecord {
    pub timestamp: DateTime<Utc>,
    pub reason: String,
    pub metrics: PerformanceMetrics,
    pub backup_file: String,
}

pub struct ConfigRollbackManager {
    store: Arc<Store>,
    backup_dir: PathBuf,
    live_config: PathBuf,
    /// Capital base for the daily-loss fraction.
    capital: f64,
    history: RwLock<Vec<RollbackRecord>>,
}

impl ConfigRollbackManager {
    pub fn new(
        store: Arc<Store>,
        backup_dir: impl Into<PathBuf>,
        live_config: impl Into<PathBuf>,
        capital: f64,
    ) -> Self {
        let history = Self::load_history(&store);
        info!(rollbacks = history.len(), "config rollback manager initialised");
        Self {
            store,
            backup_dir: backup_dir.into(),
            live_config: live_config.into(),
            capital,
            history: RwLock::new(history),
        }
    }

    fn load_history(store: &Store) -> Vec<RollbackRecord> {
        match store.load_state_doc(STATE_DOC_KEY) {
            Ok(Some(json)) => serde_json::from_str(&json).unwrap_or_else(|e| {
                error!(error = %e, "failed to parse rollback history, starting fresh");
                Vec::new()
            }),
            Ok(None) => Vec::new(),
            Err(e) => {
                error!(error = %e, "failed to load rollback history");
                Vec::new()
            }
        }
    }

    fn persist_history(&self, history: &[RollbackRecord]) {
        match serde_json::to_string(history) {
            Ok(json) => {
                if let Err(e) = self.store.save_state_doc(STATE_DOC_KEY, &json) {
                    error!(error = %e, "failed to persist rollback history");
                }
            }
            Err(e) => error!(error = %e, "failed to serialise rollback history"),
        }
    }

    // -------------------------------------------------------------------------
    // Audit
    // -------------------------------------------------------------------------

    /// Evaluate the recent PnL series and roll the config back if the
    /// performance thresholds trip. Returns whether a rollback happened.
    pub fn check_performance_and_rollback(&self, pnls: &[f64]) -> bool {
        if pnls.len() < MIN_TRADES_FOR_EVALUATION {
            info!(
                trades = pnls.len(),
                required = MIN_TRADES_FOR_EVALUATION,
                "not enough trades for performance audit, skipping"
            );
            return false;
        }

        let metrics = self.calculate_metrics(pnls);

        match Self::should_rollback(&metrics) {
            Some(reason) => {
                error!(reason = %reason, "performance regression detected, rolling back config");
                if let Err(e) = self.execute_rollback(&reason, &metrics) {
                    error!(error = %e, "config rollback failed");
                    return false;
                }
                true
            }
            None => {
                info!(
                    win_rate = metrics.win_rate,
                    daily_loss_pct = metrics.daily_loss_pct,
                    "performance healthy, no rollback"
                );
                false
            }
        }
    }

    pub fn calculate_metrics(&self, pnls: &[f64]) -> PerformanceMetrics {
        let total_pnl: f64 = pnls.iter().sum();
        let wins = pnls.iter().filter(|p| **p > 0.0).count();
        let win_rate = if pnls.is_empty() {
            0.0
        } else {
            wins as f64 / pnls.len() as f64
        };

        // Peak-to-trough drawdown over the cumulative PnL curve.
        let mut cumulative = 0.0_f64;
        let mut peak = 0.0_f64;
        let mut max_drawdown = 0.0_f64;
        for pnl in pnls {
            cumulative += pnl;
            peak = peak.max(cumulative);
            let drawdown = if peak != 0.0 {
                (peak - cumulative) / peak.abs()
            } else {
                0.0
            };
            max_drawdown = max_drawdown.max(drawdown);
        }

        let daily_loss_pct = if total_pnl < 0.0 {
            (total_pnl / self.capital).abs()
        } else {
            0.0
        };

        PerformanceMetrics {
            total_pnl,
            win_rate,
            max_drawdown,
            daily_loss_pct,
            trade_count: pnls.len(),
        }
    }

    fn should_rollback(metrics: &PerformanceMetrics) -> Option<String> {
        if metrics.daily_loss_pct >= MAX_DAILY_LOSS_FOR_ROLLBACK {
            return Some(format!(
                "daily loss {:.2}% over threshold",
                metrics.daily_loss_pct * 100.0
            ));
        }
        if metrics.win_rate < MIN_WIN_RATE_FOR_ROLLBACK {
            return Some(format!(
                "win rate {:.2}% below threshold",
                metrics.win_rate * 100.0
            ));
        }
        if metrics.max_drawdown >= MAX_DRAWDOWN_FOR_ROLLBACK {
            return Some(format!(
                "max drawdown {:.2}% over threshold",
                metrics.max_drawdown * 100.0
            ));
        }
        None
    }

    // -------------------------------------------------------------------------
    // Rollback
    // -------------------------------------------------------------------------

    fn execute_rollback(&self, reason: &str, metrics: &PerformanceMetrics) -> Result<()> {
        let backup = self
            .newest_backup()?
            .context("no config backups available, cannot roll back")?;

        // Keep the failing config recoverable.
        let emergency = self.live_config.with_extension("emergency_backup");
        std::fs::copy(&self.live_config, &emergency).with_context(|| {
            format!("failed to save emergency backup to {}", emergency.display())
        })?;

        std::fs::copy(&backup, &self.live_config).with_context(|| {
            format!(
                "failed to restore {} over {}",
                backup.display(),
                self.live_config.display()
            )
        })?;

        let record = RollbackRecord {
            timestamp: Utc::now(),
            reason: reason.to_string(),
            metrics: metrics.clone(),
            backup_file: backup.display().to_string(),
        };

        let mut history = self.history.write();
        history.push(record);
        self.persist_history(&history);

        warn!(
            backup = %backup.display(),
            reason,
            "configuration rolled back to last known-good snapshot"
        );
        Ok(())
    }

    /// Newest `config_backup_*` file in the backup directory (names sort by
    /// their timestamp suffix).
    fn newest_backup(&self) -> Result<Option<PathBuf>> {
        if !self.backup_dir.exists() {
            return Ok(None);
        }

        let mut backups: Vec<PathBuf> = std::fs::read_dir(&self.backup_dir)
            .with_context(|| format!("failed to read {}", self.backup_dir.display()))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with("config_backup_"))
                    .unwrap_or(false)
            })
            .collect();

        backups.sort();
        Ok(backups.pop())
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn rollback_history(&self) -> Vec<RollbackRecord> {
        self.history.read().clone()
    }

    pub fn last_rollback(&self) -> Option<RollbackRecord> {
        self.history.read().last().cloned()
    }
}

impl std::fmt::Debug for ConfigRollbackManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigRollbackManager")
            .field("backup_dir", &self.backup_dir)
            .field("rollbacks", &self.history.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager_with_dirs() -> (ConfigRollbackManager, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let backup_dir = dir.path().join("config_backups");
        std::fs::create_dir_all(&backup_dir).unwrap();
        let live = dir.path().join("runtime_config.json");
        std::fs::write(&live, r#"{"live": true}"#).unwrap();

        let store = Arc::new(Store::open_in_memory().unwrap());
        let manager = ConfigRollbackManager::new(store, backup_dir, live, 1000.0);
        (manager, dir)
    }

    #[test]
    fn metrics_win_rate_and_drawdown() {
        let (manager, _guard) = manager_with_dirs();
        let pnls = [10.0, -5.0, 10.0, -20.0, 5.0, 5.0, 5.0, 5.0, 5.0, 5.0];
        let metrics = manager.calculate_metrics(&pnls);

        assert_eq!(metrics.trade_count, 10);
        assert!((metrics.win_rate - 0.8).abs() < 1e-9);
        assert!((metrics.total_pnl - 25.0).abs() < 1e-9);
        // Peak 15 after trade 3, trough -5 after trade 4: (15-(-5))/15.
        assert!((metrics.max_drawdown - 20.0 / 15.0).abs() < 1e-9);
        assert_eq!(metrics.daily_loss_pct, 0.0);
    }

    #[test]
    fn fewer_than_ten_trades_never_roll_back() {
        let (manager, _guard) = manager_with_dirs();
        let pnls = vec![-100.0; 9];
        assert!(!manager.check_performance_and_rollback(&pnls));
        assert!(manager.rollback_history().is_empty());
    }

    #[test]
    fn low_win_rate_triggers_rollback_to_newest_backup() {
        let (manager, guard) = manager_with_dirs();
        let backup_dir = guard.path().join("config_backups");
        std::fs::write(
            backup_dir.join("config_backup_20250101_000000.json"),
            r#"{"old": 1}"#,
        )
        .unwrap();
        std::fs::write(
            backup_dir.join("config_backup_20250601_000000.json"),
            r#"{"old": 2}"#,
        )
        .unwrap();

        // 2 wins out of 10 = 20 % win rate, below the 30 % floor.
        let pnls = [1.0, 1.0, -1.0, -1.0, -1.0, -1.0, -1.0, -1.0, -1.0, -1.0];
        assert!(manager.check_performance_and_rollback(&pnls));

        // Live config now holds the newest backup's content.
        let live = std::fs::read_to_string(guard.path().join("runtime_config.json")).unwrap();
        assert_eq!(live, r#"{"old": 2}"#);

        // The failing config was preserved.
        let emergency =
            std::fs::read_to_string(guard.path().join("runtime_config.emergency_backup")).unwrap();
        assert_eq!(emergency, r#"{"live": true}"#);

        let history = manager.rollback_history();
        assert_eq!(history.len(), 1);
        assert!(history[0].reason.contains("win rate"));
        assert!(history[0].backup_file.contains("config_backup_20250601"));
    }

    #[test]
    fn healthy_performance_leaves_config_alone() {
        let (manager, guard) = manager_with_dirs();
        let pnls = vec![5.0; 12];
        assert!(!manager.check_performance_and_rollback(&pnls));
        let live = std::fs::read_to_string(guard.path().join("runtime_config.json")).unwrap();
        assert_eq!(live, r#"{"live": true}"#);
    }

    #[test]
    fn daily_loss_fraction_triggers() {
        let (manager, guard) = manager_with_dirs();
        let backup_dir = guard.path().join("config_backups");
        std::fs::write(backup_dir.join("config_backup_1.json"), "{}").unwrap();

        // Alternating wins keep the win rate at 50 %, but the net -60 on
        // 1000 capital busts the 5 % daily-loss threshold.
        let pnls = [10.0, -22.0, 10.0, -22.0, 10.0, -22.0, 10.0, -22.0, 10.0, -22.0];
        assert!(manager.check_performance_and_rollback(&pnls));
        assert!(manager.last_rollback().unwrap().reason.contains("daily loss"));
    }

    #[test]
    fn history_survives_restart_via_store() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let guard = tempfile::tempdir().unwrap();
        let backup_dir = guard.path().join("config_backups");
        std::fs::create_dir_all(&backup_dir).unwrap();
        std::fs::write(backup_dir.join("config_backup_1.json"), "{}").unwrap();
        let live = guard.path().join("runtime_config.json");
        std::fs::write(&live, "{}").unwrap();

        {
            let manager = ConfigRollbackManager::new(
                store.clone(),
                backup_dir.clone(),
                live.clone(),
                1000.0,
            );
            let pnls = vec![-10.0; 10];
            assert!(manager.check_performance_and_rollback(&pnls));
        }

        let reloaded = ConfigRollbackManager::new(store, backup_dir, live, 1000.0);
        assert_eq!(reloaded.rollback_history().len(), 1);
    }
}
