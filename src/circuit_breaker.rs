// =============================================================================
// Emergency Circuit Breaker — suspends trading on loss streaks and drawdown
// =============================================================================
//
// Triggers, first match wins:
//   1. Consecutive losses  >= max_consecutive_losses      -> pause 30 min
//   2. Daily loss fraction >= max_daily_loss_pct          -> pause 60 min
//   3. Balance fraction    <= min_account_balance_pct     -> pause 120 min
//
// State is persisted to the store on every mutation so a restart preserves
// an active suspension. A pause is soft: the engine keeps polling, but
// `check_trading_allowed` short-circuits until `pause_until` elapses, at
// which point the first subsequent call clears the pause.
// =============================================================================

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::runtime_config::BreakerParams;
use crate::store::Store;

/// Key of the persisted state document.
const STATE_DOC_KEY: &str = "circuit_breaker";

/// Persisted breaker state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    #[serde(default)]
    pub consecutive_losses: u32,
    #[serde(default)]
    pub daily_pnl: f64,
    #[serde(default)]
    pub daily_start_balance: f64,
    #[serde(default)]
    pub is_paused: bool,
    #[serde(default)]
    pub pause_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub pause_reason: String,
}

pub struct CircuitBreaker {
    store: Arc<Store>,
    params: BreakerParams,
    state: RwLock<CircuitBreakerState>,
}

impl CircuitBreaker {
    /// Build the breaker, restoring any persisted state. An already-expired
    /// pause is cleared on load.
    pub fn new(store: Arc<Store>, params: BreakerParams) -> Self {
        let mut state = Self::load_state(&store).unwrap_or(CircuitBreakerState {
            consecutive_losses: 0,
            daily_pnl: 0.0,
            daily_start_balance: params.initial_balance,
            is_paused: false,
            pause_until: None,
            pause_reason: String::new(),
        });

        if state.daily_start_balance <= 0.0 {
            state.daily_start_balance = params.initial_balance;
        }

        if let Some(until) = state.pause_until {
            if Utc::now() > until {
                info!("circuit breaker pause expired while offline, resuming");
                state.is_paused = false;
                state.pause_until = None;
                state.pause_reason.clear();
            }
        }

        info!(
            initial_balance = params.initial_balance,
            consecutive_losses = state.consecutive_losses,
            is_paused = state.is_paused,
            "circuit breaker initialised"
        );

        Self {
            store,
            params,
            state: RwLock::new(state),
        }
    }

    fn load_state(store: &Store) -> Option<CircuitBreakerState> {
        match store.load_state_doc(STATE_DOC_KEY) {
            Ok(Some(json)) => match serde_json::from_str(&json) {
                Ok(state) => Some(state),
                Err(e) => {
                    error!(error = %e, "failed to parse circuit breaker state, starting fresh");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                error!(error = %e, "failed to load circuit breaker state");
                None
            }
        }
    }

    fn persist(&self, state: &CircuitBreakerState) {
        match serde_json::to_string(state) {
            Ok(json) => {
                if let Err(e) = self.store.save_state_doc(STATE_DOC_KEY, &json) {
                    error!(error = %e, "failed to persist circuit breaker state");
                }
            }
            Err(e) => error!(error = %e, "failed to serialise circuit breaker state"),
        }
    }

    // -------------------------------------------------------------------------
    // Gate
    // -------------------------------------------------------------------------

    /// Whether trading is currently allowed. An elapsed pause is cleared
    /// (and persisted) by the first call after `pause_until`.
    pub fn check_trading_allowed(&self) -> (bool, String) {
        let mut state = self.state.write();

        if state.is_paused {
            if let Some(until) = state.pause_until {
                if Utc::now() < until {
                    let remaining = (until - Utc::now()).num_seconds() as f64 / 60.0;
                    return (
                        false,
                        format!(
                            "paused for {remaining:.1} more minutes: {}",
                            state.pause_reason
                        ),
                    );
                }
            }
            // Pause elapsed: resume.
            state.is_paused = false;
            state.pause_until = None;
            state.pause_reason.clear();
            self.persist(&state);
            info!("circuit breaker pause elapsed, trading resumed");
            return (true, "trading resumed".to_string());
        }

        (true, "ok".to_string())
    }

    // -------------------------------------------------------------------------
    // Trade results
    // -------------------------------------------------------------------------

    /// Record a closed trade and evaluate the triggers.
    pub fn record_trade(&self, pnl: f64, current_balance: f64) {
        let mut state = self.state.write();

        state.daily_pnl += pnl;
        if pnl < 0.0 {
            state.consecutive_losses += 1;
            warn!(
                pnl,
                consecutive_losses = state.consecutive_losses,
                "loss recorded"
            );
        } else {
            state.consecutive_losses = 0;
        }

        self.evaluate_triggers(&mut state, current_balance);
        self.persist(&state);
    }

    /// First matching trigger wins.
    fn evaluate_triggers(&self, state: &mut CircuitBreakerState, current_balance: f64) {
        if state.consecutive_losses >= self.params.max_consecutive_losses {
            Self::trigger_pause(
                state,
                self.params.consecutive_loss_pause_minutes,
                format!("{} consecutive losses", state.consecutive_losses),
            );
            return;
        }

        let daily_loss_pct = if state.daily_start_balance > 0.0 {
            (state.daily_pnl / state.daily_start_balance).abs()
        } else {
            0.0
        };
        if state.daily_pnl < 0.0 && daily_loss_pct >= self.params.max_daily_loss_pct {
            Self::trigger_pause(
                state,
                self.params.daily_loss_pause_minutes,
                format!(
                    "daily loss {:.2}% ({:.2})",
                    daily_loss_pct * 100.0,
                    state.daily_pnl
                ),
            );
            return;
        }

        let balance_pct = current_balance / self.params.initial_balance;
        if balance_pct <= self.params.min_account_balance_pct {
            Self::trigger_pause(
                state,
                self.params.account_loss_pause_minutes,
                format!(
                    "account balance at {:.2}% of initial ({current_balance:.2})",
                    balance_pct * 100.0
                ),
            );
        }
    }

    fn trigger_pause(state: &mut CircuitBreakerState, minutes: u64, reason: String) {
        state.is_paused = true;
        state.pause_until = Some(Utc::now() + Duration::minutes(minutes as i64));
        state.pause_reason = reason.clone();
        error!(
            pause_minutes = minutes,
            reason = %reason,
            "circuit breaker tripped, trading suspended"
        );
    }

    // -------------------------------------------------------------------------
    // Daily reset & status
    // -------------------------------------------------------------------------

    /// Zero the daily counters and re-anchor the day's starting balance.
    pub fn reset_daily(&self) {
        let mut state = self.state.write();
        state.daily_pnl = 0.0;
        state.consecutive_losses = 0;
        state.daily_start_balance = self.params.initial_balance;
        self.persist(&state);
        info!("circuit breaker daily counters reset");
    }

    pub fn status(&self) -> CircuitBreakerState {
        self.state.read().clone()
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("CircuitBreaker")
            .field("is_paused", &state.is_paused)
            .field("consecutive_losses", &state.consecutive_losses)
            .field("daily_pnl", &state.daily_pnl)
            .finish()
    }
}
