// =============================================================================
// Advisor Guardrails — budget, cache, validation, and timeout around the
// external advisor
// =============================================================================
//
// Order of defences:
//   1. Budget: daily call and cost ceilings, reset at date change.
//   2. Cache: fingerprint of (strategy, signal, minute, rounded indicators);
//      a hit bypasses the call entirely.
//   3. Timeout: one bounded network round trip.
//   4. Validation: strict schema on the response JSON.
//
// Every failure path returns the configured fallback decision — the
// pipeline never crashes because the advisor is down.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::runtime_config::{AdvisorFailureMode, GuardrailParams};

use super::{AdvisorClient, AdvisorDecision, AdvisorRequest};

/// Assumed cost per advisor call in dollars.
const COST_PER_CALL: f64 = 0.015;

struct CacheEntry {
    decision: AdvisorDecision,
    expires_at: DateTime<Utc>,
}

struct Inner {
    cache: HashMap<String, CacheEntry>,
    daily_calls: u32,
    daily_cost: f64,
    daily_reset_date: NaiveDate,
    total_calls: u64,
    cache_hits: u64,
    validation_failures: u64,
    timeout_failures: u64,
    budget_stops: u64,
}

/// Counter snapshot for operators.
#[derive(Debug, Clone, Serialize)]
pub struct GuardrailStats {
    pub total_calls: u64,
    pub daily_calls: u32,
    pub daily_cost: f64,
    pub cache_hits: u64,
    pub cache_hit_rate: f64,
    pub cache_size: usize,
    pub validation_failures: u64,
    pub timeout_failures: u64,
    pub budget_stops: u64,
    pub remaining_daily_calls: u32,
    pub remaining_daily_budget: f64,
}

pub struct AdvisorGuardrails {
    client: Arc<dyn AdvisorClient>,
    params: GuardrailParams,
    state: Mutex<Inner>,
}

impl AdvisorGuardrails {
    pub fn new(client: Arc<dyn AdvisorClient>, params: GuardrailParams) -> Self {
        info!(
            max_daily_calls = params.max_daily_calls,
            max_daily_cost = params.max_daily_cost,
            cache_ttl_s = params.cache_ttl,
            "advisor guardrails initialised"
        );
        Self {
            client,
            params,
            state: Mutex::new(Inner {
                cache: HashMap::new(),
                daily_calls: 0,
                daily_cost: 0.0,
                daily_reset_date: Utc::now().date_naive(),
                total_calls: 0,
                cache_hits: 0,
                validation_failures: 0,
                timeout_failures: 0,
                budget_stops: 0,
            }),
        }
    }

    // -------------------------------------------------------------------------
    // Entry point
    // -------------------------------------------------------------------------

    /// Consult the advisor through every guardrail. Always returns a
    /// decision — failures degrade to the configured fallback.
    pub async fn assess(&self, request: &AdvisorRequest) -> AdvisorDecision {
        let fingerprint = Self::fingerprint(request);

        {
            let mut s = self.state.lock();
            s.total_calls += 1;
            Self::maybe_reset_daily(&mut s);

            // Budget.
            if s.daily_calls >= self.params.max_daily_calls {
                s.budget_stops += 1;
                warn!(daily_calls = s.daily_calls, "advisor daily call budget exhausted");
                return self.fallback("daily call budget exhausted");
            }
            if s.daily_cost >= self.params.max_daily_cost {
                s.budget_stops += 1;
                warn!(daily_cost = s.daily_cost, "advisor daily cost budget exhausted");
                return self.fallback("daily cost budget exhausted");
            }

            // Cache.
            if let Some(entry) = s.cache.get(&fingerprint) {
                if Utc::now() < entry.expires_at {
                    let decision = entry.decision.clone();
                    s.cache_hits += 1;
                    debug!(fingerprint = &fingerprint[..8], "advisor cache hit");
                    return decision;
                }
                s.cache.remove(&fingerprint);
            }
        }

        // One bounded round trip; the lock is not held across it.
        let timeout = Duration::from_secs(self.params.timeout);
        let response = match tokio::time::timeout(timeout, self.client.assess(request)).await {
            Ok(Ok(text)) => text,
            Ok(Err(e)) => {
                let mut s = self.state.lock();
                s.timeout_failures += 1;
                warn!(error = %e, "advisor call failed");
                return self.fallback(&format!("call failed: {e}"));
            }
            Err(_) => {
                let mut s = self.state.lock();
                s.timeout_failures += 1;
                warn!(timeout_s = self.params.timeout, "advisor call timed out");
                return self.fallback("call timed out");
            }
        };

        let mut s = self.state.lock();
        s.daily_calls += 1;
        s.daily_cost += COST_PER_CALL;

        match Self::validate_response(&response) {
            Ok(decision) => {
                let expires_at =
                    Utc::now() + chrono::Duration::seconds(self.params.cache_ttl as i64);
                s.cache.insert(
                    fingerprint,
                    CacheEntry {
                        decision: decision.clone(),
                        expires_at,
                    },
                );
                Self::cleanup_cache(&mut s);
                decision
            }
            Err(reason) => {
                s.validation_failures += 1;
                warn!(reason = %reason, "advisor response failed validation");
                drop(s);
                self.fallback(&format!("invalid response: {reason}"))
            }
        }
    }

    // -------------------------------------------------------------------------
    // Fingerprinting & cache
    // -------------------------------------------------------------------------

    /// Cache key: strategy, signal kind, minute-floored wall clock, and
    /// coarsely rounded indicators. Signals inside the same minute with the
    /// same indicator shape share one advisor verdict.
    pub fn fingerprint(request: &AdvisorRequest) -> String {
        let ema_trend = if request.indicators.ema_short > request.indicators.ema_long {
            "up"
        } else {
            "down"
        };
        let key = format!(
            "{}|{}|{}|{:.1}|{:.0}|{:.0}|{}",
            request.strategy,
            request.signal,
            Utc::now().format("%Y-%m-%d %H:%M"),
            request.indicators.rsi,
            request.indicators.macd,
            request.indicators.adx,
            ema_trend,
        );
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        hex::encode(hasher.finalize())
    }

    fn cleanup_cache(s: &mut Inner) {
        let now = Utc::now();
        s.cache.retain(|_, entry| entry.expires_at > now);
    }

    fn maybe_reset_daily(s: &mut Inner) {
        let today = Utc::now().date_naive();
        if today > s.daily_reset_date {
            info!(
                calls = s.daily_calls,
                cost = s.daily_cost,
                "advisor daily budget reset"
            );
            s.daily_calls = 0;
            s.daily_cost = 0.0;
            s.daily_reset_date = today;
        }
    }

    // -------------------------------------------------------------------------
    // Validation
    // -------------------------------------------------------------------------

    /// Parse and validate an advisor response. Accepts bare JSON, JSON in a
    /// fenced code block, or the first balanced `{…}` substring.
    pub fn validate_response(text: &str) -> Result<AdvisorDecision, String> {
        let value = Self::parse_json(text).ok_or_else(|| "no parseable JSON".to_string())?;

        let execute = value
            .get("execute")
            .and_then(|v| v.as_bool())
            .ok_or_else(|| "execute must be a boolean".to_string())?;

        let confidence = value
            .get("confidence")
            .and_then(|v| v.as_f64())
            .ok_or_else(|| "confidence missing".to_string())?;
        if !(0.0..=1.0).contains(&confidence) {
            return Err(format!("confidence {confidence} outside [0, 1]"));
        }

        let regime = value
            .get("regime")
            .and_then(|v| v.as_str())
            .ok_or_else(|| "regime missing".to_string())?;
        if !matches!(regime, "trend" | "mean_revert" | "chop") {
            return Err(format!("invalid regime '{regime}'"));
        }

        let signal_quality = value
            .get("signal_quality")
            .and_then(|v| v.as_f64())
            .ok_or_else(|| "signal_quality missing".to_string())?;
        if !(0.0..=1.0).contains(&signal_quality) {
            return Err(format!("signal_quality {signal_quality} outside [0, 1]"));
        }

        let risk_flags = value
            .get("risk_flags")
            .and_then(|v| v.as_array())
            .map(|flags| {
                flags
                    .iter()
                    .filter_map(|f| f.as_str().map(|s| s.to_string()))
                    .collect()
            })
            .unwrap_or_default();

        let reason = value
            .get("reason")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        Ok(AdvisorDecision {
            execute,
            confidence,
            regime: regime.to_string(),
            signal_quality,
            risk_flags,
            reason,
        })
    }

    fn parse_json(text: &str) -> Option<serde_json::Value> {
        // 1. The whole response is JSON.
        if let Ok(value) = serde_json::from_str(text.trim()) {
            return Some(value);
        }

        // 2. A ```json fenced block.
        if let Some(start) = text.find("```json") {
            let rest = &text[start + 7..];
            if let Some(end) = rest.find("```") {
                if let Ok(value) = serde_json::from_str(rest[..end].trim()) {
                    return Some(value);
                }
            }
        }

        // 3. First balanced brace substring.
        let bytes = text.as_bytes();
        let open = text.find('{')?;
        let mut depth = 0usize;
        for (i, b) in bytes.iter().enumerate().skip(open) {
            match b {
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        return serde_json::from_str(&text[open..=i]).ok();
                    }
                }
                _ => {}
            }
        }
        None
    }

    // -------------------------------------------------------------------------
    // Fallback
    // -------------------------------------------------------------------------

    /// Degraded decision used when the advisor is unavailable or invalid.
    pub fn fallback(&self, reason: &str) -> AdvisorDecision {
        match self.params.failure_mode {
            AdvisorFailureMode::Reject => AdvisorDecision {
                execute: false,
                confidence: 0.0,
                regime: "chop".to_string(),
                signal_quality: 0.0,
                risk_flags: vec!["advisor_failure".to_string()],
                reason: format!("advisor unavailable, rejecting: {reason}"),
            },
            AdvisorFailureMode::Pass => AdvisorDecision {
                execute: true,
                confidence: 0.5,
                regime: "chop".to_string(),
                signal_quality: 0.5,
                risk_flags: vec!["advisor_failure".to_string()],
                reason: format!("advisor unavailable, passing through: {reason}"),
            },
        }
    }

    // -------------------------------------------------------------------------
    // Stats
    // -------------------------------------------------------------------------

    pub fn stats(&self) -> GuardrailStats {
        let s = self.state.lock();
        GuardrailStats {
            total_calls: s.total_calls,
            daily_calls: s.daily_calls,
            daily_cost: s.daily_cost,
            cache_hits: s.cache_hits,
            cache_hit_rate: if s.total_calls > 0 {
                s.cache_hits as f64 / s.total_calls as f64
            } else {
                0.0
            },
            cache_size: s.cache.len(),
            validation_failures: s.validation_failures,
            timeout_failures: s.timeout_failures,
            budget_stops: s.budget_stops,
            remaining_daily_calls: self.params.max_daily_calls.saturating_sub(s.daily_calls),
            remaining_daily_budget: (self.params.max_daily_cost - s.daily_cost).max(0.0),
        }
    }
}

impl std::fmt::Debug for AdvisorGuardrails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.state.lock();
        f.debug_struct("AdvisorGuardrails")
            .field("total_calls", &s.total_calls)
            .field("cache_size", &s.cache.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advisor::IndicatorSnapshot;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Scriptable advisor client: fixed response text, optional delay.
    struct StubAdvisor {
        response: String,
        delay: Option<Duration>,
        calls: AtomicU32,
    }

    impl StubAdvisor {
        fn new(response: &str) -> Arc<Self> {
            Arc::new(Self {
                response: response.to_string(),
                delay: None,
                calls: AtomicU32::new(0),
            })
        }

        fn hanging(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                response: String::new(),
                delay: Some(delay),
                calls: AtomicU32::new(0),
            })
        }
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

    fn request(strategy: &str) -> AdvisorRequest {
        AdvisorRequest {
            strategy: strategy.to_string(),
            signal: "buy".to_string(),
            strength: 0.8,
            confidence: 0.7,
            price: 100.0,
            indicators: IndicatorSnapshot {
                rsi: 55.0,
                macd: 1.2,
                adx: 28.0,
                ema_short: 101.0,
                ema_long: 100.0,
            },
        }
    }

    const GOOD_RESPONSE: &str = r#"{"execute": true, "confidence": 0.8, "regime": "trend", "signal_quality": 0.7, "risk_flags": [], "reason": "clean breakout"}"#;

    #[test]
    fn validates_bare_fenced_and_embedded_json() {
        let bare = AdvisorGuardrails::validate_response(GOOD_RESPONSE).unwrap();
        assert!(bare.execute);
        assert_eq!(bare.regime, "trend");

        let fenced = format!("Here is my analysis:\n```json\n{GOOD_RESPONSE}\n```\nDone.");
        let parsed = AdvisorGuardrails::validate_response(&fenced).unwrap();
        assert!((parsed.confidence - 0.8).abs() < 1e-9);

        let embedded = format!("I think {GOOD_RESPONSE} covers it");
        let parsed = AdvisorGuardrails::validate_response(&embedded).unwrap();
        assert!((parsed.signal_quality - 0.7).abs() < 1e-9);
    }

    #[test]
    fn rejects_missing_and_out_of_range_fields() {
        let missing = r#"{"execute": true, "confidence": 0.8}"#;
        assert!(AdvisorGuardrails::validate_response(missing).is_err());

        let bad_conf =
            r#"{"execute": true, "confidence": 1.5, "regime": "trend", "signal_quality": 0.5}"#;
        assert!(AdvisorGuardrails::validate_response(bad_conf).is_err());

        let bad_regime =
            r#"{"execute": true, "confidence": 0.5, "regime": "sideways", "signal_quality": 0.5}"#;
        assert!(AdvisorGuardrails::validate_response(bad_regime).is_err());

        assert!(AdvisorGuardrails::validate_response("no json here").is_err());
    }

    #[tokio::test]
    async fn cache_hit_bypasses_second_call() {
        let stub = StubAdvisor::new(GOOD_RESPONSE);
        let guardrails = AdvisorGuardrails::new(stub.clone(), GuardrailParams::default());

        let first = guardrails.assess(&request("momentum")).await;
        let second = guardrails.assess(&request("momentum")).await;

        assert!(first.execute && second.execute);
        assert_eq!(stub.calls.load(Ordering::SeqCst), 1);

        let stats = guardrails.stats();
        assert_eq!(stats.total_calls, 2);
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(stats.cache_size, 1);
    }

    #[tokio::test]
    async fn distinct_fingerprints_fill_the_cache() {
        let stub = StubAdvisor::new(GOOD_RESPONSE);
        let guardrails = AdvisorGuardrails::new(stub.clone(), GuardrailParams::default());

        for name in ["alpha", "beta", "gamma"] {
            guardrails.assess(&request(name)).await;
        }

        let stats = guardrails.stats();
        assert_eq!(stats.cache_size, 3);
        assert_eq!(stats.total_calls, 3);
        assert_eq!(stats.cache_hits, 0);
        // misses (= real calls) + hits = total entries into the gate.
        assert_eq!(
            stub.calls.load(Ordering::SeqCst) as u64 + stats.cache_hits,
            stats.total_calls
        );
    }

    #[tokio::test]
    async fn call_budget_stops_and_falls_back() {
        let stub = StubAdvisor::new(GOOD_RESPONSE);
        let params = GuardrailParams {
            max_daily_calls: 1,
            ..GuardrailParams::default()
        };
        let guardrails = AdvisorGuardrails::new(stub.clone(), params);

        guardrails.assess(&request("first")).await;
        let degraded = guardrails.assess(&request("second")).await;

        // Pass mode: signal goes through at half confidence.
        assert!(degraded.execute);
        assert!((degraded.confidence - 0.5).abs() < 1e-9);
        assert!(degraded.risk_flags.contains(&"advisor_failure".to_string()));

        let stats = guardrails.stats();
        assert_eq!(stats.budget_stops, 1);
        assert_eq!(stats.remaining_daily_calls, 0);
        assert_eq!(stub.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_returns_reject_fallback_when_configured() {
        let stub = StubAdvisor::hanging(Duration::from_secs(60));
        let params = GuardrailParams {
            timeout: 1,
            failure_mode: AdvisorFailureMode::Reject,
            ..GuardrailParams::default()
        };
        let guardrails = AdvisorGuardrails::new(stub, params);

        let decision = guardrails.assess(&request("slow")).await;
        assert!(!decision.execute);
        assert_eq!(decision.confidence, 0.0);
        assert!(decision.reason.contains("timed out"));
        assert_eq!(guardrails.stats().timeout_failures, 1);
    }

    #[tokio::test]
    async fn invalid_response_counts_validation_failure() {
        let stub = StubAdvisor::new("I would rather not commit to JSON today.");
        let guardrails = AdvisorGuardrails::new(stub, GuardrailParams::default());

        let decision = guardrails.assess(&request("chatty")).await;
        assert!(decision.execute); // pass mode fallback
        assert_eq!(guardrails.stats().validation_failures, 1);
        // The failed call still consumed budget.
        assert_eq!(guardrails.stats().daily_calls, 1);
    }

    #[test]
    fn fingerprint_varies_with_signal_shape() {
        let a = AdvisorGuardrails::fingerprint(&request("momentum"));
        let b = AdvisorGuardrails::fingerprint(&request("breakout"));
        assert_ne!(a, b);

        let mut sell = request("momentum");
        sell.signal = "sell".to_string();
        assert_ne!(a, AdvisorGuardrails::fingerprint(&sell));

        // Same shape in the same minute: identical.
        assert_eq!(a, AdvisorGuardrails::fingerprint(&request("momentum")));
    }
}
