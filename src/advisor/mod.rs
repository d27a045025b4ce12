// =============================================================================
// Advisor — external LLM policy service consulted per signal
// =============================================================================
//
// The advisor is an external collaborator: it receives a compact summary of
// the signal and indicator state and must answer with a JSON object
// containing at least {execute, confidence, regime, signal_quality}. The
// engine never calls it directly — every call goes through the guardrails
// wrapper (budget, cache, validation, timeout).
// =============================================================================

pub mod guardrails;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Indicator snapshot forwarded to the advisor and used for cache
/// fingerprinting.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct IndicatorSnapshot {
    pub rsi: f64,
    pub macd: f64,
    pub adx: f64,
    pub ema_short: f64,
    pub ema_long: f64,
}

/// One advisor consultation.
#[derive(Debug, Clone, Serialize)]
pub struct AdvisorRequest {
    pub strategy: String,
    /// Signal kind as a wire string ("buy" / "sell").
    pub signal: String,
    pub strength: f64,
    pub confidence: f64,
    pub price: f64,
    pub indicators: IndicatorSnapshot,
}

/// Validated advisor verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvisorDecision {
    pub execute: bool,
    pub confidence: f64,
    pub regime: String,
    pub signal_quality: f64,
    #[serde(default)]
    pub risk_flags: Vec<String>,
    #[serde(default)]
    pub reason: String,
}

/// The advisor transport. Implementations return the raw response text;
/// parsing and validation live in the guardrails.
#[async_trait]
pub trait AdvisorClient: Send + Sync {
    async fn assess(&self, request: &AdvisorRequest) -> anyhow::Result<String>;
}

// ---------------------------------------------------------------------------
// HTTP client
// ---------------------------------------------------------------------------

/// Messages-API style HTTP advisor client.
pub struct HttpAdvisorClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
}

impl HttpAdvisorClient {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .expect("failed to build reqwest client");
        Self {
            client,
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    fn build_prompt(request: &AdvisorRequest) -> String {
        format!(
            "You are a trading signal reviewer. Assess this signal and reply with \
             ONLY a JSON object with keys execute (bool), confidence (0-1), regime \
             (trend|mean_revert|chop), signal_quality (0-1), risk_flags (array of \
             strings), reason (string).\n\
             strategy={} signal={} strength={:.3} confidence={:.3} price={:.2} \
             rsi={:.1} macd={:.2} adx={:.1} ema_short={:.2} ema_long={:.2}",
            request.strategy,
            request.signal,
            request.strength,
            request.confidence,
            request.price,
            request.indicators.rsi,
            request.indicators.macd,
            request.indicators.adx,
            request.indicators.ema_short,
            request.indicators.ema_long,
        )
    }
}

#[async_trait]
impl AdvisorClient for HttpAdvisorClient {
    async fn assess(&self, request: &AdvisorRequest) -> anyhow::Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "max_tokens": 512,
            "messages": [{ "role": "user", "content": Self::build_prompt(request) }],
        });

        let resp = self
            .client
            .post(&self.endpoint)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        let payload: serde_json::Value = resp.json().await?;
        if !status.is_success() {
            anyhow::bail!("advisor returned {status}: {payload}");
        }

        let text = payload["content"]
            .as_array()
            .and_then(|blocks| blocks.first())
            .and_then(|block| block["text"].as_str())
            .unwrap_or_default()
            .to_string();

        debug!(chars = text.len(), "advisor response received");
        Ok(text)
    }
}

impl std::fmt::Debug for HttpAdvisorClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpAdvisorClient")
            .field("endpoint", &self.endpoint)
            .field("api_key", &"<redacted>")
            .field("model", &self.model)
            .finish()
    }
}
