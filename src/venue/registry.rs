// =============================================================================
// Venue Registry — named catalogue of adapters with an active selection
// =============================================================================
//
// The registry is built once in main and shared via Arc; there is no global
// instance. The active venue is constructed and connected eagerly at
// initialisation, all others lazily on first use. `switch` swaps the active
// pointer atomically and leaves the previous active untouched on failure.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use parking_lot::RwLock;
use tracing::{info, warn};

use super::binance::BinanceAdapter;
use super::bitget::BitgetAdapter;
use super::okx::OkxAdapter;
use super::VenueAdapter;

/// API credentials for one venue, usually loaded from the environment.
#[derive(Debug, Clone, Default)]
pub struct VenueCredentials {
    pub api_key: String,
    pub api_secret: String,
    /// Required by Bitget and OKX, unused by Binance.
    pub api_passphrase: String,
}

impl VenueCredentials {
    /// Read credentials for `venue` from `MERIDIAN_<VENUE>_API_KEY` /
    /// `_API_SECRET` / `_API_PASSPHRASE`. Missing variables yield empty
    /// strings, which restricts the adapter to public endpoints.
    pub fn from_env(venue: &str) -> Self {
        let prefix = format!("MERIDIAN_{}", venue.to_uppercase());
        Self {
            api_key: std::env::var(format!("{prefix}_API_KEY")).unwrap_or_default(),
            api_secret: std::env::var(format!("{prefix}_API_SECRET")).unwrap_or_default(),
            api_passphrase: std::env::var(format!("{prefix}_API_PASSPHRASE")).unwrap_or_default(),
        }
    }
}

pub struct VenueRegistry {
    credentials: HashMap<String, VenueCredentials>,
    adapters: RwLock<HashMap<String, Arc<dyn VenueAdapter>>>,
    active: RwLock<String>,
}

impl VenueRegistry {
    /// Build the registry and eagerly construct + connect the active venue.
    /// Other configured venues are constructed lazily on first `get`.
    pub async fn initialize(
        credentials: HashMap<String, VenueCredentials>,
        active: &str,
    ) -> Result<Self> {
        let active = active.to_lowercase();
        if !credentials.contains_key(&active) {
            bail!("active venue '{active}' is not in the configured venue set");
        }

        let registry = Self {
            credentials,
            adapters: RwLock::new(HashMap::new()),
            active: RwLock::new(active.clone()),
        };

        let adapter = registry.get(&active).await?;
        info!(venue = %adapter.name(), "venue registry initialised, active venue connected");

        Ok(registry)
    }

    /// Construct an adapter for a known venue name.
    fn build_adapter(&self, name: &str) -> Result<Arc<dyn VenueAdapter>> {
        let creds = self
            .credentials
            .get(name)
            .with_context(|| format!("venue '{name}' is not configured"))?;

        let adapter: Arc<dyn VenueAdapter> = match name {
            "bitget" => Arc::new(BitgetAdapter::new(
                creds.api_key.clone(),
                creds.api_secret.clone(),
                creds.api_passphrase.clone(),
            )),
            "binance" => Arc::new(BinanceAdapter::new(
                creds.api_key.clone(),
                creds.api_secret.clone(),
            )),
            "okx" => Arc::new(OkxAdapter::new(
                creds.api_key.clone(),
                creds.api_secret.clone(),
                creds.api_passphrase.clone(),
            )),
            other => bail!(
                "unsupported venue '{other}' (supported: bitget, binance, okx)"
            ),
        };

        info!(venue = name, "venue adapter created");
        Ok(adapter)
    }

    /// Get a venue adapter by name, constructing and connecting it on first
    /// use. A failed connect is not cached, so the next call retries.
    pub async fn get(&self, name: &str) -> Result<Arc<dyn VenueAdapter>> {
        let name = name.to_lowercase();

        if let Some(adapter) = self.adapters.read().get(&name) {
            return Ok(adapter.clone());
        }

        let adapter = self.build_adapter(&name)?;
        adapter
            .connect()
            .await
            .with_context(|| format!("failed to connect venue '{name}'"))?;

        // Another task may have raced us here; keep the first instance so
        // every component shares the same adapter.
        let mut adapters = self.adapters.write();
        let entry = adapters.entry(name).or_insert(adapter);
        Ok(entry.clone())
    }

    /// The currently active adapter.
    pub async fn active(&self) -> Result<Arc<dyn VenueAdapter>> {
        let name = self.active.read().clone();
        self.get(&name).await
    }

    pub fn active_name(&self) -> String {
        self.active.read().clone()
    }

    /// Switch the active venue. On any failure the previous active selection
    /// is left intact.
    pub async fn switch(&self, name: &str) -> Result<()> {
        let name = name.to_lowercase();

        match self.get(&name).await {
            Ok(_) => {
                *self.active.write() = name.clone();
                info!(venue = %name, "active venue switched");
                Ok(())
            }
            Err(e) => {
                warn!(venue = %name, error = %e, "venue switch failed, keeping previous active");
                Err(e)
            }
        }
    }

    /// Names of every configured venue (constructed or not).
    pub fn configured_venues(&self) -> Vec<String> {
        let mut names: Vec<String> = self.credentials.keys().cloned().collect();
        names.sort();
        names
    }

    /// Disconnect every constructed adapter. Idempotent: already-disconnected
    /// adapters are tolerated, and a second call is a no-op.
    pub async fn disconnect_all(&self) {
        let adapters: Vec<(String, Arc<dyn VenueAdapter>)> = self
            .adapters
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        for (name, adapter) in adapters {
            if adapter.is_connected() {
                adapter.disconnect().await;
                info!(venue = %name, "venue disconnected");
            }
        }
    }

    /// Build a registry around pre-constructed adapters without touching the
    /// network. The adapters are assumed connected.
    pub fn with_adapters(
        adapters: Vec<(String, Arc<dyn VenueAdapter>)>,
        active: &str,
    ) -> Self {
        let credentials = adapters
            .iter()
            .map(|(name, _)| (name.clone(), VenueCredentials::default()))
            .collect();
        let map = adapters.into_iter().collect();
        Self {
            credentials,
            adapters: RwLock::new(map),
            active: RwLock::new(active.to_lowercase()),
        }
    }
}

impl std::fmt::Debug for VenueRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VenueRegistry")
            .field("configured", &self.configured_venues())
            .field("constructed", &self.adapters.read().len())
            .field("active", &self.active_name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::venue::{
        Kline, OrderBook, OrderResult, OrderType, TickerData, VenueError, VenuePositionData,
    };
    use crate::types::OrderSide;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct StubVenue {
        name: String,
        connected: AtomicBool,
    }

    impl StubVenue {
        fn new(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                connected: AtomicBool::new(true),
            })
        }
    }

    #[async_trait]
    impl VenueAdapter for StubVenue {
        fn name(&self) -> &str {
            &self.name
        }
        async fn connect(&self) -> Result<(), VenueError> {
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        }
        async fn disconnect(&self) {
            self.connected.store(false, Ordering::SeqCst);
        }
        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }
        async fn get_ticker(&self, _symbol: &str) -> Result<TickerData, VenueError> {
            Err(VenueError::Exchange("stub".into()))
        }
        async fn get_orderbook(&self, _s: &str, _d: usize) -> Result<OrderBook, VenueError> {
            Err(VenueError::Exchange("stub".into()))
        }
        async fn get_klines(
            &self,
            _s: &str,
            _t: &str,
            _l: usize,
        ) -> Result<Vec<Kline>, VenueError> {
            Ok(Vec::new())
        }
        async fn get_balance(&self) -> Result<f64, VenueError> {
            Ok(0.0)
        }
        async fn get_positions(
            &self,
            _s: Option<&str>,
        ) -> Result<Vec<VenuePositionData>, VenueError> {
            Ok(Vec::new())
        }
        async fn place_order(
            &self,
            _s: &str,
            _side: OrderSide,
            _q: f64,
            _t: OrderType,
            _p: Option<f64>,
        ) -> Result<OrderResult, VenueError> {
            Err(VenueError::Order("stub".into()))
        }
        async fn get_order_status(&self, _o: &str, _s: &str) -> Result<OrderResult, VenueError> {
            Err(VenueError::Order("stub".into()))
        }
        async fn close_position(
            &self,
            _s: &str,
            _side: OrderSide,
        ) -> Result<OrderResult, VenueError> {
            Err(VenueError::Order("stub".into()))
        }
        async fn set_leverage(&self, _s: &str, _l: u32) -> Result<(), VenueError> {
            Ok(())
        }
        async fn set_margin_mode(&self, _s: &str, _m: &str) -> Result<(), VenueError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn switch_changes_active_and_failure_keeps_previous() {
        let registry = VenueRegistry::with_adapters(
            vec![
                ("alpha".to_string(), StubVenue::new("alpha") as Arc<dyn VenueAdapter>),
                ("beta".to_string(), StubVenue::new("beta") as Arc<dyn VenueAdapter>),
            ],
            "alpha",
        );

        assert_eq!(registry.active_name(), "alpha");
        registry.switch("beta").await.unwrap();
        assert_eq!(registry.active_name(), "beta");

        // Unknown venue: switch fails, active untouched.
        assert!(registry.switch("gamma").await.is_err());
        assert_eq!(registry.active_name(), "beta");
    }

    #[tokio::test]
    async fn disconnect_all_is_idempotent() {
        let alpha = StubVenue::new("alpha");
        let registry = VenueRegistry::with_adapters(
            vec![("alpha".to_string(), alpha.clone() as Arc<dyn VenueAdapter>)],
            "alpha",
        );

        registry.disconnect_all().await;
        assert!(!alpha.is_connected());
        // Second call tolerates already-disconnected adapters.
        registry.disconnect_all().await;
        assert!(!alpha.is_connected());
    }

    #[tokio::test]
    async fn initialize_rejects_unknown_active() {
        let result = VenueRegistry::initialize(HashMap::new(), "binance").await;
        assert!(result.is_err());
    }
}
