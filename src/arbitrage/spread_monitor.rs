// =============================================================================
// Spread Monitor — parallel venue polling and pairwise spread computation
// =============================================================================
//
// One round: fan the ticker fetch out over every configured venue
// concurrently (hard 5 s per call), then emit two directional spreads per
// venue pair — buy at A / sell at B and buy at B / sell at A — using the
// ask of the buy venue and the bid of the sell venue.
//
// All spreads of a round share one timestamp; `latest_spreads` returns
// exactly the newest round by filtering on that timestamp. The ring buffer
// has a single writer (the monitor loop); readers take snapshots.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::future::join_all;
use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::store::Store;
use crate::venue::{registry::VenueRegistry, TickerData};

use super::SpreadData;

/// Hard per-venue timeout for one ticker fetch.
const TICKER_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SpreadMonitor {
    registry: Arc<VenueRegistry>,
    store: Arc<Store>,
    symbol: String,
    venues: Vec<String>,
    monitor_interval: Duration,
    history: RwLock<VecDeque<SpreadData>>,
    history_size: usize,
    latest_prices: RwLock<HashMap<String, TickerData>>,
}

impl SpreadMonitor {
    pub fn new(
        registry: Arc<VenueRegistry>,
        store: Arc<Store>,
        symbol: impl Into<String>,
        venues: Vec<String>,
        monitor_interval: Duration,
        history_size: usize,
    ) -> Self {
        let symbol = symbol.into();
        info!(symbol = %symbol, venues = ?venues, "spread monitor initialised");
        Self {
            registry,
            store,
            symbol,
            venues,
            monitor_interval,
            history: RwLock::new(VecDeque::with_capacity(history_size)),
            history_size,
            latest_prices: RwLock::new(HashMap::new()),
        }
    }

    // -------------------------------------------------------------------------
    // One round
    // -------------------------------------------------------------------------

    /// Fetch tickers from every venue in parallel. Venues that fail or time
    /// out are simply absent from the result.
    pub async fn fetch_prices(&self) -> HashMap<String, TickerData> {
        let fetches = self.venues.iter().map(|venue| {
            let registry = self.registry.clone();
            let symbol = self.symbol.clone();
            let venue = venue.clone();
            async move {
                let adapter = match registry.get(&venue).await {
                    Ok(a) => a,
                    Err(e) => {
                        error!(venue = %venue, error = %e, "venue unavailable");
                        return None;
                    }
                };
                match tokio::time::timeout(TICKER_TIMEOUT, adapter.get_ticker(&symbol)).await {
                    Ok(Ok(ticker)) => Some((venue, ticker)),
                    Ok(Err(e)) => {
                        error!(venue = %venue, error = %e, "ticker fetch failed");
                        None
                    }
                    Err(_) => {
                        error!(venue = %venue, timeout_s = TICKER_TIMEOUT.as_secs(), "ticker fetch timed out");
                        None
                    }
                }
            }
        });

        let prices: HashMap<String, TickerData> =
            join_all(fetches).await.into_iter().flatten().collect();

        *self.latest_prices.write() = prices.clone();
        prices
    }

    /// Compute both directional spreads for every venue pair.
    pub fn calculate_spreads(
        &self,
        prices: &HashMap<String, TickerData>,
        ts_ms: i64,
    ) -> Vec<SpreadData> {
        let mut spreads = Vec::new();
        let venues: Vec<&String> = prices.keys().collect();

        for (i, venue_a) in venues.iter().enumerate() {
            for venue_b in venues.iter().skip(i + 1) {
                let ticker_a = &prices[*venue_a];
                let ticker_b = &prices[*venue_b];

                if let Some(s) = self.directional_spread(ticker_a, ticker_b, venue_a, venue_b, ts_ms)
                {
                    spreads.push(s);
                }
                if let Some(s) = self.directional_spread(ticker_b, ticker_a, venue_b, venue_a, ts_ms)
                {
                    spreads.push(s);
                }
            }
        }

        spreads
    }

    /// Buy at `buy` venue's ask, sell at `sell` venue's bid. Entries with
    /// non-positive prices are dropped.
    fn directional_spread(
        &self,
        ticker_buy: &TickerData,
        ticker_sell: &TickerData,
        venue_buy: &str,
        venue_sell: &str,
        ts_ms: i64,
    ) -> Option<SpreadData> {
        let buy_price = ticker_buy.ask;
        let sell_price = ticker_sell.bid;

        if buy_price <= 0.0 || sell_price <= 0.0 {
            return None;
        }

        let spread_pct = (sell_price - buy_price) / buy_price * 100.0;

        Some(SpreadData {
            buy_venue: venue_buy.to_string(),
            sell_venue: venue_sell.to_string(),
            symbol: self.symbol.clone(),
            buy_price,
            sell_price,
            spread_pct,
            ts_ms,
        })
    }

    /// Run one full round: fetch, compute, record. Returns the round's
    /// spreads, or an empty vec when fewer than two venues responded.
    pub async fn update(&self) -> Vec<SpreadData> {
        let prices = self.fetch_prices().await;

        if prices.len() < 2 {
            warn!(responding = prices.len(), "fewer than two venues responded, skipping round");
            return Vec::new();
        }

        let ts_ms = Utc::now().timestamp_millis();
        let spreads = self.calculate_spreads(&prices, ts_ms);

        {
            let mut history = self.history.write();
            for spread in &spreads {
                if history.len() == self.history_size {
                    history.pop_front();
                }
                history.push_back(spread.clone());
            }
        }

        // Persistence is best-effort; the in-memory round stands regardless.
        if let Err(e) = self.store.insert_spreads(&spreads) {
            error!(error = %e, "failed to persist spreads");
        }

        debug!(prices = prices.len(), spreads = spreads.len(), "spread round complete");
        spreads
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Spreads of the most recent round only (they share the newest ts_ms).
    pub fn latest_spreads(&self) -> Vec<SpreadData> {
        let history = self.history.read();
        let latest_ts = match history.back() {
            Some(s) => s.ts_ms,
            None => return Vec::new(),
        };
        history
            .iter()
            .filter(|s| s.ts_ms == latest_ts)
            .cloned()
            .collect()
    }

    /// Up to `limit` most recent spreads across rounds.
    pub fn spread_history(&self, limit: Option<usize>) -> Vec<SpreadData> {
        let history = self.history.read();
        match limit {
            Some(n) => history.iter().rev().take(n).rev().cloned().collect(),
            None => history.iter().cloned().collect(),
        }
    }

    /// Latest successfully fetched ticker per venue.
    pub fn latest_prices(&self) -> HashMap<String, TickerData> {
        self.latest_prices.read().clone()
    }

    // -------------------------------------------------------------------------
    // Loop
    // -------------------------------------------------------------------------

    /// Background loop. Exits when the shutdown signal flips to true.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(interval_s = self.monitor_interval.as_secs_f64(), "spread monitor loop started");
        let mut interval = tokio::time::interval(self.monitor_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let spreads = self.update().await;
                    if let Some(max) = spreads
                        .iter()
                        .max_by(|a, b| a.spread_pct.total_cmp(&b.spread_pct))
                    {
                        if max.spread_pct > 0.1 {
                            info!(spread = %max, "widest spread this round");
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("spread monitor loop stopped");
    }
}

impl std::fmt::Debug for SpreadMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpreadMonitor")
            .field("symbol", &self.symbol)
            .field("venues", &self.venues)
            .field("history_len", &self.history.read().len())
            .finish()
    }
}
