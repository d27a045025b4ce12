// =============================================================================
// Embedded store — SQLite persistence for spreads, opportunities, trades,
// shadow decisions, and small state documents
// =============================================================================
//
// One migration step at startup creates every table; runtime components
// assume the schema exists. The connection lives behind a Mutex: writes are
// short and callers treat each method as linearizable.
//
// Persistence failures never abort trading — callers log and keep the
// in-memory outcome.
// =============================================================================

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use tracing::info;

use crate::arbitrage::{ArbitrageTrade, ArbitrageOpportunity, SpreadData};
use crate::pipeline::ShadowDecisionRow;

/// Schema. WAL keeps readers unblocked during the engine's frequent writes.
const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS arbitrage_spreads (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    exchange_a TEXT NOT NULL,
    exchange_b TEXT NOT NULL,
    symbol TEXT NOT NULL,
    buy_price REAL NOT NULL,
    sell_price REAL NOT NULL,
    spread_pct REAL NOT NULL,
    timestamp INTEGER NOT NULL,
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);

CREATE INDEX IF NOT EXISTS idx_arbitrage_spreads_timestamp
    ON arbitrage_spreads(timestamp);
CREATE INDEX IF NOT EXISTS idx_arbitrage_spreads_exchanges
    ON arbitrage_spreads(exchange_a, exchange_b);

CREATE TABLE IF NOT EXISTS arbitrage_opportunities (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    buy_exchange TEXT NOT NULL,
    sell_exchange TEXT NOT NULL,
    symbol TEXT NOT NULL,
    buy_price REAL NOT NULL,
    sell_price REAL NOT NULL,
    spread_pct REAL NOT NULL,
    gross_profit REAL NOT NULL,
    net_profit REAL NOT NULL,
    buy_fee REAL NOT NULL,
    sell_fee REAL NOT NULL,
    est_buy_slip REAL NOT NULL,
    est_sell_slip REAL NOT NULL,
    buy_depth REAL,
    sell_depth REAL,
    risk_score REAL,
    timestamp INTEGER NOT NULL,
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);

CREATE INDEX IF NOT EXISTS idx_arbitrage_opportunities_timestamp
    ON arbitrage_opportunities(timestamp);
CREATE INDEX IF NOT EXISTS idx_arbitrage_opportunities_net_profit
    ON arbitrage_opportunities(net_profit DESC);

CREATE TABLE IF NOT EXISTS arbitrage_trades (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    trade_id TEXT NOT NULL,
    buy_exchange TEXT NOT NULL,
    sell_exchange TEXT NOT NULL,
    symbol TEXT NOT NULL,
    amount REAL NOT NULL,
    status TEXT NOT NULL,
    buy_order_id TEXT,
    sell_order_id TEXT,
    buy_price REAL,
    sell_price REAL,
    expected_pnl REAL,
    actual_pnl REAL,
    failure_reason TEXT,
    buy_exec_time REAL,
    sell_exec_time REAL,
    total_exec_time REAL,
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    buy_executed_at TIMESTAMP,
    sell_executed_at TIMESTAMP,
    completed_at TIMESTAMP
);

CREATE INDEX IF NOT EXISTS idx_arbitrage_trades_created_at
    ON arbitrage_trades(created_at);
CREATE INDEX IF NOT EXISTS idx_arbitrage_trades_status
    ON arbitrage_trades(status);
CREATE INDEX IF NOT EXISTS idx_arbitrage_trades_exchanges
    ON arbitrage_trades(buy_exchange, sell_exchange);

CREATE TABLE IF NOT EXISTS shadow_decisions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT,
    trade_id TEXT,

    price REAL,
    market_regime TEXT,
    volatility REAL,

    strategy TEXT,
    signal TEXT,
    signal_strength REAL,
    signal_confidence REAL,

    would_execute_strategy INTEGER,
    would_execute_after_trend INTEGER,
    would_execute_after_advisor INTEGER,
    would_execute_after_exec INTEGER,
    final_would_execute INTEGER,

    rejection_stage TEXT,
    rejection_reason TEXT,

    trend_filter_pass INTEGER,
    trend_filter_reason TEXT,

    advisor_enabled INTEGER,
    advisor_pass INTEGER,
    advisor_confidence REAL,
    advisor_regime TEXT,
    advisor_signal_quality REAL,
    advisor_risk_flags TEXT,

    exec_filter_pass INTEGER,
    exec_filter_reason TEXT,
    spread_pct REAL,
    volume_ratio REAL,
    atr_spike_ratio REAL,

    base_position_pct REAL,
    adjusted_position_pct REAL,
    position_adjustment_factor REAL,

    actually_executed INTEGER,
    actual_entry_price REAL,
    actual_exit_price REAL,
    actual_pnl REAL,
    actual_pnl_pct REAL
);

CREATE INDEX IF NOT EXISTS idx_shadow_timestamp ON shadow_decisions(timestamp);
CREATE INDEX IF NOT EXISTS idx_shadow_trade_id ON shadow_decisions(trade_id);

-- Small JSON state documents (circuit breaker, rollback history).
CREATE TABLE IF NOT EXISTS app_state (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);
"#;

/// Thread-safe handle to the embedded database.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database at `path` and run the migration.
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database at {path}"))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        info!(path, "store opened");
        Ok(store)
    }

    /// In-memory database, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    /// Create every table and index. Invoked once at startup; idempotent.
    fn migrate(&self) -> Result<()> {
        self.conn
            .lock()
            .execute_batch(SCHEMA_SQL)
            .context("schema migration failed")?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Spreads
    // -------------------------------------------------------------------------

    pub fn insert_spreads(&self, spreads: &[SpreadData]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO arbitrage_spreads
                     (exchange_a, exchange_b, symbol, buy_price, sell_price, spread_pct, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for s in spreads {
                stmt.execute(params![
                    s.buy_venue,
                    s.sell_venue,
                    s.symbol,
                    s.buy_price,
                    s.sell_price,
                    s.spread_pct,
                    s.ts_ms,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn spread_count(&self) -> Result<i64> {
        let conn = self.conn.lock();
        let count = conn.query_row("SELECT COUNT(*) FROM arbitrage_spreads", [], |r| r.get(0))?;
        Ok(count)
    }

    // -------------------------------------------------------------------------
    // Opportunities
    // -------------------------------------------------------------------------

    pub fn insert_opportunities(&self, opportunities: &[ArbitrageOpportunity]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO arbitrage_opportunities
                     (buy_exchange, sell_exchange, symbol, buy_price, sell_price, spread_pct,
                      gross_profit, net_profit, buy_fee, sell_fee,
                      est_buy_slip, est_sell_slip, buy_depth, sell_depth, risk_score, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            )?;
            for o in opportunities {
                stmt.execute(params![
                    o.buy_venue,
                    o.sell_venue,
                    o.symbol,
                    o.buy_price,
                    o.sell_price,
                    o.spread_pct,
                    o.gross_profit,
                    o.net_profit,
                    o.buy_fee_rate,
                    o.sell_fee_rate,
                    o.est_buy_slippage,
                    o.est_sell_slippage,
                    o.buy_depth_usd,
                    o.sell_depth_usd,
                    o.risk_score,
                    o.ts_ms,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Trades
    // -------------------------------------------------------------------------

    pub fn insert_trade(&self, trade: &ArbitrageTrade) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO arbitrage_trades
                 (trade_id, buy_exchange, sell_exchange, symbol, amount, status,
                  buy_order_id, sell_order_id, buy_price, sell_price,
                  expected_pnl, actual_pnl, failure_reason,
                  buy_exec_time, sell_exec_time, total_exec_time,
                  buy_executed_at, sell_executed_at, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10,
                     ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
            params![
                trade.id,
                trade.opportunity.buy_venue,
                trade.opportunity.sell_venue,
                trade.opportunity.symbol,
                trade.amount,
                trade.status.to_string(),
                trade.buy_order.as_ref().and_then(|o| o.order_id.clone()),
                trade.sell_order.as_ref().and_then(|o| o.order_id.clone()),
                trade.buy_order.as_ref().and_then(|o| o.avg_price),
                trade.sell_order.as_ref().and_then(|o| o.avg_price),
                trade.expected_pnl,
                trade.actual_pnl,
                trade.failure_reason,
                trade.buy_execution_time,
                trade.sell_execution_time,
                trade.total_execution_time,
                trade.buy_executed_at.map(|t| t.to_rfc3339()),
                trade.sell_executed_at.map(|t| t.to_rfc3339()),
                trade.completed_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    /// PnL of the most recent completed trades, newest first. Feeds the
    /// config rollback manager's performance audit.
    pub fn recent_completed_pnls(&self, limit: usize) -> Result<Vec<f64>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT actual_pnl FROM arbitrage_trades
             WHERE status = 'COMPLETED' AND actual_pnl IS NOT NULL
             ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |r| r.get::<_, f64>(0))?;
        let mut pnls = Vec::new();
        for row in rows {
            pnls.push(row?);
        }
        Ok(pnls)
    }

    pub fn trade_count(&self) -> Result<i64> {
        let conn = self.conn.lock();
        let count = conn.query_row("SELECT COUNT(*) FROM arbitrage_trades", [], |r| r.get(0))?;
        Ok(count)
    }

    // -------------------------------------------------------------------------
    // Shadow decisions
    // -------------------------------------------------------------------------

    pub fn insert_shadow_decision(&self, row: &ShadowDecisionRow) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO shadow_decisions
                 (timestamp, trade_id, price, market_regime, volatility,
                  strategy, signal, signal_strength, signal_confidence,
                  would_execute_strategy, would_execute_after_trend,
                  would_execute_after_advisor, would_execute_after_exec, final_would_execute,
                  rejection_stage, rejection_reason,
                  trend_filter_pass, trend_filter_reason,
                  advisor_enabled, advisor_pass, advisor_confidence, advisor_regime,
                  advisor_signal_quality, advisor_risk_flags,
                  exec_filter_pass, exec_filter_reason, spread_pct, volume_ratio, atr_spike_ratio,
                  base_position_pct, adjusted_position_pct, position_adjustment_factor,
                  actually_executed, actual_entry_price, actual_exit_price,
                  actual_pnl, actual_pnl_pct)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                     ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29, ?30,
                     ?31, ?32, ?33, ?34, ?35, ?36, ?37)",
            params![
                row.timestamp,
                row.trade_id,
                row.price,
                row.market_regime,
                row.volatility,
                row.strategy,
                row.signal,
                row.signal_strength,
                row.signal_confidence,
                row.would_execute_strategy as i64,
                row.would_execute_after_trend as i64,
                row.would_execute_after_advisor as i64,
                row.would_execute_after_exec as i64,
                row.final_would_execute as i64,
                row.rejection_stage,
                row.rejection_reason,
                row.trend_filter_pass as i64,
                row.trend_filter_reason,
                row.advisor_enabled as i64,
                row.advisor_pass as i64,
                row.advisor_confidence,
                row.advisor_regime,
                row.advisor_signal_quality,
                row.advisor_risk_flags,
                row.exec_filter_pass as i64,
                row.exec_filter_reason,
                row.spread_pct,
                row.volume_ratio,
                row.atr_spike_ratio,
                row.base_position_pct,
                row.adjusted_position_pct,
                row.position_adjustment_factor,
                row.actually_executed as i64,
                row.actual_entry_price,
                row.actual_exit_price,
                row.actual_pnl,
                row.actual_pnl_pct,
            ],
        )?;
        Ok(())
    }

    /// Mark a decision as actually executed with its entry price.
    pub fn mark_shadow_executed(&self, trade_id: &str, entry_price: f64) -> Result<usize> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE shadow_decisions
             SET actually_executed = 1, actual_entry_price = ?1
             WHERE trade_id = ?2",
            params![entry_price, trade_id],
        )?;
        Ok(updated)
    }

    /// Patch the realized outcome into an existing decision row.
    pub fn update_shadow_result(
        &self,
        trade_id: &str,
        exit_price: f64,
        pnl: f64,
        pnl_pct: f64,
    ) -> Result<usize> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE shadow_decisions
             SET actual_exit_price = ?1, actual_pnl = ?2, actual_pnl_pct = ?3
             WHERE trade_id = ?4",
            params![exit_price, pnl, pnl_pct, trade_id],
        )?;
        Ok(updated)
    }

    /// Fetch decision rows, optionally bounded by ISO-8601 timestamps.
    pub fn shadow_rows(
        &self,
        start: Option<&str>,
        end: Option<&str>,
    ) -> Result<Vec<ShadowDecisionRow>> {
        let conn = self.conn.lock();

        let mut sql = String::from("SELECT * FROM shadow_decisions WHERE 1=1");
        let mut bindings: Vec<String> = Vec::new();
        if let Some(s) = start {
            sql.push_str(" AND timestamp >= ?");
            bindings.push(s.to_string());
        }
        if let Some(e) = end {
            sql.push_str(" AND timestamp <= ?");
            bindings.push(e.to_string());
        }
        sql.push_str(" ORDER BY id ASC");

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(bindings.iter()), |r| {
            Ok(ShadowDecisionRow {
                timestamp: r.get("timestamp")?,
                trade_id: r.get("trade_id")?,
                price: r.get("price")?,
                market_regime: r.get("market_regime")?,
                volatility: r.get("volatility")?,
                strategy: r.get("strategy")?,
                signal: r.get("signal")?,
                signal_strength: r.get("signal_strength")?,
                signal_confidence: r.get("signal_confidence")?,
                would_execute_strategy: r.get::<_, i64>("would_execute_strategy")? != 0,
                would_execute_after_trend: r.get::<_, i64>("would_execute_after_trend")? != 0,
                would_execute_after_advisor: r.get::<_, i64>("would_execute_after_advisor")? != 0,
                would_execute_after_exec: r.get::<_, i64>("would_execute_after_exec")? != 0,
                final_would_execute: r.get::<_, i64>("final_would_execute")? != 0,
                rejection_stage: r.get("rejection_stage")?,
                rejection_reason: r.get("rejection_reason")?,
                trend_filter_pass: r.get::<_, i64>("trend_filter_pass")? != 0,
                trend_filter_reason: r.get("trend_filter_reason")?,
                advisor_enabled: r.get::<_, i64>("advisor_enabled")? != 0,
                advisor_pass: r.get::<_, i64>("advisor_pass")? != 0,
                advisor_confidence: r.get("advisor_confidence")?,
                advisor_regime: r.get("advisor_regime")?,
                advisor_signal_quality: r.get("advisor_signal_quality")?,
                advisor_risk_flags: r.get("advisor_risk_flags")?,
                exec_filter_pass: r.get::<_, i64>("exec_filter_pass")? != 0,
                exec_filter_reason: r.get("exec_filter_reason")?,
                spread_pct: r.get("spread_pct")?,
                volume_ratio: r.get("volume_ratio")?,
                atr_spike_ratio: r.get("atr_spike_ratio")?,
                base_position_pct: r.get("base_position_pct")?,
                adjusted_position_pct: r.get("adjusted_position_pct")?,
                position_adjustment_factor: r.get("position_adjustment_factor")?,
                actually_executed: r.get::<_, i64>("actually_executed")? != 0,
                actual_entry_price: r.get("actual_entry_price")?,
                actual_exit_price: r.get("actual_exit_price")?,
                actual_pnl: r.get("actual_pnl")?,
                actual_pnl_pct: r.get("actual_pnl_pct")?,
            })
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // -------------------------------------------------------------------------
    // State documents
    // -------------------------------------------------------------------------

    pub fn save_state_doc(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO app_state (key, value, updated_at) VALUES (?1, ?2, CURRENT_TIMESTAMP)
             ON CONFLICT(key) DO UPDATE SET value = ?2, updated_at = CURRENT_TIMESTAMP",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn load_state_doc(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached("SELECT value FROM app_state WHERE key = ?1")?;
        let mut rows = stmt.query(params![key])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_spread() -> SpreadData {
        SpreadData {
            buy_venue: "bitget".into(),
            sell_venue: "okx".into(),
            symbol: "BTCUSDT".into(),
            buy_price: 100.0,
            sell_price: 100.5,
            spread_pct: 0.5,
            ts_ms: 1_700_000_000_000,
        }
    }

    #[test]
    fn migration_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        store.migrate().unwrap();
        store.migrate().unwrap();
    }

    #[test]
    fn spreads_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        store
            .insert_spreads(&[sample_spread(), sample_spread()])
            .unwrap();
        assert_eq!(store.spread_count().unwrap(), 2);
    }

    #[test]
    fn state_doc_upsert() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.load_state_doc("breaker").unwrap().is_none());

        store.save_state_doc("breaker", r#"{"paused":false}"#).unwrap();
        store.save_state_doc("breaker", r#"{"paused":true}"#).unwrap();
        assert_eq!(
            store.load_state_doc("breaker").unwrap().as_deref(),
            Some(r#"{"paused":true}"#)
        );
    }

    #[test]
    fn recent_completed_pnls_filters_failed_trades() {
        let store = Store::open_in_memory().unwrap();
        let opp = crate::arbitrage::ArbitrageOpportunity {
            buy_venue: "bitget".into(),
            sell_venue: "okx".into(),
            symbol: "BTCUSDT".into(),
            buy_price: 100.0,
            sell_price: 100.5,
            spread_pct: 0.5,
            gross_profit: 2.5,
            net_profit: 1.1,
            buy_fee_rate: 0.0006,
            sell_fee_rate: 0.0006,
            est_buy_slippage: 0.0003,
            est_sell_slippage: 0.0003,
            ts_ms: 1,
            buy_depth_usd: None,
            sell_depth_usd: None,
            risk_score: 0.4,
        };

        let mut completed = ArbitrageTrade::new(opp.clone(), 500.0);
        completed.status = crate::arbitrage::TradeStatus::Completed;
        completed.actual_pnl = Some(1.25);
        store.insert_trade(&completed).unwrap();

        let mut failed = ArbitrageTrade::new(opp, 500.0);
        failed.status = crate::arbitrage::TradeStatus::Failed;
        failed.failure_reason = Some("sell leg failed".into());
        store.insert_trade(&failed).unwrap();

        assert_eq!(store.trade_count().unwrap(), 2);
        let pnls = store.recent_completed_pnls(10).unwrap();
        assert_eq!(pnls, vec![1.25]);
    }
}
