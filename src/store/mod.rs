// =============================================================================
// Metric Store — embedded time-series store for the five metric families
// =============================================================================
//
// SQLite (WAL mode) behind a single mutex-guarded connection. Writes are
// batched upserts inside one transaction; every window query anchors on the
// per-symbol latest timestamp rather than wall-clock, so a symbol that stops
// ticking cannot produce phantom signals.
//
// Retention is enforced here by a periodic sweep (the server keeps only a
// short rolling history; everything else is reconstructable).
// =============================================================================

use std::collections::HashMap;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use tracing::{debug, info, warn};

/// Milliseconds per hour, used by the retention sweep.
const HOUR_MS: i64 = 3_600_000;

/// Density rows older than this are ignored by the order-density leaf query.
const DENSITY_FRESHNESS_MS: i64 = HOUR_MS;

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS price (
    ts     INTEGER NOT NULL,
    symbol TEXT    NOT NULL,
    price  REAL    NOT NULL,
    PRIMARY KEY (ts, symbol)
);
CREATE INDEX IF NOT EXISTS price_symbol_ts_idx ON price (symbol, ts DESC);

CREATE TABLE IF NOT EXISTS volume (
    ts           INTEGER NOT NULL,
    symbol       TEXT    NOT NULL,
    quote_volume REAL    NOT NULL,
    PRIMARY KEY (ts, symbol)
);
CREATE INDEX IF NOT EXISTS volume_symbol_ts_idx ON volume (symbol, ts DESC);

CREATE TABLE IF NOT EXISTS trade_count (
    ts          INTEGER NOT NULL,
    symbol      TEXT    NOT NULL,
    trade_count INTEGER NOT NULL,
    PRIMARY KEY (ts, symbol)
);
CREATE INDEX IF NOT EXISTS trade_count_symbol_ts_idx ON trade_count (symbol, ts DESC);

CREATE TABLE IF NOT EXISTS open_interest (
    ts     INTEGER NOT NULL,
    symbol TEXT    NOT NULL,
    oi_usd REAL    NOT NULL,
    PRIMARY KEY (ts, symbol)
);
CREATE INDEX IF NOT EXISTS open_interest_symbol_ts_idx ON open_interest (symbol, ts DESC);

CREATE TABLE IF NOT EXISTS funding_rate (
    ts              INTEGER NOT NULL,
    symbol          TEXT    NOT NULL,
    rate            REAL    NOT NULL,
    next_funding_ts INTEGER NOT NULL,
    PRIMARY KEY (ts, symbol)
);

CREATE TABLE IF NOT EXISTS order_density (
    symbol              TEXT    NOT NULL,
    price               REAL    NOT NULL,
    side                TEXT    NOT NULL,
    ts                  INTEGER NOT NULL,
    current_size_usd    REAL    NOT NULL,
    max_size_usd        REAL    NOT NULL,
    touched             INTEGER NOT NULL DEFAULT 0,
    reduction_usd       REAL    NOT NULL DEFAULT 0,
    percent_from_market REAL    NOT NULL,
    first_seen          INTEGER NOT NULL,
    last_updated        INTEGER NOT NULL,
    duration_sec        INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (symbol, price)
);
CREATE INDEX IF NOT EXISTS order_density_size_idx ON order_density (current_size_usd DESC);
"#;

// =============================================================================
// Metric families
// =============================================================================

/// The five time-series families the store persists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricFamily {
    Price,
    Volume,
    TradeCount,
    OpenInterest,
    FundingRate,
}

impl MetricFamily {
    fn table(self) -> &'static str {
        match self {
            MetricFamily::Price => "price",
            MetricFamily::Volume => "volume",
            MetricFamily::TradeCount => "trade_count",
            MetricFamily::OpenInterest => "open_interest",
            MetricFamily::FundingRate => "funding_rate",
        }
    }

    fn value_column(self) -> &'static str {
        match self {
            MetricFamily::Price => "price",
            MetricFamily::Volume => "quote_volume",
            MetricFamily::TradeCount => "trade_count",
            MetricFamily::OpenInterest => "oi_usd",
            MetricFamily::FundingRate => "rate",
        }
    }

    fn retention_hours(self) -> i64 {
        match self {
            MetricFamily::FundingRate => 48,
            _ => 24,
        }
    }
}

// =============================================================================
// Row types
// =============================================================================

/// One price sample: `(ts ms, symbol, last price)`.
#[derive(Debug, Clone)]
pub struct PriceRow {
    pub ts: i64,
    pub symbol: String,
    pub price: f64,
}

/// Quote volume of one closed 1-minute kline.
#[derive(Debug, Clone)]
pub struct VolumeRow {
    pub ts: i64,
    pub symbol: String,
    pub quote_volume: f64,
}

/// Trade count of one closed 1-minute kline.
#[derive(Debug, Clone)]
pub struct TradeCountRow {
    pub ts: i64,
    pub symbol: String,
    pub trade_count: i64,
}

/// Open interest normalized to quote currency (coins x latest price).
#[derive(Debug, Clone)]
pub struct OpenInterestRow {
    pub ts: i64,
    pub symbol: String,
    pub oi_usd: f64,
}

/// Funding rate sample with the next settlement timestamp.
#[derive(Debug, Clone)]
pub struct FundingRow {
    pub ts: i64,
    pub symbol: String,
    pub rate: f64,
    pub next_funding_ts: i64,
}

/// Latest value per symbol, anchored on that symbol's newest row.
#[derive(Debug, Clone)]
pub struct LatestRow {
    pub symbol: String,
    pub value: f64,
    pub ts: i64,
}

/// Latest vs. value observed at or before `latest_ts - window`.
#[derive(Debug, Clone)]
pub struct ChangeRow {
    pub symbol: String,
    pub current: f64,
    pub past: f64,
}

/// Aggregates of the trailing window and the window immediately before it.
#[derive(Debug, Clone)]
pub struct TwoWindowRow {
    pub symbol: String,
    pub current: f64,
    pub previous: f64,
}

/// Latest value alongside the median over the history window.
#[derive(Debug, Clone)]
pub struct MedianRow {
    pub symbol: String,
    pub current: f64,
    pub median: f64,
}

/// Latest funding rate per symbol with seconds-relevant settlement time.
#[derive(Debug, Clone)]
pub struct FundingLatestRow {
    pub symbol: String,
    pub rate: f64,
    pub next_funding_ts: i64,
}

/// A persisted order-density record (see the in-memory book for invariants).
#[derive(Debug, Clone, PartialEq)]
pub struct DensityRow {
    pub symbol: String,
    pub side: String,
    pub price: f64,
    pub current_size_usd: f64,
    pub max_size_usd: f64,
    pub touched: bool,
    pub reduction_usd: f64,
    pub percent_from_market: f64,
    pub first_seen: i64,
    pub last_updated: i64,
    pub duration_sec: i64,
}

/// One buffered density write, flushed in batches grouped by kind.
#[derive(Debug, Clone)]
pub enum DensityOp {
    Insert(DensityRow),
    Update(DensityRow),
    Delete { symbol: String, price: f64 },
}

// =============================================================================
// MetricStore
// =============================================================================

/// Embedded store shared across ingestion pipelines and leaf listeners.
pub struct MetricStore {
    conn: Mutex<Connection>,
}

impl MetricStore {
    /// Open (or create) the store at `path` and apply the schema.
    ///
    /// Failing here is a fatal bootstrap error — the caller exits non-zero.
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open metric store at {path}"))?;
        conn.execute_batch(SCHEMA_SQL)
            .context("failed to apply metric store schema")?;
        info!(path, "metric store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory store")?;
        conn.execute_batch(SCHEMA_SQL)
            .context("failed to apply metric store schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // -------------------------------------------------------------------------
    // Batched upserts (idempotent; newer values win on conflict)
    // -------------------------------------------------------------------------

    pub fn upsert_prices(&self, rows: &[PriceRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        self.with_write_retry(|conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO price (ts, symbol, price) VALUES (?1, ?2, ?3)
                     ON CONFLICT (ts, symbol) DO UPDATE SET price = excluded.price",
                )?;
                for row in rows {
                    stmt.execute(params![row.ts, row.symbol, row.price])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
    }

    pub fn upsert_volumes(&self, rows: &[VolumeRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        self.with_write_retry(|conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO volume (ts, symbol, quote_volume) VALUES (?1, ?2, ?3)
                     ON CONFLICT (ts, symbol) DO UPDATE SET quote_volume = excluded.quote_volume",
                )?;
                for row in rows {
                    stmt.execute(params![row.ts, row.symbol, row.quote_volume])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
    }

    pub fn upsert_trade_counts(&self, rows: &[TradeCountRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        self.with_write_retry(|conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO trade_count (ts, symbol, trade_count) VALUES (?1, ?2, ?3)
                     ON CONFLICT (ts, symbol) DO UPDATE SET trade_count = excluded.trade_count",
                )?;
                for row in rows {
                    stmt.execute(params![row.ts, row.symbol, row.trade_count])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
    }

    pub fn upsert_open_interest(&self, rows: &[OpenInterestRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        self.with_write_retry(|conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO open_interest (ts, symbol, oi_usd) VALUES (?1, ?2, ?3)
                     ON CONFLICT (ts, symbol) DO UPDATE SET oi_usd = excluded.oi_usd",
                )?;
                for row in rows {
                    stmt.execute(params![row.ts, row.symbol, row.oi_usd])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
    }

    pub fn upsert_funding_rates(&self, rows: &[FundingRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        self.with_write_retry(|conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO funding_rate (ts, symbol, rate, next_funding_ts)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT (ts, symbol) DO UPDATE
                         SET rate = excluded.rate,
                             next_funding_ts = excluded.next_funding_ts",
                )?;
                for row in rows {
                    stmt.execute(params![row.ts, row.symbol, row.rate, row.next_funding_ts])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
    }

    /// Run a write closure, retrying once on a transient store error before
    /// giving up (the caller then drops the batch).
    fn with_write_retry<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&mut Connection) -> rusqlite::Result<()>,
    {
        let mut conn = self.conn.lock();
        if let Err(first) = f(&mut conn) {
            warn!(error = %first, "store write failed — retrying once");
            f(&mut conn).context("store write failed after retry")?;
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Window queries (anchored on per-symbol latest timestamp)
    // -------------------------------------------------------------------------

    /// Most recent value per symbol.
    pub fn query_latest_per_symbol(&self, family: MetricFamily) -> Result<Vec<LatestRow>> {
        let sql = format!(
            "SELECT symbol, {col} AS value, MAX(ts) AS ts FROM {table} GROUP BY symbol",
            col = family.value_column(),
            table = family.table(),
        );
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt
            .query_map([], |r| {
                Ok(LatestRow {
                    symbol: r.get(0)?,
                    value: r.get(1)?,
                    ts: r.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Latest value compared to the latest value observed at or before
    /// `latest_ts - window_sec` for the same symbol.
    pub fn query_window_change_pct(
        &self,
        family: MetricFamily,
        window_sec: i64,
    ) -> Result<Vec<ChangeRow>> {
        let sql = format!(
            "WITH latest AS (
                 SELECT symbol, {col} AS current_value, MAX(ts) AS cur_ts
                 FROM {table} GROUP BY symbol
             ),
             past AS (
                 SELECT p.symbol, p.{col} AS past_value, MAX(p.ts) AS past_ts
                 FROM {table} p
                 JOIN latest l ON l.symbol = p.symbol
                 WHERE p.ts <= l.cur_ts - ?1
                 GROUP BY p.symbol
             )
             SELECT l.symbol, l.current_value, pa.past_value
             FROM latest l
             JOIN past pa ON pa.symbol = l.symbol",
            col = family.value_column(),
            table = family.table(),
        );
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt
            .query_map(params![window_sec * 1000], |r| {
                Ok(ChangeRow {
                    symbol: r.get(0)?,
                    current: r.get(1)?,
                    past: r.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Per symbol, the sum of values over the trailing window anchored at
    /// that symbol's newest row.
    pub fn query_window_sum(
        &self,
        family: MetricFamily,
        window_sec: i64,
    ) -> Result<Vec<(String, f64)>> {
        let sql = format!(
            "WITH latest AS (
                 SELECT symbol, MAX(ts) AS max_ts FROM {table} GROUP BY symbol
             )
             SELECT v.symbol, SUM(v.{col})
             FROM {table} v
             JOIN latest l ON l.symbol = v.symbol
             WHERE v.ts > l.max_ts - ?1
             GROUP BY v.symbol",
            col = family.value_column(),
            table = family.table(),
        );
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt
            .query_map(params![window_sec * 1000], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, f64>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Current-window vs. previous-window sums, for percent-change leaves.
    /// Symbols with an empty previous window are omitted.
    pub fn query_two_windows(
        &self,
        family: MetricFamily,
        window_sec: i64,
    ) -> Result<Vec<TwoWindowRow>> {
        let sql = format!(
            "WITH latest AS (
                 SELECT symbol, MAX(ts) AS max_ts FROM {table} GROUP BY symbol
             ),
             cur AS (
                 SELECT v.symbol, SUM(v.{col}) AS cur_v
                 FROM {table} v
                 JOIN latest l ON l.symbol = v.symbol
                 WHERE v.ts > l.max_ts - ?1
                 GROUP BY v.symbol
             ),
             prev AS (
                 SELECT v.symbol, SUM(v.{col}) AS prev_v
                 FROM {table} v
                 JOIN latest l ON l.symbol = v.symbol
                 WHERE v.ts > l.max_ts - 2 * ?1 AND v.ts <= l.max_ts - ?1
                 GROUP BY v.symbol
             )
             SELECT c.symbol, c.cur_v, p.prev_v
             FROM cur c
             JOIN prev p ON p.symbol = c.symbol",
            col = family.value_column(),
            table = family.table(),
        );
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt
            .query_map(params![window_sec * 1000], |r| {
                Ok(TwoWindowRow {
                    symbol: r.get(0)?,
                    current: r.get(1)?,
                    previous: r.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Latest value alongside the median over `history_sec`, anchored at the
    /// per-symbol latest timestamp. The median is interpolated for even
    /// sample counts (matching a continuous percentile).
    pub fn query_median(
        &self,
        family: MetricFamily,
        history_sec: i64,
    ) -> Result<Vec<MedianRow>> {
        let sql = format!(
            "WITH latest AS (
                 SELECT symbol, {col} AS current_value, MAX(ts) AS max_ts
                 FROM {table} GROUP BY symbol
             )
             SELECT v.symbol, l.current_value, v.{col}
             FROM {table} v
             JOIN latest l ON l.symbol = v.symbol
             WHERE v.ts >= l.max_ts - ?1",
            col = family.value_column(),
            table = family.table(),
        );
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&sql)?;
        let mut per_symbol: HashMap<String, (f64, Vec<f64>)> = HashMap::new();
        let mut iter = stmt.query(params![history_sec * 1000])?;
        while let Some(row) = iter.next()? {
            let symbol: String = row.get(0)?;
            let current: f64 = row.get(1)?;
            let value: f64 = row.get(2)?;
            per_symbol
                .entry(symbol)
                .or_insert_with(|| (current, Vec::new()))
                .1
                .push(value);
        }

        let mut out = Vec::with_capacity(per_symbol.len());
        for (symbol, (current, mut values)) in per_symbol {
            if values.is_empty() {
                continue;
            }
            values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            let n = values.len();
            let median = if n % 2 == 1 {
                values[n / 2]
            } else {
                (values[n / 2 - 1] + values[n / 2]) / 2.0
            };
            out.push(MedianRow {
                symbol,
                current,
                median,
            });
        }
        Ok(out)
    }

    /// Latest funding rate per symbol whose settlement is still ahead.
    pub fn query_latest_funding(&self, now_ms: i64) -> Result<Vec<FundingLatestRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT symbol, rate, next_funding_ts, MAX(ts)
             FROM funding_rate
             WHERE next_funding_ts > ?1
             GROUP BY symbol",
        )?;
        let rows = stmt
            .query_map(params![now_ms], |r| {
                Ok(FundingLatestRow {
                    symbol: r.get(0)?,
                    rate: r.get(1)?,
                    next_funding_ts: r.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // -------------------------------------------------------------------------
    // Order density
    // -------------------------------------------------------------------------

    /// Apply one flushed batch of density operations, grouped by kind so the
    /// store sees three prepared statements instead of one per op.
    pub fn apply_density_ops(&self, ops: &[DensityOp], now_ms: i64) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let mut inserts = 0usize;
        let mut updates = 0usize;
        let mut deletes = 0usize;

        self.with_write_retry(|conn| {
            let tx = conn.transaction()?;
            {
                let mut ins = tx.prepare_cached(
                    "INSERT INTO order_density
                         (symbol, price, side, ts, current_size_usd, max_size_usd,
                          touched, reduction_usd, percent_from_market,
                          first_seen, last_updated, duration_sec)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                     ON CONFLICT (symbol, price) DO NOTHING",
                )?;
                let mut upd = tx.prepare_cached(
                    "UPDATE order_density
                     SET ts = ?1, current_size_usd = ?2, max_size_usd = ?3,
                         touched = ?4, reduction_usd = ?5, percent_from_market = ?6,
                         last_updated = ?7, duration_sec = ?8
                     WHERE symbol = ?9 AND price = ?10",
                )?;
                let mut del = tx.prepare_cached(
                    "DELETE FROM order_density WHERE symbol = ?1 AND price = ?2",
                )?;

                for op in ops {
                    match op {
                        DensityOp::Insert(d) => {
                            let duration = (d.last_updated - d.first_seen).max(0) / 1000;
                            ins.execute(params![
                                d.symbol,
                                d.price,
                                d.side,
                                now_ms,
                                d.current_size_usd,
                                d.max_size_usd,
                                d.touched,
                                d.reduction_usd,
                                d.percent_from_market,
                                d.first_seen,
                                d.last_updated,
                                duration,
                            ])?;
                            inserts += 1;
                        }
                        DensityOp::Update(d) => {
                            let duration = (d.last_updated - d.first_seen).max(0) / 1000;
                            upd.execute(params![
                                now_ms,
                                d.current_size_usd,
                                d.max_size_usd,
                                d.touched,
                                d.reduction_usd,
                                d.percent_from_market,
                                d.last_updated,
                                duration,
                                d.symbol,
                                d.price,
                            ])?;
                            updates += 1;
                        }
                        DensityOp::Delete { symbol, price } => {
                            del.execute(params![symbol, price])?;
                            deletes += 1;
                        }
                    }
                }
            }
            tx.commit()?;
            Ok(())
        })?;

        debug!(inserts, updates, deletes, "density batch applied");
        Ok(())
    }

    /// Fresh density records within `max_pct` of market that have lived at
    /// least `min_duration_sec`. Size comparison is left to the caller (it
    /// depends on the leaf's direction).
    pub fn query_densities(
        &self,
        max_pct: f64,
        min_duration_sec: i64,
        now_ms: i64,
    ) -> Result<Vec<DensityRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT symbol, side, price, current_size_usd, max_size_usd, touched,
                    reduction_usd, percent_from_market, first_seen, last_updated,
                    duration_sec
             FROM order_density
             WHERE ABS(percent_from_market) <= ?1
               AND duration_sec >= ?2
               AND ts >= ?3
             ORDER BY current_size_usd DESC",
        )?;
        let rows = stmt
            .query_map(
                params![max_pct, min_duration_sec, now_ms - DENSITY_FRESHNESS_MS],
                |r| {
                    Ok(DensityRow {
                        symbol: r.get(0)?,
                        side: r.get(1)?,
                        price: r.get(2)?,
                        current_size_usd: r.get(3)?,
                        max_size_usd: r.get(4)?,
                        touched: r.get(5)?,
                        reduction_usd: r.get(6)?,
                        percent_from_market: r.get(7)?,
                        first_seen: r.get(8)?,
                        last_updated: r.get(9)?,
                        duration_sec: r.get(10)?,
                    })
                },
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // -------------------------------------------------------------------------
    // Retention
    // -------------------------------------------------------------------------

    /// Delete rows older than each family's retention window. Invoked from a
    /// periodic task; the query surface never sees expired data afterwards.
    pub fn run_retention_sweep(&self, now_ms: i64) -> Result<()> {
        let conn = self.conn.lock();
        let mut total = 0usize;
        for family in [
            MetricFamily::Price,
            MetricFamily::Volume,
            MetricFamily::TradeCount,
            MetricFamily::OpenInterest,
            MetricFamily::FundingRate,
        ] {
            let cutoff = now_ms - family.retention_hours() * HOUR_MS;
            let sql = format!("DELETE FROM {} WHERE ts < ?1", family.table());
            total += conn.execute(&sql, params![cutoff])?;
        }
        // Density rows share the funding retention (48 h), keyed on last touch.
        let cutoff = now_ms - 48 * HOUR_MS;
        total += conn.execute(
            "DELETE FROM order_density WHERE last_updated < ?1",
            params![cutoff],
        )?;
        if total > 0 {
            debug!(rows = total, "retention sweep removed expired rows");
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn price(ts: i64, symbol: &str, price: f64) -> PriceRow {
        PriceRow {
            ts,
            symbol: symbol.to_string(),
            price,
        }
    }

    #[test]
    fn upsert_is_idempotent() {
        let store = MetricStore::open_in_memory().unwrap();
        let rows = vec![price(1_000, "BTCUSDT", 100.0), price(2_000, "BTCUSDT", 101.0)];
        store.upsert_prices(&rows).unwrap();
        store.upsert_prices(&rows).unwrap();

        let latest = store.query_latest_per_symbol(MetricFamily::Price).unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].symbol, "BTCUSDT");
        assert_eq!(latest[0].value, 101.0);
        assert_eq!(latest[0].ts, 2_000);
    }

    #[test]
    fn upsert_conflict_newer_value_wins() {
        let store = MetricStore::open_in_memory().unwrap();
        store.upsert_prices(&[price(1_000, "BTCUSDT", 100.0)]).unwrap();
        store.upsert_prices(&[price(1_000, "BTCUSDT", 105.0)]).unwrap();

        let latest = store.query_latest_per_symbol(MetricFamily::Price).unwrap();
        assert_eq!(latest[0].value, 105.0);
    }

    #[test]
    fn empty_batch_is_noop() {
        let store = MetricStore::open_in_memory().unwrap();
        store.upsert_prices(&[]).unwrap();
        assert!(store
            .query_latest_per_symbol(MetricFamily::Price)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn window_change_anchors_on_symbol_latest() {
        let store = MetricStore::open_in_memory().unwrap();
        // BTC last ticked at t=400s; ETH stalled at t=100s. Both must anchor
        // on their own latest row, not on wall-clock.
        store
            .upsert_prices(&[
                price(90_000, "BTCUSDT", 100.0),
                price(400_000, "BTCUSDT", 106.0),
                price(10_000, "ETHUSDT", 50.0),
                price(100_000, "ETHUSDT", 55.0),
            ])
            .unwrap();

        let rows = store
            .query_window_change_pct(MetricFamily::Price, 60)
            .unwrap();
        let btc = rows.iter().find(|r| r.symbol == "BTCUSDT").unwrap();
        assert_eq!(btc.current, 106.0);
        assert_eq!(btc.past, 100.0);
        let eth = rows.iter().find(|r| r.symbol == "ETHUSDT").unwrap();
        assert_eq!(eth.current, 55.0);
        assert_eq!(eth.past, 50.0);
    }

    #[test]
    fn two_windows_skips_symbols_without_previous_data() {
        let store = MetricStore::open_in_memory().unwrap();
        let vol = |ts: i64, symbol: &str, v: f64| VolumeRow {
            ts,
            symbol: symbol.to_string(),
            quote_volume: v,
        };
        store
            .upsert_volumes(&[
                // BTC: previous window [120s, 180s] = 10, current (180s, 240s] = 30.
                vol(150_000, "BTCUSDT", 10.0),
                vol(200_000, "BTCUSDT", 12.0),
                vol(240_000, "BTCUSDT", 18.0),
                // ETH only has current-window data.
                vol(240_000, "ETHUSDT", 5.0),
            ])
            .unwrap();

        let rows = store.query_two_windows(MetricFamily::Volume, 60).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].symbol, "BTCUSDT");
        assert_eq!(rows[0].current, 30.0);
        assert_eq!(rows[0].previous, 10.0);
    }

    #[test]
    fn median_is_interpolated_for_even_counts() {
        let store = MetricStore::open_in_memory().unwrap();
        let oi = |ts: i64, v: f64| OpenInterestRow {
            ts,
            symbol: "BTCUSDT".to_string(),
            oi_usd: v,
        };
        store
            .upsert_open_interest(&[oi(1_000, 100.0), oi(2_000, 200.0), oi(3_000, 300.0), oi(4_000, 400.0)])
            .unwrap();

        let rows = store
            .query_median(MetricFamily::OpenInterest, 86_400)
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].current, 400.0);
        assert_eq!(rows[0].median, 250.0);
    }

    #[test]
    fn funding_latest_excludes_settled_rows() {
        let store = MetricStore::open_in_memory().unwrap();
        store
            .upsert_funding_rates(&[
                FundingRow {
                    ts: 1_000,
                    symbol: "BTCUSDT".into(),
                    rate: 0.001,
                    next_funding_ts: 500_000,
                },
                FundingRow {
                    ts: 1_000,
                    symbol: "ETHUSDT".into(),
                    rate: 0.002,
                    next_funding_ts: 50_000,
                },
            ])
            .unwrap();

        let rows = store.query_latest_funding(100_000).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].symbol, "BTCUSDT");
    }

    #[test]
    fn density_ops_round_trip() {
        let store = MetricStore::open_in_memory().unwrap();
        let row = DensityRow {
            symbol: "BTCUSDT".into(),
            side: "LONG".into(),
            price: 100_000.0,
            current_size_usd: 200_000.0,
            max_size_usd: 200_000.0,
            touched: false,
            reduction_usd: 0.0,
            percent_from_market: 0.0,
            first_seen: 1_000,
            last_updated: 1_000,
            duration_sec: 0,
        };
        store
            .apply_density_ops(&[DensityOp::Insert(row.clone())], 1_000)
            .unwrap();

        let mut updated = row.clone();
        updated.current_size_usd = 150_000.0;
        updated.touched = true;
        updated.reduction_usd = 50_000.0;
        updated.last_updated = 400_000;
        store
            .apply_density_ops(&[DensityOp::Update(updated)], 400_000)
            .unwrap();

        let rows = store.query_densities(10.0, 60, 400_000).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].current_size_usd, 150_000.0);
        assert!(rows[0].touched);
        assert_eq!(rows[0].reduction_usd, 50_000.0);
        assert_eq!(rows[0].duration_sec, 399);

        store
            .apply_density_ops(
                &[DensityOp::Delete {
                    symbol: "BTCUSDT".into(),
                    price: 100_000.0,
                }],
                500_000,
            )
            .unwrap();
        assert!(store.query_densities(10.0, 0, 500_000).unwrap().is_empty());
    }

    #[test]
    fn retention_sweep_deletes_expired_rows() {
        let store = MetricStore::open_in_memory().unwrap();
        let now = 100 * HOUR_MS;
        store
            .upsert_prices(&[
                price(now - 30 * HOUR_MS, "BTCUSDT", 90.0),
                price(now - HOUR_MS, "BTCUSDT", 100.0),
            ])
            .unwrap();
        store.run_retention_sweep(now).unwrap();

        let latest = store.query_latest_per_symbol(MetricFamily::Price).unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].value, 100.0);

        let change = store
            .query_window_change_pct(MetricFamily::Price, 48 * 3600)
            .unwrap();
        // The 30h-old anchor row is gone, so there is no past value at all.
        assert!(change.is_empty());
    }
}
