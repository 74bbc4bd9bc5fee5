// =============================================================================
// Density Book — large resting orders tracked per (symbol, price level)
// =============================================================================
//
// A level enters the book when a depth update shows at least $100k resting
// within ±10% of the mid price, and leaves when it shrinks below the floor,
// drifts out of band, or goes stale. Record invariants:
//
//   max_size_usd >= current_size_usd
//   touched       <=> current_size_usd < max_size_usd
//   reduction_usd  = max_size_usd - current_size_usd when touched, else 0
//
// Every mutation appends a typed op (INSERT/UPDATE/DELETE) to a buffer that a
// flusher drains into the store every few seconds.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info};

use crate::store::{DensityOp, DensityRow, MetricStore};

/// Minimum resting size worth tracking.
pub const MIN_ORDER_SIZE_USD: f64 = 100_000.0;

/// Tracking band around the mid price, in percent.
pub const MAX_PRICE_DEVIATION_PCT: f64 = 10.0;

/// Mid prices older than this are not used as a reference for updates.
const MID_FRESHNESS_MS: i64 = 60_000;

/// Mid prices older than this are not used by the out-of-band sweep.
const SWEEP_MID_FRESHNESS_MS: i64 = 300_000;

/// Records untouched for this long are dropped by the stale sweep.
const STALE_AFTER_MS: i64 = 3_600_000;

/// Flush cadence for the op buffer.
const FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// Stale sweep cadence (30 minutes).
const STALE_SWEEP_INTERVAL: Duration = Duration::from_secs(1800);

/// Out-of-band sweep cadence (5 minutes).
const BAND_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// Which side of the book the resting order sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn as_str(self) -> &'static str {
        match self {
            Side::Long => "LONG",
            Side::Short => "SHORT",
        }
    }
}

/// One tracked price level.
#[derive(Debug, Clone)]
pub struct DensityRecord {
    pub symbol: String,
    pub side: Side,
    pub price: f64,
    pub current_size_usd: f64,
    pub max_size_usd: f64,
    pub touched: bool,
    pub reduction_usd: f64,
    pub percent_from_market: f64,
    pub first_seen: i64,
    pub last_updated: i64,
}

impl DensityRecord {
    fn to_row(&self) -> DensityRow {
        DensityRow {
            symbol: self.symbol.clone(),
            side: self.side.as_str().to_string(),
            price: self.price,
            current_size_usd: self.current_size_usd,
            max_size_usd: self.max_size_usd,
            touched: self.touched,
            reduction_usd: self.reduction_usd,
            percent_from_market: self.percent_from_market,
            first_seen: self.first_seen,
            last_updated: self.last_updated,
            duration_sec: (self.last_updated - self.first_seen).max(0) / 1000,
        }
    }
}

struct MidPrice {
    mid: f64,
    ts: i64,
}

/// Percent distance of `price` from `reference`.
pub fn percent_from_market(price: f64, reference: f64) -> f64 {
    if reference == 0.0 {
        return 0.0;
    }
    (price / reference - 1.0) * 100.0
}

/// In-memory density map plus the pending write buffer.
///
/// Price levels are keyed by the f64 bit pattern: the exchange sends exact
/// decimal strings, so identical levels always parse to identical bits.
pub struct DensityBook {
    records: RwLock<HashMap<(String, u64), DensityRecord>>,
    mids: RwLock<HashMap<String, MidPrice>>,
    pending_ops: Mutex<Vec<DensityOp>>,
}

impl DensityBook {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            mids: RwLock::new(HashMap::new()),
            pending_ops: Mutex::new(Vec::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Mid price cache (fed by the bookTicker stream)
    // -------------------------------------------------------------------------

    pub fn update_mid(&self, symbol: &str, best_bid: f64, best_ask: f64, ts_ms: i64) {
        if best_bid <= 0.0 || best_ask <= 0.0 {
            return;
        }
        self.mids.write().insert(
            symbol.to_string(),
            MidPrice {
                mid: (best_bid + best_ask) / 2.0,
                ts: ts_ms,
            },
        );
    }

    /// Reference mid for depth processing, only while fresh.
    pub fn reference_mid(&self, symbol: &str, now_ms: i64) -> Option<f64> {
        let mids = self.mids.read();
        let entry = mids.get(symbol)?;
        if now_ms - entry.ts > MID_FRESHNESS_MS {
            return None;
        }
        Some(entry.mid)
    }

    // -------------------------------------------------------------------------
    // Depth updates
    // -------------------------------------------------------------------------

    /// Apply one depth level against a valid reference mid.
    pub fn apply_level(
        &self,
        symbol: &str,
        side: Side,
        price: f64,
        quantity: f64,
        reference_mid: f64,
        now_ms: i64,
    ) {
        if reference_mid <= 0.0 || price <= 0.0 {
            return;
        }
        let key = (symbol.to_string(), price.to_bits());
        let pct = percent_from_market(price, reference_mid);

        // Out of band: never track, and evict anything already here.
        if pct.abs() > MAX_PRICE_DEVIATION_PCT {
            self.remove_level(&key);
            return;
        }

        let size_usd = price * quantity;
        if quantity <= 0.0 || size_usd < MIN_ORDER_SIZE_USD {
            self.remove_level(&key);
            return;
        }

        let mut records = self.records.write();
        match records.get_mut(&key) {
            Some(record) => {
                record.max_size_usd = record.max_size_usd.max(size_usd);
                record.current_size_usd = size_usd;
                record.touched = record.current_size_usd < record.max_size_usd;
                record.reduction_usd = if record.touched {
                    record.max_size_usd - record.current_size_usd
                } else {
                    0.0
                };
                record.percent_from_market = pct;
                record.last_updated = now_ms;
                let row = record.to_row();
                drop(records);
                self.pending_ops.lock().push(DensityOp::Update(row));
            }
            None => {
                let record = DensityRecord {
                    symbol: symbol.to_string(),
                    side,
                    price,
                    current_size_usd: size_usd,
                    max_size_usd: size_usd,
                    touched: false,
                    reduction_usd: 0.0,
                    percent_from_market: pct,
                    first_seen: now_ms,
                    last_updated: now_ms,
                };
                let row = record.to_row();
                records.insert(key, record);
                drop(records);
                self.pending_ops.lock().push(DensityOp::Insert(row));
            }
        }
    }

    fn remove_level(&self, key: &(String, u64)) {
        let removed = self.records.write().remove(key);
        if let Some(record) = removed {
            self.pending_ops.lock().push(DensityOp::Delete {
                symbol: record.symbol,
                price: record.price,
            });
        }
    }

    // -------------------------------------------------------------------------
    // Sweeps
    // -------------------------------------------------------------------------

    /// Drop records whose last update is older than one hour.
    pub fn sweep_stale(&self, now_ms: i64) -> usize {
        let stale: Vec<(String, u64)> = {
            let records = self.records.read();
            records
                .iter()
                .filter(|(_, r)| now_ms - r.last_updated > STALE_AFTER_MS)
                .map(|(k, _)| k.clone())
                .collect()
        };
        for key in &stale {
            self.remove_level(key);
        }
        stale.len()
    }

    /// Drop records that drifted outside the ±10% band under the latest mid.
    /// Symbols without a fresh mid are left alone.
    pub fn sweep_out_of_band(&self, now_ms: i64) -> usize {
        let out: Vec<(String, u64)> = {
            let records = self.records.read();
            let mids = self.mids.read();
            records
                .iter()
                .filter(|((symbol, _), record)| {
                    let Some(mid) = mids.get(symbol) else {
                        return false;
                    };
                    if now_ms - mid.ts > SWEEP_MID_FRESHNESS_MS || mid.mid == 0.0 {
                        return false;
                    }
                    percent_from_market(record.price, mid.mid).abs() > MAX_PRICE_DEVIATION_PCT
                })
                .map(|(k, _)| k.clone())
                .collect()
        };
        for key in &out {
            self.remove_level(key);
        }
        out.len()
    }

    // -------------------------------------------------------------------------
    // Buffer & snapshots
    // -------------------------------------------------------------------------

    /// Take the pending op buffer, leaving it empty.
    pub fn drain_ops(&self) -> Vec<DensityOp> {
        std::mem::take(&mut *self.pending_ops.lock())
    }

    /// Copy of every tracked record (for the live feed).
    pub fn snapshot(&self) -> Vec<DensityRecord> {
        self.records.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

impl Default for DensityBook {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Periodic tasks
// =============================================================================

/// Flush the op buffer to the store every 5 seconds. Runs until aborted.
pub async fn run_density_flush(book: Arc<DensityBook>, store: Arc<MetricStore>) {
    let mut interval = tokio::time::interval(FLUSH_INTERVAL);
    loop {
        interval.tick().await;
        let ops = book.drain_ops();
        if ops.is_empty() {
            continue;
        }
        let now_ms = chrono::Utc::now().timestamp_millis();
        if let Err(e) = store.apply_density_ops(&ops, now_ms) {
            error!(error = %e, dropped = ops.len(), "density flush failed — batch dropped");
        }
    }
}

/// Stale-record sweep, every 30 minutes. Runs until aborted.
pub async fn run_stale_sweep(book: Arc<DensityBook>) {
    let mut interval = tokio::time::interval(STALE_SWEEP_INTERVAL);
    loop {
        interval.tick().await;
        let removed = book.sweep_stale(chrono::Utc::now().timestamp_millis());
        if removed > 0 {
            info!(removed, "stale density records swept");
        }
    }
}

/// Out-of-band sweep, every 5 minutes. Runs until aborted.
pub async fn run_band_sweep(book: Arc<DensityBook>) {
    let mut interval = tokio::time::interval(BAND_SWEEP_INTERVAL);
    loop {
        interval.tick().await;
        let removed = book.sweep_out_of_band(chrono::Utc::now().timestamp_millis());
        if removed > 0 {
            debug!(removed, "out-of-band density records swept");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::DensityOp;

    const MID: f64 = 100_000.0;

    fn insert_count(ops: &[DensityOp]) -> usize {
        ops.iter()
            .filter(|op| matches!(op, DensityOp::Insert(_)))
            .count()
    }

    #[test]
    fn level_lifecycle_create_touch_remove() {
        let book = DensityBook::new();

        // $200k resting at the mid: tracked.
        book.apply_level("BTCUSDT", Side::Long, 100_000.0, 2.0, MID, 1_000);
        let ops = book.drain_ops();
        assert_eq!(ops.len(), 1);
        assert!(matches!(&ops[0], DensityOp::Insert(r) if !r.touched && r.reduction_usd == 0.0));

        // Shrinks to $150k: touched, reduction recorded.
        book.apply_level("BTCUSDT", Side::Long, 100_000.0, 1.5, MID, 2_000);
        let ops = book.drain_ops();
        assert_eq!(ops.len(), 1);
        match &ops[0] {
            DensityOp::Update(r) => {
                assert!(r.touched);
                assert_eq!(r.current_size_usd, 150_000.0);
                assert_eq!(r.max_size_usd, 200_000.0);
                assert_eq!(r.reduction_usd, 50_000.0);
            }
            other => panic!("expected update, got {other:?}"),
        }

        // Shrinks below the floor: removed.
        book.apply_level("BTCUSDT", Side::Long, 100_000.0, 0.5, MID, 3_000);
        let ops = book.drain_ops();
        assert_eq!(ops.len(), 1);
        assert!(matches!(&ops[0], DensityOp::Delete { symbol, price }
            if symbol == "BTCUSDT" && *price == 100_000.0));
        assert!(book.is_empty());
    }

    #[test]
    fn invariants_hold_through_growth_and_touch() {
        let book = DensityBook::new();
        book.apply_level("BTCUSDT", Side::Short, 101_000.0, 2.0, MID, 1_000);
        book.apply_level("BTCUSDT", Side::Short, 101_000.0, 3.0, MID, 2_000);

        let snap = book.snapshot();
        let r = &snap[0];
        // Growing back above the old max resets touched.
        assert!(r.max_size_usd >= r.current_size_usd);
        assert!(!r.touched);
        assert_eq!(r.reduction_usd, 0.0);

        book.apply_level("BTCUSDT", Side::Short, 101_000.0, 2.5, MID, 3_000);
        let snap = book.snapshot();
        let r = &snap[0];
        assert!(r.touched);
        assert_eq!(r.reduction_usd, r.max_size_usd - r.current_size_usd);
        assert!(r.percent_from_market.abs() <= MAX_PRICE_DEVIATION_PCT);
    }

    #[test]
    fn out_of_band_levels_are_ignored_and_evicted() {
        let book = DensityBook::new();
        // 15% above mid: never tracked.
        book.apply_level("BTCUSDT", Side::Short, 115_000.0, 10.0, MID, 1_000);
        assert!(book.is_empty());
        assert!(book.drain_ops().is_empty());

        // Tracked in band, then the band moves away.
        book.apply_level("BTCUSDT", Side::Short, 109_000.0, 10.0, MID, 1_000);
        assert_eq!(book.len(), 1);
        book.drain_ops();
        book.apply_level("BTCUSDT", Side::Short, 109_000.0, 10.0, 90_000.0, 2_000);
        assert!(book.is_empty());
        let ops = book.drain_ops();
        assert!(matches!(&ops[0], DensityOp::Delete { .. }));
    }

    #[test]
    fn small_levels_below_floor_are_not_tracked() {
        let book = DensityBook::new();
        book.apply_level("BTCUSDT", Side::Long, 100_000.0, 0.5, MID, 1_000);
        assert!(book.is_empty());
        assert!(book.drain_ops().is_empty());
    }

    #[test]
    fn stale_sweep_removes_old_records() {
        let book = DensityBook::new();
        book.apply_level("BTCUSDT", Side::Long, 100_000.0, 2.0, MID, 1_000);
        book.apply_level("ETHUSDT", Side::Long, 100_000.0, 2.0, MID, 3_000_000);
        book.drain_ops();

        let removed = book.sweep_stale(1_000 + STALE_AFTER_MS + 1);
        assert_eq!(removed, 1);
        assert_eq!(book.len(), 1);
        let ops = book.drain_ops();
        assert!(matches!(&ops[0], DensityOp::Delete { symbol, .. } if symbol == "BTCUSDT"));
    }

    #[test]
    fn band_sweep_uses_latest_mid() {
        let book = DensityBook::new();
        book.update_mid("BTCUSDT", 99_990.0, 100_010.0, 1_000);
        book.apply_level("BTCUSDT", Side::Long, 95_000.0, 2.0, MID, 1_000);
        book.drain_ops();

        // Mid rockets; the old level is now > 10% away.
        book.update_mid("BTCUSDT", 109_990.0, 110_010.0, 2_000);
        let removed = book.sweep_out_of_band(3_000);
        assert_eq!(removed, 1);
        assert!(book.is_empty());
    }

    #[test]
    fn mid_reference_expires() {
        let book = DensityBook::new();
        book.update_mid("BTCUSDT", 99_990.0, 100_010.0, 1_000);
        assert_eq!(book.reference_mid("BTCUSDT", 2_000), Some(100_000.0));
        assert_eq!(book.reference_mid("BTCUSDT", 1_000 + MID_FRESHNESS_MS + 1), None);
        assert_eq!(book.reference_mid("ETHUSDT", 2_000), None);
    }

    #[test]
    fn distinct_levels_tracked_independently() {
        let book = DensityBook::new();
        book.apply_level("BTCUSDT", Side::Long, 99_000.0, 2.0, MID, 1_000);
        book.apply_level("BTCUSDT", Side::Short, 101_000.0, 2.0, MID, 1_000);
        assert_eq!(book.len(), 2);
        assert_eq!(insert_count(&book.drain_ops()), 2);
    }
}
