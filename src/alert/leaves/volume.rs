// =============================================================================
// Volume Family Leaves — absolute volume, volume change, trade-count change
// =============================================================================
//
// All three read windowed aggregates anchored on the per-symbol latest row.
// The two change leaves share semantics: '>' fires on a rise of at least
// `percent`, '<' on a drop of at least `percent` (directional, unlike the
// price leaf's symmetric band).
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;

use crate::alert::leaf::{Direction, Leaf, LeafSpec, MatchedSet};
use crate::store::{MetricFamily, MetricStore};

/// Sign-preserving relative change in percent; 0 when there is no baseline.
fn relative_change_pct(current: f64, previous: f64) -> f64 {
    if previous == 0.0 {
        return 0.0;
    }
    (current - previous) / previous * 100.0
}

fn change_trigger(direction: Direction, percent: f64, change_pct: f64) -> bool {
    match direction {
        Direction::Above => change_pct >= percent,
        Direction::Below => change_pct <= -percent,
    }
}

// =============================================================================
// Absolute volume
// =============================================================================

/// Sum of quote volume over the window compared against a USD threshold.
pub struct VolumeAbsLeaf {
    spec: LeafSpec,
    matched: MatchedSet,
}

impl VolumeAbsLeaf {
    pub fn new(spec: LeafSpec) -> Self {
        debug_assert!(matches!(spec, LeafSpec::VolumeAbs { .. }));
        Self {
            spec,
            matched: MatchedSet::new(),
        }
    }
}

#[async_trait]
impl Leaf for VolumeAbsLeaf {
    fn spec(&self) -> &LeafSpec {
        &self.spec
    }

    async fn update(&self, store: &MetricStore) -> anyhow::Result<()> {
        let LeafSpec::VolumeAbs {
            direction,
            threshold_usd,
            window_sec,
            ..
        } = &self.spec
        else {
            unreachable!("constructed with a VolumeAbs spec");
        };

        let rows = store.query_window_sum(MetricFamily::Volume, *window_sec)?;
        let mut matched = HashSet::new();
        for (symbol, sum) in rows {
            let hit = match direction {
                Direction::Above => sum >= *threshold_usd,
                Direction::Below => sum <= *threshold_usd,
            };
            if hit {
                matched.insert(symbol);
            }
        }
        self.matched.replace(matched);
        Ok(())
    }

    fn matched_symbols(&self) -> Arc<HashSet<String>> {
        self.matched.get()
    }
}

// =============================================================================
// Volume change
// =============================================================================

/// Percent change between the trailing window and the one before it.
pub struct VolumeChangeLeaf {
    spec: LeafSpec,
    matched: MatchedSet,
}

impl VolumeChangeLeaf {
    pub fn new(spec: LeafSpec) -> Self {
        debug_assert!(matches!(spec, LeafSpec::VolumeChange { .. }));
        Self {
            spec,
            matched: MatchedSet::new(),
        }
    }
}

#[async_trait]
impl Leaf for VolumeChangeLeaf {
    fn spec(&self) -> &LeafSpec {
        &self.spec
    }

    async fn update(&self, store: &MetricStore) -> anyhow::Result<()> {
        let LeafSpec::VolumeChange {
            direction,
            percent,
            window_sec,
            ..
        } = &self.spec
        else {
            unreachable!("constructed with a VolumeChange spec");
        };

        let rows = store.query_two_windows(MetricFamily::Volume, *window_sec)?;
        let mut matched = HashSet::new();
        for row in rows {
            let change = relative_change_pct(row.current, row.previous);
            if change_trigger(*direction, *percent, change) {
                matched.insert(row.symbol);
            }
        }
        self.matched.replace(matched);
        Ok(())
    }

    fn matched_symbols(&self) -> Arc<HashSet<String>> {
        self.matched.get()
    }
}

// =============================================================================
// Trade-count change
// =============================================================================

/// Same two-window percent change, over per-minute trade counts.
pub struct TradeCountLeaf {
    spec: LeafSpec,
    matched: MatchedSet,
}

impl TradeCountLeaf {
    pub fn new(spec: LeafSpec) -> Self {
        debug_assert!(matches!(spec, LeafSpec::TradeCountChange { .. }));
        Self {
            spec,
            matched: MatchedSet::new(),
        }
    }
}

#[async_trait]
impl Leaf for TradeCountLeaf {
    fn spec(&self) -> &LeafSpec {
        &self.spec
    }

    async fn update(&self, store: &MetricStore) -> anyhow::Result<()> {
        let LeafSpec::TradeCountChange {
            direction,
            percent,
            window_sec,
            ..
        } = &self.spec
        else {
            unreachable!("constructed with a TradeCountChange spec");
        };

        let rows = store.query_two_windows(MetricFamily::TradeCount, *window_sec)?;
        let mut matched = HashSet::new();
        for row in rows {
            let change = relative_change_pct(row.current, row.previous);
            if change_trigger(*direction, *percent, change) {
                matched.insert(row.symbol);
            }
        }
        self.matched.replace(matched);
        Ok(())
    }

    fn matched_symbols(&self) -> Arc<HashSet<String>> {
        self.matched.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::parser::{CmpOp, Condition};
    use crate::store::{TradeCountRow, VolumeRow};

    fn spec(module: &str, op: CmpOp, params: &[f64]) -> LeafSpec {
        LeafSpec::from_condition(&Condition {
            module: module.into(),
            op,
            params: params.to_vec(),
        })
        .unwrap()
    }

    fn seed_volumes(store: &MetricStore, rows: &[(i64, &str, f64)]) {
        let rows: Vec<VolumeRow> = rows
            .iter()
            .map(|(ts, s, v)| VolumeRow {
                ts: *ts,
                symbol: s.to_string(),
                quote_volume: *v,
            })
            .collect();
        store.upsert_volumes(&rows).unwrap();
    }

    #[tokio::test]
    async fn volume_abs_compares_window_sum() {
        let store = MetricStore::open_in_memory().unwrap();
        seed_volumes(
            &store,
            &[
                (10_000, "BTCUSDT", 600_000.0),
                (50_000, "BTCUSDT", 500_000.0),
                (50_000, "ETHUSDT", 100_000.0),
            ],
        );

        let leaf = VolumeAbsLeaf::new(spec("volume", CmpOp::Gt, &[1_000_000.0, 60.0]));
        leaf.update(&store).await.unwrap();
        let matched = leaf.matched_symbols();
        assert!(matched.contains("BTCUSDT"));
        assert!(!matched.contains("ETHUSDT"));
    }

    #[tokio::test]
    async fn volume_change_below_is_a_directional_drop() {
        let store = MetricStore::open_in_memory().unwrap();
        seed_volumes(
            &store,
            &[
                // Previous window (60s, 120s]: 1000; current (120s, 180s]: 400.
                (90_000, "BTCUSDT", 1000.0),
                (180_000, "BTCUSDT", 400.0),
                // ETH rises instead: must not match '<'.
                (90_000, "ETHUSDT", 400.0),
                (180_000, "ETHUSDT", 1000.0),
            ],
        );

        let leaf = VolumeChangeLeaf::new(spec("volume_change", CmpOp::Lt, &[50.0, 60.0]));
        leaf.update(&store).await.unwrap();
        let matched = leaf.matched_symbols();
        assert!(matched.contains("BTCUSDT"));
        assert!(!matched.contains("ETHUSDT"));

        let leaf = VolumeChangeLeaf::new(spec("volume_change", CmpOp::Gt, &[100.0, 60.0]));
        leaf.update(&store).await.unwrap();
        let matched = leaf.matched_symbols();
        assert!(matched.contains("ETHUSDT"));
        assert!(!matched.contains("BTCUSDT"));
    }

    #[tokio::test]
    async fn trade_count_change_matches_rises() {
        let store = MetricStore::open_in_memory().unwrap();
        let rows = vec![
            TradeCountRow {
                ts: 90_000,
                symbol: "BTCUSDT".into(),
                trade_count: 100,
            },
            TradeCountRow {
                ts: 180_000,
                symbol: "BTCUSDT".into(),
                trade_count: 250,
            },
        ];
        store.upsert_trade_counts(&rows).unwrap();

        let leaf = TradeCountLeaf::new(spec("order_num", CmpOp::Gt, &[100.0, 60.0]));
        leaf.update(&store).await.unwrap();
        assert!(leaf.matched_symbols().contains("BTCUSDT"));
    }
}
