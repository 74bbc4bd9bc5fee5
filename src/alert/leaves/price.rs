// =============================================================================
// Price-Change Leaf
// =============================================================================
//
// Compares the latest price against the price `window_sec` earlier (anchored
// on the symbol's own latest tick).
//
//   '>'  fires when the move exceeds ±percent (either direction)
//   '<'  fires when the move stayed inside the ±percent band
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;

use crate::alert::leaf::{Direction, Leaf, LeafSpec, MatchedSet};
use crate::store::{MetricFamily, MetricStore};

pub struct PriceChangeLeaf {
    spec: LeafSpec,
    matched: MatchedSet,
}

impl PriceChangeLeaf {
    pub fn new(spec: LeafSpec) -> Self {
        debug_assert!(matches!(spec, LeafSpec::PriceChange { .. }));
        Self {
            spec,
            matched: MatchedSet::new(),
        }
    }

    fn params(&self) -> (Direction, f64, i64) {
        match &self.spec {
            LeafSpec::PriceChange {
                direction,
                percent,
                window_sec,
                ..
            } => (*direction, *percent, *window_sec),
            _ => unreachable!("constructed with a PriceChange spec"),
        }
    }

    fn trigger(direction: Direction, percent: f64, change_pct: f64) -> bool {
        match direction {
            Direction::Above => change_pct > percent || change_pct < -percent,
            Direction::Below => change_pct.abs() <= percent,
        }
    }
}

#[async_trait]
impl Leaf for PriceChangeLeaf {
    fn spec(&self) -> &LeafSpec {
        &self.spec
    }

    async fn update(&self, store: &MetricStore) -> anyhow::Result<()> {
        let (direction, percent, window_sec) = self.params();
        let rows = store.query_window_change_pct(MetricFamily::Price, window_sec)?;

        let mut matched = HashSet::new();
        for row in rows {
            if row.past == 0.0 {
                continue;
            }
            let change_pct = (row.current / row.past - 1.0) * 100.0;
            if Self::trigger(direction, percent, change_pct) {
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
