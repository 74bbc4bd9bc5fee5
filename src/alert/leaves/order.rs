// =============================================================================
// Order-Density Leaf
// =============================================================================
//
// Reads the persisted density table: records close enough to market
// (|percent_from_market| <= max_percent) that have rested for at least
// `min_duration_sec`, with the size compared per direction.
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;

use crate::alert::leaf::{Direction, Leaf, LeafSpec, MatchedSet};
use crate::store::MetricStore;

pub struct OrderDensityLeaf {
    spec: LeafSpec,
    matched: MatchedSet,
}

impl OrderDensityLeaf {
    pub fn new(spec: LeafSpec) -> Self {
        debug_assert!(matches!(spec, LeafSpec::OrderDensity { .. }));
        Self {
            spec,
            matched: MatchedSet::new(),
        }
    }
}

#[async_trait]
impl Leaf for OrderDensityLeaf {
    fn spec(&self) -> &LeafSpec {
        &self.spec
    }

    async fn update(&self, store: &MetricStore) -> anyhow::Result<()> {
        let LeafSpec::OrderDensity {
            direction,
            size_usd,
            max_percent,
            min_duration_sec,
        } = &self.spec
        else {
            unreachable!("constructed with an OrderDensity spec");
        };

        let now_ms = chrono::Utc::now().timestamp_millis();
        let rows = store.query_densities(*max_percent, *min_duration_sec, now_ms)?;

        let mut matched = HashSet::new();
        for row in rows {
            let hit = match direction {
                Direction::Above => row.current_size_usd >= *size_usd,
                Direction::Below => row.current_size_usd <= *size_usd,
            };
            if hit {
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
    use crate::store::{DensityOp, DensityRow};

    fn leaf(size_usd: f64, max_pct: f64, min_duration: f64) -> OrderDensityLeaf {
        OrderDensityLeaf::new(
            LeafSpec::from_condition(&Condition {
                module: "order".into(),
                op: CmpOp::Gt,
                params: vec![size_usd, max_pct, min_duration],
            })
            .unwrap(),
        )
    }

    fn density(symbol: &str, price: f64, size: f64, pct: f64, duration_ms: i64, now_ms: i64) -> DensityRow {
        DensityRow {
            symbol: symbol.into(),
            side: "LONG".into(),
            price,
            current_size_usd: size,
            max_size_usd: size,
            touched: false,
            reduction_usd: 0.0,
            percent_from_market: pct,
            first_seen: now_ms - duration_ms,
            last_updated: now_ms,
            duration_sec: duration_ms / 1000,
        }
    }

    #[tokio::test]
    async fn size_distance_and_duration_all_filter() {
        let store = MetricStore::open_in_memory().unwrap();
        let now_ms = chrono::Utc::now().timestamp_millis();
        let ops = vec![
            // Qualifies on every axis.
            DensityOp::Insert(density("BTCUSDT", 100_000.0, 2_000_000.0, 1.5, 600_000, now_ms)),
            // Too small.
            DensityOp::Insert(density("ETHUSDT", 3_000.0, 200_000.0, 1.5, 600_000, now_ms)),
            // Too far from market.
            DensityOp::Insert(density("XRPUSDT", 1.0, 2_000_000.0, 8.0, 600_000, now_ms)),
            // Too young.
            DensityOp::Insert(density("SOLUSDT", 150.0, 2_000_000.0, 1.5, 30_000, now_ms)),
        ];
        store.apply_density_ops(&ops, now_ms).unwrap();

        let leaf = leaf(1_000_000.0, 5.0, 300.0);
        leaf.update(&store).await.unwrap();
        let matched = leaf.matched_symbols();
        assert_eq!(matched.len(), 1);
        assert!(matched.contains("BTCUSDT"));
    }
}
