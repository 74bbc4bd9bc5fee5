// =============================================================================
// Open-Interest Leaves — deviation from median, absolute threshold
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;

use crate::alert::leaf::{Direction, Leaf, LeafSpec, MatchedSet};
use crate::store::{MetricFamily, MetricStore};

/// History window the deviation is measured against (24 hours).
const OI_HISTORY_SEC: i64 = 24 * 60 * 60;

/// Deviation of the current OI from its 24-hour median, in percent.
///
///   '>'  fires when the deviation is at least `percent`
///   '<'  fires when |deviation| is within `percent`
pub struct OiDeviationLeaf {
    spec: LeafSpec,
    matched: MatchedSet,
}

impl OiDeviationLeaf {
    pub fn new(spec: LeafSpec) -> Self {
        debug_assert!(matches!(spec, LeafSpec::OiDeviation { .. }));
        Self {
            spec,
            matched: MatchedSet::new(),
        }
    }
}

#[async_trait]
impl Leaf for OiDeviationLeaf {
    fn spec(&self) -> &LeafSpec {
        &self.spec
    }

    async fn update(&self, store: &MetricStore) -> anyhow::Result<()> {
        let LeafSpec::OiDeviation { direction, percent } = &self.spec else {
            unreachable!("constructed with an OiDeviation spec");
        };

        let rows = store.query_median(MetricFamily::OpenInterest, OI_HISTORY_SEC)?;
        let mut matched = HashSet::new();
        for row in rows {
            if row.median == 0.0 {
                continue;
            }
            let deviation_pct = (row.current / row.median - 1.0) * 100.0;
            let hit = match direction {
                Direction::Above => deviation_pct >= *percent,
                Direction::Below => deviation_pct.abs() <= *percent,
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

/// Latest OI in USD compared against an absolute threshold.
pub struct OiAbsLeaf {
    spec: LeafSpec,
    matched: MatchedSet,
}

impl OiAbsLeaf {
    pub fn new(spec: LeafSpec) -> Self {
        debug_assert!(matches!(spec, LeafSpec::OiAbs { .. }));
        Self {
            spec,
            matched: MatchedSet::new(),
        }
    }
}

#[async_trait]
impl Leaf for OiAbsLeaf {
    fn spec(&self) -> &LeafSpec {
        &self.spec
    }

    async fn update(&self, store: &MetricStore) -> anyhow::Result<()> {
        let LeafSpec::OiAbs {
            direction,
            threshold_usd,
        } = &self.spec
        else {
            unreachable!("constructed with an OiAbs spec");
        };

        let rows = store.query_latest_per_symbol(MetricFamily::OpenInterest)?;
        let mut matched = HashSet::new();
        for row in rows {
            let hit = match direction {
                Direction::Above => row.value > *threshold_usd,
                Direction::Below => row.value < *threshold_usd,
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
    use crate::store::OpenInterestRow;

    fn spec(module: &str, op: CmpOp, params: &[f64]) -> LeafSpec {
        LeafSpec::from_condition(&Condition {
            module: module.into(),
            op,
            params: params.to_vec(),
        })
        .unwrap()
    }

    fn seed(store: &MetricStore, rows: &[(i64, &str, f64)]) {
        let rows: Vec<OpenInterestRow> = rows
            .iter()
            .map(|(ts, s, v)| OpenInterestRow {
                ts: *ts,
                symbol: s.to_string(),
                oi_usd: *v,
            })
            .collect();
        store.upsert_open_interest(&rows).unwrap();
    }

    #[tokio::test]
    async fn deviation_below_matches_near_median_symbols() {
        let store = MetricStore::open_in_memory().unwrap();
        seed(
            &store,
            &[
                // BTC sits at its median; ETH is 100% above it.
                (1_000, "BTCUSDT", 100.0),
                (2_000, "BTCUSDT", 100.0),
                (3_000, "BTCUSDT", 100.0),
                (1_000, "ETHUSDT", 100.0),
                (2_000, "ETHUSDT", 100.0),
                (3_000, "ETHUSDT", 200.0),
            ],
        );

        let leaf = OiDeviationLeaf::new(spec("oi", CmpOp::Lt, &[20.0]));
        leaf.update(&store).await.unwrap();
        let matched = leaf.matched_symbols();
        assert!(matched.contains("BTCUSDT"));
        assert!(!matched.contains("ETHUSDT"));

        let leaf = OiDeviationLeaf::new(spec("oi", CmpOp::Gt, &[50.0]));
        leaf.update(&store).await.unwrap();
        let matched = leaf.matched_symbols();
        assert!(matched.contains("ETHUSDT"));
        assert!(!matched.contains("BTCUSDT"));
    }

    #[tokio::test]
    async fn absolute_threshold_compares_latest_value() {
        let store = MetricStore::open_in_memory().unwrap();
        seed(
            &store,
            &[(1_000, "BTCUSDT", 5_000_000.0), (1_000, "ETHUSDT", 500.0)],
        );

        let leaf = OiAbsLeaf::new(spec("oi_sum", CmpOp::Gt, &[1_000_000.0]));
        leaf.update(&store).await.unwrap();
        let matched = leaf.matched_symbols();
        assert!(matched.contains("BTCUSDT"));
        assert!(!matched.contains("ETHUSDT"));
    }
}
