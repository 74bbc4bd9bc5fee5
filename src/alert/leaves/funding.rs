// =============================================================================
// Funding Leaf
// =============================================================================
//
// Fires on the magnitude of the funding rate (|rate| x 100, i.e. percent)
// AND proximity of the next settlement:
//
//   '>'  |rate_pct| >= percent
//   '<'  |rate_pct| <= percent
//   in both cases: 0 <= next_settlement - now <= time_threshold_sec
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;

use crate::alert::leaf::{Direction, Leaf, LeafSpec, MatchedSet};
use crate::store::MetricStore;

pub struct FundingLeaf {
    spec: LeafSpec,
    matched: MatchedSet,
}

impl FundingLeaf {
    pub fn new(spec: LeafSpec) -> Self {
        debug_assert!(matches!(spec, LeafSpec::Funding { .. }));
        Self {
            spec,
            matched: MatchedSet::new(),
        }
    }
}

#[async_trait]
impl Leaf for FundingLeaf {
    fn spec(&self) -> &LeafSpec {
        &self.spec
    }

    async fn update(&self, store: &MetricStore) -> anyhow::Result<()> {
        let LeafSpec::Funding {
            direction,
            percent,
            time_threshold_sec,
        } = &self.spec
        else {
            unreachable!("constructed with a Funding spec");
        };

        let now_ms = chrono::Utc::now().timestamp_millis();
        let rows = store.query_latest_funding(now_ms)?;

        let mut matched = HashSet::new();
        for row in rows {
            let rate_pct = (row.rate * 100.0).abs();
            let secs_left = (row.next_funding_ts - now_ms) / 1000;
            if secs_left < 0 {
                continue;
            }
            let rate_hit = match direction {
                Direction::Above => rate_pct >= *percent,
                Direction::Below => rate_pct <= *percent,
            };
            if rate_hit && secs_left <= *time_threshold_sec {
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
    use crate::store::FundingRow;

    fn leaf(op: CmpOp, percent: f64, threshold_sec: f64) -> FundingLeaf {
        FundingLeaf::new(
            LeafSpec::from_condition(&Condition {
                module: "funding".into(),
                op,
                params: vec![percent, threshold_sec],
            })
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn magnitude_and_settlement_proximity_both_required() {
        let store = MetricStore::open_in_memory().unwrap();
        let now_ms = chrono::Utc::now().timestamp_millis();
        store
            .upsert_funding_rates(&[
                // |0.15%| with settlement 5 min out: matches.
                FundingRow {
                    ts: now_ms,
                    symbol: "BTCUSDT".into(),
                    rate: -0.0015,
                    next_funding_ts: now_ms + 300_000,
                },
                // Big rate but settlement hours away: no match.
                FundingRow {
                    ts: now_ms,
                    symbol: "ETHUSDT".into(),
                    rate: 0.0030,
                    next_funding_ts: now_ms + 7_200_000,
                },
                // Settlement soon but tiny rate: no match.
                FundingRow {
                    ts: now_ms,
                    symbol: "XRPUSDT".into(),
                    rate: 0.0001,
                    next_funding_ts: now_ms + 300_000,
                },
            ])
            .unwrap();

        let leaf = leaf(CmpOp::Gt, 0.1, 600.0);
        leaf.update(&store).await.unwrap();
        let matched = leaf.matched_symbols();
        assert!(matched.contains("BTCUSDT"));
        assert!(!matched.contains("ETHUSDT"));
        assert!(!matched.contains("XRPUSDT"));
    }

    #[tokio::test]
    async fn below_matches_small_magnitudes() {
        let store = MetricStore::open_in_memory().unwrap();
        let now_ms = chrono::Utc::now().timestamp_millis();
        store
            .upsert_funding_rates(&[FundingRow {
                ts: now_ms,
                symbol: "XRPUSDT".into(),
                rate: -0.0001,
                next_funding_ts: now_ms + 60_000,
            }])
            .unwrap();

        let leaf = leaf(CmpOp::Lt, 0.05, 600.0);
        leaf.update(&store).await.unwrap();
        assert!(leaf.matched_symbols().contains("XRPUSDT"));
    }
}
