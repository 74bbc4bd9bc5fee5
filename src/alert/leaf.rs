// =============================================================================
// Leaf Listeners — one elementary predicate over one metric family
// =============================================================================
//
// Leaves are the only readers of the metric store at evaluation time. Each
// leaf periodically recomputes its matched symbol set and publishes it as an
// immutable snapshot; composites read whatever snapshot is current. Identical
// parameters always produce the same fingerprint, which is what the manager
// dedups on.
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::alert::parser::{CmpOp, Condition};
use crate::store::MetricStore;

/// Default poll interval for the fixed-cadence leaves (OI, funding, order).
const DEFAULT_POLL_SEC: u64 = 60;

/// Direction of a leaf comparison. Only `>` and `<` carry leaf semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Above,
    Below,
}

impl Direction {
    fn from_op(op: CmpOp) -> Option<Self> {
        match op {
            CmpOp::Gt | CmpOp::Ge => Some(Direction::Above),
            CmpOp::Lt | CmpOp::Le => Some(Direction::Below),
            _ => None,
        }
    }

    fn tag(self) -> &'static str {
        match self {
            Direction::Above => ">",
            Direction::Below => "<",
        }
    }
}

/// A condition that parsed fine but cannot be turned into a leaf.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ResolveError {
    #[error("module \"{module}\" does not support operator \"{op}\" (use > or <)")]
    UnsupportedOperator { module: String, op: String },
    #[error("module \"{module}\": {reason}")]
    InvalidParameter { module: String, reason: String },
    #[error("unknown module \"{0}\"")]
    UnknownModule(String),
}

/// Typed parameter record per metric family. The closed set of variants is
/// what makes fingerprints deterministic.
#[derive(Debug, Clone, PartialEq)]
pub enum LeafSpec {
    PriceChange {
        direction: Direction,
        percent: f64,
        window_sec: i64,
        poll_sec: u64,
    },
    VolumeAbs {
        direction: Direction,
        threshold_usd: f64,
        window_sec: i64,
        poll_sec: u64,
    },
    VolumeChange {
        direction: Direction,
        percent: f64,
        window_sec: i64,
        poll_sec: u64,
    },
    TradeCountChange {
        direction: Direction,
        percent: f64,
        window_sec: i64,
        poll_sec: u64,
    },
    OiDeviation {
        direction: Direction,
        percent: f64,
    },
    OiAbs {
        direction: Direction,
        threshold_usd: f64,
    },
    Funding {
        direction: Direction,
        percent: f64,
        time_threshold_sec: i64,
    },
    OrderDensity {
        direction: Direction,
        size_usd: f64,
        max_percent: f64,
        min_duration_sec: i64,
    },
}

impl LeafSpec {
    /// Resolve a parsed condition into a typed leaf spec.
    ///
    /// Window/poll conventions follow the DSL: `module OP p1 window [poll]`
    /// with `poll` defaulting to the window; the fixed-cadence modules take
    /// no window at all.
    pub fn from_condition(cond: &Condition) -> Result<Self, ResolveError> {
        let direction =
            Direction::from_op(cond.op).ok_or_else(|| ResolveError::UnsupportedOperator {
                module: cond.module.clone(),
                op: cond.op.to_string(),
            })?;

        let window = |idx: usize| -> Result<i64, ResolveError> {
            let w = cond.params[idx];
            if w < 1.0 {
                return Err(ResolveError::InvalidParameter {
                    module: cond.module.clone(),
                    reason: format!("window must be at least 1 second, got {w}"),
                });
            }
            Ok(w as i64)
        };
        // Optional third parameter: the poll interval, defaulting to the window.
        let poll = |window_sec: i64| -> u64 {
            cond.params
                .get(2)
                .map(|p| (*p).max(1.0) as u64)
                .unwrap_or(window_sec as u64)
        };

        match cond.module.as_str() {
            "price" => {
                let window_sec = window(1)?;
                Ok(LeafSpec::PriceChange {
                    direction,
                    percent: cond.params[0],
                    window_sec,
                    poll_sec: poll(window_sec),
                })
            }
            "volume" => {
                let window_sec = window(1)?;
                Ok(LeafSpec::VolumeAbs {
                    direction,
                    threshold_usd: cond.params[0],
                    window_sec,
                    poll_sec: poll(window_sec),
                })
            }
            "volume_change" => {
                let window_sec = window(1)?;
                Ok(LeafSpec::VolumeChange {
                    direction,
                    percent: cond.params[0],
                    window_sec,
                    poll_sec: poll(window_sec),
                })
            }
            "order_num" => {
                let window_sec = window(1)?;
                Ok(LeafSpec::TradeCountChange {
                    direction,
                    percent: cond.params[0],
                    window_sec,
                    poll_sec: poll(window_sec),
                })
            }
            "oi" => Ok(LeafSpec::OiDeviation {
                direction,
                percent: cond.params[0],
            }),
            "oi_sum" => Ok(LeafSpec::OiAbs {
                direction,
                threshold_usd: cond.params[0],
            }),
            "funding" => Ok(LeafSpec::Funding {
                direction,
                percent: cond.params[0],
                time_threshold_sec: cond.params[1] as i64,
            }),
            "order" => Ok(LeafSpec::OrderDensity {
                direction,
                size_usd: cond.params[0],
                max_percent: cond.params[1],
                min_duration_sec: cond.params[2] as i64,
            }),
            other => Err(ResolveError::UnknownModule(other.to_string())),
        }
    }

    /// Re-evaluation cadence of this leaf.
    pub fn poll_interval(&self) -> Duration {
        let secs = match self {
            LeafSpec::PriceChange { poll_sec, .. }
            | LeafSpec::VolumeAbs { poll_sec, .. }
            | LeafSpec::VolumeChange { poll_sec, .. }
            | LeafSpec::TradeCountChange { poll_sec, .. } => *poll_sec,
            LeafSpec::OiDeviation { .. }
            | LeafSpec::OiAbs { .. }
            | LeafSpec::Funding { .. }
            | LeafSpec::OrderDensity { .. } => DEFAULT_POLL_SEC,
        };
        Duration::from_secs(secs.max(1))
    }

    /// Canonical parameter rendering: the dedup key before hashing.
    pub fn canonical(&self) -> String {
        match self {
            LeafSpec::PriceChange {
                direction,
                percent,
                window_sec,
                poll_sec,
            } => format!("price_change {} {percent} {window_sec} {poll_sec}", direction.tag()),
            LeafSpec::VolumeAbs {
                direction,
                threshold_usd,
                window_sec,
                poll_sec,
            } => format!("volume_abs {} {threshold_usd} {window_sec} {poll_sec}", direction.tag()),
            LeafSpec::VolumeChange {
                direction,
                percent,
                window_sec,
                poll_sec,
            } => format!("volume_change {} {percent} {window_sec} {poll_sec}", direction.tag()),
            LeafSpec::TradeCountChange {
                direction,
                percent,
                window_sec,
                poll_sec,
            } => format!("trade_count {} {percent} {window_sec} {poll_sec}", direction.tag()),
            LeafSpec::OiDeviation { direction, percent } => {
                format!("oi_deviation {} {percent}", direction.tag())
            }
            LeafSpec::OiAbs {
                direction,
                threshold_usd,
            } => format!("oi_abs {} {threshold_usd}", direction.tag()),
            LeafSpec::Funding {
                direction,
                percent,
                time_threshold_sec,
            } => format!("funding {} {percent} {time_threshold_sec}", direction.tag()),
            LeafSpec::OrderDensity {
                direction,
                size_usd,
                max_percent,
                min_duration_sec,
            } => format!(
                "order_density {} {size_usd} {max_percent} {min_duration_sec}",
                direction.tag()
            ),
        }
    }

    /// Deterministic dedup key.
    pub fn fingerprint(&self) -> String {
        crate::alert::parser::fingerprint_str(&self.canonical())
    }
}

// =============================================================================
// The leaf contract
// =============================================================================

/// Atomically replaced matched-set snapshot. Readers hold an `Arc` to
/// whatever generation they captured; writers never mutate in place.
pub struct MatchedSet {
    inner: RwLock<Arc<HashSet<String>>>,
}

impl MatchedSet {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Arc::new(HashSet::new())),
        }
    }

    pub fn replace(&self, set: HashSet<String>) {
        *self.inner.write() = Arc::new(set);
    }

    pub fn get(&self) -> Arc<HashSet<String>> {
        self.inner.read().clone()
    }
}

impl Default for MatchedSet {
    fn default() -> Self {
        Self::new()
    }
}

/// The contract every leaf implements. `update` runs serialized on the
/// leaf's own task; `matched_symbols` may be called from anywhere.
#[async_trait]
pub trait Leaf: Send + Sync {
    /// The typed parameters this leaf was built from.
    fn spec(&self) -> &LeafSpec;

    /// Recompute the matched set against the store.
    async fn update(&self, store: &MetricStore) -> anyhow::Result<()>;

    /// The snapshot captured at the last successful `update`.
    fn matched_symbols(&self) -> Arc<HashSet<String>>;

    fn poll_interval(&self) -> Duration {
        self.spec().poll_interval()
    }

    fn fingerprint(&self) -> String {
        self.spec().fingerprint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cond(module: &str, op: CmpOp, params: &[f64]) -> Condition {
        Condition {
            module: module.to_string(),
            op,
            params: params.to_vec(),
        }
    }

    #[test]
    fn poll_defaults_to_window_for_windowed_leaves() {
        let spec = LeafSpec::from_condition(&cond("price", CmpOp::Gt, &[5.0, 300.0])).unwrap();
        assert_eq!(spec.poll_interval(), Duration::from_secs(300));

        let spec =
            LeafSpec::from_condition(&cond("price", CmpOp::Gt, &[5.0, 300.0, 30.0])).unwrap();
        assert_eq!(spec.poll_interval(), Duration::from_secs(30));
    }

    #[test]
    fn fixed_cadence_leaves_poll_every_minute() {
        let spec = LeafSpec::from_condition(&cond("oi", CmpOp::Lt, &[20.0])).unwrap();
        assert_eq!(spec.poll_interval(), Duration::from_secs(60));
    }

    #[test]
    fn identical_params_identical_fingerprint() {
        let a = LeafSpec::from_condition(&cond("price", CmpOp::Gt, &[5.0, 300.0])).unwrap();
        let b = LeafSpec::from_condition(&cond("price", CmpOp::Gt, &[5.0, 300.0])).unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());

        let c = LeafSpec::from_condition(&cond("price", CmpOp::Lt, &[5.0, 300.0])).unwrap();
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn equality_operators_are_rejected_with_a_message() {
        let err = LeafSpec::from_condition(&cond("price", CmpOp::Eq, &[5.0, 300.0])).unwrap_err();
        assert!(matches!(err, ResolveError::UnsupportedOperator { .. }));
        assert!(err.to_string().contains("=="));
    }

    #[test]
    fn zero_window_is_rejected() {
        let err = LeafSpec::from_condition(&cond("price", CmpOp::Gt, &[5.0, 0.0])).unwrap_err();
        assert!(matches!(err, ResolveError::InvalidParameter { .. }));
    }

    #[test]
    fn matched_set_snapshots_are_immutable() {
        let matched = MatchedSet::new();
        matched.replace(HashSet::from(["BTCUSDT".to_string()]));
        let before = matched.get();
        matched.replace(HashSet::from(["ETHUSDT".to_string()]));
        // The previously captured snapshot is unchanged.
        assert!(before.contains("BTCUSDT"));
        assert!(!before.contains("ETHUSDT"));
        assert!(matched.get().contains("ETHUSDT"));
    }
}
