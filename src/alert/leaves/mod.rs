// =============================================================================
// Leaf Implementations — one evaluator per metric family
// =============================================================================

pub mod funding;
pub mod oi;
pub mod order;
pub mod price;
pub mod volume;

use std::sync::Arc;

use crate::alert::leaf::{Leaf, LeafSpec};

/// Instantiate the evaluator for a spec.
pub fn build_leaf(spec: LeafSpec) -> Arc<dyn Leaf> {
    match &spec {
        LeafSpec::PriceChange { .. } => Arc::new(price::PriceChangeLeaf::new(spec)),
        LeafSpec::VolumeAbs { .. } => Arc::new(volume::VolumeAbsLeaf::new(spec)),
        LeafSpec::VolumeChange { .. } => Arc::new(volume::VolumeChangeLeaf::new(spec)),
        LeafSpec::TradeCountChange { .. } => Arc::new(volume::TradeCountLeaf::new(spec)),
        LeafSpec::OiDeviation { .. } => Arc::new(oi::OiDeviationLeaf::new(spec)),
        LeafSpec::OiAbs { .. } => Arc::new(oi::OiAbsLeaf::new(spec)),
        LeafSpec::Funding { .. } => Arc::new(funding::FundingLeaf::new(spec)),
        LeafSpec::OrderDensity { .. } => Arc::new(order::OrderDensityLeaf::new(spec)),
    }
}
