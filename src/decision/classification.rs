//! Classification Engine
//!
//! Maps calibrated (probability, edge) to a discrete state with frozen
//! thresholds. Boundary values belong to the upper bucket:
//!
//! ```text
//! |edge| <  aligned_below                      -> MARKET_ALIGNED
//! |edge| <  edge_at                            -> LEAN
//! |edge| >= edge_at and p outside (low, high)  -> EDGE
//! otherwise                                    -> LEAN
//! ```

use crate::config::ClassificationThresholds;
use crate::decision::reason::Classification;

/// Classify a calibrated edge. Only the edge magnitude matters; the
/// probability test is symmetric around 0.5.
pub fn classify(
    probability: f64,
    edge: f64,
    thresholds: &ClassificationThresholds,
) -> Classification {
    let magnitude = edge.abs();

    if magnitude < thresholds.aligned_below {
        return Classification::MarketAligned;
    }
    if magnitude < thresholds.edge_at {
        return Classification::Lean;
    }
    if probability >= thresholds.edge_probability_high
        || probability <= thresholds.edge_probability_low
    {
        return Classification::Edge;
    }
    Classification::Lean
}
