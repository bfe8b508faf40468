//! Calibration Engine
//!
//! Monotonic dampening of a gated market's probability and edge. Layers are
//! applied in order and combine multiplicatively:
//!
//! 1. **League baseline clamp** - rolling league bias beyond a trigger
//! 2. **Market anchor penalty** - deviation of the fair line from the market
//! 3. **Variance suppression** - simulated std dev against the league median
//! 4. **Publish gate** - minimum adjusted probability and edge
//!
//! Every factor lies in (0, 1], so the adjusted edge never exceeds the raw edge
//! in magnitude and never changes sign. The adjusted probability shrinks toward
//! 0.5 by the same factor.
//!
//! # Elite override
//!
//! A hard market deviation or extreme variance blocks publication unless the
//! elite override holds: raw probability, variance z-score and data quality all
//! clear their bars at once. Each condition is evaluated independently, the
//! override is logged on its own target, and the publish gate re-verifies it.

use crate::config::{EliteOverrideThresholds, MarketThresholds};
use crate::decision::edge::{CheckedInputs, RawEdge, BOUNDARY_EPSILON};
use crate::decision::reason::{DecisionReason, RiskFlag};
use crate::models::LeagueBaseline;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Log target for elite override events.
pub const ELITE_OVERRIDE_TARGET: &str = "edge_decision_engine::elite_override";

// =============================================================================
// ELITE OVERRIDE
// =============================================================================

/// The three elite override conditions, each recorded separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EliteOverrideCheck {
    pub probability_ok: bool,
    pub variance_ok: bool,
    pub data_quality_ok: bool,
}

impl EliteOverrideCheck {
    pub fn evaluate(
        raw_probability: f64,
        variance_z: Option<f64>,
        data_quality: f64,
        thresholds: &EliteOverrideThresholds,
    ) -> Self {
        Self {
            probability_ok: raw_probability >= thresholds.min_probability,
            variance_ok: variance_z.map_or(false, |z| z <= thresholds.max_variance_z),
            data_quality_ok: data_quality >= thresholds.min_data_quality,
        }
    }

    pub fn holds(&self) -> bool {
        self.probability_ok && self.variance_ok && self.data_quality_ok
    }
}

// =============================================================================
// RESULT
// =============================================================================

/// Outcome of calibrating one market.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationResult {
    /// Probability of the preferred selection before dampening.
    pub raw_probability: f64,
    pub adjusted_probability: f64,
    /// Signed edge, home/over perspective.
    pub raw_edge: f64,
    pub adjusted_edge: f64,
    pub variance_z: Option<f64>,
    pub bias_factor: f64,
    pub anchor_factor: f64,
    pub variance_factor: f64,
    pub elite_check: EliteOverrideCheck,
    /// True when the override was used to bypass a hard block.
    pub elite_override: bool,
    /// Penalties actually applied.
    pub penalties: Vec<DecisionReason>,
    /// Reasons publication is refused. Empty iff `publish`.
    pub block_reasons: Vec<DecisionReason>,
    pub risk_flags: Vec<RiskFlag>,
    pub publish: bool,
}

impl CalibrationResult {
    pub fn combined_factor(&self) -> f64 {
        self.bias_factor * self.anchor_factor * self.variance_factor
    }

    pub fn adjusted_edge_magnitude(&self) -> f64 {
        self.adjusted_edge.abs()
    }
}

// =============================================================================
// LAYERS
// =============================================================================

/// League dampening factor, or None when neither bias exceeds its trigger.
///
/// The factor falls linearly with the larger excess and is floored, so it is
/// always positive and cannot invert the preferred side.
pub fn league_bias_factor(
    baseline: &LeagueBaseline,
    thresholds: &MarketThresholds,
) -> Option<f64> {
    let c = &thresholds.calibration;
    let excess_actual = baseline.bias_vs_actual.abs() - c.bias_actual_trigger;
    let excess_market = baseline.bias_vs_market.abs() - c.bias_market_trigger;

    if !excess_actual.is_finite() || !excess_market.is_finite() {
        return Some(c.bias_dampening_floor);
    }
    let excess = excess_actual.max(excess_market);
    if excess <= 0.0 {
        return None;
    }
    Some((1.0 - c.bias_dampening_slope * excess).clamp(c.bias_dampening_floor, 1.0))
}

/// Market anchor factor for a deviation. Returns (factor, at_or_beyond_hard).
pub fn market_anchor_factor(deviation: f64, thresholds: &MarketThresholds) -> (f64, bool) {
    let c = &thresholds.calibration;
    if deviation < c.anchor_soft {
        (1.0, false)
    } else if deviation < c.anchor_hard {
        let span = c.anchor_hard - c.anchor_soft;
        let progress = (deviation - c.anchor_soft) / span;
        (1.0 - (1.0 - c.anchor_floor) * progress, false)
    } else {
        (c.anchor_floor, true)
    }
}

/// Simulated std dev over the league's rolling median for this market type.
pub fn variance_z_score(inputs: &CheckedInputs<'_>, baseline: &LeagueBaseline) -> Option<f64> {
    baseline
        .median_std_dev_for(inputs.market_type)
        .filter(|median| median.is_finite() && *median > 0.0)
        .map(|median| inputs.std_dev / median)
}

/// Variance bands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarianceBand {
    Normal,
    Elevated,
    High,
    Extreme,
}

pub fn variance_band(z: f64, thresholds: &MarketThresholds) -> VarianceBand {
    let c = &thresholds.calibration;
    if z < c.variance_normal {
        VarianceBand::Normal
    } else if z < c.variance_high {
        VarianceBand::Elevated
    } else if z < c.variance_extreme {
        VarianceBand::High
    } else {
        VarianceBand::Extreme
    }
}

// =============================================================================
// ENGINE
// =============================================================================

/// Calibrate a market that passed every gate.
pub fn calibrate(
    inputs: &CheckedInputs<'_>,
    raw: &RawEdge,
    baseline: &LeagueBaseline,
    thresholds: &MarketThresholds,
) -> CalibrationResult {
    let c = &thresholds.calibration;
    let mut penalties = Vec::new();
    let mut block_reasons = Vec::new();
    let mut risk_flags = Vec::new();

    let simulation = inputs.simulation;
    if simulation.iterations < thresholds.gates.min_iterations {
        risk_flags.push(RiskFlag::LowIterationCount);
    }
    if simulation.convergence < thresholds.gates.min_convergence {
        risk_flags.push(RiskFlag::WeakConvergence);
    }

    let variance_z = variance_z_score(inputs, baseline);
    let elite_check = EliteOverrideCheck::evaluate(
        raw.preferred_probability,
        variance_z,
        simulation.data_quality,
        &c.elite,
    );
    let mut elite_override = false;

    // 1. League baseline clamp
    let bias_factor = match league_bias_factor(baseline, thresholds) {
        Some(factor) => {
            penalties.push(DecisionReason::LeagueBiasDampening { factor });
            risk_flags.push(RiskFlag::LeagueBiasDampened);
            factor
        }
        None => 1.0,
    };

    // 2. Market anchor penalty
    let deviation = raw.magnitude();
    let (mut anchor_factor, beyond_hard) = market_anchor_factor(deviation, thresholds);
    if beyond_hard {
        risk_flags.push(RiskFlag::MarketDeviation);
        if elite_check.holds() {
            elite_override = true;
            anchor_factor = 1.0;
            log_elite_override(inputs, "market_deviation", deviation, variance_z);
        } else {
            penalties.push(DecisionReason::MarketAnchorPenalty {
                deviation,
                factor: anchor_factor,
            });
            block_reasons.push(DecisionReason::MarketDeviationHard {
                deviation,
                hard_threshold: c.anchor_hard,
            });
        }
    } else if anchor_factor < 1.0 {
        risk_flags.push(RiskFlag::MarketDeviation);
        penalties.push(DecisionReason::MarketAnchorPenalty {
            deviation,
            factor: anchor_factor,
        });
    }

    // 3. Variance suppression
    let variance_factor = match variance_z {
        None => {
            block_reasons.push(DecisionReason::VarianceBaselineUnavailable);
            1.0
        }
        Some(z) => match variance_band(z, thresholds) {
            VarianceBand::Normal => 1.0,
            VarianceBand::Elevated => {
                risk_flags.push(RiskFlag::VarianceElevated);
                penalties.push(DecisionReason::VariancePenalty {
                    z_score: z,
                    factor: c.variance_elevated_penalty,
                });
                c.variance_elevated_penalty
            }
            VarianceBand::High => {
                risk_flags.push(RiskFlag::VarianceHigh);
                penalties.push(DecisionReason::VariancePenalty {
                    z_score: z,
                    factor: c.variance_high_penalty,
                });
                c.variance_high_penalty
            }
            VarianceBand::Extreme => {
                risk_flags.push(RiskFlag::VarianceHigh);
                penalties.push(DecisionReason::VariancePenalty {
                    z_score: z,
                    factor: c.variance_high_penalty,
                });
                if elite_check.holds() {
                    elite_override = true;
                    log_elite_override(inputs, "variance_extreme", deviation, variance_z);
                } else {
                    block_reasons.push(DecisionReason::VarianceExtreme {
                        z_score: z,
                        extreme_threshold: c.variance_extreme,
                    });
                }
                c.variance_high_penalty
            }
        },
    };

    if elite_override {
        penalties.push(DecisionReason::EliteOverrideApplied);
        risk_flags.push(RiskFlag::EliteOverride);
    }

    let factor = (bias_factor * anchor_factor * variance_factor).clamp(0.0, 1.0);
    let raw_probability = raw.preferred_probability;
    let adjusted_probability = 0.5 + (raw_probability - 0.5) * factor;
    let adjusted_edge = raw.signed * factor;

    // 4. Publish gate
    let p = &thresholds.publish;
    if adjusted_probability + BOUNDARY_EPSILON < p.min_probability {
        block_reasons.push(DecisionReason::ProbabilityBelowMinimum {
            probability: adjusted_probability,
            minimum: p.min_probability,
        });
    }
    if adjusted_edge.abs() + BOUNDARY_EPSILON < p.min_edge {
        block_reasons.push(DecisionReason::EdgeBelowMinimum {
            edge: adjusted_edge.abs(),
            minimum: p.min_edge,
        });
    }
    // The override must still hold once every penalty has been applied.
    if elite_override {
        let reverified = EliteOverrideCheck::evaluate(
            adjusted_probability,
            variance_z,
            simulation.data_quality,
            &c.elite,
        );
        if !reverified.holds() {
            warn!(
                target: ELITE_OVERRIDE_TARGET,
                contest = %simulation.contest_id,
                market = %inputs.market_type,
                adjusted_probability,
                "elite override did not survive calibration"
            );
            block_reasons.push(DecisionReason::EliteOverrideUnverified);
        }
    }

    let publish = block_reasons.is_empty();
    debug!(
        contest = %simulation.contest_id,
        market = %inputs.market_type,
        raw_edge = raw.signed,
        adjusted_edge,
        factor,
        publish,
        "calibrated market"
    );

    CalibrationResult {
        raw_probability,
        adjusted_probability,
        raw_edge: raw.signed,
        adjusted_edge,
        variance_z,
        bias_factor,
        anchor_factor,
        variance_factor,
        elite_check,
        elite_override,
        penalties,
        block_reasons,
        risk_flags,
        publish,
    }
}

fn log_elite_override(
    inputs: &CheckedInputs<'_>,
    bypassed: &str,
    deviation: f64,
    variance_z: Option<f64>,
) {
    warn!(
        target: ELITE_OVERRIDE_TARGET,
        contest = %inputs.simulation.contest_id,
        market = %inputs.market_type,
        bypassed,
        deviation,
        variance_z = ?variance_z,
        probability = inputs.probability,
        data_quality = inputs.simulation.data_quality,
        "elite override granted"
    );
}
