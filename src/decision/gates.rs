//! Validation Gate Pipeline
//!
//! Five fail-closed gates evaluated in fixed order:
//!
//! 1. **Data integrity** - required numbers present, finite, in range
//! 2. **Directional integrity** - simulated margin agrees with its own probability
//! 3. **Odds alignment** - simulation was run against the line the market shows now
//! 4. **Freshness** - simulation is recent enough relative to evaluation time
//! 5. **Model consistency** - cross-field coherence (contest, participants, pick, edge)
//!
//! Gates are pure functions of their inputs. Gates 2-5 all need the numbers
//! proven by gate 1, so when data integrity fails they are recorded as not
//! evaluated; otherwise every gate runs and records its own verdict even after
//! an earlier failure. The first failure decides the release status.

use crate::config::{ClassificationThresholds, GateThresholds, MarketThresholds};
use crate::decision::classification::classify;
use crate::decision::edge::{
    market_no_vig_probability, CheckedInputs, RawEdge, BOUNDARY_EPSILON, ZERO_LINE_EPSILON,
};
use crate::decision::reason::{
    Classification, DecisionReason, GateKind, ReleaseStatus, RequiredField,
};
use crate::models::{
    ContestMetadata, MarketSnapshot, MarketType, SelectionSide, SimulationSummary,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// REPORT TYPES
// =============================================================================

/// Verdict of a single gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateResult {
    pub gate: GateKind,
    /// False when a prerequisite gate failed and this gate could not run.
    pub evaluated: bool,
    pub passed: bool,
    pub reason: Option<DecisionReason>,
}

impl GateResult {
    fn from_check(gate: GateKind, check: Result<(), DecisionReason>) -> Self {
        match check {
            Ok(()) => Self {
                gate,
                evaluated: true,
                passed: true,
                reason: None,
            },
            Err(reason) => Self {
                gate,
                evaluated: true,
                passed: false,
                reason: Some(reason),
            },
        }
    }

    fn not_evaluated(gate: GateKind) -> Self {
        Self {
            gate,
            evaluated: false,
            passed: false,
            reason: None,
        }
    }
}

/// Per-gate verdicts in execution order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub results: Vec<GateResult>,
}

impl ValidationReport {
    pub fn passed(&self) -> bool {
        self.results.len() == GateKind::ORDER.len() && self.results.iter().all(|r| r.passed)
    }

    /// First gate that ran and failed.
    pub fn first_failure(&self) -> Option<&GateResult> {
        self.results.iter().find(|r| r.evaluated && !r.passed)
    }

    /// Release status implied by the first failing gate, if any.
    pub fn blocked_status(&self) -> Option<ReleaseStatus> {
        self.first_failure().map(|r| r.gate.blocked_status())
    }

    pub fn result(&self, gate: GateKind) -> Option<&GateResult> {
        self.results.iter().find(|r| r.gate == gate)
    }
}

/// Report plus the checked inputs later stages consume when data integrity passed.
#[derive(Debug, Clone)]
pub struct GateOutcome<'a> {
    pub report: ValidationReport,
    pub inputs: Option<CheckedInputs<'a>>,
    pub raw_edge: Option<RawEdge>,
}

// =============================================================================
// PIPELINE
// =============================================================================

/// Run all five gates for one market.
pub fn run_gates(
    simulation: Option<&SimulationSummary>,
    snapshot: Option<&MarketSnapshot>,
    contest: &ContestMetadata,
    market_type: MarketType,
    thresholds: &MarketThresholds,
    evaluated_at: DateTime<Utc>,
) -> ValidationReport {
    evaluate_gates(
        simulation,
        snapshot,
        contest,
        market_type,
        thresholds,
        evaluated_at,
    )
    .report
}

/// Run all five gates, keeping the checked inputs for calibration.
pub fn evaluate_gates<'a>(
    simulation: Option<&'a SimulationSummary>,
    snapshot: Option<&'a MarketSnapshot>,
    contest: &ContestMetadata,
    market_type: MarketType,
    thresholds: &MarketThresholds,
    evaluated_at: DateTime<Utc>,
) -> GateOutcome<'a> {
    let gates = &thresholds.gates;
    let mut results = Vec::with_capacity(GateKind::ORDER.len());

    let inputs = match check_data_integrity(simulation, snapshot, market_type) {
        Ok(inputs) => {
            results.push(GateResult::from_check(GateKind::DataIntegrity, Ok(())));
            inputs
        }
        Err(reason) => {
            results.push(GateResult::from_check(GateKind::DataIntegrity, Err(reason)));
            results.extend(
                GateKind::ORDER[1..]
                    .iter()
                    .map(|g| GateResult::not_evaluated(*g)),
            );
            return GateOutcome {
                report: ValidationReport { results },
                inputs: None,
                raw_edge: None,
            };
        }
    };

    let raw_edge = inputs.raw_edge();

    results.push(GateResult::from_check(
        GateKind::DirectionalIntegrity,
        check_directional_integrity(&inputs, gates),
    ));
    results.push(GateResult::from_check(
        GateKind::OddsAlignment,
        check_odds_alignment(&inputs, gates),
    ));
    results.push(GateResult::from_check(
        GateKind::Freshness,
        check_freshness(inputs.simulation, gates, evaluated_at),
    ));
    results.push(GateResult::from_check(
        GateKind::ModelConsistency,
        check_model_consistency(
            &inputs,
            &raw_edge,
            contest,
            &thresholds.classification,
            gates,
        ),
    ));

    GateOutcome {
        report: ValidationReport { results },
        inputs: Some(inputs),
        raw_edge: Some(raw_edge),
    }
}

// =============================================================================
// GATE 1: DATA INTEGRITY
// =============================================================================

fn require(value: Option<f64>, field: RequiredField) -> Result<f64, DecisionReason> {
    let value = value.ok_or(DecisionReason::MissingField { field })?;
    if !value.is_finite() {
        return Err(DecisionReason::MalformedField {
            field,
            detail: "value is not finite".to_string(),
        });
    }
    Ok(value)
}

fn require_probability(value: Option<f64>, field: RequiredField) -> Result<f64, DecisionReason> {
    let value = require(value, field)?;
    if !(0.0..=1.0).contains(&value) {
        return Err(DecisionReason::MalformedField {
            field,
            detail: format!("probability {} outside [0, 1]", value),
        });
    }
    Ok(value)
}

/// Check completeness and well-formedness, naming the first offending field.
pub fn check_data_integrity<'a>(
    simulation: Option<&'a SimulationSummary>,
    snapshot: Option<&'a MarketSnapshot>,
    market_type: MarketType,
) -> Result<CheckedInputs<'a>, DecisionReason> {
    let simulation = simulation.ok_or(DecisionReason::MissingField {
        field: RequiredField::Simulation,
    })?;
    let snapshot = snapshot.ok_or(DecisionReason::MissingField {
        field: RequiredField::MarketSnapshot,
    })?;

    let fair_line = match market_type {
        MarketType::Spread | MarketType::Total => {
            Some(require(simulation.fair_line, RequiredField::FairLine)?)
        }
        MarketType::Moneyline => None,
    };
    let probability = require_probability(simulation.probability, RequiredField::Probability)?;
    // A certain outcome has no fair American price.
    if market_type == MarketType::Moneyline && (probability <= 0.0 || probability >= 1.0) {
        return Err(DecisionReason::MalformedField {
            field: RequiredField::Probability,
            detail: format!(
                "moneyline probability {} has no fair price, must be inside (0, 1)",
                probability
            ),
        });
    }
    let std_dev = require(simulation.std_dev, RequiredField::StdDev)?;
    if std_dev <= 0.0 {
        return Err(DecisionReason::MalformedField {
            field: RequiredField::StdDev,
            detail: format!("standard deviation {} must be positive", std_dev),
        });
    }

    let (positive_side, negative_side) = SelectionSide::pair_for(market_type);
    let (positive, negative) = match (
        snapshot.selection(positive_side),
        snapshot.selection(negative_side),
    ) {
        (Some(p), Some(n)) => (p, n),
        _ => {
            return Err(DecisionReason::MissingField {
                field: RequiredField::Selections,
            })
        }
    };

    let market_line = match market_type {
        MarketType::Spread | MarketType::Total => {
            let line = require(positive.line, RequiredField::MarketLine)?;
            if let Some(other) = negative.line {
                let expected = if market_type == MarketType::Spread {
                    -line
                } else {
                    line
                };
                if (other - expected).abs() > BOUNDARY_EPSILON {
                    return Err(DecisionReason::MalformedField {
                        field: RequiredField::MarketLine,
                        detail: format!(
                            "{} line {} inconsistent with {} line {}",
                            negative.side, other, positive.side, line
                        ),
                    });
                }
            }
            Some(line)
        }
        MarketType::Moneyline => None,
    };

    let captured_at = snapshot.captured_at.ok_or(DecisionReason::MissingField {
        field: RequiredField::MarketTimestamp,
    })?;

    let expected_margin = require(simulation.expected_margin, RequiredField::ExpectedMargin)?;

    let zero_line = match market_type {
        MarketType::Moneyline => true,
        MarketType::Spread => market_line.map_or(false, |l| l.abs() <= ZERO_LINE_EPSILON),
        MarketType::Total => false,
    };

    for selection in [positive, negative] {
        if let Some(odds) = selection.american_odds {
            if selection.implied_probability().is_none() {
                return Err(DecisionReason::MalformedField {
                    field: RequiredField::MarketOdds,
                    detail: format!("{} odds {} are not valid American odds", selection.side, odds),
                });
            }
        }
    }
    let market_probability = market_no_vig_probability(positive, negative);

    let (reference_line, reference_probability) = if zero_line {
        let reference = require_probability(
            simulation.reference_probability,
            RequiredField::ReferenceProbability,
        )?;
        if market_probability.is_none() {
            return Err(DecisionReason::MissingField {
                field: RequiredField::MarketOdds,
            });
        }
        (simulation.reference_line, Some(reference))
    } else {
        (
            Some(require(simulation.reference_line, RequiredField::ReferenceLine)?),
            simulation.reference_probability,
        )
    };

    Ok(CheckedInputs {
        simulation,
        snapshot,
        market_type,
        positive,
        negative,
        market_line,
        market_probability,
        fair_line,
        probability,
        std_dev,
        expected_margin,
        reference_line,
        reference_probability,
        captured_at,
    })
}

// =============================================================================
// GATE 2: DIRECTIONAL INTEGRITY
// =============================================================================

/// The simulated margin and its probability must point the same way.
///
/// margin > 0 requires p > 0.5, margin < 0 requires p < 0.5, and a zero margin
/// requires p within the directional tolerance of 0.5.
pub fn check_directional_integrity(
    inputs: &CheckedInputs<'_>,
    gates: &GateThresholds,
) -> Result<(), DecisionReason> {
    let margin = inputs.expected_margin;
    let p = inputs.probability;

    let consistent = if margin.abs() <= ZERO_LINE_EPSILON {
        (p - 0.5).abs() <= gates.directional_tolerance + BOUNDARY_EPSILON
    } else if margin > 0.0 {
        p > 0.5
    } else {
        p < 0.5
    };

    if consistent {
        Ok(())
    } else {
        Err(DecisionReason::DirectionalContradiction {
            expected_margin: margin,
            probability: p,
        })
    }
}

// =============================================================================
// GATE 3: ODDS ALIGNMENT
// =============================================================================

/// The line the simulation was conditioned on must match the current market.
/// Closed interval: a delta exactly at tolerance passes.
pub fn check_odds_alignment(
    inputs: &CheckedInputs<'_>,
    gates: &GateThresholds,
) -> Result<(), DecisionReason> {
    if inputs.is_zero_line() {
        let (Some(reference), Some(market)) =
            (inputs.reference_probability, inputs.market_probability)
        else {
            return Err(DecisionReason::MissingField {
                field: RequiredField::ReferenceProbability,
            });
        };
        if (reference - market).abs() > gates.probability_tolerance + BOUNDARY_EPSILON {
            return Err(DecisionReason::ProbabilityMismatch {
                reference_probability: reference,
                market_probability: market,
                tolerance: gates.probability_tolerance,
            });
        }
        return Ok(());
    }

    let (Some(reference), Some(market)) = (inputs.reference_line, inputs.market_line) else {
        return Err(DecisionReason::MissingField {
            field: RequiredField::ReferenceLine,
        });
    };
    if (reference - market).abs() > gates.line_tolerance + BOUNDARY_EPSILON {
        return Err(DecisionReason::LineMismatch {
            reference_line: reference,
            market_line: market,
            tolerance: gates.line_tolerance,
        });
    }
    Ok(())
}

// =============================================================================
// GATE 4: FRESHNESS
// =============================================================================

/// Simulation age at `evaluated_at` must not exceed the maximum (inclusive).
pub fn check_freshness(
    simulation: &SimulationSummary,
    gates: &GateThresholds,
    evaluated_at: DateTime<Utc>,
) -> Result<(), DecisionReason> {
    let age = evaluated_at - simulation.computed_at;
    let age_ms = age.num_milliseconds();

    if age_ms < 0 {
        let skew_secs = (-age_ms) / 1_000;
        if -age_ms > gates.max_clock_skew_secs * 1_000 {
            return Err(DecisionReason::FutureSimulation { skew_secs });
        }
        return Ok(());
    }

    if age_ms > gates.max_simulation_age_mins * 60_000 {
        return Err(DecisionReason::StaleSimulation {
            age_minutes: age.num_minutes(),
            max_age_minutes: gates.max_simulation_age_mins,
        });
    }
    Ok(())
}

// =============================================================================
// GATE 5: MODEL CONSISTENCY
// =============================================================================

/// Cross-field coherence between simulation, market, contest and the edge the
/// classification engine is about to see.
pub fn check_model_consistency(
    inputs: &CheckedInputs<'_>,
    raw_edge: &RawEdge,
    contest: &ContestMetadata,
    classification: &ClassificationThresholds,
    gates: &GateThresholds,
) -> Result<(), DecisionReason> {
    for found in [&inputs.simulation.contest_id, &inputs.snapshot.contest_id] {
        if found != &contest.contest_id {
            return Err(DecisionReason::ContestMismatch {
                expected: contest.contest_id.clone(),
                found: found.clone(),
            });
        }
    }
    for found in [inputs.simulation.market_type, inputs.snapshot.market_type] {
        if found != inputs.market_type {
            return Err(DecisionReason::MarketTypeMismatch {
                expected: inputs.market_type.to_string(),
                found: found.to_string(),
            });
        }
    }

    match inputs.market_type {
        MarketType::Spread | MarketType::Moneyline => {
            let side = if raw_edge.prefers_positive {
                inputs.positive.side
            } else {
                inputs.negative.side
            };
            if contest.participant(side).is_none() {
                return Err(DecisionReason::ParticipantMissing { side });
            }
        }
        MarketType::Total => {
            for side in [SelectionSide::Home, SelectionSide::Away] {
                if contest.participant(side).is_none() {
                    return Err(DecisionReason::ParticipantMissing { side });
                }
            }
        }
    }

    let magnitude = raw_edge.magnitude();
    let destined = classify(raw_edge.preferred_probability, magnitude, classification);
    let model_pick = inputs.simulation.model_pick.as_deref();

    if destined == Classification::MarketAligned {
        if let Some(pick) = model_pick {
            return Err(DecisionReason::AlignedMarketClaimsMispricing {
                model_pick: pick.to_string(),
            });
        }
        return Ok(());
    }

    if !magnitude.is_finite() || magnitude == 0.0 {
        return Err(DecisionReason::NonAlignedWithoutEdge);
    }
    if let Some(pick) = model_pick {
        if pick != raw_edge.preferred_selection {
            return Err(DecisionReason::PickContradictsEdge {
                model_pick: pick.to_string(),
                preferred: raw_edge.preferred_selection.clone(),
            });
        }
    }
    if raw_edge.preferred_probability < 0.5 - gates.directional_tolerance - BOUNDARY_EPSILON {
        return Err(DecisionReason::EdgeContradictsProbability {
            preferred: raw_edge.preferred_selection.clone(),
            probability: raw_edge.preferred_probability,
        });
    }
    Ok(())
}
