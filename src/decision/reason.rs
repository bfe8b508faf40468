//! Reason Codes, Statuses and Classifications
//!
//! Every outcome the pipeline can produce is a variant of a closed enum so
//! downstream consumers can match exhaustively. Reasons serialize with a
//! `code` tag (e.g. `{"code":"STALE_SIMULATION", ...}`) and render a
//! human-readable sentence through `Display`.

use crate::models::SelectionSide;
use serde::{Deserialize, Serialize};

// =============================================================================
// GATES
// =============================================================================

/// The five validation gates, in fixed execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateKind {
    DataIntegrity,
    DirectionalIntegrity,
    OddsAlignment,
    Freshness,
    ModelConsistency,
}

impl GateKind {
    pub const ORDER: [GateKind; 5] = [
        GateKind::DataIntegrity,
        GateKind::DirectionalIntegrity,
        GateKind::OddsAlignment,
        GateKind::Freshness,
        GateKind::ModelConsistency,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            GateKind::DataIntegrity => "data_integrity",
            GateKind::DirectionalIntegrity => "directional_integrity",
            GateKind::OddsAlignment => "odds_alignment",
            GateKind::Freshness => "freshness",
            GateKind::ModelConsistency => "model_consistency",
        }
    }

    /// Release status surfaced when this gate is the first to fail.
    pub fn blocked_status(&self) -> ReleaseStatus {
        match self {
            GateKind::DataIntegrity => ReleaseStatus::BlockedByMissingData,
            GateKind::DirectionalIntegrity | GateKind::ModelConsistency => {
                ReleaseStatus::BlockedByIntegrity
            }
            GateKind::OddsAlignment => ReleaseStatus::BlockedByOddsMismatch,
            GateKind::Freshness => ReleaseStatus::BlockedByStaleData,
        }
    }
}

impl std::fmt::Display for GateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Input fields the data-integrity gate requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequiredField {
    Simulation,
    MarketSnapshot,
    FairLine,
    Probability,
    StdDev,
    ExpectedMargin,
    ReferenceLine,
    ReferenceProbability,
    Selections,
    MarketLine,
    MarketOdds,
    MarketTimestamp,
}

impl RequiredField {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequiredField::Simulation => "simulation",
            RequiredField::MarketSnapshot => "market_snapshot",
            RequiredField::FairLine => "fair_line",
            RequiredField::Probability => "probability",
            RequiredField::StdDev => "std_dev",
            RequiredField::ExpectedMargin => "expected_margin",
            RequiredField::ReferenceLine => "reference_line",
            RequiredField::ReferenceProbability => "reference_probability",
            RequiredField::Selections => "selections",
            RequiredField::MarketLine => "market_line",
            RequiredField::MarketOdds => "market_odds",
            RequiredField::MarketTimestamp => "market_timestamp",
        }
    }
}

impl std::fmt::Display for RequiredField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// REASONS
// =============================================================================

/// Closed set of reasons a decision was blocked, penalised, or withheld.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionReason {
    // --- data integrity ---
    MissingField {
        field: RequiredField,
    },
    MalformedField {
        field: RequiredField,
        detail: String,
    },

    // --- directional integrity ---
    DirectionalContradiction {
        expected_margin: f64,
        probability: f64,
    },

    // --- odds alignment ---
    LineMismatch {
        reference_line: f64,
        market_line: f64,
        tolerance: f64,
    },
    ProbabilityMismatch {
        reference_probability: f64,
        market_probability: f64,
        tolerance: f64,
    },

    // --- freshness ---
    StaleSimulation {
        age_minutes: i64,
        max_age_minutes: i64,
    },
    FutureSimulation {
        skew_secs: i64,
    },

    // --- model consistency ---
    ContestMismatch {
        expected: String,
        found: String,
    },
    MarketTypeMismatch {
        expected: String,
        found: String,
    },
    ParticipantMissing {
        side: SelectionSide,
    },
    PickContradictsEdge {
        model_pick: String,
        preferred: String,
    },
    AlignedMarketClaimsMispricing {
        model_pick: String,
    },
    EdgeContradictsProbability {
        preferred: String,
        probability: f64,
    },
    NonAlignedWithoutEdge,

    // --- calibration penalties ---
    LeagueBiasDampening {
        factor: f64,
    },
    MarketAnchorPenalty {
        deviation: f64,
        factor: f64,
    },
    VariancePenalty {
        z_score: f64,
        factor: f64,
    },
    EliteOverrideApplied,

    // --- calibration blocks ---
    MarketDeviationHard {
        deviation: f64,
        hard_threshold: f64,
    },
    VarianceExtreme {
        z_score: f64,
        extreme_threshold: f64,
    },
    VarianceBaselineUnavailable,

    // --- publish minimums ---
    ProbabilityBelowMinimum {
        probability: f64,
        minimum: f64,
    },
    EdgeBelowMinimum {
        edge: f64,
        minimum: f64,
    },
    EliteOverrideUnverified,

    // --- release ---
    ClassificationWithheld {
        classification: Classification,
    },
}

impl DecisionReason {
    /// Stable machine-readable code, identical to the serialized `code` tag.
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingField { .. } => "MISSING_FIELD",
            Self::MalformedField { .. } => "MALFORMED_FIELD",
            Self::DirectionalContradiction { .. } => "DIRECTIONAL_CONTRADICTION",
            Self::LineMismatch { .. } => "LINE_MISMATCH",
            Self::ProbabilityMismatch { .. } => "PROBABILITY_MISMATCH",
            Self::StaleSimulation { .. } => "STALE_SIMULATION",
            Self::FutureSimulation { .. } => "FUTURE_SIMULATION",
            Self::ContestMismatch { .. } => "CONTEST_MISMATCH",
            Self::MarketTypeMismatch { .. } => "MARKET_TYPE_MISMATCH",
            Self::ParticipantMissing { .. } => "PARTICIPANT_MISSING",
            Self::PickContradictsEdge { .. } => "PICK_CONTRADICTS_EDGE",
            Self::AlignedMarketClaimsMispricing { .. } => "ALIGNED_MARKET_CLAIMS_MISPRICING",
            Self::EdgeContradictsProbability { .. } => "EDGE_CONTRADICTS_PROBABILITY",
            Self::NonAlignedWithoutEdge => "NON_ALIGNED_WITHOUT_EDGE",
            Self::LeagueBiasDampening { .. } => "LEAGUE_BIAS_DAMPENING",
            Self::MarketAnchorPenalty { .. } => "MARKET_ANCHOR_PENALTY",
            Self::VariancePenalty { .. } => "VARIANCE_PENALTY",
            Self::EliteOverrideApplied => "ELITE_OVERRIDE_APPLIED",
            Self::MarketDeviationHard { .. } => "MARKET_DEVIATION_HARD",
            Self::VarianceExtreme { .. } => "VARIANCE_EXTREME",
            Self::VarianceBaselineUnavailable => "VARIANCE_BASELINE_UNAVAILABLE",
            Self::ProbabilityBelowMinimum { .. } => "PROBABILITY_BELOW_MINIMUM",
            Self::EdgeBelowMinimum { .. } => "EDGE_BELOW_MINIMUM",
            Self::EliteOverrideUnverified => "ELITE_OVERRIDE_UNVERIFIED",
            Self::ClassificationWithheld { .. } => "CLASSIFICATION_WITHHELD",
        }
    }
}

impl std::fmt::Display for DecisionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingField { field } => write!(f, "Required field '{}' is missing", field),
            Self::MalformedField { field, detail } => {
                write!(f, "Field '{}' is malformed: {}", field, detail)
            }
            Self::DirectionalContradiction {
                expected_margin,
                probability,
            } => write!(
                f,
                "Simulated margin {:+.3} disagrees with its own probability {:.4}",
                expected_margin, probability
            ),
            Self::LineMismatch {
                reference_line,
                market_line,
                tolerance,
            } => write!(
                f,
                "Simulated against line {} but market is at {} (tolerance {})",
                reference_line, market_line, tolerance
            ),
            Self::ProbabilityMismatch {
                reference_probability,
                market_probability,
                tolerance,
            } => write!(
                f,
                "Simulated against implied probability {:.4} but market implies {:.4} (tolerance {})",
                reference_probability, market_probability, tolerance
            ),
            Self::StaleSimulation {
                age_minutes,
                max_age_minutes,
            } => write!(
                f,
                "Simulation is {} minutes old (max {})",
                age_minutes, max_age_minutes
            ),
            Self::FutureSimulation { skew_secs } => write!(
                f,
                "Simulation timestamp is {}s ahead of evaluation time",
                skew_secs
            ),
            Self::ContestMismatch { expected, found } => write!(
                f,
                "Input belongs to contest '{}', expected '{}'",
                found, expected
            ),
            Self::MarketTypeMismatch { expected, found } => write!(
                f,
                "Input is a {} market, expected {}",
                found, expected
            ),
            Self::ParticipantMissing { side } => {
                write!(f, "Contest has no participant for side '{}'", side)
            }
            Self::PickContradictsEdge {
                model_pick,
                preferred,
            } => write!(
                f,
                "Simulation picks '{}' but the priced edge favours '{}'",
                model_pick, preferred
            ),
            Self::AlignedMarketClaimsMispricing { model_pick } => write!(
                f,
                "Market is aligned but simulation still claims '{}' is mispriced",
                model_pick
            ),
            Self::EdgeContradictsProbability {
                preferred,
                probability,
            } => write!(
                f,
                "Edge favours '{}' but its probability is only {:.4}",
                preferred, probability
            ),
            Self::NonAlignedWithoutEdge => {
                write!(f, "Non-aligned market has no finite edge magnitude")
            }
            Self::LeagueBiasDampening { factor } => {
                write!(f, "League bias dampening applied (x{:.4})", factor)
            }
            Self::MarketAnchorPenalty { deviation, factor } => write!(
                f,
                "Market anchor penalty for deviation {:.3} (x{:.4})",
                deviation, factor
            ),
            Self::VariancePenalty { z_score, factor } => write!(
                f,
                "Variance penalty for z-score {:.3} (x{:.4})",
                z_score, factor
            ),
            Self::EliteOverrideApplied => write!(f, "Elite override applied"),
            Self::MarketDeviationHard {
                deviation,
                hard_threshold,
            } => write!(
                f,
                "Deviation from market {:.3} is at or beyond hard threshold {}",
                deviation, hard_threshold
            ),
            Self::VarianceExtreme {
                z_score,
                extreme_threshold,
            } => write!(
                f,
                "Variance z-score {:.3} is at or beyond extreme threshold {}",
                z_score, extreme_threshold
            ),
            Self::VarianceBaselineUnavailable => {
                write!(f, "No league variance baseline for this market type")
            }
            Self::ProbabilityBelowMinimum {
                probability,
                minimum,
            } => write!(
                f,
                "Adjusted probability {:.4} below publish minimum {}",
                probability, minimum
            ),
            Self::EdgeBelowMinimum { edge, minimum } => write!(
                f,
                "Adjusted edge {:.3} below publish minimum {}",
                edge, minimum
            ),
            Self::EliteOverrideUnverified => {
                write!(f, "Elite override could not be re-verified")
            }
            Self::ClassificationWithheld { classification } => write!(
                f,
                "Classification {} withheld pending review",
                classification
            ),
        }
    }
}

// =============================================================================
// STATUSES
// =============================================================================

/// Release status of one market decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReleaseStatus {
    Approved,
    BlockedByIntegrity,
    BlockedByOddsMismatch,
    BlockedByStaleData,
    BlockedByMissingData,
    PendingReview,
}

impl ReleaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReleaseStatus::Approved => "APPROVED",
            ReleaseStatus::BlockedByIntegrity => "BLOCKED_BY_INTEGRITY",
            ReleaseStatus::BlockedByOddsMismatch => "BLOCKED_BY_ODDS_MISMATCH",
            ReleaseStatus::BlockedByStaleData => "BLOCKED_BY_STALE_DATA",
            ReleaseStatus::BlockedByMissingData => "BLOCKED_BY_MISSING_DATA",
            ReleaseStatus::PendingReview => "PENDING_REVIEW",
        }
    }

    pub fn is_blocked(&self) -> bool {
        matches!(
            self,
            ReleaseStatus::BlockedByIntegrity
                | ReleaseStatus::BlockedByOddsMismatch
                | ReleaseStatus::BlockedByStaleData
                | ReleaseStatus::BlockedByMissingData
        )
    }
}

impl std::fmt::Display for ReleaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mispricing classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Classification {
    Edge,
    Lean,
    MarketAligned,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Edge => "EDGE",
            Classification::Lean => "LEAN",
            Classification::MarketAligned => "MARKET_ALIGNED",
        }
    }
}

impl std::fmt::Display for Classification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Non-blocking risk annotations surfaced alongside a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskFlag {
    LowIterationCount,
    WeakConvergence,
    LeagueBiasDampened,
    MarketDeviation,
    VarianceElevated,
    VarianceHigh,
    EliteOverride,
}

impl RiskFlag {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskFlag::LowIterationCount => "LOW_ITERATION_COUNT",
            RiskFlag::WeakConvergence => "WEAK_CONVERGENCE",
            RiskFlag::LeagueBiasDampened => "LEAGUE_BIAS_DAMPENED",
            RiskFlag::MarketDeviation => "MARKET_DEVIATION",
            RiskFlag::VarianceElevated => "VARIANCE_ELEVATED",
            RiskFlag::VarianceHigh => "VARIANCE_HIGH",
            RiskFlag::EliteOverride => "ELITE_OVERRIDE",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_code_matches_serialized_tag() {
        let reasons = vec![
            DecisionReason::MissingField {
                field: RequiredField::StdDev,
            },
            DecisionReason::StaleSimulation {
                age_minutes: 130,
                max_age_minutes: 120,
            },
            DecisionReason::NonAlignedWithoutEdge,
            DecisionReason::ClassificationWithheld {
                classification: Classification::Lean,
            },
        ];
        for reason in reasons {
            let value = serde_json::to_value(&reason).unwrap();
            assert_eq!(value["code"], reason.code());
            let back: DecisionReason = serde_json::from_value(value).unwrap();
            assert_eq!(back, reason);
        }
    }

    #[test]
    fn test_missing_field_display_names_field() {
        let reason = DecisionReason::MissingField {
            field: RequiredField::MarketTimestamp,
        };
        assert!(reason.to_string().contains("market_timestamp"));
    }

    #[test]
    fn test_gate_blocked_status_mapping() {
        assert_eq!(
            GateKind::DataIntegrity.blocked_status(),
            ReleaseStatus::BlockedByMissingData
        );
        assert_eq!(
            GateKind::DirectionalIntegrity.blocked_status(),
            ReleaseStatus::BlockedByIntegrity
        );
        assert_eq!(
            GateKind::OddsAlignment.blocked_status(),
            ReleaseStatus::BlockedByOddsMismatch
        );
        assert_eq!(
            GateKind::Freshness.blocked_status(),
            ReleaseStatus::BlockedByStaleData
        );
        assert_eq!(
            GateKind::ModelConsistency.blocked_status(),
            ReleaseStatus::BlockedByIntegrity
        );
        assert!(!ReleaseStatus::PendingReview.is_blocked());
        assert!(!ReleaseStatus::Approved.is_blocked());
    }
}
