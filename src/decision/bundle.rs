//! Decision Bundle Builder
//!
//! Runs gates, calibration and classification for every market of one contest
//! in a single invocation and stamps them with one shared run identity.
//!
//! # Atomicity
//!
//! `decision_version`, `trace_id` and `computed_at` are allocated once, before
//! the first market is touched, and copied unmodified into every
//! `MarketDecision` of the bundle, blocked or not. They are never recomputed
//! per market. A new invocation gets a new identity.
//!
//! # Per-market state machine
//!
//! ```text
//! RAW_INPUT -> GATED -> BLOCKED                                (terminal)
//!                    -> CALIBRATED -> CLASSIFIED -> BUNDLED    (terminal)
//! ```
//!
//! Linear and one-shot: no retries inside a bundle, no transition out of a
//! terminal state.

use crate::config::ThresholdProfile;
use crate::decision::calibration::calibrate;
use crate::decision::classification::classify;
use crate::decision::fingerprint::{fingerprint_market, FingerprintInputs, InputsFingerprint};
use crate::decision::gates::{evaluate_gates, GateResult};
use crate::decision::reason::{
    Classification, DecisionReason, GateKind, ReleaseStatus, RiskFlag,
};
use crate::models::{ContestRequest, MarketInput, MarketSelection, MarketType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};
use uuid::Uuid;

/// Version of the gate/calibration/classification logic. Bump on any change
/// that can alter a decision for identical inputs.
pub const DECISION_LOGIC_VERSION: &str = "decision-logic/1";

// =============================================================================
// RUN IDENTITY
// =============================================================================

/// Opaque, strictly increasing per-bundle identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DecisionVersion(pub u64);

impl std::fmt::Display for DecisionVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "dv-{}", self.0)
    }
}

/// Allocates decision versions: `max(previous + 1, now in microseconds)`.
///
/// Monotonic within a process, and across restarts as long as the wall clock
/// does not step backwards past the last issued version. Seed with
/// [`VersionClock::starting_after`] from the audit store to close that gap.
#[derive(Debug, Default)]
pub struct VersionClock {
    last: AtomicU64,
}

impl VersionClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_after(version: DecisionVersion) -> Self {
        Self {
            last: AtomicU64::new(version.0),
        }
    }

    pub fn next(&self, now: DateTime<Utc>) -> DecisionVersion {
        let floor = now.timestamp_micros().max(0) as u64;
        let step = |prev: u64| prev.saturating_add(1).max(floor);
        let prev = match self
            .last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |p| Some(step(p)))
        {
            Ok(p) | Err(p) => p,
        };
        DecisionVersion(step(prev))
    }

    pub fn last_issued(&self) -> DecisionVersion {
        DecisionVersion(self.last.load(Ordering::SeqCst))
    }
}

/// The three run-scoped values shared by every decision of a bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunIdentity {
    pub decision_version: DecisionVersion,
    pub trace_id: Uuid,
    pub computed_at: DateTime<Utc>,
}

impl RunIdentity {
    pub fn allocate(versions: &VersionClock, now: DateTime<Utc>) -> Self {
        Self {
            decision_version: versions.next(now),
            trace_id: Uuid::new_v4(),
            computed_at: now,
        }
    }
}

// =============================================================================
// STATE MACHINE
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionStage {
    RawInput,
    Gated,
    Blocked,
    Calibrated,
    Classified,
    Bundled,
}

impl DecisionStage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DecisionStage::Blocked | DecisionStage::Bundled)
    }

    pub fn can_transition_to(&self, next: DecisionStage) -> bool {
        use DecisionStage::*;
        matches!(
            (self, next),
            (RawInput, Gated)
                | (Gated, Blocked)
                | (Gated, Calibrated)
                | (Calibrated, Classified)
                | (Classified, Bundled)
        )
    }
}

/// Tracks one market's progress through the state machine.
#[derive(Debug)]
pub struct StageTracker {
    stage: DecisionStage,
}

impl Default for StageTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StageTracker {
    pub fn new() -> Self {
        Self {
            stage: DecisionStage::RawInput,
        }
    }

    pub fn stage(&self) -> DecisionStage {
        self.stage
    }

    pub fn advance(&mut self, next: DecisionStage) -> Result<(), BundleError> {
        if !self.stage.can_transition_to(next) {
            return Err(BundleError::IllegalTransition {
                from: self.stage,
                to: next,
            });
        }
        self.stage = next;
        Ok(())
    }
}

// =============================================================================
// OUTPUT TYPES
// =============================================================================

/// Provenance attached to every decision. Part of the public contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebugBundle {
    pub inputs_fingerprint: InputsFingerprint,
    pub trace_id: Uuid,
    pub decision_version: DecisionVersion,
    pub computed_at: DateTime<Utc>,
    /// Threshold profile key, e.g. `default@v1`.
    pub config_profile: String,
    pub logic_version: String,
}

/// Canonical output unit: one market of one contest in one invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketDecision {
    pub decision_id: Uuid,
    pub contest_id: String,
    pub market_type: MarketType,
    pub preferred_selection: Option<String>,
    /// Every selection of the market as quoted, both sides.
    pub selections: Vec<MarketSelection>,
    /// Fair line from the preferred selection's perspective (fair American
    /// odds for moneyline).
    pub fair_line: Option<f64>,
    /// Calibrated edge magnitude (points, or percentage points for moneyline).
    pub edge_points: Option<f64>,
    /// Calibrated probability of the preferred selection.
    pub model_probability: Option<f64>,
    pub classification: Option<Classification>,
    pub release_status: ReleaseStatus,
    pub reasons: Vec<DecisionReason>,
    pub risk_flags: Vec<RiskFlag>,
    /// Every gate's verdict, recorded for audit.
    pub gate_results: Vec<GateResult>,
    pub debug: DebugBundle,
}

/// Input-scoped projection of a decision: everything except the run-scoped
/// `decision_id`, `trace_id`, `computed_at` and `decision_version`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeterminismView<'a> {
    pub contest_id: &'a str,
    pub market_type: MarketType,
    pub preferred_selection: Option<&'a str>,
    pub selections: &'a [MarketSelection],
    pub fair_line: Option<f64>,
    pub edge_points: Option<f64>,
    pub model_probability: Option<f64>,
    pub classification: Option<Classification>,
    pub release_status: ReleaseStatus,
    pub reasons: &'a [DecisionReason],
    pub risk_flags: &'a [RiskFlag],
    pub gate_results: &'a [GateResult],
    pub inputs_fingerprint: &'a InputsFingerprint,
    pub config_profile: &'a str,
    pub logic_version: &'a str,
}

impl MarketDecision {
    /// True when every decision field is set.
    pub fn is_fully_populated(&self) -> bool {
        self.preferred_selection.is_some()
            && self.fair_line.is_some()
            && self.edge_points.is_some()
            && self.model_probability.is_some()
            && self.classification.is_some()
    }

    pub fn determinism_view(&self) -> DeterminismView<'_> {
        DeterminismView {
            contest_id: &self.contest_id,
            market_type: self.market_type,
            preferred_selection: self.preferred_selection.as_deref(),
            selections: &self.selections,
            fair_line: self.fair_line,
            edge_points: self.edge_points,
            model_probability: self.model_probability,
            classification: self.classification,
            release_status: self.release_status,
            reasons: &self.reasons,
            risk_flags: &self.risk_flags,
            gate_results: &self.gate_results,
            inputs_fingerprint: &self.debug.inputs_fingerprint,
            config_profile: &self.debug.config_profile,
            logic_version: &self.debug.logic_version,
        }
    }

    /// Canonical JSON of [`Self::determinism_view`]; byte-identical for
    /// decisions computed from identical inputs.
    pub fn determinism_key(&self) -> String {
        serde_json::to_string(&self.determinism_view()).unwrap_or_default()
    }
}

/// All markets of one contest decided in one invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionBundle {
    pub contest_id: String,
    pub decision_version: DecisionVersion,
    pub trace_id: Uuid,
    pub computed_at: DateTime<Utc>,
    pub config_profile: String,
    /// Ordered by market type. Markets that were not requested are absent.
    pub decisions: Vec<MarketDecision>,
}

impl DecisionBundle {
    pub fn get(&self, market_type: MarketType) -> Option<&MarketDecision> {
        self.decisions.iter().find(|d| d.market_type == market_type)
    }

    pub fn identity(&self) -> RunIdentity {
        RunIdentity {
            decision_version: self.decision_version,
            trace_id: self.trace_id,
            computed_at: self.computed_at,
        }
    }

    /// Every decision carries the bundle's version, trace id and timestamp.
    pub fn is_atomic(&self) -> bool {
        self.decisions.iter().all(|d| {
            d.contest_id == self.contest_id
                && d.debug.decision_version == self.decision_version
                && d.debug.trace_id == self.trace_id
                && d.debug.computed_at == self.computed_at
                && d.debug.config_profile == self.config_profile
        })
    }

    pub fn approved(&self) -> impl Iterator<Item = &MarketDecision> {
        self.decisions
            .iter()
            .filter(|d| d.release_status == ReleaseStatus::Approved)
    }
}

// =============================================================================
// ERRORS
// =============================================================================

/// Request-shape errors. Data problems inside a market never surface here;
/// they become blocked decisions.
#[derive(Debug, Clone, PartialEq)]
pub enum BundleError {
    EmptyRequest,
    MissingContestId,
    DuplicateMarket(MarketType),
    BaselineLeagueMismatch {
        contest_league: String,
        baseline_league: String,
    },
    IllegalTransition {
        from: DecisionStage,
        to: DecisionStage,
    },
}

impl std::fmt::Display for BundleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyRequest => write!(f, "Request contains no markets"),
            Self::MissingContestId => write!(f, "Request has an empty contest id"),
            Self::DuplicateMarket(m) => write!(f, "Market type '{}' requested more than once", m),
            Self::BaselineLeagueMismatch {
                contest_league,
                baseline_league,
            } => write!(
                f,
                "League baseline is for '{}' but contest is in '{}'",
                baseline_league, contest_league
            ),
            Self::IllegalTransition { from, to } => {
                write!(f, "Illegal decision stage transition {:?} -> {:?}", from, to)
            }
        }
    }
}

impl std::error::Error for BundleError {}

// =============================================================================
// BUILDER
// =============================================================================

/// Builds decision bundles against one frozen threshold profile.
pub struct BundleBuilder<'a> {
    profile: &'a ThresholdProfile,
    profile_key: String,
}

impl<'a> BundleBuilder<'a> {
    pub fn new(profile: &'a ThresholdProfile) -> Self {
        Self {
            profile,
            profile_key: profile.profile_key(),
        }
    }

    /// Allocate a fresh run identity and build the bundle.
    pub fn build(
        &self,
        request: &ContestRequest,
        versions: &VersionClock,
    ) -> Result<DecisionBundle, BundleError> {
        Self::validate_request(request)?;
        let identity = RunIdentity::allocate(versions, Utc::now());
        self.build_with_identity(request, identity)
    }

    /// Build under an identity allocated by the caller. Used for replays,
    /// where the original `computed_at` must be reused.
    pub fn build_with_identity(
        &self,
        request: &ContestRequest,
        identity: RunIdentity,
    ) -> Result<DecisionBundle, BundleError> {
        Self::validate_request(request)?;

        let mut markets: Vec<&MarketInput> = request.markets.iter().collect();
        markets.sort_by_key(|m| m.market_type);

        let mut decisions = Vec::with_capacity(markets.len());
        for input in markets {
            decisions.push(self.decide_market(request, input, &identity)?);
        }

        let bundle = DecisionBundle {
            contest_id: request.contest.contest_id.clone(),
            decision_version: identity.decision_version,
            trace_id: identity.trace_id,
            computed_at: identity.computed_at,
            config_profile: self.profile_key.clone(),
            decisions,
        };

        info!(
            contest = %bundle.contest_id,
            trace_id = %bundle.trace_id,
            version = %bundle.decision_version,
            markets = bundle.decisions.len(),
            approved = bundle.approved().count(),
            "built decision bundle"
        );
        Ok(bundle)
    }

    fn validate_request(request: &ContestRequest) -> Result<(), BundleError> {
        if request.contest.contest_id.trim().is_empty() {
            return Err(BundleError::MissingContestId);
        }
        if request.markets.is_empty() {
            return Err(BundleError::EmptyRequest);
        }
        let mut seen = BTreeSet::new();
        for m in &request.markets {
            if !seen.insert(m.market_type) {
                return Err(BundleError::DuplicateMarket(m.market_type));
            }
        }
        if !request
            .baseline
            .league
            .eq_ignore_ascii_case(&request.contest.league)
        {
            return Err(BundleError::BaselineLeagueMismatch {
                contest_league: request.contest.league.clone(),
                baseline_league: request.baseline.league.clone(),
            });
        }
        Ok(())
    }

    fn decide_market(
        &self,
        request: &ContestRequest,
        input: &MarketInput,
        identity: &RunIdentity,
    ) -> Result<MarketDecision, BundleError> {
        let contest = &request.contest;
        let market_type = input.market_type;
        let thresholds = self.profile.resolve(&contest.league, market_type);
        let mut stage = StageTracker::new();

        let outcome = evaluate_gates(
            input.simulation.as_ref(),
            input.snapshot.as_ref(),
            contest,
            market_type,
            thresholds,
            identity.computed_at,
        );
        stage.advance(DecisionStage::Gated)?;

        let freshness = outcome
            .report
            .result(GateKind::Freshness)
            .filter(|r| r.evaluated)
            .map(|r| match &r.reason {
                Some(reason) if !r.passed => Err(reason),
                _ => Ok(()),
            });
        let inputs_fingerprint = fingerprint_market(&FingerprintInputs {
            logic_version: DECISION_LOGIC_VERSION,
            profile_key: &self.profile_key,
            contest,
            market_type,
            simulation: input.simulation.as_ref(),
            snapshot: input.snapshot.as_ref(),
            baseline: &request.baseline,
            freshness,
        });

        let mut decision = MarketDecision {
            decision_id: Uuid::new_v4(),
            contest_id: contest.contest_id.clone(),
            market_type,
            preferred_selection: None,
            selections: input
                .snapshot
                .as_ref()
                .map(|s| s.selections.clone())
                .unwrap_or_default(),
            fair_line: None,
            edge_points: None,
            model_probability: None,
            classification: None,
            release_status: ReleaseStatus::BlockedByMissingData,
            reasons: Vec::new(),
            risk_flags: Vec::new(),
            gate_results: outcome.report.results.clone(),
            debug: DebugBundle {
                inputs_fingerprint,
                trace_id: identity.trace_id,
                decision_version: identity.decision_version,
                computed_at: identity.computed_at,
                config_profile: self.profile_key.clone(),
                logic_version: DECISION_LOGIC_VERSION.to_string(),
            },
        };

        let (inputs, raw) = match (outcome.report.first_failure(), outcome.inputs, outcome.raw_edge)
        {
            (None, Some(inputs), Some(raw)) => (inputs, raw),
            (failure, _, _) => {
                stage.advance(DecisionStage::Blocked)?;
                if let Some(failure) = failure {
                    decision.release_status = failure.gate.blocked_status();
                    decision.reasons.extend(failure.reason.clone());
                }
                info!(
                    contest = %decision.contest_id,
                    market = %market_type,
                    status = %decision.release_status,
                    reason = ?decision.reasons.first().map(|r| r.code()),
                    "market blocked by validation gate"
                );
                return Ok(decision);
            }
        };

        let calibration = calibrate(&inputs, &raw, &request.baseline, thresholds);
        stage.advance(DecisionStage::Calibrated)?;

        let classification = classify(
            calibration.adjusted_probability,
            calibration.adjusted_edge,
            &thresholds.classification,
        );
        stage.advance(DecisionStage::Classified)?;

        decision.preferred_selection = Some(raw.preferred_selection.clone());
        decision.fair_line = raw.fair_line;
        decision.edge_points = Some(calibration.adjusted_edge_magnitude());
        decision.model_probability = Some(calibration.adjusted_probability);
        decision.risk_flags = calibration.risk_flags.clone();
        decision.reasons = calibration.penalties.clone();

        if calibration.publish {
            decision.release_status = ReleaseStatus::Approved;
            decision.classification = Some(classification);
        } else {
            decision.release_status = ReleaseStatus::PendingReview;
            decision
                .reasons
                .extend(calibration.block_reasons.iter().cloned());
            decision
                .reasons
                .push(DecisionReason::ClassificationWithheld { classification });
        }
        stage.advance(DecisionStage::Bundled)?;

        debug!(
            contest = %decision.contest_id,
            market = %market_type,
            status = %decision.release_status,
            classification = %classification,
            edge = calibration.adjusted_edge,
            fingerprint = %decision.debug.inputs_fingerprint.short(),
            "market decided"
        );
        Ok(decision)
    }
}
