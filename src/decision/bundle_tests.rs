//! Decision Bundle Tests
//!
//! Atomic versioning, release status mapping and the per-market state machine.

use crate::config::ThresholdProfile;
use crate::decision::bundle::{
    BundleBuilder, BundleError, DecisionBundle, DecisionStage, DecisionVersion, RunIdentity,
    StageTracker, VersionClock, DECISION_LOGIC_VERSION,
};
use crate::decision::reason::{
    Classification, DecisionReason, ReleaseStatus, RequiredField,
};
use crate::decision::test_fixtures::*;
use crate::models::{ContestRequest, MarketInput, MarketType, SimulationSummary};
use chrono::Duration;
use uuid::Uuid;

// =============================================================================
// TEST HELPERS
// =============================================================================

fn identity() -> RunIdentity {
    RunIdentity {
        decision_version: DecisionVersion(1_000),
        trace_id: Uuid::new_v4(),
        computed_at: eval_time(),
    }
}

fn build(request: &ContestRequest) -> DecisionBundle {
    let profile = profile();
    BundleBuilder::new(&profile)
        .build_with_identity(request, identity())
        .expect("bundle builds")
}

fn close(a: Option<f64>, b: f64) -> bool {
    a.map_or(false, |a| (a - b).abs() < 1e-9)
}

// =============================================================================
// ATOMICITY
// =============================================================================

#[test]
fn test_every_decision_shares_the_bundle_identity() {
    let bundle = build(&full_request());
    assert_eq!(bundle.decisions.len(), 2);
    assert!(bundle.is_atomic());
    for decision in &bundle.decisions {
        assert_eq!(decision.debug.decision_version, DecisionVersion(1_000));
        assert_eq!(decision.debug.trace_id, bundle.trace_id);
        assert_eq!(decision.debug.computed_at, eval_time());
        assert_eq!(decision.debug.config_profile, "default@v1");
        assert_eq!(decision.debug.logic_version, DECISION_LOGIC_VERSION);
    }
    assert_ne!(bundle.decisions[0].decision_id, bundle.decisions[1].decision_id);
}

#[test]
fn test_blocked_and_approved_markets_share_identity() {
    let mut stale = total_simulation();
    stale.computed_at = eval_time() - Duration::hours(4);
    let request = request(vec![
        spread_input(),
        MarketInput::new(MarketType::Total, Some(stale), Some(total_snapshot())),
    ]);

    let bundle = build(&request);
    let spread = bundle.get(MarketType::Spread).unwrap();
    let total = bundle.get(MarketType::Total).unwrap();
    assert_eq!(spread.release_status, ReleaseStatus::Approved);
    assert_eq!(total.release_status, ReleaseStatus::BlockedByStaleData);
    assert_eq!(spread.debug.decision_version, total.debug.decision_version);
    assert_eq!(spread.debug.trace_id, total.debug.trace_id);
    assert_eq!(spread.debug.computed_at, total.debug.computed_at);
    assert!(bundle.is_atomic());
}

#[test]
fn test_decisions_are_ordered_and_unrequested_markets_absent() {
    let bundle = build(&full_request());
    let order: Vec<MarketType> = bundle.decisions.iter().map(|d| d.market_type).collect();
    assert_eq!(order, vec![MarketType::Spread, MarketType::Total]);
    assert!(bundle.get(MarketType::Moneyline).is_none());
}

#[test]
fn test_separate_invocations_get_new_identity() {
    let profile = profile();
    let clock = VersionClock::new();
    let builder = BundleBuilder::new(&profile);
    let request = full_request();

    let first = builder.build(&request, &clock).unwrap();
    let second = builder.build(&request, &clock).unwrap();
    assert!(second.decision_version > first.decision_version);
    assert_ne!(first.trace_id, second.trace_id);
    assert!(first.is_atomic() && second.is_atomic());
}

// =============================================================================
// DECISION CONTENT
// =============================================================================

#[test]
fn test_spread_edge_is_approved_and_fully_populated() {
    let bundle = build(&full_request());
    let spread = bundle.get(MarketType::Spread).unwrap();
    assert_eq!(spread.release_status, ReleaseStatus::Approved);
    assert_eq!(spread.classification, Some(Classification::Edge));
    assert_eq!(spread.preferred_selection.as_deref(), Some("bos-spread"));
    assert!(close(spread.fair_line, -5.5));
    assert!(close(spread.edge_points, 2.5));
    assert!(close(spread.model_probability, 0.60));
    assert_eq!(spread.selections.len(), 2);
    assert!(spread.reasons.is_empty());
    assert!(spread.is_fully_populated());
    assert!(spread.gate_results.iter().all(|g| g.passed));
}

#[test]
fn test_total_under_lean() {
    let bundle = build(&full_request());
    let total = bundle.get(MarketType::Total).unwrap();
    assert_eq!(total.release_status, ReleaseStatus::Approved);
    assert_eq!(total.classification, Some(Classification::Lean));
    assert_eq!(total.preferred_selection.as_deref(), Some("under"));
    assert!(close(total.fair_line, 219.0));
    assert!(close(total.edge_points, 1.5));
    assert!(close(total.model_probability, 0.55));
}

#[test]
fn test_moneyline_reports_fair_american_odds() {
    let request = request(vec![MarketInput::new(
        MarketType::Moneyline,
        Some(moneyline_simulation(0.54, 0.50)),
        Some(moneyline_snapshot(-110, -110)),
    )]);
    let bundle = build(&request);
    let ml = bundle.get(MarketType::Moneyline).unwrap();
    assert_eq!(ml.release_status, ReleaseStatus::Approved);
    assert_eq!(ml.preferred_selection.as_deref(), Some("bos-ml"));
    assert!(close(ml.fair_line, -117.0));
    assert_eq!(ml.classification, Some(Classification::Lean));
    // 4 percentage points of raw edge, dampened by the soft market anchor.
    let edge = ml.edge_points.unwrap();
    assert!(edge < 4.0 && edge > 3.8);
}

#[test]
fn test_missing_snapshot_blocks_with_every_field_nulled() {
    let request = request(vec![MarketInput::new(
        MarketType::Spread,
        Some(spread_simulation()),
        None,
    )]);
    let bundle = build(&request);
    let spread = bundle.get(MarketType::Spread).unwrap();

    assert_eq!(spread.release_status, ReleaseStatus::BlockedByMissingData);
    assert_eq!(
        spread.reasons,
        vec![DecisionReason::MissingField {
            field: RequiredField::MarketSnapshot
        }]
    );
    assert_eq!(spread.preferred_selection, None);
    assert_eq!(spread.fair_line, None);
    assert_eq!(spread.edge_points, None);
    assert_eq!(spread.model_probability, None);
    assert_eq!(spread.classification, None);
    assert!(spread.risk_flags.is_empty());
    assert!(spread.selections.is_empty());
    assert_eq!(spread.gate_results.len(), 5);
}

#[test]
fn test_blocked_reason_is_first_failing_gate_only() {
    let mut sim = spread_simulation();
    sim.probability = Some(0.45);
    sim.computed_at = eval_time() - Duration::hours(3);
    let bundle = build(&request(vec![MarketInput::new(
        MarketType::Spread,
        Some(sim),
        Some(spread_snapshot()),
    )]));
    let spread = bundle.get(MarketType::Spread).unwrap();
    assert_eq!(spread.release_status, ReleaseStatus::BlockedByIntegrity);
    assert_eq!(spread.reasons.len(), 1);
    assert!(matches!(
        spread.reasons[0],
        DecisionReason::DirectionalContradiction { .. }
    ));
    // Blocked markets keep the quoted selections for context.
    assert_eq!(spread.selections.len(), 2);
    assert!(spread.gate_results.iter().filter(|g| !g.passed).count() >= 2);
}

#[test]
fn test_calibration_rejection_is_pending_review_with_classification_withheld() {
    let sim = SimulationSummary {
        std_dev: Some(25.0),
        ..spread_simulation()
    };
    let bundle = build(&request(vec![MarketInput::new(
        MarketType::Spread,
        Some(sim),
        Some(spread_snapshot()),
    )]));
    let spread = bundle.get(MarketType::Spread).unwrap();

    assert_eq!(spread.release_status, ReleaseStatus::PendingReview);
    assert!(!spread.release_status.is_blocked());
    assert_eq!(spread.classification, None);
    assert!(spread.edge_points.is_some());
    assert!(spread.model_probability.is_some());
    assert!(spread
        .reasons
        .iter()
        .any(|r| matches!(r, DecisionReason::VarianceExtreme { .. })));
    assert!(spread
        .reasons
        .iter()
        .any(|r| matches!(r, DecisionReason::ClassificationWithheld { .. })));
    assert!(!spread.is_fully_populated());
}

#[test]
fn test_fully_populated_iff_approved() {
    let mut stale = spread_simulation();
    stale.computed_at = eval_time() - Duration::hours(3);
    let noisy = SimulationSummary {
        std_dev: Some(40.0),
        ..total_simulation()
    };
    let scenarios = vec![
        full_request(),
        request(vec![
            MarketInput::new(MarketType::Spread, Some(stale), Some(spread_snapshot())),
            MarketInput::new(MarketType::Total, Some(noisy), Some(total_snapshot())),
        ]),
        request(vec![MarketInput::new(MarketType::Moneyline, None, None)]),
    ];

    for request in scenarios {
        for decision in build(&request).decisions {
            assert_eq!(
                decision.is_fully_populated(),
                decision.release_status == ReleaseStatus::Approved,
                "{:?}",
                decision.release_status
            );
        }
    }
}

#[test]
fn test_certain_moneyline_has_no_fair_price_and_is_blocked() {
    for probability in [1.0, 0.0] {
        let sim = SimulationSummary {
            std_dev: Some(9.0),
            ..moneyline_simulation(probability, 0.50)
        };
        let bundle = build(&request(vec![MarketInput::new(
            MarketType::Moneyline,
            Some(sim),
            Some(moneyline_snapshot(-110, -110)),
        )]));
        let ml = bundle.get(MarketType::Moneyline).unwrap();

        assert_eq!(ml.release_status, ReleaseStatus::BlockedByMissingData);
        assert!(matches!(
            ml.reasons.as_slice(),
            [DecisionReason::MalformedField {
                field: RequiredField::Probability,
                ..
            }]
        ));
        assert_eq!(ml.fair_line, None);
        assert!(!ml.is_fully_populated());
    }
}

// =============================================================================
// DETERMINISM
// =============================================================================

#[test]
fn test_identical_inputs_give_identical_projection() {
    let profile = profile();
    let builder = BundleBuilder::new(&profile);
    let request = full_request();

    let a = builder.build_with_identity(&request, identity()).unwrap();
    let b = builder
        .build_with_identity(
            &request,
            RunIdentity {
                decision_version: DecisionVersion(2_000),
                ..identity()
            },
        )
        .unwrap();

    for (x, y) in a.decisions.iter().zip(&b.decisions) {
        assert_ne!(x.decision_id, y.decision_id);
        assert_eq!(x.debug.inputs_fingerprint, y.debug.inputs_fingerprint);
        assert_eq!(x.determinism_key(), y.determinism_key());
    }
}

#[test]
fn test_market_order_in_request_does_not_matter() {
    let forward = build(&request(vec![spread_input(), total_input()]));
    let reverse = build(&request(vec![total_input(), spread_input()]));
    for (x, y) in forward.decisions.iter().zip(&reverse.decisions) {
        assert_eq!(x.determinism_key(), y.determinism_key());
    }
}

#[test]
fn test_contest_metadata_feeds_fingerprint() {
    let full = full_request();
    let mut no_home = full_request();
    no_home.contest.home_participant = None;

    let a = build(&full);
    let b = build(&no_home);
    let spread_a = a.get(MarketType::Spread).unwrap();
    let spread_b = b.get(MarketType::Spread).unwrap();

    assert_eq!(spread_a.release_status, ReleaseStatus::Approved);
    assert_eq!(spread_b.release_status, ReleaseStatus::BlockedByIntegrity);
    assert_ne!(
        spread_a.debug.inputs_fingerprint,
        spread_b.debug.inputs_fingerprint
    );
}

#[test]
fn test_profile_identity_feeds_fingerprint() {
    let request = full_request();
    let strict = ThresholdProfile {
        profile_id: "strict".to_string(),
        ..profile()
    };
    let a = build(&request);
    let b = BundleBuilder::new(&strict)
        .build_with_identity(&request, identity())
        .unwrap();
    assert_eq!(b.config_profile, "strict@v1");
    assert_ne!(
        a.decisions[0].debug.inputs_fingerprint,
        b.decisions[0].debug.inputs_fingerprint
    );
}

// =============================================================================
// REQUEST VALIDATION
// =============================================================================

#[test]
fn test_request_shape_errors() {
    let profile = profile();
    let builder = BundleBuilder::new(&profile);

    assert_eq!(
        builder.build_with_identity(&request(vec![]), identity()),
        Err(BundleError::EmptyRequest)
    );
    assert_eq!(
        builder.build_with_identity(&request(vec![spread_input(), spread_input()]), identity()),
        Err(BundleError::DuplicateMarket(MarketType::Spread))
    );

    let mut wrong_league = full_request();
    wrong_league.baseline.league = "NFL".to_string();
    assert!(matches!(
        builder.build_with_identity(&wrong_league, identity()),
        Err(BundleError::BaselineLeagueMismatch { .. })
    ));

    let mut anonymous = full_request();
    anonymous.contest.contest_id = "  ".to_string();
    assert_eq!(
        builder.build_with_identity(&anonymous, identity()),
        Err(BundleError::MissingContestId)
    );
}

// =============================================================================
// VERSIONING & STATE MACHINE
// =============================================================================

#[test]
fn test_version_clock_is_strictly_monotonic() {
    let clock = VersionClock::new();
    let now = eval_time();
    let a = clock.next(now);
    let b = clock.next(now);
    let c = clock.next(now - Duration::hours(1));
    assert!(a < b && b < c);
    assert_eq!(a, DecisionVersion(now.timestamp_micros() as u64));
    assert_eq!(clock.last_issued(), c);
}

#[test]
fn test_version_clock_resumes_after_stored_version() {
    let far_future = DecisionVersion(u64::MAX / 2);
    let clock = VersionClock::starting_after(far_future);
    assert_eq!(clock.next(eval_time()), DecisionVersion(far_future.0 + 1));
}

#[test]
fn test_stage_machine_happy_paths() {
    let mut published = StageTracker::new();
    for stage in [
        DecisionStage::Gated,
        DecisionStage::Calibrated,
        DecisionStage::Classified,
        DecisionStage::Bundled,
    ] {
        published.advance(stage).unwrap();
    }
    assert!(published.stage().is_terminal());

    let mut blocked = StageTracker::new();
    blocked.advance(DecisionStage::Gated).unwrap();
    blocked.advance(DecisionStage::Blocked).unwrap();
    assert!(blocked.stage().is_terminal());
}

#[test]
fn test_stage_machine_rejects_skips_and_exits_from_terminal() {
    let mut tracker = StageTracker::new();
    assert_eq!(
        tracker.advance(DecisionStage::Calibrated),
        Err(BundleError::IllegalTransition {
            from: DecisionStage::RawInput,
            to: DecisionStage::Calibrated
        })
    );

    tracker.advance(DecisionStage::Gated).unwrap();
    tracker.advance(DecisionStage::Blocked).unwrap();
    assert!(tracker.advance(DecisionStage::Calibrated).is_err());
    assert!(tracker.advance(DecisionStage::Gated).is_err());
    assert_eq!(tracker.stage(), DecisionStage::Blocked);

    assert!(!DecisionStage::Bundled.can_transition_to(DecisionStage::RawInput));
    assert!(!DecisionStage::Gated.can_transition_to(DecisionStage::Classified));
}
