//! Decision Service Tests
//!
//! Fail-closed audit writes, bounded retry and replay.

use crate::config::ThresholdProfile;
use crate::decision::audit::{AuditError, AuditLog, AuditRecord, AuditStore};
use crate::decision::bundle::{BundleBuilder, DecisionVersion, RunIdentity};
use crate::decision::fingerprint::InputsFingerprint;
use crate::decision::service::{DecisionError, DecisionService};
use crate::decision::test_fixtures::*;
use crate::models::MarketType;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use uuid::Uuid;

// =============================================================================
// TEST HELPERS
// =============================================================================

/// Audit sink that fails a fixed number of appends before delegating.
struct FlakyLog {
    inner: AuditStore,
    failures_left: AtomicU32,
    attempts: AtomicU32,
    error: fn() -> AuditError,
}

impl FlakyLog {
    fn new(failures: u32, error: fn() -> AuditError) -> Self {
        Self {
            inner: AuditStore::in_memory().unwrap(),
            failures_left: AtomicU32::new(failures),
            attempts: AtomicU32::new(0),
            error,
        }
    }

    fn unavailable() -> AuditError {
        AuditError::Unavailable("sink offline".to_string())
    }

    fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl AuditLog for FlakyLog {
    fn append_bundle(&self, records: &[AuditRecord]) -> Result<(), AuditError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err((self.error)());
        }
        self.inner.append_bundle(records)
    }

    fn find_by_trace(&self, trace_id: Uuid) -> Result<Vec<AuditRecord>, AuditError> {
        self.inner.find_by_trace(trace_id)
    }

    fn find_history(
        &self,
        contest_id: &str,
        fingerprint: &InputsFingerprint,
    ) -> Result<Vec<AuditRecord>, AuditError> {
        self.inner.find_history(contest_id, fingerprint)
    }

    fn find_by_contest(&self, contest_id: &str) -> Result<Vec<AuditRecord>, AuditError> {
        self.inner.find_by_contest(contest_id)
    }

    fn latest_version(&self) -> Result<Option<DecisionVersion>, AuditError> {
        self.inner.latest_version()
    }
}

fn fast_retry_profile() -> Arc<ThresholdProfile> {
    let mut profile = profile();
    profile.audit.max_attempts = 3;
    profile.audit.initial_backoff_ms = 1;
    profile.audit.max_backoff_ms = 2;
    Arc::new(profile)
}

fn service<L: AuditLog>(audit: Arc<L>) -> DecisionService<L> {
    DecisionService::new(fast_retry_profile(), audit).unwrap()
}

/// Store a bundle computed at the fixture evaluation time, bypassing the
/// wall clock so every market is approved.
fn store_fixture_bundle(store: &AuditStore) -> Uuid {
    let profile = fast_retry_profile();
    let request = full_request();
    let bundle = BundleBuilder::new(&profile)
        .build_with_identity(
            &request,
            RunIdentity {
                decision_version: DecisionVersion(77),
                trace_id: Uuid::new_v4(),
                computed_at: eval_time(),
            },
        )
        .unwrap();
    store
        .append_bundle(&AuditRecord::for_bundle(&bundle, &request, 2557))
        .unwrap();
    bundle.trace_id
}

// =============================================================================
// DECIDE
// =============================================================================

#[tokio::test]
async fn test_decide_records_every_market_before_returning() {
    let store = Arc::new(AuditStore::in_memory().unwrap());
    let service = service(store.clone());

    let bundle = service.decide(&full_request()).await.unwrap();
    let stored = store.find_by_trace(bundle.trace_id).unwrap();
    assert_eq!(stored.len(), bundle.decisions.len());
    for (record, decision) in stored.iter().zip(&bundle.decisions) {
        assert_eq!(&record.decision, decision);
    }
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let log = Arc::new(FlakyLog::new(2, FlakyLog::unavailable));
    let service = service(log.clone());

    let bundle = service.decide(&full_request()).await.unwrap();
    assert_eq!(log.attempts(), 3);
    assert_eq!(log.find_by_trace(bundle.trace_id).unwrap().len(), 2);
}

#[tokio::test]
async fn test_exhausted_retries_fail_closed() {
    let log = Arc::new(FlakyLog::new(u32::MAX, FlakyLog::unavailable));
    let service = service(log.clone());

    let err = service.decide(&full_request()).await.unwrap_err();
    match err {
        DecisionError::ComplianceWriteFailed {
            attempts, source, ..
        } => {
            assert_eq!(attempts, 3);
            assert!(matches!(source, AuditError::Unavailable(_)));
        }
        other => panic!("expected compliance failure, got {}", other),
    }
    assert_eq!(log.attempts(), 3);
    assert!(log.find_by_contest(CONTEST_ID).unwrap().is_empty());
}

#[tokio::test]
async fn test_permanent_failure_is_not_retried() {
    let log = Arc::new(FlakyLog::new(1, || AuditError::ReadOnly));
    let service = service(log.clone());

    let err = service.decide(&full_request()).await.unwrap_err();
    assert!(matches!(
        err,
        DecisionError::ComplianceWriteFailed { attempts: 1, .. }
    ));
    assert_eq!(log.attempts(), 1);
    assert!(err.to_string().contains("Compliance write failed"));
}

#[tokio::test]
async fn test_invalid_request_never_reaches_audit() {
    let log = Arc::new(FlakyLog::new(0, FlakyLog::unavailable));
    let service = service(log.clone());

    let err = service.decide(&request(vec![])).await.unwrap_err();
    assert!(matches!(err, DecisionError::InvalidRequest(_)));
    assert_eq!(log.attempts(), 0);
}

#[tokio::test]
async fn test_versions_continue_after_restart() {
    let store = Arc::new(AuditStore::in_memory().unwrap());
    let far_future = u64::MAX / 2;
    let profile = fast_retry_profile();
    let request = full_request();
    let bundle = BundleBuilder::new(&profile)
        .build_with_identity(
            &request,
            RunIdentity {
                decision_version: DecisionVersion(far_future),
                trace_id: Uuid::new_v4(),
                computed_at: eval_time(),
            },
        )
        .unwrap();
    store
        .append_bundle(&AuditRecord::for_bundle(&bundle, &request, 2557))
        .unwrap();

    let restarted = service(store.clone());
    let next = restarted.decide(&request).await.unwrap();
    assert!(next.decision_version > DecisionVersion(far_future));
}

// =============================================================================
// REPLAY & VERIFY
// =============================================================================

#[test]
fn test_replay_reproduces_stored_bundle() {
    let store = Arc::new(AuditStore::in_memory().unwrap());
    let trace_id = store_fixture_bundle(&store);
    let service = service(store.clone());

    let report = service.replay(trace_id).unwrap();
    assert_eq!(report.markets_compared, 2);
    assert_eq!(report.contest_id, CONTEST_ID);
    assert!(report.is_identical(), "{:?}", report.mismatched);
}

#[tokio::test]
async fn test_replay_of_live_decision_is_identical() {
    let store = Arc::new(AuditStore::in_memory().unwrap());
    let service = service(store.clone());

    let bundle = service.decide(&full_request()).await.unwrap();
    let report = service.replay(bundle.trace_id).unwrap();
    assert!(report.is_identical());
}

#[test]
fn test_replay_detects_tampered_history() {
    let store = Arc::new(AuditStore::in_memory().unwrap());
    let profile = fast_retry_profile();
    let request = full_request();
    let bundle = BundleBuilder::new(&profile)
        .build_with_identity(
            &request,
            RunIdentity {
                decision_version: DecisionVersion(5),
                trace_id: Uuid::new_v4(),
                computed_at: eval_time(),
            },
        )
        .unwrap();
    let mut records = AuditRecord::for_bundle(&bundle, &request, 2557);
    records[1].decision.model_probability = Some(0.99);
    store.append_bundle(&records).unwrap();

    let report = service(store).replay(bundle.trace_id).unwrap();
    assert_eq!(report.mismatched, vec![MarketType::Total]);
}

#[test]
fn test_replay_errors() {
    let store = Arc::new(AuditStore::in_memory().unwrap());
    let trace_id = store_fixture_bundle(&store);

    let missing = Uuid::new_v4();
    assert!(matches!(
        service(store.clone()).replay(missing),
        Err(DecisionError::TraceNotFound(id)) if id == missing
    ));

    let other_profile = Arc::new(ThresholdProfile {
        profile_version: 2,
        ..profile()
    });
    let other = DecisionService::new(other_profile, store).unwrap();
    assert!(matches!(
        other.replay(trace_id),
        Err(DecisionError::ProfileMismatch { .. })
    ));
}

#[test]
fn test_verify_uses_stored_history() {
    let store = Arc::new(AuditStore::in_memory().unwrap());
    store_fixture_bundle(&store);
    store_fixture_bundle(&store);
    let service = service(store.clone());

    let history = store.find_by_contest(CONTEST_ID).unwrap();
    let report = service
        .verify(CONTEST_ID, history[0].fingerprint())
        .unwrap();
    assert_eq!(report.records_compared, 2);
    assert!(report.is_deterministic());
}
