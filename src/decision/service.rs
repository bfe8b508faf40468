//! Decision Service
//!
//! Caller-side orchestration around the pure pipeline:
//!
//! ```text
//! build bundle -> append to audit (bounded retry) -> return bundle
//! ```
//!
//! A bundle is only handed back after every one of its decisions is durably
//! recorded. If the audit write still fails after the retry budget, the
//! request fails with [`DecisionError::ComplianceWriteFailed`] and the
//! computed bundle is dropped.

use crate::config::ThresholdProfile;
use crate::decision::audit::{AuditError, AuditLog, AuditRecord, DeterminismReport};
use crate::decision::bundle::{
    BundleBuilder, BundleError, DecisionBundle, RunIdentity, VersionClock,
    DECISION_LOGIC_VERSION,
};
use crate::decision::fingerprint::InputsFingerprint;
use crate::models::{ContestRequest, MarketType};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub struct DecisionService<L: AuditLog> {
    profile: Arc<ThresholdProfile>,
    audit: Arc<L>,
    versions: VersionClock,
}

impl<L: AuditLog> DecisionService<L> {
    /// Seeds the version clock from the audit log so versions keep increasing
    /// across restarts.
    pub fn new(profile: Arc<ThresholdProfile>, audit: Arc<L>) -> Result<Self, DecisionError> {
        let versions = match audit.latest_version()? {
            Some(latest) => VersionClock::starting_after(latest),
            None => VersionClock::new(),
        };
        Ok(Self {
            profile,
            audit,
            versions,
        })
    }

    pub fn profile(&self) -> &ThresholdProfile {
        &self.profile
    }

    pub fn audit(&self) -> &L {
        &self.audit
    }

    /// Decide every requested market of one contest and record the result.
    pub async fn decide(&self, request: &ContestRequest) -> Result<DecisionBundle, DecisionError> {
        let bundle = BundleBuilder::new(&self.profile).build(request, &self.versions)?;
        let records =
            AuditRecord::for_bundle(&bundle, request, self.profile.audit.retention_days);

        match self.append_with_retry(&records).await {
            Ok(()) => {
                info!(
                    contest = %bundle.contest_id,
                    trace_id = %bundle.trace_id,
                    records = records.len(),
                    "decision bundle recorded"
                );
                Ok(bundle)
            }
            Err((attempts, source)) => {
                error!(
                    contest = %bundle.contest_id,
                    trace_id = %bundle.trace_id,
                    attempts,
                    error = %source,
                    "compliance write failed, discarding bundle"
                );
                Err(DecisionError::ComplianceWriteFailed {
                    trace_id: bundle.trace_id,
                    attempts,
                    source,
                })
            }
        }
    }

    /// Append with doubling backoff. Only transient errors are retried.
    async fn append_with_retry(&self, records: &[AuditRecord]) -> Result<(), (u32, AuditError)> {
        let policy = &self.profile.audit;
        let max_attempts = policy.max_attempts.max(1);
        let mut backoff = policy.initial_backoff_ms;
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.audit.append_bundle(records) {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    warn!("Audit append failed (attempt {}): {}", attempt, e);
                    debug!("Retrying in {}ms", backoff);
                    sleep(Duration::from_millis(backoff)).await;
                    backoff = (backoff * 2).min(policy.max_backoff_ms);
                }
                Err(e) => return Err((attempt, e)),
            }
        }
    }

    /// Recompute a stored bundle from its recorded inputs at its recorded
    /// evaluation time and compare the input-scoped fields.
    pub fn replay(&self, trace_id: Uuid) -> Result<ReplayReport, DecisionError> {
        let records = self.audit.find_by_trace(trace_id)?;
        let first = records
            .first()
            .ok_or(DecisionError::TraceNotFound(trace_id))?;

        let stored_debug = &first.decision.debug;
        let active_profile = self.profile.profile_key();
        if stored_debug.config_profile != active_profile {
            return Err(DecisionError::ProfileMismatch {
                stored: stored_debug.config_profile.clone(),
                active: active_profile,
            });
        }
        if stored_debug.logic_version != DECISION_LOGIC_VERSION {
            return Err(DecisionError::LogicVersionMismatch {
                stored: stored_debug.logic_version.clone(),
                active: DECISION_LOGIC_VERSION.to_string(),
            });
        }

        let request = ContestRequest {
            contest: first.inputs.contest.clone(),
            baseline: first.inputs.baseline.clone(),
            markets: records.iter().map(|r| r.inputs.market.clone()).collect(),
        };
        let identity = RunIdentity {
            decision_version: stored_debug.decision_version,
            trace_id,
            computed_at: stored_debug.computed_at,
        };
        let replayed = BundleBuilder::new(&self.profile).build_with_identity(&request, identity)?;

        let mut mismatched = Vec::new();
        for record in &records {
            let market_type = record.decision.market_type;
            let identical = replayed
                .get(market_type)
                .map_or(false, |d| d.determinism_key() == record.decision.determinism_key());
            if !identical {
                mismatched.push(market_type);
            }
        }

        if mismatched.is_empty() {
            info!(trace_id = %trace_id, markets = records.len(), "replay reproduced stored bundle");
        } else {
            warn!(
                trace_id = %trace_id,
                mismatched = ?mismatched,
                "replay diverged from stored bundle"
            );
        }

        Ok(ReplayReport {
            trace_id,
            contest_id: first.decision.contest_id.clone(),
            markets_compared: records.len(),
            mismatched,
        })
    }

    pub fn verify(
        &self,
        contest_id: &str,
        fingerprint: &InputsFingerprint,
    ) -> Result<DeterminismReport, DecisionError> {
        Ok(self.audit.verify_determinism(contest_id, fingerprint)?)
    }
}

/// Result of replaying one stored bundle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplayReport {
    pub trace_id: Uuid,
    pub contest_id: String,
    pub markets_compared: usize,
    pub mismatched: Vec<MarketType>,
}

impl ReplayReport {
    pub fn is_identical(&self) -> bool {
        self.mismatched.is_empty()
    }
}

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug)]
pub enum DecisionError {
    /// The request itself is unusable (empty, duplicate markets, ...).
    InvalidRequest(BundleError),
    /// The bundle was computed but could not be recorded; it was discarded.
    ComplianceWriteFailed {
        trace_id: Uuid,
        attempts: u32,
        source: AuditError,
    },
    Audit(AuditError),
    TraceNotFound(Uuid),
    ProfileMismatch {
        stored: String,
        active: String,
    },
    LogicVersionMismatch {
        stored: String,
        active: String,
    },
}

impl std::fmt::Display for DecisionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidRequest(e) => write!(f, "Invalid request: {}", e),
            Self::ComplianceWriteFailed {
                trace_id,
                attempts,
                source,
            } => write!(
                f,
                "Compliance write failed for trace {} after {} attempt(s): {}",
                trace_id, attempts, source
            ),
            Self::Audit(e) => write!(f, "Audit error: {}", e),
            Self::TraceNotFound(id) => write!(f, "No audit records for trace {}", id),
            Self::ProfileMismatch { stored, active } => write!(
                f,
                "Trace was computed with profile {} but {} is active",
                stored, active
            ),
            Self::LogicVersionMismatch { stored, active } => write!(
                f,
                "Trace was computed with logic {} but {} is active",
                stored, active
            ),
        }
    }
}

impl std::error::Error for DecisionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::InvalidRequest(e) => Some(e),
            Self::ComplianceWriteFailed { source, .. } => Some(source),
            Self::Audit(e) => Some(e),
            _ => None,
        }
    }
}

impl From<BundleError> for DecisionError {
    fn from(e: BundleError) -> Self {
        Self::InvalidRequest(e)
    }
}

impl From<AuditError> for DecisionError {
    fn from(e: AuditError) -> Self {
        Self::Audit(e)
    }
}
