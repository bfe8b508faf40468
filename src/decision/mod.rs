//! Market Decision Pipeline
//!
//! Turns simulation summaries and current market prices into versioned,
//! auditable decisions.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      DecisionService                         │
//! │  (one invocation per contest, owns VersionClock + AuditLog)  │
//! └──────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       BundleBuilder                          │
//! │  one decision_version / trace_id / computed_at per bundle    │
//! └──────────────────────────────────────────────────────────────┘
//!        │ per market
//!        ▼
//! ┌─────────────┐    ┌─────────────┐    ┌────────────────┐
//! │   Gates     │───▶│ Calibration │───▶│ Classification │
//! │ (5, ordered)│    │ (dampening) │    │ (frozen bands) │
//! └─────────────┘    └─────────────┘    └────────────────┘
//!        │                                      │
//!        └──────────── MarketDecision ◀─────────┘
//!                               │
//!                               ▼
//!                     ┌──────────────────┐
//!                     │   AuditStore     │
//!                     │ (append-only)    │
//!                     └──────────────────┘
//! ```
//!
//! # Determinism Guarantees
//!
//! - **Gates, calibration, classification**: pure functions of their inputs
//! - **Evaluation time**: an explicit input (`computed_at`), never read mid-bundle
//! - **Fingerprint**: exact float bits, contest metadata included, selection order irrelevant
//! - **Thresholds**: one frozen profile per bundle, identified in every debug bundle

pub mod audit;
pub mod bundle;
pub mod calibration;
pub mod classification;
pub mod edge;
pub mod fingerprint;
pub mod gates;
pub mod reason;
pub mod service;

#[cfg(test)]
mod test_fixtures;
#[cfg(test)]
mod bundle_tests;
#[cfg(test)]
mod service_tests;

// Re-exports for convenience
pub use audit::{
    AuditError, AuditInputs, AuditLog, AuditRecord, AuditStore, AuditStoreStats,
    DeterminismReport,
};
pub use bundle::{
    BundleBuilder, BundleError, DebugBundle, DecisionBundle, DecisionStage, DecisionVersion,
    MarketDecision, RunIdentity, StageTracker, VersionClock, DECISION_LOGIC_VERSION,
};
pub use calibration::{calibrate, CalibrationResult, EliteOverrideCheck, ELITE_OVERRIDE_TARGET};
pub use classification::classify;
pub use edge::{CheckedInputs, RawEdge};
pub use fingerprint::{fingerprint_market, InputsFingerprint, FINGERPRINT_VERSION};
pub use gates::{run_gates, GateResult, ValidationReport};
pub use reason::{Classification, DecisionReason, GateKind, ReleaseStatus, RequiredField, RiskFlag};
pub use service::{DecisionError, DecisionService, ReplayReport};
