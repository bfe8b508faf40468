//! Edge Decision Engine Library
//!
//! Exposes the decision pipeline, its input models and threshold
//! configuration for use by the binary and tests.

pub mod config;
pub mod decision;
pub mod models;

pub use config::ThresholdProfile;
pub use decision::{
    AuditLog, AuditStore, DecisionBundle, DecisionError, DecisionService, MarketDecision,
    ReleaseStatus,
};
pub use models::{ContestRequest, MarketType};
