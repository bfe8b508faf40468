//! Threshold Profile Configuration
//!
//! Frozen numeric thresholds for gates, calibration, classification and the
//! publish gate, keyed by league and market type. A profile is loaded once per
//! decision run and its identifier is stamped into every decision's debug bundle.
//! Changing a threshold means shipping a new `profile_version`.

use crate::models::MarketType;
use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Env var consulted by [`ThresholdProfile::from_env`].
pub const PROFILE_PATH_ENV: &str = "DECISION_PROFILE_PATH";
pub const DEFAULT_PROFILE_PATH: &str = "decision_profile.toml";

/// Frozen threshold profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdProfile {
    #[serde(default = "default_profile_id")]
    pub profile_id: String,

    #[serde(default = "default_profile_version")]
    pub profile_version: u32,

    /// Thresholds used when no override matches.
    #[serde(default)]
    pub defaults: MarketThresholds,

    /// League and/or market-type specific thresholds.
    #[serde(default)]
    pub overrides: Vec<ThresholdOverride>,

    /// Audit retention and write-retry policy.
    #[serde(default)]
    pub audit: AuditPolicy,
}

fn default_profile_id() -> String {
    "default".to_string()
}

fn default_profile_version() -> u32 {
    1
}

impl Default for ThresholdProfile {
    fn default() -> Self {
        Self {
            profile_id: default_profile_id(),
            profile_version: default_profile_version(),
            defaults: MarketThresholds::default(),
            overrides: Vec::new(),
            audit: AuditPolicy::default(),
        }
    }
}

impl ThresholdProfile {
    /// Load from TOML file. The profile is validated before it is returned.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read threshold profile {}", path.display()))?;
        let profile: Self = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse threshold profile {}", path.display()))?;
        profile.validate()?;
        Ok(profile)
    }

    /// Load from `DECISION_PROFILE_PATH` or the default path, falling back to
    /// built-in defaults when no file exists.
    pub fn from_env() -> anyhow::Result<Self> {
        let path =
            std::env::var(PROFILE_PATH_ENV).unwrap_or_else(|_| DEFAULT_PROFILE_PATH.to_string());

        if !Path::new(&path).exists() {
            tracing::debug!("No threshold profile at {}, using built-in defaults", path);
            return Ok(Self::default());
        }
        Self::load(&path)
    }

    /// Save to TOML file
    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Identifier recorded in every debug bundle, e.g. `default@v1`.
    pub fn profile_key(&self) -> String {
        format!("{}@v{}", self.profile_id, self.profile_version)
    }

    /// Resolve thresholds for a league and market type.
    ///
    /// Most specific match wins: league+market, then league, then market,
    /// then defaults. Ties go to the earliest override in the file.
    pub fn resolve(&self, league: &str, market_type: MarketType) -> &MarketThresholds {
        let mut best: Option<(u8, &ThresholdOverride)> = None;
        for o in &self.overrides {
            let Some(score) = o.specificity(league, market_type) else {
                continue;
            };
            if best.map_or(true, |(s, _)| score > s) {
                best = Some((score, o));
            }
        }
        best.map(|(_, o)| &o.thresholds).unwrap_or(&self.defaults)
    }

    /// Reject profiles whose thresholds are out of order or would amplify
    /// conviction.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.profile_id.trim().is_empty() {
            bail!("profile_id cannot be empty");
        }
        self.defaults
            .validate()
            .context("invalid default thresholds")?;
        for (i, o) in self.overrides.iter().enumerate() {
            if o.league.is_none() && o.market_type.is_none() {
                bail!("override #{} matches nothing (no league or market_type)", i);
            }
            o.thresholds
                .validate()
                .with_context(|| format!("invalid thresholds in override #{}", i))?;
        }
        if self.audit.max_attempts == 0 {
            bail!("audit.max_attempts must be at least 1");
        }
        if self.audit.retention_days < MIN_RETENTION_DAYS {
            bail!(
                "audit.retention_days {} is below the {} day minimum",
                self.audit.retention_days,
                MIN_RETENTION_DAYS
            );
        }
        Ok(())
    }
}

/// Thresholds applied to one league + market type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketThresholds {
    pub gates: GateThresholds,
    pub calibration: CalibrationThresholds,
    pub classification: ClassificationThresholds,
    pub publish: PublishThresholds,
}

impl MarketThresholds {
    fn validate(&self) -> anyhow::Result<()> {
        let g = &self.gates;
        if g.line_tolerance < 0.0 || g.probability_tolerance < 0.0 || g.directional_tolerance < 0.0
        {
            bail!("gate tolerances must be non-negative");
        }
        if g.max_simulation_age_mins <= 0 {
            bail!("gates.max_simulation_age_mins must be positive");
        }

        let c = &self.calibration;
        for (name, factor) in [
            ("bias_dampening_floor", c.bias_dampening_floor),
            ("anchor_floor", c.anchor_floor),
            ("variance_elevated_penalty", c.variance_elevated_penalty),
            ("variance_high_penalty", c.variance_high_penalty),
        ] {
            if !(factor > 0.0 && factor <= 1.0) {
                bail!("calibration.{} must be in (0, 1], got {}", name, factor);
            }
        }
        if c.bias_dampening_slope < 0.0 {
            bail!("calibration.bias_dampening_slope must be non-negative");
        }
        if c.anchor_soft >= c.anchor_hard {
            bail!(
                "calibration.anchor_soft ({}) must be below anchor_hard ({})",
                c.anchor_soft,
                c.anchor_hard
            );
        }
        if !(c.variance_normal < c.variance_high && c.variance_high < c.variance_extreme) {
            bail!("calibration variance thresholds must satisfy normal < high < extreme");
        }

        let k = &self.classification;
        if !(0.0 <= k.aligned_below && k.aligned_below < k.edge_at) {
            bail!("classification thresholds must satisfy 0 <= aligned_below < edge_at");
        }
        if k.edge_probability_low > k.edge_probability_high {
            bail!("classification.edge_probability_low must not exceed edge_probability_high");
        }
        Ok(())
    }
}

/// Override entry. At least one of `league` / `market_type` must be set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub league: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub market_type: Option<MarketType>,
    #[serde(default)]
    pub thresholds: MarketThresholds,
}

impl ThresholdOverride {
    fn specificity(&self, league: &str, market_type: MarketType) -> Option<u8> {
        let league_match = match &self.league {
            Some(l) if l.eq_ignore_ascii_case(league) => Some(true),
            Some(_) => return None,
            None => None,
        };
        let market_match = match self.market_type {
            Some(m) if m == market_type => Some(true),
            Some(_) => return None,
            None => None,
        };
        match (league_match, market_match) {
            (Some(_), Some(_)) => Some(3),
            (Some(_), None) => Some(2),
            (None, Some(_)) => Some(1),
            (None, None) => None,
        }
    }
}

/// Validation gate thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateThresholds {
    /// Max |reference line - market line| in points (closed interval).
    pub line_tolerance: f64,
    /// Max implied-probability delta for zero-line markets (closed interval).
    pub probability_tolerance: f64,
    /// Band around 0.5 required when the simulated margin is zero.
    pub directional_tolerance: f64,
    pub max_simulation_age_mins: i64,
    /// How far in the future a simulation timestamp may sit before it is rejected.
    pub max_clock_skew_secs: i64,
    /// Below this many iterations the decision is flagged, not blocked.
    pub min_iterations: u64,
    /// Below this convergence score the decision is flagged, not blocked.
    pub min_convergence: f64,
}

impl Default for GateThresholds {
    fn default() -> Self {
        Self {
            line_tolerance: 0.25,
            probability_tolerance: 0.02,
            directional_tolerance: 0.02,
            max_simulation_age_mins: 120,
            max_clock_skew_secs: 300,
            min_iterations: 10_000,
            min_convergence: 0.95,
        }
    }
}

/// Calibration constraint-layer thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationThresholds {
    /// |bias_vs_actual| above this triggers league dampening (points).
    pub bias_actual_trigger: f64,
    /// |bias_vs_market| above this triggers league dampening (points).
    pub bias_market_trigger: f64,
    /// Dampening per point of bias beyond the trigger.
    pub bias_dampening_slope: f64,
    pub bias_dampening_floor: f64,

    /// Deviation below which no market-anchor penalty applies.
    pub anchor_soft: f64,
    /// Deviation at or beyond which publication is blocked (absent elite override).
    pub anchor_hard: f64,
    pub anchor_floor: f64,

    pub variance_normal: f64,
    pub variance_high: f64,
    pub variance_extreme: f64,
    pub variance_elevated_penalty: f64,
    pub variance_high_penalty: f64,

    pub elite: EliteOverrideThresholds,
}

impl Default for CalibrationThresholds {
    fn default() -> Self {
        Self {
            bias_actual_trigger: 1.5,
            bias_market_trigger: 1.0,
            bias_dampening_slope: 0.05,
            bias_dampening_floor: 0.90,
            anchor_soft: 3.0,
            anchor_hard: 6.0,
            anchor_floor: 0.90,
            variance_normal: 1.25,
            variance_high: 1.5,
            variance_extreme: 2.0,
            variance_elevated_penalty: 0.75,
            variance_high_penalty: 0.50,
            elite: EliteOverrideThresholds::default(),
        }
    }
}

/// All three must hold for an elite override.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EliteOverrideThresholds {
    pub min_probability: f64,
    pub max_variance_z: f64,
    pub min_data_quality: f64,
}

impl Default for EliteOverrideThresholds {
    fn default() -> Self {
        Self {
            min_probability: 0.70,
            max_variance_z: 0.80,
            min_data_quality: 0.98,
        }
    }
}

/// Classification thresholds. Boundary values belong to the upper bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassificationThresholds {
    pub aligned_below: f64,
    pub edge_at: f64,
    pub edge_probability_high: f64,
    pub edge_probability_low: f64,
}

impl Default for ClassificationThresholds {
    fn default() -> Self {
        Self {
            aligned_below: 0.5,
            edge_at: 2.0,
            edge_probability_high: 0.55,
            edge_probability_low: 0.45,
        }
    }
}

/// Minimums checked after all penalties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishThresholds {
    pub min_probability: f64,
    pub min_edge: f64,
}

impl Default for PublishThresholds {
    fn default() -> Self {
        Self {
            min_probability: 0.52,
            min_edge: 0.5,
        }
    }
}

/// Seven years, leap days included.
pub const MIN_RETENTION_DAYS: i64 = 2557;

/// Audit retention and write-retry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditPolicy {
    pub retention_days: i64,
    /// Total attempts for one bundle append, first try included.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for AuditPolicy {
    fn default() -> Self {
        Self {
            retention_days: MIN_RETENTION_DAYS,
            max_attempts: 3,
            initial_backoff_ms: 50,
            max_backoff_ms: 2_000,
        }
    }
}
