//! Inputs Fingerprint
//!
//! SHA-256 over a canonical encoding of everything a market decision is a
//! function of:
//!
//! ```text
//! InputsFingerprint = SHA256(
//!   "INPUTSFP_V2" || logic version || profile key ||
//!   contest metadata || market type ||
//!   simulation || snapshot || league baseline ||
//!   freshness verdict at evaluation time
//! )
//! ```
//!
//! The freshness verdict includes the failure detail (age, skew) so that two
//! decisions sharing a fingerprint also share every reason they carry.
//!
//! # Canonicalization
//!
//! - Floats are hashed by their IEEE-754 bit pattern, with -0.0 folded into
//!   0.0 and every NaN folded into one canonical NaN. No rounding: two values
//!   either side of a threshold never share a fingerprint
//! - Strings are length-prefixed UTF-8
//! - Optional values carry a presence byte
//! - Selections are sorted by selection id before hashing
//! - Timestamps are encoded as microseconds since the epoch

use crate::decision::reason::DecisionReason;
use crate::models::{
    ContestMetadata, LeagueBaseline, MarketSnapshot, MarketType, SimulationSummary,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Fingerprint format version - increment when the encoding changes.
pub const FINGERPRINT_VERSION: &str = "INPUTSFP_V2";

/// Hex-encoded SHA-256 of a market's canonical inputs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InputsFingerprint(String);

impl InputsFingerprint {
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex chars, for logs.
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl std::fmt::Display for InputsFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Canonical bit pattern of a float.
#[inline]
pub fn canonical_f64(value: f64) -> u64 {
    if value.is_nan() {
        f64::NAN.to_bits()
    } else if value == 0.0 {
        0.0f64.to_bits()
    } else {
        value.to_bits()
    }
}

/// Incremental canonical encoder.
pub struct FingerprintHasher {
    hasher: Sha256,
}

impl Default for FingerprintHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl FingerprintHasher {
    pub fn new() -> Self {
        let mut h = Self {
            hasher: Sha256::new(),
        };
        h.str(FINGERPRINT_VERSION);
        h
    }

    pub fn str(&mut self, value: &str) -> &mut Self {
        self.hasher.update((value.len() as u64).to_le_bytes());
        self.hasher.update(value.as_bytes());
        self
    }

    pub fn u64(&mut self, value: u64) -> &mut Self {
        self.hasher.update(value.to_le_bytes());
        self
    }

    pub fn i64(&mut self, value: i64) -> &mut Self {
        self.hasher.update(value.to_le_bytes());
        self
    }

    pub fn f64(&mut self, value: f64) -> &mut Self {
        self.u64(canonical_f64(value))
    }

    pub fn bool(&mut self, value: bool) -> &mut Self {
        self.hasher.update([value as u8]);
        self
    }

    pub fn opt_f64(&mut self, value: Option<f64>) -> &mut Self {
        match value {
            Some(v) => self.bool(true).f64(v),
            None => self.bool(false),
        }
    }

    pub fn opt_i64(&mut self, value: Option<i64>) -> &mut Self {
        match value {
            Some(v) => self.bool(true).i64(v),
            None => self.bool(false),
        }
    }

    pub fn opt_str(&mut self, value: Option<&str>) -> &mut Self {
        match value {
            Some(v) => self.bool(true).str(v),
            None => self.bool(false),
        }
    }

    pub fn timestamp(&mut self, value: DateTime<Utc>) -> &mut Self {
        self.i64(value.timestamp_micros())
    }

    pub fn opt_timestamp(&mut self, value: Option<DateTime<Utc>>) -> &mut Self {
        self.opt_i64(value.map(|t| t.timestamp_micros()))
    }

    pub fn simulation(&mut self, simulation: Option<&SimulationSummary>) -> &mut Self {
        let Some(s) = simulation else {
            return self.bool(false);
        };
        self.bool(true)
            .str(&s.contest_id)
            .str(s.market_type.as_str())
            .opt_f64(s.fair_line)
            .opt_f64(s.probability)
            .opt_f64(s.std_dev)
            .opt_f64(s.expected_margin)
            .opt_f64(s.reference_line)
            .opt_f64(s.reference_probability)
            .u64(s.iterations)
            .f64(s.convergence)
            .f64(s.data_quality)
            .opt_str(s.model_pick.as_deref())
            .timestamp(s.computed_at)
    }

    pub fn snapshot(&mut self, snapshot: Option<&MarketSnapshot>) -> &mut Self {
        let Some(s) = snapshot else {
            return self.bool(false);
        };
        self.bool(true)
            .str(&s.contest_id)
            .str(s.market_type.as_str())
            .opt_timestamp(s.captured_at)
            .str(&s.source);

        let mut selections: Vec<_> = s.selections.iter().collect();
        selections.sort_by(|a, b| a.selection_id.cmp(&b.selection_id));
        self.u64(selections.len() as u64);
        for sel in selections {
            self.str(&sel.selection_id)
                .str(sel.side.as_str())
                .opt_f64(sel.line)
                .opt_i64(sel.american_odds.map(i64::from));
        }
        self
    }

    pub fn contest(&mut self, contest: &ContestMetadata) -> &mut Self {
        self.str(&contest.contest_id)
            .str(&contest.league)
            .opt_str(contest.home_participant.as_deref())
            .opt_str(contest.away_participant.as_deref())
            .opt_timestamp(contest.starts_at)
    }

    pub fn baseline(&mut self, baseline: &LeagueBaseline) -> &mut Self {
        self.str(&baseline.league)
            .str(&baseline.snapshot_version)
            .timestamp(baseline.as_of)
            .f64(baseline.bias_vs_actual)
            .f64(baseline.bias_vs_market)
            .f64(baseline.over_rate)
            .u64(baseline.median_std_dev.len() as u64);
        for (market_type, median) in &baseline.median_std_dev {
            self.str(market_type.as_str()).f64(*median);
        }
        self
    }

    pub fn finish(self) -> InputsFingerprint {
        InputsFingerprint(hex::encode(self.hasher.finalize()))
    }
}

/// Everything one market decision depends on.
pub struct FingerprintInputs<'a> {
    pub logic_version: &'a str,
    pub profile_key: &'a str,
    pub contest: &'a ContestMetadata,
    pub market_type: MarketType,
    pub simulation: Option<&'a SimulationSummary>,
    pub snapshot: Option<&'a MarketSnapshot>,
    pub baseline: &'a LeagueBaseline,
    /// Freshness verdict at evaluation time; None when the gate did not run.
    pub freshness: Option<Result<(), &'a DecisionReason>>,
}

/// Compute the inputs fingerprint for one market.
pub fn fingerprint_market(inputs: &FingerprintInputs<'_>) -> InputsFingerprint {
    let mut h = FingerprintHasher::new();
    h.str(inputs.logic_version)
        .str(inputs.profile_key)
        .contest(inputs.contest)
        .str(inputs.market_type.as_str())
        .simulation(inputs.simulation)
        .snapshot(inputs.snapshot)
        .baseline(inputs.baseline);
    match inputs.freshness {
        None => h.u64(0),
        Some(Ok(())) => h.u64(1),
        Some(Err(reason)) => h.u64(2).str(&reason.to_string()),
    };
    h.finish()
}
