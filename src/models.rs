//! Decision Input Contract
//!
//! Read-only records consumed by the decision pipeline. Simulation summaries and
//! market snapshots are produced upstream (simulation engine, odds ingestion) and
//! are never mutated here. League baselines are a versioned snapshot refreshed by
//! an external batch job and handed to the pipeline explicitly.
//!
//! # Line conventions
//!
//! - Spread lines are quoted per selection; the home selection's line is the
//!   canonical "market line" (negative = home favoured).
//! - `SimulationSummary::fair_line` is the model's fair home spread or fair total.
//! - `SimulationSummary::probability` is P(home covers the current line),
//!   P(over), or P(home wins), depending on market type.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Market types the pipeline decides on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketType {
    Spread,
    Total,
    Moneyline,
}

impl MarketType {
    pub const ALL: [MarketType; 3] = [MarketType::Spread, MarketType::Total, MarketType::Moneyline];

    pub fn as_str(&self) -> &'static str {
        match self {
            MarketType::Spread => "spread",
            MarketType::Total => "total",
            MarketType::Moneyline => "moneyline",
        }
    }

    /// Whether edge is expressed in points (spread/total) rather than
    /// probability percentage points (moneyline).
    pub fn edge_in_points(&self) -> bool {
        !matches!(self, MarketType::Moneyline)
    }
}

impl std::fmt::Display for MarketType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side of a two-way market a selection represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionSide {
    Home,
    Away,
    Over,
    Under,
}

impl SelectionSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            SelectionSide::Home => "home",
            SelectionSide::Away => "away",
            SelectionSide::Over => "over",
            SelectionSide::Under => "under",
        }
    }

    /// Home and Over are the "positive" perspective all model probabilities
    /// and margins are quoted from.
    pub fn is_positive(&self) -> bool {
        matches!(self, SelectionSide::Home | SelectionSide::Over)
    }

    pub fn opposite(&self) -> SelectionSide {
        match self {
            SelectionSide::Home => SelectionSide::Away,
            SelectionSide::Away => SelectionSide::Home,
            SelectionSide::Over => SelectionSide::Under,
            SelectionSide::Under => SelectionSide::Over,
        }
    }

    /// The (positive, negative) sides for a market type.
    pub fn pair_for(market_type: MarketType) -> (SelectionSide, SelectionSide) {
        match market_type {
            MarketType::Spread | MarketType::Moneyline => (SelectionSide::Home, SelectionSide::Away),
            MarketType::Total => (SelectionSide::Over, SelectionSide::Under),
        }
    }
}

impl std::fmt::Display for SelectionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One side of a market as currently quoted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketSelection {
    pub selection_id: String,
    pub side: SelectionSide,
    /// Spread or total line. None for moneyline.
    pub line: Option<f64>,
    /// American odds (e.g. -110, +130).
    pub american_odds: Option<i32>,
}

impl MarketSelection {
    pub fn new(selection_id: impl Into<String>, side: SelectionSide) -> Self {
        Self {
            selection_id: selection_id.into(),
            side,
            line: None,
            american_odds: None,
        }
    }

    pub fn with_line(mut self, line: f64) -> Self {
        self.line = Some(line);
        self
    }

    pub fn with_odds(mut self, american_odds: i32) -> Self {
        self.american_odds = Some(american_odds);
        self
    }

    /// Implied probability of the quoted price, vig included.
    pub fn implied_probability(&self) -> Option<f64> {
        self.american_odds.and_then(american_to_probability)
    }
}

/// Output of the simulation engine for one contest + market type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationSummary {
    pub contest_id: String,
    pub market_type: MarketType,
    /// Fair home spread or fair total. Not used for moneyline.
    pub fair_line: Option<f64>,
    /// Home-cover / over / home-win probability.
    pub probability: Option<f64>,
    /// Standard deviation of the simulated outcome distribution.
    pub std_dev: Option<f64>,
    /// Mean simulated outcome against the evaluated line, home/over perspective.
    pub expected_margin: Option<f64>,
    /// Market line the simulation was conditioned on.
    pub reference_line: Option<f64>,
    /// Market-implied (no-vig) home/over probability the simulation was conditioned
    /// on. Used for zero-line markets.
    pub reference_probability: Option<f64>,
    pub iterations: u64,
    /// Convergence score in [0, 1].
    pub convergence: f64,
    /// Upstream data-quality score in [0, 1].
    pub data_quality: f64,
    /// Selection the simulation engine itself reports as mispriced, if any.
    #[serde(default)]
    pub model_pick: Option<String>,
    pub computed_at: DateTime<Utc>,
}

/// Current market state for one contest + market type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub contest_id: String,
    pub market_type: MarketType,
    pub selections: Vec<MarketSelection>,
    pub captured_at: Option<DateTime<Utc>>,
    pub source: String,
}

impl MarketSnapshot {
    pub fn selection(&self, side: SelectionSide) -> Option<&MarketSelection> {
        self.selections.iter().find(|s| s.side == side)
    }

    pub fn selection_by_id(&self, selection_id: &str) -> Option<&MarketSelection> {
        self.selections.iter().find(|s| s.selection_id == selection_id)
    }
}

/// Static facts about the contest being decided.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContestMetadata {
    pub contest_id: String,
    pub league: String,
    pub home_participant: Option<String>,
    pub away_participant: Option<String>,
    #[serde(default)]
    pub starts_at: Option<DateTime<Utc>>,
}

impl ContestMetadata {
    pub fn participant(&self, side: SelectionSide) -> Option<&str> {
        match side {
            SelectionSide::Home => self.home_participant.as_deref(),
            SelectionSide::Away => self.away_participant.as_deref(),
            SelectionSide::Over | SelectionSide::Under => None,
        }
    }

    pub fn has_both_participants(&self) -> bool {
        self.home_participant.is_some() && self.away_participant.is_some()
    }
}

/// Rolling daily league bias figures, maintained by an external batch process.
///
/// Passed into calibration as an explicit, versioned, read-only snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeagueBaseline {
    pub league: String,
    /// Identifier of the batch refresh that produced this snapshot.
    pub snapshot_version: String,
    pub as_of: DateTime<Utc>,
    /// Rolling model-vs-actual bias (points).
    pub bias_vs_actual: f64,
    /// Rolling model-vs-market bias (points).
    pub bias_vs_market: f64,
    /// Fraction of totals that landed over.
    pub over_rate: f64,
    /// Rolling median simulated std dev per market type.
    #[serde(default)]
    pub median_std_dev: BTreeMap<MarketType, f64>,
}

impl LeagueBaseline {
    pub fn median_std_dev_for(&self, market_type: MarketType) -> Option<f64> {
        self.median_std_dev.get(&market_type).copied()
    }
}

/// Simulation + market pair for one requested market type.
///
/// Either side may be absent; the pipeline turns an absent record into a
/// missing-data block rather than dropping the market.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketInput {
    pub market_type: MarketType,
    pub simulation: Option<SimulationSummary>,
    pub snapshot: Option<MarketSnapshot>,
}

impl MarketInput {
    pub fn new(
        market_type: MarketType,
        simulation: Option<SimulationSummary>,
        snapshot: Option<MarketSnapshot>,
    ) -> Self {
        Self {
            market_type,
            simulation,
            snapshot,
        }
    }
}

/// Everything needed to decide every requested market of one contest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContestRequest {
    pub contest: ContestMetadata,
    pub baseline: LeagueBaseline,
    pub markets: Vec<MarketInput>,
}

// =============================================================================
// ODDS HELPERS
// =============================================================================

/// Convert American odds to implied probability. Odds in (-100, 100) are invalid.
pub fn american_to_probability(odds: i32) -> Option<f64> {
    if odds >= 100 {
        Some(100.0 / (odds as f64 + 100.0))
    } else if odds <= -100 {
        let risk = -(odds as f64);
        Some(risk / (risk + 100.0))
    } else {
        None
    }
}

/// Convert a probability to fair American odds.
pub fn probability_to_american(probability: f64) -> Option<i32> {
    if !probability.is_finite() || probability <= 0.0 || probability >= 1.0 {
        return None;
    }
    let odds = if probability >= 0.5 {
        -(probability / (1.0 - probability)) * 100.0
    } else {
        ((1.0 - probability) / probability) * 100.0
    };
    Some(odds.round() as i32)
}

/// Remove the bookmaker margin from a two-way pair of implied probabilities.
pub fn no_vig_pair(first: f64, second: f64) -> Option<(f64, f64)> {
    let total = first + second;
    if !total.is_finite() || total <= 0.0 {
        return None;
    }
    Some((first / total, second / total))
}
