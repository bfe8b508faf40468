//! Checked Inputs and Raw Edge
//!
//! `CheckedInputs` is what the data-integrity gate hands to every later stage:
//! the simulation/market pair with every required number proven present and
//! finite. `RawEdge` is the uncalibrated mispricing derived from it.
//!
//! # Edge conventions
//!
//! - Spread: `market_home_line - fair_home_line` (points)
//! - Total: `fair_total - market_total` (points)
//! - Moneyline: `(model_prob - no_vig_market_prob) * 100` (percentage points)
//!
//! Positive edge prefers the home/over selection.

use crate::models::{
    no_vig_pair, probability_to_american, MarketSelection, MarketSnapshot, MarketType,
    SimulationSummary,
};
use chrono::{DateTime, Utc};

/// Lines within this distance of zero are treated as pick'em.
pub const ZERO_LINE_EPSILON: f64 = 1e-9;

/// Slack applied to closed-interval comparisons so that values printed as
/// exactly the tolerance (0.52 - 0.50) are not rejected by float rounding.
pub const BOUNDARY_EPSILON: f64 = 1e-9;

/// Simulation/market pair after the data-integrity gate.
#[derive(Debug, Clone)]
pub struct CheckedInputs<'a> {
    pub simulation: &'a SimulationSummary,
    pub snapshot: &'a MarketSnapshot,
    pub market_type: MarketType,
    /// Home or over selection.
    pub positive: &'a MarketSelection,
    /// Away or under selection.
    pub negative: &'a MarketSelection,
    /// Home spread or total. None for moneyline.
    pub market_line: Option<f64>,
    /// No-vig home/over probability when both prices are quoted.
    pub market_probability: Option<f64>,
    pub fair_line: Option<f64>,
    pub probability: f64,
    pub std_dev: f64,
    pub expected_margin: f64,
    pub reference_line: Option<f64>,
    pub reference_probability: Option<f64>,
    pub captured_at: DateTime<Utc>,
}

impl<'a> CheckedInputs<'a> {
    /// Zero-line markets are compared on implied probability, not points.
    pub fn is_zero_line(&self) -> bool {
        match self.market_type {
            MarketType::Moneyline => true,
            MarketType::Spread => self
                .market_line
                .map_or(false, |l| l.abs() <= ZERO_LINE_EPSILON),
            MarketType::Total => false,
        }
    }

    /// Signed uncalibrated edge and the selection it favours.
    pub fn raw_edge(&self) -> RawEdge {
        let signed = match self.market_type {
            MarketType::Spread => {
                self.market_line.unwrap_or_default() - self.fair_line.unwrap_or_default()
            }
            MarketType::Total => {
                self.fair_line.unwrap_or_default() - self.market_line.unwrap_or_default()
            }
            MarketType::Moneyline => {
                (self.probability - self.market_probability.unwrap_or(0.5)) * 100.0
            }
        };

        // A dead-even price falls back to the side the model thinks wins.
        let prefers_positive = if signed == 0.0 {
            self.probability >= 0.5
        } else {
            signed > 0.0
        };

        let (preferred, probability) = if prefers_positive {
            (self.positive, self.probability)
        } else {
            (self.negative, 1.0 - self.probability)
        };

        let fair_line = match self.market_type {
            MarketType::Spread => self
                .fair_line
                .map(|l| if prefers_positive { l } else { -l }),
            MarketType::Total => self.fair_line,
            MarketType::Moneyline => probability_to_american(probability).map(f64::from),
        };

        RawEdge {
            signed,
            prefers_positive,
            preferred_selection: preferred.selection_id.clone(),
            preferred_probability: probability,
            fair_line,
        }
    }
}

/// Uncalibrated edge for one market.
#[derive(Debug, Clone, PartialEq)]
pub struct RawEdge {
    /// Signed edge, home/over perspective.
    pub signed: f64,
    pub prefers_positive: bool,
    pub preferred_selection: String,
    /// Probability of the preferred selection.
    pub preferred_probability: f64,
    /// Fair line from the preferred selection's perspective (fair American
    /// odds for moneyline).
    pub fair_line: Option<f64>,
}

impl RawEdge {
    pub fn magnitude(&self) -> f64 {
        self.signed.abs()
    }
}

/// No-vig home/over probability of a two-way quote, if both sides are priced.
pub(crate) fn market_no_vig_probability(
    positive: &MarketSelection,
    negative: &MarketSelection,
) -> Option<f64> {
    let p = positive.implied_probability()?;
    let n = negative.implied_probability()?;
    no_vig_pair(p, n).map(|(home, _)| home)
}
