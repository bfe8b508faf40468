//! Shared builders for decision pipeline tests.
//!
//! Baseline scenario: NBA, BOS (home) vs NYK (away), evaluated at
//! 2026-03-14 19:00 UTC with simulations computed ten minutes earlier.
//!
//! - Spread: market BOS -3 (-110/-110), fair -5.5, P(cover) 0.60 -> EDGE on BOS
//! - Total: market 220.5 (-110/-110), fair 219, P(over) 0.45 -> LEAN on under

use crate::config::ThresholdProfile;
use crate::models::{
    ContestMetadata, ContestRequest, LeagueBaseline, MarketInput, MarketSelection,
    MarketSnapshot, MarketType, SelectionSide, SimulationSummary,
};
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::BTreeMap;

pub const CONTEST_ID: &str = "nba-2026-03-14-nyk-bos";

pub fn eval_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 14, 19, 0, 0).unwrap()
}

pub fn contest() -> ContestMetadata {
    ContestMetadata {
        contest_id: CONTEST_ID.to_string(),
        league: "NBA".to_string(),
        home_participant: Some("BOS".to_string()),
        away_participant: Some("NYK".to_string()),
        starts_at: Some(eval_time() + Duration::hours(4)),
    }
}

pub fn baseline() -> LeagueBaseline {
    LeagueBaseline {
        league: "NBA".to_string(),
        snapshot_version: "nba-daily-2026-03-14".to_string(),
        as_of: eval_time() - Duration::hours(6),
        bias_vs_actual: 0.5,
        bias_vs_market: 0.3,
        over_rate: 0.51,
        median_std_dev: BTreeMap::from([
            (MarketType::Spread, 12.0),
            (MarketType::Total, 18.0),
            (MarketType::Moneyline, 12.0),
        ]),
    }
}

pub fn profile() -> ThresholdProfile {
    ThresholdProfile::default()
}

fn simulation(market_type: MarketType) -> SimulationSummary {
    SimulationSummary {
        contest_id: CONTEST_ID.to_string(),
        market_type,
        fair_line: None,
        probability: None,
        std_dev: None,
        expected_margin: None,
        reference_line: None,
        reference_probability: None,
        iterations: 50_000,
        convergence: 0.99,
        data_quality: 0.99,
        model_pick: None,
        computed_at: eval_time() - Duration::minutes(10),
    }
}

fn snapshot(market_type: MarketType, selections: Vec<MarketSelection>) -> MarketSnapshot {
    MarketSnapshot {
        contest_id: CONTEST_ID.to_string(),
        market_type,
        selections,
        captured_at: Some(eval_time() - Duration::minutes(2)),
        source: "consensus".to_string(),
    }
}

// =============================================================================
// SPREAD
// =============================================================================

pub fn spread_simulation() -> SimulationSummary {
    SimulationSummary {
        fair_line: Some(-5.5),
        probability: Some(0.60),
        std_dev: Some(12.0),
        expected_margin: Some(2.5),
        reference_line: Some(-3.0),
        ..simulation(MarketType::Spread)
    }
}

pub fn spread_snapshot_at(home_line: f64) -> MarketSnapshot {
    snapshot(
        MarketType::Spread,
        vec![
            MarketSelection::new("bos-spread", SelectionSide::Home)
                .with_line(home_line)
                .with_odds(-110),
            MarketSelection::new("nyk-spread", SelectionSide::Away)
                .with_line(-home_line)
                .with_odds(-110),
        ],
    )
}

pub fn spread_snapshot() -> MarketSnapshot {
    spread_snapshot_at(-3.0)
}

// =============================================================================
// TOTAL
// =============================================================================

pub fn total_simulation() -> SimulationSummary {
    SimulationSummary {
        fair_line: Some(219.0),
        probability: Some(0.45),
        std_dev: Some(18.0),
        expected_margin: Some(-1.5),
        reference_line: Some(220.5),
        ..simulation(MarketType::Total)
    }
}

pub fn total_snapshot() -> MarketSnapshot {
    snapshot(
        MarketType::Total,
        vec![
            MarketSelection::new("over", SelectionSide::Over)
                .with_line(220.5)
                .with_odds(-110),
            MarketSelection::new("under", SelectionSide::Under)
                .with_line(220.5)
                .with_odds(-110),
        ],
    )
}

// =============================================================================
// MONEYLINE
// =============================================================================

pub fn moneyline_simulation(probability: f64, reference_probability: f64) -> SimulationSummary {
    SimulationSummary {
        probability: Some(probability),
        std_dev: Some(12.0),
        expected_margin: Some(if probability >= 0.5 { 1.2 } else { -1.2 }),
        reference_probability: Some(reference_probability),
        ..simulation(MarketType::Moneyline)
    }
}

pub fn moneyline_snapshot(home_odds: i32, away_odds: i32) -> MarketSnapshot {
    snapshot(
        MarketType::Moneyline,
        vec![
            MarketSelection::new("bos-ml", SelectionSide::Home).with_odds(home_odds),
            MarketSelection::new("nyk-ml", SelectionSide::Away).with_odds(away_odds),
        ],
    )
}

// =============================================================================
// REQUESTS
// =============================================================================

pub fn spread_input() -> MarketInput {
    MarketInput::new(
        MarketType::Spread,
        Some(spread_simulation()),
        Some(spread_snapshot()),
    )
}

pub fn total_input() -> MarketInput {
    MarketInput::new(
        MarketType::Total,
        Some(total_simulation()),
        Some(total_snapshot()),
    )
}

pub fn request(markets: Vec<MarketInput>) -> ContestRequest {
    ContestRequest {
        contest: contest(),
        baseline: baseline(),
        markets,
    }
}

/// Spread and total, both publishable.
pub fn full_request() -> ContestRequest {
    request(vec![total_input(), spread_input()])
}
