//! Decision Engine CLI
//!
//! Runs the market decision pipeline for one contest and inspects the
//! append-only audit log it writes to.
//!
//! Environment:
//!   DECISION_AUDIT_DB     - Path of the SQLite audit log (default: decision_audit.db)
//!   DECISION_PROFILE_PATH - Threshold profile TOML (default: built-in profile)
//!
//! Usage:
//!   decision_engine decide --request ./contest.json
//!   decision_engine trace <TRACE_ID>
//!   decision_engine replay <TRACE_ID>
//!   decision_engine verify <CONTEST_ID> <FINGERPRINT>
//!   decision_engine profile --save ./decision_profile.toml

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use edge_decision_engine::config::ThresholdProfile;
use edge_decision_engine::decision::audit::history_by_market;
use edge_decision_engine::decision::{
    AuditLog, AuditRecord, AuditStore, DecisionService, InputsFingerprint,
};
use edge_decision_engine::models::ContestRequest;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

const DEFAULT_LOG_FILTER: &str = "decision_engine=info,edge_decision_engine=info";

#[derive(Parser, Debug)]
#[command(name = "decision_engine")]
#[command(about = "Gate, calibrate and classify contest markets with a full audit trail")]
struct Args {
    /// Path to the SQLite audit log
    #[arg(long, env = "DECISION_AUDIT_DB", default_value = "decision_audit.db")]
    db: PathBuf,

    /// Threshold profile TOML
    #[arg(long, env = "DECISION_PROFILE_PATH")]
    profile: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Decide every market of one contest request and print the bundle
    Decide {
        /// ContestRequest JSON file
        #[arg(long)]
        request: PathBuf,
    },

    /// Print every record written under one trace id
    Trace { trace_id: Uuid },

    /// Print the decisions recorded for one contest and inputs fingerprint
    History {
        contest_id: String,
        fingerprint: String,
    },

    /// Summarise a contest's decisions per market type
    Contest { contest_id: String },

    /// Check that identical inputs always produced identical decisions
    Verify {
        contest_id: String,
        fingerprint: String,
    },

    /// Recompute a stored bundle and compare it with what was recorded
    Replay { trace_id: Uuid },

    /// Print the active threshold profile, or save it as TOML
    Profile {
        #[arg(long)]
        save: Option<PathBuf>,
    },

    /// Audit log statistics
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    let args = Args::parse();
    let profile = load_profile(args.profile.as_deref())?;

    match args.command {
        Commands::Decide { request } => decide(&args.db, profile, &request).await?,
        Commands::Trace { trace_id } => {
            let records = open_reader(&args.db)?.find_by_trace(trace_id)?;
            if records.is_empty() {
                bail!("no audit records for trace {}", trace_id);
            }
            print_json(&records)?;
        }
        Commands::History {
            contest_id,
            fingerprint,
        } => {
            let fp = InputsFingerprint::from_hex(fingerprint);
            let records = open_reader(&args.db)?.find_history(&contest_id, &fp)?;
            print_json(&records)?;
        }
        Commands::Contest { contest_id } => {
            let records = open_reader(&args.db)?.find_by_contest(&contest_id)?;
            print_contest_summary(&contest_id, &records);
        }
        Commands::Verify {
            contest_id,
            fingerprint,
        } => {
            let fp = InputsFingerprint::from_hex(fingerprint);
            let report = open_reader(&args.db)?.verify_determinism(&contest_id, &fp)?;
            print_json(&report)?;
            if !report.is_deterministic() {
                bail!(
                    "{} of {} records diverged for fingerprint {}",
                    report.divergent.len(),
                    report.records_compared,
                    fp.short()
                );
            }
        }
        Commands::Replay { trace_id } => {
            let audit = Arc::new(open_reader(&args.db)?);
            let service = DecisionService::new(Arc::new(profile), audit)?;
            let report = service.replay(trace_id)?;
            print_json(&report)?;
            if !report.is_identical() {
                bail!("replay of {} diverged on {:?}", trace_id, report.mismatched);
            }
        }
        Commands::Profile { save } => match save {
            Some(path) => {
                profile
                    .save(&path)
                    .with_context(|| format!("Failed to write profile to {}", path.display()))?;
                info!(path = %path.display(), profile = %profile.profile_key(), "saved threshold profile");
            }
            None => print!("{}", toml::to_string_pretty(&profile)?),
        },
        Commands::Stats => {
            let stats = open_reader(&args.db)?.stats()?;
            println!("Audit log: {}", args.db.display());
            println!("  records        : {}", stats.total_records);
            println!("  bundles        : {}", stats.bundles);
            println!("  contests       : {}", stats.contests);
            println!("  approved       : {}", stats.approved);
            println!("  pending review : {}", stats.pending_review);
            println!("  blocked        : {}", stats.blocked);
            match stats.latest_version {
                Some(v) => println!("  latest version : {}", v),
                None => println!("  latest version : -"),
            }
        }
    }

    Ok(())
}

fn load_profile(path: Option<&Path>) -> Result<ThresholdProfile> {
    let profile = match path {
        Some(path) => ThresholdProfile::load(path)?,
        None => ThresholdProfile::from_env()?,
    };
    info!(profile = %profile.profile_key(), "threshold profile loaded");
    Ok(profile)
}

fn open_reader(db: &Path) -> Result<AuditStore> {
    AuditStore::open_read_only(db)
        .with_context(|| format!("Failed to open audit log {}", db.display()))
}

async fn decide(db: &Path, profile: ThresholdProfile, request_path: &Path) -> Result<()> {
    let text = std::fs::read_to_string(request_path)
        .with_context(|| format!("Failed to read request {}", request_path.display()))?;
    let request: ContestRequest = serde_json::from_str(&text)
        .with_context(|| format!("Failed to parse request {}", request_path.display()))?;

    let audit = Arc::new(
        AuditStore::new(db).with_context(|| format!("Failed to open audit log {}", db.display()))?,
    );
    let service = DecisionService::new(Arc::new(profile), audit)?;

    let bundle = service
        .decide(&request)
        .await
        .with_context(|| format!("Decision run failed for {}", request.contest.contest_id))?;

    let approved = bundle.approved().count();
    if approved == 0 {
        warn!(contest_id = %bundle.contest_id, "no market approved for publication");
    }
    print_json(&bundle)
}

fn print_contest_summary(contest_id: &str, records: &[AuditRecord]) {
    if records.is_empty() {
        println!("No decisions recorded for {}", contest_id);
        return;
    }

    println!("Contest {}", contest_id);
    for (market_type, history) in history_by_market(records) {
        println!();
        println!("  {} ({} decisions)", market_type.as_str(), history.len());
        for record in history {
            let d = &record.decision;
            let class = d
                .classification
                .map(|c| c.as_str())
                .unwrap_or("-");
            let pick = d.preferred_selection.as_deref().unwrap_or("-");
            let edge = d
                .edge_points
                .map(|e| format!("{:+.2}", e))
                .unwrap_or_else(|| "-".to_string());
            println!(
                "    {:<12} {:<28} {:<7} {:<14} edge {:>7}  fp {}",
                d.debug.decision_version.to_string(),
                d.release_status.as_str(),
                class,
                pick,
                edge,
                d.debug.inputs_fingerprint.short()
            );
        }
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
