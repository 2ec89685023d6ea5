//! synchronomed - periodic frame acquisition daemon
//!
//! This daemon:
//! 1. Captures frames from the configured source into the frame store
//! 2. Scores each frame against its predecessor
//! 3. Selects one useful frame per selection period
//! 4. Persists selected frames to SQLite until the frame budget is reached

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use synchronome::{open_source, Pipeline, SqliteFrameSink, StopReason, SynchronomeConfig};

#[derive(Parser, Debug)]
#[command(author, version, about = "Periodic frame acquisition and selection daemon")]
struct Args {
    /// Config file (TOML or JSON). Defaults to SYNCHRONOME_CONFIG when unset.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Frame source URL (e.g. stub://camera).
    #[arg(long)]
    source: Option<String>,

    /// SQLite database for selected frames.
    #[arg(long)]
    db: Option<String>,

    /// Stop after this many frames have been persisted.
    #[arg(long)]
    budget: Option<u64>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut cfg = match &args.config {
        Some(path) => SynchronomeConfig::load_from(Some(path.as_path()))?,
        None => SynchronomeConfig::load()?,
    };
    if let Some(source) = args.source {
        cfg.capture.source = source;
    }
    if let Some(db) = args.db {
        cfg.db_path = db;
    }
    if let Some(budget) = args.budget {
        cfg.sequencer.frame_budget = budget;
    }
    cfg.validate()?;

    let source = open_source(cfg.source_config())?;
    let sink = SqliteFrameSink::open(&cfg.db_path)?;
    log::info!(
        "synchronomed: source={} db={} budget={} selection={} ms",
        cfg.capture.source,
        cfg.db_path,
        cfg.sequencer.frame_budget,
        cfg.selection_period().as_millis()
    );

    let pipeline = Pipeline::new(cfg.pipeline_config());
    let abort = pipeline.abort_flag();
    ctrlc::set_handler(move || {
        log::info!("shutdown signal received, stopping pipeline...");
        abort.raise();
    })
    .expect("error setting Ctrl-C handler");

    let report = pipeline.run(source, Box::new(sink))?;
    match report.stop_reason {
        StopReason::BudgetReached => log::info!(
            "synchronomed: frame budget reached, {} frames written to {}",
            report.persisted,
            cfg.db_path
        ),
        StopReason::SelectionsExhausted => log::warn!(
            "synchronomed: selections exhausted, {} of {} frames written ({} lost before write-back)",
            report.persisted,
            cfg.sequencer.frame_budget,
            report.stale
        ),
        StopReason::Aborted => log::warn!(
            "synchronomed: aborted after {} of {} frames",
            report.persisted,
            cfg.sequencer.frame_budget
        ),
    }
    if report.overruns > 0 {
        log::warn!("synchronomed: {} frame store overruns", report.overruns);
    }
    Ok(())
}
