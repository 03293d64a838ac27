use std::fs;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::Result;
use clap::Parser;
use log::*;

use scsi_testrunner::{Scenario, TestResult, run_scenario};
use wdscsi_core::host::config::Config;

#[derive(Parser)]
struct Args {
    /// Scenario JSON file
    scenario: PathBuf,

    /// Replaces the scenario's adapter configuration
    #[arg(long)]
    config: Option<PathBuf>,

    /// Setup string applied on top of the configuration, e.g. "nosync:0,level2:1"
    #[arg(long)]
    setup: Option<String>,

    /// Writes the report here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();
    let args = Args::parse();

    let mut scenario = Scenario::from_file(&args.scenario)?;
    if let Some(path) = args.config.as_deref() {
        scenario.config = Config::from_file(path)?;
    }
    if let Some(setup) = args.setup.as_deref() {
        scenario.config.apply_setup(setup)?;
    }
    debug!("Configuration: {:?}", scenario.config);

    let start_time = Instant::now();
    let report = run_scenario(&scenario);
    info!(
        "{}: {:?} after {} interrupts in {:?}",
        report.name,
        report.result,
        report.interrupts,
        Instant::now() - start_time
    );

    let json = serde_json::to_string_pretty(&report)?;
    match args.output {
        Some(path) => fs::write(path, json)?,
        None => println!("{}", json),
    }

    match report.result {
        TestResult::Pass => Ok(()),
        TestResult::Inconclusive => std::process::exit(2),
        TestResult::Failed(_) => std::process::exit(1),
    }
}
