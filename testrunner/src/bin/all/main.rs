use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;
use log::*;

use scsi_testrunner::{
    Scenario, TestFailure, TestReport, TestReportTest, TestResult, run_scenario,
};

#[derive(Parser)]
struct Args {
    scenario_dir: PathBuf,
    output_dir: PathBuf,

    #[arg(short('j'), default_value_t = num_cpus::get())]
    parallel: usize,
}

fn main() -> Result<()> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .init();
    let args = Args::parse();

    // Collect scenarios
    let mut files = fs::read_dir(&args.scenario_dir)?
        .map(|res| res.map(|e| e.path()))
        .collect::<Result<Vec<_>, std::io::Error>>()?;
    files.retain(|f| f.extension().is_some_and(|e| e == "json"));
    files.sort();

    let report = Arc::new(Mutex::new(TestReport::default()));
    let parallel = args.parallel.max(1);

    info!(
        "Collected {} scenarios, running {} in parallel",
        files.len(),
        parallel
    );
    let pool = rusty_pool::ThreadPool::new(parallel, parallel, Duration::from_secs(60));
    let start_time = Instant::now();

    for file in files {
        let t_report = Arc::clone(&report);

        pool.execute(move || {
            let result = match Scenario::from_file(&file) {
                Ok(scenario) => run_scenario(&scenario),
                Err(e) => {
                    error!("{:#}", e);
                    TestReportTest {
                        name: file.display().to_string(),
                        chip: None,
                        interrupts: 0,
                        completions: vec![],
                        snapshot: None,
                        result: TestResult::Failed(TestFailure::Step {
                            step: 0,
                            reason: format!("{:#}", e),
                        }),
                    }
                }
            };
            info!("{}: {:?}", result.name, result.result);
            t_report
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .tests
                .push(result);
        });
    }
    pool.shutdown_join();

    let mut report = report.lock().unwrap_or_else(PoisonError::into_inner);
    report.tests.sort_by(|a, b| a.name.cmp(&b.name));
    fs::create_dir_all(&args.output_dir)?;
    fs::write(
        args.output_dir.join("report.json"),
        serde_json::to_string(&*report)?,
    )?;
    info!(
        "{} of {} scenarios passed in {:?}",
        report.passed(),
        report.tests.len(),
        Instant::now() - start_time
    );

    Ok(())
}
