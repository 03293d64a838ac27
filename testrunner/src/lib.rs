//! Scenario replay against the scripted WD33C93 model
//!
//! A scenario is a JSON document naming the adapter configuration, the chip
//! revision to emulate and a list of steps: commands to submit, what the
//! target does, interrupts to service and expectations on the outcome.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result, anyhow, bail};
use itertools::Itertools;
use log::*;
use serde::{Deserialize, Serialize};

use wdscsi_core::chip::testchip::{BusEvent, TestChip, TestDma, TestVariant};
use wdscsi_core::host::config::Config;
use wdscsi_core::host::snapshot::HostSnapshot;
use wdscsi_core::host::{AbortResult, ChipVariant, Wd33c93};
use wdscsi_core::scsi::command::{Command, CommandId, CommandResult, HostStatus};

/// Interrupts serviced by a single `run` step before giving up
const RUN_LIMIT: usize = 10_000;

type ReplayHost = Wd33c93<TestChip, TestDma>;

#[derive(Serialize, Deserialize, Debug)]
pub enum TestResult {
    Pass,
    /// Nothing failed, but commands were left on the adapter
    Inconclusive,
    Failed(TestFailure),
}

#[derive(Serialize, Deserialize, Debug)]
pub enum TestFailure {
    /// Step could not be carried out or the handler reported a fault
    Step { step: usize, reason: String },
    /// An expectation did not hold
    Expectation { step: usize, reason: String },
    /// Adapter state broke a structural invariant
    Invariant(Vec<String>),
}

/// Data attached to a submitted command
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "snake_case")]
pub enum Payload {
    #[default]
    None,
    Read(usize),
    Write(Vec<u8>),
}

#[derive(Serialize, Deserialize, Debug, Clone, strum::IntoStaticStr)]
#[serde(tag = "op", rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Step {
    Submit {
        label: String,
        target: u8,
        #[serde(default)]
        lun: u8,
        cdb: Vec<u8>,
        #[serde(default)]
        payload: Payload,
    },
    /// Appends to what the target does next
    Script { events: Vec<BusEvent> },
    /// Bytes the DMA engine delivers into read windows
    DmaIncoming { bytes: Vec<u8> },
    /// DMA engine refuses further setups
    RefuseDma,
    /// Target acts without waiting for the host
    Target,
    /// Raises an interrupt directly
    Raise {
        sr: u8,
        #[serde(default)]
        phase: u8,
    },
    /// Services one interrupt
    Interrupt {
        #[serde(default)]
        expect_error: bool,
    },
    /// Services interrupts until the chip goes quiet
    Run,
    Abort {
        label: String,
        #[serde(default)]
        expect: Option<AbortResult>,
    },
    Reset {
        #[serde(default)]
        expect_discarded: Option<usize>,
    },
    /// Checks the outcome of a completed command
    Expect {
        label: String,
        #[serde(default)]
        host: Option<HostStatus>,
        #[serde(default)]
        status: Option<u8>,
        #[serde(default)]
        data: Option<Vec<Vec<u8>>>,
        #[serde(default)]
        residual: Option<usize>,
    },
    /// Checks that nothing is left on the adapter
    ExpectIdle,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct Scenario {
    pub name: String,
    #[serde(default)]
    pub config: Config,
    #[serde(default)]
    pub variant: TestVariant,
    pub steps: Vec<Step>,
}

impl Scenario {
    pub fn from_file(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("Cannot open {}", path.display()))?;
        serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("Cannot parse {}", path.display()))
    }
}

/// A completion as seen by the submitter
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub label: String,
    pub host: HostStatus,
    pub status: u8,
    pub message: u8,
    pub data: Vec<Vec<u8>>,
    pub residual: usize,
}

impl Completion {
    fn new(label: String, r: CommandResult) -> Self {
        Self {
            label,
            host: r.host,
            status: r.status,
            message: r.message,
            data: r.data,
            residual: r.residual,
        }
    }
}

#[derive(Serialize, Deserialize, Debug)]
pub struct TestReportTest {
    pub name: String,
    pub chip: Option<ChipVariant>,
    pub interrupts: usize,
    pub completions: Vec<Completion>,
    pub snapshot: Option<HostSnapshot>,
    pub result: TestResult,
}

#[derive(Serialize, Deserialize, Debug, Default)]
pub struct TestReport {
    pub tests: Vec<TestReportTest>,
}

impl TestReport {
    pub fn passed(&self) -> usize {
        self.tests
            .iter()
            .filter(|t| matches!(t.result, TestResult::Pass))
            .count()
    }
}

struct Replay {
    host: ReplayHost,
    ids: HashMap<String, CommandId>,
    completions: Arc<Mutex<Vec<Completion>>>,
    interrupts: usize,
    violations: Vec<String>,
}

impl Replay {
    fn new(scenario: &Scenario) -> Result<Self> {
        let host = ReplayHost::new(
            TestChip::new(scenario.variant),
            TestDma::default(),
            scenario.config.clone(),
        )?;
        Ok(Self {
            host,
            ids: HashMap::new(),
            completions: Arc::default(),
            interrupts: 0,
            violations: vec![],
        })
    }

    fn completions(&self) -> Vec<Completion> {
        self.completions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn check(&mut self) -> HostSnapshot {
        let snap = self.host.snapshot();
        self.violations.extend(snap.violations());
        snap
    }

    fn id(&self, label: &str) -> Result<CommandId> {
        self.ids
            .get(label)
            .copied()
            .ok_or_else(|| anyhow!("No command labelled '{}'", label))
    }

    fn interrupt(&mut self) -> Result<bool> {
        let serviced = self.host.interrupt()?;
        if serviced {
            self.interrupts += 1;
            self.check();
        }
        Ok(serviced)
    }

    /// Carries out one step. Errors are step failures, `Ok(Some(..))` is a
    /// failed expectation.
    fn step(&mut self, step: &Step) -> Result<Option<String>> {
        match step {
            Step::Submit {
                label,
                target,
                lun,
                cdb,
                payload,
            } => {
                let cmd = Command::new(*target, *lun, cdb)?;
                let cmd = match payload {
                    Payload::None => cmd,
                    Payload::Read(len) => cmd.with_read(*len),
                    Payload::Write(data) => cmd.with_write(data.clone()),
                };
                let results = Arc::clone(&self.completions);
                let tag = label.clone();
                let cmd = cmd.on_complete(move |r| {
                    results
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push(Completion::new(tag, r));
                });
                let id = self.host.submit(cmd);
                debug!("{} submitted as {}", label, id);
                self.ids.insert(label.clone(), id);
                self.check();
            }
            Step::Script { events } => {
                let events = events.clone();
                self.host.with_bus(|c| c.script(events));
            }
            Step::DmaIncoming { bytes } => {
                self.host.with_dma(|d| d.incoming.extend(bytes.iter().copied()));
            }
            Step::RefuseDma => self.host.with_dma(|d| d.refuse = true),
            Step::Target => {
                if !self.host.with_bus(TestChip::step) {
                    bail!("Target script exhausted");
                }
            }
            Step::Raise { sr, phase } => self.host.with_bus(|c| c.raise(*sr, *phase)),
            Step::Interrupt { expect_error } => match (self.interrupt(), *expect_error) {
                (Ok(_), false) => (),
                (Err(e), true) => info!("Expected fault: {}", e),
                (Ok(_), true) => return Ok(Some("Interrupt succeeded".to_string())),
                (Err(e), false) => return Err(e),
            },
            Step::Run => {
                let mut n = 0;
                while self.interrupt()? {
                    n += 1;
                    if n >= RUN_LIMIT {
                        bail!("Interrupt storm, {} serviced", n);
                    }
                }
            }
            Step::Abort { label, expect } => {
                let result = self.host.abort(self.id(label)?);
                self.check();
                if let Some(expect) = expect {
                    if result != *expect {
                        return Ok(Some(format!(
                            "Abort of {}: {:?}, expected {:?}",
                            label, result, expect
                        )));
                    }
                }
            }
            Step::Reset { expect_discarded } => {
                let report = self.host.reset();
                report.chip?;
                self.check();
                if let Some(n) = expect_discarded {
                    if report.discarded.len() != *n {
                        return Ok(Some(format!(
                            "Reset discarded {}, expected {}",
                            report.discarded.len(),
                            n
                        )));
                    }
                }
            }
            Step::Expect {
                label,
                host,
                status,
                data,
                residual,
            } => {
                let completions = self.completions();
                let Some(c) = completions.iter().find(|c| &c.label == label) else {
                    return Ok(Some(format!("{} did not complete", label)));
                };
                let mut wrong = vec![];
                if host.is_some_and(|h| h != c.host) {
                    wrong.push(format!("host {:?}", c.host));
                }
                if status.is_some_and(|s| s != c.status) {
                    wrong.push(format!("status {:02X}", c.status));
                }
                if data.as_ref().is_some_and(|d| *d != c.data) {
                    wrong.push(format!("data {:02X?}", c.data));
                }
                if residual.is_some_and(|r| r != c.residual) {
                    wrong.push(format!("residual {}", c.residual));
                }
                if !wrong.is_empty() {
                    return Ok(Some(format!("{}: {}", label, wrong.join(", "))));
                }
            }
            Step::ExpectIdle => {
                let snap = self.check();
                if !snap.commands.is_empty() {
                    return Ok(Some(format!(
                        "{} commands left on the adapter",
                        snap.commands.len()
                    )));
                }
            }
        }
        Ok(None)
    }
}

/// Replays a scenario and reports what happened
pub fn run_scenario(scenario: &Scenario) -> TestReportTest {
    info!("Running {}", scenario.name);
    let mut report = TestReportTest {
        name: scenario.name.clone(),
        chip: None,
        interrupts: 0,
        completions: vec![],
        snapshot: None,
        result: TestResult::Pass,
    };

    let mut replay = match Replay::new(scenario) {
        Ok(r) => r,
        Err(e) => {
            error!("{}: {:#}", scenario.name, e);
            report.result = TestResult::Failed(TestFailure::Step {
                step: 0,
                reason: format!("{:#}", e),
            });
            return report;
        }
    };

    let mut failure = None;
    for (i, step) in scenario.steps.iter().enumerate() {
        let op: &'static str = step.into();
        trace!("{} step {}: {}", scenario.name, i, op);
        match replay.step(step) {
            Ok(None) => (),
            Ok(Some(reason)) => {
                warn!("{} step {} ({}): {}", scenario.name, i, op, reason);
                failure = Some(TestFailure::Expectation { step: i, reason });
                break;
            }
            Err(e) => {
                warn!("{} step {} ({}): {:#}", scenario.name, i, op, e);
                failure = Some(TestFailure::Step {
                    step: i,
                    reason: format!("{:#}", e),
                });
                break;
            }
        }
    }

    let snapshot = replay.check();
    let violations: Vec<String> = replay.violations.drain(..).unique().collect();
    report.result = match failure {
        Some(f) => TestResult::Failed(f),
        None if !violations.is_empty() => TestResult::Failed(TestFailure::Invariant(violations)),
        None if !snapshot.commands.is_empty() => TestResult::Inconclusive,
        None => TestResult::Pass,
    };
    report.chip = Some(snapshot.chip);
    report.interrupts = replay.interrupts;
    report.completions = replay.completions();
    report.snapshot = Some(snapshot);
    report
}
