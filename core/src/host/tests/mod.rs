//! Host adapter scenarios, run against the scripted chip model

mod reconnect;
mod select;

use std::sync::{Arc, Mutex};

use super::Wd33c93;
use super::config::Config;
use super::snapshot::HostSnapshot;
use crate::chip::testchip::{BusEvent, TestChip, TestDma, TestVariant};
use crate::chip::{BusPhase, CSR_DISC, CSR_SELECT};
use crate::scsi::command::{Command, CommandResult};
use crate::scsi::message::{COMMAND_COMPLETE, MESSAGE_REJECT};

type TestHost = Wd33c93<TestChip, TestDma>;

const TEST_UNIT_READY: [u8; 6] = [0x00, 0, 0, 0, 0, 0];
const READ6: [u8; 6] = [0x08, 0, 0, 0, 1, 0];
const WRITE6: [u8; 6] = [0x0A, 0, 0, 0, 1, 0];
const REQUEST_SENSE: [u8; 6] = [0x03, 0, 0, 0, 18, 0];

fn testhost(config: Config) -> TestHost {
    testhost_variant(config, TestVariant::B)
}

fn testhost_variant(config: Config, variant: TestVariant) -> TestHost {
    TestHost::new(TestChip::new(variant), TestDma::default(), config).expect("chip reset")
}

/// Only the interrupt handler moves the bus along
fn level2_none() -> Config {
    Config {
        level2: super::config::Level2::None,
        ..Default::default()
    }
}

/// Completion results in the order they fired, by label
#[derive(Clone, Default)]
struct Completions(Arc<Mutex<Vec<(&'static str, CommandResult)>>>);

impl Completions {
    fn attach(&self, label: &'static str, cmd: Command) -> Command {
        let results = Arc::clone(&self.0);
        cmd.on_complete(move |r| results.lock().unwrap().push((label, r)))
    }

    fn labels(&self) -> Vec<&'static str> {
        self.0.lock().unwrap().iter().map(|(l, _)| *l).collect()
    }

    fn take(&self, label: &'static str) -> CommandResult {
        let mut results = self.0.lock().unwrap();
        let pos = results
            .iter()
            .position(|(l, _)| *l == label)
            .unwrap_or_else(|| panic!("{} did not complete", label));
        results.remove(pos).1
    }

    fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }
}

fn script(h: &TestHost, events: impl IntoIterator<Item = BusEvent>) {
    let events: Vec<BusEvent> = events.into_iter().collect();
    h.with_bus(|c| c.script(events));
}

/// Target acts on its own
fn step(h: &TestHost) {
    assert!(h.with_bus(TestChip::step), "script exhausted");
}

/// Checks the structural invariants
fn check(h: &TestHost) -> HostSnapshot {
    let snap = h.snapshot();
    let violations = snap.violations();
    assert!(violations.is_empty(), "{:#?}\n{:#?}", violations, snap);
    snap
}

/// Services interrupts until the chip goes quiet, checking the invariants
/// after each one. Returns the number serviced.
fn run(h: &TestHost) -> usize {
    let mut n = 0;
    while h.interrupt().expect("interrupt") {
        check(h);
        n += 1;
        assert!(n < 1000, "interrupt storm");
    }
    n
}

/// Plain selection up to the COMMAND phase: IDENTIFY and SDTR go out, the
/// target rejects SDTR
fn select_events() -> Vec<BusEvent> {
    let mut ev = vec![
        BusEvent::new(CSR_SELECT),
        BusEvent::service(BusPhase::MessageOut, &[]).following(),
    ];
    ev.extend(BusEvent::message_in(&[MESSAGE_REJECT]));
    ev.push(BusEvent::service(BusPhase::Command, &[]));
    ev
}

/// STATUS, COMMAND COMPLETE and bus free, every step through the
/// interrupt handler
fn finish_events(status: u8) -> Vec<BusEvent> {
    let mut ev = vec![BusEvent::service(BusPhase::Status, &[status]).with_count(0)];
    ev.extend(BusEvent::message_in(&[COMMAND_COMPLETE]));
    ev.push(BusEvent::new(CSR_DISC));
    ev
}
