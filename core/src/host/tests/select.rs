//! Selection, negotiation and queueing

use super::*;
use crate::chip::{CSR_TIMEOUT, WdCmd, WdReg};
use crate::host::HostPhase;
use crate::host::config::DisconnectPolicy;
use crate::scsi::command::{HostStatus, Membership};
use crate::scsi::message::{EXTENDED_MESSAGE, EXTENDED_SDTR};
use crate::scsi::sync::SyncTable;
use crate::scsi::target::SyncStatus;
use crate::scsi::{STATUS_CHECK_CONDITION, STATUS_GOOD};

/// SDTR message as sent by a target
fn sdtr(period: u8, offset: u8) -> Vec<BusEvent> {
    BusEvent::message_in(&[EXTENDED_MESSAGE, 3, EXTENDED_SDTR, period, offset])
}

fn tur(done: &Completions, label: &'static str, target: u8) -> Command {
    done.attach(label, Command::new(target, 0, &TEST_UNIT_READY).unwrap())
}

#[test]
fn plain_select_negotiates_async() {
    let h = testhost(Config::default());
    let done = Completions::default();
    let table = SyncTable::new(8);

    script(
        &h,
        [
            BusEvent::new(CSR_SELECT),
            BusEvent::service(BusPhase::MessageOut, &[]).following(),
        ],
    );
    // Target agrees to 500 ns asynchronous
    script(&h, sdtr(125, 0));
    script(
        &h,
        [
            BusEvent::service(BusPhase::Command, &[]),
            BusEvent::service(BusPhase::Status, &[STATUS_GOOD]),
            BusEvent::complete(STATUS_GOOD),
        ],
    );

    h.submit(tur(&done, "tur", 0));
    assert_eq!(check(&h).phase, HostPhase::Selecting);
    run(&h);

    let r = done.take("tur");
    assert_eq!(r.host, HostStatus::Ok);
    assert_eq!(r.status, STATUS_GOOD);
    assert_eq!(r.message, COMMAND_COMPLETE);

    let out = h.with_bus(TestChip::take_data_out);
    assert_eq!(out[..6], [0x80, EXTENDED_MESSAGE, 3, EXTENDED_SDTR, 125, 0]);
    assert_eq!(out[6..], TEST_UNIT_READY);

    let snap = check(&h);
    assert_eq!(snap.phase, HostPhase::Unconnected);
    assert!(snap.commands.is_empty());
    assert_eq!(snap.targets[0].sync_stat, SyncStatus::Set);
    assert_eq!(snap.targets[0].sync_xfer, table.sync_xfer(125, 0, false));
    h.with_bus(|c| {
        assert!(c.issued(WdCmd::SelAtn));
        // Resumed after the status byte
        assert_eq!(c.last_command(), Some(WdCmd::SelAtnXfer as u8));
        assert!(c.writes_to(WdReg::CommandPhase).contains(&0x50));
    });
}

#[test]
fn sync_offer_accepted_then_select_and_transfer() {
    let h = testhost(Config {
        no_sync: 0,
        ..Default::default()
    });
    let done = Completions::default();

    script(
        &h,
        [
            BusEvent::new(CSR_SELECT),
            BusEvent::service(BusPhase::MessageOut, &[]).following(),
        ],
    );
    script(&h, sdtr(62, 12));
    script(
        &h,
        [
            BusEvent::service(BusPhase::Command, &[]),
            BusEvent::service(BusPhase::Status, &[STATUS_GOOD]),
            BusEvent::complete(STATUS_GOOD),
        ],
    );
    h.submit(tur(&done, "tur", 0));
    run(&h);
    assert_eq!(done.take("tur").host, HostStatus::Ok);

    // Fastest rung, 250 ns, with the largest offset
    let out = h.with_bus(TestChip::take_data_out);
    assert_eq!(out[..6], [0x80, EXTENDED_MESSAGE, 3, EXTENDED_SDTR, 62, 12]);
    let snap = check(&h);
    assert_eq!(snap.targets[0].sync_xfer.0, 0x2C);
    assert_eq!(snap.targets[0].sync_stat, SyncStatus::Set);

    // Negotiated, so the chip runs the next command on its own
    h.with_dma(|d| d.incoming.extend([1, 2, 3, 4]));
    script(&h, [BusEvent::complete(STATUS_GOOD)]);
    h.submit(done.attach("read", Command::new(0, 0, &READ6).unwrap().with_read(4)));
    run(&h);

    let r = done.take("read");
    assert_eq!(r.host, HostStatus::Ok);
    assert_eq!(r.data, vec![vec![1, 2, 3, 4]]);
    assert_eq!(r.residual, 0);
    h.with_bus(|c| {
        assert_eq!(c.reg(WdReg::Cdb1), READ6[0]);
        assert_eq!(c.reg(WdReg::OwnId), 6);
        assert_eq!(c.writes_to(WdReg::SyncTransfer).last(), Some(&0x2C));
        assert_eq!(c.last_command(), Some(WdCmd::SelAtnXfer as u8));
    });
    h.with_dma(|d| {
        assert_eq!(d.setups, vec![(0, crate::scsi::command::Direction::Read, 4)]);
        assert_eq!(d.stops, vec![true]);
    });
    assert!(check(&h).commands.is_empty());
}

#[test]
fn rejected_sdtr_stays_async() {
    let h = testhost(Config {
        no_sync: 0,
        ..Default::default()
    });
    let done = Completions::default();
    let table = SyncTable::new(8);

    script(&h, select_events());
    script(
        &h,
        [
            BusEvent::service(BusPhase::Status, &[STATUS_GOOD]),
            BusEvent::complete(STATUS_GOOD),
        ],
    );
    h.submit(tur(&done, "tur", 2));
    run(&h);

    assert_eq!(done.take("tur").host, HostStatus::Ok);
    let snap = check(&h);
    assert_eq!(snap.targets[2].sync_stat, SyncStatus::Set);
    assert_eq!(snap.targets[2].sync_xfer, table.async_xfer(500));
}

#[test]
fn unsolicited_sdtr_gets_async_reply() {
    let h = testhost(level2_none());
    let done = Completions::default();

    script(&h, select_events());
    script(&h, finish_events(STATUS_GOOD));
    h.submit(tur(&done, "first", 1));
    run(&h);
    assert_eq!(done.take("first").host, HostStatus::Ok);
    let before = check(&h).targets[1];
    assert_eq!(before.sync_stat, SyncStatus::Set);
    h.with_bus(|c| {
        c.take_data_out();
        c.clear_commands();
    });

    // Already negotiated: IDENTIFY only, then the target asks for sync anyway
    script(
        &h,
        [
            BusEvent::new(CSR_SELECT),
            BusEvent::service(BusPhase::MessageOut, &[]).following(),
        ],
    );
    script(&h, sdtr(62, 12));
    script(
        &h,
        [
            BusEvent::service(BusPhase::MessageOut, &[]),
            BusEvent::service(BusPhase::Command, &[]),
        ],
    );
    script(&h, finish_events(STATUS_GOOD));
    h.submit(tur(&done, "second", 1));
    run(&h);

    assert_eq!(done.take("second").host, HostStatus::Ok);
    assert_eq!(check(&h).targets[1], before);
    let out = h.with_bus(|c| {
        assert!(c.issued(WdCmd::AssertAtn));
        c.take_data_out()
    });
    assert_eq!(out[0], 0x80);
    assert_eq!(out[1..6], [EXTENDED_MESSAGE, 3, EXTENDED_SDTR, 125, 0]);
    assert_eq!(out[6..], TEST_UNIT_READY);
}

#[test]
fn wide_and_unknown_messages_answered() {
    let h = testhost(level2_none());
    let done = Completions::default();

    script(&h, select_events());
    // WDTR for 16 bit, then something nobody knows
    script(&h, BusEvent::message_in(&[EXTENDED_MESSAGE, 2, 0x03, 1]));
    script(&h, [BusEvent::service(BusPhase::MessageOut, &[])]);
    script(&h, BusEvent::message_in(&[0x55]));
    script(&h, [BusEvent::service(BusPhase::MessageOut, &[])]);
    script(&h, finish_events(STATUS_GOOD));
    h.submit(tur(&done, "tur", 0));
    run(&h);

    assert_eq!(done.take("tur").host, HostStatus::Ok);
    let out = h.with_bus(TestChip::take_data_out);
    // IDENTIFY, SDTR, CDB, narrow WDTR, reject
    assert_eq!(out.len(), 6 + 6 + 4 + 1);
    assert_eq!(out[12..16], [EXTENDED_MESSAGE, 2, 0x03, 0]);
    assert_eq!(out[16], MESSAGE_REJECT);
}

#[test]
fn request_sense_jumps_the_queue() {
    let h = testhost(Config::default());
    let done = Completions::default();

    // Target 3 holds the bus
    script(&h, [BusEvent::new(CSR_SELECT)]);
    let busy = h.submit(tur(&done, "busy", 3));
    run(&h);

    let read = h.submit(done.attach("read", Command::new(1, 0, &READ6).unwrap().with_read(8)));
    let sense = h.submit(done.attach(
        "sense",
        Command::new(2, 0, &REQUEST_SENSE).unwrap().with_read(18),
    ));

    let snap = check(&h);
    assert_eq!(snap.connected, Some(busy));
    assert_eq!(snap.input, vec![sense, read]);
    assert_eq!(snap.command(read).map(|c| c.membership), Some(Membership::Queued));
    assert_eq!(done.len(), 0);
}

#[test]
fn sense_with_bad_status_is_an_error() {
    let h = testhost(level2_none());
    let done = Completions::default();

    script(&h, select_events());
    script(&h, finish_events(STATUS_CHECK_CONDITION));
    h.submit(done.attach("sense", Command::new(4, 0, &REQUEST_SENSE).unwrap()));
    run(&h);
    let r = done.take("sense");
    assert_eq!(r.host, HostStatus::Error);
    assert_eq!(r.status, STATUS_CHECK_CONDITION);

    // Any other command just reports the status
    script(
        &h,
        [
            BusEvent::new(CSR_SELECT),
            BusEvent::service(BusPhase::MessageOut, &[]).following(),
            BusEvent::service(BusPhase::Command, &[]),
        ],
    );
    script(&h, finish_events(STATUS_CHECK_CONDITION));
    h.submit(tur(&done, "tur", 4));
    run(&h);
    let r = done.take("tur");
    assert_eq!(r.host, HostStatus::Ok);
    assert_eq!(r.status, STATUS_CHECK_CONDITION);
}

#[test]
fn selection_timeout_moves_on() {
    let h = testhost(Config::default());
    let done = Completions::default();

    script(&h, [BusEvent::new(CSR_TIMEOUT), BusEvent::new(CSR_SELECT)]);
    h.submit(tur(&done, "absent", 5));
    let next = h.submit(tur(&done, "present", 1));
    assert!(check(&h).is_busy(5, 0));

    assert!(h.interrupt().unwrap());
    let r = done.take("absent");
    assert_eq!(r.host, HostStatus::NoConnect);

    let snap = check(&h);
    assert!(!snap.is_busy(5, 0));
    assert!(snap.is_busy(1, 0));
    assert_eq!(snap.selecting, Some(next));
    assert_eq!(snap.phase, HostPhase::Selecting);
}

#[test]
fn adaptive_disconnect_marks_waiting_commands() {
    let h = testhost(Config::default());
    let done = Completions::default();

    // Target 2 holds the bus while A, B, A queue up
    script(&h, [BusEvent::new(CSR_SELECT)]);
    h.submit(tur(&done, "x", 2));
    run(&h);
    assert!(!check(&h).commands[0].disconnect_ok);

    let a1 = h.submit(tur(&done, "a1", 0));
    let b = h.submit(tur(&done, "b", 1));
    let a2 = h.submit(tur(&done, "a2", 0));

    // Target 2 finishes
    script(&h, BusEvent::message_in(&[COMMAND_COMPLETE]));
    script(&h, [BusEvent::new(CSR_DISC)]);
    step(&h);
    run(&h);
    assert_eq!(done.take("x").host, HostStatus::Ok);

    let snap = check(&h);
    assert_eq!(snap.selecting, Some(a1));
    for id in [a1, b, a2] {
        assert!(snap.command(id).unwrap().disconnect_ok, "{}", id);
    }
    // Reselection enabled for the first A
    h.with_bus(|c| assert_eq!(c.writes_to(WdReg::SourceId).last(), Some(&0x80)));
}

#[test]
fn single_lun_queue_stays_connected() {
    let h = testhost(Config::default());
    let done = Completions::default();

    script(&h, [BusEvent::new(CSR_SELECT)]);
    h.submit(tur(&done, "x", 2));
    run(&h);
    let a1 = h.submit(tur(&done, "a1", 0));
    let a2 = h.submit(tur(&done, "a2", 0));

    script(&h, BusEvent::message_in(&[COMMAND_COMPLETE]));
    script(&h, [BusEvent::new(CSR_DISC)]);
    step(&h);
    run(&h);

    let snap = check(&h);
    assert_eq!(snap.selecting, Some(a1));
    assert!(!snap.command(a1).unwrap().disconnect_ok);
    assert!(!snap.command(a2).unwrap().disconnect_ok);
    assert_eq!(snap.input, vec![a2]);
}

#[test]
fn disconnect_policy_overrides() {
    for (policy, expected) in [
        (DisconnectPolicy::Never, false),
        (DisconnectPolicy::Always, true),
    ] {
        let h = testhost(Config {
            disconnect: policy,
            ..Default::default()
        });
        let done = Completions::default();
        let id = h.submit(tur(&done, "tur", 0));
        assert_eq!(check(&h).command(id).unwrap().disconnect_ok, expected);
    }

    // Tape drives always may
    let h = testhost(Config::default());
    let done = Completions::default();
    let id = h.submit(done.attach(
        "tape",
        Command::new(6, 0, &TEST_UNIT_READY)
            .unwrap()
            .with_device(crate::scsi::command::DeviceClass::Tape),
    ));
    assert!(check(&h).command(id).unwrap().disconnect_ok);
}
