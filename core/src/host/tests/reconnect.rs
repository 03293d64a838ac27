//! Disconnection, reselection and data pointers

use super::*;
use crate::chip::{CSR_UNEXP_DISC, WdReg};
use crate::host::HostPhase;
use crate::host::config::DisconnectPolicy;
use crate::host::snapshot::CommandSnapshot;
use crate::scsi::STATUS_GOOD;
use crate::scsi::command::{DataPointer, HostStatus, Membership};
use crate::scsi::message::{DISCONNECT, RESTORE_POINTERS, SAVE_POINTERS, identify};

fn disconnecting() -> Config {
    Config {
        disconnect: DisconnectPolicy::Always,
        ..Default::default()
    }
}

/// Reads half of an 8 byte buffer from target 3, saves pointers and disconnects
fn read_then_disconnect(h: &TestHost, done: &Completions, lun: u8) -> CommandSnapshot {
    h.with_dma(|d| d.refuse = true);
    script(h, select_events());
    script(h, [BusEvent::service(BusPhase::DataIn, &[1, 2, 3, 4])]);
    script(h, BusEvent::message_in(&[SAVE_POINTERS, DISCONNECT]));
    script(h, [BusEvent::new(CSR_DISC)]);

    let id = h.submit(done.attach("read", Command::new(3, lun, &READ6).unwrap().with_read(8)));
    run(h);

    let snap = check(h);
    assert_eq!(snap.phase, HostPhase::Unconnected);
    assert_eq!(snap.connected, None);
    assert_eq!(snap.disconnected, vec![id]);
    assert!(snap.is_busy(3, lun));
    snap.command(id).cloned().unwrap()
}

/// Rest of the data, then the chip finishes the command after the status byte
fn rest_of_read() -> Vec<BusEvent> {
    vec![
        BusEvent::service(BusPhase::DataIn, &[5, 6, 7, 8]),
        BusEvent::service(BusPhase::Status, &[STATUS_GOOD]),
        BusEvent::complete(STATUS_GOOD),
    ]
}

#[test]
fn reselection_restores_pointer() {
    let h = testhost(disconnecting());
    let done = Completions::default();

    let parked = read_then_disconnect(&h, &done, 0);
    assert_eq!(parked.membership, Membership::Disconnected);
    assert!(parked.disconnect_ok);
    assert_eq!(
        parked.pointer,
        DataPointer {
            leg: 0,
            offset: 4,
            this_residual: 4,
            buffers_residual: 0,
        }
    );
    assert_eq!(parked.residual, 4);
    // IDENTIFY allowed the disconnect
    assert_eq!(h.with_bus(|c| c.data_out[0]), identify(true, 0));

    script(&h, [BusEvent::reselect(3, Some(identify(true, 0)))]);
    script(&h, rest_of_read());
    step(&h);
    assert!(h.interrupt().unwrap());

    let snap = check(&h);
    assert_eq!(snap.connected, Some(parked.id));
    assert!(snap.disconnected.is_empty());
    let back = snap.command(parked.id).unwrap();
    assert_eq!(back.membership, Membership::Connected);
    assert_eq!(back.pointer, parked.pointer);
    h.with_bus(|c| {
        // Data in, target 3
        assert_eq!(c.writes_to(WdReg::DestinationId).last(), Some(&0x43));
    });

    run(&h);
    let r = done.take("read");
    assert_eq!(r.host, HostStatus::Ok);
    assert_eq!(r.data, vec![vec![1, 2, 3, 4, 5, 6, 7, 8]]);
    assert_eq!(r.residual, 0);
    let snap = check(&h);
    assert!(!snap.is_busy(3, 0));
    assert!(snap.commands.is_empty());
}

#[test]
fn legacy_reselection_waits_for_identify() {
    let h = testhost_variant(disconnecting(), TestVariant::Base);
    assert_eq!(h.chip(), crate::host::ChipVariant::Wd33c93);
    let done = Completions::default();

    let parked = read_then_disconnect(&h, &done, 0);

    script(
        &h,
        [
            BusEvent::reselect(3, None),
            BusEvent::service(BusPhase::MessageIn, &[identify(true, 0)]).following(),
        ],
    );
    script(&h, rest_of_read());
    step(&h);
    assert!(h.interrupt().unwrap());
    assert_eq!(check(&h).connected, Some(parked.id));

    run(&h);
    let r = done.take("read");
    assert_eq!(r.host, HostStatus::Ok);
    assert_eq!(r.data, vec![vec![1, 2, 3, 4, 5, 6, 7, 8]]);
}

#[test]
fn reselection_finds_the_lun() {
    for variant in [TestVariant::B, TestVariant::Base] {
        let h = testhost_variant(disconnecting(), variant);
        let done = Completions::default();

        let parked = read_then_disconnect(&h, &done, 2);
        assert_eq!(h.with_bus(|c| c.data_out[0]), identify(true, 2));

        let reselect = match variant {
            TestVariant::Base => vec![
                BusEvent::reselect(3, None),
                BusEvent::service(BusPhase::MessageIn, &[identify(true, 2)]).following(),
            ],
            _ => vec![BusEvent::reselect(3, Some(identify(true, 2)))],
        };
        script(&h, reselect);
        script(&h, rest_of_read());
        step(&h);
        assert!(h.interrupt().unwrap());

        let snap = check(&h);
        assert_eq!(snap.connected, Some(parked.id));
        assert_eq!(snap.command(parked.id).unwrap().lun, 2);

        run(&h);
        let r = done.take("read");
        assert_eq!(r.host, HostStatus::Ok);
        assert_eq!(r.data, vec![vec![1, 2, 3, 4, 5, 6, 7, 8]]);
        assert!(!check(&h).is_busy(3, 2));
    }
}

#[test]
fn legacy_reselection_without_identify_takes_lun_0() {
    let h = testhost_variant(
        Config {
            reselect_poll: 8,
            ..disconnecting()
        },
        TestVariant::Base,
    );
    let done = Completions::default();
    let parked = read_then_disconnect(&h, &done, 0);

    // Target never sends IDENTIFY
    script(&h, [BusEvent::reselect(3, None)]);
    script(&h, rest_of_read());
    step(&h);
    assert!(h.interrupt().unwrap());

    let snap = check(&h);
    assert_eq!(snap.connected, Some(parked.id));
    assert_eq!(snap.phase, HostPhase::Connected);
    assert!(snap.disconnected.is_empty());

    // Carries on with the data
    step(&h);
    run(&h);
    let r = done.take("read");
    assert_eq!(r.host, HostStatus::Ok);
    assert_eq!(r.data, vec![vec![1, 2, 3, 4, 5, 6, 7, 8]]);
}

#[test]
fn restore_pointers_rewinds() {
    let h = testhost(level2_none());
    let done = Completions::default();
    h.with_dma(|d| d.refuse = true);

    script(&h, select_events());
    script(&h, [BusEvent::service(BusPhase::DataIn, &[1, 2, 3, 4])]);
    // Target wants to start over
    script(&h, BusEvent::message_in(&[RESTORE_POINTERS]));
    script(&h, [BusEvent::service(BusPhase::DataIn, &[9; 8])]);
    script(&h, finish_events(STATUS_GOOD));

    h.submit(done.attach("read", Command::new(0, 0, &READ6).unwrap().with_read(8)));
    run(&h);

    let r = done.take("read");
    assert_eq!(r.host, HostStatus::Ok);
    assert_eq!(r.data, vec![vec![9; 8]]);
    assert_eq!(r.residual, 0);
}

#[test]
fn reselection_beats_our_selection() {
    let h = testhost(disconnecting());
    let done = Completions::default();

    script(&h, select_events());
    script(&h, BusEvent::message_in(&[DISCONNECT]));
    script(&h, [BusEvent::new(CSR_DISC)]);
    let parked = h.submit(done.attach("tur", Command::new(0, 0, &TEST_UNIT_READY).unwrap()));
    run(&h);
    assert_eq!(check(&h).disconnected, vec![parked]);

    // Target 0 wins arbitration against our selection of target 1
    script(&h, [BusEvent::reselect(0, Some(identify(true, 0)))]);
    let lost = h.submit(done.attach("lost", Command::new(1, 0, &TEST_UNIT_READY).unwrap()));
    assert_eq!(check(&h).selecting, Some(lost));
    assert!(h.interrupt().unwrap());

    let snap = check(&h);
    assert_eq!(snap.selecting, None);
    assert_eq!(snap.connected, Some(parked));
    assert_eq!(snap.input, vec![lost]);
    assert_eq!(snap.command(lost).unwrap().membership, Membership::Queued);
    assert!(!snap.is_busy(1, 0));
    assert_eq!(done.len(), 0);
}

#[test]
fn reselection_during_select_and_transfer() {
    let h = testhost(disconnecting());
    let done = Completions::default();

    // Negotiate with target 0 first
    script(&h, select_events());
    script(
        &h,
        [
            BusEvent::service(BusPhase::Status, &[STATUS_GOOD]),
            BusEvent::complete(STATUS_GOOD),
        ],
    );
    h.submit(done.attach("first", Command::new(0, 0, &TEST_UNIT_READY).unwrap()));
    run(&h);
    assert_eq!(done.take("first").host, HostStatus::Ok);

    // Target 1 disconnects
    script(&h, select_events());
    script(&h, BusEvent::message_in(&[DISCONNECT]));
    script(&h, [BusEvent::new(CSR_DISC)]);
    let parked = h.submit(done.attach("parked", Command::new(1, 0, &TEST_UNIT_READY).unwrap()));
    run(&h);

    // Target 1 comes back before the chip got anywhere with target 0
    script(&h, [BusEvent::reselect(1, Some(identify(true, 0)))]);
    let lost = h.submit(done.attach("lost", Command::new(0, 0, &TEST_UNIT_READY).unwrap()));
    let snap = check(&h);
    assert_eq!(snap.connected, Some(lost));
    assert_eq!(snap.phase, HostPhase::RunningLevel2);

    assert!(h.interrupt().unwrap());
    let snap = check(&h);
    assert_eq!(snap.connected, Some(parked));
    assert_eq!(snap.input, vec![lost]);
    assert!(!snap.is_busy(0, 0));
}

#[test]
fn unexpected_disconnect_completes() {
    let h = testhost(Config::default());
    let done = Completions::default();

    script(&h, [BusEvent::new(CSR_SELECT), BusEvent::new(CSR_UNEXP_DISC)]);
    h.submit(done.attach("tur", Command::new(0, 0, &TEST_UNIT_READY).unwrap()));
    assert!(h.interrupt().unwrap());
    step(&h);
    run(&h);

    let r = done.take("tur");
    assert_eq!(r.host, HostStatus::Ok);
    // Never got a status byte
    assert_eq!(r.status, crate::scsi::ILLEGAL_STATUS_BYTE);
    assert!(check(&h).commands.is_empty());
}

#[test]
fn unexpected_disconnect_after_disconnect_message_parks() {
    let h = testhost(disconnecting());
    let done = Completions::default();

    script(&h, select_events());
    script(&h, BusEvent::message_in(&[DISCONNECT]));
    script(&h, [BusEvent::new(CSR_UNEXP_DISC)]);
    let id = h.submit(done.attach("tur", Command::new(0, 0, &TEST_UNIT_READY).unwrap()));
    run(&h);

    let snap = check(&h);
    assert_eq!(snap.disconnected, vec![id]);
    assert_eq!(done.len(), 0);
}
