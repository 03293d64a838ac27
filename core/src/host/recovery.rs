//! Chip reset and detection, bus reset, command abort

use log::*;

use super::{AbortResult, ChipVariant, HostPhase, HostState, ResetReport, TIMEOUT_PERIOD_VALUE};
use crate::chip::{Control, DmaMode, OwnId, WdBus, WdCmd, WdReg};
use crate::error::ScsiError;
use crate::host::dma::DmaEngine;
use crate::scsi::command::{CommandId, HostStatus, Membership};
use crate::scsi::target::TargetState;

/// Written to the queue tag register to tell a B part from an A
const QUEUE_TAG_PATTERN: u8 = 0xA5;

impl<B: WdBus, D: DmaEngine> HostState<B, D> {
    /// Resets the chip and finds out which revision it is
    pub(super) fn reset_chip(&mut self) -> Result<ChipVariant, ScsiError> {
        let own_id = OwnId(0)
            .with_id(self.config.own_id)
            .with_eaf(true)
            .with_raf(true)
            .with_fs(self.sync_table.clock().fs());
        let polled = Control::with_mode(DmaMode::Polled).0;

        self.bus.write(WdReg::OwnId, own_id.0);
        self.bus.write(WdReg::Control, polled);
        self.bus.write(
            WdReg::SyncTransfer,
            self.sync_table.async_xfer(self.default_period).0,
        );
        self.bus.command(WdCmd::Reset);

        if !(0..self.config.reset_poll).any(|_| self.bus.aux().int()) {
            error!("Chip did not come out of reset");
            return Err(ScsiError::HardwareWedged("chip reset"));
        }
        let sr = self.bus.read(WdReg::ScsiStatus);
        self.microcode = self.bus.read(WdReg::Cdb1);

        self.chip = match sr {
            0x00 => ChipVariant::Wd33c93,
            0x01 => {
                // Only the B part keeps what is written to the queue tag
                self.bus.write(WdReg::QueueTag, QUEUE_TAG_PATTERN);
                if self.bus.read(WdReg::QueueTag) == QUEUE_TAG_PATTERN {
                    self.bus.write(WdReg::QueueTag, 0);
                    ChipVariant::Wd33c93B
                } else {
                    ChipVariant::Wd33c93A
                }
            }
            _ => ChipVariant::Unknown,
        };
        self.fast = self.config.fast && self.chip == ChipVariant::Wd33c93B;

        self.bus.write(WdReg::TimeoutPeriod, TIMEOUT_PERIOD_VALUE);
        self.bus.write(WdReg::Control, polled);
        info!("Chip reset: {:?}, microcode {:02X}", self.chip, self.microcode);
        Ok(self.chip)
    }

    /// Drops every command and brings the bus and chip back to power-on state
    pub(super) fn reset_host(&mut self) -> ResetReport {
        info!("Resetting adapter");
        self.dma.stop(None, false);
        self.dma_running = false;

        let async_xfer = self.sync_table.async_xfer(self.default_period);
        self.targets = [TargetState::new(async_xfer); crate::scsi::MAX_TARGETS];

        let ids: Vec<CommandId> = self.commands.iter().map(|(id, _, _)| id).collect();
        let discarded = ids
            .into_iter()
            .filter_map(|id| self.commands.remove(id))
            .collect();
        self.input.clear();
        self.selecting = None;
        self.connected = None;
        self.disconnected.clear();
        self.phase = HostPhase::Unconnected;
        self.clear_messages();

        ResetReport {
            discarded,
            chip: self.reset_chip(),
        }
    }

    pub(super) fn abort(&mut self, id: CommandId) -> AbortResult {
        match self.commands.tag(id) {
            Some(Membership::Queued) => {
                info!("Abort: removing {} from the input queue", id);
                self.input.retain(|&q| q != id);
                self.finish(id, HostStatus::Aborted);
                AbortResult::Aborted
            }
            Some(Membership::Connected) => {
                self.abort_connected(id);
                AbortResult::Aborted
            }
            Some(Membership::Disconnected) => {
                info!("Abort: {} is disconnected, retry later", id);
                AbortResult::RetryLater
            }
            Some(Membership::Selecting) => {
                info!("Abort: {} is still selecting, not found", id);
                AbortResult::NotFound
            }
            None => {
                warn!("Abort: {} not found, probably completed", id);
                self.dispatch();
                AbortResult::NotFound
            }
        }
    }

    fn abort_connected(&mut self, id: CommandId) {
        info!("Abort: aborting connected {}", id);
        if self.dma_running {
            self.dma.stop(self.commands.get_mut(id), false);
            self.dma_running = false;
        }

        let limit = self.config.abort_poll;
        self.bus
            .write(WdReg::Control, Control::with_mode(DmaMode::Polled).0);
        self.bus.command(WdCmd::Abort);

        // Flush the FIFO
        let mut wedged = true;
        for _ in 0..limit {
            let asr = self.bus.aux();
            if asr.dbr() {
                self.bus.read(WdReg::Data);
            }
            if asr.int() {
                wedged = false;
                break;
            }
        }
        let sr = self.bus.read(WdReg::ScsiStatus);
        debug!(
            "Abort status {:02X}, {} bytes untransferred",
            sr,
            self.bus.read_count()
        );

        // Still connected after the abort
        self.bus.command(WdCmd::Disconnect);
        let mut polls = 0;
        while self.bus.aux().cip() {
            polls += 1;
            if polls >= limit {
                wedged = true;
                break;
            }
        }
        self.bus.read(WdReg::ScsiStatus);

        if wedged {
            error!("{}, leaving the chip for a reset", ScsiError::HardwareWedged("abort"));
        }
        self.connected = None;
        self.phase = HostPhase::Unconnected;
        self.clear_messages();
        self.finish(id, HostStatus::Aborted);
        self.dispatch();
    }
}
