//! Interrupt handling: the bus phase state machine

use log::*;

use super::config::Level2;
use super::transfer::{pio_out, read_1_byte};
use super::{HostPhase, HostState};
use crate::chip::{
    AuxStatus, BusPhase, CSR_ABORT, CSR_MSGIN, CSR_SRV_REQ, CSR_UNEXP, Csr, DestinationId,
    PhaseCause, SourceId, WdBus, WdCmd, WdReg,
};
use crate::error::ScsiError;
use crate::host::dma::DmaEngine;
use crate::scsi::command::{CommandId, Direction, HostStatus, Membership};
use crate::scsi::message::{COMMAND_COMPLETE, EXTENDED_MESSAGE, Inbound};
use crate::scsi::sync::OPTIMUM_SX_OFF;
use crate::scsi::target::SyncStatus;
use crate::scsi::ILLEGAL_STATUS_BYTE;

/// Command phase value of a finished select-and-transfer
const PHASE_COMPLETE: u8 = 0x60;
/// Command phase to resume select-and-transfer at the status byte
const RESUME_STATUS: u8 = 0x50;
/// Command phase to resume select-and-transfer at a data phase
const RESUME_DATA: u8 = 0x45;
/// Command phase to resume select-and-transfer after SAVE DATA POINTERS
const RESUME_SDP: u8 = 0x41;

/// Raw register values of the interrupt being serviced
#[derive(Debug, Clone, Copy)]
struct Irq {
    asr: u8,
    sr: u8,
    phs: u8,
}

impl Irq {
    fn unknown(self) -> ScsiError {
        ScsiError::UnknownInterrupt {
            asr: self.asr,
            sr: self.sr,
            phase: self.phs,
        }
    }
}

impl<B: WdBus, D: DmaEngine> HostState<B, D> {
    pub(super) fn handle_interrupt(&mut self) -> Result<bool, ScsiError> {
        let asr = self.bus.aux();
        if !asr.int() || asr.bsy() {
            return Ok(false);
        }

        // Reading the status clears the interrupt
        let sr = self.bus.read(WdReg::ScsiStatus);
        let phs = self.bus.read(WdReg::CommandPhase);
        let irq = Irq { asr: asr.0, sr, phs };
        trace!(
            "IRQ asr {:02X} sr {:02X} phase {:02X} in {:?}",
            asr.0,
            sr,
            phs,
            self.phase
        );

        // The interrupt after starting DMA always means the transfer ended
        if self.dma_running {
            self.finish_dma();
        }

        match Csr::decode(sr) {
            Csr::Timeout => self.on_timeout(),
            Csr::Select => self.on_select(irq)?,
            Csr::Phase(PhaseCause::Aborted, _) => {
                warn!("Unexpected abort status {:02X}", sr);
                return Err(irq.unknown());
            }
            Csr::Phase(_, BusPhase::DataIn) => self.on_data(irq, Direction::Read)?,
            Csr::Phase(_, BusPhase::DataOut) => self.on_data(irq, Direction::Write)?,
            Csr::Phase(_, BusPhase::Command) => self.on_command(irq)?,
            Csr::Phase(_, BusPhase::Status) => self.on_status(irq)?,
            Csr::Phase(_, BusPhase::MessageIn) => self.on_message_in(irq)?,
            Csr::Phase(_, BusPhase::MessageOut) => self.on_message_out(),
            Csr::SelXferDone => self.on_sel_xfer_done(irq)?,
            Csr::SaveDataPointers => self.on_save_data_pointers(),
            Csr::UnexpectedDisconnect => self.on_unexpected_disconnect(),
            Csr::Disconnect => self.on_disconnect(),
            Csr::Reselect(latched) => self.on_reselect(irq, latched)?,
            Csr::Reset(_) | Csr::MessageInPaused | Csr::Unknown(_) => {
                warn!("Unknown interrupt {:02X?}", irq);
                return Err(irq.unknown());
            }
        }
        Ok(true)
    }

    fn need_connected(&self, irq: Irq) -> Result<CommandId, ScsiError> {
        self.connected.ok_or_else(|| {
            warn!("Status {:02X} with nothing connected", irq.sr);
            ScsiError::NotConnected { sr: irq.sr }
        })
    }

    fn target_of(&self, id: CommandId) -> usize {
        self.commands
            .get(id)
            .map_or(0, |c| c.target() as usize)
    }

    /// Moves the connected command to the disconnected set
    fn park(&mut self, id: CommandId) {
        let Some(cmd) = self.commands.get_mut(id) else {
            return;
        };
        // A target may disconnect whether we offered it or not
        cmd.disconnect_ok = true;
        let key = (cmd.target(), cmd.lun());
        debug!("{} disconnected at {:?}", id, cmd.pointer());
        self.commands.set_tag(id, Membership::Disconnected);
        self.disconnected.insert(key, id);
    }

    fn completion_status(&self, id: CommandId) -> HostStatus {
        self.commands
            .get(id)
            .map_or(HostStatus::Error, |c| c.completion_status())
    }

    fn resume_level2(&mut self, command_phase: u8) {
        self.phase = HostPhase::RunningLevel2;
        self.bus.write(WdReg::CommandPhase, command_phase);
        self.bus.command(WdCmd::SelAtnXfer);
    }

    fn enable_reselection(&mut self) {
        self.bus
            .write(WdReg::SourceId, SourceId(0).with_er(true).0);
    }

    fn on_timeout(&mut self) {
        let id = if self.phase == HostPhase::RunningLevel2 {
            self.connected.take()
        } else {
            self.selecting.take()
        };
        self.phase = HostPhase::Unconnected;
        self.clear_messages();
        match id {
            Some(id) => {
                debug!("{} selection timed out", id);
                self.finish(id, HostStatus::NoConnect);
            }
            None => warn!("Selection timeout without a selection"),
        }
        self.dispatch();
    }

    /// Plain selection succeeded, IDENTIFY (and SDTR) go out next
    fn on_select(&mut self, irq: Irq) -> Result<(), ScsiError> {
        let Some(id) = self.selecting.take() else {
            warn!("SELECT without a selection");
            return Err(irq.unknown());
        };
        self.connected = Some(id);
        self.commands.set_tag(id, Membership::Connected);

        let Some(cmd) = self.commands.get(id) else {
            return Err(irq.unknown());
        };
        let t = cmd.target() as usize;
        self.msg_out.identify(cmd.disconnect_ok(), cmd.lun());

        if self.targets[t].sync_stat == SyncStatus::First {
            self.targets[t].advance(SyncStatus::Waiting);
            let (period, offset) = if self.config.no_sync & (1 << t) != 0 {
                self.sync_table.sdtr(self.default_period, 0, false)
            } else {
                self.sync_table
                    .sdtr(self.sync_table.optimum_period(), OPTIMUM_SX_OFF, self.fast)
            };
            debug!("Offering SDTR {} x4 ns offset {} to {}", period, offset, t);
            self.msg_out.push_sdtr(period, offset);
        }
        self.phase = HostPhase::Connected;
        Ok(())
    }

    fn on_data(&mut self, irq: Irq, dir: Direction) -> Result<(), ScsiError> {
        let id = self.need_connected(irq)?;
        self.transfer_bytes(id, dir);
        if self.phase != HostPhase::RunningLevel2 {
            self.phase = HostPhase::Connected;
        }
        Ok(())
    }

    fn on_command(&mut self, irq: Irq) -> Result<(), ScsiError> {
        let id = self.need_connected(irq)?;
        let poll = self.config.pio_poll;
        if let Some(cmd) = self.commands.get(id) {
            pio_out(&mut self.bus, cmd.cdb(), poll);
        }
        self.phase = HostPhase::Connected;
        Ok(())
    }

    fn on_status(&mut self, irq: Irq) -> Result<(), ScsiError> {
        let id = self.need_connected(irq)?;
        let status = read_1_byte(&mut self.bus, self.config.pio_poll);
        if let Some(cmd) = self.commands.get_mut(id) {
            cmd.status = status;
        }
        if self.config.level2 >= Level2::Basic {
            // Clear the interrupt and let the chip take the message
            self.bus.read(WdReg::ScsiStatus);
            self.resume_level2(RESUME_STATUS);
        } else {
            self.phase = HostPhase::Connected;
        }
        Ok(())
    }

    fn on_message_in(&mut self, irq: Irq) -> Result<(), ScsiError> {
        let id = self.need_connected(irq)?;
        let byte = read_1_byte(&mut self.bus, self.config.pio_poll);
        // Paused with ACK asserted
        self.bus.read(WdReg::ScsiStatus);

        let first = if self.msg_in.in_progress() {
            EXTENDED_MESSAGE
        } else {
            byte
        };
        let msg = self.msg_in.feed(byte);
        let t = self.target_of(id);
        let level2 = self.config.level2;
        let Some(cmd) = self.commands.get_mut(id) else {
            return Err(irq.unknown());
        };
        cmd.message = first;

        self.phase = HostPhase::Connected;
        match msg {
            Inbound::Partial => (),
            Inbound::CommandComplete => self.phase = HostPhase::PreCompleteDisconnect,
            Inbound::SavePointers => cmd.saved_pointer = cmd.pointer,
            Inbound::RestorePointers => {
                cmd.pointer = cmd.saved_pointer;
                if level2 > Level2::Basic {
                    self.resume_level2(RESUME_DATA);
                    return Ok(());
                }
            }
            Inbound::Disconnect => {
                cmd.disconnect_ok = true;
                self.phase = HostPhase::PreTempDisconnect;
            }
            Inbound::Reject => {
                if self.targets[t].sync_stat == SyncStatus::Waiting {
                    debug!("Target {} rejected SDTR, staying asynchronous", t);
                    self.targets[t].advance(SyncStatus::Set);
                }
            }
            Inbound::Sdtr { period, offset } => {
                if self.targets[t].sync_stat == SyncStatus::Waiting {
                    let st = self.sync_table.sync_xfer(period, offset, self.fast);
                    debug!(
                        "Target {} sync: period {} x4 ns offset {} -> {:02X}",
                        t, period, offset, st.0
                    );
                    self.targets[t].sync_xfer = st;
                    self.bus.write(WdReg::SyncTransfer, st.0);
                } else {
                    // Unsolicited, answer with asynchronous
                    debug!("Target {} sent SDTR unasked, replying async", t);
                    self.bus.command(WdCmd::AssertAtn);
                    let (p, o) = self.sync_table.sdtr(self.default_period, 0, false);
                    self.msg_out.set_sdtr(p, o);
                }
                self.targets[t].advance(SyncStatus::Set);
            }
            Inbound::Wdtr { width } => {
                debug!("Target {} asked for width {}, replying narrow", t, width);
                self.bus.command(WdCmd::AssertAtn);
                self.msg_out.set_wdtr_narrow();
            }
            Inbound::UnknownExtended(code) => {
                warn!("Rejecting extended message {:02X}", code);
                self.bus.command(WdCmd::AssertAtn);
                self.msg_out.set_reject();
            }
            Inbound::Unknown(b) => {
                warn!("Rejecting message {:02X}", b);
                self.bus.command(WdCmd::AssertAtn);
                self.msg_out.set_reject();
            }
        }
        self.bus.command(WdCmd::NegateAck);
        Ok(())
    }

    fn on_message_out(&mut self) {
        // Targets sometimes return to MESSAGE OUT after a reject, a NOP keeps them happy
        let msg = self.msg_out.take_or_nop();
        pio_out(&mut self.bus, &msg, self.config.pio_poll);
        self.phase = HostPhase::Connected;
    }

    fn on_sel_xfer_done(&mut self, irq: Irq) -> Result<(), ScsiError> {
        self.enable_reselection();
        if irq.phs != PHASE_COMPLETE {
            warn!("Select-and-transfer stopped at phase {:02X}", irq.phs);
            return Err(irq.unknown());
        }
        let id = self.need_connected(irq)?;
        self.connected = None;
        self.phase = HostPhase::Unconnected;
        self.clear_messages();

        let lun_status = self.bus.read(WdReg::TargetLun);
        if let Some(cmd) = self.commands.get_mut(id) {
            cmd.message = COMMAND_COMPLETE;
            // The chip leaves the status byte in TARGET_LUN
            if cmd.status == ILLEGAL_STATUS_BYTE {
                cmd.status = lun_status;
            }
        }
        let status = self.completion_status(id);
        self.finish(id, status);
        self.dispatch();
        Ok(())
    }

    fn on_save_data_pointers(&mut self) {
        if let Some(cmd) = self.connected.and_then(|id| self.commands.get_mut(id)) {
            cmd.saved_pointer = cmd.pointer;
        }
        self.resume_level2(RESUME_SDP);
    }

    fn on_unexpected_disconnect(&mut self) {
        self.enable_reselection();
        self.clear_messages();
        let Some(id) = self.connected.take() else {
            warn!("Unexpected disconnect while not connected");
            self.phase = HostPhase::Unconnected;
            return;
        };

        if self.phase == HostPhase::PreTempDisconnect {
            self.park(id);
        } else {
            // Assume the command finished in some legal manner
            warn!("{} unexpected disconnect in {:?}", id, self.phase);
            let status = self.completion_status(id);
            self.finish(id, status);
        }
        self.phase = HostPhase::Unconnected;
        self.dispatch();
    }

    fn on_disconnect(&mut self) {
        self.enable_reselection();
        self.clear_messages();
        let Some(id) = self.connected.take() else {
            warn!("Disconnect while not connected");
            self.phase = HostPhase::Unconnected;
            self.dispatch();
            return;
        };

        match self.phase {
            HostPhase::PreCompleteDisconnect => {
                let status = self.completion_status(id);
                self.finish(id, status);
            }
            HostPhase::PreTempDisconnect | HostPhase::RunningLevel2 => self.park(id),
            phase => {
                warn!("{} disconnected in {:?}", id, phase);
                self.finish(id, HostStatus::Error);
            }
        }
        self.phase = HostPhase::Unconnected;
        self.dispatch();
    }

    fn on_reselect(&mut self, irq: Irq, latched: bool) -> Result<(), ScsiError> {
        // The reselection may have won arbitration against our own selection
        if let Some(id) = self.selecting.take() {
            debug!("{} lost arbitration, requeued", id);
            self.requeue(id);
        } else if let Some(id) = self.connected {
            if self.phase == HostPhase::RunningLevel2 && irq.phs == 0 {
                debug!("{} lost arbitration, requeued", id);
                self.connected = None;
                self.clear_messages();
                self.requeue(id);
            } else {
                error!("Intrusive reselection during {} ({:02X?})", id, irq);
                return Err(ScsiError::IntrusiveReselect {
                    asr: irq.asr,
                    sr: irq.sr,
                    phase: irq.phs,
                });
            }
        }

        let target = SourceId(self.bus.read(WdReg::SourceId)).id();
        let lun = if latched {
            // IDENTIFY already taken by the chip
            let lun = self.bus.read(WdReg::Data) & 7;
            if self.config.level2 < Level2::Reselect {
                self.bus.command(WdCmd::NegateAck);
            }
            lun
        } else {
            self.legacy_reselect_lun()
        };

        let Some(id) = self.disconnected.remove(&(target, lun)) else {
            error!("Reselected by {}.{}, not in the disconnected set", target, lun);
            self.phase = HostPhase::Unconnected;
            return Err(ScsiError::InconsistentReselect { target, lun });
        };
        debug!("{} reconnected", id);
        self.connected = Some(id);
        self.commands.set_tag(id, Membership::Connected);

        // Pointers and busy bits survive the disconnect, the direction bit does not
        let dir = self
            .commands
            .get(id)
            .map_or(Direction::None, |c| c.direction());
        self.bus.write(
            WdReg::DestinationId,
            DestinationId(0)
                .with_id(target)
                .with_dpd(dir != Direction::Write)
                .0,
        );
        self.bus
            .write(WdReg::SyncTransfer, self.targets[target as usize].sync_xfer.0);

        if self.config.level2 >= Level2::Reselect {
            // Guarantees a data phase interrupt
            self.bus.write_count(0);
            self.resume_level2(RESUME_DATA);
        } else {
            self.phase = HostPhase::Connected;
        }
        Ok(())
    }

    /// Chips without advanced features do not latch the IDENTIFY message,
    /// wait for the target to send it
    fn legacy_reselect_lun(&mut self) -> u8 {
        let mut asr = AuxStatus(0);
        for _ in 0..self.config.reselect_poll {
            asr = self.bus.aux();
            if asr.int() {
                break;
            }
        }
        if !asr.int() {
            warn!("Reselected without IDENTIFY");
            return 0;
        }

        let sr = self.bus.read(WdReg::ScsiStatus);
        let msg_in = BusPhase::MessageIn as u8;
        if ![CSR_ABORT | msg_in, CSR_UNEXP | msg_in, CSR_SRV_REQ | msg_in].contains(&sr) {
            warn!("Not MESSAGE IN on reselect ({:02X})", sr);
            return 0;
        }

        let lun = read_1_byte(&mut self.bus, self.config.pio_poll);
        if !self.bus.aux().int() {
            warn!("No interrupt after IDENTIFY on reselect");
        }
        let sr = self.bus.read(WdReg::ScsiStatus);
        if sr != CSR_MSGIN {
            warn!("Not paused with ACK on reselect ({:02X})", sr);
        }
        self.bus.command(WdCmd::NegateAck);
        lun & 7
    }
}
