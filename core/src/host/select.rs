use log::*;

use super::config::Level2;
use super::{HostPhase, HostState};
use crate::chip::{Control, DestinationId, SourceId, WdBus, WdCmd, WdReg};
use crate::host::dma::{DmaEngine, DmaSetup};
use crate::scsi::command::{CommandId, Direction, Membership};
use crate::scsi::target::SyncStatus;

impl<B: WdBus, D: DmaEngine> HostState<B, D> {
    /// Programs the chip for the command and starts selecting its target
    pub(super) fn select(&mut self, id: CommandId) {
        let Some(cmd) = self.commands.get(id) else {
            return;
        };
        let (target, lun) = (cmd.target(), cmd.lun());
        let eligible = cmd.disconnect_ok();
        let dir = cmd.direction();
        let t = target as usize;

        self.bus.write(
            WdReg::DestinationId,
            DestinationId(0)
                .with_id(target)
                .with_dpd(dir != Direction::Write)
                .0,
        );
        self.bus
            .write(WdReg::SourceId, SourceId(0).with_er(eligible).0);
        self.bus.write(WdReg::TargetLun, lun);
        self.bus
            .write(WdReg::SyncTransfer, self.targets[t].sync_xfer.0);
        self.targets[t].set_busy(lun);

        if self.config.level2 == Level2::None || self.targets[t].sync_stat != SyncStatus::Set {
            self.select_plain(id, t);
        } else {
            self.select_and_transfer(id);
        }
    }

    /// SELECT-WITH-ATN. Ends in SELECT, TIMEOUT or a lost arbitration;
    /// IDENTIFY and SDTR go out in the following MESSAGE OUT phase.
    fn select_plain(&mut self, id: CommandId, target: usize) {
        debug!("{} select {}", id, target);
        self.selecting = Some(id);
        self.commands.set_tag(id, Membership::Selecting);
        self.targets[target].advance(SyncStatus::First);
        self.phase = HostPhase::Selecting;

        // Guarantees a data phase interrupt
        self.bus.write_count(0);
        self.bus.command(WdCmd::SelAtn);
    }

    /// SELECT-WITH-ATN-AND-TRANSFER. The chip runs the command on its own
    /// and only interrupts for phases it cannot handle.
    fn select_and_transfer(&mut self, id: CommandId) {
        let dma_mode = self.dma_mode();
        let no_dma = self.config.no_dma;
        debug!("{} select-and-transfer", id);
        self.connected = Some(id);
        self.commands.set_tag(id, Membership::Connected);
        let Some(cmd) = self.commands.get_mut(id) else {
            return;
        };

        self.bus.write(WdReg::CommandPhase, 0);
        self.bus.write_cdb(cmd.cdb());
        // The chip only knows the CDB length of some groups, so always tell it
        self.bus.write(WdReg::OwnId, cmd.cdb().len() as u8);

        let dir = cmd.direction();
        let this_residual = cmd.pointer().this_residual;
        let prearm = !cmd.disconnect_ok() && !no_dma && dir != Direction::None && this_residual > 0;
        if prearm && self.dma.setup(cmd, dir) == DmaSetup::Started {
            self.bus.write_count(this_residual);
            self.bus
                .write(WdReg::Control, Control::with_mode(dma_mode).0);
            self.dma_running = true;
        } else {
            self.bus.write_count(0);
        }

        self.phase = HostPhase::RunningLevel2;
        self.bus.command(WdCmd::SelAtnXfer);
    }
}
