//! Data phase handling: DMA where the engine can take the buffer,
//! programmed I/O otherwise

use log::*;

use super::config::Level2;
use super::{HostPhase, HostState};
use crate::chip::{Control, DmaMode, WdBus, WdCmd, WdReg};
use crate::host::dma::{DmaEngine, DmaSetup};
use crate::scsi::command::{CommandId, Direction};

impl<B: WdBus, D: DmaEngine> HostState<B, D> {
    /// Moves the current scatter-gather leg of a connected command
    pub(super) fn transfer_bytes(&mut self, id: CommandId, dir: Direction) {
        let dma_mode = self.dma_mode();
        let level2 = self.config.level2;
        let no_dma = self.config.no_dma;
        let poll = self.config.pio_poll;

        let Some(cmd) = self.commands.get_mut(id) else {
            return;
        };
        // A finished leg leaves this_residual at 0 with legs to go
        cmd.advance_leg();
        let this_residual = cmd.pointer().this_residual;
        if this_residual == 0 {
            return;
        }
        self.bus.write(
            WdReg::SyncTransfer,
            self.targets[cmd.target() as usize].sync_xfer.0,
        );

        if no_dma || self.dma.setup(cmd, dir) == DmaSetup::Fallback {
            match dir {
                Direction::Read => pio_in(&mut self.bus, cmd.window_mut(), poll),
                Direction::Write => pio_out(&mut self.bus, cmd.window_mut(), poll),
                Direction::None => return,
            }
            let residual = self.bus.read_count();
            cmd.fold_residual(residual);
            return;
        }

        // DMA is already going, the residual is picked up at the next interrupt
        self.bus
            .write(WdReg::Control, Control::with_mode(dma_mode).0);
        self.bus.write_count(this_residual);
        if level2 >= Level2::Data || (level2 == Level2::Basic && !cmd.disconnect_ok()) {
            self.bus.write(WdReg::CommandPhase, 0x45);
            self.bus.command(WdCmd::SelAtnXfer);
            self.phase = HostPhase::RunningLevel2;
        } else {
            self.bus.command(WdCmd::TransInfo);
        }
        self.dma_running = true;
    }

    /// Stops DMA after an interrupt and folds the chip's residual count back
    /// into the connected command
    pub(super) fn finish_dma(&mut self) {
        self.dma_running = false;
        let mut cmd = match self.connected {
            Some(id) => self.commands.get_mut(id),
            None => None,
        };
        self.dma.stop(cmd.as_deref_mut(), true);
        let residual = self.bus.read_count();
        if let Some(cmd) = cmd {
            trace!("DMA stopped, {} of {} left", residual, cmd.pointer().this_residual);
            cmd.fold_residual(residual);
        }
    }
}

fn start_pio<B: WdBus>(bus: &mut B, len: usize) {
    bus.write(WdReg::Control, Control::with_mode(DmaMode::Polled).0);
    bus.write_count(len);
    bus.command(WdCmd::TransInfo);
}

/// Reads until the chip interrupts, which it does once the count runs out or
/// the target changes phase. The interrupt is left pending.
pub(super) fn pio_in<B: WdBus>(bus: &mut B, buf: &mut [u8], poll: u32) {
    start_pio(bus, buf.len());
    let mut pos = 0;
    let mut idle = 0;
    loop {
        let asr = bus.aux();
        if asr.dbr() {
            let b = bus.read(WdReg::Data);
            match buf.get_mut(pos) {
                Some(slot) => *slot = b,
                None => warn!("PIO read overrun, dropping {:02X}", b),
            }
            pos += 1;
            idle = 0;
        } else {
            idle += 1;
        }
        if asr.int() {
            break;
        }
        if idle > poll {
            warn!("PIO read stalled after {} of {} bytes", pos, buf.len());
            break;
        }
    }
}

/// Writes until the chip interrupts. The interrupt is left pending.
pub(super) fn pio_out<B: WdBus>(bus: &mut B, buf: &[u8], poll: u32) {
    start_pio(bus, buf.len());
    let mut pos = 0;
    let mut idle = 0;
    loop {
        let asr = bus.aux();
        if asr.dbr() {
            bus.write(WdReg::Data, buf.get(pos).copied().unwrap_or(0));
            pos += 1;
            idle = 0;
        } else {
            idle += 1;
        }
        if asr.int() {
            break;
        }
        if idle > poll {
            warn!("PIO write stalled after {} of {} bytes", pos, buf.len());
            break;
        }
    }
}

/// Transfers a single byte in. For MESSAGE IN the chip then pauses with ACK
/// asserted and interrupts.
pub(super) fn read_1_byte<B: WdBus>(bus: &mut B, poll: u32) -> u8 {
    bus.write(WdReg::Control, Control::with_mode(DmaMode::Polled).0);
    bus.command_sbt(WdCmd::TransInfo);
    let mut x = 0;
    for _ in 0..poll {
        let asr = bus.aux();
        if asr.dbr() {
            x = bus.read(WdReg::Data);
        }
        if asr.int() {
            return x;
        }
    }
    warn!("Single byte transfer stalled");
    x
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chip::testchip::{BusEvent, TestChip};
    use crate::chip::{BusPhase, CSR_MSGIN, CSR_SRV_REQ, CSR_XFER_DONE};

    #[test]
    fn pio_in_stops_on_phase_change() {
        let mut chip = TestChip::default();
        chip.target_phase(BusPhase::DataIn, &[1, 2, 3]);
        chip.script([BusEvent::new(CSR_XFER_DONE | BusPhase::Status as u8)]);
        chip.read(WdReg::ScsiStatus);

        let mut buf = [0u8; 8];
        pio_in(&mut chip, &mut buf, 10);
        assert_eq!(buf[..3], [1, 2, 3]);
        assert_eq!(chip.read_count(), 5);
        assert_eq!(
            chip.read(WdReg::ScsiStatus),
            CSR_XFER_DONE | BusPhase::Status as u8
        );
    }

    #[test]
    fn pio_out_sends_all() {
        let mut chip = TestChip::default();
        chip.raise(CSR_SRV_REQ | BusPhase::DataOut as u8, 0);
        chip.read(WdReg::ScsiStatus);
        chip.script([BusEvent::service(BusPhase::Status, &[0])]);
        pio_out(&mut chip, &[9, 8, 7], 10);
        assert_eq!(chip.take_data_out(), vec![9, 8, 7]);
        assert_eq!(chip.read_count(), 0);
        assert_eq!(
            chip.read(WdReg::ScsiStatus),
            CSR_SRV_REQ | BusPhase::Status as u8
        );
    }

    #[test]
    fn pio_out_gives_up_on_silent_target() {
        let mut chip = TestChip::default();
        chip.raise(CSR_SRV_REQ | BusPhase::DataOut as u8, 0);
        chip.read(WdReg::ScsiStatus);
        pio_out(&mut chip, &[1, 2], 10);
        assert_eq!(chip.take_data_out(), vec![1, 2]);
        assert!(!chip.pending_interrupt());
    }

    #[test]
    fn single_byte_message() {
        let mut chip = TestChip::default();
        chip.target_phase(BusPhase::MessageIn, &[0x04]);
        chip.read(WdReg::ScsiStatus);
        assert_eq!(read_1_byte(&mut chip, 10), 0x04);
        assert_eq!(chip.read(WdReg::ScsiStatus), CSR_MSGIN);
    }

    #[test]
    fn single_byte_gives_up() {
        let mut chip = TestChip::default();
        chip.wedged = true;
        assert_eq!(read_1_byte(&mut chip, 10), 0);
    }
}
