//! Scripted WD33C93 model for exercising the host adapter without hardware.
//!
//! The model keeps a register file and a trace of every access. What the
//! target does is described by a script of [`BusEvent`]s: whenever the host
//! hands the bus back to the chip (starting a selection, finishing a
//! transfer, negating ACK), the next event is raised as an interrupt. Events
//! can also be raised directly with [`TestChip::raise`] or [`TestChip::step`].
//! Programmed-I/O transfers are served from [`TestChip::data_in`] and
//! collected in [`TestChip::data_out`].

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use super::{
    AuxStatus, BusPhase, CSR_ABORT, CSR_MSGIN, CSR_RESEL, CSR_RESEL_AM, CSR_RESET, CSR_RESET_AF,
    CSR_SEL_XFER_DONE, CSR_SRV_REQ, CSR_XFER_DONE, Control, WdBus, WdCmd, WdReg,
};
use crate::host::dma::{DmaEngine, DmaSetup};
use crate::scsi::command::{Command, Direction};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Access {
    Read,
    Write,
}

#[derive(Copy, Clone, Debug)]
pub struct TraceEntry {
    pub reg: WdReg,
    pub access: Access,
    pub val: u8,
}

/// Chip revision the model reports after a reset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TestVariant {
    /// Original part, no advanced features
    Base,
    A,
    #[default]
    B,
}

/// One step of the target's side of a conversation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusEvent {
    /// SCSI status presented
    pub sr: u8,
    /// Command phase register value
    pub phase: u8,
    /// Bytes the target supplies from here on
    pub data: Vec<u8>,
    /// Transfer count left, e.g. the residual of a DMA transfer
    pub count: Option<usize>,
    /// Other registers loaded by the chip
    pub regs: Vec<(WdReg, u8)>,
    /// Raised right after the previous event, without waiting for the host
    pub follows: bool,
}

impl BusEvent {
    pub fn new(sr: u8) -> Self {
        Self {
            sr,
            ..Default::default()
        }
    }

    /// Target requests service in a bus phase
    pub fn service(phase: BusPhase, data: &[u8]) -> Self {
        Self::new(CSR_SRV_REQ | phase as u8).with_data(data)
    }

    /// A message sent by the target, one MESSAGE IN interrupt per byte
    pub fn message_in(bytes: &[u8]) -> Vec<Self> {
        bytes
            .iter()
            .map(|&b| Self::service(BusPhase::MessageIn, &[b]))
            .collect()
    }

    /// Reselection by a target. With `identify`, the chip latched the
    /// IDENTIFY message itself (advanced features).
    pub fn reselect(target: u8, identify: Option<u8>) -> Self {
        let ev = match identify {
            Some(msg) => Self::new(CSR_RESEL_AM).with_data(&[msg]),
            None => Self::new(CSR_RESEL),
        };
        ev.with_reg(WdReg::SourceId, 0x08 | (target & 7))
    }

    /// Select-and-transfer ran to the end, leaving `status` in TARGET_LUN
    pub fn complete(status: u8) -> Self {
        Self::new(CSR_SEL_XFER_DONE)
            .with_phase(0x60)
            .with_count(0)
            .with_reg(WdReg::TargetLun, status)
    }

    pub fn with_phase(mut self, phase: u8) -> Self {
        self.phase = phase;
        self
    }

    pub fn with_data(mut self, data: &[u8]) -> Self {
        self.data = data.to_vec();
        self
    }

    pub fn with_count(mut self, count: usize) -> Self {
        self.count = Some(count);
        self
    }

    pub fn with_reg(mut self, reg: WdReg, val: u8) -> Self {
        self.regs.push((reg, val));
        self
    }

    pub fn following(mut self) -> Self {
        self.follows = true;
        self
    }

    fn is_message_in(&self) -> bool {
        self.sr & 0x07 == BusPhase::MessageIn as u8 && self.sr & 0x08 != 0
    }
}

/// Programmed-I/O transfer in progress
#[derive(Debug, Clone, Copy)]
struct PioTransfer {
    single_byte: bool,
}

pub struct TestChip {
    regs: [u8; 0x20],
    aux: AuxStatus,
    /// Interrupts raised while another one was still pending
    stacked: VecDeque<(u8, u8)>,
    script: VecDeque<BusEvent>,
    pio: Option<PioTransfer>,
    trace: Vec<TraceEntry>,
    commands: Vec<u8>,

    /// Bytes the target supplies in information-in transfers
    pub data_in: VecDeque<u8>,
    /// Bytes the initiator sent in information-out transfers
    pub data_out: Vec<u8>,

    pub variant: TestVariant,
    pub microcode: u8,

    /// Never raises an interrupt or finishes a command
    pub wedged: bool,
}

impl TestChip {
    pub fn new(variant: TestVariant) -> Self {
        Self {
            regs: [0; 0x20],
            aux: AuxStatus(0),
            stacked: VecDeque::new(),
            script: VecDeque::new(),
            pio: None,
            trace: vec![],
            commands: vec![],
            data_in: VecDeque::new(),
            data_out: vec![],
            variant,
            microcode: 0x0D,
            wedged: false,
        }
    }

    /// Raises an interrupt with the given SCSI status and command phase.
    /// If an interrupt is already pending, this one follows once the
    /// status register has been read.
    pub fn raise(&mut self, sr: u8, phase: u8) {
        if self.aux.int() {
            self.stacked.push_back((sr, phase));
        } else {
            self.present(sr, phase);
        }
    }

    /// Target enters `phase`, requesting service, and will supply `bytes`
    pub fn target_phase(&mut self, phase: BusPhase, bytes: &[u8]) {
        self.data_in.extend(bytes);
        self.raise(CSR_SRV_REQ | phase as u8, 0);
    }

    /// Appends to what the target does next
    pub fn script(&mut self, events: impl IntoIterator<Item = BusEvent>) {
        self.script.extend(events);
    }

    /// Events not raised yet
    pub fn pending_events(&self) -> usize {
        self.script.len()
    }

    /// Target acts on its own, e.g. reselects: raises the next scripted
    /// event along with any that follow it. Returns `false` if the script
    /// is exhausted.
    pub fn step(&mut self) -> bool {
        let Some(ev) = self.script.pop_front() else {
            return false;
        };
        self.apply(ev);
        while self.script.front().is_some_and(|e| e.follows) {
            if let Some(ev) = self.script.pop_front() {
                self.apply(ev);
            }
        }
        true
    }

    fn apply(&mut self, ev: BusEvent) {
        self.data_in.extend(&ev.data);
        if let Some(count) = ev.count {
            self.set_count(count);
        }
        for &(reg, val) in &ev.regs {
            self.regs[reg as usize] = val;
        }
        self.raise(ev.sr, ev.phase);
    }

    fn present(&mut self, sr: u8, phase: u8) {
        self.regs[WdReg::ScsiStatus as usize] = sr;
        self.regs[WdReg::CommandPhase as usize] = phase;
        self.aux.set_int(true);
    }

    pub fn pending_interrupt(&self) -> bool {
        self.aux.int()
    }

    pub fn reg(&self, reg: WdReg) -> u8 {
        self.regs[reg as usize]
    }

    /// Sets a register without tracing, e.g. the source ID of a reselecting target
    pub fn set_reg(&mut self, reg: WdReg, val: u8) {
        self.regs[reg as usize] = val;
    }

    pub fn count(&self) -> usize {
        ((self.regs[WdReg::CountMsb as usize] as usize) << 16)
            | ((self.regs[WdReg::CountMid as usize] as usize) << 8)
            | self.regs[WdReg::CountLsb as usize] as usize
    }

    /// Sets the transfer counter, e.g. the residual left by a DMA transfer
    pub fn set_count(&mut self, count: usize) {
        self.regs[WdReg::CountMsb as usize] = (count >> 16) as u8;
        self.regs[WdReg::CountMid as usize] = (count >> 8) as u8;
        self.regs[WdReg::CountLsb as usize] = count as u8;
    }

    /// Commands written to the command register, in order
    pub fn commands(&self) -> &[u8] {
        &self.commands
    }

    pub fn last_command(&self) -> Option<u8> {
        self.commands.last().copied()
    }

    pub fn issued(&self, cmd: WdCmd) -> bool {
        self.commands.iter().any(|&c| c & !WdCmd::SBT == cmd as u8)
    }

    pub fn clear_commands(&mut self) {
        self.commands.clear();
    }

    pub fn trace(&self) -> &[TraceEntry] {
        &self.trace
    }

    /// Values written to a register, in order
    pub fn writes_to(&self, reg: WdReg) -> Vec<u8> {
        self.trace
            .iter()
            .filter(|t| t.reg == reg && t.access == Access::Write)
            .map(|t| t.val)
            .collect()
    }

    /// Takes the bytes sent by the initiator so far
    pub fn take_data_out(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.data_out)
    }

    fn dma_mode(&self) -> bool {
        Control(self.regs[WdReg::Control as usize]).dma_mode() != 0
    }

    fn consume_count(&mut self) {
        let c = self.count();
        self.set_count(c.saturating_sub(1));
    }

    /// Direction of the phase the target is in, taken from the last raised status
    fn direction_in(&self) -> bool {
        // I/O is bit 0 of the phase code: set for DATA IN, STATUS, MESSAGE IN
        self.regs[WdReg::ScsiStatus as usize] & 0x01 != 0
    }

    fn in_message_in(&self) -> bool {
        self.regs[WdReg::ScsiStatus as usize] & 0x07 == BusPhase::MessageIn as u8
    }

    fn pio_finished(&mut self) {
        let Some(pio) = self.pio.take() else {
            return;
        };
        let phase = self.reg(WdReg::CommandPhase);
        if pio.single_byte && self.in_message_in() {
            // Paused with ACK asserted until NEGATE ACK
            self.present(CSR_MSGIN, phase);
        } else if pio.single_byte {
            // Status byte taken, the target moves on to MESSAGE IN
            if !self.script.front().is_some_and(BusEvent::is_message_in) || !self.step() {
                self.present(CSR_XFER_DONE | BusPhase::MessageIn as u8, phase);
            }
        } else {
            // An exhausted script leaves the target quiet
            self.step();
        }
    }

    fn pio_remaining(&self) -> usize {
        match self.pio {
            Some(p) if p.single_byte => 1,
            Some(_) => self.count(),
            None => 0,
        }
    }

    fn command_written(&mut self, val: u8) {
        self.commands.push(val);
        if self.wedged {
            self.aux.set_cip(true);
            return;
        }

        let single_byte = val & WdCmd::SBT != 0;
        match val & !WdCmd::SBT {
            c if c == WdCmd::Reset as u8 => {
                self.stacked.clear();
                self.script.clear();
                self.pio = None;
                self.aux = AuxStatus(0);
                let sr = match self.variant {
                    TestVariant::Base => CSR_RESET,
                    TestVariant::A | TestVariant::B => CSR_RESET_AF,
                };
                self.regs[WdReg::Cdb1 as usize] = self.microcode;
                self.present(sr, 0);
            }
            c if c == WdCmd::Abort as u8 => {
                self.pio = None;
                self.present(CSR_ABORT, self.reg(WdReg::CommandPhase));
            }
            c if c == WdCmd::Disconnect as u8 => {
                self.aux.set_cip(false);
            }
            c if c == WdCmd::SelAtn as u8
                || c == WdCmd::Sel as u8
                || c == WdCmd::SelAtnXfer as u8
                || c == WdCmd::SelXfer as u8
                || c == WdCmd::NegateAck as u8 =>
            {
                self.step();
            }
            c if c == WdCmd::TransInfo as u8 => {
                if self.dma_mode() && !single_byte {
                    // Data moves behind our back, the script sets the residual
                    self.step();
                    return;
                }
                self.pio = Some(PioTransfer { single_byte });
                if self.pio_remaining() == 0 {
                    self.pio_finished();
                }
            }
            _ => (),
        }
    }
}

impl Default for TestChip {
    fn default() -> Self {
        Self::new(TestVariant::default())
    }
}

impl WdBus for TestChip {
    fn read_aux(&mut self) -> u8 {
        let ready = match self.pio {
            Some(_) if self.pio_remaining() == 0 => false,
            // Target switched phase before the count ran out
            Some(_) if self.direction_in() && self.data_in.is_empty() => {
                self.pio_finished();
                false
            }
            Some(_) => true,
            None => false,
        };
        self.aux.with_dbr(ready).0
    }

    fn read(&mut self, reg: WdReg) -> u8 {
        let val = match reg {
            WdReg::Data => {
                let v = self.data_in.pop_front().unwrap_or(0);
                if let Some(pio) = self.pio {
                    if !pio.single_byte {
                        self.consume_count();
                    }
                    if pio.single_byte || self.count() == 0 {
                        self.pio_finished();
                    }
                }
                v
            }
            WdReg::ScsiStatus => {
                let v = self.regs[reg as usize];
                self.aux.set_int(false);
                if self.pio.is_none() {
                    if let Some((sr, phase)) = self.stacked.pop_front() {
                        self.present(sr, phase);
                    }
                }
                v
            }
            WdReg::QueueTag if self.variant != TestVariant::B => 0,
            _ => self.regs[reg as usize],
        };
        self.trace.push(TraceEntry {
            reg,
            access: Access::Read,
            val,
        });
        val
    }

    fn write(&mut self, reg: WdReg, val: u8) {
        self.trace.push(TraceEntry {
            reg,
            access: Access::Write,
            val,
        });
        match reg {
            WdReg::Command => self.command_written(val),
            WdReg::Data => {
                self.data_out.push(val);
                if self.pio.is_some() {
                    self.consume_count();
                    if self.count() == 0 {
                        self.pio_finished();
                    }
                }
            }
            _ => self.regs[reg as usize] = val,
        }
    }
}

/// DMA collaborator for tests: records its use and serves reads from a byte source.
#[derive(Debug, Default)]
pub struct TestDma {
    /// Refuse every setup, forcing programmed I/O
    pub refuse: bool,
    /// Bytes delivered into read windows at setup time
    pub incoming: VecDeque<u8>,
    /// Bytes captured from write windows at setup time
    pub outgoing: Vec<u8>,
    /// (target, direction, window length) per successful setup
    pub setups: Vec<(u8, Direction, usize)>,
    /// `success` flag of each stop
    pub stops: Vec<bool>,
}

impl DmaEngine for TestDma {
    fn setup(&mut self, cmd: &mut Command, dir: Direction) -> DmaSetup {
        if self.refuse {
            return DmaSetup::Fallback;
        }
        let target = cmd.target();
        let window = cmd.window_mut();
        match dir {
            Direction::Read => {
                for b in window.iter_mut() {
                    let Some(v) = self.incoming.pop_front() else {
                        break;
                    };
                    *b = v;
                }
            }
            Direction::Write => self.outgoing.extend_from_slice(window),
            Direction::None => (),
        }
        self.setups.push((target, dir, window.len()));
        DmaSetup::Started
    }

    fn stop(&mut self, _cmd: Option<&mut Command>, success: bool) {
        self.stops.push(success);
    }
}
