//! WD33C93 register interface
//!
//! The chip is reached through an address/data register pair on most boards.
//! [`WdBus`] hides that indirection and exposes the register file by name, the
//! way the host adapter code wants to see it.

pub mod testchip;

use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;
use proc_bitfield::bitfield;
use serde::{Deserialize, Serialize};

/// Largest value the 24-bit transfer counter can hold
pub const TRANSFER_COUNT_MAX: usize = 0xFF_FFFF;

#[derive(
    Debug, PartialEq, Eq, Clone, Copy, FromPrimitive, ToPrimitive, Serialize, Deserialize, strum::IntoStaticStr,
)]
#[repr(u8)]
pub enum WdReg {
    /// Own ID / CDB size (0x00)
    OwnId = 0x00,
    /// Control (0x01)
    Control = 0x01,
    /// Selection timeout period (0x02)
    TimeoutPeriod = 0x02,
    Cdb1 = 0x03,
    Cdb2 = 0x04,
    Cdb3 = 0x05,
    Cdb4 = 0x06,
    Cdb5 = 0x07,
    Cdb6 = 0x08,
    Cdb7 = 0x09,
    Cdb8 = 0x0A,
    Cdb9 = 0x0B,
    Cdb10 = 0x0C,
    Cdb11 = 0x0D,
    Cdb12 = 0x0E,
    /// Target LUN, holds the status byte after a completed select-and-transfer (0x0F)
    TargetLun = 0x0F,
    /// Command phase, progress of a combination command (0x10)
    CommandPhase = 0x10,
    /// Synchronous transfer (0x11)
    SyncTransfer = 0x11,
    CountMsb = 0x12,
    CountMid = 0x13,
    CountLsb = 0x14,
    /// Destination ID (0x15)
    DestinationId = 0x15,
    /// Source ID (0x16)
    SourceId = 0x16,
    /// SCSI status, reading clears the interrupt (0x17)
    ScsiStatus = 0x17,
    /// Command (0x18)
    Command = 0x18,
    /// Data (0x19)
    Data = 0x19,
    /// Queue tag, only retained by the B revision (0x1A)
    QueueTag = 0x1A,
}

impl WdReg {
    /// Number of CDB registers
    pub const CDB_LEN: usize = 12;

    /// Returns the n-th (0-based) CDB register
    pub fn cdb(n: usize) -> Option<Self> {
        if n >= Self::CDB_LEN {
            return None;
        }
        Self::from_u8(Self::Cdb1 as u8 + n as u8)
    }
}

/// WD33C93 commands, as written to [`WdReg::Command`]
#[derive(Debug, PartialEq, Eq, Clone, Copy, FromPrimitive, ToPrimitive, strum::IntoStaticStr)]
#[repr(u8)]
pub enum WdCmd {
    Reset = 0x00,
    Abort = 0x01,
    AssertAtn = 0x02,
    NegateAck = 0x03,
    Disconnect = 0x04,
    Reselect = 0x05,
    SelAtn = 0x06,
    Sel = 0x07,
    SelAtnXfer = 0x08,
    SelXfer = 0x09,
    ReselReceive = 0x0A,
    ReselSend = 0x0B,
    WaitSelReceive = 0x0C,
    TransAddr = 0x18,
    TransInfo = 0x20,
    TransferPad = 0x21,
}

impl WdCmd {
    /// Single byte transfer modifier
    pub const SBT: u8 = 0x80;
}

bitfield! {
    /// Auxiliary Status Register
    #[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct AuxStatus(pub u8): Debug, FromStorage, IntoStorage, DerefStorage {
        /// Data buffer ready
        pub dbr: bool @ 0,
        /// Parity error
        pub pe: bool @ 1,
        /// Command in progress
        pub cip: bool @ 4,
        /// Level II command executing
        pub bsy: bool @ 5,
        /// Last command ignored
        pub lci: bool @ 6,
        /// Interrupt pending
        pub int: bool @ 7,
    }
}

bitfield! {
    /// Own ID register
    #[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct OwnId(pub u8): Debug, FromStorage, IntoStorage, DerefStorage {
        pub id: u8 @ 0..=2,
        /// Enable advanced features
        pub eaf: bool @ 3,
        /// Enable host parity
        pub ehp: bool @ 4,
        /// Really advanced features
        pub raf: bool @ 5,
        /// Input clock frequency select
        pub fs: u8 @ 6..=7,
    }
}

bitfield! {
    /// Control register
    #[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Control(pub u8): Debug, FromStorage, IntoStorage, DerefStorage {
        /// Halt on SCSI parity error
        pub hsp: bool @ 0,
        /// Halt on attention
        pub ha: bool @ 1,
        /// Intermediate disconnect interrupt
        pub idi: bool @ 2,
        /// Ending disconnect interrupt
        pub edi: bool @ 3,
        /// Halt on host parity error
        pub hhp: bool @ 4,
        pub dma_mode: u8 @ 5..=7,
    }
}

impl Control {
    /// Control value used for every transfer: disconnect interrupts enabled,
    /// with the given DMA mode.
    pub fn with_mode(mode: DmaMode) -> Self {
        Self(0)
            .with_idi(true)
            .with_edi(true)
            .with_dma_mode(mode as u8)
    }
}

bitfield! {
    /// Destination ID register
    #[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct DestinationId(pub u8): Debug, FromStorage, IntoStorage, DerefStorage {
        pub id: u8 @ 0..=2,
        /// Data phase direction: set for data in
        pub dpd: bool @ 6,
        /// Select command chain
        pub scc: bool @ 7,
    }
}

bitfield! {
    /// Source ID register
    #[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct SourceId(pub u8): Debug, FromStorage, IntoStorage, DerefStorage {
        pub id: u8 @ 0..=2,
        /// Source ID valid
        pub siv: bool @ 3,
        /// Disable select parity
        pub dsp: bool @ 5,
        /// Enable selection
        pub es: bool @ 6,
        /// Enable reselection
        pub er: bool @ 7,
    }
}

bitfield! {
    /// Synchronous Transfer register, the packed result of an SDTR negotiation
    #[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct SyncTransfer(pub u8): Debug, FromStorage, IntoStorage, DerefStorage {
        /// REQ/ACK offset, 0 = asynchronous
        pub offset: u8 @ 0..=3,
        /// Transfer period, in table rungs
        pub period: u8 @ 4..=6,
        /// Fast SCSI select
        pub fss: bool @ 7,
    }
}

/// DMA mode field of [`Control`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, FromPrimitive, Serialize, Deserialize)]
#[repr(u8)]
pub enum DmaMode {
    Polled = 0,
    Burst = 1,
    Bus = 2,
    #[default]
    Dma = 4,
}

/// Information transfer phase, as encoded in the low bits of the SCSI status
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, strum::IntoStaticStr)]
#[repr(u8)]
pub enum BusPhase {
    DataOut = 0,
    DataIn = 1,
    Command = 2,
    Status = 3,
    MessageOut = 6,
    MessageIn = 7,
}

/// Why the chip stopped in a given bus phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::IntoStaticStr)]
pub enum PhaseCause {
    /// Transfer completed, target requested the next phase (0x18)
    TransferDone,
    /// Paused or aborted (0x28)
    Aborted,
    /// Unexpected phase during a combination command (0x48)
    Unexpected,
    /// Service required (0x88)
    ServiceRequired,
}

pub const CSR_RESET: u8 = 0x00;
pub const CSR_RESET_AF: u8 = 0x01;
pub const CSR_SELECT: u8 = 0x11;
pub const CSR_SEL_XFER_DONE: u8 = 0x16;
pub const CSR_XFER_DONE: u8 = 0x18;
pub const CSR_MSGIN: u8 = 0x20;
pub const CSR_SDP: u8 = 0x21;
pub const CSR_ABORT: u8 = 0x28;
pub const CSR_UNEXP_DISC: u8 = 0x41;
pub const CSR_TIMEOUT: u8 = 0x42;
pub const CSR_UNEXP: u8 = 0x48;
pub const CSR_RESEL: u8 = 0x80;
pub const CSR_RESEL_AM: u8 = 0x81;
pub const CSR_DISC: u8 = 0x85;
pub const CSR_SRV_REQ: u8 = 0x88;

/// Decoded SCSI status register
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Csr {
    /// Reset completed, `true` if advanced features are available
    Reset(bool),
    Select,
    SelXferDone,
    /// Paused with ACK asserted after a message byte
    MessageInPaused,
    SaveDataPointers,
    UnexpectedDisconnect,
    Timeout,
    /// Reselected, `true` if the chip also latched the IDENTIFY message
    Reselect(bool),
    Disconnect,
    Phase(PhaseCause, BusPhase),
    Unknown(u8),
}

impl Csr {
    pub fn decode(sr: u8) -> Self {
        match sr {
            CSR_RESET => Self::Reset(false),
            CSR_RESET_AF => Self::Reset(true),
            CSR_SELECT => Self::Select,
            CSR_SEL_XFER_DONE => Self::SelXferDone,
            CSR_MSGIN => Self::MessageInPaused,
            CSR_SDP => Self::SaveDataPointers,
            CSR_UNEXP_DISC => Self::UnexpectedDisconnect,
            CSR_TIMEOUT => Self::Timeout,
            CSR_RESEL => Self::Reselect(false),
            CSR_RESEL_AM => Self::Reselect(true),
            CSR_DISC => Self::Disconnect,
            _ => {
                let cause = match sr & 0xF8 {
                    CSR_XFER_DONE => PhaseCause::TransferDone,
                    CSR_ABORT => PhaseCause::Aborted,
                    CSR_UNEXP => PhaseCause::Unexpected,
                    CSR_SRV_REQ => PhaseCause::ServiceRequired,
                    _ => return Self::Unknown(sr),
                };
                match BusPhase::from_u8(sr & 0x07) {
                    Some(phase) => Self::Phase(cause, phase),
                    None => Self::Unknown(sr),
                }
            }
        }
    }
}

/// Named access to the WD33C93 register file
pub trait WdBus {
    /// Reads the auxiliary status register (directly addressable, no side effects)
    fn read_aux(&mut self) -> u8;
    fn read(&mut self, reg: WdReg) -> u8;
    fn write(&mut self, reg: WdReg, val: u8);

    fn aux(&mut self) -> AuxStatus {
        AuxStatus(self.read_aux())
    }

    fn command(&mut self, cmd: WdCmd) {
        self.write(WdReg::Command, cmd as u8);
    }

    /// Issues a command with the single byte transfer modifier
    fn command_sbt(&mut self, cmd: WdCmd) {
        self.write(WdReg::Command, cmd as u8 | WdCmd::SBT);
    }

    /// Reads the 24-bit transfer counter
    fn read_count(&mut self) -> usize {
        let msb = self.read(WdReg::CountMsb) as usize;
        let mid = self.read(WdReg::CountMid) as usize;
        let lsb = self.read(WdReg::CountLsb) as usize;
        (msb << 16) | (mid << 8) | lsb
    }

    /// Writes the 24-bit transfer counter
    fn write_count(&mut self, count: usize) {
        let count = count.min(TRANSFER_COUNT_MAX);
        self.write(WdReg::CountMsb, (count >> 16) as u8);
        self.write(WdReg::CountMid, (count >> 8) as u8);
        self.write(WdReg::CountLsb, count as u8);
    }

    /// Loads a command descriptor block into the CDB registers
    fn write_cdb(&mut self, cdb: &[u8]) {
        for (i, &b) in cdb.iter().enumerate() {
            let Some(reg) = WdReg::cdb(i) else {
                break;
            };
            self.write(reg, b);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_phase_groups() {
        assert_eq!(
            Csr::decode(CSR_SRV_REQ | BusPhase::MessageIn as u8),
            Csr::Phase(PhaseCause::ServiceRequired, BusPhase::MessageIn)
        );
        assert_eq!(
            Csr::decode(CSR_XFER_DONE | BusPhase::Status as u8),
            Csr::Phase(PhaseCause::TransferDone, BusPhase::Status)
        );
        assert_eq!(
            Csr::decode(CSR_UNEXP | BusPhase::DataIn as u8),
            Csr::Phase(PhaseCause::Unexpected, BusPhase::DataIn)
        );
        // Phases 4 and 5 are reserved
        assert_eq!(Csr::decode(CSR_XFER_DONE | 4), Csr::Unknown(0x1C));
    }

    #[test]
    fn decode_fixed_codes() {
        assert_eq!(Csr::decode(CSR_RESEL_AM), Csr::Reselect(true));
        assert_eq!(Csr::decode(CSR_MSGIN), Csr::MessageInPaused);
        assert_eq!(Csr::decode(CSR_SDP), Csr::SaveDataPointers);
        assert_eq!(Csr::decode(0x99), Csr::Unknown(0x99));
    }

    #[test]
    fn cdb_registers() {
        assert_eq!(WdReg::cdb(0), Some(WdReg::Cdb1));
        assert_eq!(WdReg::cdb(11), Some(WdReg::Cdb12));
        assert_eq!(WdReg::cdb(12), None);
    }

    #[test]
    fn sync_transfer_packing() {
        let st = SyncTransfer(0).with_period(3).with_offset(12);
        assert_eq!(st.0, 0x3C);
        assert!(SyncTransfer(0x9C).fss());
    }
}
