//! Synchronous transfer negotiation table
//!
//! The WD33C93 expresses the synchronous transfer period in input clock
//! cycles, so the set of periods it can run at depends on the clock class.
//! [`SyncTable`] holds those periods and converts between SDTR message
//! values and the packed [`SyncTransfer`] register byte.

use serde::{Deserialize, Serialize};

use crate::chip::SyncTransfer;

/// Largest REQ/ACK offset we ever offer or accept
pub const OPTIMUM_SX_OFF: u8 = 12;

/// Default synchronous period, in nanoseconds
pub const DEFAULT_SX_PER: u32 = 376;

/// Default offset, asynchronous
pub const DEFAULT_SX_OFF: u8 = 0;

/// One rung of the period table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SxPeriod {
    pub period_ns: u32,
    /// Value for the [`SyncTransfer`] register, period field only
    pub reg: u8,
}

/// Input clock class, selects the clock divisor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClockClass {
    /// 8-10 MHz
    Mhz8To10,
    /// 12-15 MHz
    Mhz12To15,
    /// 16-20 MHz
    Mhz16To20,
}

impl ClockClass {
    pub fn from_mhz(mhz: u32) -> Self {
        if mhz < 11 {
            Self::Mhz8To10
        } else if mhz < 16 {
            Self::Mhz12To15
        } else {
            Self::Mhz16To20
        }
    }

    /// Value of the frequency select field in [`crate::chip::OwnId`]
    pub fn fs(self) -> u8 {
        match self {
            Self::Mhz8To10 => 0,
            Self::Mhz12To15 => 1,
            Self::Mhz16To20 => 2,
        }
    }

    fn divisor(self) -> u32 {
        match self {
            Self::Mhz8To10 => 2,
            Self::Mhz12To15 => 3,
            Self::Mhz16To20 => 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncTable {
    clock: ClockClass,
    /// Rung 0 is a floor, rungs 1-7 are usable periods, rung 8 terminates
    rungs: [SxPeriod; 9],
}

impl SyncTable {
    pub fn new(mhz: u32) -> Self {
        let clock = ClockClass::from_mhz(mhz.max(1));
        // 100 x half the data transfer clock cycle, in ns
        let d = (100_000 * clock.divisor()) / 2 / mhz.max(1);

        let mut rungs = [SxPeriod { period_ns: 0, reg: 0 }; 9];
        rungs[0] = SxPeriod {
            period_ns: 1,
            reg: 0x20,
        };
        for (i, rung) in rungs.iter_mut().enumerate().take(8).skip(1) {
            *rung = SxPeriod {
                period_ns: (i as u32 + 1) * d / 100,
                reg: ((i + 1) * 0x10) as u8,
            };
        }
        // 8 cycles wraps to a period code of 0
        rungs[7].reg = 0;

        Self { clock, rungs }
    }

    pub fn clock(&self) -> ClockClass {
        self.clock
    }

    pub fn rung(&self, idx: usize) -> SxPeriod {
        self.rungs[idx.min(8)]
    }

    /// Index of the fastest rung that is not faster than `period_ns`.
    /// Anything slower than the table goes to the slowest rung.
    pub fn round_period(&self, period_ns: u32) -> usize {
        (1..8)
            .find(|&x| period_ns <= self.rungs[x].period_ns && period_ns > self.rungs[x - 1].period_ns)
            .unwrap_or(7)
    }

    /// Rounds a period in ns to one the chip can run at
    pub fn rounded(&self, period_ns: u32) -> u32 {
        self.rungs[self.round_period(period_ns)].period_ns
    }

    /// Fastest period the table offers
    pub fn optimum_period(&self) -> u32 {
        self.rungs[1].period_ns
    }

    /// Converts the period byte and offset of an SDTR message to a register value.
    ///
    /// With fast SCSI the table holds twice the period actually used on the
    /// bus, hence the doubling.
    pub fn sync_xfer(&self, period: u8, offset: u8, fast: bool) -> SyncTransfer {
        let fast = fast && offset != 0;
        let mut period_ns = period as u32;
        if fast {
            period_ns *= 2;
        }
        period_ns *= 4;

        let reg = self.rungs[self.round_period(period_ns)].reg;
        SyncTransfer(reg)
            .with_offset(offset.min(OPTIMUM_SX_OFF))
            .with_fss(fast)
    }

    /// Builds the period and offset bytes of an SDTR message for a table period
    pub fn sdtr(&self, period_ns: u32, offset: u8, fast: bool) -> (u8, u8) {
        let mut period = period_ns / 4;
        if offset != 0 && fast {
            period /= 2;
        }
        (period.min(u8::MAX as u32) as u8, offset)
    }

    /// Table period matching a register value, ignoring fast SCSI
    pub fn period_ns(&self, st: SyncTransfer) -> Option<u32> {
        let code = st.0 & 0x70;
        self.rungs[1..8]
            .iter()
            .find(|r| r.reg == code)
            .map(|r| r.period_ns)
    }

    /// Register value for asynchronous transfers at the given default period
    pub fn async_xfer(&self, default_period_ns: u32) -> SyncTransfer {
        self.sync_xfer((default_period_ns / 4) as u8, DEFAULT_SX_OFF, false)
    }
}
