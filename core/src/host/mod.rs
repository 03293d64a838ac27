//! WD33C93 host adapter
//!
//! [`Wd33c93`] owns the chip, the DMA engine and every command between
//! submission and completion. All state lives behind one mutex, shared by
//! the submitting side ([`Wd33c93::submit`], [`Wd33c93::abort`],
//! [`Wd33c93::reset`]) and the interrupt side ([`Wd33c93::interrupt`]).
//! Completion callbacks run after the mutex is released.

pub mod config;
pub mod dma;
pub mod snapshot;

mod dispatch;
mod queue;
mod recovery;
mod select;
mod transfer;

#[cfg(test)]
mod tests;

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, PoisonError};

use log::*;
use serde::{Deserialize, Serialize};

use crate::chip::{DmaMode, WdBus};
use crate::error::ScsiError;
use crate::scsi::command::{Command, CommandArena, CommandId, HostStatus};
use crate::scsi::message::{MessageIn, MessageOut};
use crate::scsi::sync::SyncTable;
use crate::scsi::target::TargetState;
use crate::scsi::MAX_TARGETS;

use config::Config;
use dma::DmaEngine;
use snapshot::HostSnapshot;

/// Selection timeout register value
pub const TIMEOUT_PERIOD_VALUE: u8 = 20;

/// Where the adapter is in the bus protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::IntoStaticStr)]
pub enum HostPhase {
    Unconnected,
    /// Plain selection in progress
    Selecting,
    Connected,
    /// The chip is sequencing a combination command on its own
    RunningLevel2,
    /// COMMAND COMPLETE received, bus free expected
    PreCompleteDisconnect,
    /// DISCONNECT received, bus free expected
    PreTempDisconnect,
}

/// Chip revision, as detected at reset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::IntoStaticStr)]
pub enum ChipVariant {
    Wd33c93,
    Wd33c93A,
    Wd33c93B,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AbortResult {
    /// Removed and completed as aborted
    Aborted,
    /// Disconnected or mid-selection, cannot be cancelled now
    RetryLater,
    NotFound,
}

/// Outcome of a full reset
#[derive(Debug)]
pub struct ResetReport {
    /// Commands dropped by the reset, not completed
    pub discarded: Vec<Command>,
    /// Chip revision detected after the reset
    pub chip: Result<ChipVariant, ScsiError>,
}

pub(crate) struct HostState<B: WdBus, D: DmaEngine> {
    bus: B,
    dma: D,
    config: Config,
    sync_table: SyncTable,

    chip: ChipVariant,
    microcode: u8,
    /// Fast SCSI in use, config permitting and B part detected
    fast: bool,
    /// Default period rounded to the table
    default_period: u32,

    phase: HostPhase,
    commands: CommandArena,
    input: VecDeque<CommandId>,
    selecting: Option<CommandId>,
    connected: Option<CommandId>,
    disconnected: BTreeMap<(u8, u8), CommandId>,
    targets: [TargetState; MAX_TARGETS],

    msg_out: MessageOut,
    msg_in: MessageIn,
    dma_running: bool,

    /// Commands that left the adapter, to be handed back once unlocked
    done: Vec<(Command, HostStatus)>,
}

impl<B: WdBus, D: DmaEngine> HostState<B, D> {
    fn new(bus: B, dma: D, config: Config) -> Self {
        let sync_table = SyncTable::new(config.clock_mhz);
        let default_period = sync_table.rounded(config.default_period_ns);
        let async_xfer = sync_table.async_xfer(default_period);
        Self {
            bus,
            dma,
            sync_table,
            chip: ChipVariant::Unknown,
            microcode: 0,
            fast: config.fast,
            default_period,
            phase: HostPhase::Unconnected,
            commands: CommandArena::default(),
            input: VecDeque::new(),
            selecting: None,
            connected: None,
            disconnected: BTreeMap::new(),
            targets: [TargetState::new(async_xfer); MAX_TARGETS],
            msg_out: MessageOut::default(),
            msg_in: MessageIn::default(),
            dma_running: false,
            done: vec![],
            config,
        }
    }

    fn dma_mode(&self) -> DmaMode {
        if self.config.burst {
            DmaMode::Burst
        } else {
            DmaMode::Dma
        }
    }

    /// Drops message bytes left over from the command that just left the bus
    fn clear_messages(&mut self) {
        self.msg_in.reset();
        self.msg_out.clear();
    }

    /// Takes a command off the adapter, frees its LUN and queues it for completion
    fn finish(&mut self, id: CommandId, status: HostStatus) {
        let Some(cmd) = self.commands.remove(id) else {
            warn!("Completing unknown command {}", id);
            return;
        };
        self.targets[cmd.target() as usize].clear_busy(cmd.lun());
        debug!(
            "{} {}.{} done: {:?} status {:02X}",
            id,
            cmd.target(),
            cmd.lun(),
            status,
            cmd.status()
        );
        self.done.push((cmd, status));
    }
}

/// WD33C93 host adapter driving bus `B` with DMA engine `D`
pub struct Wd33c93<B: WdBus, D: DmaEngine> {
    state: Mutex<HostState<B, D>>,
}

impl<B: WdBus, D: DmaEngine> Wd33c93<B, D> {
    /// Resets the chip and sets up an idle adapter
    pub fn new(bus: B, dma: D, config: Config) -> Result<Self, ScsiError> {
        let mut state = HostState::new(bus, dma, config);
        let chip = state.reset_chip()?;
        info!(
            "{:?} microcode {:02X}, sync period {} ns{}",
            chip,
            state.microcode,
            state.default_period,
            if state.fast { ", fast SCSI" } else { "" }
        );
        Ok(Self {
            state: Mutex::new(state),
        })
    }

    /// Runs `f` under the lock, then delivers any completions it produced
    fn locked<R>(&self, f: impl FnOnce(&mut HostState<B, D>) -> R) -> R {
        let (result, done) = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let result = f(&mut state);
            (result, std::mem::take(&mut state.done))
        };
        for (cmd, status) in done {
            cmd.complete(status);
        }
        result
    }

    /// Queues a command and starts it if the bus is free
    pub fn submit(&self, cmd: Command) -> CommandId {
        self.locked(|s| s.queue_command(cmd))
    }

    /// Services one chip interrupt. Returns `false` if the chip had nothing
    /// pending (or was still busy).
    pub fn interrupt(&self) -> Result<bool, ScsiError> {
        self.locked(|s| s.handle_interrupt())
    }

    /// Resets the bus and the chip, dropping every command
    pub fn reset(&self) -> ResetReport {
        self.locked(|s| s.reset_host())
    }

    pub fn abort(&self, id: CommandId) -> AbortResult {
        self.locked(|s| s.abort(id))
    }

    pub fn snapshot(&self) -> HostSnapshot {
        self.locked(|s| s.snapshot())
    }

    pub fn chip(&self) -> ChipVariant {
        self.locked(|s| s.chip)
    }

    pub fn microcode(&self) -> u8 {
        self.locked(|s| s.microcode)
    }

    /// Direct access to the chip, e.g. to script a simulated one
    pub fn with_bus<R>(&self, f: impl FnOnce(&mut B) -> R) -> R {
        self.locked(|s| f(&mut s.bus))
    }

    pub fn with_dma<R>(&self, f: impl FnOnce(&mut D) -> R) -> R {
        self.locked(|s| f(&mut s.dma))
    }
}
