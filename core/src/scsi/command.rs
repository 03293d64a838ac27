//! SCSI commands as seen by the host adapter, and the arena that owns them
//! while they are in flight.

use arrayvec::ArrayVec;
use serde::{Deserialize, Serialize};

use crate::chip::{TRANSFER_COUNT_MAX, WdReg};
use crate::error::ScsiError;
use crate::scsi::{ILLEGAL_STATUS_BYTE, MAX_LUNS, MAX_TARGETS, REQUEST_SENSE, cdb_len_ok};

/// Data phase direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::IntoStaticStr)]
pub enum Direction {
    #[default]
    None,
    /// Target -> Initiator
    Read,
    /// Initiator -> Target
    Write,
}

/// Kind of device a command is addressed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DeviceClass {
    #[default]
    Disk,
    /// Sequential access, always allowed to disconnect
    Tape,
    Other,
}

/// Outcome reported to the submitter, next to the SCSI status byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::IntoStaticStr)]
pub enum HostStatus {
    Ok,
    /// Selection timed out
    NoConnect,
    Aborted,
    Error,
}

/// Everything a completed command hands back to its submitter
#[derive(Debug)]
pub struct CommandResult {
    pub host: HostStatus,
    pub status: u8,
    pub message: u8,
    /// Scatter-gather legs, including any data read
    pub data: Vec<Vec<u8>>,
    /// Bytes left untransferred
    pub residual: usize,
}

pub type CompletionFn = Box<dyn FnOnce(CommandResult) + Send>;

/// Current data pointer into the scatter-gather list
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataPointer {
    /// Index of the current leg
    pub leg: usize,
    /// Byte offset into the current leg
    pub offset: usize,
    /// Bytes left in the current leg
    pub this_residual: usize,
    /// Legs left after the current one
    pub buffers_residual: usize,
}

impl DataPointer {
    fn start(legs: &[Vec<u8>]) -> Self {
        match legs.first() {
            Some(first) => Self {
                leg: 0,
                offset: 0,
                this_residual: first.len(),
                buffers_residual: legs.len() - 1,
            },
            None => Self::default(),
        }
    }
}

pub struct Command {
    target: u8,
    lun: u8,
    cdb: ArrayVec<u8, { WdReg::CDB_LEN }>,
    direction: Direction,
    device: DeviceClass,
    legs: Vec<Vec<u8>>,
    pub(crate) pointer: DataPointer,
    pub(crate) saved_pointer: DataPointer,
    pub(crate) status: u8,
    pub(crate) message: u8,
    pub(crate) disconnect_ok: bool,
    done: Option<CompletionFn>,
}

impl Command {
    pub fn new(target: u8, lun: u8, cdb: &[u8]) -> Result<Self, ScsiError> {
        if target as usize >= MAX_TARGETS {
            return Err(ScsiError::InvalidTarget(target));
        }
        if lun >= MAX_LUNS {
            return Err(ScsiError::InvalidLun(lun));
        }
        if !cdb_len_ok(cdb) {
            return Err(ScsiError::InvalidCdb(cdb.len()));
        }
        Ok(Self {
            target,
            lun,
            cdb: cdb.iter().copied().collect(),
            direction: Direction::None,
            device: DeviceClass::default(),
            legs: vec![],
            pointer: DataPointer::default(),
            saved_pointer: DataPointer::default(),
            status: ILLEGAL_STATUS_BYTE,
            message: 0,
            disconnect_ok: false,
            done: None,
        })
    }

    /// Attaches a single read buffer of `len` bytes
    pub fn with_read(self, len: usize) -> Self {
        self.with_sg(Direction::Read, vec![vec![0; len]])
    }

    /// Attaches a single buffer to be written to the target
    pub fn with_write(self, data: Vec<u8>) -> Self {
        self.with_sg(Direction::Write, vec![data])
    }

    /// Attaches a scatter-gather list. Empty legs are dropped.
    pub fn with_sg(mut self, direction: Direction, legs: Vec<Vec<u8>>) -> Self {
        self.legs = legs.into_iter().filter(|l| !l.is_empty()).collect();
        self.direction = if self.legs.is_empty() {
            Direction::None
        } else {
            direction
        };
        self.pointer = DataPointer::start(&self.legs);
        self.saved_pointer = self.pointer;
        self
    }

    pub fn with_device(mut self, device: DeviceClass) -> Self {
        self.device = device;
        self
    }

    pub fn on_complete(mut self, f: impl FnOnce(CommandResult) + Send + 'static) -> Self {
        self.done = Some(Box::new(f));
        self
    }

    pub fn target(&self) -> u8 {
        self.target
    }

    pub fn lun(&self) -> u8 {
        self.lun
    }

    pub fn cdb(&self) -> &[u8] {
        &self.cdb
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn device(&self) -> DeviceClass {
        self.device
    }

    pub fn status(&self) -> u8 {
        self.status
    }

    pub fn message(&self) -> u8 {
        self.message
    }

    pub fn disconnect_ok(&self) -> bool {
        self.disconnect_ok
    }

    pub fn pointer(&self) -> DataPointer {
        self.pointer
    }

    pub fn legs(&self) -> &[Vec<u8>] {
        &self.legs
    }

    pub fn is_request_sense(&self) -> bool {
        self.cdb.first() == Some(&REQUEST_SENSE)
    }

    /// Total bytes not yet transferred
    pub fn residual(&self) -> usize {
        let later: usize = self
            .legs
            .iter()
            .skip(self.pointer.leg + 1)
            .take(self.pointer.buffers_residual)
            .map(Vec::len)
            .sum();
        self.pointer.this_residual + later
    }

    /// The part of the current leg still to be transferred
    pub fn window_mut(&mut self) -> &mut [u8] {
        let p = self.pointer;
        match self.legs.get_mut(p.leg) {
            Some(leg) => {
                let end = (p.offset + p.this_residual).min(leg.len());
                &mut leg[p.offset.min(end)..end]
            }
            None => &mut [],
        }
    }

    /// Moves on to the next leg once the current one is drained
    pub(crate) fn advance_leg(&mut self) {
        if self.pointer.this_residual != 0 || self.pointer.buffers_residual == 0 {
            return;
        }
        let leg = self.pointer.leg + 1;
        self.pointer = DataPointer {
            leg,
            offset: 0,
            this_residual: self.legs.get(leg).map_or(0, Vec::len),
            buffers_residual: self.pointer.buffers_residual - 1,
        };
    }

    /// Folds the chip's residual count for the current leg back into the pointer.
    ///
    /// The chip was armed with at most [`TRANSFER_COUNT_MAX`] bytes of the leg,
    /// anything beyond that is still to go.
    pub(crate) fn fold_residual(&mut self, residual: usize) {
        let armed = self.pointer.this_residual.min(TRANSFER_COUNT_MAX);
        let moved = armed - residual.min(armed);
        self.pointer.offset += moved;
        self.pointer.this_residual -= moved;
    }

    /// Host status for a command that ran to completion on the bus
    pub(crate) fn completion_status(&self) -> HostStatus {
        if self.is_request_sense() && self.status != crate::scsi::STATUS_GOOD {
            HostStatus::Error
        } else {
            HostStatus::Ok
        }
    }

    /// Hands the command back to its submitter. Consumes the command, so a
    /// command completes at most once.
    pub fn complete(mut self, host: HostStatus) {
        let residual = self.residual();
        let Some(done) = self.done.take() else {
            return;
        };
        done(CommandResult {
            host,
            status: self.status,
            message: self.message,
            data: std::mem::take(&mut self.legs),
            residual,
        });
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Command")
            .field("target", &self.target)
            .field("lun", &self.lun)
            .field("cdb", &format_args!("{:02X?}", self.cdb.as_slice()))
            .field("direction", &self.direction)
            .field("pointer", &self.pointer)
            .field("status", &self.status)
            .field("disconnect_ok", &self.disconnect_ok)
            .finish()
    }
}

/// Stable handle to a command owned by the host adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CommandId {
    index: u32,
    generation: u32,
}

impl std::fmt::Display for CommandId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

/// Where a command currently lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::IntoStaticStr)]
pub enum Membership {
    Queued,
    Selecting,
    Connected,
    Disconnected,
}

struct Slot {
    generation: u32,
    entry: Option<(Command, Membership)>,
}

/// Owns every command between submission and completion
#[derive(Default)]
pub(crate) struct CommandArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl CommandArena {
    pub fn insert(&mut self, cmd: Command, tag: Membership) -> CommandId {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.generation = slot.generation.wrapping_add(1);
            slot.entry = Some((cmd, tag));
            return CommandId {
                index,
                generation: slot.generation,
            };
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            entry: Some((cmd, tag)),
        });
        CommandId {
            index,
            generation: 0,
        }
    }

    fn slot(&self, id: CommandId) -> Option<&(Command, Membership)> {
        self.slots
            .get(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.entry.as_ref())
    }

    fn slot_mut(&mut self, id: CommandId) -> Option<&mut (Command, Membership)> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.entry.as_mut())
    }

    pub fn get(&self, id: CommandId) -> Option<&Command> {
        self.slot(id).map(|(c, _)| c)
    }

    pub fn get_mut(&mut self, id: CommandId) -> Option<&mut Command> {
        self.slot_mut(id).map(|(c, _)| c)
    }

    pub fn tag(&self, id: CommandId) -> Option<Membership> {
        self.slot(id).map(|&(_, t)| t)
    }

    pub fn set_tag(&mut self, id: CommandId, tag: Membership) {
        if let Some(entry) = self.slot_mut(id) {
            entry.1 = tag;
        }
    }

    pub fn remove(&mut self, id: CommandId) -> Option<Command> {
        let slot = self
            .slots
            .get_mut(id.index as usize)
            .filter(|s| s.generation == id.generation)?;
        let (cmd, _) = slot.entry.take()?;
        self.free.push(id.index);
        Some(cmd)
    }

    pub fn iter(&self) -> impl Iterator<Item = (CommandId, &Command, Membership)> {
        self.slots.iter().enumerate().filter_map(|(i, s)| {
            s.entry.as_ref().map(|(c, t)| {
                (
                    CommandId {
                        index: i as u32,
                        generation: s.generation,
                    },
                    c,
                    *t,
                )
            })
        })
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.entry.is_some()).count()
    }
}
