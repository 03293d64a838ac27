//! Read-only view of the adapter state, with an invariant checker

use serde::{Deserialize, Serialize};

use super::{ChipVariant, HostPhase, HostState};
use crate::chip::WdBus;
use crate::host::dma::DmaEngine;
use crate::scsi::command::{CommandId, DataPointer, Membership};
use crate::scsi::target::TargetState;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSnapshot {
    pub id: CommandId,
    pub target: u8,
    pub lun: u8,
    pub membership: Membership,
    pub disconnect_ok: bool,
    pub status: u8,
    pub pointer: DataPointer,
    pub residual: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostSnapshot {
    pub phase: HostPhase,
    pub chip: ChipVariant,
    pub selecting: Option<CommandId>,
    pub connected: Option<CommandId>,
    /// Input queue, head first
    pub input: Vec<CommandId>,
    pub disconnected: Vec<CommandId>,
    pub targets: Vec<TargetState>,
    pub commands: Vec<CommandSnapshot>,
    pub dma_running: bool,
}

impl HostSnapshot {
    pub fn command(&self, id: CommandId) -> Option<&CommandSnapshot> {
        self.commands.iter().find(|c| c.id == id)
    }

    pub fn is_busy(&self, target: u8, lun: u8) -> bool {
        self.targets
            .get(target as usize)
            .is_some_and(|t| t.is_busy(lun))
    }

    /// Checks the structural invariants, returning a description of each
    /// violation found
    pub fn violations(&self) -> Vec<String> {
        let mut v = vec![];

        if self.selecting.is_some() && self.connected.is_some() {
            v.push(format!(
                "Both {:?} selecting and {:?} connected",
                self.selecting, self.connected
            ));
        }

        for c in &self.commands {
            let expected = match c.membership {
                Membership::Queued => self.input.contains(&c.id),
                Membership::Selecting => self.selecting == Some(c.id),
                Membership::Connected => self.connected == Some(c.id),
                Membership::Disconnected => self.disconnected.contains(&c.id),
            };
            if !expected {
                v.push(format!("{} tagged {:?} but not found there", c.id, c.membership));
            }
            if c.membership == Membership::Disconnected && !c.disconnect_ok {
                v.push(format!("{} disconnected without permission", c.id));
            }
        }

        let referenced = self.input.len()
            + self.disconnected.len()
            + self.selecting.iter().count()
            + self.connected.iter().count();
        if referenced != self.commands.len() {
            v.push(format!(
                "{} commands referenced, {} owned",
                referenced,
                self.commands.len()
            ));
        }

        for (target, t) in self.targets.iter().enumerate() {
            for lun in 0..8 {
                let active = self.commands.iter().any(|c| {
                    c.target as usize == target && c.lun == lun && c.membership != Membership::Queued
                });
                if t.is_busy(lun) != active {
                    v.push(format!(
                        "Busy bit for {}.{} is {} with{} an active command",
                        target,
                        lun,
                        t.is_busy(lun),
                        if active { "" } else { "out" }
                    ));
                }
            }
        }

        v
    }
}

impl<B: WdBus, D: DmaEngine> HostState<B, D> {
    pub(super) fn snapshot(&self) -> HostSnapshot {
        let mut commands: Vec<CommandSnapshot> = self
            .commands
            .iter()
            .map(|(id, c, membership)| CommandSnapshot {
                id,
                target: c.target(),
                lun: c.lun(),
                membership,
                disconnect_ok: c.disconnect_ok(),
                status: c.status(),
                pointer: c.pointer(),
                residual: c.residual(),
            })
            .collect();
        commands.sort_by_key(|c| c.id);

        HostSnapshot {
            phase: self.phase,
            chip: self.chip,
            selecting: self.selecting,
            connected: self.connected,
            input: self.input.iter().copied().collect(),
            disconnected: self.disconnected.values().copied().collect(),
            targets: self.targets.to_vec(),
            commands,
            dma_running: self.dma_running,
        }
    }
}
