use log::*;

use super::config::DisconnectPolicy;
use super::HostState;
use crate::chip::WdBus;
use crate::host::dma::DmaEngine;
use crate::scsi::command::{Command, CommandId, DeviceClass, Membership};

impl<B: WdBus, D: DmaEngine> HostState<B, D> {
    pub(super) fn queue_command(&mut self, cmd: Command) -> CommandId {
        let sense = cmd.is_request_sense();
        let id = self.commands.insert(cmd, Membership::Queued);
        // Sense data must be fetched before anything else disturbs the target
        if sense {
            self.input.push_front(id);
        } else {
            self.input.push_back(id);
        }
        debug!("{} queued, {} waiting", id, self.input.len());

        self.dispatch();
        id
    }

    /// Puts a command that lost the bus back at the head of the input queue
    pub(super) fn requeue(&mut self, id: CommandId) {
        if let Some(cmd) = self.commands.get(id) {
            self.targets[cmd.target() as usize].clear_busy(cmd.lun());
        }
        self.commands.set_tag(id, Membership::Queued);
        self.input.push_front(id);
    }

    /// Starts the first queued command whose LUN is idle, if the bus is free
    pub(super) fn dispatch(&mut self) {
        if self.selecting.is_some() || self.connected.is_some() {
            return;
        }

        let Some(pos) = self.input.iter().position(|&id| {
            self.commands
                .get(id)
                .is_some_and(|c| !self.targets[c.target() as usize].is_busy(c.lun()))
        }) else {
            return;
        };
        let Some(id) = self.input.remove(pos) else {
            return;
        };

        let eligible = self.disconnect_eligible(id);
        if let Some(cmd) = self.commands.get_mut(id) {
            cmd.disconnect_ok = eligible;
        }
        self.select(id);
    }

    /// Guesses whether letting the command disconnect will pay off. It
    /// usually does with several targets busy and usually does not with one.
    ///
    /// Must be called after the command left the input queue.
    fn disconnect_eligible(&mut self, id: CommandId) -> bool {
        let Some(cmd) = self.commands.get(id) else {
            return false;
        };
        let (target, lun) = (cmd.target(), cmd.lun());

        match self.config.disconnect {
            DisconnectPolicy::Never => return false,
            DisconnectPolicy::Always => return true,
            DisconnectPolicy::Adaptive => (),
        }
        if cmd.device() == DeviceClass::Tape {
            return true;
        }
        if !self.disconnected.is_empty() {
            return true;
        }
        if self.input.is_empty() {
            return false;
        }

        let other_lun = self.input.iter().any(|&q| {
            self.commands
                .get(q)
                .is_some_and(|c| (c.target(), c.lun()) != (target, lun))
        });
        if other_lun {
            // Everyone waiting gets to disconnect too
            for &q in &self.input {
                if let Some(c) = self.commands.get_mut(q) {
                    c.disconnect_ok = true;
                }
            }
        }
        other_lun
    }
}
