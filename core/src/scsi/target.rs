//! Per-target bookkeeping kept by the host adapter

use serde::{Deserialize, Serialize};

use crate::chip::SyncTransfer;

/// Progress of synchronous transfer negotiation with a target
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize, strum::IntoStaticStr,
)]
pub enum SyncStatus {
    /// Never talked to, negotiate on the next selection
    #[default]
    Unset,
    /// Selected, SDTR to be sent with IDENTIFY
    First,
    /// SDTR sent, awaiting the target's reply
    Waiting,
    /// Negotiation done, the sync value holds
    Set,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetState {
    /// One bit per LUN with a command selecting, connected or disconnected
    pub busy: u8,
    pub sync_xfer: SyncTransfer,
    pub sync_stat: SyncStatus,
}

impl TargetState {
    pub fn new(sync_xfer: SyncTransfer) -> Self {
        Self {
            busy: 0,
            sync_xfer,
            sync_stat: SyncStatus::Unset,
        }
    }

    pub fn is_busy(&self, lun: u8) -> bool {
        self.busy & (1 << (lun & 7)) != 0
    }

    pub fn set_busy(&mut self, lun: u8) {
        self.busy |= 1 << (lun & 7);
    }

    pub fn clear_busy(&mut self, lun: u8) {
        self.busy &= !(1 << (lun & 7));
    }

    /// Moves negotiation forward. Status never goes backwards, only a reset
    /// (a fresh [`TargetState`]) does that.
    pub fn advance(&mut self, to: SyncStatus) {
        self.sync_stat = self.sync_stat.max(to);
    }
}
