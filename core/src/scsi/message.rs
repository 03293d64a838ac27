//! SCSI messages exchanged during MESSAGE IN and MESSAGE OUT phases

use arrayvec::ArrayVec;

pub const COMMAND_COMPLETE: u8 = 0x00;
pub const EXTENDED_MESSAGE: u8 = 0x01;
pub const SAVE_POINTERS: u8 = 0x02;
pub const RESTORE_POINTERS: u8 = 0x03;
pub const DISCONNECT: u8 = 0x04;
pub const MESSAGE_REJECT: u8 = 0x07;
pub const NOP: u8 = 0x08;

pub const EXTENDED_SDTR: u8 = 0x01;
pub const EXTENDED_WDTR: u8 = 0x03;

/// Capacity of the incoming message buffer
pub const MSG_IN_LEN: usize = 8;

/// Builds an IDENTIFY message
pub const fn identify(disconnect: bool, lun: u8) -> u8 {
    let disc = if disconnect { 0x40 } else { 0 };
    0x80 | disc | (lun & 0x07)
}

/// Outgoing message buffer, sent in the next MESSAGE OUT phase
#[derive(Debug, Default, Clone)]
pub struct MessageOut {
    buf: ArrayVec<u8, 8>,
}

impl MessageOut {
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Starts a new message with IDENTIFY
    pub fn identify(&mut self, disconnect: bool, lun: u8) {
        self.buf.clear();
        self.buf.push(identify(disconnect, lun));
    }

    /// Appends an SDTR extended message
    pub fn push_sdtr(&mut self, period: u8, offset: u8) {
        for b in [EXTENDED_MESSAGE, 3, EXTENDED_SDTR, period, offset] {
            if self.buf.try_push(b).is_err() {
                break;
            }
        }
    }

    /// Replaces the buffer with an SDTR reply
    pub fn set_sdtr(&mut self, period: u8, offset: u8) {
        self.buf.clear();
        self.push_sdtr(period, offset);
    }

    /// Replaces the buffer with a WDTR reply for 8-bit transfers
    pub fn set_wdtr_narrow(&mut self) {
        self.buf.clear();
        self.buf
            .extend([EXTENDED_MESSAGE, 2, EXTENDED_WDTR, 0]);
    }

    pub fn set_reject(&mut self) {
        self.buf.clear();
        self.buf.push(MESSAGE_REJECT);
    }

    /// Empties the buffer, yielding a lone NOP if nothing was queued
    pub fn take_or_nop(&mut self) -> ArrayVec<u8, 8> {
        if self.buf.is_empty() {
            self.buf.push(NOP);
        }
        std::mem::take(&mut self.buf)
    }
}

/// A complete incoming message, or progress towards one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inbound {
    /// More bytes of an extended message to come
    Partial,
    CommandComplete,
    SavePointers,
    RestorePointers,
    Disconnect,
    Reject,
    Sdtr { period: u8, offset: u8 },
    Wdtr { width: u8 },
    /// Extended message we do not implement, or one too long to hold
    UnknownExtended(u8),
    Unknown(u8),
}

/// Accumulates MESSAGE IN bytes until a message is complete
#[derive(Debug, Default, Clone)]
pub struct MessageIn {
    buf: ArrayVec<u8, MSG_IN_LEN>,
    /// Bytes received of the current message, including ones that did not fit
    received: usize,
}

impl MessageIn {
    pub fn reset(&mut self) {
        self.buf.clear();
        self.received = 0;
    }

    pub fn in_progress(&self) -> bool {
        self.received != 0
    }

    pub fn feed(&mut self, byte: u8) -> Inbound {
        if self.received == 0 && byte != EXTENDED_MESSAGE {
            return match byte {
                COMMAND_COMPLETE => Inbound::CommandComplete,
                SAVE_POINTERS => Inbound::SavePointers,
                RESTORE_POINTERS => Inbound::RestorePointers,
                DISCONNECT => Inbound::Disconnect,
                MESSAGE_REJECT => Inbound::Reject,
                _ => Inbound::Unknown(byte),
            };
        }

        let _ = self.buf.try_push(byte);
        self.received += 1;

        // Extended: 0x01, length, code, arguments
        let Some(&len) = self.buf.get(1) else {
            return Inbound::Partial;
        };
        let total = len as usize + 2;
        if len == 0 {
            self.reset();
            return Inbound::UnknownExtended(0);
        }
        if self.received < total {
            return Inbound::Partial;
        }

        let msg = if total > MSG_IN_LEN {
            Inbound::UnknownExtended(self.buf[2])
        } else {
            match (self.buf[2], &self.buf[3..]) {
                (EXTENDED_SDTR, &[period, offset]) => Inbound::Sdtr { period, offset },
                (EXTENDED_WDTR, &[width]) => Inbound::Wdtr { width },
                (code, _) => Inbound::UnknownExtended(code),
            }
        };
        self.reset();
        msg
    }
}
