//! SCSI protocol definitions shared by the host adapter

pub mod command;
pub mod message;
pub mod sync;
pub mod target;

pub const STATUS_GOOD: u8 = 0;
pub const STATUS_CHECK_CONDITION: u8 = 2;

/// Status byte value meaning "not received yet"
pub const ILLEGAL_STATUS_BYTE: u8 = 0xFF;

/// REQUEST SENSE opcode
pub const REQUEST_SENSE: u8 = 0x03;

/// Number of target IDs on a narrow bus
pub const MAX_TARGETS: usize = 8;

/// Number of LUNs addressable through IDENTIFY
pub const MAX_LUNS: u8 = 8;

/// CDB length implied by the group code of an opcode
const fn scsi_cmd_len(opcode: u8) -> Option<usize> {
    match opcode >> 5 {
        // Group 0
        0 => Some(6),
        // Groups 1 and 2
        1 | 2 => Some(10),
        // Group 4
        4 => Some(16),
        // Group 5
        5 => Some(12),
        // Reserved and vendor specific
        _ => None,
    }
}

/// Checks a CDB length against what its opcode group calls for.
/// Vendor specific groups may use any length the chip can hold.
pub(crate) fn cdb_len_ok(cdb: &[u8]) -> bool {
    let Some(&opcode) = cdb.first() else {
        return false;
    };
    if cdb.len() > crate::chip::WdReg::CDB_LEN {
        return false;
    }
    match scsi_cmd_len(opcode) {
        Some(len) => len == cdb.len(),
        None => true,
    }
}
