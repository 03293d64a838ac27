pub mod chip;
pub mod error;
pub mod host;
pub mod scsi;
