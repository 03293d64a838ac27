use thiserror::Error;

/// Faults raised by the host adapter and by command construction
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScsiError {
    #[error("Target ID {0} out of range")]
    InvalidTarget(u8),
    #[error("LUN {0} out of range")]
    InvalidLun(u8),
    #[error("Invalid CDB length {0}")]
    InvalidCdb(usize),
    #[error("Chip did not respond during {0}")]
    HardwareWedged(&'static str),
    #[error("Reselected by {target}.{lun} but no such command is disconnected")]
    InconsistentReselect { target: u8, lun: u8 },
    #[error("Reselection during transfer (asr {asr:02X} sr {sr:02X} phase {phase:02X})")]
    IntrusiveReselect { asr: u8, sr: u8, phase: u8 },
    #[error("Unknown interrupt (asr {asr:02X} sr {sr:02X} phase {phase:02X})")]
    UnknownInterrupt { asr: u8, sr: u8, phase: u8 },
    #[error("Interrupt {sr:02X} without a connected command")]
    NotConnected { sr: u8 },
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Unknown option '{0}'")]
    UnknownOption(String),
    #[error("Bad value '{value}' for option '{key}'")]
    BadValue { key: String, value: String },
    #[error("Malformed configuration: {0}")]
    Json(#[from] serde_json::Error),
}
