//! Host adapter options, fixed at initialization
//!
//! Options come either from a JSON document or from a boot-style setup
//! string such as `nosync:0x7f,level2:2 period:500`.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use anyhow::{Context, Result};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::scsi::sync::DEFAULT_SX_PER;

/// When commands are allowed to disconnect from the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, FromPrimitive, Serialize, Deserialize)]
pub enum DisconnectPolicy {
    Never = 0,
    /// Decided per command from the queue contents
    #[default]
    Adaptive = 1,
    Always = 2,
}

/// How much of a command the chip is allowed to sequence on its own
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, FromPrimitive, Serialize, Deserialize,
)]
pub enum Level2 {
    /// Every phase is handled by the interrupt handler
    None = 1,
    /// Unused, behaves as `Basic` apart from the comparison points
    Select = 2,
    /// Select-and-transfer when sync is negotiated, resume after STATUS
    #[default]
    Basic = 3,
    /// Also resume data phases
    Data = 4,
    Most = 5,
    /// Also resume after reselection
    Reselect = 6,
    All = 7,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub disconnect: DisconnectPolicy,
    pub level2: Level2,
    /// Default synchronous period in ns, rounded to the table at init
    pub default_period_ns: u32,
    /// One bit per target that should only be offered asynchronous transfers
    pub no_sync: u8,
    pub no_dma: bool,
    pub clock_mhz: u32,
    /// Fast SCSI, only honoured on WD33C93B parts
    pub fast: bool,
    /// Burst DMA mode instead of single-byte DMA handshakes
    pub burst: bool,
    pub own_id: u8,

    /// Polls for the IDENTIFY byte after a legacy reselection
    pub reselect_poll: u32,
    /// Polls for each step of aborting a connected command
    pub abort_poll: u32,
    /// Polls for one byte of a programmed-I/O transfer
    pub pio_poll: u32,
    /// Polls for the chip reset interrupt
    pub reset_poll: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            disconnect: DisconnectPolicy::default(),
            level2: Level2::default(),
            default_period_ns: DEFAULT_SX_PER,
            no_sync: 0xFF,
            no_dma: false,
            clock_mhz: 8,
            fast: false,
            burst: false,
            own_id: 7,
            reselect_poll: 255,
            abort_poll: 1_000_000,
            pio_poll: 100_000,
            reset_poll: 1_000_000,
        }
    }
}

/// Parses `0x` hex or decimal
fn parse_num(key: &str, value: &str) -> Result<i64, ConfigError> {
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => i64::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|_| ConfigError::BadValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

impl Config {
    /// Applies a setup string on top of the defaults.
    ///
    /// Options are `key` or `key:value`, separated by commas or spaces. A key
    /// without a value stands for "all" (`nosync`) or "on" (flags).
    pub fn from_setup(setup: &str) -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        cfg.apply_setup(setup)?;
        Ok(cfg)
    }

    pub fn apply_setup(&mut self, setup: &str) -> Result<(), ConfigError> {
        for opt in setup.split([',', ' ']).filter(|s| !s.is_empty()) {
            let (key, value) = match opt.split_once(':') {
                Some((k, v)) => (k, Some(parse_num(k, v)?)),
                None => (opt, None),
            };
            let flag = value.is_none_or(|v| v != 0);
            let need = || {
                value.ok_or_else(|| ConfigError::BadValue {
                    key: key.to_string(),
                    value: String::new(),
                })
            };

            match key {
                "nosync" => self.no_sync = value.map_or(0xFF, |v| v as u8),
                "nodma" => self.no_dma = flag,
                "period" => self.default_period_ns = need()?.clamp(0, u32::MAX as i64) as u32,
                "disconnect" => {
                    self.disconnect = value
                        .and_then(DisconnectPolicy::from_i64)
                        .unwrap_or(DisconnectPolicy::Adaptive)
                }
                "level2" => {
                    if let Some(l) = value.and_then(Level2::from_i64) {
                        self.level2 = l;
                    } else {
                        log::warn!("Ignoring level2 value {:?}", value);
                    }
                }
                "clock" => {
                    let mhz = need()?;
                    if !(1..=20).contains(&mhz) {
                        return Err(ConfigError::BadValue {
                            key: key.to_string(),
                            value: mhz.to_string(),
                        });
                    }
                    self.clock_mhz = mhz as u32;
                }
                "burst" => self.burst = flag,
                "fast" => self.fast = flag,
                "debug" | "next" => (),
                _ => return Err(ConfigError::UnknownOption(key.to_string())),
            }
        }
        Ok(())
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("Cannot open {}", path.display()))?;
        let reader = BufReader::new(file);
        let cfg = serde_json::from_reader(reader)
            .with_context(|| format!("Cannot parse {}", path.display()))?;
        Ok(cfg)
    }
}
