//! Interface to the board's DMA engine

use crate::scsi::command::{Command, Direction};

/// Result of asking the DMA engine to take over a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaSetup {
    /// Engine armed, the chip may be started in DMA mode
    Started,
    /// Engine cannot serve this buffer, use programmed I/O for it
    Fallback,
}

/// The external DMA engine feeding the chip.
///
/// `setup` is handed the command whose current leg is to be moved; the leg is
/// available through [`Command::window_mut`].
pub trait DmaEngine {
    fn setup(&mut self, cmd: &mut Command, dir: Direction) -> DmaSetup;

    /// Stops a running transfer. `cmd` is `None` when stopping for a reset.
    fn stop(&mut self, cmd: Option<&mut Command>, success: bool);
}

/// A board without DMA: every transfer falls back to programmed I/O
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDma;

impl DmaEngine for NoDma {
    fn setup(&mut self, _cmd: &mut Command, _dir: Direction) -> DmaSetup {
        DmaSetup::Fallback
    }

    fn stop(&mut self, _cmd: Option<&mut Command>, _success: bool) {}
}
