//! Mid-game save files.
//!
//! A save captures the full simulation together with the commands already
//! scheduled for future ticks, so a resumed game applies exactly what the
//! original would have.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::command::{CommandSchedule, GameTick};
use crate::error::{GameError, Result};
use crate::file_format::FileKind;
use crate::simulation::Simulation;

/// Save file format version for compatibility.
pub const SAVE_VERSION: u32 = 2;

const SAVE_FILE: FileKind = FileKind {
    name: "save game",
    magic: *b"RTSS",
    version: SAVE_VERSION,
};

/// A saved game.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveGame {
    /// Next tick to apply when resumed.
    pub tick: GameTick,
    /// Serialized simulation.
    pub state: Vec<u8>,
    /// Commands scheduled for `tick` and later.
    pub pending: CommandSchedule,
}

impl SaveGame {
    /// Capture a simulation and its pending commands.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be serialized.
    pub fn capture(simulation: &Simulation, pending: &CommandSchedule) -> Result<Self> {
        Ok(Self {
            tick: simulation.tick(),
            state: simulation.serialize()?,
            pending: pending.clone(),
        })
    }

    /// Rebuild the simulation and schedule.
    ///
    /// # Errors
    ///
    /// Returns an error if the state does not decode, or
    /// [`GameError::InvalidState`] if it disagrees with the recorded tick.
    pub fn restore(&self) -> Result<(Simulation, CommandSchedule)> {
        let simulation = Simulation::deserialize(&self.state)?;
        if simulation.tick() != self.tick {
            return Err(GameError::InvalidState(format!(
                "save header tick {} does not match state tick {}",
                self.tick,
                simulation.tick()
            )));
        }
        Ok((simulation, self.pending.clone()))
    }

    /// Write the save to a file.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or file writing fails.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path.as_ref(), SAVE_FILE.encode(self)?)?;
        tracing::info!(path = %path.as_ref().display(), tick = self.tick, "game saved");
        Ok(())
    }

    /// Read a save from a file.
    ///
    /// # Errors
    ///
    /// Returns [`GameError::VersionMismatch`] for a save from another format
    /// version, checked before the body is decoded. Otherwise returns an
    /// error if reading or decoding fails.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        let save: Self = SAVE_FILE.decode(&bytes)?;
        tracing::info!(path = %path.as_ref().display(), tick = save.tick, "game loaded");
        Ok(save)
    }
}
