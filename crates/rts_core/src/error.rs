//! Error types for the simulation core.

use thiserror::Error;

use crate::command::GameTick;
use crate::components::UnitId;
use crate::simulation::Checksum;

/// Result type alias using [`GameError`].
pub type Result<T> = std::result::Result<T, GameError>;

/// Top-level error type for the deterministic core.
///
/// Recoverable conditions (`OutOfRange`, `PoolExhausted`) are handled by the
/// caller. `DesyncDetected` is fatal to the match that raised it.
#[derive(Debug, Error)]
pub enum GameError {
    /// A grid query referenced a cell outside the map.
    #[error("Cell ({x}, {y}) is outside the {width}x{height} map")]
    OutOfRange {
        /// Requested column.
        x: i64,
        /// Requested row.
        y: i64,
        /// Map width in cells.
        width: u32,
        /// Map height in cells.
        height: u32,
    },

    /// The search node pool ran out of slots.
    #[error("Search node pool exhausted (capacity {capacity})")]
    PoolExhausted {
        /// Fixed capacity of the pool.
        capacity: usize,
    },

    /// Local and remote checksums diverged.
    #[error("Desync detected at tick {tick}: local checksum {local:#010x}, remote checksum {remote:#010x}")]
    DesyncDetected {
        /// Tick where the divergence was observed.
        tick: GameTick,
        /// Local rolling checksum.
        local: Checksum,
        /// Checksum reported by the remote peer.
        remote: Checksum,
    },

    /// No checksum is recorded for the requested tick.
    #[error("No checksum recorded for tick {0}")]
    ChecksumUnavailable(GameTick),

    /// Invalid entity reference.
    #[error("Unit not found: {0}")]
    EntityNotFound(UnitId),

    /// Map text or dimensions are malformed.
    #[error("Invalid map: {0}")]
    InvalidMap(String),

    /// Invalid simulation state or call sequence.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Binary (de)serialization failed.
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// Configuration text could not be parsed.
    #[error("Failed to parse config '{path}': {message}")]
    Config {
        /// Path or label of the config source.
        path: String,
        /// Parser message.
        message: String,
    },

    /// A persisted file was written by an incompatible version.
    #[error("{kind} version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// What kind of file was loaded.
        kind: &'static str,
        /// Version this build understands.
        expected: u32,
        /// Version found in the file.
        found: u32,
    },

    /// Filesystem error while saving or loading.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<bincode::Error> for GameError {
    fn from(err: bincode::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
