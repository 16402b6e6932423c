//! Fixed-point math utilities for deterministic simulation.
//!
//! All simulation costs and speeds use fixed-point arithmetic so every
//! peer computes bit-identical results regardless of CPU or compiler.
//! The constants in this module are part of the lockstep contract: two
//! peers built with different values will desync.

use fixed::types::I32F32;
use serde::{Deserialize, Serialize};

/// Fixed-point number type for all simulation math.
///
/// Uses 32 bits for integer part and 32 bits for fractional part.
pub type Fixed = I32F32;

/// Cost of a straight (orthogonal) step between adjacent cells.
pub const STRAIGHT_COST: Fixed = Fixed::ONE;

/// Cost of a diagonal step: sqrt(2) truncated to 32 fractional bits.
pub const DIAGONAL_COST: Fixed = Fixed::from_bits(0x1_6A09_E667);

/// Multiplier applied to every heuristic estimate.
///
/// Kept at one so the heuristic stays admissible and paths are optimal.
pub const HEURISTIC_SCALE: Fixed = Fixed::ONE;

/// Serde support for fixed-point numbers.
///
/// Serializes fixed-point numbers as their raw bit representation (i64)
/// to preserve exact precision across serialization boundaries.
pub mod fixed_serde {
    use super::Fixed;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    /// Serialize a fixed-point number as its raw bit representation.
    pub fn serialize<S>(value: &Fixed, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        value.to_bits().serialize(serializer)
    }

    /// Deserialize a fixed-point number from its raw bit representation.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Fixed, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bits = i64::deserialize(deserializer)?;
        Ok(Fixed::from_bits(bits))
    }
}

/// Octile distance between two cells with unit straight cost.
#[must_use]
pub fn octile_distance(dx: u32, dy: u32) -> Fixed {
    let (long, short) = if dx > dy { (dx, dy) } else { (dy, dx) };
    STRAIGHT_COST * Fixed::from_num(long - short) + DIAGONAL_COST * Fixed::from_num(short)
}

/// Manhattan distance between two cells with unit straight cost.
#[must_use]
pub fn manhattan_distance(dx: u32, dy: u32) -> Fixed {
    STRAIGHT_COST * Fixed::from_num(u64::from(dx) + u64::from(dy))
}

/// Fixed-point 2D vector, used for interpolated world positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Vec2Fixed {
    /// X coordinate.
    #[serde(with = "fixed_serde")]
    pub x: Fixed,
    /// Y coordinate.
    #[serde(with = "fixed_serde")]
    pub y: Fixed,
}

impl Vec2Fixed {
    /// Create a new fixed-point vector.
    #[must_use]
    pub const fn new(x: Fixed, y: Fixed) -> Self {
        Self { x, y }
    }

    /// Zero vector.
    pub const ZERO: Self = Self {
        x: Fixed::ZERO,
        y: Fixed::ZERO,
    };

    /// Center of a grid cell, with one world unit per cell.
    #[must_use]
    pub fn cell_center(x: u32, y: u32) -> Self {
        let half = Fixed::ONE / Fixed::from_num(2);
        Self::new(Fixed::from_num(x) + half, Fixed::from_num(y) + half)
    }

    /// Linearly interpolate between two vectors.
    #[must_use]
    pub fn lerp(self, other: Self, t: Fixed) -> Self {
        Self {
            x: self.x + (other.x - self.x) * t,
            y: self.y + (other.y - self.y) * t,
        }
    }
}
