//! # RTS Core
//!
//! Deterministic simulation core for a lockstep real-time strategy game.
//!
//! This crate contains **only** deterministic logic:
//! - No rendering
//! - No networking
//! - No system randomness
//! - No floating-point math (uses fixed-point)
//!
//! Every peer in a match runs an identical [`simulation::Simulation`] and
//! feeds it the same commands per tick. Peers compare rolling checksums to
//! detect divergence.
//!
//! ## Crate Structure
//!
//! - [`map`] - Annotated grid: terrain, clearance, regions, occupancy
//! - [`node_pool`] - Reusable A* node storage with epoch reset
//! - [`search`] - A* search engine
//! - [`route`] - Route planner with a path cache
//! - [`simulation`] - Per-tick driver, checksums, desync detection
//! - [`command`] - Player commands and scheduling
//! - [`save`] / [`replay`] - Persistence
//! - [`math`] - Fixed-point math utilities

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

pub mod command;
pub mod components;
pub mod error;
mod file_format;
pub mod map;
pub mod math;
pub mod node_pool;
pub mod replay;
pub mod route;
pub mod save;
pub mod search;
pub mod settings;
pub mod simulation;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::command::{Action, Command, CommandSchedule, GameTick};
    pub use crate::components::{BlueprintId, Entity, Order, PlayerId, UnitId};
    pub use crate::error::{GameError, Result};
    pub use crate::map::{AnnotatedMap, Footprint, GridPos, Surface, Terrain};
    pub use crate::math::Fixed;
    pub use crate::replay::{Replay, ReplayPlayer};
    pub use crate::route::{PathRequest, PlannerConfig, RoutePlanner};
    pub use crate::save::SaveGame;
    pub use crate::search::{MovementModel, PathQuery, PathResult, PathStatus, SearchEngine};
    pub use crate::settings::{Blueprint, SimSettings};
    pub use crate::simulation::{Checksum, Simulation, TickEvent, TickReport, WorldSnapshot};
}
