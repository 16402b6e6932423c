//! Test fixtures and helpers.
//!
//! Pre-built maps and game states for consistent testing.

use fixed::types::I32F32;
use rts_core::command::{Action, Command, CommandSchedule, GameTick};
use rts_core::components::UnitId;
use rts_core::map::{AnnotatedMap, GridPos};
use rts_core::settings::{ids, SimSettings};
use rts_core::simulation::Simulation;

/// Create a fixed-point number from an integer.
#[must_use]
pub fn fixed(n: i32) -> I32F32 {
    I32F32::from_num(n)
}

/// Shorthand for [`GridPos::new`].
#[must_use]
pub const fn cell(x: u32, y: u32) -> GridPos {
    GridPos::new(x, y)
}

/// Build a map from rows of text.
///
/// `.` ground, `#` obstruction, `~` water, `$` ground with resources.
///
/// # Panics
///
/// Panics if the rows are ragged or contain unknown characters.
#[must_use]
pub fn map(rows: &[&str]) -> AnnotatedMap {
    AnnotatedMap::from_rows(rows).expect("fixture map rows must be valid")
}

/// An empty all-ground map.
///
/// # Panics
///
/// Panics on zero dimensions.
#[must_use]
pub fn open_map(width: u32, height: u32) -> AnnotatedMap {
    AnnotatedMap::new(width, height).expect("fixture map dimensions must be positive")
}

/// Two open rooms joined by a one-cell corridor on row 3.
#[must_use]
pub fn corridor_map() -> AnnotatedMap {
    map(&[
        "....#######....",
        "....#######....",
        "....#######....",
        "...............",
        "....#######....",
        "....#######....",
        "....#######....",
    ])
}

/// Two halves separated by a solid wall in column 5.
#[must_use]
pub fn walled_map() -> AnnotatedMap {
    map(&[
        ".....#.....",
        ".....#.....",
        ".....#.....",
        ".....#.....",
        ".....#.....",
    ])
}

/// A serpentine maze whose shortest path is long enough to exhaust small
/// node pools.
#[must_use]
pub fn maze_map() -> AnnotatedMap {
    map(&[
        "...................",
        "##################.",
        "...................",
        ".##################",
        "...................",
        "##################.",
        "...................",
        ".##################",
        "...................",
    ])
}

/// A map with water, resources and obstacles for mixed scenarios.
#[must_use]
pub fn skirmish_map() -> AnnotatedMap {
    map(&[
        "........~~~~........",
        "..$.....~~~~.....$..",
        "........~~~~........",
        "....##..........##..",
        "....##..........##..",
        "....................",
        "........~~~~........",
        "..$.....~~~~.....$..",
        "........~~~~........",
    ])
}

/// Default settings with `players` slots.
#[must_use]
pub fn settings(players: u8) -> SimSettings {
    SimSettings {
        players,
        ..SimSettings::default()
    }
}

/// Unit IDs placed by [`skirmish`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SkirmishUnits {
    /// Player 0 worker.
    pub worker_a: UnitId,
    /// Player 0 trooper.
    pub trooper_a: UnitId,
    /// Player 1 worker.
    pub worker_b: UnitId,
    /// Player 1 trooper.
    pub trooper_b: UnitId,
    /// Player 1 depot.
    pub depot_b: UnitId,
}

/// A two-player game on [`skirmish_map`] with a worker and a trooper each,
/// plus a depot for player 1.
///
/// # Panics
///
/// Panics if the fixture placement is invalid.
#[must_use]
pub fn skirmish() -> (Simulation, SkirmishUnits) {
    let mut sim = Simulation::new(settings(2), skirmish_map()).expect("fixture settings");
    let mut spawn = |owner, blueprint, at| {
        sim.spawn_unit(owner, blueprint, at)
            .expect("fixture spawn cell must be free")
    };
    let units = SkirmishUnits {
        worker_a: spawn(0, ids::WORKER, cell(1, 0)),
        trooper_a: spawn(0, ids::TROOPER, cell(1, 5)),
        worker_b: spawn(1, ids::WORKER, cell(18, 0)),
        trooper_b: spawn(1, ids::TROOPER, cell(18, 5)),
        depot_b: spawn(1, ids::DEPOT, cell(14, 7)),
    };
    (sim, units)
}

/// A fixed command script for [`skirmish`]: harvesting, an attack, a
/// production order and a late stop.
#[must_use]
pub fn skirmish_script(units: SkirmishUnits) -> CommandSchedule {
    let mut schedule = CommandSchedule::new();
    let mut add = |tick: GameTick, issuer, unit, seq, action| {
        schedule.insert(Command::new(tick, issuer, unit, seq, action));
    };
    add(0, 0, units.worker_a, 0, Action::Harvest { at: cell(2, 1) });
    add(0, 1, units.worker_b, 0, Action::Harvest { at: cell(17, 1) });
    add(2, 1, units.depot_b, 1, Action::Produce { blueprint: ids::TROOPER });
    add(4, 0, units.trooper_a, 1, Action::Attack { target: units.trooper_b });
    add(4, 1, units.trooper_b, 2, Action::Move { to: cell(10, 5) });
    add(60, 0, units.trooper_a, 2, Action::Stop);
    schedule
}

/// Run `sim` for `ticks` ticks, feeding it the scheduled commands, and
/// return the checksum after every tick.
///
/// # Panics
///
/// Panics if a tick fails.
pub fn run_schedule(
    sim: &mut Simulation,
    schedule: &mut CommandSchedule,
    ticks: u64,
) -> Vec<rts_core::simulation::Checksum> {
    (0..ticks)
        .map(|_| {
            let commands = schedule.take(sim.tick());
            sim.advance_tick(&commands)
                .expect("scripted tick must apply")
                .checksum
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rts_core::map::Surface;

    #[test]
    fn test_fixture_maps_are_valid() {
        assert_eq!(corridor_map().width(), 15);
        assert!(!walled_map()
            .same_region(cell(0, 0), cell(10, 0), Surface::Land)
            .unwrap());
        assert!(maze_map()
            .same_region(cell(0, 0), cell(0, 8), Surface::Land)
            .unwrap());
        assert_eq!(skirmish_map().resource(cell(2, 1)).unwrap(), 100);
    }

    #[test]
    fn test_skirmish_runs() {
        let (mut sim, units) = skirmish();
        let mut schedule = skirmish_script(units);
        let checksums = run_schedule(&mut sim, &mut schedule, 80);
        assert_eq!(checksums.len(), 80);
        assert!(schedule.is_empty());
        assert!(sim.map().verify_occupancy());
    }
}
