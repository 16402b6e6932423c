//! Scenario tests that run several simulation peers side by side, the way a
//! lockstep match does, and check that they never drift apart.

use rts_core::command::{Action, Command, CommandSchedule};
use rts_core::error::GameError;
use rts_core::map::{GridPos, Surface};
use rts_core::replay::{Replay, ReplayPlayer};
use rts_core::route::{PathRequest, PlannerConfig, RoutePlanner};
use rts_core::save::SaveGame;
use rts_core::search::{MovementModel, PathQuery, PathStatus, SearchEngine};
use rts_core::settings::ids;
use rts_core::simulation::{Simulation, TickEvent};
use rts_test_utils::fixtures::{self, cell};

fn corridor_peer() -> (Simulation, u64) {
    let mut sim = Simulation::new(fixtures::settings(2), fixtures::corridor_map()).unwrap();
    let unit = sim.spawn_unit(0, ids::WORKER, cell(1, 1)).unwrap();
    (sim, unit)
}

/// Runs a peer until `unit` arrives, returning the arrival tick and every
/// cell the unit stood on.
fn run_until_arrival(sim: &mut Simulation, unit: u64, order: &Command) -> (u64, Vec<GridPos>) {
    let mut trail = vec![sim.entities().get(unit).unwrap().cell];
    for _ in 0..200 {
        let commands = if sim.tick() == order.tick {
            vec![order.clone()]
        } else {
            Vec::new()
        };
        let report = sim.advance_tick(&commands).unwrap();
        let here = sim.entities().get(unit).unwrap().cell;
        if trail.last() != Some(&here) {
            trail.push(here);
        }
        if report
            .events
            .iter()
            .any(|e| matches!(e, TickEvent::Arrived { unit: u, .. } if *u == unit))
        {
            return (report.tick, trail);
        }
    }
    panic!("unit never arrived");
}

// =============================================================================
// Corridor scenario
// =============================================================================

#[test]
fn test_corridor_peers_agree_on_path_and_arrival() {
    let (mut peer_a, unit_a) = corridor_peer();
    let (mut peer_b, unit_b) = corridor_peer();
    assert_eq!(unit_a, unit_b);

    let order = Command::new(5, 0, unit_a, 0, Action::Move { to: cell(13, 5) });
    let (arrival_a, trail_a) = run_until_arrival(&mut peer_a, unit_a, &order);
    let (arrival_b, trail_b) = run_until_arrival(&mut peer_b, unit_b, &order);

    assert_eq!(trail_a, trail_b);
    assert_eq!(arrival_a, arrival_b);
    assert_eq!(peer_a.state_hash(), peer_b.state_hash());
    assert!(arrival_a > 5);

    // The only way across is the corridor on row 3.
    for x in 4..=10 {
        assert!(trail_a.contains(&cell(x, 3)), "corridor cell ({x}, 3) skipped");
    }
    assert_eq!(trail_a.last(), Some(&cell(13, 5)));
}

#[test]
fn test_corridor_blocked_by_other_unit_repaths_or_waits() {
    let (mut sim, unit) = corridor_peer();
    let blocker = sim.spawn_unit(1, ids::WORKER, cell(7, 3)).unwrap();

    let order = Command::new(0, 0, unit, 0, Action::Move { to: cell(13, 3) });
    sim.advance_tick(&[order]).unwrap();
    let step_aside = Command::new(12, 1, blocker, 0, Action::Move { to: cell(13, 6) });

    let mut arrived = false;
    for _ in 0..200 {
        let commands = if sim.tick() == 12 {
            vec![step_aside.clone()]
        } else {
            Vec::new()
        };
        let report = sim.advance_tick(&commands).unwrap();
        if report
            .events
            .iter()
            .any(|e| matches!(e, TickEvent::Arrived { unit: u, .. } if *u == unit))
        {
            arrived = true;
            break;
        }
        // Only the two units ever share the corridor, never a cell.
        assert!(sim.map().verify_occupancy());
    }
    // Either the mover got through once the blocker left, or it gave up
    // while the corridor was blocked. It must never pass through the blocker.
    let mover = sim.entities().get(unit).unwrap();
    if arrived {
        assert_eq!(mover.cell, cell(13, 3));
    } else {
        assert!(mover.cell.x <= 7);
    }
}

// =============================================================================
// Search properties
// =============================================================================

#[test]
fn test_walled_goal_is_unreachable_never_partial() {
    let map = fixtures::walled_map();
    for capacity in [1usize, 4, 64, 4096] {
        let mut planner = RoutePlanner::new(PlannerConfig {
            pool_capacity: capacity,
            ..PlannerConfig::default()
        });
        let request = PathRequest {
            unit: 1,
            query: PathQuery::land(cell(0, 0), cell(10, 4)),
        };
        let result = planner.plan(&map, &request).unwrap();
        assert_eq!(result.status, PathStatus::Unreachable, "capacity {capacity}");
        assert!(result.path.is_empty());
    }
}

#[test]
fn test_small_pool_returns_partial_toward_goal() {
    let map = fixtures::maze_map();
    let config = PlannerConfig {
        pool_capacity: 12,
        ..PlannerConfig::default()
    };
    let mut engine = SearchEngine::new(&config);
    let query = PathQuery::land(cell(0, 0), cell(0, 8));
    let result = engine.search(&map, &query).unwrap();

    assert_eq!(result.status, PathStatus::PartialFound);
    assert_eq!(result.path.first(), Some(&cell(0, 0)));
    for pair in result.path.windows(2) {
        assert_eq!(pair[0].chebyshev(pair[1]), 1);
        assert!(map.is_passable(pair[1], Surface::Land).unwrap());
    }

    let full = SearchEngine::new(&PlannerConfig::default())
        .search(&map, &query)
        .unwrap();
    assert_eq!(full.status, PathStatus::Found);
    assert!(full.path.len() > result.path.len());
}

#[test]
fn test_reused_engine_never_sees_stale_nodes() {
    let mut engine = SearchEngine::new(&PlannerConfig {
        movement: MovementModel::Octile,
        ..PlannerConfig::default()
    });
    let maze = fixtures::maze_map();
    let open = fixtures::open_map(19, 9);
    let query = PathQuery::land(cell(0, 0), cell(0, 8));

    let first = engine.search(&maze, &query).unwrap();
    let second = engine.search(&open, &query).unwrap();
    let third = engine.search(&maze, &query).unwrap();

    assert_eq!(second.path.len(), 9);
    assert_eq!(first, third);
    assert_eq!(
        second,
        SearchEngine::new(&PlannerConfig::default())
            .search(&open, &query)
            .unwrap()
    );
}

// =============================================================================
// Desync detection
// =============================================================================

#[test]
fn test_divergent_peer_is_detected_and_halted() {
    let (mut peer_a, unit) = corridor_peer();
    let (mut peer_b, _) = corridor_peer();

    for tick in 0..10 {
        let mut commands = Vec::new();
        let a = peer_a.advance_tick(&commands).unwrap();
        if tick == 6 {
            commands.push(Command::new(tick, 0, unit, 0, Action::Move { to: cell(2, 5) }));
        }
        let b = peer_b.advance_tick(&commands).unwrap();
        let result = peer_a.verify_remote_checksum(tick, b.checksum);
        if tick < 6 {
            assert!(result.is_ok());
            assert_eq!(a.checksum, b.checksum);
        } else {
            assert!(matches!(result, Err(GameError::DesyncDetected { tick: 6, .. })));
            break;
        }
    }
    assert!(peer_a.is_halted());
    assert!(peer_a.advance_tick(&[]).is_err());
    assert!(!peer_b.is_halted());
}

// =============================================================================
// Persistence
// =============================================================================

#[test]
fn test_save_mid_game_resumes_identically() {
    let (mut sim, units) = fixtures::skirmish();
    let mut schedule = fixtures::skirmish_script(units);
    fixtures::run_schedule(&mut sim, &mut schedule, 25);

    let save = SaveGame::capture(&sim, &schedule).unwrap();
    let path = std::env::temp_dir().join("rts_core_scenario_save.bin");
    save.save(&path).unwrap();
    let (mut resumed, mut resumed_schedule) = SaveGame::load(&path).unwrap().restore().unwrap();
    let _ = std::fs::remove_file(path);

    assert_eq!(resumed.state_hash(), sim.state_hash());
    let original = fixtures::run_schedule(&mut sim, &mut schedule, 75);
    let continued = fixtures::run_schedule(&mut resumed, &mut resumed_schedule, 75);
    assert_eq!(original, continued);
}

#[test]
fn test_replay_reproduces_skirmish() {
    let (mut sim, units) = fixtures::skirmish();
    let mut schedule = fixtures::skirmish_script(units);
    let mut replay = Replay::new(&sim).unwrap();

    for _ in 0..100 {
        let commands = schedule.take(sim.tick());
        sim.advance_tick(&commands).unwrap();
        replay.record(&commands);
    }
    replay.finalize(&sim);

    let mut player = ReplayPlayer::new(replay).unwrap();
    player.verify().unwrap();
    assert_eq!(player.simulation().snapshot(), sim.snapshot());
}

#[test]
fn test_cancelled_commands_never_apply() {
    let (mut sim, unit) = corridor_peer();
    let mut schedule = CommandSchedule::new();
    schedule.insert(Command::new(3, 0, unit, 0, Action::Move { to: cell(2, 5) }));
    fixtures::run_schedule(&mut sim, &mut schedule, 2);

    assert_eq!(schedule.cancel_from(0, 2), 1);
    fixtures::run_schedule(&mut sim, &mut schedule, 10);
    assert_eq!(sim.entities().get(unit).unwrap().cell, cell(1, 1));
}
