//! Determinism testing utilities.
//!
//! Provides a harness for verifying that the simulation
//! produces identical results given identical inputs.
//!
//! # Testing Strategy
//!
//! Lockstep peers must stay bit-identical. Sources of non-determinism include:
//!
//! - **Floating-point math**: Different CPUs can produce different results.
//!   We use fixed-point arithmetic via [`rts_core::math::Fixed`] throughout.
//!
//! - **HashMap iteration order**: Rust's default hasher is randomized.
//!   We always iterate in sorted entity ID order.
//!
//! - **Command arrival order**: Commands reach peers in different orders.
//!   The simulation sorts them before applying.
//!
//! # Test Levels
//!
//! 1. **Unit tests**: Individual system determinism (movement, combat, etc.)
//! 2. **Property tests**: Random maps and command scripts still agree
//! 3. **Integration tests**: Full scenarios are reproducible
//! 4. **Parallel tests**: Running N simulations on N threads all match

use std::thread;

use rts_core::command::CommandSchedule;
use rts_core::simulation::{Checksum, Simulation};

/// Result of a determinism test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeterminismResult {
    /// Whether all runs produced identical results.
    pub is_deterministic: bool,
    /// Final checksum from each run.
    pub hashes: Vec<Checksum>,
    /// Number of ticks simulated.
    pub ticks: u64,
}

impl DeterminismResult {
    /// Get all unique hashes (should be 1 for deterministic simulation).
    #[must_use]
    pub fn unique_hashes(&self) -> Vec<Checksum> {
        let mut unique = self.hashes.clone();
        unique.sort_unstable();
        unique.dedup();
        unique
    }

    /// Assert that the simulation was deterministic, with a detailed error message.
    ///
    /// # Panics
    ///
    /// Panics if the runs produced different checksums.
    pub fn assert_deterministic(&self) {
        if !self.is_deterministic {
            let unique = self.unique_hashes();
            panic!(
                "Simulation is non-deterministic!\n\
                 Runs: {}\n\
                 Ticks: {}\n\
                 Unique hashes: {} (expected 1)\n\
                 All hashes: {:08x?}",
                self.hashes.len(),
                self.ticks,
                unique.len(),
                self.hashes
            );
        }
    }
}

/// Run a state machine multiple times and verify determinism.
///
/// # Arguments
///
/// * `runs` - Number of times to run
/// * `ticks` - Number of steps per run
/// * `setup` - Function to create initial state
/// * `step` - Function to advance state by one step
/// * `hash` - Function to compute the state checksum
pub fn verify_determinism<S, Setup, Step, HashFn>(
    runs: usize,
    ticks: u64,
    setup: Setup,
    step: Step,
    hash: HashFn,
) -> DeterminismResult
where
    Setup: Fn() -> S,
    Step: Fn(&mut S),
    HashFn: Fn(&S) -> Checksum,
{
    let mut hashes = Vec::with_capacity(runs);

    for _ in 0..runs {
        let mut state = setup();
        for _ in 0..ticks {
            step(&mut state);
        }
        hashes.push(hash(&state));
    }

    let is_deterministic = hashes.windows(2).all(|w| w[0] == w[1]);

    DeterminismResult {
        is_deterministic,
        hashes,
        ticks,
    }
}

/// A simulation paired with the commands it will be fed.
pub type Scenario = (Simulation, CommandSchedule);

/// Apply the scheduled commands for the next tick.
///
/// # Panics
///
/// Panics if the tick fails to apply.
pub fn step_scenario((sim, schedule): &mut Scenario) {
    let commands = schedule.take(sim.tick());
    if let Err(err) = sim.advance_tick(&commands) {
        panic!("tick {} failed: {err}", sim.tick());
    }
}

/// Checksum of a scenario's simulation.
pub fn final_checksum(scenario: &Scenario) -> Checksum {
    scenario.0.state_hash()
}

/// Run a scripted scenario twice and compare the final checksums.
///
/// # Panics
///
/// Panics if a tick fails to apply.
pub fn verify_simulation_determinism<F>(setup_fn: F, num_ticks: u64) -> bool
where
    F: Fn() -> Scenario,
{
    verify_determinism(2, num_ticks, &setup_fn, step_scenario, final_checksum).is_deterministic
}

/// Run N scenarios on scoped threads and collect the final checksums.
///
/// Catches non-determinism that only shows up under thread scheduling or
/// memory layout differences.
///
/// # Panics
///
/// Panics if a thread panics.
pub fn run_parallel_simulations<F>(setup_fn: F, num_sims: usize, num_ticks: u64) -> DeterminismResult
where
    F: Fn() -> Scenario + Sync,
{
    let hashes: Vec<Checksum> = thread::scope(|s| {
        let handles: Vec<_> = (0..num_sims)
            .map(|_| {
                s.spawn(|| {
                    let mut scenario = setup_fn();
                    for _ in 0..num_ticks {
                        step_scenario(&mut scenario);
                    }
                    scenario.0.state_hash()
                })
            })
            .collect();

        handles
            .into_iter()
            .map(|h| h.join().expect("simulation thread panicked"))
            .collect()
    });

    DeterminismResult {
        is_deterministic: hashes.windows(2).all(|w| w[0] == w[1]),
        hashes,
        ticks: num_ticks,
    }
}

/// Compare two runs tick-by-tick, finding the first divergence.
///
/// # Returns
///
/// `None` if the runs agree, `Some(tick)` for the first tick whose checksum
/// differs.
pub fn find_first_divergence<F>(setup_fn: F, num_ticks: u64) -> Option<u64>
where
    F: Fn() -> Scenario,
{
    let mut a = setup_fn();
    let mut b = setup_fn();

    for _ in 0..num_ticks {
        let tick = a.0.tick();
        step_scenario(&mut a);
        step_scenario(&mut b);
        if a.0.state_hash() != b.0.state_hash() {
            return Some(tick);
        }
    }
    None
}

/// Verify that a serialization round-trip mid-game does not change any later
/// checksum.
pub fn verify_serialization_determinism<F>(setup_fn: F, split_at: u64, num_ticks: u64) -> bool
where
    F: Fn() -> Scenario,
{
    let (mut sim, mut schedule) = setup_fn();
    let mut resumed_schedule = schedule.clone();
    let mut restored = None;

    for _ in 0..num_ticks {
        if sim.tick() == split_at {
            let Ok(bytes) = sim.serialize() else {
                return false;
            };
            let Ok(copy) = Simulation::deserialize(&bytes) else {
                return false;
            };
            if copy.state_hash() != sim.state_hash() {
                return false;
            }
            restored = Some(copy);
        }

        let tick = sim.tick();
        let Ok(report) = sim.advance_tick(&schedule.take(tick)) else {
            return false;
        };
        if let Some(copy) = restored.as_mut() {
            match copy.advance_tick(&resumed_schedule.take(tick)) {
                Ok(other) if other.checksum == report.checksum => {}
                _ => return false,
            }
        } else {
            resumed_schedule.take(tick);
        }
    }
    true
}

/// Proptest strategies for determinism testing.
///
/// These strategies generate random but reproducible inputs for
/// property-based testing of simulation determinism.
pub mod strategies {
    use proptest::prelude::*;
    use rts_core::command::{Action, Command, GameTick};
    use rts_core::components::UnitId;
    use rts_core::map::{AnnotatedMap, GridPos};

    /// Generate a cell inside a `width` x `height` map.
    pub fn arb_cell(width: u32, height: u32) -> impl Strategy<Value = GridPos> {
        (0..width, 0..height).prop_map(|(x, y)| GridPos::new(x, y))
    }

    /// Generate rows for a map with roughly one obstruction in `1 / density`
    /// cells. The top-left and bottom-right corners are always ground.
    pub fn arb_map_rows(width: usize, height: usize, density: u32) -> impl Strategy<Value = Vec<String>> {
        proptest::collection::vec(0..density.max(1), width * height).prop_map(move |noise| {
            (0..height)
                .map(|y| {
                    (0..width)
                        .map(|x| {
                            let corner = (x, y) == (0, 0) || (x, y) == (width - 1, height - 1);
                            if !corner && noise[y * width + x] == 0 {
                                '#'
                            } else {
                                '.'
                            }
                        })
                        .collect::<String>()
                })
                .collect::<Vec<_>>()
        })
    }

    /// Generate a map with random obstructions.
    pub fn arb_map(width: usize, height: usize, density: u32) -> impl Strategy<Value = AnnotatedMap> {
        arb_map_rows(width, height, density).prop_filter_map("invalid map rows", |rows| {
            let rows: Vec<&str> = rows.iter().map(String::as_str).collect();
            AnnotatedMap::from_rows(&rows).ok()
        })
    }

    /// Generate an action that needs no target entity.
    pub fn arb_action(width: u32, height: u32) -> impl Strategy<Value = Action> {
        prop_oneof![
            4 => arb_cell(width, height).prop_map(|to| Action::Move { to }),
            1 => Just(Action::Stop),
        ]
    }

    /// Generate a command for one of `units`, issued by `issuer`, at a tick
    /// below `max_tick`.
    pub fn arb_command(
        units: Vec<UnitId>,
        issuer: u8,
        max_tick: GameTick,
        width: u32,
        height: u32,
    ) -> impl Strategy<Value = Command> {
        (
            0..max_tick,
            proptest::sample::select(units),
            0u32..8,
            arb_action(width, height),
        )
            .prop_map(move |(tick, unit, seq, action)| {
                Command::new(tick, issuer, unit, seq, action)
            })
    }

    /// Generate a sequence of commands.
    pub fn arb_command_script(
        units: Vec<UnitId>,
        issuer: u8,
        max_tick: GameTick,
        width: u32,
        height: u32,
        max_len: usize,
    ) -> impl Strategy<Value = Vec<Command>> {
        proptest::collection::vec(
            arb_command(units, issuer, max_tick, width, height),
            0..max_len,
        )
    }
}
