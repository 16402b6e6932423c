//! Replay system for recording and playing back games.
//!
//! Replays store the initial simulation state and the stream of commands
//! applied during the game. Because the core is deterministic, that is
//! enough to recreate any tick and to check the final checksum.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::command::{Command, CommandSchedule, GameTick};
use crate::error::{GameError, Result};
use crate::file_format::FileKind;
use crate::simulation::{Checksum, Simulation};

/// Replay file format version for compatibility.
pub const REPLAY_VERSION: u32 = 2;

const REPLAY_FILE: FileKind = FileKind {
    name: "replay",
    magic: *b"RTSR",
    version: REPLAY_VERSION,
};

/// Complete replay data structure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Replay {
    /// Serialized initial simulation state.
    pub initial_state: Vec<u8>,
    /// Tick of the initial state.
    pub start_tick: GameTick,
    /// Applied commands in tick order.
    pub commands: Vec<Command>,
    /// Tick the recording ended on (exclusive).
    pub final_tick: GameTick,
    /// Checksum after the last recorded tick.
    pub final_checksum: Checksum,
}

impl Replay {
    /// Start recording from a simulation's current state.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be serialized.
    pub fn new(initial_state: &Simulation) -> Result<Self> {
        Ok(Self {
            initial_state: initial_state.serialize()?,
            start_tick: initial_state.tick(),
            commands: Vec::new(),
            final_tick: initial_state.tick(),
            final_checksum: initial_state.state_hash(),
        })
    }

    /// Record the commands applied on one tick.
    pub fn record(&mut self, commands: &[Command]) {
        self.commands.extend_from_slice(commands);
    }

    /// Seal the recording with the simulation's current tick and checksum.
    pub fn finalize(&mut self, simulation: &Simulation) {
        self.final_tick = simulation.tick();
        self.final_checksum = simulation.state_hash();
    }

    /// Save the replay to a file.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or file writing fails.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path.as_ref(), REPLAY_FILE.encode(self)?)?;
        tracing::info!(
            path = %path.as_ref().display(),
            commands = self.commands.len(),
            final_tick = self.final_tick,
            "replay saved"
        );
        Ok(())
    }

    /// Load a replay from a file.
    ///
    /// # Errors
    ///
    /// Returns [`GameError::VersionMismatch`] for a replay from another
    /// format version, checked before the body is decoded. Otherwise returns
    /// an error if reading or decoding fails.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        REPLAY_FILE.decode(&bytes)
    }

    /// Get the initial simulation state for playback.
    ///
    /// # Errors
    ///
    /// Returns an error if state deserialization fails.
    pub fn restore_initial_state(&self) -> Result<Simulation> {
        Simulation::deserialize(&self.initial_state)
    }

    /// Commands recorded for a specific tick.
    pub fn commands_at_tick(&self, tick: GameTick) -> impl Iterator<Item = &Command> {
        self.commands.iter().filter(move |c| c.tick == tick)
    }

    /// Number of recorded ticks.
    #[must_use]
    pub const fn duration(&self) -> u64 {
        self.final_tick.saturating_sub(self.start_tick)
    }
}

/// Replay playback controller.
#[derive(Debug)]
pub struct ReplayPlayer {
    replay: Replay,
    simulation: Simulation,
    schedule: CommandSchedule,
    /// Whether playback is paused.
    pub paused: bool,
}

impl ReplayPlayer {
    /// Create a player positioned at the replay's first tick.
    ///
    /// # Errors
    ///
    /// Returns an error if the initial state cannot be restored.
    pub fn new(replay: Replay) -> Result<Self> {
        let simulation = replay.restore_initial_state()?;
        let schedule = Self::schedule_for(&replay);
        Ok(Self {
            replay,
            simulation,
            schedule,
            paused: false,
        })
    }

    fn schedule_for(replay: &Replay) -> CommandSchedule {
        let mut schedule = CommandSchedule::new();
        for command in &replay.commands {
            schedule.insert(command.clone());
        }
        schedule
    }

    /// Advance the replay by one tick.
    ///
    /// Returns true if there are more ticks to play.
    ///
    /// # Errors
    ///
    /// Returns an error if the simulation rejects the tick.
    pub fn advance(&mut self) -> Result<bool> {
        if !self.paused && !self.is_finished() {
            let tick = self.simulation.tick();
            let commands = self.schedule.take(tick);
            self.simulation.advance_tick(&commands)?;
        }
        Ok(!self.is_finished())
    }

    /// Rewind to the initial state and play forward to `target`.
    ///
    /// # Errors
    ///
    /// Returns an error if state restoration or any tick fails.
    pub fn seek(&mut self, target: GameTick) -> Result<()> {
        self.simulation = self.replay.restore_initial_state()?;
        self.schedule = Self::schedule_for(&self.replay);
        let target = target.min(self.replay.final_tick);
        while self.simulation.tick() < target {
            let tick = self.simulation.tick();
            let commands = self.schedule.take(tick);
            self.simulation.advance_tick(&commands)?;
        }
        Ok(())
    }

    /// Current playback tick.
    #[must_use]
    pub const fn current_tick(&self) -> GameTick {
        self.simulation.tick()
    }

    /// The simulation being played.
    #[must_use]
    pub const fn simulation(&self) -> &Simulation {
        &self.simulation
    }

    /// The replay being played.
    #[must_use]
    pub const fn replay(&self) -> &Replay {
        &self.replay
    }

    /// Check if the replay has finished.
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        self.simulation.tick() >= self.replay.final_tick
    }

    /// Replay from the start and compare the final checksum.
    ///
    /// # Errors
    ///
    /// Returns [`GameError::DesyncDetected`] if the checksum differs, or any
    /// error raised while replaying.
    pub fn verify(&mut self) -> Result<()> {
        self.seek(self.replay.final_tick)?;
        let local = self.simulation.state_hash();
        if local != self.replay.final_checksum {
            return Err(GameError::DesyncDetected {
                tick: self.replay.final_tick.saturating_sub(1),
                local,
                remote: self.replay.final_checksum,
            });
        }
        Ok(())
    }

    /// Toggle pause state.
    pub fn toggle_pause(&mut self) {
        self.paused = !self.paused;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Action;
    use crate::map::{AnnotatedMap, GridPos};
    use crate::settings::{ids, SimSettings};

    fn recorded_game() -> (Replay, Simulation) {
        let mut sim =
            Simulation::new(SimSettings::default(), AnnotatedMap::new(12, 12).unwrap()).unwrap();
        let worker = sim.spawn_unit(0, ids::WORKER, GridPos::new(1, 1)).unwrap();
        let trooper = sim.spawn_unit(1, ids::TROOPER, GridPos::new(9, 9)).unwrap();
        let mut replay = Replay::new(&sim).unwrap();

        for tick in 0..30 {
            let commands = match tick {
                2 => vec![Command::new(2, 0, worker, 0, Action::Move { to: GridPos::new(8, 3) })],
                5 => vec![Command::new(5, 1, trooper, 0, Action::Attack { target: worker })],
                _ => Vec::new(),
            };
            sim.advance_tick(&commands).unwrap();
            replay.record(&commands);
        }
        replay.finalize(&sim);
        (replay, sim)
    }

    #[test]
    fn test_replay_create() {
        let sim = Simulation::new(SimSettings::default(), AnnotatedMap::new(4, 4).unwrap()).unwrap();
        let replay = Replay::new(&sim).unwrap();
        assert!(replay.commands.is_empty());
        assert_eq!(replay.duration(), 0);
    }

    #[test]
    fn test_replay_record_commands() {
        let (replay, _) = recorded_game();
        assert_eq!(replay.commands.len(), 2);
        assert_eq!(replay.commands_at_tick(2).count(), 1);
        assert_eq!(replay.commands_at_tick(3).count(), 0);
        assert_eq!(replay.duration(), 30);
    }

    #[test]
    fn test_replay_verify() {
        let (replay, sim) = recorded_game();
        assert_eq!(replay.final_checksum, sim.state_hash());

        let mut player = ReplayPlayer::new(replay).unwrap();
        player.verify().unwrap();
        assert!(player.is_finished());
        assert_eq!(player.simulation().state_hash(), sim.state_hash());
    }

    #[test]
    fn test_replay_verify_detects_tampering() {
        let (mut replay, _) = recorded_game();
        replay.commands.pop();
        let mut player = ReplayPlayer::new(replay).unwrap();
        assert!(matches!(
            player.verify(),
            Err(GameError::DesyncDetected { tick: 29, .. })
        ));
    }

    #[test]
    fn test_replay_save_load() {
        let (replay, _) = recorded_game();
        let temp_path = std::env::temp_dir().join("rts_core_test_replay.bin");
        replay.save(&temp_path).unwrap();

        let loaded = Replay::load(&temp_path).unwrap();
        assert_eq!(loaded, replay);

        let _ = std::fs::remove_file(temp_path);
    }

    #[test]
    fn test_replay_load_rejects_other_version() {
        let (replay, _) = recorded_game();
        let temp_path = std::env::temp_dir().join("rts_core_test_replay_version.bin");
        let newer = REPLAY_VERSION + 1;
        std::fs::write(&temp_path, REPLAY_FILE.encode_as(newer, &replay).unwrap()).unwrap();
        assert!(matches!(
            Replay::load(&temp_path),
            Err(GameError::VersionMismatch { kind: "replay", found, .. }) if found == newer
        ));

        // A bare body without the header is not a replay file.
        std::fs::write(&temp_path, bincode::serialize(&replay).unwrap()).unwrap();
        assert!(matches!(
            Replay::load(&temp_path),
            Err(GameError::Serialization(_))
        ));
        let _ = std::fs::remove_file(temp_path);
    }

    #[test]
    fn test_replay_player_advance_and_pause() {
        let (replay, _) = recorded_game();
        let mut player = ReplayPlayer::new(replay).unwrap();

        for _ in 0..5 {
            assert!(player.advance().unwrap());
        }
        assert_eq!(player.current_tick(), 5);

        player.paused = true;
        player.advance().unwrap();
        assert_eq!(player.current_tick(), 5);

        player.toggle_pause();
        while player.advance().unwrap() {}
        assert!(player.is_finished());
        assert_eq!(player.current_tick(), 30);
    }

    #[test]
    fn test_replay_player_seek() {
        let (replay, _) = recorded_game();
        let mut player = ReplayPlayer::new(replay).unwrap();

        player.seek(20).unwrap();
        assert_eq!(player.current_tick(), 20);
        let at_twenty = player.simulation().state_hash();

        player.seek(10).unwrap();
        assert_eq!(player.current_tick(), 10);
        player.seek(20).unwrap();
        assert_eq!(player.simulation().state_hash(), at_twenty);

        player.seek(500).unwrap();
        assert!(player.is_finished());
    }
}
