//! Player commands and the per-tick command schedule.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::components::{BlueprintId, PlayerId, UnitId};
use crate::map::GridPos;

/// Simulation time, in ticks.
pub type GameTick = u64;

/// What a command asks a unit to do.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Action {
    /// Walk to a cell.
    Move {
        /// Destination.
        to: GridPos,
    },
    /// Chase and attack a unit.
    Attack {
        /// Target unit.
        target: UnitId,
    },
    /// Drop the current order.
    Stop,
    /// Gather from a resource cell.
    Harvest {
        /// Resource cell.
        at: GridPos,
    },
    /// Place and construct a structure.
    Build {
        /// Structure blueprint.
        blueprint: BlueprintId,
        /// Top-left cell.
        at: GridPos,
    },
    /// Queue a unit at a producing structure.
    Produce {
        /// Unit blueprint.
        blueprint: BlueprintId,
    },
}

/// An instruction for one unit, scheduled for one tick.
///
/// Immutable once broadcast: the network layer may rewrite `issuer` and
/// `tick` on receipt, never after.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Command {
    /// Tick the command executes on.
    pub tick: GameTick,
    /// Player that issued it.
    pub issuer: PlayerId,
    /// Unit the command is for.
    pub unit: UnitId,
    /// Per-issuer sequence number.
    pub seq: u32,
    /// The instruction.
    pub action: Action,
}

impl Command {
    /// Create a command.
    #[must_use]
    pub const fn new(
        tick: GameTick,
        issuer: PlayerId,
        unit: UnitId,
        seq: u32,
        action: Action,
    ) -> Self {
        Self {
            tick,
            issuer,
            unit,
            seq,
            action,
        }
    }

    /// Application order within a tick.
    #[must_use]
    pub const fn sort_key(&self) -> (UnitId, u32, PlayerId) {
        (self.unit, self.seq, self.issuer)
    }
}

/// Sort commands into application order: by unit, then sequence number,
/// then issuer, with the action as a final tie-breaker.
pub fn sort_commands(commands: &mut [Command]) {
    commands.sort_by(|a, b| {
        a.sort_key()
            .cmp(&b.sort_key())
            .then_with(|| a.action.cmp(&b.action))
    });
}

/// Commands waiting for their tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSchedule {
    pending: BTreeMap<GameTick, Vec<Command>>,
}

impl CommandSchedule {
    /// Create an empty schedule.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a command under its own tick.
    pub fn insert(&mut self, command: Command) {
        self.pending.entry(command.tick).or_default().push(command);
    }

    /// Remove and return the commands for `tick`, in application order.
    pub fn take(&mut self, tick: GameTick) -> Vec<Command> {
        let mut commands = self.pending.remove(&tick).unwrap_or_default();
        sort_commands(&mut commands);
        commands
    }

    /// Commands currently scheduled for `tick`, unsorted.
    #[must_use]
    pub fn peek(&self, tick: GameTick) -> &[Command] {
        self.pending.get(&tick).map_or(&[], Vec::as_slice)
    }

    /// Drop every command from `issuer` scheduled at or after `from`.
    /// Returns how many were removed.
    pub fn cancel_from(&mut self, issuer: PlayerId, from: GameTick) -> usize {
        let mut removed = 0;
        for commands in self.pending.range_mut(from..).map(|(_, v)| v) {
            let before = commands.len();
            commands.retain(|c| c.issuer != issuer);
            removed += before - commands.len();
        }
        self.pending.retain(|_, commands| !commands.is_empty());
        removed
    }

    /// Number of pending commands.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }

    /// True if nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Earliest tick with pending commands.
    #[must_use]
    pub fn first_tick(&self) -> Option<GameTick> {
        self.pending.keys().next().copied()
    }

    /// All pending commands in tick order.
    pub fn iter(&self) -> impl Iterator<Item = &Command> {
        self.pending.values().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mv(tick: GameTick, issuer: PlayerId, unit: UnitId, seq: u32) -> Command {
        Command::new(
            tick,
            issuer,
            unit,
            seq,
            Action::Move {
                to: GridPos::new(1, 1),
            },
        )
    }

    #[test]
    fn test_sort_ignores_arrival_order() {
        let mut a = vec![mv(1, 1, 7, 0), mv(1, 0, 3, 2), mv(1, 0, 3, 1), mv(1, 0, 7, 0)];
        let mut b = a.clone();
        b.reverse();
        sort_commands(&mut a);
        sort_commands(&mut b);
        assert_eq!(a, b);
        let keys: Vec<_> = a.iter().map(Command::sort_key).collect();
        assert_eq!(keys, vec![(3, 1, 0), (3, 2, 0), (7, 0, 0), (7, 0, 1)]);
    }

    #[test]
    fn test_schedule_take() {
        let mut schedule = CommandSchedule::new();
        schedule.insert(mv(5, 0, 2, 0));
        schedule.insert(mv(5, 1, 1, 0));
        schedule.insert(mv(6, 0, 1, 1));
        assert_eq!(schedule.len(), 3);
        assert_eq!(schedule.first_tick(), Some(5));

        let due = schedule.take(5);
        assert_eq!(due.len(), 2);
        assert_eq!(due[0].unit, 1);
        assert!(schedule.take(5).is_empty());
        assert_eq!(schedule.len(), 1);
    }

    #[test]
    fn test_cancel_from_only_future_ticks_of_issuer() {
        let mut schedule = CommandSchedule::new();
        schedule.insert(mv(3, 1, 1, 0));
        schedule.insert(mv(4, 1, 1, 1));
        schedule.insert(mv(4, 0, 2, 0));
        schedule.insert(mv(9, 1, 1, 2));

        assert_eq!(schedule.cancel_from(1, 4), 2);
        assert_eq!(schedule.peek(3).len(), 1);
        assert_eq!(schedule.peek(4).len(), 1);
        assert_eq!(schedule.peek(4)[0].issuer, 0);
        assert!(schedule.peek(9).is_empty());
        assert_eq!(schedule.len(), 2);
    }
}
