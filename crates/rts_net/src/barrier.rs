//! The lockstep barrier: the synchronous core of the server.
//!
//! The barrier owns the authoritative view of a match's tick sequence. It
//! collects commands, decides when a tick may be sealed, and compares the
//! checksums peers report for applied ticks. It does no IO, so every rule
//! can be tested without sockets:
//!
//! - Tick `N + 1` is sealed only after every connected slot acknowledged `N`.
//! - Nothing is sealed while a slot sits in its disconnect grace period.
//! - Commands for an already sealed tick move to the next unsealed tick.
//! - Disagreeing checksums for one tick halt the barrier for good.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use rts_core::command::{Command, CommandSchedule, GameTick};
use rts_core::components::PlayerId;
use rts_core::simulation::Checksum;

/// What happens to a slot whose connection drops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisconnectPolicy {
    /// Drop the slot at once; the match continues without it.
    Exclude,
    /// Hold the match for `grace_ms`, then drop the slot.
    Pause {
        /// Grace period in milliseconds.
        grace_ms: u64,
    },
}

impl Default for DisconnectPolicy {
    fn default() -> Self {
        Self::Pause { grace_ms: 2000 }
    }
}

/// Connection state of one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Sending commands and acknowledging ticks.
    Connected,
    /// Lost. While `grace_until` is set the match is held; once it is
    /// `None` the slot never blocks a tick again.
    Disconnected {
        /// End of the grace period.
        grace_until: Option<Instant>,
    },
}

/// Something the server must tell its peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BarrierEvent {
    /// `tick` is sealed with exactly these commands.
    Advance {
        /// Sealed tick.
        tick: GameTick,
        /// Commands in application order.
        commands: Vec<Command>,
        /// Latest tick all connected slots agreed on.
        confirmed: Option<(GameTick, Checksum)>,
    },
    /// A slot's connection dropped.
    PeerLost {
        /// Lost slot.
        slot: PlayerId,
        /// First tick without the slot's commands.
        from_tick: GameTick,
        /// Pending commands that were dropped.
        cancelled: usize,
    },
    /// A lost slot's grace period ended, or the policy excludes at once.
    SlotExcluded {
        /// Excluded slot.
        slot: PlayerId,
    },
    /// Two slots disagree about a tick's checksum. The barrier is halted.
    Desync {
        /// Divergent tick.
        tick: GameTick,
        /// Slot whose acknowledgement revealed the mismatch.
        slot: PlayerId,
        /// Checksum already recorded by another slot.
        expected: Checksum,
        /// Checksum reported by `slot`.
        found: Checksum,
    },
}

/// Tick sequencing for one match.
#[derive(Debug)]
pub struct LockstepBarrier {
    slots: Vec<SlotState>,
    last_acked: Vec<Option<GameTick>>,
    policy: DisconnectPolicy,
    tick_interval: Duration,
    limit: Option<GameTick>,
    next_tick: GameTick,
    pending: CommandSchedule,
    acks: BTreeMap<GameTick, BTreeMap<PlayerId, Checksum>>,
    confirmed: Option<(GameTick, Checksum)>,
    last_seal: Option<Instant>,
    halted: Option<GameTick>,
}

impl LockstepBarrier {
    /// Barrier for `slots` connected players. Ticks are sealed at most once
    /// per `tick_interval`; with a `limit`, ticks `0..limit` are sealed.
    #[must_use]
    pub fn new(
        slots: u8,
        policy: DisconnectPolicy,
        tick_interval: Duration,
        limit: Option<GameTick>,
    ) -> Self {
        let count = usize::from(slots);
        Self {
            slots: vec![SlotState::Connected; count],
            last_acked: vec![None; count],
            policy,
            tick_interval,
            limit,
            next_tick: 0,
            pending: CommandSchedule::new(),
            acks: BTreeMap::new(),
            confirmed: None,
            last_seal: None,
            halted: None,
        }
    }

    /// Next tick to be sealed.
    #[must_use]
    pub const fn next_tick(&self) -> GameTick {
        self.next_tick
    }

    /// Latest tick every connected slot agreed on.
    #[must_use]
    pub const fn confirmed(&self) -> Option<(GameTick, Checksum)> {
        self.confirmed
    }

    /// Tick of the detected desync, if any.
    #[must_use]
    pub const fn halted(&self) -> Option<GameTick> {
        self.halted
    }

    /// State of `slot`, or `None` for an unknown slot.
    #[must_use]
    pub fn slot_state(&self, slot: PlayerId) -> Option<SlotState> {
        self.slots.get(usize::from(slot)).copied()
    }

    /// Commands waiting for their tick.
    #[must_use]
    pub const fn pending(&self) -> &CommandSchedule {
        &self.pending
    }

    fn is_connected(&self, slot: PlayerId) -> bool {
        self.slot_state(slot) == Some(SlotState::Connected)
    }

    fn connected(&self) -> impl Iterator<Item = PlayerId> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, state)| **state == SlotState::Connected)
            .filter_map(|(slot, _)| PlayerId::try_from(slot).ok())
    }

    /// Queue commands from `slot`. The issuer is overwritten with the slot
    /// and late commands move to the next unsealed tick. Commands from a
    /// slot that is not connected are dropped. Returns how many were queued.
    pub fn submit(&mut self, slot: PlayerId, commands: Vec<Command>) -> usize {
        if !self.is_connected(slot) || self.halted.is_some() {
            return 0;
        }
        let mut queued = 0;
        for mut command in commands {
            command.issuer = slot;
            if command.tick < self.next_tick {
                tracing::debug!(
                    slot,
                    requested = command.tick,
                    scheduled = self.next_tick,
                    "late command moved forward"
                );
                command.tick = self.next_tick;
            }
            self.pending.insert(command);
            queued += 1;
        }
        queued
    }

    /// Record that `slot` applied `tick` and ended with `checksum`.
    ///
    /// Returns a [`BarrierEvent::Desync`] if another slot reported a
    /// different checksum for the same tick.
    pub fn acknowledge(
        &mut self,
        slot: PlayerId,
        tick: GameTick,
        checksum: Checksum,
    ) -> Option<BarrierEvent> {
        if !self.is_connected(slot) || self.halted.is_some() {
            return None;
        }
        if tick >= self.next_tick {
            tracing::warn!(slot, tick, "acknowledgement for an unsealed tick ignored");
            return None;
        }
        if self.confirmed.is_some_and(|(confirmed, _)| tick <= confirmed) {
            return None;
        }

        let reports = self.acks.entry(tick).or_default();
        if let Some((&other, &expected)) = reports.iter().find(|(_, c)| **c != checksum) {
            tracing::error!(
                tick,
                slot,
                other,
                expected = format_args!("{expected:#010x}"),
                found = format_args!("{checksum:#010x}"),
                "checksum mismatch, halting match"
            );
            self.halted = Some(tick);
            return Some(BarrierEvent::Desync {
                tick,
                slot,
                expected,
                found: checksum,
            });
        }
        reports.insert(slot, checksum);

        let index = usize::from(slot);
        self.last_acked[index] = Some(self.last_acked[index].map_or(tick, |t| t.max(tick)));
        None
    }

    /// Mark `slot` as lost at `now`. Its commands from the next unsealed
    /// tick on are cancelled; sealed ticks stay as they are.
    pub fn disconnect(&mut self, slot: PlayerId, now: Instant) -> Vec<BarrierEvent> {
        if !self.is_connected(slot) {
            return Vec::new();
        }
        let from_tick = self.next_tick;
        let cancelled = self.pending.cancel_from(slot, from_tick);
        tracing::info!(slot, from_tick, cancelled, policy = ?self.policy, "peer lost");

        let mut events = vec![BarrierEvent::PeerLost {
            slot,
            from_tick,
            cancelled,
        }];
        self.slots[usize::from(slot)] = match self.policy {
            DisconnectPolicy::Exclude => {
                events.push(BarrierEvent::SlotExcluded { slot });
                SlotState::Disconnected { grace_until: None }
            }
            DisconnectPolicy::Pause { grace_ms } => SlotState::Disconnected {
                grace_until: Some(now + Duration::from_millis(grace_ms)),
            },
        };
        events
    }

    /// Drive the barrier at `now`: expire grace periods, confirm fully
    /// acknowledged ticks, and seal at most one tick.
    pub fn poll(&mut self, now: Instant) -> Vec<BarrierEvent> {
        let mut events = Vec::new();
        if self.halted.is_some() {
            return events;
        }

        for (slot, state) in self.slots.iter_mut().enumerate() {
            if let SlotState::Disconnected {
                grace_until: Some(until),
            } = *state
            {
                if now >= until {
                    *state = SlotState::Disconnected { grace_until: None };
                    if let Ok(slot) = PlayerId::try_from(slot) {
                        tracing::info!(slot, "grace period over, slot excluded");
                        events.push(BarrierEvent::SlotExcluded { slot });
                    }
                }
            }
        }

        self.confirm();

        if self.can_seal(now) {
            let tick = self.next_tick;
            let commands = self.pending.take(tick);
            tracing::trace!(tick, commands = commands.len(), "tick sealed");
            events.push(BarrierEvent::Advance {
                tick,
                commands,
                confirmed: self.confirmed,
            });
            self.next_tick += 1;
            self.last_seal = Some(now);
        }
        events
    }

    fn confirm(&mut self) {
        let connected: Vec<PlayerId> = self.connected().collect();
        if connected.is_empty() {
            return;
        }
        let mut newest = None;
        for (&tick, reports) in &self.acks {
            let Some(&checksum) = connected.iter().find_map(|slot| reports.get(slot)) else {
                break;
            };
            if connected.iter().all(|slot| reports.contains_key(slot)) {
                newest = Some((tick, checksum));
            } else {
                break;
            }
        }
        if let Some((tick, checksum)) = newest {
            self.confirmed = Some((tick, checksum));
            self.acks.retain(|&t, _| t > tick);
        }
    }

    fn can_seal(&self, now: Instant) -> bool {
        if self.limit.is_some_and(|limit| self.next_tick >= limit) {
            return false;
        }
        if self
            .slots
            .iter()
            .any(|state| matches!(state, SlotState::Disconnected { grace_until: Some(_) }))
        {
            return false;
        }
        if self.connected().next().is_none() {
            return false;
        }
        if self
            .last_seal
            .is_some_and(|last| now.saturating_duration_since(last) < self.tick_interval)
        {
            return false;
        }
        match self.next_tick.checked_sub(1) {
            None => true,
            Some(previous) => self
                .connected()
                .all(|slot| self.last_acked[usize::from(slot)].is_some_and(|t| t >= previous)),
        }
    }

    /// True once every tick up to the limit is sealed and acknowledged by
    /// every connected slot.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        let Some(limit) = self.limit else {
            return false;
        };
        if self.next_tick < limit {
            return false;
        }
        match limit.checked_sub(1) {
            None => true,
            Some(last) => self
                .connected()
                .all(|slot| self.last_acked[usize::from(slot)].is_some_and(|t| t >= last)),
        }
    }

    /// True once no slot is connected or in its grace period.
    #[must_use]
    pub fn is_abandoned(&self) -> bool {
        self.slots
            .iter()
            .all(|state| *state == SlotState::Disconnected { grace_until: None })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rts_core::command::Action;

    fn barrier(slots: u8, policy: DisconnectPolicy) -> LockstepBarrier {
        LockstepBarrier::new(slots, policy, Duration::ZERO, None)
    }

    fn stop(tick: GameTick, unit: u64) -> Command {
        Command::new(tick, 9, unit, 0, Action::Stop)
    }

    fn sealed(events: &[BarrierEvent]) -> Option<GameTick> {
        events.iter().find_map(|e| match e {
            BarrierEvent::Advance { tick, .. } => Some(*tick),
            _ => None,
        })
    }

    #[test]
    fn test_tick_zero_seals_without_acks() {
        let mut b = barrier(2, DisconnectPolicy::Exclude);
        assert_eq!(sealed(&b.poll(Instant::now())), Some(0));
        assert_eq!(b.next_tick(), 1);
    }

    #[test]
    fn test_next_tick_waits_for_every_ack() {
        let now = Instant::now();
        let mut b = barrier(2, DisconnectPolicy::Exclude);
        b.poll(now);

        assert_eq!(sealed(&b.poll(now)), None);
        assert!(b.acknowledge(0, 0, 7).is_none());
        assert_eq!(sealed(&b.poll(now)), None);
        assert!(b.acknowledge(1, 0, 7).is_none());
        assert_eq!(sealed(&b.poll(now)), Some(1));
        assert_eq!(b.confirmed(), Some((0, 7)));
    }

    #[test]
    fn test_confirmed_checksum_rides_on_next_advance() {
        let now = Instant::now();
        let mut b = barrier(1, DisconnectPolicy::Exclude);
        b.poll(now);
        b.acknowledge(0, 0, 11);
        let events = b.poll(now);
        assert!(events.contains(&BarrierEvent::Advance {
            tick: 1,
            commands: Vec::new(),
            confirmed: Some((0, 11)),
        }));
    }

    #[test]
    fn test_submit_overwrites_issuer_and_moves_late_commands() {
        let now = Instant::now();
        let mut b = barrier(1, DisconnectPolicy::Exclude);
        b.poll(now);
        b.acknowledge(0, 0, 1);

        assert_eq!(b.submit(0, vec![stop(0, 5), stop(3, 6)]), 2);
        let late: Vec<_> = b.pending().peek(1).to_vec();
        assert_eq!(late.len(), 1);
        assert_eq!(late[0].issuer, 0);
        assert_eq!(late[0].unit, 5);

        match b.poll(now).pop() {
            Some(BarrierEvent::Advance { tick, commands, .. }) => {
                assert_eq!(tick, 1);
                assert_eq!(commands, late);
            }
            other => panic!("expected advance, got {other:?}"),
        }
    }

    #[test]
    fn test_pacing_limits_seal_rate() {
        let start = Instant::now();
        let mut b = LockstepBarrier::new(
            1,
            DisconnectPolicy::Exclude,
            Duration::from_millis(50),
            None,
        );
        assert_eq!(sealed(&b.poll(start)), Some(0));
        b.acknowledge(0, 0, 1);
        assert_eq!(sealed(&b.poll(start + Duration::from_millis(10))), None);
        assert_eq!(sealed(&b.poll(start + Duration::from_millis(50))), Some(1));
    }

    #[test]
    fn test_disagreeing_checksums_halt() {
        let now = Instant::now();
        let mut b = barrier(2, DisconnectPolicy::Exclude);
        b.poll(now);
        b.acknowledge(0, 0, 1);
        let event = b.acknowledge(1, 0, 2);
        assert_eq!(
            event,
            Some(BarrierEvent::Desync {
                tick: 0,
                slot: 1,
                expected: 1,
                found: 2,
            })
        );
        assert_eq!(b.halted(), Some(0));
        assert!(b.poll(now).is_empty());
    }

    #[test]
    fn test_exclude_policy_cancels_and_continues() {
        let now = Instant::now();
        let mut b = barrier(2, DisconnectPolicy::Exclude);
        b.poll(now);
        b.submit(1, vec![stop(4, 1), stop(6, 2)]);
        b.submit(0, vec![stop(4, 3)]);
        b.acknowledge(0, 0, 1);

        let events = b.disconnect(1, now);
        assert_eq!(
            events,
            vec![
                BarrierEvent::PeerLost {
                    slot: 1,
                    from_tick: 1,
                    cancelled: 2,
                },
                BarrierEvent::SlotExcluded { slot: 1 },
            ]
        );
        assert_eq!(b.pending().len(), 1);
        assert_eq!(sealed(&b.poll(now)), Some(1));
        assert_eq!(b.submit(1, vec![stop(5, 1)]), 0);
    }

    #[test]
    fn test_pause_policy_holds_until_grace_expires() {
        let start = Instant::now();
        let mut b = barrier(2, DisconnectPolicy::Pause { grace_ms: 100 });
        b.poll(start);
        b.acknowledge(0, 0, 1);
        b.disconnect(1, start);

        assert_eq!(sealed(&b.poll(start + Duration::from_millis(50))), None);
        let events = b.poll(start + Duration::from_millis(100));
        assert!(events.contains(&BarrierEvent::SlotExcluded { slot: 1 }));
        assert_eq!(sealed(&events), Some(1));
        assert_eq!(
            b.slot_state(1),
            Some(SlotState::Disconnected { grace_until: None })
        );
    }

    #[test]
    fn test_limit_completes_match() {
        let now = Instant::now();
        let mut b = LockstepBarrier::new(1, DisconnectPolicy::Exclude, Duration::ZERO, Some(2));
        b.poll(now);
        b.acknowledge(0, 0, 1);
        b.poll(now);
        assert!(!b.is_complete());
        b.acknowledge(0, 1, 2);
        assert_eq!(sealed(&b.poll(now)), None);
        assert!(b.is_complete());
    }

    #[test]
    fn test_abandoned_after_everyone_leaves() {
        let now = Instant::now();
        let mut b = barrier(2, DisconnectPolicy::Exclude);
        b.disconnect(0, now);
        assert!(!b.is_abandoned());
        b.disconnect(1, now);
        assert!(b.is_abandoned());
        assert_eq!(sealed(&b.poll(now)), None);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Ack(PlayerId),
        Submit(PlayerId, GameTick),
        Disconnect(PlayerId),
        Poll(u64),
    }

    fn arb_op(slots: u8) -> impl Strategy<Value = Op> {
        prop_oneof![
            4 => (0..slots).prop_map(Op::Ack),
            2 => (0..slots, 0u64..20).prop_map(|(s, t)| Op::Submit(s, t)),
            1 => (0..slots).prop_map(Op::Disconnect),
            4 => (0u64..40).prop_map(Op::Poll),
        ]
    }

    proptest! {
        #[test]
        fn prop_never_seals_ahead_of_acks(
            grace in prop_oneof![Just(None), (0u64..60).prop_map(Some)],
            ops in proptest::collection::vec(arb_op(3), 1..120),
        ) {
            let policy = grace.map_or(DisconnectPolicy::Exclude, |grace_ms| {
                DisconnectPolicy::Pause { grace_ms }
            });
            let start = Instant::now();
            let mut now = start;
            let mut b = LockstepBarrier::new(3, policy, Duration::ZERO, None);
            // Highest tick each slot has applied, as the slot would see it.
            let mut applied: [Option<GameTick>; 3] = [None; 3];

            for op in ops {
                match op {
                    Op::Ack(slot) => {
                        let next = applied[usize::from(slot)].map_or(0, |t| t + 1);
                        if next < b.next_tick() {
                            b.acknowledge(slot, next, 42);
                            if b.slot_state(slot) == Some(SlotState::Connected) {
                                applied[usize::from(slot)] = Some(next);
                            }
                        }
                    }
                    Op::Submit(slot, tick) => {
                        b.submit(slot, vec![stop(tick, u64::from(slot))]);
                    }
                    Op::Disconnect(slot) => {
                        b.disconnect(slot, now);
                    }
                    Op::Poll(ms) => {
                        now += Duration::from_millis(ms);
                        for event in b.poll(now) {
                            if let BarrierEvent::Advance { tick, commands, .. } = event {
                                for command in &commands {
                                    prop_assert_eq!(command.tick, tick);
                                }
                                if let Some(previous) = tick.checked_sub(1) {
                                    for slot in 0..3u8 {
                                        if b.slot_state(slot) == Some(SlotState::Connected) {
                                            prop_assert!(
                                                applied[usize::from(slot)]
                                                    .is_some_and(|t| t >= previous),
                                                "tick {} sealed before slot {} acked {}",
                                                tick, slot, previous
                                            );
                                        }
                                    }
                                }
                            }
                        }
                    }
                }
            }
            prop_assert!(b.halted().is_none());
        }
    }
}
