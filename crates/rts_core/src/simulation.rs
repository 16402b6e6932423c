//! Core simulation loop.
//!
//! [`Simulation`] owns the map, the entities, per-player state and the
//! route planner, and advances them one tick per [`Simulation::advance_tick`]
//! call. Every peer in a lockstep match runs its own instance and feeds it
//! the same commands for the same tick.
//!
//! # Determinism
//!
//! - No floating-point math (fixed-point via [`Fixed`])
//! - No randomness
//! - Entities are processed in sorted ID order
//! - Commands are applied in `(unit, seq, issuer)` order, never arrival order
//!
//! After each tick a rolling CRC-32 over the previous checksum and the
//! canonical state bytes is recorded. Peers exchange these to detect
//! desyncs. A detected desync halts the simulation for good.
//!
//! # Example
//!
//! ```
//! use rts_core::command::{Action, Command};
//! use rts_core::map::{AnnotatedMap, GridPos};
//! use rts_core::settings::{ids, SimSettings};
//! use rts_core::simulation::Simulation;
//!
//! let map = AnnotatedMap::new(16, 16).unwrap();
//! let mut sim = Simulation::new(SimSettings::default(), map).unwrap();
//! let worker = sim.spawn_unit(0, ids::WORKER, GridPos::new(1, 1)).unwrap();
//!
//! let order = Command::new(0, 0, worker, 0, Action::Move { to: GridPos::new(5, 1) });
//! let report = sim.advance_tick(&[order]).unwrap();
//! assert_eq!(report.tick, 0);
//! assert_eq!(sim.tick(), 1);
//! ```

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::command::{sort_commands, Action, Command, GameTick};
use crate::components::{
    step_cost, BlueprintId, Entity, EntityStorage, Order, PlayerId, Producer, Route, Structure,
    UnitId, Vitals,
};
use crate::error::{GameError, Result};
use crate::map::{AnnotatedMap, Footprint, GridPos, Surface};
use crate::math::Vec2Fixed;
use crate::route::{PathRequest, RoutePlanner};
use crate::search::{PathQuery, PathResult, PathStatus};
use crate::settings::{Blueprint, MobilitySpec, SimSettings};

/// Rolling state checksum.
pub type Checksum = u32;

/// Per-player economy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PlayerState {
    /// Spendable resources.
    pub resources: u32,
}

/// Why a command was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    /// The unit does not exist.
    UnknownUnit,
    /// The issuer does not own the unit.
    NotOwner,
    /// The unit lacks the capability the action needs.
    MissingCapability,
    /// A target cell is outside the map.
    OutOfRange,
    /// The target unit does not exist, is the unit itself, or cannot be attacked.
    InvalidTarget,
    /// The blueprint is unknown or not allowed here.
    InvalidBlueprint,
    /// The target cell holds no resources.
    NoResource,
    /// The issuer cannot pay.
    CannotAfford,
}

/// Why a construction order failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuildFailure {
    /// The owner could not pay when the builder arrived.
    CannotAfford,
    /// The footprint was obstructed or occupied.
    Blocked,
}

/// Something that happened during a tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TickEvent {
    /// A command was dropped without effect.
    CommandRejected {
        /// Target unit.
        unit: UnitId,
        /// Issuing player.
        issuer: PlayerId,
        /// Cause.
        reason: RejectReason,
    },
    /// A unit's goal lies outside its connected region. The order was dropped.
    RouteUnreachable {
        /// The unit.
        unit: UnitId,
        /// The goal that cannot be reached.
        goal: GridPos,
    },
    /// A unit reached its move goal.
    Arrived {
        /// The unit.
        unit: UnitId,
        /// Its cell.
        cell: GridPos,
    },
    /// A unit cannot get any closer to its goal. The order was dropped.
    Stuck {
        /// The unit.
        unit: UnitId,
        /// Where it stopped.
        cell: GridPos,
    },
    /// A weapon hit.
    Damaged {
        /// Shooter.
        attacker: UnitId,
        /// Victim.
        target: UnitId,
        /// Damage dealt.
        amount: u32,
    },
    /// An entity was destroyed and removed.
    Died {
        /// The entity.
        unit: UnitId,
        /// Its owner.
        owner: PlayerId,
    },
    /// A structure finished producing a unit.
    Produced {
        /// Producing structure.
        structure: UnitId,
        /// New unit.
        unit: UnitId,
    },
    /// A builder placed a construction site.
    ConstructionStarted {
        /// Builder.
        builder: UnitId,
        /// New site.
        site: UnitId,
    },
    /// A structure finished construction.
    ConstructionComplete {
        /// The structure.
        site: UnitId,
    },
    /// A builder could not place its structure. The order was dropped.
    BuildFailed {
        /// Builder.
        unit: UnitId,
        /// Cause.
        reason: BuildFailure,
    },
    /// A resource cell ran dry while being harvested.
    ResourceDepleted {
        /// Harvester.
        unit: UnitId,
        /// Cell.
        at: GridPos,
    },
}

/// Outcome of one tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickReport {
    /// Tick that was applied.
    pub tick: GameTick,
    /// Rolling checksum after the tick.
    pub checksum: Checksum,
    /// Events in the order they happened.
    pub events: Vec<TickEvent>,
}

/// Read-only view of one entity for renderers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitView {
    /// Entity ID.
    pub id: UnitId,
    /// Owner.
    pub owner: PlayerId,
    /// Blueprint.
    pub blueprint: BlueprintId,
    /// Top-left cell.
    pub cell: GridPos,
    /// Interpolated world position.
    pub position: Vec2Fixed,
    /// Current and maximum health, if attackable.
    pub health: Option<(u32, u32)>,
    /// Whether this is an unfinished structure.
    pub under_construction: bool,
}

/// Read-only view of the world, polled once per rendered frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorldSnapshot {
    /// Next tick to be applied.
    pub tick: GameTick,
    /// Entities in ID order.
    pub units: Vec<UnitView>,
    /// Resources per player.
    pub resources: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
enum Halt {
    Desync {
        tick: GameTick,
        local: Checksum,
        remote: Checksum,
    },
    /// A system failed partway through a tick; the state is not trusted.
    Fault { tick: GameTick, message: String },
}

impl Halt {
    fn to_error(&self) -> GameError {
        match self {
            Self::Desync {
                tick,
                local,
                remote,
            } => GameError::DesyncDetected {
                tick: *tick,
                local: *local,
                remote: *remote,
            },
            Self::Fault { tick, message } => GameError::InvalidState(format!(
                "simulation halted after a fault at tick {tick}: {message}"
            )),
        }
    }
}

/// What the movement system should do with a unit this tick.
enum Intent {
    /// Within reach of the order's target: stand still.
    Hold,
    /// Follow a route to a cell.
    Travel(GridPos),
    /// No passable cell next to the target.
    Unreachable(GridPos),
}

/// The core game simulation.
///
/// # System Execution Order
///
/// Each tick runs, in order:
/// 1. **Commands** - validate and apply, sorted by `(unit, seq, issuer)`
/// 2. **Production** - advance structure queues, spawn finished units
/// 3. **Movement** - plan and follow routes, repath blocked units
/// 4. **Combat** - fire ready weapons at targets in range
/// 5. **Harvest and build** - gather resources, found and raise structures
/// 6. **Deaths** - remove destroyed entities
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Simulation {
    tick: GameTick,
    settings: SimSettings,
    map: AnnotatedMap,
    entities: EntityStorage,
    players: Vec<PlayerState>,
    planner: RoutePlanner,
    checksum: Checksum,
    history: VecDeque<(GameTick, Checksum)>,
    halted: Option<Halt>,
}

impl Simulation {
    /// Create a simulation at tick 0.
    ///
    /// # Errors
    ///
    /// Returns [`GameError::InvalidState`] if the settings do not validate.
    pub fn new(settings: SimSettings, map: AnnotatedMap) -> Result<Self> {
        settings.validate()?;
        let players = vec![
            PlayerState {
                resources: settings.starting_resources,
            };
            usize::from(settings.players)
        ];
        let planner = RoutePlanner::new(settings.planner);
        Ok(Self {
            tick: 0,
            settings,
            map,
            entities: EntityStorage::new(),
            players,
            planner,
            checksum: 0,
            history: VecDeque::new(),
            halted: None,
        })
    }

    /// Next tick to be applied. Equals the number of ticks applied so far.
    #[must_use]
    pub const fn tick(&self) -> GameTick {
        self.tick
    }

    /// Settings this simulation was created with.
    #[must_use]
    pub const fn settings(&self) -> &SimSettings {
        &self.settings
    }

    /// The annotated map.
    #[must_use]
    pub const fn map(&self) -> &AnnotatedMap {
        &self.map
    }

    /// All entities.
    #[must_use]
    pub const fn entities(&self) -> &EntityStorage {
        &self.entities
    }

    /// Look up one entity.
    ///
    /// # Errors
    ///
    /// Returns [`GameError::EntityNotFound`] if no live entity has `id`.
    pub fn unit(&self, id: UnitId) -> Result<&Entity> {
        self.entities.get(id).ok_or(GameError::EntityNotFound(id))
    }

    /// The route planner.
    #[must_use]
    pub const fn planner(&self) -> &RoutePlanner {
        &self.planner
    }

    /// A player's economy.
    #[must_use]
    pub fn player(&self, player: PlayerId) -> Option<&PlayerState> {
        self.players.get(usize::from(player))
    }

    /// Checksum after the most recently applied tick, or 0 before the first.
    #[must_use]
    pub const fn state_hash(&self) -> Checksum {
        self.checksum
    }

    /// True once a desync has been detected or a tick failed partway.
    #[must_use]
    pub const fn is_halted(&self) -> bool {
        self.halted.is_some()
    }

    /// Checksum recorded after `tick`.
    ///
    /// # Errors
    ///
    /// Returns [`GameError::ChecksumUnavailable`] if `tick` has not been
    /// applied yet or has fallen out of the history window.
    pub fn checksum_at(&self, tick: GameTick) -> Result<Checksum> {
        self.history
            .iter()
            .find(|(t, _)| *t == tick)
            .map(|(_, checksum)| *checksum)
            .ok_or(GameError::ChecksumUnavailable(tick))
    }

    /// Compare a peer's checksum for `tick` with ours. On mismatch the
    /// simulation halts and every later call to
    /// [`advance_tick`](Self::advance_tick) fails.
    ///
    /// # Errors
    ///
    /// Returns [`GameError::DesyncDetected`] on mismatch, or
    /// [`GameError::ChecksumUnavailable`] if no local checksum is recorded.
    pub fn verify_remote_checksum(&mut self, tick: GameTick, remote: Checksum) -> Result<()> {
        let local = self.checksum_at(tick)?;
        if local == remote {
            return Ok(());
        }
        tracing::error!(
            tick,
            local = format_args!("{local:#010x}"),
            remote = format_args!("{remote:#010x}"),
            "desync detected, halting simulation"
        );
        self.halted = Some(Halt::Desync {
            tick,
            local,
            remote,
        });
        Err(GameError::DesyncDetected {
            tick,
            local,
            remote,
        })
    }

    /// Place a new unit or finished structure outside of tick processing,
    /// e.g. for the starting setup.
    ///
    /// # Errors
    ///
    /// Returns [`GameError::OutOfRange`] if the cell is off the map, or
    /// [`GameError::InvalidState`] for an unknown owner or blueprint or a
    /// blocked footprint.
    pub fn spawn_unit(
        &mut self,
        owner: PlayerId,
        blueprint: BlueprintId,
        cell: GridPos,
    ) -> Result<UnitId> {
        if usize::from(owner) >= self.players.len() {
            return Err(GameError::InvalidState(format!("unknown player {owner}")));
        }
        let spec = self.settings.blueprint(blueprint)?;
        let surface = spec.mobility.map_or(Surface::Land, |m| m.surface);
        if !self.map.can_occupy(cell, surface, spec.size(), None)? {
            return Err(GameError::InvalidState(format!(
                "cannot place blueprint {blueprint} at ({}, {})",
                cell.x, cell.y
            )));
        }
        let id = self.insert_entity(owner, blueprint, cell, false)?;
        self.sync_planner();
        Ok(id)
    }

    /// Advance the simulation by exactly one tick.
    ///
    /// Every command must be scheduled for the current tick. Invalid
    /// commands (unknown unit, wrong owner, missing capability) are
    /// rejected and reported in the events; they never abort the tick.
    ///
    /// # Errors
    ///
    /// Returns [`GameError::DesyncDetected`] once halted by a desync, or
    /// [`GameError::InvalidState`] if a command carries another tick. In
    /// both cases nothing is mutated. If a system fails after commands were
    /// applied, the simulation halts: that error is returned and every later
    /// call fails with [`GameError::InvalidState`].
    pub fn advance_tick(&mut self, commands: &[Command]) -> Result<TickReport> {
        if let Some(halt) = &self.halted {
            return Err(halt.to_error());
        }
        if let Some(stray) = commands.iter().find(|c| c.tick != self.tick) {
            return Err(GameError::InvalidState(format!(
                "command for tick {} applied at tick {}",
                stray.tick, self.tick
            )));
        }

        let mut ordered = commands.to_vec();
        sort_commands(&mut ordered);
        let mut events = Vec::new();

        for command in &ordered {
            if let Err(reason) = self.apply_command(command) {
                tracing::debug!(
                    tick = self.tick,
                    unit = command.unit,
                    issuer = command.issuer,
                    ?reason,
                    "command rejected"
                );
                events.push(TickEvent::CommandRejected {
                    unit: command.unit,
                    issuer: command.issuer,
                    reason,
                });
            }
        }

        let checksum = match self.run_systems(&mut events) {
            Ok(checksum) => checksum,
            Err(err) => {
                tracing::error!(tick = self.tick, error = %err, "tick failed, halting simulation");
                self.halted = Some(Halt::Fault {
                    tick: self.tick,
                    message: err.to_string(),
                });
                return Err(err);
            }
        };

        let applied = self.tick;
        self.tick += 1;
        self.checksum = checksum;
        self.history.push_back((applied, self.checksum));
        while self.history.len() > self.settings.checksum_history {
            self.history.pop_front();
        }

        tracing::debug!(
            tick = applied,
            checksum = format_args!("{:#010x}", self.checksum),
            commands = ordered.len(),
            events = events.len(),
            "tick applied"
        );

        Ok(TickReport {
            tick: applied,
            checksum: self.checksum,
            events,
        })
    }

    /// Read-only view for renderers.
    #[must_use]
    pub fn snapshot(&self) -> WorldSnapshot {
        let units = self
            .entities
            .sorted_ids()
            .into_iter()
            .filter_map(|id| self.entities.get(id))
            .map(|entity| UnitView {
                id: entity.id,
                owner: entity.owner,
                blueprint: entity.blueprint,
                cell: entity.cell,
                position: entity.world_position(),
                health: entity.vitals.map(|v| (v.current, v.max)),
                under_construction: entity.structure.is_some_and(|s| !s.is_complete()),
            })
            .collect();
        WorldSnapshot {
            tick: self.tick,
            units,
            resources: self.players.iter().map(|p| p.resources).collect(),
        }
    }

    /// Canonical bytes of the simulation state, independent of hash map order.
    ///
    /// # Errors
    ///
    /// Returns [`GameError::Serialization`] if encoding fails.
    pub fn state_bytes(&self) -> Result<Vec<u8>> {
        self.state_bytes_at(self.tick)
    }

    fn state_bytes_at(&self, tick: GameTick) -> Result<Vec<u8>> {
        let entities: Vec<&Entity> = self
            .entities
            .sorted_ids()
            .into_iter()
            .filter_map(|id| self.entities.get(id))
            .collect();
        let bytes = bincode::serialize(&(
            tick,
            &self.map,
            self.entities.next_id(),
            &entities,
            &self.players,
            self.planner.cache(),
        ))?;
        Ok(bytes)
    }

    /// Run every system for the current tick and return the checksum the
    /// tick will record. The tick counter is not touched.
    fn run_systems(&mut self, events: &mut Vec<TickEvent>) -> Result<Checksum> {
        let ids = self.entities.sorted_ids();
        self.run_production_system(&ids, events)?;
        self.run_movement_system(&ids, events)?;
        self.run_combat_system(&ids, events);
        self.run_harvest_build_system(&ids, events)?;
        self.run_death_system(&ids, events)?;
        self.sync_planner();

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&self.checksum.to_be_bytes());
        hasher.update(&self.state_bytes_at(self.tick + 1)?);
        Ok(hasher.finalize())
    }

    /// Serialize the full simulation state.
    ///
    /// # Errors
    ///
    /// Returns [`GameError::Serialization`] if encoding fails.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Restore a simulation from [`serialize`](Self::serialize) output.
    ///
    /// # Errors
    ///
    /// Returns [`GameError::Serialization`] if decoding fails.
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    fn apply_command(&mut self, command: &Command) -> std::result::Result<(), RejectReason> {
        let entity = self
            .entities
            .get(command.unit)
            .ok_or(RejectReason::UnknownUnit)?;
        if entity.owner != command.issuer {
            return Err(RejectReason::NotOwner);
        }

        let order = match &command.action {
            Action::Stop => Order::Idle,
            Action::Move { to } => {
                if entity.mobility.is_none() {
                    return Err(RejectReason::MissingCapability);
                }
                if !self.map.in_bounds(*to) {
                    return Err(RejectReason::OutOfRange);
                }
                Order::Move { goal: *to }
            }
            Action::Attack { target } => {
                if entity.weapon.is_none() {
                    return Err(RejectReason::MissingCapability);
                }
                let valid = *target != command.unit
                    && self
                        .entities
                        .get(*target)
                        .is_some_and(|t| t.vitals.is_some());
                if !valid {
                    return Err(RejectReason::InvalidTarget);
                }
                Order::Attack { target: *target }
            }
            Action::Harvest { at } => {
                if entity.harvester.is_none() || entity.mobility.is_none() {
                    return Err(RejectReason::MissingCapability);
                }
                match self.map.resource(*at) {
                    Err(_) => return Err(RejectReason::OutOfRange),
                    Ok(0) => return Err(RejectReason::NoResource),
                    Ok(_) => Order::Harvest { at: *at },
                }
            }
            Action::Build { blueprint, at } => {
                if entity.builder.is_none() || entity.mobility.is_none() {
                    return Err(RejectReason::MissingCapability);
                }
                let own = self
                    .settings
                    .blueprint(entity.blueprint)
                    .map_err(|_| RejectReason::InvalidBlueprint)?;
                if !own.can_build.contains(blueprint) {
                    return Err(RejectReason::InvalidBlueprint);
                }
                let size = self
                    .settings
                    .blueprint(*blueprint)
                    .map_err(|_| RejectReason::InvalidBlueprint)?
                    .size();
                let far = at.offset(i32::from(size) - 1, i32::from(size) - 1);
                if !self.map.in_bounds(*at) || !far.is_some_and(|c| self.map.in_bounds(c)) {
                    return Err(RejectReason::OutOfRange);
                }
                Order::Build {
                    blueprint: *blueprint,
                    at: *at,
                    site: None,
                }
            }
            Action::Produce { blueprint } => {
                return self.enqueue_production(command.unit, command.issuer, *blueprint);
            }
        };

        if let Some(entity) = self.entities.get_mut(command.unit) {
            entity.order = order;
            entity.route = None;
        }
        Ok(())
    }

    fn enqueue_production(
        &mut self,
        unit: UnitId,
        issuer: PlayerId,
        blueprint: BlueprintId,
    ) -> std::result::Result<(), RejectReason> {
        let entity = self.entities.get(unit).ok_or(RejectReason::UnknownUnit)?;
        let ready = entity.producer.is_some() && entity.structure.is_some_and(|s| s.is_complete());
        if !ready {
            return Err(RejectReason::MissingCapability);
        }
        let producer_spec = self
            .settings
            .blueprint(entity.blueprint)
            .map_err(|_| RejectReason::InvalidBlueprint)?;
        if !producer_spec.produces.contains(&blueprint) {
            return Err(RejectReason::InvalidBlueprint);
        }
        let cost = self
            .settings
            .blueprint(blueprint)
            .map_err(|_| RejectReason::InvalidBlueprint)?
            .cost;
        let player = self
            .players
            .get_mut(usize::from(issuer))
            .ok_or(RejectReason::NotOwner)?;
        if player.resources < cost {
            return Err(RejectReason::CannotAfford);
        }
        player.resources -= cost;
        if let Some(producer) = self.entities.get_mut(unit).and_then(|e| e.producer.as_mut()) {
            producer.queue.push_back(blueprint);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Systems
    // ------------------------------------------------------------------

    fn run_production_system(&mut self, ids: &[UnitId], events: &mut Vec<TickEvent>) -> Result<()> {
        for &id in ids {
            let Some(entity) = self.entities.get_mut(id) else {
                continue;
            };
            if entity.is_dead() || !entity.structure.is_some_and(|s| s.is_complete()) {
                continue;
            }
            let owner = entity.owner;
            let area = entity.footprint();
            let Some(producer) = entity.producer.as_mut() else {
                continue;
            };
            let Some(&front) = producer.queue.front() else {
                continue;
            };
            let spec = self.settings.blueprint(front)?;
            producer.progress = producer.progress.saturating_add(1);
            if producer.progress < spec.build_ticks {
                continue;
            }
            let surface = spec.mobility.map_or(Surface::Land, |m| m.surface);
            let Some(cell) = find_spawn_cell(&self.map, area, surface, spec.size()) else {
                // Exit blocked; hold the finished unit until a cell frees up.
                continue;
            };
            producer.queue.pop_front();
            producer.progress = 0;

            let unit = self.insert_entity(owner, front, cell, false)?;
            tracing::debug!(structure = id, unit, blueprint = front, "unit produced");
            events.push(TickEvent::Produced {
                structure: id,
                unit,
            });
        }
        Ok(())
    }

    fn run_movement_system(&mut self, ids: &[UnitId], events: &mut Vec<TickEvent>) -> Result<()> {
        for &id in ids {
            match self.movement_intent(id) {
                None => {}
                Some(Intent::Hold) => {
                    if let Some(entity) = self.entities.get_mut(id) {
                        entity.route = None;
                    }
                }
                Some(Intent::Unreachable(goal)) => {
                    if let Some(entity) = self.entities.get_mut(id) {
                        entity.route = None;
                        entity.order = Order::Idle;
                    }
                    events.push(TickEvent::RouteUnreachable { unit: id, goal });
                }
                Some(Intent::Travel(goal)) => self.travel(id, goal, events)?,
            }
        }
        Ok(())
    }

    fn movement_intent(&self, id: UnitId) -> Option<Intent> {
        let entity = self.entities.get(id)?;
        let mobility = entity.mobility?;
        if entity.is_dead() {
            return None;
        }
        let (area, reach) = match &entity.order {
            Order::Idle => return None,
            Order::Move { goal } => return Some(Intent::Travel(*goal)),
            Order::Attack { target } => {
                let target = self.entities.get(*target)?;
                (target.footprint(), entity.weapon.map_or(1, |w| w.range.max(1)))
            }
            Order::Harvest { at } => (Footprint::new(*at, 1), 1),
            Order::Build { blueprint, at, .. } => {
                let size = self.settings.blueprint(*blueprint).map_or(1, Blueprint::size);
                (Footprint::new(*at, size), 1)
            }
        };
        let footprint = entity.footprint();
        if footprint_distance(footprint, area) <= reach {
            return Some(Intent::Hold);
        }
        // Keep following the current route while it still leads next to the area.
        if let Some(route) = &entity.route {
            if footprint_distance(Footprint::new(route.goal, mobility.size), area) == 1 {
                return Some(Intent::Travel(route.goal));
            }
        }
        match approach_cell(&self.map, area, entity.cell, mobility.surface, mobility.size) {
            Some(cell) => Some(Intent::Travel(cell)),
            None => Some(Intent::Unreachable(area.origin)),
        }
    }

    fn travel(&mut self, id: UnitId, goal: GridPos, events: &mut Vec<TickEvent>) -> Result<()> {
        let repath_after = self.settings.repath_after;
        let Some(entity) = self.entities.get_mut(id) else {
            return Ok(());
        };
        let Some(mobility) = entity.mobility else {
            return Ok(());
        };

        let needs_plan = entity.route.as_ref().map_or(true, |r| r.goal != goal);
        if needs_plan {
            let result = plan_route(&mut self.planner, &mut self.map, entity, goal)?;
            if !adopt_route(entity, goal, result, events) {
                return Ok(());
            }
        }
        let Some(route) = entity.route.as_mut() else {
            return Ok(());
        };

        route.progress += mobility.speed;
        while let Some(next) = route.next_cell() {
            let cost = step_cost(entity.cell, next);
            if route.progress < cost {
                break;
            }
            let own = Footprint::new(entity.cell, mobility.size);
            if step_is_clear(&self.map, entity.cell, next, mobility.surface, mobility.size, own)? {
                self.map.remove_occupant(own, mobility.surface)?;
                self.map
                    .add_occupant(Footprint::new(next, mobility.size), mobility.surface)?;
                entity.cell = next;
                route.next += 1;
                route.progress -= cost;
                route.blocked_ticks = 0;
            } else {
                route.blocked_ticks += 1;
                route.progress = cost;
                break;
            }
        }

        if route.is_finished() {
            entity.route = None;
            if matches!(entity.order, Order::Move { .. }) && entity.cell == goal {
                entity.order = Order::Idle;
                events.push(TickEvent::Arrived {
                    unit: id,
                    cell: entity.cell,
                });
            }
            // A partial route ran out: the next tick plans again from here.
        } else if route.blocked_ticks >= repath_after {
            tracing::trace!(unit = id, blocked = route.blocked_ticks, "repathing blocked unit");
            let result = plan_route(&mut self.planner, &mut self.map, entity, goal)?;
            adopt_route(entity, goal, result, events);
        }
        Ok(())
    }

    fn run_combat_system(&mut self, ids: &[UnitId], events: &mut Vec<TickEvent>) {
        for &id in ids {
            let Some(attacker) = self.entities.get_mut(id) else {
                continue;
            };
            let Some(weapon) = attacker.weapon.as_mut() else {
                continue;
            };
            weapon.tick_cooldown();
            let (ready, range) = (weapon.is_ready(), weapon.range);
            let Order::Attack { target } = attacker.order else {
                continue;
            };
            if attacker.is_dead() {
                continue;
            }
            let footprint = attacker.footprint();

            let in_range = match self.entities.get(target) {
                Some(victim) if !victim.is_dead() && victim.vitals.is_some() => {
                    footprint_distance(footprint, victim.footprint()) <= range
                }
                _ => {
                    if let Some(attacker) = self.entities.get_mut(id) {
                        attacker.order = Order::Idle;
                        attacker.route = None;
                    }
                    continue;
                }
            };
            if !in_range || !ready {
                continue;
            }

            let damage = self
                .entities
                .get_mut(id)
                .and_then(|a| a.weapon.as_mut())
                .map_or(0, |w| w.fire());
            let dealt = self
                .entities
                .get_mut(target)
                .and_then(|v| v.vitals.as_mut())
                .map_or(0, |v| v.apply_damage(damage));
            events.push(TickEvent::Damaged {
                attacker: id,
                target,
                amount: dealt,
            });
        }
    }

    fn run_harvest_build_system(
        &mut self,
        ids: &[UnitId],
        events: &mut Vec<TickEvent>,
    ) -> Result<()> {
        for &id in ids {
            let Some(entity) = self.entities.get(id) else {
                continue;
            };
            if entity.is_dead() {
                continue;
            }
            match entity.order {
                Order::Harvest { at } => self.harvest(id, at, events)?,
                Order::Build {
                    blueprint,
                    at,
                    site,
                } => self.construct(id, blueprint, at, site, events)?,
                _ => {}
            }
        }
        Ok(())
    }

    fn harvest(&mut self, id: UnitId, at: GridPos, events: &mut Vec<TickEvent>) -> Result<()> {
        let Some(entity) = self.entities.get_mut(id) else {
            return Ok(());
        };
        let Some(harvester) = entity.harvester else {
            return Ok(());
        };
        if footprint_distance(entity.footprint(), Footprint::new(at, 1)) > 1 {
            return Ok(());
        }
        let taken = self.map.extract_resource(at, harvester.rate)?;
        if let Some(player) = self.players.get_mut(usize::from(entity.owner)) {
            player.resources = player.resources.saturating_add(taken);
        }
        if self.map.resource(at)? == 0 {
            entity.order = Order::Idle;
            events.push(TickEvent::ResourceDepleted { unit: id, at });
        }
        Ok(())
    }

    fn construct(
        &mut self,
        id: UnitId,
        blueprint: BlueprintId,
        at: GridPos,
        site: Option<UnitId>,
        events: &mut Vec<TickEvent>,
    ) -> Result<()> {
        let Some(entity) = self.entities.get(id) else {
            return Ok(());
        };
        let Some(builder) = entity.builder else {
            return Ok(());
        };
        let owner = entity.owner;
        let spec = self.settings.blueprint(blueprint)?;
        let (cost, size) = (spec.cost, spec.size());
        let area = Footprint::new(at, size);
        if footprint_distance(entity.footprint(), area) != 1 {
            return Ok(());
        }

        let Some(site) = site else {
            let failure = if self.player(owner).map_or(0, |p| p.resources) < cost {
                Some(BuildFailure::CannotAfford)
            } else if !self.map.can_occupy(at, Surface::Land, size, None)? {
                Some(BuildFailure::Blocked)
            } else {
                None
            };
            if let Some(reason) = failure {
                if let Some(entity) = self.entities.get_mut(id) {
                    entity.order = Order::Idle;
                }
                events.push(TickEvent::BuildFailed { unit: id, reason });
                return Ok(());
            }
            if let Some(player) = self.players.get_mut(usize::from(owner)) {
                player.resources -= cost;
            }
            let site = self.insert_entity(owner, blueprint, at, true)?;
            if let Some(entity) = self.entities.get_mut(id) {
                entity.order = Order::Build {
                    blueprint,
                    at,
                    site: Some(site),
                };
            }
            events.push(TickEvent::ConstructionStarted { builder: id, site });
            return Ok(());
        };

        let remaining = self
            .entities
            .get_mut(site)
            .and_then(|e| e.structure.as_mut())
            .map(|s| {
                s.remaining = s.remaining.saturating_sub(builder.rate);
                s.remaining
            });
        if remaining.map_or(true, |r| r == 0) {
            if let Some(entity) = self.entities.get_mut(id) {
                entity.order = Order::Idle;
            }
            if remaining.is_some() {
                events.push(TickEvent::ConstructionComplete { site });
            }
        }
        Ok(())
    }

    fn run_death_system(&mut self, ids: &[UnitId], events: &mut Vec<TickEvent>) -> Result<()> {
        for &id in ids {
            if !self.entities.get(id).is_some_and(Entity::is_dead) {
                continue;
            }
            let Some(entity) = self.entities.remove(id) else {
                continue;
            };
            if let Some(mobility) = entity.mobility {
                self.map.remove_occupant(entity.footprint(), mobility.surface)?;
            }
            if entity.structure.is_some() {
                for cell in entity.footprint().cells() {
                    self.map.set_obstructed(cell, false)?;
                }
            }
            self.planner.forget_unit(id);
            tracing::debug!(unit = id, owner = entity.owner, "entity destroyed");
            events.push(TickEvent::Died {
                unit: id,
                owner: entity.owner,
            });
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn insert_entity(
        &mut self,
        owner: PlayerId,
        blueprint: BlueprintId,
        cell: GridPos,
        under_construction: bool,
    ) -> Result<UnitId> {
        let spec = self.settings.blueprint(blueprint)?;
        let mut entity = Entity::new(owner, blueprint, cell);
        entity.vitals = (spec.health > 0).then_some(Vitals::new(spec.health));
        entity.mobility = spec.mobility.map(MobilitySpec::to_component);
        entity.weapon = spec.weapon_component();
        entity.harvester = spec.harvester_component();
        entity.builder = spec.builder_component();
        if let Some(size) = spec.structure_size {
            entity.structure = Some(Structure {
                size: size.max(1),
                remaining: if under_construction {
                    spec.build_ticks.max(1)
                } else {
                    0
                },
            });
            if !spec.produces.is_empty() {
                entity.producer = Some(Producer::default());
            }
        }

        if entity.structure.is_some() {
            for covered in entity.footprint().cells() {
                self.map.set_obstructed(covered, true)?;
            }
        } else if let Some(mobility) = entity.mobility {
            self.map.add_occupant(entity.footprint(), mobility.surface)?;
        }
        Ok(self.entities.insert(entity))
    }

    fn sync_planner(&mut self) {
        let dirty = self.map.take_dirty();
        self.planner.invalidate(&dirty, self.map.version());
    }
}

/// Plan from the entity's cell to `goal` after folding pending map changes
/// into the route cache.
fn plan_route(
    planner: &mut RoutePlanner,
    map: &mut AnnotatedMap,
    entity: &Entity,
    goal: GridPos,
) -> Result<PathResult> {
    let dirty = map.take_dirty();
    planner.invalidate(&dirty, map.version());
    let (surface, size) = entity
        .mobility
        .map_or((Surface::Land, 1), |m| (m.surface, m.size));
    let request = PathRequest {
        unit: entity.id,
        query: PathQuery {
            start: entity.cell,
            goal,
            surface,
            size,
            occupant: Some(entity.footprint()),
        },
    };
    planner.plan(map, &request)
}

/// Install a planned route. Returns false if the order had to be dropped.
fn adopt_route(
    entity: &mut Entity,
    goal: GridPos,
    result: PathResult,
    events: &mut Vec<TickEvent>,
) -> bool {
    match result.status {
        PathStatus::Unreachable => {
            entity.route = None;
            entity.order = Order::Idle;
            events.push(TickEvent::RouteUnreachable {
                unit: entity.id,
                goal,
            });
            false
        }
        _ if result.path.len() <= 1 && entity.cell != goal => {
            entity.route = None;
            entity.order = Order::Idle;
            events.push(TickEvent::Stuck {
                unit: entity.id,
                cell: entity.cell,
            });
            false
        }
        status => {
            entity.route = Some(Route::new(goal, result.path, status));
            true
        }
    }
}

/// Whether a unit can step from `from` to the adjacent `to` right now.
/// Diagonal steps also need both side cells.
fn step_is_clear(
    map: &AnnotatedMap,
    from: GridPos,
    to: GridPos,
    surface: Surface,
    size: u8,
    own: Footprint,
) -> Result<bool> {
    if from.chebyshev(to) != 1 || !map.in_bounds(to) {
        return Ok(false);
    }
    if !map.can_occupy(to, surface, size, Some(own))? {
        return Ok(false);
    }
    if from.x != to.x && from.y != to.y {
        let side_a = GridPos::new(to.x, from.y);
        let side_b = GridPos::new(from.x, to.y);
        return Ok(map.can_occupy(side_a, surface, size, Some(own))?
            && map.can_occupy(side_b, surface, size, Some(own))?);
    }
    Ok(true)
}

/// Chebyshev gap between two footprints. Overlapping is 0, touching is 1.
#[must_use]
pub fn footprint_distance(a: Footprint, b: Footprint) -> u32 {
    let gap = |a0: u32, a_size: u32, b0: u32, b_size: u32| {
        if a0 + a_size <= b0 {
            b0 - (a0 + a_size) + 1
        } else if b0 + b_size <= a0 {
            a0 - (b0 + b_size) + 1
        } else {
            0
        }
    };
    let (sa, sb) = (u32::from(a.size), u32::from(b.size));
    gap(a.origin.x, sa, b.origin.x, sb).max(gap(a.origin.y, sa, b.origin.y, sb))
}

/// Cells touching `area` from outside, row-major, clipped at zero.
fn ring(area: Footprint) -> impl Iterator<Item = GridPos> {
    let size = i64::from(area.size);
    let (x0, y0) = (i64::from(area.origin.x), i64::from(area.origin.y));
    (y0 - 1..=y0 + size).flat_map(move |y| {
        (x0 - 1..=x0 + size).filter_map(move |x| {
            let inside = x >= x0 && x < x0 + size && y >= y0 && y < y0 + size;
            if inside {
                return None;
            }
            let x = u32::try_from(x).ok()?;
            let y = u32::try_from(y).ok()?;
            Some(GridPos::new(x, y))
        })
    })
}

/// First free cell around a structure for a new unit.
fn find_spawn_cell(
    map: &AnnotatedMap,
    area: Footprint,
    surface: Surface,
    size: u8,
) -> Option<GridPos> {
    ring(area).find(|&cell| {
        map.in_bounds(cell) && map.can_occupy(cell, surface, size, None).unwrap_or(false)
    })
}

/// Closest reachable cell next to `area`, ties broken row-major.
fn approach_cell(
    map: &AnnotatedMap,
    area: Footprint,
    from: GridPos,
    surface: Surface,
    size: u8,
) -> Option<GridPos> {
    ring(area)
        .filter(|&cell| {
            map.in_bounds(cell)
                && map.clearance(cell, surface).is_ok_and(|c| c >= size)
                && map.same_region(from, cell, surface).unwrap_or(false)
        })
        .min_by_key(|cell| (from.chebyshev(*cell), cell.y, cell.x))
}
