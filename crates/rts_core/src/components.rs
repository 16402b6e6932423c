//! Entity and component definitions.
//!
//! Components are pure data. An [`Entity`] carries the components for the
//! capabilities it has as `Option`s: a unit that can move has `mobility`,
//! one that can be attacked has `vitals`, and so on. Systems in
//! [`simulation`](crate::simulation) match on the components they need.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::map::{Footprint, GridPos, Surface};
use crate::math::{fixed_serde, Fixed, Vec2Fixed, DIAGONAL_COST, STRAIGHT_COST};
use crate::search::PathStatus;

/// Unique identifier for units and structures.
pub type UnitId = u64;

/// Player slot index.
pub type PlayerId = u8;

/// Key into the blueprint table of [`SimSettings`](crate::settings::SimSettings).
pub type BlueprintId = u16;

/// Movement capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mobility {
    /// Layer the unit moves on.
    pub surface: Surface,
    /// Footprint side length in cells.
    pub size: u8,
    /// Cells per tick. Diagonal steps cost `DIAGONAL_COST`.
    #[serde(with = "fixed_serde")]
    pub speed: Fixed,
}

/// Hit points. Present on everything that can be attacked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vitals {
    /// Current health points.
    pub current: u32,
    /// Maximum health points.
    pub max: u32,
}

impl Vitals {
    /// Full health.
    #[must_use]
    pub const fn new(max: u32) -> Self {
        Self { current: max, max }
    }

    /// Check if health has reached zero.
    #[must_use]
    pub const fn is_dead(&self) -> bool {
        self.current == 0
    }

    /// Apply damage, returning actual damage dealt.
    pub fn apply_damage(&mut self, amount: u32) -> u32 {
        let actual = amount.min(self.current);
        self.current -= actual;
        actual
    }
}

/// Direct-fire weapon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Weapon {
    /// Damage per shot.
    pub damage: u32,
    /// Reach in cells (Chebyshev distance).
    pub range: u32,
    /// Ticks between shots.
    pub cooldown: u32,
    /// Ticks until the next shot.
    pub cooldown_remaining: u32,
}

impl Weapon {
    /// Create a ready weapon.
    #[must_use]
    pub const fn new(damage: u32, range: u32, cooldown: u32) -> Self {
        Self {
            damage,
            range,
            cooldown,
            cooldown_remaining: 0,
        }
    }

    /// Whether the weapon can fire this tick.
    #[must_use]
    pub const fn is_ready(&self) -> bool {
        self.cooldown_remaining == 0
    }

    /// Count down one tick.
    pub fn tick_cooldown(&mut self) {
        self.cooldown_remaining = self.cooldown_remaining.saturating_sub(1);
    }

    /// Fire and start the cooldown. Returns the damage dealt.
    pub fn fire(&mut self) -> u32 {
        self.cooldown_remaining = self.cooldown;
        self.damage
    }
}

/// Resource gathering capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Harvester {
    /// Resources extracted per tick.
    pub rate: u32,
}

/// Construction capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Builder {
    /// Construction ticks contributed per tick.
    pub rate: u32,
}

/// Unit production queue on a structure.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Producer {
    /// Blueprints waiting to be built, front first.
    pub queue: VecDeque<BlueprintId>,
    /// Ticks spent on the front item.
    pub progress: u32,
}

/// A placed structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Structure {
    /// Footprint side length.
    pub size: u8,
    /// Construction ticks left. Zero once complete.
    pub remaining: u32,
}

impl Structure {
    /// Whether construction has finished.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.remaining == 0
    }
}

/// The route a unit is following.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    /// Cell the route was planned for.
    pub goal: GridPos,
    /// Planned cells, starting with the cell the unit stood on.
    pub cells: Vec<GridPos>,
    /// Index of the next cell to enter.
    pub next: usize,
    /// Movement points accumulated toward the next step.
    #[serde(with = "fixed_serde")]
    pub progress: Fixed,
    /// Whether the planned path reaches the goal.
    pub status: PathStatus,
    /// Consecutive ticks the next step was occupied.
    pub blocked_ticks: u32,
}

impl Route {
    /// Wrap a planned path.
    #[must_use]
    pub fn new(goal: GridPos, cells: Vec<GridPos>, status: PathStatus) -> Self {
        Self {
            goal,
            cells,
            next: 1,
            progress: Fixed::ZERO,
            status,
            blocked_ticks: 0,
        }
    }

    /// Next cell to enter, if any remain.
    #[must_use]
    pub fn next_cell(&self) -> Option<GridPos> {
        self.cells.get(self.next).copied()
    }

    /// True once every planned cell has been entered.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.next >= self.cells.len()
    }
}

/// Movement cost of one step between adjacent cells.
#[must_use]
pub fn step_cost(from: GridPos, to: GridPos) -> Fixed {
    if from.x != to.x && from.y != to.y {
        DIAGONAL_COST
    } else {
        STRAIGHT_COST
    }
}

/// Current standing order of a unit.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Order {
    /// Doing nothing.
    #[default]
    Idle,
    /// Walking to a cell.
    Move {
        /// Destination.
        goal: GridPos,
    },
    /// Chasing and shooting a unit.
    Attack {
        /// Target unit.
        target: UnitId,
    },
    /// Gathering from a resource cell.
    Harvest {
        /// Resource cell.
        at: GridPos,
    },
    /// Placing and constructing a structure.
    Build {
        /// Structure to build.
        blueprint: BlueprintId,
        /// Top-left cell of the structure.
        at: GridPos,
        /// The placed site, once founded.
        site: Option<UnitId>,
    },
}

/// A unit or structure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    /// Unique identifier.
    pub id: UnitId,
    /// Owning player.
    pub owner: PlayerId,
    /// Blueprint the entity was created from.
    pub blueprint: BlueprintId,
    /// Top-left cell of the footprint.
    pub cell: GridPos,
    /// Movement capability.
    pub mobility: Option<Mobility>,
    /// Attackable.
    pub vitals: Option<Vitals>,
    /// Weapon.
    pub weapon: Option<Weapon>,
    /// Gathering.
    pub harvester: Option<Harvester>,
    /// Construction.
    pub builder: Option<Builder>,
    /// Unit production.
    pub producer: Option<Producer>,
    /// Structure data, for buildings.
    pub structure: Option<Structure>,
    /// Route being followed.
    pub route: Option<Route>,
    /// Standing order.
    pub order: Order,
}

impl Entity {
    /// Create an entity with no capabilities.
    #[must_use]
    pub fn new(owner: PlayerId, blueprint: BlueprintId, cell: GridPos) -> Self {
        Self {
            id: 0,
            owner,
            blueprint,
            cell,
            mobility: None,
            vitals: None,
            weapon: None,
            harvester: None,
            builder: None,
            producer: None,
            structure: None,
            route: None,
            order: Order::Idle,
        }
    }

    /// Footprint side length: the structure or mobility size, else one.
    #[must_use]
    pub fn size(&self) -> u8 {
        self.structure
            .map(|s| s.size)
            .or_else(|| self.mobility.map(|m| m.size))
            .unwrap_or(1)
    }

    /// Current footprint.
    #[must_use]
    pub fn footprint(&self) -> Footprint {
        Footprint::new(self.cell, self.size())
    }

    /// Whether health is tracked and has reached zero.
    #[must_use]
    pub fn is_dead(&self) -> bool {
        self.vitals.is_some_and(|v| v.is_dead())
    }

    /// Interpolated world position: cell center, moved toward the next route
    /// cell by the accumulated progress.
    #[must_use]
    pub fn world_position(&self) -> Vec2Fixed {
        let here = Vec2Fixed::cell_center(self.cell.x, self.cell.y);
        let Some(route) = &self.route else {
            return here;
        };
        let Some(next) = route.next_cell() else {
            return here;
        };
        let cost = step_cost(self.cell, next);
        let t = (route.progress / cost).min(Fixed::ONE);
        here.lerp(Vec2Fixed::cell_center(next.x, next.y), t)
    }
}

/// Storage for all entities in the simulation.
///
/// Uses a `HashMap` for O(1) lookup by ID, with deterministic iteration via
/// sorted keys when processing systems.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntityStorage {
    entities: HashMap<UnitId, Entity>,
    next_id: UnitId,
}

impl EntityStorage {
    /// Create empty entity storage.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entities: HashMap::new(),
            next_id: 1,
        }
    }

    /// Insert a new entity and return its assigned ID.
    pub fn insert(&mut self, mut entity: Entity) -> UnitId {
        let id = self.next_id;
        self.next_id += 1;
        entity.id = id;
        self.entities.insert(id, entity);
        id
    }

    /// ID the next insert will receive.
    #[must_use]
    pub const fn next_id(&self) -> UnitId {
        self.next_id
    }

    /// Remove an entity by ID.
    pub fn remove(&mut self, id: UnitId) -> Option<Entity> {
        self.entities.remove(&id)
    }

    /// Get an entity by ID.
    #[must_use]
    pub fn get(&self, id: UnitId) -> Option<&Entity> {
        self.entities.get(&id)
    }

    /// Get a mutable reference to an entity by ID.
    pub fn get_mut(&mut self, id: UnitId) -> Option<&mut Entity> {
        self.entities.get_mut(&id)
    }

    /// Check if an entity exists.
    #[must_use]
    pub fn contains(&self, id: UnitId) -> bool {
        self.entities.contains_key(&id)
    }

    /// Number of entities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Check if storage is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Sorted entity IDs for deterministic iteration.
    #[must_use]
    pub fn sorted_ids(&self) -> Vec<UnitId> {
        let mut ids: Vec<_> = self.entities.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Iterate over all entities (not in deterministic order).
    pub fn iter(&self) -> impl Iterator<Item = (&UnitId, &Entity)> {
        self.entities.iter()
    }
}
