//! Simulation settings and the blueprint table.
//!
//! A [`SimSettings`] value is the explicit context every [`Simulation`]
//! owns: player count, economy start, planner limits, repath policy,
//! checksum history and the blueprints units are created from. It loads
//! from RON and every peer in a match must use identical settings.
//!
//! [`Simulation`]: crate::simulation::Simulation

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::components::{BlueprintId, Builder, Harvester, Mobility, Weapon};
use crate::error::{GameError, Result};
use crate::map::{Surface, MAX_CLEARANCE};
use crate::math::Fixed;
use crate::route::PlannerConfig;

/// Movement stats in config-friendly units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MobilitySpec {
    /// Layer.
    pub surface: Surface,
    /// Footprint side length.
    pub size: u8,
    /// Thousandths of a cell per tick.
    pub speed_milli: u32,
}

impl MobilitySpec {
    /// Convert to the fixed-point component.
    #[must_use]
    pub fn to_component(self) -> Mobility {
        Mobility {
            surface: self.surface,
            size: self.size.max(1),
            speed: Fixed::from_num(self.speed_milli) / Fixed::from_num(1000),
        }
    }
}

/// Weapon stats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeaponSpec {
    /// Damage per shot.
    pub damage: u32,
    /// Reach in cells.
    pub range: u32,
    /// Ticks between shots.
    pub cooldown: u32,
}

/// Template for units and structures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Blueprint {
    /// Display name.
    pub name: String,
    /// Resource cost.
    pub cost: u32,
    /// Maximum health. Zero means the entity cannot be attacked.
    pub health: u32,
    /// Movement, for units.
    pub mobility: Option<MobilitySpec>,
    /// Weapon.
    pub weapon: Option<WeaponSpec>,
    /// Resources gathered per tick.
    pub harvest_rate: Option<u32>,
    /// Construction ticks contributed per tick.
    pub build_rate: Option<u32>,
    /// Structures this unit can build.
    pub can_build: Vec<BlueprintId>,
    /// Units this structure can produce.
    pub produces: Vec<BlueprintId>,
    /// Ticks to produce or construct.
    pub build_ticks: u32,
    /// Footprint size, for structures.
    pub structure_size: Option<u8>,
}

impl Default for Blueprint {
    fn default() -> Self {
        Self {
            name: String::new(),
            cost: 0,
            health: 1,
            mobility: None,
            weapon: None,
            harvest_rate: None,
            build_rate: None,
            can_build: Vec::new(),
            produces: Vec::new(),
            build_ticks: 1,
            structure_size: None,
        }
    }
}

impl Blueprint {
    /// Whether this blueprint describes a structure.
    #[must_use]
    pub const fn is_structure(&self) -> bool {
        self.structure_size.is_some()
    }

    /// Footprint side length.
    #[must_use]
    pub fn size(&self) -> u8 {
        self.structure_size
            .or_else(|| self.mobility.map(|m| m.size))
            .unwrap_or(1)
            .max(1)
    }

    pub(crate) fn weapon_component(&self) -> Option<Weapon> {
        self.weapon
            .map(|w| Weapon::new(w.damage, w.range, w.cooldown))
    }

    pub(crate) fn harvester_component(&self) -> Option<Harvester> {
        self.harvest_rate.map(|rate| Harvester { rate })
    }

    pub(crate) fn builder_component(&self) -> Option<Builder> {
        self.build_rate.map(|rate| Builder { rate })
    }
}

/// Well-known blueprint IDs in [`SimSettings::default`].
pub mod ids {
    use crate::components::BlueprintId;

    /// Land worker: harvests and builds.
    pub const WORKER: BlueprintId = 1;
    /// Land infantry.
    pub const TROOPER: BlueprintId = 2;
    /// 2x2 land vehicle.
    pub const TANK: BlueprintId = 3;
    /// Air unit.
    pub const DRONE: BlueprintId = 4;
    /// Water unit.
    pub const GUNBOAT: BlueprintId = 5;
    /// Production structure.
    pub const DEPOT: BlueprintId = 10;
}

/// Everything a simulation needs besides the map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimSettings {
    /// Number of player slots.
    pub players: u8,
    /// Resources each player starts with.
    pub starting_resources: u32,
    /// Pathfinding limits.
    pub planner: PlannerConfig,
    /// Ticks a unit waits on an occupied cell before planning again.
    pub repath_after: u32,
    /// Checksums kept for remote verification.
    pub checksum_history: usize,
    /// Unit and structure templates.
    pub blueprints: BTreeMap<BlueprintId, Blueprint>,
}

impl Default for SimSettings {
    fn default() -> Self {
        let mut blueprints = BTreeMap::new();
        let land = |size, speed_milli| {
            Some(MobilitySpec {
                surface: Surface::Land,
                size,
                speed_milli,
            })
        };
        blueprints.insert(
            ids::WORKER,
            Blueprint {
                name: "worker".into(),
                cost: 50,
                health: 40,
                mobility: land(1, 1000),
                harvest_rate: Some(2),
                build_rate: Some(1),
                can_build: vec![ids::DEPOT],
                build_ticks: 20,
                ..Blueprint::default()
            },
        );
        blueprints.insert(
            ids::TROOPER,
            Blueprint {
                name: "trooper".into(),
                cost: 100,
                health: 60,
                mobility: land(1, 1000),
                weapon: Some(WeaponSpec {
                    damage: 6,
                    range: 3,
                    cooldown: 5,
                }),
                build_ticks: 30,
                ..Blueprint::default()
            },
        );
        blueprints.insert(
            ids::TANK,
            Blueprint {
                name: "tank".into(),
                cost: 250,
                health: 200,
                mobility: land(2, 500),
                weapon: Some(WeaponSpec {
                    damage: 20,
                    range: 4,
                    cooldown: 10,
                }),
                build_ticks: 60,
                ..Blueprint::default()
            },
        );
        blueprints.insert(
            ids::DRONE,
            Blueprint {
                name: "drone".into(),
                cost: 80,
                health: 30,
                mobility: Some(MobilitySpec {
                    surface: Surface::Air,
                    size: 1,
                    speed_milli: 2000,
                }),
                weapon: Some(WeaponSpec {
                    damage: 3,
                    range: 2,
                    cooldown: 2,
                }),
                build_ticks: 25,
                ..Blueprint::default()
            },
        );
        blueprints.insert(
            ids::GUNBOAT,
            Blueprint {
                name: "gunboat".into(),
                cost: 150,
                health: 120,
                mobility: Some(MobilitySpec {
                    surface: Surface::Water,
                    size: 1,
                    speed_milli: 1000,
                }),
                weapon: Some(WeaponSpec {
                    damage: 10,
                    range: 4,
                    cooldown: 6,
                }),
                build_ticks: 40,
                ..Blueprint::default()
            },
        );
        blueprints.insert(
            ids::DEPOT,
            Blueprint {
                name: "depot".into(),
                cost: 150,
                health: 500,
                produces: vec![ids::WORKER, ids::TROOPER, ids::TANK, ids::DRONE],
                build_ticks: 30,
                structure_size: Some(2),
                ..Blueprint::default()
            },
        );

        Self {
            players: 2,
            starting_resources: 500,
            planner: PlannerConfig::default(),
            repath_after: 3,
            checksum_history: 256,
            blueprints,
        }
    }
}

impl SimSettings {
    /// Load settings from a RON file and validate them.
    ///
    /// # Errors
    ///
    /// Returns [`GameError::Io`] if the file cannot be read, or
    /// [`GameError::Config`] if it does not parse or validate.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        let settings = Self::parse(&contents, &path.display().to_string())?;
        tracing::info!(
            path = %path.display(),
            players = settings.players,
            blueprints = settings.blueprints.len(),
            "loaded simulation settings"
        );
        Ok(settings)
    }

    /// Parse and validate settings from a RON string.
    ///
    /// # Errors
    ///
    /// Returns [`GameError::Config`] if the text does not parse or validate.
    pub fn from_ron_str(ron: &str) -> Result<Self> {
        Self::parse(ron, "<inline>")
    }

    fn parse(ron: &str, label: &str) -> Result<Self> {
        let settings: Self = ron::from_str(ron).map_err(|e| GameError::Config {
            path: label.to_string(),
            message: e.to_string(),
        })?;
        settings.validate().map_err(|e| GameError::Config {
            path: label.to_string(),
            message: e.to_string(),
        })?;
        Ok(settings)
    }

    /// Look up a blueprint.
    ///
    /// # Errors
    ///
    /// Returns [`GameError::InvalidState`] for an unknown ID.
    pub fn blueprint(&self, id: BlueprintId) -> Result<&Blueprint> {
        self.blueprints
            .get(&id)
            .ok_or_else(|| GameError::InvalidState(format!("unknown blueprint {id}")))
    }

    /// Check internal consistency.
    ///
    /// # Errors
    ///
    /// Returns [`GameError::InvalidState`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.players == 0 {
            return Err(GameError::InvalidState("at least one player required".into()));
        }
        if self.checksum_history == 0 {
            return Err(GameError::InvalidState(
                "checksum history must hold at least one entry".into(),
            ));
        }
        if self.planner.pool_capacity == 0 {
            return Err(GameError::InvalidState("node pool capacity must be positive".into()));
        }
        if self.repath_after == 0 {
            return Err(GameError::InvalidState(
                "repath_after must wait at least one tick".into(),
            ));
        }
        for (id, blueprint) in &self.blueprints {
            if blueprint.size() > MAX_CLEARANCE {
                return Err(GameError::InvalidState(format!(
                    "blueprint {id} is larger than {MAX_CLEARANCE} cells"
                )));
            }
            if blueprint.is_structure() && blueprint.mobility.is_some() {
                return Err(GameError::InvalidState(format!(
                    "blueprint {id} is both a structure and mobile"
                )));
            }
            for referenced in blueprint.can_build.iter().chain(&blueprint.produces) {
                if !self.blueprints.contains_key(referenced) {
                    return Err(GameError::InvalidState(format!(
                        "blueprint {id} references unknown blueprint {referenced}"
                    )));
                }
            }
        }
        Ok(())
    }
}
