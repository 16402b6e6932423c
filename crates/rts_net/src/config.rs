//! Server configuration, loaded from RON.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use rts_core::components::{BlueprintId, PlayerId};
use rts_core::map::{AnnotatedMap, GridPos};
use rts_core::settings::{ids, SimSettings};
use rts_core::simulation::Simulation;

use crate::barrier::DisconnectPolicy;
use crate::error::{NetError, Result};

/// A unit placed before the first tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placement {
    /// Owning slot.
    pub owner: PlayerId,
    /// Blueprint to spawn.
    pub blueprint: BlueprintId,
    /// Top-left cell.
    pub at: GridPos,
}

/// The starting state every peer receives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Scenario {
    /// ASCII map rows, see [`AnnotatedMap::from_rows`].
    pub map: Vec<String>,
    /// Simulation settings. `players` must equal the slot count.
    pub settings: SimSettings,
    /// Starting units.
    pub units: Vec<Placement>,
}

impl Default for Scenario {
    fn default() -> Self {
        let map = [
            "........................",
            "..$$................$$..",
            "..$$.......##.......$$..",
            "...........##...........",
            "....####...##...####....",
            "........................",
            "........................",
            "....####...##...####....",
            "...........##...........",
            "..$$.......##.......$$..",
            "..$$................$$..",
            "........................",
        ];
        let place = |owner, blueprint, x, y| Placement {
            owner,
            blueprint,
            at: GridPos::new(x, y),
        };
        Self {
            map: map.iter().map(|row| (*row).to_string()).collect(),
            settings: SimSettings::default(),
            units: vec![
                place(0, ids::DEPOT, 1, 5),
                place(0, ids::WORKER, 4, 2),
                place(0, ids::TROOPER, 5, 6),
                place(1, ids::DEPOT, 21, 5),
                place(1, ids::WORKER, 19, 9),
                place(1, ids::TROOPER, 18, 5),
            ],
        }
    }
}

impl Scenario {
    /// Build the initial simulation.
    ///
    /// # Errors
    ///
    /// Returns [`NetError::Simulation`] if the map, settings or a placement
    /// is invalid.
    pub fn build(&self) -> Result<Simulation> {
        let rows: Vec<&str> = self.map.iter().map(String::as_str).collect();
        let map = AnnotatedMap::from_rows(&rows)?;
        let mut sim = Simulation::new(self.settings.clone(), map)?;
        for unit in &self.units {
            sim.spawn_unit(unit.owner, unit.blueprint, unit.at)?;
        }
        Ok(sim)
    }

    /// Resize for `slots` players, dropping placements for missing slots.
    pub fn fit_to_slots(&mut self, slots: u8) {
        self.settings.players = slots;
        self.units.retain(|unit| unit.owner < slots);
    }
}

/// Configuration for `rts_server`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address.
    pub bind: String,
    /// Players in the match. The match starts once all have joined.
    pub slots: u8,
    /// Target ticks per second.
    pub tick_rate: u32,
    /// Ticks between issuing a command and executing it.
    pub input_delay: u64,
    /// What happens when a player drops.
    pub disconnect: DisconnectPolicy,
    /// Time a new connection has to send `Hello`.
    pub handshake_timeout_ms: u64,
    /// End the match after this many ticks.
    pub max_ticks: Option<u64>,
    /// Starting state.
    pub scenario: Scenario,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:7777".into(),
            slots: 2,
            tick_rate: 20,
            input_delay: 2,
            disconnect: DisconnectPolicy::default(),
            handshake_timeout_ms: 5000,
            max_ticks: None,
            scenario: Scenario::default(),
        }
    }
}

impl ServerConfig {
    /// Load and validate a RON config file.
    ///
    /// # Errors
    ///
    /// Returns [`NetError::Config`] if the file cannot be read, parsed or
    /// validated.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let label = path.display().to_string();
        let contents = std::fs::read_to_string(path).map_err(|e| NetError::Config {
            path: label.clone(),
            message: e.to_string(),
        })?;
        let config = Self::parse(&contents, &label)?;
        tracing::info!(path = %label, slots = config.slots, "loaded server config");
        Ok(config)
    }

    /// Parse and validate a RON string.
    ///
    /// # Errors
    ///
    /// Returns [`NetError::Config`] if the text does not parse or validate.
    pub fn from_ron_str(ron: &str) -> Result<Self> {
        Self::parse(ron, "<inline>")
    }

    fn parse(ron: &str, label: &str) -> Result<Self> {
        let config: Self = ron::from_str(ron).map_err(|e| NetError::Config {
            path: label.to_string(),
            message: e.to_string(),
        })?;
        config.validate().map_err(|message| NetError::Config {
            path: label.to_string(),
            message,
        })?;
        Ok(config)
    }

    /// Check internal consistency.
    ///
    /// # Errors
    ///
    /// Returns a description of the first problem found.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.slots == 0 {
            return Err("at least one slot required".into());
        }
        if self.tick_rate == 0 {
            return Err("tick rate must be positive".into());
        }
        if self.scenario.settings.players != self.slots {
            return Err(format!(
                "scenario has {} players but the server has {} slots",
                self.scenario.settings.players, self.slots
            ));
        }
        if let Some(unit) = self.scenario.units.iter().find(|u| u.owner >= self.slots) {
            return Err(format!("placement owned by unknown slot {}", unit.owner));
        }
        self.scenario.settings.validate().map_err(|e| e.to_string())
    }

    /// Time between sealed ticks.
    #[must_use]
    pub fn tick_interval(&self) -> Duration {
        Duration::from_micros((1_000_000 / u64::from(self.tick_rate.max(1))).max(1))
    }

    /// Handshake deadline.
    #[must_use]
    pub const fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}
