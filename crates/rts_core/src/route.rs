//! Route planning with a deterministic per-unit path cache.
//!
//! [`RoutePlanner`] wraps a [`SearchEngine`] and caches complete routes
//! keyed by `(unit, destination)`. Each entry carries the map version it
//! was valid for. Before planning, the owner feeds the map's dirty-cell log
//! to [`RoutePlanner::invalidate`], which drops routes crossing a changed
//! cell and restamps the rest.
//!
//! The cache is part of the serialized simulation state. The search scratch
//! space is not.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::components::UnitId;
use crate::error::Result;
use crate::map::{AnnotatedMap, Footprint, GridPos, Surface};
use crate::search::{MovementModel, PathQuery, PathResult, PathStatus, SearchEngine};

/// Pathfinding limits and cache size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    /// Nodes available to one search.
    pub pool_capacity: usize,
    /// Expansions before a search settles for a partial path.
    pub max_iterations: u32,
    /// Neighbor model.
    pub movement: MovementModel,
    /// Cached routes kept before evicting the smallest key.
    pub cache_capacity: usize,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            pool_capacity: 4096,
            max_iterations: 8192,
            movement: MovementModel::Octile,
            cache_capacity: 256,
        }
    }
}

/// A route request for one unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathRequest {
    /// Unit the route is for.
    pub unit: UnitId,
    /// Search parameters.
    pub query: PathQuery,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct CachedRoute {
    start: GridPos,
    surface: Surface,
    size: u8,
    version: u64,
    result: PathResult,
}

impl CachedRoute {
    fn matches(&self, query: &PathQuery, version: u64) -> bool {
        self.version == version
            && self.start == query.start
            && self.surface == query.surface
            && self.size == query.size
    }

    /// Whether any cell the route relies on is in `dirty`.
    fn touches(&self, dirty: &HashSet<GridPos>) -> bool {
        let covers = |cell: GridPos| {
            Footprint::new(cell, self.size)
                .cells()
                .any(|c| dirty.contains(&c))
        };
        let path = &self.result.path;
        if path.iter().copied().any(covers) {
            return true;
        }
        // Diagonal steps also depend on both side cells.
        path.windows(2).any(|step| {
            let (from, to) = (step[0], step[1]);
            from.x != to.x
                && from.y != to.y
                && (covers(GridPos::new(to.x, from.y)) || covers(GridPos::new(from.x, to.y)))
        })
    }
}

/// Cache of complete routes, ordered by key so eviction is deterministic.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PathCache {
    entries: BTreeMap<(UnitId, GridPos), CachedRoute>,
    capacity: usize,
}

impl PathCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            capacity,
        }
    }

    /// Number of cached routes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether a route for `(unit, goal)` is cached, regardless of its stamp.
    #[must_use]
    pub fn contains(&self, unit: UnitId, goal: GridPos) -> bool {
        self.entries.contains_key(&(unit, goal))
    }

    fn lookup(&self, unit: UnitId, query: &PathQuery, version: u64) -> Option<&PathResult> {
        self.entries
            .get(&(unit, query.goal))
            .filter(|entry| entry.matches(query, version))
            .map(|entry| &entry.result)
    }

    fn insert(&mut self, unit: UnitId, query: &PathQuery, version: u64, result: PathResult) {
        if self.capacity == 0 {
            return;
        }
        let key = (unit, query.goal);
        if !self.entries.contains_key(&key) && self.entries.len() >= self.capacity {
            self.entries.pop_first();
        }
        self.entries.insert(
            key,
            CachedRoute {
                start: query.start,
                surface: query.surface,
                size: query.size,
                version,
                result,
            },
        );
    }

    /// Drop routes touching `dirty` and restamp the rest with `version`.
    /// Returns how many routes were dropped.
    pub fn invalidate(&mut self, dirty: &[GridPos], version: u64) -> usize {
        let before = self.entries.len();
        if !dirty.is_empty() {
            let dirty: HashSet<GridPos> = dirty.iter().copied().collect();
            self.entries.retain(|_, entry| !entry.touches(&dirty));
        }
        for entry in self.entries.values_mut() {
            entry.version = version;
        }
        before - self.entries.len()
    }

    /// Drop every route for `unit`.
    pub fn forget_unit(&mut self, unit: UnitId) {
        self.entries.retain(|(owner, _), _| *owner != unit);
    }
}

/// Counters for the planner. Not part of the simulation state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlannerStats {
    /// Requests answered from the cache.
    pub cache_hits: u64,
    /// Searches run.
    pub searches: u64,
    /// Searches that ended with a partial path.
    pub partial: u64,
    /// Searches that found the goal unreachable.
    pub unreachable: u64,
    /// Routes dropped by invalidation.
    pub invalidated: u64,
}

/// Plans unit routes, reusing cached results while the map allows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutePlanner {
    config: PlannerConfig,
    cache: PathCache,
    #[serde(skip)]
    engine: Option<SearchEngine>,
    #[serde(skip)]
    stats: PlannerStats,
}

impl RoutePlanner {
    /// Create a planner.
    #[must_use]
    pub fn new(config: PlannerConfig) -> Self {
        Self {
            config,
            cache: PathCache::new(config.cache_capacity),
            engine: None,
            stats: PlannerStats::default(),
        }
    }

    /// Planner settings.
    #[must_use]
    pub const fn config(&self) -> &PlannerConfig {
        &self.config
    }

    /// The route cache.
    #[must_use]
    pub const fn cache(&self) -> &PathCache {
        &self.cache
    }

    /// Counters since construction or load.
    #[must_use]
    pub const fn stats(&self) -> PlannerStats {
        self.stats
    }

    /// Plan a route, answering from the cache when the stamp is current.
    ///
    /// # Errors
    ///
    /// Returns [`GameError::OutOfRange`](crate::error::GameError::OutOfRange)
    /// if the start or goal is outside the map.
    pub fn plan(&mut self, map: &AnnotatedMap, request: &PathRequest) -> Result<PathResult> {
        let version = map.version();
        if let Some(hit) = self.cache.lookup(request.unit, &request.query, version) {
            self.stats.cache_hits += 1;
            return Ok(hit.clone());
        }

        let config = self.config;
        let engine = self
            .engine
            .get_or_insert_with(|| SearchEngine::new(&config));
        let result = engine.search(map, &request.query)?;
        self.stats.searches += 1;

        match result.status {
            PathStatus::Found => {
                self.cache
                    .insert(request.unit, &request.query, version, result.clone());
            }
            PathStatus::PartialFound => self.stats.partial += 1,
            PathStatus::Unreachable => self.stats.unreachable += 1,
        }
        tracing::trace!(
            unit = request.unit,
            status = ?result.status,
            expanded = result.expanded,
            "route planned"
        );
        Ok(result)
    }

    /// Apply the map's dirty-cell log. See [`PathCache::invalidate`].
    pub fn invalidate(&mut self, dirty: &[GridPos], version: u64) {
        let dropped = self.cache.invalidate(dirty, version);
        self.stats.invalidated += dropped as u64;
        if dropped > 0 {
            tracing::trace!(dropped, version, "cached routes invalidated");
        }
    }

    /// Forget cached routes for a removed unit.
    pub fn forget_unit(&mut self, unit: UnitId) {
        self.cache.forget_unit(unit);
    }
}
