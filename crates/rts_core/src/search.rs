//! A* search over the annotated map.
//!
//! All calculations use fixed-point math and a fixed compass expansion
//! order, so every peer visits nodes in the same order and produces the
//! identical path.

use serde::{Deserialize, Serialize};

use crate::error::{GameError, Result};
use crate::map::{AnnotatedMap, Footprint, GridPos, Surface};
use crate::math::{
    fixed_serde, manhattan_distance, octile_distance, Fixed, DIAGONAL_COST, HEURISTIC_SCALE,
    STRAIGHT_COST,
};
use crate::node_pool::{NodeHandle, NodePool};
use crate::route::PlannerConfig;

/// Neighbor offsets in compass order: N, NE, E, SE, S, SW, W, NW.
const COMPASS: [(i32, i32); 8] = [
    (0, -1),
    (1, -1),
    (1, 0),
    (1, 1),
    (0, 1),
    (-1, 1),
    (-1, 0),
    (-1, -1),
];

/// Cardinal subset of [`COMPASS`]: N, E, S, W.
const CARDINAL: [(i32, i32); 4] = [(0, -1), (1, 0), (0, 1), (-1, 0)];

/// Which moves a unit may take between cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MovementModel {
    /// Four neighbors, Manhattan heuristic.
    Cardinal,
    /// Eight neighbors, octile heuristic. Diagonals may not cut corners.
    #[default]
    Octile,
}

impl MovementModel {
    fn directions(self) -> &'static [(i32, i32)] {
        match self {
            Self::Cardinal => &CARDINAL,
            Self::Octile => &COMPASS,
        }
    }

    /// Scaled admissible estimate between two cells.
    #[must_use]
    pub fn heuristic(self, from: GridPos, to: GridPos) -> Fixed {
        let dx = from.x.abs_diff(to.x);
        let dy = from.y.abs_diff(to.y);
        let raw = match self {
            Self::Cardinal => manhattan_distance(dx, dy),
            Self::Octile => octile_distance(dx, dy),
        };
        raw * HEURISTIC_SCALE
    }
}

/// Lifecycle of a single search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchState {
    /// No search has run, or one is being set up.
    Init,
    /// Popping and expanding frontier nodes.
    Expanding,
    /// Goal reached.
    Found,
    /// Stopped early; the path leads toward the goal.
    PartialFound,
    /// Goal lies outside the start's connected region.
    Unreachable,
}

/// Outcome category of a finished search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PathStatus {
    /// The path ends at the goal.
    Found,
    /// The path ends at the node closest to the goal.
    PartialFound,
    /// No path exists on this surface.
    Unreachable,
}

/// Input to one search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathQuery {
    /// Starting cell (the mover's top-left corner).
    pub start: GridPos,
    /// Destination cell.
    pub goal: GridPos,
    /// Movement layer.
    pub surface: Surface,
    /// Footprint side length.
    pub size: u8,
    /// The mover's current footprint, ignored when checking occupancy.
    pub occupant: Option<Footprint>,
}

impl PathQuery {
    /// Query for a 1x1 land unit with no occupancy exclusion.
    #[must_use]
    pub const fn land(start: GridPos, goal: GridPos) -> Self {
        Self {
            start,
            goal,
            surface: Surface::Land,
            size: 1,
            occupant: None,
        }
    }
}

/// Result of one search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathResult {
    /// Found, partial or unreachable.
    pub status: PathStatus,
    /// Cells from start to the last reached cell, inclusive. Empty when unreachable.
    pub path: Vec<GridPos>,
    /// Cost of `path`.
    #[serde(with = "fixed_serde")]
    pub cost: Fixed,
    /// Nodes expanded.
    pub expanded: u32,
}

impl PathResult {
    fn unreachable() -> Self {
        Self {
            status: PathStatus::Unreachable,
            path: Vec::new(),
            cost: Fixed::ZERO,
            expanded: 0,
        }
    }
}

/// Runs A* searches with a reusable node pool.
#[derive(Debug, Clone)]
pub struct SearchEngine {
    pool: NodePool,
    movement: MovementModel,
    max_iterations: u32,
    state: SearchState,
}

enum Stop {
    Goal(NodeHandle),
    Early,
}

impl SearchEngine {
    /// Create an engine from planner settings.
    #[must_use]
    pub fn new(config: &PlannerConfig) -> Self {
        Self {
            pool: NodePool::new(config.pool_capacity),
            movement: config.movement,
            max_iterations: config.max_iterations,
            state: SearchState::Init,
        }
    }

    /// State of the most recent search.
    #[must_use]
    pub const fn state(&self) -> SearchState {
        self.state
    }

    /// Movement model in use.
    #[must_use]
    pub const fn movement(&self) -> MovementModel {
        self.movement
    }

    /// Find a path for `query`.
    ///
    /// # Errors
    ///
    /// Returns [`GameError::OutOfRange`] if the start or goal is outside the map.
    pub fn search(&mut self, map: &AnnotatedMap, query: &PathQuery) -> Result<PathResult> {
        self.state = SearchState::Init;
        let start_index = map.index(query.start)?;
        map.index(query.goal)?;

        if query.start == query.goal {
            self.state = SearchState::Found;
            return Ok(PathResult {
                status: PathStatus::Found,
                path: vec![query.start],
                cost: Fixed::ZERO,
                expanded: 0,
            });
        }

        if !map.same_region(query.start, query.goal, query.surface)? {
            self.state = SearchState::Unreachable;
            tracing::trace!(
                start = ?query.start,
                goal = ?query.goal,
                surface = ?query.surface,
                "goal outside start region"
            );
            return Ok(PathResult::unreachable());
        }

        self.pool.reset(map.cell_count());
        self.state = SearchState::Expanding;
        let start_h = self.movement.heuristic(query.start, query.goal);
        if let Err(err) = self
            .pool
            .allocate(query.start, start_index, Fixed::ZERO, start_h, None)
        {
            return match err {
                GameError::PoolExhausted { .. } => {
                    self.state = SearchState::PartialFound;
                    Ok(PathResult {
                        status: PathStatus::PartialFound,
                        path: vec![query.start],
                        cost: Fixed::ZERO,
                        expanded: 0,
                    })
                }
                other => Err(other),
            };
        }

        let mut expanded = 0u32;
        let stop = self.expand(map, query, &mut expanded)?;

        let (status, handle) = match stop {
            Stop::Goal(handle) => (PathStatus::Found, Some(handle)),
            Stop::Early => (PathStatus::PartialFound, self.pool.best_reached()),
        };
        let path = handle.map_or_else(|| vec![query.start], |h| self.pool.path_to(h));
        let cost = handle
            .and_then(|h| self.pool.node(h))
            .map_or(Fixed::ZERO, |node| node.g);

        self.state = match status {
            PathStatus::Found => SearchState::Found,
            PathStatus::PartialFound => SearchState::PartialFound,
            PathStatus::Unreachable => SearchState::Unreachable,
        };
        if status == PathStatus::PartialFound {
            tracing::debug!(
                start = ?query.start,
                goal = ?query.goal,
                reached = ?path.last(),
                expanded,
                "partial path"
            );
        }

        Ok(PathResult {
            status,
            path,
            cost,
            expanded,
        })
    }

    fn expand(&mut self, map: &AnnotatedMap, query: &PathQuery, expanded: &mut u32) -> Result<Stop> {
        let enterable = |pos: GridPos| {
            map.can_occupy(pos, query.surface, query.size, query.occupant)
                .unwrap_or(false)
        };

        loop {
            if *expanded >= self.max_iterations {
                return Ok(Stop::Early);
            }
            let Some(current) = self.pool.best_open_node() else {
                // Frontier exhausted: dynamic blockers seal off the goal.
                return Ok(Stop::Early);
            };
            *expanded += 1;
            let Some(node) = self.pool.node(current).copied() else {
                return Err(GameError::InvalidState("open node vanished".into()));
            };
            if node.pos == query.goal {
                return Ok(Stop::Goal(current));
            }

            for &(dx, dy) in self.movement.directions() {
                let Some(next) = node.pos.offset(dx, dy) else {
                    continue;
                };
                if !map.in_bounds(next) || !enterable(next) {
                    continue;
                }
                let diagonal = dx != 0 && dy != 0;
                if diagonal {
                    let side_a = node.pos.offset(dx, 0);
                    let side_b = node.pos.offset(0, dy);
                    if !side_a.is_some_and(enterable) || !side_b.is_some_and(enterable) {
                        continue;
                    }
                }

                let step = if diagonal { DIAGONAL_COST } else { STRAIGHT_COST };
                let g = node.g + step;
                let index = map.index_unchecked(next);
                if let Some(existing) = self.pool.find(index) {
                    let better = self.pool.node(existing).is_some_and(|known| g < known.g);
                    if better {
                        self.pool.reopen(existing, g, current)?;
                    }
                    continue;
                }

                let h = self.movement.heuristic(next, query.goal);
                match self.pool.allocate(next, index, g, h, Some(current)) {
                    Ok(_) => {}
                    Err(GameError::PoolExhausted { capacity }) => {
                        tracing::debug!(capacity, "node pool exhausted");
                        return Ok(Stop::Early);
                    }
                    Err(other) => return Err(other),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(pool_capacity: usize, max_iterations: u32, movement: MovementModel) -> SearchEngine {
        SearchEngine::new(&PlannerConfig {
            pool_capacity,
            max_iterations,
            movement,
            ..PlannerConfig::default()
        })
    }

    fn default_engine() -> SearchEngine {
        SearchEngine::new(&PlannerConfig::default())
    }

    fn pos(x: u32, y: u32) -> GridPos {
        GridPos::new(x, y)
    }

    #[test]
    fn test_straight_line() {
        let map = AnnotatedMap::new(8, 3).unwrap();
        let mut engine = default_engine();
        assert_eq!(engine.state(), SearchState::Init);
        let result = engine.search(&map, &PathQuery::land(pos(0, 1), pos(5, 1))).unwrap();
        assert_eq!(result.status, PathStatus::Found);
        assert_eq!(engine.state(), SearchState::Found);
        assert_eq!(result.path.len(), 6);
        assert_eq!(result.cost, Fixed::from_num(5));
        assert_eq!(result.path.first(), Some(&pos(0, 1)));
        assert_eq!(result.path.last(), Some(&pos(5, 1)));
    }

    #[test]
    fn test_diagonal_cost() {
        let map = AnnotatedMap::new(5, 5).unwrap();
        let mut engine = default_engine();
        let result = engine.search(&map, &PathQuery::land(pos(0, 0), pos(3, 3))).unwrap();
        assert_eq!(result.status, PathStatus::Found);
        assert_eq!(result.path.len(), 4);
        assert_eq!(result.cost, DIAGONAL_COST * Fixed::from_num(3));
    }

    #[test]
    fn test_start_equals_goal() {
        let map = AnnotatedMap::new(3, 3).unwrap();
        let mut engine = default_engine();
        let result = engine.search(&map, &PathQuery::land(pos(1, 1), pos(1, 1))).unwrap();
        assert_eq!(result.status, PathStatus::Found);
        assert_eq!(result.path, vec![pos(1, 1)]);
    }

    #[test]
    fn test_no_corner_cutting() {
        let map = AnnotatedMap::from_rows(&[
            "..", //
            "#.", //
        ])
        .unwrap();
        let mut engine = default_engine();
        // (1,0) -> (0,1) is impassable; (0,0) -> (1,1) must go around (0,1).
        let result = engine.search(&map, &PathQuery::land(pos(0, 0), pos(1, 1))).unwrap();
        assert_eq!(result.path, vec![pos(0, 0), pos(1, 0), pos(1, 1)]);
        assert_eq!(result.cost, Fixed::from_num(2));
    }

    #[test]
    fn test_walled_goal_is_unreachable() {
        let map = AnnotatedMap::from_rows(&[
            "......", //
            "...###", //
            "...#..", //
            "...###", //
        ])
        .unwrap();
        let mut engine = engine(4, 10, MovementModel::Octile);
        let result = engine.search(&map, &PathQuery::land(pos(0, 0), pos(4, 2))).unwrap();
        assert_eq!(result.status, PathStatus::Unreachable);
        assert!(result.path.is_empty());
        assert_eq!(engine.state(), SearchState::Unreachable);
    }

    #[test]
    fn test_obstructed_goal_is_unreachable() {
        let map = AnnotatedMap::from_rows(&["..#"]).unwrap();
        let mut engine = default_engine();
        let result = engine.search(&map, &PathQuery::land(pos(0, 0), pos(2, 0))).unwrap();
        assert_eq!(result.status, PathStatus::Unreachable);
    }

    #[test]
    fn test_out_of_range() {
        let map = AnnotatedMap::new(4, 4).unwrap();
        let mut engine = default_engine();
        let err = engine
            .search(&map, &PathQuery::land(pos(0, 0), pos(9, 0)))
            .unwrap_err();
        assert!(matches!(err, GameError::OutOfRange { x: 9, .. }));
    }

    #[test]
    fn test_pool_exhaustion_returns_partial() {
        let map = AnnotatedMap::new(32, 1).unwrap();
        let mut engine = engine(5, 10_000, MovementModel::Octile);
        let result = engine.search(&map, &PathQuery::land(pos(0, 0), pos(31, 0))).unwrap();
        assert_eq!(result.status, PathStatus::PartialFound);
        assert_eq!(engine.state(), SearchState::PartialFound);
        // Five nodes along a 1-wide strip reach x = 4.
        assert_eq!(result.path.last(), Some(&pos(4, 0)));
        assert_eq!(result.path.first(), Some(&pos(0, 0)));
    }

    #[test]
    fn test_iteration_cap_returns_partial() {
        let map = AnnotatedMap::new(32, 1).unwrap();
        let mut engine = engine(1024, 3, MovementModel::Octile);
        let result = engine.search(&map, &PathQuery::land(pos(0, 0), pos(31, 0))).unwrap();
        assert_eq!(result.status, PathStatus::PartialFound);
        assert_eq!(result.expanded, 3);
        assert_eq!(result.path.last(), Some(&pos(3, 0)));
    }

    #[test]
    fn test_dynamic_blocking_returns_partial() {
        let mut map = AnnotatedMap::new(6, 1).unwrap();
        map.add_occupant(Footprint::new(pos(3, 0), 1), Surface::Land)
            .unwrap();
        let mut engine = default_engine();
        let result = engine.search(&map, &PathQuery::land(pos(0, 0), pos(5, 0))).unwrap();
        assert_eq!(result.status, PathStatus::PartialFound);
        assert_eq!(result.path.last(), Some(&pos(2, 0)));
    }

    #[test]
    fn test_cardinal_movement() {
        let map = AnnotatedMap::new(4, 4).unwrap();
        let mut engine = engine(1024, 10_000, MovementModel::Cardinal);
        let result = engine.search(&map, &PathQuery::land(pos(0, 0), pos(2, 2))).unwrap();
        assert_eq!(result.status, PathStatus::Found);
        assert_eq!(result.cost, Fixed::from_num(4));
        for pair in result.path.windows(2) {
            assert_eq!(pair[0].chebyshev(pair[1]), 1);
            assert!(pair[0].x == pair[1].x || pair[0].y == pair[1].y);
        }
    }

    #[test]
    fn test_large_unit_needs_clearance() {
        let map = AnnotatedMap::from_rows(&[
            "......", //
            "......", //
            "###.##", //
            "......", //
            "......", //
        ])
        .unwrap();
        let mut engine = default_engine();
        let mut query = PathQuery::land(pos(0, 0), pos(0, 3));
        assert_eq!(engine.search(&map, &query).unwrap().status, PathStatus::Found);
        query.size = 2;
        let result = engine.search(&map, &query).unwrap();
        assert_eq!(result.status, PathStatus::PartialFound);
    }

    #[test]
    fn test_reuse_matches_fresh_engine() {
        let first = AnnotatedMap::from_rows(&[
            ".....", //
            ".###.", //
            ".....", //
        ])
        .unwrap();
        let second = AnnotatedMap::from_rows(&[
            "..#..", //
            "..#..", //
            ".....", //
        ])
        .unwrap();
        let query = PathQuery::land(pos(0, 0), pos(4, 0));

        let mut reused = default_engine();
        reused.search(&first, &query).unwrap();
        let again = reused.search(&second, &query).unwrap();
        let fresh = default_engine().search(&second, &query).unwrap();
        assert_eq!(again, fresh);
    }
}
