//! Annotated map: static and dynamic traversability for every cell.
//!
//! The map stores, per cell, the static terrain and obstruction flags, a
//! dynamic occupancy count for each [`Surface`], and the resource amount.
//! Derived metrics (clearance and connectivity regions) are kept in sync
//! by the mutating methods so searches can borrow the map immutably.
//!
//! # Clearance
//!
//! The clearance of a cell is the side length of the largest square
//! footprint, with the cell as its top-left corner, that fits on passable
//! terrain. It is capped at [`MAX_CLEARANCE`]. A unit of size `n` may stand
//! at a cell only if its clearance is at least `n`.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::error::{GameError, Result};

/// Largest footprint tracked by the clearance metric.
pub const MAX_CLEARANCE: u8 = 4;

/// Resource amount placed by `$` in [`AnnotatedMap::from_rows`].
pub const DEFAULT_RESOURCE_AMOUNT: u32 = 100;

/// A cell coordinate. `y` grows southward.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct GridPos {
    /// Column.
    pub x: u32,
    /// Row.
    pub y: u32,
}

impl GridPos {
    /// Create a new cell coordinate.
    #[must_use]
    pub const fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }

    /// Offset by a signed delta. Returns `None` on underflow.
    #[must_use]
    pub fn offset(self, dx: i32, dy: i32) -> Option<Self> {
        let x = self.x.checked_add_signed(dx)?;
        let y = self.y.checked_add_signed(dy)?;
        Some(Self { x, y })
    }

    /// Chebyshev (king-move) distance to another cell.
    #[must_use]
    pub fn chebyshev(self, other: Self) -> u32 {
        self.x.abs_diff(other.x).max(self.y.abs_diff(other.y))
    }
}

/// Movement layer a unit occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum Surface {
    /// Ground units.
    #[default]
    Land,
    /// Flying units. Every in-bounds cell is passable.
    Air,
    /// Naval units.
    Water,
}

impl Surface {
    /// All surfaces in index order.
    pub const ALL: [Self; 3] = [Self::Land, Self::Air, Self::Water];

    /// Index into per-surface arrays.
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::Land => 0,
            Self::Air => 1,
            Self::Water => 2,
        }
    }
}

/// Static terrain kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Terrain {
    /// Solid ground.
    #[default]
    Ground,
    /// Open water.
    Water,
}

/// A square area of cells anchored at its top-left corner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Footprint {
    /// Top-left cell.
    pub origin: GridPos,
    /// Side length in cells.
    pub size: u8,
}

impl Footprint {
    /// Create a footprint. A size of zero is treated as one.
    #[must_use]
    pub const fn new(origin: GridPos, size: u8) -> Self {
        let size = if size == 0 { 1 } else { size };
        Self { origin, size }
    }

    /// Whether `pos` lies inside this footprint.
    #[must_use]
    pub fn contains(&self, pos: GridPos) -> bool {
        let size = u32::from(self.size);
        pos.x >= self.origin.x
            && pos.y >= self.origin.y
            && pos.x - self.origin.x < size
            && pos.y - self.origin.y < size
    }

    /// Cells covered, in row-major order.
    pub fn cells(&self) -> impl Iterator<Item = GridPos> + '_ {
        let size = u32::from(self.size);
        (0..size).flat_map(move |dy| {
            (0..size).map(move |dx| GridPos::new(self.origin.x + dx, self.origin.y + dy))
        })
    }

    /// Bottom-right cell covered by the footprint.
    fn far_corner(&self) -> Option<GridPos> {
        let extent = i32::from(self.size) - 1;
        self.origin.offset(extent, extent)
    }
}

/// Per-cell data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Cell {
    /// Static terrain.
    pub terrain: Terrain,
    /// Static obstruction (cliff, structure, wall).
    pub obstructed: bool,
    /// Number of occupants per surface.
    pub occupancy: [u16; 3],
    /// Harvestable resource remaining.
    pub resource: u32,
}

impl Cell {
    /// Static passability for a surface, ignoring occupants.
    #[must_use]
    pub fn is_passable(&self, surface: Surface) -> bool {
        match surface {
            Surface::Land => self.terrain == Terrain::Ground && !self.obstructed,
            Surface::Water => self.terrain == Terrain::Water && !self.obstructed,
            Surface::Air => true,
        }
    }
}

/// The annotated grid for one map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnotatedMap {
    width: u32,
    height: u32,
    cells: Vec<Cell>,
    /// Per-surface clearance, see module docs.
    clearance: Vec<[u8; 3]>,
    /// Per-surface static connectivity label. Zero means impassable.
    regions: Vec<[u32; 3]>,
    /// Bumped on every mutation.
    version: u64,
    /// Running sum of occupancy deltas since the last rebuild.
    occupancy_total: u64,
    /// Cells whose passability changed since the last drain.
    #[serde(skip)]
    dirty: Vec<GridPos>,
}

impl AnnotatedMap {
    /// Create a map of open ground.
    ///
    /// # Errors
    ///
    /// Returns [`GameError::InvalidMap`] if either dimension is zero.
    pub fn new(width: u32, height: u32) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(GameError::InvalidMap(format!(
                "dimensions must be positive, got {width}x{height}"
            )));
        }
        let count = (width as usize) * (height as usize);
        let mut map = Self {
            width,
            height,
            cells: vec![Cell::default(); count],
            clearance: vec![[0; 3]; count],
            regions: vec![[0; 3]; count],
            version: 0,
            occupancy_total: 0,
            dirty: Vec::new(),
        };
        map.rebuild_metrics();
        Ok(map)
    }

    /// Parse an ASCII map.
    ///
    /// `.` is ground, `#` an obstruction, `~` water and `$` ground holding
    /// [`DEFAULT_RESOURCE_AMOUNT`] resources. All rows must have equal length.
    ///
    /// # Errors
    ///
    /// Returns [`GameError::InvalidMap`] on ragged rows or unknown glyphs.
    pub fn from_rows(rows: &[&str]) -> Result<Self> {
        let height = u32::try_from(rows.len())
            .map_err(|_| GameError::InvalidMap("too many rows".into()))?;
        let width = rows.first().map_or(0, |row| row.chars().count());
        let width =
            u32::try_from(width).map_err(|_| GameError::InvalidMap("row too long".into()))?;
        let mut map = Self::new(width, height)?;

        for (y, row) in rows.iter().enumerate() {
            if row.chars().count() != width as usize {
                return Err(GameError::InvalidMap(format!(
                    "row {y} has {} cells, expected {width}",
                    row.chars().count()
                )));
            }
            for (x, glyph) in row.chars().enumerate() {
                let cell = &mut map.cells[y * width as usize + x];
                match glyph {
                    '.' => {}
                    '#' => cell.obstructed = true,
                    '~' => cell.terrain = Terrain::Water,
                    '$' => cell.resource = DEFAULT_RESOURCE_AMOUNT,
                    other => {
                        return Err(GameError::InvalidMap(format!(
                            "unknown glyph '{other}' at ({x}, {y})"
                        )))
                    }
                }
            }
        }

        map.rebuild_metrics();
        Ok(map)
    }

    /// Map width in cells.
    #[must_use]
    pub const fn width(&self) -> u32 {
        self.width
    }

    /// Map height in cells.
    #[must_use]
    pub const fn height(&self) -> u32 {
        self.height
    }

    /// Number of cells.
    #[must_use]
    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    /// Mutation counter. Every change to the map bumps it.
    #[must_use]
    pub const fn version(&self) -> u64 {
        self.version
    }

    /// Check if a cell is within the map.
    #[must_use]
    pub fn in_bounds(&self, pos: GridPos) -> bool {
        pos.x < self.width && pos.y < self.height
    }

    /// Row-major index of a cell.
    ///
    /// # Errors
    ///
    /// Returns [`GameError::OutOfRange`] if the cell is outside the map.
    pub fn index(&self, pos: GridPos) -> Result<usize> {
        if self.in_bounds(pos) {
            Ok(self.index_unchecked(pos))
        } else {
            Err(self.out_of_range(pos))
        }
    }

    #[inline]
    pub(crate) fn index_unchecked(&self, pos: GridPos) -> usize {
        (pos.y as usize) * (self.width as usize) + (pos.x as usize)
    }

    fn out_of_range(&self, pos: GridPos) -> GameError {
        GameError::OutOfRange {
            x: i64::from(pos.x),
            y: i64::from(pos.y),
            width: self.width,
            height: self.height,
        }
    }

    /// Read a cell.
    ///
    /// # Errors
    ///
    /// Returns [`GameError::OutOfRange`] if the cell is outside the map.
    pub fn cell(&self, pos: GridPos) -> Result<&Cell> {
        let index = self.index(pos)?;
        Ok(&self.cells[index])
    }

    /// Static passability, ignoring occupants.
    ///
    /// # Errors
    ///
    /// Returns [`GameError::OutOfRange`] if the cell is outside the map.
    pub fn is_passable(&self, pos: GridPos, surface: Surface) -> Result<bool> {
        Ok(self.cell(pos)?.is_passable(surface))
    }

    /// Whether a single-cell unit on `surface` could enter `pos` right now.
    ///
    /// # Errors
    ///
    /// Returns [`GameError::OutOfRange`] if the cell is outside the map.
    pub fn is_free(&self, pos: GridPos, surface: Surface) -> Result<bool> {
        let cell = self.cell(pos)?;
        Ok(cell.is_passable(surface) && cell.occupancy[surface.index()] == 0)
    }

    /// Clearance metric for a cell.
    ///
    /// # Errors
    ///
    /// Returns [`GameError::OutOfRange`] if the cell is outside the map.
    pub fn clearance(&self, pos: GridPos, surface: Surface) -> Result<u8> {
        let index = self.index(pos)?;
        Ok(self.clearance[index][surface.index()])
    }

    /// Whether a unit of `size` could stand with its top-left corner at `pos`.
    ///
    /// Occupancy inside `exclude` (the mover's own footprint) is ignored.
    ///
    /// # Errors
    ///
    /// Returns [`GameError::OutOfRange`] if `pos` is outside the map.
    pub fn can_occupy(
        &self,
        pos: GridPos,
        surface: Surface,
        size: u8,
        exclude: Option<Footprint>,
    ) -> Result<bool> {
        let footprint = Footprint::new(pos, size);
        if self.clearance(pos, surface)? < footprint.size {
            return Ok(false);
        }
        let layer = surface.index();
        let free = footprint.cells().all(|cell| {
            let mut count = self.cells[self.index_unchecked(cell)].occupancy[layer];
            if exclude.is_some_and(|own| own.contains(cell)) {
                count = count.saturating_sub(1);
            }
            count == 0
        });
        Ok(free)
    }

    /// Static connectivity label, `None` if the cell is impassable.
    ///
    /// # Errors
    ///
    /// Returns [`GameError::OutOfRange`] if the cell is outside the map.
    pub fn region(&self, pos: GridPos, surface: Surface) -> Result<Option<u32>> {
        let index = self.index(pos)?;
        let label = self.regions[index][surface.index()];
        Ok((label != 0).then_some(label))
    }

    /// Whether two cells are statically connected on `surface`.
    ///
    /// # Errors
    ///
    /// Returns [`GameError::OutOfRange`] if either cell is outside the map.
    pub fn same_region(&self, a: GridPos, b: GridPos, surface: Surface) -> Result<bool> {
        let ra = self.region(a, surface)?;
        let rb = self.region(b, surface)?;
        Ok(ra.is_some() && ra == rb)
    }

    /// Place an occupant.
    ///
    /// # Errors
    ///
    /// Returns [`GameError::OutOfRange`] if any footprint cell is outside the map.
    pub fn add_occupant(&mut self, footprint: Footprint, surface: Surface) -> Result<()> {
        self.check_footprint(footprint)?;
        let layer = surface.index();
        for pos in footprint.cells() {
            let index = self.index_unchecked(pos);
            self.cells[index].occupancy[layer] += 1;
            self.occupancy_total += 1;
            self.dirty.push(pos);
        }
        self.version += 1;
        self.debug_validate();
        Ok(())
    }

    /// Remove an occupant previously placed with [`add_occupant`](Self::add_occupant).
    ///
    /// # Errors
    ///
    /// Returns [`GameError::OutOfRange`] if any footprint cell is outside the
    /// map, or [`GameError::InvalidState`] if a cell has no occupant to remove.
    pub fn remove_occupant(&mut self, footprint: Footprint, surface: Surface) -> Result<()> {
        self.check_footprint(footprint)?;
        let layer = surface.index();
        if let Some(empty) = footprint
            .cells()
            .find(|pos| self.cells[self.index_unchecked(*pos)].occupancy[layer] == 0)
        {
            return Err(GameError::InvalidState(format!(
                "no {surface:?} occupant at ({}, {})",
                empty.x, empty.y
            )));
        }
        for pos in footprint.cells() {
            let index = self.index_unchecked(pos);
            self.cells[index].occupancy[layer] -= 1;
            self.occupancy_total -= 1;
            self.dirty.push(pos);
        }
        self.version += 1;
        self.debug_validate();
        Ok(())
    }

    fn check_footprint(&self, footprint: Footprint) -> Result<()> {
        self.index(footprint.origin)?;
        match footprint.far_corner() {
            Some(corner) if self.in_bounds(corner) => Ok(()),
            Some(corner) => Err(self.out_of_range(corner)),
            None => Err(self.out_of_range(footprint.origin)),
        }
    }

    /// Set or clear a static obstruction and refresh metrics.
    ///
    /// # Errors
    ///
    /// Returns [`GameError::OutOfRange`] if the cell is outside the map.
    pub fn set_obstructed(&mut self, pos: GridPos, obstructed: bool) -> Result<()> {
        let index = self.index(pos)?;
        if self.cells[index].obstructed == obstructed {
            return Ok(());
        }
        self.cells[index].obstructed = obstructed;
        self.update_map_metrics(pos)?;
        self.rebuild_regions();
        tracing::trace!(x = pos.x, y = pos.y, obstructed, "obstruction changed");
        Ok(())
    }

    /// Resource amount at a cell.
    ///
    /// # Errors
    ///
    /// Returns [`GameError::OutOfRange`] if the cell is outside the map.
    pub fn resource(&self, pos: GridPos) -> Result<u32> {
        Ok(self.cell(pos)?.resource)
    }

    /// Overwrite the resource amount at a cell.
    ///
    /// # Errors
    ///
    /// Returns [`GameError::OutOfRange`] if the cell is outside the map.
    pub fn set_resource(&mut self, pos: GridPos, amount: u32) -> Result<()> {
        let index = self.index(pos)?;
        self.cells[index].resource = amount;
        self.version += 1;
        Ok(())
    }

    /// Take up to `amount` resources from a cell. Returns what was taken.
    ///
    /// # Errors
    ///
    /// Returns [`GameError::OutOfRange`] if the cell is outside the map.
    pub fn extract_resource(&mut self, pos: GridPos, amount: u32) -> Result<u32> {
        let index = self.index(pos)?;
        let cell = &mut self.cells[index];
        let taken = cell.resource.min(amount);
        if taken > 0 {
            cell.resource -= taken;
            self.version += 1;
        }
        Ok(taken)
    }

    /// Recompute the clearance metrics affected by a change at `pos`.
    ///
    /// A cell's clearance depends on the cells to its right and below, so
    /// the window spans up to `MAX_CLEARANCE - 1` cells up and left of
    /// `pos`. It is processed bottom-right first.
    ///
    /// # Errors
    ///
    /// Returns [`GameError::OutOfRange`] if the cell is outside the map.
    pub fn update_map_metrics(&mut self, pos: GridPos) -> Result<()> {
        self.index(pos)?;
        let reach = u32::from(MAX_CLEARANCE) - 1;
        let x0 = pos.x.saturating_sub(reach);
        let y0 = pos.y.saturating_sub(reach);
        for y in (y0..=pos.y).rev() {
            for x in (x0..=pos.x).rev() {
                self.recompute_clearance(GridPos::new(x, y));
            }
        }
        self.dirty.push(pos);
        self.version += 1;
        Ok(())
    }

    fn recompute_clearance(&mut self, pos: GridPos) {
        let index = self.index_unchecked(pos);
        let mut values = [0u8; 3];
        for surface in Surface::ALL {
            let layer = surface.index();
            if !self.cells[index].is_passable(surface) {
                continue;
            }
            let right = self.clearance_or_zero(pos.offset(1, 0), layer);
            let down = self.clearance_or_zero(pos.offset(0, 1), layer);
            let diagonal = self.clearance_or_zero(pos.offset(1, 1), layer);
            values[layer] = (1 + right.min(down).min(diagonal)).min(MAX_CLEARANCE);
        }
        self.clearance[index] = values;
    }

    fn clearance_or_zero(&self, pos: Option<GridPos>, layer: usize) -> u8 {
        match pos {
            Some(pos) if self.in_bounds(pos) => self.clearance[self.index_unchecked(pos)][layer],
            _ => 0,
        }
    }

    /// Full rebuild of clearance and region metrics.
    pub fn rebuild_metrics(&mut self) {
        for y in (0..self.height).rev() {
            for x in (0..self.width).rev() {
                self.recompute_clearance(GridPos::new(x, y));
            }
        }
        self.rebuild_regions();
        self.occupancy_total = self
            .cells
            .iter()
            .flat_map(|cell| cell.occupancy)
            .map(u64::from)
            .sum();
        self.version += 1;
    }

    /// Label 4-connected passable areas per surface in row-major order.
    fn rebuild_regions(&mut self) {
        let width = self.width as usize;
        let mut queue = VecDeque::new();
        for surface in Surface::ALL {
            let layer = surface.index();
            for labels in &mut self.regions {
                labels[layer] = 0;
            }
            let mut next_label = 1u32;
            for seed in 0..self.cells.len() {
                if self.regions[seed][layer] != 0 || !self.cells[seed].is_passable(surface) {
                    continue;
                }
                self.regions[seed][layer] = next_label;
                queue.push_back(seed);
                while let Some(index) = queue.pop_front() {
                    let x = index % width;
                    let y = index / width;
                    let mut neighbors = [None; 4];
                    if y > 0 {
                        neighbors[0] = Some(index - width);
                    }
                    if x + 1 < width {
                        neighbors[1] = Some(index + 1);
                    }
                    if y + 1 < self.height as usize {
                        neighbors[2] = Some(index + width);
                    }
                    if x > 0 {
                        neighbors[3] = Some(index - 1);
                    }
                    for next in neighbors.into_iter().flatten() {
                        if self.regions[next][layer] == 0 && self.cells[next].is_passable(surface)
                        {
                            self.regions[next][layer] = next_label;
                            queue.push_back(next);
                        }
                    }
                }
                next_label += 1;
            }
        }
    }

    /// Drain the cells whose passability changed since the last call.
    pub fn take_dirty(&mut self) -> Vec<GridPos> {
        std::mem::take(&mut self.dirty)
    }

    /// Check that the running occupancy total matches the per-cell counts.
    #[must_use]
    pub fn verify_occupancy(&self) -> bool {
        let counted: u64 = self
            .cells
            .iter()
            .flat_map(|cell| cell.occupancy)
            .map(u64::from)
            .sum();
        counted == self.occupancy_total
    }

    #[inline]
    fn debug_validate(&self) {
        #[cfg(feature = "debug-validation")]
        debug_assert!(self.verify_occupancy(), "occupancy ledger out of sync");
    }
}
