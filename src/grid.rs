//! Spatial partitioning of the simulation volume into a regular grid of boxes.
//!
//! Each box caches its neighbor list (computed once per grid build) and keeps,
//! per live list, the slots of the molecules currently filed in it. Box
//! membership is only changed through [`SpatialIndex::insert`] and
//! [`SpatialIndex::remove`], which the molecule pool drives during compaction.

use rdsim_common::{BoundaryType, GridSizing, SimParams, Vec3};

use crate::error::{SimError, SimResult};
use crate::surface::{PanelId, SurfaceGeometry};

/// Hard ceiling on the number of boxes a grid may have.
const MAX_BOXES: usize = 1 << 24;

/// How a neighbor relationship crosses the domain edge along one axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wrap {
    None,
    /// Reached by stepping below index 0; the neighbor's contents sit one period lower.
    Low,
    /// Reached by stepping past the last index; the neighbor's contents sit one period higher.
    High,
}

/// Two bits per axis: 00 none, 01 wrap-low, 10 wrap-high.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct WrapCode(u8);

impl WrapCode {
    pub const NONE: WrapCode = WrapCode(0);

    fn with(self, axis: usize, wrap: Wrap) -> WrapCode {
        let bits = match wrap {
            Wrap::None => 0,
            Wrap::Low => 1,
            Wrap::High => 2,
        };
        WrapCode((self.0 & !(0b11 << (2 * axis))) | (bits << (2 * axis)))
    }

    pub fn axis(self, axis: usize) -> Wrap {
        match (self.0 >> (2 * axis)) & 0b11 {
            1 => Wrap::Low,
            2 => Wrap::High,
            _ => Wrap::None,
        }
    }

    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    /// Offset to add to a position in the neighbor box to express it in the
    /// frame of the box that lists it.
    pub fn shift(self, period: Vec3) -> Vec3 {
        let mut out = Vec3::zero();
        for axis in 0..3 {
            out[axis] = match self.axis(axis) {
                Wrap::None => 0.0,
                Wrap::Low => -period[axis],
                Wrap::High => period[axis],
            };
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Neighbor {
    pub cell: usize,
    pub wrap: WrapCode,
    /// True for the lexicographically positive half of the offsets; iterating
    /// only these visits every unordered box pair (and periodic image) once.
    pub forward: bool,
}

#[derive(Debug, Clone, Default)]
pub struct GridBox {
    pub index: [usize; 3],
    pub neighbors: Vec<Neighbor>,
    pub panels: Vec<PanelId>,
    members: Vec<Vec<u32>>,
}

impl GridBox {
    pub fn members(&self, list: usize) -> &[u32] {
        self.members.get(list).map(|m| m.as_slice()).unwrap_or(&[])
    }

    pub fn occupancy(&self) -> usize {
        self.members.iter().map(|m| m.len()).sum()
    }
}

#[derive(Debug, Clone)]
pub struct SpatialIndex {
    dim: usize,
    low: Vec3,
    high: Vec3,
    side_count: [usize; 3],
    box_size: Vec3,
    inv_box_size: Vec3,
    periodic: [bool; 3],
    boxes: Vec<GridBox>,
}

impl SpatialIndex {
    /// Discretizes the volume described by `params`.
    ///
    /// `population` is the expected molecule count used with
    /// [`GridSizing::MoleculesPerBox`]; `min_box_side` keeps every box at
    /// least as wide as the largest interaction distance so that the 3^d
    /// neighbor template is sufficient.
    pub fn build(params: &SimParams, population: usize, min_box_side: f64, list_count: usize) -> SimResult<Self> {
        let dim = params.dim;
        for axis in 0..dim {
            if !(params.side(axis) > 0.0) || !params.side(axis).is_finite() {
                return Err(SimError::DegenerateDomain { axis });
            }
        }

        let target_side = match params.grid_sizing {
            GridSizing::BoxSize(size) => size,
            GridSizing::MoleculesPerBox(per_box) => {
                let boxes_wanted = (population as f64 / per_box.max(f64::MIN_POSITIVE)).max(1.0);
                (params.volume() / boxes_wanted).powf(1.0 / dim as f64)
            }
        };
        if !(target_side > 0.0) {
            return Err(SimError::InvalidParameter(format!("box size {} is not positive", target_side)));
        }

        let mut side_count = [1usize; 3];
        let mut box_size = Vec3::new(1.0, 1.0, 1.0);
        let mut periodic = [false; 3];
        for axis in 0..dim {
            let length = params.side(axis);
            let mut n = (length / target_side).round().max(1.0);
            if min_box_side > 0.0 && length / n < min_box_side {
                n = (length / min_box_side).floor().max(1.0);
            }
            if n > MAX_BOXES as f64 {
                return Err(SimError::OutOfMemory(format!("{} boxes along axis {}", n, axis)));
            }
            side_count[axis] = n as usize;
            box_size[axis] = length / n;
            periodic[axis] = params.boundaries[axis] == BoundaryType::Periodic;
        }
        let total = side_count
            .iter()
            .try_fold(1usize, |acc, n| acc.checked_mul(*n))
            .filter(|t| *t <= MAX_BOXES)
            .ok_or_else(|| SimError::OutOfMemory(format!("grid of {:?} boxes", side_count)))?;

        let mut inv_box_size = Vec3::zero();
        for axis in 0..3 {
            inv_box_size[axis] = 1.0 / box_size[axis];
        }

        let mut boxes = Vec::new();
        boxes.try_reserve_exact(total)?;
        let mut grid = SpatialIndex {
            dim,
            low: params.low,
            high: params.high,
            side_count,
            box_size,
            inv_box_size,
            periodic,
            boxes,
        };
        for flat in 0..total {
            let mut members = Vec::new();
            members.try_reserve_exact(list_count)?;
            members.resize_with(list_count, Vec::new);
            let index = grid.unflatten(flat);
            grid.boxes.push(GridBox { index, members, ..GridBox::default() });
        }
        grid.build_neighbors();

        log::info!(
            "Built {} boxes ({:?}) with box size {:.4e} x {:.4e} x {:.4e}.",
            total,
            &side_count[..dim],
            box_size.x,
            box_size.y,
            box_size.z
        );
        Ok(grid)
    }

    fn unflatten(&self, mut flat: usize) -> [usize; 3] {
        let mut index = [0usize; 3];
        for axis in 0..3 {
            index[axis] = flat % self.side_count[axis];
            flat /= self.side_count[axis];
        }
        index
    }

    fn flatten(&self, index: [usize; 3]) -> usize {
        index[0] + self.side_count[0] * (index[1] + self.side_count[1] * index[2])
    }

    fn build_neighbors(&mut self) {
        let dim = self.dim;
        let offsets: Vec<[i64; 3]> = neighbor_offsets(dim);
        for flat in 0..self.boxes.len() {
            let index = self.boxes[flat].index;
            let mut neighbors = Vec::with_capacity(offsets.len());
            'offsets: for offset in &offsets {
                let mut target = [0usize; 3];
                let mut wrap = WrapCode::NONE;
                for axis in 0..3 {
                    let n = self.side_count[axis] as i64;
                    let mut i = index[axis] as i64 + offset[axis];
                    if i < 0 {
                        if !self.periodic[axis] {
                            continue 'offsets;
                        }
                        i += n;
                        wrap = wrap.with(axis, Wrap::Low);
                    } else if i >= n {
                        if !self.periodic[axis] {
                            continue 'offsets;
                        }
                        i -= n;
                        wrap = wrap.with(axis, Wrap::High);
                    }
                    target[axis] = i as usize;
                }
                neighbors.push(Neighbor {
                    cell: self.flatten(target),
                    wrap,
                    forward: is_forward(offset),
                });
            }
            self.boxes[flat].neighbors = neighbors;
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn len(&self) -> usize {
        self.boxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }

    pub fn side_count(&self) -> [usize; 3] {
        self.side_count
    }

    pub fn box_size(&self) -> Vec3 {
        self.box_size
    }

    /// Length of the system along each axis.
    pub fn period(&self) -> Vec3 {
        self.high - self.low
    }

    pub fn get(&self, cell: usize) -> &GridBox {
        &self.boxes[cell]
    }

    pub fn boxes(&self) -> &[GridBox] {
        &self.boxes
    }

    /// Box containing `pos`; coordinates outside the grid clamp to the edge boxes.
    #[inline(always)]
    pub fn locate(&self, pos: Vec3) -> usize {
        let mut index = [0usize; 3];
        for axis in 0..self.dim {
            let f = ((pos[axis] - self.low[axis]) * self.inv_box_size[axis]).floor();
            let max = (self.side_count[axis] - 1) as f64;
            // NaN clamps to 0 through the `max(0.0)` below
            index[axis] = f.min(max).max(0.0) as usize;
        }
        self.flatten(index)
    }

    pub fn neighbors(&self, cell: usize) -> &[Neighbor] {
        &self.boxes[cell].neighbors
    }

    /// Lower and upper corners of a box.
    pub fn bounds(&self, cell: usize) -> (Vec3, Vec3) {
        let index = self.boxes[cell].index;
        let mut lo = self.low;
        let mut hi = self.low;
        for axis in 0..self.dim {
            lo[axis] = self.low[axis] + index[axis] as f64 * self.box_size[axis];
            hi[axis] = lo[axis] + self.box_size[axis];
        }
        (lo, hi)
    }

    /// Squared distance from `point` to the closest point of box `cell`.
    pub fn closest_distance_squared(&self, cell: usize, point: Vec3) -> f64 {
        let (lo, hi) = self.bounds(cell);
        let mut d2 = 0.0;
        for axis in 0..self.dim {
            let x = point[axis];
            let d = if x < lo[axis] {
                lo[axis] - x
            } else if x > hi[axis] {
                x - hi[axis]
            } else {
                0.0
            };
            d2 += d * d;
        }
        d2
    }

    /// Lazy sequence of boxes within `radius` of `point`.
    pub fn scan_radius(&self, point: Vec3, radius: f64) -> ScanRadius<'_> {
        let mut first = [0usize; 3];
        let mut span = [1usize; 3];
        for axis in 0..self.dim {
            let lo = self.index_along(axis, point[axis] - radius);
            let hi = self.index_along(axis, point[axis] + radius);
            first[axis] = lo;
            span[axis] = hi - lo + 1;
        }
        ScanRadius {
            grid: self,
            point,
            radius_squared: radius * radius,
            first,
            span,
            counter: [0; 3],
            done: false,
        }
    }

    fn index_along(&self, axis: usize, x: f64) -> usize {
        let f = ((x - self.low[axis]) * self.inv_box_size[axis]).floor();
        f.min((self.side_count[axis] - 1) as f64).max(0.0) as usize
    }

    /// Records, for every box, which surface panels intersect it.
    pub fn assign_panels(&mut self, surfaces: &dyn SurfaceGeometry) {
        let mut assigned = 0;
        for cell in 0..self.boxes.len() {
            let (lo, hi) = self.bounds(cell);
            let panels = surfaces.panels_in_box(lo, hi);
            assigned += panels.len();
            self.boxes[cell].panels = panels;
        }
        log::debug!("Assigned {} panel/box intersections.", assigned);
    }

    /// Panels in boxes within `radius` of `point`, without duplicates.
    pub fn panels_near(&self, point: Vec3, radius: f64) -> Vec<PanelId> {
        let mut panels: Vec<PanelId> = self
            .scan_radius(point, radius)
            .flat_map(|cell| self.boxes[cell].panels.iter().copied())
            .collect();
        panels.sort_unstable();
        panels.dedup();
        panels
    }

    /// Makes room for `list_count` live lists in every box.
    pub fn ensure_lists(&mut self, list_count: usize) -> SimResult<()> {
        for b in &mut self.boxes {
            if b.members.len() < list_count {
                b.members.try_reserve(list_count - b.members.len())?;
                b.members.resize_with(list_count, Vec::new);
            }
        }
        Ok(())
    }

    /// Files `slot` under `list` in box `cell`; returns its position in that array.
    pub fn insert(&mut self, cell: usize, list: usize, slot: u32) -> SimResult<u32> {
        let members = &mut self.boxes[cell].members;
        if members.len() <= list {
            members.resize_with(list + 1, Vec::new);
        }
        let array = &mut members[list];
        if array.len() == array.capacity() {
            array.try_reserve(array.len().max(4))?;
        }
        array.push(slot);
        Ok((array.len() - 1) as u32)
    }

    /// Removes the entry at `position` by swapping in the last one. Returns the
    /// slot that now occupies `position`, if any, so its owner can be updated.
    pub fn remove(&mut self, cell: usize, list: usize, position: u32) -> Option<u32> {
        let array = self.boxes.get_mut(cell)?.members.get_mut(list)?;
        let position = position as usize;
        if position >= array.len() {
            log::error!("Box {} list {} has no entry at {}.", cell, list, position);
            return None;
        }
        array.swap_remove(position);
        array.get(position).copied()
    }

    pub fn members(&self, cell: usize, list: usize) -> &[u32] {
        self.boxes[cell].members(list)
    }

    /// Total number of filed molecules across all boxes.
    pub fn occupancy(&self) -> usize {
        self.boxes.iter().map(|b| b.occupancy()).sum()
    }
}

/// Neighbor offsets in {-1,0,1}^dim, excluding the origin.
fn neighbor_offsets(dim: usize) -> Vec<[i64; 3]> {
    let mut out = Vec::with_capacity(26);
    let range = |axis: usize| if axis < dim { -1i64..=1 } else { 0i64..=0 };
    for dz in range(2) {
        for dy in range(1) {
            for dx in range(0) {
                if dx != 0 || dy != 0 || dz != 0 {
                    out.push([dx, dy, dz]);
                }
            }
        }
    }
    out
}

/// First non-zero component (taken from the highest axis down) is positive.
fn is_forward(offset: &[i64; 3]) -> bool {
    for axis in (0..3).rev() {
        if offset[axis] != 0 {
            return offset[axis] > 0;
        }
    }
    false
}

/// Iterator over boxes near a point. Walks an odometer over the box-index
/// range covered by the query sphere and yields boxes whose closest point
/// lies within the radius. Finishes when the last digit overflows.
#[derive(Debug, Clone)]
pub struct ScanRadius<'a> {
    grid: &'a SpatialIndex,
    point: Vec3,
    radius_squared: f64,
    first: [usize; 3],
    span: [usize; 3],
    counter: [usize; 3],
    done: bool,
}

impl ScanRadius<'_> {
    /// Rewinds the scan to its first box.
    pub fn restart(&mut self) {
        self.counter = [0; 3];
        self.done = false;
    }

    fn advance(&mut self) {
        for axis in 0..3 {
            self.counter[axis] += 1;
            if self.counter[axis] < self.span[axis] {
                return;
            }
            self.counter[axis] = 0;
        }
        self.done = true;
    }
}

impl Iterator for ScanRadius<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        while !self.done {
            let index = [
                self.first[0] + self.counter[0],
                self.first[1] + self.counter[1],
                self.first[2] + self.counter[2],
            ];
            self.advance();
            let cell = self.grid.flatten(index);
            if self.grid.closest_distance_squared(cell, self.point) <= self.radius_squared {
                return Some(cell);
            }
        }
        None
    }
}
