use core::ops::Range;
use serde::{Deserialize, Serialize};




/**
 * Identifier for a Cartesian axis
 */
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Axis {
    I,
    J,
}




// ============================================================================
impl Axis {

    /**
     * Both axes, in storage order.
     */
    pub const BOTH: [Axis; 2] = [Axis::I, Axis::J];


    /**
     * Return the axis as an index (0 or 1), for selecting velocity components
     * or one of a pair of face arrays.
     */
    pub fn index(self) -> usize {
        match self {
            Axis::I => 0,
            Axis::J => 1,
        }
    }


    /**
     * Return the axis transverse to this one.
     */
    pub fn other(self) -> Self {
        match self {
            Axis::I => Axis::J,
            Axis::J => Axis::I,
        }
    }


    /**
     * Return an index offset of `delta` along this axis.
     */
    pub fn offset(self, delta: i64) -> (i64, i64) {
        match self {
            Axis::I => (delta, 0),
            Axis::J => (0, delta),
        }
    }


    /**
     * Return the component of an index along this axis.
     */
    pub fn of(self, index: (i64, i64)) -> i64 {
        match self {
            Axis::I => index.0,
            Axis::J => index.1,
        }
    }
}




/**
 * Translate an index by an offset.
 */
pub fn shift(index: (i64, i64), delta: (i64, i64)) -> (i64, i64) {
    (index.0 + delta.0, index.1 + delta.1)
}




/**
 * Represents a rectangular region in a discrete index space. The same type
 * describes cell, face, and node lattices; which one is meant is a matter of
 * context (see `faces` and `nodes`).
 */
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexSpace {
    di: Range<i64>,
    dj: Range<i64>,
}




/**
 * Describes a rectangular index space. The index type is signed 64-bit integer.
 */
impl IndexSpace {


    pub fn new(di: Range<i64>, dj: Range<i64>) -> Self {

        assert!(
            di.start <= di.end && dj.start <= dj.end,
            "index space has negative volume");

        Self { di, dj }
    }


    /**
     * Return the number of indexes on each axis.
     */
    pub fn dim(&self) -> (usize, usize) {
        ((self.di.end - self.di.start) as usize,
         (self.dj.end - self.dj.start) as usize)
    }


    /**
     * Return the number of elements in this index space.
     */
    pub fn len(&self) -> usize {
        let (l, m) = self.dim();
        l * m
    }


    /**
     * Return true if this index space has no elements.
     */
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }


    /**
     * Return the minimum index (inclusive).
     */
    pub fn start(&self) -> (i64, i64) {
        (self.di.start, self.dj.start)
    }


    /**
     * Return the maximum index (exclusive).
     */
    pub fn end(&self) -> (i64, i64) {
        (self.di.end, self.dj.end)
    }


    /**
     * Return the index range along the given axis.
     */
    pub fn range(&self, axis: Axis) -> Range<i64> {
        match axis {
            Axis::I => self.di.clone(),
            Axis::J => self.dj.clone(),
        }
    }


    /**
     * Determine whether this index space contains the given index.
     */
    pub fn contains(&self, index: (i64, i64)) -> bool {
        self.di.contains(&index.0) && self.dj.contains(&index.1)
    }


    /**
     * Determine whether another index space is a subset of this one.
     */
    pub fn contains_space(&self, other: &Self) -> bool {
        other.di.start >= self.di.start && other.di.end <= self.di.end &&
        other.dj.start >= self.dj.start && other.dj.end <= self.dj.end
    }


    /**
     * Expand this index space by the given number of elements on each axis.
     */
    pub fn extend_all(&self, delta: i64) -> Self {
        Self::new(
            self.di.start - delta .. self.di.end + delta,
            self.dj.start - delta .. self.dj.end + delta)
    }


    /**
     * Extend just the upper elements of this index space by a certain amount
     * on the given axis.
     */
    pub fn extend_upper(&self, delta: i64, axis: Axis) -> Self {
        match axis {
            Axis::I => Self::new(self.di.start .. self.di.end + delta, self.dj.clone()),
            Axis::J => Self::new(self.di.clone(), self.dj.start .. self.dj.end + delta),
        }
    }


    /**
     * Trim just the lower elements of this index space by a certain amount on
     * the given axis.
     */
    pub fn trim_lower(&self, delta: i64, axis: Axis) -> Self {
        match axis {
            Axis::I => Self::new(self.di.start + delta .. self.di.end, self.dj.clone()),
            Axis::J => Self::new(self.di.clone(), self.dj.start + delta .. self.dj.end),
        }
    }


    /**
     * Translate this index space by the given amount along an axis.
     */
    pub fn translate(&self, delta: i64, axis: Axis) -> Self {
        match axis {
            Axis::I => Self::new(self.di.start + delta .. self.di.end + delta, self.dj.clone()),
            Axis::J => Self::new(self.di.clone(), self.dj.start + delta .. self.dj.end + delta),
        }
    }


    /**
     * Translate this index space by an offset on both axes.
     */
    pub fn shifted(&self, delta: (i64, i64)) -> Self {
        Self::new(
            self.di.start + delta.0 .. self.di.end + delta.0,
            self.dj.start + delta.1 .. self.dj.end + delta.1)
    }


    /**
     * Return the single layer of indexes at the lower (`upper == false`) or
     * upper end of this space on the given axis. For a face or node space
     * this is the boundary face or node line.
     */
    pub fn slab(&self, axis: Axis, upper: bool) -> Self {
        let r = self.range(axis);
        let at = if upper { r.end - 1 .. r.end } else { r.start .. r.start + 1 };
        match axis {
            Axis::I => Self::new(at, self.dj.clone()),
            Axis::J => Self::new(self.di.clone(), at),
        }
    }


    /**
     * Increase the size of this index space by the given factor.
     */
    pub fn scale(&self, factor: i64) -> Self {
        Self::new(
            self.di.start * factor .. self.di.end * factor,
            self.dj.start * factor .. self.dj.end * factor)
    }


    /**
     * Return the cell space at a finer level which covers the same area as
     * this one, when each cell here is split `ratio` times on each axis.
     */
    pub fn refine_by(&self, ratio: i64) -> Self {
        self.scale(ratio)
    }


    /**
     * Return the smallest cell space at a coarser level which covers this
     * one. Division rounds toward negative infinity, so spaces reaching into
     * negative indexes (guard zones) coarsen correctly.
     */
    pub fn coarsen_by(&self, ratio: i64) -> Self {
        let lower = |a: i64| a.div_euclid(ratio);
        let upper = |a: i64| -((-a).div_euclid(ratio));
        Self::new(
            lower(self.di.start) .. upper(self.di.end),
            lower(self.dj.start) .. upper(self.dj.end))
    }


    /**
     * Return the node space surrounding this cell space (one more index on
     * each axis).
     */
    pub fn nodes(&self) -> Self {
        self.extend_upper(1, Axis::I).extend_upper(1, Axis::J)
    }


    /**
     * Return the cell space enclosed by this node space.
     */
    pub fn enclosed_cells(&self) -> Self {
        Self::new(
            self.di.start .. (self.di.end - 1).max(self.di.start),
            self.dj.start .. (self.dj.end - 1).max(self.dj.start))
    }


    /**
     * Return the space of faces normal to the given axis, for this cell
     * space.
     */
    pub fn faces(&self, axis: Axis) -> Self {
        self.extend_upper(1, axis)
    }


    /**
     * Return the overlap of two index spaces, or `None` if they are
     * disjoint.
     */
    pub fn intersect(&self, other: &Self) -> Option<Self> {
        let i0 = self.di.start.max(other.di.start);
        let i1 = self.di.end.min(other.di.end);
        let j0 = self.dj.start.max(other.dj.start);
        let j1 = self.dj.end.min(other.dj.end);

        if i0 < i1 && j0 < j1 {
            Some(Self::new(i0..i1, j0..j1))
        } else {
            None
        }
    }


    /**
     * Return the smallest index space containing both this one and another.
     */
    pub fn union_bound(&self, other: &Self) -> Self {
        Self::new(
            self.di.start.min(other.di.start) .. self.di.end.max(other.di.end),
            self.dj.start.min(other.dj.start) .. self.dj.end.max(other.dj.end))
    }


    /**
     * Return the linear offset for the given index, in a row-major memory
     * buffer aligned with the start of this index space.
     */
    pub fn row_major_offset(&self, index: (i64, i64)) -> usize {
        let i = (index.0 - self.di.start) as usize;
        let j = (index.1 - self.dj.start) as usize;
        let m = (self.dj.end - self.dj.start) as usize;
        i * m + j
    }


    /**
     * Return a memory region object corresponding to the selection of this
     * index space in the buffer allocated for another one.
     */
    pub fn memory_region_in(&self, parent: &Self) -> MemoryRegion {
        assert!(parent.contains_space(self), "selection is not inside the parent space");
        let start = (
            (self.di.start - parent.di.start) as usize,
            (self.dj.start - parent.dj.start) as usize);
        let count = self.dim();
        let shape = parent.dim();
        MemoryRegion { start, count, shape }
    }


    /**
     * Return an iterator which traverses the index space in row-major order
     * (C-like; the final index increases fastest).
     */
    pub fn iter(&self) -> impl Iterator<Item = (i64, i64)> + '_ {
        self.di.clone().flat_map(move |i| self.dj.clone().map(move |j| (i, j)))
    }
}




// ============================================================================
impl From<(Range<i64>, Range<i64>)> for IndexSpace {
    fn from(range: (Range<i64>, Range<i64>)) -> Self {
        Self::new(range.0, range.1)
    }
}

impl<'a> From<(&'a Range<i64>, &'a Range<i64>)> for IndexSpace {
    fn from(range: (&'a Range<i64>, &'a Range<i64>)) -> Self {
        Self::new(range.0.clone(), range.1.clone())
    }
}

impl From<IndexSpace> for (Range<i64>, Range<i64>) {
    fn from(space: IndexSpace) -> Self {
        (space.di, space.dj)
    }
}




/**
 * Less imposing factory function to construct an IndexSpace object.
 */
pub fn range2d(di: Range<i64>, dj: Range<i64>) -> IndexSpace {
    IndexSpace::new(di, dj)
}




/**
 * A 2D memory region within a contiguous buffer.
 */
pub struct MemoryRegion {
    start: (usize, usize),
    count: (usize, usize),
    shape: (usize, usize),
}




// ============================================================================
impl MemoryRegion {

    pub fn iter_slice<'a>(&self, slice: &'a [f64], chunk: usize) -> impl Iterator<Item = &'a [f64]> + 'a {
        let start = self.start;
        let shape = self.shape;
        let count = self.count;
        let r = chunk;
        let q = shape.1 * r;

        assert!(slice.len() == shape.0 * shape.1 * chunk);

        slice[start.0 * q .. (start.0 + count.0) * q]
        .chunks_exact(q).flat_map(move |j| j[start.1 * r .. (start.1 + count.1) * r]
        .chunks_exact(r))
    }

    pub fn iter_slice_mut<'a>(&self, slice: &'a mut [f64], chunk: usize) -> impl Iterator<Item = &'a mut [f64]> + 'a {
        let start = self.start;
        let shape = self.shape;
        let count = self.count;
        let r = chunk;
        let q = shape.1 * r;

        assert!(slice.len() == shape.0 * shape.1 * chunk);

        slice[start.0 * q .. (start.0 + count.0) * q]
        .chunks_exact_mut(q).flat_map(move |j| j[start.1 * r .. (start.1 + count.1) * r]
        .chunks_exact_mut(r))
    }
}




// ============================================================================
#[cfg(test)]
mod test {

    use super::{range2d, Axis};

    #[test]
    fn coarsening_rounds_outward_for_negative_indexes() {
        let space = range2d(-3..5, 0..8);
        assert_eq!(space.coarsen_by(2), range2d(-2..3, 0..4));
        assert_eq!(space.coarsen_by(4), range2d(-1..2, 0..2));
        assert_eq!(range2d(4..8, 8..12).refine_by(2).coarsen_by(2), range2d(4..8, 8..12));
    }

    #[test]
    fn face_and_node_spaces_have_one_extra_index() {
        let space = range2d(0..4, 0..6);
        assert_eq!(space.faces(Axis::I).dim(), (5, 6));
        assert_eq!(space.faces(Axis::J).dim(), (4, 7));
        assert_eq!(space.nodes().dim(), (5, 7));
        assert_eq!(space.nodes().enclosed_cells(), space);
    }

    #[test]
    fn intersection_of_disjoint_spaces_is_none() {
        let a = range2d(0..4, 0..4);
        let b = range2d(4..8, 0..4);
        assert!(a.intersect(&b).is_none());
        assert_eq!(a.extend_all(1).intersect(&b), Some(range2d(4..5, 0..4)));
    }

    #[test]
    fn slabs_select_the_boundary_layer() {
        let space = range2d(0..4, 2..6);
        assert_eq!(space.slab(Axis::I, false), range2d(0..1, 2..6));
        assert_eq!(space.slab(Axis::J, true), range2d(0..4, 5..6));
    }

    #[test]
    fn memory_region_selects_the_right_number_of_chunks() {
        let parent = range2d(0..10, 0..10);
        let data = vec![1.0; parent.len() * 3];
        let region = range2d(2..5, 3..7).memory_region_in(&parent);
        assert_eq!(region.iter_slice(&data, 3).count(), 12);
    }
}
