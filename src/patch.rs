use core::ops::Range;
use serde::{Deserialize, Serialize};
use crate::index_space::{Axis, IndexSpace};




/**
 * A patch is a mapping from a rectangular subset of an index space to
 * associated field values. The index space may be a cell, face, or node
 * lattice at the patch's refinement level; the level number is carried
 * along for bookkeeping (level 0 is the coarsest). Each index holds
 * `num_fields` contiguous values, so the backing array is row-major in the
 * index space with the field index fastest.
 *
 * Patches own their data. Numerical kernels read them through `FieldView`,
 * a non-owning, bounds-checked window onto a range of components.
 */
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Patch {
    level: u32,
    space: IndexSpace,
    num_fields: usize,
    data: Vec<f64>,
}




// ============================================================================
impl Patch {


    /**
     * Generate a patch of zeros.
     */
    pub fn zeros(level: u32, num_fields: usize, space: IndexSpace) -> Self {
        Self::constant(level, num_fields, space, 0.0)
    }


    /**
     * Generate a patch with every value equal to `value`.
     */
    pub fn constant(level: u32, num_fields: usize, space: IndexSpace, value: f64) -> Self {
        Self {
            level,
            num_fields,
            data: vec![value; space.len() * num_fields],
            space,
        }
    }


    /**
     * Generate a patch at a given level, covering the given space, with
     * values defined from a closure which writes all the fields at an index.
     */
    pub fn from_slice_function<F>(level: u32, space: IndexSpace, num_fields: usize, f: F) -> Self
    where
        F: Fn((i64, i64), &mut [f64])
    {
        let mut data = vec![0.0; space.len() * num_fields];

        if num_fields > 0 {
            for (index, slice) in space.iter().zip(data.chunks_exact_mut(num_fields)) {
                f(index, slice)
            }
        }
        Self { level, space, num_fields, data }
    }


    /**
     * Generate a single-field patch from a closure.
     */
    pub fn from_scalar_function<F>(level: u32, space: IndexSpace, f: F) -> Self
    where
        F: Fn((i64, i64)) -> f64
    {
        Self::from_slice_function(level, space, 1, |index, slice| slice[0] = f(index))
    }


    pub fn level(&self) -> u32 {
        self.level
    }

    pub fn num_fields(&self) -> usize {
        self.num_fields
    }

    pub fn index_space(&self) -> &IndexSpace {
        &self.space
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }


    /**
     * Return the value of field `n` at the given index. Panics if the index
     * is outside the patch.
     */
    pub fn get(&self, index: (i64, i64), n: usize) -> f64 {
        self.data[self.offset(index, n)]
    }


    /**
     * Return a mutable reference to field `n` at the given index.
     */
    pub fn get_mut(&mut self, index: (i64, i64), n: usize) -> &mut f64 {
        let k = self.offset(index, n);
        &mut self.data[k]
    }


    /**
     * Return all the fields at the given index.
     */
    pub fn get_slice(&self, index: (i64, i64)) -> &[f64] {
        let k = self.offset(index, 0);
        &self.data[k .. k + self.num_fields]
    }


    /**
     * Return all the fields at the given index, mutably.
     */
    pub fn get_slice_mut(&mut self, index: (i64, i64)) -> &mut [f64] {
        let k = self.offset(index, 0);
        let n = self.num_fields;
        &mut self.data[k .. k + n]
    }


    /**
     * Return a read-only view of the fields in the given range.
     */
    pub fn view(&self, fields: Range<usize>) -> FieldView<'_> {
        assert!(fields.end <= self.num_fields, "view fields {:?} out of range on patch with {} fields", fields, self.num_fields);
        FieldView { patch: self, first: fields.start, count: fields.end - fields.start }
    }


    /**
     * Return a read-only view of all the fields.
     */
    pub fn view_all(&self) -> FieldView<'_> {
        self.view(0..self.num_fields)
    }


    /**
     * Return an iterator over the field slices at each index, in row-major
     * order.
     */
    pub fn iter_data(&self) -> impl Iterator<Item = &[f64]> + '_ {
        self.data.chunks_exact(self.num_fields)
    }


    /**
     * Return a mutable iterator over the field slices at each index.
     */
    pub fn iter_data_mut(&mut self) -> impl Iterator<Item = &mut [f64]> + '_ {
        self.data.chunks_exact_mut(self.num_fields)
    }


    /**
     * Return an iterator over the field slices within a subset of this
     * patch's index space.
     */
    pub fn select(&self, subset: IndexSpace) -> impl Iterator<Item = &[f64]> + '_ {
        subset.memory_region_in(&self.space).iter_slice(&self.data, self.num_fields)
    }


    /**
     * Set every value of the fields in `fields` to `value`, within the part
     * of `subset` that lies inside this patch.
     */
    pub fn fill_region(&mut self, subset: &IndexSpace, fields: Range<usize>, value: f64) {
        if let Some(overlap) = subset.intersect(&self.space) {
            let region = overlap.memory_region_in(&self.space);
            let n = self.num_fields;
            for slice in region.iter_slice_mut(&mut self.data, n) {
                for x in &mut slice[fields.clone()] {
                    *x = value;
                }
            }
        }
    }


    /**
     * Set every value in the patch.
     */
    pub fn fill(&mut self, value: f64) {
        for x in &mut self.data {
            *x = value
        }
    }


    /**
     * Extract a subset of this patch as a new patch.
     */
    pub fn extract(&self, subset: IndexSpace) -> Self {
        let data = self.select(subset.clone()).flatten().cloned().collect();
        Self { level: self.level, space: subset, num_fields: self.num_fields, data }
    }


    /**
     * Extract a single field of this patch as a new one-field patch.
     */
    pub fn field(&self, n: usize) -> Self {
        assert!(n < self.num_fields, "field {} out of range on patch with {} fields", n, self.num_fields);
        let data = self.data.iter().skip(n).step_by(self.num_fields).cloned().collect();
        Self { level: self.level, space: self.space.clone(), num_fields: 1, data }
    }


    /**
     * Relabel this patch as covering its index space shifted by `delta`. The
     * data is not touched; this is how periodic images are expressed in the
     * receiver's coordinates.
     */
    pub fn translate(self, delta: (i64, i64)) -> Self {
        Self { space: self.space.shifted(delta), ..self }
    }


    /**
     * Copy `count` fields, from field `src` of another patch into field `dst`
     * of this one, over the overlap of the two index spaces. The source is
     * read at `index + delta`, which allows copying from periodic images.
     */
    pub fn copy_from(&mut self, other: &Patch, src: usize, dst: usize, count: usize, delta: (i64, i64)) {
        let target = other.space.shifted((-delta.0, -delta.1));

        if let Some(overlap) = target.intersect(&self.space) {
            for index in overlap.iter() {
                let source = (index.0 + delta.0, index.1 + delta.1);
                for n in 0..count {
                    *self.get_mut(index, dst + n) = other.get(source, src + n);
                }
            }
        }
    }


    /**
     * Copy `count` fields from another patch, restricted to `region` (and to
     * the overlap of the two patches).
     */
    pub fn copy_region(&mut self, other: &Patch, region: &IndexSpace, src: usize, dst: usize, count: usize) {
        let overlap = region
            .intersect(&self.space)
            .and_then(|r| r.intersect(&other.space));

        if let Some(overlap) = overlap {
            for index in overlap.iter() {
                for n in 0..count {
                    *self.get_mut(index, dst + n) = other.get(index, src + n);
                }
            }
        }
    }


    /**
     * Add `scale` times field `src` of another patch into field `dst` of
     * this one, over the overlap of the two index spaces.
     */
    pub fn add_from(&mut self, other: &Patch, src: usize, dst: usize, count: usize, scale: f64) {
        if let Some(overlap) = other.space.intersect(&self.space) {
            for index in overlap.iter() {
                for n in 0..count {
                    *self.get_mut(index, dst + n) += scale * other.get(index, src + n);
                }
            }
        }
    }


    /**
     * Multiply field `n` by `factor` everywhere in the patch.
     */
    pub fn scale_field(&mut self, n: usize, factor: f64) {
        let m = self.num_fields;
        for slice in self.data.chunks_exact_mut(m) {
            slice[n] *= factor
        }
    }


    /**
     * Return true if any of the fields in `fields` holds a non-finite value
     * inside `subset`.
     */
    pub fn contains_non_finite(&self, subset: &IndexSpace, fields: Range<usize>) -> bool {
        match subset.intersect(&self.space) {
            Some(overlap) => self
                .select(overlap)
                .any(|slice| slice[fields.clone()].iter().any(|x| !x.is_finite())),
            None => false,
        }
    }


    /**
     * Return the maximum absolute value of field `n` inside `subset`.
     */
    pub fn max_abs(&self, subset: &IndexSpace, n: usize) -> f64 {
        match subset.intersect(&self.space) {
            Some(overlap) => self.select(overlap).map(|slice| slice[n].abs()).fold(0.0, f64::max),
            None => 0.0,
        }
    }


    /**
     * Return the sum of field `n` inside `subset`.
     */
    pub fn sum(&self, subset: &IndexSpace, n: usize) -> f64 {
        match subset.intersect(&self.space) {
            Some(overlap) => self.select(overlap).map(|slice| slice[n]).sum(),
            None => 0.0,
        }
    }


    /**
     * Return a patch on the coarser cell lattice (refinement `ratio`) whose
     * values are averages over the fine cells each coarse cell covers. Only
     * coarse cells entirely covered by this patch are produced.
     */
    pub fn coarsen_average(&self, ratio: i64) -> Self {
        let (i0, j0) = self.space.start();
        let (i1, j1) = self.space.end();
        let coarse = IndexSpace::new(
            (i0 + ratio - 1).div_euclid(ratio) .. i1.div_euclid(ratio),
            (j0 + ratio - 1).div_euclid(ratio) .. j1.div_euclid(ratio));
        let weight = 1.0 / (ratio * ratio) as f64;

        Self::from_slice_function(self.level.saturating_sub(1), coarse, self.num_fields, |(i, j), slice| {
            for a in 0..ratio {
                for b in 0..ratio {
                    let fine = self.get_slice((i * ratio + a, j * ratio + b));
                    for (s, f) in slice.iter_mut().zip(fine) {
                        *s += weight * f
                    }
                }
            }
        })
    }


    /**
     * Sample the value of field `n` that a cell on a finer lattice
     * (refinement `ratio` relative to this patch) would see by piecewise
     * constant interpolation.
     */
    pub fn sample_refined(&self, ratio: i64, index: (i64, i64), n: usize) -> f64 {
        self.get((index.0.div_euclid(ratio), index.1.div_euclid(ratio)), n)
    }


    fn offset(&self, index: (i64, i64), n: usize) -> usize {
        self.validate_index(index);
        assert!(n < self.num_fields, "field {} out of range on patch with {} fields", n, self.num_fields);
        self.space.row_major_offset(index) * self.num_fields + n
    }

    fn validate_index(&self, index: (i64, i64)) {
        if !self.space.contains(index) {
            let (i0, j0) = self.space.start();
            let (i1, j1) = self.space.end();
            panic!("index ({} {}) out of range on patch ({}..{} {}..{})",
                index.0,
                index.1,
                i0,
                i1,
                j0,
                j1);
        }
    }
}




/**
 * A non-owning, read-only window onto a contiguous range of a patch's fields.
 * Field numbers are relative to the start of the range; both the index and
 * the field number are bounds-checked.
 */
#[derive(Clone, Copy)]
pub struct FieldView<'a> {
    patch: &'a Patch,
    first: usize,
    count: usize,
}




// ============================================================================
impl<'a> FieldView<'a> {

    pub fn get(&self, index: (i64, i64), n: usize) -> f64 {
        assert!(n < self.count, "field {} out of range on view with {} fields", n, self.count);
        self.patch.get(index, self.first + n)
    }

    /**
     * Return the value `delta` cells away from `index` along `axis`.
     */
    pub fn get_along(&self, index: (i64, i64), axis: Axis, delta: i64, n: usize) -> f64 {
        let (di, dj) = axis.offset(delta);
        self.get((index.0 + di, index.1 + dj), n)
    }

    pub fn num_fields(&self) -> usize {
        self.count
    }

    pub fn level(&self) -> u32 {
        self.patch.level()
    }

    pub fn index_space(&self) -> &'a IndexSpace {
        self.patch.index_space()
    }
}




// ============================================================================
#[cfg(test)]
mod test {

    use super::Patch;
    use crate::index_space::range2d;

    #[test]
    fn patch_coarsening_averages_fine_cells() {
        let patch = Patch::from_scalar_function(1, range2d(4..10, 4..10), |(i, j)| i as f64 + j as f64);
        let coarse = patch.coarsen_average(2);
        assert_eq!(coarse.index_space(), &range2d(2..5, 2..5));
        assert_eq!(coarse.get((2, 2), 0), 0.25 * (8.0 + 9.0 + 9.0 + 10.0));

        // Piecewise constant sampling
        assert_eq!(coarse.sample_refined(2, (4, 4), 0), coarse.get((2, 2), 0));
        assert_eq!(coarse.sample_refined(2, (5, 5), 0), coarse.get((2, 2), 0));
        assert_eq!(coarse.sample_refined(2, (6, 5), 0), coarse.get((3, 2), 0));
    }

    #[test]
    fn patch_with_no_fields_is_empty() {
        let patch = Patch::from_slice_function(0, range2d(0..3, 0..2), 0, |_, _| panic!("no fields to write"));
        assert_eq!(patch.num_fields(), 0);
        assert!(patch.data().is_empty());
    }

    #[test]
    fn views_are_offset_into_the_field_range() {
        let patch = Patch::from_slice_function(0, range2d(0..2, 0..2), 3, |(i, j), s| {
            s[0] = i as f64;
            s[1] = j as f64;
            s[2] = 10.0;
        });
        let view = patch.view(1..3);
        assert_eq!(view.get((1, 1), 0), 1.0);
        assert_eq!(view.get((0, 1), 1), 10.0);
    }

    #[test]
    #[should_panic]
    fn views_reject_fields_outside_their_range() {
        let patch = Patch::zeros(0, 3, range2d(0..2, 0..2));
        patch.view(0..2).get((0, 0), 2);
    }

    #[test]
    #[should_panic]
    fn out_of_range_index_panics() {
        let patch = Patch::zeros(0, 1, range2d(0..2, 0..2));
        patch.get((2, 0), 0);
    }

    #[test]
    fn copy_from_handles_shifted_sources() {
        let source = Patch::from_scalar_function(0, range2d(0..4, 0..4), |(i, _)| i as f64);
        let mut target = Patch::zeros(0, 1, range2d(-1..0, 0..4));
        target.copy_from(&source, 0, 0, 1, (4, 0));
        assert!(target.iter_data().all(|s| s[0] == 3.0));
    }

    #[test]
    fn non_finite_values_are_detected_in_range() {
        let mut patch = Patch::zeros(0, 2, range2d(0..3, 0..3));
        *patch.get_mut((1, 1), 1) = f64::NAN;
        assert!(patch.contains_non_finite(&range2d(0..3, 0..3), 1..2));
        assert!(!patch.contains_non_finite(&range2d(0..3, 0..3), 0..1));
        assert!(!patch.contains_non_finite(&range2d(2..3, 0..3), 1..2));
    }
}
