use rayon::prelude::*;
use crate::index_space::{shift, Axis, IndexSpace};
use crate::meshing::Layout;
use crate::patch::Patch;

/// Accumulates the mismatch between coarse and fine fluxes through the
/// boundary of each fine box. For every fine box, coarsened, there is one
/// face strip per axis and side on the coarse face lattice. Over a coarse
/// step the strips collect
///
/// ```text
/// sum(fine flux * dt_fine) - coarse flux * dt_coarse
/// ```
///
/// when the coarse level adds its fluxes with `mult = -dt_coarse` and every
/// fine subcycle adds its own with `mult = dt_fine`. Fluxes are area
/// weighted, so summing the fine faces under a coarse face gives the total
/// through that face.
///
#[derive(Clone, Debug)]
pub struct FluxRegister {
    ratio: i64,
    num_fields: usize,
    boxes: Vec<IndexSpace>,
    strips: Vec<[[Patch; 2]; 2]>,
}

impl FluxRegister {
    /// Create an empty register for the boxes of a fine level refined by
    /// `ratio` over the coarse level `coarse_level`.
    ///
    pub fn new(fine: &Layout, ratio: i64, num_fields: usize, coarse_level: u32) -> Self {
        let boxes = fine.coarsened_boxes(ratio);
        let strips = boxes
            .iter()
            .map(|c| {
                Axis::BOTH.map(|axis| {
                    let faces = c.faces(axis);
                    [
                        Patch::zeros(coarse_level, num_fields, faces.slab(axis, false)),
                        Patch::zeros(coarse_level, num_fields, faces.slab(axis, true)),
                    ]
                })
            })
            .collect();
        Self { ratio, num_fields, boxes, strips }
    }

    /// A register of the same shape with every entry zero.
    ///
    pub fn zeros_like(&self) -> Self {
        let mut register = self.clone();
        register.clear();
        register
    }

    pub fn ratio(&self) -> i64 {
        self.ratio
    }

    pub fn num_fields(&self) -> usize {
        self.num_fields
    }

    /// The coarsened fine boxes the strips surround.
    ///
    pub fn boxes(&self) -> &[IndexSpace] {
        &self.boxes
    }

    /// The strip of box `k` on the given side of `axis`.
    ///
    pub fn strip(&self, k: usize, axis: Axis, upper: bool) -> &Patch {
        &self.strips[k][axis.index()][upper as usize]
    }

    pub fn clear(&mut self) {
        for strip in self.strips.iter_mut().flatten().flatten() {
            strip.fill(0.0)
        }
    }

    /// The sum of field `n` over every strip.
    ///
    pub fn sum(&self, n: usize) -> f64 {
        self.strips
            .iter()
            .flatten()
            .flatten()
            .map(|strip| strip.sum(&strip.index_space().clone(), n))
            .sum()
    }

    /// Add the entries of a register of the same shape.
    ///
    fn merge(&mut self, other: &Self) {
        for (a, b) in self.strips.iter_mut().flatten().flatten().zip(other.strips.iter().flatten().flatten()) {
            a.add_from(b, 0, 0, self.num_fields, 1.0)
        }
    }

    /// Add `mult` times the coarse fluxes on the strip faces, writing the
    /// flux fields into register fields `dst..`. `fluxes` holds the fluxes
    /// on the valid faces of each coarse box. A face shared by two coarse
    /// boxes is taken from the first one.
    ///
    /// Each coarse patch folds its contribution into a private
    /// register-shaped buffer; the buffers are reduced and the total is
    /// merged into the register once.
    ///
    pub fn crse_init(&mut self, coarse: &Layout, fluxes: &[[Patch; 2]], dst: usize, mult: f64) {
        let owner = |axis: Axis, f: (i64, i64)| coarse.boxes().iter().position(|b| b.faces(axis).contains(f));
        let empty = self.zeros_like();

        let total = coarse
            .boxes()
            .par_iter()
            .zip(fluxes.par_iter())
            .enumerate()
            .fold(
                || empty.clone(),
                |mut acc, (k, (valid, faces))| {
                    for strip in acc.strips.iter_mut() {
                        for axis in Axis::BOTH {
                            let source = &faces[axis.index()];
                            let count = source.num_fields();

                            for side in strip[axis.index()].iter_mut() {
                                let overlap = match side.index_space().intersect(&valid.faces(axis)) {
                                    Some(overlap) => overlap,
                                    None => continue,
                                };
                                for f in overlap.iter() {
                                    if owner(axis, f) != Some(k) {
                                        continue
                                    }
                                    for n in 0..count {
                                        *side.get_mut(f, dst + n) += mult * source.get(f, n)
                                    }
                                }
                            }
                        }
                    }
                    acc
                },
            )
            .reduce(
                || empty.clone(),
                |mut a, b| {
                    a.merge(&b);
                    a
                },
            );
        self.merge(&total)
    }

    /// Add `mult` times the fine fluxes of each fine box, summed over the
    /// fine faces under each coarse strip face, into register fields
    /// `dst..`. `fluxes` holds the fluxes on the valid faces of each fine
    /// box, in layout order.
    ///
    pub fn fine_add(&mut self, fluxes: &[[Patch; 2]], dst: usize, mult: f64) {
        assert_eq!(fluxes.len(), self.strips.len(), "one set of fine fluxes per fine box");
        let r = self.ratio;

        self.strips.par_iter_mut().zip(fluxes.par_iter()).for_each(|(strips, faces)| {
            for axis in Axis::BOTH {
                let source = &faces[axis.index()];
                let count = source.num_fields();

                for side in strips[axis.index()].iter_mut() {
                    let space = side.index_space().clone();

                    for f in space.iter() {
                        let normal = axis.of(f) * r;
                        let tangent = axis.other().of(f) * r;

                        for m in tangent..tangent + r {
                            let fine = match axis {
                                Axis::I => (normal, m),
                                Axis::J => (m, normal),
                            };
                            for n in 0..count {
                                *side.get_mut(f, dst + n) += mult * source.get(fine, n)
                            }
                        }
                    }
                }
            }
        })
    }

    /// Apply the register to the coarse cells next to the strips: the cell
    /// outside a lower strip face receives `-scale R / volume`, and the cell
    /// outside an upper strip face `+scale R / volume`. Register fields
    /// `src..src + count` go to fields `dst..` of `target`, which holds data
    /// on (at least) the valid cells of the coarse boxes. Cells are wrapped
    /// periodically; cells outside every coarse box are skipped.
    ///
    pub fn reflux(&self, coarse: &Layout, target: &mut [Patch], src: usize, dst: usize, count: usize, scale: f64, volume: f64) {
        target.par_iter_mut().zip(coarse.boxes().par_iter()).for_each(|(patch, valid)| {
            for strips in &self.strips {
                for axis in Axis::BOTH {
                    for (upper, side) in [false, true].into_iter().zip(&strips[axis.index()]) {
                        let sign = if upper { 1.0 } else { -1.0 };

                        for f in side.index_space().iter() {
                            let cell = if upper { f } else { shift(f, axis.offset(-1)) };

                            if let Some(w) = coarse.wrap(cell).filter(|w| valid.contains(*w)) {
                                for n in 0..count {
                                    *patch.get_mut(w, dst + n) += sign * scale * side.get(f, src + n) / volume
                                }
                            }
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod test {
    use super::FluxRegister;
    use crate::index_space::{range2d, Axis};
    use crate::meshing::Layout;
    use crate::patch::Patch;

    fn levels() -> (Layout, Layout) {
        let coarse = Layout::new(range2d(0..8, 0..8), vec![range2d(0..4, 0..8), range2d(4..8, 0..8)], [true, true]);
        let fine = Layout::new(range2d(0..16, 0..16), vec![range2d(4..12, 4..12)], [true, true]);
        (coarse, fine)
    }

    fn uniform_fluxes(layout: &Layout, u: f64, area: f64, level: u32) -> Vec<[Patch; 2]> {
        layout
            .boxes()
            .iter()
            .map(|b| {
                [
                    Patch::constant(level, 1, b.faces(Axis::I), u * area),
                    Patch::constant(level, 1, b.faces(Axis::J), 0.0),
                ]
            })
            .collect()
    }

    #[test]
    fn matching_coarse_and_subcycled_fine_fluxes_cancel() {
        let (coarse, fine) = levels();
        let (dy_c, dt_c) = (0.125, 0.1);
        let mut register = FluxRegister::new(&fine, 2, 1, 0);

        register.crse_init(&coarse, &uniform_fluxes(&coarse, 1.0, dy_c, 0), 0, -dt_c);
        for _ in 0..2 {
            register.fine_add(&uniform_fluxes(&fine, 1.0, 0.5 * dy_c, 1), 0, 0.5 * dt_c);
        }
        for k in 0..register.boxes().len() {
            for axis in Axis::BOTH {
                for upper in [false, true] {
                    assert!(register.strip(k, axis, upper).iter_data().all(|s| s[0].abs() < 1e-15));
                }
            }
        }
    }

    #[test]
    fn reflux_corrects_the_cells_outside_the_fine_boxes_conservatively() {
        let (coarse, fine) = levels();
        let (dy_c, dt_c) = (0.125, 0.1);
        let volume = dy_c * dy_c;
        let mut register = FluxRegister::new(&fine, 2, 1, 0);

        register.crse_init(&coarse, &uniform_fluxes(&coarse, 1.0, dy_c, 0), 0, -dt_c);
        register.fine_add(&uniform_fluxes(&fine, 2.0, 0.5 * dy_c, 1), 0, dt_c);
        let mismatch = dt_c * dy_c;
        assert!((register.strip(0, Axis::I, false).get((2, 3), 0) - mismatch).abs() < 1e-15);

        let mut state: Vec<Patch> = coarse.boxes().iter().map(|b| Patch::zeros(0, 1, b.clone())).collect();
        register.reflux(&coarse, &mut state, 0, 0, 1, 1.0, volume);

        assert!((state[0].get((1, 3), 0) + mismatch / volume).abs() < 1e-12);
        assert!((state[1].get((6, 3), 0) - mismatch / volume).abs() < 1e-12);
        assert_eq!(state[0].get((0, 3), 0), 0.0);

        let total: f64 = coarse.boxes().iter().zip(&state).map(|(b, p)| p.sum(b, 0)).sum();
        assert!(total.abs() < 1e-12);
    }

    #[test]
    fn crse_init_takes_shared_faces_once() {
        let coarse = Layout::new(range2d(0..8, 0..8), vec![range2d(0..4, 0..8), range2d(4..8, 0..8)], [true, true]);
        let fine = Layout::new(range2d(0..16, 0..16), vec![range2d(8..16, 0..4)], [true, true]);
        let mut register = FluxRegister::new(&fine, 2, 1, 0);
        register.crse_init(&coarse, &uniform_fluxes(&coarse, 1.0, 1.0, 0), 0, 1.0);

        // the fine box starts at the coarse box boundary i = 4
        assert_eq!(register.strip(0, Axis::I, false).get((4, 0), 0), 1.0);
        assert_eq!(register.sum(0), 4.0);
    }
}
