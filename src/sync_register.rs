use rayon::prelude::*;
use crate::boundary::{DomainBc, PhysBc};
use crate::index_space::{shift, Axis, IndexSpace};
use crate::meshing::Layout;
use crate::patch::Patch;




/**
 * Collects the nodal divergence mismatch along the boundary of a fine
 * level, on the coarse node lattice. Each fine box, coarsened, has one node
 * strip per axis and side. The coarse level adds the divergence of its
 * cells outside the fine level, and the fine level its restricted residual
 * with `mult = 1 / r`, which scales a fine node's share of the flux to the
 * coarse control volume. Residuals are partial per patch (see
 * `projection::nodal_divergence`), so values of patches sharing a node add
 * up to the composite divergence there.
 *
 * Strips of different boxes, or of the same box at its corners, which share
 * a node hold the same value. `init_rhs` turns the strips into a nodal
 * right-hand side with each node represented once.
 */
#[derive(Clone, Debug)]
pub struct SyncRegister {
    ratio: i64,
    domain: IndexSpace,
    periodic: [bool; 2],
    shifts: Vec<(i64, i64)>,
    boxes: Vec<IndexSpace>,
    strips: Vec<[[Patch; 2]; 2]>,
}




// ============================================================================
impl SyncRegister {


    /**
     * Create an empty register for the boxes of a fine level refined by
     * `ratio` over the coarse level `coarse_level`.
     */
    pub fn new(fine: &Layout, ratio: i64, coarse_level: u32) -> Self {
        let domain = fine.domain().coarsen_by(ratio);
        let boxes = fine.coarsened_boxes(ratio);
        let coarse = Layout::new(domain.clone(), vec![domain.clone()], fine.periodic());
        let strips = boxes
            .iter()
            .map(|c| {
                let nodes = c.nodes();
                Axis::BOTH.map(|axis| {
                    [
                        Patch::zeros(coarse_level, 1, nodes.slab(axis, false)),
                        Patch::zeros(coarse_level, 1, nodes.slab(axis, true)),
                    ]
                })
            })
            .collect();

        Self {
            ratio,
            domain,
            periodic: fine.periodic(),
            shifts: coarse.periodic_shifts(),
            boxes,
            strips,
        }
    }

    pub fn ratio(&self) -> i64 {
        self.ratio
    }

    pub fn strip(&self, k: usize, axis: Axis, upper: bool) -> &Patch {
        &self.strips[k][axis.index()][upper as usize]
    }

    pub fn clear(&mut self) {
        for strip in self.strips.iter_mut().flatten().flatten() {
            strip.fill(0.0)
        }
    }


    /**
     * Zero the register and add `mult` times the coarse level residual, one
     * nodal patch per coarse box, honoring periodic images.
     */
    pub fn crse_init(&mut self, residual: &[Patch], mult: f64) {
        self.clear();
        self.add_nodes(residual, mult)
    }


    /**
     * Add `mult` times the fine level residual (one nodal patch per fine
     * box, in layout order). The residual on each box's boundary lines is
     * restricted to the coarse nodes with tangential weights `(r - |m|) /
     * r^2`; fine nodes outside the box are skipped. Values on non-periodic
     * domain lines are doubled, making up for the missing outer half of the
     * node's stencil.
     */
    pub fn fine_add(&mut self, residual: &[Patch], mult: f64) {
        assert_eq!(residual.len(), self.boxes.len(), "one fine residual per fine box");

        let restricted: Vec<Patch> = self
            .boxes
            .par_iter()
            .zip(residual.par_iter())
            .map(|(c, fine)| self.restrict(c, fine, mult))
            .collect();

        self.add_nodes(&restricted, 1.0)
    }


    /**
     * Like `fine_add`, for a fine level which is itself refined: residual
     * values at nodes of the finer level's boxes (given on the fine level's
     * index space) are zeroed first, since the finer level's own sync
     * accounts for them.
     */
    pub fn comp_add(&mut self, mut residual: Vec<Patch>, finer_boxes: &[IndexSpace], fine_layout: &Layout, mult: f64) {
        let shifts = fine_layout.periodic_shifts();

        residual.par_iter_mut().for_each(|patch| {
            let space = patch.index_space().clone();

            for finer in finer_boxes {
                for s in &shifts {
                    if let Some(overlap) = finer.nodes().shifted(*s).intersect(&space) {
                        patch.fill_region(&overlap, 0..1, 0.0)
                    }
                }
            }
        });
        self.fine_add(&residual, mult)
    }


    /**
     * Assemble the nodal right-hand side of the sync projection over the
     * coarse node domain (without the duplicate upper node on periodic
     * axes). Strip values are copied in, nodes on outflow sides are zeroed,
     * and nodes whose surrounding coarse cells are all covered by the fine
     * level are masked out. The result depends only on the strips.
     */
    pub fn init_rhs(&self, bc: &DomainBc, level: u32) -> Patch {
        let all_nodes = self.domain.nodes();
        let node_domain = IndexSpace::new(self.trim(Axis::I), self.trim(Axis::J));
        let mut rhs = Patch::zeros(level, 1, node_domain);

        for strip in self.strips.iter().flatten().flatten() {
            for n in strip.index_space().iter() {
                if let Some(w) = self.wrap_node(n) {
                    *rhs.get_mut(w, 0) = strip.get(n, 0)
                }
            }
        }

        for axis in Axis::BOTH {
            for upper in [false, true] {
                if bc.side(axis, upper) == PhysBc::Outflow {
                    let line = all_nodes.slab(axis, upper);
                    if let Some(overlap) = line.intersect(rhs.index_space()) {
                        rhs.fill_region(&overlap, 0..1, 0.0)
                    }
                }
            }
        }

        for strip in self.strips.iter().flatten().flatten() {
            for n in strip.index_space().iter() {
                if self.covered_weight(n) > 3.5 {
                    if let Some(w) = self.wrap_node(n) {
                        *rhs.get_mut(w, 0) = 0.0
                    }
                }
            }
        }
        rhs
    }


    /**
     * Add `mult` times each nodal source patch into every strip it
     * overlaps, including periodic images.
     */
    fn add_nodes(&mut self, sources: &[Patch], mult: f64) {
        let shifts = &self.shifts;

        self.strips.par_iter_mut().for_each(|strips| {
            for strip in strips.iter_mut().flatten() {
                let space = strip.index_space().clone();

                for source in sources {
                    for s in shifts {
                        if let Some(overlap) = source.index_space().shifted(*s).intersect(&space) {
                            for n in overlap.iter() {
                                *strip.get_mut(n, 0) += mult * source.get(shift(n, (-s.0, -s.1)), 0)
                            }
                        }
                    }
                }
            }
        })
    }


    /**
     * Restrict the fine residual on the boundary lines of the coarsened box
     * `c` to a nodal patch over `c.nodes()`. Corner nodes receive the
     * contributions of both lines through them.
     */
    fn restrict(&self, c: &IndexSpace, fine: &Patch, mult: f64) -> Patch {
        let r = self.ratio;
        let nodes = c.nodes();
        let mut crse = Patch::zeros(fine.level().saturating_sub(1), 1, nodes.clone());

        for axis in Axis::BOTH {
            for upper in [false, true] {
                for n in nodes.slab(axis, upper).iter() {
                    let center = (n.0 * r, n.1 * r);
                    let mut value = 0.0;

                    for m in -(r - 1)..=(r - 1) {
                        let f = shift(center, axis.other().offset(m));

                        if fine.index_space().contains(f) {
                            value += (r - m.abs()) as f64 / (r * r) as f64 * fine.get(f, 0)
                        }
                    }
                    *crse.get_mut(n, 0) += mult * value * self.boundary_factor(n);
                }
            }
        }
        crse
    }


    /**
     * Twice for each non-periodic domain line the node lies on.
     */
    fn boundary_factor(&self, n: (i64, i64)) -> f64 {
        let all_nodes = self.domain.nodes();
        let mut factor = 1.0;

        for axis in Axis::BOTH {
            let r = all_nodes.range(axis);
            let k = axis.of(n);
            if !self.periodic[axis.index()] && (k == r.start || k == r.end - 1) {
                factor *= 2.0
            }
        }
        factor
    }


    /**
     * The number of coarse cells around a node covered by the fine level
     * (periodic images included), scaled by the boundary factor.
     */
    fn covered_weight(&self, (i, j): (i64, i64)) -> f64 {
        let covered = |c: (i64, i64)| {
            self.shifts
                .iter()
                .any(|s| self.boxes.iter().any(|b| b.contains(shift(c, *s))))
        };
        let count = [(i - 1, j - 1), (i, j - 1), (i - 1, j), (i, j)]
            .iter()
            .filter(|&&c| covered(c))
            .count();
        count as f64 * self.boundary_factor((i, j))
    }


    fn trim(&self, axis: Axis) -> core::ops::Range<i64> {
        let r = self.domain.nodes().range(axis);
        if self.periodic[axis.index()] { r.start..r.end - 1 } else { r }
    }


    fn wrap_node(&self, n: (i64, i64)) -> Option<(i64, i64)> {
        let mut w = [n.0, n.1];

        for axis in Axis::BOTH {
            let r = self.trim(axis);
            let k = &mut w[axis.index()];

            if self.periodic[axis.index()] {
                *k = r.start + (*k - r.start).rem_euclid(r.end - r.start)
            } else if !r.contains(k) {
                return None
            }
        }
        Some((w[0], w[1]))
    }
}
