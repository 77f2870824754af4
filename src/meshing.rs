use core::ops::Range;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use crate::automaton::{self, Automaton, Status};
use crate::boundary::{fill_physical_guards, BcCode};
use crate::index_space::{Axis, IndexSpace};
use crate::patch::Patch;

/// A trait for a container that can respond to queries for a patch overlying
/// a point.
///
pub trait PatchQuery {
    /// Return a patch containing the given point, if one exists.
    ///
    fn patch_containing_point(&self, point: (i64, i64)) -> Option<&Patch>;
}

impl PatchQuery for [Patch] {
    fn patch_containing_point(&self, point: (i64, i64)) -> Option<&Patch> {
        self.iter().find(|p| p.index_space().contains(point))
    }
}

/// The grid layout of one refinement level: the cell-index domain at that
/// level, the disjoint valid boxes of its patches, and which axes of the
/// domain are periodic. Patch data is stored separately, in the same order
/// as the boxes.
///
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Layout {
    domain: IndexSpace,
    boxes: Vec<IndexSpace>,
    periodic: [bool; 2],
}

impl Layout {
    pub fn new(domain: IndexSpace, boxes: Vec<IndexSpace>, periodic: [bool; 2]) -> Self {
        assert!(!boxes.is_empty(), "a level needs at least one box");

        for (n, a) in boxes.iter().enumerate() {
            assert!(domain.contains_space(a), "box {:?} is outside the domain {:?}", a, domain);
            for b in &boxes[n + 1..] {
                assert!(a.intersect(b).is_none(), "boxes {:?} and {:?} overlap", a, b);
            }
        }
        Self { domain, boxes, periodic }
    }

    pub fn domain(&self) -> &IndexSpace {
        &self.domain
    }

    pub fn boxes(&self) -> &[IndexSpace] {
        &self.boxes
    }

    pub fn periodic(&self) -> [bool; 2] {
        self.periodic
    }

    pub fn len(&self) -> usize {
        self.boxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }

    /// The smallest index space containing every box.
    pub fn bounding(&self) -> IndexSpace {
        let first = self.boxes[0].clone();
        self.boxes.iter().fold(first, |a, b| a.union_bound(b))
    }

    /// Map an index onto the domain by periodic wrapping, or return `None`
    /// if it lies outside a non-periodic side.
    pub fn wrap(&self, index: (i64, i64)) -> Option<(i64, i64)> {
        let mut wrapped = [index.0, index.1];

        for axis in Axis::BOTH {
            let r = self.domain.range(axis);
            let k = &mut wrapped[axis.index()];

            if self.periodic[axis.index()] {
                *k = r.start + (*k - r.start).rem_euclid(r.end - r.start)
            } else if !r.contains(k) {
                return None
            }
        }
        Some((wrapped[0], wrapped[1]))
    }

    /// Return true if the index, after periodic wrapping, is inside a box.
    pub fn covers(&self, index: (i64, i64)) -> bool {
        self.wrap(index)
            .map(|w| self.boxes.iter().any(|b| b.contains(w)))
            .unwrap_or(false)
    }

    /// Return the box containing the index, without wrapping.
    pub fn box_containing(&self, index: (i64, i64)) -> Option<usize> {
        self.boxes.iter().position(|b| b.contains(index))
    }

    /// The offsets of the periodic images of the domain, the identity first.
    pub fn periodic_shifts(&self) -> Vec<(i64, i64)> {
        let (ni, nj) = self.domain.dim();
        let image = |periodic: bool, n: usize| {
            if periodic {
                vec![0, -(n as i64), n as i64]
            } else {
                vec![0]
            }
        };
        let mut shifts = Vec::new();

        for di in image(self.periodic[0], ni) {
            for dj in image(self.periodic[1], nj) {
                shifts.push((di, dj))
            }
        }
        shifts
    }

    /// The boxes coarsened by `ratio`.
    pub fn coarsened_boxes(&self, ratio: i64) -> Vec<IndexSpace> {
        self.boxes.iter().map(|b| b.coarsen_by(ratio)).collect()
    }

    /// A one-field patch over `region` holding 1 in cells covered by a box,
    /// and 0 elsewhere.
    pub fn active_mask(&self, level: u32, region: &IndexSpace) -> Patch {
        Patch::from_scalar_function(level, region.clone(), |index| {
            if self.box_containing(index).is_some() { 1.0 } else { 0.0 }
        })
    }

    /// Copy the valid data of the given fields of every patch into one patch
    /// over `region`. Indexes no box covers are zero.
    pub fn gather(&self, patches: &[Patch], fields: Range<usize>, region: &IndexSpace) -> Patch {
        let level = patches.first().map(|p| p.level()).unwrap_or(0);
        let count = fields.end - fields.start;
        let mut result = Patch::zeros(level, count, region.clone());

        for (valid, patch) in self.boxes.iter().zip(patches) {
            result.copy_region(patch, valid, fields.start, 0, count)
        }
        result
    }

    /// Like `gather`, but guard zone data of the (grown) patches is used
    /// where no valid data is available.
    pub fn gather_grown(&self, patches: &[Patch], fields: Range<usize>, region: &IndexSpace) -> Patch {
        let level = patches.first().map(|p| p.level()).unwrap_or(0);
        let count = fields.end - fields.start;
        let mut result = Patch::zeros(level, count, region.clone());

        for patch in patches {
            result.copy_region(patch, patch.index_space(), fields.start, 0, count)
        }
        for (valid, patch) in self.boxes.iter().zip(patches) {
            result.copy_region(patch, valid, fields.start, 0, count)
        }
        result
    }

    /// Copy `count` fields of `source` back into the valid region of every
    /// patch.
    pub fn scatter(&self, source: &Patch, src: usize, patches: &mut [Patch], dst: usize, count: usize) {
        for (valid, patch) in self.boxes.iter().zip(patches) {
            patch.copy_region(source, valid, src, dst, count)
        }
    }
}

/// The coarse level data guard zones are interpolated from, where no patch
/// on the same level covers them.
///
pub struct CoarseSource<'a> {
    pub layout: &'a Layout,
    pub patches: &'a [Patch],
    pub ratio: i64,
}

/// One patch's part in a guard zone exchange: it sends overlapping slices of
/// its valid data to its neighbors (including periodic images), and copies
/// what it receives into its own guard zones.
///
struct GuardExchange {
    key: usize,
    patch: Patch,
    outgoing: Vec<(usize, IndexSpace, (i64, i64))>,
    expected: usize,
    received: Vec<Patch>,
}

impl Automaton for GuardExchange {
    type Key = usize;
    type Message = Patch;
    type Value = (usize, Patch);

    fn key(&self) -> Self::Key {
        self.key
    }

    fn messages(&self) -> Vec<(Self::Key, Self::Message)> {
        self.outgoing
            .iter()
            .map(|(dest, region, shift)| (*dest, self.patch.extract(region.clone()).translate(*shift)))
            .collect()
    }

    fn receive(&mut self, message: Self::Message) -> Status {
        self.received.push(message);
        Status::eligible_if(self.received.len() == self.expected)
    }

    fn is_independent(&self) -> bool {
        self.expected == 0
    }

    fn value(mut self) -> Self::Value {
        for message in &self.received {
            let n = message.num_fields();
            self.patch.copy_from(message, 0, 0, n, (0, 0))
        }
        (self.key, self.patch)
    }
}

/// Fill the guard zones of each (grown) patch on a level with valid data
/// from the other patches on that level, honoring periodic images. Guard
/// zones no patch covers are left untouched.
///
pub fn exchange_guards(layout: &Layout, patches: Vec<Patch>) -> Vec<Patch> {
    let shifts = layout.periodic_shifts();
    let mut tasks: Vec<GuardExchange> = patches
        .into_iter()
        .enumerate()
        .map(|(key, patch)| GuardExchange { key, patch, outgoing: Vec::new(), expected: 0, received: Vec::new() })
        .collect();

    for a in 0..tasks.len() {
        let grown = tasks[a].patch.index_space().clone();

        for (b, valid) in layout.boxes().iter().enumerate() {
            for &shift in &shifts {
                if a == b && shift == (0, 0) {
                    continue
                }
                if let Some(region) = grown.intersect(&valid.shifted(shift)) {
                    tasks[b].outgoing.push((a, region.shifted((-shift.0, -shift.1)), shift));
                    tasks[a].expected += 1;
                }
            }
        }
    }

    let mut filled: Vec<(usize, Patch)> = if rayon::current_num_threads() >= 2 {
        rayon::scope(|scope| automaton::execute_par(scope, tasks).collect())
    } else {
        automaton::execute(tasks).collect()
    };
    filled.sort_by_key(|(key, _)| *key);
    filled.into_iter().map(|(_, patch)| patch).collect()
}

/// Fill guard zones that lie inside the domain but outside every box on this
/// level by piecewise constant sampling of the coarse level.
///
pub fn fill_from_coarse(layout: &Layout, patch: &mut Patch, coarse: &CoarseSource) {
    let r = coarse.ratio;
    let space = patch.index_space().clone();

    for index in space.iter() {
        if layout.covers(index) {
            continue
        }
        if let Some((i, j)) = layout.wrap(index) {
            let c = (i.div_euclid(r), j.div_euclid(r));

            if let Some(source) = coarse.patches.patch_containing_point(c) {
                let n = patch.num_fields().min(source.num_fields());
                patch.get_slice_mut(index)[..n].copy_from_slice(&source.get_slice(c)[..n]);
            }
        }
    }
}

/// Fill every guard zone of a level's grown patches: first from the coarse
/// level (if any), then from same-level neighbors, then at physical
/// boundaries with the given fill codes and boundary data.
///
pub fn fill_guards<C, B>(layout: &Layout, patches: Vec<Patch>, coarse: Option<CoarseSource>, codes: C, boundary: B) -> Vec<Patch>
where
    C: Fn(Axis, bool, usize) -> BcCode + Sync,
    B: Fn((i64, i64), Axis, bool, usize) -> f64 + Sync,
{
    let mut patches = patches;

    if let Some(coarse) = coarse {
        patches.par_iter_mut().for_each(|p| fill_from_coarse(layout, p, &coarse))
    }
    let mut patches = exchange_guards(layout, patches);

    patches
        .par_iter_mut()
        .for_each(|p| fill_physical_guards(p, layout.domain(), layout.periodic(), &codes, &boundary));
    patches
}

#[cfg(test)]
mod test {
    use super::{exchange_guards, fill_guards, CoarseSource, Layout};
    use crate::boundary::BcCode;
    use crate::index_space::range2d;
    use crate::patch::Patch;

    fn two_box_layout(periodic: [bool; 2]) -> Layout {
        Layout::new(range2d(0..8, 0..4), vec![range2d(0..4, 0..4), range2d(4..8, 0..4)], periodic)
    }

    fn grown_patches(layout: &Layout, guard: i64) -> Vec<Patch> {
        layout
            .boxes()
            .iter()
            .map(|b| {
                let valid = b.clone();
                Patch::from_scalar_function(0, b.extend_all(guard), move |(i, j)| {
                    if valid.contains((i, j)) { (10 * i + j) as f64 } else { -1.0 }
                })
            })
            .collect()
    }

    #[test]
    fn neighbors_and_periodic_images_fill_guards() {
        let layout = two_box_layout([true, true]);
        let patches = exchange_guards(&layout, grown_patches(&layout, 2));

        // from the neighbor box
        assert_eq!(patches[0].get((4, 1), 0), 41.0);
        assert_eq!(patches[1].get((3, 2), 0), 32.0);

        // from periodic images
        assert_eq!(patches[0].get((-1, 1), 0), 71.0);
        assert_eq!(patches[1].get((8, 0), 0), 0.0);
        assert_eq!(patches[0].get((0, -1), 0), 3.0);
        assert_eq!(patches[0].get((-1, -1), 0), 73.0);
    }

    #[test]
    fn non_periodic_guards_are_left_for_the_boundary_fill() {
        let layout = two_box_layout([false, false]);
        let patches = exchange_guards(&layout, grown_patches(&layout, 1));
        assert_eq!(patches[0].get((-1, 1), 0), -1.0);
        assert_eq!(patches[0].get((4, 1), 0), 41.0);
    }

    #[test]
    fn uncovered_guards_are_sampled_from_the_coarse_level() {
        let fine = Layout::new(range2d(0..16, 0..16), vec![range2d(4..8, 4..8)], [false, false]);
        let coarse_layout = Layout::new(range2d(0..8, 0..8), vec![range2d(0..8, 0..8)], [false, false]);
        let coarse = vec![Patch::from_scalar_function(0, range2d(0..8, 0..8), |(i, j)| (10 * i + j) as f64)];
        let patches = vec![Patch::zeros(1, 1, range2d(2..10, 2..10))];

        let source = CoarseSource { layout: &coarse_layout, patches: &coarse, ratio: 2 };
        let filled = fill_guards(&fine, patches, Some(source), |_, _, _| BcCode::FoExtrap, |_, _, _, _| 0.0);

        assert_eq!(filled[0].get((3, 5), 0), 12.0);
        assert_eq!(filled[0].get((9, 9), 0), 44.0);
        assert_eq!(filled[0].get((5, 5), 0), 0.0);
    }
}
