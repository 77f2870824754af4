use core::ops::Range;
use serde::{Deserialize, Serialize};
use crate::index_space::{range2d, Axis, IndexSpace};

/// A rectangle in a two-dimensional space, as a pair of ranges.
pub type Rectangle<T> = (Range<T>, Range<T>);

/// A simple rectilinear structured mesh. It describes the physical extent of
/// the problem domain and the number of cells across it at one refinement
/// level.
///
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Mesh {
    pub area: Rectangle<f64>,
    pub size: (i64, i64),
}

impl Mesh {
    pub fn new(area: Rectangle<f64>, size: (i64, i64)) -> Self {
        assert!(size.0 > 0 && size.1 > 0, "mesh must have at least one cell per axis");
        Self { area, size }
    }

    pub fn cell_spacing(&self) -> (f64, f64) {
        let d0 = (self.area.0.end - self.area.0.start) / self.size.0 as f64;
        let d1 = (self.area.1.end - self.area.1.start) / self.size.1 as f64;
        (d0, d1)
    }

    pub fn spacing(&self, axis: Axis) -> f64 {
        let (d0, d1) = self.cell_spacing();
        match axis {
            Axis::I => d0,
            Axis::J => d1,
        }
    }

    pub fn cell_center(&self, index: (i64, i64)) -> (f64, f64) {
        let (d0, d1) = self.cell_spacing();
        let x0 = self.area.0.start + d0 * (index.0 as f64 + 0.5);
        let x1 = self.area.1.start + d1 * (index.1 as f64 + 0.5);
        (x0, x1)
    }

    /// Return the point on the domain boundary nearest to the given guard
    /// cell, on the face normal to `axis`.
    pub fn boundary_point(&self, index: (i64, i64), axis: Axis, upper: bool) -> (f64, f64) {
        let (x0, x1) = self.cell_center(index);
        match (axis, upper) {
            (Axis::I, false) => (self.area.0.start, x1),
            (Axis::I, true) => (self.area.0.end, x1),
            (Axis::J, false) => (x0, self.area.1.start),
            (Axis::J, true) => (x0, self.area.1.end),
        }
    }

    pub fn total_zones(&self) -> i64 {
        self.size.0 * self.size.1
    }

    /// The cell index space of the whole domain.
    pub fn index_space(&self) -> IndexSpace {
        range2d(0..self.size.0, 0..self.size.1)
    }

    pub fn cell_volume(&self) -> f64 {
        let (d0, d1) = self.cell_spacing();
        d0 * d1
    }

    /// The area (length, in two dimensions) of a face normal to `axis`.
    pub fn face_area(&self, axis: Axis) -> f64 {
        let (d0, d1) = self.cell_spacing();
        match axis {
            Axis::I => d1,
            Axis::J => d0,
        }
    }

    /// The mesh covering the same area with each cell split `ratio` times
    /// per axis.
    pub fn refine(&self, ratio: i64) -> Self {
        Self::new(self.area.clone(), (self.size.0 * ratio, self.size.1 * ratio))
    }
}

#[cfg(test)]
mod test {
    use super::Mesh;
    use crate::index_space::Axis;

    #[test]
    fn refined_mesh_has_proportional_spacing() {
        let mesh = Mesh::new((0.0..1.0, 0.0..2.0), (10, 10));
        let fine = mesh.refine(2);
        assert_eq!(fine.cell_spacing(), (0.05, 0.1));
        assert_eq!(fine.face_area(Axis::I), 0.1);
        assert!((4.0 * fine.cell_volume() - mesh.cell_volume()).abs() < 1e-15);
    }

    #[test]
    fn boundary_points_sit_on_the_domain_edge() {
        let mesh = Mesh::new((0.0..1.0, 0.0..1.0), (4, 4));
        assert_eq!(mesh.boundary_point((-1, 2), Axis::I, false), (0.0, 0.625));
        assert_eq!(mesh.boundary_point((1, 4), Axis::J, true), (0.375, 1.0));
    }
}
