use rayon::prelude::*;
use crate::boundary::DomainBc;
use crate::elliptic::{
    checked_solve, inverse_density_faces, inverse_density_links, Centering, EllipticProblem, EllipticSolver,
};
use crate::error::Result;
use crate::index_space::{shift, Axis, IndexSpace};
use crate::mesh::Mesh;
use crate::meshing::Layout;
use crate::patch::Patch;




/**
 * The result of a cell-centered level projection, per patch on the valid
 * cells: the velocity correction `dt grad(phi) / rho` (two fields) to be
 * subtracted, and the pressure increment `phi`.
 */
pub struct LevelProjection {
    pub correction: Vec<Patch>,
    pub phi: Vec<Patch>,
}




/**
 * The result of a nodal sync projection, per patch on the valid cells: the
 * projected velocity increment (two fields) and the cell average of the
 * nodal potential, which is added to the pressure.
 */
pub struct SyncProjection {
    pub increment: Vec<Patch>,
    pub phi: Vec<Patch>,
}




/**
 * Runs the MAC, level, and sync projections of one level. The controller
 * owns no data; it assembles elliptic problems from a level's patches,
 * solves them with the configured solver, and hands back corrections.
 */
pub struct ProjectionController<'a> {
    pub solver: &'a dyn EllipticSolver,
    pub bc: &'a DomainBc,
}




// ============================================================================
impl<'a> ProjectionController<'a> {


    /**
     * Project the predicted face velocities of every patch onto the space
     * satisfying `div(u) = divu`. Solves `div(grad(phi) / rho) = (div(u*) -
     * divu) / dt` over the level, then sets `u = u* - dt grad(phi) / rho` on
     * every face of each (grown) face patch where the potential is
     * available. On fine levels the coarse MAC potential, sampled piecewise
     * constant, supplies Dirichlet data at the coarse-fine boundary.
     *
     * Returns the potential over the level's bounding box grown by one cell,
     * for use by the next finer level.
     */
    pub fn mac_project(
        &self,
        level: usize,
        time: f64,
        dt: f64,
        layout: &Layout,
        mesh: &Mesh,
        umac: &mut [[Patch; 2]],
        rho_half: &[Patch],
        divu: Option<&[Patch]>,
        coarse_phi: Option<(&Patch, i64)>,
    ) -> Result<Patch> {
        let lev = level as u32;
        let region = layout.bounding();
        let active = layout.active_mask(lev, &region);
        let rho = positive_density(layout.gather_grown(rho_half, 0..1, &region.extend_all(1)));
        let beta = inverse_density_faces(&rho, &region);
        let spacing = mesh.cell_spacing();

        let rhs = Patch::from_scalar_function(lev, region.clone(), |c| match layout.box_containing(c) {
            Some(k) => {
                let source = divu.map_or(0.0, |d| d[k].get(c, 0));
                -(face_divergence(&umac[k], c, spacing) - source) / dt
            }
            None => 0.0,
        });

        let exterior = coarse_phi.map(|(phi, ratio)| {
            Patch::from_scalar_function(lev, region.extend_all(1), |(i, j)| {
                let c = (i.div_euclid(ratio), j.div_euclid(ratio));
                if phi.index_space().contains(c) { phi.get(c, 0) } else { 0.0 }
            })
        });

        let problem = EllipticProblem {
            centering: Centering::Cell,
            domain: layout.domain().clone(),
            region: region.clone(),
            active: &active,
            sides: self.bc.potential_sides(),
            beta: [&beta[0], &beta[1]],
            alpha: None,
            exterior: exterior.as_ref(),
            spacing,
            rhs: &rhs,
            initial: None,
        };
        let report = checked_solve(self.solver, &problem, "MAC projection", level, time)?;
        let phi = problem.extended_solution(&report.solution);

        umac.par_iter_mut().zip(rho_half).for_each(|(faces, rho)| {
            for axis in Axis::BOTH {
                let h = mesh.spacing(axis);
                let u = &mut faces[axis.index()];
                let space = u.index_space().clone();

                for f in space.iter() {
                    let l = shift(f, axis.offset(-1));

                    if phi.index_space().contains(l) && phi.index_space().contains(f) {
                        let b = 2.0 / (rho.get(l, 0) + rho.get(f, 0));
                        *u.get_mut(f, 0) -= dt * b * (phi.get(f, 0) - phi.get(l, 0)) / h;
                    }
                }
            }
        });
        Ok(phi)
    }


    /**
     * Approximately project the cell-centered velocity of a level. The
     * velocity is averaged to faces, the face divergence drives a
     * cell-centered solve, and the cell-averaged face gradient of the
     * potential is the correction. The potential vanishes at coarse-fine
     * boundaries.
     *
     * The `velocity` and `rho` patches must be grown by at least one cell
     * with guard zones filled.
     */
    pub fn level_project(
        &self,
        level: usize,
        time: f64,
        dt: f64,
        layout: &Layout,
        mesh: &Mesh,
        velocity: &[Patch],
        rho: &[Patch],
        divu: Option<&[Patch]>,
    ) -> Result<LevelProjection> {
        let lev = level as u32;
        let region = layout.bounding();
        let active = layout.active_mask(lev, &region);
        let rho_all = positive_density(layout.gather_grown(rho, 0..1, &region.extend_all(1)));
        let beta = inverse_density_faces(&rho_all, &region);
        let spacing = mesh.cell_spacing();

        let rhs = Patch::from_scalar_function(lev, region.clone(), |c| match layout.box_containing(c) {
            Some(k) => {
                let source = divu.map_or(0.0, |d| d[k].get(c, 0));
                -(averaged_divergence(&velocity[k], c, spacing) - source) / dt
            }
            None => 0.0,
        });

        let problem = EllipticProblem {
            centering: Centering::Cell,
            domain: layout.domain().clone(),
            region: region.clone(),
            active: &active,
            sides: self.bc.potential_sides(),
            beta: [&beta[0], &beta[1]],
            alpha: None,
            exterior: None,
            spacing,
            rhs: &rhs,
            initial: None,
        };
        let report = checked_solve(self.solver, &problem, "level projection", level, time)?;
        let phi = problem.extended_solution(&report.solution);

        let (correction, phi): (Vec<_>, Vec<_>) = layout
            .boxes()
            .par_iter()
            .zip(rho)
            .map(|(valid, rho)| {
                let correction = Patch::from_slice_function(lev, valid.clone(), 2, |c, out| {
                    for axis in Axis::BOTH {
                        let lo = shift(c, axis.offset(-1));
                        let hi = shift(c, axis.offset(1));
                        let b_lo = 2.0 / (rho.get(lo, 0) + rho.get(c, 0));
                        let b_hi = 2.0 / (rho.get(hi, 0) + rho.get(c, 0));
                        let g = 0.5 * (b_lo * (phi.get(c, 0) - phi.get(lo, 0)) + b_hi * (phi.get(hi, 0) - phi.get(c, 0)));
                        out[axis.index()] = dt * g / mesh.spacing(axis);
                    }
                });
                (correction, phi.extract(valid.clone()))
            })
            .unzip();

        Ok(LevelProjection { correction, phi })
    }


    /**
     * The MAC sync solve of a coarse level. `mismatch` holds, per patch on
     * the valid cells, the refluxed MAC register: the change in cell
     * divergence the coarse face velocities must make up for the finer
     * level's averaged face velocities. Solves `-div(grad(phi) / rho) =
     * mismatch / dt` with the MAC boundary conditions, and returns the
     * correction velocity `u_corr = -dt grad(phi) / rho` on the valid faces
     * of each patch, so that `div(u_corr) = mismatch`.
     */
    pub fn mac_sync_solve(
        &self,
        level: usize,
        time: f64,
        dt: f64,
        layout: &Layout,
        mesh: &Mesh,
        mismatch: &[Patch],
        rho_half: &[Patch],
    ) -> Result<Vec<[Patch; 2]>> {
        let lev = level as u32;
        let region = layout.bounding();
        let active = layout.active_mask(lev, &region);
        let rho = positive_density(layout.gather_grown(rho_half, 0..1, &region.extend_all(1)));
        let beta = inverse_density_faces(&rho, &region);
        let spacing = mesh.cell_spacing();

        let mut rhs = layout.gather(mismatch, 0..1, &region);
        rhs.scale_field(0, 1.0 / dt);

        let problem = EllipticProblem {
            centering: Centering::Cell,
            domain: layout.domain().clone(),
            region: region.clone(),
            active: &active,
            sides: self.bc.potential_sides(),
            beta: [&beta[0], &beta[1]],
            alpha: None,
            exterior: None,
            spacing,
            rhs: &rhs,
            initial: None,
        };
        let report = checked_solve(self.solver, &problem, "MAC sync projection", level, time)?;
        let phi = problem.extended_solution(&report.solution);

        Ok(layout
            .boxes()
            .par_iter()
            .map(|valid| {
                Axis::BOTH.map(|axis| {
                    let h = mesh.spacing(axis);
                    Patch::from_scalar_function(lev, valid.faces(axis), |f| {
                        let l = shift(f, axis.offset(-1));
                        let b = 2.0 / (rho.get(l, 0) + rho.get(f, 0));
                        -dt * b * (phi.get(f, 0) - phi.get(l, 0)) / h
                    })
                })
            })
            .collect())
    }


    /**
     * The nodal sync projection of a coarse level. `vsync` holds the
     * velocity sync rate on the valid cells, `sync_rhs` the coarse-fine
     * divergence mismatch assembled by the sync register over the level's
     * node region. Solves `div(grad(phi) / rho) = (div(dt vsync) + R) / dt`
     * on the nodes and returns `dt vsync - dt grad(phi) / rho` per patch.
     */
    pub fn sync_project(
        &self,
        level: usize,
        time: f64,
        dt: f64,
        layout: &Layout,
        mesh: &Mesh,
        vsync: &[Patch],
        rho: &[Patch],
        sync_rhs: &Patch,
    ) -> Result<SyncProjection> {
        let lev = level as u32;
        let domain = node_domain(layout);
        let region = layout
            .bounding()
            .nodes()
            .intersect(&domain)
            .unwrap_or_else(|| domain.clone());
        let cells = IndexSpace::new(
            region.range(Axis::I).start - 1..region.range(Axis::I).end,
            region.range(Axis::J).start - 1..region.range(Axis::J).end,
        );
        let spacing = mesh.cell_spacing();

        let velocity = wrapped_cells(layout, vsync, 0..2, &cells, 0.0, dt);
        let rho_cells = wrapped_cells(layout, rho, 0..1, &cells, 1.0, 1.0);
        let beta = inverse_density_links(&rho_cells, &region);

        let active = Patch::from_scalar_function(lev, region.clone(), |(i, j)| {
            let adjacent = [(i - 1, j - 1), (i, j - 1), (i - 1, j), (i, j)];
            if adjacent.iter().all(|&c| layout.covers(c) || layout.wrap(c).is_none()) { 1.0 } else { 0.0 }
        });
        let div = nodal_divergence(&velocity, &region, spacing, None);
        let rhs = Patch::from_scalar_function(lev, region.clone(), |n| {
            let mismatch = if sync_rhs.index_space().contains(n) { sync_rhs.get(n, 0) } else { 0.0 };
            -(div.get(n, 0) + mismatch) / dt
        });

        let problem = EllipticProblem {
            centering: Centering::Node,
            domain: domain.clone(),
            region: region.clone(),
            active: &active,
            sides: self.bc.potential_sides(),
            beta: [&beta[0], &beta[1]],
            alpha: None,
            exterior: None,
            spacing,
            rhs: &rhs,
            initial: None,
        };
        let report = checked_solve(self.solver, &problem, "sync projection", level, time)?;
        let phi = report.solution;
        let node = |n: (i64, i64)| {
            let mut w = n;
            for axis in Axis::BOTH {
                let r = domain.range(axis);
                let k = axis.of(w);
                if layout.periodic()[axis.index()] && !r.contains(&k) {
                    let k = r.start + (k - r.start).rem_euclid(r.end - r.start);
                    w = match axis {
                        Axis::I => (k, w.1),
                        Axis::J => (w.0, k),
                    };
                }
            }
            if phi.index_space().contains(w) { phi.get(w, 0) } else { 0.0 }
        };

        let (increment, phi): (Vec<_>, Vec<_>) = layout
            .boxes()
            .iter()
            .map(|valid| {
                let increment = Patch::from_slice_function(lev, valid.clone(), 2, |(i, j), out| {
                    let p00 = node((i, j));
                    let p10 = node((i + 1, j));
                    let p01 = node((i, j + 1));
                    let p11 = node((i + 1, j + 1));
                    let gx = 0.5 * ((p10 + p11) - (p00 + p01)) / spacing.0;
                    let gy = 0.5 * ((p01 + p11) - (p00 + p10)) / spacing.1;
                    let r = rho_cells.get((i, j), 0);
                    out[0] = velocity.get((i, j), 0) - dt * gx / r;
                    out[1] = velocity.get((i, j), 1) - dt * gy / r;
                });
                let average = Patch::from_scalar_function(lev, valid.clone(), |(i, j)| {
                    0.25 * (node((i, j)) + node((i + 1, j)) + node((i, j + 1)) + node((i + 1, j + 1)))
                });
                (increment, average)
            })
            .unzip();

        Ok(SyncProjection { increment, phi })
    }
}




/**
 * The divergence of face-centered velocities at a cell.
 */
pub fn face_divergence(faces: &[Patch; 2], c: (i64, i64), spacing: (f64, f64)) -> f64 {
    let du = faces[0].get(shift(c, (1, 0)), 0) - faces[0].get(c, 0);
    let dv = faces[1].get(shift(c, (0, 1)), 0) - faces[1].get(c, 0);
    du / spacing.0 + dv / spacing.1
}




/**
 * The divergence at a cell of cell-centered velocity averaged to its faces.
 * The velocity patch must cover the cell's neighbors.
 */
pub fn averaged_divergence(velocity: &Patch, c: (i64, i64), spacing: (f64, f64)) -> f64 {
    let du = velocity.get(shift(c, (1, 0)), 0) - velocity.get(shift(c, (-1, 0)), 0);
    let dv = velocity.get(shift(c, (0, 1)), 1) - velocity.get(shift(c, (0, -1)), 1);
    0.5 * du / spacing.0 + 0.5 * dv / spacing.1
}




/**
 * The nodal divergence of a cell-centered velocity field (fields 0 and 1)
 * over the given node region. When `within` is given, only cells inside it
 * contribute; the result is then the partial divergence owned by that box,
 * and partial divergences from neighboring boxes sum to the full value.
 */
pub fn nodal_divergence(velocity: &Patch, nodes: &IndexSpace, spacing: (f64, f64), within: Option<&IndexSpace>) -> Patch {
    let u = |c: (i64, i64), n: usize| {
        let inside = within.map_or(true, |w| w.contains(c)) && velocity.index_space().contains(c);
        if inside { velocity.get(c, n) } else { 0.0 }
    };
    Patch::from_scalar_function(velocity.level(), nodes.clone(), |(i, j)| {
        let dudx = (u((i, j - 1), 0) + u((i, j), 0)) - (u((i - 1, j - 1), 0) + u((i - 1, j), 0));
        let dvdy = (u((i - 1, j), 1) + u((i, j), 1)) - (u((i - 1, j - 1), 1) + u((i, j - 1), 1));
        0.5 * dudx / spacing.0 + 0.5 * dvdy / spacing.1
    })
}




/**
 * The node lattice of a level's domain, excluding the upper node on
 * periodic axes.
 */
pub fn node_domain(layout: &Layout) -> IndexSpace {
    let nodes = layout.domain().nodes();
    let trim = |axis: Axis| {
        let r = nodes.range(axis);
        if layout.periodic()[axis.index()] { r.start..r.end - 1 } else { r }
    };
    IndexSpace::new(trim(Axis::I), trim(Axis::J))
}




/**
 * Sample valid data of a level onto a cell region, wrapping periodic images
 * and using `default` where no box covers a cell; values are multiplied by
 * `scale`.
 */
fn wrapped_cells(layout: &Layout, patches: &[Patch], fields: core::ops::Range<usize>, region: &IndexSpace, default: f64, scale: f64) -> Patch {
    let count = fields.end - fields.start;
    let level = patches.first().map_or(0, |p| p.level());

    Patch::from_slice_function(level, region.clone(), count, |c, out| {
        let source = layout
            .wrap(c)
            .and_then(|w| layout.box_containing(w).map(|k| (k, w)));

        for (n, x) in out.iter_mut().enumerate() {
            *x = match source {
                Some((k, w)) => scale * patches[k].get(w, fields.start + n),
                None => default,
            }
        }
    })
}




/**
 * Replace non-positive densities (indexes no patch covers) with one, so the
 * inverse-density coefficients stay finite.
 */
fn positive_density(mut rho: Patch) -> Patch {
    for s in rho.iter_data_mut() {
        if s[0] <= 0.0 {
            s[0] = 1.0
        }
    }
    rho
}




// ============================================================================
#[cfg(test)]
mod test {

    use super::*;
    use crate::elliptic::ConjugateGradient;
    use crate::index_space::range2d;

    fn periodic_level(n: i64) -> (Layout, Mesh) {
        let domain = range2d(0..n, 0..n);
        let layout = Layout::new(domain.clone(), vec![range2d(0..n / 2, 0..n), range2d(n / 2..n, 0..n)], [true, true]);
        let mesh = Mesh::new((0.0..1.0, 0.0..1.0), (n, n));
        (layout, mesh)
    }

    #[test]
    fn mac_projection_removes_face_divergence() {
        let (layout, mesh) = periodic_level(16);
        let (dx, dy) = mesh.cell_spacing();
        let tau = 2.0 * std::f64::consts::PI;

        let mut umac: Vec<[Patch; 2]> = layout
            .boxes()
            .iter()
            .map(|b| {
                let g = b.extend_all(1);
                [
                    Patch::from_scalar_function(0, g.faces(Axis::I), |(i, j)| (tau * i as f64 * dx).sin() + (tau * (j as f64 + 0.5) * dy).cos()),
                    Patch::from_scalar_function(0, g.faces(Axis::J), |(i, j)| (tau * j as f64 * dy).cos() * (tau * (i as f64 + 0.5) * dx).sin()),
                ]
            })
            .collect();
        let rho: Vec<Patch> = layout.boxes().iter().map(|b| Patch::constant(0, 1, b.extend_all(4), 1.0)).collect();

        let solver = ConjugateGradient::default();
        let bc = DomainBc::periodic();
        let controller = ProjectionController { solver: &solver, bc: &bc };
        let phi = controller.mac_project(0, 0.0, 0.1, &layout, &mesh, &mut umac, &rho, None, None);
        assert!(phi.is_ok());

        for (valid, faces) in layout.boxes().iter().zip(&umac) {
            for c in valid.iter() {
                assert!(face_divergence(faces, c, (dx, dy)).abs() < 1e-7);
            }
        }
    }

    #[test]
    fn level_projection_reduces_divergence_of_a_gradient_field() {
        let (layout, mesh) = periodic_level(16);
        let (dx, dy) = mesh.cell_spacing();
        let tau = 2.0 * std::f64::consts::PI;
        let field = |(i, j): (i64, i64), s: &mut [f64]| {
            let x = (i as f64 + 0.5) * dx;
            let y = (j as f64 + 0.5) * dy;
            s[0] = (tau * x).cos() * (tau * y).sin();
            s[1] = (tau * x).sin() * (tau * y).cos();
        };
        let velocity: Vec<Patch> = layout
            .boxes()
            .iter()
            .map(|b| Patch::from_slice_function(0, b.extend_all(1), 2, field))
            .collect();
        let rho: Vec<Patch> = layout.boxes().iter().map(|b| Patch::constant(0, 1, b.extend_all(1), 1.0)).collect();

        let solver = ConjugateGradient::default();
        let bc = DomainBc::periodic();
        let controller = ProjectionController { solver: &solver, bc: &bc };
        let projection = controller
            .level_project(0, 0.0, 1.0, &layout, &mesh, &velocity, &rho, None)
            .unwrap();

        let before: f64 = layout.boxes().iter().zip(&velocity)
            .flat_map(|(b, v)| b.iter().map(move |c| averaged_divergence(v, c, (dx, dy)).abs()))
            .fold(0.0, f64::max);

        let after = velocity.iter().zip(&projection.correction).map(|(v, c)| {
            let mut v = v.clone();
            v.add_from(c, 0, 0, 2, -1.0);
            v
        }).collect::<Vec<_>>();
        let exchanged = crate::meshing::exchange_guards(&layout, after);
        let residual: f64 = layout.boxes().iter().zip(&exchanged)
            .flat_map(|(b, v)| b.iter().map(move |c| averaged_divergence(v, c, (dx, dy)).abs()))
            .fold(0.0, f64::max);

        assert!(residual < 0.5 * before);
    }

    #[test]
    fn level_projection_potential_removes_the_averaged_face_divergence() {
        let n = 16;
        let layout = Layout::new(range2d(0..n, 0..n), vec![range2d(0..n, 0..n)], [true, true]);
        let mesh = Mesh::new((0.0..1.0, 0.0..1.0), (n, n));
        let tau = 2.0 * std::f64::consts::PI;
        let dt = 0.1;

        let grown = range2d(-1..n + 1, -1..n + 1);
        let velocity = vec![Patch::from_slice_function(0, grown.clone(), 2, |c, s| {
            let (x, y) = mesh.cell_center(c);
            s[0] = (tau * x).sin() + 0.5 * (tau * y).cos();
            s[1] = (tau * x).cos() * (tau * y).cos();
        })];
        let rho = vec![Patch::constant(0, 1, grown, 1.0)];

        let solver = ConjugateGradient::default();
        let bc = DomainBc::periodic();
        let controller = ProjectionController { solver: &solver, bc: &bc };
        let projection = controller
            .level_project(0, 0.0, dt, &layout, &mesh, &velocity, &rho, None)
            .unwrap();

        let u = &velocity[0];
        let phi = |(i, j): (i64, i64)| projection.phi[0].get((i.rem_euclid(n), j.rem_euclid(n)), 0);
        let face = |c: (i64, i64), axis: Axis| {
            let l = shift(c, axis.offset(-1));
            0.5 * (u.get(l, axis.index()) + u.get(c, axis.index())) - dt * (phi(c) - phi(l)) / mesh.spacing(axis)
        };
        let mut before = 0.0f64;

        for c in range2d(0..n, 0..n).iter() {
            let div: f64 = Axis::BOTH
                .iter()
                .map(|&axis| (face(shift(c, axis.offset(1)), axis) - face(c, axis)) / mesh.spacing(axis))
                .sum();
            assert!(div.abs() < 1e-6);
            before = before.max(averaged_divergence(u, c, mesh.cell_spacing()).abs());
        }
        assert!(before > 1.0);
    }

    #[test]
    fn mac_sync_correction_makes_up_the_divergence_mismatch() {
        let (layout, mesh) = periodic_level(8);
        let spacing = mesh.cell_spacing();
        let mismatch: Vec<Patch> = layout
            .boxes()
            .iter()
            .map(|b| Patch::from_scalar_function(0, b.clone(), |(i, j)| if (i, j) == (2, 3) { 1.0 } else if (i, j) == (5, 6) { -1.0 } else { 0.0 }))
            .collect();
        let rho: Vec<Patch> = layout.boxes().iter().map(|b| Patch::constant(0, 1, b.extend_all(1), 1.0)).collect();

        let solver = ConjugateGradient::default();
        let bc = DomainBc::periodic();
        let controller = ProjectionController { solver: &solver, bc: &bc };
        let ucorr = controller.mac_sync_solve(0, 0.0, 0.5, &layout, &mesh, &mismatch, &rho).unwrap();

        for ((valid, faces), q) in layout.boxes().iter().zip(&ucorr).zip(&mismatch) {
            for c in valid.iter() {
                assert!((face_divergence(faces, c, spacing) - q.get(c, 0)).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn nodal_divergence_of_uniform_flow_vanishes_and_partials_sum() {
        let velocity = Patch::from_slice_function(0, range2d(-1..5, -1..5), 2, |(i, j), s| {
            s[0] = 1.0 + i as f64;
            s[1] = 2.0 - j as f64;
        });
        let nodes = range2d(0..4, 0..4).nodes();
        let full = nodal_divergence(&velocity, &nodes, (1.0, 1.0), None);
        assert!(full.iter_data().all(|s| s[0].abs() < 1e-14));

        let left = nodal_divergence(&velocity, &nodes, (1.0, 1.0), Some(&range2d(-1..2, -1..5)));
        let right = nodal_divergence(&velocity, &nodes, (1.0, 1.0), Some(&range2d(2..5, -1..5)));
        assert!((left.get((2, 2), 0) + right.get((2, 2), 0)).abs() < 1e-14);
    }
}
