use serde::{Deserialize, Serialize};
use crate::boundary::DomainBc;
use crate::elliptic::{checked_solve, Centering, EllipticProblem, EllipticSolver};
use crate::error::Result;
use crate::index_space::{shift, Axis, IndexSpace};
use crate::level::DENSITY;
use crate::mesh::Mesh;
use crate::meshing::Layout;
use crate::patch::Patch;

/// How a diffusing quantity is written. `LaplacianOverRho` diffuses the
/// specific value `s / rho` of a conservative quantity, `d(s)/dt =
/// div(D grad(s / rho))`.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiffusionForm {
    Laplacian,
    LaplacianOverRho,
}

/// The level a diffusion solve runs on, and its time step.
///
#[derive(Clone, Copy)]
pub struct LevelStep<'a> {
    pub level: usize,
    pub time: f64,
    pub dt: f64,
    pub layout: &'a Layout,
    pub mesh: &'a Mesh,
}

/// How a sync diffusion solve weights its unknowns.
///
#[derive(Clone, Copy)]
pub enum SyncWeight<'a> {
    /// `(1 - theta dt D L) S' = S`
    Plain,

    /// `(rho - theta dt mu L) V' = rho V`, for the velocity sync.
    Momentum(&'a [Patch]),

    /// `(rho - theta dt D L) q' = S`, with `S' = rho q'`.
    OverRho(&'a [Patch]),
}

/// Crank-Nicolson diffusion of state components and of sync corrections.
/// `theta` is 1/2 for Crank-Nicolson and 1 for backward Euler.
///
pub struct Diffusion<'a> {
    pub solver: &'a dyn EllipticSolver,
    pub bc: &'a DomainBc,
    pub theta: f64,
}

/// The five-point Laplacian of field `n` of `q` over `region`. The patch
/// must cover `region` grown by one cell.
///
pub fn laplacian(q: &Patch, n: usize, region: &IndexSpace, spacing: (f64, f64)) -> Patch {
    Patch::from_scalar_function(q.level(), region.clone(), |c| {
        let mut sum = 0.0;
        for axis in Axis::BOTH {
            let h = if axis == Axis::I { spacing.0 } else { spacing.1 };
            let lo = q.get(shift(c, axis.offset(-1)), n);
            let hi = q.get(shift(c, axis.offset(1)), n);
            sum += (hi - 2.0 * q.get(c, n) + lo) / (h * h);
        }
        sum
    })
}

/// The explicit diffusion term `D L s` (or `D L (s / rho)`) of state
/// component `comp`, over `region`. The state patch must be ghost filled
/// one cell beyond `region`.
///
pub fn explicit_term(state: &Patch, comp: usize, coef: f64, form: DiffusionForm, region: &IndexSpace, spacing: (f64, f64)) -> Patch {
    let q = specific(state, comp, form);
    let mut term = laplacian(&q, 0, region, spacing);
    term.scale_field(0, coef);
    term
}

/// The diffusing quantity of component `comp`: the value itself, or the
/// value per unit density.
fn specific(state: &Patch, comp: usize, form: DiffusionForm) -> Patch {
    match form {
        DiffusionForm::Laplacian => state.field(comp),
        DiffusionForm::LaplacianOverRho => Patch::from_scalar_function(state.level(), state.index_space().clone(), |c| {
            state.get(c, comp) / state.get(c, DENSITY)
        }),
    }
}

/// Replace the value in cells no patch covers with one, so that gathered
/// densities can be used as coefficients.
fn unit_where_empty(mut rho: Patch) -> Patch {
    for s in rho.iter_data_mut() {
        if s[0] <= 0.0 {
            s[0] = 1.0
        }
    }
    rho
}

impl<'a> Diffusion<'a> {
    /// Implicitly diffuse state component `comp` with coefficient `coef`.
    /// `old` holds the ghost-filled old-time state (grown by at least one
    /// cell); `new` holds the advected state `s*` on entry and the diffused
    /// state on return. For `LaplacianOverRho`, the new density must
    /// already be in `new`. Returns the time-weighted diffusive fluxes
    /// `-D grad(q) A` on the valid faces of each patch.
    ///
    pub fn diffuse_scalar(
        &self,
        step: &LevelStep,
        comp: usize,
        coef: f64,
        form: DiffusionForm,
        old: &[Patch],
        new: &mut [Patch],
    ) -> Result<Vec<[Patch; 2]>> {
        let layout = step.layout;
        let region = layout.bounding();
        let grown = region.extend_all(1);

        let q_old = match form {
            DiffusionForm::Laplacian => layout.gather_grown(old, comp..comp + 1, &grown),
            DiffusionForm::LaplacianOverRho => {
                let s = layout.gather_grown(old, comp..comp + 1, &grown);
                let rho = unit_where_empty(layout.gather_grown(old, DENSITY..DENSITY + 1, &grown));
                Patch::from_scalar_function(s.level(), grown.clone(), |c| s.get(c, 0) / rho.get(c, 0))
            }
        };
        let star = layout.gather(new, comp..comp + 1, &region);
        let alpha = match form {
            DiffusionForm::Laplacian => Patch::constant(star.level(), 1, region.clone(), 1.0),
            DiffusionForm::LaplacianOverRho => unit_where_empty(layout.gather(new, DENSITY..DENSITY + 1, &region)),
        };

        let q_new = self.implicit(step, comp, coef, Some(&q_old), &star, &alpha, Some(&q_old), "scalar diffusion")?;

        for (valid, patch) in layout.boxes().iter().zip(new.iter_mut()) {
            for c in valid.iter() {
                let weight = match form {
                    DiffusionForm::Laplacian => 1.0,
                    DiffusionForm::LaplacianOverRho => patch.get(c, DENSITY),
                };
                *patch.get_mut(c, comp) = weight * q_new.get(c, 0);
            }
        }
        Ok(self.fluxes(step, coef, &q_new, Some(&q_old)))
    }

    /// Implicitly diffuse velocity component `comp` with viscosity `mu`:
    /// `(rho_half - theta dt mu L) u = rho_half u* + (1 - theta) dt mu L
    /// u_old`. The arguments follow `diffuse_scalar`; `rho_half` holds the
    /// time-centered density on (at least) the valid cells.
    ///
    pub fn diffuse_velocity(
        &self,
        step: &LevelStep,
        comp: usize,
        mu: f64,
        old: &[Patch],
        new: &mut [Patch],
        rho_half: &[Patch],
    ) -> Result<Vec<[Patch; 2]>> {
        let layout = step.layout;
        let region = layout.bounding();
        let grown = region.extend_all(1);

        let q_old = layout.gather_grown(old, comp..comp + 1, &grown);
        let rho = unit_where_empty(layout.gather(rho_half, 0..1, &region));
        let star = layout.gather(new, comp..comp + 1, &region);
        let momentum = Patch::from_scalar_function(star.level(), region.clone(), |c| rho.get(c, 0) * star.get(c, 0));

        let u_new = self.implicit(step, comp, mu, Some(&q_old), &momentum, &rho, Some(&q_old), "velocity diffusion")?;
        layout.scatter(&u_new, 0, new, comp, 1);

        Ok(self.fluxes(step, mu, &u_new, Some(&q_old)))
    }

    /// Diffuse field `field` of a sync correction (valid cells), the
    /// correction of state component `comp`. The correction vanishes on
    /// coarse-fine boundaries. Returns the diffusive sync fluxes
    /// `-theta D grad(q') A` on the valid faces.
    ///
    pub fn diffuse_sync(
        &self,
        step: &LevelStep,
        sync: &mut [Patch],
        field: usize,
        comp: usize,
        coef: f64,
        weight: SyncWeight,
    ) -> Result<Vec<[Patch; 2]>> {
        let layout = step.layout;
        let region = layout.bounding();
        let s = layout.gather(sync, field..field + 1, &region);

        let (alpha, rhs) = match weight {
            SyncWeight::Plain => (Patch::constant(s.level(), 1, region.clone(), 1.0), s.clone()),
            SyncWeight::Momentum(rho) => {
                let rho = unit_where_empty(layout.gather(rho, 0..1, &region));
                let rhs = Patch::from_scalar_function(s.level(), region.clone(), |c| rho.get(c, 0) * s.get(c, 0));
                (rho, rhs)
            }
            SyncWeight::OverRho(rho) => (unit_where_empty(layout.gather(rho, 0..1, &region)), s.clone()),
        };

        let q = self.implicit(step, comp, coef, None, &rhs, &alpha, None, "sync diffusion")?;

        for (valid, patch) in layout.boxes().iter().zip(sync.iter_mut()) {
            for c in valid.iter() {
                let w = match weight {
                    SyncWeight::OverRho(_) => alpha.get(c, 0),
                    _ => 1.0,
                };
                *patch.get_mut(c, field) = w * q.get(c, 0);
            }
        }
        Ok(self.fluxes(step, coef, &q, None))
    }

    /// Solve `(alpha - theta dt coef L) q = base + (1 - theta) dt coef L
    /// q_old` over the level, and return `q` extended by one cell.
    fn implicit(
        &self,
        step: &LevelStep,
        comp: usize,
        coef: f64,
        q_old: Option<&Patch>,
        base: &Patch,
        alpha: &Patch,
        exterior: Option<&Patch>,
        operation: &'static str,
    ) -> Result<Patch> {
        let layout = step.layout;
        let lev = step.level as u32;
        let region = layout.bounding();
        let spacing = step.mesh.cell_spacing();
        let active = layout.active_mask(lev, &region);

        let rhs = match q_old {
            Some(q) => {
                let lap = laplacian(q, 0, &region, spacing);
                let w = (1.0 - self.theta) * step.dt * coef;
                Patch::from_scalar_function(lev, region.clone(), |c| base.get(c, 0) + w * lap.get(c, 0))
            }
            None => base.clone(),
        };
        let link = self.theta * step.dt * coef;
        let beta = [
            Patch::constant(lev, 1, region.faces(Axis::I), link),
            Patch::constant(lev, 1, region.faces(Axis::J), link),
        ];
        let initial = q_old.map(|q| q.extract(region.clone()));

        let problem = EllipticProblem {
            centering: Centering::Cell,
            domain: layout.domain().clone(),
            region: region.clone(),
            active: &active,
            sides: self.bc.component_sides(comp),
            beta: [&beta[0], &beta[1]],
            alpha: Some(alpha),
            exterior,
            spacing,
            rhs: &rhs,
            initial: initial.as_ref(),
        };
        let report = checked_solve(self.solver, &problem, operation, step.level, step.time)?;
        Ok(problem.extended_solution(&report.solution))
    }

    /// Time-weighted diffusive fluxes on the valid faces of each patch:
    /// `-coef A (theta grad(q_new) + (1 - theta) grad(q_old))`, or just the
    /// implicit part when there is no old value.
    fn fluxes(&self, step: &LevelStep, coef: f64, q_new: &Patch, q_old: Option<&Patch>) -> Vec<[Patch; 2]> {
        let lev = step.level as u32;
        let theta = if q_old.is_some() { self.theta } else { 1.0 };
        let sync_theta = if q_old.is_some() { 1.0 } else { self.theta };

        step.layout
            .boxes()
            .iter()
            .map(|valid| {
                Axis::BOTH.map(|axis| {
                    let h = step.mesh.spacing(axis);
                    let area = step.mesh.face_area(axis);

                    Patch::from_scalar_function(lev, valid.faces(axis), |f| {
                        let l = shift(f, axis.offset(-1));
                        let grad_new = (q_new.get(f, 0) - q_new.get(l, 0)) / h;
                        let grad_old = q_old.map_or(0.0, |q| (q.get(f, 0) - q.get(l, 0)) / h);
                        -coef * area * sync_theta * (theta * grad_new + (1.0 - theta) * grad_old)
                    })
                })
            })
            .collect()
    }
}
