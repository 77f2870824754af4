use core::ops::Range;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use crate::advection::{self, AdvectionForm, AdvectionProducts};
use crate::boundary::{BcCode, PhysBc};
use crate::config::Config;
use crate::diffusion::{self, Diffusion, DiffusionForm, LevelStep};
use crate::elliptic::EllipticSolver;
use crate::error::{Error, Result};
use crate::godunov::{self, AdvectionScheme, FieldBc, TraceInput, SMALL_VEL};
use crate::index_space::{shift, Axis};
use crate::mesh::Mesh;
use crate::meshing::{fill_guards, CoarseSource, Layout};
use crate::patch::Patch;
use crate::problem::Problem;
use crate::projection::{nodal_divergence, ProjectionController};

/// The number of velocity components.
pub const NUM_VEL: usize = 2;

/// The state component holding the density.
pub const DENSITY: usize = 2;

/// Guard zones around each patch when cell data is ghost filled; enough for
/// the velocity prediction stencil.
pub const NUM_GHOST: i64 = 4;

/// The kinds of cell data a level carries.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StateType {
    /// Velocity, density, and tracers.
    State,
    /// Pressure.
    Press,
    /// The divergence constraint.
    Divu,
    /// Its time derivative.
    Dsdt,
}

/// The steps of a level advance, in order. Each is logged at debug level as
/// it begins.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdvancePhase {
    Setup,
    PredictVelocity,
    MacProject,
    AdvectVelocity,
    AdvectScalars,
    UpdateRho,
    AdvectMomentum,
    ComputeDivU,
    VelocityUpdate,
    LevelProject,
    Cleanup,
}

/// Double-buffered cell data of one kind on a level: data on the valid cells
/// of each box at the old and new times.
///
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StateData {
    pub old: Vec<Patch>,
    pub new: Vec<Patch>,
    pub old_time: f64,
    pub new_time: f64,
}

impl StateData {
    pub fn zeros(layout: &Layout, level: u32, num_fields: usize, time: f64) -> Self {
        let data: Vec<Patch> = layout.boxes().iter().map(|b| Patch::zeros(level, num_fields, b.clone())).collect();
        Self { old: data.clone(), new: data, old_time: time, new_time: time }
    }

    pub fn num_fields(&self) -> usize {
        self.new.first().map_or(0, |p| p.num_fields())
    }

    /// Begin a step of size `dt`: the new data becomes the old data, and the
    /// new data starts out as a copy of it.
    ///
    pub fn swap_time_levels(&mut self, dt: f64) {
        self.old = self.new.clone();
        self.old_time = self.new_time;
        self.new_time = self.old_time + dt;
    }

    /// Set both time stamps, leaving the data alone.
    ///
    pub fn set_time(&mut self, time: f64) {
        self.old_time = time;
        self.new_time = time;
    }

    /// The data at `time`, interpolated linearly between the old and new
    /// data.
    ///
    pub fn at(&self, time: f64) -> Vec<Patch> {
        let span = self.new_time - self.old_time;
        let eps = 1e-12 * self.new_time.abs().max(1.0);

        if span <= eps || (time - self.new_time).abs() <= eps {
            self.new.clone()
        } else if (time - self.old_time).abs() <= eps {
            self.old.clone()
        } else {
            let w = (time - self.old_time) / span;
            self.old
                .iter()
                .zip(&self.new)
                .map(|(a, b)| {
                    let mut out = a.clone();
                    for n in 0..out.num_fields() {
                        out.scale_field(n, 1.0 - w)
                    }
                    out.add_from(b, 0, 0, b.num_fields(), w);
                    out
                })
                .collect()
        }
    }
}

/// What a level advance hands to the flux and sync registers: advective and
/// viscous fluxes of every state component, MAC face fluxes `u A`, all on
/// the valid faces of each box, and the partial nodal divergence of the new
/// velocity on each box (absent on initial steps).
///
#[derive(Clone, Debug)]
pub struct StepReport {
    pub dt_estimate: f64,
    pub adv_fluxes: Vec<[Patch; 2]>,
    pub visc_fluxes: Vec<[Patch; 2]>,
    pub mac_fluxes: Vec<[Patch; 2]>,
    pub sync_residual: Option<Vec<Patch>>,
}

/// The run-wide collaborators of a level advance.
///
#[derive(Clone, Copy)]
pub struct Context<'a> {
    pub config: &'a Config,
    pub scheme: &'a dyn AdvectionScheme,
    pub solver: &'a dyn EllipticSolver,
    pub problem: &'a dyn Problem,
}

/// One refinement level: its layout and geometry, the state types, and the
/// data kept between the level's advance and the coarse-fine sync.
///
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Level {
    pub index: usize,
    pub layout: Layout,
    pub mesh: Mesh,
    pub state: StateData,
    pub press: StateData,
    pub divu: Option<StateData>,
    pub dsdt: Option<StateData>,

    /// Time-centered density, ghost filled.
    pub rho_half: Vec<Patch>,

    /// Density averaged over the subcycles of a fine level.
    pub rho_avg: Vec<Patch>,

    /// Pressure averaged over the subcycles of a fine level.
    pub p_avg: Vec<Patch>,

    /// MAC velocities of the last step, and the edge states of every state
    /// component, on the valid faces.
    pub umac: Vec<[Patch; 2]>,
    pub edge_states: Vec<[Patch; 2]>,

    /// The MAC potential of the last step, for the next finer level.
    pub mac_phi: Option<Patch>,

    /// The velocity (fields `0..NUM_VEL`) and scalar sync corrections.
    pub sync: Vec<Patch>,
}

impl Level {
    pub fn new(index: usize, layout: Layout, mesh: Mesh, config: &Config, time: f64) -> Self {
        let lev = index as u32;
        let nstate = config.num_state();
        let cells = |nf| -> Vec<Patch> { layout.boxes().iter().map(|b| Patch::zeros(lev, nf, b.clone())).collect() };
        let faces = |nf| -> Vec<[Patch; 2]> {
            layout
                .boxes()
                .iter()
                .map(|b| Axis::BOTH.map(|axis| Patch::zeros(lev, nf, b.faces(axis))))
                .collect()
        };

        Self {
            index,
            state: StateData::zeros(&layout, lev, nstate, time),
            press: StateData::zeros(&layout, lev, 1, time),
            divu: config.have_divu.then(|| StateData::zeros(&layout, lev, 1, time)),
            dsdt: config.have_dsdt.then(|| StateData::zeros(&layout, lev, 1, time)),
            rho_half: layout.boxes().iter().map(|b| Patch::constant(lev, 1, b.extend_all(NUM_GHOST), 1.0)).collect(),
            rho_avg: cells(1),
            p_avg: cells(1),
            umac: faces(1),
            edge_states: faces(nstate),
            mac_phi: None,
            sync: cells(nstate),
            layout,
            mesh,
        }
    }

    /// Set the state from the problem's initial conditions at `time`, with
    /// zero pressure.
    ///
    pub fn initialize(&mut self, ctx: &Context, time: f64) {
        let lev = self.index as u32;
        let nstate = ctx.config.num_state();
        let mesh = &self.mesh;

        self.state.new = self
            .layout
            .boxes()
            .par_iter()
            .map(|b| Patch::from_slice_function(lev, b.clone(), nstate, |c, s| ctx.problem.initial_state(mesh.cell_center(c), s)))
            .collect();
        self.state.old = self.state.new.clone();
        self.state.set_time(time);
        self.press.set_time(time);

        if let Some(divu) = &mut self.divu {
            divu.new = self
                .layout
                .boxes()
                .iter()
                .map(|b| Patch::from_scalar_function(lev, b.clone(), |c| ctx.problem.divu(mesh.cell_center(c), time)))
                .collect();
            divu.old = divu.new.clone();
            divu.set_time(time);
        }
        if let Some(dsdt) = &mut self.dsdt {
            dsdt.set_time(time);
        }
        self.rho_avg = self.density(&self.state.new);
    }

    pub fn data(&self, which: StateType) -> Option<&StateData> {
        match which {
            StateType::State => Some(&self.state),
            StateType::Press => Some(&self.press),
            StateType::Divu => self.divu.as_ref(),
            StateType::Dsdt => self.dsdt.as_ref(),
        }
    }

    pub fn data_mut(&mut self, which: StateType) -> Option<&mut StateData> {
        match which {
            StateType::State => Some(&mut self.state),
            StateType::Press => Some(&mut self.press),
            StateType::Divu => self.divu.as_mut(),
            StateType::Dsdt => self.dsdt.as_mut(),
        }
    }

    /// The density of each patch, as one-field patches.
    ///
    pub fn density(&self, state: &[Patch]) -> Vec<Patch> {
        state.iter().map(|p| p.field(DENSITY)).collect()
    }

    /// Grow valid data by `NUM_GHOST` zones and fill them: from the coarse
    /// level where given, from neighbors, then at physical boundaries. When
    /// `first_comp` is given, field `n` is filled as state component
    /// `first_comp + n`; otherwise fields are extrapolated at every
    /// non-periodic side.
    ///
    pub fn fill_patches(
        &self,
        data: &[Patch],
        first_comp: Option<usize>,
        time: f64,
        coarse: Option<(&Layout, &[Patch])>,
        ctx: &Context,
    ) -> Vec<Patch> {
        let grown: Vec<Patch> = self
            .layout
            .boxes()
            .iter()
            .zip(data)
            .map(|(b, p)| {
                let mut g = Patch::zeros(p.level(), p.num_fields(), b.extend_all(NUM_GHOST));
                g.copy_region(p, b, 0, 0, p.num_fields());
                g
            })
            .collect();

        let source = coarse.map(|(layout, patches)| CoarseSource { layout, patches, ratio: ctx.config.ref_ratio });
        let bc = &ctx.config.domain_bc;
        let mesh = &self.mesh;
        let problem = ctx.problem;

        fill_guards(
            &self.layout,
            grown,
            source,
            move |axis, upper, n| match first_comp {
                Some(c) => bc.code(axis, upper, c + n),
                None if bc.side(axis, upper) == PhysBc::Interior => BcCode::Interior,
                None => BcCode::FoExtrap,
            },
            move |index, axis, upper, n| match first_comp {
                Some(c) => problem.boundary_value(mesh.boundary_point(index, axis, upper), axis, upper, c + n, time),
                None => 0.0,
            },
        )
    }

    /// The state at `time`, ghost filled.
    ///
    pub fn fill_state(&self, time: f64, coarse: Option<&Level>, ctx: &Context) -> Vec<Patch> {
        let coarse_data = coarse.map(|c| c.state.at(time));
        let source = coarse.zip(coarse_data.as_deref()).map(|(c, d)| (&c.layout, d));
        self.fill_patches(&self.state.at(time), Some(0), time, source, ctx)
    }

    /// The pressure at `time`, ghost filled.
    ///
    pub fn fill_pressure(&self, time: f64, coarse: Option<&Level>, ctx: &Context) -> Vec<Patch> {
        let coarse_data = coarse.map(|c| c.press.at(time));
        let source = coarse.zip(coarse_data.as_deref()).map(|(c, d)| (&c.layout, d));
        self.fill_patches(&self.press.at(time), None, time, source, ctx)
    }

    /// The largest of `|u| / dx` and `|v| / dy` over the valid cells.
    ///
    pub fn max_velocity_rate(&self, state: &[Patch]) -> f64 {
        let (dx, dy) = self.mesh.cell_spacing();

        self.layout
            .boxes()
            .par_iter()
            .zip(state)
            .map(|(b, p)| (p.max_abs(b, 0) / dx).max(p.max_abs(b, 1) / dy))
            .reduce(|| 0.0, f64::max)
    }

    /// The largest stable time step for the new state: the CFL limit of the
    /// velocity, and of the gravitational acceleration when there is one.
    /// Infinite when nothing moves.
    ///
    pub fn est_time_step(&self, config: &Config) -> f64 {
        let rate = self.max_velocity_rate(&self.state.new);
        let mut dt = if rate > 0.0 { config.cfl / rate } else { f64::INFINITY };

        if config.gravity != 0.0 {
            let (_, dy) = self.mesh.cell_spacing();
            dt = dt.min(config.cfl * (2.0 * dy / config.gravity.abs()).sqrt())
        }
        dt
    }

    /// The step size suggested after a step of size `dt` whose old velocity
    /// reached a Courant number `cfl_achieved`: `dt min(change_max, cfl /
    /// cfl_achieved)`.
    ///
    fn dt_change(&self, config: &Config, dt: f64) -> f64 {
        let cfl_achieved = dt * self.max_velocity_rate(&self.state.old);

        if cfl_achieved > 0.0 {
            dt * config.change_max.min(config.cfl / cfl_achieved)
        } else {
            dt * config.change_max
        }
    }

    fn check_finite(&self, config: &Config, comps: Range<usize>, time: f64) -> Result<()> {
        for comp in comps {
            let bad = self
                .layout
                .boxes()
                .par_iter()
                .zip(&self.state.new)
                .position_any(|(b, p)| p.contains_non_finite(b, comp..comp + 1));

            if let Some(patch) = bad {
                return Err(Error::NonFiniteState {
                    component: config.component_name(comp).to_string(),
                    level: self.index,
                    time,
                    patch,
                })
            }
        }
        Ok(())
    }

    /// Problem body forces on every state component, over the valid cells
    /// grown by two.
    fn body_force(&self, ctx: &Context, state: &[Patch], time: f64) -> Vec<Patch> {
        let nstate = ctx.config.num_state();
        let mesh = &self.mesh;

        self.layout
            .boxes()
            .par_iter()
            .zip(state)
            .map(|(valid, s)| {
                Patch::from_slice_function(s.level(), valid.extend_all(2), nstate, |c, out| {
                    out.iter_mut().for_each(|x| *x = 0.0);
                    ctx.problem.force(mesh.cell_center(c), time, s.get_slice(c), out)
                })
            })
            .collect()
    }

    /// The velocity forcing used for tracing, over the valid cells grown by
    /// two: `(f - grad p + mu L u) / rho + g`, or without the division by
    /// `rho` for momentum.
    fn velocity_forcing(&self, ctx: &Context, state: &[Patch], press: &[Patch], force: &[Patch]) -> Vec<Patch> {
        let cfg = ctx.config;
        let spacing = self.mesh.cell_spacing();

        self.layout
            .boxes()
            .par_iter()
            .zip(state)
            .zip(press)
            .zip(force)
            .map(|(((valid, s), p), f)| {
                let region = valid.extend_all(2);
                let visc = (cfg.visc_coef > 0.0).then(|| {
                    [0, 1].map(|d| diffusion::explicit_term(s, d, cfg.visc_coef, DiffusionForm::Laplacian, &region, spacing))
                });

                Patch::from_slice_function(s.level(), region.clone(), NUM_VEL, |c, out| {
                    let rho = s.get(c, DENSITY);

                    for axis in Axis::BOTH {
                        let d = axis.index();
                        let h = self.mesh.spacing(axis);
                        let gp = (p.get(shift(c, axis.offset(1)), 0) - p.get(shift(c, axis.offset(-1)), 0)) / (2.0 * h);
                        let v = visc.as_ref().map_or(0.0, |v| v[d].get(c, 0));
                        let g = if axis == Axis::J { cfg.gravity } else { 0.0 };

                        out[d] = if cfg.do_mom_diff {
                            f.get(c, d) - gp + v + rho * g
                        } else {
                            (f.get(c, d) - gp + v) / rho + g
                        };
                    }
                })
            })
            .collect()
    }

    /// The scalar forcing used for tracing, over the valid cells grown by
    /// one: the body force, the explicit diffusion term, and for
    /// conservative scalars `-s divu`.
    fn scalar_forcing(&self, ctx: &Context, state: &[Patch], force: &[Patch], divu: Option<&[Patch]>) -> Vec<Patch> {
        let cfg = ctx.config;
        let nstate = cfg.num_state();
        let spacing = self.mesh.cell_spacing();

        self.layout
            .boxes()
            .par_iter()
            .zip(state)
            .zip(force)
            .enumerate()
            .map(|(k, ((valid, s), f))| {
                let region = valid.extend_all(1);
                let visc: Vec<Option<Patch>> = (DENSITY..nstate)
                    .map(|comp| {
                        let scalar = cfg.scalar(comp);
                        (scalar.diffusivity > 0.0)
                            .then(|| diffusion::explicit_term(s, comp, scalar.diffusivity, scalar.diffusion, &region, spacing))
                    })
                    .collect();

                Patch::from_slice_function(s.level(), region.clone(), nstate - DENSITY, |c, out| {
                    let source = divu.map_or(0.0, |d| d[k].get(c, 0));

                    for (n, comp) in (DENSITY..nstate).enumerate() {
                        let v = visc[n].as_ref().map_or(0.0, |v| v.get(c, 0));
                        let compression = match cfg.scalar(comp).advection {
                            AdvectionForm::Conservative => s.get(c, comp) * source,
                            AdvectionForm::NonConservative => 0.0,
                        };
                        out[n] = f.get(c, comp) + v - compression;
                    }
                })
            })
            .collect()
    }

    /// Trace and advect a block of fields of the (ghost-filled) state with
    /// the MAC velocities.
    fn advect_block(
        &self,
        ctx: &Context,
        state: &[Patch],
        fields: Range<usize>,
        forcing: &[Patch],
        forms: &[AdvectionForm],
        bc: &[FieldBc],
        dt: f64,
    ) -> Vec<AdvectionProducts> {
        let cfg = ctx.config;
        let spacing = self.mesh.cell_spacing();

        self.layout
            .boxes()
            .par_iter()
            .zip(state)
            .zip(forcing)
            .zip(&self.umac)
            .map(|(((valid, s), f), u)| {
                let input = TraceInput {
                    valid,
                    face_grow: 0,
                    domain: self.layout.domain(),
                    spacing,
                    dt,
                    state: s.view(fields.clone()),
                    forcing: Some(f.view_all()),
                    transport: [&u[0], &u[1]],
                    bc,
                    corner_couple: cfg.corner_couple,
                    forces_in_trans: cfg.forces_in_trans,
                };
                advection::advect(ctx.scheme, &input, forms, &self.mesh)
            })
            .collect()
    }

    /// Start a step: swap time levels and, on the first subcycle of a fine
    /// level, reset the running density and pressure averages.
    fn advance_setup(&mut self, dt: f64, iteration: usize, ncycle: usize) {
        self.state.swap_time_levels(dt);
        self.press.swap_time_levels(dt);

        for data in [self.divu.as_mut(), self.dsdt.as_mut()].into_iter().flatten() {
            data.swap_time_levels(dt)
        }
        if self.index > 0 && iteration == 1 {
            let w = 0.5 / ncycle as f64;
            self.rho_avg = self.density(&self.state.old);
            self.rho_avg.iter_mut().for_each(|p| p.scale_field(0, w));
            self.p_avg.iter_mut().for_each(|p| p.fill(0.0));
        }
    }

    /// Advance the level from `time` to `time + dt`. `iteration` counts the
    /// subcycles of this level within one step of the next coarser level,
    /// starting at 1, out of `ncycle`. On an initial step (the initial
    /// pressure iterations) the level projection is skipped.
    ///
    /// Returns the fluxes and residuals for the registers, and a suggested
    /// next step size.
    ///
    pub fn advance(
        &mut self,
        ctx: &Context,
        coarse: Option<&Level>,
        time: f64,
        dt: f64,
        iteration: usize,
        ncycle: usize,
        initial_step: bool,
    ) -> Result<StepReport> {
        let cfg = ctx.config;
        let lev = self.index;
        let nstate = cfg.num_state();
        let spacing = self.mesh.cell_spacing();
        let forms = cfg.advection_forms();
        let bc: Vec<FieldBc> = (0..nstate).map(|n| cfg.domain_bc.component(n)).collect();
        let phase = |p: AdvancePhase| log::debug!("level {} at t = {:.6}: {:?}", lev, time, p);

        phase(AdvancePhase::Setup);
        self.advance_setup(dt, iteration, ncycle);
        let dt_estimate = self.dt_change(cfg, dt);

        let old = self.fill_state(time, coarse, ctx);
        let traced: Vec<Patch> = old.iter().map(floor_tiny).collect();
        let press = self.fill_pressure(time, coarse, ctx);
        let force = self.body_force(ctx, &old, time);
        self.rho_half = self.density(&old);

        phase(AdvancePhase::PredictVelocity);
        let vel_force = self.velocity_forcing(ctx, &old, &press, &force);
        let predictor_force: Vec<Patch> = if cfg.do_mom_diff {
            vel_force
                .iter()
                .zip(&old)
                .map(|(f, s)| Patch::from_slice_function(f.level(), f.index_space().clone(), NUM_VEL, |c, out| {
                    for d in 0..NUM_VEL {
                        out[d] = f.get(c, d) / s.get(c, DENSITY)
                    }
                }))
                .collect()
        } else {
            vel_force.clone()
        };
        self.umac = self
            .layout
            .boxes()
            .par_iter()
            .zip(&traced)
            .zip(&predictor_force)
            .map(|((valid, s), f)| {
                godunov::predict_velocity(
                    ctx.scheme,
                    valid,
                    self.layout.domain(),
                    spacing,
                    dt,
                    s.view(0..NUM_VEL),
                    Some(f.view_all()),
                    &bc,
                    cfg.corner_couple,
                    cfg.forces_in_trans,
                )
            })
            .collect();

        phase(AdvancePhase::MacProject);
        let controller = ProjectionController { solver: ctx.solver, bc: &cfg.domain_bc };

        if cfg.do_mac_proj {
            let divu_half = self.divu.as_ref().map(|d| d.at(time + 0.5 * dt));
            let coarse_phi = coarse.and_then(|c| c.mac_phi.as_ref()).map(|p| (p, cfg.ref_ratio));
            let mut umac = std::mem::take(&mut self.umac);
            let phi = controller.mac_project(lev, time, dt, &self.layout, &self.mesh, &mut umac, &self.rho_half, divu_half.as_deref(), coarse_phi);
            self.umac = umac;
            self.mac_phi = Some(phi?);
        }

        let velocity_products = (!cfg.do_mom_diff).then(|| {
            phase(AdvancePhase::AdvectVelocity);
            self.advect_block(ctx, &traced, 0..NUM_VEL, &vel_force, &forms[..NUM_VEL], &bc[..NUM_VEL], dt)
        });

        phase(AdvancePhase::AdvectScalars);
        let coarse_divu = coarse.and_then(|c| c.divu.as_ref()).map(|d| d.at(time));
        let divu_source = coarse.zip(coarse_divu.as_deref()).map(|(c, d)| (&c.layout, d));
        let divu_old = self.divu.as_ref().map(|d| self.fill_patches(&d.old, None, time, divu_source, ctx));
        let scalar_force = self.scalar_forcing(ctx, &old, &force, divu_old.as_deref());
        let scalar_products = self.advect_block(ctx, &traced, DENSITY..nstate, &scalar_force, &forms[DENSITY..], &bc[DENSITY..], dt);

        phase(AdvancePhase::UpdateRho);
        let step = LevelStep { level: lev, time, dt, layout: &self.layout, mesh: &self.mesh };
        let diffusion = Diffusion { solver: ctx.solver, bc: &cfg.domain_bc, theta: cfg.be_cn_theta };
        let mut new = std::mem::take(&mut self.state.new);
        let mut visc_fluxes: Vec<[Patch; 2]> = self
            .layout
            .boxes()
            .iter()
            .map(|b| Axis::BOTH.map(|axis| Patch::zeros(lev as u32, nstate, b.faces(axis))))
            .collect();

        for comp in cfg.scalar_order() {
            let n = comp - DENSITY;

            new.par_iter_mut()
                .zip(self.layout.boxes())
                .zip(&old)
                .zip(&scalar_products)
                .zip(&force)
                .for_each(|((((s_new, valid), s_old), products), f)| {
                    for c in valid.iter() {
                        *s_new.get_mut(c, comp) = s_old.get(c, comp) - dt * products.aofs.get(c, n) + dt * f.get(c, comp)
                    }
                });

            let scalar = cfg.scalar(comp);
            if scalar.diffusivity > 0.0 {
                let fluxes = diffusion.diffuse_scalar(&step, comp, scalar.diffusivity, scalar.diffusion, &old, &mut new)?;
                accumulate_field(&mut visc_fluxes, &fluxes, comp);
            }
            self.state.new = new;
            self.check_finite(cfg, comp..comp + 1, time + dt)?;
            new = std::mem::take(&mut self.state.new);

            if comp == DENSITY {
                let half: Vec<Patch> = old
                    .iter()
                    .zip(&new)
                    .zip(self.layout.boxes())
                    .map(|((o, s), b)| Patch::from_scalar_function(lev as u32, b.clone(), |c| 0.5 * (o.get(c, DENSITY) + s.get(c, DENSITY))))
                    .collect();
                let coarse_rho = coarse.map(|c| (&c.layout, &c.rho_half[..]));
                self.rho_half = self.fill_patches(&half, Some(DENSITY), time + 0.5 * dt, coarse_rho, ctx);

                if lev > 0 {
                    let w = if iteration == ncycle { 0.5 } else { 1.0 } / ncycle as f64;
                    for (avg, s) in self.rho_avg.iter_mut().zip(&new) {
                        avg.add_from(s, DENSITY, 0, 1, w)
                    }
                }
            }
        }

        let (velocity_products, momentum) = match velocity_products {
            Some(products) => (products, false),
            None => {
                phase(AdvancePhase::AdvectMomentum);
                let traced_momentum: Vec<Patch> = traced
                    .iter()
                    .map(|s| Patch::from_slice_function(s.level(), s.index_space().clone(), NUM_VEL, |c, out| {
                        for d in 0..NUM_VEL {
                            out[d] = s.get(c, d) * s.get(c, DENSITY)
                        }
                    }))
                    .collect();
                let products = self.advect_block(ctx, &traced_momentum, 0..NUM_VEL, &vel_force, &forms[..NUM_VEL], &bc[..NUM_VEL], dt);
                (products, true)
            }
        };

        if let (Some(divu), true) = (self.divu.as_mut(), cfg.have_divu) {
            phase(AdvancePhase::ComputeDivU);
            let mesh = &self.mesh;
            let t = time + dt;
            divu.new = self
                .layout
                .boxes()
                .iter()
                .map(|b| Patch::from_scalar_function(lev as u32, b.clone(), |c| ctx.problem.divu(mesh.cell_center(c), t)))
                .collect();

            if let Some(dsdt) = self.dsdt.as_mut() {
                dsdt.new = divu
                    .new
                    .iter()
                    .zip(&divu.old)
                    .map(|(a, b)| {
                        let mut d = a.clone();
                        d.add_from(b, 0, 0, 1, -1.0);
                        d.scale_field(0, 1.0 / dt);
                        d
                    })
                    .collect();
            }
        }

        phase(AdvancePhase::VelocityUpdate);
        let rho_half = &self.rho_half;

        new.par_iter_mut()
            .zip(self.layout.boxes())
            .zip(&old)
            .zip(&velocity_products)
            .zip(&force)
            .zip(&press)
            .zip(rho_half)
            .for_each(|((((((s_new, valid), s_old), products), f), p), rh)| {
                for c in valid.iter() {
                    for axis in Axis::BOTH {
                        let d = axis.index();
                        let h = self.mesh.spacing(axis);
                        let gp = (p.get(shift(c, axis.offset(1)), 0) - p.get(shift(c, axis.offset(-1)), 0)) / (2.0 * h);
                        let g = if axis == Axis::J { cfg.gravity } else { 0.0 };

                        let value = if momentum {
                            let rho_old = s_old.get(c, DENSITY);
                            let m = rho_old * s_old.get(c, d) - dt * products.aofs.get(c, d)
                                + dt * (f.get(c, d) - gp + rh.get(c, 0) * g);
                            m / s_new.get(c, DENSITY)
                        } else {
                            s_old.get(c, d) - dt * products.aofs.get(c, d) + dt * ((f.get(c, d) - gp) / rh.get(c, 0) + g)
                        };
                        *s_new.get_mut(c, d) = value;
                    }
                }
            });

        if cfg.visc_coef > 0.0 {
            let rho_visc: Vec<Patch> = if momentum { self.density(&new) } else { self.rho_half.clone() };

            for d in 0..NUM_VEL {
                let fluxes = diffusion.diffuse_velocity(&step, d, cfg.visc_coef, &old, &mut new, &rho_visc)?;
                accumulate_field(&mut visc_fluxes, &fluxes, d);
            }
        }
        self.state.new = new;
        self.check_finite(cfg, 0..NUM_VEL, time + dt)?;

        let sync_residual = if initial_step {
            None
        } else {
            phase(AdvancePhase::LevelProject);
            let t = time + dt;
            let coarse_new = coarse.map(|c| c.state.at(t));
            let source = coarse.zip(coarse_new.as_deref()).map(|(c, d)| (&c.layout, d));
            let velocity = self.fill_patches(&self.state.new, Some(0), t, source, ctx);
            let divu_new = self.divu.as_ref().map(|d| d.new.clone());

            let projection = controller.level_project(lev, t, dt, &self.layout, &self.mesh, &velocity, &self.rho_half, divu_new.as_deref())?;

            for ((s, correction), (p, phi)) in self
                .state
                .new
                .iter_mut()
                .zip(&projection.correction)
                .zip(self.press.new.iter_mut().zip(&projection.phi))
            {
                s.add_from(correction, 0, 0, NUM_VEL, -1.0);
                p.add_from(phi, 0, 0, 1, 1.0);
            }

            Some(
                self.layout
                    .boxes()
                    .par_iter()
                    .zip(&self.state.new)
                    .map(|(valid, s)| nodal_divergence(s, &valid.nodes(), spacing, Some(valid)))
                    .collect(),
            )
        };

        if lev > 0 {
            for (avg, p) in self.p_avg.iter_mut().zip(&self.press.new) {
                avg.add_from(p, 0, 0, 1, 1.0 / ncycle as f64)
            }
        }

        phase(AdvancePhase::Cleanup);
        let adv_fluxes = velocity_products
            .iter()
            .zip(&scalar_products)
            .map(|(v, s)| [0, 1].map(|d| concat_fields(&v.fluxes[d], &s.fluxes[d])))
            .collect();
        self.edge_states = velocity_products
            .iter()
            .zip(&scalar_products)
            .map(|(v, s)| [0, 1].map(|d| concat_fields(&v.edge_states[d], &s.edge_states[d])))
            .collect();
        self.umac = self
            .layout
            .boxes()
            .iter()
            .zip(&self.umac)
            .map(|(valid, u)| Axis::BOTH.map(|axis| u[axis.index()].extract(valid.faces(axis))))
            .collect();
        let mac_fluxes = self
            .umac
            .iter()
            .map(|u| Axis::BOTH.map(|axis| {
                let mut flux = u[axis.index()].clone();
                flux.scale_field(0, self.mesh.face_area(axis));
                flux
            }))
            .collect();

        log::info!("level {} advanced from t = {:.6} to {:.6} (dt = {:.3e})", lev, time, time + dt, dt);

        Ok(StepReport {
            dt_estimate,
            adv_fluxes,
            visc_fluxes,
            mac_fluxes,
            sync_residual,
        })
    }
}

/// A copy of a patch with values smaller in magnitude than `SMALL_VEL` set
/// to zero.
fn floor_tiny(patch: &Patch) -> Patch {
    let mut p = patch.clone();
    for s in p.iter_data_mut() {
        for x in s.iter_mut() {
            if x.abs() < SMALL_VEL {
                *x = 0.0
            }
        }
    }
    p
}

/// Join the fields of two patches over the first one's index space.
fn concat_fields(a: &Patch, b: &Patch) -> Patch {
    let na = a.num_fields();
    let nb = b.num_fields();

    Patch::from_slice_function(a.level(), a.index_space().clone(), na + nb, |c, out| {
        out[..na].copy_from_slice(a.get_slice(c));
        out[na..].copy_from_slice(b.get_slice(c));
    })
}

/// Copy one-field face data into field `comp` of per-box face patches.
fn accumulate_field(target: &mut [[Patch; 2]], source: &[[Patch; 2]], comp: usize) {
    for (t, s) in target.iter_mut().zip(source) {
        for d in 0..2 {
            t[d].copy_from(&s[d], 0, comp, 1, (0, 0))
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::ScalarConfig;
    use crate::elliptic::ConjugateGradient;
    use crate::godunov::SchemeKind;
    use crate::index_space::range2d;
    use crate::problem::{TaylorGreen, UniformFlow};
    use crate::projection::averaged_divergence;

    fn two_box_level(n: i64, config: &Config) -> Level {
        let domain = range2d(0..n, 0..n);
        let layout = Layout::new(domain, vec![range2d(0..n / 2, 0..n), range2d(n / 2..n, 0..n)], [true, true]);
        let mesh = Mesh::new((0.0..1.0, 0.0..1.0), (n, n));
        Level::new(0, layout, mesh, config, 0.0)
    }

    fn single_box_level(n: i64, config: &Config) -> Level {
        let domain = range2d(0..n, 0..n);
        let layout = Layout::new(domain.clone(), vec![domain], [true, true]);
        let mesh = Mesh::new((0.0..1.0, 0.0..1.0), (n, n));
        Level::new(0, layout, mesh, config, 0.0)
    }

    fn context<'a>(config: &'a Config, scheme: &'a dyn AdvectionScheme, solver: &'a ConjugateGradient, problem: &'a dyn Problem) -> Context<'a> {
        Context { config, scheme, solver, problem }
    }

    #[test]
    fn time_step_estimate_is_bounded_by_the_cfl_condition() {
        let config = Config::default();
        let scheme = SchemeKind::default().build();
        let solver = ConjugateGradient::default();
        let problem = UniformFlow { velocity: (2.0, -1.0), density: 1.0 };
        let ctx = context(&config, scheme.as_ref(), &solver, &problem);

        let mut level = two_box_level(16, &config);
        level.initialize(&ctx, 0.0);
        let dt = level.est_time_step(&config);
        assert!((dt - 0.5 / 16.0 / 2.0).abs() < 1e-14);

        let still = UniformFlow { velocity: (0.0, 0.0), density: 1.0 };
        level.initialize(&context(&config, scheme.as_ref(), &solver, &still), 0.0);
        assert!(level.est_time_step(&config).is_infinite());
        assert_eq!(level.dt_change(&config, 0.1), 0.1 * config.change_max);
    }

    #[test]
    fn step_size_returned_by_advance_respects_the_cfl_condition() {
        let config = Config::default();
        let scheme = config.scheme.build();
        let solver = ConjugateGradient::default();
        let problem = UniformFlow { velocity: (2.0, -1.0), density: 1.0 };
        let ctx = context(&config, scheme.as_ref(), &solver, &problem);

        for fraction in [0.5, 1.0, 1.5] {
            let mut level = two_box_level(16, &config);
            level.initialize(&ctx, 0.0);
            let rate = level.max_velocity_rate(&level.state.new);
            let dt = fraction * level.est_time_step(&config);

            let report = level.advance(&ctx, None, 0.0, dt, 1, 1, false).unwrap();
            assert!(rate > 0.0);
            assert!(report.dt_estimate * rate <= config.cfl * (1.0 + 1e-12));
            assert!(report.dt_estimate <= dt * config.change_max * (1.0 + 1e-12));
        }
    }

    #[test]
    fn uniform_flow_stays_uniform_and_conserves_tracer_mass() {
        let config = Config {
            scalars: vec![ScalarConfig::density(), ScalarConfig { advection: AdvectionForm::Conservative, ..ScalarConfig::tracer("ink") }],
            ..Config::default()
        };
        let scheme = config.scheme.build();
        let solver = ConjugateGradient::default();
        let problem = UniformFlow { velocity: (1.0, 0.5), density: 1.0 };
        let ctx = context(&config, scheme.as_ref(), &solver, &problem);

        let mut level = two_box_level(16, &config);
        level.initialize(&ctx, 0.0);
        for (b, p) in level.layout.boxes().iter().zip(level.state.new.iter_mut()) {
            for (i, j) in b.iter() {
                *p.get_mut((i, j), 3) = if (4..8).contains(&i) && (4..8).contains(&j) { 1.0 } else { 0.0 }
            }
        }
        let mass = |level: &Level| -> f64 { level.layout.boxes().iter().zip(&level.state.new).map(|(b, p)| p.sum(b, 3)).sum() };
        let before = mass(&level);

        let dt = level.est_time_step(&config);
        let report = level.advance(&ctx, None, 0.0, dt, 1, 1, false).unwrap();

        for (b, p) in level.layout.boxes().iter().zip(&level.state.new) {
            for c in b.iter() {
                assert!((p.get(c, 0) - 1.0).abs() < 1e-9);
                assert!((p.get(c, 1) - 0.5).abs() < 1e-9);
                assert!((p.get(c, DENSITY) - 1.0).abs() < 1e-9);
            }
        }
        assert!((mass(&level) - before).abs() < 1e-10);
        assert!(report.dt_estimate > 0.0);
        let residual = report.sync_residual.unwrap();
        let total: f64 = residual.iter().map(|r| r.sum(&r.index_space().clone(), 0)).sum();
        assert!(total.abs() < 1e-8);
        assert!(residual[0].get((4, 8), 0).abs() < 1e-9);
        assert_eq!(level.state.new_time, dt);
    }

    #[test]
    fn taylor_green_step_keeps_density_and_builds_pressure() {
        let config = Config::default();
        let scheme = config.scheme.build();
        let solver = ConjugateGradient::default();
        let problem = TaylorGreen { amplitude: 1.0, density: 1.0 };
        let ctx = context(&config, scheme.as_ref(), &solver, &problem);

        // one step on a single box; returns the largest cell divergence
        let step = |n: i64| -> f64 {
            let mut level = single_box_level(n, &config);
            level.initialize(&ctx, 0.0);
            let dt = level.est_time_step(&config);
            level.advance(&ctx, None, 0.0, dt, 1, 1, false).unwrap();

            let spacing = level.mesh.cell_spacing();
            let velocity = level.fill_state(dt, None, &ctx);
            let mut pressure = 0.0f64;
            let mut divergence = 0.0f64;

            for c in level.layout.boxes()[0].iter() {
                assert!((level.state.new[0].get(c, DENSITY) - 1.0).abs() < 1e-8);
                pressure = pressure.max(level.press.new[0].get(c, 0).abs());
                divergence = divergence.max(averaged_divergence(&velocity[0], c, spacing).abs());
            }
            assert!(pressure > 0.0);
            divergence
        };

        // the level projection is approximate: the cell divergence is first
        // order in the mesh spacing rather than zero
        let coarse = step(32);
        let fine = step(64);
        assert!(coarse < 0.1);
        assert!(fine < 0.75 * coarse);
    }

    #[test]
    fn initial_steps_skip_the_level_projection() {
        let config = Config::default();
        let scheme = config.scheme.build();
        let solver = ConjugateGradient::default();
        let problem = TaylorGreen { amplitude: 1.0, density: 1.0 };
        let ctx = context(&config, scheme.as_ref(), &solver, &problem);

        let mut level = two_box_level(16, &config);
        level.initialize(&ctx, 0.0);
        let report = level.advance(&ctx, None, 0.0, 0.01, 1, 1, true).unwrap();

        assert!(report.sync_residual.is_none());
        assert!(level.press.new.iter().all(|p| p.iter_data().all(|s| s[0] == 0.0)));
    }

    #[test]
    fn non_finite_state_is_reported_with_its_component() {
        let config = Config::default();
        let scheme = config.scheme.build();
        let solver = ConjugateGradient::default();
        let problem = UniformFlow { velocity: (1.0, 0.0), density: 1.0 };
        let ctx = context(&config, scheme.as_ref(), &solver, &problem);

        let mut level = two_box_level(8, &config);
        level.initialize(&ctx, 0.0);
        *level.state.new[1].get_mut((5, 5), 3) = f64::NAN;

        match level.advance(&ctx, None, 0.0, 0.01, 1, 1, false) {
            Err(Error::NonFiniteState { component, level: 0, .. }) => assert_eq!(component, "tracer"),
            other => panic!("expected a non-finite state error, got {:?}", other.map(|r| r.dt_estimate)),
        }
    }
}
