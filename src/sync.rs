use rayon::prelude::*;
use crate::advection::{self, AdvectionForm};
use crate::diffusion::{Diffusion, DiffusionForm, LevelStep, SyncWeight};
use crate::error::Result;
use crate::flux_register::FluxRegister;
use crate::level::{Context, Level, StateType, StepReport, DENSITY, NUM_VEL};
use crate::meshing::{Layout, PatchQuery};
use crate::patch::Patch;
use crate::projection::{nodal_divergence, ProjectionController};
use crate::sync_register::SyncRegister;




/**
 * The registers between a level and the next finer one, owned by the finer
 * level: advective and viscous flux registers over every state component,
 * a one-field register of MAC face fluxes, and the nodal sync register.
 */
#[derive(Clone, Debug)]
pub struct CoarseFineRegisters {
    pub adv: FluxRegister,
    pub visc: FluxRegister,
    pub mac: FluxRegister,
    pub sync: SyncRegister,
}




// ============================================================================
impl CoarseFineRegisters {


    pub fn new(fine: &Layout, ratio: i64, num_state: usize, coarse_level: u32) -> Self {
        Self {
            adv: FluxRegister::new(fine, ratio, num_state, coarse_level),
            visc: FluxRegister::new(fine, ratio, num_state, coarse_level),
            mac: FluxRegister::new(fine, ratio, 1, coarse_level),
            sync: SyncRegister::new(fine, ratio, coarse_level),
        }
    }


    /**
     * Empty every register, at the start of a coarse step.
     */
    pub fn clear(&mut self) {
        self.adv.clear();
        self.visc.clear();
        self.mac.clear();
        self.sync.clear();
    }


    /**
     * Record the coarse level's step of size `dt`: its fluxes enter with
     * weight `-dt`. If the step ended with a level projection, the nodal
     * divergence of the new coarse velocity, counting only cells outside
     * the fine level, starts the sync register.
     */
    pub fn crse_init(&mut self, coarse: &Level, fine: &Layout, report: &StepReport, dt: f64) {
        self.adv.crse_init(&coarse.layout, &report.adv_fluxes, 0, -dt);
        self.visc.crse_init(&coarse.layout, &report.visc_fluxes, 0, -dt);
        self.mac.crse_init(&coarse.layout, &report.mac_fluxes, 0, -dt);

        if report.sync_residual.is_some() {
            let covered = fine.coarsened_boxes(self.adv.ratio());
            let spacing = coarse.mesh.cell_spacing();

            let residual: Vec<Patch> = coarse
                .layout
                .boxes()
                .par_iter()
                .zip(&coarse.state.new)
                .map(|(valid, state)| {
                    let mut velocity = state.clone();
                    for b in &covered {
                        if let Some(overlap) = b.intersect(valid) {
                            velocity.fill_region(&overlap, 0..NUM_VEL, 0.0)
                        }
                    }
                    nodal_divergence(&velocity, &valid.nodes(), spacing, Some(valid))
                })
                .collect();
            self.sync.crse_init(&residual, 1.0)
        }
    }


    /**
     * Record one subcycle of size `dt` of the fine level. The nodal residual
     * is only recorded on the last subcycle, when the fine level has caught
     * up with the coarse one. If the fine level is itself refined, `finer`
     * gives its layout and the boxes of the next finer level.
     */
    pub fn fine_add(&mut self, report: &StepReport, dt: f64, last_subcycle: bool, finer: Option<(&Layout, &Layout)>) {
        self.adv.fine_add(&report.adv_fluxes, 0, dt);
        self.visc.fine_add(&report.visc_fluxes, 0, dt);
        self.mac.fine_add(&report.mac_fluxes, 0, dt);

        if let (true, Some(residual)) = (last_subcycle, &report.sync_residual) {
            let mult = 1.0 / self.sync.ratio() as f64;

            match finer {
                Some((fine_layout, finer_layout)) => {
                    self.sync.comp_add(residual.clone(), finer_layout.boxes(), fine_layout, mult)
                }
                None => self.sync.fine_add(residual, mult),
            }
        }
    }
}




/**
 * Reconciles a coarse level with the finer levels above it once they have
 * caught up in time. The hierarchy runs, for each coarse level from the
 * finest down: `reflux`, `avg_down`, `mac_sync`, then `level_sync`.
 *
 * The sync corrections accumulate in `Level::sync`: fields `0..NUM_VEL` hold
 * the velocity sync rate `Vsync`, and the remaining fields the scalar sync
 * `Ssync`, a rate until `mac_sync` turns it into an increment.
 */
pub struct SyncCorrector<'a> {
    pub ctx: Context<'a>,
}




// ============================================================================
impl<'a> SyncCorrector<'a> {


    /**
     * Apply the viscous and advective flux registers to the coarse sync
     * corrections with scale `1 / dt`, then zero the corrections in cells
     * covered by the finer level. When velocity (not momentum) is advected,
     * the velocity corrections and those of non-conservative scalars are
     * divided by the time-centered density between the two registers.
     */
    pub fn reflux(&self, coarse: &mut Level, fine_layout: &Layout, registers: &CoarseFineRegisters, dt: f64) {
        let cfg = self.ctx.config;
        let nstate = cfg.num_state();
        let volume = coarse.mesh.cell_volume();
        let scale = 1.0 / dt;

        registers.visc.reflux(&coarse.layout, &mut coarse.sync, 0, 0, nstate, scale, volume);

        let divided: Vec<usize> = (0..nstate)
            .filter(|&comp| match comp {
                c if c < NUM_VEL => !cfg.do_mom_diff,
                c => cfg.scalar(c).advection == AdvectionForm::NonConservative,
            })
            .collect();

        coarse
            .sync
            .par_iter_mut()
            .zip(coarse.layout.boxes())
            .zip(&coarse.rho_half)
            .for_each(|((sync, valid), rho)| {
                for c in valid.iter() {
                    for &comp in &divided {
                        *sync.get_mut(c, comp) /= rho.get(c, 0)
                    }
                }
            });

        registers.adv.reflux(&coarse.layout, &mut coarse.sync, 0, 0, nstate, scale, volume);

        let covered = fine_layout.coarsened_boxes(cfg.ref_ratio);

        coarse.sync.par_iter_mut().for_each(|sync| {
            for b in &covered {
                if let Some(overlap) = b.intersect(sync.index_space()) {
                    sync.fill_region(&overlap, 0..nstate, 0.0)
                }
            }
        });
    }


    /**
     * Replace the new-time data of coarse cells covered by the fine level
     * with volume averages of the fine data: the state, divu and dsdt, and
     * the pressure (the fine level's time average over its subcycles, or
     * its new pressure during the initial iterations).
     */
    pub fn avg_down(&self, coarse: &mut Level, fine: &Level, initial_step: bool) {
        let r = self.ctx.config.ref_ratio;
        let fine_press = if initial_step { &fine.press.new } else { &fine.p_avg };

        average_onto(&mut coarse.state.new, &fine.state.new, r);
        average_onto(&mut coarse.press.new, fine_press, r);

        for which in [StateType::Divu, StateType::Dsdt] {
            if let (Some(c), Some(f)) = (coarse.data_mut(which), fine.data(which)) {
                average_onto(&mut c.new, &f.new, r)
            }
        }
    }


    /**
     * Correct the coarse level for the mismatch between its MAC velocities
     * and the averaged fine ones. The refluxed MAC register gives the
     * divergence the coarse face velocities lack; a MAC sync solve yields a
     * correction velocity, whose advective tendencies on the saved edge
     * states are added to the sync corrections. The scalar sync is then
     * made an increment, diffused where the scalars diffuse, added to the
     * new state, and interpolated to every finer level.
     *
     * For conservative scalars other than the density, the part of the
     * sync due to the density sync, `(Ssync_rho / rho) S`, is taken out
     * before the diffusive sync and put back after it.
     *
     * `finer` holds the levels above the coarse one, nearest first.
     * `parent` holds the registers between the coarse level and the level
     * below it, if there is one; the sync fluxes are recorded there.
     */
    pub fn mac_sync(
        &self,
        coarse: &mut Level,
        finer: &mut [Level],
        registers: &CoarseFineRegisters,
        parent: Option<&mut CoarseFineRegisters>,
        time: f64,
        dt: f64,
    ) -> Result<()> {
        let ctx = &self.ctx;
        let cfg = ctx.config;
        let lev = coarse.index;
        let nstate = cfg.num_state();
        let forms = cfg.advection_forms();
        let volume = coarse.mesh.cell_volume();

        let mut mismatch: Vec<Patch> = coarse
            .layout
            .boxes()
            .iter()
            .map(|b| Patch::zeros(lev as u32, 1, b.clone()))
            .collect();
        registers.mac.reflux(&coarse.layout, &mut mismatch, 0, 0, 1, 1.0 / dt, volume);

        let controller = ProjectionController { solver: ctx.solver, bc: &cfg.domain_bc };
        let ucorr = controller.mac_sync_solve(lev, time, dt, &coarse.layout, &coarse.mesh, &mismatch, &coarse.rho_half)?;

        let products: Vec<(Patch, [Patch; 2])> = coarse
            .layout
            .boxes()
            .par_iter()
            .zip(&ucorr)
            .zip(&coarse.edge_states)
            .map(|((valid, u), edge)| advection::sync_advect([&u[0], &u[1]], edge, &forms, valid, &coarse.mesh))
            .collect();

        for (sync, (tendency, _)) in coarse.sync.iter_mut().zip(&products) {
            sync.add_from(tendency, 0, 0, nstate, 1.0)
        }

        let mut parent = parent;

        if let Some(parent) = parent.as_deref_mut() {
            let fluxes: Vec<[Patch; 2]> = products.into_iter().map(|(_, fluxes)| fluxes).collect();
            parent.adv.fine_add(&fluxes, 0, dt)
        }

        for sync in coarse.sync.iter_mut() {
            for comp in DENSITY..nstate {
                sync.scale_field(comp, dt)
            }
        }

        let conserved: Vec<usize> = (DENSITY + 1..nstate)
            .filter(|&comp| forms[comp] == AdvectionForm::Conservative)
            .collect();
        let delta = density_sync_share(coarse, &conserved);

        for (sync, d) in coarse.sync.iter_mut().zip(&delta) {
            for (n, &comp) in conserved.iter().enumerate() {
                sync.add_from(d, n, comp, 1, -1.0)
            }
        }

        if cfg.do_mom_diff {
            let rho_new = coarse.density(&coarse.state.new);

            for ((sync, rho), valid) in coarse.sync.iter_mut().zip(&rho_new).zip(coarse.layout.boxes()) {
                for c in valid.iter() {
                    for d in 0..NUM_VEL {
                        *sync.get_mut(c, d) /= rho.get(c, 0)
                    }
                }
            }
        }

        let step = LevelStep { level: lev, time, dt, layout: &coarse.layout, mesh: &coarse.mesh };
        let diffusion = Diffusion { solver: ctx.solver, bc: &cfg.domain_bc, theta: cfg.be_cn_theta };

        if cfg.visc_coef > 0.0 {
            let rho = if cfg.do_mom_diff { coarse.density(&coarse.state.new) } else { coarse.rho_half.clone() };

            for d in 0..NUM_VEL {
                diffusion.diffuse_sync(&step, &mut coarse.sync, d, d, cfg.visc_coef, SyncWeight::Momentum(&rho))?;
            }
        }

        let rho_new = coarse.density(&coarse.state.new);

        for comp in DENSITY + 1..nstate {
            let scalar = cfg.scalar(comp);

            if scalar.diffusivity > 0.0 {
                let weight = match scalar.diffusion {
                    DiffusionForm::Laplacian => SyncWeight::Plain,
                    DiffusionForm::LaplacianOverRho => SyncWeight::OverRho(&rho_new),
                };
                let fluxes = diffusion.diffuse_sync(&step, &mut coarse.sync, comp, comp, scalar.diffusivity, weight)?;

                if let Some(parent) = parent.as_deref_mut() {
                    parent.visc.fine_add(&fluxes, comp, dt)
                }
            }
        }

        for (sync, d) in coarse.sync.iter_mut().zip(&delta) {
            for (n, &comp) in conserved.iter().enumerate() {
                sync.add_from(d, n, comp, 1, 1.0)
            }
        }

        for (state, sync) in coarse.state.new.iter_mut().zip(&coarse.sync) {
            state.add_from(sync, DENSITY, DENSITY, nstate - DENSITY, 1.0)
        }
        if lev > 0 {
            for (avg, sync) in coarse.rho_avg.iter_mut().zip(&coarse.sync) {
                avg.add_from(sync, DENSITY, 0, 1, 1.0)
            }
        }

        let mut ratio = 1;

        for fine in finer.iter_mut() {
            ratio *= cfg.ref_ratio;
            let increment = interpolate(&coarse.sync, DENSITY..nstate, &fine.layout, ratio);

            for ((state, avg), inc) in fine.state.new.iter_mut().zip(fine.rho_avg.iter_mut()).zip(&increment) {
                state.add_from(inc, 0, DENSITY, nstate - DENSITY, 1.0);
                avg.add_from(inc, 0, 0, 1, 1.0);
            }
        }

        log::debug!("level {} MAC sync: mismatch {:.3e}", lev, max_abs(&coarse.layout, &mismatch));
        Ok(())
    }


    /**
     * Project the velocity sync `dt Vsync`, together with the coarse-fine
     * divergence mismatch collected by the sync register, and add the
     * projected correction to the new velocity of the coarse level and
     * (interpolated) every finer level, and the potential to their
     * pressure.
     */
    pub fn level_sync(
        &self,
        coarse: &mut Level,
        finer: &mut [Level],
        registers: &CoarseFineRegisters,
        time: f64,
        dt: f64,
    ) -> Result<()> {
        let ctx = &self.ctx;
        let cfg = ctx.config;
        let lev = coarse.index;

        let rhs = registers.sync.init_rhs(&cfg.domain_bc, lev as u32);
        let controller = ProjectionController { solver: ctx.solver, bc: &cfg.domain_bc };
        let projection = controller.sync_project(lev, time, dt, &coarse.layout, &coarse.mesh, &coarse.sync, &coarse.rho_half, &rhs)?;

        for ((state, press), (inc, phi)) in coarse
            .state
            .new
            .iter_mut()
            .zip(coarse.press.new.iter_mut())
            .zip(projection.increment.iter().zip(&projection.phi))
        {
            state.add_from(inc, 0, 0, NUM_VEL, 1.0);
            press.add_from(phi, 0, 0, 1, 1.0);
        }

        let mut ratio = 1;

        for fine in finer.iter_mut() {
            ratio *= cfg.ref_ratio;
            let increment = interpolate(&projection.increment, 0..NUM_VEL, &fine.layout, ratio);
            let phi = interpolate(&projection.phi, 0..1, &fine.layout, ratio);

            for ((state, press), (inc, p)) in fine
                .state
                .new
                .iter_mut()
                .zip(fine.press.new.iter_mut())
                .zip(increment.iter().zip(&phi))
            {
                state.add_from(inc, 0, 0, NUM_VEL, 1.0);
                press.add_from(p, 0, 0, 1, 1.0);
            }
        }

        log::debug!("level {} sync projection: velocity increment {:.3e}", lev, max_abs(&coarse.layout, &projection.increment));
        Ok(())
    }
}




/**
 * For each coarse patch, the share `(Ssync_rho / rho) S` of the sync of the
 * given conservative scalars which is due to the density sync, one field
 * per scalar. Empty when there are no such scalars.
 */
fn density_sync_share(level: &Level, conserved: &[usize]) -> Vec<Patch> {
    if conserved.is_empty() {
        return Vec::new()
    }
    level
        .layout
        .boxes()
        .par_iter()
        .zip(&level.state.new)
        .zip(&level.sync)
        .map(|((valid, state), sync)| {
            Patch::from_slice_function(state.level(), valid.clone(), conserved.len(), |c, out| {
                let rho_sync = sync.get(c, DENSITY);
                let rho = state.get(c, DENSITY);

                for (x, &comp) in out.iter_mut().zip(conserved) {
                    *x = rho_sync * state.get(c, comp) / rho
                }
            })
        })
        .collect()
}




/**
 * Overwrite the coarse data under each fine patch with fine-cell averages.
 */
fn average_onto(coarse: &mut [Patch], fine: &[Patch], ratio: i64) {
    let averages: Vec<Patch> = fine.par_iter().map(|p| p.coarsen_average(ratio)).collect();

    coarse.par_iter_mut().for_each(|target| {
        for avg in &averages {
            let n = avg.num_fields().min(target.num_fields());
            target.copy_region(avg, &avg.index_space().clone(), 0, 0, n)
        }
    });
}




/**
 * Piecewise constant interpolation of fields of coarse data, given on the
 * valid cells of the coarse boxes, onto the valid cells of a finer level
 * refined by `ratio`.
 */
pub fn interpolate(coarse: &[Patch], fields: core::ops::Range<usize>, fine: &Layout, ratio: i64) -> Vec<Patch> {
    let count = fields.len();

    fine.boxes()
        .par_iter()
        .map(|valid| {
            Patch::from_slice_function(coarse[0].level() + 1, valid.clone(), count, |(i, j), out| {
                let c = (i.div_euclid(ratio), j.div_euclid(ratio));

                if let Some(source) = coarse.patch_containing_point(c) {
                    for (n, x) in out.iter_mut().enumerate() {
                        *x = source.get(c, fields.start + n)
                    }
                }
            })
        })
        .collect()
}




fn max_abs(layout: &Layout, patches: &[Patch]) -> f64 {
    layout
        .boxes()
        .iter()
        .zip(patches)
        .map(|(b, p)| (0..p.num_fields()).map(|n| p.max_abs(b, n)).fold(0.0, f64::max))
        .fold(0.0, f64::max)
}




// ============================================================================
#[cfg(test)]
mod test {

    use super::*;
    use crate::config::{Config, ScalarConfig};
    use crate::elliptic::ConjugateGradient;
    use crate::godunov::AdvectionScheme;
    use crate::index_space::{range2d, Axis};
    use crate::mesh::Mesh;
    use crate::problem::{Problem, UniformFlow};

    fn two_levels(config: &Config) -> (Level, Level) {
        let coarse_layout = Layout::new(range2d(0..8, 0..8), vec![range2d(0..4, 0..8), range2d(4..8, 0..8)], [true, true]);
        let fine_layout = Layout::new(range2d(0..16, 0..16), vec![range2d(4..12, 4..12)], [true, true]);
        let mesh = Mesh::new((0.0..1.0, 0.0..1.0), (8, 8));
        let coarse = Level::new(0, coarse_layout, mesh.clone(), config, 0.0);
        let fine = Level::new(1, fine_layout, mesh.refine(2), config, 0.0);
        (coarse, fine)
    }

    fn context<'a>(config: &'a Config, scheme: &'a dyn AdvectionScheme, solver: &'a ConjugateGradient, problem: &'a dyn Problem) -> Context<'a> {
        Context { config, scheme, solver, problem }
    }

    #[test]
    fn reflux_leaves_covered_cells_at_zero() {
        let config = Config::default();
        let scheme = config.scheme.build();
        let solver = ConjugateGradient::default();
        let problem = UniformFlow { velocity: (1.0, 0.0), density: 1.0 };
        let corrector = SyncCorrector { ctx: context(&config, scheme.as_ref(), &solver, &problem) };

        let (mut coarse, fine) = two_levels(&config);
        let mut registers = CoarseFineRegisters::new(&fine.layout, 2, config.num_state(), 0);

        let fluxes = |layout: &Layout, value: f64, level: u32| -> Vec<[Patch; 2]> {
            layout
                .boxes()
                .iter()
                .map(|b| Axis::BOTH.map(|axis| Patch::constant(level, config.num_state(), b.faces(axis), value)))
                .collect()
        };
        registers.adv.crse_init(&coarse.layout, &fluxes(&coarse.layout, 1.0, 0), 0, -0.1);
        registers.adv.fine_add(&fluxes(&fine.layout, 3.0, 1), 0, 0.1);

        for sync in coarse.sync.iter_mut() {
            sync.fill(1.0)
        }
        corrector.reflux(&mut coarse, &fine.layout, &registers, 0.1);

        for c in range2d(2..6, 2..6).iter() {
            let k = coarse.layout.box_containing(c).unwrap();
            assert!(coarse.sync[k].get_slice(c).iter().all(|&x| x == 0.0));
        }
        assert!(coarse.sync[0].get((1, 3), 3) != 1.0);
        assert_eq!(coarse.sync[0].get((0, 0), 3), 1.0);
    }

    #[test]
    fn avg_down_replaces_covered_coarse_cells() {
        let config = Config::default();
        let scheme = config.scheme.build();
        let solver = ConjugateGradient::default();
        let problem = UniformFlow { velocity: (1.0, 0.0), density: 1.0 };
        let corrector = SyncCorrector { ctx: context(&config, scheme.as_ref(), &solver, &problem) };

        let (mut coarse, mut fine) = two_levels(&config);
        for p in fine.state.new.iter_mut() {
            for (n, x) in p.iter_data_mut().enumerate() {
                x[DENSITY] = 2.0 + (n % 2) as f64
            }
        }
        for p in fine.p_avg.iter_mut() {
            p.fill(5.0)
        }
        corrector.avg_down(&mut coarse, &fine, false);

        assert_eq!(coarse.state.new[0].get((3, 4), DENSITY), 2.5);
        assert_eq!(coarse.press.new[1].get((4, 4), 0), 5.0);
        assert_eq!(coarse.state.new[0].get((1, 1), DENSITY), 0.0);
        assert_eq!(coarse.press.new[0].get((1, 1), 0), 0.0);
    }

    #[test]
    fn mac_sync_removes_and_restores_the_density_share() {
        let config = Config {
            scalars: vec![
                ScalarConfig::density(),
                ScalarConfig { advection: AdvectionForm::Conservative, diffusivity: 0.01, ..ScalarConfig::tracer("heat") },
            ],
            ..Config::default()
        };
        let scheme = config.scheme.build();
        let solver = ConjugateGradient::default();
        let problem = UniformFlow { velocity: (0.0, 0.0), density: 1.0 };
        let corrector = SyncCorrector { ctx: context(&config, scheme.as_ref(), &solver, &problem) };

        let (mut coarse, fine) = two_levels(&config);
        for p in coarse.state.new.iter_mut() {
            for x in p.iter_data_mut() {
                x[DENSITY] = 2.0;
                x[3] = 4.0;
            }
        }
        for (sync, valid) in coarse.sync.iter_mut().zip(coarse.layout.boxes()) {
            for c in valid.iter() {
                *sync.get_mut(c, DENSITY) = 1.0;
                *sync.get_mut(c, 3) = 2.0;
            }
        }
        let registers = CoarseFineRegisters::new(&fine.layout, 2, config.num_state(), 0);
        let dt = 0.5;

        corrector.mac_sync(&mut coarse, &mut [], &registers, None, 0.0, dt).unwrap();

        // the tracer sync is entirely the density share, so nothing diffuses
        for (state, valid) in coarse.state.new.iter().zip(coarse.layout.boxes()) {
            for c in valid.iter() {
                assert!((state.get(c, DENSITY) - 2.5).abs() < 1e-10);
                assert!((state.get(c, 3) - 5.0).abs() < 1e-8);
            }
        }
    }

    #[test]
    fn mac_sync_interpolates_the_scalar_sync_to_finer_levels() {
        let config = Config::default();
        let scheme = config.scheme.build();
        let solver = ConjugateGradient::default();
        let problem = UniformFlow { velocity: (0.0, 0.0), density: 1.0 };
        let corrector = SyncCorrector { ctx: context(&config, scheme.as_ref(), &solver, &problem) };

        let (mut coarse, fine) = two_levels(&config);
        for (sync, valid) in coarse.sync.iter_mut().zip(coarse.layout.boxes()) {
            for c in valid.iter() {
                *sync.get_mut(c, 3) = c.0 as f64
            }
        }
        let registers = CoarseFineRegisters::new(&fine.layout, 2, config.num_state(), 0);
        let mut finer = vec![fine];

        corrector.mac_sync(&mut coarse, &mut finer, &registers, None, 0.0, 1.0).unwrap();

        assert_eq!(finer[0].state.new[0].get((9, 5), 3), 4.0);
        assert_eq!(finer[0].state.new[0].get((4, 11), 3), 2.0);
        assert_eq!(coarse.state.new[1].get((6, 0), 3), 6.0);
    }

    #[test]
    fn non_conservative_tracers_have_no_density_share() {
        let config = Config::default();
        let (coarse, _) = two_levels(&config);
        let forms = config.advection_forms();

        assert!((DENSITY + 1..config.num_state()).all(|comp| forms[comp] != AdvectionForm::Conservative));
        assert!(density_sync_share(&coarse, &[]).is_empty());
    }

    #[test]
    fn level_sync_without_mismatch_leaves_the_velocity_alone() {
        let config = Config::default();
        let scheme = config.scheme.build();
        let solver = ConjugateGradient::default();
        let problem = UniformFlow { velocity: (1.0, 0.5), density: 1.0 };
        let ctx = context(&config, scheme.as_ref(), &solver, &problem);
        let corrector = SyncCorrector { ctx };

        let (mut coarse, mut fine) = two_levels(&config);
        coarse.initialize(&ctx, 0.0);
        fine.initialize(&ctx, 0.0);
        let registers = CoarseFineRegisters::new(&fine.layout, 2, config.num_state(), 0);
        let mut finer = vec![fine];

        corrector.level_sync(&mut coarse, &mut finer, &registers, 0.0, 0.1).unwrap();

        for level in std::iter::once(&coarse).chain(&finer) {
            for (state, valid) in level.state.new.iter().zip(level.layout.boxes()) {
                for c in valid.iter() {
                    assert!((state.get(c, 0) - 1.0).abs() < 1e-8);
                    assert!((state.get(c, 1) - 0.5).abs() < 1e-8);
                }
            }
        }
    }
}
