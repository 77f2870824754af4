use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::sync::Arc;
use serde::{Deserialize, Serialize};
use crate::config::Config;
use crate::elliptic::EllipticSolver;
use crate::error::{Error, Result};
use crate::godunov::AdvectionScheme;
use crate::index_space::{Axis, IndexSpace};
use crate::level::{Context, Level, NUM_GHOST, NUM_VEL};
use crate::mesh::{Mesh, Rectangle};
use crate::meshing::Layout;
use crate::problem::Problem;
use crate::projection::ProjectionController;
use crate::sync::{CoarseFineRegisters, SyncCorrector};

/// Everything needed to resume a run: the configuration, the clock, and the
/// data of every level. Written and read as CBOR.
///
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Checkpoint {
    pub config: Config,
    pub time: f64,
    pub step: usize,
    pub dt_level: Vec<f64>,
    pub levels: Vec<Level>,
}

impl Checkpoint {
    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        ciborium::de::from_reader(BufReader::new(file)).map_err(|e| Error::Checkpoint(e.to_string()))
    }

    pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {
        let file = File::create(path)?;
        ciborium::ser::into_writer(self, BufWriter::new(file)).map_err(|e| Error::Checkpoint(e.to_string()))
    }
}

/// A fixed hierarchy of refinement levels, advanced with subcycling: each
/// level takes `ref_ratio` steps for every step of the level below it, and
/// after the subcycles of a finer level the two are synchronized.
///
pub struct Hierarchy {
    config: Arc<Config>,
    scheme: Box<dyn AdvectionScheme>,
    solver: Box<dyn EllipticSolver>,
    problem: Arc<dyn Problem>,
    levels: Vec<Level>,
    registers: Vec<CoarseFineRegisters>,
    dt_level: Vec<f64>,
    dt_estimate: Vec<f64>,
    time: f64,
    step: usize,
}

impl Hierarchy {
    /// Create a hierarchy over the physical rectangle `area`, with a base
    /// level of `size` cells. `boxes[l]` are the boxes of level `l`, in that
    /// level's cell indexes; every fine box must be aligned with the coarse
    /// cells and lie over the level below it. The state is zero until
    /// `initialize` is called.
    ///
    pub fn new(config: Arc<Config>, problem: Arc<dyn Problem>, area: Rectangle<f64>, size: (i64, i64), boxes: Vec<Vec<IndexSpace>>) -> Result<Self> {
        config.validate()?;

        if boxes.is_empty() || boxes.iter().any(|b| b.is_empty()) {
            return Err(Error::InvalidConfig(String::from("every level needs at least one box")))
        }

        let r = config.ref_ratio;
        let periodic = config.domain_bc.periodicity();
        let mut levels: Vec<Level> = Vec::new();
        let mut mesh = Mesh::new(area, size);
        let mut domain = IndexSpace::new(0..size.0, 0..size.1);

        for (index, level_boxes) in boxes.into_iter().enumerate() {
            if index > 0 {
                mesh = mesh.refine(r);
                domain = domain.refine_by(r);
            }
            let layout = Layout::new(domain.clone(), level_boxes, periodic);

            if let Some(coarse) = levels.last() {
                check_nesting(&coarse.layout, &layout, r)?;
            } else if layout.boxes().iter().any(|b| !domain.contains_space(b)) {
                return Err(Error::InvalidConfig(String::from("base level boxes must lie in the domain")))
            }
            levels.push(Level::new(index, layout, mesh.clone(), &config, 0.0));
        }

        Ok(Self::assemble(config, problem, levels, 0.0, 0))
    }

    /// Resume a run from a checkpoint.
    ///
    pub fn from_checkpoint(checkpoint: Checkpoint, problem: Arc<dyn Problem>) -> Result<Self> {
        checkpoint.config.validate()?;
        let Checkpoint { config, time, step, dt_level, levels } = checkpoint;
        let mut hierarchy = Self::assemble(Arc::new(config), problem, levels, time, step);

        if dt_level.len() != hierarchy.levels.len() {
            return Err(Error::Checkpoint(String::from("time steps do not match the levels")))
        }
        hierarchy.dt_level = dt_level;
        Ok(hierarchy)
    }

    fn assemble(config: Arc<Config>, problem: Arc<dyn Problem>, levels: Vec<Level>, time: f64, step: usize) -> Self {
        let nstate = config.num_state();
        let registers = levels
            .windows(2)
            .map(|pair| CoarseFineRegisters::new(&pair[1].layout, config.ref_ratio, nstate, pair[0].index as u32))
            .collect();

        Self {
            scheme: config.scheme.build(),
            solver: Box::new(config.solver.clone()),
            dt_level: vec![0.0; levels.len()],
            dt_estimate: vec![f64::INFINITY; levels.len()],
            config,
            problem,
            levels,
            registers,
            time,
            step,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn levels(&self) -> &[Level] {
        &self.levels
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn step(&self) -> usize {
        self.step
    }

    /// The time step of the base level.
    ///
    pub fn dt(&self) -> f64 {
        self.dt_level[0]
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            config: Config::clone(&self.config),
            time: self.time,
            step: self.step,
            dt_level: self.dt_level.clone(),
            levels: self.levels.clone(),
        }
    }

    /// The solver context shared by every level.
    ///
    pub fn context(&self) -> Context<'_> {
        Context {
            config: &self.config,
            scheme: self.scheme.as_ref(),
            solver: self.solver.as_ref(),
            problem: self.problem.as_ref(),
        }
    }

    fn split(&mut self) -> (Context<'_>, &mut [Level], &mut [CoarseFineRegisters]) {
        let ctx = Context {
            config: &self.config,
            scheme: self.scheme.as_ref(),
            solver: self.solver.as_ref(),
            problem: self.problem.as_ref(),
        };
        (ctx, &mut self.levels, &mut self.registers)
    }

    /// Set up the initial state: problem data on every level, a projection
    /// making each level's velocity divergence free, coarse data averaged
    /// from fine data, the first time step, and `init_iter` initial
    /// pressure iterations.
    ///
    pub fn initialize(&mut self) -> Result<()> {
        let start = self.time;
        {
            let (ctx, levels, _) = self.split();

            for level in levels.iter_mut() {
                level.initialize(&ctx, start)
            }
            for k in 0..levels.len() {
                let (lower, upper) = levels.split_at_mut(k);
                project_initial_velocity(&ctx, &mut upper[0], lower.last(), start)?;
            }
            average_down_all(&ctx, levels, true);
        }

        let mut dt = f64::INFINITY;
        let mut factor = 1.0;

        for level in &self.levels {
            if level.index > 0 {
                factor *= self.config.ref_ratio as f64
            }
            dt = dt.min(level.est_time_step(&self.config) * factor)
        }
        let dt = match self.config.fixed_dt {
            Some(fixed) => fixed,
            None => self.checked_time_step(dt * self.config.init_shrink)?,
        };
        self.set_time_steps(dt);
        self.initial_pressure_iterations()?;

        log::info!("initialized {} level(s) at t = {:.6}, dt = {:.3e}", self.levels.len(), start, dt);
        Ok(())
    }

    /// Iterate the first step to recover a pressure consistent with the
    /// initial velocity: advance every level without its level projection,
    /// project the result into a pressure increment, then restore everything
    /// except the pressure.
    ///
    fn initial_pressure_iterations(&mut self) -> Result<()> {
        let start = self.time;
        let finest = self.levels.len() - 1;
        let dt = self.dt_level[finest];

        for iter in 0..self.config.init_iter {
            let (ctx, levels, _) = self.split();

            for k in 0..levels.len() {
                let (lower, upper) = levels.split_at_mut(k);
                upper[0].advance(&ctx, lower.last(), start, dt, 1, 1, true)?;
            }
            for k in 0..levels.len() {
                let (lower, upper) = levels.split_at_mut(k);
                recover_pressure(&ctx, &mut upper[0], lower.last(), start + dt, dt)?;
            }
            average_down_all(&ctx, levels, true);

            for level in levels.iter_mut() {
                reset_to_start(level, start)
            }
            log::debug!("initial pressure iteration {} done", iter + 1);
        }
        Ok(())
    }

    /// Take one step of the base level, with every finer level subcycled
    /// and synchronized, and choose the next time step. Returns the step
    /// size taken.
    ///
    pub fn advance(&mut self) -> Result<f64> {
        let dt = self.dt_level[0];
        self.dt_estimate.iter_mut().for_each(|d| *d = f64::INFINITY);
        self.timestep(0, self.time, 1, 1)?;
        self.time += dt;
        self.step += 1;

        let next = self.compute_new_dt()?;
        self.set_time_steps(next);

        log::info!("[{}] t = {:.6} dt = {:.3e}", self.step, self.time, dt);
        Ok(dt)
    }

    fn timestep(&mut self, lev: usize, time: f64, iteration: usize, ncycle: usize) -> Result<()> {
        let dt = self.dt_level[lev];
        let finest = self.levels.len() - 1;

        let estimate = {
            let (ctx, levels, registers) = self.split();
            let (lower, upper) = levels.split_at_mut(lev);
            let (head, finer) = upper.split_at_mut(1);
            let level = &mut head[0];

            if lev < finest {
                registers[lev].clear()
            }
            let report = level.advance(&ctx, lower.last(), time, dt, iteration, ncycle, false)?;

            if let Some(fine) = finer.first() {
                registers[lev].crse_init(level, &fine.layout, &report, dt)
            }
            if lev > 0 {
                let nested = finer.first().map(|f| (&level.layout, &f.layout));
                registers[lev - 1].fine_add(&report, dt, iteration == ncycle, nested)
            }
            report.dt_estimate
        };
        self.dt_estimate[lev] = self.dt_estimate[lev].min(estimate);

        if lev < finest {
            let r = self.config.ref_ratio as usize;
            let dt_fine = self.dt_level[lev + 1];

            for i in 1..=r {
                self.timestep(lev + 1, time + (i - 1) as f64 * dt_fine, i, r)?
            }
            self.post_timestep(lev, time, dt)?
        }
        Ok(())
    }

    /// Synchronize level `lev` with the levels above it, which have just
    /// caught up with it.
    ///
    fn post_timestep(&mut self, lev: usize, time: f64, dt: f64) -> Result<()> {
        let (ctx, levels, registers) = self.split();
        let cfg = ctx.config;
        let corrector = SyncCorrector { ctx };
        let (lower, finer) = levels.split_at_mut(lev + 1);
        let coarse = &mut lower[lev];
        let (below, above) = registers.split_at_mut(lev);
        let registers = &above[0];

        for sync in coarse.sync.iter_mut() {
            sync.fill(0.0)
        }
        if cfg.do_reflux {
            corrector.reflux(coarse, &finer[0].layout, registers, dt)
        }
        corrector.avg_down(coarse, &finer[0], false);

        if cfg.do_mac_proj && cfg.do_reflux {
            corrector.mac_sync(coarse, finer, registers, below.last_mut(), time, dt)?
        }
        if cfg.do_sync_proj {
            corrector.level_sync(coarse, finer, registers, time + dt, dt)?
        }
        Ok(())
    }

    /// The next base-level time step: the smallest of every level's
    /// estimates, scaled up by the subcycling ratio, and at most
    /// `change_max` times the last one.
    ///
    pub fn compute_new_dt(&self) -> Result<f64> {
        if let Some(fixed) = self.config.fixed_dt {
            return Ok(fixed)
        }
        let mut dt = self.dt_level[0] * self.config.change_max;
        let mut factor = 1.0;

        for (level, estimate) in self.levels.iter().zip(&self.dt_estimate) {
            if level.index > 0 {
                factor *= self.config.ref_ratio as f64
            }
            dt = dt.min(estimate.min(level.est_time_step(&self.config)) * factor)
        }
        self.checked_time_step(dt)
    }

    fn checked_time_step(&self, dt: f64) -> Result<f64> {
        if !dt.is_finite() {
            Err(Error::InvalidConfig(String::from("the flow is at rest; set fixed_dt to choose a time step")))
        } else if dt < self.config.dt_cutoff {
            Err(Error::InvalidConfig(format!("time step {:e} is below dt_cutoff {:e}", dt, self.config.dt_cutoff)))
        } else {
            Ok(dt)
        }
    }

    fn set_time_steps(&mut self, dt: f64) {
        let r = self.config.ref_ratio as f64;
        let mut level_dt = dt;

        for d in self.dt_level.iter_mut() {
            *d = level_dt;
            level_dt /= r
        }
    }
}

/// Every fine box must be aligned with the coarse lattice and lie over the
/// boxes of the coarse level, together with enough coarse cells around it
/// to fill its guard zones. Buffer cells outside a wall are not needed;
/// across a periodic side they are taken from the periodic image.
fn check_nesting(coarse: &Layout, fine: &Layout, ratio: i64) -> Result<()> {
    let buffer = (NUM_GHOST + ratio - 1) / ratio;

    for b in fine.boxes() {
        let aligned = Axis::BOTH.iter().all(|&axis| {
            let range = b.range(axis);
            range.start % ratio == 0 && range.end % ratio == 0
        });
        if !aligned {
            return Err(Error::InvalidConfig(format!("fine box {:?} is not aligned with the coarse cells", b)))
        }
        if !fine.domain().contains_space(b) || !b.coarsen_by(ratio).iter().all(|c| coarse.covers(c)) {
            return Err(Error::InvalidConfig(format!("fine box {:?} is not nested in the coarse level", b)))
        }
        let buffered = b.coarsen_by(ratio).extend_all(buffer).iter().all(|c| match coarse.wrap(c) {
            Some(w) => coarse.covers(w),
            None => true,
        });
        if !buffered {
            return Err(Error::InvalidConfig(format!("fine box {:?} is too close to the edge of the coarse level", b)))
        }
    }
    Ok(())
}

/// Average new data down through the hierarchy, finest first.
fn average_down_all(ctx: &Context, levels: &mut [Level], initial_step: bool) {
    let corrector = SyncCorrector { ctx: *ctx };

    for k in (1..levels.len()).rev() {
        let (lower, upper) = levels.split_at_mut(k);
        corrector.avg_down(&mut lower[k - 1], &upper[0], initial_step)
    }
}

/// Make the initial velocity of a level satisfy the divergence constraint.
/// The pressure is left alone.
fn project_initial_velocity(ctx: &Context, level: &mut Level, coarse: Option<&Level>, time: f64) -> Result<()> {
    let controller = ProjectionController { solver: ctx.solver, bc: &ctx.config.domain_bc };
    let state = level.fill_state(time, coarse, ctx);
    let rho = level.density(&state);
    let divu = level.divu.as_ref().map(|d| d.new.clone());
    let projection = controller.level_project(level.index, time, 1.0, &level.layout, &level.mesh, &state, &rho, divu.as_deref())?;

    for (s, correction) in level.state.new.iter_mut().zip(&projection.correction) {
        s.add_from(correction, 0, 0, NUM_VEL, -1.0)
    }
    level.state.old = level.state.new.clone();
    Ok(())
}

/// Project the provisional velocity of an initial step and add the
/// potential to the pressure.
fn recover_pressure(ctx: &Context, level: &mut Level, coarse: Option<&Level>, time: f64, dt: f64) -> Result<()> {
    let controller = ProjectionController { solver: ctx.solver, bc: &ctx.config.domain_bc };
    let state = level.fill_state(time, coarse, ctx);
    let divu = level.divu.as_ref().map(|d| d.new.clone());
    let projection = controller.level_project(level.index, time, dt, &level.layout, &level.mesh, &state, &level.rho_half, divu.as_deref())?;

    for (p, phi) in level.press.new.iter_mut().zip(&projection.phi) {
        p.add_from(phi, 0, 0, 1, 1.0)
    }
    Ok(())
}

/// Undo an initial step, except for the pressure, which becomes the old and
/// new pressure at the start time.
fn reset_to_start(level: &mut Level, start: f64) {
    level.state.new = level.state.old.clone();
    level.state.set_time(start);
    level.press.old = level.press.new.clone();
    level.press.set_time(start);

    for data in [level.divu.as_mut(), level.dsdt.as_mut()].into_iter().flatten() {
        data.new = data.old.clone();
        data.set_time(start)
    }
    level.rho_avg = level.density(&level.state.new);
}

/// The total of state component `comp` over the valid cells of the base
/// level, times the cell volume.
///
pub fn base_integral(hierarchy: &Hierarchy, comp: usize) -> f64 {
    let level = &hierarchy.levels()[0];
    let volume = level.mesh.cell_volume();
    level.layout.boxes().iter().zip(&level.state.new).map(|(b, p)| p.sum(b, comp)).sum::<f64>() * volume
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::advection::AdvectionForm;
    use crate::config::ScalarConfig;
    use crate::index_space::range2d;
    use crate::level::DENSITY;
    use crate::problem::{TaylorGreen, UniformFlow};

    fn two_level(config: Config, problem: Arc<dyn Problem>) -> Hierarchy {
        let boxes = vec![
            vec![range2d(0..8, 0..16), range2d(8..16, 0..16)],
            vec![range2d(8..24, 8..24)],
        ];
        Hierarchy::new(Arc::new(config), problem, (0.0..1.0, 0.0..1.0), (16, 16), boxes).unwrap()
    }

    #[test]
    fn misaligned_and_unnested_fine_boxes_are_rejected() {
        let problem: Arc<dyn Problem> = Arc::new(UniformFlow { velocity: (1.0, 0.0), density: 1.0 });
        let area = (0.0..1.0, 0.0..1.0);

        let misaligned = vec![vec![range2d(0..8, 0..8)], vec![range2d(1..5, 0..4)]];
        assert!(Hierarchy::new(Arc::new(Config::default()), problem.clone(), area.clone(), (8, 8), misaligned).is_err());

        let outside = vec![vec![range2d(0..4, 0..8)], vec![range2d(8..12, 0..4)]];
        assert!(Hierarchy::new(Arc::new(Config::default()), problem, area, (8, 8), outside).is_err());
    }

    #[test]
    fn fine_levels_need_a_buffer_of_coarse_cells() {
        let problem: Arc<dyn Problem> = Arc::new(UniformFlow { velocity: (1.0, 0.0), density: 1.0 });
        let area = (0.0..1.0, 0.0..1.0);

        let flush = vec![
            vec![range2d(0..16, 0..16)],
            vec![range2d(8..24, 8..24)],
            vec![range2d(16..48, 16..48)],
        ];
        let result = Hierarchy::new(Arc::new(Config::default()), problem.clone(), area.clone(), (16, 16), flush);
        assert!(matches!(result, Err(Error::InvalidConfig(_))));

        // the periodic image below j = 0 is not refined
        let periodic = vec![
            vec![range2d(0..16, 0..16)],
            vec![range2d(0..24, 0..8)],
            vec![range2d(0..16, 0..8)],
        ];
        let result = Hierarchy::new(Arc::new(Config::default()), problem.clone(), area.clone(), (16, 16), periodic);
        assert!(matches!(result, Err(Error::InvalidConfig(_))));

        let buffered = vec![
            vec![range2d(0..16, 0..16)],
            vec![range2d(8..24, 8..24)],
            vec![range2d(20..44, 20..44)],
        ];
        assert!(Hierarchy::new(Arc::new(Config::default()), problem, area, (16, 16), buffered).is_ok());
    }

    #[test]
    fn fluid_at_rest_needs_a_fixed_time_step() {
        let problem = Arc::new(UniformFlow { velocity: (0.0, 0.0), density: 1.0 });
        let mut hierarchy = two_level(Config::default(), problem.clone());
        assert!(matches!(hierarchy.initialize(), Err(Error::InvalidConfig(_))));

        let mut hierarchy = two_level(Config { fixed_dt: Some(0.01), ..Config::default() }, problem);
        hierarchy.initialize().unwrap();
        assert_eq!(hierarchy.dt(), 0.01);
    }

    #[test]
    fn uniform_flow_through_a_refined_region_conserves_mass() {
        let problem = Arc::new(UniformFlow { velocity: (1.0, 0.5), density: 1.0 });
        let mut hierarchy = two_level(Config::default(), problem);
        hierarchy.initialize().unwrap();

        let mass = base_integral(&hierarchy, DENSITY);
        let tracer = base_integral(&hierarchy, 3);

        for _ in 0..3 {
            hierarchy.advance().unwrap();
        }
        assert!((base_integral(&hierarchy, DENSITY) - mass).abs() < 1e-10);
        assert!((base_integral(&hierarchy, 3) - tracer).abs() < 1e-10);

        for level in hierarchy.levels() {
            for (state, valid) in level.state.new.iter().zip(level.layout.boxes()) {
                for c in valid.iter() {
                    assert!((state.get(c, 0) - 1.0).abs() < 1e-8);
                    assert!((state.get(c, 1) - 0.5).abs() < 1e-8);
                }
            }
        }
        assert_eq!(hierarchy.step(), 3);
    }

    #[test]
    fn default_hierarchy_syncs_without_conservative_tracers() {
        let problem: Arc<dyn Problem> = Arc::new(TaylorGreen { amplitude: 1.0, density: 1.0 });
        let mut hierarchy = two_level(Config::default(), problem);
        hierarchy.initialize().unwrap();

        for _ in 0..2 {
            hierarchy.advance().unwrap();
        }
        for level in hierarchy.levels() {
            for (state, valid) in level.state.new.iter().zip(level.layout.boxes()) {
                for c in valid.iter() {
                    assert!(state.get_slice(c).iter().all(|x| x.is_finite()));
                    assert!((state.get(c, DENSITY) - 1.0).abs() < 1e-4);
                }
            }
        }
    }

    #[test]
    fn reflux_conserves_a_tracer_blob_across_the_refined_region() {
        let config = |do_reflux| Config {
            scalars: vec![
                ScalarConfig::density(),
                ScalarConfig { advection: AdvectionForm::Conservative, ..ScalarConfig::tracer("ink") },
            ],
            do_reflux,
            ..Config::default()
        };
        let problem: Arc<dyn Problem> = Arc::new(TaylorGreen { amplitude: 1.0, density: 1.0 });
        let drift = |do_reflux| {
            let mut hierarchy = two_level(config(do_reflux), problem.clone());
            hierarchy.initialize().unwrap();
            let ink = base_integral(&hierarchy, 3);

            for _ in 0..5 {
                hierarchy.advance().unwrap();
            }
            (base_integral(&hierarchy, 3) - ink).abs()
        };
        assert!(drift(true) < 1e-12);
        assert!(drift(false) > 1e-8);
    }

    #[test]
    fn taylor_green_hierarchy_advances_and_survives_a_checkpoint() {
        let problem: Arc<dyn Problem> = Arc::new(TaylorGreen { amplitude: 1.0, density: 1.0 });
        let mut hierarchy = two_level(Config::default(), problem.clone());
        hierarchy.initialize().unwrap();

        let dt0 = hierarchy.dt();
        hierarchy.advance().unwrap();
        assert!(hierarchy.time() > 0.0);
        assert!(hierarchy.dt() <= dt0 * hierarchy.config().change_max * (1.0 + 1e-12));

        let mut bytes = Vec::new();
        ciborium::ser::into_writer(&hierarchy.checkpoint(), &mut bytes).unwrap();
        let checkpoint: Checkpoint = ciborium::de::from_reader(bytes.as_slice()).unwrap();
        let restored = Hierarchy::from_checkpoint(checkpoint, problem).unwrap();

        assert_eq!(restored.time(), hierarchy.time());
        assert_eq!(restored.dt(), hierarchy.dt());
        assert_eq!(restored.levels()[1].state.new[0].data(), hierarchy.levels()[1].state.new[0].data());
    }
}
