use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use crate::amr::Hierarchy;
use crate::index_space::{shift, Axis, IndexSpace};
use crate::level::{Context, Level, DENSITY};
use crate::patch::Patch;
use crate::projection::averaged_divergence;




/**
 * Cell quantities derived from the state.
 */
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Derived {
    /// `dv/dx - du/dy`
    Vorticity,
    MagVort,
    /// `rho |u|^2 / 2`
    KineticEnergy,
    MagVel,
    /// The cell-centered divergence of the velocity.
    DivU,
}




// ============================================================================
impl Derived {
    pub fn name(self) -> &'static str {
        match self {
            Derived::Vorticity => "vorticity",
            Derived::MagVort => "mag_vort",
            Derived::KineticEnergy => "energy",
            Derived::MagVel => "mag_vel",
            Derived::DivU => "diveru",
        }
    }

    /**
     * The guard zones the quantity's stencil needs.
     */
    pub fn stencil_width(self) -> i64 {
        match self {
            Derived::KineticEnergy | Derived::MagVel => 0,
            _ => 1,
        }
    }

    /**
     * Compute the quantity over `region` from a state patch ghost filled
     * at least `stencil_width` cells beyond it.
     */
    pub fn compute(self, state: &Patch, region: &IndexSpace, spacing: (f64, f64)) -> Patch {
        let vorticity = |c: (i64, i64)| {
            let dvdx = (state.get(shift(c, Axis::I.offset(1)), 1) - state.get(shift(c, Axis::I.offset(-1)), 1)) / (2.0 * spacing.0);
            let dudy = (state.get(shift(c, Axis::J.offset(1)), 0) - state.get(shift(c, Axis::J.offset(-1)), 0)) / (2.0 * spacing.1);
            dvdx - dudy
        };
        let speed2 = |c: (i64, i64)| state.get(c, 0).powi(2) + state.get(c, 1).powi(2);

        Patch::from_scalar_function(state.level(), region.clone(), |c| match self {
            Derived::Vorticity => vorticity(c),
            Derived::MagVort => vorticity(c).abs(),
            Derived::KineticEnergy => 0.5 * state.get(c, DENSITY) * speed2(c),
            Derived::MagVel => speed2(c).sqrt(),
            Derived::DivU => averaged_divergence(state, c, spacing),
        })
    }
}




/**
 * Derive a quantity on the valid cells of every patch of a level, at the
 * level's new time.
 */
pub fn derive(ctx: &Context, level: &Level, coarse: Option<&Level>, quantity: Derived) -> Vec<Patch> {
    let state = level.fill_state(level.state.new_time, coarse, ctx);
    let spacing = level.mesh.cell_spacing();

    level
        .layout
        .boxes()
        .par_iter()
        .zip(&state)
        .map(|(valid, s)| quantity.compute(s, valid, spacing))
        .collect()
}




/**
 * Zero derived values in cells covered by the next finer level, whose
 * boxes are given coarsened to this level.
 */
fn mask_covered(values: &mut [Patch], covered: &[IndexSpace]) {
    values.par_iter_mut().for_each(|patch| {
        for b in covered {
            if let Some(overlap) = b.intersect(patch.index_space()) {
                let n = patch.num_fields();
                patch.fill_region(&overlap, 0..n, 0.0)
            }
        }
    })
}




/**
 * The largest value of a derived quantity on level `lev`, over the cells
 * not covered by a finer level.
 */
pub fn max_val(hierarchy: &Hierarchy, lev: usize, quantity: Derived) -> f64 {
    let ctx = hierarchy.context();
    let levels = hierarchy.levels();
    let coarse = lev.checked_sub(1).map(|k| &levels[k]);
    let mut values = derive(&ctx, &levels[lev], coarse, quantity);

    if let Some(fine) = levels.get(lev + 1) {
        mask_covered(&mut values, &fine.layout.coarsened_boxes(ctx.config.ref_ratio))
    }
    values
        .iter()
        .flat_map(|p| p.iter_data().map(|s| s[0]))
        .fold(0.0, f64::max)
}




/**
 * The volume-weighted sum of a derived quantity on level `lev`, over the
 * cells not covered by a finer level.
 */
pub fn vol_wgt_sum(hierarchy: &Hierarchy, lev: usize, quantity: Derived) -> f64 {
    let ctx = hierarchy.context();
    let levels = hierarchy.levels();
    let level = &levels[lev];
    let coarse = lev.checked_sub(1).map(|k| &levels[k]);
    let mut values = derive(&ctx, level, coarse, quantity);

    if let Some(fine) = levels.get(lev + 1) {
        mask_covered(&mut values, &fine.layout.coarsened_boxes(ctx.config.ref_ratio))
    }
    let volume = level.mesh.cell_volume();
    values.iter().map(|p| p.sum(p.index_space(), 0)).sum::<f64>() * volume
}




/**
 * Whole-domain diagnostics, summed over the uncovered cells of every level.
 */
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct IntegratedQuantities {
    pub time: f64,
    pub mass: f64,
    pub kinetic_energy: f64,
    pub enstrophy: f64,
    pub max_vorticity: f64,
}




/**
 * Sum the mass, kinetic energy, and enstrophy over the hierarchy, and find
 * the largest vorticity magnitude.
 */
pub fn sum_integrated_quantities(hierarchy: &Hierarchy) -> IntegratedQuantities {
    let ctx = hierarchy.context();
    let levels = hierarchy.levels();
    let mut totals = IntegratedQuantities { time: hierarchy.time(), ..Default::default() };

    for (lev, level) in levels.iter().enumerate() {
        let coarse = lev.checked_sub(1).map(|k| &levels[k]);
        let covered = levels.get(lev + 1).map(|f| f.layout.coarsened_boxes(ctx.config.ref_ratio)).unwrap_or_default();
        let volume = level.mesh.cell_volume();

        let mut density: Vec<Patch> = level.density(&level.state.new);
        let mut energy = derive(&ctx, level, coarse, Derived::KineticEnergy);
        let mut vorticity = derive(&ctx, level, coarse, Derived::Vorticity);

        for values in [&mut density, &mut energy, &mut vorticity] {
            mask_covered(values, &covered)
        }
        let sum = |values: &[Patch], f: fn(f64) -> f64| -> f64 {
            values.iter().flat_map(|p| p.iter_data().map(move |s| f(s[0]))).sum::<f64>() * volume
        };

        totals.mass += sum(&density, |x| x);
        totals.kinetic_energy += sum(&energy, |x| x);
        totals.enstrophy += sum(&vorticity, |x| 0.5 * x * x);
        totals.max_vorticity = totals.max_vorticity.max(max_val(hierarchy, lev, Derived::MagVort));
    }

    log::info!(
        "t = {:.6}: mass = {:.12e} energy = {:.12e} enstrophy = {:.12e} max |w| = {:.6e}",
        totals.time,
        totals.mass,
        totals.kinetic_energy,
        totals.enstrophy,
        totals.max_vorticity);
    totals
}




// ============================================================================
#[cfg(test)]
mod test {

    use std::sync::Arc;
    use super::*;
    use crate::config::Config;
    use crate::index_space::range2d;
    use crate::problem::{Problem, UniformFlow};

    #[test]
    fn solid_rotation_has_uniform_vorticity() {
        let spacing = (0.1, 0.1);
        let state = Patch::from_slice_function(0, range2d(-1..5, -1..5), 4, |(i, j), s| {
            let (x, y) = (i as f64 * 0.1, j as f64 * 0.1);
            s[0] = -y;
            s[1] = x;
            s[DENSITY] = 2.0;
        });
        let region = range2d(0..4, 0..4);

        let w = Derived::Vorticity.compute(&state, &region, spacing);
        assert!(w.iter_data().all(|s| (s[0] - 2.0).abs() < 1e-12));

        let div = Derived::DivU.compute(&state, &region, spacing);
        assert!(div.iter_data().all(|s| s[0].abs() < 1e-12));

        let ke = Derived::KineticEnergy.compute(&state, &region, spacing);
        assert!((ke.get((3, 3), 0) - 0.18).abs() < 1e-12);
    }

    #[test]
    fn integrated_quantities_count_each_region_once() {
        let problem: Arc<dyn Problem> = Arc::new(UniformFlow { velocity: (1.0, 0.0), density: 2.0 });
        let boxes = vec![vec![range2d(0..8, 0..8)], vec![range2d(4..12, 4..12)]];
        let mut hierarchy = Hierarchy::new(Arc::new(Config::default()), problem, (0.0..1.0, 0.0..1.0), (8, 8), boxes).unwrap();
        hierarchy.initialize().unwrap();

        let totals = sum_integrated_quantities(&hierarchy);
        assert!((totals.mass - 2.0).abs() < 1e-9);
        assert!((totals.kinetic_energy - 1.0).abs() < 1e-9);
        assert!(totals.enstrophy.abs() < 1e-9);
        assert!((max_val(&hierarchy, 0, Derived::MagVel) - 1.0).abs() < 1e-9);
        assert!((vol_wgt_sum(&hierarchy, 0, Derived::MagVel) - 0.75).abs() < 1e-9);
    }
}
