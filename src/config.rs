use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use serde::{Deserialize, Serialize};
use crate::advection::AdvectionForm;
use crate::boundary::DomainBc;
use crate::diffusion::DiffusionForm;
use crate::elliptic::ConjugateGradient;
use crate::error::{Error, Result};
use crate::godunov::SchemeKind;
use crate::level::{DENSITY, NUM_VEL};

/// One advected scalar. The first scalar is always the density.
///
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalarConfig {
    pub name: String,
    pub advection: AdvectionForm,
    pub diffusion: DiffusionForm,
    pub diffusivity: f64,
}

impl Default for ScalarConfig {
    fn default() -> Self {
        Self {
            name: String::from("tracer"),
            advection: AdvectionForm::NonConservative,
            diffusion: DiffusionForm::Laplacian,
            diffusivity: 0.0,
        }
    }
}

impl ScalarConfig {
    pub fn density() -> Self {
        Self {
            name: String::from("density"),
            advection: AdvectionForm::Conservative,
            ..Self::default()
        }
    }

    pub fn tracer(name: &str) -> Self {
        Self { name: String::from(name), ..Self::default() }
    }
}

/// Run-time parameters of the flow solver. A configuration is validated
/// once and then shared immutably (behind an `Arc`) by every level.
///
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Target Courant number.
    pub cfl: f64,

    /// Largest factor by which the time step may grow from one step to the
    /// next.
    pub change_max: f64,

    /// Factor applied to the time step estimate of the first step.
    pub init_shrink: f64,

    /// Number of initial pressure iterations.
    pub init_iter: usize,

    /// Use this coarse time step instead of the estimate.
    pub fixed_dt: Option<f64>,

    /// Smallest acceptable time step.
    pub dt_cutoff: f64,

    /// Refinement ratio between consecutive levels.
    pub ref_ratio: i64,

    pub scheme: SchemeKind,
    pub corner_couple: bool,
    pub forces_in_trans: bool,

    /// Advect and diffuse momentum rather than velocity.
    pub do_mom_diff: bool,
    pub do_reflux: bool,
    pub do_mac_proj: bool,
    pub do_sync_proj: bool,

    /// Implicitness of the diffusion updates: 1/2 is Crank-Nicolson, 1 is
    /// backward Euler.
    pub be_cn_theta: f64,

    /// Dynamic viscosity.
    pub visc_coef: f64,

    pub scalars: Vec<ScalarConfig>,

    /// Order in which the non-density scalars are updated, as state
    /// component indexes. Empty means component order.
    pub scalar_update_order: Vec<usize>,

    pub have_divu: bool,
    pub have_dsdt: bool,

    /// Gravitational acceleration along the second axis.
    pub gravity: f64,

    pub solver: ConjugateGradient,
    pub domain_bc: DomainBc,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cfl: 0.5,
            change_max: 1.1,
            init_shrink: 1.0,
            init_iter: 2,
            fixed_dt: None,
            dt_cutoff: 0.0,
            ref_ratio: 2,
            scheme: SchemeKind::default(),
            corner_couple: true,
            forces_in_trans: false,
            do_mom_diff: false,
            do_reflux: true,
            do_mac_proj: true,
            do_sync_proj: true,
            be_cn_theta: 0.5,
            visc_coef: 0.0,
            scalars: vec![ScalarConfig::density(), ScalarConfig::tracer("tracer")],
            scalar_update_order: Vec::new(),
            have_divu: false,
            have_dsdt: false,
            gravity: 0.0,
            solver: ConjugateGradient::default(),
            domain_bc: DomainBc::default(),
        }
    }
}

impl Config {
    /// Read a configuration from a CBOR file and validate it.
    ///
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        let config: Self = ciborium::de::from_reader(BufReader::new(file))
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// The number of state components: the velocity followed by the
    /// scalars.
    ///
    pub fn num_state(&self) -> usize {
        NUM_VEL + self.scalars.len()
    }

    /// The configuration of the scalar at state component `comp`.
    ///
    pub fn scalar(&self, comp: usize) -> &ScalarConfig {
        &self.scalars[comp - DENSITY]
    }

    /// The name of state component `comp`.
    ///
    pub fn component_name(&self, comp: usize) -> &str {
        match comp {
            0 => "x_velocity",
            1 => "y_velocity",
            n => &self.scalar(n).name,
        }
    }

    /// The advection form of every state component. Velocity is advected in
    /// convective form, or as momentum when `do_mom_diff` is set.
    ///
    pub fn advection_forms(&self) -> Vec<AdvectionForm> {
        let velocity = if self.do_mom_diff {
            AdvectionForm::Conservative
        } else {
            AdvectionForm::NonConservative
        };
        let mut forms = vec![velocity; NUM_VEL];
        forms.extend(self.scalars.iter().map(|s| s.advection));
        forms
    }

    /// The state components of the scalars in update order, density first.
    ///
    pub fn scalar_order(&self) -> Vec<usize> {
        let mut order = vec![DENSITY];

        if self.scalar_update_order.is_empty() {
            order.extend(DENSITY + 1..self.num_state())
        } else {
            order.extend(self.scalar_update_order.iter().copied())
        }
        order
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |message: String| Err(Error::InvalidConfig(message));

        if !(self.cfl > 0.0 && self.cfl <= 1.0) {
            return invalid(format!("cfl must be in (0, 1], got {}", self.cfl))
        }
        if self.change_max < 1.0 {
            return invalid(format!("change_max must be at least 1, got {}", self.change_max))
        }
        if !(self.init_shrink > 0.0 && self.init_shrink <= 1.0) {
            return invalid(format!("init_shrink must be in (0, 1], got {}", self.init_shrink))
        }
        if self.fixed_dt.map_or(false, |dt| dt <= 0.0) {
            return invalid(String::from("fixed_dt must be positive"))
        }
        if self.ref_ratio < 2 {
            return invalid(format!("ref_ratio must be at least 2, got {}", self.ref_ratio))
        }
        if let SchemeKind::PiecewiseLinear { slope_order } = self.scheme {
            if ![1, 2, 4].contains(&slope_order) {
                return invalid(format!("slope_order must be 1, 2 or 4, got {}", slope_order))
            }
        }
        if !(self.be_cn_theta >= 0.5 && self.be_cn_theta <= 1.0) {
            return invalid(format!("be_cn_theta must be in [0.5, 1], got {}", self.be_cn_theta))
        }
        if self.visc_coef < 0.0 {
            return invalid(String::from("visc_coef must not be negative"))
        }
        if self.have_dsdt && !self.have_divu {
            return invalid(String::from("have_dsdt requires have_divu"))
        }

        let density = match self.scalars.first() {
            Some(density) => density,
            None => return invalid(String::from("the density must be the first scalar")),
        };
        if density.advection != AdvectionForm::Conservative {
            return Err(Error::InconsistentAdvectionForm {
                name: density.name.clone(),
                reason: "the density must be advected conservatively",
            })
        }
        if density.diffusivity != 0.0 {
            return invalid(String::from("the density does not diffuse"))
        }
        for scalar in &self.scalars {
            if scalar.diffusivity < 0.0 {
                return invalid(format!("scalar '{}' has a negative diffusivity", scalar.name))
            }
            if scalar.diffusion == DiffusionForm::LaplacianOverRho && scalar.advection != AdvectionForm::Conservative {
                return Err(Error::InconsistentAdvectionForm {
                    name: scalar.name.clone(),
                    reason: "diffusing s / rho requires conservative advection",
                })
            }
        }

        if !self.scalar_update_order.is_empty() {
            let mut order = self.scalar_update_order.clone();
            order.sort_unstable();
            if order != (DENSITY + 1..self.num_state()).collect::<Vec<_>>() {
                return invalid(format!(
                    "scalar_update_order {:?} is not an ordering of the components {:?}",
                    self.scalar_update_order,
                    DENSITY + 1..self.num_state()))
            }
        }
        self.domain_bc.validate()
    }
}
