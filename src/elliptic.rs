use serde::{Deserialize, Serialize};
use crate::error::{Error, Result};
use crate::index_space::{Axis, IndexSpace};
use crate::patch::Patch;




/**
 * Whether the unknowns of an elliptic problem live at cell centers or at
 * nodes (cell corners).
 */
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Centering {
    Cell,
    Node,
}




/**
 * The condition imposed on one side of the domain.
 *
 * - `Neumann`: zero normal gradient
 * - `Dirichlet`: the value on the boundary is read from the problem's
 *   exterior data (in the guard cell for cell-centered problems, at the
 *   boundary node for node-centered ones)
 * - `Homogeneous`: zero value on the boundary
 * - `Periodic`: the lattice wraps around
 */
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SideCondition {
    Neumann,
    Dirichlet,
    Homogeneous,
    Periodic,
}




/**
 * A variable-coefficient Helmholtz problem
 *
 * ```text
 * alpha phi - div(beta grad phi) = rhs
 * ```
 *
 * over the unknowns in `region` where `active` is nonzero. Neighbors which
 * are not unknowns (inactive indexes inside the domain, such as coarse-fine
 * boundaries) take fixed values from `exterior`, or zero if there is none.
 *
 * The link coefficient `beta[axis]` between indexes `k - e` and `k` is
 * stored at `k`, so it covers `region.faces(axis)`. For node-centered
 * problems the `domain` is the node lattice, excluding the upper node on
 * periodic axes, where it duplicates the lower one.
 */
pub struct EllipticProblem<'a> {
    pub centering: Centering,
    pub domain: IndexSpace,
    pub region: IndexSpace,
    pub active: &'a Patch,
    pub sides: [[SideCondition; 2]; 2],
    pub beta: [&'a Patch; 2],
    pub alpha: Option<&'a Patch>,
    pub exterior: Option<&'a Patch>,
    pub spacing: (f64, f64),
    pub rhs: &'a Patch,
    pub initial: Option<&'a Patch>,
}




/**
 * The outcome of an elliptic solve. A solver always returns its best
 * iterate; callers decide what an unconverged solve means.
 */
#[derive(Clone, Debug)]
pub struct SolveReport {
    pub solution: Patch,
    pub converged: bool,
    pub residual: f64,
    pub iterations: usize,
}




/**
 * Interface for the linear solvers used by the projections and the implicit
 * diffusion updates.
 */
pub trait EllipticSolver: Send + Sync {
    fn solve(&self, problem: &EllipticProblem) -> SolveReport;

    /// The iteration count at which the solver gives up.
    fn max_iterations(&self) -> usize;
}




/**
 * What lies across the link from an unknown.
 */
enum Link {
    Unknown((i64, i64)),
    Fixed(f64),
    Reflect { sign: f64, value: f64 },
    Open,
}




// ============================================================================
impl<'a> EllipticProblem<'a> {


    fn spacing(&self, axis: Axis) -> f64 {
        match axis {
            Axis::I => self.spacing.0,
            Axis::J => self.spacing.1,
        }
    }


    fn side(&self, axis: Axis, upper: bool) -> SideCondition {
        self.sides[axis.index()][upper as usize]
    }


    fn exterior_value(&self, index: (i64, i64)) -> f64 {
        match self.exterior {
            Some(e) if e.index_space().contains(index) => e.get(index, 0),
            _ => 0.0,
        }
    }


    /**
     * For node problems, the value a boundary node is pinned to, if it lies
     * on a Dirichlet-type side.
     */
    fn pinned(&self, index: (i64, i64)) -> Option<f64> {
        if self.centering != Centering::Node {
            return None
        }
        for axis in Axis::BOTH {
            let r = self.domain.range(axis);
            let k = axis.of(index);

            for (upper, edge) in [(false, r.start), (true, r.end - 1)] {
                if k == edge {
                    match self.side(axis, upper) {
                        SideCondition::Dirichlet => return Some(self.exterior_value(index)),
                        SideCondition::Homogeneous => return Some(0.0),
                        _ => {}
                    }
                }
            }
        }
        None
    }


    fn is_unknown(&self, index: (i64, i64)) -> bool {
        self.region.contains(index) && self.active.get(index, 0) > 0.5 && self.pinned(index).is_none()
    }


    fn link(&self, index: (i64, i64), axis: Axis, upper: bool) -> Link {
        let delta = if upper { 1 } else { -1 };
        let unwrapped = (index.0 + axis.offset(delta).0, index.1 + axis.offset(delta).1);
        let r = self.domain.range(axis);
        let k = axis.of(unwrapped);
        let mut wrapped = unwrapped;

        if !r.contains(&k) {
            match (self.side(axis, upper), self.centering) {
                (SideCondition::Periodic, _) => {
                    let w = r.start + (k - r.start).rem_euclid(r.end - r.start);
                    wrapped = match axis {
                        Axis::I => (w, unwrapped.1),
                        Axis::J => (unwrapped.0, w),
                    };
                }
                (SideCondition::Neumann, Centering::Cell) => return Link::Reflect { sign: 1.0, value: 0.0 },
                (SideCondition::Dirichlet, Centering::Cell) => {
                    return Link::Reflect { sign: -1.0, value: 2.0 * self.exterior_value(unwrapped) }
                }
                (SideCondition::Homogeneous, Centering::Cell) => return Link::Reflect { sign: -1.0, value: 0.0 },
                (_, Centering::Node) => return Link::Open,
            }
        }

        if self.is_unknown(wrapped) {
            Link::Unknown(wrapped)
        } else if let Some(value) = self.pinned(wrapped) {
            Link::Fixed(value)
        } else if self.exterior.map_or(false, |e| e.index_space().contains(unwrapped)) {
            Link::Fixed(self.exterior_value(unwrapped))
        } else {
            Link::Fixed(self.exterior_value(wrapped))
        }
    }


    fn beta(&self, index: (i64, i64), axis: Axis, upper: bool) -> f64 {
        let at = if upper { (index.0 + axis.offset(1).0, index.1 + axis.offset(1).1) } else { index };
        let h = self.spacing(axis);
        self.beta[axis.index()].get(at, 0) / (h * h)
    }


    fn alpha(&self, index: (i64, i64)) -> f64 {
        self.alpha.map_or(0.0, |a| a.get(index, 0))
    }


    /**
     * Apply the operator to `x` (indexed like `region`). With `constants`
     * false, fixed neighbor values are dropped, giving the linear part only.
     */
    fn apply(&self, x: &[f64], constants: bool) -> Vec<f64> {
        let mut out = vec![0.0; x.len()];
        let c = if constants { 1.0 } else { 0.0 };

        for index in self.region.iter() {
            if !self.is_unknown(index) {
                continue
            }
            let o = self.region.row_major_offset(index);
            let phi = x[o];
            let mut a = self.alpha(index) * phi;

            for axis in Axis::BOTH {
                for upper in [false, true] {
                    let b = self.beta(index, axis, upper);
                    a += match self.link(index, axis, upper) {
                        Link::Unknown(n) => b * (phi - x[self.region.row_major_offset(n)]),
                        Link::Fixed(g) => b * (phi - c * g),
                        Link::Reflect { sign, value } => b * ((1.0 - sign) * phi - c * value),
                        Link::Open => 0.0,
                    };
                }
            }
            out[o] = a;
        }
        out
    }


    fn diagonal(&self) -> Vec<f64> {
        let mut diag = vec![0.0; self.region.len()];

        for index in self.region.iter() {
            if !self.is_unknown(index) {
                continue
            }
            let mut d = self.alpha(index);

            for axis in Axis::BOTH {
                for upper in [false, true] {
                    let b = self.beta(index, axis, upper);
                    d += match self.link(index, axis, upper) {
                        Link::Unknown(_) | Link::Fixed(_) => b,
                        Link::Reflect { sign, .. } => b * (1.0 - sign),
                        Link::Open => 0.0,
                    };
                }
            }
            diag[self.region.row_major_offset(index)] = d;
        }
        diag
    }


    /**
     * True if the operator has a null space (constants): no absorption term
     * and no fixed value anywhere in the stencil of an unknown.
     */
    pub fn is_singular(&self) -> bool {
        if self.alpha.is_some() {
            return false
        }
        !self.region.iter().filter(|&k| self.is_unknown(k)).any(|k| {
            Axis::BOTH.iter().any(|&axis| {
                [false, true].iter().any(|&upper| match self.link(k, axis, upper) {
                    Link::Fixed(_) => true,
                    Link::Reflect { sign, .. } => sign < 0.0,
                    _ => false,
                })
            })
        })
    }


    fn unknown_mask(&self) -> Vec<bool> {
        self.region.iter().map(|k| self.is_unknown(k)).collect()
    }


    /**
     * Assemble the solution patch: unknowns from `x`, pinned nodes and
     * inactive indexes from their fixed values.
     */
    fn assemble(&self, x: &[f64]) -> Patch {
        Patch::from_scalar_function(self.rhs.level(), self.region.clone(), |index| {
            if self.is_unknown(index) {
                x[self.region.row_major_offset(index)]
            } else if let Some(value) = self.pinned(index) {
                value
            } else {
                self.exterior_value(index)
            }
        })
    }


    /**
     * Return the solution over `region.extend_all(1)`, with the guard layer
     * filled the way the operator sees it: periodic wrap, reflection at
     * physical sides, and exterior data elsewhere. Gradients of the
     * potential across any face of the region can be read from the result.
     */
    pub fn extended_solution(&self, solution: &Patch) -> Patch {
        let grown = self.region.extend_all(1);

        Patch::from_scalar_function(solution.level(), grown, |index| {
            if self.region.contains(index) {
                return solution.get(index, 0)
            }
            // Guard index: find an adjacent region index to reflect about.
            for axis in Axis::BOTH {
                for upper in [false, true] {
                    let delta = if upper { -1 } else { 1 };
                    let inner = (index.0 + axis.offset(delta).0, index.1 + axis.offset(delta).1);
                    let r = self.domain.range(axis);
                    let k = axis.of(index);

                    if !self.region.contains(inner) || r.contains(&k) {
                        continue
                    }
                    let phi = solution.get(inner, 0);
                    let mirror = (index.0 + 2 * axis.offset(delta).0, index.1 + 2 * axis.offset(delta).1);
                    let beyond = if self.region.contains(mirror) { solution.get(mirror, 0) } else { phi };

                    let value = match (self.side(axis, upper), self.centering) {
                        (SideCondition::Periodic, _) => None,
                        (SideCondition::Neumann, Centering::Cell) => Some(phi),
                        (SideCondition::Dirichlet, Centering::Cell) => Some(2.0 * self.exterior_value(index) - phi),
                        (SideCondition::Homogeneous, Centering::Cell) => Some(-phi),
                        (SideCondition::Neumann, Centering::Node) => Some(beyond),
                        (_, Centering::Node) => Some(2.0 * phi - beyond),
                    };
                    if let Some(value) = value {
                        return value
                    }
                }
            }
            let mut wrapped = index;
            for axis in Axis::BOTH {
                let r = self.domain.range(axis);
                let k = axis.of(wrapped);
                if !r.contains(&k) && self.side(axis, false) == SideCondition::Periodic {
                    let w = r.start + (k - r.start).rem_euclid(r.end - r.start);
                    wrapped = match axis {
                        Axis::I => (w, wrapped.1),
                        Axis::J => (wrapped.0, w),
                    };
                }
            }
            if self.region.contains(wrapped) && (self.is_unknown(wrapped) || self.pinned(wrapped).is_some()) {
                solution.get(wrapped, 0)
            } else {
                self.exterior_value(index)
            }
        })
    }
}




/**
 * Solve a problem, logging the solver's effort, and report non-convergence
 * as an error naming the operation.
 */
pub fn checked_solve(
    solver: &dyn EllipticSolver,
    problem: &EllipticProblem,
    operation: &'static str,
    level: usize,
    time: f64,
) -> Result<SolveReport> {
    let report = solver.solve(problem);

    log::debug!(
        "{} on level {}: {} iterations, residual {:.3e}",
        operation,
        level,
        report.iterations,
        report.residual);

    if report.converged && report.iterations * 10 >= solver.max_iterations() * 9 {
        log::warn!("{} on level {} needed {} of {} iterations", operation, level, report.iterations, solver.max_iterations())
    }
    if report.converged {
        Ok(report)
    } else {
        Err(Error::SolveFailed {
            operation,
            level,
            time,
            residual: report.residual,
            iterations: report.iterations,
        })
    }
}




/**
 * Jacobi-preconditioned conjugate gradient. Convergence is declared when the
 * max-norm of the residual falls below `max(tolerance * |rhs|, abs_tolerance)`.
 * Singular problems are made solvable by removing the mean of the right hand
 * side, and the solution is normalized to zero mean.
 */
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConjugateGradient {
    pub tolerance: f64,
    pub abs_tolerance: f64,
    pub max_iterations: usize,
}




// ============================================================================
impl Default for ConjugateGradient {
    fn default() -> Self {
        Self { tolerance: 1e-10, abs_tolerance: 1e-14, max_iterations: 2000 }
    }
}




// ============================================================================
impl EllipticSolver for ConjugateGradient {

    fn max_iterations(&self) -> usize {
        self.max_iterations
    }

    fn solve(&self, problem: &EllipticProblem) -> SolveReport {
        let n = problem.region.len();
        let mask = problem.unknown_mask();
        let singular = problem.is_singular();

        let offset = problem.apply(&vec![0.0; n], true);
        let mut b: Vec<f64> = problem
            .region
            .iter()
            .zip(&offset)
            .zip(&mask)
            .map(|((k, c), &m)| if m { problem.rhs.get(k, 0) - c } else { 0.0 })
            .collect();

        if singular {
            remove_mean(&mut b, &mask)
        }

        let mut x: Vec<f64> = problem
            .region
            .iter()
            .zip(&mask)
            .map(|(k, &m)| match problem.initial {
                Some(init) if m && init.index_space().contains(k) => init.get(k, 0),
                _ => 0.0,
            })
            .collect();

        let diag: Vec<f64> = problem
            .diagonal()
            .into_iter()
            .map(|d| if d > 0.0 { 1.0 / d } else { 1.0 })
            .collect();

        let tolerance = (self.tolerance * max_norm(&b)).max(self.abs_tolerance);
        let ax = problem.apply(&x, false);
        let mut r: Vec<f64> = b.iter().zip(&ax).map(|(b, a)| b - a).collect();
        let mut z: Vec<f64> = r.iter().zip(&diag).map(|(r, d)| r * d).collect();
        let mut p = z.clone();
        let mut rz = dot(&r, &z);
        let mut residual = max_norm(&r);
        let mut iterations = 0;

        while residual > tolerance && iterations < self.max_iterations {
            let q = problem.apply(&p, false);
            let pq = dot(&p, &q);

            if pq <= 0.0 {
                break
            }
            let a = rz / pq;

            for i in 0..n {
                x[i] += a * p[i];
                r[i] -= a * q[i];
            }
            for i in 0..n {
                z[i] = r[i] * diag[i];
            }
            let rz_new = dot(&r, &z);

            for i in 0..n {
                p[i] = z[i] + (rz_new / rz) * p[i];
            }
            rz = rz_new;
            residual = max_norm(&r);
            iterations += 1;
        }

        if singular {
            remove_mean(&mut x, &mask)
        }

        SolveReport {
            solution: problem.assemble(&x),
            converged: residual <= tolerance,
            residual,
            iterations,
        }
    }
}




// ============================================================================
fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(a, b)| a * b).sum()
}

fn max_norm(a: &[f64]) -> f64 {
    a.iter().fold(0.0, |m, x| f64::max(m, x.abs()))
}

fn remove_mean(x: &mut [f64], mask: &[bool]) {
    let count = mask.iter().filter(|&&m| m).count();

    if count > 0 {
        let mean = x.iter().zip(mask).filter(|(_, &m)| m).map(|(x, _)| x).sum::<f64>() / count as f64;
        for (x, &m) in x.iter_mut().zip(mask) {
            if m {
                *x -= mean
            }
        }
    }
}




/**
 * Build the cell-centered face coefficients `1 / rho`, averaging density
 * arithmetically onto the faces of `region`. The density patch must cover
 * `region` grown by one cell.
 */
pub fn inverse_density_faces(rho: &Patch, region: &IndexSpace) -> [Patch; 2] {
    let faces = |axis: Axis| {
        Patch::from_scalar_function(rho.level(), region.faces(axis), |f| {
            let (di, dj) = axis.offset(-1);
            2.0 / (rho.get((f.0 + di, f.1 + dj), 0) + rho.get(f, 0))
        })
    };
    [faces(Axis::I), faces(Axis::J)]
}




/**
 * Build node-lattice link coefficients `1 / rho` for a node-centered
 * problem over the node `region`. The link between nodes `k - e` and `k`
 * is shared by the two cells on either side of it; their inverse densities
 * are averaged. The density patch must cover the cells adjacent to every
 * link.
 */
pub fn inverse_density_links(rho: &Patch, region: &IndexSpace) -> [Patch; 2] {
    let links = |axis: Axis| {
        Patch::from_scalar_function(rho.level(), region.faces(axis), |(i, j)| {
            let (a, b) = match axis {
                Axis::I => ((i - 1, j - 1), (i - 1, j)),
                Axis::J => ((i - 1, j - 1), (i, j - 1)),
            };
            let space = rho.index_space();
            let inv = |c: (i64, i64)| if space.contains(c) { Some(1.0 / rho.get(c, 0)) } else { None };

            match (inv(a), inv(b)) {
                (Some(x), Some(y)) => 0.5 * (x + y),
                (Some(x), None) | (None, Some(x)) => x,
                (None, None) => 1.0,
            }
        })
    };
    [links(Axis::I), links(Axis::J)]
}




// ============================================================================
#[cfg(test)]
mod test {

    use super::{Centering, ConjugateGradient, EllipticProblem, EllipticSolver, SideCondition};
    use crate::index_space::{range2d, Axis, IndexSpace};
    use crate::patch::Patch;

    fn unit_faces(region: &IndexSpace) -> [Patch; 2] {
        [
            Patch::constant(0, 1, region.faces(Axis::I), 1.0),
            Patch::constant(0, 1, region.faces(Axis::J), 1.0),
        ]
    }

    #[test]
    fn periodic_poisson_recovers_a_sine_mode() {
        let n = 16;
        let h = 1.0 / n as f64;
        let region = range2d(0..n, 0..n);
        let k = 2.0 * std::f64::consts::PI;
        let exact = |(i, _j): (i64, i64)| f64::sin(k * (i as f64 + 0.5) * h);

        // discrete eigenvalue of the 1D periodic Laplacian
        let lambda = (2.0 - 2.0 * f64::cos(k * h)) / (h * h);
        let rhs = Patch::from_scalar_function(0, region.clone(), |index| lambda * exact(index));
        let active = Patch::constant(0, 1, region.clone(), 1.0);
        let beta = unit_faces(&region);

        let problem = EllipticProblem {
            centering: Centering::Cell,
            domain: region.clone(),
            region: region.clone(),
            active: &active,
            sides: [[SideCondition::Periodic; 2]; 2],
            beta: [&beta[0], &beta[1]],
            alpha: None,
            exterior: None,
            spacing: (h, h),
            rhs: &rhs,
            initial: None,
        };
        assert!(problem.is_singular());

        let report = ConjugateGradient::default().solve(&problem);
        assert!(report.converged);

        for index in region.iter() {
            assert!((report.solution.get(index, 0) - exact(index)).abs() < 1e-8);
        }
    }

    #[test]
    fn dirichlet_exterior_data_is_honored() {
        let n = 8;
        let h = 1.0 / n as f64;
        let region = range2d(0..n, 0..n);
        let active = Patch::constant(0, 1, region.clone(), 1.0);
        let rhs = Patch::zeros(0, 1, region.clone());
        let exterior = Patch::constant(0, 1, region.extend_all(1), 3.0);
        let beta = unit_faces(&region);

        let problem = EllipticProblem {
            centering: Centering::Cell,
            domain: region.clone(),
            region: region.clone(),
            active: &active,
            sides: [[SideCondition::Dirichlet; 2]; 2],
            beta: [&beta[0], &beta[1]],
            alpha: None,
            exterior: Some(&exterior),
            spacing: (h, h),
            rhs: &rhs,
            initial: None,
        };
        assert!(!problem.is_singular());

        let report = ConjugateGradient::default().solve(&problem);
        assert!(report.converged);
        assert!(report.solution.iter_data().all(|s| (s[0] - 3.0).abs() < 1e-9));

        let extended = problem.extended_solution(&report.solution);
        assert!((extended.get((-1, 3), 0) - 3.0).abs() < 1e-9);
    }

    #[test]
    fn node_problem_pins_homogeneous_boundary_nodes() {
        let n = 8;
        let h = 1.0 / n as f64;
        let cells = range2d(0..n, 0..n);
        let region = cells.nodes();
        let active = Patch::constant(0, 1, region.clone(), 1.0);
        let rhs = Patch::constant(0, 1, region.clone(), 1.0);
        let beta = unit_faces(&region);

        let problem = EllipticProblem {
            centering: Centering::Node,
            domain: region.clone(),
            region: region.clone(),
            active: &active,
            sides: [[SideCondition::Homogeneous; 2]; 2],
            beta: [&beta[0], &beta[1]],
            alpha: None,
            exterior: None,
            spacing: (h, h),
            rhs: &rhs,
            initial: None,
        };
        let report = ConjugateGradient::default().solve(&problem);
        assert!(report.converged);
        assert_eq!(report.solution.get((0, 3), 0), 0.0);
        assert_eq!(report.solution.get((8, 8), 0), 0.0);
        assert!(report.solution.get((4, 4), 0) > 0.0);
    }

    #[test]
    fn unconverged_solves_are_reported() {
        let n = 16;
        let region = range2d(0..n, 0..n);
        let active = Patch::constant(0, 1, region.clone(), 1.0);
        let rhs = Patch::from_scalar_function(0, region.clone(), |(i, j)| ((i * 7 + j * 3) % 5) as f64 - 2.0);
        let beta = unit_faces(&region);
        let problem = EllipticProblem {
            centering: Centering::Cell,
            domain: region.clone(),
            region: region.clone(),
            active: &active,
            sides: [[SideCondition::Homogeneous; 2]; 2],
            beta: [&beta[0], &beta[1]],
            alpha: None,
            exterior: None,
            spacing: (1.0, 1.0),
            rhs: &rhs,
            initial: None,
        };
        let solver = ConjugateGradient { max_iterations: 2, ..ConjugateGradient::default() };
        let report = solver.solve(&problem);
        assert!(!report.converged);
        assert_eq!(report.iterations, 2);
    }
}
