use std::f64::consts::PI;
use crate::index_space::Axis;
use crate::level::{DENSITY, NUM_VEL};




/**
 * The problem-specific data of a run: initial conditions, the values of
 * inflow boundaries, body forcing, and the source of the divergence
 * constraint. Positions are physical coordinates; state slices are laid out
 * `[u, v, rho, tracers...]`.
 */
pub trait Problem: Send + Sync {


    /**
     * Write the initial state at a cell center.
     */
    fn initial_state(&self, position: (f64, f64), state: &mut [f64]);


    /**
     * The value of component `comp` on an inflow (`ExtDir`) boundary, at a
     * point of the boundary face.
     */
    fn boundary_value(&self, _position: (f64, f64), _axis: Axis, _upper: bool, _comp: usize, _time: f64) -> f64 {
        0.0
    }


    /**
     * Add the body force per unit volume at a cell center to `force`, which
     * has one entry per state component. The default does nothing; a
     * gravitational acceleration configured separately is added by the
     * caller.
     */
    fn force(&self, _position: (f64, f64), _time: f64, _state: &[f64], _force: &mut [f64]) {}


    /**
     * The divergence constraint `div(u) = S` at a cell center. Only used
     * when the run enables it.
     */
    fn divu(&self, _position: (f64, f64), _time: f64) -> f64 {
        0.0
    }
}




/**
 * Uniform flow: constant velocity and density, and tracers equal to their
 * index.
 */
#[derive(Clone, Debug)]
pub struct UniformFlow {
    pub velocity: (f64, f64),
    pub density: f64,
}




// ============================================================================
impl Problem for UniformFlow {
    fn initial_state(&self, _position: (f64, f64), state: &mut [f64]) {
        state[0] = self.velocity.0;
        state[1] = self.velocity.1;
        state[DENSITY] = self.density;

        for (n, s) in state.iter_mut().enumerate().skip(NUM_VEL + 1) {
            *s = n as f64
        }
    }

    fn boundary_value(&self, _position: (f64, f64), _axis: Axis, _upper: bool, comp: usize, _time: f64) -> f64 {
        match comp {
            0 => self.velocity.0,
            1 => self.velocity.1,
            DENSITY => self.density,
            n => n as f64,
        }
    }
}




/**
 * The Taylor-Green vortex on the unit square,
 *
 * ```text
 * u =  A sin(2 pi x) cos(2 pi y)
 * v = -A cos(2 pi x) sin(2 pi y)
 * ```
 *
 * with uniform density and one tracer marking the left half of the domain.
 */
#[derive(Clone, Debug)]
pub struct TaylorGreen {
    pub amplitude: f64,
    pub density: f64,
}




// ============================================================================
impl Problem for TaylorGreen {
    fn initial_state(&self, (x, y): (f64, f64), state: &mut [f64]) {
        let a = self.amplitude;
        state[0] = a * (2.0 * PI * x).sin() * (2.0 * PI * y).cos();
        state[1] = -a * (2.0 * PI * x).cos() * (2.0 * PI * y).sin();
        state[DENSITY] = self.density;

        for s in state.iter_mut().skip(NUM_VEL + 1) {
            *s = if x < 0.5 { 1.0 } else { 0.0 }
        }
    }
}




// ============================================================================
#[cfg(test)]
mod test {

    use super::{Problem, TaylorGreen, UniformFlow};

    #[test]
    fn taylor_green_velocity_is_divergence_free_at_a_point() {
        let problem = TaylorGreen { amplitude: 1.0, density: 1.0 };
        let h = 1e-5;
        let at = |x, y| {
            let mut s = [0.0; 4];
            problem.initial_state((x, y), &mut s);
            s
        };
        let (x, y) = (0.3, 0.7);
        let dudx = (at(x + h, y)[0] - at(x - h, y)[0]) / (2.0 * h);
        let dvdy = (at(x, y + h)[1] - at(x, y - h)[1]) / (2.0 * h);
        assert!((dudx + dvdy).abs() < 1e-6);
        assert_eq!(at(x, y)[3], 1.0);
    }

    #[test]
    fn uniform_flow_fills_tracers_with_their_index() {
        let problem = UniformFlow { velocity: (1.0, -2.0), density: 3.0 };
        let mut s = [0.0; 5];
        problem.initial_state((0.5, 0.5), &mut s);
        assert_eq!(s, [1.0, -2.0, 3.0, 3.0, 4.0]);
    }
}
