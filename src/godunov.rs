use serde::{Deserialize, Serialize};
use crate::boundary::BcCode;
use crate::index_space::{shift, Axis, IndexSpace};
use crate::patch::{FieldView, Patch};

/// Velocities (and state values before tracing) smaller than this are
/// treated as zero.
pub const SMALL_VEL: f64 = 1e-20;

/// Fill codes for one field: `[axis][lo, hi]`.
pub type FieldBc = [[BcCode; 2]; 2];

/// Selects the reconstruction used to trace cell data to faces.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchemeKind {
    /// Piecewise linear reconstruction. `slope_order` 1 is donor cell (no
    /// slopes), 2 is the monotonized central limiter, and 4 is the limited
    /// fourth-order slope.
    PiecewiseLinear { slope_order: u8 },

    /// Piecewise parabolic reconstruction with Colella-Woodward limiting.
    PiecewiseParabolic,
}

impl Default for SchemeKind {
    fn default() -> Self {
        SchemeKind::PiecewiseLinear { slope_order: 4 }
    }
}

impl SchemeKind {
    /// Construct the scheme once, for the lifetime of a run.
    pub fn build(self) -> Box<dyn AdvectionScheme> {
        match self {
            SchemeKind::PiecewiseLinear { slope_order } => Box::new(PiecewiseLinear { slope_order }),
            SchemeKind::PiecewiseParabolic => Box::new(PiecewiseParabolic),
        }
    }
}

/// How the face value is chosen from the traced left and right states.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Upwind {
    /// By the sign of the transport velocity on the face.
    Transport,

    /// For velocity prediction: the normal component is upwinded by its own
    /// traced states, tangential components by the transport velocity.
    SelfNormal,
}

/// Everything the face-state computation needs on one patch. The state and
/// forcing are ghost-filled cell data; face states are produced on the faces
/// of `valid.extend_all(face_grow)`. The transport velocities must cover the
/// faces of that box grown by one more cell, and the state must cover it
/// grown by three.
///
pub struct TraceInput<'a> {
    pub valid: &'a IndexSpace,
    pub face_grow: i64,
    pub domain: &'a IndexSpace,
    pub spacing: (f64, f64),
    pub dt: f64,
    pub state: FieldView<'a>,
    pub forcing: Option<FieldView<'a>>,
    pub transport: [&'a Patch; 2],
    pub bc: &'a [FieldBc],
    pub corner_couple: bool,
    pub forces_in_trans: bool,
}

/// Strategy for reconstructing cell data and tracing it to the faces at the
/// half time level. Implementors provide the one-dimensional reconstruction;
/// the directionally unsplit tracing, transverse corrections, upwinding, and
/// boundary treatment are shared.
///
pub trait AdvectionScheme: Send + Sync {
    /// Given five consecutive cell values centered on a cell, and the
    /// Courant numbers `u dt / dx` on its lower and upper faces, return the
    /// values traced to the lower and upper faces at the half time.
    fn edge_values(&self, s: &[f64; 5], nu_lo: f64, nu_hi: f64) -> (f64, f64);

    /// Whether transverse (corner coupling) corrections are applied.
    fn uses_transverse(&self, corner_couple: bool) -> bool {
        corner_couple
    }

    /// Compute multi-component face states on the faces normal to each axis.
    fn compute_face_states(&self, input: &TraceInput, upwind: Upwind) -> [Patch; 2] {
        trace_face_states(self, input, upwind)
    }
}

/// Piecewise linear method.
///
#[derive(Clone, Copy, Debug)]
pub struct PiecewiseLinear {
    pub slope_order: u8,
}

/// Piecewise parabolic method.
///
#[derive(Clone, Copy, Debug)]
pub struct PiecewiseParabolic;

impl AdvectionScheme for PiecewiseLinear {
    fn edge_values(&self, s: &[f64; 5], nu_lo: f64, nu_hi: f64) -> (f64, f64) {
        let slope = limited_slope(self.slope_order, s);
        let lo = s[2] - 0.5 * (1.0 + nu_lo) * slope;
        let hi = s[2] + 0.5 * (1.0 - nu_hi) * slope;
        (lo, hi)
    }

    fn uses_transverse(&self, _corner_couple: bool) -> bool {
        true
    }
}

impl AdvectionScheme for PiecewiseParabolic {
    fn edge_values(&self, s: &[f64; 5], nu_lo: f64, nu_hi: f64) -> (f64, f64) {
        let s0 = s[2];
        let mut sm = face_value(s[0], s[1], s[2], s[3]);
        let mut sp = face_value(s[1], s[2], s[3], s[4]);

        if (sp - s0) * (s0 - sm) <= 0.0 {
            sp = s0;
            sm = s0;
        } else {
            let ds = sp - sm;
            let curvature = ds * (s0 - 0.5 * (sm + sp));

            if curvature > ds * ds / 6.0 {
                sm = 3.0 * s0 - 2.0 * sp;
            } else if -ds * ds / 6.0 > curvature {
                sp = 3.0 * s0 - 2.0 * sm;
            }
        }

        let ds = sp - sm;
        let s6 = 6.0 * s0 - 3.0 * (sm + sp);

        let hi = if nu_hi > 0.0 {
            sp - 0.5 * nu_hi * (ds - (1.0 - 2.0 / 3.0 * nu_hi) * s6)
        } else {
            sp
        };
        let lo = if nu_lo < 0.0 {
            let a = -nu_lo;
            sm + 0.5 * a * (ds + (1.0 - 2.0 / 3.0 * a) * s6)
        } else {
            sm
        };
        (lo, hi)
    }
}

/// Monotonized central slope of the middle value.
fn mc_slope(sm: f64, s0: f64, sp: f64) -> f64 {
    let dl = s0 - sm;
    let dr = sp - s0;

    if dl * dr <= 0.0 {
        0.0
    } else {
        let dc = 0.5 * (sp - sm);
        dc.signum() * dc.abs().min(2.0 * dl.abs()).min(2.0 * dr.abs())
    }
}

/// Limited slope of the center cell of a five-point stencil.
fn limited_slope(order: u8, s: &[f64; 5]) -> f64 {
    match order {
        1 => 0.0,
        2 => mc_slope(s[1], s[2], s[3]),
        _ => {
            let dl = s[2] - s[1];
            let dr = s[3] - s[2];

            if dl * dr <= 0.0 {
                0.0
            } else {
                let dc = 0.5 * (s[3] - s[1]);
                let d4 = 4.0 / 3.0 * dc - (mc_slope(s[2], s[3], s[4]) + mc_slope(s[0], s[1], s[2])) / 6.0;
                dc.signum() * d4.abs().min(2.0 * dl.abs()).min(2.0 * dr.abs())
            }
        }
    }
}

/// Fourth-order interpolant on the face between `a` and `b`, built from
/// limited slopes.
fn face_value(am: f64, a: f64, b: f64, bp: f64) -> f64 {
    a + 0.5 * (b - a) - (mc_slope(a, b, bp) - mc_slope(am, a, b)) / 6.0
}

/// Choose between left and right states by the sign of `u`, averaging when
/// the velocity is below `SMALL_VEL`.
pub fn upwind_by(u: f64, sl: f64, sr: f64) -> f64 {
    if u > SMALL_VEL {
        sl
    } else if u < -SMALL_VEL {
        sr
    } else {
        0.5 * (sl + sr)
    }
}

/// Choose between left and right states of a velocity traced against
/// itself: a fan or shock moving through the face takes the upwind state,
/// and diverging or converging states average.
pub fn upwind_self(sl: f64, sr: f64) -> f64 {
    if sl >= 0.0 && sr >= 0.0 {
        sl
    } else if sl <= 0.0 && sr <= 0.0 {
        sr
    } else {
        0.5 * (sl + sr)
    }
}

/// Override the face value of field `n` on a physical domain face. External
/// Dirichlet data is read from the first guard cell, extrapolating and even
/// codes take the interior traced state, and odd codes give zero.
fn physical_face(
    domain: &IndexSpace,
    bc: &[FieldBc],
    state: &FieldView,
    face: (i64, i64),
    axis: Axis,
    n: usize,
    sl: f64,
    sr: f64,
    value: f64,
) -> f64 {
    let k = axis.of(face);
    let r = domain.range(axis);
    let codes = bc[n][axis.index()];

    if k == r.start {
        match codes[0] {
            BcCode::Interior => value,
            BcCode::ExtDir => state.get(shift(face, axis.offset(-1)), n),
            BcCode::FoExtrap | BcCode::ReflectEven => sr,
            BcCode::ReflectOdd => 0.0,
        }
    } else if k == r.end {
        match codes[1] {
            BcCode::Interior => value,
            BcCode::ExtDir => state.get(face, n),
            BcCode::FoExtrap | BcCode::ReflectEven => sl,
            BcCode::ReflectOdd => 0.0,
        }
    } else {
        value
    }
}

fn trace_face_states<S: AdvectionScheme + ?Sized>(scheme: &S, input: &TraceInput, upwind: Upwind) -> [Patch; 2] {
    let nf = input.state.num_fields();
    let target = input.valid.extend_all(input.face_grow);
    let region = target.extend_all(1);
    let level = input.state.level();
    let dt = input.dt;
    let h = |axis: Axis| match axis {
        Axis::I => input.spacing.0,
        Axis::J => input.spacing.1,
    };
    let force = |c: (i64, i64), n: usize| input.forcing.map_or(0.0, |f| f.get(c, n));
    let transverse = scheme.uses_transverse(input.corner_couple);

    // Traced (lo, hi) values for every cell in the region, along each axis.
    let traces = Axis::BOTH.map(|axis| {
        let transport = input.transport[axis.index()];
        let courant = dt / h(axis);

        Patch::from_slice_function(level, region.clone(), 2 * nf, |c, out| {
            let nu_lo = transport.get(c, 0) * courant;
            let nu_hi = transport.get(shift(c, axis.offset(1)), 0) * courant;

            for n in 0..nf {
                let s = [-2, -1, 0, 1, 2].map(|d| input.state.get_along(c, axis, d, n));
                let (lo, hi) = scheme.edge_values(&s, nu_lo, nu_hi);
                out[2 * n] = lo;
                out[2 * n + 1] = hi;
            }
        })
    });

    // One-dimensional upwinded states on interior faces of the region, used
    // for the transverse derivatives.
    let predictor = Axis::BOTH.map(|axis| {
        let transport = input.transport[axis.index()];
        let trace = &traces[axis.index()];
        let faces = if transverse { region.trim_lower(1, axis) } else { IndexSpace::new(0..0, 0..0) };

        Patch::from_slice_function(level, faces, nf, |f, out| {
            let l = shift(f, axis.offset(-1));
            let u = transport.get(f, 0);

            for n in 0..nf {
                let mut sl = trace.get(l, 2 * n + 1);
                let mut sr = trace.get(f, 2 * n);

                if input.forces_in_trans {
                    sl += 0.5 * dt * force(l, n);
                    sr += 0.5 * dt * force(f, n);
                }
                let value = upwind_by(u, sl, sr);
                out[n] = physical_face(input.domain, input.bc, &input.state, f, axis, n, sl, sr, value);
            }
        })
    });

    Axis::BOTH.map(|axis| {
        let t = axis.other();
        let transport = input.transport[axis.index()];
        let tvel = input.transport[t.index()];
        let trace = &traces[axis.index()];
        let tpred = &predictor[t.index()];
        let ht = h(t);

        let tr = |c: (i64, i64), n: usize| {
            if transverse {
                let up = shift(c, t.offset(1));
                let vt = 0.5 * (tvel.get(c, 0) + tvel.get(up, 0));
                vt * (tpred.get(up, n) - tpred.get(c, n)) / ht
            } else {
                0.0
            }
        };

        Patch::from_slice_function(level, target.faces(axis), nf, |f, out| {
            let l = shift(f, axis.offset(-1));
            let u = transport.get(f, 0);

            for n in 0..nf {
                let sl = trace.get(l, 2 * n + 1) - 0.5 * dt * tr(l, n) + 0.5 * dt * force(l, n);
                let sr = trace.get(f, 2 * n) - 0.5 * dt * tr(f, n) + 0.5 * dt * force(f, n);

                let value = match upwind {
                    Upwind::SelfNormal if n == axis.index() => upwind_self(sl, sr),
                    _ => upwind_by(u, sl, sr),
                };
                out[n] = physical_face(input.domain, input.bc, &input.state, f, axis, n, sl, sr, value);
            }
        })
    })
}

/// Predict the normal velocity at the half time on the faces of
/// `valid.extend_all(1)` (the MAC velocity before projection). The two-field
/// `velocity` view must be ghost-filled to at least four cells. Provisional
/// transport velocities, from first-order upwinding of the cell data, carry
/// the transverse terms.
///
pub fn predict_velocity(
    scheme: &dyn AdvectionScheme,
    valid: &IndexSpace,
    domain: &IndexSpace,
    spacing: (f64, f64),
    dt: f64,
    velocity: FieldView,
    forcing: Option<FieldView>,
    bc: &[FieldBc],
    corner_couple: bool,
    forces_in_trans: bool,
) -> [Patch; 2] {
    let grown = valid.extend_all(2);
    let level = velocity.level();

    let provisional = Axis::BOTH.map(|axis| {
        let n = axis.index();

        Patch::from_scalar_function(level, grown.faces(axis), |f| {
            let ul = velocity.get(shift(f, axis.offset(-1)), n);
            let ur = velocity.get(f, n);
            physical_face(domain, bc, &velocity, f, axis, n, ul, ur, upwind_self(ul, ur))
        })
    });

    let input = TraceInput {
        valid,
        face_grow: 1,
        domain,
        spacing,
        dt,
        state: velocity,
        forcing,
        transport: [&provisional[0], &provisional[1]],
        bc,
        corner_couple,
        forces_in_trans,
    };
    let states = scheme.compute_face_states(&input, Upwind::SelfNormal);
    [states[0].field(0), states[1].field(1)]
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::index_space::range2d;

    fn periodic_bc(n: usize) -> Vec<FieldBc> {
        vec![[[BcCode::Interior; 2]; 2]; n]
    }

    fn uniform_transport(valid: &IndexSpace, u: f64, v: f64) -> [Patch; 2] {
        let grown = valid.extend_all(2);
        [
            Patch::constant(0, 1, grown.faces(Axis::I), u),
            Patch::constant(0, 1, grown.faces(Axis::J), v),
        ]
    }

    #[test]
    fn slopes_are_exact_for_linear_data_and_vanish_at_extrema() {
        let linear = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(limited_slope(2, &linear), 1.0);
        assert!((limited_slope(4, &linear) - 1.0).abs() < 1e-14);
        assert_eq!(limited_slope(1, &linear), 0.0);
        assert_eq!(limited_slope(4, &[0.0, 1.0, 2.0, 1.0, 0.0]), 0.0);
    }

    #[test]
    fn parabolic_traces_of_linear_data_match_linear_traces() {
        let s = [1.0, 2.0, 3.0, 4.0, 5.0];
        let (lo, hi) = PiecewiseParabolic.edge_values(&s, 0.4, 0.4);
        let (plo, phi) = PiecewiseLinear { slope_order: 2 }.edge_values(&s, 0.4, 0.4);
        assert!((hi - phi).abs() < 1e-12);
        assert!((lo - 2.5).abs() < 1e-12 && plo < lo);
    }

    #[test]
    fn constant_state_gives_constant_face_states() {
        let valid = range2d(0..6, 0..6);
        let state = Patch::constant(0, 2, valid.extend_all(4), 1.5);
        let transport = uniform_transport(&valid, 0.3, -0.2);
        let bc = periodic_bc(2);

        for kind in [SchemeKind::PiecewiseLinear { slope_order: 4 }, SchemeKind::PiecewiseParabolic] {
            let input = TraceInput {
                valid: &valid,
                face_grow: 0,
                domain: &valid,
                spacing: (0.1, 0.1),
                dt: 0.05,
                state: state.view_all(),
                forcing: None,
                transport: [&transport[0], &transport[1]],
                bc: &bc,
                corner_couple: true,
                forces_in_trans: false,
            };
            let faces = kind.build().compute_face_states(&input, Upwind::Transport);
            assert!(faces[0].iter_data().all(|s| (s[0] - 1.5).abs() < 1e-14 && (s[1] - 1.5).abs() < 1e-14));
            assert_eq!(faces[1].index_space(), &valid.faces(Axis::J));
        }
    }

    #[test]
    fn positive_flow_takes_the_left_trace() {
        let valid = range2d(0..8, 0..4);
        let state = Patch::from_scalar_function(0, valid.extend_all(4), |(i, _)| i as f64);
        let transport = uniform_transport(&valid, 1.0, 0.0);
        let bc = periodic_bc(1);
        let input = TraceInput {
            valid: &valid,
            face_grow: 0,
            domain: &range2d(-100..100, -100..100),
            spacing: (1.0, 1.0),
            dt: 0.5,
            state: state.view_all(),
            forcing: None,
            transport: [&transport[0], &transport[1]],
            bc: &bc,
            corner_couple: true,
            forces_in_trans: false,
        };
        let faces = PiecewiseLinear { slope_order: 2 }.compute_face_states(&input, Upwind::Transport);

        // cell 3 traced to its upper face with Courant number 1/2
        assert!((faces[0].get((4, 1), 0) - 3.25).abs() < 1e-14);
    }

    #[test]
    fn stagnation_and_walls_are_handled_on_velocity_prediction() {
        let valid = range2d(0..4, 0..4);
        let velocity = Patch::from_slice_function(0, valid.extend_all(4), 2, |(i, _), s| {
            s[0] = if i < 2 { -1.0 } else { 1.0 };
            s[1] = 0.0;
        });
        let wall = [[BcCode::ReflectOdd; 2]; 2];
        let bc = vec![wall, wall];
        let umac = predict_velocity(
            &PiecewiseLinear { slope_order: 1 },
            &valid,
            &valid,
            (1.0, 1.0),
            0.1,
            velocity.view_all(),
            None,
            &bc,
            true,
            false,
        );
        assert_eq!(umac[0].index_space(), &valid.extend_all(1).faces(Axis::I));

        // diverging states average to zero
        assert_eq!(umac[0].get((2, 1), 0), 0.0);

        // no flow through the walls
        assert_eq!(umac[0].get((0, 1), 0), 0.0);
        assert_eq!(umac[0].get((4, 1), 0), 0.0);
        assert_eq!(umac[1].get((1, 0), 0), 0.0);
    }
}
