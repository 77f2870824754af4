use serde::{Deserialize, Serialize};
use crate::elliptic::SideCondition;
use crate::error::{Error, Result};
use crate::index_space::{Axis, IndexSpace};
use crate::level::NUM_VEL;
use crate::patch::Patch;




/**
 * The physical boundary type on one side of the domain.
 */
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PhysBc {
    Interior,
    Inflow,
    Outflow,
    SlipWall,
    NoSlipWall,
    Symmetry,
}




/**
 * How the guard zones of one state component are filled at a physical
 * boundary. `ExtDir` reads user-supplied boundary data; the reflecting codes
 * mirror the interior about the boundary face, negating for `ReflectOdd`.
 */
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BcCode {
    Interior,
    ExtDir,
    FoExtrap,
    ReflectEven,
    ReflectOdd,
}




// ============================================================================
impl BcCode {

    /**
     * The condition an implicit solve for this component should use on the
     * same side.
     */
    pub fn solver_condition(self) -> SideCondition {
        match self {
            BcCode::Interior => SideCondition::Periodic,
            BcCode::ExtDir => SideCondition::Dirichlet,
            BcCode::ReflectOdd => SideCondition::Homogeneous,
            BcCode::FoExtrap | BcCode::ReflectEven => SideCondition::Neumann,
        }
    }
}




/**
 * Physical boundary types for the four sides of a two-dimensional domain.
 * An axis is periodic when both of its sides are `Interior`.
 */
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainBc {
    pub lo: [PhysBc; 2],
    pub hi: [PhysBc; 2],
}




// ============================================================================
impl Default for DomainBc {
    fn default() -> Self {
        Self::periodic()
    }
}




// ============================================================================
impl DomainBc {


    pub fn periodic() -> Self {
        Self { lo: [PhysBc::Interior; 2], hi: [PhysBc::Interior; 2] }
    }


    /**
     * A closed box: no-slip walls on every side.
     */
    pub fn closed() -> Self {
        Self { lo: [PhysBc::NoSlipWall; 2], hi: [PhysBc::NoSlipWall; 2] }
    }


    pub fn side(&self, axis: Axis, upper: bool) -> PhysBc {
        if upper {
            self.hi[axis.index()]
        } else {
            self.lo[axis.index()]
        }
    }


    pub fn is_periodic(&self, axis: Axis) -> bool {
        self.side(axis, false) == PhysBc::Interior
    }


    pub fn periodicity(&self) -> [bool; 2] {
        [self.is_periodic(Axis::I), self.is_periodic(Axis::J)]
    }


    /**
     * Check that every side has a physical condition, or that it pairs with
     * an interior (periodic) partner.
     */
    pub fn validate(&self) -> Result<()> {
        for axis in Axis::BOTH {
            let lo = self.side(axis, false);
            let hi = self.side(axis, true);

            if (lo == PhysBc::Interior) != (hi == PhysBc::Interior) {
                return Err(Error::MissingBoundaryCondition(format!(
                    "axis {:?} is periodic on one side only ({:?}, {:?})", axis, lo, hi)))
            }
        }
        Ok(())
    }


    /**
     * The fill code for state component `comp` on one side. Velocity
     * components are distinguished as normal or tangential to the side.
     */
    pub fn code(&self, axis: Axis, upper: bool, comp: usize) -> BcCode {
        let normal = comp == axis.index();
        let velocity = comp < NUM_VEL;

        match self.side(axis, upper) {
            PhysBc::Interior => BcCode::Interior,
            PhysBc::Inflow => BcCode::ExtDir,
            PhysBc::Outflow => BcCode::FoExtrap,
            PhysBc::SlipWall | PhysBc::Symmetry => {
                if velocity && normal {
                    BcCode::ReflectOdd
                } else {
                    BcCode::ReflectEven
                }
            }
            PhysBc::NoSlipWall => {
                if velocity {
                    BcCode::ReflectOdd
                } else {
                    BcCode::ReflectEven
                }
            }
        }
    }


    /**
     * The fill codes of component `comp` on every side, `[axis][lo, hi]`.
     */
    pub fn component(&self, comp: usize) -> [[BcCode; 2]; 2] {
        let mut codes = [[BcCode::Interior; 2]; 2];
        for axis in Axis::BOTH {
            codes[axis.index()] = [self.code(axis, false, comp), self.code(axis, true, comp)];
        }
        codes
    }


    /**
     * The side conditions for a pressure-like potential: homogeneous
     * Dirichlet at outflow, Neumann at walls and inflow.
     */
    pub fn potential_sides(&self) -> [[SideCondition; 2]; 2] {
        let condition = |bc| match bc {
            PhysBc::Interior => SideCondition::Periodic,
            PhysBc::Outflow => SideCondition::Homogeneous,
            _ => SideCondition::Neumann,
        };
        [
            [condition(self.lo[0]), condition(self.hi[0])],
            [condition(self.lo[1]), condition(self.hi[1])],
        ]
    }


    /**
     * The side conditions for an implicit solve of component `comp`.
     */
    pub fn component_sides(&self, comp: usize) -> [[SideCondition; 2]; 2] {
        let codes = self.component(comp);
        let c = |code: BcCode| code.solver_condition();
        [
            [c(codes[0][0]), c(codes[0][1])],
            [c(codes[1][0]), c(codes[1][1])],
        ]
    }
}




/**
 * Fill the guard zones of `patch` which lie outside the physical `domain` on
 * non-periodic sides. Field `n` of the patch is filled with the codes
 * returned by `codes(axis, upper, n)`; `ExtDir` zones take the value of
 * `boundary(index, axis, upper, n)`. Zones inside the domain are left
 * untouched, and must already hold exchanged or interpolated data since the
 * reflecting codes mirror them.
 *
 * The `I` sides are filled first over the patch's own `J` range, then the
 * `J` sides over the full `I` range, so corner zones end up consistent with
 * both.
 */
pub fn fill_physical_guards<C, B>(patch: &mut Patch, domain: &IndexSpace, periodic: [bool; 2], codes: C, boundary: B)
where
    C: Fn(Axis, bool, usize) -> BcCode,
    B: Fn((i64, i64), Axis, bool, usize) -> f64,
{
    let space = patch.index_space().clone();

    for axis in Axis::BOTH {
        if periodic[axis.index()] {
            continue
        }
        let d0 = domain.range(axis).start;
        let d1 = domain.range(axis).end;
        let p = space.range(axis);

        for upper in [false, true] {
            let guards: Vec<i64> = if upper {
                (d1.max(p.start)..p.end).collect()
            } else {
                (p.start..d0.min(p.end)).collect()
            };

            for g in guards {
                let nearest = if upper { d1 - 1 } else { d0 };
                let mirror = if upper { 2 * d1 - 1 - g } else { 2 * d0 - 1 - g };
                let mirror = mirror.clamp(p.start, p.end - 1);
                let nearest = nearest.clamp(p.start, p.end - 1);

                for t in space.range(axis.other()) {
                    let at = |k: i64| match axis {
                        Axis::I => (k, t),
                        Axis::J => (t, k),
                    };
                    let index = at(g);

                    for n in 0..patch.num_fields() {
                        let value = match codes(axis, upper, n) {
                            BcCode::Interior => continue,
                            BcCode::ExtDir => boundary(index, axis, upper, n),
                            BcCode::FoExtrap => patch.get(at(nearest), n),
                            BcCode::ReflectEven => patch.get(at(mirror), n),
                            BcCode::ReflectOdd => -patch.get(at(mirror), n),
                        };
                        *patch.get_mut(index, n) = value;
                    }
                }
            }
        }
    }
}




// ============================================================================
#[cfg(test)]
mod test {

    use super::{fill_physical_guards, BcCode, DomainBc, PhysBc};
    use crate::elliptic::SideCondition;
    use crate::index_space::{range2d, Axis};
    use crate::patch::Patch;

    #[test]
    fn wall_codes_distinguish_normal_and_tangential_velocity() {
        let bc = DomainBc { lo: [PhysBc::SlipWall, PhysBc::NoSlipWall], hi: [PhysBc::Outflow, PhysBc::Inflow] };
        assert_eq!(bc.code(Axis::I, false, 0), BcCode::ReflectOdd);
        assert_eq!(bc.code(Axis::I, false, 1), BcCode::ReflectEven);
        assert_eq!(bc.code(Axis::I, false, 2), BcCode::ReflectEven);
        assert_eq!(bc.code(Axis::J, false, 0), BcCode::ReflectOdd);
        assert_eq!(bc.code(Axis::J, false, 1), BcCode::ReflectOdd);
        assert_eq!(bc.code(Axis::J, false, 3), BcCode::ReflectEven);
        assert_eq!(bc.code(Axis::I, true, 1), BcCode::FoExtrap);
        assert_eq!(bc.code(Axis::J, true, 2), BcCode::ExtDir);
        assert_eq!(bc.potential_sides()[0], [SideCondition::Neumann, SideCondition::Homogeneous]);
    }

    #[test]
    fn one_sided_periodicity_is_rejected() {
        let bc = DomainBc { lo: [PhysBc::Interior, PhysBc::Interior], hi: [PhysBc::Outflow, PhysBc::Interior] };
        assert!(bc.validate().is_err());
        assert!(DomainBc::periodic().validate().is_ok());
        assert!(DomainBc::closed().validate().is_ok());
    }

    #[test]
    fn reflecting_guards_mirror_the_interior() {
        let domain = range2d(0..4, 0..4);
        let mut patch = Patch::from_scalar_function(0, domain.extend_all(2), |(i, j)| {
            if domain.contains((i, j)) { 1.0 + i as f64 } else { 0.0 }
        });
        fill_physical_guards(&mut patch, &domain, [false, true], |_, upper, _| {
            if upper { BcCode::ReflectOdd } else { BcCode::ReflectEven }
        }, |_, _, _, _| 0.0);

        assert_eq!(patch.get((-1, 1), 0), 1.0);
        assert_eq!(patch.get((-2, 1), 0), 2.0);
        assert_eq!(patch.get((4, 1), 0), -4.0);
        assert_eq!(patch.get((5, 1), 0), -3.0);

        // the J axis is periodic, so its guards are untouched
        assert_eq!(patch.get((1, -1), 0), 0.0);
    }

    #[test]
    fn dirichlet_guards_take_boundary_data() {
        let domain = range2d(0..4, 0..4);
        let mut patch = Patch::zeros(0, 1, domain.extend_all(1));
        fill_physical_guards(&mut patch, &domain, [false, false], |_, _, _| BcCode::ExtDir, |_, axis, upper, _| {
            match (axis, upper) {
                (Axis::I, false) => 1.0,
                (Axis::I, true) => 2.0,
                (Axis::J, false) => 3.0,
                (Axis::J, true) => 4.0,
            }
        });
        assert_eq!(patch.get((-1, 2), 0), 1.0);
        assert_eq!(patch.get((4, 2), 0), 2.0);
        assert_eq!(patch.get((2, -1), 0), 3.0);
        assert_eq!(patch.get((-1, 4), 0), 4.0);
    }
}
