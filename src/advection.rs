use serde::{Deserialize, Serialize};
use crate::godunov::{AdvectionScheme, TraceInput, Upwind};
use crate::index_space::{shift, Axis, IndexSpace};
use crate::mesh::Mesh;
use crate::patch::Patch;

/// Whether a quantity is advected in conservation form, `div(u s)`, or in
/// convective form, `u . grad s`.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdvectionForm {
    Conservative,
    NonConservative,
}

/// The products of advecting a block of fields on one patch: the advective
/// tendency `aofs` on the valid cells, the area-weighted fluxes `u s A` on
/// the valid faces, and the face states themselves (kept for the sync).
///
#[derive(Clone, Debug)]
pub struct AdvectionProducts {
    pub aofs: Patch,
    pub fluxes: [Patch; 2],
    pub edge_states: [Patch; 2],
}

/// Compute the area-weighted advective fluxes `u s A` on the faces of
/// `valid`, for every field of the edge states.
///
pub fn compute_fluxes(umac: [&Patch; 2], edge: &[Patch; 2], valid: &IndexSpace, mesh: &Mesh) -> [Patch; 2] {
    Axis::BOTH.map(|axis| {
        let area = mesh.face_area(axis);
        let u = umac[axis.index()];
        let s = &edge[axis.index()];
        let nf = s.num_fields();

        Patch::from_slice_function(s.level(), valid.faces(axis), nf, |f, out| {
            let uf = u.get(f, 0) * area;
            for (n, x) in out.iter_mut().enumerate() {
                *x = uf * s.get(f, n)
            }
        })
    })
}

/// The advective tendency on the valid cells. Conservative fields take the
/// flux divergence; non-conservative fields take the face-averaged velocity
/// times the difference of edge states.
///
pub fn compute_aofs(
    umac: [&Patch; 2],
    edge: &[Patch; 2],
    fluxes: &[Patch; 2],
    forms: &[AdvectionForm],
    valid: &IndexSpace,
    mesh: &Mesh,
) -> Patch {
    let nf = forms.len();
    let volume = mesh.cell_volume();
    let (dx, dy) = mesh.cell_spacing();

    Patch::from_slice_function(edge[0].level(), valid.clone(), nf, |c, out| {
        for (n, x) in out.iter_mut().enumerate() {
            *x = 0.0;

            for axis in Axis::BOTH {
                let d = axis.index();
                let hi = shift(c, axis.offset(1));
                let h = if d == 0 { dx } else { dy };

                *x += match forms[n] {
                    AdvectionForm::Conservative => (fluxes[d].get(hi, n) - fluxes[d].get(c, n)) / volume,
                    AdvectionForm::NonConservative => {
                        let ubar = 0.5 * (umac[d].get(hi, 0) + umac[d].get(c, 0));
                        ubar * (edge[d].get(hi, n) - edge[d].get(c, n)) / h
                    }
                };
            }
        }
    })
}

/// Advect a block of fields on one patch: trace face states with the
/// transport velocities `umac`, then form fluxes and the tendency.
///
pub fn advect(scheme: &dyn AdvectionScheme, input: &TraceInput, forms: &[AdvectionForm], mesh: &Mesh) -> AdvectionProducts {
    let umac = input.transport;
    let edge_states = scheme.compute_face_states(input, Upwind::Transport);
    let fluxes = compute_fluxes(umac, &edge_states, input.valid, mesh);
    let aofs = compute_aofs(umac, &edge_states, &fluxes, forms, input.valid, mesh);

    AdvectionProducts { aofs, fluxes, edge_states }
}

/// The sync tendency of a correction velocity acting on saved edge states:
/// `-div(u_corr s)` for conservative fields, `-u_corr . grad s` otherwise.
/// Returns the tendency and the correction fluxes.
///
pub fn sync_advect(
    ucorr: [&Patch; 2],
    edge: &[Patch; 2],
    forms: &[AdvectionForm],
    valid: &IndexSpace,
    mesh: &Mesh,
) -> (Patch, [Patch; 2]) {
    let fluxes = compute_fluxes(ucorr, edge, valid, mesh);
    let mut sync = compute_aofs(ucorr, edge, &fluxes, forms, valid, mesh);

    for n in 0..forms.len() {
        sync.scale_field(n, -1.0)
    }
    (sync, fluxes)
}
