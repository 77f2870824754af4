//! Nsamr is a block-structured adaptive mesh refinement (AMR) solver for the
//! two-dimensional, variable-density, incompressible Navier-Stokes
//! equations. Each level of the hierarchy is a union of rectangular grid
//! patches, advanced with a second-order Godunov predictor, a MAC projection
//! of the advection velocity, and an approximate projection of the new
//! cell-centered velocity. Fine levels are subcycled in time, and the
//! coarse-fine synchronization (refluxing, the MAC sync, and the nodal sync
//! projection) restores conservation and composite incompressibility after
//! each coarse step.

pub mod advection;
pub mod amr;
pub mod automaton;
pub mod boundary;
pub mod config;
pub mod derive;
pub mod diffusion;
pub mod elliptic;
pub mod error;
pub mod flux_register;
pub mod godunov;
pub mod index_space;
pub mod level;
pub mod mesh;
pub mod meshing;
pub mod patch;
pub mod problem;
pub mod projection;
pub mod sync;
pub mod sync_register;
