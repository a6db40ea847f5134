//! Accelerator-backed iterative linear solver bridge for implicit reservoir
//! simulation.
//!
//! The Newton loop of a flow simulator assembles a block sparse system at every
//! iteration and hands it to a [`solver::SolverBackend`]. The backend converts
//! the matrix to its native layout, builds a block ILU(0) preconditioner and
//! runs BiCGStab on its device, reporting the outcome in a
//! [`solver::SolverResult`].

pub mod convert;
pub mod error;
pub mod problem;
pub mod solver;
pub mod sparse;
pub mod stats;
