//! Linear solvers.
//!
//! The integrator's Newton iteration talks to a [`LinearSolver`]
//! through a three-stage lifecycle: [`reset`][LinearSolver::reset]
//! fixes the pattern and sizes the workspace, a matrix conforming to
//! that pattern is then [`factorize`][LinearSolver::factorize]d, and a
//! factorized solver answers any number of
//! [`solve`][LinearSolver::solve] calls, plain or transposed, until
//! the next `reset` or `factorize`.  Calling out of order is reported,
//! not assumed away: a solve on a never-factorized solver fails with
//! [`Error::NotFactorized`](crate::Error::NotFactorized).

use std::collections::BTreeMap;
use crate::Result;
use crate::options::OptValue;

mod dense_qr;
mod banded;
mod iterative;

pub use dense_qr::DenseQr;
pub use banded::Banded;
pub use iterative::{Iterative, IterativeKind, Pretype};

/// Shape information a solver sizes its workspace from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Sparsity {
    nrow: usize,
    ncol: usize,
    /// (lower, upper) bandwidths when the matrix is banded.
    bands: Option<(usize, usize)>,
}

impl Sparsity {
    pub fn dense(nrow: usize, ncol: usize) -> Self {
        Sparsity { nrow, ncol, bands: None }
    }

    /// A square banded pattern with `lower` subdiagonals and `upper`
    /// superdiagonals.
    pub fn banded(n: usize, lower: usize, upper: usize) -> Self {
        Sparsity { nrow: n, ncol: n, bands: Some((lower, upper)) }
    }

    pub fn nrow(&self) -> usize { self.nrow }
    pub fn ncol(&self) -> usize { self.ncol }
    pub fn bandwidths(&self) -> Option<(usize, usize)> { self.bands }
}

/// A factorize/solve backend.
///
/// Matrices are handed over as dense column-major slices of length
/// `nrow·ncol`; banded implementations pack what they need.  Right-hand
/// sides are column-major with `nrhs` columns and are overwritten by
/// the solution.
pub trait LinearSolver: Send {
    /// Accept a new pattern.  Any previous factorization is dropped.
    fn reset(&mut self, sp: &Sparsity) -> Result<()>;

    /// Factorize `a` (dense column-major, conforming to the pattern
    /// given to [`Self::reset`]).
    fn factorize(&mut self, a: &[f64]) -> Result<()>;

    /// Overwrite the `nrhs` columns of `b` with A⁻¹b, or A⁻ᵀb when
    /// `transpose` is set.
    fn solve(&mut self, b: &mut [f64], nrhs: usize, transpose: bool)
             -> Result<()>;
}

/// How a user-supplied solver is built on first use: called with the
/// Newton matrix pattern and the `linear_solver_options` dict, if any.
/// Augmented integrators inherit the creator, hence `Sync`.
pub type SolverCreator = Box<
    dyn Fn(&Sparsity, Option<&BTreeMap<String, OptValue>>)
          -> Result<Box<dyn LinearSolver>> + Send + Sync>;
