//! Integration of differential-algebraic equations with forward
//! sensitivities and integrator-level Jacobians.
//!
//! A [`DaeSystem`] describes ẋ = f(t,x,z,p), 0 = g(t,x,z,p) (or an
//! implicit residual 0 = F(t,x,ẋ,z,p)) symbolically, together with
//! optional quadratures q̇ = h(t,x,z,p).  An [`Integrator`] advances it
//! from t₀ to t_f with a variable-order BDF method.  Augmenting a
//! system with its forward sensitivity equations turns derivative
//! questions into plain integrations: the Jacobian of the final state
//! with respect to the initial state or the parameters is the final
//! state of a larger system of the same shape.
//!
//! # Example
//!
//! Integrate ẋ = −p·x over [0, 1], then ask for ∂x(1)/∂x₀ and
//! ∂x(1)/∂p:
//!
//! ```
//! use daesens::{BlockRequest, DaeOutputs, DaeSystem, Integrator,
//!               InputSel, Options, OutputSel, Schema};
//! # fn main() -> Result<(), daesens::Error> {
//! let dae = DaeSystem::explicit(1, 0, 1, |g, v| {
//!     let px = g.mul(v.p[0], v.x[0]);
//!     let rhs = g.neg(px);
//!     DaeOutputs { ode: vec![rhs], alg: vec![], quad: vec![] }
//! })?;
//! let opts = Options::new(Schema::integrator());
//! let mut ivp = Integrator::new(dae, 0., 1., opts)?;
//! let out = ivp.solve(&[1.], &[1.])?;
//! assert!((out.xf[0] - (-1f64).exp()).abs() < 1e-4);
//!
//! let blocks = ivp.jacobian(&[1.], &[1.], &[
//!     BlockRequest::new(OutputSel::FinalState, InputSel::InitialState),
//!     BlockRequest::new(OutputSel::FinalState, InputSel::Parameters),
//! ])?;
//! let d_x0 = blocks[0].matrix().unwrap();
//! let d_p = blocks[1].matrix().unwrap();
//! assert!((d_x0[(0, 0)] - (-1f64).exp()).abs() < 1e-3);
//! assert!((d_p[(0, 0)] + (-1f64).exp()).abs() < 1e-3);
//! # Ok(()) }
//! ```

use thiserror::Error as ThisError;

// Keep the README example compiling and passing.
#[cfg(doctest)]
doc_comment::doctest!("../README.md");

/// Check that `$left` and `$right` are the same up to an absolute
/// error of `$tol`.
#[cfg(test)]
macro_rules! assert_eq_tol {
    ($left: expr, $right: expr, $tol: expr) => {
        let left = $left;
        let right = $right;
        let tol = $tol;
        if !((left - right).abs() <= tol) {
            panic!("assertion failed: |left - right| ≤ tol, where\n\
                    - left:  {}\n\
                    - right: {}\n\
                    - tol: {}", left, right, tol);
        }
    }
}

pub mod expr;
pub mod dae;
pub mod options;
pub mod sensitivity;
pub mod integrator;
pub mod jacobian;
pub mod linear_solver;

pub use dae::{DaeOutputs, DaeSystem, DaeVars, ResidualFn};
pub use integrator::{AdjointConfig, Integrator, IntegratorOutput};
pub use jacobian::{BlockRequest, InputSel, JacobianBlock, OutputSel};
pub use options::{OptType, OptValue, Options, Schema};
pub use sensitivity::augment;

pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong in this crate.
///
/// Configuration problems (the option and system-construction
/// variants) surface before any numerical work and are fatal; the
/// numerical variants are propagated out of a failed integration or
/// factorization as they happen, with no retry behind the caller's
/// back.  [`Error::UnsupportedSensitivityRequest`] is the one
/// recoverable case: callers that hold a non-symbolic system fall back
/// to finite differences when they see it.
#[derive(ThisError, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The option name was never declared in the schema.
    #[error("unknown option \"{name}\"")]
    UnknownOption { name: String },

    /// The stored or supplied value does not have the declared type.
    #[error("option \"{name}\" expects {expected}, got {got}")]
    OptionTypeMismatch {
        name: String,
        expected: &'static str,
        got: &'static str,
    },

    /// A string option was set outside its allowed set.
    #[error("invalid value \"{value}\" for option \"{name}\" \
             (allowed: {allowed})")]
    InvalidEnumValue { name: String, value: String, allowed: String },

    /// A declared option holds an unusable value.
    #[error("invalid value for option \"{name}\": {why}")]
    InvalidOptionValue { name: String, why: String },

    /// The system description is inconsistent.
    #[error("ill-formed DAE system: {0}")]
    IllFormedSystem(String),

    /// Sensitivity augmentation was requested with zero derivative
    /// directions (both groups disabled, or the enabled groups empty).
    #[error("sensitivity augmentation requested with zero derivative \
             directions")]
    NoSensitivityRequested,

    /// The system cannot be differentiated symbolically.  Callers able
    /// to finite-difference instead should treat this as a signal, not
    /// a failure.
    #[error("symbolic sensitivities unavailable: {0}")]
    UnsupportedSensitivityRequest(&'static str),

    /// A Jacobian block was requested that the system cannot produce.
    #[error("invalid Jacobian block request: {0}")]
    InvalidBlockRequest(String),

    /// A factorization hit a numerically zero pivot.
    #[error("matrix is numerically singular (column {col})")]
    SingularMatrix { col: usize },

    /// A factorization failed for a reason other than singularity.
    #[error("factorization failed: {0}")]
    FactorizationFailure(String),

    /// `solve` was called before a successful `factorize`.
    #[error("linear solve requested before factorization")]
    NotFactorized,

    /// A Krylov iteration ran out of budget before reaching its
    /// residual target.
    #[error("iterative solve did not converge within {iters} iterations \
             (residual {residual:e})")]
    IterativeSolveFailure { iters: usize, residual: f64 },

    /// The step budget ran out before reaching the final time.
    #[error("maximum number of steps ({max_steps}) reached at t = {t}")]
    TooMuchWork { max_steps: usize, t: f64 },

    /// The nonlinear iteration failed even at the smallest step size.
    #[error("nonlinear solver failed to converge at t = {t} \
             (step size {h:e})")]
    ConvergenceFailure { t: f64, h: f64 },
}
