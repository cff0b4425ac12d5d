//! Variable-order BDF integration of DAE systems.
//!
//! An [`Integrator`] advances a [`DaeSystem`] (or an opaque
//! [`ResidualFn`]) from t₀ to t_f and returns the final state together
//! with the accumulated quadratures.  Steps use backward
//! differentiation formulas of orders 1 to 5 with a modified Newton
//! iteration; the iteration matrix ∂R/∂u + c·∂R/∂u̇ is factorized by a
//! [`LinearSolver`] backend chosen through the `linear_solver` option.
//! Algebraic variables and, for implicit systems, the initial state
//! derivatives are made consistent at t₀ before stepping starts.
//!
//! [`Integrator::augmented`] wraps the same machinery around the
//! forward sensitivity equations of [`crate::sensitivity::augment`]:
//! the augmented instance inherits every option of the original and
//! answers the same call contract, with the sensitivity block of the
//! state under its own error-control tolerances.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use log::{debug, warn};
use crate::{Error, Result};
use crate::dae::{DaeSystem, ResidualFn};
use crate::expr::ExprId;
use crate::linear_solver::{
    Banded, DenseQr, Iterative, IterativeKind, LinearSolver, Pretype,
    SolverCreator, Sparsity,
};
use crate::options::{OptValue, Options};
use crate::sensitivity::augment;

// Fixed-coefficient BDF tables: Σⱼ αⱼ·y_{n+1-j} = h·β·ẏ_{n+1}.
const BDF_ALPHA: [[f64; 6]; 5] = [
    [1., -1., 0., 0., 0., 0.],
    [3. / 2., -2., 1. / 2., 0., 0., 0.],
    [11. / 6., -3., 3. / 2., -1. / 3., 0., 0.],
    [25. / 12., -4., 3., -4. / 3., 1. / 4., 0.],
    [137. / 60., -5., 5., -10. / 3., 5. / 4., -1. / 5.],
];
const BDF_BETA: [f64; 5] = [1., 2. / 3., 6. / 11., 12. / 25., 60. / 137.];
const BDF_ERROR_COEFF: [f64; 5] =
    [1. / 2., 2. / 9., 3. / 22., 12. / 125., 10. / 137.];

const SAFETY: f64 = 0.9;
const MIN_FACTOR: f64 = 0.2;
const MAX_FACTOR: f64 = 5.0;
/// Smallest step size, relative to the integration interval.
const MIN_STEP_RATIO: f64 = 1e-14;

const MAX_NEWTON_ITER: usize = 7;
/// Weighted norm of the Newton update below which a step iterate is
/// accepted as converged.
const NEWTON_TOL: f64 = 0.1;
/// Accepted steps between two refreshes of the iteration matrix.
const JAC_REFRESH_INTERVAL: usize = 5;

const IC_MAX_ITER: usize = 20;
const IC_TOL: f64 = 0.01;

////////////////////////////////////////////////////////////////////////
//
// Configuration

/// Linear solver family, selected by the `linear_solver` option.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinsolKind { UserDefined, Dense, Banded, Iterative }

/// How forward sensitivities are propagated alongside the states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SensitivityMethod { Simultaneous, Staggered }

/// Interpolation used to reconstruct the forward trajectory between
/// checkpoints during a backward sweep.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InterpolationType { Hermite, Polynomial }

/// Configuration of the adjoint (backward) problem.
///
/// The integrator validates and keeps these settings so that a
/// backward sweep can be set up against them; running one is the
/// caller's business.  Unset tolerances fall back to the primal ones.
#[derive(Clone, Copy, Debug)]
pub struct AdjointConfig {
    pub method: SensitivityMethod,
    pub steps_per_checkpoint: usize,
    pub interpolation: InterpolationType,
    pub reltol: f64,
    pub abstol: f64,
    pub linear_solver: LinsolKind,
    pub iterative_solver: IterativeKind,
    pub pretype: Pretype,
    pub max_krylov: usize,
    pub lower_bandwidth: Option<usize>,
    pub upper_bandwidth: Option<usize>,
}

/// Options read once at construction time.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Config {
    pub(crate) reltol: f64,
    pub(crate) abstol: f64,
    pub(crate) fsens_reltol: f64,
    pub(crate) fsens_abstol: f64,
    pub(crate) fsens_err_con: bool,
    pub(crate) finite_difference_fsens: bool,
    pub(crate) quad_err_con: bool,
    pub(crate) max_num_steps: usize,
    pub(crate) max_order: usize,
    pub(crate) exact_jacobian: bool,
    pub(crate) linear_solver: LinsolKind,
    pub(crate) iterative_solver: IterativeKind,
    pub(crate) pretype: Pretype,
    pub(crate) max_krylov: usize,
    pub(crate) use_preconditioner: bool,
    pub(crate) lower_bandwidth: Option<usize>,
    pub(crate) upper_bandwidth: Option<usize>,
}

fn invalid(name: &str, why: impl ToString) -> Error {
    Error::InvalidOptionValue { name: name.to_string(), why: why.to_string() }
}

fn positive_real(opts: &Options, name: &str) -> Result<f64> {
    let v = opts.real(name)?;
    if v > 0. { Ok(v) } else { Err(invalid(name, format!("must be positive, got {v}"))) }
}

fn positive_real_or(opts: &Options, name: &str, fallback: f64) -> Result<f64> {
    match opts.real_opt(name)? {
        None => Ok(fallback),
        Some(v) if v > 0. => Ok(v),
        Some(v) => Err(invalid(name, format!("must be positive, got {v}"))),
    }
}

fn count(opts: &Options, name: &str, least: i64) -> Result<usize> {
    let v = opts.int(name)?;
    if v < least {
        return Err(invalid(name, format!("must be at least {least}, got {v}")))
    }
    Ok(v as usize)
}

fn bandwidth(opts: &Options, name: &str) -> Result<Option<usize>> {
    match opts.int_opt(name)? {
        None => Ok(None),
        Some(v) if v >= 0 => Ok(Some(v as usize)),
        Some(v) => Err(invalid(name, format!("must be nonnegative, got {v}"))),
    }
}

// The string values below were checked against the schema when they
// were set, so anything else cannot occur.
fn parse_linsol(s: &str) -> LinsolKind {
    match s {
        "user_defined" => LinsolKind::UserDefined,
        "dense" => LinsolKind::Dense,
        "banded" => LinsolKind::Banded,
        "iterative" => LinsolKind::Iterative,
        _ => unreachable!("option value validated against the schema"),
    }
}

fn parse_iterative(s: &str) -> IterativeKind {
    match s {
        "gmres" => IterativeKind::Gmres,
        "bcgstab" => IterativeKind::BcgStab,
        "tfqmr" => IterativeKind::Tfqmr,
        _ => unreachable!("option value validated against the schema"),
    }
}

fn parse_pretype(s: &str) -> Pretype {
    match s {
        "none" => Pretype::None,
        "left" => Pretype::Left,
        "right" => Pretype::Right,
        "both" => Pretype::Both,
        _ => unreachable!("option value validated against the schema"),
    }
}

impl Config {
    fn parse(opts: &Options, symbolic: bool) -> Result<(Config, AdjointConfig)> {
        let reltol = positive_real(opts, "reltol")?;
        let abstol = positive_real(opts, "abstol")?;
        let exact_jacobian = opts.boolean("exact_jacobian")?;
        if exact_jacobian && !symbolic {
            return Err(invalid("exact_jacobian",
                               "the system is an opaque callback and cannot \
                                be differentiated symbolically"))
        }
        let linear_solver = parse_linsol(&opts.string("linear_solver")?);
        let lower_bandwidth = bandwidth(opts, "lower_bandwidth")?;
        let upper_bandwidth = bandwidth(opts, "upper_bandwidth")?;
        if linear_solver == LinsolKind::Banded
            && (lower_bandwidth.is_none() || upper_bandwidth.is_none()) {
            return Err(invalid("lower_bandwidth",
                               "the banded linear solver needs both \
                                lower_bandwidth and upper_bandwidth"))
        }
        let cfg = Config {
            reltol,
            abstol,
            fsens_reltol: positive_real_or(opts, "fsens_reltol", reltol)?,
            fsens_abstol: positive_real_or(opts, "fsens_abstol", abstol)?,
            fsens_err_con: opts.boolean("fsens_err_con")?,
            finite_difference_fsens: opts.boolean("finite_difference_fsens")?,
            quad_err_con: opts.boolean("quad_err_con")?,
            max_num_steps: count(opts, "max_num_steps", 1)?,
            max_order: {
                let o = count(opts, "max_multistep_order", 1)?;
                if o > 5 {
                    return Err(invalid("max_multistep_order",
                                       format!("BDF orders run from 1 to 5, \
                                                got {o}")))
                }
                o
            },
            exact_jacobian,
            linear_solver,
            iterative_solver: parse_iterative(&opts.string("iterative_solver")?),
            pretype: parse_pretype(&opts.string("pretype")?),
            max_krylov: count(opts, "max_krylov", 1)?,
            use_preconditioner: opts.boolean("use_preconditioner")?,
            lower_bandwidth,
            upper_bandwidth,
        };
        let adjoint = AdjointConfig {
            method: match opts.string("sensitivity_method")?.as_str() {
                "simultaneous" => SensitivityMethod::Simultaneous,
                "staggered" => SensitivityMethod::Staggered,
                _ => unreachable!("option value validated against the schema"),
            },
            steps_per_checkpoint: count(opts, "steps_per_checkpoint", 1)?,
            interpolation: match opts.string("interpolation_type")?.as_str() {
                "hermite" => InterpolationType::Hermite,
                "polynomial" => InterpolationType::Polynomial,
                _ => unreachable!("option value validated against the schema"),
            },
            reltol: positive_real_or(opts, "asens_reltol", reltol)?,
            abstol: positive_real_or(opts, "asens_abstol", abstol)?,
            linear_solver: parse_linsol(&opts.string("asens_linear_solver")?),
            iterative_solver:
                parse_iterative(&opts.string("asens_iterative_solver")?),
            pretype: parse_pretype(&opts.string("asens_pretype")?),
            max_krylov: count(opts, "asens_max_krylov", 1)?,
            lower_bandwidth: bandwidth(opts, "asens_lower_bandwidth")?,
            upper_bandwidth: bandwidth(opts, "asens_upper_bandwidth")?,
        };
        Ok((cfg, adjoint))
    }
}

////////////////////////////////////////////////////////////////////////
//
// System representation

enum Repr {
    Symbolic(DaeSystem),
    Callback(Arc<dyn ResidualFn>),
}

impl Repr {
    fn n_x(&self) -> usize {
        match self {
            Repr::Symbolic(d) => d.n_x(),
            Repr::Callback(f) => f.n_x(),
        }
    }

    fn n_z(&self) -> usize {
        match self {
            Repr::Symbolic(d) => d.n_z(),
            Repr::Callback(f) => f.n_z(),
        }
    }

    fn n_p(&self) -> usize {
        match self {
            Repr::Symbolic(d) => d.n_p(),
            Repr::Callback(f) => f.n_p(),
        }
    }

    fn n_q(&self) -> usize {
        match self {
            Repr::Symbolic(d) => d.n_q(),
            Repr::Callback(f) => f.n_q(),
        }
    }

    fn is_implicit(&self) -> bool {
        match self {
            Repr::Symbolic(d) => d.is_implicit(),
            Repr::Callback(f) => f.is_implicit(),
        }
    }

    fn is_symbolic(&self) -> bool {
        matches!(self, Repr::Symbolic(_))
    }

    #[allow(clippy::too_many_arguments)]
    fn eval(&self, t: f64, x: &[f64], z: &[f64], xdot: &[f64], p: &[f64],
            ode: &mut [f64], alg: &mut [f64], quad: &mut [f64],
            vals: &mut Vec<f64>, work: &mut Vec<f64>) {
        match self {
            Repr::Symbolic(d) =>
                d.eval_into(t, x, z, xdot, p, ode, alg, quad, vals, work),
            Repr::Callback(f) => f.eval(t, x, z, xdot, p, ode, alg, quad),
        }
    }
}

/// Symbolic blocks of the step residual Jacobian, built once when
/// `exact_jacobian` is set.  Column-major over u = [x, z]; rows are the
/// ode outputs followed by the algebraic ones.
struct ExactJac {
    d_du: Vec<ExprId>,
    /// ∂output/∂ẋ, column-major n×n_x; empty for explicit systems.
    d_dxdot: Vec<ExprId>,
}

fn build_exact_jac(dae: &mut DaeSystem) -> ExactJac {
    let n_x = dae.n_x();
    let n_z = dae.n_z();
    let n = n_x + n_z;
    let mut roots = Vec::with_capacity(n);
    roots.extend_from_slice(&dae.ode);
    roots.extend_from_slice(&dae.alg);
    let zero = dae.graph.zero();
    let one = dae.graph.one();
    let mut seeds = vec![zero; dae.graph.num_vars()];
    // Slot order in the arena is t, x, z, ẋ, p, so u columns occupy
    // the contiguous slots 1..=n.
    let mut d_du = Vec::with_capacity(n * n);
    for j in 0..n {
        seeds[1 + j] = one;
        d_du.extend(dae.graph.fwd(&roots, &seeds));
        seeds[1 + j] = zero;
    }
    let d_dxdot = if dae.is_implicit() {
        let mut v = Vec::with_capacity(n * n_x);
        for j in 0..n_x {
            seeds[1 + n + j] = one;
            v.extend(dae.graph.fwd(&roots, &seeds));
            seeds[1 + n + j] = zero;
        }
        v
    } else {
        Vec::new()
    };
    ExactJac { d_du, d_dxdot }
}

/// Evaluation buffers reused across residual and Jacobian calls.
#[derive(Default)]
struct EvalBufs {
    vals: Vec<f64>,
    work: Vec<f64>,
    ode: Vec<f64>,
    alg: Vec<f64>,
    quad: Vec<f64>,
    xdot: Vec<f64>,
    jxd: Vec<f64>,
}

////////////////////////////////////////////////////////////////////////
//
// Integrator

/// Final-time outputs of one integration.
#[derive(Clone, Debug)]
pub struct IntegratorOutput {
    /// State at the final time.
    pub xf: Vec<f64>,
    /// Accumulated quadratures ∫ h(t, x, z, p) dt over the interval.
    pub qf: Vec<f64>,
}

type CreatorFn = dyn Fn(&Sparsity, Option<&BTreeMap<String, OptValue>>)
                        -> Result<Box<dyn LinearSolver>> + Send + Sync;

/// BDF integrator for a fixed DAE system over [t₀, t_f].
///
/// Options are read and validated once at construction; configuration
/// problems are reported there and never during a solve.  Each
/// instance owns its workspace, so independent instances may run on
/// different threads.
///
/// # Example
///
/// ```
/// use daesens::{DaeOutputs, DaeSystem, Integrator, Options, Schema};
/// # fn main() -> Result<(), daesens::Error> {
/// // ẋ = −x over [0, 2].
/// let dae = DaeSystem::explicit(1, 0, 0, |g, v| {
///     let r = g.neg(v.x[0]);
///     DaeOutputs { ode: vec![r], alg: vec![], quad: vec![] }
/// })?;
/// let mut ivp = Integrator::new(dae, 0., 2., Options::new(Schema::integrator()))?;
/// let out = ivp.solve(&[1.], &[])?;
/// assert!((out.xf[0] - (-2f64).exp()).abs() < 1e-5);
/// # Ok(()) }
/// ```
pub struct Integrator {
    repr: Repr,
    t0: f64,
    tf: f64,
    opts: Options,
    pub(crate) cfg: Config,
    adjoint: AdjointConfig,
    linsol: Option<Box<dyn LinearSolver>>,
    creator: Option<Arc<CreatorFn>>,
    exact: Option<ExactJac>,
    // Leading components of x, z and the quadratures governed by the
    // primal tolerances; the rest is the sensitivity block of an
    // augmented instance.
    n_primal_x: usize,
    n_primal_z: usize,
    n_primal_q: usize,
}

impl Integrator {
    /// Set up an integrator for `dae` over [`t0`, `tf`] with the given
    /// options (see [`Schema::integrator`](crate::Schema::integrator)).
    pub fn new(dae: DaeSystem, t0: f64, tf: f64, opts: Options)
               -> Result<Self> {
        Self::init(Repr::Symbolic(dae), t0, tf, opts)
    }

    /// Set up an integrator for a system given as an opaque residual
    /// callback.  Such systems integrate like symbolic ones but do not
    /// support `exact_jacobian` or sensitivity augmentation; Jacobian
    /// queries fall back to finite differences.
    pub fn from_residual(f: Arc<dyn ResidualFn>, t0: f64, tf: f64,
                         opts: Options) -> Result<Self> {
        Self::init(Repr::Callback(f), t0, tf, opts)
    }

    fn init(mut repr: Repr, t0: f64, tf: f64, opts: Options) -> Result<Self> {
        let (cfg, adjoint) = Config::parse(&opts, repr.is_symbolic())?;
        let exact = if cfg.exact_jacobian {
            match &mut repr {
                Repr::Symbolic(dae) => Some(build_exact_jac(dae)),
                // Rejected by Config::parse.
                Repr::Callback(_) => unreachable!(),
            }
        } else {
            None
        };
        Ok(Integrator {
            n_primal_x: repr.n_x(),
            n_primal_z: repr.n_z(),
            n_primal_q: repr.n_q(),
            repr, t0, tf, opts, cfg, adjoint,
            linsol: None,
            creator: None,
            exact,
        })
    }

    pub fn n_x(&self) -> usize { self.repr.n_x() }
    pub fn n_z(&self) -> usize { self.repr.n_z() }
    pub fn n_p(&self) -> usize { self.repr.n_p() }
    pub fn n_q(&self) -> usize { self.repr.n_q() }

    /// The options this integrator was built with.
    pub fn options(&self) -> &Options { &self.opts }

    /// Settings of the backward problem, parsed from the `asens_*`
    /// option group.
    pub fn adjoint_config(&self) -> &AdjointConfig { &self.adjoint }

    pub fn set_initial_time(&mut self, t0: f64) { self.t0 = t0; }

    pub fn set_final_time(&mut self, tf: f64) { self.tf = tf; }

    /// Inject a linear solver to be used for the Newton iteration
    /// matrix.  An injected solver is kept for the lifetime of the
    /// integrator; the lazy construction from the `linear_solver`
    /// option only runs while this slot is empty.
    pub fn set_linear_solver(&mut self, solver: Box<dyn LinearSolver>) {
        self.linsol = Some(solver);
    }

    /// Register a constructor for a user-defined linear solver.  It is
    /// called on first use with the iteration matrix pattern and the
    /// `linear_solver_options` dictionary, and is inherited by
    /// augmented instances (an injected solver instance is not).
    pub fn set_linear_solver_creator(&mut self, creator: SolverCreator) {
        self.creator = Some(Arc::from(creator));
    }

    /// Build an integrator for the forward-sensitivity-augmented
    /// counterpart of this system (see
    /// [`augment`](crate::sensitivity::augment)).  The new instance
    /// copies every option and the time interval of this one; the
    /// sensitivity block of its state is error-controlled under
    /// `fsens_reltol`/`fsens_abstol` and dropped from error control
    /// entirely when `fsens_err_con` is unset.
    pub fn augmented(&self, with_x: bool, with_p: bool) -> Result<Integrator> {
        let dae = match &self.repr {
            Repr::Symbolic(dae) => dae,
            Repr::Callback(_) => return Err(Error::UnsupportedSensitivityRequest(
                "the system is an opaque callback")),
        };
        let aug = augment(dae, with_x, with_p)?;
        debug!("augmented system: {} states ({} primal), method {:?}",
               aug.n_x(), dae.n_x(), self.adjoint.method);
        let mut ivp = Integrator::new(aug, self.t0, self.tf, self.opts.clone())?;
        ivp.creator = self.creator.clone();
        ivp.n_primal_x = dae.n_x();
        ivp.n_primal_z = dae.n_z();
        ivp.n_primal_q = dae.n_q();
        Ok(ivp)
    }

    fn split(&self) -> Split {
        Split {
            n_primal_x: self.n_primal_x,
            n_primal_z: self.n_primal_z,
            n_primal_q: self.n_primal_q,
        }
    }

    /// Solve the algebraic part (and for implicit systems the state
    /// derivatives) at t₀, then report ẋ(t₀) and q̇(t₀).
    fn correct_initial_conditions(&self, x0: &[f64], p: &[f64],
                                  e: &mut EvalBufs)
                                  -> Result<(Vec<f64>, Vec<f64>, Vec<f64>)> {
        let n_x = self.repr.n_x();
        let n_z = self.repr.n_z();
        let implicit = self.repr.is_implicit();
        let t0 = self.t0;

        // Unknowns: z for explicit systems, [ẋ, z] for implicit ones.
        let m = if implicit { n_x + n_z } else { n_z };
        let mut w = vec![0.; m];
        if m > 0 {
            let mut sol = DenseQr::new();
            sol.reset(&Sparsity::dense(m, m))?;
            let mut r = vec![0.; m];
            let mut wpert = vec![0.; m];
            let mut a = vec![0.; m * m];
            let mut delta = vec![0.; m];
            let mut wt = Vec::with_capacity(m);
            let mut converged = false;
            for _ in 0..IC_MAX_ITER {
                ic_residual(&self.repr, t0, x0, &w, p, &mut r, e);
                // One-sided differences for the correction matrix.
                let d0 = f64::EPSILON.sqrt();
                for j in 0..m {
                    wpert.copy_from_slice(&w);
                    let d = d0 * (1. + w[j].abs());
                    wpert[j] += d;
                    ic_residual(&self.repr, t0, x0, &wpert, p,
                                &mut delta, e);
                    for i in 0..m {
                        a[i + j * m] = (delta[i] - r[i]) / d;
                    }
                }
                sol.factorize(&a)?;
                for (d, ri) in delta.iter_mut().zip(&r) {
                    *d = -ri;
                }
                sol.solve(&mut delta, 1, false)?;
                for (wi, d) in w.iter_mut().zip(&delta) {
                    *wi += d;
                }
                // Weights follow the unknown layout: ẋ components use
                // the state tolerances.
                let split = self.split();
                wt.clear();
                for (i, &v) in w.iter().enumerate() {
                    let (rt, at) = if implicit && i < n_x {
                        x_tols(&self.cfg, split, i)
                    } else if implicit {
                        z_tols(&self.cfg, split, i - n_x)
                    } else {
                        z_tols(&self.cfg, split, i)
                    };
                    wt.push(at + rt * v.abs());
                }
                if wrms(&delta, &wt) < IC_TOL {
                    converged = true;
                    break
                }
            }
            if !converged {
                return Err(Error::ConvergenceFailure { t: t0, h: 0. })
            }
        }

        let (xdot0, z0) = if implicit {
            (w[..n_x].to_vec(), w[n_x..].to_vec())
        } else {
            (Vec::new(), w)
        };
        // One output evaluation at the consistent point gives ẋ(t₀)
        // for explicit systems and q̇(t₀) for both forms.
        let EvalBufs { vals, work, ode, alg, quad, .. } = e;
        ode.resize(n_x, 0.);
        alg.resize(n_z, 0.);
        quad.resize(self.repr.n_q(), 0.);
        self.repr.eval(t0, x0, &z0, &xdot0, p, ode, alg, quad, vals, work);
        let xdot0 = if implicit { xdot0 } else { ode.clone() };
        Ok((z0, xdot0, quad.clone()))
    }

    /// Advance the system from t₀ to t_f.
    ///
    /// `x0` is the initial differential state and `p` the parameter
    /// values; algebraic variables and state derivatives are made
    /// consistent internally.  Quadratures start from zero.  A call
    /// with t_f = t₀ returns the initial state unchanged.
    ///
    /// Numerical failures ([`Error::TooMuchWork`],
    /// [`Error::ConvergenceFailure`], solver breakdowns) are reported
    /// as they happen; no retry is attempted beyond ordinary step
    /// rejection.
    ///
    /// Panics if `x0` or `p` have the wrong length.
    pub fn solve(&mut self, x0: &[f64], p: &[f64]) -> Result<IntegratorOutput> {
        let n_x = self.repr.n_x();
        let n_z = self.repr.n_z();
        let n_q = self.repr.n_q();
        let n = n_x + n_z;
        assert_eq!(x0.len(), n_x,
                   "initial state has {} entries, the system has {} states",
                   x0.len(), n_x);
        assert_eq!(p.len(), self.repr.n_p(),
                   "{} parameter values given, the system has {}",
                   p.len(), self.repr.n_p());
        let (t0, tf) = (self.t0, self.tf);
        if tf == t0 {
            return Ok(IntegratorOutput { xf: x0.to_vec(), qf: vec![0.; n_q] })
        }
        if tf < t0 {
            return Err(invalid("final_time", format!(
                "t_f = {tf} precedes the initial time t₀ = {t0}")))
        }
        let cfg = self.cfg;
        let split = self.split();
        let implicit = self.repr.is_implicit();
        let mut e = EvalBufs::default();

        let (mut z, xdot0, qdot0) =
            self.correct_initial_conditions(x0, p, &mut e)?;

        // Lazy backend construction: only an empty slot is filled, and
        // only from the configured creator or family.
        let sp = match cfg.linear_solver {
            LinsolKind::Banded => {
                // Presence checked at init.
                let ml = cfg.lower_bandwidth.unwrap_or(n);
                let mu = cfg.upper_bandwidth.unwrap_or(n);
                Sparsity::banded(n, ml, mu)
            }
            _ => Sparsity::dense(n, n),
        };
        let sol = match &mut self.linsol {
            Some(s) => s,
            slot @ None => slot.insert(make_solver(
                self.creator.as_deref(), &cfg, &self.opts, &sp)?),
        };
        if n > 0 {
            sol.reset(&sp)?;
        }

        let span = tf - t0;
        let h_min = MIN_STEP_RATIO * span;
        let h_max = span;
        let mut h = initial_step(x0, &xdot0, span).clamp(h_min, h_max);
        // Spacing of the accumulated history.  The fixed-coefficient
        // tables assume the last `order` steps sit on a uniform grid.
        let mut h_grid = 0.;

        let mut t = t0;
        let mut x = x0.to_vec();
        let mut q = vec![0.; n_q];
        let mut x_hist = vec![x.clone()];
        let mut q_hist = vec![q.clone()];
        let mut xdot_last = xdot0;
        let mut qdot_last = qdot0;
        let mut order = 1usize;

        let mut u_new = vec![0.; n];
        let mut x_pred = vec![0.; n_x];
        let mut sdot = vec![0.; n_x];
        let mut r = vec![0.; n];
        let mut delta = vec![0.; n];
        let mut e_x = vec![0.; n_x];
        let mut q_cand = vec![0.; n_q];
        let mut qdot_cand = vec![0.; n_q];
        let mut e_q = vec![0.; n_q];
        let mut wt = Vec::with_capacity(n);
        let mut a = vec![0.; n * n];

        let mut jac_fresh = false;
        let mut steps_since_jac = 0usize;
        // The c the iteration matrix was last factorized with; step or
        // order changes move c and can defeat the modified Newton.
        let mut c_fact = f64::NAN;
        let (mut naccept, mut nreject) = (0usize, 0usize);
        let mut last_linear_err: Option<Error> = None;

        while tf - t > h_min {
            if naccept + nreject >= cfg.max_num_steps {
                return Err(Error::TooMuchWork {
                    max_steps: cfg.max_num_steps, t })
            }
            let h_used = h.min(tf - t);
            if h_used != h_grid {
                // New spacing: the stored history no longer sits on
                // the grid the coefficients assume, so restart from
                // the current point.
                x_hist.truncate(1);
                q_hist.truncate(1);
                order = 1;
                h_grid = h_used;
            }
            let k = order;
            debug_assert!(x_hist.len() >= k);
            let alpha = &BDF_ALPHA[k - 1];
            let beta = BDF_BETA[k - 1];
            let c = alpha[0] / (h_used * beta);
            let t_new = t + h_used;

            // Taylor predictor for the states, copy for the algebraic
            // variables; the BDF history term is fixed for the step.
            for i in 0..n_x {
                x_pred[i] = x[i] + h_used * xdot_last[i];
                let mut acc = 0.;
                for (j, aj) in alpha.iter().enumerate().take(k + 1).skip(1) {
                    acc += aj * x_hist[j - 1][i];
                }
                sdot[i] = acc / (h_used * beta);
            }
            u_new[..n_x].copy_from_slice(&x_pred);
            u_new[n_x..].copy_from_slice(&z);
            fill_newton_weights(&cfg, split, n_x, &u_new, &mut wt);

            let stale_c = !(c / c_fact).is_finite()
                || (c / c_fact - 1.).abs() > 0.3;
            if n > 0 && (!jac_fresh || stale_c
                         || steps_since_jac >= JAC_REFRESH_INTERVAL) {
                match (&self.exact, &self.repr) {
                    (Some(ex), Repr::Symbolic(dae)) =>
                        exact_step_matrix(dae, ex, t_new, &u_new, c, &sdot,
                                          p, &mut a, &mut e),
                    _ => fd_step_matrix(&self.repr, t_new, &u_new, c, &sdot,
                                        p, &mut a, &mut e),
                }
                match sol.factorize(&a) {
                    Ok(()) => {
                        jac_fresh = true;
                        steps_since_jac = 0;
                        c_fact = c;
                    }
                    Err(err @ (Error::SingularMatrix { .. }
                               | Error::FactorizationFailure(_))) => {
                        nreject += 1;
                        jac_fresh = false;
                        h = h_used * 0.5;
                        if h < h_min {
                            return Err(err)
                        }
                        warn!("iteration matrix factorization failed at \
                               t = {t_new:.6e}; retrying with h = {h:.3e}");
                        last_linear_err = Some(err);
                        continue
                    }
                    Err(err) => return Err(err),
                }
            }

            // Modified Newton on R(u) = 0 with u̇ = c·u + history.
            let mut converged = n == 0;
            let mut prev_upd = f64::INFINITY;
            for _ in 0..MAX_NEWTON_ITER {
                if n == 0 {
                    break
                }
                step_residual(&self.repr, t_new, &u_new, c, &sdot, p,
                              &mut r, &mut e);
                for (d, ri) in delta.iter_mut().zip(&r) {
                    *d = -ri;
                }
                if let Err(err) = sol.solve(&mut delta, 1, false) {
                    last_linear_err = Some(err);
                    break
                }
                for (ui, d) in u_new.iter_mut().zip(&delta) {
                    *ui += d;
                }
                let upd = wrms(&delta, &wt);
                if !upd.is_finite() {
                    break
                }
                if upd < NEWTON_TOL {
                    converged = true;
                    break
                }
                if upd > 2. * prev_upd {
                    break
                }
                prev_upd = upd;
            }

            if !converged {
                nreject += 1;
                jac_fresh = false;
                h = h_used * 0.5;
                if h < h_min {
                    return Err(last_linear_err.take().unwrap_or(
                        Error::ConvergenceFailure { t: t_new, h }))
                }
                warn!("newton iteration stalled at t = {t_new:.6e}; \
                       retrying with h = {h:.3e}");
                continue
            }

            // Local error from the predictor-corrector difference.
            let coeff = BDF_ERROR_COEFF[k - 1];
            for i in 0..n_x {
                e_x[i] = coeff * (u_new[i] - x_pred[i]);
            }
            if n_q > 0 {
                // Candidate quadrature through the same BDF relation;
                // its right-hand side never feeds back into the states.
                let EvalBufs { vals, work, ode, alg, quad, xdot, .. } = &mut e;
                ode.resize(n_x, 0.);
                alg.resize(n_z, 0.);
                quad.resize(n_q, 0.);
                xdot.resize(n_x, 0.);
                for i in 0..n_x {
                    xdot[i] = c * u_new[i] + sdot[i];
                }
                self.repr.eval(t_new, &u_new[..n_x], &u_new[n_x..],
                               if implicit { xdot.as_slice() } else { &[] },
                               p, ode, alg, quad, vals, work);
                qdot_cand.copy_from_slice(quad);
                for i in 0..n_q {
                    let mut acc = 0.;
                    for (j, aj) in alpha.iter().enumerate().take(k + 1).skip(1) {
                        acc += aj * q_hist[j - 1][i];
                    }
                    q_cand[i] = (h_used * beta * qdot_cand[i] - acc) / alpha[0];
                    e_q[i] = coeff * (q_cand[i] - (q[i] + h_used * qdot_last[i]));
                }
            }
            let err = error_norm(&cfg, split, &e_x, &x, &u_new[..n_x],
                                 &e_q, &q, &q_cand);

            let factor = if err == 0. {
                MAX_FACTOR
            } else if err.is_finite() {
                (SAFETY * err.powf(-1. / (k as f64 + 1.)))
                    .clamp(MIN_FACTOR, MAX_FACTOR)
            } else {
                MIN_FACTOR
            };
            if err <= 1. {
                t = t_new;
                for i in 0..n_x {
                    xdot_last[i] = c * u_new[i] + sdot[i];
                }
                x.copy_from_slice(&u_new[..n_x]);
                z.copy_from_slice(&u_new[n_x..]);
                q.copy_from_slice(&q_cand);
                qdot_last.copy_from_slice(&qdot_cand);
                x_hist.insert(0, x.clone());
                q_hist.insert(0, q.clone());
                let keep = cfg.max_order + 1;
                x_hist.truncate(keep);
                q_hist.truncate(keep);
                naccept += 1;
                steps_since_jac += 1;
                // The error estimate is order-agnostic, so climbing to
                // the highest supported order as history builds up only
                // sharpens the actual accuracy.
                let cap = cfg.max_order.min(x_hist.len());
                if order < cap {
                    order += 1;
                }
                debug!("step to t = {t:.6e} accepted: h = {h_used:.3e}, \
                        order = {order}, err = {err:.2e}");
                // Growing the step restarts the uniform history, so it
                // only pays off when the estimate leaves a clear margin.
                if factor >= 2. {
                    h = (h_used * factor).clamp(h_min, h_max);
                } else {
                    h = h_used;
                }
            } else {
                nreject += 1;
                jac_fresh = false;
                order = 1;
                x_hist.truncate(1);
                q_hist.truncate(1);
                warn!("step to t = {t_new:.6e} rejected: err = {err:.2e}, \
                       h = {h_used:.3e}");
                h = (h_used * factor).clamp(h_min, h_max);
            }
        }
        debug!("reached t = {t:.6e}: {naccept} steps, {nreject} rejected");
        Ok(IntegratorOutput { xf: x, qf: q })
    }
}

/// Dimensions and interval only; the system and solver payloads are
/// trait objects and elided.
impl fmt::Debug for Integrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Integrator")
            .field("n_x", &self.n_x())
            .field("n_z", &self.n_z())
            .field("n_p", &self.n_p())
            .field("n_q", &self.n_q())
            .field("t0", &self.t0)
            .field("tf", &self.tf)
            .field("implicit", &self.repr.is_implicit())
            .finish_non_exhaustive()
    }
}

////////////////////////////////////////////////////////////////////////
//
// Stepping helpers

/// Component counts under the primal tolerances; everything past them
/// is the sensitivity block of an augmented instance.
#[derive(Clone, Copy)]
struct Split {
    n_primal_x: usize,
    n_primal_z: usize,
    n_primal_q: usize,
}

fn x_tols(cfg: &Config, split: Split, i: usize) -> (f64, f64) {
    if i < split.n_primal_x {
        (cfg.reltol, cfg.abstol)
    } else {
        (cfg.fsens_reltol, cfg.fsens_abstol)
    }
}

fn z_tols(cfg: &Config, split: Split, i: usize) -> (f64, f64) {
    if i < split.n_primal_z {
        (cfg.reltol, cfg.abstol)
    } else {
        (cfg.fsens_reltol, cfg.fsens_abstol)
    }
}

/// Error weights over the Newton unknowns u = [x, z].
fn fill_newton_weights(cfg: &Config, split: Split, n_x: usize, u: &[f64],
                       w: &mut Vec<f64>) {
    w.clear();
    for (i, &v) in u.iter().enumerate() {
        let (rt, at) = if i < n_x {
            x_tols(cfg, split, i)
        } else {
            z_tols(cfg, split, i - n_x)
        };
        w.push(at + rt * v.abs());
    }
}

/// Weighted RMS of the local error estimate over the components under
/// error control: differential states (the sensitivity block only with
/// `fsens_err_con`) and quadratures with `quad_err_con`.  Algebraic
/// variables never enter the step error test.
#[allow(clippy::too_many_arguments)]
fn error_norm(cfg: &Config, split: Split, e_x: &[f64], x_old: &[f64],
              x_new: &[f64], e_q: &[f64], q_old: &[f64], q_new: &[f64])
              -> f64 {
    let mut acc = 0.;
    let mut m = 0usize;
    for (i, &e) in e_x.iter().enumerate() {
        if i >= split.n_primal_x && !cfg.fsens_err_con {
            continue
        }
        let (rt, at) = x_tols(cfg, split, i);
        let w = at + rt * x_old[i].abs().max(x_new[i].abs());
        acc += (e / w) * (e / w);
        m += 1;
    }
    if cfg.quad_err_con {
        for (i, &e) in e_q.iter().enumerate() {
            if i >= split.n_primal_q && !cfg.fsens_err_con {
                continue
            }
            let (rt, at) = if i < split.n_primal_q {
                (cfg.reltol, cfg.abstol)
            } else {
                (cfg.fsens_reltol, cfg.fsens_abstol)
            };
            let w = at + rt * q_old[i].abs().max(q_new[i].abs());
            acc += (e / w) * (e / w);
            m += 1;
        }
    }
    if m == 0 { 0. } else { (acc / m as f64).sqrt() }
}

fn wrms(v: &[f64], w: &[f64]) -> f64 {
    if v.is_empty() {
        return 0.
    }
    let acc: f64 = v.iter().zip(w).map(|(e, w)| (e / w) * (e / w)).sum();
    (acc / v.len() as f64).sqrt()
}

fn norm2(v: &[f64]) -> f64 {
    v.iter().map(|x| x * x).sum::<f64>().sqrt()
}

fn initial_step(x: &[f64], xdot: &[f64], span: f64) -> f64 {
    let xn = norm2(x);
    let dn = norm2(xdot);
    if dn > 1e-10 && xn > 0. {
        0.01 * xn / dn
    } else {
        0.01 * span
    }
}

/// Residual of one BDF step at the candidate u = [x, z], with
/// ẋ = c·x + sdot.
fn step_residual(repr: &Repr, t: f64, u: &[f64], c: f64, sdot: &[f64],
                 p: &[f64], r: &mut [f64], e: &mut EvalBufs) {
    let n_x = repr.n_x();
    let n_z = repr.n_z();
    let EvalBufs { vals, work, ode, alg, quad, xdot, .. } = e;
    ode.resize(n_x, 0.);
    alg.resize(n_z, 0.);
    quad.resize(repr.n_q(), 0.);
    xdot.resize(n_x, 0.);
    for i in 0..n_x {
        xdot[i] = c * u[i] + sdot[i];
    }
    let implicit = repr.is_implicit();
    repr.eval(t, &u[..n_x], &u[n_x..],
              if implicit { xdot.as_slice() } else { &[] }, p,
              ode, alg, quad, vals, work);
    if implicit {
        r[..n_x].copy_from_slice(ode);
    } else {
        for i in 0..n_x {
            r[i] = xdot[i] - ode[i];
        }
    }
    r[n_x..].copy_from_slice(alg);
}

/// Iteration matrix ∂R/∂u + c·∂R/∂u̇ by one-sided differences of the
/// step residual.
fn fd_step_matrix(repr: &Repr, t: f64, u: &[f64], c: f64, sdot: &[f64],
                  p: &[f64], a: &mut [f64], e: &mut EvalBufs) {
    let n = u.len();
    let mut r0 = vec![0.; n];
    let mut r1 = vec![0.; n];
    let mut up = u.to_vec();
    step_residual(repr, t, u, c, sdot, p, &mut r0, e);
    let d0 = f64::EPSILON.sqrt();
    for j in 0..n {
        let d = d0 * (1. + u[j].abs());
        up[j] = u[j] + d;
        step_residual(repr, t, &up, c, sdot, p, &mut r1, e);
        up[j] = u[j];
        for i in 0..n {
            a[i + j * n] = (r1[i] - r0[i]) / d;
        }
    }
}

/// Iteration matrix from the precomputed symbolic blocks.
#[allow(clippy::too_many_arguments)]
fn exact_step_matrix(dae: &DaeSystem, ex: &ExactJac, t: f64, u: &[f64],
                     c: f64, sdot: &[f64], p: &[f64], a: &mut [f64],
                     e: &mut EvalBufs) {
    let n_x = dae.n_x();
    let n = n_x + dae.n_z();
    let EvalBufs { vals, work, xdot, jxd, .. } = e;
    xdot.resize(n_x, 0.);
    for i in 0..n_x {
        xdot[i] = c * u[i] + sdot[i];
    }
    dae.pack_inputs(t, &u[..n_x], &u[n_x..], xdot, p, vals);
    dae.graph.eval_into(&ex.d_du, vals, a, work);
    if dae.is_implicit() {
        jxd.resize(n * n_x, 0.);
        dae.graph.eval_into(&ex.d_dxdot, vals, jxd, work);
        for j in 0..n_x {
            for i in 0..n {
                a[i + j * n] += c * jxd[i + j * n];
            }
        }
    } else {
        // R = ẋ − f on the differential rows, g below.
        for j in 0..n {
            for i in 0..n_x {
                a[i + j * n] = -a[i + j * n];
            }
        }
        for j in 0..n_x {
            a[j + j * n] += c;
        }
    }
}

/// Residual of the consistency conditions at t₀ over the unknowns `w`
/// (z in explicit form, [ẋ, z] in implicit form).
fn ic_residual(repr: &Repr, t0: f64, x0: &[f64], w: &[f64], p: &[f64],
               r: &mut [f64], e: &mut EvalBufs) {
    let n_x = repr.n_x();
    let n_z = repr.n_z();
    let EvalBufs { vals, work, ode, alg, quad, .. } = e;
    ode.resize(n_x, 0.);
    alg.resize(n_z, 0.);
    quad.resize(repr.n_q(), 0.);
    if repr.is_implicit() {
        repr.eval(t0, x0, &w[n_x..], &w[..n_x], p, ode, alg, quad, vals, work);
        r[..n_x].copy_from_slice(ode);
        r[n_x..].copy_from_slice(alg);
    } else {
        repr.eval(t0, x0, w, &[], p, ode, alg, quad, vals, work);
        r.copy_from_slice(alg);
    }
}

fn make_solver(creator: Option<&CreatorFn>, cfg: &Config, opts: &Options,
               sp: &Sparsity) -> Result<Box<dyn LinearSolver>> {
    match cfg.linear_solver {
        LinsolKind::UserDefined => match creator {
            Some(make) => make(sp, opts.dict_opt("linear_solver_options")?),
            None => Err(invalid("linear_solver",
                                "\"user_defined\" needs a solver injected \
                                 with set_linear_solver or a creator")),
        },
        LinsolKind::Dense => Ok(Box::new(DenseQr::new())),
        LinsolKind::Banded => Ok(Box::new(Banded::new())),
        LinsolKind::Iterative => Ok(Box::new(Iterative::new(
            cfg.iterative_solver, cfg.max_krylov, cfg.pretype,
            cfg.use_preconditioner))),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use super::{Integrator, InterpolationType, SensitivityMethod};
    use crate::{DaeOutputs, DaeSystem, Error, Options, ResidualFn, Schema};
    use crate::options::OptValue;

    fn decay() -> DaeSystem {
        DaeSystem::explicit(1, 0, 1, |g, v| {
            let px = g.mul(v.p[0], v.x[0]);
            let rhs = g.neg(px);
            DaeOutputs { ode: vec![rhs], alg: vec![], quad: vec![] }
        }).unwrap()
    }

    fn opts() -> Options {
        Options::new(Schema::integrator())
    }

    #[test]
    fn decay_matches_exponential() {
        let mut ivp = Integrator::new(decay(), 0., 1., opts()).unwrap();
        let out = ivp.solve(&[1.], &[1.]).unwrap();
        assert_eq_tol!(out.xf[0], (-1f64).exp(), 1e-5);
    }

    #[test]
    fn exact_jacobian_matches_finite_differences() {
        let o = opts().with("exact_jacobian", OptValue::Bool(true)).unwrap();
        let mut ivp = Integrator::new(decay(), 0., 1., o).unwrap();
        let exact = ivp.solve(&[1.], &[2.]).unwrap();
        let mut ivp = Integrator::new(decay(), 0., 1., opts()).unwrap();
        let fd = ivp.solve(&[1.], &[2.]).unwrap();
        // Two iteration matrices, one solution: both runs hit the
        // same tolerance target.
        assert_eq_tol!(exact.xf[0], (-2f64).exp(), 1e-5);
        assert_eq_tol!(fd.xf[0], (-2f64).exp(), 1e-5);
    }

    #[test]
    fn harmonic_oscillator() {
        // ẋ = y, ẏ = −x; x(t) = sin t from (0, 1).
        let dae = DaeSystem::explicit(2, 0, 0, |g, v| {
            let mx = g.neg(v.x[0]);
            DaeOutputs { ode: vec![v.x[1], mx], alg: vec![], quad: vec![] }
        }).unwrap();
        let mut ivp = Integrator::new(dae, 0., 1., opts()).unwrap();
        let out = ivp.solve(&[0., 1.], &[]).unwrap();
        assert_eq_tol!(out.xf[0], 1f64.sin(), 1e-4);
        assert_eq_tol!(out.xf[1], 1f64.cos(), 1e-4);
    }

    #[test]
    fn implicit_form_matches_explicit() {
        // 0 = ẋ + p·x is the decay equation in residual form.
        let dae = DaeSystem::implicit(1, 0, 1, |g, v| {
            let px = g.mul(v.p[0], v.x[0]);
            let r = g.add(v.xdot[0], px);
            DaeOutputs { ode: vec![r], alg: vec![], quad: vec![] }
        }).unwrap();
        let mut ivp = Integrator::new(dae, 0., 1., opts()).unwrap();
        let out = ivp.solve(&[1.], &[1.]).unwrap();
        assert_eq_tol!(out.xf[0], (-1f64).exp(), 1e-5);
    }

    #[test]
    fn algebraic_variable_is_kept_consistent() {
        // ẋ = z, 0 = z − sin t, so x(T) = x₀ + 1 − cos T.
        let dae = DaeSystem::explicit(1, 1, 0, |g, v| {
            let st = g.sin(v.t);
            let r = g.sub(v.z[0], st);
            DaeOutputs { ode: vec![v.z[0]], alg: vec![r], quad: vec![] }
        }).unwrap();
        let mut ivp = Integrator::new(dae, 0., 2., opts()).unwrap();
        let out = ivp.solve(&[0.5], &[]).unwrap();
        assert_eq_tol!(out.xf[0], 0.5 + 1. - 2f64.cos(), 1e-4);
    }

    #[test]
    fn quadrature_of_decay() {
        // q = ∫₀ᵀ x dt = x₀(1 − e^{−T}).
        let dae = DaeSystem::explicit(1, 0, 0, |g, v| {
            let r = g.neg(v.x[0]);
            DaeOutputs { ode: vec![r], alg: vec![], quad: vec![v.x[0]] }
        }).unwrap();
        let mut ivp = Integrator::new(dae, 0., 1., opts()).unwrap();
        let out = ivp.solve(&[2.], &[]).unwrap();
        assert_eq_tol!(out.qf[0], 2. * (1. - (-1f64).exp()), 1e-4);
    }

    #[test]
    fn stiff_decay() {
        let mut ivp = Integrator::new(decay(), 0., 0.05, opts()).unwrap();
        let out = ivp.solve(&[1.], &[1000.]).unwrap();
        assert!(out.xf[0].abs() < 1e-6, "xf = {}", out.xf[0]);
    }

    #[test]
    fn higher_orders_track_backward_euler() {
        // The default configuration (orders up to 5) must be at least
        // as reliable as the order-1 fallback on the same problem.
        let mut hi = Integrator::new(decay(), 0., 1., opts()).unwrap();
        let hi = hi.solve(&[1.], &[1.]).unwrap();
        let o = opts().with("max_multistep_order", OptValue::Int(1)).unwrap();
        let mut lo = Integrator::new(decay(), 0., 1., o).unwrap();
        let lo = lo.solve(&[1.], &[1.]).unwrap();
        assert_eq_tol!(hi.xf[0], (-1f64).exp(), 1e-5);
        assert_eq_tol!(lo.xf[0], (-1f64).exp(), 1e-5);
    }

    #[test]
    fn debug_formatting_reports_dimensions() {
        let ivp = Integrator::new(decay(), 0., 1., opts()).unwrap();
        let s = format!("{ivp:?}");
        assert!(s.contains("Integrator"), "{s}");
        assert!(s.contains("n_x: 1"), "{s}");
        assert!(s.contains("n_p: 1"), "{s}");
    }

    struct DecayResidual;

    impl ResidualFn for DecayResidual {
        fn n_x(&self) -> usize { 1 }
        fn n_p(&self) -> usize { 1 }
        fn eval(&self, _t: f64, x: &[f64], _z: &[f64], _xdot: &[f64],
                p: &[f64], ode: &mut [f64], _alg: &mut [f64],
                _quad: &mut [f64]) {
            ode[0] = -p[0] * x[0];
        }
    }

    #[test]
    fn callback_system_integrates() {
        let mut ivp = Integrator::from_residual(
            Arc::new(DecayResidual), 0., 1., opts()).unwrap();
        let out = ivp.solve(&[1.], &[1.]).unwrap();
        assert_eq_tol!(out.xf[0], (-1f64).exp(), 1e-5);
    }

    #[test]
    fn exact_jacobian_needs_a_symbolic_system() {
        let o = opts().with("exact_jacobian", OptValue::Bool(true)).unwrap();
        let err = Integrator::from_residual(Arc::new(DecayResidual),
                                            0., 1., o).unwrap_err();
        assert!(matches!(err, Error::InvalidOptionValue { .. }));
    }

    #[test]
    fn zero_time_span_returns_initial_state() {
        let mut ivp = Integrator::new(decay(), 0., 0., opts()).unwrap();
        let out = ivp.solve(&[1.5], &[1.]).unwrap();
        assert_eq!(out.xf, vec![1.5]);
    }

    #[test]
    fn backwards_interval_is_rejected() {
        let mut ivp = Integrator::new(decay(), 0., 1., opts()).unwrap();
        ivp.set_final_time(-1.);
        let err = ivp.solve(&[1.], &[1.]).unwrap_err();
        assert!(matches!(err, Error::InvalidOptionValue { .. }));
    }

    #[test]
    fn step_budget_is_enforced() {
        let o = opts().with("max_num_steps", OptValue::Int(3)).unwrap();
        let mut ivp = Integrator::new(decay(), 0., 100., o).unwrap();
        let err = ivp.solve(&[1.], &[1.]).unwrap_err();
        assert!(matches!(err, Error::TooMuchWork { max_steps: 3, .. }));
    }

    #[test]
    fn banded_and_iterative_backends_agree_with_dense() {
        // Diffusion chain ẋᵢ = x_{i−1} − 2xᵢ + x_{i+1} with a
        // tridiagonal Jacobian.
        let chain = || DaeSystem::explicit(4, 0, 0, |g, v| {
            let n = v.x.len();
            let ode = (0..n).map(|i| {
                let mut terms = vec![(-2., v.x[i])];
                if i > 0 { terms.push((1., v.x[i - 1])) }
                if i + 1 < n { terms.push((1., v.x[i + 1])) }
                g.lincomb(&terms)
            }).collect();
            DaeOutputs { ode, alg: vec![], quad: vec![] }
        }).unwrap();
        let x0 = [1., 0., 0., -1.];

        let mut dense = Integrator::new(chain(), 0., 0.5, opts()).unwrap();
        let want = dense.solve(&x0, &[]).unwrap();

        let o = opts()
            .with("linear_solver", OptValue::Str("banded".into())).unwrap()
            .with("lower_bandwidth", OptValue::Int(1)).unwrap()
            .with("upper_bandwidth", OptValue::Int(1)).unwrap();
        let mut banded = Integrator::new(chain(), 0., 0.5, o).unwrap();
        let got = banded.solve(&x0, &[]).unwrap();
        for (b, d) in got.xf.iter().zip(&want.xf) {
            assert_eq_tol!(b, d, 1e-6);
        }

        let o = opts()
            .with("linear_solver", OptValue::Str("iterative".into())).unwrap()
            .with("use_preconditioner", OptValue::Bool(true)).unwrap()
            .with("pretype", OptValue::Str("left".into())).unwrap();
        let mut krylov = Integrator::new(chain(), 0., 0.5, o).unwrap();
        let got = krylov.solve(&x0, &[]).unwrap();
        for (k, d) in got.xf.iter().zip(&want.xf) {
            assert_eq_tol!(k, d, 1e-6);
        }
    }

    #[test]
    fn user_defined_solver_through_creator() {
        use crate::linear_solver::DenseQr;
        let o = opts()
            .with("linear_solver", OptValue::Str("user_defined".into()))
            .unwrap();
        let mut ivp = Integrator::new(decay(), 0., 1., o).unwrap();
        // Without an injected solver or creator the lazy construction
        // has nothing to build from.
        assert!(ivp.solve(&[1.], &[1.]).is_err());
        ivp.set_linear_solver_creator(Box::new(|_sp, _opts| {
            Ok(Box::new(DenseQr::new()))
        }));
        let out = ivp.solve(&[1.], &[1.]).unwrap();
        assert_eq_tol!(out.xf[0], (-1f64).exp(), 1e-5);
    }

    #[test]
    fn augmented_instance_copies_options_and_interval() {
        let o = opts().with("reltol", OptValue::Real(1e-9)).unwrap();
        let ivp = Integrator::new(decay(), 0., 2., o).unwrap();
        let aug = ivp.augmented(true, true).unwrap();
        assert_eq!(aug.n_x(), 3);
        assert_eq!(aug.n_primal_x, 1);
        assert_eq!(aug.options().real("reltol").unwrap(), 1e-9);
        assert_eq!(aug.tf, 2.);
    }

    #[test]
    fn augmenting_a_callback_is_unsupported() {
        let ivp = Integrator::from_residual(Arc::new(DecayResidual),
                                            0., 1., opts()).unwrap();
        let err = ivp.augmented(true, false).unwrap_err();
        assert!(matches!(err, Error::UnsupportedSensitivityRequest(_)));
    }

    #[test]
    fn augmented_solve_integrates_sensitivities() {
        // ∂x(T)/∂x₀ for ẋ = −x is e^{−T}; seed the direction with 1.
        let base = DaeSystem::explicit(1, 0, 0, |g, v| {
            let r = g.neg(v.x[0]);
            DaeOutputs { ode: vec![r], alg: vec![], quad: vec![] }
        }).unwrap();
        let ivp = Integrator::new(base, 0., 1., opts()).unwrap();
        let mut aug = ivp.augmented(true, false).unwrap();
        assert_eq!(aug.n_x(), 2);
        let out = aug.solve(&[1., 1.], &[]).unwrap();
        assert_eq_tol!(out.xf[1], (-1f64).exp(), 1e-4);
    }

    #[test]
    fn adjoint_configuration_is_parsed_and_kept() {
        let o = opts()
            .with("interpolation_type", OptValue::Str("polynomial".into()))
            .unwrap()
            .with("steps_per_checkpoint", OptValue::Int(50)).unwrap()
            .with("asens_reltol", OptValue::Real(1e-4)).unwrap();
        let ivp = Integrator::new(decay(), 0., 1., o).unwrap();
        let ac = ivp.adjoint_config();
        assert_eq!(ac.interpolation, InterpolationType::Polynomial);
        assert_eq!(ac.steps_per_checkpoint, 50);
        assert_eq!(ac.reltol, 1e-4);
        // Unset backward tolerances fall back to the primal ones.
        assert_eq!(ac.abstol, 1e-8);
        assert_eq!(ac.method, SensitivityMethod::Simultaneous);
    }

    #[test]
    fn integrators_are_send() {
        fn assert_send<T: Send>() {}
        assert_send::<Integrator>();
    }
}
