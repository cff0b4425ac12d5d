//! Differential-algebraic systems.
//!
//! A [`DaeSystem`] couples differential states x, algebraic variables z
//! and quadratures q through symbolic expressions:
//!
//! - explicit form:  ẋ = f(t, x, z, p),  0 = g(t, x, z, p)
//! - implicit form:  0 = F(t, x, ẋ, z, p),  0 = g(t, x, ẋ, z, p)
//!
//! with optional quadrature integrands q̇ = h(t, x, z, p).  Systems that
//! cannot be expressed symbolically implement [`ResidualFn`] instead;
//! they integrate like any other system but cannot be differentiated
//! symbolically.

use crate::{Error, Result};
use crate::expr::{ExprGraph, ExprId};

/// The symbolic inputs of a system under construction, handed to the
/// closure given to [`DaeSystem::explicit`] or [`DaeSystem::implicit`].
pub struct DaeVars {
    pub t: ExprId,
    pub x: Vec<ExprId>,
    /// Algebraic variables; empty for pure ODEs.
    pub z: Vec<ExprId>,
    /// State derivatives; empty in explicit form.
    pub xdot: Vec<ExprId>,
    pub p: Vec<ExprId>,
}

/// The symbolic outputs returned by a system-building closure.
pub struct DaeOutputs {
    /// Right-hand sides (explicit form) or residuals (implicit form),
    /// one per differential state.
    pub ode: Vec<ExprId>,
    /// Algebraic residuals, one per algebraic variable.
    pub alg: Vec<ExprId>,
    /// Quadrature integrands; any number.
    pub quad: Vec<ExprId>,
}

/// A symbolically defined DAE system.
///
/// The system owns its expression arena; input variables and output
/// expressions are ids into it.  Values are bound positionally:
/// evaluation takes slices of the same lengths as the variable vectors.
#[derive(Clone, Debug)]
pub struct DaeSystem {
    pub(crate) graph: ExprGraph,
    pub(crate) x: Vec<ExprId>,
    pub(crate) z: Vec<ExprId>,
    pub(crate) xdot: Vec<ExprId>,
    pub(crate) p: Vec<ExprId>,
    pub(crate) ode: Vec<ExprId>,
    pub(crate) alg: Vec<ExprId>,
    pub(crate) quad: Vec<ExprId>,
}

impl DaeSystem {
    /// Build an explicit system ẋ = f(t, x, z, p) with `n_x` states,
    /// `n_z` algebraic variables and `n_p` parameters.
    pub fn explicit(
        n_x: usize, n_z: usize, n_p: usize,
        build: impl FnOnce(&mut ExprGraph, &DaeVars) -> DaeOutputs,
    ) -> Result<Self> {
        Self::with_form(n_x, n_z, n_p, false, build)
    }

    /// Build an implicit system 0 = F(t, x, ẋ, z, p).
    pub fn implicit(
        n_x: usize, n_z: usize, n_p: usize,
        build: impl FnOnce(&mut ExprGraph, &DaeVars) -> DaeOutputs,
    ) -> Result<Self> {
        Self::with_form(n_x, n_z, n_p, true, build)
    }

    fn with_form(
        n_x: usize, n_z: usize, n_p: usize, implicit: bool,
        build: impl FnOnce(&mut ExprGraph, &DaeVars) -> DaeOutputs,
    ) -> Result<Self> {
        let mut graph = ExprGraph::new();
        // Slot order is the evaluation contract: t, x, z, ẋ, p.
        let vars = DaeVars {
            t: graph.var(),
            x: graph.vars(n_x),
            z: graph.vars(n_z),
            xdot: if implicit { graph.vars(n_x) } else { Vec::new() },
            p: graph.vars(n_p),
        };
        let out = build(&mut graph, &vars);
        Self::from_parts(graph, vars.t, vars.x, vars.z, vars.xdot, vars.p,
                         out.ode, out.alg, out.quad)
    }

    /// Assemble a system from an arena and explicit id vectors.  The
    /// variable ids must have been created in the order t, x, z, ẋ, p
    /// so that slot-based evaluation lines up.
    #[allow(clippy::too_many_arguments)]
    pub fn from_parts(
        graph: ExprGraph, t: ExprId,
        x: Vec<ExprId>, z: Vec<ExprId>, xdot: Vec<ExprId>, p: Vec<ExprId>,
        ode: Vec<ExprId>, alg: Vec<ExprId>, quad: Vec<ExprId>,
    ) -> Result<Self> {
        if ode.len() != x.len() {
            return Err(Error::IllFormedSystem(format!(
                "{} states but {} equations", x.len(), ode.len())))
        }
        if alg.len() != z.len() {
            return Err(Error::IllFormedSystem(format!(
                "{} algebraic variables but {} algebraic residuals",
                z.len(), alg.len())))
        }
        if !xdot.is_empty() && xdot.len() != x.len() {
            return Err(Error::IllFormedSystem(format!(
                "{} states but {} derivative variables",
                x.len(), xdot.len())))
        }
        if graph.var_slot(t) != Some(0) {
            return Err(Error::IllFormedSystem(
                "the time variable must occupy slot 0".into()))
        }
        let n_inputs = 1 + x.len() + z.len() + xdot.len() + p.len();
        if graph.num_vars() != n_inputs {
            return Err(Error::IllFormedSystem(format!(
                "arena has {} variables, inputs account for {}",
                graph.num_vars(), n_inputs)))
        }
        for ids in [&ode, &alg, &quad] {
            if !graph.contains_all(ids) {
                return Err(Error::IllFormedSystem(
                    "output expression from a foreign arena".into()))
            }
        }
        Ok(DaeSystem { graph, x, z, xdot, p, ode, alg, quad })
    }

    pub fn n_x(&self) -> usize { self.x.len() }
    pub fn n_z(&self) -> usize { self.z.len() }
    pub fn n_p(&self) -> usize { self.p.len() }
    pub fn n_q(&self) -> usize { self.quad.len() }

    /// True for systems defined through residuals 0 = F(t, x, ẋ, z, p).
    pub fn is_implicit(&self) -> bool { !self.xdot.is_empty() }

    /// Pack input values in slot order.  `xdot` is ignored by explicit
    /// systems.
    pub(crate) fn pack_inputs(&self, t: f64, x: &[f64], z: &[f64],
                              xdot: &[f64], p: &[f64], vals: &mut Vec<f64>) {
        debug_assert_eq!(x.len(), self.n_x());
        debug_assert_eq!(z.len(), self.n_z());
        debug_assert_eq!(p.len(), self.n_p());
        vals.clear();
        vals.push(t);
        vals.extend_from_slice(x);
        vals.extend_from_slice(z);
        if self.is_implicit() {
            debug_assert_eq!(xdot.len(), self.n_x());
            vals.extend_from_slice(xdot);
        }
        vals.extend_from_slice(p);
    }

    /// Evaluate ode, alg and quad outputs at the given inputs.  The
    /// two trailing buffers are scratch space reused across calls.
    #[allow(clippy::too_many_arguments)]
    pub fn eval_into(&self, t: f64, x: &[f64], z: &[f64], xdot: &[f64],
                     p: &[f64], ode: &mut [f64], alg: &mut [f64],
                     quad: &mut [f64],
                     vals: &mut Vec<f64>, work: &mut Vec<f64>) {
        self.pack_inputs(t, x, z, xdot, p, vals);
        self.graph.eval_into(&self.ode, vals, ode, work);
        self.graph.eval_into(&self.alg, vals, alg, work);
        self.graph.eval_into(&self.quad, vals, quad, work);
    }
}

/// Systems given as opaque residual callbacks.
///
/// `eval` fills `ode` with f(t,x,z,p) in explicit form or with the
/// residual F(t,x,ẋ,z,p) in implicit form (`xdot` is empty for the
/// former), `alg` with the algebraic residuals and `quad` with the
/// quadrature integrands.
pub trait ResidualFn: Send + Sync {
    fn n_x(&self) -> usize;
    fn n_z(&self) -> usize { 0 }
    fn n_p(&self) -> usize { 0 }
    fn n_q(&self) -> usize { 0 }
    fn is_implicit(&self) -> bool { false }
    #[allow(clippy::too_many_arguments)]
    fn eval(&self, t: f64, x: &[f64], z: &[f64], xdot: &[f64], p: &[f64],
            ode: &mut [f64], alg: &mut [f64], quad: &mut [f64]);
}
