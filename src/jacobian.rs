//! Jacobian blocks of the integration map.
//!
//! [`Integrator::jacobian`] differentiates the map (x₀, p) ↦ (x_f, q_f)
//! realized by [`Integrator::solve`].  Symbolic systems are handled by
//! integrating the forward-sensitivity augmentation once and slicing
//! the extra state components into matrices; direction `d` of the
//! augmented final state is column `d` of the assembled block.  Opaque
//! callbacks, and integrators configured with
//! `finite_difference_fsens`, run one extra integration per direction
//! instead.

use log::debug;
use ndarray::{s, Array2};
use crate::{Error, Result};
use crate::integrator::Integrator;

/// Which integrator output a block refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputSel { FinalState, FinalQuad }

/// What a block differentiates with respect to; [`InputSel::None`]
/// asks for the undifferentiated output.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InputSel { InitialState, Parameters, None }

/// One requested block of the integration map's Jacobian.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockRequest {
    pub output: OutputSel,
    pub input: InputSel,
}

impl BlockRequest {
    pub fn new(output: OutputSel, input: InputSel) -> Self {
        BlockRequest { output, input }
    }

    fn differentiates(&self) -> bool {
        self.input != InputSel::None
    }
}

/// One assembled block: a matrix for derivative requests, the raw
/// output vector for the rest.
#[derive(Clone, Debug)]
pub enum JacobianBlock {
    Matrix(Array2<f64>),
    Value(Vec<f64>),
}

impl JacobianBlock {
    pub fn matrix(&self) -> Option<&Array2<f64>> {
        match self {
            JacobianBlock::Matrix(m) => Some(m),
            JacobianBlock::Value(_) => None,
        }
    }

    pub fn value(&self) -> Option<&[f64]> {
        match self {
            JacobianBlock::Matrix(_) => None,
            JacobianBlock::Value(v) => Some(v),
        }
    }
}

/// Outputs of one differentiated integration, ready to slice.
struct Assembled {
    xf: Vec<f64>,
    qf: Vec<f64>,
    /// Sensitivity of the final state, n_x × (ns_x + ns_p): the
    /// initial-state directions first, the parameter directions after.
    d_x: Array2<f64>,
    /// Same layout for the final quadrature, n_q rows.
    d_q: Array2<f64>,
    ns_x: usize,
}

impl Assembled {
    fn block(&self, req: BlockRequest) -> JacobianBlock {
        let full = match req.output {
            OutputSel::FinalState => &self.d_x,
            OutputSel::FinalQuad => &self.d_q,
        };
        match req.input {
            InputSel::InitialState => JacobianBlock::Matrix(
                full.slice(s![.., ..self.ns_x]).to_owned()),
            InputSel::Parameters => JacobianBlock::Matrix(
                full.slice(s![.., self.ns_x..]).to_owned()),
            InputSel::None => JacobianBlock::Value(match req.output {
                OutputSel::FinalState => self.xf.clone(),
                OutputSel::FinalQuad => self.qf.clone(),
            }),
        }
    }
}

/// Direction-major flattened sensitivities as a dense block: direction
/// `d`, stored at `flat[d·m..(d+1)·m]`, becomes column `d`.
fn sens_matrix(flat: &[f64], ns: usize, m: usize) -> Array2<f64> {
    // The slice holds ns·m entries by construction.
    Array2::from_shape_vec((ns, m), flat.to_vec()).unwrap().reversed_axes()
}

impl Integrator {
    /// Jacobian blocks of the map (x₀, p) ↦ (x_f, q_f).
    ///
    /// Each request names an output and an input to differentiate it
    /// with respect to; blocks come back in request order.  Derivative
    /// blocks are n_x×k (or n_q×k) matrices, where k counts the
    /// components of the selected input; [`InputSel::None`] yields the
    /// raw output of a plain [`solve`](Integrator::solve).
    ///
    /// Derivatives are exact up to integration tolerances when the
    /// system is symbolic, where they come from one integration of the
    /// forward-sensitivity augmentation.  Systems the builder cannot
    /// differentiate (opaque callbacks), and integrators configured
    /// with `finite_difference_fsens`, are served by repeated
    /// perturbed integrations instead.
    ///
    /// Requesting a quadrature derivative from a system without
    /// quadratures fails with [`Error::InvalidBlockRequest`].
    pub fn jacobian(&mut self, x0: &[f64], p: &[f64],
                    requests: &[BlockRequest])
                    -> Result<Vec<JacobianBlock>> {
        let n_x = self.n_x();
        let n_q = self.n_q();
        let mut with_x = false;
        let mut with_p = false;
        for req in requests {
            if req.differentiates() && req.output == OutputSel::FinalQuad
                && n_q == 0 {
                return Err(Error::InvalidBlockRequest(
                    "a final-quadrature derivative was requested, but \
                     the system has no quadratures".to_string()))
            }
            match req.input {
                InputSel::InitialState => with_x = true,
                InputSel::Parameters => with_p = true,
                InputSel::None => {}
            }
        }
        let ns_x = if with_x { n_x } else { 0 };
        let ns_p = if with_p { self.n_p() } else { 0 };
        let ns = ns_x + ns_p;

        let asm = if ns == 0 {
            // Raw outputs, or derivative blocks with zero columns: one
            // plain integration serves every request.
            let out = self.solve(x0, p)?;
            Assembled {
                d_x: Array2::zeros((n_x, 0)),
                d_q: Array2::zeros((n_q, 0)),
                xf: out.xf,
                qf: out.qf,
                ns_x,
            }
        } else if self.cfg.finite_difference_fsens {
            self.fd_jacobian(x0, p, with_x, with_p)?
        } else {
            match self.augmented(with_x, with_p) {
                Ok(mut aug) => {
                    // Unit seeds on the diagonal of the initial-state
                    // directions; parameter directions start from zero
                    // and pick their seed up inside the augmented
                    // right-hand side.
                    let mut x0_aug = vec![0.; n_x * (1 + ns)];
                    x0_aug[..n_x].copy_from_slice(x0);
                    for d in 0..ns_x {
                        x0_aug[n_x + d * n_x + d] = 1.;
                    }
                    let out = aug.solve(&x0_aug, p)?;
                    Assembled {
                        d_x: sens_matrix(&out.xf[n_x..], ns, n_x),
                        d_q: sens_matrix(&out.qf[n_q..], ns, n_q),
                        xf: out.xf[..n_x].to_vec(),
                        qf: out.qf[..n_q].to_vec(),
                        ns_x,
                    }
                }
                Err(Error::UnsupportedSensitivityRequest(why)) => {
                    debug!("forward sensitivities unavailable ({why}); \
                            falling back to finite differences");
                    self.fd_jacobian(x0, p, with_x, with_p)?
                }
                Err(e) => return Err(e),
            }
        };
        Ok(requests.iter().map(|&req| asm.block(req)).collect())
    }

    /// Generic fallback: one perturbed integration per direction with
    /// one-sided differences against the unperturbed run.
    fn fd_jacobian(&mut self, x0: &[f64], p: &[f64], with_x: bool,
                   with_p: bool) -> Result<Assembled> {
        let n_x = self.n_x();
        let n_q = self.n_q();
        let ns_x = if with_x { n_x } else { 0 };
        let ns_p = if with_p { self.n_p() } else { 0 };
        let base = self.solve(x0, p)?;
        let mut d_x = Array2::zeros((n_x, ns_x + ns_p));
        let mut d_q = Array2::zeros((n_q, ns_x + ns_p));
        // Perturbations scale with the integration tolerance; the
        // difference of two solves cannot resolve anything finer.
        let d0 = self.cfg.reltol.max(f64::EPSILON).sqrt();
        let mut x0p = x0.to_vec();
        let mut pp = p.to_vec();
        for dir in 0..ns_x + ns_p {
            let out;
            let d;
            if dir < ns_x {
                d = d0 * (1. + x0[dir].abs());
                x0p[dir] += d;
                out = self.solve(&x0p, p)?;
                x0p[dir] = x0[dir];
            } else {
                let j = dir - ns_x;
                d = d0 * (1. + p[j].abs());
                pp[j] += d;
                out = self.solve(x0, &pp)?;
                pp[j] = p[j];
            }
            for i in 0..n_x {
                d_x[(i, dir)] = (out.xf[i] - base.xf[i]) / d;
            }
            for i in 0..n_q {
                d_q[(i, dir)] = (out.qf[i] - base.qf[i]) / d;
            }
        }
        Ok(Assembled { d_x, d_q, xf: base.xf, qf: base.qf, ns_x })
    }
}
