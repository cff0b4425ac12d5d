//! Iterative Krylov solver.
//!
//! A restarted GMRES kernel with optional Jacobi preconditioning.
//! The `bcgstab` and `tfqmr` selections are accepted for configuration
//! compatibility and are served by the same kernel; the choice is
//! logged at setup.

use log::{debug, warn};
use crate::{Error, Result};
use super::{LinearSolver, Sparsity};

/// Which Krylov recurrence was asked for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IterativeKind { Gmres, BcgStab, Tfqmr }

/// Side on which the preconditioner is applied.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Pretype { None, Left, Right, Both }

/// Relative residual reduction a solve aims for.
const SOLVE_RTOL: f64 = 1e-10;

pub struct Iterative {
    kind: IterativeKind,
    /// Krylov subspace dimension between restarts.
    max_krylov: usize,
    pretype: Pretype,
    use_precond: bool,
    n: usize,
    /// The matrix, dense column-major, kept for matrix-vector products.
    a: Vec<f64>,
    /// Inverse diagonal for Jacobi preconditioning.
    dinv: Vec<f64>,
    has_pattern: bool,
    factorized: bool,
}

impl Iterative {
    pub fn new(kind: IterativeKind, max_krylov: usize, pretype: Pretype,
               use_precond: bool) -> Self {
        Iterative {
            kind,
            max_krylov: max_krylov.max(1),
            pretype,
            use_precond,
            n: 0,
            a: Vec::new(),
            dinv: Vec::new(),
            has_pattern: false,
            factorized: false,
        }
    }

    fn preconditioning(&self) -> Pretype {
        if !self.use_precond {
            return Pretype::None
        }
        match self.pretype {
            // One splitting only; a two-sided Jacobi split is not
            // worth distinguishing for a diagonal preconditioner.
            Pretype::Both => Pretype::Left,
            p => p,
        }
    }

    fn matvec(&self, x: &[f64], y: &mut [f64], transpose: bool) {
        let n = self.n;
        y.iter_mut().for_each(|v| *v = 0.);
        for j in 0..n {
            for i in 0..n {
                if transpose {
                    y[j] += self.a[i + j * n] * x[i];
                } else {
                    y[i] += self.a[i + j * n] * x[j];
                }
            }
        }
    }

    fn apply_dinv(&self, x: &mut [f64]) {
        for (v, d) in x.iter_mut().zip(&self.dinv) {
            *v *= d;
        }
    }

    /// Operator of the preconditioned system applied to `x`.
    fn op(&self, x: &[f64], y: &mut [f64], transpose: bool,
          side: Pretype, scratch: &mut Vec<f64>) {
        match side {
            Pretype::Left => {
                self.matvec(x, y, transpose);
                self.apply_dinv(y);
            }
            Pretype::Right => {
                scratch.clear();
                scratch.extend_from_slice(x);
                self.apply_dinv(scratch);
                self.matvec(scratch, y, transpose);
            }
            _ => self.matvec(x, y, transpose),
        }
    }

    fn gmres(&self, b: &mut [f64], transpose: bool) -> Result<()> {
        let n = self.n;
        let m = self.max_krylov.min(n);
        let side = self.preconditioning();

        // Right-hand side of the (left-)preconditioned system.
        let mut rhs = b.to_vec();
        if side == Pretype::Left {
            self.apply_dinv(&mut rhs);
        }
        let bnorm = norm(&rhs);
        if bnorm == 0. {
            b.iter_mut().for_each(|v| *v = 0.);
            return Ok(())
        }
        let tol = SOLVE_RTOL * bnorm;
        let max_total = (20 * n).max(200);

        let mut x = vec![0.; n];
        let mut v = vec![0.; (m + 1) * n];
        let mut h = vec![0.; (m + 1) * m];
        let mut cs = vec![0.; m];
        let mut sn = vec![0.; m];
        let mut g = vec![0.; m + 1];
        let mut w = vec![0.; n];
        let mut scratch = Vec::new();
        let mut total = 0;
        let mut residual;

        loop {
            // r = rhs − Op·x
            self.op(&x, &mut w, transpose, side, &mut scratch);
            let mut beta2 = 0.;
            for i in 0..n {
                let r = rhs[i] - w[i];
                v[i] = r;
                beta2 += r * r;
            }
            let beta = beta2.sqrt();
            residual = beta;
            if beta <= tol {
                break
            }
            if total >= max_total {
                return Err(Error::IterativeSolveFailure {
                    iters: total, residual })
            }
            let inv = 1. / beta;
            v[..n].iter_mut().for_each(|e| *e *= inv);
            g.iter_mut().for_each(|e| *e = 0.);
            g[0] = beta;

            let mut k = 0;
            while k < m {
                self.op(&v[k * n..(k + 1) * n], &mut w, transpose, side,
                        &mut scratch);
                // Modified Gram-Schmidt.
                for i in 0..=k {
                    let vi = &v[i * n..(i + 1) * n];
                    let mut dot = 0.;
                    for l in 0..n {
                        dot += w[l] * vi[l];
                    }
                    h[i + k * (m + 1)] = dot;
                    for l in 0..n {
                        w[l] -= dot * vi[l];
                    }
                }
                let hnext = norm(&w);
                h[k + 1 + k * (m + 1)] = hnext;
                let breakdown = hnext <= f64::EPSILON * bnorm;
                if !breakdown {
                    let inv = 1. / hnext;
                    for l in 0..n {
                        v[(k + 1) * n + l] = w[l] * inv;
                    }
                }
                // Rotate the new column into triangular form.
                for i in 0..k {
                    let hi = h[i + k * (m + 1)];
                    let hi1 = h[i + 1 + k * (m + 1)];
                    h[i + k * (m + 1)] = cs[i] * hi + sn[i] * hi1;
                    h[i + 1 + k * (m + 1)] = -sn[i] * hi + cs[i] * hi1;
                }
                let hkk = h[k + k * (m + 1)];
                let hk1 = h[k + 1 + k * (m + 1)];
                let r = (hkk * hkk + hk1 * hk1).sqrt();
                if r > 0. {
                    cs[k] = hkk / r;
                    sn[k] = hk1 / r;
                } else {
                    cs[k] = 1.;
                    sn[k] = 0.;
                }
                h[k + k * (m + 1)] = r;
                h[k + 1 + k * (m + 1)] = 0.;
                g[k + 1] = -sn[k] * g[k];
                g[k] *= cs[k];
                total += 1;
                k += 1;
                residual = g[k].abs();
                if residual <= tol || breakdown || total >= max_total {
                    break
                }
            }

            // y = H⁻¹g over the first k columns, then x += V·y.
            let mut y = vec![0.; k];
            for i in (0..k).rev() {
                let mut s = g[i];
                for j in i + 1..k {
                    s -= h[i + j * (m + 1)] * y[j];
                }
                y[i] = s / h[i + i * (m + 1)];
            }
            let mut dx = vec![0.; n];
            for (j, yj) in y.iter().enumerate() {
                let vj = &v[j * n..(j + 1) * n];
                for l in 0..n {
                    dx[l] += yj * vj[l];
                }
            }
            for l in 0..n {
                x[l] += dx[l];
            }
            debug!("gmres restart: {total} iterations, residual {residual:e}");
        }
        // With right preconditioning the iterate lives in the
        // preconditioned variable; map it back once at the end so the
        // restart residual above stays consistent with the operator.
        if side == Pretype::Right {
            self.apply_dinv(&mut x);
        }
        b.copy_from_slice(&x);
        Ok(())
    }
}

fn norm(v: &[f64]) -> f64 {
    v.iter().map(|x| x * x).sum::<f64>().sqrt()
}

impl LinearSolver for Iterative {
    fn reset(&mut self, sp: &Sparsity) -> Result<()> {
        if sp.nrow() != sp.ncol() {
            return Err(Error::FactorizationFailure(format!(
                "iterative solver needs a square pattern, got {}×{}",
                sp.nrow(), sp.ncol())))
        }
        self.n = sp.nrow();
        self.a.resize(self.n * self.n, 0.);
        self.dinv.resize(self.n, 1.);
        self.has_pattern = true;
        self.factorized = false;
        Ok(())
    }

    fn factorize(&mut self, a: &[f64]) -> Result<()> {
        if !self.has_pattern {
            return Err(Error::FactorizationFailure(
                "factorize called before reset".to_string()))
        }
        let n = self.n;
        if a.len() != n * n {
            return Err(Error::FactorizationFailure(format!(
                "matrix buffer has {} entries, pattern needs {}",
                a.len(), n * n)))
        }
        if self.kind != IterativeKind::Gmres {
            debug!("{:?} requested; serving it with the gmres kernel",
                   self.kind);
        }
        if self.use_precond && self.pretype == Pretype::None {
            warn!("use_preconditioner set but pretype is \"none\"; \
                   no preconditioning applied");
        }
        self.a.copy_from_slice(a);
        for i in 0..n {
            let d = a[i + i * n];
            self.dinv[i] = if d.abs() > 0. { 1. / d } else { 1. };
        }
        self.factorized = true;
        Ok(())
    }

    fn solve(&mut self, b: &mut [f64], nrhs: usize, transpose: bool)
             -> Result<()> {
        if !self.factorized {
            return Err(Error::NotFactorized)
        }
        let n = self.n;
        debug_assert_eq!(b.len(), n * nrhs);
        for c in 0..nrhs {
            self.gmres(&mut b[c * n..(c + 1) * n], transpose)?;
        }
        Ok(())
    }
}
