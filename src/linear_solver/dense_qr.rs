//! Dense QR factorization with Householder reflectors.
//!
//! The factored matrix is kept in one column-major buffer: R in the
//! upper triangle, the reflector vectors below the diagonal (leading 1
//! implicit), with their scale factors in `tau`.  Solves apply the
//! reflectors column by column and finish with a triangular solve;
//! transposed solves run the same two stages in the opposite order.

use crate::{Error, Result};
use crate::options::Options;
use super::{LinearSolver, Sparsity};

/// Right-hand sides processed per chunk when none is configured.
const DEFAULT_MAX_NRHS: usize = 10;

pub struct DenseQr {
    n: usize,
    /// Factored matrix, column-major.
    mat: Vec<f64>,
    /// Householder scale factors.
    tau: Vec<f64>,
    work: Vec<f64>,
    max_nrhs: usize,
    has_pattern: bool,
    factorized: bool,
}

impl Default for DenseQr {
    fn default() -> Self { Self::new() }
}

impl DenseQr {
    pub fn new() -> Self {
        DenseQr {
            n: 0,
            mat: Vec::new(),
            tau: Vec::new(),
            work: Vec::new(),
            max_nrhs: DEFAULT_MAX_NRHS,
            has_pattern: false,
            factorized: false,
        }
    }

    /// Build from a validated option set (see
    /// [`Schema::dense_qr`](crate::Schema::dense_qr)).
    pub fn with_options(opts: &Options) -> Result<Self> {
        let max_nrhs = opts.int("max_nrhs")?;
        if max_nrhs < 1 {
            return Err(Error::InvalidOptionValue {
                name: "max_nrhs".to_string(),
                why: format!("must be at least 1, got {max_nrhs}"),
            })
        }
        let mut qr = Self::new();
        qr.max_nrhs = max_nrhs as usize;
        Ok(qr)
    }

    /// Apply reflector `k` to the columns of `b` held in `cols`.
    fn apply_reflector(&mut self, k: usize, b: &mut [f64],
                       cols: std::ops::Range<usize>) {
        let n = self.n;
        for (wi, j) in cols.clone().enumerate() {
            let col = &b[j * n..(j + 1) * n];
            let mut w = col[k];
            for i in k + 1..n {
                w += self.mat[i + k * n] * col[i];
            }
            self.work[wi] = w * self.tau[k];
        }
        for (wi, j) in cols.enumerate() {
            let w = self.work[wi];
            let col = &mut b[j * n..(j + 1) * n];
            col[k] -= w;
            for i in k + 1..n {
                col[i] -= w * self.mat[i + k * n];
            }
        }
    }

    /// x ← R⁻¹x for each column in `cols`.
    fn solve_r(&self, b: &mut [f64], cols: std::ops::Range<usize>) {
        let n = self.n;
        for j in cols {
            let col = &mut b[j * n..(j + 1) * n];
            for k in (0..n).rev() {
                let mut s = col[k];
                for i in k + 1..n {
                    s -= self.mat[k + i * n] * col[i];
                }
                col[k] = s / self.mat[k + k * n];
            }
        }
    }

    /// x ← R⁻ᵀx for each column in `cols`.
    fn solve_rt(&self, b: &mut [f64], cols: std::ops::Range<usize>) {
        let n = self.n;
        for j in cols {
            let col = &mut b[j * n..(j + 1) * n];
            for k in 0..n {
                let mut s = col[k];
                for i in 0..k {
                    s -= self.mat[i + k * n] * col[i];
                }
                col[k] = s / self.mat[k + k * n];
            }
        }
    }
}

impl LinearSolver for DenseQr {
    fn reset(&mut self, sp: &Sparsity) -> Result<()> {
        if sp.nrow() != sp.ncol() {
            return Err(Error::FactorizationFailure(format!(
                "dense QR needs a square pattern, got {}×{}",
                sp.nrow(), sp.ncol())))
        }
        self.n = sp.nrow();
        self.mat.resize(self.n * self.n, 0.);
        self.tau.resize(self.n, 0.);
        self.work.resize(self.n.max(self.max_nrhs) + 100, 0.);
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
        self.factorized = false;
        self.mat.copy_from_slice(a);
        let scale = a.iter().fold(0., |m: f64, &v| m.max(v.abs()));
        let tol = f64::EPSILON * n as f64 * scale;
        let m = &mut self.mat;
        for k in 0..n {
            let mut nrm2 = 0.;
            for i in k..n {
                nrm2 += m[i + k * n] * m[i + k * n];
            }
            let nrm = nrm2.sqrt();
            if nrm <= tol {
                return Err(Error::SingularMatrix { col: k })
            }
            let alpha = m[k + k * n];
            let beta = if alpha >= 0. { -nrm } else { nrm };
            self.tau[k] = (beta - alpha) / beta;
            let inv = 1. / (alpha - beta);
            for i in k + 1..n {
                m[i + k * n] *= inv;
            }
            m[k + k * n] = beta;
            for j in k + 1..n {
                let mut w = m[k + j * n];
                for i in k + 1..n {
                    w += m[i + k * n] * m[i + j * n];
                }
                w *= self.tau[k];
                m[k + j * n] -= w;
                for i in k + 1..n {
                    m[i + j * n] -= w * m[i + k * n];
                }
            }
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
        // Right-hand sides are processed in chunks of at most
        // `max_nrhs` columns; `work` holds one coefficient per column
        // of the active chunk.
        let mut lo = 0;
        while lo < nrhs {
            let hi = nrhs.min(lo + self.max_nrhs);
            if transpose {
                // Aᵀ = RᵀQᵀ: triangular stage first, reflectors in
                // reverse order after.
                self.solve_rt(b, lo..hi);
                for k in (0..n).rev() {
                    self.apply_reflector(k, b, lo..hi);
                }
            } else {
                for k in 0..n {
                    self.apply_reflector(k, b, lo..hi);
                }
                self.solve_r(b, lo..hi);
            }
            lo = hi;
        }
        Ok(())
    }
}
