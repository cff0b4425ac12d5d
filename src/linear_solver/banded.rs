//! Banded LU factorization with partial pivoting.
//!
//! Matrices are kept in band storage with `2·kl + ku + 1` rows per
//! column: the element (i, j) of the matrix lives at band row
//! `kl + ku + i − j`.  The extra `kl` leading rows absorb the fill-in
//! that row interchanges push into the upper triangle, whose effective
//! bandwidth grows to `kl + ku`.

use crate::{Error, Result};
use super::{LinearSolver, Sparsity};

pub struct Banded {
    n: usize,
    /// Lower and upper bandwidths of the input matrix.
    kl: usize,
    ku: usize,
    /// Band storage, column-major, `ldab` rows per column.
    ab: Vec<f64>,
    ipiv: Vec<usize>,
    has_pattern: bool,
    factorized: bool,
}

impl Default for Banded {
    fn default() -> Self { Self::new() }
}

impl Banded {
    pub fn new() -> Self {
        Banded {
            n: 0, kl: 0, ku: 0,
            ab: Vec::new(),
            ipiv: Vec::new(),
            has_pattern: false,
            factorized: false,
        }
    }

    #[inline]
    fn ldab(&self) -> usize { 2 * self.kl + self.ku + 1 }

    /// Band row of matrix element (i, j).
    #[inline]
    fn at(&self, i: usize, j: usize) -> usize {
        self.kl + self.ku + i - j + j * self.ldab()
    }

    fn forward(&self, b: &mut [f64]) {
        let n = self.n;
        for j in 0..n {
            let p = self.ipiv[j];
            if p != j {
                b.swap(j, p);
            }
            let km = self.kl.min(n - 1 - j);
            for off in 1..=km {
                b[j + off] -= self.ab[self.at(j + off, j)] * b[j];
            }
        }
    }

    fn backward(&self, b: &mut [f64]) {
        let n = self.n;
        let kue = self.kl + self.ku;
        for j in (0..n).rev() {
            let s = b[j] / self.ab[self.at(j, j)];
            b[j] = s;
            for i in j.saturating_sub(kue)..j {
                b[i] -= self.ab[self.at(i, j)] * s;
            }
        }
    }

    /// Uᵀy = b by forward substitution over the widened band.
    fn forward_ut(&self, b: &mut [f64]) {
        let n = self.n;
        let kue = self.kl + self.ku;
        for j in 0..n {
            let mut s = b[j];
            for i in j.saturating_sub(kue)..j {
                s -= self.ab[self.at(i, j)] * b[i];
            }
            b[j] = s / self.ab[self.at(j, j)];
        }
    }

    /// Lᵀx = y (unit diagonal), undoing the interchanges on the way.
    fn backward_lt(&self, b: &mut [f64]) {
        let n = self.n;
        for j in (0..n).rev() {
            let km = self.kl.min(n - 1 - j);
            let mut s = b[j];
            for off in 1..=km {
                s -= self.ab[self.at(j + off, j)] * b[j + off];
            }
            b[j] = s;
            let p = self.ipiv[j];
            if p != j {
                b.swap(j, p);
            }
        }
    }
}

impl LinearSolver for Banded {
    fn reset(&mut self, sp: &Sparsity) -> Result<()> {
        if sp.nrow() != sp.ncol() {
            return Err(Error::FactorizationFailure(format!(
                "banded LU needs a square pattern, got {}×{}",
                sp.nrow(), sp.ncol())))
        }
        let n = sp.nrow();
        let full = n.saturating_sub(1);
        let (kl, ku) = sp.bandwidths().unwrap_or((full, full));
        self.n = n;
        self.kl = kl.min(full);
        self.ku = ku.min(full);
        self.ab.clear();
        self.ab.resize(self.ldab() * n, 0.);
        self.ipiv.clear();
        self.ipiv.resize(n, 0);
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
        // Pack the band; entries outside it are taken to be zero.
        self.ab.iter_mut().for_each(|v| *v = 0.);
        for j in 0..n {
            let lo = j.saturating_sub(self.ku);
            let hi = n.min(j + self.kl + 1);
            for i in lo..hi {
                let idx = self.at(i, j);
                self.ab[idx] = a[i + j * n];
            }
        }
        let (kl, ku) = (self.kl, self.ku);
        let kue = kl + ku;
        for j in 0..n {
            let km = kl.min(n - 1 - j);
            let mut jp = 0;
            let mut pmax = self.ab[self.at(j, j)].abs();
            for off in 1..=km {
                let v = self.ab[self.at(j + off, j)].abs();
                if v > pmax {
                    pmax = v;
                    jp = off;
                }
            }
            if pmax == 0. {
                return Err(Error::SingularMatrix { col: j })
            }
            self.ipiv[j] = j + jp;
            if jp != 0 {
                for col in j..n.min(j + kue + 1) {
                    let a1 = self.at(j, col);
                    let a2 = self.at(j + jp, col);
                    self.ab.swap(a1, a2);
                }
            }
            let piv = self.ab[self.at(j, j)];
            for off in 1..=km {
                let idx = self.at(j + off, j);
                self.ab[idx] /= piv;
            }
            for col in j + 1..n.min(j + kue + 1) {
                let ajc = self.ab[self.at(j, col)];
                if ajc != 0. {
                    for off in 1..=km {
                        let l = self.ab[self.at(j + off, j)];
                        let idx = self.at(j + off, col);
                        self.ab[idx] -= l * ajc;
                    }
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
        for c in 0..nrhs {
            let col = &mut b[c * n..(c + 1) * n];
            if transpose {
                self.forward_ut(col);
                self.backward_lt(col);
            } else {
                self.forward(col);
                self.backward(col);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::Banded;
    use crate::Error;
    use crate::linear_solver::{DenseQr, LinearSolver, Sparsity};

    fn matvec(a: &[f64], n: usize, x: &[f64], transpose: bool) -> Vec<f64> {
        let mut y = vec![0.; n];
        for j in 0..n {
            for i in 0..n {
                if transpose {
                    y[j] += a[i + j * n] * x[i];
                } else {
                    y[i] += a[i + j * n] * x[j];
                }
            }
        }
        y
    }

    // Tridiagonal 4×4, column-major.
    const T4: [f64; 16] = [
        2., -1., 0., 0.,
        -1., 2., -1., 0.,
        0., -1., 2., -1.,
        0., 0., -1., 2.,
    ];

    #[test]
    fn tridiagonal_solve() {
        let mut lu = Banded::new();
        lu.reset(&Sparsity::banded(4, 1, 1)).unwrap();
        lu.factorize(&T4).unwrap();
        let x = [1., 0., -1., 2.];
        let mut b = matvec(&T4, 4, &x, false);
        lu.solve(&mut b, 1, false).unwrap();
        for (got, want) in b.iter().zip(&x) {
            assert_eq_tol!(got, want, 1e-12);
        }
    }

    #[test]
    fn transposed_solve_matches() {
        let mut lu = Banded::new();
        lu.reset(&Sparsity::banded(4, 1, 1)).unwrap();
        // Make it unsymmetric so transposition matters.
        let mut a = T4;
        a[1] = -0.25;
        a[6] = 3.;
        lu.factorize(&a).unwrap();
        let x = [0.5, -1., 2., 1.5];
        let mut b = matvec(&a, 4, &x, true);
        lu.solve(&mut b, 1, true).unwrap();
        for (got, want) in b.iter().zip(&x) {
            assert_eq_tol!(got, want, 1e-12);
        }
    }

    #[test]
    fn pivoting_handles_small_diagonal() {
        // Leading diagonal entry forces an interchange.
        let n = 3;
        let a = [1e-14, 2., 0., 1., 1e-14, 2., 0., 1., 1.];
        let mut lu = Banded::new();
        lu.reset(&Sparsity::banded(n, 1, 1)).unwrap();
        lu.factorize(&a).unwrap();
        let x = [3., -1., 0.5];
        let mut b = matvec(&a, n, &x, false);
        lu.solve(&mut b, 1, false).unwrap();

        let mut qr = DenseQr::new();
        qr.reset(&Sparsity::dense(n, n)).unwrap();
        qr.factorize(&a).unwrap();
        let mut b_qr = matvec(&a, n, &x, false);
        qr.solve(&mut b_qr, 1, false).unwrap();
        for (lu_x, qr_x) in b.iter().zip(&b_qr) {
            assert_eq_tol!(lu_x, qr_x, 1e-9);
        }
    }

    #[test]
    fn zero_pivot_is_singular() {
        let mut lu = Banded::new();
        lu.reset(&Sparsity::banded(3, 0, 0)).unwrap();
        // Diagonal matrix with a zero in the middle.
        let a = [1., 0., 0., 0., 0., 0., 0., 0., 4.];
        let err = lu.factorize(&a).unwrap_err();
        assert!(matches!(err, Error::SingularMatrix { col: 1 }));
    }

    #[test]
    fn dense_pattern_falls_back_to_full_bandwidth() {
        let mut lu = Banded::new();
        lu.reset(&Sparsity::dense(3, 3)).unwrap();
        let a = [2., -1., 0.5, 1., 3., -1., 0., 1., 2.5];
        lu.factorize(&a).unwrap();
        let x = [1., -2., 0.5];
        let mut b = matvec(&a, 3, &x, false);
        lu.solve(&mut b, 1, false).unwrap();
        for (got, want) in b.iter().zip(&x) {
            assert_eq_tol!(got, want, 1e-12);
        }
    }
}
