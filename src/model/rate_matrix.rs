//! # Reversible Rate Matrices
//!
//! Time-reversible substitution rate matrices `Q` built from symmetric
//! exchangeabilities and stationary frequencies, normalized so that the
//! expected substitution rate `-Σ π_i q_ii` is one. Branch lengths are then
//! expected substitutions per site.
//!
//! `P(t) = exp(Qt)` is evaluated through the eigendecomposition of the
//! symmetrized matrix `B = Π^{1/2} Q Π^{-1/2}`, computed once per matrix by
//! cyclic Jacobi rotations.
//!
//! Construction never fails. A parameter set that does not describe a rate
//! matrix (negative rates, frequencies off the simplex) produces an
//! *invalid* matrix whose transition probabilities are all `None`, so the
//! likelihood rejects the state instead of erroring.

use crate::model::transition::TransitionMatrix;

const JACOBI_TOLERANCE: f64 = 1e-15;
const SIMPLEX_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq)]
pub struct RateMatrix<const N: usize> {
    q: [[f64; N]; N],
    frequencies: [f64; N],
    sqrt_pi: [f64; N],
    eigenvalues: [f64; N],
    /// eigenvectors[i][k]: component i of eigenvector k of the symmetrized matrix
    eigenvectors: [[f64; N]; N],
    valid: bool,
}

impl<const N: usize> RateMatrix<N> {
    /// Reversible matrix from exchangeabilities (upper triangle is read) and
    /// stationary frequencies.
    pub fn reversible(exchangeabilities: &[[f64; N]; N], frequencies: [f64; N]) -> Self {
        let mut valid = frequencies.iter().all(|&f| f.is_finite() && f > 0.0)
            && (frequencies.iter().sum::<f64>() - 1.0).abs() <= SIMPLEX_TOLERANCE;

        let mut q = [[0.0; N]; N];
        for i in 0..N {
            for j in (i + 1)..N {
                let r = exchangeabilities[i][j];
                if !(r.is_finite() && r >= 0.0) {
                    valid = false;
                }
                q[i][j] = r * frequencies[j];
                q[j][i] = r * frequencies[i];
            }
        }
        for i in 0..N {
            let off_diag: f64 = (0..N).filter(|&j| j != i).map(|j| q[i][j]).sum();
            q[i][i] = -off_diag;
        }

        let mu: f64 = (0..N).map(|i| -frequencies[i] * q[i][i]).sum();
        if !(mu.is_finite() && mu > 0.0) {
            valid = false;
        } else {
            for row in q.iter_mut() {
                for x in row.iter_mut() {
                    *x /= mu;
                }
            }
        }

        let mut matrix = Self {
            q,
            frequencies,
            sqrt_pi: [0.0; N],
            eigenvalues: [0.0; N],
            eigenvectors: [[0.0; N]; N],
            valid,
        };
        if valid {
            matrix.decompose();
        }
        matrix
    }

    fn decompose(&mut self) {
        for i in 0..N {
            self.sqrt_pi[i] = self.frequencies[i].sqrt();
        }
        let mut b = [[0.0; N]; N];
        for i in 0..N {
            for j in 0..N {
                b[i][j] = self.sqrt_pi[i] * self.q[i][j] / self.sqrt_pi[j];
            }
        }
        let (values, vectors) = jacobi_eigen(b);
        self.eigenvalues = values;
        self.eigenvectors = vectors;
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn q(&self) -> &[[f64; N]; N] {
        &self.q
    }

    pub fn stationary_frequencies(&self) -> &[f64; N] {
        &self.frequencies
    }

    pub fn eigenvalues(&self) -> &[f64; N] {
        &self.eigenvalues
    }

    /// `exp(Qt)`, or `None` for an invalid matrix or a negative or
    /// non-finite time.
    pub fn transition_probabilities(&self, t: f64) -> Option<TransitionMatrix<N>> {
        if !self.valid || !t.is_finite() || t < 0.0 {
            return None;
        }
        if t == 0.0 {
            return Some(TransitionMatrix::identity());
        }
        let mut exp_lambda = [0.0; N];
        for k in 0..N {
            exp_lambda[k] = (self.eigenvalues[k] * t).exp();
        }

        let mut rows = [[0.0; N]; N];
        for i in 0..N {
            for j in 0..N {
                let mut sum = 0.0;
                for k in 0..N {
                    sum += self.eigenvectors[i][k] * exp_lambda[k] * self.eigenvectors[j][k];
                }
                rows[i][j] = (sum * self.sqrt_pi[j] / self.sqrt_pi[i]).max(0.0);
            }
        }
        Some(TransitionMatrix::from_rows(rows))
    }
}

impl RateMatrix<4> {
    /// Jukes-Cantor: equal rates and frequencies.
    pub fn jc69() -> Self {
        Self::f81([0.25; 4])
    }

    /// Felsenstein 1981: equal rates, free frequencies.
    pub fn f81(frequencies: [f64; 4]) -> Self {
        Self::gtr([1.0; 6], frequencies)
    }

    /// Hasegawa-Kishino-Yano: transitions (A<->G, C<->T) at `kappa` times
    /// the transversion rate.
    pub fn hky(kappa: f64, frequencies: [f64; 4]) -> Self {
        Self::gtr([1.0, kappa, 1.0, 1.0, kappa, 1.0], frequencies)
    }

    /// Transition model: `[AC = GT, AG, CT, AT = CG]`.
    pub fn tim(rates: [f64; 4], frequencies: [f64; 4]) -> Self {
        let [ac_gt, ag, ct, at_cg] = rates;
        Self::gtr([ac_gt, ag, at_cg, at_cg, ct, ac_gt], frequencies)
    }

    /// General time-reversible: `[AC, AG, AT, CG, CT, GT]`.
    pub fn gtr(rates: [f64; 6], frequencies: [f64; 4]) -> Self {
        let [ac, ag, at, cg, ct, gt] = rates;
        let r = [
            [0.0, ac, ag, at],
            [ac, 0.0, cg, ct],
            [ag, cg, 0.0, gt],
            [at, ct, gt, 0.0],
        ];
        Self::reversible(&r, frequencies)
    }
}

/// Eigendecomposition of a real symmetric matrix by Jacobi rotations on the
/// largest off-diagonal element.
fn jacobi_eigen<const N: usize>(mut a: [[f64; N]; N]) -> ([f64; N], [[f64; N]; N]) {
    let mut v = [[0.0; N]; N];
    for (i, row) in v.iter_mut().enumerate() {
        row[i] = 1.0;
    }

    for _ in 0..(50 * N * N).max(1) {
        let mut max_val = 0.0f64;
        let (mut p, mut q) = (0, 0);
        for i in 0..N {
            for j in (i + 1)..N {
                if a[i][j].abs() > max_val {
                    max_val = a[i][j].abs();
                    p = i;
                    q = j;
                }
            }
        }
        if max_val < JACOBI_TOLERANCE {
            break;
        }

        let theta = if (a[p][p] - a[q][q]).abs() < 1e-30 {
            std::f64::consts::FRAC_PI_4
        } else {
            0.5 * (2.0 * a[p][q] / (a[p][p] - a[q][q])).atan()
        };
        let (s, c) = theta.sin_cos();

        for row in a.iter_mut() {
            let (ap, aq) = (row[p], row[q]);
            row[p] = c * ap + s * aq;
            row[q] = -s * ap + c * aq;
        }
        for j in 0..N {
            let (ap, aq) = (a[p][j], a[q][j]);
            a[p][j] = c * ap + s * aq;
            a[q][j] = -s * ap + c * aq;
        }
        a[p][q] = 0.0;
        a[q][p] = 0.0;

        for row in v.iter_mut() {
            let (vp, vq) = (row[p], row[q]);
            row[p] = c * vp + s * vq;
            row[q] = -s * vp + c * vq;
        }
    }

    let mut values = [0.0; N];
    for i in 0..N {
        values[i] = a[i][i];
    }
    (values, v)
}
