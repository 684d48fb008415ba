//! # Per-Site State Kernels
//!
//! The two arithmetic primitives of pruning, applied once per
//! (node, mixture, site):
//! - `propagate`: matrix-vector product `out[r] = Σ_t P[r][t] · v[t]`
//! - `product`: element-wise product of child vectors
//!
//! Backends are zero-sized types selected once at engine construction and
//! monomorphized into the hot loops. Every backend sums over `t` in
//! ascending order without fused multiply-add, so the SIMD kernel produces
//! the same bits as the scalar one.

use wide::f64x4;

use crate::model::transition::TransitionMatrix;

pub trait LikelihoodKernel<const N: usize>: Send + Sync + 'static {
    const NAME: &'static str;

    fn propagate(p: &TransitionMatrix<N>, v: &[f64; N]) -> [f64; N];

    fn product(a: &[f64; N], b: &[f64; N]) -> [f64; N];
}

/// Reference kernel for any state-space size.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScalarKernel;

impl<const N: usize> LikelihoodKernel<N> for ScalarKernel {
    const NAME: &'static str = "scalar";

    #[inline(always)]
    fn propagate(p: &TransitionMatrix<N>, v: &[f64; N]) -> [f64; N] {
        let mut out = [0.0; N];
        for (r, o) in out.iter_mut().enumerate() {
            let row = p.row(r);
            let mut acc = 0.0;
            for t in 0..N {
                acc += row[t] * v[t];
            }
            *o = acc;
        }
        out
    }

    #[inline(always)]
    fn product(a: &[f64; N], b: &[f64; N]) -> [f64; N] {
        let mut out = [0.0; N];
        for i in 0..N {
            out[i] = a[i] * b[i];
        }
        out
    }
}

/// Four-lane kernel for nucleotides using `wide::f64x4`.
///
/// Lane `r` holds the partial sum for ancestral state `r`; each step
/// broadcasts `v[t]` against column `t` of `P`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WideKernel;

impl LikelihoodKernel<4> for WideKernel {
    const NAME: &'static str = "simd";

    #[inline(always)]
    fn propagate(p: &TransitionMatrix<4>, v: &[f64; 4]) -> [f64; 4] {
        let mut acc = f64x4::splat(0.0);
        for t in 0..4 {
            let col = f64x4::from(*p.column(t));
            acc += col * f64x4::splat(v[t]);
        }
        acc.into()
    }

    #[inline(always)]
    fn product(a: &[f64; 4], b: &[f64; 4]) -> [f64; 4] {
        let res = f64x4::from(*a) * f64x4::from(*b);
        res.into()
    }
}
