//! Bridge between `ndarray` (user-facing arrays) and `faer` (dense solvers).
//!
//! The covariance engine works on `ndarray` types throughout and drops into
//! faer for the two operations that dominate its runtime: the symmetric
//! Cholesky factorization of the covariance matrix and the GEMM/GEMV products
//! inside the likelihood gradient. Views are zero-copy whenever the ndarray
//! layout permits it.

use faer::linalg::solvers::{Ldlt as FaerLdlt, Llt as FaerLlt, Solve};
use faer::{Mat, MatMut, MatRef, Par, Side, get_global_parallelism};
use ndarray::{Array1, Array2, ArrayBase, Data, Ix1, Ix2};
use std::marker::PhantomData;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FaerLinalgError {
    #[error("Cholesky factorization failed: matrix is not positive-definite")]
    Cholesky(faer::linalg::solvers::LltError),
    #[error("LDLT factorization failed: {0:?}")]
    Ldlt(faer::linalg::solvers::LdltError),
    #[error("Factorization failed")]
    FactorizationFailed,
}

/// Symmetric factorization for solve-only call sites: LLT when the matrix is
/// numerically PD, LDLT otherwise. No determinant is exposed here; callers
/// that need log|A| require PD and go through `FaerCholesky` instead.
pub enum FaerSymmetricFactor {
    Llt(FaerLlt<f64>),
    Ldlt(FaerLdlt<f64>),
}

impl FaerSymmetricFactor {
    pub fn solve_vec(&self, rhs: &Array1<f64>) -> Array1<f64> {
        let mut rhs = rhs.to_owned();
        let mut rhs_view = array1_to_col_mat_mut(&mut rhs);
        match self {
            FaerSymmetricFactor::Llt(f) => f.solve_in_place(rhs_view.as_mut()),
            FaerSymmetricFactor::Ldlt(f) => f.solve_in_place(rhs_view.as_mut()),
        }
        rhs
    }
}

/// Factorize a symmetric system with an LLT first attempt and LDLT fallback.
pub fn factorize_symmetric_with_fallback<S: Data<Elem = f64>>(
    matrix: &ArrayBase<S, Ix2>,
    side: Side,
) -> Result<FaerSymmetricFactor, FaerLinalgError> {
    let view = FaerArrayView::new(matrix);
    if let Ok(llt) = FaerLlt::new(view.as_ref(), side) {
        return Ok(FaerSymmetricFactor::Llt(llt));
    }
    let ldlt = FaerLdlt::new(view.as_ref(), side).map_err(FaerLinalgError::Ldlt)?;
    Ok(FaerSymmetricFactor::Ldlt(ldlt))
}

#[inline]
fn should_use_faer_matmul(m: usize, n: usize, k: usize) -> bool {
    // Stay on ndarray for tiny products to avoid setup overhead, switch to
    // faer GEMM/GEMV for moderate+ sizes.
    const MIN_DIM: usize = 32;
    const MIN_FLOP_SCALE: usize = 64 * 64;
    (m >= MIN_DIM || n >= MIN_DIM || k >= MIN_DIM)
        && m.saturating_mul(n).saturating_mul(k) >= MIN_FLOP_SCALE
}

#[inline]
pub fn array2_to_mat_mut(array: &mut Array2<f64>) -> MatMut<'_, f64> {
    let (rows, cols) = array.dim();
    let strides = array.strides();
    let s0 = strides[0];
    let s1 = strides[1];
    // SAFETY: dimensions and strides come straight from the live ndarray.
    unsafe { MatMut::from_raw_parts_mut(array.as_mut_ptr(), rows, cols, s0, s1) }
}

#[inline]
pub fn array1_to_col_mat_mut(array: &mut Array1<f64>) -> MatMut<'_, f64> {
    let len = array.len();
    let stride = array.strides()[0];
    // SAFETY: a 1-D array viewed as an n x 1 column; col stride is unused.
    unsafe { MatMut::from_raw_parts_mut(array.as_mut_ptr(), len, 1, stride, 0) }
}

pub(crate) fn mat_to_array(mat: MatRef<'_, f64>) -> Array2<f64> {
    let mut out = Array2::<f64>::zeros((mat.nrows(), mat.ncols()));
    for j in 0..mat.ncols() {
        for i in 0..mat.nrows() {
            out[[i, j]] = mat[(i, j)];
        }
    }
    out
}

/// Borrowed faer view of an ndarray matrix.
///
/// Layouts with non-positive strides can alias or reverse memory traversal,
/// which violates assumptions in faer kernels; those are materialized into a
/// compact owned copy instead.
pub struct FaerArrayView<'a> {
    ptr: *const f64,
    rows: usize,
    cols: usize,
    row_stride: isize,
    col_stride: isize,
    owned: Option<Array2<f64>>,
    _marker: PhantomData<&'a f64>,
}

impl<'a> FaerArrayView<'a> {
    pub fn new<S: Data<Elem = f64>>(array: &'a ArrayBase<S, Ix2>) -> Self {
        let (rows, cols) = array.dim();
        let strides = array.strides();
        if strides[0] <= 0 || strides[1] <= 0 {
            let owned = array.to_owned();
            let owned_strides = owned.strides();
            return Self {
                ptr: owned.as_ptr(),
                rows,
                cols,
                row_stride: owned_strides[0],
                col_stride: owned_strides[1],
                owned: Some(owned),
                _marker: PhantomData,
            };
        }
        Self {
            ptr: array.as_ptr(),
            rows,
            cols,
            row_stride: strides[0],
            col_stride: strides[1],
            owned: None,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn as_ref(&self) -> MatRef<'_, f64> {
        let (ptr, rows, cols, row_stride, col_stride) = if let Some(owned) = &self.owned {
            let strides = owned.strides();
            (
                owned.as_ptr(),
                owned.nrows(),
                owned.ncols(),
                strides[0],
                strides[1],
            )
        } else {
            (
                self.ptr,
                self.rows,
                self.cols,
                self.row_stride,
                self.col_stride,
            )
        };
        // SAFETY: pointer/shape/strides come either from a live ndarray view
        // with positive strides or from the owned compact copy held by self.
        unsafe { MatRef::from_raw_parts(ptr, rows, cols, row_stride, col_stride) }
    }
}

pub struct FaerColView<'a> {
    ptr: *const f64,
    len: usize,
    stride: isize,
    owned: Option<Array1<f64>>,
    _marker: PhantomData<&'a f64>,
}

impl<'a> FaerColView<'a> {
    pub fn new<S: Data<Elem = f64>>(array: &'a ArrayBase<S, Ix1>) -> Self {
        let len = array.len();
        let stride = array.strides()[0];
        if stride <= 0 {
            let owned = array.to_owned();
            return Self {
                ptr: owned.as_ptr(),
                len,
                stride: 1,
                owned: Some(owned),
                _marker: PhantomData,
            };
        }
        Self {
            ptr: array.as_ptr(),
            len,
            stride,
            owned: None,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn as_ref(&self) -> MatRef<'_, f64> {
        let (ptr, len, stride) = if let Some(owned) = &self.owned {
            (owned.as_ptr(), owned.len(), 1)
        } else {
            (self.ptr, self.len, self.stride)
        };
        // SAFETY: analogous to FaerArrayView::as_ref.
        unsafe { MatRef::from_raw_parts(ptr, len, 1, stride, 0) }
    }
}

/// Compute A * B, routing through faer GEMM above the dispatch threshold.
#[inline]
pub fn fast_ab<S1: Data<Elem = f64>, S2: Data<Elem = f64>>(
    a: &ArrayBase<S1, Ix2>,
    b: &ArrayBase<S2, Ix2>,
) -> Array2<f64> {
    use faer::Accum;
    use faer::linalg::matmul::matmul;

    let (n, p) = a.dim();
    let (p_b, q) = b.dim();
    debug_assert_eq!(p, p_b, "A and B must have compatible inner dimensions");

    if !should_use_faer_matmul(n, q, p) {
        return a.dot(b);
    }

    let mut result = Mat::<f64>::zeros(n, q);
    let a_view = FaerArrayView::new(a);
    let b_view = FaerArrayView::new(b);
    let par = if n < 128 || p < 128 || q < 128 {
        Par::Seq
    } else {
        get_global_parallelism()
    };
    matmul(
        result.as_mut(),
        Accum::Replace,
        a_view.as_ref(),
        b_view.as_ref(),
        1.0,
        par,
    );
    mat_to_array(result.as_ref())
}

/// Compute A * v, routing through faer GEMV above the dispatch threshold.
#[inline]
pub fn fast_av<S1: Data<Elem = f64>, S2: Data<Elem = f64>>(
    a: &ArrayBase<S1, Ix2>,
    v: &ArrayBase<S2, Ix1>,
) -> Array1<f64> {
    use faer::Accum;
    use faer::linalg::matmul::matmul;

    let (n, p) = a.dim();
    debug_assert_eq!(p, v.len(), "A cols must match v length");

    if !should_use_faer_matmul(n, 1, p) {
        return a.dot(v);
    }

    let mut result = Mat::<f64>::zeros(n, 1);
    let a_view = FaerArrayView::new(a);
    let v_view = FaerColView::new(v);
    let par = if n < 128 || p < 128 {
        Par::Seq
    } else {
        get_global_parallelism()
    };
    matmul(
        result.as_mut(),
        Accum::Replace,
        a_view.as_ref(),
        v_view.as_ref(),
        1.0,
        par,
    );

    let mut out = Array1::<f64>::zeros(n);
    for i in 0..n {
        out[i] = result[(i, 0)];
    }
    out
}

/// Frobenius inner product <A, B> = sum_ij A_ij B_ij.
///
/// This is the trace identity tr(A^T B) used by the likelihood gradient and
/// the Fisher information; both arguments here are symmetric.
pub fn frob_inner(a: &Array2<f64>, b: &Array2<f64>) -> f64 {
    debug_assert_eq!(a.dim(), b.dim());
    let mut sum = 0.0_f64;
    for (x, y) in a.iter().zip(b.iter()) {
        sum += x * y;
    }
    sum
}

pub struct FaerCholeskyFactor {
    factor: FaerLlt<f64>,
    n: usize,
}

impl FaerCholeskyFactor {
    pub fn solve_vec(&self, rhs: &Array1<f64>) -> Array1<f64> {
        let mut rhs = rhs.to_owned();
        let mut rhs_view = array1_to_col_mat_mut(&mut rhs);
        self.factor.solve_in_place(rhs_view.as_mut());
        rhs
    }

    pub fn solve_mat(&self, rhs: &Array2<f64>) -> Array2<f64> {
        let mut rhs = rhs.to_owned();
        let mut rhs_view = array2_to_mat_mut(&mut rhs);
        self.factor.solve_in_place(rhs_view.as_mut());
        rhs
    }

    /// Inverse of the factorized matrix, via solving against the identity.
    pub fn inverse(&self) -> Array2<f64> {
        let eye = Array2::<f64>::eye(self.n);
        self.solve_mat(&eye)
    }

    /// log |A| = 2 * sum_i log L_ii for A = L L^T.
    pub fn log_det(&self) -> f64 {
        let l = self.factor.L();
        let mut acc = 0.0_f64;
        for i in 0..self.n {
            acc += l[(i, i)].ln();
        }
        2.0 * acc
    }

    pub fn lower_triangular(&self) -> Array2<f64> {
        mat_to_array(self.factor.L())
    }
}

pub trait FaerCholesky {
    fn cholesky(&self, side: Side) -> Result<FaerCholeskyFactor, FaerLinalgError>;
}

impl<S: Data<Elem = f64>> FaerCholesky for ArrayBase<S, Ix2> {
    fn cholesky(&self, side: Side) -> Result<FaerCholeskyFactor, FaerLinalgError> {
        let (rows, cols) = self.dim();
        if rows != cols || !self.iter().all(|v| v.is_finite()) {
            return Err(FaerLinalgError::FactorizationFailed);
        }
        let faer_view = FaerArrayView::new(self);
        let factor = FaerLlt::new(faer_view.as_ref(), side).map_err(FaerLinalgError::Cholesky)?;
        Ok(FaerCholeskyFactor { factor, n: rows })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn cholesky_solves_and_log_det_match_direct_computation() {
        let a = array![[4.0, 1.0, 0.5], [1.0, 3.0, 0.2], [0.5, 0.2, 2.0]];
        let chol = a.cholesky(Side::Lower).expect("SPD matrix must factorize");

        let rhs = array![1.0, -2.0, 0.5];
        let x = chol.solve_vec(&rhs);
        let back = a.dot(&x);
        for i in 0..3 {
            assert!((back[i] - rhs[i]).abs() < 1e-10);
        }

        // det by cofactor expansion of the 3x3.
        let det: f64 = 4.0 * (3.0 * 2.0 - 0.2 * 0.2) - 1.0 * (1.0 * 2.0 - 0.2 * 0.5)
            + 0.5 * (1.0 * 0.2 - 3.0 * 0.5);
        assert!((chol.log_det() - det.ln()).abs() < 1e-10);
    }

    #[test]
    fn cholesky_rejects_indefinite_input() {
        let a = array![[1.0, 2.0], [2.0, 1.0]];
        assert!(a.cholesky(Side::Lower).is_err());
    }

    #[test]
    fn cholesky_rejects_non_finite_input() {
        let a = array![[1.0, f64::NAN], [f64::NAN, 2.0]];
        assert!(matches!(
            a.cholesky(Side::Lower),
            Err(FaerLinalgError::FactorizationFailed)
        ));
    }

    #[test]
    fn inverse_reproduces_identity() {
        let a = array![[2.5, 0.3], [0.3, 1.8]];
        let inv = a.cholesky(Side::Lower).unwrap().inverse();
        let prod = a.dot(&inv);
        for i in 0..2 {
            for j in 0..2 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert!((prod[[i, j]] - expected).abs() < 1e-10);
            }
        }
    }

    #[test]
    fn fast_ab_matches_ndarray_dot() {
        let a = Array2::from_shape_fn((5, 4), |(i, j)| (i as f64) * 0.3 - (j as f64) * 0.7);
        let b = Array2::from_shape_fn((4, 6), |(i, j)| (i as f64) * 1.1 + (j as f64) * 0.2);
        let fast = fast_ab(&a, &b);
        let direct = a.dot(&b);
        for (x, y) in fast.iter().zip(direct.iter()) {
            assert!((x - y).abs() < 1e-12);
        }
    }
}
