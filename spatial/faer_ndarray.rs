use faer::diag::DiagRef;
use faer::linalg::solvers;
use faer::{Mat, MatRef, Side};
use ndarray::{Array1, ArrayBase, Data, Ix2};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FaerLinalgError {
    #[error("Self-adjoint eigendecomposition failed: {0:?}")]
    SelfAdjointEigen(solvers::EvdError),
    #[error("General eigendecomposition failed: {0:?}")]
    Eigen(solvers::EvdError),
    #[error("Cholesky factorization failed: {0:?}")]
    Cholesky(solvers::LltError),
    #[error("Sparse weights matrix could not be assembled: {0}")]
    SparseConstruction(String),
}

fn diag_to_array(diag: DiagRef<'_, f64>) -> Array1<f64> {
    let mat = diag.column_vector().as_mat();
    Array1::from_shape_fn(mat.nrows(), |i| mat[(i, 0)])
}

enum FaerStorage<'a> {
    Borrowed(MatRef<'a, f64>),
    Owned(Mat<f64>),
}

impl<'a> FaerStorage<'a> {
    #[inline]
    fn as_ref(&self) -> MatRef<'_, f64> {
        match self {
            FaerStorage::Borrowed(view) => *view,
            FaerStorage::Owned(mat) => mat.as_ref(),
        }
    }
}

/// Zero-copy faer view of a standard or Fortran layout ndarray matrix.
pub struct FaerArrayView<'a> {
    storage: FaerStorage<'a>,
}

impl<'a> FaerArrayView<'a> {
    pub fn new<S: Data<Elem = f64>>(array: &'a ArrayBase<S, Ix2>) -> Self {
        let storage = match array.as_slice_memory_order() {
            Some(slice) if array.is_standard_layout() => FaerStorage::Borrowed(
                MatRef::from_row_major_slice(slice, array.nrows(), array.ncols()),
            ),
            Some(slice) if array.t().is_standard_layout() => FaerStorage::Borrowed(
                MatRef::from_column_major_slice(slice, array.nrows(), array.ncols()),
            ),
            _ => {
                let (rows, cols) = array.dim();
                FaerStorage::Owned(Mat::from_fn(rows, cols, |i, j| array[(i, j)]))
            }
        };
        Self { storage }
    }

    #[inline]
    pub fn as_ref(&self) -> MatRef<'_, f64> {
        self.storage.as_ref()
    }
}

/// Eigenvalues of a symmetric matrix, ascending.
pub trait FaerEigh {
    fn eigh_values(&self, side: Side) -> Result<Array1<f64>, FaerLinalgError>;
}

impl<S: Data<Elem = f64>> FaerEigh for ArrayBase<S, Ix2> {
    fn eigh_values(&self, side: Side) -> Result<Array1<f64>, FaerLinalgError> {
        let faer_view = FaerArrayView::new(self);
        let eigen = faer_view
            .as_ref()
            .self_adjoint_eigen(side)
            .map_err(FaerLinalgError::SelfAdjointEigen)?;
        Ok(diag_to_array(eigen.S()))
    }
}

/// Eigenvalues of a general real matrix as `(real parts, imaginary parts)`.
pub trait FaerEigenvalues {
    fn complex_eigenvalues(&self) -> Result<(Array1<f64>, Array1<f64>), FaerLinalgError>;
}

impl<S: Data<Elem = f64>> FaerEigenvalues for ArrayBase<S, Ix2> {
    fn complex_eigenvalues(&self) -> Result<(Array1<f64>, Array1<f64>), FaerLinalgError> {
        let faer_view = FaerArrayView::new(self);
        let values = faer_view
            .as_ref()
            .eigenvalues()
            .map_err(FaerLinalgError::Eigen)?;
        let re: Array1<f64> = values.iter().map(|value| value.re).collect();
        let im: Array1<f64> = values.iter().map(|value| value.im).collect();
        Ok((re, im))
    }
}

pub struct FaerCholeskyFactor {
    factor: solvers::Llt<f64>,
}

impl FaerCholeskyFactor {
    pub fn diag(&self) -> Array1<f64> {
        diag_to_array(self.factor.L().diagonal())
    }

    /// `ln det(A) = 2 sum ln L_ii`.
    pub fn log_determinant(&self) -> f64 {
        2.0 * self.diag().iter().map(|d| d.ln()).sum::<f64>()
    }
}

pub trait FaerCholesky {
    fn cholesky(&self, side: Side) -> Result<FaerCholeskyFactor, FaerLinalgError>;
}

impl<S: Data<Elem = f64>> FaerCholesky for ArrayBase<S, Ix2> {
    fn cholesky(&self, side: Side) -> Result<FaerCholeskyFactor, FaerLinalgError> {
        let faer_view = FaerArrayView::new(self);
        let factor = faer_view
            .as_ref()
            .llt(side)
            .map_err(FaerLinalgError::Cholesky)?;
        Ok(FaerCholeskyFactor { factor })
    }
}

/// `ln |det(A)|` through a partial-pivoting LU factorization.
///
/// Returns negative infinity for a singular matrix.
pub trait FaerLu {
    fn lu_log_abs_determinant(&self) -> f64;
}

impl<S: Data<Elem = f64>> FaerLu for ArrayBase<S, Ix2> {
    fn lu_log_abs_determinant(&self) -> f64 {
        let faer_view = FaerArrayView::new(self);
        let lu = faer_view.as_ref().partial_piv_lu();
        diag_to_array(lu.U().diagonal())
            .iter()
            .map(|u| u.abs().ln())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array2, array};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_spd(n: usize, rng: &mut StdRng) -> Array2<f64> {
        let mut mat = Array2::zeros((n, n));
        for i in 0..n {
            for j in 0..n {
                mat[(i, j)] = rng.gen_range(-1.0..1.0);
            }
        }
        let mut spd = mat.t().dot(&mat);
        spd.diag_mut().mapv_inplace(|d| d + n as f64);
        spd
    }

    #[test]
    fn cholesky_and_lu_log_determinants_agree() {
        let mut rng = StdRng::seed_from_u64(42);
        let matrix = random_spd(12, &mut rng);

        let chol = matrix.cholesky(Side::Lower).unwrap().log_determinant();
        let lu = matrix.lu_log_abs_determinant();
        let eig: f64 = matrix
            .eigh_values(Side::Lower)
            .unwrap()
            .iter()
            .map(|v| v.ln())
            .sum();

        assert_abs_diff_eq!(chol, lu, epsilon = 1e-9);
        assert_abs_diff_eq!(chol, eig, epsilon = 1e-9);
    }

    #[test]
    fn cholesky_rejects_indefinite_matrix() {
        let matrix = array![[1.0, 2.0], [2.0, 1.0]];
        assert!(matches!(
            matrix.cholesky(Side::Lower),
            Err(FaerLinalgError::Cholesky(_))
        ));
    }

    #[test]
    fn rotation_has_purely_imaginary_eigenvalues() {
        let rotation = array![[0.0, -1.0], [1.0, 0.0]];
        let (re, im) = rotation.complex_eigenvalues().unwrap();
        assert_eq!(re.len(), 2);
        for &r in re.iter() {
            assert_abs_diff_eq!(r, 0.0, epsilon = 1e-12);
        }
        let mut imag: Vec<f64> = im.to_vec();
        imag.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_abs_diff_eq!(imag[0], -1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(imag[1], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn transposed_views_are_read_in_column_major_order() {
        let matrix = array![[4.0, 1.0], [2.0, 3.0]];
        let transposed = matrix.t();
        let view = FaerArrayView::new(&transposed);
        assert_eq!(view.as_ref()[(0, 1)], 2.0);
        assert_eq!(view.as_ref()[(1, 0)], 1.0);
    }
}
