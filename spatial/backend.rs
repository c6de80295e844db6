use crate::faer_ndarray::{FaerCholesky, FaerEigenvalues, FaerEigh, FaerLinalgError, FaerLu};
use crate::matrix::WeightsMatrix;
use faer::Side;
use ndarray::{Array1, ArrayView1};
use serde::Serialize;

/// Eigenvalues of a weights matrix, split into real and imaginary parts.
///
/// Spectra of matrices that are similar to a symmetric matrix are purely real
/// and carry an all-zero imaginary part.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Spectrum {
    re: Array1<f64>,
    im: Array1<f64>,
}

impl Spectrum {
    pub fn real(values: Array1<f64>) -> Self {
        let im = Array1::zeros(values.len());
        Self { re: values, im }
    }

    pub fn complex(re: Array1<f64>, im: Array1<f64>) -> Self {
        debug_assert_eq!(re.len(), im.len());
        Self { re, im }
    }

    pub fn len(&self) -> usize {
        self.re.len()
    }

    pub fn is_empty(&self) -> bool {
        self.re.is_empty()
    }

    pub fn re(&self) -> &Array1<f64> {
        &self.re
    }

    pub fn im(&self) -> &Array1<f64> {
        &self.im
    }

    pub fn is_real(&self, tolerance: f64) -> bool {
        self.im.iter().all(|v| v.abs() <= tolerance)
    }

    /// `sum_k Re(lambda_k^2)`; conjugate pairs cancel their imaginary parts.
    pub fn sum_of_squares(&self) -> f64 {
        self.re
            .iter()
            .zip(self.im.iter())
            .map(|(&a, &b)| a * a - b * b)
            .sum()
    }

    pub fn min_real(&self) -> Option<f64> {
        self.re.iter().copied().reduce(f64::min)
    }

    pub fn max_real(&self) -> Option<f64> {
        self.re.iter().copied().reduce(f64::max)
    }

    /// `ln |det(I - rho W)| = sum_k ln |1 - rho lambda_k|`.
    pub fn log_det(&self, rho: f64) -> f64 {
        self.re
            .iter()
            .zip(self.im.iter())
            .map(|(&a, &b)| {
                let real = 1.0 - rho * a;
                let imag = rho * b;
                0.5 * (real * real + imag * imag).ln()
            })
            .sum()
    }
}

/// Linear algebra capabilities the spatial statistics need from a numeric library.
///
/// The estimators only talk to this trait, so a dense, sparse or accelerator
/// backed implementation can be swapped in without touching them.
pub trait NumericBackend: Sync {
    /// `W x`.
    fn spatial_lag(&self, w: &WeightsMatrix, x: ArrayView1<f64>) -> Array1<f64>;

    /// `W' x`.
    fn transpose_lag(&self, w: &WeightsMatrix, x: ArrayView1<f64>) -> Array1<f64>;

    /// `tr(W W)`.
    fn trace_of_square(&self, w: &WeightsMatrix) -> f64;

    /// `tr(W' W)`.
    fn trace_of_crossprod(&self, w: &WeightsMatrix) -> f64;

    /// Eigenvalues of a matrix the caller guarantees to be symmetric.
    fn symmetric_eigenvalues(&self, w: &WeightsMatrix) -> Result<Spectrum, FaerLinalgError>;

    /// Eigenvalues of an arbitrary square matrix.
    fn eigenvalues(&self, w: &WeightsMatrix) -> Result<Spectrum, FaerLinalgError>;

    /// `ln det(I - rho W)` for symmetric `W` with `I - rho W` positive definite.
    fn log_det_cholesky(&self, w: &WeightsMatrix, rho: f64) -> Result<f64, FaerLinalgError>;

    /// `ln |det(I - rho W)|` for any square `W`.
    fn log_det_lu(&self, w: &WeightsMatrix, rho: f64) -> Result<f64, FaerLinalgError>;
}

/// Borrowed backends work anywhere an owned one does.
impl<B: NumericBackend + ?Sized> NumericBackend for &B {
    fn spatial_lag(&self, w: &WeightsMatrix, x: ArrayView1<f64>) -> Array1<f64> {
        (**self).spatial_lag(w, x)
    }

    fn transpose_lag(&self, w: &WeightsMatrix, x: ArrayView1<f64>) -> Array1<f64> {
        (**self).transpose_lag(w, x)
    }

    fn trace_of_square(&self, w: &WeightsMatrix) -> f64 {
        (**self).trace_of_square(w)
    }

    fn trace_of_crossprod(&self, w: &WeightsMatrix) -> f64 {
        (**self).trace_of_crossprod(w)
    }

    fn symmetric_eigenvalues(&self, w: &WeightsMatrix) -> Result<Spectrum, FaerLinalgError> {
        (**self).symmetric_eigenvalues(w)
    }

    fn eigenvalues(&self, w: &WeightsMatrix) -> Result<Spectrum, FaerLinalgError> {
        (**self).eigenvalues(w)
    }

    fn log_det_cholesky(&self, w: &WeightsMatrix, rho: f64) -> Result<f64, FaerLinalgError> {
        (**self).log_det_cholesky(w, rho)
    }

    fn log_det_lu(&self, w: &WeightsMatrix, rho: f64) -> Result<f64, FaerLinalgError> {
        (**self).log_det_lu(w, rho)
    }
}

/// Default backend: hand-rolled sparse products plus faer dense decompositions.
#[derive(Debug, Clone, Copy, Default)]
pub struct FaerBackend;

impl NumericBackend for FaerBackend {
    fn spatial_lag(&self, w: &WeightsMatrix, x: ArrayView1<f64>) -> Array1<f64> {
        w.matrix_vector_multiply(x)
    }

    fn transpose_lag(&self, w: &WeightsMatrix, x: ArrayView1<f64>) -> Array1<f64> {
        w.transpose_vector_multiply(x)
    }

    fn trace_of_square(&self, w: &WeightsMatrix) -> f64 {
        w.trace_of_square()
    }

    fn trace_of_crossprod(&self, w: &WeightsMatrix) -> f64 {
        w.trace_of_crossprod()
    }

    fn symmetric_eigenvalues(&self, w: &WeightsMatrix) -> Result<Spectrum, FaerLinalgError> {
        let dense = w.to_dense();
        Ok(Spectrum::real(dense.eigh_values(Side::Lower)?))
    }

    fn eigenvalues(&self, w: &WeightsMatrix) -> Result<Spectrum, FaerLinalgError> {
        let dense = w.to_dense();
        let (re, im) = dense.complex_eigenvalues()?;
        Ok(Spectrum::complex(re, im))
    }

    fn log_det_cholesky(&self, w: &WeightsMatrix, rho: f64) -> Result<f64, FaerLinalgError> {
        let shifted = w.identity_minus(rho);
        Ok(shifted.cholesky(Side::Lower)?.log_determinant())
    }

    fn log_det_lu(&self, w: &WeightsMatrix, rho: f64) -> Result<f64, FaerLinalgError> {
        Ok(w.identity_minus(rho).lu_log_abs_determinant())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn symmetric_path() -> WeightsMatrix {
        WeightsMatrix::from_lists(
            3,
            &[vec![1], vec![0, 2], vec![1]],
            &[vec![0.5], vec![0.5, 0.5], vec![0.5]],
        )
        .unwrap()
    }

    #[test]
    fn symmetric_spectrum_matches_trace_identity() {
        let backend = FaerBackend;
        let w = symmetric_path();
        let spectrum = backend.symmetric_eigenvalues(&w).unwrap();
        assert_eq!(spectrum.len(), 3);
        assert!(spectrum.is_real(0.0));
        assert_abs_diff_eq!(
            spectrum.sum_of_squares(),
            backend.trace_of_square(&w),
            epsilon = 1e-12
        );
        // Path of three scaled by one half: eigenvalues are 0 and +/- sqrt(2)/2.
        assert_abs_diff_eq!(spectrum.max_real().unwrap(), 0.5_f64.sqrt(), epsilon = 1e-12);
        assert_abs_diff_eq!(spectrum.min_real().unwrap(), -(0.5_f64.sqrt()), epsilon = 1e-12);
    }

    #[test]
    fn general_spectrum_sum_of_squares_is_real() {
        let backend = FaerBackend;
        let w = WeightsMatrix::from_lists(
            3,
            &[vec![1], vec![2], vec![0]],
            &[vec![1.0], vec![1.0], vec![1.0]],
        )
        .unwrap();
        let spectrum = backend.eigenvalues(&w).unwrap();
        assert!(!spectrum.is_real(1e-8));
        assert_abs_diff_eq!(spectrum.sum_of_squares(), 0.0, epsilon = 1e-10);
        assert_abs_diff_eq!(backend.trace_of_square(&w), 0.0, epsilon = 1e-15);
    }

    #[test]
    fn log_determinant_paths_agree() {
        let backend = FaerBackend;
        let w = symmetric_path();
        let spectrum = backend.symmetric_eigenvalues(&w).unwrap();
        for rho in [-0.9, -0.3, 0.0, 0.4, 1.2] {
            let chol = backend.log_det_cholesky(&w, rho).unwrap();
            let lu = backend.log_det_lu(&w, rho).unwrap();
            assert_abs_diff_eq!(chol, lu, epsilon = 1e-12);
            assert_abs_diff_eq!(chol, spectrum.log_det(rho), epsilon = 1e-12);
        }
    }

    #[test]
    fn lags_use_row_and_column_orientation() {
        let backend = FaerBackend;
        let w = WeightsMatrix::from_lists(2, &[vec![1], vec![]], &[vec![2.0], vec![]]).unwrap();
        let x = array![1.0, 3.0];
        assert_eq!(backend.spatial_lag(&w, x.view()), array![6.0, 0.0]);
        assert_eq!(backend.transpose_lag(&w, x.view()), array![0.0, 2.0]);
        assert_abs_diff_eq!(backend.trace_of_crossprod(&w), 4.0, epsilon = 1e-15);
    }
}
