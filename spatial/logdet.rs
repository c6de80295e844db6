use crate::backend::{FaerBackend, NumericBackend, Spectrum};
use crate::faer_ndarray::FaerLinalgError;
use crate::graph;
use crate::matrix::WeightsMatrix;
use crate::similarity::{AsymmetryReason, Similarity, SimilarityError, symmetrize_by_similarity};
use crate::weights::SpatialWeights;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How `ln |I - rho W|` is evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogDetMethod {
    /// Ord (1975): one eigen solve, then `sum ln |1 - rho lambda|` per evaluation.
    #[default]
    Eigen,
    /// Cholesky factor of the symmetrised `I - rho W` per evaluation.
    Cholesky,
    /// Partial-pivot LU of `I - rho W` per evaluation.
    Lu,
}

#[derive(Error, Debug)]
pub enum LogDetError {
    #[error("Cholesky log-determinants need weights similar to a symmetric matrix: {0}.")]
    NotSymmetric(AsymmetryReason),
    #[error("I - rho W is singular or not positive definite at rho = {0}.")]
    OutsideDomain(f64),
    #[error("The spatial coefficient must be finite.")]
    NonFiniteRho,
    #[error(transparent)]
    Linalg(#[from] FaerLinalgError),
}

impl From<SimilarityError> for LogDetError {
    fn from(err: SimilarityError) -> Self {
        match err {
            SimilarityError::AsymmetricStructure(reason) => Self::NotSymmetric(reason),
            SimilarityError::Linalg(inner) => Self::Linalg(inner),
        }
    }
}

/// Eigenvalue extremes this close to plus or minus one are taken as exact.
const UNIT_EIGENVALUE_TOLERANCE: f64 = 1e-10;

/// Open interval of admissible spatial coefficients, `(1 / lambda_min, 1 / lambda_max)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParameterInterval {
    pub lower: f64,
    pub upper: f64,
}

impl ParameterInterval {
    pub fn from_spectrum(spectrum: &Spectrum) -> Option<Self> {
        let min = snap_to_unit(spectrum.min_real()?);
        let max = snap_to_unit(spectrum.max_real()?);
        let lower = if min < 0.0 { 1.0 / min } else { f64::NEG_INFINITY };
        let upper = if max > 0.0 { 1.0 / max } else { f64::INFINITY };
        Some(Self { lower, upper })
    }

    pub fn contains(&self, rho: f64) -> bool {
        rho > self.lower && rho < self.upper
    }
}

/// Row-standardised spectra have extremes at exactly `+-1`, which solvers miss
/// by a few ulps; snapping keeps the singular points out of the open interval.
fn snap_to_unit(value: f64) -> f64 {
    if (value.abs() - 1.0).abs() <= UNIT_EIGENVALUE_TOLERANCE {
        value.signum()
    } else {
        value
    }
}

/// Cholesky and LU keep a dense copy, since they factorise it for every `rho`.
enum Prepared {
    Eigen(Spectrum),
    Cholesky(WeightsMatrix),
    Lu(WeightsMatrix),
}

/// Log-determinant of `I - rho W`, prepared once and evaluated for many `rho`.
pub struct LogDeterminant<B: NumericBackend = FaerBackend> {
    method: LogDetMethod,
    prepared: Prepared,
    interval: Option<ParameterInterval>,
    backend: B,
}

impl LogDeterminant<FaerBackend> {
    pub fn new(weights: &SpatialWeights, method: LogDetMethod) -> Result<Self, LogDetError> {
        Self::prepare(weights, method, FaerBackend)
    }
}

impl<B: NumericBackend> LogDeterminant<B> {
    /// Sets up `method` for `weights`.
    ///
    /// The eigen path works on the symmetrised matrix when one exists and falls
    /// back to the general spectrum otherwise. The Cholesky path needs the
    /// symmetrised matrix. The admissible interval comes from the spectrum when it
    /// was computed, otherwise from the graph structure when that settles it.
    pub fn prepare(
        weights: &SpatialWeights,
        method: LogDetMethod,
        backend: B,
    ) -> Result<Self, LogDetError> {
        let (prepared, interval) = match method {
            LogDetMethod::Eigen => {
                let spectrum = match Similarity::assess(weights) {
                    Similarity::Symmetrizable(_) => {
                        let sym = symmetrize_by_similarity(weights)?;
                        backend.symmetric_eigenvalues(sym.matrix())?
                    }
                    Similarity::NotSymmetrizable(reason) => {
                        log::info!("Using the general eigen solver because {reason}");
                        backend.eigenvalues(&weights.to_matrix()?)?
                    }
                };
                let interval = graph::structural_interval(weights)
                    .or_else(|| ParameterInterval::from_spectrum(&spectrum));
                (Prepared::Eigen(spectrum), interval)
            }
            LogDetMethod::Cholesky => {
                let sym = symmetrize_by_similarity(weights)?;
                let interval = graph::structural_interval(weights);
                (Prepared::Cholesky(sym.matrix().densified()), interval)
            }
            LogDetMethod::Lu => {
                let interval = graph::structural_interval(weights);
                (Prepared::Lu(weights.to_matrix()?.densified()), interval)
            }
        };
        log::debug!(
            "Prepared {:?} log-determinant for {} entities, interval {:?}",
            method,
            weights.len(),
            interval
        );
        Ok(Self {
            method,
            prepared,
            interval,
            backend,
        })
    }

    pub fn method(&self) -> LogDetMethod {
        self.method
    }

    pub fn interval(&self) -> Option<ParameterInterval> {
        self.interval
    }

    /// `ln |det(I - rho W)|`.
    ///
    /// Coefficients outside a known admissible interval, including its singular
    /// end points, are `OutsideDomain`.
    pub fn log_det(&self, rho: f64) -> Result<f64, LogDetError> {
        if !rho.is_finite() {
            return Err(LogDetError::NonFiniteRho);
        }
        if self.interval.is_some_and(|interval| !interval.contains(rho)) {
            return Err(LogDetError::OutsideDomain(rho));
        }
        let value = match &self.prepared {
            Prepared::Eigen(spectrum) => spectrum.log_det(rho),
            Prepared::Cholesky(matrix) => match self.backend.log_det_cholesky(matrix, rho) {
                Ok(value) => value,
                Err(FaerLinalgError::Cholesky(_)) => return Err(LogDetError::OutsideDomain(rho)),
                Err(other) => return Err(other.into()),
            },
            Prepared::Lu(matrix) => self.backend.log_det_lu(matrix, rho)?,
        };
        if !value.is_finite() {
            return Err(LogDetError::OutsideDomain(rho));
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::weights::{Neighbours, WeightsStyle};
    use approx::assert_abs_diff_eq;

    fn rook(nrow: usize, ncol: usize) -> SpatialWeights {
        SpatialWeights::new(
            Neighbours::rook_grid(nrow, ncol).unwrap(),
            WeightsStyle::W,
            false,
        )
        .unwrap()
    }

    #[test]
    fn methods_agree_inside_the_interval() {
        let w = rook(4, 5);
        let eigen = LogDeterminant::new(&w, LogDetMethod::Eigen).unwrap();
        let chol = LogDeterminant::new(&w, LogDetMethod::Cholesky).unwrap();
        let lu = LogDeterminant::new(&w, LogDetMethod::Lu).unwrap();
        for rho in [-0.8, -0.25, 0.0, 0.35, 0.9] {
            let reference = eigen.log_det(rho).unwrap();
            assert_abs_diff_eq!(chol.log_det(rho).unwrap(), reference, epsilon = 1e-9);
            assert_abs_diff_eq!(lu.log_det(rho).unwrap(), reference, epsilon = 1e-9);
        }
        assert_abs_diff_eq!(eigen.log_det(0.0).unwrap(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn interval_of_bipartite_grid_is_unit() {
        let w = rook(4, 5);
        let eigen = LogDeterminant::new(&w, LogDetMethod::Eigen).unwrap();
        let interval = eigen.interval().unwrap();
        assert_abs_diff_eq!(interval.lower, -1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(interval.upper, 1.0, epsilon = 1e-9);

        let lu = LogDeterminant::new(&w, LogDetMethod::Lu).unwrap();
        assert_eq!(
            lu.interval(),
            Some(ParameterInterval {
                lower: -1.0,
                upper: 1.0
            })
        );
        assert!(interval.contains(0.99));
        assert!(!interval.contains(1.0));
        assert!(!interval.contains(-1.0));
    }

    #[test]
    fn singular_end_points_are_outside_the_domain() {
        let w = rook(4, 5);
        for method in [LogDetMethod::Eigen, LogDetMethod::Cholesky, LogDetMethod::Lu] {
            let logdet = LogDeterminant::new(&w, method).unwrap();
            for rho in [1.0, -1.0, 1.2] {
                assert!(matches!(
                    logdet.log_det(rho),
                    Err(LogDetError::OutsideDomain(value)) if value == rho
                ));
            }
        }
    }

    #[test]
    fn spectrum_extremes_near_unit_are_snapped() {
        let spectrum = Spectrum::real(ndarray::array![-1.0 + 1e-15, 0.2, 1.0 - 1e-15]);
        let interval = ParameterInterval::from_spectrum(&spectrum).unwrap();
        assert_eq!(interval.lower, -1.0);
        assert_eq!(interval.upper, 1.0);

        let spectrum = Spectrum::real(ndarray::array![-0.5, 0.25]);
        let interval = ParameterInterval::from_spectrum(&spectrum).unwrap();
        assert_eq!(interval.lower, -2.0);
        assert_eq!(interval.upper, 4.0);
    }

    #[test]
    fn cholesky_fails_outside_the_domain() {
        let w = rook(3, 3);
        let chol = LogDeterminant::new(&w, LogDetMethod::Cholesky).unwrap();
        assert!(matches!(chol.log_det(1.5), Err(LogDetError::OutsideDomain(_))));
        assert!(matches!(chol.log_det(f64::NAN), Err(LogDetError::NonFiniteRho)));
        assert!(chol.log_det(0.5).is_ok());
    }

    #[test]
    fn cholesky_requires_symmetric_structure() {
        let nb = Neighbours::new(vec![vec![1], vec![2], vec![0]]).unwrap();
        let w = SpatialWeights::new(nb, WeightsStyle::W, false).unwrap();
        assert!(matches!(
            LogDeterminant::new(&w, LogDetMethod::Cholesky),
            Err(LogDetError::NotSymmetric(_))
        ));
        let eigen = LogDeterminant::new(&w, LogDetMethod::Eigen).unwrap();
        let lu = LogDeterminant::new(&w, LogDetMethod::Lu).unwrap();
        assert_abs_diff_eq!(
            eigen.log_det(0.5).unwrap(),
            lu.log_det(0.5).unwrap(),
            epsilon = 1e-10
        );
        assert_eq!(lu.method(), LogDetMethod::Lu);
    }

    #[test]
    fn method_names_serialise_in_snake_case() {
        #[derive(Serialize, Deserialize)]
        struct Holder {
            method: LogDetMethod,
        }
        let text = toml::to_string(&Holder {
            method: LogDetMethod::Cholesky,
        })
        .unwrap();
        assert!(text.contains("\"cholesky\""));
        let back: Holder = toml::from_str("method = \"lu\"").unwrap();
        assert_eq!(back.method, LogDetMethod::Lu);
    }
}
