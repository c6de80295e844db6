use crate::backend::{FaerBackend, NumericBackend};
use crate::faer_ndarray::FaerLinalgError;
use crate::matrix::WeightsMatrix;
use crate::similarity::{AsymmetryReason, Similarity, SimilarityError, symmetrize_by_similarity};
use crate::weights::{SpatialWeights, WeightsStyle};
use ndarray::{Array1, ArrayView1};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Settings of the APLE estimator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApleOptions {
    /// Skip the similarity check, e.g. for row-standardised asymmetric general
    /// weights over a symmetric neighbour relation.
    pub override_similarity_check: bool,
    /// Correction term from `tr(W W)` instead of an eigen solve.
    pub use_trace: bool,
    /// Above this many entities the eigen path logs a warning.
    pub eigen_warning_threshold: usize,
    /// Tolerance for the zero-mean check on `x`.
    pub mean_tolerance: f64,
}

impl Default for ApleOptions {
    fn default() -> Self {
        Self {
            override_similarity_check: false,
            use_trace: true,
            eigen_warning_threshold: 2000,
            mean_tolerance: 1.5e-8,
        }
    }
}

/// Direction of the permutation test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Alternative {
    #[default]
    Greater,
    Less,
    TwoSided,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PermutationOptions {
    pub simulations: usize,
    pub seed: u64,
    pub alternative: Alternative,
}

impl Default for PermutationOptions {
    fn default() -> Self {
        Self {
            simulations: 999,
            seed: 42,
            alternative: Alternative::Greater,
        }
    }
}

/// Observed APLE, its permutation distribution and the pseudo p-value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PermutationOutcome {
    pub statistic: f64,
    pub simulated: Vec<f64>,
    pub p_value: f64,
    pub alternative: Alternative,
}

#[derive(Error, Debug)]
pub enum ApleError {
    #[error("APLE needs row-standardised (style W) weights, but the weights have style {0}.")]
    InvalidConfiguration(WeightsStyle),

    #[error("Weights must be symmetric or similar to symmetric: {0}.")]
    SymmetryViolation(AsymmetryReason),

    #[error("x has {x_len} values but the weights describe {n} entities.")]
    DimensionMismatch { x_len: usize, n: usize },

    #[error("x contains a non-finite value at position {index}.")]
    NonFiniteValue { index: usize },

    #[error("x has zero sum of squares, so APLE is undefined.")]
    DegenerateVariable,

    #[error("A permutation test needs at least one simulation.")]
    InvalidPermutationCount,

    #[error("Linear algebra failure while computing APLE: {0}")]
    Linalg(#[from] FaerLinalgError),
}

impl From<SimilarityError> for ApleError {
    fn from(err: SimilarityError) -> Self {
        match err {
            SimilarityError::AsymmetricStructure(reason) => Self::SymmetryViolation(reason),
            SimilarityError::Linalg(inner) => Self::Linalg(inner),
        }
    }
}

/// Weights matrix and correction term shared by every evaluation on one structure.
///
/// Building this performs the checks that only depend on the weights and the one
/// expensive step (trace or eigen solve); evaluating it on a variable is then a
/// pair of sparse products. The stored matrix is the symmetric `S = D^{1/2} W D^{-1/2}`
/// when the weights are similar to a symmetric matrix, and the raw `W` only when
/// the similarity check was overridden.
pub struct AplePrep<B: NumericBackend = FaerBackend> {
    matrix: WeightsMatrix,
    correction: f64,
    mean_tolerance: f64,
    backend: B,
}

impl<B: NumericBackend> AplePrep<B> {
    pub fn new(
        weights: &SpatialWeights,
        options: &ApleOptions,
        backend: B,
    ) -> Result<Self, ApleError> {
        if weights.style() != WeightsStyle::W {
            return Err(ApleError::InvalidConfiguration(weights.style()));
        }
        let similarity = Similarity::assess(weights);
        if !options.override_similarity_check {
            if let Similarity::NotSymmetrizable(reason) = similarity {
                return Err(ApleError::SymmetryViolation(reason));
            }
        }

        let n = weights.len();
        // Symmetrised weights unless the caller overrode the check.
        let (matrix, symmetric) = match similarity {
            Similarity::Symmetrizable(_) if !options.override_similarity_check => {
                (symmetrize_by_similarity(weights)?.matrix().clone(), true)
            }
            _ => (weights.to_matrix()?, false),
        };
        let sum_of_squares = if options.use_trace {
            backend.trace_of_square(&matrix)
        } else {
            if n > options.eigen_warning_threshold {
                log::warn!(
                    "Dense eigen solve for {n} entities; the trace path is far cheaper for large weights"
                );
            }
            let spectrum = if symmetric {
                backend.symmetric_eigenvalues(&matrix)?
            } else {
                backend.eigenvalues(&matrix)?
            };
            spectrum.sum_of_squares()
        };
        let correction = if n > 0 { sum_of_squares / n as f64 } else { 0.0 };
        log::debug!(
            "APLE correction term {:.6} from the {} path over {} entities",
            correction,
            if options.use_trace { "trace" } else { "eigen" },
            n
        );

        Ok(Self {
            matrix,
            correction,
            mean_tolerance: options.mean_tolerance,
            backend,
        })
    }

    /// `lambda_bar^2 = sum lambda_k^2 / n`.
    pub fn correction(&self) -> f64 {
        self.correction
    }

    pub fn len(&self) -> usize {
        self.matrix.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn validate(&self, x: ArrayView1<f64>) -> Result<(), ApleError> {
        let n = self.len();
        if x.len() != n {
            return Err(ApleError::DimensionMismatch { x_len: x.len(), n });
        }
        if let Some(index) = x.iter().position(|v| !v.is_finite()) {
            return Err(ApleError::NonFiniteValue { index });
        }
        let ss = x.dot(&x);
        if ss == 0.0 {
            return Err(ApleError::DegenerateVariable);
        }
        let mean = x.sum() / n as f64;
        let sd = (ss / n as f64).sqrt();
        if mean.abs() > self.mean_tolerance * sd.max(1.0) {
            log::warn!("Mean of x is {mean:.3e}, not zero; APLE assumes a detrended variable");
        }
        Ok(())
    }

    /// `(x' ((S + S')/2) x, denominator, S x)` for an already validated `x`.
    fn parts(&self, x: ArrayView1<f64>) -> (f64, f64, Array1<f64>) {
        let lag = self.backend.spatial_lag(&self.matrix, x);
        let numerator = x.dot(&lag);
        let denominator = lag.dot(&lag) + self.correction * x.dot(&x);
        (numerator, denominator, lag)
    }

    fn evaluate(&self, x: ArrayView1<f64>) -> f64 {
        let (numerator, denominator, _) = self.parts(x);
        numerator / denominator
    }

    /// The APLE statistic
    /// `x' ((S + S')/2) x / (x' S' S x + lambda_bar^2 x' x)`.
    pub fn statistic(&self, x: ArrayView1<f64>) -> Result<f64, ApleError> {
        self.validate(x)?;
        Ok(self.evaluate(x))
    }

    /// Per-entity contributions whose mean is the APLE statistic.
    pub fn local(&self, x: ArrayView1<f64>) -> Result<Array1<f64>, ApleError> {
        self.validate(x)?;
        let (_, denominator, lag) = self.parts(x);
        let transposed = self.backend.transpose_lag(&self.matrix, x);
        let n = self.len() as f64;
        Ok(ndarray::Zip::from(&x)
            .and(&lag)
            .and(&transposed)
            .map_collect(|&xi, &l, &t| n * xi * 0.5 * (l + t) / denominator))
    }
}

/// Approximate profile-likelihood estimator of spatial dependence (Li, Calder
/// and Cressie 2007) for a detrended `x` and row-standardised `weights`.
///
/// # Errors
/// * `InvalidConfiguration` when the weights are not style `W`.
/// * `SymmetryViolation` when they are not similar to a symmetric matrix and
///   the check was not overridden.
/// * `DimensionMismatch` when `x` and the weights disagree in length.
pub fn aple(
    x: ArrayView1<f64>,
    weights: &SpatialWeights,
    options: &ApleOptions,
) -> Result<f64, ApleError> {
    aple_with_backend(x, weights, options, FaerBackend)
}

pub fn aple_with_backend<B: NumericBackend>(
    x: ArrayView1<f64>,
    weights: &SpatialWeights,
    options: &ApleOptions,
    backend: B,
) -> Result<f64, ApleError> {
    check_length(x, weights)?;
    AplePrep::new(weights, options, backend)?.statistic(x)
}

/// Rejects a wrongly sized `x` before any trace or eigen work is done.
fn check_length(x: ArrayView1<f64>, weights: &SpatialWeights) -> Result<(), ApleError> {
    if x.len() != weights.len() {
        return Err(ApleError::DimensionMismatch {
            x_len: x.len(),
            n: weights.len(),
        });
    }
    Ok(())
}

/// Local decomposition of APLE: `n x_i ((S + S')/2 x)_i / denominator`.
pub fn local_aple(
    x: ArrayView1<f64>,
    weights: &SpatialWeights,
    options: &ApleOptions,
) -> Result<Array1<f64>, ApleError> {
    check_length(x, weights)?;
    AplePrep::new(weights, options, FaerBackend)?.local(x)
}

/// Monte Carlo permutation test of APLE.
///
/// Each simulation shuffles `x` with its own seeded generator, so the result is
/// reproducible for a given seed regardless of how rayon schedules the work.
pub fn aple_permutation(
    x: ArrayView1<f64>,
    weights: &SpatialWeights,
    options: &ApleOptions,
    permutation: &PermutationOptions,
) -> Result<PermutationOutcome, ApleError> {
    if permutation.simulations == 0 {
        return Err(ApleError::InvalidPermutationCount);
    }
    check_length(x, weights)?;
    let prep = AplePrep::new(weights, options, FaerBackend)?;
    let statistic = prep.statistic(x)?;
    let base = x.to_vec();

    let simulated: Vec<f64> = (0..permutation.simulations)
        .into_par_iter()
        .map(|k| {
            let stream = permutation
                .seed
                .wrapping_add((k as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15));
            let mut rng = StdRng::seed_from_u64(stream);
            let mut shuffled = base.clone();
            shuffled.shuffle(&mut rng);
            prep.evaluate(ArrayView1::from(&shuffled[..]))
        })
        .collect();

    let total = (permutation.simulations + 1) as f64;
    let greater = (1 + simulated.iter().filter(|&&s| s >= statistic).count()) as f64 / total;
    let less = (1 + simulated.iter().filter(|&&s| s <= statistic).count()) as f64 / total;
    let p_value = match permutation.alternative {
        Alternative::Greater => greater,
        Alternative::Less => less,
        Alternative::TwoSided => (2.0 * greater.min(less)).min(1.0),
    };
    log::info!(
        "APLE {statistic:.4} with permutation p-value {p_value:.4} over {} simulations",
        permutation.simulations
    );

    Ok(PermutationOutcome {
        statistic,
        simulated,
        p_value,
        alternative: permutation.alternative,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::weights::Neighbours;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn rook_w(nrow: usize, ncol: usize) -> SpatialWeights {
        SpatialWeights::new(
            Neighbours::rook_grid(nrow, ncol).unwrap(),
            WeightsStyle::W,
            false,
        )
        .unwrap()
    }

    fn centred(values: Vec<f64>) -> Array1<f64> {
        let x = Array1::from(values);
        let mean = x.mean().unwrap();
        x - mean
    }

    #[test]
    fn matches_hand_computed_value_on_a_path() {
        let nb = Neighbours::new(vec![vec![1], vec![0, 2], vec![1]]).unwrap();
        let w = SpatialWeights::new(nb, WeightsStyle::W, false).unwrap();
        let x = array![-1.0, 0.0, 1.0];
        // S x = (0, 0, 0): numerator 0.
        assert_abs_diff_eq!(aple(x.view(), &w, &ApleOptions::default()).unwrap(), 0.0);

        let x = array![1.0, -2.0, 1.0];
        // d = (1, 2, 1) makes every link of S equal a = 1/sqrt(2).
        // S x = (-2a, 2a, -2a), x'Sx = -8a, |Sx|^2 = 6, tr(S S) = 4a^2 = 2,
        // lambda_bar^2 = 2/3, x'x = 6, so APLE = -8a / (6 + 4) = -4 sqrt(2) / 10.
        let value = aple(x.view(), &w, &ApleOptions::default()).unwrap();
        assert_abs_diff_eq!(value, -4.0 * 2.0_f64.sqrt() / 10.0, epsilon = 1e-14);

        // With the check overridden the raw row-standardised W is used:
        // W x = (-2, 1, -2), x'Wx = -6, |Wx|^2 = 9, so APLE = -6 / (9 + 4).
        let raw = ApleOptions {
            override_similarity_check: true,
            ..ApleOptions::default()
        };
        let value = aple(x.view(), &w, &raw).unwrap();
        assert_abs_diff_eq!(value, -6.0 / 13.0, epsilon = 1e-14);
    }

    #[test]
    fn rejects_non_row_standardised_weights() {
        let w = SpatialWeights::new(Neighbours::rook_grid(2, 2).unwrap(), WeightsStyle::B, false)
            .unwrap();
        let x = array![1.0, -1.0, -1.0, 1.0];
        assert!(matches!(
            aple(x.view(), &w, &ApleOptions::default()),
            Err(ApleError::InvalidConfiguration(WeightsStyle::B))
        ));
    }

    #[test]
    fn validates_the_variable() {
        let w = rook_w(2, 2);
        let options = ApleOptions::default();
        assert!(matches!(
            aple(array![1.0, -1.0].view(), &w, &options),
            Err(ApleError::DimensionMismatch { x_len: 2, n: 4 })
        ));
        assert!(matches!(
            aple(array![1.0, f64::NAN, 0.0, 0.0].view(), &w, &options),
            Err(ApleError::NonFiniteValue { index: 1 })
        ));
        assert!(matches!(
            aple(Array1::zeros(4).view(), &w, &options),
            Err(ApleError::DegenerateVariable)
        ));
    }

    #[test]
    fn local_values_average_to_the_statistic() {
        let w = rook_w(3, 4);
        let x = centred(vec![3.0, 1.0, 4.0, 1.0, 5.0, 9.0, 2.0, 6.0, 5.0, 3.0, 5.0, 8.0]);
        let options = ApleOptions::default();
        let global = aple(x.view(), &w, &options).unwrap();
        let local = local_aple(x.view(), &w, &options).unwrap();
        assert_eq!(local.len(), 12);
        assert_abs_diff_eq!(local.mean().unwrap(), global, epsilon = 1e-12);
    }

    #[test]
    fn prep_reports_correction_term() {
        let w = rook_w(3, 3);
        let trace = AplePrep::new(&w, &ApleOptions::default(), FaerBackend).unwrap();
        let eigen = AplePrep::new(
            &w,
            &ApleOptions {
                use_trace: false,
                ..ApleOptions::default()
            },
            FaerBackend,
        )
        .unwrap();
        assert_abs_diff_eq!(trace.correction(), eigen.correction(), epsilon = 1e-12);
        assert_eq!(trace.len(), 9);
        assert!(!trace.is_empty());
    }

    #[derive(Default)]
    struct CountingBackend {
        lags: AtomicUsize,
        eigen_solves: AtomicUsize,
    }

    impl NumericBackend for CountingBackend {
        fn spatial_lag(&self, w: &WeightsMatrix, x: ArrayView1<f64>) -> Array1<f64> {
            self.lags.fetch_add(1, Ordering::Relaxed);
            FaerBackend.spatial_lag(w, x)
        }
        fn transpose_lag(&self, w: &WeightsMatrix, x: ArrayView1<f64>) -> Array1<f64> {
            FaerBackend.transpose_lag(w, x)
        }
        fn trace_of_square(&self, w: &WeightsMatrix) -> f64 {
            FaerBackend.trace_of_square(w)
        }
        fn trace_of_crossprod(&self, w: &WeightsMatrix) -> f64 {
            FaerBackend.trace_of_crossprod(w)
        }
        fn symmetric_eigenvalues(
            &self,
            w: &WeightsMatrix,
        ) -> Result<crate::backend::Spectrum, FaerLinalgError> {
            self.eigen_solves.fetch_add(1, Ordering::Relaxed);
            FaerBackend.symmetric_eigenvalues(w)
        }
        fn eigenvalues(
            &self,
            w: &WeightsMatrix,
        ) -> Result<crate::backend::Spectrum, FaerLinalgError> {
            self.eigen_solves.fetch_add(1, Ordering::Relaxed);
            FaerBackend.eigenvalues(w)
        }
        fn log_det_cholesky(&self, w: &WeightsMatrix, rho: f64) -> Result<f64, FaerLinalgError> {
            FaerBackend.log_det_cholesky(w, rho)
        }
        fn log_det_lu(&self, w: &WeightsMatrix, rho: f64) -> Result<f64, FaerLinalgError> {
            FaerBackend.log_det_lu(w, rho)
        }
    }

    #[test]
    fn injected_backend_is_used() {
        let w = rook_w(3, 3);
        let x = centred((0..9).map(|v| v as f64).collect());
        let prep = AplePrep::new(&w, &ApleOptions::default(), CountingBackend::default()).unwrap();
        let injected = prep.statistic(x.view()).unwrap();
        assert_eq!(prep.backend.lags.load(Ordering::Relaxed), 1);
        assert_abs_diff_eq!(
            injected,
            aple(x.view(), &w, &ApleOptions::default()).unwrap(),
            epsilon = 1e-15
        );
    }

    #[test]
    fn wrong_length_is_rejected_before_the_eigen_solve() {
        let w = rook_w(4, 4);
        let eigen = ApleOptions {
            use_trace: false,
            ..ApleOptions::default()
        };
        let backend = CountingBackend::default();
        let result = aple_with_backend(Array1::ones(15).view(), &w, &eigen, &backend);
        assert!(matches!(
            result,
            Err(ApleError::DimensionMismatch { x_len: 15, n: 16 })
        ));
        assert_eq!(backend.eigen_solves.load(Ordering::Relaxed), 0);

        let x = centred((0..16).map(|v| (v % 5) as f64).collect());
        aple_with_backend(x.view(), &w, &eigen, &backend).unwrap();
        assert_eq!(backend.eigen_solves.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn permutation_requires_simulations() {
        let w = rook_w(2, 2);
        let x = array![1.0, -1.0, -1.0, 1.0];
        let options = PermutationOptions {
            simulations: 0,
            ..PermutationOptions::default()
        };
        assert!(matches!(
            aple_permutation(x.view(), &w, &ApleOptions::default(), &options),
            Err(ApleError::InvalidPermutationCount)
        ));
    }
}
