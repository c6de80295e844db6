use crate::faer_ndarray::FaerLinalgError;
use crate::matrix::WeightsMatrix;
use crate::weights::{SpatialWeights, WeightsStyle};
use ndarray::{Array1, Array2};
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Why a weights structure cannot be made symmetric by a diagonal similarity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AsymmetryReason {
    /// `neighbour` is a neighbour of `entity` but not the other way round.
    AsymmetricNeighbours { entity: usize, neighbour: usize },
    /// The relation is symmetric but the unstyled general weights are not.
    AsymmetricGeneralWeights,
    /// The style does not record enough to undo its row scaling.
    UnsupportedStyle(WeightsStyle),
}

impl fmt::Display for AsymmetryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AsymmetricNeighbours { entity, neighbour } => write!(
                f,
                "entity {neighbour} is a neighbour of {entity}, but {entity} is not a neighbour of {neighbour}"
            ),
            Self::AsymmetricGeneralWeights => {
                write!(f, "the general weights are asymmetric over a symmetric neighbour relation")
            }
            Self::UnsupportedStyle(style) => {
                write!(f, "style {style} weights carry no row scale to undo")
            }
        }
    }
}

#[derive(Error, Debug)]
pub enum SimilarityError {
    #[error("Weights are not similar to a symmetric matrix: {0}.")]
    AsymmetricStructure(AsymmetryReason),
    #[error(transparent)]
    Linalg(#[from] FaerLinalgError),
}

/// Diagonal `d` of the similarity `W_sym = D^{1/2} W D^{-1/2}`.
#[derive(Debug, Clone, PartialEq)]
pub struct SimilarityScaling {
    factors: Array1<f64>,
}

impl SimilarityScaling {
    /// `sqrt(d_i) w_ij / sqrt(d_j)`; zero scale entries map to zero.
    fn apply(&self, i: usize, j: usize, w: f64) -> f64 {
        let (di, dj) = (self.factors[i], self.factors[j]);
        if di <= 0.0 || dj <= 0.0 {
            return 0.0;
        }
        w * (di / dj).sqrt()
    }
}

/// Outcome of checking whether weights can be symmetrised by similarity.
#[derive(Debug, Clone, PartialEq)]
pub enum Similarity {
    Symmetrizable(SimilarityScaling),
    NotSymmetrizable(AsymmetryReason),
}

impl Similarity {
    /// Decides whether `weights` is similar to a symmetric matrix.
    ///
    /// Requires a symmetric neighbour relation and, for general weights,
    /// symmetric unstyled values. `B`, `C`, `U` and `minmax` weights are global
    /// rescalings and need no diagonal; `W` and `S` use the recorded row scale.
    pub fn assess(weights: &SpatialWeights) -> Self {
        if let Some((entity, neighbour)) = weights.neighbours().first_asymmetry() {
            return Self::NotSymmetrizable(AsymmetryReason::AsymmetricNeighbours {
                entity,
                neighbour,
            });
        }
        if weights.general_weights_symmetric() == Some(false) {
            return Self::NotSymmetrizable(AsymmetryReason::AsymmetricGeneralWeights);
        }
        match weights.scale_factors() {
            Some(factors) => Self::Symmetrizable(SimilarityScaling { factors }),
            None => Self::NotSymmetrizable(AsymmetryReason::UnsupportedStyle(weights.style())),
        }
    }
}

/// Symmetric matrix sharing its eigenvalues with the original weights.
#[derive(Clone)]
pub struct SymmetricWeights {
    matrix: WeightsMatrix,
}

impl SymmetricWeights {
    pub fn matrix(&self) -> &WeightsMatrix {
        &self.matrix
    }

    pub fn to_dense(&self) -> Array2<f64> {
        self.matrix.to_dense()
    }

    pub fn max_asymmetry(&self) -> f64 {
        self.matrix.max_asymmetry()
    }
}

/// Applies the similarity transform, failing when the structure is intrinsically asymmetric.
pub fn symmetrize_by_similarity(
    weights: &SpatialWeights,
) -> Result<SymmetricWeights, SimilarityError> {
    let scaling = match Similarity::assess(weights) {
        Similarity::Symmetrizable(scaling) => scaling,
        Similarity::NotSymmetrizable(reason) => {
            return Err(SimilarityError::AsymmetricStructure(reason));
        }
    };
    let lists = weights.neighbours().lists();
    let values: Vec<Vec<f64>> = lists
        .iter()
        .zip(weights.weights())
        .enumerate()
        .map(|(i, (list, row))| {
            list.iter()
                .zip(row)
                .map(|(&j, &w)| scaling.apply(i, j, w))
                .collect()
        })
        .collect();
    let matrix = WeightsMatrix::from_lists(weights.len(), lists, &values)?;
    let symmetric = SymmetricWeights { matrix };
    log::debug!(
        "Symmetrised style {} weights; residual asymmetry {:.3e}",
        weights.style(),
        symmetric.max_asymmetry()
    );
    Ok(symmetric)
}
