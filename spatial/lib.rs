#![deny(dead_code)]
#![deny(unused_imports)]

//! Spatial autocorrelation on neighbour-based weights.
//!
//! Builds styled spatial weights, turns row-standardised weights over a
//! symmetric relation into a similar symmetric matrix, and computes the APLE
//! estimator of spatial dependence together with its local decomposition,
//! permutation test and the log-determinants used by spatial regression.

pub mod aple;
pub mod backend;
pub mod config;
pub mod faer_ndarray;
pub mod graph;
pub mod logdet;
pub mod matrix;
pub mod similarity;
pub mod weights;

pub use aple::{
    Alternative, ApleError, ApleOptions, AplePrep, PermutationOptions, PermutationOutcome, aple,
    aple_permutation, aple_with_backend, local_aple,
};
pub use backend::{FaerBackend, NumericBackend, Spectrum};
pub use config::{AnalysisConfig, ConfigError};
pub use logdet::{LogDetError, LogDetMethod, LogDeterminant, ParameterInterval};
pub use similarity::{
    AsymmetryReason, Similarity, SimilarityError, SymmetricWeights, symmetrize_by_similarity,
};
pub use weights::{Neighbours, SpatialWeights, WeightsError, WeightsStyle};
