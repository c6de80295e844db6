use crate::faer_ndarray::FaerLinalgError;
use crate::matrix::WeightsMatrix;
use ahash::AHashSet;
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Tolerance on row sums when accepting externally built row-standardised weights.
const ROW_SUM_TOLERANCE: f64 = 1e-8;

/// Relative tolerance used when deciding whether general weights satisfy `g_ij == g_ji`.
const GENERAL_SYMMETRY_TOLERANCE: f64 = 1e-10;

/// Errors raised while building or querying a spatial weights structure.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum WeightsError {
    #[error("Entity {entity} lists neighbour {neighbour}, but only {n} entities exist.")]
    NeighbourOutOfRange {
        entity: usize,
        neighbour: usize,
        n: usize,
    },

    #[error("Entity {0} lists itself as a neighbour.")]
    SelfNeighbour(usize),

    #[error("Entity {entity} lists neighbour {neighbour} more than once.")]
    DuplicateNeighbour { entity: usize, neighbour: usize },

    #[error("Entity {0} has no neighbours and the zero policy does not allow empty neighbour sets.")]
    EmptyNeighbourSet(usize),

    #[error("Entity {entity} has {neighbours} neighbours but {weights} weights.")]
    LengthMismatch {
        entity: usize,
        neighbours: usize,
        weights: usize,
    },

    #[error("Expected {expected} entities but found {found}.")]
    EntityCountMismatch { expected: usize, found: usize },

    #[error("Entity {0} carries a non-finite weight.")]
    NonFiniteWeight(usize),

    #[error("Row-standardised weights of entity {entity} sum to {sum} instead of 1.")]
    RowSumNotOne { entity: usize, sum: f64 },

    #[error("Weights of entity {0} sum to zero, so the row cannot be standardised.")]
    ZeroRowSum(usize),

    #[error("The weights sum to zero overall, so global standardisation is undefined.")]
    ZeroTotalWeight,

    #[error("A grid needs at least one row and one column, got {nrow} x {ncol}.")]
    EmptyGrid { nrow: usize, ncol: usize },
}

/// How the raw (binary or general) weights were transformed.
///
/// The names follow the single-letter tags used by spatial econometrics
/// software, so `Display` prints the tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WeightsStyle {
    /// Basic weights: the binary indicator or the supplied general weights.
    B,
    /// Row standardised: each row with neighbours sums to one.
    W,
    /// Globally standardised so that all weights sum to the number of entities.
    C,
    /// Globally standardised so that all weights sum to one.
    U,
    /// Variance stabilising scheme of Tiefelsdorf, Griffith and Boots (1999).
    S,
    /// Divided by the smaller of the largest row sum and largest column sum.
    #[serde(rename = "minmax")]
    MinMax,
}

impl fmt::Display for WeightsStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            Self::B => "B",
            Self::W => "W",
            Self::C => "C",
            Self::U => "U",
            Self::S => "S",
            Self::MinMax => "minmax",
        };
        f.write_str(tag)
    }
}

/// A validated neighbour relation over `n` entities, indexed from zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Neighbours {
    lists: Vec<Vec<usize>>,
}

impl Neighbours {
    /// Validates and wraps neighbour lists.
    ///
    /// Every entry must lie in `0..n`, differ from its own entity and appear at
    /// most once per list. Order inside a list is preserved.
    pub fn new(lists: Vec<Vec<usize>>) -> Result<Self, WeightsError> {
        let n = lists.len();
        for (entity, list) in lists.iter().enumerate() {
            let mut seen = AHashSet::with_capacity(list.len());
            for &neighbour in list {
                if neighbour >= n {
                    return Err(WeightsError::NeighbourOutOfRange {
                        entity,
                        neighbour,
                        n,
                    });
                }
                if neighbour == entity {
                    return Err(WeightsError::SelfNeighbour(entity));
                }
                if !seen.insert(neighbour) {
                    return Err(WeightsError::DuplicateNeighbour { entity, neighbour });
                }
            }
        }
        Ok(Self { lists })
    }

    /// Rook contiguity on an `nrow x ncol` lattice, entities numbered row by row.
    pub fn rook_grid(nrow: usize, ncol: usize) -> Result<Self, WeightsError> {
        Self::grid(nrow, ncol, false)
    }

    /// Queen contiguity on an `nrow x ncol` lattice (rook plus diagonals).
    pub fn queen_grid(nrow: usize, ncol: usize) -> Result<Self, WeightsError> {
        Self::grid(nrow, ncol, true)
    }

    fn grid(nrow: usize, ncol: usize, diagonals: bool) -> Result<Self, WeightsError> {
        if nrow == 0 || ncol == 0 {
            return Err(WeightsError::EmptyGrid { nrow, ncol });
        }
        let mut lists = Vec::with_capacity(nrow * ncol);
        for row in 0..nrow {
            for col in 0..ncol {
                let mut list = Vec::with_capacity(if diagonals { 8 } else { 4 });
                for dr in -1_isize..=1 {
                    for dc in -1_isize..=1 {
                        if dr == 0 && dc == 0 {
                            continue;
                        }
                        if !diagonals && dr != 0 && dc != 0 {
                            continue;
                        }
                        let r = row as isize + dr;
                        let c = col as isize + dc;
                        if r < 0 || c < 0 || r >= nrow as isize || c >= ncol as isize {
                            continue;
                        }
                        list.push(r as usize * ncol + c as usize);
                    }
                }
                lists.push(list);
            }
        }
        Ok(Self { lists })
    }

    pub fn len(&self) -> usize {
        self.lists.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lists.is_empty()
    }

    pub fn get(&self, entity: usize) -> &[usize] {
        &self.lists[entity]
    }

    pub fn lists(&self) -> &[Vec<usize>] {
        &self.lists
    }

    /// Number of neighbours of each entity.
    pub fn cardinalities(&self) -> Vec<usize> {
        self.lists.iter().map(Vec::len).collect()
    }

    /// Total number of directed links.
    pub fn link_count(&self) -> usize {
        self.lists.iter().map(Vec::len).sum()
    }

    /// Entities with an empty neighbour set.
    pub fn isolates(&self) -> Vec<usize> {
        self.lists
            .iter()
            .enumerate()
            .filter(|(_, list)| list.is_empty())
            .map(|(entity, _)| entity)
            .collect()
    }

    /// Returns the first link `i -> j` without the reverse link `j -> i`.
    pub fn first_asymmetry(&self) -> Option<(usize, usize)> {
        let links: AHashSet<(usize, usize)> = self
            .lists
            .iter()
            .enumerate()
            .flat_map(|(i, list)| list.iter().map(move |&j| (i, j)))
            .collect();
        self.lists.iter().enumerate().find_map(|(i, list)| {
            list.iter()
                .find(|&&j| !links.contains(&(j, i)))
                .map(|&j| (i, j))
        })
    }

    pub fn is_symmetric(&self) -> bool {
        self.first_asymmetry().is_none()
    }
}

/// Neighbour relation plus per-link weights and the style tag describing them.
///
/// Built once and read thereafter. For styles that rescale rows (`W`, `S`) the
/// per-entity row scale `q` is kept, so that `diag(q) W` is a global multiple of
/// the unstyled weights; the similarity transform relies on it.
#[derive(Debug, Clone)]
pub struct SpatialWeights {
    neighbours: Neighbours,
    weights: Vec<Vec<f64>>,
    style: WeightsStyle,
    row_scale: Option<Array1<f64>>,
    general_symmetric: Option<bool>,
}

impl SpatialWeights {
    /// Binary weights (one per link) transformed to `style`.
    pub fn new(
        neighbours: Neighbours,
        style: WeightsStyle,
        zero_policy: bool,
    ) -> Result<Self, WeightsError> {
        let basic: Vec<Vec<f64>> = neighbours
            .lists()
            .iter()
            .map(|list| vec![1.0; list.len()])
            .collect();
        Self::build(neighbours, basic, style, zero_policy, None)
    }

    /// User supplied general weights, parallel to `neighbours`, transformed to `style`.
    ///
    /// Whether the general weights are themselves symmetric is recorded: row
    /// standardised general weights over a symmetric relation are only similar to
    /// a symmetric matrix when `g_ij == g_ji`.
    pub fn with_general_weights(
        neighbours: Neighbours,
        general: Vec<Vec<f64>>,
        style: WeightsStyle,
        zero_policy: bool,
    ) -> Result<Self, WeightsError> {
        check_parallel(&neighbours, &general)?;
        let symmetric = values_symmetric(&neighbours, &general, None);
        Self::build(neighbours, general, style, zero_policy, Some(symmetric))
    }

    /// Wraps already styled weights produced elsewhere.
    ///
    /// Row-standardised input must have unit row sums for every entity with
    /// neighbours. No row scale is stored, so binary cardinalities stand in for it.
    pub fn from_parts(
        neighbours: Neighbours,
        weights: Vec<Vec<f64>>,
        style: WeightsStyle,
    ) -> Result<Self, WeightsError> {
        check_parallel(&neighbours, &weights)?;
        if style == WeightsStyle::W {
            for (entity, row) in weights.iter().enumerate() {
                if row.is_empty() {
                    continue;
                }
                let sum: f64 = row.iter().sum();
                if (sum - 1.0).abs() > ROW_SUM_TOLERANCE {
                    return Err(WeightsError::RowSumNotOne { entity, sum });
                }
            }
        }
        let scale = match style {
            WeightsStyle::W => Some(cardinality_scale(&neighbours)),
            WeightsStyle::S => None,
            _ => Some(Array1::ones(neighbours.len())),
        };
        let symmetric = scale
            .as_ref()
            .map(|q| values_symmetric(&neighbours, &weights, Some(q)));
        Ok(Self {
            neighbours,
            weights,
            style,
            row_scale: None,
            general_symmetric: symmetric,
        })
    }

    fn build(
        neighbours: Neighbours,
        basic: Vec<Vec<f64>>,
        style: WeightsStyle,
        zero_policy: bool,
        general_symmetric: Option<bool>,
    ) -> Result<Self, WeightsError> {
        if !zero_policy {
            if let Some(&entity) = neighbours.isolates().first() {
                return Err(WeightsError::EmptyNeighbourSet(entity));
            }
        }
        let n = neighbours.len();
        let (weights, row_scale) = match style {
            WeightsStyle::B => (basic, None),
            WeightsStyle::W => {
                let q = row_sums_of(&basic);
                let mut styled = basic;
                for (entity, row) in styled.iter_mut().enumerate() {
                    if row.is_empty() {
                        continue;
                    }
                    if q[entity] == 0.0 {
                        return Err(WeightsError::ZeroRowSum(entity));
                    }
                    row.iter_mut().for_each(|w| *w /= q[entity]);
                }
                (styled, Some(q))
            }
            WeightsStyle::C | WeightsStyle::U => {
                let total: f64 = basic.iter().flatten().sum();
                if total == 0.0 {
                    return Err(WeightsError::ZeroTotalWeight);
                }
                let factor = if style == WeightsStyle::C {
                    n as f64 / total
                } else {
                    1.0 / total
                };
                (scale_all(basic, factor), None)
            }
            WeightsStyle::S => {
                let q: Array1<f64> = basic
                    .iter()
                    .map(|row| row.iter().map(|w| w * w).sum::<f64>().sqrt())
                    .collect();
                let mut styled = basic;
                for (entity, row) in styled.iter_mut().enumerate() {
                    if row.is_empty() {
                        continue;
                    }
                    if q[entity] == 0.0 {
                        return Err(WeightsError::ZeroRowSum(entity));
                    }
                    row.iter_mut().for_each(|w| *w /= q[entity]);
                }
                let total: f64 = styled.iter().flatten().sum();
                if total == 0.0 {
                    return Err(WeightsError::ZeroTotalWeight);
                }
                (scale_all(styled, n as f64 / total), Some(q))
            }
            WeightsStyle::MinMax => {
                let row_max = row_sums_of(&basic).fold(0.0_f64, |acc, &v| acc.max(v));
                let mut col_sums = vec![0.0; n];
                for (list, row) in neighbours.lists().iter().zip(&basic) {
                    for (&j, &w) in list.iter().zip(row) {
                        col_sums[j] += w;
                    }
                }
                let col_max = col_sums.iter().fold(0.0_f64, |acc, &v| acc.max(v));
                let divisor = row_max.min(col_max);
                if divisor == 0.0 {
                    return Err(WeightsError::ZeroTotalWeight);
                }
                (scale_all(basic, 1.0 / divisor), None)
            }
        };
        for (entity, row) in weights.iter().enumerate() {
            if row.iter().any(|w| !w.is_finite()) {
                return Err(WeightsError::NonFiniteWeight(entity));
            }
        }
        log::debug!(
            "Built style {} weights over {} entities with {} links",
            style,
            n,
            neighbours.link_count()
        );
        Ok(Self {
            neighbours,
            weights,
            style,
            row_scale,
            general_symmetric,
        })
    }

    pub fn len(&self) -> usize {
        self.neighbours.len()
    }

    pub fn is_empty(&self) -> bool {
        self.neighbours.is_empty()
    }

    pub fn style(&self) -> WeightsStyle {
        self.style
    }

    pub fn neighbours(&self) -> &Neighbours {
        &self.neighbours
    }

    pub fn weights(&self) -> &[Vec<f64>] {
        &self.weights
    }

    pub fn row_sums(&self) -> Array1<f64> {
        row_sums_of(&self.weights)
    }

    /// Per-entity scale `q` with `diag(q) W` symmetric up to a global factor.
    ///
    /// Falls back to the neighbour cardinalities when the weights did not record a
    /// scale (binary row-standardised input), and to ones for the globally scaled
    /// styles. `None` only for `S` weights supplied via [`SpatialWeights::from_parts`].
    pub fn scale_factors(&self) -> Option<Array1<f64>> {
        if let Some(q) = &self.row_scale {
            return Some(q.clone());
        }
        match self.style {
            WeightsStyle::W => Some(cardinality_scale(&self.neighbours)),
            WeightsStyle::S => None,
            _ => Some(Array1::ones(self.len())),
        }
    }

    /// `Some(false)` when the unstyled weights are known to be asymmetric.
    pub fn general_weights_symmetric(&self) -> Option<bool> {
        self.general_symmetric
    }

    /// Sparse matrix form of the weights.
    pub fn to_matrix(&self) -> Result<WeightsMatrix, FaerLinalgError> {
        WeightsMatrix::from_lists(self.len(), self.neighbours.lists(), &self.weights)
    }
}

fn check_parallel(neighbours: &Neighbours, values: &[Vec<f64>]) -> Result<(), WeightsError> {
    if values.len() != neighbours.len() {
        return Err(WeightsError::EntityCountMismatch {
            expected: neighbours.len(),
            found: values.len(),
        });
    }
    for (entity, (list, row)) in neighbours.lists().iter().zip(values).enumerate() {
        if list.len() != row.len() {
            return Err(WeightsError::LengthMismatch {
                entity,
                neighbours: list.len(),
                weights: row.len(),
            });
        }
        if row.iter().any(|w| !w.is_finite()) {
            return Err(WeightsError::NonFiniteWeight(entity));
        }
    }
    Ok(())
}

fn row_sums_of(values: &[Vec<f64>]) -> Array1<f64> {
    values.iter().map(|row| row.iter().sum::<f64>()).collect()
}

fn cardinality_scale(neighbours: &Neighbours) -> Array1<f64> {
    neighbours.lists().iter().map(|list| list.len() as f64).collect()
}

fn scale_all(mut values: Vec<Vec<f64>>, factor: f64) -> Vec<Vec<f64>> {
    values
        .iter_mut()
        .flat_map(|row| row.iter_mut())
        .for_each(|w| *w *= factor);
    values
}

/// Checks `q_i v_ij == q_j v_ji` over every link (with `q` = ones when absent).
fn values_symmetric(
    neighbours: &Neighbours,
    values: &[Vec<f64>],
    scale: Option<&Array1<f64>>,
) -> bool {
    let lists = neighbours.lists();
    let scaled = |i: usize, w: f64| scale.map_or(w, |q| q[i] * w);
    lists.iter().enumerate().all(|(i, list)| {
        list.iter().zip(&values[i]).all(|(&j, &w_ij)| {
            let Some(pos) = lists[j].iter().position(|&k| k == i) else {
                return false;
            };
            let a = scaled(i, w_ij);
            let b = scaled(j, values[j][pos]);
            (a - b).abs() <= GENERAL_SYMMETRY_TOLERANCE * a.abs().max(b.abs()).max(1.0)
        })
    })
}
