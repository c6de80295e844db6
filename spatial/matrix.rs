use crate::faer_ndarray::FaerLinalgError;
use faer::sparse::{SparseColMat, Triplet};
use ndarray::{Array1, Array2, ArrayView1};

/// Unified weights matrix representation for dense and sparse workflows.
#[derive(Clone)]
pub enum WeightsMatrix {
    Dense(Array2<f64>),
    Sparse(SparseColMat<usize, f64>),
}

impl WeightsMatrix {
    /// Assembles a sparse matrix with `W[i, lists[i][k]] = values[i][k]`.
    pub fn from_lists(
        n: usize,
        lists: &[Vec<usize>],
        values: &[Vec<f64>],
    ) -> Result<Self, FaerLinalgError> {
        let triplets: Vec<Triplet<usize, usize, f64>> = lists
            .iter()
            .zip(values)
            .enumerate()
            .flat_map(|(row, (cols, vals))| {
                cols.iter()
                    .zip(vals)
                    .map(move |(&col, &val)| Triplet::new(row, col, val))
            })
            .collect();
        let matrix = SparseColMat::<usize, f64>::try_new_from_triplets(n, n, &triplets)
            .map_err(|err| FaerLinalgError::SparseConstruction(format!("{err:?}")))?;
        Ok(Self::Sparse(matrix))
    }

    pub fn nrows(&self) -> usize {
        match self {
            Self::Dense(matrix) => matrix.nrows(),
            Self::Sparse(matrix) => matrix.nrows(),
        }
    }

    pub fn ncols(&self) -> usize {
        match self {
            Self::Dense(matrix) => matrix.ncols(),
            Self::Sparse(matrix) => matrix.ncols(),
        }
    }

    pub fn to_dense(&self) -> Array2<f64> {
        match self {
            Self::Dense(matrix) => matrix.clone(),
            Self::Sparse(matrix) => {
                let dense = matrix.as_ref().to_dense();
                Array2::from_shape_fn((dense.nrows(), dense.ncols()), |(i, j)| dense[(i, j)])
            }
        }
    }

    /// Dense copy, for matrices that are factorised repeatedly.
    pub fn densified(&self) -> Self {
        Self::Dense(self.to_dense())
    }

    /// Dense `I - rho W`.
    pub fn identity_minus(&self, rho: f64) -> Array2<f64> {
        let mut shifted = self.to_dense();
        shifted.mapv_inplace(|w| -rho * w);
        shifted.diag_mut().mapv_inplace(|d| d + 1.0);
        shifted
    }

    pub fn matrix_vector_multiply(&self, vector: ArrayView1<f64>) -> Array1<f64> {
        match self {
            Self::Dense(matrix) => matrix.dot(&vector),
            Self::Sparse(matrix) => {
                let mut output = Array1::<f64>::zeros(matrix.nrows());
                let (symbolic, values) = matrix.parts();
                let col_ptr = symbolic.col_ptr();
                let row_idx = symbolic.row_idx();
                for col in 0..matrix.ncols() {
                    let start = col_ptr[col];
                    let end = col_ptr[col + 1];
                    let x = vector[col];
                    for idx in start..end {
                        let row = row_idx[idx];
                        output[row] += values[idx] * x;
                    }
                }
                output
            }
        }
    }

    pub fn transpose_vector_multiply(&self, vector: ArrayView1<f64>) -> Array1<f64> {
        match self {
            Self::Dense(matrix) => matrix.t().dot(&vector),
            Self::Sparse(matrix) => {
                let mut output = Array1::<f64>::zeros(matrix.ncols());
                let (symbolic, values) = matrix.parts();
                let col_ptr = symbolic.col_ptr();
                let row_idx = symbolic.row_idx();
                for col in 0..matrix.ncols() {
                    let mut acc = 0.0;
                    let start = col_ptr[col];
                    let end = col_ptr[col + 1];
                    for idx in start..end {
                        let row = row_idx[idx];
                        acc += values[idx] * vector[row];
                    }
                    output[col] = acc;
                }
                output
            }
        }
    }

    /// `tr(W W) = sum_ij w_ij w_ji`, which equals the sum of squared eigenvalues.
    pub fn trace_of_square(&self) -> f64 {
        match self {
            Self::Dense(matrix) => matrix
                .indexed_iter()
                .map(|((i, j), &w)| w * matrix[(j, i)])
                .sum(),
            Self::Sparse(matrix) => {
                let mut trace = 0.0;
                for_each_entry(matrix, |row, col, w| {
                    if w != 0.0 {
                        trace += w * sparse_entry(matrix, col, row);
                    }
                });
                trace
            }
        }
    }

    /// `tr(W' W)`: the squared Frobenius norm.
    pub fn trace_of_crossprod(&self) -> f64 {
        match self {
            Self::Dense(matrix) => matrix.iter().map(|w| w * w).sum(),
            Self::Sparse(matrix) => {
                let (_, values) = matrix.parts();
                values.iter().map(|w| w * w).sum()
            }
        }
    }

    /// Largest `|w_ij - w_ji|` over all entries.
    pub fn max_asymmetry(&self) -> f64 {
        match self {
            Self::Dense(matrix) => matrix
                .indexed_iter()
                .map(|((i, j), &w)| (w - matrix[(j, i)]).abs())
                .fold(0.0_f64, f64::max),
            Self::Sparse(matrix) => {
                let mut worst = 0.0_f64;
                for_each_entry(matrix, |row, col, w| {
                    worst = worst.max((w - sparse_entry(matrix, col, row)).abs());
                });
                worst
            }
        }
    }
}

fn for_each_entry(matrix: &SparseColMat<usize, f64>, mut visit: impl FnMut(usize, usize, f64)) {
    let (symbolic, values) = matrix.parts();
    let col_ptr = symbolic.col_ptr();
    let row_idx = symbolic.row_idx();
    for col in 0..matrix.ncols() {
        for idx in col_ptr[col]..col_ptr[col + 1] {
            visit(row_idx[idx], col, values[idx]);
        }
    }
}

fn sparse_entry(matrix: &SparseColMat<usize, f64>, row: usize, col: usize) -> f64 {
    let (symbolic, values) = matrix.parts();
    let col_ptr = symbolic.col_ptr();
    let start = col_ptr[col];
    let end = col_ptr[col + 1];
    symbolic.row_idx()[start..end]
        .iter()
        .position(|&r| r == row)
        .map_or(0.0, |offset| values[start + offset])
}
