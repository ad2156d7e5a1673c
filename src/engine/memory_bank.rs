//! Reference patch memory bank
//!
//! Holds the embeddings of known-good patches and answers exact
//! nearest-neighbor queries. When a PCA basis is attached, stored embeddings
//! live in the projected space and every query is projected through the same
//! basis before distances are taken.

use nalgebra::{DMatrix, SymmetricEigen};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rayon::prelude::*;
use tracing::{debug, info};

use crate::error::{EngineError, Result};
use crate::utils::math::squared_euclidean;

/// Tolerance for the orthonormality check on loaded bases
const ORTHONORMAL_TOLERANCE: f32 = 1e-3;

/// Linear projection retaining a target fraction of variance.
#[derive(Debug, Clone)]
pub struct PcaBasis {
    mean: Array1<f32>,
    /// One orthonormal component per row, shape (k, d_in)
    components: Array2<f32>,
    explained_variance_ratio: Array1<f32>,
    variance_threshold: f32,
}

impl PcaBasis {
    pub fn new(
        mean: Array1<f32>,
        components: Array2<f32>,
        explained_variance_ratio: Array1<f32>,
        variance_threshold: f32,
    ) -> Result<Self> {
        let basis = Self {
            mean,
            components,
            explained_variance_ratio,
            variance_threshold,
        };
        basis.validate()?;
        Ok(basis)
    }

    /// Fit a basis keeping at least `variance` of the total variance.
    pub fn fit(data: ArrayView2<f32>, variance: f32) -> Result<Self> {
        let (n, d) = data.dim();
        if n < 2 || d == 0 {
            return Err(EngineError::InvalidArtifact(format!(
                "PCA needs at least 2 samples of non-zero dimension, got {}x{}",
                n, d
            )));
        }
        if !(variance > 0.0 && variance <= 1.0) {
            return Err(EngineError::InvalidConfig(format!(
                "pca_variance must be in (0, 1], got {}",
                variance
            )));
        }

        let mean = data
            .mean_axis(Axis(0))
            .ok_or_else(|| EngineError::InvalidArtifact("empty PCA input".to_string()))?;
        let centered = &data - &mean;

        // Sample covariance in f64 for a stable eigen-decomposition
        let mut cov = DMatrix::<f64>::zeros(d, d);
        for row in centered.outer_iter() {
            for i in 0..d {
                let ri = row[i] as f64;
                for j in i..d {
                    cov[(i, j)] += ri * row[j] as f64;
                }
            }
        }
        let denom = (n - 1) as f64;
        for i in 0..d {
            for j in i..d {
                let v = cov[(i, j)] / denom;
                cov[(i, j)] = v;
                cov[(j, i)] = v;
            }
        }

        let eigen = SymmetricEigen::new(cov);
        let mut order: Vec<usize> = (0..d).collect();
        order.sort_by(|&a, &b| eigen.eigenvalues[b].total_cmp(&eigen.eigenvalues[a]));

        let eigenvalues: Vec<f64> = order.iter().map(|&i| eigen.eigenvalues[i].max(0.0)).collect();
        let total: f64 = eigenvalues.iter().sum();

        let ratios: Vec<f64> = if total > 0.0 {
            eigenvalues.iter().map(|v| v / total).collect()
        } else {
            vec![0.0; d]
        };

        let mut k = d;
        let mut cumulative = 0.0;
        for (i, r) in ratios.iter().enumerate() {
            cumulative += r;
            if cumulative + 1e-9 >= variance as f64 {
                k = i + 1;
                break;
            }
        }

        let mut components = Array2::<f32>::zeros((k, d));
        for (row, &idx) in order.iter().take(k).enumerate() {
            let vector = eigen.eigenvectors.column(idx);
            for col in 0..d {
                components[[row, col]] = vector[col] as f32;
            }
        }
        let explained = Array1::from_iter(ratios.iter().take(k).map(|&r| r as f32));

        info!(
            "PCA fit: {} -> {} dims ({:.4} variance retained, target {})",
            d,
            k,
            explained.sum(),
            variance
        );

        Self::new(mean, components, explained, variance)
    }

    /// Check shapes and row orthonormality
    pub fn validate(&self) -> Result<()> {
        let (k, d) = self.components.dim();
        if k == 0 || d == 0 {
            return Err(EngineError::InvalidArtifact("PCA basis is empty".to_string()));
        }
        if self.mean.len() != d {
            return Err(EngineError::InvalidArtifact(format!(
                "PCA mean has {} dims, components have {}",
                self.mean.len(),
                d
            )));
        }
        if self.explained_variance_ratio.len() != k {
            return Err(EngineError::InvalidArtifact(format!(
                "PCA explained variance has {} entries for {} components",
                self.explained_variance_ratio.len(),
                k
            )));
        }

        let gram = self.components.dot(&self.components.t());
        for ((i, j), v) in gram.indexed_iter() {
            let expected = if i == j { 1.0 } else { 0.0 };
            if (v - expected).abs() > ORTHONORMAL_TOLERANCE {
                return Err(EngineError::InvalidArtifact(format!(
                    "PCA components not orthonormal at ({}, {}): {}",
                    i, j, v
                )));
            }
        }
        Ok(())
    }

    pub fn input_dim(&self) -> usize {
        self.components.ncols()
    }

    pub fn output_dim(&self) -> usize {
        self.components.nrows()
    }

    pub fn mean(&self) -> ArrayView1<'_, f32> {
        self.mean.view()
    }

    pub fn components(&self) -> ArrayView2<'_, f32> {
        self.components.view()
    }

    pub fn explained_variance_ratio(&self) -> ArrayView1<'_, f32> {
        self.explained_variance_ratio.view()
    }

    pub fn variance_threshold(&self) -> f32 {
        self.variance_threshold
    }

    /// Project a single embedding
    pub fn project(&self, row: ArrayView1<f32>) -> Result<Array1<f32>> {
        self.check_input(row.len())?;
        let centered = &row - &self.mean;
        Ok(self.components.dot(&centered))
    }

    /// Project every row of `rows`
    pub fn project_rows(&self, rows: ArrayView2<f32>) -> Result<Array2<f32>> {
        self.check_input(rows.ncols())?;
        let centered = &rows - &self.mean;
        Ok(centered.dot(&self.components.t()))
    }

    fn check_input(&self, dim: usize) -> Result<()> {
        if dim != self.input_dim() {
            return Err(EngineError::ConfigMismatch(format!(
                "embedding has {} dims, PCA basis expects {}",
                dim,
                self.input_dim()
            )));
        }
        Ok(())
    }
}

/// Immutable set of reference patch embeddings.
#[derive(Debug, Clone)]
pub struct MemoryBank {
    /// Row-major (len, dim) embeddings in stored space
    data: Vec<f32>,
    len: usize,
    dim: usize,
    pca: Option<PcaBasis>,
}

impl MemoryBank {
    /// Wrap embeddings already in stored space (projected if `pca` is set).
    pub fn new(embeddings: Array2<f32>, pca: Option<PcaBasis>) -> Result<Self> {
        let (len, dim) = embeddings.dim();
        if len == 0 || dim == 0 {
            return Err(EngineError::InvalidArtifact(format!(
                "memory bank is empty ({}x{})",
                len, dim
            )));
        }
        if let Some(basis) = &pca {
            if basis.output_dim() != dim {
                return Err(EngineError::ConfigMismatch(format!(
                    "memory bank has {} dims, PCA basis projects to {}",
                    dim,
                    basis.output_dim()
                )));
            }
        }

        let data: Vec<f32> = embeddings.iter().copied().collect();
        Ok(Self { data, len, dim, pca })
    }

    /// Wrap raw backbone embeddings, projecting them through `pca` if given.
    pub fn from_raw(embeddings: Array2<f32>, pca: Option<PcaBasis>) -> Result<Self> {
        match pca {
            Some(basis) => {
                let projected = basis.project_rows(embeddings.view())?;
                Self::new(projected, Some(basis))
            }
            None => Self::new(embeddings, None),
        }
    }

    /// Build a bank from raw embeddings, fitting PCA when a variance is given.
    pub fn build(embeddings: Array2<f32>, pca_variance: Option<f32>) -> Result<Self> {
        let pca = pca_variance
            .map(|variance| PcaBasis::fit(embeddings.view(), variance))
            .transpose()?;
        let bank = Self::from_raw(embeddings, pca)?;
        debug!("Built memory bank: {} x {}", bank.len, bank.dim);
        Ok(bank)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Dimensionality of stored embeddings
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Dimensionality a raw query must have
    pub fn query_dim(&self) -> usize {
        self.pca.as_ref().map_or(self.dim, PcaBasis::input_dim)
    }

    pub fn pca(&self) -> Option<&PcaBasis> {
        self.pca.as_ref()
    }

    /// Stored embeddings as a (len, dim) view
    pub fn embeddings(&self) -> ArrayView2<'_, f32> {
        ArrayView2::from_shape((self.len, self.dim), &self.data)
            .expect("bank storage matches its recorded shape")
    }

    /// Minimum Euclidean distance from a raw query to the bank
    pub fn nearest_distance(&self, query: ArrayView1<f32>) -> Result<f32> {
        let projected = match &self.pca {
            Some(basis) => basis.project(query)?,
            None => query.to_owned(),
        };
        self.check_stored_dim(projected.len())?;

        let q: Vec<f32> = projected.iter().copied().collect();
        Ok(self.nearest_stored(&q))
    }

    /// Minimum distance for every row of `queries`, in row order.
    pub fn nearest_distances(&self, queries: ArrayView2<f32>) -> Result<Vec<f32>> {
        let projected = match &self.pca {
            Some(basis) => basis.project_rows(queries)?,
            None => queries.to_owned(),
        };
        self.check_stored_dim(projected.ncols())?;

        let flat: Vec<f32> = projected.iter().copied().collect();
        Ok(flat
            .par_chunks_exact(self.dim)
            .map(|q| self.nearest_stored(q))
            .collect())
    }

    fn check_stored_dim(&self, dim: usize) -> Result<()> {
        if dim != self.dim {
            return Err(EngineError::ConfigMismatch(format!(
                "query has {} dims after projection, memory bank stores {}",
                dim, self.dim
            )));
        }
        Ok(())
    }

    fn nearest_stored(&self, q: &[f32]) -> f32 {
        self.data
            .chunks_exact(self.dim)
            .map(|reference| squared_euclidean(q, reference))
            .fold(f32::INFINITY, f32::min)
            .sqrt()
    }
}
