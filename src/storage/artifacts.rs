//! Persisted model artifacts
//!
//! A model directory holds a JSON manifest and little-endian `f32` blobs:
//!
//! ```text
//! models/<name>/
//!   manifest.json
//!   memory_bank.f32    bank_len x bank_dim, row-major
//!   pca.f32            mean (d_in), components (k x d_in), explained ratio (k)
//!   pixel_stats.f32    [mean, std] or mean (h x w) followed by std (h x w)
//! ```

use std::path::{Path, PathBuf};

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::ModelConfig;
use crate::engine::memory_bank::{MemoryBank, PcaBasis};
use crate::engine::scorer::UpsampleMode;
use crate::engine::stats::PixelStatistics;
use crate::error::{EngineError, Result};

pub const MANIFEST_FILE: &str = "manifest.json";
pub const BANK_FILE: &str = "memory_bank.f32";
pub const PCA_FILE: &str = "pca.f32";
pub const STATS_FILE: &str = "pixel_stats.f32";

pub const FORMAT_VERSION: u32 = 1;

/// How the memory bank blob is stored when a PCA basis exists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SaveFormat {
    /// Already projected through the basis
    #[default]
    Compressed,
    /// Raw backbone embeddings, projected at load
    Raw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StatsLayout {
    Scalar,
    PerPixel { rows: usize, cols: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PcaManifest {
    /// Number of retained components
    pub components: usize,
    pub variance_threshold: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactManifest {
    pub format_version: u32,
    /// Raw backbone embedding dimensionality
    pub feature_dim: usize,
    /// Patch grid as (rows, cols)
    pub grid: (usize, usize),
    /// Input size as (width, height)
    pub image_size: (u32, u32),
    pub bank_len: usize,
    /// Dimensionality of the rows in `memory_bank.f32`
    pub bank_dim: usize,
    #[serde(default)]
    pub save_format: SaveFormat,
    pub pca: Option<PcaManifest>,
    pub pixel_stats: StatsLayout,
    #[serde(default)]
    pub upsample: UpsampleMode,
}

/// Loaded, cross-validated artifacts of one model.
#[derive(Debug, Clone)]
pub struct ModelArtifacts {
    pub manifest: ArtifactManifest,
    pub bank: MemoryBank,
    pub stats: PixelStatistics,
}

impl ModelArtifacts {
    /// Check the artifacts were produced for these settings.
    pub fn validate_against(&self, config: &ModelConfig) -> Result<()> {
        let manifest = &self.manifest;
        if manifest.image_size != config.image_size {
            return Err(EngineError::ConfigMismatch(format!(
                "artifacts were built for {:?} inputs, settings use {:?}",
                manifest.image_size, config.image_size
            )));
        }
        if manifest.upsample != config.upsample {
            return Err(EngineError::ConfigMismatch(format!(
                "pixel statistics were fit with {:?} upsampling, settings use {:?}",
                manifest.upsample, config.upsample
            )));
        }

        let (width, height) = config.image_size;
        self.stats.check_shape((height as usize, width as usize))?;

        let stored_variance = manifest.pca.as_ref().map(|p| p.variance_threshold);
        if stored_variance != config.pca_variance {
            debug!(
                "PCA variance differs (artifacts {:?}, settings {:?}); using the stored basis",
                stored_variance, config.pca_variance
            );
        }
        Ok(())
    }
}

/// What a training run hands over for persistence.
#[derive(Debug, Clone)]
pub struct TrainingOutput {
    /// Raw backbone embeddings of known-good patches
    pub embeddings: Array2<f32>,
    pub pca_variance: Option<f32>,
    pub stats: PixelStatistics,
    pub grid: (usize, usize),
    pub image_size: (u32, u32),
    pub upsample: UpsampleMode,
    pub save_format: SaveFormat,
}

/// Reads and writes the artifact directory of one model.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn load(&self) -> Result<ModelArtifacts> {
        let manifest = self.read_manifest()?;
        if manifest.format_version != FORMAT_VERSION {
            return Err(EngineError::InvalidArtifact(format!(
                "unsupported artifact format {} (expected {})",
                manifest.format_version, FORMAT_VERSION
            )));
        }

        let pca = match &manifest.pca {
            Some(meta) => Some(self.read_pca(&manifest, meta)?),
            None => None,
        };
        let bank = self.read_bank(&manifest, pca)?;
        let stats = self.read_stats(&manifest)?;

        info!(
            "Loaded artifacts from {:?}: bank {} x {}, grid {:?}, {:?} stats",
            self.dir,
            bank.len(),
            bank.dim(),
            manifest.grid,
            manifest.pixel_stats
        );

        Ok(ModelArtifacts {
            manifest,
            bank,
            stats,
        })
    }

    /// Persist a training run. Returns the written manifest.
    pub fn write(&self, output: &TrainingOutput) -> Result<ArtifactManifest> {
        let feature_dim = output.embeddings.ncols();
        let bank = MemoryBank::build(output.embeddings.clone(), output.pca_variance)?;

        let pixel_stats = match &output.stats {
            PixelStatistics::Scalar { .. } => StatsLayout::Scalar,
            PixelStatistics::PerPixel { mean, .. } => StatsLayout::PerPixel {
                rows: mean.nrows(),
                cols: mean.ncols(),
            },
        };

        let save_format = if bank.pca().is_some() {
            output.save_format
        } else {
            SaveFormat::Compressed
        };
        let (bank_values, bank_dim): (Vec<f32>, usize) = match save_format {
            SaveFormat::Compressed => (bank.embeddings().iter().copied().collect(), bank.dim()),
            SaveFormat::Raw => (output.embeddings.iter().copied().collect(), feature_dim),
        };

        let manifest = ArtifactManifest {
            format_version: FORMAT_VERSION,
            feature_dim,
            grid: output.grid,
            image_size: output.image_size,
            bank_len: bank.len(),
            bank_dim,
            save_format,
            pca: bank.pca().map(|basis| PcaManifest {
                components: basis.output_dim(),
                variance_threshold: basis.variance_threshold(),
            }),
            pixel_stats,
            upsample: output.upsample,
        };

        std::fs::create_dir_all(&self.dir)?;
        write_f32s(&self.dir.join(BANK_FILE), &bank_values)?;

        if let Some(basis) = bank.pca() {
            let mut values: Vec<f32> = basis.mean().to_vec();
            values.extend(basis.components().iter().copied());
            values.extend(basis.explained_variance_ratio().iter().copied());
            write_f32s(&self.dir.join(PCA_FILE), &values)?;
        }

        let stats_values: Vec<f32> = match &output.stats {
            PixelStatistics::Scalar { mean, std } => vec![*mean, *std],
            PixelStatistics::PerPixel { mean, std } => {
                mean.iter().chain(std.iter()).copied().collect()
            }
        };
        write_f32s(&self.dir.join(STATS_FILE), &stats_values)?;

        let json = serde_json::to_vec_pretty(&manifest)?;
        std::fs::write(self.dir.join(MANIFEST_FILE), json)?;

        info!(
            "Wrote artifacts to {:?} ({:?}, bank {} x {})",
            self.dir, save_format, manifest.bank_len, bank_dim
        );
        Ok(manifest)
    }

    fn read_manifest(&self) -> Result<ArtifactManifest> {
        let path = self.dir.join(MANIFEST_FILE);
        let bytes = read_required(&path)?;
        serde_json::from_slice(&bytes)
            .map_err(|e| EngineError::InvalidArtifact(format!("{}: {}", MANIFEST_FILE, e)))
    }

    fn read_pca(&self, manifest: &ArtifactManifest, meta: &PcaManifest) -> Result<PcaBasis> {
        let (d, k) = (manifest.feature_dim, meta.components);
        let values = read_f32s(&self.dir.join(PCA_FILE))?;
        expect_len(PCA_FILE, values.len(), d + k * d + k)?;

        let mean = Array1::from(values[..d].to_vec());
        let components = to_matrix(PCA_FILE, values[d..d + k * d].to_vec(), (k, d))?;
        let explained = Array1::from(values[d + k * d..].to_vec());

        PcaBasis::new(mean, components, explained, meta.variance_threshold)
    }

    fn read_bank(&self, manifest: &ArtifactManifest, pca: Option<PcaBasis>) -> Result<MemoryBank> {
        let expected_dim = match (&pca, manifest.save_format) {
            (Some(basis), SaveFormat::Compressed) => basis.output_dim(),
            _ => manifest.feature_dim,
        };
        if manifest.bank_dim != expected_dim {
            return Err(EngineError::ConfigMismatch(format!(
                "bank rows have {} dims, {:?} format expects {}",
                manifest.bank_dim, manifest.save_format, expected_dim
            )));
        }

        let values = read_f32s(&self.dir.join(BANK_FILE))?;
        expect_len(BANK_FILE, values.len(), manifest.bank_len * manifest.bank_dim)?;
        let embeddings = to_matrix(BANK_FILE, values, (manifest.bank_len, manifest.bank_dim))?;

        match (pca, manifest.save_format) {
            (Some(basis), SaveFormat::Raw) => {
                debug!("Projecting raw bank through the stored basis");
                MemoryBank::from_raw(embeddings, Some(basis))
            }
            (pca, _) => MemoryBank::new(embeddings, pca),
        }
    }

    fn read_stats(&self, manifest: &ArtifactManifest) -> Result<PixelStatistics> {
        let values = read_f32s(&self.dir.join(STATS_FILE))?;
        match manifest.pixel_stats {
            StatsLayout::Scalar => {
                expect_len(STATS_FILE, values.len(), 2)?;
                PixelStatistics::scalar(values[0], values[1])
            }
            StatsLayout::PerPixel { rows, cols } => {
                let (width, height) = manifest.image_size;
                if (rows, cols) != (height as usize, width as usize) {
                    return Err(EngineError::ConfigMismatch(format!(
                        "pixel statistics cover {}x{}, image size is {}x{}",
                        rows, cols, height, width
                    )));
                }
                let plane = rows * cols;
                expect_len(STATS_FILE, values.len(), 2 * plane)?;
                let mean = to_matrix(STATS_FILE, values[..plane].to_vec(), (rows, cols))?;
                let std = to_matrix(STATS_FILE, values[plane..].to_vec(), (rows, cols))?;
                PixelStatistics::per_pixel(mean, std)
            }
        }
    }
}

/// Read a little-endian `f32` blob
pub fn read_f32s(path: &Path) -> Result<Vec<f32>> {
    let bytes = read_required(path)?;
    if bytes.len() % 4 != 0 {
        return Err(EngineError::InvalidArtifact(format!(
            "{:?} is {} bytes, not a whole number of f32 values",
            path,
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

/// Write values as a little-endian `f32` blob
pub fn write_f32s(path: &Path, values: &[f32]) -> Result<()> {
    let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
    std::fs::write(path, bytes)?;
    Ok(())
}

fn read_required(path: &Path) -> Result<Vec<u8>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!("Missing artifact {:?}", path);
            Err(EngineError::ArtifactMissing {
                path: path.to_path_buf(),
            })
        }
        Err(e) => Err(e.into()),
    }
}

fn expect_len(file: &str, got: usize, expected: usize) -> Result<()> {
    if got != expected {
        return Err(EngineError::InvalidArtifact(format!(
            "{} holds {} values, manifest implies {}",
            file, got, expected
        )));
    }
    Ok(())
}

fn to_matrix(file: &str, values: Vec<f32>, shape: (usize, usize)) -> Result<Array2<f32>> {
    Array2::from_shape_vec(shape, values)
        .map_err(|e| EngineError::InvalidArtifact(format!("{}: {}", file, e)))
}
