//! Anomaly scoring
//!
//! Turns a grid of patch embeddings into a per-pixel z-score map and an
//! OK/NG decision:
//!
//! 1. nearest memory-bank distance for every grid position
//! 2. upsample the distance map to the input resolution
//! 3. normalize with the pixel statistics
//! 4. aggregate and compare against the thresholds

use std::fmt;

use image::RgbImage;
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::config::ModelConfig;
use crate::error::{EngineError, Result};
use crate::utils::math::{mean_std, percentile};

use super::backbone::{Backbone, PatchGrid};
use super::device::DeviceContext;
use super::memory_bank::MemoryBank;
use super::stats::PixelStatistics;

/// Interpolation used to bring grid maps to image resolution.
///
/// Must be the mode used when the pixel statistics were fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpsampleMode {
    #[default]
    Bilinear,
    Nearest,
}

/// Inspection verdict
#[allow(clippy::upper_case_acronyms)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Label {
    OK,
    NG,
}

impl Label {
    pub fn as_str(&self) -> &'static str {
        match self {
            Label::OK => "OK",
            Label::NG => "NG",
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decision thresholds of a model
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    /// Pixels with z above this count toward the anomalous area
    pub z_score: f32,
    /// Anomalous pixel count above which the image is NG
    pub z_area: f32,
    /// Peak z above which the image is NG
    pub z_max: f32,
}

impl From<&ModelConfig> for Thresholds {
    fn from(config: &ModelConfig) -> Self {
        Self {
            z_score: config.z_score_threshold,
            z_area: config.z_area_threshold,
            z_max: config.z_max_threshold,
        }
    }
}

impl Thresholds {
    /// NG when either the peak or the area strictly exceeds its threshold.
    pub fn judge(&self, stats: &ZStats) -> Label {
        if stats.maxval > self.z_max || stats.area > self.z_area {
            Label::NG
        } else {
            Label::OK
        }
    }
}

/// Aggregates of a z-score map
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ZStats {
    /// Number of pixels with z above the score threshold
    pub area: f32,
    pub maxval: f32,
    pub total: f32,
    pub mean: f32,
    pub std: f32,
    pub minval: f32,
    pub percentile_95: f32,
    /// `area` over the pixel count
    pub area_ratio: f32,
}

impl ZStats {
    pub fn from_map(z_map: &Array2<f32>, z_score_threshold: f32) -> Self {
        let mut values: Vec<f32> = z_map.iter().copied().collect();
        let count = values.len().max(1) as f32;

        let area = values.iter().filter(|&&v| v > z_score_threshold).count() as f32;
        let maxval = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let minval = values.iter().copied().fold(f32::INFINITY, f32::min);
        let total = values.iter().map(|&v| v as f64).sum::<f64>() as f32;
        let (mean, std) = mean_std(&values);
        let percentile_95 = percentile(&mut values, 95.0);

        Self {
            area,
            maxval,
            total,
            mean,
            std,
            minval,
            percentile_95,
            area_ratio: area / count,
        }
    }
}

/// Everything derived from one scored image
#[derive(Debug, Clone)]
pub struct ScoreOutcome {
    /// Distances at grid resolution
    pub raw_map: Array2<f32>,
    /// Z-scores at image resolution
    pub z_map: Array2<f32>,
    pub stats: ZStats,
    pub label: Label,
}

/// Scores embedded images against a memory bank.
#[derive(Debug, Clone)]
pub struct AnomalyScorer {
    thresholds: Thresholds,
    /// (rows, cols) of the input image
    image_shape: (usize, usize),
    /// (rows, cols) of the patch grid
    grid_shape: (usize, usize),
    upsample: UpsampleMode,
}

impl AnomalyScorer {
    pub fn new(
        thresholds: Thresholds,
        image_size: (u32, u32),
        grid_shape: (usize, usize),
        upsample: UpsampleMode,
    ) -> Self {
        let (width, height) = image_size;
        Self {
            thresholds,
            image_shape: (height as usize, width as usize),
            grid_shape,
            upsample,
        }
    }

    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    pub fn grid_shape(&self) -> (usize, usize) {
        self.grid_shape
    }

    /// Embed `image` on `device` and score it.
    pub fn score(
        &self,
        image: &RgbImage,
        backbone: &dyn Backbone,
        device: &DeviceContext,
        bank: &MemoryBank,
        stats: &PixelStatistics,
    ) -> Result<ScoreOutcome> {
        let got = (image.height() as usize, image.width() as usize);
        if got != self.image_shape {
            return Err(EngineError::ShapeMismatch {
                expected: self.image_shape,
                got,
            });
        }

        let grid = device.run(|| backbone.embed(image, device))?;
        self.score_grid(&grid, bank, stats)
    }

    /// Score an already embedded grid.
    pub fn score_grid(
        &self,
        grid: &PatchGrid,
        bank: &MemoryBank,
        stats: &PixelStatistics,
    ) -> Result<ScoreOutcome> {
        let raw_map = self.raw_distance_map(grid, bank)?;
        let upsampled = upsample(&raw_map, self.image_shape, self.upsample);
        let z_map = stats.normalize(&upsampled)?;
        let z_stats = ZStats::from_map(&z_map, self.thresholds.z_score);
        let label = self.thresholds.judge(&z_stats);

        Ok(ScoreOutcome {
            raw_map,
            z_map,
            stats: z_stats,
            label,
        })
    }

    /// Nearest bank distance per grid position
    pub fn raw_distance_map(&self, grid: &PatchGrid, bank: &MemoryBank) -> Result<Array2<f32>> {
        if grid.shape() != self.grid_shape {
            return Err(EngineError::ShapeMismatch {
                expected: self.grid_shape,
                got: grid.shape(),
            });
        }

        let distances = bank.nearest_distances(grid.patches())?;
        Array2::from_shape_vec(self.grid_shape, distances)
            .map_err(|e| EngineError::Backbone(e.to_string()))
    }
}

/// Resize a map to `(rows, cols)`.
///
/// Bilinear uses half-pixel centers with edge clamping. Nearest picks
/// `floor(dst * src / dst_size)`.
pub fn upsample(map: &Array2<f32>, shape: (usize, usize), mode: UpsampleMode) -> Array2<f32> {
    let (src_h, src_w) = map.dim();
    let (dst_h, dst_w) = shape;
    if (src_h, src_w) == shape {
        return map.clone();
    }
    if src_h == 0 || src_w == 0 {
        return Array2::zeros(shape);
    }

    let scale_y = src_h as f32 / dst_h as f32;
    let scale_x = src_w as f32 / dst_w as f32;

    match mode {
        UpsampleMode::Nearest => Array2::from_shape_fn(shape, |(y, x)| {
            let sy = ((y as f32 * scale_y) as usize).min(src_h - 1);
            let sx = ((x as f32 * scale_x) as usize).min(src_w - 1);
            map[[sy, sx]]
        }),
        UpsampleMode::Bilinear => {
            let axis = |dst: usize, scale: f32, len: usize| {
                let pos = ((dst as f32 + 0.5) * scale - 0.5).clamp(0.0, (len - 1) as f32);
                let i0 = pos.floor() as usize;
                let i1 = (i0 + 1).min(len - 1);
                (i0, i1, pos - i0 as f32)
            };
            let cols: Vec<(usize, usize, f32)> =
                (0..dst_w).map(|x| axis(x, scale_x, src_w)).collect();

            let mut out = Array2::<f32>::zeros(shape);
            for y in 0..dst_h {
                let (y0, y1, fy) = axis(y, scale_y, src_h);
                for (x, &(x0, x1, fx)) in cols.iter().enumerate() {
                    let top = map[[y0, x0]] * (1.0 - fx) + map[[y0, x1]] * fx;
                    let bottom = map[[y1, x0]] * (1.0 - fx) + map[[y1, x1]] * fx;
                    out[[y, x]] = top * (1.0 - fy) + bottom * fy;
                }
            }
            out
        }
    }
}
