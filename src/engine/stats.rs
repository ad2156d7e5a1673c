//! Per-pixel z-score statistics

use ndarray::{Array2, Zip};

use crate::error::{EngineError, Result};
use crate::utils::math::mean_std;

/// Mean and standard deviation of known-good raw distance maps.
#[derive(Debug, Clone, PartialEq)]
pub enum PixelStatistics {
    Scalar { mean: f32, std: f32 },
    PerPixel { mean: Array2<f32>, std: Array2<f32> },
}

impl PixelStatistics {
    pub fn scalar(mean: f32, std: f32) -> Result<Self> {
        if !mean.is_finite() {
            return Err(EngineError::InvalidArtifact(format!("non-finite mean {}", mean)));
        }
        check_std(std, None)?;
        Ok(PixelStatistics::Scalar { mean, std })
    }

    /// Per-pixel maps indexed `[row, col]`. Shapes must agree.
    pub fn per_pixel(mean: Array2<f32>, std: Array2<f32>) -> Result<Self> {
        if mean.dim() != std.dim() {
            return Err(EngineError::InvalidArtifact(format!(
                "pixel mean {:?} and std {:?} differ in shape",
                mean.dim(),
                std.dim()
            )));
        }
        if let Some(((r, c), v)) = mean.indexed_iter().find(|(_, v)| !v.is_finite()) {
            return Err(EngineError::InvalidArtifact(format!(
                "non-finite pixel mean {} at ({}, {})",
                v, r, c
            )));
        }
        for ((r, c), &s) in std.indexed_iter() {
            check_std(s, Some((r, c)))?;
        }
        Ok(PixelStatistics::PerPixel { mean, std })
    }

    /// Fit per-pixel statistics over upsampled raw maps of known-good images.
    pub fn fit(maps: &[Array2<f32>]) -> Result<Self> {
        let first = maps
            .first()
            .ok_or_else(|| EngineError::InvalidArtifact("no score maps to fit".to_string()))?;
        let shape = first.dim();
        if let Some(bad) = maps.iter().find(|m| m.dim() != shape) {
            return Err(EngineError::ShapeMismatch {
                expected: shape,
                got: bad.dim(),
            });
        }

        let mut mean = Array2::<f32>::zeros(shape);
        let mut std = Array2::<f32>::zeros(shape);
        let mut samples = vec![0.0f32; maps.len()];
        for r in 0..shape.0 {
            for c in 0..shape.1 {
                for (slot, map) in samples.iter_mut().zip(maps) {
                    *slot = map[[r, c]];
                }
                let (m, s) = mean_std(&samples);
                mean[[r, c]] = m;
                std[[r, c]] = s;
            }
        }

        Self::per_pixel(mean, std)
    }

    /// Map shape for per-pixel statistics, `None` for scalar
    pub fn shape(&self) -> Option<(usize, usize)> {
        match self {
            PixelStatistics::Scalar { .. } => None,
            PixelStatistics::PerPixel { mean, .. } => Some(mean.dim()),
        }
    }

    /// Average of the mean values, used to fingerprint a snapshot
    pub fn mean_level(&self) -> f32 {
        match self {
            PixelStatistics::Scalar { mean, .. } => *mean,
            PixelStatistics::PerPixel { mean, .. } => mean.mean().unwrap_or(0.0),
        }
    }

    /// Fails with `ConfigMismatch` when per-pixel maps do not cover `shape`.
    pub fn check_shape(&self, shape: (usize, usize)) -> Result<()> {
        match self.shape() {
            Some(own) if own != shape => Err(EngineError::ConfigMismatch(format!(
                "pixel statistics cover {:?}, scoring produces {:?}",
                own, shape
            ))),
            _ => Ok(()),
        }
    }

    /// `z = (raw - mean) / std` per pixel
    pub fn normalize(&self, raw: &Array2<f32>) -> Result<Array2<f32>> {
        match self {
            PixelStatistics::Scalar { mean, std } => Ok(raw.mapv(|v| (v - mean) / std)),
            PixelStatistics::PerPixel { mean, std } => {
                if raw.dim() != mean.dim() {
                    return Err(EngineError::ShapeMismatch {
                        expected: mean.dim(),
                        got: raw.dim(),
                    });
                }
                let mut z = Array2::<f32>::zeros(raw.dim());
                Zip::from(&mut z)
                    .and(raw)
                    .and(mean)
                    .and(std)
                    .for_each(|z, &v, &m, &s| *z = (v - m) / s);
                Ok(z)
            }
        }
    }
}

fn check_std(std: f32, at: Option<(usize, usize)>) -> Result<()> {
    if std.is_finite() && std > 0.0 {
        return Ok(());
    }
    let location = at.map_or_else(String::new, |(r, c)| format!(" at ({}, {})", r, c));
    Err(EngineError::InvalidArtifact(format!(
        "pixel std must be strictly positive, got {}{}",
        std, location
    )))
}
