//! Deterministic fixtures shared by the engine tests

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};

use image::RgbImage;
use ndarray::Array2;
use parking_lot::Mutex;

use crate::config::{ModelConfig, SettingsSource};
use crate::engine::backbone::{Backbone, BackboneLoader, PatchGrid};
use crate::engine::device::{DeviceContext, DeviceProbe};
use crate::engine::scorer::UpsampleMode;
use crate::engine::stats::PixelStatistics;
use crate::error::{EngineError, Result};
use crate::storage::{ArtifactStore, SaveFormat, TrainingOutput};

/// Embeds each `cell x cell` block as its mean RGB in [0, 1].
pub struct GridBackbone {
    pub cell: u32,
}

impl Backbone for GridBackbone {
    fn embed(&self, image: &RgbImage, _device: &DeviceContext) -> Result<PatchGrid> {
        let (width, height) = image.dimensions();
        let rows = (height / self.cell) as usize;
        let cols = (width / self.cell) as usize;
        let area = (self.cell * self.cell) as f32 * 255.0;

        let mut patches = Array2::<f32>::zeros((rows * cols, 3));
        for r in 0..rows {
            for c in 0..cols {
                for y in 0..self.cell {
                    for x in 0..self.cell {
                        let p = image.get_pixel(c as u32 * self.cell + x, r as u32 * self.cell + y);
                        for ch in 0..3 {
                            patches[[r * cols + c, ch]] += p[ch] as f32 / area;
                        }
                    }
                }
            }
        }
        PatchGrid::new(rows, cols, patches)
    }
}

/// Pair of barriers holding a load until the test releases it
#[derive(Clone)]
pub struct LoadGate {
    pub entered: Arc<Barrier>,
    pub release: Arc<Barrier>,
}

impl LoadGate {
    pub fn new() -> Self {
        Self {
            entered: Arc::new(Barrier::new(2)),
            release: Arc::new(Barrier::new(2)),
        }
    }
}

pub struct TestLoader {
    pub cell: u32,
    pub gpu_available: bool,
    pub gate: Mutex<Option<LoadGate>>,
    pub loads: AtomicUsize,
    pub probes: AtomicUsize,
}

impl TestLoader {
    pub fn new(cell: u32) -> Self {
        Self {
            cell,
            gpu_available: false,
            gate: Mutex::new(None),
            loads: AtomicUsize::new(0),
            probes: AtomicUsize::new(0),
        }
    }
}

impl DeviceProbe for TestLoader {
    fn probe_gpu(&self, _model_dir: &Path, _device_id: u32) -> std::result::Result<(), String> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        if self.gpu_available {
            Ok(())
        } else {
            Err("no GPU in test environment".to_string())
        }
    }
}

impl BackboneLoader for TestLoader {
    fn load(&self, _model_dir: &Path, _device: &DeviceContext) -> Result<Arc<dyn Backbone>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            gate.entered.wait();
            gate.release.wait();
        }
        Ok(Arc::new(GridBackbone { cell: self.cell }))
    }

    fn probe(&self) -> &dyn DeviceProbe {
        self
    }
}

/// Settings that tests can edit between reloads
pub struct SharedSettings(pub Mutex<ModelConfig>);

impl SharedSettings {
    pub fn new(config: ModelConfig) -> Self {
        Self(Mutex::new(config))
    }

    pub fn update(&self, f: impl FnOnce(&mut ModelConfig)) {
        f(&mut self.0.lock());
    }
}

impl SettingsSource for SharedSettings {
    fn resolve(&self, _model_name: &str) -> Result<ModelConfig> {
        let config = self.0.lock().clone();
        config.validate()?;
        Ok(config)
    }
}

/// 8x8 input, 2x2 grid of 3-dim patches, thresholds 4.5 / 100 / 5.0
pub fn small_config() -> ModelConfig {
    ModelConfig {
        image_size: (8, 8),
        z_score_threshold: 4.5,
        z_area_threshold: 100.0,
        z_max_threshold: 5.0,
        max_cache_images: 50,
        pca_variance: None,
        upsample: UpsampleMode::Nearest,
        ..ModelConfig::default()
    }
}

/// Write artifacts for `small_config` into `{models_dir}/{model}`.
pub fn write_artifacts(
    models_dir: &Path,
    model: &str,
    bank: Array2<f32>,
    stats: PixelStatistics,
) -> Result<PathBuf> {
    let dir = models_dir.join(model);
    ArtifactStore::new(&dir).write(&TrainingOutput {
        embeddings: bank,
        pca_variance: None,
        stats,
        grid: (2, 2),
        image_size: (8, 8),
        upsample: UpsampleMode::Nearest,
        save_format: SaveFormat::Compressed,
    })?;
    Ok(dir)
}

pub fn scalar_stats(mean: f32, std: f32) -> PixelStatistics {
    match PixelStatistics::scalar(mean, std) {
        Ok(stats) => stats,
        Err(e) => panic!("bad test statistics: {}", e),
    }
}

pub fn solid(width: u32, height: u32, value: u8) -> RgbImage {
    RgbImage::from_pixel(width, height, image::Rgb([value, value, value]))
}

/// Ensure the error is `EngineNotReady`
pub fn assert_not_ready<T: std::fmt::Debug>(result: Result<T>) {
    match result {
        Err(EngineError::EngineNotReady { .. }) => {}
        other => panic!("expected EngineNotReady, got {:?}", other),
    }
}
