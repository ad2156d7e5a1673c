//! Anomaly detection service configuration

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::engine::scorer::UpsampleMode;
use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub models: HashMap<String, ModelConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Root holding one artifact directory per model
    pub models_dir: PathBuf,
    /// Root for NG images and result logs
    pub execute_dir: PathBuf,
    pub default_model: String,
    pub persist_workers: usize,
    pub persist_queue: usize,
}

/// Resolved per-model settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Model input size as (width, height)
    pub image_size: (u32, u32),
    /// Quad (TL, TR, BR, BL) rectified to `image_size` before embedding
    pub affine_points: Option<[[f32; 2]; 4]>,
    pub z_score_threshold: f32,
    pub z_area_threshold: f32,
    pub z_max_threshold: f32,
    pub use_gpu: bool,
    pub gpu_device_id: u32,
    pub use_mixed_precision: bool,
    pub allow_cpu_fallback: bool,
    pub max_cache_images: usize,
    pub ng_image_save: bool,
    pub log_results: bool,
    pub pca_variance: Option<f32>,
    pub upsample: UpsampleMode,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config =
            toml::from_str(&content).map_err(|e| EngineError::InvalidConfig(e.to_string()))?;
        for (name, model) in &config.models {
            model
                .validate()
                .map_err(|e| EngineError::InvalidConfig(format!("[models.{}] {}", name, e)))?;
        }
        Ok(config)
    }

    pub fn default_path() -> &'static str {
        "config.toml"
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            runtime: RuntimeConfig::default(),
            models: HashMap::new(),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            models_dir: PathBuf::from("models"),
            execute_dir: PathBuf::from("execute"),
            default_model: "example_model".to_string(),
            persist_workers: 2,
            persist_queue: 256,
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            image_size: (224, 224),
            affine_points: None,
            z_score_threshold: 4.5,
            z_area_threshold: 100.0,
            z_max_threshold: 10.0,
            use_gpu: false,
            gpu_device_id: 0,
            use_mixed_precision: true,
            allow_cpu_fallback: true,
            max_cache_images: 1200,
            ng_image_save: true,
            log_results: true,
            pca_variance: Some(0.95),
            upsample: UpsampleMode::Bilinear,
        }
    }
}

impl ModelConfig {
    /// Check value ranges. Cross-checks against artifacts happen at load.
    pub fn validate(&self) -> Result<()> {
        let (w, h) = self.image_size;
        if w == 0 || h == 0 {
            return Err(EngineError::InvalidConfig(format!(
                "image_size must be non-zero, got {}x{}",
                w, h
            )));
        }

        let thresholds = [
            ("z_score_threshold", self.z_score_threshold),
            ("z_area_threshold", self.z_area_threshold),
            ("z_max_threshold", self.z_max_threshold),
        ];
        for (name, value) in thresholds {
            if !value.is_finite() {
                return Err(EngineError::InvalidConfig(format!("{} must be finite", name)));
            }
        }

        if self.max_cache_images == 0 {
            return Err(EngineError::InvalidConfig(
                "max_cache_images must be at least 1".to_string(),
            ));
        }

        if let Some(variance) = self.pca_variance {
            if !(variance > 0.0 && variance <= 1.0) {
                return Err(EngineError::InvalidConfig(format!(
                    "pca_variance must be in (0, 1], got {}",
                    variance
                )));
            }
        }

        if let Some(points) = &self.affine_points {
            if points.iter().flatten().any(|v| !v.is_finite()) {
                return Err(EngineError::InvalidConfig(
                    "affine_points must be finite".to_string(),
                ));
            }
        }

        Ok(())
    }
}

/// Resolves the typed settings of a model.
///
/// Called at engine init and again on every reload.
pub trait SettingsSource: Send + Sync {
    fn resolve(&self, model_name: &str) -> Result<ModelConfig>;
}

impl SettingsSource for ModelConfig {
    fn resolve(&self, _model_name: &str) -> Result<ModelConfig> {
        self.validate()?;
        Ok(self.clone())
    }
}

impl SettingsSource for Config {
    fn resolve(&self, model_name: &str) -> Result<ModelConfig> {
        let model = self.models.get(model_name).cloned().ok_or_else(|| {
            EngineError::InvalidConfig(format!("no settings for model '{}'", model_name))
        })?;
        model.validate()?;
        Ok(model)
    }
}

/// TOML file re-read on every resolve, so reloads pick up edited thresholds.
pub struct TomlSettings {
    path: PathBuf,
}

impl TomlSettings {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SettingsSource for TomlSettings {
    fn resolve(&self, model_name: &str) -> Result<ModelConfig> {
        if !self.path.exists() {
            return Err(EngineError::ArtifactMissing {
                path: self.path.clone(),
            });
        }
        Config::load(&self.path)?.resolve(model_name)
    }
}
