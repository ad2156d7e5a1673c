//! Inference engine
//!
//! One engine serves one model. Loaded artifacts, backbone and device form an
//! immutable snapshot shared through `Arc`: a prediction clones the current
//! snapshot when it starts and finishes on it even if a reload swaps in a new
//! one meanwhile.
//!
//! ```text
//! uninitialized --init--> loading --> ready --reload--> loading --> ready
//!                            |                             |
//!                            +--> error          (failure keeps old snapshot)
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Local;
use image::{DynamicImage, RgbImage};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::{ModelConfig, SettingsSource};
use crate::engine::backbone::{Backbone, BackboneLoader};
use crate::engine::device::{DeviceContext, DeviceRequest, DeviceTable};
use crate::engine::preprocess::{decode_image, prepare_input};
use crate::engine::scorer::{AnomalyScorer, Label, Thresholds};
use crate::error::{EngineError, Result};
use crate::storage::{LogEntry, ModelArtifacts, NgRecord, ArtifactStore};
use crate::utils::image::{encode_png, heatmap_overlay};

use super::cache::{CacheEntry, ResultCache};
use super::persister::{AsyncPersister, PersistJob};
use super::types::*;

/// Collaborators an engine is built with.
#[derive(Clone)]
pub struct EngineContext {
    /// Root holding one artifact directory per model
    pub models_dir: PathBuf,
    pub settings: Arc<dyn SettingsSource>,
    pub loader: Arc<dyn BackboneLoader>,
    pub devices: Arc<DeviceTable>,
    pub persister: Option<Arc<AsyncPersister>>,
}

/// Everything one prediction reads, swapped as a whole on reload
struct Snapshot {
    generation: u64,
    config: ModelConfig,
    artifacts: ModelArtifacts,
    scorer: AnomalyScorer,
    backbone: Arc<dyn Backbone>,
    device: Arc<DeviceContext>,
}

impl Snapshot {
    fn info(&self) -> SnapshotInfo {
        SnapshotInfo {
            generation: self.generation,
            bank_generation: self.generation,
            stats_generation: self.generation,
            bank_len: self.artifacts.bank.len(),
            stats_mean: self.artifacts.stats.mean_level(),
        }
    }

    fn score(&self, input: &RgbImage) -> Result<crate::engine::ScoreOutcome> {
        let outcome = self.scorer.score(
            input,
            self.backbone.as_ref(),
            &self.device,
            &self.artifacts.bank,
            &self.artifacts.stats,
        );
        self.device.reclaim(self.backbone.as_ref());
        outcome
    }
}

struct State {
    status: EngineStatus,
    last_error: Option<String>,
    snapshot: Option<Arc<Snapshot>>,
}

/// Result line written to the model logs
#[derive(Serialize)]
struct ResultLogLine<'a> {
    timestamp: String,
    model: &'a str,
    #[serde(flatten)]
    result: &'a PredictionResult,
}

pub struct InferenceEngine {
    model_name: String,
    ctx: EngineContext,
    state: RwLock<State>,
    cache: ResultCache,
    generation: AtomicU64,
    /// Serializes init, reload and shutdown
    lifecycle: Mutex<()>,
    /// Set once the registry dropped this engine; it never loads again
    retired: AtomicBool,
}

impl InferenceEngine {
    /// Create an uninitialized engine. Nothing is loaded until `init`.
    pub fn new(model_name: impl Into<String>, ctx: EngineContext) -> Self {
        Self {
            model_name: model_name.into(),
            ctx,
            state: RwLock::new(State {
                status: EngineStatus::Uninitialized,
                last_error: None,
                snapshot: None,
            }),
            cache: ResultCache::new(ModelConfig::default().max_cache_images),
            generation: AtomicU64::new(0),
            lifecycle: Mutex::new(()),
            retired: AtomicBool::new(false),
        }
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn status(&self) -> EngineState {
        let state = self.state.read();
        EngineState {
            model_name: self.model_name.clone(),
            status: state.status,
            device: state.snapshot.as_ref().map(|s| s.device.info().clone()),
            last_error: state.last_error.clone(),
            snapshot: state.snapshot.as_ref().map(|s| s.info()),
            cached_images: self.cache.len(),
        }
    }

    /// Load artifacts, backbone and device. No-op when already ready.
    pub fn init(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock();
        self.ensure_live()?;
        {
            let mut state = self.state.write();
            if state.status == EngineStatus::Ready {
                return Ok(());
            }
            state.status = EngineStatus::Loading;
            state.last_error = None;
        }

        info!("Initializing engine '{}'", self.model_name);
        match self.build_snapshot(None) {
            Ok(snapshot) => {
                self.install(snapshot);
                Ok(())
            }
            Err(e) => {
                error!("Engine '{}' failed to initialize: {}", self.model_name, e);
                let mut state = self.state.write();
                state.status = EngineStatus::Error;
                state.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// Replace the snapshot with freshly loaded settings and artifacts.
    ///
    /// New predictions are rejected until the swap; in-flight ones finish on
    /// the old snapshot. On failure the old snapshot stays in service.
    pub fn reload(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock();
        self.ensure_live()?;
        let previous = {
            let mut state = self.state.write();
            match state.status {
                EngineStatus::Ready | EngineStatus::Error => {}
                status => return Err(self.not_ready(status)),
            }
            state.status = EngineStatus::Loading;
            state.snapshot.clone()
        };

        info!("Reloading engine '{}'", self.model_name);
        match self.build_snapshot(previous.as_deref()) {
            Ok(snapshot) => {
                self.install(snapshot);
                Ok(())
            }
            Err(e) => {
                let mut state = self.state.write();
                state.status = if state.snapshot.is_some() {
                    warn!(
                        "Reload of '{}' failed, keeping previous snapshot: {}",
                        self.model_name, e
                    );
                    EngineStatus::Ready
                } else {
                    error!("Reload of '{}' failed: {}", self.model_name, e);
                    EngineStatus::Error
                };
                state.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// Drop the snapshot and cached images and release the device.
    pub fn shutdown(&self) {
        let _lifecycle = self.lifecycle.lock();
        self.shutdown_locked();
    }

    /// Shut down for good. Later `init` and `reload` calls are rejected.
    pub fn retire(&self) {
        let _lifecycle = self.lifecycle.lock();
        self.retired.store(true, Ordering::SeqCst);
        self.shutdown_locked();
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    fn shutdown_locked(&self) {
        let previous = {
            let mut state = self.state.write();
            state.status = EngineStatus::Uninitialized;
            state.last_error = None;
            state.snapshot.take()
        };
        self.cache.clear();

        if let Some(snapshot) = previous {
            snapshot.device.release();
            info!(
                "Engine '{}' shut down (generation {})",
                self.model_name, snapshot.generation
            );
        }
    }

    /// Score one image.
    pub fn predict(&self, image: &DynamicImage) -> Result<PredictionResult> {
        self.predict_on_snapshot(image).inspect_err(|e| {
            if e.is_local() {
                debug!("{} rejected input: {}", self.model_name, e);
            } else {
                warn!("{} prediction failed: {}", self.model_name, e);
            }
        })
    }

    fn predict_on_snapshot(&self, image: &DynamicImage) -> Result<PredictionResult> {
        let snapshot = self.ready_snapshot()?;
        let start = Instant::now();

        let input = prepare_input(image, &snapshot.config)?;
        let outcome = snapshot.score(&input)?;
        let overlay = heatmap_overlay(&input, &outcome.z_map);

        let original_png: Arc<[u8]> = encode_png(&DynamicImage::ImageRgb8(image.to_rgb8()))?.into();
        let overlay_png: Arc<[u8]> = encode_png(&DynamicImage::ImageRgb8(overlay))?.into();
        let (stem, image_id) =
            self.cache
                .put_result(outcome.label, original_png.clone(), overlay_png.clone());

        let result = PredictionResult {
            label: outcome.label,
            process_time: start.elapsed().as_secs_f64(),
            z_stats: outcome.stats,
            thresholds: *snapshot.scorer.thresholds(),
            image_id,
        };

        debug!(
            "{} predicted {} (max {:.3}, area {}) in {:.3}s",
            self.model_name,
            result.label,
            result.z_stats.maxval,
            result.z_stats.area,
            result.process_time
        );

        self.persist(&snapshot.config, &stem, &result, original_png, overlay_png);
        Ok(result)
    }

    /// Decode an encoded image (honoring EXIF orientation) and score it.
    pub fn predict_bytes(&self, data: &[u8]) -> Result<PredictionResult> {
        self.ensure_ready()?;
        let image = decode_image(data)?;
        self.predict(&image)
    }

    pub fn get_cached_image(&self, id: &str) -> Result<Arc<CacheEntry>> {
        self.ensure_ready()?;
        self.cache.get(id)
    }

    pub fn list_cached_images(&self, filter: &ListFilter) -> Result<Vec<String>> {
        self.ensure_ready()?;
        Ok(self.cache.list(filter))
    }

    pub fn clear_cache(&self) -> Result<()> {
        self.ensure_ready()?;
        self.cache.clear();
        Ok(())
    }

    fn build_snapshot(&self, previous: Option<&Snapshot>) -> Result<Snapshot> {
        let config = self.ctx.settings.resolve(&self.model_name)?;
        let model_dir = self.ctx.models_dir.join(&self.model_name);

        let artifacts = ArtifactStore::new(&model_dir).load()?;
        artifacts.validate_against(&config)?;

        let request = DeviceRequest::from(&config);
        let device = match previous {
            Some(prev) if prev.device.request() == request && !prev.device.is_released() => {
                debug!("Keeping device {} for '{}'", prev.device.kind(), self.model_name);
                prev.device.clone()
            }
            _ => Arc::new(DeviceContext::acquire(
                request,
                self.ctx.loader.probe(),
                &model_dir,
                &self.ctx.devices,
            )?),
        };

        let backbone = self.ctx.loader.load(&model_dir, &device)?;
        let scorer = AnomalyScorer::new(
            Thresholds::from(&config),
            config.image_size,
            artifacts.manifest.grid,
            config.upsample,
        );

        let mut snapshot = Snapshot {
            generation: 0,
            config,
            artifacts,
            scorer,
            backbone,
            device,
        };
        self.warmup(&snapshot)?;
        snapshot.generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(snapshot)
    }

    /// One throwaway prediction on a black image.
    ///
    /// A backbone whose patch grid or embedding width disagrees with the
    /// artifacts is `ConfigMismatch`. A backbone that fails to run only warns.
    fn warmup(&self, snapshot: &Snapshot) -> Result<()> {
        let (width, height) = snapshot.config.image_size;
        let image = RgbImage::new(width, height);
        let start = Instant::now();

        let embedded = snapshot
            .device
            .run(|| snapshot.backbone.embed(&image, &snapshot.device));
        snapshot.device.reclaim(snapshot.backbone.as_ref());
        let grid = match embedded {
            Ok(grid) => grid,
            Err(e) => {
                warn!("Warmup of '{}' failed: {}", self.model_name, e);
                return Ok(());
            }
        };

        let manifest = &snapshot.artifacts.manifest;
        let bank = &snapshot.artifacts.bank;
        if grid.dim() != bank.query_dim() {
            return Err(EngineError::ConfigMismatch(format!(
                "backbone emits {}-dim patches, artifacts expect {}",
                grid.dim(),
                bank.query_dim()
            )));
        }
        if grid.shape() != manifest.grid {
            return Err(EngineError::ConfigMismatch(format!(
                "backbone emits a {:?} patch grid, artifacts expect {:?}",
                grid.shape(),
                manifest.grid
            )));
        }

        let outcome = snapshot
            .scorer
            .score_grid(&grid, bank, &snapshot.artifacts.stats)?;
        debug!(
            "Warmup of '{}' done in {:.3}s ({})",
            self.model_name,
            start.elapsed().as_secs_f64(),
            outcome.label
        );
        Ok(())
    }

    fn install(&self, snapshot: Snapshot) {
        let snapshot = Arc::new(snapshot);
        self.cache.set_capacity(snapshot.config.max_cache_images);

        let previous = {
            let mut state = self.state.write();
            state.status = EngineStatus::Ready;
            state.last_error = None;
            state.snapshot.replace(snapshot.clone())
        };

        if let Some(previous) = previous {
            if !Arc::ptr_eq(&previous.device, &snapshot.device) {
                previous.device.release();
            }
        }

        let device = snapshot.device.info();
        info!(
            "Engine '{}' ready: generation {}, bank {} x {}, device {}{}",
            self.model_name,
            snapshot.generation,
            snapshot.artifacts.bank.len(),
            snapshot.artifacts.bank.dim(),
            device.kind,
            device
                .degraded
                .as_ref()
                .map(|reason| format!(" (degraded: {})", reason))
                .unwrap_or_default()
        );
    }

    fn persist(
        &self,
        config: &ModelConfig,
        stem: &str,
        result: &PredictionResult,
        original_png: Arc<[u8]>,
        overlay_png: Arc<[u8]>,
    ) {
        let Some(persister) = &self.ctx.persister else {
            return;
        };
        let now = Local::now();

        if result.label == Label::NG && config.ng_image_save {
            persister.save(PersistJob::SaveNg(NgRecord {
                model: self.model_name.clone(),
                stem: stem.to_string(),
                original_png,
                overlay_png,
                timestamp: now,
            }));
        }

        if config.log_results {
            let line = ResultLogLine {
                timestamp: now.format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
                model: &self.model_name,
                result,
            };
            match serde_json::to_string(&line) {
                Ok(line) => {
                    persister.save(PersistJob::AppendLog(LogEntry {
                        model: self.model_name.clone(),
                        line,
                        ng: result.is_ng(),
                        timestamp: now,
                    }));
                }
                Err(e) => warn!("Could not serialize result log line: {}", e),
            }
        }
    }

    fn ready_snapshot(&self) -> Result<Arc<Snapshot>> {
        let state = self.state.read();
        match (&state.status, &state.snapshot) {
            (EngineStatus::Ready, Some(snapshot)) => Ok(snapshot.clone()),
            (status, _) => Err(self.not_ready(*status)),
        }
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_retired() {
            return Err(EngineError::EngineNotReady {
                model: self.model_name.clone(),
                status: "retired".to_string(),
            });
        }
        Ok(())
    }

    fn ensure_ready(&self) -> Result<()> {
        self.ready_snapshot().map(|_| ())
    }

    fn not_ready(&self, status: EngineStatus) -> EngineError {
        EngineError::EngineNotReady {
            model: self.model_name.clone(),
            status: status.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::device::DeviceKind;
    use crate::storage::FsSink;
    use crate::testing::*;
    use ndarray::{array, Array2};
    use std::path::Path;
    use std::sync::atomic::AtomicBool;
    use tempfile::tempdir;

    const MODEL: &str = "bottle";

    fn context(
        models_dir: &Path,
        settings: Arc<dyn SettingsSource>,
        loader: Arc<TestLoader>,
    ) -> EngineContext {
        EngineContext {
            models_dir: models_dir.to_path_buf(),
            settings,
            loader,
            devices: Arc::new(DeviceTable::new()),
            persister: None,
        }
    }

    fn ready_engine(models_dir: &Path) -> InferenceEngine {
        write_artifacts(models_dir, MODEL, array![[0.0, 0.0, 0.0]], scalar_stats(0.0, 0.1)).unwrap();
        let engine = InferenceEngine::new(
            MODEL,
            context(models_dir, Arc::new(small_config()), Arc::new(TestLoader::new(4))),
        );
        engine.init().unwrap();
        engine
    }

    fn image(value: u8) -> DynamicImage {
        DynamicImage::ImageRgb8(solid(8, 8, value))
    }

    #[test]
    fn test_predict_ok_and_ng() {
        let dir = tempdir().unwrap();
        let engine = ready_engine(dir.path());

        let ok = engine.predict(&image(0)).unwrap();
        assert_eq!(ok.label, Label::OK);
        assert_eq!(ok.z_stats.maxval, 0.0);
        assert_eq!(ok.thresholds.z_max, 5.0);

        // White patches sit sqrt(3) from the bank, z around 17
        let ng = engine.predict(&image(255)).unwrap();
        assert_eq!(ng.label, Label::NG);
        assert!(ng.z_stats.maxval > 17.0);
        assert!(ng.image_id.original.starts_with("org_NG_"));

        let entry = engine.get_cached_image(&ng.image_id.overlay).unwrap();
        assert_eq!(entry.label, Label::NG);
        assert_eq!(&entry.payload[..4], &[0x89, b'P', b'N', b'G']);
        assert_eq!(engine.status().cached_images, 4);
    }

    #[test]
    fn test_wrong_size_fails_only_that_call() {
        let dir = tempdir().unwrap();
        let engine = ready_engine(dir.path());

        let err = engine
            .predict(&DynamicImage::ImageRgb8(solid(16, 8, 0)))
            .unwrap_err();
        assert!(matches!(err, EngineError::ShapeMismatch { .. }));
        assert_eq!(engine.status().status, EngineStatus::Ready);
        assert!(engine.predict(&image(0)).is_ok());
    }

    #[test]
    fn test_operations_require_ready() {
        let dir = tempdir().unwrap();
        let engine = InferenceEngine::new(
            MODEL,
            context(dir.path(), Arc::new(small_config()), Arc::new(TestLoader::new(4))),
        );
        assert_eq!(engine.status().status, EngineStatus::Uninitialized);
        assert_not_ready(engine.predict(&image(0)));
        assert_not_ready(engine.predict_bytes(&[1, 2, 3]));
        assert_not_ready(engine.list_cached_images(&ListFilter::default()));
        assert_not_ready(engine.get_cached_image("org_x"));
        assert_not_ready(engine.clear_cache());
        assert_not_ready(engine.reload());
    }

    #[test]
    fn test_missing_artifacts_enter_error() {
        let dir = tempdir().unwrap();
        let engine = InferenceEngine::new(
            MODEL,
            context(dir.path(), Arc::new(small_config()), Arc::new(TestLoader::new(4))),
        );
        let err = engine.init().unwrap_err();
        assert!(matches!(err, EngineError::ArtifactMissing { .. }));

        let state = engine.status();
        assert_eq!(state.status, EngineStatus::Error);
        assert!(state.last_error.is_some());
        assert_not_ready(engine.predict(&image(0)));

        // Recover once artifacts appear
        write_artifacts(dir.path(), MODEL, array![[0.0, 0.0, 0.0]], scalar_stats(0.0, 0.1)).unwrap();
        engine.reload().unwrap();
        assert_eq!(engine.status().status, EngineStatus::Ready);
    }

    #[test]
    fn test_predict_while_loading_is_rejected() {
        let dir = tempdir().unwrap();
        write_artifacts(dir.path(), MODEL, array![[0.0, 0.0, 0.0]], scalar_stats(0.0, 0.1)).unwrap();
        let loader = Arc::new(TestLoader::new(4));
        let gate = LoadGate::new();
        *loader.gate.lock() = Some(gate.clone());

        let engine = InferenceEngine::new(
            MODEL,
            context(dir.path(), Arc::new(small_config()), loader.clone()),
        );

        std::thread::scope(|s| {
            let init = s.spawn(|| engine.init());
            gate.entered.wait();

            assert_eq!(engine.status().status, EngineStatus::Loading);
            assert_not_ready(engine.predict(&image(0)));
            assert!(engine.status().snapshot.is_none());

            gate.release.wait();
            init.join().unwrap().unwrap();
        });

        assert_eq!(engine.status().status, EngineStatus::Ready);
        assert_eq!(engine.status().cached_images, 0);
    }

    #[test]
    fn test_backbone_width_checked_at_init() {
        let dir = tempdir().unwrap();
        // Bank of 5-dim embeddings, backbone emits 3
        write_artifacts(dir.path(), MODEL, Array2::zeros((2, 5)), scalar_stats(0.0, 0.1)).unwrap();
        let engine = InferenceEngine::new(
            MODEL,
            context(dir.path(), Arc::new(small_config()), Arc::new(TestLoader::new(4))),
        );

        let err = engine.init().unwrap_err();
        assert!(matches!(err, EngineError::ConfigMismatch(_)), "{:?}", err);
        let state = engine.status();
        assert_eq!(state.status, EngineStatus::Error);
        assert!(state.last_error.unwrap().contains("3-dim"));
        assert!(state.snapshot.is_none());
        assert_not_ready(engine.predict(&image(0)));
    }

    #[test]
    fn test_backbone_grid_checked_at_init() {
        let dir = tempdir().unwrap();
        write_artifacts(dir.path(), MODEL, array![[0.0, 0.0, 0.0]], scalar_stats(0.0, 0.1)).unwrap();
        // 2px cells turn the 8x8 input into a 4x4 grid; artifacts hold 2x2
        let engine = InferenceEngine::new(
            MODEL,
            context(dir.path(), Arc::new(small_config()), Arc::new(TestLoader::new(2))),
        );

        assert!(matches!(engine.init(), Err(EngineError::ConfigMismatch(_))));
        assert_eq!(engine.status().status, EngineStatus::Error);
    }

    #[test]
    fn test_retired_engine_stays_down() {
        let dir = tempdir().unwrap();
        let engine = ready_engine(dir.path());
        engine.retire();

        assert!(engine.is_retired());
        assert_eq!(engine.status().status, EngineStatus::Uninitialized);
        assert_not_ready(engine.init());
        assert_not_ready(engine.reload());
        assert_not_ready(engine.predict(&image(0)));
    }

    #[test]
    fn test_failed_reload_keeps_snapshot() {
        let dir = tempdir().unwrap();
        write_artifacts(dir.path(), MODEL, array![[0.0, 0.0, 0.0]], scalar_stats(0.0, 0.1)).unwrap();
        let settings = Arc::new(SharedSettings::new(small_config()));
        let engine = InferenceEngine::new(
            MODEL,
            context(dir.path(), settings.clone(), Arc::new(TestLoader::new(4))),
        );
        engine.init().unwrap();
        let before = engine.predict(&image(40)).unwrap();

        // Artifacts were built for 8x8
        settings.update(|c| c.image_size = (16, 16));
        let err = engine.reload().unwrap_err();
        assert!(matches!(err, EngineError::ConfigMismatch(_)));

        let state = engine.status();
        assert_eq!(state.status, EngineStatus::Ready);
        assert!(state.last_error.unwrap().contains("Config mismatch"));
        assert_eq!(state.snapshot.unwrap().generation, 1);

        let after = engine.predict(&image(40)).unwrap();
        assert_eq!(before.z_stats, after.z_stats);
    }

    #[test]
    fn test_reload_applies_new_thresholds() {
        let dir = tempdir().unwrap();
        write_artifacts(dir.path(), MODEL, array![[0.0, 0.0, 0.0]], scalar_stats(0.0, 0.1)).unwrap();
        let settings = Arc::new(SharedSettings::new(small_config()));
        let loader = Arc::new(TestLoader::new(4));
        let engine = InferenceEngine::new(
            MODEL,
            context(dir.path(), settings.clone(), loader.clone()),
        );
        engine.init().unwrap();

        // Grey 40/255 patches score z of about 2.7
        assert_eq!(engine.predict(&image(40)).unwrap().label, Label::OK);

        settings.update(|c| c.z_max_threshold = 2.0);
        engine.reload().unwrap();
        let result = engine.predict(&image(40)).unwrap();
        assert_eq!(result.label, Label::NG);
        assert_eq!(result.thresholds.z_max, 2.0);
        assert_eq!(engine.status().snapshot.unwrap().generation, 2);
        assert_eq!(loader.loads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_reload_is_atomic() {
        let dir = tempdir().unwrap();
        let write_a = || {
            write_artifacts(dir.path(), MODEL, array![[0.0, 0.0, 0.0]], scalar_stats(0.0, 0.1))
                .unwrap()
        };
        let write_b = || {
            write_artifacts(
                dir.path(),
                MODEL,
                array![[0.0, 0.0, 0.0], [0.9, 0.9, 0.9]],
                scalar_stats(0.05, 0.1),
            )
            .unwrap()
        };

        write_b();
        let engine = InferenceEngine::new(
            MODEL,
            context(dir.path(), Arc::new(small_config()), Arc::new(TestLoader::new(4))),
        );
        engine.init().unwrap();
        let max_b = engine.predict(&image(40)).unwrap().z_stats.maxval;
        write_a();
        engine.reload().unwrap();
        let max_a = engine.predict(&image(40)).unwrap().z_stats.maxval;
        assert_ne!(max_a, max_b);

        let done = AtomicBool::new(false);
        std::thread::scope(|s| {
            s.spawn(|| {
                for i in 0..20 {
                    if i % 2 == 0 {
                        write_b();
                    } else {
                        write_a();
                    }
                    engine.reload().unwrap();
                }
                done.store(true, Ordering::SeqCst);
            });

            for _ in 0..2 {
                s.spawn(|| {
                    while !done.load(Ordering::SeqCst) {
                        match engine.predict(&image(40)) {
                            Ok(result) => {
                                let max = result.z_stats.maxval;
                                assert!(max == max_a || max == max_b, "mixed snapshot: {}", max);
                            }
                            Err(e) => assert!(matches!(e, EngineError::EngineNotReady { .. })),
                        }
                    }
                });
            }

            s.spawn(|| {
                while !done.load(Ordering::SeqCst) {
                    if let Some(info) = engine.status().snapshot {
                        assert_eq!(info.bank_generation, info.stats_generation);
                        let pair = (info.bank_len, info.stats_mean);
                        assert!(pair == (1, 0.0) || pair == (2, 0.05), "mixed snapshot: {:?}", pair);
                    }
                }
            });
        });
    }

    #[test]
    fn test_concurrent_predictions_are_deterministic() {
        let dir = tempdir().unwrap();
        let engine = ready_engine(dir.path());
        let reference = engine.predict(&image(40)).unwrap().z_stats;

        std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| s.spawn(|| engine.predict(&image(40)).unwrap().z_stats))
                .collect();
            for handle in handles {
                assert_eq!(handle.join().unwrap(), reference);
            }
        });
    }

    #[test]
    fn test_cache_follows_configured_capacity() {
        let dir = tempdir().unwrap();
        write_artifacts(dir.path(), MODEL, array![[0.0, 0.0, 0.0]], scalar_stats(0.0, 0.1)).unwrap();
        let config = ModelConfig {
            max_cache_images: 2,
            ..small_config()
        };
        let engine = InferenceEngine::new(
            MODEL,
            context(dir.path(), Arc::new(config), Arc::new(TestLoader::new(4))),
        );
        engine.init().unwrap();

        let first = engine.predict(&image(0)).unwrap();
        let second = engine.predict(&image(255)).unwrap();
        let ids = engine.list_cached_images(&ListFilter::default()).unwrap();
        assert_eq!(ids, vec![second.image_id.overlay.clone(), second.image_id.original]);
        assert!(matches!(
            engine.get_cached_image(&first.image_id.original),
            Err(EngineError::NotFound(_))
        ));

        engine.clear_cache().unwrap();
        assert!(engine.list_cached_images(&ListFilter::default()).unwrap().is_empty());
    }

    #[test]
    fn test_gpu_fallback_reported() {
        let dir = tempdir().unwrap();
        write_artifacts(dir.path(), MODEL, array![[0.0, 0.0, 0.0]], scalar_stats(0.0, 0.1)).unwrap();
        let config = ModelConfig {
            use_gpu: true,
            ..small_config()
        };
        let engine = InferenceEngine::new(
            MODEL,
            context(dir.path(), Arc::new(config.clone()), Arc::new(TestLoader::new(4))),
        );
        engine.init().unwrap();
        let device = engine.status().device.unwrap();
        assert_eq!(device.kind, DeviceKind::Cpu);
        assert!(device.degraded.is_some());

        let strict = InferenceEngine::new(
            MODEL,
            context(
                dir.path(),
                Arc::new(ModelConfig {
                    allow_cpu_fallback: false,
                    ..config
                }),
                Arc::new(TestLoader::new(4)),
            ),
        );
        assert!(matches!(
            strict.init(),
            Err(EngineError::DeviceUnavailable { .. })
        ));
        assert_eq!(strict.status().status, EngineStatus::Error);
    }

    #[test]
    fn test_reload_keeps_unchanged_device() {
        let dir = tempdir().unwrap();
        write_artifacts(dir.path(), MODEL, array![[0.0, 0.0, 0.0]], scalar_stats(0.0, 0.1)).unwrap();
        let loader = Arc::new(TestLoader {
            gpu_available: true,
            ..TestLoader::new(4)
        });
        let config = ModelConfig {
            use_gpu: true,
            ..small_config()
        };
        let engine = InferenceEngine::new(MODEL, context(dir.path(), Arc::new(config), loader.clone()));
        engine.init().unwrap();
        engine.reload().unwrap();

        assert_eq!(loader.probes.load(Ordering::SeqCst), 1);
        assert_eq!(engine.status().device.unwrap().kind, DeviceKind::Gpu(0));

        // Each GPU prediction hands transient memory back
        let device = engine.state.read().snapshot.as_ref().unwrap().device.clone();
        let before = device.reclaim_count();
        engine.predict(&image(0)).unwrap();
        engine.predict(&image(255)).unwrap();
        assert_eq!(device.reclaim_count(), before + 2);

        engine.shutdown();
        assert_eq!(engine.status().status, EngineStatus::Uninitialized);
        assert!(engine.status().device.is_none());
    }

    #[test]
    fn test_predict_bytes_decodes() {
        let dir = tempdir().unwrap();
        let engine = ready_engine(dir.path());
        let png = encode_png(&image(255)).unwrap();
        assert_eq!(engine.predict_bytes(&png).unwrap().label, Label::NG);
        assert!(matches!(
            engine.predict_bytes(b"not an image"),
            Err(EngineError::Image(_))
        ));
    }

    fn files_with_suffix(root: &Path, suffix: &str) -> Vec<PathBuf> {
        let mut found = Vec::new();
        let Ok(entries) = std::fs::read_dir(root) else {
            return found;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                found.extend(files_with_suffix(&path, suffix));
            } else if path.to_string_lossy().ends_with(suffix) {
                found.push(path);
            }
        }
        found
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_ng_results_persisted() {
        let models = tempdir().unwrap();
        let execute = tempdir().unwrap();
        write_artifacts(models.path(), MODEL, array![[0.0, 0.0, 0.0]], scalar_stats(0.0, 0.1)).unwrap();

        let persister =
            Arc::new(AsyncPersister::spawn(Arc::new(FsSink::new(execute.path())), 2, 32).unwrap());
        let ctx = EngineContext {
            persister: Some(persister.clone()),
            ..context(models.path(), Arc::new(small_config()), Arc::new(TestLoader::new(4)))
        };
        let engine = InferenceEngine::new(MODEL, ctx);
        engine.init().unwrap();

        engine.predict(&image(0)).unwrap();
        let ng = engine.predict(&image(255)).unwrap();
        persister.shutdown().await;

        let ng_root = execute.path().join(MODEL).join("NG");
        let originals = files_with_suffix(&ng_root, "_original.png");
        let overlays = files_with_suffix(&ng_root, "_overlay.png");
        assert_eq!(originals.len(), 1);
        assert_eq!(overlays.len(), 1);
        let stem = ng.image_id.original.trim_start_matches("org_");
        assert!(originals[0].to_string_lossy().contains(stem));

        let logs = files_with_suffix(&execute.path().join(MODEL).join("log"), ".log");
        assert_eq!(logs.len(), 2);
        let ng_log = std::fs::read_to_string(execute.path().join(MODEL).join("log/NG.log")).unwrap();
        let line: serde_json::Value = serde_json::from_str(ng_log.trim()).unwrap();
        assert_eq!(line["label"], "NG");
        assert_eq!(line["model"], MODEL);
    }
}
