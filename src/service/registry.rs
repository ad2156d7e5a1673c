//! Engine registry
//!
//! Owns at most one engine per model name, plus the collaborators engines
//! share: the GPU stream table and the background persister.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use crate::config::{RuntimeConfig, SettingsSource};
use crate::engine::backbone::BackboneLoader;
use crate::engine::device::DeviceTable;
use crate::error::Result;
use crate::storage::ResultSink;

use super::inference::{EngineContext, InferenceEngine};
use super::persister::AsyncPersister;
use super::types::EngineStatus;

pub struct EngineRegistry {
    runtime: RuntimeConfig,
    settings: Arc<dyn SettingsSource>,
    loader: Arc<dyn BackboneLoader>,
    devices: Arc<DeviceTable>,
    persister: Option<Arc<AsyncPersister>>,
    engines: Mutex<HashMap<String, Arc<InferenceEngine>>>,
}

impl EngineRegistry {
    /// Registry without result persistence
    pub fn new(
        runtime: RuntimeConfig,
        settings: Arc<dyn SettingsSource>,
        loader: Arc<dyn BackboneLoader>,
    ) -> Self {
        Self {
            runtime,
            settings,
            loader,
            devices: Arc::new(DeviceTable::new()),
            persister: None,
            engines: Mutex::new(HashMap::new()),
        }
    }

    /// Persist NG images and result logs through `sink`.
    ///
    /// Must be called inside a tokio runtime.
    pub fn with_sink(mut self, sink: Arc<dyn ResultSink>) -> Result<Self> {
        let persister = AsyncPersister::spawn(
            sink,
            self.runtime.persist_workers,
            self.runtime.persist_queue,
        )?;
        self.persister = Some(Arc::new(persister));
        Ok(self)
    }

    pub fn runtime(&self) -> &RuntimeConfig {
        &self.runtime
    }

    pub fn persister(&self) -> Option<&Arc<AsyncPersister>> {
        self.persister.as_ref()
    }

    /// The engine for `model`, created uninitialized if absent.
    pub fn get_or_create(&self, model: &str) -> Arc<InferenceEngine> {
        let mut engines = self.engines.lock();
        engines
            .entry(model.to_string())
            .or_insert_with(|| {
                info!("Creating engine for '{}'", model);
                Arc::new(InferenceEngine::new(
                    model,
                    EngineContext {
                        models_dir: self.runtime.models_dir.clone(),
                        settings: self.settings.clone(),
                        loader: self.loader.clone(),
                        devices: self.devices.clone(),
                        persister: self.persister.clone(),
                    },
                ))
            })
            .clone()
    }

    /// The engine for `model`, initialized if it is not ready yet.
    ///
    /// Blocks while artifacts and the backbone load.
    pub fn load(&self, model: &str) -> Result<Arc<InferenceEngine>> {
        let engine = self.get_or_create(model);
        if engine.status().status != EngineStatus::Ready {
            engine.init()?;
        }
        Ok(engine)
    }

    pub fn get(&self, model: &str) -> Option<Arc<InferenceEngine>> {
        self.engines.lock().get(model).cloned()
    }

    /// Registered model names, sorted
    pub fn models(&self) -> Vec<String> {
        let mut names: Vec<String> = self.engines.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Retire and forget an engine. Returns whether it existed.
    ///
    /// Callers still holding the removed engine cannot load it again, so a
    /// later `get_or_create` stays the only live engine for `model`.
    pub fn remove(&self, model: &str) -> bool {
        let engine = self.engines.lock().remove(model);
        match engine {
            Some(engine) => {
                engine.retire();
                true
            }
            None => false,
        }
    }

    /// Shut down every engine, then drain pending persistence.
    pub async fn shutdown(&self) {
        let engines: Vec<Arc<InferenceEngine>> =
            self.engines.lock().drain().map(|(_, engine)| engine).collect();
        for engine in &engines {
            engine.retire();
        }
        if let Some(persister) = &self.persister {
            persister.shutdown().await;
        }
        info!("Registry shut down ({} engines)", engines.len());
    }
}
