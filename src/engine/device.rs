//! Compute device selection
//!
//! Chooses GPU or CPU for the embedding step and keeps the choice for the
//! engine lifetime. GPU work is serialized per physical device through a
//! stream lock shared by every engine placed on that device.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::ModelConfig;
use crate::error::{EngineError, Result};

use super::backbone::Backbone;

/// Physical device kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Cpu,
    Gpu(u32),
}

impl DeviceKind {
    /// Device name as understood by OpenVINO
    pub fn runtime_name(&self) -> String {
        match self {
            DeviceKind::Cpu => "CPU".to_string(),
            DeviceKind::Gpu(id) => format!("GPU.{}", id),
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Cpu => write!(f, "cpu"),
            DeviceKind::Gpu(id) => write!(f, "gpu:{}", id),
        }
    }
}

/// Numeric precision of the embedding step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    Full,
    Mixed,
}

/// Requested placement, taken from the model settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceRequest {
    pub use_gpu: bool,
    pub device_id: u32,
    pub mixed_precision: bool,
    pub allow_cpu_fallback: bool,
}

impl From<&ModelConfig> for DeviceRequest {
    fn from(config: &ModelConfig) -> Self {
        Self {
            use_gpu: config.use_gpu,
            device_id: config.gpu_device_id,
            mixed_precision: config.use_mixed_precision,
            allow_cpu_fallback: config.allow_cpu_fallback,
        }
    }
}

/// Public view of an acquired device
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceInfo {
    pub kind: DeviceKind,
    pub precision: Precision,
    /// Why a requested GPU was replaced by the CPU
    pub degraded: Option<String>,
}

/// Answers whether a GPU can run a model's backbone.
pub trait DeviceProbe: Send + Sync {
    fn probe_gpu(&self, model_dir: &Path, device_id: u32) -> std::result::Result<(), String>;
}

/// One stream lock per physical GPU, shared across engines.
#[derive(Default)]
pub struct DeviceTable {
    streams: Mutex<HashMap<u32, Arc<Mutex<()>>>>,
}

impl DeviceTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn stream(&self, device_id: u32) -> Arc<Mutex<()>> {
        self.streams
            .lock()
            .entry(device_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// An acquired device held for the lifetime of an engine snapshot.
pub struct DeviceContext {
    request: DeviceRequest,
    info: DeviceInfo,
    stream: Option<Arc<Mutex<()>>>,
    released: AtomicBool,
    reclaims: AtomicU64,
}

impl DeviceContext {
    /// Select GPU if requested and usable, else CPU.
    ///
    /// A missing GPU is reported as degraded unless fallback is disabled, in
    /// which case `DeviceUnavailable` is returned.
    pub fn acquire(
        request: DeviceRequest,
        probe: &dyn DeviceProbe,
        model_dir: &Path,
        table: &DeviceTable,
    ) -> Result<Self> {
        if !request.use_gpu {
            info!("Using CPU (GPU disabled by settings)");
            return Ok(Self::on_cpu(request, None));
        }

        match probe.probe_gpu(model_dir, request.device_id) {
            Ok(()) => {
                let precision = if request.mixed_precision {
                    Precision::Mixed
                } else {
                    Precision::Full
                };
                info!("Using GPU.{} ({:?} precision)", request.device_id, precision);
                Ok(Self {
                    request,
                    info: DeviceInfo {
                        kind: DeviceKind::Gpu(request.device_id),
                        precision,
                        degraded: None,
                    },
                    stream: Some(table.stream(request.device_id)),
                    released: AtomicBool::new(false),
                    reclaims: AtomicU64::new(0),
                })
            }
            Err(reason) if request.allow_cpu_fallback => {
                warn!(
                    "GPU.{} unavailable ({}), falling back to CPU",
                    request.device_id, reason
                );
                Ok(Self::on_cpu(request, Some(reason)))
            }
            Err(reason) => Err(EngineError::DeviceUnavailable {
                device_id: request.device_id,
                reason,
            }),
        }
    }

    /// A CPU context with full precision
    pub fn cpu() -> Self {
        Self::on_cpu(
            DeviceRequest {
                use_gpu: false,
                device_id: 0,
                mixed_precision: false,
                allow_cpu_fallback: true,
            },
            None,
        )
    }

    fn on_cpu(request: DeviceRequest, degraded: Option<String>) -> Self {
        if request.mixed_precision {
            debug!("Mixed precision only applies on GPU; CPU runs full precision");
        }
        Self {
            request,
            info: DeviceInfo {
                kind: DeviceKind::Cpu,
                precision: Precision::Full,
                degraded,
            },
            stream: None,
            released: AtomicBool::new(false),
            reclaims: AtomicU64::new(0),
        }
    }

    pub fn request(&self) -> DeviceRequest {
        self.request
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn kind(&self) -> DeviceKind {
        self.info.kind
    }

    pub fn precision(&self) -> Precision {
        self.info.precision
    }

    pub fn is_gpu(&self) -> bool {
        matches!(self.info.kind, DeviceKind::Gpu(_))
    }

    pub fn is_degraded(&self) -> bool {
        self.info.degraded.is_some()
    }

    /// Run device work. Calls on the same GPU queue behind one another.
    pub fn run<T>(&self, f: impl FnOnce() -> T) -> T {
        match &self.stream {
            Some(stream) => {
                let _guard = stream.lock();
                f()
            }
            None => f(),
        }
    }

    /// Return transient device memory after a prediction
    pub fn reclaim(&self, backbone: &dyn Backbone) {
        if self.is_gpu() {
            self.run(|| backbone.reclaim());
            self.reclaims.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn reclaim_count(&self) -> u64 {
        self.reclaims.load(Ordering::Relaxed)
    }

    pub fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            info!("Released device {}", self.info.kind);
        }
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct FixedProbe(std::result::Result<(), String>);

    impl DeviceProbe for FixedProbe {
        fn probe_gpu(&self, _: &Path, _: u32) -> std::result::Result<(), String> {
            self.0.clone()
        }
    }

    fn request(use_gpu: bool, allow_cpu_fallback: bool) -> DeviceRequest {
        DeviceRequest {
            use_gpu,
            device_id: 1,
            mixed_precision: true,
            allow_cpu_fallback,
        }
    }

    #[test]
    fn test_gpu_selected_when_available() {
        let table = DeviceTable::new();
        let ctx = DeviceContext::acquire(
            request(true, true),
            &FixedProbe(Ok(())),
            Path::new("."),
            &table,
        )
        .unwrap();
        assert_eq!(ctx.kind(), DeviceKind::Gpu(1));
        assert_eq!(ctx.precision(), Precision::Mixed);
        assert!(!ctx.is_degraded());
        assert_eq!(ctx.kind().runtime_name(), "GPU.1");
    }

    #[test]
    fn test_fallback_records_degraded() {
        let table = DeviceTable::new();
        let ctx = DeviceContext::acquire(
            request(true, true),
            &FixedProbe(Err("no driver".to_string())),
            Path::new("."),
            &table,
        )
        .unwrap();
        assert_eq!(ctx.kind(), DeviceKind::Cpu);
        assert_eq!(ctx.precision(), Precision::Full);
        assert_eq!(ctx.info().degraded.as_deref(), Some("no driver"));
    }

    #[test]
    fn test_fallback_forbidden() {
        let table = DeviceTable::new();
        let result = DeviceContext::acquire(
            request(true, false),
            &FixedProbe(Err("no driver".to_string())),
            Path::new("."),
            &table,
        );
        assert!(matches!(
            result,
            Err(EngineError::DeviceUnavailable { device_id: 1, .. })
        ));
    }

    #[test]
    fn test_cpu_when_gpu_disabled() {
        let table = DeviceTable::new();
        let ctx = DeviceContext::acquire(
            request(false, false),
            &FixedProbe(Err("unused".to_string())),
            Path::new("."),
            &table,
        )
        .unwrap();
        assert_eq!(ctx.kind(), DeviceKind::Cpu);
        assert!(!ctx.is_degraded());
    }

    #[test]
    fn test_gpu_runs_are_serialized() {
        let table = Arc::new(DeviceTable::new());
        let probe = FixedProbe(Ok(()));
        let a = Arc::new(
            DeviceContext::acquire(request(true, true), &probe, Path::new("."), &table).unwrap(),
        );
        // A second engine on the same GPU shares the stream
        let b = Arc::new(
            DeviceContext::acquire(request(true, true), &probe, Path::new("."), &table).unwrap(),
        );

        let active = Arc::new(AtomicUsize::new(0));
        let overlap = Arc::new(AtomicBool::new(false));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let ctx = if i % 2 == 0 { a.clone() } else { b.clone() };
                let active = active.clone();
                let overlap = overlap.clone();
                std::thread::spawn(move || {
                    ctx.run(|| {
                        if active.fetch_add(1, Ordering::SeqCst) > 0 {
                            overlap.store(true, Ordering::SeqCst);
                        }
                        std::thread::sleep(Duration::from_millis(5));
                        active.fetch_sub(1, Ordering::SeqCst);
                    })
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(!overlap.load(Ordering::SeqCst));
    }

    #[test]
    fn test_release_is_idempotent() {
        let ctx = DeviceContext::cpu();
        ctx.release();
        ctx.release();
        assert!(ctx.is_released());
    }
}
