//! Scoring engine module
//!
//! Numeric core of the anomaly detector:
//! - Device selection and per-GPU serialization
//! - Patch embedding through a pluggable backbone
//! - Memory-bank nearest neighbor search with optional PCA
//! - Z-score normalization and OK/NG judgement

pub mod device;
pub mod backbone;
pub mod memory_bank;
pub mod stats;
pub mod scorer;
pub mod preprocess;

pub use device::{DeviceContext, DeviceInfo, DeviceKind, DeviceRequest, DeviceTable, Precision};
pub use backbone::{Backbone, BackboneLoader, OpenVinoLoader, PatchGrid};
pub use memory_bank::{MemoryBank, PcaBasis};
pub use stats::PixelStatistics;
pub use scorer::{AnomalyScorer, Label, ScoreOutcome, Thresholds, UpsampleMode, ZStats};
