//! Service layer types

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::engine::{DeviceInfo, Label, Thresholds, ZStats};

/// Ids of the two cached images of a prediction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageIds {
    pub original: String,
    pub overlay: String,
}

/// Inspection result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionResult {
    pub label: Label,
    /// Wall time of the prediction in seconds
    pub process_time: f64,
    pub z_stats: ZStats,
    pub thresholds: Thresholds,
    pub image_id: ImageIds,
}

impl PredictionResult {
    pub fn is_ng(&self) -> bool {
        self.label == Label::NG
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageKind {
    Original,
    Overlay,
}

impl ImageKind {
    /// Id prefix of this kind
    pub fn prefix(&self) -> &'static str {
        match self {
            ImageKind::Original => "org",
            ImageKind::Overlay => "ovr",
        }
    }
}

/// Filter for listing cached image ids
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListFilter {
    /// Keep ids starting with this, e.g. `org_` or `ovr_NG`
    pub prefix: Option<String>,
    pub label: Option<Label>,
    pub limit: usize,
    /// Oldest first instead of newest first
    pub reverse: bool,
}

impl Default for ListFilter {
    fn default() -> Self {
        Self {
            prefix: None,
            label: None,
            limit: 100,
            reverse: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineStatus {
    Uninitialized,
    Loading,
    Ready,
    Error,
}

impl EngineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineStatus::Uninitialized => "uninitialized",
            EngineStatus::Loading => "loading",
            EngineStatus::Ready => "ready",
            EngineStatus::Error => "error",
        }
    }
}

impl fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of the artifact snapshot an engine serves
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnapshotInfo {
    pub generation: u64,
    pub bank_generation: u64,
    pub stats_generation: u64,
    pub bank_len: usize,
    /// Average pixel mean of the loaded statistics
    pub stats_mean: f32,
}

/// Point-in-time view of an engine
#[derive(Debug, Clone, Serialize)]
pub struct EngineState {
    pub model_name: String,
    pub status: EngineStatus,
    pub device: Option<DeviceInfo>,
    pub last_error: Option<String>,
    pub snapshot: Option<SnapshotInfo>,
    pub cached_images: usize,
}
