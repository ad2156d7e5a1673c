//! Storage abstraction traits
//!
//! Defines where flagged images and result logs end up.
//! The filesystem implementation lives in [`super::fs`].

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Local};

use crate::error::Result;

/// Original and overlay PNGs of an NG prediction
#[derive(Debug, Clone)]
pub struct NgRecord {
    pub model: String,
    /// Shared file stem, unique per prediction
    pub stem: String,
    pub original_png: Arc<[u8]>,
    pub overlay_png: Arc<[u8]>,
    pub timestamp: DateTime<Local>,
}

/// One serialized prediction result
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub model: String,
    /// JSON line without trailing newline
    pub line: String,
    pub ng: bool,
    pub timestamp: DateTime<Local>,
}

/// Result sink trait
/// Implementations must be thread-safe and async-compatible
#[async_trait]
pub trait ResultSink: Send + Sync + 'static {
    /// Persist both images of an NG prediction
    async fn save_ng_images(&self, record: &NgRecord) -> Result<()>;

    /// Append a result line to the model's logs
    async fn append_log(&self, entry: &LogEntry) -> Result<()>;
}
