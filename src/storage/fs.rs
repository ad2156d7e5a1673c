//! Filesystem result sink
//!
//! Layout under the execute directory:
//!
//! ```text
//! {execute_dir}/{model}/NG/{YYYYMMDD}/{HHMM}/{stem}_original.png
//! {execute_dir}/{model}/NG/{YYYYMMDD}/{HHMM}/{stem}_overlay.png
//! {execute_dir}/{model}/log/inference_{YYYYMMDD}.log
//! {execute_dir}/{model}/log/NG.log
//! ```

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Local};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::{EngineError, Result};

use super::traits::{LogEntry, NgRecord, ResultSink};

pub struct FsSink {
    root: PathBuf,
}

impl FsSink {
    pub fn new(execute_dir: impl Into<PathBuf>) -> Self {
        Self {
            root: execute_dir.into(),
        }
    }

    /// Directory holding the NG images written at `timestamp`
    pub fn ng_dir(&self, model: &str, timestamp: &DateTime<Local>) -> PathBuf {
        self.root
            .join(model)
            .join("NG")
            .join(timestamp.format("%Y%m%d").to_string())
            .join(timestamp.format("%H%M").to_string())
    }

    pub fn log_dir(&self, model: &str) -> PathBuf {
        self.root.join(model).join("log")
    }

    /// Daily result log
    pub fn log_path(&self, model: &str, timestamp: &DateTime<Local>) -> PathBuf {
        self.log_dir(model)
            .join(format!("inference_{}.log", timestamp.format("%Y%m%d")))
    }
}

async fn append_line(path: &Path, line: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|e| EngineError::Persistence(format!("open {:?}: {}", path, e)))?;

    let mut buffer = Vec::with_capacity(line.len() + 1);
    buffer.extend_from_slice(line.as_bytes());
    buffer.push(b'\n');
    file.write_all(&buffer)
        .await
        .map_err(|e| EngineError::Persistence(format!("write {:?}: {}", path, e)))?;
    // tokio hands the write to a blocking task; wait for it to land
    file.flush()
        .await
        .map_err(|e| EngineError::Persistence(format!("flush {:?}: {}", path, e)))?;
    Ok(())
}

#[async_trait]
impl ResultSink for FsSink {
    async fn save_ng_images(&self, record: &NgRecord) -> Result<()> {
        let dir = self.ng_dir(&record.model, &record.timestamp);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| EngineError::Persistence(format!("create {:?}: {}", dir, e)))?;

        let files = [
            (format!("{}_original.png", record.stem), &record.original_png),
            (format!("{}_overlay.png", record.stem), &record.overlay_png),
        ];
        for (name, data) in files {
            let path = dir.join(name);
            fs::write(&path, &data[..])
                .await
                .map_err(|e| EngineError::Persistence(format!("write {:?}: {}", path, e)))?;
        }

        debug!("Saved NG images {} to {:?}", record.stem, dir);
        Ok(())
    }

    async fn append_log(&self, entry: &LogEntry) -> Result<()> {
        let dir = self.log_dir(&entry.model);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| EngineError::Persistence(format!("create {:?}: {}", dir, e)))?;

        append_line(&self.log_path(&entry.model, &entry.timestamp), &entry.line).await?;
        if entry.ng {
            append_line(&dir.join("NG.log"), &entry.line).await?;
        }
        Ok(())
    }
}
