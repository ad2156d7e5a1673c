//! Background persistence of inspection results
//!
//! Jobs go onto a bounded queue drained by a fixed set of worker tasks.
//! Submitting never waits: a full queue drops the job with a warning.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{EngineError, Result};
use crate::storage::{LogEntry, NgRecord, ResultSink};

/// A unit of background work
#[derive(Debug, Clone)]
pub enum PersistJob {
    SaveNg(NgRecord),
    AppendLog(LogEntry),
}

impl PersistJob {
    fn describe(&self) -> String {
        match self {
            PersistJob::SaveNg(record) => format!("NG images {}", record.stem),
            PersistJob::AppendLog(entry) => format!("log line for {}", entry.model),
        }
    }
}

#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    dropped: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PersisterStats {
    pub enqueued: u64,
    pub dropped: u64,
    pub completed: u64,
    pub failed: u64,
}

pub struct AsyncPersister {
    sender: Mutex<Option<mpsc::Sender<PersistJob>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    counters: Arc<Counters>,
}

impl AsyncPersister {
    /// Start `workers` tasks on the current tokio runtime.
    pub fn spawn(sink: Arc<dyn ResultSink>, workers: usize, queue: usize) -> Result<Self> {
        let handle = Handle::try_current()
            .map_err(|e| EngineError::Runtime(format!("persister needs a tokio runtime: {}", e)))?;

        let (tx, rx) = mpsc::channel::<PersistJob>(queue.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let counters = Arc::new(Counters::default());
        let workers = workers.max(1);

        let handles = (0..workers)
            .map(|worker_id| {
                let rx = rx.clone();
                let sink = sink.clone();
                let counters = counters.clone();
                handle.spawn(async move {
                    loop {
                        let job = { rx.lock().await.recv().await };
                        let Some(job) = job else { break };

                        let result = match &job {
                            PersistJob::SaveNg(record) => sink.save_ng_images(record).await,
                            PersistJob::AppendLog(entry) => sink.append_log(entry).await,
                        };
                        match result {
                            Ok(()) => {
                                counters.completed.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(e) => {
                                counters.failed.fetch_add(1, Ordering::Relaxed);
                                error!("Persisting {} failed: {}", job.describe(), e);
                            }
                        }
                    }
                    debug!("Persist worker {} stopped", worker_id);
                })
            })
            .collect();

        info!("Persister started: {} workers, queue {}", workers, queue.max(1));

        Ok(Self {
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(handles),
            counters,
        })
    }

    /// Enqueue without waiting. Returns whether the job was accepted.
    pub fn save(&self, job: PersistJob) -> bool {
        let sender = self.sender.lock();
        let Some(tx) = sender.as_ref() else {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            warn!("Persister closed, dropping {}", job.describe());
            return false;
        };

        match tx.try_send(job) {
            Ok(()) => {
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(job)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("Persist queue full, dropping {}", job.describe());
                false
            }
            Err(TrySendError::Closed(job)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("Persist queue closed, dropping {}", job.describe());
                false
            }
        }
    }

    pub fn stats(&self) -> PersisterStats {
        PersisterStats {
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.sender.lock().is_none()
    }

    /// Stop accepting jobs and wait until queued ones are written.
    pub async fn shutdown(&self) {
        let sender = self.sender.lock().take();
        if sender.is_none() {
            return;
        }
        drop(sender);

        let handles = std::mem::take(&mut *self.workers.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                error!("Persist worker panicked: {}", e);
            }
        }

        let stats = self.stats();
        info!(
            "Persister drained: {} written, {} failed, {} dropped",
            stats.completed, stats.failed, stats.dropped
        );
    }
}
