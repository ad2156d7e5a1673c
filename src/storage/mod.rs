//! Storage module for model artifacts and inspection results

pub mod artifacts;
pub mod fs;
pub mod traits;

pub use artifacts::{ArtifactManifest, ArtifactStore, ModelArtifacts, SaveFormat, TrainingOutput};
pub use fs::FsSink;
pub use traits::{LogEntry, NgRecord, ResultSink};
