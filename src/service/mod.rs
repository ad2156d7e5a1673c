//! Service layer module

pub mod cache;
pub mod inference;
pub mod persister;
pub mod registry;
pub mod types;

pub use cache::{CacheEntry, ResultCache};
pub use inference::{EngineContext, InferenceEngine};
pub use persister::{AsyncPersister, PersistJob, PersisterStats};
pub use registry::EngineRegistry;
pub use types::*;
