//! PatchCore Anomaly Inspection
//!
//! Loads a model's artifacts and backbone, scores each image given on the
//! command line and prints one JSON result per image.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::json;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use patchcore::config::{Config, ModelConfig, SettingsSource, TomlSettings};
use patchcore::engine::OpenVinoLoader;
use patchcore::service::EngineRegistry;
use patchcore::storage::FsSink;

#[derive(Parser)]
#[command(name = "patchcore")]
#[command(version, about = "PatchCore anomaly inspection - OK/NG judgement against a memory bank")]
struct Args {
    /// Path to the TOML configuration
    #[arg(short, long, default_value = Config::default_path())]
    config: PathBuf,

    /// Model name (defaults to runtime.default_model)
    #[arg(short, long)]
    model: Option<String>,

    /// Images to inspect
    #[arg(required = true)]
    images: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    info!("Starting PatchCore inspection v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let (config, settings): (Config, Arc<dyn SettingsSource>) = match Config::load(&args.config) {
        Ok(config) => (config, Arc::new(TomlSettings::new(&args.config))),
        Err(e) => {
            info!("Using default config ({})", e);
            (Config::default(), Arc::new(ModelConfig::default()))
        }
    };

    let model = args
        .model
        .unwrap_or_else(|| config.runtime.default_model.clone());

    info!("Configuration loaded:");
    info!("  Models dir: {:?}", config.runtime.models_dir);
    info!("  Execute dir: {:?}", config.runtime.execute_dir);
    info!("  Model: {}", model);

    let registry = Arc::new(
        EngineRegistry::new(config.runtime.clone(), settings, Arc::new(OpenVinoLoader::new()))
            .with_sink(Arc::new(FsSink::new(&config.runtime.execute_dir)))?,
    );

    let engine = {
        let registry = registry.clone();
        let model_name = model.clone();
        tokio::task::spawn_blocking(move || registry.load(&model_name))
            .await?
            .with_context(|| format!("Failed to load model '{}'", model))?
    };

    let state = engine.status();
    if let Some(device) = &state.device {
        if let Some(reason) = &device.degraded {
            warn!("Running degraded on {}: {}", device.kind, reason);
        }
    }

    let mut failures = 0usize;
    for path in args.images {
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) => {
                error!("Cannot read {}: {}", path.display(), e);
                failures += 1;
                continue;
            }
        };

        let engine = engine.clone();
        match tokio::task::spawn_blocking(move || engine.predict_bytes(&data)).await? {
            Ok(result) => {
                println!("{}", json!({ "image": path, "result": result }));
            }
            Err(e) => {
                error!("{}: {}", path.display(), e);
                failures += 1;
            }
        }
    }

    registry.shutdown().await;

    if failures > 0 {
        anyhow::bail!("{} image(s) failed", failures);
    }
    info!("Goodbye!");
    Ok(())
}
