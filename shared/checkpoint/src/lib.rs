#![recursion_limit = "256"]

mod best;
mod experiment;
mod startup;
mod store;


pub use best::BestTracker;
pub use experiment::{allocate_run_index, experiment_dir, experiment_name, run_dir};
pub use startup::{StartMode, Startup, resolve};
pub use store::{
    CheckpointKind, CheckpointPayload, CheckpointStore, Provenance, best_scores_on_disk,
    load_checkpoint,
};

use scribe_core::ConfigError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("checkpoint i/o failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("checkpoint metadata (de)serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("checkpoint tensor file error: {0}")]
    Safetensors(#[from] safetensors::SafeTensorError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("no checkpoint found under {path}")]
    MissingCheckpoint { path: PathBuf },

    #[error("malformed checkpoint {path}: {reason}")]
    Malformed { path: PathBuf, reason: String },
}
