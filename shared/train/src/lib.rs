mod context;
mod curriculum;
mod engine;
mod logs;

pub use context::{Heartbeat, Meters, TrainingContext};
pub use curriculum::{Curriculum, PhaseKind};
pub use engine::{EngineRun, PhaseParams, STAGE_ORDER, Stage};
pub use logs::RunLogs;

use scribe_checkpoint::CheckpointError;
use scribe_cluster::ClusterError;
use scribe_core::ConfigError;
use scribe_criterion::CriterionError;
use scribe_data::DataError;
use scribe_eval::EvalError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrainError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("criterion failed: {0}")]
    Criterion(#[from] CriterionError),

    #[error("data pipeline failed: {0}")]
    Data(#[from] DataError),

    #[error("cluster synchronization failed: {0}")]
    Cluster(#[from] ClusterError),

    #[error("evaluation failed: {0}")]
    Eval(#[from] EvalError),

    #[error("checkpointing failed: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("failed writing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
