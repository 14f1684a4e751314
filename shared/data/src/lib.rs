mod dummy;
mod loader;
mod preprocessed;

pub use dummy::DummyDataset;
pub use loader::{EpochDataStats, Loader};
pub use preprocessed::PreprocessedDataset;

use rand::SeedableRng;
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;
use scribe_core::{ClassId, Matrix};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DataError {
    #[error("sample index {index} out of range ({len} samples)")]
    OutOfRange { index: usize, len: usize },

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed sample file {path}: {reason}")]
    Malformed { path: PathBuf, reason: String },

    #[error("dataset directory {path} contains no samples")]
    Empty { path: PathBuf },
}

/// One training/evaluation utterance as produced by the (external) feature
/// pipeline: feature frames, target label ids, and optionally the reference
/// word sequence for word-level scoring.
#[derive(Debug, Clone)]
pub struct Sample {
    pub input: Matrix,
    pub target: Vec<ClassId>,
    pub words: Option<Vec<String>>,
}

/// Iteration contract the orchestrator requires from any data source.
/// `resample` re-draws whatever stochastic view the source keeps; it is
/// invoked once per epoch unless resampling is disabled.
pub trait Dataset: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get(&self, index: usize) -> Result<Sample, DataError>;

    fn resample(&mut self, _epoch: usize) {}
}

/// Deterministic per-epoch visit order.
pub fn shuffled_order(len: usize, seed: u64, epoch: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..len).collect();
    let mut rng = ChaCha8Rng::seed_from_u64(seed.wrapping_add(0x9e37_79b9 * epoch as u64));
    order.shuffle(&mut rng);
    order
}
