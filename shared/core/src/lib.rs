mod config;
mod dictionary;
mod error;
mod matrix;
mod meters;
mod timers;

pub use config::{GradClamp, LossScale, RunConfig};
pub use dictionary::{
    BuiltDictionary, Dictionary, DictionaryBuilder, DictionaryError, LabelRemap, SEPARATOR_TOKEN,
};
pub use error::{ConfigError, ResourceError};
pub use matrix::Matrix;
pub use meters::{EditDistanceMeter, RunningAverage, levenshtein};
pub use timers::{Stopwatch, TimerSet};

/// Integer class id, positional in the dictionary.
pub type ClassId = u32;
