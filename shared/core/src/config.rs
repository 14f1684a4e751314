use crate::ConfigError;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Per-sample loss rescaling. The selected factor is computed once per
/// sample and handed to every criterion identically, so losses stay
/// comparable when the curriculum switches criteria between phases.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum LossScale {
    #[default]
    None,
    PerInput,
    PerInputSqrt,
    PerTarget,
    PerTargetSqrt,
}

impl LossScale {
    pub fn factor(&self, input_frames: usize, target_len: usize) -> f32 {
        match self {
            LossScale::None => 1.0,
            LossScale::PerInput => 1.0 / input_frames.max(1) as f32,
            LossScale::PerInputSqrt => 1.0 / (input_frames.max(1) as f32).sqrt(),
            LossScale::PerTarget => 1.0 / target_len.max(1) as f32,
            LossScale::PerTargetSqrt => 1.0 / (target_len.max(1) as f32).sqrt(),
        }
    }
}

/// Gradient clamping policy. At most one mode may be active.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GradClamp {
    #[default]
    Off,
    /// Clamp each gradient entry into [-max, max].
    Absolute { max: f32 },
    /// Clamp each entry relative to the current learning rate: [-scale*lr, scale*lr].
    Relative { scale: f32 },
    /// Rescale the whole gradient so its L2 norm does not exceed `max`.
    Norm { max: f32 },
}

impl GradClamp {
    /// Build from the three mutually-exclusive CLI options.
    pub fn from_options(
        absolute: Option<f32>,
        relative: Option<f32>,
        norm: Option<f32>,
    ) -> Result<Self, ConfigError> {
        match (absolute, relative, norm) {
            (None, None, None) => Ok(GradClamp::Off),
            (Some(max), None, None) => Ok(GradClamp::Absolute { max }),
            (None, Some(scale), None) => Ok(GradClamp::Relative { scale }),
            (None, None, Some(max)) => Ok(GradClamp::Norm { max }),
            (Some(_), Some(_), _) => Err(ConfigError::Contradictory {
                first: "clamp-absolute",
                second: "clamp-relative",
            }),
            (Some(_), _, Some(_)) => Err(ConfigError::Contradictory {
                first: "clamp-absolute",
                second: "clamp-norm",
            }),
            (_, Some(_), Some(_)) => Err(ConfigError::Contradictory {
                first: "clamp-relative",
                second: "clamp-norm",
            }),
        }
    }
}

/// Immutable snapshot of one training run's hyperparameters plus derived
/// fields. Created once at process start (fresh CLI args, or the config
/// embedded in a prior checkpoint when resuming/forking) and never mutated:
/// phase-specific overrides are computed into separate phase parameter
/// records by the curriculum controller.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RunConfig {
    // experiment identity
    pub tag: String,
    pub seed: u64,

    // data
    pub data_dir: PathBuf,
    pub train_set: String,
    pub valid_sets: Vec<String>,
    pub test_sets: Vec<String>,
    pub max_input_frames: usize,
    pub max_target_len: usize,
    pub no_resample: bool,
    pub loader_threads: usize,

    // dictionary
    pub tokens_file: PathBuf,
    pub collapse_noise: bool,
    pub phoneme_full: bool,
    pub fold_file: Option<PathBuf>,
    pub fold_targets: bool,
    pub replabel: usize,
    pub ctc: bool,
    pub garbage: bool,

    // criterion
    pub batch_size: usize,
    pub criterion_threads: usize,
    pub seg_given: bool,
    pub shift_window: bool,
    pub state_width: usize,
    pub loss_scale: LossScale,

    // optimization
    pub lr: f64,
    pub lr_transitions: f64,
    pub momentum: f64,
    pub weight_decay: f64,
    pub clamp: GradClamp,

    // curriculum budgets
    pub linseg_epochs: usize,
    pub linseg_lr: Option<f64>,
    pub linseg_zero_net: bool,
    pub linseg_freeze_transitions: bool,
    pub falign_epochs: usize,
    pub falign_lr: Option<f64>,
    pub epochs: usize,

    // evaluation
    pub word_vocab: Option<PathBuf>,
    pub beam_decoder_wer: bool,
    pub train_edit_every: usize,

    // engine
    pub reclaim_every: usize,

    // checkpointing
    pub run_root: PathBuf,
    pub restore_best_scores: bool,

    // distributed
    pub world_size: usize,
    pub rank: usize,
    pub coordinator_addr: Option<String>,

    // derived, filled in by `finalize`
    pub feature_width: usize,
    pub num_classes: usize,
    pub effective_lr: f64,
    pub effective_lr_transitions: f64,
}

impl RunConfig {
    /// Fill in derived fields once the dictionary and feature width are
    /// known. Batched criteria see gradients summed over the batch, so the
    /// step size is divided down to keep updates comparable with the
    /// per-example variants.
    pub fn finalize(mut self, num_classes: usize, feature_width: usize) -> Self {
        self.num_classes = num_classes;
        self.feature_width = feature_width;
        let divisor = self.batch_size.max(1) as f64;
        self.effective_lr = self.lr / divisor;
        self.effective_lr_transitions = self.lr_transitions / divisor;
        self
    }

    /// Setup guards that involve more than one field. Checked before any
    /// phase runs.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size > 0 && self.shift_window {
            return Err(ConfigError::Contradictory {
                first: "batch-size",
                second: "shift-window",
            });
        }
        if self.falign_epochs > 0 && self.seg_given {
            return Err(ConfigError::Contradictory {
                first: "falign-epochs",
                second: "seg-given",
            });
        }
        if self.ctc && self.garbage {
            return Err(ConfigError::Contradictory {
                first: "ctc",
                second: "garbage",
            });
        }
        if self.world_size == 0 {
            return Err(ConfigError::Invalid {
                field: "world-size",
                reason: "must be at least 1".into(),
            });
        }
        if self.rank >= self.world_size {
            return Err(ConfigError::Invalid {
                field: "rank",
                reason: format!("rank {} outside world of {}", self.rank, self.world_size),
            });
        }
        if self.world_size > 1 && self.coordinator_addr.is_none() {
            return Err(ConfigError::Invalid {
                field: "coordinator-addr",
                reason: "required when world-size > 1".into(),
            });
        }
        if self.state_width == 0 {
            return Err(ConfigError::Invalid {
                field: "state-width",
                reason: "must be at least 1".into(),
            });
        }
        if self.state_width > 1 {
            // multi-state expands the transition space; the single-state
            // warmup/falign criteria and CTC cannot share it
            let conflicting: &[(&'static str, bool)] = &[
                ("linseg-epochs", self.linseg_epochs > 0),
                ("falign-epochs", self.falign_epochs > 0),
                ("ctc", self.ctc),
            ];
            for (field, set) in conflicting {
                if *set {
                    return Err(ConfigError::Contradictory {
                        first: "state-width",
                        second: field,
                    });
                }
            }
        }
        Ok(())
    }
}
