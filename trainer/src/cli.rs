use anyhow::Result;
use clap::{Args, ValueEnum};
use scribe_core::{GradClamp, LossScale, RunConfig};
use std::path::PathBuf;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogOutput {
    Console,
    Json,
    None,
}

/// Options shared by all three entry modes. On `continue`, only the
/// deployment-volatile subset applies; the experiment's stored config wins
/// for everything else.
#[derive(Args, Debug)]
pub struct TrainArgs {
    /// Human tag mixed into the experiment directory name.
    #[clap(long, env, default_value = "scribe")]
    pub tag: String,

    #[clap(long, env, default_value_t = 42)]
    pub seed: u64,

    /// Log format: console, json, or none.
    #[clap(long, env, value_enum, default_value_t = LogOutput::Console, ignore_case = true)]
    pub logs: LogOutput,

    /// Mirror logs into this file.
    #[clap(long, env)]
    pub write_log: Option<PathBuf>,

    // data
    /// Root directory holding one subdirectory per dataset.
    #[clap(long, env)]
    pub data_dir: PathBuf,

    #[clap(long, env, default_value = "train")]
    pub train_set: String,

    /// Validation sets evaluated after every epoch (comma-separated).
    #[clap(long, env, value_delimiter = ',', default_value = "valid")]
    pub valid_sets: Vec<String>,

    /// Test sets evaluated after every epoch (comma-separated).
    #[clap(long, env, value_delimiter = ',')]
    pub test_sets: Vec<String>,

    /// Samples with more input frames are skipped by the data layer.
    #[clap(long, env, default_value_t = 4000)]
    pub max_input_frames: usize,

    /// Samples with longer targets are skipped by the data layer.
    #[clap(long, env, default_value_t = 600)]
    pub max_target_len: usize,

    /// Disable the per-epoch resample/reshuffle of the training set.
    #[clap(long, env, default_value_t = false)]
    pub no_resample: bool,

    #[clap(long, env, default_value_t = 4)]
    pub loader_threads: usize,

    // dictionary
    /// Base token list, one token per line.
    #[clap(long, env)]
    pub tokens_file: PathBuf,

    /// Collapse the noise/laughter markers onto the separator token.
    #[clap(long, env, default_value_t = false)]
    pub collapse_noise: bool,

    /// Targets use the full 61-class phoneme set.
    #[clap(long, env, default_value_t = false)]
    pub phoneme_full: bool,

    /// 61-to-39 phoneme fold map (`src dst` per line).
    #[clap(long, env)]
    pub fold_file: Option<PathBuf>,

    /// Train directly in the folded 39-class space.
    #[clap(long, env, default_value_t = false)]
    pub fold_targets: bool,

    /// Number of repeat-label classes to append.
    #[clap(long, env, default_value_t = 0)]
    pub replabel: usize,

    /// Train the main phase with CTC (appends a blank class).
    #[clap(long, env, default_value_t = false)]
    pub ctc: bool,

    /// Train ASG in garbage mode (appends a garbage class).
    #[clap(long, env, default_value_t = false)]
    pub garbage: bool,

    // criterion
    /// 0 scores per-example; > 0 selects the batched criterion variant.
    #[clap(long, env, default_value_t = 0)]
    pub batch_size: usize,

    /// With batching, > 1 selects the thread-parallel sub-variant.
    #[clap(long, env, default_value_t = 1)]
    pub criterion_threads: usize,

    /// Targets are externally given per-frame segmentations.
    #[clap(long, env, default_value_t = false)]
    pub seg_given: bool,

    /// Per-sample shift windowing (incompatible with batching).
    #[clap(long, env, default_value_t = false)]
    pub shift_window: bool,

    /// States per class for the multi-state criterion (1 = off).
    #[clap(long, env, default_value_t = 1)]
    pub state_width: usize,

    #[clap(long, env, value_enum, default_value_t = LossScale::None, ignore_case = true)]
    pub loss_scale: LossScale,

    // optimization
    #[clap(long, env, default_value_t = 0.1)]
    pub lr: f64,

    #[clap(long, env, default_value_t = 0.01)]
    pub lr_transitions: f64,

    #[clap(long, env, default_value_t = 0.0)]
    pub momentum: f64,

    #[clap(long, env, default_value_t = 0.0)]
    pub weight_decay: f64,

    /// Clamp each gradient entry into [-x, x].
    #[clap(long, env)]
    pub clamp_absolute: Option<f32>,

    /// Clamp each gradient entry relative to the learning rate.
    #[clap(long, env)]
    pub clamp_relative: Option<f32>,

    /// Rescale gradients whose L2 norm exceeds x.
    #[clap(long, env)]
    pub clamp_norm: Option<f32>,

    // curriculum
    /// Warmup (linear segmentation) epoch budget; 0 skips the phase.
    #[clap(long, env, default_value_t = 0)]
    pub linseg_epochs: usize,

    #[clap(long, env)]
    pub linseg_lr: Option<f64>,

    /// Warmup against a zero network: trains pure transitions.
    #[clap(long, env, default_value_t = false)]
    pub linseg_zero_net: bool,

    /// Pin the transition learning rate to zero during warmup.
    #[clap(long, env, default_value_t = false)]
    pub linseg_freeze_transitions: bool,

    /// Forced-alignment epoch budget; 0 skips the phase.
    #[clap(long, env, default_value_t = 0)]
    pub falign_epochs: usize,

    #[clap(long, env)]
    pub falign_lr: Option<f64>,

    /// Main-phase epoch budget.
    #[clap(long, env, default_value_t = 30)]
    pub epochs: usize,

    // evaluation
    /// Word list enabling word-level edit distance.
    #[clap(long, env)]
    pub word_vocab: Option<PathBuf>,

    /// Also score with the external beam-search decoder.
    #[clap(long, env, default_value_t = false)]
    pub beam_decoder_wer: bool,

    /// Accumulate train-side edit distance every Nth sample (0 = off).
    #[clap(long, env, default_value_t = 0)]
    pub train_edit_every: usize,

    /// Reclaim step buffers every N samples (0 = off).
    #[clap(long, env, default_value_t = 1000)]
    pub reclaim_every: usize,

    // checkpointing
    /// Root under which experiment directories are created.
    #[clap(long, env, default_value = "runs")]
    pub run_root: PathBuf,

    /// On resume, re-seed the best-score table from checkpoints on disk.
    #[clap(long, env, default_value_t = false)]
    pub restore_best_scores: bool,

    // distributed
    #[clap(long, env, default_value_t = 1)]
    pub world_size: usize,

    #[clap(long, env, default_value_t = 0)]
    pub rank: usize,

    /// Rank 0's listen address, e.g. 10.0.0.1:29400.
    #[clap(long, env)]
    pub coordinator_addr: Option<String>,
}

impl TrainArgs {
    /// Draft config with derived fields still unset; `finalize` fills them
    /// once the dictionary and feature width are known.
    pub fn to_config(&self) -> Result<RunConfig> {
        let clamp = GradClamp::from_options(
            self.clamp_absolute,
            self.clamp_relative,
            self.clamp_norm,
        )?;
        Ok(RunConfig {
            tag: self.tag.clone(),
            seed: self.seed,
            data_dir: self.data_dir.clone(),
            train_set: self.train_set.clone(),
            valid_sets: self.valid_sets.clone(),
            test_sets: self.test_sets.clone(),
            max_input_frames: self.max_input_frames,
            max_target_len: self.max_target_len,
            no_resample: self.no_resample,
            loader_threads: self.loader_threads,
            tokens_file: self.tokens_file.clone(),
            collapse_noise: self.collapse_noise,
            phoneme_full: self.phoneme_full,
            fold_file: self.fold_file.clone(),
            fold_targets: self.fold_targets,
            replabel: self.replabel,
            ctc: self.ctc,
            garbage: self.garbage,
            batch_size: self.batch_size,
            criterion_threads: self.criterion_threads,
            seg_given: self.seg_given,
            shift_window: self.shift_window,
            state_width: self.state_width,
            loss_scale: self.loss_scale,
            lr: self.lr,
            lr_transitions: self.lr_transitions,
            momentum: self.momentum,
            weight_decay: self.weight_decay,
            clamp,
            linseg_epochs: self.linseg_epochs,
            linseg_lr: self.linseg_lr,
            linseg_zero_net: self.linseg_zero_net,
            linseg_freeze_transitions: self.linseg_freeze_transitions,
            falign_epochs: self.falign_epochs,
            falign_lr: self.falign_lr,
            epochs: self.epochs,
            word_vocab: self.word_vocab.clone(),
            beam_decoder_wer: self.beam_decoder_wer,
            train_edit_every: self.train_edit_every,
            reclaim_every: self.reclaim_every,
            run_root: self.run_root.clone(),
            restore_best_scores: self.restore_best_scores,
            world_size: self.world_size,
            rank: self.rank,
            coordinator_addr: self.coordinator_addr.clone(),
            feature_width: 0,
            num_classes: 0,
            effective_lr: 0.0,
            effective_lr_transitions: 0.0,
        })
    }
}
