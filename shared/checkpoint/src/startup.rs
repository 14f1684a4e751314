use crate::store::{CheckpointKind, CheckpointPayload, load_checkpoint};
use crate::{CheckpointError, experiment};
use scribe_core::RunConfig;
use std::path::{Path, PathBuf};
use tracing::info;

/// The three mutually exclusive entry modes of the trainer.
#[derive(Debug, Clone)]
pub enum StartMode {
    /// `train`: fresh experiment from CLI options alone.
    Fresh,
    /// `continue <experiment-dir>`: resume the newest checkpointed run.
    Continue(PathBuf),
    /// `fork <model-file>`: branch a new experiment from an existing model.
    Fork(PathBuf),
}

/// Normalized startup state. Fresh, continue and fork all collapse into
/// this one value, consumed uniformly by the rest of the system.
pub struct Startup {
    pub config: RunConfig,
    pub prior: Option<CheckpointPayload>,
    pub is_new_identity: bool,
}

/// Resolve the entry mode against the CLI-derived configuration.
///
/// On `Continue` the stored config wins (it is the experiment's identity)
/// and only deployment-volatile fields follow the fresh CLI values. On
/// `Fork` the stored config provides defaults but the experiment identity
/// is new: the CLI tag applies and the score history is dropped.
pub fn resolve(mode: StartMode, cli_config: RunConfig) -> Result<Startup, CheckpointError> {
    match mode {
        StartMode::Fresh => Ok(Startup {
            config: cli_config,
            prior: None,
            is_new_identity: true,
        }),
        StartMode::Continue(experiment_dir) => {
            let (run_index, payload) = newest_checkpoint(&experiment_dir)?;
            info!(
                run_index,
                dir = %experiment_dir.display(),
                "resuming prior run"
            );
            let config = merge_volatile(payload.config.clone(), &cli_config);
            Ok(Startup {
                config,
                prior: Some(payload),
                is_new_identity: false,
            })
        }
        StartMode::Fork(model_file) => {
            let mut payload = load_checkpoint(&model_file)?;
            info!(model = %model_file.display(), "forking new experiment from model");
            let mut config = merge_volatile(payload.config.clone(), &cli_config);
            config.tag = cli_config.tag.clone();
            // only network + transitions + config defaults carry over
            payload.score = None;
            Ok(Startup {
                config,
                prior: Some(payload),
                is_new_identity: true,
            })
        }
    }
}

/// Stored configuration with the deployment-volatile fields replaced by the
/// current invocation's values.
fn merge_volatile(mut stored: RunConfig, cli: &RunConfig) -> RunConfig {
    stored.run_root = cli.run_root.clone();
    stored.rank = cli.rank;
    stored.world_size = cli.world_size;
    stored.coordinator_addr = cli.coordinator_addr.clone();
    stored.loader_threads = cli.loader_threads;
    stored.restore_best_scores = cli.restore_best_scores;
    stored
}

/// Newest run under the experiment directory that holds a `model_last`
/// checkpoint.
fn newest_checkpoint(
    experiment_dir: &Path,
) -> Result<(u32, CheckpointPayload), CheckpointError> {
    let entries = std::fs::read_dir(experiment_dir).map_err(|source| CheckpointError::Io {
        path: experiment_dir.to_path_buf(),
        source,
    })?;
    let mut runs: Vec<u32> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            entry
                .file_name()
                .to_str()
                .and_then(|name| name.strip_prefix("run-"))
                .and_then(|digits| digits.parse::<u32>().ok())
        })
        .collect();
    runs.sort_unstable_by(|a, b| b.cmp(a));

    for run_index in runs {
        let candidate = experiment::run_dir(experiment_dir, run_index)
            .join(format!("{}.safetensors", CheckpointKind::Last.stem()));
        if candidate.exists() {
            return Ok((run_index, load_checkpoint(&candidate)?));
        }
    }
    Err(CheckpointError::MissingCheckpoint {
        path: experiment_dir.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CheckpointStore, Provenance};
    use crate::tests_support::test_config;
    use chrono::Utc;
    use scribe_criterion::TransitionMatrix;
    use scribe_model::{AcousticModel, LinearModel};

    fn save_run(experiment: &Path, run_index: u32, lr: f64) {
        let store =
            CheckpointStore::new(experiment::run_dir(experiment, run_index)).unwrap();
        let model = LinearModel::new(4, 3, run_index as u64);
        let mut config = test_config();
        config.lr = lr;
        store
            .save(
                &CheckpointKind::Last,
                &CheckpointPayload {
                    config,
                    arch: model.arch(),
                    weights: model.variables().to_vec(),
                    transitions: TransitionMatrix::new(3),
                    score: Some(20.0),
                    provenance: Provenance {
                        run_index,
                        saved_at: Utc::now(),
                    },
                },
            )
            .unwrap();
    }

    #[test]
    fn fresh_start_has_no_prior() {
        let startup = resolve(StartMode::Fresh, test_config()).unwrap();
        assert!(startup.prior.is_none());
        assert!(startup.is_new_identity);
    }

    #[test]
    fn continue_picks_newest_run_and_keeps_stored_config() {
        let dir = tempfile::tempdir().unwrap();
        save_run(dir.path(), 0, 0.1);
        save_run(dir.path(), 3, 0.7);

        let mut cli = test_config();
        cli.lr = 99.0; // must not win
        cli.loader_threads = 8; // volatile, must win
        let startup = resolve(StartMode::Continue(dir.path().to_path_buf()), cli).unwrap();
        assert!(!startup.is_new_identity);
        assert_eq!(startup.config.lr, 0.7);
        assert_eq!(startup.config.loader_threads, 8);
        assert_eq!(startup.prior.as_ref().unwrap().provenance.run_index, 3);
    }

    #[test]
    fn continue_without_checkpoint_fails() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("run-000")).unwrap();
        assert!(matches!(
            resolve(StartMode::Continue(dir.path().to_path_buf()), test_config()),
            Err(CheckpointError::MissingCheckpoint { .. })
        ));
    }

    #[test]
    fn fork_is_a_new_identity_and_drops_scores() {
        let dir = tempfile::tempdir().unwrap();
        save_run(dir.path(), 0, 0.5);
        let model_file = experiment::run_dir(dir.path(), 0).join("model_last.safetensors");

        let mut cli = test_config();
        cli.tag = "branch".into();
        let startup = resolve(StartMode::Fork(model_file), cli).unwrap();
        assert!(startup.is_new_identity);
        assert_eq!(startup.config.tag, "branch");
        assert_eq!(startup.config.lr, 0.5); // defaults from the model
        assert_eq!(startup.prior.as_ref().unwrap().score, None);
    }
}
