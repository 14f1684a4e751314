use crate::CheckpointError;
use scribe_core::RunConfig;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::info;

/// Config fields that do not change what is being trained: they are
/// excluded from the experiment identity so the same experiment can be
/// resumed from another machine, with another worker layout, or with a
/// different scratch root.
const VOLATILE_FIELDS: [&str; 11] = [
    "run_root",
    "rank",
    "world_size",
    "coordinator_addr",
    "loader_threads",
    "criterion_threads",
    "restore_best_scores",
    "feature_width",
    "num_classes",
    "effective_lr",
    "effective_lr_transitions",
];

/// Deterministic, collision-free experiment name for a configuration:
/// the human tag plus a digest of every identity-relevant field.
pub fn experiment_name(config: &RunConfig) -> String {
    let mut value = serde_json::to_value(config).expect("RunConfig serializes");
    if let Some(map) = value.as_object_mut() {
        for field in VOLATILE_FIELDS {
            map.remove(field);
        }
    }
    // serde_json maps are key-sorted, so the rendering is canonical
    let canonical = value.to_string();
    let digest = Sha256::digest(canonical.as_bytes());
    format!("{}-{}", config.tag, hex::encode(&digest[..8]))
}

/// Directory identity for one experiment = root / name(config).
pub fn experiment_dir(root: &Path, config: &RunConfig) -> PathBuf {
    root.join(experiment_name(config))
}

pub fn run_dir(experiment: &Path, run_index: u32) -> PathBuf {
    experiment.join(format!("run-{run_index:03}"))
}

/// Claim the next unused run index under an experiment directory. Indices
/// increment on every (re)start of the same experiment identity and are
/// never reused or decremented; claiming creates the run directory.
pub fn allocate_run_index(experiment: &Path) -> Result<u32, CheckpointError> {
    std::fs::create_dir_all(experiment).map_err(|source| CheckpointError::Io {
        path: experiment.to_path_buf(),
        source,
    })?;
    let mut next = 0u32;
    let entries = std::fs::read_dir(experiment).map_err(|source| CheckpointError::Io {
        path: experiment.to_path_buf(),
        source,
    })?;
    for entry in entries {
        let entry = entry.map_err(|source| CheckpointError::Io {
            path: experiment.to_path_buf(),
            source,
        })?;
        if let Some(index) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.strip_prefix("run-"))
            .and_then(|digits| digits.parse::<u32>().ok())
        {
            next = next.max(index + 1);
        }
    }
    let dir = run_dir(experiment, next);
    std::fs::create_dir(&dir).map_err(|source| CheckpointError::Io {
        path: dir.clone(),
        source,
    })?;
    info!(run_index = next, dir = %dir.display(), "allocated run directory");
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RunConfig {
        serde_json::from_value(serde_json::json!({
            "tag": "timit",
            "seed": 1,
            "data_dir": "/data",
            "train_set": "train",
            "valid_sets": ["valid"],
            "test_sets": [],
            "max_input_frames": 100,
            "max_target_len": 50,
            "no_resample": false,
            "loader_threads": 2,
            "tokens_file": "/tokens",
            "collapse_noise": false,
            "phoneme_full": false,
            "fold_file": null,
            "fold_targets": false,
            "replabel": 0,
            "ctc": false,
            "garbage": false,
            "batch_size": 0,
            "criterion_threads": 1,
            "seg_given": false,
            "shift_window": false,
            "state_width": 1,
            "loss_scale": "none",
            "lr": 0.1,
            "lr_transitions": 0.01,
            "momentum": 0.0,
            "weight_decay": 0.0,
            "clamp": "off",
            "linseg_epochs": 0,
            "linseg_lr": null,
            "linseg_zero_net": false,
            "linseg_freeze_transitions": false,
            "falign_epochs": 0,
            "falign_lr": null,
            "epochs": 1,
            "word_vocab": null,
            "beam_decoder_wer": false,
            "train_edit_every": 0,
            "reclaim_every": 0,
            "run_root": "/runs",
            "restore_best_scores": false,
            "world_size": 1,
            "rank": 0,
            "coordinator_addr": null,
            "feature_width": 13,
            "num_classes": 30,
            "effective_lr": 0.1,
            "effective_lr_transitions": 0.01,
        }))
        .unwrap()
    }

    #[test]
    fn name_ignores_volatile_fields() {
        let a = config();
        let mut b = config();
        b.rank = 3;
        b.world_size = 8;
        b.run_root = "/elsewhere".into();
        assert_eq!(experiment_name(&a), experiment_name(&b));
    }

    #[test]
    fn name_distinguishes_real_config_changes() {
        let a = config();
        let mut b = config();
        b.lr = 0.2;
        assert_ne!(experiment_name(&a), experiment_name(&b));
    }

    #[test]
    fn run_indices_are_strictly_increasing_and_unused() {
        let dir = tempfile::tempdir().unwrap();
        let experiment = dir.path().join("exp");
        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(allocate_run_index(&experiment).unwrap());
        }
        assert_eq!(seen, vec![0, 1, 2, 3]);
        // deleting an old run must not cause reuse of a later index
        std::fs::remove_dir_all(run_dir(&experiment, 1)).unwrap();
        assert_eq!(allocate_run_index(&experiment).unwrap(), 4);
    }
}
