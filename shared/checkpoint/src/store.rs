use crate::CheckpointError;
use chrono::{DateTime, Utc};
use safetensors::SafeTensors;
use safetensors::tensor::{Dtype, TensorView};
use scribe_core::{ConfigError, Matrix, RunConfig};
use scribe_criterion::TransitionMatrix;
use scribe_model::{ArchSpec, Variable};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Reserved tensor name for the transition matrix inside the weights file.
const TRANSITIONS_TENSOR: &str = "__transitions__";

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Provenance {
    pub run_index: u32,
    pub saved_at: DateTime<Utc>,
}

/// Everything a checkpoint must round-trip exactly: the run configuration,
/// architecture hyperparameters, pristine network weights (independent of
/// any runtime-only wrapping), the transition matrix, and the optional
/// validation score that justified a best-model write.
pub struct CheckpointPayload {
    pub config: RunConfig,
    pub arch: ArchSpec,
    pub weights: Vec<Variable>,
    pub transitions: TransitionMatrix,
    pub score: Option<f64>,
    pub provenance: Provenance,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CheckpointKind {
    /// Overwritten every epoch.
    Last,
    /// Overwritten only on strict improvement for the named validation set.
    Best(String),
}

impl CheckpointKind {
    pub fn stem(&self) -> String {
        match self {
            CheckpointKind::Last => "model_last".to_string(),
            CheckpointKind::Best(validset) => format!("model_{validset}"),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct Sidecar {
    config: RunConfig,
    arch: ArchSpec,
    score: Option<f64>,
    provenance: Provenance,
}

/// Writes and reads checkpoints inside one run directory. Only rank 0
/// constructs one of these; other ranks never write the experiment tree.
pub struct CheckpointStore {
    run_dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(run_dir: PathBuf) -> Result<Self, CheckpointError> {
        std::fs::create_dir_all(&run_dir).map_err(|source| CheckpointError::Io {
            path: run_dir.clone(),
            source,
        })?;
        Ok(Self { run_dir })
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Atomic full-file write: tensors then sidecar, each through a
    /// temporary + rename. The sidecar rename is last and acts as the
    /// commit point.
    pub fn save(
        &self,
        kind: &CheckpointKind,
        payload: &CheckpointPayload,
    ) -> Result<PathBuf, CheckpointError> {
        let stem = kind.stem();
        let tensor_path = self.run_dir.join(format!("{stem}.safetensors"));
        let sidecar_path = self.run_dir.join(format!("{stem}.json"));

        let classes = payload.transitions.classes();
        let mut raw: Vec<(String, Vec<usize>, Vec<u8>)> =
            Vec::with_capacity(payload.weights.len() + 1);
        for var in &payload.weights {
            raw.push((var.name.clone(), var.shape.clone(), as_bytes(&var.data)));
        }
        raw.push((
            TRANSITIONS_TENSOR.to_string(),
            vec![classes, classes],
            as_bytes(payload.transitions.as_slice()),
        ));
        let mut tensors: Vec<(String, TensorView)> = Vec::with_capacity(raw.len());
        for (name, shape, bytes) in &raw {
            tensors.push((
                name.clone(),
                TensorView::new(Dtype::F32, shape.clone(), bytes)?,
            ));
        }
        let serialized = safetensors::serialize(tensors, &None)?;
        write_atomic(&tensor_path, &serialized)?;

        let sidecar = Sidecar {
            config: payload.config.clone(),
            arch: payload.arch,
            score: payload.score,
            provenance: payload.provenance.clone(),
        };
        write_atomic(&sidecar_path, &serde_json::to_vec_pretty(&sidecar)?)?;

        info!(
            checkpoint = %tensor_path.display(),
            score = ?payload.score,
            "saved checkpoint"
        );
        Ok(tensor_path)
    }

    pub fn load(&self, kind: &CheckpointKind) -> Result<CheckpointPayload, CheckpointError> {
        load_checkpoint(&self.run_dir.join(format!("{}.safetensors", kind.stem())))
    }

    /// The best-model score recorded on disk for a validation set, if any.
    pub fn recorded_score(&self, validset: &str) -> Option<f64> {
        let sidecar_path = self.run_dir.join(format!("model_{validset}.json"));
        let text = std::fs::read_to_string(sidecar_path).ok()?;
        serde_json::from_str::<Sidecar>(&text).ok()?.score
    }
}

/// Best scores ever recorded on disk across all runs of an experiment, per
/// validation set. Used to re-seed the in-memory best table on resume when
/// `restore_best_scores` is set; without it a resumed run may overwrite a
/// previously-best checkpoint with a worse score.
pub fn best_scores_on_disk(experiment_dir: &Path, valid_sets: &[String]) -> Vec<(String, f64)> {
    let Ok(entries) = std::fs::read_dir(experiment_dir) else {
        return Vec::new();
    };
    let run_dirs: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("run-"))
        })
        .collect();

    let mut best = Vec::new();
    for validset in valid_sets {
        let mut minimum: Option<f64> = None;
        for run in &run_dirs {
            let sidecar = run.join(format!("model_{validset}.json"));
            let Ok(text) = std::fs::read_to_string(&sidecar) else {
                continue;
            };
            if let Some(score) = serde_json::from_str::<Sidecar>(&text)
                .ok()
                .and_then(|s| s.score)
            {
                minimum = Some(minimum.map_or(score, |m: f64| m.min(score)));
            }
        }
        if let Some(score) = minimum {
            best.push((validset.clone(), score));
        }
    }
    best
}

/// Load a checkpoint from its tensor file (or stem); the JSON sidecar must
/// sit next to it.
pub fn load_checkpoint(path: &Path) -> Result<CheckpointPayload, CheckpointError> {
    let tensor_path = match path.extension() {
        Some(ext) if ext == "safetensors" => path.to_path_buf(),
        _ => path.with_extension("safetensors"),
    };
    let sidecar_path = tensor_path.with_extension("json");

    let sidecar_text =
        std::fs::read_to_string(&sidecar_path).map_err(|source| CheckpointError::Io {
            path: sidecar_path.clone(),
            source,
        })?;
    let sidecar_value: serde_json::Value = serde_json::from_str(&sidecar_text)?;
    // surface missing architecture fields as config errors, not decode noise
    for field in ["kernel_width", "stride"] {
        if sidecar_value
            .get("arch")
            .and_then(|arch| arch.get(field))
            .is_none()
        {
            return Err(ConfigError::MissingField {
                field: match field {
                    "kernel_width" => "arch.kernel_width",
                    _ => "arch.stride",
                },
            }
            .into());
        }
    }
    let sidecar: Sidecar = serde_json::from_value(sidecar_value)?;

    let bytes = std::fs::read(&tensor_path).map_err(|source| CheckpointError::Io {
        path: tensor_path.clone(),
        source,
    })?;
    let tensors = SafeTensors::deserialize(&bytes)?;

    let mut weights = Vec::new();
    let mut transitions = None;
    for (name, view) in tensors.tensors() {
        if view.dtype() != Dtype::F32 {
            return Err(CheckpointError::Malformed {
                path: tensor_path.clone(),
                reason: format!("tensor {name} has dtype {:?}", view.dtype()),
            });
        }
        let data = from_bytes(view.data());
        if name == TRANSITIONS_TENSOR {
            let classes = view.shape()[0];
            transitions = Some(TransitionMatrix::from_matrix(Matrix::from_vec(
                classes, classes, data,
            )));
        } else {
            let len = data.len();
            weights.push(Variable {
                name,
                shape: view.shape().to_vec(),
                data,
                grad: vec![0.0; len],
            });
        }
    }
    // stable order regardless of file layout
    weights.sort_by(|a, b| a.name.cmp(&b.name));
    let transitions = transitions.ok_or_else(|| CheckpointError::Malformed {
        path: tensor_path.clone(),
        reason: "missing transition tensor".into(),
    })?;

    debug!(weights = weights.len(), "loaded checkpoint");
    Ok(CheckpointPayload {
        config: sidecar.config,
        arch: sidecar.arch,
        weights,
        transitions,
        score: sidecar.score,
        provenance: sidecar.provenance,
    })
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), CheckpointError> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes).map_err(|source| CheckpointError::Io {
        path: tmp.clone(),
        source,
    })?;
    std::fs::rename(&tmp, path).map_err(|source| CheckpointError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn as_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn from_bytes(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes(b.try_into().expect("4 bytes")))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests_support::test_config;
    use scribe_model::{AcousticModel, LinearModel};

    fn payload() -> CheckpointPayload {
        let model = LinearModel::new(4, 3, 9);
        let mut transitions = TransitionMatrix::new(3);
        transitions.as_mut_slice()[4] = 0.25;
        CheckpointPayload {
            config: test_config(),
            arch: model.arch(),
            weights: model.variables().to_vec(),
            transitions,
            score: Some(12.5),
            provenance: Provenance {
                run_index: 2,
                saved_at: Utc::now(),
            },
        }
    }

    #[test]
    fn checkpoint_round_trips_exactly() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("run-000")).unwrap();
        let original = payload();
        let path = store.save(&CheckpointKind::Last, &original).unwrap();

        let loaded = load_checkpoint(&path).unwrap();
        assert_eq!(loaded.config, original.config);
        assert_eq!(loaded.arch, original.arch);
        assert_eq!(loaded.score, Some(12.5));
        assert_eq!(loaded.transitions, original.transitions);
        let mut expected = original.weights.clone();
        expected.sort_by(|a, b| a.name.cmp(&b.name));
        for (got, want) in loaded.weights.iter().zip(&expected) {
            assert_eq!(got.name, want.name);
            assert_eq!(got.shape, want.shape);
            assert_eq!(got.data, want.data);
        }
    }

    #[test]
    fn best_kind_is_tagged_with_validset_name() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().to_path_buf()).unwrap();
        store
            .save(&CheckpointKind::Best("valid".into()), &payload())
            .unwrap();
        assert!(dir.path().join("model_valid.safetensors").exists());
        assert_eq!(store.recorded_score("valid"), Some(12.5));
        assert_eq!(store.recorded_score("other"), None);
    }

    #[test]
    fn disk_best_scores_take_the_minimum_across_runs() {
        let dir = tempfile::tempdir().unwrap();
        let mut p = payload();
        for (run, score) in [(0u32, 14.0), (1, 9.5), (2, 11.0)] {
            let store =
                CheckpointStore::new(dir.path().join(format!("run-{run:03}"))).unwrap();
            p.score = Some(score);
            store
                .save(&CheckpointKind::Best("valid".into()), &p)
                .unwrap();
        }
        let best = best_scores_on_disk(dir.path(), &["valid".into(), "other".into()]);
        assert_eq!(best, vec![("valid".to_string(), 9.5)]);
    }

    #[test]
    fn missing_arch_field_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().to_path_buf()).unwrap();
        let path = store.save(&CheckpointKind::Last, &payload()).unwrap();

        // strip the stride field from the sidecar
        let sidecar_path = path.with_extension("json");
        let mut value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&sidecar_path).unwrap()).unwrap();
        value["arch"]
            .as_object_mut()
            .unwrap()
            .remove("stride");
        std::fs::write(&sidecar_path, value.to_string()).unwrap();

        assert!(matches!(
            load_checkpoint(&path),
            Err(CheckpointError::Config(ConfigError::MissingField {
                field: "arch.stride"
            }))
        ));
    }
}
