use scribe_checkpoint::{CheckpointStore, load_checkpoint};
use scribe_cluster::SingleProcess;
use scribe_core::{
    BuiltDictionary, DictionaryBuilder, GradClamp, LossScale, RunConfig,
};
use scribe_criterion::{Criterion, CriterionKind, CriterionOptions, SharedTransitions};
use scribe_data::{Dataset, DummyDataset};
use scribe_eval::Evaluator;
use scribe_model::{AcousticModel, LinearModel, restore_variables};
use scribe_train::{Curriculum, Heartbeat, PhaseKind, RunLogs, TrainingContext};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const FEATURES: usize = 5;

fn write_tokens(dir: &Path) -> PathBuf {
    let path = dir.join("tokens.txt");
    std::fs::write(&path, "a\nb\n|\n").unwrap();
    path
}

fn config(dir: &Path) -> RunConfig {
    RunConfig {
        tag: "itest".into(),
        seed: 13,
        data_dir: dir.to_path_buf(),
        train_set: "train".into(),
        valid_sets: vec!["valid".into()],
        test_sets: vec![],
        max_input_frames: 64,
        max_target_len: 32,
        no_resample: false,
        loader_threads: 2,
        tokens_file: write_tokens(dir),
        collapse_noise: false,
        phoneme_full: false,
        fold_file: None,
        fold_targets: false,
        replabel: 0,
        ctc: false,
        garbage: false,
        batch_size: 0,
        criterion_threads: 1,
        seg_given: false,
        shift_window: false,
        state_width: 1,
        loss_scale: LossScale::PerInput,
        lr: 0.05,
        lr_transitions: 0.01,
        momentum: 0.0,
        weight_decay: 0.0,
        clamp: GradClamp::Off,
        linseg_epochs: 0,
        linseg_lr: None,
        linseg_zero_net: false,
        linseg_freeze_transitions: false,
        falign_epochs: 0,
        falign_lr: None,
        epochs: 1,
        word_vocab: None,
        beam_decoder_wer: false,
        train_edit_every: 0,
        reclaim_every: 0,
        run_root: dir.join("runs"),
        restore_best_scores: false,
        world_size: 1,
        rank: 0,
        coordinator_addr: None,
        feature_width: FEATURES,
        num_classes: 3,
        effective_lr: 0.05,
        effective_lr_transitions: 0.01,
    }
}

fn built_dictionary(config: &RunConfig) -> BuiltDictionary {
    DictionaryBuilder::from_config(config).build().unwrap()
}

fn context(config: RunConfig, store: Option<CheckpointStore>) -> TrainingContext {
    let logs = store
        .as_ref()
        .map(|s| RunLogs::create(s.run_dir()).unwrap());
    TrainingContext::new(
        Arc::new(config),
        Arc::new(SingleProcess),
        Heartbeat::disabled(),
        store,
        logs,
        0,
    )
}

fn datasets() -> (DummyDataset, Vec<(String, Box<dyn Dataset>)>) {
    let train = DummyDataset::new(6, 6..10, FEATURES, 3, 21);
    let valid: Vec<(String, Box<dyn Dataset>)> = vec![(
        "valid".to_string(),
        Box::new(DummyDataset::new(3, 6..10, FEATURES, 3, 22)),
    )];
    (train, valid)
}

#[test]
fn all_three_phases_run_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.linseg_epochs = 1;
    config.falign_epochs = 1;
    config.epochs = 1;
    let built = built_dictionary(&config);

    let mut model = LinearModel::new(FEATURES, built.dict.len(), config.seed);
    let (mut train, valid) = datasets();
    let mut ctx = context(config, None);

    let phases = Curriculum {
        built: &built,
        model: &mut model,
        transitions: SharedTransitions::new(built.dict.len()),
        train: &mut train,
        valid: &valid,
        test: &[],
        word_vocab: None,
        lattice: None,
    }
    .run(&mut ctx)
    .unwrap();

    assert_eq!(
        phases,
        vec![PhaseKind::Warmup, PhaseKind::ForcedAlignment, PhaseKind::Main]
    );
    assert_eq!(ctx.epoch, 3);
}

#[test]
fn zero_budgets_skip_to_main_only() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let built = built_dictionary(&config);

    let mut model = LinearModel::new(FEATURES, built.dict.len(), config.seed);
    let (mut train, valid) = datasets();
    let mut ctx = context(config, None);

    let phases = Curriculum {
        built: &built,
        model: &mut model,
        transitions: SharedTransitions::new(built.dict.len()),
        train: &mut train,
        valid: &valid,
        test: &[],
        word_vocab: None,
        lattice: None,
    }
    .run(&mut ctx)
    .unwrap();

    assert_eq!(phases, vec![PhaseKind::Main]);
    assert_eq!(ctx.epoch, 1);
}

#[test]
fn warmup_with_zero_network_trains_transitions_only() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.linseg_epochs = 1;
    config.linseg_zero_net = true;
    config.epochs = 0;
    // main phase is normally mandatory; for this probe we only run warmup
    let built = built_dictionary(&config);

    let mut model = LinearModel::new(FEATURES, built.dict.len(), config.seed);
    let before = model.variables()[0].data.clone();
    let transitions = SharedTransitions::new(built.dict.len());
    let (mut train, valid) = datasets();
    let mut ctx = context(config, None);

    Curriculum {
        built: &built,
        model: &mut model,
        transitions: transitions.clone(),
        train: &mut train,
        valid: &valid,
        test: &[],
        word_vocab: None,
        lattice: None,
    }
    .run(&mut ctx)
    .unwrap();

    // real weights untouched, transitions moved
    assert_eq!(model.variables()[0].data, before);
    let moved = transitions
        .read()
        .as_slice()
        .iter()
        .any(|v| *v != 0.0);
    assert!(moved, "warmup should have trained the transitions");
}

#[test]
fn main_phase_writes_last_and_best_checkpoints_and_logs() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.epochs = 2;
    let built = built_dictionary(&config);

    let run_dir = dir.path().join("runs").join("run-000");
    let store = CheckpointStore::new(run_dir.clone()).unwrap();

    let mut model = LinearModel::new(FEATURES, built.dict.len(), config.seed);
    let (mut train, valid) = datasets();
    let mut ctx = context(config, Some(store));

    Curriculum {
        built: &built,
        model: &mut model,
        transitions: SharedTransitions::new(built.dict.len()),
        train: &mut train,
        valid: &valid,
        test: &[],
        word_vocab: None,
        lattice: None,
    }
    .run(&mut ctx)
    .unwrap();

    assert!(run_dir.join("model_last.safetensors").exists());
    assert!(run_dir.join("model_last.json").exists());
    // epoch 1 always strictly improves on an empty best table
    assert!(run_dir.join("model_valid.safetensors").exists());

    let status = std::fs::read_to_string(run_dir.join("train.log")).unwrap();
    assert_eq!(status.lines().count(), 2);
    assert!(status.contains("| phase main |"));
    assert!(status.contains("valid-err"));

    let perf = std::fs::read_to_string(run_dir.join("perf.log")).unwrap();
    let mut lines = perf.lines();
    let header = lines.next().unwrap();
    assert!(header.starts_with("# epoch loss"));
    assert!(header.contains("valid-err"));
    assert_eq!(lines.count(), 2);
}

#[test]
fn checkpoint_round_trip_reproduces_evaluation() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.epochs = 1;
    let built = built_dictionary(&config);

    let run_dir = dir.path().join("runs").join("run-000");
    let store = CheckpointStore::new(run_dir.clone()).unwrap();

    let mut model = LinearModel::new(FEATURES, built.dict.len(), config.seed);
    let transitions = SharedTransitions::new(built.dict.len());
    let (mut train, valid) = datasets();
    let mut ctx = context(config, Some(store));

    Curriculum {
        built: &built,
        model: &mut model,
        transitions: transitions.clone(),
        train: &mut train,
        valid: &valid,
        test: &[],
        word_vocab: None,
        lattice: None,
    }
    .run(&mut ctx)
    .unwrap();

    let criterion = |shared: SharedTransitions| {
        Criterion::new(
            CriterionKind::AutoSeg,
            CriterionOptions::default(),
            Some(shared),
        )
        .unwrap()
    };
    let valid_set = &valid[0].1;

    let mut evaluator = Evaluator::new(built.remap.clone(), None, None);
    let direct = evaluator
        .run(
            &mut model,
            &criterion(transitions.clone()),
            valid_set.as_ref(),
            &built.dict,
        )
        .unwrap();

    // reload into a fresh model + transition matrix
    let payload = load_checkpoint(&run_dir.join("model_last.safetensors")).unwrap();
    let mut reloaded = LinearModel::new(FEATURES, built.dict.len(), 999);
    restore_variables(&mut reloaded, &payload.weights).unwrap();
    let reloaded_transitions = SharedTransitions::from_matrix(payload.transitions);

    let replayed = evaluator
        .run(
            &mut reloaded,
            &criterion(reloaded_transitions),
            valid_set.as_ref(),
            &built.dict,
        )
        .unwrap();

    assert_eq!(direct.letter_err, replayed.letter_err);
    assert_eq!(direct.samples, replayed.samples);
}
