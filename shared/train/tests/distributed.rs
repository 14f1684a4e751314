use scribe_cluster::{ClusterCoordinator, TcpCluster};
use scribe_core::{DictionaryBuilder, GradClamp, LossScale, RunConfig};
use scribe_criterion::SharedTransitions;
use scribe_data::{Dataset, DummyDataset};
use scribe_model::{AcousticModel, LinearModel};
use scribe_train::{Curriculum, Heartbeat, TrainingContext};
use std::net::TcpListener;
use std::path::Path;
use std::sync::Arc;

const FEATURES: usize = 4;

fn config(dir: &Path, rank: usize) -> RunConfig {
    let tokens_file = dir.join("tokens.txt");
    if !tokens_file.exists() {
        std::fs::write(&tokens_file, "a\nb\n|\n").unwrap();
    }
    RunConfig {
        tag: "dist".into(),
        seed: 5,
        data_dir: dir.to_path_buf(),
        train_set: "train".into(),
        valid_sets: vec![],
        test_sets: vec![],
        max_input_frames: 64,
        max_target_len: 32,
        no_resample: false,
        loader_threads: 1,
        tokens_file,
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
        loss_scale: LossScale::None,
        lr: 0.05,
        lr_transitions: 0.02,
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
        world_size: 2,
        rank,
        coordinator_addr: Some("127.0.0.1:0".into()),
        feature_width: FEATURES,
        num_classes: 3,
        effective_lr: 0.05,
        effective_lr_transitions: 0.02,
    }
}

/// Run one synchronized epoch on one worker and return the parameters
/// afterwards, plus their cross-worker mean. If every worker holds the
/// same trajectory the mean equals the local values.
fn run_worker(cluster: Arc<dyn ClusterCoordinator>, dir: &Path, model_seed: u64) -> (Vec<f32>, Vec<f32>) {
    let config = config(dir, cluster.rank());
    let built = DictionaryBuilder::from_config(&config).build().unwrap();

    // workers start from different seeds; the first-epoch broadcast must
    // converge them onto rank 0's weights
    let mut model = LinearModel::new(FEATURES, built.dict.len(), model_seed);
    let transitions = SharedTransitions::new(built.dict.len());
    let mut train = DummyDataset::new(4, 6..9, FEATURES, 3, 77);
    let valid: Vec<(String, Box<dyn Dataset>)> = vec![];

    let mut ctx = TrainingContext::new(
        Arc::new(config),
        cluster.clone(),
        Heartbeat::disabled(),
        None,
        None,
        0,
    );

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

    let mut flat: Vec<f32> = Vec::new();
    for var in model.variables() {
        flat.extend_from_slice(&var.data);
    }
    flat.extend_from_slice(transitions.read().as_slice());

    let mut mean = flat.clone();
    cluster.all_reduce_mean(&mut mean).unwrap();
    (flat, mean)
}

#[test]
fn two_workers_stay_parameter_identical_after_a_synchronized_step() {
    let dir = tempfile::tempdir().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    let peer_dir = dir.path().to_path_buf();
    let peer = std::thread::spawn(move || {
        let cluster: Arc<dyn ClusterCoordinator> =
            Arc::new(TcpCluster::connect(&addr, 1, 2).unwrap());
        run_worker(cluster, &peer_dir, 2)
    });

    let cluster: Arc<dyn ClusterCoordinator> =
        Arc::new(TcpCluster::from_listener(listener, 2).unwrap());
    let (root_params, root_mean) = run_worker(cluster, dir.path(), 1);
    let (peer_params, peer_mean) = peer.join().unwrap();

    // both workers processed identical local batches through one gradient
    // barrier per step, so their parameter trajectories must agree
    assert_eq!(root_params.len(), peer_params.len());
    for (a, b) in root_params.iter().zip(&root_mean) {
        assert!((a - b).abs() < 1e-5, "root diverged from group mean: {a} vs {b}");
    }
    for (a, b) in peer_params.iter().zip(&peer_mean) {
        assert!((a - b).abs() < 1e-5, "peer diverged from group mean: {a} vs {b}");
    }
    for (a, b) in root_params.iter().zip(&peer_params) {
        assert!((a - b).abs() < 1e-5, "workers diverged: {a} vs {b}");
    }
}
