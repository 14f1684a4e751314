use crate::cli::TrainArgs;
use anyhow::{Result, bail, ensure};
use scribe_checkpoint::{
    CheckpointStore, StartMode, Startup, allocate_run_index, best_scores_on_disk,
    experiment_dir, resolve, run_dir,
};
use scribe_cluster::{ClusterCoordinator, SingleProcess, TcpCluster};
use scribe_core::{DictionaryBuilder, RunConfig};
use scribe_criterion::SharedTransitions;
use scribe_data::{Dataset, PreprocessedDataset};
use scribe_eval::WordVocab;
use scribe_model::{AcousticModel, LinearModel, restore_variables};
use scribe_train::{Curriculum, Heartbeat, RunLogs, TrainingContext};
use std::sync::Arc;
use tracing::info;

pub fn run(mode: StartMode, args: &TrainArgs) -> Result<()> {
    let draft = args.to_config()?;
    let Startup {
        config,
        prior,
        is_new_identity,
    } = resolve(mode, draft)?;

    let built = DictionaryBuilder::from_config(&config).build()?;
    let classes = built.dict.len() * config.state_width;

    let mut train = PreprocessedDataset::open(&config.data_dir, &config.train_set)?;
    let feature_width = train.feature_width();
    let valid = open_sets(&config, &config.valid_sets)?;
    let test = open_sets(&config, &config.test_sets)?;

    let config = config.finalize(built.dict.len(), feature_width);
    config.validate()?;
    if config.beam_decoder_wer {
        bail!("--beam-decoder-wer requires an external lattice decoder; none is linked in this build");
    }
    let config = Arc::new(config);

    let cluster: Arc<dyn ClusterCoordinator> = if config.world_size > 1 {
        let addr = config
            .coordinator_addr
            .as_deref()
            .expect("validated with world_size");
        Arc::new(TcpCluster::establish(addr, config.rank, config.world_size)?)
    } else {
        Arc::new(SingleProcess)
    };

    let mut model = LinearModel::new(feature_width, classes, config.seed);
    let transitions = match prior {
        Some(payload) => {
            ensure!(
                payload.arch == model.arch(),
                "checkpoint architecture {:?} does not match this model ({:?})",
                payload.arch,
                model.arch(),
            );
            ensure!(
                payload.transitions.classes() == classes,
                "checkpoint transitions sized for {} classes, this run needs {classes}",
                payload.transitions.classes(),
            );
            restore_variables(&mut model, &payload.weights)?;
            info!(run_index = payload.provenance.run_index, "restored prior model");
            SharedTransitions::from_matrix(payload.transitions)
        }
        None => SharedTransitions::new(classes),
    };

    let word_vocab = config
        .word_vocab
        .as_deref()
        .map(WordVocab::load)
        .transpose()?;

    // rank 0 is the exclusive writer of the experiment tree
    let (store, logs, heartbeat, run_index) = if cluster.is_root() {
        let experiment = experiment_dir(&config.run_root, &config);
        let run_index = allocate_run_index(&experiment)?;
        let dir = run_dir(&experiment, run_index);
        let store = CheckpointStore::new(dir.clone())?;
        let logs = RunLogs::create(&dir)?;
        let heartbeat = Heartbeat::at(dir.join("heartbeat"));
        info!(experiment = %experiment.display(), run_index, "starting run");
        (Some(store), Some(logs), heartbeat, run_index)
    } else {
        (None, None, Heartbeat::disabled(), 0)
    };

    let mut ctx = TrainingContext::new(
        config.clone(),
        cluster,
        heartbeat,
        store,
        logs,
        run_index,
    );

    if config.restore_best_scores && !is_new_identity && ctx.is_root() {
        let experiment = experiment_dir(&config.run_root, &config);
        for (validset, score) in best_scores_on_disk(&experiment, &config.valid_sets) {
            info!(validset, score, "restored best score from disk");
            ctx.best.seed(&validset, score);
        }
    }

    let phases = Curriculum {
        built: &built,
        model: &mut model,
        transitions,
        train: &mut train,
        valid: &valid,
        test: &test,
        word_vocab,
        lattice: None,
    }
    .run(&mut ctx)?;

    info!(?phases, epochs = ctx.epoch, "training complete");
    Ok(())
}

fn open_sets(config: &RunConfig, names: &[String]) -> Result<Vec<(String, Box<dyn Dataset>)>> {
    names
        .iter()
        .map(|name| {
            let dataset = PreprocessedDataset::open(&config.data_dir, name)?;
            Ok((name.clone(), Box::new(dataset) as Box<dyn Dataset>))
        })
        .collect()
}
