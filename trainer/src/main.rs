use anyhow::Result;
use clap::{Parser, Subcommand};
use scribe_checkpoint::StartMode;
use std::path::PathBuf;
use tracing::info;

mod app;
mod cli;
mod logging;

#[derive(Parser, Debug)]
#[command(name = "scribe-trainer", version, about = "Staged-curriculum acoustic model trainer")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start a fresh experiment from the given options.
    Train {
        #[clap(flatten)]
        args: cli::TrainArgs,
    },
    /// Resume the newest checkpointed run of an existing experiment.
    Continue {
        /// The experiment directory (root/<name>).
        experiment_dir: PathBuf,

        #[clap(flatten)]
        args: cli::TrainArgs,
    },
    /// Branch a new experiment from an existing model checkpoint.
    Fork {
        /// A model_*.safetensors file (sidecar json expected next to it).
        model_file: PathBuf,

        #[clap(flatten)]
        args: cli::TrainArgs,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let (mode, args) = match &cli.command {
        Commands::Train { args } => (StartMode::Fresh, args),
        Commands::Continue {
            experiment_dir,
            args,
        } => (StartMode::Continue(experiment_dir.clone()), args),
        Commands::Fork { model_file, args } => (StartMode::Fork(model_file.clone()), args),
    };

    let _log_guard = logging::init(args.logs, args.write_log.as_deref())?;
    info!(
        "============ scribe-trainer startup (rank {} of {}) ============",
        args.rank, args.world_size
    );
    app::run(mode, args)
}
