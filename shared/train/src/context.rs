use crate::TrainError;
use scribe_checkpoint::{BestTracker, CheckpointStore};
use scribe_cluster::{ClusterCoordinator, MetricAggregator};
use scribe_core::{EditDistanceMeter, RunConfig, RunningAverage, TimerSet};
use std::path::PathBuf;
use std::sync::Arc;

pub const TIMER_RUNTIME: &str = "runtime";
pub const TIMER_SAMPLER: &str = "sampler";
pub const TIMER_NETWORK: &str = "network";
pub const TIMER_CRITERION: &str = "criterion";
pub const TIMER_OPTIMIZER: &str = "optimizer";

pub const TIMER_NAMES: [&str; 5] = [
    TIMER_RUNTIME,
    TIMER_SAMPLER,
    TIMER_NETWORK,
    TIMER_CRITERION,
    TIMER_OPTIMIZER,
];

/// Per-phase accumulators. Reset at phase start and at every epoch
/// boundary; never shared across phases.
pub struct Meters {
    pub timers: TimerSet,
    pub loss: RunningAverage,
    pub train_edit: EditDistanceMeter,
}

impl Meters {
    pub fn new() -> Self {
        Self {
            timers: TimerSet::new(&TIMER_NAMES),
            loss: RunningAverage::new(),
            train_edit: EditDistanceMeter::new(),
        }
    }

    pub fn reset(&mut self) {
        self.timers.reset_all();
        self.loss.reset();
        self.train_edit.reset();
    }
}

impl Default for Meters {
    fn default() -> Self {
        Self::new()
    }
}

/// Liveness file rewritten once per sample. An external monitoring signal,
/// never a control channel.
pub struct Heartbeat {
    path: Option<PathBuf>,
}

impl Heartbeat {
    pub fn at(path: PathBuf) -> Self {
        Self { path: Some(path) }
    }

    pub fn disabled() -> Self {
        Self { path: None }
    }

    pub fn touch(&self, epoch: usize, sample: usize) -> Result<(), TrainError> {
        if let Some(path) = &self.path {
            std::fs::write(path, format!("{epoch} {sample}\n")).map_err(|source| {
                TrainError::Io {
                    path: path.clone(),
                    source,
                }
            })?;
        }
        Ok(())
    }
}

/// Explicit run state threaded by reference through the epoch engine and
/// its stages; nothing lives in ambient captures. Rank 0 is the only rank
/// holding a checkpoint store, log writers, or a heartbeat path.
pub struct TrainingContext {
    pub config: Arc<RunConfig>,
    pub cluster: Arc<dyn ClusterCoordinator>,
    pub aggregator: MetricAggregator,
    pub meters: Meters,
    pub heartbeat: Heartbeat,
    pub best: BestTracker,
    pub store: Option<CheckpointStore>,
    pub logs: Option<crate::RunLogs>,
    pub run_index: u32,
    /// Global epoch counter across all phases of the run.
    pub epoch: usize,
    /// Set once the first-epoch parameter broadcast has happened.
    pub synced: bool,
}

impl TrainingContext {
    pub fn new(
        config: Arc<RunConfig>,
        cluster: Arc<dyn ClusterCoordinator>,
        heartbeat: Heartbeat,
        store: Option<CheckpointStore>,
        logs: Option<crate::RunLogs>,
        run_index: u32,
    ) -> Self {
        let aggregator = MetricAggregator::new(cluster.clone());
        Self {
            config,
            cluster,
            aggregator,
            meters: Meters::new(),
            heartbeat,
            best: BestTracker::new(),
            store,
            logs,
            run_index,
            epoch: 0,
            synced: false,
        }
    }

    pub fn is_root(&self) -> bool {
        self.cluster.is_root()
    }
}
