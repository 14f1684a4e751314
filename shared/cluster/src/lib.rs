mod aggregator;
mod tcp;

pub use aggregator::MetricAggregator;
pub use tcp::TcpCluster;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("failed to bind coordinator listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to reach coordinator at {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("peer i/o failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol mismatch: expected {expected}, got {got}")]
    Protocol { expected: String, got: String },

    #[error("expected {expected} peers, got {got}")]
    PeerCount { expected: usize, got: usize },
}

/// Distributed data-parallel capability. Selected once at startup (a
/// single-process no-op or the TCP implementation) and never branched on
/// inline. All collective calls are blocking synchronization points: every
/// worker must reach them in the same order.
pub trait ClusterCoordinator: Send + Sync {
    fn rank(&self) -> usize;
    fn world_size(&self) -> usize;

    /// Element-wise mean across all workers, in place on every worker.
    fn all_reduce_mean(&self, values: &mut [f32]) -> Result<(), ClusterError>;

    /// Overwrite `values` with rank 0's buffer on every worker.
    fn broadcast(&self, values: &mut [f32]) -> Result<(), ClusterError>;

    fn barrier(&self) -> Result<(), ClusterError>;

    fn is_root(&self) -> bool {
        self.rank() == 0
    }
}

/// No-op coordinator for non-distributed runs.
#[derive(Debug, Default)]
pub struct SingleProcess;

impl ClusterCoordinator for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn all_reduce_mean(&self, _values: &mut [f32]) -> Result<(), ClusterError> {
        Ok(())
    }

    fn broadcast(&self, _values: &mut [f32]) -> Result<(), ClusterError> {
        Ok(())
    }

    fn barrier(&self) -> Result<(), ClusterError> {
        Ok(())
    }
}
