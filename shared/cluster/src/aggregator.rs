use crate::{ClusterCoordinator, ClusterError};
use std::sync::Arc;

/// Scalar reduction across workers, layered over the coordinator.
#[derive(Clone)]
pub struct MetricAggregator {
    cluster: Arc<dyn ClusterCoordinator>,
}

impl MetricAggregator {
    pub fn new(cluster: Arc<dyn ClusterCoordinator>) -> Self {
        Self { cluster }
    }

    pub fn mean(&self, value: f64) -> Result<f64, ClusterError> {
        let mut buf = [value as f32];
        self.cluster.all_reduce_mean(&mut buf)?;
        Ok(buf[0] as f64)
    }

    pub fn sum(&self, value: f64) -> Result<f64, ClusterError> {
        Ok(self.mean(value)? * self.cluster.world_size() as f64)
    }
}
