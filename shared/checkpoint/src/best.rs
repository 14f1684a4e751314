use std::collections::HashMap;
use tracing::debug;

/// Per-validation-set minimum-error table. Lives in process memory for the
/// run's lifetime; whether it is re-seeded from disk on resume is the
/// caller's policy (`restore_best_scores`).
#[derive(Debug, Default)]
pub struct BestTracker {
    minimums: HashMap<String, f64>,
}

impl BestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a score; returns true iff it strictly improves on the best
    /// ever seen for this validation set (ties do not count).
    pub fn observe(&mut self, validset: &str, score: f64) -> bool {
        match self.minimums.get_mut(validset) {
            Some(best) if score < *best => {
                debug!(validset, score, previous = *best, "new best score");
                *best = score;
                true
            }
            Some(_) => false,
            None => {
                self.minimums.insert(validset.to_string(), score);
                true
            }
        }
    }

    /// Pre-load a known best (resume with `restore_best_scores`).
    pub fn seed(&mut self, validset: &str, score: f64) {
        let entry = self
            .minimums
            .entry(validset.to_string())
            .or_insert(f64::INFINITY);
        *entry = entry.min(score);
    }

    pub fn best(&self, validset: &str) -> Option<f64> {
        self.minimums.get(validset).copied()
    }
}
