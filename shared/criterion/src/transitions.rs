use scribe_core::Matrix;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Learned pairwise label-to-label scores. Convention: `score(to, from)`,
/// row-indexed by destination class.
#[derive(Clone, Debug, PartialEq)]
pub struct TransitionMatrix {
    classes: usize,
    scores: Matrix,
}

impl TransitionMatrix {
    pub fn new(classes: usize) -> Self {
        Self {
            classes,
            scores: Matrix::zeros(classes, classes),
        }
    }

    pub fn from_matrix(scores: Matrix) -> Self {
        assert_eq!(scores.rows(), scores.cols(), "transitions must be square");
        Self {
            classes: scores.rows(),
            scores,
        }
    }

    pub fn classes(&self) -> usize {
        self.classes
    }

    pub fn score(&self, to: usize, from: usize) -> f32 {
        self.scores.get(to, from)
    }

    pub fn row(&self, to: usize) -> &[f32] {
        self.scores.row(to)
    }

    pub fn matrix(&self) -> &Matrix {
        &self.scores
    }

    pub fn as_slice(&self) -> &[f32] {
        self.scores.as_slice()
    }

    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        self.scores.as_mut_slice()
    }

    /// One gradient step; the only mutation path during training.
    pub fn apply_grad(&mut self, grad: &Matrix, lr: f64) {
        debug_assert_eq!(grad.rows(), self.classes);
        debug_assert_eq!(grad.cols(), self.classes);
        let step = lr as f32;
        for (w, g) in self
            .scores
            .as_mut_slice()
            .iter_mut()
            .zip(grad.as_slice().iter())
        {
            *w -= step * g;
        }
    }
}

/// Handle to the single transition matrix of a run. Created once after the
/// class count is finalized; every transition-bearing criterion variant
/// holds a clone of the same handle, so a gradient step applied through any
/// one of them is visible to all others on the next read. Writes are
/// serialized by the epoch engine's single-threaded update step; the lock
/// exists so thread-parallel batch scoring can read concurrently.
#[derive(Clone, Debug)]
pub struct SharedTransitions {
    inner: Arc<RwLock<TransitionMatrix>>,
}

impl SharedTransitions {
    pub fn new(classes: usize) -> Self {
        Self::from_matrix(TransitionMatrix::new(classes))
    }

    pub fn from_matrix(matrix: TransitionMatrix) -> Self {
        Self {
            inner: Arc::new(RwLock::new(matrix)),
        }
    }

    pub fn classes(&self) -> usize {
        self.read().classes()
    }

    pub fn read(&self) -> RwLockReadGuard<'_, TransitionMatrix> {
        self.inner.read().expect("transition lock poisoned")
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, TransitionMatrix> {
        self.inner.write().expect("transition lock poisoned")
    }

    /// Copy for checkpointing.
    pub fn snapshot(&self) -> TransitionMatrix {
        self.read().clone()
    }

    /// True when both handles view the same underlying matrix.
    pub fn shares_with(&self, other: &SharedTransitions) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grad_step_moves_against_gradient() {
        let mut trans = TransitionMatrix::new(2);
        let mut grad = Matrix::zeros(2, 2);
        grad.set(1, 0, 2.0);
        trans.apply_grad(&grad, 0.5);
        assert_eq!(trans.score(1, 0), -1.0);
        assert_eq!(trans.score(0, 1), 0.0);
    }

    #[test]
    fn clones_share_the_same_matrix() {
        let a = SharedTransitions::new(3);
        let b = a.clone();
        assert!(a.shares_with(&b));
        let mut grad = Matrix::zeros(3, 3);
        grad.set(0, 2, 1.0);
        a.write().apply_grad(&grad, 1.0);
        assert_eq!(b.read().score(0, 2), -1.0);
    }
}
