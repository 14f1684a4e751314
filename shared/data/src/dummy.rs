use crate::{DataError, Dataset, Sample};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use scribe_core::{ClassId, Matrix};

/// Synthetic dataset for tests and smoke runs: every sample is generated
/// deterministically from (seed, index), so repeated reads agree across
/// loader threads and processes.
pub struct DummyDataset {
    count: usize,
    frames: std::ops::Range<usize>,
    feature_width: usize,
    classes: usize,
    seed: u64,
}

impl DummyDataset {
    pub fn new(
        count: usize,
        frames: std::ops::Range<usize>,
        feature_width: usize,
        classes: usize,
        seed: u64,
    ) -> Self {
        assert!(classes >= 2, "need at least two classes");
        Self {
            count,
            frames,
            feature_width,
            classes,
            seed,
        }
    }

    pub fn feature_width(&self) -> usize {
        self.feature_width
    }
}

impl Dataset for DummyDataset {
    fn len(&self) -> usize {
        self.count
    }

    fn get(&self, index: usize) -> Result<Sample, DataError> {
        if index >= self.count {
            return Err(DataError::OutOfRange {
                index,
                len: self.count,
            });
        }
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed ^ (index as u64).wrapping_mul(0xd1b5));
        let frames = rng.gen_range(self.frames.clone());
        let input = Matrix::from_fn(frames, self.feature_width, |_, _| rng.gen_range(-1.0..1.0));
        let target_len = rng.gen_range(1..=frames.min(self.frames.start.max(1)));
        let target: Vec<ClassId> = (0..target_len)
            .map(|_| rng.gen_range(0..self.classes as ClassId))
            .collect();
        Ok(Sample {
            input,
            target,
            words: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn samples_are_reproducible() {
        let ds = DummyDataset::new(8, 4..10, 3, 5, 11);
        let a = ds.get(3).unwrap();
        let b = ds.get(3).unwrap();
        assert_eq!(a.input, b.input);
        assert_eq!(a.target, b.target);
        assert!(a.target.len() <= a.input.rows());
    }
}
