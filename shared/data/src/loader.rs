use crate::{DataError, Dataset, Sample};
use std::ops::ControlFlow;
use tracing::{debug, warn};

/// What one epoch's worth of loading actually delivered.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EpochDataStats {
    pub delivered: usize,
    pub skipped_input: usize,
    pub skipped_target: usize,
    pub stopped_early: bool,
}

/// Fixed-size pool of background workers prefetching samples over bounded
/// flume channels. Workers only produce samples; they never touch training
/// state. Delivery order follows `order` exactly: worker `w` fetches the
/// positions congruent to `w`, and the consumer round-robins across the
/// per-worker channels.
///
/// Oversized samples are skipped and counted, never fatal: degradation is
/// the data layer's contract. Real read errors abort the epoch.
#[derive(Debug, Clone, Copy)]
pub struct Loader {
    pub threads: usize,
    pub prefetch: usize,
    pub max_input_frames: usize,
    pub max_target_len: usize,
}

impl Loader {
    pub fn run(
        &self,
        dataset: &dyn Dataset,
        order: &[usize],
        mut consume: impl FnMut(usize, Sample) -> ControlFlow<()>,
    ) -> Result<EpochDataStats, DataError> {
        let threads = self.threads.max(1);
        let mut stats = EpochDataStats::default();

        let mut result: Result<(), DataError> = Ok(());
        std::thread::scope(|scope| {
            let mut receivers = Vec::with_capacity(threads);
            for worker in 0..threads {
                let (tx, rx) = flume::bounded::<(usize, Result<Sample, DataError>)>(
                    self.prefetch.max(1),
                );
                receivers.push(rx);
                let indices: Vec<(usize, usize)> = order
                    .iter()
                    .copied()
                    .enumerate()
                    .skip(worker)
                    .step_by(threads)
                    .collect();
                scope.spawn(move || {
                    for (position, index) in indices {
                        let sample = dataset.get(index);
                        let failed = sample.is_err();
                        if tx.send((position, sample)).is_err() || failed {
                            return;
                        }
                    }
                });
            }

            'delivery: for position in 0..order.len() {
                let rx = &receivers[position % threads];
                let (got_position, sample) = match rx.recv() {
                    Ok(pair) => pair,
                    // worker exited after a send failure; its error already
                    // came through on an earlier recv
                    Err(_) => break,
                };
                debug_assert_eq!(got_position, position);
                let sample = match sample {
                    Ok(sample) => sample,
                    Err(e) => {
                        result = Err(e);
                        break;
                    }
                };
                if sample.input.rows() > self.max_input_frames {
                    stats.skipped_input += 1;
                    continue;
                }
                if sample.target.len() > self.max_target_len {
                    stats.skipped_target += 1;
                    continue;
                }
                stats.delivered += 1;
                if consume(position, sample).is_break() {
                    stats.stopped_early = true;
                    break 'delivery;
                }
            }
            // dropping the receivers unblocks any worker parked on send
            drop(receivers);
        });
        result?;

        if stats.skipped_input + stats.skipped_target > 0 {
            warn!(
                skipped_input = stats.skipped_input,
                skipped_target = stats.skipped_target,
                "skipped oversized samples this epoch"
            );
        }
        debug!(delivered = stats.delivered, "epoch data pass complete");
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DummyDataset;

    fn loader(threads: usize) -> Loader {
        Loader {
            threads,
            prefetch: 2,
            max_input_frames: usize::MAX,
            max_target_len: usize::MAX,
        }
    }

    #[test]
    fn delivers_in_order_across_workers() {
        let ds = DummyDataset::new(17, 4..8, 3, 5, 0);
        let order: Vec<usize> = (0..17).rev().collect();
        let mut seen = Vec::new();
        let stats = loader(4)
            .run(&ds, &order, |position, _| {
                seen.push(position);
                ControlFlow::Continue(())
            })
            .unwrap();
        assert_eq!(seen, (0..17).collect::<Vec<_>>());
        assert_eq!(stats.delivered, 17);
        assert!(!stats.stopped_early);
    }

    #[test]
    fn oversized_samples_are_skipped_not_fatal() {
        let ds = DummyDataset::new(10, 4..8, 3, 5, 0);
        let order: Vec<usize> = (0..10).collect();
        let mut loader = loader(2);
        loader.max_input_frames = 5;
        let stats = loader
            .run(&ds, &order, |_, sample| {
                assert!(sample.input.rows() <= 5);
                ControlFlow::Continue(())
            })
            .unwrap();
        assert_eq!(stats.delivered + stats.skipped_input, 10);
    }

    #[test]
    fn consumer_can_stop_early() {
        let ds = DummyDataset::new(50, 4..8, 3, 5, 0);
        let order: Vec<usize> = (0..50).collect();
        let mut count = 0;
        let stats = loader(3)
            .run(&ds, &order, |_, _| {
                count += 1;
                if count == 5 {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            })
            .unwrap();
        assert!(stats.stopped_early);
        assert_eq!(stats.delivered, 5);
    }

    #[test]
    fn out_of_range_read_is_fatal() {
        let ds = DummyDataset::new(3, 4..8, 3, 5, 0);
        let order = vec![0, 99, 1];
        let got = loader(1).run(&ds, &order, |_, _| ControlFlow::Continue(()));
        assert!(matches!(got, Err(DataError::OutOfRange { .. })));
    }
}
