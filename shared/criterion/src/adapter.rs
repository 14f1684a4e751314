use crate::kernel;
use crate::transitions::SharedTransitions;
use scribe_core::{ClassId, Matrix};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum CriterionError {
    #[error("criterion {kind:?} requires the shared transition matrix")]
    TransitionsRequired { kind: CriterionKind },

    #[error("CTC has no transitions; none may be attached")]
    TransitionsUnsupported,

    #[error("criterion {kind:?} requires a blank/garbage class in the dictionary")]
    SentinelRequired { kind: CriterionKind },

    #[error("transitions sized for {got} classes, network emits {expected}")]
    TransitionSize { expected: usize, got: usize },

    #[error("target of {target} labels cannot align into {frames} frames")]
    TargetTooLong { frames: usize, target: usize },

    #[error("empty target sequence")]
    EmptyTarget,

    #[error("alignment of {alignment} labels does not cover {frames} frames")]
    AlignmentLength { frames: usize, alignment: usize },
}

/// The loss variants the curriculum can bind an engine run to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CriterionKind {
    /// Blank-based, transition-free.
    Ctc,
    /// Transition-based auto-segmentation; optional garbage absorption.
    AutoSeg,
    /// Exhaustive-alignment loss against an externally given segmentation.
    FullConnect,
    /// Warmup: cross-entropy on a uniform segmentation.
    LinearSeg,
    /// Cross-entropy on the best forced alignment of the target.
    ForceAlign,
    /// Full-connect over fixed-width state groups per class.
    MultiState,
}

impl CriterionKind {
    pub fn uses_transitions(&self) -> bool {
        !matches!(self, CriterionKind::Ctc)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct CriterionOptions {
    /// 0 selects the per-example variant.
    pub batch_size: usize,
    /// >1 (with batching) selects the thread-parallel sub-variant.
    pub threads: usize,
    /// Blank (CTC) or garbage class id; always the last dictionary id.
    pub sentinel: Option<ClassId>,
    /// AutoSeg garbage mode: absorb unaligned frames into the sentinel.
    pub garbage: bool,
    /// MultiState group width.
    pub state_width: usize,
    /// LinearSeg may pin the transition learning rate to zero.
    pub freeze_transitions: bool,
}

impl Default for CriterionOptions {
    fn default() -> Self {
        Self {
            batch_size: 0,
            threads: 1,
            sentinel: None,
            garbage: false,
            state_width: 1,
            freeze_transitions: false,
        }
    }
}

/// How score calls execute; fixed once at construction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Execution {
    PerExample,
    Batched { batch_size: usize },
    BatchedThreaded { batch_size: usize, threads: usize },
}

#[derive(Debug)]
pub struct Score {
    pub loss: f64,
    pub grad_output: Matrix,
    pub grad_transitions: Option<Matrix>,
}

#[derive(Clone, Copy, Debug)]
pub struct BatchItem<'a> {
    pub output: &'a Matrix,
    pub target: &'a [ClassId],
    pub scale: f32,
}

/// Uniform interface over the heterogeneous loss implementations. One
/// contract, score and decode, regardless of which variant is selected
/// and whether the workload is per-example or batched.
pub struct Criterion {
    kind: CriterionKind,
    options: CriterionOptions,
    execution: Execution,
    transitions: Option<SharedTransitions>,
}

impl Criterion {
    pub fn new(
        kind: CriterionKind,
        options: CriterionOptions,
        transitions: Option<SharedTransitions>,
    ) -> Result<Self, CriterionError> {
        match (kind.uses_transitions(), &transitions) {
            (true, None) => return Err(CriterionError::TransitionsRequired { kind }),
            (false, Some(_)) => return Err(CriterionError::TransitionsUnsupported),
            _ => {}
        }
        if matches!(kind, CriterionKind::Ctc) && options.sentinel.is_none() {
            return Err(CriterionError::SentinelRequired { kind });
        }
        if matches!(kind, CriterionKind::AutoSeg) && options.garbage && options.sentinel.is_none() {
            return Err(CriterionError::SentinelRequired { kind });
        }

        let execution = match (options.batch_size, options.threads) {
            (0, _) => Execution::PerExample,
            (batch_size, threads) if threads > 1 => Execution::BatchedThreaded {
                batch_size,
                threads,
            },
            (batch_size, _) => Execution::Batched { batch_size },
        };
        debug!(?kind, ?execution, "criterion configured");

        Ok(Self {
            kind,
            options,
            execution,
            transitions,
        })
    }

    pub fn kind(&self) -> CriterionKind {
        self.kind
    }

    pub fn execution(&self) -> Execution {
        self.execution
    }

    pub fn options(&self) -> &CriterionOptions {
        &self.options
    }

    pub fn shared_transitions(&self) -> Option<&SharedTransitions> {
        self.transitions.as_ref()
    }

    /// Score one sample. `scale` is the per-sample loss-scale factor,
    /// computed once by the engine and passed to every criterion
    /// identically.
    pub fn score(
        &self,
        output: &Matrix,
        target: &[ClassId],
        scale: f32,
    ) -> Result<Score, CriterionError> {
        match self.kind {
            CriterionKind::Ctc => {
                let blank = self.options.sentinel.expect("validated at construction");
                let (loss, grad_output) = kernel::ctc(output, target, blank, scale)?;
                Ok(Score {
                    loss,
                    grad_output,
                    grad_transitions: None,
                })
            }
            kind => {
                let shared = self.transitions.as_ref().expect("validated at construction");
                let trans = shared.read();
                if trans.classes() != output.cols() {
                    return Err(CriterionError::TransitionSize {
                        expected: output.cols(),
                        got: trans.classes(),
                    });
                }
                let (loss, grad_output, grad_transitions) = match kind {
                    CriterionKind::AutoSeg => {
                        let garbage = self.options.garbage.then(|| {
                            self.options.sentinel.expect("validated at construction")
                        });
                        kernel::asg(output, target, &trans, garbage, scale)?
                    }
                    CriterionKind::FullConnect => {
                        kernel::full_connect(output, target, &trans, scale)?
                    }
                    CriterionKind::LinearSeg => {
                        let alignment = kernel::uniform_alignment(output.rows(), target)?;
                        kernel::path_cross_entropy(
                            output,
                            &trans,
                            &alignment,
                            scale,
                            !self.options.freeze_transitions,
                        )?
                    }
                    CriterionKind::ForceAlign => {
                        let alignment = kernel::forced_alignment(output, &trans, target)?;
                        kernel::path_cross_entropy(output, &trans, &alignment, scale, true)?
                    }
                    CriterionKind::MultiState => kernel::multi_state(
                        output,
                        target,
                        &trans,
                        self.options.state_width,
                        scale,
                    )?,
                    CriterionKind::Ctc => unreachable!(),
                };
                Ok(Score {
                    loss,
                    grad_output,
                    grad_transitions: Some(grad_transitions),
                })
            }
        }
    }

    /// Score a batch under the execution mode fixed at construction.
    /// Thread workers only read the shared transitions; applying updates
    /// stays with the single-threaded engine.
    pub fn score_batch(&self, items: &[BatchItem<'_>]) -> Result<Vec<Score>, CriterionError> {
        match self.execution {
            Execution::BatchedThreaded { threads, .. } if items.len() > 1 => {
                let chunk = items.len().div_ceil(threads);
                let mut results: Vec<Option<Result<Vec<Score>, CriterionError>>> =
                    (0..items.chunks(chunk).count()).map(|_| None).collect();
                std::thread::scope(|scope| {
                    for (slot, chunk_items) in results.iter_mut().zip(items.chunks(chunk)) {
                        scope.spawn(move || {
                            *slot = Some(
                                chunk_items
                                    .iter()
                                    .map(|item| self.score(item.output, item.target, item.scale))
                                    .collect(),
                            );
                        });
                    }
                });
                let mut scores = Vec::with_capacity(items.len());
                for slot in results {
                    scores.extend(slot.expect("scoring thread finished")?);
                }
                Ok(scores)
            }
            _ => items
                .iter()
                .map(|item| self.score(item.output, item.target, item.scale))
                .collect(),
        }
    }

    /// Greedy Viterbi label path, consecutive duplicates collapsed. The
    /// sentinel class (if any) is left in place for the evaluator's remap
    /// to drop.
    pub fn decode(&self, output: &Matrix) -> Vec<ClassId> {
        let path = match self.kind {
            CriterionKind::Ctc => kernel::viterbi(output, None),
            CriterionKind::MultiState => {
                let shared = self.transitions.as_ref().expect("validated at construction");
                let width = self.options.state_width as ClassId;
                kernel::viterbi(output, Some(&shared.read()))
                    .into_iter()
                    .map(|state| state / width)
                    .collect()
            }
            _ => {
                let shared = self.transitions.as_ref().expect("validated at construction");
                kernel::viterbi(output, Some(&shared.read()))
            }
        };
        collapse_runs(path)
    }

    /// The single write path into the shared matrix. A zero learning rate
    /// (or a frozen LinearSeg) leaves it untouched.
    pub fn apply_transition_update(&self, grad: &Matrix, lr: f64) {
        if lr == 0.0 || self.options.freeze_transitions {
            return;
        }
        if let Some(shared) = &self.transitions {
            shared.write().apply_grad(grad, lr);
        }
    }
}

fn collapse_runs(path: Vec<ClassId>) -> Vec<ClassId> {
    let mut out: Vec<ClassId> = Vec::with_capacity(path.len());
    for label in path {
        if out.last() != Some(&label) {
            out.push(label);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> CriterionOptions {
        CriterionOptions {
            sentinel: Some(3),
            ..Default::default()
        }
    }

    #[test]
    fn batch_size_zero_selects_per_example() {
        let c = Criterion::new(CriterionKind::AutoSeg, options(), Some(SharedTransitions::new(4)))
            .unwrap();
        assert_eq!(c.execution(), Execution::PerExample);
    }

    #[test]
    fn batching_and_threads_select_subvariants() {
        let mut opts = options();
        opts.batch_size = 8;
        let c = Criterion::new(
            CriterionKind::AutoSeg,
            opts,
            Some(SharedTransitions::new(4)),
        )
        .unwrap();
        assert_eq!(c.execution(), Execution::Batched { batch_size: 8 });

        opts.threads = 4;
        let c = Criterion::new(
            CriterionKind::AutoSeg,
            opts,
            Some(SharedTransitions::new(4)),
        )
        .unwrap();
        assert_eq!(
            c.execution(),
            Execution::BatchedThreaded {
                batch_size: 8,
                threads: 4
            }
        );
    }

    #[test]
    fn ctc_rejects_transitions_and_others_require_them() {
        assert!(matches!(
            Criterion::new(CriterionKind::Ctc, options(), Some(SharedTransitions::new(4))),
            Err(CriterionError::TransitionsUnsupported)
        ));
        assert!(matches!(
            Criterion::new(CriterionKind::AutoSeg, options(), None),
            Err(CriterionError::TransitionsRequired { .. })
        ));
    }

    #[test]
    fn transition_update_through_one_variant_is_seen_by_another() {
        let shared = SharedTransitions::new(4);
        let a = Criterion::new(CriterionKind::AutoSeg, options(), Some(shared.clone())).unwrap();
        let b = Criterion::new(CriterionKind::LinearSeg, options(), Some(shared.clone())).unwrap();

        let mut grad = Matrix::zeros(4, 4);
        grad.set(2, 1, 4.0);
        a.apply_transition_update(&grad, 0.25);

        let seen = b.shared_transitions().unwrap().read().score(2, 1);
        assert_eq!(seen, -1.0);
        assert!(a.shared_transitions().unwrap().shares_with(&shared));
    }

    #[test]
    fn frozen_linear_seg_never_writes_transitions() {
        let shared = SharedTransitions::new(4);
        let mut opts = options();
        opts.freeze_transitions = true;
        let c = Criterion::new(CriterionKind::LinearSeg, opts, Some(shared.clone())).unwrap();
        let mut grad = Matrix::zeros(4, 4);
        grad.set(0, 0, 1.0);
        c.apply_transition_update(&grad, 1.0);
        assert_eq!(shared.read().score(0, 0), 0.0);
    }

    #[test]
    fn decode_collapses_runs() {
        let shared = SharedTransitions::new(3);
        let c = Criterion::new(
            CriterionKind::AutoSeg,
            CriterionOptions::default(),
            Some(shared),
        )
        .unwrap();
        let output = Matrix::from_fn(5, 3, |t, cls| {
            let want = [0, 0, 1, 1, 2][t];
            if cls == want { 4.0 } else { -4.0 }
        });
        assert_eq!(c.decode(&output), vec![0, 1, 2]);
    }

    #[test]
    fn threaded_batch_matches_sequential() {
        let shared = SharedTransitions::new(4);
        let mut opts = options();
        opts.batch_size = 4;
        opts.threads = 2;
        let threaded =
            Criterion::new(CriterionKind::AutoSeg, opts, Some(shared.clone())).unwrap();
        let sequential =
            Criterion::new(CriterionKind::AutoSeg, options(), Some(shared)).unwrap();

        let outputs: Vec<Matrix> = (0..4)
            .map(|i| Matrix::from_fn(6, 4, |t, c| ((t + c + i) % 3) as f32 - 1.0))
            .collect();
        let targets: Vec<Vec<ClassId>> = vec![vec![0, 1], vec![2], vec![1, 2, 0], vec![3, 1]];
        let items: Vec<BatchItem> = outputs
            .iter()
            .zip(&targets)
            .map(|(output, target)| BatchItem {
                output,
                target,
                scale: 1.0,
            })
            .collect();

        let a = threaded.score_batch(&items).unwrap();
        let b = sequential.score_batch(&items).unwrap();
        for (x, y) in a.iter().zip(&b) {
            assert!((x.loss - y.loss).abs() < 1e-9);
            assert_eq!(x.grad_output, y.grad_output);
        }
    }
}
