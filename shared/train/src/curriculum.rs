use crate::engine::{EngineRun, PhaseParams};
use crate::{TrainError, TrainingContext};
use scribe_core::BuiltDictionary;
use scribe_criterion::{Criterion, CriterionKind, CriterionOptions, SharedTransitions};
use scribe_data::Dataset;
use scribe_eval::{Evaluator, LatticeDecoder, WordVocab};
use scribe_model::{AcousticModel, SgdStep, ZeroModel};
use tracing::info;

/// The up-to-three training phases, strictly ordered. Any phase with a
/// zero epoch budget is skipped; the main phase is mandatory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PhaseKind {
    Warmup,
    ForcedAlignment,
    Main,
}

impl PhaseKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseKind::Warmup => "warmup",
            PhaseKind::ForcedAlignment => "falign",
            PhaseKind::Main => "main",
        }
    }
}

/// Top-level driver: sequences the phases over the epoch engine with
/// phase-specific criteria and learning rates. The network weights and the
/// transition matrix are shared across phases, so warmup and forced
/// alignment leave their mark on the main phase.
pub struct Curriculum<'a> {
    pub built: &'a BuiltDictionary,
    pub model: &'a mut dyn AcousticModel,
    pub transitions: SharedTransitions,
    pub train: &'a mut dyn Dataset,
    pub valid: &'a [(String, Box<dyn Dataset>)],
    pub test: &'a [(String, Box<dyn Dataset>)],
    pub word_vocab: Option<WordVocab>,
    pub lattice: Option<Box<dyn LatticeDecoder>>,
}

impl Curriculum<'_> {
    /// Run all configured phases. Returns the phases that actually ran, in
    /// order.
    pub fn run(self, ctx: &mut TrainingContext) -> Result<Vec<PhaseKind>, TrainError> {
        let config = ctx.config.clone();
        config.validate()?;

        let Curriculum {
            built,
            model,
            transitions,
            train,
            valid,
            test,
            word_vocab,
            lattice,
        } = self;

        let mut evaluator = Evaluator::new(built.remap.clone(), word_vocab, lattice);
        let mut sgd = SgdStep::new(config.momentum, config.weight_decay);
        let divisor = config.batch_size.max(1) as f64;

        let mut phases = Vec::new();
        for kind in [PhaseKind::Warmup, PhaseKind::ForcedAlignment, PhaseKind::Main] {
            let (criterion_kind, epochs, lr) = match kind {
                PhaseKind::Warmup => (
                    CriterionKind::LinearSeg,
                    config.linseg_epochs,
                    config.linseg_lr.unwrap_or(config.lr),
                ),
                PhaseKind::ForcedAlignment => (
                    CriterionKind::ForceAlign,
                    config.falign_epochs,
                    config.falign_lr.unwrap_or(config.lr),
                ),
                PhaseKind::Main => {
                    let main_kind = if config.ctc {
                        CriterionKind::Ctc
                    } else if config.seg_given {
                        CriterionKind::FullConnect
                    } else if config.state_width > 1 {
                        CriterionKind::MultiState
                    } else {
                        CriterionKind::AutoSeg
                    };
                    (main_kind, config.epochs, config.lr)
                }
            };
            if epochs == 0 {
                continue;
            }

            let options = CriterionOptions {
                batch_size: config.batch_size,
                threads: config.criterion_threads,
                sentinel: built.sentinel,
                garbage: config.garbage,
                state_width: config.state_width,
                freeze_transitions: kind == PhaseKind::Warmup
                    && config.linseg_freeze_transitions,
            };
            let shared = criterion_kind
                .uses_transitions()
                .then(|| transitions.clone());
            let criterion = Criterion::new(criterion_kind, options, shared)?;

            let params = PhaseParams {
                phase: kind.as_str(),
                lr: lr / divisor,
                lr_transitions: config.lr_transitions / divisor,
                epochs,
            };
            info!(
                phase = kind.as_str(),
                criterion = ?criterion_kind,
                epochs,
                lr = params.lr,
                "starting phase"
            );

            // the warmup may train pure transitions against a placeholder
            // network while the real weights wait for the later phases
            let mut zero_model;
            let (phase_model, checkpoint_model): (
                &mut dyn AcousticModel,
                Option<&dyn AcousticModel>,
            ) = if kind == PhaseKind::Warmup && config.linseg_zero_net {
                zero_model = ZeroModel::new(model.num_classes());
                (&mut zero_model, Some(&*model))
            } else {
                (&mut *model, None)
            };

            EngineRun {
                model: phase_model,
                checkpoint_model,
                criterion: &criterion,
                transitions: &transitions,
                train: &mut *train,
                valid,
                test,
                evaluator: &mut evaluator,
                dict: &built.dict,
                remap: &built.remap,
                sgd: &mut sgd,
                params,
            }
            .run(ctx)?;

            phases.push(kind);
        }
        Ok(phases)
    }
}
