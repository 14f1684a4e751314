use crate::TrainError;
use crate::context::{
    TIMER_CRITERION, TIMER_NETWORK, TIMER_OPTIMIZER, TIMER_RUNTIME, TIMER_SAMPLER,
    TrainingContext,
};
use indicatif::{ProgressBar, ProgressStyle};
use scribe_checkpoint::{CheckpointKind, CheckpointPayload, Provenance};
use scribe_cluster::ClusterCoordinator;
use scribe_core::{Dictionary, LabelRemap, Matrix};
use scribe_criterion::{BatchItem, Criterion, SharedTransitions};
use scribe_data::{Dataset, Loader, Sample, shuffled_order};
use scribe_eval::{EvalReport, Evaluator};
use scribe_model::{AcousticModel, SgdStep, zero_grads};
use std::ops::ControlFlow;
use tracing::{debug, info_span, trace};

const PROGRESS_TEMPLATE: &str =
    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}";

/// The fixed per-update stage order. In per-example mode every stage fires
/// once per sample; with batching the last three fire once per gradient
/// step. What each stage may read and mutate:
///
/// - `SampleFetched`: progress indicator, liveness heartbeat.
/// - `ForwardComputed`: network forward; periodic buffer reclamation;
///   sub-sampled train-side edit distance.
/// - `CriterionBackward`: criterion scoring + network backward; loss meter.
/// - `GradientsReady`: cross-worker gradient averaging (before any local
///   step), clamping, momentum/weight-decay update, transition update.
/// - `ParametersUpdated`: gradient zeroing, timer handoff back to the
///   sampler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    SampleFetched,
    ForwardComputed,
    CriterionBackward,
    GradientsReady,
    ParametersUpdated,
}

pub const STAGE_ORDER: [Stage; 5] = [
    Stage::SampleFetched,
    Stage::ForwardComputed,
    Stage::CriterionBackward,
    Stage::GradientsReady,
    Stage::ParametersUpdated,
];

/// Learning rates and epoch budget for one curriculum phase.
#[derive(Clone, Copy, Debug)]
pub struct PhaseParams {
    pub phase: &'static str,
    pub lr: f64,
    pub lr_transitions: f64,
    pub epochs: usize,
}

/// One complete engine run: a network, one criterion, the dataset
/// iterators, and a learning-rate pair. The curriculum controller builds
/// one of these per phase.
pub struct EngineRun<'a> {
    pub model: &'a mut dyn AcousticModel,
    /// Weights to persist in checkpoints when `model` is a stand-in (the
    /// warmup zero network): checkpoints always carry the real, pristine
    /// network.
    pub checkpoint_model: Option<&'a dyn AcousticModel>,
    pub criterion: &'a Criterion,
    /// The run-level transition matrix; persisted in every checkpoint even
    /// when the active criterion (CTC) doesn't use it.
    pub transitions: &'a SharedTransitions,
    pub train: &'a mut dyn Dataset,
    pub valid: &'a [(String, Box<dyn Dataset>)],
    pub test: &'a [(String, Box<dyn Dataset>)],
    pub evaluator: &'a mut Evaluator,
    pub dict: &'a Dictionary,
    pub remap: &'a LabelRemap,
    pub sgd: &'a mut SgdStep,
    pub params: PhaseParams,
}

struct PendingSample {
    sample: Sample,
    output: Matrix,
    scale: f32,
}

impl EngineRun<'_> {
    pub fn run(self, ctx: &mut TrainingContext) -> Result<(), TrainError> {
        let EngineRun {
            model,
            checkpoint_model,
            criterion,
            transitions,
            train,
            valid,
            test,
            evaluator,
            dict,
            remap,
            sgd,
            params,
        } = self;
        let _span = info_span!("phase", phase = params.phase).entered();
        let config = ctx.config.clone();

        let loader = Loader {
            threads: config.loader_threads.max(1),
            prefetch: 4,
            max_input_frames: config.max_input_frames,
            max_target_len: config.max_target_len,
        };
        let batch = config.batch_size.max(1);

        for _ in 0..params.epochs {
            ctx.epoch += 1;
            let epoch = ctx.epoch;
            ctx.meters.reset();
            ctx.meters.timers.resume(TIMER_RUNTIME);

            // workers converge to rank-0 weights once, before any step
            if !ctx.synced {
                if ctx.cluster.world_size() > 1 {
                    broadcast_parameters(&*ctx.cluster, model, transitions)?;
                    debug!("initial parameter broadcast complete");
                }
                ctx.synced = true;
            }

            let order: Vec<usize> = if config.no_resample {
                (0..train.len()).collect()
            } else {
                train.resample(epoch);
                shuffled_order(train.len(), config.seed, epoch)
            };

            let progress = if ctx.is_root() {
                let bar = ProgressBar::new(order.len() as u64);
                if let Ok(style) = ProgressStyle::with_template(PROGRESS_TEMPLATE) {
                    bar.set_style(style);
                }
                bar.set_message(format!("epoch {epoch} [{}]", params.phase));
                bar
            } else {
                ProgressBar::hidden()
            };

            let mut pending: Vec<PendingSample> = Vec::with_capacity(batch);
            let mut step_error: Option<TrainError> = None;

            ctx.meters.timers.resume(TIMER_SAMPLER);
            loader.run(&*train, &order, |position, sample| {
                let step = sample_step(
                    ctx, model, criterion, sgd, remap, &progress, &mut pending, params, batch,
                    epoch, position, sample,
                );
                match step {
                    Ok(()) => ControlFlow::Continue(()),
                    Err(e) => {
                        step_error = Some(e);
                        ControlFlow::Break(())
                    }
                }
            })?;
            if let Some(e) = step_error {
                return Err(e);
            }
            // trailing partial batch
            apply_update(ctx, model, criterion, sgd, &mut pending, params)?;
            ctx.meters.timers.pause(TIMER_SAMPLER);
            progress.finish_and_clear();

            // epoch end: evaluate every held-out set, log, checkpoint, reset
            let mut valid_reports: Vec<(String, EvalReport)> = Vec::new();
            for (name, dataset) in valid {
                let report = evaluator.run(&mut *model, criterion, dataset.as_ref(), dict)?;
                valid_reports.push((name.clone(), report));
            }
            let mut test_reports: Vec<(String, EvalReport)> = Vec::new();
            for (name, dataset) in test {
                let report = evaluator.run(&mut *model, criterion, dataset.as_ref(), dict)?;
                test_reports.push((name.clone(), report));
            }

            ctx.meters.timers.pause(TIMER_RUNTIME);
            let loss = ctx.aggregator.mean(ctx.meters.loss.value())?;
            epoch_logs(ctx, params, epoch, loss, &valid_reports, &test_reports)?;
            let persisted: &dyn AcousticModel = checkpoint_model.unwrap_or(&*model);
            epoch_checkpoints(ctx, persisted, transitions, &valid_reports)?;
            ctx.meters.reset();
        }
        Ok(())
    }
}

/// Per-sample half of the stage sequence; flushes a full batch through the
/// update half.
#[allow(clippy::too_many_arguments)]
fn sample_step(
    ctx: &mut TrainingContext,
    model: &mut dyn AcousticModel,
    criterion: &Criterion,
    sgd: &mut SgdStep,
    remap: &LabelRemap,
    progress: &ProgressBar,
    pending: &mut Vec<PendingSample>,
    params: PhaseParams,
    batch: usize,
    epoch: usize,
    position: usize,
    sample: Sample,
) -> Result<(), TrainError> {
    let config = ctx.config.clone();
    for stage in [Stage::SampleFetched, Stage::ForwardComputed] {
        match stage {
            Stage::SampleFetched => {
                ctx.meters.timers.pause(TIMER_SAMPLER);
                progress.inc(1);
                ctx.heartbeat.touch(epoch, position)?;
            }
            Stage::ForwardComputed => {
                ctx.meters.timers.resume(TIMER_NETWORK);
                let output = model.forward(&sample.input);
                ctx.meters.timers.pause(TIMER_NETWORK);

                if config.reclaim_every > 0 && position > 0 && position % config.reclaim_every == 0
                {
                    // periodic reclamation of per-step scratch allocations
                    pending.shrink_to_fit();
                    trace!(position, "reclaimed step buffers");
                }
                if config.train_edit_every > 0 && position % config.train_edit_every == 0 {
                    let decoded = remap.apply(&criterion.decode(&output));
                    let reference = remap.apply(&sample.target);
                    ctx.meters.train_edit.update(&decoded, &reference);
                }

                let scale = config
                    .loss_scale
                    .factor(sample.input.rows(), sample.target.len());
                pending.push(PendingSample {
                    sample,
                    output,
                    scale,
                });
                return if pending.len() >= batch {
                    apply_update(ctx, model, criterion, sgd, pending, params)?;
                    ctx.meters.timers.resume(TIMER_SAMPLER);
                    Ok(())
                } else {
                    ctx.meters.timers.resume(TIMER_SAMPLER);
                    Ok(())
                };
            }
            _ => unreachable!("update stages run in apply_update"),
        }
    }
    Ok(())
}

/// Update half of the stage sequence, fired once per gradient step.
fn apply_update(
    ctx: &mut TrainingContext,
    model: &mut dyn AcousticModel,
    criterion: &Criterion,
    sgd: &mut SgdStep,
    pending: &mut Vec<PendingSample>,
    params: PhaseParams,
) -> Result<(), TrainError> {
    if pending.is_empty() {
        return Ok(());
    }
    let mut transition_grad: Option<Matrix> = None;

    for stage in [
        Stage::CriterionBackward,
        Stage::GradientsReady,
        Stage::ParametersUpdated,
    ] {
        match stage {
            Stage::CriterionBackward => {
                ctx.meters.timers.resume(TIMER_CRITERION);
                let items: Vec<BatchItem> = pending
                    .iter()
                    .map(|p| BatchItem {
                        output: &p.output,
                        target: &p.sample.target,
                        scale: p.scale,
                    })
                    .collect();
                let scores = criterion.score_batch(&items)?;
                drop(items);
                ctx.meters.timers.handoff(TIMER_CRITERION, TIMER_NETWORK);
                for (p, score) in pending.iter().zip(scores) {
                    ctx.meters.loss.add(score.loss);
                    model.backward(&p.sample.input, &score.grad_output);
                    if let Some(grad) = score.grad_transitions {
                        match &mut transition_grad {
                            Some(acc) => {
                                for (a, g) in
                                    acc.as_mut_slice().iter_mut().zip(grad.as_slice())
                                {
                                    *a += g;
                                }
                            }
                            None => transition_grad = Some(grad),
                        }
                    }
                }
                ctx.meters.timers.handoff(TIMER_NETWORK, TIMER_OPTIMIZER);
            }
            Stage::GradientsReady => {
                // average across all workers before any local optimizer step
                if ctx.cluster.world_size() > 1 {
                    for var in model.variables_mut() {
                        ctx.cluster.all_reduce_mean(&mut var.grad)?;
                    }
                    if let Some(grad) = &mut transition_grad {
                        ctx.cluster.all_reduce_mean(grad.as_mut_slice())?;
                    }
                }
                sgd.apply(model.variables_mut(), params.lr, ctx.config.clamp);
                if let Some(grad) = &transition_grad {
                    criterion.apply_transition_update(grad, params.lr_transitions);
                }
            }
            Stage::ParametersUpdated => {
                zero_grads(model.variables_mut());
                ctx.meters.timers.pause(TIMER_OPTIMIZER);
                pending.clear();
            }
            _ => unreachable!("fetch stages run in sample_step"),
        }
    }
    Ok(())
}

fn broadcast_parameters(
    cluster: &dyn ClusterCoordinator,
    model: &mut dyn AcousticModel,
    transitions: &SharedTransitions,
) -> Result<(), TrainError> {
    for var in model.variables_mut() {
        cluster.broadcast(&mut var.data)?;
    }
    cluster.broadcast(transitions.write().as_mut_slice())?;
    Ok(())
}

fn epoch_logs(
    ctx: &mut TrainingContext,
    params: PhaseParams,
    epoch: usize,
    loss: f64,
    valid_reports: &[(String, EvalReport)],
    test_reports: &[(String, EvalReport)],
) -> Result<(), TrainError> {
    let train_edit = ctx.meters.train_edit.value();
    let has_train_edit = ctx.config.train_edit_every > 0;
    let runtime = ctx.meters.timers.elapsed(TIMER_RUNTIME).as_secs_f64();

    let Some(logs) = ctx.logs.as_mut() else {
        return Ok(());
    };

    let mut line = format!("epoch {epoch:03} | phase {} | loss {loss:.4}", params.phase);
    if has_train_edit {
        line.push_str(&format!(" | train-err {train_edit:.2}"));
    }
    for (name, report) in valid_reports.iter().chain(test_reports) {
        line.push_str(&format!(" | {name}-err {:.2}", report.letter_err));
        if let Some(wer) = report.word_err {
            line.push_str(&format!(" | {name}-wer {wer:.2}"));
        }
        if let Some(wer) = report.decoder_word_err {
            line.push_str(&format!(" | {name}-dwer {wer:.2}"));
        }
    }
    line.push_str(&format!(" | {runtime:.1}s"));
    logs.status_line(&line)?;

    let mut names: Vec<String> = vec!["epoch".into(), "loss".into(), "train-err".into()];
    let mut values: Vec<f64> = vec![epoch as f64, loss, train_edit];
    for (name, report) in valid_reports.iter().chain(test_reports) {
        names.push(format!("{name}-err"));
        values.push(report.letter_err);
    }
    for timer in [
        TIMER_RUNTIME,
        TIMER_SAMPLER,
        TIMER_NETWORK,
        TIMER_CRITERION,
        TIMER_OPTIMIZER,
    ] {
        names.push(format!("{timer}-s"));
        values.push(ctx.meters.timers.elapsed(timer).as_secs_f64());
    }
    let fields: Vec<(&str, f64)> = names
        .iter()
        .map(String::as_str)
        .zip(values.iter().copied())
        .collect();
    logs.perf_row(&fields)
}

fn epoch_checkpoints(
    ctx: &mut TrainingContext,
    model: &dyn AcousticModel,
    transitions: &SharedTransitions,
    valid_reports: &[(String, EvalReport)],
) -> Result<(), TrainError> {
    let Some(store) = &ctx.store else {
        return Ok(());
    };
    let mut payload = CheckpointPayload {
        config: (*ctx.config).clone(),
        arch: model.arch(),
        weights: model.variables().to_vec(),
        transitions: transitions.snapshot(),
        score: None,
        provenance: Provenance {
            run_index: ctx.run_index,
            saved_at: chrono::Utc::now(),
        },
    };
    store.save(&CheckpointKind::Last, &payload)?;

    for (name, report) in valid_reports {
        if ctx.best.observe(name, report.letter_err) {
            payload.score = Some(report.letter_err);
            store.save(&CheckpointKind::Best(name.clone()), &payload)?;
            payload.score = None;
        }
    }
    Ok(())
}
