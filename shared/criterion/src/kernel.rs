//! Forward-backward scoring kernels for the alignment criteria. Everything
//! here is pure: scores in, (loss, gradients) out. Transition matrices are
//! only ever read; applying transition updates is the adapter's job.

use crate::CriterionError;
use crate::transitions::TransitionMatrix;
use scribe_core::{ClassId, Matrix};

const NEG_INF: f32 = f32::NEG_INFINITY;

fn logadd2(a: f32, b: f32) -> f32 {
    if a == NEG_INF {
        return b;
    }
    if b == NEG_INF {
        return a;
    }
    let (hi, lo) = if a > b { (a, b) } else { (b, a) };
    hi + (lo - hi).exp().ln_1p()
}

fn logadd3(a: f32, b: f32, c: f32) -> f32 {
    logadd2(logadd2(a, b), c)
}

fn log_sum_exp(values: &[f32]) -> f32 {
    let max = values.iter().copied().fold(NEG_INF, f32::max);
    if max == NEG_INF {
        return NEG_INF;
    }
    let sum: f32 = values.iter().map(|v| (v - max).exp()).sum();
    max + sum.ln()
}

fn log_softmax(row: &[f32]) -> Vec<f32> {
    let z = log_sum_exp(row);
    row.iter().map(|v| v - z).collect()
}

fn softmax(row: &[f32]) -> Vec<f32> {
    log_softmax(row).iter().map(|v| v.exp()).collect()
}

// ---------------------------------------------------------------------------
// CTC
// ---------------------------------------------------------------------------

/// Standard CTC over log-softmax'd scores: alpha/beta over the
/// blank-extended target, gradient = softmax - posterior occupancy.
pub fn ctc(
    output: &Matrix,
    target: &[ClassId],
    blank: ClassId,
    scale: f32,
) -> Result<(f64, Matrix), CriterionError> {
    let frames = output.rows();
    let classes = output.cols();
    if target.is_empty() {
        return Err(CriterionError::EmptyTarget);
    }

    let mut ext = Vec::with_capacity(2 * target.len() + 1);
    ext.push(blank);
    for &label in target {
        ext.push(label);
        ext.push(blank);
    }
    let states = ext.len();

    let mut logp = Matrix::zeros(frames, classes);
    for t in 0..frames {
        logp.row_mut(t).copy_from_slice(&log_softmax(output.row(t)));
    }

    let can_skip =
        |s: usize| s >= 2 && ext[s] != blank && ext[s] != ext[s - 2];

    let mut alpha = Matrix::zeros(frames, states);
    alpha.fill(NEG_INF);
    alpha.set(0, 0, logp.get(0, blank as usize));
    if states > 1 {
        alpha.set(0, 1, logp.get(0, ext[1] as usize));
    }
    for t in 1..frames {
        for s in 0..states {
            let stay = alpha.get(t - 1, s);
            let advance = if s >= 1 { alpha.get(t - 1, s - 1) } else { NEG_INF };
            let skip = if can_skip(s) { alpha.get(t - 1, s - 2) } else { NEG_INF };
            let prev = logadd3(stay, advance, skip);
            if prev != NEG_INF {
                alpha.set(t, s, prev + logp.get(t, ext[s] as usize));
            }
        }
    }

    let tail = if states > 1 {
        logadd2(alpha.get(frames - 1, states - 1), alpha.get(frames - 1, states - 2))
    } else {
        alpha.get(frames - 1, states - 1)
    };
    if tail == NEG_INF {
        return Err(CriterionError::TargetTooLong {
            frames,
            target: target.len(),
        });
    }
    let log_z = tail;

    let mut beta = Matrix::zeros(frames, states);
    beta.fill(NEG_INF);
    beta.set(frames - 1, states - 1, logp.get(frames - 1, ext[states - 1] as usize));
    if states > 1 {
        beta.set(frames - 1, states - 2, logp.get(frames - 1, ext[states - 2] as usize));
    }
    for t in (0..frames - 1).rev() {
        for s in 0..states {
            let stay = beta.get(t + 1, s);
            let advance = if s + 1 < states { beta.get(t + 1, s + 1) } else { NEG_INF };
            let skip = if s + 2 < states && can_skip(s + 2) {
                beta.get(t + 1, s + 2)
            } else {
                NEG_INF
            };
            let next = logadd3(stay, advance, skip);
            if next != NEG_INF {
                beta.set(t, s, next + logp.get(t, ext[s] as usize));
            }
        }
    }

    let mut grad = Matrix::zeros(frames, classes);
    for t in 0..frames {
        // occupancy per class
        let mut occupancy = vec![NEG_INF; classes];
        for s in 0..states {
            let a = alpha.get(t, s);
            let b = beta.get(t, s);
            if a == NEG_INF || b == NEG_INF {
                continue;
            }
            let c = ext[s] as usize;
            let mass = a + b - logp.get(t, c);
            occupancy[c] = logadd2(occupancy[c], mass);
        }
        let probs = softmax(output.row(t));
        let row = grad.row_mut(t);
        for c in 0..classes {
            let posterior = if occupancy[c] == NEG_INF {
                0.0
            } else {
                (occupancy[c] - log_z).exp()
            };
            row[c] = scale * (probs[c] - posterior);
        }
    }

    Ok(((-log_z * scale) as f64, grad))
}

// ---------------------------------------------------------------------------
// Full (unconstrained) lattice over all classes with transitions
// ---------------------------------------------------------------------------

struct FullLattice {
    alpha: Matrix,
    beta: Matrix,
    log_z: f32,
}

fn full_lattice(output: &Matrix, trans: &TransitionMatrix) -> FullLattice {
    let frames = output.rows();
    let classes = output.cols();
    let mut alpha = Matrix::zeros(frames, classes);
    alpha.row_mut(0).copy_from_slice(output.row(0));
    let mut scratch = vec![NEG_INF; classes];
    for t in 1..frames {
        for c in 0..classes {
            for (source, s) in scratch.iter_mut().enumerate() {
                *s = alpha.get(t - 1, source) + trans.score(c, source);
            }
            alpha.set(t, c, output.get(t, c) + log_sum_exp(&scratch));
        }
    }
    let log_z = log_sum_exp(alpha.row(frames - 1));

    let mut beta = Matrix::zeros(frames, classes);
    beta.row_mut(frames - 1).copy_from_slice(output.row(frames - 1));
    for t in (0..frames - 1).rev() {
        for c in 0..classes {
            for (dest, s) in scratch.iter_mut().enumerate() {
                *s = trans.score(dest, c) + beta.get(t + 1, dest);
            }
            beta.set(t, c, output.get(t, c) + log_sum_exp(&scratch));
        }
    }

    FullLattice { alpha, beta, log_z }
}

fn accumulate_full(
    output: &Matrix,
    trans: &TransitionMatrix,
    lattice: &FullLattice,
    sign: f32,
    grad_out: &mut Matrix,
    grad_trans: &mut Matrix,
) {
    let frames = output.rows();
    let classes = output.cols();
    for t in 0..frames {
        let row = grad_out.row_mut(t);
        for c in 0..classes {
            let mass = lattice.alpha.get(t, c) + lattice.beta.get(t, c)
                - output.get(t, c)
                - lattice.log_z;
            row[c] += sign * mass.exp();
        }
    }
    for t in 1..frames {
        for c in 0..classes {
            let tail = lattice.beta.get(t, c) - lattice.log_z;
            for source in 0..classes {
                let edge = lattice.alpha.get(t - 1, source) + trans.score(c, source) + tail;
                grad_trans.set(c, source, grad_trans.get(c, source) + sign * edge.exp());
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Constrained lattice over an explicit state sequence
// ---------------------------------------------------------------------------

struct ConLattice {
    alpha: Matrix,
    beta: Matrix,
    log_z: f32,
}

/// Forward-backward over a left-to-right state sequence. `allow_skip[s]`
/// permits entering state `s` directly from `s - 2`; `entry_states` and
/// `exit_states` bound how many of the leading/trailing states may start or
/// finish a path.
fn constrained_lattice(
    output: &Matrix,
    trans: &TransitionMatrix,
    states: &[ClassId],
    allow_skip: &[bool],
    entry_states: usize,
    exit_states: usize,
) -> Result<ConLattice, CriterionError> {
    let frames = output.rows();
    let count = states.len();
    debug_assert_eq!(allow_skip.len(), count);

    let mut alpha = Matrix::zeros(frames, count);
    alpha.fill(NEG_INF);
    for s in 0..entry_states.min(count) {
        alpha.set(0, s, output.get(0, states[s] as usize));
    }
    for t in 1..frames {
        for s in 0..count {
            let label = states[s] as usize;
            let stay = alpha.get(t - 1, s) + trans.score(label, label);
            let advance = if s >= 1 {
                alpha.get(t - 1, s - 1) + trans.score(label, states[s - 1] as usize)
            } else {
                NEG_INF
            };
            let skip = if s >= 2 && allow_skip[s] {
                alpha.get(t - 1, s - 2) + trans.score(label, states[s - 2] as usize)
            } else {
                NEG_INF
            };
            let prev = logadd3(stay, advance, skip);
            if prev != NEG_INF {
                alpha.set(t, s, prev + output.get(t, label));
            }
        }
    }

    let exit_lo = count.saturating_sub(exit_states);
    let log_z = (exit_lo..count)
        .map(|s| alpha.get(frames - 1, s))
        .fold(NEG_INF, logadd2);
    if log_z == NEG_INF {
        return Err(CriterionError::TargetTooLong {
            frames,
            target: count,
        });
    }

    let mut beta = Matrix::zeros(frames, count);
    beta.fill(NEG_INF);
    for s in exit_lo..count {
        beta.set(frames - 1, s, output.get(frames - 1, states[s] as usize));
    }
    for t in (0..frames - 1).rev() {
        for s in 0..count {
            let label = states[s] as usize;
            let stay = trans.score(label, label) + beta.get(t + 1, s);
            let advance = if s + 1 < count {
                trans.score(states[s + 1] as usize, label) + beta.get(t + 1, s + 1)
            } else {
                NEG_INF
            };
            let skip = if s + 2 < count && allow_skip[s + 2] {
                trans.score(states[s + 2] as usize, label) + beta.get(t + 1, s + 2)
            } else {
                NEG_INF
            };
            let next = logadd3(stay, advance, skip);
            if next != NEG_INF {
                beta.set(t, s, next + output.get(t, label));
            }
        }
    }

    Ok(ConLattice { alpha, beta, log_z })
}

fn accumulate_constrained(
    output: &Matrix,
    trans: &TransitionMatrix,
    states: &[ClassId],
    allow_skip: &[bool],
    lattice: &ConLattice,
    sign: f32,
    grad_out: &mut Matrix,
    grad_trans: &mut Matrix,
) {
    let frames = output.rows();
    let count = states.len();
    for t in 0..frames {
        for s in 0..count {
            let a = lattice.alpha.get(t, s);
            let b = lattice.beta.get(t, s);
            if a == NEG_INF || b == NEG_INF {
                continue;
            }
            let label = states[s] as usize;
            let mass = a + b - output.get(t, label) - lattice.log_z;
            grad_out.set(t, label, grad_out.get(t, label) + sign * mass.exp());
        }
    }
    for t in 1..frames {
        for s in 0..count {
            let b = lattice.beta.get(t, s);
            if b == NEG_INF {
                continue;
            }
            let label = states[s] as usize;
            let tail = b - lattice.log_z;
            let mut edge = |source_state: usize| {
                let source = states[source_state] as usize;
                let a = lattice.alpha.get(t - 1, source_state);
                if a == NEG_INF {
                    return;
                }
                let mass = a + trans.score(label, source) + tail;
                grad_trans.set(label, source, grad_trans.get(label, source) + sign * mass.exp());
            };
            edge(s);
            if s >= 1 {
                edge(s - 1);
            }
            if s >= 2 && allow_skip[s] {
                edge(s - 2);
            }
        }
    }
}

/// Viterbi (max-product) pass over the same constrained lattice, returning
/// the per-frame class alignment of the best path.
pub fn constrained_viterbi(
    output: &Matrix,
    trans: &TransitionMatrix,
    states: &[ClassId],
    allow_skip: &[bool],
    entry_states: usize,
    exit_states: usize,
) -> Result<Vec<ClassId>, CriterionError> {
    let frames = output.rows();
    let count = states.len();

    let mut score = Matrix::zeros(frames, count);
    score.fill(NEG_INF);
    let mut back = vec![0usize; frames * count];
    for s in 0..entry_states.min(count) {
        score.set(0, s, output.get(0, states[s] as usize));
    }
    for t in 1..frames {
        for s in 0..count {
            let label = states[s] as usize;
            let mut best = (score.get(t - 1, s) + trans.score(label, label), s);
            if s >= 1 {
                let v = score.get(t - 1, s - 1) + trans.score(label, states[s - 1] as usize);
                if v > best.0 {
                    best = (v, s - 1);
                }
            }
            if s >= 2 && allow_skip[s] {
                let v = score.get(t - 1, s - 2) + trans.score(label, states[s - 2] as usize);
                if v > best.0 {
                    best = (v, s - 2);
                }
            }
            if best.0 != NEG_INF {
                score.set(t, s, best.0 + output.get(t, label));
                back[t * count + s] = best.1;
            }
        }
    }

    let exit_lo = count.saturating_sub(exit_states);
    let mut state = exit_lo;
    for s in exit_lo..count {
        if score.get(frames - 1, s) > score.get(frames - 1, state) {
            state = s;
        }
    }
    if score.get(frames - 1, state) == NEG_INF {
        return Err(CriterionError::TargetTooLong {
            frames,
            target: count,
        });
    }
    let mut path = vec![0 as ClassId; frames];
    for t in (0..frames).rev() {
        path[t] = states[state];
        if t > 0 {
            state = back[t * count + state];
        }
    }
    Ok(path)
}

// ---------------------------------------------------------------------------
// ASG / full-connect / multi-state
// ---------------------------------------------------------------------------

fn asg_states(target: &[ClassId], garbage: Option<ClassId>) -> (Vec<ClassId>, Vec<bool>, usize, usize) {
    match garbage {
        Some(garbage) => {
            let mut states = Vec::with_capacity(2 * target.len() + 1);
            states.push(garbage);
            for &label in target {
                states.push(label);
                states.push(garbage);
            }
            let allow_skip: Vec<bool> = (0..states.len())
                .map(|s| s >= 2 && states[s] != garbage && states[s] != states[s - 2])
                .collect();
            let edge = 2.min(states.len());
            (states, allow_skip, edge, edge)
        }
        None => {
            let allow_skip = vec![false; target.len()];
            (target.to_vec(), allow_skip, 1, 1)
        }
    }
}

/// Auto-segmentation loss: free lattice minus target-constrained lattice.
/// With a garbage class, unaligned frames may be absorbed between labels.
pub fn asg(
    output: &Matrix,
    target: &[ClassId],
    trans: &TransitionMatrix,
    garbage: Option<ClassId>,
    scale: f32,
) -> Result<(f64, Matrix, Matrix), CriterionError> {
    if target.is_empty() {
        return Err(CriterionError::EmptyTarget);
    }
    let (states, allow_skip, entry, exit) = asg_states(target, garbage);

    let full = full_lattice(output, trans);
    let constrained = constrained_lattice(output, trans, &states, &allow_skip, entry, exit)?;

    let mut grad_out = Matrix::zeros(output.rows(), output.cols());
    let mut grad_trans = Matrix::zeros(trans.classes(), trans.classes());
    accumulate_full(output, trans, &full, scale, &mut grad_out, &mut grad_trans);
    accumulate_constrained(
        output,
        trans,
        &states,
        &allow_skip,
        &constrained,
        -scale,
        &mut grad_out,
        &mut grad_trans,
    );

    let loss = ((full.log_z - constrained.log_z) * scale) as f64;
    Ok((loss, grad_out, grad_trans))
}

/// Full-connect loss against an externally given per-frame alignment:
/// free lattice minus the score of the given path.
pub fn full_connect(
    output: &Matrix,
    alignment: &[ClassId],
    trans: &TransitionMatrix,
    scale: f32,
) -> Result<(f64, Matrix, Matrix), CriterionError> {
    let frames = output.rows();
    if alignment.len() != frames {
        return Err(CriterionError::AlignmentLength {
            frames,
            alignment: alignment.len(),
        });
    }

    let full = full_lattice(output, trans);
    let mut path_score = output.get(0, alignment[0] as usize);
    for t in 1..frames {
        path_score += output.get(t, alignment[t] as usize)
            + trans.score(alignment[t] as usize, alignment[t - 1] as usize);
    }

    let mut grad_out = Matrix::zeros(frames, output.cols());
    let mut grad_trans = Matrix::zeros(trans.classes(), trans.classes());
    accumulate_full(output, trans, &full, scale, &mut grad_out, &mut grad_trans);
    for t in 0..frames {
        let c = alignment[t] as usize;
        grad_out.set(t, c, grad_out.get(t, c) - scale);
        if t > 0 {
            let source = alignment[t - 1] as usize;
            grad_trans.set(c, source, grad_trans.get(c, source) - scale);
        }
    }

    let loss = ((full.log_z - path_score) * scale) as f64;
    Ok((loss, grad_out, grad_trans))
}

/// Multi-state variant: each label is a run of `width` sub-states, so the
/// free lattice runs over `classes * width` states and the constrained
/// sequence visits every sub-state of every target label in order.
pub fn multi_state(
    output: &Matrix,
    target: &[ClassId],
    trans: &TransitionMatrix,
    width: usize,
    scale: f32,
) -> Result<(f64, Matrix, Matrix), CriterionError> {
    if target.is_empty() {
        return Err(CriterionError::EmptyTarget);
    }
    let states: Vec<ClassId> = target
        .iter()
        .flat_map(|&label| (0..width).map(move |k| label * width as ClassId + k as ClassId))
        .collect();
    let allow_skip = vec![false; states.len()];

    let full = full_lattice(output, trans);
    let constrained = constrained_lattice(output, trans, &states, &allow_skip, 1, 1)?;

    let mut grad_out = Matrix::zeros(output.rows(), output.cols());
    let mut grad_trans = Matrix::zeros(trans.classes(), trans.classes());
    accumulate_full(output, trans, &full, scale, &mut grad_out, &mut grad_trans);
    accumulate_constrained(
        output,
        trans,
        &states,
        &allow_skip,
        &constrained,
        -scale,
        &mut grad_out,
        &mut grad_trans,
    );

    let loss = ((full.log_z - constrained.log_z) * scale) as f64;
    Ok((loss, grad_out, grad_trans))
}

// ---------------------------------------------------------------------------
// Cross-entropy on a fixed path (linear segmentation, forced alignment)
// ---------------------------------------------------------------------------

/// Frame-wise cross-entropy against a fixed alignment, plus (optionally) a
/// bigram cross-entropy that trains the transition scores along the path.
pub fn path_cross_entropy(
    output: &Matrix,
    trans: &TransitionMatrix,
    alignment: &[ClassId],
    scale: f32,
    with_transition_grad: bool,
) -> Result<(f64, Matrix, Matrix), CriterionError> {
    let frames = output.rows();
    if alignment.len() != frames {
        return Err(CriterionError::AlignmentLength {
            frames,
            alignment: alignment.len(),
        });
    }

    let mut loss = 0.0f64;
    let mut grad_out = Matrix::zeros(frames, output.cols());
    for t in 0..frames {
        let label = alignment[t] as usize;
        let logp = log_softmax(output.row(t));
        loss -= logp[label] as f64;
        let row = grad_out.row_mut(t);
        for (c, lp) in logp.iter().enumerate() {
            let onehot = if c == label { 1.0 } else { 0.0 };
            row[c] = scale * (lp.exp() - onehot);
        }
    }

    let mut grad_trans = Matrix::zeros(trans.classes(), trans.classes());
    if with_transition_grad {
        // column softmax: P(next | prev) over destination classes
        let classes = trans.classes();
        let mut column = vec![0f32; classes];
        for t in 1..frames {
            let prev = alignment[t - 1] as usize;
            let next = alignment[t] as usize;
            for (dest, c) in column.iter_mut().enumerate() {
                *c = trans.score(dest, prev);
            }
            let logq = log_softmax(&column);
            loss -= logq[next] as f64;
            for (dest, lq) in logq.iter().enumerate() {
                let onehot = if dest == next { 1.0 } else { 0.0 };
                let g = scale * (lq.exp() - onehot);
                grad_trans.set(dest, prev, grad_trans.get(dest, prev) + g);
            }
        }
    }

    Ok((loss * scale as f64, grad_out, grad_trans))
}

/// Uniform (linear) segmentation of the target across the input.
pub fn uniform_alignment(frames: usize, target: &[ClassId]) -> Result<Vec<ClassId>, CriterionError> {
    if target.is_empty() {
        return Err(CriterionError::EmptyTarget);
    }
    Ok((0..frames)
        .map(|t| target[t * target.len() / frames])
        .collect())
}

/// Best forced alignment of the target under the current scores and
/// transitions.
pub fn forced_alignment(
    output: &Matrix,
    trans: &TransitionMatrix,
    target: &[ClassId],
) -> Result<Vec<ClassId>, CriterionError> {
    if target.is_empty() {
        return Err(CriterionError::EmptyTarget);
    }
    let allow_skip = vec![false; target.len()];
    constrained_viterbi(output, trans, target, &allow_skip, 1, 1)
}

// ---------------------------------------------------------------------------
// Decode
// ---------------------------------------------------------------------------

/// Greedy Viterbi over the free lattice; without transitions this is the
/// per-frame argmax.
pub fn viterbi(output: &Matrix, trans: Option<&TransitionMatrix>) -> Vec<ClassId> {
    let frames = output.rows();
    let classes = output.cols();
    if frames == 0 {
        return Vec::new();
    }
    let Some(trans) = trans else {
        return (0..frames).map(|t| output.argmax_row(t) as ClassId).collect();
    };

    let mut score = output.row(0).to_vec();
    let mut back = vec![0usize; frames * classes];
    let mut next = vec![0f32; classes];
    for t in 1..frames {
        for c in 0..classes {
            let mut best = (score[0] + trans.score(c, 0), 0usize);
            for source in 1..classes {
                let v = score[source] + trans.score(c, source);
                if v > best.0 {
                    best = (v, source);
                }
            }
            next[c] = best.0 + output.get(t, c);
            back[t * classes + c] = best.1;
        }
        score.copy_from_slice(&next);
    }

    let mut state = 0;
    for c in 1..classes {
        if score[c] > score[state] {
            state = c;
        }
    }
    let mut path = vec![0 as ClassId; frames];
    for t in (0..frames).rev() {
        path[t] = state as ClassId;
        if t > 0 {
            state = back[t * classes + state];
        }
    }
    path
}
