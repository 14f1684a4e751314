use crate::Variable;
use scribe_core::GradClamp;
use std::collections::HashMap;

/// Clamp one gradient buffer in place. `lr` only matters for the
/// lr-relative mode.
pub fn clamp_gradient(grad: &mut [f32], clamp: GradClamp, lr: f64) {
    match clamp {
        GradClamp::Off => {}
        GradClamp::Absolute { max } => {
            for g in grad.iter_mut() {
                *g = g.clamp(-max, max);
            }
        }
        GradClamp::Relative { scale } => {
            let max = (scale as f64 * lr) as f32;
            for g in grad.iter_mut() {
                *g = g.clamp(-max, max);
            }
        }
        GradClamp::Norm { max } => {
            let norm = grad.iter().map(|g| (*g as f64).powi(2)).sum::<f64>().sqrt();
            if norm > max as f64 {
                let scale = (max as f64 / norm) as f32;
                for g in grad.iter_mut() {
                    *g *= scale;
                }
            }
        }
    }
}

pub fn zero_grads(variables: &mut [Variable]) {
    for var in variables {
        var.grad.iter_mut().for_each(|g| *g = 0.0);
    }
}

/// Momentum/weight-decay SGD applied through the variable-iteration
/// contract. Velocity buffers are keyed by variable name so they survive
/// across epochs and phases.
#[derive(Debug, Default)]
pub struct SgdStep {
    momentum: f64,
    weight_decay: f64,
    velocity: HashMap<String, Vec<f32>>,
}

impl SgdStep {
    pub fn new(momentum: f64, weight_decay: f64) -> Self {
        Self {
            momentum,
            weight_decay,
            velocity: HashMap::new(),
        }
    }

    /// Clamp, decay, momentum, step. Gradients are left untouched for the
    /// caller to zero before the next backward pass.
    pub fn apply(&mut self, variables: &mut [Variable], lr: f64, clamp: GradClamp) {
        for var in variables {
            clamp_gradient(&mut var.grad, clamp, lr);
            let wd = self.weight_decay as f32;
            let momentum = self.momentum as f32;
            let step = lr as f32;
            if momentum != 0.0 {
                let velocity = self
                    .velocity
                    .entry(var.name.clone())
                    .or_insert_with(|| vec![0.0; var.len()]);
                for ((w, g), v) in var
                    .data
                    .iter_mut()
                    .zip(var.grad.iter())
                    .zip(velocity.iter_mut())
                {
                    let g = g + wd * *w;
                    *v = momentum * *v + g;
                    *w -= step * *v;
                }
            } else {
                for (w, g) in var.data.iter_mut().zip(var.grad.iter()) {
                    let g = g + wd * *w;
                    *w -= step * g;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absolute_clamp_bounds_entries() {
        let mut grad = vec![3.0, -2.0, 0.5];
        clamp_gradient(&mut grad, GradClamp::Absolute { max: 1.0 }, 0.1);
        assert_eq!(grad, vec![1.0, -1.0, 0.5]);
    }

    #[test]
    fn norm_clamp_rescales() {
        let mut grad = vec![3.0, 4.0];
        clamp_gradient(&mut grad, GradClamp::Norm { max: 1.0 }, 0.1);
        let norm: f32 = grad.iter().map(|g| g * g).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn plain_sgd_step() {
        let mut var = Variable::zeros("w", vec![2]);
        var.data = vec![1.0, 1.0];
        var.grad = vec![0.5, -0.5];
        let mut sgd = SgdStep::new(0.0, 0.0);
        sgd.apply(std::slice::from_mut(&mut var), 0.1, GradClamp::Off);
        assert!((var.data[0] - 0.95).abs() < 1e-6);
        assert!((var.data[1] - 1.05).abs() < 1e-6);
    }

    #[test]
    fn momentum_accumulates_velocity() {
        let mut var = Variable::zeros("w", vec![1]);
        var.grad = vec![1.0];
        let mut sgd = SgdStep::new(0.5, 0.0);
        sgd.apply(std::slice::from_mut(&mut var), 1.0, GradClamp::Off);
        assert!((var.data[0] + 1.0).abs() < 1e-6);
        sgd.apply(std::slice::from_mut(&mut var), 1.0, GradClamp::Off);
        // v = 0.5*1 + 1 = 1.5; w = -1 - 1.5 = -2.5
        assert!((var.data[0] + 2.5).abs() < 1e-6);
    }
}
