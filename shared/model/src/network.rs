use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use scribe_core::{ConfigError, Matrix};
use serde::{Deserialize, Serialize};

/// Architecture hyperparameters persisted with every checkpoint. The
/// orchestrator never looks deeper into the network than this.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchSpec {
    pub kernel_width: usize,
    pub stride: usize,
}

impl ArchSpec {
    pub fn frame_local() -> Self {
        Self {
            kernel_width: 1,
            stride: 1,
        }
    }
}

/// One named parameter tensor with its gradient. The parameter-iteration
/// contract used by the optimizer, the gradient synchronization step, and
/// checkpoint save/restore.
#[derive(Clone, Debug)]
pub struct Variable {
    pub name: String,
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
    pub grad: Vec<f32>,
}

impl Variable {
    pub fn zeros(name: impl Into<String>, shape: Vec<usize>) -> Self {
        let len = shape.iter().product();
        Self {
            name: name.into(),
            shape,
            data: vec![0.0; len],
            grad: vec![0.0; len],
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// External network engine contract: forward produces per-frame class
/// scores, backward consumes the criterion's output gradient, and the
/// variable list is the only window into the parameters.
pub trait AcousticModel: Send {
    fn forward(&mut self, input: &Matrix) -> Matrix;
    fn backward(&mut self, input: &Matrix, grad_output: &Matrix);
    fn variables(&self) -> &[Variable];
    fn variables_mut(&mut self) -> &mut [Variable];
    fn arch(&self) -> ArchSpec;
    fn num_classes(&self) -> usize;
}

/// Parameter-free placeholder emitting all-zero scores. Used by the warmup
/// phase to train pure alignment transitions before any acoustic model
/// exists.
#[derive(Debug)]
pub struct ZeroModel {
    classes: usize,
    variables: Vec<Variable>,
}

impl ZeroModel {
    pub fn new(classes: usize) -> Self {
        Self {
            classes,
            variables: Vec::new(),
        }
    }
}

impl AcousticModel for ZeroModel {
    fn forward(&mut self, input: &Matrix) -> Matrix {
        Matrix::zeros(input.rows(), self.classes)
    }

    fn backward(&mut self, _input: &Matrix, _grad_output: &Matrix) {}

    fn variables(&self) -> &[Variable] {
        &self.variables
    }

    fn variables_mut(&mut self) -> &mut [Variable] {
        &mut self.variables
    }

    fn arch(&self) -> ArchSpec {
        ArchSpec::frame_local()
    }

    fn num_classes(&self) -> usize {
        self.classes
    }
}

/// Single dense layer over each frame. The in-repo reference model for
/// tests and smoke runs; real acoustic networks plug in through the same
/// trait.
#[derive(Debug)]
pub struct LinearModel {
    width: usize,
    classes: usize,
    variables: Vec<Variable>,
}

impl LinearModel {
    pub fn new(width: usize, classes: usize, seed: u64) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut weight = Variable::zeros("linear.weight", vec![width, classes]);
        for w in &mut weight.data {
            *w = rng.gen_range(-0.05..0.05);
        }
        let bias = Variable::zeros("linear.bias", vec![classes]);
        Self {
            width,
            classes,
            variables: vec![weight, bias],
        }
    }
}

impl AcousticModel for LinearModel {
    fn forward(&mut self, input: &Matrix) -> Matrix {
        assert_eq!(input.cols(), self.width, "feature width mismatch");
        let weight = &self.variables[0];
        let bias = &self.variables[1];
        let mut out = Matrix::zeros(input.rows(), self.classes);
        for t in 0..input.rows() {
            let frame = input.row(t);
            let row = out.row_mut(t);
            row.copy_from_slice(&bias.data);
            for (f, x) in frame.iter().enumerate() {
                let w = &weight.data[f * self.classes..(f + 1) * self.classes];
                for (c, wc) in w.iter().enumerate() {
                    row[c] += x * wc;
                }
            }
        }
        out
    }

    fn backward(&mut self, input: &Matrix, grad_output: &Matrix) {
        assert_eq!(grad_output.cols(), self.classes);
        let (weight, bias) = {
            let (w, b) = self.variables.split_at_mut(1);
            (&mut w[0], &mut b[0])
        };
        for t in 0..input.rows() {
            let frame = input.row(t);
            let grad = grad_output.row(t);
            for (c, g) in grad.iter().enumerate() {
                bias.grad[c] += g;
            }
            for (f, x) in frame.iter().enumerate() {
                let wg = &mut weight.grad[f * self.classes..(f + 1) * self.classes];
                for (c, g) in grad.iter().enumerate() {
                    wg[c] += x * g;
                }
            }
        }
    }

    fn variables(&self) -> &[Variable] {
        &self.variables
    }

    fn variables_mut(&mut self) -> &mut [Variable] {
        &mut self.variables
    }

    fn arch(&self) -> ArchSpec {
        ArchSpec::frame_local()
    }

    fn num_classes(&self) -> usize {
        self.classes
    }
}

/// Copy saved parameter tensors back into a freshly built model, matched
/// by name. Reloaded weights must line up exactly with the architecture.
pub fn restore_variables(
    model: &mut dyn AcousticModel,
    saved: &[Variable],
) -> Result<(), ConfigError> {
    for var in model.variables_mut() {
        let found = saved
            .iter()
            .find(|s| s.name == var.name)
            .ok_or_else(|| ConfigError::Invalid {
                field: "weights",
                reason: format!("checkpoint is missing tensor `{}`", var.name),
            })?;
        if found.shape != var.shape {
            return Err(ConfigError::Invalid {
                field: "weights",
                reason: format!(
                    "tensor `{}` has shape {:?}, model expects {:?}",
                    var.name, found.shape, var.shape
                ),
            });
        }
        var.data.copy_from_slice(&found.data);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restore_matches_by_name_and_shape() {
        let donor = LinearModel::new(3, 2, 5);
        let mut receiver = LinearModel::new(3, 2, 77);
        assert_ne!(
            donor.variables()[0].data,
            receiver.variables()[0].data
        );
        restore_variables(&mut receiver, donor.variables()).unwrap();
        assert_eq!(donor.variables()[0].data, receiver.variables()[0].data);

        let mut wrong = LinearModel::new(4, 2, 0);
        assert!(restore_variables(&mut wrong, donor.variables()).is_err());
    }

    #[test]
    fn zero_model_emits_zero_scores() {
        let mut model = ZeroModel::new(4);
        let out = model.forward(&Matrix::zeros(3, 7));
        assert_eq!(out.rows(), 3);
        assert_eq!(out.cols(), 4);
        assert!(out.as_slice().iter().all(|v| *v == 0.0));
        assert!(model.variables().is_empty());
    }

    #[test]
    fn linear_model_is_seed_deterministic() {
        let a = LinearModel::new(5, 3, 42);
        let b = LinearModel::new(5, 3, 42);
        assert_eq!(a.variables()[0].data, b.variables()[0].data);
    }

    #[test]
    fn linear_backward_accumulates_bias_grad() {
        let mut model = LinearModel::new(2, 2, 0);
        let input = Matrix::from_vec(2, 2, vec![1.0, 0.0, 0.0, 1.0]);
        let grad_out = Matrix::from_vec(2, 2, vec![1.0, -1.0, 1.0, -1.0]);
        model.backward(&input, &grad_out);
        assert_eq!(model.variables()[1].grad, vec![2.0, -2.0]);
        // weight grad follows x * g
        assert_eq!(model.variables()[0].grad, vec![1.0, -1.0, 1.0, -1.0]);
    }
}
