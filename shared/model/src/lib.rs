mod network;
mod optimizer;

pub use network::{AcousticModel, ArchSpec, LinearModel, Variable, ZeroModel, restore_variables};
pub use optimizer::{SgdStep, clamp_gradient, zero_grads};
