mod adapter;
mod kernel;
mod transitions;

pub use adapter::{
    BatchItem, Criterion, CriterionError, CriterionKind, CriterionOptions, Execution, Score,
};
pub use transitions::{SharedTransitions, TransitionMatrix};
