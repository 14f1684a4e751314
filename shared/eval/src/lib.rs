mod evaluator;
mod words;

pub use evaluator::{EvalError, EvalReport, Evaluator, LatticeDecoder};
pub use words::{WordVocab, labels_to_words};
