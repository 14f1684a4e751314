use crate::words::{WordVocab, labels_to_words};
use scribe_core::{Dictionary, EditDistanceMeter, LabelRemap, Matrix};
use scribe_criterion::{Criterion, TransitionMatrix};
use scribe_data::{DataError, Dataset};
use scribe_model::AcousticModel;
use thiserror::Error;
use tracing::{debug, info_span};

#[derive(Error, Debug)]
pub enum EvalError {
    #[error(transparent)]
    Data(#[from] DataError),
}

/// External beam-search + language-model decoder. Only consulted for the
/// optional third, independently-computed word error figure.
pub trait LatticeDecoder: Send {
    fn decode_words(&self, transitions: &TransitionMatrix, output: &Matrix) -> Vec<String>;
}

/// What one evaluator pass reports back to the epoch engine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvalReport {
    pub samples: usize,
    pub letter_err: f64,
    pub word_err: Option<f64>,
    pub decoder_word_err: Option<f64>,
}

/// Runs a frozen network over held-out data: forward, greedy decode via the
/// active criterion, label remap on both sides, then letter-level (and
/// optionally word-level) edit distance. Meters are reset at run start and
/// read, never reset, by the caller.
pub struct Evaluator {
    remap: LabelRemap,
    word_vocab: Option<WordVocab>,
    lattice: Option<Box<dyn LatticeDecoder>>,

    letter: EditDistanceMeter,
    word: EditDistanceMeter,
    decoder_word: EditDistanceMeter,
}

impl Evaluator {
    pub fn new(
        remap: LabelRemap,
        word_vocab: Option<WordVocab>,
        lattice: Option<Box<dyn LatticeDecoder>>,
    ) -> Self {
        Self {
            remap,
            word_vocab,
            lattice,
            letter: EditDistanceMeter::new(),
            word: EditDistanceMeter::new(),
            decoder_word: EditDistanceMeter::new(),
        }
    }

    pub fn letter_meter(&self) -> &EditDistanceMeter {
        &self.letter
    }

    pub fn run(
        &mut self,
        model: &mut dyn AcousticModel,
        criterion: &Criterion,
        dataset: &dyn Dataset,
        dict: &Dictionary,
    ) -> Result<EvalReport, EvalError> {
        let _span = info_span!("evaluate").entered();
        self.letter.reset();
        self.word.reset();
        self.decoder_word.reset();

        let samples = dataset.len();
        for index in 0..samples {
            let sample = dataset.get(index)?;
            let output = model.forward(&sample.input);

            let decoded = self.remap.apply(&criterion.decode(&output));
            let reference = self.remap.apply(&sample.target);
            self.letter.update(&decoded, &reference);

            if let Some(vocab) = &self.word_vocab {
                let hyp_words = vocab.encode(&labels_to_words(dict, &decoded));
                let ref_words = match &sample.words {
                    Some(words) => vocab.encode(words),
                    None => vocab.encode(&labels_to_words(dict, &reference)),
                };
                self.word.update(&hyp_words, &ref_words);

                if let Some(lattice) = &self.lattice {
                    let shared = criterion
                        .shared_transitions()
                        .map(|t| t.snapshot())
                        .unwrap_or_else(|| TransitionMatrix::new(output.cols()));
                    let beam_words = vocab.encode(&lattice.decode_words(&shared, &output));
                    self.decoder_word.update(&beam_words, &ref_words);
                }
            }
        }

        let report = EvalReport {
            samples,
            letter_err: self.letter.value(),
            word_err: self.word_vocab.as_ref().map(|_| self.word.value()),
            decoder_word_err: self
                .lattice
                .as_ref()
                .and_then(|_| self.word_vocab.as_ref())
                .map(|_| self.decoder_word.value()),
        };
        debug!(?report, "evaluation pass finished");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scribe_core::ClassId;
    use scribe_criterion::{CriterionKind, CriterionOptions, SharedTransitions};
    use scribe_data::Sample;
    use scribe_model::ZeroModel;

    /// Dataset with one hand-built sample whose peaked scores are supplied
    /// by a passthrough model.
    struct Fixed {
        samples: Vec<Sample>,
    }

    impl Dataset for Fixed {
        fn len(&self) -> usize {
            self.samples.len()
        }

        fn get(&self, index: usize) -> Result<Sample, DataError> {
            Ok(self.samples[index].clone())
        }
    }

    /// Emits its input unchanged, so tests control the class scores
    /// directly.
    struct Passthrough;

    impl AcousticModel for Passthrough {
        fn forward(&mut self, input: &Matrix) -> Matrix {
            input.clone()
        }
        fn backward(&mut self, _input: &Matrix, _grad_output: &Matrix) {}
        fn variables(&self) -> &[scribe_model::Variable] {
            &[]
        }
        fn variables_mut(&mut self) -> &mut [scribe_model::Variable] {
            &mut []
        }
        fn arch(&self) -> scribe_model::ArchSpec {
            scribe_model::ArchSpec::frame_local()
        }
        fn num_classes(&self) -> usize {
            3
        }
    }

    fn dict3() -> Dictionary {
        Dictionary::from_tokens(
            ["a", "b", "|"].into_iter().map(str::to_owned),
            std::path::Path::new("test"),
        )
        .unwrap()
    }

    fn peaked(path: &[ClassId], classes: usize) -> Matrix {
        Matrix::from_fn(path.len(), classes, |t, c| {
            if c as ClassId == path[t] { 6.0 } else { -6.0 }
        })
    }

    #[test]
    fn perfect_decode_scores_zero_error() {
        let criterion = Criterion::new(
            CriterionKind::AutoSeg,
            CriterionOptions::default(),
            Some(SharedTransitions::new(3)),
        )
        .unwrap();
        let dataset = Fixed {
            samples: vec![Sample {
                input: peaked(&[0, 0, 1, 1], 3),
                target: vec![0, 1],
                words: None,
            }],
        };
        let mut evaluator = Evaluator::new(LabelRemap::identity(), None, None);
        let report = evaluator
            .run(&mut Passthrough, &criterion, &dataset, &dict3())
            .unwrap();
        assert_eq!(report.letter_err, 0.0);
        assert_eq!(report.word_err, None);
    }

    #[test]
    fn wrong_decode_counts_edits() {
        let criterion = Criterion::new(
            CriterionKind::AutoSeg,
            CriterionOptions::default(),
            Some(SharedTransitions::new(3)),
        )
        .unwrap();
        let dataset = Fixed {
            samples: vec![Sample {
                input: peaked(&[1, 1, 1, 1], 3),
                target: vec![0, 1],
                words: None,
            }],
        };
        let mut evaluator = Evaluator::new(LabelRemap::identity(), None, None);
        let report = evaluator
            .run(&mut Passthrough, &criterion, &dataset, &dict3())
            .unwrap();
        // decoded "b" vs reference "ab": one deletion over two labels
        assert_eq!(report.letter_err, 50.0);
    }

    #[test]
    fn meters_reset_per_run_not_after() {
        let criterion = Criterion::new(
            CriterionKind::AutoSeg,
            CriterionOptions::default(),
            Some(SharedTransitions::new(3)),
        )
        .unwrap();
        let dataset = Fixed {
            samples: vec![Sample {
                input: peaked(&[0, 1], 3),
                target: vec![0, 1],
                words: None,
            }],
        };
        let mut evaluator = Evaluator::new(LabelRemap::identity(), None, None);
        evaluator
            .run(&mut Passthrough, &criterion, &dataset, &dict3())
            .unwrap();
        // caller can still read the meter after the run
        assert_eq!(evaluator.letter_meter().total(), 2);
        evaluator
            .run(&mut Passthrough, &criterion, &dataset, &dict3())
            .unwrap();
        assert_eq!(evaluator.letter_meter().total(), 2);
    }

    #[test]
    fn zero_model_decodes_all_same_class() {
        let criterion = Criterion::new(
            CriterionKind::AutoSeg,
            CriterionOptions::default(),
            Some(SharedTransitions::new(3)),
        )
        .unwrap();
        let dataset = Fixed {
            samples: vec![Sample {
                input: Matrix::zeros(4, 7),
                target: vec![0, 1],
                words: None,
            }],
        };
        let mut model = ZeroModel::new(3);
        let mut evaluator = Evaluator::new(LabelRemap::identity(), None, None);
        let report = evaluator
            .run(&mut model, &criterion, &dataset, &dict3())
            .unwrap();
        assert!(report.letter_err > 0.0);
    }
}
