use crate::{ClassId, ConfigError, ResourceError, RunConfig};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// Word-boundary token present in every letter/phoneme token set.
pub const SEPARATOR_TOKEN: &str = "|";

/// Markers optionally collapsed onto the separator (step (a) of the build).
const NOISE_TOKENS: [&str; 2] = ["<noise>", "<laugh>"];

#[derive(Error, Debug)]
pub enum DictionaryError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Resource(#[from] ResourceError),
}

/// Ordered bijection between label tokens and class ids `0..N-1`.
/// Class ids are positional: the augmentation order is load-bearing.
#[derive(Debug, Clone)]
pub struct Dictionary {
    tokens: Vec<String>,
    index: HashMap<String, ClassId>,
    aliases: HashMap<String, ClassId>,
}

impl Dictionary {
    pub fn from_tokens(
        tokens: impl IntoIterator<Item = String>,
        source: &Path,
    ) -> Result<Self, ResourceError> {
        let mut dict = Self {
            tokens: Vec::new(),
            index: HashMap::new(),
            aliases: HashMap::new(),
        };
        for token in tokens {
            if dict.index.contains_key(&token) {
                return Err(ResourceError::Malformed {
                    path: source.to_path_buf(),
                    reason: format!("duplicate token `{token}`"),
                });
            }
            dict.push(token);
        }
        Ok(dict)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    fn push(&mut self, token: String) -> ClassId {
        let id = self.tokens.len() as ClassId;
        self.index.insert(token.clone(), id);
        self.tokens.push(token);
        id
    }

    /// Resolve a token to its class id; collapsed markers resolve through
    /// their alias.
    pub fn id(&self, token: &str) -> Option<ClassId> {
        self.index
            .get(token)
            .or_else(|| self.aliases.get(token))
            .copied()
    }

    pub fn token(&self, id: ClassId) -> Option<&str> {
        self.tokens.get(id as usize).map(String::as_str)
    }

    pub fn tokens(&self) -> impl Iterator<Item = &str> {
        self.tokens.iter().map(String::as_str)
    }
}

/// Transform applied to decoded and reference label sequences before edit
/// distance: drops the blank/garbage sentinel, expands repeat labels back
/// into runs of their base label, then applies the 61-to-39 phoneme fold.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelRemap {
    pub first_replabel: Option<ClassId>,
    pub replabel: usize,
    pub sentinel: Option<ClassId>,
    pub fold: Option<Vec<ClassId>>,
}

impl LabelRemap {
    pub fn identity() -> Self {
        Self {
            first_replabel: None,
            replabel: 0,
            sentinel: None,
            fold: None,
        }
    }

    pub fn apply(&self, labels: &[ClassId]) -> Vec<ClassId> {
        let mut out: Vec<ClassId> = Vec::with_capacity(labels.len());
        for &id in labels {
            if Some(id) == self.sentinel {
                continue;
            }
            if let Some(first) = self.first_replabel {
                if id >= first && (id - first) < self.replabel as ClassId {
                    let count = (id - first + 1) as usize;
                    if let Some(&base) = out.last() {
                        out.extend(std::iter::repeat(base).take(count));
                    }
                    continue;
                }
            }
            out.push(id);
        }
        if let Some(fold) = &self.fold {
            for id in &mut out {
                if let Some(&folded) = fold.get(*id as usize) {
                    *id = folded;
                }
            }
        }
        out
    }
}

/// Everything downstream needs from one dictionary build.
#[derive(Debug, Clone)]
pub struct BuiltDictionary {
    pub dict: Dictionary,
    pub remap: LabelRemap,
    /// Blank (CTC) or garbage class; always the last id when present.
    pub sentinel: Option<ClassId>,
    pub first_replabel: Option<ClassId>,
}

/// Deterministic dictionary construction. Steps run in a fixed order, each
/// conditionally: noise collapse, phoneme folding, repeat-label expansion,
/// blank/garbage appension (last, because criteria assume the sentinel is
/// `size - 1`).
#[derive(Debug, Clone)]
pub struct DictionaryBuilder {
    pub tokens_file: PathBuf,
    pub collapse_noise: bool,
    pub phoneme_full: bool,
    pub fold_file: Option<PathBuf>,
    pub fold_targets: bool,
    pub replabel: usize,
    pub ctc: bool,
    pub garbage: bool,
}

impl DictionaryBuilder {
    pub fn from_config(config: &RunConfig) -> Self {
        Self {
            tokens_file: config.tokens_file.clone(),
            collapse_noise: config.collapse_noise,
            phoneme_full: config.phoneme_full,
            fold_file: config.fold_file.clone(),
            fold_targets: config.fold_targets,
            replabel: config.replabel,
            ctc: config.ctc,
            garbage: config.garbage,
        }
    }

    pub fn build(&self) -> Result<BuiltDictionary, DictionaryError> {
        let base = read_token_lines(&self.tokens_file)?;
        let mut dict = Dictionary::from_tokens(base, &self.tokens_file)?;

        // (a) collapse noise/laughter markers onto the separator
        if self.collapse_noise {
            if dict.id(SEPARATOR_TOKEN).is_none() {
                return Err(ResourceError::Malformed {
                    path: self.tokens_file.clone(),
                    reason: format!("no `{SEPARATOR_TOKEN}` token to collapse noise markers onto"),
                }
                .into());
            }
            let kept: Vec<String> = dict
                .tokens()
                .filter(|t| !NOISE_TOKENS.contains(t))
                .map(str::to_owned)
                .collect();
            let mut collapsed = Dictionary::from_tokens(kept, &self.tokens_file)?;
            let separator = collapsed
                .id(SEPARATOR_TOKEN)
                .expect("separator survives collapse");
            for marker in NOISE_TOKENS {
                collapsed.aliases.insert(marker.to_string(), separator);
            }
            dict = collapsed;
        }

        // (b) derive the 39-class folded dictionary from the 61-class one
        let mut fold = None;
        if self.phoneme_full {
            let fold_file = self.fold_file.as_ref().ok_or(ConfigError::Invalid {
                field: "fold-file",
                reason: "required for full (61-class) phoneme targets".into(),
            })?;
            let (folded, map) = derive_folded(&dict, fold_file)?;
            if self.fold_targets {
                // work directly in the folded space; nothing left to remap
                dict = folded;
            } else {
                fold = Some(map);
            }
        }

        // (c) one new class per repeat count
        let first_replabel = (self.replabel > 0).then(|| {
            let first = dict.len() as ClassId;
            for n in 1..=self.replabel {
                dict.push(format!("<{n}>"));
            }
            first
        });

        // (d) blank/garbage class, strictly last
        let sentinel = match (self.ctc, self.garbage) {
            (true, _) => Some(dict.push("<blank>".to_string())),
            (false, true) => Some(dict.push("<gbg>".to_string())),
            (false, false) => None,
        };

        info!(
            classes = dict.len(),
            replabel = self.replabel,
            sentinel = ?sentinel,
            "built dictionary"
        );

        Ok(BuiltDictionary {
            remap: LabelRemap {
                first_replabel,
                replabel: self.replabel,
                sentinel,
                fold,
            },
            sentinel,
            first_replabel,
            dict,
        })
    }
}

fn read_token_lines(path: &Path) -> Result<Vec<String>, ResourceError> {
    let text = std::fs::read_to_string(path).map_err(ResourceError::read(path))?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_owned)
        .collect())
}

/// Parse a `src dst` fold map and produce the folded dictionary (dst tokens
/// in first-appearance order over the source dictionary) plus the id map.
fn derive_folded(
    dict: &Dictionary,
    fold_file: &Path,
) -> Result<(Dictionary, Vec<ClassId>), DictionaryError> {
    let text = std::fs::read_to_string(fold_file).map_err(ResourceError::read(fold_file))?;
    let mut to_token: HashMap<&str, &str> = HashMap::new();
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let mut parts = line.split_whitespace();
        let (src, dst) = match (parts.next(), parts.next()) {
            (Some(src), Some(dst)) => (src, dst),
            _ => {
                return Err(ResourceError::Malformed {
                    path: fold_file.to_path_buf(),
                    reason: format!("expected `src dst`, got `{line}`"),
                }
                .into());
            }
        };
        to_token.insert(src, dst);
    }

    let mut folded = Dictionary {
        tokens: Vec::new(),
        index: HashMap::new(),
        aliases: HashMap::new(),
    };
    let mut map = Vec::with_capacity(dict.len());
    for token in dict.tokens() {
        let target = to_token.get(token).copied().unwrap_or(token);
        let id = match folded.id(target) {
            Some(id) => id,
            None => folded.push(target.to_string()),
        };
        map.push(id);
    }
    debug!(
        from = dict.len(),
        to = folded.len(),
        "derived folded phoneme dictionary"
    );
    Ok((folded, map))
}
