use scribe_core::{ClassId, Dictionary, ResourceError, SEPARATOR_TOKEN};
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

pub const UNK_WORD: &str = "<unk>";

/// Fixed word list for word-level scoring. Unknown words all collapse onto
/// the `<unk>` sentinel, which is appended if the list doesn't carry it.
#[derive(Debug, Clone)]
pub struct WordVocab {
    ids: HashMap<String, u32>,
    unk: u32,
}

impl WordVocab {
    pub fn load(path: &Path) -> Result<Self, ResourceError> {
        let text = std::fs::read_to_string(path).map_err(ResourceError::read(path))?;
        let mut ids = HashMap::new();
        for word in text.split_whitespace() {
            let next = ids.len() as u32;
            ids.entry(word.to_string()).or_insert(next);
        }
        let unk = match ids.get(UNK_WORD) {
            Some(&unk) => unk,
            None => {
                let unk = ids.len() as u32;
                ids.insert(UNK_WORD.to_string(), unk);
                unk
            }
        };
        info!(words = ids.len(), path = %path.display(), "loaded word vocabulary");
        Ok(Self { ids, unk })
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn id(&self, word: &str) -> u32 {
        self.ids.get(word).copied().unwrap_or(self.unk)
    }

    pub fn encode(&self, words: &[String]) -> Vec<u32> {
        words.iter().map(|w| self.id(w)).collect()
    }
}

/// Join a (already remapped) label sequence into words at the separator
/// token.
pub fn labels_to_words(dict: &Dictionary, labels: &[ClassId]) -> Vec<String> {
    let separator = dict.id(SEPARATOR_TOKEN);
    let mut words = Vec::new();
    let mut current = String::new();
    for &label in labels {
        if Some(label) == separator {
            if !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
            continue;
        }
        if let Some(token) = dict.token(label) {
            current.push_str(token);
        }
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}
