use crate::{DataError, Dataset, Sample};
use scribe_core::{ClassId, Matrix};
use std::path::{Path, PathBuf};
use tracing::info;

/// On-disk dataset of preprocessed utterances. Each record is a pair of
/// little-endian binary files sharing a stem:
///
///   {stem}.feat   u32 frames, u32 width, then frames*width f32 features
///   {stem}.tok    u32 count, then count u32 label ids
///   {stem}.wrd    optional, whitespace-separated reference words
///
/// The index is built once at open; records are read lazily so the loader
/// pool can fetch them from multiple threads.
pub struct PreprocessedDataset {
    dir: PathBuf,
    stems: Vec<String>,
    feature_width: usize,
}

impl PreprocessedDataset {
    pub fn open(root: &Path, set_name: &str) -> Result<Self, DataError> {
        let dir = root.join(set_name);
        let entries = std::fs::read_dir(&dir).map_err(|source| DataError::Io {
            path: dir.clone(),
            source,
        })?;
        let mut stems = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| DataError::Io {
                path: dir.clone(),
                source,
            })?;
            let path = entry.path();
            if path.extension().is_some_and(|e| e == "feat") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    stems.push(stem.to_string());
                }
            }
        }
        if stems.is_empty() {
            return Err(DataError::Empty { path: dir });
        }
        stems.sort_unstable();

        let probe = read_features(&dir.join(format!("{}.feat", stems[0])))?;
        let feature_width = probe.cols();
        info!(
            set = set_name,
            samples = stems.len(),
            feature_width,
            "opened preprocessed dataset"
        );
        Ok(Self {
            dir,
            stems,
            feature_width,
        })
    }

    pub fn feature_width(&self) -> usize {
        self.feature_width
    }
}

impl Dataset for PreprocessedDataset {
    fn len(&self) -> usize {
        self.stems.len()
    }

    fn get(&self, index: usize) -> Result<Sample, DataError> {
        let stem = self.stems.get(index).ok_or(DataError::OutOfRange {
            index,
            len: self.stems.len(),
        })?;
        let input = read_features(&self.dir.join(format!("{stem}.feat")))?;
        let target = read_targets(&self.dir.join(format!("{stem}.tok")))?;
        let words_path = self.dir.join(format!("{stem}.wrd"));
        let words = match std::fs::read_to_string(&words_path) {
            Ok(text) => Some(text.split_whitespace().map(str::to_owned).collect()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(source) => {
                return Err(DataError::Io {
                    path: words_path,
                    source,
                });
            }
        };
        Ok(Sample {
            input,
            target,
            words,
        })
    }
}

fn read_bytes(path: &Path) -> Result<Vec<u8>, DataError> {
    std::fs::read(path).map_err(|source| DataError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn take_u32(bytes: &[u8], offset: usize, path: &Path) -> Result<u32, DataError> {
    bytes
        .get(offset..offset + 4)
        .map(|b| u32::from_le_bytes(b.try_into().expect("4 bytes")))
        .ok_or_else(|| DataError::Malformed {
            path: path.to_path_buf(),
            reason: "truncated header".into(),
        })
}

fn read_features(path: &Path) -> Result<Matrix, DataError> {
    let bytes = read_bytes(path)?;
    let frames = take_u32(&bytes, 0, path)? as usize;
    let width = take_u32(&bytes, 4, path)? as usize;
    let expected = 8 + frames * width * 4;
    if bytes.len() != expected {
        return Err(DataError::Malformed {
            path: path.to_path_buf(),
            reason: format!("expected {expected} bytes, got {}", bytes.len()),
        });
    }
    let data = bytes[8..]
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes(b.try_into().expect("4 bytes")))
        .collect();
    Ok(Matrix::from_vec(frames, width, data))
}

fn read_targets(path: &Path) -> Result<Vec<ClassId>, DataError> {
    let bytes = read_bytes(path)?;
    let count = take_u32(&bytes, 0, path)? as usize;
    let expected = 4 + count * 4;
    if bytes.len() != expected {
        return Err(DataError::Malformed {
            path: path.to_path_buf(),
            reason: format!("expected {expected} bytes, got {}", bytes.len()),
        });
    }
    Ok(bytes[4..]
        .chunks_exact(4)
        .map(|b| u32::from_le_bytes(b.try_into().expect("4 bytes")))
        .collect())
}

#[cfg(test)]
pub(crate) fn write_record(
    dir: &Path,
    stem: &str,
    input: &Matrix,
    target: &[ClassId],
    words: Option<&str>,
) {
    let mut feat = Vec::new();
    feat.extend((input.rows() as u32).to_le_bytes());
    feat.extend((input.cols() as u32).to_le_bytes());
    for v in input.as_slice() {
        feat.extend(v.to_le_bytes());
    }
    std::fs::write(dir.join(format!("{stem}.feat")), feat).unwrap();

    let mut tok = Vec::new();
    tok.extend((target.len() as u32).to_le_bytes());
    for t in target {
        tok.extend(t.to_le_bytes());
    }
    std::fs::write(dir.join(format!("{stem}.tok")), tok).unwrap();

    if let Some(words) = words {
        std::fs::write(dir.join(format!("{stem}.wrd")), words).unwrap();
    }
}
