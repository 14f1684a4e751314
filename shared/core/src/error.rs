use std::path::PathBuf;
use thiserror::Error;

/// Invalid or contradictory options. Always fatal before any training phase
/// starts, and always names the offending field(s).
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("`{first}` and `{second}` cannot both be set")]
    Contradictory {
        first: &'static str,
        second: &'static str,
    },

    #[error("reloaded model is missing `{field}`")]
    MissingField { field: &'static str },
}

/// Missing or unreadable setup files (dictionaries, fold maps, word lists).
/// Fatal at setup.
#[derive(Error, Debug)]
pub enum ResourceError {
    #[error("required file {path} does not exist")]
    Missing { path: PathBuf },

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed contents in {path}: {reason}")]
    Malformed { path: PathBuf, reason: String },
}

impl ResourceError {
    pub fn read(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| match source.kind() {
            std::io::ErrorKind::NotFound => ResourceError::Missing { path },
            _ => ResourceError::Io { path, source },
        }
    }
}
