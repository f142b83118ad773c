//! Configuration error types

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot read {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },

    #[error("Cannot write {path}: {source}")]
    Write { path: PathBuf, source: std::io::Error },

    #[error("Malformed configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Cannot encode configuration: {0}")]
    Encode(#[from] toml::ser::Error),

    /// An `FITSYNC_*` variable held something unparseable
    #[error("{var}: invalid {what} '{value}'")]
    InvalidEnv { var: String, what: String, value: String },

    #[error("Invalid URL for {field}: {value}")]
    InvalidUrl { field: &'static str, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
