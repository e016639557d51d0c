use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum KiraError {
    #[error("unknown source id: {0}")]
    InvalidSourceId(String),

    #[error("unknown modality: {0}")]
    InvalidModality(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("failed to read manifest at {0}")]
    ManifestRead(PathBuf),

    #[error("failed to parse manifest: {0}")]
    ManifestParse(String),

    #[error("failed to load crosswalk {path}: {message}")]
    Crosswalk { path: String, message: String },

    #[error("parse error at {locator}: {message}")]
    Parse { locator: String, message: String },

    #[error("strict mode: required sources unavailable: {0}")]
    #[diagnostic(help("disable strict_source_requirement to run in partial-source mode"))]
    StrictSourceMissing(String),

    #[error("internal consistency error: {0}")]
    #[diagnostic(help("the merge logic produced an unsound result; no output was written"))]
    InternalConsistency(String),

    #[error("run cancelled before stage {0}")]
    Cancelled(String),

    #[error("normalizer for {0} panicked")]
    NormalizerPanic(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl KiraError {
    pub fn parse(locator: impl Into<String>, message: impl Into<String>) -> Self {
        KiraError::Parse {
            locator: locator.into(),
            message: message.into(),
        }
    }
}
