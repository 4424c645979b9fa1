//! Error types shared by the pipeline stages.

use std::path::PathBuf;

use thiserror::Error;

/// Uploaded bytes could not be turned into an [`crate::Image`].
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("image buffer is empty")]
    Empty,
    #[error("unrecognized image data: {0}")]
    Unrecognized(String),
    #[error("image data is corrupt or truncated: {0}")]
    Corrupt(String),
    #[error("decoded image has no pixels ({width}x{height})")]
    NoPixels { width: u32, height: u32 },
}

/// Preprocessing or model invocation failed.
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("failed to load model: {0}")]
    ModelLoad(String),
    #[error("failed to prepare input tensor: {0}")]
    Preprocess(String),
    #[error("model invocation failed: {0}")]
    Model(String),
    #[error("model returned {actual} scores, expected {expected}")]
    OutputLength { expected: usize, actual: usize },
    #[error("model returned an invalid score {value} at index {index}")]
    InvalidScore { index: usize, value: f32 },
}

/// Invalid or unreadable configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("label file {0} contains no labels")]
    EmptyLabels(PathBuf),
}

/// Internal leaf gate failure. Never leaves the gate: it turns into a fail-open
/// fallback.
#[derive(Debug, Error)]
pub(crate) enum GateError {
    #[error("unusable gate parameter: {0}")]
    Parameter(String),
    #[error("non-finite ratio computed for {0}")]
    NonFinite(&'static str),
    #[error("edge detection panicked: {0}")]
    Panicked(String),
}
