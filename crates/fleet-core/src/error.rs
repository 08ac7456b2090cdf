//! Error types for core parsing and validation.

use thiserror::Error;

/// Result type alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors raised while interpreting a function specification or config.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("the package.json file cannot be parsed as a JSON object: {0}")]
    InvalidManifest(String),

    #[error("file {file} is not valid {encoding}: {reason}")]
    InvalidEncoding {
        file: String,
        encoding: &'static str,
        reason: String,
    },

    #[error("failed to read config: {0}")]
    ConfigIo(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    InvalidConfig(String),
}
