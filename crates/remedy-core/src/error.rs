use thiserror::Error;

/// Top-level error type for the remediation service.
///
/// Subsystem crates define their own error types; this one covers the
/// ambient concerns shared by every crate (configuration, I/O, encoding).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RemedyError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration value for {field}: {reason}")]
    InvalidConfig { field: &'static str, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Logging setup failed: {0}")]
    Logging(String),
}

impl From<toml::de::Error> for RemedyError {
    fn from(err: toml::de::Error) -> Self {
        RemedyError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for RemedyError {
    fn from(err: toml::ser::Error) -> Self {
        RemedyError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for RemedyError {
    fn from(err: serde_json::Error) -> Self {
        RemedyError::Serialization(err.to_string())
    }
}

/// A specialized `Result` type for core operations.
pub type Result<T> = std::result::Result<T, RemedyError>;
