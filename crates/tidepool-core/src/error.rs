//! Configuration error types.

use thiserror::Error;

/// Result type alias for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised while parsing a pool file or resolving a profile.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse pool file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("unknown profile: {0}")]
    UnknownProfile(String),

    #[error("profile '{profile}' is missing required field '{field}'")]
    MissingField {
        profile: String,
        field: &'static str,
    },

    #[error("invalid value for '{field}': {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("invalid pool sizing: {0}")]
    InvalidSizing(String),
}
