//! Error types
//!
//! Only structurally fatal input is an error. A query that matches nothing or a
//! single malformed field definition resolves to `null` inside the result.

use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, ScrapeError>;

#[derive(Error, Debug)]
pub enum ScrapeError {
    /// The schema document itself is unusable (e.g. not a mapping of fields)
    #[error("Invalid schema: {0}")]
    InvalidSchema(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    /// The external schema generator failed or returned unusable text
    #[error("Schema generation failed: {0}")]
    Generation(String),
}

impl ScrapeError {
    pub fn invalid_schema(msg: impl Into<String>) -> Self {
        ScrapeError::InvalidSchema(msg.into())
    }
}
