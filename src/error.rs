//! Error types for the ingestion service

use thiserror::Error;

#[derive(Error, Debug)]
pub enum IngestionError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("JSON parsing failed: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    #[error("Configuration error: {0}")]
    ConfigError(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Caller is neither the trusted scheduler nor holds the shared secret
    #[error("forbidden")]
    Forbidden,

    #[error("Missing configuration: {0}")]
    MissingConfig(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl IngestionError {
    /// Short label used for metrics and log fields
    pub fn kind(&self) -> &'static str {
        match self {
            Self::HttpError(_) => "http",
            Self::JsonError(_) => "json",
            Self::DatabaseError(_) => "database",
            Self::ConfigError(_) | Self::MissingConfig(_) => "config",
            Self::IoError(_) => "io",
            Self::Forbidden => "forbidden",
            Self::InvalidInput(_) => "invalid_input",
        }
    }
}

pub type Result<T> = std::result::Result<T, IngestionError>;
