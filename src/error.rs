//! Error types for sorting cell operations

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CellError>;

#[derive(Error, Debug)]
pub enum CellError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Tokio task error: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
