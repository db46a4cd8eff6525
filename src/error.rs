use thiserror::Error;

use crate::sandbox::SandboxError;
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum GraderError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("Assignment {0} is not known")]
    UnknownAssignment(String),

    #[error("Invalid grade update: {0}")]
    InvalidGrade(String),

    #[error("Build not found: {0}")]
    BuildNotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, GraderError>;
