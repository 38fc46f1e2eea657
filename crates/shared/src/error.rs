//! Error types shared across Creditline crates

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SharedError {
    #[error("Invalid {kind}: {value}")]
    InvalidEnum { kind: &'static str, value: String },

    #[error("Validation error: {0}")]
    Validation(String),
}
