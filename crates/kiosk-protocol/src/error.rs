//! Protocol errors.

use std::num::ParseIntError;

use thiserror::Error;

/// Authentication error.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Token mismatch")]
    Mismatch,
    #[error("Token must be longer than 12 characters (got {len})")]
    TokenTooShort { len: usize },
    #[error("Device identifier is empty")]
    EmptyIdentifier,
    #[error("Failed to read device identifier: {0}")]
    Io(#[from] std::io::Error),
}

/// Malformed command code.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Invalid load amount in {line:?}: {source}")]
    InvalidAmount {
        line: String,
        #[source]
        source: ParseIntError,
    },
    #[error("Load amount in {line:?} overflows")]
    Overflow { line: String },
}
