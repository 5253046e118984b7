// Domain Error Types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DomainError {
    #[error("Invalid task state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Unknown task status: {0}")]
    UnknownStatus(String),

    #[error("Sequence range exhausted: next {next} is outside [{begin}, {end})")]
    SequenceRangeExhausted { begin: i64, end: i64, next: i64 },

    #[error("Validation error: {0}")]
    ValidationError(String),
}

pub type Result<T> = std::result::Result<T, DomainError>;
