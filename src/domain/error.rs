use thiserror::Error;

/// A job field holds a value the renderer cannot work with.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid job field `{field}`: {reason}")]
pub struct JobValidationError {
    pub field: &'static str,
    pub reason: String,
}

impl JobValidationError {
    pub fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}
