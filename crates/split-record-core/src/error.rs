use crate::delegation::Selector;
use crate::value::RecordId;

#[derive(Debug, thiserror::Error)]
pub enum MtiError {
    #[error("undefined member {selector} for {receiver}")]
    MethodNotFound {
        selector: Selector,
        receiver: String,
    },
    #[error("unknown model: {0}")]
    UnknownModel(String),
    #[error("unknown relation `{relation}` on {model}")]
    UnknownRelation { relation: String, model: String },
    #[error("{model} with id {id} not found")]
    NotFound { model: String, id: RecordId },
    #[error("validation error on {model}: {message}")]
    Validation { model: String, message: String },
    #[error("{selector} expects {expected} argument(s), got {given}")]
    Arity {
        selector: Selector,
        expected: usize,
        given: usize,
    },
    #[error("invalid attribute `{attribute}`: {reason}")]
    InvalidAttribute { attribute: String, reason: String },
    #[error("invalid declaration: {0}")]
    Declaration(String),
    #[error("{model} has no linked {base} and none could be built")]
    BrokenPair { model: String, base: String },
    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl MtiError {
    #[must_use]
    pub fn is_method_not_found(&self) -> bool {
        matches!(self, Self::MethodNotFound { .. })
    }
}
