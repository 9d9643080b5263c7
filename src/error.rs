//! Error types surfaced by every session and host operation.

use thiserror::Error;

/// Host-level result code attached to an [`Error`].
///
/// These mirror the coarse categories a database host understands; the
/// human-readable message travels alongside in the error's `Display`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    Error,
    Misuse,
    NoMem,
    TooBig,
}

#[derive(Error, Debug)]
pub enum Error {
    /// A prerequisite resource (model, context, chat, sampler) is missing.
    #[error("{0}")]
    Misuse(String),

    #[error("Out of memory: {0}")]
    NoMem(String),

    #[error("{0}")]
    TooBig(String),

    /// Wrong arity, wrong type or otherwise malformed argument.
    #[error("{0}")]
    InvalidArgument(String),

    #[error("Engine {operation} failed: {message}")]
    Engine {
        operation: &'static str,
        message: String,
    },

    #[error("Maximum number of adapters reached ({max})")]
    CapacityExceeded { max: usize },

    #[error("Unable to load model from file {path}: {message}")]
    LoadFailed { path: String, message: String },

    #[error("Chat store error: {0}")]
    Store(String),
}

impl Error {
    pub fn code(&self) -> ResultCode {
        match self {
            Error::Misuse(_) => ResultCode::Misuse,
            Error::NoMem(_) => ResultCode::NoMem,
            Error::TooBig(_) => ResultCode::TooBig,
            _ => ResultCode::Error,
        }
    }

    pub(crate) fn engine(operation: &'static str, err: impl std::fmt::Display) -> Self {
        Error::Engine {
            operation,
            message: err.to_string(),
        }
    }

    pub(crate) fn no_model() -> Self {
        Error::Misuse(
            "No model is currently set. Please call llm_model_load() before using this function."
                .to_string(),
        )
    }

    pub(crate) fn no_context() -> Self {
        Error::Misuse(
            "No context found. Please call llm_context_create() before using this function."
                .to_string(),
        )
    }

    pub(crate) fn no_sampler() -> Self {
        Error::Misuse(
            "No sampler found. Please call llm_sampler_create() before using this function."
                .to_string(),
        )
    }

    pub(crate) fn no_chat() -> Self {
        Error::Misuse(
            "No chat session found. Please call llm_chat_create() before using this function."
                .to_string(),
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
