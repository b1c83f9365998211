//! Failure taxonomy shared by every pipeline stage.

use thiserror::Error;

use crate::models::State;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Network-level failure after the bounded automatic retry gave up.
    #[error("transport failure: {0}")]
    Transport(String),
    /// The external service asked us to slow down.
    #[error("service busy: {0}")]
    Throttled(String),
    /// A success envelope carrying a status we do not understand.
    #[error("unexpected service response: {0}")]
    ServiceAnomaly(String),
    /// The completion endpoint refused the content.
    #[error("content rejected: {0}")]
    ContentRejected(String),
    /// The service rejected our request as invalid (HTTP 400).
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// A requeue ceiling was reached.
    #[error("maximum attempts reached: {0}")]
    Exhausted(String),
    #[error("malformed message: {0}")]
    MalformedMessage(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("{0}")]
    Unhandled(#[from] anyhow::Error),
}

impl PipelineError {
    /// Status the failing document or chunk ends in.
    pub fn terminal_state(&self) -> State {
        match self {
            PipelineError::Throttled(_) => State::Throttled,
            PipelineError::ContentRejected(_) => State::Skipped,
            _ => State::Error,
        }
    }

    pub fn storage(err: impl std::fmt::Display) -> Self {
        PipelineError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::MalformedMessage(err.to_string())
    }
}
