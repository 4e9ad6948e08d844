// orchestra/src/error.rs - Error taxonomy of the runtime

use orchestra_core::{CodecError, ValidationError};
use std::time::Duration;
use thiserror::Error;

/// Failures of the underlying publish/subscribe transport
#[derive(Debug, Error)]
pub enum BusError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("bus is closed")]
    Closed,
}

/// How a correlated call ended without a reply
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error("no reply on {topic} within {timeout:?}")]
    Timeout { topic: String, timeout: Duration },
    #[error("call on {topic} cancelled before a reply arrived")]
    Cancelled { topic: String },
}

#[derive(Debug, Error)]
pub enum CorrelatorError {
    #[error("correlation id {0} already has a pending call")]
    DuplicateCorrelationId(String),
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error(transparent)]
    Call(#[from] CallError),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl CorrelatorError {
    /// Transport failures are fatal to long-running components
    pub fn is_transport(&self) -> bool {
        matches!(self, CorrelatorError::Bus(BusError::Transport(_)))
    }
}

/// Terminal failure of a service instantiation.
/// The display text is what the requester receives in the `error` field.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum WorkflowError {
    #[error("{0}")]
    Validation(#[from] ValidationError),
    #[error("No VIM.")]
    NoResource,
    #[error("Deployment result: {0}")]
    Deployment(String),
    #[error("Timeout: {0}")]
    Timeout(#[from] CallError),
    #[error("Malformed reply: {0}")]
    MalformedReply(String),
    #[error("Record building failed: {0}")]
    Records(String),
    #[error("Dispatch failed: {0}")]
    Dispatch(String),
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("orchestrator transport failure: {0}")]
    Transport(#[from] CorrelatorError),
    #[error("orchestrator event loop stopped unexpectedly")]
    Stopped,
}
