//! Error types for the update cycle.
//!
//! Nothing here is fatal: every error is either isolated to one element or
//! refused with a log line, and the frame carries on.

use thiserror::Error;

use crate::element::QueueKind;
use crate::tree::NodeId;

/// Failure reported by an element's rebuild callback.
#[derive(Debug, Error)]
pub enum RebuildError {
    #[error("rebuild failed: {0}")]
    Failed(String),
    #[error("node {0:?} is no longer part of the hierarchy")]
    MissingNode(NodeId),
    #[error("component is already borrowed during rebuild")]
    Borrowed,
}

/// Protocol violation detected by the scheduler.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("the {queue} stage is running; the {queue} queue cannot be modified")]
    StageActive { queue: QueueKind },
    #[error("the update system has been shut down")]
    ShutDown,
}
