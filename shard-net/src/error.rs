//! Error types for the device and queue layer.

use std::io;

use thiserror::Error;

use crate::shard::CoreId;

/// Device and queue setup errors.
///
/// Per-packet failures are never surfaced through this type; frames that
/// cannot be dispatched are dropped and counted instead.
#[derive(Debug, Error)]
pub enum NetError {
    #[error("queue pair already installed for {0}")]
    QueueAlreadyInstalled(CoreId),

    #[error("{core} out of range, device was built for {cores} cores")]
    InvalidCore { core: CoreId, cores: usize },

    #[error("backend error: {0}")]
    Backend(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, NetError>;
