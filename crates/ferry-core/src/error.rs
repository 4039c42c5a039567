use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::types::InjectId;

/// Where an injection was when it got cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CancelStage {
    /// Removed from the queue before the executor ever saw it.
    Queued,
    /// Cancellation was signalled to a running executor.
    Active,
}

impl fmt::Display for CancelStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued => f.write_str("queued"),
            Self::Active => f.write_str("active"),
        }
    }
}

/// Failures of a single injection, as seen by the caller awaiting it.
#[derive(Debug, Error)]
pub enum InjectError {
    /// No executor configured. Fatal; retrying will not help.
    #[error("no executor configured: call set_executor before injecting")]
    NoExecutor,

    #[error("injection {inject_id} cancelled while {stage}: {reason}")]
    Cancelled {
        inject_id: InjectId,
        stage: CancelStage,
        reason: String,
    },

    #[error("queue for session {session_key} is full ({depth} waiting)")]
    QueueFull { session_key: String, depth: usize },

    #[error("executor failed: {0:#}")]
    Executor(anyhow::Error),

    #[error("injection {0} was dropped before it settled")]
    Dropped(InjectId),
}

impl InjectError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}
