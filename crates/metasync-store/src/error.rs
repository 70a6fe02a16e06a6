//! Store errors

use metasync_core::{NodeType, RunId, RunStatus};

/// Errors raised by node stores
///
/// Only [`StoreError::Unavailable`] means no further progress is possible.
/// Every other variant is scoped to the one entity or run it names.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("Catalog store unavailable: {0}")]
    Unavailable(String),

    #[error("Failed to write {qualified_name}: {message}")]
    Write { qualified_name: String, message: String },

    #[error("Concurrent write conflict on {node_type} {qualified_name}")]
    Conflict { node_type: NodeType, qualified_name: String },

    #[error("Run {0} not found")]
    RunNotFound(RunId),

    #[error("Run {run_id} cannot move from {from} to {to}")]
    InvalidRunTransition { run_id: RunId, from: RunStatus, to: RunStatus },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl StoreError {
    /// Whether the whole store is gone rather than one write
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_unavailable_is_fatal() {
        assert!(StoreError::Unavailable("gone".into()).is_fatal());
        assert!(!StoreError::Write { qualified_name: "h/db".into(), message: "x".into() }.is_fatal());
        assert!(!StoreError::Conflict { node_type: NodeType::Table, qualified_name: "h/db.s.t".into() }.is_fatal());
        assert!(!StoreError::RunNotFound(3).is_fatal());
    }

    #[test]
    fn transition_message() {
        let err = StoreError::InvalidRunTransition {
            run_id: 7,
            from: RunStatus::Completed,
            to: RunStatus::Failed,
        };
        assert_eq!(err.to_string(), "Run 7 cannot move from completed to failed");
    }
}
