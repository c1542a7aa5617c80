use thiserror::Error;

use crate::types::{EngineId, WorkflowId};
use crate::version::Version;

pub type Result<T> = std::result::Result<T, WeftError>;

/// Errors surfaced by the orchestrator core.
#[derive(Debug, Error)]
pub enum WeftError {
    #[error("workflow {0} not found")]
    NotFound(String),

    #[error("workflow {workflow_id} has dependents: {dependents:?}")]
    HasDependents {
        workflow_id: WorkflowId,
        dependents: Vec<WorkflowId>,
    },

    #[error("version {proposed} is not newer than current {current}")]
    NotNewer { proposed: Version, current: Version },

    #[error("version {0} already registered")]
    Duplicate(Version),

    #[error("invalid version: {0}")]
    InvalidVersion(String),

    #[error("invalid graph: {0}")]
    InvalidGraph(String),

    #[error("no engine available")]
    NoEngine,

    #[error("engine {engine_id} at capacity ({capacity})")]
    AtCapacity { engine_id: EngineId, capacity: usize },

    #[error("execution failed: {message}")]
    ExecutionFailed {
        message: String,
        secondary: Vec<String>,
    },

    #[error("execution cancelled")]
    Cancelled,

    #[error("deadline elapsed")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl WeftError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::HasDependents { .. } => ErrorKind::HasDependents,
            Self::NotNewer { .. } => ErrorKind::NotNewer,
            Self::Duplicate(_) => ErrorKind::Duplicate,
            Self::InvalidVersion(_) => ErrorKind::InvalidVersion,
            Self::InvalidGraph(_) => ErrorKind::InvalidGraph,
            Self::NoEngine => ErrorKind::NoEngine,
            Self::AtCapacity { .. } => ErrorKind::AtCapacity,
            Self::ExecutionFailed { .. } => ErrorKind::ExecutionFailed,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Timeout => ErrorKind::Timeout,
            Self::Transport(_) => ErrorKind::Transport,
            Self::Config(_) => ErrorKind::Config,
        }
    }
}

/// Stable error categories; the `error_kind` field of failed responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    NotFound,
    HasDependents,
    NotNewer,
    Duplicate,
    InvalidVersion,
    InvalidGraph,
    NoEngine,
    AtCapacity,
    ExecutionFailed,
    Cancelled,
    Timeout,
    Transport,
    Config,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "NOT_FOUND",
            Self::HasDependents => "HAS_DEPENDENTS",
            Self::NotNewer => "NOT_NEWER",
            Self::Duplicate => "DUPLICATE",
            Self::InvalidVersion => "INVALID_VERSION",
            Self::InvalidGraph => "INVALID_GRAPH",
            Self::NoEngine => "NO_ENGINE",
            Self::AtCapacity => "AT_CAPACITY",
            Self::ExecutionFailed => "EXECUTION_FAILED",
            Self::Cancelled => "CANCELLED",
            Self::Timeout => "TIMEOUT",
            Self::Transport => "TRANSPORT",
            Self::Config => "CONFIG",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        let err = WeftError::AtCapacity {
            engine_id: EngineId::new("e1"),
            capacity: 4,
        };
        assert_eq!(err.kind(), ErrorKind::AtCapacity);
        assert_eq!(err.kind().as_str(), "AT_CAPACITY");

        assert_eq!(WeftError::NoEngine.kind().as_str(), "NO_ENGINE");
        assert_eq!(WeftError::Timeout.kind().as_str(), "TIMEOUT");
    }

    #[test]
    fn test_has_dependents_message_lists_offenders() {
        let err = WeftError::HasDependents {
            workflow_id: WorkflowId::new("w"),
            dependents: vec![WorkflowId::new("x")],
        };
        assert!(err.to_string().contains('x'));
    }

    #[test]
    fn test_kind_serializes_screaming_snake() {
        let encoded = serde_json::to_string(&ErrorKind::ExecutionFailed).unwrap();
        assert_eq!(encoded, "\"EXECUTION_FAILED\"");
    }
}
