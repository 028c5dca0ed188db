//! Error types for the rule-based security subsystem

use rolegraph_core::{CoreError, GraphError};
use thiserror::Error;

/// Security subsystem errors
///
/// Only write-path and lifecycle operations return these. The read path
/// degrades to "no grant" instead of surfacing an error.
#[derive(Debug, Error)]
pub enum SecurityError {
    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Configuration could not be read or parsed
    #[error("Configuration error: {0}")]
    Config(String),

    /// Rule set could not be loaded at all (individual rule problems are not errors)
    #[error("Rule load failed: {0}")]
    RuleLoad(String),

    /// Persisted role index failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Database error
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Rebuild could not be started or completed
    #[error("Rebuild error: {0}")]
    Rebuild(String),

    /// Object graph error outside of rule evaluation
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    /// Object graph model or transaction error
    #[error("Core error: {0}")]
    Core(#[from] CoreError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SecurityError {
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        SecurityError::Storage(msg.into())
    }

    pub fn config<S: Into<String>>(msg: S) -> Self {
        SecurityError::Config(msg.into())
    }

    pub fn rebuild<S: Into<String>>(msg: S) -> Self {
        SecurityError::Rebuild(msg.into())
    }
}

/// Result type for security operations
pub type Result<T> = std::result::Result<T, SecurityError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SecurityError::storage("connection reset");
        assert_eq!(err.to_string(), "Storage error: connection reset");

        let err: SecurityError = GraphError::InvalidLink("p1.owner".into()).into();
        assert_eq!(err.to_string(), "Graph error: Invalid link: p1.owner");
    }
}
