//! Error types for the object-graph boundary
//!
//! `GraphError` is what a traversal over an [`ObjectGraph`](crate::traits::ObjectGraph)
//! can fail with; `CoreError` covers model construction and transaction misuse.

use crate::types::ObjectId;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors raised while walking the object graph
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    /// One endpoint of a link no longer exists (typically deleted in the same commit)
    #[error("Invalid link: {0}")]
    InvalidLink(String),

    /// The object is not part of the graph
    #[error("Unknown object: {0}")]
    UnknownObject(ObjectId),

    /// The object's type does not declare the attribute
    #[error("Unknown attribute '{attribute}' on object {object}")]
    UnknownAttribute { object: ObjectId, attribute: String },
}

/// Core error type for model and transaction handling
#[derive(Debug, Error)]
pub enum CoreError {
    /// Traversal errors surfaced outside a rule evaluation
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// Type model problems (duplicate or dangling type references)
    #[error("Model error: {0}")]
    Model(String),

    /// Invalid transaction operation
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// Serialization/Deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),
}

impl CoreError {
    /// Create a model error
    pub fn model<S: Into<String>>(msg: S) -> Self {
        CoreError::Model(msg.into())
    }

    /// Create a transaction error
    pub fn transaction<S: Into<String>>(msg: S) -> Self {
        CoreError::Transaction(msg.into())
    }

    /// Create a not found error
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        CoreError::NotFound(msg.into())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Serialization(err.to_string())
    }
}
