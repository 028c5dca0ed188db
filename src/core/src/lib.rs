//! # Rolegraph Core
//!
//! The object-graph boundary consumed by the rule-based authorization crate:
//! identifiers, the type model, the read-only [`ObjectGraph`] snapshot trait,
//! change-sets and commits, plus an in-memory graph used by tests and embedders.

pub mod error;
pub mod memory;
pub mod traits;
pub mod types;

// Re-export commonly used types
pub use error::{CoreError, GraphError, Result};
pub use memory::{GraphTransaction, InMemoryGraph, GROUP_TYPE, PERSON_TYPE};
pub use traits::{GraphResult, ObjectGraph};
pub use types::{
    AttributeDef, ChangeSet, Commit, GroupId, Link, ObjectId, ObjectInfo, RoleAssignment, RoleId,
    TypeDef, TypeModel, TypeName,
};
