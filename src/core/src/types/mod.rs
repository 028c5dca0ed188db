//! Shared types for the object graph

pub mod change;
pub mod model;

/// Identifier of a business object (persons and groups are objects too)
pub type ObjectId = String;

/// Name of a concrete or abstract type in the [`model::TypeModel`]
pub type TypeName = String;

/// Identifier of a group that role grants are made to
pub type GroupId = String;

/// Identifier of a role
pub type RoleId = String;

// Re-export commonly used types
pub use change::{ChangeSet, Commit, Link, ObjectInfo, RoleAssignment};
pub use model::{AttributeDef, TypeDef, TypeModel};
