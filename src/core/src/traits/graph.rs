//! Read access to a committed snapshot of the object graph
//!
//! Implementations answer structural questions only: which objects an attribute
//! or named association reaches, who refers to an object, the security parent
//! chain, and which groups a subject belongs to. Everything about roles and rules
//! lives on top of this trait.

use crate::error::GraphError;
use crate::types::{GroupId, ObjectId, ObjectInfo, RoleAssignment, TypeName};
use std::collections::HashSet;

pub type GraphResult<T> = std::result::Result<T, GraphError>;

/// A read-only snapshot of the object graph
pub trait ObjectGraph: Send + Sync {
    /// Process-unique id of this snapshot; never reused for different content
    fn snapshot_id(&self) -> u64;

    /// Identity and type of an object, `None` if it does not exist in this snapshot
    fn object_info(&self, id: &str) -> Option<ObjectInfo>;

    /// Objects referenced by `id.attribute`
    fn attribute_values(&self, id: &str, attribute: &str) -> GraphResult<Vec<ObjectId>>;

    /// Objects whose `attribute` references `id`
    fn referers(&self, id: &str, attribute: &str) -> GraphResult<Vec<ObjectId>>;

    /// Destinations of the named association starting at `source`
    fn link_destinations(&self, source: &str, association: &str) -> GraphResult<Vec<ObjectId>>;

    /// Sources of the named association ending at `destination`
    fn link_sources(&self, destination: &str, association: &str) -> GraphResult<Vec<ObjectId>>;

    /// Next object up the containment chain
    fn security_parent(&self, id: &str) -> Option<ObjectId>;

    /// Direct instances of a concrete type
    fn instances_of(&self, type_name: &str) -> Vec<ObjectId>;

    /// All instances persisted under a storage-type tag
    fn instances_of_storage_type(&self, storage_type: &str) -> Vec<ObjectId>;

    /// Groups an object stands for when it ends a rule path
    ///
    /// A group stands for itself; a person stands for its own singleton group.
    /// Any other object represents no group.
    fn represented_groups(&self, id: &str) -> Vec<GroupId>;

    /// Groups a subject is a member of, including its own singleton group
    fn memberships(&self, subject: &str) -> Vec<GroupId>;

    /// Direct has-role assignments on an object
    fn role_assignments(&self, object: &str) -> Vec<RoleAssignment>;

    /// Every direct has-role assignment in the graph
    fn all_role_assignments(&self) -> Vec<RoleAssignment>;

    fn contains(&self, id: &str) -> bool {
        self.object_info(id).is_some()
    }

    fn type_of(&self, id: &str) -> Option<TypeName> {
        self.object_info(id).map(|info| info.type_name)
    }

    fn storage_type_of(&self, id: &str) -> Option<String> {
        self.object_info(id).map(|info| info.storage_type)
    }

    /// The object followed by its security parents up to the root
    fn security_chain(&self, id: &str) -> Vec<ObjectId> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut current = Some(id.to_string());
        while let Some(object) = current {
            if !seen.insert(object.clone()) {
                break;
            }
            current = self.security_parent(&object);
            chain.push(object);
        }
        chain
    }
}
