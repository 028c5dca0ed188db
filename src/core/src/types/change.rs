//! Change notification types: links, change-sets and commits

use super::{GroupId, ObjectId, RoleId, TypeName};
use crate::traits::ObjectGraph;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// A direct has-role link: `group` holds `role` on `object`, independent of any rule
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RoleAssignment {
    pub object: ObjectId,
    pub role: RoleId,
    pub group: GroupId,
}

impl RoleAssignment {
    pub fn new(
        object: impl Into<ObjectId>,
        role: impl Into<RoleId>,
        group: impl Into<GroupId>,
    ) -> Self {
        Self {
            object: object.into(),
            role: role.into(),
            group: group.into(),
        }
    }
}

/// A single edge instance of the object graph
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Link {
    /// `source.attribute` references `destination`
    Attribute {
        source: ObjectId,
        attribute: String,
        destination: ObjectId,
    },
    /// Named association from `source` to `destination`
    Association {
        name: String,
        source: ObjectId,
        destination: ObjectId,
    },
    /// Direct role assignment, directed from the object to the group
    RoleAssignment(RoleAssignment),
}

impl Link {
    pub fn attribute(
        source: impl Into<ObjectId>,
        attribute: impl Into<String>,
        destination: impl Into<ObjectId>,
    ) -> Self {
        Link::Attribute {
            source: source.into(),
            attribute: attribute.into(),
            destination: destination.into(),
        }
    }

    pub fn association(
        name: impl Into<String>,
        source: impl Into<ObjectId>,
        destination: impl Into<ObjectId>,
    ) -> Self {
        Link::Association {
            name: name.into(),
            source: source.into(),
            destination: destination.into(),
        }
    }

    pub fn source(&self) -> &str {
        match self {
            Link::Attribute { source, .. } | Link::Association { source, .. } => source,
            Link::RoleAssignment(assignment) => &assignment.object,
        }
    }

    pub fn destination(&self) -> &str {
        match self {
            Link::Attribute { destination, .. } | Link::Association { destination, .. } => destination,
            Link::RoleAssignment(assignment) => &assignment.group,
        }
    }

    /// Whether either endpoint is the given object
    pub fn touches(&self, id: &str) -> bool {
        self.source() == id || self.destination() == id
    }
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Link::Attribute { source, attribute, destination } => {
                write!(f, "{}.{} -> {}", source, attribute, destination)
            }
            Link::Association { name, source, destination } => {
                write!(f, "{} -[{}]-> {}", source, name, destination)
            }
            Link::RoleAssignment(a) => write!(f, "{} has {} on {}", a.group, a.role, a.object),
        }
    }
}

/// Identity and type of an object named in a change-set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectInfo {
    pub id: ObjectId,
    pub type_name: TypeName,
    pub storage_type: String,
}

/// Everything one transaction changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub changed: BTreeMap<ObjectId, ObjectInfo>,
    pub created: BTreeMap<ObjectId, ObjectInfo>,
    pub removed: BTreeMap<ObjectId, ObjectInfo>,
    pub created_links: Vec<Link>,
    pub removed_links: Vec<Link>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty()
            && self.created.is_empty()
            && self.removed.is_empty()
            && self.created_links.is_empty()
            && self.removed_links.is_empty()
    }

    /// Total number of link events
    pub fn link_count(&self) -> usize {
        self.created_links.len() + self.removed_links.len()
    }
}

/// A committed transaction: the graph before and after plus the change-set between them
#[derive(Clone)]
pub struct Commit {
    pub previous: Arc<dyn ObjectGraph>,
    pub current: Arc<dyn ObjectGraph>,
    pub changes: ChangeSet,
}

impl fmt::Debug for Commit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Commit")
            .field("changes", &self.changes)
            .finish_non_exhaustive()
    }
}
