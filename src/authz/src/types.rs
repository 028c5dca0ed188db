//! Core security types

use rolegraph_core::RoleAssignment;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

pub use rolegraph_core::{GroupId, ObjectId, RoleId, TypeName};

/// Unique rule (or external provider) identifier
pub type RuleId = String;

/// Set of roles, ordered for stable output
pub type RoleSet = BTreeSet<RoleId>;

/// Set of groups
pub type GroupSet = BTreeSet<GroupId>;

/// Set of business objects
pub type ObjectSet = BTreeSet<ObjectId>;

/// Why a role grant fact exists
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "rule", rename_all = "snake_case")]
pub enum GrantReason {
    /// Produced by evaluating a rule or external provider
    Rule(RuleId),
    /// Explicit has-role link
    Direct,
}

impl GrantReason {
    /// Persisted key of a direct grant
    pub const DIRECT_KEY: &'static str = "direct";

    /// Encode for storage
    pub fn as_key(&self) -> String {
        match self {
            GrantReason::Rule(id) => format!("rule:{}", id),
            GrantReason::Direct => Self::DIRECT_KEY.to_string(),
        }
    }

    /// Decode a stored key
    pub fn from_key(key: &str) -> Option<Self> {
        if key == Self::DIRECT_KEY {
            return Some(GrantReason::Direct);
        }
        key.strip_prefix("rule:").map(|id| GrantReason::Rule(id.to_string()))
    }
}

impl fmt::Display for GrantReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_key())
    }
}

/// A persisted `(group, role, object)` triple plus the reason it exists
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RoleGrant {
    pub group: GroupId,
    pub role: RoleId,
    pub object: ObjectId,
    pub reason: GrantReason,
}

impl RoleGrant {
    pub fn new(
        group: impl Into<GroupId>,
        role: impl Into<RoleId>,
        object: impl Into<ObjectId>,
        reason: GrantReason,
    ) -> Self {
        Self {
            group: group.into(),
            role: role.into(),
            object: object.into(),
            reason,
        }
    }

    /// Fact for a direct has-role assignment
    pub fn direct(assignment: &RoleAssignment) -> Self {
        Self::new(
            assignment.group.clone(),
            assignment.role.clone(),
            assignment.object.clone(),
            GrantReason::Direct,
        )
    }
}

/// Objects whose persisted facts are stale while a commit is being written
///
/// `all` holds objects whose direct assignments changed; `by_role` holds the
/// objects each role is being recomputed for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvalidObjects {
    pub all: ObjectSet,
    pub by_role: BTreeMap<RoleId, ObjectSet>,
}

impl InvalidObjects {
    pub fn is_empty(&self) -> bool {
        self.all.is_empty() && self.by_role.values().all(|objects| objects.is_empty())
    }

    /// Whether a read over `chain` must bypass the persisted index
    ///
    /// With `roles == None` every role counts (a `get_roles` query).
    pub fn affects(&self, chain: &[ObjectId], roles: Option<&[RoleId]>) -> bool {
        if chain.iter().any(|o| self.all.contains(o)) {
            return true;
        }
        match roles {
            Some(roles) => roles.iter().any(|role| {
                self.by_role
                    .get(role)
                    .map(|objects| chain.iter().any(|o| objects.contains(o)))
                    .unwrap_or(false)
            }),
            None => self
                .by_role
                .values()
                .any(|objects| chain.iter().any(|o| objects.contains(o))),
        }
    }
}
