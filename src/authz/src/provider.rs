//! Role providers: the closed set of things that grant roles
//!
//! Plain and inheritance rules come from configuration; external providers are
//! supplied in code by the embedding application. All three are evaluated through
//! the same [`RoleProvider`] operations.

use crate::evaluator::{self, EvalContext};
use crate::rules::Rule;
use crate::types::{GroupSet, ObjectSet};
use rolegraph_core::{Link, ObjectGraph};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// A role provider implemented outside the rule language
pub trait ExternalRoleProvider: Send + Sync {
    /// Unique id, sharing the namespace of rule ids
    fn id(&self) -> &str;

    /// Role granted by this provider
    fn role(&self) -> &str;

    /// Role this provider derives from, if it behaves like an inheritance rule
    fn source_role(&self) -> Option<&str> {
        None
    }

    /// Whether the provider grants anything on this object
    fn matches(&self, graph: &dyn ObjectGraph, object: &str) -> bool;

    /// Groups granted the role on `object`
    fn groups_for(&self, ctx: &EvalContext<'_>, object: &str) -> GroupSet;

    /// Every object the provider applies to
    fn target_objects(&self, graph: &dyn ObjectGraph) -> ObjectSet;

    /// Objects whose grants depend on `object`
    fn base_objects(&self, graph: &dyn ObjectGraph, object: &str) -> ObjectSet;

    /// Storage types whose changes require re-evaluating [`Self::base_objects`]
    fn affecting_types(&self) -> Vec<String> {
        Vec::new()
    }
}

/// A rule or external provider as held by the rule index
#[derive(Clone)]
pub enum RoleProvider {
    Plain(Arc<Rule>),
    Inheritance(Arc<Rule>),
    External(Arc<dyn ExternalRoleProvider>),
}

impl RoleProvider {
    /// Wrap a resolved rule in the variant matching its type
    pub fn from_rule(rule: Rule) -> Self {
        if rule.is_inheritance() {
            RoleProvider::Inheritance(Arc::new(rule))
        } else {
            RoleProvider::Plain(Arc::new(rule))
        }
    }

    pub fn id(&self) -> &str {
        match self {
            RoleProvider::Plain(rule) | RoleProvider::Inheritance(rule) => &rule.id,
            RoleProvider::External(provider) => provider.id(),
        }
    }

    pub fn role(&self) -> &str {
        match self {
            RoleProvider::Plain(rule) | RoleProvider::Inheritance(rule) => &rule.role,
            RoleProvider::External(provider) => provider.role(),
        }
    }

    /// Role whose changes propagate through this provider
    pub fn source_role(&self) -> Option<&str> {
        match self {
            RoleProvider::Plain(_) => None,
            RoleProvider::Inheritance(rule) => Some(rule.effective_source_role().as_str()),
            RoleProvider::External(provider) => provider.source_role(),
        }
    }

    pub fn rule(&self) -> Option<&Rule> {
        match self {
            RoleProvider::Plain(rule) | RoleProvider::Inheritance(rule) => Some(rule),
            RoleProvider::External(_) => None,
        }
    }

    pub fn is_external(&self) -> bool {
        matches!(self, RoleProvider::External(_))
    }

    pub fn matches(&self, graph: &dyn ObjectGraph, object: &str) -> bool {
        match self {
            RoleProvider::Plain(rule) | RoleProvider::Inheritance(rule) => rule.matches_object(graph, object),
            RoleProvider::External(provider) => provider.matches(graph, object),
        }
    }

    /// Groups granted the provider's role on `object`
    pub fn groups_for(&self, ctx: &EvalContext<'_>, object: &str) -> GroupSet {
        match self {
            RoleProvider::Plain(rule) | RoleProvider::Inheritance(rule) => evaluator::groups_for(ctx, rule, object),
            RoleProvider::External(provider) => provider.groups_for(ctx, object),
        }
    }

    pub fn target_objects(&self, graph: &dyn ObjectGraph) -> ObjectSet {
        match self {
            RoleProvider::Plain(rule) | RoleProvider::Inheritance(rule) => evaluator::target_objects(graph, rule),
            RoleProvider::External(provider) => provider.target_objects(graph),
        }
    }

    /// Subjects whose grants may change because `link` changed
    pub fn affected_base_objects(&self, graph: &dyn ObjectGraph, link: &Link) -> ObjectSet {
        match self {
            RoleProvider::Plain(rule) | RoleProvider::Inheritance(rule) => {
                evaluator::affected_base_objects(graph, rule, link)
            }
            RoleProvider::External(_) => ObjectSet::new(),
        }
    }

    /// Subjects whose grants derive from `object`
    pub fn base_objects(&self, graph: &dyn ObjectGraph, object: &str) -> ObjectSet {
        match self {
            RoleProvider::Plain(_) => ObjectSet::new(),
            RoleProvider::Inheritance(rule) => evaluator::base_objects(graph, rule, object),
            RoleProvider::External(provider) => provider.base_objects(graph, object),
        }
    }
}

impl fmt::Debug for RoleProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            RoleProvider::Plain(_) => "Plain",
            RoleProvider::Inheritance(_) => "Inheritance",
            RoleProvider::External(_) => "External",
        };
        write!(f, "{}({} -> {})", kind, self.id(), self.role())
    }
}

// Identity is the id; ids are unique across the index.

impl PartialEq for RoleProvider {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for RoleProvider {}

impl Hash for RoleProvider {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}

impl PartialOrd for RoleProvider {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RoleProvider {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id().cmp(other.id())
    }
}
