//! Rule model: immutable rule values, path elements and load problems

use crate::types::{ObjectId, RoleId, RuleId, TypeName};
use rolegraph_core::{Link, ObjectGraph};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

/// Whether a rule grants a role from group endpoints or re-derives it from another role
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    #[default]
    Plain,
    Inheritance,
}

/// Kind of edge a hop follows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    Attribute,
    Association,
}

/// One traversal step over a named edge
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Hop {
    pub kind: EdgeKind,
    pub name: String,
    /// Follow the edge from its destination back to its source
    pub inverse: bool,
    /// Type declaring the traversed attribute
    pub source_type: Option<TypeName>,
}

/// An element of a rule path
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathElement {
    /// The subject object itself is the base object
    Identity,
    Hop(Hop),
}

impl PathElement {
    pub fn attribute(name: impl Into<String>, inverse: bool) -> Self {
        PathElement::Hop(Hop {
            kind: EdgeKind::Attribute,
            name: name.into(),
            inverse,
            source_type: None,
        })
    }

    pub fn association(name: impl Into<String>, inverse: bool) -> Self {
        PathElement::Hop(Hop {
            kind: EdgeKind::Association,
            name: name.into(),
            inverse,
            source_type: None,
        })
    }

    pub fn as_hop(&self) -> Option<&Hop> {
        match self {
            PathElement::Identity => None,
            PathElement::Hop(hop) => Some(hop),
        }
    }

    /// Whether a changed link is an instance of this hop's edge
    pub fn matches_link(&self, link: &Link) -> bool {
        match (self, link) {
            (PathElement::Hop(hop), Link::Attribute { attribute, .. }) => {
                hop.kind == EdgeKind::Attribute && hop.name == *attribute
            }
            (PathElement::Hop(hop), Link::Association { name, .. }) => {
                hop.kind == EdgeKind::Association && hop.name == *name
            }
            _ => false,
        }
    }
}

impl fmt::Display for PathElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathElement::Identity => f.write_str("self"),
            PathElement::Hop(hop) => {
                let arrow = if hop.inverse { "<-" } else { "->" };
                let kind = match hop.kind {
                    EdgeKind::Attribute => "attr",
                    EdgeKind::Association => "assoc",
                };
                write!(f, "{}{}:{}", arrow, kind, hop.name)
            }
        }
    }
}

/// What a rule is declared on
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RuleTarget {
    /// A concrete or abstract type of the model
    Type(TypeName),
    /// Every object persisted under a storage-type tag
    StorageType(String),
}

/// A declarative role rule
///
/// The rule grants `role` on every object it applies to. A plain rule grants it to
/// the groups found at the end of `path`; an inheritance rule grants it to the groups
/// holding `source_role` on the objects found at the end of `path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub id: RuleId,
    pub target: RuleTarget,
    pub inherit: bool,
    pub role: RoleId,
    pub source_role: Option<RoleId>,
    /// Never empty; [`PathElement::Identity`] stands in for a declared empty path
    pub path: Vec<PathElement>,
    /// Literal start object; the grant then applies to every target object
    pub base: Option<ObjectId>,
    pub rule_type: RuleType,
    /// Concrete types the rule applies to, filled in by resolution
    pub concrete_types: BTreeSet<TypeName>,
}

impl Rule {
    /// A plain rule on a type with an identity path
    pub fn new(id: impl Into<RuleId>, target: RuleTarget, role: impl Into<RoleId>) -> Self {
        Self {
            id: id.into(),
            target,
            inherit: false,
            role: role.into(),
            source_role: None,
            path: vec![PathElement::Identity],
            base: None,
            rule_type: RuleType::Plain,
            concrete_types: BTreeSet::new(),
        }
    }

    pub fn on_type(id: impl Into<RuleId>, type_name: impl Into<TypeName>, role: impl Into<RoleId>) -> Self {
        Self::new(id, RuleTarget::Type(type_name.into()), role)
    }

    pub fn inherited(mut self) -> Self {
        self.inherit = true;
        self
    }

    /// Turn into an inheritance rule deriving from `source_role`
    pub fn from_source_role(mut self, source_role: impl Into<RoleId>) -> Self {
        self.rule_type = RuleType::Inheritance;
        self.source_role = Some(source_role.into());
        self
    }

    pub fn with_path(mut self, path: Vec<PathElement>) -> Self {
        self.path = if path.is_empty() {
            vec![PathElement::Identity]
        } else {
            path
        };
        self
    }

    pub fn with_base(mut self, base: impl Into<ObjectId>) -> Self {
        self.base = Some(base.into());
        self
    }

    pub fn is_inheritance(&self) -> bool {
        self.rule_type == RuleType::Inheritance
    }

    /// Role looked up on path endpoints of an inheritance rule
    pub fn effective_source_role(&self) -> &RoleId {
        self.source_role.as_ref().unwrap_or(&self.role)
    }

    /// Whether the rule applies to an object of the graph
    pub fn matches_object(&self, graph: &dyn ObjectGraph, object: &str) -> bool {
        match &self.target {
            RuleTarget::Type(_) => graph
                .type_of(object)
                .map(|t| self.concrete_types.contains(&t))
                .unwrap_or(false),
            RuleTarget::StorageType(tag) => graph
                .storage_type_of(object)
                .map(|t| t == *tag)
                .unwrap_or(false),
        }
    }

    /// Attribute names referenced by the path
    pub fn attributes(&self) -> impl Iterator<Item = &str> {
        self.hops_of(EdgeKind::Attribute)
    }

    /// Association names referenced by the path
    pub fn associations(&self) -> impl Iterator<Item = &str> {
        self.hops_of(EdgeKind::Association)
    }

    fn hops_of(&self, kind: EdgeKind) -> impl Iterator<Item = &str> {
        self.path
            .iter()
            .filter_map(PathElement::as_hop)
            .filter(move |hop| hop.kind == kind)
            .map(|hop| hop.name.as_str())
    }
}

/// Non-fatal problem found while loading rules; the named rule is dropped
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuleProblem {
    #[error("rule '{rule}': duplicate rule id")]
    DuplicateId { rule: RuleId },

    #[error("rule '{rule}': no role given")]
    MissingRole { rule: RuleId },

    #[error("rule '{rule}': exactly one of type or storage_type must be given")]
    AmbiguousTarget { rule: RuleId },

    #[error("rule '{rule}': unknown type '{type_name}'")]
    UnknownType { rule: RuleId, type_name: TypeName },

    #[error("rule '{rule}': unknown storage type '{storage_type}'")]
    UnknownStorageType { rule: RuleId, storage_type: String },

    #[error("rule '{rule}': type '{type_name}' has no attribute '{attribute}'")]
    UnknownAttribute {
        rule: RuleId,
        type_name: TypeName,
        attribute: String,
    },

    #[error("rule '{rule}': unknown role '{role}'")]
    UnknownRole { rule: RuleId, role: RoleId },

    #[error("rule '{rule}': abstract type '{type_name}' requires inherit=true")]
    AbstractTargetType { rule: RuleId, type_name: TypeName },

    #[error("rule '{rule}': inheritance source type '{type_name}' is abstract")]
    AbstractInheritanceSource { rule: RuleId, type_name: TypeName },

    #[error("rule '{rule}': inheritance rule without source role")]
    MissingSourceRole { rule: RuleId },

    #[error("rule '{rule}': path step {step} must name exactly one attribute or association")]
    InvalidStep { rule: RuleId, step: usize },

    #[error("rule '{rule}': path step {step} needs an explicit type")]
    MissingStepType { rule: RuleId, step: usize },
}

impl RuleProblem {
    /// Id of the rule the problem was reported for
    pub fn rule_id(&self) -> &str {
        match self {
            RuleProblem::DuplicateId { rule }
            | RuleProblem::MissingRole { rule }
            | RuleProblem::AmbiguousTarget { rule }
            | RuleProblem::UnknownType { rule, .. }
            | RuleProblem::UnknownStorageType { rule, .. }
            | RuleProblem::UnknownAttribute { rule, .. }
            | RuleProblem::UnknownRole { rule, .. }
            | RuleProblem::AbstractTargetType { rule, .. }
            | RuleProblem::AbstractInheritanceSource { rule, .. }
            | RuleProblem::MissingSourceRole { rule }
            | RuleProblem::InvalidStep { rule, .. }
            | RuleProblem::MissingStepType { rule, .. } => rule,
        }
    }
}
