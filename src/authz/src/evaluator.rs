//! Path evaluation over the object graph
//!
//! Forward evaluation walks a rule path from a subject object to the objects whose
//! groups receive the rule's role. Backward evaluation answers the opposite
//! question for change detection: given one changed edge, which subject objects
//! could have walked over it. Both directions use the same hop table, reversed.
//!
//! Traversal errors (a link whose endpoint vanished in the same commit) are
//! swallowed: the hop simply contributes nothing.

use crate::rules::{EdgeKind, Hop, PathElement, Rule, RuleTarget};
use crate::types::{GroupSet, ObjectId, ObjectSet, RoleId};
use rolegraph_core::{GraphResult, Link, ObjectGraph};
use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use tracing::debug;

/// Resolves the groups holding a role on an object
///
/// Inheritance rules ask this for their source role.
pub trait RoleGroupSource: Send + Sync {
    fn groups_for_role(&self, ctx: &EvalContext<'_>, object: &str, role: &str) -> GroupSet;
}

/// State of one evaluation: the graph snapshot and the `(object, role)` pairs in progress
///
/// Cyclic inheritance would otherwise recurse forever; a pair that is already
/// being resolved contributes no groups.
pub struct EvalContext<'a> {
    graph: &'a dyn ObjectGraph,
    source: &'a dyn RoleGroupSource,
    in_progress: RefCell<HashSet<(ObjectId, RoleId)>>,
    truncations: Cell<usize>,
}

impl<'a> EvalContext<'a> {
    pub fn new(graph: &'a dyn ObjectGraph, source: &'a dyn RoleGroupSource) -> Self {
        Self {
            graph,
            source,
            in_progress: RefCell::new(HashSet::new()),
            truncations: Cell::new(0),
        }
    }

    pub fn graph(&self) -> &'a dyn ObjectGraph {
        self.graph
    }

    /// Groups holding `role` on `object`, guarded against cycles
    pub fn groups_for_role(&self, object: &str, role: &str) -> GroupSet {
        let key = (object.to_string(), role.to_string());
        if !self.in_progress.borrow_mut().insert(key.clone()) {
            self.truncations.set(self.truncations.get() + 1);
            return GroupSet::new();
        }
        let groups = self.source.groups_for_role(self, object, role);
        self.in_progress.borrow_mut().remove(&key);
        groups
    }

    /// Number of times a cycle cut evaluation short so far
    pub fn truncations(&self) -> usize {
        self.truncations.get()
    }
}

fn step_forward(graph: &dyn ObjectGraph, hop: &Hop, object: &str) -> GraphResult<Vec<ObjectId>> {
    match (hop.kind, hop.inverse) {
        (EdgeKind::Attribute, false) => graph.attribute_values(object, &hop.name),
        (EdgeKind::Attribute, true) => graph.referers(object, &hop.name),
        (EdgeKind::Association, false) => graph.link_destinations(object, &hop.name),
        (EdgeKind::Association, true) => graph.link_sources(object, &hop.name),
    }
}

fn step_backward(graph: &dyn ObjectGraph, hop: &Hop, object: &str) -> GraphResult<Vec<ObjectId>> {
    match (hop.kind, hop.inverse) {
        (EdgeKind::Attribute, false) => graph.referers(object, &hop.name),
        (EdgeKind::Attribute, true) => graph.attribute_values(object, &hop.name),
        (EdgeKind::Association, false) => graph.link_sources(object, &hop.name),
        (EdgeKind::Association, true) => graph.link_destinations(object, &hop.name),
    }
}

fn advance<'p>(
    graph: &dyn ObjectGraph,
    elements: impl Iterator<Item = &'p PathElement>,
    start: ObjectSet,
    step: fn(&dyn ObjectGraph, &Hop, &str) -> GraphResult<Vec<ObjectId>>,
) -> ObjectSet {
    let mut current = start;
    for element in elements {
        let PathElement::Hop(hop) = element else {
            continue;
        };
        let mut next = ObjectSet::new();
        for object in &current {
            match step(graph, hop, object) {
                Ok(objects) => next.extend(objects),
                Err(err) => debug!(object = %object, hop = %element, error = %err, "hop skipped"),
            }
        }
        if next.is_empty() {
            return next;
        }
        current = next;
    }
    current
}

/// Objects at the end of the rule path when walking from `subject`
///
/// A rule with a base always walks from the base object.
pub fn endpoints(graph: &dyn ObjectGraph, rule: &Rule, subject: &str) -> ObjectSet {
    let start = rule.base.as_deref().unwrap_or(subject);
    if !graph.contains(start) {
        return ObjectSet::new();
    }
    advance(graph, rule.path.iter(), ObjectSet::from([start.to_string()]), step_forward)
}

/// Groups granted `rule.role` on `subject`
pub fn groups_for(ctx: &EvalContext<'_>, rule: &Rule, subject: &str) -> GroupSet {
    let graph = ctx.graph();
    let reached = endpoints(graph, rule, subject);
    if rule.is_inheritance() {
        let source_role = rule.effective_source_role();
        reached
            .iter()
            .flat_map(|object| ctx.groups_for_role(object, source_role))
            .collect()
    } else {
        reached
            .iter()
            .flat_map(|object| graph.represented_groups(object))
            .collect()
    }
}

/// Every object the rule applies to
pub fn target_objects(graph: &dyn ObjectGraph, rule: &Rule) -> ObjectSet {
    match &rule.target {
        RuleTarget::Type(_) => rule
            .concrete_types
            .iter()
            .flat_map(|type_name| graph.instances_of(type_name))
            .collect(),
        RuleTarget::StorageType(tag) => graph.instances_of_storage_type(tag).into_iter().collect(),
    }
}

/// Walk the first `position` path elements backwards from `starts`
fn walk_back(graph: &dyn ObjectGraph, rule: &Rule, position: usize, starts: ObjectSet) -> ObjectSet {
    let prefix = &rule.path[..position.min(rule.path.len())];
    advance(graph, prefix.iter().rev(), starts, step_backward)
}

/// Restrict backward results to valid subjects of the rule
///
/// Without a base the result is filtered to objects the rule applies to. With a
/// base, reaching the base means every target object is affected; not reaching
/// it means none is.
fn gate(graph: &dyn ObjectGraph, rule: &Rule, reached: ObjectSet) -> ObjectSet {
    match &rule.base {
        None => reached
            .into_iter()
            .filter(|object| rule.matches_object(graph, object))
            .collect(),
        Some(base) if reached.contains(base) => target_objects(graph, rule),
        Some(_) => ObjectSet::new(),
    }
}

/// Subject objects whose forward evaluation may traverse `link`
pub fn affected_base_objects(graph: &dyn ObjectGraph, rule: &Rule, link: &Link) -> ObjectSet {
    let mut reached = ObjectSet::new();
    for (position, element) in rule.path.iter().enumerate() {
        let Some(hop) = element.as_hop() else {
            continue;
        };
        if !element.matches_link(link) {
            continue;
        }
        let start = if hop.inverse {
            link.destination()
        } else {
            link.source()
        };
        reached.extend(walk_back(graph, rule, position, ObjectSet::from([start.to_string()])));
    }
    if reached.is_empty() {
        return reached;
    }
    gate(graph, rule, reached)
}

/// Subject objects whose path ends at `object`
///
/// For an inheritance rule these are the objects that inherit through `object`.
pub fn base_objects(graph: &dyn ObjectGraph, rule: &Rule, object: &str) -> ObjectSet {
    let reached = walk_back(graph, rule, rule.path.len(), ObjectSet::from([object.to_string()]));
    if reached.is_empty() {
        return reached;
    }
    gate(graph, rule, reached)
}
