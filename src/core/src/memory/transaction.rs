//! Transaction builder over an [`InMemoryGraph`] snapshot

use super::{InMemoryGraph, Principal, StoredObject};
use crate::error::{CoreError, GraphError, Result};
use crate::traits::ObjectGraph;
use crate::types::{ChangeSet, Commit, Link, ObjectId, ObjectInfo, RoleAssignment, TypeName};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Type name given to persons created via [`GraphTransaction::create_person`]
pub const PERSON_TYPE: &str = "Person";

/// Type name given to groups created via [`GraphTransaction::create_group`]
pub const GROUP_TYPE: &str = "Group";

/// Mutates a private copy of a snapshot and records the resulting [`ChangeSet`]
pub struct GraphTransaction {
    base: Arc<InMemoryGraph>,
    working: InMemoryGraph,
    changes: ChangeSet,
}

impl GraphTransaction {
    pub(crate) fn new(base: Arc<InMemoryGraph>) -> Self {
        let working = (*base).clone();
        Self {
            base,
            working,
            changes: ChangeSet::default(),
        }
    }

    /// The graph as this transaction currently sees it
    pub fn graph(&self) -> &InMemoryGraph {
        &self.working
    }

    pub fn changes(&self) -> &ChangeSet {
        &self.changes
    }

    // ------------------------------------------------------------------
    // Objects
    // ------------------------------------------------------------------

    pub fn create(&mut self, id: impl Into<ObjectId>, type_name: impl Into<TypeName>) -> Result<()> {
        self.insert_object(id.into(), type_name.into(), None)
    }

    /// Create a person; a person is its own singleton group
    pub fn create_person(&mut self, id: impl Into<ObjectId>) -> Result<()> {
        self.insert_object(id.into(), PERSON_TYPE.to_string(), Some(Principal::Person))
    }

    pub fn create_group(&mut self, id: impl Into<ObjectId>) -> Result<()> {
        self.insert_object(id.into(), GROUP_TYPE.to_string(), Some(Principal::Group))
    }

    fn insert_object(&mut self, id: ObjectId, type_name: TypeName, principal: Option<Principal>) -> Result<()> {
        if self.working.objects.contains_key(&id) {
            return Err(CoreError::transaction(format!("object {} already exists", id)));
        }
        if self.changes.removed.contains_key(&id) {
            return Err(CoreError::transaction(format!(
                "object {} was deleted in this transaction",
                id
            )));
        }
        let storage_type = self.working.model.storage_type_of(&type_name);
        let info = ObjectInfo {
            id: id.clone(),
            type_name,
            storage_type,
        };
        self.working.objects.insert(
            id.clone(),
            StoredObject {
                info: info.clone(),
                attributes: BTreeMap::new(),
                parent: None,
                principal,
            },
        );
        if principal == Some(Principal::Group) {
            self.working.members.entry(id.clone()).or_default();
        }
        self.changes.created.insert(id, info);
        Ok(())
    }

    /// Delete an object together with every link touching it
    pub fn delete(&mut self, id: &str) -> Result<()> {
        let object = self
            .working
            .objects
            .get(id)
            .cloned()
            .ok_or_else(|| CoreError::not_found(id.to_string()))?;

        for (attribute, values) in &object.attributes {
            for value in values {
                self.unindex_reference(id, attribute, value);
                self.record_removed(Link::attribute(id, attribute.clone(), value.clone()));
            }
        }
        if let Some(stored) = self.working.objects.get_mut(id) {
            stored.attributes.clear();
        }

        let incoming_refs: Vec<(String, ObjectId)> = self
            .working
            .referers
            .iter()
            .filter(|((target, _), _)| target.as_str() == id)
            .flat_map(|((_, attribute), owners)| owners.iter().map(move |o| (attribute.clone(), o.clone())))
            .collect();
        for (attribute, owner) in incoming_refs {
            self.remove_reference(&owner, &attribute, id)?;
        }

        let outgoing_links: Vec<(String, ObjectId)> = self
            .working
            .outgoing
            .iter()
            .filter(|((source, _), _)| source.as_str() == id)
            .flat_map(|((_, name), dsts)| dsts.iter().map(move |d| (name.clone(), d.clone())))
            .collect();
        for (name, destination) in outgoing_links {
            self.unlink(&name, id, &destination)?;
        }
        let incoming_links: Vec<(String, ObjectId)> = self
            .working
            .incoming
            .iter()
            .filter(|((destination, _), _)| destination.as_str() == id)
            .flat_map(|((_, name), srcs)| srcs.iter().map(move |s| (name.clone(), s.clone())))
            .collect();
        for (name, source) in incoming_links {
            self.unlink(&name, &source, id)?;
        }

        let assignments: Vec<RoleAssignment> = self
            .working
            .assignments
            .iter()
            .filter(|a| a.object == id || a.group == id)
            .cloned()
            .collect();
        for assignment in assignments {
            self.revoke_role(&assignment.object, &assignment.role, &assignment.group)?;
        }

        self.working.members.remove(id);
        for members in self.working.members.values_mut() {
            members.remove(id);
        }

        let children: Vec<ObjectId> = self
            .working
            .objects
            .values()
            .filter(|o| o.parent.as_deref() == Some(id))
            .map(|o| o.info.id.clone())
            .collect();
        for child in children {
            if let Some(stored) = self.working.objects.get_mut(&child) {
                stored.parent = None;
            }
            self.mark_changed(&child);
        }

        self.working.objects.remove(id);
        self.changes.changed.remove(id);
        if self.changes.created.remove(id).is_none() {
            self.changes.removed.insert(id.to_string(), object.info);
        }
        Ok(())
    }

    pub fn set_security_parent(&mut self, id: &str, parent: Option<&str>) -> Result<()> {
        self.require(id)?;
        if let Some(parent) = parent {
            self.require(parent)?;
        }
        if let Some(stored) = self.working.objects.get_mut(id) {
            stored.parent = parent.map(str::to_string);
        }
        self.mark_changed(id);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Attribute references
    // ------------------------------------------------------------------

    /// Replace the values of a reference attribute
    pub fn set_attribute<I, S>(&mut self, id: &str, attribute: &str, values: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<ObjectId>,
    {
        let mut values: Vec<ObjectId> = values.into_iter().map(Into::into).collect();
        values.sort();
        values.dedup();
        self.check_attribute(id, attribute)?;
        for value in &values {
            self.require(value)?;
        }

        let old = self
            .working
            .objects
            .get(id)
            .and_then(|o| o.attributes.get(attribute))
            .cloned()
            .unwrap_or_default();
        for value in old.iter().filter(|v| !values.contains(v)) {
            self.unindex_reference(id, attribute, value);
            self.record_removed(Link::attribute(id, attribute, value.clone()));
        }
        for value in values.iter().filter(|v| !old.contains(v)) {
            self.index_reference(id, attribute, value);
            self.record_created(Link::attribute(id, attribute, value.clone()));
        }

        if let Some(stored) = self.working.objects.get_mut(id) {
            if values.is_empty() {
                stored.attributes.remove(attribute);
            } else {
                stored.attributes.insert(attribute.to_string(), values);
            }
        }
        self.mark_changed(id);
        Ok(())
    }

    pub fn add_reference(&mut self, id: &str, attribute: &str, value: &str) -> Result<()> {
        let mut values = self.current_values(id, attribute)?;
        values.push(value.to_string());
        self.set_attribute(id, attribute, values)
    }

    pub fn remove_reference(&mut self, id: &str, attribute: &str, value: &str) -> Result<()> {
        let values: Vec<ObjectId> = self
            .current_values(id, attribute)?
            .into_iter()
            .filter(|v| v != value)
            .collect();
        self.set_attribute(id, attribute, values)
    }

    fn current_values(&self, id: &str, attribute: &str) -> Result<Vec<ObjectId>> {
        Ok(self
            .require(id)?
            .attributes
            .get(attribute)
            .cloned()
            .unwrap_or_default())
    }

    // ------------------------------------------------------------------
    // Associations, memberships and role assignments
    // ------------------------------------------------------------------

    pub fn link(&mut self, association: &str, source: &str, destination: &str) -> Result<()> {
        self.require(source)?;
        self.require(destination)?;
        let inserted = self
            .working
            .outgoing
            .entry((source.to_string(), association.to_string()))
            .or_default()
            .insert(destination.to_string());
        if inserted {
            self.working
                .incoming
                .entry((destination.to_string(), association.to_string()))
                .or_default()
                .insert(source.to_string());
            self.record_created(Link::association(association, source, destination));
        }
        Ok(())
    }

    pub fn unlink(&mut self, association: &str, source: &str, destination: &str) -> Result<()> {
        let out_key = (source.to_string(), association.to_string());
        let removed = self
            .working
            .outgoing
            .get_mut(&out_key)
            .map(|dsts| dsts.remove(destination))
            .unwrap_or(false);
        if !removed {
            return Err(CoreError::not_found(format!(
                "{} -[{}]-> {}",
                source, association, destination
            )));
        }
        if self.working.outgoing.get(&out_key).map(|d| d.is_empty()).unwrap_or(false) {
            self.working.outgoing.remove(&out_key);
        }
        let in_key = (destination.to_string(), association.to_string());
        if let Some(srcs) = self.working.incoming.get_mut(&in_key) {
            srcs.remove(source);
            if srcs.is_empty() {
                self.working.incoming.remove(&in_key);
            }
        }
        self.record_removed(Link::association(association, source, destination));
        Ok(())
    }

    pub fn add_member(&mut self, group: &str, member: &str) -> Result<()> {
        self.require_group(group)?;
        self.require(member)?;
        self.working
            .members
            .entry(group.to_string())
            .or_default()
            .insert(member.to_string());
        self.mark_changed(group);
        Ok(())
    }

    pub fn remove_member(&mut self, group: &str, member: &str) -> Result<()> {
        self.require_group(group)?;
        if let Some(members) = self.working.members.get_mut(group) {
            members.remove(member);
        }
        self.mark_changed(group);
        Ok(())
    }

    /// Grant `role` on `object` to `group` directly
    pub fn assign_role(&mut self, object: &str, role: &str, group: &str) -> Result<()> {
        self.require(object)?;
        self.require(group)?;
        let assignment = RoleAssignment::new(object, role, group);
        if self.working.assignments.insert(assignment.clone()) {
            self.record_created(Link::RoleAssignment(assignment));
        }
        Ok(())
    }

    pub fn revoke_role(&mut self, object: &str, role: &str, group: &str) -> Result<()> {
        let assignment = RoleAssignment::new(object, role, group);
        if self.working.assignments.remove(&assignment) {
            self.record_removed(Link::RoleAssignment(assignment));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Commit
    // ------------------------------------------------------------------

    /// Publish the working copy as a new snapshot
    pub fn commit(self) -> (Arc<InMemoryGraph>, Commit) {
        debug!(
            created = self.changes.created.len(),
            removed = self.changes.removed.len(),
            changed = self.changes.changed.len(),
            links = self.changes.link_count(),
            "committing graph transaction"
        );
        let mut working = self.working;
        working.snapshot = super::next_snapshot_id();
        let current = Arc::new(working);
        let commit = Commit {
            previous: self.base as Arc<dyn ObjectGraph>,
            current: Arc::clone(&current) as Arc<dyn ObjectGraph>,
            changes: self.changes,
        };
        (current, commit)
    }

    // ------------------------------------------------------------------
    // Bookkeeping
    // ------------------------------------------------------------------

    fn require(&self, id: &str) -> Result<&StoredObject> {
        self.working
            .objects
            .get(id)
            .ok_or_else(|| CoreError::not_found(id.to_string()))
    }

    fn require_group(&self, id: &str) -> Result<()> {
        match self.require(id)?.principal {
            Some(Principal::Group) => Ok(()),
            _ => Err(CoreError::transaction(format!("{} is not a group", id))),
        }
    }

    fn check_attribute(&self, id: &str, attribute: &str) -> Result<()> {
        let type_name = &self.require(id)?.info.type_name;
        let model = &self.working.model;
        if model.contains(type_name) && model.find_attribute(type_name, attribute).is_none() {
            return Err(GraphError::UnknownAttribute {
                object: id.to_string(),
                attribute: attribute.to_string(),
            }
            .into());
        }
        Ok(())
    }

    fn index_reference(&mut self, owner: &str, attribute: &str, value: &str) {
        self.working
            .referers
            .entry((value.to_string(), attribute.to_string()))
            .or_default()
            .insert(owner.to_string());
    }

    fn unindex_reference(&mut self, owner: &str, attribute: &str, value: &str) {
        let key = (value.to_string(), attribute.to_string());
        if let Some(owners) = self.working.referers.get_mut(&key) {
            owners.remove(owner);
            if owners.is_empty() {
                self.working.referers.remove(&key);
            }
        }
    }

    fn record_created(&mut self, link: Link) {
        match self.changes.removed_links.iter().position(|l| *l == link) {
            Some(pos) => {
                self.changes.removed_links.remove(pos);
            }
            None => self.changes.created_links.push(link),
        }
    }

    fn record_removed(&mut self, link: Link) {
        match self.changes.created_links.iter().position(|l| *l == link) {
            Some(pos) => {
                self.changes.created_links.remove(pos);
            }
            None => self.changes.removed_links.push(link),
        }
    }

    fn mark_changed(&mut self, id: &str) {
        if self.changes.created.contains_key(id) || self.changes.removed.contains_key(id) {
            return;
        }
        if let Some(stored) = self.working.objects.get(id) {
            self.changes.changed.insert(id.to_string(), stored.info.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{TypeDef, TypeModel};

    fn model() -> Arc<TypeModel> {
        Arc::new(
            TypeModel::from_types([
                TypeDef::new("Project").with_reference("owner", "Person"),
                TypeDef::new("Task"),
                TypeDef::new("Person"),
                TypeDef::new("Group"),
            ])
            .unwrap(),
        )
    }

    fn seeded() -> Arc<InMemoryGraph> {
        let empty = Arc::new(InMemoryGraph::new(model()));
        let mut tx = empty.transaction();
        tx.create_person("u1").unwrap();
        tx.create_person("u2").unwrap();
        tx.create("p1", "Project").unwrap();
        tx.create("t1", "Task").unwrap();
        tx.set_attribute("p1", "owner", ["u1"]).unwrap();
        tx.link("belongsTo", "p1", "t1").unwrap();
        tx.commit().0
    }

    #[test]
    fn test_attribute_change_records_both_sides() {
        let graph = seeded();
        let mut tx = graph.transaction();
        tx.set_attribute("p1", "owner", ["u2"]).unwrap();
        let (current, commit) = tx.commit();

        assert_ne!(current.snapshot_id(), graph.snapshot_id());
        assert_eq!(commit.previous.snapshot_id(), graph.snapshot_id());
        assert_eq!(commit.changes.removed_links, vec![Link::attribute("p1", "owner", "u1")]);
        assert_eq!(commit.changes.created_links, vec![Link::attribute("p1", "owner", "u2")]);
        assert!(commit.changes.changed.contains_key("p1"));
        assert_eq!(current.attribute_values("p1", "owner").unwrap(), vec!["u2"]);
        assert_eq!(commit.previous.attribute_values("p1", "owner").unwrap(), vec!["u1"]);
        assert_eq!(current.referers("u2", "owner").unwrap(), vec!["p1"]);
        assert!(current.referers("u1", "owner").unwrap().is_empty());
    }

    #[test]
    fn test_delete_removes_touching_links() {
        let graph = seeded();
        let mut tx = graph.transaction();
        tx.delete("u1").unwrap();
        let (current, commit) = tx.commit();

        assert!(commit.changes.removed.contains_key("u1"));
        assert!(commit.changes.removed_links.contains(&Link::attribute("p1", "owner", "u1")));
        assert!(current.attribute_values("p1", "owner").unwrap().is_empty());
        assert!(!current.contains("u1"));
    }

    #[test]
    fn test_create_then_delete_cancels_out() {
        let graph = seeded();
        let mut tx = graph.transaction();
        tx.create("t2", "Task").unwrap();
        tx.link("belongsTo", "p1", "t2").unwrap();
        tx.delete("t2").unwrap();
        let (_, commit) = tx.commit();

        assert!(commit.changes.created.is_empty());
        assert!(commit.changes.removed.is_empty());
        assert!(commit.changes.created_links.is_empty());
        assert!(commit.changes.removed_links.is_empty());
    }

    #[test]
    fn test_unknown_attribute_rejected() {
        let graph = seeded();
        let mut tx = graph.transaction();
        let err = tx.set_attribute("t1", "owner", ["u1"]).unwrap_err();
        assert!(matches!(err, CoreError::Graph(GraphError::UnknownAttribute { .. })));
    }

    #[test]
    fn test_nested_group_memberships() {
        let graph = seeded();
        let mut tx = graph.transaction();
        tx.create_group("team").unwrap();
        tx.create_group("department").unwrap();
        tx.add_member("team", "u1").unwrap();
        tx.add_member("department", "team").unwrap();
        let (current, _) = tx.commit();

        assert_eq!(current.memberships("u1"), vec!["department", "team", "u1"]);
        assert_eq!(current.represented_groups("team"), vec!["team"]);
        assert!(current.represented_groups("p1").is_empty());
    }

    #[test]
    fn test_role_assignment_links() {
        let graph = seeded();
        let mut tx = graph.transaction();
        tx.assign_role("p1", "Member", "u2").unwrap();
        let (current, commit) = tx.commit();

        assert_eq!(
            commit.changes.created_links,
            vec![Link::RoleAssignment(RoleAssignment::new("p1", "Member", "u2"))]
        );
        assert_eq!(current.role_assignments("p1").len(), 1);
    }

    #[test]
    fn test_security_chain_stops_on_cycle() {
        let graph = seeded();
        let mut tx = graph.transaction();
        tx.set_security_parent("t1", Some("p1")).unwrap();
        tx.set_security_parent("p1", Some("t1")).unwrap();
        let (current, _) = tx.commit();

        assert_eq!(current.security_chain("t1"), vec!["t1", "p1"]);
    }
}
