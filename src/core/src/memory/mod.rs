//! In-memory object graph with snapshot transactions
//!
//! Every committed transaction produces a new immutable [`InMemoryGraph`]; the
//! previous snapshot stays valid, which is exactly what a [`Commit`](crate::types::Commit)
//! needs to evaluate removals against the pre-commit state.

mod transaction;

pub use transaction::{GraphTransaction, GROUP_TYPE, PERSON_TYPE};

use crate::error::GraphError;
use crate::traits::{GraphResult, ObjectGraph};
use crate::types::{GroupId, ObjectId, ObjectInfo, RoleAssignment, TypeModel};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_SNAPSHOT: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_snapshot_id() -> u64 {
    NEXT_SNAPSHOT.fetch_add(1, Ordering::Relaxed)
}

/// Principal flavour of an object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Principal {
    Person,
    Group,
}

#[derive(Debug, Clone)]
pub(crate) struct StoredObject {
    pub(crate) info: ObjectInfo,
    pub(crate) attributes: BTreeMap<String, Vec<ObjectId>>,
    pub(crate) parent: Option<ObjectId>,
    pub(crate) principal: Option<Principal>,
}

type EdgeKey = (ObjectId, String);

/// Immutable snapshot of an in-memory object graph
#[derive(Debug, Clone)]
pub struct InMemoryGraph {
    pub(crate) snapshot: u64,
    pub(crate) model: Arc<TypeModel>,
    pub(crate) objects: BTreeMap<ObjectId, StoredObject>,
    /// (value, attribute) -> owners referencing it
    pub(crate) referers: BTreeMap<EdgeKey, BTreeSet<ObjectId>>,
    /// (source, association) -> destinations
    pub(crate) outgoing: BTreeMap<EdgeKey, BTreeSet<ObjectId>>,
    /// (destination, association) -> sources
    pub(crate) incoming: BTreeMap<EdgeKey, BTreeSet<ObjectId>>,
    /// group -> direct members
    pub(crate) members: BTreeMap<GroupId, BTreeSet<ObjectId>>,
    pub(crate) assignments: BTreeSet<RoleAssignment>,
}

impl InMemoryGraph {
    /// Create an empty graph over a type model
    pub fn new(model: Arc<TypeModel>) -> Self {
        Self {
            snapshot: next_snapshot_id(),
            model,
            objects: BTreeMap::new(),
            referers: BTreeMap::new(),
            outgoing: BTreeMap::new(),
            incoming: BTreeMap::new(),
            members: BTreeMap::new(),
            assignments: BTreeSet::new(),
        }
    }

    pub fn model(&self) -> &TypeModel {
        &self.model
    }

    pub fn shared_model(&self) -> Arc<TypeModel> {
        Arc::clone(&self.model)
    }

    /// Start a transaction on top of this snapshot
    pub fn transaction(self: &Arc<Self>) -> GraphTransaction {
        GraphTransaction::new(Arc::clone(self))
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    pub fn object_ids(&self) -> impl Iterator<Item = &ObjectId> {
        self.objects.keys()
    }

    pub(crate) fn stored(&self, id: &str) -> GraphResult<&StoredObject> {
        self.objects
            .get(id)
            .ok_or_else(|| GraphError::UnknownObject(id.to_string()))
    }

    fn edge_targets(map: &BTreeMap<EdgeKey, BTreeSet<ObjectId>>, id: &str, name: &str) -> Vec<ObjectId> {
        map.get(&(id.to_string(), name.to_string()))
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl ObjectGraph for InMemoryGraph {
    fn snapshot_id(&self) -> u64 {
        self.snapshot
    }

    fn object_info(&self, id: &str) -> Option<ObjectInfo> {
        self.objects.get(id).map(|o| o.info.clone())
    }

    fn attribute_values(&self, id: &str, attribute: &str) -> GraphResult<Vec<ObjectId>> {
        let object = self.stored(id)?;
        let values = object.attributes.get(attribute).cloned().unwrap_or_default();
        if let Some(dangling) = values.iter().find(|v| !self.objects.contains_key(*v)) {
            return Err(GraphError::InvalidLink(format!("{}.{} -> {}", id, attribute, dangling)));
        }
        Ok(values)
    }

    fn referers(&self, id: &str, attribute: &str) -> GraphResult<Vec<ObjectId>> {
        self.stored(id)?;
        Ok(Self::edge_targets(&self.referers, id, attribute))
    }

    fn link_destinations(&self, source: &str, association: &str) -> GraphResult<Vec<ObjectId>> {
        self.stored(source)?;
        Ok(Self::edge_targets(&self.outgoing, source, association))
    }

    fn link_sources(&self, destination: &str, association: &str) -> GraphResult<Vec<ObjectId>> {
        self.stored(destination)?;
        Ok(Self::edge_targets(&self.incoming, destination, association))
    }

    fn security_parent(&self, id: &str) -> Option<ObjectId> {
        self.objects.get(id).and_then(|o| o.parent.clone())
    }

    fn instances_of(&self, type_name: &str) -> Vec<ObjectId> {
        self.objects
            .values()
            .filter(|o| o.info.type_name == type_name)
            .map(|o| o.info.id.clone())
            .collect()
    }

    fn instances_of_storage_type(&self, storage_type: &str) -> Vec<ObjectId> {
        self.objects
            .values()
            .filter(|o| o.info.storage_type == storage_type)
            .map(|o| o.info.id.clone())
            .collect()
    }

    fn represented_groups(&self, id: &str) -> Vec<GroupId> {
        match self.objects.get(id).and_then(|o| o.principal) {
            Some(_) => vec![id.to_string()],
            None => Vec::new(),
        }
    }

    fn memberships(&self, subject: &str) -> Vec<GroupId> {
        let Some(object) = self.objects.get(subject) else {
            return Vec::new();
        };
        let mut groups = BTreeSet::new();
        if object.principal.is_some() {
            groups.insert(subject.to_string());
        }
        // Nested groups: a member of g1 is a member of every group containing g1
        let mut queue = VecDeque::from([subject.to_string()]);
        while let Some(member) = queue.pop_front() {
            for (group, members) in &self.members {
                if members.contains(&member) && groups.insert(group.clone()) {
                    queue.push_back(group.clone());
                }
            }
        }
        groups.into_iter().collect()
    }

    fn role_assignments(&self, object: &str) -> Vec<RoleAssignment> {
        self.assignments
            .iter()
            .filter(|a| a.object == object)
            .cloned()
            .collect()
    }

    fn all_role_assignments(&self) -> Vec<RoleAssignment> {
        self.assignments.iter().cloned().collect()
    }
}
