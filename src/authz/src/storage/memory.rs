//! In-memory grant store

use super::GrantStore;
use crate::error::Result;
use crate::types::{GrantReason, GroupId, GroupSet, ObjectId, ObjectSet, RoleGrant, RoleId, RoleSet};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct StoreState {
    /// object -> facts on it
    by_object: BTreeMap<ObjectId, BTreeSet<RoleGrant>>,
    dirty: bool,
    version: Option<String>,
}

impl StoreState {
    fn add(&mut self, grant: RoleGrant) {
        self.by_object.entry(grant.object.clone()).or_default().insert(grant);
    }

    fn grants(&self) -> impl Iterator<Item = &RoleGrant> {
        self.by_object.values().flatten()
    }
}

/// Grant store held entirely in memory
#[derive(Debug, Clone, Default)]
pub struct InMemoryGrantStore {
    state: Arc<RwLock<StoreState>>,
}

impl InMemoryGrantStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored facts
    pub async fn len(&self) -> usize {
        self.state.read().await.by_object.values().map(BTreeSet::len).sum()
    }
}

#[async_trait]
impl GrantStore for InMemoryGrantStore {
    async fn has_role(&self, groups: &[GroupId], objects: &[ObjectId], roles: &[RoleId]) -> Result<bool> {
        let state = self.state.read().await;
        let groups: HashSet<&str> = groups.iter().map(String::as_str).collect();
        let roles: HashSet<&str> = roles.iter().map(String::as_str).collect();
        Ok(objects
            .iter()
            .filter_map(|object| state.by_object.get(object))
            .flatten()
            .any(|g| groups.contains(g.group.as_str()) && roles.contains(g.role.as_str())))
    }

    async fn get_roles(&self, groups: &[GroupId], objects: &[ObjectId]) -> Result<RoleSet> {
        let state = self.state.read().await;
        let groups: HashSet<&str> = groups.iter().map(String::as_str).collect();
        Ok(objects
            .iter()
            .filter_map(|object| state.by_object.get(object))
            .flatten()
            .filter(|g| groups.contains(g.group.as_str()))
            .map(|g| g.role.clone())
            .collect())
    }

    async fn business_object_ids(
        &self,
        groups: &[GroupId],
        roles: &[RoleId],
        restrict_to: Option<&[ObjectId]>,
    ) -> Result<ObjectSet> {
        let state = self.state.read().await;
        let groups: HashSet<&str> = groups.iter().map(String::as_str).collect();
        let roles: HashSet<&str> = roles.iter().map(String::as_str).collect();
        let restrict: Option<HashSet<&str>> = restrict_to.map(|ids| ids.iter().map(String::as_str).collect());
        Ok(state
            .grants()
            .filter(|g| groups.contains(g.group.as_str()) && roles.contains(g.role.as_str()))
            .filter(|g| restrict.as_ref().map(|r| r.contains(g.object.as_str())).unwrap_or(true))
            .map(|g| g.object.clone())
            .collect())
    }

    async fn get_groups(&self, object: &str, role: &str) -> Result<GroupSet> {
        let state = self.state.read().await;
        Ok(state
            .by_object
            .get(object)
            .into_iter()
            .flatten()
            .filter(|g| g.role == role)
            .map(|g| g.group.clone())
            .collect())
    }

    async fn replace_grants(&self, reason: &GrantReason, object: &str, grants: Vec<RoleGrant>) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(existing) = state.by_object.get_mut(object) {
            existing.retain(|g| &g.reason != reason);
            if existing.is_empty() {
                state.by_object.remove(object);
            }
        }
        for grant in grants {
            state.add(grant);
        }
        Ok(())
    }

    async fn insert(&self, grants: Vec<RoleGrant>) -> Result<()> {
        let mut state = self.state.write().await;
        for grant in grants {
            state.add(grant);
        }
        Ok(())
    }

    async fn remove(&self, grants: &[RoleGrant]) -> Result<()> {
        let mut state = self.state.write().await;
        for grant in grants {
            if let Some(existing) = state.by_object.get_mut(&grant.object) {
                existing.remove(grant);
                if existing.is_empty() {
                    state.by_object.remove(&grant.object);
                }
            }
        }
        Ok(())
    }

    async fn remove_objects(&self, objects: &[ObjectId]) -> Result<usize> {
        let mut state = self.state.write().await;
        Ok(objects
            .iter()
            .filter_map(|object| state.by_object.remove(object))
            .map(|grants| grants.len())
            .sum())
    }

    async fn remove_groups(&self, groups: &[GroupId]) -> Result<usize> {
        let mut state = self.state.write().await;
        let groups: HashSet<&str> = groups.iter().map(String::as_str).collect();
        let mut removed = 0;
        for grants in state.by_object.values_mut() {
            let before = grants.len();
            grants.retain(|g| !groups.contains(g.group.as_str()));
            removed += before - grants.len();
        }
        state.by_object.retain(|_, grants| !grants.is_empty());
        Ok(removed)
    }

    async fn clear(&self) -> Result<()> {
        self.state.write().await.by_object.clear();
        Ok(())
    }

    async fn is_empty(&self) -> Result<bool> {
        Ok(self.state.read().await.by_object.is_empty())
    }

    async fn all_grants(&self) -> Result<Vec<RoleGrant>> {
        Ok(self.state.read().await.grants().cloned().collect())
    }

    async fn dirty_flag(&self) -> Result<bool> {
        Ok(self.state.read().await.dirty)
    }

    async fn set_dirty_flag(&self, dirty: bool) -> Result<()> {
        self.state.write().await.dirty = dirty;
        Ok(())
    }

    async fn config_version(&self) -> Result<Option<String>> {
        Ok(self.state.read().await.version.clone())
    }

    async fn set_config_version(&self, version: &str) -> Result<()> {
        self.state.write().await.version = Some(version.to_string());
        Ok(())
    }
}
