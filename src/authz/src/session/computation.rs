//! Per-subject role computations over the persisted index

use crate::error::{Result, SecurityError};
use crate::metrics::SecurityMetrics;
use crate::storage::GrantStore;
use crate::types::{GroupId, ObjectId, ObjectSet, RoleId, RoleSet};
use async_trait::async_trait;
use dashmap::DashMap;
use rolegraph_core::ObjectGraph;
use std::sync::Arc;
use tracing::warn;

/// Role questions for one subject, answered from stored facts
///
/// Storage errors are logged and answered with "no role".
#[async_trait]
pub trait RoleComputation: Send + Sync {
    fn subject(&self) -> &str;

    async fn has_role(&self, object: &str, roles: &[RoleId]) -> bool;

    async fn get_roles(&self, object: &str) -> Arc<RoleSet>;

    /// The subset of `objects` on which the subject holds any of `roles`, in input order
    async fn get_allowed_objects(&self, roles: &[RoleId], objects: &[ObjectId]) -> Vec<ObjectId>;
}

/// Queries the grant store on every call
pub struct StorageRoleComputation {
    subject: String,
    groups: Vec<GroupId>,
    graph: Arc<dyn ObjectGraph>,
    store: Arc<dyn GrantStore>,
    metrics: Arc<SecurityMetrics>,
}

impl StorageRoleComputation {
    pub fn new(
        subject: impl Into<String>,
        graph: Arc<dyn ObjectGraph>,
        store: Arc<dyn GrantStore>,
        metrics: Arc<SecurityMetrics>,
    ) -> Self {
        let subject = subject.into();
        let groups = graph.memberships(&subject);
        Self {
            subject,
            groups,
            graph,
            store,
            metrics,
        }
    }

    /// Groups the subject acts as
    pub fn groups(&self) -> &[GroupId] {
        &self.groups
    }

    /// Stored roles on `object` and its security parents
    pub async fn load_roles(&self, object: &str) -> Result<RoleSet> {
        if self.groups.is_empty() {
            return Ok(RoleSet::new());
        }
        let chain = self.graph.security_chain(object);
        self.store.get_roles(&self.groups, &chain).await
    }

    async fn storage_failed(&self, operation: &str, err: &SecurityError) {
        warn!(subject = %self.subject, operation, error = %err, "role lookup failed, denying");
        self.metrics.record_storage_failure().await;
    }
}

#[async_trait]
impl RoleComputation for StorageRoleComputation {
    fn subject(&self) -> &str {
        &self.subject
    }

    async fn has_role(&self, object: &str, roles: &[RoleId]) -> bool {
        if self.groups.is_empty() || roles.is_empty() {
            return false;
        }
        let chain = self.graph.security_chain(object);
        match self.store.has_role(&self.groups, &chain, roles).await {
            Ok(found) => found,
            Err(err) => {
                self.storage_failed("has_role", &err).await;
                false
            }
        }
    }

    async fn get_roles(&self, object: &str) -> Arc<RoleSet> {
        match self.load_roles(object).await {
            Ok(roles) => Arc::new(roles),
            Err(err) => {
                self.storage_failed("get_roles", &err).await;
                Arc::new(RoleSet::new())
            }
        }
    }

    async fn get_allowed_objects(&self, roles: &[RoleId], objects: &[ObjectId]) -> Vec<ObjectId> {
        if self.groups.is_empty() || roles.is_empty() || objects.is_empty() {
            return Vec::new();
        }
        let chains: Vec<Vec<ObjectId>> = objects.iter().map(|o| self.graph.security_chain(o)).collect();
        let candidates: Vec<ObjectId> = chains
            .iter()
            .flatten()
            .cloned()
            .collect::<ObjectSet>()
            .into_iter()
            .collect();

        let mut granted = ObjectSet::new();
        for chunk in candidates.chunks(crate::storage::MAX_LIST_LENGTH) {
            match self.store.business_object_ids(&self.groups, roles, Some(chunk)).await {
                Ok(found) => granted.extend(found),
                Err(err) => {
                    self.storage_failed("get_allowed_objects", &err).await;
                    return Vec::new();
                }
            }
        }

        objects
            .iter()
            .zip(chains.iter())
            .filter(|(_, chain)| chain.iter().any(|o| granted.contains(o)))
            .map(|(object, _)| object.clone())
            .collect()
    }
}

/// Interns role sets by content so objects with equal roles share one allocation
#[derive(Debug, Default)]
pub struct RoleSetPool {
    sets: DashMap<[u8; 32], Arc<RoleSet>>,
}

impl RoleSetPool {
    pub fn new() -> Self {
        Self::default()
    }

    fn digest(roles: &RoleSet) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        for role in roles {
            hasher.update(role.as_bytes());
            hasher.update(&[0]);
        }
        *hasher.finalize().as_bytes()
    }

    /// Shared instance equal to `roles`
    pub fn intern(&self, roles: RoleSet) -> Arc<RoleSet> {
        self.sets
            .entry(Self::digest(&roles))
            .or_insert_with(|| Arc::new(roles))
            .clone()
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    pub fn clear(&self) {
        self.sets.clear();
    }
}

/// Memoizes role sets per object on top of [`StorageRoleComputation`]
///
/// Concurrent first lookups may both hit the store; the first stored answer wins.
/// Failed lookups are not cached.
pub struct CachingRoleComputation {
    inner: StorageRoleComputation,
    roles: DashMap<ObjectId, Arc<RoleSet>>,
    pool: Arc<RoleSetPool>,
}

impl CachingRoleComputation {
    pub fn new(inner: StorageRoleComputation, pool: Arc<RoleSetPool>) -> Self {
        Self {
            inner,
            roles: DashMap::new(),
            pool,
        }
    }

    /// Number of objects with a cached role set
    pub fn cached_objects(&self) -> usize {
        self.roles.len()
    }

    pub fn reset(&self) {
        self.roles.clear();
    }
}

#[async_trait]
impl RoleComputation for CachingRoleComputation {
    fn subject(&self) -> &str {
        self.inner.subject()
    }

    async fn has_role(&self, object: &str, roles: &[RoleId]) -> bool {
        let held = self.get_roles(object).await;
        roles.iter().any(|role| held.contains(role))
    }

    async fn get_roles(&self, object: &str) -> Arc<RoleSet> {
        let cached = self.roles.get(object).map(|entry| entry.value().clone());
        if let Some(cached) = cached {
            self.inner.metrics.record_session_cache(true).await;
            return cached;
        }
        self.inner.metrics.record_session_cache(false).await;
        match self.inner.load_roles(object).await {
            Ok(roles) => {
                let shared = self.pool.intern(roles);
                self.roles.entry(object.to_string()).or_insert(shared).clone()
            }
            Err(err) => {
                self.inner.storage_failed("get_roles", &err).await;
                Arc::new(RoleSet::new())
            }
        }
    }

    async fn get_allowed_objects(&self, roles: &[RoleId], objects: &[ObjectId]) -> Vec<ObjectId> {
        let mut allowed = Vec::new();
        for object in objects {
            if self.has_role(object, roles).await {
                allowed.push(object.clone());
            }
        }
        allowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryGrantStore;
    use crate::types::{GrantReason, GroupSet, RoleGrant};
    use rolegraph_core::{InMemoryGraph, TypeDef, TypeModel};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Counts `get_roles` calls and fails on demand
    #[derive(Default)]
    struct RecordingStore {
        inner: InMemoryGrantStore,
        calls: AtomicUsize,
        failing: AtomicBool,
    }

    impl RecordingStore {
        fn check(&self) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                Err(SecurityError::storage("offline"))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl GrantStore for RecordingStore {
        async fn has_role(&self, groups: &[GroupId], objects: &[ObjectId], roles: &[RoleId]) -> Result<bool> {
            self.check()?;
            self.inner.has_role(groups, objects, roles).await
        }
        async fn get_roles(&self, groups: &[GroupId], objects: &[ObjectId]) -> Result<RoleSet> {
            self.check()?;
            self.inner.get_roles(groups, objects).await
        }
        async fn business_object_ids(
            &self,
            groups: &[GroupId],
            roles: &[RoleId],
            restrict_to: Option<&[ObjectId]>,
        ) -> Result<ObjectSet> {
            self.check()?;
            self.inner.business_object_ids(groups, roles, restrict_to).await
        }
        async fn get_groups(&self, object: &str, role: &str) -> Result<GroupSet> {
            self.inner.get_groups(object, role).await
        }
        async fn replace_grants(&self, reason: &GrantReason, object: &str, grants: Vec<RoleGrant>) -> Result<()> {
            self.inner.replace_grants(reason, object, grants).await
        }
        async fn insert(&self, grants: Vec<RoleGrant>) -> Result<()> {
            self.inner.insert(grants).await
        }
        async fn remove(&self, grants: &[RoleGrant]) -> Result<()> {
            self.inner.remove(grants).await
        }
        async fn remove_objects(&self, objects: &[ObjectId]) -> Result<usize> {
            self.inner.remove_objects(objects).await
        }
        async fn remove_groups(&self, groups: &[GroupId]) -> Result<usize> {
            self.inner.remove_groups(groups).await
        }
        async fn clear(&self) -> Result<()> {
            self.inner.clear().await
        }
        async fn is_empty(&self) -> Result<bool> {
            self.inner.is_empty().await
        }
        async fn all_grants(&self) -> Result<Vec<RoleGrant>> {
            self.inner.all_grants().await
        }
        async fn dirty_flag(&self) -> Result<bool> {
            self.inner.dirty_flag().await
        }
        async fn set_dirty_flag(&self, dirty: bool) -> Result<()> {
            self.inner.set_dirty_flag(dirty).await
        }
        async fn config_version(&self) -> Result<Option<String>> {
            self.inner.config_version().await
        }
        async fn set_config_version(&self, version: &str) -> Result<()> {
            self.inner.set_config_version(version).await
        }
    }

    fn graph() -> Arc<dyn ObjectGraph> {
        let model = TypeModel::from_types([TypeDef::new("Project"), TypeDef::new("Task")]).unwrap();
        let mut tx = Arc::new(InMemoryGraph::new(Arc::new(model))).transaction();
        tx.create_person("u1").unwrap();
        tx.create("p1", "Project").unwrap();
        tx.create("p2", "Project").unwrap();
        tx.create("t1", "Task").unwrap();
        tx.set_security_parent("t1", Some("p1")).unwrap();
        tx.commit().0
    }

    async fn store() -> Arc<RecordingStore> {
        let store = Arc::new(RecordingStore::default());
        let owner = GrantReason::Rule("owner".to_string());
        store
            .insert(vec![
                RoleGrant::new("u1", "Member", "p1", owner.clone()),
                RoleGrant::new("u1", "Member", "p2", owner),
            ])
            .await
            .unwrap();
        store
    }

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[tokio::test]
    async fn test_storage_computation_follows_security_chain() {
        let computation =
            StorageRoleComputation::new("u1", graph(), store().await, Arc::new(SecurityMetrics::new()));

        assert!(computation.has_role("t1", &ids(&["Member"])).await);
        assert!(!computation.has_role("t1", &ids(&["Viewer"])).await);
        assert_eq!(*computation.get_roles("t1").await, RoleSet::from(["Member".to_string()]));

        let objects = ids(&["t1", "p2", "unknown"]);
        let allowed = computation.get_allowed_objects(&ids(&["Member"]), &objects).await;
        assert_eq!(allowed, ids(&["t1", "p2"]));
    }

    #[tokio::test]
    async fn test_storage_errors_deny() {
        let store = store().await;
        store.failing.store(true, Ordering::SeqCst);
        let metrics = Arc::new(SecurityMetrics::new());
        let computation = StorageRoleComputation::new("u1", graph(), store, metrics.clone());

        assert!(!computation.has_role("p1", &ids(&["Member"])).await);
        assert!(computation.get_roles("p1").await.is_empty());
        assert!(computation.get_allowed_objects(&ids(&["Member"]), &ids(&["p1"])).await.is_empty());
        assert_eq!(metrics.snapshot().await.storage_failures, 3);
    }

    #[tokio::test]
    async fn test_caching_memoizes_and_shares_sets() {
        let store = store().await;
        let pool = Arc::new(RoleSetPool::new());
        let inner = StorageRoleComputation::new("u1", graph(), store.clone(), Arc::new(SecurityMetrics::new()));
        let computation = CachingRoleComputation::new(inner, pool.clone());

        let first = computation.get_roles("p1").await;
        let again = computation.get_roles("p1").await;
        let other = computation.get_roles("p2").await;

        assert_eq!(store.calls.load(Ordering::SeqCst), 2);
        assert!(Arc::ptr_eq(&first, &again));
        assert!(Arc::ptr_eq(&first, &other));
        assert_eq!(pool.len(), 1);
        assert_eq!(computation.cached_objects(), 2);
        assert!(computation.has_role("p1", &ids(&["Member"])).await);
    }

    #[tokio::test]
    async fn test_caching_does_not_keep_failures() {
        let store = store().await;
        let inner = StorageRoleComputation::new("u1", graph(), store.clone(), Arc::new(SecurityMetrics::new()));
        let computation = CachingRoleComputation::new(inner, Arc::new(RoleSetPool::new()));

        store.failing.store(true, Ordering::SeqCst);
        assert!(computation.get_roles("p1").await.is_empty());
        assert_eq!(computation.cached_objects(), 0);

        store.failing.store(false, Ordering::SeqCst);
        assert!(computation.get_roles("p1").await.contains("Member"));
    }
}
