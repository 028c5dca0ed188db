//! Storage-backed role index: facts computed from rules, plus rebuild state

use super::rebuild::{ClusterRebuildFlag, RebuildOutcome, RebuildReport};
use super::GrantStore;
use crate::access::AccessManager;
use crate::error::{Result, SecurityError};
use crate::metrics::SecurityMetrics;
use crate::provider::RoleProvider;
use crate::types::{GrantReason, GroupId, ObjectId, ObjectSet, RoleGrant};
use chrono::Utc;
use parking_lot::RwLock;
use rolegraph_core::{ObjectGraph, ObjectInfo, RoleAssignment, GROUP_TYPE, PERSON_TYPE};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Largest id list passed to one store call
pub const MAX_LIST_LENGTH: usize = 256;

/// Facts for one `(reason, object)` slot
type GrantBatch = (GrantReason, ObjectId, Vec<RoleGrant>);

/// The persisted `(group, role, object)` projection
pub struct SecurityIndex {
    store: Arc<dyn GrantStore>,
    flag: Arc<dyn ClusterRebuildFlag>,
    /// Mirror of the persisted dirty state for synchronous read routing
    dirty: AtomicBool,
    last_rebuild: RwLock<Option<RebuildReport>>,
    metrics: Arc<SecurityMetrics>,
}

impl SecurityIndex {
    pub fn new(store: Arc<dyn GrantStore>, flag: Arc<dyn ClusterRebuildFlag>, metrics: Arc<SecurityMetrics>) -> Self {
        Self {
            store,
            flag,
            dirty: AtomicBool::new(false),
            last_rebuild: RwLock::new(None),
            metrics,
        }
    }

    pub fn store(&self) -> &Arc<dyn GrantStore> {
        &self.store
    }

    pub fn flag(&self) -> &Arc<dyn ClusterRebuildFlag> {
        &self.flag
    }

    /// Recompute and store the facts of every `(provider, object)` pair
    ///
    /// Objects that no longer exist or no longer match the provider lose the
    /// provider's facts. Failed writes do not stop the remaining ones.
    pub async fn update_security(
        &self,
        graph: &dyn ObjectGraph,
        access: &AccessManager,
        affected: &BTreeMap<RoleProvider, ObjectSet>,
    ) -> Result<usize> {
        let batches = Self::compute_batches(graph, access, affected);
        let total = batches.len();
        let mut failed = 0;
        for (reason, object, grants) in batches {
            if let Err(err) = self.store.replace_grants(&reason, &object, grants).await {
                failed += 1;
                warn!(reason = %reason, object = %object, error = %err, "grant update failed");
                self.metrics.record_storage_failure().await;
            }
        }
        if failed > 0 {
            return Err(SecurityError::storage(format!("{} of {} grant updates failed", failed, total)));
        }
        debug!(pairs = total, "grants updated");
        Ok(total)
    }

    fn compute_batches(
        graph: &dyn ObjectGraph,
        access: &AccessManager,
        affected: &BTreeMap<RoleProvider, ObjectSet>,
    ) -> Vec<GrantBatch> {
        let _cache = access.cache_mode();
        let mut batches = Vec::new();
        for (provider, objects) in affected {
            let reason = GrantReason::Rule(provider.id().to_string());
            for object in objects {
                let grants = if graph.contains(object) && provider.matches(graph, object) {
                    access
                        .evaluate(graph, provider, object)
                        .into_iter()
                        .map(|group| RoleGrant::new(group, provider.role(), object.clone(), reason.clone()))
                        .collect()
                } else {
                    Vec::new()
                };
                batches.push((reason.clone(), object.clone(), grants));
            }
        }
        batches
    }

    /// Drop every fact on removed objects and every fact granted to removed groups
    pub async fn remove_objects(&self, removed: &BTreeMap<ObjectId, ObjectInfo>) -> Result<usize> {
        let ids: Vec<ObjectId> = removed.keys().cloned().collect();
        let groups: Vec<GroupId> = removed
            .values()
            .filter(|info| info.type_name == GROUP_TYPE || info.type_name == PERSON_TYPE)
            .map(|info| info.id.clone())
            .collect();

        let mut count = 0;
        for chunk in ids.chunks(MAX_LIST_LENGTH) {
            count += self.store.remove_objects(chunk).await?;
        }
        for chunk in groups.chunks(MAX_LIST_LENGTH) {
            count += self.store.remove_groups(chunk).await?;
        }
        debug!(objects = ids.len(), groups = groups.len(), facts = count, "removed objects from role index");
        Ok(count)
    }

    /// Store facts for new direct role assignments
    pub async fn insert_direct(&self, assignments: &[RoleAssignment]) -> Result<()> {
        if assignments.is_empty() {
            return Ok(());
        }
        self.store.insert(assignments.iter().map(RoleGrant::direct).collect()).await
    }

    /// Drop facts of revoked direct role assignments
    pub async fn remove_direct(&self, assignments: &[RoleAssignment]) -> Result<()> {
        if assignments.is_empty() {
            return Ok(());
        }
        let grants: Vec<RoleGrant> = assignments.iter().map(RoleGrant::direct).collect();
        self.store.remove(&grants).await
    }

    /// Every fact the rules and direct assignments produce on `graph`
    pub fn compute_all(graph: &dyn ObjectGraph, access: &AccessManager) -> Vec<RoleGrant> {
        let index = access.rules();
        let _cache = access.cache_mode();
        let mut grants = Vec::new();
        for provider in index.providers() {
            let reason = GrantReason::Rule(provider.id().to_string());
            for object in provider.target_objects(graph) {
                if !provider.matches(graph, &object) {
                    continue;
                }
                for group in access.evaluate(graph, provider, &object) {
                    grants.push(RoleGrant::new(group, provider.role(), object.clone(), reason.clone()));
                }
            }
        }
        grants.extend(graph.all_role_assignments().iter().map(RoleGrant::direct));
        grants
    }

    pub fn is_rebuilding(&self) -> bool {
        self.flag.is_rebuilding()
    }

    /// Dirty state as last seen; cheap, used for read routing
    pub fn is_marked_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    /// Whether stored facts cannot be trusted: empty store or dirty flag set
    ///
    /// A store that cannot be queried counts as dirty.
    pub async fn is_dirty(&self) -> bool {
        let dirty = match (self.store.is_empty().await, self.store.dirty_flag().await) {
            (Ok(empty), Ok(flag)) => empty || flag,
            (Err(err), _) | (_, Err(err)) => {
                warn!(error = %err, "could not read role index state");
                true
            }
        };
        self.dirty.store(dirty, Ordering::SeqCst);
        dirty
    }

    pub async fn set_dirty(&self, dirty: bool) -> Result<()> {
        self.dirty.store(dirty, Ordering::SeqCst);
        self.store.set_dirty_flag(dirty).await
    }

    pub async fn config_version(&self) -> Result<Option<String>> {
        self.store.config_version().await
    }

    pub async fn set_config_version(&self, version: &str) -> Result<()> {
        self.store.set_config_version(version).await
    }

    pub fn last_rebuild(&self) -> Option<RebuildReport> {
        self.last_rebuild.read().clone()
    }

    /// Recompute the whole index from `graph`
    ///
    /// Refuses to start while another rebuild holds the cluster flag. The flag is
    /// released on every exit path.
    pub async fn reload(&self, graph: &dyn ObjectGraph, access: &AccessManager) -> Result<RebuildOutcome> {
        if !self.flag.try_begin() {
            info!("role index rebuild already running");
            return Ok(RebuildOutcome::AlreadyRunning);
        }
        info!("role index rebuild started");
        let started = Instant::now();
        let result = self.rebuild_facts(graph, access).await;
        self.flag.end();

        match result {
            Ok(facts) => {
                let report = RebuildReport {
                    facts,
                    duration: started.elapsed(),
                    finished_at: Utc::now(),
                    config_version: access.rules().version().to_string().into(),
                };
                info!(facts, duration_ms = report.duration.as_millis() as u64, "role index rebuild finished");
                self.metrics.record_rebuild(facts).await;
                *self.last_rebuild.write() = Some(report.clone());
                Ok(RebuildOutcome::Completed(report))
            }
            Err(err) => {
                error!(error = %err, "role index rebuild failed");
                self.metrics.record_storage_failure().await;
                Err(SecurityError::rebuild(err.to_string()))
            }
        }
    }

    async fn rebuild_facts(&self, graph: &dyn ObjectGraph, access: &AccessManager) -> Result<usize> {
        self.store.clear().await?;
        self.set_dirty(true).await?;

        let grants = Self::compute_all(graph, access);
        let facts = grants.len();
        let mut remaining = grants.into_iter().peekable();
        while remaining.peek().is_some() {
            let chunk: Vec<RoleGrant> = remaining.by_ref().take(MAX_LIST_LENGTH).collect();
            self.store.insert(chunk).await?;
        }

        self.set_config_version(access.rules().version()).await?;
        self.set_dirty(false).await?;
        Ok(facts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{load_rules, RoleRulesConfig, RuleConfig, RuleRegistry};
    use crate::storage::{InMemoryGrantStore, LocalRebuildFlag};
    use crate::types::GroupSet;
    use rolegraph_core::{InMemoryGraph, TypeDef, TypeModel};

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

    fn access() -> AccessManager {
        let config = RoleRulesConfig::new(vec![
            RuleConfig::new("owner", "Project", "Member").attribute("owner", false),
            RuleConfig::new("viewer", "Task", "Viewer")
                .from_source_role("Member")
                .association("belongsTo", true),
        ]);
        let (index, _) = load_rules(&config, &model(), &[]).unwrap();
        AccessManager::new(Arc::new(RuleRegistry::new(index)))
    }

    fn graph() -> Arc<InMemoryGraph> {
        let mut tx = Arc::new(InMemoryGraph::new(model())).transaction();
        tx.create_person("u1").unwrap();
        tx.create_group("team").unwrap();
        tx.create("p1", "Project").unwrap();
        tx.create("t1", "Task").unwrap();
        tx.set_attribute("p1", "owner", ["u1"]).unwrap();
        tx.link("belongsTo", "p1", "t1").unwrap();
        tx.assign_role("t1", "Viewer", "team").unwrap();
        tx.commit().0
    }

    fn security_index(store: Arc<InMemoryGrantStore>) -> SecurityIndex {
        SecurityIndex::new(store, Arc::new(LocalRebuildFlag::new()), Arc::new(SecurityMetrics::new()))
    }

    #[tokio::test]
    async fn test_reload_computes_rule_and_direct_facts() {
        let store = Arc::new(InMemoryGrantStore::new());
        let index = security_index(store.clone());
        let access = access();
        assert!(index.is_dirty().await);

        let outcome = index.reload(graph().as_ref(), &access).await.unwrap();
        let RebuildOutcome::Completed(report) = outcome else {
            panic!("rebuild did not run");
        };
        assert_eq!(report.facts, 3);
        assert_eq!(report.config_version.as_deref(), Some(access.rules().version()));
        assert!(!index.is_dirty().await);
        assert!(!index.is_rebuilding());

        assert_eq!(
            store.get_groups("t1", "Viewer").await.unwrap(),
            GroupSet::from(["team".to_string(), "u1".to_string()])
        );
        assert_eq!(index.config_version().await.unwrap().as_deref(), Some(access.rules().version()));
    }

    #[tokio::test]
    async fn test_reload_refused_while_flag_held() {
        let index = security_index(Arc::new(InMemoryGrantStore::new()));
        assert!(index.flag().try_begin());

        let outcome = index.reload(graph().as_ref(), &access()).await.unwrap();
        assert_eq!(outcome, RebuildOutcome::AlreadyRunning);
        assert!(index.is_rebuilding());
    }

    #[tokio::test]
    async fn test_update_security_replaces_provider_facts() {
        let store = Arc::new(InMemoryGrantStore::new());
        let index = security_index(store.clone());
        let access = access();
        let graph = graph();
        index.reload(graph.as_ref(), &access).await.unwrap();

        let mut tx = graph.transaction();
        tx.create_person("u2").unwrap();
        tx.set_attribute("p1", "owner", ["u2"]).unwrap();
        let (graph, _) = tx.commit();

        let owner = access.rules().get("owner").cloned().unwrap();
        let affected = BTreeMap::from([(owner, ObjectSet::from(["p1".to_string(), "gone".to_string()]))]);
        assert_eq!(index.update_security(graph.as_ref(), &access, &affected).await.unwrap(), 2);

        assert_eq!(store.get_groups("p1", "Member").await.unwrap(), GroupSet::from(["u2".to_string()]));
        assert!(!access.is_in_cache_mode());
    }

    #[tokio::test]
    async fn test_remove_objects_drops_group_facts() {
        let store = Arc::new(InMemoryGrantStore::new());
        let index = security_index(store.clone());
        let graph = graph();
        index.reload(graph.as_ref(), &access()).await.unwrap();

        let mut tx = graph.transaction();
        tx.delete("team").unwrap();
        let (_, commit) = tx.commit();

        assert_eq!(index.remove_objects(&commit.changes.removed).await.unwrap(), 1);
        assert_eq!(store.get_groups("t1", "Viewer").await.unwrap(), GroupSet::from(["u1".to_string()]));
    }

    #[tokio::test]
    async fn test_direct_facts() {
        let store = Arc::new(InMemoryGrantStore::new());
        let index = security_index(store.clone());
        let assignment = RoleAssignment::new("p1", "Member", "team");

        index.insert_direct(&[assignment.clone()]).await.unwrap();
        assert_eq!(store.get_groups("p1", "Member").await.unwrap(), GroupSet::from(["team".to_string()]));

        index.remove_direct(&[assignment]).await.unwrap();
        assert!(store.is_empty().await.unwrap());
    }
}
