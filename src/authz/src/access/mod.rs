//! Live role resolution (the read path without persisted facts)
//!
//! [`AccessManager`] answers role questions by evaluating rules directly against a
//! graph snapshot. It is also the [`RoleGroupSource`] for inheritance rules and
//! the evaluator used when facts are (re)computed for storage.
//!
//! # Example
//!
//! ```rust
//! use rolegraph_authz::access::AccessManager;
//! use rolegraph_authz::rules::{load_rules, RoleRulesConfig, RuleConfig, RuleRegistry};
//! use rolegraph_core::{InMemoryGraph, TypeDef, TypeModel};
//! use std::sync::Arc;
//!
//! let model = Arc::new(TypeModel::from_types([
//!     TypeDef::new("Project").with_reference("owner", "Person"),
//!     TypeDef::new("Person"),
//! ]).unwrap());
//! let config = RoleRulesConfig::new(vec![
//!     RuleConfig::new("owner", "Project", "Member").attribute("owner", false),
//! ]);
//! let (index, _) = load_rules(&config, &model, &[]).unwrap();
//! let access = AccessManager::new(Arc::new(RuleRegistry::new(index)));
//!
//! let mut tx = Arc::new(InMemoryGraph::new(model)).transaction();
//! tx.create_person("u1").unwrap();
//! tx.create("p1", "Project").unwrap();
//! tx.set_attribute("p1", "owner", ["u1"]).unwrap();
//! let (graph, _) = tx.commit();
//!
//! assert!(access.get_roles(graph.as_ref(), "u1", "p1").contains("Member"));
//! ```

pub mod cache;

pub use cache::{CacheMode, CacheModeStats};

use crate::evaluator::{EvalContext, RoleGroupSource};
use crate::provider::RoleProvider;
use crate::rules::{RuleIndex, RuleRegistry};
use crate::types::{GroupSet, ObjectId, RoleId, RoleSet};
use rolegraph_core::ObjectGraph;
use std::sync::Arc;
use tracing::trace;

/// Rule-driven role and group resolution over a graph snapshot
pub struct AccessManager {
    registry: Arc<RuleRegistry>,
    cache: CacheMode,
}

impl AccessManager {
    pub fn new(registry: Arc<RuleRegistry>) -> Self {
        Self {
            registry,
            cache: CacheMode::new(),
        }
    }

    /// Currently published rule index
    pub fn rules(&self) -> Arc<RuleIndex> {
        self.registry.load()
    }

    pub fn registry(&self) -> &Arc<RuleRegistry> {
        &self.registry
    }

    /// Roles `subject` holds on `object`
    ///
    /// Walks the security-parent chain; at every node the rules indexed for the
    /// node's type and storage type and the matching external providers are
    /// evaluated, together with direct role assignments on the node.
    pub fn get_roles(&self, graph: &dyn ObjectGraph, subject: &str, object: &str) -> RoleSet {
        self.collect_roles(graph, subject, object, None)
    }

    /// Whether `subject` holds any of `roles` on `object`
    pub fn has_role(&self, graph: &dyn ObjectGraph, subject: &str, object: &str, roles: &[RoleId]) -> bool {
        if roles.is_empty() {
            return false;
        }
        !self.collect_roles(graph, subject, object, Some(roles)).is_empty()
    }

    /// Groups granted `role` on `object` by rules, providers and direct assignments
    pub fn get_groups(&self, graph: &dyn ObjectGraph, object: &str, role: &str) -> GroupSet {
        let ctx = EvalContext::new(graph, self);
        ctx.groups_for_role(object, role)
    }

    /// The subset of `objects` on which `subject` holds any of `roles`, in input order
    pub fn get_allowed_objects(
        &self,
        graph: &dyn ObjectGraph,
        subject: &str,
        roles: &[RoleId],
        objects: &[ObjectId],
    ) -> Vec<ObjectId> {
        objects
            .iter()
            .filter(|object| self.has_role(graph, subject, object, roles))
            .cloned()
            .collect()
    }

    /// Groups one provider grants on `object`
    pub fn evaluate(&self, graph: &dyn ObjectGraph, provider: &RoleProvider, object: &str) -> GroupSet {
        let ctx = EvalContext::new(graph, self);
        provider.groups_for(&ctx, object)
    }

    pub fn begin_cache_mode(&self) {
        let depth = self.cache.begin();
        trace!(depth, "cache mode entered");
    }

    pub fn end_cache_mode(&self) {
        let depth = self.cache.end();
        trace!(depth, "cache mode left");
    }

    pub fn is_in_cache_mode(&self) -> bool {
        self.cache.is_active()
    }

    /// Enter cache mode for the lifetime of the returned guard
    pub fn cache_mode(&self) -> CacheModeGuard<'_> {
        self.begin_cache_mode();
        CacheModeGuard { manager: self }
    }

    pub fn cache_stats(&self) -> CacheModeStats {
        self.cache.stats()
    }

    /// Forget memoized answers, e.g. after a new rule index was published
    pub fn invalidate_cache(&self) {
        self.cache.invalidate();
    }

    fn collect_roles(
        &self,
        graph: &dyn ObjectGraph,
        subject: &str,
        object: &str,
        wanted: Option<&[RoleId]>,
    ) -> RoleSet {
        let mut result = RoleSet::new();
        let memberships: GroupSet = graph.memberships(subject).into_iter().collect();
        if memberships.is_empty() {
            return result;
        }
        let wanted_role = |role: &str| wanted.map(|roles| roles.iter().any(|r| r == role)).unwrap_or(true);
        let index = self.rules();
        let ctx = EvalContext::new(graph, self);

        for node in graph.security_chain(object) {
            for assignment in graph.role_assignments(&node) {
                if wanted_role(&assignment.role) && memberships.contains(&assignment.group) {
                    result.insert(assignment.role);
                }
            }
            for provider in index.rules_for_object(graph, &node) {
                if result.contains(provider.role()) || !wanted_role(provider.role()) {
                    continue;
                }
                let groups = provider.groups_for(&ctx, &node);
                if !groups.is_disjoint(&memberships) {
                    result.insert(provider.role().to_string());
                }
            }
            if wanted.is_some() && !result.is_empty() {
                break;
            }
        }
        result
    }

    /// Groups for `(object, role)` without consulting the memo
    fn compute_groups(&self, ctx: &EvalContext<'_>, object: &str, role: &str) -> GroupSet {
        let graph = ctx.graph();
        let mut groups = GroupSet::new();
        for provider in self.rules().rules_with_role(role) {
            if provider.matches(graph, object) {
                groups.extend(provider.groups_for(ctx, object));
            }
        }
        groups.extend(
            graph
                .role_assignments(object)
                .into_iter()
                .filter(|assignment| assignment.role == role)
                .map(|assignment| assignment.group),
        );
        groups
    }
}

impl RoleGroupSource for AccessManager {
    fn groups_for_role(&self, ctx: &EvalContext<'_>, object: &str, role: &str) -> GroupSet {
        let key = ctx.graph().snapshot_id();
        if let Some(groups) = self.cache.lookup(key, object, role) {
            return groups;
        }
        let truncations = ctx.truncations();
        let groups = self.compute_groups(ctx, object, role);
        // an answer cut short by a cycle is only valid inside that evaluation
        if ctx.truncations() == truncations {
            self.cache.store(key, object, role, &groups);
        }
        groups
    }
}

/// Leaves cache mode when dropped
pub struct CacheModeGuard<'a> {
    manager: &'a AccessManager,
}

impl Drop for CacheModeGuard<'_> {
    fn drop(&mut self) {
        self.manager.end_cache_mode();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ExternalRoleProvider;
    use crate::rules::{load_rules, RoleRulesConfig, RuleConfig};
    use crate::types::ObjectSet;
    use rolegraph_core::{InMemoryGraph, TypeDef, TypeModel};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn model() -> Arc<TypeModel> {
        Arc::new(
            TypeModel::from_types([
                TypeDef::new("Project")
                    .with_reference("owner", "Person")
                    .with_reference("parent", "Project"),
                TypeDef::new("Task"),
                TypeDef::new("Person"),
                TypeDef::new("Group"),
            ])
            .unwrap(),
        )
    }

    fn manager(rules: Vec<RuleConfig>, externals: &[Arc<dyn ExternalRoleProvider>]) -> AccessManager {
        let (index, problems) = load_rules(&RoleRulesConfig::new(rules), &model(), externals).unwrap();
        assert!(problems.is_empty(), "{:?}", problems);
        AccessManager::new(Arc::new(RuleRegistry::new(index)))
    }

    fn graph() -> Arc<InMemoryGraph> {
        let mut tx = Arc::new(InMemoryGraph::new(model())).transaction();
        tx.create_person("u1").unwrap();
        tx.create_person("u2").unwrap();
        tx.create_group("team").unwrap();
        tx.add_member("team", "u2").unwrap();
        tx.create("p1", "Project").unwrap();
        tx.create("t1", "Task").unwrap();
        tx.set_attribute("p1", "owner", ["u1"]).unwrap();
        tx.link("belongsTo", "p1", "t1").unwrap();
        tx.set_security_parent("t1", Some("p1")).unwrap();
        tx.commit().0
    }

    fn owner_rule() -> RuleConfig {
        RuleConfig::new("owner", "Project", "Member").attribute("owner", false)
    }

    fn viewer_rule() -> RuleConfig {
        RuleConfig::new("viewer", "Task", "Viewer")
            .from_source_role("Member")
            .association("belongsTo", true)
    }

    struct CountingProvider {
        calls: AtomicUsize,
    }

    impl ExternalRoleProvider for CountingProvider {
        fn id(&self) -> &str {
            "counting"
        }

        fn role(&self) -> &str {
            "Auditor"
        }

        fn matches(&self, graph: &dyn ObjectGraph, object: &str) -> bool {
            graph.type_of(object).as_deref() == Some("Project")
        }

        fn groups_for(&self, _ctx: &EvalContext<'_>, _object: &str) -> GroupSet {
            self.calls.fetch_add(1, Ordering::SeqCst);
            GroupSet::from(["team".to_string()])
        }

        fn target_objects(&self, graph: &dyn ObjectGraph) -> ObjectSet {
            graph.instances_of("Project").into_iter().collect()
        }

        fn base_objects(&self, _graph: &dyn ObjectGraph, _object: &str) -> ObjectSet {
            ObjectSet::new()
        }
    }

    #[test]
    fn test_rule_grants_role() {
        let access = manager(vec![owner_rule()], &[]);
        let graph = graph();

        assert_eq!(access.get_roles(graph.as_ref(), "u1", "p1"), RoleSet::from(["Member".to_string()]));
        assert!(access.get_roles(graph.as_ref(), "u2", "p1").is_empty());
        assert!(access.has_role(graph.as_ref(), "u1", "p1", &["Member".to_string()]));
        assert!(!access.has_role(graph.as_ref(), "u1", "p1", &["Viewer".to_string()]));
        assert!(!access.has_role(graph.as_ref(), "u1", "p1", &[]));
    }

    #[test]
    fn test_inheritance_through_groups() {
        let access = manager(vec![owner_rule(), viewer_rule()], &[]);
        let graph = graph();

        assert_eq!(access.get_groups(graph.as_ref(), "t1", "Viewer"), GroupSet::from(["u1".to_string()]));
        // t1's security parent p1 also grants Member
        assert_eq!(
            access.get_roles(graph.as_ref(), "u1", "t1"),
            RoleSet::from(["Member".to_string(), "Viewer".to_string()])
        );
    }

    #[test]
    fn test_direct_assignment_unioned() {
        let access = manager(vec![owner_rule()], &[]);
        let mut tx = graph().transaction();
        tx.assign_role("p1", "Member", "team").unwrap();
        let (graph, _) = tx.commit();

        assert_eq!(
            access.get_groups(graph.as_ref(), "p1", "Member"),
            GroupSet::from(["u1".to_string(), "team".to_string()])
        );
        // u2 is a member of team
        assert!(access.get_roles(graph.as_ref(), "u2", "p1").contains("Member"));
        assert!(access.get_roles(graph.as_ref(), "u2", "t1").contains("Member"));
    }

    #[test]
    fn test_allowed_objects_keep_order() {
        let access = manager(vec![owner_rule(), viewer_rule()], &[]);
        let graph = graph();
        let objects = vec!["t1".to_string(), "missing".to_string(), "p1".to_string()];

        let allowed = access.get_allowed_objects(graph.as_ref(), "u1", &["Viewer".to_string()], &objects);
        assert_eq!(allowed, vec!["t1".to_string()]);

        let allowed = access.get_allowed_objects(graph.as_ref(), "u1", &["Member".to_string()], &objects);
        assert_eq!(allowed, vec!["t1".to_string(), "p1".to_string()]);
    }

    #[test]
    fn test_cache_mode_memoizes_get_groups() {
        let counting = Arc::new(CountingProvider { calls: AtomicUsize::new(0) });
        let externals: Vec<Arc<dyn ExternalRoleProvider>> = vec![counting.clone()];
        let access = manager(vec![], &externals);
        let graph = graph();

        {
            let _guard = access.cache_mode();
            let first = access.get_groups(graph.as_ref(), "p1", "Auditor");
            let second = access.get_groups(graph.as_ref(), "p1", "Auditor");
            assert_eq!(first, second);
            assert_eq!(counting.calls.load(Ordering::SeqCst), 1);
            assert_eq!(access.cache_stats().hits, 1);
        }

        assert!(!access.is_in_cache_mode());
        access.get_groups(graph.as_ref(), "p1", "Auditor");
        access.get_groups(graph.as_ref(), "p1", "Auditor");
        assert_eq!(counting.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_cache_mode_never_reuses_answers_of_dropped_snapshots() {
        let access = manager(vec![owner_rule()], &[]);
        let _guard = access.cache_mode();

        // Snapshots are dropped inside one cache-mode window; their
        // replacements may land on the same allocation
        for round in 0..32 {
            let owner = if round % 2 == 0 { "u1" } else { "u2" };
            let mut tx = graph().transaction();
            tx.set_attribute("p1", "owner", [owner]).unwrap();
            let (snapshot, commit) = tx.commit();
            drop(commit);

            assert_eq!(
                access.get_groups(snapshot.as_ref(), "p1", "Member"),
                GroupSet::from([owner.to_string()])
            );
        }
        assert_eq!(access.cache_stats().hits, 0);
    }

    #[test]
    fn test_cyclic_inheritance_terminates() {
        // A derives from B and B from A over the same self-referencing edge
        let access = manager(
            vec![
                RuleConfig::new("a", "Project", "A").from_source_role("B").attribute("parent", false),
                RuleConfig::new("b", "Project", "B").from_source_role("A").attribute("parent", true),
            ],
            &[],
        );
        let mut tx = graph().transaction();
        tx.create("p2", "Project").unwrap();
        tx.set_attribute("p1", "parent", ["p2"]).unwrap();
        tx.set_attribute("p2", "parent", ["p1"]).unwrap();
        tx.assign_role("p1", "A", "team").unwrap();
        let (graph, _) = tx.commit();

        let _guard = access.cache_mode();
        let groups = access.get_groups(graph.as_ref(), "p2", "B");
        assert!(groups.contains("team"));
        assert!(access.get_roles(graph.as_ref(), "u2", "p1").contains("A"));
    }
}
