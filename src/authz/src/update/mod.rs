//! Incremental security updates
//!
//! For every commit the [`SecurityUpdateManager`] works out which
//! `(provider, object)` pairs may have changed, resolves role inheritance over
//! them and rewrites exactly those facts in the [`SecurityIndex`].
//!
//! Changes are collected on both sides of the commit. Created links are walked
//! backwards on the new graph; removed links on the old graph, since their
//! endpoints may be gone. Objects removed by the commit never get new facts.

pub mod log;
pub mod observer;

pub use log::{NullUpdateLog, SecurityUpdateLog, TracingUpdateLog};
pub use observer::CommitObserver;

use crate::access::AccessManager;
use crate::error::{Result, SecurityError};
use crate::metrics::SecurityMetrics;
use crate::provider::RoleProvider;
use crate::rules::RuleIndex;
use crate::storage::{RebuildOutcome, SecurityIndex};
use crate::types::{InvalidObjects, ObjectId, ObjectSet, RoleId};
use parking_lot::{Mutex, RwLock};
use rolegraph_core::{Commit, Link, ObjectGraph, ObjectInfo, RoleAssignment};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Hard stop for inheritance resolution
pub const MAX_INHERITANCE_ITERATIONS: usize = 50;

/// Iteration count above which every further iteration is reported
pub const INHERITANCE_WARN_ITERATIONS: usize = 40;

/// Default threshold for the slow update warning
pub const DEFAULT_SLOW_UPDATE: Duration = Duration::from_secs(3);

type AffectedMap = BTreeMap<RoleProvider, ObjectSet>;
type RoleObjects = BTreeMap<RoleId, ObjectSet>;

/// Where the update manager currently is
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UpdatePhase {
    #[default]
    Idle,
    Collecting,
    ResolvingInheritance,
    Writing,
}

/// Everything one commit requires of the role index
#[derive(Debug, Clone, Default)]
pub struct UpdatePlan {
    /// Provider -> objects whose facts from that provider must be recomputed
    pub affected: AffectedMap,
    /// Objects whose facts are dropped entirely
    pub removed: BTreeMap<ObjectId, ObjectInfo>,
    pub direct_inserted: Vec<RoleAssignment>,
    pub direct_removed: Vec<RoleAssignment>,
    /// Objects whose stored facts are stale until the plan is written
    pub invalid: InvalidObjects,
    /// Inheritance iterations used
    pub iterations: usize,
}

impl UpdatePlan {
    pub fn pair_count(&self) -> usize {
        self.affected.values().map(ObjectSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.pair_count() == 0
            && self.removed.is_empty()
            && self.direct_inserted.is_empty()
            && self.direct_removed.is_empty()
    }

    /// Objects scheduled for the provider with the given id
    pub fn objects_for(&self, provider_id: &str) -> Option<&ObjectSet> {
        self.affected
            .iter()
            .find(|(provider, _)| provider.id() == provider_id)
            .map(|(_, objects)| objects)
    }
}

/// Outcome of writing one commit
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateReport {
    pub affected_pairs: usize,
    pub removed_objects: usize,
    pub direct_inserted: usize,
    pub direct_removed: usize,
    pub iterations: usize,
    /// One entry per failed storage operation
    pub failures: Vec<String>,
    pub elapsed: Duration,
}

impl UpdateReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Sole writer of the role index
pub struct SecurityUpdateManager {
    access: Arc<AccessManager>,
    index: Arc<SecurityIndex>,
    observers: Vec<Arc<dyn CommitObserver>>,
    update_log: Arc<dyn SecurityUpdateLog>,
    invalid: RwLock<InvalidObjects>,
    phase: Mutex<UpdatePhase>,
    running: tokio::sync::Mutex<()>,
    metrics: Arc<SecurityMetrics>,
    slow_update: Duration,
}

impl SecurityUpdateManager {
    pub fn new(access: Arc<AccessManager>, index: Arc<SecurityIndex>, metrics: Arc<SecurityMetrics>) -> Self {
        Self {
            access,
            index,
            observers: Vec::new(),
            update_log: Arc::new(NullUpdateLog),
            invalid: RwLock::new(InvalidObjects::default()),
            phase: Mutex::new(UpdatePhase::Idle),
            running: tokio::sync::Mutex::new(()),
            metrics,
            slow_update: DEFAULT_SLOW_UPDATE,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn CommitObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn with_update_log(mut self, update_log: Arc<dyn SecurityUpdateLog>) -> Self {
        self.update_log = update_log;
        self
    }

    pub fn with_slow_update_threshold(mut self, threshold: Duration) -> Self {
        self.slow_update = threshold;
        self
    }

    pub fn phase(&self) -> UpdatePhase {
        *self.phase.lock()
    }

    fn set_phase(&self, phase: UpdatePhase) {
        *self.phase.lock() = phase;
    }

    /// Whether a read over `chain` must not trust stored facts right now
    pub fn is_invalid(&self, chain: &[ObjectId], roles: Option<&[RoleId]>) -> bool {
        let invalid = self.invalid.read();
        !invalid.is_empty() && invalid.affects(chain, roles)
    }

    /// Compute what `commit` requires of the role index without writing anything
    pub fn plan(&self, commit: &Commit) -> UpdatePlan {
        self.set_phase(UpdatePhase::Collecting);
        let index = self.access.rules();
        let current = commit.current.as_ref();
        let previous = commit.previous.as_ref();
        let (created, removed) = self.observed_objects(commit);

        let mut plan = UpdatePlan::default();
        let mut affected = AffectedMap::new();
        let mut deleted = AffectedMap::new();
        let mut assigned = RoleObjects::new();
        let mut unassigned = RoleObjects::new();

        for link in &commit.changes.created_links {
            if let Link::RoleAssignment(assignment) = link {
                add_role_object(&mut assigned, &assignment.role, &assignment.object);
                plan.invalid.all.insert(assignment.object.clone());
                plan.direct_inserted.push(assignment.clone());
            } else {
                collect_link(&index, current, link, &mut affected);
            }
        }
        for link in &commit.changes.removed_links {
            if let Link::RoleAssignment(assignment) = link {
                add_role_object(&mut unassigned, &assignment.role, &assignment.object);
                plan.invalid.all.insert(assignment.object.clone());
                plan.direct_removed.push(assignment.clone());
            } else {
                collect_link(&index, previous, link, &mut deleted);
            }
        }

        // External providers declare the storage types they depend on
        for info in commit.changes.changed.values().chain(created.values()) {
            collect_external(&index, current, info, &mut affected);
        }
        for info in removed.values() {
            collect_external(&index, previous, info, &mut deleted);
        }

        // New objects did not exist before; no backward walk needed
        for id in created.keys() {
            for provider in index.rules_for_object(current, id) {
                affected.entry(provider).or_default().insert(id.clone());
            }
        }

        self.set_phase(UpdatePhase::ResolvingInheritance);
        let mut deleted_iterations = 0;
        if !deleted.is_empty() || !unassigned.is_empty() {
            let mut frontier = by_role(&deleted);
            merge_roles(&mut frontier, unassigned);
            deleted_iterations = resolve_inheritance(&index, previous, &mut deleted, frontier);
            for objects in deleted.values_mut() {
                objects.retain(|object| !removed.contains_key(object));
            }
            deleted.retain(|_, objects| !objects.is_empty());
        }

        let mut frontier = by_role(&affected);
        merge_roles(&mut frontier, assigned);
        merge_roles(&mut frontier, by_role(&deleted));
        let iterations = resolve_inheritance(&index, current, &mut affected, frontier);

        for (provider, objects) in deleted {
            affected.entry(provider).or_default().extend(objects);
        }
        for (provider, objects) in &affected {
            plan.invalid
                .by_role
                .entry(provider.role().to_string())
                .or_default()
                .extend(objects.iter().cloned());
        }

        plan.iterations = iterations.max(deleted_iterations);
        plan.affected = affected;
        plan.removed = removed;
        self.set_phase(UpdatePhase::Idle);
        debug!(
            pairs = plan.pair_count(),
            removed = plan.removed.len(),
            iterations = plan.iterations,
            "security update planned"
        );
        plan
    }

    fn observed_objects(&self, commit: &Commit) -> (BTreeMap<ObjectId, ObjectInfo>, BTreeMap<ObjectId, ObjectInfo>) {
        let mut created = commit.changes.created.clone();
        let mut removed = commit.changes.removed.clone();
        for observer in &self.observers {
            observer.observe(commit, &mut created, &mut removed);
        }
        (created, removed)
    }

    /// Plan and write the facts for one commit
    ///
    /// Calls are serialized. Storage failures are logged and reported; each
    /// write step runs regardless of earlier failures.
    pub async fn handle_commit(&self, commit: &Commit) -> UpdateReport {
        let _running = self.running.lock().await;
        let started = Instant::now();

        let plan = self.plan(commit);
        self.update_log.log(commit, &plan);

        self.set_phase(UpdatePhase::Writing);
        *self.invalid.write() = plan.invalid.clone();

        let mut report = UpdateReport {
            affected_pairs: plan.pair_count(),
            direct_inserted: plan.direct_inserted.len(),
            direct_removed: plan.direct_removed.len(),
            iterations: plan.iterations,
            ..Default::default()
        };

        if let Err(err) = self.index.remove_direct(&plan.direct_removed).await {
            self.write_failed("remove_direct", err, &mut report).await;
        }
        if let Err(err) = self.index.insert_direct(&plan.direct_inserted).await {
            self.write_failed("insert_direct", err, &mut report).await;
        }
        if !plan.removed.is_empty() {
            match self.index.remove_objects(&plan.removed).await {
                Ok(_) => report.removed_objects = plan.removed.len(),
                Err(err) => self.write_failed("remove_objects", err, &mut report).await,
            }
        }
        if !plan.affected.is_empty() {
            if let Err(err) = self
                .index
                .update_security(commit.current.as_ref(), &self.access, &plan.affected)
                .await
            {
                // update_security counts its own failures
                error!(operation = "update_security", error = %err, "role index write failed");
                report.failures.push(format!("update_security: {}", err));
            }
        }

        *self.invalid.write() = InvalidObjects::default();
        self.set_phase(UpdatePhase::Idle);

        report.elapsed = started.elapsed();
        if report.elapsed > self.slow_update {
            warn!(
                elapsed_ms = report.elapsed.as_millis() as u64,
                pairs = report.affected_pairs,
                removed = report.removed_objects,
                "slow security update"
            );
        }
        self.metrics
            .record_commit(report.affected_pairs, report.iterations, report.elapsed)
            .await;
        report
    }

    async fn write_failed(&self, operation: &str, err: SecurityError, report: &mut UpdateReport) {
        error!(operation, error = %err, "role index write failed");
        self.metrics.record_storage_failure().await;
        report.failures.push(format!("{}: {}", operation, err));
    }

    /// Rebuild the whole index, excluding concurrent commit updates
    pub async fn rebuild(&self, graph: &dyn ObjectGraph) -> Result<RebuildOutcome> {
        let _running = self.running.lock().await;
        self.reload(graph).await
    }

    /// Rebuild from the snapshot `latest` returns once commits are excluded
    ///
    /// A commit that published its snapshot before the rebuild got the lock is
    /// covered by the rebuild, not overwritten by it.
    pub async fn rebuild_latest<F>(&self, latest: F) -> Result<RebuildOutcome>
    where
        F: FnOnce() -> Arc<dyn ObjectGraph> + Send,
    {
        let _running = self.running.lock().await;
        let graph = latest();
        self.reload(graph.as_ref()).await
    }

    async fn reload(&self, graph: &dyn ObjectGraph) -> Result<RebuildOutcome> {
        self.set_phase(UpdatePhase::Writing);
        let outcome = self.index.reload(graph, &self.access).await;
        self.set_phase(UpdatePhase::Idle);
        outcome
    }
}

fn add_role_object(map: &mut RoleObjects, role: &str, object: &str) {
    map.entry(role.to_string()).or_default().insert(object.to_string());
}

fn by_role(affected: &AffectedMap) -> RoleObjects {
    let mut roles = RoleObjects::new();
    for (provider, objects) in affected {
        roles
            .entry(provider.role().to_string())
            .or_default()
            .extend(objects.iter().cloned());
    }
    roles
}

fn merge_roles(into: &mut RoleObjects, from: RoleObjects) {
    for (role, objects) in from {
        into.entry(role).or_default().extend(objects);
    }
}

/// Match a changed attribute or association against the indexed rules
fn collect_link(index: &RuleIndex, graph: &dyn ObjectGraph, link: &Link, into: &mut AffectedMap) {
    let providers = match link {
        Link::Attribute { attribute, .. } => index.rules_for_attribute(attribute),
        Link::Association { name, .. } => index.rules_for_association(name),
        Link::RoleAssignment(_) => return,
    };
    for provider in providers {
        let objects = provider.affected_base_objects(graph, link);
        if !objects.is_empty() {
            into.entry(provider.clone()).or_default().extend(objects);
        }
    }
}

fn collect_external(index: &RuleIndex, graph: &dyn ObjectGraph, info: &ObjectInfo, into: &mut AffectedMap) {
    for provider in index.providers_affected_by(&info.storage_type) {
        let objects = provider.base_objects(graph, &info.id);
        if !objects.is_empty() {
            into.entry(provider.clone()).or_default().extend(objects);
        }
    }
}

/// Add the objects that inherit a role through the frontier, until nothing new appears
///
/// Only pairs not yet in `affected` propagate further. Returns the number of
/// iterations used, at most [`MAX_INHERITANCE_ITERATIONS`].
fn resolve_inheritance(
    index: &RuleIndex,
    graph: &dyn ObjectGraph,
    affected: &mut AffectedMap,
    mut frontier: RoleObjects,
) -> usize {
    let mut iterations = 0;
    while !frontier.is_empty() {
        if iterations >= MAX_INHERITANCE_ITERATIONS {
            warn!(iterations, "inheritance resolution stopped, result may be incomplete");
            break;
        }
        iterations += 1;
        if iterations > INHERITANCE_WARN_ITERATIONS {
            let rules: Vec<&str> = frontier
                .keys()
                .flat_map(|role| index.rules_with_source_role(role))
                .map(RoleProvider::id)
                .collect();
            warn!(iterations, rules = ?rules, "inheritance resolution is not converging");
        }

        let mut next = RoleObjects::new();
        for (role, objects) in &frontier {
            for provider in index.rules_with_source_role(role) {
                for object in objects {
                    for base in provider.base_objects(graph, object) {
                        if affected.entry(provider.clone()).or_default().insert(base.clone()) {
                            add_role_object(&mut next, provider.role(), &base);
                        }
                    }
                }
            }
        }
        frontier = next;
    }
    iterations
}
