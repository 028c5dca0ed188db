//! The explicit handle tying rules, the live evaluator and the role index together
//!
//! A [`SecurityService`] is built once per process from a [`SecurityConfig`]
//! and the type model. It answers role queries for [`Session`]s and receives
//! every commit of the object graph.
//!
//! ```text
//! commit ──▶ SecurityUpdateManager ──▶ SecurityIndex ──▶ GrantStore
//!                                                          ▲
//! Session ──▶ read mode ──┬─ Storage ─▶ RoleComputation ───┘
//!                         ├─ Compute ─▶ AccessManager (live)
//!                         ├─ Block ───▶ wait, then decide again
//!                         └─ Deny ────▶ no roles
//! ```

use crate::access::AccessManager;
use crate::config::SecurityConfig;
use crate::error::{Result, SecurityError};
use crate::metrics::SecurityMetrics;
use crate::provider::ExternalRoleProvider;
use crate::rules::{load_rules, RoleRulesConfig, RuleIndex, RuleProblem, RuleRegistry};
use crate::session::Session;
use crate::storage::{
    ClusterRebuildFlag, GrantStore, InMemoryGrantStore, LocalRebuildFlag, ReadMode, RebuildCoordinator,
    RebuildOutcome, SecurityIndex, StartupAction,
};
use crate::types::{GroupSet, ObjectId, RoleId, RoleSet};
use crate::update::{CommitObserver, SecurityUpdateLog, SecurityUpdateManager, TracingUpdateLog, UpdateReport};
use parking_lot::RwLock;
use rolegraph_core::{Commit, ObjectGraph, TypeModel};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What happened while starting the service
#[derive(Debug, Clone, PartialEq)]
pub struct StartupReport {
    /// Rules dropped while loading
    pub problems: Vec<RuleProblem>,
    pub action: StartupAction,
    /// Present when startup rebuilt the index
    pub rebuild: Option<RebuildOutcome>,
}

/// Builder for [`SecurityService`]
pub struct SecurityServiceBuilder {
    config: SecurityConfig,
    model: Arc<TypeModel>,
    store: Option<Arc<dyn GrantStore>>,
    flag: Option<Arc<dyn ClusterRebuildFlag>>,
    metrics: Option<Arc<SecurityMetrics>>,
    externals: Vec<Arc<dyn ExternalRoleProvider>>,
    observers: Vec<Arc<dyn CommitObserver>>,
    update_log: Option<Arc<dyn SecurityUpdateLog>>,
}

impl SecurityServiceBuilder {
    /// Persisted role index; defaults to an in-memory store
    pub fn with_store(mut self, store: Arc<dyn GrantStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Cluster-wide rebuild flag; defaults to a node-local flag
    pub fn with_cluster_flag(mut self, flag: Arc<dyn ClusterRebuildFlag>) -> Self {
        self.flag = Some(flag);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<SecurityMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_external_provider(mut self, provider: Arc<dyn ExternalRoleProvider>) -> Self {
        self.externals.push(provider);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn CommitObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Update log handler; overrides `log_updates`
    pub fn with_update_log(mut self, update_log: Arc<dyn SecurityUpdateLog>) -> Self {
        self.update_log = Some(update_log);
        self
    }

    /// Load the rules, then bring the role index up to date for `graph`
    pub async fn start(self, graph: Arc<dyn ObjectGraph>) -> Result<(SecurityService, StartupReport)> {
        let (rules, problems) = load_rules(&self.config.role_rules, &self.model, &self.externals)?;
        let version = rules.version().to_string();

        let metrics = self.metrics.unwrap_or_default();
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryGrantStore::new()) as Arc<dyn GrantStore>);
        let flag = self
            .flag
            .unwrap_or_else(|| Arc::new(LocalRebuildFlag::new()) as Arc<dyn ClusterRebuildFlag>);

        let access = Arc::new(AccessManager::new(Arc::new(RuleRegistry::new(rules))));
        let index = Arc::new(SecurityIndex::new(store, flag, metrics.clone()));

        let mut updates = SecurityUpdateManager::new(access.clone(), index.clone(), metrics.clone())
            .with_slow_update_threshold(self.config.slow_update_threshold());
        for observer in self.observers {
            updates = updates.with_observer(observer);
        }
        match self.update_log {
            Some(update_log) => updates = updates.with_update_log(update_log),
            None if self.config.log_updates => updates = updates.with_update_log(Arc::new(TracingUpdateLog)),
            None => {}
        }

        let service = SecurityService {
            coordinator: self.config.coordinator(),
            config: self.config,
            model: self.model,
            externals: self.externals,
            access,
            index,
            updates,
            metrics,
            graph: RwLock::new(graph),
            closed: AtomicBool::new(false),
        };

        let (action, rebuild) = service.bring_up_to_date(&version).await?;
        info!(
            problems = problems.len(),
            action = ?action,
            use_storage = service.config.use_storage,
            "security service started"
        );
        Ok((
            service,
            StartupReport {
                problems,
                action,
                rebuild,
            },
        ))
    }
}

/// Rule-based security for one object graph
pub struct SecurityService {
    config: SecurityConfig,
    model: Arc<TypeModel>,
    externals: Vec<Arc<dyn ExternalRoleProvider>>,
    access: Arc<AccessManager>,
    index: Arc<SecurityIndex>,
    updates: SecurityUpdateManager,
    coordinator: RebuildCoordinator,
    metrics: Arc<SecurityMetrics>,
    /// Latest committed snapshot
    graph: RwLock<Arc<dyn ObjectGraph>>,
    closed: AtomicBool,
}

impl SecurityService {
    pub fn builder(config: SecurityConfig, model: Arc<TypeModel>) -> SecurityServiceBuilder {
        SecurityServiceBuilder {
            config,
            model,
            store: None,
            flag: None,
            metrics: None,
            externals: Vec::new(),
            observers: Vec::new(),
            update_log: None,
        }
    }

    async fn bring_up_to_date(&self, version: &str) -> Result<(StartupAction, Option<RebuildOutcome>)> {
        if !self.config.use_storage {
            return Ok((StartupAction::UpToDate, None));
        }
        let dirty = self.index.is_dirty().await;
        let stored = match self.index.config_version().await {
            Ok(stored) => stored,
            Err(err) => {
                warn!(error = %err, "could not read stored rule version");
                None
            }
        };
        let action = self.coordinator.startup_action(stored.as_deref(), version, dirty);
        match action {
            StartupAction::UpToDate => Ok((action, None)),
            StartupAction::RebuildNow => Ok((action, Some(self.rebuild().await?))),
            StartupAction::Deferred => {
                self.index.set_dirty(true).await?;
                info!("role index rebuild deferred until maintenance window");
                Ok((action, None))
            }
        }
    }

    pub fn config(&self) -> &SecurityConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<SecurityMetrics> {
        &self.metrics
    }

    pub fn rules(&self) -> Arc<RuleIndex> {
        self.access.rules()
    }

    pub fn access(&self) -> &Arc<AccessManager> {
        &self.access
    }

    pub fn index(&self) -> &Arc<SecurityIndex> {
        &self.index
    }

    pub fn coordinator(&self) -> &RebuildCoordinator {
        &self.coordinator
    }

    pub fn updates(&self) -> &SecurityUpdateManager {
        &self.updates
    }

    /// Latest committed graph snapshot
    pub fn graph(&self) -> Arc<dyn ObjectGraph> {
        self.graph.read().clone()
    }

    pub fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Session reading the latest snapshot
    pub fn open_session(&self) -> Session {
        Session::new(self.graph(), self.config.session_cache)
    }

    /// Session for the task driving a rebuild; never blocked or denied
    pub fn open_rebuild_session(&self) -> Session {
        Session::for_rebuild(self.graph(), self.config.session_cache)
    }

    // ========================================================================
    // Reads
    // ========================================================================

    async fn read_mode(&self, session: &Session) -> ReadMode {
        if !self.config.use_storage {
            return ReadMode::Compute;
        }
        loop {
            let mode = self.coordinator.read_mode(
                self.index.is_rebuilding(),
                self.index.is_marked_dirty(),
                session.is_rebuild_session(),
            );
            if mode != ReadMode::Block {
                return mode;
            }
            self.metrics.record_blocked_read().await;
            self.coordinator.wait_for_rebuild(self.index.flag().as_ref()).await;
        }
    }

    /// Roles `subject` holds on `object`
    pub async fn get_roles(&self, session: &Session, subject: &str, object: &str) -> RoleSet {
        match self.read_mode(session).await {
            ReadMode::Deny => {
                self.metrics.record_denied_read().await;
                RoleSet::new()
            }
            ReadMode::Storage => {
                let chain = session.graph().security_chain(object);
                if self.updates.is_invalid(&chain, None) {
                    return self.live_roles(self.graph().as_ref(), subject, object).await;
                }
                let computation = session.computation(subject, self.index.store(), &self.metrics);
                computation.get_roles(object).await.as_ref().clone()
            }
            ReadMode::Compute | ReadMode::Block => self.live_roles(session.graph().as_ref(), subject, object).await,
        }
    }

    async fn live_roles(&self, graph: &dyn ObjectGraph, subject: &str, object: &str) -> RoleSet {
        self.metrics.record_live_fallback().await;
        self.access.get_roles(graph, subject, object)
    }

    /// Whether `subject` holds one of `roles` on `object`
    pub async fn has_role(&self, session: &Session, subject: &str, object: &str, roles: &[RoleId]) -> bool {
        if roles.is_empty() {
            return false;
        }
        match self.read_mode(session).await {
            ReadMode::Deny => {
                self.metrics.record_denied_read().await;
                false
            }
            ReadMode::Storage => {
                let chain = session.graph().security_chain(object);
                if self.updates.is_invalid(&chain, Some(roles)) {
                    self.metrics.record_live_fallback().await;
                    return self.access.has_role(self.graph().as_ref(), subject, object, roles);
                }
                let computation = session.computation(subject, self.index.store(), &self.metrics);
                computation.has_role(object, roles).await
            }
            ReadMode::Compute | ReadMode::Block => {
                self.metrics.record_live_fallback().await;
                self.access.has_role(session.graph().as_ref(), subject, object, roles)
            }
        }
    }

    /// Groups holding `role` on `object`
    ///
    /// Falls back to live evaluation when the store cannot answer.
    pub async fn get_groups(&self, session: &Session, object: &str, role: &str) -> GroupSet {
        match self.read_mode(session).await {
            ReadMode::Deny => {
                self.metrics.record_denied_read().await;
                GroupSet::new()
            }
            ReadMode::Storage => {
                let roles = [role.to_string()];
                if self.updates.is_invalid(&[object.to_string()], Some(&roles)) {
                    self.metrics.record_live_fallback().await;
                    return self.access.get_groups(self.graph().as_ref(), object, role);
                }
                match self.index.store().get_groups(object, role).await {
                    Ok(groups) => groups,
                    Err(err) => {
                        warn!(object, role, error = %err, "stored groups unavailable, evaluating live");
                        self.metrics.record_storage_failure().await;
                        self.metrics.record_live_fallback().await;
                        self.access.get_groups(session.graph().as_ref(), object, role)
                    }
                }
            }
            ReadMode::Compute | ReadMode::Block => {
                self.metrics.record_live_fallback().await;
                self.access.get_groups(session.graph().as_ref(), object, role)
            }
        }
    }

    /// The subset of `objects` on which `subject` holds one of `roles`, in input order
    pub async fn get_allowed_objects(
        &self,
        session: &Session,
        subject: &str,
        roles: &[RoleId],
        objects: &[ObjectId],
    ) -> Vec<ObjectId> {
        if roles.is_empty() || objects.is_empty() {
            return Vec::new();
        }
        match self.read_mode(session).await {
            ReadMode::Deny => {
                self.metrics.record_denied_read().await;
                Vec::new()
            }
            ReadMode::Storage => {
                let graph = session.graph();
                let invalid = objects
                    .iter()
                    .any(|object| self.updates.is_invalid(&graph.security_chain(object), Some(roles)));
                if invalid {
                    self.metrics.record_live_fallback().await;
                    return self
                        .access
                        .get_allowed_objects(self.graph().as_ref(), subject, roles, objects);
                }
                let computation = session.computation(subject, self.index.store(), &self.metrics);
                computation.get_allowed_objects(roles, objects).await
            }
            ReadMode::Compute | ReadMode::Block => {
                self.metrics.record_live_fallback().await;
                self.access
                    .get_allowed_objects(session.graph().as_ref(), subject, roles, objects)
            }
        }
    }

    // ========================================================================
    // Writes and lifecycle
    // ========================================================================

    /// Bring the role index in line with a committed transaction
    pub async fn handle_commit(&self, commit: &Commit) -> Result<UpdateReport> {
        if self.is_shut_down() {
            return Err(SecurityError::InvalidInput("security service is shut down".to_string()));
        }
        *self.graph.write() = commit.current.clone();
        if !self.config.use_storage {
            return Ok(UpdateReport::default());
        }
        Ok(self.updates.handle_commit(commit).await)
    }

    /// Rebuild the role index from the latest snapshot
    pub async fn rebuild(&self) -> Result<RebuildOutcome> {
        self.updates.rebuild_latest(|| self.graph()).await
    }

    /// Run a rebuild deferred at startup or by a rule reload
    ///
    /// Does nothing until the cluster flag reports an open maintenance window;
    /// the rebuild stays pending meanwhile.
    pub async fn on_maintenance_window(&self) -> Result<Option<RebuildOutcome>> {
        if !self.coordinator.has_pending() {
            return Ok(None);
        }
        if !self.index.flag().maintenance_window() {
            debug!("maintenance window closed, deferred rebuild stays pending");
            return Ok(None);
        }
        if !self.coordinator.take_pending() {
            return Ok(None);
        }
        info!("maintenance window open, running deferred rebuild");
        match self.rebuild().await {
            Ok(outcome) => Ok(Some(outcome)),
            Err(err) => {
                self.coordinator.defer();
                Err(err)
            }
        }
    }

    /// Replace the rule set at runtime
    ///
    /// The new rules take effect for live evaluation immediately. When their
    /// version differs, the role index is marked dirty and rebuilt, or deferred
    /// when rebuilds wait for a maintenance window.
    pub async fn reload_rules(&self, rules: &RoleRulesConfig) -> Result<Vec<RuleProblem>> {
        let (index, problems) = load_rules(rules, &self.model, &self.externals)?;
        let version = index.version().to_string();
        let previous = self.access.registry().publish(index);
        self.access.invalidate_cache();

        if previous.version() == version || !self.config.use_storage {
            return Ok(problems);
        }
        info!(previous = previous.version(), current = %version, "role rules changed");
        self.index.set_dirty(true).await?;
        if self.config.defer_rebuild_until_maintenance {
            self.coordinator.defer();
        } else {
            self.rebuild().await?;
        }
        Ok(problems)
    }

    /// Stop accepting commits
    pub fn shut_down(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!("security service shut down");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::RuleConfig;
    use crate::session::SessionCacheMode;
    use crate::storage::RebuildStrategy;
    use rolegraph_core::{InMemoryGraph, TypeDef};

    fn model() -> Arc<TypeModel> {
        Arc::new(
            TypeModel::from_types([
                TypeDef::new("Project").with_reference("owner", "Person"),
                TypeDef::new("Person"),
                TypeDef::new("Group"),
            ])
            .unwrap(),
        )
    }

    fn config() -> SecurityConfig {
        SecurityConfig {
            role_rules: RoleRulesConfig::new(vec![
                RuleConfig::new("owner", "Project", "Member").attribute("owner", false)
            ]),
            ..Default::default()
        }
    }

    fn graph() -> Arc<InMemoryGraph> {
        let mut tx = Arc::new(InMemoryGraph::new(model())).transaction();
        tx.create_person("u1").unwrap();
        tx.create_person("u2").unwrap();
        tx.create("p1", "Project").unwrap();
        tx.set_attribute("p1", "owner", ["u1"]).unwrap();
        tx.commit().0
    }

    fn member() -> Vec<RoleId> {
        vec!["Member".to_string()]
    }

    #[tokio::test]
    async fn test_start_rebuilds_empty_index() {
        let (service, report) = SecurityService::builder(config(), model())
            .start(graph())
            .await
            .unwrap();

        assert!(report.problems.is_empty());
        assert_eq!(report.action, StartupAction::RebuildNow);
        assert!(matches!(report.rebuild, Some(RebuildOutcome::Completed(ref r)) if r.facts == 1));

        let session = service.open_session();
        assert!(service.has_role(&session, "u1", "p1", &member()).await);
        assert!(!service.has_role(&session, "u2", "p1", &member()).await);
    }

    #[tokio::test]
    async fn test_start_with_current_index_is_up_to_date() {
        let store = Arc::new(InMemoryGrantStore::new());
        let (first, _) = SecurityService::builder(config(), model())
            .with_store(store.clone())
            .start(graph())
            .await
            .unwrap();
        first.shut_down();

        let (_, report) = SecurityService::builder(config(), model())
            .with_store(store)
            .start(graph())
            .await
            .unwrap();
        assert_eq!(report.action, StartupAction::UpToDate);
        assert!(report.rebuild.is_none());
    }

    #[tokio::test]
    async fn test_deferred_rebuild_runs_in_maintenance_window() {
        let config = SecurityConfig {
            defer_rebuild_until_maintenance: true,
            ..config()
        };
        let flag = Arc::new(LocalRebuildFlag::new());
        let (service, report) = SecurityService::builder(config, model())
            .with_cluster_flag(flag.clone())
            .start(graph())
            .await
            .unwrap();
        assert_eq!(report.action, StartupAction::Deferred);

        // Dirty index: reads compute live
        let session = service.open_session();
        assert!(service.has_role(&session, "u1", "p1", &member()).await);
        assert_eq!(service.metrics().snapshot().await.live_fallbacks, 1);

        // Window still closed: the rebuild waits
        assert!(service.on_maintenance_window().await.unwrap().is_none());
        assert!(service.coordinator().has_pending());
        assert!(service.index().is_marked_dirty());
        assert_eq!(service.metrics().snapshot().await.rebuilds, 0);

        flag.set_maintenance_window(true);
        let outcome = service.on_maintenance_window().await.unwrap();
        assert!(matches!(outcome, Some(RebuildOutcome::Completed(_))));
        assert!(service.on_maintenance_window().await.unwrap().is_none());
        assert!(!service.index().is_marked_dirty());
    }

    #[tokio::test]
    async fn test_commit_updates_stored_roles() {
        let graph = graph();
        let (service, _) = SecurityService::builder(config(), model())
            .start(graph.clone())
            .await
            .unwrap();

        let mut tx = graph.transaction();
        tx.set_attribute("p1", "owner", ["u2"]).unwrap();
        let (_, commit) = tx.commit();
        let report = service.handle_commit(&commit).await.unwrap();
        assert!(report.is_clean());

        let session = service.open_session();
        assert_eq!(
            service.get_groups(&session, "p1", "Member").await,
            GroupSet::from(["u2".to_string()])
        );
        assert!(service.get_roles(&session, "u1", "p1").await.is_empty());
    }

    #[tokio::test]
    async fn test_without_storage_everything_is_live() {
        let config = SecurityConfig {
            use_storage: false,
            session_cache: SessionCacheMode::PassThrough,
            ..config()
        };
        let (service, report) = SecurityService::builder(config, model())
            .start(graph())
            .await
            .unwrap();
        assert_eq!(report.action, StartupAction::UpToDate);
        assert!(service.index().store().is_empty().await.unwrap());

        let session = service.open_session();
        assert_eq!(
            service.get_roles(&session, "u1", "p1").await,
            RoleSet::from(["Member".to_string()])
        );
    }

    #[tokio::test]
    async fn test_deny_while_rebuilding() {
        let flag = Arc::new(LocalRebuildFlag::new());
        let config = SecurityConfig {
            rebuild_strategy: RebuildStrategy::Deny,
            ..config()
        };
        let (service, _) = SecurityService::builder(config, model())
            .with_cluster_flag(flag.clone())
            .start(graph())
            .await
            .unwrap();

        assert!(flag.try_begin());
        let session = service.open_session();
        assert!(!service.has_role(&session, "u1", "p1", &member()).await);
        assert!(service.get_groups(&session, "p1", "Member").await.is_empty());

        // The rebuilding session is never denied
        let rebuild_session = service.open_rebuild_session();
        assert!(service.has_role(&rebuild_session, "u1", "p1", &member()).await);
        flag.end();

        assert!(service.has_role(&session, "u1", "p1", &member()).await);
        assert_eq!(service.metrics().snapshot().await.denied_reads, 2);
    }

    #[tokio::test]
    async fn test_reload_rules_rebuilds_on_change() {
        let (service, _) = SecurityService::builder(config(), model())
            .start(graph())
            .await
            .unwrap();
        let before = service.rules().version().to_string();

        let problems = service
            .reload_rules(&RoleRulesConfig::new(vec![
                RuleConfig::new("owner", "Project", "Owner").attribute("owner", false)
            ]))
            .await
            .unwrap();
        assert!(problems.is_empty());
        assert_ne!(service.rules().version(), before);

        let session = service.open_session();
        assert_eq!(
            service.get_roles(&session, "u1", "p1").await,
            RoleSet::from(["Owner".to_string()])
        );
        assert_eq!(
            service.index().config_version().await.unwrap().as_deref(),
            Some(service.rules().version())
        );
    }

    #[tokio::test]
    async fn test_shut_down_rejects_commits() {
        let graph = graph();
        let (service, _) = SecurityService::builder(config(), model())
            .start(graph.clone())
            .await
            .unwrap();
        service.shut_down();

        let mut tx = graph.transaction();
        tx.create_person("u3").unwrap();
        let (_, commit) = tx.commit();
        assert!(service.handle_commit(&commit).await.is_err());
    }
}
