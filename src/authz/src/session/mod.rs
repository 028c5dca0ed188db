//! Request sessions
//!
//! A [`Session`] pins the graph snapshot its reads evaluate against and owns the
//! per-subject [`RoleComputation`]s created lazily on first use. Sessions are
//! passed explicitly to every read; dropping one discards its caches.

pub mod computation;

pub use computation::{CachingRoleComputation, RoleComputation, RoleSetPool, StorageRoleComputation};

use crate::error::SecurityError;
use crate::metrics::SecurityMetrics;
use crate::storage::GrantStore;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rolegraph_core::ObjectGraph;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

/// Which [`RoleComputation`] a session creates
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionCacheMode {
    /// Ask the store on every call
    PassThrough,
    /// Memoize role sets per object
    #[default]
    Caching,
}

impl FromStr for SessionCacheMode {
    type Err = SecurityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "pass_through" | "passthrough" => Ok(SessionCacheMode::PassThrough),
            "caching" => Ok(SessionCacheMode::Caching),
            other => Err(SecurityError::config(format!("unknown session cache mode '{}'", other))),
        }
    }
}

impl fmt::Display for SessionCacheMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionCacheMode::PassThrough => f.write_str("pass_through"),
            SessionCacheMode::Caching => f.write_str("caching"),
        }
    }
}

/// Request-scoped read context
pub struct Session {
    id: Uuid,
    graph: Arc<dyn ObjectGraph>,
    mode: SessionCacheMode,
    rebuild: bool,
    computations: DashMap<String, Arc<dyn RoleComputation>>,
    pool: Arc<RoleSetPool>,
    opened_at: DateTime<Utc>,
}

impl Session {
    pub fn new(graph: Arc<dyn ObjectGraph>, mode: SessionCacheMode) -> Self {
        Self {
            id: Uuid::new_v4(),
            graph,
            mode,
            rebuild: false,
            computations: DashMap::new(),
            pool: Arc::new(RoleSetPool::new()),
            opened_at: Utc::now(),
        }
    }

    /// Session of the task running a rebuild; its reads always compute live
    pub fn for_rebuild(graph: Arc<dyn ObjectGraph>, mode: SessionCacheMode) -> Self {
        Self {
            rebuild: true,
            ..Self::new(graph, mode)
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn graph(&self) -> &Arc<dyn ObjectGraph> {
        &self.graph
    }

    pub fn mode(&self) -> SessionCacheMode {
        self.mode
    }

    pub fn is_rebuild_session(&self) -> bool {
        self.rebuild
    }

    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    /// Role computation for `subject`, created on first use
    pub fn computation(
        &self,
        subject: &str,
        store: &Arc<dyn GrantStore>,
        metrics: &Arc<SecurityMetrics>,
    ) -> Arc<dyn RoleComputation> {
        if let Some(existing) = self.computations.get(subject) {
            return existing.value().clone();
        }
        let inner = StorageRoleComputation::new(subject, self.graph.clone(), store.clone(), metrics.clone());
        let created: Arc<dyn RoleComputation> = match self.mode {
            SessionCacheMode::PassThrough => Arc::new(inner),
            SessionCacheMode::Caching => Arc::new(CachingRoleComputation::new(inner, self.pool.clone())),
        };
        self.computations
            .entry(subject.to_string())
            .or_insert(created)
            .value()
            .clone()
    }

    /// Number of subjects with a live computation
    pub fn subjects(&self) -> usize {
        self.computations.len()
    }

    /// Drop every cached computation and role set
    pub fn reset_cache(&self) {
        self.computations.clear();
        self.pool.clear();
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("rebuild", &self.rebuild)
            .field("subjects", &self.computations.len())
            .field("opened_at", &self.opened_at)
            .finish()
    }
}
