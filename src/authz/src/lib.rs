//! # Rolegraph Authorization
//!
//! Rule-based role resolution over an object graph, with an incrementally
//! maintained role index.
//!
//! ## Features
//!
//! - **Role rules** walking typed attribute and association paths, forward and backward
//! - **Role inheritance** between objects, resolved with a bounded fixpoint on every commit
//! - **Persisted role index** (`(group, role, object)` facts) kept in step with commits
//! - **Rebuild strategies** (deny, block, compute) for reads while the index is rebuilt
//! - **Session caches** for request-scoped role lookups
//!
//! ## Example
//!
//! ```rust
//! use rolegraph_authz::{RoleRulesConfig, RuleConfig, SecurityConfig, SecurityService};
//! use rolegraph_core::{InMemoryGraph, TypeDef, TypeModel};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let model = Arc::new(TypeModel::from_types([
//!         TypeDef::new("Project").with_reference("owner", "Person"),
//!         TypeDef::new("Person"),
//!     ])?);
//!     let mut tx = Arc::new(InMemoryGraph::new(model.clone())).transaction();
//!     tx.create_person("alice")?;
//!     tx.create("apollo", "Project")?;
//!     tx.set_attribute("apollo", "owner", ["alice"])?;
//!     let (graph, _) = tx.commit();
//!
//!     let config = SecurityConfig {
//!         role_rules: RoleRulesConfig::new(vec![
//!             RuleConfig::new("owner", "Project", "Member").attribute("owner", false),
//!         ]),
//!         ..Default::default()
//!     };
//!     let (service, _) = SecurityService::builder(config, model).start(graph).await?;
//!
//!     let session = service.open_session();
//!     assert!(service.get_roles(&session, "alice", "apollo").await.contains("Member"));
//!     Ok(())
//! }
//! ```

pub mod access;
pub mod config;
pub mod error;
pub mod evaluator;
pub mod metrics;
pub mod provider;
pub mod rules;
pub mod service;
pub mod session;
pub mod storage;
pub mod types;
pub mod update;

// Re-export commonly used types
pub use access::{AccessManager, CacheModeGuard, CacheModeStats};
pub use config::SecurityConfig;
pub use error::{Result, SecurityError};
pub use evaluator::EvalContext;
pub use metrics::{SecurityMetrics, SecurityMetricsSnapshot};
pub use provider::{ExternalRoleProvider, RoleProvider};
pub use rules::{load_rules, RoleRulesConfig, RuleConfig, RuleIndex, RuleProblem, RuleRegistry};
pub use service::{SecurityService, SecurityServiceBuilder, StartupReport};
pub use session::{RoleComputation, Session, SessionCacheMode};
pub use storage::{
    ClusterRebuildFlag, GrantStore, InMemoryGrantStore, LocalRebuildFlag, RebuildOutcome, RebuildStrategy,
    SecurityIndex, StartupAction,
};
#[cfg(feature = "postgres")]
pub use storage::PostgresGrantStore;
pub use types::{GrantReason, GroupSet, InvalidObjects, ObjectSet, RoleGrant, RoleSet, RuleId};
pub use update::{
    CommitObserver, SecurityUpdateLog, SecurityUpdateManager, UpdatePhase, UpdatePlan, UpdateReport,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
