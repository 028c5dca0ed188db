//! Persisted role index
//!
//! [`GrantStore`] is the primitive collaborator holding `(group, role, object)`
//! facts. [`SecurityIndex`] builds on it: it turns rule evaluations into facts,
//! tracks the dirty state and runs full rebuilds. [`RebuildCoordinator`] decides
//! how reads behave while a rebuild is running.

pub mod index;
pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod rebuild;

pub use index::{SecurityIndex, MAX_LIST_LENGTH};
pub use memory::InMemoryGrantStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresGrantStore;
pub use rebuild::{
    ClusterRebuildFlag, LocalRebuildFlag, ReadMode, RebuildCoordinator, RebuildOutcome, RebuildReport,
    RebuildStrategy, StartupAction,
};

use crate::error::Result;
use crate::types::{GrantReason, GroupId, GroupSet, ObjectId, ObjectSet, RoleGrant, RoleId, RoleSet};
use async_trait::async_trait;

/// Storage of role grant facts
#[async_trait]
pub trait GrantStore: Send + Sync {
    /// Whether any of `groups` holds any of `roles` on any of `objects`
    async fn has_role(&self, groups: &[GroupId], objects: &[ObjectId], roles: &[RoleId]) -> Result<bool>;

    /// Roles any of `groups` holds on any of `objects`
    async fn get_roles(&self, groups: &[GroupId], objects: &[ObjectId]) -> Result<RoleSet>;

    /// Objects on which any of `groups` holds any of `roles`, optionally restricted
    async fn business_object_ids(
        &self,
        groups: &[GroupId],
        roles: &[RoleId],
        restrict_to: Option<&[ObjectId]>,
    ) -> Result<ObjectSet>;

    /// Groups holding `role` on `object`
    async fn get_groups(&self, object: &str, role: &str) -> Result<GroupSet>;

    /// Replace every fact produced for `object` with `reason`
    async fn replace_grants(&self, reason: &GrantReason, object: &str, grants: Vec<RoleGrant>) -> Result<()>;

    async fn insert(&self, grants: Vec<RoleGrant>) -> Result<()>;

    async fn remove(&self, grants: &[RoleGrant]) -> Result<()>;

    /// Remove all facts on the given objects, returning the number removed
    async fn remove_objects(&self, objects: &[ObjectId]) -> Result<usize>;

    /// Remove all facts granted to the given groups, returning the number removed
    async fn remove_groups(&self, groups: &[GroupId]) -> Result<usize>;

    async fn clear(&self) -> Result<()>;

    async fn is_empty(&self) -> Result<bool>;

    async fn all_grants(&self) -> Result<Vec<RoleGrant>>;

    /// Persisted dirty flag, set while the facts are known to be incomplete
    async fn dirty_flag(&self) -> Result<bool>;

    async fn set_dirty_flag(&self, dirty: bool) -> Result<()>;

    /// Version hash of the rule configuration the facts were computed with
    async fn config_version(&self) -> Result<Option<String>>;

    async fn set_config_version(&self, version: &str) -> Result<()>;
}
