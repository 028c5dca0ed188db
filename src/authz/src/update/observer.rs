//! Commit observers extend a commit with objects the security update must treat as changed

use crate::types::ObjectId;
use rolegraph_core::{Commit, ObjectInfo};
use std::collections::BTreeMap;

/// Hook run before a commit is planned
///
/// Observers add to the created and removed maps; they cannot drop entries.
pub trait CommitObserver: Send + Sync {
    fn observe(
        &self,
        commit: &Commit,
        created: &mut BTreeMap<ObjectId, ObjectInfo>,
        removed: &mut BTreeMap<ObjectId, ObjectInfo>,
    );
}
