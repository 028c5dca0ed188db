//! Cache mode: re-entrant memoization of `get_groups` answers

use crate::types::{GroupSet, ObjectId, RoleId};
use parking_lot::Mutex;
use std::collections::HashMap;

/// Memo key: graph snapshot identity plus the `(object, role)` question
type MemoKey = (u64, ObjectId, RoleId);

#[derive(Debug, Default)]
struct CacheState {
    depth: usize,
    groups: HashMap<MemoKey, GroupSet>,
    hits: u64,
    misses: u64,
}

/// Snapshot of the cache-mode counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheModeStats {
    pub depth: usize,
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

/// Re-entrant cache-mode counter with its memo table
///
/// The memo only lives while the counter is above zero; it is dropped when the
/// outermost caller ends cache mode.
#[derive(Debug, Default)]
pub struct CacheMode {
    state: Mutex<CacheState>,
}

impl CacheMode {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter cache mode, returning the new depth
    pub fn begin(&self) -> usize {
        let mut state = self.state.lock();
        state.depth += 1;
        state.depth
    }

    /// Leave cache mode, returning the remaining depth
    ///
    /// Unbalanced calls saturate at zero.
    pub fn end(&self) -> usize {
        let mut state = self.state.lock();
        state.depth = state.depth.saturating_sub(1);
        if state.depth == 0 {
            state.groups.clear();
        }
        state.depth
    }

    pub fn depth(&self) -> usize {
        self.state.lock().depth
    }

    pub fn is_active(&self) -> bool {
        self.depth() > 0
    }

    pub(crate) fn lookup(&self, graph: u64, object: &str, role: &str) -> Option<GroupSet> {
        let mut state = self.state.lock();
        if state.depth == 0 {
            return None;
        }
        let found = state
            .groups
            .get(&(graph, object.to_string(), role.to_string()))
            .cloned();
        match found {
            Some(groups) => {
                state.hits += 1;
                Some(groups)
            }
            None => {
                state.misses += 1;
                None
            }
        }
    }

    pub(crate) fn store(&self, graph: u64, object: &str, role: &str, groups: &GroupSet) {
        let mut state = self.state.lock();
        if state.depth > 0 {
            state
                .groups
                .insert((graph, object.to_string(), role.to_string()), groups.clone());
        }
    }

    /// Drop memoized answers without leaving cache mode
    pub fn invalidate(&self) {
        self.state.lock().groups.clear();
    }

    pub fn stats(&self) -> CacheModeStats {
        let state = self.state.lock();
        CacheModeStats {
            depth: state.depth,
            entries: state.groups.len(),
            hits: state.hits,
            misses: state.misses,
        }
    }
}
