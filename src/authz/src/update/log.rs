//! Update log handlers: receive each commit together with its computed plan

use super::UpdatePlan;
use rolegraph_core::Commit;
use tracing::{debug, info};

/// Receives every processed commit before its facts are written
pub trait SecurityUpdateLog: Send + Sync {
    fn log(&self, commit: &Commit, plan: &UpdatePlan);
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullUpdateLog;

impl SecurityUpdateLog for NullUpdateLog {
    fn log(&self, _commit: &Commit, _plan: &UpdatePlan) {}
}

/// Writes a structured `info` event per commit and a `debug` event per provider
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingUpdateLog;

impl SecurityUpdateLog for TracingUpdateLog {
    fn log(&self, commit: &Commit, plan: &UpdatePlan) {
        let changes = &commit.changes;
        info!(
            changed = changes.changed.len(),
            created = changes.created.len(),
            removed = changes.removed.len(),
            links = changes.link_count(),
            providers = plan.affected.len(),
            pairs = plan.pair_count(),
            iterations = plan.iterations,
            "security update"
        );
        for (provider, objects) in &plan.affected {
            debug!(provider = provider.id(), role = provider.role(), objects = ?objects, "affected objects");
        }
    }
}
