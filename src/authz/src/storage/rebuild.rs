//! Rebuild coordination and read degradation

use crate::error::SecurityError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info};

/// How reads behave while the persisted index is being rebuilt
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RebuildStrategy {
    /// Answer "no role"
    Deny,
    /// Wait until the rebuild finishes
    Block,
    /// Evaluate rules live
    #[default]
    Compute,
}

impl FromStr for RebuildStrategy {
    type Err = SecurityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "deny" => Ok(RebuildStrategy::Deny),
            "block" => Ok(RebuildStrategy::Block),
            "compute" => Ok(RebuildStrategy::Compute),
            other => Err(SecurityError::config(format!("unknown rebuild strategy '{}'", other))),
        }
    }
}

impl fmt::Display for RebuildStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RebuildStrategy::Deny => "deny",
            RebuildStrategy::Block => "block",
            RebuildStrategy::Compute => "compute",
        };
        f.write_str(name)
    }
}

/// Cluster-wide rebuild flag; at most one node holds it at a time
pub trait ClusterRebuildFlag: Send + Sync {
    /// Acquire the flag; false if another rebuild holds it
    fn try_begin(&self) -> bool;

    /// Release the flag
    fn end(&self);

    fn is_rebuilding(&self) -> bool;

    /// Whether the cluster agreed on a maintenance window
    fn maintenance_window(&self) -> bool;
}

/// Single-node rebuild flag
#[derive(Debug, Default)]
pub struct LocalRebuildFlag {
    rebuilding: AtomicBool,
    maintenance: AtomicBool,
}

impl LocalRebuildFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_maintenance_window(&self, open: bool) {
        self.maintenance.store(open, Ordering::SeqCst);
    }
}

impl ClusterRebuildFlag for LocalRebuildFlag {
    fn try_begin(&self) -> bool {
        self.rebuilding
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn end(&self) {
        self.rebuilding.store(false, Ordering::SeqCst);
    }

    fn is_rebuilding(&self) -> bool {
        self.rebuilding.load(Ordering::SeqCst)
    }

    fn maintenance_window(&self) -> bool {
        self.maintenance.load(Ordering::SeqCst)
    }
}

/// What startup decided about the persisted index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupAction {
    /// Stored facts match the loaded rules
    UpToDate,
    /// Rebuild immediately
    RebuildNow,
    /// Rebuild once a maintenance window opens
    Deferred,
}

/// Summary of a finished rebuild
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebuildReport {
    pub facts: usize,
    pub duration: Duration,
    pub finished_at: DateTime<Utc>,
    pub config_version: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RebuildOutcome {
    Completed(RebuildReport),
    /// Another rebuild holds the flag
    AlreadyRunning,
}

/// Where a read is answered from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    Storage,
    Deny,
    Block,
    Compute,
}

/// Applies the configured rebuild strategy and tracks deferred rebuilds
#[derive(Debug)]
pub struct RebuildCoordinator {
    strategy: RebuildStrategy,
    defer_until_maintenance: bool,
    poll_initial: Duration,
    poll_max: Duration,
    pending: AtomicBool,
}

impl RebuildCoordinator {
    pub fn new(
        strategy: RebuildStrategy,
        defer_until_maintenance: bool,
        poll_initial: Duration,
        poll_max: Duration,
    ) -> Self {
        Self {
            strategy,
            defer_until_maintenance,
            poll_initial: poll_initial.max(Duration::from_millis(1)),
            poll_max: poll_max.max(poll_initial),
            pending: AtomicBool::new(false),
        }
    }

    pub fn strategy(&self) -> RebuildStrategy {
        self.strategy
    }

    /// Compare the stored configuration version with the loaded one
    pub fn startup_action(&self, stored: Option<&str>, current: &str, dirty: bool) -> StartupAction {
        if stored == Some(current) && !dirty {
            return StartupAction::UpToDate;
        }
        info!(
            stored = stored.unwrap_or("<none>"),
            current,
            dirty,
            "role index out of date"
        );
        if self.defer_until_maintenance {
            self.pending.store(true, Ordering::SeqCst);
            StartupAction::Deferred
        } else {
            StartupAction::RebuildNow
        }
    }

    /// Schedule a rebuild for the next maintenance window
    pub fn defer(&self) {
        self.pending.store(true, Ordering::SeqCst);
    }

    pub fn has_pending(&self) -> bool {
        self.pending.load(Ordering::SeqCst)
    }

    /// Take the pending rebuild, if any
    pub fn take_pending(&self) -> bool {
        self.pending.swap(false, Ordering::SeqCst)
    }

    /// Choose how to answer a read
    ///
    /// A dirty index that is not being rebuilt is never trusted. The session
    /// running the rebuild always computes, since waiting on itself would never end.
    pub fn read_mode(&self, rebuilding: bool, dirty: bool, rebuild_session: bool) -> ReadMode {
        if !rebuilding {
            return if dirty { ReadMode::Compute } else { ReadMode::Storage };
        }
        if rebuild_session {
            return ReadMode::Compute;
        }
        match self.strategy {
            RebuildStrategy::Deny => ReadMode::Deny,
            RebuildStrategy::Block => ReadMode::Block,
            RebuildStrategy::Compute => ReadMode::Compute,
        }
    }

    /// Poll until the rebuild flag is released, returning the number of polls
    ///
    /// There is no timeout.
    pub async fn wait_for_rebuild(&self, flag: &dyn ClusterRebuildFlag) -> u32 {
        let mut delay = self.poll_initial;
        let mut polls = 0;
        while flag.is_rebuilding() {
            polls += 1;
            debug!(polls, delay_ms = delay.as_millis() as u64, "waiting for role index rebuild");
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(self.poll_max);
        }
        polls
    }
}

impl Default for RebuildCoordinator {
    fn default() -> Self {
        Self::new(
            RebuildStrategy::default(),
            false,
            Duration::from_millis(10),
            Duration::from_millis(500),
        )
    }
}
