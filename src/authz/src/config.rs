//! Security subsystem configuration

use crate::error::{Result, SecurityError};
use crate::rules::RoleRulesConfig;
use crate::session::SessionCacheMode;
use crate::storage::{RebuildCoordinator, RebuildStrategy};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// Environment variable overriding [`SecurityConfig::rebuild_strategy`]
pub const ENV_REBUILD_STRATEGY: &str = "ROLEGRAPH_REBUILD_STRATEGY";
/// Environment variable overriding [`SecurityConfig::session_cache`]
pub const ENV_SESSION_CACHE: &str = "ROLEGRAPH_SESSION_CACHE";
/// Environment variable overriding [`SecurityConfig::use_storage`]
pub const ENV_USE_STORAGE: &str = "ROLEGRAPH_USE_STORAGE";
/// Environment variable overriding [`SecurityConfig::defer_rebuild_until_maintenance`]
pub const ENV_DEFER_REBUILD: &str = "ROLEGRAPH_DEFER_REBUILD";

/// Security service configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Answer reads from the persisted role index; live evaluation otherwise
    pub use_storage: bool,

    /// Read behavior while the index is being rebuilt
    pub rebuild_strategy: RebuildStrategy,

    /// Per-session memoization of role lookups
    pub session_cache: SessionCacheMode,

    /// Postpone a startup rebuild until the cluster reports a maintenance window
    pub defer_rebuild_until_maintenance: bool,

    /// First poll interval of the `block` strategy
    pub block_poll_initial_ms: u64,

    /// Poll interval cap of the `block` strategy
    pub block_poll_max_ms: u64,

    /// Commit updates slower than this are logged as warnings
    pub slow_update_warn_ms: u64,

    /// Log every commit's update plan
    pub log_updates: bool,

    pub role_rules: RoleRulesConfig,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            use_storage: true,
            rebuild_strategy: RebuildStrategy::default(),
            session_cache: SessionCacheMode::default(),
            defer_rebuild_until_maintenance: false,
            block_poll_initial_ms: 10,
            block_poll_max_ms: 500,
            slow_update_warn_ms: 3000,
            log_updates: false,
            role_rules: RoleRulesConfig::default(),
        }
    }
}

impl SecurityConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            SecurityError::config(format!("cannot read security config {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&json)
    }

    fn validate(&self) -> Result<()> {
        if self.block_poll_initial_ms == 0 {
            return Err(SecurityError::config("block_poll_initial_ms must be positive"));
        }
        if self.block_poll_max_ms < self.block_poll_initial_ms {
            return Err(SecurityError::config(
                "block_poll_max_ms must not be below block_poll_initial_ms",
            ));
        }
        Ok(())
    }

    /// Apply the `ROLEGRAPH_*` environment variables
    ///
    /// Unparsable values are ignored with a warning.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(value) = lookup(ENV_REBUILD_STRATEGY) {
            match value.parse() {
                Ok(strategy) => self.rebuild_strategy = strategy,
                Err(err) => warn!(key = ENV_REBUILD_STRATEGY, error = %err, "ignoring override"),
            }
        }
        if let Some(value) = lookup(ENV_SESSION_CACHE) {
            match value.parse() {
                Ok(mode) => self.session_cache = mode,
                Err(err) => warn!(key = ENV_SESSION_CACHE, error = %err, "ignoring override"),
            }
        }
        if let Some(flag) = lookup(ENV_USE_STORAGE).and_then(|s| parse_flag(&s)) {
            self.use_storage = flag;
        }
        if let Some(flag) = lookup(ENV_DEFER_REBUILD).and_then(|s| parse_flag(&s)) {
            self.defer_rebuild_until_maintenance = flag;
        }
        self
    }

    pub fn slow_update_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_update_warn_ms)
    }

    /// Coordinator carrying this configuration's rebuild settings
    pub fn coordinator(&self) -> RebuildCoordinator {
        RebuildCoordinator::new(
            self.rebuild_strategy,
            self.defer_rebuild_until_maintenance,
            Duration::from_millis(self.block_poll_initial_ms),
            Duration::from_millis(self.block_poll_max_ms),
        )
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
