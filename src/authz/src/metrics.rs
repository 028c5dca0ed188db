//! Prometheus-style metrics for security updates and the read path

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Security subsystem counters
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SecurityMetricsSnapshot {
    /// Commits handled by the update manager
    pub commits_processed: u64,

    /// `(provider, object)` pairs recomputed across all commits
    pub affected_pairs: u64,

    /// Highest inheritance fixpoint iteration count seen
    pub max_fixpoint_iterations: u64,

    /// Grant store operations that failed
    pub storage_failures: u64,

    /// Reads answered by live evaluation instead of stored facts
    pub live_fallbacks: u64,

    /// Reads denied because a rebuild was running
    pub denied_reads: u64,

    /// Reads that waited for a rebuild
    pub blocked_reads: u64,

    /// Completed index rebuilds
    pub rebuilds: u64,

    /// Facts written by the last rebuild
    pub last_rebuild_facts: u64,

    /// Session role-set cache hits
    pub session_cache_hits: u64,

    /// Session role-set cache misses
    pub session_cache_misses: u64,

    /// Commit update latency
    pub update_p50_ms: f64,
    pub update_p99_ms: f64,
    pub avg_update_ms: f64,
}

impl SecurityMetricsSnapshot {
    pub fn session_cache_hit_rate(&self) -> f64 {
        let total = self.session_cache_hits + self.session_cache_misses;
        if total == 0 {
            0.0
        } else {
            self.session_cache_hits as f64 / total as f64
        }
    }
}

/// Metrics collector shared by the service components
pub struct SecurityMetrics {
    metrics: Arc<RwLock<SecurityMetricsSnapshot>>,

    /// Update latency samples for percentile calculation
    update_samples: Arc<RwLock<Vec<f64>>>,

    max_samples: usize,
}

impl SecurityMetrics {
    pub fn new() -> Self {
        Self {
            metrics: Arc::new(RwLock::new(SecurityMetricsSnapshot::default())),
            update_samples: Arc::new(RwLock::new(Vec::with_capacity(1_000))),
            max_samples: 1_000,
        }
    }

    /// Record one processed commit
    pub async fn record_commit(&self, affected_pairs: usize, iterations: usize, elapsed: Duration) {
        let elapsed_ms = elapsed.as_secs_f64() * 1000.0;

        let mut samples = self.update_samples.write().await;
        samples.push(elapsed_ms);
        if samples.len() > self.max_samples {
            samples.drain(0..self.max_samples / 10);
        }

        let mut sorted = samples.clone();
        sorted.sort_by(f64::total_cmp);

        let mut metrics = self.metrics.write().await;
        metrics.commits_processed += 1;
        metrics.affected_pairs += affected_pairs as u64;
        metrics.max_fixpoint_iterations = metrics.max_fixpoint_iterations.max(iterations as u64);
        metrics.avg_update_ms = sorted.iter().sum::<f64>() / sorted.len() as f64;
        metrics.update_p50_ms = Self::percentile(&sorted, 0.50);
        metrics.update_p99_ms = Self::percentile(&sorted, 0.99);
    }

    pub async fn record_storage_failure(&self) {
        self.metrics.write().await.storage_failures += 1;
    }

    pub async fn record_live_fallback(&self) {
        self.metrics.write().await.live_fallbacks += 1;
    }

    pub async fn record_denied_read(&self) {
        self.metrics.write().await.denied_reads += 1;
    }

    pub async fn record_blocked_read(&self) {
        self.metrics.write().await.blocked_reads += 1;
    }

    pub async fn record_rebuild(&self, facts: usize) {
        let mut metrics = self.metrics.write().await;
        metrics.rebuilds += 1;
        metrics.last_rebuild_facts = facts as u64;
    }

    pub async fn record_session_cache(&self, hit: bool) {
        let mut metrics = self.metrics.write().await;
        if hit {
            metrics.session_cache_hits += 1;
        } else {
            metrics.session_cache_misses += 1;
        }
    }

    /// Current metrics snapshot
    pub async fn snapshot(&self) -> SecurityMetricsSnapshot {
        self.metrics.read().await.clone()
    }

    pub async fn reset(&self) {
        *self.metrics.write().await = SecurityMetricsSnapshot::default();
        self.update_samples.write().await.clear();
    }

    /// Export metrics in Prometheus text format
    pub async fn export_prometheus(&self) -> String {
        let metrics = self.metrics.read().await;

        format!(
            r#"# HELP rolegraph_commits_total Commits processed by the security update manager
# TYPE rolegraph_commits_total counter
rolegraph_commits_total {}

# HELP rolegraph_affected_pairs_total Rule/object pairs recomputed
# TYPE rolegraph_affected_pairs_total counter
rolegraph_affected_pairs_total {}

# HELP rolegraph_fixpoint_iterations_max Highest inheritance fixpoint iteration count
# TYPE rolegraph_fixpoint_iterations_max gauge
rolegraph_fixpoint_iterations_max {}

# HELP rolegraph_storage_failures_total Failed grant store operations
# TYPE rolegraph_storage_failures_total counter
rolegraph_storage_failures_total {}

# HELP rolegraph_live_fallbacks_total Reads answered by live evaluation
# TYPE rolegraph_live_fallbacks_total counter
rolegraph_live_fallbacks_total {}

# HELP rolegraph_denied_reads_total Reads denied during a rebuild
# TYPE rolegraph_denied_reads_total counter
rolegraph_denied_reads_total {}

# HELP rolegraph_blocked_reads_total Reads that waited for a rebuild
# TYPE rolegraph_blocked_reads_total counter
rolegraph_blocked_reads_total {}

# HELP rolegraph_rebuilds_total Completed index rebuilds
# TYPE rolegraph_rebuilds_total counter
rolegraph_rebuilds_total {}

# HELP rolegraph_session_cache_hits_total Session role-set cache hits
# TYPE rolegraph_session_cache_hits_total counter
rolegraph_session_cache_hits_total {}

# HELP rolegraph_session_cache_misses_total Session role-set cache misses
# TYPE rolegraph_session_cache_misses_total counter
rolegraph_session_cache_misses_total {}

# HELP rolegraph_update_seconds Commit update latency
# TYPE rolegraph_update_seconds summary
rolegraph_update_seconds{{quantile="0.5"}} {}
rolegraph_update_seconds{{quantile="0.99"}} {}
"#,
            metrics.commits_processed,
            metrics.affected_pairs,
            metrics.max_fixpoint_iterations,
            metrics.storage_failures,
            metrics.live_fallbacks,
            metrics.denied_reads,
            metrics.blocked_reads,
            metrics.rebuilds,
            metrics.session_cache_hits,
            metrics.session_cache_misses,
            metrics.update_p50_ms / 1000.0,
            metrics.update_p99_ms / 1000.0,
        )
    }

    fn percentile(sorted: &[f64], p: f64) -> f64 {
        if sorted.is_empty() {
            return 0.0;
        }

        let idx = ((sorted.len() as f64) * p) as usize;
        let idx = idx.min(sorted.len() - 1);
        sorted[idx]
    }
}

impl Default for SecurityMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_metrics_creation() {
        let metrics = SecurityMetrics::new();
        let snapshot = metrics.snapshot().await;

        assert_eq!(snapshot.commits_processed, 0);
        assert_eq!(snapshot.session_cache_hit_rate(), 0.0);
    }

    #[tokio::test]
    async fn test_record_commit() {
        let metrics = SecurityMetrics::new();

        metrics.record_commit(3, 2, Duration::from_millis(10)).await;
        metrics.record_commit(5, 7, Duration::from_millis(30)).await;
        metrics.record_commit(0, 1, Duration::from_millis(20)).await;

        let snapshot = metrics.snapshot().await;
        assert_eq!(snapshot.commits_processed, 3);
        assert_eq!(snapshot.affected_pairs, 8);
        assert_eq!(snapshot.max_fixpoint_iterations, 7);
        assert!((snapshot.avg_update_ms - 20.0).abs() < 1e-6);
        assert!((snapshot.update_p50_ms - 20.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_session_cache_rate() {
        let metrics = SecurityMetrics::new();
        metrics.record_session_cache(true).await;
        metrics.record_session_cache(true).await;
        metrics.record_session_cache(true).await;
        metrics.record_session_cache(false).await;

        let snapshot = metrics.snapshot().await;
        assert_eq!(snapshot.session_cache_hit_rate(), 0.75);
    }

    #[tokio::test]
    async fn test_reset() {
        let metrics = SecurityMetrics::new();
        metrics.record_storage_failure().await;
        metrics.record_rebuild(42).await;
        metrics.reset().await;

        assert_eq!(metrics.snapshot().await, SecurityMetricsSnapshot::default());
    }

    #[tokio::test]
    async fn test_prometheus_export() {
        let metrics = SecurityMetrics::new();
        metrics.record_denied_read().await;
        metrics.record_rebuild(10).await;

        let export = metrics.export_prometheus().await;
        assert!(export.contains("rolegraph_denied_reads_total 1"));
        assert!(export.contains("rolegraph_rebuilds_total 1"));
        assert!(export.contains("rolegraph_update_seconds{quantile=\"0.5\"} 0"));
    }
}
