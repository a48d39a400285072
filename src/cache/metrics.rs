//! Cache Metrics Collection
//!
//! Counters for monitoring cache and scheduler health.

use std::sync::atomic::{AtomicU64, Ordering};

/// Cache metrics collector
#[derive(Debug, Default)]
pub struct CacheMetrics {
    // Table metrics
    hits: AtomicU64,
    misses: AtomicU64,
    inserts: AtomicU64,
    intern_hits: AtomicU64,
    evictions: AtomicU64,
    evicted_bytes: AtomicU64,
    over_budget_admissions: AtomicU64,
    invalidations: AtomicU64,

    // Memoization metrics
    memo_hits: AtomicU64,
    memo_misses: AtomicU64,
    deduplicated_runs: AtomicU64,

    // Task metrics
    tasks_queued: AtomicU64,
    tasks_executed: AtomicU64,
    tasks_deferred: AtomicU64,
    tasks_failed: AtomicU64,
    tasks_reclaimed: AtomicU64,
}

impl CacheMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    // Table metrics
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_insert(&self) {
        self.inserts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_intern_hit(&self) {
        self.intern_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_evictions(&self, count: u64, bytes: u64) {
        self.evictions.fetch_add(count, Ordering::Relaxed);
        self.evicted_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_over_budget(&self) {
        self.over_budget_admissions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalidation(&self) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits() as f64;
        let total = hits + self.misses() as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }

    // Memoization metrics
    pub fn record_memo_hit(&self) {
        self.memo_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_memo_miss(&self) {
        self.memo_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_deduplicated_run(&self) {
        self.deduplicated_runs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn memo_hits(&self) -> u64 {
        self.memo_hits.load(Ordering::Relaxed)
    }

    pub fn deduplicated_runs(&self) -> u64 {
        self.deduplicated_runs.load(Ordering::Relaxed)
    }

    // Task metrics
    pub fn record_task_queued(&self) {
        self.tasks_queued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_task_executed(&self) {
        self.tasks_executed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_task_deferred(&self) {
        self.tasks_deferred.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_task_failed(&self) {
        self.tasks_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_task_reclaimed(&self) {
        self.tasks_reclaimed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tasks_executed(&self) -> u64 {
        self.tasks_executed.load(Ordering::Relaxed)
    }

    /// Get snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            hits: self.hits(),
            misses: self.misses(),
            hit_ratio: self.hit_ratio(),
            inserts: self.inserts.load(Ordering::Relaxed),
            intern_hits: self.intern_hits.load(Ordering::Relaxed),
            evictions: self.evictions(),
            evicted_bytes: self.evicted_bytes.load(Ordering::Relaxed),
            over_budget_admissions: self.over_budget_admissions.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),

            memo_hits: self.memo_hits(),
            memo_misses: self.memo_misses.load(Ordering::Relaxed),
            deduplicated_runs: self.deduplicated_runs(),

            tasks_queued: self.tasks_queued.load(Ordering::Relaxed),
            tasks_executed: self.tasks_executed(),
            tasks_deferred: self.tasks_deferred.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
            tasks_reclaimed: self.tasks_reclaimed.load(Ordering::Relaxed),
        }
    }

    /// Reset all metrics
    pub fn reset(&self) {
        for counter in [
            &self.hits,
            &self.misses,
            &self.inserts,
            &self.intern_hits,
            &self.evictions,
            &self.evicted_bytes,
            &self.over_budget_admissions,
            &self.invalidations,
            &self.memo_hits,
            &self.memo_misses,
            &self.deduplicated_runs,
            &self.tasks_queued,
            &self.tasks_executed,
            &self.tasks_deferred,
            &self.tasks_failed,
            &self.tasks_reclaimed,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Snapshot of all cache metrics
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct MetricsSnapshot {
    // Tables
    pub hits: u64,
    pub misses: u64,
    pub hit_ratio: f64,
    pub inserts: u64,
    pub intern_hits: u64,
    pub evictions: u64,
    pub evicted_bytes: u64,
    pub over_budget_admissions: u64,
    pub invalidations: u64,

    // Memoization
    pub memo_hits: u64,
    pub memo_misses: u64,
    pub deduplicated_runs: u64,

    // Tasks
    pub tasks_queued: u64,
    pub tasks_executed: u64,
    pub tasks_deferred: u64,
    pub tasks_failed: u64,
    pub tasks_reclaimed: u64,
}

// =============================================================================
// Tests
// =============================================================================
