//! Cache Item Priority
//!
//! Per-item metadata consulted by the eviction engine: memory held, when the
//! item was last used, and how expensive it was to build.

use std::sync::atomic::{AtomicU64, Ordering};

/// Eviction metadata for one cached item
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CacheItemPriority {
    /// Bytes held by the item
    pub memory_used: u64,
    /// Logical time of last access.
    ///
    /// Kept at full precision because it is subtracted from the current time.
    pub last_accessed_timestamp: u64,
    /// Build cost normalized by size
    pub cycles_to_build_per_byte: f32,
}

impl CacheItemPriority {
    pub fn new(memory_used: u64, now: u64, cycles_to_build_per_byte: f32) -> Self {
        Self {
            memory_used,
            last_accessed_timestamp: now,
            cycles_to_build_per_byte,
        }
    }

    /// Whether `self` is more evictable than `that` at time `now`
    ///
    /// Compares build cost per unit time since last access, cross-multiplied
    /// so no division is needed. Costlier to rebuild and more recently used
    /// both raise priority; memory does not take part.
    #[inline]
    pub fn is_lower_priority_than(&self, that: &CacheItemPriority, now: u64) -> bool {
        let this_since_access = now.saturating_sub(self.last_accessed_timestamp);
        let that_since_access = now.saturating_sub(that.last_accessed_timestamp);
        self.cycles_to_build_per_byte * (that_since_access as f32)
            < that.cycles_to_build_per_byte * (this_since_access as f32)
    }
}

/// Monotonic logical clock shared by all tables
///
/// Every admission and successful lookup takes a fresh tick, so recency is
/// well defined and deterministic for a fixed access sequence.
#[derive(Debug, Default)]
pub struct LogicalClock {
    ticks: AtomicU64,
}

impl LogicalClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the clock and return the new time
    #[inline]
    pub fn tick(&self) -> u64 {
        self.ticks.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Current time without advancing
    #[inline]
    pub fn now(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }
}

// =============================================================================
// Tests
// =============================================================================
