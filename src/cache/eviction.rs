//! Priority / Eviction Engine
//!
//! Tracks per-item priority metadata for one table and picks victims when an
//! admission would push the table past its memory budget.
//!
//! # Design
//!
//! - Metadata lives in a `DashMap` so `touch` on distinct items never contends
//! - Last-access time and build cost are atomics updated in place
//! - Admissions that fit reserve their bytes with a CAS on the running total
//! - Only admissions that must evict take the engine's eviction lock

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::id::Id;
use super::priority::CacheItemPriority;

/// Live metadata for one tracked item
#[derive(Debug)]
struct ItemStats {
    memory_used: u64,
    last_access: AtomicU64,
    /// f32 bits
    cycles_per_byte: AtomicU32,
}

impl ItemStats {
    fn priority(&self) -> CacheItemPriority {
        CacheItemPriority {
            memory_used: self.memory_used,
            last_accessed_timestamp: self.last_access.load(Ordering::Relaxed),
            cycles_to_build_per_byte: f32::from_bits(self.cycles_per_byte.load(Ordering::Relaxed)),
        }
    }
}

/// Outcome of admitting an item
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Admission {
    /// Items removed to make room, lowest priority first
    pub evicted: Vec<Id>,
    /// Bytes released by the evictions
    pub evicted_bytes: u64,
    /// Table is over budget after admission (item alone exceeds the budget)
    pub over_budget: bool,
}

/// Eviction engine for one table
#[derive(Debug)]
pub struct EvictionEngine {
    /// Table name for logging
    name: &'static str,
    /// Memory budget in bytes
    budget: u64,
    /// Tracked items
    items: DashMap<Id, ItemStats>,
    /// Sum of `memory_used` over tracked and reserved items
    total: AtomicU64,
    /// Serializes victim selection
    evicting: Mutex<()>,
}

impl EvictionEngine {
    /// Create an engine with the given budget
    pub fn new(name: &'static str, budget: u64) -> Self {
        Self {
            name,
            budget,
            items: DashMap::new(),
            total: AtomicU64::new(0),
            evicting: Mutex::new(()),
        }
    }

    #[inline]
    pub fn budget(&self) -> u64 {
        self.budget
    }

    /// Bytes currently tracked
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Current priority metadata of an item
    pub fn priority_of(&self, id: Id) -> Option<CacheItemPriority> {
        self.items.get(&id).map(|stats| stats.priority())
    }

    /// Record an access; returns false for untracked items
    pub fn touch(&self, id: Id, now: u64) -> bool {
        match self.items.get(&id) {
            Some(stats) => {
                stats.last_access.fetch_max(now, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Raise an item's build cost to at least `cycles_per_byte`
    pub fn raise_cost(&self, id: Id, cycles_per_byte: f32) {
        if let Some(stats) = self.items.get(&id) {
            let current = f32::from_bits(stats.cycles_per_byte.load(Ordering::Relaxed));
            if cycles_per_byte > current {
                stats
                    .cycles_per_byte
                    .store(cycles_per_byte.to_bits(), Ordering::Relaxed);
            }
        }
    }

    /// Admit an item, evicting lower-priority items until it fits
    ///
    /// Victims are chosen one at a time as the globally lowest-priority item;
    /// ties go to the smaller item, then the older identifier. An item larger
    /// than the whole budget evicts everything else and is admitted alone.
    pub fn admit(&self, id: Id, priority: CacheItemPriority, now: u64) -> Admission {
        let mut admission = Admission::default();
        let memory_used = priority.memory_used;

        if let Some((_, old)) = self.items.remove(&id) {
            self.total.fetch_sub(old.memory_used, Ordering::AcqRel);
        }

        if !self.try_reserve(memory_used) {
            let _evicting = self.evicting.lock();
            if memory_used > self.budget {
                warn!(
                    table = self.name,
                    id,
                    memory_used,
                    budget = self.budget,
                    "Admitting item larger than table budget"
                );
                admission.over_budget = true;
            }

            let mut candidates = self.candidates();
            let mut refreshed = false;
            loop {
                if !admission.over_budget && self.try_reserve(memory_used) {
                    break;
                }
                if candidates.is_empty() {
                    // Items reserved by concurrent admissions may have landed since
                    if !refreshed {
                        candidates = self.candidates();
                        refreshed = true;
                        continue;
                    }
                    self.total.fetch_add(memory_used, Ordering::AcqRel);
                    break;
                }
                let victim = Self::lowest_priority(&candidates, now);
                let (victim_id, _) = candidates.swap_remove(victim);
                if let Some((_, stats)) = self.items.remove(&victim_id) {
                    self.total.fetch_sub(stats.memory_used, Ordering::AcqRel);
                    admission.evicted_bytes += stats.memory_used;
                    admission.evicted.push(victim_id);
                }
            }

            debug!(
                table = self.name,
                evicted = admission.evicted.len(),
                bytes = admission.evicted_bytes,
                "Evicted to admit item {}",
                id
            );
        }

        self.items.insert(
            id,
            ItemStats {
                memory_used,
                last_access: AtomicU64::new(priority.last_accessed_timestamp),
                cycles_per_byte: AtomicU32::new(priority.cycles_to_build_per_byte.to_bits()),
            },
        );
        admission
    }

    /// Stop tracking an item, returning the bytes it held
    pub fn forget(&self, id: Id) -> Option<u64> {
        let (_, stats) = self.items.remove(&id)?;
        self.total.fetch_sub(stats.memory_used, Ordering::AcqRel);
        Some(stats.memory_used)
    }

    /// Stop tracking everything
    pub fn clear(&self) {
        let _evicting = self.evicting.lock();
        self.items.clear();
        self.total.store(0, Ordering::Release);
    }

    /// Add `memory_used` to the total if the result stays within budget
    fn try_reserve(&self, memory_used: u64) -> bool {
        self.total
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |total| {
                total
                    .checked_add(memory_used)
                    .filter(|reserved| *reserved <= self.budget)
            })
            .is_ok()
    }

    fn candidates(&self) -> Vec<(Id, CacheItemPriority)> {
        self.items
            .iter()
            .map(|entry| (*entry.key(), entry.value().priority()))
            .collect()
    }

    fn lowest_priority(candidates: &[(Id, CacheItemPriority)], now: u64) -> usize {
        let mut best = 0;
        for (i, (id, priority)) in candidates.iter().enumerate().skip(1) {
            let (best_id, best_priority) = &candidates[best];
            let lower = priority.is_lower_priority_than(best_priority, now);
            let tied = !lower && !best_priority.is_lower_priority_than(priority, now);
            if lower
                || (tied
                    && (priority.memory_used, *id) < (best_priority.memory_used, *best_id))
            {
                best = i;
            }
        }
        best
    }
}

// =============================================================================
// Tests
// =============================================================================
