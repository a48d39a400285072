//! Identifier-Addressed Value Cache
//!
//! Content-addressable storage for immutable values, backed by paged stores
//! and bounded per table by a cost-aware eviction engine.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                            Cache Manager                                  │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  Data Table       │ Integer Table   │ Double Table   │ String Table      │
//! │  (blobs, outputs) │ (interned)      │ (interned)     │ (interned)        │
//! │         │                 │                 │                │           │
//! │         └─────────────────┴────────┬────────┴────────────────┘           │
//! │                                    │                                     │
//! │             IdSpace  ·  PagedValues  ·  EvictionEngine                   │
//! │                                    │                                     │
//! │                    Scheduler (functions, memo, tasks)                    │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Design Principles
//!
//! - Callers only ever hold identifiers; an evicted identifier reads as absent
//! - Identifiers are never reused
//! - Each table stays within its byte budget unless a single item exceeds it
//! - Distinct identifiers never contend on reads

mod entry;
mod eviction;
mod id;
mod manager;
mod metrics;
mod paged;
mod priority;
mod table;

#[cfg(test)]
mod proptest;

pub use entry::{CacheItem, CacheValue, ItemKind};
pub use eviction::{Admission, EvictionEngine};
pub use id::{EntityKind, Id, IdArray, IdSpace, INVALID_ID};
pub use manager::{CacheConfig, CacheManager, CacheStats, TableStats};
pub use metrics::{CacheMetrics, MetricsSnapshot};
pub use paged::{
    PageKind, PageShare, PageSource, PageValue, PagedValues, DEFAULT_PAGE_BITS, EMBED_SLOT_BYTES,
};
pub use priority::{CacheItemPriority, LogicalClock};
pub use table::{Insertion, TableContext, TableValue, ValueTable};

/// Default data table budget (256MB)
pub const DEFAULT_DATA_BUDGET: u64 = 256 * 1024 * 1024;

/// Default integer and double table budget (16MB each)
pub const DEFAULT_SCALAR_BUDGET: u64 = 16 * 1024 * 1024;

/// Default string table budget (64MB)
pub const DEFAULT_STRING_BUDGET: u64 = 64 * 1024 * 1024;

/// Rebuild cost assigned to values cached directly rather than computed
pub const DEFAULT_CYCLES_PER_BYTE: f32 = 1.0;

// =============================================================================
// Tests
// =============================================================================
