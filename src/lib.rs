//! NEData - Identifier-Addressed Cache and Memoizing Task Scheduler
//!
//! An in-process cache that hands out opaque 64-bit identifiers for immutable
//! values, memoizes function execution keyed by function and input
//! identifiers, and coordinates asynchronous tasks through an explicit
//! dependency graph.
//!
//! # Architecture
//!
//! ```text
//! caller ──run_function──▶ Scheduler ──miss──▶ Task ──▶ Workers
//!    ▲                        │ hit                        │
//!    │                        ▼                            ▼
//!    └──retrieve_task_output── Value Tables ◀── output ── completion
//!                              (PagedValues + EvictionEngine)
//! ```
//!
//! # Example
//!
//! ```
//! use nedata::{CacheManager, FunctionData, Outcome, RunOutcome, INVALID_ID};
//!
//! let cache = CacheManager::inline();
//! let add = cache.add_function(
//!     FunctionData::new("add", |ctx| Ok(Outcome::value(ctx.integer(0)? + ctx.integer(1)?)))
//!         .with_arity(2),
//! );
//! let inputs = [cache.cache_integer(2), cache.cache_integer(3)];
//!
//! let task = cache.run_function(add, inputs).unwrap().id();
//! assert_eq!(cache.retrieve_task_output(task), INVALID_ID);
//! cache.run_until_idle();
//!
//! let sum = cache.retrieve_task_output(task);
//! assert_eq!(cache.lookup_cache_integer(sum), Some(5));
//! assert_eq!(cache.run_function(add, inputs).unwrap(), RunOutcome::Cached(sum));
//! ```
//!
//! # Modules
//!
//! - [`cache`] - Identifiers, paged storage, eviction and the cache service
//! - [`scheduler`] - Function memoization and the task dependency graph
//! - [`error`] - Error types

pub mod cache;
pub mod error;
pub mod scheduler;

// Re-export commonly used types
pub use cache::{
    CacheConfig, CacheItem, CacheManager, CacheStats, CacheValue, EntityKind, Id, IdArray,
    ItemKind, PagedValues, INVALID_ID,
};
pub use error::{Error, Result};
pub use scheduler::{FunctionContext, FunctionData, FunctionState, Outcome, RunOutcome, TaskState};
