//! Value Tables
//!
//! One table per value type. A table maps identifiers to slots of a
//! [`PagedValues`] store, optionally interns values so equal values share an
//! identifier, and consults its [`EvictionEngine`] on every admission.
//!
//! # Locking
//!
//! - `slots` (DashMap) is held while reading the store, so a lookup can never
//!   observe a slot that was recycled for another identifier
//! - `store` (RwLock) is never held while taking a `slots` lock
//! - Interning is atomic per value; eviction runs after the intern lock drops

use std::hash::Hash;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use super::entry::CacheItem;
use super::eviction::EvictionEngine;
use super::id::{EntityKind, Id, IdSpace};
use super::metrics::CacheMetrics;
use super::paged::{PageValue, PagedValues};
use super::priority::{CacheItemPriority, LogicalClock};

/// A value type that can be stored in a [`ValueTable`]
pub trait TableValue: PageValue {
    /// Interning key; equal keys share one identifier
    type Key: Eq + Hash + Send + Sync + 'static;

    /// Key for interning, `None` to never intern
    fn intern_key(&self) -> Option<Self::Key>;
}

impl TableValue for i64 {
    type Key = i64;

    fn intern_key(&self) -> Option<i64> {
        Some(*self)
    }
}

impl TableValue for f64 {
    /// Bit pattern, so `-0.0`, `0.0` and each NaN payload stay distinct
    type Key = u64;

    fn intern_key(&self) -> Option<u64> {
        Some(self.to_bits())
    }
}

impl TableValue for Option<Arc<str>> {
    type Key = Arc<str>;

    fn intern_key(&self) -> Option<Arc<str>> {
        self.clone()
    }
}

impl TableValue for Option<Arc<CacheItem>> {
    type Key = ();

    fn intern_key(&self) -> Option<()> {
        None
    }
}

/// Result of inserting into a table
#[derive(Debug, Clone, PartialEq)]
pub struct Insertion {
    /// Identifier of the stored value
    pub id: Id,
    /// Whether an existing identifier was reused for an equal value
    pub interned: bool,
    /// Identifiers evicted to make room
    pub evicted: Vec<Id>,
}

/// Shared services every table needs
#[derive(Debug, Clone)]
pub struct TableContext {
    pub ids: Arc<IdSpace>,
    pub clock: Arc<LogicalClock>,
    pub metrics: Arc<CacheMetrics>,
}

/// Identifier-addressed table of `T` values
pub struct ValueTable<T: TableValue> {
    /// Entity kind minted for this table
    kind: EntityKind,
    /// Identifier to slot index
    slots: DashMap<Id, usize>,
    /// Backing storage
    store: RwLock<PagedValues<T>>,
    /// Recycled slot indexes
    free: Mutex<Vec<usize>>,
    /// Value key to identifier
    interned: DashMap<T::Key, Id>,
    /// Eviction bookkeeping
    engine: EvictionEngine,
    ctx: TableContext,
}

impl<T: TableValue> ValueTable<T> {
    /// Create a table with the given memory budget
    pub fn new(name: &'static str, kind: EntityKind, budget: u64, ctx: TableContext) -> Self {
        Self {
            kind,
            slots: DashMap::new(),
            store: RwLock::new(PagedValues::new()),
            free: Mutex::new(Vec::new()),
            interned: DashMap::new(),
            engine: EvictionEngine::new(name, budget),
            ctx,
        }
    }

    #[inline]
    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    /// Number of live values
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Bytes charged against the budget
    pub fn memory_used(&self) -> u64 {
        self.engine.total()
    }

    /// Memory budget in bytes
    pub fn budget(&self) -> u64 {
        self.engine.budget()
    }

    /// Heap bytes held by the backing store
    pub fn store_memory(&self) -> u64 {
        self.store.read().memory_used()
    }

    /// Current priority metadata of a value
    pub fn priority_of(&self, id: Id) -> Option<CacheItemPriority> {
        self.engine.priority_of(id)
    }

    pub fn contains(&self, id: Id) -> bool {
        self.slots.contains_key(&id)
    }

    /// Store a value, reusing the identifier of an equal interned value
    pub fn insert(&self, value: T, memory_used: u64, cycles_per_byte: f32) -> Insertion {
        let id = match value.intern_key() {
            Some(key) => match self.interned.entry(key) {
                Entry::Occupied(existing) => {
                    let id = *existing.get();
                    drop(existing);
                    self.ctx.metrics.record_intern_hit();
                    self.engine.raise_cost(id, cycles_per_byte);
                    self.engine.touch(id, self.ctx.clock.tick());
                    return Insertion {
                        id,
                        interned: true,
                        evicted: Vec::new(),
                    };
                }
                Entry::Vacant(vacant) => {
                    let id = self.store_new(value);
                    vacant.insert(id);
                    id
                }
            },
            None => self.store_new(value),
        };

        let now = self.ctx.clock.tick();
        let admission = self
            .engine
            .admit(id, CacheItemPriority::new(memory_used, now, cycles_per_byte), now);
        self.ctx.metrics.record_insert();
        if admission.over_budget {
            self.ctx.metrics.record_over_budget();
        }
        if !admission.evicted.is_empty() {
            self.ctx
                .metrics
                .record_evictions(admission.evicted.len() as u64, admission.evicted_bytes);
            for victim in &admission.evicted {
                self.release(*victim);
            }
        }

        Insertion {
            id,
            interned: false,
            evicted: admission.evicted,
        }
    }

    /// Look up a value, recording the access
    pub fn get(&self, id: Id) -> Option<T> {
        let value = {
            let slot = self.slots.get(&id);
            slot.and_then(|slot| self.store.read().get(*slot).cloned())
        };
        match value {
            Some(value) => {
                self.engine.touch(id, self.ctx.clock.tick());
                self.ctx.metrics.record_hit();
                Some(value)
            }
            None => {
                self.ctx.metrics.record_miss();
                None
            }
        }
    }

    /// Record an access without reading; false if the value is gone
    pub fn touch(&self, id: Id) -> bool {
        self.slots.contains_key(&id) && self.engine.touch(id, self.ctx.clock.tick())
    }

    /// Explicitly invalidate a value
    pub fn remove(&self, id: Id) -> bool {
        if self.engine.forget(id).is_none() {
            return false;
        }
        self.release(id);
        self.ctx.metrics.record_invalidation();
        true
    }

    /// Drop every value and retire every identifier
    pub fn clear(&self) {
        let ids: Vec<Id> = self.slots.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            self.ctx.ids.retire(id);
        }
        self.slots.clear();
        self.interned.clear();
        self.engine.clear();
        self.free.lock().clear();
        self.store.write().clear();
    }

    fn store_new(&self, value: T) -> Id {
        let id = self.ctx.ids.mint(self.kind);
        let index = {
            let mut store = self.store.write();
            let index = self.free.lock().pop().unwrap_or(store.len());
            store.set(index, value);
            index
        };
        self.slots.insert(id, index);
        id
    }

    /// Remove a value already dropped from the eviction engine
    fn release(&self, id: Id) {
        let Some((_, index)) = self.slots.remove(&id) else {
            return;
        };
        // Intern lock is taken without the store lock; insert nests them the other way
        let key = self.store.read().get(index).and_then(|value| value.intern_key());
        if let Some(key) = key {
            self.interned.remove_if(&key, |_, owner| *owner == id);
        }
        {
            let mut store = self.store.write();
            store.set(index, T::default());
            self.free.lock().push(index);
        }
        self.ctx.ids.retire(id);
        debug!(kind = %self.kind, id, "Released cached value");
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> TableContext {
        TableContext {
            ids: Arc::new(IdSpace::new()),
            clock: Arc::new(LogicalClock::new()),
            metrics: Arc::new(CacheMetrics::new()),
        }
    }

    fn integers(budget: u64) -> ValueTable<i64> {
        ValueTable::new("integers", EntityKind::Integer, budget, context())
    }

    #[test]
    fn test_insert_and_get() {
        let table = integers(1024);
        let a = table.insert(10, 8, 1.0);
        let b = table.insert(20, 8, 1.0);

        assert_ne!(a.id, b.id);
        assert_eq!(table.get(a.id), Some(10));
        assert_eq!(table.get(b.id), Some(20));
        assert_eq!(table.len(), 2);
        assert_eq!(table.memory_used(), 16);
    }

    #[test]
    fn test_interning_shares_id() {
        let table = integers(1024);
        let a = table.insert(5, 8, 1.0);
        let b = table.insert(5, 8, 1.0);

        assert!(!a.interned);
        assert!(b.interned);
        assert_eq!(a.id, b.id);
        assert_eq!(table.len(), 1);
        assert_eq!(table.memory_used(), 8);
    }

    #[test]
    fn test_double_interning_by_bits() {
        let table: ValueTable<f64> = ValueTable::new("doubles", EntityKind::Double, 1024, context());
        let pos = table.insert(0.0, 8, 1.0);
        let neg = table.insert(-0.0, 8, 1.0);
        let nan_a = table.insert(f64::NAN, 8, 1.0);
        let nan_b = table.insert(f64::NAN, 8, 1.0);

        assert_ne!(pos.id, neg.id);
        assert_eq!(nan_a.id, nan_b.id);
        assert!(table.get(nan_a.id).unwrap().is_nan());
    }

    #[test]
    fn test_string_table() {
        let table: ValueTable<Option<Arc<str>>> =
            ValueTable::new("strings", EntityKind::String, 1024, context());
        let a = table.insert(Some(Arc::from("hello")), 21, 1.0);
        let b = table.insert(Some(Arc::from("hello")), 21, 1.0);
        assert_eq!(a.id, b.id);
        assert_eq!(table.get(a.id).flatten().as_deref(), Some("hello"));
    }

    #[test]
    fn test_unknown_id_is_absent() {
        let table = integers(1024);
        assert_eq!(table.get(12345), None);
        assert_eq!(table.get(crate::cache::INVALID_ID), None);
    }

    #[test]
    fn test_eviction_releases_slot_and_id() {
        let ctx = context();
        let table = ValueTable::<i64>::new("integers", EntityKind::Integer, 16, ctx.clone());
        let a = table.insert(1, 8, 1.0);
        let b = table.insert(2, 8, 1.0);
        let c = table.insert(3, 8, 1.0);

        assert_eq!(c.evicted, vec![a.id]);
        assert_eq!(table.get(a.id), None);
        assert_eq!(ctx.ids.kind_of(a.id), None);
        assert_eq!(table.get(b.id), Some(2));
        assert_eq!(table.get(c.id), Some(3));

        // Evicted value is no longer interned; a re-insert gets a fresh id
        let again = table.insert(1, 8, 1.0);
        assert!(!again.interned);
        assert_ne!(again.id, a.id);
        assert_eq!(table.get(again.id), Some(1));
    }

    #[test]
    fn test_slots_are_recycled() {
        let table = integers(16);
        for value in 0..100 {
            table.insert(value, 8, 1.0);
        }
        assert_eq!(table.len(), 2);
        assert!(table.store.read().len() <= 3);
    }

    #[test]
    fn test_touch_refreshes_priority() {
        let table = integers(1024);
        let a = table.insert(1, 8, 1.0);
        let before = table.priority_of(a.id).unwrap().last_accessed_timestamp;
        assert!(table.touch(a.id));
        assert!(table.priority_of(a.id).unwrap().last_accessed_timestamp > before);
        assert!(!table.touch(a.id + 1000));
    }

    #[test]
    fn test_remove() {
        let table = integers(1024);
        let a = table.insert(7, 8, 1.0);
        assert!(table.remove(a.id));
        assert!(!table.remove(a.id));
        assert_eq!(table.get(a.id), None);
        assert_eq!(table.memory_used(), 0);
    }

    #[test]
    fn test_clear_retires_ids() {
        let ctx = context();
        let table = ValueTable::<i64>::new("integers", EntityKind::Integer, 1024, ctx.clone());
        let a = table.insert(7, 8, 1.0);
        table.clear();
        assert!(table.is_empty());
        assert_eq!(ctx.ids.kind_of(a.id), None);
    }

    #[test]
    fn test_data_table_never_interns() {
        let table: ValueTable<Option<Arc<CacheItem>>> =
            ValueTable::new("data", EntityKind::Data, 1024, context());
        let item = Arc::new(CacheItem::new(bytes::Bytes::from_static(b"x")));
        let a = table.insert(Some(item.clone()), 10, 1.0);
        let b = table.insert(Some(item), 10, 1.0);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_concurrent_inserts_and_reads() {
        let table = Arc::new(integers(1 << 20));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let table = table.clone();
                std::thread::spawn(move || {
                    for i in 0..500i64 {
                        let value = t * 1000 + i;
                        let inserted = table.insert(value, 8, 1.0);
                        assert_eq!(table.get(inserted.id), Some(value));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(table.len(), 2000);
    }
}
