//! Function Memoization Table
//!
//! Maps (function, inputs) to either the task computing it or the cached
//! output. At most one task per key is ever in flight. Completed keys are
//! indexed under their output and every input, so evicting any of those
//! values drops the key.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::cache::{Id, IdArray};

/// Memoization key: function identity plus ordered input identities
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MemoKey {
    pub function: Id,
    pub inputs: IdArray,
}

impl MemoKey {
    pub fn new(function: Id, inputs: IdArray) -> Self {
        Self { function, inputs }
    }
}

/// What a key currently maps to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoEntry {
    /// Task computing the output
    Pending(Id),
    /// Cached output
    Done(Id),
}

/// Result of resolving a key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoLookup {
    /// Output is cached
    Cached(Id),
    /// Joined a task already in flight
    Joined(Id),
    /// Created a new task
    Created(Id),
}

/// Memoization table with a reverse index from values to keys
#[derive(Debug, Default)]
pub struct MemoTable {
    entries: DashMap<MemoKey, MemoEntry>,
    by_value: DashMap<Id, Vec<MemoKey>>,
}

impl MemoTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &MemoKey) -> Option<MemoEntry> {
        self.entries.get(key).map(|entry| *entry)
    }

    /// Resolve a key atomically with respect to other resolutions of it
    ///
    /// `is_live` decides whether a cached output still exists, `join` is
    /// called with an in-flight task and `create` makes a new task. All three
    /// run under the key's lock and must not touch this table.
    pub fn resolve(
        &self,
        key: MemoKey,
        is_live: impl FnOnce(Id) -> bool,
        join: impl FnOnce(Id),
        create: impl FnOnce(&MemoKey) -> Id,
    ) -> MemoLookup {
        match self.entries.entry(key) {
            Entry::Occupied(mut occupied) => match *occupied.get() {
                MemoEntry::Done(output) if is_live(output) => MemoLookup::Cached(output),
                MemoEntry::Pending(task) => {
                    join(task);
                    MemoLookup::Joined(task)
                }
                MemoEntry::Done(_) => {
                    let task = create(occupied.key());
                    occupied.insert(MemoEntry::Pending(task));
                    MemoLookup::Created(task)
                }
            },
            Entry::Vacant(vacant) => {
                let task = create(vacant.key());
                vacant.insert(MemoEntry::Pending(task));
                MemoLookup::Created(task)
            }
        }
    }

    /// Point a key at its computed output
    pub fn complete(&self, key: &MemoKey, output: Id) {
        self.entries.insert(key.clone(), MemoEntry::Done(output));
        for id in Self::referenced(key, output) {
            let mut keys = self.by_value.entry(id).or_default();
            if !keys.contains(key) {
                keys.push(key.clone());
            }
        }
    }

    /// Drop a key whose task failed, so a later run retries
    pub fn abandon(&self, key: &MemoKey, task: Id) {
        self.entries
            .remove_if(key, |_, entry| *entry == MemoEntry::Pending(task));
    }

    /// Drop every completed key whose output or one of whose inputs is `id`
    pub fn forget_value(&self, id: Id) -> usize {
        let Some((_, keys)) = self.by_value.remove(&id) else {
            return 0;
        };
        let mut forgotten = 0;
        for key in keys {
            let removed = self.entries.remove_if(&key, |key, entry| match *entry {
                MemoEntry::Done(output) => output == id || key.inputs.contains(&id),
                MemoEntry::Pending(_) => false,
            });
            let Some((key, MemoEntry::Done(output))) = removed else {
                continue;
            };
            forgotten += 1;
            for other in Self::referenced(&key, output) {
                if other != id {
                    self.unindex(other, &key);
                }
            }
        }
        forgotten
    }

    pub fn clear(&self) {
        self.entries.clear();
        self.by_value.clear();
    }

    /// Distinct value ids a completed key depends on
    fn referenced(key: &MemoKey, output: Id) -> Vec<Id> {
        let mut ids = Vec::with_capacity(key.inputs.len() + 1);
        for &id in key.inputs.iter().chain(std::iter::once(&output)) {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        ids
    }

    fn unindex(&self, id: Id, key: &MemoKey) {
        if let Some(mut keys) = self.by_value.get_mut(&id) {
            keys.retain(|indexed| indexed != key);
        }
        self.by_value.remove_if(&id, |_, keys| keys.is_empty());
    }

    #[cfg(test)]
    fn indexed_values(&self) -> usize {
        self.by_value.len()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn key(function: Id, inputs: &[Id]) -> MemoKey {
        MemoKey::new(function, IdArray::from(inputs))
    }

    #[test]
    fn test_key_equality_is_structural() {
        assert_eq!(key(1, &[2, 3]), key(1, &[2, 3]));
        assert_ne!(key(1, &[2, 3]), key(1, &[3, 2]));
        assert_ne!(key(1, &[2, 3]), key(2, &[2, 3]));
        assert_ne!(key(1, &[2, 3]), key(1, &[2, 3, 4]));
    }

    #[test]
    fn test_resolve_creates_then_joins() {
        let memo = MemoTable::new();
        let created = memo.resolve(key(1, &[2]), |_| true, |_| panic!("no task yet"), |_| 100);
        assert_eq!(created, MemoLookup::Created(100));

        let joined_with = Cell::new(None);
        let joined = memo.resolve(
            key(1, &[2]),
            |_| true,
            |task| joined_with.set(Some(task)),
            |_| panic!("must not create twice"),
        );
        assert_eq!(joined, MemoLookup::Joined(100));
        assert_eq!(joined_with.get(), Some(100));
    }

    #[test]
    fn test_resolve_cached_output() {
        let memo = MemoTable::new();
        memo.resolve(key(1, &[2]), |_| true, |_| {}, |_| 100);
        memo.complete(&key(1, &[2]), 500);

        let hit = memo.resolve(key(1, &[2]), |id| id == 500, |_| {}, |_| panic!("cached"));
        assert_eq!(hit, MemoLookup::Cached(500));
    }

    #[test]
    fn test_resolve_stale_output_recomputes() {
        let memo = MemoTable::new();
        memo.resolve(key(1, &[2]), |_| true, |_| {}, |_| 100);
        memo.complete(&key(1, &[2]), 500);

        let rerun = memo.resolve(key(1, &[2]), |_| false, |_| {}, |_| 101);
        assert_eq!(rerun, MemoLookup::Created(101));
        assert_eq!(memo.get(&key(1, &[2])), Some(MemoEntry::Pending(101)));
    }

    #[test]
    fn test_abandon_only_matching_task() {
        let memo = MemoTable::new();
        memo.resolve(key(1, &[]), |_| true, |_| {}, |_| 100);

        memo.abandon(&key(1, &[]), 999);
        assert!(memo.get(&key(1, &[])).is_some());

        memo.abandon(&key(1, &[]), 100);
        assert!(memo.get(&key(1, &[])).is_none());
    }

    #[test]
    fn test_forget_output() {
        let memo = MemoTable::new();
        memo.complete(&key(1, &[2]), 500);
        memo.complete(&key(3, &[4]), 500);
        memo.complete(&key(5, &[6]), 600);

        assert_eq!(memo.forget_value(500), 2);
        assert_eq!(memo.forget_value(500), 0);
        assert_eq!(memo.len(), 1);
        // Only the surviving key's input and output stay indexed
        assert_eq!(memo.indexed_values(), 2);
    }

    #[test]
    fn test_forget_input() {
        let memo = MemoTable::new();
        memo.complete(&key(1, &[2, 2, 3]), 500);
        memo.complete(&key(1, &[4]), 600);

        assert_eq!(memo.forget_value(2), 1);
        assert_eq!(memo.get(&key(1, &[2, 2, 3])), None);
        assert_eq!(memo.get(&key(1, &[4])), Some(MemoEntry::Done(600)));
        assert_eq!(memo.forget_value(3), 0);
        assert_eq!(memo.forget_value(500), 0);
        assert_eq!(memo.indexed_values(), 2);
    }

    #[test]
    fn test_forget_keeps_pending_recompute() {
        let memo = MemoTable::new();
        memo.complete(&key(1, &[2]), 500);
        // Output went stale and a new task took the key over
        memo.resolve(key(1, &[2]), |_| false, |_| {}, |_| 101);

        assert_eq!(memo.forget_value(2), 0);
        assert_eq!(memo.get(&key(1, &[2])), Some(MemoEntry::Pending(101)));
    }

    #[test]
    fn test_recompleting_does_not_duplicate_index() {
        let memo = MemoTable::new();
        memo.complete(&key(1, &[2]), 500);
        memo.complete(&key(1, &[2]), 500);

        assert_eq!(memo.forget_value(2), 1);
        assert_eq!(memo.indexed_values(), 0);
    }
}
