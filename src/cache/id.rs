//! Identifier Space
//!
//! Every entity the service hands out (cached values, functions, tasks) is
//! addressed by an opaque 64-bit [`Id`]. Identifiers come from one monotonic
//! counter, so a retired identifier is never handed out again; a holder of a
//! retired identifier sees "not found" rather than somebody else's value.

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

/// Opaque handle to a cached entity
pub type Id = u64;

/// Sentinel meaning "invalid / absent"
pub const INVALID_ID: Id = !0u64;

/// Table an identifier currently belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum EntityKind {
    /// Raw data blob (including non-scalar function outputs)
    Data,
    /// 64-bit integer
    Integer,
    /// Double
    Double,
    /// String
    String,
    /// Function descriptor
    Function,
    /// In-flight or completed task
    Task,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Data => write!(f, "data"),
            EntityKind::Integer => write!(f, "integer"),
            EntityKind::Double => write!(f, "double"),
            EntityKind::String => write!(f, "string"),
            EntityKind::Function => write!(f, "function"),
            EntityKind::Task => write!(f, "task"),
        }
    }
}

// =============================================================================
// IdArray
// =============================================================================

/// Immutable, ordered sequence of identifiers
///
/// Equality and hashing are structural: same length, same elements, same
/// order. Cloning is a reference-count bump.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct IdArray(Arc<[Id]>);

impl IdArray {
    /// Create an array from any sequence of identifiers
    pub fn new(ids: impl Into<Arc<[Id]>>) -> Self {
        Self(ids.into())
    }

    /// Check whether any element is the invalid sentinel
    pub fn contains_invalid(&self) -> bool {
        self.0.contains(&INVALID_ID)
    }

    pub fn as_slice(&self) -> &[Id] {
        &self.0
    }
}

impl Default for IdArray {
    fn default() -> Self {
        Self(Arc::from(Vec::new()))
    }
}

impl Deref for IdArray {
    type Target = [Id];

    fn deref(&self) -> &[Id] {
        &self.0
    }
}

impl From<Vec<Id>> for IdArray {
    fn from(ids: Vec<Id>) -> Self {
        Self(ids.into())
    }
}

impl From<&[Id]> for IdArray {
    fn from(ids: &[Id]) -> Self {
        Self(ids.into())
    }
}

impl<const N: usize> From<[Id; N]> for IdArray {
    fn from(ids: [Id; N]) -> Self {
        Self(Arc::new(ids))
    }
}

impl fmt::Debug for IdArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.0.iter()).finish()
    }
}

// =============================================================================
// IdSpace
// =============================================================================

/// Allocator and registry for identifiers
///
/// Records which table each live identifier belongs to, so an identifier is
/// a key into exactly one table at a time.
#[derive(Debug, Default)]
pub struct IdSpace {
    /// Next identifier to mint
    next: AtomicU64,
    /// Live identifiers and their owning table
    kinds: DashMap<Id, EntityKind>,
}

impl IdSpace {
    /// Create an empty identifier space
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a fresh identifier owned by `kind`
    pub fn mint(&self, kind: EntityKind) -> Id {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        assert!(id != INVALID_ID, "identifier space exhausted");
        self.kinds.insert(id, kind);
        id
    }

    /// Table a live identifier belongs to
    pub fn kind_of(&self, id: Id) -> Option<EntityKind> {
        if id == INVALID_ID {
            return None;
        }
        self.kinds.get(&id).map(|k| *k)
    }

    /// Check that `id` is live and owned by `kind`
    pub fn is(&self, id: Id, kind: EntityKind) -> bool {
        self.kind_of(id) == Some(kind)
    }

    /// Retire an identifier, returning the table it belonged to
    pub fn retire(&self, id: Id) -> Option<EntityKind> {
        self.kinds.remove(&id).map(|(_, kind)| kind)
    }

    /// Whether `id` was ever minted by this space
    pub fn was_minted(&self, id: Id) -> bool {
        id != INVALID_ID && id < self.next.load(Ordering::Relaxed)
    }

    /// Number of live identifiers
    pub fn live_count(&self) -> usize {
        self.kinds.len()
    }

    /// Number of identifiers ever minted
    pub fn minted_count(&self) -> u64 {
        self.next.load(Ordering::Relaxed)
    }

    /// Retire every identifier
    pub fn clear(&self) {
        self.kinds.clear();
    }
}

// =============================================================================
// Tests
// =============================================================================
