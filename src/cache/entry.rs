//! Cache Entry Types
//!
//! Values stored through the cache and the data-table item wrapper.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use super::paged::PageValue;

/// Discriminant of the table an item lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ItemKind {
    Data,
    Integer,
    Double,
    String,
    Function,
    FunctionOutput,
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemKind::Data => write!(f, "data"),
            ItemKind::Integer => write!(f, "integer"),
            ItemKind::Double => write!(f, "double"),
            ItemKind::String => write!(f, "string"),
            ItemKind::Function => write!(f, "function"),
            ItemKind::FunctionOutput => write!(f, "function-output"),
        }
    }
}

/// A value that can be cached or produced by a function
#[derive(Debug, Clone, PartialEq)]
pub enum CacheValue {
    Integer(i64),
    Double(f64),
    String(Arc<str>),
    Data(Bytes),
}

impl CacheValue {
    /// Bytes charged against the owning table's budget
    pub fn memory_used(&self) -> u64 {
        match self {
            CacheValue::Integer(_) => std::mem::size_of::<i64>() as u64,
            CacheValue::Double(_) => std::mem::size_of::<f64>() as u64,
            CacheValue::String(s) => (std::mem::size_of::<Arc<str>>() + s.len()) as u64,
            CacheValue::Data(data) => (std::mem::size_of::<Bytes>() + data.len()) as u64,
        }
    }

    pub fn kind(&self) -> ItemKind {
        match self {
            CacheValue::Integer(_) => ItemKind::Integer,
            CacheValue::Double(_) => ItemKind::Double,
            CacheValue::String(_) => ItemKind::String,
            CacheValue::Data(_) => ItemKind::Data,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            CacheValue::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match self {
            CacheValue::Double(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            CacheValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_data(&self) -> Option<&Bytes> {
        match self {
            CacheValue::Data(data) => Some(data),
            _ => None,
        }
    }
}

impl From<i64> for CacheValue {
    fn from(v: i64) -> Self {
        CacheValue::Integer(v)
    }
}

impl From<f64> for CacheValue {
    fn from(v: f64) -> Self {
        CacheValue::Double(v)
    }
}

impl From<&str> for CacheValue {
    fn from(s: &str) -> Self {
        CacheValue::String(Arc::from(s))
    }
}

impl From<String> for CacheValue {
    fn from(s: String) -> Self {
        CacheValue::String(Arc::from(s))
    }
}

impl From<Bytes> for CacheValue {
    fn from(data: Bytes) -> Self {
        CacheValue::Data(data)
    }
}

// =============================================================================
// CacheItem
// =============================================================================

/// Entry of the data table
#[derive(Debug, Clone, PartialEq)]
pub struct CacheItem {
    /// Item discriminant
    kind: ItemKind,
    /// Payload
    data: Bytes,
    /// Rebuild cost normalized by size
    cycles_to_build_per_byte: f32,
}

impl CacheItem {
    /// Create a plain data item
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            kind: ItemKind::Data,
            data: data.into(),
            cycles_to_build_per_byte: 0.0,
        }
    }

    /// Create an item holding a function's output
    pub fn function_output(data: Bytes, cycles_to_build_per_byte: f32) -> Self {
        Self {
            kind: ItemKind::FunctionOutput,
            data,
            cycles_to_build_per_byte,
        }
    }

    /// Set the rebuild cost used for eviction priority
    pub fn with_build_cost(mut self, cycles_to_build_per_byte: f32) -> Self {
        self.cycles_to_build_per_byte = cycles_to_build_per_byte;
        self
    }

    #[inline]
    pub fn kind(&self) -> ItemKind {
        self.kind
    }

    #[inline]
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    #[inline]
    pub fn cycles_to_build_per_byte(&self) -> f32 {
        self.cycles_to_build_per_byte
    }

    /// Bytes charged against the data table's budget
    pub fn memory_used(&self) -> u64 {
        (std::mem::size_of::<Self>() + self.data.len()) as u64
    }
}

impl PageValue for Option<Arc<CacheItem>> {
    fn same_as(&self, other: &Self) -> bool {
        match (self, other) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
