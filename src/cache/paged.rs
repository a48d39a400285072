//! Paged Value Store
//!
//! Stores an arbitrary number of values of one type with O(1) indexed access.
//! Values live in fixed-size pages of `2^PAGE_BITS` slots; index `i` lives in
//! page `i >> PAGE_BITS` at offset `i & (PAGE_SIZE - 1)`.
//!
//! # Page representations
//!
//! ```text
//! ┌──────────────┬──────────────────────────────────────────────────────┐
//! │ Vacant       │ never written, reads as T::default()                 │
//! │ Owned        │ Box<[T]>, exclusively owned                          │
//! │ Shared       │ Arc<[T]>, shared with other stores / handles         │
//! │ Uniform      │ single T stored inline in the page table             │
//! │ SharedUniform│ single heap T behind an Arc (T too big to embed)     │
//! └──────────────┴──────────────────────────────────────────────────────┘
//! ```
//!
//! Writing into a Shared or Uniform page copies it into an Owned page first.
//! Shared storage is freed when the last `Arc` goes away.

use std::mem::{align_of, size_of};
use std::ops::Index;
use std::sync::Arc;

use crate::error::{Error, Result};

/// Default number of index bits per page (1024 values)
pub const DEFAULT_PAGE_BITS: u32 = 10;

/// Bytes available for an inline uniform value in a page-table slot
pub const EMBED_SLOT_BYTES: usize = 2 * size_of::<usize>();

/// A type that can live in a [`PagedValues`] store
pub trait PageValue: Clone + Default + Send + Sync + 'static {
    /// Whether a uniform page may keep its value inline in the page table.
    ///
    /// Types that don't fit fall back to a single shared heap value.
    const EMBED_UNIFORM: bool = size_of::<Self>() + align_of::<Self>() <= EMBED_SLOT_BYTES;

    /// Whether two values are interchangeable for uniform-page detection
    fn same_as(&self, other: &Self) -> bool;
}

macro_rules! impl_page_value_eq {
    ($($t:ty),*) => {
        $(impl PageValue for $t {
            #[inline]
            fn same_as(&self, other: &Self) -> bool {
                self == other
            }
        })*
    };
}

impl_page_value_eq!(u8, u16, u32, u64, usize, i8, i16, i32, i64, isize, bool);

impl PageValue for f32 {
    #[inline]
    fn same_as(&self, other: &Self) -> bool {
        self.to_bits() == other.to_bits()
    }
}

impl PageValue for f64 {
    #[inline]
    fn same_as(&self, other: &Self) -> bool {
        self.to_bits() == other.to_bits()
    }
}

impl PageValue for Option<Arc<str>> {
    fn same_as(&self, other: &Self) -> bool {
        match (self, other) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b) || a == b,
            (None, None) => true,
            _ => false,
        }
    }
}

/// Contents for a whole-page write
#[derive(Debug, Clone)]
pub enum PageSource<T> {
    /// Every slot holds this value
    Uniform(T),
    /// Slot values in order; missing trailing slots are `T::default()`
    Values(Vec<T>),
}

/// Observable representation of a page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    Vacant,
    Owned,
    Shared,
    Uniform,
    SharedUniform,
}

enum Page<T> {
    Vacant,
    Owned(Box<[T]>),
    Shared(Arc<[T]>),
    Uniform(T),
    SharedUniform(Arc<T>),
}

/// Handle to a shared page
///
/// Holding a handle keeps the page's storage alive; dropping the last
/// handle (and the last store referencing it) frees it.
#[derive(Debug, Clone)]
pub enum PageShare<T> {
    /// Full page of values
    Page(Arc<[T]>),
    /// Uniform value small enough to copy around inline
    Inline(T),
    /// Uniform value on the heap
    Heap(Arc<T>),
}

impl<T> PageShare<T> {
    /// Value at `offset` within the shared page
    pub fn get(&self, offset: usize) -> &T {
        match self {
            PageShare::Page(values) => &values[offset],
            PageShare::Inline(value) => value,
            PageShare::Heap(value) => value.as_ref(),
        }
    }

    /// Number of owners of the backing allocation (1 for inline values)
    pub fn strong_count(&self) -> usize {
        match self {
            PageShare::Page(values) => Arc::strong_count(values),
            PageShare::Inline(_) => 1,
            PageShare::Heap(value) => Arc::strong_count(value),
        }
    }
}

// =============================================================================
// PagedValues
// =============================================================================

/// Paged, optionally uniform-compressed and shared, store of `T` values
///
/// `UNIFORM` and `SHARING` statically enable the two page optimizations.
pub struct PagedValues<T, const PAGE_BITS: u32 = 10, const UNIFORM: bool = true, const SHARING: bool = true>
{
    pages: Vec<Page<T>>,
    len: usize,
    /// Value read from vacant pages
    fill: T,
}

impl<T: PageValue, const PAGE_BITS: u32, const UNIFORM: bool, const SHARING: bool> Default
    for PagedValues<T, PAGE_BITS, UNIFORM, SHARING>
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T: PageValue, const PAGE_BITS: u32, const UNIFORM: bool, const SHARING: bool>
    PagedValues<T, PAGE_BITS, UNIFORM, SHARING>
{
    /// Values per page
    pub const PAGE_SIZE: usize = 1usize << PAGE_BITS;

    /// Mask selecting the in-page offset
    pub const PAGE_INDEX_MASK: usize = Self::PAGE_SIZE - 1;

    /// Create an empty store
    pub fn new() -> Self {
        Self {
            pages: Vec::new(),
            len: 0,
            fill: T::default(),
        }
    }

    /// Create a store of `len` default values without allocating pages
    pub fn with_len(len: usize) -> Self {
        let mut store = Self::new();
        store.resize(len);
        store
    }

    /// Number of values
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of page-table entries
    #[inline]
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Page holding `index`
    #[inline]
    pub fn page_of(index: usize) -> usize {
        index >> PAGE_BITS
    }

    /// Representation of a page, `None` past the page table
    pub fn page_kind(&self, page_index: usize) -> Option<PageKind> {
        self.pages.get(page_index).map(|page| match page {
            Page::Vacant => PageKind::Vacant,
            Page::Owned(_) => PageKind::Owned,
            Page::Shared(_) => PageKind::Shared,
            Page::Uniform(_) => PageKind::Uniform,
            Page::SharedUniform(_) => PageKind::SharedUniform,
        })
    }

    /// Value at `index`
    pub fn get(&self, index: usize) -> Option<&T> {
        if index >= self.len {
            return None;
        }
        let offset = index & Self::PAGE_INDEX_MASK;
        Some(match &self.pages[index >> PAGE_BITS] {
            Page::Vacant => &self.fill,
            Page::Owned(values) => &values[offset],
            Page::Shared(values) => &values[offset],
            Page::Uniform(value) => value,
            Page::SharedUniform(value) => value.as_ref(),
        })
    }

    /// Iterate over all values in index order
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        (0..self.len).filter_map(move |i| self.get(i))
    }

    /// Grow or shrink to `len` values
    ///
    /// New slots read as `T::default()`. Shrinking resets the tail of the
    /// last kept page so a later grow doesn't resurrect old values.
    pub fn resize(&mut self, len: usize) {
        let page_count = (len + Self::PAGE_INDEX_MASK) >> PAGE_BITS;
        if len < self.len {
            self.pages.truncate(page_count);
            let tail = len & Self::PAGE_INDEX_MASK;
            if tail != 0 && self.page_kind(page_count - 1) != Some(PageKind::Vacant) {
                let last = self.make_owned(page_count - 1);
                for slot in &mut last[tail..] {
                    *slot = T::default();
                }
            }
        } else {
            while self.pages.len() < page_count {
                self.pages.push(Page::Vacant);
            }
        }
        self.len = len;
    }

    /// Append a value, returning its index
    pub fn push(&mut self, value: T) -> usize {
        let index = self.len;
        self.set(index, value);
        index
    }

    /// Write one value, growing the store if needed
    pub fn set(&mut self, index: usize, value: T) {
        if index >= self.len {
            self.resize(index + 1);
        }
        let page_index = index >> PAGE_BITS;
        let unchanged = match &self.pages[page_index] {
            Page::Uniform(current) => current.same_as(&value),
            Page::SharedUniform(current) => current.same_as(&value),
            Page::Vacant => self.fill.same_as(&value),
            _ => false,
        };
        if unchanged {
            return;
        }
        self.make_owned(page_index)[index & Self::PAGE_INDEX_MASK] = value;
    }

    /// Write a whole page
    ///
    /// A source whose every slot is the same value is stored as a uniform
    /// page when `UNIFORM` is enabled, skipping the page allocation.
    pub fn write_page(&mut self, page_index: usize, source: PageSource<T>) {
        self.cover_page(page_index);

        let uniform = match source {
            PageSource::Uniform(value) => Ok(value),
            PageSource::Values(values) => {
                debug_assert!(values.len() <= Self::PAGE_SIZE, "page source too long");
                let all_same = values.len() == Self::PAGE_SIZE
                    && values.iter().all(|v| v.same_as(&values[0]));
                if UNIFORM && all_same {
                    Ok(values.into_iter().next().unwrap_or_default())
                } else {
                    Err(values)
                }
            }
        };

        self.pages[page_index] = match uniform {
            Ok(value) if UNIFORM => Self::uniform_page(value),
            Ok(value) => Page::Owned(vec![value; Self::PAGE_SIZE].into_boxed_slice()),
            Err(mut values) => {
                values.resize(Self::PAGE_SIZE, T::default());
                Page::Owned(values.into_boxed_slice())
            }
        };
    }

    /// Share a page, converting it to shared storage if necessary
    pub fn share(&mut self, page_index: usize) -> Result<PageShare<T>> {
        if !SHARING {
            return Err(Error::SharingDisabled);
        }
        let pages = self.pages.len();
        let page = self
            .pages
            .get_mut(page_index)
            .ok_or(Error::PageOutOfRange { page: page_index, pages })?;

        let share = match std::mem::replace(page, Page::Vacant) {
            Page::Vacant => {
                *page = Page::Vacant;
                return Ok(Self::share_uniform(T::default()));
            }
            Page::Owned(values) => {
                let shared: Arc<[T]> = Arc::from(values);
                *page = Page::Shared(shared.clone());
                PageShare::Page(shared)
            }
            Page::Shared(values) => {
                *page = Page::Shared(values.clone());
                PageShare::Page(values)
            }
            Page::Uniform(value) => {
                let share = Self::share_uniform(value.clone());
                *page = Page::Uniform(value);
                share
            }
            Page::SharedUniform(value) => {
                *page = Page::SharedUniform(value.clone());
                PageShare::Heap(value)
            }
        };
        Ok(share)
    }

    /// Install a page shared from another store
    pub fn adopt_shared(&mut self, page_index: usize, share: PageShare<T>) -> Result<()> {
        if !SHARING {
            return Err(Error::SharingDisabled);
        }
        self.cover_page(page_index);
        self.pages[page_index] = match share {
            PageShare::Page(values) => Page::Shared(values),
            PageShare::Inline(value) => Self::uniform_page(value),
            PageShare::Heap(value) if UNIFORM => Page::SharedUniform(value),
            PageShare::Heap(value) => {
                Page::Owned(vec![(*value).clone(); Self::PAGE_SIZE].into_boxed_slice())
            }
        };
        Ok(())
    }

    /// Approximate heap bytes held by this store
    pub fn memory_used(&self) -> u64 {
        let page_bytes = (Self::PAGE_SIZE * size_of::<T>()) as u64;
        let table = (self.pages.capacity() * size_of::<Page<T>>()) as u64;
        table
            + self
                .pages
                .iter()
                .map(|page| match page {
                    Page::Owned(_) | Page::Shared(_) => page_bytes,
                    Page::SharedUniform(_) => size_of::<T>() as u64,
                    Page::Vacant | Page::Uniform(_) => 0,
                })
                .sum::<u64>()
    }

    /// Drop every page
    pub fn clear(&mut self) {
        self.pages.clear();
        self.len = 0;
    }

    fn uniform_page(value: T) -> Page<T> {
        if T::EMBED_UNIFORM {
            Page::Uniform(value)
        } else {
            Page::SharedUniform(Arc::new(value))
        }
    }

    fn share_uniform(value: T) -> PageShare<T> {
        if T::EMBED_UNIFORM {
            PageShare::Inline(value)
        } else {
            PageShare::Heap(Arc::new(value))
        }
    }

    /// Extend `len` so `page_index` is fully addressable
    fn cover_page(&mut self, page_index: usize) {
        let end = (page_index + 1) << PAGE_BITS;
        if end > self.len {
            self.resize(end);
        }
    }

    /// Copy-on-write: turn any page representation into an Owned page
    fn make_owned(&mut self, page_index: usize) -> &mut [T] {
        let page = &mut self.pages[page_index];
        let values: Box<[T]> = match std::mem::replace(page, Page::Vacant) {
            Page::Vacant => vec![T::default(); Self::PAGE_SIZE].into_boxed_slice(),
            Page::Owned(values) => values,
            Page::Shared(values) => values.iter().cloned().collect(),
            Page::Uniform(value) => vec![value; Self::PAGE_SIZE].into_boxed_slice(),
            Page::SharedUniform(value) => vec![(*value).clone(); Self::PAGE_SIZE].into_boxed_slice(),
        };
        *page = Page::Owned(values);
        match page {
            Page::Owned(values) => &mut values[..],
            _ => unreachable!("page was just made owned"),
        }
    }
}

impl<T: PageValue, const PAGE_BITS: u32, const UNIFORM: bool, const SHARING: bool> Index<usize>
    for PagedValues<T, PAGE_BITS, UNIFORM, SHARING>
{
    type Output = T;

    fn index(&self, index: usize) -> &T {
        match self.get(index) {
            Some(value) => value,
            None => panic!("index {} out of range for store of {} values", index, self.len),
        }
    }
}

impl<T: PageValue + std::fmt::Debug, const PAGE_BITS: u32, const UNIFORM: bool, const SHARING: bool>
    std::fmt::Debug for PagedValues<T, PAGE_BITS, UNIFORM, SHARING>
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PagedValues")
            .field("len", &self.len)
            .field("pages", &self.pages.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type Small<T> = PagedValues<T, 2>;

    /// Counts drops of every value carrying the same counter
    #[derive(Clone, Default)]
    struct Tracked(Option<Arc<AtomicUsize>>);

    impl Drop for Tracked {
        fn drop(&mut self) {
            if let Some(drops) = &self.0 {
                drops.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    impl PageValue for Tracked {
        fn same_as(&self, _other: &Self) -> bool {
            false
        }
    }

    #[derive(Clone, Default, Debug, PartialEq)]
    struct Wide([u64; 4]);

    impl PageValue for Wide {
        fn same_as(&self, other: &Self) -> bool {
            self == other
        }
    }

    fn tracked_page(drops: &Arc<AtomicUsize>, n: usize) -> Vec<Tracked> {
        (0..n).map(|_| Tracked(Some(drops.clone()))).collect()
    }

    #[test]
    fn test_page_addressing() {
        assert_eq!(Small::<i64>::PAGE_SIZE, 4);
        assert_eq!(Small::<i64>::PAGE_INDEX_MASK, 3);
        assert_eq!(Small::<i64>::page_of(5), 1);
        assert_eq!(PagedValues::<i64>::PAGE_SIZE, 1024);
    }

    #[test]
    fn test_embed_predicate() {
        assert!(i64::EMBED_UNIFORM);
        assert!(f64::EMBED_UNIFORM);
        assert!(u8::EMBED_UNIFORM);
        assert!(!Wide::EMBED_UNIFORM);
        assert!(!<Option<Arc<str>>>::EMBED_UNIFORM);
    }

    #[test]
    fn test_set_get_and_vacant_reads() {
        let mut store = Small::<i64>::with_len(10);
        assert_eq!(store.page_count(), 3);
        assert_eq!(store.page_kind(0), Some(PageKind::Vacant));
        assert_eq!(store[7], 0);

        store.set(5, 42);
        assert_eq!(store[5], 42);
        assert_eq!(store.page_kind(1), Some(PageKind::Owned));
        assert_eq!(store.page_kind(0), Some(PageKind::Vacant));
        assert_eq!(store.get(10), None);
    }

    #[test]
    fn test_set_default_into_vacant_does_not_allocate() {
        let mut store = Small::<i64>::with_len(4);
        store.set(1, 0);
        assert_eq!(store.page_kind(0), Some(PageKind::Vacant));
    }

    #[test]
    fn test_push_grows_lazily() {
        let mut store = Small::<u32>::new();
        for i in 0..9 {
            assert_eq!(store.push(i * 10), i as usize);
        }
        assert_eq!(store.len(), 9);
        assert_eq!(store.page_count(), 3);
        assert_eq!(store.iter().copied().collect::<Vec<_>>(), vec![0, 10, 20, 30, 40, 50, 60, 70, 80]);
    }

    #[test]
    fn test_uniform_page_equivalence() {
        let mut uniform = Small::<f64>::new();
        uniform.write_page(0, PageSource::Uniform(2.5));

        let mut ordinary = PagedValues::<f64, 2, false, true>::new();
        ordinary.write_page(0, PageSource::Uniform(2.5));

        assert_eq!(uniform.page_kind(0), Some(PageKind::Uniform));
        assert_eq!(ordinary.page_kind(0), Some(PageKind::Owned));
        for i in 0..4 {
            assert_eq!(uniform[i], 2.5);
            assert_eq!(uniform[i], ordinary[i]);
        }
    }

    #[test]
    fn test_uniform_detected_from_values() {
        let mut store = Small::<i32>::new();
        store.write_page(0, PageSource::Values(vec![7, 7, 7, 7]));
        assert_eq!(store.page_kind(0), Some(PageKind::Uniform));
        assert_eq!(store.memory_used(), (store.pages.capacity() * size_of::<Page<i32>>()) as u64);

        store.write_page(1, PageSource::Values(vec![7, 7, 8, 7]));
        assert_eq!(store.page_kind(1), Some(PageKind::Owned));
        assert_eq!(store[6], 8);

        // Short sources pad with defaults and are never uniform
        store.write_page(2, PageSource::Values(vec![7, 7]));
        assert_eq!(store.page_kind(2), Some(PageKind::Owned));
        assert_eq!(store[9], 7);
        assert_eq!(store[10], 0);
    }

    #[test]
    fn test_wide_uniform_falls_back_to_heap() {
        let mut store = Small::<Wide>::new();
        store.write_page(0, PageSource::Uniform(Wide([1, 2, 3, 4])));
        assert_eq!(store.page_kind(0), Some(PageKind::SharedUniform));
        assert_eq!(store[3], Wide([1, 2, 3, 4]));

        let share = store.share(0).unwrap();
        assert!(matches!(share, PageShare::Heap(_)));
        assert_eq!(share.strong_count(), 2);
        assert_eq!(share.get(2), &Wide([1, 2, 3, 4]));
    }

    #[test]
    fn test_write_into_uniform_copies_on_write() {
        let mut store = Small::<i64>::new();
        store.write_page(0, PageSource::Uniform(9));
        store.set(2, 9);
        assert_eq!(store.page_kind(0), Some(PageKind::Uniform));

        store.set(2, 1);
        assert_eq!(store.page_kind(0), Some(PageKind::Owned));
        assert_eq!(store.iter().copied().collect::<Vec<_>>(), vec![9, 9, 1, 9]);
    }

    #[test]
    fn test_share_and_adopt() {
        let mut a = Small::<i64>::new();
        a.write_page(0, PageSource::Values(vec![1, 2, 3, 4]));
        let share = a.share(0).unwrap();
        assert_eq!(a.page_kind(0), Some(PageKind::Shared));
        assert_eq!(share.strong_count(), 2);

        let mut b = Small::<i64>::new();
        b.adopt_shared(1, share.clone()).unwrap();
        assert_eq!(b.len(), 8);
        assert_eq!(b[5], 2);
        assert_eq!(share.strong_count(), 3);

        // Writing through one owner must not affect the others
        b.set(5, 20);
        assert_eq!(b[5], 20);
        assert_eq!(a[1], 2);
        assert_eq!(share.strong_count(), 2);
    }

    #[test]
    fn test_share_disabled() {
        let mut store = PagedValues::<i64, 2, true, false>::new();
        store.push(1);
        assert_eq!(store.share(0).unwrap_err(), Error::SharingDisabled);
    }

    #[test]
    fn test_share_out_of_range() {
        let mut store = Small::<i64>::new();
        assert_eq!(
            store.share(3).unwrap_err(),
            Error::PageOutOfRange { page: 3, pages: 0 }
        );
    }

    #[test]
    fn test_shared_page_freed_exactly_once() {
        let drops = Arc::new(AtomicUsize::new(0));
        let mut store = Small::<Tracked>::new();
        store.write_page(0, PageSource::Values(tracked_page(&drops, 4)));
        assert_eq!(drops.load(Ordering::SeqCst), 0);

        let shares: Vec<_> = (0..3).map(|_| store.share(0).unwrap()).collect();
        assert_eq!(drops.load(Ordering::SeqCst), 0);

        drop(store);
        assert_eq!(drops.load(Ordering::SeqCst), 0);

        let mut shares = shares.into_iter();
        drop(shares.next());
        drop(shares.next());
        assert_eq!(drops.load(Ordering::SeqCst), 0);

        drop(shares.next());
        assert_eq!(drops.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_shared_page_freed_across_threads() {
        let drops = Arc::new(AtomicUsize::new(0));
        let mut store = Small::<Tracked>::new();
        store.write_page(0, PageSource::Values(tracked_page(&drops, 4)));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let share = store.share(0).unwrap();
                std::thread::spawn(move || drop(share))
            })
            .collect();
        drop(store);
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(drops.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_owned_page_freed_on_drop() {
        let drops = Arc::new(AtomicUsize::new(0));
        let mut store = Small::<Tracked>::new();
        store.write_page(0, PageSource::Values(tracked_page(&drops, 4)));
        drop(store);
        assert_eq!(drops.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_resize_shrink_resets_tail() {
        let mut store = Small::<i64>::new();
        store.write_page(0, PageSource::Values(vec![1, 2, 3, 4]));
        store.write_page(1, PageSource::Values(vec![5, 6, 7, 8]));

        store.resize(2);
        assert_eq!(store.len(), 2);
        assert_eq!(store.page_count(), 1);

        store.resize(8);
        assert_eq!(store.iter().copied().collect::<Vec<_>>(), vec![1, 2, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_string_uniform_detection() {
        let s: Arc<str> = Arc::from("x");
        assert!(Some(s.clone()).same_as(&Some(Arc::from("x"))));
        assert!(!Some(s).same_as(&None));
        assert!(f64::NAN.same_as(&f64::NAN));
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_index_out_of_range_panics() {
        let store = Small::<i64>::with_len(2);
        let _ = store[2];
    }
}
