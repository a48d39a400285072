//! Property-Based Tests for the Cache Layer
//!
//! # Test Properties
//!
//! 1. **Priority Ordering**: the eviction comparison is asymmetric and
//!    monotonic in rebuild cost and recency
//! 2. **Uniform Equivalence**: uniform pages read exactly like repeated values
//! 3. **Model Agreement**: any write sequence reads back like a plain `Vec`
//! 4. **Budget Bound**: admissions keep a table within budget unless the
//!    newest item alone exceeds it
//! 5. **Victim Choice**: no survivor has strictly lower priority than a victim

#![cfg(test)]

use proptest::prelude::*;

use super::eviction::EvictionEngine;
use super::id::Id;
use super::paged::{PageSource, PagedValues};
use super::priority::CacheItemPriority;

type Small = PagedValues<i64, 2>;
type SmallPlain = PagedValues<i64, 2, false, false>;

// =============================================================================
// Property Strategies
// =============================================================================

/// Costs that are exact in `f32`, so cross products never round
fn cost_strategy() -> impl Strategy<Value = f32> {
    (0u32..=64).prop_map(|quarters| quarters as f32 / 4.0)
}

/// Priority with a timestamp strictly before `now`
fn priority_strategy(now: u64) -> impl Strategy<Value = CacheItemPriority> {
    (1u64..=4096, 0..now, cost_strategy())
        .prop_map(|(memory, accessed, cost)| CacheItemPriority::new(memory, accessed, cost))
}

#[derive(Debug, Clone)]
enum Write {
    Set(usize, i64),
    Uniform(usize, i64),
    Values(usize, Vec<i64>),
}

fn write_strategy(len: usize) -> impl Strategy<Value = Write> {
    let pages = len.div_ceil(Small::PAGE_SIZE);
    prop_oneof![
        (0..len, -3i64..3).prop_map(|(i, v)| Write::Set(i, v)),
        (0..pages, -3i64..3).prop_map(|(p, v)| Write::Uniform(p, v)),
        (0..pages, prop::collection::vec(-3i64..3, 0..=Small::PAGE_SIZE))
            .prop_map(|(p, values)| Write::Values(p, values)),
    ]
}

fn apply_to_model(model: &mut Vec<i64>, write: &Write) {
    let page_size = Small::PAGE_SIZE;
    match write {
        Write::Set(index, value) => {
            if *index >= model.len() {
                model.resize(index + 1, 0);
            }
            model[*index] = *value;
        }
        Write::Uniform(page, value) => {
            let end = (page + 1) * page_size;
            if model.len() < end {
                model.resize(end, 0);
            }
            model[page * page_size..end].fill(*value);
        }
        Write::Values(page, values) => {
            let end = (page + 1) * page_size;
            if model.len() < end {
                model.resize(end, 0);
            }
            for offset in 0..page_size {
                model[page * page_size + offset] = values.get(offset).copied().unwrap_or(0);
            }
        }
    }
}

fn apply_to_store<const UNIFORM: bool, const SHARING: bool>(
    store: &mut PagedValues<i64, 2, UNIFORM, SHARING>,
    write: &Write,
) {
    match write {
        Write::Set(index, value) => store.set(*index, *value),
        Write::Uniform(page, value) => store.write_page(*page, PageSource::Uniform(*value)),
        Write::Values(page, values) => store.write_page(*page, PageSource::Values(values.clone())),
    }
}

// =============================================================================
// Priority Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Property: two items are never each lower priority than the other.
    #[test]
    fn prop_priority_is_asymmetric(a in priority_strategy(10_000), b in priority_strategy(10_000)) {
        let now = 10_000;
        prop_assert!(!(a.is_lower_priority_than(&b, now) && b.is_lower_priority_than(&a, now)));
        prop_assert!(!a.is_lower_priority_than(&a, now));
    }

    /// Property: raising rebuild cost never makes an item easier to evict.
    #[test]
    fn prop_priority_monotonic_in_cost(
        a in priority_strategy(10_000),
        b in priority_strategy(10_000),
        extra in cost_strategy(),
    ) {
        let now = 10_000;
        let costlier = CacheItemPriority {
            cycles_to_build_per_byte: a.cycles_to_build_per_byte + extra,
            ..a
        };
        if !a.is_lower_priority_than(&b, now) {
            prop_assert!(!costlier.is_lower_priority_than(&b, now));
        }
    }

    /// Property: a more recent access never makes an item easier to evict.
    #[test]
    fn prop_priority_monotonic_in_recency(
        a in priority_strategy(10_000),
        b in priority_strategy(10_000),
        later in 0u64..10_000,
    ) {
        let now = 10_000;
        let fresher = CacheItemPriority {
            last_accessed_timestamp: a.last_accessed_timestamp.max(later),
            ..a
        };
        if !a.is_lower_priority_than(&b, now) {
            prop_assert!(!fresher.is_lower_priority_than(&b, now));
        }
    }
}

// =============================================================================
// Paged Store Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Property: a uniform page reads like the same value written everywhere.
    #[test]
    fn prop_uniform_equivalence(value in any::<i64>(), pages in 1usize..5) {
        let mut uniform = Small::new();
        let mut repeated = SmallPlain::new();
        for page in 0..pages {
            uniform.write_page(page, PageSource::Uniform(value));
            repeated.write_page(page, PageSource::Values(vec![value; SmallPlain::PAGE_SIZE]));
        }

        prop_assert_eq!(uniform.len(), repeated.len());
        for index in 0..uniform.len() {
            prop_assert_eq!(uniform.get(index), repeated.get(index));
            prop_assert_eq!(uniform[index], value);
        }
        prop_assert!(uniform.memory_used() < repeated.memory_used());
    }

    /// Property: any sequence of writes reads back like a plain vector.
    #[test]
    fn prop_matches_vec_model(writes in prop::collection::vec(write_strategy(16), 1..40)) {
        let mut model = Vec::new();
        let mut store = Small::new();
        let mut plain = SmallPlain::new();
        for write in &writes {
            apply_to_model(&mut model, write);
            apply_to_store(&mut store, write);
            apply_to_store(&mut plain, write);
        }

        prop_assert_eq!(store.len(), model.len());
        prop_assert_eq!(plain.len(), model.len());
        prop_assert_eq!(store.iter().copied().collect::<Vec<_>>(), model.clone());
        prop_assert_eq!(plain.iter().copied().collect::<Vec<_>>(), model);
    }

    /// Property: writes after sharing never leak into the shared copy.
    #[test]
    fn prop_shared_page_is_copy_on_write(
        initial in prop::collection::vec(-3i64..3, Small::PAGE_SIZE),
        writes in prop::collection::vec((0usize..4, -3i64..3), 1..10),
    ) {
        let mut store = Small::new();
        store.write_page(0, PageSource::Values(initial.clone()));
        let share = store.share(0)?;

        let mut other = Small::new();
        other.adopt_shared(0, share.clone())?;

        for (index, value) in writes {
            store.set(index, value);
        }
        for (offset, expected) in initial.iter().enumerate() {
            prop_assert_eq!(share.get(offset), expected);
            prop_assert_eq!(other.get(offset), Some(expected));
        }
    }
}

// =============================================================================
// Eviction Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Property: the live total stays within budget unless the newest item alone exceeds it.
    #[test]
    fn prop_budget_bound(
        budget in 64u64..1024,
        items in prop::collection::vec((1u64..1500, cost_strategy()), 1..60),
    ) {
        let engine = EvictionEngine::new("prop", budget);
        for (i, (memory, cost)) in items.into_iter().enumerate() {
            let now = i as u64 + 1;
            let admission = engine.admit(i as Id, CacheItemPriority::new(memory, now, cost), now);
            prop_assert!(engine.total() <= budget || memory > budget);
            prop_assert_eq!(admission.over_budget, memory > budget);
        }
    }

    /// Property: no surviving item is strictly lower priority than an evicted one.
    #[test]
    fn prop_victims_are_lowest_priority(
        items in prop::collection::vec((1u64..200, cost_strategy(), 0u64..50), 2..40),
    ) {
        let engine = EvictionEngine::new("prop", 500);
        let mut clock = 0u64;
        for (id, (memory, cost, idle)) in items.into_iter().enumerate() {
            clock += idle + 1;
            let before: Vec<(Id, CacheItemPriority)> = (0..id as Id)
                .filter_map(|other| engine.priority_of(other).map(|p| (other, p)))
                .collect();

            let admission = engine.admit(id as Id, CacheItemPriority::new(memory, clock, cost), clock);

            for (victim, victim_priority) in before.iter().filter(|(i, _)| admission.evicted.contains(i)) {
                for (survivor, survivor_priority) in before.iter().filter(|(i, _)| !admission.evicted.contains(i)) {
                    prop_assert!(
                        !survivor_priority.is_lower_priority_than(victim_priority, clock),
                        "survivor {} is lower priority than victim {}", survivor, victim
                    );
                }
            }
        }
    }
}
