//! Two-slot translation cache in front of the segment table.
//!
//! The cache remembers the segments that resolved the most recent lookups.
//! The `primary` slot is checked first, then the `secondary` slot; a
//! secondary hit swaps the two slots. On a miss the table is scanned linearly
//! and the slots are refilled with the containing segment and the segment
//! right after it, which makes forward iteration across a segment boundary a
//! secondary hit instead of a full scan.
//!
//! The cache never changes the result of a lookup, only its cost.

use crate::segment::SegmentTable;

/// Translation cache counters, collected when profiling is enabled.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheStats {
    /// Lookups resolved by the primary slot.
    pub primary_hits: u64,
    /// Lookups resolved by the secondary slot.
    pub secondary_hits: u64,
    /// Lookups that fell back to scanning the segment table.
    pub misses: u64,
}

impl CacheStats {
    /// Total number of lookups recorded.
    #[must_use]
    pub const fn lookups(&self) -> u64 {
        self.primary_hits + self.secondary_hits + self.misses
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    PrimaryHit,
    SecondaryHit,
    Miss,
}

/// Slots hold indices into the segment table.
#[derive(Debug, Clone, Default)]
pub(crate) struct TranslationCache {
    primary: Option<usize>,
    secondary: Option<usize>,
    stats: Option<CacheStats>,
}

impl TranslationCache {
    pub(crate) fn new(profiling: bool) -> Self {
        Self {
            primary: None,
            secondary: None,
            stats: profiling.then(CacheStats::default),
        }
    }

    pub(crate) fn stats(&self) -> Option<CacheStats> {
        self.stats
    }

    /// Returns the index of the segment containing `vaddr`.
    ///
    /// Returns `None` only if no segment of `table` contains `vaddr`.
    pub(crate) fn lookup<T>(&mut self, table: &SegmentTable<T>, vaddr: usize) -> Option<usize> {
        let hit = |slot: Option<usize>| {
            slot.filter(|&index| table.get(index).is_some_and(|s| s.contains(vaddr)))
        };

        if let Some(index) = hit(self.primary) {
            self.record(Outcome::PrimaryHit);
            return Some(index);
        }

        if let Some(index) = hit(self.secondary) {
            self.secondary = self.primary;
            self.primary = Some(index);
            self.record(Outcome::SecondaryHit);
            return Some(index);
        }

        let index = table.scan(vaddr)?;
        self.primary = Some(index);
        self.secondary = (index + 1 < table.len()).then_some(index + 1);
        self.record(Outcome::Miss);
        Some(index)
    }

    /// Updates the slots after the segment at `removed` left the table.
    ///
    /// Slots referencing the removed segment are reset; slots referencing a
    /// later segment follow it to its new position.
    pub(crate) fn invalidate(&mut self, removed: usize) {
        for slot in [&mut self.primary, &mut self.secondary] {
            *slot = match *slot {
                Some(index) if index == removed => None,
                Some(index) if index > removed => Some(index - 1),
                other => other,
            };
        }
    }

    fn record(&mut self, outcome: Outcome) {
        let Some(stats) = &mut self.stats else {
            return;
        };
        match outcome {
            Outcome::PrimaryHit => stats.primary_hits += 1,
            Outcome::SecondaryHit => stats.secondary_hits += 1,
            Outcome::Miss => stats.misses += 1,
        }
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BASE_VADDR, segment::Segment};

    fn table_with(counts: &[usize]) -> SegmentTable<u8> {
        let mut table = SegmentTable::new();
        for &count in counts {
            table.push(Segment::allocate(count).unwrap());
        }
        table
    }

    #[test]
    fn test_miss_fills_primary_and_following_segment() {
        let table = table_with(&[2, 2, 2]);
        let mut cache = TranslationCache::new(true);

        assert_eq!(cache.lookup(&table, BASE_VADDR + 2), Some(1));
        assert_eq!(cache.primary, Some(1));
        assert_eq!(cache.secondary, Some(2));

        assert_eq!(cache.lookup(&table, BASE_VADDR + 4), Some(2));
        assert_eq!(cache.lookup(&table, BASE_VADDR + 4), Some(2));
        assert_eq!(
            cache.stats(),
            Some(CacheStats {
                primary_hits: 1,
                secondary_hits: 1,
                misses: 1,
            })
        );
    }

    #[test]
    fn test_secondary_hit_swaps_slots() {
        let table = table_with(&[2, 2]);
        let mut cache = TranslationCache::new(false);

        cache.lookup(&table, BASE_VADDR);
        cache.lookup(&table, BASE_VADDR + 3);
        assert_eq!(cache.primary, Some(1));
        assert_eq!(cache.secondary, Some(0));
        assert_eq!(cache.stats(), None);
    }

    #[test]
    fn test_last_segment_has_no_secondary() {
        let table = table_with(&[1, 1]);
        let mut cache = TranslationCache::new(false);
        cache.lookup(&table, BASE_VADDR + 1);
        assert_eq!(cache.primary, Some(1));
        assert_eq!(cache.secondary, None);
    }

    #[test]
    fn test_lookup_outside_table() {
        let table = table_with(&[1]);
        let mut cache = TranslationCache::new(true);
        assert_eq!(cache.lookup(&table, BASE_VADDR + 1), None);
        assert_eq!(cache.stats().unwrap().lookups(), 0);
    }

    #[test]
    fn test_invalidate() {
        let mut cache = TranslationCache {
            primary: Some(1),
            secondary: Some(2),
            stats: None,
        };
        cache.invalidate(1);
        assert_eq!(cache.primary, None);
        assert_eq!(cache.secondary, Some(1));

        let mut cache = TranslationCache {
            primary: Some(0),
            secondary: Some(1),
            stats: None,
        };
        cache.invalidate(3);
        assert_eq!((cache.primary, cache.secondary), (Some(0), Some(1)));
    }

    #[test]
    fn test_cache_agrees_with_scan() {
        let table = table_with(&[3, 1, 4, 1, 5]);
        let mut cache = TranslationCache::new(false);
        let limit = table.total_limit();
        let forward = BASE_VADDR..limit;
        let backward = (BASE_VADDR..limit).rev();
        let strided = (BASE_VADDR..limit).step_by(3);
        for vaddr in forward.chain(backward).chain(strided) {
            assert_eq!(cache.lookup(&table, vaddr), table.scan(vaddr));
        }
    }
}
