//! Segment records and the ordered segment table.
//!
//! A [`Segment`] maps one contiguous virtual range onto one contiguous
//! physical region. The [`SegmentTable`] keeps the segments in insertion order
//! and maintains the invariant that their virtual ranges exactly partition
//! `BASE_VADDR..total_limit`:
//!
//! ```text
//! BASE_VADDR                                              total_limit
//! │ segment 0     │ segment 1             │ segment 2     │
//! ├───────────────┼───────────────────────┼───────────────┤
//! │ owned         │ foreign               │ owned         │
//! ```
//!
//! Removing a segment shifts every later segment down by the removed size
//! (compaction), so the virtual space never contains gaps.

use core::{alloc::Layout, ops::Range, ptr::NonNull};
use std::alloc;

use snafu::{OptionExt as _, ResultExt as _};

use crate::{
    BASE_VADDR,
    error::{AllocateError, CapacityOverflowSnafu, OutOfMemorySnafu},
};

/// Who is responsible for the physical storage of a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::IsVariant)]
pub(crate) enum Ownership {
    /// Allocated by the allocator with the given layout; freed on drop.
    Owned(Layout),
    /// Supplied by the caller through `mmap`; never freed by the allocator.
    Foreign,
}

/// One contiguous backing region and the virtual range it is mapped at.
#[derive(Debug)]
pub(crate) struct Segment<T> {
    base: NonNull<T>,
    len: usize,
    virtual_base: usize,
    virtual_limit: usize,
    ownership: Ownership,
}

// The table only hands out element pointers while the allocator lock is held.
unsafe impl<T> Send for Segment<T> where T: Send {}

impl<T> Drop for Segment<T> {
    fn drop(&mut self) {
        if let Ownership::Owned(layout) = self.ownership
            && layout.size() > 0
        {
            unsafe { alloc::dealloc(self.base.as_ptr().cast(), layout) }
        }
    }
}

impl<T> Segment<T> {
    /// Allocates uninitialized storage for `count` elements.
    fn allocate_uninit(count: usize) -> Result<Self, AllocateError> {
        let layout = Layout::array::<T>(count).context(CapacityOverflowSnafu { count })?;
        let base = if layout.size() == 0 {
            NonNull::dangling()
        } else {
            let ptr = unsafe { alloc::alloc(layout) };
            NonNull::new(ptr)
                .context(OutOfMemorySnafu {
                    bytes: layout.size(),
                })?
                .cast()
        };
        Ok(Self {
            base,
            len: count,
            virtual_base: 0,
            virtual_limit: 0,
            ownership: Ownership::Owned(layout),
        })
    }

    /// Allocates owned storage for `count` elements, each initialized with
    /// `T::default()`.
    ///
    /// The returned segment has no virtual range until it is pushed onto a
    /// [`SegmentTable`].
    pub(crate) fn allocate(count: usize) -> Result<Self, AllocateError>
    where
        T: Default,
    {
        let segment = Self::allocate_uninit(count)?;
        for i in 0..count {
            unsafe { segment.base.add(i).write(T::default()) }
        }
        Ok(segment)
    }

    /// Allocates owned storage holding a copy of the elements of `source`.
    ///
    /// Both owned and foreign sources are copied into fresh owned storage.
    pub(crate) fn allocate_copy(source: &Self) -> Result<Self, AllocateError>
    where
        T: Copy,
    {
        let segment = Self::allocate_uninit(source.len)?;
        unsafe {
            source
                .base
                .as_ptr()
                .copy_to_nonoverlapping(segment.base.as_ptr(), source.len);
        }
        Ok(segment)
    }

    /// Wraps caller-owned storage of `count` elements.
    ///
    /// # Panics
    ///
    /// Panics if `count` elements of `T` exceed the maximum allocation size.
    ///
    /// # Safety
    ///
    /// The caller must ensure that `base..base + count` is valid for reads and
    /// writes for as long as the segment is part of a table.
    pub(crate) unsafe fn foreign(base: NonNull<T>, count: usize) -> Self {
        assert!(
            Layout::array::<T>(count).is_ok(),
            "foreign region of {count} elements exceeds the maximum allocation size"
        );
        Self {
            base,
            len: count,
            virtual_base: 0,
            virtual_limit: 0,
            ownership: Ownership::Foreign,
        }
    }

    /// Size of the segment in bytes of virtual address space.
    pub(crate) fn size(&self) -> usize {
        self.virtual_limit - self.virtual_base
    }

    pub(crate) fn virtual_base(&self) -> usize {
        self.virtual_base
    }

    pub(crate) fn virtual_range(&self) -> Range<usize> {
        self.virtual_base..self.virtual_limit
    }

    pub(crate) fn ownership(&self) -> Ownership {
        self.ownership
    }

    pub(crate) fn contains(&self, vaddr: usize) -> bool {
        self.virtual_base <= vaddr && vaddr < self.virtual_limit
    }

    /// Returns `true` if `vaddr` is the first byte of an element.
    pub(crate) fn is_element_boundary(&self, vaddr: usize) -> bool {
        (vaddr - self.virtual_base).is_multiple_of(size_of::<T>())
    }

    /// Resolves `vaddr` to the physical byte it is mapped to.
    ///
    /// # Panics
    ///
    /// Panics if `vaddr` is not contained in this segment.
    pub(crate) fn physical(&self, vaddr: usize) -> NonNull<u8> {
        assert!(
            self.contains(vaddr),
            "virtual address {vaddr:#x} is outside of segment {:#x?}",
            self.virtual_range()
        );
        unsafe { self.base.cast::<u8>().add(vaddr - self.virtual_base) }
    }

    pub(crate) fn info(&self) -> SegmentInfo {
        SegmentInfo {
            virtual_range: self.virtual_range(),
            physical_base: self.base.as_ptr().addr(),
            owned: self.ownership.is_owned(),
        }
    }

    fn shift_down(&mut self, size: usize) {
        self.virtual_base -= size;
        self.virtual_limit -= size;
    }
}

/// Snapshot of one segment record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SegmentInfo {
    /// Virtual addresses covered by the segment.
    pub virtual_range: Range<usize>,
    /// Address of the first byte of the backing storage.
    pub physical_base: usize,
    /// `true` if the storage is owned by the allocator, `false` if it was
    /// mapped from caller-supplied memory.
    pub owned: bool,
}

/// Ordered collection of segments partitioning `BASE_VADDR..total_limit`.
#[derive(Debug)]
pub(crate) struct SegmentTable<T> {
    segments: Vec<Segment<T>>,
    total_limit: usize,
}

impl<T> Default for SegmentTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SegmentTable<T> {
    pub(crate) const fn new() -> Self {
        Self {
            segments: Vec::new(),
            total_limit: BASE_VADDR,
        }
    }

    /// Next virtual address to be handed out.
    pub(crate) fn total_limit(&self) -> usize {
        self.total_limit
    }

    pub(crate) fn len(&self) -> usize {
        self.segments.len()
    }

    pub(crate) fn get(&self, index: usize) -> Option<&Segment<T>> {
        self.segments.get(index)
    }

    pub(crate) fn iter(&self) -> core::slice::Iter<'_, Segment<T>> {
        self.segments.iter()
    }

    /// Appends `segment` at the current watermark and returns its virtual
    /// base.
    ///
    /// # Panics
    ///
    /// Panics if the virtual address space is exhausted.
    pub(crate) fn push(&mut self, mut segment: Segment<T>) -> usize {
        let size = segment.len * size_of::<T>();
        let virtual_base = self.total_limit;
        let virtual_limit = virtual_base
            .checked_add(size)
            .unwrap_or_else(|| panic!("virtual address space exhausted"));
        segment.virtual_base = virtual_base;
        segment.virtual_limit = virtual_limit;
        self.segments.push(segment);
        self.total_limit = virtual_limit;
        virtual_base
    }

    /// Returns the index of the segment whose virtual base is exactly `vaddr`.
    ///
    /// Empty segments share their base with the segment pushed after them.
    /// Segments with equal bases are adjacent and only the last of them can be
    /// non-empty, so the last match is returned.
    pub(crate) fn position_of_base(&self, vaddr: usize) -> Option<usize> {
        self.segments.iter().rposition(|s| s.virtual_base == vaddr)
    }

    /// Returns the index of the segment containing `vaddr` by a linear scan.
    pub(crate) fn scan(&self, vaddr: usize) -> Option<usize> {
        self.segments.iter().position(|s| s.contains(vaddr))
    }

    /// Removes the segment at `index` and compacts the virtual space.
    ///
    /// Every later segment is shifted down by the size of the removed one and
    /// the watermark shrinks by the same amount. The removed record is
    /// returned; dropping it releases owned storage.
    pub(crate) fn remove(&mut self, index: usize) -> Segment<T> {
        let size = self.segments[index].size();
        for segment in &mut self.segments[index + 1..] {
            segment.shift_down(size);
        }
        self.total_limit -= size;
        self.segments.remove(index)
    }

    /// Checks that the segments partition `BASE_VADDR..total_limit`.
    ///
    /// # Panics
    ///
    /// Panics if the table is not a gap-free, overlap-free partition.
    #[cfg(test)]
    pub(crate) fn assert_partition(&self) {
        let mut expected_base = BASE_VADDR;
        for segment in &self.segments {
            assert_eq!(
                segment.virtual_base, expected_base,
                "segment table has a gap or overlap at {expected_base:#x}"
            );
            assert_eq!(segment.size(), segment.len * size_of::<T>());
            expected_base = segment.virtual_limit;
        }
        assert_eq!(expected_base, self.total_limit);
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    fn table_with(counts: &[usize]) -> SegmentTable<u32> {
        let mut table = SegmentTable::new();
        for &count in counts {
            table.push(Segment::allocate(count).unwrap());
        }
        table.assert_partition();
        table
    }

    fn ranges(table: &SegmentTable<u32>) -> Vec<Range<usize>> {
        table.iter().map(Segment::virtual_range).collect()
    }

    #[test]
    fn test_push_appends_at_watermark() {
        let mut table = SegmentTable::<u32>::new();
        assert_eq!(table.total_limit(), BASE_VADDR);

        let base = table.push(Segment::allocate(2).unwrap());
        assert_eq!(base, BASE_VADDR);
        let base = table.push(Segment::allocate(3).unwrap());
        assert_eq!(base, BASE_VADDR + 8);
        assert_eq!(table.total_limit(), BASE_VADDR + 20);
        assert_eq!(table.len(), 2);
        table.assert_partition();
    }

    #[test]
    fn test_remove_middle_compacts_later_segments() {
        let mut table = table_with(&[2, 4, 3]);
        let removed = table.remove(1);
        assert_eq!(removed.virtual_range(), BASE_VADDR + 8..BASE_VADDR + 24);
        assert_eq!(
            ranges(&table),
            [BASE_VADDR..BASE_VADDR + 8, BASE_VADDR + 8..BASE_VADDR + 20]
        );
        assert_eq!(table.total_limit(), BASE_VADDR + 20);
        table.assert_partition();
    }

    #[test]
    fn test_remove_last_only_shrinks_limit() {
        let mut table = table_with(&[2, 4, 3]);
        let before = ranges(&table);
        table.remove(2);
        assert_eq!(ranges(&table), before[..2]);
        assert_eq!(table.total_limit(), BASE_VADDR + 24);
        table.assert_partition();
    }

    #[test]
    fn test_remove_first() {
        let mut table = table_with(&[1, 1]);
        table.remove(0);
        assert_eq!(ranges(&table), [BASE_VADDR..BASE_VADDR + 4]);
        table.remove(0);
        assert_eq!(table.len(), 0);
        assert_eq!(table.total_limit(), BASE_VADDR);
    }

    #[test]
    fn test_lookup() {
        let table = table_with(&[2, 4]);
        assert_eq!(table.position_of_base(BASE_VADDR), Some(0));
        assert_eq!(table.position_of_base(BASE_VADDR + 8), Some(1));
        assert_eq!(table.position_of_base(BASE_VADDR + 4), None);

        assert_eq!(table.scan(BASE_VADDR + 7), Some(0));
        assert_eq!(table.scan(BASE_VADDR + 8), Some(1));
        assert_eq!(table.scan(BASE_VADDR + 23), Some(1));
        assert_eq!(table.scan(BASE_VADDR + 24), None);
    }

    #[test]
    fn test_lookup_prefers_non_empty_segment_at_shared_base() {
        let table = table_with(&[0, 0, 3, 0]);
        assert_eq!(table.position_of_base(BASE_VADDR), Some(2));
        assert_eq!(table.position_of_base(BASE_VADDR + 12), Some(3));
        assert_eq!(table.scan(BASE_VADDR), Some(2));
    }

    #[test]
    fn test_allocate_initializes_with_default() {
        let segment = Segment::<u32>::allocate(4).unwrap();
        for i in 0..4 {
            assert_eq!(unsafe { segment.base.add(i).read() }, 0);
        }
    }

    #[test]
    fn test_allocate_copy_is_owned() {
        let mut buffer = [1_u32, 2, 3];
        let foreign = unsafe { Segment::<u32>::foreign(NonNull::from(&mut buffer).cast(), 3) };
        let copy = Segment::allocate_copy(&foreign).unwrap();
        assert!(copy.ownership().is_owned());
        assert_ne!(copy.base, foreign.base);
        for (i, expected) in [1, 2, 3].into_iter().enumerate() {
            assert_eq!(unsafe { copy.base.add(i).read() }, expected);
        }
    }

    #[test]
    fn test_capacity_overflow() {
        let err = Segment::<u32>::allocate(usize::MAX).unwrap_err();
        assert!(matches!(err, AllocateError::CapacityOverflow { count, .. } if count == usize::MAX));
    }

    #[test]
    fn test_physical_and_element_boundary() {
        let mut table = SegmentTable::<u32>::new();
        table.push(Segment::allocate(1).unwrap());
        table.push(Segment::allocate(2).unwrap());
        let segment = table.get(1).unwrap();
        assert!(segment.is_element_boundary(BASE_VADDR + 8));
        assert!(!segment.is_element_boundary(BASE_VADDR + 9));
        assert_eq!(
            segment.physical(BASE_VADDR + 8).addr().get(),
            segment.info().physical_base + 4
        );
    }

    #[test]
    #[should_panic = "outside of segment"]
    fn test_physical_outside_panics() {
        let mut table = SegmentTable::<u32>::new();
        table.push(Segment::allocate(1).unwrap());
        let _ = table.get(0).unwrap().physical(BASE_VADDR + 4);
    }
}
