//! The segment allocator.
//!
//! [`SegmentAllocator`] owns a [`SegmentTable`] and a [`TranslationCache`]
//! behind one lock. Allocations and foreign mappings are appended at the
//! watermark; releases compact the virtual space. Every element access made
//! through a [`Handle`] resolves its virtual address here.

use core::{fmt, mem, ptr::NonNull};
use std::sync::Arc;

use log::{debug, trace};
use snafu::{OptionExt as _, ResultExt as _, ensure};

use crate::{
    BASE_VADDR,
    cache::{CacheStats, TranslationCache},
    config::{Config, LockMode},
    error::{
        AccessError, AllocateError, InvalidHandleSnafu, MisalignedAddressSnafu, OutOfRangeSnafu,
        OwnershipMismatchSnafu, ReleaseError, TranslateError, TranslateSnafu,
    },
    handle::{Handle, Handles},
    segment::{Segment, SegmentInfo, SegmentTable},
};

/// Mutable allocator state guarded by the allocator lock.
#[derive(Debug, Default)]
pub(crate) struct State<T> {
    table: SegmentTable<T>,
    cache: TranslationCache,
}

impl<T> State<T> {
    fn new(config: Config) -> Self {
        Self {
            table: SegmentTable::new(),
            cache: TranslationCache::new(config.profiling),
        }
    }

    /// Returns the index of the segment containing `vaddr`.
    ///
    /// # Panics
    ///
    /// Panics if `vaddr` is within `BASE_VADDR..total_limit` but no segment
    /// contains it, which means the segment table is corrupted.
    fn resolve(&mut self, vaddr: usize) -> Result<usize, TranslateError> {
        let limit = self.table.total_limit();
        ensure!(
            (BASE_VADDR..limit).contains(&vaddr),
            OutOfRangeSnafu { vaddr, limit }
        );
        let Some(index) = self.cache.lookup(&self.table, vaddr) else {
            panic!("segment table corrupted: no segment contains {vaddr:#x} (limit={limit:#x})");
        };
        Ok(index)
    }

    fn segment(&self, index: usize) -> &Segment<T> {
        self.table
            .get(index)
            .unwrap_or_else(|| panic!("segment index {index} out of bounds"))
    }

    fn translate(&mut self, vaddr: usize) -> Result<NonNull<u8>, TranslateError> {
        let index = self.resolve(vaddr)?;
        Ok(self.segment(index).physical(vaddr))
    }

    /// Resolves `vaddr` to a pointer to the element starting at `vaddr`.
    pub(crate) fn element(&mut self, vaddr: usize) -> Result<NonNull<T>, TranslateError> {
        let index = self.resolve(vaddr)?;
        let segment = self.segment(index);
        ensure!(
            segment.is_element_boundary(vaddr),
            MisalignedAddressSnafu {
                vaddr,
                segment_base: segment.virtual_base(),
                element_size: size_of::<T>(),
            }
        );
        Ok(segment.physical(vaddr).cast())
    }

    /// Removes the segment at `index`, resetting cache slots before the
    /// record leaves the table.
    fn remove(&mut self, index: usize) -> Segment<T> {
        self.cache.invalidate(index);
        let segment = self.table.remove(index);
        debug!(
            "released segment {:#x?}, shifted {} later segments down by {:#x}",
            segment.virtual_range(),
            self.table.len() - index,
            segment.size()
        );
        segment
    }
}

/// Allocator state shared with the handles it issues.
pub(crate) struct Shared<T> {
    config: Config,
    state: spin::Mutex<State<T>>,
}

impl<T> Shared<T> {
    /// Enters the allocator.
    ///
    /// # Panics
    ///
    /// In [`LockMode::Unsynchronized`] mode, panics if another operation is
    /// already in progress.
    #[track_caller]
    pub(crate) fn lock(&self) -> spin::MutexGuard<'_, State<T>> {
        match self.config.lock_mode() {
            LockMode::Serialized => self.state.lock(),
            LockMode::Unsynchronized => self.state.try_lock().unwrap_or_else(|| {
                panic!("unsynchronized segment allocator entered concurrently")
            }),
        }
    }
}

/// A segment-based allocator handing out virtual addresses.
///
/// Storage for elements of type `T` is obtained from the system heap
/// ([`allocate`](Self::allocate)) or wrapped from caller-owned memory
/// ([`mmap`](Self::mmap)). Both are appended to one contiguous virtual address
/// space starting at [`BASE_VADDR`] and addressed through [`Handle`]s.
///
/// Removing a segment ([`deallocate`](Self::deallocate),
/// [`unmap`](Self::unmap)) compacts the virtual space: every later segment
/// moves down by the removed size. Handles into later segments then silently
/// refer to different elements, so all handles of an allocator must be
/// treated as invalidated by any removal.
///
/// # Examples
///
/// ```
/// use sb_allocator::SegmentAllocator;
///
/// let allocator = SegmentAllocator::<u32>::new();
/// allocator.allocate(2)?;
/// let middle = allocator.allocate(4)?;
/// allocator.allocate(3)?;
///
/// for (value, handle) in (0..).zip(allocator.handles()) {
///     handle.write(value)?;
/// }
///
/// allocator.deallocate(&middle)?;
/// assert_eq!(allocator.to_vec()?, [0, 1, 6, 7, 8]);
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct SegmentAllocator<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Default for SegmentAllocator<T>
where
    T: Copy + Default,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for SegmentAllocator<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("SegmentAllocator");
        d.field("config", &self.shared.config);
        match self.shared.state.try_lock() {
            Some(state) => d
                .field("total_limit", &format_args!("{:#x}", state.table.total_limit()))
                .field("segments", &state.table.len()),
            None => d.field("state", &"<locked>"),
        };
        d.finish()
    }
}

impl<T> Clone for SegmentAllocator<T>
where
    T: Copy + Default,
{
    /// Creates a deep copy; see [`try_clone`](Self::try_clone).
    ///
    /// # Panics
    ///
    /// Panics if storage for the copy cannot be allocated.
    fn clone(&self) -> Self {
        self.try_clone()
            .unwrap_or_else(|err| panic!("failed to clone segment allocator: {err}"))
    }
}

impl<T> SegmentAllocator<T>
where
    T: Copy + Default,
{
    /// Creates an empty allocator with the default [`Config`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    /// Creates an empty allocator.
    ///
    /// # Examples
    ///
    /// ```
    /// use sb_allocator::{BASE_VADDR, Config, SegmentAllocator};
    ///
    /// let allocator = SegmentAllocator::<u8>::with_config(Config::unsynchronized());
    /// assert!(allocator.is_empty());
    /// assert_eq!(allocator.total_limit(), BASE_VADDR);
    /// ```
    #[must_use]
    pub fn with_config(config: Config) -> Self {
        Self::from_state(config, State::new(config))
    }

    fn from_state(config: Config, state: State<T>) -> Self {
        const { assert!(size_of::<T>() > 0, "zero-sized elements are not supported") };
        Self {
            shared: Arc::new(Shared {
                config,
                state: spin::Mutex::new(state),
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> Config {
        self.shared.config
    }

    /// Allocates storage for `count` elements from the system heap.
    ///
    /// The new segment is appended at the watermark and every element is
    /// initialized with `T::default()`. Returns a handle at the segment's
    /// virtual base.
    ///
    /// # Panics
    ///
    /// Panics if the virtual address space is exhausted.
    pub fn allocate(&self, count: usize) -> Result<Handle<T>, AllocateError> {
        let segment = Segment::allocate(count)?;
        let vaddr = self.shared.lock().table.push(segment);
        trace!(
            "allocated {count} elements at {vaddr:#x}..{:#x}",
            vaddr + count * size_of::<T>()
        );
        Ok(self.handle_at(vaddr))
    }

    /// Maps `count` caller-owned elements starting at `foreign` into the
    /// virtual address space.
    ///
    /// The allocator never frees mapped memory; [`unmap`](Self::unmap) removes
    /// the mapping and leaves the memory untouched.
    ///
    /// # Panics
    ///
    /// Panics if `count` elements of `T` exceed the maximum allocation size or
    /// if the virtual address space is exhausted.
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    ///
    /// - `foreign..foreign + count` is valid for reads and writes of `T` and
    ///   properly aligned
    /// - the memory stays valid, and is not accessed other than through this
    ///   allocator, until the mapping is removed or the allocator is dropped
    pub unsafe fn mmap(&self, foreign: NonNull<T>, count: usize) -> Handle<T> {
        let segment = unsafe { Segment::foreign(foreign, count) };
        let vaddr = self.shared.lock().table.push(segment);
        trace!(
            "mapped {count} foreign elements from {foreign:p} at {vaddr:#x}..{:#x}",
            vaddr + count * size_of::<T>()
        );
        self.handle_at(vaddr)
    }

    /// Removes the segment starting at `handle` and releases its storage if
    /// the allocator owns it.
    ///
    /// Later segments are shifted down to keep the virtual space contiguous.
    /// Fails with [`ReleaseError::InvalidHandle`] unless `handle` is exactly
    /// the virtual base of a live segment.
    pub fn deallocate(&self, handle: &Handle<T>) -> Result<(), ReleaseError> {
        let vaddr = handle.vaddr();
        let mut state = self.shared.lock();
        let index = state
            .table
            .position_of_base(vaddr)
            .context(InvalidHandleSnafu { vaddr })?;
        let segment = state.remove(index);
        drop(state);
        drop(segment);
        Ok(())
    }

    /// Removes the foreign mapping starting at `handle` without freeing
    /// anything.
    ///
    /// Fails with [`ReleaseError::InvalidHandle`] unless `handle` is exactly
    /// the virtual base of a live segment, and with
    /// [`ReleaseError::OwnershipMismatch`] if that segment is owned by the
    /// allocator.
    pub fn unmap(&self, handle: &Handle<T>) -> Result<(), ReleaseError> {
        let vaddr = handle.vaddr();
        let mut state = self.shared.lock();
        let index = state
            .table
            .position_of_base(vaddr)
            .context(InvalidHandleSnafu { vaddr })?;
        ensure!(
            state.segment(index).ownership().is_foreign(),
            OwnershipMismatchSnafu { vaddr }
        );
        let _segment = state.remove(index);
        Ok(())
    }

    /// Resolves `vaddr` to the physical byte it is mapped to.
    ///
    /// The returned pointer is valid until the next removal from this
    /// allocator.
    ///
    /// # Panics
    ///
    /// Panics if the segment table is corrupted.
    pub fn translate(&self, vaddr: usize) -> Result<NonNull<u8>, TranslateError> {
        self.shared.lock().translate(vaddr)
    }

    /// Returns a handle at [`BASE_VADDR`], the first element.
    #[must_use]
    pub fn begin(&self) -> Handle<T> {
        self.handle_at(BASE_VADDR)
    }

    /// Returns a handle at the watermark, one past the last element.
    #[must_use]
    pub fn end(&self) -> Handle<T> {
        self.handle_at(self.total_limit())
    }

    /// Returns an iterator over handles to every live element in virtual
    /// address order.
    #[must_use]
    pub fn handles(&self) -> Handles<T> {
        Handles::new(self.begin(), self.end())
    }

    /// Reads every live element in virtual address order.
    pub fn to_vec(&self) -> Result<Vec<T>, AccessError> {
        let mut state = self.shared.lock();
        let limit = state.table.total_limit();
        (BASE_VADDR..limit)
            .step_by(size_of::<T>())
            .map(|vaddr| {
                let ptr = state.element(vaddr).context(TranslateSnafu)?;
                Ok(unsafe { ptr.read() })
            })
            .collect()
    }

    /// Next virtual address to be handed out.
    #[must_use]
    pub fn total_limit(&self) -> usize {
        self.shared.lock().table.total_limit()
    }

    /// Number of live elements.
    #[must_use]
    pub fn len(&self) -> usize {
        (self.total_limit() - BASE_VADDR) / size_of::<T>()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.total_limit() == BASE_VADDR
    }

    #[must_use]
    pub fn segment_count(&self) -> usize {
        self.shared.lock().table.len()
    }

    /// Returns a snapshot of the segment table in table order.
    #[must_use]
    pub fn segments(&self) -> Vec<SegmentInfo> {
        self.shared.lock().table.iter().map(Segment::info).collect()
    }

    /// Returns the translation cache counters, or `None` if profiling is
    /// disabled.
    #[must_use]
    pub fn cache_stats(&self) -> Option<CacheStats> {
        self.shared.lock().cache.stats()
    }

    /// Creates a deep copy of this allocator.
    ///
    /// Every segment, owned or foreign, is copied into freshly owned storage
    /// at the same virtual range, so both allocators yield equal elements at
    /// equal virtual addresses. The copy starts with an empty translation
    /// cache. The source is locked for the duration of the copy.
    pub fn try_clone(&self) -> Result<Self, AllocateError> {
        let source = self.shared.lock();
        let mut table = SegmentTable::new();
        for segment in source.table.iter() {
            table.push(Segment::allocate_copy(segment)?);
        }
        assert_eq!(table.total_limit(), source.table.total_limit());
        debug!(
            "cloned {} segments up to {:#x}",
            table.len(),
            table.total_limit()
        );
        drop(source);

        let config = self.shared.config;
        Ok(Self::from_state(
            config,
            State {
                table,
                cache: TranslationCache::new(config.profiling),
            },
        ))
    }

    /// Moves the contents of this allocator into a new allocator.
    ///
    /// The segment table, translation cache and watermark are transferred;
    /// `self` is left empty. Handles issued by `self` stay attached to `self`.
    #[must_use]
    pub fn take(&mut self) -> Self {
        let config = self.shared.config;
        let state = mem::replace(&mut *self.shared.lock(), State::new(config));
        debug!(
            "moved {} segments up to {:#x}",
            state.table.len(),
            state.table.total_limit()
        );
        Self::from_state(config, state)
    }

    fn handle_at(&self, vaddr: usize) -> Handle<T> {
        Handle::new(Arc::downgrade(&self.shared), vaddr)
    }

    #[cfg(test)]
    pub(crate) fn assert_partition(&self) {
        self.shared.lock().table.assert_partition();
    }
}
