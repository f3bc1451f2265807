//! A segment-based allocator that hands out virtual addresses.
//!
//! Instead of raw pointers, [`SegmentAllocator`] hands out [`Handle`]s: virtual
//! addresses in one contiguous, allocator-local address space. Every access
//! through a handle is translated back to physical storage, which lets client
//! code walk memory made of many separately allocated (or caller-owned)
//! regions as if it were one flat array.
//!
//! # Components
//!
//! - **Segment table**: an ordered list of segments, each mapping one virtual
//!   range onto one physical region. The ranges always partition
//!   `BASE_VADDR..total_limit` without gaps or overlaps.
//! - **Translation cache**: a two-slot cache of the most recently used
//!   segments in front of the linear table scan. See [`CacheStats`].
//! - **Allocator**: [`SegmentAllocator`] appends segments for
//!   [`allocate`](SegmentAllocator::allocate) and
//!   [`mmap`](SegmentAllocator::mmap), and removes them with
//!   [`deallocate`](SegmentAllocator::deallocate) and
//!   [`unmap`](SegmentAllocator::unmap).
//! - **Handle**: [`Handle`] is a cursor with pointer-like arithmetic and
//!   element access; it holds only a virtual address and a weak reference to
//!   its allocator.
//!
//! # Compaction
//!
//! Removing a segment shifts every later segment down by the removed size, so
//! the virtual space stays contiguous and iteration from
//! [`begin`](SegmentAllocator::begin) to [`end`](SegmentAllocator::end) visits
//! exactly the live elements:
//!
//! ```text
//! before:  │ A: 0 1 │ B: 2 3 4 5 │ C: 6 7 8 │
//! remove B
//! after:   │ A: 0 1 │ C: 6 7 8 │
//! ```
//!
//! Handles are not updated by compaction. A handle that pointed into `C`
//! before the removal now resolves to a different element (or past the end),
//! so every handle must be treated as invalidated by any removal.
//!
//! # Usage Examples
//!
//! ```rust
//! use sb_allocator::{BASE_VADDR, Config, SegmentAllocator};
//!
//! let allocator = SegmentAllocator::<u8>::with_config(Config::new().with_profiling(true));
//! allocator.allocate(1)?;
//! allocator.allocate(3)?;
//! allocator.allocate(5)?;
//! assert_eq!(allocator.total_limit(), BASE_VADDR + 9);
//!
//! for (handle, c) in allocator.handles().zip(b'a'..) {
//!     handle.write(c)?;
//! }
//! // Forward iteration only scans the table when entering the first and the
//! // last segment.
//! let stats = allocator.cache_stats().unwrap();
//! assert_eq!(stats.misses, 2);
//!
//! assert_eq!(allocator.to_vec()?, b"abcdefghi");
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! Caller-owned memory can be mapped into the same address space:
//!
//! ```rust
//! use core::ptr::NonNull;
//!
//! use sb_allocator::SegmentAllocator;
//!
//! let allocator = SegmentAllocator::<u32>::new();
//! allocator.allocate(2)?;
//! let mut buffer = vec![0_u32; 4];
//! let mapped = unsafe { allocator.mmap(NonNull::new(buffer.as_mut_ptr()).unwrap(), buffer.len()) };
//! allocator.allocate(3)?;
//!
//! for (handle, value) in allocator.handles().zip(0..) {
//!     handle.write(value)?;
//! }
//! allocator.unmap(&mapped)?;
//!
//! assert_eq!(allocator.to_vec()?, [0, 1, 6, 7, 8]);
//! assert_eq!(buffer, [2, 3, 4, 5]);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! # Thread Safety
//!
//! With [`Config::thread_safe`] set (the default), every operation runs under
//! one lock, so an allocator can be shared between threads. Atomicity is per
//! call: a sequence of calls is not atomic as a whole.
//!
//! Without it, the allocator never waits for the lock. It must then only be
//! used from one thread at a time; entering it while another operation is in
//! progress panics.
//!
//! # Errors and Defects
//!
//! Recoverable failures are reported as [`AllocateError`], [`ReleaseError`],
//! [`TranslateError`] and [`AccessError`]. A translation that passes the bounds
//! check but finds no segment means the segment table is corrupted; this is a
//! bug, not an error, and panics.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

mod allocator;
mod cache;
mod config;
mod error;
mod handle;
mod segment;

pub use self::{
    allocator::SegmentAllocator,
    cache::CacheStats,
    config::{Config, LockMode},
    error::{AccessError, AllocateError, ReleaseError, TranslateError},
    handle::{Handle, Handles},
    segment::SegmentInfo,
};

/// First valid virtual address of every allocator.
///
/// Address 0 is never handed out, so a zero address can serve as a sentinel.
pub const BASE_VADDR: usize = 0x100;
