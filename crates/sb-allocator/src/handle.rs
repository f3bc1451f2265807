//! Handles: cursors over the virtual address space of an allocator.
//!
//! A [`Handle`] is a virtual address paired with a weak reference to the
//! allocator that issued it. It never owns memory and never caches a physical
//! pointer; every access resolves the address through the allocator, so a
//! handle keeps working while the allocator adds segments. Removing a segment
//! shifts later segments down, after which handles into them silently refer to
//! different elements.
//!
//! Arithmetic works in units of elements, like pointer arithmetic:
//!
//! ```
//! use sb_allocator::SegmentAllocator;
//!
//! let allocator = SegmentAllocator::<u16>::new();
//! let mut cursor = allocator.allocate(4)?;
//! cursor.write(1)?;
//! cursor.next(1).write(2)?;
//! (cursor.clone() + 2).write(4)?;
//! assert_eq!(cursor.read_at(2)?, 4);
//! assert_eq!(allocator.to_vec()?, [1, 2, 0, 4]);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use core::{
    cmp::Ordering,
    fmt,
    hash::{Hash, Hasher},
    iter::FusedIterator,
    ops::{Add, AddAssign, Sub, SubAssign},
    ptr::NonNull,
};
use std::sync::Weak;

use snafu::{OptionExt as _, ResultExt as _};

use crate::{
    allocator::Shared,
    error::{AccessError, DetachedSnafu, TranslateSnafu},
};

/// A virtual address issued by a [`SegmentAllocator`](crate::SegmentAllocator).
///
/// Equality and ordering compare virtual addresses only, regardless of the
/// allocator that issued either handle; use
/// [`same_allocator`](Self::same_allocator) to tell handles of different
/// allocators apart.
pub struct Handle<T> {
    vaddr: usize,
    allocator: Weak<Shared<T>>,
}

impl<T> Handle<T> {
    pub(crate) fn new(allocator: Weak<Shared<T>>, vaddr: usize) -> Self {
        Self { vaddr, allocator }
    }

    /// Creates a handle at `vaddr` that is not attached to any allocator.
    ///
    /// Every access through a detached handle fails with
    /// [`AccessError::Detached`].
    #[must_use]
    pub fn detached(vaddr: usize) -> Self {
        Self::new(Weak::new(), vaddr)
    }

    /// Returns the virtual address.
    #[must_use]
    pub fn vaddr(&self) -> usize {
        self.vaddr
    }

    /// Returns `true` if the issuing allocator is still alive.
    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.allocator.strong_count() > 0
    }

    /// Returns `true` if both handles were issued by the same allocator.
    #[must_use]
    pub fn same_allocator(&self, other: &Self) -> bool {
        Weak::ptr_eq(&self.allocator, &other.allocator)
    }

    fn offset(&self, n: usize) -> usize {
        self.vaddr.wrapping_add(n.wrapping_mul(size_of::<T>()))
    }

    /// Resolves `vaddr` and runs `f` on the element pointer while the
    /// allocator is locked.
    fn with_element<R>(
        &self,
        vaddr: usize,
        f: impl FnOnce(NonNull<T>) -> R,
    ) -> Result<R, AccessError> {
        let shared = self.allocator.upgrade().context(DetachedSnafu { vaddr })?;
        let mut state = shared.lock();
        let ptr = state.element(vaddr).context(TranslateSnafu)?;
        Ok(f(ptr))
    }

    /// Reads the element at the handle.
    pub fn read(&self) -> Result<T, AccessError>
    where
        T: Copy,
    {
        self.read_at(0)
    }

    /// Reads the element `n` elements past the handle, like `handle[n]`.
    pub fn read_at(&self, n: usize) -> Result<T, AccessError>
    where
        T: Copy,
    {
        self.with_element(self.offset(n), |ptr| unsafe { ptr.read() })
    }

    /// Writes the element at the handle.
    pub fn write(&self, value: T) -> Result<(), AccessError> {
        self.write_at(0, value)
    }

    /// Writes the element `n` elements past the handle.
    pub fn write_at(&self, n: usize, value: T) -> Result<(), AccessError> {
        self.with_element(self.offset(n), |ptr| unsafe { ptr.write(value) })
    }

    /// Replaces the element at the handle, returning the previous value.
    pub fn replace(&self, value: T) -> Result<T, AccessError> {
        self.with_element(self.vaddr, |ptr| unsafe { ptr.replace(value) })
    }

    /// Applies `f` to the element at the handle and stores the result.
    ///
    /// The read, `f` and the write happen under one acquisition of the
    /// allocator lock, so the update is atomic with respect to other threads.
    /// `f` must not call back into the allocator that issued this handle.
    ///
    /// # Panics
    ///
    /// In [`LockMode::Unsynchronized`](crate::LockMode::Unsynchronized) mode,
    /// panics if `f` calls back into the allocator.
    ///
    /// # Deadlocks
    ///
    /// In [`LockMode::Serialized`](crate::LockMode::Serialized) mode, `f`
    /// calling back into the allocator (including through another handle of
    /// it) spins forever on the allocator lock.
    pub fn update<F>(&self, f: F) -> Result<T, AccessError>
    where
        T: Copy,
        F: FnOnce(T) -> T,
    {
        self.with_element(self.vaddr, |ptr| unsafe {
            let value = f(ptr.read());
            ptr.write(value);
            value
        })
    }

    /// Resolves the handle to a pointer to its element.
    ///
    /// The pointer is valid until the next removal from the allocator.
    /// Dereferencing it is only sound while no other access to the element
    /// happens through the allocator.
    pub fn as_ptr(&self) -> Result<NonNull<T>, AccessError> {
        self.with_element(self.vaddr, |ptr| ptr)
    }

    /// Advances by one element and returns the advanced handle (`++h`).
    pub fn increment(&mut self) -> Self {
        *self += 1;
        self.clone()
    }

    /// Advances by one element and returns the handle before advancing
    /// (`h++`).
    pub fn post_increment(&mut self) -> Self {
        let before = self.clone();
        *self += 1;
        before
    }

    /// Retreats by one element and returns the retreated handle (`--h`).
    pub fn decrement(&mut self) -> Self {
        *self -= 1;
        self.clone()
    }

    /// Retreats by one element and returns the handle before retreating
    /// (`h--`).
    pub fn post_decrement(&mut self) -> Self {
        let before = self.clone();
        *self -= 1;
        before
    }

    /// Advances by `n` elements and returns the advanced handle.
    pub fn next(&mut self, n: usize) -> Self {
        *self += n;
        self.clone()
    }

    /// Retreats by `n` elements and returns the retreated handle.
    pub fn prev(&mut self, n: usize) -> Self {
        *self -= n;
        self.clone()
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        Self {
            vaddr: self.vaddr,
            allocator: Weak::clone(&self.allocator),
        }
    }
}

impl<T> Default for Handle<T> {
    fn default() -> Self {
        Self::detached(0)
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("vaddr", &format_args!("{:#x}", self.vaddr))
            .field("attached", &self.is_attached())
            .finish()
    }
}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.vaddr == other.vaddr
    }
}

impl<T> Eq for Handle<T> {}

impl<T> PartialOrd for Handle<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Handle<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.vaddr.cmp(&other.vaddr)
    }
}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.vaddr.hash(state);
    }
}

impl<T> From<Handle<T>> for usize {
    fn from(handle: Handle<T>) -> Self {
        handle.vaddr
    }
}

impl<T> From<&Handle<T>> for usize {
    fn from(handle: &Handle<T>) -> Self {
        handle.vaddr
    }
}

impl<T> AddAssign<usize> for Handle<T> {
    fn add_assign(&mut self, n: usize) {
        self.vaddr = self.offset(n);
    }
}

impl<T> SubAssign<usize> for Handle<T> {
    fn sub_assign(&mut self, n: usize) {
        self.vaddr = self.vaddr.wrapping_sub(n.wrapping_mul(size_of::<T>()));
    }
}

impl<T> Add<usize> for Handle<T> {
    type Output = Self;

    fn add(mut self, n: usize) -> Self {
        self += n;
        self
    }
}

impl<T> Add<Handle<T>> for usize {
    type Output = Handle<T>;

    fn add(self, handle: Handle<T>) -> Handle<T> {
        handle + self
    }
}

impl<T> Sub<usize> for Handle<T> {
    type Output = Self;

    fn sub(mut self, n: usize) -> Self {
        self -= n;
        self
    }
}

/// Adds the raw virtual addresses of two handles, keeping the allocator of
/// the left-hand side.
impl<T> Add for Handle<T> {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self::new(self.allocator, self.vaddr.wrapping_add(other.vaddr))
    }
}

/// Subtracts the raw virtual addresses of two handles, keeping the allocator
/// of the left-hand side.
impl<T> Sub for Handle<T> {
    type Output = Self;

    fn sub(self, other: Self) -> Self {
        Self::new(self.allocator, self.vaddr.wrapping_sub(other.vaddr))
    }
}

/// Iterator over the handles of `[begin, end)`, one element apart.
///
/// Created by [`SegmentAllocator::handles`](crate::SegmentAllocator::handles).
#[derive(Debug, Clone)]
pub struct Handles<T> {
    front: Handle<T>,
    back: Handle<T>,
}

impl<T> Handles<T> {
    pub(crate) fn new(begin: Handle<T>, end: Handle<T>) -> Self {
        Self {
            front: begin,
            back: end,
        }
    }

    fn remaining(&self) -> usize {
        self.back.vaddr.saturating_sub(self.front.vaddr) / size_of::<T>()
    }
}

impl<T> Iterator for Handles<T> {
    type Item = Handle<T>;

    fn next(&mut self) -> Option<Self::Item> {
        (self.remaining() > 0).then(|| self.front.post_increment())
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.remaining();
        (remaining, Some(remaining))
    }
}

impl<T> DoubleEndedIterator for Handles<T> {
    fn next_back(&mut self) -> Option<Self::Item> {
        (self.remaining() > 0).then(|| self.back.decrement())
    }
}

impl<T> ExactSizeIterator for Handles<T> {}

impl<T> FusedIterator for Handles<T> {}
