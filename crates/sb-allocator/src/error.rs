//! Errors reported by allocator and handle operations.

use core::alloc::LayoutError;

use snafu::{Location, Snafu};

/// Failure to obtain backing storage for a new segment.
///
/// The allocator state is left untouched when this error is returned.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum AllocateError {
    #[snafu(display("out of memory: failed to allocate {bytes} bytes"))]
    OutOfMemory {
        bytes: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("allocation of {count} elements exceeds the maximum allocation size"))]
    CapacityOverflow {
        count: usize,
        #[snafu(source)]
        source: LayoutError,
        #[snafu(implicit)]
        location: Location,
    },
}

/// Failure to remove a segment with `deallocate` or `unmap`.
///
/// No segment is removed when this error is returned.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum ReleaseError {
    #[snafu(display("invalid handle: no segment starts at virtual address {vaddr:#x}"))]
    InvalidHandle {
        vaddr: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display(
        "segment at virtual address {vaddr:#x} is owned by the allocator and cannot be unmapped"
    ))]
    OwnershipMismatch {
        vaddr: usize,
        #[snafu(implicit)]
        location: Location,
    },
}

/// Failure to resolve a virtual address to physical storage.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum TranslateError {
    #[snafu(display("virtual address {vaddr:#x} is out of range (limit={limit:#x})"))]
    OutOfRange {
        vaddr: usize,
        limit: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display(
        "virtual address {vaddr:#x} is not on an element boundary \
         (segment_base={segment_base:#x}, element_size={element_size})"
    ))]
    MisalignedAddress {
        vaddr: usize,
        segment_base: usize,
        element_size: usize,
        #[snafu(implicit)]
        location: Location,
    },
}

/// Failure to access the element a [`Handle`](crate::Handle) points at.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum AccessError {
    #[snafu(display("handle at virtual address {vaddr:#x} is not attached to a live allocator"))]
    Detached {
        vaddr: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("failed to translate handle address: {source}"))]
    Translate {
        #[snafu(source)]
        source: TranslateError,
        #[snafu(implicit)]
        location: Location,
    },
}

impl AccessError {
    /// Returns the translation failure behind this error, if any.
    #[must_use]
    pub fn translate_error(&self) -> Option<&TranslateError> {
        match self {
            Self::Translate { source, .. } => Some(source),
            Self::Detached { .. } => None,
        }
    }
}
