//! Construction-time configuration of a segment allocator.

/// Options selected when a [`SegmentAllocator`](crate::SegmentAllocator) is
/// created.
///
/// The configuration is fixed for the lifetime of an allocator instance; the
/// locking discipline and the instrumentation are never switched at runtime.
///
/// # Examples
///
/// ```
/// use sb_allocator::{Config, LockMode};
///
/// let config = Config::new().with_profiling(true);
/// assert!(config.thread_safe);
/// assert_eq!(config.lock_mode(), LockMode::Serialized);
///
/// let config = Config::unsynchronized();
/// assert!(config.lock_mode().is_unsynchronized());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Config {
    /// Serializes every operation under one lock.
    pub thread_safe: bool,
    /// Counts translation cache hits and misses.
    pub profiling: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    /// Creates the default configuration: serialized, without profiling.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            thread_safe: true,
            profiling: false,
        }
    }

    /// Creates a configuration without locking, for single-threaded use.
    #[must_use]
    pub const fn unsynchronized() -> Self {
        Self {
            thread_safe: false,
            profiling: false,
        }
    }

    #[must_use]
    pub const fn with_thread_safe(self, thread_safe: bool) -> Self {
        Self {
            thread_safe,
            ..self
        }
    }

    #[must_use]
    pub const fn with_profiling(self, profiling: bool) -> Self {
        Self { profiling, ..self }
    }

    /// Returns the locking discipline selected by this configuration.
    #[must_use]
    pub const fn lock_mode(&self) -> LockMode {
        if self.thread_safe {
            LockMode::Serialized
        } else {
            LockMode::Unsynchronized
        }
    }
}

/// Locking discipline of an allocator instance.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display, derive_more::IsVariant,
)]
pub enum LockMode {
    /// Every operation waits for the allocator lock.
    #[display("serialized")]
    Serialized,
    /// Operations never wait; entering the allocator while another operation
    /// is in progress is a usage error and panics.
    #[display("unsynchronized")]
    Unsynchronized,
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_serialized_without_profiling() {
        let config = Config::default();
        assert_eq!(config, Config::new());
        assert!(config.thread_safe);
        assert!(!config.profiling);
        assert!(config.lock_mode().is_serialized());
    }

    #[test]
    fn test_builders() {
        let config = Config::unsynchronized().with_profiling(true);
        assert!(!config.thread_safe);
        assert!(config.profiling);
        assert_eq!(config.lock_mode(), LockMode::Unsynchronized);

        let config = config.with_thread_safe(true);
        assert_eq!(config.lock_mode(), LockMode::Serialized);
        assert_eq!(config.lock_mode().to_string(), "serialized");
    }
}
