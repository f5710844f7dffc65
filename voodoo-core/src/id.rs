//! Identifiers: 64-bit handles naming methods, remote objects and cleanup entries.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Handle for a registered method or remote object. Zero means "absent".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Id(u64);

impl Id {
    /// The invalid identifier.
    pub const NONE: Id = Id(0);

    pub const fn new(value: u64) -> Self {
        Id(value)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    /// True for every identifier an allocator can hand out.
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl From<u64> for Id {
    fn from(value: u64) -> Self {
        Id(value)
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ":{}", self.0)
    }
}

/// Allocation failed because the 64-bit space is used up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("out of id space")]
pub struct IdError;

/// Per-host monotonic counter. Identifiers are never recycled.
#[derive(Debug, Default)]
pub struct IdAllocator {
    last: AtomicU64,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next identifier. Once the counter would wrap it stays saturated and every
    /// further call fails, so zero and previously issued values never come back.
    pub fn allocate(&self) -> Result<Id, IdError> {
        self.last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_add(1))
            .map(|prev| Id(prev + 1))
            .map_err(|_| IdError)
    }

    #[cfg(test)]
    pub(crate) fn starting_after(last: u64) -> Self {
        Self {
            last: AtomicU64::new(last),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_is_strictly_increasing() {
        let ids = IdAllocator::new();
        let mut prev = Id::NONE;
        for _ in 0..1000 {
            let id = ids.allocate().unwrap();
            assert!(id.is_valid());
            assert!(id > prev);
            prev = id;
        }
        assert_eq!(prev.get(), 1000);
    }

    #[test]
    fn exhaustion_is_sticky() {
        let ids = IdAllocator::starting_after(u64::MAX - 1);
        assert_eq!(ids.allocate().unwrap().get(), u64::MAX);
        assert_eq!(ids.allocate(), Err(IdError));
        // Still exhausted; never wraps back to small values.
        assert_eq!(ids.allocate(), Err(IdError));
    }

    #[test]
    fn none_is_invalid() {
        assert!(!Id::NONE.is_valid());
        assert!(!Id::default().is_valid());
        assert!(Id::new(7).is_valid());
        assert_eq!(Id::from(7).to_string(), ":7");
    }
}
