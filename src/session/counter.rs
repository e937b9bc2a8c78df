//! Shared reference counter.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::SessionError;
use crate::Result;

/// A lease counter shared by every copy of a session context.
///
/// Cloning a `Counter` does not copy the count: both handles refer to the
/// same logical value. This is how a joined context and the context it was
/// joined from agree on how many holders a session has.
#[derive(Clone, Default)]
pub struct Counter {
    inner: Arc<AtomicU64>,
}

impl Counter {
    /// Create a counter starting at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment and return the new value.
    pub fn increment(&self) -> u64 {
        self.inner.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Decrement and return the new value.
    ///
    /// Fails with [`SessionError::CounterUnderflow`] instead of wrapping when
    /// the count is already zero.
    pub fn decrement(&self) -> Result<u64> {
        self.inner
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .map(|prev| prev - 1)
            .map_err(|_| SessionError::CounterUnderflow)
    }

    /// Current value.
    pub fn get(&self) -> u64 {
        self.inner.load(Ordering::Acquire)
    }

    /// Whether two handles refer to the same logical count.
    pub fn shares_with(&self, other: &Counter) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Counter").field(&self.get()).finish()
    }
}
